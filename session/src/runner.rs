//! Session task and its handle.
//!
//! [`Session::spawn`] moves the state machine into one tokio task. Everything
//! that mutates session state runs there, one input at a time: commands from
//! [`SessionHandle`]s, transport events, and the machine's own deadlines.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::collaborators::Collaborators;
use crate::error::SessionError;
use crate::events::EventHub;
use crate::machine::SessionStateMachine;
use crate::protocol::{Transport, TransportEvent};
use crate::request::Request;
use crate::transport::ProcessTransport;
use crate::types::{RunEnvironmentResult, SessionConfig, SessionStatus, SettingsEvent};

enum Command {
    Start,
    Stop,
    Restart,
    SetProject(PathBuf),
    SetProfile(Option<String>),
    SetConfiguration(String),
    SetCustomProperties(BTreeMap<String, serde_json::Value>),
    SettingsChanged(SettingsEvent),
    Resolve,
    Build(Vec<String>),
    Clean(Vec<String>),
    Install(Vec<String>),
    Cancel,
    GetRunEnvironment(String),
    Send(Request),
    Shutdown(oneshot::Sender<()>),
}

/// The running session. Dropping it without [`Session::shutdown`] leaves the
/// task running until every [`SessionHandle`] is gone.
pub struct Session {
    handle: SessionHandle,
    task: JoinHandle<()>,
}

impl Session {
    /// Spawn the session task over the real build tool process.
    #[must_use]
    pub fn spawn(config: SessionConfig, collaborators: Collaborators) -> Self {
        let transport = ProcessTransport::new(config.stop_grace);
        Self::spawn_with_transport(config, Box::new(transport), collaborators)
    }

    #[must_use]
    pub fn spawn_with_transport(
        config: SessionConfig,
        transport: Box<dyn Transport>,
        collaborators: Collaborators,
    ) -> Self {
        let hub = EventHub::new();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let machine = SessionStateMachine::new(
            &config,
            transport,
            events_tx,
            collaborators,
            Arc::clone(&hub),
        );
        let status = machine.subscribe_status();
        let task = tokio::spawn(run(machine, commands_rx, events_rx));

        Self {
            handle: SessionHandle {
                commands: commands_tx,
                status,
                hub,
            },
            task,
        }
    }

    #[must_use]
    pub fn handle(&self) -> SessionHandle {
        self.handle.clone()
    }

    /// Stop the build tool, wait until it is gone, and end the task.
    pub async fn shutdown(self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.handle.commands.send(Command::Shutdown(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
        if let Err(e) = self.task.await {
            tracing::warn!("Session task ended abnormally: {e}");
        }
    }
}

/// Cloneable handle for driving a [`Session`] and observing it.
///
/// Commands are queued and applied in order by the session task.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<SessionStatus>,
    hub: Arc<EventHub>,
}

impl SessionHandle {
    #[must_use]
    pub fn hub(&self) -> &Arc<EventHub> {
        &self.hub
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    /// Resolve once the session reaches `target`. Returns `false` if the
    /// session ended first.
    pub async fn wait_for_status(&self, target: SessionStatus) -> bool {
        let mut status = self.status.clone();
        status.wait_for(|s| *s == target).await.is_ok()
    }

    pub fn start(&self) {
        self.send(Command::Start);
    }

    pub fn stop(&self) {
        self.send(Command::Stop);
    }

    pub fn restart(&self) {
        self.send(Command::Restart);
    }

    pub fn set_project(&self, file: impl Into<PathBuf>) {
        self.send(Command::SetProject(file.into()));
    }

    pub fn set_profile(&self, profile: Option<String>) {
        self.send(Command::SetProfile(profile));
    }

    pub fn set_configuration(&self, configuration: impl Into<String>) {
        self.send(Command::SetConfiguration(configuration.into()));
    }

    pub fn set_custom_properties(&self, properties: BTreeMap<String, serde_json::Value>) {
        self.send(Command::SetCustomProperties(properties));
    }

    pub fn settings_changed(&self, event: SettingsEvent) {
        self.send(Command::SettingsChanged(event));
    }

    pub fn resolve(&self) {
        self.send(Command::Resolve);
    }

    pub fn build(&self, products: Vec<String>) {
        self.send(Command::Build(products));
    }

    pub fn clean(&self, products: Vec<String>) {
        self.send(Command::Clean(products));
    }

    pub fn install(&self, products: Vec<String>) {
        self.send(Command::Install(products));
    }

    pub fn cancel(&self) {
        self.send(Command::Cancel);
    }

    pub fn get_run_environment(&self, product: impl Into<String>) {
        self.send(Command::GetRunEnvironment(product.into()));
    }

    pub fn send_request(&self, request: Request) {
        self.send(Command::Send(request));
    }

    /// Request the run environment of `product` and wait for the reply.
    ///
    /// Returns `None` if the request cannot be sent, or if the session stops
    /// or ends before a reply arrives.
    pub async fn ensure_run_environment_updated(
        &self,
        product: impl Into<String>,
    ) -> Option<RunEnvironmentResult> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let on_reply = self.hub.run_environment.subscribe(move |result| {
            let sender = slot.lock().unwrap_or_else(PoisonError::into_inner).take();
            if let Some(sender) = sender {
                let _ = sender.send(result.clone());
            }
        });

        let (failed_tx, failed_rx) = oneshot::channel();
        let failed_slot = Mutex::new(Some(failed_tx));
        let on_error = self.hub.error.subscribe(move |err| {
            if !matches!(err, SessionError::Write(_)) {
                return;
            }
            let sender = failed_slot
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(sender) = sender {
                let _ = sender.send(());
            }
        });

        // Only transitions after this point count; a queued start is fine.
        let mut status = self.status.clone();
        status.mark_unchanged();
        let stopped = async move {
            while status.changed().await.is_ok() {
                if matches!(
                    *status.borrow(),
                    SessionStatus::Stopping | SessionStatus::Stopped
                ) {
                    return;
                }
            }
        };

        self.get_run_environment(product);
        let result = tokio::select! {
            result = rx => result.ok(),
            _ = failed_rx => {
                tracing::debug!("Run environment request could not be sent");
                None
            }
            () = stopped => None,
            () = self.commands.closed() => None,
        };
        on_reply.dispose();
        on_error.dispose();
        result
    }

    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Session task has ended; command dropped");
        }
    }
}

async fn run(
    mut machine: SessionStateMachine,
    mut commands: mpsc::UnboundedReceiver<Command>,
    mut events: mpsc::UnboundedReceiver<TransportEvent>,
) {
    let mut shutdown: Option<oneshot::Sender<()>> = None;

    loop {
        if shutdown.is_some() && machine.status() == SessionStatus::Stopped {
            break;
        }

        let deadline = machine.next_deadline();
        tokio::select! {
            command = commands.recv(), if shutdown.is_none() => {
                let Some(command) = command else {
                    tracing::debug!("All session handles dropped");
                    machine.dispose();
                    machine.stop(Instant::now());
                    break;
                };
                if let Command::Shutdown(done) = command {
                    machine.dispose();
                    machine.stop(Instant::now());
                    shutdown = Some(done);
                } else {
                    apply(&mut machine, command, Instant::now());
                }
            }
            Some(event) = events.recv() => {
                machine.handle_transport_event(event, Instant::now());
            }
            () = sleep_until(deadline) => {
                machine.on_timer(Instant::now());
            }
        }
    }

    if let Some(done) = shutdown {
        let _ = done.send(());
    }
    tracing::debug!("Session task finished");
}

fn apply(machine: &mut SessionStateMachine, command: Command, now: Instant) {
    match command {
        Command::Start => machine.start(now),
        Command::Stop => machine.stop(now),
        Command::Restart => machine.request_restart(now),
        Command::SetProject(file) => machine.set_project(file, now),
        Command::SetProfile(profile) => machine.set_profile(profile, now),
        Command::SetConfiguration(name) => machine.set_configuration(name, now),
        Command::SetCustomProperties(properties) => machine.set_custom_properties(properties, now),
        Command::SettingsChanged(event) => machine.on_settings_changed(event, now),
        Command::Resolve => machine.resolve(),
        Command::Build(products) => machine.build(products),
        Command::Clean(products) => machine.clean(products),
        Command::Install(products) => machine.install(products),
        Command::Cancel => machine.cancel(),
        Command::GetRunEnvironment(product) => machine.get_run_environment(product),
        Command::Send(request) => machine.send_request(&request),
        Command::Shutdown(done) => {
            let _ = done.send(());
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
