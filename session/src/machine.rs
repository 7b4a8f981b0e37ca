//! Session lifecycle: start/stop/restart, auto-resolve debouncing, and the
//! active project and build selection.
//!
//! The machine is synchronous and owns no tasks. The session runner feeds it
//! commands, transport events and timer ticks, always with the current
//! `now`, and sleeps until [`SessionStateMachine::next_deadline`].

use std::collections::BTreeMap;
use std::mem;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use crate::collaborators::{
    Collaborators, ProjectModel, ProjectModelFactory, ProjectStore, SettingsProvider,
};
use crate::dispatcher::ResponseDispatcher;
use crate::error::SessionError;
use crate::events::EventHub;
use crate::protocol::{Protocol, ProtocolEvent, Transport, TransportEvent};
use crate::request::Request;
use crate::types::{ProtocolStatus, Selection, SessionConfig, SessionStatus, SettingsEvent};

/// At most one deadline; re-arming replaces it.
#[derive(Debug, Default, Clone, Copy)]
struct PendingAutoResolve {
    deadline: Option<Instant>,
    requested: bool,
}

struct ActiveProject {
    file: PathBuf,
    model: Box<dyn ProjectModel>,
}

pub struct SessionStateMachine {
    protocol: Protocol,
    dispatcher: ResponseDispatcher,
    hub: Arc<EventHub>,
    settings: Box<dyn SettingsProvider>,
    store: Box<dyn ProjectStore>,
    project_factory: ProjectModelFactory,
    status: SessionStatus,
    status_tx: watch::Sender<SessionStatus>,
    project: Option<ActiveProject>,
    selection: Selection,
    auto_resolve: PendingAutoResolve,
    auto_restart: bool,
    restart_on_crash: bool,
    debounce: Duration,
}

impl SessionStateMachine {
    pub fn new(
        config: &SessionConfig,
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedSender<TransportEvent>,
        collaborators: Collaborators,
        hub: Arc<EventHub>,
    ) -> Self {
        let (status_tx, _) = watch::channel(SessionStatus::Stopped);
        Self {
            protocol: Protocol::new(transport, events, config),
            dispatcher: ResponseDispatcher::new(Arc::clone(&hub)),
            hub,
            settings: collaborators.settings,
            store: collaborators.store,
            project_factory: collaborators.project_factory,
            status: SessionStatus::Stopped,
            status_tx,
            project: None,
            selection: Selection::default(),
            auto_resolve: PendingAutoResolve::default(),
            auto_restart: false,
            restart_on_crash: config.restart_on_crash,
            debounce: config.auto_resolve_debounce,
        }
    }

    #[must_use]
    pub fn status(&self) -> SessionStatus {
        self.status
    }

    #[must_use]
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.status_tx.subscribe()
    }

    #[must_use]
    pub fn active_project(&self) -> Option<&Path> {
        self.project.as_ref().map(|p| p.file.as_path())
    }

    #[must_use]
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    // ── Lifecycle ────────────────────────────────────────────────────────

    pub fn start(&mut self, now: Instant) {
        if self.status != SessionStatus::Stopped {
            tracing::debug!(status = %self.status, "Ignoring start");
            return;
        }
        let executable = self.settings.executable_path().unwrap_or_default();
        let events = self.protocol.start(&executable);
        self.apply(events, now);
    }

    pub fn stop(&mut self, now: Instant) {
        if !matches!(
            self.status,
            SessionStatus::Starting | SessionStatus::Started
        ) {
            tracing::debug!(status = %self.status, "Ignoring stop");
            return;
        }
        let events = self.protocol.stop();
        self.apply(events, now);
    }

    /// Stop if running and start again once stopped.
    pub fn request_restart(&mut self, now: Instant) {
        let configured = self
            .settings
            .executable_path()
            .is_some_and(|path| !path.as_os_str().is_empty());
        if !configured {
            tracing::info!("Build tool executable not configured, stopping session");
            self.stop(now);
            return;
        }

        match self.status {
            SessionStatus::Started | SessionStatus::Starting => {
                self.auto_restart = true;
                self.stop(now);
            }
            SessionStatus::Stopping => self.auto_restart = true,
            SessionStatus::Stopped => self.start(now),
        }
    }

    /// Cancel the pending auto-resolve and any queued restart.
    pub fn dispose(&mut self) {
        self.auto_resolve = PendingAutoResolve::default();
        self.auto_restart = false;
    }

    // ── Inputs from the runner ───────────────────────────────────────────

    pub fn handle_transport_event(&mut self, event: TransportEvent, now: Instant) {
        let events = self.protocol.handle_transport_event(event, now);
        self.apply(events, now);
    }

    /// Earliest instant at which [`SessionStateMachine::on_timer`] has work.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        match (self.protocol.next_deadline(), self.auto_resolve.deadline) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn on_timer(&mut self, now: Instant) {
        let events = self.protocol.on_timer(now);
        self.apply(events, now);

        let Some(deadline) = self.auto_resolve.deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        self.auto_resolve.deadline = None;

        if self.status == SessionStatus::Started
            && self.project.is_some()
            && self.auto_resolve.requested
        {
            tracing::debug!("Auto-resolving project");
            self.resolve();
        } else {
            tracing::debug!(
                status = %self.status,
                has_project = self.project.is_some(),
                "Auto-resolve deferred"
            );
        }
    }

    // ── Selection ────────────────────────────────────────────────────────

    pub fn schedule_auto_resolve(&mut self, delay: Duration, now: Instant) {
        self.auto_resolve = PendingAutoResolve {
            deadline: Some(now + delay),
            requested: true,
        };
    }

    pub fn set_project(&mut self, file: PathBuf, now: Instant) {
        if self.active_project() == Some(file.as_path()) {
            return;
        }
        self.store.save(Some(&file));
        self.activate(file);
        self.schedule_auto_resolve(self.debounce, now);
    }

    pub fn set_profile(&mut self, profile: Option<String>, now: Instant) {
        if self.selection.profile == profile {
            return;
        }
        tracing::info!(profile = ?profile, "Profile changed");
        self.selection.profile = profile;
        self.schedule_auto_resolve(self.debounce, now);
    }

    pub fn set_configuration(&mut self, configuration: String, now: Instant) {
        if self.selection.configuration == configuration {
            return;
        }
        tracing::info!(%configuration, "Configuration changed");
        self.selection.configuration = configuration;
        self.schedule_auto_resolve(self.debounce, now);
    }

    pub fn set_custom_properties(
        &mut self,
        properties: BTreeMap<String, serde_json::Value>,
        now: Instant,
    ) {
        if self.selection.custom_properties == properties {
            return;
        }
        self.selection.custom_properties = properties;
        self.schedule_auto_resolve(self.debounce, now);
    }

    pub fn on_settings_changed(&mut self, event: SettingsEvent, now: Instant) {
        tracing::debug!(?event, "Settings changed");
        match event {
            SettingsEvent::ResolveRequired => {
                if self.project.is_some() {
                    self.schedule_auto_resolve(Duration::ZERO, now);
                }
            }
            SettingsEvent::RestartRequired => self.request_restart(now),
        }
    }

    // ── Operations ───────────────────────────────────────────────────────

    /// Resolve the active project now. Supersedes a pending auto-resolve.
    pub fn resolve(&mut self) {
        let Some(project) = &self.project else {
            tracing::warn!("No active project to resolve");
            return;
        };
        let request = Request::resolve(
            &project.file,
            &self.selection,
            &self.settings.build_settings(),
        );
        self.auto_resolve = PendingAutoResolve::default();
        self.send_request(&request);
    }

    pub fn build(&mut self, products: Vec<String>) {
        let request = Request::build(products, &self.settings.build_settings());
        self.send_request(&request);
    }

    pub fn clean(&mut self, products: Vec<String>) {
        let request = Request::clean(products, &self.settings.build_settings());
        self.send_request(&request);
    }

    pub fn install(&mut self, products: Vec<String>) {
        let request = Request::install(products, &self.settings.build_settings());
        self.send_request(&request);
    }

    pub fn cancel(&mut self) {
        self.send_request(&Request::CancelJob);
    }

    pub fn get_run_environment(&mut self, product: String) {
        self.send_request(&Request::run_environment(product));
    }

    /// Send `request` as is. Failures are published on the error emitter.
    pub fn send_request(&mut self, request: &Request) {
        if let Err(e) = self.protocol.send_request(request) {
            tracing::warn!(kind = request.kind(), "Failed to send request: {e}");
            self.hub.error.emit(&SessionError::Write(e));
        }
    }

    // ── Internals ────────────────────────────────────────────────────────

    fn activate(&mut self, file: PathBuf) {
        tracing::info!(project = %file.display(), "Project activated");
        let model = (self.project_factory)(&file);
        self.hub.project_activated.emit(&file);
        self.project = Some(ActiveProject { file, model });
    }

    fn apply(&mut self, events: Vec<ProtocolEvent>, now: Instant) {
        for event in events {
            match event {
                ProtocolEvent::StatusChanged(status) => self.on_protocol_status(status, now),
                ProtocolEvent::Response(frame) => {
                    let model = self
                        .project
                        .as_mut()
                        .map(|p| p.model.as_mut() as &mut dyn ProjectModel);
                    self.dispatcher.dispatch(&frame, model);
                }
                ProtocolEvent::Failed(err) => self.on_failure(&err),
            }
        }
    }

    fn on_failure(&mut self, err: &SessionError) {
        if matches!(err, SessionError::ProcessCrash(_))
            && self.status == SessionStatus::Started
            && self.restart_on_crash
        {
            tracing::info!("Restarting build tool after crash");
            self.auto_restart = true;
        }
        self.hub.error.emit(err);
    }

    fn on_protocol_status(&mut self, status: ProtocolStatus, now: Instant) {
        let status = SessionStatus::from(status);
        if status == self.status {
            return;
        }
        self.status = status;
        self.status_tx.send_replace(status);
        self.hub.status_changed.emit(&status);

        match status {
            SessionStatus::Started => {
                if self.project.is_none()
                    && let Some(file) = self.store.load()
                {
                    self.activate(file);
                    self.auto_resolve.requested = true;
                }
                if self.auto_resolve.requested {
                    self.auto_resolve.deadline = Some(now);
                }
            }
            SessionStatus::Stopped => {
                if mem::take(&mut self.auto_restart) {
                    self.start(now);
                }
            }
            SessionStatus::Starting | SessionStatus::Stopping => {}
        }
    }
}
