//! Protocol layer: process lifecycle, handshake and request sending.
//!
//! [`Protocol`] is synchronous. It never awaits; it reacts to
//! [`TransportEvent`]s and timer ticks handed to it by the session task and
//! returns the [`ProtocolEvent`]s those produced, in order. Keeping the clock
//! explicit (`now`) makes every transition reproducible in tests.

use std::path::Path;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::error::{SessionError, WriteError};
use crate::request::Request;
use crate::types::{ExitInfo, ProtocolStatus, SessionConfig};

/// Wire discriminator of the handshake packet.
const HELLO: &str = "hello";

/// Identifies one process launch. Events carrying an older id are stale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LaunchId(u64);

impl LaunchId {
    #[must_use]
    pub fn next(self) -> Self {
        Self(self.0 + 1)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportEvent {
    pub launch: LaunchId,
    pub kind: TransportEventKind,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TransportEventKind {
    /// The process was spawned.
    Started,
    /// One decoded frame.
    Message(serde_json::Value),
    /// Bytes that could not be decoded; the stream resynchronised after them.
    Malformed(String),
    /// The process exited after a requested stop.
    Stopped,
    /// The process exited without being asked to.
    Crashed(ExitInfo),
}

/// The process boundary. Implementations report lifecycle and frames through
/// the `events` channel handed to [`Transport::start`].
pub trait Transport: Send {
    /// Launch `executable` with `args`. Fails synchronously when the
    /// executable cannot be resolved or spawned.
    fn start(
        &mut self,
        launch: LaunchId,
        executable: &Path,
        args: &[String],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), SessionError>;

    /// Queue one frame for the process's stdin.
    fn write_message(&mut self, frame: serde_json::Value) -> Result<(), WriteError>;

    /// Ask the process to exit, optionally sending `goodbye` first. The
    /// transport reports `Stopped` once the process is gone.
    fn stop(&mut self, goodbye: Option<serde_json::Value>);
}

#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    StatusChanged(ProtocolStatus),
    Response(serde_json::Value),
    Failed(SessionError),
}

pub struct Protocol {
    transport: Box<dyn Transport>,
    events: mpsc::UnboundedSender<TransportEvent>,
    session_args: Vec<String>,
    handshake_timeout: Duration,
    status: ProtocolStatus,
    launch: LaunchId,
    handshake_deadline: Option<Instant>,
}

impl Protocol {
    pub fn new(
        transport: Box<dyn Transport>,
        events: mpsc::UnboundedSender<TransportEvent>,
        config: &SessionConfig,
    ) -> Self {
        Self {
            transport,
            events,
            session_args: config.session_args.clone(),
            handshake_timeout: config.handshake_timeout,
            status: ProtocolStatus::Stopped,
            launch: LaunchId::default(),
            handshake_deadline: None,
        }
    }

    #[must_use]
    pub fn status(&self) -> ProtocolStatus {
        self.status
    }

    #[must_use]
    pub fn launch(&self) -> LaunchId {
        self.launch
    }

    /// Launch the build tool. No-op unless stopped.
    pub fn start(&mut self, executable: &Path) -> Vec<ProtocolEvent> {
        if self.status != ProtocolStatus::Stopped {
            tracing::debug!(status = ?self.status, "Ignoring start: protocol not stopped");
            return Vec::new();
        }

        let mut out = vec![self.set_status(ProtocolStatus::Starting)];
        self.launch = self.launch.next();
        tracing::info!(
            executable = %executable.display(),
            launch = self.launch.0,
            "Starting build tool session"
        );

        if let Err(e) = self.transport.start(
            self.launch,
            executable,
            &self.session_args,
            self.events.clone(),
        ) {
            tracing::warn!("Failed to start build tool: {e}");
            out.push(ProtocolEvent::Failed(e));
            out.push(self.set_status(ProtocolStatus::Stopped));
        }
        out
    }

    /// Ask the build tool to quit. No-op unless starting or started.
    pub fn stop(&mut self) -> Vec<ProtocolEvent> {
        if !matches!(
            self.status,
            ProtocolStatus::Starting | ProtocolStatus::Started
        ) {
            tracing::debug!(status = ?self.status, "Ignoring stop");
            return Vec::new();
        }

        self.handshake_deadline = None;
        let out = vec![self.set_status(ProtocolStatus::Stopping)];
        let goodbye = match Request::Quit.to_value() {
            Ok(frame) => Some(frame),
            Err(e) => {
                tracing::warn!("Cannot encode quit request, stopping without it: {e}");
                None
            }
        };
        self.transport.stop(goodbye);
        out
    }

    pub fn send_request(&mut self, request: &Request) -> Result<(), WriteError> {
        let frame = request.to_value()?;
        tracing::debug!(kind = request.kind(), "Sending request");
        self.transport.write_message(frame)
    }

    pub fn handle_transport_event(
        &mut self,
        event: TransportEvent,
        now: Instant,
    ) -> Vec<ProtocolEvent> {
        if event.launch != self.launch {
            tracing::debug!(
                launch = event.launch.0,
                current = self.launch.0,
                "Dropping event from a previous launch"
            );
            return Vec::new();
        }

        match event.kind {
            TransportEventKind::Started => {
                if self.status == ProtocolStatus::Starting {
                    self.handshake_deadline = Some(now + self.handshake_timeout);
                }
                Vec::new()
            }
            TransportEventKind::Message(frame) => self.on_frame(frame),
            TransportEventKind::Malformed(reason) => {
                tracing::warn!(%reason, "Malformed frame from build tool");
                vec![ProtocolEvent::Failed(SessionError::MalformedFrame(reason))]
            }
            TransportEventKind::Stopped => {
                if self.status == ProtocolStatus::Stopped {
                    return Vec::new();
                }
                tracing::info!("Build tool session stopped");
                self.handshake_deadline = None;
                vec![self.set_status(ProtocolStatus::Stopped)]
            }
            TransportEventKind::Crashed(exit) => {
                if self.status == ProtocolStatus::Stopped {
                    tracing::debug!(%exit, "Build tool exited after session was already stopped");
                    return Vec::new();
                }
                tracing::warn!(%exit, status = ?self.status, "Build tool crashed");
                self.handshake_deadline = None;
                // Release the dead launch's pipes; later writes fail.
                self.transport.stop(None);
                vec![
                    ProtocolEvent::Failed(SessionError::ProcessCrash(exit)),
                    self.set_status(ProtocolStatus::Stopped),
                ]
            }
        }
    }

    /// Earliest instant at which [`Protocol::on_timer`] has work to do.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.handshake_deadline
    }

    /// Fire the handshake timeout if it has elapsed.
    pub fn on_timer(&mut self, now: Instant) -> Vec<ProtocolEvent> {
        let Some(deadline) = self.handshake_deadline else {
            return Vec::new();
        };
        if now < deadline {
            return Vec::new();
        }
        self.handshake_deadline = None;
        if self.status != ProtocolStatus::Starting {
            return Vec::new();
        }

        tracing::warn!(
            timeout = ?self.handshake_timeout,
            "Build tool did not complete the handshake"
        );
        self.transport.stop(None);
        vec![
            ProtocolEvent::Failed(SessionError::HandshakeTimeout(self.handshake_timeout)),
            self.set_status(ProtocolStatus::Stopped),
        ]
    }

    fn on_frame(&mut self, frame: serde_json::Value) -> Vec<ProtocolEvent> {
        match self.status {
            ProtocolStatus::Starting => {
                let kind = frame.get("type").and_then(serde_json::Value::as_str);
                if kind == Some(HELLO) {
                    self.handshake_deadline = None;
                    tracing::info!("Build tool session started");
                    vec![
                        self.set_status(ProtocolStatus::Started),
                        ProtocolEvent::Response(frame),
                    ]
                } else {
                    tracing::warn!(kind = ?kind, "Dropping frame received before hello");
                    Vec::new()
                }
            }
            ProtocolStatus::Started | ProtocolStatus::Stopping => {
                vec![ProtocolEvent::Response(frame)]
            }
            ProtocolStatus::Stopped => Vec::new(),
        }
    }

    fn set_status(&mut self, status: ProtocolStatus) -> ProtocolEvent {
        self.status = status;
        ProtocolEvent::StatusChanged(status)
    }
}
