//! Process transport: owns the build tool child process and its pipes.

use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

use crate::codec::{Packet, PacketCodec};
use crate::error::{SessionError, SpawnError, WriteError};
use crate::protocol::{LaunchId, Transport, TransportEvent, TransportEventKind};
use crate::types::ExitInfo;

enum WriterCommand {
    Send(serde_json::Value),
    Shutdown,
}

/// Handles to one live launch.
struct Running {
    launch: LaunchId,
    writer_tx: mpsc::UnboundedSender<WriterCommand>,
    /// Dropping this without sending also counts as a stop request.
    stop_tx: oneshot::Sender<()>,
    stop_requested: Arc<AtomicBool>,
    /// Cleared by the monitor once the child has exited.
    alive: Arc<AtomicBool>,
}

/// [`Transport`] over a real child process speaking `qbsmsg:` packets on
/// stdin/stdout.
///
/// Must be used from within a tokio runtime: `start` spawns the reader,
/// writer, stderr and monitor tasks.
pub struct ProcessTransport {
    stop_grace: Duration,
    running: Option<Running>,
}

impl ProcessTransport {
    #[must_use]
    pub fn new(stop_grace: Duration) -> Self {
        Self {
            stop_grace,
            running: None,
        }
    }
}

impl Transport for ProcessTransport {
    fn start(
        &mut self,
        launch: LaunchId,
        executable: &Path,
        args: &[String],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), SessionError> {
        if let Some(previous) = self.running.take() {
            tracing::debug!(
                launch = ?previous.launch,
                "Replacing previous build tool launch"
            );
            previous.stop_requested.store(true, Ordering::SeqCst);
        }

        if executable.as_os_str().is_empty() {
            return Err(SpawnError::EmptyPath.into());
        }
        let resolved = which::which(executable).map_err(|e| SpawnError::NotFound {
            path: executable.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut child = Command::new(&resolved)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SessionError::Process {
                path: resolved.clone(),
                reason: e.to_string(),
            })?;

        let (Some(stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(SessionError::Process {
                path: resolved,
                reason: "child pipes unavailable".to_string(),
            });
        };

        tracing::info!(
            executable = %resolved.display(),
            pid = child.id(),
            "Build tool process spawned"
        );
        // Started precedes every frame of this launch on the channel.
        let _ = events.send(TransportEvent {
            launch,
            kind: TransportEventKind::Started,
        });

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let stop_requested = Arc::new(AtomicBool::new(false));
        let alive = Arc::new(AtomicBool::new(true));

        tokio::spawn(write_frames(stdin, writer_rx));
        tokio::spawn(drain_stderr(stderr));
        let reader = tokio::spawn(read_frames(stdout, launch, events.clone()));
        tokio::spawn(monitor(Monitor {
            child,
            launch,
            reader,
            stop_rx,
            stop_requested: Arc::clone(&stop_requested),
            alive: Arc::clone(&alive),
            stop_grace: self.stop_grace,
            events,
        }));

        self.running = Some(Running {
            launch,
            writer_tx,
            stop_tx,
            stop_requested,
            alive,
        });
        Ok(())
    }

    fn write_message(&mut self, frame: serde_json::Value) -> Result<(), WriteError> {
        let running = self.running.as_ref().ok_or(WriteError::NotRunning)?;
        if !running.alive.load(Ordering::SeqCst) {
            // Dropping the handles ends the writer task and closes stdin.
            self.running = None;
            return Err(WriteError::NotRunning);
        }
        running
            .writer_tx
            .send(WriterCommand::Send(frame))
            .map_err(|_| WriteError::PipeClosed)
    }

    fn stop(&mut self, goodbye: Option<serde_json::Value>) {
        let Some(running) = self.running.take() else {
            return;
        };
        // Set before the goodbye goes out so an exit in reply to it is not
        // reported as a crash.
        running.stop_requested.store(true, Ordering::SeqCst);
        if let Some(frame) = goodbye {
            let _ = running.writer_tx.send(WriterCommand::Send(frame));
        }
        let _ = running.writer_tx.send(WriterCommand::Shutdown);
        let _ = running.stop_tx.send(());
    }
}

async fn write_frames(stdin: ChildStdin, mut rx: mpsc::UnboundedReceiver<WriterCommand>) {
    let mut writer = FramedWrite::new(stdin, PacketCodec::new());
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WriterCommand::Send(frame) => {
                if let Err(e) = writer.send(&frame).await {
                    tracing::warn!("Build tool write error: {e}");
                    break;
                }
            }
            WriterCommand::Shutdown => break,
        }
    }
    // Dropping the writer closes stdin.
}

async fn read_frames(
    stdout: ChildStdout,
    launch: LaunchId,
    events: mpsc::UnboundedSender<TransportEvent>,
) {
    let mut frames = FramedRead::new(stdout, PacketCodec::new());
    while let Some(item) = frames.next().await {
        let kind = match item {
            Ok(Packet::Message(frame)) => {
                tracing::debug!(
                    kind = frame.get("type").and_then(serde_json::Value::as_str),
                    "Frame received"
                );
                TransportEventKind::Message(frame)
            }
            Ok(Packet::Malformed(reason)) => TransportEventKind::Malformed(reason),
            Err(e) => {
                tracing::warn!("Build tool read error: {e}");
                break;
            }
        };
        if events.send(TransportEvent { launch, kind }).is_err() {
            break;
        }
    }
    tracing::debug!("Build tool closed stdout");
}

async fn drain_stderr(stderr: ChildStderr) {
    let mut lines = FramedRead::new(stderr, LinesCodec::new());
    while let Some(line) = lines.next().await {
        match line {
            Ok(line) => tracing::debug!(target: "qbs_session::stderr", "{line}"),
            Err(e) => {
                tracing::debug!("Build tool stderr closed: {e}");
                break;
            }
        }
    }
}

struct Monitor {
    child: Child,
    launch: LaunchId,
    reader: JoinHandle<()>,
    stop_rx: oneshot::Receiver<()>,
    stop_requested: Arc<AtomicBool>,
    alive: Arc<AtomicBool>,
    stop_grace: Duration,
    events: mpsc::UnboundedSender<TransportEvent>,
}

enum Wake {
    Exited(std::io::Result<ExitStatus>),
    StopRequested,
}

/// Wait for the child to exit or be stopped, then report how it ended.
async fn monitor(mut m: Monitor) {
    let wake = tokio::select! {
        status = m.child.wait() => Wake::Exited(status),
        _ = m.stop_rx => Wake::StopRequested,
    };

    let status = match wake {
        Wake::Exited(status) => status,
        Wake::StopRequested => {
            m.stop_requested.store(true, Ordering::SeqCst);
            if let Ok(status) = tokio::time::timeout(m.stop_grace, m.child.wait()).await {
                status
            } else {
                tracing::debug!("Build tool didn't exit in time, killing");
                let _ = m.child.kill().await;
                m.child.wait().await
            }
        }
    };
    m.alive.store(false, Ordering::SeqCst);

    // Every frame the process wrote is delivered before its lifecycle event.
    if tokio::time::timeout(m.stop_grace, m.reader).await.is_err() {
        tracing::debug!("Build tool stdout still open after exit");
    }

    let kind = if m.stop_requested.load(Ordering::SeqCst) {
        tracing::info!("Build tool process exited");
        TransportEventKind::Stopped
    } else {
        let exit = match status {
            Ok(status) => exit_info(status),
            Err(e) => {
                tracing::warn!("Failed to wait for build tool: {e}");
                ExitInfo {
                    code: None,
                    signal: None,
                }
            }
        };
        TransportEventKind::Crashed(exit)
    };
    let _ = m.events.send(TransportEvent {
        launch: m.launch,
        kind,
    });
}

#[cfg(unix)]
fn exit_info(status: ExitStatus) -> ExitInfo {
    use std::os::unix::process::ExitStatusExt;
    ExitInfo {
        code: status.code(),
        signal: status.signal(),
    }
}

#[cfg(not(unix))]
fn exit_info(status: ExitStatus) -> ExitInfo {
    ExitInfo {
        code: status.code(),
        signal: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_path_is_rejected() {
        let mut transport = ProcessTransport::new(Duration::from_secs(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport
            .start(LaunchId::default(), Path::new(""), &[], tx)
            .unwrap_err();
        assert!(matches!(err, SessionError::Spawn(SpawnError::EmptyPath)));
    }

    #[test]
    fn test_missing_executable_is_not_found() {
        let mut transport = ProcessTransport::new(Duration::from_secs(1));
        let (tx, _rx) = mpsc::unbounded_channel();
        let err = transport
            .start(
                LaunchId::default(),
                Path::new("qbs-session-test-does-not-exist"),
                &[],
                tx,
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SessionError::Spawn(SpawnError::NotFound { .. })
        ));
    }

    #[test]
    fn test_write_without_process_is_not_running() {
        let mut transport = ProcessTransport::new(Duration::from_secs(1));
        assert_eq!(
            transport.write_message(serde_json::json!({"type": "cancel-job"})),
            Err(WriteError::NotRunning)
        );
    }

    #[cfg(unix)]
    mod process {
        use bytes::BytesMut;
        use tokio_util::codec::Encoder;

        use super::*;

        fn packet(value: &serde_json::Value) -> String {
            let mut buf = BytesMut::new();
            PacketCodec::new().encode(value, &mut buf).unwrap();
            String::from_utf8(buf.to_vec()).unwrap()
        }

        fn sh(script: &str, extra: &[String]) -> Vec<String> {
            let mut args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
            args.extend_from_slice(extra);
            args
        }

        async fn next(rx: &mut mpsc::UnboundedReceiver<TransportEvent>) -> TransportEventKind {
            tokio::time::timeout(Duration::from_secs(10), rx.recv())
                .await
                .expect("timed out waiting for transport event")
                .expect("transport event channel closed")
                .kind
        }

        #[tokio::test]
        async fn test_frames_precede_crash() {
            let hello = serde_json::json!({"type": "hello", "api-level": 5});
            let mut transport = ProcessTransport::new(Duration::from_secs(2));
            let (tx, mut rx) = mpsc::unbounded_channel();
            transport
                .start(
                    LaunchId::default(),
                    Path::new("sh"),
                    &sh("printf '%s' \"$1\"; exit 3", &[packet(&hello)]),
                    tx,
                )
                .unwrap();

            assert_eq!(next(&mut rx).await, TransportEventKind::Started);
            assert_eq!(next(&mut rx).await, TransportEventKind::Message(hello));
            match next(&mut rx).await {
                TransportEventKind::Crashed(exit) => assert_eq!(exit.code, Some(3)),
                other => panic!("expected crash, got {other:?}"),
            }
        }

        #[tokio::test]
        async fn test_write_after_crash_is_not_running() {
            let mut transport = ProcessTransport::new(Duration::from_secs(2));
            let (tx, mut rx) = mpsc::unbounded_channel();
            transport
                .start(LaunchId::default(), Path::new("sh"), &sh("exit 3", &[]), tx)
                .unwrap();
            assert_eq!(next(&mut rx).await, TransportEventKind::Started);
            assert!(matches!(
                next(&mut rx).await,
                TransportEventKind::Crashed(_)
            ));

            let frame = serde_json::json!({"type": "build-project"});
            assert_eq!(
                transport.write_message(frame.clone()),
                Err(WriteError::NotRunning)
            );
            assert!(transport.running.is_none(), "launch handles released");
            assert_eq!(transport.write_message(frame), Err(WriteError::NotRunning));
        }

        #[tokio::test]
        async fn test_requested_stop_reports_stopped() {
            let mut transport = ProcessTransport::new(Duration::from_secs(2));
            let (tx, mut rx) = mpsc::unbounded_channel();
            transport
                .start(
                    LaunchId::default(),
                    Path::new("sh"),
                    &sh("cat >/dev/null", &[]),
                    tx,
                )
                .unwrap();
            assert_eq!(next(&mut rx).await, TransportEventKind::Started);

            transport.stop(Some(serde_json::json!({"type": "quit"})));
            assert_eq!(next(&mut rx).await, TransportEventKind::Stopped);
            assert_eq!(
                transport.write_message(serde_json::json!({})),
                Err(WriteError::NotRunning)
            );
        }

        #[tokio::test]
        async fn test_written_frames_reach_the_process() {
            let mut transport = ProcessTransport::new(Duration::from_secs(2));
            let (tx, mut rx) = mpsc::unbounded_channel();
            transport
                .start(LaunchId::default(), Path::new("sh"), &sh("cat", &[]), tx)
                .unwrap();
            assert_eq!(next(&mut rx).await, TransportEventKind::Started);

            let frame = serde_json::json!({"type": "get-run-environment", "product": "app"});
            transport.write_message(frame.clone()).unwrap();
            assert_eq!(next(&mut rx).await, TransportEventKind::Message(frame));

            transport.stop(None);
            assert_eq!(next(&mut rx).await, TransportEventKind::Stopped);
        }

        #[tokio::test]
        async fn test_garbage_on_stdout_is_malformed() {
            let mut transport = ProcessTransport::new(Duration::from_secs(2));
            let (tx, mut rx) = mpsc::unbounded_channel();
            transport
                .start(
                    LaunchId::default(),
                    Path::new("sh"),
                    &sh("printf 'not a packet'; exec cat >/dev/null", &[]),
                    tx,
                )
                .unwrap();
            assert_eq!(next(&mut rx).await, TransportEventKind::Started);

            transport.stop(None);
            let mut saw_malformed = false;
            loop {
                match next(&mut rx).await {
                    TransportEventKind::Malformed(_) => saw_malformed = true,
                    TransportEventKind::Stopped => break,
                    other => panic!("unexpected event {other:?}"),
                }
            }
            assert!(saw_malformed);
        }
    }
}
