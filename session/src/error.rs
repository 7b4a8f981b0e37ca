//! Error taxonomy for the session engine.
//!
//! None of these cross into caller code as `Err`: the state machine publishes
//! them on [`EventHub::error`](crate::EventHub) and logs them.

use std::path::PathBuf;
use std::time::Duration;

use crate::types::ExitInfo;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error(transparent)]
    Spawn(#[from] SpawnError),
    /// The OS refused to launch a resolved executable.
    #[error("failed to launch {}: {reason}", path.display())]
    Process { path: PathBuf, reason: String },
    #[error(transparent)]
    Write(#[from] WriteError),
    #[error("no hello received from the build tool within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("build tool exited unexpectedly ({0})")]
    ProcessCrash(ExitInfo),
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpawnError {
    #[error("build tool executable is not configured")]
    EmptyPath,
    #[error("build tool executable {path} not found: {reason}")]
    NotFound { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WriteError {
    #[error("build tool process is not running")]
    NotRunning,
    #[error("build tool input pipe is closed")]
    PipeClosed,
    #[error("cannot serialize request: {0}")]
    Serialize(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_error_messages() {
        let err = SessionError::from(SpawnError::EmptyPath);
        assert_eq!(err.to_string(), "build tool executable is not configured");

        let err = SessionError::from(SpawnError::NotFound {
            path: "qbs".to_string(),
            reason: "cannot find binary path".to_string(),
        });
        assert!(err.to_string().contains("qbs not found"));
    }

    #[test]
    fn test_crash_message_includes_exit_info() {
        let err = SessionError::ProcessCrash(ExitInfo {
            code: Some(3),
            signal: None,
        });
        assert_eq!(err.to_string(), "build tool exited unexpectedly (exit code 3)");
    }
}
