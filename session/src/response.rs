//! Classification of inbound frames by their `type` discriminator.

use serde::de::DeserializeOwned;

use crate::types::{
    HelloResult, MessageResult, ProcessResult, RunEnvironment, RunEnvironmentResult,
    TaskMaxProgressResult, TaskProgressResult, TaskStartedResult,
};

/// Every response kind the session understands.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Hello(HelloResult),
    ProjectResolved(MessageResult),
    ProjectBuilt(MessageResult),
    ProjectCleaned(MessageResult),
    ProjectInstalled(MessageResult),
    LogMessage(MessageResult),
    Warning(MessageResult),
    TaskStarted(TaskStartedResult),
    TaskProgress(TaskProgressResult),
    TaskMaxProgress(TaskMaxProgressResult),
    CommandDescription(MessageResult),
    ProcessResult(ProcessResult),
    RunEnvironment(RunEnvironmentResult),
    /// A kind the build tool sends that carries nothing for this client.
    Ignored(String),
    /// Missing or unrecognised `type`.
    Unknown(String),
}

impl Response {
    #[must_use]
    pub fn classify(frame: &serde_json::Value) -> Self {
        let Some(kind) = frame.get("type").and_then(serde_json::Value::as_str) else {
            return Self::Unknown(String::new());
        };
        let error = || MessageResult::from_value(frame.get("error"));

        match kind {
            "hello" => Self::Hello(payload(frame)),
            "project-resolved" => Self::ProjectResolved(error()),
            "project-built" | "build-done" => Self::ProjectBuilt(error()),
            "project-cleaned" => Self::ProjectCleaned(error()),
            "install-done" => Self::ProjectInstalled(error()),
            "log-data" => Self::LogMessage(MessageResult::from_value(frame.get("message"))),
            "warning" => Self::Warning(MessageResult::from_value(frame.get("warning"))),
            "task-started" => Self::TaskStarted(payload(frame)),
            "task-progress" => Self::TaskProgress(payload(frame)),
            "new-max-progress" => Self::TaskMaxProgress(payload(frame)),
            "command-description" => {
                Self::CommandDescription(MessageResult::from_value(frame.get("message")))
            }
            "process-result" => Self::ProcessResult(payload(frame)),
            "run-environment" => Self::RunEnvironment(RunEnvironmentResult {
                environment: RunEnvironment::from_value(frame.get("full-environment")),
                error: error(),
            }),
            "generated-files-for-source" | "files-added" | "files-removed" => {
                Self::Ignored(kind.to_string())
            }
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Deserialize a payload leniently; missing or mistyped fields take defaults.
fn payload<T: DeserializeOwned + Default>(frame: &serde_json::Value) -> T {
    serde_json::from_value(frame.clone()).unwrap_or_else(|e| {
        tracing::debug!("Lenient payload fallback: {e}");
        T::default()
    })
}
