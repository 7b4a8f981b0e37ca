//! Public types consumed by session observers and the composition root.
//!
//! These define the interface between `qbs-session` and its callers: the
//! [`SessionConfig`] the root builds, the statuses it observes, and the typed
//! result payloads published for each response kind.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

/// Lifecycle of the protocol layer. Owned by [`Protocol`](crate::protocol::Protocol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProtocolStatus {
    Stopped,
    Starting,
    Started,
    Stopping,
}

/// Lifecycle visible to callers. Mirrors [`ProtocolStatus`] one to one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SessionStatus {
    #[default]
    Stopped,
    Starting,
    Started,
    Stopping,
}

impl SessionStatus {
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Started => "started",
            Self::Stopping => "stopping",
        }
    }
}

impl From<ProtocolStatus> for SessionStatus {
    fn from(status: ProtocolStatus) -> Self {
        match status {
            ProtocolStatus::Stopped => Self::Stopped,
            ProtocolStatus::Starting => Self::Starting,
            ProtocolStatus::Started => Self::Started,
            ProtocolStatus::Stopping => Self::Stopping,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// How the build tool process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    pub code: Option<i32>,
    /// Terminating signal (Unix only).
    pub signal: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit code {code}"),
            (None, Some(signal)) => write!(f, "signal {signal}"),
            (None, None) => f.write_str("unknown exit status"),
        }
    }
}

/// Tuning knobs for the session engine.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Arguments that put the build tool into session mode.
    pub session_args: Vec<String>,
    /// How long to wait for the `hello` packet after spawning.
    pub handshake_timeout: Duration,
    /// How long a stopping process may take before it is killed.
    pub stop_grace: Duration,
    /// Quiet period that coalesces project/profile/configuration changes.
    pub auto_resolve_debounce: Duration,
    /// Queue one restart when the process crashes while started.
    pub restart_on_crash: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            session_args: vec!["session".to_string()],
            handshake_timeout: Duration::from_secs(10),
            stop_grace: Duration::from_secs(3),
            auto_resolve_debounce: Duration::from_millis(200),
            restart_on_crash: false,
        }
    }
}

/// Request parameters supplied by the settings collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildSettings {
    pub settings_directory: Option<PathBuf>,
    pub build_directory: Option<PathBuf>,
    pub keep_going: bool,
    pub max_job_count: Option<u32>,
    pub clean_install_root: bool,
    pub force_probe_execution: bool,
    /// One of `silent`, `summary`, `command-line`, `command-line-with-environment`.
    pub command_echo_mode: String,
    pub log_level: String,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self {
            settings_directory: None,
            build_directory: None,
            keep_going: false,
            max_job_count: None,
            clean_install_root: false,
            force_probe_execution: false,
            command_echo_mode: "summary".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Change notification from the settings collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsEvent {
    /// A setting that affects the resolved project changed.
    ResolveRequired,
    /// The executable (or its session arguments) changed.
    RestartRequired,
}

/// Build configuration currently selected for the active project.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub profile: Option<String>,
    pub configuration: String,
    pub custom_properties: BTreeMap<String, serde_json::Value>,
}

impl Default for Selection {
    fn default() -> Self {
        Self {
            profile: None,
            configuration: "debug".to_string(),
            custom_properties: BTreeMap::new(),
        }
    }
}

// ── Result payloads ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HelloResult {
    pub api_level: u64,
    pub api_compat_level: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Location {
    pub file_path: String,
    pub line: u64,
    pub column: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageItem {
    pub description: String,
    pub location: Option<Location>,
}

impl fmt::Display for MessageItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.location {
            Some(loc) if !loc.file_path.is_empty() => write!(
                f,
                "{}:{}:{}: {}",
                loc.file_path, loc.line, loc.column, self.description
            ),
            _ => f.write_str(&self.description),
        }
    }
}

/// Text or error-info payload (`error`, `message`, `warning` fields).
///
/// `null` or an absent field is an empty result; a plain string is a single
/// item; a Qbs error-info object contributes one item per entry in `items`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageResult {
    items: Vec<MessageItem>,
}

impl MessageResult {
    #[must_use]
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        let items = match value {
            None | Some(serde_json::Value::Null) => Vec::new(),
            Some(serde_json::Value::String(text)) if text.is_empty() => Vec::new(),
            Some(serde_json::Value::String(text)) => vec![MessageItem {
                description: text.clone(),
                location: None,
            }],
            Some(serde_json::Value::Object(map)) => map
                .get("items")
                .and_then(serde_json::Value::as_array)
                .map(|items| items.iter().filter_map(parse_item).collect())
                .unwrap_or_default(),
            Some(serde_json::Value::Array(items)) => items.iter().filter_map(parse_item).collect(),
            Some(other) => vec![MessageItem {
                description: other.to_string(),
                location: None,
            }],
        };
        Self { items }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[must_use]
    pub fn items(&self) -> &[MessageItem] {
        &self.items
    }
}

impl fmt::Display for MessageResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{item}")?;
        }
        Ok(())
    }
}

fn parse_item(value: &serde_json::Value) -> Option<MessageItem> {
    if let Some(text) = value.as_str() {
        return Some(MessageItem {
            description: text.to_string(),
            location: None,
        });
    }
    let description = value.get("description")?.as_str()?.to_string();
    let location = value
        .get("location")
        .and_then(|loc| serde_json::from_value::<Location>(loc.clone()).ok());
    Some(MessageItem {
        description,
        location,
    })
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TaskStartedResult {
    pub description: String,
    pub max_progress: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TaskProgressResult {
    pub progress: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TaskMaxProgressResult {
    pub max_progress: u64,
}

/// Output of a command the build tool ran on the project's behalf.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProcessResult {
    pub executable_file_path: String,
    pub arguments: Vec<String>,
    pub working_directory: String,
    pub exit_code: i64,
    pub success: bool,
    pub stdout: Vec<String>,
    pub stderr: Vec<String>,
}

/// Environment a product runs in, from `run-environment.full-environment`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunEnvironment(BTreeMap<String, String>);

impl RunEnvironment {
    #[must_use]
    pub fn from_value(value: Option<&serde_json::Value>) -> Self {
        let vars = value
            .and_then(serde_json::Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(key, val)| val.as_str().map(|v| (key.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default();
        Self(vars)
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Payload of a `run-environment` response.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunEnvironmentResult {
    pub environment: RunEnvironment,
    pub error: MessageResult,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping_is_one_to_one() {
        assert_eq!(
            SessionStatus::from(ProtocolStatus::Stopped),
            SessionStatus::Stopped
        );
        assert_eq!(
            SessionStatus::from(ProtocolStatus::Starting),
            SessionStatus::Starting
        );
        assert_eq!(
            SessionStatus::from(ProtocolStatus::Started),
            SessionStatus::Started
        );
        assert_eq!(
            SessionStatus::from(ProtocolStatus::Stopping),
            SessionStatus::Stopping
        );
    }

    #[test]
    fn test_status_labels() {
        assert_eq!(SessionStatus::Started.to_string(), "started");
        assert_eq!(SessionStatus::Stopping.label(), "stopping");
    }

    #[test]
    fn test_exit_info_display() {
        let signalled = ExitInfo {
            code: None,
            signal: Some(9),
        };
        assert_eq!(signalled.to_string(), "signal 9");
        let unknown = ExitInfo {
            code: None,
            signal: None,
        };
        assert_eq!(unknown.to_string(), "unknown exit status");
    }

    #[test]
    fn test_message_result_null_and_missing_are_empty() {
        assert!(MessageResult::from_value(None).is_empty());
        assert!(MessageResult::from_value(Some(&serde_json::Value::Null)).is_empty());
        assert!(MessageResult::from_value(Some(&serde_json::json!(""))).is_empty());
    }

    #[test]
    fn test_message_result_from_error_info() {
        let value = serde_json::json!({
            "items": [
                {
                    "description": "Unexpected token",
                    "location": { "file-path": "/p/app.qbs", "line": 4, "column": 2 }
                },
                { "description": "Resolving failed" }
            ]
        });
        let result = MessageResult::from_value(Some(&value));
        assert_eq!(result.items().len(), 2);
        assert_eq!(
            result.to_string(),
            "/p/app.qbs:4:2: Unexpected token\nResolving failed"
        );
    }

    #[test]
    fn test_message_result_from_plain_string() {
        let result = MessageResult::from_value(Some(&serde_json::json!("compiling main.cpp")));
        assert_eq!(result.to_string(), "compiling main.cpp");
    }

    #[test]
    fn test_process_result_deserializes_kebab_case() {
        let value = serde_json::json!({
            "executable-file-path": "/usr/bin/g++",
            "arguments": ["-c", "main.cpp"],
            "working-directory": "/build",
            "exit-code": 1,
            "success": false,
            "stderr": ["main.cpp:1: error"]
        });
        let result: ProcessResult = serde_json::from_value(value).unwrap();
        assert_eq!(result.executable_file_path, "/usr/bin/g++");
        assert_eq!(result.exit_code, 1);
        assert!(!result.success);
        assert!(result.stdout.is_empty());
        assert_eq!(result.stderr.len(), 1);
    }

    #[test]
    fn test_run_environment_keeps_string_values() {
        let value = serde_json::json!({ "PATH": "/bin", "LD_LIBRARY_PATH": "/lib", "BAD": 3 });
        let env = RunEnvironment::from_value(Some(&value));
        assert_eq!(env.get("PATH"), Some("/bin"));
        assert_eq!(env.get("BAD"), None);
        assert_eq!(env.iter().count(), 2);
    }
}
