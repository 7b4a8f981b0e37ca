//! `config.toml` model and its resolution into session settings.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use qbs_session::{BuildSettings, Selection, SessionConfig, SettingsEvent, SettingsProvider};
use serde::Deserialize;

use crate::ConfigError;

/// Placeholder replaced with the workspace directory in path settings.
const WORKSPACE_FOLDER: &str = "workspaceFolder";

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct QbsConfig {
    pub qbs: ToolConfig,
    pub session: SessionSection,
    pub build: BuildSection,
    pub project: ProjectSection,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ToolConfig {
    /// Build tool executable; a bare name is looked up on `PATH`.
    pub executable: Option<String>,
    pub settings_directory: Option<String>,
    pub build_directory: Option<String>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SessionSection {
    pub handshake_timeout_ms: Option<u64>,
    pub stop_grace_ms: Option<u64>,
    pub auto_resolve_debounce_ms: Option<u64>,
    pub restart_on_crash: bool,
    pub session_args: Option<Vec<String>>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BuildSection {
    pub keep_going: bool,
    pub max_job_count: Option<u32>,
    pub clean_install_root: bool,
    pub command_echo_mode: Option<String>,
    pub log_level: Option<String>,
    pub force_probe_execution: bool,
}

#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ProjectSection {
    pub profile: Option<String>,
    pub configuration: Option<String>,
    pub custom_properties: toml::Table,
}

/// Settings with variables expanded and defaults applied.
#[derive(Debug, Clone, Default)]
pub struct ResolvedSettings {
    pub executable: Option<PathBuf>,
    pub build: BuildSettings,
    pub session: SessionConfig,
    pub selection: Selection,
}

impl QbsConfig {
    /// Load the config at [`config_path`]. A missing file is not an error.
    pub fn load() -> Result<Option<Self>, ConfigError> {
        match config_path() {
            Some(path) => Self::load_from(&path),
            None => Ok(None),
        }
    }

    pub fn load_from(path: &Path) -> Result<Option<Self>, ConfigError> {
        if !path.exists() {
            return Ok(None);
        }

        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) => {
                tracing::warn!("Failed to read config at {}: {err}", path.display());
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source: err,
                });
            }
        };

        match toml::from_str(&content) {
            Ok(config) => Ok(Some(config)),
            Err(err) => {
                tracing::warn!("Failed to parse config at {}: {err}", path.display());
                Err(ConfigError::Parse {
                    path: path.to_path_buf(),
                    source: err,
                })
            }
        }
    }

    /// Expand variables relative to `workspace` and fill in defaults.
    pub fn resolve(&self, workspace: &Path) -> Result<ResolvedSettings, ConfigError> {
        let expand = |value: &Option<String>| {
            value
                .as_deref()
                .map(|v| expand_path(v, workspace))
                .filter(|p| !p.as_os_str().is_empty())
        };

        let mut build = BuildSettings {
            settings_directory: expand(&self.qbs.settings_directory),
            build_directory: expand(&self.qbs.build_directory),
            keep_going: self.build.keep_going,
            max_job_count: self.build.max_job_count,
            clean_install_root: self.build.clean_install_root,
            force_probe_execution: self.build.force_probe_execution,
            ..BuildSettings::default()
        };
        if let Some(mode) = &self.build.command_echo_mode {
            build.command_echo_mode.clone_from(mode);
        }
        if let Some(level) = &self.build.log_level {
            build.log_level.clone_from(level);
        }

        let mut session = SessionConfig {
            restart_on_crash: self.session.restart_on_crash,
            ..SessionConfig::default()
        };
        if let Some(ms) = self.session.handshake_timeout_ms {
            session.handshake_timeout = Duration::from_millis(ms);
        }
        if let Some(ms) = self.session.stop_grace_ms {
            session.stop_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = self.session.auto_resolve_debounce_ms {
            session.auto_resolve_debounce = Duration::from_millis(ms);
        }
        if let Some(args) = &self.session.session_args {
            session.session_args.clone_from(args);
        }

        let mut selection = Selection {
            profile: self.project.profile.clone(),
            ..Selection::default()
        };
        if let Some(configuration) = &self.project.configuration {
            selection.configuration.clone_from(configuration);
        }
        for (key, value) in &self.project.custom_properties {
            let json = toml_to_json(value).map_err(|reason| ConfigError::InvalidValue {
                key: format!("project.custom_properties.{key}"),
                reason,
            })?;
            selection.custom_properties.insert(key.clone(), json);
        }

        Ok(ResolvedSettings {
            executable: expand(&self.qbs.executable),
            build,
            session,
            selection,
        })
    }
}

/// Events a switch from `old` to `new` settings calls for.
///
/// Anything that changes how the process is launched needs a restart; anything
/// that changes resolve parameters needs a resolve. The selection is not
/// diffed here: it is applied through the session's setters.
#[must_use]
pub fn diff(old: &ResolvedSettings, new: &ResolvedSettings) -> Vec<SettingsEvent> {
    let mut events = Vec::new();
    if old.executable != new.executable
        || old.session.session_args != new.session.session_args
        || old.build.settings_directory != new.build.settings_directory
    {
        events.push(SettingsEvent::RestartRequired);
    }
    if old.build.settings_directory != new.build.settings_directory
        || old.build.build_directory != new.build.build_directory
        || old.build.force_probe_execution != new.build.force_probe_execution
        || old.build.log_level != new.build.log_level
    {
        events.push(SettingsEvent::ResolveRequired);
    }
    events
}

/// [`SettingsProvider`] over settings that can be swapped at runtime.
/// Clones share the same settings.
#[derive(Debug, Clone, Default)]
pub struct SharedSettings {
    inner: Arc<RwLock<ResolvedSettings>>,
}

impl SharedSettings {
    #[must_use]
    pub fn new(settings: ResolvedSettings) -> Self {
        Self {
            inner: Arc::new(RwLock::new(settings)),
        }
    }

    #[must_use]
    pub fn current(&self) -> ResolvedSettings {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install `settings` and return the events the change calls for.
    pub fn replace(&self, settings: ResolvedSettings) -> Vec<SettingsEvent> {
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let events = diff(&guard, &settings);
        *guard = settings;
        events
    }
}

impl SettingsProvider for SharedSettings {
    fn executable_path(&self) -> Option<PathBuf> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .executable
            .clone()
    }

    fn build_settings(&self) -> BuildSettings {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .build
            .clone()
    }
}

/// Expand `${workspaceFolder}` and `${ENV_VAR}` references, then normalize
/// separators to `/`.
#[must_use]
pub fn expand_path(value: &str, workspace: &Path) -> PathBuf {
    let workspace = workspace.to_string_lossy();
    let expanded = expand_vars(value, |name| {
        if name == WORKSPACE_FOLDER {
            Some(workspace.to_string())
        } else {
            env::var(name).ok()
        }
    });
    PathBuf::from(expanded.replace('\\', "/"))
}

/// Replace `${NAME}` with `lookup(NAME)`; unknown names become empty and an
/// unclosed `${` is kept verbatim.
pub fn expand_vars(value: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(value.len());
    let mut i = 0;

    while i < value.len() {
        if value[i..].starts_with("${") {
            let start = i + 2;
            if let Some(end_rel) = value[start..].find('}') {
                let end = start + end_rel;
                let var = &value[start..end];
                if !var.is_empty() {
                    out.push_str(&lookup(var).unwrap_or_default());
                }
                i = end + 1;
                continue;
            }
        }

        let Some(ch) = value[i..].chars().next() else {
            break;
        };
        out.push(ch);
        i += ch.len_utf8();
    }

    out
}

/// Convert a TOML value to a JSON value.
fn toml_to_json(value: &toml::Value) -> Result<serde_json::Value, String> {
    match value {
        toml::Value::String(s) => Ok(serde_json::Value::String(s.clone())),
        toml::Value::Integer(i) => Ok(serde_json::Value::Number((*i).into())),
        toml::Value::Float(f) => {
            let n =
                serde_json::Number::from_f64(*f).ok_or_else(|| format!("Invalid float: {f}"))?;
            Ok(serde_json::Value::Number(n))
        }
        toml::Value::Boolean(b) => Ok(serde_json::Value::Bool(*b)),
        toml::Value::Array(arr) => {
            let json_arr: Result<Vec<_>, _> = arr.iter().map(toml_to_json).collect();
            Ok(serde_json::Value::Array(json_arr?))
        }
        toml::Value::Table(table) => {
            let mut map = serde_json::Map::new();
            for (k, v) in table {
                map.insert(k.clone(), toml_to_json(v)?);
            }
            Ok(serde_json::Value::Object(map))
        }
        toml::Value::Datetime(dt) => Ok(serde_json::Value::String(dt.to_string())),
    }
}

#[must_use]
pub fn config_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".qbs-session").join("config.toml"))
}
