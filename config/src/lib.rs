//! Configuration for qbs-session: the `config.toml` settings file, the
//! last-active-project store, and project discovery.

use std::path::{Path, PathBuf};

mod discover;
mod settings;
mod store;

pub use discover::{default_project, discover_projects};
pub use settings::{
    BuildSection, ProjectSection, QbsConfig, ResolvedSettings, SessionSection, SharedSettings,
    ToolConfig, config_path, diff, expand_path, expand_vars,
};
pub use store::{StateStore, state_path};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
}

impl ConfigError {
    /// File the error refers to, when there is one.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        match self {
            ConfigError::Read { path, .. } | ConfigError::Parse { path, .. } => Some(path),
            ConfigError::InvalidValue { .. } => None,
        }
    }
}
