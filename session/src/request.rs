//! Outbound request messages.
//!
//! Serialized as a JSON object whose `type` field names the operation;
//! parameter names follow the build tool's kebab-case convention.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::WriteError;
use crate::types::{BuildSettings, Selection};

/// Directory name used under the project directory when no build root is configured.
const DEFAULT_BUILD_DIR: &str = "build";

/// Resolution data mode: only send project data back when it changed.
const DATA_MODE_ONLY_IF_CHANGED: &str = "only-if-changed";

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Request {
    ResolveProject(ResolveRequest),
    BuildProject(BuildRequest),
    CleanProject(CleanRequest),
    InstallProject(InstallRequest),
    CancelJob,
    GetRunEnvironment(RunEnvironmentRequest),
    /// Goodbye sent on graceful stop.
    Quit,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResolveRequest {
    pub project_file_path: PathBuf,
    pub build_root: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_level_profile: Option<String>,
    pub configuration_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings_directory: Option<PathBuf>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub overridden_values: BTreeMap<String, serde_json::Value>,
    pub force_probe_execution: bool,
    pub data_mode: String,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct BuildRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<String>,
    pub keep_going: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_job_count: Option<u32>,
    pub clean_install_root: bool,
    pub command_echo_mode: String,
    pub data_mode: String,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct CleanRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<String>,
    pub keep_going: bool,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct InstallRequest {
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub products: Vec<String>,
    pub keep_going: bool,
    pub clean_install_root: bool,
    pub log_level: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct RunEnvironmentRequest {
    pub product: String,
}

impl Request {
    /// Resolve `project_file` with the current selection.
    ///
    /// Without a configured build directory the build root is `build/` next to
    /// the project file.
    #[must_use]
    pub fn resolve(project_file: &Path, selection: &Selection, settings: &BuildSettings) -> Self {
        let build_root = settings.build_directory.clone().unwrap_or_else(|| {
            project_file
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(DEFAULT_BUILD_DIR)
        });
        Self::ResolveProject(ResolveRequest {
            project_file_path: project_file.to_path_buf(),
            build_root,
            top_level_profile: selection.profile.clone(),
            configuration_name: selection.configuration.clone(),
            settings_directory: settings.settings_directory.clone(),
            overridden_values: selection.custom_properties.clone(),
            force_probe_execution: settings.force_probe_execution,
            data_mode: DATA_MODE_ONLY_IF_CHANGED.to_string(),
            log_level: settings.log_level.clone(),
        })
    }

    #[must_use]
    pub fn build(products: Vec<String>, settings: &BuildSettings) -> Self {
        Self::BuildProject(BuildRequest {
            products,
            keep_going: settings.keep_going,
            max_job_count: settings.max_job_count,
            clean_install_root: settings.clean_install_root,
            command_echo_mode: settings.command_echo_mode.clone(),
            data_mode: DATA_MODE_ONLY_IF_CHANGED.to_string(),
            log_level: settings.log_level.clone(),
        })
    }

    #[must_use]
    pub fn clean(products: Vec<String>, settings: &BuildSettings) -> Self {
        Self::CleanProject(CleanRequest {
            products,
            keep_going: settings.keep_going,
            log_level: settings.log_level.clone(),
        })
    }

    #[must_use]
    pub fn install(products: Vec<String>, settings: &BuildSettings) -> Self {
        Self::InstallProject(InstallRequest {
            products,
            keep_going: settings.keep_going,
            clean_install_root: settings.clean_install_root,
            log_level: settings.log_level.clone(),
        })
    }

    #[must_use]
    pub fn run_environment(product: impl Into<String>) -> Self {
        Self::GetRunEnvironment(RunEnvironmentRequest {
            product: product.into(),
        })
    }

    /// Wire discriminator, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::ResolveProject(_) => "resolve-project",
            Self::BuildProject(_) => "build-project",
            Self::CleanProject(_) => "clean-project",
            Self::InstallProject(_) => "install-project",
            Self::CancelJob => "cancel-job",
            Self::GetRunEnvironment(_) => "get-run-environment",
            Self::Quit => "quit",
        }
    }

    pub fn to_value(&self) -> Result<serde_json::Value, WriteError> {
        serde_json::to_value(self).map_err(|e| WriteError::Serialize(e.to_string()))
    }
}
