//! Narrow interfaces to the rest of the application.
//!
//! The session only needs three things from outside: where the build tool is
//! and how to build ([`SettingsProvider`]), somewhere to put project data as it
//! arrives ([`ProjectModel`]), and a place to remember the last active project
//! ([`ProjectStore`]).

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use crate::types::{BuildSettings, RunEnvironment};

pub trait SettingsProvider: Send {
    /// Configured build tool executable; `None` when unset.
    fn executable_path(&self) -> Option<PathBuf>;
    fn build_settings(&self) -> BuildSettings;
}

/// Receives project data as responses arrive.
pub trait ProjectModel: Send {
    /// Store the raw payload of a resolve (`is_resolve`) or build result.
    fn set_data(&mut self, response: &serde_json::Value, is_resolve: bool);
    fn update_steps(&mut self);
    fn set_run_environment(&mut self, environment: &RunEnvironment);
}

/// Creates the model for a newly activated project file.
pub type ProjectModelFactory = Box<dyn Fn(&Path) -> Box<dyn ProjectModel> + Send>;

/// Persists the last active project across sessions.
pub trait ProjectStore: Send {
    fn load(&self) -> Option<PathBuf>;
    fn save(&mut self, project: Option<&Path>);
}

/// Everything the session borrows from its host.
pub struct Collaborators {
    pub settings: Box<dyn SettingsProvider>,
    pub store: Box<dyn ProjectStore>,
    pub project_factory: ProjectModelFactory,
}

impl Collaborators {
    /// In-memory store and [`ProjectSnapshot`] models.
    pub fn new(settings: impl SettingsProvider + 'static) -> Self {
        Self {
            settings: Box::new(settings),
            store: Box::new(MemoryStore::default()),
            project_factory: ProjectSnapshot::factory(),
        }
    }

    #[must_use]
    pub fn with_store(mut self, store: impl ProjectStore + 'static) -> Self {
        self.store = Box::new(store);
        self
    }

    #[must_use]
    pub fn with_project_factory(mut self, factory: ProjectModelFactory) -> Self {
        self.project_factory = factory;
        self
    }
}

/// Fixed settings, for embedding and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSettings {
    pub executable: Option<PathBuf>,
    pub build: BuildSettings,
}

impl SettingsProvider for StaticSettings {
    fn executable_path(&self) -> Option<PathBuf> {
        self.executable.clone()
    }

    fn build_settings(&self) -> BuildSettings {
        self.build.clone()
    }
}

/// Store that forgets everything when dropped.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    project: Option<PathBuf>,
}

impl MemoryStore {
    #[must_use]
    pub fn with_project(project: impl Into<PathBuf>) -> Self {
        Self {
            project: Some(project.into()),
        }
    }
}

impl ProjectStore for MemoryStore {
    fn load(&self) -> Option<PathBuf> {
        self.project.clone()
    }

    fn save(&mut self, project: Option<&Path>) {
        self.project = project.map(Path::to_path_buf);
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct SnapshotState {
    pub project_file: PathBuf,
    /// Last resolve payload.
    pub resolved: Option<serde_json::Value>,
    /// Last build payload.
    pub built: Option<serde_json::Value>,
    pub step_updates: usize,
    pub run_environment: RunEnvironment,
}

/// In-memory [`ProjectModel`]. Clones share state, so a caller can keep one
/// and read what the session stored.
#[derive(Debug, Clone, Default)]
pub struct ProjectSnapshot {
    state: Arc<Mutex<SnapshotState>>,
}

impl ProjectSnapshot {
    #[must_use]
    pub fn new(project_file: &Path) -> Self {
        Self {
            state: Arc::new(Mutex::new(SnapshotState {
                project_file: project_file.to_path_buf(),
                ..SnapshotState::default()
            })),
        }
    }

    /// Factory producing a fresh snapshot per project.
    #[must_use]
    pub fn factory() -> ProjectModelFactory {
        Box::new(|path| Box::new(Self::new(path)))
    }

    #[must_use]
    pub fn state(&self) -> SnapshotState {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn update(&self, f: impl FnOnce(&mut SnapshotState)) {
        f(&mut self.state.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

impl ProjectModel for ProjectSnapshot {
    fn set_data(&mut self, response: &serde_json::Value, is_resolve: bool) {
        self.update(|s| {
            if is_resolve {
                s.resolved = Some(response.clone());
            } else {
                s.built = Some(response.clone());
            }
        });
    }

    fn update_steps(&mut self) {
        self.update(|s| s.step_updates += 1);
    }

    fn set_run_environment(&mut self, environment: &RunEnvironment) {
        self.update(|s| s.run_environment = environment.clone());
    }
}
