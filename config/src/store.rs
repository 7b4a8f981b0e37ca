//! Last active project per workspace, kept in `state.json`.

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use qbs_session::ProjectStore;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tokio::runtime::Handle;

#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    projects: BTreeMap<String, PathBuf>,
}

/// File-backed [`ProjectStore`]. Failures are logged, never returned:
/// remembering the project is best effort.
///
/// Inside a tokio runtime the file is written on the blocking pool, so
/// `save` never blocks the caller's task. Clones share state.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
    workspace: String,
    shared: Arc<Mutex<Shared>>,
}

#[derive(Debug, Default)]
struct Shared {
    /// Last value given to `save`; `None` until the first save.
    latest: Option<Option<PathBuf>>,
}

impl StateStore {
    #[must_use]
    pub fn new(path: PathBuf, workspace: &Path) -> Self {
        Self {
            path,
            workspace: workspace.to_string_lossy().into_owned(),
            shared: Arc::default(),
        }
    }

    /// Store at the default location, `~/.qbs-session/state.json`.
    #[must_use]
    pub fn open_default(workspace: &Path) -> Option<Self> {
        state_path().map(|path| Self::new(path, workspace))
    }

    fn read(path: &Path) -> StateFile {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return StateFile::default(),
            Err(e) => {
                tracing::warn!("Failed to read {}: {e}", path.display());
                return StateFile::default();
            }
        };
        serde_json::from_str(&content).unwrap_or_else(|e| {
            tracing::warn!("Ignoring corrupt state file {}: {e}", path.display());
            StateFile::default()
        })
    }

    fn write(path: &Path, state: &StateFile) -> io::Result<()> {
        let parent = path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let bytes = serde_json::to_vec_pretty(state).map_err(io::Error::other)?;

        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(&bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }

    /// Write the newest saved value. The lock is held across the write, so
    /// whichever flush runs last leaves the file at the newest value.
    fn flush(&self) {
        let shared = self.shared.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(project) = &shared.latest else {
            return;
        };
        let mut state = Self::read(&self.path);
        match project {
            Some(project) => {
                state
                    .projects
                    .insert(self.workspace.clone(), project.clone());
            }
            None => {
                state.projects.remove(&self.workspace);
            }
        }
        if let Err(e) = Self::write(&self.path, &state) {
            tracing::warn!(
                path = %self.path.display(),
                "Failed to persist active project: {e}"
            );
        }
    }
}

impl ProjectStore for StateStore {
    fn load(&self) -> Option<PathBuf> {
        if let Some(latest) = &self
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest
        {
            return latest.clone();
        }
        Self::read(&self.path).projects.remove(&self.workspace)
    }

    fn save(&mut self, project: Option<&Path>) {
        self.shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .latest = Some(project.map(Path::to_path_buf));

        match Handle::try_current() {
            Ok(runtime) => {
                let store = self.clone();
                runtime.spawn_blocking(move || store.flush());
            }
            Err(_) => self.flush(),
        }
    }
}

#[must_use]
pub fn state_path() -> Option<PathBuf> {
    dirs::home_dir().map(|home| home.join(".qbs-session").join("state.json"))
}
