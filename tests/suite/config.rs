//! Config file to running session: settings resolution, project persistence
//! and reload-driven restarts.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use qbs_config::{QbsConfig, ResolvedSettings, SharedSettings, StateStore};
use qbs_session::{Collaborators, ProjectStore, Session, SessionStatus, SettingsEvent};

use crate::common::{Events, WAIT, hello};

fn toml_string(value: &str) -> String {
    // JSON string escapes are valid in TOML basic strings.
    serde_json::to_string(value).unwrap()
}

/// Config whose "qbs" is `/bin/sh` printing a hello and idling.
fn write_config(dir: &Path) -> PathBuf {
    let script = r#"printf '%s' "$1"; cat >/dev/null"#;
    let content = format!(
        r#"
[qbs]
executable = "/bin/sh"
build_directory = "${{workspaceFolder}}/build"

[session]
session_args = ["-c", {script}, "sh", {hello}]
handshake_timeout_ms = 5000
stop_grace_ms = 500
auto_resolve_debounce_ms = 20

[project]
profile = "gcc"
configuration = "release"
"#,
        script = toml_string(script),
        hello = toml_string(&hello()),
    );
    let path = dir.join("config.toml");
    fs::write(&path, content).unwrap();
    path
}

fn load(config: &Path, workspace: &Path) -> ResolvedSettings {
    QbsConfig::load_from(config)
        .unwrap()
        .expect("config file exists")
        .resolve(workspace)
        .unwrap()
}

#[test]
fn config_file_resolves_against_workspace() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("ws");
    let settings = load(&write_config(dir.path()), &workspace);

    assert_eq!(settings.executable, Some(PathBuf::from("/bin/sh")));
    assert_eq!(settings.build.build_directory, Some(workspace.join("build")));
    assert_eq!(settings.selection.profile.as_deref(), Some("gcc"));
    assert_eq!(settings.selection.configuration, "release");
    assert_eq!(settings.session.session_args.len(), 4);
}

#[cfg(unix)]
#[tokio::test]
async fn session_remembers_project_in_state_file() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().join("ws");
    let settings = load(&write_config(dir.path()), &workspace);
    let state_file = dir.path().join("state.json");

    let shared = SharedSettings::new(settings.clone());
    let collaborators = Collaborators::new(shared)
        .with_store(StateStore::new(state_file.clone(), &workspace));
    let session = Session::spawn(settings.session.clone(), collaborators);
    let handle = session.handle();
    let mut statuses = Events::of(&handle.hub().status_changed);

    handle.set_project(workspace.join("app.qbs"));
    handle.start();
    statuses.until(|s| *s == SessionStatus::Started).await;
    session.shutdown().await;

    // The store writes on the blocking pool; give it a moment to land.
    let reopened = StateStore::new(state_file, &workspace);
    tokio::time::timeout(WAIT, async {
        while reopened.load() != Some(workspace.join("app.qbs")) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("state file never recorded the project");
}

#[cfg(unix)]
#[tokio::test]
async fn executable_change_restarts_session() {
    let dir = tempfile::tempdir().unwrap();
    let workspace = dir.path().to_path_buf();
    let config = write_config(dir.path());
    let settings = load(&config, &workspace);

    let shared = SharedSettings::new(settings.clone());
    let session = Session::spawn(
        settings.session.clone(),
        Collaborators::new(shared.clone()),
    );
    let handle = session.handle();
    let mut statuses = Events::of(&handle.hub().status_changed);

    handle.start();
    statuses.until(|s| *s == SessionStatus::Started).await;

    let mut reloaded = settings.clone();
    reloaded.executable = Some(PathBuf::from("sh"));
    let events = shared.replace(reloaded);
    assert_eq!(events, vec![SettingsEvent::RestartRequired]);
    for event in events {
        handle.settings_changed(event);
    }

    assert_eq!(statuses.next().await, SessionStatus::Stopping);
    assert_eq!(statuses.next().await, SessionStatus::Stopped);
    assert_eq!(statuses.next().await, SessionStatus::Starting);
    assert_eq!(statuses.next().await, SessionStatus::Started);

    session.shutdown().await;
}
