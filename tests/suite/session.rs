//! End-to-end session tests against a scripted stand-in for `qbs session`.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use qbs_session::{
    Collaborators, MemoryStore, ProjectSnapshot, Session, SessionError, SessionStatus,
    StaticSettings,
};
use serde_json::json;

use crate::common::{Events, WAIT, fake_qbs, hello, packet};

/// Prints the hello packet, then idles until stdin closes.
const GREET_AND_WAIT: &str = r#"printf '%s' "$1"; cat >/dev/null"#;

async fn wait_status(session: &Session, status: SessionStatus) {
    let reached = tokio::time::timeout(WAIT, session.handle().wait_for_status(status))
        .await
        .expect("timed out waiting for status");
    assert!(reached, "session ended before reaching {status}");
}

#[tokio::test]
async fn handshake_then_orderly_shutdown() {
    let (config, settings) = fake_qbs(GREET_AND_WAIT, &[hello()]);
    let session = Session::spawn(config, Collaborators::new(settings));
    let handle = session.handle();
    let mut statuses = Events::of(&handle.hub().status_changed);
    let mut hellos = Events::of(&handle.hub().hello);

    handle.start();

    assert_eq!(statuses.next().await, SessionStatus::Starting);
    assert_eq!(statuses.next().await, SessionStatus::Started);
    let greeting = hellos.next().await;
    assert_eq!(greeting.api_level, 2);
    assert_eq!(greeting.api_compat_level, 2);

    handle.stop();
    assert_eq!(statuses.next().await, SessionStatus::Stopping);
    assert_eq!(statuses.next().await, SessionStatus::Stopped);

    tokio::time::timeout(WAIT, session.shutdown())
        .await
        .expect("shutdown hung");
}

#[tokio::test]
async fn crash_after_hello_reports_exit_code() {
    let (config, settings) = fake_qbs(r#"printf '%s' "$1"; sleep 0.2; exit 3"#, &[hello()]);
    let session = Session::spawn(config, Collaborators::new(settings));
    let handle = session.handle();
    let mut errors = Events::of(&handle.hub().error);

    handle.start();
    wait_status(&session, SessionStatus::Started).await;

    let err = errors.next().await;
    let SessionError::ProcessCrash(exit) = &err else {
        panic!("expected a crash, got {err:?}");
    };
    assert_eq!(exit.code, Some(3));
    wait_status(&session, SessionStatus::Stopped).await;

    session.shutdown().await;
}

#[tokio::test]
async fn missing_hello_times_out() {
    let (mut config, settings) = fake_qbs("cat >/dev/null", &[]);
    config.handshake_timeout = Duration::from_millis(200);
    let session = Session::spawn(config, Collaborators::new(settings));
    let handle = session.handle();
    let mut errors = Events::of(&handle.hub().error);
    let mut statuses = Events::of(&handle.hub().status_changed);

    handle.start();

    let err = errors.next().await;
    assert!(
        matches!(err, SessionError::HandshakeTimeout(t) if t == Duration::from_millis(200)),
        "{err:?}"
    );
    statuses.until(|s| *s == SessionStatus::Stopped).await;
    assert_eq!(handle.status(), SessionStatus::Stopped);

    session.shutdown().await;
}

#[tokio::test]
async fn unknown_executable_fails_to_start() {
    let (config, _) = fake_qbs(GREET_AND_WAIT, &[hello()]);
    let settings = StaticSettings {
        executable: Some(PathBuf::from("/nonexistent/qbs-session-test")),
        ..StaticSettings::default()
    };
    let session = Session::spawn(config, Collaborators::new(settings));
    let handle = session.handle();
    let mut errors = Events::of(&handle.hub().error);
    let mut statuses = Events::of(&handle.hub().status_changed);

    handle.start();

    assert!(matches!(errors.next().await, SessionError::Spawn(_)));
    assert_eq!(statuses.next().await, SessionStatus::Starting);
    assert_eq!(statuses.next().await, SessionStatus::Stopped);

    session.shutdown().await;
}

#[tokio::test]
async fn auto_resolve_updates_project_before_publishing() {
    // Answers the first request with a resolve result.
    let script = r#"printf '%s' "$1"; read -r header; printf '%s' "$2"; cat >/dev/null"#;
    let resolved = packet(&json!({
        "type": "project-resolved",
        "error": null,
        "project-data": {"name": "app"}
    }));
    let (config, settings) = fake_qbs(script, &[hello(), resolved]);

    let project = Path::new("/ws/app.qbs");
    let snapshot = ProjectSnapshot::new(project);
    let model = snapshot.clone();
    let collaborators = Collaborators::new(settings)
        .with_project_factory(Box::new(move |_| Box::new(model.clone())));
    let session = Session::spawn(config, collaborators);
    let handle = session.handle();
    let mut results = Events::of(&handle.hub().project_resolved);

    let seen = snapshot.clone();
    let observed = Arc::new(Mutex::new(None));
    let observed_in_listener = Arc::clone(&observed);
    let _observer = handle.hub().project_resolved.subscribe(move |_| {
        *observed_in_listener.lock().unwrap() = Some(seen.state().resolved.is_some());
    });

    handle.set_project(project);
    handle.start();

    let result = results.next().await;
    assert!(result.is_empty(), "{result}");
    assert_eq!(*observed.lock().unwrap(), Some(true));
    let state = snapshot.state();
    assert_eq!(state.project_file, project);
    assert_eq!(state.resolved.unwrap()["project-data"]["name"], "app");

    session.shutdown().await;
}

#[tokio::test]
async fn restores_remembered_project_on_start() {
    let (config, settings) = fake_qbs(GREET_AND_WAIT, &[hello()]);
    let collaborators =
        Collaborators::new(settings).with_store(MemoryStore::with_project("/ws/lib.qbs"));
    let session = Session::spawn(config, collaborators);
    let handle = session.handle();
    let mut activated = Events::of(&handle.hub().project_activated);

    handle.start();

    assert_eq!(activated.next().await, PathBuf::from("/ws/lib.qbs"));
    session.shutdown().await;
}

#[tokio::test]
async fn malformed_packet_does_not_end_session() {
    let (config, settings) = fake_qbs(
        r#"printf '%s' "$1"; printf 'qbsmsg:4\n!!!!'; printf '%s' "$2"; cat >/dev/null"#,
        &[
            hello(),
            packet(&json!({"type": "log-data", "message": "still here"})),
        ],
    );
    let session = Session::spawn(config, Collaborators::new(settings));
    let handle = session.handle();
    let mut errors = Events::of(&handle.hub().error);
    let mut logs = Events::of(&handle.hub().log_message);

    handle.start();

    assert!(matches!(errors.next().await, SessionError::MalformedFrame(_)));
    let log = logs.next().await;
    assert_eq!(log.to_string(), "still here");
    assert_eq!(handle.status(), SessionStatus::Started);

    session.shutdown().await;
}
