//! Shared test utilities and fixtures
//!
//! The integration tests stand in for `qbs` with `/bin/sh -c <script>`: the
//! session arguments carry the script and the packets it should print.

#![allow(dead_code)]

use std::path::PathBuf;
use std::time::Duration;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use qbs_session::{Emitter, SessionConfig, StaticSettings, Subscription};
use tokio::sync::mpsc;

/// How long any single wait in the suite may take.
pub const WAIT: Duration = Duration::from_secs(10);

/// Frame `value` the way `qbs session` writes it.
pub fn packet(value: &serde_json::Value) -> String {
    let payload = STANDARD.encode(serde_json::to_vec(value).unwrap());
    format!("qbsmsg:{}\n{payload}", payload.len())
}

pub fn hello() -> String {
    packet(&serde_json::json!({
        "type": "hello",
        "api-level": 2,
        "api-compat-level": 2
    }))
}

/// Session settings that run `script` under `/bin/sh` with `args` as `$1..`.
pub fn fake_qbs(script: &str, args: &[String]) -> (SessionConfig, StaticSettings) {
    let mut session_args = vec!["-c".to_string(), script.to_string(), "sh".to_string()];
    session_args.extend_from_slice(args);
    let config = SessionConfig {
        session_args,
        handshake_timeout: Duration::from_secs(5),
        stop_grace: Duration::from_millis(500),
        auto_resolve_debounce: Duration::from_millis(20),
        ..SessionConfig::default()
    };
    let settings = StaticSettings {
        executable: Some(PathBuf::from("/bin/sh")),
        ..StaticSettings::default()
    };
    (config, settings)
}

/// Events of one emitter, delivered through a channel.
pub struct Events<T> {
    _subscription: Subscription,
    rx: mpsc::UnboundedReceiver<T>,
}

impl<T: Clone + Send + 'static> Events<T> {
    pub fn of(emitter: &Emitter<T>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscription = emitter.subscribe(move |event: &T| {
            let _ = tx.send(event.clone());
        });
        Self {
            _subscription: subscription,
            rx,
        }
    }

    pub async fn next(&mut self) -> T {
        tokio::time::timeout(WAIT, self.rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("emitter dropped")
    }

    /// Wait for the first event matching `pred`, discarding the rest.
    pub async fn until(&mut self, mut pred: impl FnMut(&T) -> bool) -> T {
        loop {
            let event = self.next().await;
            if pred(&event) {
                return event;
            }
        }
    }
}
