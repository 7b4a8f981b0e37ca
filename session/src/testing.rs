//! In-memory transport for driving the protocol and state machine in tests.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;

use crate::error::{SessionError, SpawnError, WriteError};
use crate::protocol::{LaunchId, Transport, TransportEvent};

#[derive(Default)]
struct FakeState {
    starts: Vec<(LaunchId, PathBuf, Vec<String>)>,
    writes: Vec<serde_json::Value>,
    stops: Vec<Option<serde_json::Value>>,
    running: bool,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
}

/// Records every call; clones share the same log.
#[derive(Clone, Default)]
pub(crate) struct FakeTransport {
    state: Arc<Mutex<FakeState>>,
}

impl FakeTransport {
    pub(crate) fn starts(&self) -> usize {
        self.state.lock().unwrap().starts.len()
    }

    pub(crate) fn last_args(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .starts
            .last()
            .map(|(_, _, args)| args.clone())
            .unwrap_or_default()
    }

    pub(crate) fn writes(&self) -> Vec<serde_json::Value> {
        self.state.lock().unwrap().writes.clone()
    }

    pub(crate) fn write_types(&self) -> Vec<String> {
        self.writes()
            .iter()
            .filter_map(|w| w["type"].as_str().map(String::from))
            .collect()
    }

    pub(crate) fn stops(&self) -> Vec<Option<serde_json::Value>> {
        self.state.lock().unwrap().stops.clone()
    }

    /// The channel handed to the most recent `start`.
    pub(crate) fn events(&self) -> Option<mpsc::UnboundedSender<TransportEvent>> {
        self.state.lock().unwrap().events.clone()
    }
}

impl Transport for FakeTransport {
    fn start(
        &mut self,
        launch: LaunchId,
        executable: &Path,
        args: &[String],
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), SessionError> {
        if executable.as_os_str().is_empty() {
            return Err(SpawnError::EmptyPath.into());
        }
        let mut state = self.state.lock().unwrap();
        state
            .starts
            .push((launch, executable.to_path_buf(), args.to_vec()));
        state.running = true;
        state.events = Some(events);
        Ok(())
    }

    fn write_message(&mut self, frame: serde_json::Value) -> Result<(), WriteError> {
        let mut state = self.state.lock().unwrap();
        if !state.running {
            return Err(WriteError::NotRunning);
        }
        state.writes.push(frame);
        Ok(())
    }

    fn stop(&mut self, goodbye: Option<serde_json::Value>) {
        let mut state = self.state.lock().unwrap();
        state.stops.push(goodbye);
        state.running = false;
    }
}
