//! Client for the qbs build tool's session protocol.
//!
//! A [`Session`] launches `qbs session`, exchanges `qbsmsg:` packets with it,
//! tracks the session lifecycle, and publishes every response as a typed event
//! on its [`EventHub`].

pub mod codec;
pub mod collaborators;
pub mod error;
pub mod events;
pub mod protocol;
pub mod request;
pub mod response;
pub mod types;

mod dispatcher;
mod machine;
mod runner;
mod transport;

#[cfg(test)]
mod testing;

pub use collaborators::{
    Collaborators, MemoryStore, ProjectModel, ProjectModelFactory, ProjectSnapshot,
    ProjectStore, SettingsProvider, StaticSettings,
};
pub use dispatcher::ResponseDispatcher;
pub use error::{SessionError, SpawnError, WriteError};
pub use events::{Emitter, EventHub, Subscription, Subscriptions};
pub use machine::SessionStateMachine;
pub use protocol::{LaunchId, Transport, TransportEvent, TransportEventKind};
pub use request::Request;
pub use response::Response;
pub use runner::{Session, SessionHandle};
pub use transport::ProcessTransport;
pub use types::{
    BuildSettings, ExitInfo, HelloResult, Location, MessageItem, MessageResult, ProcessResult,
    ProtocolStatus, RunEnvironment, RunEnvironmentResult, Selection, SessionConfig,
    SessionStatus, SettingsEvent, TaskMaxProgressResult, TaskProgressResult, TaskStartedResult,
};
