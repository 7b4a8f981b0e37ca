//! Publish/subscribe registry for session events.
//!
//! Each event kind has its own [`Emitter`]. Subscribing returns a
//! [`Subscription`]; dropping or disposing it removes the listener. Listeners
//! run synchronously on the emitting task, in subscription order, so every
//! observer sees events in the order they were produced.

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use crate::error::SessionError;
use crate::types::{
    HelloResult, MessageResult, ProcessResult, RunEnvironmentResult, SessionStatus,
    TaskMaxProgressResult, TaskProgressResult, TaskStartedResult,
};

type Listener<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    listeners: Vec<(u64, Listener<T>)>,
}

fn lock<T>(registry: &Mutex<Registry<T>>) -> MutexGuard<'_, Registry<T>> {
    registry.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One event source with any number of independent listeners.
pub struct Emitter<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Emitter<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register `listener`. It stays registered until the returned handle is
    /// disposed or dropped.
    #[must_use = "dropping the subscription removes the listener"]
    pub fn subscribe(&self, listener: impl Fn(&T) + Send + Sync + 'static) -> Subscription {
        let id = {
            let mut registry = lock(&self.registry);
            let id = registry.next_id;
            registry.next_id += 1;
            registry.listeners.push((id, Arc::new(listener)));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    lock(&registry).listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Deliver `event` to every current listener.
    ///
    /// The listener list is snapshotted first, so listeners may subscribe or
    /// unsubscribe from inside a callback.
    pub fn emit(&self, event: &T) {
        let listeners: Vec<Listener<T>> = lock(&self.registry)
            .listeners
            .iter()
            .map(|(_, listener)| Arc::clone(listener))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    #[must_use]
    pub fn listener_count(&self) -> usize {
        lock(&self.registry).listeners.len()
    }
}

impl<T: 'static> Default for Emitter<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle that keeps a listener registered.
pub struct Subscription {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Subscription {
    pub fn dispose(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.release();
    }
}

/// A bag of subscriptions released together with their owner.
#[derive(Default)]
pub struct Subscriptions(Vec<Subscription>);

impl Subscriptions {
    pub fn push(&mut self, subscription: Subscription) {
        self.0.push(subscription);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Dispose in reverse order of registration.
    pub fn dispose(mut self) {
        while let Some(subscription) = self.0.pop() {
            subscription.dispose();
        }
    }
}

/// Every event the session publishes.
#[derive(Default)]
pub struct EventHub {
    pub status_changed: Emitter<SessionStatus>,
    pub project_activated: Emitter<PathBuf>,
    pub hello: Emitter<HelloResult>,
    pub project_resolved: Emitter<MessageResult>,
    pub project_built: Emitter<MessageResult>,
    pub project_cleaned: Emitter<MessageResult>,
    pub project_installed: Emitter<MessageResult>,
    pub log_message: Emitter<MessageResult>,
    pub warning_message: Emitter<MessageResult>,
    pub task_started: Emitter<TaskStartedResult>,
    pub task_progress: Emitter<TaskProgressResult>,
    pub task_max_progress: Emitter<TaskMaxProgressResult>,
    pub command_description: Emitter<MessageResult>,
    pub process_result: Emitter<ProcessResult>,
    pub run_environment: Emitter<RunEnvironmentResult>,
    pub error: Emitter<SessionError>,
}

impl EventHub {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}
