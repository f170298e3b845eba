//! Output listener fan-out.
//!
//! Listeners are called synchronously from the handle's reader, in the order
//! events are observed, with no supervisor lock held.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Token returned by `on_output`, used to unsubscribe.
pub type ListenerId = u64;

/// Callback invoked for every output event of a supervisor.
pub type OutputHandler<E> = Arc<dyn Fn(&E) + Send + Sync>;

pub(crate) struct ListenerSet<E> {
    next_id: AtomicU64,
    listeners: RwLock<Vec<(ListenerId, OutputHandler<E>)>>,
}

impl<E> ListenerSet<E> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            listeners: RwLock::new(Vec::new()),
        }
    }

    pub(crate) fn add(&self, handler: OutputHandler<E>) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push((id, handler));
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        let before = listeners.len();
        listeners.retain(|(existing, _)| *existing != id);
        listeners.len() != before
    }

    pub(crate) fn emit(&self, event: &E) {
        // Snapshot so a listener may (un)subscribe from inside its callback.
        let handlers: Vec<OutputHandler<E>> = self
            .listeners
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        for handler in handlers {
            handler(event);
        }
    }
}
