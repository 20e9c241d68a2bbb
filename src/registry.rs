//! Named-event listener registry.
//!
//! A generic subscribe/unsubscribe/fire primitive keyed by event name. It has
//! no knowledge of sockets; the transport uses one instance for lifecycle
//! events and alert dispatch.
//!
//! # Firing Semantics
//!
//! - Listeners run synchronously, in registration order.
//! - The listener list is snapshotted at the start of [`EventRegistry::fire`]
//!   and the lock is released before any callback runs, so callbacks may
//!   register or remove listeners (including themselves) freely.
//! - A listener removed by another callback during the same firing pass may
//!   still be invoked for that pass. Listeners added during a pass are not.
//!
//! # Example
//!
//! ```ignore
//! use controlws::EventRegistry;
//!
//! let registry = EventRegistry::<u32>::new();
//! let id = registry.on("tick", |n| println!("tick {n}"));
//! registry.fire("tick", &1);
//! registry.off(id);
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::identifiers::ListenerId;

// ============================================================================
// Types
// ============================================================================

/// Listener callback type.
pub type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// A registered callback with its handle.
struct Listener<T> {
    id: ListenerId,
    callback: Callback<T>,
}

impl<T> Clone for Listener<T> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            callback: Arc::clone(&self.callback),
        }
    }
}

/// Registry state behind the lock.
struct RegistryState<T> {
    next_id: u64,
    /// Event name -> listeners in registration order.
    listeners: FxHashMap<String, Vec<Listener<T>>>,
    /// Listener -> event name, for `off`.
    events_by_id: FxHashMap<ListenerId, String>,
}

impl<T> RegistryState<T> {
    fn remove(&mut self, id: ListenerId) -> bool {
        let Some(event_name) = self.events_by_id.remove(&id) else {
            return false;
        };

        if let Some(list) = self.listeners.get_mut(&event_name) {
            list.retain(|listener| listener.id != id);
            if list.is_empty() {
                self.listeners.remove(&event_name);
            }
        }

        true
    }
}

// ============================================================================
// EventRegistry
// ============================================================================

/// Named-event pub/sub registry.
///
/// Cloning yields another handle to the same registry.
pub struct EventRegistry<T> {
    state: Arc<Mutex<RegistryState<T>>>,
}

impl<T> Clone for EventRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T: 'static> Default for EventRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: 'static> EventRegistry<T> {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                next_id: 0,
                listeners: FxHashMap::default(),
                events_by_id: FxHashMap::default(),
            })),
        }
    }

    /// Registers a listener and returns its handle.
    pub fn on<F>(&self, event_name: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.register(event_name.into(), |_| -> Callback<T> { Arc::new(callback) })
    }

    /// Registers a listener that removes itself after its first invocation.
    ///
    /// Delivery is at most once, even if the event is fired again before
    /// the removal takes effect.
    pub fn one<F>(&self, event_name: impl Into<String>, callback: F) -> ListenerId
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let state = Arc::downgrade(&self.state);

        self.register(event_name.into(), move |id| -> Callback<T> {
            let fired = AtomicBool::new(false);
            Arc::new(move |data: &T| {
                if fired.swap(true, Ordering::AcqRel) {
                    return;
                }
                if let Some(state) = state.upgrade() {
                    state.lock().remove(id);
                }
                callback(data);
            })
        })
    }

    /// Removes a listener.
    ///
    /// Unknown or already-removed IDs are ignored.
    pub fn off(&self, id: ListenerId) {
        if self.state.lock().remove(id) {
            trace!(listener_id = %id, "Listener removed");
        }
    }

    /// Invokes every listener registered for `event_name`, in registration
    /// order. Returns the number of listeners in the snapshot.
    pub fn fire(&self, event_name: &str, data: &T) -> usize {
        let snapshot = match self.state.lock().listeners.get(event_name) {
            Some(list) => list.clone(),
            None => return 0,
        };

        for listener in &snapshot {
            (listener.callback)(data);
        }

        snapshot.len()
    }

    /// Returns `true` if at least one listener is registered for the event.
    #[must_use]
    pub fn is_listener_for(&self, event_name: &str) -> bool {
        self.state.lock().listeners.contains_key(event_name)
    }

    /// Returns the number of listeners registered for the event.
    #[must_use]
    pub fn listener_count(&self, event_name: &str) -> usize {
        self.state
            .lock()
            .listeners
            .get(event_name)
            .map_or(0, Vec::len)
    }

    /// Removes every listener. Listener IDs are not reused afterwards.
    pub fn cancel_all(&self) {
        let mut state = self.state.lock();
        state.listeners.clear();
        state.events_by_id.clear();
    }

    fn register(
        &self,
        event_name: String,
        make_callback: impl FnOnce(ListenerId) -> Callback<T>,
    ) -> ListenerId {
        let mut state = self.state.lock();

        let id = ListenerId::new(state.next_id);
        state.next_id += 1;

        let callback = make_callback(id);
        state.events_by_id.insert(id, event_name.clone());
        state
            .listeners
            .entry(event_name)
            .or_default()
            .push(Listener { id, callback });

        id
    }
}

// ============================================================================
// Tests
// ============================================================================
