//! Pre-apply listener dispatch.
//!
//! Every CRDT notifies its listeners of each state update after validation
//! and before mutation. A listener that returns an error aborts the apply
//! with the CRDT unchanged.
//!
//! Closures have no identity in Rust, so `add` hands back a [`ListenerId`]
//! token and removal goes by token rather than by function reference.

use deltakit_types::{CrdtResult, StateUpdate};
use std::fmt;

/// Callback invoked with each validated state update before it is applied.
pub type ListenerFn<T> = Box<dyn Fn(&StateUpdate<T>) -> CrdtResult<()>>;

/// Token identifying a registered listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// An ordered registry of update listeners.
pub struct Listeners<T> {
    next_id: u64,
    entries: Vec<(ListenerId, ListenerFn<T>)>,
}

impl<T> Listeners<T> {
    pub fn new() -> Self {
        Self {
            next_id: 0,
            entries: Vec::new(),
        }
    }

    /// Registers a listener, returning its removal token.
    pub fn add(&mut self, listener: ListenerFn<T>) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, listener));
        id
    }

    /// Removes a previously registered listener. Returns false if the token
    /// is unknown.
    pub fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    /// Invokes every listener in registration order, stopping at the first
    /// error.
    pub fn invoke(&self, update: &StateUpdate<T>) -> CrdtResult<()> {
        for (_, listener) in &self.entries {
            listener(update)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Listeners<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("count", &self.entries.len())
            .finish()
    }
}

/// Cloning a CRDT clones its replicated state. Listeners are observer
/// registrations on one in-process instance, not state, so a clone starts
/// with none.
impl<T> Clone for Listeners<T> {
    fn clone(&self) -> Self {
        Self::new()
    }
}
