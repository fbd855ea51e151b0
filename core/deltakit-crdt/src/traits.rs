//! The common CRDT surface.

use crate::events::{ListenerFn, ListenerId, Listeners};
use crate::merkle::{self, MerkleHistory};
use deltakit_types::{Clock, CrdtResult, StateUpdate, Value};

/// Shorthand for a CRDT's timestamp type.
pub type TimestampOf<K> = <<K as Crdt>::Clock as Clock>::Timestamp;

/// Operations every CRDT in this crate supports.
///
/// `update` is atomic: the delta is validated, listeners run, and only then
/// is state mutated. Any error along the way leaves the CRDT unchanged.
/// `read` takes `&mut self` because the list CRDTs refresh ordering caches
/// lazily; the view it returns is still a pure function of the applied
/// update set.
pub trait Crdt: Sized {
    /// The logical clock driving this CRDT.
    type Clock: Clock;
    /// The observable view produced by [`Crdt::read`].
    type View;

    fn clock(&self) -> &Self::Clock;

    /// The uuid binding updates to this CRDT instance.
    fn clock_uuid(&self) -> &[u8] {
        self.clock().uuid()
    }

    /// Returns the eventually consistent data view.
    fn read(&mut self) -> Self::View;

    /// Applies a state update and returns `self` for chaining.
    fn update(
        &mut self,
        update: &StateUpdate<<Self::Clock as Clock>::Timestamp>,
    ) -> CrdtResult<&mut Self>;

    /// Returns a set of updates whose replay on an empty CRDT with the same
    /// clock uuid reconstructs the observable state of the requested range.
    /// Histories are compacted where convergence permits, so the returned
    /// deltas need not be the literal inputs.
    fn history(
        &self,
        from_ts: Option<&<Self::Clock as Clock>::Timestamp>,
        until_ts: Option<&<Self::Clock as Clock>::Timestamp>,
    ) -> Vec<StateUpdate<<Self::Clock as Clock>::Timestamp>>;

    /// Small summary of the delta set in the requested range. Equal
    /// checksums over the same range imply identical delta sets with
    /// overwhelming probability.
    fn checksums(
        &self,
        from_ts: Option<&<Self::Clock as Clock>::Timestamp>,
        until_ts: Option<&<Self::Clock as Clock>::Timestamp>,
    ) -> Vec<u64>;

    /// Canonical byte form of the full CRDT state, listeners excluded.
    fn pack(&self) -> Vec<u8>;

    /// Restores a CRDT from [`Crdt::pack`] output.
    fn unpack(data: &[u8]) -> CrdtResult<Self>;

    fn listeners(&self) -> &Listeners<<Self::Clock as Clock>::Timestamp>;

    fn listeners_mut(&mut self) -> &mut Listeners<<Self::Clock as Clock>::Timestamp>;

    /// Registers a listener called with each validated update before it is
    /// applied. Returns the token used for removal.
    fn add_listener(
        &mut self,
        listener: ListenerFn<<Self::Clock as Clock>::Timestamp>,
    ) -> ListenerId {
        self.listeners_mut().add(listener)
    }

    /// Removes a previously registered listener.
    fn remove_listener(&mut self, id: ListenerId) -> bool {
        self.listeners_mut().remove(id)
    }

    /// Invokes all listeners in registration order; the first error aborts.
    fn invoke_listeners(
        &self,
        update: &StateUpdate<<Self::Clock as Clock>::Timestamp>,
    ) -> CrdtResult<()> {
        self.listeners().invoke(update)
    }

    /// Content-addressed history: `(root, sorted leaf ids, id → packed
    /// update)`.
    fn get_merkle_history(&self) -> MerkleHistory {
        merkle::build_history(&self.history(None, None))
    }

    /// Given a peer's Merkle root and leaf ids, returns the content ids of
    /// the peer updates missing locally. The caller requests those packed
    /// updates and applies them.
    fn resolve_merkle_histories(
        &self,
        peer_root: &[u8],
        peer_leaf_ids: &[Vec<u8>],
    ) -> CrdtResult<Vec<Vec<u8>>> {
        let local = self.get_merkle_history();
        merkle::resolve(&local, peer_root, peer_leaf_ids)
    }
}

/// The list surface shared by the ordered CRDTs (RGArray, FIArray,
/// CausalTree).
pub trait ListCrdt: Crdt {
    /// Appends `item` to the end of the list view. Returns every update the
    /// operation produced (a causal-tree `put_first` on a forked tree can
    /// emit several).
    fn list_append(
        &mut self,
        item: Value,
        writer: Value,
    ) -> CrdtResult<Vec<StateUpdate<<Self::Clock as Clock>::Timestamp>>>;

    /// Removes the item at `index` in the list view.
    fn list_remove(
        &mut self,
        index: usize,
        writer: Value,
    ) -> CrdtResult<StateUpdate<<Self::Clock as Clock>::Timestamp>>;

    /// Position of `item` in the list view.
    fn position_of(&mut self, item: &Value) -> CrdtResult<usize>;
}
