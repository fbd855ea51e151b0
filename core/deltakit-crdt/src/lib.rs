//! Delta-state CRDT implementations.
//!
//! This crate provides Conflict-free Replicated Data Types that replicate by
//! exchanging small [`StateUpdate`] deltas instead of full state:
//!
//! - [`Counter`], [`PnCounter`], [`CounterSet`] — numeric CRDTs
//! - [`GSet`], [`OrSet`] — grow-only and observed-remove sets
//! - [`LwwRegister`], [`LwwMap`] — last-writer-wins register and map
//! - [`MvRegister`], [`MvMap`] — multi-value register and map
//! - [`RgArray`] — replicated growable array
//! - [`FiArray`] — fractionally-indexed ordered list
//! - [`CausalTree`] — parent-linked ordered list
//!
//! All CRDTs here satisfy the delta-CRDT laws: applying the same update
//! twice is a no-op, applying two updates in either order yields the same
//! observable state, and any replicas that have received the same update set
//! converge to byte-identical `pack()` output. Reconciliation runs over
//! [`Crdt::history`], [`Crdt::checksums`], and the Merkle-tree diff exposed
//! by [`Crdt::get_merkle_history`] / [`Crdt::resolve_merkle_histories`].
//!
//! Each CRDT instance is single-threaded: `update`, mutators, `read`, and
//! `history` must not run concurrently on one instance. Distinct instances
//! are independent.

mod causal_tree;
mod checksum;
mod counter;
mod counter_set;
mod events;
mod fi_array;
mod gset;
mod lww_map;
mod lww_register;
mod merkle;
mod mv_map;
mod mv_register;
mod orset;
mod pn_counter;
mod rga;
mod traits;

pub use causal_tree::{CausalTree, CtNode};
pub use counter::Counter;
pub use counter_set::CounterSet;
pub use events::{ListenerFn, ListenerId, Listeners};
pub use fi_array::{FiArray, FiaItem, MoveTarget};
pub use gset::GSet;
pub use lww_map::LwwMap;
pub use lww_register::LwwRegister;
pub use merkle::MerkleHistory;
pub use mv_map::MvMap;
pub use mv_register::MvRegister;
pub use orset::OrSet;
pub use pn_counter::PnCounter;
pub use rga::RgArray;
pub use traits::{Crdt, ListCrdt, TimestampOf};

pub use deltakit_types::{
    Clock, ClockOrdering, CrdtError, CrdtResult, CustomValue, Decoder, Encoder, Packable, Payload,
    RgaItem, ScalarClock, SetOp, StateUpdate, Value, VectorClock, VectorStamp,
};
