//! Foundation types for the deltakit CRDT library.
//!
//! This crate provides the building blocks shared by every CRDT in
//! `deltakit-crdt`:
//!
//! - [`CrdtError`] / [`CrdtResult`] — the library-wide error taxonomy
//! - [`Clock`] — the logical-clock contract, with [`ScalarClock`] as the
//!   default Lamport implementation
//! - [`Value`] — the serializable, hashable, totally-ordered payload carrier
//! - [`Encoder`] / [`Decoder`] / [`Packable`] — the canonical binary codec
//! - [`StateUpdate`] / [`Payload`] — the delta envelope exchanged between
//!   replicas
//!
//! Canonical encoding is load-bearing: two replicas holding the same logical
//! state must produce byte-identical `pack()` output, because checksums and
//! Merkle roots are computed over those bytes.

mod clock;
mod codec;
mod error;
mod update;
mod value;
mod vector_clock;

pub use clock::{Clock, ClockOrdering, ScalarClock};
pub use codec::{Decoder, Encoder, Packable};
pub use error::{CrdtError, CrdtResult};
pub use update::{Payload, RgaItem, SetOp, StateUpdate};
pub use value::{CustomValue, Value};
pub use vector_clock::{VectorClock, VectorStamp};
