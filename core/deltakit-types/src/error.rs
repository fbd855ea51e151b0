//! Error types for the deltakit core.

use thiserror::Error;

/// Result type for CRDT operations.
pub type CrdtResult<T> = Result<T, CrdtError>;

/// Errors raised by the CRDT core.
///
/// A failed `update` leaves the CRDT unchanged: every validation runs before
/// any state is mutated.
#[derive(Debug, Error)]
pub enum CrdtError {
    /// An argument violates the declared type contract.
    #[error("type error: {0}")]
    Type(String),

    /// An argument has the right type but is out of range or malformed.
    #[error("value error: {0}")]
    Value(String),

    /// A state update was created for a different CRDT instance.
    #[error("clock uuid mismatch: update carries {update}, CRDT clock is {local}")]
    Mismatch {
        /// Hex-rendered clock uuid carried by the rejected update.
        update: String,
        /// Hex-rendered clock uuid of the receiving CRDT.
        local: String,
    },

    /// Truncated or malformed bytes during decoding.
    #[error("codec error: {0}")]
    Codec(String),

    /// An operation referenced an item that is not present.
    #[error("usage error: {0}")]
    Usage(String),
}

impl CrdtError {
    /// Builds a [`CrdtError::Mismatch`] from the two raw clock uuids.
    pub fn mismatch(update: &[u8], local: &[u8]) -> Self {
        fn hex(bytes: &[u8]) -> String {
            bytes.iter().map(|b| format!("{b:02x}")).collect()
        }
        CrdtError::Mismatch {
            update: hex(update),
            local: hex(local),
        }
    }
}
