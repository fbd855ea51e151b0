//! Logical clocks.
//!
//! Every CRDT owns one clock. All replicas of a CRDT instance share the
//! clock's uuid, which binds state updates to that instance: an update
//! whose uuid differs is rejected.
//!
//! The [`Clock`] trait captures the contract; [`ScalarClock`] is the default
//! Lamport implementation. Alternative clocks (vector clocks that produce
//! genuinely concurrent timestamps, hybrid clocks) plug in through the same
//! trait without touching the CRDTs.

use crate::codec::{Decoder, Encoder, Packable};
use crate::error::{CrdtError, CrdtResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Relation between two timestamps under a clock's order.
///
/// `Concurrent` covers both "equal" and "incomparable": in either case
/// neither timestamp is later, and tie-break rules decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// The first timestamp is earlier than the second.
    Earlier,
    /// Neither timestamp is later than the other.
    Concurrent,
    /// The first timestamp is later than the second.
    Later,
}

/// The logical-clock contract.
///
/// `read` never decreases on a replica, and `update(x)` returns a timestamp
/// strictly later than both the pre-call `read()` and `x`.
pub trait Clock: Clone + fmt::Debug {
    /// The timestamp type this clock produces.
    type Timestamp: Clone + Eq + fmt::Debug + Packable;

    /// The uuid shared by all replicas of the owning CRDT instance.
    fn uuid(&self) -> &[u8];

    /// Current timestamp.
    fn read(&self) -> Self::Timestamp;

    /// Merges a foreign timestamp and returns the advanced local timestamp.
    fn update(&mut self, remote: &Self::Timestamp) -> Self::Timestamp;

    /// True iff `a` is strictly later than `b`.
    fn is_later(a: &Self::Timestamp, b: &Self::Timestamp) -> bool;

    /// True iff neither timestamp is later than the other.
    fn are_concurrent(a: &Self::Timestamp, b: &Self::Timestamp) -> bool {
        !Self::is_later(a, b) && !Self::is_later(b, a)
    }

    /// Three-way comparison over the clock's order.
    fn compare(a: &Self::Timestamp, b: &Self::Timestamp) -> ClockOrdering {
        if Self::is_later(a, b) {
            ClockOrdering::Later
        } else if Self::is_later(b, a) {
            ClockOrdering::Earlier
        } else {
            ClockOrdering::Concurrent
        }
    }

    /// The "never updated" timestamp, earlier than any produced one.
    fn default_ts() -> Self::Timestamp;

    /// Wraps a timestamp as a [`Value`] for storage inside payloads.
    fn wrap_ts(ts: &Self::Timestamp) -> Value;

    /// Recovers a timestamp from its [`Value`] form.
    fn unwrap_ts(value: &Value) -> CrdtResult<Self::Timestamp>;

    /// Canonical byte form of the clock state.
    fn pack(&self) -> Vec<u8>;

    /// Restores a clock from canonical bytes.
    fn unpack(data: &[u8]) -> CrdtResult<Self>;
}

/// A Lamport scalar clock.
///
/// Timestamps are plain `u64` counters with a total order, so two scalar
/// stamps are never concurrent unless equal. `update(x)` advances the
/// counter to `max(counter, x) + 1`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalarClock {
    counter: u64,
    uuid: Vec<u8>,
}

impl ScalarClock {
    /// Creates a clock with a fresh random uuid.
    pub fn new() -> Self {
        Self {
            counter: 1,
            uuid: Uuid::new_v4().as_bytes().to_vec(),
        }
    }

    /// Creates a clock bound to an existing instance uuid.
    ///
    /// All replicas of one CRDT instance must construct their clocks with
    /// the same uuid.
    pub fn with_uuid(uuid: impl Into<Vec<u8>>) -> CrdtResult<Self> {
        let uuid = uuid.into();
        if uuid.is_empty() {
            return Err(CrdtError::Value("clock uuid must not be empty".into()));
        }
        Ok(Self { counter: 1, uuid })
    }

    /// Current counter value, exposed for diagnostics.
    pub fn counter(&self) -> u64 {
        self.counter
    }
}

impl Default for ScalarClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ScalarClock {
    type Timestamp = u64;

    fn uuid(&self) -> &[u8] {
        &self.uuid
    }

    fn read(&self) -> u64 {
        self.counter
    }

    fn update(&mut self, remote: &u64) -> u64 {
        self.counter = self.counter.max(*remote).saturating_add(1);
        self.counter
    }

    fn is_later(a: &u64, b: &u64) -> bool {
        a > b
    }

    fn default_ts() -> u64 {
        0
    }

    fn wrap_ts(ts: &u64) -> Value {
        Value::Int(*ts as i64)
    }

    fn unwrap_ts(value: &Value) -> CrdtResult<u64> {
        match value {
            Value::Int(i) if *i >= 0 => Ok(*i as u64),
            Value::Int(i) => Err(CrdtError::Value(format!("negative scalar timestamp {i}"))),
            other => Err(CrdtError::Type(format!(
                "scalar timestamp must be an int value, found {}",
                other.kind_name()
            ))),
        }
    }

    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_bytes(&self.counter.to_be_bytes());
        enc.put_bytes(&self.uuid);
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let counter_bytes = dec.take_bytes()?;
        let counter = u64::unpack(&counter_bytes)?;
        let uuid = dec.take_bytes()?;
        dec.finish()?;
        if uuid.is_empty() {
            return Err(CrdtError::Value("clock uuid must not be empty".into()));
        }
        Ok(Self { counter, uuid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_starts_at_one() {
        let clock = ScalarClock::new();
        assert_eq!(clock.read(), 1);
    }

    #[test]
    fn update_advances_past_both_inputs() {
        let mut clock = ScalarClock::new();
        let before = clock.read();
        let next = clock.update(&10);
        assert!(next > before);
        assert!(next > 10);
        assert_eq!(next, 11);

        // A stale remote timestamp still advances the clock.
        let before = clock.read();
        let next = clock.update(&2);
        assert!(next > before);
        assert!(next > 2);
    }

    #[test]
    fn scalar_timestamps_are_totally_ordered() {
        assert!(ScalarClock::is_later(&5, &3));
        assert!(!ScalarClock::is_later(&3, &5));
        assert!(ScalarClock::are_concurrent(&4, &4));
        assert_eq!(ScalarClock::compare(&5, &3), ClockOrdering::Later);
        assert_eq!(ScalarClock::compare(&3, &5), ClockOrdering::Earlier);
        assert_eq!(ScalarClock::compare(&4, &4), ClockOrdering::Concurrent);
    }

    #[test]
    fn wrap_unwrap_round_trip() {
        let wrapped = ScalarClock::wrap_ts(&42);
        assert_eq!(wrapped, Value::Int(42));
        assert_eq!(ScalarClock::unwrap_ts(&wrapped).unwrap(), 42);
        assert!(ScalarClock::unwrap_ts(&Value::str("nope")).is_err());
    }

    #[test]
    fn pack_round_trip() {
        let mut clock = ScalarClock::with_uuid(b"shared-instance".to_vec()).unwrap();
        clock.update(&7);
        let restored = ScalarClock::unpack(&clock.pack()).unwrap();
        assert_eq!(restored, clock);
    }

    #[test]
    fn empty_uuid_is_rejected() {
        assert!(matches!(
            ScalarClock::with_uuid(Vec::new()),
            Err(CrdtError::Value(_))
        ));
    }
}
