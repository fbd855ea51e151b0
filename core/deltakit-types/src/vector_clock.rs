//! Vector clock: a [`Clock`] implementation with genuine concurrency.
//!
//! Unlike the scalar clock, vector stamps are only partially ordered: two
//! stamps advanced by different actors are concurrent, which exercises the
//! tie-break and multi-value paths of every CRDT. The CRDTs themselves are
//! generic over the clock, so this type plugs in without any changes there.

use crate::clock::Clock;
use crate::codec::{Decoder, Encoder, Packable};
use crate::error::{CrdtError, CrdtResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A vector timestamp: per-actor logical times.
///
/// `a` is later than `b` iff `a` is at least `b` for every actor and
/// strictly greater for at least one. Stamps that each lead in a different
/// actor are concurrent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorStamp {
    entries: BTreeMap<Vec<u8>, u64>,
}

impl VectorStamp {
    pub fn get(&self, actor: &[u8]) -> u64 {
        self.entries.get(actor).copied().unwrap_or(0)
    }

    /// True iff `self >= other` for every actor.
    fn dominates(&self, other: &Self) -> bool {
        other
            .entries
            .iter()
            .all(|(actor, time)| self.get(actor) >= *time)
    }
}

impl Packable for VectorStamp {
    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_seq(|seq| {
            for (actor, time) in &self.entries {
                seq.put_bytes(actor);
                seq.put_bytes(&time.to_be_bytes());
            }
        });
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let mut seq = dec.take_seq()?;
        let mut entries = BTreeMap::new();
        while !seq.is_empty() {
            let actor = seq.take_bytes()?;
            let time = u64::unpack(&seq.take_bytes()?)?;
            entries.insert(actor, time);
        }
        dec.finish()?;
        Ok(Self { entries })
    }
}

/// A vector clock bound to one local actor.
///
/// All replicas of a CRDT instance share the clock `uuid`; each replica
/// advances its own `actor` component. Two replicas writing without having
/// seen each other produce concurrent stamps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    uuid: Vec<u8>,
    actor: Vec<u8>,
    current: VectorStamp,
}

impl VectorClock {
    /// Creates a clock for `actor` on the instance identified by `uuid`.
    pub fn new(uuid: impl Into<Vec<u8>>, actor: impl Into<Vec<u8>>) -> CrdtResult<Self> {
        let uuid = uuid.into();
        let actor = actor.into();
        if uuid.is_empty() {
            return Err(CrdtError::Value("clock uuid must not be empty".into()));
        }
        if actor.is_empty() {
            return Err(CrdtError::Value("clock actor must not be empty".into()));
        }
        let mut current = VectorStamp::default();
        current.entries.insert(actor.clone(), 1);
        Ok(Self { uuid, actor, current })
    }

    pub fn actor(&self) -> &[u8] {
        &self.actor
    }
}

impl Clock for VectorClock {
    type Timestamp = VectorStamp;

    fn uuid(&self) -> &[u8] {
        &self.uuid
    }

    fn read(&self) -> VectorStamp {
        self.current.clone()
    }

    fn update(&mut self, remote: &VectorStamp) -> VectorStamp {
        for (actor, time) in &remote.entries {
            let entry = self.current.entries.entry(actor.clone()).or_insert(0);
            if *time > *entry {
                *entry = *time;
            }
        }
        let own = self.current.entries.entry(self.actor.clone()).or_insert(0);
        *own += 1;
        self.current.clone()
    }

    fn is_later(a: &VectorStamp, b: &VectorStamp) -> bool {
        a.dominates(b) && a != b
    }

    fn default_ts() -> VectorStamp {
        VectorStamp::default()
    }

    fn wrap_ts(ts: &VectorStamp) -> Value {
        Value::Bytes(ts.pack())
    }

    fn unwrap_ts(value: &Value) -> CrdtResult<VectorStamp> {
        match value {
            Value::Bytes(bytes) => VectorStamp::unpack(bytes),
            other => Err(CrdtError::Type(format!(
                "vector timestamp must be a bytes value, found {}",
                other.kind_name()
            ))),
        }
    }

    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_bytes(&self.uuid);
        enc.put_bytes(&self.actor);
        enc.put_bytes(&self.current.pack());
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let uuid = dec.take_bytes()?;
        let actor = dec.take_bytes()?;
        let current = VectorStamp::unpack(&dec.take_bytes()?)?;
        dec.finish()?;
        if uuid.is_empty() {
            return Err(CrdtError::Value("clock uuid must not be empty".into()));
        }
        if actor.is_empty() {
            return Err(CrdtError::Value("clock actor must not be empty".into()));
        }
        Ok(Self { uuid, actor, current })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ClockOrdering;

    fn clock(actor: &[u8]) -> VectorClock {
        VectorClock::new(b"instance".to_vec(), actor.to_vec()).expect("valid ids")
    }

    #[test]
    fn independent_actors_produce_concurrent_stamps() {
        let a = clock(b"a").read();
        let b = clock(b"b").read();
        assert!(VectorClock::are_concurrent(&a, &b));
        assert_eq!(VectorClock::compare(&a, &b), ClockOrdering::Concurrent);
    }

    #[test]
    fn update_produces_a_strictly_later_stamp() {
        let mut a = clock(b"a");
        let before = a.read();
        let remote = clock(b"b").read();
        let next = a.update(&remote);
        assert!(VectorClock::is_later(&next, &before));
        assert!(VectorClock::is_later(&next, &remote));
    }

    #[test]
    fn merged_histories_become_comparable() {
        let mut a = clock(b"a");
        let b = clock(b"b");

        // After a sees b's stamp, a's next stamp dominates both.
        let merged = a.update(&b.read());
        assert_eq!(
            VectorClock::compare(&merged, &b.read()),
            ClockOrdering::Later
        );
        assert_eq!(
            VectorClock::compare(&b.read(), &merged),
            ClockOrdering::Earlier
        );
    }

    #[test]
    fn stamp_round_trips_through_value_form() {
        let mut a = clock(b"a");
        a.update(&clock(b"b").read());
        let stamp = a.read();
        let wrapped = VectorClock::wrap_ts(&stamp);
        assert_eq!(VectorClock::unwrap_ts(&wrapped).unwrap(), stamp);
    }

    #[test]
    fn clock_pack_round_trip() {
        let mut a = clock(b"a");
        a.update(&clock(b"b").read());
        let restored = VectorClock::unpack(&a.pack()).unwrap();
        assert_eq!(restored, a);
    }

    #[test]
    fn empty_ids_are_rejected() {
        assert!(VectorClock::new(Vec::new(), b"a".to_vec()).is_err());
        assert!(VectorClock::new(b"u".to_vec(), Vec::new()).is_err());
    }
}
