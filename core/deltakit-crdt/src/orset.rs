//! Observed-remove set CRDT.

use crate::checksum::{crc_over_sorted, in_range};
use crate::events::Listeners;
use crate::traits::Crdt;
use deltakit_types::{
    Clock, CrdtError, CrdtResult, Decoder, Encoder, Packable, Payload, ScalarClock, SetOp,
    StateUpdate, Value,
};
use std::collections::BTreeMap;
use std::fmt;

/// The mergeable core of an observed-remove set.
///
/// Two maps track, per member, the latest observe and the latest remove
/// timestamp. A member is visible while its observe entry is live. The
/// transition rules are add-biased: an observe concurrent with (or equal
/// to) the standing remove wins; a remove must be strictly later than the
/// standing observe to hide the member.
///
/// Generic over the member type so the growable array can key items
/// directly; plain sets use `Value` members.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct OrSetState<M, T> {
    pub(crate) observed: BTreeMap<M, T>,
    pub(crate) removed: BTreeMap<M, T>,
}

impl<M, T> Default for OrSetState<M, T>
where
    M: Ord + Clone + fmt::Debug,
    T: Clone + Eq + fmt::Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<M, T> OrSetState<M, T>
where
    M: Ord + Clone + fmt::Debug,
    T: Clone + Eq + fmt::Debug,
{
    pub(crate) fn new() -> Self {
        Self {
            observed: BTreeMap::new(),
            removed: BTreeMap::new(),
        }
    }

    /// Applies an observe or remove at `ts`. Returns true when the visible
    /// membership of `member` may have changed.
    pub(crate) fn apply<C: Clock<Timestamp = T>>(&mut self, op: SetOp, member: &M, ts: &T) -> bool {
        match op {
            SetOp::Observe => {
                let blocked = self
                    .removed
                    .get(member)
                    .map(|removed_ts| C::is_later(removed_ts, ts))
                    .unwrap_or(false);
                if blocked {
                    return false;
                }
                let stamp = match self.observed.get(member) {
                    Some(existing) if !C::is_later(ts, existing) => existing.clone(),
                    _ => ts.clone(),
                };
                self.observed.insert(member.clone(), stamp);
                self.removed.remove(member);
                true
            }
            SetOp::Remove => {
                let blocked = self
                    .observed
                    .get(member)
                    .map(|observed_ts| !C::is_later(ts, observed_ts))
                    .unwrap_or(false);
                if blocked {
                    return false;
                }
                let stamp = match self.removed.get(member) {
                    Some(existing) if !C::is_later(ts, existing) => existing.clone(),
                    _ => ts.clone(),
                };
                self.removed.insert(member.clone(), stamp);
                self.observed.remove(member);
                true
            }
        }
    }

    pub(crate) fn contains(&self, member: &M) -> bool {
        self.observed.contains_key(member)
    }
}

impl<M, T> OrSetState<M, T>
where
    M: Ord + Clone + fmt::Debug + Packable,
    T: Clone + Eq + fmt::Debug + Packable,
{
    /// `(op, member, ts)` triples for the range, observes first, in member
    /// order. This is the raw material for history in every composite that
    /// embeds an or-set.
    pub(crate) fn entries_in_range<C: Clock<Timestamp = T>>(
        &self,
        from_ts: Option<&T>,
        until_ts: Option<&T>,
    ) -> Vec<(SetOp, &M, &T)> {
        let observed = self
            .observed
            .iter()
            .filter(|(_, ts)| in_range::<C>(ts, from_ts, until_ts))
            .map(|(member, ts)| (SetOp::Observe, member, ts));
        let removed = self
            .removed
            .iter()
            .filter(|(_, ts)| in_range::<C>(ts, from_ts, until_ts))
            .map(|(member, ts)| (SetOp::Remove, member, ts));
        observed.chain(removed).collect()
    }

    /// Checksums: observed count, removed count, then one crc per side.
    pub(crate) fn checksums<C: Clock<Timestamp = T>>(
        &self,
        from_ts: Option<&T>,
        until_ts: Option<&T>,
    ) -> Vec<u64> {
        let mut observed_packed = Vec::new();
        let mut removed_packed = Vec::new();
        for (op, member, ts) in self.entries_in_range::<C>(from_ts, until_ts) {
            let mut blob = member.pack();
            blob.extend_from_slice(&ts.pack());
            match op {
                SetOp::Observe => observed_packed.push(blob),
                SetOp::Remove => removed_packed.push(blob),
            }
        }
        vec![
            observed_packed.len() as u64,
            removed_packed.len() as u64,
            u64::from(crc_over_sorted(observed_packed)),
            u64::from(crc_over_sorted(removed_packed)),
        ]
    }

    pub(crate) fn encode_into(&self, enc: &mut Encoder) {
        enc.put_seq(|seq| {
            for (member, ts) in &self.observed {
                seq.put_bytes(&member.pack());
                seq.put_bytes(&ts.pack());
            }
        });
        enc.put_seq(|seq| {
            for (member, ts) in &self.removed {
                seq.put_bytes(&member.pack());
                seq.put_bytes(&ts.pack());
            }
        });
    }

    pub(crate) fn decode_from(dec: &mut Decoder<'_>) -> CrdtResult<Self> {
        let mut state = Self::new();
        let mut observed = dec.take_seq()?;
        while !observed.is_empty() {
            let member = M::unpack(&observed.take_bytes()?)?;
            let ts = T::unpack(&observed.take_bytes()?)?;
            state.observed.insert(member, ts);
        }
        let mut removed = dec.take_seq()?;
        while !removed.is_empty() {
            let member = M::unpack(&removed.take_bytes()?)?;
            let ts = T::unpack(&removed.take_bytes()?)?;
            state.removed.insert(member, ts);
        }
        Ok(state)
    }
}

/// An observed-remove set with add-biased semantics: when an observe and a
/// remove of the same member tie on timestamp, the observe wins.
#[derive(Debug, Clone)]
pub struct OrSet<C: Clock = ScalarClock> {
    clock: C,
    state: OrSetState<Value, C::Timestamp>,
    listeners: Listeners<C::Timestamp>,
}

impl OrSet<ScalarClock> {
    pub fn new() -> Self {
        Self::with_clock(ScalarClock::new())
    }
}

impl Default for OrSet<ScalarClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> OrSet<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: OrSetState::new(),
            listeners: Listeners::new(),
        }
    }

    /// Adds `member` to the observed set and returns the update to
    /// propagate.
    pub fn observe(&mut self, member: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        self.emit(SetOp::Observe, member)
    }

    /// Adds `member` to the removed set. Removing a member that was never
    /// observed is permitted and pre-empts a later-arriving observe with an
    /// earlier timestamp.
    pub fn remove(&mut self, member: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        self.emit(SetOp::Remove, member)
    }

    fn emit(&mut self, op: SetOp, member: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::SetMember { op, member },
        );
        self.update(&update)?;
        Ok(update)
    }

    pub fn contains(&self, member: &Value) -> bool {
        self.state.contains(member)
    }

    pub fn len(&self) -> usize {
        self.state.observed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.observed.is_empty()
    }
}

impl<C: Clock> Crdt for OrSet<C> {
    type Clock = C;
    type View = Vec<Value>;

    fn clock(&self) -> &C {
        &self.clock
    }

    /// Visible members in canonical order.
    fn read(&mut self) -> Vec<Value> {
        self.state.observed.keys().cloned().collect()
    }

    fn update(&mut self, update: &StateUpdate<C::Timestamp>) -> CrdtResult<&mut Self> {
        if update.clock_uuid != self.clock.uuid() {
            return Err(CrdtError::mismatch(&update.clock_uuid, self.clock.uuid()));
        }
        let (op, member) = match &update.data {
            Payload::SetMember { op, member } => (*op, member),
            other => {
                return Err(CrdtError::Type(format!(
                    "orset update requires a set-member payload, found {}",
                    other.kind_name()
                )))
            }
        };

        self.invoke_listeners(update)?;
        self.state.apply::<C>(op, member, &update.ts);
        self.clock.update(&update.ts);
        Ok(self)
    }

    fn history(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<C::Timestamp>> {
        self.state
            .entries_in_range::<C>(from_ts, until_ts)
            .into_iter()
            .map(|(op, member, ts)| {
                StateUpdate::new(
                    self.clock.uuid().to_vec(),
                    ts.clone(),
                    Payload::SetMember { op, member: member.clone() },
                )
            })
            .collect()
    }

    fn checksums(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<u64> {
        self.state.checksums::<C>(from_ts, until_ts)
    }

    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_bytes(&self.clock.pack());
        self.state.encode_into(&mut enc);
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let clock = C::unpack(&dec.take_bytes()?)?;
        let state = OrSetState::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(Self {
            clock,
            state,
            listeners: Listeners::new(),
        })
    }

    fn listeners(&self) -> &Listeners<C::Timestamp> {
        &self.listeners
    }

    fn listeners_mut(&mut self) -> &mut Listeners<C::Timestamp> {
        &mut self.listeners
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn observe_then_remove_hides_member() {
        let mut set = OrSet::new();
        set.observe(Value::str("x")).unwrap();
        assert!(set.contains(&Value::str("x")));
        set.remove(Value::str("x")).unwrap();
        assert!(!set.contains(&Value::str("x")));
    }

    #[test]
    fn observe_wins_timestamp_ties() {
        let uuid = b"shared".to_vec();
        let mut a = OrSet::with_clock(ScalarClock::with_uuid(uuid.clone()).unwrap());
        let mut b = OrSet::with_clock(ScalarClock::with_uuid(uuid).unwrap());

        let add = a.observe(Value::str("x")).unwrap();
        let del = b.remove(Value::str("x")).unwrap();
        assert_eq!(add.ts, del.ts);

        a.update(&del).unwrap();
        b.update(&add).unwrap();

        assert!(a.contains(&Value::str("x")));
        assert!(b.contains(&Value::str("x")));
        assert_eq!(a.read(), b.read());
    }

    #[test]
    fn preemptive_remove_blocks_stale_observe() {
        let uuid = b"shared".to_vec();
        let mut a = OrSet::with_clock(ScalarClock::with_uuid(uuid.clone()).unwrap());
        let mut b = OrSet::with_clock(ScalarClock::with_uuid(uuid).unwrap());

        let add = a.observe(Value::str("x")).unwrap();
        b.clock.update(&add.ts);
        let del = b.remove(Value::str("x")).unwrap();
        assert!(del.ts > add.ts);

        let mut fresh = OrSet::with_clock(ScalarClock::with_uuid(b"shared".to_vec()).unwrap());
        fresh.update(&del).unwrap();
        fresh.update(&add).unwrap();
        assert!(!fresh.contains(&Value::str("x")));
    }

    #[test]
    fn re_add_after_remove() {
        let mut set = OrSet::new();
        set.observe(Value::Int(1)).unwrap();
        set.remove(Value::Int(1)).unwrap();
        set.observe(Value::Int(1)).unwrap();
        assert!(set.contains(&Value::Int(1)));
    }

    #[test]
    fn history_replays_to_equal_state() {
        let mut set = OrSet::new();
        set.observe(Value::str("keep")).unwrap();
        set.observe(Value::str("gone")).unwrap();
        set.remove(Value::str("gone")).unwrap();

        let mut replica =
            OrSet::with_clock(ScalarClock::with_uuid(set.clock_uuid().to_vec()).unwrap());
        for update in set.history(None, None) {
            replica.update(&update).unwrap();
        }
        assert_eq!(replica.read(), set.read());
        assert_eq!(replica.checksums(None, None), set.checksums(None, None));
    }

    #[test]
    fn pack_round_trip() {
        let mut set = OrSet::new();
        set.observe(Value::str("a")).unwrap();
        set.remove(Value::str("b")).unwrap();
        let restored = OrSet::<ScalarClock>::unpack(&set.pack()).unwrap();
        assert_eq!(restored.pack(), set.pack());
    }
}
