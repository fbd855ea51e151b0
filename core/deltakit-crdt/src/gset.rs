//! Grow-only set CRDT.

use crate::checksum::{crc_over_updates, in_range};
use crate::events::Listeners;
use crate::traits::Crdt;
use deltakit_types::{
    Clock, CrdtError, CrdtResult, Decoder, Encoder, Packable, Payload, ScalarClock, StateUpdate,
    Value,
};
use std::collections::BTreeMap;
use std::fmt;

/// The mergeable core of a grow-only set: each member with the earliest
/// timestamp it was observed at. The earliest stamp is what range-filtered
/// history and checksums key on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct GSetState<T> {
    pub(crate) members: BTreeMap<Value, T>,
}

impl<T: Clone + Eq + fmt::Debug + Packable> GSetState<T> {
    pub(crate) fn new() -> Self {
        Self {
            members: BTreeMap::new(),
        }
    }

    /// Inserts the member, keeping the earliest observation timestamp.
    pub(crate) fn apply<C: Clock<Timestamp = T>>(&mut self, member: &Value, ts: &T) {
        match self.members.get_mut(member) {
            Some(existing) => {
                if C::is_later(existing, ts) {
                    *existing = ts.clone();
                }
            }
            None => {
                self.members.insert(member.clone(), ts.clone());
            }
        }
    }

    pub(crate) fn contains(&self, member: &Value) -> bool {
        self.members.contains_key(member)
    }

    pub(crate) fn members_in_range<C: Clock<Timestamp = T>>(
        &self,
        from_ts: Option<&T>,
        until_ts: Option<&T>,
    ) -> Vec<(&Value, &T)> {
        self.members
            .iter()
            .filter(|(_, ts)| in_range::<C>(ts, from_ts, until_ts))
            .collect()
    }

    pub(crate) fn encode_into(&self, enc: &mut Encoder) {
        enc.put_seq(|seq| {
            for (member, ts) in &self.members {
                seq.put_value(member);
                seq.put_bytes(&ts.pack());
            }
        });
    }

    pub(crate) fn decode_from(dec: &mut Decoder<'_>) -> CrdtResult<Self> {
        let mut seq = dec.take_seq()?;
        let mut members = BTreeMap::new();
        while !seq.is_empty() {
            let member = seq.take_value()?;
            let ts = T::unpack(&seq.take_bytes()?)?;
            members.insert(member, ts);
        }
        Ok(Self { members })
    }
}

/// A grow-only set of [`Value`]s. Members can be added but never removed;
/// convergence is plain set union.
#[derive(Debug, Clone)]
pub struct GSet<C: Clock = ScalarClock> {
    clock: C,
    state: GSetState<C::Timestamp>,
    listeners: Listeners<C::Timestamp>,
}

impl GSet<ScalarClock> {
    pub fn new() -> Self {
        Self::with_clock(ScalarClock::new())
    }
}

impl Default for GSet<ScalarClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> GSet<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: GSetState::new(),
            listeners: Listeners::new(),
        }
    }

    /// Adds a member and returns the update to propagate. Adding an
    /// existing member is permitted and converges to the same state.
    pub fn add(&mut self, member: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::GSetMember { member },
        );
        self.update(&update)?;
        Ok(update)
    }

    pub fn contains(&self, member: &Value) -> bool {
        self.state.contains(member)
    }

    pub fn len(&self) -> usize {
        self.state.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.members.is_empty()
    }
}

impl<C: Clock> Crdt for GSet<C> {
    type Clock = C;
    type View = Vec<Value>;

    fn clock(&self) -> &C {
        &self.clock
    }

    /// Members in their canonical (serialized-form) order.
    fn read(&mut self) -> Vec<Value> {
        self.state.members.keys().cloned().collect()
    }

    fn update(&mut self, update: &StateUpdate<C::Timestamp>) -> CrdtResult<&mut Self> {
        if update.clock_uuid != self.clock.uuid() {
            return Err(CrdtError::mismatch(&update.clock_uuid, self.clock.uuid()));
        }
        let member = match &update.data {
            Payload::GSetMember { member } => member,
            other => {
                return Err(CrdtError::Type(format!(
                    "gset update requires a gset-member payload, found {}",
                    other.kind_name()
                )))
            }
        };

        self.invoke_listeners(update)?;
        self.state.apply::<C>(member, &update.ts);
        self.clock.update(&update.ts);
        Ok(self)
    }

    fn history(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<C::Timestamp>> {
        self.state
            .members_in_range::<C>(from_ts, until_ts)
            .into_iter()
            .map(|(member, ts)| {
                StateUpdate::new(
                    self.clock.uuid().to_vec(),
                    ts.clone(),
                    Payload::GSetMember { member: member.clone() },
                )
            })
            .collect()
    }

    fn checksums(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<u64> {
        let updates = self.history(from_ts, until_ts);
        vec![updates.len() as u64, u64::from(crc_over_updates(&updates))]
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
        let state = GSetState::decode_from(&mut dec)?;
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
