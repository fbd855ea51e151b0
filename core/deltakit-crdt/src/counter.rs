//! Grow-only counter CRDT.

use crate::checksum::{crc_over_updates, in_range};
use crate::events::Listeners;
use crate::traits::Crdt;
use deltakit_types::{
    Clock, CrdtError, CrdtResult, Decoder, Encoder, Packable, Payload, ScalarClock, StateUpdate,
};
use std::fmt;

/// The mergeable core of a counter: the set of distinct applied deltas.
///
/// A delta is identified by its `(ts, amount)` pair; re-applying a known
/// pair is a no-op, which is what makes the counter idempotent and
/// order-insensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CounterState<T> {
    entries: Vec<(T, i64)>,
}

impl<T: Clone + Eq + fmt::Debug + Packable> CounterState<T> {
    pub(crate) fn new() -> Self {
        Self { entries: Vec::new() }
    }

    /// Records a delta unless the identical delta was already applied.
    /// Returns true when state changed.
    pub(crate) fn apply(&mut self, ts: &T, amount: i64) -> bool {
        if self.entries.iter().any(|(t, a)| t == ts && *a == amount) {
            return false;
        }
        self.entries.push((ts.clone(), amount));
        true
    }

    pub(crate) fn total(&self) -> i64 {
        self.entries.iter().map(|(_, amount)| amount).sum()
    }

    pub(crate) fn entries_in_range<C: Clock<Timestamp = T>>(
        &self,
        from_ts: Option<&T>,
        until_ts: Option<&T>,
    ) -> Vec<(T, i64)> {
        let mut selected: Vec<(T, i64)> = self
            .entries
            .iter()
            .filter(|(ts, _)| in_range::<C>(ts, from_ts, until_ts))
            .cloned()
            .collect();
        selected.sort_by(|(ta, aa), (tb, ab)| ta.pack().cmp(&tb.pack()).then(aa.cmp(ab)));
        selected
    }

    pub(crate) fn encode_into(&self, enc: &mut Encoder) {
        let mut sorted = self.entries.clone();
        sorted.sort_by(|(ta, aa), (tb, ab)| ta.pack().cmp(&tb.pack()).then(aa.cmp(ab)));
        enc.put_seq(|seq| {
            for (ts, amount) in &sorted {
                seq.put_bytes(&ts.pack());
                seq.put_int(*amount);
            }
        });
    }

    pub(crate) fn decode_from(dec: &mut Decoder<'_>) -> CrdtResult<Self> {
        let mut seq = dec.take_seq()?;
        let mut entries = Vec::new();
        while !seq.is_empty() {
            let ts = T::unpack(&seq.take_bytes()?)?;
            let amount = seq.take_int()?;
            entries.push((ts, amount));
        }
        Ok(Self { entries })
    }
}

/// A grow-only counter.
///
/// `read()` is the sum of every distinct delta amount the replica has seen.
#[derive(Debug, Clone)]
pub struct Counter<C: Clock = ScalarClock> {
    clock: C,
    state: CounterState<C::Timestamp>,
    listeners: Listeners<C::Timestamp>,
}

impl Counter<ScalarClock> {
    /// Creates a counter with a fresh instance uuid.
    pub fn new() -> Self {
        Self::with_clock(ScalarClock::new())
    }
}

impl Default for Counter<ScalarClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> Counter<C> {
    /// Creates a counter driven by an existing clock. Replicas of one
    /// instance construct their clocks with the same uuid.
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: CounterState::new(),
            listeners: Listeners::new(),
        }
    }

    /// Increases the counter by `amount` (strictly positive) and returns
    /// the update to propagate.
    pub fn increase(&mut self, amount: i64) -> CrdtResult<StateUpdate<C::Timestamp>> {
        if amount <= 0 {
            return Err(CrdtError::Value(format!(
                "counter amount must be positive, got {amount}"
            )));
        }
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::Counter { amount },
        );
        self.update(&update)?;
        Ok(update)
    }
}

impl<C: Clock> Crdt for Counter<C> {
    type Clock = C;
    type View = i64;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&mut self) -> i64 {
        self.state.total()
    }

    fn update(&mut self, update: &StateUpdate<C::Timestamp>) -> CrdtResult<&mut Self> {
        if update.clock_uuid != self.clock.uuid() {
            return Err(CrdtError::mismatch(&update.clock_uuid, self.clock.uuid()));
        }
        let amount = match &update.data {
            Payload::Counter { amount } => *amount,
            other => {
                return Err(CrdtError::Type(format!(
                    "counter update requires a counter payload, found {}",
                    other.kind_name()
                )))
            }
        };
        if amount <= 0 {
            return Err(CrdtError::Value(format!(
                "counter amount must be positive, got {amount}"
            )));
        }

        self.invoke_listeners(update)?;
        self.state.apply(&update.ts, amount);
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
            .map(|(ts, amount)| {
                StateUpdate::new(self.clock.uuid().to_vec(), ts, Payload::Counter { amount })
            })
            .collect()
    }

    fn checksums(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<u64> {
        let updates = self.history(from_ts, until_ts);
        let total: i64 = updates
            .iter()
            .map(|u| match &u.data {
                Payload::Counter { amount } => *amount,
                _ => 0,
            })
            .sum();
        vec![
            updates.len() as u64,
            total as u64,
            u64::from(crc_over_updates(&updates)),
        ]
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
        let state = CounterState::decode_from(&mut dec)?;
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
