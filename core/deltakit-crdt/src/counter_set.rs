//! Composite counter keyed by counter id.
//!
//! A grow-only set of counter ids plus one PN-counter per id. Used where
//! each replica owns an additive contribution under its own id, so
//! contributions never collide.

use crate::checksum::crc_over_updates;
use crate::events::Listeners;
use crate::gset::GSetState;
use crate::pn_counter::PnCounterState;
use crate::traits::Crdt;
use deltakit_types::{
    Clock, CrdtError, CrdtResult, Decoder, Encoder, Payload, ScalarClock, StateUpdate, Value,
};
use std::collections::BTreeMap;

/// A set of named PN-counters whose `read()` is the sum of all of them.
#[derive(Debug, Clone)]
pub struct CounterSet<C: Clock = ScalarClock> {
    clock: C,
    ids: GSetState<C::Timestamp>,
    counters: BTreeMap<Value, PnCounterState<C::Timestamp>>,
    listeners: Listeners<C::Timestamp>,
}

impl CounterSet<ScalarClock> {
    pub fn new() -> Self {
        Self::with_clock(ScalarClock::new())
    }
}

impl Default for CounterSet<ScalarClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> CounterSet<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            ids: GSetState::new(),
            counters: BTreeMap::new(),
            listeners: Listeners::new(),
        }
    }

    /// Increases the counter registered under `counter_id`, installing it
    /// on first use. Returns the update to propagate.
    pub fn increase(
        &mut self,
        counter_id: Value,
        amount: i64,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        self.shift(counter_id, amount, false)
    }

    /// Decreases the counter registered under `counter_id`.
    pub fn decrease(
        &mut self,
        counter_id: Value,
        amount: i64,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        self.shift(counter_id, amount, true)
    }

    fn shift(
        &mut self,
        counter_id: Value,
        amount: i64,
        negative: bool,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        if amount <= 0 {
            return Err(CrdtError::Value(format!(
                "counter-set amount must be positive, got {amount}"
            )));
        }
        let (positive, negative) = if negative { (0, amount) } else { (amount, 0) };
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::CounterSet { counter_id, positive, negative },
        );
        self.update(&update)?;
        Ok(update)
    }

    /// Per-counter values for every registered id.
    pub fn read_full(&self) -> BTreeMap<Value, i64> {
        self.counters
            .iter()
            .filter(|(id, _)| self.ids.contains(id))
            .map(|(id, counter)| (id.clone(), counter.value()))
            .collect()
    }
}

impl<C: Clock> Crdt for CounterSet<C> {
    type Clock = C;
    type View = i64;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&mut self) -> i64 {
        self.counters.values().map(PnCounterState::value).sum()
    }

    fn update(&mut self, update: &StateUpdate<C::Timestamp>) -> CrdtResult<&mut Self> {
        if update.clock_uuid != self.clock.uuid() {
            return Err(CrdtError::mismatch(&update.clock_uuid, self.clock.uuid()));
        }
        let (counter_id, positive, negative) = match &update.data {
            Payload::CounterSet { counter_id, positive, negative } => {
                (counter_id, *positive, *negative)
            }
            other => {
                return Err(CrdtError::Type(format!(
                    "counter-set update requires a counter-set payload, found {}",
                    other.kind_name()
                )))
            }
        };
        PnCounterState::<C::Timestamp>::validate_delta(positive, negative)?;

        self.invoke_listeners(update)?;
        self.ids.apply::<C>(counter_id, &update.ts);
        self.counters
            .entry(counter_id.clone())
            .or_insert_with(PnCounterState::new)
            .apply(&update.ts, positive, negative);
        self.clock.update(&update.ts);
        Ok(self)
    }

    fn history(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<C::Timestamp>> {
        // Every id enters through a delta-carrying update, so replaying the
        // per-id deltas also reconstructs set membership.
        let mut updates = Vec::new();
        for (id, counter) in &self.counters {
            for (ts, positive, negative) in counter.deltas_in_range::<C>(from_ts, until_ts) {
                updates.push(StateUpdate::new(
                    self.clock.uuid().to_vec(),
                    ts,
                    Payload::CounterSet { counter_id: id.clone(), positive, negative },
                ));
            }
        }
        updates
    }

    fn checksums(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<u64> {
        let updates = self.history(from_ts, until_ts);
        let total: i64 = self.counters.values().map(PnCounterState::value).sum();
        vec![
            self.ids.members.len() as u64,
            updates.len() as u64,
            total as u64,
            u64::from(crc_over_updates(&updates)),
        ]
    }

    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_bytes(&self.clock.pack());
        self.ids.encode_into(&mut enc);
        enc.put_seq(|seq| {
            for (id, counter) in &self.counters {
                seq.put_value(id);
                counter.encode_into(seq);
            }
        });
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let clock = C::unpack(&dec.take_bytes()?)?;
        let ids = GSetState::decode_from(&mut dec)?;
        let mut counters = BTreeMap::new();
        let mut seq = dec.take_seq()?;
        while !seq.is_empty() {
            let id = seq.take_value()?;
            let counter = PnCounterState::decode_from(&mut seq)?;
            counters.insert(id, counter);
        }
        dec.finish()?;
        Ok(Self {
            clock,
            ids,
            counters,
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
