//! Positive-negative counter CRDT.

use crate::checksum::crc_over_updates;
use crate::counter::CounterState;
use crate::events::Listeners;
use crate::traits::Crdt;
use deltakit_types::{
    Clock, CrdtError, CrdtResult, Decoder, Encoder, Packable, Payload, ScalarClock, StateUpdate,
};
use std::fmt;

/// The mergeable core of a PN-counter: one grow-only accumulator for
/// increments and one for decrements.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct PnCounterState<T> {
    pub(crate) positive: CounterState<T>,
    pub(crate) negative: CounterState<T>,
}

impl<T: Clone + Eq + fmt::Debug + Packable> PnCounterState<T> {
    pub(crate) fn new() -> Self {
        Self {
            positive: CounterState::new(),
            negative: CounterState::new(),
        }
    }

    /// Validates a PN delta: both amounts non-negative, exactly one set.
    pub(crate) fn validate_delta(positive: i64, negative: i64) -> CrdtResult<()> {
        if positive < 0 || negative < 0 {
            return Err(CrdtError::Value(format!(
                "pn-counter amounts must be non-negative, got ({positive}, {negative})"
            )));
        }
        match (positive, negative) {
            (0, 0) => Err(CrdtError::Value(
                "pn-counter delta must carry an increment or a decrement".into(),
            )),
            (p, n) if p > 0 && n > 0 => Err(CrdtError::Value(
                "pn-counter delta must not carry both an increment and a decrement".into(),
            )),
            _ => Ok(()),
        }
    }

    pub(crate) fn apply(&mut self, ts: &T, positive: i64, negative: i64) {
        if positive > 0 {
            self.positive.apply(ts, positive);
        } else {
            self.negative.apply(ts, negative);
        }
    }

    pub(crate) fn value(&self) -> i64 {
        self.positive.total() - self.negative.total()
    }

    /// All deltas in range as `(ts, positive, negative)` triples, sorted for
    /// deterministic emission.
    pub(crate) fn deltas_in_range<C: Clock<Timestamp = T>>(
        &self,
        from_ts: Option<&T>,
        until_ts: Option<&T>,
    ) -> Vec<(T, i64, i64)> {
        let mut deltas: Vec<(T, i64, i64)> = self
            .positive
            .entries_in_range::<C>(from_ts, until_ts)
            .into_iter()
            .map(|(ts, amount)| (ts, amount, 0))
            .chain(
                self.negative
                    .entries_in_range::<C>(from_ts, until_ts)
                    .into_iter()
                    .map(|(ts, amount)| (ts, 0, amount)),
            )
            .collect();
        deltas.sort_by(|(ta, pa, na), (tb, pb, nb)| {
            ta.pack().cmp(&tb.pack()).then(pa.cmp(pb)).then(na.cmp(nb))
        });
        deltas
    }

    pub(crate) fn encode_into(&self, enc: &mut Encoder) {
        self.positive.encode_into(enc);
        self.negative.encode_into(enc);
    }

    pub(crate) fn decode_from(dec: &mut Decoder<'_>) -> CrdtResult<Self> {
        Ok(Self {
            positive: CounterState::decode_from(dec)?,
            negative: CounterState::decode_from(dec)?,
        })
    }
}

/// A counter supporting both increments and decrements.
///
/// `read()` = sum of increments − sum of decrements, and may be negative.
#[derive(Debug, Clone)]
pub struct PnCounter<C: Clock = ScalarClock> {
    clock: C,
    state: PnCounterState<C::Timestamp>,
    listeners: Listeners<C::Timestamp>,
}

impl PnCounter<ScalarClock> {
    pub fn new() -> Self {
        Self::with_clock(ScalarClock::new())
    }
}

impl Default for PnCounter<ScalarClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> PnCounter<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: PnCounterState::new(),
            listeners: Listeners::new(),
        }
    }

    /// Increases the counter by `amount` (strictly positive).
    pub fn increase(&mut self, amount: i64) -> CrdtResult<StateUpdate<C::Timestamp>> {
        self.shift(amount, false)
    }

    /// Decreases the counter by `amount` (strictly positive).
    pub fn decrease(&mut self, amount: i64) -> CrdtResult<StateUpdate<C::Timestamp>> {
        self.shift(amount, true)
    }

    fn shift(&mut self, amount: i64, negative: bool) -> CrdtResult<StateUpdate<C::Timestamp>> {
        if amount <= 0 {
            return Err(CrdtError::Value(format!(
                "pn-counter amount must be positive, got {amount}"
            )));
        }
        let (positive, negative) = if negative { (0, amount) } else { (amount, 0) };
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::PnCounter { positive, negative },
        );
        self.update(&update)?;
        Ok(update)
    }
}

impl<C: Clock> Crdt for PnCounter<C> {
    type Clock = C;
    type View = i64;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&mut self) -> i64 {
        self.state.value()
    }

    fn update(&mut self, update: &StateUpdate<C::Timestamp>) -> CrdtResult<&mut Self> {
        if update.clock_uuid != self.clock.uuid() {
            return Err(CrdtError::mismatch(&update.clock_uuid, self.clock.uuid()));
        }
        let (positive, negative) = match &update.data {
            Payload::PnCounter { positive, negative } => (*positive, *negative),
            other => {
                return Err(CrdtError::Type(format!(
                    "pn-counter update requires a pn-counter payload, found {}",
                    other.kind_name()
                )))
            }
        };
        PnCounterState::<C::Timestamp>::validate_delta(positive, negative)?;

        self.invoke_listeners(update)?;
        self.state.apply(&update.ts, positive, negative);
        self.clock.update(&update.ts);
        Ok(self)
    }

    fn history(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<C::Timestamp>> {
        self.state
            .deltas_in_range::<C>(from_ts, until_ts)
            .into_iter()
            .map(|(ts, positive, negative)| {
                StateUpdate::new(
                    self.clock.uuid().to_vec(),
                    ts,
                    Payload::PnCounter { positive, negative },
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
        let (mut pos_total, mut neg_total) = (0i64, 0i64);
        for update in &updates {
            if let Payload::PnCounter { positive, negative } = &update.data {
                pos_total += positive;
                neg_total += negative;
            }
        }
        vec![
            updates.len() as u64,
            pos_total as u64,
            neg_total as u64,
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
        let state = PnCounterState::decode_from(&mut dec)?;
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
    fn value_can_go_negative() {
        let mut counter = PnCounter::new();
        counter.decrease(5).unwrap();
        assert_eq!(counter.read(), -5);
    }

    #[test]
    fn increments_and_decrements_combine() {
        let mut counter = PnCounter::new();
        counter.increase(10).unwrap();
        counter.decrease(3).unwrap();
        counter.increase(1).unwrap();
        assert_eq!(counter.read(), 8);
    }

    #[test]
    fn mixed_sign_deltas_are_rejected() {
        let mut counter = PnCounter::new();
        let bad = StateUpdate::new(
            counter.clock_uuid().to_vec(),
            1u64,
            Payload::PnCounter { positive: 1, negative: 1 },
        );
        assert!(matches!(counter.update(&bad), Err(CrdtError::Value(_))));

        let empty = StateUpdate::new(
            counter.clock_uuid().to_vec(),
            1u64,
            Payload::PnCounter { positive: 0, negative: 0 },
        );
        assert!(matches!(counter.update(&empty), Err(CrdtError::Value(_))));
        assert_eq!(counter.read(), 0);
    }

    #[test]
    fn replay_is_idempotent() {
        let mut counter = PnCounter::new();
        let up = counter.increase(7).unwrap();
        let down = counter.decrease(2).unwrap();
        counter.update(&up).unwrap();
        counter.update(&down).unwrap();
        assert_eq!(counter.read(), 5);
    }

    #[test]
    fn pack_round_trip() {
        let mut counter = PnCounter::new();
        counter.increase(4).unwrap();
        counter.decrease(9).unwrap();
        let mut restored = PnCounter::<ScalarClock>::unpack(&counter.pack()).unwrap();
        assert_eq!(restored.read(), -5);
        assert_eq!(restored.pack(), counter.pack());
    }

    #[test]
    fn updates_serialize_as_json_for_embedding_apps() {
        let mut counter = PnCounter::new();
        let update = counter.increase(6).unwrap();
        let json = serde_json::to_string(&update).unwrap();
        let parsed: StateUpdate<u64> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, update);
    }
}
