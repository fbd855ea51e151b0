//! Multi-value register CRDT.

use crate::checksum::{crc_over_sorted, in_range};
use crate::events::Listeners;
use crate::traits::Crdt;
use deltakit_types::{
    Clock, CrdtError, CrdtResult, Decoder, Encoder, Packable, Payload, ScalarClock, StateUpdate,
    Value,
};
use std::fmt;

/// The mergeable core of a multi-value register.
///
/// A strictly later write replaces the value set; a concurrent write is
/// unioned in. Values stay sorted by serialized form and deduplicated, so
/// every replica renders the same concurrent set in the same order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct MvRegisterState<T> {
    pub(crate) values: Vec<Value>,
    pub(crate) last_update: T,
}

impl<T: Clone + Eq + fmt::Debug + Packable> MvRegisterState<T> {
    pub(crate) fn new<C: Clock<Timestamp = T>>() -> Self {
        Self {
            values: Vec::new(),
            last_update: C::default_ts(),
        }
    }

    /// Applies a write, returning true when the value set changed.
    pub(crate) fn apply<C: Clock<Timestamp = T>>(&mut self, value: &Value, ts: &T) -> bool {
        if C::is_later(ts, &self.last_update) {
            self.last_update = ts.clone();
            self.values = vec![value.clone()];
            true
        } else if C::are_concurrent(ts, &self.last_update) && !self.values.contains(value) {
            self.values.push(value.clone());
            self.values.sort();
            true
        } else {
            false
        }
    }

    pub(crate) fn encode_into(&self, enc: &mut Encoder) {
        enc.put_bytes(&self.last_update.pack());
        enc.put_seq(|seq| {
            for value in &self.values {
                seq.put_value(value);
            }
        });
    }

    pub(crate) fn decode_from(dec: &mut Decoder<'_>) -> CrdtResult<Self> {
        let last_update = T::unpack(&dec.take_bytes()?)?;
        let mut values = Vec::new();
        let mut seq = dec.take_seq()?;
        while !seq.is_empty() {
            values.push(seq.take_value()?);
        }
        Ok(Self { values, last_update })
    }

    pub(crate) fn packed(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.into_bytes()
    }
}

/// A named register that preserves every concurrently written value until a
/// strictly later write supersedes them.
#[derive(Debug, Clone)]
pub struct MvRegister<C: Clock = ScalarClock> {
    name: Value,
    clock: C,
    state: MvRegisterState<C::Timestamp>,
    listeners: Listeners<C::Timestamp>,
}

impl MvRegister<ScalarClock> {
    pub fn new(name: Value) -> Self {
        Self::with_clock(name, ScalarClock::new())
    }
}

impl<C: Clock> MvRegister<C> {
    pub fn with_clock(name: Value, clock: C) -> Self {
        let state = MvRegisterState::new::<C>();
        Self {
            name,
            clock,
            state,
            listeners: Listeners::new(),
        }
    }

    pub fn name(&self) -> &Value {
        &self.name
    }

    /// Writes a new value, superseding the current value set locally.
    pub fn write(&mut self, value: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::MvWrite { value },
        );
        self.update(&update)?;
        Ok(update)
    }
}

impl<C: Clock> Crdt for MvRegister<C> {
    type Clock = C;
    type View = Vec<Value>;

    fn clock(&self) -> &C {
        &self.clock
    }

    /// Every currently live value, sorted by serialized form.
    fn read(&mut self) -> Vec<Value> {
        self.state.values.clone()
    }

    fn update(&mut self, update: &StateUpdate<C::Timestamp>) -> CrdtResult<&mut Self> {
        if update.clock_uuid != self.clock.uuid() {
            return Err(CrdtError::mismatch(&update.clock_uuid, self.clock.uuid()));
        }
        let value = match &update.data {
            Payload::MvWrite { value } => value,
            other => {
                return Err(CrdtError::Type(format!(
                    "mv-register update requires an mv-write payload, found {}",
                    other.kind_name()
                )))
            }
        };

        self.invoke_listeners(update)?;
        self.state.apply::<C>(value, &update.ts);
        self.clock.update(&update.ts);
        Ok(self)
    }

    fn history(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<C::Timestamp>> {
        if !in_range::<C>(&self.state.last_update, from_ts, until_ts) {
            return Vec::new();
        }
        self.state
            .values
            .iter()
            .map(|value| {
                StateUpdate::new(
                    self.clock.uuid().to_vec(),
                    self.state.last_update.clone(),
                    Payload::MvWrite { value: value.clone() },
                )
            })
            .collect()
    }

    fn checksums(
        &self,
        _from_ts: Option<&C::Timestamp>,
        _until_ts: Option<&C::Timestamp>,
    ) -> Vec<u64> {
        vec![
            u64::from(crc_over_sorted(vec![self.state.last_update.pack()])),
            u64::from(crc_over_sorted(
                self.state.values.iter().map(Packable::pack).collect(),
            )),
        ]
    }

    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_value(&self.name);
        enc.put_bytes(&self.clock.pack());
        self.state.encode_into(&mut enc);
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let name = dec.take_value()?;
        let clock = C::unpack(&dec.take_bytes()?)?;
        let state = MvRegisterState::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(Self {
            name,
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
