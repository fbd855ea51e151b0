//! Last-writer-wins register CRDT.

use crate::checksum::{crc_over_sorted, in_range};
use crate::events::Listeners;
use crate::traits::Crdt;
use deltakit_types::{
    Clock, CrdtError, CrdtResult, Decoder, Encoder, Packable, Payload, ScalarClock, StateUpdate,
    Value,
};
use std::fmt;

/// The mergeable core of an LWW register.
///
/// A write wins under the three-stage ordering rule:
/// 1. a strictly later timestamp wins;
/// 2. on concurrent timestamps the higher writer id wins (total order over
///    values);
/// 3. with equal writers the higher serialized value wins.
///
/// The laddering makes concurrent writes resolve identically on every
/// replica, which is what makes the merge commutative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LwwRegisterState<T> {
    pub(crate) value: Value,
    pub(crate) last_update: T,
    pub(crate) last_writer: Value,
}

impl<T: Clone + Eq + fmt::Debug + Packable> LwwRegisterState<T> {
    pub(crate) fn new<C: Clock<Timestamp = T>>() -> Self {
        Self {
            value: Value::None,
            last_update: C::default_ts(),
            last_writer: Value::None,
        }
    }

    /// Applies a write, returning true when it won.
    pub(crate) fn apply<C: Clock<Timestamp = T>>(
        &mut self,
        writer: &Value,
        value: &Value,
        ts: &T,
    ) -> bool {
        if C::is_later(ts, &self.last_update) {
            self.last_update = ts.clone();
            self.last_writer = writer.clone();
            self.value = value.clone();
            true
        } else if C::are_concurrent(ts, &self.last_update)
            && (writer > &self.last_writer
                || (writer == &self.last_writer && value > &self.value))
        {
            self.last_writer = writer.clone();
            self.value = value.clone();
            true
        } else {
            false
        }
    }

    pub(crate) fn encode_into(&self, enc: &mut Encoder) {
        enc.put_value(&self.value);
        enc.put_bytes(&self.last_update.pack());
        enc.put_value(&self.last_writer);
    }

    pub(crate) fn decode_from(dec: &mut Decoder<'_>) -> CrdtResult<Self> {
        Ok(Self {
            value: dec.take_value()?,
            last_update: T::unpack(&dec.take_bytes()?)?,
            last_writer: dec.take_value()?,
        })
    }

    pub(crate) fn packed(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.into_bytes()
    }
}

/// A named register holding a single [`Value`] under last-writer-wins
/// semantics.
#[derive(Debug, Clone)]
pub struct LwwRegister<C: Clock = ScalarClock> {
    name: Value,
    clock: C,
    state: LwwRegisterState<C::Timestamp>,
    listeners: Listeners<C::Timestamp>,
}

impl LwwRegister<ScalarClock> {
    pub fn new(name: Value) -> Self {
        Self::with_clock(name, ScalarClock::new())
    }
}

impl<C: Clock> LwwRegister<C> {
    pub fn with_clock(name: Value, clock: C) -> Self {
        let state = LwwRegisterState::new::<C>();
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

    /// The writer id of the currently winning write.
    pub fn last_writer(&self) -> &Value {
        &self.state.last_writer
    }

    /// Writes a new value. `writer` identifies the source replica and is
    /// the tie-break for concurrent writes.
    pub fn write(&mut self, value: Value, writer: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::LwwWrite { writer, value },
        );
        self.update(&update)?;
        Ok(update)
    }
}

impl<C: Clock> Crdt for LwwRegister<C> {
    type Clock = C;
    type View = Value;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&mut self) -> Value {
        self.state.value.clone()
    }

    fn update(&mut self, update: &StateUpdate<C::Timestamp>) -> CrdtResult<&mut Self> {
        if update.clock_uuid != self.clock.uuid() {
            return Err(CrdtError::mismatch(&update.clock_uuid, self.clock.uuid()));
        }
        let (writer, value) = match &update.data {
            Payload::LwwWrite { writer, value } => (writer, value),
            other => {
                return Err(CrdtError::Type(format!(
                    "lww-register update requires an lww-write payload, found {}",
                    other.kind_name()
                )))
            }
        };

        self.invoke_listeners(update)?;
        self.state.apply::<C>(writer, value, &update.ts);
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
        vec![StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.state.last_update.clone(),
            Payload::LwwWrite {
                writer: self.state.last_writer.clone(),
                value: self.state.value.clone(),
            },
        )]
    }

    fn checksums(
        &self,
        _from_ts: Option<&C::Timestamp>,
        _until_ts: Option<&C::Timestamp>,
    ) -> Vec<u64> {
        vec![
            u64::from(crc_over_sorted(vec![self.state.last_update.pack()])),
            u64::from(crc_over_sorted(vec![self.state.last_writer.pack()])),
            u64::from(crc_over_sorted(vec![self.state.value.pack()])),
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
        let state = LwwRegisterState::decode_from(&mut dec)?;
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
