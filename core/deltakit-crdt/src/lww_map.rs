//! Last-writer-wins map CRDT.

use crate::checksum::crc_over_sorted;
use crate::events::Listeners;
use crate::lww_register::LwwRegisterState;
use crate::orset::OrSetState;
use crate::traits::Crdt;
use deltakit_types::{
    Clock, CrdtError, CrdtResult, Decoder, Encoder, Packable, Payload, ScalarClock, SetOp,
    StateUpdate, Value,
};
use std::collections::BTreeMap;
use std::fmt;

/// The mergeable core of an LWW map: an observed-remove set of keys plus
/// one LWW register per key. A set is an observe of the key plus a register
/// write; an unset is a remove of the key plus a register write of the none
/// sentinel.
///
/// Fractional-index arrays and causal trees embed this same core, which is
/// why their wire payloads are map writes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LwwMapState<T> {
    pub(crate) keys: OrSetState<Value, T>,
    pub(crate) registers: BTreeMap<Value, LwwRegisterState<T>>,
}

impl<T: Clone + Eq + fmt::Debug + Packable> LwwMapState<T> {
    pub(crate) fn new() -> Self {
        Self {
            keys: OrSetState::new(),
            registers: BTreeMap::new(),
        }
    }

    pub(crate) fn apply<C: Clock<Timestamp = T>>(
        &mut self,
        op: SetOp,
        key: &Value,
        writer: &Value,
        value: &Value,
        ts: &T,
    ) {
        self.keys.apply::<C>(op, key, ts);
        if op == SetOp::Observe && !self.registers.contains_key(key) && self.keys.contains(key) {
            self.registers
                .insert(key.clone(), LwwRegisterState::new::<C>());
        }
        if let Some(register) = self.registers.get_mut(key) {
            register.apply::<C>(writer, value, ts);
        }
    }

    /// Visible entries: keys in the or-set view whose register holds a
    /// non-none value.
    pub(crate) fn read(&self) -> Vec<(&Value, &Value)> {
        self.keys
            .observed
            .keys()
            .filter_map(|key| {
                self.registers
                    .get(key)
                    .filter(|register| !register.value.is_none())
                    .map(|register| (key, &register.value))
            })
            .collect()
    }

    pub(crate) fn get(&self, key: &Value) -> Option<&Value> {
        if !self.keys.contains(key) {
            return None;
        }
        self.registers
            .get(key)
            .filter(|register| !register.value.is_none())
            .map(|register| &register.value)
    }

    pub(crate) fn contains_key(&self, key: &Value) -> bool {
        self.get(key).is_some()
    }

    /// Per-key compacted history: one map write per key, carrying the
    /// winning register state and the key's current set membership.
    pub(crate) fn history<C: Clock<Timestamp = T>>(
        &self,
        clock_uuid: &[u8],
        from_ts: Option<&T>,
        until_ts: Option<&T>,
    ) -> Vec<StateUpdate<T>> {
        let mut updates = Vec::new();
        for (op, key, set_ts) in self.keys.entries_in_range::<C>(None, None) {
            match self.registers.get(key) {
                Some(register) => {
                    if !crate::checksum::in_range::<C>(&register.last_update, from_ts, until_ts) {
                        continue;
                    }
                    updates.push(StateUpdate::new(
                        clock_uuid.to_vec(),
                        register.last_update.clone(),
                        Payload::MapWrite {
                            op,
                            key: key.clone(),
                            value: register.value.clone(),
                            writer: register.last_writer.clone(),
                        },
                    ));
                }
                None => {
                    // A preemptively removed key has no register yet; replay
                    // the removal itself.
                    if !crate::checksum::in_range::<C>(set_ts, from_ts, until_ts) {
                        continue;
                    }
                    updates.push(StateUpdate::new(
                        clock_uuid.to_vec(),
                        set_ts.clone(),
                        Payload::MapWrite {
                            op,
                            key: key.clone(),
                            value: Value::None,
                            writer: Value::None,
                        },
                    ));
                }
            }
        }
        updates
    }

    pub(crate) fn checksums<C: Clock<Timestamp = T>>(
        &self,
        from_ts: Option<&T>,
        until_ts: Option<&T>,
    ) -> Vec<u64> {
        // Only registers of observed keys enter the digest: a replica that
        // learned a removed key through compacted history never saw the
        // key's final register, and both states read the same.
        let mut register_blobs = Vec::new();
        for key in self.keys.observed.keys() {
            if let Some(register) = self.registers.get(key) {
                let mut blob = key.pack();
                blob.extend_from_slice(&register.packed());
                register_blobs.push(blob);
            }
        }
        let mut checksums = vec![u64::from(crc_over_sorted(register_blobs))];
        checksums.extend(self.keys.checksums::<C>(from_ts, until_ts));
        checksums
    }

    pub(crate) fn encode_into(&self, enc: &mut Encoder) {
        self.keys.encode_into(enc);
        enc.put_seq(|seq| {
            for (key, register) in &self.registers {
                seq.put_value(key);
                register.encode_into(seq);
            }
        });
    }

    pub(crate) fn decode_from(dec: &mut Decoder<'_>) -> CrdtResult<Self> {
        let keys = OrSetState::decode_from(dec)?;
        let mut registers = BTreeMap::new();
        let mut seq = dec.take_seq()?;
        while !seq.is_empty() {
            let key = seq.take_value()?;
            let register = LwwRegisterState::decode_from(&mut seq)?;
            registers.insert(key, register);
        }
        Ok(Self { keys, registers })
    }
}

/// A map from [`Value`] keys to [`Value`]s with last-writer-wins conflict
/// resolution per key.
#[derive(Debug, Clone)]
pub struct LwwMap<C: Clock = ScalarClock> {
    clock: C,
    state: LwwMapState<C::Timestamp>,
    listeners: Listeners<C::Timestamp>,
}

impl LwwMap<ScalarClock> {
    pub fn new() -> Self {
        Self::with_clock(ScalarClock::new())
    }
}

impl Default for LwwMap<ScalarClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> LwwMap<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            state: LwwMapState::new(),
            listeners: Listeners::new(),
        }
    }

    /// Sets `key` to `value` and returns the update to propagate.
    pub fn set(
        &mut self,
        key: Value,
        value: Value,
        writer: Value,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::MapWrite { op: SetOp::Observe, key, value, writer },
        );
        self.update(&update)?;
        Ok(update)
    }

    /// Removes `key` from the map view.
    pub fn unset(&mut self, key: Value, writer: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::MapWrite { op: SetOp::Remove, key, value: Value::None, writer },
        );
        self.update(&update)?;
        Ok(update)
    }

    pub fn get(&self, key: &Value) -> Option<&Value> {
        self.state.get(key)
    }

    pub fn contains_key(&self, key: &Value) -> bool {
        self.state.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.state.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.read().is_empty()
    }
}

impl<C: Clock> Crdt for LwwMap<C> {
    type Clock = C;
    type View = BTreeMap<Value, Value>;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&mut self) -> BTreeMap<Value, Value> {
        self.state
            .read()
            .into_iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn update(&mut self, update: &StateUpdate<C::Timestamp>) -> CrdtResult<&mut Self> {
        if update.clock_uuid != self.clock.uuid() {
            return Err(CrdtError::mismatch(&update.clock_uuid, self.clock.uuid()));
        }
        let (op, key, value, writer) = match &update.data {
            Payload::MapWrite { op, key, value, writer } => (*op, key, value, writer),
            other => {
                return Err(CrdtError::Type(format!(
                    "lww-map update requires a map-write payload, found {}",
                    other.kind_name()
                )))
            }
        };

        self.invoke_listeners(update)?;
        self.state.apply::<C>(op, key, writer, value, &update.ts);
        self.clock.update(&update.ts);
        Ok(self)
    }

    fn history(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<C::Timestamp>> {
        self.state.history::<C>(self.clock.uuid(), from_ts, until_ts)
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
        let state = LwwMapState::decode_from(&mut dec)?;
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
    fn set_and_unset() {
        let mut map = LwwMap::new();
        map.set(Value::str("k"), Value::Int(1), Value::Int(7)).unwrap();
        assert_eq!(map.get(&Value::str("k")), Some(&Value::Int(1)));

        map.unset(Value::str("k"), Value::Int(7)).unwrap();
        assert_eq!(map.get(&Value::str("k")), None);
        assert!(map.read().is_empty());
    }

    #[test]
    fn read_skips_none_registers() {
        let mut map = LwwMap::new();
        map.set(Value::str("k"), Value::None, Value::Int(7)).unwrap();
        assert!(map.read().is_empty());
        assert!(!map.contains_key(&Value::str("k")));
    }

    #[test]
    fn concurrent_sets_resolve_identically() {
        let uuid = b"shared".to_vec();
        let mut a = LwwMap::with_clock(ScalarClock::with_uuid(uuid.clone()).unwrap());
        let mut b = LwwMap::with_clock(ScalarClock::with_uuid(uuid).unwrap());

        let wa = a.set(Value::str("k"), Value::str("from-a"), Value::Int(1)).unwrap();
        let wb = b.set(Value::str("k"), Value::str("from-b"), Value::Int(2)).unwrap();

        a.update(&wb).unwrap();
        b.update(&wa).unwrap();
        assert_eq!(a.read(), b.read());
        assert_eq!(a.get(&Value::str("k")), Some(&Value::str("from-b")));
    }

    #[test]
    fn history_is_compacted_per_key() {
        let mut map = LwwMap::new();
        map.set(Value::str("k"), Value::Int(1), Value::Int(7)).unwrap();
        map.set(Value::str("k"), Value::Int(2), Value::Int(7)).unwrap();
        map.set(Value::str("other"), Value::Int(9), Value::Int(7)).unwrap();

        let history = map.history(None, None);
        assert_eq!(history.len(), 2, "one update per key");

        let mut replica =
            LwwMap::with_clock(ScalarClock::with_uuid(map.clock_uuid().to_vec()).unwrap());
        for update in &history {
            replica.update(update).unwrap();
        }
        assert_eq!(replica.read(), map.read());
        assert_eq!(replica.checksums(None, None), map.checksums(None, None));
    }

    #[test]
    fn unset_survives_history_replay() {
        let mut map = LwwMap::new();
        map.set(Value::str("k"), Value::Int(1), Value::Int(7)).unwrap();
        map.unset(Value::str("k"), Value::Int(7)).unwrap();

        let mut replica =
            LwwMap::with_clock(ScalarClock::with_uuid(map.clock_uuid().to_vec()).unwrap());
        for update in map.history(None, None) {
            replica.update(&update).unwrap();
        }
        assert!(replica.read().is_empty());
    }

    #[test]
    fn pack_round_trip() {
        let mut map = LwwMap::new();
        map.set(Value::str("a"), Value::Int(1), Value::Int(7)).unwrap();
        map.unset(Value::str("b"), Value::Int(7)).unwrap();
        let mut restored = LwwMap::<ScalarClock>::unpack(&map.pack()).unwrap();
        assert_eq!(restored.read(), map.read());
        assert_eq!(restored.pack(), map.pack());
    }
}
