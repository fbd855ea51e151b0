//! Multi-value map CRDT.

use crate::checksum::crc_over_sorted;
use crate::events::Listeners;
use crate::mv_register::MvRegisterState;
use crate::orset::OrSetState;
use crate::traits::Crdt;
use deltakit_types::{
    Clock, CrdtError, CrdtResult, Decoder, Encoder, Packable, Payload, ScalarClock, SetOp,
    StateUpdate, Value,
};
use std::collections::BTreeMap;

/// A map from [`Value`] keys to multi-value registers, composed with an
/// observed-remove set of keys exactly the way the LWW map is.
#[derive(Debug, Clone)]
pub struct MvMap<C: Clock = ScalarClock> {
    clock: C,
    keys: OrSetState<Value, C::Timestamp>,
    registers: BTreeMap<Value, MvRegisterState<C::Timestamp>>,
    listeners: Listeners<C::Timestamp>,
}

impl MvMap<ScalarClock> {
    pub fn new() -> Self {
        Self::with_clock(ScalarClock::new())
    }
}

impl Default for MvMap<ScalarClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> MvMap<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            keys: OrSetState::new(),
            registers: BTreeMap::new(),
            listeners: Listeners::new(),
        }
    }

    /// Sets `key` to `value` and returns the update to propagate.
    pub fn set(&mut self, key: Value, value: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::MvMapWrite { op: SetOp::Observe, key, value },
        );
        self.update(&update)?;
        Ok(update)
    }

    /// Removes `key` from the map view.
    pub fn unset(&mut self, key: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::MvMapWrite { op: SetOp::Remove, key, value: Value::None },
        );
        self.update(&update)?;
        Ok(update)
    }

    /// Live values for `key`, if the key is visible.
    pub fn get(&self, key: &Value) -> Option<&[Value]> {
        if !self.keys.contains(key) {
            return None;
        }
        self.registers.get(key).map(|r| r.values.as_slice())
    }
}

impl<C: Clock> Crdt for MvMap<C> {
    type Clock = C;
    type View = BTreeMap<Value, Vec<Value>>;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&mut self) -> BTreeMap<Value, Vec<Value>> {
        self.keys
            .observed
            .keys()
            .filter_map(|key| {
                self.registers
                    .get(key)
                    .map(|register| (key.clone(), register.values.clone()))
            })
            .collect()
    }

    fn update(&mut self, update: &StateUpdate<C::Timestamp>) -> CrdtResult<&mut Self> {
        if update.clock_uuid != self.clock.uuid() {
            return Err(CrdtError::mismatch(&update.clock_uuid, self.clock.uuid()));
        }
        let (op, key, value) = match &update.data {
            Payload::MvMapWrite { op, key, value } => (*op, key, value),
            other => {
                return Err(CrdtError::Type(format!(
                    "mv-map update requires an mv-map-write payload, found {}",
                    other.kind_name()
                )))
            }
        };

        self.invoke_listeners(update)?;
        self.keys.apply::<C>(op, key, &update.ts);
        if op == SetOp::Observe && !self.registers.contains_key(key) && self.keys.contains(key) {
            self.registers
                .insert(key.clone(), MvRegisterState::new::<C>());
        }
        if let Some(register) = self.registers.get_mut(key) {
            register.apply::<C>(value, &update.ts);
        }
        self.clock.update(&update.ts);
        Ok(self)
    }

    fn history(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<C::Timestamp>> {
        let mut updates = Vec::new();
        for (op, key, set_ts) in self.keys.entries_in_range::<C>(None, None) {
            match self.registers.get(key) {
                Some(register) => {
                    if !crate::checksum::in_range::<C>(&register.last_update, from_ts, until_ts) {
                        continue;
                    }
                    for value in &register.values {
                        updates.push(StateUpdate::new(
                            self.clock.uuid().to_vec(),
                            register.last_update.clone(),
                            Payload::MvMapWrite { op, key: key.clone(), value: value.clone() },
                        ));
                    }
                }
                None => {
                    if !crate::checksum::in_range::<C>(set_ts, from_ts, until_ts) {
                        continue;
                    }
                    updates.push(StateUpdate::new(
                        self.clock.uuid().to_vec(),
                        set_ts.clone(),
                        Payload::MvMapWrite { op, key: key.clone(), value: Value::None },
                    ));
                }
            }
        }
        updates
    }

    fn checksums(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<u64> {
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

    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_bytes(&self.clock.pack());
        self.keys.encode_into(&mut enc);
        enc.put_seq(|seq| {
            for (key, register) in &self.registers {
                seq.put_value(key);
                register.encode_into(seq);
            }
        });
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let clock = C::unpack(&dec.take_bytes()?)?;
        let keys = OrSetState::decode_from(&mut dec)?;
        let mut registers = BTreeMap::new();
        let mut seq = dec.take_seq()?;
        while !seq.is_empty() {
            let key = seq.take_value()?;
            let register = MvRegisterState::decode_from(&mut seq)?;
            registers.insert(key, register);
        }
        dec.finish()?;
        Ok(Self {
            clock,
            keys,
            registers,
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
    fn set_get_unset() {
        let mut map = MvMap::new();
        map.set(Value::str("k"), Value::Int(1)).unwrap();
        assert_eq!(map.get(&Value::str("k")), Some(&[Value::Int(1)][..]));

        map.unset(Value::str("k")).unwrap();
        assert_eq!(map.get(&Value::str("k")), None);
    }

    #[test]
    fn concurrent_sets_keep_both_values() {
        let uuid = b"shared".to_vec();
        let mut a = MvMap::with_clock(ScalarClock::with_uuid(uuid.clone()).unwrap());
        let mut b = MvMap::with_clock(ScalarClock::with_uuid(uuid).unwrap());

        let wa = a.set(Value::str("k"), Value::str("left")).unwrap();
        let wb = b.set(Value::str("k"), Value::str("right")).unwrap();

        a.update(&wb).unwrap();
        b.update(&wa).unwrap();

        assert_eq!(a.read(), b.read());
        assert_eq!(
            a.get(&Value::str("k")),
            Some(&[Value::str("left"), Value::str("right")][..])
        );
    }

    #[test]
    fn history_replays_to_equal_state() {
        let mut map = MvMap::new();
        map.set(Value::str("a"), Value::Int(1)).unwrap();
        map.set(Value::str("b"), Value::Int(2)).unwrap();
        map.unset(Value::str("a")).unwrap();

        let mut replica =
            MvMap::with_clock(ScalarClock::with_uuid(map.clock_uuid().to_vec()).unwrap());
        for update in map.history(None, None) {
            replica.update(&update).unwrap();
        }
        assert_eq!(replica.read(), map.read());
        assert_eq!(replica.checksums(None, None), map.checksums(None, None));
    }

    #[test]
    fn pack_round_trip() {
        let mut map = MvMap::new();
        map.set(Value::str("k"), Value::Int(5)).unwrap();
        let mut restored = MvMap::<ScalarClock>::unpack(&map.pack()).unwrap();
        assert_eq!(restored.read(), map.read());
        assert_eq!(restored.pack(), map.pack());
    }
}
