//! Replicated growable array CRDT.

use crate::events::Listeners;
use crate::orset::OrSetState;
use crate::traits::{Crdt, ListCrdt};
use deltakit_types::{
    Clock, CrdtError, CrdtResult, Decoder, Encoder, Payload, RgaItem, ScalarClock, SetOp,
    StateUpdate, Value,
};
use tracing::trace;

/// An append-only list with deletion, layered over an observed-remove set
/// of [`RgaItem`]s.
///
/// The visible order is the deterministic total order over items:
/// `(creation ts, writer, serialized value)` ascending. Because the order is
/// computed from item data rather than arrival order, concurrent appends
/// interleave identically on every replica.
#[derive(Debug, Clone)]
pub struct RgArray<C: Clock = ScalarClock> {
    clock: C,
    items: OrSetState<RgaItem, C::Timestamp>,
    /// Visible items in list order, maintained by binary-search insertion
    /// and removal on each apply.
    cache_full: Vec<RgaItem>,
    /// Flat value view, derived from `cache_full` when it changes.
    cache: Option<Vec<Value>>,
    listeners: Listeners<C::Timestamp>,
}

impl RgArray<ScalarClock> {
    pub fn new() -> Self {
        Self::with_clock(ScalarClock::new())
    }
}

impl Default for RgArray<ScalarClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> RgArray<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            items: OrSetState::new(),
            cache_full: Vec::new(),
            cache: None,
            listeners: Listeners::new(),
        }
    }

    /// Appends `item` with a fresh timestamp. Returns the update to
    /// propagate; its payload carries the [`RgaItem`] needed for deletion.
    pub fn append(&mut self, item: Value, writer: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let ts = self.clock.read();
        let rga_item = RgaItem::new(item, C::wrap_ts(&ts), writer);
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            ts,
            Payload::RgaOp { op: SetOp::Observe, item: rga_item },
        );
        self.update(&update)?;
        Ok(update)
    }

    /// Deletes a specific item. Obtain items from [`RgArray::read_full`];
    /// the flat `read()` view cannot identify which duplicate to delete.
    pub fn delete(&mut self, item: &RgaItem) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::RgaOp { op: SetOp::Remove, item: item.clone() },
        );
        self.update(&update)?;
        Ok(update)
    }

    /// Deletes the item at `index` in the visible list.
    pub fn remove(&mut self, index: usize) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let items = self.read_full();
        let item = items.get(index).ok_or_else(|| {
            CrdtError::Value(format!(
                "index {index} out of bounds for list of {}",
                items.len()
            ))
        })?;
        self.delete(&item.clone())
    }

    /// Position of the first occurrence of `item` in the visible list.
    pub fn index(&mut self, item: &Value) -> CrdtResult<usize> {
        self.read()
            .iter()
            .position(|candidate| candidate == item)
            .ok_or_else(|| CrdtError::Value(format!("item not present in list: {item:?}")))
    }

    /// The visible items with their full wrappers, in list order.
    pub fn read_full(&mut self) -> Vec<RgaItem> {
        self.cache_full.clone()
    }

    /// Rebuilds the ordering cache from the underlying set.
    fn calculate_cache(&mut self) {
        // BTreeMap iteration is already (ts, writer, value) order.
        self.cache_full = self.items.observed.keys().cloned().collect();
        self.cache = None;
        trace!(items = self.cache_full.len(), "rebuilt rga cache");
    }

    /// Surgically inserts or removes one item, keeping the cache sorted.
    fn update_cache(&mut self, item: &RgaItem, visible: bool) {
        match self.cache_full.binary_search(item) {
            Ok(pos) => {
                if !visible {
                    self.cache_full.remove(pos);
                    self.cache = None;
                }
            }
            Err(pos) => {
                if visible {
                    self.cache_full.insert(pos, item.clone());
                    self.cache = None;
                }
            }
        }
    }
}

impl<C: Clock> Crdt for RgArray<C> {
    type Clock = C;
    type View = Vec<Value>;

    fn clock(&self) -> &C {
        &self.clock
    }

    fn read(&mut self) -> Vec<Value> {
        if self.cache.is_none() {
            self.cache = Some(self.cache_full.iter().map(|item| item.value.clone()).collect());
        }
        self.cache.clone().unwrap_or_default()
    }

    fn update(&mut self, update: &StateUpdate<C::Timestamp>) -> CrdtResult<&mut Self> {
        if update.clock_uuid != self.clock.uuid() {
            return Err(CrdtError::mismatch(&update.clock_uuid, self.clock.uuid()));
        }
        let (op, item) = match &update.data {
            Payload::RgaOp { op, item } => (*op, item),
            other => {
                return Err(CrdtError::Type(format!(
                    "rga update requires an rga-op payload, found {}",
                    other.kind_name()
                )))
            }
        };

        self.invoke_listeners(update)?;
        self.items.apply::<C>(op, item, &update.ts);
        let visible = self.items.contains(item);
        self.update_cache(item, visible);
        self.clock.update(&update.ts);
        Ok(self)
    }

    fn history(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<C::Timestamp>> {
        self.items
            .entries_in_range::<C>(from_ts, until_ts)
            .into_iter()
            .map(|(op, item, ts)| {
                StateUpdate::new(
                    self.clock.uuid().to_vec(),
                    ts.clone(),
                    Payload::RgaOp { op, item: item.clone() },
                )
            })
            .collect()
    }

    fn checksums(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<u64> {
        self.items.checksums::<C>(from_ts, until_ts)
    }

    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_bytes(&self.clock.pack());
        self.items.encode_into(&mut enc);
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let clock = C::unpack(&dec.take_bytes()?)?;
        let items = OrSetState::decode_from(&mut dec)?;
        dec.finish()?;
        let mut array = Self {
            clock,
            items,
            cache_full: Vec::new(),
            cache: None,
            listeners: Listeners::new(),
        };
        array.calculate_cache();
        Ok(array)
    }

    fn listeners(&self) -> &Listeners<C::Timestamp> {
        &self.listeners
    }

    fn listeners_mut(&mut self) -> &mut Listeners<C::Timestamp> {
        &mut self.listeners
    }
}

impl<C: Clock> ListCrdt for RgArray<C> {
    fn list_append(
        &mut self,
        item: Value,
        writer: Value,
    ) -> CrdtResult<Vec<StateUpdate<C::Timestamp>>> {
        Ok(vec![self.append(item, writer)?])
    }

    fn list_remove(
        &mut self,
        index: usize,
        _writer: Value,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        self.remove(index)
    }

    fn position_of(&mut self, item: &Value) -> CrdtResult<usize> {
        self.index(item)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn appends_read_back_in_order() {
        let mut list = RgArray::new();
        list.append(Value::str("a"), Value::Int(1)).unwrap();
        list.append(Value::str("b"), Value::Int(1)).unwrap();
        list.append(Value::str("c"), Value::Int(1)).unwrap();
        assert_eq!(
            list.read(),
            vec![Value::str("a"), Value::str("b"), Value::str("c")]
        );
    }

    #[test]
    fn concurrent_appends_interleave_identically() {
        let uuid = b"shared".to_vec();
        let mut a = RgArray::with_clock(ScalarClock::with_uuid(uuid.clone()).unwrap());
        let mut b = RgArray::with_clock(ScalarClock::with_uuid(uuid).unwrap());

        let wa = a.append(Value::str("from-a"), Value::Int(1)).unwrap();
        let wb = b.append(Value::str("from-b"), Value::Int(2)).unwrap();

        a.update(&wb).unwrap();
        b.update(&wa).unwrap();

        assert_eq!(a.read(), b.read());
        assert_eq!(a.read().len(), 2);
        // Same timestamp, so the writer id decides the interleaving.
        assert_eq!(a.read(), vec![Value::str("from-a"), Value::str("from-b")]);
    }

    #[test]
    fn delete_hides_one_occurrence() {
        let mut list = RgArray::new();
        list.append(Value::str("x"), Value::Int(1)).unwrap();
        list.append(Value::str("x"), Value::Int(1)).unwrap();

        let items = list.read_full();
        assert_eq!(items.len(), 2);
        list.delete(&items[0]).unwrap();
        assert_eq!(list.read(), vec![Value::str("x")]);
    }

    #[test]
    fn remove_checks_bounds() {
        let mut list = RgArray::new();
        list.append(Value::str("only"), Value::Int(1)).unwrap();
        assert!(matches!(list.remove(5), Err(CrdtError::Value(_))));
        list.remove(0).unwrap();
        assert!(list.read().is_empty());
    }

    #[test]
    fn index_finds_first_occurrence() {
        let mut list = RgArray::new();
        list.append(Value::str("a"), Value::Int(1)).unwrap();
        list.append(Value::str("b"), Value::Int(1)).unwrap();
        assert_eq!(list.index(&Value::str("b")).unwrap(), 1);
        assert!(matches!(
            list.index(&Value::str("missing")),
            Err(CrdtError::Value(_))
        ));
    }

    #[test]
    fn unpack_rebuilds_the_cache() {
        let mut list = RgArray::new();
        list.append(Value::str("a"), Value::Int(1)).unwrap();
        list.append(Value::str("b"), Value::Int(1)).unwrap();
        list.remove(0).unwrap();

        let mut restored = RgArray::<ScalarClock>::unpack(&list.pack()).unwrap();
        assert_eq!(restored.read(), list.read());
        assert_eq!(restored.pack(), list.pack());
    }

    #[test]
    fn history_replays_deletions() {
        let mut list = RgArray::new();
        list.append(Value::str("keep"), Value::Int(1)).unwrap();
        list.append(Value::str("drop"), Value::Int(1)).unwrap();
        let items = list.read_full();
        list.delete(&items[1]).unwrap();

        let mut replica =
            RgArray::with_clock(ScalarClock::with_uuid(list.clock_uuid().to_vec()).unwrap());
        for update in list.history(None, None) {
            replica.update(&update).unwrap();
        }
        assert_eq!(replica.read(), vec![Value::str("keep")]);
        assert_eq!(replica.checksums(None, None), list.checksums(None, None));
    }
}
