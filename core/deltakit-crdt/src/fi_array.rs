//! Fractionally-indexed array CRDT.

use crate::events::Listeners;
use crate::lww_map::LwwMapState;
use crate::traits::{Crdt, ListCrdt};
use bigdecimal::num_bigint::BigInt;
use bigdecimal::{BigDecimal, One, Zero};
use deltakit_types::{
    Clock, CrdtError, CrdtResult, CustomValue, Decoder, Encoder, Packable, Payload, ScalarClock,
    SetOp, StateUpdate, Value,
};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{trace, warn};
use uuid::Uuid;

/// One positioned element of a fractional-index array.
///
/// The decimal `index` in (0, 1) locates the item; list order is ascending
/// by index, with the serialized value breaking exact-index ties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FiaItem {
    pub value: Value,
    pub index: BigDecimal,
    pub uuid: Vec<u8>,
}

impl FiaItem {
    pub fn new(value: Value, index: BigDecimal, uuid: Vec<u8>) -> Self {
        Self {
            value,
            index: index.normalized(),
            uuid,
        }
    }

    fn order_key(&self, other: &Self) -> Ordering {
        self.index
            .cmp(&other.index)
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl Packable for FiaItem {
    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_value(&self.value);
        enc.put_decimal(&self.index);
        enc.put_bytes(&self.uuid);
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let value = dec.take_value()?;
        let index = dec.take_decimal()?;
        let uuid = dec.take_bytes()?;
        dec.finish()?;
        Ok(Self::new(value, index, uuid))
    }
}

impl CustomValue for FiaItem {
    const TYPE_TAG: &'static str = "fia-item";

    fn to_bytes(&self) -> Vec<u8> {
        self.pack()
    }

    fn from_bytes(data: &[u8]) -> CrdtResult<Self> {
        Self::unpack(data)
    }
}

/// Destination of a [`FiArray::move_item`] call. Exactly one way to name
/// the new position.
#[derive(Debug, Clone)]
pub enum MoveTarget {
    /// Move to this exact index.
    Index(BigDecimal),
    /// Move directly before this item.
    Before(FiaItem),
    /// Move directly after this item.
    After(FiaItem),
}

/// An ordered list whose positions are arbitrary-precision decimals in
/// (0, 1), stored in an embedded LWW map from item uuid to [`FiaItem`].
///
/// Midpoint index generation carries a small random offset so replicas
/// inserting concurrently into the same slot almost certainly produce
/// distinct indices. Index precision grows with repeated insertion into the
/// same region and is never reclaimed automatically; call
/// [`FiArray::normalize`] to redistribute.
#[derive(Debug, Clone)]
pub struct FiArray<C: Clock = ScalarClock> {
    clock: C,
    positions: LwwMapState<C::Timestamp>,
    cache_full: Vec<FiaItem>,
    cache: Option<Vec<Value>>,
    listeners: Listeners<C::Timestamp>,
}

impl FiArray<ScalarClock> {
    pub fn new() -> Self {
        Self::with_clock(ScalarClock::new())
    }
}

impl Default for FiArray<ScalarClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> FiArray<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            positions: LwwMapState::new(),
            cache_full: Vec::new(),
            cache: None,
            listeners: Listeners::new(),
        }
    }

    /// An index strictly between `first` and `second`, at the midpoint plus
    /// a random offset bounded by a quarter of the gap.
    pub fn index_between(first: &BigDecimal, second: &BigDecimal) -> BigDecimal {
        let (lo, hi) = if first <= second { (first, second) } else { (second, first) };
        let gap = hi - lo;
        let half = BigDecimal::new(BigInt::from(5), 1);
        let midpoint = (lo + hi) * &half;
        if gap.is_zero() {
            return midpoint.normalized();
        }
        // Offset in [0, gap/4): multiplication only, so the result is exact.
        let jitter_steps = rand::thread_rng().gen_range(0u32..25_000);
        let jitter = gap * BigDecimal::new(BigInt::from(jitter_steps), 5);
        (midpoint + jitter).normalized()
    }

    /// Puts `item` at an explicit index, assigning it a fresh uuid.
    pub fn put(
        &mut self,
        item: Value,
        writer: Value,
        index: BigDecimal,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let fia_item = FiaItem::new(item, index, Uuid::new_v4().as_bytes().to_vec());
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::MapWrite {
                op: SetOp::Observe,
                key: Value::Bytes(fia_item.uuid.clone()),
                value: Value::custom(&fia_item),
                writer,
            },
        );
        self.update(&update)?;
        Ok(update)
    }

    /// Puts `item` between two placed items.
    pub fn put_between(
        &mut self,
        item: Value,
        writer: Value,
        first: &FiaItem,
        second: &FiaItem,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let index = Self::index_between(&first.index, &second.index);
        self.put(item, writer, index)
    }

    /// Puts `item` directly before `other` in the list.
    pub fn put_before(
        &mut self,
        item: Value,
        writer: Value,
        other: &FiaItem,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let position = self.position_of_uuid(&other.uuid).ok_or_else(|| {
            CrdtError::Usage("put_before target has no position in the list".into())
        })?;
        let prior_index = if position > 0 {
            self.cache_full[position - 1].index.clone()
        } else {
            BigDecimal::zero()
        };
        let index = Self::index_between(&prior_index, &other.index);
        self.put(item, writer, index)
    }

    /// Puts `item` directly after `other` in the list.
    pub fn put_after(
        &mut self,
        item: Value,
        writer: Value,
        other: &FiaItem,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let position = self.position_of_uuid(&other.uuid).ok_or_else(|| {
            CrdtError::Usage("put_after target has no position in the list".into())
        })?;
        let next_index = if position + 1 < self.cache_full.len() {
            self.cache_full[position + 1].index.clone()
        } else {
            BigDecimal::one()
        };
        let index = Self::index_between(&other.index, &next_index);
        self.put(item, writer, index)
    }

    /// Puts `item` before the current first item (or into the middle of an
    /// empty list).
    pub fn put_first(&mut self, item: Value, writer: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let upper = self
            .cache_full
            .first()
            .map(|first| first.index.clone())
            .unwrap_or_else(BigDecimal::one);
        let index = Self::index_between(&BigDecimal::zero(), &upper);
        self.put(item, writer, index)
    }

    /// Puts `item` after the current last item (or into the middle of an
    /// empty list).
    pub fn put_last(&mut self, item: Value, writer: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let lower = self
            .cache_full
            .last()
            .map(|last| last.index.clone())
            .unwrap_or_else(BigDecimal::zero);
        let index = Self::index_between(&lower, &BigDecimal::one());
        self.put(item, writer, index)
    }

    /// Appends by adding a fixed 10⁻²⁰ to the last index instead of halving
    /// the remaining space. Exhausts the tail slowly and deterministically;
    /// `normalize` redistributes when needed.
    pub fn append(&mut self, item: Value, writer: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        match self.cache_full.last() {
            Some(last) => {
                let step = BigDecimal::new(BigInt::one(), 20);
                let index = (&last.index + step).normalized();
                self.put(item, writer, index)
            }
            None => self.put_last(item, writer),
        }
    }

    /// Moves a placed item to a new position, named by exactly one of an
    /// explicit index, a `before` anchor, or an `after` anchor. Concurrent
    /// moves of the same item converge through the underlying LWW write.
    pub fn move_item(
        &mut self,
        item: &FiaItem,
        writer: Value,
        target: MoveTarget,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let new_index = match target {
            MoveTarget::Index(index) => index,
            MoveTarget::Before(anchor) => {
                let others: Vec<&FiaItem> = self
                    .cache_full
                    .iter()
                    .filter(|entry| entry.uuid != item.uuid)
                    .collect();
                let position = others
                    .iter()
                    .position(|entry| entry.uuid == anchor.uuid)
                    .ok_or_else(|| {
                        CrdtError::Usage("move_item anchor has no position in the list".into())
                    })?;
                let prior_index = if position > 0 {
                    others[position - 1].index.clone()
                } else {
                    BigDecimal::zero()
                };
                Self::index_between(&prior_index, &anchor.index)
            }
            MoveTarget::After(anchor) => {
                let others: Vec<&FiaItem> = self
                    .cache_full
                    .iter()
                    .filter(|entry| entry.uuid != item.uuid)
                    .collect();
                let position = others
                    .iter()
                    .position(|entry| entry.uuid == anchor.uuid)
                    .ok_or_else(|| {
                        CrdtError::Usage("move_item anchor has no position in the list".into())
                    })?;
                let next_index = if position + 1 < others.len() {
                    others[position + 1].index.clone()
                } else {
                    BigDecimal::one()
                };
                Self::index_between(&anchor.index, &next_index)
            }
        };

        let moved = FiaItem::new(item.value.clone(), new_index, item.uuid.clone());
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::MapWrite {
                op: SetOp::Observe,
                key: Value::Bytes(moved.uuid.clone()),
                value: Value::custom(&moved),
                writer,
            },
        );
        self.update(&update)?;
        Ok(update)
    }

    /// Deletes a placed item from the list view.
    pub fn delete(
        &mut self,
        item: &FiaItem,
        writer: Value,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::MapWrite {
                op: SetOp::Remove,
                key: Value::Bytes(item.uuid.clone()),
                value: Value::None,
                writer,
            },
        );
        self.update(&update)?;
        Ok(update)
    }

    /// Redistributes the visible items' indices evenly across
    /// `(0, max_index)`, emitting and applying one move per item. Expensive;
    /// call rarely, when midpoint subdivision has inflated index precision.
    pub fn normalize(
        &mut self,
        writer: Value,
        max_index: BigDecimal,
    ) -> CrdtResult<Vec<StateUpdate<C::Timestamp>>> {
        if max_index <= BigDecimal::zero() {
            return Err(CrdtError::Value("normalize max_index must be positive".into()));
        }
        let items = self.cache_full.clone();
        let slots = BigDecimal::from((items.len() + 1) as i64);
        let mut updates = Vec::with_capacity(items.len());
        for (position, item) in items.iter().enumerate() {
            let numerator = &max_index * BigDecimal::from((position + 1) as i64);
            let index = (numerator / &slots).normalized();
            updates.push(self.move_item(item, writer.clone(), MoveTarget::Index(index))?);
        }
        Ok(updates)
    }

    /// The visible items with their wrappers, in list order. Use these for
    /// `delete` and `move_item`.
    pub fn read_full(&mut self) -> Vec<FiaItem> {
        self.cache_full.clone()
    }

    fn position_of_uuid(&self, uuid: &[u8]) -> Option<usize> {
        self.cache_full.iter().position(|entry| entry.uuid == uuid)
    }

    /// Rebuilds the ordering cache from the underlying map.
    fn calculate_cache(&mut self) -> CrdtResult<()> {
        let mut items = Vec::new();
        for (_, value) in self.positions.read() {
            items.push(value.decode_custom::<FiaItem>()?);
        }
        items.sort_by(FiaItem::order_key);
        self.cache_full = items;
        self.cache = None;
        trace!(items = self.cache_full.len(), "rebuilt fia cache");
        Ok(())
    }

    /// Surgically replaces the cache entry for one uuid.
    fn update_cache(&mut self, uuid: &[u8], current: Option<FiaItem>) {
        if let Some(position) = self.position_of_uuid(uuid) {
            self.cache_full.remove(position);
            self.cache = None;
        }
        if let Some(item) = current {
            let position = self
                .cache_full
                .binary_search_by(|entry| entry.order_key(&item))
                .unwrap_or_else(|insertion| insertion);
            self.cache_full.insert(position, item);
            self.cache = None;

            let inserted = &self.cache_full[position];
            let collides = |neighbor: &FiaItem| neighbor.index == inserted.index;
            if position > 0 && collides(&self.cache_full[position - 1])
                || self.cache_full.get(position + 1).map(collides).unwrap_or(false)
            {
                warn!(
                    index = %inserted.index,
                    "fractional index collision; list order falls back to serialized-value tie-break"
                );
            }
        }
    }
}

impl<C: Clock> Crdt for FiArray<C> {
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
        let (op, key, value, writer) = match &update.data {
            Payload::MapWrite { op, key, value, writer } => (*op, key, value, writer),
            other => {
                return Err(CrdtError::Type(format!(
                    "fi-array update requires a map-write payload, found {}",
                    other.kind_name()
                )))
            }
        };
        let uuid = match key {
            Value::Bytes(uuid) => uuid.clone(),
            other => {
                return Err(CrdtError::Type(format!(
                    "fi-array keys are item uuids (bytes), found {}",
                    other.kind_name()
                )))
            }
        };
        let incoming = match op {
            SetOp::Observe => {
                let item = value.decode_custom::<FiaItem>()?;
                if item.uuid != uuid {
                    return Err(CrdtError::Value(
                        "fi-array item uuid must match its map key".into(),
                    ));
                }
                Some(item)
            }
            SetOp::Remove => {
                if !value.is_none() {
                    return Err(CrdtError::Type(
                        "fi-array delete must carry the none sentinel".into(),
                    ));
                }
                None
            }
        };

        self.invoke_listeners(update)?;
        self.positions.apply::<C>(op, key, writer, value, &update.ts);
        self.clock.update(&update.ts);

        // Refresh the cache from the post-merge register: the incoming write
        // only lands in the view if it won the LWW race. A losing write
        // leaves the cache entry for the standing winner untouched.
        if self.positions.get(key).is_none() {
            self.update_cache(&uuid, None);
        } else {
            let winner = {
                let stored = self.positions.get(key);
                incoming.filter(|item| stored == Some(&Value::custom(item)))
            };
            if let Some(item) = winner {
                self.update_cache(&uuid, Some(item));
            }
        }
        Ok(self)
    }

    fn history(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<StateUpdate<C::Timestamp>> {
        self.positions.history::<C>(self.clock.uuid(), from_ts, until_ts)
    }

    fn checksums(
        &self,
        from_ts: Option<&C::Timestamp>,
        until_ts: Option<&C::Timestamp>,
    ) -> Vec<u64> {
        self.positions.checksums::<C>(from_ts, until_ts)
    }

    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_bytes(&self.clock.pack());
        self.positions.encode_into(&mut enc);
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let clock = C::unpack(&dec.take_bytes()?)?;
        let positions = LwwMapState::decode_from(&mut dec)?;
        dec.finish()?;
        let mut array = Self {
            clock,
            positions,
            cache_full: Vec::new(),
            cache: None,
            listeners: Listeners::new(),
        };
        array.calculate_cache()?;
        Ok(array)
    }

    fn listeners(&self) -> &Listeners<C::Timestamp> {
        &self.listeners
    }

    fn listeners_mut(&mut self) -> &mut Listeners<C::Timestamp> {
        &mut self.listeners
    }
}

impl<C: Clock> ListCrdt for FiArray<C> {
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
        writer: Value,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let items = self.read_full();
        let item = items.get(index).cloned().ok_or_else(|| {
            CrdtError::Value(format!(
                "index {index} out of bounds for list of {}",
                items.len()
            ))
        })?;
        self.delete(&item, writer)
    }

    fn position_of(&mut self, item: &Value) -> CrdtResult<usize> {
        self.read()
            .iter()
            .position(|candidate| candidate == item)
            .ok_or_else(|| CrdtError::Value(format!("item not present in list: {item:?}")))
    }
}
