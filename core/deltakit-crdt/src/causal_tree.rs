//! Causal tree CRDT.

use crate::events::Listeners;
use crate::lww_map::LwwMapState;
use crate::traits::{Crdt, ListCrdt};
use deltakit_types::{
    Clock, CrdtError, CrdtResult, CustomValue, Decoder, Encoder, Payload, ScalarClock, SetOp,
    StateUpdate, Value,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::trace;
use uuid::Uuid;

/// One node of a causal tree: a value linked to its parent by uuid. An
/// empty `parent_uuid` marks a root. Deleted nodes stay in the tree as
/// invisible tombstones so their descendants keep resolving the ancestor
/// chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtNode {
    pub value: Value,
    pub uuid: Vec<u8>,
    pub parent_uuid: Vec<u8>,
    pub visible: bool,
}

impl CtNode {
    pub fn new(value: Value, uuid: Vec<u8>, parent_uuid: Vec<u8>, visible: bool) -> Self {
        Self {
            value,
            uuid,
            parent_uuid,
            visible,
        }
    }

    pub fn is_root(&self) -> bool {
        self.parent_uuid.is_empty()
    }
}

impl deltakit_types::Packable for CtNode {
    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_value(&self.value);
        enc.put_bytes(&self.uuid);
        enc.put_bytes(&self.parent_uuid);
        enc.put_u8(u8::from(self.visible));
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let value = dec.take_value()?;
        let uuid = dec.take_bytes()?;
        let parent_uuid = dec.take_bytes()?;
        let visible = match dec.take_u8()? {
            0 => false,
            1 => true,
            other => {
                return Err(CrdtError::Codec(format!(
                    "ct-node visibility flag must be 0 or 1, got {other}"
                )))
            }
        };
        dec.finish()?;
        Ok(Self::new(value, uuid, parent_uuid, visible))
    }
}

impl CustomValue for CtNode {
    const TYPE_TAG: &'static str = "ct-node";

    fn to_bytes(&self) -> Vec<u8> {
        deltakit_types::Packable::pack(self)
    }

    fn from_bytes(data: &[u8]) -> CrdtResult<Self> {
        deltakit_types::Packable::unpack(data)
    }
}

/// An ordered list derived from a parent-linked graph, stored in an
/// embedded LWW map from node uuid to [`CtNode`].
///
/// The list order is a depth-first traversal from the roots, siblings in
/// uuid order. Nodes that the applied updates place inside a parent cycle,
/// and orphans whose ancestor chain is incomplete, are excluded from the
/// ordered views and surfaced by [`CausalTree::read_excluded`]; exclusion
/// is a pure function of the applied update set, so every replica excludes
/// the same nodes.
#[derive(Debug, Clone)]
pub struct CausalTree<C: Clock = ScalarClock> {
    clock: C,
    positions: LwwMapState<C::Timestamp>,
    /// Decoded mirror of the visible registers, keyed by node uuid.
    nodes: BTreeMap<Vec<u8>, CtNode>,
    /// Reachable nodes in depth-first order, tombstones included.
    cache: Vec<CtNode>,
    /// Present-but-unreachable nodes (cycle members and orphans).
    excluded: Vec<CtNode>,
    listeners: Listeners<C::Timestamp>,
}

impl CausalTree<ScalarClock> {
    pub fn new() -> Self {
        Self::with_clock(ScalarClock::new())
    }
}

impl Default for CausalTree<ScalarClock> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Clock> CausalTree<C> {
    pub fn with_clock(clock: C) -> Self {
        Self {
            clock,
            positions: LwwMapState::new(),
            nodes: BTreeMap::new(),
            cache: Vec::new(),
            excluded: Vec::new(),
            listeners: Listeners::new(),
        }
    }

    /// Places `value` as a node with the given uuid under `parent_uuid`
    /// (empty for a root).
    pub fn put(
        &mut self,
        value: Value,
        writer: Value,
        uuid: Vec<u8>,
        parent_uuid: Vec<u8>,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        if uuid.is_empty() {
            return Err(CrdtError::Value("causal-tree node uuid must not be empty".into()));
        }
        let node = CtNode::new(value, uuid, parent_uuid, true);
        self.emit_node(&node, writer)
    }

    /// Places `value` under the node identified by `parent_uuid`, with a
    /// generated uuid.
    pub fn put_after(
        &mut self,
        value: Value,
        writer: Value,
        parent_uuid: Vec<u8>,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        self.put(value, writer, Uuid::new_v4().as_bytes().to_vec(), parent_uuid)
    }

    /// Places `value` as the first item. Any other roots are re-parented
    /// under the new node; every produced update is returned so the caller
    /// propagates the whole batch.
    pub fn put_first(
        &mut self,
        value: Value,
        writer: Value,
    ) -> CrdtResult<Vec<StateUpdate<C::Timestamp>>> {
        let new_uuid = Uuid::new_v4().as_bytes().to_vec();
        let first = self.put(value, writer.clone(), new_uuid.clone(), Vec::new())?;
        let mut updates = vec![first];
        let other_roots: Vec<CtNode> = self
            .cache
            .iter()
            .filter(|node| node.is_root() && node.uuid != new_uuid)
            .cloned()
            .collect();
        for root in other_roots {
            updates.push(self.move_item(&root, writer.clone(), new_uuid.clone())?);
        }
        Ok(updates)
    }

    /// Appends `value` after the current last visible node.
    pub fn append(
        &mut self,
        value: Value,
        writer: Value,
    ) -> CrdtResult<Vec<StateUpdate<C::Timestamp>>> {
        let last_visible = self
            .cache
            .iter()
            .rev()
            .find(|node| node.visible)
            .map(|node| node.uuid.clone());
        match last_visible {
            Some(parent_uuid) => Ok(vec![self.put_after(value, writer, parent_uuid)?]),
            None => self.put_first(value, writer),
        }
    }

    /// Re-parents a node; one LWW write that changes only the parent link.
    pub fn move_item(
        &mut self,
        node: &CtNode,
        writer: Value,
        new_parent_uuid: Vec<u8>,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let moved = CtNode::new(
            node.value.clone(),
            node.uuid.clone(),
            new_parent_uuid,
            node.visible,
        );
        self.emit_node(&moved, writer)
    }

    /// Tombstones a node: same uuid and parent, `visible = false`, value
    /// retained so descendants still resolve their ancestor chain.
    pub fn delete(&mut self, node: &CtNode, writer: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let tombstone = CtNode::new(
            node.value.clone(),
            node.uuid.clone(),
            node.parent_uuid.clone(),
            false,
        );
        self.emit_node(&tombstone, writer)
    }

    /// Deletes the item at `index` of the visible list.
    pub fn remove(&mut self, index: usize, writer: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let visible: Vec<CtNode> = self.cache.iter().filter(|n| n.visible).cloned().collect();
        let node = visible.get(index).ok_or_else(|| {
            CrdtError::Value(format!(
                "index {index} out of bounds for list of {}",
                visible.len()
            ))
        })?;
        self.delete(&node.clone(), writer)
    }

    fn emit_node(&mut self, node: &CtNode, writer: Value) -> CrdtResult<StateUpdate<C::Timestamp>> {
        let update = StateUpdate::new(
            self.clock.uuid().to_vec(),
            self.clock.read(),
            Payload::MapWrite {
                op: SetOp::Observe,
                key: Value::Bytes(node.uuid.clone()),
                value: Value::custom(node),
                writer,
            },
        );
        self.update(&update)?;
        Ok(update)
    }

    /// The full reachable list, tombstones included. Use these nodes for
    /// `delete` and `move_item`.
    pub fn read_full(&mut self) -> Vec<CtNode> {
        self.cache.clone()
    }

    /// Nodes excluded from the ordered views: members of parent cycles and
    /// orphans whose ancestors are missing.
    pub fn read_excluded(&mut self) -> Vec<CtNode> {
        self.excluded.clone()
    }

    /// Recomputes the depth-first order and the excluded set from the node
    /// mirror.
    fn calculate_cache(&mut self) {
        // Nodes are keyed by uuid, so each children list comes out already
        // in sibling (uuid) order.
        let mut children: BTreeMap<&[u8], Vec<&CtNode>> = BTreeMap::new();
        for node in self.nodes.values() {
            children
                .entry(node.parent_uuid.as_slice())
                .or_default()
                .push(node);
        }

        let mut ordered: Vec<CtNode> = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<&CtNode> = children
            .get(&b""[..])
            .map(|roots| roots.iter().rev().copied().collect())
            .unwrap_or_default();
        while let Some(node) = stack.pop() {
            ordered.push(node.clone());
            if let Some(kids) = children.get(node.uuid.as_slice()) {
                for kid in kids.iter().rev() {
                    stack.push(kid);
                }
            }
        }

        let reachable: std::collections::BTreeSet<&[u8]> =
            ordered.iter().map(|node| node.uuid.as_slice()).collect();
        self.excluded = self
            .nodes
            .values()
            .filter(|node| !reachable.contains(node.uuid.as_slice()))
            .cloned()
            .collect();
        self.cache = ordered;
        trace!(
            reachable = self.cache.len(),
            excluded = self.excluded.len(),
            "rebuilt causal tree cache"
        );
    }

    /// Cheap in-place update when only value or visibility changed; any
    /// structural change (new node, re-parent, removal) recomputes the
    /// traversal, which also re-evaluates cycles and orphan adoption.
    fn update_cache(&mut self, winner: Option<CtNode>) {
        match winner {
            Some(node) => {
                if let Some(position) = self.cache.iter().position(|n| n.uuid == node.uuid) {
                    if self.cache[position].parent_uuid == node.parent_uuid {
                        self.cache[position] = node;
                        return;
                    }
                }
                self.calculate_cache();
            }
            None => self.calculate_cache(),
        }
    }
}

impl<C: Clock> Crdt for CausalTree<C> {
    type Clock = C;
    type View = Vec<Value>;

    fn clock(&self) -> &C {
        &self.clock
    }

    /// Values of the visible reachable nodes, in tree order.
    fn read(&mut self) -> Vec<Value> {
        self.cache
            .iter()
            .filter(|node| node.visible)
            .map(|node| node.value.clone())
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
                    "causal-tree update requires a map-write payload, found {}",
                    other.kind_name()
                )))
            }
        };
        let uuid = match key {
            Value::Bytes(uuid) => uuid.clone(),
            other => {
                return Err(CrdtError::Type(format!(
                    "causal-tree keys are node uuids (bytes), found {}",
                    other.kind_name()
                )))
            }
        };
        let incoming = match op {
            SetOp::Observe => {
                let node = value.decode_custom::<CtNode>()?;
                if node.uuid != uuid {
                    return Err(CrdtError::Value(
                        "causal-tree node uuid must match its map key".into(),
                    ));
                }
                Some(node)
            }
            SetOp::Remove => {
                if !value.is_none() {
                    return Err(CrdtError::Type(
                        "causal-tree unset must carry the none sentinel".into(),
                    ));
                }
                None
            }
        };

        self.invoke_listeners(update)?;
        self.positions.apply::<C>(op, key, writer, value, &update.ts);
        self.clock.update(&update.ts);

        // A write that lost the LWW race changes nothing visible.
        if self.positions.get(key).is_none() {
            if self.nodes.remove(&uuid).is_some() {
                self.update_cache(None);
            }
        } else {
            let winner = {
                let stored = self.positions.get(key);
                incoming.filter(|node| stored == Some(&Value::custom(node)))
            };
            if let Some(node) = winner {
                self.nodes.insert(uuid, node.clone());
                self.update_cache(Some(node));
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

        let mut nodes = BTreeMap::new();
        for (key, value) in positions.read() {
            let node = value.decode_custom::<CtNode>()?;
            let uuid = match key {
                Value::Bytes(uuid) => uuid.clone(),
                other => {
                    return Err(CrdtError::Type(format!(
                        "causal-tree keys are node uuids (bytes), found {}",
                        other.kind_name()
                    )))
                }
            };
            if node.uuid != uuid {
                return Err(CrdtError::Value(
                    "causal-tree node uuid must match its map key".into(),
                ));
            }
            nodes.insert(uuid, node);
        }

        let mut tree = Self {
            clock,
            positions,
            nodes,
            cache: Vec::new(),
            excluded: Vec::new(),
            listeners: Listeners::new(),
        };
        tree.calculate_cache();
        Ok(tree)
    }

    fn listeners(&self) -> &Listeners<C::Timestamp> {
        &self.listeners
    }

    fn listeners_mut(&mut self) -> &mut Listeners<C::Timestamp> {
        &mut self.listeners
    }
}

impl<C: Clock> ListCrdt for CausalTree<C> {
    fn list_append(
        &mut self,
        item: Value,
        writer: Value,
    ) -> CrdtResult<Vec<StateUpdate<C::Timestamp>>> {
        self.append(item, writer)
    }

    fn list_remove(
        &mut self,
        index: usize,
        writer: Value,
    ) -> CrdtResult<StateUpdate<C::Timestamp>> {
        self.remove(index, writer)
    }

    fn position_of(&mut self, item: &Value) -> CrdtResult<usize> {
        self.read()
            .iter()
            .position(|candidate| candidate == item)
            .ok_or_else(|| CrdtError::Value(format!("item not present in list: {item:?}")))
    }
}
