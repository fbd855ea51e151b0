//! The delta envelope exchanged between replicas.
//!
//! A [`StateUpdate`] is the unit of replication: `(clock_uuid, ts, payload)`.
//! Updates are immutable once created, compare structurally, and have a
//! canonical byte form used for checksums and Merkle content ids.
//!
//! [`Payload`] enumerates the per-CRDT delta shapes. Each CRDT accepts
//! exactly its own variants and rejects the rest with a type error;
//! fractional-index arrays and causal trees reuse the LWW-map shape with
//! custom-wrapped items.

use crate::codec::{Decoder, Encoder, Packable};
use crate::error::{CrdtError, CrdtResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Observe/remove discriminant shared by the set-shaped payloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SetOp {
    Observe,
    Remove,
}

impl SetOp {
    fn wire_code(self) -> u8 {
        match self {
            SetOp::Observe => 0,
            SetOp::Remove => 1,
        }
    }

    fn from_wire(code: u8) -> CrdtResult<Self> {
        match code {
            0 => Ok(SetOp::Observe),
            1 => Ok(SetOp::Remove),
            other => Err(CrdtError::Codec(format!("unknown set op code {other}"))),
        }
    }
}

/// One element of a replicated growable array: the value, the wrapped
/// timestamp it was created at, and the writer that created it.
///
/// Items order by `(ts, writer, value)` ascending; that triple is the
/// array's deterministic total order over concurrent appends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RgaItem {
    pub value: Value,
    pub ts: Value,
    pub writer: Value,
}

impl RgaItem {
    pub fn new(value: Value, ts: Value, writer: Value) -> Self {
        Self { value, ts, writer }
    }

    fn encode_into(&self, enc: &mut Encoder) {
        enc.put_value(&self.value);
        enc.put_value(&self.ts);
        enc.put_value(&self.writer);
    }

    fn decode_from(dec: &mut Decoder<'_>) -> CrdtResult<Self> {
        Ok(Self {
            value: dec.take_value()?,
            ts: dec.take_value()?,
            writer: dec.take_value()?,
        })
    }
}

impl Ord for RgaItem {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ts
            .cmp(&other.ts)
            .then_with(|| self.writer.cmp(&other.writer))
            .then_with(|| self.value.cmp(&other.value))
    }
}

impl PartialOrd for RgaItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Packable for RgaItem {
    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let item = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(item)
    }
}

/// Per-CRDT delta shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Payload {
    /// Counter increment. `amount` is strictly positive.
    Counter { amount: i64 },
    /// PN-counter delta; exactly one of the two amounts is non-zero.
    PnCounter { positive: i64, negative: i64 },
    /// Grow-only set member.
    GSetMember { member: Value },
    /// Observed-remove set operation.
    SetMember { op: SetOp, member: Value },
    /// LWW register write.
    LwwWrite { writer: Value, value: Value },
    /// LWW map write; `value` is the none sentinel on unset. Also the wire
    /// shape of fractional-index arrays and causal trees.
    MapWrite { op: SetOp, key: Value, value: Value, writer: Value },
    /// Multi-value register write.
    MvWrite { value: Value },
    /// Multi-value map write.
    MvMapWrite { op: SetOp, key: Value, value: Value },
    /// Replicated-growable-array append or delete.
    RgaOp { op: SetOp, item: RgaItem },
    /// Counter-set delta: which counter, plus a PN-counter delta.
    CounterSet { counter_id: Value, positive: i64, negative: i64 },
}

const PAYLOAD_COUNTER: u8 = 0;
const PAYLOAD_PN_COUNTER: u8 = 1;
const PAYLOAD_GSET_MEMBER: u8 = 2;
const PAYLOAD_SET_MEMBER: u8 = 3;
const PAYLOAD_LWW_WRITE: u8 = 4;
const PAYLOAD_MAP_WRITE: u8 = 5;
const PAYLOAD_MV_WRITE: u8 = 6;
const PAYLOAD_MV_MAP_WRITE: u8 = 7;
const PAYLOAD_RGA_OP: u8 = 8;
const PAYLOAD_COUNTER_SET: u8 = 9;

impl Payload {
    /// Variant name for error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Payload::Counter { .. } => "counter",
            Payload::PnCounter { .. } => "pn-counter",
            Payload::GSetMember { .. } => "gset-member",
            Payload::SetMember { .. } => "set-member",
            Payload::LwwWrite { .. } => "lww-write",
            Payload::MapWrite { .. } => "map-write",
            Payload::MvWrite { .. } => "mv-write",
            Payload::MvMapWrite { .. } => "mv-map-write",
            Payload::RgaOp { .. } => "rga-op",
            Payload::CounterSet { .. } => "counter-set",
        }
    }

    pub(crate) fn encode_into(&self, enc: &mut Encoder) {
        match self {
            Payload::Counter { amount } => {
                enc.put_u8(PAYLOAD_COUNTER);
                enc.put_int(*amount);
            }
            Payload::PnCounter { positive, negative } => {
                enc.put_u8(PAYLOAD_PN_COUNTER);
                enc.put_int(*positive);
                enc.put_int(*negative);
            }
            Payload::GSetMember { member } => {
                enc.put_u8(PAYLOAD_GSET_MEMBER);
                enc.put_value(member);
            }
            Payload::SetMember { op, member } => {
                enc.put_u8(PAYLOAD_SET_MEMBER);
                enc.put_u8(op.wire_code());
                enc.put_value(member);
            }
            Payload::LwwWrite { writer, value } => {
                enc.put_u8(PAYLOAD_LWW_WRITE);
                enc.put_value(writer);
                enc.put_value(value);
            }
            Payload::MapWrite { op, key, value, writer } => {
                enc.put_u8(PAYLOAD_MAP_WRITE);
                enc.put_u8(op.wire_code());
                enc.put_value(key);
                enc.put_value(value);
                enc.put_value(writer);
            }
            Payload::MvWrite { value } => {
                enc.put_u8(PAYLOAD_MV_WRITE);
                enc.put_value(value);
            }
            Payload::MvMapWrite { op, key, value } => {
                enc.put_u8(PAYLOAD_MV_MAP_WRITE);
                enc.put_u8(op.wire_code());
                enc.put_value(key);
                enc.put_value(value);
            }
            Payload::RgaOp { op, item } => {
                enc.put_u8(PAYLOAD_RGA_OP);
                enc.put_u8(op.wire_code());
                item.encode_into(enc);
            }
            Payload::CounterSet { counter_id, positive, negative } => {
                enc.put_u8(PAYLOAD_COUNTER_SET);
                enc.put_value(counter_id);
                enc.put_int(*positive);
                enc.put_int(*negative);
            }
        }
    }

    pub(crate) fn decode_from(dec: &mut Decoder<'_>) -> CrdtResult<Self> {
        let variant = dec.take_u8()?;
        match variant {
            PAYLOAD_COUNTER => Ok(Payload::Counter { amount: dec.take_int()? }),
            PAYLOAD_PN_COUNTER => Ok(Payload::PnCounter {
                positive: dec.take_int()?,
                negative: dec.take_int()?,
            }),
            PAYLOAD_GSET_MEMBER => Ok(Payload::GSetMember { member: dec.take_value()? }),
            PAYLOAD_SET_MEMBER => Ok(Payload::SetMember {
                op: SetOp::from_wire(dec.take_u8()?)?,
                member: dec.take_value()?,
            }),
            PAYLOAD_LWW_WRITE => Ok(Payload::LwwWrite {
                writer: dec.take_value()?,
                value: dec.take_value()?,
            }),
            PAYLOAD_MAP_WRITE => Ok(Payload::MapWrite {
                op: SetOp::from_wire(dec.take_u8()?)?,
                key: dec.take_value()?,
                value: dec.take_value()?,
                writer: dec.take_value()?,
            }),
            PAYLOAD_MV_WRITE => Ok(Payload::MvWrite { value: dec.take_value()? }),
            PAYLOAD_MV_MAP_WRITE => Ok(Payload::MvMapWrite {
                op: SetOp::from_wire(dec.take_u8()?)?,
                key: dec.take_value()?,
                value: dec.take_value()?,
            }),
            PAYLOAD_RGA_OP => Ok(Payload::RgaOp {
                op: SetOp::from_wire(dec.take_u8()?)?,
                item: RgaItem::decode_from(dec)?,
            }),
            PAYLOAD_COUNTER_SET => Ok(Payload::CounterSet {
                counter_id: dec.take_value()?,
                positive: dec.take_int()?,
                negative: dec.take_int()?,
            }),
            other => Err(CrdtError::Codec(format!("unknown payload variant {other}"))),
        }
    }
}

impl Packable for Payload {
    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        self.encode_into(&mut enc);
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let payload = Self::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(payload)
    }
}

/// A delta state update: the unit of replication.
///
/// `ts` is generic over the owning clock's timestamp type so that vector or
/// hybrid clocks carry their own stamps without changing the envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateUpdate<T> {
    /// Uuid of the clock (and therefore the CRDT instance) this update
    /// belongs to.
    pub clock_uuid: Vec<u8>,
    /// Timestamp assigned by the writing replica.
    pub ts: T,
    /// The CRDT-specific delta.
    pub data: Payload,
}

impl<T> StateUpdate<T> {
    pub fn new(clock_uuid: impl Into<Vec<u8>>, ts: T, data: Payload) -> Self {
        Self {
            clock_uuid: clock_uuid.into(),
            ts,
            data,
        }
    }
}

impl<T: Packable> Packable for StateUpdate<T> {
    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_bytes(&self.clock_uuid);
        enc.put_bytes(&self.ts.pack());
        self.data.encode_into(&mut enc);
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let clock_uuid = dec.take_bytes()?;
        let ts_bytes = dec.take_bytes()?;
        let ts = T::unpack(&ts_bytes)?;
        let payload = Payload::decode_from(&mut dec)?;
        dec.finish()?;
        Ok(Self {
            clock_uuid,
            ts,
            data: payload,
        })
    }
}
