//! The `Value` payload carrier.
//!
//! CRDT payloads, set members, map keys, register contents, and writer ids
//! are all `Value`s: a sealed sum of primitive variants plus a user-tagged
//! bytes variant for application-defined types.
//!
//! `Value` carries the library-wide total order used for deterministic
//! tie-breaks: values compare by `(type tag, canonical payload bytes)`
//! lexicographically, so any two replicas rank any two values identically —
//! even across heterogeneous types. Equality and hashing follow the same
//! canonical form.

use crate::error::{CrdtError, CrdtResult};
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};

/// A user-defined type that can live inside [`Value::Custom`].
///
/// The type tag must be stable across replicas and releases; it is part of
/// the wire format and of the tie-break order.
pub trait CustomValue: Sized {
    /// Stable identifier for this type on the wire.
    const TYPE_TAG: &'static str;

    /// Canonical byte form.
    fn to_bytes(&self) -> Vec<u8>;

    /// Decode from canonical bytes.
    fn from_bytes(data: &[u8]) -> CrdtResult<Self>;
}

/// A serializable, hashable, totally-ordered payload value.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Value {
    /// Sentinel "no value". Used as the unset marker in LWW maps.
    None,
    Int(i64),
    Float(f64),
    /// Arbitrary-precision decimal, normalized at construction.
    Decimal(BigDecimal),
    Str(String),
    Bytes(Vec<u8>),
    /// A user-defined type carried as `(type_tag, canonical bytes)`.
    Custom { type_tag: String, bytes: Vec<u8> },
}

impl Value {
    /// Builds a decimal value, normalizing so one number has one encoding.
    pub fn decimal(d: BigDecimal) -> Self {
        Value::Decimal(d.normalized())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into())
    }

    pub fn bytes(b: impl Into<Vec<u8>>) -> Self {
        Value::Bytes(b.into())
    }

    /// Wraps a [`CustomValue`] implementation.
    pub fn custom<T: CustomValue>(v: &T) -> Self {
        Value::Custom {
            type_tag: T::TYPE_TAG.to_string(),
            bytes: v.to_bytes(),
        }
    }

    /// Decodes a [`Value::Custom`] back into its concrete type.
    pub fn decode_custom<T: CustomValue>(&self) -> CrdtResult<T> {
        match self {
            Value::Custom { type_tag, bytes } if type_tag == T::TYPE_TAG => T::from_bytes(bytes),
            Value::Custom { type_tag, .. } => Err(CrdtError::Type(format!(
                "expected custom value tagged {:?}, found {type_tag:?}",
                T::TYPE_TAG
            ))),
            other => Err(CrdtError::Type(format!(
                "expected custom value tagged {:?}, found {}",
                T::TYPE_TAG,
                other.kind_name()
            ))),
        }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Value::None)
    }

    /// Human-readable variant name, used in error messages.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::None => "none",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Decimal(_) => "decimal",
            Value::Str(_) => "str",
            Value::Bytes(_) => "bytes",
            Value::Custom { .. } => "custom",
        }
    }

    /// Position of the variant in the cross-type order.
    fn tag_id(&self) -> u8 {
        match self {
            Value::None => 0,
            Value::Int(_) => 1,
            Value::Float(_) => 2,
            Value::Decimal(_) => 3,
            Value::Str(_) => 4,
            Value::Bytes(_) => 5,
            Value::Custom { .. } => 6,
        }
    }
}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::None, Value::None) => Ordering::Equal,
            (Value::Int(a), Value::Int(b)) => a.to_be_bytes().cmp(&b.to_be_bytes()),
            (Value::Float(a), Value::Float(b)) => {
                a.to_bits().to_be_bytes().cmp(&b.to_bits().to_be_bytes())
            }
            (Value::Decimal(a), Value::Decimal(b)) => {
                a.to_string().as_bytes().cmp(b.to_string().as_bytes())
            }
            (Value::Str(a), Value::Str(b)) => a.as_bytes().cmp(b.as_bytes()),
            (Value::Bytes(a), Value::Bytes(b)) => a.cmp(b),
            (
                Value::Custom { type_tag: ta, bytes: ba },
                Value::Custom { type_tag: tb, bytes: bb },
            ) => ta.cmp(tb).then_with(|| ba.cmp(bb)),
            _ => self.tag_id().cmp(&other.tag_id()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u8(self.tag_id());
        match self {
            Value::None => {}
            Value::Int(i) => state.write(&i.to_be_bytes()),
            Value::Float(f) => state.write(&f.to_bits().to_be_bytes()),
            Value::Decimal(d) => state.write(d.to_string().as_bytes()),
            Value::Str(s) => state.write(s.as_bytes()),
            Value::Bytes(b) => state.write(b),
            Value::Custom { type_tag, bytes } => {
                state.write(type_tag.as_bytes());
                state.write_u8(0);
                state.write(bytes);
            }
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn cross_type_order_follows_tag_ids() {
        let ordered = [
            Value::None,
            Value::Int(0),
            Value::Float(0.0),
            Value::decimal(BigDecimal::from_str("0").unwrap()),
            Value::Str("".into()),
            Value::Bytes(vec![]),
            Value::Custom { type_tag: "t".into(), bytes: vec![] },
        ];
        for pair in ordered.windows(2) {
            assert!(pair[0] < pair[1], "{:?} should sort before {:?}", pair[0], pair[1]);
        }
    }

    #[test]
    fn int_order_matches_numeric_for_non_negative() {
        assert!(Value::Int(1) < Value::Int(2));
        assert!(Value::Int(0) < Value::Int(i64::MAX));
    }

    #[test]
    fn str_order_is_byte_lexicographic() {
        assert!(Value::str("a") < Value::str("b"));
        assert!(Value::str("a") < Value::str("ab"));
    }

    #[test]
    fn decimal_equality_ignores_trailing_zeros() {
        let a = Value::decimal(BigDecimal::from_str("0.50").unwrap());
        let b = Value::decimal(BigDecimal::from_str("0.5").unwrap());
        assert_eq!(a, b);
    }

    #[test]
    fn values_work_as_btree_keys() {
        let mut map = std::collections::BTreeMap::new();
        map.insert(Value::str("k"), 1);
        map.insert(Value::Int(3), 2);
        map.insert(Value::str("k"), 3);
        assert_eq!(map.len(), 2);
        assert_eq!(map[&Value::str("k")], 3);
    }

    #[test]
    fn custom_round_trip() {
        struct Point {
            x: i64,
            y: i64,
        }
        impl CustomValue for Point {
            const TYPE_TAG: &'static str = "point";
            fn to_bytes(&self) -> Vec<u8> {
                let mut enc = crate::Encoder::new();
                enc.put_int(self.x);
                enc.put_int(self.y);
                enc.into_bytes()
            }
            fn from_bytes(data: &[u8]) -> CrdtResult<Self> {
                let mut dec = crate::Decoder::new(data);
                let x = dec.take_int()?;
                let y = dec.take_int()?;
                dec.finish()?;
                Ok(Point { x, y })
            }
        }

        let wrapped = Value::custom(&Point { x: 3, y: -4 });
        let decoded: Point = wrapped.decode_custom().unwrap();
        assert_eq!(decoded.x, 3);
        assert_eq!(decoded.y, -4);
        assert!(wrapped.decode_custom::<Point>().is_ok());
    }

    #[test]
    fn decode_custom_rejects_foreign_tags() {
        struct A;
        impl CustomValue for A {
            const TYPE_TAG: &'static str = "a";
            fn to_bytes(&self) -> Vec<u8> {
                vec![]
            }
            fn from_bytes(_: &[u8]) -> CrdtResult<Self> {
                Ok(A)
            }
        }
        let wrapped = Value::Custom { type_tag: "b".into(), bytes: vec![] };
        assert!(matches!(wrapped.decode_custom::<A>(), Err(CrdtError::Type(_))));
    }
}
