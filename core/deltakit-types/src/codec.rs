//! Canonical binary codec.
//!
//! Every encoded part is a frame: one tag byte, a big-endian u32 payload
//! length, then the payload. Frames are self-describing and nest (sequences
//! carry concatenated frames), so decoding never needs out-of-band schema.
//!
//! The encoding is canonical: one logical value has exactly one byte
//! rendering. Checksums and Merkle roots are computed over these bytes, so
//! any ambiguity here would make healthy replicas look divergent.

use crate::error::{CrdtError, CrdtResult};
use crate::value::Value;
use bigdecimal::BigDecimal;
use std::str::FromStr;

/// Frame tags. One byte each, mnemonic ASCII.
const TAG_NONE: u8 = b'n';
const TAG_U8: u8 = b'u';
const TAG_INT: u8 = b'i';
const TAG_FLOAT: u8 = b'f';
const TAG_DECIMAL: u8 = b'd';
const TAG_STR: u8 = b's';
const TAG_BYTES: u8 = b'b';
const TAG_SEQ: u8 = b'q';
const TAG_CUSTOM: u8 = b'c';

/// A type with a canonical byte representation.
///
/// `unpack(pack(x)) == x` must hold, and equal values must pack to equal
/// bytes on every replica.
pub trait Packable: Sized {
    /// Serialize into canonical bytes.
    fn pack(&self) -> Vec<u8>;

    /// Deserialize from canonical bytes, consuming the whole slice.
    fn unpack(data: &[u8]) -> CrdtResult<Self>;
}

impl Packable for u64 {
    fn pack(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let bytes: [u8; 8] = data
            .try_into()
            .map_err(|_| CrdtError::Codec(format!("expected 8 timestamp bytes, got {}", data.len())))?;
        Ok(u64::from_be_bytes(bytes))
    }
}

/// Writes canonical frames into a growing buffer.
#[derive(Debug, Default)]
pub struct Encoder {
    buf: Vec<u8>,
}

impl Encoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consumes the encoder, returning the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn frame(&mut self, tag: u8, payload: &[u8]) {
        self.buf.push(tag);
        self.buf.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        self.buf.extend_from_slice(payload);
    }

    pub fn put_none(&mut self) {
        self.frame(TAG_NONE, &[]);
    }

    pub fn put_u8(&mut self, v: u8) {
        self.frame(TAG_U8, &[v]);
    }

    pub fn put_int(&mut self, v: i64) {
        self.frame(TAG_INT, &v.to_be_bytes());
    }

    pub fn put_float(&mut self, v: f64) {
        self.frame(TAG_FLOAT, &v.to_bits().to_be_bytes());
    }

    /// Encodes a decimal as its canonical (normalized) text form.
    pub fn put_decimal(&mut self, v: &BigDecimal) {
        self.frame(TAG_DECIMAL, v.normalized().to_string().as_bytes());
    }

    pub fn put_str(&mut self, v: &str) {
        self.frame(TAG_STR, v.as_bytes());
    }

    pub fn put_bytes(&mut self, v: &[u8]) {
        self.frame(TAG_BYTES, v);
    }

    /// Encodes a user-tagged value: length-prefixed type tag, then raw bytes.
    pub fn put_custom(&mut self, type_tag: &str, bytes: &[u8]) {
        let mut payload = Vec::with_capacity(4 + type_tag.len() + bytes.len());
        payload.extend_from_slice(&(type_tag.len() as u32).to_be_bytes());
        payload.extend_from_slice(type_tag.as_bytes());
        payload.extend_from_slice(bytes);
        self.frame(TAG_CUSTOM, &payload);
    }

    /// Encodes a nested sequence; the closure fills the inner frames.
    pub fn put_seq(&mut self, fill: impl FnOnce(&mut Encoder)) {
        let mut inner = Encoder::new();
        fill(&mut inner);
        self.frame(TAG_SEQ, &inner.buf);
    }

    pub fn put_value(&mut self, v: &Value) {
        match v {
            Value::None => self.put_none(),
            Value::Int(i) => self.put_int(*i),
            Value::Float(f) => self.put_float(*f),
            Value::Decimal(d) => self.put_decimal(d),
            Value::Str(s) => self.put_str(s),
            Value::Bytes(b) => self.put_bytes(b),
            Value::Custom { type_tag, bytes } => self.put_custom(type_tag, bytes),
        }
    }
}

/// Reads canonical frames from a byte slice.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
}

impl<'a> Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    /// True once every frame has been consumed.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn take_frame(&mut self) -> CrdtResult<(u8, &'a [u8])> {
        if self.data.len() < 5 {
            return Err(CrdtError::Codec(format!(
                "truncated frame header: {} bytes remaining",
                self.data.len()
            )));
        }
        let tag = self.data[0];
        let len = u32::from_be_bytes([self.data[1], self.data[2], self.data[3], self.data[4]]) as usize;
        if self.data.len() < 5 + len {
            return Err(CrdtError::Codec(format!(
                "truncated frame payload: need {len}, have {}",
                self.data.len() - 5
            )));
        }
        let payload = &self.data[5..5 + len];
        self.data = &self.data[5 + len..];
        Ok((tag, payload))
    }

    fn expect(&mut self, want: u8) -> CrdtResult<&'a [u8]> {
        let (tag, payload) = self.take_frame()?;
        if tag != want {
            return Err(CrdtError::Codec(format!(
                "expected frame tag '{}', found '{}'",
                want as char, tag as char
            )));
        }
        Ok(payload)
    }

    pub fn take_u8(&mut self) -> CrdtResult<u8> {
        let payload = self.expect(TAG_U8)?;
        match payload {
            [v] => Ok(*v),
            _ => Err(CrdtError::Codec(format!("u8 frame has {} bytes", payload.len()))),
        }
    }

    pub fn take_int(&mut self) -> CrdtResult<i64> {
        let payload = self.expect(TAG_INT)?;
        let bytes: [u8; 8] = payload
            .try_into()
            .map_err(|_| CrdtError::Codec(format!("int frame has {} bytes", payload.len())))?;
        Ok(i64::from_be_bytes(bytes))
    }

    pub fn take_bytes(&mut self) -> CrdtResult<Vec<u8>> {
        Ok(self.expect(TAG_BYTES)?.to_vec())
    }

    pub fn take_decimal(&mut self) -> CrdtResult<BigDecimal> {
        let payload = self.expect(TAG_DECIMAL)?;
        let text = std::str::from_utf8(payload)
            .map_err(|e| CrdtError::Codec(format!("invalid utf-8 in decimal frame: {e}")))?;
        BigDecimal::from_str(text)
            .map_err(|e| CrdtError::Codec(format!("invalid decimal {text:?}: {e}")))
    }

    pub fn take_str(&mut self) -> CrdtResult<String> {
        let payload = self.expect(TAG_STR)?;
        String::from_utf8(payload.to_vec())
            .map_err(|e| CrdtError::Codec(format!("invalid utf-8 in string frame: {e}")))
    }

    /// Opens a nested sequence frame, returning a decoder over its contents.
    pub fn take_seq(&mut self) -> CrdtResult<Decoder<'a>> {
        Ok(Decoder::new(self.expect(TAG_SEQ)?))
    }

    pub fn take_value(&mut self) -> CrdtResult<Value> {
        let (tag, payload) = self.take_frame()?;
        match tag {
            TAG_NONE => {
                if payload.is_empty() {
                    Ok(Value::None)
                } else {
                    Err(CrdtError::Codec("none frame carries payload".into()))
                }
            }
            TAG_INT => {
                let bytes: [u8; 8] = payload
                    .try_into()
                    .map_err(|_| CrdtError::Codec(format!("int frame has {} bytes", payload.len())))?;
                Ok(Value::Int(i64::from_be_bytes(bytes)))
            }
            TAG_FLOAT => {
                let bytes: [u8; 8] = payload
                    .try_into()
                    .map_err(|_| CrdtError::Codec(format!("float frame has {} bytes", payload.len())))?;
                Ok(Value::Float(f64::from_bits(u64::from_be_bytes(bytes))))
            }
            TAG_DECIMAL => {
                let text = std::str::from_utf8(payload)
                    .map_err(|e| CrdtError::Codec(format!("invalid utf-8 in decimal frame: {e}")))?;
                let decimal = BigDecimal::from_str(text)
                    .map_err(|e| CrdtError::Codec(format!("invalid decimal {text:?}: {e}")))?;
                Ok(Value::decimal(decimal))
            }
            TAG_STR => {
                let text = String::from_utf8(payload.to_vec())
                    .map_err(|e| CrdtError::Codec(format!("invalid utf-8 in string frame: {e}")))?;
                Ok(Value::Str(text))
            }
            TAG_BYTES => Ok(Value::Bytes(payload.to_vec())),
            TAG_CUSTOM => {
                if payload.len() < 4 {
                    return Err(CrdtError::Codec("custom frame shorter than tag prefix".into()));
                }
                let tag_len =
                    u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) as usize;
                if payload.len() < 4 + tag_len {
                    return Err(CrdtError::Codec("custom frame type tag truncated".into()));
                }
                let type_tag = String::from_utf8(payload[4..4 + tag_len].to_vec())
                    .map_err(|e| CrdtError::Codec(format!("invalid utf-8 in type tag: {e}")))?;
                Ok(Value::Custom {
                    type_tag,
                    bytes: payload[4 + tag_len..].to_vec(),
                })
            }
            other => Err(CrdtError::Codec(format!(
                "unknown value frame tag '{}'",
                other as char
            ))),
        }
    }

    /// Fails unless every byte has been consumed.
    pub fn finish(&self) -> CrdtResult<()> {
        if self.data.is_empty() {
            Ok(())
        } else {
            Err(CrdtError::Codec(format!(
                "{} trailing bytes after final frame",
                self.data.len()
            )))
        }
    }
}

impl Packable for Value {
    fn pack(&self) -> Vec<u8> {
        let mut enc = Encoder::new();
        enc.put_value(self);
        enc.into_bytes()
    }

    fn unpack(data: &[u8]) -> CrdtResult<Self> {
        let mut dec = Decoder::new(data);
        let value = dec.take_value()?;
        dec.finish()?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_round_trips() {
        let values = [
            Value::None,
            Value::Int(-42),
            Value::Int(i64::MAX),
            Value::Float(1.5),
            Value::decimal(BigDecimal::from_str("0.500").unwrap()),
            Value::Str("héllo".into()),
            Value::Bytes(vec![0, 1, 2, 255]),
            Value::Custom {
                type_tag: "widget".into(),
                bytes: vec![9, 9],
            },
        ];
        for v in values {
            let packed = v.pack();
            assert_eq!(Value::unpack(&packed).unwrap(), v);
        }
    }

    #[test]
    fn decimal_encoding_is_normalized() {
        let a = Value::decimal(BigDecimal::from_str("0.50").unwrap());
        let b = Value::decimal(BigDecimal::from_str("0.5").unwrap());
        assert_eq!(a.pack(), b.pack());
    }

    #[test]
    fn truncated_frames_are_codec_errors() {
        let packed = Value::Str("hello".into()).pack();
        for cut in 0..packed.len() {
            let err = Value::unpack(&packed[..cut]).unwrap_err();
            assert!(matches!(err, CrdtError::Codec(_)), "cut at {cut}: {err}");
        }
    }

    #[test]
    fn trailing_bytes_are_rejected() {
        let mut packed = Value::Int(1).pack();
        packed.push(0);
        assert!(matches!(Value::unpack(&packed), Err(CrdtError::Codec(_))));
    }

    #[test]
    fn sequences_nest() {
        let mut enc = Encoder::new();
        enc.put_seq(|e| {
            e.put_int(1);
            e.put_seq(|inner| inner.put_str("deep"));
        });
        let bytes = enc.into_bytes();

        let mut dec = Decoder::new(&bytes);
        let mut seq = dec.take_seq().unwrap();
        assert_eq!(seq.take_int().unwrap(), 1);
        let mut inner = seq.take_seq().unwrap();
        assert_eq!(inner.take_str().unwrap(), "deep");
        assert!(inner.is_empty());
        assert!(seq.is_empty());
        dec.finish().unwrap();
    }

    #[test]
    fn wrong_tag_is_rejected() {
        let mut enc = Encoder::new();
        enc.put_int(7);
        let bytes = enc.into_bytes();
        let mut dec = Decoder::new(&bytes);
        assert!(matches!(dec.take_str(), Err(CrdtError::Codec(_))));
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        fn value_strategy() -> impl Strategy<Value = Value> {
            prop_oneof![
                Just(Value::None),
                any::<i64>().prop_map(Value::Int),
                any::<f64>().prop_map(Value::Float),
                any::<i64>().prop_map(|n| Value::decimal(BigDecimal::from(n))),
                "[ -~]{0,40}".prop_map(Value::Str),
                proptest::collection::vec(any::<u8>(), 0..40).prop_map(Value::Bytes),
                ("[a-z]{1,10}", proptest::collection::vec(any::<u8>(), 0..20))
                    .prop_map(|(type_tag, bytes)| Value::Custom { type_tag, bytes }),
            ]
        }

        proptest! {
            #[test]
            fn any_value_round_trips(value in value_strategy()) {
                let packed = value.pack();
                prop_assert_eq!(Value::unpack(&packed).expect("canonical bytes"), value);
            }

            #[test]
            fn encoding_is_deterministic(value in value_strategy()) {
                prop_assert_eq!(value.pack(), value.clone().pack());
            }
        }
    }
}
