//! Data section encoding for MMDB databases
//!
//! Provides MMDB-compatible value encoding for the data section of databases
//! built in memory (patch trees, merged dumps). Decoding lives in
//! [`crate::decoder`], which binds values straight into serde destinations;
//! [`DataValue`] is the dynamic destination used when no schema is known.
//!
//! # Supported Types
//!
//! - **Pointer**: Reference to another data item (written for repeated values)
//! - **String**: UTF-8 text data
//! - **Double**: 64-bit floating point (IEEE 754)
//! - **Bytes**: Raw byte arrays
//! - **Uint16** / **Uint32** / **Uint64** / **Uint128**: Unsigned integers
//! - **Map**: Key-value pairs (string keys)
//! - **Int32**: Signed 32-bit integers
//! - **Array**: Ordered lists of values
//! - **Bool**: Boolean values
//! - **Float**: 32-bit floating point (IEEE 754)
//!
//! # Format
//!
//! Control byte encodes type (3 bits) and size/payload (5 bits). Types above 7
//! are written as type 0 followed by a byte holding `type - 7`; size extension
//! bytes come after that.
//!
//! See: https://maxmind.github.io/MaxMind-DB/

use crate::error::{GeosError, Result};
use serde::de::{self, Deserialize, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};
use std::collections::HashMap;
use std::fmt;

/// Data value that can be stored in the data section
#[derive(Debug, Clone, PartialEq)]
pub enum DataValue {
    /// UTF-8 string
    String(String),
    /// IEEE 754 double precision float
    Double(f64),
    /// Raw byte array
    Bytes(Vec<u8>),
    /// Unsigned 16-bit integer
    Uint16(u16),
    /// Unsigned 32-bit integer
    Uint32(u32),
    /// Key-value map (MMDB maps have string keys)
    Map(HashMap<String, DataValue>),
    /// Signed 32-bit integer
    Int32(i32),
    /// Unsigned 64-bit integer
    Uint64(u64),
    /// Unsigned 128-bit integer
    Uint128(u128),
    /// Array of values
    Array(Vec<DataValue>),
    /// Boolean value
    Bool(bool),
    /// IEEE 754 single precision float
    Float(f32),
}

impl DataValue {
    /// Borrow the inner map, if this is a map
    pub fn as_map(&self) -> Option<&HashMap<String, DataValue>> {
        match self {
            DataValue::Map(m) => Some(m),
            _ => None,
        }
    }

    /// Borrow the inner string, if this is a string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            DataValue::String(s) => Some(s),
            _ => None,
        }
    }

    /// Widen any unsigned integer variant to u64
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            DataValue::Uint16(n) => Some(*n as u64),
            DataValue::Uint32(n) => Some(*n as u64),
            DataValue::Uint64(n) => Some(*n),
            DataValue::Uint128(n) => u64::try_from(*n).ok(),
            _ => None,
        }
    }

    /// Look up a key when this is a map
    pub fn get(&self, key: &str) -> Option<&DataValue> {
        self.as_map().and_then(|m| m.get(key))
    }

    /// Merge `other` into `self` at depth 1.
    ///
    /// Keys of `other` overwrite keys of `self`; nested maps and arrays are
    /// replaced wholesale. Non-map operands yield `other`.
    pub fn merge_top_level(&self, other: &DataValue) -> DataValue {
        match (self, other) {
            (DataValue::Map(base), DataValue::Map(update)) => {
                let mut merged = base.clone();
                for (k, v) in update {
                    merged.insert(k.clone(), v.clone());
                }
                DataValue::Map(merged)
            }
            _ => other.clone(),
        }
    }

    /// Convert a JSON value into a data value.
    ///
    /// Non-negative integers become `Uint32` (or `Uint64` when larger),
    /// negative integers `Int32`, fractional numbers `Double`. `null` has no
    /// MMDB representation and is rejected.
    pub fn from_json(json: &serde_json::Value) -> Result<DataValue> {
        match json {
            serde_json::Value::Null => Err(GeosError::Decode(
                "null has no MMDB representation".to_string(),
            )),
            serde_json::Value::Bool(b) => Ok(DataValue::Bool(*b)),
            serde_json::Value::Number(n) => {
                if let Some(u) = n.as_u64() {
                    Ok(match u32::try_from(u) {
                        Ok(small) => DataValue::Uint32(small),
                        Err(_) => DataValue::Uint64(u),
                    })
                } else if let Some(i) = n.as_i64() {
                    i32::try_from(i).map(DataValue::Int32).map_err(|_| {
                        GeosError::Decode(format!("integer {} does not fit in int32", i))
                    })
                } else if let Some(f) = n.as_f64() {
                    Ok(DataValue::Double(f))
                } else {
                    Err(GeosError::Decode(format!("unsupported number {}", n)))
                }
            }
            serde_json::Value::String(s) => Ok(DataValue::String(s.clone())),
            serde_json::Value::Array(arr) => arr
                .iter()
                .map(DataValue::from_json)
                .collect::<Result<Vec<_>>>()
                .map(DataValue::Array),
            serde_json::Value::Object(obj) => obj
                .iter()
                .map(|(k, v)| Ok((k.clone(), DataValue::from_json(v)?)))
                .collect::<Result<HashMap<_, _>>>()
                .map(DataValue::Map),
        }
    }

    /// Convert into a JSON value (Uint128 is rendered as a decimal string)
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DataValue::String(s) => serde_json::Value::from(s.as_str()),
            DataValue::Double(d) => serde_json::Value::from(*d),
            DataValue::Bytes(b) => serde_json::Value::from(b.clone()),
            DataValue::Uint16(u) => serde_json::Value::from(*u),
            DataValue::Uint32(u) => serde_json::Value::from(*u),
            DataValue::Uint64(u) => serde_json::Value::from(*u),
            DataValue::Uint128(u) => serde_json::Value::from(u.to_string()),
            DataValue::Int32(i) => serde_json::Value::from(*i),
            DataValue::Bool(b) => serde_json::Value::from(*b),
            DataValue::Float(f) => serde_json::Value::from(*f),
            DataValue::Map(entries) => serde_json::Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            ),
            DataValue::Array(items) => {
                serde_json::Value::Array(items.iter().map(DataValue::to_json).collect())
            }
        }
    }
}

impl Serialize for DataValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            DataValue::String(s) => serializer.serialize_str(s),
            DataValue::Double(d) => serializer.serialize_f64(*d),
            DataValue::Bytes(b) => serializer.serialize_bytes(b),
            DataValue::Uint16(n) => serializer.serialize_u16(*n),
            DataValue::Uint32(n) => serializer.serialize_u32(*n),
            DataValue::Uint64(n) => serializer.serialize_u64(*n),
            DataValue::Uint128(n) => serializer.serialize_str(&n.to_string()),
            DataValue::Int32(n) => serializer.serialize_i32(*n),
            DataValue::Bool(b) => serializer.serialize_bool(*b),
            DataValue::Float(f) => serializer.serialize_f32(*f),
            DataValue::Map(m) => {
                let mut pairs: Vec<_> = m.iter().collect();
                pairs.sort_by_key(|(k, _)| *k);
                let mut map = serializer.serialize_map(Some(pairs.len()))?;
                for (k, v) in pairs {
                    map.serialize_entry(k, v)?;
                }
                map.end()
            }
            DataValue::Array(a) => {
                let mut seq = serializer.serialize_seq(Some(a.len()))?;
                for v in a {
                    seq.serialize_element(v)?;
                }
                seq.end()
            }
        }
    }
}

struct DataValueVisitor;

impl<'de> Visitor<'de> for DataValueVisitor {
    type Value = DataValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("an MMDB data value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> std::result::Result<DataValue, E> {
        Ok(DataValue::Bool(v))
    }

    fn visit_i32<E: de::Error>(self, v: i32) -> std::result::Result<DataValue, E> {
        Ok(DataValue::Int32(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> std::result::Result<DataValue, E> {
        i32::try_from(v)
            .map(DataValue::Int32)
            .map_err(|_| E::custom(format!("integer {} does not fit in int32", v)))
    }

    fn visit_u16<E: de::Error>(self, v: u16) -> std::result::Result<DataValue, E> {
        Ok(DataValue::Uint16(v))
    }

    fn visit_u32<E: de::Error>(self, v: u32) -> std::result::Result<DataValue, E> {
        Ok(DataValue::Uint32(v))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> std::result::Result<DataValue, E> {
        Ok(DataValue::Uint64(v))
    }

    fn visit_u128<E: de::Error>(self, v: u128) -> std::result::Result<DataValue, E> {
        Ok(DataValue::Uint128(v))
    }

    fn visit_f32<E: de::Error>(self, v: f32) -> std::result::Result<DataValue, E> {
        Ok(DataValue::Float(v))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> std::result::Result<DataValue, E> {
        Ok(DataValue::Double(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<DataValue, E> {
        Ok(DataValue::String(v.to_string()))
    }

    fn visit_string<E: de::Error>(self, v: String) -> std::result::Result<DataValue, E> {
        Ok(DataValue::String(v))
    }

    fn visit_bytes<E: de::Error>(self, v: &[u8]) -> std::result::Result<DataValue, E> {
        Ok(DataValue::Bytes(v.to_vec()))
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> std::result::Result<DataValue, A::Error> {
        let mut items = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(item) = seq.next_element()? {
            items.push(item);
        }
        Ok(DataValue::Array(items))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> std::result::Result<DataValue, A::Error> {
        let mut entries = HashMap::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((k, v)) = map.next_entry::<String, DataValue>()? {
            entries.insert(k, v);
        }
        Ok(DataValue::Map(entries))
    }
}

impl<'de> Deserialize<'de> for DataValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        deserializer.deserialize_any(DataValueVisitor)
    }
}

/// Data section encoder
///
/// Builds a data section by encoding values and tracking offsets.
/// Identical values get the same offset; repeated nested values (including
/// map keys) are written as pointers to their first occurrence.
pub struct DataEncoder {
    /// Encoded data buffer
    buffer: Vec<u8>,
    /// Map from serialized value to offset (for deduplication)
    dedup_map: HashMap<Vec<u8>, u32>,
}

/// Values shorter than this are cheaper inline than behind a pointer
const MIN_POINTER_TARGET: usize = 4;

impl DataEncoder {
    /// Create a new encoder
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            dedup_map: HashMap::new(),
        }
    }

    /// Encode a value and return its offset
    ///
    /// If the value was previously encoded, returns the existing offset.
    pub fn encode(&mut self, value: &DataValue) -> u32 {
        let mut flat = Vec::new();
        Self::encode_flat(value, &mut flat);

        if let Some(&offset) = self.dedup_map.get(&flat) {
            return offset;
        }

        let offset = self.buffer.len() as u32;
        self.write_value(value);
        self.dedup_map.insert(flat, offset);
        offset
    }

    /// Get the final encoded data section
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get current buffer size
    pub fn size(&self) -> usize {
        self.buffer.len()
    }

    /// Write a value into the main buffer, replacing known children with pointers
    fn write_value(&mut self, value: &DataValue) {
        match value {
            DataValue::Map(m) => {
                Self::encode_with_size(7, m.len(), &mut self.buffer);
                let mut pairs: Vec<_> = m.iter().collect();
                pairs.sort_by_key(|(k, _)| *k);
                for (key, child) in pairs {
                    self.write_child(&DataValue::String(key.clone()));
                    self.write_child(child);
                }
            }
            DataValue::Array(a) => {
                Self::encode_with_size(11, a.len(), &mut self.buffer);
                for child in a {
                    self.write_child(child);
                }
            }
            other => Self::encode_flat(other, &mut self.buffer),
        }
    }

    fn write_child(&mut self, value: &DataValue) {
        let mut flat = Vec::new();
        Self::encode_flat(value, &mut flat);

        if let Some(&offset) = self.dedup_map.get(&flat) {
            Self::encode_pointer(offset, &mut self.buffer);
            return;
        }

        let offset = self.buffer.len() as u32;
        self.write_value(value);
        if flat.len() >= MIN_POINTER_TARGET {
            self.dedup_map.insert(flat, offset);
        }
    }

    /// Encode a value without pointers
    fn encode_flat(value: &DataValue, buffer: &mut Vec<u8>) {
        match value {
            DataValue::String(s) => {
                Self::encode_with_size(2, s.len(), buffer);
                buffer.extend_from_slice(s.as_bytes());
            }
            DataValue::Double(d) => {
                buffer.push(0x68); // Type 3 << 5, size 8
                buffer.extend_from_slice(&d.to_be_bytes());
            }
            DataValue::Bytes(b) => {
                Self::encode_with_size(4, b.len(), buffer);
                buffer.extend_from_slice(b);
            }
            DataValue::Uint16(n) => {
                buffer.push(0xA2); // Type 5 << 5, size 2
                buffer.extend_from_slice(&n.to_be_bytes());
            }
            DataValue::Uint32(n) => {
                buffer.push(0xC4); // Type 6 << 5, size 4
                buffer.extend_from_slice(&n.to_be_bytes());
            }
            DataValue::Map(m) => {
                Self::encode_with_size(7, m.len(), buffer);
                let mut pairs: Vec<_> = m.iter().collect();
                pairs.sort_by_key(|(k, _)| *k);
                for (key, child) in pairs {
                    Self::encode_with_size(2, key.len(), buffer);
                    buffer.extend_from_slice(key.as_bytes());
                    Self::encode_flat(child, buffer);
                }
            }
            DataValue::Int32(n) => {
                Self::encode_with_size(8, 4, buffer);
                buffer.extend_from_slice(&n.to_be_bytes());
            }
            DataValue::Uint64(n) => {
                Self::encode_with_size(9, 8, buffer);
                buffer.extend_from_slice(&n.to_be_bytes());
            }
            DataValue::Uint128(n) => {
                Self::encode_with_size(10, 16, buffer);
                buffer.extend_from_slice(&n.to_be_bytes());
            }
            DataValue::Array(a) => {
                Self::encode_with_size(11, a.len(), buffer);
                for child in a {
                    Self::encode_flat(child, buffer);
                }
            }
            // Bool carries its value in the size field
            DataValue::Bool(b) => Self::encode_with_size(14, *b as usize, buffer),
            DataValue::Float(f) => {
                Self::encode_with_size(15, 4, buffer);
                buffer.extend_from_slice(&f.to_be_bytes());
            }
        }
    }

    // Type 1: Pointer. The high payload bits live in the control byte.
    pub(crate) fn encode_pointer(offset: u32, buffer: &mut Vec<u8>) {
        if offset < 0x800 {
            buffer.push(0x20 | ((offset >> 8) & 0x7) as u8);
            buffer.push(offset as u8);
        } else if offset < 0x80800 {
            let adjusted = offset - 0x800;
            buffer.push(0x20 | (1 << 3) | ((adjusted >> 16) & 0x7) as u8);
            buffer.extend_from_slice(&(adjusted as u16).to_be_bytes());
        } else if offset < 0x8080800 {
            let adjusted = offset - 0x80800;
            buffer.push(0x20 | (2 << 3) | ((adjusted >> 24) & 0x7) as u8);
            buffer.extend_from_slice(&adjusted.to_be_bytes()[1..]);
        } else {
            buffer.push(0x20 | (3 << 3));
            buffer.extend_from_slice(&offset.to_be_bytes());
        }
    }

    /// Encode control byte(s) with size
    fn encode_with_size(type_id: u8, size: usize, buffer: &mut Vec<u8>) {
        let type_bits = if type_id > 7 { 0 } else { type_id << 5 };

        let (size_bits, extra): (u8, Vec<u8>) = if size < 29 {
            (size as u8, Vec::new())
        } else if size < 29 + 256 {
            (29, vec![(size - 29) as u8])
        } else if size < 29 + 256 + 65536 {
            (30, ((size - 285) as u16).to_be_bytes().to_vec())
        } else {
            (31, ((size - 65821) as u32).to_be_bytes()[1..].to_vec())
        };

        buffer.push(type_bits | size_bits);
        if type_id > 7 {
            buffer.push(type_id - 7);
        }
        buffer.extend_from_slice(&extra);
    }
}

impl Default for DataEncoder {
    fn default() -> Self {
        Self::new()
    }
}
