//! MMDB data section decoder
//!
//! [`Decoder`] walks the MMDB wire format and drives a serde [`Visitor`]
//! directly, so records bind into caller types without an intermediate value
//! tree. Pointers are followed transparently; after a pointed-to value is
//! consumed the cursor continues right after the pointer bytes.
//!
//! Decoding into a narrower numeric type than the stored one fails with
//! [`GeosError::Decode`] when the stored value does not fit (serde's own range
//! checks). Nesting deeper than [`MAX_DEPTH`] levels (maps, arrays and pointer
//! hops combined) is rejected. Pointers are resolved in a loop rather than by
//! recursion, and a pointer back into a value still being decoded is reported
//! as a cycle at once.

use crate::error::{GeosError, Result};
use serde::de::{self, DeserializeSeed, MapAccess, SeqAccess, Visitor};
use serde::forward_to_deserialize_any;

/// Maximum nesting of containers and pointer hops
pub const MAX_DEPTH: usize = 512;

/// Pointer bias by pointer size (1-4 bytes)
const POINTER_BIAS: [usize; 4] = [0, 2048, 526_336, 0];

const TYPE_POINTER: u8 = 1;
const TYPE_STRING: u8 = 2;
const TYPE_DOUBLE: u8 = 3;
const TYPE_BYTES: u8 = 4;
const TYPE_UINT16: u8 = 5;
const TYPE_UINT32: u8 = 6;
const TYPE_MAP: u8 = 7;
const TYPE_INT32: u8 = 8;
const TYPE_UINT64: u8 = 9;
const TYPE_UINT128: u8 = 10;
const TYPE_ARRAY: u8 = 11;
const TYPE_DATA_CACHE: u8 = 12;
const TYPE_END_MARKER: u8 = 13;
const TYPE_BOOL: u8 = 14;
const TYPE_FLOAT: u8 = 15;

/// Streaming decoder over a data section buffer
pub struct Decoder<'de> {
    buf: &'de [u8],
    cursor: usize,
    depth: usize,
    // targets of the pointers enclosing the current value
    pointer_path: Vec<usize>,
}

impl<'de> Decoder<'de> {
    /// Create a decoder positioned at `offset` within `buf`
    pub fn new(buf: &'de [u8], offset: usize) -> Self {
        Self {
            buf,
            cursor: offset,
            depth: 0,
            pointer_path: Vec::new(),
        }
    }

    /// Current position in the buffer
    pub fn position(&self) -> usize {
        self.cursor
    }

    /// Decode the value at the cursor into `T`
    pub fn decode<T: de::Deserialize<'de>>(&mut self) -> Result<T> {
        T::deserialize(&mut *self)
    }

    /// Skip the value at the cursor without materializing it
    pub fn skip(&mut self) -> Result<()> {
        let (type_id, size) = self.read_header()?;
        match type_id {
            TYPE_POINTER => {
                self.pointer_target(size)?;
                Ok(())
            }
            TYPE_MAP | TYPE_ARRAY => {
                self.enter()?;
                let children = if type_id == TYPE_MAP { size * 2 } else { size };
                for _ in 0..children {
                    self.skip()?;
                }
                self.depth -= 1;
                Ok(())
            }
            TYPE_BOOL => Ok(()),
            _ => self.take(size).map(|_| ()),
        }
    }

    fn enter(&mut self) -> Result<()> {
        self.depth += 1;
        if self.depth > MAX_DEPTH {
            return Err(GeosError::Decode(format!(
                "maximum nesting depth {} exceeded",
                MAX_DEPTH
            )));
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<&'de [u8]> {
        let end = self
            .cursor
            .checked_add(len)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| {
                GeosError::Decode(format!(
                    "unexpected end of data at offset {} (need {} bytes)",
                    self.cursor, len
                ))
            })?;
        let bytes = &self.buf[self.cursor..end];
        self.cursor = end;
        Ok(bytes)
    }

    fn read_byte(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    /// Read a control byte and any extension bytes.
    ///
    /// Returns the resolved type and, for pointers, the raw 5-bit payload;
    /// for everything else the decoded size.
    fn read_header(&mut self) -> Result<(u8, usize)> {
        let ctrl = self.read_byte()?;
        let mut type_id = ctrl >> 5;

        if type_id == TYPE_POINTER {
            return Ok((TYPE_POINTER, (ctrl & 0x1F) as usize));
        }

        if type_id == 0 {
            let ext = self.read_byte()?;
            type_id = ext.checked_add(7).ok_or_else(|| {
                GeosError::Decode(format!("invalid extended type {}", ext))
            })?;
            if !(TYPE_INT32..=TYPE_FLOAT).contains(&type_id)
                || type_id == TYPE_DATA_CACHE
                || type_id == TYPE_END_MARKER
            {
                return Err(GeosError::Decode(format!(
                    "invalid extended type {} at offset {}",
                    type_id,
                    self.cursor - 1
                )));
            }
        }

        let size = match ctrl & 0x1F {
            s @ 0..=28 => s as usize,
            29 => 29 + self.read_byte()? as usize,
            30 => {
                let b = self.take(2)?;
                285 + u16::from_be_bytes([b[0], b[1]]) as usize
            }
            _ => {
                let b = self.take(3)?;
                65_821 + (((b[0] as usize) << 16) | ((b[1] as usize) << 8) | b[2] as usize)
            }
        };

        Ok((type_id, size))
    }

    fn pointer_target(&mut self, payload: usize) -> Result<usize> {
        let pointer_size = ((payload >> 3) & 0x3) + 1;
        let prefix = if pointer_size == 4 { 0 } else { payload & 0x7 };

        let bytes = self.take(pointer_size)?;
        let raw = bytes
            .iter()
            .fold(prefix, |acc, &b| (acc << 8) | b as usize);
        Ok(raw + POINTER_BIAS[pointer_size - 1])
    }

    /// Enter the value at pointer `target`
    fn follow(&mut self, target: usize) -> Result<()> {
        if target >= self.buf.len() {
            return Err(GeosError::Decode(format!(
                "pointer to {} beyond data section of {} bytes",
                target,
                self.buf.len()
            )));
        }
        if self.pointer_path.contains(&target) {
            return Err(GeosError::Decode(format!(
                "pointer cycle through offset {}",
                target
            )));
        }
        self.enter()?;
        self.pointer_path.push(target);
        self.cursor = target;
        Ok(())
    }

    fn read_uint(&mut self, size: usize, max: usize) -> Result<u128> {
        if size > max {
            return Err(GeosError::Decode(format!(
                "integer of {} bytes exceeds {} byte limit",
                size, max
            )));
        }
        Ok(self
            .take(size)?
            .iter()
            .fold(0u128, |acc, &b| (acc << 8) | b as u128))
    }

    fn decode_value<V: Visitor<'de>>(&mut self, visitor: V) -> Result<V::Value> {
        let (type_id, size) = self.read_header()?;
        if type_id != TYPE_POINTER {
            return self.decode_typed(type_id, size, visitor);
        }

        let (depth, path_len) = (self.depth, self.pointer_path.len());
        let mut target = self.pointer_target(size)?;
        let resume = self.cursor;
        let (type_id, size) = loop {
            self.follow(target)?;
            match self.read_header()? {
                (TYPE_POINTER, payload) => target = self.pointer_target(payload)?,
                header => break header,
            }
        };

        let value = self.decode_typed(type_id, size, visitor);
        self.depth = depth;
        self.pointer_path.truncate(path_len);
        self.cursor = resume;
        value
    }

    fn decode_typed<V: Visitor<'de>>(
        &mut self,
        type_id: u8,
        size: usize,
        visitor: V,
    ) -> Result<V::Value> {
        match type_id {
            TYPE_STRING => {
                let bytes = self.take(size)?;
                let s = std::str::from_utf8(bytes)
                    .map_err(|e| GeosError::Decode(format!("invalid UTF-8 string: {}", e)))?;
                visitor.visit_borrowed_str(s)
            }
            TYPE_DOUBLE => {
                if size != 8 {
                    return Err(GeosError::Decode(format!("invalid double size {}", size)));
                }
                let b = self.take(8)?;
                let mut arr = [0u8; 8];
                arr.copy_from_slice(b);
                visitor.visit_f64(f64::from_be_bytes(arr))
            }
            TYPE_BYTES => visitor.visit_borrowed_bytes(self.take(size)?),
            TYPE_UINT16 => visitor.visit_u16(self.read_uint(size, 2)? as u16),
            TYPE_UINT32 => visitor.visit_u32(self.read_uint(size, 4)? as u32),
            TYPE_INT32 => visitor.visit_i32(self.read_uint(size, 4)? as u32 as i32),
            TYPE_UINT64 => visitor.visit_u64(self.read_uint(size, 8)? as u64),
            TYPE_UINT128 => visitor.visit_u128(self.read_uint(size, 16)?),
            TYPE_MAP => {
                self.enter()?;
                let value = visitor.visit_map(MapAccessor {
                    de: self,
                    remaining: size,
                });
                self.depth -= 1;
                value
            }
            TYPE_ARRAY => {
                self.enter()?;
                let value = visitor.visit_seq(SeqAccessor {
                    de: self,
                    remaining: size,
                });
                self.depth -= 1;
                value
            }
            TYPE_BOOL => match size {
                0 => visitor.visit_bool(false),
                1 => visitor.visit_bool(true),
                _ => Err(GeosError::Decode(format!("invalid bool size {}", size))),
            },
            TYPE_FLOAT => {
                if size != 4 {
                    return Err(GeosError::Decode(format!("invalid float size {}", size)));
                }
                let b = self.take(4)?;
                visitor.visit_f32(f32::from_be_bytes([b[0], b[1], b[2], b[3]]))
            }
            other => Err(GeosError::Decode(format!(
                "unsupported data type {} at offset {}",
                other,
                self.cursor
            ))),
        }
    }
}

impl<'de, 'a> de::Deserializer<'de> for &'a mut Decoder<'de> {
    type Error = GeosError;

    fn deserialize_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.decode_value(visitor)
    }

    // MMDB has no null; a present value is always `Some`.
    fn deserialize_option<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        visitor.visit_some(self)
    }

    fn deserialize_ignored_any<V: Visitor<'de>>(self, visitor: V) -> Result<V::Value> {
        self.skip()?;
        visitor.visit_unit()
    }

    forward_to_deserialize_any! {
        bool i8 i16 i32 i64 i128 u8 u16 u32 u64 u128 f32 f64 char str string
        bytes byte_buf unit unit_struct newtype_struct seq tuple
        tuple_struct map struct enum identifier
    }
}

/// Cap on pre-allocation hints taken from untrusted sizes
const SIZE_HINT_CAP: usize = 4096;

struct MapAccessor<'a, 'de> {
    de: &'a mut Decoder<'de>,
    remaining: usize,
}

impl<'de, 'a> MapAccess<'de> for MapAccessor<'a, 'de> {
    type Error = GeosError;

    fn next_key_seed<K: DeserializeSeed<'de>>(&mut self, seed: K) -> Result<Option<K::Value>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn next_value_seed<V: DeserializeSeed<'de>>(&mut self, seed: V) -> Result<V::Value> {
        seed.deserialize(&mut *self.de)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining.min(SIZE_HINT_CAP))
    }
}

struct SeqAccessor<'a, 'de> {
    de: &'a mut Decoder<'de>,
    remaining: usize,
}

impl<'de, 'a> SeqAccess<'de> for SeqAccessor<'a, 'de> {
    type Error = GeosError;

    fn next_element_seed<T: DeserializeSeed<'de>>(&mut self, seed: T) -> Result<Option<T::Value>> {
        if self.remaining == 0 {
            return Ok(None);
        }
        self.remaining -= 1;
        seed.deserialize(&mut *self.de).map(Some)
    }

    fn size_hint(&self) -> Option<usize> {
        Some(self.remaining.min(SIZE_HINT_CAP))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_section::{DataEncoder, DataValue};
    use serde::Deserialize;
    use std::collections::HashMap;

    fn map(pairs: &[(&str, DataValue)]) -> DataValue {
        DataValue::Map(
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.clone()))
                .collect(),
        )
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Names {
        en: String,
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct Place {
        geoname_id: u32,
        #[serde(default)]
        names: HashMap<String, String>,
        #[serde(default)]
        missing: Option<String>,
    }

    #[test]
    fn test_decode_into_struct_ignores_unknown_keys() {
        let mut encoder = DataEncoder::new();
        let value = map(&[
            ("geoname_id", DataValue::Uint32(2988507)),
            (
                "names",
                map(&[("en", DataValue::String("Paris".to_string()))]),
            ),
            (
                "extra",
                DataValue::Array(vec![DataValue::Bool(true), DataValue::Double(1.0)]),
            ),
        ]);
        let offset = encoder.encode(&value);
        let bytes = encoder.into_bytes();

        let place: Place = Decoder::new(&bytes, offset as usize).decode().unwrap();
        assert_eq!(place.geoname_id, 2988507);
        assert_eq!(place.names.get("en").map(String::as_str), Some("Paris"));
        assert_eq!(place.missing, None);
    }

    #[test]
    fn test_overflow_on_assignment() {
        let mut encoder = DataEncoder::new();
        let offset = encoder.encode(&DataValue::Uint32(70_000));
        let bytes = encoder.into_bytes();

        let narrow: Result<u16> = Decoder::new(&bytes, offset as usize).decode();
        assert!(matches!(narrow, Err(GeosError::Decode(_))));

        let wide: u64 = Decoder::new(&bytes, offset as usize).decode().unwrap();
        assert_eq!(wide, 70_000);
    }

    #[test]
    fn test_pointer_resumes_after_pointer_bytes() {
        // [0] "abcd", [5] array of 2: pointer -> 0, uint16 7
        let mut bytes = vec![0x44, b'a', b'b', b'c', b'd'];
        bytes.extend_from_slice(&[0x02, 0x04]); // array, size 2 (extended type 11)
        bytes.extend_from_slice(&[0x20, 0x00]); // pointer to 0
        bytes.extend_from_slice(&[0xA1, 0x07]); // uint16 7

        let value: DataValue = Decoder::new(&bytes, 5).decode().unwrap();
        assert_eq!(
            value,
            DataValue::Array(vec![
                DataValue::String("abcd".to_string()),
                DataValue::Uint16(7)
            ])
        );
    }

    #[test]
    fn test_depth_limit() {
        // 600 nested single-element arrays
        let mut bytes = Vec::new();
        for _ in 0..600 {
            bytes.extend_from_slice(&[0x01, 0x04]);
        }
        bytes.push(0x40); // empty string

        let result: Result<DataValue> = Decoder::new(&bytes, 0).decode();
        assert!(matches!(result, Err(GeosError::Decode(_))));

        let skipped = Decoder::new(&bytes, 0).skip();
        assert!(skipped.is_err());
    }

    #[test]
    fn test_truncated_input() {
        let bytes = [0x45, b'a', b'b'];
        let result: Result<String> = Decoder::new(&bytes, 0).decode();
        assert!(matches!(result, Err(GeosError::Decode(_))));
    }

    #[test]
    fn test_self_pointer() {
        let bytes = [0x20, 0x00];
        let result: Result<DataValue> = Decoder::new(&bytes, 0).decode();
        assert!(matches!(result, Err(GeosError::Decode(_))));
    }

    #[test]
    fn test_map_pointing_back_to_itself() {
        // {"a": <pointer to 0>}
        let bytes = [0xE1, 0x41, b'a', 0x20, 0x00];
        let result: Result<DataValue> = Decoder::new(&bytes, 0).decode();
        assert!(matches!(result, Err(GeosError::Decode(_))));

        let json: Result<serde_json::Value> = Decoder::new(&bytes, 0).decode();
        assert!(matches!(json, Err(GeosError::Decode(_))));
    }

    #[test]
    fn test_cycle_on_small_stack() {
        // [0] {"a": <pointer to 6>}, [6] {"b": <pointer to 0>}
        let bytes = [
            0xE1, 0x41, b'a', 0x20, 0x06, 0x00, 0xE1, 0x41, b'b', 0x20, 0x00,
        ];
        let result = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || Decoder::new(&bytes, 0).decode::<DataValue>())
            .unwrap()
            .join()
            .unwrap();
        match result {
            Err(GeosError::Decode(msg)) => assert!(msg.contains("cycle"), "{}", msg),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_shared_pointer_targets_decode() {
        // [0] "x", [2] array of 3 pointers to 0
        let bytes = [0x41, b'x', 0x03, 0x04, 0x20, 0x00, 0x20, 0x00, 0x20, 0x00];
        let value: DataValue = Decoder::new(&bytes, 2).decode().unwrap();
        let x = DataValue::String("x".to_string());
        assert_eq!(value, DataValue::Array(vec![x.clone(), x.clone(), x]));
    }

    #[test]
    fn test_reserved_extended_types_rejected() {
        // extended type 12 (data cache) and 13 (end marker)
        for ext in [0x05u8, 0x06] {
            let bytes = [0x00, ext];
            let result: Result<DataValue> = Decoder::new(&bytes, 0).decode();
            assert!(matches!(result, Err(GeosError::Decode(_))));
            assert!(Decoder::new(&bytes, 0).skip().is_err());
        }
    }

    #[test]
    fn test_pointer_layouts() {
        for offset in [0x100u32, 0x10000, 0x1000000, 0xDEADBEEF] {
            let mut buffer = Vec::new();
            DataEncoder::encode_pointer(offset, &mut buffer);
            let mut decoder = Decoder::new(&buffer, 0);
            let (type_id, payload) = decoder.read_header().unwrap();
            assert_eq!(type_id, TYPE_POINTER);
            assert_eq!(decoder.pointer_target(payload).unwrap(), offset as usize);
            assert_eq!(decoder.position(), buffer.len());
        }
    }

    #[test]
    fn test_pointer_out_of_range() {
        let bytes = [0x20, 0xFF];
        let result: Result<DataValue> = Decoder::new(&bytes, 0).decode();
        assert!(matches!(result, Err(GeosError::Decode(_))));
    }

    #[test]
    fn test_skip_advances_past_value() {
        let mut encoder = DataEncoder::new();
        let first = encoder.encode(&map(&[("a", DataValue::Uint64(1))]));
        let second = encoder.encode(&DataValue::String("after".to_string()));
        let bytes = encoder.into_bytes();

        let mut decoder = Decoder::new(&bytes, first as usize);
        decoder.skip().unwrap();
        assert_eq!(decoder.position(), second as usize);
    }

    #[test]
    fn test_borrowed_names() {
        let mut encoder = DataEncoder::new();
        let offset = encoder.encode(&map(&[("en", DataValue::String("Tokyo".to_string()))]));
        let bytes = encoder.into_bytes();
        let names: Names = Decoder::new(&bytes, offset as usize).decode().unwrap();
        assert_eq!(names.en, "Tokyo");
    }
}
