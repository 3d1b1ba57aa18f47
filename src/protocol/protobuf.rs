use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};

use crate::protocol::{error::ProtoError, reader::Reader};

const WIRE_VARINT: u8 = 0;
const WIRE_FIXED64: u8 = 1;
const WIRE_BYTES: u8 = 2;
const WIRE_FIXED32: u8 = 5;

/// A single compact-record field value.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtoValue {
    /// Varint field. Negative values are written zig-zag encoded.
    Int(i64),
    /// Written as a 64-bit double. Decoding yields [`ProtoValue::Fixed64`].
    Double(f64),
    Fixed64(u64),
    Fixed32(u32),
    /// Length-delimited field: either a nested record or opaque bytes.
    Bytes(Bytes),
    /// Repeated field.
    List(Vec<ProtoValue>),
}

impl ProtoValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            Self::Fixed64(value) => Some(*value as i64),
            Self::Fixed32(value) => Some(i64::from(*value)),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(value) => Some(value),
            _ => None,
        }
    }

    /// Re-reads a length-delimited value as a nested record, `None` when it is opaque.
    pub fn nested(&self) -> Option<ProtoRecord> {
        self.as_bytes().and_then(|raw| decode(raw).ok())
    }

    /// Returns repeated entries, or the value itself when it occurred once.
    pub fn items(&self) -> &[ProtoValue] {
        match self {
            Self::List(items) => items,
            single => std::slice::from_ref(single),
        }
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for ProtoValue {
            fn from(value: $ty) -> Self {
                Self::Int(value as i64)
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32, u64);

impl From<bool> for ProtoValue {
    fn from(value: bool) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<f64> for ProtoValue {
    fn from(value: f64) -> Self {
        Self::Double(value)
    }
}

impl From<&str> for ProtoValue {
    fn from(value: &str) -> Self {
        Self::Bytes(Bytes::copy_from_slice(value.as_bytes()))
    }
}

impl From<String> for ProtoValue {
    fn from(value: String) -> Self {
        Self::Bytes(Bytes::from(value.into_bytes()))
    }
}

impl From<&[u8]> for ProtoValue {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<Vec<u8>> for ProtoValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<Bytes> for ProtoValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<ProtoRecord> for ProtoValue {
    fn from(value: ProtoRecord) -> Self {
        Self::Bytes(encode(&value))
    }
}

impl From<Vec<ProtoValue>> for ProtoValue {
    fn from(value: Vec<ProtoValue>) -> Self {
        Self::List(value)
    }
}

/// Field-number keyed record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProtoRecord(BTreeMap<u32, ProtoValue>);

impl ProtoRecord {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: u32, value: impl Into<ProtoValue>) -> Self {
        self.0.insert(tag, value.into());
        self
    }

    pub fn insert(&mut self, tag: u32, value: impl Into<ProtoValue>) {
        self.0.insert(tag, value.into());
    }

    pub fn get(&self, tag: u32) -> Option<&ProtoValue> {
        self.0.get(&tag)
    }

    pub fn int(&self, tag: u32) -> Option<i64> {
        self.get(tag).and_then(ProtoValue::as_int)
    }

    pub fn bytes(&self, tag: u32) -> Option<&Bytes> {
        self.get(tag).and_then(ProtoValue::as_bytes)
    }

    pub fn string(&self, tag: u32) -> Option<String> {
        self.bytes(tag)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
    }

    pub fn record(&self, tag: u32) -> Option<ProtoRecord> {
        self.get(tag).and_then(ProtoValue::nested)
    }

    pub fn items(&self, tag: u32) -> &[ProtoValue] {
        self.get(tag).map(ProtoValue::items).unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    fn push(&mut self, tag: u32, value: ProtoValue) {
        match self.0.remove(&tag) {
            None => {
                self.0.insert(tag, value);
            }
            Some(ProtoValue::List(mut items)) => {
                items.push(value);
                self.0.insert(tag, ProtoValue::List(items));
            }
            Some(previous) => {
                self.0.insert(tag, ProtoValue::List(vec![previous, value]));
            }
        }
    }
}

/// Encodes a record; repeated fields are written once per item.
pub fn encode(record: &ProtoRecord) -> Bytes {
    let mut output = BytesMut::new();
    for (tag, value) in &record.0 {
        write_field(*tag, value, &mut output);
    }
    output.freeze()
}

/// Decodes a record. Structural damage fails; nested blocks stay raw until inspected.
pub fn decode(input: &[u8]) -> Result<ProtoRecord, ProtoError> {
    let mut reader = Reader::new(input);
    let mut record = ProtoRecord::new();

    while !reader.is_eof() {
        let key = read_varint(&mut reader)?;
        let tag = u32::try_from(key >> 3).map_err(|_| ProtoError::TagOverflow(key >> 3))?;
        let wire = (key & 0b111) as u8;
        let value = match wire {
            WIRE_VARINT => ProtoValue::Int(read_varint(&mut reader)? as i64),
            WIRE_FIXED64 => ProtoValue::Fixed64(u64::from_le_bytes(reader.read_array::<8>()?)),
            WIRE_BYTES => {
                let len = read_varint(&mut reader)?;
                let len = usize::try_from(len).map_err(|_| ProtoError::LengthOverrun)?;
                let raw = reader
                    .read_bytes(len)
                    .map_err(|_| ProtoError::LengthOverrun)?;
                ProtoValue::Bytes(Bytes::copy_from_slice(raw))
            }
            WIRE_FIXED32 => ProtoValue::Fixed32(u32::from_le_bytes(reader.read_array::<4>()?)),
            other => return Err(ProtoError::UnknownWireType(other, tag)),
        };
        record.push(tag, value);
    }

    Ok(record)
}

fn write_field(tag: u32, value: &ProtoValue, output: &mut BytesMut) {
    let key = u64::from(tag) << 3;
    match value {
        ProtoValue::Int(value) => {
            write_varint(key | u64::from(WIRE_VARINT), output);
            if *value < 0 {
                write_varint(((*value << 1) ^ (*value >> 63)) as u64, output);
            } else {
                write_varint(*value as u64, output);
            }
        }
        ProtoValue::Double(value) => {
            write_varint(key | u64::from(WIRE_FIXED64), output);
            output.put_f64_le(*value);
        }
        ProtoValue::Fixed64(value) => {
            write_varint(key | u64::from(WIRE_FIXED64), output);
            output.put_u64_le(*value);
        }
        ProtoValue::Fixed32(value) => {
            write_varint(key | u64::from(WIRE_FIXED32), output);
            output.put_u32_le(*value);
        }
        ProtoValue::Bytes(raw) => {
            write_varint(key | u64::from(WIRE_BYTES), output);
            write_varint(raw.len() as u64, output);
            output.put_slice(raw);
        }
        ProtoValue::List(items) => {
            for item in items {
                write_field(tag, item, output);
            }
        }
    }
}

fn write_varint(mut value: u64, output: &mut BytesMut) {
    while value >= 0x80 {
        output.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    output.put_u8(value as u8);
}

fn read_varint(reader: &mut Reader<'_>) -> Result<u64, ProtoError> {
    let mut value = 0u64;
    for shift in (0..70).step_by(7) {
        let byte = reader.read_u8()?;
        value |= u64::from(byte & 0x7F) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(ProtoError::VarintOverflow)
}

#[cfg(test)]
mod tests {
    use bytes::BytesMut;

    use super::{read_varint, write_varint};
    use crate::protocol::reader::Reader;

    #[test]
    fn varint_boundaries() {
        for value in [0u64, 1, 127, 128, 300, u64::from(u32::MAX), u64::MAX] {
            let mut output = BytesMut::new();
            write_varint(value, &mut output);
            let decoded = read_varint(&mut Reader::new(&output)).expect("varint");
            assert_eq!(decoded, value);
        }
    }
}
