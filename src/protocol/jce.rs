use std::collections::BTreeMap;

use bytes::Bytes;

use crate::protocol::{error::JceError, reader::Reader};

const TYPE_INT8: u8 = 0;
const TYPE_INT16: u8 = 1;
const TYPE_INT32: u8 = 2;
const TYPE_INT64: u8 = 3;
const TYPE_FLOAT: u8 = 4;
const TYPE_DOUBLE: u8 = 5;
const TYPE_SHORT_STRING: u8 = 6;
const TYPE_LONG_STRING: u8 = 7;
const TYPE_MAP: u8 = 8;
const TYPE_LIST: u8 = 9;
const TYPE_STRUCT_BEGIN: u8 = 10;
const TYPE_STRUCT_END: u8 = 11;
const TYPE_ZERO: u8 = 12;
const TYPE_SIMPLE_LIST: u8 = 13;

/// A single tagged-struct value.
#[derive(Debug, Clone, PartialEq)]
pub enum JceValue {
    Int(i64),
    Float(f32),
    Double(f64),
    String(String),
    /// Raw bytes, carried as a simple list.
    Bytes(Bytes),
    List(Vec<JceValue>),
    /// Key/value pairs in insertion order.
    Map(Vec<(JceValue, JceValue)>),
    Struct(JceStruct),
    /// Pre-encoded struct body, emitted between begin/end markers. Never produced by decode.
    Nested(Bytes),
}

impl JceValue {
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Self::Bytes(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_struct(&self) -> Option<&JceStruct> {
        match self {
            Self::Struct(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[JceValue]> {
        match self {
            Self::List(value) => Some(value),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&[(JceValue, JceValue)]> {
        match self {
            Self::Map(value) => Some(value),
            _ => None,
        }
    }

    /// Loose truthiness used by server acknowledgement fields.
    pub fn is_truthy(&self) -> bool {
        match self {
            Self::Int(value) => *value != 0,
            Self::Float(value) => *value != 0.0,
            Self::Double(value) => *value != 0.0,
            Self::String(value) => !value.is_empty(),
            _ => true,
        }
    }
}

macro_rules! impl_from_int {
    ($($ty:ty),*) => {
        $(impl From<$ty> for JceValue {
            fn from(value: $ty) -> Self {
                Self::Int(i64::from(value))
            }
        })*
    };
}

impl_from_int!(i8, i16, i32, i64, u8, u16, u32);

impl From<bool> for JceValue {
    fn from(value: bool) -> Self {
        Self::Int(i64::from(value))
    }
}

impl From<&str> for JceValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_owned())
    }
}

impl From<String> for JceValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<Bytes> for JceValue {
    fn from(value: Bytes) -> Self {
        Self::Bytes(value)
    }
}

impl From<Vec<u8>> for JceValue {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(value))
    }
}

impl From<&[u8]> for JceValue {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(Bytes::copy_from_slice(value))
    }
}

impl From<JceStruct> for JceValue {
    fn from(value: JceStruct) -> Self {
        Self::Struct(value)
    }
}

impl From<Vec<JceValue>> for JceValue {
    fn from(value: Vec<JceValue>) -> Self {
        Self::List(value)
    }
}

/// Tag-indexed struct body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JceStruct(BTreeMap<u8, JceValue>);

impl JceStruct {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tag: u8, value: impl Into<JceValue>) -> Self {
        self.0.insert(tag, value.into());
        self
    }

    pub fn insert(&mut self, tag: u8, value: impl Into<JceValue>) {
        self.0.insert(tag, value.into());
    }

    pub fn get(&self, tag: u8) -> Option<&JceValue> {
        self.0.get(&tag)
    }

    pub fn int(&self, tag: u8) -> Option<i64> {
        self.get(tag).and_then(JceValue::as_int)
    }

    pub fn string(&self, tag: u8) -> Option<&str> {
        self.get(tag).and_then(JceValue::as_str)
    }

    pub fn bytes(&self, tag: u8) -> Option<&Bytes> {
        self.get(tag).and_then(JceValue::as_bytes)
    }

    pub fn structure(&self, tag: u8) -> Option<&JceStruct> {
        self.get(tag).and_then(JceValue::as_struct)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u8, &JceValue)> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Encodes one tagged element.
pub fn encode_element(tag: u32, value: &JceValue) -> Result<Vec<u8>, JceError> {
    let mut output = Vec::new();
    write_element(tag, value, &mut output)?;
    Ok(output)
}

/// Encodes the fields of a struct without begin/end markers.
pub fn encode(fields: &JceStruct) -> Result<Bytes, JceError> {
    let mut output = Vec::new();
    write_fields(fields, &mut output)?;
    Ok(Bytes::from(output))
}

/// Encodes a positional field list where the index is the tag and `None` is skipped.
pub fn encode_fields(fields: &[Option<JceValue>]) -> Result<Bytes, JceError> {
    let mut output = Vec::new();
    for (tag, value) in fields.iter().enumerate() {
        if let Some(value) = value {
            let tag = u32::try_from(tag).map_err(|_| JceError::TagOutOfRange(u32::MAX))?;
            write_element(tag, value, &mut output)?;
        }
    }
    Ok(Bytes::from(output))
}

/// Decodes a payload of top-level elements.
pub fn decode(input: &[u8]) -> Result<JceStruct, JceError> {
    let mut decoder = Decoder::new(input);
    let mut fields = JceStruct::new();

    while !decoder.reader.is_eof() {
        let (tag, kind) = decoder.read_head()?;
        if kind == TYPE_STRUCT_END {
            continue;
        }
        let value = decoder.read_body(kind)?;
        fields.0.insert(tag, value);
    }

    Ok(fields)
}

/// Wraps a request struct in a version 3 service packet.
pub fn encode_wrapper(
    name: &str,
    body: &JceStruct,
    servant: &str,
    func: &str,
    req_id: i32,
) -> Result<Bytes, JceError> {
    let inner = encode(&JceStruct::new().with(0, body.clone()))?;
    let map = JceValue::Map(vec![(JceValue::from(name), JceValue::Bytes(inner))]);
    let data = encode(&JceStruct::new().with(0, map))?;

    encode_fields(&[
        None,
        Some(JceValue::Int(3)),
        Some(JceValue::Int(0)),
        Some(JceValue::Int(0)),
        Some(JceValue::from(req_id)),
        Some(JceValue::from(servant)),
        Some(JceValue::from(func)),
        Some(JceValue::Bytes(data)),
        Some(JceValue::Int(0)),
        Some(JceValue::Map(Vec::new())),
        Some(JceValue::Map(Vec::new())),
    ])
}

/// Unwraps the first struct carried by a service packet.
pub fn decode_wrapper(input: &[u8]) -> Result<JceStruct, JceError> {
    let wrapper = decode(input)?;
    let data = wrapper
        .bytes(7)
        .ok_or(JceError::UnexpectedShape("wrapper without data field"))?;
    let outer = decode(data)?;
    let map = outer
        .get(0)
        .and_then(JceValue::as_map)
        .ok_or(JceError::UnexpectedShape("wrapper data is not a map"))?;
    let (_, first) = map
        .first()
        .ok_or(JceError::UnexpectedShape("wrapper map is empty"))?;

    let nested = match first {
        JceValue::Bytes(bytes) => bytes,
        JceValue::Map(entries) => entries
            .first()
            .and_then(|(_, value)| value.as_bytes())
            .ok_or(JceError::UnexpectedShape("wrapper nested map is empty"))?,
        _ => return Err(JceError::UnexpectedShape("wrapper value is not bytes")),
    };

    let body = decode(nested)?;
    match body.get(0) {
        Some(JceValue::Struct(fields)) => Ok(fields.clone()),
        _ => Err(JceError::UnexpectedShape("wrapper body is not a struct")),
    }
}

fn write_head(kind: u8, tag: u32, output: &mut Vec<u8>) -> Result<(), JceError> {
    if tag < 15 {
        output.push(((tag as u8) << 4) | kind);
    } else if tag < 256 {
        output.push(0xF0 | kind);
        output.push(tag as u8);
    } else {
        return Err(JceError::TagOutOfRange(tag));
    }
    Ok(())
}

fn write_fields(fields: &JceStruct, output: &mut Vec<u8>) -> Result<(), JceError> {
    for (tag, value) in fields.iter() {
        write_element(u32::from(*tag), value, output)?;
    }
    Ok(())
}

fn write_int(tag: u32, value: i64, output: &mut Vec<u8>) -> Result<(), JceError> {
    if value == 0 {
        write_head(TYPE_ZERO, tag, output)
    } else if let Ok(value) = i8::try_from(value) {
        write_head(TYPE_INT8, tag, output)?;
        output.extend_from_slice(&value.to_be_bytes());
        Ok(())
    } else if let Ok(value) = i16::try_from(value) {
        write_head(TYPE_INT16, tag, output)?;
        output.extend_from_slice(&value.to_be_bytes());
        Ok(())
    } else if let Ok(value) = i32::try_from(value) {
        write_head(TYPE_INT32, tag, output)?;
        output.extend_from_slice(&value.to_be_bytes());
        Ok(())
    } else {
        write_head(TYPE_INT64, tag, output)?;
        output.extend_from_slice(&value.to_be_bytes());
        Ok(())
    }
}

fn write_length(len: usize, output: &mut Vec<u8>) -> Result<(), JceError> {
    let len = i64::try_from(len).map_err(|_| JceError::TooLong)?;
    write_int(0, len, output)
}

fn write_element(tag: u32, value: &JceValue, output: &mut Vec<u8>) -> Result<(), JceError> {
    match value {
        JceValue::Int(value) => write_int(tag, *value, output)?,
        JceValue::Float(value) => {
            write_head(TYPE_FLOAT, tag, output)?;
            output.extend_from_slice(&value.to_be_bytes());
        }
        JceValue::Double(value) => {
            write_head(TYPE_DOUBLE, tag, output)?;
            output.extend_from_slice(&value.to_be_bytes());
        }
        JceValue::String(value) => {
            let raw = value.as_bytes();
            if raw.len() < 0xFF {
                write_head(TYPE_SHORT_STRING, tag, output)?;
                output.push(raw.len() as u8);
            } else {
                let len = u32::try_from(raw.len()).map_err(|_| JceError::TooLong)?;
                write_head(TYPE_LONG_STRING, tag, output)?;
                output.extend_from_slice(&len.to_be_bytes());
            }
            output.extend_from_slice(raw);
        }
        JceValue::Bytes(value) => {
            write_head(TYPE_SIMPLE_LIST, tag, output)?;
            write_head(TYPE_INT8, 0, output)?;
            write_length(value.len(), output)?;
            output.extend_from_slice(value);
        }
        JceValue::List(items) => {
            write_head(TYPE_LIST, tag, output)?;
            write_length(items.len(), output)?;
            for item in items {
                write_element(0, item, output)?;
            }
        }
        JceValue::Map(entries) => {
            write_head(TYPE_MAP, tag, output)?;
            write_length(entries.len(), output)?;
            for (key, value) in entries {
                write_element(0, key, output)?;
                write_element(1, value, output)?;
            }
        }
        JceValue::Struct(fields) => {
            write_head(TYPE_STRUCT_BEGIN, tag, output)?;
            write_fields(fields, output)?;
            write_head(TYPE_STRUCT_END, 0, output)?;
        }
        JceValue::Nested(body) => {
            write_head(TYPE_STRUCT_BEGIN, tag, output)?;
            output.extend_from_slice(body);
            write_head(TYPE_STRUCT_END, 0, output)?;
        }
    }
    Ok(())
}

/// Deepest list, map or struct nesting the decoder accepts.
pub const MAX_DEPTH: usize = 64;

struct Decoder<'a> {
    reader: Reader<'a>,
    depth: usize,
}

impl<'a> Decoder<'a> {
    fn new(input: &'a [u8]) -> Self {
        Self {
            reader: Reader::new(input),
            depth: 0,
        }
    }

    fn read_nested<T>(&mut self, read: impl FnOnce(&mut Self) -> Result<T, JceError>) -> Result<T, JceError> {
        if self.depth >= MAX_DEPTH {
            return Err(JceError::TooDeep(MAX_DEPTH));
        }
        self.depth += 1;
        let result = read(self);
        self.depth -= 1;
        result
    }

    fn read_head(&mut self) -> Result<(u8, u8), JceError> {
        let head = self.reader.read_u8()?;
        let kind = head & 0x0F;
        let mut tag = head >> 4;
        if tag == 0x0F {
            tag = self.reader.read_u8()?;
        }
        Ok((tag, kind))
    }

    fn read_element(&mut self) -> Result<JceValue, JceError> {
        let (_, kind) = self.read_head()?;
        if kind == TYPE_STRUCT_END {
            return Err(JceError::UnexpectedShape("struct end outside a struct"));
        }
        self.read_body(kind)
    }

    fn read_length(&mut self) -> Result<usize, JceError> {
        match self.read_element()? {
            JceValue::Int(len) => usize::try_from(len).map_err(|_| JceError::InvalidLength(len)),
            _ => Err(JceError::UnexpectedShape("length is not an integer")),
        }
    }

    fn read_struct(&mut self) -> Result<JceStruct, JceError> {
        let mut fields = JceStruct::new();
        while !self.reader.is_eof() {
            let (tag, kind) = self.read_head()?;
            if kind == TYPE_STRUCT_END {
                break;
            }
            let value = self.read_body(kind)?;
            fields.0.insert(tag, value);
        }
        Ok(fields)
    }

    fn read_string(&mut self, len: usize) -> Result<String, JceError> {
        let raw = self.reader.read_bytes(len)?;
        Ok(String::from_utf8_lossy(raw).into_owned())
    }

    fn read_body(&mut self, kind: u8) -> Result<JceValue, JceError> {
        let value = match kind {
            TYPE_ZERO => JceValue::Int(0),
            TYPE_INT8 => JceValue::Int(i64::from(self.reader.read_u8()? as i8)),
            TYPE_INT16 => JceValue::Int(i64::from(self.reader.read_u16()? as i16)),
            TYPE_INT32 => JceValue::Int(i64::from(self.reader.read_i32()?)),
            TYPE_INT64 => JceValue::Int(self.reader.read_u64()? as i64),
            TYPE_FLOAT => JceValue::Float(f32::from_be_bytes(self.reader.read_array::<4>()?)),
            TYPE_DOUBLE => JceValue::Double(f64::from_be_bytes(self.reader.read_array::<8>()?)),
            TYPE_SHORT_STRING => {
                let len = self.reader.read_u8()? as usize;
                JceValue::String(self.read_string(len)?)
            }
            TYPE_LONG_STRING => {
                let len = self.reader.read_u32()? as usize;
                JceValue::String(self.read_string(len)?)
            }
            TYPE_SIMPLE_LIST => {
                self.read_head()?;
                let len = self.read_length()?;
                JceValue::Bytes(Bytes::copy_from_slice(self.reader.read_bytes(len)?))
            }
            TYPE_LIST => self.read_nested(|decoder| {
                let len = decoder.read_length()?;
                let mut items = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    items.push(decoder.read_element()?);
                }
                Ok(JceValue::List(items))
            })?,
            TYPE_MAP => self.read_nested(|decoder| {
                let len = decoder.read_length()?;
                let mut entries = Vec::with_capacity(len.min(1024));
                for _ in 0..len {
                    let key = decoder.read_element()?;
                    let value = decoder.read_element()?;
                    entries.push((key, value));
                }
                Ok(JceValue::Map(entries))
            })?,
            TYPE_STRUCT_BEGIN => JceValue::Struct(self.read_nested(Self::read_struct)?),
            other => return Err(JceError::UnknownType(other)),
        };
        Ok(value)
    }
}
