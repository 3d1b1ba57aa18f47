use std::collections::HashMap;

use bytes::Bytes;

/// Raised when a read runs past the end of its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eof;

/// Checked big-endian cursor over a borrowed payload.
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    input: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    pub fn new(input: &'a [u8]) -> Self {
        Self { input, position: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.input.len() - self.position
    }

    pub fn is_eof(&self) -> bool {
        self.position == self.input.len()
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn peek_u8(&self) -> Result<u8, Eof> {
        self.input.get(self.position).copied().ok_or(Eof)
    }

    pub fn read_u8(&mut self) -> Result<u8, Eof> {
        let byte = self.peek_u8()?;
        self.position += 1;
        Ok(byte)
    }

    pub fn read_u16(&mut self) -> Result<u16, Eof> {
        let raw = self.read_array::<2>()?;
        Ok(u16::from_be_bytes(raw))
    }

    pub fn read_u32(&mut self) -> Result<u32, Eof> {
        let raw = self.read_array::<4>()?;
        Ok(u32::from_be_bytes(raw))
    }

    pub fn read_i32(&mut self) -> Result<i32, Eof> {
        let raw = self.read_array::<4>()?;
        Ok(i32::from_be_bytes(raw))
    }

    pub fn read_u64(&mut self) -> Result<u64, Eof> {
        let raw = self.read_array::<8>()?;
        Ok(u64::from_be_bytes(raw))
    }

    pub fn read_array<const N: usize>(&mut self) -> Result<[u8; N], Eof> {
        let raw = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], Eof> {
        let end = self.position.checked_add(len).ok_or(Eof)?;
        if end > self.input.len() {
            return Err(Eof);
        }

        let bytes = &self.input[self.position..end];
        self.position = end;
        Ok(bytes)
    }

    /// Reads a `u16`-length-prefixed field.
    pub fn read_short_bytes(&mut self) -> Result<&'a [u8], Eof> {
        let len = self.read_u16()? as usize;
        self.read_bytes(len)
    }

    pub fn skip(&mut self, len: usize) -> Result<(), Eof> {
        self.read_bytes(len).map(|_| ())
    }

    pub fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.input[self.position..];
        self.position = self.input.len();
        bytes
    }
}

/// Reads `u16 tag | u16 len | value` entries until at most two bytes remain.
pub fn read_tlv_map(reader: &mut Reader<'_>) -> Result<HashMap<u16, Bytes>, Eof> {
    let mut map = HashMap::new();
    while reader.remaining() > 2 {
        let tag = reader.read_u16()?;
        let value = reader.read_short_bytes()?;
        map.insert(tag, Bytes::copy_from_slice(value));
    }
    Ok(map)
}
