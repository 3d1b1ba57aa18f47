use bytes::{BufMut, Bytes, BytesMut};

/// Big-endian packet builder used by every outbound layer.
#[derive(Debug, Default, Clone)]
pub struct Writer {
    buf: BytesMut,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    pub fn u8(&mut self, value: u8) -> &mut Self {
        self.buf.put_u8(value);
        self
    }

    pub fn u16(&mut self, value: u16) -> &mut Self {
        self.buf.put_u16(value);
        self
    }

    pub fn u32(&mut self, value: u32) -> &mut Self {
        self.buf.put_u32(value);
        self
    }

    pub fn i32(&mut self, value: i32) -> &mut Self {
        self.buf.put_i32(value);
        self
    }

    pub fn u64(&mut self, value: u64) -> &mut Self {
        self.buf.put_u64(value);
        self
    }

    pub fn bytes(&mut self, value: impl AsRef<[u8]>) -> &mut Self {
        self.buf.put_slice(value.as_ref());
        self
    }

    /// Writes `u32(len + 4) | value`, the SSO length-prefix convention.
    pub fn with_length(&mut self, value: impl AsRef<[u8]>) -> &mut Self {
        let value = value.as_ref();
        self.buf.put_u32(value.len() as u32 + 4);
        self.buf.put_slice(value);
        self
    }

    /// Writes `u16(len) | value`.
    pub fn short_bytes(&mut self, value: impl AsRef<[u8]>) -> &mut Self {
        let value = value.as_ref();
        self.buf.put_u16(value.len() as u16);
        self.buf.put_slice(value);
        self
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn freeze(self) -> Bytes {
        self.buf.freeze()
    }
}

/// Returns `u32(len + 4) | value` as a standalone buffer.
pub fn with_length(value: impl AsRef<[u8]>) -> Bytes {
    let mut writer = Writer::new();
    writer.with_length(value);
    writer.freeze()
}
