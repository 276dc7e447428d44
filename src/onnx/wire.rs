use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("truncated varint")]
    TruncatedVarint,
    #[error("varint longer than 10 bytes")]
    VarintOverflow,
    #[error("field length {0} exceeds remaining buffer ({1} bytes)")]
    LengthOutOfBounds(usize, usize),
    #[error("unknown wire type {0}")]
    UnknownWireType(u32),
    #[error("unexpected wire type {got} for field {field} (expected {want})")]
    WrongWireType { field: u32, got: u32, want: u32 },
    #[error("invalid utf-8 in string field")]
    InvalidUtf8,
}

pub type Result<T> = std::result::Result<T, WireError>;

pub const WIRE_VARINT: u32 = 0;
pub const WIRE_FIXED64: u32 = 1;
pub const WIRE_LEN: u32 = 2;
pub const WIRE_FIXED32: u32 = 5;

/// Cursor over an encoded protobuf message.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    pub fn is_empty(&self) -> bool {
        self.pos >= self.buf.len()
    }

    /// Reads the next field key. Returns None at end of buffer.
    pub fn next_field(&mut self) -> Result<Option<(u32, u32)>> {
        if self.is_empty() {
            return Ok(None);
        }
        let key = self.read_varint()?;
        let field = (key >> 3) as u32;
        let wire = (key & 0x7) as u32;
        match wire {
            WIRE_VARINT | WIRE_FIXED64 | WIRE_LEN | WIRE_FIXED32 => Ok(Some((field, wire))),
            other => Err(WireError::UnknownWireType(other)),
        }
    }

    pub fn read_varint(&mut self) -> Result<u64> {
        let mut value = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = *self.buf.get(self.pos).ok_or(WireError::TruncatedVarint)?;
            self.pos += 1;
            if shift >= 70 {
                return Err(WireError::VarintOverflow);
            }
            value |= u64::from(byte & 0x7f) << shift;
            if byte & 0x80 == 0 {
                return Ok(value);
            }
            shift += 7;
        }
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(self.read_varint()? as i64)
    }

    pub fn read_bytes(&mut self) -> Result<&'a [u8]> {
        let len = self.read_varint()? as usize;
        let remaining = self.buf.len() - self.pos;
        if len > remaining {
            return Err(WireError::LengthOutOfBounds(len, remaining));
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn read_string(&mut self) -> Result<String> {
        let bytes = self.read_bytes()?;
        String::from_utf8(bytes.to_vec()).map_err(|_| WireError::InvalidUtf8)
    }

    pub fn read_fixed32(&mut self) -> Result<u32> {
        let remaining = self.buf.len() - self.pos;
        if remaining < 4 {
            return Err(WireError::LengthOutOfBounds(4, remaining));
        }
        let v = LittleEndian::read_u32(&self.buf[self.pos..]);
        self.pos += 4;
        Ok(v)
    }

    pub fn read_fixed64(&mut self) -> Result<u64> {
        let remaining = self.buf.len() - self.pos;
        if remaining < 8 {
            return Err(WireError::LengthOutOfBounds(8, remaining));
        }
        let v = LittleEndian::read_u64(&self.buf[self.pos..]);
        self.pos += 8;
        Ok(v)
    }

    /// Reads a packed repeated int64 field into `out`.
    pub fn read_packed_i64(&mut self, out: &mut Vec<i64>) -> Result<()> {
        let bytes = self.read_bytes()?;
        let mut inner = Reader::new(bytes);
        while !inner.is_empty() {
            out.push(inner.read_i64()?);
        }
        Ok(())
    }

    pub fn skip(&mut self, wire: u32) -> Result<()> {
        match wire {
            WIRE_VARINT => {
                self.read_varint()?;
            }
            WIRE_FIXED64 => {
                self.read_fixed64()?;
            }
            WIRE_LEN => {
                self.read_bytes()?;
            }
            WIRE_FIXED32 => {
                self.read_fixed32()?;
            }
            other => return Err(WireError::UnknownWireType(other)),
        }
        Ok(())
    }
}

/// Appends protobuf-encoded fields to a byte buffer.
#[derive(Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn key(&mut self, field: u32, wire: u32) {
        self.varint(u64::from(field << 3 | wire));
    }

    fn varint(&mut self, mut value: u64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                self.buf.push(byte);
                return;
            }
            self.buf.push(byte | 0x80);
        }
    }

    pub fn write_varint(&mut self, field: u32, value: u64) {
        self.key(field, WIRE_VARINT);
        self.varint(value);
    }

    pub fn write_i64(&mut self, field: u32, value: i64) {
        self.write_varint(field, value as u64);
    }

    pub fn write_bytes(&mut self, field: u32, value: &[u8]) {
        self.key(field, WIRE_LEN);
        self.varint(value.len() as u64);
        self.buf.extend_from_slice(value);
    }

    pub fn write_string(&mut self, field: u32, value: &str) {
        self.write_bytes(field, value.as_bytes());
    }

    pub fn write_message(&mut self, field: u32, inner: Writer) {
        self.write_bytes(field, &inner.buf);
    }

    pub fn write_float(&mut self, field: u32, value: f32) {
        self.key(field, WIRE_FIXED32);
        let mut raw = [0u8; 4];
        LittleEndian::write_f32(&mut raw, value);
        self.buf.extend_from_slice(&raw);
    }

    pub fn write_packed_i64(&mut self, field: u32, values: &[i64]) {
        if values.is_empty() {
            return;
        }
        let mut inner = Writer::new();
        for &v in values {
            inner.varint(v as u64);
        }
        self.write_message(field, inner);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varint_round_trip() {
        let mut w = Writer::new();
        assert!(w.is_empty());
        w.write_varint(1, 0);
        w.write_varint(2, 127);
        w.write_varint(3, 128);
        w.write_varint(4, u64::MAX);
        assert!(!w.is_empty());
        let written = w.len();
        let bytes = w.into_bytes();
        assert_eq!(bytes.len(), written);

        let mut r = Reader::new(&bytes);
        for expected in [0u64, 127, 128, u64::MAX] {
            let (_, wire) = r.next_field().unwrap().unwrap();
            assert_eq!(wire, WIRE_VARINT);
            assert_eq!(r.read_varint().unwrap(), expected);
        }
        assert!(r.next_field().unwrap().is_none());
    }

    #[test]
    fn negative_i64_uses_ten_bytes() {
        let mut w = Writer::new();
        w.write_i64(1, -1);
        let bytes = w.into_bytes();
        // key + 10 continuation bytes
        assert_eq!(bytes.len(), 11);

        let mut r = Reader::new(&bytes);
        r.next_field().unwrap().unwrap();
        assert_eq!(r.read_i64().unwrap(), -1);
    }

    #[test]
    fn length_delimited_and_skip() {
        let mut w = Writer::new();
        w.write_string(1, "input");
        w.write_float(2, 0.5);
        w.write_string(3, "output");
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        let (field, _) = r.next_field().unwrap().unwrap();
        assert_eq!(field, 1);
        assert_eq!(r.read_string().unwrap(), "input");

        // skip the float field
        let (field, wire) = r.next_field().unwrap().unwrap();
        assert_eq!(field, 2);
        r.skip(wire).unwrap();

        let (field, _) = r.next_field().unwrap().unwrap();
        assert_eq!(field, 3);
        assert_eq!(r.read_string().unwrap(), "output");
    }

    #[test]
    fn truncated_length_is_an_error() {
        let mut w = Writer::new();
        w.write_string(1, "weights");
        let mut bytes = w.into_bytes();
        bytes.truncate(bytes.len() - 3);

        let mut r = Reader::new(&bytes);
        r.next_field().unwrap().unwrap();
        assert!(matches!(
            r.read_bytes(),
            Err(WireError::LengthOutOfBounds(..))
        ));
    }

    #[test]
    fn packed_i64_round_trip() {
        let mut w = Writer::new();
        w.write_packed_i64(1, &[1, 3, 224, 224]);
        let bytes = w.into_bytes();

        let mut r = Reader::new(&bytes);
        r.next_field().unwrap().unwrap();
        let mut dims = Vec::new();
        r.read_packed_i64(&mut dims).unwrap();
        assert_eq!(dims, vec![1, 3, 224, 224]);
    }
}
