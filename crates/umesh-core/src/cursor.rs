//! Bounds-checked byte cursors for wire encode/decode
//!
//! Every header, TLV and fragment codec reads through [`Reader`] and writes
//! through [`Writer`], so a short or oversized buffer surfaces as a
//! [`MeshError`] instead of an out-of-bounds access.

use crate::error::{MeshError, MeshResult};
use byteorder::{BigEndian, ByteOrder, LittleEndian, WriteBytesExt};

/// Read cursor over a borrowed buffer
#[derive(Debug, Clone)]
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes consumed so far
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Bytes left to read
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Take `n` bytes
    pub fn read_bytes(&mut self, n: usize) -> MeshResult<&'a [u8]> {
        if self.remaining() < n {
            return Err(MeshError::Parse("truncated"));
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(out)
    }

    /// Take a fixed-size array
    pub fn read_array<const N: usize>(&mut self) -> MeshResult<[u8; N]> {
        let bytes = self.read_bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn peek_u8(&self) -> MeshResult<u8> {
        self.buf
            .get(self.pos)
            .copied()
            .ok_or(MeshError::Parse("truncated"))
    }

    pub fn read_u8(&mut self) -> MeshResult<u8> {
        let b = self.peek_u8()?;
        self.pos += 1;
        Ok(b)
    }

    pub fn read_i8(&mut self) -> MeshResult<i8> {
        Ok(self.read_u8()? as i8)
    }

    pub fn read_u16_le(&mut self) -> MeshResult<u16> {
        Ok(LittleEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_u16_be(&mut self) -> MeshResult<u16> {
        Ok(BigEndian::read_u16(self.read_bytes(2)?))
    }

    pub fn read_u32_le(&mut self) -> MeshResult<u32> {
        Ok(LittleEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn read_u32_be(&mut self) -> MeshResult<u32> {
        Ok(BigEndian::read_u32(self.read_bytes(4)?))
    }

    pub fn skip(&mut self, n: usize) -> MeshResult<()> {
        self.read_bytes(n).map(|_| ())
    }

    /// Everything not yet consumed
    pub fn rest(&mut self) -> &'a [u8] {
        let out = &self.buf[self.pos..];
        self.pos = self.buf.len();
        out
    }
}

/// Write cursor into an owned buffer with an optional size limit
#[derive(Debug, Clone, Default)]
pub struct Writer {
    buf: Vec<u8>,
    limit: Option<usize>,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer that refuses to grow past `limit` bytes
    pub fn with_limit(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit),
            limit: Some(limit),
        }
    }

    fn reserve(&self, n: usize) -> MeshResult<()> {
        match self.limit {
            Some(limit) if self.buf.len() + n > limit => Err(MeshError::Buffer),
            _ => Ok(()),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn write_u8(&mut self, v: u8) -> MeshResult<()> {
        self.reserve(1)?;
        self.buf.push(v);
        Ok(())
    }

    pub fn write_i8(&mut self, v: i8) -> MeshResult<()> {
        self.write_u8(v as u8)
    }

    pub fn write_u16_le(&mut self, v: u16) -> MeshResult<()> {
        self.reserve(2)?;
        self.buf
            .write_u16::<LittleEndian>(v)
            .map_err(|_| MeshError::Buffer)
    }

    pub fn write_u16_be(&mut self, v: u16) -> MeshResult<()> {
        self.reserve(2)?;
        self.buf
            .write_u16::<BigEndian>(v)
            .map_err(|_| MeshError::Buffer)
    }

    pub fn write_u32_le(&mut self, v: u32) -> MeshResult<()> {
        self.reserve(4)?;
        self.buf
            .write_u32::<LittleEndian>(v)
            .map_err(|_| MeshError::Buffer)
    }

    pub fn write_u32_be(&mut self, v: u32) -> MeshResult<()> {
        self.reserve(4)?;
        self.buf
            .write_u32::<BigEndian>(v)
            .map_err(|_| MeshError::Buffer)
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> MeshResult<()> {
        self.reserve(bytes.len())?;
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    /// Overwrite a big-endian u16 already written at `offset`
    pub fn patch_u16_be(&mut self, offset: usize, v: u16) -> MeshResult<()> {
        let slot = self
            .buf
            .get_mut(offset..offset + 2)
            .ok_or(MeshError::Buffer)?;
        BigEndian::write_u16(slot, v);
        Ok(())
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_bounds() {
        let data = [0x01, 0x02, 0x03];
        let mut r = Reader::new(&data);
        assert_eq!(r.read_u16_le().unwrap(), 0x0201);
        assert_eq!(r.remaining(), 1);
        assert_eq!(r.read_u16_be(), Err(MeshError::Parse("truncated")));
        assert_eq!(r.read_u8().unwrap(), 0x03);
        assert!(r.is_empty());
        assert!(r.read_u8().is_err());
    }

    #[test]
    fn test_reader_array_and_rest() {
        let data = [9, 8, 7, 6, 5];
        let mut r = Reader::new(&data);
        let head: [u8; 2] = r.read_array().unwrap();
        assert_eq!(head, [9, 8]);
        assert_eq!(r.rest(), &[7, 6, 5]);
        assert_eq!(r.position(), 5);
    }

    #[test]
    fn test_writer_limit() {
        let mut w = Writer::with_limit(3);
        w.write_u16_be(0xabcd).unwrap();
        assert_eq!(w.write_u16_le(1), Err(MeshError::Buffer));
        w.write_u8(0xef).unwrap();
        assert_eq!(w.into_inner(), vec![0xab, 0xcd, 0xef]);
    }

    #[test]
    fn test_writer_patch() {
        let mut w = Writer::new();
        w.write_u16_be(0).unwrap();
        w.write_u8(1).unwrap();
        w.patch_u16_be(0, 0x1234).unwrap();
        assert_eq!(w.as_slice(), &[0x12, 0x34, 0x01]);
        assert!(w.patch_u16_be(2, 0).is_err());
    }
}
