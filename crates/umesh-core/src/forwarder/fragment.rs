//! Fragmentation and reassembly
//!
//! Payloads larger than what fits after the mesh header go out as one
//! `FRAG_1` followed by `FRAG_N` fragments:
//!
//! ```text
//!  FRAG_1  | 11000 | size (11) | tag (16) |
//!  FRAG_N  | 11100 | size (11) | tag (16) | offset / 8 |
//! ```
//!
//! Every fragment but the last carries a multiple of 8 bytes. Reassembly is
//! keyed by link source and tag and tolerates any arrival order.

use crate::cursor::{Reader, Writer};
use crate::error::{MeshError, MeshResult};
use crate::types::ExtAddr;
use tracing::debug;

const FRAG_1_DISPATCH: u16 = 0b11000;
const FRAG_N_DISPATCH: u16 = 0b11100;
const SIZE_MASK: u16 = 0x07ff;

/// Encoded length of a `FRAG_1` header
pub const FRAG_1_HEADER_LEN: usize = 4;
/// Encoded length of a `FRAG_N` header
pub const FRAG_N_HEADER_LEN: usize = 5;
/// Largest datagram the size field can describe
pub const MAX_DATAGRAM_SIZE: usize = SIZE_MASK as usize;
/// Partially reassembled datagrams are dropped after this long
pub const REASSEMBLY_TIMEOUT_MS: u64 = 5_000;
/// Concurrent reassemblies per HAL
pub const MAX_REASSEMBLIES: usize = 4;

/// Fragment sub-header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragHeader {
    /// Total datagram size
    pub size: u16,
    pub tag: u16,
    /// Byte offset of this fragment, 0 for `FRAG_1`
    pub offset: u16,
}

impl FragHeader {
    /// Whether a byte starts a fragment header
    pub fn is_frag(first: u8) -> bool {
        let dispatch = (first >> 3) as u16;
        dispatch == FRAG_1_DISPATCH || dispatch == FRAG_N_DISPATCH
    }

    pub fn is_first(&self) -> bool {
        self.offset == 0
    }

    pub fn encoded_len(&self) -> usize {
        if self.is_first() {
            FRAG_1_HEADER_LEN
        } else {
            FRAG_N_HEADER_LEN
        }
    }

    pub fn encode(&self, w: &mut Writer) -> MeshResult<()> {
        let dispatch = if self.is_first() {
            FRAG_1_DISPATCH
        } else {
            FRAG_N_DISPATCH
        };
        w.write_u16_be((dispatch << 11) | (self.size & SIZE_MASK))?;
        w.write_u16_be(self.tag)?;
        if !self.is_first() {
            w.write_u8((self.offset >> 3) as u8)?;
        }
        Ok(())
    }

    pub fn decode(r: &mut Reader<'_>) -> MeshResult<FragHeader> {
        let head = r.read_u16_be()?;
        let size = head & SIZE_MASK;
        let tag = r.read_u16_be()?;
        match head >> 11 {
            FRAG_1_DISPATCH => Ok(FragHeader { size, tag, offset: 0 }),
            FRAG_N_DISPATCH => {
                let offset = (r.read_u8()? as u16) << 3;
                if offset == 0 {
                    return Err(MeshError::Parse("frag offset"));
                }
                Ok(FragHeader { size, tag, offset })
            }
            _ => Err(MeshError::Parse("frag dispatch")),
        }
    }
}

/// Fragment header and payload length of the next piece to send
///
/// `offset` is the number of payload bytes already sent. Returns `None` as
/// header when the whole payload fits in one frame.
pub fn plan_fragment(
    total: usize,
    offset: usize,
    header_len: usize,
    mtu: usize,
    tag: u16,
) -> MeshResult<(Option<FragHeader>, usize)> {
    if offset == 0 && header_len + total <= mtu {
        return Ok((None, total));
    }
    if total > MAX_DATAGRAM_SIZE || offset >= total {
        return Err(MeshError::Buffer);
    }
    let frag_header_len = if offset == 0 {
        FRAG_1_HEADER_LEN
    } else {
        FRAG_N_HEADER_LEN
    };
    let avail = mtu.checked_sub(header_len + frag_header_len).ok_or(MeshError::Buffer)?;
    let remaining = total - offset;
    let len = if offset > 0 && remaining <= avail {
        remaining
    } else {
        (avail & !7).min(remaining)
    };
    if len == 0 || offset > u8::MAX as usize * 8 {
        return Err(MeshError::Buffer);
    }
    let header = FragHeader {
        size: total as u16,
        tag,
        offset: offset as u16,
    };
    Ok((Some(header), len))
}

#[derive(Debug)]
struct Reassembly {
    src: ExtAddr,
    tag: u16,
    size: usize,
    buf: Vec<u8>,
    ranges: Vec<(usize, usize)>,
    received: usize,
    deadline: u64,
}

/// Per-HAL reassembly buffers
#[derive(Debug)]
pub struct Reassembler {
    entries: Vec<Reassembly>,
    capacity: usize,
    timeout_ms: u64,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(MAX_REASSEMBLIES, REASSEMBLY_TIMEOUT_MS)
    }
}

impl Reassembler {
    pub fn new(capacity: usize, timeout_ms: u64) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
            timeout_ms,
        }
    }

    fn discard(&mut self, idx: usize, reason: &'static str) -> MeshError {
        let entry = self.entries.remove(idx);
        debug!(src = %entry.src, tag = entry.tag, reason, "reassembly dropped");
        MeshError::Drop
    }

    /// Add one fragment
    ///
    /// Returns the complete datagram once every byte arrived. An
    /// inconsistent fragment discards the whole datagram with `Drop`.
    pub fn insert(&mut self, src: ExtAddr, frag: &FragHeader, data: &[u8], now: u64) -> MeshResult<Option<Vec<u8>>> {
        let size = frag.size as usize;
        let idx = match self.entries.iter().position(|e| e.src == src && e.tag == frag.tag) {
            Some(idx) => idx,
            None => {
                if size == 0 {
                    return Err(MeshError::Drop);
                }
                if self.entries.len() >= self.capacity {
                    if let Some(oldest) = self
                        .entries
                        .iter()
                        .enumerate()
                        .min_by_key(|(_, e)| e.deadline)
                        .map(|(i, _)| i)
                    {
                        self.discard(oldest, "reassembly buffers full");
                    }
                }
                self.entries.push(Reassembly {
                    src,
                    tag: frag.tag,
                    size,
                    buf: vec![0; size],
                    ranges: Vec::new(),
                    received: 0,
                    deadline: now + self.timeout_ms,
                });
                self.entries.len() - 1
            }
        };

        let start = frag.offset as usize;
        let end = start + data.len();
        let entry = &self.entries[idx];
        if entry.size != size {
            return Err(self.discard(idx, "size mismatch"));
        }
        if data.is_empty() || end > entry.size {
            return Err(self.discard(idx, "fragment overflow"));
        }
        if entry.ranges.iter().any(|&(s, e)| s == start && e == end) {
            return Ok(None);
        }
        if entry.ranges.iter().any(|&(s, e)| start < e && s < end) {
            return Err(self.discard(idx, "overlapping fragment"));
        }

        let entry = &mut self.entries[idx];
        entry.buf[start..end].copy_from_slice(data);
        entry.ranges.push((start, end));
        entry.received += data.len();
        if entry.received < entry.size {
            return Ok(None);
        }
        let done = self.entries.remove(idx);
        Ok(Some(done.buf))
    }

    /// Drop datagrams past their deadline
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.deadline > now);
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn split(payload: &[u8], header_len: usize, mtu: usize) -> Vec<(Option<FragHeader>, Vec<u8>)> {
        let mut out = Vec::new();
        let mut offset = 0;
        while offset < payload.len() {
            let (header, len) = plan_fragment(payload.len(), offset, header_len, mtu, 7).unwrap();
            out.push((header, payload[offset..offset + len].to_vec()));
            offset += len;
        }
        out
    }

    #[test]
    fn test_header_codec() {
        let first = FragHeader { size: 300, tag: 0x1234, offset: 0 };
        let mut w = Writer::new();
        first.encode(&mut w).unwrap();
        assert_eq!(w.as_slice(), &[0xc1, 0x2c, 0x12, 0x34]);
        assert!(FragHeader::is_frag(w.as_slice()[0]));

        let next = FragHeader { size: 300, tag: 0x1234, offset: 96 };
        let mut w = Writer::new();
        next.encode(&mut w).unwrap();
        assert_eq!(w.as_slice(), &[0xe1, 0x2c, 0x12, 0x34, 12]);
        let decoded = FragHeader::decode(&mut Reader::new(w.as_slice())).unwrap();
        assert_eq!(decoded, next);
    }

    #[test]
    fn test_small_payload_not_fragmented() {
        assert_eq!(plan_fragment(50, 0, 20, 127, 1).unwrap(), (None, 50));
    }

    #[test]
    fn test_fragment_lengths_are_aligned() {
        let payload: Vec<u8> = (0..300u16).map(|i| i as u8).collect();
        let pieces = split(&payload, 21, 127);
        assert!(pieces.len() > 2);
        for (header, data) in &pieces[..pieces.len() - 1] {
            let header = header.unwrap();
            assert_eq!(data.len() % 8, 0);
            assert_eq!(header.offset % 8, 0);
            assert!(21 + header.encoded_len() + data.len() <= 127);
        }
        assert!(pieces[0].0.unwrap().is_first());
    }

    #[test]
    fn test_reassembly_any_order() {
        let payload: Vec<u8> = (0..500u16).map(|i| (i * 7) as u8).collect();
        let mut pieces = split(&payload, 12, 100);
        pieces.reverse();
        pieces.swap(0, 1);
        let mut reassembler = Reassembler::default();
        let src = ExtAddr([3; 8]);
        let mut result = None;
        for (header, data) in &pieces {
            if let Some(done) = reassembler.insert(src, &header.unwrap(), data, 0).unwrap() {
                result = Some(done);
            }
        }
        assert_eq!(result.unwrap(), payload);
        assert!(reassembler.is_empty());
    }

    #[test]
    fn test_inconsistent_fragment_drops_datagram() {
        let mut reassembler = Reassembler::default();
        let src = ExtAddr([3; 8]);
        let first = FragHeader { size: 64, tag: 1, offset: 0 };
        assert_eq!(reassembler.insert(src, &first, &[0; 32], 0).unwrap(), None);
        let wrong = FragHeader { size: 72, tag: 1, offset: 32 };
        assert_eq!(reassembler.insert(src, &wrong, &[0; 32], 0), Err(MeshError::Drop));
        assert!(reassembler.is_empty());

        reassembler.insert(src, &first, &[0; 32], 0).unwrap();
        let overlap = FragHeader { size: 64, tag: 1, offset: 24 };
        assert_eq!(reassembler.insert(src, &overlap, &[0; 16], 0), Err(MeshError::Drop));
        let overflow = FragHeader { size: 64, tag: 2, offset: 56 };
        assert_eq!(reassembler.insert(src, &overflow, &[0; 16], 0), Err(MeshError::Drop));
    }

    #[test]
    fn test_duplicate_fragment_ignored_and_expiry() {
        let mut reassembler = Reassembler::default();
        let src = ExtAddr([4; 8]);
        let first = FragHeader { size: 40, tag: 9, offset: 0 };
        reassembler.insert(src, &first, &[1; 16], 100).unwrap();
        assert_eq!(reassembler.insert(src, &first, &[1; 16], 100).unwrap(), None);
        assert_eq!(reassembler.len(), 1);
        assert_eq!(reassembler.expire(100 + REASSEMBLY_TIMEOUT_MS - 1), 0);
        assert_eq!(reassembler.expire(100 + REASSEMBLY_TIMEOUT_MS), 1);
    }
}
