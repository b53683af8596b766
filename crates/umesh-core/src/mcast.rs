//! Multicast guard: duplicate suppression for flooded data frames
//!
//! Each originator stamps broadcast data with an 8-bit sequence number in a
//! small sub-header. Receivers remember the newest sequence seen per
//! (netid, sid) and drop anything not strictly newer, using a signed 8-bit
//! difference so the counter may wrap.
//!
//! ```text
//! | 0xA0 | netid (LE u16) | sid (LE u16) | sequence |
//! ```

use crate::cursor::{Reader, Writer};
use crate::error::{MeshError, MeshResult};

/// Sub-header dispatch byte
pub const MCAST_DISPATCH: u8 = 0xa0;
/// Encoded sub-header length
pub const MCAST_HEADER_LEN: usize = 6;
/// Remembered originators
pub const MCAST_CACHE_SIZE: usize = 32;
/// Lifetime of a cache entry
pub const MCAST_CACHE_LIFETIME_MS: u64 = 10_000;

/// Multicast sub-header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McastHeader {
    pub netid: u16,
    pub sid: u16,
    pub sequence: u8,
}

impl McastHeader {
    pub fn encode(&self, w: &mut Writer) -> MeshResult<()> {
        w.write_u8(MCAST_DISPATCH)?;
        w.write_u16_le(self.netid)?;
        w.write_u16_le(self.sid)?;
        w.write_u8(self.sequence)
    }

    pub fn decode(r: &mut Reader<'_>) -> MeshResult<Self> {
        if r.read_u8()? != MCAST_DISPATCH {
            return Err(MeshError::Parse("mcast dispatch"));
        }
        Ok(Self {
            netid: r.read_u16_le()?,
            sid: r.read_u16_le()?,
            sequence: r.read_u8()?,
        })
    }

    /// Whether a payload starts with a multicast sub-header
    pub fn is_mcast_header(first: u8) -> bool {
        first == MCAST_DISPATCH
    }
}

#[derive(Debug, Clone)]
struct McastEntry {
    netid: u16,
    sid: u16,
    sequence: u8,
    expires_at: u64,
}

/// Per-originator sequence cache
#[derive(Debug)]
pub struct MulticastGuard {
    sequence: u8,
    entries: Vec<McastEntry>,
    capacity: usize,
    lifetime_ms: u64,
}

impl Default for MulticastGuard {
    fn default() -> Self {
        Self::new(MCAST_CACHE_SIZE, MCAST_CACHE_LIFETIME_MS)
    }
}

impl MulticastGuard {
    pub fn new(capacity: usize, lifetime_ms: u64) -> Self {
        Self {
            sequence: 0,
            entries: Vec::with_capacity(capacity),
            capacity,
            lifetime_ms,
        }
    }

    /// Sub-header for the next locally originated multicast frame
    pub fn next_header(&mut self, netid: u16, sid: u16) -> McastHeader {
        self.sequence = self.sequence.wrapping_add(1);
        McastHeader {
            netid,
            sid,
            sequence: self.sequence,
        }
    }

    /// Accept or reject a received multicast frame
    ///
    /// Returns `Drop` for reflections of our own frames and for sequences
    /// that are not strictly newer than the cached one.
    pub fn check(&mut self, header: &McastHeader, local_netid: u16, local_sid: u16, now: u64) -> MeshResult<()> {
        if header.netid == local_netid && header.sid == local_sid {
            return Err(MeshError::Drop);
        }

        let expires_at = now + self.lifetime_ms;
        if let Some(entry) = self
            .entries
            .iter_mut()
            .find(|e| e.netid == header.netid && e.sid == header.sid)
        {
            let diff = header.sequence.wrapping_sub(entry.sequence) as i8;
            if diff <= 0 && entry.expires_at > now {
                return Err(MeshError::Drop);
            }
            entry.sequence = header.sequence;
            entry.expires_at = expires_at;
            return Ok(());
        }

        self.expire(now);
        if self.entries.len() >= self.capacity {
            self.evict_oldest();
        }
        self.entries.push(McastEntry {
            netid: header.netid,
            sid: header.sid,
            sequence: header.sequence,
            expires_at,
        });
        Ok(())
    }

    /// Remove entries past their lifetime
    pub fn expire(&mut self, now: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|e| e.expires_at > now);
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

    fn evict_oldest(&mut self) {
        if let Some(idx) = self
            .entries
            .iter()
            .enumerate()
            .min_by_key(|(_, e)| e.expires_at)
            .map(|(i, _)| i)
        {
            self.entries.swap_remove(idx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hdr(sid: u16, sequence: u8) -> McastHeader {
        McastHeader {
            netid: 0x1200,
            sid,
            sequence,
        }
    }

    #[test]
    fn test_newer_accepted_replay_dropped() {
        let mut guard = MulticastGuard::default();
        assert!(guard.check(&hdr(0x1000, 5), 0x1200, 0, 0).is_ok());
        assert!(guard.check(&hdr(0x1000, 6), 0x1200, 0, 10).is_ok());
        assert_eq!(guard.check(&hdr(0x1000, 5), 0x1200, 0, 20), Err(MeshError::Drop));
        assert_eq!(guard.check(&hdr(0x1000, 6), 0x1200, 0, 30), Err(MeshError::Drop));
    }

    #[test]
    fn test_sequence_wraparound() {
        let mut guard = MulticastGuard::default();
        guard.check(&hdr(0x2000, 250), 0x1200, 0, 0).unwrap();
        assert!(guard.check(&hdr(0x2000, 3), 0x1200, 0, 1).is_ok());
        assert_eq!(guard.check(&hdr(0x2000, 250), 0x1200, 0, 2), Err(MeshError::Drop));
    }

    #[test]
    fn test_reflection_dropped() {
        let mut guard = MulticastGuard::default();
        let own = guard.next_header(0x1200, 0x1000);
        assert_eq!(own.sequence, 1);
        assert_eq!(guard.check(&own, 0x1200, 0x1000, 0), Err(MeshError::Drop));
    }

    #[test]
    fn test_expired_entry_accepts_old_sequence() {
        let mut guard = MulticastGuard::new(4, 100);
        guard.check(&hdr(0x1000, 9), 0x1200, 0, 0).unwrap();
        assert!(guard.check(&hdr(0x1000, 2), 0x1200, 0, 500).is_ok());
    }

    #[test]
    fn test_capacity_bound() {
        let mut guard = MulticastGuard::new(2, 10_000);
        guard.check(&hdr(1, 1), 0x1200, 0, 0).unwrap();
        guard.check(&hdr(2, 1), 0x1200, 0, 1).unwrap();
        guard.check(&hdr(3, 1), 0x1200, 0, 2).unwrap();
        assert_eq!(guard.len(), 2);
    }

    #[test]
    fn test_header_codec() {
        let mut w = Writer::new();
        hdr(0x1234, 7).encode(&mut w).unwrap();
        assert_eq!(w.len(), MCAST_HEADER_LEN);
        let bytes = w.into_inner();
        assert!(McastHeader::is_mcast_header(bytes[0]));
        let mut r = Reader::new(&bytes);
        assert_eq!(McastHeader::decode(&mut r).unwrap(), hdr(0x1234, 7));
    }
}
