//! Short address allocation
//!
//! ## Structured SIDs
//!
//! A structured SID is four 4-bit levels. The leader owns `0x0000` and hands
//! out the top nibble (`0x1000`..`0xb000`), a router owning `0x1000` hands
//! out the next nibble (`0x1100`..`0x1f00`) and so on, so the parent of a
//! node is always its SID with the lowest non-zero nibble cleared.
//!
//! ```text
//! leader  0x0000 ── 0x1000 ── 0x1100 ── 0x1110 ── 0x1111
//!               └── 0x2000   └── 0x1200
//! ```
//!
//! Mobile nodes never route and get a flat partial-function SID
//! `0xC000 | index` from whichever router they attach to.
//!
//! ## Random SIDs
//!
//! Used with the vector router: the leader alone hands out unique random
//! SIDs, keyed by uuid so a rejoining node keeps its address.

use crate::error::{MeshError, MeshResult};
use crate::tlv::SsidInfo;
use crate::types::{ExtAddr, Mode, NodeType, LEADER_SID, MOBILE_PREFIX, PF_SID_PREFIX_OFFSET};
use rand::Rng;
use tracing::debug;

/// Children bitmap of the leader (bit 0 reserved, top nibble 0xc..0xf kept out)
pub const LEADER_DEF_BITMAP: u16 = 0x0ffe;
/// Children bitmap of a router (bit 0 reserved)
pub const ROUTER_DEF_BITMAP: u16 = 0xfffe;
/// Partial-function SIDs per router
pub const PF_NODE_NUM: usize = 256;
/// Largest random SID
pub const RANDOM_SID_MAX: u16 = 0xfff0;

/// A uuid → SID mapping owned by an allocator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidNode {
    pub uuid: ExtAddr,
    pub sid: u16,
    pub node_type: NodeType,
}

/// Allocation request from a joiner
#[derive(Debug, Clone, Copy)]
pub struct SidRequest {
    pub uuid: ExtAddr,
    pub mode: Mode,
    /// SID the joiner held before, reused when still free
    pub expected_sid: Option<u16>,
}

/// Bit shift of the child level below `sid`, -4 for a bottom-level SID
pub fn sid_shift(sid: u16) -> i8 {
    let mut index = 0i8;
    while index < 16 {
        if (sid >> index) & 0x000f != 0 {
            break;
        }
        index += 4;
    }
    index - 4
}

/// SID of the parent of a structured `sid`
pub fn parent_sid(sid: u16) -> u16 {
    if sid == LEADER_SID {
        return LEADER_SID;
    }
    let shift = sid_shift(sid) + 4;
    sid & !(0x000f << shift)
}

/// Whether `sid` sits anywhere below `ancestor` in the structured tree
pub fn is_descendant(ancestor: u16, sid: u16) -> bool {
    if ancestor == sid {
        return false;
    }
    let shift = sid_shift(ancestor);
    if shift < 0 {
        return false;
    }
    let prefix_mask = !((1u32 << (shift as u32 + 4)) - 1) as u16;
    (sid & prefix_mask) == (ancestor & prefix_mask)
}

/// Hierarchical allocator of one router
#[derive(Debug, Clone)]
pub struct StructuredAllocator {
    prefix: u16,
    shift: i8,
    free_bits: u16,
    pf_free: Vec<bool>,
    nodes: Vec<SidNode>,
}

impl StructuredAllocator {
    /// Allocator for children of `local_sid`
    pub fn new(local_sid: u16) -> Self {
        let shift = sid_shift(local_sid);
        let free_bits = if local_sid == LEADER_SID {
            LEADER_DEF_BITMAP
        } else if shift >= 0 {
            ROUTER_DEF_BITMAP
        } else {
            0
        };
        let mut pf_free = vec![true; PF_NODE_NUM];
        pf_free[0] = false;
        Self {
            prefix: local_sid,
            shift,
            free_bits,
            pf_free,
            nodes: Vec::new(),
        }
    }

    pub fn prefix(&self) -> u16 {
        self.prefix
    }

    fn slot_of(&self, sid: u16) -> Option<u16> {
        if self.shift < 0 || !self.is_direct_child(sid) {
            return None;
        }
        Some((sid >> self.shift) & 0x000f)
    }

    /// Whether `sid` is one level below this allocator's prefix
    pub fn is_direct_child(&self, sid: u16) -> bool {
        if self.shift < 0 || sid == self.prefix {
            return false;
        }
        let shift = self.shift as u32;
        let prefix_mask = !((1u32 << (shift + 4)) - 1) as u16;
        let low_mask = ((1u32 << shift) - 1) as u16;
        (sid & prefix_mask) == (self.prefix & prefix_mask) && sid & low_mask == 0
    }

    fn pf_sid(index: usize) -> u16 {
        (MOBILE_PREFIX << PF_SID_PREFIX_OFFSET) | index as u16
    }

    fn allocate_pf(&mut self, request: &SidRequest) -> MeshResult<SidNode> {
        let index = self
            .pf_free
            .iter()
            .position(|free| *free)
            .ok_or(MeshError::Mem)?;
        self.pf_free[index] = false;
        Ok(SidNode {
            uuid: request.uuid,
            sid: Self::pf_sid(index),
            node_type: NodeType::Leaf,
        })
    }

    fn claim_slot(&mut self, slot: u16) -> Option<u16> {
        if slot >= 16 || self.free_bits & (1 << slot) == 0 {
            return None;
        }
        self.free_bits &= !(1 << slot);
        Some(self.prefix | (slot << self.shift))
    }

    /// Allocate (or return the existing) SID for a joiner
    pub fn allocate(&mut self, request: &SidRequest) -> MeshResult<SidNode> {
        if let Some(node) = self.nodes.iter().find(|n| n.uuid == request.uuid) {
            return Ok(*node);
        }

        let node = if request.mode.is_mobile() {
            self.allocate_pf(request)?
        } else {
            if self.shift < 0 {
                return Err(MeshError::Mem);
            }
            let expected = request.expected_sid.and_then(|sid| self.slot_of(sid));
            let sid = match expected.and_then(|slot| self.claim_slot(slot)) {
                Some(sid) => sid,
                None => {
                    let slot = (1..16)
                        .find(|slot| self.free_bits & (1 << slot) != 0)
                        .ok_or(MeshError::Mem)?;
                    self.claim_slot(slot).ok_or(MeshError::Mem)?
                }
            };
            let node_type = if self.shift == 0 {
                NodeType::Leaf
            } else {
                NodeType::Router
            };
            SidNode {
                uuid: request.uuid,
                sid,
                node_type,
            }
        };
        debug!(uuid = %node.uuid, sid = format_args!("{:04x}", node.sid), "sid allocated");
        self.nodes.push(node);
        Ok(node)
    }

    /// Return a SID to the pool
    pub fn free(&mut self, sid: u16) {
        if crate::types::is_partial_function_sid(sid) {
            let index = (sid & 0x0fff) as usize;
            if index > 0 && index < PF_NODE_NUM {
                self.pf_free[index] = true;
            }
        } else if let Some(slot) = self.slot_of(sid) {
            let default = if self.prefix == LEADER_SID {
                LEADER_DEF_BITMAP
            } else {
                ROUTER_DEF_BITMAP
            };
            self.free_bits |= (1 << slot) & default;
        }
        self.nodes.retain(|n| n.sid != sid);
    }

    pub fn nodes(&self) -> &[SidNode] {
        &self.nodes
    }

    /// Structured children currently allocated
    pub fn allocated_number(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| !crate::types::is_partial_function_sid(n.sid))
            .count()
    }

    /// Structured slots still free
    pub fn free_number(&self) -> usize {
        self.free_bits.count_ones() as usize
    }
}

/// Leader-only random allocator
#[derive(Debug, Clone, Default)]
pub struct RandomAllocator {
    nodes: Vec<SidNode>,
}

impl RandomAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate<R: Rng>(&mut self, request: &SidRequest, rng: &mut R) -> MeshResult<SidNode> {
        if let Some(node) = self.nodes.iter().find(|n| n.uuid == request.uuid) {
            return Ok(*node);
        }
        if self.nodes.len() >= RANDOM_SID_MAX as usize - 1 {
            return Err(MeshError::Mem);
        }
        let in_use = |sid: u16, nodes: &[SidNode]| nodes.iter().any(|n| n.sid == sid);
        let sid = match request.expected_sid {
            Some(sid) if (1..=RANDOM_SID_MAX).contains(&sid) && !in_use(sid, &self.nodes) => sid,
            _ => loop {
                let candidate = rng.gen_range(1..=RANDOM_SID_MAX);
                if !in_use(candidate, &self.nodes) {
                    break candidate;
                }
            },
        };
        let node_type = if request.mode.is_mobile() {
            NodeType::Leaf
        } else {
            NodeType::Router
        };
        let node = SidNode {
            uuid: request.uuid,
            sid,
            node_type,
        };
        self.nodes.push(node);
        Ok(node)
    }

    pub fn free(&mut self, sid: u16) {
        self.nodes.retain(|n| n.sid != sid);
    }

    pub fn nodes(&self) -> &[SidNode] {
        &self.nodes
    }
}

/// SID allocator selected by the router policy
#[derive(Debug, Clone, Default)]
pub enum SidAllocator {
    Structured(StructuredAllocator),
    Random(RandomAllocator),
    /// Detached or leaf: nothing to hand out
    #[default]
    None,
}

impl SidAllocator {
    pub fn is_structured(&self) -> bool {
        matches!(self, SidAllocator::Structured(_))
    }

    pub fn allocate<R: Rng>(&mut self, request: &SidRequest, rng: &mut R) -> MeshResult<SidNode> {
        match self {
            SidAllocator::Structured(a) => a.allocate(request),
            SidAllocator::Random(a) => a.allocate(request, rng),
            SidAllocator::None => Err(MeshError::Fail),
        }
    }

    pub fn free(&mut self, sid: u16) {
        match self {
            SidAllocator::Structured(a) => a.free(sid),
            SidAllocator::Random(a) => a.free(sid),
            SidAllocator::None => {}
        }
    }

    /// Drop whatever was allocated to `uuid`
    pub fn release_uuid(&mut self, uuid: &ExtAddr) {
        if let Some(sid) = self.get_allocated_child(uuid).map(|n| n.sid) {
            self.free(sid);
        }
    }

    pub fn get_allocated_child(&self, uuid: &ExtAddr) -> Option<&SidNode> {
        self.nodes().iter().find(|n| n.uuid == *uuid)
    }

    pub fn is_direct_child(&self, sid: u16) -> bool {
        match self {
            SidAllocator::Structured(a) => a.is_direct_child(sid),
            _ => false,
        }
    }

    pub fn nodes(&self) -> &[SidNode] {
        match self {
            SidAllocator::Structured(a) => a.nodes(),
            SidAllocator::Random(a) => a.nodes(),
            SidAllocator::None => &[],
        }
    }

    pub fn allocated_number(&self) -> usize {
        match self {
            SidAllocator::Structured(a) => a.allocated_number(),
            SidAllocator::Random(a) => a.nodes().len(),
            SidAllocator::None => 0,
        }
    }

    /// Free structured slots, advertised in SSID_INFO
    pub fn free_number(&self) -> usize {
        match self {
            SidAllocator::Structured(a) => a.free_number(),
            _ => 0,
        }
    }

    /// Children and free slots clamped to their wire widths
    pub fn ssid_info(&self) -> SsidInfo {
        SsidInfo {
            child_num: self.allocated_number().min(u16::MAX as usize) as u16,
            free_slots: self.free_number().min(u8::MAX as usize) as u8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn req(b: u8, mode: Mode) -> SidRequest {
        SidRequest {
            uuid: ExtAddr([b; 8]),
            mode,
            expected_sid: None,
        }
    }

    #[test]
    fn test_sid_shift_levels() {
        assert_eq!(sid_shift(0x0000), 12);
        assert_eq!(sid_shift(0x1000), 8);
        assert_eq!(sid_shift(0x1200), 4);
        assert_eq!(sid_shift(0x1230), 0);
        assert_eq!(sid_shift(0x1234), -4);
    }

    #[test]
    fn test_parent_and_descendant() {
        assert_eq!(parent_sid(0x1230), 0x1200);
        assert_eq!(parent_sid(0x1000), 0x0000);
        assert!(is_descendant(0x0000, 0x1234));
        assert!(is_descendant(0x1000, 0x1230));
        assert!(!is_descendant(0x1000, 0x2000));
        assert!(!is_descendant(0x1234, 0x1235));
    }

    #[test]
    fn test_leader_allocates_top_level() {
        let mut alloc = StructuredAllocator::new(LEADER_SID);
        assert_eq!(alloc.free_number(), 11);
        let a = alloc.allocate(&req(1, Mode::RX_ON)).unwrap();
        assert_eq!(a.sid, 0x1000);
        assert_eq!(a.node_type, NodeType::Router);
        let b = alloc.allocate(&req(2, Mode::RX_ON)).unwrap();
        assert_eq!(b.sid, 0x2000);
        assert_eq!(alloc.allocate(&req(1, Mode::RX_ON)).unwrap().sid, 0x1000);
        assert!(alloc.is_direct_child(0x2000));
        assert!(!alloc.is_direct_child(0x2100));
        assert_eq!(alloc.free_number(), 9);
    }

    #[test]
    fn test_leader_exhaustion_and_free() {
        let mut alloc = StructuredAllocator::new(LEADER_SID);
        for b in 0..11 {
            alloc.allocate(&req(b, Mode::RX_ON)).unwrap();
        }
        assert_eq!(alloc.allocate(&req(50, Mode::RX_ON)), Err(MeshError::Mem));
        alloc.free(0x3000);
        assert_eq!(alloc.allocate(&req(50, Mode::RX_ON)).unwrap().sid, 0x3000);
    }

    #[test]
    fn test_expected_sid_reused() {
        let mut alloc = StructuredAllocator::new(0x1000);
        let mut r = req(7, Mode::RX_ON);
        r.expected_sid = Some(0x1500);
        assert_eq!(alloc.allocate(&r).unwrap().sid, 0x1500);
    }

    #[test]
    fn test_bottom_level_is_leaf() {
        let mut alloc = StructuredAllocator::new(0x1230);
        let node = alloc.allocate(&req(1, Mode::RX_ON)).unwrap();
        assert_eq!(node.sid, 0x1231);
        assert_eq!(node.node_type, NodeType::Leaf);

        let mut full = StructuredAllocator::new(0x1234);
        assert_eq!(full.free_number(), 0);
        assert_eq!(full.allocate(&req(1, Mode::RX_ON)), Err(MeshError::Mem));
    }

    #[test]
    fn test_mobile_gets_partial_function_sid() {
        let mut alloc = StructuredAllocator::new(0x1000);
        let node = alloc.allocate(&req(1, Mode::RX_ON.with(Mode::MOBILE))).unwrap();
        assert_eq!(node.sid, 0xc001);
        assert_eq!(node.node_type, NodeType::Leaf);
        assert!(crate::types::is_partial_function_sid(node.sid));
        assert_eq!(alloc.allocated_number(), 0);
        alloc.free(0xc001);
        assert!(alloc.nodes().is_empty());
    }

    #[test]
    fn test_random_allocator_unique_per_uuid() {
        let mut rng = StdRng::seed_from_u64(3);
        let mut alloc = RandomAllocator::new();
        let a = alloc.allocate(&req(1, Mode::RX_ON), &mut rng).unwrap();
        let b = alloc.allocate(&req(2, Mode::RX_ON), &mut rng).unwrap();
        assert_ne!(a.sid, b.sid);
        assert!((1..=RANDOM_SID_MAX).contains(&a.sid));
        assert_eq!(alloc.allocate(&req(1, Mode::RX_ON), &mut rng).unwrap(), a);
    }

    #[test]
    fn test_ssid_info_counts_children() {
        let mut rng = StdRng::seed_from_u64(2);
        let mut alloc = SidAllocator::Structured(StructuredAllocator::new(LEADER_SID));
        alloc.allocate(&req(1, Mode::RX_ON), &mut rng).unwrap();
        alloc.allocate(&req(2, Mode::RX_ON), &mut rng).unwrap();
        let info = alloc.ssid_info();
        assert_eq!(info.child_num, 2);
        assert_eq!(info.free_slots, 9);
        assert_eq!(SidAllocator::None.ssid_info().child_num, 0);
    }

    #[test]
    fn test_enum_delegates_and_releases() {
        let mut rng = StdRng::seed_from_u64(1);
        let mut alloc = SidAllocator::Structured(StructuredAllocator::new(LEADER_SID));
        let node = alloc.allocate(&req(4, Mode::RX_ON), &mut rng).unwrap();
        assert!(alloc.get_allocated_child(&ExtAddr([4; 8])).is_some());
        alloc.release_uuid(&ExtAddr([4; 8]));
        assert!(alloc.get_allocated_child(&ExtAddr([4; 8])).is_none());
        assert_eq!(alloc.allocate(&req(5, Mode::RX_ON), &mut rng).unwrap().sid, node.sid);
        assert!(SidAllocator::None.allocate(&req(1, Mode::RX_ON), &mut rng).is_err());
    }
}
