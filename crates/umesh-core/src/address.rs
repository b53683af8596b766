//! Address resolution, SID cache and address notifications
//!
//! ## Query cache
//!
//! A node that must reach a uuid it has no SID for, or a mobile SID it has
//! no attach point for, asks the leader with `ADDRESS_QUERY` and parks the
//! message on the HAL's pending queue.
//!
//! ```text
//!   Invalid ──lookup──► Query ──response──► Cached
//!                        │ timeout hits 0
//!                        ▼
//!                 back-off for retry_timeout ticks (lookups dropped),
//!                 then the next lookup queries again
//! ```
//!
//! ## SID cache
//!
//! The leader (or a super router) learns `uuid → (sid, netid, attach)` from
//! the `ADDRESS_NOTIFICATION` every attached node sends, answers queries
//! from it and sizes the network by it.

use crate::command;
use crate::error::{MeshError, MeshResult};
use crate::message::{Message, MessageInfo};
use crate::node::MeshNode;
use crate::timer::TimerKind;
use crate::tlv::{Tlv, Tlvs, ATTACH_QUERY, TARGET_QUERY};
use crate::types::{
    get_leader_sid, is_partial_function_sid, Addr, DeviceState, ExtAddr, MeshAddr, Mode, NodeId, BCAST_SID,
};
use tracing::{debug, info, warn};

/// Query cache capacity
pub const ADDRESS_CACHE_SIZE: usize = 8;
/// Query ticks before a query is given up
pub const ADDRESS_QUERY_TIMEOUT: u8 = 3;
/// Back-off ticks before a failed target may be queried again
pub const ADDRESS_QUERY_RETRY_TIMEOUT: u8 = 3;
/// Query cache tick
pub const ADDRESS_QUERY_STATE_UPDATE_PERIOD_MS: u64 = 1_000;
/// SID cache aging tick
pub const ADDR_CACHE_CHECK_INTERVAL_MS: u64 = 60_000;

/// What a query asks about
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryTarget {
    /// SID of a uuid
    Uuid(ExtAddr),
    /// Attach point of a SID
    Sid { sid: u16, netid: u16 },
}

impl QueryTarget {
    pub fn query_type(&self) -> u8 {
        match self {
            QueryTarget::Uuid(_) => TARGET_QUERY,
            QueryTarget::Sid { .. } => ATTACH_QUERY,
        }
    }

    /// Whether a message destination refers to this target
    fn matches(&self, dest: &MeshAddr) -> bool {
        match (self, dest.addr) {
            (QueryTarget::Uuid(uuid), Addr::Ext(mac)) => *uuid == mac,
            (QueryTarget::Sid { sid, netid }, Addr::Short(s)) => *sid == s && *netid == dest.netid,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Invalid,
    Query,
    Cached,
}

/// One query cache slot
#[derive(Debug, Clone, Copy)]
pub struct AddressCacheEntry {
    pub target: QueryTarget,
    pub state: CacheState,
    /// Resolved SID and netid
    pub node: Option<NodeId>,
    /// Attach router of a node that does not route itself
    pub attach: Option<NodeId>,
    pub timeout: u8,
    pub retry_timeout: u8,
    last_used: u64,
}

/// Outcome of a cache lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    Resolved { node: NodeId, attach: Option<NodeId> },
    /// A query is in flight, park the message
    Pending,
    /// Query failed recently, drop the message
    Backoff,
    /// Nothing known, a query must be sent
    Miss,
}

/// What a cache tick asks the node to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryExpiry {
    /// Query gave up, drop the parked messages for this target
    DropPending(QueryTarget),
}

/// Bounded query cache
#[derive(Debug, Default)]
pub struct AddressResolver {
    entries: Vec<AddressCacheEntry>,
    clock: u64,
}

impl AddressResolver {
    pub fn new() -> Self {
        Self::default()
    }

    fn find_mut(&mut self, target: &QueryTarget) -> Option<&mut AddressCacheEntry> {
        self.entries
            .iter_mut()
            .find(|e| e.target == *target && e.state != CacheState::Invalid)
    }

    pub fn get(&self, target: &QueryTarget) -> Option<&AddressCacheEntry> {
        self.entries
            .iter()
            .find(|e| e.target == *target && e.state != CacheState::Invalid)
    }

    /// Look a target up, re-arming an expired query
    pub fn lookup(&mut self, target: &QueryTarget) -> Lookup {
        self.clock += 1;
        let clock = self.clock;
        let Some(entry) = self.find_mut(target) else {
            return Lookup::Miss;
        };
        entry.last_used = clock;
        match entry.state {
            CacheState::Cached => match entry.node {
                Some(node) => Lookup::Resolved {
                    node,
                    attach: entry.attach,
                },
                None => Lookup::Miss,
            },
            CacheState::Query if entry.timeout > 0 => Lookup::Pending,
            CacheState::Query if entry.retry_timeout > 0 => Lookup::Backoff,
            _ => Lookup::Miss,
        }
    }

    /// Put a target into the query state
    ///
    /// Reuses the target's slot, then a free slot, then the least recently
    /// used cached slot. Fails with `Drop` when every slot is querying.
    pub fn start_query(&mut self, target: QueryTarget) -> MeshResult<()> {
        self.clock += 1;
        let entry = AddressCacheEntry {
            target,
            state: CacheState::Query,
            node: None,
            attach: None,
            timeout: ADDRESS_QUERY_TIMEOUT,
            retry_timeout: 0,
            last_used: self.clock,
        };
        if let Some(slot) = self.entries.iter_mut().find(|e| e.target == target) {
            *slot = entry;
            return Ok(());
        }
        if self.entries.len() < ADDRESS_CACHE_SIZE {
            self.entries.push(entry);
            return Ok(());
        }
        let victim = self
            .entries
            .iter_mut()
            .filter(|e| e.state != CacheState::Query)
            .min_by_key(|e| (e.state != CacheState::Invalid, e.last_used))
            .ok_or(MeshError::Drop)?;
        *victim = entry;
        Ok(())
    }

    /// Record a query answer; returns false if nobody was asking
    pub fn resolve(&mut self, target: &QueryTarget, node: NodeId, attach: Option<NodeId>) -> bool {
        match self.find_mut(target) {
            Some(entry) if entry.state == CacheState::Query => {
                entry.state = CacheState::Cached;
                entry.node = Some(node);
                entry.attach = attach;
                entry.timeout = 0;
                entry.retry_timeout = 0;
                true
            }
            _ => false,
        }
    }

    /// Forget cached entries reaching `sid` directly or through it
    pub fn invalidate(&mut self, netid: u16, sid: u16) -> usize {
        let mut count = 0;
        for entry in self.entries.iter_mut().filter(|e| e.state == CacheState::Cached) {
            let by_node = entry.node.is_some_and(|n| n.sid == sid && n.meshnetid == netid);
            let by_attach = entry.attach.is_some_and(|n| n.sid == sid && n.meshnetid == netid);
            if by_node || by_attach {
                entry.state = CacheState::Invalid;
                count += 1;
            }
        }
        count
    }

    /// One `ADDRESS_QUERY_STATE_UPDATE_PERIOD` tick
    pub fn tick(&mut self) -> Vec<QueryExpiry> {
        let mut out = Vec::new();
        for entry in self.entries.iter_mut().filter(|e| e.state == CacheState::Query) {
            if entry.timeout > 0 {
                entry.timeout -= 1;
                if entry.timeout == 0 {
                    entry.retry_timeout = ADDRESS_QUERY_RETRY_TIMEOUT;
                    out.push(QueryExpiry::DropPending(entry.target));
                }
            } else if entry.retry_timeout > 0 {
                entry.retry_timeout -= 1;
                if entry.retry_timeout == 0 {
                    entry.state = CacheState::Invalid;
                }
            }
        }
        out
    }

    /// Whether any query still needs the tick timer
    pub fn has_queries(&self) -> bool {
        self.entries.iter().any(|e| e.state == CacheState::Query)
    }

    /// Slots waiting for a query answer
    pub fn querying(&self) -> usize {
        self.entries.iter().filter(|e| e.state == CacheState::Query).count()
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| e.state != CacheState::Invalid)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn entries(&self) -> &[AddressCacheEntry] {
        &self.entries
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

/// A node known to the leader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SidCacheNode {
    pub uuid: ExtAddr,
    pub node: NodeId,
    pub attach: NodeId,
    pub hal_type: u8,
    /// Cache checks left before the entry expires
    pub ticks_left: u8,
}

/// Leader-side directory of every attached node
#[derive(Debug, Default)]
pub struct SidCache {
    nodes: Vec<SidCacheNode>,
}

impl SidCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a node; returns true for a new uuid
    pub fn update(&mut self, node: SidCacheNode) -> bool {
        // A SID moves with the node that now claims it
        self.nodes.retain(|n| {
            n.uuid == node.uuid || !(n.node.sid == node.node.sid && n.node.meshnetid == node.node.meshnetid)
        });
        match self.nodes.iter_mut().find(|n| n.uuid == node.uuid) {
            Some(existing) => {
                *existing = node;
                false
            }
            None => {
                self.nodes.push(node);
                true
            }
        }
    }

    pub fn get_by_uuid(&self, uuid: &ExtAddr) -> Option<&SidCacheNode> {
        self.nodes.iter().find(|n| n.uuid == *uuid)
    }

    pub fn get_by_sid(&self, netid: u16, sid: u16) -> Option<&SidCacheNode> {
        self.nodes
            .iter()
            .find(|n| n.node.sid == sid && n.node.meshnetid == netid)
    }

    /// Age every entry by one check, returning the expired ones
    pub fn age(&mut self) -> Vec<SidCacheNode> {
        let mut expired = Vec::new();
        self.nodes.retain_mut(|n| {
            n.ticks_left = n.ticks_left.saturating_sub(1);
            if n.ticks_left == 0 {
                expired.push(*n);
                false
            } else {
                true
            }
        });
        expired
    }

    pub fn remove(&mut self, uuid: &ExtAddr) -> Option<SidCacheNode> {
        let idx = self.nodes.iter().position(|n| n.uuid == *uuid)?;
        Some(self.nodes.remove(idx))
    }

    pub fn iter(&self) -> impl Iterator<Item = &SidCacheNode> {
        self.nodes.iter()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn clear(&mut self) {
        self.nodes.clear();
    }
}

impl MeshNode {
    fn is_directory(&self) -> bool {
        matches!(self.state, DeviceState::Leader | DeviceState::SuperRouter)
    }

    fn mac_is_neighbor(&self, mac: &ExtAddr) -> bool {
        self.hals.iter().any(|h| h.neighbors.get(mac).is_some())
    }

    fn sid_is_neighbor(&self, netid: u16, sid: u16) -> bool {
        self.hals
            .iter()
            .any(|h| h.neighbors.get_by_sid(netid, sid).is_some())
    }

    /// Make a message's destination routable
    ///
    /// Returns `AddressQuery` when the message must wait for a query and
    /// `Drop` while a failed query backs off.
    pub(crate) fn address_resolve(&mut self, message: &mut Message) -> MeshResult<()> {
        let dest = message.info.dest;
        let target = match dest.addr {
            Addr::None | Addr::Bcast => return Ok(()),
            Addr::Short(BCAST_SID) => return Ok(()),
            Addr::Ext(mac) => {
                if self.mac_is_neighbor(&mac) {
                    return Ok(());
                }
                QueryTarget::Uuid(mac)
            }
            Addr::Short(sid) => {
                if !is_partial_function_sid(sid) || self.sid_is_neighbor(dest.netid, sid) || sid == self.attach.sid {
                    return Ok(());
                }
                QueryTarget::Sid {
                    sid,
                    netid: dest.netid,
                }
            }
        };

        match self.resolver.lookup(&target) {
            Lookup::Resolved { node, attach } => {
                let resolved = MeshAddr::short(node.meshnetid, node.sid);
                match attach {
                    Some(att) if is_partial_function_sid(node.sid) && !self.sid_is_neighbor(node.meshnetid, node.sid) => {
                        message.info.dest = MeshAddr::short(att.meshnetid, att.sid);
                        message.info.dest2 = resolved;
                    }
                    _ => message.info.dest = resolved,
                }
                Ok(())
            }
            Lookup::Pending => Err(MeshError::AddressQuery),
            Lookup::Backoff => Err(MeshError::Drop),
            Lookup::Miss => {
                self.resolver.start_query(target)?;
                self.send_address_query(target)?;
                if !self.event_loop.is_timer_active(TimerKind::AddressQuery) {
                    self.event_loop
                        .start_timer(TimerKind::AddressQuery, ADDRESS_QUERY_STATE_UPDATE_PERIOD_MS);
                }
                Err(MeshError::AddressQuery)
            }
        }
    }

    fn send_address_query(&mut self, target: QueryTarget) -> MeshResult<()> {
        let netid = self.main_netid();
        let leader = get_leader_sid(netid);
        let mut tlvs = vec![Tlv::AddrQuery(target.query_type())];
        match target {
            QueryTarget::Uuid(uuid) => tlvs.push(Tlv::TargetUuid(uuid)),
            QueryTarget::Sid { sid, netid } => tlvs.push(Tlv::NodeId(NodeId::new(sid, Mode::NONE, netid))),
        }
        debug!(?target, leader = format_args!("{:04x}", leader), "send address query");
        self.send_command(0, command::ADDRESS_QUERY, MeshAddr::short(netid, leader), &tlvs)
    }

    /// Answer a query from the SID cache
    pub(crate) fn handle_address_query(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        if !self.is_directory() {
            return Err(MeshError::Drop);
        }
        let query = tlvs.addr_query().ok_or(MeshError::Drop)?;
        let src_sid = info.src.sid().ok_or(MeshError::Drop)?;
        let netid = self.main_netid();

        let mut reply = vec![Tlv::AddrQuery(query)];
        match query {
            TARGET_QUERY => {
                let uuid = tlvs.target_uuid().ok_or(MeshError::Drop)?;
                reply.push(Tlv::TargetUuid(uuid));
                if uuid == self.uuid {
                    reply.push(Tlv::NodeId(NodeId::new(self.attach.sid, self.mode, netid)));
                } else {
                    let entry = self.sid_cache.get_by_uuid(&uuid).copied().ok_or(MeshError::Drop)?;
                    reply.push(Tlv::NodeId(entry.node));
                    if is_partial_function_sid(entry.node.sid) {
                        reply.push(Tlv::AttachNodeId(entry.attach));
                    }
                }
            }
            ATTACH_QUERY => {
                let target = tlvs.node_id().ok_or(MeshError::Drop)?;
                let entry = self
                    .sid_cache
                    .get_by_sid(target.meshnetid, target.sid)
                    .copied()
                    .ok_or(MeshError::Drop)?;
                reply.push(Tlv::NodeId(entry.node));
                reply.push(Tlv::AttachNodeId(entry.attach));
            }
            _ => return Err(MeshError::Drop),
        }
        let dest = MeshAddr::short(info.src.netid, src_sid);
        self.send_command(info.hal, command::ADDRESS_QUERY_RESPONSE, dest, &reply)
    }

    pub(crate) fn handle_address_query_response(&mut self, _info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        let query = tlvs.addr_query().ok_or(MeshError::Drop)?;
        let node = tlvs.node_id().ok_or(MeshError::Drop)?;
        let attach = tlvs.attach_node_id();
        let target = match query {
            TARGET_QUERY => QueryTarget::Uuid(tlvs.target_uuid().ok_or(MeshError::Drop)?),
            ATTACH_QUERY => QueryTarget::Sid {
                sid: node.sid,
                netid: node.meshnetid,
            },
            _ => return Err(MeshError::Drop),
        };
        if !self.resolver.resolve(&target, node, attach) {
            return Err(MeshError::Drop);
        }
        debug!(?target, sid = format_args!("{:04x}", node.sid), "address resolved");
        self.flush_pending(&target, true);
        Ok(())
    }

    /// Resubmit (or drop) every message parked for `target`
    fn flush_pending(&mut self, target: &QueryTarget, resend: bool) {
        let mut parked = Vec::new();
        for hal in self.hals.iter_mut() {
            parked.extend(hal.pending_queue.take_matching(|m| target.matches(&m.info.dest)));
        }
        if !resend {
            if !parked.is_empty() {
                warn!(?target, count = parked.len(), reason = "address query timeout", "pending messages dropped");
            }
            return;
        }
        for message in parked {
            if let Err(err) = self.send_message(message) {
                debug!(?err, "resubmitted message not sent");
            }
        }
    }

    pub(crate) fn handle_address_query_timer(&mut self) {
        for expiry in self.resolver.tick() {
            match expiry {
                QueryExpiry::DropPending(target) => self.flush_pending(&target, false),
            }
        }
        if self.resolver.has_queries() {
            self.event_loop
                .start_timer(TimerKind::AddressQuery, ADDRESS_QUERY_STATE_UPDATE_PERIOD_MS);
        }
    }

    /// Tell the leader where we are attached
    pub(crate) fn send_address_notification(&mut self) -> MeshResult<()> {
        if self.state == DeviceState::Leader || self.state < DeviceState::Leaf {
            return Err(MeshError::Fail);
        }
        let netid = self.main_netid();
        let attach = match self.attach_node() {
            Some((hal, mac)) => {
                let nbr = self.hals[hal].neighbors.get(&mac).ok_or(MeshError::Fail)?;
                NodeId::new(nbr.sid, nbr.mode, nbr.netid)
            }
            None => return Err(MeshError::Fail),
        };
        let tlvs = vec![
            Tlv::SrcUuid(self.uuid),
            Tlv::NodeId(NodeId::new(self.attach.sid, self.mode, netid)),
            Tlv::HalType(self.hals[0].media.to_u8()),
            Tlv::AttachNodeId(attach),
        ];
        self.send_command(0, command::ADDRESS_NOTIFICATION, MeshAddr::short(netid, get_leader_sid(netid)), &tlvs)
    }

    pub(crate) fn handle_notification_timer(&mut self) {
        if self.mode.is_rx_on() || self.mode.is_mobile() {
            let _ = self.send_address_notification();
        }
        let interval = self.hals[0].timings.notification_interval_ms;
        self.event_loop.start_timer(TimerKind::Notification, interval);
    }

    pub(crate) fn handle_address_notification(&mut self, _info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        if !self.is_directory() {
            return Err(MeshError::Drop);
        }
        let uuid = tlvs.src_uuid().ok_or(MeshError::Drop)?;
        let node = tlvs.node_id().ok_or(MeshError::Drop)?;
        let attach = tlvs.attach_node_id().ok_or(MeshError::Drop)?;
        let hal_type = tlvs.hal_type().unwrap_or(0);
        let alive_ticks = self.hals[0].timings.addr_cache_alive_ticks;
        let added = self.sid_cache.update(SidCacheNode {
            uuid,
            node,
            attach,
            hal_type,
            ticks_left: alive_ticks.max(1),
        });
        if added {
            info!(%uuid, sid = format_args!("{:04x}", node.sid), "node joined directory");
            self.update_network_size();
        }
        Ok(())
    }

    fn update_network_size(&mut self) {
        let size = (self.sid_cache.len() + 1).min(u16::MAX as usize) as u16;
        let _ = self.set_meshnetsize(size);
    }

    pub(crate) fn handle_addr_cache_check_timer(&mut self) {
        self.event_loop
            .start_timer(TimerKind::AddrCacheCheck, ADDR_CACHE_CHECK_INTERVAL_MS);
        if !self.is_directory() {
            return;
        }
        let expired = self.sid_cache.age();
        if expired.is_empty() {
            return;
        }
        for node in &expired {
            debug!(uuid = %node.uuid, "directory entry expired");
            for net in self.networks.iter_mut() {
                net.allocator.release_uuid(&node.uuid);
            }
        }
        self.update_network_size();
    }

    /// Report an unreachable destination back to the source of a message
    pub(crate) fn send_address_unreachable(&mut self, hal: usize, src: MeshAddr, dest: MeshAddr) -> MeshResult<()> {
        let src_sid = src.sid().ok_or(MeshError::Fail)?;
        let dest_sid = dest.sid().unwrap_or(BCAST_SID);
        let tlvs = vec![Tlv::NodeId(NodeId::new(dest_sid, Mode::NONE, dest.netid))];
        self.send_command(hal, command::ADDRESS_UNREACHABLE, MeshAddr::short(src.netid, src_sid), &tlvs)
    }

    pub(crate) fn handle_address_unreachable(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        let target = tlvs.node_id().ok_or(MeshError::Drop)?;
        let mut count = self.resolver.invalidate(target.meshnetid, target.sid);
        if let Some(reporter) = info.src.sid() {
            count += self.resolver.invalidate(info.src.netid, reporter);
        }
        debug!(sid = format_args!("{:04x}", target.sid), count, "unreachable address invalidated");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uuid(b: u8) -> QueryTarget {
        QueryTarget::Uuid(ExtAddr([b; 8]))
    }

    #[test]
    fn test_query_lifecycle() {
        let mut cache = AddressResolver::new();
        assert_eq!(cache.lookup(&uuid(1)), Lookup::Miss);
        cache.start_query(uuid(1)).unwrap();
        assert_eq!(cache.lookup(&uuid(1)), Lookup::Pending);
        assert_eq!(cache.querying(), 1);
        let node = NodeId::new(0x1200, Mode::RX_ON, 0x4400);
        assert!(cache.resolve(&uuid(1), node, None));
        assert_eq!(cache.querying(), 0);
        assert_eq!(cache.lookup(&uuid(1)), Lookup::Resolved { node, attach: None });
        assert!(!cache.resolve(&uuid(2), node, None));
    }

    #[test]
    fn test_query_timeout_backs_off_then_requeries() {
        let mut cache = AddressResolver::new();
        cache.start_query(uuid(1)).unwrap();
        for _ in 0..ADDRESS_QUERY_TIMEOUT - 1 {
            assert!(cache.tick().is_empty());
        }
        assert_eq!(cache.tick(), vec![QueryExpiry::DropPending(uuid(1))]);
        assert_eq!(cache.lookup(&uuid(1)), Lookup::Backoff);
        for _ in 0..ADDRESS_QUERY_RETRY_TIMEOUT {
            cache.tick();
        }
        assert_eq!(cache.lookup(&uuid(1)), Lookup::Miss);
        assert!(!cache.has_queries());
    }

    #[test]
    fn test_cache_bounded() {
        let mut cache = AddressResolver::new();
        for b in 0..ADDRESS_CACHE_SIZE as u8 {
            cache.start_query(uuid(b)).unwrap();
        }
        assert_eq!(cache.start_query(uuid(100)), Err(MeshError::Drop));
        let node = NodeId::new(0x1000, Mode::RX_ON, 0x4400);
        cache.resolve(&uuid(3), node, None);
        cache.start_query(uuid(100)).unwrap();
        assert_eq!(cache.entries().len(), ADDRESS_CACHE_SIZE);
        assert_eq!(cache.lookup(&uuid(3)), Lookup::Miss);
    }

    #[test]
    fn test_invalidate_by_attach() {
        let mut cache = AddressResolver::new();
        let target = QueryTarget::Sid { sid: 0xc001, netid: 0x4400 };
        cache.start_query(target).unwrap();
        cache.resolve(
            &target,
            NodeId::new(0xc001, Mode::MOBILE, 0x4400),
            Some(NodeId::new(0x1000, Mode::RX_ON, 0x4400)),
        );
        assert_eq!(cache.invalidate(0x4400, 0x1000), 1);
        assert_eq!(cache.lookup(&target), Lookup::Miss);
    }

    #[test]
    fn test_target_matches_destination() {
        assert!(uuid(1).matches(&MeshAddr::ext(0x4400, ExtAddr([1; 8]))));
        let sid = QueryTarget::Sid { sid: 0xc002, netid: 0x4400 };
        assert!(sid.matches(&MeshAddr::short(0x4400, 0xc002)));
        assert!(!sid.matches(&MeshAddr::short(0x4500, 0xc002)));
    }

    #[test]
    fn test_sid_cache_aging_and_sid_takeover() {
        let mut cache = SidCache::new();
        let node = |b: u8, sid: u16| SidCacheNode {
            uuid: ExtAddr([b; 8]),
            node: NodeId::new(sid, Mode::RX_ON, 0x4400),
            attach: NodeId::new(0, Mode::RX_ON, 0x4400),
            hal_type: 1,
            ticks_left: 2,
        };
        assert!(cache.update(node(1, 0x1000)));
        assert!(!cache.update(node(1, 0x1000)));
        assert!(cache.update(node(2, 0x1000)));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get_by_sid(0x4400, 0x1000).unwrap().uuid, ExtAddr([2; 8]));
        assert!(cache.age().is_empty());
        assert_eq!(cache.age().len(), 1);
        assert!(cache.is_empty());
    }
}
