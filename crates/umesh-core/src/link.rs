//! Link management: neighbor table, link cost estimation and the link
//! handshake
//!
//! ## Link cost
//!
//! Every neighbor carries a smoothed link cost derived from how many link
//! requests we sent and how many accepts came back:
//!
//! ```text
//! new  = COEF * requests / accepts        (COST_MAX when accepts == 0)
//! cost = ((COEF - ALPHA) * old + ALPHA * new) / COEF
//! ```
//!
//! A stalled estimate with zero accepts is bumped by `COEF` so dead links
//! always drift past `LINK_COST_THRESHOLD` and get evicted.
//!
//! ## Handshake
//!
//! ```text
//! child                         parent
//!   |--- LINK_REQUEST ------------>|
//!   |<-- LINK_ACCEPT_AND_REQUEST --|
//!   |--- LINK_ACCEPT ------------->|
//! ```

use crate::command;
use crate::error::{MeshError, MeshResult};
use crate::keys::Key;
use crate::message::{MessageInfo, MessageQueue};
use crate::node::MeshNode;
use crate::tlv::{NetworkInfo, SsidInfo, TimeSlot, Tlv, Tlvs, TYPE_BUFQUEUE_SIZE, TYPE_CHANNEL, TYPE_TIMESTAMP, TYPE_TIME_SLOT};
use crate::types::{is_partial_function_sid, is_unique_netid, is_unique_sid, ExtAddr, MeshAddr, Mode, BCAST_NETID, BCAST_SID, INFINITY_PATH_COST};
use serde::Serialize;
use tracing::{debug, info};

/// Neighbor table capacity per HAL
pub const MAX_NEIGHBORS_NUM: usize = 32;
/// Fixed-point one
pub const LINK_ESTIMATE_COEF: u16 = 256;
/// Weight of a fresh sample
pub const LINK_ESTIMATE_UPDATE_ALPHA: u16 = 32;
/// Cost of a link that never answers
pub const LINK_COST_MAX: u16 = 1024;
/// Links at or above this cost are evicted
pub const LINK_COST_THRESHOLD: u16 = 896;
/// Requests needed before an estimate is computed
pub const LINK_ESTIMATE_SENT_THRESHOLD: u16 = 4;
/// Estimate not computed yet
pub const LINK_COST_UNSET: u16 = 0xffff;
/// Whitelist capacity
pub const WHITELIST_MAX: usize = 32;

/// Relationship with a neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum NeighborState {
    Invalid,
    Candidate,
    Neighbor,
    Parent,
    Child,
}

/// Neighbor bookkeeping flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NeighborFlags(u8);

impl NeighborFlags {
    const LINK_ESTIMATED_BIT: u8 = 0; // Reverse RSSI known good
    const SID_CHANGED_BIT: u8 = 1;
    const NETID_CHANGED_BIT: u8 = 2;
    const REBOOT_BIT: u8 = 3; // Neighbor announced a reboot
    const WAKEUP_BIT: u8 = 4; // Sleepy neighbor is listening
    const DISCOVERED_BIT: u8 = 5; // Answered our discovery request
    const AUTHENTICATED_BIT: u8 = 6; // Passed the auth relay

    fn get(&self, bit: u8) -> bool {
        self.0 & (1 << bit) != 0
    }

    fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= 1 << bit;
        } else {
            self.0 &= !(1 << bit);
        }
    }

    pub fn link_estimated(&self) -> bool {
        self.get(Self::LINK_ESTIMATED_BIT)
    }

    pub fn set_link_estimated(&mut self, value: bool) {
        self.set(Self::LINK_ESTIMATED_BIT, value)
    }

    pub fn sid_changed(&self) -> bool {
        self.get(Self::SID_CHANGED_BIT)
    }

    pub fn set_sid_changed(&mut self, value: bool) {
        self.set(Self::SID_CHANGED_BIT, value)
    }

    pub fn netid_changed(&self) -> bool {
        self.get(Self::NETID_CHANGED_BIT)
    }

    pub fn set_netid_changed(&mut self, value: bool) {
        self.set(Self::NETID_CHANGED_BIT, value)
    }

    pub fn reboot(&self) -> bool {
        self.get(Self::REBOOT_BIT)
    }

    pub fn set_reboot(&mut self, value: bool) {
        self.set(Self::REBOOT_BIT, value)
    }

    pub fn wakeup(&self) -> bool {
        self.get(Self::WAKEUP_BIT)
    }

    pub fn set_wakeup(&mut self, value: bool) {
        self.set(Self::WAKEUP_BIT, value)
    }

    pub fn discovered(&self) -> bool {
        self.get(Self::DISCOVERED_BIT)
    }

    pub fn set_discovered(&mut self, value: bool) {
        self.set(Self::DISCOVERED_BIT, value)
    }

    pub fn authenticated(&self) -> bool {
        self.get(Self::AUTHENTICATED_BIT)
    }

    pub fn set_authenticated(&mut self, value: bool) {
        self.set(Self::AUTHENTICATED_BIT, value)
    }
}

/// Link statistics of one neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkEstimate {
    pub link_cost: u16,
    pub link_request: u16,
    pub link_accept: u16,
    /// RSSI the neighbor reported for our frames
    pub forward_rssi: i8,
    /// RSSI we measured on the neighbor's frames
    pub reverse_rssi: i8,
}

impl Default for LinkEstimate {
    fn default() -> Self {
        Self {
            link_cost: LINK_ESTIMATE_COEF,
            link_request: 0,
            link_accept: 0,
            forward_rssi: i8::MIN,
            reverse_rssi: i8::MIN,
        }
    }
}

impl LinkEstimate {
    /// Estimate with no cost computed yet
    pub fn unset() -> Self {
        Self {
            link_cost: LINK_COST_UNSET,
            ..Self::default()
        }
    }

    /// Fold the request/accept counters into the smoothed cost
    ///
    /// Fails until `LINK_ESTIMATE_SENT_THRESHOLD` requests were counted.
    pub fn update_link_cost(&mut self) -> MeshResult<()> {
        if self.link_request < LINK_ESTIMATE_SENT_THRESHOLD {
            return Err(MeshError::Fail);
        }

        let new = if self.link_accept > 0 {
            (LINK_ESTIMATE_COEF as u32 * self.link_request as u32) / self.link_accept as u32
        } else {
            LINK_COST_MAX as u32
        };

        if self.link_cost == LINK_COST_UNSET {
            self.link_cost = new.min(LINK_COST_MAX as u32) as u16;
        } else {
            let old = self.link_cost as u32;
            let coef = LINK_ESTIMATE_COEF as u32;
            let alpha = LINK_ESTIMATE_UPDATE_ALPHA as u32;
            let mut cost = ((coef - alpha) * old + alpha * new) / coef;
            if cost == old && self.link_accept == 0 {
                cost += coef;
            }
            self.link_cost = cost.min(LINK_COST_MAX as u32) as u16;
        }
        self.link_request = 0;
        self.link_accept = 0;
        Ok(())
    }
}

/// A directly reachable node
#[derive(Debug)]
pub struct Neighbor {
    pub mac: ExtAddr,
    pub sid: u16,
    pub netid: u16,
    pub state: NeighborState,
    pub mode: Mode,
    pub flags: NeighborFlags,
    pub stats: LinkEstimate,
    /// Path cost the neighbor advertised to its leader
    pub path_cost: u16,
    pub channel: u8,
    pub network_info: Option<NetworkInfo>,
    pub ssid_info: SsidInfo,
    /// Key shared during this neighbor's attach handshake
    pub one_time_key: Option<Key>,
    /// Advertisement ticks before the neighbor may be an attach candidate again
    pub attach_candidate_timeout: u8,
    pub last_heard: u64,
    /// Low-power wake-up slot of the neighbor
    pub time_slot: Option<TimeSlot>,
    /// Frames held for a sleeping neighbor
    pub buffer_queue: MessageQueue,
}

impl Neighbor {
    pub fn new(mac: ExtAddr, now: u64) -> Self {
        Self {
            mac,
            sid: BCAST_SID,
            netid: BCAST_NETID,
            state: NeighborState::Invalid,
            mode: Mode::NONE,
            flags: NeighborFlags::default(),
            stats: LinkEstimate::default(),
            path_cost: INFINITY_PATH_COST,
            channel: 0,
            network_info: None,
            ssid_info: SsidInfo::default(),
            one_time_key: None,
            attach_candidate_timeout: 0,
            last_heard: now,
            time_slot: None,
            buffer_queue: MessageQueue::new(),
        }
    }

    /// Whether the neighbor currently counts as alive
    pub fn is_valid(&self) -> bool {
        self.state > NeighborState::Invalid
    }

    /// Mesh address to reach this neighbor
    pub fn short_addr(&self) -> MeshAddr {
        MeshAddr::short(self.netid, self.sid)
    }
}

/// Per-HAL neighbor list
#[derive(Debug)]
pub struct NeighborTable {
    neighbors: Vec<Neighbor>,
    max_entries: usize,
}

impl Default for NeighborTable {
    fn default() -> Self {
        Self::new(MAX_NEIGHBORS_NUM)
    }
}

impl NeighborTable {
    pub fn new(max_entries: usize) -> Self {
        Self {
            neighbors: Vec::with_capacity(max_entries),
            max_entries,
        }
    }

    pub fn get(&self, mac: &ExtAddr) -> Option<&Neighbor> {
        self.neighbors.iter().find(|n| n.mac == *mac && n.is_valid())
    }

    pub fn get_mut(&mut self, mac: &ExtAddr) -> Option<&mut Neighbor> {
        self.neighbors
            .iter_mut()
            .find(|n| n.mac == *mac && n.is_valid())
    }

    /// Entry for `mac` including one being invalidated
    pub fn get_any(&self, mac: &ExtAddr) -> Option<&Neighbor> {
        self.neighbors.iter().find(|n| n.mac == *mac)
    }

    /// Live neighbor owning `(netid, sid)`
    pub fn get_by_sid(&self, netid: u16, sid: u16) -> Option<&Neighbor> {
        if netid == BCAST_NETID || sid == BCAST_SID {
            return None;
        }
        self.neighbors
            .iter()
            .find(|n| n.sid == sid && n.netid == netid && n.is_valid())
    }

    /// Find or create the entry for `mac`
    ///
    /// A full table only makes room for an attaching node, and never at
    /// the expense of our parent or children.
    pub fn get_or_insert(&mut self, mac: ExtAddr, now: u64, is_attach: bool) -> Option<&mut Neighbor> {
        if let Some(idx) = self.neighbors.iter().position(|n| n.mac == mac) {
            return self.neighbors.get_mut(idx);
        }
        if self.neighbors.len() >= self.max_entries {
            if !is_attach {
                return None;
            }
            self.evict_oldest()?;
        }
        self.neighbors.push(Neighbor::new(mac, now));
        self.neighbors.last_mut()
    }

    /// Assign the mesh identity of a neighbor
    ///
    /// Any other live neighbor claiming the same unique `(sid, netid)` is
    /// invalidated so the pair identifies one node only.
    pub fn set_identity(&mut self, mac: &ExtAddr, netid: u16, sid: u16) {
        if is_unique_sid(sid) && is_unique_netid(netid) {
            for other in self.neighbors.iter_mut() {
                if other.mac != *mac && other.sid == sid && other.netid == netid && other.is_valid() {
                    debug!(mac = %other.mac, sid, netid, "stale neighbor identity reset");
                    other.state = NeighborState::Invalid;
                    other.sid = BCAST_SID;
                    other.netid = BCAST_NETID;
                }
            }
        }
        if let Some(nbr) = self.neighbors.iter_mut().find(|n| n.mac == *mac) {
            if nbr.sid != sid {
                nbr.flags.set_sid_changed(true);
            }
            if nbr.netid != netid {
                nbr.flags.set_netid_changed(true);
            }
            nbr.sid = sid;
            nbr.netid = netid;
        }
    }

    pub fn remove(&mut self, mac: &ExtAddr) -> Option<Neighbor> {
        let idx = self.neighbors.iter().position(|n| n.mac == *mac)?;
        Some(self.neighbors.remove(idx))
    }

    /// Drop invalidated entries
    pub fn purge_invalid(&mut self) -> usize {
        let before = self.neighbors.len();
        self.neighbors.retain(|n| n.is_valid());
        before - self.neighbors.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Neighbor> {
        self.neighbors.iter().filter(|n| n.is_valid())
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Neighbor> {
        self.neighbors.iter_mut().filter(|n| n.is_valid())
    }

    /// Macs of every live neighbor
    pub fn macs(&self) -> Vec<ExtAddr> {
        self.iter().map(|n| n.mac).collect()
    }

    pub fn len(&self) -> usize {
        self.neighbors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbors.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn clear(&mut self) {
        self.neighbors.clear();
    }

    fn evict_oldest(&mut self) -> Option<()> {
        let idx = self
            .neighbors
            .iter()
            .enumerate()
            .filter(|(_, n)| !matches!(n.state, NeighborState::Parent | NeighborState::Child))
            .min_by_key(|(_, n)| (n.is_valid(), n.last_heard))
            .map(|(i, _)| i)?;
        let evicted = self.neighbors.remove(idx);
        info!(mac = %evicted.mac, sid = evicted.sid, "neighbor replaced");
        Some(())
    }
}

/// Mac filter applied to every received frame
#[derive(Debug, Clone, Default)]
pub struct Whitelist {
    enabled: bool,
    entries: Vec<ExtAddr>,
}

impl Whitelist {
    pub fn new(enabled: bool, entries: &[ExtAddr]) -> Self {
        let mut list = Self {
            enabled,
            entries: Vec::new(),
        };
        for mac in entries {
            let _ = list.add(*mac);
        }
        list
    }

    pub fn enable(&mut self) {
        self.enabled = true;
    }

    pub fn disable(&mut self) {
        self.enabled = false;
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn add(&mut self, mac: ExtAddr) -> MeshResult<()> {
        if self.entries.contains(&mac) {
            return Ok(());
        }
        if self.entries.len() >= WHITELIST_MAX {
            return Err(MeshError::Mem);
        }
        self.entries.push(mac);
        Ok(())
    }

    pub fn remove(&mut self, mac: &ExtAddr) {
        self.entries.retain(|m| m != mac);
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn entries(&self) -> &[ExtAddr] {
        &self.entries
    }

    /// Whether frames from `mac` are accepted
    pub fn is_allowed(&self, mac: &ExtAddr) -> bool {
        !self.enabled || self.entries.contains(mac)
    }
}

impl MeshNode {
    /// Create or refresh the neighbor that sent `info`
    ///
    /// Returns the neighbor mac when the table accepted it.
    pub(crate) fn update_neighbor(&mut self, info: &MessageInfo, tlvs: &Tlvs, is_attach: bool) -> Option<ExtAddr> {
        let hal_idx = info.hal;
        let mac = info.src_mac?;
        let now = self.now();
        let network = self.network_for_hal(hal_idx);
        let hal_channel = self.hals.get(hal_idx)?.driver.channel();
        let rssi_threshold = self.hals.get(hal_idx)?.timings.rssi_threshold;

        let (src_netid, src_sid) = (info.src.netid, info.src.sid().unwrap_or(BCAST_SID));
        let structured_state = {
            let net = self.networks.get(network)?;
            if net.allocator.is_structured() && !is_partial_function_sid(src_sid) && src_netid == net.meshnetid {
                Some(match net.allocator.get_allocated_child(&mac) {
                    None => NeighborState::Neighbor,
                    Some(_) if net.allocator.is_direct_child(src_sid) => NeighborState::Child,
                    Some(_) => NeighborState::Neighbor,
                })
            } else {
                None
            }
        };

        let hal = self.hals.get_mut(hal_idx)?;
        if let (Some(existing), Some(mode)) = (hal.neighbors.get(&mac), info.mode) {
            if existing.mode != mode {
                debug!(%mac, "neighbor mode changed, recreating");
                hal.neighbors.remove(&mac);
            }
        }

        {
            let nbr = hal.neighbors.get_or_insert(mac, now, is_attach)?;
            if let Some(mode) = info.mode {
                nbr.mode = mode;
            }
            if nbr.state < NeighborState::Candidate {
                nbr.state = NeighborState::Neighbor;
                nbr.stats.link_cost = LINK_ESTIMATE_COEF;
            }
            if let Some(cost) = tlvs.path_cost() {
                nbr.path_cost = cost;
            }
            nbr.channel = tlvs.channel().unwrap_or(hal_channel);
            if let Some(ssid) = tlvs.ssid_info() {
                nbr.ssid_info = ssid;
            }
            if let Some(netinfo) = tlvs.network_info() {
                nbr.network_info = Some(netinfo);
            }
            if let Some(slot) = tlvs.time_slot() {
                nbr.time_slot = Some(slot);
            }
            match structured_state {
                Some(NeighborState::Child) if nbr.state != NeighborState::Parent => {
                    nbr.state = NeighborState::Child
                }
                Some(NeighborState::Neighbor) if nbr.state == NeighborState::Child => {
                    nbr.state = NeighborState::Neighbor
                }
                _ => {}
            }
            nbr.stats.reverse_rssi = info.rssi;
            if nbr.stats.reverse_rssi < rssi_threshold {
                nbr.flags.set_link_estimated(false);
            }
            if let Some(forward) = info.reverse_rssi {
                if forward != crate::tlv::REVERSE_RSSI_ACCEPT_REQUEST {
                    nbr.stats.forward_rssi = forward;
                }
            }
            nbr.last_heard = now;
        }
        hal.neighbors.set_identity(&mac, src_netid, src_sid);
        self.start_neighbor_timer(hal_idx);
        self.neighbor_updated(hal_idx, mac);
        Some(mac)
    }

    /// Refresh liveness of a known neighbor without touching its identity
    pub(crate) fn touch_neighbor(&mut self, hal: usize, mac: &ExtAddr, rssi: i8) {
        let now = self.now();
        if let Some(nbr) = self.hals.get_mut(hal).and_then(|h| h.neighbors.get_mut(mac)) {
            nbr.last_heard = now;
            nbr.stats.reverse_rssi = rssi;
        }
    }

    /// Invalidate and drop a neighbor, releasing anything allocated to it
    pub(crate) fn remove_neighbor(&mut self, hal: usize, mac: &ExtAddr) {
        let network = self.network_for_hal(hal);
        if let Some(net) = self.networks.get_mut(network) {
            if net.allocator.is_structured() {
                net.allocator.release_uuid(mac);
            }
        }
        if let Some(nbr) = self.hals.get_mut(hal).and_then(|h| h.neighbors.get_mut(mac)) {
            nbr.state = NeighborState::Invalid;
        }
        self.neighbor_updated(hal, *mac);
        if let Some(h) = self.hals.get_mut(hal) {
            h.neighbors.remove(mac);
        }
    }

    pub(crate) fn start_neighbor_timer(&mut self, hal: usize) {
        let kind = crate::timer::TimerKind::NeighborUpdate { hal };
        if !self.event_loop.is_timer_active(kind) {
            let interval = self.hals[hal].timings.advertisement_interval_ms;
            self.event_loop.start_timer(kind, interval);
        }
    }

    /// Attribute types asked for in a link request
    fn link_request_types(&self) -> Vec<u8> {
        if self.mode.is_rx_on() {
            vec![TYPE_CHANNEL, TYPE_TIMESTAMP]
        } else {
            vec![TYPE_CHANNEL, TYPE_TIMESTAMP, TYPE_TIME_SLOT, TYPE_BUFQUEUE_SIZE]
        }
    }

    /// Answer a TLV request list with our own values
    fn requested_tlvs(&self, hal: usize, requested: &[u8], peer: &ExtAddr) -> Vec<Tlv> {
        let mut out = Vec::new();
        for ty in requested {
            match *ty {
                TYPE_CHANNEL => out.push(Tlv::Channel(self.hals[hal].driver.channel())),
                TYPE_TIMESTAMP => out.push(Tlv::Timestamp(self.timestamp())),
                TYPE_TIME_SLOT => out.push(Tlv::TimeSlot(self.lowpower_time_slot())),
                TYPE_BUFQUEUE_SIZE => {
                    let queued = self.hals[hal]
                        .neighbors
                        .get(peer)
                        .map(|n| n.buffer_queue.len())
                        .unwrap_or(0);
                    out.push(Tlv::BufqueueSize(queued.min(u8::MAX as usize) as u8));
                }
                _ => {}
            }
        }
        out
    }

    /// Ask the attach node to confirm the link
    pub(crate) fn send_link_request(&mut self, force: bool) -> MeshResult<()> {
        let (hal, mac) = self.attach_node().ok_or(MeshError::Fail)?;
        let (dest, estimated) = {
            let nbr = self.hals[hal].neighbors.get(&mac).ok_or(MeshError::Fail)?;
            (nbr.short_addr(), nbr.flags.link_estimated())
        };
        if !force && estimated {
            return Ok(());
        }
        let tlvs = vec![Tlv::TlvRequest(self.link_request_types())];
        self.send_command(hal, command::LINK_REQUEST, dest, &tlvs)?;
        if let Some(nbr) = self.hals[hal].neighbors.get_mut(&mac) {
            nbr.stats.link_request += 1;
        }
        debug!(%mac, "send link request");
        Ok(())
    }

    pub(crate) fn handle_link_request(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        let mac = match self.update_neighbor(info, tlvs, true) {
            Some(mac) => mac,
            None => return Ok(()),
        };
        self.lowpower_child_awake(info.hal, &mac);
        let requested = tlvs.tlv_request().unwrap_or_default();
        let reply = self.requested_tlvs(info.hal, &requested, &mac);
        let mut out = reply;
        out.push(Tlv::TlvRequest(vec![TYPE_TIMESTAMP]));
        let netid = self.networks[self.network_for_hal(info.hal)].meshnetid;
        self.send_command(info.hal, command::LINK_ACCEPT_AND_REQUEST, MeshAddr::ext(netid, mac), &out)?;
        if let Some(nbr) = self.hals[info.hal].neighbors.get_mut(&mac) {
            nbr.stats.link_request += 1;
        }
        self.flush_buffered(info.hal, &mac);
        Ok(())
    }

    pub(crate) fn handle_link_accept_and_request(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        let mac = info.src_mac.ok_or(MeshError::Fail)?;
        match self.hals[info.hal].neighbors.get_mut(&mac) {
            Some(nbr) => nbr.stats.link_accept += 1,
            None => return Ok(()),
        }
        if let Some(channel) = tlvs.channel() {
            if self.hals[info.hal].driver.channel() != channel {
                self.set_channel(info.hal, channel)?;
            }
        }
        self.lowpower_update_from_tlvs(info.hal, &mac, tlvs);
        let requested = tlvs.tlv_request().unwrap_or_default();
        let reply = self.requested_tlvs(info.hal, &requested, &mac);
        let netid = self.networks[self.network_for_hal(info.hal)].meshnetid;
        self.send_command(info.hal, command::LINK_ACCEPT, MeshAddr::ext(netid, mac), &reply)
    }

    pub(crate) fn handle_link_accept(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        let mac = info.src_mac.ok_or(MeshError::Fail)?;
        match self.hals[info.hal].neighbors.get_mut(&mac) {
            Some(nbr) => {
                nbr.stats.link_accept += 1;
                nbr.flags.set_wakeup(true);
            }
            None => return Ok(()),
        }
        self.lowpower_update_from_tlvs(info.hal, &mac, tlvs);
        self.flush_buffered(info.hal, &mac);
        Ok(())
    }

    /// Recompute link costs and evict links past the threshold
    pub(crate) fn update_neighbors_link_cost(&mut self, hal: usize) {
        let now = self.now();
        let alive = self.hals[hal].timings.neighbor_alive_ms;
        let rssi_threshold = self.hals[hal].timings.rssi_threshold;
        let mut evict = Vec::new();
        for nbr in self.hals[hal].neighbors.iter_mut() {
            let updated = nbr.stats.update_link_cost();
            if updated.is_err()
                || nbr.stats.reverse_rssi < rssi_threshold
                || now.saturating_sub(nbr.last_heard) > alive / 2
            {
                nbr.flags.set_link_estimated(false);
            }
            if nbr.stats.link_cost >= LINK_COST_THRESHOLD {
                evict.push(nbr.mac);
            }
        }
        for mac in evict {
            info!(hal, %mac, "link cost over threshold, neighbor removed");
            self.remove_neighbor(hal, &mac);
        }
    }

    pub(crate) fn handle_link_quality_timer(&mut self, hal: usize) {
        let interval = if self.mode.is_mobile() {
            self.hals[hal].timings.link_quality_mobile_interval_ms
        } else {
            self.hals[hal].timings.link_quality_interval_ms
        };
        self.event_loop
            .start_timer(crate::timer::TimerKind::LinkQuality { hal }, interval);
        self.update_neighbors_link_cost(hal);
        let _ = self.send_link_request(false);
    }

    /// Age neighbors that went silent
    pub(crate) fn handle_neighbor_update_timer(&mut self, hal: usize) {
        self.start_neighbor_timer(hal);
        let now = self.now();
        let threshold = self.neighbor_alive_threshold(hal);
        let mut dead = Vec::new();
        for nbr in self.hals[hal].neighbors.iter_mut() {
            if nbr.state < NeighborState::Neighbor {
                continue;
            }
            nbr.attach_candidate_timeout = nbr.attach_candidate_timeout.saturating_sub(1);
            if now.saturating_sub(nbr.last_heard) >= threshold {
                dead.push(nbr.mac);
            }
        }
        for mac in dead {
            info!(hal, %mac, "neighbor became inactive");
            self.remove_neighbor(hal, &mac);
        }
        let now = self.now();
        self.hals[hal].reassembler.expire(now);
    }

    fn neighbor_alive_threshold(&self, hal: usize) -> u64 {
        if !self.mode.is_rx_on() {
            self.lowpower_alive_threshold()
        } else {
            self.hals[hal].timings.neighbor_alive_ms
        }
    }

    /// Release frames buffered for a neighbor that just woke up
    pub(crate) fn flush_buffered(&mut self, hal: usize, mac: &ExtAddr) {
        let buffered = match self.hals[hal].neighbors.get_mut(mac) {
            Some(nbr) => nbr.buffer_queue.take_matching(|_| true),
            None => return,
        };
        for message in buffered {
            let _ = self.send_message(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mac(b: u8) -> ExtAddr {
        ExtAddr([b, 0, 0, 0, 0, 0, 0, 1])
    }

    #[test]
    fn test_link_cost_all_lost() {
        let mut est = LinkEstimate::unset();
        est.link_request = 10;
        est.link_accept = 0;
        est.update_link_cost().unwrap();
        assert_eq!(est.link_cost, LINK_COST_MAX);
    }

    #[test]
    fn test_link_cost_converges_to_coef() {
        let mut est = LinkEstimate::unset();
        est.link_request = 10;
        est.link_accept = 10;
        est.update_link_cost().unwrap();
        assert_eq!(est.link_cost, LINK_ESTIMATE_COEF);

        let mut lossy = LinkEstimate::default();
        lossy.link_cost = LINK_COST_MAX;
        let mut prev = lossy.link_cost;
        for _ in 0..60 {
            lossy.link_request = 10;
            lossy.link_accept = 10;
            lossy.update_link_cost().unwrap();
            assert!(lossy.link_cost <= prev);
            prev = lossy.link_cost;
        }
        assert!(lossy.link_cost < LINK_ESTIMATE_COEF + 16);
    }

    #[test]
    fn test_link_cost_needs_enough_requests() {
        let mut est = LinkEstimate::default();
        est.link_request = LINK_ESTIMATE_SENT_THRESHOLD - 1;
        assert_eq!(est.update_link_cost(), Err(MeshError::Fail));
        assert_eq!(est.link_request, LINK_ESTIMATE_SENT_THRESHOLD - 1);
    }

    #[test]
    fn test_dead_link_crosses_threshold() {
        let mut est = LinkEstimate::default();
        let mut rounds = 0;
        while est.link_cost < LINK_COST_THRESHOLD {
            est.link_request = LINK_ESTIMATE_SENT_THRESHOLD;
            est.update_link_cost().unwrap();
            rounds += 1;
            assert!(rounds < 100);
        }
    }

    #[test]
    fn test_table_identity_is_unique() {
        let mut table = NeighborTable::new(4);
        for b in 1..=2 {
            let nbr = table.get_or_insert(mac(b), 0, false).unwrap();
            nbr.state = NeighborState::Neighbor;
        }
        table.set_identity(&mac(1), 0x1200, 0x1000);
        table.set_identity(&mac(2), 0x1200, 0x1000);
        let owners: Vec<_> = table
            .iter()
            .filter(|n| n.sid == 0x1000 && n.netid == 0x1200)
            .collect();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].mac, mac(2));
        assert_eq!(table.get_by_sid(0x1200, 0x1000).unwrap().mac, mac(2));
        assert!(table.get(&mac(1)).is_none());
    }

    #[test]
    fn test_table_capacity_and_eviction() {
        let mut table = NeighborTable::new(2);
        let parent = table.get_or_insert(mac(1), 0, false).unwrap();
        parent.state = NeighborState::Parent;
        let other = table.get_or_insert(mac(2), 5, false).unwrap();
        other.state = NeighborState::Neighbor;

        assert!(table.get_or_insert(mac(3), 10, false).is_none());
        assert!(table.get_or_insert(mac(3), 10, true).is_some());
        assert_eq!(table.len(), 2);
        assert!(table.get(&mac(1)).is_some());
    }

    #[test]
    fn test_identity_change_flags() {
        let mut table = NeighborTable::default();
        table.get_or_insert(mac(1), 0, false).unwrap().state = NeighborState::Neighbor;
        table.set_identity(&mac(1), 0x1200, 0x1000);
        let nbr = table.get_mut(&mac(1)).unwrap();
        assert!(nbr.flags.sid_changed() && nbr.flags.netid_changed());
        nbr.flags.set_sid_changed(false);
        nbr.flags.set_netid_changed(false);
        table.set_identity(&mac(1), 0x1200, 0x1000);
        assert!(!table.get(&mac(1)).unwrap().flags.sid_changed());
    }

    #[test]
    fn test_whitelist() {
        let mut list = Whitelist::new(false, &[mac(1)]);
        assert!(list.is_allowed(&mac(9)));
        list.enable();
        assert!(list.is_allowed(&mac(1)));
        assert!(!list.is_allowed(&mac(9)));
        list.remove(&mac(1));
        assert!(!list.is_allowed(&mac(1)));
        for b in 0..WHITELIST_MAX as u8 {
            list.add(mac(b)).unwrap();
        }
        assert_eq!(list.add(mac(200)), Err(MeshError::Mem));
    }
}
