//! Mesh management: advertisement, attach, SID allocation and migration
//!
//! ```text
//!             discovery / advertisement
//!                        │
//!   Detached ──attach_start──► Request ──ATTACH_RESPONSE──► Attached
//!      ▲                         │                            │
//!      │ retries exhausted       │ sid in response            │ no sid
//!      │                         ▼                            ▼
//!      └──────────────────── Done (Leaf/Router) ◄──── SidRequest
//!                                            SID_RESPONSE
//! ```
//!
//! A node that exhausts its attach attempts long enough, and is allowed
//! to, forms its own network and becomes leader. Attached nodes keep
//! listening to advertisements and migrate when another network (or a
//! cheaper parent in their own) has been preferable for a few rounds.

pub mod discovery;

use crate::command;
use crate::error::{MeshError, MeshResult};
use crate::keys::{derive_group_key, derive_one_time_key, Key, GROUP_KEY1_INDEX, ONE_TIME_KEY_INDEX};
use crate::link::NeighborState;
use crate::message::MessageInfo;
use crate::network_data::{is_leader_reboot, stable_meshnetid, MAX_MAIN_VERSION};
use crate::node::MeshNode;
use crate::sid_allocator::{SidAllocator, SidNode, SidRequest};
use crate::timer::TimerKind;
use crate::tlv::{Tlv, Tlvs};
use crate::types::{
    compare_mode, get_leader_sid, get_main_netid, is_same_mainnet, is_subnet, is_unique_netid, is_unique_sid,
    DeviceState, ExtAddr, InterfaceDownReason, MeshAddr, MediaType, NodeId, NodeType, BCAST_NETID, BCAST_SID,
    INFINITY_PATH_COST, INVALID_NETID, LEADER_SID,
};
use serde::Serialize;
use tracing::{debug, info, warn};

/// Attach requests sent before a candidate is given up
pub const ATTACH_REQUEST_RETRY_TIMES: u8 = 2;
/// Failed attach rounds before a detached node forms its own network
pub const BECOME_LEADER_TIMEOUT: u8 = 3;
/// Advertisement rounds a better network must win before migrating
pub const MIGRATE_TIMEOUT: u8 = 2;
/// Same, while detached
pub const DETACHED_MIGRATE_TIMEOUT: u8 = 1;
/// Advertisement intervals after which migration counting restarts
pub const MIGRATE_RESET_TIMEOUT: u64 = 3;
/// Path cost a parent in our own network must beat ours by
pub const PATH_COST_SWITCH_HYST: u16 = 384;
/// Weight of a subnet size in the network metric
pub const SIZE_WEIGHT: u32 = 20;
/// Path cost units per metric point
pub const PATH_COST_WEIGHT: u32 = 256;
/// Metric points a sibling subnet must win by
const SUBNET_SWITCH_HYST: u32 = 5;
/// Neighbor ticks a failed candidate is skipped
const ATTACH_CANDIDATE_TIMEOUT: u8 = 3;

/// Progress of the attach handshake
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AttachState {
    Idle,
    /// Attach request sent to the candidate
    Request,
    /// Attach accepted, waiting for a SID
    SidRequest,
    Done,
}

/// Attach bookkeeping of a node
#[derive(Debug, Clone)]
pub struct AttachContext {
    pub state: AttachState,
    /// Our short address, `BCAST_SID` while we have none
    pub sid: u16,
    /// Cost from us to the leader
    pub path_cost: u16,
    /// Node we are currently attaching to
    pub candidate: Option<(usize, ExtAddr)>,
    /// Our parent
    pub attach_node: Option<(usize, ExtAddr)>,
    /// Netid migration votes are counted for
    pub candidate_meshnetid: u16,
    pub prev_netid: u16,
    pub prev_path_cost: u16,
    /// Channel to return to when a migration fails
    pub prev_channel: Option<u8>,
    pub retry_times: u8,
    pub leader_times: u8,
    pub migrate_times: u8,
    pub leader_reboot: bool,
}

impl Default for AttachContext {
    fn default() -> Self {
        Self {
            state: AttachState::Idle,
            sid: BCAST_SID,
            path_cost: INFINITY_PATH_COST,
            candidate: None,
            attach_node: None,
            candidate_meshnetid: BCAST_NETID,
            prev_netid: INVALID_NETID,
            prev_path_cost: INFINITY_PATH_COST,
            prev_channel: None,
            retry_times: 0,
            leader_times: 0,
            migrate_times: 0,
            leader_reboot: false,
        }
    }
}

/// Network metric: subnet size against path cost, lower is better
pub fn compute_network_metric(size: u16, path_cost: u16) -> u32 {
    size as u32 / SIZE_WEIGHT + path_cost as u32 / PATH_COST_WEIGHT
}

impl MeshNode {
    fn is_structured(&self) -> bool {
        self.config.router == crate::config::RouterKind::Sid
    }

    fn link_cost(&self, hal: usize, mac: &ExtAddr) -> u16 {
        self.hals[hal]
            .neighbors
            .get(mac)
            .map(|n| n.stats.link_cost)
            .unwrap_or(INFINITY_PATH_COST)
    }

    fn start_advertisements(&mut self) {
        if self.mode.is_mobile() {
            return;
        }
        for network in 0..self.networks.len() {
            let jitter = self.random_jitter(self.hals[self.networks[network].hal].timings.discovery_interval_ms);
            self.event_loop
                .start_timer(TimerKind::Advertisement { network }, jitter);
        }
    }

    fn stop_advertisements(&mut self) {
        for network in 0..self.networks.len() {
            self.event_loop.stop_timer(TimerKind::Advertisement { network });
        }
    }

    /// Broadcast our network summary on `network`
    pub(crate) fn send_advertisement(&mut self, network: usize) -> MeshResult<()> {
        if !is_unique_sid(self.attach.sid) || self.mode.is_mobile() {
            return Err(MeshError::Fail);
        }
        let net = self.networks.get(network).ok_or(MeshError::Fail)?;
        let hal = net.hal;
        let mut tlvs = vec![Tlv::NetworkInfo(self.local_network_info(network))];
        if net.allocator.is_structured() {
            tlvs.push(Tlv::SsidInfo(net.allocator.ssid_info()));
        }
        tlvs.push(Tlv::PathCost(self.attach.path_cost));
        if self.hals[hal].media == MediaType::Wifi {
            tlvs.push(Tlv::Channel(self.hals[hal].driver.channel()));
        }
        self.send_command(hal, command::ADVERTISEMENT, MeshAddr::short(BCAST_NETID, BCAST_SID), &tlvs)
    }

    pub(crate) fn handle_advertisement_timer(&mut self, network: usize) {
        if let Err(err) = self.send_advertisement(network) {
            debug!(network, reason = %err, "advertisement not sent");
        }
        let Some(net) = self.networks.get(network) else {
            return;
        };
        let interval = self.hals[net.hal].timings.advertisement_interval_ms;
        self.event_loop
            .start_timer(TimerKind::Advertisement { network }, interval);
    }

    pub(crate) fn handle_advertisement(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        if self.state < DeviceState::Detached {
            return Err(MeshError::Drop);
        }
        let netinfo = tlvs.network_info().ok_or(MeshError::Drop)?;
        tlvs.path_cost().ok_or(MeshError::Drop)?;
        if info.src.netid == BCAST_NETID {
            return Err(MeshError::Drop);
        }
        let mac = self.update_neighbor(info, tlvs, false).ok_or(MeshError::Drop)?;
        let (hal, network) = (info.hal, info.network);

        if info.src.netid == self.networks[network].meshnetid {
            let net = &self.networks[network];
            let orphan = self.state >= DeviceState::Router
                && net.allocator.is_structured()
                && info.src.sid().is_some_and(|sid| net.allocator.is_direct_child(sid))
                && net.allocator.get_allocated_child(&mac).is_none();
            if orphan {
                debug!(%mac, "advertiser uses a sid we never allocated");
                let _ = self.send_address_error(hal, mac);
            }
            self.nd_follow_parent(network, &netinfo);
        }

        if network == 0 && self.migration_check(hal, mac, &netinfo) {
            self.attach_start(Some((hal, mac)))?;
        }
        Ok(())
    }

    /// Decide whether the advertiser is worth migrating to
    pub(crate) fn migration_check(&mut self, hal: usize, mac: ExtAddr, netinfo: &crate::tlv::NetworkInfo) -> bool {
        let Some(nbr) = self.hals[hal].neighbors.get(&mac) else {
            return false;
        };
        let (nbr_mode, nbr_netid, nbr_path_cost) = (nbr.mode, nbr.netid, nbr.path_cost);
        let nbr_reboot = nbr.flags.reboot() && !nbr.flags.sid_changed();
        if nbr_mode.is_mobile() || self.mode.contains(crate::types::Mode::LEADER) {
            return false;
        }
        if self.state > DeviceState::Detached && compare_mode(self.leader_mode, netinfo.leader_mode) < 0 {
            info!(leader_mode = %netinfo.leader_mode, "more capable leader heard");
            self.become_detached(InterfaceDownReason::LeaderMode);
        }
        if self.state == DeviceState::Detached {
            return self.update_migrate_times(hal, mac);
        }

        let local_netid = self.networks[0].meshnetid;
        let is_attach_node = self.attach.attach_node == Some((hal, mac));
        let link_cost = self.link_cost(hal, &mac);
        if nbr_netid == local_netid {
            let Some(parent) = self.attach.attach_node else {
                return false;
            };
            if self.state > DeviceState::Attached
                && self.state != DeviceState::Leader
                && is_leader_reboot(self.nd.stable.main_version, netinfo.main_version)
            {
                let _ = self.nd.stable.set_main_version(netinfo.main_version & MAX_MAIN_VERSION);
                self.attach.leader_reboot = true;
            }
            if is_attach_node && nbr_reboot {
                self.attach.leader_reboot = true;
                if let Some(nbr) = self.hals[hal].neighbors.get_mut(&mac) {
                    nbr.flags.set_reboot(false);
                }
            }
            if self.attach.leader_reboot {
                self.attach.leader_reboot = false;
                info!("leader rebooted, attaching again");
                self.become_detached(InterfaceDownReason::LeaderReboot);
                let _ = self.attach_start(Some(parent));
                return false;
            }
            if is_attach_node {
                self.attach.path_cost = nbr_path_cost.saturating_add(link_cost);
                return false;
            }
            if self.attach.path_cost <= nbr_path_cost.saturating_add(PATH_COST_SWITCH_HYST) {
                return false;
            }
        } else {
            if !is_unique_netid(nbr_netid)
                || (nbr_netid == self.attach.prev_netid && self.attach.prev_path_cost < nbr_path_cost)
            {
                return false;
            }
            if is_same_mainnet(nbr_netid, local_netid) {
                let current = compute_network_metric(self.networks[0].network_data.size, 0);
                let offered = compute_network_metric(netinfo.subnet_size, 0);
                if current < offered + SUBNET_SWITCH_HYST {
                    return false;
                }
            } else {
                let current = compute_network_metric(self.nd.global.size, 0);
                let offered = compute_network_metric(netinfo.size, 0);
                if is_subnet(nbr_netid) == is_subnet(local_netid)
                    && (offered < current || (offered == current && nbr_netid <= local_netid))
                {
                    return false;
                }
            }
        }
        self.update_migrate_times(hal, mac)
    }

    /// Count a vote for the neighbor's network, true once enough were seen
    fn update_migrate_times(&mut self, hal: usize, mac: ExtAddr) -> bool {
        let Some(nbr) = self.hals[hal].neighbors.get(&mac) else {
            return false;
        };
        let (netid, free_slots) = (nbr.netid, nbr.ssid_info.free_slots);
        if netid == BCAST_NETID {
            return false;
        }
        if !self.event_loop.is_timer_active(TimerKind::MigrateReset) {
            self.attach.migrate_times = 0;
            self.attach.candidate_meshnetid = netid;
            let interval = self.hals[hal].timings.advertisement_interval_ms * MIGRATE_RESET_TIMEOUT;
            self.event_loop.start_timer(TimerKind::MigrateReset, interval);
        } else if netid == self.attach.candidate_meshnetid {
            self.attach.migrate_times = self.attach.migrate_times.saturating_add(1);
        }

        let threshold = if self.state == DeviceState::Detached {
            DETACHED_MIGRATE_TIMEOUT
        } else {
            MIGRATE_TIMEOUT
        };
        if self.attach.migrate_times < threshold {
            return false;
        }
        if self.is_structured() && free_slots < 1 && self.state > DeviceState::Attached {
            return false;
        }
        self.event_loop.stop_timer(TimerKind::MigrateReset);
        true
    }

    pub(crate) fn handle_migrate_reset_timer(&mut self) {
        self.attach.prev_netid = BCAST_NETID;
        self.attach.candidate_meshnetid = BCAST_NETID;
    }

    /// Pick the neighbor to attach to, preferring `preferred`
    fn choose_attach_candidate(&self, preferred: Option<(usize, ExtAddr)>) -> Option<(usize, ExtAddr)> {
        let structured = self.is_structured();
        if let Some((hal, mac)) = preferred {
            if let Some(nbr) = self.hals.get(hal).and_then(|h| h.neighbors.get(&mac)) {
                if nbr.attach_candidate_timeout == 0 && (!structured || nbr.ssid_info.free_slots > 0) {
                    return Some((hal, mac));
                }
            }
        }

        let own_mainnet = stable_meshnetid(&self.uuid, self.mode);
        let mut best: Option<(u32, (usize, ExtAddr))> = None;
        for (hal, ctx) in self.hals.iter().enumerate() {
            for nbr in ctx.neighbors.iter() {
                if nbr.state != NeighborState::Neighbor
                    || nbr.mode.is_mobile()
                    || !is_unique_netid(nbr.netid)
                    || !is_unique_sid(nbr.sid)
                    || nbr.attach_candidate_timeout > 0
                    || nbr.stats.link_cost >= crate::link::LINK_COST_THRESHOLD
                    || (structured && nbr.ssid_info.free_slots < 1)
                    || compare_mode(self.mode, nbr.mode) < 0
                    || (self.state == DeviceState::Detached && get_main_netid(nbr.netid) == own_mainnet)
                {
                    continue;
                }
                let metric = compute_network_metric(0, nbr.path_cost);
                if best.map_or(true, |(m, _)| metric < m) {
                    best = Some((metric, (hal, nbr.mac)));
                }
            }
        }
        best.map(|(_, candidate)| candidate)
    }

    /// Start attaching, to `preferred` when it qualifies
    pub(crate) fn attach_start(&mut self, preferred: Option<(usize, ExtAddr)>) -> MeshResult<()> {
        if matches!(self.attach.state, AttachState::Request | AttachState::SidRequest) {
            return Err(MeshError::Busy);
        }
        let Some((hal, mac)) = self.choose_attach_candidate(preferred) else {
            if self.state < DeviceState::Leaf {
                self.become_detached(InterfaceDownReason::AttachFail);
            }
            return Err(MeshError::Fail);
        };
        if self.config.auth_enabled && !self.auth_is_authenticated() {
            return self.start_auth(hal, mac);
        }

        let (channel, netid) = {
            let nbr = self.hals[hal].neighbors.get(&mac).ok_or(MeshError::Fail)?;
            (nbr.channel, nbr.netid)
        };
        info!(%mac, netid = format_args!("{:04x}", netid), "attach start");
        self.attach.candidate = Some((hal, mac));
        self.attach.candidate_meshnetid = netid;
        self.attach.state = AttachState::Request;
        self.attach.retry_times = 1;
        let current = self.hals[hal].driver.channel();
        self.attach.prev_channel = Some(current);
        if channel != 0 && channel != current {
            self.set_channel(hal, channel)?;
        }
        self.stop_advertisements();
        self.stop_discover();
        self.send_attach_request()?;
        let interval = self.hals[hal].timings.attach_request_interval_ms;
        self.event_loop.start_timer(TimerKind::AttachRequest, interval);
        Ok(())
    }

    fn send_attach_request(&mut self) -> MeshResult<()> {
        let (hal, mac) = self.attach.candidate.ok_or(MeshError::Fail)?;
        let netid = self.hals[hal].neighbors.get(&mac).ok_or(MeshError::Fail)?.netid;
        let timestamp = self.timestamp();
        if self.config.sec_level > 0 {
            let key = derive_one_time_key(timestamp, &self.hals[hal].mac)?;
            self.keys.set_key(ONE_TIME_KEY_INDEX, key)?;
        }
        let tlvs = vec![Tlv::SrcUuid(self.uuid), Tlv::Timestamp(timestamp)];
        debug!(%mac, "send attach request");
        self.send_command(hal, command::ATTACH_REQUEST, MeshAddr::ext(netid, mac), &tlvs)
    }

    fn send_attach_response(&mut self, hal: usize, mac: ExtAddr, sid_node: Option<SidNode>) -> MeshResult<()> {
        let network = self.network_for_hal(hal);
        let child_rx_on = self.hals[hal]
            .neighbors
            .get(&mac)
            .ok_or(MeshError::Fail)?
            .mode
            .is_rx_on();
        let mut tlvs = vec![
            Tlv::SrcUuid(self.uuid),
            Tlv::PathCost(self.attach.path_cost),
            Tlv::Timestamp(self.timestamp()),
        ];
        if !child_rx_on {
            tlvs.push(Tlv::TimeSlot(self.lowpower_time_slot()));
        }
        if self.config.sec_level > 0 {
            let key = self.keys.get_key(GROUP_KEY1_INDEX).ok_or(MeshError::Fail)?;
            tlvs.push(Tlv::SymmetricKey(*key.as_bytes()));
        }
        if let Some(node) = sid_node.filter(|n| is_unique_sid(n.sid)) {
            tlvs.push(Tlv::AllocateSid(node.sid));
            tlvs.push(Tlv::NodeType(node.node_type.to_u8()));
            tlvs.push(Tlv::NetworkInfo(self.local_network_info(network)));
            tlvs.push(Tlv::McastAddr(self.nd.stable.mcast_addr));
        }
        let netid = self.networks[network].meshnetid;
        self.send_command(hal, command::ATTACH_RESPONSE, MeshAddr::ext(netid, mac), &tlvs)
    }

    pub(crate) fn handle_attach_request(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        let uuid = tlvs.src_uuid().ok_or(MeshError::Drop)?;
        let mac = self.update_neighbor(info, tlvs, true).ok_or(MeshError::Drop)?;
        let hal = info.hal;
        if self.state < DeviceState::Leaf || self.attach.candidate.is_some() {
            return Err(MeshError::Fail);
        }
        if self.mode.is_mobile() || self.attach.attach_node == Some((hal, mac)) {
            return Err(MeshError::Fail);
        }
        let mode = info.mode.unwrap_or(crate::types::Mode::NONE);
        {
            let nbr = self.hals[hal].neighbors.get_mut(&mac).ok_or(MeshError::Fail)?;
            if self.config.auth_enabled && !nbr.flags.authenticated() {
                debug!(%mac, "attach request from unauthenticated node");
                return Err(MeshError::Fail);
            }
            if let (Some(timestamp), true) = (tlvs.timestamp(), self.config.sec_level > 0) {
                nbr.one_time_key = Some(derive_one_time_key(timestamp, &mac)?);
            }
        }

        let network = self.network_for_hal(hal);
        let sid_node = if !info.dest.is_broadcast() && !mode.is_mobile() && self.networks[network].allocator.is_structured() {
            let request = SidRequest {
                uuid,
                mode,
                expected_sid: None,
            };
            let net = &mut self.networks[network];
            match net.allocator.allocate(&request, &mut self.rng) {
                Ok(node) => Some(node),
                Err(err) => {
                    warn!(%uuid, reason = %err, "no sid left for joiner");
                    return Err(MeshError::Fail);
                }
            }
        } else {
            None
        };
        info!(%uuid, sid = ?sid_node.map(|n| n.sid), "attach request accepted");
        self.send_attach_response(hal, mac, sid_node)
    }

    pub(crate) fn handle_attach_response(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        if !matches!(self.attach.state, AttachState::Request | AttachState::SidRequest) {
            return Err(MeshError::Drop);
        }
        let mac = self.update_neighbor(info, tlvs, true).ok_or(MeshError::Drop)?;
        let hal = info.hal;
        if self.attach.candidate != Some((hal, mac)) {
            return Err(MeshError::Drop);
        }
        let path_cost = tlvs.path_cost().ok_or(MeshError::Drop)?;
        let group_key = if self.config.sec_level > 0 {
            Some(tlvs.symmetric_key().ok_or(MeshError::Drop)?)
        } else {
            None
        };
        let link_cost = self.link_cost(hal, &mac);
        if info.src.netid == self.attach.prev_netid && self.attach.prev_path_cost < path_cost.saturating_add(link_cost) {
            return Err(MeshError::Drop);
        }
        if let Some(key) = group_key {
            self.keys.set_key(GROUP_KEY1_INDEX, Key::from_bytes(key))?;
        }
        if let Some(timestamp) = tlvs.timestamp() {
            self.set_timestamp(timestamp);
        }
        if let Some(nbr) = self.hals[hal].neighbors.get_mut(&mac) {
            nbr.attach_candidate_timeout = 0;
        }
        self.lowpower_update_from_tlvs(hal, &mac, tlvs);
        self.state = DeviceState::Attached;
        self.event_loop.stop_timer(TimerKind::AttachRequest);

        if self.sid_allocated_handler(info, tlvs).is_err() {
            debug!("attach response without sid, requesting one");
            self.attach.state = AttachState::SidRequest;
            self.attach.retry_times = 1;
            self.send_sid_request()?;
            let interval = self.hals[hal].timings.sid_request_interval_ms;
            self.event_loop.start_timer(TimerKind::SidRequest, interval);
        }
        Ok(())
    }

    /// Ask for a SID through the candidate
    ///
    /// Mobile nodes and non-structured networks get their SID from the
    /// leader; the candidate relays the request there.
    fn send_sid_request(&mut self) -> MeshResult<()> {
        let (hal, mac) = self.attach.candidate.ok_or(MeshError::Fail)?;
        let (netid, sid, mode) = {
            let nbr = self.hals[hal].neighbors.get(&mac).ok_or(MeshError::Fail)?;
            (nbr.netid, nbr.sid, nbr.mode)
        };
        let mut tlvs = vec![
            Tlv::AttachNodeId(NodeId::new(sid, mode, netid)),
            Tlv::SrcUuid(self.uuid),
            Tlv::Mode(self.mode),
        ];
        if is_unique_sid(self.attach.sid) && self.networks[0].meshnetid == netid {
            tlvs.push(Tlv::SrcSid(self.attach.sid));
        }
        let dest = MeshAddr::short(netid, sid);
        if self.mode.is_mobile() || !self.is_structured() {
            let leader = MeshAddr::short(netid, get_leader_sid(netid));
            self.send_proxied_command(hal, command::SID_REQUEST, dest, leader, &tlvs)
        } else {
            self.send_command(hal, command::SID_REQUEST, dest, &tlvs)
        }
    }

    pub(crate) fn handle_sid_request(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        if self.attach.candidate.is_some() || self.state < DeviceState::Router {
            return Err(MeshError::Drop);
        }
        let uuid = tlvs.src_uuid().ok_or(MeshError::Drop)?;
        let mode = tlvs.mode().ok_or(MeshError::Drop)?;
        let attach_id = tlvs.attach_node_id().ok_or(MeshError::Drop)?;
        let known = self.hals.iter().any(|h| h.neighbors.get(&uuid).is_some());
        let request = SidRequest {
            uuid,
            mode,
            expected_sid: tlvs.src_sid().filter(|_| known),
        };

        let network = info.network;
        let node = {
            let net = self.networks.get_mut(network).ok_or(MeshError::Fail)?;
            net.allocator.allocate(&request, &mut self.rng)?
        };
        info!(%uuid, sid = format_args!("{:04x}", node.sid), "sid allocated");
        let tlvs = vec![
            Tlv::AllocateSid(node.sid),
            Tlv::NodeType(node.node_type.to_u8()),
            Tlv::NetworkInfo(self.local_network_info(network)),
            Tlv::McastAddr(self.nd.stable.mcast_addr),
        ];

        let hal = self.networks[network].hal;
        if attach_id.sid == self.attach.sid && attach_id.meshnetid == self.networks[network].meshnetid {
            let hal = self
                .hals
                .iter()
                .position(|h| h.neighbors.get(&uuid).is_some())
                .unwrap_or(hal);
            return self.send_command(hal, command::SID_RESPONSE, MeshAddr::ext(attach_id.meshnetid, uuid), &tlvs);
        }
        let dest = MeshAddr::short(attach_id.meshnetid, attach_id.sid);
        let dest2 = MeshAddr::ext(attach_id.meshnetid, uuid);
        self.send_proxied_command(hal, command::SID_RESPONSE, dest, dest2, &tlvs)
    }

    pub(crate) fn handle_sid_response(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        if self.attach.candidate.is_none() || self.attach.state != AttachState::SidRequest {
            return Err(MeshError::Drop);
        }
        self.sid_allocated_handler(info, tlvs)
    }

    /// Take the SID carried in `tlvs` and bring the interface up
    fn sid_allocated_handler(&mut self, _info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        let sid = tlvs.allocate_sid().ok_or(MeshError::Fail)?;
        let node_type = tlvs.node_type().and_then(NodeType::from_u8).ok_or(MeshError::Fail)?;
        let netinfo = tlvs.network_info().ok_or(MeshError::Fail)?;
        let (hal, mac) = self.attach.candidate.ok_or(MeshError::Fail)?;
        let (netid, parent_cost) = {
            let nbr = self.hals[hal].neighbors.get(&mac).ok_or(MeshError::Fail)?;
            (nbr.netid, nbr.path_cost)
        };
        let link_cost = self.link_cost(hal, &mac);

        if let Some((old_hal, old_mac)) = self.attach.attach_node.take() {
            if let Some(old) = self.hals[old_hal].neighbors.get_mut(&old_mac) {
                old.state = NeighborState::Neighbor;
            }
        }
        if let Some(nbr) = self.hals[hal].neighbors.get_mut(&mac) {
            nbr.state = NeighborState::Parent;
        }
        self.attach.attach_node = Some((hal, mac));
        self.attach.candidate = None;
        self.attach.state = AttachState::Done;
        self.attach.retry_times = 0;
        self.attach.leader_times = 0;
        self.attach.sid = sid;
        self.attach.path_cost = parent_cost.saturating_add(link_cost);
        self.state = if self.mode.is_mobile() {
            DeviceState::Leaf
        } else {
            node_type.device_state()
        };
        for net in self.networks.iter_mut() {
            net.meshnetid = netid;
        }
        self.nd_adopt(netid, &netinfo);
        if let Some(mcast) = tlvs.mcast_addr() {
            self.nd.stable.mcast_addr = mcast;
        }
        self.event_loop.stop_timer(TimerKind::AttachRequest);
        self.event_loop.stop_timer(TimerKind::SidRequest);
        self.keys.clear_key(ONE_TIME_KEY_INDEX);
        info!(
            sid = format_args!("{:04x}", sid),
            netid = format_args!("{:04x}", netid),
            state = %self.state,
            "attached"
        );
        self.interface_up();
        Ok(())
    }

    /// Common work once we own a SID, as a leader or as an attached node
    fn interface_up(&mut self) {
        let (sid, state) = (self.attach.sid, self.state);
        for net in self.networks.iter_mut() {
            net.allocator = net.router.new_allocator(sid, state);
        }
        self.router_start();
        self.start_advertisements();
        for hal in 0..self.hals.len() {
            let interval = self.hals[hal].timings.link_quality_interval_ms;
            self.event_loop.start_timer(TimerKind::LinkQuality { hal }, interval);
        }
        if self.state == DeviceState::Leader {
            self.event_loop.start_timer(
                TimerKind::AddrCacheCheck,
                crate::address::ADDR_CACHE_CHECK_INTERVAL_MS,
            );
        } else {
            let jitter = self.random_jitter(self.hals[0].timings.attach_request_interval_ms);
            self.event_loop.start_timer(TimerKind::Notification, jitter);
        }

        self.prev_netinfo = Some((self.networks[0].meshnetid, self.attach.path_cost));
        self.reboot_flag = false;
        self.stop_discover();
        if self.state == DeviceState::Leader {
            self.start_discover_timer();
        }
        self.lowpower_interface_up();
        for listener in self.listeners.iter_mut() {
            listener.interface_up(state);
        }
        if let Some(ip) = self.ip.as_mut() {
            ip.interface_up();
        }
    }

    /// Retry or give up an attach or SID request
    pub(crate) fn handle_attach_timer(&mut self) {
        let requesting = match self.attach.state {
            AttachState::Request => true,
            AttachState::SidRequest => false,
            _ => return,
        };
        if self.attach.retry_times < ATTACH_REQUEST_RETRY_TIMES {
            self.attach.retry_times += 1;
            let hal = self.attach.candidate.map(|(hal, _)| hal).unwrap_or(0);
            let (result, kind, interval) = if requesting {
                (
                    self.send_attach_request(),
                    TimerKind::AttachRequest,
                    self.hals[hal].timings.attach_request_interval_ms,
                )
            } else {
                (
                    self.send_sid_request(),
                    TimerKind::SidRequest,
                    self.hals[hal].timings.sid_request_interval_ms,
                )
            };
            if let Err(err) = result {
                debug!(reason = %err, "attach retry not sent");
            }
            self.event_loop.start_timer(kind, interval);
            return;
        }

        if let Some((hal, mac)) = self.attach.candidate.take() {
            info!(%mac, "attach candidate gave no answer");
            if let Some(nbr) = self.hals[hal].neighbors.get_mut(&mac) {
                nbr.attach_candidate_timeout = ATTACH_CANDIDATE_TIMEOUT;
            }
        }
        self.attach.state = AttachState::Idle;
        self.attach.candidate_meshnetid = BCAST_NETID;
        self.keys.clear_key(ONE_TIME_KEY_INDEX);

        if self.state < DeviceState::Leaf {
            self.attach.leader_times += 1;
            if self.attach.leader_times >= BECOME_LEADER_TIMEOUT && !self.mode.is_mobile() {
                self.attach.leader_times = 0;
                if let Err(err) = self.become_leader() {
                    warn!(reason = %err, "could not become leader");
                }
            } else {
                self.become_detached(InterfaceDownReason::AttachFail);
            }
        } else {
            if let Some(channel) = self.attach.prev_channel.take() {
                let _ = self.set_channel(0, channel);
            }
            self.start_advertisements();
        }
    }

    /// Tell a neighbor its SID is not ours to honour
    pub(crate) fn send_address_error(&mut self, hal: usize, mac: ExtAddr) -> MeshResult<()> {
        let netid = self.networks[self.network_for_hal(hal)].meshnetid;
        self.send_command(hal, command::ADDRESS_ERROR, MeshAddr::ext(netid, mac), &[])
    }

    pub(crate) fn handle_address_error(&mut self, info: &MessageInfo, _tlvs: &Tlvs) -> MeshResult<()> {
        let parent = self.attach.attach_node.ok_or(MeshError::Drop)?;
        if info.src_mac != Some(parent.1) || info.hal != parent.0 {
            return Err(MeshError::Drop);
        }
        info!("parent forgot our sid, attaching again");
        self.attach_start(Some(parent))
    }

    /// React to a neighbor table change
    pub(crate) fn neighbor_updated(&mut self, hal: usize, mac: ExtAddr) {
        self.router_neighbor_updated(hal, &mac);
        let Some((valid, netid_changed)) = self
            .hals
            .get(hal)
            .and_then(|h| h.neighbors.get_any(&mac))
            .map(|n| (n.is_valid(), n.flags.netid_changed()))
        else {
            return;
        };
        if let Some(nbr) = self.hals[hal].neighbors.get_mut(&mac) {
            nbr.flags.set_sid_changed(false);
            nbr.flags.set_netid_changed(false);
        }
        if self.attach.attach_node != Some((hal, mac)) || self.state == DeviceState::Leader {
            return;
        }
        if !valid {
            info!(%mac, "parent lost");
            self.become_detached(InterfaceDownReason::AttachFail);
            let _ = self.attach_start(None);
        } else if netid_changed {
            info!(%mac, "parent moved to another network");
            self.become_detached(InterfaceDownReason::ParentNetidChanged);
        }
    }

    /// Form a network of our own
    pub(crate) fn become_leader(&mut self) -> MeshResult<()> {
        if self.mode.is_mobile() {
            return Err(MeshError::Fail);
        }
        let netid = stable_meshnetid(&self.uuid, self.mode);
        self.stop_discover();
        for kind in [TimerKind::AttachRequest, TimerKind::SidRequest, TimerKind::MigrateReset] {
            self.event_loop.stop_timer(kind);
        }
        if let Some((hal, mac)) = self.attach.attach_node.take() {
            if let Some(nbr) = self.hals[hal].neighbors.get_mut(&mac) {
                nbr.state = NeighborState::Neighbor;
            }
        }
        self.attach.candidate = None;
        self.attach.state = AttachState::Idle;
        self.attach.sid = LEADER_SID;
        self.attach.path_cost = 0;
        self.state = DeviceState::Leader;
        self.leader_mode = self.mode;

        let main_version = if self.reboot_flag {
            (self.nd.stable.main_version + 1) & MAX_MAIN_VERSION
        } else {
            self.nd.stable.main_version
        };
        self.nd.reset();
        self.nd.stable.set_meshnetid(netid);
        self.nd.stable.set_main_version(main_version)?;
        self.sid_cache.clear();
        for net in self.networks.iter_mut() {
            net.meshnetid = netid;
            net.network_data = Default::default();
        }
        if let Some(channel) = self.config.channels.first().copied() {
            let _ = self.set_channel(0, channel);
        }
        if self.config.sec_level > 0 {
            let key = derive_group_key(&self.config.master_key, self.timestamp())?;
            self.keys.set_key(GROUP_KEY1_INDEX, key)?;
        }
        info!(netid = format_args!("{:04x}", netid), main_version, "became leader");
        self.interface_up();
        Ok(())
    }

    /// Drop out of the network
    pub(crate) fn become_detached(&mut self, reason: InterfaceDownReason) {
        if self.state != DeviceState::Detached {
            if self.state > DeviceState::Detached {
                info!(?reason, "detached");
            }
            self.state = DeviceState::Detached;
            self.attach.state = AttachState::Idle;
            for kind in [
                TimerKind::AttachRequest,
                TimerKind::SidRequest,
                TimerKind::MigrateReset,
                TimerKind::Notification,
                TimerKind::AddrCacheCheck,
            ] {
                self.event_loop.stop_timer(kind);
            }
            self.stop_advertisements();
            for hal in 0..self.hals.len() {
                self.event_loop.stop_timer(TimerKind::LinkQuality { hal });
            }
            self.attach.sid = BCAST_SID;
            self.attach.path_cost = INFINITY_PATH_COST;
            self.attach.prev_netid = INVALID_NETID;
            self.attach.prev_path_cost = INFINITY_PATH_COST;
            if let Some((hal, mac)) = self.attach.attach_node.take() {
                if let Some(nbr) = self.hals[hal].neighbors.get_mut(&mac) {
                    nbr.state = NeighborState::Neighbor;
                }
            }
            self.attach.candidate = None;
            self.attach.candidate_meshnetid = BCAST_NETID;
            self.attach.migrate_times = 0;
            for net in self.networks.iter_mut() {
                net.meshnetid = BCAST_NETID;
                net.allocator = SidAllocator::None;
            }
            self.nd.reset();
            self.sid_cache.clear();
            self.resolver.clear();
            self.router_stop();
            self.lowpower_interface_down(reason);
            for listener in self.listeners.iter_mut() {
                listener.interface_down(reason);
            }
            if let Some(ip) = self.ip.as_mut() {
                ip.interface_down(reason);
            }
        }

        match reason {
            InterfaceDownReason::MeshStart | InterfaceDownReason::ParentNetidChanged => self.start_discover(),
            InterfaceDownReason::AttachFail | InterfaceDownReason::DiscoverFail | InterfaceDownReason::AuthFail => {
                self.start_discover_timer()
            }
            InterfaceDownReason::MeshStop => self.stop_discover(),
            InterfaceDownReason::LeaderReboot | InterfaceDownReason::LeaderMode => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::sim::{SimHal, SimMedium};
    use crate::tlv::NetworkInfo;
    use crate::types::Mode;

    const PARENT: ExtAddr = ExtAddr([2, 0, 0, 0, 0, 0, 0, 2]);
    const OTHER: ExtAddr = ExtAddr([2, 0, 0, 0, 0, 0, 0, 3]);
    const LOCAL_NETID: u16 = 0x0100;

    fn detached_node() -> MeshNode {
        let medium = SimMedium::new();
        let mut node = MeshNode::new(MeshConfig::default().with_seed(11));
        node.add_hal(Box::new(SimHal::new(&medium, ExtAddr([2, 0, 0, 0, 0, 0, 0, 1]))))
            .unwrap();
        node.start().unwrap();
        node
    }

    /// Leaf of `LOCAL_NETID` attached to `PARENT` with path cost 1000
    fn attached_leaf() -> MeshNode {
        let mut node = detached_node();
        add_neighbor(&mut node, PARENT, LOCAL_NETID, 744);
        node.state = DeviceState::Leaf;
        node.networks[0].meshnetid = LOCAL_NETID;
        node.attach.sid = 0x1000;
        node.attach.path_cost = 1000;
        node.attach.attach_node = Some((0, PARENT));
        node
    }

    fn add_neighbor(node: &mut MeshNode, mac: ExtAddr, netid: u16, path_cost: u16) {
        let nbr = node.hals[0].neighbors.get_or_insert(mac, 0, false).unwrap();
        nbr.state = NeighborState::Neighbor;
        nbr.mode = Mode::RX_ON;
        nbr.netid = netid;
        nbr.sid = 0x2000;
        nbr.path_cost = path_cost;
        nbr.ssid_info.free_slots = 4;
    }

    fn netinfo(size: u16, subnet_size: u16) -> NetworkInfo {
        NetworkInfo {
            main_version: 0,
            version: 0,
            size,
            subnet_size,
            leader_mode: Mode::RX_ON,
        }
    }

    fn vote_started(node: &MeshNode) -> bool {
        node.event_loop.is_timer_active(TimerKind::MigrateReset)
    }

    fn expire_migrate_reset(node: &mut MeshNode) {
        node.event_loop.stop_timer(TimerKind::MigrateReset);
        node.handle_migrate_reset_timer();
    }

    #[test]
    fn test_network_metric_weights() {
        assert_eq!(compute_network_metric(0, 0), 0);
        assert_eq!(compute_network_metric(40, 0), 2);
        assert_eq!(compute_network_metric(0, 512), 2);
        assert_eq!(compute_network_metric(20, 256), 2);
    }

    #[test]
    fn test_attach_context_defaults() {
        let ctx = AttachContext::default();
        assert_eq!(ctx.state, AttachState::Idle);
        assert_eq!(ctx.sid, BCAST_SID);
        assert_eq!(ctx.path_cost, INFINITY_PATH_COST);
        assert!(ctx.attach_node.is_none());
        assert_eq!(ctx.prev_netid, INVALID_NETID);
    }

    #[test]
    fn test_migrate_needs_two_more_rounds_when_attached() {
        let mut node = attached_leaf();
        add_neighbor(&mut node, OTHER, 0x0200, 0);
        let info = netinfo(100, 100);
        assert!(!node.migration_check(0, OTHER, &info));
        assert!(vote_started(&node));
        assert!(!node.migration_check(0, OTHER, &info));
        assert!(node.migration_check(0, OTHER, &info));
        assert!(!vote_started(&node));
    }

    #[test]
    fn test_migrate_needs_one_more_round_when_detached() {
        let mut node = detached_node();
        add_neighbor(&mut node, OTHER, 0x0200, 0);
        let info = netinfo(1, 1);
        assert!(!node.migration_check(0, OTHER, &info));
        assert!(node.migration_check(0, OTHER, &info));
    }

    #[test]
    fn test_migrate_votes_restart_for_new_candidate() {
        let mut node = attached_leaf();
        add_neighbor(&mut node, OTHER, 0x0200, 0);
        add_neighbor(&mut node, ExtAddr([2, 0, 0, 0, 0, 0, 0, 4]), 0x0300, 0);
        let info = netinfo(100, 100);

        assert!(!node.migration_check(0, OTHER, &info));
        assert_eq!(node.attach.candidate_meshnetid, 0x0200);
        // Other networks do not count toward the candidate
        assert!(!node.update_migrate_times(0, ExtAddr([2, 0, 0, 0, 0, 0, 0, 4])));
        assert!(!node.update_migrate_times(0, ExtAddr([2, 0, 0, 0, 0, 0, 0, 4])));
        assert_eq!(node.attach.migrate_times, 0);
        assert!(!node.migration_check(0, OTHER, &info));
        assert_eq!(node.attach.migrate_times, 1);

        expire_migrate_reset(&mut node);
        assert_eq!(node.attach.candidate_meshnetid, BCAST_NETID);
        assert!(!node.update_migrate_times(0, ExtAddr([2, 0, 0, 0, 0, 0, 0, 4])));
        assert_eq!(node.attach.candidate_meshnetid, 0x0300);
        assert_eq!(node.attach.migrate_times, 0);
    }

    #[test]
    fn test_migrate_same_net_path_cost_hysteresis() {
        // 1000 <= 700 + 384: not worth switching parents
        let mut node = attached_leaf();
        add_neighbor(&mut node, OTHER, LOCAL_NETID, 700);
        assert!(!node.migration_check(0, OTHER, &netinfo(10, 10)));
        assert!(!vote_started(&node));

        // The neighbor's own link cost is not part of the comparison
        let mut node = attached_leaf();
        add_neighbor(&mut node, OTHER, LOCAL_NETID, 600);
        assert!(!node.migration_check(0, OTHER, &netinfo(10, 10)));
        assert!(vote_started(&node));
        assert_eq!(node.attach.candidate_meshnetid, LOCAL_NETID);
    }

    #[test]
    fn test_parent_advertisement_refreshes_path_cost() {
        let mut node = attached_leaf();
        assert!(!node.migration_check(0, PARENT, &netinfo(10, 10)));
        assert_eq!(node.attach.path_cost, 744 + crate::link::LINK_ESTIMATE_COEF);
        assert!(!vote_started(&node));
    }

    #[test]
    fn test_migrate_same_core_subnet_hysteresis() {
        // Local subnet metric 10 against offered 6: within the hysteresis
        let mut node = attached_leaf();
        node.networks[0].network_data.size = 200;
        add_neighbor(&mut node, OTHER, LOCAL_NETID | 0x01, 0);
        assert!(!node.migration_check(0, OTHER, &netinfo(300, 120)));
        assert!(!vote_started(&node));

        // Offered 5: a vote, even with a far away advertiser
        let mut node = attached_leaf();
        node.networks[0].network_data.size = 200;
        add_neighbor(&mut node, OTHER, LOCAL_NETID | 0x01, 5000);
        assert!(!node.migration_check(0, OTHER, &netinfo(300, 100)));
        assert!(vote_started(&node));
    }

    #[test]
    fn test_migrate_cross_net_size_and_netid_tie_break() {
        // Smaller network
        let mut node = attached_leaf();
        node.nd.global.size = 30;
        add_neighbor(&mut node, OTHER, 0x0200, 0);
        assert!(!node.migration_check(0, OTHER, &netinfo(10, 10)));
        assert!(!vote_started(&node));

        // Metrics 1 == 1, higher netid wins the tie
        let mut node = attached_leaf();
        node.nd.global.size = 30;
        add_neighbor(&mut node, OTHER, 0x0200, 0);
        assert!(!node.migration_check(0, OTHER, &netinfo(25, 25)));
        assert!(vote_started(&node));

        // Same tie against a lower netid
        let mut node = attached_leaf();
        node.networks[0].meshnetid = 0x0300;
        node.nd.global.size = 30;
        add_neighbor(&mut node, OTHER, 0x0200, 0);
        assert!(!node.migration_check(0, OTHER, &netinfo(25, 25)));
        assert!(!vote_started(&node));

        // Bigger network wins regardless of netid
        let mut node = attached_leaf();
        node.networks[0].meshnetid = 0x0300;
        node.nd.global.size = 30;
        add_neighbor(&mut node, OTHER, 0x0200, 0);
        assert!(!node.migration_check(0, OTHER, &netinfo(60, 60)));
        assert!(vote_started(&node));
    }

    #[test]
    fn test_leader_reboot_from_main_version() {
        let mut node = attached_leaf();
        node.nd.stable.main_version = 1;
        let mut info = netinfo(10, 10);
        info.main_version = 1;
        assert!(!node.migration_check(0, PARENT, &info));
        assert_eq!(node.state(), DeviceState::Leaf);

        info.main_version = 2;
        assert!(!node.migration_check(0, PARENT, &info));
        assert_eq!(node.state(), DeviceState::Detached);
        assert_eq!(node.attach.state, AttachState::Request);
        assert_eq!(node.attach.candidate, Some((0, PARENT)));
    }

    #[test]
    fn test_leader_reboot_from_parent_flag() {
        // A reboot flag raised by a SID change is not a leader reboot
        let mut node = attached_leaf();
        let parent = node.hals[0].neighbors.get_mut(&PARENT).unwrap();
        parent.flags.set_reboot(true);
        parent.flags.set_sid_changed(true);
        assert!(!node.migration_check(0, PARENT, &netinfo(10, 10)));
        assert_eq!(node.state(), DeviceState::Leaf);
        assert!(node.hals[0].neighbors.get(&PARENT).unwrap().flags.reboot());

        let mut node = attached_leaf();
        node.hals[0].neighbors.get_mut(&PARENT).unwrap().flags.set_reboot(true);
        assert!(!node.migration_check(0, PARENT, &netinfo(10, 10)));
        assert_eq!(node.state(), DeviceState::Detached);
        assert_eq!(node.attach.candidate, Some((0, PARENT)));
        assert!(!node.hals[0].neighbors.get(&PARENT).unwrap().flags.reboot());
    }
}
