//! Pluggable routing policies
//!
//! A network runs one [`RouterPolicy`]. The node asks it for the next-hop
//! SID of every unicast it sends or relays, tells it when neighbors come
//! and go, and hands it the `ROUTING_INFO_UPDATE` frames addressed to it.
//! The policy also picks the SID allocator the network uses.
//!
//! ```text
//!                 ┌──────────────────────┐
//! get_next_hop ──►│ direct neighbor?     │── yes ──► dest
//!                 └─────────┬────────────┘
//!                           │ no
//!                 ┌─────────▼────────────┐
//!                 │ policy.next_hop_sid  │──► LEADER_SID remapped to the
//!                 └──────────────────────┘    subnet leader
//! ```
//!
//! `ROUTING_INFO_UPDATE` bodies start with the id of the router they are
//! meant for, so frames for a policy that is not running are ignored.

pub mod sid_router;
pub mod vector_router;

pub use sid_router::SidRouter;
pub use vector_router::VectorRouter;

use crate::command;
use crate::config::RouterKind;
use crate::error::{MeshError, MeshResult};
use crate::link::NeighborState;
use crate::message::MessageInfo;
use crate::node::MeshNode;
use crate::sid_allocator::SidAllocator;
use crate::timer::TimerKind;
use crate::types::{get_leader_sid, is_unique_sid, DeviceState, ExtAddr, MeshAddr, INVALID_SID, LEADER_SID};
use std::fmt;
use tracing::{debug, info};

/// Router id of the structured-SID router
pub const SID_ROUTER: u8 = 0;
/// Router id of the vector router
pub const VECTOR_ROUTER: u8 = 1;

/// What a policy needs to know about one neighbor
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NeighborRoute {
    pub sid: u16,
    pub netid: u16,
    pub link_cost: u16,
    pub state: NeighborState,
}

/// Snapshot of the local node handed to a policy
#[derive(Debug, Clone, Copy)]
pub struct RouteContext<'a> {
    pub local_sid: u16,
    pub netid: u16,
    /// SID of our attach node, `None` for a leader
    pub parent_sid: Option<u16>,
    pub state: DeviceState,
    pub neighbors: &'a [NeighborRoute],
}

impl RouteContext<'_> {
    /// Link cost to the neighbor owning `sid`
    pub fn link_cost(&self, sid: u16) -> Option<u16> {
        self.neighbors
            .iter()
            .find(|n| n.sid == sid && n.state > NeighborState::Invalid)
            .map(|n| n.link_cost)
    }
}

/// A routing policy
pub trait RouterPolicy: Send + fmt::Debug {
    /// Id carried in `ROUTING_INFO_UPDATE` bodies
    fn id(&self) -> u8;

    fn kind(&self) -> RouterKind;

    fn start(&mut self, local_sid: u16);

    fn stop(&mut self);

    /// Next hop towards `dest`, `INVALID_SID` when unknown
    fn get_next_hop_sid(&self, ctx: &RouteContext<'_>, dest: u16) -> u16;

    fn handle_neighbor_updated(&mut self, neighbor: &NeighborRoute);

    /// Router payload of a `ROUTING_INFO_UPDATE` received from `from_sid`
    fn handle_message_received(&mut self, ctx: &RouteContext<'_>, from_sid: u16, payload: &[u8]) -> MeshResult<()>;

    /// Allocator a node in `state` owning `local_sid` hands out SIDs from
    fn new_allocator(&self, local_sid: u16, state: DeviceState) -> SidAllocator;

    /// Period of [`RouterPolicy::periodic`], `None` when not needed
    fn periodic_interval(&self) -> Option<u64> {
        None
    }

    /// Periodic work, returning a payload to broadcast
    fn periodic(&mut self, _ctx: &RouteContext<'_>) -> Option<Vec<u8>> {
        None
    }
}

/// Build the policy for a router kind
pub fn new_router(kind: RouterKind) -> Box<dyn RouterPolicy> {
    match kind {
        RouterKind::Sid => Box::new(SidRouter::new()),
        RouterKind::Vector => Box::new(VectorRouter::new()),
    }
}

impl MeshNode {
    fn neighbor_routes(&self, network: usize) -> Vec<NeighborRoute> {
        let netid = self.networks[network].meshnetid;
        self.hals
            .iter()
            .flat_map(|h| h.neighbors.iter())
            .filter(|n| n.netid == netid && is_unique_sid(n.sid))
            .map(|n| NeighborRoute {
                sid: n.sid,
                netid: n.netid,
                link_cost: n.stats.link_cost,
                state: n.state,
            })
            .collect()
    }

    fn parent_sid(&self) -> Option<u16> {
        if self.state == DeviceState::Leader {
            return None;
        }
        let (hal, mac) = self.attach_node()?;
        self.hals[hal].neighbors.get(&mac).map(|n| n.sid)
    }

    /// Next-hop SID towards `(dest_netid, dest_sid)` in `network`
    pub(crate) fn router_get_next_hop(&self, network: usize, dest_netid: u16, dest_sid: u16) -> u16 {
        let Some(net) = self.networks.get(network) else {
            return INVALID_SID;
        };
        if self
            .hals
            .iter()
            .any(|h| h.neighbors.get_by_sid(dest_netid, dest_sid).is_some())
        {
            return dest_sid;
        }
        let routes = self.neighbor_routes(network);
        let ctx = RouteContext {
            local_sid: self.attach.sid,
            netid: net.meshnetid,
            parent_sid: self.parent_sid(),
            state: self.state,
            neighbors: &routes,
        };
        let next = net.router.get_next_hop_sid(&ctx, dest_sid);
        if next == LEADER_SID {
            get_leader_sid(net.meshnetid)
        } else {
            next
        }
    }

    /// Tell the policy about a neighbor change
    pub(crate) fn router_neighbor_updated(&mut self, hal: usize, mac: &ExtAddr) {
        let network = self.network_for_hal(hal);
        let Some(nbr) = self.hals.get(hal).and_then(|h| h.neighbors.get_any(mac)) else {
            return;
        };
        let route = NeighborRoute {
            sid: nbr.sid,
            netid: nbr.netid,
            link_cost: nbr.stats.link_cost,
            state: nbr.state,
        };
        if let Some(net) = self.networks.get_mut(network) {
            net.router.handle_neighbor_updated(&route);
        }
    }

    pub(crate) fn handle_routing_info_update(&mut self, info: &MessageInfo, body: &[u8]) -> MeshResult<()> {
        let (&router_id, payload) = body.split_first().ok_or(MeshError::Parse("routing info"))?;
        let network = info.network;
        let net = self.networks.get(network).ok_or(MeshError::Fail)?;
        if net.router.id() != router_id {
            return Err(MeshError::Drop);
        }
        let from_sid = info.src.sid().ok_or(MeshError::Drop)?;
        let routes = self.neighbor_routes(network);
        let ctx = RouteContext {
            local_sid: self.attach.sid,
            netid: net.meshnetid,
            parent_sid: self.parent_sid(),
            state: self.state,
            neighbors: &routes,
        };
        let net = &mut self.networks[network];
        net.router.handle_message_received(&ctx, from_sid, payload)
    }

    /// Start the policy of every network once we own a SID
    pub(crate) fn router_start(&mut self) {
        let sid = self.attach.sid;
        for network in 0..self.networks.len() {
            self.networks[network].router.start(sid);
        }
        if let Some(interval) = self.networks.first().and_then(|n| n.router.periodic_interval()) {
            self.event_loop.start_timer(TimerKind::RoutingUpdate, interval);
        }
    }

    pub(crate) fn router_stop(&mut self) {
        for net in self.networks.iter_mut() {
            net.router.stop();
        }
        self.event_loop.stop_timer(TimerKind::RoutingUpdate);
    }

    pub(crate) fn handle_routing_timer(&mut self) {
        for network in 0..self.networks.len() {
            let routes = self.neighbor_routes(network);
            let ctx = RouteContext {
                local_sid: self.attach.sid,
                netid: self.networks[network].meshnetid,
                parent_sid: self.parent_sid(),
                state: self.state,
                neighbors: &routes,
            };
            let net = &mut self.networks[network];
            let Some(payload) = net.router.periodic(&ctx) else {
                continue;
            };
            let mut body = Vec::with_capacity(payload.len() + 1);
            body.push(net.router.id());
            body.extend_from_slice(&payload);
            let dest = MeshAddr::bcast(net.meshnetid);
            let hal = net.hal;
            if let Err(err) = self.send_command_bytes(hal, command::ROUTING_INFO_UPDATE, dest, body) {
                debug!(network, ?err, "routing update not sent");
            }
        }
        if let Some(interval) = self.networks.first().and_then(|n| n.router.periodic_interval()) {
            self.event_loop.start_timer(TimerKind::RoutingUpdate, interval);
        }
    }

    /// Switch every network to another routing policy
    pub fn set_router(&mut self, kind: RouterKind) -> MeshResult<()> {
        if self.config.router == kind {
            return Ok(());
        }
        let running = self.state >= DeviceState::Leaf;
        if running {
            self.router_stop();
        }
        for net in self.networks.iter_mut() {
            net.router = new_router(kind);
        }
        self.config.router = kind;
        info!(router = ?kind, "router changed");
        if running {
            self.router_start();
        }
        Ok(())
    }
}
