//! Distance-vector router
//!
//! Every router periodically broadcasts a heartbeat listing the
//! destinations it can reach and at what cost. A receiver adds its link
//! cost to the sender and keeps, per destination, the cheapest next hop.
//! Routes learned through a next hop always follow that next hop's latest
//! heartbeat, so withdrawn or more expensive routes propagate.
//!
//! ## Heartbeat
//!
//! ```text
//! | cmd (0x01) | seq | sid (LE) | count | count x (dest sid LE, cost LE) |
//! ```
//!
//! The heartbeat interval starts at one tick and doubles up to
//! `MAX_HEARTBEAT_TICKS`; any topology change resets it to one tick.

use super::{NeighborRoute, RouteContext, RouterPolicy, VECTOR_ROUTER};
use crate::config::RouterKind;
use crate::cursor::{Reader, Writer};
use crate::error::{MeshError, MeshResult};
use crate::link::NeighborState;
use crate::sid_allocator::{RandomAllocator, SidAllocator};
use crate::types::{is_unique_sid, DeviceState, INFINITY_PATH_COST, INVALID_SID};
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// Heartbeat timer tick
pub const HEARTBEAT_TICK_MS: u64 = 4_000;
/// Longest heartbeat interval in ticks
pub const MAX_HEARTBEAT_TICKS: u32 = 8;
/// Learned routes expire after this many ticks without a refresh
pub const ROUTE_ALIVE_TICKS: u8 = 12;

const COMMAND_HEARTBEAT: u8 = 0x01;

/// One routing table entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Route {
    pub dest: u16,
    pub next_hop: u16,
    pub cost: u16,
    age: u8,
}

#[derive(Debug, Default)]
pub struct VectorRouter {
    local_sid: Option<u16>,
    seq: u8,
    routes: BTreeMap<u16, Route>,
    /// Last heartbeat sequence seen per sender
    peer_seq: HashMap<u16, u8>,
    heartbeat_count: u32,
    heartbeat_interval: u32,
}

impl VectorRouter {
    pub fn new() -> Self {
        Self {
            heartbeat_interval: 1,
            ..Self::default()
        }
    }

    pub fn routes(&self) -> impl Iterator<Item = &Route> {
        self.routes.values()
    }

    fn topology_changed(&mut self) {
        self.heartbeat_interval = 1;
    }

    fn remove_via(&mut self, next_hop: u16) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, r| r.next_hop != next_hop);
        before - self.routes.len()
    }

    fn encode_heartbeat(&mut self, local_sid: u16) -> MeshResult<Vec<u8>> {
        self.seq = self.seq.wrapping_add(1);
        let entries: Vec<&Route> = self.routes.values().take(u8::MAX as usize).collect();
        let mut w = Writer::new();
        w.write_u8(COMMAND_HEARTBEAT)?;
        w.write_u8(self.seq)?;
        w.write_u16_le(local_sid)?;
        w.write_u8(entries.len() as u8)?;
        for route in entries {
            w.write_u16_le(route.dest)?;
            w.write_u16_le(route.cost)?;
        }
        Ok(w.into_inner())
    }

    fn handle_heartbeat(&mut self, ctx: &RouteContext<'_>, from_sid: u16, r: &mut Reader<'_>) -> MeshResult<()> {
        let seq = r.read_u8()?;
        let sender = r.read_u16_le()?;
        if sender != from_sid || sender == ctx.local_sid {
            return Err(MeshError::Drop);
        }
        if let Some(last) = self.peer_seq.get(&sender) {
            if (seq.wrapping_sub(*last) as i8) <= 0 {
                return Err(MeshError::Drop);
            }
        }
        self.peer_seq.insert(sender, seq);

        let link_cost = ctx.link_cost(sender).ok_or(MeshError::Drop)?;
        let count = r.read_u8()? as usize;
        let mut advertised = Vec::with_capacity(count);
        for _ in 0..count {
            advertised.push((r.read_u16_le()?, r.read_u16_le()?));
        }

        let mut changed = false;
        // Drop what the sender no longer advertises
        let withdrawn: Vec<u16> = self
            .routes
            .values()
            .filter(|route| route.next_hop == sender && route.dest != sender)
            .filter(|route| !advertised.iter().any(|(dest, _)| *dest == route.dest))
            .map(|route| route.dest)
            .collect();
        for dest in withdrawn {
            self.routes.remove(&dest);
            changed = true;
        }

        for (dest, cost) in advertised {
            if dest == ctx.local_sid || dest == sender || !is_unique_sid(dest) {
                continue;
            }
            let total = cost.saturating_add(link_cost);
            if total >= INFINITY_PATH_COST {
                if self.routes.get(&dest).is_some_and(|r| r.next_hop == sender) {
                    self.routes.remove(&dest);
                    changed = true;
                }
                continue;
            }
            match self.routes.get_mut(&dest) {
                Some(route) if route.next_hop == sender => {
                    changed |= route.cost != total;
                    route.cost = total;
                    route.age = 0;
                }
                Some(route) if total < route.cost => {
                    route.next_hop = sender;
                    route.cost = total;
                    route.age = 0;
                    changed = true;
                }
                Some(_) => {}
                None => {
                    self.routes.insert(
                        dest,
                        Route {
                            dest,
                            next_hop: sender,
                            cost: total,
                            age: 0,
                        },
                    );
                    changed = true;
                }
            }
        }
        if changed {
            debug!(from = format_args!("{:04x}", sender), routes = self.routes.len(), "routing table updated");
            self.topology_changed();
        }
        Ok(())
    }
}

impl RouterPolicy for VectorRouter {
    fn id(&self) -> u8 {
        VECTOR_ROUTER
    }

    fn kind(&self) -> RouterKind {
        RouterKind::Vector
    }

    fn start(&mut self, local_sid: u16) {
        if self.local_sid != Some(local_sid) {
            self.routes.clear();
            self.peer_seq.clear();
        }
        self.local_sid = Some(local_sid);
        self.heartbeat_count = 0;
        self.heartbeat_interval = 1;
    }

    fn stop(&mut self) {
        self.local_sid = None;
        self.routes.clear();
        self.peer_seq.clear();
    }

    fn get_next_hop_sid(&self, ctx: &RouteContext<'_>, dest: u16) -> u16 {
        if dest == ctx.local_sid {
            return dest;
        }
        self.routes
            .get(&dest)
            .map(|r| r.next_hop)
            .unwrap_or(INVALID_SID)
    }

    fn handle_neighbor_updated(&mut self, neighbor: &NeighborRoute) {
        if self.local_sid.is_none() || !is_unique_sid(neighbor.sid) {
            return;
        }
        if neighbor.state == NeighborState::Invalid {
            self.peer_seq.remove(&neighbor.sid);
            if self.remove_via(neighbor.sid) > 0 {
                self.topology_changed();
            }
            return;
        }
        let direct = Route {
            dest: neighbor.sid,
            next_hop: neighbor.sid,
            cost: neighbor.link_cost,
            age: 0,
        };
        match self.routes.get_mut(&neighbor.sid) {
            Some(route) if route.next_hop == neighbor.sid || neighbor.link_cost <= route.cost => {
                *route = direct;
            }
            Some(_) => {}
            None => {
                self.routes.insert(neighbor.sid, direct);
                self.topology_changed();
            }
        }
    }

    fn handle_message_received(&mut self, ctx: &RouteContext<'_>, from_sid: u16, payload: &[u8]) -> MeshResult<()> {
        if self.local_sid.is_none() {
            return Err(MeshError::Fail);
        }
        let mut r = Reader::new(payload);
        match r.read_u8()? {
            COMMAND_HEARTBEAT => self.handle_heartbeat(ctx, from_sid, &mut r),
            _ => Err(MeshError::Parse("router command")),
        }
    }

    fn new_allocator(&self, _local_sid: u16, state: DeviceState) -> SidAllocator {
        if state == DeviceState::Leader {
            SidAllocator::Random(RandomAllocator::new())
        } else {
            SidAllocator::None
        }
    }

    fn periodic_interval(&self) -> Option<u64> {
        Some(HEARTBEAT_TICK_MS)
    }

    fn periodic(&mut self, ctx: &RouteContext<'_>) -> Option<Vec<u8>> {
        let local_sid = self.local_sid?;

        for route in self.routes.values_mut() {
            route.age = route.age.saturating_add(1);
        }
        for nbr in ctx.neighbors.iter().filter(|n| n.state > NeighborState::Invalid) {
            self.handle_neighbor_updated(nbr);
        }
        let before = self.routes.len();
        self.routes.retain(|_, r| r.age < ROUTE_ALIVE_TICKS);
        if self.routes.len() != before {
            self.topology_changed();
        }

        self.heartbeat_count += 1;
        if self.heartbeat_count < self.heartbeat_interval {
            return None;
        }
        self.heartbeat_count = 0;
        self.heartbeat_interval = (self.heartbeat_interval * 2).min(MAX_HEARTBEAT_TICKS);
        self.encode_heartbeat(local_sid).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nbr(sid: u16, cost: u16) -> NeighborRoute {
        NeighborRoute {
            sid,
            netid: 0x1200,
            link_cost: cost,
            state: NeighborState::Neighbor,
        }
    }

    fn ctx<'a>(local_sid: u16, neighbors: &'a [NeighborRoute]) -> RouteContext<'a> {
        RouteContext {
            local_sid,
            netid: 0x1200,
            parent_sid: None,
            state: DeviceState::Router,
            neighbors,
        }
    }

    fn heartbeat(seq: u8, sid: u16, routes: &[(u16, u16)]) -> Vec<u8> {
        let mut w = Writer::new();
        w.write_u8(COMMAND_HEARTBEAT).unwrap();
        w.write_u8(seq).unwrap();
        w.write_u16_le(sid).unwrap();
        w.write_u8(routes.len() as u8).unwrap();
        for (dest, cost) in routes {
            w.write_u16_le(*dest).unwrap();
            w.write_u16_le(*cost).unwrap();
        }
        w.into_inner()
    }

    #[test]
    fn test_learns_cheapest_next_hop() {
        let neighbors = [nbr(0x10, 256), nbr(0x20, 512)];
        let c = ctx(0x01, &neighbors);
        let mut router = VectorRouter::new();
        router.start(0x01);
        for n in &neighbors {
            router.handle_neighbor_updated(n);
        }
        router
            .handle_message_received(&c, 0x20, &heartbeat(1, 0x20, &[(0x99, 256)]))
            .unwrap();
        assert_eq!(router.get_next_hop_sid(&c, 0x99), 0x20);
        router
            .handle_message_received(&c, 0x10, &heartbeat(1, 0x10, &[(0x99, 256)]))
            .unwrap();
        assert_eq!(router.get_next_hop_sid(&c, 0x99), 0x10);
        assert_eq!(router.get_next_hop_sid(&c, 0x20), 0x20);
        assert_eq!(router.get_next_hop_sid(&c, 0x55), INVALID_SID);
    }

    #[test]
    fn test_stale_sequence_dropped() {
        let neighbors = [nbr(0x10, 256)];
        let c = ctx(0x01, &neighbors);
        let mut router = VectorRouter::new();
        router.start(0x01);
        router
            .handle_message_received(&c, 0x10, &heartbeat(5, 0x10, &[]))
            .unwrap();
        assert_eq!(
            router.handle_message_received(&c, 0x10, &heartbeat(5, 0x10, &[])),
            Err(MeshError::Drop)
        );
    }

    #[test]
    fn test_withdrawn_route_removed() {
        let neighbors = [nbr(0x10, 256)];
        let c = ctx(0x01, &neighbors);
        let mut router = VectorRouter::new();
        router.start(0x01);
        router
            .handle_message_received(&c, 0x10, &heartbeat(1, 0x10, &[(0x77, 100)]))
            .unwrap();
        assert_eq!(router.get_next_hop_sid(&c, 0x77), 0x10);
        router
            .handle_message_received(&c, 0x10, &heartbeat(2, 0x10, &[]))
            .unwrap();
        assert_eq!(router.get_next_hop_sid(&c, 0x77), INVALID_SID);
    }

    #[test]
    fn test_lost_neighbor_drops_routes() {
        let neighbors = [nbr(0x10, 256)];
        let c = ctx(0x01, &neighbors);
        let mut router = VectorRouter::new();
        router.start(0x01);
        router.handle_neighbor_updated(&neighbors[0]);
        router
            .handle_message_received(&c, 0x10, &heartbeat(1, 0x10, &[(0x77, 100)]))
            .unwrap();
        let mut gone = neighbors[0];
        gone.state = NeighborState::Invalid;
        router.handle_neighbor_updated(&gone);
        assert_eq!(router.routes().count(), 0);
    }

    #[test]
    fn test_heartbeat_backoff() {
        let neighbors = [nbr(0x10, 256)];
        let c = ctx(0x01, &neighbors);
        let mut router = VectorRouter::new();
        router.start(0x01);
        let first = router.periodic(&c).unwrap();
        assert_eq!(first[0], COMMAND_HEARTBEAT);
        assert_eq!(&first[2..4], &[0x01, 0x00]);
        assert_eq!(first[4], 1);
        // Interval doubled to two ticks
        assert!(router.periodic(&c).is_none());
        assert!(router.periodic(&c).is_some());
    }

    #[test]
    fn test_random_allocator_on_leader_only() {
        let router = VectorRouter::new();
        assert!(matches!(
            router.new_allocator(0, DeviceState::Leader),
            SidAllocator::Random(_)
        ));
        assert!(matches!(
            router.new_allocator(0x1234, DeviceState::Router),
            SidAllocator::None
        ));
    }
}
