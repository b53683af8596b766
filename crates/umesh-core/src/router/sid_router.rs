//! Structured-SID tree router
//!
//! Routes purely from the address: a destination below us in the tree goes
//! to the child whose prefix contains it, anything else goes to the parent.

use super::{NeighborRoute, RouteContext, RouterPolicy, SID_ROUTER};
use crate::config::RouterKind;
use crate::error::{MeshError, MeshResult};
use crate::sid_allocator::{is_descendant, sid_shift, SidAllocator, StructuredAllocator};
use crate::types::{is_partial_function_sid, DeviceState, INVALID_SID};

#[derive(Debug, Default)]
pub struct SidRouter {
    local_sid: Option<u16>,
}

impl SidRouter {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Child of `local` on the way down to `dest`
fn child_towards(local: u16, dest: u16) -> Option<u16> {
    let shift = sid_shift(local);
    if shift < 0 {
        return None;
    }
    let low_mask = ((1u32 << shift as u32) - 1) as u16;
    Some(dest & !low_mask)
}

impl RouterPolicy for SidRouter {
    fn id(&self) -> u8 {
        SID_ROUTER
    }

    fn kind(&self) -> RouterKind {
        RouterKind::Sid
    }

    fn start(&mut self, local_sid: u16) {
        self.local_sid = Some(local_sid);
    }

    fn stop(&mut self) {
        self.local_sid = None;
    }

    fn get_next_hop_sid(&self, ctx: &RouteContext<'_>, dest: u16) -> u16 {
        if dest == ctx.local_sid {
            return dest;
        }
        if is_partial_function_sid(dest) {
            // Flat mobile SIDs are reached through their attach router
            return INVALID_SID;
        }
        if is_descendant(ctx.local_sid, dest) {
            return child_towards(ctx.local_sid, dest).unwrap_or(INVALID_SID);
        }
        ctx.parent_sid.unwrap_or(INVALID_SID)
    }

    fn handle_neighbor_updated(&mut self, _neighbor: &NeighborRoute) {}

    fn handle_message_received(&mut self, _ctx: &RouteContext<'_>, _from_sid: u16, _payload: &[u8]) -> MeshResult<()> {
        Err(MeshError::Fail)
    }

    fn new_allocator(&self, local_sid: u16, state: DeviceState) -> SidAllocator {
        match state {
            DeviceState::Leader | DeviceState::SuperRouter | DeviceState::Router => {
                SidAllocator::Structured(StructuredAllocator::new(local_sid))
            }
            _ => SidAllocator::None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::LEADER_SID;

    fn ctx(local_sid: u16, parent_sid: Option<u16>) -> RouteContext<'static> {
        RouteContext {
            local_sid,
            netid: 0x1200,
            parent_sid,
            state: DeviceState::Router,
            neighbors: &[],
        }
    }

    #[test]
    fn test_routes_down_the_tree() {
        let router = SidRouter::new();
        assert_eq!(router.get_next_hop_sid(&ctx(LEADER_SID, None), 0x1234), 0x1000);
        assert_eq!(router.get_next_hop_sid(&ctx(0x1000, Some(0)), 0x1234), 0x1200);
        assert_eq!(router.get_next_hop_sid(&ctx(0x1200, Some(0x1000)), 0x1230), 0x1230);
    }

    #[test]
    fn test_routes_up_to_parent() {
        let router = SidRouter::new();
        assert_eq!(router.get_next_hop_sid(&ctx(0x1200, Some(0x1000)), 0x2000), 0x1000);
        assert_eq!(router.get_next_hop_sid(&ctx(0x1000, Some(0)), LEADER_SID), LEADER_SID);
        assert_eq!(router.get_next_hop_sid(&ctx(0x1000, None), 0x2000), INVALID_SID);
    }

    #[test]
    fn test_mobile_sid_not_routable() {
        let router = SidRouter::new();
        assert_eq!(router.get_next_hop_sid(&ctx(LEADER_SID, None), 0xc003), INVALID_SID);
    }

    #[test]
    fn test_allocator_by_state() {
        let router = SidRouter::new();
        assert!(router.new_allocator(LEADER_SID, DeviceState::Leader).is_structured());
        assert!(!router.new_allocator(0x1231, DeviceState::Leaf).is_structured());
    }
}
