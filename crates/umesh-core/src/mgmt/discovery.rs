//! Active discovery: scan the configured channels for networks to join
//!
//! A scan sends a DISCOVERY_REQUEST on every channel in turn, one per
//! discovery interval, for up to `DISCOVERY_RETRY_TIMES` rounds. Answers
//! are ranked by leader capability, then network size, then path cost.
//! When the scan ends without a network worth joining a detached node
//! forms its own; a leader just schedules its next periodic scan.

use crate::command;
use crate::error::{MeshError, MeshResult};
use crate::message::MessageInfo;
use crate::network_data::stable_meshnetid;
use crate::node::MeshNode;
use crate::timer::TimerKind;
use crate::tlv::{NetworkInfo, Tlv, Tlvs};
use crate::types::{
    compare_mode, get_main_netid, is_same_mainnet, is_unique_netid, DeviceState, ExtAddr, InterfaceDownReason,
    MeshAddr, Mode, BCAST_NETID, BCAST_SID,
};
use tracing::{debug, info};

/// Scan rounds over all channels
pub const DISCOVERY_RETRY_TIMES: u8 = 4;
/// Pause between scans of a leader, or after a failed attach
pub const ACTIVE_DISCOVER_INTERVAL_MS: u64 = 60_000;

/// Best network heard during a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiscoverResult {
    pub hal: usize,
    pub mac: ExtAddr,
    pub channel: u8,
    pub meshnetid: u16,
    pub network_info: NetworkInfo,
    pub path_cost: u16,
}

impl DiscoverResult {
    /// Whether `other` is a better network to join than `self`
    fn is_worse_than(&self, other: &DiscoverResult) -> bool {
        match compare_mode(self.network_info.leader_mode, other.network_info.leader_mode) {
            0 => {}
            cmp => return cmp < 0,
        }
        if self.network_info.size != other.network_info.size {
            return other.network_info.size > self.network_info.size;
        }
        other.path_cost < self.path_cost
    }
}

/// Scan progress
#[derive(Debug, Clone, Default)]
pub struct DiscoveryContext {
    pub started: bool,
    pub channel_index: usize,
    pub times: u8,
    pub result: Option<DiscoverResult>,
    /// Channel to restore when a scan of an attached node ends
    pub prev_channel: Option<u8>,
}

impl MeshNode {
    /// Begin a scan unless one runs already
    pub(crate) fn start_discover(&mut self) {
        if self.mode.contains(Mode::LEADER) || self.discovery.started || self.hals.is_empty() {
            return;
        }
        debug!("discovery started");
        self.discovery = DiscoveryContext {
            started: true,
            prev_channel: Some(self.hals[0].driver.channel()),
            ..DiscoveryContext::default()
        };
        self.event_loop.stop_timer(TimerKind::DiscoveryStart);
        self.event_loop.start_timer(TimerKind::Discovery, 0);
    }

    /// Schedule the next scan
    pub(crate) fn start_discover_timer(&mut self) {
        if self.mode.contains(Mode::LEADER) {
            return;
        }
        self.event_loop
            .start_timer(TimerKind::DiscoveryStart, ACTIVE_DISCOVER_INTERVAL_MS);
    }

    pub(crate) fn stop_discover(&mut self) {
        self.discovery.started = false;
        self.event_loop.stop_timer(TimerKind::Discovery);
        self.event_loop.stop_timer(TimerKind::DiscoveryStart);
    }

    pub fn is_discovering(&self) -> bool {
        self.discovery.started
    }

    fn send_discovery_request(&mut self) -> MeshResult<()> {
        let tlvs = vec![Tlv::RebootFlag(self.reboot_flag as u8)];
        self.send_command(0, command::DISCOVERY_REQUEST, MeshAddr::short(BCAST_NETID, BCAST_SID), &tlvs)
    }

    /// One scan step: next channel, or evaluate the scan
    pub(crate) fn handle_discovery_timer(&mut self) {
        if !self.discovery.started || self.hals.is_empty() {
            return;
        }
        let channels = if self.config.channels.is_empty() {
            vec![self.hals[0].driver.channel()]
        } else {
            self.config.channels.clone()
        };
        if self.discovery.channel_index >= channels.len() {
            self.discovery.channel_index = 0;
            self.discovery.times += 1;
        }

        let migrate = match self.discovery.result {
            Some(result) => self.migration_check(result.hal, result.mac, &result.network_info),
            None => false,
        };
        if !self.discovery.started {
            return;
        }
        if self.discovery.times < DISCOVERY_RETRY_TIMES && !migrate {
            let channel = channels[self.discovery.channel_index];
            self.discovery.channel_index += 1;
            if let Err(err) = self.set_channel(0, channel) {
                debug!(channel, reason = %err, "channel switch failed");
            }
            if let Err(err) = self.send_discovery_request() {
                debug!(reason = %err, "discovery request not sent");
            }
            let interval = self.hals[0].timings.discovery_interval_ms;
            self.event_loop.start_timer(TimerKind::Discovery, interval);
            return;
        }

        self.discovery.started = false;
        let result = self.discovery.result.take();
        if migrate {
            if let Some(result) = result {
                let _ = self.set_channel(result.hal, result.channel);
                self.nbr_discovered(Some(result));
            }
        } else if self.state >= DeviceState::Leaf {
            if let Some(channel) = self.discovery.prev_channel.take() {
                let _ = self.set_channel(0, channel);
            }
            self.start_discover_timer();
        } else {
            if let Some(channel) = channels.first().copied() {
                let _ = self.set_channel(0, channel);
            }
            self.nbr_discovered(None);
        }
    }

    /// Act on the outcome of a scan
    fn nbr_discovered(&mut self, result: Option<DiscoverResult>) {
        match result {
            Some(result) => {
                info!(
                    netid = format_args!("{:04x}", result.meshnetid),
                    channel = result.channel,
                    "network discovered"
                );
                if let Err(err) = self.attach_start(Some((result.hal, result.mac))) {
                    debug!(reason = %err, "attach after discovery failed");
                }
            }
            None if !self.mode.is_mobile() => {
                if let Err(err) = self.become_leader() {
                    debug!(reason = %err, "could not become leader");
                }
            }
            None => self.become_detached(InterfaceDownReason::DiscoverFail),
        }
    }

    pub(crate) fn handle_discovery_request(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        let mac = self.update_neighbor(info, tlvs, true).ok_or(MeshError::Drop)?;
        if self.state < DeviceState::Leaf || self.mode.is_mobile() {
            return Err(MeshError::Drop);
        }
        let rebooted = tlvs.reboot_flag().unwrap_or(0) != 0;
        if let Some(nbr) = self.hals[info.hal].neighbors.get_mut(&mac) {
            if rebooted {
                nbr.flags.set_reboot(true);
            } else {
                nbr.flags.set_discovered(true);
            }
            nbr.flags.set_wakeup(true);
        }

        let network = self.network_for_hal(info.hal);
        let mut out = vec![
            Tlv::NetworkInfo(self.local_network_info(network)),
            Tlv::Channel(self.hals[info.hal].driver.channel()),
        ];
        let allocator = &self.networks[network].allocator;
        if allocator.is_structured() {
            out.push(Tlv::SsidInfo(allocator.ssid_info()));
        }
        out.push(Tlv::PathCost(self.attach.path_cost));
        let netid = self.networks[network].meshnetid;
        self.send_command(info.hal, command::DISCOVERY_RESPONSE, MeshAddr::ext(netid, mac), &out)
    }

    pub(crate) fn handle_discovery_response(&mut self, info: &MessageInfo, tlvs: &Tlvs) -> MeshResult<()> {
        let mac = self.update_neighbor(info, tlvs, true).ok_or(MeshError::Drop)?;
        if self.state != DeviceState::Detached && !self.discovery.started {
            return Err(MeshError::Drop);
        }
        if let Some(nbr) = self.hals[info.hal].neighbors.get_mut(&mac) {
            nbr.flags.set_discovered(false);
        }
        let network_info = tlvs.network_info().ok_or(MeshError::Drop)?;
        let netid = info.src.netid;
        let free_slots = tlvs.ssid_info().map(|s| s.free_slots);
        let own_mainnet = stable_meshnetid(&self.uuid, self.mode);
        if !is_unique_netid(netid)
            || (self.state >= DeviceState::Leaf && is_same_mainnet(netid, self.main_netid()))
            || (self.state < DeviceState::Leaf && get_main_netid(netid) == own_mainnet)
            || free_slots == Some(0)
        {
            return Ok(());
        }

        let candidate = DiscoverResult {
            hal: info.hal,
            mac,
            channel: tlvs.channel().unwrap_or_else(|| self.hals[info.hal].driver.channel()),
            meshnetid: netid,
            network_info,
            path_cost: tlvs.path_cost().unwrap_or(u16::MAX),
        };
        let replace = match &self.discovery.result {
            None => true,
            Some(best) => best.is_worse_than(&candidate),
        };
        if replace {
            debug!(%mac, netid = format_args!("{:04x}", netid), "discovery candidate");
            self.discovery.result = Some(candidate);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(mode: Mode, size: u16, path_cost: u16) -> DiscoverResult {
        DiscoverResult {
            hal: 0,
            mac: ExtAddr([1; 8]),
            channel: 1,
            meshnetid: 0x1200,
            network_info: NetworkInfo {
                main_version: 0,
                version: 0,
                size,
                subnet_size: size,
                leader_mode: mode,
            },
            path_cost,
        }
    }

    #[test]
    fn test_ranking_prefers_capable_leader() {
        let plain = result(Mode::RX_ON, 50, 0);
        let super_leader = result(Mode::RX_ON.with(Mode::SUPER), 2, 512);
        assert!(plain.is_worse_than(&super_leader));
        assert!(!super_leader.is_worse_than(&plain));
    }

    #[test]
    fn test_ranking_by_size_then_cost() {
        let small = result(Mode::RX_ON, 3, 0);
        let big = result(Mode::RX_ON, 10, 1024);
        assert!(small.is_worse_than(&big));

        let far = result(Mode::RX_ON, 10, 1024);
        let near = result(Mode::RX_ON, 10, 256);
        assert!(far.is_worse_than(&near));
        assert!(!near.is_worse_than(&far));
    }
}
