//! Network data: versioned network size and the stable network identity
//!
//! Versions are 8-bit counters compared with a signed difference, so a
//! newer version is accepted across wrap-around. The stable main version
//! only has three bits; the leader bumps it on every reboot and children
//! read a small forward jump as "the leader restarted".

use crate::error::{MeshError, MeshResult};
use crate::node::MeshNode;
use crate::tlv::NetworkInfo;
use crate::types::{get_main_netid, DeviceState, ExtAddr, Mode, INVALID_NETID};
use serde::Serialize;
use tracing::debug;

/// Largest stable main version
pub const MAX_MAIN_VERSION: u8 = 7;
/// Main-version jumps read as a leader reboot
const REBOOT_VERSION_WINDOW: u8 = 3;

/// Versioned dynamic network data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkData {
    pub version: u8,
    /// Number of nodes
    pub size: u16,
}

impl Default for NetworkData {
    fn default() -> Self {
        Self { version: 0, size: 1 }
    }
}

impl NetworkData {
    /// Accept `new` only if its version is strictly newer
    pub fn set(&mut self, new: NetworkData) -> MeshResult<()> {
        if (new.version.wrapping_sub(self.version) as i8) <= 0 {
            return Err(MeshError::Drop);
        }
        *self = new;
        Ok(())
    }

    /// Change the size, bumping the version when it differs
    pub fn set_size(&mut self, size: u16) -> bool {
        if self.size == size {
            return false;
        }
        self.size = size;
        self.version = self.version.wrapping_add(1);
        true
    }
}

/// Network identity that survives attach cycles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StableNetworkData {
    /// 0..=7, bumped on leader reboot
    pub main_version: u8,
    pub minor_version: u16,
    pub meshnetid: u16,
    /// Subscribed multicast group
    pub mcast_addr: [u8; 16],
}

impl Default for StableNetworkData {
    fn default() -> Self {
        Self {
            main_version: 0,
            minor_version: 0,
            meshnetid: INVALID_NETID,
            mcast_addr: mcast_addr_for(INVALID_NETID),
        }
    }
}

impl StableNetworkData {
    /// Accept `new` when its minor version is not older, or while ours is 0
    pub fn set(&mut self, new: StableNetworkData) -> MeshResult<()> {
        if self.minor_version != 0 && new.minor_version < self.minor_version {
            return Err(MeshError::Drop);
        }
        *self = new;
        Ok(())
    }

    pub fn set_main_version(&mut self, version: u8) -> MeshResult<()> {
        if version > MAX_MAIN_VERSION {
            return Err(MeshError::Fail);
        }
        self.main_version = version;
        Ok(())
    }

    pub fn set_meshnetid(&mut self, netid: u16) {
        self.meshnetid = netid;
        self.mcast_addr = mcast_addr_for(netid);
    }
}

/// Multicast group `ff08::<netid>:fc`
pub fn mcast_addr_for(netid: u16) -> [u8; 16] {
    let mut addr = [0u8; 16];
    addr[0] = 0xff;
    addr[1] = 0x08;
    addr[12..14].copy_from_slice(&netid.to_be_bytes());
    addr[15] = 0xfc;
    addr
}

/// Main netid a leader forms from its uuid, invalid for mobile nodes
pub fn stable_meshnetid(uuid: &ExtAddr, mode: Mode) -> u16 {
    if mode.is_mobile() {
        return INVALID_NETID;
    }
    let folded = uuid.as_bytes().iter().fold(0u8, |acc, b| acc ^ b);
    (folded as u16) << 8
}

/// Whether a peer's main version says the leader rebooted
pub fn is_leader_reboot(local_main: u8, peer_main: u8) -> bool {
    let diff = peer_main.wrapping_sub(local_main) & MAX_MAIN_VERSION;
    (1..=REBOOT_VERSION_WINDOW).contains(&diff)
}

/// Global and stable network data of a node
#[derive(Debug, Clone, Default)]
pub struct NetworkDataStore {
    pub global: NetworkData,
    pub stable: StableNetworkData,
}

impl NetworkDataStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forget dynamic data, keeping the stable identity
    pub fn reset(&mut self) {
        self.global = NetworkData::default();
    }
}

impl MeshNode {
    /// Network size, allowed only for a leader or super router
    pub fn set_meshnetsize(&mut self, size: u16) -> MeshResult<()> {
        if !matches!(self.state, DeviceState::Leader | DeviceState::SuperRouter) {
            return Err(MeshError::Fail);
        }
        if self.nd.global.set_size(size) {
            debug!(size, version = self.nd.global.version, "network size changed");
        }
        if let Some(net) = self.networks.first_mut() {
            net.network_data = self.nd.global;
        }
        Ok(())
    }

    pub fn meshnetsize(&self) -> u16 {
        self.nd.global.size
    }

    pub fn network_data_version(&self) -> u8 {
        self.nd.global.version
    }

    /// Network info TLV advertised on `network`
    pub(crate) fn local_network_info(&self, network: usize) -> NetworkInfo {
        let subnet = self
            .networks
            .get(network)
            .map(|n| n.network_data)
            .unwrap_or_default();
        NetworkInfo {
            main_version: self.nd.stable.main_version,
            version: self.nd.global.version,
            size: self.nd.global.size,
            subnet_size: subnet.size,
            leader_mode: self.leader_mode,
        }
    }

    /// Adopt newer network data advertised in our own network
    ///
    /// The stable main version is left alone; a jump in it is how a leader
    /// reboot is detected.
    pub(crate) fn nd_follow_parent(&mut self, network: usize, info: &NetworkInfo) {
        if self.state == DeviceState::Leader {
            return;
        }
        let data = NetworkData {
            version: info.version,
            size: info.size,
        };
        if self.nd.global.set(data).is_ok() {
            debug!(version = info.version, size = info.size, "network data updated");
            self.leader_mode = info.leader_mode;
        }
        if let Some(net) = self.networks.get_mut(network) {
            let _ = net.network_data.set(NetworkData {
                version: info.version,
                size: info.subnet_size,
            });
        }
    }

    /// Take over the network data of the network we just joined
    pub(crate) fn nd_adopt(&mut self, meshnetid: u16, info: &NetworkInfo) {
        self.nd.global = NetworkData {
            version: info.version,
            size: info.size,
        };
        for net in self.networks.iter_mut() {
            net.network_data = NetworkData {
                version: info.version,
                size: info.subnet_size,
            };
        }
        self.nd.stable.set_meshnetid(get_main_netid(meshnetid));
        let _ = self.nd.stable.set_main_version(info.main_version & MAX_MAIN_VERSION);
        self.leader_mode = info.leader_mode;
    }
}
