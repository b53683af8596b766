//! Addressing and role types shared across the mesh engine
//!
//! A node is known by its 8-byte extended address (which doubles as its
//! uuid) and, once attached, by a 16-bit short id (SID) inside a mesh
//! network identified by a 16-bit meshnetid. The high byte of a meshnetid
//! names the main network; a non-zero low byte names a subnet of it.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Extended (MAC) address length in bytes
pub const EXT_ADDR_SIZE: usize = 8;
/// Short address length in bytes
pub const SHORT_ADDR_SIZE: usize = 2;

/// SID of the network leader
pub const LEADER_SID: u16 = 0x0000;
/// Broadcast SID
pub const BCAST_SID: u16 = 0xffff;
/// Unassigned SID
pub const INVALID_SID: u16 = 0xfffe;
/// Broadcast meshnetid
pub const BCAST_NETID: u16 = 0xffff;
/// Unassigned meshnetid
pub const INVALID_NETID: u16 = 0xfffe;
/// Path cost of an unreachable network
pub const INFINITY_PATH_COST: u16 = 0xffff;

/// Top nibble marking partial-function (mobile) SIDs
pub const MOBILE_PREFIX: u16 = 0xc;
/// Bit offset of the mobile prefix inside a SID
pub const PF_SID_PREFIX_OFFSET: u16 = 12;

/// Whether a meshnetid names a subnet rather than a main network
pub fn is_subnet(netid: u16) -> bool {
    netid & 0x00ff != 0
}

/// Main network part of a meshnetid
pub fn get_main_netid(netid: u16) -> u16 {
    netid & 0xff00
}

/// Subnet part of a meshnetid
pub fn get_sub_netid(netid: u16) -> u8 {
    (netid & 0x00ff) as u8
}

/// Build a meshnetid from a main network id and a subnet byte
pub fn mk_sub_netid(main: u16, sub: u8) -> u16 {
    get_main_netid(main) | sub as u16
}

/// Whether two meshnetids belong to the same main network
pub fn is_same_mainnet(a: u16, b: u16) -> bool {
    get_main_netid(a) == get_main_netid(b)
}

/// Whether a meshnetid identifies one concrete network
pub fn is_unique_netid(netid: u16) -> bool {
    netid != BCAST_NETID && netid != INVALID_NETID
}

/// Whether a SID identifies one concrete node
pub fn is_unique_sid(sid: u16) -> bool {
    sid != BCAST_SID && sid != INVALID_SID
}

/// Whether a SID was allocated from the partial-function (mobile) pool
pub fn is_partial_function_sid(sid: u16) -> bool {
    is_unique_sid(sid) && (sid >> PF_SID_PREFIX_OFFSET) == MOBILE_PREFIX
}

/// Subnet netid generated by a super router for one of its networks
///
/// The low byte packs the super router's top SID nibble and the network
/// index, so the subnet leader can be recovered from the netid alone.
pub fn generate_sub_netid(main: u16, sid: u16, index: u8) -> u16 {
    let prefix = ((sid >> 12) as u8) << 2;
    mk_sub_netid(main, prefix | (index & 0x03))
}

/// SID of the leader of the network `netid`
pub fn get_leader_sid(netid: u16) -> u16 {
    if is_subnet(netid) {
        ((get_sub_netid(netid) >> 2) as u16) << 12
    } else {
        LEADER_SID
    }
}

/// 8-byte extended address, also used as the node uuid
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct ExtAddr(pub [u8; EXT_ADDR_SIZE]);

impl ExtAddr {
    /// All-ones broadcast mac
    pub const BROADCAST: ExtAddr = ExtAddr([0xff; EXT_ADDR_SIZE]);

    /// Create from raw bytes
    pub fn from_bytes(bytes: [u8; EXT_ADDR_SIZE]) -> Self {
        Self(bytes)
    }

    /// Parse from a slice of exactly 8 bytes
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; EXT_ADDR_SIZE] = bytes.try_into().ok()?;
        Some(Self(arr))
    }

    /// Generate a random locally administered address
    pub fn random() -> Self {
        let mut bytes = [0u8; EXT_ADDR_SIZE];
        rand::thread_rng().fill(&mut bytes);
        bytes[0] = (bytes[0] & 0xfc) | 0x02;
        Self(bytes)
    }

    /// Raw bytes
    pub fn as_bytes(&self) -> &[u8; EXT_ADDR_SIZE] {
        &self.0
    }

    /// Whether this is the broadcast mac
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }
}

impl fmt::Display for ExtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let octets: Vec<String> = self.0.iter().map(|b| hex::encode([*b])).collect();
        write!(f, "{}", octets.join(":"))
    }
}

impl std::str::FromStr for ExtAddr {
    type Err = crate::error::MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        let mut bytes = [0u8; EXT_ADDR_SIZE];
        hex::decode_to_slice(&digits, &mut bytes).map_err(|e| match e {
            hex::FromHexError::InvalidStringLength | hex::FromHexError::OddLength => {
                crate::error::MeshError::Parse("extended address length")
            }
            hex::FromHexError::InvalidHexCharacter { .. } => crate::error::MeshError::Parse("extended address digit"),
        })?;
        Ok(Self(bytes))
    }
}

/// Link-layer part of a mesh address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Addr {
    /// No address present
    None,
    /// 16-bit SID
    Short(u16),
    /// Extended address
    Ext(ExtAddr),
    /// Broadcast (no bytes on the wire)
    Bcast,
}

impl Addr {
    /// Encoded length on the wire
    pub fn wire_len(&self) -> usize {
        match self {
            Addr::None | Addr::Bcast => 0,
            Addr::Short(_) => SHORT_ADDR_SIZE,
            Addr::Ext(_) => EXT_ADDR_SIZE,
        }
    }

    /// Whether this address reaches every node
    pub fn is_broadcast(&self) -> bool {
        matches!(self, Addr::Bcast | Addr::Short(BCAST_SID))
    }
}

/// Network-qualified address
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MeshAddr {
    pub netid: u16,
    pub addr: Addr,
}

impl MeshAddr {
    /// Address with nothing set
    pub const NONE: MeshAddr = MeshAddr {
        netid: BCAST_NETID,
        addr: Addr::None,
    };

    pub fn short(netid: u16, sid: u16) -> Self {
        Self {
            netid,
            addr: Addr::Short(sid),
        }
    }

    pub fn ext(netid: u16, mac: ExtAddr) -> Self {
        Self {
            netid,
            addr: Addr::Ext(mac),
        }
    }

    pub fn bcast(netid: u16) -> Self {
        Self {
            netid,
            addr: Addr::Bcast,
        }
    }

    /// SID when this is a short address
    pub fn sid(&self) -> Option<u16> {
        match self.addr {
            Addr::Short(sid) => Some(sid),
            _ => None,
        }
    }

    /// Mac when this is an extended address
    pub fn mac(&self) -> Option<ExtAddr> {
        match self.addr {
            Addr::Ext(mac) => Some(mac),
            _ => None,
        }
    }

    /// Whether the address is absent
    pub fn is_none(&self) -> bool {
        self.addr == Addr::None
    }

    /// Broadcast SID or broadcast mode
    pub fn is_broadcast(&self) -> bool {
        self.addr.is_broadcast()
    }
}

impl fmt::Display for MeshAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.addr {
            Addr::None => write!(f, "{:04x}/-", self.netid),
            Addr::Short(sid) => write!(f, "{:04x}/{:04x}", self.netid, sid),
            Addr::Ext(mac) => write!(f, "{:04x}/{}", self.netid, mac),
            Addr::Bcast => write!(f, "{:04x}/*", self.netid),
        }
    }
}

/// Device capability bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Mode(pub u8);

impl Mode {
    pub const NONE: Mode = Mode(0x00);
    /// Mobile node, never a parent, gets a partial-function SID
    pub const MOBILE: Mode = Mode(0x01);
    /// Radio always on; cleared for low-power sleepy devices
    pub const RX_ON: Mode = Mode(0x02);
    /// Leader-capable marker carried in network info
    pub const LEADER: Mode = Mode(0x04);
    /// Super router bridging several HALs
    pub const SUPER: Mode = Mode(0x10);

    /// Bits compared as "capability level"
    pub const HI_MASK: u8 = 0xf0;
    /// Bits where a set bit means lower capability
    pub const LOW_MASK: u8 = 0x01;

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn contains(&self, other: Mode) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Mode) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Mode) {
        self.0 &= !other.0;
    }

    pub fn with(mut self, other: Mode) -> Mode {
        self.insert(other);
        self
    }

    pub fn without(mut self, other: Mode) -> Mode {
        self.remove(other);
        self
    }

    pub fn is_mobile(&self) -> bool {
        self.contains(Mode::MOBILE)
    }

    pub fn is_rx_on(&self) -> bool {
        self.contains(Mode::RX_ON)
    }

    pub fn is_super(&self) -> bool {
        self.contains(Mode::SUPER)
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names = Vec::new();
        if self.contains(Mode::MOBILE) {
            names.push("MOBILE");
        }
        if self.contains(Mode::RX_ON) {
            names.push("RX_ON");
        }
        if self.contains(Mode::LEADER) {
            names.push("LEADER");
        }
        if self.contains(Mode::SUPER) {
            names.push("SUPER");
        }
        if names.is_empty() {
            write!(f, "NONE")
        } else {
            write!(f, "{}", names.join("|"))
        }
    }
}

/// Compare two capability modes
///
/// Returns 1 when `local` is more capable than `other`, -1 when less,
/// 0 when equal. `RX_ON` does not take part in the comparison.
pub fn compare_mode(local: Mode, other: Mode) -> i8 {
    let local_hi = local.0 & Mode::HI_MASK;
    let other_hi = other.0 & Mode::HI_MASK;
    if local_hi != other_hi {
        return if local_hi > other_hi { 1 } else { -1 };
    }
    let local_low = local.0 & Mode::LOW_MASK;
    let other_low = other.0 & Mode::LOW_MASK;
    if local_low == other_low {
        0
    } else if local_low > other_low {
        -1
    } else {
        1
    }
}

/// Device role
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum DeviceState {
    Disabled,
    Detached,
    Attached,
    Leaf,
    Router,
    SuperRouter,
    Leader,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Disabled => "disabled",
            DeviceState::Detached => "detached",
            DeviceState::Attached => "attached",
            DeviceState::Leaf => "leaf",
            DeviceState::Router => "router",
            DeviceState::SuperRouter => "super_router",
            DeviceState::Leader => "leader",
        };
        write!(f, "{}", s)
    }
}

/// Node type assigned together with a SID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    Leaf,
    Router,
    SuperRouter,
}

impl NodeType {
    pub fn to_u8(self) -> u8 {
        match self {
            NodeType::Leaf => 0x01,
            NodeType::Router => 0x02,
            NodeType::SuperRouter => 0x04,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0x01 => Some(NodeType::Leaf),
            0x02 => Some(NodeType::Router),
            0x04 => Some(NodeType::SuperRouter),
            _ => None,
        }
    }

    /// Device state a node moves into once it owns this type
    pub fn device_state(self) -> DeviceState {
        match self {
            NodeType::Leaf => DeviceState::Leaf,
            NodeType::Router => DeviceState::Router,
            NodeType::SuperRouter => DeviceState::SuperRouter,
        }
    }
}

/// Radio media type of a HAL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaType {
    Wifi,
    Ble,
    Ieee154,
}

impl MediaType {
    pub fn to_u8(self) -> u8 {
        match self {
            MediaType::Wifi => 1,
            MediaType::Ble => 2,
            MediaType::Ieee154 => 3,
        }
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(MediaType::Wifi),
            2 => Some(MediaType::Ble),
            3 => Some(MediaType::Ieee154),
            _ => None,
        }
    }
}

impl std::str::FromStr for MediaType {
    type Err = crate::error::MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "wifi" => Ok(MediaType::Wifi),
            "ble" => Ok(MediaType::Ble),
            "154" | "15.4" | "ieee154" => Ok(MediaType::Ieee154),
            _ => Err(crate::error::MeshError::Parse("media type")),
        }
    }
}

/// Frame type carried in the mesh header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameType {
    Cmd,
    Data,
}

/// Why the mesh interface went down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterfaceDownReason {
    MeshStart,
    MeshStop,
    AttachFail,
    DiscoverFail,
    ParentNetidChanged,
    AuthFail,
    /// Our leader restarted and its network must be rejoined
    LeaderReboot,
    /// A more capable leader appeared
    LeaderMode,
}

/// Node identity as carried in NODE_ID TLVs and SID cache entries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeId {
    pub sid: u16,
    pub mode: Mode,
    pub meshnetid: u16,
}

impl NodeId {
    pub fn new(sid: u16, mode: Mode, meshnetid: u16) -> Self {
        Self {
            sid,
            mode,
            meshnetid,
        }
    }

    pub fn invalid() -> Self {
        Self::new(INVALID_SID, Mode::NONE, INVALID_NETID)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_netid_helpers() {
        assert!(!is_subnet(0x1200));
        assert!(is_subnet(0x1205));
        assert_eq!(get_main_netid(0x1205), 0x1200);
        assert_eq!(get_sub_netid(0x1205), 0x05);
        assert!(is_same_mainnet(0x1205, 0x1200));
        assert!(!is_same_mainnet(0x1300, 0x1200));
        assert!(!is_unique_netid(BCAST_NETID));
        assert!(is_unique_netid(0x1200));
    }

    #[test]
    fn test_sub_netid_leader() {
        let sub = generate_sub_netid(0x4400, 0x3000, 1);
        assert!(is_subnet(sub));
        assert_eq!(get_leader_sid(sub), 0x3000);
        assert_eq!(get_leader_sid(0x4400), LEADER_SID);
    }

    #[test]
    fn test_partial_function_sid() {
        assert!(is_partial_function_sid(0xc001));
        assert!(!is_partial_function_sid(0x1000));
        assert!(!is_partial_function_sid(BCAST_SID));
    }

    #[test]
    fn test_ext_addr_parse_display() {
        let addr: ExtAddr = "02:11:22:33:44:55:66:77".parse().unwrap();
        assert_eq!(addr.to_string(), "02:11:22:33:44:55:66:77");
        assert!("0211".parse::<ExtAddr>().is_err());
        assert_eq!(
            "02-11-22-33-44-55-66-zz".parse::<ExtAddr>(),
            Err(crate::error::MeshError::Parse("extended address digit"))
        );
        assert_eq!("0211223344556677".parse::<ExtAddr>(), Ok(addr));
        let random = ExtAddr::random();
        assert_eq!(random.0[0] & 0x03, 0x02);
    }

    #[test]
    fn test_compare_mode() {
        let plain = Mode::RX_ON;
        let mobile = Mode::RX_ON.with(Mode::MOBILE);
        let sup = Mode::RX_ON.with(Mode::SUPER);
        assert_eq!(compare_mode(plain, plain), 0);
        assert_eq!(compare_mode(plain, Mode::NONE), 0);
        assert_eq!(compare_mode(mobile, plain), -1);
        assert_eq!(compare_mode(plain, mobile), 1);
        assert_eq!(compare_mode(sup, plain), 1);
        assert_eq!(compare_mode(plain, sup), -1);
    }

    #[test]
    fn test_device_state_order() {
        assert!(DeviceState::Detached < DeviceState::Leaf);
        assert!(DeviceState::Router < DeviceState::Leader);
        assert!(DeviceState::SuperRouter < DeviceState::Leader);
    }
}
