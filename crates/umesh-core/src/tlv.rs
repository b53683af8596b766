//! Command attribute (TLV) codec
//!
//! Every mesh command body is a one-byte command code followed by a list of
//! attributes. An attribute starts with a one-byte type. When the top bit of
//! the type is set the attribute is a fixed-length TV whose length comes
//! from [`fixed_len`]; otherwise a one-byte length follows the type.
//!
//! ```text
//! TV : | type (1xxxxxxx) | value (fixed_len(type)) |
//! TLV: | type (0xxxxxxx) | len | value (len)       |
//! ```
//!
//! The header-IEs block at the end of the mesh header reuses the same
//! grammar and is closed by [`TYPE_HEADER_IES_TERMINATOR`].

use crate::cursor::{Reader, Writer};
use crate::error::{MeshError, MeshResult};
use crate::types::{ExtAddr, Mode, NodeId};
use serde::Serialize;

/// Marks a fixed-length type
pub const TLV_FIXED_FLAG: u8 = 0x80;

pub const TYPE_HEADER_IES_TERMINATOR: u8 = 0x80;
pub const TYPE_MODE: u8 = 0x81;
pub const TYPE_REVERSE_RSSI: u8 = 0x82;
pub const TYPE_FORWARD_RSSI: u8 = 0x83;
pub const TYPE_SRC_UUID: u8 = 0x84;
pub const TYPE_DEST_UUID: u8 = 0x85;
pub const TYPE_TARGET_UUID: u8 = 0x86;
pub const TYPE_ALLOCATE_SID: u8 = 0x87;
pub const TYPE_NODE_TYPE: u8 = 0x88;
pub const TYPE_NETWORK_INFO: u8 = 0x89;
pub const TYPE_MCAST_ADDR: u8 = 0x8a;
pub const TYPE_PATH_COST: u8 = 0x8b;
pub const TYPE_ADDR_QUERY: u8 = 0x8c;
pub const TYPE_NODE_ID: u8 = 0x8d;
pub const TYPE_ATTACH_NODE_ID: u8 = 0x8e;
pub const TYPE_SSID_INFO: u8 = 0x8f;
pub const TYPE_CHANNEL: u8 = 0x90;
pub const TYPE_TIMESTAMP: u8 = 0x91;
pub const TYPE_SYMMETRIC_KEY: u8 = 0x92;
pub const TYPE_DEF_HAL_TYPE: u8 = 0x93;
pub const TYPE_NODE_ID2: u8 = 0x94;
pub const TYPE_ID2_CHALLENGE: u8 = 0x95;
pub const TYPE_TIME_SLOT: u8 = 0x96;
pub const TYPE_BUFQUEUE_SIZE: u8 = 0x97;
pub const TYPE_REBOOT_FLAG: u8 = 0x98;
pub const TYPE_SRC_SID: u8 = 0x99;

pub const TYPE_TLV_REQUEST: u8 = 0x01;
pub const TYPE_ID2_AUTH_CODE: u8 = 0x02;

/// ID2 device identity length
pub const ID2_LEN: usize = 24;
/// ID2 server challenge length
pub const ID2_CHALLENGE_LEN: usize = 32;

/// Address query asking where a SID is attached
pub const ATTACH_QUERY: u8 = 0x01;
/// Address query asking for the SID of a uuid
pub const TARGET_QUERY: u8 = 0x02;

/// Value length of a fixed-length type
pub fn fixed_len(ty: u8) -> Option<usize> {
    let len = match ty {
        TYPE_HEADER_IES_TERMINATOR => 0,
        TYPE_MODE | TYPE_REVERSE_RSSI | TYPE_FORWARD_RSSI => 1,
        TYPE_SRC_UUID | TYPE_DEST_UUID | TYPE_TARGET_UUID => 8,
        TYPE_ALLOCATE_SID => 2,
        TYPE_NODE_TYPE => 1,
        TYPE_NETWORK_INFO => 7,
        TYPE_MCAST_ADDR => 16,
        TYPE_PATH_COST => 2,
        TYPE_ADDR_QUERY => 1,
        TYPE_NODE_ID | TYPE_ATTACH_NODE_ID => 5,
        TYPE_SSID_INFO => 3,
        TYPE_CHANNEL => 1,
        TYPE_TIMESTAMP => 4,
        TYPE_SYMMETRIC_KEY => 16,
        TYPE_DEF_HAL_TYPE => 1,
        TYPE_NODE_ID2 => ID2_LEN,
        TYPE_ID2_CHALLENGE => ID2_CHALLENGE_LEN,
        TYPE_TIME_SLOT => 5,
        TYPE_BUFQUEUE_SIZE => 1,
        TYPE_REBOOT_FLAG => 1,
        TYPE_SRC_SID => 2,
        _ => return None,
    };
    Some(len)
}

/// Network summary advertised by leaders and routers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    /// Leader main version, bumped on leader reboot
    pub main_version: u8,
    /// Network data version
    pub version: u8,
    /// Number of nodes in the whole network
    pub size: u16,
    /// Number of nodes in the advertised subnet
    pub subnet_size: u16,
    /// Capability mode of the leader
    pub leader_mode: Mode,
}

/// Structured-SID capacity of an advertiser
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SsidInfo {
    pub child_num: u16,
    pub free_slots: u8,
}

/// Low-power wake-up slot of the sender
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSlot {
    pub slot_num: u8,
    /// Milliseconds since the slot started
    pub offset: u32,
}

/// A decoded attribute
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tlv {
    HeaderIesTerminator,
    Mode(Mode),
    ReverseRssi(i8),
    ForwardRssi(i8),
    SrcUuid(ExtAddr),
    DestUuid(ExtAddr),
    TargetUuid(ExtAddr),
    AllocateSid(u16),
    NodeType(u8),
    NetworkInfo(NetworkInfo),
    McastAddr([u8; 16]),
    PathCost(u16),
    AddrQuery(u8),
    NodeId(NodeId),
    AttachNodeId(NodeId),
    SsidInfo(SsidInfo),
    Channel(u8),
    Timestamp(u32),
    SymmetricKey([u8; 16]),
    HalType(u8),
    NodeId2([u8; ID2_LEN]),
    Id2Challenge([u8; ID2_CHALLENGE_LEN]),
    TimeSlot(TimeSlot),
    BufqueueSize(u8),
    RebootFlag(u8),
    SrcSid(u16),
    TlvRequest(Vec<u8>),
    Id2AuthCode(Vec<u8>),
    /// Variable-length attribute this node does not understand
    Unknown { ty: u8, value: Vec<u8> },
}

fn write_node_id(w: &mut Writer, id: &NodeId) -> MeshResult<()> {
    w.write_u16_le(id.sid)?;
    w.write_u8(id.mode.bits())?;
    w.write_u16_le(id.meshnetid)
}

fn read_node_id(r: &mut Reader<'_>) -> MeshResult<NodeId> {
    let sid = r.read_u16_le()?;
    let mode = Mode(r.read_u8()?);
    let meshnetid = r.read_u16_le()?;
    Ok(NodeId::new(sid, mode, meshnetid))
}

fn read_ext(r: &mut Reader<'_>) -> MeshResult<ExtAddr> {
    Ok(ExtAddr(r.read_array()?))
}

impl Tlv {
    /// Wire type code
    pub fn tlv_type(&self) -> u8 {
        match self {
            Tlv::HeaderIesTerminator => TYPE_HEADER_IES_TERMINATOR,
            Tlv::Mode(_) => TYPE_MODE,
            Tlv::ReverseRssi(_) => TYPE_REVERSE_RSSI,
            Tlv::ForwardRssi(_) => TYPE_FORWARD_RSSI,
            Tlv::SrcUuid(_) => TYPE_SRC_UUID,
            Tlv::DestUuid(_) => TYPE_DEST_UUID,
            Tlv::TargetUuid(_) => TYPE_TARGET_UUID,
            Tlv::AllocateSid(_) => TYPE_ALLOCATE_SID,
            Tlv::NodeType(_) => TYPE_NODE_TYPE,
            Tlv::NetworkInfo(_) => TYPE_NETWORK_INFO,
            Tlv::McastAddr(_) => TYPE_MCAST_ADDR,
            Tlv::PathCost(_) => TYPE_PATH_COST,
            Tlv::AddrQuery(_) => TYPE_ADDR_QUERY,
            Tlv::NodeId(_) => TYPE_NODE_ID,
            Tlv::AttachNodeId(_) => TYPE_ATTACH_NODE_ID,
            Tlv::SsidInfo(_) => TYPE_SSID_INFO,
            Tlv::Channel(_) => TYPE_CHANNEL,
            Tlv::Timestamp(_) => TYPE_TIMESTAMP,
            Tlv::SymmetricKey(_) => TYPE_SYMMETRIC_KEY,
            Tlv::HalType(_) => TYPE_DEF_HAL_TYPE,
            Tlv::NodeId2(_) => TYPE_NODE_ID2,
            Tlv::Id2Challenge(_) => TYPE_ID2_CHALLENGE,
            Tlv::TimeSlot(_) => TYPE_TIME_SLOT,
            Tlv::BufqueueSize(_) => TYPE_BUFQUEUE_SIZE,
            Tlv::RebootFlag(_) => TYPE_REBOOT_FLAG,
            Tlv::SrcSid(_) => TYPE_SRC_SID,
            Tlv::TlvRequest(_) => TYPE_TLV_REQUEST,
            Tlv::Id2AuthCode(_) => TYPE_ID2_AUTH_CODE,
            Tlv::Unknown { ty, .. } => *ty,
        }
    }

    /// Encoded size including the type (and length) bytes
    pub fn encoded_len(&self) -> usize {
        match self {
            Tlv::TlvRequest(v) | Tlv::Id2AuthCode(v) => 2 + v.len(),
            Tlv::Unknown { value, .. } => 2 + value.len(),
            other => 1 + fixed_len(other.tlv_type()).unwrap_or(0),
        }
    }

    /// Append this attribute to `w`
    pub fn encode(&self, w: &mut Writer) -> MeshResult<()> {
        w.write_u8(self.tlv_type())?;
        match self {
            Tlv::HeaderIesTerminator => {}
            Tlv::Mode(mode) => w.write_u8(mode.bits())?,
            Tlv::ReverseRssi(v) | Tlv::ForwardRssi(v) => w.write_i8(*v)?,
            Tlv::SrcUuid(a) | Tlv::DestUuid(a) | Tlv::TargetUuid(a) => w.write_bytes(a.as_bytes())?,
            Tlv::AllocateSid(v) | Tlv::PathCost(v) | Tlv::SrcSid(v) => w.write_u16_le(*v)?,
            Tlv::NodeType(v)
            | Tlv::AddrQuery(v)
            | Tlv::Channel(v)
            | Tlv::HalType(v)
            | Tlv::BufqueueSize(v)
            | Tlv::RebootFlag(v) => w.write_u8(*v)?,
            Tlv::NetworkInfo(info) => {
                w.write_u8(info.main_version)?;
                w.write_u8(info.version)?;
                w.write_u16_le(info.size)?;
                w.write_u16_le(info.subnet_size)?;
                w.write_u8(info.leader_mode.bits())?;
            }
            Tlv::McastAddr(a) | Tlv::SymmetricKey(a) => w.write_bytes(a)?,
            Tlv::NodeId(id) | Tlv::AttachNodeId(id) => write_node_id(w, id)?,
            Tlv::SsidInfo(info) => {
                w.write_u16_le(info.child_num)?;
                w.write_u8(info.free_slots)?;
            }
            Tlv::Timestamp(v) => w.write_u32_le(*v)?,
            Tlv::NodeId2(id2) => w.write_bytes(id2)?,
            Tlv::Id2Challenge(c) => w.write_bytes(c)?,
            Tlv::TimeSlot(slot) => {
                w.write_u8(slot.slot_num)?;
                w.write_u32_le(slot.offset)?;
            }
            Tlv::TlvRequest(v) | Tlv::Id2AuthCode(v) | Tlv::Unknown { value: v, .. } => {
                let len = u8::try_from(v.len()).map_err(|_| MeshError::Buffer)?;
                w.write_u8(len)?;
                w.write_bytes(v)?;
            }
        }
        Ok(())
    }

    /// Decode one attribute at the cursor
    pub fn decode(r: &mut Reader<'_>) -> MeshResult<Tlv> {
        let ty = r.read_u8()?;
        if ty & TLV_FIXED_FLAG == 0 {
            let len = r.read_u8()? as usize;
            let value = r.read_bytes(len)?.to_vec();
            return Ok(match ty {
                TYPE_TLV_REQUEST => Tlv::TlvRequest(value),
                TYPE_ID2_AUTH_CODE => Tlv::Id2AuthCode(value),
                _ => Tlv::Unknown { ty, value },
            });
        }
        let len = fixed_len(ty).ok_or(MeshError::Parse("unknown fixed tlv type"))?;
        let value = r.read_bytes(len)?;
        let mut v = Reader::new(value);
        let tlv = match ty {
            TYPE_HEADER_IES_TERMINATOR => Tlv::HeaderIesTerminator,
            TYPE_MODE => Tlv::Mode(Mode(v.read_u8()?)),
            TYPE_REVERSE_RSSI => Tlv::ReverseRssi(v.read_i8()?),
            TYPE_FORWARD_RSSI => Tlv::ForwardRssi(v.read_i8()?),
            TYPE_SRC_UUID => Tlv::SrcUuid(read_ext(&mut v)?),
            TYPE_DEST_UUID => Tlv::DestUuid(read_ext(&mut v)?),
            TYPE_TARGET_UUID => Tlv::TargetUuid(read_ext(&mut v)?),
            TYPE_ALLOCATE_SID => Tlv::AllocateSid(v.read_u16_le()?),
            TYPE_NODE_TYPE => Tlv::NodeType(v.read_u8()?),
            TYPE_NETWORK_INFO => Tlv::NetworkInfo(NetworkInfo {
                main_version: v.read_u8()?,
                version: v.read_u8()?,
                size: v.read_u16_le()?,
                subnet_size: v.read_u16_le()?,
                leader_mode: Mode(v.read_u8()?),
            }),
            TYPE_MCAST_ADDR => Tlv::McastAddr(v.read_array()?),
            TYPE_PATH_COST => Tlv::PathCost(v.read_u16_le()?),
            TYPE_ADDR_QUERY => Tlv::AddrQuery(v.read_u8()?),
            TYPE_NODE_ID => Tlv::NodeId(read_node_id(&mut v)?),
            TYPE_ATTACH_NODE_ID => Tlv::AttachNodeId(read_node_id(&mut v)?),
            TYPE_SSID_INFO => Tlv::SsidInfo(SsidInfo {
                child_num: v.read_u16_le()?,
                free_slots: v.read_u8()?,
            }),
            TYPE_CHANNEL => Tlv::Channel(v.read_u8()?),
            TYPE_TIMESTAMP => Tlv::Timestamp(v.read_u32_le()?),
            TYPE_SYMMETRIC_KEY => Tlv::SymmetricKey(v.read_array()?),
            TYPE_DEF_HAL_TYPE => Tlv::HalType(v.read_u8()?),
            TYPE_NODE_ID2 => Tlv::NodeId2(v.read_array()?),
            TYPE_ID2_CHALLENGE => Tlv::Id2Challenge(v.read_array()?),
            TYPE_TIME_SLOT => Tlv::TimeSlot(TimeSlot {
                slot_num: v.read_u8()?,
                offset: v.read_u32_le()?,
            }),
            TYPE_BUFQUEUE_SIZE => Tlv::BufqueueSize(v.read_u8()?),
            TYPE_REBOOT_FLAG => Tlv::RebootFlag(v.read_u8()?),
            TYPE_SRC_SID => Tlv::SrcSid(v.read_u16_le()?),
            _ => return Err(MeshError::Parse("unknown fixed tlv type")),
        };
        Ok(tlv)
    }
}

/// Encode a list of attributes
pub fn encode_tlvs(tlvs: &[Tlv]) -> MeshResult<Vec<u8>> {
    let mut w = Writer::new();
    for tlv in tlvs {
        tlv.encode(&mut w)?;
    }
    Ok(w.into_inner())
}

macro_rules! tlv_getter {
    ($(#[$doc:meta])* $name:ident, $variant:ident, $ty:ty) => {
        $(#[$doc])*
        pub fn $name(&self) -> Option<$ty> {
            self.0.iter().find_map(|t| match t {
                Tlv::$variant(v) => Some(v.clone()),
                _ => None,
            })
        }
    };
}

/// A parsed attribute list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tlvs(pub Vec<Tlv>);

impl Tlvs {
    /// Parse every attribute in `data`
    pub fn parse(data: &[u8]) -> MeshResult<Tlvs> {
        let mut r = Reader::new(data);
        let mut out = Vec::new();
        while !r.is_empty() {
            out.push(Tlv::decode(&mut r)?);
        }
        Ok(Tlvs(out))
    }

    /// First attribute of a given type
    pub fn get(&self, ty: u8) -> Option<&Tlv> {
        self.0.iter().find(|t| t.tlv_type() == ty)
    }

    pub fn contains(&self, ty: u8) -> bool {
        self.get(ty).is_some()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    tlv_getter!(mode, Mode, Mode);
    tlv_getter!(reverse_rssi, ReverseRssi, i8);
    tlv_getter!(src_uuid, SrcUuid, ExtAddr);
    tlv_getter!(target_uuid, TargetUuid, ExtAddr);
    tlv_getter!(allocate_sid, AllocateSid, u16);
    tlv_getter!(node_type, NodeType, u8);
    tlv_getter!(network_info, NetworkInfo, NetworkInfo);
    tlv_getter!(mcast_addr, McastAddr, [u8; 16]);
    tlv_getter!(path_cost, PathCost, u16);
    tlv_getter!(addr_query, AddrQuery, u8);
    tlv_getter!(node_id, NodeId, NodeId);
    tlv_getter!(attach_node_id, AttachNodeId, NodeId);
    tlv_getter!(ssid_info, SsidInfo, SsidInfo);
    tlv_getter!(channel, Channel, u8);
    tlv_getter!(timestamp, Timestamp, u32);
    tlv_getter!(symmetric_key, SymmetricKey, [u8; 16]);
    tlv_getter!(hal_type, HalType, u8);
    tlv_getter!(node_id2, NodeId2, [u8; ID2_LEN]);
    tlv_getter!(id2_challenge, Id2Challenge, [u8; ID2_CHALLENGE_LEN]);
    tlv_getter!(time_slot, TimeSlot, TimeSlot);
    tlv_getter!(bufqueue_size, BufqueueSize, u8);
    tlv_getter!(reboot_flag, RebootFlag, u8);
    tlv_getter!(src_sid, SrcSid, u16);
    tlv_getter!(
        /// Attribute types the peer asked to receive back
        tlv_request,
        TlvRequest,
        Vec<u8>
    );
    tlv_getter!(id2_auth_code, Id2AuthCode, Vec<u8>);
}

/// Attributes carried in the header-IEs block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct HeaderIes {
    pub mode: Option<Mode>,
    pub reverse_rssi: Option<i8>,
}

/// Reverse RSSI value asking the receiver to answer with a link accept
pub const REVERSE_RSSI_ACCEPT_REQUEST: i8 = 127;

impl HeaderIes {
    /// Encode the block including its terminator
    pub fn encode(&self, w: &mut Writer) -> MeshResult<()> {
        if let Some(mode) = self.mode {
            Tlv::Mode(mode).encode(w)?;
        }
        if let Some(rssi) = self.reverse_rssi {
            Tlv::ReverseRssi(rssi).encode(w)?;
        }
        Tlv::HeaderIesTerminator.encode(w)
    }

    /// Decode up to and including the terminator
    pub fn decode(r: &mut Reader<'_>) -> MeshResult<HeaderIes> {
        let mut ies = HeaderIes::default();
        loop {
            match Tlv::decode(r)? {
                Tlv::HeaderIesTerminator => return Ok(ies),
                Tlv::Mode(mode) => ies.mode = Some(mode),
                Tlv::ReverseRssi(rssi) => ies.reverse_rssi = Some(rssi),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_and_variable_grammar() {
        let tlvs = vec![
            Tlv::PathCost(0x0102),
            Tlv::TlvRequest(vec![TYPE_CHANNEL, TYPE_TIME_SLOT]),
            Tlv::Channel(11),
        ];
        let bytes = encode_tlvs(&tlvs).unwrap();
        assert_eq!(&bytes[..3], &[TYPE_PATH_COST, 0x02, 0x01]);
        assert_eq!(&bytes[3..7], &[TYPE_TLV_REQUEST, 2, TYPE_CHANNEL, TYPE_TIME_SLOT]);
        let parsed = Tlvs::parse(&bytes).unwrap();
        assert_eq!(parsed.path_cost(), Some(0x0102));
        assert_eq!(parsed.channel(), Some(11));
        assert_eq!(parsed.tlv_request(), Some(vec![TYPE_CHANNEL, TYPE_TIME_SLOT]));
        assert!(parsed.network_info().is_none());
    }

    #[test]
    fn test_unknown_variable_type_is_skipped() {
        let bytes = [0x33, 2, 0xaa, 0xbb, TYPE_CHANNEL, 6];
        let parsed = Tlvs::parse(&bytes).unwrap();
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.channel(), Some(6));
    }

    #[test]
    fn test_unknown_fixed_type_fails() {
        let bytes = [0xfe, 1, 2];
        assert!(Tlvs::parse(&bytes).is_err());
    }

    #[test]
    fn test_truncated_value_fails() {
        let bytes = [TYPE_NETWORK_INFO, 1, 2, 3];
        assert_eq!(Tlvs::parse(&bytes), Err(MeshError::Parse("truncated")));
    }

    #[test]
    fn test_encoded_len_matches() {
        let samples = vec![
            Tlv::NetworkInfo(NetworkInfo {
                main_version: 1,
                version: 2,
                size: 3,
                subnet_size: 4,
                leader_mode: Mode::RX_ON,
            }),
            Tlv::NodeId(NodeId::new(0x1000, Mode::RX_ON, 0x1200)),
            Tlv::Id2AuthCode(vec![1, 2, 3]),
            Tlv::HeaderIesTerminator,
        ];
        for tlv in samples {
            let mut w = Writer::new();
            tlv.encode(&mut w).unwrap();
            assert_eq!(w.len(), tlv.encoded_len());
        }
    }

    #[test]
    fn test_header_ies() {
        let ies = HeaderIes {
            mode: Some(Mode::RX_ON),
            reverse_rssi: Some(REVERSE_RSSI_ACCEPT_REQUEST),
        };
        let mut w = Writer::new();
        ies.encode(&mut w).unwrap();
        w.write_u8(0x55).unwrap();
        let bytes = w.into_inner();
        let mut r = Reader::new(&bytes);
        assert_eq!(HeaderIes::decode(&mut r).unwrap(), ies);
        assert_eq!(r.read_u8().unwrap(), 0x55);
    }

    #[test]
    fn test_header_ies_without_terminator() {
        let bytes = [TYPE_MODE, 0x02];
        let mut r = Reader::new(&bytes);
        assert!(HeaderIes::decode(&mut r).is_err());
    }
}
