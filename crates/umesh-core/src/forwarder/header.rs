//! Mesh header codec
//!
//! ```text
//!  ctrl[0]  | 1 0 | type | hops (5)          |
//!  ctrl[1]  | dnet (2) | dst (2) | dst2 (2) | SEC | IES |
//!  ctrl[2]  | src (2) | - - | version (4)    |
//!  meshnetid            u16 LE
//!  dest netid           0 / 1 / 2 bytes (dnet mode)
//!  src addr             0 / 2 / 8 bytes
//!  dest addr            0 / 2 / 8 bytes
//!  dest2 addr           0 / 2 / 8 bytes
//!  header IEs           mode, reverse rssi, terminator (IES set)
//! ```
//!
//! Address modes are 0 none, 1 short, 2 extended, 3 broadcast. The dest
//! netid mode is 0 same as source, 1 broadcast, 2 subnet byte of the
//! source main net, 3 full netid. Everything after the fixed part is
//! encrypted when SEC is set.

use crate::cursor::{Reader, Writer};
use crate::error::{MeshError, MeshResult};
use crate::tlv::HeaderIes;
use crate::types::{
    get_main_netid, get_sub_netid, is_same_mainnet, is_subnet, mk_sub_netid, Addr, ExtAddr, FrameType, MeshAddr,
    BCAST_NETID,
};
use serde::Serialize;

/// Dispatch bits of a mesh header
pub const MESH_DISPATCH: u8 = 0b10;
/// Protocol version carried in ctrl[2]
pub const MESH_VERSION: u8 = 1;
/// Initial hop budget of a frame
pub const FORWARD_HOP_LIMIT: u8 = 16;

const HOPS_MASK: u8 = 0x1f;
const DATA_BIT: u8 = 0x20;
const SEC_BIT: u8 = 0x02;
const IES_BIT: u8 = 0x01;

const NETID_SAME: u8 = 0;
const NETID_BCAST: u8 = 1;
const NETID_SUB: u8 = 2;
const NETID_FULL: u8 = 3;

const ADDR_NONE: u8 = 0;
const ADDR_SHORT: u8 = 1;
const ADDR_EXT: u8 = 2;
const ADDR_BCAST: u8 = 3;

/// Whether a byte starts a mesh header
pub fn is_mesh_header(first: u8) -> bool {
    first >> 6 == MESH_DISPATCH
}

fn addr_mode(addr: &Addr) -> u8 {
    match addr {
        Addr::None => ADDR_NONE,
        Addr::Short(_) => ADDR_SHORT,
        Addr::Ext(_) => ADDR_EXT,
        Addr::Bcast => ADDR_BCAST,
    }
}

fn write_addr(w: &mut Writer, addr: &Addr) -> MeshResult<()> {
    match addr {
        Addr::Short(sid) => w.write_u16_le(*sid),
        Addr::Ext(mac) => w.write_bytes(mac.as_bytes()),
        Addr::None | Addr::Bcast => Ok(()),
    }
}

fn read_addr(r: &mut Reader<'_>, mode: u8) -> MeshResult<Addr> {
    Ok(match mode {
        ADDR_SHORT => Addr::Short(r.read_u16_le()?),
        ADDR_EXT => Addr::Ext(ExtAddr(r.read_array()?)),
        ADDR_BCAST => Addr::Bcast,
        _ => Addr::None,
    })
}

/// Decoded mesh header
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MeshHeader {
    pub frame_type: FrameType,
    pub hops: u8,
    pub secure: bool,
    /// Source address; its netid is the frame's meshnetid
    pub src: MeshAddr,
    pub dest: MeshAddr,
    /// Proxy destination, shares the dest netid
    pub dest2: Addr,
    pub ies: Option<HeaderIes>,
}

impl MeshHeader {
    pub fn new(frame_type: FrameType, src: MeshAddr, dest: MeshAddr) -> Self {
        Self {
            frame_type,
            hops: FORWARD_HOP_LIMIT,
            secure: false,
            src,
            dest,
            dest2: Addr::None,
            ies: None,
        }
    }

    fn dest_netid_mode(&self) -> u8 {
        if self.dest.netid == self.src.netid {
            NETID_SAME
        } else if self.dest.netid == BCAST_NETID {
            NETID_BCAST
        } else if is_same_mainnet(self.dest.netid, self.src.netid) && is_subnet(self.dest.netid) {
            NETID_SUB
        } else {
            NETID_FULL
        }
    }

    /// Length of the part that is never encrypted
    pub fn fixed_len(&self) -> usize {
        let netid_len = match self.dest_netid_mode() {
            NETID_SUB => 1,
            NETID_FULL => 2,
            _ => 0,
        };
        3 + 2 + netid_len + self.src.addr.wire_len() + self.dest.addr.wire_len() + self.dest2.wire_len()
    }

    /// Total encoded length including the IEs block
    pub fn encoded_len(&self) -> usize {
        let ies_len = match &self.ies {
            Some(ies) => 1 + ies.mode.map_or(0, |_| 2) + ies.reverse_rssi.map_or(0, |_| 2),
            None => 0,
        };
        self.fixed_len() + ies_len
    }

    pub fn encode(&self, w: &mut Writer) -> MeshResult<()> {
        let type_bit = match self.frame_type {
            FrameType::Cmd => 0,
            FrameType::Data => DATA_BIT,
        };
        w.write_u8((MESH_DISPATCH << 6) | type_bit | (self.hops & HOPS_MASK))?;

        let netid_mode = self.dest_netid_mode();
        let mut ctrl1 = (netid_mode << 6) | (addr_mode(&self.dest.addr) << 4) | (addr_mode(&self.dest2) << 2);
        if self.secure {
            ctrl1 |= SEC_BIT;
        }
        if self.ies.is_some() {
            ctrl1 |= IES_BIT;
        }
        w.write_u8(ctrl1)?;
        w.write_u8((addr_mode(&self.src.addr) << 6) | MESH_VERSION)?;

        w.write_u16_le(self.src.netid)?;
        match netid_mode {
            NETID_SUB => w.write_u8(get_sub_netid(self.dest.netid))?,
            NETID_FULL => w.write_u16_le(self.dest.netid)?,
            _ => {}
        }
        write_addr(w, &self.src.addr)?;
        write_addr(w, &self.dest.addr)?;
        write_addr(w, &self.dest2)?;
        if let Some(ies) = &self.ies {
            ies.encode(w)?;
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        let mut w = Writer::new();
        self.encode(&mut w)?;
        Ok(w.into_inner())
    }

    /// Decode the fixed part, leaving the cursor at the IEs block
    ///
    /// Returns the header (with `ies` unset) and whether an IEs block
    /// follows.
    pub fn decode_fixed(r: &mut Reader<'_>) -> MeshResult<(MeshHeader, bool)> {
        let ctrl0 = r.read_u8()?;
        if !is_mesh_header(ctrl0) {
            return Err(MeshError::Parse("mesh dispatch"));
        }
        let ctrl1 = r.read_u8()?;
        let ctrl2 = r.read_u8()?;
        if ctrl2 & 0x0f != MESH_VERSION {
            return Err(MeshError::Parse("mesh version"));
        }
        let frame_type = if ctrl0 & DATA_BIT != 0 {
            FrameType::Data
        } else {
            FrameType::Cmd
        };

        let src_netid = r.read_u16_le()?;
        let dest_netid = match ctrl1 >> 6 {
            NETID_SAME => src_netid,
            NETID_BCAST => BCAST_NETID,
            NETID_SUB => mk_sub_netid(get_main_netid(src_netid), r.read_u8()?),
            _ => r.read_u16_le()?,
        };
        let src = read_addr(r, ctrl2 >> 6)?;
        let dest = read_addr(r, (ctrl1 >> 4) & 0x03)?;
        let dest2 = read_addr(r, (ctrl1 >> 2) & 0x03)?;

        let header = MeshHeader {
            frame_type,
            hops: ctrl0 & HOPS_MASK,
            secure: ctrl1 & SEC_BIT != 0,
            src: MeshAddr {
                netid: src_netid,
                addr: src,
            },
            dest: MeshAddr {
                netid: dest_netid,
                addr: dest,
            },
            dest2,
            ies: None,
        };
        Ok((header, ctrl1 & IES_BIT != 0))
    }

    /// Decode a clear header, returning it with the payload offset
    pub fn decode(data: &[u8]) -> MeshResult<(MeshHeader, usize)> {
        let mut r = Reader::new(data);
        let (mut header, has_ies) = Self::decode_fixed(&mut r)?;
        if has_ies {
            header.ies = Some(HeaderIes::decode(&mut r)?);
        }
        Ok((header, r.position()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Mode;

    #[test]
    fn test_command_header_layout() {
        let mut header = MeshHeader::new(
            FrameType::Cmd,
            MeshAddr::short(0x1200, 0x1000),
            MeshAddr::short(0x1200, 0x0000),
        );
        header.hops = 3;
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes[0], 0x83);
        assert_eq!(bytes[1], 0x10);
        assert_eq!(bytes[2], 0x41);
        assert_eq!(&bytes[3..5], &[0x00, 0x12]);
        assert_eq!(&bytes[5..], &[0x00, 0x10, 0x00, 0x00]);
        assert_eq!(bytes.len(), header.fixed_len());

        let (decoded, offset) = MeshHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(offset, bytes.len());
    }

    #[test]
    fn test_netid_modes() {
        let src = MeshAddr::short(0x1200, 0x1000);
        for dest_netid in [0x1200, BCAST_NETID, 0x1205, 0x3400] {
            let mut header = MeshHeader::new(FrameType::Data, src, MeshAddr::bcast(dest_netid));
            header.dest2 = Addr::Short(0xc001);
            let bytes = header.to_bytes().unwrap();
            assert_eq!(bytes.len(), header.encoded_len());
            let (decoded, _) = MeshHeader::decode(&bytes).unwrap();
            assert_eq!(decoded.dest.netid, dest_netid);
            assert_eq!(decoded.dest2, Addr::Short(0xc001));
        }
    }

    #[test]
    fn test_ext_addresses_and_ies() {
        let mut header = MeshHeader::new(
            FrameType::Cmd,
            MeshAddr::ext(0x1200, ExtAddr([1; 8])),
            MeshAddr::ext(0x1200, ExtAddr([2; 8])),
        );
        header.secure = true;
        header.ies = Some(HeaderIes {
            mode: Some(Mode::RX_ON),
            reverse_rssi: Some(-40),
        });
        let bytes = header.to_bytes().unwrap();
        assert_eq!(bytes.len(), header.encoded_len());
        let (decoded, offset) = MeshHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(offset, bytes.len());
        assert_eq!(header.fixed_len(), 5 + 16);
    }

    #[test]
    fn test_rejects_bad_dispatch_and_version() {
        let header = MeshHeader::new(FrameType::Cmd, MeshAddr::short(1, 1), MeshAddr::short(1, 2));
        let mut bytes = header.to_bytes().unwrap();
        bytes[2] = (bytes[2] & 0xf0) | 0x02;
        assert_eq!(MeshHeader::decode(&bytes), Err(MeshError::Parse("mesh version")));
        bytes[0] = 0x40;
        assert_eq!(MeshHeader::decode(&bytes), Err(MeshError::Parse("mesh dispatch")));
        assert!(MeshHeader::decode(&bytes[..2]).is_err());
    }
}
