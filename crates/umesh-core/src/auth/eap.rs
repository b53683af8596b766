//! EAPOL / EAP codec carried in AUTH_DOT1X commands
//!
//! ```text
//! EAPOL  | version 1 | type 1 | length u16 BE | body ... |
//! EAP    | code 1 | id 1 | length u16 BE | type 1 | data ... |
//! ID2    | 254 | OUI d8:96:e0 | vendor type 00000001 | cmd 1 | TLVs ... |
//! ```
//!
//! The EAP length covers the EAP header itself, the EAPOL length only
//! its body.

use crate::cursor::{Reader, Writer};
use crate::error::{MeshError, MeshResult};
use crate::tlv::{encode_tlvs, Tlv, Tlvs};
use crate::types::ExtAddr;

pub const EAPOL_VERSION: u8 = 2;
pub const EAPOL_TYPE_EAP: u8 = 0;
pub const EAPOL_TYPE_START: u8 = 1;

pub const EAP_TYPE_IDENTITY: u8 = 1;
pub const EAP_TYPE_EXPANDED: u8 = 254;

/// Vendor OUI of the ID2 expanded method
pub const ID2_VENDOR_OUI: [u8; 3] = [0xd8, 0x96, 0xe0];
/// Vendor type of the ID2 expanded method
pub const ID2_VENDOR_TYPE: [u8; 4] = [0x00, 0x00, 0x00, 0x01];

const EAP_HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EapCode {
    Request = 1,
    Response = 2,
    Success = 3,
    Failure = 4,
}

impl EapCode {
    fn from_u8(v: u8) -> MeshResult<Self> {
        match v {
            1 => Ok(EapCode::Request),
            2 => Ok(EapCode::Response),
            3 => Ok(EapCode::Success),
            4 => Ok(EapCode::Failure),
            _ => Err(MeshError::Parse("eap code")),
        }
    }
}

/// Step of the ID2 exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Id2Command {
    Start = 1,
    Identity = 2,
    Challenge = 3,
    AuthCode = 4,
}

impl Id2Command {
    fn from_u8(v: u8) -> MeshResult<Self> {
        match v {
            1 => Ok(Id2Command::Start),
            2 => Ok(Id2Command::Identity),
            3 => Ok(Id2Command::Challenge),
            4 => Ok(Id2Command::AuthCode),
            _ => Err(MeshError::Parse("id2 command")),
        }
    }
}

/// Method-specific part of an EAP packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EapBody {
    /// Success and failure carry nothing
    Empty,
    /// Identity request (empty) or response (joiner mac)
    Identity(Option<ExtAddr>),
    Id2 { command: Id2Command, tlvs: Vec<Tlv> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EapPacket {
    pub code: EapCode,
    pub id: u8,
    pub body: EapBody,
}

impl EapPacket {
    pub fn new(code: EapCode, id: u8, body: EapBody) -> Self {
        Self { code, id, body }
    }

    fn encode_body(&self) -> MeshResult<Vec<u8>> {
        let mut w = Writer::new();
        match &self.body {
            EapBody::Empty => {}
            EapBody::Identity(mac) => {
                w.write_u8(EAP_TYPE_IDENTITY)?;
                if let Some(mac) = mac {
                    w.write_bytes(mac.as_bytes())?;
                }
            }
            EapBody::Id2 { command, tlvs } => {
                w.write_u8(EAP_TYPE_EXPANDED)?;
                w.write_bytes(&ID2_VENDOR_OUI)?;
                w.write_bytes(&ID2_VENDOR_TYPE)?;
                w.write_u8(*command as u8)?;
                w.write_bytes(&encode_tlvs(tlvs)?)?;
            }
        }
        Ok(w.into_inner())
    }

    fn encode(&self, w: &mut Writer) -> MeshResult<()> {
        let body = self.encode_body()?;
        w.write_u8(self.code as u8)?;
        w.write_u8(self.id)?;
        w.write_u16_be((EAP_HEADER_LEN + body.len()) as u16)?;
        w.write_bytes(&body)
    }

    fn decode(data: &[u8]) -> MeshResult<Self> {
        let mut r = Reader::new(data);
        let code = EapCode::from_u8(r.read_u8()?)?;
        let id = r.read_u8()?;
        let length = r.read_u16_be()? as usize;
        if length < EAP_HEADER_LEN || length > data.len() {
            return Err(MeshError::Parse("eap length"));
        }
        let mut r = Reader::new(&data[EAP_HEADER_LEN..length]);
        let body = if r.is_empty() {
            EapBody::Empty
        } else {
            match r.read_u8()? {
                EAP_TYPE_IDENTITY => {
                    let rest = r.rest();
                    EapBody::Identity(if rest.is_empty() {
                        None
                    } else {
                        Some(ExtAddr::from_slice(rest).ok_or(MeshError::Parse("eap identity"))?)
                    })
                }
                EAP_TYPE_EXPANDED => {
                    let oui: [u8; 3] = r.read_array()?;
                    let vendor_type: [u8; 4] = r.read_array()?;
                    if oui != ID2_VENDOR_OUI || vendor_type != ID2_VENDOR_TYPE {
                        return Err(MeshError::Parse("eap vendor"));
                    }
                    let command = Id2Command::from_u8(r.read_u8()?)?;
                    let tlvs = Tlvs::parse(r.rest())?.0;
                    EapBody::Id2 { command, tlvs }
                }
                _ => return Err(MeshError::Parse("eap type")),
            }
        };
        Ok(Self { code, id, body })
    }
}

/// Body of an AUTH_DOT1X command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Eapol {
    Start,
    Eap(EapPacket),
}

impl Eapol {
    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        let mut body = Writer::new();
        let ty = match self {
            Eapol::Start => EAPOL_TYPE_START,
            Eapol::Eap(packet) => {
                packet.encode(&mut body)?;
                EAPOL_TYPE_EAP
            }
        };
        let body = body.into_inner();
        let mut w = Writer::new();
        w.write_u8(EAPOL_VERSION)?;
        w.write_u8(ty)?;
        w.write_u16_be(body.len() as u16)?;
        w.write_bytes(&body)?;
        Ok(w.into_inner())
    }

    pub fn parse(data: &[u8]) -> MeshResult<Self> {
        let mut r = Reader::new(data);
        let _version = r.read_u8()?;
        let ty = r.read_u8()?;
        let length = r.read_u16_be()? as usize;
        let body = r.read_bytes(length)?;
        match ty {
            EAPOL_TYPE_START => Ok(Eapol::Start),
            EAPOL_TYPE_EAP => Ok(Eapol::Eap(EapPacket::decode(body)?)),
            _ => Err(MeshError::Parse("eapol type")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tlv::ID2_LEN;

    #[test]
    fn test_eapol_start_layout() {
        let bytes = Eapol::Start.to_bytes().unwrap();
        assert_eq!(bytes, vec![EAPOL_VERSION, EAPOL_TYPE_START, 0, 0]);
        assert_eq!(Eapol::parse(&bytes).unwrap(), Eapol::Start);
    }

    #[test]
    fn test_identity_response() {
        let mac = ExtAddr([1, 2, 3, 4, 5, 6, 7, 8]);
        let packet = Eapol::Eap(EapPacket::new(EapCode::Response, 3, EapBody::Identity(Some(mac))));
        let bytes = packet.to_bytes().unwrap();
        // eap header + type + mac
        assert_eq!(&bytes[2..4], &[0, 13]);
        assert_eq!(&bytes[4..8], &[2, 3, 0, 13]);
        assert_eq!(Eapol::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_id2_expanded_method() {
        let packet = Eapol::Eap(EapPacket::new(
            EapCode::Request,
            9,
            EapBody::Id2 {
                command: Id2Command::Challenge,
                tlvs: vec![Tlv::NodeId2([7; ID2_LEN])],
            },
        ));
        let bytes = packet.to_bytes().unwrap();
        assert_eq!(bytes[8], EAP_TYPE_EXPANDED);
        assert_eq!(&bytes[9..12], &ID2_VENDOR_OUI);
        assert_eq!(Eapol::parse(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_rejects_foreign_vendor_and_short_length() {
        let packet = Eapol::Eap(EapPacket::new(
            EapCode::Request,
            1,
            EapBody::Id2 {
                command: Id2Command::Start,
                tlvs: Vec::new(),
            },
        ));
        let mut bytes = packet.to_bytes().unwrap();
        bytes[9] = 0x00;
        assert_eq!(Eapol::parse(&bytes), Err(MeshError::Parse("eap vendor")));
        assert!(Eapol::parse(&bytes[..6]).is_err());
    }
}
