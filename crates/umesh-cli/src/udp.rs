//! UDP transport for running real nodes on one host or a LAN
//!
//! Every datagram carries a link-layer prefix in front of the mesh frame:
//!
//! ```text
//! | src mac (8) | dst mac (8, all ones for broadcast) | mesh frame |
//! ```
//!
//! A "broadcast" goes to every configured peer; receivers drop unicast
//! frames addressed to another mac.

use anyhow::{Context, Result};
use std::net::{SocketAddr, UdpSocket};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace, warn};
use umesh_core::auth::id2::AuthServerLink;
use umesh_core::{AuthServerSink, ExtAddr, Hal, HalEventSink, MediaType, MeshError, MeshResult, TxStatus};

/// Link-layer prefix length
pub const LINK_PREFIX_LEN: usize = 16;
/// Largest mesh frame carried in one datagram
pub const UDP_MTU: usize = 1024;
/// Reported for every received datagram
pub const UDP_RSSI: i8 = -50;

/// Prefix a mesh frame with its link-layer addresses
pub fn encode_datagram(src: &ExtAddr, dest: Option<&ExtAddr>, frame: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(LINK_PREFIX_LEN + frame.len());
    out.extend_from_slice(src.as_bytes());
    out.extend_from_slice(dest.unwrap_or(&ExtAddr::BROADCAST).as_bytes());
    out.extend_from_slice(frame);
    out
}

/// Split a datagram into source, destination (`None` for broadcast) and frame
pub fn decode_datagram(data: &[u8]) -> Option<(ExtAddr, Option<ExtAddr>, &[u8])> {
    if data.len() <= LINK_PREFIX_LEN {
        return None;
    }
    let src = ExtAddr::from_slice(&data[..8])?;
    let dest = ExtAddr::from_slice(&data[8..16])?;
    let dest = if dest.is_broadcast() { None } else { Some(dest) };
    Some((src, dest, &data[LINK_PREFIX_LEN..]))
}

/// Radio backed by a UDP socket
pub struct UdpHal {
    socket: UdpSocket,
    mac: ExtAddr,
    media: MediaType,
    peers: Vec<SocketAddr>,
    channel: u8,
    extnetid: Vec<u8>,
    sink: Arc<Mutex<Option<HalEventSink>>>,
}

impl UdpHal {
    /// Wrap `socket` for sending; the caller feeds received datagrams to [`UdpReceiver`]
    pub fn new(socket: &UdpSocket, mac: ExtAddr, media: MediaType, peers: Vec<SocketAddr>) -> Result<(Self, UdpReceiver)> {
        let socket = socket.try_clone().context("Failed to clone UDP socket")?;
        let sink = Arc::new(Mutex::new(None));
        let receiver = UdpReceiver {
            mac,
            sink: Arc::clone(&sink),
        };
        Ok((
            Self {
                socket,
                mac,
                media,
                peers,
                channel: 1,
                extnetid: Vec::new(),
                sink,
            },
            receiver,
        ))
    }

    fn send_to_peers(&self, datagram: &[u8]) -> TxStatus {
        let mut sent = 0;
        for peer in &self.peers {
            match self.socket.send_to(datagram, peer) {
                Ok(_) => sent += 1,
                Err(e) => debug!(%peer, error = %e, "udp send failed"),
            }
        }
        if sent > 0 || self.peers.is_empty() {
            TxStatus::Sent
        } else {
            TxStatus::Failed
        }
    }
}

impl Hal for UdpHal {
    fn media(&self) -> MediaType {
        self.media
    }

    fn mac(&self) -> ExtAddr {
        self.mac
    }

    fn register_receiver(&mut self, sink: HalEventSink) {
        if let Ok(mut slot) = self.sink.lock() {
            *slot = Some(sink);
        }
    }

    fn send_ucast(&mut self, frame: &[u8], dest: &ExtAddr) -> TxStatus {
        if frame.len() > UDP_MTU {
            return TxStatus::Failed;
        }
        self.send_to_peers(&encode_datagram(&self.mac, Some(dest), frame))
    }

    fn send_bcast(&mut self, frame: &[u8]) -> TxStatus {
        if frame.len() > UDP_MTU {
            return TxStatus::Failed;
        }
        self.send_to_peers(&encode_datagram(&self.mac, None, frame))
    }

    fn channel(&self) -> u8 {
        self.channel
    }

    fn set_channel(&mut self, channel: u8) -> MeshResult<()> {
        if channel == 0 {
            return Err(MeshError::Fail);
        }
        self.channel = channel;
        Ok(())
    }

    fn ucast_mtu(&self) -> usize {
        UDP_MTU
    }

    fn bcast_mtu(&self) -> usize {
        UDP_MTU
    }

    fn extnetid(&self) -> Vec<u8> {
        self.extnetid.clone()
    }

    fn set_extnetid(&mut self, extnetid: &[u8]) -> MeshResult<()> {
        self.extnetid = extnetid.to_vec();
        Ok(())
    }
}

/// Receive half of a [`UdpHal`]
#[derive(Clone)]
pub struct UdpReceiver {
    mac: ExtAddr,
    sink: Arc<Mutex<Option<HalEventSink>>>,
}

impl UdpReceiver {
    /// Hand one datagram to the node, false when it was not for us
    pub fn handle_datagram(&self, data: &[u8]) -> bool {
        let Some((src, dest, frame)) = decode_datagram(data) else {
            trace!(len = data.len(), "short datagram ignored");
            return false;
        };
        if src == self.mac || dest.is_some_and(|d| d != self.mac) {
            return false;
        }
        let sink = match self.sink.lock() {
            Ok(slot) => slot.clone(),
            Err(_) => None,
        };
        match sink {
            Some(sink) => sink.deliver(frame.to_vec(), src, dest, UDP_RSSI),
            None => false,
        }
    }
}

/// Authentication server reached over UDP
pub struct UdpAuthLink {
    socket: UdpSocket,
    server: SocketAddr,
}

impl UdpAuthLink {
    pub fn new(socket: UdpSocket, server: SocketAddr) -> Self {
        Self { socket, server }
    }
}

impl AuthServerLink for UdpAuthLink {
    fn send(&mut self, message: Vec<u8>) {
        if let Err(e) = self.socket.send_to(&message, self.server) {
            warn!(server = %self.server, error = %e, "auth server unreachable");
        }
    }
}

/// Forward an auth server reply to the node
pub fn deliver_auth_reply(sink: &AuthServerSink, data: &[u8]) {
    if !sink.deliver(data.to_vec()) {
        debug!("node gone, auth reply dropped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datagram_prefix() {
        let src = ExtAddr([2, 0, 0, 0, 0, 0, 0, 1]);
        let dest = ExtAddr([2, 0, 0, 0, 0, 0, 0, 2]);
        let data = encode_datagram(&src, Some(&dest), &[0x80, 1, 2]);
        assert_eq!(data.len(), LINK_PREFIX_LEN + 3);
        let (s, d, frame) = decode_datagram(&data).unwrap();
        assert_eq!(s, src);
        assert_eq!(d, Some(dest));
        assert_eq!(frame, &[0x80, 1, 2]);

        let bcast = encode_datagram(&src, None, &[0x80]);
        assert_eq!(&bcast[8..16], &[0xff; 8]);
        assert_eq!(decode_datagram(&bcast).unwrap().1, None);
    }

    #[test]
    fn test_short_datagram_rejected() {
        assert!(decode_datagram(&[0u8; LINK_PREFIX_LEN]).is_none());
    }

    #[test]
    fn test_receiver_filters_foreign_unicast() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mac = ExtAddr([2, 0, 0, 0, 0, 0, 0, 9]);
        let (_hal, receiver) = UdpHal::new(&socket, mac, MediaType::Wifi, Vec::new()).unwrap();
        let other = ExtAddr([2, 0, 0, 0, 0, 0, 0, 3]);
        // No sink registered yet, and the frame is for someone else
        let foreign = encode_datagram(&other, Some(&ExtAddr([7; 8])), &[0x80]);
        assert!(!receiver.handle_datagram(&foreign));
        let own = encode_datagram(&mac, None, &[0x80]);
        assert!(!receiver.handle_datagram(&own));
    }
}
