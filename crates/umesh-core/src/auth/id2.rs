//! ID2 device identities and the authentication server side channel
//!
//! A joiner proves its identity by answering a server challenge with
//! `HMAC-SHA256(secret, id2 || challenge)`. The relaying router talks to
//! the server over a side channel using [`ServerMessage`]:
//!
//! ```text
//! | peer mac 8 | relay mac 8 | command 1 | payload ... |
//! ```

use crate::cursor::{Reader, Writer};
use crate::error::{MeshError, MeshResult};
use crate::tlv::{ID2_CHALLENGE_LEN, ID2_LEN};
use crate::types::ExtAddr;

#[cfg(feature = "crypto")]
use crate::config::Id2Credentials;
#[cfg(feature = "crypto")]
use hmac::{Hmac, Mac};
#[cfg(feature = "crypto")]
use rand::{rngs::StdRng, RngCore, SeedableRng};
#[cfg(feature = "crypto")]
use sha2::Sha256;
#[cfg(feature = "crypto")]
use std::collections::HashMap;
#[cfg(feature = "crypto")]
use tracing::{debug, info};

/// Source of a node's ID2 identity and challenge answers
pub trait Id2Provider: Send {
    fn id2(&self) -> [u8; ID2_LEN];

    /// Answer a server challenge
    fn auth_code(&self, challenge: &[u8; ID2_CHALLENGE_LEN]) -> MeshResult<Vec<u8>>;
}

#[cfg(feature = "crypto")]
type HmacSha256 = Hmac<Sha256>;

#[cfg(feature = "crypto")]
fn auth_mac(secret: &[u8], id2: &[u8; ID2_LEN], challenge: &[u8; ID2_CHALLENGE_LEN]) -> MeshResult<HmacSha256> {
    let mut mac = <HmacSha256 as Mac>::new_from_slice(secret).map_err(|_| MeshError::Fail)?;
    mac.update(id2);
    mac.update(challenge);
    Ok(mac)
}

/// Auth code for a challenge
#[cfg(feature = "crypto")]
pub fn compute_auth_code(secret: &[u8], id2: &[u8; ID2_LEN], challenge: &[u8; ID2_CHALLENGE_LEN]) -> MeshResult<Vec<u8>> {
    Ok(auth_mac(secret, id2, challenge)?.finalize().into_bytes().to_vec())
}

/// ID2 provider backed by credentials held in memory
#[cfg(feature = "crypto")]
#[derive(Debug, Clone)]
pub struct SoftwareId2 {
    credentials: Id2Credentials,
}

#[cfg(feature = "crypto")]
impl SoftwareId2 {
    pub fn new(credentials: Id2Credentials) -> Self {
        Self { credentials }
    }
}

#[cfg(feature = "crypto")]
impl Id2Provider for SoftwareId2 {
    fn id2(&self) -> [u8; ID2_LEN] {
        self.credentials.id2
    }

    fn auth_code(&self, challenge: &[u8; ID2_CHALLENGE_LEN]) -> MeshResult<Vec<u8>> {
        compute_auth_code(&self.credentials.secret, &self.credentials.id2, challenge)
    }
}

/// Side-channel command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerCommand {
    /// Relay → server: the joiner's ID2
    AuthRequest = 1,
    /// Server → relay: challenge for the joiner
    Challenge = 2,
    /// Relay → server: the joiner's answer
    AuthCode = 3,
    /// Server → relay: 1 accepted, 0 rejected
    Result = 4,
}

impl ServerCommand {
    fn from_u8(v: u8) -> MeshResult<Self> {
        match v {
            1 => Ok(ServerCommand::AuthRequest),
            2 => Ok(ServerCommand::Challenge),
            3 => Ok(ServerCommand::AuthCode),
            4 => Ok(ServerCommand::Result),
            _ => Err(MeshError::Parse("server command")),
        }
    }
}

/// Message between a relaying router and the auth server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerMessage {
    /// Node being authenticated
    pub peer: ExtAddr,
    /// Router relaying for it
    pub relay: ExtAddr,
    pub command: ServerCommand,
    pub payload: Vec<u8>,
}

impl ServerMessage {
    pub fn new(peer: ExtAddr, relay: ExtAddr, command: ServerCommand, payload: Vec<u8>) -> Self {
        Self {
            peer,
            relay,
            command,
            payload,
        }
    }

    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        let mut w = Writer::new();
        w.write_bytes(self.peer.as_bytes())?;
        w.write_bytes(self.relay.as_bytes())?;
        w.write_u8(self.command as u8)?;
        w.write_bytes(&self.payload)?;
        Ok(w.into_inner())
    }

    pub fn parse(data: &[u8]) -> MeshResult<Self> {
        let mut r = Reader::new(data);
        let peer = ExtAddr(r.read_array()?);
        let relay = ExtAddr(r.read_array()?);
        let command = ServerCommand::from_u8(r.read_u8()?)?;
        Ok(Self {
            peer,
            relay,
            command,
            payload: r.rest().to_vec(),
        })
    }
}

/// Outbound half of the side channel, installed by the host
pub trait AuthServerLink: Send {
    fn send(&mut self, message: Vec<u8>);
}

#[cfg(feature = "crypto")]
#[derive(Debug)]
struct PendingChallenge {
    id2: [u8; ID2_LEN],
    challenge: [u8; ID2_CHALLENGE_LEN],
}

/// Authentication server holding the registered device secrets
#[cfg(feature = "crypto")]
#[derive(Debug)]
pub struct Id2Server {
    devices: HashMap<[u8; ID2_LEN], Vec<u8>>,
    pending: HashMap<ExtAddr, PendingChallenge>,
    rng: StdRng,
}

#[cfg(feature = "crypto")]
impl Id2Server {
    pub fn new(seed: Option<u64>) -> Self {
        Self {
            devices: HashMap::new(),
            pending: HashMap::new(),
            rng: match seed {
                Some(seed) => StdRng::seed_from_u64(seed),
                None => StdRng::from_entropy(),
            },
        }
    }

    pub fn register(&mut self, credentials: &Id2Credentials) {
        self.devices.insert(credentials.id2, credentials.secret.clone());
    }

    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Answer one relay message, `None` when nothing is owed
    pub fn handle(&mut self, message: &ServerMessage) -> Option<ServerMessage> {
        let reply = |command, payload| Some(ServerMessage::new(message.peer, message.relay, command, payload));
        match message.command {
            ServerCommand::AuthRequest => {
                let id2: [u8; ID2_LEN] = message.payload.get(..ID2_LEN)?.try_into().ok()?;
                if !self.devices.contains_key(&id2) {
                    info!(peer = %message.peer, "unknown id2 rejected");
                    return reply(ServerCommand::Result, vec![0]);
                }
                let mut challenge = [0u8; ID2_CHALLENGE_LEN];
                self.rng.fill_bytes(&mut challenge);
                self.pending.insert(message.peer, PendingChallenge { id2, challenge });
                debug!(peer = %message.peer, "challenge issued");
                reply(ServerCommand::Challenge, challenge.to_vec())
            }
            ServerCommand::AuthCode => {
                let pending = self.pending.remove(&message.peer)?;
                let accepted = self
                    .devices
                    .get(&pending.id2)
                    .and_then(|secret| auth_mac(secret, &pending.id2, &pending.challenge).ok())
                    .is_some_and(|mac| mac.verify_slice(&message.payload).is_ok());
                info!(peer = %message.peer, accepted, "auth code checked");
                reply(ServerCommand::Result, vec![accepted as u8])
            }
            ServerCommand::Challenge | ServerCommand::Result => None,
        }
    }

    /// Handle a raw side-channel frame
    pub fn handle_bytes(&mut self, data: &[u8]) -> MeshResult<Option<Vec<u8>>> {
        let message = ServerMessage::parse(data)?;
        self.handle(&message).map(|m| m.to_bytes()).transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_layout() {
        let msg = ServerMessage::new(ExtAddr([1; 8]), ExtAddr([2; 8]), ServerCommand::Result, vec![1]);
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(bytes.len(), 8 + 8 + 1 + 1);
        assert_eq!(bytes[16], ServerCommand::Result as u8);
        assert_eq!(ServerMessage::parse(&bytes).unwrap(), msg);
        assert!(ServerMessage::parse(&bytes[..10]).is_err());
    }

    #[cfg(feature = "crypto")]
    #[test]
    fn test_challenge_round() {
        let creds = Id2Credentials::new("device-1", b"s3cret");
        let device = SoftwareId2::new(creds.clone());
        let mut server = Id2Server::new(Some(5));
        server.register(&creds);

        let (peer, relay) = (ExtAddr([1; 8]), ExtAddr([2; 8]));
        let request = ServerMessage::new(peer, relay, ServerCommand::AuthRequest, device.id2().to_vec());
        let challenge = server.handle(&request).unwrap();
        assert_eq!(challenge.command, ServerCommand::Challenge);
        let challenge: [u8; ID2_CHALLENGE_LEN] = challenge.payload.try_into().unwrap();

        let code = device.auth_code(&challenge).unwrap();
        let result = server
            .handle(&ServerMessage::new(peer, relay, ServerCommand::AuthCode, code))
            .unwrap();
        assert_eq!(result.payload, vec![1]);
    }

    #[cfg(feature = "crypto")]
    #[test]
    fn test_wrong_secret_and_unknown_device() {
        let creds = Id2Credentials::new("device-1", b"s3cret");
        let impostor = SoftwareId2::new(Id2Credentials::new("device-1", b"guess"));
        let mut server = Id2Server::new(Some(5));
        server.register(&creds);
        let (peer, relay) = (ExtAddr([1; 8]), ExtAddr([2; 8]));

        let challenge = server
            .handle(&ServerMessage::new(peer, relay, ServerCommand::AuthRequest, creds.id2.to_vec()))
            .unwrap();
        let challenge: [u8; ID2_CHALLENGE_LEN] = challenge.payload.try_into().unwrap();
        let code = impostor.auth_code(&challenge).unwrap();
        let result = server
            .handle(&ServerMessage::new(peer, relay, ServerCommand::AuthCode, code))
            .unwrap();
        assert_eq!(result.payload, vec![0]);

        let unknown = crate::config::id2_from_str("nobody");
        let result = server
            .handle(&ServerMessage::new(peer, relay, ServerCommand::AuthRequest, unknown.to_vec()))
            .unwrap();
        assert_eq!(result.command, ServerCommand::Result);
        assert_eq!(result.payload, vec![0]);
    }
}
