//! Joiner authentication over EAPOL with the ID2 method
//!
//! The router a joiner wants to attach to relays its identity to an
//! external authentication server and only accepts the attach request
//! once the server approved it.
//!
//! ```text
//! joiner                     router                       server
//!   |-- EAPOL-Start ----------->|                            |
//!   |<- Request/Identity -------|                            |
//!   |-- Response/Identity ----->|                            |
//!   |<- Request/ID2 Start ------|                            |
//!   |-- Response/ID2 Identity ->|-- AuthRequest(id2) ------->|
//!   |                           |<- Challenge ---------------|
//!   |<- Request/ID2 Challenge --|                            |
//!   |-- Response/ID2 AuthCode ->|-- AuthCode --------------->|
//!   |                           |<- Result ------------------|
//!   |<- Success / Failure ------|                            |
//! ```

pub mod eap;
pub mod id2;

use crate::command;
use crate::error::{MeshError, MeshResult};
use crate::message::MessageInfo;
use crate::node::MeshNode;
use crate::timer::TimerKind;
use crate::tlv::{Tlv, Tlvs, ID2_CHALLENGE_LEN, ID2_LEN};
use crate::types::{DeviceState, ExtAddr, InterfaceDownReason, MeshAddr};
use eap::{EapBody, EapCode, EapPacket, Eapol, Id2Command};
use id2::{ServerCommand, ServerMessage};
use serde::Serialize;
use tracing::{debug, info, warn};

/// EAPOL-Start attempts before the joiner gives up
pub const AUTH_REQUEST_RETRY_TIMES: u8 = 3;
/// Challenge or auth code retransmissions
pub const AUTH_RELAY_RETRY_TIMES: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AuthState {
    Idle,
    /// Joiner: EAPOL-Start sent
    RequestStart,
    /// Router: challenge forwarded to the joiner
    RelayChallenge,
    /// Joiner: auth code sent
    RelayAuthCode,
    Done,
}

/// Authentication progress, for either role
#[derive(Debug, Clone)]
pub struct AuthContext {
    pub state: AuthState,
    /// Whether we passed authentication ourselves
    pub success: bool,
    /// Joiner side: router we authenticate through
    pub candidate: Option<(usize, ExtAddr)>,
    /// Router side: joiner being relayed
    pub peer: Option<(usize, ExtAddr)>,
    peer_addr: MeshAddr,
    peer_id2: Option<[u8; ID2_LEN]>,
    challenge: Option<[u8; ID2_CHALLENGE_LEN]>,
    auth_code: Option<Vec<u8>>,
    /// Last EAP identifier sent (router) or accepted (joiner)
    pub identifier: u8,
    pub retry_times: u8,
}

impl Default for AuthContext {
    fn default() -> Self {
        Self {
            state: AuthState::Idle,
            success: false,
            candidate: None,
            peer: None,
            peer_addr: MeshAddr::NONE,
            peer_id2: None,
            challenge: None,
            auth_code: None,
            identifier: 0,
            retry_times: 0,
        }
    }
}

impl AuthContext {
    fn reset_relay(&mut self) {
        self.peer = None;
        self.peer_addr = MeshAddr::NONE;
        self.peer_id2 = None;
        self.challenge = None;
        if self.state == AuthState::RelayChallenge {
            self.state = AuthState::Idle;
        }
    }
}

/// Whether `id` is newer than `last`
fn is_newer_id(id: u8, last: u8) -> bool {
    (id.wrapping_sub(last) as i8) > 0
}

impl MeshNode {
    /// Whether we may attach, or relay for others
    pub fn auth_is_authenticated(&self) -> bool {
        self.auth.success || self.state == DeviceState::Leader
    }

    /// Authenticate through the router at `(hal, mac)` before attaching
    pub(crate) fn start_auth(&mut self, hal: usize, mac: ExtAddr) -> MeshResult<()> {
        if self.id2.is_none() {
            warn!("auth required but no id2 identity configured");
            return Err(MeshError::Fail);
        }
        if matches!(self.auth.state, AuthState::RequestStart | AuthState::RelayAuthCode) {
            return Err(MeshError::Busy);
        }
        let channel = self.hals[hal].neighbors.get(&mac).ok_or(MeshError::Fail)?.channel;
        if channel != 0 && channel != self.hals[hal].driver.channel() {
            self.set_channel(hal, channel)?;
        }
        self.stop_discover();
        info!(%mac, "authentication start");
        self.auth.candidate = Some((hal, mac));
        self.auth.state = AuthState::RequestStart;
        self.auth.retry_times = 0;
        self.auth.identifier = 0;
        self.auth.auth_code = None;
        let delay = 1 + self.random_jitter(self.hals[hal].timings.auth_request_interval_ms);
        self.event_loop.start_timer(TimerKind::Auth, delay);
        Ok(())
    }

    /// Forget any authentication in progress
    pub(crate) fn stop_auth(&mut self) {
        self.event_loop.stop_timer(TimerKind::Auth);
        self.auth = AuthContext::default();
    }

    fn send_dot1x(&mut self, hal: usize, dest: MeshAddr, eapol: &Eapol) -> MeshResult<()> {
        let body = eapol.to_bytes()?;
        self.send_command_bytes(hal, command::AUTH_DOT1X, dest, body)
    }

    /// Send to the router we authenticate through
    fn send_to_authenticator(&mut self, eapol: &Eapol) -> MeshResult<()> {
        let (hal, mac) = self.auth.candidate.ok_or(MeshError::Fail)?;
        let netid = self.hals[hal].neighbors.get(&mac).ok_or(MeshError::Fail)?.netid;
        let dest = MeshAddr::ext(netid, mac);
        self.send_dot1x(hal, dest, eapol)
    }

    fn send_to_peer(&mut self, packet: EapPacket) -> MeshResult<()> {
        let (hal, _) = self.auth.peer.ok_or(MeshError::Fail)?;
        let dest = self.auth.peer_addr;
        self.send_dot1x(hal, dest, &Eapol::Eap(packet))
    }

    fn send_auth_code(&mut self) -> MeshResult<()> {
        let code = self.auth.auth_code.clone().ok_or(MeshError::Fail)?;
        let packet = EapPacket::new(
            EapCode::Response,
            self.auth.identifier,
            EapBody::Id2 {
                command: Id2Command::AuthCode,
                tlvs: vec![Tlv::Id2AuthCode(code)],
            },
        );
        self.send_to_authenticator(&Eapol::Eap(packet))
    }

    fn send_challenge(&mut self) -> MeshResult<()> {
        let challenge = self.auth.challenge.ok_or(MeshError::Fail)?;
        let peer_id2 = self.auth.peer_id2.ok_or(MeshError::Fail)?;
        let packet = EapPacket::new(
            EapCode::Request,
            self.auth.identifier,
            EapBody::Id2 {
                command: Id2Command::Challenge,
                tlvs: vec![Tlv::Id2Challenge(challenge), Tlv::NodeId2(peer_id2)],
            },
        );
        self.send_to_peer(packet)
    }

    fn send_to_server(&mut self, command: ServerCommand, payload: Vec<u8>) -> MeshResult<()> {
        let (hal, peer) = self.auth.peer.ok_or(MeshError::Fail)?;
        let message = ServerMessage::new(peer, self.hals[hal].mac, command, payload).to_bytes()?;
        match self.auth_server.as_mut() {
            Some(link) => {
                link.send(message);
                Ok(())
            }
            None => {
                warn!("no auth server link installed");
                Err(MeshError::Fail)
            }
        }
    }

    pub(crate) fn handle_auth_timer(&mut self) {
        let hal = self.auth.candidate.or(self.auth.peer).map(|(hal, _)| hal).unwrap_or(0);
        let (request_interval, relay_interval) = (
            self.hals[hal].timings.auth_request_interval_ms,
            self.hals[hal].timings.auth_relay_interval_ms,
        );
        match self.auth.state {
            AuthState::RequestStart if self.auth.retry_times < AUTH_REQUEST_RETRY_TIMES => {
                self.auth.retry_times += 1;
                if let Err(err) = self.send_to_authenticator(&Eapol::Start) {
                    debug!(reason = %err, "eapol start not sent");
                }
                self.event_loop.start_timer(TimerKind::Auth, request_interval);
            }
            AuthState::RelayAuthCode if self.auth.retry_times < AUTH_RELAY_RETRY_TIMES => {
                self.auth.retry_times += 1;
                if let Err(err) = self.send_auth_code() {
                    debug!(reason = %err, "auth code not sent");
                }
                self.event_loop.start_timer(TimerKind::Auth, relay_interval);
            }
            AuthState::RelayChallenge if self.auth.retry_times < AUTH_RELAY_RETRY_TIMES => {
                self.auth.retry_times += 1;
                if let Err(err) = self.send_challenge() {
                    debug!(reason = %err, "challenge not sent");
                }
                self.event_loop.start_timer(TimerKind::Auth, relay_interval);
            }
            AuthState::RequestStart | AuthState::RelayAuthCode => {
                info!("authenticator gave no answer");
                self.auth_finished(false);
            }
            AuthState::RelayChallenge => {
                debug!("joiner gave no auth code, relay reset");
                self.auth.reset_relay();
            }
            AuthState::Idle | AuthState::Done => {}
        }
    }

    /// Joiner side outcome
    fn auth_finished(&mut self, accepted: bool) {
        self.event_loop.stop_timer(TimerKind::Auth);
        let candidate = self.auth.candidate.take();
        self.auth.state = if accepted { AuthState::Done } else { AuthState::Idle };
        self.auth.success = accepted;
        self.auth.auth_code = None;
        if accepted {
            info!("authentication succeeded");
            if let Err(err) = self.attach_start(candidate) {
                debug!(reason = %err, "attach after authentication failed");
            }
        } else {
            info!("authentication failed");
            if let Some((hal, mac)) = candidate {
                if let Some(nbr) = self.hals[hal].neighbors.get_mut(&mac) {
                    nbr.attach_candidate_timeout = AUTH_REQUEST_RETRY_TIMES;
                }
            }
            self.become_detached(InterfaceDownReason::AuthFail);
        }
    }

    /// Entry point of AUTH_DOT1X commands
    pub(crate) fn handle_dot1x(&mut self, info: &MessageInfo, body: &[u8]) -> MeshResult<()> {
        let eapol = Eapol::parse(body)?;
        let mac = self
            .update_neighbor(info, &Tlvs::default(), true)
            .ok_or(MeshError::Drop)?;
        match eapol {
            Eapol::Start => self.handle_eapol_start(info, mac),
            Eapol::Eap(packet) => match packet.code {
                EapCode::Request => self.handle_eap_request(info.hal, mac, packet),
                EapCode::Response => self.handle_eap_response(info.hal, mac, packet),
                EapCode::Success | EapCode::Failure => self.handle_eap_result(info.hal, mac, packet),
            },
        }
    }

    fn handle_eapol_start(&mut self, info: &MessageInfo, mac: ExtAddr) -> MeshResult<()> {
        if !self.config.auth_enabled || !self.auth_is_authenticated() || self.state < DeviceState::Leaf {
            return Err(MeshError::Drop);
        }
        if self.auth.state == AuthState::RelayChallenge && self.auth.peer != Some((info.hal, mac)) {
            return Err(MeshError::Busy);
        }
        debug!(%mac, "relaying authentication");
        self.auth.peer = Some((info.hal, mac));
        self.auth.peer_addr = MeshAddr::ext(info.src.netid, mac);
        self.auth.peer_id2 = None;
        self.auth.challenge = None;
        self.auth.retry_times = 0;
        self.auth.identifier = self.auth.identifier.wrapping_add(1);
        let packet = EapPacket::new(EapCode::Request, self.auth.identifier, EapBody::Identity(None));
        self.send_to_peer(packet)
    }

    /// Joiner side
    fn handle_eap_request(&mut self, hal: usize, mac: ExtAddr, packet: EapPacket) -> MeshResult<()> {
        if self.auth.candidate != Some((hal, mac)) || self.auth.success {
            return Err(MeshError::Drop);
        }
        let restart = packet.body == EapBody::Identity(None);
        if !restart && !is_newer_id(packet.id, self.auth.identifier) {
            return Err(MeshError::Drop);
        }
        self.auth.identifier = packet.id;
        let relay_interval = self.hals[hal].timings.auth_relay_interval_ms;
        let reply = match packet.body {
            EapBody::Identity(None) => {
                self.auth.retry_times = 0;
                self.event_loop.start_timer(TimerKind::Auth, relay_interval);
                EapBody::Identity(Some(self.hals[hal].mac))
            }
            EapBody::Id2 {
                command: Id2Command::Start,
                ..
            } => {
                let id2 = self.id2.as_ref().ok_or(MeshError::Fail)?.id2();
                EapBody::Id2 {
                    command: Id2Command::Identity,
                    tlvs: vec![Tlv::NodeId2(id2)],
                }
            }
            EapBody::Id2 {
                command: Id2Command::Challenge,
                tlvs,
            } => {
                let tlvs = Tlvs(tlvs);
                let provider = self.id2.as_ref().ok_or(MeshError::Fail)?;
                if tlvs.node_id2() != Some(provider.id2()) {
                    return Err(MeshError::Drop);
                }
                let challenge = tlvs.id2_challenge().ok_or(MeshError::Drop)?;
                let code = provider.auth_code(&challenge)?;
                self.auth.auth_code = Some(code);
                self.auth.state = AuthState::RelayAuthCode;
                self.auth.retry_times = 0;
                self.event_loop.start_timer(TimerKind::Auth, relay_interval);
                return self.send_auth_code();
            }
            _ => return Err(MeshError::Drop),
        };
        let packet = EapPacket::new(EapCode::Response, packet.id, reply);
        self.send_to_authenticator(&Eapol::Eap(packet))
    }

    /// Router side
    fn handle_eap_response(&mut self, hal: usize, mac: ExtAddr, packet: EapPacket) -> MeshResult<()> {
        if self.auth.peer != Some((hal, mac)) {
            return Err(MeshError::Drop);
        }
        if is_newer_id(packet.id, self.auth.identifier) {
            return Err(MeshError::Drop);
        }
        match packet.body {
            EapBody::Identity(Some(identity)) => {
                if identity != mac {
                    return Err(MeshError::Drop);
                }
                self.auth.identifier = self.auth.identifier.wrapping_add(1);
                let packet = EapPacket::new(
                    EapCode::Request,
                    self.auth.identifier,
                    EapBody::Id2 {
                        command: Id2Command::Start,
                        tlvs: Vec::new(),
                    },
                );
                self.send_to_peer(packet)
            }
            EapBody::Id2 {
                command: Id2Command::Identity,
                tlvs,
            } => {
                let id2 = Tlvs(tlvs).node_id2().ok_or(MeshError::Drop)?;
                self.auth.peer_id2 = Some(id2);
                self.send_to_server(ServerCommand::AuthRequest, id2.to_vec())
            }
            EapBody::Id2 {
                command: Id2Command::AuthCode,
                tlvs,
            } => {
                let code = Tlvs(tlvs).id2_auth_code().ok_or(MeshError::Drop)?;
                self.event_loop.stop_timer(TimerKind::Auth);
                self.send_to_server(ServerCommand::AuthCode, code)
            }
            _ => Err(MeshError::Drop),
        }
    }

    /// Joiner side
    fn handle_eap_result(&mut self, hal: usize, mac: ExtAddr, packet: EapPacket) -> MeshResult<()> {
        if self.auth.candidate != Some((hal, mac)) || !is_newer_id(packet.id, self.auth.identifier) {
            return Err(MeshError::Drop);
        }
        self.auth.identifier = packet.id;
        self.auth_finished(packet.code == EapCode::Success);
        Ok(())
    }

    /// Message from the authentication server side channel
    /// Run a server reply, counting it as a receive drop when rejected
    pub(crate) fn handle_auth_server_task(&mut self, data: &[u8]) {
        if let Err(err) = self.handle_auth_server_message(data) {
            let hal = self.auth.peer.map(|(hal, _)| hal).unwrap_or(0);
            if let Some(ctx) = self.hals.get_mut(hal) {
                match err {
                    MeshError::Drop => ctx.stats.in_filterings += 1,
                    _ => ctx.stats.in_drops += 1,
                }
            }
            debug!(reason = %err, "auth server message dropped");
        }
    }

    pub(crate) fn handle_auth_server_message(&mut self, data: &[u8]) -> MeshResult<()> {
        let message = ServerMessage::parse(data)?;
        let (hal, peer) = self.auth.peer.ok_or(MeshError::Drop)?;
        if message.peer != peer || message.relay != self.hals[hal].mac {
            return Err(MeshError::Drop);
        }
        match message.command {
            ServerCommand::Challenge => {
                let challenge: [u8; ID2_CHALLENGE_LEN] = message
                    .payload
                    .as_slice()
                    .try_into()
                    .map_err(|_| MeshError::Parse("id2 challenge"))?;
                self.auth.challenge = Some(challenge);
                self.auth.state = AuthState::RelayChallenge;
                self.auth.retry_times = 0;
                self.auth.identifier = self.auth.identifier.wrapping_add(1);
                let interval = self.hals[hal].timings.auth_relay_interval_ms;
                self.event_loop.start_timer(TimerKind::Auth, interval);
                self.send_challenge()
            }
            ServerCommand::Result => {
                let accepted = message.payload.first() == Some(&1);
                info!(%peer, accepted, "authentication result relayed");
                if let Some(nbr) = self.hals[hal].neighbors.get_mut(&peer) {
                    nbr.flags.set_authenticated(accepted);
                }
                self.event_loop.stop_timer(TimerKind::Auth);
                self.auth.identifier = self.auth.identifier.wrapping_add(1);
                let code = if accepted { EapCode::Success } else { EapCode::Failure };
                let packet = EapPacket::new(code, self.auth.identifier, EapBody::Empty);
                let sent = self.send_to_peer(packet);
                if self.auth.state == AuthState::RelayChallenge {
                    self.auth.state = AuthState::Idle;
                }
                self.auth.reset_relay();
                sent
            }
            ServerCommand::AuthRequest | ServerCommand::AuthCode => Err(MeshError::Drop),
        }
    }
}
