//! Mesh forwarder: frame I/O, queues and command dispatch
//!
//! ## Send path
//!
//! ```text
//! send_message ─► loopback? ─► resolve address ─► cmd/data queue ─► SendNext
//!                                   │ unresolved                        │
//!                                   ▼                                   ▼
//!                             pending queue       next hop ─► header ─► fragment ─► encrypt ─► driver
//! ```
//!
//! Commands are drained before data. A message stays at the head of its
//! queue until its last fragment is on the air; a failed transmission is
//! retried up to [`MESSAGE_RETRIES`] times.
//!
//! ## Receive path
//!
//! ```text
//! frame ─► whitelist ─► header ─► decrypt ─► IEs ─► reassemble ─► receive / forward
//! ```

pub mod fragment;
pub mod header;

use crate::command;
use crate::cursor::{Reader, Writer};
use crate::error::{MeshError, MeshResult};
use crate::hal::{InFlight, RxFrame, TxStatus};
use crate::keys::{apply_frame_cipher, GROUP_KEY1_INDEX, INVALID_KEY_INDEX, ONE_TIME_KEY_INDEX};
use crate::mcast::{McastHeader, MCAST_HEADER_LEN};
use crate::message::{Message, MessageInfo};
use crate::mgmt::AttachState;
use crate::node::MeshNode;
use crate::timer::{Task, TimerKind};
use crate::tlv::{encode_tlvs, HeaderIes, Tlv, Tlvs, REVERSE_RSSI_ACCEPT_REQUEST};
use crate::types::{
    is_same_mainnet, is_unique_sid, Addr, DeviceState, ExtAddr, FrameType, MeshAddr, BCAST_NETID, BCAST_SID, INVALID_SID,
};
use fragment::{plan_fragment, FragHeader};
use header::{is_mesh_header, MeshHeader, FORWARD_HOP_LIMIT};
use tracing::{debug, trace, warn};

/// Driver completion timeout
pub const SENDING_TIMEOUT_MS: u64 = 5_000;
/// Transmission attempts per frame
pub const MESSAGE_RETRIES: u8 = 3;

/// Where the next frame of a message goes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NextHop {
    Bcast,
    Ucast(ExtAddr),
    /// Held for a sleeping neighbor
    Buffered(ExtAddr),
}

/// What to do with a received frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Disposition {
    Receive,
    Forward,
    ReceiveAndForward,
    Drop(&'static str),
}

impl MeshNode {
    /// Our address on the network of `hal`
    pub(crate) fn local_addr(&self, hal: usize) -> MeshAddr {
        let netid = self
            .networks
            .get(self.network_for_hal(hal))
            .map(|n| n.meshnetid)
            .unwrap_or(BCAST_NETID);
        if self.has_sid() {
            MeshAddr::short(netid, self.attach.sid)
        } else {
            MeshAddr::ext(netid, self.hals[hal].mac)
        }
    }

    fn is_local_addr(&self, addr: &MeshAddr) -> bool {
        match addr.addr {
            Addr::Short(sid) => {
                self.has_sid() && sid == self.attach.sid && self.networks.iter().any(|n| n.meshnetid == addr.netid)
            }
            Addr::Ext(mac) => mac == self.uuid || self.hals.iter().any(|h| h.mac == mac),
            Addr::None | Addr::Bcast => false,
        }
    }

    /// Send a command with a TLV body
    pub(crate) fn send_command(&mut self, hal: usize, cmd: u8, dest: MeshAddr, tlvs: &[Tlv]) -> MeshResult<()> {
        let body = encode_tlvs(tlvs)?;
        self.send_command_bytes(hal, cmd, dest, body)
    }

    /// Send a command with a raw body
    pub(crate) fn send_command_bytes(&mut self, hal: usize, cmd: u8, dest: MeshAddr, body: Vec<u8>) -> MeshResult<()> {
        self.send_command_via(hal, cmd, dest, MeshAddr::NONE, body)
    }

    /// Send a command that `dest` relays on to `dest2`
    pub(crate) fn send_proxied_command(
        &mut self,
        hal: usize,
        cmd: u8,
        dest: MeshAddr,
        dest2: MeshAddr,
        tlvs: &[Tlv],
    ) -> MeshResult<()> {
        let body = encode_tlvs(tlvs)?;
        self.send_command_via(hal, cmd, dest, dest2, body)
    }

    fn send_command_via(&mut self, hal: usize, cmd: u8, dest: MeshAddr, dest2: MeshAddr, body: Vec<u8>) -> MeshResult<()> {
        if hal >= self.hals.len() {
            return Err(MeshError::Fail);
        }
        let mut data = Vec::with_capacity(body.len() + 1);
        data.push(cmd);
        data.extend_from_slice(&body);
        let mut info = MessageInfo::command(cmd);
        info.hal = hal;
        info.network = self.network_for_hal(hal);
        info.src = self.local_addr(hal);
        info.dest = dest;
        info.dest2 = dest2;
        info.flags.set_insert_header(true);
        let message = self.pool.alloc(data, info)?;
        trace!(hal, command = command::command_name(cmd), dest = %dest, "send command");
        self.send_message(message)
    }

    /// Send application data
    pub fn send_data(&mut self, dest: MeshAddr, payload: &[u8]) -> MeshResult<()> {
        if self.hals.is_empty() || !self.is_attached() {
            return Err(MeshError::Fail);
        }
        let hal = match dest.addr {
            Addr::Ext(mac) => self.hals.iter().position(|h| h.neighbors.get(&mac).is_some()).unwrap_or(0),
            _ => 0,
        };
        let mut info = MessageInfo::new(FrameType::Data);
        info.hal = hal;
        info.network = self.network_for_hal(hal);
        info.src = self.local_addr(hal);
        info.dest = dest;
        info.flags.set_insert_header(true);
        let message = self.pool.alloc(payload.to_vec(), info)?;
        self.send_message(message)
    }

    /// Send data to a node known only by its uuid
    pub fn send_data_to_uuid(&mut self, uuid: ExtAddr, payload: &[u8]) -> MeshResult<()> {
        let netid = self.main_netid();
        self.send_data(MeshAddr::ext(netid, uuid), payload)
    }

    fn key_index_for(&self, info: &MessageInfo) -> u8 {
        if self.config.sec_level == 0 {
            return INVALID_KEY_INDEX;
        }
        match info.command {
            Some(command::ATTACH_RESPONSE) => ONE_TIME_KEY_INDEX,
            Some(cmd) if command::is_clear_command(cmd) => INVALID_KEY_INDEX,
            _ => GROUP_KEY1_INDEX,
        }
    }

    /// Queue a message for transmission
    ///
    /// Locally addressed messages are looped back. A message whose
    /// destination needs a query is parked and `AddressQuery` returned.
    pub(crate) fn send_message(&mut self, mut message: Message) -> MeshResult<()> {
        if self.is_local_addr(&message.info.dest) {
            self.event_loop.post(Task::Loopback(message));
            return Ok(());
        }

        if message.info.frame_type == FrameType::Data && !message.info.flags.forward() {
            match self.address_resolve(&mut message) {
                Ok(()) => {}
                Err(MeshError::AddressQuery) => {
                    let hal = message.info.hal;
                    self.hals[hal].pending_queue.enqueue(message);
                    return Err(MeshError::AddressQuery);
                }
                Err(err) => {
                    self.hals[message.info.hal].stats.out_errors += 1;
                    return Err(err);
                }
            }
        }

        message.info.key_index = self.key_index_for(&message.info);
        message.info.flags.set_encrypt(message.info.key_index != INVALID_KEY_INDEX);

        let is_bcast_data = message.info.frame_type == FrameType::Data && message.info.dest.is_broadcast();
        if is_bcast_data && !message.info.flags.mcast() {
            message.info.flags.set_mcast(true);
            let header = self.mcast.next_header(message.info.src.netid, self.attach.sid);
            let mut w = Writer::new();
            header.encode(&mut w)?;
            w.write_bytes(message.data())?;
            *message.data_mut() = w.into_inner();
            for hal in 0..self.hals.len() {
                if hal == message.info.hal {
                    continue;
                }
                let mut copy = self.pool.duplicate(&message)?;
                copy.info.hal = hal;
                copy.info.network = self.network_for_hal(hal);
                self.enqueue_message(copy);
            }
        }
        self.enqueue_message(message);
        Ok(())
    }

    fn enqueue_message(&mut self, message: Message) {
        let hal = message.info.hal;
        let Some(ctx) = self.hals.get_mut(hal) else {
            return;
        };
        match message.info.frame_type {
            FrameType::Cmd => ctx.cmd_queue.enqueue(message),
            FrameType::Data => ctx.data_queue.enqueue(message),
        }
        self.schedule_send(hal);
    }

    fn schedule_send(&mut self, hal: usize) {
        let ctx = &mut self.hals[hal];
        if ctx.send_scheduled || ctx.sending.is_some() {
            return;
        }
        if ctx.cmd_queue.is_empty() && ctx.data_queue.is_empty() {
            return;
        }
        ctx.send_scheduled = true;
        self.event_loop.post(Task::SendNext { hal });
    }

    fn next_hop(&mut self, message: &Message) -> MeshResult<NextHop> {
        let info = &message.info;
        let hal = info.hal;
        match info.dest.addr {
            Addr::Bcast | Addr::Short(BCAST_SID) => Ok(NextHop::Bcast),
            Addr::None => Err(MeshError::Drop),
            Addr::Ext(mac) => {
                if self.hals[hal].neighbors.get(&mac).is_some() {
                    Ok(NextHop::Ucast(mac))
                } else {
                    Err(MeshError::Drop)
                }
            }
            Addr::Short(sid) => {
                let netid = info.dest.netid;
                let next_sid = self.router_get_next_hop(info.network, netid, sid);
                if next_sid == INVALID_SID || !is_unique_sid(next_sid) {
                    return Err(MeshError::Drop);
                }
                let nbr = self.hals[hal]
                    .neighbors
                    .get_by_sid(netid, next_sid)
                    .or_else(|| {
                        self.hals[hal]
                            .neighbors
                            .iter()
                            .find(|n| n.sid == next_sid && is_same_mainnet(n.netid, netid))
                    })
                    .ok_or(MeshError::Drop)?;
                if !nbr.mode.is_rx_on() && !nbr.flags.wakeup() && info.frame_type == FrameType::Data {
                    return Ok(NextHop::Buffered(nbr.mac));
                }
                Ok(NextHop::Ucast(nbr.mac))
            }
        }
    }

    /// Transmit the next frame queued on a HAL
    pub(crate) fn handle_send_next(&mut self, hal: usize) {
        let Some(ctx) = self.hals.get_mut(hal) else {
            return;
        };
        ctx.send_scheduled = false;
        if ctx.sending.is_some() {
            return;
        }
        let message = match ctx.cmd_queue.dequeue() {
            Some(m) => m,
            None => match ctx.data_queue.dequeue() {
                Some(m) => m,
                None => return,
            },
        };

        let next = match self.next_hop(&message) {
            Ok(next) => next,
            Err(err) => {
                self.drop_unroutable(message, err);
                self.schedule_send(hal);
                return;
            }
        };
        let (dest_mac, bcast) = match next {
            NextHop::Bcast => (None, true),
            NextHop::Ucast(mac) => (Some(mac), false),
            NextHop::Buffered(mac) => {
                debug!(hal, %mac, "frame buffered for sleeping neighbor");
                if let Some(nbr) = self.hals[hal].neighbors.get_mut(&mac) {
                    nbr.buffer_queue.enqueue(message);
                }
                self.schedule_send(hal);
                return;
            }
        };

        match self.transmit(message, dest_mac, bcast) {
            Ok((message, sent_len, TxStatus::Pending)) => {
                self.hals[hal].sending = Some(InFlight {
                    message,
                    sent_len,
                    bcast,
                });
                self.event_loop
                    .start_timer(TimerKind::Sending { hal }, SENDING_TIMEOUT_MS);
            }
            Ok((message, sent_len, status)) => self.complete_frame(hal, message, sent_len, status),
            Err(err) => {
                warn!(hal, ?err, reason = "frame build failed", "message dropped");
                self.hals[hal].stats.out_errors += 1;
                self.schedule_send(hal);
            }
        }
    }

    /// Build and hand the next frame of a message to the driver
    fn transmit(
        &mut self,
        mut message: Message,
        dest_mac: Option<ExtAddr>,
        bcast: bool,
    ) -> MeshResult<(Message, usize, TxStatus)> {
        let hal = message.info.hal;
        let info = &message.info;

        let mut header = MeshHeader::new(info.frame_type, info.src, info.dest);
        header.dest2 = info.dest2.addr;
        header.hops = if info.flags.forward() {
            info.hops
        } else {
            FORWARD_HOP_LIMIT
        };
        let reverse_rssi = if info.flags.accept_request() {
            Some(REVERSE_RSSI_ACCEPT_REQUEST)
        } else {
            dest_mac
                .and_then(|mac| self.hals[hal].neighbors.get(&mac))
                .map(|n| n.stats.reverse_rssi)
        };
        header.ies = Some(HeaderIes {
            mode: Some(self.mode),
            reverse_rssi,
        });
        header.secure = info.flags.encrypt();

        let mtu = if bcast {
            self.hals[hal].driver.bcast_mtu()
        } else {
            self.hals[hal].driver.ucast_mtu()
        };
        let header_len = header.encoded_len();
        if message.info.frag_offset == 0 && message.info.frag_tag == 0 && header_len + message.len() > mtu {
            message.info.frag_tag = self.hals[hal].alloc_frag_tag();
        }
        let offset = message.info.frag_offset;
        let (frag, len) = plan_fragment(message.len(), offset, header_len, mtu, message.info.frag_tag)?;

        let mut w = Writer::with_limit(mtu);
        header.encode(&mut w)?;
        if let Some(frag) = frag {
            frag.encode(&mut w)?;
        }
        w.write_bytes(&message.data()[offset..offset + len])?;
        let mut frame = w.into_inner();

        if header.secure {
            let key = match message.info.key_index {
                ONE_TIME_KEY_INDEX => dest_mac
                    .and_then(|mac| self.hals[hal].neighbors.get(&mac))
                    .and_then(|n| n.one_time_key.clone()),
                index => self.keys.get_key(index).cloned(),
            }
            .ok_or(MeshError::Fail)?;
            apply_frame_cipher(&key, &mut frame[header.fixed_len()..])?;
        }

        let ctx = &mut self.hals[hal];
        let status = match dest_mac {
            Some(mac) if !bcast => ctx.driver.send_ucast(&frame, &mac),
            _ => ctx.driver.send_bcast(&frame),
        };
        if status != TxStatus::Failed {
            ctx.stats.out_frames += 1;
            match message.info.frame_type {
                FrameType::Cmd => ctx.stats.out_command += 1,
                FrameType::Data => ctx.stats.out_data += 1,
            }
        }
        trace!(hal, len = frame.len(), ?status, "frame handed to driver");
        Ok((message, len, status))
    }

    /// Account for the outcome of one frame
    fn complete_frame(&mut self, hal: usize, mut message: Message, sent_len: usize, status: TxStatus) {
        match status {
            TxStatus::Sent | TxStatus::Pending => {
                message.info.frag_offset += sent_len;
                message.info.retries = 0;
                if message.info.frag_offset < message.len() {
                    self.requeue_front(hal, message);
                }
            }
            TxStatus::Failed => {
                message.info.retries += 1;
                if message.info.retries < MESSAGE_RETRIES {
                    self.requeue_front(hal, message);
                } else {
                    self.hals[hal].stats.out_errors += 1;
                    self.drop_unroutable(message, MeshError::Drop);
                }
            }
        }
        self.schedule_send(hal);
    }

    fn requeue_front(&mut self, hal: usize, message: Message) {
        let ctx = &mut self.hals[hal];
        match message.info.frame_type {
            FrameType::Cmd => ctx.cmd_queue.requeue_front(message),
            FrameType::Data => ctx.data_queue.requeue_front(message),
        }
    }

    /// Drop a message that cannot reach its destination
    fn drop_unroutable(&mut self, message: Message, err: MeshError) {
        let info = message.info;
        warn!(
            hal = info.hal,
            dest = %info.dest,
            command = info.command.map(command::command_name),
            reason = %err,
            "message dropped"
        );
        let unicast = !info.dest.is_broadcast() && !info.dest.is_none();
        if info.frame_type != FrameType::Data || !unicast {
            return;
        }
        if self.is_local_addr(&info.src) {
            if let Some(sid) = info.dest.sid() {
                self.resolver.invalidate(info.dest.netid, sid);
            }
        } else if info.src.sid().is_some() {
            let _ = self.send_address_unreachable(info.hal, info.src, info.dest);
        }
    }

    /// Asynchronous driver completion
    pub(crate) fn handle_send_done(&mut self, hal: usize, status: TxStatus) {
        let Some(inflight) = self.hals.get_mut(hal).and_then(|h| h.sending.take()) else {
            return;
        };
        self.event_loop.stop_timer(TimerKind::Sending { hal });
        let status = if status == TxStatus::Pending {
            TxStatus::Sent
        } else {
            status
        };
        self.complete_frame(hal, inflight.message, inflight.sent_len, status);
    }

    pub(crate) fn handle_sending_timeout(&mut self, hal: usize) {
        let Some(inflight) = self.hals.get_mut(hal).and_then(|h| h.sending.take()) else {
            return;
        };
        self.hals[hal].stats.sending_timeouts += 1;
        debug!(hal, bcast = inflight.bcast, "sending timeout");
        self.complete_frame(hal, inflight.message, inflight.sent_len, TxStatus::Failed);
    }

    fn network_for_netid(&self, netid: u16, hal: usize) -> usize {
        self.networks
            .iter()
            .position(|n| n.meshnetid == netid && n.hal == hal)
            .unwrap_or_else(|| self.network_for_hal(hal))
    }

    fn rx_key(&self, hal: usize, src_mac: &ExtAddr) -> Option<crate::keys::Key> {
        if self.attach.state == AttachState::Request && self.attach.candidate == Some((hal, *src_mac)) {
            if let Some(key) = self.keys.get_key(ONE_TIME_KEY_INDEX) {
                return Some(key.clone());
            }
        }
        self.keys.get_key(GROUP_KEY1_INDEX).cloned()
    }

    /// Entry point of a frame handed over by a HAL
    pub(crate) fn handle_received_frame(&mut self, frame: RxFrame) {
        let hal = frame.hal;
        if hal >= self.hals.len() {
            return;
        }
        self.hals[hal].stats.in_frames += 1;
        if let Err(err) = self.receive_frame(frame) {
            let stats = &mut self.hals[hal].stats;
            match err {
                MeshError::Drop => stats.in_filterings += 1,
                _ => stats.in_drops += 1,
            }
            debug!(hal, reason = %err, "received frame dropped");
        }
    }

    fn receive_frame(&mut self, frame: RxFrame) -> MeshResult<()> {
        let hal = frame.hal;
        let src_mac = frame.src_mac;
        if !self.whitelist.is_allowed(&src_mac) || !self.lowpower_is_radio_up() {
            return Err(MeshError::Drop);
        }
        if let Some(dest_mac) = frame.dest_mac {
            if dest_mac != self.hals[hal].mac {
                return Err(MeshError::Drop);
            }
        }
        if src_mac == self.hals[hal].mac {
            return Err(MeshError::Drop);
        }

        let mut data = frame.data;
        let first = *data.first().ok_or(MeshError::Parse("empty frame"))?;
        if !is_mesh_header(first) {
            return Err(MeshError::Parse("dispatch"));
        }
        let (mut header, has_ies, fixed_len) = {
            let mut r = Reader::new(&data);
            let (header, has_ies) = MeshHeader::decode_fixed(&mut r)?;
            (header, has_ies, r.position())
        };
        if header.secure {
            let key = self.rx_key(hal, &src_mac).ok_or(MeshError::Fail)?;
            apply_frame_cipher(&key, &mut data[fixed_len..])?;
        }

        let mut r = Reader::new(&data[fixed_len..]);
        if has_ies {
            header.ies = Some(HeaderIes::decode(&mut r)?);
        }
        let rest = r.rest();
        let payload = if rest.first().copied().is_some_and(FragHeader::is_frag) {
            let mut fr = Reader::new(rest);
            let frag = FragHeader::decode(&mut fr)?;
            let now = self.now();
            match self.hals[hal].reassembler.insert(src_mac, &frag, fr.rest(), now)? {
                Some(payload) => payload,
                None => return Ok(()),
            }
        } else {
            rest.to_vec()
        };

        let mut info = MessageInfo::new(header.frame_type);
        info.src = header.src;
        info.dest = header.dest;
        info.dest2 = MeshAddr {
            netid: header.dest.netid,
            addr: header.dest2,
        };
        info.hops = header.hops;
        info.hal = hal;
        info.network = self.network_for_netid(header.dest.netid, hal);
        info.src_mac = Some(src_mac);
        info.mode = header.ies.and_then(|ies| ies.mode);
        info.reverse_rssi = header.ies.and_then(|ies| ies.reverse_rssi);
        info.rssi = frame.rssi;
        info.payload_offset = fixed_len;
        info.header_ies_offset = fixed_len;
        info.flags.set_encrypt(header.secure);
        if header.frame_type == FrameType::Cmd {
            info.command = Some(*payload.first().ok_or(MeshError::Parse("empty command"))?);
        }
        self.check_security_policy(&info)?;

        self.touch_neighbor(hal, &src_mac, frame.rssi);
        if info.reverse_rssi == Some(REVERSE_RSSI_ACCEPT_REQUEST) {
            let netid = info.src.netid;
            let _ = self.send_command(hal, command::LINK_ACCEPT, MeshAddr::ext(netid, src_mac), &[]);
        }

        match self.classify(&info) {
            Disposition::Drop(reason) => {
                trace!(hal, reason, "frame not for us");
                Err(MeshError::Drop)
            }
            Disposition::Receive => self.receive_local(info, payload),
            Disposition::Forward => self.forward(info, payload),
            Disposition::ReceiveAndForward => {
                // Flooded data: suppress duplicates before anything else
                let mcast = McastHeader::decode(&mut Reader::new(&payload))?;
                let now = self.now();
                let local_netid = self.main_netid();
                self.mcast.check(&mcast, local_netid, self.attach.sid, now)?;
                if self.state >= DeviceState::Router {
                    let _ = self.forward(info.clone(), payload.clone());
                }
                self.deliver_data(&info, &payload[MCAST_HEADER_LEN..]);
                Ok(())
            }
        }
    }

    fn check_security_policy(&self, info: &MessageInfo) -> MeshResult<()> {
        if self.config.sec_level == 0 || info.flags.encrypt() {
            return Ok(());
        }
        match info.command {
            Some(cmd) if command::is_clear_command(cmd) => Ok(()),
            _ => Err(MeshError::Fail),
        }
    }

    fn classify(&self, info: &MessageInfo) -> Disposition {
        let dest = &info.dest;
        match dest.addr {
            Addr::None => Disposition::Drop("no destination"),
            Addr::Bcast | Addr::Short(BCAST_SID) => match info.frame_type {
                FrameType::Cmd => Disposition::Receive,
                FrameType::Data => {
                    let ours = dest.netid == BCAST_NETID
                        || self.networks.iter().any(|n| is_same_mainnet(n.meshnetid, dest.netid));
                    if ours && self.is_attached() {
                        Disposition::ReceiveAndForward
                    } else {
                        Disposition::Drop("foreign broadcast")
                    }
                }
            },
            Addr::Ext(mac) => {
                if self.hals[info.hal].mac == mac || mac == self.uuid {
                    Disposition::Receive
                } else {
                    Disposition::Drop("ext address mismatch")
                }
            }
            Addr::Short(_) if self.is_local_addr(dest) => match info.dest2.addr {
                Addr::Short(sid2) if sid2 != self.attach.sid => Disposition::Forward,
                Addr::Ext(mac) if !self.hals.iter().any(|h| h.mac == mac) => Disposition::Forward,
                _ => Disposition::Receive,
            },
            Addr::Short(_) => {
                if self.state >= DeviceState::Router && info.hops > 1 {
                    Disposition::Forward
                } else {
                    Disposition::Drop("not a router")
                }
            }
        }
    }

    /// Relay a frame towards its destination
    fn forward(&mut self, mut info: MessageInfo, payload: Vec<u8>) -> MeshResult<()> {
        if info.hops <= 1 {
            return Err(MeshError::Drop);
        }
        info.hops -= 1;
        if self.is_local_addr(&info.dest) && !info.dest2.is_none() {
            info.dest = info.dest2;
            info.dest2 = MeshAddr::NONE;
        }
        info.flags.set_forward(true);
        info.flags.set_header_ies(false);
        info.frag_offset = 0;
        info.frag_tag = 0;
        info.retries = 0;
        info.src_mac = None;
        let bcast = info.dest.is_broadcast();
        let origin_hal = info.hal;
        let mut message = self.pool.alloc(payload, info)?;
        if bcast {
            for hal in 0..self.hals.len() {
                let mut copy = self.pool.duplicate(&message)?;
                copy.info.hal = hal;
                copy.info.network = self.network_for_hal(hal);
                copy.info.key_index = self.key_index_for(&copy.info);
                copy.info.flags.set_encrypt(copy.info.key_index != INVALID_KEY_INDEX);
                self.enqueue_message(copy);
            }
            return Ok(());
        }
        message.info.hal = origin_hal;
        message.info.key_index = self.key_index_for(&message.info);
        message.info.flags.set_encrypt(message.info.key_index != INVALID_KEY_INDEX);
        self.enqueue_message(message);
        Ok(())
    }

    fn receive_local(&mut self, info: MessageInfo, payload: Vec<u8>) -> MeshResult<()> {
        match info.frame_type {
            FrameType::Cmd => {
                self.hals[info.hal].stats.in_command += 1;
                self.dispatch_command(&info, &payload)
            }
            FrameType::Data => {
                self.deliver_data(&info, &payload);
                Ok(())
            }
        }
    }

    fn deliver_data(&mut self, info: &MessageInfo, payload: &[u8]) {
        if let Some(ctx) = self.hals.get_mut(info.hal) {
            ctx.stats.in_data += 1;
        }
        match self.ip.as_mut() {
            Some(ip) => ip.input(info.src, payload),
            None => debug!(src = %info.src, len = payload.len(), "data received without ip adapter"),
        }
    }

    /// Dispatch a locally addressed message without touching a radio
    pub(crate) fn handle_loopback(&mut self, message: Message) {
        let info = message.info.clone();
        let result = match info.frame_type {
            FrameType::Cmd => self.dispatch_command(&info, message.data()),
            FrameType::Data => {
                let payload = if info.flags.mcast() {
                    message.data().get(MCAST_HEADER_LEN..).unwrap_or_default()
                } else {
                    message.data()
                };
                let payload = payload.to_vec();
                self.deliver_data(&info, &payload);
                Ok(())
            }
        };
        if let Err(err) = result {
            debug!(reason = %err, "loopback message dropped");
        }
    }

    /// Hand a command body to its handler
    pub(crate) fn dispatch_command(&mut self, info: &MessageInfo, payload: &[u8]) -> MeshResult<()> {
        let (&cmd, body) = payload.split_first().ok_or(MeshError::Parse("empty command"))?;
        trace!(hal = info.hal, command = command::command_name(cmd), src = %info.src, "command received");
        let result = match cmd {
            command::ROUTING_INFO_UPDATE => self.handle_routing_info_update(info, body),
            command::AUTH_DOT1X => self.handle_dot1x(info, body),
            _ => {
                let tlvs = Tlvs::parse(body)?;
                match cmd {
                    command::ADVERTISEMENT => self.handle_advertisement(info, &tlvs),
                    command::DISCOVERY_REQUEST => self.handle_discovery_request(info, &tlvs),
                    command::DISCOVERY_RESPONSE => self.handle_discovery_response(info, &tlvs),
                    command::ATTACH_REQUEST => self.handle_attach_request(info, &tlvs),
                    command::ATTACH_RESPONSE => self.handle_attach_response(info, &tlvs),
                    command::SID_REQUEST => self.handle_sid_request(info, &tlvs),
                    command::SID_RESPONSE => self.handle_sid_response(info, &tlvs),
                    command::ADDRESS_QUERY => self.handle_address_query(info, &tlvs),
                    command::ADDRESS_QUERY_RESPONSE => self.handle_address_query_response(info, &tlvs),
                    command::ADDRESS_NOTIFICATION => self.handle_address_notification(info, &tlvs),
                    command::ADDRESS_UNREACHABLE => self.handle_address_unreachable(info, &tlvs),
                    command::ADDRESS_ERROR => self.handle_address_error(info, &tlvs),
                    command::LINK_REQUEST => self.handle_link_request(info, &tlvs),
                    command::LINK_ACCEPT => self.handle_link_accept(info, &tlvs),
                    command::LINK_ACCEPT_AND_REQUEST => self.handle_link_accept_and_request(info, &tlvs),
                    _ => Err(MeshError::Parse("unknown command")),
                }
            }
        };
        if let Err(err) = &result {
            debug!(command = command::command_name(cmd), reason = %err, "command not handled");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MeshConfig;
    use crate::sim::{SimMedium, Simulator};

    #[test]
    fn test_send_requires_attachment() {
        let medium = SimMedium::new();
        let mut sim = Simulator::new(medium);
        let a = sim.add_node(MeshConfig::default().with_seed(1));
        let err = sim.node_mut(a).send_data(MeshAddr::bcast(0x1200), b"hi");
        assert_eq!(err, Err(MeshError::Fail));
    }

    #[test]
    fn test_local_destination_loops_back() {
        let medium = SimMedium::new();
        let mut sim = Simulator::new(medium);
        let a = sim.add_node(MeshConfig::default().with_seed(2));
        sim.start_all();
        sim.run_for(10_000);
        let node = sim.node_mut(a);
        assert!(node.is_attached());
        let me = node.local_addr(0);
        node.send_data(me, b"self").unwrap();
        sim.run_for(10);
        let received = sim.received(a);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].payload, b"self".to_vec());
        assert_eq!(sim.node(a).hal_stats(0).out_data, 0);
    }
}
