//! In-memory radio medium and multi-node simulator
//!
//! [`SimMedium`] is a shared broadcast medium: every registered radio on
//! the same channel hears every frame unless the link between the two
//! radios was cut. [`Simulator`] drives a set of nodes over one medium
//! with injected time, jumping straight to the next timer deadline.
//!
//! ```ignore
//! let mut sim = Simulator::new(SimMedium::new());
//! let leader = sim.add_node(MeshConfig::default().with_seed(1));
//! let joiner = sim.add_node(MeshConfig::default().with_seed(2));
//! sim.start_all();
//! sim.run_for(30_000);
//! assert!(sim.node(joiner).is_attached());
//! ```

use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::hal::{Hal, HalEventSink, TxStatus};
use crate::ip::{QueueAdapter, Received};
use crate::node::MeshNode;
use crate::types::{ExtAddr, MediaType};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;

/// Frame size accepted by simulated radios
pub const SIM_MTU: usize = 512;
/// Signal strength of every simulated link
pub const SIM_RSSI: i8 = -40;
/// Channel radios start on
pub const SIM_DEFAULT_CHANNEL: u8 = 1;

/// Upper bound of task rounds at one instant
const MAX_SETTLE_ROUNDS: usize = 10_000;

#[derive(Debug)]
struct Radio {
    mac: ExtAddr,
    channel: u8,
    sink: Option<HalEventSink>,
}

#[derive(Debug, Default)]
struct MediumState {
    radios: Vec<Radio>,
    /// Directed links that lose every frame
    cut: HashSet<(ExtAddr, ExtAddr)>,
    /// Driver outcome forced on unicasts over a directed link
    forced: HashMap<(ExtAddr, ExtAddr), TxStatus>,
    frames: u64,
}

/// Shared in-memory medium
#[derive(Debug, Clone, Default)]
pub struct SimMedium {
    inner: Arc<Mutex<MediumState>>,
}

impl SimMedium {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MediumState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Drop frames between `a` and `b` in both directions
    pub fn cut_link(&self, a: ExtAddr, b: ExtAddr) {
        let mut state = self.lock();
        state.cut.insert((a, b));
        state.cut.insert((b, a));
    }

    pub fn restore_link(&self, a: ExtAddr, b: ExtAddr) {
        let mut state = self.lock();
        state.cut.remove(&(a, b));
        state.cut.remove(&(b, a));
    }

    /// Make unicasts from `src` to `dest` report `status` without reaching the air
    ///
    /// `Pending` frames never complete, so the sender sees its sending
    /// timeout instead.
    pub fn force_tx_status(&self, src: ExtAddr, dest: ExtAddr, status: TxStatus) {
        self.lock().forced.insert((src, dest), status);
    }

    pub fn clear_tx_status(&self, src: ExtAddr, dest: ExtAddr) {
        self.lock().forced.remove(&(src, dest));
    }

    fn forced_status(&self, src: ExtAddr, dest: ExtAddr) -> Option<TxStatus> {
        self.lock()
            .forced
            .get(&(src, dest))
            .copied()
            .filter(|status| *status != TxStatus::Sent)
    }

    /// Frames put on the air so far
    pub fn frames(&self) -> u64 {
        self.lock().frames
    }

    fn transmit(&self, src: ExtAddr, dest: Option<ExtAddr>, frame: &[u8]) {
        let mut state = self.lock();
        state.frames += 1;
        let Some(channel) = state.radios.iter().find(|r| r.mac == src).map(|r| r.channel) else {
            return;
        };
        for radio in state.radios.iter() {
            if radio.mac == src || radio.channel != channel || state.cut.contains(&(src, radio.mac)) {
                continue;
            }
            if dest.is_some_and(|d| d != radio.mac) {
                continue;
            }
            if let Some(sink) = &radio.sink {
                sink.deliver(frame.to_vec(), src, dest, SIM_RSSI);
            }
        }
    }
}

/// Radio attached to a [`SimMedium`]
#[derive(Debug)]
pub struct SimHal {
    medium: SimMedium,
    mac: ExtAddr,
    mtu: usize,
    extnetid: Vec<u8>,
}

impl SimHal {
    pub fn new(medium: &SimMedium, mac: ExtAddr) -> Self {
        medium.lock().radios.push(Radio {
            mac,
            channel: SIM_DEFAULT_CHANNEL,
            sink: None,
        });
        Self {
            medium: medium.clone(),
            mac,
            mtu: SIM_MTU,
            extnetid: Vec::new(),
        }
    }

    /// Radio with a smaller frame size, to exercise fragmentation
    pub fn with_mtu(mut self, mtu: usize) -> Self {
        self.mtu = mtu;
        self
    }
}

impl Hal for SimHal {
    fn media(&self) -> MediaType {
        MediaType::Wifi
    }

    fn mac(&self) -> ExtAddr {
        self.mac
    }

    fn register_receiver(&mut self, sink: HalEventSink) {
        let mut state = self.medium.lock();
        if let Some(radio) = state.radios.iter_mut().find(|r| r.mac == self.mac) {
            radio.sink = Some(sink);
        }
    }

    fn send_ucast(&mut self, frame: &[u8], dest: &ExtAddr) -> TxStatus {
        if frame.len() > self.mtu {
            return TxStatus::Failed;
        }
        if let Some(status) = self.medium.forced_status(self.mac, *dest) {
            return status;
        }
        self.medium.transmit(self.mac, Some(*dest), frame);
        TxStatus::Sent
    }

    fn send_bcast(&mut self, frame: &[u8]) -> TxStatus {
        if frame.len() > self.mtu {
            return TxStatus::Failed;
        }
        self.medium.transmit(self.mac, None, frame);
        TxStatus::Sent
    }

    fn channel(&self) -> u8 {
        self.medium
            .lock()
            .radios
            .iter()
            .find(|r| r.mac == self.mac)
            .map(|r| r.channel)
            .unwrap_or(SIM_DEFAULT_CHANNEL)
    }

    fn set_channel(&mut self, channel: u8) -> MeshResult<()> {
        let mut state = self.medium.lock();
        let radio = state
            .radios
            .iter_mut()
            .find(|r| r.mac == self.mac)
            .ok_or(MeshError::Fail)?;
        radio.channel = channel;
        Ok(())
    }

    fn ucast_mtu(&self) -> usize {
        self.mtu
    }

    fn bcast_mtu(&self) -> usize {
        self.mtu
    }

    fn extnetid(&self) -> Vec<u8> {
        self.extnetid.clone()
    }

    fn set_extnetid(&mut self, extnetid: &[u8]) -> MeshResult<()> {
        self.extnetid = extnetid.to_vec();
        Ok(())
    }
}

/// Auth server link answering synchronously from a shared server
#[cfg(feature = "crypto")]
struct SimAuthLink {
    server: Arc<Mutex<crate::auth::id2::Id2Server>>,
    reply: crate::node::AuthServerSink,
}

#[cfg(feature = "crypto")]
impl crate::auth::id2::AuthServerLink for SimAuthLink {
    fn send(&mut self, message: Vec<u8>) {
        let answer = {
            let mut server = self.server.lock().unwrap_or_else(|e| e.into_inner());
            server.handle_bytes(&message)
        };
        match answer {
            Ok(Some(reply)) => {
                self.reply.deliver(reply);
            }
            Ok(None) => {}
            Err(err) => warn!(reason = %err, "malformed auth server message"),
        }
    }
}

struct SimNode {
    node: MeshNode,
    mac: ExtAddr,
    received: QueueAdapter,
}

/// Nodes sharing one medium under injected time
pub struct Simulator {
    medium: SimMedium,
    nodes: Vec<SimNode>,
    now: u64,
}

impl Simulator {
    pub fn new(medium: SimMedium) -> Self {
        Self {
            medium,
            nodes: Vec::new(),
            now: 0,
        }
    }

    /// Mac given to the node at `index`
    pub fn mac_for(index: usize) -> ExtAddr {
        let mut mac = [2, 0, 0, 0, 0, 0, 0, 0];
        mac[6] = ((index + 1) >> 8) as u8;
        mac[7] = (index + 1) as u8;
        ExtAddr(mac)
    }

    pub fn add_node(&mut self, config: MeshConfig) -> usize {
        let index = self.nodes.len();
        self.add_node_with_hal(config, SimHal::new(&self.medium, Self::mac_for(index)))
    }

    /// Add a node using a prepared radio
    pub fn add_node_with_hal(&mut self, config: MeshConfig, hal: SimHal) -> usize {
        let mac = hal.mac;
        let mut node = MeshNode::new(config);
        // a fresh node always accepts its first HAL
        let _ = node.add_hal(Box::new(hal));
        let received = QueueAdapter::new();
        node.set_ip_adapter(Box::new(received.clone()));
        self.nodes.push(SimNode { node, mac, received });
        self.nodes.len() - 1
    }

    /// Route a node's authentication traffic to a shared server
    #[cfg(feature = "crypto")]
    pub fn connect_auth_server(&mut self, index: usize, server: Arc<Mutex<crate::auth::id2::Id2Server>>) {
        let node = &mut self.nodes[index].node;
        let reply = node.auth_server_sink();
        node.set_auth_server_link(Box::new(SimAuthLink { server, reply }));
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, index: usize) -> &MeshNode {
        &self.nodes[index].node
    }

    pub fn node_mut(&mut self, index: usize) -> &mut MeshNode {
        &mut self.nodes[index].node
    }

    pub fn mac(&self, index: usize) -> ExtAddr {
        self.nodes[index].mac
    }

    pub fn medium(&self) -> &SimMedium {
        &self.medium
    }

    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn start(&mut self, index: usize) -> MeshResult<()> {
        let now = self.now;
        let node = &mut self.nodes[index].node;
        // the node picks up the simulation clock before it arms timers
        node.poll(now);
        node.start()
    }

    pub fn start_all(&mut self) {
        for index in 0..self.nodes.len() {
            if let Err(err) = self.start(index) {
                warn!(index, reason = %err, "node did not start");
            }
        }
    }

    pub fn stop(&mut self, index: usize) {
        self.nodes[index].node.stop();
    }

    /// Payloads delivered to a node so far
    pub fn received(&self, index: usize) -> Vec<Received> {
        self.nodes[index].received.snapshot()
    }

    /// Take the payloads delivered to a node
    pub fn take_received(&mut self, index: usize) -> Vec<Received> {
        self.nodes[index].received.drain()
    }

    /// Run every node until nothing is left to do at the current time
    fn settle(&mut self) {
        for _ in 0..MAX_SETTLE_ROUNDS {
            let now = self.now;
            let ran: usize = self.nodes.iter_mut().map(|n| n.node.poll(now)).sum();
            if ran == 0 {
                return;
            }
        }
        warn!(now = self.now, "simulation did not settle");
    }

    /// Advance the simulation by `duration_ms`
    pub fn run_for(&mut self, duration_ms: u64) {
        let end = self.now + duration_ms;
        loop {
            self.settle();
            let next = self.nodes.iter().filter_map(|n| n.node.next_deadline()).min();
            match next {
                Some(deadline) if deadline <= end => self.now = self.now.max(deadline),
                _ => {
                    self.now = end;
                    self.settle();
                    return;
                }
            }
        }
    }

    /// Run until `done` holds or `timeout_ms` passed, true when it held
    pub fn run_until<F>(&mut self, timeout_ms: u64, step_ms: u64, mut done: F) -> bool
    where
        F: FnMut(&Simulator) -> bool,
    {
        let end = self.now + timeout_ms;
        while self.now < end {
            if done(self) {
                return true;
            }
            self.run_for(step_ms.min(end - self.now).max(1));
        }
        done(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    fn capture(hal: &mut SimHal, index: usize) -> mpsc::Receiver<crate::timer::Task> {
        let (tx, rx) = mpsc::channel();
        hal.register_receiver(HalEventSink::new(index, tx));
        rx
    }

    fn mac(n: u8) -> ExtAddr {
        ExtAddr([2, 0, 0, 0, 0, 0, 0, n])
    }

    #[test]
    fn test_broadcast_reaches_same_channel_only() {
        let medium = SimMedium::new();
        let mut a = SimHal::new(&medium, mac(1));
        let mut b = SimHal::new(&medium, mac(2));
        let mut c = SimHal::new(&medium, mac(3));
        let rx_b = capture(&mut b, 0);
        let rx_c = capture(&mut c, 0);
        c.set_channel(6).unwrap();

        assert_eq!(a.send_bcast(b"hello"), TxStatus::Sent);
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());
        assert_eq!(medium.frames(), 1);
    }

    #[test]
    fn test_unicast_and_cut_link() {
        let medium = SimMedium::new();
        let mut a = SimHal::new(&medium, mac(1));
        let mut b = SimHal::new(&medium, mac(2));
        let mut c = SimHal::new(&medium, mac(3));
        let rx_b = capture(&mut b, 0);
        let rx_c = capture(&mut c, 0);

        a.send_ucast(b"x", &mac(2));
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_err());

        medium.cut_link(mac(1), mac(2));
        a.send_ucast(b"x", &mac(2));
        assert!(rx_b.try_recv().is_err());
        medium.restore_link(mac(1), mac(2));
        a.send_ucast(b"x", &mac(2));
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_forced_status_keeps_frame_off_the_air() {
        let medium = SimMedium::new();
        let mut a = SimHal::new(&medium, mac(1));
        let mut b = SimHal::new(&medium, mac(2));
        let rx_b = capture(&mut b, 0);

        medium.force_tx_status(mac(1), mac(2), TxStatus::Failed);
        assert_eq!(a.send_ucast(b"x", &mac(2)), TxStatus::Failed);
        medium.force_tx_status(mac(1), mac(2), TxStatus::Pending);
        assert_eq!(a.send_ucast(b"x", &mac(2)), TxStatus::Pending);
        assert!(rx_b.try_recv().is_err());
        // Broadcasts are not affected
        assert_eq!(a.send_bcast(b"x"), TxStatus::Sent);
        assert!(rx_b.try_recv().is_ok());

        medium.clear_tx_status(mac(1), mac(2));
        assert_eq!(a.send_ucast(b"x", &mac(2)), TxStatus::Sent);
        assert!(rx_b.try_recv().is_ok());
    }

    #[test]
    fn test_oversized_frame_fails() {
        let medium = SimMedium::new();
        let mut a = SimHal::new(&medium, mac(1)).with_mtu(16);
        assert_eq!(a.send_bcast(&[0u8; 17]), TxStatus::Failed);
        assert_eq!(medium.frames(), 0);
    }

    #[test]
    fn test_single_node_becomes_leader() {
        let mut sim = Simulator::new(SimMedium::new());
        let a = sim.add_node(MeshConfig::default().with_seed(11));
        sim.start_all();
        sim.run_for(10_000);
        assert_eq!(sim.node(a).state(), crate::types::DeviceState::Leader);
        assert_eq!(sim.now(), 10_000);
    }
}
