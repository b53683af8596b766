//! The mesh node aggregate
//!
//! [`MeshNode`] owns every piece of protocol state of one device: its
//! HALs, the networks it takes part in, attach and auth progress, the
//! caches and the event loop. Protocol handlers are `impl MeshNode`
//! blocks spread over the modules that own each concern; this module
//! holds the lifecycle and task dispatch.
//!
//! ```text
//!   driver ──HalEventSink──► mpsc ──┐
//!   auth server ──AuthServerSink──► ├──► EventLoop ──poll(now)──► handlers
//!   timers ─────────────────────────┘
//! ```
//!
//! The host drives the node by calling [`MeshNode::poll`] with the
//! current time in milliseconds, as often as it likes and at least by
//! [`MeshNode::next_deadline`].

use crate::address::{AddressResolver, SidCache};
use crate::auth::id2::{AuthServerLink, Id2Provider};
use crate::auth::AuthContext;
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::hal::{Hal, HalContext, HalEventSink, LinkStats, EXTNETID_MAX_LEN};
use crate::ip::{InterfaceListener, IpAdapter};
use crate::keys::KeyManager;
use crate::link::{NeighborState, Whitelist};
use crate::lowpower::LowPowerState;
use crate::mcast::MulticastGuard;
use crate::message::MessagePool;
use crate::mgmt::discovery::DiscoveryContext;
use crate::mgmt::AttachContext;
use crate::network_data::{NetworkData, NetworkDataStore};
use crate::router::{new_router, RouterPolicy};
use crate::sid_allocator::SidAllocator;
use crate::timer::{EventLoop, Task, TimerKind};
use crate::types::{
    get_main_netid, is_unique_sid, DeviceState, ExtAddr, InterfaceDownReason, MeshAddr, Mode, BCAST_NETID,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::sync::mpsc::{self, Receiver, Sender};
use tracing::{debug, info};

/// One network the node takes part in, bound to one HAL
#[derive(Debug)]
pub struct NetworkContext {
    pub hal: usize,
    pub meshnetid: u16,
    pub router: Box<dyn RouterPolicy>,
    pub allocator: SidAllocator,
    pub network_data: NetworkData,
}

impl NetworkContext {
    fn new(hal: usize, router: Box<dyn RouterPolicy>) -> Self {
        Self {
            hal,
            meshnetid: BCAST_NETID,
            router,
            allocator: SidAllocator::None,
            network_data: NetworkData::default(),
        }
    }
}

/// Entry point for side-channel messages from the authentication server
#[derive(Debug, Clone)]
pub struct AuthServerSink {
    tx: Sender<Task>,
}

impl AuthServerSink {
    pub fn deliver(&self, message: Vec<u8>) -> bool {
        self.tx.send(Task::AuthServer(message)).is_ok()
    }
}

/// Snapshot of one neighbor
#[derive(Debug, Clone, Serialize)]
pub struct NeighborInfo {
    pub hal: usize,
    pub mac: ExtAddr,
    pub sid: u16,
    pub netid: u16,
    pub state: NeighborState,
    pub mode: Mode,
    pub link_cost: u16,
    pub path_cost: u16,
    pub channel: u8,
    /// Frames held while the neighbor sleeps
    pub buffered: usize,
}

/// Snapshot of the node counters
#[derive(Debug, Clone, Serialize)]
pub struct MeshStats {
    pub state: DeviceState,
    pub sid: u16,
    pub meshnetid: u16,
    pub neighbors: usize,
    pub address_cache: usize,
    /// Address queries in flight
    pub address_queries: usize,
    /// Data messages parked until their destination resolves
    pub pending_messages: usize,
    pub sid_cache: usize,
    /// Milliseconds spent with the radio down
    pub sleep_time: u64,
    pub hals: Vec<LinkStats>,
}

/// A uMesh device
pub struct MeshNode {
    pub(crate) config: MeshConfig,
    pub(crate) uuid: ExtAddr,
    pub(crate) mode: Mode,
    pub(crate) state: DeviceState,
    pub(crate) hals: Vec<HalContext>,
    pub(crate) networks: Vec<NetworkContext>,
    pub(crate) attach: AttachContext,
    pub(crate) event_loop: EventLoop,
    pub(crate) pool: MessagePool,
    pub(crate) mcast: MulticastGuard,
    pub(crate) whitelist: Whitelist,
    pub(crate) keys: KeyManager,
    pub(crate) nd: NetworkDataStore,
    pub(crate) sid_cache: SidCache,
    pub(crate) resolver: AddressResolver,
    pub(crate) discovery: DiscoveryContext,
    pub(crate) auth: AuthContext,
    pub(crate) lowpower: LowPowerState,
    /// Capability of the leader of our network
    pub(crate) leader_mode: Mode,
    /// Netid and path cost when we were last attached
    pub(crate) prev_netinfo: Option<(u16, u16)>,
    /// Set after a restart until the next attach
    pub(crate) reboot_flag: bool,
    pub(crate) rng: StdRng,
    pub(crate) listeners: Vec<Box<dyn InterfaceListener>>,
    pub(crate) ip: Option<Box<dyn IpAdapter>>,
    pub(crate) id2: Option<Box<dyn Id2Provider>>,
    pub(crate) auth_server: Option<Box<dyn AuthServerLink>>,
    task_tx: Sender<Task>,
    task_rx: Receiver<Task>,
    /// Offset applied to local time to follow the network timestamp
    timestamp_offset: i64,
}

impl std::fmt::Debug for MeshNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshNode")
            .field("uuid", &self.uuid)
            .field("mode", &self.mode)
            .field("state", &self.state)
            .field("sid", &format_args!("{:04x}", self.attach.sid))
            .field("hals", &self.hals)
            .finish()
    }
}

fn default_id2(config: &MeshConfig) -> Option<Box<dyn Id2Provider>> {
    #[cfg(feature = "crypto")]
    {
        config
            .id2
            .clone()
            .map(|c| Box::new(crate::auth::id2::SoftwareId2::new(c)) as Box<dyn Id2Provider>)
    }
    #[cfg(not(feature = "crypto"))]
    {
        let _ = config;
        None
    }
}

impl MeshNode {
    pub fn new(config: MeshConfig) -> Self {
        let (task_tx, task_rx) = mpsc::channel();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            uuid: ExtAddr::default(),
            mode: config.mode,
            state: DeviceState::Disabled,
            hals: Vec::new(),
            networks: Vec::new(),
            attach: AttachContext::default(),
            event_loop: EventLoop::new(),
            pool: MessagePool::new(config.message_buffer_bytes),
            mcast: MulticastGuard::default(),
            whitelist: Whitelist::new(config.whitelist_enabled, &config.whitelist),
            keys: KeyManager::new(),
            nd: NetworkDataStore::new(),
            sid_cache: SidCache::new(),
            resolver: AddressResolver::new(),
            discovery: DiscoveryContext::default(),
            auth: AuthContext::default(),
            lowpower: LowPowerState::new(config.mode.is_rx_on()),
            leader_mode: config.mode,
            prev_netinfo: None,
            reboot_flag: false,
            rng,
            listeners: Vec::new(),
            ip: None,
            id2: default_id2(&config),
            auth_server: None,
            task_tx,
            task_rx,
            timestamp_offset: 0,
            config,
        }
    }

    /// Register a radio; the first one gives the node its uuid
    pub fn add_hal(&mut self, mut driver: Box<dyn Hal>) -> MeshResult<usize> {
        if self.state != DeviceState::Disabled {
            return Err(MeshError::Busy);
        }
        let index = self.hals.len();
        driver.register_receiver(HalEventSink::new(index, self.task_tx.clone()));
        let timings = self.config.timings_for(driver.media());
        let ctx = HalContext::new(index, driver, timings, self.config.max_neighbors);
        if index == 0 {
            self.uuid = ctx.mac;
        }
        debug!(hal = index, media = ?ctx.media, mac = %ctx.mac, "hal added");
        self.hals.push(ctx);
        self.networks
            .push(NetworkContext::new(index, new_router(self.config.router)));
        Ok(index)
    }

    /// Bring the node up: a leader-mode node forms its network, others scan
    pub fn start(&mut self) -> MeshResult<()> {
        if self.hals.is_empty() {
            return Err(MeshError::Fail);
        }
        if self.state != DeviceState::Disabled {
            return Err(MeshError::Busy);
        }
        self.event_loop.start();
        self.reboot_flag = self.prev_netinfo.is_some();
        info!(uuid = %self.uuid, mode = %self.mode, "mesh start");
        if self.mode.contains(Mode::LEADER) {
            self.state = DeviceState::Detached;
            self.become_leader()
        } else {
            self.become_detached(InterfaceDownReason::MeshStart);
            Ok(())
        }
    }

    pub fn stop(&mut self) {
        if self.state == DeviceState::Disabled {
            return;
        }
        info!("mesh stop");
        self.stop_auth();
        self.become_detached(InterfaceDownReason::MeshStop);
        for hal in self.hals.iter_mut() {
            hal.clear_queues();
            hal.neighbors.clear();
        }
        self.keys.clear();
        self.mcast.clear();
        self.auth = AuthContext::default();
        self.state = DeviceState::Disabled;
        self.event_loop.stop();
        while self.task_rx.try_recv().is_ok() {}
    }

    pub fn is_running(&self) -> bool {
        self.event_loop.is_running()
    }

    /// Run everything due at `now_ms`, returning the number of tasks run
    pub fn poll(&mut self, now_ms: u64) -> usize {
        self.drain_inbox();
        self.event_loop.advance(now_ms);
        let mut ran = 0;
        while let Some(task) = self.event_loop.pop_task() {
            self.run_task(task);
            ran += 1;
            self.drain_inbox();
        }
        ran
    }

    /// Deadline of the next timer
    pub fn next_deadline(&self) -> Option<u64> {
        self.event_loop.next_deadline()
    }

    fn drain_inbox(&mut self) {
        while let Ok(task) = self.task_rx.try_recv() {
            self.event_loop.post(task);
        }
    }

    fn run_task(&mut self, task: Task) {
        match task {
            Task::Receive(frame) => self.handle_received_frame(frame),
            Task::SendNext { hal } => self.handle_send_next(hal),
            Task::SendDone { hal, status } => self.handle_send_done(hal, status),
            Task::Loopback(message) => self.handle_loopback(message),
            Task::AuthServer(data) => self.handle_auth_server_task(&data),
            Task::Timer(kind) => self.run_timer(kind),
        }
    }

    fn run_timer(&mut self, kind: TimerKind) {
        match kind {
            TimerKind::Advertisement { network } => self.handle_advertisement_timer(network),
            TimerKind::AttachRequest | TimerKind::SidRequest => self.handle_attach_timer(),
            TimerKind::LinkQuality { hal } => self.handle_link_quality_timer(hal),
            TimerKind::NeighborUpdate { hal } => self.handle_neighbor_update_timer(hal),
            TimerKind::Discovery => self.handle_discovery_timer(),
            TimerKind::DiscoveryStart => self.start_discover(),
            TimerKind::MigrateReset => self.handle_migrate_reset_timer(),
            TimerKind::Auth => self.handle_auth_timer(),
            TimerKind::AddressQuery => self.handle_address_query_timer(),
            TimerKind::AddrCacheCheck => self.handle_addr_cache_check_timer(),
            TimerKind::Notification => self.handle_notification_timer(),
            TimerKind::Sending { hal } => self.handle_sending_timeout(hal),
            TimerKind::RoutingUpdate => self.handle_routing_timer(),
            TimerKind::LowPowerSlot => self.handle_lowpower_timer(),
            TimerKind::ParentSlot => self.handle_parent_slot_timer(),
        }
    }

    /// Install the link to the authentication server
    pub fn set_auth_server_link(&mut self, link: Box<dyn AuthServerLink>) {
        self.auth_server = Some(link);
    }

    /// Sink the host feeds server replies into
    pub fn auth_server_sink(&self) -> AuthServerSink {
        AuthServerSink {
            tx: self.task_tx.clone(),
        }
    }

    pub fn set_id2_provider(&mut self, provider: Box<dyn Id2Provider>) {
        self.id2 = Some(provider);
    }

    pub fn set_ip_adapter(&mut self, adapter: Box<dyn IpAdapter>) {
        self.ip = Some(adapter);
    }

    pub fn add_listener(&mut self, listener: Box<dyn InterfaceListener>) {
        self.listeners.push(listener);
    }

    /// Current injected time
    pub fn now(&self) -> u64 {
        self.event_loop.now()
    }

    pub fn uuid(&self) -> ExtAddr {
        self.uuid
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Change capability bits; only while stopped
    pub fn set_mode(&mut self, mode: Mode) -> MeshResult<()> {
        if self.state != DeviceState::Disabled {
            return Err(MeshError::Busy);
        }
        self.mode = mode;
        self.config.mode = mode;
        self.lowpower = LowPowerState::new(mode.is_rx_on());
        Ok(())
    }

    pub fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Our short address, `BCAST_SID` while we have none
    pub fn sid(&self) -> u16 {
        self.attach.sid
    }

    pub fn meshnetid(&self) -> u16 {
        self.networks.first().map(|n| n.meshnetid).unwrap_or(BCAST_NETID)
    }

    pub fn path_cost(&self) -> u16 {
        self.attach.path_cost
    }

    /// Parent we are attached through
    pub fn parent(&self) -> Option<ExtAddr> {
        self.attach.attach_node.map(|(_, mac)| mac)
    }

    pub(crate) fn attach_node(&self) -> Option<(usize, ExtAddr)> {
        self.attach.attach_node
    }

    pub(crate) fn has_sid(&self) -> bool {
        is_unique_sid(self.attach.sid)
    }

    /// Attached with a SID of our own, or leading a network
    pub fn is_attached(&self) -> bool {
        self.state >= DeviceState::Leaf && self.has_sid()
    }

    pub(crate) fn main_netid(&self) -> u16 {
        get_main_netid(self.meshnetid())
    }

    /// Network served over a HAL
    pub(crate) fn network_for_hal(&self, hal: usize) -> usize {
        self.networks.iter().position(|n| n.hal == hal).unwrap_or(0)
    }

    pub fn channel(&self, hal: usize) -> Option<u8> {
        self.hals.get(hal).map(|h| h.driver.channel())
    }

    pub fn set_channel(&mut self, hal: usize, channel: u8) -> MeshResult<()> {
        let ctx = self.hals.get_mut(hal).ok_or(MeshError::Fail)?;
        if ctx.driver.channel() != channel {
            ctx.driver.set_channel(channel)?;
            debug!(hal, channel, "channel switched");
        }
        Ok(())
    }

    /// Extended network id of the first radio
    pub fn extnetid(&self) -> Vec<u8> {
        self.hals.first().map(|h| h.driver.extnetid()).unwrap_or_default()
    }

    /// Push an extended network id to every radio
    pub fn set_extnetid(&mut self, extnetid: &[u8]) -> MeshResult<()> {
        if extnetid.is_empty() || extnetid.len() > EXTNETID_MAX_LEN {
            return Err(MeshError::Fail);
        }
        for ctx in self.hals.iter_mut() {
            ctx.driver.set_extnetid(extnetid)?;
        }
        Ok(())
    }

    /// Network time in milliseconds
    pub(crate) fn timestamp(&self) -> u32 {
        (self.now() as i64 + self.timestamp_offset) as u32
    }

    /// Follow the network time carried by a peer
    pub(crate) fn set_timestamp(&mut self, timestamp: u32) {
        self.timestamp_offset = timestamp as i64 - self.now() as i64;
    }

    /// Random delay in `[0, max_ms)`
    pub(crate) fn random_jitter(&mut self, max_ms: u64) -> u64 {
        self.rng.gen_range(0..max_ms.max(1))
    }

    pub fn whitelist(&self) -> &Whitelist {
        &self.whitelist
    }

    pub fn whitelist_mut(&mut self) -> &mut Whitelist {
        &mut self.whitelist
    }

    pub fn hal_count(&self) -> usize {
        self.hals.len()
    }

    pub fn hal_stats(&self, hal: usize) -> LinkStats {
        self.hals.get(hal).map(|h| h.stats.clone()).unwrap_or_default()
    }

    pub fn neighbors(&self) -> Vec<NeighborInfo> {
        self.hals
            .iter()
            .enumerate()
            .flat_map(|(hal, ctx)| {
                ctx.neighbors.iter().map(move |n| NeighborInfo {
                    hal,
                    mac: n.mac,
                    sid: n.sid,
                    netid: n.netid,
                    state: n.state,
                    mode: n.mode,
                    link_cost: n.stats.link_cost,
                    path_cost: n.path_cost,
                    channel: n.channel,
                    buffered: n.buffer_queue.len(),
                })
            })
            .collect()
    }

    pub fn stats(&self) -> MeshStats {
        MeshStats {
            state: self.state,
            sid: self.attach.sid,
            meshnetid: self.meshnetid(),
            neighbors: self.hals.iter().map(|h| h.neighbors.len()).sum(),
            address_cache: self.resolver.len(),
            address_queries: self.resolver.querying(),
            pending_messages: self.hals.iter().map(|h| h.pending_queue.len()).sum(),
            sid_cache: self.sid_cache.len(),
            sleep_time: self.lowpower_sleep_time(),
            hals: self.hals.iter().map(|h| h.stats.clone()).collect(),
        }
    }

    /// Address peers reach us by on the main network
    pub fn mesh_addr(&self) -> MeshAddr {
        if self.has_sid() {
            MeshAddr::short(self.meshnetid(), self.attach.sid)
        } else {
            MeshAddr::ext(self.meshnetid(), self.uuid)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimHal, SimMedium};

    fn node_with_hal(seed: u64) -> MeshNode {
        let medium = SimMedium::new();
        let mut node = MeshNode::new(MeshConfig::default().with_seed(seed));
        node.add_hal(Box::new(SimHal::new(&medium, ExtAddr([2, 0, 0, 0, 0, 0, 0, 1]))))
            .unwrap();
        node
    }

    #[test]
    fn test_start_requires_hal() {
        let mut node = MeshNode::new(MeshConfig::default());
        assert_eq!(node.start(), Err(MeshError::Fail));
        assert_eq!(node.state(), DeviceState::Disabled);
    }

    #[test]
    fn test_extnetid_reaches_radios() {
        let mut node = node_with_hal(7);
        assert!(node.extnetid().is_empty());
        node.set_extnetid(&[0xaa, 0xbb, 0xcc]).unwrap();
        assert_eq!(node.extnetid(), vec![0xaa, 0xbb, 0xcc]);
        assert_eq!(node.set_extnetid(&[0; 7]), Err(MeshError::Fail));
        assert_eq!(node.set_extnetid(&[]), Err(MeshError::Fail));
    }

    #[test]
    fn test_first_hal_gives_uuid() {
        let node = node_with_hal(1);
        assert_eq!(node.uuid(), ExtAddr([2, 0, 0, 0, 0, 0, 0, 1]));
        assert_eq!(node.networks.len(), 1);
        assert_eq!(node.network_for_hal(0), 0);
        assert_eq!(node.network_for_hal(5), 0);
    }

    #[test]
    fn test_start_scans_then_stop_disables() {
        let mut node = node_with_hal(2);
        node.start().unwrap();
        assert_eq!(node.state(), DeviceState::Detached);
        assert!(node.is_discovering());
        assert_eq!(node.start(), Err(MeshError::Busy));
        node.stop();
        assert_eq!(node.state(), DeviceState::Disabled);
        assert!(!node.is_running());
        assert_eq!(node.next_deadline(), None);
    }

    #[test]
    fn test_leader_mode_starts_as_leader() {
        let medium = SimMedium::new();
        let mut node = MeshNode::new(MeshConfig::default().with_mode(Mode::RX_ON.with(Mode::LEADER)).with_seed(3));
        node.add_hal(Box::new(SimHal::new(&medium, ExtAddr([2, 0, 0, 0, 0, 0, 0, 9]))))
            .unwrap();
        node.start().unwrap();
        assert_eq!(node.state(), DeviceState::Leader);
        assert!(node.is_attached());
        assert!(!node.is_discovering());
    }

    #[test]
    fn test_timestamp_follows_network() {
        let mut node = node_with_hal(4);
        node.start().unwrap();
        node.poll(1_000);
        node.set_timestamp(50_000);
        assert_eq!(node.timestamp(), 50_000);
        node.poll(1_500);
        assert_eq!(node.timestamp(), 50_500);
    }

    #[test]
    fn test_jitter_bounds() {
        let mut node = node_with_hal(5);
        for _ in 0..100 {
            assert!(node.random_jitter(10) < 10);
        }
        assert_eq!(node.random_jitter(0), 0);
    }
}
