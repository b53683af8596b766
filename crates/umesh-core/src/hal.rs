//! Radio HAL contract and per-HAL runtime context
//!
//! A [`Hal`] is one radio transport. The engine never calls into protocol
//! code from a driver callback: a driver reports received frames and late
//! transmission completions through the [`HalEventSink`] it was given at
//! registration, and the node drains those events onto its task queue.

use crate::config::MediaTimings;
use crate::error::{MeshError, MeshResult};
use crate::forwarder::fragment::Reassembler;
use crate::link::NeighborTable;
use crate::message::{Message, MessageQueue};
use crate::timer::Task;
use crate::types::{ExtAddr, MediaType};
use serde::Serialize;
use std::sync::mpsc::Sender;

/// Outcome of handing a frame to a driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxStatus {
    /// Frame is on the air
    Sent,
    /// Driver rejected the frame; the forwarder may retry
    Failed,
    /// Driver accepted the frame and will report completion later
    Pending,
}

/// A frame received by a HAL
#[derive(Debug, Clone)]
pub struct RxFrame {
    pub hal: usize,
    pub data: Vec<u8>,
    /// Link-layer sender
    pub src_mac: ExtAddr,
    /// Link-layer destination, `None` for a broadcast frame
    pub dest_mac: Option<ExtAddr>,
    pub rssi: i8,
}

/// Channel through which a driver reports events to its node
#[derive(Debug, Clone)]
pub struct HalEventSink {
    hal: usize,
    tx: Sender<Task>,
}

impl HalEventSink {
    pub(crate) fn new(hal: usize, tx: Sender<Task>) -> Self {
        Self { hal, tx }
    }

    /// Index of the HAL this sink belongs to
    pub fn hal(&self) -> usize {
        self.hal
    }

    /// Report a received frame
    pub fn deliver(&self, data: Vec<u8>, src_mac: ExtAddr, dest_mac: Option<ExtAddr>, rssi: i8) -> bool {
        self.tx
            .send(Task::Receive(RxFrame {
                hal: self.hal,
                data,
                src_mac,
                dest_mac,
                rssi,
            }))
            .is_ok()
    }

    /// Report completion of a transmission that returned `Pending`
    pub fn send_done(&self, status: TxStatus) -> bool {
        self.tx
            .send(Task::SendDone {
                hal: self.hal,
                status,
            })
            .is_ok()
    }
}

/// Longest extended network id a radio accepts
pub const EXTNETID_MAX_LEN: usize = 6;

/// Radio driver contract
pub trait Hal: Send {
    /// Medium of this radio
    fn media(&self) -> MediaType;

    /// Link-layer address
    fn mac(&self) -> ExtAddr;

    /// Install the sink used to report received frames and completions
    fn register_receiver(&mut self, sink: HalEventSink);

    /// Transmit to one neighbor
    fn send_ucast(&mut self, frame: &[u8], dest: &ExtAddr) -> TxStatus;

    /// Transmit to every neighbor in range
    fn send_bcast(&mut self, frame: &[u8]) -> TxStatus;

    fn channel(&self) -> u8;

    fn set_channel(&mut self, channel: u8) -> MeshResult<()>;

    /// Largest unicast frame
    fn ucast_mtu(&self) -> usize;

    /// Largest broadcast frame
    fn bcast_mtu(&self) -> usize;

    /// Extended network id (the BSSID on Wi-Fi), empty when unsupported
    fn extnetid(&self) -> Vec<u8> {
        Vec::new()
    }

    fn set_extnetid(&mut self, _extnetid: &[u8]) -> MeshResult<()> {
        Err(MeshError::Fail)
    }
}

/// Per-HAL traffic counters
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkStats {
    pub in_frames: u64,
    pub out_frames: u64,
    pub in_data: u64,
    pub out_data: u64,
    pub in_command: u64,
    pub out_command: u64,
    /// Frames dropped on receive
    pub in_drops: u64,
    /// Frames filtered by address or whitelist
    pub in_filterings: u64,
    /// Messages dropped on transmit
    pub out_errors: u64,
    pub sending_timeouts: u64,
}

/// Message whose current frame awaits a driver completion
#[derive(Debug)]
pub(crate) struct InFlight {
    pub message: Message,
    /// Payload bytes carried by the frame on the air
    pub sent_len: usize,
    pub bcast: bool,
}

/// Runtime state owned by one HAL
pub struct HalContext {
    pub index: usize,
    pub driver: Box<dyn Hal>,
    pub media: MediaType,
    pub mac: ExtAddr,
    pub timings: MediaTimings,
    pub neighbors: NeighborTable,
    pub cmd_queue: MessageQueue,
    pub data_queue: MessageQueue,
    /// Messages parked until an address query completes
    pub pending_queue: MessageQueue,
    pub reassembler: Reassembler,
    pub stats: LinkStats,
    /// Frame handed to the driver with a `Pending` completion
    pub(crate) sending: Option<InFlight>,
    /// A `SendNext` task is already queued
    pub(crate) send_scheduled: bool,
    pub(crate) next_frag_tag: u16,
}

impl HalContext {
    pub fn new(index: usize, driver: Box<dyn Hal>, timings: MediaTimings, max_neighbors: usize) -> Self {
        let media = driver.media();
        let mac = driver.mac();
        Self {
            index,
            driver,
            media,
            mac,
            timings,
            neighbors: NeighborTable::new(max_neighbors),
            cmd_queue: MessageQueue::new(),
            data_queue: MessageQueue::new(),
            pending_queue: MessageQueue::new(),
            reassembler: Reassembler::default(),
            stats: LinkStats::default(),
            sending: None,
            send_scheduled: false,
            next_frag_tag: 1,
        }
    }

    /// Fresh fragment tag
    pub fn alloc_frag_tag(&mut self) -> u16 {
        let tag = self.next_frag_tag;
        self.next_frag_tag = self.next_frag_tag.wrapping_add(1).max(1);
        tag
    }

    /// Drop every queued message
    pub fn clear_queues(&mut self) {
        self.cmd_queue.clear();
        self.data_queue.clear();
        self.pending_queue.clear();
        self.sending = None;
        self.send_scheduled = false;
    }

    /// Messages waiting for transmission
    pub fn queued(&self) -> usize {
        self.cmd_queue.len() + self.data_queue.len() + usize::from(self.sending.is_some())
    }
}

impl std::fmt::Debug for HalContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HalContext")
            .field("index", &self.index)
            .field("media", &self.media)
            .field("mac", &self.mac)
            .field("neighbors", &self.neighbors.len())
            .field("queued", &self.queued())
            .finish()
    }
}
