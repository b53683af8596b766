//! In-flight messages, message queues and the message buffer budget
//!
//! A [`Message`] is moved between queues, never shared, so the rule that a
//! message lives in exactly one queue is enforced by ownership. Every
//! message holds a lease on the node's [`MessagePool`]; the lease returns
//! its bytes when the message is dropped, and allocation fails with
//! [`MeshError::Mem`] once the budget is spent.

use crate::error::{MeshError, MeshResult};
use crate::keys::INVALID_KEY_INDEX;
use crate::types::{ExtAddr, FrameType, MeshAddr, Mode};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Processing flags attached to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageFlags(u8);

impl MessageFlags {
    pub const NONE: MessageFlags = MessageFlags(0);

    const ENCRYPT_BIT: u8 = 0; // Encrypt before transmission
    const INSERT_HEADER_BIT: u8 = 1; // Locally built, header added at send time
    const MCAST_BIT: u8 = 2; // Needs a multicast sub-header
    const HEADER_IES_BIT: u8 = 3; // Frame carries header IEs
    const FORWARD_BIT: u8 = 4; // Relayed frame, payload sent as received
    const ACCEPT_REQUEST_BIT: u8 = 5; // Ask the next hop for a link accept

    fn get(&self, bit: u8) -> bool {
        self.0 & (1 << bit) != 0
    }

    fn set(&mut self, bit: u8, value: bool) {
        if value {
            self.0 |= 1 << bit;
        } else {
            self.0 &= !(1 << bit);
        }
    }

    pub fn encrypt(&self) -> bool {
        self.get(Self::ENCRYPT_BIT)
    }

    pub fn set_encrypt(&mut self, value: bool) {
        self.set(Self::ENCRYPT_BIT, value)
    }

    pub fn insert_header(&self) -> bool {
        self.get(Self::INSERT_HEADER_BIT)
    }

    pub fn set_insert_header(&mut self, value: bool) {
        self.set(Self::INSERT_HEADER_BIT, value)
    }

    pub fn mcast(&self) -> bool {
        self.get(Self::MCAST_BIT)
    }

    pub fn set_mcast(&mut self, value: bool) {
        self.set(Self::MCAST_BIT, value)
    }

    pub fn header_ies(&self) -> bool {
        self.get(Self::HEADER_IES_BIT)
    }

    pub fn set_header_ies(&mut self, value: bool) {
        self.set(Self::HEADER_IES_BIT, value)
    }

    pub fn forward(&self) -> bool {
        self.get(Self::FORWARD_BIT)
    }

    pub fn set_forward(&mut self, value: bool) {
        self.set(Self::FORWARD_BIT, value)
    }

    pub fn accept_request(&self) -> bool {
        self.get(Self::ACCEPT_REQUEST_BIT)
    }

    pub fn set_accept_request(&mut self, value: bool) {
        self.set(Self::ACCEPT_REQUEST_BIT, value)
    }
}

/// Routing and processing metadata of a message
#[derive(Debug, Clone)]
pub struct MessageInfo {
    pub frame_type: FrameType,
    /// Command code for command frames
    pub command: Option<u8>,
    pub src: MeshAddr,
    pub dest: MeshAddr,
    /// Second destination used for proxy re-routing
    pub dest2: MeshAddr,
    pub flags: MessageFlags,
    pub key_index: u8,
    /// Remaining hop budget
    pub hops: u8,
    /// Network context index
    pub network: usize,
    /// HAL the frame arrived on
    pub hal: usize,
    /// Link-layer sender of a received frame
    pub src_mac: Option<ExtAddr>,
    /// Mode IE of the sender
    pub mode: Option<Mode>,
    /// Reverse RSSI IE of the sender
    pub reverse_rssi: Option<i8>,
    /// RSSI measured on reception
    pub rssi: i8,
    /// Next byte of payload to transmit when fragmenting
    pub frag_offset: usize,
    /// Fragment tag shared by every fragment of this message
    pub frag_tag: u16,
    /// Transmission attempts so far
    pub retries: u8,
    /// Offset of the payload in the received frame
    pub payload_offset: usize,
    /// Offset of the header IEs in the received frame
    pub header_ies_offset: usize,
}

impl MessageInfo {
    /// Info for a locally originated message
    pub fn new(frame_type: FrameType) -> Self {
        Self {
            frame_type,
            command: None,
            src: MeshAddr::NONE,
            dest: MeshAddr::NONE,
            dest2: MeshAddr::NONE,
            flags: MessageFlags::NONE,
            key_index: INVALID_KEY_INDEX,
            hops: 0,
            network: 0,
            hal: 0,
            src_mac: None,
            mode: None,
            reverse_rssi: None,
            rssi: 0,
            frag_offset: 0,
            frag_tag: 0,
            retries: 0,
            payload_offset: 0,
            header_ies_offset: 0,
        }
    }

    /// Info for a command message
    pub fn command(command: u8) -> Self {
        let mut info = Self::new(FrameType::Cmd);
        info.command = Some(command);
        info
    }
}

#[derive(Debug)]
struct BufferLease {
    in_use: Arc<AtomicUsize>,
    len: usize,
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.in_use.fetch_sub(self.len, Ordering::Relaxed);
    }
}

/// A frame or command in flight
#[derive(Debug)]
pub struct Message {
    pub info: MessageInfo,
    data: Vec<u8>,
    _lease: BufferLease,
}

impl Message {
    /// Payload bytes (command body or data)
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Command code of a command message
    pub fn command(&self) -> Option<u8> {
        self.info.command
    }
}

/// Byte budget shared by every message of a node
#[derive(Debug, Clone)]
pub struct MessagePool {
    in_use: Arc<AtomicUsize>,
    capacity: usize,
}

impl MessagePool {
    pub fn new(capacity: usize) -> Self {
        Self {
            in_use: Arc::new(AtomicUsize::new(0)),
            capacity,
        }
    }

    /// Bytes currently held by live messages
    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Allocate a message owning `data`
    pub fn alloc(&self, data: Vec<u8>, info: MessageInfo) -> MeshResult<Message> {
        let len = data.len().max(1);
        let used = self.in_use.fetch_add(len, Ordering::Relaxed);
        let lease = BufferLease {
            in_use: Arc::clone(&self.in_use),
            len,
        };
        if used + len > self.capacity {
            return Err(MeshError::Mem);
        }
        Ok(Message {
            info,
            data,
            _lease: lease,
        })
    }

    /// Allocate an independent copy of a message
    pub fn duplicate(&self, message: &Message) -> MeshResult<Message> {
        self.alloc(message.data.clone(), message.info.clone())
    }
}

/// FIFO of messages owned by one queue
#[derive(Debug, Default)]
pub struct MessageQueue {
    messages: VecDeque<Message>,
}

impl MessageQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&mut self, message: Message) {
        self.messages.push_back(message);
    }

    /// Put a message back at the head
    pub fn requeue_front(&mut self, message: Message) {
        self.messages.push_front(message);
    }

    pub fn dequeue(&mut self) -> Option<Message> {
        self.messages.pop_front()
    }

    pub fn head(&self) -> Option<&Message> {
        self.messages.front()
    }

    pub fn head_mut(&mut self) -> Option<&mut Message> {
        self.messages.front_mut()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Message> {
        self.messages.iter()
    }

    /// Remove and return every message matching `pred`, keeping order
    pub fn take_matching<F>(&mut self, mut pred: F) -> Vec<Message>
    where
        F: FnMut(&Message) -> bool,
    {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.messages.len());
        while let Some(message) = self.messages.pop_front() {
            if pred(&message) {
                taken.push(message);
            } else {
                kept.push_back(message);
            }
        }
        self.messages = kept;
        taken
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flags() {
        let mut flags = MessageFlags::NONE;
        assert!(!flags.encrypt());
        flags.set_encrypt(true);
        flags.set_mcast(true);
        assert!(flags.encrypt() && flags.mcast());
        flags.set_encrypt(false);
        assert!(!flags.encrypt() && flags.mcast());
    }

    #[test]
    fn test_pool_budget() {
        let pool = MessagePool::new(10);
        let a = pool.alloc(vec![0; 6], MessageInfo::new(FrameType::Data)).unwrap();
        assert_eq!(pool.in_use(), 6);
        let err = pool.alloc(vec![0; 6], MessageInfo::new(FrameType::Data));
        assert_eq!(err.unwrap_err(), MeshError::Mem);
        assert_eq!(pool.in_use(), 6);
        drop(a);
        assert_eq!(pool.in_use(), 0);
        assert!(pool.alloc(vec![0; 10], MessageInfo::new(FrameType::Data)).is_ok());
    }

    #[test]
    fn test_queue_take_matching() {
        let pool = MessagePool::new(1024);
        let mut queue = MessageQueue::new();
        for i in 0..4u8 {
            queue.enqueue(pool.alloc(vec![i], MessageInfo::command(i)).unwrap());
        }
        let odd = queue.take_matching(|m| m.data()[0] % 2 == 1);
        assert_eq!(odd.len(), 2);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue().unwrap().data(), &[0]);
        assert_eq!(queue.dequeue().unwrap().data(), &[2]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_duplicate_is_independent() {
        let pool = MessagePool::new(1024);
        let mut original = pool.alloc(vec![1, 2, 3], MessageInfo::command(1)).unwrap();
        let copy = pool.duplicate(&original).unwrap();
        original.data_mut().push(4);
        assert_eq!(copy.data(), &[1, 2, 3]);
        assert_eq!(copy.command(), Some(1));
    }
}
