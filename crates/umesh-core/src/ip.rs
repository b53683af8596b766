//! Upper-layer hooks: the IP adapter and interface listeners
//!
//! The forwarder hands every data payload addressed to this node to the
//! installed [`IpAdapter`]. Listeners only observe interface transitions.

use crate::types::{DeviceState, InterfaceDownReason, MeshAddr};
use std::sync::{Arc, Mutex};

/// Network layer sitting on top of the mesh
pub trait IpAdapter: Send {
    /// Payload of a data frame addressed to us
    fn input(&mut self, src: MeshAddr, payload: &[u8]);

    fn interface_up(&mut self);

    fn interface_down(&mut self, reason: InterfaceDownReason);
}

/// Observer of attach and detach events
pub trait InterfaceListener: Send {
    fn interface_up(&mut self, state: DeviceState);

    fn interface_down(&mut self, reason: InterfaceDownReason);
}

/// A payload handed up by the forwarder
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Received {
    pub src: MeshAddr,
    pub payload: Vec<u8>,
}

/// Adapter collecting received payloads in a shared queue
///
/// Clones share the queue, so a host keeps one clone to drain what the
/// node delivered to the other.
#[derive(Debug, Clone, Default)]
pub struct QueueAdapter {
    received: Arc<Mutex<Vec<Received>>>,
    up: Arc<Mutex<bool>>,
}

impl QueueAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take everything received so far
    pub fn drain(&self) -> Vec<Received> {
        match self.received.lock() {
            Ok(mut queue) => std::mem::take(&mut *queue),
            Err(_) => Vec::new(),
        }
    }

    /// Copy of everything received so far
    pub fn snapshot(&self) -> Vec<Received> {
        self.received.lock().map(|q| q.clone()).unwrap_or_default()
    }

    pub fn is_up(&self) -> bool {
        self.up.lock().map(|up| *up).unwrap_or(false)
    }
}

impl IpAdapter for QueueAdapter {
    fn input(&mut self, src: MeshAddr, payload: &[u8]) {
        if let Ok(mut queue) = self.received.lock() {
            queue.push(Received {
                src,
                payload: payload.to_vec(),
            });
        }
    }

    fn interface_up(&mut self) {
        if let Ok(mut up) = self.up.lock() {
            *up = true;
        }
    }

    fn interface_down(&mut self, _reason: InterfaceDownReason) {
        if let Ok(mut up) = self.up.lock() {
            *up = false;
        }
    }
}

/// Listener recording every transition
#[derive(Debug, Clone, Default)]
pub struct RecordingListener {
    events: Arc<Mutex<Vec<InterfaceEvent>>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterfaceEvent {
    Up(DeviceState),
    Down(InterfaceDownReason),
}

impl RecordingListener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<InterfaceEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl InterfaceListener for RecordingListener {
    fn interface_up(&mut self, state: DeviceState) {
        if let Ok(mut events) = self.events.lock() {
            events.push(InterfaceEvent::Up(state));
        }
    }

    fn interface_down(&mut self, reason: InterfaceDownReason) {
        if let Ok(mut events) = self.events.lock() {
            events.push(InterfaceEvent::Down(reason));
        }
    }
}
