//! # uMesh Core Library
//!
//! This crate implements uMesh, a self-forming multi-hop mesh protocol
//! that runs on top of radios exposing a small HAL contract (unicast and
//! broadcast send, receive callback, channel control).
//!
//! ## Overview
//!
//! Nodes discover each other, elect a leader, attach in a tree and get a
//! 16-bit short id (SID) from their parent. Frames are then forwarded hop
//! by hop using the router policy of the network:
//!
//! - **Forwarder**: header codec, fragmentation, per-HAL send queues
//! - **Mesh management**: discovery, advertisement, attach, migration
//! - **Address resolution**: uuid/SID lookups through the leader
//! - **Link management**: neighbor table, link cost estimation
//! - **Routers**: structured-SID tree router or distance-vector router
//! - **Auth**: EAPOL/EAP relay with ID2 challenge-response
//! - **Low power**: wake-up schedules for devices without `RX_ON`
//!
//! ## Frame Flow
//!
//! ```text
//! TX: send_data → address resolve → next hop → fragment → HAL queue → driver
//! RX: driver → HalEventSink → task queue → header decode → reassemble → command / data
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use umesh_core::{MeshConfig, SimMedium, Simulator};
//!
//! let mut sim = Simulator::new(SimMedium::new());
//! let leader = sim.add_node(MeshConfig::default().with_seed(1));
//! let joiner = sim.add_node(MeshConfig::default().with_seed(2));
//! sim.start_all();
//! sim.run_for(60_000);
//!
//! let dest = sim.node(leader).mesh_addr();
//! sim.node_mut(joiner).send_data(dest, b"hello mesh").ok();
//! sim.run_for(1_000);
//! ```

pub mod address;
pub mod auth;
pub mod command;
pub mod config;
pub mod cursor;
pub mod error;
pub mod forwarder;
pub mod hal;
pub mod ip;
pub mod keys;
pub mod link;
pub mod lowpower;
pub mod mcast;
pub mod message;
pub mod mgmt;
pub mod network_data;
pub mod node;
pub mod router;
pub mod sid_allocator;
pub mod sim;
pub mod timer;
pub mod tlv;
pub mod types;

// Re-export main types
pub use config::{Id2Credentials, MediaTimings, MeshConfig, RouterKind};
pub use error::{MeshError, MeshResult};
pub use forwarder::header::MeshHeader;
pub use hal::{Hal, HalEventSink, LinkStats, RxFrame, TxStatus};
pub use ip::{InterfaceListener, IpAdapter, QueueAdapter, Received};
pub use node::{AuthServerSink, MeshNode, MeshStats, NeighborInfo};
pub use sim::{SimHal, SimMedium, Simulator};
pub use types::{DeviceState, ExtAddr, InterfaceDownReason, MediaType, MeshAddr, Mode};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::config::{MeshConfig, RouterKind};
    pub use crate::error::{MeshError, MeshResult};
    pub use crate::hal::{Hal, HalEventSink, TxStatus};
    pub use crate::node::MeshNode;
    pub use crate::types::{DeviceState, ExtAddr, MeshAddr, Mode};
}
