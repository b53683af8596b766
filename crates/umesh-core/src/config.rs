//! Node configuration
//!
//! [`MeshConfig`] is the runtime capability set of a node: which router
//! policy it runs, whether joiners must authenticate, its security level
//! and the timing profile of each radio medium. It is plain data and can
//! be loaded from JSON by the CLI.

use crate::tlv::ID2_LEN;
use crate::types::{ExtAddr, MediaType, Mode};
use serde::{Deserialize, Serialize};

/// Security level: frames are sent in the clear
pub const SEC_LEVEL_0: u8 = 0;
/// Security level: commands and data are encrypted with AES-CTR
pub const SEC_LEVEL_1: u8 = 1;

/// Default pre-shared master key used to derive group keys
pub const DEFAULT_MASTER_KEY: [u8; 16] = [
    0x75, 0x6d, 0x65, 0x73, 0x68, 0x2d, 0x6d, 0x61,
    0x73, 0x74, 0x65, 0x72, 0x2d, 0x6b, 0x65, 0x79,
];

/// Routing policy selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RouterKind {
    /// Hierarchical structured-SID tree router
    Sid,
    /// Distance-vector router with leader-assigned random SIDs
    Vector,
}

impl std::str::FromStr for RouterKind {
    type Err = crate::error::MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sid" => Ok(RouterKind::Sid),
            "vector" => Ok(RouterKind::Vector),
            _ => Err(crate::error::MeshError::Parse("router kind")),
        }
    }
}

/// Timing profile of one radio medium (all intervals in milliseconds)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MediaTimings {
    pub advertisement_interval_ms: u64,
    pub attach_request_interval_ms: u64,
    pub sid_request_interval_ms: u64,
    pub link_quality_interval_ms: u64,
    pub link_quality_mobile_interval_ms: u64,
    pub neighbor_alive_ms: u64,
    pub discovery_interval_ms: u64,
    pub auth_request_interval_ms: u64,
    pub auth_relay_interval_ms: u64,
    pub notification_interval_ms: u64,
    /// SID cache entries survive this many cache check ticks
    pub addr_cache_alive_ticks: u8,
    /// Links heard below this RSSI lose their estimate
    pub rssi_threshold: i8,
}

impl MediaTimings {
    /// Defaults for a medium
    pub fn for_media(media: MediaType) -> Self {
        match media {
            MediaType::Wifi => Self {
                advertisement_interval_ms: 20_000,
                attach_request_interval_ms: 1_000,
                sid_request_interval_ms: 3_000,
                link_quality_interval_ms: 30_000,
                link_quality_mobile_interval_ms: 1_000,
                neighbor_alive_ms: 120_000, // 2 minutes
                discovery_interval_ms: 400,
                auth_request_interval_ms: 1_000,
                auth_relay_interval_ms: 3_000,
                notification_interval_ms: 60_000,
                addr_cache_alive_ticks: 3,
                rssi_threshold: -90,
            },
            MediaType::Ble => Self {
                advertisement_interval_ms: 30_000,
                attach_request_interval_ms: 2_000,
                sid_request_interval_ms: 4_000,
                link_quality_interval_ms: 60_000,
                link_quality_mobile_interval_ms: 2_000,
                neighbor_alive_ms: 180_000, // 3 minutes
                discovery_interval_ms: 2_000,
                auth_request_interval_ms: 2_000,
                auth_relay_interval_ms: 5_000,
                notification_interval_ms: 120_000,
                addr_cache_alive_ticks: 5,
                rssi_threshold: -95,
            },
            MediaType::Ieee154 => Self {
                advertisement_interval_ms: 40_000,
                attach_request_interval_ms: 2_000,
                sid_request_interval_ms: 5_000,
                link_quality_interval_ms: 60_000,
                link_quality_mobile_interval_ms: 2_000,
                neighbor_alive_ms: 240_000, // 4 minutes
                discovery_interval_ms: 1_000,
                auth_request_interval_ms: 2_000,
                auth_relay_interval_ms: 5_000,
                notification_interval_ms: 120_000,
                addr_cache_alive_ticks: 5,
                rssi_threshold: -95,
            },
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeshConfig {
    /// Capability bits
    pub mode: Mode,
    /// 0 = clear, 1 = AES-CTR
    pub sec_level: u8,
    /// Routing policy
    pub router: RouterKind,
    /// Channels scanned during discovery
    pub channels: Vec<u8>,
    /// Require EAP/ID2 authentication before attaching
    pub auth_enabled: bool,
    /// Master key for group key derivation
    pub master_key: [u8; 16],
    /// Fixed RNG seed for reproducible runs
    pub seed: Option<u64>,
    /// Total bytes allowed in in-flight messages
    pub message_buffer_bytes: usize,
    /// Neighbor table capacity per HAL
    pub max_neighbors: usize,
    /// Only accept frames from these macs when enabled
    pub whitelist_enabled: bool,
    pub whitelist: Vec<ExtAddr>,
    /// Overrides the per-media timing profile for every HAL
    pub timings: Option<MediaTimings>,
    /// Device identity presented during authentication
    pub id2: Option<Id2Credentials>,
}

/// ID2 device identity and the secret shared with the auth server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Id2Credentials {
    pub id2: [u8; ID2_LEN],
    pub secret: Vec<u8>,
}

impl Id2Credentials {
    /// Build credentials from a printable identity, zero padded
    pub fn new(id2: &str, secret: &[u8]) -> Self {
        Self {
            id2: id2_from_str(id2),
            secret: secret.to_vec(),
        }
    }
}

/// Zero-padded ID2 from a printable identity, truncated to `ID2_LEN`
pub fn id2_from_str(id2: &str) -> [u8; ID2_LEN] {
    let mut out = [0u8; ID2_LEN];
    for (dst, src) in out.iter_mut().zip(id2.as_bytes()) {
        *dst = *src;
    }
    out
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            mode: Mode::RX_ON,
            sec_level: SEC_LEVEL_0,
            router: RouterKind::Sid,
            channels: vec![1, 6, 11],
            auth_enabled: false,
            master_key: DEFAULT_MASTER_KEY,
            seed: None,
            message_buffer_bytes: 16 * 1024, // 16 KiB
            max_neighbors: crate::link::MAX_NEIGHBORS_NUM,
            whitelist_enabled: false,
            whitelist: Vec::new(),
            timings: None,
            id2: None,
        }
    }
}

impl MeshConfig {
    pub fn with_mode(mut self, mode: Mode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_sec_level(mut self, level: u8) -> Self {
        self.sec_level = level;
        self
    }

    pub fn with_router(mut self, router: RouterKind) -> Self {
        self.router = router;
        self
    }

    pub fn with_channels(mut self, channels: Vec<u8>) -> Self {
        self.channels = channels;
        self
    }

    pub fn with_auth(mut self, enabled: bool) -> Self {
        self.auth_enabled = enabled;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    pub fn with_timings(mut self, timings: MediaTimings) -> Self {
        self.timings = Some(timings);
        self
    }

    pub fn with_id2(mut self, credentials: Id2Credentials) -> Self {
        self.id2 = Some(credentials);
        self
    }

    pub fn with_message_buffer(mut self, bytes: usize) -> Self {
        self.message_buffer_bytes = bytes;
        self
    }

    /// Timing profile for a HAL of the given medium
    pub fn timings_for(&self, media: MediaType) -> MediaTimings {
        self.timings
            .clone()
            .unwrap_or_else(|| MediaTimings::for_media(media))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = MeshConfig::default();
        assert!(config.mode.is_rx_on());
        assert_eq!(config.sec_level, SEC_LEVEL_0);
        assert_eq!(config.router, RouterKind::Sid);
        assert!(!config.channels.is_empty());
    }

    #[test]
    fn test_timings_override() {
        let mut fast = MediaTimings::for_media(MediaType::Wifi);
        fast.advertisement_interval_ms = 500;
        let config = MeshConfig::default().with_timings(fast);
        assert_eq!(config.timings_for(MediaType::Ble).advertisement_interval_ms, 500);
        assert_eq!(
            MeshConfig::default()
                .timings_for(MediaType::Ble)
                .advertisement_interval_ms,
            30_000
        );
    }

    #[test]
    fn test_config_json_round_trip() {
        let config = MeshConfig::default()
            .with_router(RouterKind::Vector)
            .with_sec_level(SEC_LEVEL_1)
            .with_seed(7);
        let json = serde_json::to_string(&config).unwrap();
        let back: MeshConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.router, RouterKind::Vector);
        assert_eq!(back.sec_level, SEC_LEVEL_1);
        assert_eq!(back.seed, Some(7));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: MeshConfig = serde_json::from_str(r#"{"router":"vector"}"#).unwrap();
        assert_eq!(config.router, RouterKind::Vector);
        assert_eq!(config.message_buffer_bytes, 16 * 1024);
    }
}
