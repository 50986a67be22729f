//! artnet2mqtt core
//!
//! Shared primitives for the Art-Net <-> MQTT bridge:
//! - DMX types ([`Universe`], [`Channel`], [`ChannelValue`], [`DmxCommand`])
//! - Universe number <-> wire address mapping ([`LightingAddress`])
//! - Concurrency-safe universe state ([`UniverseStore`])
//! - MQTT payload encoding/decoding ([`codec`])

pub mod address;
pub mod codec;
pub mod error;
pub mod state;
pub mod types;

pub use address::{from_address, to_address, LightingAddress};
pub use codec::{decode_payload, default_payload, encode_payload};
pub use error::{Error, Result};
pub use state::{UniverseSnapshot, UniverseStore};
pub use types::*;

/// Number of channels in a DMX universe
pub const UNIVERSE_SIZE: usize = 512;

/// Art-Net UDP port
pub const ARTNET_PORT: u16 = 6454;

/// Topic namespace used when none is configured
pub const DEFAULT_NAMESPACE: &str = "artnet";

/// Number of zeroed commands published when a topic is first announced
pub const DEFAULT_CHANNEL_COUNT: u16 = 3;
