//! artnet2mqtt bridging pipeline
//!
//! Connects a lighting network to a pub/sub bus:
//! - Trigger-driven send loop ([`SendPipeline`])
//! - Topic registry with publish-once/subscribe-once semantics ([`TopicRegistry`])
//! - Controller tying both flows together ([`BridgeController`])
//! - Art-Net transport and MQTT bus implementations (feature-gated)

pub mod config;
pub mod controller;
pub mod error;
pub mod node;
pub mod registry;
pub mod sender;
pub mod shutdown;
pub mod traits;

#[cfg(feature = "artnet")]
pub mod artnet;

#[cfg(feature = "artnet")]
pub mod netif;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use config::{BridgeConfig, SendPipelineConfig};
pub use controller::BridgeController;
pub use error::{BridgeError, Result};
pub use node::{Node, Port};
pub use registry::{topic_name, TopicBinding, TopicRegistry, TopicState};
pub use sender::{SendPipeline, SendTrigger};
pub use shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
pub use traits::{BusEvent, LightingTransport, MessageBus};

#[cfg(feature = "artnet")]
pub use artnet::{ArtNetConfig, ArtNetTransport};

#[cfg(feature = "mqtt")]
pub use mqtt::{MqttBus, MqttBusConfig};
