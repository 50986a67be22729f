//! Bridge configuration

use artmq_core::{DEFAULT_CHANNEL_COUNT, DEFAULT_NAMESPACE};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for the bridge controller and its workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeConfig {
    /// Topic namespace: topics are `<namespace>/<node>.<port-address>`
    pub namespace: String,
    /// Zeroed channels published when a topic is first announced
    pub default_channels: u16,
    /// How often visible nodes are turned into topics
    pub discovery_interval: Duration,
    /// Trigger queue capacity of the send pipeline
    pub send_queue_capacity: usize,
    /// Minimum gap between two send rounds (zero = unthrottled)
    pub min_frame_interval: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_channels: DEFAULT_CHANNEL_COUNT,
            discovery_interval: Duration::from_secs(30),
            send_queue_capacity: 10,
            min_frame_interval: Duration::from_millis(25),
        }
    }
}

impl BridgeConfig {
    pub(crate) fn pipeline(&self) -> SendPipelineConfig {
        SendPipelineConfig {
            queue_capacity: self.send_queue_capacity,
            min_frame_interval: self.min_frame_interval,
        }
    }
}

/// Send pipeline settings
#[derive(Debug, Clone, Copy)]
pub struct SendPipelineConfig {
    pub queue_capacity: usize,
    pub min_frame_interval: Duration,
}

impl Default for SendPipelineConfig {
    fn default() -> Self {
        BridgeConfig::default().pipeline()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = BridgeConfig::default();
        assert_eq!(config.namespace, "artnet");
        assert_eq!(config.default_channels, 3);
        assert_eq!(config.send_queue_capacity, 10);
        assert_eq!(SendPipelineConfig::default().queue_capacity, 10);
    }
}
