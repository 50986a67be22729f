//! Configuration file
//!
//! TOML with one table per concern. Every key has a default, but the file
//! itself must exist.

use anyhow::{Context, Result};
use artmq_bridge::mqtt::default_client_id;
use artmq_bridge::{ArtNetConfig, BridgeConfig, MqttBusConfig};
use artmq_core::{ARTNET_PORT, DEFAULT_CHANNEL_COUNT, DEFAULT_NAMESPACE};
use serde::{Deserialize, Deserializer};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    #[serde(alias = "Logger")]
    pub logger: LoggerConf,
    #[serde(alias = "MQTT")]
    pub mqtt: MqttConf,
    #[serde(alias = "ArtNet", alias = "Artnet")]
    pub artnet: ArtNetConf,
    #[serde(alias = "Bridge")]
    pub bridge: BridgeConf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggerConf {
    #[serde(rename = "log-level")]
    pub level: String,
}

impl Default for LoggerConf {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MqttConf {
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "server")]
    pub host: String,
    /// Accepted as `"1883"` or `1883`
    #[serde(deserialize_with = "port_from_str_or_int")]
    pub port: u16,
    pub user: String,
    pub password: String,
    pub qos: u8,
    #[serde(rename = "keep-alive")]
    pub keep_alive: u16,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            client_id: String::new(),
            host: "localhost".to_string(),
            port: 1883,
            user: String::new(),
            password: String::new(),
            qos: 0,
            keep_alive: 30,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ArtNetConf {
    /// CIDR the Art-Net interface lives in; empty disables the lookup
    pub network: String,
    pub bind: String,
    /// Seconds
    #[serde(rename = "poll-interval")]
    pub poll_interval: u64,
    /// Seconds
    #[serde(rename = "node-timeout")]
    pub node_timeout: u64,
    pub broadcast: Option<String>,
}

impl Default for ArtNetConf {
    fn default() -> Self {
        Self {
            network: "192.168.6.0/24".to_string(),
            bind: format!("0.0.0.0:{}", ARTNET_PORT),
            poll_interval: 3,
            node_timeout: 10,
            broadcast: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct BridgeConf {
    pub namespace: String,
    pub default_channels: u16,
    /// Seconds
    pub discovery_interval: u64,
    pub send_queue_capacity: usize,
    pub min_frame_interval_ms: u64,
}

impl Default for BridgeConf {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            default_channels: DEFAULT_CHANNEL_COUNT,
            discovery_interval: 30,
            send_queue_capacity: 10,
            min_frame_interval_ms: 25,
        }
    }
}

fn port_from_str_or_int<'de, D>(deserializer: D) -> std::result::Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Port {
        Int(u16),
        Str(String),
    }

    match Port::deserialize(deserializer)? {
        Port::Int(port) => Ok(port),
        Port::Str(s) => s
            .trim()
            .parse()
            .map_err(|_| serde::de::Error::custom(format!("invalid port {:?}", s))),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

impl Config {
    /// Read and parse a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("configuration file read error: {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("invalid configuration in {}", path.display()))
    }

    pub fn parse(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text)?;
        if config.mqtt.qos > 2 {
            anyhow::bail!("mqtt qos must be 0, 1 or 2, got {}", config.mqtt.qos);
        }
        Ok(config)
    }

    pub fn mqtt_config(&self) -> MqttBusConfig {
        MqttBusConfig {
            broker_host: self.mqtt.host.clone(),
            broker_port: self.mqtt.port,
            client_id: non_empty(&self.mqtt.client_id).unwrap_or_else(default_client_id),
            username: non_empty(&self.mqtt.user),
            password: non_empty(&self.mqtt.password),
            qos: self.mqtt.qos,
            keep_alive_secs: self.mqtt.keep_alive,
            ..Default::default()
        }
    }

    pub fn artnet_config(&self) -> ArtNetConfig {
        ArtNetConfig {
            network: non_empty(&self.artnet.network),
            bind_addr: self.artnet.bind.clone(),
            poll_target: None,
            broadcast: self.artnet.broadcast.as_deref().and_then(non_empty),
            poll_interval: Duration::from_secs(self.artnet.poll_interval.max(1)),
            node_timeout: Duration::from_secs(self.artnet.node_timeout.max(1)),
        }
    }

    pub fn bridge_config(&self) -> BridgeConfig {
        BridgeConfig {
            namespace: self.bridge.namespace.clone(),
            default_channels: self.bridge.default_channels,
            discovery_interval: Duration::from_secs(self.bridge.discovery_interval.max(1)),
            send_queue_capacity: self.bridge.send_queue_capacity,
            min_frame_interval: Duration::from_millis(self.bridge.min_frame_interval_ms),
        }
    }
}
