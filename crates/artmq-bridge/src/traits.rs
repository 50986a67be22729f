//! Collaborator capabilities consumed by the bridge

use artmq_core::{LightingAddress, Universe};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::node::Node;
use crate::Result;

/// Events from a message bus
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// Inbound message on a subscribed topic
    Message { topic: String, payload: Bytes },
    /// (Re)connected to the broker
    Connected {
        /// Broker still holds our subscriptions from a previous connection
        session_present: bool,
    },
    /// Connection lost
    Disconnected { reason: Option<String> },
    /// Error occurred
    Error(String),
}

/// The lighting network side: sends universes and reports visible nodes.
///
/// Implementations must allow concurrent calls to [`send`](Self::send).
#[async_trait]
pub trait LightingTransport: Send + Sync {
    /// Open sockets and start discovery
    async fn start(&self) -> Result<()>;

    /// Release sockets and stop background tasks
    async fn stop(&self) -> Result<()>;

    /// Transmit one universe to the nodes listening on `address`
    async fn send(&self, address: LightingAddress, data: &Universe) -> Result<()>;

    /// Nodes currently visible on the network
    fn visible_nodes(&self) -> Vec<Node>;

    /// Check if the transport is running
    fn is_running(&self) -> bool;
}

/// The pub/sub side.
///
/// `publish` and `subscribe` resolve once the bus has confirmed the request,
/// and must be safe to call concurrently.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Connect and return the stream of inbound events
    async fn start(&self) -> Result<mpsc::Receiver<BusEvent>>;

    /// Disconnect
    async fn stop(&self) -> Result<()>;

    /// Publish a payload under `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to `topic`; deliveries arrive as [`BusEvent::Message`]
    async fn subscribe(&self, topic: &str) -> Result<()>;

    /// Check if the bus is connected
    fn is_running(&self) -> bool;
}
