//! Test helpers for artnet2mqtt
//!
//! - Condition-based waiting (no hardcoded sleeps)
//! - [`MockTransport`]: in-memory lighting network recording every send
//! - [`MockBus`]: in-memory message bus recording every publish/subscribe

use artmq_bridge::{BridgeError, BusEvent, LightingTransport, MessageBus, Node, Result};
use artmq_core::{LightingAddress, Universe};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Default test timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default condition check interval
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_millis(10);

// ============================================================================
// Condition-Based Waiting
// ============================================================================

/// Wait for a condition with timeout
pub async fn wait_for<F, Fut>(check: F, interval: Duration, max_wait: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = Instant::now();
    while start.elapsed() < max_wait {
        if check().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Wait for an atomic counter to reach a target value
pub async fn wait_for_count(counter: &AtomicU32, target: u32, max_wait: Duration) -> bool {
    wait_for(
        || async { counter.load(Ordering::SeqCst) >= target },
        DEFAULT_CHECK_INTERVAL,
        max_wait,
    )
    .await
}

// ============================================================================
// Mock lighting transport
// ============================================================================

/// Lighting transport that keeps everything in memory
#[derive(Default)]
pub struct MockTransport {
    nodes: Mutex<Vec<Node>>,
    sent: Mutex<Vec<(LightingAddress, Universe)>>,
    /// Number of successful sends
    pub send_count: AtomicU32,
    running: AtomicBool,
    fail_start: AtomicBool,
    fail_send: AtomicBool,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the set of visible nodes
    pub fn set_nodes(&self, nodes: Vec<Node>) {
        *self.nodes.lock() = nodes;
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_send(&self, fail: bool) {
        self.fail_send.store(fail, Ordering::SeqCst);
    }

    /// Every universe sent so far, in order
    pub fn sent(&self) -> Vec<(LightingAddress, Universe)> {
        self.sent.lock().clone()
    }

    /// Most recent data sent to `address`
    pub fn last_sent(&self, address: LightingAddress) -> Option<Universe> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|(a, _)| *a == address)
            .map(|(_, data)| *data)
    }
}

#[async_trait]
impl LightingTransport for MockTransport {
    async fn start(&self) -> Result<()> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionFailed("mock transport".to_string()));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, address: LightingAddress, data: &Universe) -> Result<()> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(BridgeError::Send("mock send failure".to_string()));
        }
        self.sent.lock().push((address, *data));
        self.send_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn visible_nodes(&self) -> Vec<Node> {
        self.nodes.lock().clone()
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

// ============================================================================
// Mock message bus
// ============================================================================

/// A request made against [`MockBus`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusCall {
    Publish { topic: String, payload: Vec<u8> },
    Subscribe { topic: String },
}

/// Message bus that records calls and lets tests inject events
pub struct MockBus {
    calls: Mutex<Vec<BusCall>>,
    events: Mutex<Option<mpsc::Sender<BusEvent>>>,
    /// Number of accepted publishes
    pub publish_count: AtomicU32,
    /// Number of accepted subscribes
    pub subscribe_count: AtomicU32,
    running: AtomicBool,
    fail_start: AtomicBool,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    delay: Mutex<Duration>,
}

impl Default for MockBus {
    fn default() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(None),
            publish_count: AtomicU32::new(0),
            subscribe_count: AtomicU32::new(0),
            running: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            fail_publish: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            delay: Mutex::new(Duration::ZERO),
        }
    }
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    pub fn fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Delay every publish/subscribe confirmation
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Every accepted call, in order
    pub fn calls(&self) -> Vec<BusCall> {
        self.calls.lock().clone()
    }

    pub fn publishes_to(&self, topic: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, BusCall::Publish { topic: t, .. } if t == topic))
            .count()
    }

    pub fn subscribes_to(&self, topic: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| matches!(c, BusCall::Subscribe { topic: t } if t == topic))
            .count()
    }

    /// Push an event to whoever started the bus
    pub async fn emit(&self, event: BusEvent) -> bool {
        let tx = self.events.lock().clone();
        match tx {
            Some(tx) => tx.send(event).await.is_ok(),
            None => false,
        }
    }

    /// Deliver a message as if the broker had routed it to us
    pub async fn deliver(&self, topic: &str, payload: &[u8]) -> bool {
        self.emit(BusEvent::Message {
            topic: topic.to_string(),
            payload: Bytes::copy_from_slice(payload),
        })
        .await
    }

    async fn confirm(&self) {
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl MessageBus for MockBus {
    async fn start(&self) -> Result<mpsc::Receiver<BusEvent>> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(BridgeError::ConnectionFailed("mock bus".to_string()));
        }
        let (tx, rx) = mpsc::channel(100);
        *self.events.lock() = Some(tx);
        self.running.store(true, Ordering::SeqCst);
        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        self.events.lock().take();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.confirm().await;
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(BridgeError::Publish(format!("mock failure on {}", topic)));
        }
        self.calls.lock().push(BusCall::Publish {
            topic: topic.to_string(),
            payload,
        });
        self.publish_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        self.confirm().await;
        if self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(BridgeError::Subscribe(format!("mock failure on {}", topic)));
        }
        self.calls.lock().push(BusCall::Subscribe {
            topic: topic.to_string(),
        });
        self.subscribe_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}
