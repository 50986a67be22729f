//! Topic registry
//!
//! Binds MQTT topic names to lighting addresses. Each topic goes through
//!
//! ```text
//! Unregistered -> PublishPending -> SubscribePending -> Active
//!                       |                  |
//!                       +----> Failed <----+
//! ```
//!
//! exactly once per process: rediscovering a node never publishes or
//! subscribes again, and failures are not retried here.

use artmq_core::LightingAddress;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

use crate::shutdown::Shutdown;
use crate::{BridgeError, MessageBus, Result};

/// Registration progress of a topic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TopicState {
    Unregistered,
    PublishPending,
    SubscribePending,
    Active,
    Failed,
}

/// A topic and the address it is bound to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicBinding {
    pub topic: String,
    pub address: LightingAddress,
    pub state: TopicState,
}

#[derive(Debug, Clone, Copy)]
struct TopicEntry {
    address: LightingAddress,
    state: TopicState,
}

/// Build the topic name for a node's output port: `<namespace>/<node>.<port-address>`.
///
/// MQTT wildcard and level characters in the node name are replaced so the
/// name stays a single, stable topic level.
pub fn topic_name(namespace: &str, node_name: &str, address: LightingAddress) -> String {
    let node: String = node_name
        .trim()
        .chars()
        .map(|c| match c {
            '/' | '+' | '#' | '\0' => '_',
            c => c,
        })
        .collect();

    format!(
        "{}/{}.{}",
        namespace.trim_end_matches('/'),
        node,
        address.port_address()
    )
}

/// Topic name -> lighting address table with publish-once/subscribe-once semantics
pub struct TopicRegistry {
    bus: Arc<dyn MessageBus>,
    topics: Arc<DashMap<String, TopicEntry>>,
    default_payload: Vec<u8>,
    shutdown: Shutdown,
}

impl TopicRegistry {
    /// `default_payload` is published once under every new topic
    pub fn new(bus: Arc<dyn MessageBus>, default_payload: Vec<u8>, shutdown: Shutdown) -> Self {
        Self {
            bus,
            topics: Arc::new(DashMap::new()),
            default_payload,
            shutdown,
        }
    }

    /// Bind `name` to `address` and start its publish/subscribe sequence.
    ///
    /// Returns `false` without doing anything if the name is already bound,
    /// whatever its state. The check and the bind are one atomic step, so
    /// concurrent callers start at most one sequence per name.
    pub fn ensure_topic(&self, name: &str, address: LightingAddress) -> bool {
        match self.topics.entry(name.to_string()) {
            Entry::Occupied(existing) => {
                let existing = existing.get();
                if existing.address != address {
                    warn!(
                        "Topic {} already bound to {}, ignoring {}",
                        name, existing.address, address
                    );
                } else {
                    debug!("Topic {} already exists", name);
                }
                return false;
            }
            Entry::Vacant(slot) => {
                slot.insert(TopicEntry {
                    address,
                    state: TopicState::PublishPending,
                });
            }
        }

        debug!("Publishing topic {} for {}", name, address);
        tokio::spawn(register(
            self.bus.clone(),
            self.topics.clone(),
            name.to_string(),
            self.default_payload.clone(),
            self.shutdown.clone(),
        ));
        true
    }

    /// Address of an `Active` topic
    pub fn lookup(&self, name: &str) -> Option<LightingAddress> {
        self.topics
            .get(name)
            .filter(|entry| entry.state == TopicState::Active)
            .map(|entry| entry.address)
    }

    pub fn state(&self, name: &str) -> TopicState {
        self.topics
            .get(name)
            .map(|entry| entry.state)
            .unwrap_or(TopicState::Unregistered)
    }

    /// All bindings, sorted by topic name
    pub fn bindings(&self) -> Vec<TopicBinding> {
        let mut bindings: Vec<TopicBinding> = self
            .topics
            .iter()
            .map(|entry| TopicBinding {
                topic: entry.key().clone(),
                address: entry.address,
                state: entry.state,
            })
            .collect();
        bindings.sort_by(|a, b| a.topic.cmp(&b.topic));
        bindings
    }

    pub fn len(&self) -> usize {
        self.topics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.topics.is_empty()
    }

    /// Subscribe again to every `Active` topic.
    ///
    /// Only for reconnections where the broker dropped our session; the
    /// subscriptions it held are gone, so this restores rather than duplicates.
    pub fn resubscribe_active(&self) -> usize {
        let active: Vec<String> = self
            .topics
            .iter()
            .filter(|entry| entry.state == TopicState::Active)
            .map(|entry| entry.key().clone())
            .collect();

        for topic in &active {
            let bus = self.bus.clone();
            let topics = self.topics.clone();
            let mut shutdown = self.shutdown.clone();
            let topic = topic.clone();

            tokio::spawn(async move {
                match until_shutdown(&mut shutdown, bus.subscribe(&topic)).await {
                    Ok(()) => info!("Topic {} resubscribed", topic),
                    Err(e) => {
                        set_state(&topics, &topic, TopicState::Failed);
                        error!("Topic {} resubscription error: {}", topic, e);
                    }
                }
            });
        }

        active.len()
    }
}

/// Run one topic's publish -> subscribe sequence
async fn register(
    bus: Arc<dyn MessageBus>,
    topics: Arc<DashMap<String, TopicEntry>>,
    topic: String,
    payload: Vec<u8>,
    mut shutdown: Shutdown,
) {
    if let Err(e) = until_shutdown(&mut shutdown, bus.publish(&topic, payload)).await {
        set_state(&topics, &topic, TopicState::Failed);
        error!("Error publishing topic {}: {}", topic, e);
        return;
    }

    set_state(&topics, &topic, TopicState::SubscribePending);
    debug!("Topic {} published, subscribing", topic);

    if let Err(e) = until_shutdown(&mut shutdown, bus.subscribe(&topic)).await {
        set_state(&topics, &topic, TopicState::Failed);
        error!("Topic {} subscription error: {}", topic, e);
        return;
    }

    set_state(&topics, &topic, TopicState::Active);
    info!("Topic {} subscribed", topic);
}

async fn until_shutdown<F>(shutdown: &mut Shutdown, op: F) -> Result<()>
where
    F: Future<Output = Result<()>>,
{
    tokio::select! {
        biased;
        _ = shutdown.wait() => Err(BridgeError::Cancelled),
        result = op => result,
    }
}

fn set_state(topics: &DashMap<String, TopicEntry>, topic: &str, state: TopicState) {
    if let Some(mut entry) = topics.get_mut(topic) {
        entry.state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_name() {
        let addr = LightingAddress::new(0, 3);
        assert_eq!(topic_name("artnet", "Stage Left", addr), "artnet/Stage Left.3");
        assert_eq!(topic_name("artnet/", "a/b+#", addr), "artnet/a_b__.3");
        assert_eq!(
            topic_name("home/dmx", "node", LightingAddress::new(1, 2)),
            "home/dmx/node.258"
        );
    }
}
