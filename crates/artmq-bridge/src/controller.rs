//! Bridge controller
//!
//! Owns the universe store, the topic registry and the send pipeline, and
//! runs the two flows between the collaborators:
//!
//! - inbound: bus message -> registry lookup -> store batch -> send trigger
//! - discovery: visible nodes -> one topic per output port -> registry

use artmq_core::codec::decode_channel_values;
use artmq_core::{default_payload, from_address, ChannelValue, UniverseStore};
use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::BridgeConfig;
use crate::registry::{topic_name, TopicRegistry};
use crate::sender::{SendPipeline, SendTrigger};
use crate::shutdown::{shutdown_channel, Shutdown, ShutdownTrigger};
use crate::{BridgeError, BusEvent, LightingTransport, MessageBus, Result};

/// Ties a lighting transport and a message bus together
pub struct BridgeController {
    config: BridgeConfig,
    store: Arc<UniverseStore>,
    registry: Arc<TopicRegistry>,
    pipeline: SendPipeline,
    transport: Arc<dyn LightingTransport>,
    bus: Arc<dyn MessageBus>,
    shutdown_trigger: ShutdownTrigger,
    shutdown: Shutdown,
    started: AtomicBool,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeController {
    /// Fails only if `config.default_channels` exceeds a universe
    pub fn new(
        config: BridgeConfig,
        transport: Arc<dyn LightingTransport>,
        bus: Arc<dyn MessageBus>,
    ) -> Result<Self> {
        let (shutdown_trigger, shutdown) = shutdown_channel();
        let store = Arc::new(UniverseStore::new());
        let payload = default_payload(config.default_channels)?;
        let registry = Arc::new(TopicRegistry::new(bus.clone(), payload, shutdown.clone()));
        let pipeline = SendPipeline::new(store.clone(), transport.clone(), config.pipeline());

        Ok(Self {
            config,
            store,
            registry,
            pipeline,
            transport,
            bus,
            shutdown_trigger,
            shutdown,
            started: AtomicBool::new(false),
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn store(&self) -> &Arc<UniverseStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<TopicRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// A trigger handle onto the send queue
    pub fn trigger(&self) -> SendTrigger {
        self.pipeline.trigger()
    }

    /// Write values straight into the store and schedule a send
    pub fn set_channel_values(&self, values: &[ChannelValue]) {
        self.store.set_channel_values(values);
        self.pipeline.trigger_send();
    }

    /// Start both collaborators and the background workers.
    ///
    /// Collaborator start-up errors are returned as-is; nothing is left
    /// running in that case. A second call fails without touching the
    /// running bridge.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.is_fired() {
            return Err(BridgeError::Other("Bridge already stopped".to_string()));
        }
        if self
            .started
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(BridgeError::Other("Bridge already started".to_string()));
        }

        if let Err(e) = self.transport.start().await {
            self.started.store(false, Ordering::Release);
            return Err(e);
        }
        let events = match self.bus.start().await {
            Ok(events) => events,
            Err(e) => {
                if let Err(stop_err) = self.transport.stop().await {
                    warn!("Failed to stop transport after bus start error: {}", stop_err);
                }
                self.started.store(false, Ordering::Release);
                return Err(e);
            }
        };

        let sender = self.pipeline.start(self.shutdown.clone())?;

        let inbound = Inbound {
            store: self.store.clone(),
            registry: self.registry.clone(),
            trigger: self.pipeline.trigger(),
        };
        let dispatcher = tokio::spawn(inbound.run(events, self.shutdown.clone()));

        let discovery = self.discovery();
        let poller = tokio::spawn(discovery.run(
            self.config.discovery_interval,
            self.shutdown.clone(),
        ));

        self.tasks.lock().extend([sender, dispatcher, poller]);

        info!(
            "Bridge started (namespace {:?}, discovery every {:?})",
            self.config.namespace, self.config.discovery_interval
        );
        Ok(())
    }

    /// Signal every worker, wait for them, then stop the collaborators
    pub async fn stop(&self) -> Result<()> {
        self.shutdown_trigger.fire();

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for result in futures::future::join_all(tasks).await {
            if let Err(e) = result {
                error!("Bridge task failed: {}", e);
            }
        }

        let bus = self.bus.stop().await;
        let transport = self.transport.stop().await;
        info!("Bridge stopped");
        bus.and(transport)
    }

    /// Run one discovery round now; returns how many new topics were bound
    pub fn discover_once(&self) -> usize {
        self.discovery().run_once()
    }

    fn discovery(&self) -> Discovery {
        Discovery {
            transport: self.transport.clone(),
            registry: self.registry.clone(),
            namespace: self.config.namespace.clone(),
        }
    }
}

/// Inbound dispatcher: the only consumer of bus events
struct Inbound {
    store: Arc<UniverseStore>,
    registry: Arc<TopicRegistry>,
    trigger: SendTrigger,
}

impl Inbound {
    async fn run(self, mut events: mpsc::Receiver<BusEvent>, mut shutdown: Shutdown) {
        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle_event(event),
                    None => {
                        debug!("Bus event stream closed");
                        break;
                    }
                },
            }
        }
        debug!("Inbound dispatcher stopped");
    }

    fn handle_event(&self, event: BusEvent) {
        match event {
            BusEvent::Message { topic, payload } => {
                self.handle_message(&topic, &payload);
            }
            BusEvent::Connected { session_present } => {
                if session_present {
                    debug!("Bus reconnected with session, subscriptions kept");
                } else {
                    let count = self.registry.resubscribe_active();
                    if count > 0 {
                        info!("Bus session lost, resubscribing {} topic(s)", count);
                    }
                }
            }
            BusEvent::Disconnected { reason } => match reason {
                Some(reason) => warn!("Bus disconnected: {}", reason),
                None => warn!("Bus disconnected"),
            },
            BusEvent::Error(e) => error!("Bus error: {}", e),
        }
    }

    /// Apply one message; `false` if it was dropped
    fn handle_message(&self, topic: &str, payload: &Bytes) -> bool {
        let Some(address) = self.registry.lookup(topic) else {
            warn!("Message on unknown topic {}, dropped", topic);
            return false;
        };

        let universe = from_address(address);
        let values = match decode_channel_values(universe, payload) {
            Ok(values) => values,
            Err(e) => {
                warn!("Malformed payload on {}: {}", topic, e);
                return false;
            }
        };

        debug!(
            "{} channel value(s) for universe {} from {}",
            values.len(),
            universe,
            topic
        );
        self.store.set_channel_values(&values);
        self.trigger.trigger_send();
        true
    }
}

/// Turns visible nodes into topics
struct Discovery {
    transport: Arc<dyn LightingTransport>,
    registry: Arc<TopicRegistry>,
    namespace: String,
}

impl Discovery {
    async fn run(self, interval: Duration, mut shutdown: Shutdown) {
        // First tick completes immediately
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = shutdown.wait() => break,
                _ = ticker.tick() => {
                    self.run_once();
                }
            }
        }
        debug!("Discovery poller stopped");
    }

    fn run_once(&self) -> usize {
        let nodes = self.transport.visible_nodes();
        debug!("Currently {} devices are registered", nodes.len());

        let mut created = 0;
        for node in &nodes {
            debug!("Device: {}", node.describe());
            for port in &node.outputs {
                let topic = topic_name(&self.namespace, &node.name, port.address);
                if self.registry.ensure_topic(&topic, port.address) {
                    created += 1;
                }
            }
        }
        created
    }
}
