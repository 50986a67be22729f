//! MQTT message bus
//!
//! Wraps a rumqttc client. The session is persistent (`clean_session = false`)
//! so the broker keeps our subscriptions across short disconnections; the
//! event loop reconnects on its own after `reconnect_delay`.
//!
//! `subscribe`, and `publish` above QoS 0, resolve only once the broker
//! acknowledges the request. A SubAck failure code fails the subscribe.

use async_trait::async_trait;
use parking_lot::Mutex;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet,
    QoS as MqttQoS, SubscribeReasonCode,
};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{BridgeError, BusEvent, MessageBus, Result};

/// MQTT bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttBusConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub client_id: String,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    /// QoS level (0, 1, or 2)
    #[serde(default)]
    pub qos: u8,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u16,
    /// Keep the broker session (and its subscriptions) across reconnects
    #[serde(default)]
    pub clean_session: bool,
    /// How long `start` waits for the first CONNACK
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: Duration,
    /// How long `publish`/`subscribe` wait for the client to take a request,
    /// and again for the broker to acknowledge it
    #[serde(default = "default_request_timeout")]
    pub request_timeout: Duration,
    /// Pause between reconnection attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay: Duration,
    /// Capacity of the request and event queues
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

fn default_keep_alive() -> u16 {
    30
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn default_capacity() -> usize {
    100
}

/// `artnet2mqtt-` plus a short random suffix
pub fn default_client_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("artnet2mqtt-{}", &id[..8])
}

impl Default for MqttBusConfig {
    fn default() -> Self {
        Self {
            broker_host: "localhost".to_string(),
            broker_port: 1883,
            client_id: default_client_id(),
            username: None,
            password: None,
            qos: 0,
            keep_alive_secs: default_keep_alive(),
            clean_session: false,
            connect_timeout: default_connect_timeout(),
            request_timeout: default_request_timeout(),
            reconnect_delay: default_reconnect_delay(),
            capacity: default_capacity(),
        }
    }
}

type AckSender = oneshot::Sender<std::result::Result<(), String>>;

/// Requests of one kind waiting for the broker
#[derive(Default)]
struct Pending {
    /// Submitted to the client, packet id not assigned yet
    queued: VecDeque<AckSender>,
    /// On the wire, keyed by packet id
    sent: HashMap<u16, AckSender>,
}

impl Pending {
    /// The oldest queued request went out as `pkid`
    fn sent(&mut self, pkid: u16) {
        // Retransmission after reconnect
        if self.sent.contains_key(&pkid) {
            return;
        }
        if let Some(ack) = self.queued.pop_front() {
            self.sent.insert(pkid, ack);
        }
    }

    fn complete(&mut self, pkid: u16, result: std::result::Result<(), String>) {
        if let Some(ack) = self.sent.remove(&pkid) {
            let _ = ack.send(result);
        }
    }

    fn fail_sent(&mut self, reason: &str) {
        for (_, ack) in self.sent.drain() {
            let _ = ack.send(Err(reason.to_string()));
        }
    }

    fn clear(&mut self) {
        self.queued.clear();
        self.sent.clear();
    }
}

/// Pairs client requests with broker acknowledgements.
///
/// rumqttc assigns packet ids only when a request leaves its queue, so
/// requests are recorded in submission order and bound to their id by the
/// matching outgoing event.
#[derive(Default)]
struct AckTracker {
    /// Held across record + submit so both orders agree
    order: tokio::sync::Mutex<()>,
    subscribes: Mutex<Pending>,
    publishes: Mutex<Pending>,
}

/// [`MessageBus`] over an MQTT broker
pub struct MqttBus {
    config: MqttBusConfig,
    client: Mutex<Option<AsyncClient>>,
    running: Arc<Mutex<bool>>,
    event_loop: Mutex<Option<JoinHandle<()>>>,
    acks: Arc<AckTracker>,
}

impl MqttBus {
    pub fn new(config: MqttBusConfig) -> Self {
        Self {
            config,
            client: Mutex::new(None),
            running: Arc::new(Mutex::new(false)),
            event_loop: Mutex::new(None),
            acks: Arc::new(AckTracker::default()),
        }
    }

    /// Parse MQTT QoS level
    fn parse_qos(qos: u8) -> MqttQoS {
        match qos {
            0 => MqttQoS::AtMostOnce,
            1 => MqttQoS::AtLeastOnce,
            _ => MqttQoS::ExactlyOnce,
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            &self.config.client_id,
            &self.config.broker_host,
            self.config.broker_port,
        );
        options.set_keep_alive(Duration::from_secs(self.config.keep_alive_secs as u64));
        options.set_clean_session(self.config.clean_session);

        if let Some(user) = &self.config.username {
            let pass = self.config.password.as_deref().unwrap_or_default();
            options.set_credentials(user, pass);
        }
        options
    }

    fn client(&self) -> Result<AsyncClient> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::ConnectionFailed("Not connected".to_string()))
    }

    /// Bound a client request by `request_timeout`
    async fn request<F, E>(&self, what: &str, op: F) -> std::result::Result<(), String>
    where
        F: Future<Output = std::result::Result<(), E>>,
        E: std::fmt::Display,
    {
        match tokio::time::timeout(self.config.request_timeout, op).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "{} not accepted within {:?}",
                what, self.config.request_timeout
            )),
        }
    }

    /// Submit a request, then wait for the broker to acknowledge it
    async fn acknowledged<F, E>(
        &self,
        what: &str,
        pending: &Mutex<Pending>,
        op: F,
    ) -> std::result::Result<(), String>
    where
        F: Future<Output = std::result::Result<(), E>>,
        E: std::fmt::Display,
    {
        let (tx, rx) = oneshot::channel();
        {
            let _order = self.acks.order.lock().await;
            pending.lock().queued.push_back(tx);
            if let Err(e) = self.request(what, op).await {
                pending.lock().queued.pop_back();
                return Err(e);
            }
        }

        match tokio::time::timeout(self.config.request_timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(format!("{} abandoned, connection closed", what)),
            Err(_) => Err(format!(
                "{} not acknowledged within {:?}",
                what, self.config.request_timeout
            )),
        }
    }
}

#[async_trait]
impl MessageBus for MqttBus {
    async fn start(&self) -> Result<mpsc::Receiver<BusEvent>> {
        if *self.running.lock() {
            return Err(BridgeError::Other("Bus already running".to_string()));
        }

        let (client, eventloop) = AsyncClient::new(self.options(), self.config.capacity);
        let (tx, rx) = mpsc::channel(self.config.capacity);
        let (connected_tx, connected_rx) = oneshot::channel();

        info!(
            "MQTT connecting to {}:{} as {}",
            self.config.broker_host, self.config.broker_port, self.config.client_id
        );

        self.acks.subscribes.lock().clear();
        self.acks.publishes.lock().clear();

        *self.running.lock() = true;
        let handle = tokio::spawn(run_event_loop(
            eventloop,
            tx,
            connected_tx,
            self.acks.clone(),
            self.running.clone(),
            self.config.reconnect_delay,
        ));

        let outcome = tokio::time::timeout(self.config.connect_timeout, connected_rx).await;
        let failure = match outcome {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(reason))) => Some(BridgeError::ConnectionFailed(reason)),
            Ok(Err(_)) => Some(BridgeError::ConnectionFailed(
                "event loop exited before connecting".to_string(),
            )),
            Err(_) => Some(BridgeError::Timeout(format!(
                "no CONNACK from {}:{} within {:?}",
                self.config.broker_host, self.config.broker_port, self.config.connect_timeout
            ))),
        };

        if let Some(e) = failure {
            *self.running.lock() = false;
            handle.abort();
            return Err(e);
        }

        *self.client.lock() = Some(client);
        *self.event_loop.lock() = Some(handle);
        Ok(rx)
    }

    async fn stop(&self) -> Result<()> {
        *self.running.lock() = false;
        let client = self.client.lock().take();
        if let Some(client) = client {
            let _ = client.disconnect().await;
        }
        if let Some(handle) = self.event_loop.lock().take() {
            handle.abort();
        }
        info!("MQTT bus stopped");
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        let client = self.client()?;
        let qos = Self::parse_qos(self.config.qos);

        let request = client.publish(topic, qos, false, payload);
        let result = if qos == MqttQoS::AtMostOnce {
            self.request("publish", request).await
        } else {
            self.acknowledged("publish", &self.acks.publishes, request).await
        };
        result.map_err(|e| BridgeError::Publish(format!("{}: {}", topic, e)))?;

        debug!("MQTT published to {}", topic);
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        let client = self.client()?;
        let qos = Self::parse_qos(self.config.qos);

        self.acknowledged("subscribe", &self.acks.subscribes, client.subscribe(topic, qos))
            .await
            .map_err(|e| BridgeError::Subscribe(format!("{}: {}", topic, e)))?;

        debug!("MQTT subscribed to {}", topic);
        Ok(())
    }

    fn is_running(&self) -> bool {
        *self.running.lock()
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<BusEvent>,
    connected_tx: oneshot::Sender<std::result::Result<(), String>>,
    acks: Arc<AckTracker>,
    running: Arc<Mutex<bool>>,
    reconnect_delay: Duration,
) {
    let mut connected_tx = Some(connected_tx);

    while *running.lock() {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                debug!(
                    "MQTT received: {} ({} bytes)",
                    publish.topic,
                    publish.payload.len()
                );
                let event = BusEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                };
                if tx.send(event).await.is_err() {
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code != ConnectReturnCode::Success {
                    let reason = format!("broker refused connection: {:?}", ack.code);
                    error!("MQTT {}", reason);
                    if let Some(notify) = connected_tx.take() {
                        let _ = notify.send(Err(reason));
                        break;
                    }
                    continue;
                }

                info!(
                    "MQTT connected to broker (session present: {})",
                    ack.session_present
                );
                if let Some(notify) = connected_tx.take() {
                    let _ = notify.send(Ok(()));
                }
                let _ = tx
                    .send(BusEvent::Connected {
                        session_present: ack.session_present,
                    })
                    .await;
            }
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                acks.subscribes.lock().sent(pkid);
            }
            // QoS 0 publishes carry no packet id and get no ack
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) if pkid != 0 => {
                acks.publishes.lock().sent(pkid);
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let result = if ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure))
                {
                    warn!("MQTT broker rejected subscription (pkid {})", ack.pkid);
                    Err("rejected by broker".to_string())
                } else {
                    Ok(())
                };
                acks.subscribes.lock().complete(ack.pkid, result);
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => {
                acks.publishes.lock().complete(ack.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::PubComp(comp))) => {
                acks.publishes.lock().complete(comp.pkid, Ok(()));
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("MQTT disconnected from broker");
                let _ = tx
                    .send(BusEvent::Disconnected {
                        reason: Some("Broker disconnect".to_string()),
                    })
                    .await;
            }
            Ok(_) => {}
            Err(e) => {
                // First failure before any CONNACK is reported to `start`
                if let Some(notify) = connected_tx.take() {
                    let _ = notify.send(Err(e.to_string()));
                    break;
                }

                error!("MQTT error: {}, reconnecting in {:?}", e, reconnect_delay);
                // Unacknowledged subscribes are not replayed; publishes are
                acks.subscribes.lock().fail_sent(&e.to_string());
                let _ = tx
                    .send(BusEvent::Disconnected {
                        reason: Some(e.to_string()),
                    })
                    .await;
                tokio::time::sleep(reconnect_delay).await;
            }
        }
    }

    let _ = tx.send(BusEvent::Disconnected { reason: None }).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{TopicRegistry, TopicState};
    use crate::shutdown::shutdown_channel;
    use artmq_core::LightingAddress;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Minimal MQTT 3.1.1 broker for one client.
    ///
    /// Subscriptions to topics under `denied/` get return code 0x80. QoS 1
    /// publishes are acked unless `ack_publishes` is false.
    async fn fake_broker(ack_publishes: bool) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            serve(stream, ack_publishes).await;
        });
        port
    }

    async fn serve(mut stream: TcpStream, ack_publishes: bool) {
        loop {
            let Ok(header) = stream.read_u8().await else {
                return;
            };

            let mut len = 0usize;
            let mut shift = 0;
            loop {
                let Ok(byte) = stream.read_u8().await else {
                    return;
                };
                len |= ((byte & 0x7f) as usize) << shift;
                shift += 7;
                if byte & 0x80 == 0 {
                    break;
                }
            }
            let mut body = vec![0u8; len];
            if stream.read_exact(&mut body).await.is_err() {
                return;
            }

            let reply = match header >> 4 {
                // CONNECT
                1 => vec![0x20, 0x02, 0x00, 0x00],
                // PUBLISH
                3 if (header >> 1) & 0x03 == 1 && ack_publishes => {
                    let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
                    let pkid = &body[2 + topic_len..4 + topic_len];
                    vec![0x40, 0x02, pkid[0], pkid[1]]
                }
                // SUBSCRIBE
                8 => {
                    let topic_len = u16::from_be_bytes([body[2], body[3]]) as usize;
                    let topic = &body[4..4 + topic_len];
                    let code = if topic.starts_with(b"denied/") { 0x80 } else { 0x00 };
                    vec![0x90, 0x03, body[0], body[1], code]
                }
                // PINGREQ
                12 => vec![0xd0, 0x00],
                // DISCONNECT
                14 => return,
                _ => continue,
            };
            if stream.write_all(&reply).await.is_err() {
                return;
            }
        }
    }

    fn local_config(port: u16, qos: u8) -> MqttBusConfig {
        MqttBusConfig {
            broker_host: "127.0.0.1".to_string(),
            broker_port: port,
            qos,
            connect_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_millis(500),
            ..Default::default()
        }
    }

    #[test]
    fn test_config_default() {
        let config = MqttBusConfig::default();
        assert_eq!(config.broker_host, "localhost");
        assert_eq!(config.broker_port, 1883);
        assert_eq!(config.qos, 0);
        assert_eq!(config.keep_alive_secs, 30);
        assert!(!config.clean_session);
        assert!(config.client_id.starts_with("artnet2mqtt-"));
        assert_eq!(config.client_id.len(), "artnet2mqtt-".len() + 8);
    }

    #[test]
    fn test_parse_qos() {
        assert_eq!(MqttBus::parse_qos(0), MqttQoS::AtMostOnce);
        assert_eq!(MqttBus::parse_qos(1), MqttQoS::AtLeastOnce);
        assert_eq!(MqttBus::parse_qos(2), MqttQoS::ExactlyOnce);
        assert_eq!(MqttBus::parse_qos(7), MqttQoS::ExactlyOnce);
    }

    #[tokio::test]
    async fn test_requests_fail_before_start() {
        let bus = MqttBus::new(MqttBusConfig::default());
        assert!(!bus.is_running());
        assert!(matches!(
            bus.publish("artnet/x.0", vec![]).await,
            Err(BridgeError::ConnectionFailed(_))
        ));
        assert!(matches!(
            bus.subscribe("artnet/x.0").await,
            Err(BridgeError::ConnectionFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_start_fails_without_broker() {
        let config = MqttBusConfig {
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1,
            connect_timeout: Duration::from_secs(5),
            ..Default::default()
        };
        let bus = MqttBus::new(config);

        assert!(bus.start().await.is_err());
        assert!(!bus.is_running());
    }

    #[tokio::test]
    async fn test_subscribe_waits_for_suback() {
        let port = fake_broker(true).await;
        let bus = MqttBus::new(local_config(port, 0));
        let _events = bus.start().await.unwrap();

        bus.subscribe("artnet/dimmer.3").await.unwrap();
        match bus.subscribe("denied/dimmer.3").await {
            Err(BridgeError::Subscribe(msg)) => assert!(msg.contains("rejected")),
            other => panic!("expected rejected subscribe, got {:?}", other),
        }
        bus.subscribe("artnet/dimmer.4").await.unwrap();

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_subscription_fails_topic() {
        let port = fake_broker(true).await;
        let bus = Arc::new(MqttBus::new(local_config(port, 0)));
        let _events = bus.start().await.unwrap();

        let (_trigger, shutdown) = shutdown_channel();
        let registry = TopicRegistry::new(bus.clone(), b"[]".to_vec(), shutdown);
        assert!(registry.ensure_topic("denied/dimmer.3", LightingAddress::new(0, 3)));

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while registry.state("denied/dimmer.3") != TopicState::Failed {
            assert!(tokio::time::Instant::now() < deadline, "topic never failed");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(registry.lookup("denied/dimmer.3").is_none());

        bus.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_qos1_publish_waits_for_puback() {
        let port = fake_broker(true).await;
        let bus = MqttBus::new(local_config(port, 1));
        let _events = bus.start().await.unwrap();
        bus.publish("artnet/dimmer.3", b"[]".to_vec()).await.unwrap();
        bus.publish("artnet/dimmer.4", b"[]".to_vec()).await.unwrap();
        bus.stop().await.unwrap();

        let port = fake_broker(false).await;
        let bus = MqttBus::new(local_config(port, 1));
        let _events = bus.start().await.unwrap();
        assert!(matches!(
            bus.publish("artnet/dimmer.3", b"[]".to_vec()).await,
            Err(BridgeError::Publish(_))
        ));
        bus.stop().await.unwrap();
    }
}
