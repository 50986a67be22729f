//! Art-Net transport
//!
//! Broadcasts ArtPoll on an interval, keeps a table of nodes from their
//! ArtPollReply, and unicasts ArtDmx to every node with an output port on the
//! target universe.

use artmq_core::{LightingAddress, Universe, ARTNET_PORT};
use artnet_protocol::{ArtCommand, Output, Poll};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::netif::{find_interface_ip, short_hostname, Ipv4Cidr};
use crate::node::{Node, Port};
use crate::{BridgeError, LightingTransport, Result};

/// ArtPollReply field offsets (Art-Net 4)
mod poll_reply {
    pub const ID: &[u8] = b"Art-Net\0";
    /// OpPollReply, little-endian
    pub const OP_CODE: [u8; 2] = [0x00, 0x21];
    pub const IP_ADDRESS: usize = 10;
    pub const NET_SWITCH: usize = 18;
    pub const SUB_SWITCH: usize = 19;
    pub const SHORT_NAME: std::ops::Range<usize> = 26..44;
    pub const LONG_NAME: std::ops::Range<usize> = 44..108;
    pub const NUM_PORTS_LO: usize = 173;
    pub const PORT_TYPES: usize = 174;
    pub const SW_IN: usize = 186;
    pub const SW_OUT: usize = 190;
    pub const BIND_INDEX: usize = 211;
    /// Shortest reply carrying every field above except the bind index
    pub const MIN_LEN: usize = 194;

    pub const PORT_OUTPUT: u8 = 0x80;
    pub const PORT_INPUT: u8 = 0x40;
}

/// Art-Net transport configuration
#[derive(Debug, Clone)]
pub struct ArtNetConfig {
    /// Network the Art-Net interface must be in, e.g. `192.168.6.0/24`
    pub network: Option<String>,
    /// Local address to bind
    pub bind_addr: String,
    /// Where ArtPoll is sent; defaults to the network's broadcast address
    pub poll_target: Option<String>,
    /// Fallback destination for universes no visible node outputs
    pub broadcast: Option<String>,
    /// ArtPoll interval
    pub poll_interval: Duration,
    /// Nodes silent for longer than this are forgotten
    pub node_timeout: Duration,
}

impl Default for ArtNetConfig {
    fn default() -> Self {
        Self {
            network: Some("192.168.6.0/24".to_string()),
            bind_addr: format!("0.0.0.0:{}", ARTNET_PORT),
            poll_target: None,
            broadcast: None,
            poll_interval: Duration::from_secs(3),
            node_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone)]
struct NodeEntry {
    node: Node,
    addr: SocketAddr,
    last_seen: Instant,
}

type NodeTable = Arc<DashMap<String, NodeEntry>>;

/// Art-Net controller side of the bridge
pub struct ArtNetTransport {
    config: ArtNetConfig,
    socket: Mutex<Option<Arc<UdpSocket>>>,
    nodes: NodeTable,
    sequence: AtomicU8,
    running: Arc<Mutex<bool>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ArtNetTransport {
    pub fn new(config: ArtNetConfig) -> Self {
        Self {
            config,
            socket: Mutex::new(None),
            nodes: Arc::new(DashMap::new()),
            sequence: AtomicU8::new(0),
            running: Arc::new(Mutex::new(false)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Address the socket is bound to, once started
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.socket.lock().as_ref().and_then(|s| s.local_addr().ok())
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        self.socket
            .lock()
            .clone()
            .ok_or_else(|| BridgeError::ConnectionFailed("Not connected".to_string()))
    }

    fn next_sequence(&self) -> u8 {
        // 0 means "sequencing disabled" on the wire
        (self.sequence.fetch_add(1, Ordering::Relaxed) % 255) + 1
    }

    fn parse_target(addr: &str) -> Result<SocketAddr> {
        addr.parse()
            .map_err(|e| BridgeError::Config(format!("invalid address {:?}: {}", addr, e)))
    }

    /// Resolve the Art-Net network and interface; fatal if configured but absent
    fn resolve_network(&self) -> Result<Option<Ipv4Cidr>> {
        let Some(network) = &self.config.network else {
            return Ok(None);
        };
        let cidr: Ipv4Cidr = network.parse()?;
        let ip = find_interface_ip(&cidr)?;
        let host = short_hostname().unwrap_or_else(|e| {
            warn!("{}", e);
            String::from("unknown")
        });
        info!("Using Art-Net IP {} and hostname {}", ip, host);
        Ok(Some(cidr))
    }

    /// Destinations for a universe: every node outputting it
    fn targets_for(&self, address: LightingAddress) -> Vec<SocketAddr> {
        self.nodes
            .iter()
            .filter(|entry| entry.node.outputs_to(address))
            .map(|entry| entry.addr)
            .collect()
    }

    /// Encode an ArtDmx packet for `address`
    fn encode_dmx(&self, address: LightingAddress, data: &Universe) -> Result<Vec<u8>> {
        let mut output = Output::default();
        // The 15-bit port address goes in the subnet field
        output.subnet = address.port_address();
        output.sequence = self.next_sequence();
        output.data = data.to_vec().into();
        output.length = data.len() as u16;

        ArtCommand::Output(output)
            .into_buffer()
            .map_err(|e| BridgeError::Protocol(format!("Failed to encode DMX: {:?}", e)))
    }
}

#[async_trait]
impl LightingTransport for ArtNetTransport {
    async fn start(&self) -> Result<()> {
        if *self.running.lock() {
            return Err(BridgeError::Other("Transport already running".to_string()));
        }

        let cidr = self.resolve_network()?;

        let socket = UdpSocket::bind(&self.config.bind_addr)
            .await
            .map_err(|e| {
                BridgeError::ConnectionFailed(format!("bind {}: {}", self.config.bind_addr, e))
            })?;
        socket
            .set_broadcast(true)
            .map_err(|e| BridgeError::ConnectionFailed(e.to_string()))?;

        let poll_target = match &self.config.poll_target {
            Some(addr) => Self::parse_target(addr)?,
            None => {
                let ip = cidr.map(|c| c.broadcast()).unwrap_or(Ipv4Addr::BROADCAST);
                SocketAddr::new(IpAddr::V4(ip), ARTNET_PORT)
            }
        };

        info!(
            "Art-Net transport listening on {}, polling {}",
            self.config.bind_addr, poll_target
        );

        let socket = Arc::new(socket);
        *self.socket.lock() = Some(socket.clone());
        *self.running.lock() = true;

        let receiver = tokio::spawn(receive_loop(
            socket.clone(),
            self.nodes.clone(),
            self.running.clone(),
        ));
        let poller = tokio::spawn(poll_loop(
            socket,
            self.nodes.clone(),
            poll_target,
            self.config.poll_interval,
            self.config.node_timeout,
        ));
        self.tasks.lock().extend([receiver, poller]);

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        *self.running.lock() = false;
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.socket.lock() = None;
        info!("Art-Net transport stopped");
        Ok(())
    }

    async fn send(&self, address: LightingAddress, data: &Universe) -> Result<()> {
        let socket = self.socket()?;

        let mut targets = self.targets_for(address);
        if targets.is_empty() {
            match &self.config.broadcast {
                Some(addr) => targets.push(Self::parse_target(addr)?),
                None => {
                    debug!("No node outputs {}, DMX not sent", address);
                    return Ok(());
                }
            }
        }

        let bytes = self.encode_dmx(address, data)?;
        send_to_all(&socket, &bytes, &targets).await?;
        debug!(
            "Sent DMX for {} to {} target(s) ({} bytes)",
            address,
            targets.len(),
            data.len()
        );
        Ok(())
    }

    fn visible_nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .nodes
            .iter()
            .filter(|entry| entry.last_seen.elapsed() <= self.config.node_timeout)
            .map(|entry| entry.node.clone())
            .collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        nodes
    }

    fn is_running(&self) -> bool {
        *self.running.lock()
    }
}

/// Send one packet to every target; a failed target does not stop the rest
async fn send_to_all(socket: &UdpSocket, bytes: &[u8], targets: &[SocketAddr]) -> Result<()> {
    let mut failures = Vec::new();
    for target in targets {
        if let Err(e) = socket.send_to(bytes, *target).await {
            warn!("DMX send to {} failed: {}", target, e);
            failures.push(format!("{}: {}", target, e));
        }
    }

    if failures.is_empty() {
        Ok(())
    } else {
        Err(BridgeError::Send(format!(
            "{} of {} target(s) failed: {}",
            failures.len(),
            targets.len(),
            failures.join("; ")
        )))
    }
}

async fn receive_loop(socket: Arc<UdpSocket>, nodes: NodeTable, running: Arc<Mutex<bool>>) {
    let mut buf = vec![0u8; 65536];

    while *running.lock() {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                error!("Art-Net receive error: {}", e);
                continue;
            }
        };
        let packet = &buf[..len];

        // Replies are read straight from the datagram: nodes in the field
        // send trimmed or extended variants the typed decoder rejects.
        if is_poll_reply(packet) {
            match node_from_poll_reply(packet) {
                Some(node) => {
                    if !nodes.contains_key(&node.id) {
                        info!("Art-Net node discovered: {}", node.describe());
                    }
                    nodes.insert(
                        node.id.clone(),
                        NodeEntry {
                            node,
                            addr: from,
                            last_seen: Instant::now(),
                        },
                    );
                }
                None => debug!("Short ArtPollReply from {} ({} bytes)", from, len),
            }
            continue;
        }

        match ArtCommand::from_buffer(packet) {
            Ok(ArtCommand::Poll(_)) => debug!("Received Art-Net Poll from {}", from),
            Ok(_) => {}
            Err(e) => debug!("Art-Net decode error from {}: {:?}", from, e),
        }
    }
}

async fn poll_loop(
    socket: Arc<UdpSocket>,
    nodes: NodeTable,
    target: SocketAddr,
    interval: Duration,
    node_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);

    loop {
        ticker.tick().await;

        let before = nodes.len();
        nodes.retain(|_, entry| entry.last_seen.elapsed() <= node_timeout);
        if nodes.len() < before {
            info!("{} Art-Net node(s) timed out", before - nodes.len());
        }

        let bytes = match ArtCommand::Poll(Poll::default()).into_buffer() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Failed to encode poll: {:?}", e);
                return;
            }
        };
        match socket.send_to(&bytes, target).await {
            Ok(_) => debug!("Sent Art-Net poll to {}", target),
            Err(e) => warn!("Art-Net poll to {} failed: {}", target, e),
        }
    }
}

/// `Art-Net\0` header with the OpPollReply opcode
pub fn is_poll_reply(packet: &[u8]) -> bool {
    packet.len() >= 10 && &packet[..8] == poll_reply::ID && packet[8..10] == poll_reply::OP_CODE
}

/// Build a [`Node`] from a raw ArtPollReply datagram
pub fn node_from_poll_reply(packet: &[u8]) -> Option<Node> {
    use poll_reply::*;

    if !is_poll_reply(packet) || packet.len() < MIN_LEN {
        return None;
    }
    let ip = Ipv4Addr::new(
        packet[IP_ADDRESS],
        packet[IP_ADDRESS + 1],
        packet[IP_ADDRESS + 2],
        packet[IP_ADDRESS + 3],
    );

    let text = |range: std::ops::Range<usize>| {
        let raw = &packet[range];
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        String::from_utf8_lossy(&raw[..end]).trim().to_string()
    };

    let id = match packet.get(BIND_INDEX) {
        Some(&bind) if bind > 1 => format!("{}#{}", ip, bind),
        _ => ip.to_string(),
    };

    let mut node = Node::new(id, text(SHORT_NAME));
    node.long_name = text(LONG_NAME);

    let net = packet[NET_SWITCH];
    let sub_net = packet[SUB_SWITCH];
    let num_ports = packet[NUM_PORTS_LO].min(4) as usize;

    for i in 0..num_ports {
        let port_type = packet[PORT_TYPES + i];
        if port_type & PORT_OUTPUT != 0 {
            let address = LightingAddress::from_switches(net, sub_net, packet[SW_OUT + i]);
            node.outputs.push(Port::new(i as u8, address));
        }
        if port_type & PORT_INPUT != 0 {
            let address = LightingAddress::from_switches(net, sub_net, packet[SW_IN + i]);
            node.inputs.push(Port::new(i as u8, address));
        }
    }

    Some(node)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn poll_reply_packet(name: &str, net: u8, sub_net: u8, outputs: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; 239];
        packet[0..8].copy_from_slice(b"Art-Net\0");
        packet[8] = 0x00;
        packet[9] = 0x21;
        packet[10..14].copy_from_slice(&[192, 168, 6, 20]);
        packet[14] = 0x36;
        packet[15] = 0x19;
        packet[poll_reply::NET_SWITCH] = net;
        packet[poll_reply::SUB_SWITCH] = sub_net;
        packet[26..26 + name.len()].copy_from_slice(name.as_bytes());
        packet[poll_reply::NUM_PORTS_LO] = outputs.len() as u8;
        for (i, &universe) in outputs.iter().enumerate() {
            packet[poll_reply::PORT_TYPES + i] = poll_reply::PORT_OUTPUT;
            packet[poll_reply::SW_OUT + i] = universe;
        }
        packet
    }

    #[test]
    fn test_config_default() {
        let config = ArtNetConfig::default();
        assert_eq!(config.bind_addr, "0.0.0.0:6454");
        assert_eq!(config.network.as_deref(), Some("192.168.6.0/24"));
        assert!(config.broadcast.is_none());
    }

    #[test]
    fn test_node_from_poll_reply() {
        let packet = poll_reply_packet("dimmer-rack", 0, 0, &[3, 4]);
        let node = node_from_poll_reply(&packet).unwrap();

        assert_eq!(node.id, "192.168.6.20");
        assert_eq!(node.name, "dimmer-rack");
        assert_eq!(node.outputs.len(), 2);
        assert_eq!(node.outputs[0].address, LightingAddress::new(0, 3));
        assert_eq!(node.outputs[1].address, LightingAddress::new(0, 4));
        assert!(node.inputs.is_empty());
    }

    #[test]
    fn test_poll_reply_switches_build_port_address() {
        let packet = poll_reply_packet("n", 1, 2, &[5]);
        let node = node_from_poll_reply(&packet).unwrap();
        assert_eq!(node.outputs[0].address.port_address(), 0x0125);
    }

    #[test]
    fn test_short_poll_reply_rejected() {
        let packet = poll_reply_packet("n", 0, 0, &[1]);
        assert!(is_poll_reply(&packet[..100]));
        assert!(node_from_poll_reply(&packet[..100]).is_none());

        let mut not_reply = packet.clone();
        not_reply[9] = 0x20;
        assert!(!is_poll_reply(&not_reply));
        assert!(node_from_poll_reply(&not_reply).is_none());
    }

    #[tokio::test]
    async fn test_send_to_all_continues_past_failed_target() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let unreachable: SocketAddr = "[::1]:6454".parse().unwrap();
        let targets = [unreachable, receiver.local_addr().unwrap()];

        let result = send_to_all(&socket, b"dmx", &targets).await;
        match result {
            Err(BridgeError::Send(msg)) => assert!(msg.starts_with("1 of 2")),
            other => panic!("expected send error, got {:?}", other),
        }

        let mut buf = [0u8; 16];
        let (n, _) = tokio::time::timeout(Duration::from_secs(1), receiver.recv_from(&mut buf))
            .await
            .expect("second target got nothing")
            .unwrap();
        assert_eq!(&buf[..n], b"dmx");
    }

    #[test]
    fn test_sequence_skips_zero() {
        let transport = ArtNetTransport::new(ArtNetConfig::default());
        for _ in 0..600 {
            assert_ne!(transport.next_sequence(), 0);
        }
    }
}
