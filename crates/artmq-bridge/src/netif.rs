//! Local interface lookup for the Art-Net network

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use tracing::debug;

use crate::{BridgeError, Result};

/// An IPv4 network in CIDR notation, e.g. `192.168.6.0/24`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4Cidr {
    network: Ipv4Addr,
    prefix: u8,
}

impl Ipv4Cidr {
    pub fn new(address: Ipv4Addr, prefix: u8) -> Result<Self> {
        if prefix > 32 {
            return Err(BridgeError::Config(format!("invalid prefix length: {}", prefix)));
        }
        Ok(Self {
            network: Ipv4Addr::from(u32::from(address) & Self::mask_bits(prefix)),
            prefix,
        })
    }

    fn mask_bits(prefix: u8) -> u32 {
        match prefix {
            0 => 0,
            p => u32::MAX << (32 - p as u32),
        }
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_bits(self.prefix) == u32::from(self.network)
    }

    /// Directed broadcast address of the network
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.network) | !Self::mask_bits(self.prefix))
    }
}

impl FromStr for Ipv4Cidr {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| BridgeError::Config(format!("expected a.b.c.d/n, got {:?}", s)))?;
        let addr: Ipv4Addr = addr
            .trim()
            .parse()
            .map_err(|e| BridgeError::Config(format!("invalid network address {:?}: {}", s, e)))?;
        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|e| BridgeError::Config(format!("invalid prefix length {:?}: {}", s, e)))?;
        Self::new(addr, prefix)
    }
}

impl fmt::Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.network, self.prefix)
    }
}

/// First local IPv4 address inside `network`
pub fn find_interface_ip(network: &Ipv4Cidr) -> Result<Ipv4Addr> {
    let interfaces = local_ip_address::list_afinet_netifas()
        .map_err(|e| BridgeError::ConnectionFailed(format!("error getting ips: {}", e)))?;

    pick_address(network, interfaces).ok_or_else(|| {
        BridgeError::ConnectionFailed(format!(
            "no local interface found in Art-Net network {}",
            network
        ))
    })
}

fn pick_address(
    network: &Ipv4Cidr,
    interfaces: impl IntoIterator<Item = (String, IpAddr)>,
) -> Option<Ipv4Addr> {
    interfaces.into_iter().find_map(|(name, ip)| match ip {
        IpAddr::V4(v4) if network.contains(v4) => {
            debug!("Interface {} ({}) is inside {}", name, v4, network);
            Some(v4)
        }
        _ => None,
    })
}

/// Short lower-case host name (`stage-pc` for `Stage-PC.local`)
pub fn short_hostname() -> Result<String> {
    let host = hostname::get()
        .map_err(|e| BridgeError::ConnectionFailed(format!("failed to resolve hostname: {}", e)))?;
    let host = host.to_string_lossy();
    Ok(host.split('.').next().unwrap_or_default().to_lowercase())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse_and_contains() {
        let net: Ipv4Cidr = "192.168.6.0/24".parse().unwrap();
        assert!(net.contains(Ipv4Addr::new(192, 168, 6, 42)));
        assert!(!net.contains(Ipv4Addr::new(192, 168, 7, 1)));
        assert_eq!(net.broadcast(), Ipv4Addr::new(192, 168, 6, 255));
        assert_eq!(net.to_string(), "192.168.6.0/24");

        let host_bits: Ipv4Cidr = "10.1.2.3/8".parse().unwrap();
        assert_eq!(host_bits.to_string(), "10.0.0.0/8");

        let any: Ipv4Cidr = "0.0.0.0/0".parse().unwrap();
        assert!(any.contains(Ipv4Addr::new(8, 8, 8, 8)));
    }

    #[test]
    fn test_cidr_rejects_garbage() {
        assert!("192.168.6.0".parse::<Ipv4Cidr>().is_err());
        assert!("192.168.6.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("nope/24".parse::<Ipv4Cidr>().is_err());
    }

    #[test]
    fn test_pick_address_skips_ipv6_and_other_networks() {
        let net: Ipv4Cidr = "192.168.6.0/24".parse().unwrap();
        let interfaces = vec![
            ("lo".to_string(), IpAddr::V4(Ipv4Addr::LOCALHOST)),
            ("eth0".to_string(), "fe80::1".parse().unwrap()),
            ("eth1".to_string(), IpAddr::V4(Ipv4Addr::new(192, 168, 6, 7))),
        ];
        assert_eq!(
            pick_address(&net, interfaces),
            Some(Ipv4Addr::new(192, 168, 6, 7))
        );
        assert_eq!(pick_address(&net, Vec::new()), None);
    }
}
