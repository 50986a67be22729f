//! Universe number <-> Art-Net address mapping
//!
//! A universe number is the 15-bit Art-Net port address stored in a `u16`:
//! ```text
//!   high byte        low byte
//! [ net (0..127) ] [ sub-net << 4 | universe ]
//! ```
//! The split is plain big-endian, so every `u16` has exactly one address.

use std::fmt;

/// Wire-level address of a universe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct LightingAddress {
    /// High byte of the universe number
    pub net: u8,
    /// Low byte of the universe number (sub-net nibble + universe nibble)
    pub sub_universe: u8,
}

impl LightingAddress {
    pub fn new(net: u8, sub_universe: u8) -> Self {
        Self { net, sub_universe }
    }

    /// Build an address from the switch values reported by a node
    pub fn from_switches(net: u8, sub_net: u8, universe: u8) -> Self {
        Self {
            net: net & 0x7f,
            sub_universe: ((sub_net & 0x0f) << 4) | (universe & 0x0f),
        }
    }

    /// Sub-net nibble
    pub fn sub_net(self) -> u8 {
        self.sub_universe >> 4
    }

    /// Universe nibble
    pub fn universe(self) -> u8 {
        self.sub_universe & 0x0f
    }

    /// Universe number this address encodes
    pub fn port_address(self) -> u16 {
        from_address(self)
    }
}

/// Split a universe number into its wire address
pub fn to_address(universe: u16) -> LightingAddress {
    let [net, sub_universe] = universe.to_be_bytes();
    LightingAddress { net, sub_universe }
}

/// Join a wire address back into a universe number
pub fn from_address(address: LightingAddress) -> u16 {
    u16::from_be_bytes([address.net, address.sub_universe])
}

impl From<u16> for LightingAddress {
    fn from(universe: u16) -> Self {
        to_address(universe)
    }
}

impl From<LightingAddress> for u16 {
    fn from(address: LightingAddress) -> Self {
        from_address(address)
    }
}

impl fmt::Display for LightingAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}.{}", self.net, self.sub_net(), self.universe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_is_big_endian() {
        assert_eq!(to_address(0x0102), LightingAddress::new(1, 2));
        assert_eq!(to_address(0x0003), LightingAddress::new(0, 3));
        assert_eq!(to_address(0xff00), LightingAddress::new(0xff, 0));
    }

    #[test]
    fn test_round_trip_all_universes() {
        for u in 0..=u16::MAX {
            assert_eq!(from_address(to_address(u)), u);
        }
    }

    #[test]
    fn test_from_switches() {
        let addr = LightingAddress::from_switches(1, 2, 3);
        assert_eq!(addr.sub_universe, 0x23);
        assert_eq!(addr.port_address(), 0x0123);
        assert_eq!(addr.to_string(), "1:2.3");
    }
}
