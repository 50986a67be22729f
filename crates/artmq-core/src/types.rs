//! DMX types and the MQTT command payload

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::{Error, Result, UNIVERSE_SIZE};

/// Channel values of one DMX universe, indexed by channel number
pub type Universe = [u8; UNIVERSE_SIZE];

/// A channel index within a universe, always in 0..=511.
///
/// Out-of-range indices are rejected at construction rather than clamped,
/// so a [`ChannelValue`] can never address outside its universe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub struct Channel(u16);

impl Channel {
    /// Highest valid channel index
    pub const MAX: u16 = (UNIVERSE_SIZE - 1) as u16;

    /// Create a channel, failing if `index` is not in 0..=511
    pub fn new(index: u16) -> Result<Self> {
        if index <= Self::MAX {
            Ok(Self(index))
        } else {
            Err(Error::InvalidChannel(index))
        }
    }

    /// Raw channel number
    pub fn get(self) -> u16 {
        self.0
    }

    /// Position of this channel in a [`Universe`]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<u16> for Channel {
    type Error = Error;

    fn try_from(index: u16) -> Result<Self> {
        Self::new(index)
    }
}

impl From<Channel> for u16 {
    fn from(channel: Channel) -> Self {
        channel.0
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single channel update within a universe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelValue {
    /// Universe number (high byte = net, low byte = sub-universe)
    pub universe: u16,
    /// Channel within the universe
    pub channel: Channel,
    /// DMX level
    pub value: u8,
}

impl ChannelValue {
    pub fn new(universe: u16, channel: Channel, value: u8) -> Self {
        Self {
            universe,
            channel,
            value,
        }
    }
}

/// One record of an MQTT command payload: `{"Channel": 5, "Value": 200}`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmxCommand {
    #[serde(rename = "Channel", alias = "channel")]
    pub channel: Channel,
    #[serde(rename = "Value", alias = "value")]
    pub value: u8,
}

impl DmxCommand {
    pub fn new(channel: Channel, value: u8) -> Self {
        Self { channel, value }
    }

    /// Bind this command to a universe
    pub fn to_channel_value(self, universe: u16) -> ChannelValue {
        ChannelValue::new(universe, self.channel, self.value)
    }
}

/// Ordered list of commands carried by one MQTT message
pub type Payload = Vec<DmxCommand>;
