//! MQTT payload encoding
//!
//! Payloads are JSON arrays of `{"Channel": u16, "Value": u8}` records.
//! Decoding is all-or-nothing: one bad record rejects the whole payload.

use crate::{Channel, ChannelValue, DmxCommand, Error, Payload, Result, UNIVERSE_SIZE};

/// Parse a payload into commands
pub fn decode_payload(bytes: &[u8]) -> Result<Payload> {
    serde_json::from_slice(bytes).map_err(|e| Error::DecodeError(e.to_string()))
}

/// Serialize commands into a payload
pub fn encode_payload(commands: &[DmxCommand]) -> Result<Vec<u8>> {
    serde_json::to_vec(commands).map_err(|e| Error::EncodeError(e.to_string()))
}

/// Payload announcing a topic: channels `0..count` all at zero
pub fn default_payload(count: u16) -> Result<Vec<u8>> {
    if count as usize > UNIVERSE_SIZE {
        return Err(Error::InvalidChannelCount(count));
    }

    let commands = (0..count)
        .map(|i| Channel::new(i).map(|channel| DmxCommand::new(channel, 0)))
        .collect::<Result<Vec<_>>>()?;

    encode_payload(&commands)
}

/// Decode a payload and bind every command to `universe`
pub fn decode_channel_values(universe: u16, bytes: &[u8]) -> Result<Vec<ChannelValue>> {
    Ok(decode_payload(bytes)?
        .into_iter()
        .map(|cmd| cmd.to_channel_value(universe))
        .collect())
}
