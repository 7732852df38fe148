//! Radio packet types and framing
//!
//! Both nodes exchange one fixed-size datagram type over the peer-to-peer
//! radio link. There is no framing beyond the transport's own datagram
//! boundaries and no checksum beyond whatever the link provides.
//!
//! ## Packet Structure
//!
//! ```text
//! ┌────────────┬─────────────┬──────────────┬─────────────────┐
//! │ Device (1B)│ Channel (1B)│ Value (4B)   │ Sequence (4B)   │
//! │   u8       │   u8        │ f32 LE       │ u32 LE          │
//! └────────────┴─────────────┴──────────────┴─────────────────┘
//! ```
//!
//! Receivers ignore datagrams of any other length.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Identifier of the node that sent a packet.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(u8);

impl DeviceId {
    /// The plant (bridge/simulator) node
    pub const PLANT: DeviceId = DeviceId(0);

    /// The controller node
    pub const CONTROLLER: DeviceId = DeviceId(1);

    /// Create a device id from its raw byte
    pub const fn new(raw: u8) -> Self {
        DeviceId(raw)
    }

    /// Get the raw byte
    pub const fn as_u8(&self) -> u8 {
        self.0
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({})", self.0)
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            DeviceId::PLANT => write!(f, "plant"),
            DeviceId::CONTROLLER => write!(f, "controller"),
            DeviceId(other) => write!(f, "device-{}", other),
        }
    }
}

/// Identifier of the signal a packet carries.
///
/// Channel 1 carries the temperature when sent by the plant and the heater
/// command when sent by the controller.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(u8);

impl ChannelId {
    /// Reserved, never sent
    pub const NONE: ChannelId = ChannelId(0);

    /// Temperature sensor (from the plant) or heater command (from the controller)
    pub const THERMAL: ChannelId = ChannelId(1);

    /// Create a channel id from its raw byte
    pub const fn new(raw: u8) -> Self {
        ChannelId(raw)
    }

    /// Get the raw byte
    pub const fn as_u8(&self) -> u8 {
        self.0
    }
}

impl fmt::Debug for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelId({})", self.0)
    }
}

/// Errors decoding a radio packet
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// Datagram length differs from [`RadioPacket::SIZE`]
    #[error("invalid packet length {0} (expected 10)")]
    InvalidLength(usize),
}

/// A decoded radio datagram.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RadioPacket {
    /// Sending node
    pub device_id: DeviceId,
    /// Signal carried
    pub channel_id: ChannelId,
    /// Scalar payload
    pub value: f32,
    /// Monotonically increasing per sender, used to count drops
    pub sequence: u32,
}

impl RadioPacket {
    /// Wire size in bytes
    pub const SIZE: usize = 10;

    /// Create a new packet
    pub fn new(device_id: DeviceId, channel_id: ChannelId, value: f32, sequence: u32) -> Self {
        Self {
            device_id,
            channel_id,
            value,
            sequence,
        }
    }

    /// Serialize to the fixed little-endian wire layout
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0] = self.device_id.as_u8();
        bytes[1] = self.channel_id.as_u8();
        bytes[2..6].copy_from_slice(&self.value.to_le_bytes());
        bytes[6..10].copy_from_slice(&self.sequence.to_le_bytes());
        bytes
    }

    /// Deserialize from a received datagram
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PacketError> {
        let bytes: &[u8; Self::SIZE] = bytes
            .try_into()
            .map_err(|_| PacketError::InvalidLength(bytes.len()))?;

        Ok(Self {
            device_id: DeviceId::new(bytes[0]),
            channel_id: ChannelId::new(bytes[1]),
            value: f32::from_le_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]),
            sequence: u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]),
        })
    }

    /// Check whether this packet came from `device` on `channel`
    pub fn is_from(&self, device: DeviceId, channel: ChannelId) -> bool {
        self.device_id == device && self.channel_id == channel
    }
}

/// Tracks the sequence numbers of one sender to count lost datagrams.
///
/// Loss is expected on the radio link; gaps are statistics, never errors.
#[derive(Debug, Clone, Default)]
pub struct SequenceTracker {
    last: Option<u32>,
    received: u64,
    dropped: u64,
    reordered: u64,
}

impl SequenceTracker {
    /// Create an empty tracker
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted packet's sequence number
    pub fn observe(&mut self, sequence: u32) {
        self.received += 1;
        match self.last {
            Some(last) if sequence > last => {
                self.dropped += u64::from(sequence - last - 1);
                self.last = Some(sequence);
            }
            Some(_) => {
                // Sender restarted or the link reordered datagrams
                self.reordered += 1;
                self.last = Some(sequence);
            }
            None => self.last = Some(sequence),
        }
    }

    /// Last sequence number seen
    pub fn last(&self) -> Option<u32> {
        self.last
    }

    /// Packets accepted so far
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Packets inferred lost from sequence gaps
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Packets that did not advance the sequence
    pub fn reordered(&self) -> u64 {
        self.reordered
    }
}
