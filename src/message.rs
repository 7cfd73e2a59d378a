//! Monitor and control transactions as seen by handlers and the bridge.

use heapless::Vec;

/// Largest payload carried by one classic CAN frame.
pub const MAX_PAYLOAD: usize = 8;

/// Highest relative CAN address inside one node's window.
pub const RCA_MAX: u32 = 0x3FFFF;

pub type Payload = Vec<u8, MAX_PAYLOAD>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Direction {
    /// Zero-length request; the handler fills in the reply.
    Monitor,
    /// Non-empty request carrying the value to apply.
    Control,
}

impl Direction {
    /// Direction implied by the length of a received frame.
    pub const fn from_len(len: usize) -> Self {
        if len == 0 {
            Direction::Monitor
        } else {
            Direction::Control
        }
    }
}

/// More than [`MAX_PAYLOAD`] bytes were offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PayloadTooLong;

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Message {
    pub rca: u32,
    pub data: Payload,
    pub direction: Direction,
}

impl Message {
    pub const fn monitor(rca: u32) -> Self {
        Self {
            rca,
            data: Vec::new(),
            direction: Direction::Monitor,
        }
    }

    /// Builds a message from received bytes, classifying it by length.
    pub fn new(rca: u32, data: &[u8]) -> Result<Self, PayloadTooLong> {
        let data = Vec::from_slice(data).map_err(|_| PayloadTooLong)?;
        Ok(Self::from_payload(rca, data))
    }

    pub fn from_payload(rca: u32, data: Payload) -> Self {
        Self {
            rca,
            direction: Direction::from_len(data.len()),
            data,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn is_monitor(&self) -> bool {
        self.direction == Direction::Monitor
    }

    /// Replaces the payload with a monitor reply. The direction is left alone.
    pub fn set_reply(&mut self, reply: &[u8]) -> Result<(), PayloadTooLong> {
        self.data.clear();
        self.data.extend_from_slice(reply).map_err(|_| PayloadTooLong)
    }
}
