//! Node identity and the counters reported on the reserved monitor points.

use portable_atomic::{AtomicU16, AtomicU32, AtomicU8, Ordering};

use crate::config::NodeConfig;
use crate::message::RCA_MAX;

/// Width of the identifier window owned by each node.
pub const NODE_SPACING: u32 = 0x40000;

pub const MAX_NODE_ADDRESS: u8 = 0x3F;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Revision {
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl Revision {
    pub const fn new(major: u8, minor: u8, patch: u8) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    pub const fn to_bytes(self) -> [u8; 3] {
        [self.major, self.minor, self.patch]
    }
}

/// Last error reported through the error status monitor point.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SlaveError {
    #[default]
    None = 0x00,
    DuplicateAddress = 0x01,
    NoSensor = 0x02,
    NoSerialNumber = 0x03,
    OneWireCrc = 0x04,
}

impl SlaveError {
    pub const fn code(self) -> u8 {
        self as u8
    }

    pub const fn from_code(code: u8) -> Self {
        match code {
            0x01 => SlaveError::DuplicateAddress,
            0x02 => SlaveError::NoSensor,
            0x03 => SlaveError::NoSerialNumber,
            0x04 => SlaveError::OneWireCrc,
            _ => SlaveError::None,
        }
    }
}

pub struct NodeIdentity {
    node_address: u8,
    base_address: u32,
    serial_number: [u8; 8],
    protocol_revision: Revision,
    software_revision: Revision,
    error_count: AtomicU16,
    last_error: AtomicU8,
    transaction_count: AtomicU32,
}

impl NodeIdentity {
    pub fn new(config: &NodeConfig, serial_number: [u8; 8]) -> Self {
        let node_address = config.node_address & MAX_NODE_ADDRESS;
        Self {
            node_address,
            base_address: (node_address as u32 + 1) * NODE_SPACING,
            serial_number,
            protocol_revision: config.protocol_revision,
            software_revision: config.software_revision,
            error_count: AtomicU16::new(0),
            last_error: AtomicU8::new(SlaveError::None.code()),
            transaction_count: AtomicU32::new(0),
        }
    }

    pub fn node_address(&self) -> u8 {
        self.node_address
    }

    pub fn base_address(&self) -> u32 {
        self.base_address
    }

    pub fn serial_number(&self) -> &[u8; 8] {
        &self.serial_number
    }

    pub fn protocol_revision(&self) -> Revision {
        self.protocol_revision
    }

    pub fn software_revision(&self) -> Revision {
        self.software_revision
    }

    /// Maps an absolute identifier into this node's window.
    pub fn relative_address(&self, id: u32) -> Option<u32> {
        id.checked_sub(self.base_address)
            .filter(|rca| *rca <= RCA_MAX)
    }

    pub fn absolute_id(&self, rca: u32) -> u32 {
        self.base_address.wrapping_add(rca)
    }

    pub fn error_count(&self) -> u16 {
        self.error_count.load(Ordering::Relaxed)
    }

    /// Wraps at `u16::MAX`.
    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_error(&self) -> SlaveError {
        SlaveError::from_code(self.last_error.load(Ordering::Relaxed))
    }

    pub fn set_last_error(&self, error: SlaveError) {
        self.last_error.store(error.code(), Ordering::Relaxed);
    }

    pub fn transaction_count(&self) -> u32 {
        self.transaction_count.load(Ordering::Relaxed)
    }

    pub fn record_transaction(&self) {
        self.transaction_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SERIAL: [u8; 8] = [0x10, 0x2A, 0x3B, 0x4C, 0x5D, 0x6E, 0x7F, 0x80];

    #[test]
    fn base_address_from_node_address() {
        let identity = NodeIdentity::new(&NodeConfig::new(0), SERIAL);
        assert_eq!(identity.base_address(), 0x40000);

        let identity = NodeIdentity::new(&NodeConfig::new(0x13), SERIAL);
        assert_eq!(identity.base_address(), 0x14 * NODE_SPACING);

        // switch has six positions
        let identity = NodeIdentity::new(&NodeConfig::new(0xC1), SERIAL);
        assert_eq!(identity.node_address(), 0x01);
    }

    #[test]
    fn relative_address_window() {
        let identity = NodeIdentity::new(&NodeConfig::new(2), SERIAL);
        let base = identity.base_address();
        assert_eq!(identity.relative_address(base), Some(0));
        assert_eq!(identity.relative_address(base + RCA_MAX), Some(RCA_MAX));
        assert_eq!(identity.relative_address(base + RCA_MAX + 1), None);
        assert_eq!(identity.relative_address(base - 1), None);
        assert_eq!(identity.absolute_id(0x30000), base + 0x30000);
    }

    #[test]
    fn error_count_wraps() {
        let identity = NodeIdentity::new(&NodeConfig::default(), SERIAL);
        for _ in 0..u16::MAX {
            identity.record_error();
        }
        assert_eq!(identity.error_count(), u16::MAX);
        identity.record_error();
        assert_eq!(identity.error_count(), 0);
    }

    #[test]
    fn last_error_codes() {
        let identity = NodeIdentity::new(&NodeConfig::default(), SERIAL);
        assert_eq!(identity.last_error(), SlaveError::None);
        identity.set_last_error(SlaveError::OneWireCrc);
        assert_eq!(identity.last_error(), SlaveError::OneWireCrc);
        assert_eq!(identity.last_error().code(), 0x04);
    }
}
