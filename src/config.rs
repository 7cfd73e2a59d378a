//! Protocol constants and runtime configuration.

use crate::identity::Revision;

/// Handshake countdown loaded at the start of every bridge phase.
pub const MAX_TIMEOUT: u16 = 500;

/// Depth of the transaction queue between the CAN interrupt and the bridge.
pub const CMD_QUEUE_SIZE: usize = 32;

/// Callback registry capacity: the four fixed bridge points, four learned
/// ranges and one spare.
pub const CALLBACK_CAPACITY: usize = 9;

pub const PROTOCOL_REVISION: Revision = Revision::new(1, 1, 1);
pub const SOFTWARE_REVISION: Revision = Revision::new(1, 3, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NodeConfig {
    /// Board switch value. Only the low six bits are used.
    pub node_address: u8,
    pub protocol_revision: Revision,
    pub software_revision: Revision,
}

impl NodeConfig {
    pub const fn new(node_address: u8) -> Self {
        Self {
            node_address,
            protocol_revision: PROTOCOL_REVISION,
            software_revision: SOFTWARE_REVISION,
        }
    }
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::new(0)
    }
}

/// How monitor replies are collected from the downstream device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BridgeMode {
    /// Spin on the handshake line until the whole reply is in.
    Blocking,
    /// Send the request, then consume one reply byte per handshake edge.
    EdgeTriggered,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BridgeConfig {
    pub max_timeout: u16,
    /// Extra attempts after a failed monitor exchange.
    pub monitor_retries: u8,
    pub mode: BridgeMode,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            max_timeout: MAX_TIMEOUT,
            monitor_retries: 1,
            mode: BridgeMode::EdgeTriggered,
        }
    }
}

/// Bit timing registers of the 82527-style controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ControllerConfig {
    pub btr0: u8,
    pub btr1: u8,
}

impl Default for ControllerConfig {
    // 1 Mbit/s from a 16 MHz controller clock
    fn default() -> Self {
        Self {
            btr0: 0x40,
            btr1: 0x23,
        }
    }
}
