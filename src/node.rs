//! Dispatch engine: turns controller events into handler calls and replies.
//!
//! Runs in the CAN interrupt. Frames outside this node's window never reach
//! a handler or the transaction counter. Zero-length frames are monitor requests and are
//! answered only when a handler asks for it; the reserved monitor points are
//! answered by the engine itself.

use crate::can::{BusStatus, CanController, CanEvent, Frame, LastErrorCode};
use crate::config::NodeConfig;
use crate::ds1820::{SensorError, Thermometer};
use crate::identity::{NodeIdentity, SlaveError};
use crate::message::{Direction, Message, Payload, MAX_PAYLOAD};
use crate::registry::{CallbackRegistry, Handler, Registrar, RegistryFull, Response};

/// Upper bound on controller events handled per interrupt.
pub const MAX_EVENTS_PER_INTERRUPT: usize = 16;

pub mod reserved {
    pub const PROTOCOL_REVISION: u32 = 0x30000;
    pub const ERROR_STATUS: u32 = 0x30001;
    pub const TRANSACTION_COUNT: u32 = 0x30002;
    pub const RESET_DEVICE: u32 = 0x31000;
}

/// What happened to one received frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Dispatch {
    /// Outside this node's window.
    Ignored,
    /// Dropped while a duplicate node address is latched.
    Suppressed,
    /// Answered by the engine from its own counters.
    Reserved,
    Handled { replied: bool },
    /// In the window, but no registered range matched.
    Unhandled,
    ResetRequested,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Serviced {
    pub events: usize,
    pub reset_requested: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum InitError<E> {
    /// Identity chip missing or unreadable; the node must not start.
    SerialNumber(SensorError),
    Controller(E),
    Registry,
}

impl<E> From<RegistryFull> for InitError<E> {
    fn from(_: RegistryFull) -> Self {
        InitError::Registry
    }
}

fn payload(bytes: &[u8]) -> Payload {
    bytes.iter().copied().take(MAX_PAYLOAD).collect()
}

pub struct Node<'a, const N: usize> {
    identity: NodeIdentity,
    registry: CallbackRegistry<'a, N>,
    identify_mode: bool,
    duplicate_this_cycle: bool,
}

impl<'a, const N: usize> Node<'a, N> {
    pub fn new(identity: NodeIdentity) -> Self {
        Self {
            identity,
            registry: CallbackRegistry::new(),
            identify_mode: false,
            duplicate_this_cycle: false,
        }
    }

    /// Reads the serial number, builds the identity and brings the
    /// controller onto the bus.
    pub fn boot<T: Thermometer, C: CanController>(
        config: &NodeConfig,
        sensor: &mut T,
        can: &mut C,
    ) -> Result<Self, InitError<C::Error>> {
        let serial_number = sensor.read_unique_id().map_err(|e| {
            error!("serial number unavailable: {:?}", e);
            InitError::SerialNumber(e)
        })?;
        let node = Self::new(NodeIdentity::new(config, serial_number));
        node.start(can).map_err(InitError::Controller)?;
        info!(
            "node {} on bus, window {:x}",
            node.identity.node_address(),
            node.identity.base_address()
        );
        Ok(node)
    }

    pub fn start<C: CanController>(&self, can: &mut C) -> Result<(), C::Error> {
        can.configure_filters(self.identity.base_address(), self.identity.serial_number())
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn registry(&self) -> &CallbackRegistry<'a, N> {
        &self.registry
    }

    pub fn identify_mode(&self) -> bool {
        self.identify_mode
    }

    /// Drains pending controller events, at most
    /// [`MAX_EVENTS_PER_INTERRUPT`] per call.
    pub fn service_interrupt<C: CanController>(&mut self, can: &mut C) -> Result<Serviced, C::Error> {
        let mut serviced = Serviced::default();
        while serviced.events < MAX_EVENTS_PER_INTERRUPT {
            let Some(event) = can.receive()? else {
                break;
            };
            serviced.events += 1;
            match event {
                CanEvent::Status(status) => self.on_status(status, can)?,
                CanEvent::Identify { lost } => self.on_identify(lost, can)?,
                CanEvent::Frame { frame, lost } => {
                    if self.on_frame(&frame, lost, can)? == Dispatch::ResetRequested {
                        serviced.reset_requested = true;
                    }
                }
                CanEvent::Unknown(source) => debug!("unhandled controller interrupt {}", source),
            }
        }
        Ok(serviced)
    }

    pub fn on_status<C: CanController>(&mut self, status: BusStatus, can: &mut C) -> Result<(), C::Error> {
        if status.bus_off {
            error!("bus off");
            self.identity.record_error();
        }
        if status.warning {
            warn!("bus error warning level");
            self.identity.record_error();
        }
        if status.last_error.is_error() {
            self.identity.record_error();
            if status.last_error == LastErrorCode::Bit1 && self.identify_mode {
                error!("duplicate node address {}", self.identity.node_address());
                self.identity.set_last_error(SlaveError::DuplicateAddress);
                self.duplicate_this_cycle = true;
            }
        }

        if status.tx_ok && self.identify_mode {
            self.identify_mode = false;
            can.set_status_interrupts(false)?;
            if !self.duplicate_this_cycle
                && self.identity.last_error() == SlaveError::DuplicateAddress
            {
                info!("clean identify cycle, duplicate address cleared");
                self.identity.set_last_error(SlaveError::None);
            }
        }
        Ok(())
    }

    pub fn on_identify<C: CanController>(&mut self, lost: bool, can: &mut C) -> Result<(), C::Error> {
        if lost {
            self.identity.record_error();
        }
        self.identity.record_transaction();
        self.identify_mode = true;
        self.duplicate_this_cycle = false;
        can.set_status_interrupts(true)?;
        can.send_identify()
    }

    pub fn on_frame<C: CanController>(
        &mut self,
        frame: &Frame,
        lost: bool,
        can: &mut C,
    ) -> Result<Dispatch, C::Error> {
        if lost {
            warn!("receive object overrun");
            self.identity.record_error();
        }
        if self.identity.last_error() == SlaveError::DuplicateAddress {
            return Ok(Dispatch::Suppressed);
        }
        let Some(rca) = self.identity.relative_address(frame.raw_id()) else {
            trace!("frame {:x} outside window", frame.raw_id());
            return Ok(Dispatch::Ignored);
        };

        let mut message = Message::from_payload(rca, frame.payload().clone());
        match message.direction {
            Direction::Monitor => {
                if let Some(reply) = self.reserved_monitor(rca, can)? {
                    message.data = reply;
                    self.identity.record_transaction();
                    self.transmit_reply(&message, can)?;
                    return Ok(Dispatch::Reserved);
                }
            }
            Direction::Control if rca == reserved::RESET_DEVICE => {
                warn!("device reset requested");
                self.identity.record_transaction();
                return Ok(Dispatch::ResetRequested);
            }
            Direction::Control => {}
        }

        let Some(entry) = self.registry.find(rca) else {
            trace!("no handler for {:x}", rca);
            return Ok(Dispatch::Unhandled);
        };
        let handler = entry.handler();
        self.identity.record_transaction();
        let response = handler.handle(&mut message);
        trace!("{:x} {:?} -> {:?}", rca, message.direction, response);

        if message.is_monitor() && response == Response::Reply {
            self.transmit_reply(&message, can)?;
            return Ok(Dispatch::Handled { replied: true });
        }
        Ok(Dispatch::Handled { replied: false })
    }

    fn reserved_monitor<C: CanController>(&self, rca: u32, can: &mut C) -> Result<Option<Payload>, C::Error> {
        let reply = match rca {
            reserved::PROTOCOL_REVISION => payload(&self.identity.protocol_revision().to_bytes()),
            reserved::ERROR_STATUS => {
                let [high, low] = self.identity.error_count().to_be_bytes();
                payload(&[high, low, self.identity.last_error().code(), can.status()?])
            }
            reserved::TRANSACTION_COUNT => payload(&self.identity.transaction_count().to_be_bytes()),
            _ => return Ok(None),
        };
        Ok(Some(reply))
    }

    /// Sends `message.data` as the reply from this node's window.
    pub fn transmit_reply<C: CanController>(&self, message: &Message, can: &mut C) -> Result<(), C::Error> {
        match Frame::from_raw(self.identity.absolute_id(message.rca), &message.data) {
            Some(frame) => can.transmit(&frame),
            None => {
                error!("reply for {:x} has no valid identifier", message.rca);
                Ok(())
            }
        }
    }
}

impl<'a, const N: usize> Registrar<'a> for Node<'a, N> {
    fn register(
        &mut self,
        low_address: u32,
        high_address: u32,
        handler: &'a (dyn Handler + Sync),
    ) -> Result<(), RegistryFull> {
        self.registry.register(low_address, high_address, handler)
    }

    fn unregister_last(&mut self) -> bool {
        self.registry.unregister_last().is_some()
    }
}
