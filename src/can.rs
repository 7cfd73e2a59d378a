//! Capability interface to the CAN controller.

use embedded_can::{ExtendedId, Id};

use crate::message::Payload;

/// Extended data frame with up to eight bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    id: ExtendedId,
    data: Payload,
}

impl Frame {
    /// Returns `None` for identifiers wider than 29 bits or oversized data.
    pub fn from_raw(id: u32, data: &[u8]) -> Option<Self> {
        let id = ExtendedId::new(id)?;
        let data = Payload::from_slice(data).ok()?;
        Some(Self { id, data })
    }

    pub fn raw_id(&self) -> u32 {
        self.id.as_raw()
    }

    pub fn payload(&self) -> &Payload {
        &self.data
    }
}

impl embedded_can::Frame for Frame {
    fn new(id: impl Into<Id>, data: &[u8]) -> Option<Self> {
        match id.into() {
            Id::Extended(id) => Frame::from_raw(id.as_raw(), data),
            Id::Standard(_) => None,
        }
    }

    fn new_remote(_id: impl Into<Id>, _dlc: usize) -> Option<Self> {
        None
    }

    fn is_extended(&self) -> bool {
        true
    }

    fn is_remote_frame(&self) -> bool {
        false
    }

    fn id(&self) -> Id {
        Id::Extended(self.id)
    }

    fn dlc(&self) -> usize {
        self.data.len()
    }

    fn data(&self) -> &[u8] {
        &self.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum LastErrorCode {
    #[default]
    None,
    Stuff,
    Form,
    Ack,
    /// Sent recessive, read back dominant. During identify this means
    /// another node answered with the same identifier.
    Bit1,
    Bit0,
    Crc,
    /// Written by the CPU to detect later updates.
    Unused,
}

impl LastErrorCode {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x07 {
            0 => LastErrorCode::None,
            1 => LastErrorCode::Stuff,
            2 => LastErrorCode::Form,
            3 => LastErrorCode::Ack,
            4 => LastErrorCode::Bit1,
            5 => LastErrorCode::Bit0,
            6 => LastErrorCode::Crc,
            _ => LastErrorCode::Unused,
        }
    }

    pub const fn is_error(self) -> bool {
        !matches!(self, LastErrorCode::None | LastErrorCode::Unused)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct BusStatus {
    pub bus_off: bool,
    pub warning: bool,
    pub tx_ok: bool,
    pub rx_ok: bool,
    pub last_error: LastErrorCode,
}

impl BusStatus {
    pub const BUS_OFF: u8 = 0x80;
    pub const WARNING: u8 = 0x40;
    pub const RX_OK: u8 = 0x10;
    pub const TX_OK: u8 = 0x08;
    pub const LAST_ERROR: u8 = 0x07;

    pub const fn from_register(status: u8) -> Self {
        Self {
            bus_off: status & Self::BUS_OFF != 0,
            warning: status & Self::WARNING != 0,
            tx_ok: status & Self::TX_OK != 0,
            rx_ok: status & Self::RX_OK != 0,
            last_error: LastErrorCode::from_bits(status & Self::LAST_ERROR),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CanEvent {
    Status(BusStatus),
    /// Frame from this node's monitor and control window. `lost` is set when
    /// the controller overwrote an unread frame.
    Frame { frame: Frame, lost: bool },
    /// Broadcast identify request.
    Identify { lost: bool },
    /// Interrupt source the node does not use.
    Unknown(u8),
}

/// What the dispatch engine needs from a CAN controller.
pub trait CanController {
    type Error: core::fmt::Debug;

    /// Full controller bring-up: bit timing, the identify objects carrying
    /// `serial_number`, and the receive filter for the window at
    /// `base_address`. Leaves the controller on the bus.
    fn configure_filters(
        &mut self,
        base_address: u32,
        serial_number: &[u8; 8],
    ) -> Result<(), Self::Error>;

    /// Pops the next pending event, `None` once the controller is idle.
    fn receive(&mut self) -> Result<Option<CanEvent>, Self::Error>;

    fn transmit(&mut self, frame: &Frame) -> Result<(), Self::Error>;

    /// Queues the serial number reply to an identify broadcast.
    fn send_identify(&mut self) -> Result<(), Self::Error>;

    fn set_status_interrupts(&mut self, enabled: bool) -> Result<(), Self::Error>;

    /// Raw status register, reported on the error status monitor point.
    fn status(&mut self) -> Result<u8, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MAX_PAYLOAD;

    #[test]
    fn frame_limits() {
        assert!(Frame::from_raw(0x1FFF_FFFF, &[0; MAX_PAYLOAD]).is_some());
        assert!(Frame::from_raw(0x2000_0000, &[]).is_none());
        assert!(Frame::from_raw(0x40000, &[0; MAX_PAYLOAD + 1]).is_none());
    }

    #[test]
    fn embedded_can_frame() {
        use embedded_can::{Frame as _, StandardId};

        let id = ExtendedId::new(0x70001).unwrap();
        let frame = <Frame as embedded_can::Frame>::new(id, &[1, 2]).unwrap();
        assert_eq!(frame.id(), Id::Extended(id));
        assert_eq!(frame.dlc(), 2);
        assert!(frame.is_extended());

        let standard = StandardId::new(0x123).unwrap();
        assert!(<Frame as embedded_can::Frame>::new(standard, &[]).is_none());
    }

    #[test]
    fn status_register_decode() {
        let status = BusStatus::from_register(0xCC);
        assert!(status.bus_off);
        assert!(status.warning);
        assert!(status.tx_ok);
        assert!(!status.rx_ok);
        assert_eq!(status.last_error, LastErrorCode::Bit1);
        assert!(status.last_error.is_error());
        assert!(!LastErrorCode::from_bits(7).is_error());
    }
}
