//! Intel 82527 compatible CAN controller driver.
//!
//! The same register programming serves the SPI attached stand-alone part
//! and memory-mapped on-chip variants; only [`RegisterAccess`] differs.

use core::convert::Infallible;

use embedded_hal::spi::SpiDevice;

use crate::can::{BusStatus, CanController, CanEvent, Frame};
use crate::config::ControllerConfig;
use crate::message::MAX_PAYLOAD;

/// Byte-wide access to the controller register file.
pub trait RegisterAccess {
    type Error: core::fmt::Debug;

    fn read(&mut self, address: u8) -> Result<u8, Self::Error>;
    fn write(&mut self, address: u8, value: u8) -> Result<(), Self::Error>;
}

const SPI_READ: u8 = 0x01;
const SPI_WRITE: u8 = 0x81;

/// Controller behind an SPI device: three byte transfers
/// `[address, command, data]`.
pub struct SpiRegisters<SPI> {
    spi: SPI,
}

impl<SPI> SpiRegisters<SPI> {
    pub fn new(spi: SPI) -> Self {
        Self { spi }
    }

    pub fn release(self) -> SPI {
        self.spi
    }
}

impl<SPI: SpiDevice> RegisterAccess for SpiRegisters<SPI> {
    type Error = SPI::Error;

    fn read(&mut self, address: u8) -> Result<u8, Self::Error> {
        let mut buf = [address, SPI_READ, 0x00];
        self.spi.transfer_in_place(&mut buf)?;
        Ok(buf[2])
    }

    fn write(&mut self, address: u8, value: u8) -> Result<(), Self::Error> {
        self.spi.write(&[address, SPI_WRITE, value])
    }
}

/// Controller mapped into the CPU address space.
pub struct MmioRegisters {
    base: *mut u8,
}

// SAFETY: the register block is only reached through `&mut self`.
unsafe impl Send for MmioRegisters {}

impl MmioRegisters {
    /// # Safety
    ///
    /// `base` must point at the controller register block, valid for
    /// volatile byte access over 256 bytes, and nothing else may access it.
    pub const unsafe fn new(base: *mut u8) -> Self {
        Self { base }
    }
}

impl RegisterAccess for MmioRegisters {
    type Error = Infallible;

    fn read(&mut self, address: u8) -> Result<u8, Self::Error> {
        // SAFETY: address stays within the 256 byte block promised by `new`.
        Ok(unsafe { core::ptr::read_volatile(self.base.add(address as usize)) })
    }

    fn write(&mut self, address: u8, value: u8) -> Result<(), Self::Error> {
        // SAFETY: as above.
        unsafe { core::ptr::write_volatile(self.base.add(address as usize), value) };
        Ok(())
    }
}

pub mod reg {
    pub const CONTROL: u8 = 0x00;
    pub const STATUS: u8 = 0x01;
    pub const CPU_INTERFACE: u8 = 0x02;
    pub const GLOBAL_MASK_STANDARD: u8 = 0x06;
    pub const GLOBAL_MASK_EXTENDED: u8 = 0x08;
    pub const MASK_LAST_MESSAGE: u8 = 0x0C;
    pub const BUS_CONFIG: u8 = 0x2F;
    pub const BIT_TIMING_0: u8 = 0x3F;
    pub const BIT_TIMING_1: u8 = 0x4F;
    pub const INTERRUPT: u8 = 0x5F;

    // message object layout, relative to `object(n)`
    pub const CTL0: u8 = 0x00;
    pub const CTL1: u8 = 0x01;
    pub const ARB: u8 = 0x02;
    pub const CONFIG: u8 = 0x06;
    pub const DATA: u8 = 0x07;

    pub const fn object(n: u8) -> u8 {
        n << 4
    }
}

// Control register values
const CONTROL_INIT: u8 = 0x41;
const CONTROL_RUN: u8 = 0x0A;
const CONTROL_RUN_STATUS: u8 = 0x0E;

// Message object control bytes. Each two-bit field: 10 set, 01 reset,
// 11 unchanged.
const CTL0_RESET_INTPND: u8 = 0xFD;
const CTL0_VALID_RX: u8 = 0x99;
const CTL0_VALID_QUIET: u8 = 0x95;
const CTL0_INVALID: u8 = 0x55;
const CTL0_CLEAR_VALID: u8 = 0x7F;
const CTL0_SET_VALID: u8 = 0xBF;
const CTL1_RESET_ALL: u8 = 0x55;
const CTL1_RESET_UPDATE_FLAGS: u8 = 0x56;
const CTL1_RESET_MSGLST: u8 = 0xF7;
const CTL1_RELEASE_BUFFER: u8 = 0x7D;
const CTL1_RESET_NEWDAT: u8 = 0xFD;
const CTL1_SET_CPUUPD: u8 = 0xFB;
const CTL1_NEWDAT_READY: u8 = 0xF6;
const CTL1_TRANSMIT: u8 = 0xE7;

const MSGLST_MASK: u8 = 0x0C;
const MSGLST_SET: u8 = 0x08;
const NEWDAT_MASK: u8 = 0x03;
const NEWDAT_SET: u8 = 0x02;

// Message configuration: extended identifier, transmit direction
const CONFIG_EXTENDED: u8 = 0x04;
const CONFIG_TRANSMIT: u8 = 0x08;

// Interrupt register values
const INT_STATUS: u8 = 0x01;
const INT_OBJECT_15: u8 = 0x02;
const INT_OBJECT_1: u8 = 0x03;

const IDENTIFY_OBJECT: u8 = 1;
const SERIAL_OBJECT: u8 = 2;
const REPLY_OBJECT: u8 = 3;
const MC_OBJECT: u8 = 15;

/// Packs a 29-bit identifier into the four arbitration registers.
pub const fn pack_arbitration(id: u32) -> [u8; 4] {
    [
        (id >> 21) as u8,
        (id >> 13) as u8,
        (id >> 5) as u8,
        ((id & 0x1F) << 3) as u8,
    ]
}

pub const fn unpack_arbitration(arb: [u8; 4]) -> u32 {
    ((arb[0] as u32) << 21)
        | ((arb[1] as u32) << 13)
        | ((arb[2] as u32) << 5)
        | ((arb[3] as u32) >> 3)
}

pub struct I82527<R> {
    regs: R,
    config: ControllerConfig,
}

impl<R: RegisterAccess> I82527<R> {
    pub fn new(regs: R, config: ControllerConfig) -> Self {
        Self { regs, config }
    }

    pub fn release(self) -> R {
        self.regs
    }

    fn write_object(&mut self, n: u8, offset: u8, value: u8) -> Result<(), R::Error> {
        self.regs.write(reg::object(n) + offset, value)
    }

    fn read_object(&mut self, n: u8, offset: u8) -> Result<u8, R::Error> {
        self.regs.read(reg::object(n) + offset)
    }

    fn write_arbitration(&mut self, n: u8, id: u32) -> Result<(), R::Error> {
        for (i, byte) in pack_arbitration(id).into_iter().enumerate() {
            self.write_object(n, reg::ARB + i as u8, byte)?;
        }
        Ok(())
    }

    fn read_arbitration(&mut self, n: u8) -> Result<u32, R::Error> {
        let mut arb = [0u8; 4];
        for (i, byte) in arb.iter_mut().enumerate() {
            *byte = self.read_object(n, reg::ARB + i as u8)?;
        }
        Ok(unpack_arbitration(arb))
    }

    fn write_mask(&mut self, base: u8, mask: [u8; 4]) -> Result<(), R::Error> {
        for (i, byte) in mask.into_iter().enumerate() {
            self.regs.write(base + i as u8, byte)?;
        }
        Ok(())
    }

    fn service_status(&mut self) -> Result<CanEvent, R::Error> {
        let status = self.regs.read(reg::STATUS)?;
        // acknowledge TXOK/RXOK and mark the error code as consumed
        let cleared = (status & !(BusStatus::TX_OK | BusStatus::RX_OK)) | BusStatus::LAST_ERROR;
        self.regs.write(reg::STATUS, cleared)?;
        Ok(CanEvent::Status(BusStatus::from_register(status)))
    }

    fn service_mc_object(&mut self) -> Result<CanEvent, R::Error> {
        let ctl1 = self.read_object(MC_OBJECT, reg::CTL1)?;
        let lost = ctl1 & MSGLST_MASK == MSGLST_SET;
        if lost {
            self.write_object(MC_OBJECT, reg::CTL1, CTL1_RESET_MSGLST)?;
        }

        let id = self.read_arbitration(MC_OBJECT)?;
        let config = self.read_object(MC_OBJECT, reg::CONFIG)?;
        let len = ((config >> 4) as usize).min(MAX_PAYLOAD);
        let mut data = [0u8; MAX_PAYLOAD];
        for (i, byte) in data[..len].iter_mut().enumerate() {
            *byte = self.read_object(MC_OBJECT, reg::DATA + i as u8)?;
        }

        // hand the buffer back to the controller
        self.write_object(MC_OBJECT, reg::CTL0, CTL0_RESET_INTPND)?;
        self.write_object(MC_OBJECT, reg::CTL1, CTL1_RELEASE_BUFFER)?;

        Ok(match Frame::from_raw(id, &data[..len]) {
            Some(frame) => CanEvent::Frame { frame, lost },
            None => CanEvent::Unknown(INT_OBJECT_15),
        })
    }

    fn service_identify_object(&mut self) -> Result<CanEvent, R::Error> {
        let ctl1 = self.read_object(IDENTIFY_OBJECT, reg::CTL1)?;
        if ctl1 & NEWDAT_MASK != NEWDAT_SET {
            self.write_object(IDENTIFY_OBJECT, reg::CTL0, CTL0_RESET_INTPND)?;
            return Ok(CanEvent::Unknown(INT_OBJECT_1));
        }

        let lost = ctl1 & MSGLST_MASK == MSGLST_SET;
        if lost {
            self.write_object(IDENTIFY_OBJECT, reg::CTL1, CTL1_RESET_MSGLST)?;
        }
        self.write_object(IDENTIFY_OBJECT, reg::CTL0, CTL0_RESET_INTPND)?;
        self.write_object(IDENTIFY_OBJECT, reg::CTL1, CTL1_RESET_NEWDAT)?;
        Ok(CanEvent::Identify { lost })
    }
}

impl<R: RegisterAccess> CanController for I82527<R> {
    type Error = R::Error;

    fn configure_filters(
        &mut self,
        base_address: u32,
        serial_number: &[u8; 8],
    ) -> Result<(), Self::Error> {
        self.regs.write(reg::CONTROL, CONTROL_INIT)?;
        self.regs.write(reg::CPU_INTERFACE, 0x41)?;
        self.regs.write(reg::STATUS, 0x00)?;
        self.regs.write(reg::BUS_CONFIG, 0x42)?;
        self.regs.write(reg::BIT_TIMING_0, self.config.btr0)?;
        self.regs.write(reg::BIT_TIMING_1, self.config.btr1)?;

        // identify broadcasts use identifier 0 and must match exactly
        self.regs.write(reg::GLOBAL_MASK_STANDARD, 0xFF)?;
        self.regs.write(reg::GLOBAL_MASK_STANDARD + 1, 0xE0)?;
        self.write_mask(reg::GLOBAL_MASK_EXTENDED, [0xFF, 0xFF, 0xFF, 0xF8])?;

        self.write_object(IDENTIFY_OBJECT, reg::CTL0, CTL0_VALID_RX)?;
        self.write_object(IDENTIFY_OBJECT, reg::CTL1, CTL1_RESET_ALL)?;
        self.write_object(IDENTIFY_OBJECT, reg::CONFIG, CONFIG_EXTENDED)?;
        self.write_arbitration(IDENTIFY_OBJECT, 0)?;

        self.write_object(SERIAL_OBJECT, reg::CTL0, CTL0_VALID_QUIET)?;
        self.write_object(SERIAL_OBJECT, reg::CTL1, CTL1_RESET_UPDATE_FLAGS)?;
        self.write_object(
            SERIAL_OBJECT,
            reg::CONFIG,
            (8 << 4) | CONFIG_TRANSMIT | CONFIG_EXTENDED,
        )?;
        self.write_arbitration(SERIAL_OBJECT, base_address)?;
        for (i, byte) in serial_number.iter().enumerate() {
            self.write_object(SERIAL_OBJECT, reg::DATA + i as u8, *byte)?;
        }

        self.write_object(REPLY_OBJECT, reg::CTL0, CTL0_VALID_QUIET)?;
        self.write_object(REPLY_OBJECT, reg::CTL1, CTL1_RESET_UPDATE_FLAGS)?;
        self.write_object(REPLY_OBJECT, reg::CONFIG, CONFIG_TRANSMIT | CONFIG_EXTENDED)?;
        self.write_arbitration(REPLY_OBJECT, 0)?;

        for n in 4..MC_OBJECT {
            self.write_object(n, reg::CTL0, CTL0_INVALID)?;
            self.write_object(n, reg::CTL1, CTL1_RESET_ALL)?;
        }

        // object 15 takes everything in our window through the
        // mask-of-last-message register
        self.write_object(MC_OBJECT, reg::CTL0, CTL0_VALID_RX)?;
        self.write_object(MC_OBJECT, reg::CTL1, CTL1_RESET_ALL)?;
        self.write_object(MC_OBJECT, reg::CONFIG, CONFIG_EXTENDED)?;
        self.write_mask(reg::MASK_LAST_MESSAGE, [0xFF, 0xC0, 0x00, 0x00])?;
        self.write_arbitration(MC_OBJECT, base_address)?;

        self.regs.write(reg::CONTROL, CONTROL_RUN)
    }

    fn receive(&mut self) -> Result<Option<CanEvent>, Self::Error> {
        let event = match self.regs.read(reg::INTERRUPT)? {
            0 => return Ok(None),
            INT_STATUS => self.service_status()?,
            INT_OBJECT_15 => self.service_mc_object()?,
            INT_OBJECT_1 => self.service_identify_object()?,
            other => CanEvent::Unknown(other),
        };
        Ok(Some(event))
    }

    fn transmit(&mut self, frame: &Frame) -> Result<(), Self::Error> {
        let data = frame.payload();
        self.write_object(REPLY_OBJECT, reg::CTL0, CTL0_CLEAR_VALID)?;
        self.write_object(REPLY_OBJECT, reg::CTL1, CTL1_SET_CPUUPD)?;
        self.write_arbitration(REPLY_OBJECT, frame.raw_id())?;
        self.write_object(
            REPLY_OBJECT,
            reg::CONFIG,
            ((data.len() as u8) << 4) | CONFIG_TRANSMIT | CONFIG_EXTENDED,
        )?;
        for (i, byte) in data.iter().enumerate() {
            self.write_object(REPLY_OBJECT, reg::DATA + i as u8, *byte)?;
        }
        self.write_object(REPLY_OBJECT, reg::CTL0, CTL0_SET_VALID)?;
        self.write_object(REPLY_OBJECT, reg::CTL1, CTL1_NEWDAT_READY)?;
        self.write_object(REPLY_OBJECT, reg::CTL1, CTL1_TRANSMIT)
    }

    fn send_identify(&mut self) -> Result<(), Self::Error> {
        self.write_object(SERIAL_OBJECT, reg::CTL1, CTL1_TRANSMIT)
    }

    fn set_status_interrupts(&mut self, enabled: bool) -> Result<(), Self::Error> {
        let control = if enabled {
            CONTROL_RUN_STATUS
        } else {
            CONTROL_RUN
        };
        self.regs.write(reg::CONTROL, control)
    }

    fn status(&mut self) -> Result<u8, Self::Error> {
        self.regs.read(reg::STATUS)
    }
}
