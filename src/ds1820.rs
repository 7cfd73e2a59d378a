//! DS1820 1-Wire thermometer. Its ROM code doubles as the node serial
//! number.

use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{InputPin, OutputPin};

use crate::identity::SlaveError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SensorError {
    /// No presence pulse after reset.
    NoDevice,
    Crc,
    ConversionTimeout,
    Pin,
}

impl SensorError {
    /// Code reported through the error status monitor point.
    pub const fn slave_error(self) -> SlaveError {
        match self {
            SensorError::Crc => SlaveError::OneWireCrc,
            SensorError::NoDevice | SensorError::ConversionTimeout | SensorError::Pin => {
                SlaveError::NoSensor
            }
        }
    }
}

/// Raw DS1820 reading, as served on the ambient temperature point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Temperature {
    pub raw_low: u8,
    pub raw_high: u8,
    pub remainder: u8,
    /// Counts per degree.
    pub resolution: u8,
}

impl Temperature {
    pub fn from_scratchpad(scratchpad: &[u8; 9]) -> Self {
        Self {
            raw_low: scratchpad[0],
            raw_high: scratchpad[1],
            remainder: scratchpad[6],
            resolution: scratchpad[7],
        }
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        [self.raw_low, self.raw_high, self.remainder, self.resolution]
    }

    /// Extended resolution conversion from the count registers. Falls back to
    /// half degrees when the per-degree count is zero.
    pub fn celsius(self) -> f32 {
        let sign = if self.raw_high != 0 { 0x80 } else { 0x00 };
        let whole = ((self.raw_low >> 1) | sign) as i8 as f32;
        if self.resolution == 0 {
            let half = if self.raw_low & 0x01 != 0 { 0.5 } else { 0.0 };
            return whole + half;
        }
        let per_degree = self.resolution as f32;
        whole - 0.25 + (per_degree - self.remainder as f32) / per_degree
    }
}

pub trait Thermometer {
    /// 64-bit ROM code, family code first.
    fn read_unique_id(&mut self) -> Result<[u8; 8], SensorError>;
    fn read_temperature(&mut self) -> Result<Temperature, SensorError>;
}

/// Dallas/Maxim 1-Wire CRC-8 (x^8 + x^5 + x^4 + 1, reflected).
pub fn crc8(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0, |mut crc, &byte| {
        let mut byte = byte;
        for _ in 0..8 {
            let mix = (crc ^ byte) & 0x01;
            crc >>= 1;
            if mix != 0 {
                crc ^= 0x8C;
            }
            byte >>= 1;
        }
        crc
    })
}

const READ_ROM: u8 = 0x33;
const SKIP_ROM: u8 = 0xCC;
const CONVERT_T: u8 = 0x44;
const READ_SCRATCHPAD: u8 = 0xBE;

/// Bit slots polled before a running conversion is declared stuck.
const CONVERSION_POLLS: u16 = 12_000;

/// Bit-banged driver over an open-drain pin: `set_low` pulls the bus down,
/// `set_high` releases it to the pull-up.
pub struct Ds1820<P, D> {
    pin: P,
    delay: D,
}

impl<P: InputPin + OutputPin, D: DelayNs> Ds1820<P, D> {
    pub fn new(pin: P, delay: D) -> Self {
        Self { pin, delay }
    }

    pub fn release(self) -> (P, D) {
        (self.pin, self.delay)
    }

    fn drive_low(&mut self) -> Result<(), SensorError> {
        self.pin.set_low().map_err(|_| SensorError::Pin)
    }

    fn release_bus(&mut self) -> Result<(), SensorError> {
        self.pin.set_high().map_err(|_| SensorError::Pin)
    }

    fn sample(&mut self) -> Result<bool, SensorError> {
        self.pin.is_high().map_err(|_| SensorError::Pin)
    }

    /// Reset pulse. `true` if a device answered with a presence pulse.
    fn reset(&mut self) -> Result<bool, SensorError> {
        self.drive_low()?;
        self.delay.delay_us(480);
        self.release_bus()?;
        self.delay.delay_us(70);
        let present = !self.sample()?;
        self.delay.delay_us(410);
        Ok(present)
    }

    fn write_bit(&mut self, bit: bool) -> Result<(), SensorError> {
        self.drive_low()?;
        if bit {
            self.delay.delay_us(6);
            self.release_bus()?;
            self.delay.delay_us(64);
        } else {
            self.delay.delay_us(60);
            self.release_bus()?;
            self.delay.delay_us(10);
        }
        Ok(())
    }

    fn read_bit(&mut self) -> Result<bool, SensorError> {
        self.drive_low()?;
        self.delay.delay_us(6);
        self.release_bus()?;
        self.delay.delay_us(9);
        let bit = self.sample()?;
        self.delay.delay_us(55);
        Ok(bit)
    }

    fn write_byte(&mut self, byte: u8) -> Result<(), SensorError> {
        for i in 0..8 {
            self.write_bit(byte & (1 << i) != 0)?;
        }
        Ok(())
    }

    fn read_byte(&mut self) -> Result<u8, SensorError> {
        let mut byte = 0;
        for i in 0..8 {
            if self.read_bit()? {
                byte |= 1 << i;
            }
        }
        Ok(byte)
    }

    fn start(&mut self, commands: &[u8]) -> Result<(), SensorError> {
        if !self.reset()? {
            return Err(SensorError::NoDevice);
        }
        for command in commands {
            self.write_byte(*command)?;
        }
        Ok(())
    }

    fn read_into(&mut self, buf: &mut [u8]) -> Result<(), SensorError> {
        for byte in buf.iter_mut() {
            *byte = self.read_byte()?;
        }
        Ok(())
    }

    /// Starts a temperature conversion and returns without waiting for it.
    pub fn start_conversion(&mut self) -> Result<(), SensorError> {
        self.start(&[SKIP_ROM, CONVERT_T])
    }

    /// One read slot. The device holds the bus low until the conversion is
    /// done.
    pub fn conversion_done(&mut self) -> Result<bool, SensorError> {
        self.read_bit()
    }

    pub fn read_scratchpad(&mut self) -> Result<Temperature, SensorError> {
        self.start(&[SKIP_ROM, READ_SCRATCHPAD])?;
        let mut scratchpad = [0u8; 9];
        self.read_into(&mut scratchpad)?;
        if crc8(&scratchpad[..8]) != scratchpad[8] {
            return Err(SensorError::Crc);
        }
        Ok(Temperature::from_scratchpad(&scratchpad))
    }
}

impl<P: InputPin + OutputPin, D: DelayNs> Thermometer for Ds1820<P, D> {
    fn read_unique_id(&mut self) -> Result<[u8; 8], SensorError> {
        self.start(&[READ_ROM])?;
        let mut rom = [0u8; 8];
        self.read_into(&mut rom)?;
        if crc8(&rom[..7]) != rom[7] {
            return Err(SensorError::Crc);
        }
        Ok(rom)
    }

    fn read_temperature(&mut self) -> Result<Temperature, SensorError> {
        self.start_conversion()?;
        let mut polls = 0;
        while !self.conversion_done()? {
            polls += 1;
            if polls >= CONVERSION_POLLS {
                return Err(SensorError::ConversionTimeout);
            }
        }
        self.read_scratchpad()
    }
}
