//! RP2350 pin adapters for the bridge core.

use core::convert::Infallible;

use amb_bridge::bridge::{BusDirection, ParallelPort};
use amb_bridge::setup::init_line_ready;
use embassy_rp::gpio::{Flex, Input, Level, Output, Pull};
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};

/// Byte-wide link to the downstream device.
///
/// `strobe` is driven low by the downstream side when it has taken or
/// presented a byte; `wait` is pulsed by us to acknowledge it.
pub struct ParallelLink {
    data: [Flex<'static>; 8],
    request: Output<'static>,
    wait: Output<'static>,
    strobe: Input<'static>,
    ready: Input<'static>,
    select: Output<'static>,
}

impl ParallelLink {
    pub fn new(
        data: [Flex<'static>; 8],
        request: Output<'static>,
        wait: Output<'static>,
        strobe: Input<'static>,
        ready: Input<'static>,
        select: Output<'static>,
    ) -> Self {
        let mut link = Self {
            data,
            request,
            wait,
            strobe,
            ready,
            select,
        };
        for pin in link.data.iter_mut() {
            pin.set_pull(Pull::Down);
        }
        link
    }

    /// Completes on the next falling edge of the downstream strobe.
    pub async fn wait_for_strobe_edge(&mut self) {
        self.strobe.wait_for_falling_edge().await
    }
}

impl ParallelPort for ParallelLink {
    fn set_request(&mut self, asserted: bool) {
        self.request.set_level(Level::from(asserted));
    }

    fn strobe_settled(&mut self) -> bool {
        self.strobe.is_low()
    }

    fn set_bus_direction(&mut self, direction: BusDirection) {
        for pin in self.data.iter_mut() {
            match direction {
                BusDirection::Output => pin.set_as_output(),
                BusDirection::Input => pin.set_as_input(),
            }
        }
    }

    fn write_data(&mut self, value: u8) {
        for (i, pin) in self.data.iter_mut().enumerate() {
            pin.set_level(Level::from(value & (1 << i) != 0));
        }
    }

    fn read_data(&mut self) -> u8 {
        self.data
            .iter()
            .enumerate()
            .fold(0, |byte, (i, pin)| byte | (u8::from(pin.is_high()) << i))
    }

    fn pulse_wait(&mut self) {
        self.wait.set_high();
        // ~100 ns at 150 MHz
        cortex_m::asm::delay(16);
        self.wait.set_low();
    }

    fn downstream_ready(&mut self) -> bool {
        init_line_ready(&mut self.ready)
    }

    fn set_select(&mut self, high: bool) {
        self.select.set_level(Level::from(high));
    }
}

/// Open-drain 1-Wire pin: low drives the bus, high floats it onto the
/// pull-up.
pub struct OpenDrain {
    pin: Flex<'static>,
}

impl OpenDrain {
    pub fn new(mut pin: Flex<'static>) -> Self {
        pin.set_pull(Pull::Up);
        pin.set_low();
        pin.set_as_input();
        Self { pin }
    }
}

impl ErrorType for OpenDrain {
    type Error = Infallible;
}

impl OutputPin for OpenDrain {
    fn set_low(&mut self) -> Result<(), Self::Error> {
        self.pin.set_as_output();
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Self::Error> {
        self.pin.set_as_input();
        Ok(())
    }
}

impl InputPin for OpenDrain {
    fn is_high(&mut self) -> Result<bool, Self::Error> {
        Ok(self.pin.is_high())
    }

    fn is_low(&mut self) -> Result<bool, Self::Error> {
        Ok(self.pin.is_low())
    }
}

/// Reads the node address switch. Closed positions pull their pin low.
pub fn read_node_address(switch: &[Input<'static>; 6]) -> u8 {
    switch
        .iter()
        .enumerate()
        .fold(0, |address, (i, pin)| address | (u8::from(pin.is_low()) << i))
}
