//! Bring-up of the parallel link and learning the downstream address ranges.

use embedded_hal::digital::InputPin;

use crate::bridge::{Bridge, BusDirection, ParallelPort};
use crate::link::setup_status;
use crate::message::Message;
use crate::registry::{Handler, Registrar};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum RangeKind {
    SpecialMonitor,
    SpecialControl,
    Monitor,
    Control,
}

impl RangeKind {
    /// Learning order.
    pub const ALL: [RangeKind; 4] = [
        RangeKind::SpecialMonitor,
        RangeKind::SpecialControl,
        RangeKind::Monitor,
        RangeKind::Control,
    ];

    /// Downstream monitor point that reports this range.
    pub const fn query_rca(self) -> u32 {
        match self {
            RangeKind::SpecialMonitor => 0x20003,
            RangeKind::SpecialControl => 0x20004,
            RangeKind::Monitor => 0x20005,
            RangeKind::Control => 0x20006,
        }
    }
}

/// Reads the downstream INIT line, which is driven low once the device has
/// booted. A pin that cannot be read counts as not ready.
pub fn init_line_ready<P: InputPin>(init: &mut P) -> bool {
    init.is_low().unwrap_or(false)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RcaRange {
    pub low: u32,
    pub high: u32,
}

impl RcaRange {
    /// Decodes a range reply: low then high, little-endian.
    pub fn from_reply(data: &[u8]) -> Option<Self> {
        let low = u32::from_le_bytes(data.get(0..4)?.try_into().ok()?);
        let high = u32::from_le_bytes(data.get(4..8)?.try_into().ok()?);
        (low <= high).then_some(Self { low, high })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RangeTable {
    ranges: [RcaRange; 4],
}

impl RangeTable {
    pub fn get(&self, kind: RangeKind) -> RcaRange {
        self.ranges[kind as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SetupState {
    NotReady,
    PortsInitialized,
    WaitingForDownstreamReady,
    Ready,
    /// Learning the range at this index of [`RangeKind::ALL`].
    LearningRanges(u8),
    Initialized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SetupError {
    NotReady,
    AlreadyInitialized,
    Timeout(RangeKind),
    InvalidRange(RangeKind),
    RegistryFull(RangeKind),
}

impl SetupError {
    pub const fn status_code(self) -> u8 {
        match self {
            SetupError::NotReady => setup_status::NOT_READY,
            SetupError::AlreadyInitialized => setup_status::ALREADY_DONE,
            SetupError::Timeout(_) | SetupError::InvalidRange(_) | SetupError::RegistryFull(_) => {
                setup_status::TIMEOUT
            }
        }
    }
}

pub struct SetupSequence {
    state: SetupState,
    table: Option<RangeTable>,
}

impl SetupSequence {
    pub const fn new() -> Self {
        Self {
            state: SetupState::NotReady,
            table: None,
        }
    }

    pub fn state(&self) -> SetupState {
        self.state
    }

    pub fn is_initialized(&self) -> bool {
        self.state == SetupState::Initialized
    }

    pub fn ranges(&self) -> Option<&RangeTable> {
        self.table.as_ref()
    }

    /// Puts the link pins into their idle state.
    pub fn init_ports<P: ParallelPort>(&mut self, bridge: &mut Bridge<'_, P>) {
        let port = bridge.port_mut();
        port.set_bus_direction(BusDirection::Output);
        port.set_request(false);
        port.set_select(true);
        port.set_select(false);
        bridge.link().set_request(false);
        self.state = SetupState::PortsInitialized;
        debug!("link ports initialized");
    }

    /// Checks the downstream ready line. Returns `true` once it is up.
    pub fn poll_downstream_ready<P: ParallelPort>(&mut self, bridge: &mut Bridge<'_, P>) -> bool {
        match self.state {
            SetupState::NotReady => return false,
            SetupState::PortsInitialized => self.state = SetupState::WaitingForDownstreamReady,
            SetupState::WaitingForDownstreamReady => {}
            _ => return true,
        }

        let ready = bridge.port_mut().downstream_ready();
        bridge.link().set_downstream_ready(ready);
        if ready {
            info!("downstream device ready");
            self.state = SetupState::Ready;
            bridge.link().set_ready(true);
        }
        ready
    }

    /// Learns the four downstream ranges and registers each with `handler`
    /// as soon as it is known. A failure removes exactly the registrations
    /// this call made.
    pub fn run<'h, P: ParallelPort, R: Registrar<'h>>(
        &mut self,
        bridge: &mut Bridge<'_, P>,
        registrar: &mut R,
        handler: &'h (dyn Handler + Sync),
    ) -> Result<RangeTable, SetupError> {
        match self.state {
            SetupState::Initialized => return Err(SetupError::AlreadyInitialized),
            SetupState::Ready => {}
            _ => {
                bridge.link().set_setup_status(setup_status::NOT_READY);
                return Err(SetupError::NotReady);
            }
        }

        let mut table = RangeTable::default();
        for (step, kind) in RangeKind::ALL.into_iter().enumerate() {
            self.state = SetupState::LearningRanges(step as u8);
            let learned = Self::learn(bridge, kind).and_then(|range| {
                registrar
                    .register(range.low, range.high, handler)
                    .map(|()| range)
                    .map_err(|_| SetupError::RegistryFull(kind))
            });

            match learned {
                Ok(range) => {
                    info!("{:?} range {:x}..={:x}", kind, range.low, range.high);
                    table.ranges[step] = range;
                }
                Err(e) => {
                    warn!("setup failed: {:?}, rolling back {} ranges", e, step);
                    for _ in 0..step {
                        registrar.unregister_last();
                    }
                    self.state = SetupState::Ready;
                    bridge.link().set_setup_status(e.status_code());
                    return Err(e);
                }
            }
        }

        self.state = SetupState::Initialized;
        self.table = Some(table);
        bridge.link().set_setup_status(setup_status::OK);
        bridge.link().set_initialized(true);
        info!("setup complete");
        Ok(table)
    }

    fn learn<P: ParallelPort>(bridge: &mut Bridge<'_, P>, kind: RangeKind) -> Result<RcaRange, SetupError> {
        let mut message = Message::monitor(kind.query_rca());
        bridge
            .monitor(&mut message)
            .map_err(|_| SetupError::Timeout(kind))?;
        RcaRange::from_reply(&message.data).ok_or(SetupError::InvalidRange(kind))
    }
}

impl Default for SetupSequence {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;
    use embedded_hal::digital::ErrorType;

    struct Line(bool);

    impl ErrorType for Line {
        type Error = Infallible;
    }

    impl InputPin for Line {
        fn is_high(&mut self) -> Result<bool, Infallible> {
            Ok(self.0)
        }

        fn is_low(&mut self) -> Result<bool, Infallible> {
            Ok(!self.0)
        }
    }

    #[test]
    fn init_line_is_active_low() {
        // pulled up while the downstream device is still booting
        assert!(!init_line_ready(&mut Line(true)));
        assert!(init_line_ready(&mut Line(false)));
    }

    #[test]
    fn range_reply_decode() {
        let reply = [0x00, 0x00, 0x01, 0x00, 0xFF, 0x0F, 0x01, 0x00];
        assert_eq!(
            RcaRange::from_reply(&reply),
            Some(RcaRange {
                low: 0x10000,
                high: 0x10FFF
            })
        );
        assert_eq!(RcaRange::from_reply(&reply[..7]), None);

        let inverted = [0x10, 0, 0, 0, 0x01, 0, 0, 0];
        assert_eq!(RcaRange::from_reply(&inverted), None);
    }

    #[test]
    fn error_status_codes() {
        assert_eq!(SetupError::NotReady.status_code(), 0x06);
        assert_eq!(SetupError::AlreadyInitialized.status_code(), 0x05);
        assert_eq!(SetupError::Timeout(RangeKind::Monitor).status_code(), 0x07);
    }
}
