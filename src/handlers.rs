//! Monitor points served by the bridge itself, and the handler that forwards
//! everything else to the downstream device.

use core::cell::Cell;

use critical_section::Mutex;
use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::ds1820::Temperature;
use crate::identity::Revision;
use crate::link::LinkStatus;
use crate::message::{Message, Payload};
use crate::queue::TransactionQueue;
use crate::registry::{Handler, Registrar, RegistryFull, Response};

pub mod rca {
    pub const VERSION: u32 = 0x20000;
    pub const SETUP_INFO: u32 = 0x20001;
    pub const MONITOR_TIMERS_LOW: u32 = 0x20020;
    pub const MONITOR_TIMERS_HIGH: u32 = 0x20021;
    pub const CONTROL_TIMERS_LOW: u32 = 0x20022;
    pub const CONTROL_TIMERS_HIGH: u32 = 0x20023;
    pub const LINK_STATE: u32 = 0x20024;
    pub const DIAGNOSTICS_LAST: u32 = 0x2003F;
    pub const AMBIENT_TEMPERATURE: u32 = 0x30003;
}

fn reply(message: &mut Message, bytes: &[u8]) -> Response {
    if !message.is_monitor() {
        return Response::NoReply;
    }
    match message.set_reply(bytes) {
        Ok(()) => Response::Reply,
        Err(_) => Response::NoReply,
    }
}

fn words(values: &[u16]) -> Payload {
    values.iter().flat_map(|value| value.to_be_bytes()).take(8).collect()
}

/// Bridge firmware version.
pub struct FirmwareVersion {
    revision: Revision,
}

impl FirmwareVersion {
    pub const fn new(revision: Revision) -> Self {
        Self { revision }
    }
}

impl Handler for FirmwareVersion {
    fn handle(&self, message: &mut Message) -> Response {
        reply(message, &self.revision.to_bytes())
    }
}

/// Status byte of the downstream setup.
pub struct SetupInfo<'a> {
    link: &'a LinkStatus,
}

impl<'a> SetupInfo<'a> {
    pub const fn new(link: &'a LinkStatus) -> Self {
        Self { link }
    }
}

impl Handler for SetupInfo<'_> {
    fn handle(&self, message: &mut Message) -> Response {
        reply(message, &[self.link.setup_status()])
    }
}

/// Handshake timers and link state. Unassigned addresses in the block answer
/// with an empty payload.
pub struct Diagnostics<'a, M: RawMutex, const N: usize> {
    link: &'a LinkStatus,
    queue: &'a TransactionQueue<M, N>,
    max_timeout: u16,
}

impl<'a, M: RawMutex, const N: usize> Diagnostics<'a, M, N> {
    pub const fn new(link: &'a LinkStatus, queue: &'a TransactionQueue<M, N>, max_timeout: u16) -> Self {
        Self {
            link,
            queue,
            max_timeout,
        }
    }
}

impl<M: RawMutex, const N: usize> Handler for Diagnostics<'_, M, N> {
    fn handle(&self, message: &mut Message) -> Response {
        if !message.is_monitor() {
            return Response::NoReply;
        }
        let monitor = self.link.monitor_timers();
        let control = self.link.control_timers();
        let payload = match message.rca {
            rca::MONITOR_TIMERS_LOW => words(&monitor[..4]),
            rca::MONITOR_TIMERS_HIGH => {
                words(&[monitor[4], monitor[5], monitor[6], self.max_timeout])
            }
            rca::CONTROL_TIMERS_LOW => words(&control[..4]),
            rca::CONTROL_TIMERS_HIGH => words(&[control[4], control[5], 0, self.max_timeout]),
            rca::LINK_STATE => [
                self.link.request(),
                self.link.downstream_ready(),
                self.queue.take_overflow(),
                self.link.waiting(),
                self.link.ready(),
                self.link.initialized(),
            ]
            .into_iter()
            .map(u8::from)
            .collect(),
            _ => Payload::new(),
        };
        message.data = payload;
        Response::Reply
    }
}

/// Latest ambient temperature reading, written by the bridge loop.
pub struct AmbientTemperature {
    reading: Mutex<Cell<Temperature>>,
}

impl AmbientTemperature {
    pub const fn new() -> Self {
        Self {
            reading: Mutex::new(Cell::new(Temperature {
                raw_low: 0,
                raw_high: 0,
                remainder: 0,
                resolution: 0,
            })),
        }
    }

    pub fn store(&self, reading: Temperature) {
        critical_section::with(|cs| self.reading.borrow(cs).set(reading));
    }

    pub fn load(&self) -> Temperature {
        critical_section::with(|cs| self.reading.borrow(cs).get())
    }
}

impl Default for AmbientTemperature {
    fn default() -> Self {
        Self::new()
    }
}

impl Handler for AmbientTemperature {
    fn handle(&self, message: &mut Message) -> Response {
        reply(message, &self.load().to_bytes())
    }
}

/// Hands requests in the learned ranges to the bridge loop. The message's
/// own direction decides how it is bridged, so a zero-length request on a
/// control range is still answered.
pub struct ForwardHandler<'a, M: RawMutex, const N: usize> {
    queue: &'a TransactionQueue<M, N>,
}

impl<'a, M: RawMutex, const N: usize> ForwardHandler<'a, M, N> {
    pub const fn new(queue: &'a TransactionQueue<M, N>) -> Self {
        Self { queue }
    }
}

impl<M: RawMutex, const N: usize> Handler for ForwardHandler<'_, M, N> {
    fn handle(&self, message: &mut Message) -> Response {
        self.queue.enqueue(message.clone());
        Response::NoReply
    }
}

/// The bridge's own monitor points, in lookup priority order.
pub struct FixedPoints<'a> {
    pub version: &'a (dyn Handler + Sync),
    pub setup_info: &'a (dyn Handler + Sync),
    pub diagnostics: &'a (dyn Handler + Sync),
    pub ambient: &'a (dyn Handler + Sync),
}

impl<'a> FixedPoints<'a> {
    /// Registers the fixed points. They must go in before the learned ranges
    /// so they shadow any overlap.
    pub fn register<R: Registrar<'a>>(&self, registrar: &mut R) -> Result<(), RegistryFull> {
        registrar.register(rca::VERSION, rca::VERSION, self.version)?;
        registrar.register(rca::SETUP_INFO, rca::SETUP_INFO, self.setup_info)?;
        registrar.register(rca::MONITOR_TIMERS_LOW, rca::DIAGNOSTICS_LAST, self.diagnostics)?;
        registrar.register(rca::AMBIENT_TEMPERATURE, rca::AMBIENT_TEMPERATURE, self.ambient)
    }
}
