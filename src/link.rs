//! Parallel link state shared between the bridge loop and the diagnostic
//! handlers running in interrupt context.

use portable_atomic::{AtomicBool, AtomicU16, AtomicU8, Ordering};

pub const MONITOR_PHASES: usize = 7;
pub const CONTROL_PHASES: usize = 6;

/// Which transaction a handshake belonged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Exchange {
    Monitor,
    Control,
}

/// One handshake step of a bridge transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Phase {
    /// Address byte, least significant first.
    Address(u8),
    Length,
    Payload(u8),
    ReplyLength,
    ReplyPayload(u8),
}

impl Phase {
    /// Diagnostic timer slot for this phase. Control payload bytes share the
    /// slot after the length, as do monitor reply bytes.
    pub const fn timer_slot(self) -> usize {
        match self {
            Phase::Address(n) => n as usize,
            Phase::Length => 4,
            Phase::Payload(_) | Phase::ReplyLength => 5,
            Phase::ReplyPayload(_) => 6,
        }
    }
}

/// Outcome codes reported by the setup status monitor point.
pub mod setup_status {
    pub const OK: u8 = 0x00;
    pub const ALREADY_DONE: u8 = 0x05;
    pub const NOT_READY: u8 = 0x06;
    pub const TIMEOUT: u8 = 0x07;
}

pub struct LinkStatus {
    monitor_timers: [AtomicU16; MONITOR_PHASES],
    control_timers: [AtomicU16; CONTROL_PHASES],
    request: AtomicBool,
    downstream_ready: AtomicBool,
    waiting: AtomicBool,
    ready: AtomicBool,
    initialized: AtomicBool,
    setup_status: AtomicU8,
}

impl LinkStatus {
    pub const fn new() -> Self {
        Self {
            monitor_timers: [const { AtomicU16::new(0) }; MONITOR_PHASES],
            control_timers: [const { AtomicU16::new(0) }; CONTROL_PHASES],
            request: AtomicBool::new(false),
            downstream_ready: AtomicBool::new(false),
            waiting: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            setup_status: AtomicU8::new(setup_status::NOT_READY),
        }
    }

    /// Stores the countdown left when `phase` finished or gave up.
    pub fn record_phase(&self, exchange: Exchange, phase: Phase, remaining: u16) {
        let slot = phase.timer_slot();
        let timers: &[AtomicU16] = match exchange {
            Exchange::Monitor => &self.monitor_timers,
            Exchange::Control => &self.control_timers,
        };
        if let Some(timer) = timers.get(slot) {
            timer.store(remaining, Ordering::Relaxed);
        }
    }

    pub fn monitor_timers(&self) -> [u16; MONITOR_PHASES] {
        core::array::from_fn(|i| self.monitor_timers[i].load(Ordering::Relaxed))
    }

    pub fn control_timers(&self) -> [u16; CONTROL_PHASES] {
        core::array::from_fn(|i| self.control_timers[i].load(Ordering::Relaxed))
    }

    pub fn set_request(&self, asserted: bool) {
        self.request.store(asserted, Ordering::Relaxed);
    }

    pub fn request(&self) -> bool {
        self.request.load(Ordering::Relaxed)
    }

    pub fn set_downstream_ready(&self, ready: bool) {
        self.downstream_ready.store(ready, Ordering::Relaxed);
    }

    pub fn downstream_ready(&self) -> bool {
        self.downstream_ready.load(Ordering::Relaxed)
    }

    pub fn set_waiting(&self, waiting: bool) {
        self.waiting.store(waiting, Ordering::Release);
    }

    pub fn waiting(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Release);
    }

    pub fn ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn set_initialized(&self, initialized: bool) {
        self.initialized.store(initialized, Ordering::Release);
    }

    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn set_setup_status(&self, code: u8) {
        self.setup_status.store(code, Ordering::Relaxed);
    }

    /// Status byte answered on the setup info point: a finished setup
    /// reports "already done", a missing downstream device "not ready",
    /// otherwise the outcome of the last attempt.
    pub fn setup_status(&self) -> u8 {
        if self.initialized() {
            setup_status::ALREADY_DONE
        } else if !self.ready() {
            setup_status::NOT_READY
        } else {
            self.setup_status.load(Ordering::Relaxed)
        }
    }
}

impl Default for LinkStatus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn phase_slots() {
        let link = LinkStatus::new();
        link.record_phase(Exchange::Monitor, Phase::Address(2), 498);
        link.record_phase(Exchange::Monitor, Phase::ReplyPayload(3), 12);
        link.record_phase(Exchange::Control, Phase::Payload(7), 100);
        assert_eq!(link.monitor_timers(), [0, 0, 498, 0, 0, 0, 12]);
        assert_eq!(link.control_timers(), [0, 0, 0, 0, 0, 100]);

        // control transactions have no reply slot
        link.record_phase(Exchange::Control, Phase::ReplyPayload(0), 7);
        assert_eq!(link.control_timers(), [0, 0, 0, 0, 0, 100]);
    }

    #[test]
    fn setup_status_follows_state() {
        let link = LinkStatus::new();
        assert_eq!(link.setup_status(), setup_status::NOT_READY);
        link.set_ready(true);
        link.set_setup_status(setup_status::TIMEOUT);
        assert_eq!(link.setup_status(), setup_status::TIMEOUT);
        link.set_initialized(true);
        assert_eq!(link.setup_status(), setup_status::ALREADY_DONE);
    }
}
