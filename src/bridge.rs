//! Byte-wise handshake protocol to the downstream device.
//!
//! Every byte is one phase: wait for the downstream acknowledge strobe to
//! settle (bounded by a countdown), move the byte, pulse the wait line.
//! A request is the relative address (four bytes, least significant first),
//! the payload length and the payload. Monitor requests then turn the bus
//! around and read back a length byte and up to eight reply bytes.
//!
//! Monitor replies can be collected two ways. [`Bridge::monitor`] spins
//! until the reply is complete. [`Bridge::begin_monitor`] only sends the
//! request; the board calls [`Bridge::on_handshake_edge`] for each strobe
//! edge (or [`Bridge::take_presented_byte`] when the strobe is already low)
//! and the bridge loop calls [`Bridge::poll_reply`], which counts the reply
//! timeout down and retries once.

use embassy_sync::blocking_mutex::raw::RawMutex;

use crate::config::{BridgeConfig, BridgeMode};
use crate::link::{Exchange, LinkStatus, Phase};
use crate::message::{Direction, Message, Payload, MAX_PAYLOAD};
use crate::queue::TransactionQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BusDirection {
    Output,
    Input,
}

/// Pins of the parallel link, as seen from the bridge.
pub trait ParallelPort {
    /// Drives the request line that frames a transaction.
    fn set_request(&mut self, asserted: bool);
    /// `true` once the downstream acknowledge strobe is low.
    fn strobe_settled(&mut self) -> bool;
    fn set_bus_direction(&mut self, direction: BusDirection);
    fn write_data(&mut self, value: u8);
    fn read_data(&mut self) -> u8;
    /// Raises and lowers the wait line once.
    fn pulse_wait(&mut self);
    /// `true` while the downstream device reports itself initialized
    /// (INIT line low).
    fn downstream_ready(&mut self) -> bool;
    fn set_select(&mut self, high: bool);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum BridgeError {
    Timeout(Phase),
    /// Downstream announced more than eight reply bytes.
    ReplyTooLong(u8),
    /// A monitor reply is still outstanding.
    Busy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReplyState {
    Idle,
    AwaitLength,
    AwaitPayload { expected: u8, received: u8 },
    Complete,
    Aborted(BridgeError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ReplyPoll {
    /// Nothing outstanding.
    Idle,
    Pending,
    Complete(Message),
    /// Attempts exhausted; the request is dropped.
    Failed(BridgeError),
}

/// What one [`Bridge::service`] call did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Service {
    Idle,
    Waiting,
    Forwarded,
    Replied,
    Dropped,
}

/// Destination for completed monitor replies.
pub trait ReplySink {
    fn send_reply(&mut self, reply: &Message);
}

struct Session {
    in_flight: Option<Message>,
    reply: ReplyState,
    buffer: Payload,
    countdown: u16,
    attempts: u8,
    timed_out: bool,
}

pub struct Bridge<'a, P> {
    port: P,
    config: BridgeConfig,
    link: &'a LinkStatus,
    session: Session,
}

impl<'a, P: ParallelPort> Bridge<'a, P> {
    pub fn new(port: P, config: BridgeConfig, link: &'a LinkStatus) -> Self {
        Self {
            port,
            config,
            link,
            session: Session {
                in_flight: None,
                reply: ReplyState::Idle,
                buffer: Payload::new(),
                countdown: 0,
                attempts: 0,
                timed_out: false,
            },
        }
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn link(&self) -> &'a LinkStatus {
        self.link
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// A monitor request went out and its reply is not complete yet.
    pub fn waiting(&self) -> bool {
        matches!(
            self.session.reply,
            ReplyState::AwaitLength | ReplyState::AwaitPayload { .. }
        )
    }

    /// The last transaction gave up on a handshake.
    pub fn timed_out(&self) -> bool {
        self.session.timed_out
    }

    pub fn reply_state(&self) -> ReplyState {
        self.session.reply
    }

    fn handshake(&mut self, exchange: Exchange, phase: Phase) -> Result<(), BridgeError> {
        let mut countdown = self.config.max_timeout;
        while countdown > 0 && !self.port.strobe_settled() {
            countdown -= 1;
        }
        self.link.record_phase(exchange, phase, countdown);
        if countdown == 0 {
            debug!("handshake timeout: {:?} {:?}", exchange, phase);
            return Err(BridgeError::Timeout(phase));
        }
        Ok(())
    }

    fn send_byte(&mut self, exchange: Exchange, phase: Phase, value: u8) -> Result<(), BridgeError> {
        self.handshake(exchange, phase)?;
        self.port.write_data(value);
        self.port.pulse_wait();
        Ok(())
    }

    fn receive_byte(&mut self, phase: Phase) -> Result<u8, BridgeError> {
        self.handshake(Exchange::Monitor, phase)?;
        let value = self.port.read_data();
        self.port.pulse_wait();
        Ok(value)
    }

    fn assert_request(&mut self, asserted: bool) {
        self.port.set_request(asserted);
        self.link.set_request(asserted);
    }

    fn send_request(&mut self, message: &Message, exchange: Exchange) -> Result<(), BridgeError> {
        self.port.set_bus_direction(BusDirection::Output);
        self.assert_request(true);
        for (i, byte) in message.rca.to_le_bytes().into_iter().enumerate() {
            self.send_byte(exchange, Phase::Address(i as u8), byte)?;
        }
        self.send_byte(exchange, Phase::Length, message.len() as u8)?;
        for (i, byte) in message.data.iter().enumerate() {
            self.send_byte(exchange, Phase::Payload(i as u8), *byte)?;
        }
        Ok(())
    }

    fn end_exchange(&mut self) {
        self.port.set_bus_direction(BusDirection::Output);
        self.assert_request(false);
    }

    fn attempts_allowed(&self) -> u8 {
        self.config.monitor_retries.saturating_add(1)
    }

    /// Sends a control request. No reply is expected.
    pub fn control(&mut self, message: &Message) -> Result<(), BridgeError> {
        if self.session.in_flight.is_some() {
            return Err(BridgeError::Busy);
        }
        let result = self.send_request(message, Exchange::Control);
        self.end_exchange();
        self.session.timed_out = result.is_err();
        if let Err(e) = result {
            warn!("control {:x} dropped: {:?}", message.rca, e);
        }
        result
    }

    fn exchange_monitor(&mut self, message: &Message) -> Result<Payload, BridgeError> {
        self.send_request(message, Exchange::Monitor)?;
        self.port.set_bus_direction(BusDirection::Input);
        let len = self.receive_byte(Phase::ReplyLength)?;
        if len as usize > MAX_PAYLOAD {
            return Err(BridgeError::ReplyTooLong(len));
        }
        let mut reply = Payload::new();
        for i in 0..len {
            let value = self.receive_byte(Phase::ReplyPayload(i))?;
            reply
                .push(value)
                .map_err(|_| BridgeError::ReplyTooLong(len))?;
        }
        Ok(reply)
    }

    /// Runs a monitor exchange to completion, retrying per configuration.
    /// On success the reply replaces `message.data`.
    pub fn monitor(&mut self, message: &mut Message) -> Result<(), BridgeError> {
        if self.session.in_flight.is_some() {
            return Err(BridgeError::Busy);
        }
        let attempts = self.attempts_allowed();
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = self.exchange_monitor(message);
            self.end_exchange();
            match result {
                Ok(reply) => {
                    message.data = reply;
                    self.session.timed_out = false;
                    return Ok(());
                }
                Err(e) if attempt < attempts => {
                    warn!("monitor {:x} attempt {} failed: {:?}", message.rca, attempt, e);
                }
                Err(e) => {
                    warn!("monitor {:x} dropped: {:?}", message.rca, e);
                    self.session.timed_out = true;
                    return Err(e);
                }
            }
        }
    }

    /// Sends a monitor request and leaves the reply to
    /// [`Bridge::on_handshake_edge`].
    pub fn begin_monitor(&mut self, message: Message) -> Result<(), BridgeError> {
        if self.session.in_flight.is_some() {
            return Err(BridgeError::Busy);
        }
        self.session.attempts = 0;
        self.session.timed_out = false;
        self.launch(message)
    }

    fn launch(&mut self, message: Message) -> Result<(), BridgeError> {
        let attempts = self.attempts_allowed();
        loop {
            self.session.attempts += 1;
            match self.send_request(&message, Exchange::Monitor) {
                Ok(()) => {
                    self.port.set_bus_direction(BusDirection::Input);
                    self.session.buffer.clear();
                    self.session.countdown = self.config.max_timeout;
                    self.session.reply = ReplyState::AwaitLength;
                    self.session.in_flight = Some(message);
                    self.link.set_waiting(true);
                    return Ok(());
                }
                Err(e) => {
                    self.end_exchange();
                    if self.session.attempts >= attempts {
                        warn!("monitor {:x} dropped: {:?}", message.rca, e);
                        self.session.timed_out = true;
                        return Err(e);
                    }
                    warn!(
                        "monitor {:x} attempt {} failed: {:?}",
                        message.rca, self.session.attempts, e
                    );
                }
            }
        }
    }

    fn reply_phase(&self) -> Option<Phase> {
        match self.session.reply {
            ReplyState::AwaitLength => Some(Phase::ReplyLength),
            ReplyState::AwaitPayload { received, .. } => Some(Phase::ReplyPayload(received)),
            _ => None,
        }
    }

    /// Takes one reply byte off the bus. Called when the downstream strobe
    /// signals data; edges with nothing outstanding are ignored.
    pub fn on_handshake_edge(&mut self) {
        let Some(phase) = self.reply_phase() else {
            trace!("handshake edge with no reply outstanding");
            return;
        };
        self.link.record_phase(Exchange::Monitor, phase, self.session.countdown);
        let value = self.port.read_data();
        self.port.pulse_wait();
        self.session.countdown = self.config.max_timeout;

        self.session.reply = match self.session.reply {
            ReplyState::AwaitLength if value as usize > MAX_PAYLOAD => {
                ReplyState::Aborted(BridgeError::ReplyTooLong(value))
            }
            ReplyState::AwaitLength if value == 0 => ReplyState::Complete,
            ReplyState::AwaitLength => ReplyState::AwaitPayload {
                expected: value,
                received: 0,
            },
            ReplyState::AwaitPayload { expected, received } => {
                if self.session.buffer.push(value).is_err() {
                    ReplyState::Aborted(BridgeError::ReplyTooLong(expected))
                } else if received + 1 == expected {
                    ReplyState::Complete
                } else {
                    ReplyState::AwaitPayload {
                        expected,
                        received: received + 1,
                    }
                }
            }
            other => other,
        };

        if !self.waiting() {
            self.link.set_waiting(false);
        }
    }

    /// Takes a reply byte the downstream device already presented. The
    /// strobe stays low until our wait pulse, so a byte presented before the
    /// board armed its edge wait is only visible as the line level.
    pub fn take_presented_byte(&mut self) -> bool {
        if !self.waiting() || !self.port.strobe_settled() {
            return false;
        }
        self.on_handshake_edge();
        true
    }

    /// Advances an outstanding monitor exchange by one background tick.
    pub fn poll_reply(&mut self) -> ReplyPoll {
        match self.session.reply {
            ReplyState::Idle => ReplyPoll::Idle,
            ReplyState::Complete => {
                self.end_exchange();
                self.session.reply = ReplyState::Idle;
                self.link.set_waiting(false);
                match self.session.in_flight.take() {
                    Some(mut message) => {
                        message.data = core::mem::take(&mut self.session.buffer);
                        ReplyPoll::Complete(message)
                    }
                    None => ReplyPoll::Idle,
                }
            }
            ReplyState::Aborted(error) => self.retry_or_fail(error),
            ReplyState::AwaitLength | ReplyState::AwaitPayload { .. } => {
                if self.session.countdown > 0 {
                    self.session.countdown -= 1;
                    return ReplyPoll::Pending;
                }
                match self.reply_phase() {
                    Some(phase) => {
                        self.link.record_phase(Exchange::Monitor, phase, 0);
                        self.retry_or_fail(BridgeError::Timeout(phase))
                    }
                    None => ReplyPoll::Pending,
                }
            }
        }
    }

    fn retry_or_fail(&mut self, error: BridgeError) -> ReplyPoll {
        self.end_exchange();
        self.session.reply = ReplyState::Idle;
        self.link.set_waiting(false);
        let Some(message) = self.session.in_flight.take() else {
            return ReplyPoll::Idle;
        };

        if self.session.attempts < self.attempts_allowed() {
            warn!(
                "monitor {:x} attempt {} failed: {:?}",
                message.rca, self.session.attempts, error
            );
            return match self.launch(message) {
                Ok(()) => ReplyPoll::Pending,
                Err(e) => ReplyPoll::Failed(e),
            };
        }

        warn!("monitor {:x} dropped: {:?}", message.rca, error);
        self.session.timed_out = true;
        ReplyPoll::Failed(error)
    }

    /// One pass of the background loop: advance the outstanding monitor
    /// exchange, or take the next queued transaction.
    pub fn service<M: RawMutex, const N: usize, S: ReplySink>(
        &mut self,
        queue: &TransactionQueue<M, N>,
        sink: &mut S,
    ) -> Service {
        if self.session.in_flight.is_some() {
            return match self.poll_reply() {
                ReplyPoll::Idle => Service::Idle,
                ReplyPoll::Pending => Service::Waiting,
                ReplyPoll::Complete(reply) => {
                    sink.send_reply(&reply);
                    Service::Replied
                }
                ReplyPoll::Failed(_) => Service::Dropped,
            };
        }

        let Some(mut message) = queue.dequeue() else {
            return Service::Idle;
        };
        trace!("bridging {:?}", message);

        match (message.direction, self.config.mode) {
            (Direction::Control, _) => match self.control(&message) {
                Ok(()) => Service::Forwarded,
                Err(_) => Service::Dropped,
            },
            (Direction::Monitor, BridgeMode::Blocking) => match self.monitor(&mut message) {
                Ok(()) => {
                    sink.send_reply(&message);
                    Service::Replied
                }
                Err(_) => Service::Dropped,
            },
            (Direction::Monitor, BridgeMode::EdgeTriggered) => match self.begin_monitor(message) {
                Ok(()) => Service::Waiting,
                Err(_) => Service::Dropped,
            },
        }
    }
}
