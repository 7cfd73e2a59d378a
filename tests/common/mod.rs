#![allow(dead_code)]

use std::collections::VecDeque;
use std::convert::Infallible;

use amb_bridge::bridge::{BusDirection, ParallelPort, ReplySink};
use amb_bridge::can::{BusStatus, CanController, CanEvent, Frame, LastErrorCode};
use amb_bridge::ds1820::{SensorError, Temperature, Thermometer};
use amb_bridge::message::Message;
use amb_bridge::node::Node;
use amb_bridge::registry::{Handler, Registrar, RegistryFull, Response};

pub const SERIAL: [u8; 8] = [0x10, 0x6B, 0x3A, 0x52, 0x01, 0x08, 0x00, 0x9E];

/// Controller double: scripted events in, transmitted frames out.
#[derive(Default)]
pub struct MockCan {
    pub events: VecDeque<CanEvent>,
    pub transmitted: Vec<Frame>,
    pub identify_sent: usize,
    pub status_interrupts: bool,
    pub status_register: u8,
    pub configured: Option<(u32, [u8; 8])>,
}

impl MockCan {
    pub fn push_frame(&mut self, id: u32, data: &[u8]) {
        self.events.push_back(CanEvent::Frame {
            frame: Frame::from_raw(id, data).unwrap(),
            lost: false,
        });
    }

    pub fn push_status(&mut self, tx_ok: bool, last_error: LastErrorCode) {
        self.events.push_back(CanEvent::Status(BusStatus {
            tx_ok,
            last_error,
            ..Default::default()
        }));
    }

    pub fn push_identify(&mut self) {
        self.events.push_back(CanEvent::Identify { lost: false });
    }

    pub fn replies(&self) -> Vec<(u32, Vec<u8>)> {
        self.transmitted
            .iter()
            .map(|frame| (frame.raw_id(), frame.payload().to_vec()))
            .collect()
    }
}

impl CanController for MockCan {
    type Error = Infallible;

    fn configure_filters(
        &mut self,
        base_address: u32,
        serial_number: &[u8; 8],
    ) -> Result<(), Self::Error> {
        self.configured = Some((base_address, *serial_number));
        Ok(())
    }

    fn receive(&mut self) -> Result<Option<CanEvent>, Self::Error> {
        Ok(self.events.pop_front())
    }

    fn transmit(&mut self, frame: &Frame) -> Result<(), Self::Error> {
        self.transmitted.push(frame.clone());
        Ok(())
    }

    fn send_identify(&mut self) -> Result<(), Self::Error> {
        self.identify_sent += 1;
        Ok(())
    }

    fn set_status_interrupts(&mut self, enabled: bool) -> Result<(), Self::Error> {
        self.status_interrupts = enabled;
        Ok(())
    }

    fn status(&mut self) -> Result<u8, Self::Error> {
        Ok(self.status_register)
    }
}

/// Downstream device double. Accepts every written byte unless stalled and
/// answers each monitor turnaround with the next scripted reply (length byte
/// first). `None` models a device that never answers.
pub struct MockPort {
    pub direction: BusDirection,
    pub request: bool,
    pub requests: usize,
    pub written: Vec<u8>,
    pub replies: VecDeque<Option<Vec<u8>>>,
    pub stall_writes: bool,
    pub pulses: usize,
    pub ready: bool,
    pub select_toggles: usize,
    current: VecDeque<u8>,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            direction: BusDirection::Output,
            request: false,
            requests: 0,
            written: Vec::new(),
            replies: VecDeque::new(),
            stall_writes: false,
            pulses: 0,
            ready: true,
            select_toggles: 0,
            current: VecDeque::new(),
        }
    }

    pub fn with_replies<I: IntoIterator<Item = Option<Vec<u8>>>>(replies: I) -> Self {
        let mut port = Self::new();
        port.replies.extend(replies);
        port
    }

    pub fn has_reply_byte(&self) -> bool {
        self.direction == BusDirection::Input && !self.current.is_empty()
    }
}

impl ParallelPort for MockPort {
    fn set_request(&mut self, asserted: bool) {
        if asserted && !self.request {
            self.requests += 1;
        }
        self.request = asserted;
    }

    fn strobe_settled(&mut self) -> bool {
        match self.direction {
            BusDirection::Output => !self.stall_writes,
            BusDirection::Input => !self.current.is_empty(),
        }
    }

    fn set_bus_direction(&mut self, direction: BusDirection) {
        if direction == BusDirection::Input && self.direction == BusDirection::Output {
            self.current = self
                .replies
                .pop_front()
                .flatten()
                .map(VecDeque::from)
                .unwrap_or_default();
        }
        self.direction = direction;
    }

    fn write_data(&mut self, value: u8) {
        self.written.push(value);
    }

    fn read_data(&mut self) -> u8 {
        self.current.pop_front().unwrap_or(0xFF)
    }

    fn pulse_wait(&mut self) {
        self.pulses += 1;
    }

    fn downstream_ready(&mut self) -> bool {
        self.ready
    }

    fn set_select(&mut self, _high: bool) {
        self.select_toggles += 1;
    }
}

/// Reply bytes for a range query: length, low LE, high LE.
pub fn range_reply(low: u32, high: u32) -> Option<Vec<u8>> {
    let mut reply = vec![8];
    reply.extend_from_slice(&low.to_le_bytes());
    reply.extend_from_slice(&high.to_le_bytes());
    Some(reply)
}

pub struct MockThermometer {
    pub id: Result<[u8; 8], SensorError>,
    pub reading: Result<Temperature, SensorError>,
}

impl Thermometer for MockThermometer {
    fn read_unique_id(&mut self) -> Result<[u8; 8], SensorError> {
        self.id
    }

    fn read_temperature(&mut self) -> Result<Temperature, SensorError> {
        self.reading
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub replies: Vec<Message>,
}

impl ReplySink for RecordingSink {
    fn send_reply(&mut self, reply: &Message) {
        self.replies.push(reply.clone());
    }
}

/// Sends bridge replies back out through the node, as the firmware does.
pub struct CanReplies<'x, 'a, C, const N: usize> {
    pub node: &'x Node<'a, N>,
    pub can: &'x mut C,
}

impl<C: CanController, const N: usize> ReplySink for CanReplies<'_, '_, C, N> {
    fn send_reply(&mut self, reply: &Message) {
        self.node.transmit_reply(reply, self.can).unwrap();
    }
}

/// Answers monitor requests with a fixed payload.
pub struct Fixed(pub &'static [u8]);

impl Handler for Fixed {
    fn handle(&self, message: &mut Message) -> Response {
        message.set_reply(self.0).unwrap();
        Response::Reply
    }
}

/// Counts calls and never replies.
#[derive(Default)]
pub struct Silent {
    pub calls: std::sync::atomic::AtomicUsize,
}

impl Handler for Silent {
    fn handle(&self, _message: &mut Message) -> Response {
        self.calls.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Response::NoReply
    }
}

/// Wraps a registrar and counts rollbacks.
pub struct Counting<'r, R> {
    pub inner: &'r mut R,
    pub registered: usize,
    pub unregistered: usize,
}

impl<'r, R> Counting<'r, R> {
    pub fn new(inner: &'r mut R) -> Self {
        Self {
            inner,
            registered: 0,
            unregistered: 0,
        }
    }
}

impl<'a, R: Registrar<'a>> Registrar<'a> for Counting<'_, R> {
    fn register(
        &mut self,
        low_address: u32,
        high_address: u32,
        handler: &'a (dyn Handler + Sync),
    ) -> Result<(), RegistryFull> {
        self.inner.register(low_address, high_address, handler)?;
        self.registered += 1;
        Ok(())
    }

    fn unregister_last(&mut self) -> bool {
        self.unregistered += 1;
        self.inner.unregister_last()
    }
}
