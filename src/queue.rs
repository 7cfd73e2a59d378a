//! Bounded hand-off from the CAN interrupt to the bridge loop.
//!
//! One producer (the interrupt-side forwarding handler) and one consumer
//! (the background bridge loop). A full queue overwrites its oldest entry
//! and raises a sticky overflow flag; the producer never blocks.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use portable_atomic::{AtomicBool, Ordering};

use crate::message::Message;

pub struct TransactionQueue<M: RawMutex, const N: usize> {
    channel: Channel<M, Message, N>,
    overflow: AtomicBool,
}

impl<M: RawMutex, const N: usize> TransactionQueue<M, N> {
    pub const fn new() -> Self {
        Self {
            channel: Channel::new(),
            overflow: AtomicBool::new(false),
        }
    }

    /// Never blocks. On a full queue the oldest message is dropped.
    pub fn enqueue(&self, message: Message) {
        if let Err(TrySendError::Full(message)) = self.channel.try_send(message) {
            // drop-oldest and insert must not interleave with the consumer
            critical_section::with(|_| {
                self.overflow.store(true, Ordering::Release);
                let _ = self.channel.try_receive();
                if self.channel.try_send(message).is_err() {
                    error!("transaction queue rejected message after drop");
                }
            });
            error!("transaction queue overflow");
        }
    }

    /// Takes the oldest message, if any. The message is copied out before
    /// its slot is released to the producer.
    pub fn dequeue(&self) -> Option<Message> {
        self.channel.try_receive().ok()
    }

    pub fn is_empty(&self) -> bool {
        self.channel.is_empty()
    }

    pub fn len(&self) -> usize {
        self.channel.len()
    }

    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Acquire)
    }

    /// Reads and clears the overflow flag.
    pub fn take_overflow(&self) -> bool {
        self.overflow.swap(false, Ordering::AcqRel)
    }
}

impl<M: RawMutex, const N: usize> Default for TransactionQueue<M, N> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;

    fn control(rca: u32, value: u8) -> Message {
        Message::new(rca, &[value]).unwrap()
    }

    #[test]
    fn fifo_order() {
        let queue = TransactionQueue::<CriticalSectionRawMutex, 4>::new();
        queue.enqueue(control(1, 1));
        queue.enqueue(Message::monitor(2));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dequeue(), Some(control(1, 1)));
        assert_eq!(queue.dequeue(), Some(Message::monitor(2)));
        assert_eq!(queue.dequeue(), None);
        assert!(!queue.overflowed());
    }

    #[test]
    fn overflow_drops_oldest() {
        let queue = TransactionQueue::<CriticalSectionRawMutex, 3>::new();
        for value in 0..4 {
            queue.enqueue(control(0x100, value));
        }
        assert!(queue.overflowed());
        assert_eq!(queue.len(), 3);
        for value in 1..4 {
            assert_eq!(queue.dequeue(), Some(control(0x100, value)));
        }
        assert!(queue.is_empty());

        assert!(queue.take_overflow());
        assert!(!queue.overflowed());
    }
}
