//! Address range to handler table.
//!
//! Lookups walk entries in registration order and stop at the first range
//! that contains the address, so earlier registrations shadow later
//! overlapping ones.

use core::fmt;

use heapless::Vec;

use crate::message::Message;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response {
    /// Send `message.data` back as the monitor reply.
    Reply,
    NoReply,
}

/// Application callback for a registered address range.
///
/// Runs in interrupt context and must not block.
pub trait Handler {
    fn handle(&self, message: &mut Message) -> Response;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RegistryFull;

#[derive(Clone, Copy)]
pub struct CallbackEntry<'a> {
    pub low_address: u32,
    pub high_address: u32,
    handler: &'a (dyn Handler + Sync),
}

impl<'a> CallbackEntry<'a> {
    pub fn contains(&self, rca: u32) -> bool {
        (self.low_address..=self.high_address).contains(&rca)
    }

    pub fn handler(&self) -> &'a (dyn Handler + Sync) {
        self.handler
    }
}

impl fmt::Debug for CallbackEntry<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackEntry")
            .field("low_address", &self.low_address)
            .field("high_address", &self.high_address)
            .finish()
    }
}

/// Anything that can take range registrations during setup.
pub trait Registrar<'a> {
    fn register(
        &mut self,
        low_address: u32,
        high_address: u32,
        handler: &'a (dyn Handler + Sync),
    ) -> Result<(), RegistryFull>;

    /// Removes the most recent registration. Returns `false` if empty.
    fn unregister_last(&mut self) -> bool;
}

pub struct CallbackRegistry<'a, const N: usize> {
    entries: Vec<CallbackEntry<'a>, N>,
}

impl<'a, const N: usize> CallbackRegistry<'a, N> {
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn register(
        &mut self,
        low_address: u32,
        high_address: u32,
        handler: &'a (dyn Handler + Sync),
    ) -> Result<(), RegistryFull> {
        self.entries
            .push(CallbackEntry {
                low_address,
                high_address,
                handler,
            })
            .map_err(|_| {
                error!(
                    "callback registry full, dropping {:x}..={:x}",
                    low_address, high_address
                );
                RegistryFull
            })
    }

    pub fn unregister_last(&mut self) -> Option<(u32, u32)> {
        self.entries
            .pop()
            .map(|entry| (entry.low_address, entry.high_address))
    }

    pub fn find(&self, rca: u32) -> Option<&CallbackEntry<'a>> {
        self.entries.iter().find(|entry| entry.contains(rca))
    }

    pub fn ranges(&self) -> impl Iterator<Item = (u32, u32)> + '_ {
        self.entries
            .iter()
            .map(|entry| (entry.low_address, entry.high_address))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        N
    }
}

impl<const N: usize> Default for CallbackRegistry<'_, N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<'a, const N: usize> Registrar<'a> for CallbackRegistry<'a, N> {
    fn register(
        &mut self,
        low_address: u32,
        high_address: u32,
        handler: &'a (dyn Handler + Sync),
    ) -> Result<(), RegistryFull> {
        CallbackRegistry::register(self, low_address, high_address, handler)
    }

    fn unregister_last(&mut self) -> bool {
        CallbackRegistry::unregister_last(self).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_atomic::{AtomicU32, Ordering};

    struct Tagged {
        tag: u8,
        calls: AtomicU32,
    }

    impl Tagged {
        const fn new(tag: u8) -> Self {
            Self {
                tag,
                calls: AtomicU32::new(0),
            }
        }
    }

    impl Handler for Tagged {
        fn handle(&self, message: &mut Message) -> Response {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let _ = message.set_reply(&[self.tag]);
            Response::Reply
        }
    }

    #[test]
    fn first_registered_range_wins() {
        let wide = Tagged::new(1);
        let narrow = Tagged::new(2);
        let mut registry = CallbackRegistry::<4>::new();
        registry.register(0x100, 0x1FF, &wide).unwrap();
        registry.register(0x150, 0x15F, &narrow).unwrap();

        let mut message = Message::monitor(0x155);
        registry.find(0x155).unwrap().handler().handle(&mut message);
        assert_eq!(message.data.as_slice(), &[1]);
        assert_eq!(narrow.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn bounds_are_inclusive() {
        let handler = Tagged::new(0);
        let mut registry = CallbackRegistry::<1>::new();
        registry.register(0x20, 0x2F, &handler).unwrap();
        assert!(registry.find(0x1F).is_none());
        assert!(registry.find(0x20).is_some());
        assert!(registry.find(0x2F).is_some());
        assert!(registry.find(0x30).is_none());
    }

    #[test]
    fn full_registry_is_unchanged() {
        let handler = Tagged::new(0);
        let mut registry = CallbackRegistry::<2>::new();
        registry.register(0, 1, &handler).unwrap();
        registry.register(2, 3, &handler).unwrap();
        assert_eq!(registry.register(4, 5, &handler), Err(RegistryFull));
        assert_eq!(registry.len(), 2);
        assert!(registry.find(4).is_none());
    }

    #[test]
    fn unregister_last_pops_newest() {
        let handler = Tagged::new(0);
        let mut registry = CallbackRegistry::<3>::new();
        registry.register(0, 1, &handler).unwrap();
        registry.register(2, 3, &handler).unwrap();
        assert_eq!(registry.unregister_last(), Some((2, 3)));
        assert!(Registrar::unregister_last(&mut registry));
        assert!(!Registrar::unregister_last(&mut registry));
        assert!(registry.is_empty());
    }
}
