//! CAN monitor and control slave that bridges its address window to a
//! downstream device over a byte-wide handshake link.
//!
//! ```text
//!  CAN bus ─► CanController ─► Node (interrupt)
//!                                │  reserved points, fixed bridge points
//!                                ▼
//!                         CallbackRegistry ─► ForwardHandler
//!                                                 │
//!                                        TransactionQueue
//!                                                 │
//!                       ReplySink ◄── Bridge (background loop) ─► ParallelPort
//! ```
//!
//! The core is `no_std` and hardware agnostic; the board binary wires it to
//! an RP2350, an SPI attached 82527 and a DS1820.

#![cfg_attr(not(test), no_std)]

// This mod MUST go first, so that the others see its macros.
pub(crate) mod fmt;

pub mod bridge;
pub mod can;
pub mod config;
pub mod ds1820;
pub mod handlers;
pub mod i82527;
pub mod identity;
pub mod link;
pub mod message;
pub mod node;
pub mod queue;
pub mod registry;
pub mod setup;

pub use bridge::{Bridge, ParallelPort, ReplySink};
pub use can::{CanController, CanEvent, Frame};
pub use message::{Direction, Message};
pub use node::{Dispatch, Node};
pub use queue::TransactionQueue;
pub use registry::{CallbackRegistry, Handler, Registrar, Response};
