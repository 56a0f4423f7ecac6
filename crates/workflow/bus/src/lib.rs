//! Message bus for workflow lifecycle and watch events.
//!
//! The bus is a topic-addressed publish/subscribe channel with
//! at-least-once delivery. Subscribers receive each message together with
//! an [`Ack`]; a message whose `Ack` is dropped without acknowledging it is
//! delivered again.
//!
//! Topics come in two flavors:
//! - **queue** topics hand each message to exactly one subscriber, so
//!   several workers can compete for the same stream of events
//! - **fan-out** topics hand each message to every subscriber, in publish
//!   order

#![deny(unsafe_code)]
#![warn(rust_2018_idioms)]

mod error;
mod handler;
pub mod memory;
mod message;

pub use error::{BusError, BusResult};
pub use handler::{handler_fn, EventHandler, FnHandler, MessageBus};
pub use memory::{InMemoryBus, InMemoryBusConfig};
pub use message::{Ack, BusEvent, BusMessage, SubscriptionId};
