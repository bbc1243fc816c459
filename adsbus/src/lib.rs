//! adsbus runtime: the reactor, transports and dispatch that move packets
//! between receivers, aggregators and consumers.
//!
//! Everything runs on one thread around [`Reactor`]. Only name lookups leave
//! it, on the [`resolver`] pool.

pub mod bus;
pub mod exec;
pub mod file;
pub mod flow;
pub mod incoming;
pub mod outgoing;
pub mod reactor;
pub mod receive;
pub mod resolver;
pub mod send;
pub mod stream;
pub mod sys;
pub mod wakeup;

pub use bus::{Bus, BusReactor, Route, Wakeup};
pub use flow::FlowCounts;
pub use reactor::{EventHandler, Reactor, Readiness, ShutdownHandle};
