//! Burst forwarding between shared transports.
//!
//! A [`Forwarder`] polls a [`BurstSource`], pushes each burst into a
//! [`BurstSink`], re-offers whatever the sink did not take, and hands items
//! it gives up on to a [`Reclaim`] (normally the pool they came from).

mod backoff;
mod forwarder;
mod nic;
mod shutdown;
mod trace;
mod transport;

pub use backoff::{Backoff, IdleBackoff};
pub use forwarder::{ForwardStats, Forwarder, Pump, RemainderPolicy};
pub use nic::{Discard, Generator, frame_seq};
pub use shutdown::Shutdown;
pub use trace::init_tracing;
pub use transport::{BurstSink, BurstSource, Reclaim};
