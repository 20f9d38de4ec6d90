//! Simulated time
//!
//! [`LogicalClock`] holds a monotonically non-decreasing timestamp. The
//! driver keeps two of them: one for the current tick boundary and one
//! for fine-grained clock time within a tick.
//!
//! [`sync_ticker`] builds the single-subscriber rendezvous that delivers
//! ticks from the tick-issuing loop to the event-processing loop.

mod logical;
mod ticker;

pub use logical::LogicalClock;
pub use ticker::{sync_ticker, Tick, TickTrigger, Ticker};
