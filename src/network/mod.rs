//! Network Layer: socket I/O and the connection engine
//!
//! Design principles:
//! - One mio poll per worker thread, no locks on the data path
//! - A connection is owned by exactly one worker; hand-off moves it
//! - Would-block is a result, not an error
//!
//! `DataChannel` is usable on its own over any non-blocking descriptor.

mod channel;
mod server;
mod stats;
mod switch;
mod waiter;
mod worker;

pub use channel::{set_cork, DataChannel, Drained, ReadOutcome, WriteOutcome};
pub use server::Server;
pub use stats::{IoCounters, ServerStats};
