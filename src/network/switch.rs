//! Moving connections between worker threads
//!
//! Every worker owns a bounded intake queue and a `Waker` registered on its
//! poll. The source thread deregisters the socket before it sends, and the
//! target registers it after it receives, so only one thread ever drives a
//! given handler.

use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use mio::{Interest, Waker};
use tracing::warn;

use super::waiter::Waiter;
use crate::error::SwitchFailure;

/// A connection in transit, with the interest to register on arrival
pub(crate) struct Takeover {
    pub(crate) waiter: Waiter,
    pub(crate) interest: Interest,
}

struct Lane<T> {
    sender: Sender<T>,
    waker: Arc<Waker>,
}

/// Intake queue of one worker
pub(crate) fn intake<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    bounded(capacity)
}

/// Senders for every worker, indexed by thread index
pub(crate) struct Switchboard<T = Takeover> {
    lanes: Arc<[Lane<T>]>,
}

impl<T> Clone for Switchboard<T> {
    fn clone(&self) -> Self {
        Self {
            lanes: Arc::clone(&self.lanes),
        }
    }
}

impl<T> Switchboard<T> {
    pub(crate) fn new(lanes: Vec<(Sender<T>, Arc<Waker>)>) -> Self {
        Self {
            lanes: lanes
                .into_iter()
                .map(|(sender, waker)| Lane { sender, waker })
                .collect(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.lanes.len()
    }

    /// Queue `item` for `thread_index` and wake that thread.
    ///
    /// On failure the item comes back so the caller can notify and close it.
    pub(crate) fn transfer(&self, thread_index: u16, item: T) -> Result<(), (SwitchFailure, T)> {
        let Some(lane) = self.lanes.get(thread_index as usize) else {
            return Err((SwitchFailure::NoSuchThread { thread_index }, item));
        };

        match lane.sender.try_send(item) {
            Ok(()) => {}
            Err(TrySendError::Full(item)) => {
                return Err((SwitchFailure::Overflow { thread_index }, item))
            }
            Err(TrySendError::Disconnected(item)) => {
                return Err((SwitchFailure::NoSuchThread { thread_index }, item))
            }
        }

        // The target still polls with a timeout, so a lost wake-up only delays
        if let Err(err) = lane.waker.wake() {
            warn!(thread = thread_index, error = %err, "failed to wake worker");
        }
        Ok(())
    }

    /// Wake every worker, e.g. to notice a stop flag
    pub(crate) fn wake_all(&self) {
        for (index, lane) in self.lanes.iter().enumerate() {
            if let Err(err) = lane.waker.wake() {
                warn!(thread = index, error = %err, "failed to wake worker");
            }
        }
    }
}
