//! Shared I/O counters
//!
//! Injected into every `DataChannel` instead of living in globals, so tests
//! can observe one server (or one socket pair) in isolation.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct IoCounters {
    send_file_bytes: AtomicU64,
    send_buffer_bytes: AtomicU64,
    recv_buffer_bytes: AtomicU64,
}

impl IoCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    #[inline(always)]
    pub(crate) fn add_send_file(&self, n: usize) {
        self.send_file_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn add_send_buffer(&self, n: usize) {
        self.send_buffer_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    #[inline(always)]
    pub(crate) fn add_recv_buffer(&self, n: usize) {
        self.recv_buffer_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    /// Bytes sent with `sendfile`
    pub fn send_file_bytes(&self) -> u64 {
        self.send_file_bytes.load(Ordering::Relaxed)
    }

    /// Bytes sent from memory buffers
    pub fn send_buffer_bytes(&self) -> u64 {
        self.send_buffer_bytes.load(Ordering::Relaxed)
    }

    /// Bytes received into memory buffers
    pub fn recv_buffer_bytes(&self) -> u64 {
        self.recv_buffer_bytes.load(Ordering::Relaxed)
    }
}

/// Server-wide connection statistics
#[derive(Debug, Default)]
pub struct ServerStats {
    pub io: Arc<IoCounters>,
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    connections_rejected: AtomicU64,
    handoffs: AtomicU64,
    handoff_failures: AtomicU64,
    timeouts: AtomicU64,
}

impl ServerStats {
    pub fn new(io: Arc<IoCounters>) -> Self {
        Self {
            io,
            ..Default::default()
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handoff(&self) {
        self.handoffs.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn handoff_failed(&self) {
        self.handoff_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn timed_out(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn connections_active(&self) -> u64 {
        self.connections_active.load(Ordering::Relaxed)
    }

    pub fn connections_rejected(&self) -> u64 {
        self.connections_rejected.load(Ordering::Relaxed)
    }

    pub fn handoffs(&self) -> u64 {
        self.handoffs.load(Ordering::Relaxed)
    }

    pub fn handoff_failures(&self) -> u64 {
        self.handoff_failures.load(Ordering::Relaxed)
    }

    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Emit a one-line summary at INFO level
    pub fn log_summary(&self) {
        tracing::info!(
            active = self.connections_active(),
            total = self.connections_total(),
            rejected = self.connections_rejected(),
            handoffs = self.handoffs(),
            handoff_failures = self.handoff_failures(),
            timeouts = self.timeouts(),
            recv_bytes = self.io.recv_buffer_bytes(),
            sent_bytes = self.io.send_buffer_bytes(),
            sent_file_bytes = self.io.send_file_bytes(),
            "server stats"
        );
    }
}
