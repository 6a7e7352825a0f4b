// ============================================
// File: crates/nthlink-vpn/src/pump.rs
// ============================================
//! # Packet Pump
//!
//! ## Creation Reason
//! Outbound packets have to be read from the device one at a time with a
//! blocking read and handed to the transport client. The pump owns that
//! loop for exactly one session.
//!
//! ## Main Functionality
//! - `PacketPump`: read/forward loop on a blocking worker thread
//! - `CancelToken`: one-shot stop signal shared with the controller
//! - `PumpTask`: handle used to cancel and join the worker
//! - `PumpStats`: per-session counters
//!
//! ## Loop Rules
//! ```text
//! read ──► Ok(0)              ──► ignore
//!      ──► Ok(n)              ──► forward buf[..n] (unless cancelled)
//!      ──► Err, cancelled     ──► exit quietly
//!      ──► Err, retryable     ──► log, back off, continue
//!      ──► Err, anything else ──► exit, report fatal once
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - Delivery happens while holding the token's gate. `cancel()` takes the
//!   same gate, so once it returns no further packet reaches the
//!   transport
//! - The gate can be held for as long as a transport write takes, so
//!   async callers go through `PumpTask::cancel`, which waits for it on
//!   the blocking pool
//! - Cancelling alone does not unblock a pending read; the controller
//!   closes the device right after cancelling
//! - A transport write error drops that one packet and nothing else
//!
//! ## Last Modified
//! v0.1.0 - Initial pump
//! v0.1.1 - Async `PumpTask::cancel`, non-blocking `signal_cancel`

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use nthlink_tun::TunDevice;

use crate::error::TunnelError;
use crate::transport::TransportClient;

/// Pause after a transient read error, so a misbehaving device cannot
/// spin the worker.
const TRANSIENT_BACKOFF: Duration = Duration::from_millis(10);

// ============================================
// CancelToken
// ============================================

/// One-shot cancellation flag with a delivery gate.
#[derive(Debug, Default)]
pub struct CancelToken {
    cancelled: AtomicBool,
    gate: Mutex<()>,
}

impl CancelToken {
    /// Creates an uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancels the token. Waits for an in-flight delivery to finish.
    pub fn cancel(&self) {
        let _gate = self.gate.lock();
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Sets the flag without waiting for an in-flight delivery.
    pub fn signal(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns `true` once the token was cancelled or signalled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Runs `f` unless cancelled, excluding a concurrent `cancel()`.
    fn run_unless_cancelled<R>(&self, f: impl FnOnce() -> R) -> Option<R> {
        let _gate = self.gate.lock();
        if self.is_cancelled() {
            None
        } else {
            Some(f())
        }
    }
}

// ============================================
// PumpStats
// ============================================

/// Counters for one pump run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    /// Packets accepted by the transport.
    pub packets_forwarded: u64,
    /// Bytes accepted by the transport.
    pub bytes_forwarded: u64,
    /// Packets the transport rejected.
    pub packets_dropped: u64,
    /// Transient read errors skipped.
    pub transient_errors: u64,
}

/// Why a pump run ended.
#[derive(Debug)]
pub enum PumpExit {
    /// The session was stopped.
    Cancelled,
    /// The device failed; carries `TunnelError::PacketReadFatal`.
    Fatal(TunnelError),
}

// ============================================
// PacketPump
// ============================================

/// Device-to-transport forwarding loop for one session.
pub struct PacketPump {
    device: Arc<dyn TunDevice>,
    transport: Arc<dyn TransportClient>,
    cancel: Arc<CancelToken>,
    buffer: Vec<u8>,
    stats: PumpStats,
}

impl PacketPump {
    /// Creates a pump with a read buffer of `capacity` bytes.
    #[must_use]
    pub fn new(
        device: Arc<dyn TunDevice>,
        transport: Arc<dyn TransportClient>,
        cancel: Arc<CancelToken>,
        capacity: usize,
    ) -> Self {
        Self {
            device,
            transport,
            cancel,
            buffer: vec![0u8; capacity],
            stats: PumpStats::default(),
        }
    }

    /// Runs the loop on the calling thread until cancelled or a fatal
    /// read error.
    pub fn run(&mut self) -> PumpExit {
        debug!(device = self.device.name(), "Packet pump started");

        loop {
            if self.cancel.is_cancelled() {
                return PumpExit::Cancelled;
            }

            match self.device.read(&mut self.buffer) {
                Ok(0) => {}
                Ok(len) => {
                    if !self.forward(len) {
                        return PumpExit::Cancelled;
                    }
                }
                Err(e) if self.cancel.is_cancelled() => {
                    debug!(error = %e, "Read interrupted by teardown");
                    return PumpExit::Cancelled;
                }
                Err(e) if e.is_retryable() => {
                    self.stats.transient_errors += 1;
                    warn!(error = %TunnelError::PacketReadTransient(e), "Skipping failed read");
                    std::thread::sleep(TRANSIENT_BACKOFF);
                }
                Err(e) => {
                    let err = TunnelError::PacketReadFatal(e);
                    error!(error = %err, "Packet pump stopped");
                    return PumpExit::Fatal(err);
                }
            }
        }
    }

    /// Hands `buffer[..len]` to the transport. Returns `false` if the
    /// token was cancelled first.
    fn forward(&mut self, len: usize) -> bool {
        let packet = &self.buffer[..len];
        let transport = &self.transport;

        match self.cancel.run_unless_cancelled(|| transport.write_packet(packet)) {
            None => false,
            Some(Ok(())) => {
                self.stats.packets_forwarded += 1;
                self.stats.bytes_forwarded += len as u64;
                true
            }
            Some(Err(e)) => {
                self.stats.packets_dropped += 1;
                debug!(error = %e, len, "Transport dropped outbound packet");
                true
            }
        }
    }

    /// Returns the counters so far.
    #[must_use]
    pub fn stats(&self) -> PumpStats {
        self.stats
    }

    /// Moves the pump onto a blocking worker.
    ///
    /// `on_fatal` runs on the worker, at most once, if the loop ends with
    /// a fatal read error. Must be called within a Tokio runtime.
    pub fn spawn<F>(mut self, on_fatal: F) -> PumpTask
    where
        F: FnOnce(TunnelError) + Send + 'static,
    {
        let cancel = Arc::clone(&self.cancel);
        let handle = tokio::task::spawn_blocking(move || {
            let exit = self.run();
            let stats = self.stats();
            debug!(
                forwarded = stats.packets_forwarded,
                bytes = stats.bytes_forwarded,
                dropped = stats.packets_dropped,
                transient = stats.transient_errors,
                "Packet pump exiting"
            );
            if let PumpExit::Fatal(err) = exit {
                on_fatal(err);
            }
            stats
        });

        PumpTask { cancel, handle }
    }
}

// ============================================
// PumpTask
// ============================================

/// Handle to a spawned pump.
#[derive(Debug)]
pub struct PumpTask {
    cancel: Arc<CancelToken>,
    handle: JoinHandle<PumpStats>,
}

impl PumpTask {
    /// Cancels the pump and waits until no delivery is in flight. Does
    /// not wait for the worker to exit.
    pub async fn cancel(&self) {
        let token = Arc::clone(&self.cancel);
        if let Err(e) = tokio::task::spawn_blocking(move || token.cancel()).await {
            warn!(error = %e, "Cancel did not complete, signalling instead");
            self.cancel.signal();
        }
    }

    /// Cancels the pump without blocking. An in-flight delivery may still
    /// complete after this returns.
    pub fn signal_cancel(&self) {
        self.cancel.signal();
    }

    /// Waits for the worker to return.
    ///
    /// # Errors
    /// Returns `TunnelError::Internal` if the worker panicked.
    pub async fn join(self) -> Result<PumpStats, TunnelError> {
        self.handle
            .await
            .map_err(|e| TunnelError::internal(format!("packet pump worker failed: {e}")))
    }
}

// ============================================
// Tests
// ============================================
