// ============================================
// File: crates/nthlink-vpn/src/adapters.rs
// ============================================
//! # Transport Adapters
//!
//! ## Creation Reason
//! The transport client needs two capabilities from the tunnel: a place
//! to write inbound packets and a way to keep its own sockets out of the
//! tunnel. Both are backed by the session's device.
//!
//! ## Main Functionality
//! - `PacketSink` / `DeviceSink`: inbound packets to the device
//! - `SocketProtector` / `DeviceProtector`: socket exclusion
//!
//! ## ⚠️ Important Note for Next Developer
//! - Both adapters hold a `Weak` device handle. The session owns the only
//!   strong reference, so a transport that keeps an adapter past stop
//!   cannot keep the device open
//! - Sink errors are logged and swallowed; they never reach the transport
//!
//! ## Last Modified
//! v0.1.0 - Initial adapters

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use nthlink_tun::{SocketHandle, TunDevice};

use crate::error::TunnelError;

// ============================================
// PacketSink
// ============================================

/// Destination for packets arriving from the remote side.
pub trait PacketSink: Send + Sync {
    /// Writes one IP packet toward local applications. Never fails from
    /// the caller's point of view.
    fn write_packet(&self, packet: &[u8]);
}

/// [`PacketSink`] writing into the tunnel device.
pub struct DeviceSink {
    device: Weak<dyn TunDevice>,
    written: AtomicU64,
    dropped: AtomicU64,
}

impl DeviceSink {
    /// Creates a sink for `device`.
    #[must_use]
    pub fn new(device: &Arc<dyn TunDevice>) -> Self {
        Self {
            device: Arc::downgrade(device),
            written: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Packets written to the device.
    #[must_use]
    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    /// Packets that could not be written.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl PacketSink for DeviceSink {
    fn write_packet(&self, packet: &[u8]) {
        let Some(device) = self.device.upgrade() else {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(len = packet.len(), "Inbound packet dropped, tunnel device released");
            return;
        };

        match device.write(packet) {
            Ok(_) => {
                self.written.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                let err = TunnelError::PacketWrite(e);
                debug!(error = %err, len = packet.len(), "Inbound packet dropped");
            }
        }
    }
}

// ============================================
// SocketProtector
// ============================================

/// Excludes transport sockets from tunnel capture.
pub trait SocketProtector: Send + Sync {
    /// Returns `true` if `socket` now bypasses the tunnel.
    fn protect(&self, socket: SocketHandle) -> bool;
}

/// [`SocketProtector`] delegating to the tunnel device.
pub struct DeviceProtector {
    device: Weak<dyn TunDevice>,
}

impl DeviceProtector {
    /// Creates a protector for `device`.
    #[must_use]
    pub fn new(device: &Arc<dyn TunDevice>) -> Self {
        Self {
            device: Arc::downgrade(device),
        }
    }
}

impl SocketProtector for DeviceProtector {
    fn protect(&self, socket: SocketHandle) -> bool {
        let Some(device) = self.device.upgrade() else {
            warn!(socket, "Cannot protect socket, tunnel device released");
            return false;
        };

        let protected = device.protect(socket);
        if protected {
            debug!(socket, device = device.name(), "Socket protected");
        } else {
            warn!(socket, device = device.name(), "Failed to protect socket");
        }
        protected
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;
    use nthlink_tun::{DeviceRequest, MockTun};

    fn mock_device() -> (Arc<MockTun>, Arc<dyn TunDevice>) {
        let tun = Arc::new(MockTun::new(DeviceRequest::default()));
        let device: Arc<dyn TunDevice> = tun.clone();
        (tun, device)
    }

    #[test]
    fn test_sink_writes_to_device() {
        let (tun, device) = mock_device();
        let sink = DeviceSink::new(&device);

        sink.write_packet(&[0x45, 0, 0, 20]);
        sink.write_packet(&[0x45, 0, 0, 21]);

        assert_eq!(tun.take_written_packets().len(), 2);
        assert_eq!(sink.written(), 2);
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn test_sink_swallows_write_errors() {
        let (tun, device) = mock_device();
        let sink = DeviceSink::new(&device);

        tun.set_fail_writes(true);
        sink.write_packet(&[1, 2, 3]);

        assert!(tun.take_written_packets().is_empty());
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_sink_does_not_keep_device_alive() {
        let (tun, device) = mock_device();
        let sink = DeviceSink::new(&device);
        drop(device);
        drop(tun);

        sink.write_packet(&[1, 2, 3]);
        assert_eq!(sink.dropped(), 1);
    }

    #[test]
    fn test_protector_delegates() {
        let (tun, device) = mock_device();
        let protector = DeviceProtector::new(&device);

        assert!(protector.protect(10));
        tun.set_protect_result(false);
        assert!(!protector.protect(11));

        assert_eq!(tun.protected_sockets(), vec![10, 11]);
    }

    #[test]
    fn test_protector_after_release() {
        let (tun, device) = mock_device();
        let protector = DeviceProtector::new(&device);
        drop(device);
        drop(tun);

        assert!(!protector.protect(3));
    }
}
