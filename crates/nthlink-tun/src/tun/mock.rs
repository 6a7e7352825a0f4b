// ============================================
// File: crates/nthlink-tun/src/tun/mock.rs
// ============================================
//! # Mock TUN Device Implementation
//!
//! ## Creation Reason
//! Provides a mock device and provider for testing the tunnel core
//! without creating a real interface or holding CAP_NET_ADMIN.
//!
//! ## Main Functionality
//! - In-memory packet queue with blocking reads
//! - Scripted transient read errors
//! - Written-packet capture for verification
//! - Protect and close call accounting
//! - Provider that can be told to deny establishment
//!
//! ## Usage in Tests
//! ```ignore
//! use nthlink_tun::tun::MockTun;
//! use nthlink_tun::traits::{DeviceRequest, TunDevice};
//!
//! let tun = MockTun::new(DeviceRequest::default());
//! tun.inject_packet(b"test packet".to_vec());
//!
//! let mut buf = [0u8; 1500];
//! let len = tun.read(&mut buf).unwrap();
//! assert_eq!(&buf[..len], b"test packet");
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - This is for testing only - do not use in production
//! - Reads really block (Condvar), so drive them from a worker thread
//! - A non-blocking mock returns WouldBlock on an empty queue
//!
//! ## Last Modified
//! v0.1.0 - Initial mock implementation

use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Condvar, Mutex};

use crate::error::{DeviceError, Result};
use crate::traits::{DeviceProvider, DeviceRequest, SocketHandle, TunDevice};

// ============================================
// Constants
// ============================================

/// Maximum number of queued reads.
const MAX_QUEUE_SIZE: usize = 1000;

// ============================================
// MockRead
// ============================================

/// One scripted outcome of a `read()` call.
#[derive(Debug, Clone)]
enum MockRead {
    Packet(Vec<u8>),
    Error(io::ErrorKind),
}

// ============================================
// MockTun
// ============================================

/// Mock tunnel device for testing.
pub struct MockTun {
    /// Request the device was established with
    request: DeviceRequest,
    /// Scripted read outcomes
    read_queue: Mutex<VecDeque<MockRead>>,
    /// Wakes blocked readers on inject or close
    readable: Condvar,
    /// Packets that have been written (captured for verification)
    written: Mutex<Vec<Vec<u8>>>,
    /// Sockets passed to `protect()`
    protected: Mutex<Vec<SocketHandle>>,
    /// Result returned by `protect()`
    protect_ok: AtomicBool,
    /// Whether writes should fail
    fail_writes: AtomicBool,
    /// Whether reads block on an empty queue
    blocking: AtomicBool,
    /// Whether the device is closed
    closed: AtomicBool,
    /// Number of `close()` calls
    close_calls: AtomicUsize,
}

impl MockTun {
    /// Creates a new, open, non-blocking mock device.
    #[must_use]
    pub fn new(request: DeviceRequest) -> Self {
        Self {
            request,
            read_queue: Mutex::new(VecDeque::with_capacity(100)),
            readable: Condvar::new(),
            written: Mutex::new(Vec::new()),
            protected: Mutex::new(Vec::new()),
            protect_ok: AtomicBool::new(true),
            fail_writes: AtomicBool::new(false),
            blocking: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        }
    }

    /// Queues a packet to be returned by a later `read()`.
    ///
    /// # Panics
    /// Panics if the queue is full (> MAX_QUEUE_SIZE entries).
    pub fn inject_packet(&self, packet: Vec<u8>) {
        self.push(MockRead::Packet(packet));
    }

    /// Queues a read error of the given kind.
    pub fn inject_read_error(&self, kind: io::ErrorKind) {
        self.push(MockRead::Error(kind));
    }

    fn push(&self, read: MockRead) {
        let mut queue = self.read_queue.lock();
        assert!(queue.len() < MAX_QUEUE_SIZE, "Mock TUN read queue overflow");
        queue.push_back(read);
        drop(queue);
        self.readable.notify_one();
    }

    /// Takes all packets that have been written to the device.
    #[must_use]
    pub fn take_written_packets(&self) -> Vec<Vec<u8>> {
        std::mem::take(&mut *self.written.lock())
    }

    /// Returns the number of queued reads.
    #[must_use]
    pub fn pending_read_count(&self) -> usize {
        self.read_queue.lock().len()
    }

    /// Returns the sockets passed to `protect()` so far.
    #[must_use]
    pub fn protected_sockets(&self) -> Vec<SocketHandle> {
        self.protected.lock().clone()
    }

    /// Makes every later `protect()` return `ok`.
    pub fn set_protect_result(&self, ok: bool) {
        self.protect_ok.store(ok, Ordering::Release);
    }

    /// Makes every later `write()` fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Returns `true` if reads currently block.
    #[must_use]
    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    /// Returns how many times `close()` was called.
    #[must_use]
    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::Acquire)
    }

    /// Returns the request the device was created from.
    #[must_use]
    pub fn request(&self) -> &DeviceRequest {
        &self.request
    }
}

impl TunDevice for MockTun {
    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let mut queue = self.read_queue.lock();
        loop {
            if self.closed.load(Ordering::Acquire) {
                return Err(DeviceError::closed(&self.request.name));
            }

            match queue.pop_front() {
                Some(MockRead::Packet(packet)) => {
                    let len = packet.len().min(buf.len());
                    buf[..len].copy_from_slice(&packet[..len]);
                    return Ok(len);
                }
                Some(MockRead::Error(kind)) => {
                    return Err(DeviceError::ReadFailed {
                        source: io::Error::from(kind),
                    });
                }
                None if !self.is_blocking() => {
                    return Err(DeviceError::ReadFailed {
                        source: io::Error::from(io::ErrorKind::WouldBlock),
                    });
                }
                None => self.readable.wait(&mut queue),
            }
        }
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::closed(&self.request.name));
        }
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(DeviceError::WriteFailed {
                source: io::Error::new(io::ErrorKind::Other, "mock write failure"),
            });
        }
        self.written.lock().push(buf.to_vec());
        Ok(buf.len())
    }

    fn set_blocking(&self, blocking: bool) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(DeviceError::closed(&self.request.name));
        }
        self.blocking.store(blocking, Ordering::Release);
        Ok(())
    }

    fn protect(&self, socket: SocketHandle) -> bool {
        self.protected.lock().push(socket);
        self.protect_ok.load(Ordering::Acquire)
    }

    fn close(&self) -> Result<()> {
        self.close_calls.fetch_add(1, Ordering::AcqRel);
        // Take the queue lock so a reader between its closed check and
        // `wait` cannot miss the wakeup.
        let _queue = self.read_queue.lock();
        self.closed.store(true, Ordering::Release);
        self.readable.notify_all();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn name(&self) -> &str {
        &self.request.name
    }

    fn mtu(&self) -> u16 {
        self.request.mtu
    }
}

impl std::fmt::Debug for MockTun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTun")
            .field("name", &self.request.name)
            .field("mtu", &self.request.mtu)
            .field("closed", &self.is_closed())
            .field("pending_reads", &self.pending_read_count())
            .finish_non_exhaustive()
    }
}

impl Default for MockTun {
    fn default() -> Self {
        Self::new(DeviceRequest::default())
    }
}

// ============================================
// MockDeviceProvider
// ============================================

/// Provider that hands out [`MockTun`] devices and remembers them.
#[derive(Debug, Default)]
pub struct MockDeviceProvider {
    /// When set, `establish()` is refused with this reason
    deny_reason: Mutex<Option<String>>,
    /// Every device handed out, oldest first
    devices: Mutex<Vec<Arc<MockTun>>>,
}

impl MockDeviceProvider {
    /// Creates a provider that grants every request.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes later `establish()` calls fail as if the user refused consent.
    pub fn deny(&self, reason: impl Into<String>) {
        *self.deny_reason.lock() = Some(reason.into());
    }

    /// Grants later `establish()` calls again.
    pub fn allow(&self) {
        *self.deny_reason.lock() = None;
    }

    /// Returns how many devices have been established.
    #[must_use]
    pub fn establish_count(&self) -> usize {
        self.devices.lock().len()
    }

    /// Returns the most recently established device.
    #[must_use]
    pub fn last_device(&self) -> Option<Arc<MockTun>> {
        self.devices.lock().last().cloned()
    }

    /// Returns how many established devices are still open.
    #[must_use]
    pub fn open_device_count(&self) -> usize {
        self.devices.lock().iter().filter(|d| !d.is_closed()).count()
    }
}

#[async_trait]
impl DeviceProvider for MockDeviceProvider {
    async fn establish(&self, request: DeviceRequest) -> Result<Arc<dyn TunDevice>> {
        if let Some(reason) = self.deny_reason.lock().clone() {
            return Err(DeviceError::denied(reason));
        }
        request.validate()?;

        let device = Arc::new(MockTun::new(request));
        self.devices.lock().push(Arc::clone(&device));
        Ok(device)
    }
}

// ============================================
// Tests
// ============================================
