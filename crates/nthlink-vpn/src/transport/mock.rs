// ============================================
// File: crates/nthlink-vpn/src/transport/mock.rs
// ============================================
//! # Mock Transport Client
//!
//! ## Creation Reason
//! Lets the controller and pump be tested without a proxy.
//!
//! ## Main Functionality
//! - Records every forwarded packet
//! - Counts start/stop calls and can be told to fail either
//! - Opens fake sockets at start and protects each one
//! - Pushes inbound packets through the sink it was given
//!
//! ## Last Modified
//! v0.1.0 - Initial mock implementation

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use nthlink_tun::SocketHandle;

use super::{TransportClient, TransportClientError, TransportParams};
use crate::adapters::{PacketSink, SocketProtector};

/// In-memory [`TransportClient`].
pub struct MockTransport {
    running: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
    /// Fake sockets opened per start
    sockets_per_start: AtomicUsize,
    next_socket: AtomicI32,
    fail_start: Mutex<Option<String>>,
    fail_stop: Mutex<Option<String>>,
    fail_writes: AtomicBool,
    forwarded: Mutex<Vec<Vec<u8>>>,
    sink: Mutex<Option<Arc<dyn PacketSink>>>,
    protector: Mutex<Option<Arc<dyn SocketProtector>>>,
    last_params: Mutex<Option<TransportParams>>,
}

impl MockTransport {
    /// Creates a mock that opens one socket per start.
    #[must_use]
    pub fn new() -> Self {
        Self {
            running: AtomicBool::new(false),
            start_calls: AtomicUsize::new(0),
            stop_calls: AtomicUsize::new(0),
            sockets_per_start: AtomicUsize::new(1),
            next_socket: AtomicI32::new(100),
            fail_start: Mutex::new(None),
            fail_stop: Mutex::new(None),
            fail_writes: AtomicBool::new(false),
            forwarded: Mutex::new(Vec::new()),
            sink: Mutex::new(None),
            protector: Mutex::new(None),
            last_params: Mutex::new(None),
        }
    }

    /// Makes later `start()` calls fail with `reason`, or succeed on `None`.
    pub fn fail_start(&self, reason: Option<&str>) {
        *self.fail_start.lock() = reason.map(str::to_string);
    }

    /// Makes later `stop()` calls report `reason`, or succeed on `None`.
    pub fn fail_stop(&self, reason: Option<&str>) {
        *self.fail_stop.lock() = reason.map(str::to_string);
    }

    /// Makes `write_packet` reject packets.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Sets how many sockets `start()` opens and protects.
    pub fn set_sockets_per_start(&self, count: usize) {
        self.sockets_per_start.store(count, Ordering::Release);
    }

    /// Returns `true` between a successful start and the next stop.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Number of `start()` calls.
    #[must_use]
    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::Acquire)
    }

    /// Number of `stop()` calls.
    #[must_use]
    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::Acquire)
    }

    /// Packets received through `write_packet`, oldest first.
    #[must_use]
    pub fn forwarded_packets(&self) -> Vec<Vec<u8>> {
        self.forwarded.lock().clone()
    }

    /// Parameters of the last `start()` call.
    #[must_use]
    pub fn last_params(&self) -> Option<TransportParams> {
        self.last_params.lock().clone()
    }

    /// Waits until at least `count` packets were forwarded.
    ///
    /// Returns the forwarded packets, or `None` after `timeout`.
    pub async fn wait_for_packets(&self, count: usize, timeout: Duration) -> Option<Vec<Vec<u8>>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            {
                let forwarded = self.forwarded.lock();
                if forwarded.len() >= count {
                    return Some(forwarded.clone());
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Delivers an inbound packet through the sink given at start.
    ///
    /// Returns `false` if no sink is held.
    pub fn deliver_inbound(&self, packet: &[u8]) -> bool {
        let sink = self.sink.lock().clone();
        match sink {
            Some(sink) => {
                sink.write_packet(packet);
                true
            }
            None => false,
        }
    }

    /// Opens one more fake socket and protects it, as a client does when
    /// it reconnects mid-session.
    pub fn open_socket(&self) -> Option<bool> {
        let protector = self.protector.lock().clone()?;
        let socket = self.next_socket.fetch_add(1, Ordering::AcqRel);
        Some(protector.protect(socket))
    }

    fn open_sockets(&self, protector: &dyn SocketProtector) -> Result<(), TransportClientError> {
        for _ in 0..self.sockets_per_start.load(Ordering::Acquire) {
            let socket: SocketHandle = self.next_socket.fetch_add(1, Ordering::AcqRel);
            if !protector.protect(socket) {
                return Err(TransportClientError::ProtectFailed { socket });
            }
        }
        Ok(())
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockTransport")
            .field("running", &self.is_running())
            .field("start_calls", &self.start_calls())
            .field("stop_calls", &self.stop_calls())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl TransportClient for MockTransport {
    async fn start(
        &self,
        sink: Arc<dyn PacketSink>,
        protector: Arc<dyn SocketProtector>,
        params: TransportParams,
    ) -> Result<(), TransportClientError> {
        self.start_calls.fetch_add(1, Ordering::AcqRel);
        *self.last_params.lock() = Some(params);

        self.open_sockets(protector.as_ref())?;

        if let Some(reason) = self.fail_start.lock().clone() {
            return Err(TransportClientError::connect(reason));
        }

        *self.sink.lock() = Some(sink);
        *self.protector.lock() = Some(protector);
        self.running.store(true, Ordering::Release);
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportClientError> {
        self.stop_calls.fetch_add(1, Ordering::AcqRel);
        self.running.store(false, Ordering::Release);
        self.sink.lock().take();
        self.protector.lock().take();

        match self.fail_stop.lock().clone() {
            Some(reason) => Err(TransportClientError::disconnect(reason)),
            None => Ok(()),
        }
    }

    fn write_packet(&self, packet: &[u8]) -> Result<(), TransportClientError> {
        if !self.is_running() {
            return Err(TransportClientError::NotRunning);
        }
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(TransportClientError::forward("mock forward failure"));
        }
        self.forwarded.lock().push(packet.to_vec());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TunnelConfig;

    struct CountingProtector {
        ok: bool,
        seen: Mutex<Vec<SocketHandle>>,
    }

    impl SocketProtector for CountingProtector {
        fn protect(&self, socket: SocketHandle) -> bool {
            self.seen.lock().push(socket);
            self.ok
        }
    }

    struct CollectingSink(Mutex<Vec<Vec<u8>>>);

    impl PacketSink for CollectingSink {
        fn write_packet(&self, packet: &[u8]) {
            self.0.lock().push(packet.to_vec());
        }
    }

    fn protector(ok: bool) -> Arc<CountingProtector> {
        Arc::new(CountingProtector {
            ok,
            seen: Mutex::new(Vec::new()),
        })
    }

    #[tokio::test]
    async fn test_start_protects_sockets() {
        let transport = MockTransport::new();
        transport.set_sockets_per_start(3);
        let protector = protector(true);
        let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));

        transport
            .start(sink.clone(), protector.clone(), TunnelConfig::default().transport_params())
            .await
            .unwrap();

        assert!(transport.is_running());
        assert_eq!(protector.seen.lock().len(), 3);

        assert!(transport.deliver_inbound(&[9, 9]));
        assert_eq!(sink.0.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_start_fails_on_unprotected_socket() {
        let transport = MockTransport::new();
        let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));

        let err = transport
            .start(sink, protector(false), TunnelConfig::default().transport_params())
            .await
            .unwrap_err();

        assert_eq!(err, TransportClientError::ProtectFailed { socket: 100 });
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_write_requires_running() {
        let transport = MockTransport::new();
        assert_eq!(transport.write_packet(&[1]), Err(TransportClientError::NotRunning));

        let sink = Arc::new(CollectingSink(Mutex::new(Vec::new())));
        transport
            .start(sink, protector(true), TunnelConfig::default().transport_params())
            .await
            .unwrap();
        transport.write_packet(&[1, 2]).unwrap();

        transport.stop().await.unwrap();
        assert_eq!(transport.forwarded_packets(), vec![vec![1, 2]]);
        assert!(!transport.deliver_inbound(&[3]));
    }
}
