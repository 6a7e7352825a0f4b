// ============================================
// File: crates/nthlink-vpn/src/controller.rs
// ============================================
//! # Tunnel Controller
//!
//! ## Creation Reason
//! Owns the lifecycle of one tunnel at a time: provisioning the device,
//! starting the transport, running the pump and tearing all of it down
//! again in a fixed order.
//!
//! ## State Machine
//! ```text
//!            start()                 success
//! Stopped ───────────► Starting ──────────────► Running
//!    ▲                     │                       │
//!    │      failure        │     stop() / fatal    │
//!    ├─────────────────────┘     pump error        ▼
//!    └──────────────────────────────────────── Stopping
//! ```
//!
//! ## Main Functionality
//! - `start(config)`: Stopped → Running, or back to Stopped on failure
//! - `stop()`: idempotent teardown, never fails
//! - `state()` / `subscribe()`: current state and change notifications
//!
//! ## Teardown Order
//! 1. Cancel the pump token (no more deliveries)
//! 2. Close the device (unblocks the pending read)
//! 3. Join the pump worker
//! 4. Stop the transport client (errors logged)
//! 5. Release the device handle
//! 6. Notify the presenter, publish Stopped
//!
//! ## ⚠️ Important Note for Next Developer
//! - Commands run one at a time behind an async mutex, in arrival order.
//!   A `start` issued while a `stop` runs waits for it and then starts a
//!   fresh session
//! - A fatal pump error is handled like `stop()`, tagged with the
//!   session generation so a late report cannot tear down a newer session
//! - The session holds the only strong device reference
//! - A `start` future dropped before it finishes rolls back: the device is
//!   closed, the state returns to Stopped and the transport client is
//!   stopped on a spawned task that keeps the command lock until done
//! - Cancelling the pump waits for an in-flight transport write on the
//!   blocking pool, never on the async executor
//!
//! ## Last Modified
//! v0.1.0 - Initial controller
//! v0.1.1 - Roll back a dropped start; cancel the pump off the executor

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, error, info, warn};

use nthlink_tun::{DeviceProvider, TunDevice};

use crate::adapters::{DeviceProtector, DeviceSink};
use crate::config::{TunnelConfig, SELF_APPLICATION};
use crate::error::{Result, TunnelError};
use crate::presenter::{SessionInfo, SessionPresenter, TracingPresenter};
use crate::pump::{CancelToken, PacketPump, PumpTask};
use crate::transport::TransportClient;

// ============================================
// TunnelState
// ============================================

/// Lifecycle state of the tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TunnelState {
    /// No session.
    Stopped,
    /// Provisioning the device and starting the transport.
    Starting,
    /// Packets are flowing.
    Running,
    /// Tearing the session down.
    Stopping,
}

impl TunnelState {
    /// Returns `true` while a session exists or is being built.
    #[must_use]
    pub const fn is_active(self) -> bool {
        matches!(self, Self::Starting | Self::Running)
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

// ============================================
// TunnelSession
// ============================================

/// Resources of one Running session.
struct TunnelSession {
    generation: u64,
    device: Arc<dyn TunDevice>,
    pump: PumpTask,
}

// ============================================
// TunnelController
// ============================================

/// Starts and stops the tunnel.
///
/// # Example
/// ```ignore
/// let controller = TunnelController::new(provider, transport);
/// controller.start(config).await?;
/// // ...
/// controller.stop().await;
/// ```
#[derive(Clone)]
pub struct TunnelController {
    inner: Arc<Inner>,
}

struct Inner {
    provider: Arc<dyn DeviceProvider>,
    transport: Arc<dyn TransportClient>,
    presenter: Arc<dyn SessionPresenter>,
    self_application: String,
    /// Serializes commands; `Some` while Running.
    session: Arc<Mutex<Option<TunnelSession>>>,
    state_tx: watch::Sender<TunnelState>,
    generation: AtomicU64,
}

impl TunnelController {
    /// Creates a controller that logs session transitions.
    #[must_use]
    pub fn new(provider: Arc<dyn DeviceProvider>, transport: Arc<dyn TransportClient>) -> Self {
        Self::builder(provider, transport).build()
    }

    /// Starts building a controller with non-default collaborators.
    #[must_use]
    pub fn builder(
        provider: Arc<dyn DeviceProvider>,
        transport: Arc<dyn TransportClient>,
    ) -> TunnelControllerBuilder {
        TunnelControllerBuilder {
            provider,
            transport,
            presenter: Arc::new(TracingPresenter),
            self_application: SELF_APPLICATION.to_string(),
        }
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> TunnelState {
        *self.inner.state_tx.borrow()
    }

    /// Returns `true` while Running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state() == TunnelState::Running
    }

    /// Receives every state change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<TunnelState> {
        self.inner.state_tx.subscribe()
    }

    /// Starts a session.
    ///
    /// Returns the current state without doing anything if a session is
    /// already Starting or Running.
    ///
    /// # Errors
    /// Returns the first failure; every resource acquired before it has
    /// been released and the state is Stopped again.
    pub async fn start(&self, config: TunnelConfig) -> Result<TunnelState> {
        self.inner.start(config).await
    }

    /// Stops the session, if any. Never fails and may be called any
    /// number of times.
    pub async fn stop(&self) -> TunnelState {
        let mut slot = self.inner.session.lock().await;
        self.inner.teardown(&mut slot, "stop requested").await;
        self.state()
    }
}

impl fmt::Debug for TunnelController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TunnelController")
            .field("state", &self.state())
            .field("generation", &self.inner.generation.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

// ============================================
// TunnelControllerBuilder
// ============================================

/// Builder for [`TunnelController`].
pub struct TunnelControllerBuilder {
    provider: Arc<dyn DeviceProvider>,
    transport: Arc<dyn TransportClient>,
    presenter: Arc<dyn SessionPresenter>,
    self_application: String,
}

impl TunnelControllerBuilder {
    /// Reports Running/Stopped transitions to `presenter`.
    #[must_use]
    pub fn presenter(mut self, presenter: Arc<dyn SessionPresenter>) -> Self {
        self.presenter = presenter;
        self
    }

    /// Overrides the application identifier excluded from capture.
    #[must_use]
    pub fn self_application(mut self, app: impl Into<String>) -> Self {
        self.self_application = app.into();
        self
    }

    /// Builds the controller in the Stopped state.
    #[must_use]
    pub fn build(self) -> TunnelController {
        let (state_tx, _) = watch::channel(TunnelState::Stopped);
        TunnelController {
            inner: Arc::new(Inner {
                provider: self.provider,
                transport: self.transport,
                presenter: self.presenter,
                self_application: self.self_application,
                session: Arc::new(Mutex::new(None)),
                state_tx,
                generation: AtomicU64::new(0),
            }),
        }
    }
}

impl Inner {
    fn set_state(&self, state: TunnelState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!(from = %previous, to = %state, "Tunnel state changed");
        }
    }

    async fn start(self: &Arc<Self>, config: TunnelConfig) -> Result<TunnelState> {
        let slot = Arc::clone(&self.session).lock_owned().await;

        let current = *self.state_tx.borrow();
        if current.is_active() {
            debug!(state = %current, "Start ignored, tunnel already active");
            return Ok(current);
        }

        info!(endpoint = %config.endpoint.address(), "Starting tunnel");
        self.set_state(TunnelState::Starting);

        let mut rollback = StartRollback::new(self, slot);
        let outcome = self.bring_up(&config, &mut rollback).await;
        let Some(mut slot) = rollback.disarm() else {
            return Err(TunnelError::internal("command lock released during start"));
        };

        match outcome {
            Ok(session) => {
                let info = SessionInfo {
                    generation: session.generation,
                    device_name: session.device.name().to_string(),
                    endpoint: config.endpoint.address(),
                };
                *slot = Some(session);
                self.set_state(TunnelState::Running);
                self.presenter.on_running(&info);
                info!(generation = info.generation, "Tunnel running");
                Ok(TunnelState::Running)
            }
            Err(e) => {
                error!(error = %e, "Tunnel failed to start");
                self.set_state(TunnelState::Stopped);
                Err(e)
            }
        }
    }

    /// Acquires every session resource, releasing them again on failure.
    ///
    /// Records what it acquired in `rollback` so a dropped start can undo
    /// it.
    async fn bring_up(
        self: &Arc<Self>,
        config: &TunnelConfig,
        rollback: &mut StartRollback<'_>,
    ) -> Result<TunnelSession> {
        config.validate()?;
        let request = config.device_request(&self.self_application)?;

        let device = self
            .provider
            .establish(request)
            .await
            .map_err(TunnelError::Establish)?;
        info!(device = device.name(), mtu = device.mtu(), "Tunnel device established");
        rollback.device = Some(Arc::clone(&device));

        if let Err(e) = device.set_blocking(true) {
            close_device(device.as_ref());
            return Err(TunnelError::Establish(e));
        }

        let sink = Arc::new(DeviceSink::new(&device));
        let protector = Arc::new(DeviceProtector::new(&device));

        rollback.transport_started = true;
        if let Err(e) = self
            .transport
            .start(sink, protector, config.transport_params())
            .await
        {
            // Release whatever the client opened before failing
            if let Err(stop_err) = self.transport.stop().await {
                debug!(error = %stop_err, "Transport cleanup after failed start");
            }
            close_device(device.as_ref());
            return Err(TunnelError::TransportStart(e));
        }

        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        let pump = PacketPump::new(
            Arc::clone(&device),
            Arc::clone(&self.transport),
            Arc::new(CancelToken::new()),
            config.tunnel.read_buffer_size,
        );

        let weak: Weak<Self> = Arc::downgrade(self);
        let runtime = tokio::runtime::Handle::current();
        let pump = pump.spawn(move |err| {
            if let Some(inner) = weak.upgrade() {
                runtime.spawn(async move { inner.handle_pump_failure(generation, err).await });
            }
        });

        Ok(TunnelSession {
            generation,
            device,
            pump,
        })
    }

    async fn handle_pump_failure(&self, generation: u64, err: TunnelError) {
        let mut slot = self.session.lock().await;

        let current = slot.as_ref().map(|s| s.generation);
        if current != Some(generation) {
            debug!(generation, ?current, "Ignoring pump failure from a finished session");
            return;
        }

        error!(generation, error = %err, "Packet pump failed, stopping tunnel");
        self.teardown(&mut slot, "pump failure").await;
    }

    async fn teardown(&self, slot: &mut Option<TunnelSession>, reason: &str) {
        let Some(session) = slot.take() else {
            debug!(reason, "Stop ignored, tunnel not running");
            return;
        };

        info!(generation = session.generation, reason, "Stopping tunnel");
        self.set_state(TunnelState::Stopping);

        let TunnelSession {
            generation,
            device,
            pump,
        } = session;

        pump.cancel().await;
        close_device(device.as_ref());

        match pump.join().await {
            Ok(stats) => debug!(
                generation,
                forwarded = stats.packets_forwarded,
                dropped = stats.packets_dropped,
                "Packet pump joined"
            ),
            Err(e) => error!(generation, error = %e, "Packet pump did not exit cleanly"),
        }

        if let Err(e) = self.transport.stop().await {
            warn!(error = %TunnelError::TransportStop(e), "Transport stop reported an error");
        }

        drop(device);

        self.presenter.on_stopped();
        self.set_state(TunnelState::Stopped);
        info!(generation, "Tunnel stopped");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        // Dropped while Running: unblock the worker so it can exit
        let Ok(mut slot) = self.session.try_lock() else {
            return;
        };
        if let Some(session) = slot.take() {
            session.pump.signal_cancel();
            close_device(session.device.as_ref());
        }
    }
}

// ============================================
// StartRollback
// ============================================

/// Undoes a partial start if the `start` future is dropped mid-way.
///
/// Holds the command lock for the duration of the start. `disarm()` hands
/// it back once `bring_up` has returned, after which the explicit success
/// and failure paths own cleanup.
struct StartRollback<'a> {
    inner: &'a Inner,
    slot: Option<OwnedMutexGuard<Option<TunnelSession>>>,
    device: Option<Arc<dyn TunDevice>>,
    transport_started: bool,
}

impl<'a> StartRollback<'a> {
    fn new(inner: &'a Inner, slot: OwnedMutexGuard<Option<TunnelSession>>) -> Self {
        Self {
            inner,
            slot: Some(slot),
            device: None,
            transport_started: false,
        }
    }

    fn disarm(mut self) -> Option<OwnedMutexGuard<Option<TunnelSession>>> {
        self.device = None;
        self.slot.take()
    }
}

impl Drop for StartRollback<'_> {
    fn drop(&mut self) {
        let Some(slot) = self.slot.take() else {
            return;
        };

        warn!("Tunnel start abandoned, rolling back");
        if let Some(device) = self.device.take() {
            close_device(device.as_ref());
        }

        if self.transport_started {
            let transport = Arc::clone(&self.inner.transport);
            match tokio::runtime::Handle::try_current() {
                Ok(runtime) => {
                    // The next command waits on `slot` until the client is down
                    runtime.spawn(async move {
                        if let Err(e) = transport.stop().await {
                            debug!(error = %e, "Transport cleanup after abandoned start");
                        }
                        drop(slot);
                    });
                }
                Err(_) => warn!("No runtime left to stop the transport client"),
            }
        }

        self.inner.set_state(TunnelState::Stopped);
    }
}

fn close_device(device: &dyn TunDevice) {
    if let Err(e) = device.close() {
        warn!(device = device.name(), error = %e, "Failed to close tunnel device cleanly");
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicBool, AtomicUsize};
    use std::time::Duration;

    use nthlink_tun::{DeviceError, MockDeviceProvider, MockTun};

    use super::*;
    use crate::adapters::{PacketSink, SocketProtector};
    use crate::transport::{MockTransport, TransportClientError, TransportParams};

    const WAIT: Duration = Duration::from_secs(2);

    #[derive(Default)]
    struct RecordingPresenter {
        running: AtomicUsize,
        stopped: AtomicUsize,
        last: parking_lot::Mutex<Option<SessionInfo>>,
    }

    impl SessionPresenter for RecordingPresenter {
        fn on_running(&self, info: &SessionInfo) {
            self.running.fetch_add(1, Ordering::SeqCst);
            *self.last.lock() = Some(info.clone());
        }

        fn on_stopped(&self) {
            self.stopped.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Harness {
        provider: Arc<MockDeviceProvider>,
        transport: Arc<MockTransport>,
        presenter: Arc<RecordingPresenter>,
        controller: TunnelController,
    }

    impl Harness {
        fn new() -> Self {
            let provider = Arc::new(MockDeviceProvider::new());
            let transport = Arc::new(MockTransport::new());
            let presenter = Arc::new(RecordingPresenter::default());
            let controller = TunnelController::builder(provider.clone(), transport.clone())
                .presenter(presenter.clone())
                .self_application("org.nthlink.test")
                .build();
            Self {
                provider,
                transport,
                presenter,
                controller,
            }
        }

        fn device(&self) -> Arc<MockTun> {
            self.provider.last_device().unwrap()
        }

        async fn wait_for_state(&self, state: TunnelState) {
            let mut rx = self.controller.subscribe();
            tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
                .await
                .expect("state not reached in time")
                .unwrap();
        }
    }

    fn config() -> TunnelConfig {
        let mut config = TunnelConfig::default();
        config.endpoint.host = "203.0.113.7".into();
        config.endpoint.port = 8388;
        config.credentials.secret = "hunter2".into();
        config
    }

    #[tokio::test]
    async fn test_start_forwards_packets_and_stop_releases_all() {
        let h = Harness::new();

        let state = h.controller.start(config()).await.unwrap();
        assert_eq!(state, TunnelState::Running);
        assert!(h.controller.is_running());

        let device = h.device();
        assert!(device.is_blocking());
        assert_eq!(h.presenter.running.load(Ordering::SeqCst), 1);

        let params = h.transport.last_params().unwrap();
        assert_eq!(params.endpoint, "203.0.113.7:8388");
        assert_eq!(params.secret.expose(), "hunter2");

        // Transport sockets were protected through the device
        assert_eq!(device.protected_sockets().len(), 1);

        device.inject_packet(vec![0x45; 84]);
        let packets = h.transport.wait_for_packets(1, WAIT).await.unwrap();
        assert_eq!(packets[0].len(), 84);

        // Inbound direction reaches the device
        assert!(h.transport.deliver_inbound(&[0x45, 1, 2, 3]));
        assert_eq!(device.take_written_packets(), vec![vec![0x45, 1, 2, 3]]);

        assert_eq!(h.controller.stop().await, TunnelState::Stopped);
        assert!(device.is_closed());
        assert_eq!(h.provider.open_device_count(), 0);
        assert_eq!(h.transport.stop_calls(), 1);
        assert!(!h.transport.is_running());
        assert_eq!(h.presenter.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_device_request_excludes_self() {
        let h = Harness::new();
        h.controller.start(config()).await.unwrap();

        let request = h.device().request().clone();
        assert!(request
            .disallowed_applications
            .contains(&"org.nthlink.test".to_string()));
        assert_eq!(request.address.to_string(), "10.255.0.1/30");
        assert_eq!(request.dns_servers, vec!["1.1.1.1".parse::<std::net::IpAddr>().unwrap()]);

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_establish_denied() {
        let h = Harness::new();
        h.provider.deny("user declined consent");

        let err = h.controller.start(config()).await.unwrap_err();
        assert!(matches!(err, TunnelError::Establish(_)));
        assert!(err.is_denied());

        assert_eq!(h.controller.state(), TunnelState::Stopped);
        assert_eq!(h.transport.start_calls(), 0);
        assert_eq!(h.presenter.running.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transport_start_failure_closes_device() {
        let h = Harness::new();
        h.transport.fail_start(Some("connection refused"));

        let err = h.controller.start(config()).await.unwrap_err();
        assert!(matches!(err, TunnelError::TransportStart(_)));

        assert_eq!(h.controller.state(), TunnelState::Stopped);
        assert!(h.device().is_closed());
        assert_eq!(h.provider.open_device_count(), 0);
        assert!(!h.transport.is_running());
        assert_eq!(h.presenter.running.load(Ordering::SeqCst), 0);

        // A later start succeeds with a fresh device
        h.transport.fail_start(None);
        h.controller.start(config()).await.unwrap();
        assert_eq!(h.provider.establish_count(), 2);
        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_protect_failure_aborts_start() {
        let h = Harness::new();
        h.transport.set_sockets_per_start(2);

        let provider = Arc::new(FailingProtectProvider);
        let controller = TunnelController::new(provider, h.transport.clone());

        let err = controller.start(config()).await.unwrap_err();
        assert!(err.is_protect_failure());
        assert_eq!(controller.state(), TunnelState::Stopped);
        assert!(!h.transport.is_running());
    }

    struct FailingProtectProvider;

    #[async_trait::async_trait]
    impl DeviceProvider for FailingProtectProvider {
        async fn establish(
            &self,
            request: nthlink_tun::DeviceRequest,
        ) -> nthlink_tun::Result<Arc<dyn TunDevice>> {
            let tun = MockTun::new(request);
            tun.set_protect_result(false);
            Ok(Arc::new(tun))
        }
    }

    #[tokio::test]
    async fn test_start_while_running_is_noop() {
        let h = Harness::new();
        h.controller.start(config()).await.unwrap();

        let state = h.controller.start(config()).await.unwrap();
        assert_eq!(state, TunnelState::Running);
        assert_eq!(h.provider.establish_count(), 1);
        assert_eq!(h.transport.start_calls(), 1);

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let h = Harness::new();
        assert_eq!(h.controller.stop().await, TunnelState::Stopped);

        h.controller.start(config()).await.unwrap();
        let device = h.device();
        h.controller.stop().await;
        h.controller.stop().await;

        assert_eq!(device.close_calls(), 1);
        assert_eq!(h.transport.stop_calls(), 1);
        assert_eq!(h.presenter.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_transport_stop_error_is_not_fatal() {
        let h = Harness::new();
        h.transport.fail_stop(Some("socket already gone"));

        h.controller.start(config()).await.unwrap();
        assert_eq!(h.controller.stop().await, TunnelState::Stopped);
        assert!(h.device().is_closed());
    }

    #[tokio::test]
    async fn test_fatal_read_error_stops_tunnel() {
        let h = Harness::new();
        h.controller.start(config()).await.unwrap();

        h.device().inject_read_error(io::ErrorKind::BrokenPipe);
        h.wait_for_state(TunnelState::Stopped).await;

        assert!(h.device().is_closed());
        assert_eq!(h.transport.stop_calls(), 1);
        assert_eq!(h.presenter.stopped.load(Ordering::SeqCst), 1);

        // Stop after a self-healing teardown is a no-op
        h.controller.stop().await;
        assert_eq!(h.transport.stop_calls(), 1);
    }

    #[tokio::test]
    async fn test_transient_read_errors_keep_running() {
        let h = Harness::new();
        h.controller.start(config()).await.unwrap();

        let device = h.device();
        device.inject_read_error(io::ErrorKind::Interrupted);
        device.inject_packet(vec![1u8; 40]);

        assert!(h.transport.wait_for_packets(1, WAIT).await.is_some());
        assert!(h.controller.is_running());

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_no_packets_forwarded_after_stop() {
        let h = Harness::new();
        h.controller.start(config()).await.unwrap();
        let device = h.device();

        device.inject_packet(vec![1u8; 40]);
        h.transport.wait_for_packets(1, WAIT).await.unwrap();

        h.controller.stop().await;
        let forwarded = h.transport.forwarded_packets().len();

        device.inject_packet(vec![2u8; 40]);
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(h.transport.forwarded_packets().len(), forwarded);
    }

    #[tokio::test]
    async fn test_restart_creates_new_session() {
        let h = Harness::new();

        h.controller.start(config()).await.unwrap();
        let first = h.device();
        h.controller.stop().await;

        h.controller.start(config()).await.unwrap();
        let second = h.device();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(first.is_closed());
        assert!(!second.is_closed());
        assert_eq!(h.presenter.last.lock().as_ref().unwrap().generation, 2);

        // A stale failure from the first session must not stop the second
        h.controller
            .inner
            .handle_pump_failure(1, TunnelError::PacketReadFatal(DeviceError::closed("old")))
            .await;
        assert!(h.controller.is_running());

        h.controller.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_commands_serialize() {
        let h = Harness::new();

        let (a, b) = tokio::join!(h.controller.start(config()), h.controller.start(config()));
        assert_eq!(a.unwrap(), TunnelState::Running);
        assert_eq!(b.unwrap(), TunnelState::Running);
        assert_eq!(h.provider.establish_count(), 1);

        // A start queued behind a stop runs after it completes
        let c = h.controller.clone();
        let (stopped, started) = tokio::join!(h.controller.stop(), async move {
            tokio::task::yield_now().await;
            c.start(config()).await
        });
        assert_eq!(stopped, TunnelState::Stopped);
        assert_eq!(started.unwrap(), TunnelState::Running);
        assert_eq!(h.provider.establish_count(), 2);
        assert_eq!(h.provider.open_device_count(), 1);

        h.controller.stop().await;
        assert_eq!(h.provider.open_device_count(), 0);
    }

    #[tokio::test]
    async fn test_subscribe_sees_transitions() {
        let h = Harness::new();
        let mut rx = h.controller.subscribe();
        assert_eq!(*rx.borrow(), TunnelState::Stopped);

        h.controller.start(config()).await.unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), TunnelState::Running);

        h.controller.stop().await;
        assert_eq!(*rx.borrow_and_update(), TunnelState::Stopped);
    }

    #[tokio::test]
    async fn test_device_closed_externally_stops_tunnel() {
        let h = Harness::new();
        h.controller.start(config()).await.unwrap();

        // The system revokes the device under a running session
        h.device().close().unwrap();
        h.wait_for_state(TunnelState::Stopped).await;

        assert_eq!(h.transport.stop_calls(), 1);
        assert!(!h.transport.is_running());
        assert_eq!(h.provider.open_device_count(), 0);
        assert_eq!(h.presenter.stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_reconnect_socket_protected_through_device() {
        let h = Harness::new();
        h.controller.start(config()).await.unwrap();
        let device = h.device();

        assert_eq!(h.transport.open_socket(), Some(true));
        assert_eq!(device.protected_sockets().len(), 2);

        // A refused protect is the client's problem, not a tunnel failure
        device.set_protect_result(false);
        assert_eq!(h.transport.open_socket(), Some(false));
        assert!(h.controller.is_running());

        h.controller.stop().await;
        assert_eq!(h.transport.open_socket(), None);
    }

    /// Wraps [`MockTransport`] with a start that can hang and a slow write.
    #[derive(Default)]
    struct ScriptedTransport {
        inner: MockTransport,
        hang_start: AtomicBool,
        write_delay: parking_lot::Mutex<Option<Duration>>,
        writing: AtomicBool,
    }

    #[async_trait::async_trait]
    impl TransportClient for ScriptedTransport {
        async fn start(
            &self,
            sink: Arc<dyn PacketSink>,
            protector: Arc<dyn SocketProtector>,
            params: TransportParams,
        ) -> std::result::Result<(), TransportClientError> {
            if self.hang_start.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            self.inner.start(sink, protector, params).await
        }

        async fn stop(&self) -> std::result::Result<(), TransportClientError> {
            self.inner.stop().await
        }

        fn write_packet(&self, packet: &[u8]) -> std::result::Result<(), TransportClientError> {
            let delay = *self.write_delay.lock();
            if let Some(delay) = delay {
                self.writing.store(true, Ordering::SeqCst);
                std::thread::sleep(delay);
            }
            self.inner.write_packet(packet)
        }
    }

    fn scripted() -> (Arc<MockDeviceProvider>, Arc<ScriptedTransport>, TunnelController) {
        let provider = Arc::new(MockDeviceProvider::new());
        let transport = Arc::new(ScriptedTransport::default());
        let controller = TunnelController::new(provider.clone(), transport.clone());
        (provider, transport, controller)
    }

    #[tokio::test]
    async fn test_abandoned_start_rolls_back() {
        let (provider, transport, controller) = scripted();
        transport.hang_start.store(true, Ordering::SeqCst);

        let attempt = tokio::time::timeout(Duration::from_millis(50), controller.start(config())).await;
        assert!(attempt.is_err());

        assert_eq!(controller.state(), TunnelState::Stopped);
        assert_eq!(provider.establish_count(), 1);
        assert_eq!(provider.open_device_count(), 0);

        // Client cleanup runs on a spawned task
        let deadline = tokio::time::Instant::now() + WAIT;
        while transport.inner.stop_calls() == 0 && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(transport.inner.stop_calls(), 1);

        transport.hang_start.store(false, Ordering::SeqCst);
        assert_eq!(controller.start(config()).await.unwrap(), TunnelState::Running);
        assert_eq!(provider.establish_count(), 2);
        assert_eq!(provider.open_device_count(), 1);

        controller.stop().await;
        assert_eq!(provider.open_device_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_during_slow_write_keeps_executor_free() {
        let (provider, transport, controller) = scripted();
        *transport.write_delay.lock() = Some(Duration::from_millis(500));
        controller.start(config()).await.unwrap();

        provider.last_device().unwrap().inject_packet(vec![0x45; 40]);
        let deadline = tokio::time::Instant::now() + WAIT;
        while !transport.writing.load(Ordering::SeqCst) && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(transport.writing.load(Ordering::SeqCst));

        let started = std::time::Instant::now();
        let timer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            started.elapsed()
        });

        assert_eq!(controller.stop().await, TunnelState::Stopped);
        assert!(timer.await.unwrap() < Duration::from_millis(250));

        // The in-flight packet was the last one delivered
        assert_eq!(transport.inner.forwarded_packets().len(), 1);
    }
}
