// ============================================
// File: crates/nthlink-vpn/src/presenter.rs
// ============================================
//! # Session Presenter
//!
//! ## Creation Reason
//! A running tunnel must stay visible to the user (a persistent
//! notification on mobile, a tray icon or log line elsewhere). The
//! controller reports Running and Stopped transitions here and nothing
//! else.
//!
//! ## Last Modified
//! v0.1.0 - Initial presenter

use tracing::info;

/// Details of a session that just reached Running.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionInfo {
    /// Monotonic session number, starting at 1.
    pub generation: u64,
    /// Tunnel device name.
    pub device_name: String,
    /// Proxy endpoint (`host:port`).
    pub endpoint: String,
}

/// Receives user-visible session transitions.
pub trait SessionPresenter: Send + Sync {
    /// Called once per session after it reaches Running.
    fn on_running(&self, info: &SessionInfo);

    /// Called once per session after teardown completes.
    fn on_stopped(&self);
}

/// Presenter that only logs.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingPresenter;

impl SessionPresenter for TracingPresenter {
    fn on_running(&self, info: &SessionInfo) {
        info!(
            generation = info.generation,
            device = %info.device_name,
            endpoint = %info.endpoint,
            "VPN connected"
        );
    }

    fn on_stopped(&self) {
        info!("VPN disconnected");
    }
}
