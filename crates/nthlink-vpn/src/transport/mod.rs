// ============================================
// File: crates/nthlink-vpn/src/transport/mod.rs
// ============================================
//! # Transport Client Interface
//!
//! ## Creation Reason
//! The proxy protocol stack lives outside this crate. The controller only
//! needs to start it, stop it and feed it outbound packets.
//!
//! ## Main Functionality
//! - `TransportClient`: start/stop/write contract
//! - `TransportParams`: endpoint and credentials handed over at start
//! - `TransportClientError`: what an implementation may report
//! - `MockTransport` (test/`mock` feature): in-memory implementation
//!
//! ## ⚠️ Important Note for Next Developer
//! - `write_packet` is called from the pump's blocking worker; it must
//!   not block on the async runtime
//! - Every socket the client opens toward the proxy must go through the
//!   `SocketProtector` before use, otherwise its traffic loops back into
//!   the tunnel
//!
//! ## Last Modified
//! v0.1.0 - Initial transport contract

#[cfg(any(test, feature = "mock"))]
pub mod mock;

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use nthlink_tun::SocketHandle;

use crate::adapters::{PacketSink, SocketProtector};
use crate::config::Secret;

#[cfg(any(test, feature = "mock"))]
pub use mock::MockTransport;

// ============================================
// TransportClientError
// ============================================

/// Errors reported by a transport client.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportClientError {
    /// The proxy could not be reached or rejected the session.
    #[error("Connection to proxy failed: {reason}")]
    Connect {
        /// Why the connection failed
        reason: String,
    },

    /// Shutting the session down failed.
    #[error("Disconnect failed: {reason}")]
    Disconnect {
        /// Why the disconnect failed
        reason: String,
    },

    /// A proxy-bound socket could not be excluded from the tunnel.
    #[error("Failed to protect socket {socket}")]
    ProtectFailed {
        /// The socket that stayed captured
        socket: SocketHandle,
    },

    /// A packet was offered while the client is not running.
    #[error("Transport is not running")]
    NotRunning,

    /// A packet could not be forwarded.
    #[error("Failed to forward packet: {reason}")]
    Forward {
        /// Why forwarding failed
        reason: String,
    },
}

impl TransportClientError {
    /// Creates a `Connect` error.
    pub fn connect(reason: impl Into<String>) -> Self {
        Self::Connect {
            reason: reason.into(),
        }
    }

    /// Creates a `Disconnect` error.
    pub fn disconnect(reason: impl Into<String>) -> Self {
        Self::Disconnect {
            reason: reason.into(),
        }
    }

    /// Creates a `Forward` error.
    pub fn forward(reason: impl Into<String>) -> Self {
        Self::Forward {
            reason: reason.into(),
        }
    }
}

// ============================================
// TransportParams
// ============================================

/// Proxy endpoint and credentials for one session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportParams {
    /// `host:port` of the proxy.
    pub endpoint: String,
    /// Cipher/method identifier.
    pub method: String,
    /// Shared secret. Its `Debug` output is redacted.
    pub secret: Secret,
    /// Obfuscation prefix.
    pub prefix: String,
}

// ============================================
// TransportClient Trait
// ============================================

/// Proxy client carrying tunnel packets to and from the remote endpoint.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Starts the client.
    ///
    /// Inbound packets go to `sink`. Every socket the client opens toward
    /// the proxy is passed to `protector` first.
    ///
    /// # Errors
    /// Returns error if the client cannot start. A protection failure
    /// during start is reported as [`TransportClientError::ProtectFailed`].
    async fn start(
        &self,
        sink: Arc<dyn PacketSink>,
        protector: Arc<dyn SocketProtector>,
        params: TransportParams,
    ) -> Result<(), TransportClientError>;

    /// Stops the client and releases its sockets.
    ///
    /// # Errors
    /// Returns error if shutdown did not complete cleanly. The client is
    /// considered stopped regardless.
    async fn stop(&self) -> Result<(), TransportClientError>;

    /// Forwards one outbound IP packet.
    ///
    /// # Errors
    /// Returns error if the packet was not accepted.
    fn write_packet(&self, packet: &[u8]) -> Result<(), TransportClientError>;
}
