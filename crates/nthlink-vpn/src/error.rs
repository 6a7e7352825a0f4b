// ============================================
// File: crates/nthlink-vpn/src/error.rs
// ============================================
//! # Tunnel Error Types
//!
//! ## Creation Reason
//! One taxonomy for everything the tunnel core can report, so callers of
//! `start` can tell a refused device from an unreachable proxy.
//!
//! ## Error Categories
//! 1. **Start errors**: `Establish`, `TransportStart`, configuration
//! 2. **Stop errors**: `TransportStop`, logged and never returned
//! 3. **Pump errors**: `PacketReadTransient`, `PacketReadFatal`, `PacketWrite`
//!
//! Socket protection failures have no variant of their own. Before
//! Running they arrive inside `TransportStart` as
//! `TransportClientError::ProtectFailed`.
//!
//! ## Last Modified
//! v0.1.0 - Initial tunnel error definitions

use thiserror::Error;

use nthlink_tun::DeviceError;

use crate::transport::TransportClientError;

/// Result type for tunnel operations.
pub type Result<T> = std::result::Result<T, TunnelError>;

/// Tunnel core error types.
#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("Failed to load configuration from '{path}': {reason}")]
    ConfigLoad {
        path: String,
        reason: String,
    },

    #[error("Invalid configuration: {field} - {reason}")]
    ConfigInvalid {
        field: String,
        reason: String,
    },

    /// The device could not be created or was refused.
    #[error("Failed to establish tunnel device: {0}")]
    Establish(#[source] DeviceError),

    /// The transport client rejected start.
    #[error("Transport failed to start: {0}")]
    TransportStart(#[source] TransportClientError),

    /// The transport client reported an error while stopping.
    #[error("Transport failed to stop: {0}")]
    TransportStop(#[source] TransportClientError),

    #[error("Transient packet read error: {0}")]
    PacketReadTransient(#[source] DeviceError),

    #[error("Fatal packet read error: {0}")]
    PacketReadFatal(#[source] DeviceError),

    /// Writing an inbound packet to the device failed.
    #[error("Packet write to device failed: {0}")]
    PacketWrite(#[source] DeviceError),

    #[error("Internal error: {message}")]
    Internal {
        message: String,
    },
}

impl TunnelError {
    pub fn config_load(path: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigLoad {
            path: path.into(),
            reason: reason.into(),
        }
    }

    pub fn config_invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            field: field.into(),
            reason: reason.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn is_config_error(&self) -> bool {
        matches!(self, Self::ConfigLoad { .. } | Self::ConfigInvalid { .. })
    }

    /// Returns `true` for errors that abort `start` and leave the tunnel
    /// Stopped.
    #[must_use]
    pub const fn is_fatal_to_start(&self) -> bool {
        matches!(
            self,
            Self::ConfigLoad { .. }
                | Self::ConfigInvalid { .. }
                | Self::Establish(_)
                | Self::TransportStart(_)
        )
    }

    /// Returns `true` if the device was refused by the user or platform.
    #[must_use]
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::Establish(e) if e.is_denied())
    }

    /// Returns `true` if a socket could not be excluded from capture.
    #[must_use]
    pub const fn is_protect_failure(&self) -> bool {
        matches!(
            self,
            Self::TransportStart(TransportClientError::ProtectFailed { .. })
        )
    }

    /// Returns `true` for errors the pump logs and continues past.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::PacketReadTransient(_) | Self::PacketWrite(_) | Self::TransportStop(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TunnelError::config_invalid("endpoint.port", "port cannot be 0");
        assert!(err.to_string().contains("endpoint.port"));

        let err = TunnelError::Establish(DeviceError::denied("user declined"));
        assert!(err.to_string().contains("user declined"));
    }

    #[test]
    fn test_start_classification() {
        assert!(TunnelError::Establish(DeviceError::denied("no")).is_fatal_to_start());
        assert!(TunnelError::TransportStart(TransportClientError::connect("refused")).is_fatal_to_start());
        assert!(!TunnelError::TransportStop(TransportClientError::disconnect("x")).is_fatal_to_start());
        assert!(!TunnelError::PacketReadFatal(DeviceError::closed("tun0")).is_fatal_to_start());
    }

    #[test]
    fn test_denied_and_protect() {
        assert!(TunnelError::Establish(DeviceError::denied("no")).is_denied());
        assert!(!TunnelError::Establish(DeviceError::create_failed("tun0", "busy")).is_denied());

        let err = TunnelError::TransportStart(TransportClientError::ProtectFailed { socket: 7 });
        assert!(err.is_protect_failure());
        assert!(!TunnelError::TransportStart(TransportClientError::connect("x")).is_protect_failure());
    }

    #[test]
    fn test_recoverable() {
        assert!(TunnelError::PacketWrite(DeviceError::closed("tun0")).is_recoverable());
        assert!(!TunnelError::PacketReadFatal(DeviceError::closed("tun0")).is_recoverable());
    }
}
