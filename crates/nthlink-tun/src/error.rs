// ============================================
// File: crates/nthlink-tun/src/error.rs
// ============================================
//! # Device Error Types
//!
//! ## Creation Reason
//! Defines error types for tunnel device provisioning and packet I/O.
//!
//! ## Main Functionality
//! - `DeviceError`: Primary error enum for device operations
//! - Error conversion from system errors
//! - Categorization of retryable vs fatal errors
//!
//! ## Error Categories
//! 1. **Establish Errors**: Device creation, user/platform denial
//! 2. **I/O Errors**: Packet read/write failures, closed device
//! 3. **Configuration Errors**: Invalid addresses, routes, names
//!
//! ## ⚠️ Important Note for Next Developer
//! - `Closed` is what a read returns once `close()` was called; the pump
//!   decides whether that is teardown or a malfunction, not this type
//! - `is_retryable` drives the pump's log-and-continue path, keep it narrow
//!
//! ## Last Modified
//! v0.1.0 - Initial device error definitions

use std::io;

use thiserror::Error;

// ============================================
// Result Type Alias
// ============================================

/// Result type for device operations.
pub type Result<T> = std::result::Result<T, DeviceError>;

// ============================================
// DeviceError
// ============================================

/// Device layer error types.
#[derive(Error, Debug)]
pub enum DeviceError {
    // ========================================
    // Establish Errors
    // ========================================

    /// Failed to create the TUN device.
    #[error("Failed to create TUN device '{name}': {reason}")]
    CreateFailed {
        /// Requested device name
        name: String,
        /// Why creation failed
        reason: String,
    },

    /// Failed to configure addressing, routes or DNS on the device.
    #[error("Failed to configure TUN device '{name}': {reason}")]
    ConfigFailed {
        /// Device name
        name: String,
        /// Why configuration failed
        reason: String,
    },

    /// The platform or the user refused to establish the device.
    #[error("Device establishment denied: {reason}")]
    EstablishDenied {
        /// Why establishment was refused
        reason: String,
    },

    /// Permission denied for operation.
    #[error("Permission denied: {operation}")]
    PermissionDenied {
        /// What operation was denied
        operation: String,
    },

    // ========================================
    // I/O Errors
    // ========================================

    /// Packet read failed.
    #[error("TUN read failed: {source}")]
    ReadFailed {
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// Packet write failed.
    #[error("TUN write failed: {source}")]
    WriteFailed {
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },

    /// The device handle has been closed.
    #[error("TUN device '{name}' is closed")]
    Closed {
        /// Device name
        name: String,
    },

    // ========================================
    // Configuration Errors
    // ========================================

    /// Invalid device request.
    #[error("Invalid configuration: {field} - {reason}")]
    InvalidConfig {
        /// Configuration field name
        field: String,
        /// Why it's invalid
        reason: String,
    },

    // ========================================
    // Wrapped Errors
    // ========================================

    /// I/O error from the system.
    #[error("I/O error: {context}")]
    Io {
        /// What was happening when the error occurred
        context: String,
        /// Underlying I/O error
        #[source]
        source: io::Error,
    },
}

impl DeviceError {
    // ========================================
    // Convenience Constructors
    // ========================================

    /// Creates a `CreateFailed` error.
    pub fn create_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CreateFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates a `ConfigFailed` error.
    pub fn config_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConfigFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }

    /// Creates an `EstablishDenied` error.
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::EstablishDenied {
            reason: reason.into(),
        }
    }

    /// Creates a `Closed` error.
    pub fn closed(name: impl Into<String>) -> Self {
        Self::Closed { name: name.into() }
    }

    /// Creates an `Io` error with context.
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }

    /// Creates an `InvalidConfig` error.
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    // ========================================
    // Error Classification
    // ========================================

    /// Returns `true` if this error is transient and the I/O may be retried.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::ReadFailed { source }
            | Self::WriteFailed { source }
            | Self::Io { source, .. } => matches!(
                source.kind(),
                io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted | io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }

    /// Returns `true` if the device was refused rather than broken.
    #[must_use]
    pub const fn is_denied(&self) -> bool {
        matches!(
            self,
            Self::EstablishDenied { .. } | Self::PermissionDenied { .. }
        )
    }

    /// Returns `true` if the device handle is no longer usable.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        match self {
            Self::Closed { .. } => true,
            Self::ReadFailed { source } | Self::WriteFailed { source } => {
                source.raw_os_error() == Some(EBADF)
            }
            _ => false,
        }
    }
}

/// `EBADF`, identical on every platform we build for.
const EBADF: i32 = 9;

// ============================================
// Error Conversions
// ============================================

impl From<io::Error> for DeviceError {
    fn from(err: io::Error) -> Self {
        Self::Io {
            context: "unspecified I/O operation".into(),
            source: err,
        }
    }
}

// ============================================
// Tests
// ============================================
