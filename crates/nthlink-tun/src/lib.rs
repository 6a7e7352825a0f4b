// ============================================
// File: crates/nthlink-tun/src/lib.rs
// ============================================
//! # nthlink TUN - Tunnel Device Layer
//!
//! ## Creation Reason
//! Provides the device side of the nthlink VPN: establishing a virtual
//! network interface that captures the host's IP traffic, reading and
//! writing raw packets on it, and excluding the proxy transport's own
//! sockets from capture.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`traits`]: `TunDevice`, `DeviceProvider`, `DeviceRequest`
//! - [`tun`]: Linux provider and mock device
//! - [`error`]: Device-specific error types
//!
//! ## Architecture Position
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 nthlink-vpn                         │
//! │   controller ── pump ── sink / protector            │
//! │                    │                                │
//! │                    ▼                                │
//! │             nthlink-tun  ◄── You are here           │
//! │        (device provisioning and packet I/O)        │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Platform Support
//! | Platform | Device | Protect |
//! |----------|--------|---------|
//! | Linux | ✅ | ✅ (SO_MARK) |
//! | Others | mock only | mock only |
//!
//! ## ⚠️ Important Note for Next Developer
//! - TUN operations require elevated privileges
//! - Always use traits for testability
//! - Platform-specific code must be isolated
//! - Mock implementations available with `mock` feature
//!
//! ## Last Modified
//! v0.1.0 - Initial device layer

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod traits;
pub mod tun;

// Re-export primary types
pub use error::{DeviceError, Result};
pub use traits::{Cidr, DeviceProvider, DeviceRequest, SocketHandle, TunDevice};

#[cfg(target_os = "linux")]
pub use tun::{LinuxTun, LinuxTunProvider};

#[cfg(any(test, feature = "mock"))]
pub use tun::{MockDeviceProvider, MockTun};
