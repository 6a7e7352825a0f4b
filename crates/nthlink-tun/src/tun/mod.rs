// ============================================
// File: crates/nthlink-tun/src/tun/mod.rs
// ============================================
//! # TUN Device Module
//!
//! ## Creation Reason
//! Groups the concrete device providers behind the `TunDevice` and
//! `DeviceProvider` traits.
//!
//! ## Platform Implementations
//! - `linux`: `/dev/net/tun` with IFF_TUN, policy routing and SO_MARK
//! - `mock`: In-memory implementation for testing
//!
//! ## What is a TUN Device?
//! A TUN device is a virtual network interface that operates at
//! Layer 3 (IP). Routing the default route into it hands every outgoing
//! IP packet of the host to the process holding the device.
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     User Space                            │
//! │  ┌────────────────┐          ┌────────────────────────┐  │
//! │  │  Application   │          │   nthlink tunnel core  │  │
//! │  │  (browser etc) │          │  pump ──► transport    │  │
//! │  └───────┬────────┘          └───────────┬────────────┘  │
//! │          │ IP packets                    │ read/write    │
//! │          ▼                               ▼               │
//! ├──────────────────────────────────────────────────────────┤
//! │                     Kernel Space                          │
//! │  ┌────────────────────────────────────────────────────┐  │
//! │  │               TUN Device (nthlink0)                 │  │
//! │  └────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - TUN operations require root or CAP_NET_ADMIN capability
//! - TUN packets are raw IP (no Ethernet header)
//! - Device names are limited to 15 characters on Linux
//!
//! ## Last Modified
//! v0.1.0 - Initial TUN module structure

// Platform-specific implementations
#[cfg(target_os = "linux")]
pub mod linux;

// Mock implementation for testing
#[cfg(any(test, feature = "mock"))]
pub mod mock;

#[cfg(target_os = "linux")]
pub use linux::{LinuxTun, LinuxTunProvider};

#[cfg(any(test, feature = "mock"))]
pub use mock::{MockDeviceProvider, MockTun};
