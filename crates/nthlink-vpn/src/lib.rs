// ============================================
// File: crates/nthlink-vpn/src/lib.rs
// ============================================
//! # nthlink VPN Tunnel Core
//!
//! ## Creation Reason
//! Connects a tunnel device to an external proxy transport and manages
//! the lifecycle of that connection.
//!
//! ## Main Functionality
//!
//! ### Modules
//! - [`controller`]: Start/stop state machine
//! - [`pump`]: Device-to-transport packet loop
//! - [`adapters`]: Sink and protector handed to the transport
//! - [`transport`]: Transport client contract
//! - [`presenter`]: User-visible session notifications
//! - [`config`]: Tunnel configuration
//! - [`error`]: Tunnel error types
//!
//! ## Architecture Overview
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    TunnelController                      │
//! │   Stopped ─► Starting ─► Running ─► Stopping ─► Stopped  │
//! └──────┬───────────────────┬───────────────────┬───────────┘
//!        │ establish         │ start/stop        │ on_running
//!        ▼                   ▼                   ▼ on_stopped
//! ┌─────────────┐     ┌─────────────────┐  ┌──────────────┐
//! │  Device     │     │ TransportClient │  │  Presenter   │
//! │  Provider   │     └───▲─────────┬───┘  └──────────────┘
//! └──────┬──────┘         │         │
//!        ▼                │ write   │ sink / protect
//! ┌─────────────┐  read  ┌┴─────────┴──┐
//! │  TunDevice  │◄──────►│ PacketPump  │
//! └─────────────┘        │  + adapters │
//!                        └─────────────┘
//! ```
//!
//! ## Data Flow
//! ```text
//! App → TunDevice → PacketPump → TransportClient → Proxy
//! App ← TunDevice ← DeviceSink ← TransportClient ← Proxy
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - One session per controller; create more controllers for more tunnels
//! - `MockTransport` is available with the `mock` feature
//!
//! ## Last Modified
//! v0.1.0 - Initial tunnel core

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod adapters;
pub mod config;
pub mod controller;
pub mod error;
pub mod presenter;
pub mod pump;
pub mod transport;

// Re-export primary types
pub use adapters::{PacketSink, SocketProtector};
pub use config::TunnelConfig;
pub use controller::{TunnelController, TunnelState};
pub use error::{Result, TunnelError};
pub use presenter::{SessionInfo, SessionPresenter, TracingPresenter};
pub use transport::{TransportClient, TransportClientError, TransportParams};
