// ============================================
// File: crates/nthlink-tun/src/traits.rs
// ============================================
//! # Device Traits
//!
//! ## Creation Reason
//! Defines abstract interfaces for the tunnel device and for the platform
//! service that provisions it, so the tunnel core can be driven by a real
//! TUN interface or by an in-memory mock.
//!
//! ## Main Functionality
//! - `TunDevice`: duplex raw-IP packet handle (blocking reads)
//! - `DeviceProvider`: establishes a device from a `DeviceRequest`
//! - `DeviceRequest`: addressing, routes, DNS and app exclusions
//! - `Cidr`: address/prefix pair used for addresses and routes
//!
//! ## Design Philosophy
//! - Reads block; `close()` is the only way to unblock a pending read
//! - Read and write take `&self` so the two directions run concurrently
//! - Provisioning is async because it may wait on the platform or the user
//!
//! ## ⚠️ Important Note for Next Developer
//! - Implementations must be Send + Sync; the pump reads on a blocking
//!   worker while the transport writes from its own threads
//! - `close()` must be idempotent
//!
//! ## Last Modified
//! v0.1.0 - Initial trait definitions

use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{DeviceError, Result};

/// Raw socket descriptor handed to [`TunDevice::protect`].
pub type SocketHandle = i32;

// ============================================
// TunDevice Trait
// ============================================

/// Abstract interface for an established tunnel device.
///
/// # Data Format
/// Data read from and written to the device is raw IP packets
/// (no Ethernet headers, no packet-info prefix).
///
/// # Example
/// ```ignore
/// fn drain<T: TunDevice + ?Sized>(tun: &T) -> Result<()> {
///     let mut buf = [0u8; 1501];
///     loop {
///         let len = tun.read(&mut buf)?;
///         // Process IP packet in buf[..len]
///     }
/// }
/// ```
pub trait TunDevice: Send + Sync {
    /// Reads one IP packet, blocking until one is available or the device
    /// is closed.
    ///
    /// # Returns
    /// Number of bytes read into `buf`
    ///
    /// # Errors
    /// `DeviceError::Closed` once `close()` was called, or a read error.
    fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Writes one IP packet to the device.
    ///
    /// # Errors
    /// Returns error if the write fails or the device is closed.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Switches the device between blocking and non-blocking I/O.
    ///
    /// # Errors
    /// Returns error if the descriptor flags cannot be changed.
    fn set_blocking(&self, blocking: bool) -> Result<()>;

    /// Excludes a socket from tunnel capture.
    ///
    /// Returns `false` if the socket could not be protected.
    fn protect(&self, socket: SocketHandle) -> bool;

    /// Closes the device and wakes any blocked reader.
    ///
    /// # Errors
    /// Returns error if platform cleanup (routes, rules) fails. The device
    /// is considered closed regardless.
    fn close(&self) -> Result<()>;

    /// Returns `true` once `close()` has been called.
    fn is_closed(&self) -> bool;

    /// Returns the device name.
    fn name(&self) -> &str;

    /// Returns the MTU (Maximum Transmission Unit).
    fn mtu(&self) -> u16;
}

// ============================================
// DeviceProvider Trait
// ============================================

/// Platform service that turns a [`DeviceRequest`] into a live device.
///
/// Establishing is the only step that may require consent from the user
/// or the platform; a refusal surfaces as [`DeviceError::EstablishDenied`]
/// or [`DeviceError::PermissionDenied`].
#[async_trait]
pub trait DeviceProvider: Send + Sync {
    /// Establishes a device configured with addressing, routes, DNS and
    /// application exclusions from `request`.
    ///
    /// # Errors
    /// Returns error if the device cannot be created or configured.
    async fn establish(&self, request: DeviceRequest) -> Result<Arc<dyn TunDevice>>;
}

// ============================================
// Cidr
// ============================================

/// An IP address with a prefix length, e.g. `10.255.0.1/30` or `0.0.0.0/0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    /// Address part.
    pub addr: IpAddr,
    /// Prefix length in bits.
    pub prefix: u8,
}

impl Cidr {
    /// Creates a new `Cidr`.
    ///
    /// # Errors
    /// Returns error if the prefix is longer than the address family allows.
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(DeviceError::invalid_config(
                "prefix",
                format!("prefix length {prefix} exceeds {max} for {addr}"),
            ));
        }
        Ok(Self { addr, prefix })
    }

    /// The IPv4 default route, `0.0.0.0/0`.
    #[must_use]
    pub const fn default_v4() -> Self {
        Self {
            addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            prefix: 0,
        }
    }
}

impl FromStr for Cidr {
    type Err = DeviceError;

    fn from_str(s: &str) -> Result<Self> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| DeviceError::invalid_config("cidr", format!("'{s}' is not in CIDR notation")))?;

        let addr: IpAddr = addr
            .trim()
            .parse()
            .map_err(|_| DeviceError::invalid_config("cidr", format!("invalid address in '{s}'")))?;

        let prefix: u8 = prefix
            .trim()
            .parse()
            .map_err(|_| DeviceError::invalid_config("cidr", format!("invalid prefix length in '{s}'")))?;

        Self::new(addr, prefix)
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

// ============================================
// DeviceRequest
// ============================================

/// Everything the platform needs to establish a tunnel device.
///
/// # Example
/// ```
/// use nthlink_tun::traits::{Cidr, DeviceRequest};
///
/// let request = DeviceRequest::new("nthlink0")
///     .with_address("10.255.0.1/30".parse().unwrap())
///     .with_dns_server("1.1.1.1".parse().unwrap())
///     .with_route(Cidr::default_v4())
///     .with_disallowed_application("com.nthlink.outline")
///     .with_mtu(1500);
///
/// assert!(request.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceRequest {
    /// Device name (e.g., "tun0", "nthlink0").
    pub name: String,
    /// Local address and prefix length of the device.
    pub address: Cidr,
    /// DNS servers pushed to the host while the tunnel is up.
    pub dns_servers: Vec<IpAddr>,
    /// Ranges routed into the device.
    pub routes: Vec<Cidr>,
    /// Applications whose traffic bypasses the device.
    pub disallowed_applications: Vec<String>,
    /// MTU size.
    pub mtu: u16,
}

impl DeviceRequest {
    /// Creates a request with no routes, no DNS and no exclusions.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: Cidr {
                addr: IpAddr::V4(Ipv4Addr::new(10, 255, 0, 1)),
                prefix: 30,
            },
            dns_servers: Vec::new(),
            routes: Vec::new(),
            disallowed_applications: Vec::new(),
            mtu: 1500,
        }
    }

    /// Sets the local address.
    #[must_use]
    pub const fn with_address(mut self, address: Cidr) -> Self {
        self.address = address;
        self
    }

    /// Adds a DNS server.
    #[must_use]
    pub fn with_dns_server(mut self, server: IpAddr) -> Self {
        self.dns_servers.push(server);
        self
    }

    /// Adds a routed range.
    #[must_use]
    pub fn with_route(mut self, route: Cidr) -> Self {
        self.routes.push(route);
        self
    }

    /// Excludes an application from capture. Duplicates are ignored.
    #[must_use]
    pub fn with_disallowed_application(mut self, app: impl Into<String>) -> Self {
        let app = app.into();
        if !self.disallowed_applications.contains(&app) {
            self.disallowed_applications.push(app);
        }
        self
    }

    /// Sets the MTU.
    #[must_use]
    pub const fn with_mtu(mut self, mtu: u16) -> Self {
        self.mtu = mtu;
        self
    }

    /// Validates the request.
    ///
    /// # Errors
    /// Returns error if the request is invalid.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(DeviceError::invalid_config(
                "name",
                "device name cannot be empty",
            ));
        }

        if self.name.len() > 15 {
            return Err(DeviceError::invalid_config(
                "name",
                "device name cannot exceed 15 characters",
            ));
        }

        if self.mtu < 576 {
            return Err(DeviceError::invalid_config(
                "mtu",
                "MTU must be at least 576 bytes",
            ));
        }

        if self.mtu > 9000 {
            return Err(DeviceError::invalid_config(
                "mtu",
                "MTU cannot exceed 9000 bytes",
            ));
        }

        if self.routes.is_empty() {
            return Err(DeviceError::invalid_config(
                "routes",
                "at least one route is required",
            ));
        }

        Ok(())
    }
}

impl Default for DeviceRequest {
    fn default() -> Self {
        Self::new("nthlink0").with_route(Cidr::default_v4())
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parse() {
        let cidr: Cidr = "10.255.0.1/30".parse().unwrap();
        assert_eq!(cidr.addr, IpAddr::V4(Ipv4Addr::new(10, 255, 0, 1)));
        assert_eq!(cidr.prefix, 30);
        assert_eq!(cidr.to_string(), "10.255.0.1/30");

        let v6: Cidr = "fd00::1/64".parse().unwrap();
        assert!(v6.addr.is_ipv6());
    }

    #[test]
    fn test_cidr_rejects_garbage() {
        assert!("10.0.0.1".parse::<Cidr>().is_err());
        assert!("10.0.0.1/33".parse::<Cidr>().is_err());
        assert!("nope/8".parse::<Cidr>().is_err());
        assert!("10.0.0.0/x".parse::<Cidr>().is_err());
        assert!("fd00::/129".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_request_builder() {
        let request = DeviceRequest::new("test0")
            .with_address("10.0.0.2/24".parse().unwrap())
            .with_dns_server("9.9.9.9".parse().unwrap())
            .with_route(Cidr::default_v4())
            .with_disallowed_application("app.a")
            .with_disallowed_application("app.a")
            .with_mtu(1400);

        assert_eq!(request.address.prefix, 24);
        assert_eq!(request.dns_servers.len(), 1);
        assert_eq!(request.routes, vec![Cidr::default_v4()]);
        assert_eq!(request.disallowed_applications, vec!["app.a".to_string()]);
        assert_eq!(request.mtu, 1400);
    }

    #[test]
    fn test_request_validation() {
        assert!(DeviceRequest::default().validate().is_ok());

        // Empty name
        let request = DeviceRequest { name: String::new(), ..DeviceRequest::default() };
        assert!(request.validate().is_err());

        // Name too long
        let request = DeviceRequest { name: "a".repeat(20), ..DeviceRequest::default() };
        assert!(request.validate().is_err());

        // MTU out of range
        assert!(DeviceRequest::default().with_mtu(100).validate().is_err());
        assert!(DeviceRequest::default().with_mtu(10000).validate().is_err());

        // No routes
        assert!(DeviceRequest::new("tun0").validate().is_err());
    }
}
