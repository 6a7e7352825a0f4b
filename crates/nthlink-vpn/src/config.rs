// ============================================
// File: crates/nthlink-vpn/src/config.rs
// ============================================
//! # Tunnel Configuration
//!
//! ## Creation Reason
//! The proxy endpoint, credentials and tunnel addressing are external
//! input handed to `TunnelController::start` as one immutable value,
//! loaded from TOML.
//!
//! ## Main Functionality
//! - `TunnelConfig`: Main configuration structure
//! - TOML file loading and parsing
//! - Per-section validation
//! - `DeviceRequest` / `TransportParams` derivation
//!
//! ## Configuration Sections
//! - `endpoint`: Remote proxy host and port
//! - `credentials`: Proxy method, shared secret, obfuscation prefix
//! - `tunnel`: Device name, address, DNS, routes, exclusions, MTU, buffer
//! - `logging`: Log level
//!
//! ## Example Configuration
//! ```toml
//! [endpoint]
//! host = "proxy.example.com"
//! port = 443
//!
//! [credentials]
//! method = "chacha20-ietf-poly1305"
//! secret = "password"
//! prefix = ""
//!
//! [tunnel]
//! device_name = "nthlink0"
//! address = "10.255.0.1/30"
//! dns_servers = ["1.1.1.1"]
//! routes = ["0.0.0.0/0"]
//! excluded_applications = []
//! mtu = 1500
//! read_buffer_size = 1501
//!
//! [logging]
//! level = "info"
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - The tunnel's own application is always excluded, even if the file
//!   does not list it
//! - `Secret` never prints its contents and is wiped on drop
//!
//! ## Last Modified
//! v0.1.0 - Initial configuration implementation
//! v0.1.1 - `endpoint.host` is required

use std::fmt;
use std::net::IpAddr;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop};

use nthlink_tun::{Cidr, DeviceRequest};

use crate::error::{Result, TunnelError};
use crate::transport::TransportParams;

/// Application identifier the tunnel excludes from its own capture.
pub const SELF_APPLICATION: &str = env!("CARGO_PKG_NAME");

// ============================================
// TunnelConfig
// ============================================

/// Complete tunnel configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Remote proxy endpoint.
    #[serde(default)]
    pub endpoint: EndpointConfig,

    /// Proxy credentials.
    #[serde(default)]
    pub credentials: CredentialsConfig,

    /// Local device configuration.
    #[serde(default)]
    pub tunnel: TunnelDeviceConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TunnelConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read, parsed or validated.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let path_str = path.display().to_string();

        info!("Loading configuration from: {}", path_str);

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| TunnelError::config_load(&path_str, e.to_string()))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| TunnelError::config_load(&path_str, e.to_string()))?;

        config.validate()?;

        info!("Configuration loaded successfully");
        Ok(config)
    }

    /// Loads configuration from a string (useful for testing).
    ///
    /// # Errors
    /// Returns error if the content cannot be parsed or validated.
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| TunnelError::config_load("<string>", e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validates every section.
    ///
    /// # Errors
    /// Returns the first invalid field.
    pub fn validate(&self) -> Result<()> {
        self.endpoint.validate()?;
        self.credentials.validate()?;
        self.tunnel.validate()?;
        Ok(())
    }

    /// Builds the device request, always excluding `self_application`.
    ///
    /// # Errors
    /// Returns error if an address, DNS server or route does not parse.
    pub fn device_request(&self, self_application: &str) -> Result<DeviceRequest> {
        let tunnel = &self.tunnel;
        let mut request = DeviceRequest::new(&tunnel.device_name)
            .with_address(tunnel.address()?)
            .with_mtu(tunnel.mtu);

        for dns in tunnel.dns_servers()? {
            request = request.with_dns_server(dns);
        }
        for route in tunnel.routes()? {
            request = request.with_route(route);
        }

        request = request.with_disallowed_application(self_application);
        for app in &tunnel.excluded_applications {
            request = request.with_disallowed_application(app.as_str());
        }

        Ok(request)
    }

    /// Parameters handed to the transport client at start.
    #[must_use]
    pub fn transport_params(&self) -> TransportParams {
        TransportParams {
            endpoint: self.endpoint.address(),
            method: self.credentials.method.clone(),
            secret: self.credentials.secret.clone(),
            prefix: self.credentials.prefix.clone(),
        }
    }
}

// ============================================
// EndpointConfig
// ============================================

/// Remote proxy endpoint section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Proxy host name or IP address. Required; there is no built-in
    /// endpoint.
    #[serde(default)]
    pub host: String,

    /// Proxy port.
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_port() -> u16 {
    443
}

impl EndpointConfig {
    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(TunnelError::config_invalid("endpoint.host", "is required"));
        }
        if self.port == 0 {
            return Err(TunnelError::config_invalid("endpoint.port", "port cannot be 0"));
        }
        Ok(())
    }

    /// Returns `host:port`, bracketing IPv6 literals.
    #[must_use]
    pub fn address(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: default_port(),
        }
    }
}

// ============================================
// CredentialsConfig
// ============================================

/// Proxy credentials section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialsConfig {
    /// Proxy cipher/method identifier.
    #[serde(default = "default_method")]
    pub method: String,

    /// Shared secret.
    #[serde(default)]
    pub secret: Secret,

    /// Obfuscation prefix prepended to the first bytes of a connection.
    #[serde(default)]
    pub prefix: String,
}

fn default_method() -> String {
    "chacha20-ietf-poly1305".to_string()
}

impl CredentialsConfig {
    fn validate(&self) -> Result<()> {
        if self.method.trim().is_empty() {
            return Err(TunnelError::config_invalid("credentials.method", "cannot be empty"));
        }
        Ok(())
    }
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            method: default_method(),
            secret: Secret::default(),
            prefix: String::new(),
        }
    }
}

// ============================================
// Secret
// ============================================

/// Shared secret, wiped from memory on drop and never printed.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wraps a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(<redacted>)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ============================================
// TunnelDeviceConfig
// ============================================

/// Local tunnel device section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelDeviceConfig {
    /// Device name.
    #[serde(default = "default_device_name")]
    pub device_name: String,

    /// Device address in CIDR notation.
    #[serde(default = "default_address")]
    pub address: String,

    /// DNS servers used while the tunnel is up.
    #[serde(default = "default_dns_servers")]
    pub dns_servers: Vec<String>,

    /// Ranges routed into the tunnel.
    #[serde(default = "default_routes")]
    pub routes: Vec<String>,

    /// Extra applications excluded from capture.
    #[serde(default)]
    pub excluded_applications: Vec<String>,

    /// MTU size.
    #[serde(default = "default_mtu")]
    pub mtu: u16,

    /// Capacity of the pump's reusable read buffer.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,
}

fn default_device_name() -> String {
    "nthlink0".to_string()
}

fn default_address() -> String {
    "10.255.0.1/30".to_string()
}

fn default_dns_servers() -> Vec<String> {
    vec!["1.1.1.1".to_string()]
}

fn default_routes() -> Vec<String> {
    vec!["0.0.0.0/0".to_string()]
}

fn default_mtu() -> u16 {
    1500
}

fn default_read_buffer_size() -> usize {
    1501
}

impl TunnelDeviceConfig {
    fn validate(&self) -> Result<()> {
        if self.device_name.is_empty() {
            return Err(TunnelError::config_invalid("tunnel.device_name", "cannot be empty"));
        }

        if self.device_name.len() > 15 {
            return Err(TunnelError::config_invalid(
                "tunnel.device_name",
                "cannot exceed 15 characters",
            ));
        }

        self.address()?;
        self.dns_servers()?;

        if self.routes()?.is_empty() {
            return Err(TunnelError::config_invalid(
                "tunnel.routes",
                "at least one route is required",
            ));
        }

        if self.mtu < 576 {
            return Err(TunnelError::config_invalid("tunnel.mtu", "must be at least 576"));
        }

        if self.mtu > 9000 {
            return Err(TunnelError::config_invalid("tunnel.mtu", "cannot exceed 9000"));
        }

        if self.read_buffer_size < usize::from(self.mtu) {
            return Err(TunnelError::config_invalid(
                "tunnel.read_buffer_size",
                "must be at least the MTU",
            ));
        }

        if self.read_buffer_size > 65_535 {
            return Err(TunnelError::config_invalid(
                "tunnel.read_buffer_size",
                "cannot exceed 65535",
            ));
        }

        Ok(())
    }

    /// Parses the device address.
    ///
    /// # Errors
    /// Returns error if the address is not valid CIDR.
    pub fn address(&self) -> Result<Cidr> {
        self.address
            .parse()
            .map_err(|e| TunnelError::config_invalid("tunnel.address", format!("{e}")))
    }

    /// Parses the DNS server list.
    ///
    /// # Errors
    /// Returns error if any entry is not an IP address.
    pub fn dns_servers(&self) -> Result<Vec<IpAddr>> {
        self.dns_servers
            .iter()
            .map(|s| {
                s.parse().map_err(|_| {
                    TunnelError::config_invalid("tunnel.dns_servers", format!("invalid address '{s}'"))
                })
            })
            .collect()
    }

    /// Parses the route list.
    ///
    /// # Errors
    /// Returns error if any entry is not valid CIDR.
    pub fn routes(&self) -> Result<Vec<Cidr>> {
        self.routes
            .iter()
            .map(|s| {
                s.parse()
                    .map_err(|e| TunnelError::config_invalid("tunnel.routes", format!("{e}")))
            })
            .collect()
    }
}

impl Default for TunnelDeviceConfig {
    fn default() -> Self {
        Self {
            device_name: default_device_name(),
            address: default_address(),
            dns_servers: default_dns_servers(),
            routes: default_routes(),
            excluded_applications: Vec::new(),
            mtu: default_mtu(),
            read_buffer_size: default_read_buffer_size(),
        }
    }
}

// ============================================
// LoggingConfig
// ============================================

/// Logging configuration section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

// ============================================
// Tests
// ============================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let mut config = TunnelConfig::default();
        assert_eq!(config.tunnel.read_buffer_size, 1501);

        // No endpoint is built in
        let err = config.validate().unwrap_err();
        assert!(err.is_config_error());
        assert!(err.to_string().contains("endpoint.host"));

        config.endpoint.host = "proxy.example.com".into();
        assert!(config.validate().is_ok());
        assert_eq!(config.endpoint.address(), "proxy.example.com:443");
    }

    #[test]
    fn test_full_config_format() {
        let toml = r#"
            [endpoint]
            host = "203.0.113.7"
            port = 8388

            [credentials]
            method = "aes-256-gcm"
            secret = "hunter2"
            prefix = "\u0016\u0003\u0001"

            [tunnel]
            device_name = "nthlink1"
            address = "10.8.0.2/24"
            dns_servers = ["9.9.9.9", "1.0.0.1"]
            routes = ["0.0.0.0/0", "fd00::/8"]
            excluded_applications = ["org.example.bank"]
            mtu = 1400
            read_buffer_size = 2048

            [logging]
            level = "debug"
        "#;

        let config = TunnelConfig::from_str(toml).unwrap();
        assert_eq!(config.endpoint.port, 8388);
        assert_eq!(config.credentials.secret.expose(), "hunter2");
        assert_eq!(config.credentials.prefix, "\u{16}\u{3}\u{1}");
        assert_eq!(config.tunnel.routes().unwrap().len(), 2);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = TunnelConfig::from_str(
            r#"
            [endpoint]
            host = "proxy.example.com"
        "#,
        )
        .unwrap();

        assert_eq!(config.endpoint.port, 443);
        assert_eq!(config.tunnel.device_name, "nthlink0");
        assert_eq!(config.tunnel.dns_servers, vec!["1.1.1.1".to_string()]);
    }

    #[test]
    fn test_invalid_configs() {
        let err = TunnelConfig::from_str("[credentials]\nsecret = \"hunter2\"").unwrap_err();
        assert!(err.to_string().contains("endpoint.host"), "{err}");

        let cases = [
            "port = 0",
            "host = \"\"",
            "host = \"   \"",
            "[credentials]\nmethod = \"\"",
            "[tunnel]\naddress = \"10.0.0.1\"",
            "[tunnel]\ndns_servers = [\"not-an-ip\"]",
            "[tunnel]\nroutes = []",
            "[tunnel]\nroutes = [\"0.0.0.0/40\"]",
            "[tunnel]\nmtu = 100",
            "[tunnel]\nmtu = 1500\nread_buffer_size = 1000",
            "[tunnel]\ndevice_name = \"this-name-is-too-long\"",
        ];

        for case in cases {
            let content = if case.starts_with("host") {
                format!("[endpoint]\n{case}")
            } else {
                format!("[endpoint]\nhost = \"proxy.example.com\"\n{case}")
            };
            let err = TunnelConfig::from_str(&content).unwrap_err();
            assert!(err.is_config_error(), "expected config error for {case:?}: {err}");
        }
    }

    #[test]
    fn test_device_request_always_excludes_self() {
        let mut config = TunnelConfig::default();
        config.tunnel.excluded_applications = vec!["org.example.bank".into(), SELF_APPLICATION.into()];

        let request = config.device_request(SELF_APPLICATION).unwrap();
        assert_eq!(
            request.disallowed_applications,
            vec![SELF_APPLICATION.to_string(), "org.example.bank".to_string()]
        );
        assert_eq!(request.routes, vec![Cidr::default_v4()]);
        assert_eq!(request.address.to_string(), "10.255.0.1/30");
        assert_eq!(request.dns_servers, vec!["1.1.1.1".parse::<IpAddr>().unwrap()]);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn test_transport_params() {
        let mut config = TunnelConfig::default();
        config.endpoint.host = "2001:db8::1".into();
        config.credentials.secret = Secret::new("s3cret");

        let params = config.transport_params();
        assert_eq!(params.endpoint, "[2001:db8::1]:443");
        assert_eq!(params.secret.expose(), "s3cret");
        assert!(!format!("{params:?}").contains("s3cret"));
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let secret = Secret::from("password");
        assert_eq!(format!("{secret:?}"), "Secret(<redacted>)");
        assert!(!format!("{:?}", TunnelConfig {
            credentials: CredentialsConfig { secret, ..CredentialsConfig::default() },
            ..TunnelConfig::default()
        })
        .contains("password"));
    }
}
