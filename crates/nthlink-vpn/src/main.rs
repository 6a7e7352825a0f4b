// ============================================
// File: crates/nthlink-vpn/src/main.rs
// ============================================
//! # nthlink VPN Entry Point
//!
//! ## Creation Reason
//! Command-line front end for checking tunnel configuration files and
//! the device they describe.
//!
//! ## Usage
//! ```bash
//! nthlink-vpn validate --config /etc/nthlink/tunnel.toml
//! nthlink-vpn show --config /etc/nthlink/tunnel.toml
//!
//! # Linux, needs CAP_NET_ADMIN
//! nthlink-vpn device-check --config /etc/nthlink/tunnel.toml
//! ```
//!
//! ## ⚠️ Important Note for Next Developer
//! - There is no `start` command: the proxy transport is provided by the
//!   embedding application, not by this binary
//!
//! ## Last Modified
//! v0.1.0 - Initial CLI implementation

use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use nthlink_vpn::config::SELF_APPLICATION;
use nthlink_vpn::TunnelConfig;

// ============================================
// CLI Definition
// ============================================

/// nthlink VPN tunnel tools
#[derive(Parser, Debug)]
#[command(name = "nthlink-vpn")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Subcommand to execute
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/nthlink/tunnel.toml")]
        config: PathBuf,
    },

    /// Show the device request a tunnel start would provision
    Show {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/nthlink/tunnel.toml")]
        config: PathBuf,
    },

    /// Bring the tunnel device up without a transport, until Ctrl+C
    #[command(hide = true)]
    DeviceCheck {
        /// Path to configuration file
        #[arg(short, long, default_value = "/etc/nthlink/tunnel.toml")]
        config: PathBuf,
    },
}

// ============================================
// Main
// ============================================

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    init_logging("info");

    let result = match cli.command {
        Commands::Validate { config } => cmd_validate(&config).await,
        Commands::Show { config } => cmd_show(&config).await,
        Commands::DeviceCheck { config } => cmd_device_check(&config).await,
    };

    if let Err(e) = result {
        error!("{}", e);
        std::process::exit(1);
    }
}

// ============================================
// Commands
// ============================================

/// Validates configuration file.
async fn cmd_validate(config_path: &Path) -> anyhow::Result<()> {
    let config = TunnelConfig::load(config_path).await?;

    println!("✅ Configuration is valid");
    println!();
    println!("Endpoint:");
    println!("   Proxy:      {}", config.endpoint.address());
    println!("   Method:     {}", config.credentials.method);
    println!(
        "   Secret:     {}",
        if config.credentials.secret.expose().is_empty() { "(empty)" } else { "(set)" }
    );
    println!();
    println!("Tunnel:");
    println!("   Device:     {}", config.tunnel.device_name);
    println!("   Address:    {}", config.tunnel.address);
    println!("   MTU:        {}", config.tunnel.mtu);
    println!("   Buffer:     {} bytes", config.tunnel.read_buffer_size);
    println!();

    Ok(())
}

/// Prints the device request derived from the configuration.
async fn cmd_show(config_path: &Path) -> anyhow::Result<()> {
    let config = TunnelConfig::load(config_path).await?;
    let request = config.device_request(SELF_APPLICATION)?;

    println!("Device:       {}", request.name);
    println!("Address:      {}", request.address);
    println!("MTU:          {}", request.mtu);
    for dns in &request.dns_servers {
        println!("DNS:          {dns}");
    }
    for route in &request.routes {
        println!("Route:        {route}");
    }
    for app in &request.disallowed_applications {
        println!("Excluded:     {app}");
    }

    Ok(())
}

/// Establishes the device, holds it until Ctrl+C, then closes it.
#[cfg(target_os = "linux")]
async fn cmd_device_check(config_path: &Path) -> anyhow::Result<()> {
    use nthlink_tun::{DeviceProvider, LinuxTunProvider};

    let config = TunnelConfig::load(config_path).await?;
    init_logging(&config.logging.level);

    let request = config.device_request(SELF_APPLICATION)?;
    let device = LinuxTunProvider::default().establish(request).await?;

    info!(device = device.name(), mtu = device.mtu(), "Device is up, press Ctrl+C to close");
    tokio::signal::ctrl_c().await?;

    info!("Closing device");
    device.close()?;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
async fn cmd_device_check(_config_path: &Path) -> anyhow::Result<()> {
    anyhow::bail!("device-check is only supported on Linux")
}

// ============================================
// Helper Functions
// ============================================

/// Initializes the tracing subscriber.
fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true))
        .with(filter)
        .try_init()
        .ok();
}
