//! Configuration module
//!
//! CLI argument parsing with environment variable support. The engine itself
//! never touches the command line; everything it needs is carried in
//! [`ConnConfig`] and the listener parameters built here.

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::address::Address;

/// Parse duration string (e.g., "60s", "2m", "1h") or plain seconds
fn parse_duration(s: &str) -> Result<Duration, String> {
    if let Ok(d) = humantime::parse_duration(s) {
        return Ok(d);
    }
    s.parse::<u64>().map(Duration::from_secs).map_err(|_| {
        format!(
            "Invalid duration '{}'. Use formats like '60s', '2m', '1h' or plain seconds",
            s
        )
    })
}

/// Listener operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ListenerMode {
    /// Accept local cleartext, obfuscate toward a fixed remote target
    SimpleClient,
    /// Accept remote obfuscated traffic, forward cleartext to a fixed target
    SimpleServer,
    /// Accept local SOCKS5, resolve per connection, obfuscate toward the bridge
    SocksClient,
}

impl ListenerMode {
    /// Whether this mode requires a fixed target address
    pub fn needs_target(&self) -> bool {
        !matches!(self, ListenerMode::SocksClient)
    }
}

impl std::fmt::Display for ListenerMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ListenerMode::SimpleClient => write!(f, "simple-client"),
            ListenerMode::SimpleServer => write!(f, "simple-server"),
            ListenerMode::SocksClient => write!(f, "socks-client"),
        }
    }
}

/// CLI arguments
///
/// Supports environment variables with VEILTUN_ prefix
#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Traffic obfuscation tunnel proxy")]
pub struct CliArgs {
    /// Listener mode
    #[arg(long, env = "VEILTUN_MODE", value_enum)]
    pub mode: ListenerMode,

    /// Local address to bind (e.g. "127.0.0.1:1080")
    #[arg(long, env = "VEILTUN_LISTEN")]
    pub listen: String,

    /// Fixed target address ("host:port"); required in simple modes
    #[arg(long, env = "VEILTUN_TARGET")]
    pub target: Option<String>,

    /// Obfuscation protocol name (null, xor)
    #[arg(long, env = "VEILTUN_PROTOCOL", default_value = "null")]
    pub protocol: String,

    /// Shared protocol key (required by the xor protocol)
    #[arg(long, env = "VEILTUN_PROTOCOL_KEY")]
    pub protocol_key: Option<String>,

    /// Log level: trace, debug, info, warn, error
    #[arg(long, env = "VEILTUN_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    // ==================== Performance Tuning ====================
    /// Connection idle timeout - close if no data transferred (default: 5m)
    #[arg(long, env = "VEILTUN_IDLE_TIMEOUT", default_value = "5m", value_parser = parse_duration, help_heading = "Performance")]
    pub idle_timeout: Duration,

    /// TCP connect timeout to the downstream peer (default: 10s)
    #[arg(long, env = "VEILTUN_CONNECT_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub connect_timeout: Duration,

    /// Timeout for the whole SOCKS negotiation phase (default: 10s)
    #[arg(long, env = "VEILTUN_NEGOTIATION_TIMEOUT", default_value = "10s", value_parser = parse_duration, help_heading = "Performance")]
    pub negotiation_timeout: Duration,

    /// Read chunk size in bytes (default: 16KB)
    #[arg(long, env = "VEILTUN_READ_CHUNK", default_value_t = 16 * 1024, help_heading = "Performance")]
    pub read_chunk: usize,

    /// Stop reading a side once its peer has this many bytes buffered (default: 256KB)
    #[arg(long, env = "VEILTUN_WRITE_HIGH_WATER", default_value_t = 256 * 1024, help_heading = "Performance")]
    pub write_high_water: usize,

    /// Enable TCP_NODELAY (default: true)
    #[arg(
        long,
        env = "VEILTUN_TCP_NODELAY",
        default_value_t = true,
        help_heading = "Performance"
    )]
    pub tcp_nodelay: bool,
}

impl CliArgs {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Validate the CLI arguments
    pub fn validate(&self) -> Result<()> {
        self.listen
            .parse::<SocketAddr>()
            .map_err(|_| anyhow!("Invalid listen address: {}", self.listen))?;

        if self.mode.needs_target() {
            match &self.target {
                Some(t) => {
                    parse_target(t)?;
                }
                None => {
                    return Err(anyhow!("--target is required in {} mode", self.mode));
                }
            }
        }

        if self.idle_timeout.is_zero() {
            return Err(anyhow!("idle_timeout must be greater than 0"));
        }
        if self.connect_timeout.is_zero() {
            return Err(anyhow!("connect_timeout must be greater than 0"));
        }
        if self.read_chunk == 0 {
            return Err(anyhow!("read_chunk must be greater than 0"));
        }

        Ok(())
    }

    /// Bind address (validated)
    pub fn listen_addr(&self) -> Result<SocketAddr> {
        self.listen
            .parse()
            .map_err(|_| anyhow!("Invalid listen address: {}", self.listen))
    }

    /// Fixed target, if configured
    pub fn target_addr(&self) -> Result<Option<Address>> {
        self.target.as_deref().map(parse_target).transpose()
    }
}

/// Parse "host:port" into an [`Address`]; literal IPs stay literal,
/// anything else becomes a domain resolved per connection.
pub fn parse_target(s: &str) -> Result<Address> {
    if let Ok(sa) = s.parse::<SocketAddr>() {
        return Ok(Address::from(sa));
    }

    let (host, port) = s
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("Invalid target '{}': expected host:port", s))?;
    let port: u16 = port
        .parse()
        .map_err(|_| anyhow!("Invalid target port in '{}'", s))?;
    if host.is_empty() {
        return Err(anyhow!("Invalid target '{}': empty host", s));
    }

    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => Ok(Address::IPv4(ip.octets(), port)),
        Ok(IpAddr::V6(ip)) => Ok(Address::IPv6(ip.octets(), port)),
        Err(_) => {
            if host.len() > 255 {
                return Err(anyhow!("Invalid target '{}': hostname too long", s));
            }
            Ok(Address::Domain(host.to_string(), port))
        }
    }
}

/// Connection performance configuration
#[derive(Debug, Clone, Copy)]
pub struct ConnConfig {
    /// Connection idle timeout
    pub idle_timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// SOCKS negotiation timeout
    pub negotiation_timeout: Duration,
    /// Read chunk size
    pub read_chunk: usize,
    /// Peer write-buffer level above which reading pauses
    pub write_high_water: usize,
    /// Enable TCP_NODELAY
    pub tcp_nodelay: bool,
}

impl ConnConfig {
    /// Create from CLI args
    pub fn from_cli(cli: &CliArgs) -> Self {
        Self {
            idle_timeout: cli.idle_timeout,
            connect_timeout: cli.connect_timeout,
            negotiation_timeout: cli.negotiation_timeout,
            read_chunk: cli.read_chunk,
            write_high_water: cli.write_high_water,
            tcp_nodelay: cli.tcp_nodelay,
        }
    }
}

impl Default for ConnConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            negotiation_timeout: Duration::from_secs(10),
            read_chunk: 16 * 1024,
            write_high_water: 256 * 1024,
            tcp_nodelay: true,
        }
    }
}
