//! Relay settings: command line and environment first, then
//! `~/.config/lanlink-relay/config.toml`, then built-in values.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::relay::RelayLimits;

/// Why relay settings could not be assembled.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read relay settings at {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("relay settings are not valid TOML: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// A resolved value is out of range.
    #[error("invalid value for {field}: {reason}")]
    Invalid {
        /// Offending setting.
        field: &'static str,
        /// What is wrong with it.
        reason: String,
    },
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct RelayFile {
    server: ServerSection,
}

/// `[server]`; anything left out falls through to the defaults.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default, deny_unknown_fields)]
struct ServerSection {
    bind_addr: Option<String>,
    send_timeout_ms: Option<u64>,
    queue_capacity: Option<usize>,
    max_message_size: Option<usize>,
}

/// Command line of `lanlink-relay`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "LanLink local signaling relay")]
pub struct RelayCliArgs {
    /// Listen address, `host:port`.
    #[arg(short, long, env = "LANLINK_RELAY_ADDR")]
    pub bind: Option<String>,

    /// Port override; replaces the port of the bind address.
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Settings file to use instead of the per-user one.
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config_path: Option<PathBuf>,

    /// Milliseconds a broadcast waits on one slow member before dropping.
    #[arg(long)]
    pub send_timeout_ms: Option<u64>,

    /// Outbound queue capacity per client.
    #[arg(long)]
    pub queue_capacity: Option<usize>,

    /// Largest accepted inbound message in bytes.
    #[arg(long)]
    pub max_message_size: Option<usize>,

    /// Tracing filter directive used when `RUST_LOG` is unset.
    #[arg(long = "log", default_value = "info", env = "LANLINK_RELAY_LOG")]
    pub log_filter: String,
}

/// Relay settings after layering.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub bind_addr: String,
    /// Per-member broadcast send timeout.
    pub send_timeout: Duration,
    /// Outbound queue capacity per client.
    pub queue_capacity: usize,
    /// Largest accepted inbound message in bytes.
    pub max_message_size: usize,
    pub log_filter: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        let limits = RelayLimits::default();
        Self {
            bind_addr: "0.0.0.0:8765".to_string(),
            send_timeout: limits.send_timeout,
            queue_capacity: limits.queue_capacity,
            max_message_size: limits.max_message_size,
            log_filter: String::from("info"),
        }
    }
}

impl RelayConfig {
    /// Layers `cli` over the settings file.
    ///
    /// A file named with `--config` must exist; the per-user file is
    /// optional.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the file is unreadable or malformed, or a
    /// value is out of range.
    pub fn load(cli: &RelayCliArgs) -> Result<Self, ConfigError> {
        let file = match cli.config_path.as_deref() {
            Some(path) => read_settings(path)?,
            None => read_user_settings()?,
        };
        Self::resolve(cli, &file)
    }

    /// Connection limits derived from this configuration.
    #[must_use]
    pub const fn limits(&self) -> RelayLimits {
        RelayLimits {
            send_timeout: self.send_timeout,
            queue_capacity: self.queue_capacity,
            max_message_size: self.max_message_size,
        }
    }

    fn resolve(cli: &RelayCliArgs, file: &RelayFile) -> Result<Self, ConfigError> {
        let base = Self::default();
        let server = &file.server;

        let mut bind_addr = match (&cli.bind, &server.bind_addr) {
            (Some(addr), _) | (None, Some(addr)) => addr.clone(),
            (None, None) => base.bind_addr,
        };
        if let Some(port) = cli.port {
            bind_addr = with_port(&bind_addr, port);
        }

        let queue_capacity = cli
            .queue_capacity
            .or(server.queue_capacity)
            .unwrap_or(base.queue_capacity);
        if queue_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "queue_capacity",
                reason: "must be at least 1".to_string(),
            });
        }

        Ok(Self {
            bind_addr,
            send_timeout: cli
                .send_timeout_ms
                .or(server.send_timeout_ms)
                .map_or(base.send_timeout, Duration::from_millis),
            queue_capacity,
            max_message_size: cli
                .max_message_size
                .or(server.max_message_size)
                .unwrap_or(base.max_message_size),
            log_filter: cli.log_filter.clone(),
        })
    }
}

/// Replaces the port of a `host:port` string (or appends one to a bare host).
fn with_port(bind_addr: &str, port: u16) -> String {
    let host = match bind_addr.rsplit_once(':') {
        Some((host, tail)) if tail.parse::<u16>().is_ok() => host,
        _ => bind_addr,
    };
    format!("{host}:{port}")
}

fn read_settings(path: &Path) -> Result<RelayFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&text).map_err(ConfigError::from)
}

/// Per-user settings; a missing file or config dir means "no overrides".
fn read_user_settings() -> Result<RelayFile, ConfigError> {
    let Some(path) = dirs::config_dir().map(|dir| dir.join("lanlink-relay/config.toml")) else {
        return Ok(RelayFile::default());
    };
    if !path.try_exists().unwrap_or(false) {
        return Ok(RelayFile::default());
    }
    read_settings(&path)
}
