//! Client settings.
//!
//! A value given on the command line (or through its `LANLINK_*`
//! environment variable) wins over `~/.config/lanlink/config.toml`, which
//! wins over the built-in default. The per-user file may be absent; a file
//! named with `--config` may not.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use lanlink_proto::channel::DEFAULT_MAX_FRAME_SIZE;
use lanlink_proto::signal::SessionId;

use crate::session::{
    DEFAULT_CHANNEL_CAPACITY, DEFAULT_CONNECT_TIMEOUT, DEFAULT_DIAL_TIMEOUT,
    DEFAULT_NEGOTIATION_TIMEOUT, SessionConfig,
};
use crate::signaling;
use crate::transfer::{self, DEFAULT_CHUNK_SIZE};

/// Room joined when none is configured.
pub const DEFAULT_ROOM: &str = "demo-room";

/// Relay URL used when none is configured.
pub const DEFAULT_RELAY_URL: &str = "ws://127.0.0.1:8765/ws";


/// Why the client settings could not be assembled.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read settings file {path}: {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file is not valid TOML: {0}")]
    ParseToml(#[from] toml::de::Error),

    /// `field` holds a value that cannot be used.
    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// On-disk layout. Every key is optional so a file can override one
/// setting and leave the rest alone.
#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct SettingsFile {
    network: NetworkSection,
    transfer: TransferSection,
    log: LogSection,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct NetworkSection {
    relay_url: Option<String>,
    room: Option<String>,
    session_id: Option<String>,
    bind_addr: Option<String>,
    connect_timeout_secs: Option<u64>,
    dial_timeout_ms: Option<u64>,
    /// `0` disables the limit.
    negotiation_timeout_secs: Option<u64>,
    channel_capacity: Option<usize>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct TransferSection {
    chunk_size: Option<usize>,
    max_frame_size: Option<usize>,
    download_dir: Option<PathBuf>,
}

#[derive(Debug, Default, serde::Deserialize)]
#[serde(default)]
struct LogSection {
    level: Option<String>,
    file: Option<PathBuf>,
}

/// Command line of `lanlink`.
#[derive(clap::Parser, Debug, Default)]
#[command(version, about = "Join a LAN room and talk to the other member directly")]
pub struct CliArgs {
    /// Relay WebSocket URL (e.g. `ws://192.168.1.10:8765/ws`).
    #[arg(short, long, env = "LANLINK_RELAY_URL")]
    pub relay_url: Option<String>,

    /// Room to join.
    #[arg(short = 'R', long, env = "LANLINK_ROOM")]
    pub room: Option<String>,

    /// Fixed session id instead of a generated one.
    #[arg(long)]
    pub session_id: Option<String>,

    /// Local `ip:port` for the direct channel endpoint.
    #[arg(short = 'b', long = "bind", value_name = "ADDR")]
    pub bind: Option<String>,

    /// Settings file to use instead of the per-user one.
    #[arg(short = 'c', long = "config", value_name = "FILE")]
    pub config_path: Option<PathBuf>,

    /// Where received files are saved.
    #[arg(short, long)]
    pub download_dir: Option<PathBuf>,

    /// Negotiation timeout in seconds; 0 waits forever.
    #[arg(long)]
    pub negotiation_timeout_secs: Option<u64>,

    /// Tracing filter directive, e.g. `debug` or `lanlink=trace`.
    #[arg(long, env = "LANLINK_LOG")]
    pub log_level: Option<String>,

    /// Write logs to this file instead of stderr.
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Settings after layering, every value concrete.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub relay_url: String,
    pub room: String,
    pub session_id: Option<String>,
    pub bind_addr: SocketAddr,
    pub connect_timeout: Duration,
    /// Per-candidate limit when dialing the peer.
    pub dial_timeout: Duration,
    /// `None` waits for a peer indefinitely.
    pub negotiation_timeout: Option<Duration>,
    pub channel_capacity: usize,
    pub chunk_size: usize,
    pub max_frame_size: usize,
    pub download_dir: PathBuf,
    pub log_level: String,
    /// stderr when `None`.
    pub log_file: Option<PathBuf>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: DEFAULT_RELAY_URL.to_string(),
            room: DEFAULT_ROOM.to_string(),
            session_id: None,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 0)),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            negotiation_timeout: Some(DEFAULT_NEGOTIATION_TIMEOUT),
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            download_dir: dirs::download_dir().unwrap_or_else(|| PathBuf::from(".")),
            log_level: String::from("info"),
            log_file: None,
        }
    }
}

impl ClientConfig {
    /// Layers `cli` over the settings file and validates the result.
    ///
    /// # Errors
    ///
    /// [`ConfigError`] when the settings file is unreadable or malformed,
    /// or a layered value fails validation.
    pub fn load(cli: &CliArgs) -> Result<Self, ConfigError> {
        let file = match cli.config_path.as_deref() {
            Some(path) => read_settings(path)?,
            None => read_user_settings()?,
        };
        Self::resolve(cli, &file)
    }

    fn resolve(cli: &CliArgs, file: &SettingsFile) -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let net = &file.network;

        let relay_url =
            pick(cli.relay_url.as_ref(), net.relay_url.as_ref()).unwrap_or(defaults.relay_url);
        signaling::validate_url(&relay_url).map_err(|e| ConfigError::Invalid {
            field: "relay_url",
            reason: e.to_string(),
        })?;

        let room = pick(cli.room.as_ref(), net.room.as_ref()).unwrap_or(defaults.room);
        if room.is_empty() {
            return Err(ConfigError::Invalid {
                field: "room",
                reason: "room name is empty".into(),
            });
        }

        let bind_addr = match cli.bind.as_ref().or(net.bind_addr.as_ref()) {
            Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid {
                field: "bind_addr",
                reason: format!("{raw:?} is not an ip:port address"),
            })?,
            None => defaults.bind_addr,
        };

        let channel_capacity = net.channel_capacity.unwrap_or(defaults.channel_capacity);
        if channel_capacity == 0 {
            return Err(ConfigError::Invalid {
                field: "channel_capacity",
                reason: "a zero-capacity queue can never send".into(),
            });
        }

        let max_frame_size = file
            .transfer
            .max_frame_size
            .unwrap_or(defaults.max_frame_size);
        let chunk_size = file.transfer.chunk_size.unwrap_or(defaults.chunk_size);
        if let Err(reason) = transfer::check_chunk_size(chunk_size, max_frame_size) {
            return Err(ConfigError::Invalid {
                field: "chunk_size",
                reason,
            });
        }

        let negotiation_timeout = match cli
            .negotiation_timeout_secs
            .or(net.negotiation_timeout_secs)
        {
            Some(0) => None,
            Some(secs) => Some(Duration::from_secs(secs)),
            None => defaults.negotiation_timeout,
        };

        Ok(Self {
            relay_url,
            room,
            session_id: pick(cli.session_id.as_ref(), net.session_id.as_ref()),
            bind_addr,
            connect_timeout: net
                .connect_timeout_secs
                .map_or(defaults.connect_timeout, Duration::from_secs),
            dial_timeout: net
                .dial_timeout_ms
                .map_or(defaults.dial_timeout, Duration::from_millis),
            negotiation_timeout,
            channel_capacity,
            chunk_size,
            max_frame_size,
            download_dir: pick(
                cli.download_dir.as_ref(),
                file.transfer.download_dir.as_ref(),
            )
            .unwrap_or(defaults.download_dir),
            log_level: pick(cli.log_level.as_ref(), file.log.level.as_ref())
                .unwrap_or(defaults.log_level),
            log_file: pick(cli.log_file.as_ref(), file.log.file.as_ref()),
        })
    }

    /// Session parameters for [`crate::session::Session::new`].
    #[must_use]
    pub fn to_session_config(&self) -> SessionConfig {
        SessionConfig {
            relay_url: self.relay_url.clone(),
            session_id: self.session_id.clone().map(SessionId::new),
            bind_addr: self.bind_addr,
            chunk_size: self.chunk_size,
            connect_timeout: self.connect_timeout,
            dial_timeout: self.dial_timeout,
            negotiation_timeout: self.negotiation_timeout,
            channel_capacity: self.channel_capacity,
            max_frame_size: self.max_frame_size,
        }
    }
}

/// First of the command-line and file values that is set.
fn pick<T: Clone>(flag: Option<&T>, file: Option<&T>) -> Option<T> {
    flag.or(file).cloned()
}

fn read_settings(path: &Path) -> Result<SettingsFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&text).map_err(ConfigError::from)
}

fn read_user_settings() -> Result<SettingsFile, ConfigError> {
    let Some(path) = dirs::config_dir().map(|dir| dir.join("lanlink/config.toml")) else {
        return Ok(SettingsFile::default());
    };
    if !path.try_exists().unwrap_or(false) {
        return Ok(SettingsFile::default());
    }
    read_settings(&path)
}
