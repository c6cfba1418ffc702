//! `LanLink` line-oriented client.
//!
//! Joins a room on a signaling relay, waits for the other member and then
//! relays typed lines over the direct channel.
//!
//! ```bash
//! # Default relay ws://127.0.0.1:8765/ws, room "demo-room"
//! cargo run --bin lanlink
//!
//! # Explicit relay and room
//! cargo run --bin lanlink -- --relay-url ws://192.168.1.10:8765/ws --room kitchen
//! ```
//!
//! Input lines are sent as text messages, except for these commands:
//!
//! | Command               | Action                                 |
//! |-----------------------|----------------------------------------|
//! | `/file <path>`        | stream a file to the peer              |
//! | `/media audio|video`  | start a local media track              |
//! | `/stop audio|video`   | stop a local media track               |
//! | `/state`              | print the session state                |
//! | `/quit`               | disconnect and exit                    |

use std::io;
use std::path::{Path, PathBuf};

use clap::Parser;
use lanlink::config::{CliArgs, ClientConfig};
use lanlink::events::SessionEvent;
use lanlink::session::{Session, SessionState};
use lanlink::transport::Payload;
use lanlink_proto::signal::MediaKind;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

/// One parsed input line.
#[derive(Debug, PartialEq, Eq)]
enum Input {
    Text(String),
    File(PathBuf),
    StartMedia(MediaKind),
    StopMedia(MediaKind),
    State,
    Quit,
    Invalid(String),
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            std::process::exit(1);
        }
    };

    let _log_guard = init_logging(&config.log_level, config.log_file.as_deref());
    tracing::info!(relay = %config.relay_url, room = %config.room, "lanlink starting");

    let session = match Session::new(config.to_session_config()) {
        Ok(session) => session,
        Err(e) => {
            tracing::error!(error = %e, "cannot start session");
            eprintln!("Error starting session: {e}");
            std::process::exit(1);
        }
    };
    let result = run(&session, &config).await;

    if let Err(e) = session.disconnect().await {
        tracing::warn!(error = %e, "disconnect failed");
    }
    tracing::info!("lanlink exiting");
    result
}

/// Initialize logging.
///
/// With a log file, output goes through a non-blocking appender and the
/// returned [`WorkerGuard`] must be held until shutdown. Otherwise logs go
/// to stderr so they do not interleave with chat output on stdout.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let Some(log_path) = file_path else {
        tracing_subscriber::fmt()
            .with_writer(io::stderr)
            .with_env_filter(env_filter)
            .init();
        return None;
    };

    let log_dir = log_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Connects, then multiplexes stdin lines and session events until `/quit`
/// or end of input.
async fn run(session: &Session, config: &ClientConfig) -> io::Result<()> {
    let mut events = session.events().subscribe_all();

    if let Err(e) = session.connect(&config.room).await {
        print_line(&format!("could not join {}: {e}", config.room));
        return Ok(());
    }
    print_line(&format!(
        "joined {} as {}, waiting for a peer",
        config.room,
        session.id()
    ));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                if !handle_input(session, parse_input(&line)).await {
                    return Ok(());
                }
            }
            event = events.recv() => {
                let Some(event) = event else {
                    return Ok(());
                };
                show_event(event, &config.download_dir).await;
            }
        }
    }
}

/// Executes one input line. Returns `false` to exit.
async fn handle_input(session: &Session, input: Input) -> bool {
    let result = match input {
        Input::Text(text) if text.is_empty() => Ok(()),
        Input::Text(text) => session.send(Payload::Text(text)).await,
        Input::File(path) => session.send_file_path(&path).await,
        Input::StartMedia(kind) => session.start_media(kind).await,
        Input::StopMedia(kind) => session.stop_media(kind).await,
        Input::State => {
            print_line(&format!("state: {}", session.state()));
            Ok(())
        }
        Input::Quit => return false,
        Input::Invalid(reason) => {
            print_line(&reason);
            Ok(())
        }
    };
    if let Err(e) = result {
        print_line(&format!("error: {e}"));
    }
    true
}

fn parse_input(line: &str) -> Input {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    let Some(command) = trimmed.strip_prefix('/') else {
        return Input::Text(trimmed.to_string());
    };
    let (name, arg) = command
        .split_once(char::is_whitespace)
        .map_or((command, ""), |(n, a)| (n, a.trim()));

    match name {
        "quit" | "exit" => Input::Quit,
        "state" => Input::State,
        "file" if !arg.is_empty() => Input::File(PathBuf::from(arg)),
        "file" => Input::Invalid("usage: /file <path>".to_string()),
        "media" | "stop" => match parse_media_kind(arg) {
            Some(kind) if name == "media" => Input::StartMedia(kind),
            Some(kind) => Input::StopMedia(kind),
            None => Input::Invalid(format!("usage: /{name} audio|video")),
        },
        other => Input::Invalid(format!("unknown command: /{other}")),
    }
}

fn parse_media_kind(arg: &str) -> Option<MediaKind> {
    match arg {
        "audio" => Some(MediaKind::Audio),
        "video" => Some(MediaKind::Video),
        _ => None,
    }
}

async fn show_event(event: SessionEvent, download_dir: &Path) {
    match event {
        SessionEvent::StateChanged { to, .. } => match to {
            SessionState::Connected => print_line("connected, type to chat"),
            SessionState::Closed => print_line("peer disconnected"),
            _ => tracing::debug!(state = %to, "state changed"),
        },
        SessionEvent::Message { from, payload } => match payload {
            Payload::Text(text) => print_line(&format!("<{from}> {text}")),
            Payload::Binary(bytes) => {
                print_line(&format!("<{from}> [{} bytes of binary]", bytes.len()));
            }
        },
        SessionEvent::TransferStarted { name, size } => {
            print_line(&format!("receiving {name} ({size} bytes)"));
        }
        SessionEvent::TransferProgress { .. } | SessionEvent::MediaFrame { .. } => {}
        SessionEvent::FileReceived(file) => match save_file(download_dir, &file.name, &file.data).await {
            Ok(path) => print_line(&format!("saved {} to {}", file.name, path.display())),
            Err(e) => print_line(&format!("could not save {}: {e}", file.name)),
        },
        SessionEvent::FileSent { name, size } => print_line(&format!("sent {name} ({size} bytes)")),
        SessionEvent::TransferFailed { name, error } => {
            print_line(&format!("transfer of {name} failed: {error}"));
        }
        SessionEvent::LocalTrackStarted(kind) => print_line(&format!("started local {kind}")),
        SessionEvent::LocalTrackStopped(kind) => print_line(&format!("stopped local {kind}")),
        SessionEvent::RemoteTrack(kind) => print_line(&format!("peer started {kind}")),
        SessionEvent::RemoteTrackEnded(kind) => print_line(&format!("peer stopped {kind}")),
        SessionEvent::MediaNegotiated { revision, media } => {
            tracing::info!(revision, ?media, "media negotiated");
        }
        SessionEvent::Failed { reason } => print_line(&format!("session failed: {reason}")),
        SessionEvent::ChannelError { reason } => {
            print_line(&format!("direct channel lost: {reason}"));
        }
    }
}

/// Writes a received file into `dir`, keeping only the final path
/// component of the sender's name.
async fn save_file(dir: &Path, name: &str, data: &[u8]) -> io::Result<PathBuf> {
    let file_name = Path::new(name)
        .file_name()
        .map_or_else(|| "received.bin".into(), std::ffi::OsStr::to_os_string);
    tokio::fs::create_dir_all(dir).await?;
    let path = dir.join(file_name);
    tokio::fs::write(&path, data).await?;
    Ok(path)
}

fn print_line(text: &str) {
    println!("[{}] {text}", chrono::Local::now().format("%H:%M:%S"));
}
