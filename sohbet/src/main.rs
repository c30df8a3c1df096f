//! Sohbet — real-time messaging client.
//!
//! Line-oriented CLI: pick a peer, type to send, watch the conversation
//! update live. Configuration via CLI flags, environment variables, or
//! config file (`~/.config/sohbet/config.toml`).
//!
//! ```bash
//! cargo run --bin sohbet -- --server-url http://127.0.0.1:8000 --token alice
//! ```
//!
//! Commands: `/peers`, `/peer <id>`, `/status`, `/quit`; anything else is
//! sent to the selected peer.

use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use sohbet::config::{CliArgs, ClientConfig};
use sohbet::conversation::DeliveryState;
use sohbet::history::RestClient;
use sohbet::reconnect::ConnectionLink;
use sohbet::session::{SessionEvent, SessionManager};
use sohbet::transport::Credential;
use sohbet::transport::ws::WsConnector;
use sohbet_proto::message::UserId;

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so stdout stays clean for the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("sohbet starting");

    let (Some(server_url), Some(token)) = (config.server_url.clone(), config.token.clone()) else {
        eprintln!("Error: --server-url and --token are required (or set them in the config file)");
        return Ok(());
    };
    let Some(ws_url) = config.resolved_ws_url() else {
        eprintln!("Error: could not determine a WebSocket URL");
        return Ok(());
    };

    let credential = Credential::new(token.clone());
    let connector = WsConnector::new(ws_url);
    let link = ConnectionLink::spawn(
        connector,
        credential.clone(),
        config.reconnect_config(),
        config.frame_buffer,
    );
    let rest = RestClient::new(server_url, credential);
    let session = Arc::new(SessionManager::new(
        UserId::new(token),
        link,
        rest.clone(),
        config.event_buffer,
    ));

    run_repl(&session, &rest, &config).await?;

    session.shutdown();
    tracing::info!("sohbet exiting");
    Ok(())
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("sohbet.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Shared pointer to the concrete session the CLI drives.
type CliSession = Arc<SessionManager<WsConnector, RestClient>>;

/// The interactive loop: session events are rendered by a background task
/// while this task reads commands from stdin.
async fn run_repl(session: &CliSession, rest: &RestClient, config: &ClientConfig) -> io::Result<()> {
    let active_peer: Arc<parking_lot::Mutex<Option<UserId>>> =
        Arc::new(parking_lot::Mutex::new(None));

    if let Some(events) = session.take_events() {
        tokio::spawn(render_events(
            Arc::clone(session),
            events,
            Arc::clone(&active_peer),
            config.timestamp_format.clone(),
        ));
    }

    println!("sohbet — /peers to list partners, /peer <id> to select, /quit to exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match line.split_once(' ') {
            _ if line == "/quit" => break,
            _ if line == "/status" => {
                println!("link: {}", session.link_state());
            }
            _ if line == "/peers" => match rest.list_peers(config.directory_limit).await {
                Ok(entries) => {
                    for entry in entries {
                        println!("  {}  {}", entry.id, entry.display_name);
                    }
                }
                Err(e) => println!("could not list peers: {e}"),
            },
            Some(("/peer", id)) if !id.trim().is_empty() => {
                let peer = UserId::new(id.trim());
                *active_peer.lock() = Some(peer.clone());
                // Rendered through the event stream; errors surface there too.
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    let _ = session.select_peer(peer).await;
                });
            }
            _ if line.starts_with('/') => {
                println!("unknown command: {line}");
            }
            _ => {
                let peer = active_peer.lock().clone();
                match peer {
                    Some(peer) => match session.send_message(&peer, line).await {
                        Ok(_) => {}
                        Err(e) => println!("not sent: {e}"),
                    },
                    None => println!("select a peer first with /peer <id>"),
                }
            }
        }
    }

    Ok(())
}

/// Render session events to stdout, printing each conversation message at
/// most once per incarnation of its store.
async fn render_events(
    session: CliSession,
    mut events: tokio::sync::mpsc::Receiver<SessionEvent>,
    active_peer: Arc<parking_lot::Mutex<Option<UserId>>>,
    timestamp_format: String,
) {
    let mut rendered: HashMap<UserId, usize> = HashMap::new();

    while let Some(event) = events.recv().await {
        match event {
            SessionEvent::ConversationUpdated { peer_id } => {
                if active_peer.lock().as_ref() != Some(&peer_id) {
                    continue;
                }
                let Some(view) = session.conversation_view(&peer_id) else {
                    continue;
                };
                let seen = rendered.entry(peer_id.clone()).or_insert(0);
                if view.len() < *seen {
                    // Store was reseeded; replay from the top.
                    *seen = 0;
                }
                for message in &view[*seen..] {
                    let when = message
                        .timestamp
                        .map_or_else(|| "--:--".to_string(), |ts| {
                            format_timestamp_ms(ts.as_millis(), &timestamp_format)
                        });
                    let marker = match message.delivery {
                        DeliveryState::Pending => " …",
                        DeliveryState::Failed => " ✗",
                        DeliveryState::Confirmed | DeliveryState::Received => "",
                    };
                    println!("[{when}] {}: {}{marker}", message.sender_id, message.content);
                }
                *seen = view.len();
            }
            SessionEvent::ConnectionChanged(state) => {
                println!("-- link {state} --");
            }
            SessionEvent::ServerNotice { message } => {
                println!("-- server: {message} --");
            }
            SessionEvent::HistoryFailed { peer_id, reason } => {
                println!("-- could not load history for {peer_id}: {reason} (select again to retry) --");
            }
        }
    }
}

/// Format an epoch-millisecond timestamp with the configured chrono format.
fn format_timestamp_ms(ms: u64, format: &str) -> String {
    use chrono::{Local, TimeZone};
    let secs = i64::try_from(ms / 1000).unwrap_or(i64::MAX);
    let nsecs = u32::try_from((ms % 1000) * 1_000_000).unwrap_or(0);
    match Local.timestamp_opt(secs, nsecs) {
        chrono::LocalResult::Single(dt) => dt.format(format).to_string(),
        _ => "??:??".to_string(),
    }
}
