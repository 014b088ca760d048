//! `Whisper`: line-oriented chat client over the message-sync core.
//!
//! Opens one conversation, prints its history and streams updates. Lines
//! typed on stdin are sent as messages; a few slash commands drive the
//! remaining operations. Configuration via CLI flags, environment
//! variables, or config file (`~/.config/whisper/config.toml`).
//!
//! ```bash
//! # Simulated backend with demo data
//! cargo run --bin whisper -- --conversation demo
//!
//! # Live backend
//! cargo run --bin whisper -- --backend live --conversation 42 \
//!     --api-url https://chat.example.com/api --ws-url wss://chat.example.com
//! ```

use std::collections::HashSet;
use std::io;
use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use whisper::api::ChatApi;
use whisper::api::http::HttpApi;
use whisper::auth::{AuthProvider, StaticToken};
use whisper::config::{BackendKind, CliArgs, ClientConfig};
use whisper::sim::SimulatedServer;
use whisper::sync::{ChatSync, Session, SyncEvent};
use whisper::transport::Connector;
use whisper::transport::websocket::WebSocketConnector;
use whisper_proto::message::{ChatUser, Conversation, ConversationId, Message, MessageId, UserId};

const HELP: &str = "commands: /more /retry <id> /delete <id> /read /resync /quit";

#[tokio::main]
async fn main() -> io::Result<()> {
    let cli = CliArgs::parse();

    // CLI args > config file > defaults.
    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!(backend = ?config.backend, "whisper starting");

    let local = UserId::new(config.user_id.clone());
    let conversation_id = ConversationId::new(config.conversation.clone().unwrap_or_else(|| "demo".to_string()));
    let conversation = Conversation::new(conversation_id.clone(), vec![local.clone()]);

    let result = match config.backend {
        BackendKind::Simulated => {
            let me = ChatUser {
                id: local.clone(),
                username: config.user_id.clone(),
            };
            let server = SimulatedServer::with_demo_data(&me, &conversation_id);
            run(server.api(me.clone()), server.connector(me), local, &config, conversation).await
        }
        BackendKind::Live => {
            let endpoints = config.live_endpoints().map_err(io::Error::other)?;
            let auth: Arc<dyn AuthProvider> = Arc::new(StaticToken::new(endpoints.token));
            let api = HttpApi::new(&endpoints.api_url, Arc::clone(&auth), config.sync.confirm_timeout)
                .map_err(io::Error::other)?;
            let connector = WebSocketConnector::new(endpoints.ws_url, auth, config.reconnect.connect_timeout);
            run(api, connector, local, &config, conversation).await
        }
    };

    tracing::info!("whisper exiting");
    result
}

/// Initialize file-based logging.
///
/// Logs go to a file so stdout stays free for the conversation. Returns a
/// [`WorkerGuard`] that must be held until shutdown to flush buffered
/// entries.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("whisper.log");
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

/// Main loop: stdin lines in, sync events out.
async fn run<A: ChatApi, C: Connector + Clone>(
    api: A,
    connector: C,
    local: UserId,
    config: &ClientConfig,
    conversation: Conversation,
) -> io::Result<()> {
    let (mut sync, mut events) = ChatSync::new(
        api,
        connector,
        local.clone(),
        config.sync.clone(),
        config.reconnect.clone(),
    );
    let session = sync.select(conversation).await;
    println!("-- {} ({HELP})", session.conversation().id);

    let mut printed: HashSet<MessageId> = HashSet::new();
    print_new(&session, &local, &mut printed);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                if !handle_line(&session, line.trim()).await {
                    break;
                }
            }
            Some(event) = events.recv() => {
                match event {
                    SyncEvent::MessagesChanged { .. } => print_new(&session, &local, &mut printed),
                    SyncEvent::StatusChanged { message_id, status } => {
                        println!("   {message_id} is {status}");
                    }
                    SyncEvent::ConnectionChanged { state, degraded } => {
                        let suffix = if degraded { " (request/response only)" } else { "" };
                        println!("-- connection {state:?}{suffix}");
                    }
                    SyncEvent::TypingChanged { users } if !users.is_empty() => {
                        let names: Vec<&str> = users.iter().map(UserId::as_str).collect();
                        println!("-- {} typing", names.join(", "));
                    }
                    SyncEvent::UsersChanged { users } => {
                        let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
                        println!("-- here: {}", names.join(", "));
                    }
                    SyncEvent::Error { message } => println!("!! {message}"),
                    SyncEvent::AuthenticationRequired => println!("!! credential rejected, log in again"),
                    SyncEvent::TypingChanged { .. } | SyncEvent::LoadingChanged { .. } => {}
                }
            }
        }
    }

    sync.leave().await;
    Ok(())
}

/// Executes one input line. Returns `false` to quit.
async fn handle_line<A: ChatApi, C: Connector>(session: &Session<A, C>, line: &str) -> bool {
    let (command, arg) = line.split_once(' ').unwrap_or((line, ""));
    match command {
        "" => {}
        "/quit" => return false,
        "/more" => match session.load_more_messages().await {
            Ok(outcome) => println!("-- {outcome:?}"),
            Err(e) => println!("!! {e}"),
        },
        "/resync" => {
            if let Err(e) = session.load_messages(true).await {
                println!("!! {e}");
            }
        }
        "/read" => {
            let n = session.mark_as_read().await;
            println!("-- marked {n} read");
        }
        "/retry" => {
            if let Err(e) = session.retry_message(&MessageId::new(arg.trim())).await {
                println!("!! {e}");
            }
        }
        "/delete" => {
            if let Err(e) = session.delete_message(&MessageId::new(arg.trim())).await {
                println!("!! {e}");
            }
        }
        _ if command.starts_with('/') => println!("{HELP}"),
        _ => {
            session.send_typing_status().await;
            if let Err(e) = session.send_message(line).await {
                println!("!! {e}");
            }
        }
    }
    true
}

/// Prints messages not shown yet, oldest first.
fn print_new<A: ChatApi, C: Connector>(
    session: &Session<A, C>,
    local: &UserId,
    printed: &mut HashSet<MessageId>,
) {
    let snapshot = session.snapshot();
    for message in &snapshot.messages {
        if printed.insert(message.id.clone()) {
            println!("{}", format_message(message, local));
        }
    }
}

fn format_message(message: &Message, local: &UserId) -> String {
    let time = message
        .timestamp
        .as_datetime()
        .with_timezone(&chrono::Local)
        .format("%H:%M");
    let author = if message.is_from(local) {
        "you"
    } else {
        message
            .sender
            .username
            .as_deref()
            .unwrap_or_else(|| message.sender.id.as_str())
    };
    let status = if message.is_from(local) {
        format!(" [{}]", message.status)
    } else {
        String::new()
    };
    format!("{time} {author}: {}{status}  ({})", message.content, message.id)
}
