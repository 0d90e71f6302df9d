use std::sync::Arc;

use anyhow::Context;
use ecoswap_chat::api::HttpConversationApi;
use ecoswap_chat::auth::{AuthSession, StaticSessionProvider};
use ecoswap_chat::bus::{EventBus, SessionEvent};
use ecoswap_chat::chat::ChatMessage;
use ecoswap_chat::clock::SystemClock;
use ecoswap_chat::config::Config;
use ecoswap_chat::proposal::{ProposalDraft, ResponseAction};
use ecoswap_chat::realtime::{LocalHub, PhoenixRealtime, RealtimeProvider};
use ecoswap_chat::{SessionController, SessionDeps, SessionRegistry};
use futures::StreamExt;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq)]
enum Command {
    Say(String),
    Offer { price: f64, description: String },
    Accept,
    Reject,
    Counter { price: f64, description: String },
    Image(String),
    Location { lat: f64, lng: f64, label: String },
    Read,
    Quit,
}

fn parse_price(args: &str, usage: &str) -> Result<(f64, String), String> {
    let mut parts = args.splitn(2, ' ');
    let price = parts
        .next()
        .and_then(|p| p.parse::<f64>().ok())
        .ok_or_else(|| usage.to_string())?;
    let description = parts
        .next()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map_or_else(|| format!("{:.2}", price), str::to_string);
    Ok((price, description))
}

fn parse_command(line: &str) -> Result<Option<Command>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let Some(rest) = line.strip_prefix('/') else {
        return Ok(Some(Command::Say(line.to_string())));
    };
    let (name, args) = rest.split_once(' ').unwrap_or((rest, ""));
    let args = args.trim();
    let command = match name {
        "offer" => {
            let (price, description) = parse_price(args, "usage: /offer <price> [description]")?;
            Command::Offer { price, description }
        }
        "counter" => {
            let (price, description) = parse_price(args, "usage: /counter <price> [description]")?;
            Command::Counter { price, description }
        }
        "accept" => Command::Accept,
        "reject" => Command::Reject,
        "image" if !args.is_empty() => Command::Image(args.to_string()),
        "image" => return Err("usage: /image <path>".to_string()),
        "location" => {
            let mut parts = args.splitn(3, ' ');
            let lat = parts.next().and_then(|v| v.parse().ok());
            let lng = parts.next().and_then(|v| v.parse().ok());
            match (lat, lng) {
                (Some(lat), Some(lng)) => Command::Location {
                    lat,
                    lng,
                    label: parts.next().unwrap_or("").trim().to_string(),
                },
                _ => return Err("usage: /location <lat> <lng> [label]".to_string()),
            }
        }
        "read" => Command::Read,
        "quit" | "exit" => Command::Quit,
        other => return Err(format!("unknown command /{}", other)),
    };
    Ok(Some(command))
}

fn content_type_for(path: &str) -> &'static str {
    match path.rsplit('.').next().map(str::to_ascii_lowercase).as_deref() {
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("webp") => "image/webp",
        _ => "image/jpeg",
    }
}

async fn run_command(session: &SessionController, command: Command) -> ecoswap_chat::Result<()> {
    match command {
        Command::Say(text) => {
            session.send_text(text).await?;
        }
        Command::Offer { price, description } => {
            let proposal = session.propose(ProposalDraft::price(price, description)).await?;
            println!("offer {} sent", proposal.id);
        }
        Command::Accept | Command::Reject | Command::Counter { .. } => {
            let Some(active) = session.active_proposal() else {
                println!("no open proposal");
                return Ok(());
            };
            let (action, counter) = match command {
                Command::Accept => (ResponseAction::Accept, None),
                Command::Reject => (ResponseAction::Reject, None),
                Command::Counter { price, description } => (
                    ResponseAction::Counter,
                    Some(ProposalDraft::price(price, description)),
                ),
                _ => return Ok(()),
            };
            session.respond(&active.id, action, counter, None).await?;
        }
        Command::Image(path) => {
            let bytes = tokio::fs::read(&path).await.map_err(|e| {
                ecoswap_chat::SessionError::Validation(format!("cannot read {}: {}", path, e))
            })?;
            let file_name = std::path::Path::new(&path)
                .file_name()
                .map_or_else(|| "image".to_string(), |n| n.to_string_lossy().into_owned());
            session
                .send_image(&file_name, content_type_for(&path), bytes, "")
                .await?;
        }
        Command::Location { lat, lng, label } => {
            session.send_location(lat, lng, label).await?;
        }
        Command::Read => {
            let flipped = session.mark_all_read();
            println!("{} messages marked read", flipped.len());
        }
        Command::Quit => {}
    }
    Ok(())
}

fn print_message(message: &ChatMessage) {
    let at = message.created_at.format("%H:%M");
    println!("[{}] {}: {}", at, message.sender_id, message.content);
}

fn print_event(session: &SessionController, event: &SessionEvent) {
    match event {
        SessionEvent::MessagesChanged { .. } => {
            if let Some(last) = session.last_message() {
                print_message(&last);
            }
        }
        SessionEvent::PresenceChanged { presence, .. } => {
            println!("* counterpart is {:?}", presence)
        }
        SessionEvent::ConnectionChanged { state, .. } => println!("* connection {:?}", state),
        SessionEvent::ProposalsChanged { active, .. } => {
            if let Some(id) = active {
                println!("* open proposal {}", id);
            }
        }
        SessionEvent::DraftRestored { content, .. } => {
            println!("* not sent, draft restored: {}", content)
        }
        SessionEvent::AuthRequired => println!("* session expired, sign in again"),
        SessionEvent::Notification { level, message, .. } => println!("* {:?}: {}", level, message),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file
    if let Err(e) = dotenvy::dotenv() {
        info!("No .env file found or failed to load: {}", e);
    }

    // Initialize logging with default filter if RUST_LOG is not set
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = Config::from_env()?;
    let access_token =
        std::env::var("ECOSWAP_ACCESS_TOKEN").context("ECOSWAP_ACCESS_TOKEN must be set")?;
    let user_id = std::env::var("ECOSWAP_USER_ID").context("ECOSWAP_USER_ID must be set")?;
    let chat_id = std::env::var("ECOSWAP_CHAT_ID").context("ECOSWAP_CHAT_ID must be set")?;

    info!("EcoSwap chat client starting for chat {}", chat_id);

    let realtime: Arc<dyn RealtimeProvider> = match PhoenixRealtime::from_config(&config) {
        Some(phoenix) => Arc::new(phoenix),
        None => {
            warn!("ECOSWAP_REALTIME_URL not set, using the in-process hub");
            Arc::new(LocalHub::new())
        }
    };
    let bus = Arc::new(EventBus::new());
    let deps = SessionDeps {
        api: Arc::new(HttpConversationApi::new(&config)?),
        auth: Arc::new(StaticSessionProvider::new(AuthSession::new(access_token, user_id))),
        realtime,
        bus: bus.clone(),
        clock: Arc::new(SystemClock),
    };
    let registry = SessionRegistry::new(config, deps);
    let session = registry.open(&chat_id).await?;

    for message in session.messages() {
        print_message(&message);
    }

    let printer_session = session.clone();
    let events = bus.stream();
    let printer = tokio::spawn(async move {
        tokio::pin!(events);
        while let Some(event) = events.next().await {
            print_event(&printer_session, &event);
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received Ctrl+C, shutting down...");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else {
                    break;
                };
                match parse_command(&line) {
                    Ok(Some(Command::Quit)) => break,
                    Ok(Some(command)) => {
                        if let Err(e) = run_command(&session, command).await {
                            error!("{}", e);
                        }
                    }
                    Ok(None) => {}
                    Err(usage) => println!("{}", usage),
                }
            }
        }
    }

    registry.close_all().await;
    printer.abort();
    Ok(())
}
