//! Realtime Chat - Terminal Conversation over the Realtime Engine
//!
//! A line-oriented REPL: every line typed is sent as a user message and the
//! assistant's complete reply is printed once it has streamed in. The engine
//! reconnects on its own after a dropped link; the REPL re-runs the session
//! handshake before the next message.
//!
//! # Usage
//!
//! ```bash
//! # Defaults from ~/.config/realtime-engine/engine.toml and the environment
//! OPENAI_API_KEY=sk-... realtime-chat
//!
//! # Custom config and model
//! realtime-chat --config ./chat.toml --model gpt-4o-mini-realtime-preview
//!
//! # Verbose engine logs on stderr
//! realtime-chat --log-level debug
//! ```
//!
//! Type `stats` for response and ping counters. Type `exit`, press Ctrl-D,
//! or press Ctrl-C to quit.

use std::io::Write;
use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::StreamExt;
use tracing::{info, warn};

use realtime_engine::config::default_config_path;
use realtime_engine::{
    load_config_from_path, ConfigOverrides, EngineEvent, EngineStats, RealtimeClient,
    WebSocketConnector,
};

/// Realtime Chat - talk to a realtime model from the terminal
#[derive(Parser, Debug)]
#[command(name = "realtime-chat")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, env = "REALTIME_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Model to request
    #[arg(short = 'm', long, value_name = "MODEL")]
    model: Option<String>,

    /// System instructions for the session
    #[arg(short = 'i', long, value_name = "TEXT")]
    instructions: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "REALTIME_LOG_LEVEL", default_value = "warn")]
    log_level: String,
}

/// Initialize logging on stderr so replies stay readable on stdout
fn init_logging(level: &str) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "realtime_chat={level},realtime_engine={level}"
        ))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();
}

/// Connect if needed and run the session handshake
async fn ensure_session(client: &RealtimeClient) -> Result<()> {
    if !client.connection_state().is_connected() {
        client.connect().await.context("Failed to connect")?;
    }
    if client.session_state().is_ready() {
        return Ok(());
    }

    let handle = client
        .initialize_session(client.default_session())
        .context("Failed to start session")?;
    let info = handle
        .await
        .context("Session handshake failed")?
        .into_session()?;
    info!(session_id = %info.id, model = %info.model, "Session ready");
    Ok(())
}

fn prompt() -> Result<()> {
    let mut stdout = std::io::stdout();
    write!(stdout, "> ")?;
    stdout.flush()?;
    Ok(())
}

/// Report what the engine does on its own
async fn watch_events(mut events: impl tokio_stream::Stream<Item = EngineEvent> + Unpin) {
    while let Some(event) = events.next().await {
        match event {
            EngineEvent::ReconnectScheduled { attempt, delay } => {
                eprintln!("[connection lost, retry {attempt} in {delay:.1?}]");
            }
            EngineEvent::Reconnected { .. } => eprintln!("[reconnected]"),
            EngineEvent::ConnectionExhausted { attempts } => {
                eprintln!("[gave up reconnecting after {attempts} attempts]");
            }
            EngineEvent::SessionExpired => eprintln!("[session expired, starting a new one]"),
            EngineEvent::ServerError { message, .. } => eprintln!("[server: {message}]"),
            _ => {}
        }
    }
}

fn print_stats(stats: &EngineStats) {
    println!(
        "responses: {}, deltas: {}",
        stats.responses_completed, stats.deltas_received
    );
    match stats.link {
        Some(ref link) => println!(
            "pings: {} sent, {} answered, {} missed in a row, last rtt {:?}",
            link.pings_sent, link.pongs_received, link.missed_pongs, link.last_rtt
        ),
        None => println!("link: down"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args.log_level);

    let config_path = args.config.clone().or_else(default_config_path);
    let mut config = load_config_from_path(config_path).context("Failed to load config")?;
    let mut overrides = ConfigOverrides::new();
    if let Some(model) = args.model {
        overrides = overrides.with_model(model);
    }
    if let Some(instructions) = args.instructions {
        overrides = overrides.with_instructions(instructions);
    }
    overrides.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    if config.connection.api_key.is_none() {
        bail!("No API key configured; set OPENAI_API_KEY or connection.api_key");
    }

    info!(
        model = %config.connection.model,
        source = ?config.source(),
        "Realtime chat starting"
    );

    let connector = WebSocketConnector::from_settings(&config.connection);
    let (client, events) = RealtimeClient::with_events(config, connector);
    let watcher = tokio::spawn(watch_events(events));

    ensure_session(&client).await?;
    println!("Connected. Type a message, or `exit` to quit.");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        prompt()?;
        let line = tokio::select! {
            line = lines.next_line() => line.context("Failed to read stdin")?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        };
        let Some(line) = line else {
            println!();
            break;
        };

        let text = line.trim();
        if text.is_empty() {
            continue;
        }
        if text.eq_ignore_ascii_case("exit") {
            break;
        }
        if text.eq_ignore_ascii_case("stats") {
            print_stats(&client.stats());
            continue;
        }

        if let Err(e) = ensure_session(&client).await {
            eprintln!("Error: {e:#}");
            continue;
        }

        tokio::select! {
            reply = client.send_message(text) => match reply {
                Ok(response) => println!("{}", response.text),
                Err(e) => {
                    warn!(error = %e, "Message failed");
                    eprintln!("Error: {e}");
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }

    client.disconnect();
    watcher.abort();
    info!("Realtime chat stopped");
    Ok(())
}
