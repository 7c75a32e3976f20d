//! `BowlChat` — resilient terminal chat client.
//!
//! Connects to the backend named in the configuration, prints room and
//! direct messages as they arrive, and sends each stdin line to the room.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/bowlchat/config.toml`).
//!
//! ```bash
//! cargo run --bin bowlchat -- --api-url http://127.0.0.1:8000 --api-key alice
//!
//! # Or via environment variables
//! BOWLCHAT_API_URL=http://127.0.0.1:8000 BOWLCHAT_SESSION_TOKEN=... cargo run --bin bowlchat
//! ```

use std::path::Path;
use std::process::ExitCode;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing_appender::non_blocking::WorkerGuard;

use bowlchat::client::ChatClient;
use bowlchat::config::{CliArgs, ClientConfig};
use bowlchat::input::{self, HELP, Input};
use bowlchat::state::ClientEvent;
use bowlchat_proto::event::ChatMessage;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::load_defaults(&cli)
        }
    };

    // Logs go to a file so stdout stays free for the chat.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("bowlchat starting");

    let (client, events) = match ChatClient::from_config(&config) {
        Ok(built) => built,
        Err(e) => {
            eprintln!("error: {e}");
            return ExitCode::FAILURE;
        }
    };

    let printer = tokio::spawn(print_events(events, config.timestamp_format.clone()));
    if let Err(e) = client.connect().await {
        println!("* connect failed ({e}); retrying in the background");
    }

    run_input_loop(&client).await;

    client.shutdown().await;
    printer.abort();
    tracing::info!("bowlchat exiting");
    ExitCode::SUCCESS
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown to ensure all
/// buffered log entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("bowlchat.log");
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

/// Reads stdin until EOF or `/quit`, dispatching each line.
async fn run_input_loop(client: &ChatClient) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(err = %e, "stdin read failed");
                break;
            }
        };
        let Some(input) = input::parse(&line) else {
            continue;
        };
        match input {
            Input::Send(content) => {
                if let Err(e) = client.send(&content).await {
                    println!("* send failed: {e}");
                }
            }
            Input::Direct { to, content } => {
                if let Err(e) = client.send_direct(&to, &content).await {
                    println!("* send to {to} failed: {e}");
                }
            }
            Input::Who => {
                let online = client.view().presence();
                if online.is_empty() {
                    println!("* nobody online");
                } else {
                    println!("* online: {}", online.join(", "));
                }
            }
            Input::Status => match client.status().await {
                Ok(status) => println!(
                    "* {} (attempts {}, retry pending: {}, max delay {}s)",
                    status.state,
                    status.attempts,
                    status.reconnect_pending,
                    status.max_delay.as_secs()
                ),
                Err(e) => println!("* status unavailable: {e}"),
            },
            Input::Reconnect => {
                client.controller().reset_reconnection().await;
                match client.connect().await {
                    Ok(()) => println!("* connected"),
                    Err(e) => println!("* reconnect failed: {e}"),
                }
            }
            Input::Clear => {
                client.controller().clear_messages().await;
                println!("* messages cleared");
            }
            Input::Help => println!("{HELP}"),
            Input::Quit => break,
            Input::Invalid(hint) => println!("* {hint}"),
        }
    }
}

/// Prints client events until the controller goes away.
async fn print_events(mut events: mpsc::Receiver<ClientEvent>, timestamp_format: String) {
    while let Some(event) = events.recv().await {
        match event {
            ClientEvent::MessageReceived { message, .. } => {
                println!("{}", render_message(&message, &timestamp_format));
            }
            ClientEvent::StateChanged(state) => println!("* {state}"),
            ClientEvent::PresenceSeeded { members } => {
                println!("* online: {}", members.join(", "));
            }
            ClientEvent::PresenceJoined(who) => println!("* {who} joined"),
            ClientEvent::PresenceLeft(who) => println!("* {who} left"),
            ClientEvent::SubscriptionFailed { channel, message } => {
                println!("* could not join {channel}: {message}");
            }
            ClientEvent::ReconnectScheduled { attempt, delay } => {
                println!("* reconnecting in {}s (attempt {attempt})", delay.as_secs());
            }
        }
    }
}

fn render_message(message: &ChatMessage, format: &str) -> String {
    let time = message
        .timestamp
        .as_deref()
        .and_then(|ts| chrono::DateTime::parse_from_rfc3339(ts).ok())
        .map_or_else(
            || chrono::Local::now().format(format).to_string(),
            |ts| ts.with_timezone(&chrono::Local).format(format).to_string(),
        );
    match &message.to {
        None if message.from.is_empty() => format!("[{time}] * {}", message.content),
        Some(to) => format!("[{time}] {} -> {to}: {}", message.from, message.content),
        None => format!("[{time}] {}: {}", message.from, message.content),
    }
}
