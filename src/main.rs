//! Command-line entry point
//!
//! Minimal interactive shell around the session: `start`, `stop`,
//! `status`, `quit`. Client events (status lines, transcripts, state
//! changes) print as they arrive.

use tokio::io::{AsyncBufReadExt, BufReader};

use wakeline::{load_settings, save_settings, spawn_session, ClientEvent};

#[tokio::main]
async fn main() {
    // Load .env file if present (for development convenience)
    // Silently ignore if not found - production uses system env vars
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let settings = load_settings();
    // Persist the effective settings: a first run leaves an editable file,
    // and older files pick up newly added fields.
    if let Err(e) = save_settings(&settings) {
        tracing::warn!("Could not persist settings: {}", e);
    }
    tracing::info!(
        "wakeline starting (service {}, {} Hz)",
        settings.service_url(),
        settings.sample_rate
    );

    let (session, mut client_rx) = spawn_session(settings);

    let printer = tokio::spawn(async move {
        let mut last_state = "idle";
        while let Some(event) = client_rx.recv().await {
            match event {
                ClientEvent::Status(message) => println!("* {}", message),
                ClientEvent::Transcript(t) => {
                    if t.is_final {
                        println!("> {}", t.text);
                    } else {
                        println!("… {}", t.text);
                    }
                }
                ClientEvent::StateChanged(name) => {
                    last_state = name;
                    println!("[{}]", name);
                }
            }
        }
        tracing::debug!("Client event stream ended in state {}", last_state);
    });

    println!("Commands: start | stop | status | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { break };
                match line.trim() {
                    "start" => session.start().await,
                    "stop" => session.stop().await,
                    "status" => println!("(watch the event stream for state changes)"),
                    "quit" | "exit" => break,
                    "" => {}
                    other => println!("Unknown command: {}", other),
                }
            }
        }
    }

    session.stop().await;
    printer.abort();
    tracing::info!("wakeline shut down");
}
