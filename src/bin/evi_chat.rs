//! Voice chat from the terminal
//!
//! Talks to the speech service with the default microphone and speakers.
//! Typed lines are sent as user text; `/mute`, `/unmute`, `/pause`,
//! `/resume` and `/quit` control the session.
//!
//! Usage: `evi-chat [--config <path>] [--list-devices]`

use anyhow::{Context, Result};
use parking_lot::RwLock;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use evi_voice_client::{
    audio::{device::list_devices, AudioHub, AudioRouteManager, CpalEngine, CpalPlatform, RouteEvent},
    config::AppConfig,
    network::{ServerMessage, WebSocketConnector},
    session::{ConnectionController, SessionEvent, SessionState},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // rustls needs a process-wide crypto provider before the first wss:// connect
    if rustls::crypto::ring::default_provider().install_default().is_err() {
        tracing::debug!("Crypto provider already installed");
    }

    let args: Vec<String> = std::env::args().skip(1).collect();
    if args.iter().any(|a| a == "--list-devices") {
        print_devices();
        return Ok(());
    }

    let config = match args.iter().position(|a| a == "--config") {
        Some(i) => {
            let path: PathBuf = args.get(i + 1).context("--config needs a path")?.into();
            AppConfig::load(&path)?
        }
        None => AppConfig::load_default()?,
    };
    let credentials = config
        .credentials()
        .context("no credentials: set HUME_API_KEY or HUME_ACCESS_TOKEN, or [api] in the config file")?;

    tracing::info!("Starting voice chat against {}", config.api.host);

    let selection = Arc::new(RwLock::new(config.audio.input_device.clone()));
    let platform = Arc::new(CpalPlatform::new(selection.clone(), config.audio.device_poll_interval()));
    let engine = Arc::new(CpalEngine::new(selection));
    let hub = AudioHub::new(engine, AudioRouteManager::new(platform), config.audio.hub_settings());

    let connector = WebSocketConnector::new(&config.api.host, credentials)?.with_connect_timeout(config.connect_timeout());
    let controller = ConnectionController::new(hub, Arc::new(connector));

    let printer = tokio::spawn(print_events(controller.subscribe()));

    let info = controller
        .connect(config.session_params(), config.session_settings())
        .await
        .context("failed to start chat")?;
    println!("\n=== Connected ===");
    println!("  Chat:       {}", info.chat_id);
    println!("  Chat group: {}  (set session.resumed_chat_group_id to continue later)", info.chat_group_id);
    println!("  Speak, or type a message. Ctrl+C to stop.\n");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = controller.wait_for_state(SessionState::Disconnected) => {
                tracing::info!("Session ended");
                break;
            }
            line = lines.next_line() => {
                let Some(line) = line? else { break };
                if !handle_command(&controller, line.trim()).await {
                    break;
                }
            }
        }
    }

    if let Err(e) = controller.disconnect().await {
        tracing::error!("Disconnect failed: {}", e);
    }
    printer.abort();
    tracing::info!("Voice chat stopped");
    Ok(())
}

/// Returns false when the user asked to quit
async fn handle_command(controller: &ConnectionController, line: &str) -> bool {
    let result = match line {
        "" => Ok(()),
        "/quit" => return false,
        "/mute" => {
            controller.mute_mic(true);
            Ok(())
        }
        "/unmute" => {
            controller.mute_mic(false);
            Ok(())
        }
        "/pause" => controller.pause_assistant().await,
        "/resume" => controller.resume_assistant().await,
        text => controller.send_user_input(text).await,
    };
    if let Err(e) = result {
        tracing::warn!("Command failed: {}", e);
    }
    true
}

async fn print_events(mut events: broadcast::Receiver<SessionEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        };
        match event {
            SessionEvent::Message(ServerMessage::UserMessage(msg)) if !msg.interim => {
                println!("you: {}", msg.message.content.unwrap_or_default());
            }
            SessionEvent::Message(ServerMessage::AssistantMessage(msg)) => {
                println!("evi: {}", msg.message.content.unwrap_or_default());
            }
            SessionEvent::Message(ServerMessage::ToolCall(call)) => {
                println!("[tool call {} {}({})]", call.tool_call_id, call.name, call.parameters);
            }
            SessionEvent::Error(e) => eprintln!("error: {}", e),
            SessionEvent::Route(RouteEvent::RouteChanged { input, output, .. }) => {
                println!("[audio route: {} -> {}]", input, output);
            }
            SessionEvent::WillDisconnect => println!("[disconnecting]"),
            _ => {}
        }
    }
}

fn print_devices() {
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();
}
