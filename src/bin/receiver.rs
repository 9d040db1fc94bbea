//! Audio Receiver Application
//!
//! Answers discovery, asks before accepting new senders and plays their audio.

use anyhow::{Context, Result};
use clap::Parser;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_relay::{
    audio::{AudioBackend, MemoryBackend},
    config::AppConfig,
    pairing::PairedDeviceStore,
    EngineEvent, ReceiverEngine, StreamState, TransportMode,
};

const PAIRED_FILE: &str = "paired_devices.json";

#[derive(Parser, Debug)]
#[command(name = "receiver", about = "Play audio streamed from LAN senders")]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Name announced in discovery responses
    #[arg(short, long)]
    name: Option<String>,

    /// Transport mode: tcp_only, tcp_udp_no_auth, tcp_udp_auth, tls_udp_auth
    #[arg(short, long)]
    mode: Option<TransportMode>,

    /// Accept unpaired senders without asking
    #[arg(long)]
    auto_accept: bool,

    /// Initial playback volume, 0.0 to 1.0
    #[arg(short, long)]
    volume: Option<f32>,

    /// Discard audio instead of playing it
    #[arg(long)]
    null_output: bool,
}

#[cfg(feature = "audio")]
fn hardware_backend() -> Option<Arc<dyn AudioBackend>> {
    Some(Arc::new(lan_audio_relay::audio::CpalBackend))
}

#[cfg(not(feature = "audio"))]
fn hardware_backend() -> Option<Arc<dyn AudioBackend>> {
    None
}

fn make_backend(null_output: bool) -> Arc<dyn AudioBackend> {
    if !null_output {
        if let Some(backend) = hardware_backend() {
            return backend;
        }
        tracing::warn!("Built without hardware audio, discarding received audio");
    }
    Arc::new(MemoryBackend::discarding())
}

fn ask(question: &str) -> Option<String> {
    print!("{question} ");
    std::io::stdout().flush().ok()?;
    let mut line = String::new();
    std::io::stdin().lock().read_line(&mut line).ok()?;
    Some(line.trim().to_lowercase())
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_or_default()?,
    };
    if let Some(name) = &args.name {
        config.device_name = name.replace(';', "_");
    }
    if let Some(mode) = args.mode {
        config.network.transport_mode = mode;
    }
    if let Some(volume) = args.volume {
        config.audio.volume = volume;
    }
    if args.auto_accept {
        config.approval.require_confirmation = false;
    }
    config.validate()?;

    tracing::info!("Starting LAN Audio Receiver '{}'", config.device_name);

    let paired_path = AppConfig::config_dir()
        .map(|dir| dir.join(PAIRED_FILE))
        .context("no config directory for the paired-device list")?;
    let store = Arc::new(PairedDeviceStore::open(
        &paired_path,
        config.approval.require_confirmation,
    )?);
    tracing::info!("{} paired device(s)", store.devices().len());

    let engine = Arc::new(ReceiverEngine::new(
        config,
        make_backend(args.null_output),
        store.clone(),
    )?);
    engine.start()?;

    // Approval reads stdin, so events get their own detached thread
    let events = engine.events();
    let event_engine = engine.clone();
    let event_store = store.clone();
    std::thread::Builder::new()
        .name("receiver-events".into())
        .spawn(move || {
            while let Ok(event) = events.recv() {
                match event {
                    EngineEvent::ConnectionRequested {
                        address,
                        device_name,
                    } => {
                        let answer = ask(&format!(
                            "Accept audio from {device_name} ({address})? [y]es / [n]o / [a]lways:"
                        ))
                        .unwrap_or_default();
                        let approved = matches!(answer.as_str(), "y" | "yes" | "a" | "always");
                        let remember = matches!(answer.as_str(), "a" | "always");
                        event_engine.respond_to_connection_request(approved, remember);
                    }
                    EngineEvent::RememberDevice(device) => {
                        tracing::info!("Pairing {} ({})", device.name, device.ip);
                        if let Err(e) = event_store.remember(device) {
                            tracing::warn!("Could not save paired device: {}", e);
                        }
                    }
                    EngineEvent::ClientConnected { address } => {
                        tracing::info!("Playing audio from {}", address);
                    }
                    EngineEvent::ClientDisconnected
                        if event_engine.current_state() == StreamState::Error =>
                    {
                        let reason = event_engine.connection_state().error.unwrap_or_default();
                        tracing::warn!("Session failed ({}), ready for the next sender", reason);
                        if let Err(e) = event_engine.reset() {
                            tracing::warn!("Could not reset receiver: {}", e);
                        }
                    }
                    other => tracing::debug!(?other, "Engine event"),
                }
            }
        })
        .context("failed to spawn event thread")?;

    // Peak level readout while streaming
    let mut levels = engine.levels();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(2));
        loop {
            ticker.tick().await;
            let peak = levels
                .borrow_and_update()
                .iter()
                .cloned()
                .fold(0.0f32, f32::max);
            if peak > 0.0 {
                tracing::debug!("Level peak {:.2}", peak);
            }
        }
    });

    tracing::info!("Press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    engine.stop();

    Ok(())
}
