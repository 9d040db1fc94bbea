//! Audio Sender Application
//!
//! Captures system audio and streams it to a receiver on the LAN.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lan_audio_relay::{
    audio::{find_by_name, AudioBackend, CaptureScript, MemoryBackend},
    config::AppConfig,
    protocol::Receiver,
    SenderEngine, StreamState, TransportMode,
};

#[derive(Parser, Debug)]
#[command(name = "sender", about = "Stream local audio to a LAN receiver")]
struct Args {
    /// Config file (defaults to the platform config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Receiver to stream to, `IP` or `IP:PORT`; discovered when omitted
    #[arg(short, long)]
    target: Option<String>,

    /// Pick the discovered receiver whose name contains this
    #[arg(short, long)]
    receiver: Option<String>,

    /// Capture device name (defaults to a monitor of system output)
    #[arg(short, long)]
    device: Option<String>,

    /// Transport mode: tcp_only, tcp_udp_no_auth, tcp_udp_auth, tls_udp_auth
    #[arg(short, long)]
    mode: Option<TransportMode>,

    /// Name announced to the receiver
    #[arg(short, long)]
    name: Option<String>,

    /// Send a 440 Hz test tone instead of capturing
    #[arg(long)]
    tone: bool,

    /// List audio devices and exit
    #[arg(long)]
    list_devices: bool,

    /// Run one discovery round, print the receivers and exit
    #[arg(long)]
    discover: bool,
}

fn load_config(path: Option<&PathBuf>) -> Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load_or_default()?,
    };
    Ok(config)
}

#[cfg(feature = "audio")]
fn hardware_backend() -> Option<Arc<dyn AudioBackend>> {
    Some(Arc::new(lan_audio_relay::audio::CpalBackend))
}

#[cfg(not(feature = "audio"))]
fn hardware_backend() -> Option<Arc<dyn AudioBackend>> {
    None
}

fn make_backend(tone: bool) -> Result<Arc<dyn AudioBackend>> {
    if tone {
        return Ok(Arc::new(MemoryBackend::new(CaptureScript::Tone {
            frequency: 440.0,
            amplitude: 0.3,
        })));
    }
    match hardware_backend() {
        Some(backend) => Ok(backend),
        None => bail!("built without hardware audio; use --tone"),
    }
}

fn parse_target(target: &str, default_port: u16) -> Result<Receiver> {
    if let Ok(addr) = target.parse::<SocketAddr>() {
        return Ok(Receiver::new(addr.ip(), addr.port(), target));
    }
    let ip: IpAddr = target
        .parse()
        .with_context(|| format!("invalid target `{target}`"))?;
    Ok(Receiver::new(ip, default_port, target))
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
    let mut config = load_config(args.config.as_ref())?;
    if let Some(name) = &args.name {
        config.device_name = name.replace(';', "_");
    }
    let mode = args.mode.unwrap_or(config.network.transport_mode);
    config.validate()?;

    tracing::info!("Starting LAN Audio Sender '{}'", config.device_name);

    let backend = make_backend(args.tone)?;
    let devices = backend.list_devices();

    if args.list_devices {
        println!("\n=== Available Capture Devices ===");
        for device in devices.iter().filter(|d| d.is_input) {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            let monitor_marker = if device.is_monitor { " [MONITOR]" } else { "" };
            println!("  {}{}{}", device.name, default_marker, monitor_marker);
            println!("    ID: {}", device.id);
        }
        println!();
        return Ok(());
    }

    let capture_name = args.device.clone().or_else(|| config.audio.capture_device.clone());
    let device = match &capture_name {
        Some(name) => {
            let inputs: Vec<_> = devices.iter().filter(|d| d.is_input).cloned().collect();
            match find_by_name(&inputs, name) {
                Some(device) => Some(device.clone()),
                None => bail!("no capture device matches `{name}`"),
            }
        }
        None => None,
    };

    let audio_port = config.network.audio_port;
    let engine = SenderEngine::new(config, backend)?;

    if args.discover {
        let receivers = engine.discover_once();
        println!("\n=== Receivers ===");
        for receiver in &receivers {
            println!("  {} at {}:{}", receiver.name, receiver.address, receiver.port);
        }
        println!();
        return Ok(());
    }

    let receiver = match &args.target {
        Some(target) => parse_target(target, audio_port)?,
        None => {
            let receivers = engine.discover_once();
            let wanted = args.receiver.as_deref().map(str::to_lowercase);
            let chosen = receivers.into_iter().find(|r| match &wanted {
                Some(wanted) => r.name.to_lowercase().contains(wanted),
                None => true,
            });
            match chosen {
                Some(receiver) => receiver,
                None => bail!("no receiver found; pass --target"),
            }
        }
    };

    tracing::info!("Target receiver: {} ({}:{})", receiver.name, receiver.address, receiver.port);

    let mut state = engine.state();
    engine.start_streaming(receiver, device, mode)?;
    tracing::info!("Press Ctrl+C to stop");

    let mut was_streaming = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Stopping");
                engine.stop_streaming();
                break;
            }
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                match current {
                    StreamState::Streaming => was_streaming = true,
                    StreamState::Idle if was_streaming => {
                        tracing::info!("Receiver ended the session");
                        break;
                    }
                    StreamState::Error => {
                        let reason = engine
                            .connection_state()
                            .error
                            .unwrap_or_else(|| "unknown error".into());
                        engine.stop_streaming();
                        bail!("streaming failed: {reason}");
                    }
                    _ => {}
                }
            }
        }
    }

    Ok(())
}
