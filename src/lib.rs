//! # LAN Audio Relay
//!
//! Point-to-point, low-latency PCM audio relay between two devices on the
//! same LAN.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌──────────────────────────────┐                 ┌──────────────────────────────┐
//! │           SENDER             │                 │          RECEIVER            │
//! │                              │   UDP :5002     │                              │
//! │  discovery::discover ────────┼── DISCOVER ────▶│  discovery::Responder        │
//! │                       ◀──────┼── RESPONSE ─────┤     │                        │
//! │                              │                 │     ▼                        │
//! │  handshake::request_connect ─┼── CONNECT ─────▶│  handshake::Coordinator      │
//! │    _and_wait          ◀──────┼── ACCEPT/REJECT ┤   (paired? confirm? UI)      │
//! │                              │                 │                              │
//! │  ┌──────────┐  ┌──────────┐  │   TCP/TLS :5000 │  ┌──────────┐  ┌──────────┐  │
//! │  │ Capture  │─▶│ sender:: │──┼── s16le PCM ───▶│  │receiver::│─▶│ Playback │  │
//! │  │ (cpal)   │  │ send loop│  │                 │  │recv loop │  │ (cpal)   │  │
//! │  └──────────┘  └──────────┘  │                 │  └────┬─────┘  └──────────┘  │
//! │                              │                 │       ▼                      │
//! │   StreamStateMachine (watch) │◀── DISCONNECT ─▶│  LevelMeter → 24 bands       │
//! └──────────────────────────────┘                 └──────────────────────────────┘
//! ```
//!
//! Every long-running loop owns its socket and runs on its own thread.
//! Observers read state through `tokio::sync::watch` receivers and consume
//! discrete notifications from a `crossbeam-channel` event queue.

pub mod audio;
pub mod config;
pub mod engine;
pub mod error;
pub mod levels;
pub mod logs;
pub mod network;
pub mod pairing;
pub mod protocol;
pub mod state;

pub use engine::{EngineEvent, ReceiverEngine, SenderEngine};
pub use error::{Error, Result};
pub use protocol::{ConnectOutcome, Receiver, TransportMode};
pub use state::{ConnectionState, StreamState};

/// Application-wide constants
pub mod constants {
    use std::time::Duration;

    /// PCM sample rate shared by sender and receiver (wire contract)
    pub const SAMPLE_RATE: u32 = 44_100;

    /// Interleaved channel count (wire contract)
    pub const CHANNELS: u16 = 2;

    /// Bytes per interleaved stereo s16le frame
    pub const BYTES_PER_FRAME: usize = 2 * CHANNELS as usize;

    /// Read/write chunk size on the data channel
    pub const CHUNK_SIZE: usize = 4096;

    /// TCP port carrying raw PCM
    pub const DEFAULT_AUDIO_PORT: u16 = 5000;

    /// UDP port for discovery and control messages
    pub const DEFAULT_DISCOVERY_PORT: u16 = 5002;

    /// Broadcast target for discovery probes
    pub const BROADCAST_ADDRESS: &str = "255.255.255.255";

    /// Number of level bands per metering tick
    pub const DEFAULT_LEVEL_BANDS: usize = 24;

    /// Emit one level vector every N chunks
    pub const DEFAULT_METER_CADENCE: u32 = 5;

    /// Largest control datagram we accept
    pub const MAX_DATAGRAM_SIZE: usize = 1500;

    /// Poll interval for blocking loops that check a running flag
    pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Default discovery round duration
    pub const DEFAULT_DISCOVERY_TIMEOUT: Duration = Duration::from_millis(3000);

    /// Default wait for ACCEPT/REJECT
    pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;

    /// Lines retained by the engine log buffer
    pub const LOG_CAPACITY: usize = 500;
}
