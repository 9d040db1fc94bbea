//! Error types for the audio relay engine

use thiserror::Error;

/// Main error type for the engine
#[derive(Error, Debug)]
pub enum Error {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid state transition: {from:?} -> {to:?}")]
    InvalidTransition {
        from: crate::state::StreamState,
        to: crate::state::StreamState,
    },

    #[error("Stream already active ({0:?})")]
    AlreadyActive(crate::state::StreamState),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Audio subsystem errors
#[derive(Error, Debug)]
pub enum AudioError {
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    #[error("Failed to open stream: {0}")]
    StreamError(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Device closed")]
    Closed,

    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),
}

/// Network errors
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Socket bind failed: {0}")]
    BindFailed(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Handshake rejected by {0}")]
    Rejected(String),

    #[error("No reply from {0}")]
    Timeout(String),
}

/// Control-plane wire format errors
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Empty datagram")]
    Empty,

    #[error("Datagram is not valid ASCII text")]
    NotText,

    #[error("Unknown message token: {0}")]
    UnknownToken(String),

    #[error("Missing field `{field}` in {token}")]
    MissingField {
        token: &'static str,
        field: &'static str,
    },

    #[error("Invalid port: {0}")]
    InvalidPort(String),
}

/// Result type alias for the engine
pub type Result<T> = std::result::Result<T, Error>;
