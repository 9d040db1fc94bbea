//! Engine facades
//!
//! `SenderEngine` and `ReceiverEngine` compose discovery, handshake,
//! transport and audio into the operations a host application calls, and
//! expose the observables it renders: stream state, discovered receivers,
//! level bands, the log list and discrete events.

mod receiver;
mod sender;

pub use receiver::{ReceiverEngine, EVENT_QUEUE_CAPACITY};
pub use sender::SenderEngine;

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

use crate::logs::LogBuffer;
use crate::pairing::PairedDevice;

/// Discrete notifications for the host application
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineEvent {
    /// An unpaired device asks to stream and a decision is needed
    ConnectionRequested { address: IpAddr, device_name: String },
    ConnectionAccepted { address: IpAddr },
    ConnectionRejected { address: IpAddr },
    /// The data channel of a session opened
    ClientConnected { address: SocketAddr },
    ClientDisconnected,
    /// The user approved with "remember"; the host should persist this
    RememberDevice(PairedDevice),
    /// The peer sent DISCONNECT
    PeerDisconnected { address: IpAddr },
}

/// Push to the engine log list and to tracing
fn note(logs: &LogBuffer, message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::info!("{message}");
    logs.push(message);
}

/// Push a failure to the engine log list and to tracing
fn note_warn(logs: &LogBuffer, message: impl AsRef<str>) {
    let message = message.as_ref();
    tracing::warn!("{message}");
    logs.push(message);
}
