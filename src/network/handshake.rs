//! Connection handshake (CONNECT / ACCEPT / REJECT)
//!
//! Receiver side: `Coordinator` applies the pairing policy to each CONNECT
//! and tracks at most one request awaiting a user decision. Sender side:
//! `ControlChannel` sends CONNECT and waits for the verdict on the same
//! socket, under a hard deadline.
//!
//! Replies go to the source address of the CONNECT datagram. A requester that
//! holds the discovery port therefore gets them there, and one that fell back
//! to an ephemeral port still gets them.

use parking_lot::Mutex;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::constants::{MAX_DATAGRAM_SIZE, POLL_INTERVAL};
use crate::error::NetworkError;
use crate::network::udp::{self, Received, SocketOptions};
use crate::pairing::PairingPolicy;
use crate::protocol::{ConnectOutcome, ControlMessage};

/// Upper bound on a single receive while waiting for a verdict
const CANCEL_SLICE: Duration = POLL_INTERVAL;

/// A CONNECT waiting for approval
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingRequest {
    /// Where the CONNECT came from, and where the verdict goes
    pub address: SocketAddr,
    pub device_name: String,
    pub received_at: Instant,
}

/// What the coordinator did with a CONNECT
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectDecision {
    /// ACCEPT was sent without asking anyone
    Accepted { paired: bool },
    /// Held for approval; `replaced` is the request it overwrote, if any
    AwaitingApproval { replaced: Option<PendingRequest> },
}

/// Receiver-side handshake state
pub struct Coordinator {
    policy: Arc<dyn PairingPolicy>,
    pending: Mutex<Option<PendingRequest>>,
}

impl Coordinator {
    pub fn new(policy: Arc<dyn PairingPolicy>) -> Self {
        Self {
            policy,
            pending: Mutex::new(None),
        }
    }

    /// Apply the pairing policy to an inbound CONNECT
    pub fn handle_connect(&self, from: SocketAddr, device_name: &str) -> ConnectDecision {
        if self.policy.is_paired(from.ip()) {
            tracing::info!(%from, device = device_name, "Paired device, accepting");
            reply(&ControlMessage::Accept, from);
            return ConnectDecision::Accepted { paired: true };
        }

        if !self.policy.require_confirmation() {
            tracing::info!(%from, device = device_name, "Confirmation not required, accepting");
            reply(&ControlMessage::Accept, from);
            return ConnectDecision::Accepted { paired: false };
        }

        let request = PendingRequest {
            address: from,
            device_name: device_name.to_string(),
            received_at: Instant::now(),
        };
        let replaced = self.pending.lock().replace(request);
        if let Some(old) = &replaced {
            tracing::info!(old = %old.address, new = %from, "Pending request replaced");
        }
        tracing::info!(%from, device = device_name, "Connection request awaiting approval");
        ConnectDecision::AwaitingApproval { replaced }
    }

    /// Answer a CONNECT with REJECT without consulting the policy
    pub fn refuse(&self, from: SocketAddr, device_name: &str) {
        tracing::info!(%from, device = device_name, "Refusing connection request");
        reply(&ControlMessage::Reject, from);
    }

    pub fn pending(&self) -> Option<PendingRequest> {
        self.pending.lock().clone()
    }

    /// Send the verdict for the pending request and clear it
    ///
    /// Returns the request that was answered, or `None` if nothing was pending.
    pub fn respond(&self, approved: bool) -> Option<PendingRequest> {
        let request = self.pending.lock().take()?;
        let message = if approved {
            ControlMessage::Accept
        } else {
            ControlMessage::Reject
        };
        tracing::info!(to = %request.address, approved, "Answering connection request");
        reply(&message, request.address);
        Some(request)
    }

    /// Drop the pending request without answering
    pub fn clear(&self) {
        self.pending.lock().take();
    }
}

fn reply(message: &ControlMessage, to: SocketAddr) {
    if let Err(e) = udp::send_control(message, to) {
        tracing::warn!(%to, error = %e, "Failed to send handshake reply");
    }
}

/// Sender-side control socket
///
/// Used for the CONNECT exchange and afterwards to hear a DISCONNECT from
/// the receiver while streaming.
pub struct ControlChannel {
    socket: UdpSocket,
}

impl ControlChannel {
    /// Bind `preferred_port`, falling back to an ephemeral port
    pub fn bind(preferred_port: u16) -> Result<Self, NetworkError> {
        let socket = udp::bind_preferred(preferred_port, SocketOptions::default())
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn send(&self, message: &ControlMessage, target: SocketAddr) -> Result<(), NetworkError> {
        udp::send_message(&self.socket, message, target)
    }

    /// Receive one message, `Received::Idle` on read timeout
    pub fn recv(&self, buf: &mut [u8; MAX_DATAGRAM_SIZE]) -> io::Result<Received> {
        udp::recv_message(&self.socket, buf)
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        self.socket.set_read_timeout(timeout)
    }

    /// Send CONNECT to `target` and wait for ACCEPT or REJECT
    ///
    /// Returns within `timeout` (plus one poll interval). Datagrams from
    /// other hosts and unrelated messages are ignored; any socket error is
    /// reported as `Timeout`.
    pub fn request_connect(
        &self,
        target: SocketAddr,
        timeout: Duration,
        device_name: &str,
    ) -> ConnectOutcome {
        self.request_connect_until(target, timeout, device_name, &AtomicBool::new(true))
    }

    /// As `request_connect`, giving up early once `running` is cleared
    pub fn request_connect_until(
        &self,
        target: SocketAddr,
        timeout: Duration,
        device_name: &str,
        running: &AtomicBool,
    ) -> ConnectOutcome {
        let deadline = Instant::now() + timeout;
        let connect = ControlMessage::Connect {
            device_name: device_name.to_string(),
        };
        if let Err(e) = self.send(&connect, target) {
            tracing::warn!(%target, error = %e, "CONNECT failed");
            return ConnectOutcome::Timeout;
        }
        tracing::info!(%target, device = device_name, "CONNECT sent, waiting for reply");

        let mut buf = [0u8; MAX_DATAGRAM_SIZE];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                tracing::info!(%target, "No handshake reply before deadline");
                return ConnectOutcome::Timeout;
            }
            if !running.load(Ordering::Relaxed) {
                tracing::debug!(%target, "Handshake abandoned");
                return ConnectOutcome::Timeout;
            }
            if let Err(e) = self.set_read_timeout(Some(remaining.min(CANCEL_SLICE))) {
                tracing::warn!(error = %e, "Handshake socket error");
                return ConnectOutcome::Timeout;
            }
            match self.recv(&mut buf) {
                Ok(Received::Message(message, from)) if from.ip() == target.ip() => match message {
                    ControlMessage::Accept => {
                        tracing::info!(%target, "Connection accepted");
                        return ConnectOutcome::Accepted;
                    }
                    ControlMessage::Reject => {
                        tracing::info!(%target, "Connection rejected");
                        return ConnectOutcome::Rejected;
                    }
                    other => tracing::debug!(%from, message = %other, "Ignoring during handshake"),
                },
                Ok(Received::Message(_, from)) => {
                    tracing::debug!(%from, "Ignoring datagram from another host");
                }
                Ok(Received::Ignored) | Ok(Received::Idle) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "Handshake receive failed");
                    return ConnectOutcome::Timeout;
                }
            }
        }
    }
}

/// One-shot CONNECT exchange with `target`
///
/// Binds the target's port locally when free so replies to the discovery
/// port reach us, otherwise an ephemeral port.
pub fn request_connect_and_wait(
    target: SocketAddr,
    timeout: Duration,
    device_name: &str,
) -> ConnectOutcome {
    match ControlChannel::bind(target.port()) {
        Ok(channel) => channel.request_connect(target, timeout, device_name),
        Err(e) => {
            tracing::warn!(error = %e, "Handshake bind failed");
            ConnectOutcome::Timeout
        }
    }
}
