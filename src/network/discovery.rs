//! Peer discovery over UDP broadcast
//!
//! The responder owns the receiver's control socket on the discovery port:
//! it answers `DISCOVER` itself and hands every other control message to a
//! callback. The requester broadcasts one probe and collects replies until a
//! hard deadline.

use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::constants::{BROADCAST_ADDRESS, MAX_DATAGRAM_SIZE, POLL_INTERVAL};
use crate::error::NetworkError;
use crate::network::udp::{self, Received, SocketOptions};
use crate::protocol::{ControlMessage, Receiver};

/// Upper bound on a single receive while collecting responses
const RECV_SLICE: Duration = Duration::from_millis(500);

/// Callback for control messages other than `DISCOVER`
pub type ControlHandler = Box<dyn Fn(ControlMessage, SocketAddr) + Send + 'static>;

/// Answers discovery probes until stopped
pub struct Responder {
    running: Arc<AtomicBool>,
    local_addr: SocketAddr,
    thread_handle: Option<JoinHandle<()>>,
}

impl Responder {
    /// Bind the discovery port and start answering on a worker thread
    pub fn start(
        port: u16,
        service_port: u16,
        device_name: String,
        handler: ControlHandler,
    ) -> Result<Self, NetworkError> {
        let options = SocketOptions {
            reuse_address: true,
            broadcast: true,
            read_timeout: Some(POLL_INTERVAL),
        };
        let socket = udp::bind_any(port, options)
            .map_err(|e| NetworkError::BindFailed(format!("discovery port {port}: {e}")))?;
        let local_addr = socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let reply = ControlMessage::Response {
            service_port,
            device_name,
        };

        let handle = thread::Builder::new()
            .name("discovery-responder".into())
            .spawn(move || respond_loop(socket, reply, handler, running_for_loop))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        tracing::info!(%local_addr, service_port, "Discovery responder started");
        Ok(Self {
            running,
            local_addr,
            thread_handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!(local_addr = %self.local_addr, "Discovery responder stopped");
        }
    }
}

impl Drop for Responder {
    fn drop(&mut self) {
        self.stop();
    }
}

fn respond_loop(
    socket: UdpSocket,
    reply: ControlMessage,
    handler: ControlHandler,
    running: Arc<AtomicBool>,
) {
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    while running.load(Ordering::Relaxed) {
        match udp::recv_message(&socket, &mut buf) {
            Ok(Received::Message(ControlMessage::Discover, from)) => {
                match udp::send_message(&socket, &reply, from) {
                    Ok(()) => tracing::debug!(%from, "Answered discovery probe"),
                    Err(e) => tracing::warn!(%from, error = %e, "Failed to answer discovery probe"),
                }
            }
            Ok(Received::Message(message, from)) => handler(message, from),
            Ok(Received::Ignored) | Ok(Received::Idle) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Discovery socket error");
                thread::sleep(POLL_INTERVAL);
            }
        }
    }
}

/// Broadcast target for probes on `port`
pub fn broadcast_target(port: u16) -> SocketAddr {
    let ip = BROADCAST_ADDRESS
        .parse::<IpAddr>()
        .unwrap_or(IpAddr::from([255, 255, 255, 255]));
    SocketAddr::new(ip, port)
}

/// This host's primary address, as reported by the OS
pub fn local_addresses() -> HashSet<IpAddr> {
    let mut addresses = HashSet::new();
    match local_ip_address::local_ip() {
        Ok(ip) => {
            addresses.insert(ip);
        }
        Err(e) => tracing::debug!(error = %e, "Could not determine local address"),
    }
    addresses
}

/// Probe `target` and collect responders until `timeout` has elapsed
///
/// Results are keyed by address; responses from any address in `exclude`
/// are dropped. Socket errors are logged and end the round early with what
/// was collected so far.
pub fn discover(target: SocketAddr, timeout: Duration, exclude: &HashSet<IpAddr>) -> Vec<Receiver> {
    let deadline = Instant::now() + timeout;
    let options = SocketOptions {
        broadcast: true,
        ..Default::default()
    };
    let socket = match udp::bind_any(0, options) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!(error = %e, "Discovery bind failed");
            return Vec::new();
        }
    };
    if let Err(e) = udp::send_message(&socket, &ControlMessage::Discover, target) {
        tracing::warn!(error = %e, "Discovery probe failed");
        return Vec::new();
    }

    let mut found: BTreeMap<IpAddr, Receiver> = BTreeMap::new();
    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        // A zero read timeout means "block forever"; remaining is non-zero here
        if let Err(e) = socket.set_read_timeout(Some(remaining.min(RECV_SLICE))) {
            tracing::warn!(error = %e, "Discovery socket error");
            break;
        }
        match udp::recv_message(&socket, &mut buf) {
            Ok(Received::Message(
                ControlMessage::Response {
                    service_port,
                    device_name,
                },
                from,
            )) => {
                let ip = from.ip();
                if exclude.contains(&ip) {
                    tracing::trace!(%ip, "Ignoring response from self");
                    continue;
                }
                found
                    .entry(ip)
                    .or_insert_with(|| Receiver::new(ip, service_port, device_name));
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "Discovery receive failed");
                break;
            }
        }
    }

    tracing::info!(count = found.len(), "Discovery round complete");
    found.into_values().collect()
}
