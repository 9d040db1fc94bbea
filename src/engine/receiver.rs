use crossbeam_channel::{bounded, Receiver as EventReceiver, Sender as EventSender, TrySendError};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use super::{note, note_warn, EngineEvent};
use crate::audio::device::{AudioBackend, SharedVolume};
use crate::audio::playback::PlaybackSink;
use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::logs::LogBuffer;
use crate::network::discovery::Responder;
use crate::network::handshake::{ConnectDecision, Coordinator, PendingRequest};
use crate::network::receiver::{AudioServer, ReceiveEnd, ServerOptions, SessionHandler};
use crate::network::sender::SessionStats;
use crate::network::transport::AudioListener;
use crate::network::udp;
use crate::pairing::{PairedDevice, PairingPolicy};
use crate::protocol::{ControlMessage, Receiver};
use crate::state::{ConnectionState, StreamState, StreamStateMachine};

/// How long a locally ended session keeps reading before the socket is cut
const DISCONNECT_DRAIN: Duration = Duration::from_millis(500);

/// Undrained events beyond this are dropped
pub const EVENT_QUEUE_CAPACITY: usize = 256;

/// Receiver side of the relay: responder, approval, playback and metering
pub struct ReceiverEngine {
    inner: Arc<ReceiverInner>,
    responder: Mutex<Option<Responder>>,
}

struct ReceiverInner {
    config: AppConfig,
    backend: Arc<dyn AudioBackend>,
    coordinator: Coordinator,
    state: StreamStateMachine,
    logs: LogBuffer,
    levels: watch::Sender<Vec<f32>>,
    events_tx: EventSender<EngineEvent>,
    events_rx: EventReceiver<EngineEvent>,
    volume: SharedVolume,
    /// Device name and control address of each host that sent CONNECT
    requesters: Mutex<HashMap<IpAddr, (String, SocketAddr)>>,
    server: Mutex<Option<AudioServer>>,
}

impl ReceiverEngine {
    /// Build an engine; fails if `config` does not validate
    pub fn new(
        config: AppConfig,
        backend: Arc<dyn AudioBackend>,
        policy: Arc<dyn PairingPolicy>,
    ) -> Result<Self> {
        config.validate()?;
        let (levels, _rx) = watch::channel(vec![0.0; config.meter.bands]);
        let (events_tx, events_rx) = bounded(EVENT_QUEUE_CAPACITY);
        let volume = SharedVolume::new(config.audio.volume);
        Ok(Self {
            inner: Arc::new(ReceiverInner {
                config,
                backend,
                coordinator: Coordinator::new(policy),
                state: StreamStateMachine::new("receiver"),
                logs: LogBuffer::default(),
                levels,
                events_tx,
                events_rx,
                volume,
                requesters: Mutex::new(HashMap::new()),
                server: Mutex::new(None),
            }),
            responder: Mutex::new(None),
        })
    }

    /// Start the audio listener and the discovery/control responder
    ///
    /// Fails only when a port cannot be bound. Calling it twice is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut responder = self.responder.lock();
        if responder.is_some() {
            return Ok(());
        }
        let net = &self.inner.config.network;
        let bind_ip: IpAddr = net
            .bind_address
            .parse()
            .map_err(|_| Error::Config(format!("invalid bind_address `{}`", net.bind_address)))?;

        let listener = AudioListener::bind(SocketAddr::new(bind_ip, net.audio_port), net.transport_mode)?;
        let audio_addr = listener.local_addr();
        let tls = listener.is_tls();
        let options = ServerOptions {
            chunk_size: self.inner.config.audio.chunk_size,
            bands: self.inner.config.meter.bands,
            cadence: self.inner.config.meter.cadence,
            idle_timeout: net.idle_timeout(),
        };
        let server = AudioServer::start(listener, options, self.inner.clone())?;
        *self.inner.server.lock() = Some(server);

        let inner = self.inner.clone();
        let started = Responder::start(
            net.discovery_port,
            audio_addr.port(),
            self.inner.config.device_name.clone(),
            Box::new(move |message, from| inner.on_control(message, from)),
        );
        match started {
            Ok(r) => *responder = Some(r),
            Err(e) => {
                if let Some(mut server) = self.inner.server.lock().take() {
                    server.stop();
                }
                return Err(e.into());
            }
        }

        note(
            &self.inner.logs,
            format!(
                "Receiver '{}' listening on {} ({})",
                self.inner.config.device_name,
                audio_addr,
                if tls { "TLS" } else { "TCP" }
            ),
        );
        Ok(())
    }

    /// Stop answering and listening; an active session ends cleanly
    pub fn stop(&self) {
        let responder = self.responder.lock().take();
        if let Some(mut responder) = responder {
            responder.stop();
        }
        let server = self.inner.server.lock().take();
        if let Some(mut server) = server {
            server.stop();
            note(&self.inner.logs, "Receiver stopped");
        }
        self.inner.coordinator.clear();
        self.inner.requesters.lock().clear();
    }

    pub fn is_running(&self) -> bool {
        self.responder.lock().is_some()
    }

    /// Bound data-channel address, once started
    pub fn audio_addr(&self) -> Option<SocketAddr> {
        self.inner.server.lock().as_ref().map(|s| s.local_addr())
    }

    /// Bound control (discovery) address, once started
    pub fn control_addr(&self) -> Option<SocketAddr> {
        self.responder.lock().as_ref().map(|r| r.local_addr())
    }

    pub fn config(&self) -> &AppConfig {
        &self.inner.config
    }

    pub fn state(&self) -> watch::Receiver<StreamState> {
        self.inner.state.subscribe()
    }

    pub fn current_state(&self) -> StreamState {
        self.inner.state.current()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.connection_state()
    }

    /// Latest level bands; all zero between sessions
    pub fn levels(&self) -> watch::Receiver<Vec<f32>> {
        self.inner.levels.subscribe()
    }

    pub fn logs(&self) -> watch::Receiver<Vec<String>> {
        self.inner.logs.subscribe()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.inner.logs.snapshot()
    }

    /// Engine notifications; every clone competes for the same events
    ///
    /// The queue holds `EVENT_QUEUE_CAPACITY` events. Hosts should drain it;
    /// events arriving while it is full are dropped.
    pub fn events(&self) -> EventReceiver<EngineEvent> {
        self.inner.events_rx.clone()
    }

    pub fn pending_request(&self) -> Option<PendingRequest> {
        self.inner.coordinator.pending()
    }

    /// Answer the pending connection request
    ///
    /// With `remember`, an approval is also reported as
    /// `EngineEvent::RememberDevice`. Returns false if nothing was pending.
    pub fn respond_to_connection_request(&self, approved: bool, remember: bool) -> bool {
        let Some(request) = self.inner.coordinator.respond(approved) else {
            tracing::debug!("No pending connection request");
            return false;
        };
        let address = request.address.ip();
        if approved {
            note(
                &self.inner.logs,
                format!("Accepted {} ({})", request.device_name, address),
            );
            self.inner.emit(EngineEvent::ConnectionAccepted { address });
            if remember {
                self.inner.emit(EngineEvent::RememberDevice(PairedDevice {
                    name: request.device_name.clone(),
                    ip: address.to_string(),
                    port: request.address.port(),
                }));
            }
        } else {
            note(
                &self.inner.logs,
                format!("Rejected {} ({})", request.device_name, address),
            );
            self.inner.requesters.lock().remove(&address);
            self.inner.emit(EngineEvent::ConnectionRejected { address });
        }
        true
    }

    /// Set playback volume, clamped to [0, 1]; applies mid-stream
    pub fn set_volume(&self, level: f32) -> f32 {
        let applied = self.inner.volume.set(level);
        tracing::debug!(volume = applied, "Volume set");
        applied
    }

    pub fn volume(&self) -> f32 {
        self.inner.volume.get()
    }

    /// Tell the connected sender to stop and end the session
    ///
    /// Returns false if no client is connected.
    pub fn disconnect_client(&self) -> bool {
        let server = self.inner.server.lock();
        let Some(peer) = server.as_ref().and_then(|s| s.active_peer()) else {
            return false;
        };
        let target = self.inner.control_address(peer.ip());
        if let Err(e) = udp::send_control(&ControlMessage::Disconnect, target) {
            tracing::warn!(%target, error = %e, "Failed to send DISCONNECT");
        }
        if let Some(server) = server.as_ref() {
            server.end_session(Some(DISCONNECT_DRAIN));
        }
        note(&self.inner.logs, format!("Disconnecting {}", peer.ip()));
        true
    }

    /// Leave `Error` for `Idle` so new sessions are served again
    ///
    /// While in `Error` the receiver refuses CONNECT requests and data
    /// connections.
    pub fn reset(&self) -> Result<()> {
        self.inner.state.reset()?;
        note(&self.inner.logs, "Receiver reset");
        Ok(())
    }
}

impl Drop for ReceiverEngine {
    fn drop(&mut self) {
        self.stop();
    }
}

impl ReceiverInner {
    fn emit(&self, event: EngineEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                tracing::warn!(?event, "Event queue full, dropping event");
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Where control messages for `ip` go: its CONNECT source, else the discovery port
    fn control_address(&self, ip: IpAddr) -> SocketAddr {
        self.requesters
            .lock()
            .get(&ip)
            .map(|(_, addr)| *addr)
            .unwrap_or_else(|| SocketAddr::new(ip, self.config.network.discovery_port))
    }

    fn on_control(&self, message: ControlMessage, from: SocketAddr) {
        match message {
            ControlMessage::Connect { device_name } => {
                if self.state.current() == StreamState::Error {
                    note_warn(
                        &self.logs,
                        format!("Refused {device_name} ({}): receiver needs a reset", from.ip()),
                    );
                    self.coordinator.refuse(from, &device_name);
                    self.emit(EngineEvent::ConnectionRejected { address: from.ip() });
                    return;
                }
                self.requesters
                    .lock()
                    .insert(from.ip(), (device_name.clone(), from));
                match self.coordinator.handle_connect(from, &device_name) {
                    ConnectDecision::Accepted { paired } => {
                        let how = if paired { "paired device" } else { "auto-accept" };
                        note(&self.logs, format!("Accepted {device_name} ({}) as {how}", from.ip()));
                        self.emit(EngineEvent::ConnectionAccepted { address: from.ip() });
                    }
                    ConnectDecision::AwaitingApproval { replaced } => {
                        if let Some(old) = replaced.filter(|old| old.address.ip() != from.ip()) {
                            self.requesters.lock().remove(&old.address.ip());
                        }
                        note(
                            &self.logs,
                            format!("Connection request from {device_name} ({})", from.ip()),
                        );
                        self.emit(EngineEvent::ConnectionRequested {
                            address: from.ip(),
                            device_name,
                        });
                    }
                }
            }
            ControlMessage::Disconnect => {
                let server = self.server.lock();
                let Some(server) = server.as_ref() else { return };
                match server.active_peer() {
                    Some(peer) if peer.ip() == from.ip() => {
                        note(&self.logs, format!("{} sent DISCONNECT", from.ip()));
                        server.end_session(None);
                        self.emit(EngineEvent::PeerDisconnected { address: from.ip() });
                    }
                    _ => tracing::debug!(%from, "DISCONNECT from a host with no session"),
                }
            }
            other => tracing::debug!(%from, message = %other, "Ignoring control message"),
        }
    }

    fn peer_name(&self, ip: IpAddr) -> String {
        self.requesters
            .lock()
            .get(&ip)
            .map(|(name, _)| name.clone())
            .unwrap_or_else(|| ip.to_string())
    }
}

impl SessionHandler for ReceiverInner {
    fn session_started(&self, peer: SocketAddr) -> std::result::Result<Box<dyn PlaybackSink>, String> {
        self.state.begin_start_from_idle().map_err(|e| e.to_string())?;
        self.emit(EngineEvent::ClientConnected { address: peer });
        self.state
            .set_peer(Some(Receiver::new(peer.ip(), peer.port(), self.peer_name(peer.ip()))));

        let sink = match self.backend.open_playback(self.volume.clone()) {
            Ok(sink) => sink,
            Err(e) => {
                let reason = format!("playback unavailable: {e}");
                note_warn(&self.logs, &reason);
                self.state.fail(reason.clone());
                self.requesters.lock().remove(&peer.ip());
                self.emit(EngineEvent::ClientDisconnected);
                return Err(reason);
            }
        };
        if let Err(e) = self.state.mark_streaming() {
            return Err(e.to_string());
        }
        note(&self.logs, format!("Client connected: {peer}"));
        Ok(sink)
    }

    fn levels(&self, levels: Vec<f32>) {
        self.levels.send_replace(levels);
    }

    fn session_ended(&self, peer: SocketAddr, end: &ReceiveEnd, stats: SessionStats) {
        self.levels.send_replace(vec![0.0; self.config.meter.bands]);
        if end.is_clean() {
            note(
                &self.logs,
                format!(
                    "Client disconnected: {peer} ({} chunks, {} bytes)",
                    stats.chunks, stats.bytes
                ),
            );
            self.state.finish_clean();
        } else {
            let reason = format!("{end:?}");
            note_warn(&self.logs, format!("Session with {peer} failed: {reason}"));
            self.state.fail(reason);
        }
        self.requesters.lock().remove(&peer.ip());
        self.emit(EngineEvent::ClientDisconnected);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::memory::MemoryBackend;
    use crate::pairing::StaticPolicy;
    use std::net::{Ipv4Addr, UdpSocket};

    fn engine() -> ReceiverEngine {
        let policy = Arc::new(StaticPolicy {
            paired: Vec::new(),
            require_confirmation: true,
        });
        ReceiverEngine::new(AppConfig::default(), Arc::new(MemoryBackend::silence()), policy)
            .unwrap()
    }

    fn connect(engine: &ReceiverEngine, from: SocketAddr, device_name: &str) {
        engine.inner.on_control(
            ControlMessage::Connect {
                device_name: device_name.into(),
            },
            from,
        );
    }

    #[test]
    fn test_requesters_are_evicted_when_replaced_or_rejected() {
        let engine = engine();
        let sink = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let first = sink.local_addr().unwrap();
        let second = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2)), first.port());

        connect(&engine, first, "Phone");
        assert!(engine.inner.requesters.lock().contains_key(&first.ip()));

        connect(&engine, second, "Tablet");
        {
            let requesters = engine.inner.requesters.lock();
            assert!(!requesters.contains_key(&first.ip()));
            assert!(requesters.contains_key(&second.ip()));
        }

        assert!(engine.respond_to_connection_request(false, false));
        assert!(engine.inner.requesters.lock().is_empty());
    }

    #[test]
    fn test_connect_is_refused_in_error_until_reset() {
        let engine = engine();
        let sender = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        sender.set_read_timeout(Some(Duration::from_secs(2))).unwrap();
        let from = sender.local_addr().unwrap();

        engine.inner.state.begin_start().unwrap();
        engine.inner.state.fail("playback unavailable");
        connect(&engine, from, "Phone");

        let mut buf = [0u8; 64];
        let (len, _) = sender.recv_from(&mut buf).unwrap();
        assert_eq!(ControlMessage::parse(&buf[..len]).unwrap(), ControlMessage::Reject);
        assert!(engine.pending_request().is_none());
        assert!(engine.inner.requesters.lock().is_empty());
        assert!(engine
            .events()
            .try_iter()
            .any(|e| e == EngineEvent::ConnectionRejected { address: from.ip() }));

        engine.reset().unwrap();
        assert_eq!(engine.current_state(), StreamState::Idle);
        connect(&engine, from, "Phone");
        assert!(engine.pending_request().is_some());
    }

    #[test]
    fn test_undrained_events_are_capped() {
        let engine = engine();
        for _ in 0..EVENT_QUEUE_CAPACITY + 10 {
            engine.inner.emit(EngineEvent::ClientDisconnected);
        }
        let events = engine.events();
        assert_eq!(events.len(), EVENT_QUEUE_CAPACITY);
        assert_eq!(events.try_iter().count(), EVENT_QUEUE_CAPACITY);

        engine.inner.emit(EngineEvent::ClientDisconnected);
        assert_eq!(events.len(), 1);
    }
}
