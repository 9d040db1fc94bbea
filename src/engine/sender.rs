use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{IpAddr, Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio::sync::watch;

use super::{note, note_warn};
use crate::audio::device::AudioBackend;
use crate::config::AppConfig;
use crate::constants::{MAX_DATAGRAM_SIZE, POLL_INTERVAL};
use crate::error::{Error, NetworkError, Result};
use crate::logs::LogBuffer;
use crate::network::handshake::ControlChannel;
use crate::network::sender::SendSession;
use crate::network::udp::{self, Received};
use crate::network::{discovery, transport};
use crate::protocol::{AudioDeviceInfo, ConnectOutcome, ControlMessage, Receiver, TransportMode};
use crate::state::{ConnectionState, StreamState, StreamStateMachine};

/// How long a failed session waits for a DISCONNECT that explains it
const DISCONNECT_GRACE: Duration = Duration::from_millis(250);

/// Sender side of the relay: discovery, handshake, capture and send
pub struct SenderEngine {
    inner: Arc<SenderInner>,
    discovery: Mutex<Option<Periodic>>,
    session: Mutex<Option<ActiveSession>>,
}

struct SenderInner {
    config: AppConfig,
    backend: Arc<dyn AudioBackend>,
    state: StreamStateMachine,
    logs: LogBuffer,
    receivers: watch::Sender<Vec<Receiver>>,
    discovery_target: Mutex<SocketAddr>,
    self_addresses: HashSet<IpAddr>,
}

struct Periodic {
    running: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// Handles shared between the engine and one session worker
struct SessionShared {
    running: AtomicBool,
    /// Set once the data channel is open
    data_socket: Mutex<Option<TcpStream>>,
    /// The receiver's control endpoint
    control_target: SocketAddr,
    peer_disconnected: AtomicBool,
}

struct ActiveSession {
    shared: Arc<SessionShared>,
    handle: JoinHandle<()>,
}

impl SenderEngine {
    /// Build an engine; fails if `config` does not validate
    pub fn new(config: AppConfig, backend: Arc<dyn AudioBackend>) -> Result<Self> {
        config.validate()?;
        let (receivers, _rx) = watch::channel(Vec::new());
        let discovery_target = discovery::broadcast_target(config.network.discovery_port);
        Ok(Self {
            inner: Arc::new(SenderInner {
                config,
                backend,
                state: StreamStateMachine::new("sender"),
                logs: LogBuffer::default(),
                receivers,
                discovery_target: Mutex::new(discovery_target),
                self_addresses: discovery::local_addresses(),
            }),
            discovery: Mutex::new(None),
            session: Mutex::new(None),
        })
    }

    /// Probe a specific address instead of the broadcast address
    pub fn set_discovery_target(&self, target: SocketAddr) {
        *self.inner.discovery_target.lock() = target;
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

    pub fn receivers(&self) -> watch::Receiver<Vec<Receiver>> {
        self.inner.receivers.subscribe()
    }

    pub fn logs(&self) -> watch::Receiver<Vec<String>> {
        self.inner.logs.subscribe()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.inner.logs.snapshot()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.connection_state()
    }

    pub fn list_devices(&self) -> Vec<AudioDeviceInfo> {
        self.inner.backend.list_devices()
    }

    /// Run one discovery round now and publish its result
    pub fn discover_once(&self) -> Vec<Receiver> {
        self.inner.discover_round()
    }

    /// Run discovery rounds in the background until `stop_discovery`
    pub fn start_discovery(&self) -> Result<()> {
        let mut slot = self.discovery.lock();
        if slot.is_some() {
            return Ok(());
        }
        let running = Arc::new(AtomicBool::new(true));
        let running_for_loop = running.clone();
        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("discovery".into())
            .spawn(move || {
                let interval = inner.config.network.discovery_interval();
                while running_for_loop.load(Ordering::Relaxed) {
                    inner.discover_round();
                    let resume = Instant::now() + interval;
                    while running_for_loop.load(Ordering::Relaxed) && Instant::now() < resume {
                        thread::sleep(POLL_INTERVAL);
                    }
                }
            })?;
        note(&self.inner.logs, "Discovery started");
        *slot = Some(Periodic { running, handle });
        Ok(())
    }

    pub fn stop_discovery(&self) {
        if let Some(periodic) = self.discovery.lock().take() {
            periodic.running.store(false, Ordering::SeqCst);
            let _ = periodic.handle.join();
            note(&self.inner.logs, "Discovery stopped");
        }
    }

    /// Ask `receiver` for permission and stream to it on a worker thread
    ///
    /// Refused while a session is starting, streaming or stopping. The call
    /// returns once the worker is running; progress shows up in `state()`.
    pub fn start_streaming(
        &self,
        receiver: Receiver,
        device: Option<AudioDeviceInfo>,
        mode: TransportMode,
    ) -> Result<()> {
        let mut slot = self.session.lock();
        let ip = receiver.ip().ok_or_else(|| {
            Error::Config(format!("receiver address `{}` is not an IP", receiver.address))
        })?;
        self.inner.state.begin_start()?;
        if let Some(old) = slot.take() {
            let _ = old.handle.join();
        }
        self.inner.state.set_peer(Some(receiver.clone()));
        note(
            &self.inner.logs,
            format!("Starting stream to {} ({}) over {}", receiver.name, receiver.address, mode),
        );

        let shared = Arc::new(SessionShared {
            running: AtomicBool::new(true),
            data_socket: Mutex::new(None),
            control_target: SocketAddr::new(ip, self.inner.config.network.discovery_port),
            peer_disconnected: AtomicBool::new(false),
        });
        let inner = self.inner.clone();
        let worker_shared = shared.clone();
        let spawned = thread::Builder::new()
            .name("sender-session".into())
            .spawn(move || inner.run_session(receiver, device, mode, worker_shared));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.inner.state.fail(format!("could not start session worker: {e}"));
                return Err(e.into());
            }
        };
        *slot = Some(ActiveSession { shared, handle });
        Ok(())
    }

    /// Stop the current session, telling the receiver with DISCONNECT
    ///
    /// Waits for the worker to release the capture device and the socket.
    pub fn stop_streaming(&self) {
        let Some(session) = self.session.lock().take() else {
            return;
        };
        let shared = &session.shared;
        shared.running.store(false, Ordering::SeqCst);
        if let Some(socket) = shared.data_socket.lock().as_ref() {
            if let Err(e) = udp::send_control(&ControlMessage::Disconnect, shared.control_target) {
                tracing::warn!(error = %e, "Failed to send DISCONNECT");
            }
            let _ = socket.shutdown(Shutdown::Both);
        }
        let _ = session.handle.join();
        note(&self.inner.logs, "Streaming stopped");
    }

    /// Leave `Error` for `Idle`
    pub fn reset(&self) -> Result<()> {
        self.inner.state.reset()
    }
}

impl Drop for SenderEngine {
    fn drop(&mut self) {
        self.stop_discovery();
        self.stop_streaming();
    }
}

impl SenderInner {
    fn discover_round(&self) -> Vec<Receiver> {
        let target = *self.discovery_target.lock();
        let found = discovery::discover(
            target,
            self.config.network.discovery_timeout(),
            &self.self_addresses,
        );
        if !found.is_empty() {
            let names: Vec<&str> = found.iter().map(|r| r.name.as_str()).collect();
            note(&self.logs, format!("Found {} receiver(s): {}", found.len(), names.join(", ")));
        }
        self.receivers.send_replace(found.clone());
        found
    }

    fn run_session(
        &self,
        receiver: Receiver,
        device: Option<AudioDeviceInfo>,
        mode: TransportMode,
        shared: Arc<SessionShared>,
    ) {
        match self.establish(&receiver, device.as_ref(), mode, &shared) {
            Ok(Some((session, channel))) => {
                let listener = spawn_control_listener(channel, shared.clone());
                let (end, stats) = session.run(&shared.running);

                // A DISCONNECT may race the socket error it causes
                if !end.is_clean() {
                    let grace = Instant::now() + DISCONNECT_GRACE;
                    while !shared.peer_disconnected.load(Ordering::SeqCst) && Instant::now() < grace {
                        thread::sleep(Duration::from_millis(10));
                    }
                }
                shared.running.store(false, Ordering::SeqCst);
                if let Some(listener) = listener {
                    let _ = listener.join();
                }
                shared.data_socket.lock().take();

                let peer_disconnected = shared.peer_disconnected.load(Ordering::SeqCst);
                if peer_disconnected {
                    note(&self.logs, format!("{} ended the session", receiver.name));
                }
                if end.is_clean() || peer_disconnected {
                    note(
                        &self.logs,
                        format!("Session ended: {} chunks, {} bytes sent", stats.chunks, stats.bytes),
                    );
                    self.state.finish_clean();
                } else {
                    let reason = format!("{end:?}");
                    note_warn(&self.logs, format!("Streaming failed: {reason}"));
                    self.state.fail(reason);
                }
            }
            Ok(None) => {
                note(&self.logs, "Start cancelled");
                self.state.finish_clean();
            }
            Err(e) => {
                note_warn(&self.logs, format!("Could not start streaming: {e}"));
                self.state.fail(e.to_string());
            }
        }
    }

    /// Capture, handshake, connect; `Ok(None)` if cancelled on the way
    ///
    /// On success the stream state is `Streaming` and the control channel
    /// that carried the handshake is returned for the DISCONNECT listener.
    fn establish(
        &self,
        receiver: &Receiver,
        device: Option<&AudioDeviceInfo>,
        mode: TransportMode,
        shared: &Arc<SessionShared>,
    ) -> Result<Option<(SendSession, ControlChannel)>> {
        let net = &self.config.network;
        let data_addr = receiver.socket_addr().ok_or_else(|| {
            Error::Config(format!("receiver address `{}` is not an IP", receiver.address))
        })?;

        // Device problems fail before any network traffic
        let capture = self.backend.open_capture(device)?;

        let channel = ControlChannel::bind(net.discovery_port)?;
        let outcome = channel.request_connect_until(
            shared.control_target,
            net.connect_timeout(),
            &self.config.device_name,
            &shared.running,
        );
        if !shared.running.load(Ordering::SeqCst) {
            return Ok(None);
        }
        match outcome {
            ConnectOutcome::Accepted => note(&self.logs, format!("{} accepted", receiver.name)),
            ConnectOutcome::Rejected => {
                return Err(NetworkError::Rejected(receiver.address.clone()).into())
            }
            ConnectOutcome::Timeout => {
                return Err(NetworkError::Timeout(receiver.address.clone()).into())
            }
        }

        let stream = transport::connect(data_addr, mode, net.connect_timeout())?;
        *shared.data_socket.lock() = Some(stream.shutdown_handle()?);
        if !shared.running.load(Ordering::SeqCst) {
            return Ok(None);
        }
        self.state.mark_streaming()?;
        note(&self.logs, format!("Streaming to {} at {}", receiver.name, data_addr));
        let session = SendSession::new(capture, stream, self.config.audio.chunk_size);
        Ok(Some((session, channel)))
    }
}

/// Watch the control channel for the receiver's DISCONNECT while streaming
fn spawn_control_listener(
    channel: ControlChannel,
    shared: Arc<SessionShared>,
) -> Option<JoinHandle<()>> {
    let spawned = thread::Builder::new()
        .name("sender-control".into())
        .spawn(move || {
            if let Err(e) = channel.set_read_timeout(Some(POLL_INTERVAL)) {
                tracing::warn!(error = %e, "Control listener unavailable");
                return;
            }
            let peer = shared.control_target.ip();
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            while shared.running.load(Ordering::Relaxed) {
                match channel.recv(&mut buf) {
                    Ok(Received::Message(ControlMessage::Disconnect, from)) if from.ip() == peer => {
                        tracing::info!(%from, "Receiver sent DISCONNECT");
                        shared.peer_disconnected.store(true, Ordering::SeqCst);
                        shared.running.store(false, Ordering::SeqCst);
                        if let Some(socket) = shared.data_socket.lock().as_ref() {
                            let _ = socket.shutdown(Shutdown::Both);
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Control listener error");
                        thread::sleep(POLL_INTERVAL);
                    }
                }
            }
        });
    match spawned {
        Ok(handle) => Some(handle),
        Err(e) => {
            tracing::warn!(error = %e, "Could not start control listener");
            None
        }
    }
}
