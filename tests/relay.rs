//! End-to-end relay tests over loopback with in-memory audio

use std::collections::HashSet;
use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lan_audio_relay::audio::{CaptureScript, MemoryBackend};
use lan_audio_relay::config::AppConfig;
use lan_audio_relay::network::discovery;
use lan_audio_relay::network::handshake::{request_connect_and_wait, ControlChannel};
use lan_audio_relay::network::udp::{self, Received};
use lan_audio_relay::pairing::{PairingPolicy, StaticPolicy};
use lan_audio_relay::protocol::ControlMessage;
use lan_audio_relay::{
    ConnectOutcome, EngineEvent, Receiver, ReceiverEngine, SenderEngine, StreamState, TransportMode,
};

const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);
const WAIT: Duration = Duration::from_secs(10);

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    condition()
}

fn receiver_config(mode: TransportMode) -> AppConfig {
    let mut config = AppConfig::default();
    config.device_name = "Living Room".into();
    config.network.bind_address = "127.0.0.1".into();
    config.network.audio_port = 0;
    config.network.discovery_port = 0;
    config.network.transport_mode = mode;
    config
}

fn sender_config(receiver: &ReceiverEngine) -> AppConfig {
    let mut config = AppConfig::default();
    config.device_name = "DeviceA".into();
    config.network.discovery_port = receiver.control_addr().unwrap().port();
    config.network.connect_timeout_secs = 5;
    config
}

fn confirm_policy() -> Arc<dyn PairingPolicy> {
    Arc::new(StaticPolicy {
        paired: Vec::new(),
        require_confirmation: true,
    })
}

fn paired_policy() -> Arc<dyn PairingPolicy> {
    Arc::new(StaticPolicy {
        paired: vec![LOCALHOST],
        require_confirmation: true,
    })
}

fn start_receiver(
    mode: TransportMode,
    policy: Arc<dyn PairingPolicy>,
) -> (ReceiverEngine, MemoryBackend) {
    let backend = MemoryBackend::silence();
    let engine =
        ReceiverEngine::new(receiver_config(mode), Arc::new(backend.clone()), policy).unwrap();
    engine.start().unwrap();
    (engine, backend)
}

fn target_of(receiver: &ReceiverEngine) -> Receiver {
    Receiver::new(LOCALHOST, receiver.audio_addr().unwrap().port(), "Living Room")
}

/// Ten distinguishable 4 KiB chunks
fn numbered_chunks() -> Vec<Vec<u8>> {
    (0..10u8).map(|i| vec![i.wrapping_mul(17).wrapping_add(1); 4096]).collect()
}

fn approve_next_request(receiver: &ReceiverEngine) -> (IpAddr, String) {
    let events = receiver.events();
    let deadline = Instant::now() + WAIT;
    while Instant::now() < deadline {
        if let Ok(EngineEvent::ConnectionRequested {
            address,
            device_name,
        }) = events.recv_timeout(Duration::from_millis(100))
        {
            assert!(receiver.respond_to_connection_request(true, false));
            return (address, device_name);
        }
    }
    panic!("no connection request arrived");
}

#[test]
fn test_approved_session_relays_every_chunk_in_order() {
    let (receiver, playback) = start_receiver(TransportMode::TcpOnly, confirm_policy());
    let capture = MemoryBackend::new(CaptureScript::Chunks(numbered_chunks()));
    capture.set_realtime(false);
    let sender = SenderEngine::new(sender_config(&receiver), Arc::new(capture.clone())).unwrap();

    sender
        .start_streaming(target_of(&receiver), None, TransportMode::TcpOnly)
        .unwrap();
    let (address, device_name) = approve_next_request(&receiver);
    assert_eq!(address, LOCALHOST);
    assert_eq!(device_name, "DeviceA");

    assert!(wait_until(WAIT, || playback.bytes_played() == 10 * 4096));
    assert!(wait_until(WAIT, || receiver.current_state() == StreamState::Idle));
    assert!(wait_until(WAIT, || sender.current_state() == StreamState::Idle));

    let writes = playback.playback_writes();
    assert_eq!(writes.len(), 10);
    assert!(writes.iter().all(|w| w.len() == 4096));
    assert_eq!(writes, numbered_chunks());
    assert_eq!(capture.open_captures(), 0);
    assert_eq!(playback.open_playbacks(), 0);
    assert_eq!(*receiver.levels().borrow(), vec![0.0; 24]);

    let events: Vec<EngineEvent> = receiver.events().try_iter().collect();
    assert!(events.contains(&EngineEvent::ConnectionAccepted { address: LOCALHOST }));
    assert!(events.contains(&EngineEvent::ClientDisconnected));
}

#[test]
fn test_tls_session_relays_audio() {
    let (receiver, playback) = start_receiver(TransportMode::TlsUdpAuth, paired_policy());
    let capture = MemoryBackend::new(CaptureScript::Chunks(numbered_chunks()));
    capture.set_realtime(false);
    let sender = SenderEngine::new(sender_config(&receiver), Arc::new(capture)).unwrap();

    sender
        .start_streaming(target_of(&receiver), None, TransportMode::TlsUdpAuth)
        .unwrap();

    assert!(wait_until(WAIT, || playback.bytes_played() == 10 * 4096));
    assert!(wait_until(WAIT, || sender.current_state() == StreamState::Idle));
    assert_eq!(playback.playback_writes().concat(), numbered_chunks().concat());
}

#[test]
fn test_paired_sender_is_accepted_without_a_prompt() {
    let (receiver, _playback) = start_receiver(TransportMode::TcpOnly, paired_policy());
    let sender =
        SenderEngine::new(sender_config(&receiver), Arc::new(MemoryBackend::silence())).unwrap();

    sender
        .start_streaming(target_of(&receiver), None, TransportMode::TcpOnly)
        .unwrap();
    assert!(wait_until(WAIT, || sender.current_state() == StreamState::Streaming));
    assert!(wait_until(WAIT, || receiver.current_state() == StreamState::Streaming));

    let events: Vec<EngineEvent> = receiver.events().try_iter().collect();
    assert!(events.contains(&EngineEvent::ConnectionAccepted { address: LOCALHOST }));
    assert!(!events
        .iter()
        .any(|e| matches!(e, EngineEvent::ConnectionRequested { .. })));
    assert!(receiver.pending_request().is_none());
}

#[test]
fn test_rejected_request_fails_the_sender_and_releases_capture() {
    let (receiver, _playback) = start_receiver(TransportMode::TcpOnly, confirm_policy());
    let capture = MemoryBackend::silence();
    let sender = SenderEngine::new(sender_config(&receiver), Arc::new(capture.clone())).unwrap();

    sender
        .start_streaming(target_of(&receiver), None, TransportMode::TcpOnly)
        .unwrap();
    let events = receiver.events();
    assert!(wait_until(WAIT, || receiver.pending_request().is_some()));
    assert!(receiver.respond_to_connection_request(false, false));
    assert!(!receiver.respond_to_connection_request(true, false));

    assert!(wait_until(WAIT, || sender.current_state() == StreamState::Error));
    let error = sender.connection_state().error.unwrap();
    assert!(error.contains("rejected"), "{error}");
    assert_eq!(capture.open_captures(), 0);
    assert_eq!(receiver.current_state(), StreamState::Idle);
    assert!(events
        .try_iter()
        .any(|e| e == EngineEvent::ConnectionRejected { address: LOCALHOST }));

    sender.reset().unwrap();
    assert_eq!(sender.current_state(), StreamState::Idle);
}

#[test]
fn test_receiver_disconnect_returns_both_sides_to_idle() {
    let (receiver, _playback) = start_receiver(TransportMode::TcpOnly, paired_policy());
    let capture = MemoryBackend::silence();
    let sender = SenderEngine::new(sender_config(&receiver), Arc::new(capture.clone())).unwrap();

    sender
        .start_streaming(target_of(&receiver), None, TransportMode::TcpOnly)
        .unwrap();
    assert!(wait_until(WAIT, || receiver.current_state() == StreamState::Streaming));
    assert!(wait_until(WAIT, || sender.current_state() == StreamState::Streaming));
    assert!(sender.connection_state().is_connected);

    // A second start is refused while streaming
    assert!(sender
        .start_streaming(target_of(&receiver), None, TransportMode::TcpOnly)
        .is_err());

    assert!(receiver.disconnect_client());
    assert!(wait_until(WAIT, || sender.current_state() == StreamState::Idle));
    assert!(wait_until(WAIT, || receiver.current_state() == StreamState::Idle));
    assert!(sender.connection_state().error.is_none());
    assert!(!receiver.disconnect_client());
    assert!(wait_until(WAIT, || capture.open_captures() == 0));
}

#[test]
fn test_sender_stop_returns_both_sides_to_idle() {
    let (receiver, playback) = start_receiver(TransportMode::TcpOnly, paired_policy());
    let capture = MemoryBackend::new(CaptureScript::Tone {
        frequency: 440.0,
        amplitude: 0.5,
    });
    let sender = SenderEngine::new(sender_config(&receiver), Arc::new(capture.clone())).unwrap();

    sender
        .start_streaming(target_of(&receiver), None, TransportMode::TcpOnly)
        .unwrap();
    assert!(wait_until(WAIT, || receiver.current_state() == StreamState::Streaming));

    let levels = receiver.levels();
    assert!(wait_until(WAIT, || levels.borrow().iter().any(|&l| l > 0.0)));
    assert_eq!(levels.borrow().len(), 24);

    assert_eq!(receiver.set_volume(1.7), 1.0);
    assert_eq!(receiver.set_volume(0.3), 0.3);
    assert!(wait_until(WAIT, || playback.last_volume() == Some(0.3)));

    sender.stop_streaming();
    assert_eq!(sender.current_state(), StreamState::Idle);
    assert_eq!(capture.open_captures(), 0);
    assert!(wait_until(WAIT, || receiver.current_state() == StreamState::Idle));
    assert!(wait_until(WAIT, || levels.borrow().iter().all(|&l| l == 0.0)));
}

#[test]
fn test_dropped_data_channel_is_an_error() {
    // Fake receiver: accepts every CONNECT, then drops the data connection
    let control = UdpSocket::bind((LOCALHOST, 0)).unwrap();
    let data = TcpListener::bind((LOCALHOST, 0)).unwrap();
    let control_port = control.local_addr().unwrap().port();
    let data_port = data.local_addr().unwrap().port();
    thread::spawn(move || {
        let mut buf = [0u8; 1500];
        if let Ok((len, from)) = control.recv_from(&mut buf) {
            if let Ok(ControlMessage::Connect { .. }) = ControlMessage::parse(&buf[..len]) {
                let _ = control.send_to(&ControlMessage::Accept.to_bytes(), from);
            }
        }
    });
    thread::spawn(move || {
        if let Ok((stream, _)) = data.accept() {
            drop(stream);
        }
    });

    let capture = MemoryBackend::silence();
    let mut config = AppConfig::default();
    config.network.discovery_port = control_port;
    config.network.connect_timeout_secs = 5;
    let sender = SenderEngine::new(config, Arc::new(capture.clone())).unwrap();

    sender
        .start_streaming(
            Receiver::new(LOCALHOST, data_port, "Flaky"),
            None,
            TransportMode::TcpOnly,
        )
        .unwrap();

    assert!(wait_until(WAIT, || sender.current_state() == StreamState::Error));
    assert!(sender.connection_state().error.is_some());
    assert!(!sender.connection_state().is_connected);
    assert_eq!(capture.open_captures(), 0);
}

#[test]
fn test_unanswered_request_times_out_without_streaming() {
    let silent = UdpSocket::bind((LOCALHOST, 0)).unwrap();
    let capture = MemoryBackend::silence();
    let mut config = AppConfig::default();
    config.network.discovery_port = silent.local_addr().unwrap().port();
    config.network.connect_timeout_secs = 1;
    let sender = SenderEngine::new(config, Arc::new(capture.clone())).unwrap();

    let mut states = sender.state();
    let started = Instant::now();
    sender
        .start_streaming(Receiver::new(LOCALHOST, 9, "Nobody"), None, TransportMode::TcpOnly)
        .unwrap();

    let mut seen = vec![*states.borrow_and_update()];
    while seen.last() != Some(&StreamState::Error) && started.elapsed() < WAIT {
        if states.has_changed().unwrap_or(false) {
            seen.push(*states.borrow_and_update());
        } else {
            thread::sleep(Duration::from_millis(10));
        }
    }
    assert_eq!(seen.last(), Some(&StreamState::Error));
    assert!(!seen.contains(&StreamState::Streaming));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(capture.open_captures(), 0);
}

#[test]
fn test_request_connect_and_wait_is_bounded() {
    let silent = UdpSocket::bind((LOCALHOST, 0)).unwrap();
    let target = silent.local_addr().unwrap();

    let started = Instant::now();
    let outcome = request_connect_and_wait(target, Duration::from_millis(500), "DeviceA");
    assert_eq!(outcome, ConnectOutcome::Timeout);
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[test]
fn test_second_request_replaces_the_pending_one() {
    let (receiver, _playback) = start_receiver(TransportMode::TcpOnly, confirm_policy());
    let control = SocketAddr::new(LOCALHOST, receiver.control_addr().unwrap().port());
    let first = ControlChannel::bind(0).unwrap();
    let second = ControlChannel::bind(0).unwrap();

    first
        .send(&ControlMessage::Connect { device_name: "DeviceA".into() }, control)
        .unwrap();
    assert!(wait_until(WAIT, || receiver.pending_request().is_some()));
    second
        .send(&ControlMessage::Connect { device_name: "DeviceB".into() }, control)
        .unwrap();
    assert!(wait_until(WAIT, || {
        receiver
            .pending_request()
            .map_or(false, |p| p.device_name == "DeviceB")
    }));

    assert!(receiver.respond_to_connection_request(true, true));
    second.set_read_timeout(Some(Duration::from_millis(100))).unwrap();
    let mut buf = [0u8; 1500];
    let accepted = wait_until(WAIT, || {
        matches!(second.recv(&mut buf), Ok(Received::Message(ControlMessage::Accept, _)))
    });
    assert!(accepted);

    let remembered = receiver
        .events()
        .try_iter()
        .find_map(|e| match e {
            EngineEvent::RememberDevice(device) => Some(device),
            _ => None,
        })
        .unwrap();
    assert_eq!(remembered.name, "DeviceB");
    assert_eq!(remembered.ip, "127.0.0.1");
    assert_eq!(remembered.port, second.local_addr().unwrap().port());
}

#[test]
fn test_receiver_error_holds_until_reset() {
    let (receiver, playback) = start_receiver(TransportMode::TcpOnly, paired_policy());
    playback.fail_playback_open(true);
    let sender =
        SenderEngine::new(sender_config(&receiver), Arc::new(MemoryBackend::silence())).unwrap();

    sender
        .start_streaming(target_of(&receiver), None, TransportMode::TcpOnly)
        .unwrap();
    assert!(wait_until(WAIT, || receiver.current_state() == StreamState::Error));
    let error = receiver.connection_state().error.unwrap();
    assert!(error.contains("playback"), "{error}");
    assert!(wait_until(WAIT, || sender.current_state() == StreamState::Error));

    // A new request is refused while the receiver sits in Error
    playback.fail_playback_open(false);
    sender.reset().unwrap();
    sender
        .start_streaming(target_of(&receiver), None, TransportMode::TcpOnly)
        .unwrap();
    assert!(wait_until(WAIT, || sender.current_state() == StreamState::Error));
    let error = sender.connection_state().error.unwrap();
    assert!(error.contains("rejected"), "{error}");
    assert_eq!(receiver.current_state(), StreamState::Error);

    // So is a bare data connection
    let mut raw = TcpStream::connect(receiver.audio_addr().unwrap()).unwrap();
    raw.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    assert_eq!(raw.read(&mut [0u8; 16]).unwrap_or(0), 0);
    assert_eq!(receiver.current_state(), StreamState::Error);
    assert_eq!(playback.bytes_played(), 0);

    receiver.reset().unwrap();
    assert_eq!(receiver.current_state(), StreamState::Idle);
    sender.reset().unwrap();
    sender
        .start_streaming(target_of(&receiver), None, TransportMode::TcpOnly)
        .unwrap();
    assert!(wait_until(WAIT, || receiver.current_state() == StreamState::Streaming));
    assert!(wait_until(WAIT, || playback.bytes_played() > 0));
}

#[test]
fn test_capture_failure_never_reaches_the_network() {
    let control = UdpSocket::bind((LOCALHOST, 0)).unwrap();
    control.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
    let capture = MemoryBackend::silence();
    capture.fail_capture_open(true);
    let mut config = AppConfig::default();
    config.network.discovery_port = control.local_addr().unwrap().port();
    let sender = SenderEngine::new(config, Arc::new(capture.clone())).unwrap();

    sender
        .start_streaming(Receiver::new(LOCALHOST, 9, "Quiet"), None, TransportMode::TcpOnly)
        .unwrap();
    assert!(wait_until(WAIT, || sender.current_state() == StreamState::Error));
    assert!(sender.connection_state().error.is_some());
    assert_eq!(capture.captures_opened(), 0);

    let mut buf = [0u8; 512];
    assert!(control.recv_from(&mut buf).is_err(), "no CONNECT may be sent");
}

#[test]
fn test_silent_sender_hits_the_idle_timeout() {
    let mut config = receiver_config(TransportMode::TcpOnly);
    config.network.idle_timeout_secs = Some(1);
    let playback = MemoryBackend::silence();
    let receiver =
        ReceiverEngine::new(config, Arc::new(playback.clone()), paired_policy()).unwrap();
    receiver.start().unwrap();

    let mut client = TcpStream::connect(receiver.audio_addr().unwrap()).unwrap();
    client.write_all(&[7u8; 4096]).unwrap();
    assert!(wait_until(WAIT, || playback.bytes_played() == 4096));
    assert_eq!(receiver.current_state(), StreamState::Streaming);

    assert!(wait_until(WAIT, || receiver.current_state() == StreamState::Error));
    let error = receiver.connection_state().error.unwrap();
    assert!(error.contains("IdleTimeout"), "{error}");
    assert_eq!(playback.open_playbacks(), 0);
    assert_eq!(*receiver.levels().borrow(), vec![0.0; 24]);
    drop(client);
}

#[test]
fn test_engines_refuse_invalid_config() {
    let mut config = AppConfig::default();
    config.audio.chunk_size = 0;
    assert!(SenderEngine::new(config.clone(), Arc::new(MemoryBackend::silence())).is_err());
    assert!(
        ReceiverEngine::new(config, Arc::new(MemoryBackend::silence()), confirm_policy()).is_err()
    );
}

#[test]
fn test_discovery_finds_receiver_and_filters_self() {
    let (receiver, _playback) = start_receiver(TransportMode::TcpOnly, confirm_policy());
    let target = SocketAddr::new(LOCALHOST, receiver.control_addr().unwrap().port());
    let audio_port = receiver.audio_addr().unwrap().port();

    let found = discovery::discover(target, Duration::from_millis(800), &HashSet::new());
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].name, "Living Room");
    assert_eq!(found[0].address, "127.0.0.1");
    assert_eq!(found[0].port, audio_port);

    let own: HashSet<IpAddr> = [LOCALHOST].into_iter().collect();
    assert!(discovery::discover(target, Duration::from_millis(500), &own).is_empty());

    let sender =
        SenderEngine::new(sender_config(&receiver), Arc::new(MemoryBackend::silence())).unwrap();
    sender.set_discovery_target(target);
    let published = sender.receivers();
    let round = sender.discover_once();
    assert_eq!(*published.borrow(), round);
}

#[test]
fn test_disconnect_from_unknown_host_is_ignored() {
    let (receiver, _playback) = start_receiver(TransportMode::TcpOnly, confirm_policy());
    let control = SocketAddr::new(LOCALHOST, receiver.control_addr().unwrap().port());

    udp::send_control(&ControlMessage::Disconnect, control).unwrap();
    thread::sleep(Duration::from_millis(200));
    assert_eq!(receiver.current_state(), StreamState::Idle);
    assert!(receiver
        .events()
        .try_iter()
        .all(|e| !matches!(e, EngineEvent::PeerDisconnected { .. })));
}
