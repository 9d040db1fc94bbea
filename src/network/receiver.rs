//! Data-channel server: accept loop and socket-to-playback receive loop
//!
//! One client is served at a time, on the accept thread itself; further
//! clients wait in the listen backlog until the current session ends. The
//! server keeps listening across client disconnects until stopped.

use parking_lot::Mutex;
use std::io::{self, Read};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::playback::PlaybackSink;
use crate::constants::BYTES_PER_FRAME;
use crate::error::NetworkError;
use crate::levels::LevelMeter;
use crate::network::sender::SessionStats;
use crate::network::transport::{AudioListener, AudioStream};

/// Pause between accept polls
const ACCEPT_POLL: Duration = Duration::from_millis(20);

/// Why a receive session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiveEnd {
    /// The peer closed the connection
    Eof,
    /// Server stop or an explicit client disconnect
    Stopped,
    /// No data within the idle timeout; the peer is presumed gone
    IdleTimeout,
    ReadFailed(String),
    PlaybackFailed(String),
}

impl ReceiveEnd {
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Eof | Self::Stopped)
    }
}

/// Engine callbacks for the data channel
pub trait SessionHandler: Send + Sync + 'static {
    /// A client connected; return the sink to play into, or why not
    fn session_started(&self, peer: SocketAddr) -> Result<Box<dyn PlaybackSink>, String>;

    /// A level vector was computed
    fn levels(&self, levels: Vec<f32>);

    fn session_ended(&self, peer: SocketAddr, end: &ReceiveEnd, stats: SessionStats);
}

#[derive(Debug, Clone, Copy)]
pub struct ServerOptions {
    pub chunk_size: usize,
    pub bands: usize,
    pub cadence: u32,
    pub idle_timeout: Option<Duration>,
}

struct ActiveClient {
    peer: SocketAddr,
    socket: TcpStream,
}

/// Running data-channel server
pub struct AudioServer {
    running: Arc<AtomicBool>,
    kick: Arc<AtomicBool>,
    active: Arc<Mutex<Option<ActiveClient>>>,
    local_addr: SocketAddr,
    tls: bool,
    thread_handle: Option<JoinHandle<()>>,
}

impl AudioServer {
    pub fn start(
        listener: AudioListener,
        options: ServerOptions,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, NetworkError> {
        let running = Arc::new(AtomicBool::new(true));
        let kick = Arc::new(AtomicBool::new(false));
        let active = Arc::new(Mutex::new(None));
        let local_addr = listener.local_addr();
        let tls = listener.is_tls();

        let worker = Worker {
            listener,
            options,
            handler,
            running: running.clone(),
            kick: kick.clone(),
            active: active.clone(),
        };
        let handle = thread::Builder::new()
            .name("audio-server".into())
            .spawn(move || worker.run())
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        Ok(Self {
            running,
            kick,
            active,
            local_addr,
            tls,
            thread_handle: Some(handle),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_tls(&self) -> bool {
        self.tls
    }

    /// Address of the client being served, if any
    pub fn active_peer(&self) -> Option<SocketAddr> {
        self.active.lock().as_ref().map(|c| c.peer)
    }

    /// End the current session; the server keeps listening
    ///
    /// With `drain`, the socket stays open and the reader stops at its next
    /// chunk, giving the sender time to act on a DISCONNECT; a sender that
    /// has gone quiet is cut off after `drain`. Without it the socket is
    /// shut down at once.
    pub fn end_session(&self, drain: Option<Duration>) -> Option<SocketAddr> {
        let guard = self.active.lock();
        let client = guard.as_ref()?;
        self.kick.store(true, Ordering::SeqCst);
        match drain {
            Some(drain) => {
                if let Err(e) = client.socket.set_read_timeout(Some(drain)) {
                    tracing::debug!(error = %e, "Could not arm drain timeout");
                    let _ = client.socket.shutdown(Shutdown::Both);
                }
            }
            None => {
                let _ = client.socket.shutdown(Shutdown::Both);
            }
        }
        Some(client.peer)
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(client) = self.active.lock().as_ref() {
            let _ = client.socket.shutdown(Shutdown::Both);
        }
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!(local_addr = %self.local_addr, "Audio server stopped");
        }
    }
}

impl Drop for AudioServer {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    listener: AudioListener,
    options: ServerOptions,
    handler: Arc<dyn SessionHandler>,
    running: Arc<AtomicBool>,
    kick: Arc<AtomicBool>,
    active: Arc<Mutex<Option<ActiveClient>>>,
}

impl Worker {
    fn run(self) {
        while self.running.load(Ordering::Relaxed) {
            match self.listener.accept() {
                Ok(Some((stream, peer))) => self.serve(stream, peer),
                Ok(None) => thread::sleep(ACCEPT_POLL),
                Err(e) => {
                    tracing::warn!(error = %e, "Accept failed, still listening");
                    thread::sleep(ACCEPT_POLL);
                }
            }
        }
    }

    fn serve(&self, mut stream: AudioStream, peer: SocketAddr) {
        tracing::info!(%peer, tls = stream.is_tls(), "Client connected");
        let socket = match stream.shutdown_handle() {
            Ok(socket) => socket,
            Err(e) => {
                tracing::warn!(%peer, error = %e, "Dropping client");
                return;
            }
        };
        if let Err(e) = stream.set_read_timeout(self.options.idle_timeout) {
            tracing::warn!(%peer, error = %e, "Could not set idle timeout");
        }
        self.kick.store(false, Ordering::SeqCst);
        *self.active.lock() = Some(ActiveClient { peer, socket });

        let mut sink = match self.handler.session_started(peer) {
            Ok(sink) => sink,
            Err(reason) => {
                tracing::warn!(%peer, %reason, "Session refused");
                self.active.lock().take();
                stream.close();
                return;
            }
        };

        let started = Instant::now();
        let mut meter = LevelMeter::new(self.options.bands, self.options.cadence);
        let (end, stats) = receive(
            &mut stream,
            sink.as_mut(),
            &mut meter,
            self.options.chunk_size,
            &|| self.running.load(Ordering::Relaxed) && !self.kick.load(Ordering::Relaxed),
            &|levels: Vec<f32>| self.handler.levels(levels),
        );

        sink.flush();
        drop(sink);
        self.active.lock().take();
        stream.close();
        tracing::info!(
            %peer,
            ?end,
            chunks = stats.chunks,
            bytes = stats.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Client session ended"
        );
        self.handler.session_ended(peer, &end, stats);
    }
}

/// Read whole chunks from `reader` into `sink` until the stream ends
///
/// A partial chunk left at end-of-stream is written trimmed to whole stereo
/// frames; any remaining odd bytes are dropped.
pub fn receive<R: Read>(
    reader: &mut R,
    sink: &mut dyn PlaybackSink,
    meter: &mut LevelMeter,
    chunk_size: usize,
    keep_going: &dyn Fn() -> bool,
    on_levels: &dyn Fn(Vec<f32>),
) -> (ReceiveEnd, SessionStats) {
    let mut stats = SessionStats::default();
    let mut buf = vec![0u8; chunk_size.max(BYTES_PER_FRAME)];
    let mut filled = 0usize;

    let mut deliver = |chunk: &[u8], stats: &mut SessionStats| -> Result<(), ReceiveEnd> {
        sink.write(chunk)
            .map_err(|e| ReceiveEnd::PlaybackFailed(e.to_string()))?;
        stats.chunks += 1;
        stats.bytes += chunk.len() as u64;
        if let Some(levels) = meter.tick(chunk) {
            on_levels(levels);
        }
        Ok(())
    };

    let end = loop {
        if !keep_going() {
            break ReceiveEnd::Stopped;
        }
        match reader.read(&mut buf[filled..]) {
            Ok(0) => {
                if !keep_going() {
                    break ReceiveEnd::Stopped;
                }
                break finish_tail(&buf[..filled], &mut deliver, &mut stats);
            }
            Ok(n) => {
                filled += n;
                if filled == buf.len() {
                    filled = 0;
                    if let Err(end) = deliver(&buf, &mut stats) {
                        break end;
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(_) if !keep_going() => break ReceiveEnd::Stopped,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                break finish_tail(&buf[..filled], &mut deliver, &mut stats);
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                break ReceiveEnd::IdleTimeout;
            }
            Err(e) => break ReceiveEnd::ReadFailed(e.to_string()),
        }
    };
    (end, stats)
}

fn finish_tail(
    tail: &[u8],
    deliver: &mut impl FnMut(&[u8], &mut SessionStats) -> Result<(), ReceiveEnd>,
    stats: &mut SessionStats,
) -> ReceiveEnd {
    let aligned = tail.len() - tail.len() % BYTES_PER_FRAME;
    if aligned < tail.len() {
        tracing::warn!(dropped = tail.len() - aligned, "Dropping unaligned tail bytes");
    }
    if aligned > 0 {
        if let Err(end) = deliver(&tail[..aligned], stats) {
            return end;
        }
    }
    ReceiveEnd::Eof
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::{AudioBackend, SharedVolume};
    use crate::audio::memory::MemoryBackend;
    use std::io::Cursor;

    fn run(data: Vec<u8>, chunk: usize, cadence: u32) -> (ReceiveEnd, MemoryBackend, usize) {
        let backend = MemoryBackend::silence();
        let mut sink = backend.open_playback(SharedVolume::default()).unwrap();
        let mut meter = LevelMeter::new(24, cadence);
        let ticks = std::cell::Cell::new(0usize);
        let (end, _) = receive(
            &mut Cursor::new(data),
            sink.as_mut(),
            &mut meter,
            chunk,
            &|| true,
            &|levels: Vec<f32>| {
                assert_eq!(levels.len(), 24);
                ticks.set(ticks.get() + 1);
            },
        );
        (end, backend, ticks.get())
    }

    #[test]
    fn test_whole_chunks_in_order() {
        let data: Vec<u8> = (0..4).flat_map(|i| vec![i as u8; 64]).collect();
        let (end, backend, ticks) = run(data, 64, 2);
        assert_eq!(end, ReceiveEnd::Eof);
        let writes = backend.playback_writes();
        assert_eq!(writes.len(), 4);
        for (i, w) in writes.iter().enumerate() {
            assert_eq!(w, &vec![i as u8; 64]);
        }
        assert_eq!(ticks, 2);
    }

    #[test]
    fn test_tail_is_trimmed_to_frames() {
        let (end, backend, _) = run(vec![1u8; 64 + 10], 64, 5);
        assert_eq!(end, ReceiveEnd::Eof);
        let writes = backend.playback_writes();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].len(), 8);
    }

    #[test]
    fn test_stop_flag_ends_session() {
        let backend = MemoryBackend::silence();
        let mut sink = backend.open_playback(SharedVolume::default()).unwrap();
        let mut meter = LevelMeter::new(24, 5);
        let (end, stats) = receive(
            &mut Cursor::new(vec![0u8; 256]),
            sink.as_mut(),
            &mut meter,
            64,
            &|| false,
            &|_: Vec<f32>| {},
        );
        assert_eq!(end, ReceiveEnd::Stopped);
        assert_eq!(stats.chunks, 0);
    }
}
