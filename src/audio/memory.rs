//! In-process audio backend
//!
//! Capture plays back a scripted list of chunks (or an endless tone), and
//! playback records every write. Open/close counts are tracked so callers
//! can check that devices are released. Used for headless relays and tests.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::audio::capture::{CaptureSource, ToPcm16};
use crate::audio::device::{AudioBackend, SharedVolume};
use crate::audio::playback::PlaybackSink;
use crate::constants::{BYTES_PER_FRAME, SAMPLE_RATE};
use crate::error::AudioError;
use crate::protocol::AudioDeviceInfo;

/// What the capture side produces
#[derive(Debug, Clone)]
pub enum CaptureScript {
    /// These chunks in order, then end of source
    Chunks(Vec<Vec<u8>>),
    /// Endless sine tone at the given frequency
    Tone { frequency: f32, amplitude: f32 },
    /// Endless silence
    Silence,
}

#[derive(Default)]
struct Counters {
    captures_opened: AtomicUsize,
    captures_closed: AtomicUsize,
    playbacks_opened: AtomicUsize,
    playbacks_closed: AtomicUsize,
}

struct Shared {
    script: Mutex<CaptureScript>,
    writes: Mutex<Vec<Vec<u8>>>,
    /// Keep playback writes; off for long-running headless use
    recording: AtomicBool,
    bytes_played: AtomicUsize,
    counters: Counters,
    fail_capture: AtomicBool,
    fail_playback: AtomicBool,
    /// Sleep one chunk duration per endless read
    realtime: AtomicBool,
    /// Stall before each scripted read
    chunk_delay: Mutex<Duration>,
    last_volume: Mutex<Option<f32>>,
}

/// Backend with no hardware behind it
#[derive(Clone)]
pub struct MemoryBackend {
    shared: Arc<Shared>,
}

impl MemoryBackend {
    pub fn new(script: CaptureScript) -> Self {
        Self {
            shared: Arc::new(Shared {
                script: Mutex::new(script),
                writes: Mutex::new(Vec::new()),
                recording: AtomicBool::new(true),
                bytes_played: AtomicUsize::new(0),
                counters: Counters::default(),
                fail_capture: AtomicBool::new(false),
                fail_playback: AtomicBool::new(false),
                realtime: AtomicBool::new(true),
                chunk_delay: Mutex::new(Duration::ZERO),
                last_volume: Mutex::new(None),
            }),
        }
    }

    pub fn silence() -> Self {
        Self::new(CaptureScript::Silence)
    }

    /// Silent capture and a playback side that only counts bytes
    pub fn discarding() -> Self {
        let backend = Self::silence();
        backend.set_recording(false);
        backend
    }

    pub fn set_recording(&self, recording: bool) {
        self.shared.recording.store(recording, Ordering::SeqCst);
    }

    pub fn bytes_played(&self) -> usize {
        self.shared.bytes_played.load(Ordering::SeqCst)
    }

    pub fn set_script(&self, script: CaptureScript) {
        *self.shared.script.lock() = script;
    }

    /// Make the next opens fail like an unavailable device
    pub fn fail_capture_open(&self, fail: bool) {
        self.shared.fail_capture.store(fail, Ordering::SeqCst);
    }

    pub fn fail_playback_open(&self, fail: bool) {
        self.shared.fail_playback.store(fail, Ordering::SeqCst);
    }

    pub fn set_realtime(&self, realtime: bool) {
        self.shared.realtime.store(realtime, Ordering::SeqCst);
    }

    /// Delay every scripted read, to hold a session open in tests
    pub fn set_chunk_delay(&self, delay: Duration) {
        *self.shared.chunk_delay.lock() = delay;
    }

    /// Every chunk written to playback, in order
    pub fn playback_writes(&self) -> Vec<Vec<u8>> {
        self.shared.writes.lock().clone()
    }

    pub fn last_volume(&self) -> Option<f32> {
        *self.shared.last_volume.lock()
    }

    pub fn captures_opened(&self) -> usize {
        self.shared.counters.captures_opened.load(Ordering::SeqCst)
    }

    pub fn captures_closed(&self) -> usize {
        self.shared.counters.captures_closed.load(Ordering::SeqCst)
    }

    pub fn playbacks_opened(&self) -> usize {
        self.shared.counters.playbacks_opened.load(Ordering::SeqCst)
    }

    pub fn playbacks_closed(&self) -> usize {
        self.shared.counters.playbacks_closed.load(Ordering::SeqCst)
    }

    /// Capture handles opened but not yet released
    pub fn open_captures(&self) -> usize {
        self.captures_opened() - self.captures_closed()
    }

    pub fn open_playbacks(&self) -> usize {
        self.playbacks_opened() - self.playbacks_closed()
    }
}

impl AudioBackend for MemoryBackend {
    fn name(&self) -> &str {
        "memory"
    }

    fn list_devices(&self) -> Vec<AudioDeviceInfo> {
        vec![
            AudioDeviceInfo {
                id: "memory:capture".into(),
                name: "Memory capture".into(),
                is_input: true,
                is_output: false,
                is_default: true,
                is_monitor: true,
            },
            AudioDeviceInfo {
                id: "memory:playback".into(),
                name: "Memory playback".into(),
                is_input: false,
                is_output: true,
                is_default: true,
                is_monitor: false,
            },
        ]
    }

    fn open_capture(
        &self,
        device: Option<&AudioDeviceInfo>,
    ) -> Result<Box<dyn CaptureSource>, AudioError> {
        if let Some(device) = device {
            if device.id != "memory:capture" {
                return Err(AudioError::DeviceNotFound(device.id.clone()));
            }
        }
        if self.shared.fail_capture.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceNotFound("capture unavailable".into()));
        }
        self.shared.counters.captures_opened.fetch_add(1, Ordering::SeqCst);
        let script = self.shared.script.lock().clone();
        let queue = match &script {
            CaptureScript::Chunks(chunks) => chunks.iter().cloned().collect(),
            _ => VecDeque::new(),
        };
        Ok(Box::new(MemoryCapture {
            shared: self.shared.clone(),
            script,
            queue,
            phase: 0.0,
            closed: false,
        }))
    }

    fn open_playback(&self, volume: SharedVolume) -> Result<Box<dyn PlaybackSink>, AudioError> {
        if self.shared.fail_playback.load(Ordering::SeqCst) {
            return Err(AudioError::DeviceNotFound("playback unavailable".into()));
        }
        self.shared.counters.playbacks_opened.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryPlayback {
            shared: self.shared.clone(),
            volume,
            closed: false,
        }))
    }
}

struct MemoryCapture {
    shared: Arc<Shared>,
    script: CaptureScript,
    queue: VecDeque<Vec<u8>>,
    phase: f32,
    closed: bool,
}

impl CaptureSource for MemoryCapture {
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
        if self.closed {
            return Err(AudioError::Closed);
        }
        match &self.script {
            CaptureScript::Chunks(_) => {
                let delay = *self.shared.chunk_delay.lock();
                if !delay.is_zero() {
                    std::thread::sleep(delay);
                }
                let Some(chunk) = self.queue.pop_front() else {
                    return Ok(0);
                };
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                buf[n..].fill(0);
                Ok(buf.len())
            }
            CaptureScript::Tone {
                frequency,
                amplitude,
            } => {
                let step = 2.0 * std::f32::consts::PI * frequency / SAMPLE_RATE as f32;
                for frame in buf.chunks_exact_mut(BYTES_PER_FRAME) {
                    let sample = (self.phase.sin() * amplitude).to_pcm16().to_le_bytes();
                    frame[..2].copy_from_slice(&sample);
                    frame[2..].copy_from_slice(&sample);
                    self.phase = (self.phase + step) % (2.0 * std::f32::consts::PI);
                }
                self.pace(buf.len());
                Ok(buf.len())
            }
            CaptureScript::Silence => {
                buf.fill(0);
                self.pace(buf.len());
                Ok(buf.len())
            }
        }
    }

    fn close(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.counters.captures_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl MemoryCapture {
    fn pace(&self, bytes: usize) {
        if self.shared.realtime.load(Ordering::Relaxed) {
            let frames = bytes / BYTES_PER_FRAME;
            std::thread::sleep(Duration::from_secs_f64(frames as f64 / SAMPLE_RATE as f64));
        }
    }
}

impl Drop for MemoryCapture {
    fn drop(&mut self) {
        self.close();
    }
}

struct MemoryPlayback {
    shared: Arc<Shared>,
    volume: SharedVolume,
    closed: bool,
}

impl PlaybackSink for MemoryPlayback {
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        if self.closed {
            return Err(AudioError::Closed);
        }
        *self.shared.last_volume.lock() = Some(self.volume.get());
        self.shared.bytes_played.fetch_add(pcm.len(), Ordering::SeqCst);
        // Recorded as received, before gain
        if self.shared.recording.load(Ordering::Relaxed) {
            self.shared.writes.lock().push(pcm.to_vec());
        }
        Ok(())
    }

    fn flush(&mut self) {}
}

impl Drop for MemoryPlayback {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.shared.counters.playbacks_closed.fetch_add(1, Ordering::SeqCst);
        }
    }
}
