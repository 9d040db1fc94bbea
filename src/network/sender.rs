//! Capture-to-socket send loop

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use crate::audio::capture::CaptureSource;
use crate::network::transport::AudioStream;

/// Why a send session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendEnd {
    /// The running flag was cleared (stop or peer DISCONNECT)
    Cancelled,
    /// A finite capture source ran out
    SourceEnded,
    /// The socket write failed
    WriteFailed(String),
    /// The capture device failed
    CaptureFailed(String),
}

impl SendEnd {
    /// Clean endings go back to `Idle`, the rest to `Error`
    pub fn is_clean(&self) -> bool {
        matches!(self, Self::Cancelled | Self::SourceEnded)
    }
}

/// Counters for one session
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub chunks: u64,
    pub bytes: u64,
}

/// Pump `chunk_size` chunks from `capture` into `sink` until told to stop
///
/// Every chunk is written whole and flushed before the next capture read.
/// A write failure after `running` was cleared counts as a cancellation,
/// since stopping shuts the socket down under a blocked write.
pub fn pump<W: Write>(
    capture: &mut dyn CaptureSource,
    sink: &mut W,
    chunk_size: usize,
    running: &AtomicBool,
) -> (SendEnd, SessionStats) {
    let mut stats = SessionStats::default();
    let mut buf = vec![0u8; chunk_size];

    let end = loop {
        if !running.load(Ordering::Relaxed) {
            break SendEnd::Cancelled;
        }
        let n = match capture.read_chunk(&mut buf) {
            Ok(0) => break SendEnd::SourceEnded,
            Ok(n) => n,
            Err(e) => {
                if !running.load(Ordering::Relaxed) {
                    break SendEnd::Cancelled;
                }
                break SendEnd::CaptureFailed(e.to_string());
            }
        };
        if let Err(e) = write_chunk(sink, &buf[..n]) {
            if !running.load(Ordering::Relaxed) {
                break SendEnd::Cancelled;
            }
            break SendEnd::WriteFailed(e.to_string());
        }
        stats.chunks += 1;
        stats.bytes += n as u64;
    };
    (end, stats)
}

fn write_chunk<W: Write>(sink: &mut W, chunk: &[u8]) -> io::Result<()> {
    sink.write_all(chunk)?;
    sink.flush()
}

/// Owns the capture device and the data socket for one session
///
/// Both are released when the session is dropped, whichever way the loop
/// ended.
pub struct SendSession {
    capture: Box<dyn CaptureSource>,
    stream: AudioStream,
    chunk_size: usize,
}

impl SendSession {
    pub fn new(capture: Box<dyn CaptureSource>, stream: AudioStream, chunk_size: usize) -> Self {
        Self {
            capture,
            stream,
            chunk_size,
        }
    }

    pub fn run(mut self, running: &AtomicBool) -> (SendEnd, SessionStats) {
        let started = Instant::now();
        let (end, stats) = pump(self.capture.as_mut(), &mut self.stream, self.chunk_size, running);
        tracing::info!(
            ?end,
            chunks = stats.chunks,
            bytes = stats.bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Send session ended"
        );
        (end, stats)
    }
}

impl Drop for SendSession {
    fn drop(&mut self) {
        self.capture.close();
        self.stream.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::AudioBackend;
    use crate::audio::memory::{CaptureScript, MemoryBackend};

    struct FailingWriter {
        accepted: usize,
        fail_after: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.accepted >= self.fail_after {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "broken pipe"));
            }
            self.accepted += buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn scripted(chunks: usize) -> MemoryBackend {
        MemoryBackend::new(CaptureScript::Chunks(
            (0..chunks).map(|i| vec![i as u8; 16]).collect(),
        ))
    }

    #[test]
    fn test_pump_preserves_order_until_source_ends() {
        let backend = scripted(3);
        let mut capture = backend.open_capture(None).unwrap();
        let mut out = Vec::new();
        let running = AtomicBool::new(true);

        let (end, stats) = pump(capture.as_mut(), &mut out, 16, &running);
        assert_eq!(end, SendEnd::SourceEnded);
        assert_eq!(stats, SessionStats { chunks: 3, bytes: 48 });
        assert_eq!(&out[..16], &[0u8; 16]);
        assert_eq!(&out[32..], &[2u8; 16]);
    }

    #[test]
    fn test_pump_reports_write_failure() {
        let backend = scripted(5);
        let mut capture = backend.open_capture(None).unwrap();
        let mut sink = FailingWriter {
            accepted: 0,
            fail_after: 32,
        };
        let running = AtomicBool::new(true);

        let (end, stats) = pump(capture.as_mut(), &mut sink, 16, &running);
        assert!(matches!(end, SendEnd::WriteFailed(_)));
        assert!(!end.is_clean());
        assert_eq!(stats.chunks, 2);
    }

    #[test]
    fn test_pump_stops_when_cancelled() {
        let backend = MemoryBackend::silence();
        backend.set_realtime(false);
        let mut capture = backend.open_capture(None).unwrap();
        let running = AtomicBool::new(false);

        let (end, stats) = pump(capture.as_mut(), &mut Vec::new(), 16, &running);
        assert_eq!(end, SendEnd::Cancelled);
        assert_eq!(stats.chunks, 0);
    }
}
