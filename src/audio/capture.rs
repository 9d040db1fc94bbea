//! Audio capture
//!
//! A capture source hands out fixed-size chunks of interleaved 44.1 kHz
//! stereo s16le PCM, the format carried on the wire. Whatever the device
//! delivers natively is converted here; mono input is duplicated to both
//! channels.

use crate::error::AudioError;

/// Producer of wire-format PCM chunks
pub trait CaptureSource: Send {
    /// Fill `buf` completely with the next PCM bytes
    ///
    /// Returns the number of bytes written, which is `buf.len()` while the
    /// source is live and `0` once a finite source is exhausted.
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, AudioError>;

    /// Release the device; further reads return `AudioError::Closed`
    fn close(&mut self);
}

/// Native sample types a device may deliver
pub trait ToPcm16: Copy {
    fn to_pcm16(self) -> i16;
}

impl ToPcm16 for i16 {
    fn to_pcm16(self) -> i16 {
        self
    }
}

impl ToPcm16 for f32 {
    fn to_pcm16(self) -> i16 {
        (self.clamp(-1.0, 1.0) * 32767.0) as i16
    }
}

impl ToPcm16 for u16 {
    fn to_pcm16(self) -> i16 {
        (self as i32 - 32768) as i16
    }
}

impl ToPcm16 for u8 {
    fn to_pcm16(self) -> i16 {
        (self as i16 - 128) << 8
    }
}

/// Append `samples` to `out` as stereo s16le
///
/// Mono frames are duplicated; extra channels beyond two are dropped.
pub fn append_stereo_s16le<T: ToPcm16>(samples: &[T], channels: u16, out: &mut Vec<u8>) {
    let channels = channels.max(1) as usize;
    let frames = samples.len() / channels;
    out.reserve(frames * 4);
    for frame in samples.chunks_exact(channels) {
        let left = frame[0].to_pcm16();
        let right = if channels == 1 {
            left
        } else {
            frame[1].to_pcm16()
        };
        out.extend_from_slice(&left.to_le_bytes());
        out.extend_from_slice(&right.to_le_bytes());
    }
}

pub fn to_stereo_s16le<T: ToPcm16>(samples: &[T], channels: u16) -> Vec<u8> {
    let mut out = Vec::new();
    append_stereo_s16le(samples, channels, &mut out);
    out
}

#[cfg(feature = "audio")]
pub use host::CpalCapture;

#[cfg(feature = "audio")]
mod host {
    use bytes::Bytes;
    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{SampleFormat, StreamConfig};
    use crossbeam_channel::{bounded, Receiver, RecvTimeoutError};
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::Duration;

    use super::*;
    use crate::audio::buffer::ChunkAssembler;
    use crate::constants::{CHANNELS, SAMPLE_RATE};

    /// Capture blocks queued between the callback and the reader
    const BLOCK_QUEUE: usize = 256;

    /// Longest time a read waits for the device before giving up
    const READ_STALL: Duration = Duration::from_secs(2);

    /// Capture from a cpal input device on a dedicated thread
    pub struct CpalCapture {
        running: Arc<AtomicBool>,
        blocks: Receiver<Bytes>,
        errors: Receiver<AudioError>,
        assembler: ChunkAssembler,
        thread_handle: Option<JoinHandle<()>>,
        bytes_captured: Arc<AtomicU64>,
    }

    impl CpalCapture {
        /// Open `device` at 44.1 kHz; fails fast if the device cannot run it
        pub fn open(device: cpal::Device) -> Result<Self, AudioError> {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let (config, format) = select_config(&device)?;
            tracing::info!(
                device = %name,
                sample_rate = config.sample_rate.0,
                channels = config.channels,
                ?format,
                "Capture config selected"
            );

            let running = Arc::new(AtomicBool::new(true));
            let bytes_captured = Arc::new(AtomicU64::new(0));
            let (block_tx, block_rx) = bounded::<Bytes>(BLOCK_QUEUE);
            let (error_tx, error_rx) = bounded::<AudioError>(16);
            let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

            let running_for_loop = running.clone();
            let captured = bytes_captured.clone();

            let handle = thread::Builder::new()
                .name("capture".into())
                .spawn(move || {
                    let channels = config.channels;
                    let on_block = move |bytes: Vec<u8>| {
                        captured.fetch_add(bytes.len() as u64, Ordering::Relaxed);
                        // A full queue means the network side stalled; drop the block
                        let _ = block_tx.try_send(Bytes::from(bytes));
                    };
                    let err_tx = error_tx.clone();
                    let err_fn = move |err: cpal::StreamError| {
                        let _ = err_tx.try_send(AudioError::StreamError(err.to_string()));
                    };

                    let stream = match format {
                        SampleFormat::F32 => build::<f32>(&device, &config, channels, on_block, err_fn),
                        SampleFormat::I16 => build::<i16>(&device, &config, channels, on_block, err_fn),
                        SampleFormat::U16 => build::<u16>(&device, &config, channels, on_block, err_fn),
                        SampleFormat::U8 => build::<u8>(&device, &config, channels, on_block, err_fn),
                        other => Err(AudioError::UnsupportedFormat(format!("{:?}", other))),
                    };

                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(e));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    // Keep thread alive while running
                    while running_for_loop.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(10));
                    }
                    // Stream is dropped here, stopping capture
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?;

            let ready = ready_rx
                .recv_timeout(READ_STALL)
                .unwrap_or_else(|_| Err(AudioError::StreamError("capture thread did not start".into())));
            if let Err(e) = ready {
                running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                return Err(e);
            }

            Ok(Self {
                running,
                blocks: block_rx,
                errors: error_rx,
                assembler: ChunkAssembler::new(),
                thread_handle: Some(handle),
                bytes_captured,
            })
        }

        pub fn bytes_captured(&self) -> u64 {
            self.bytes_captured.load(Ordering::Relaxed)
        }
    }

    impl CaptureSource for CpalCapture {
        fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, AudioError> {
            loop {
                if !self.running.load(Ordering::Relaxed) {
                    return Err(AudioError::Closed);
                }
                if let Ok(err) = self.errors.try_recv() {
                    return Err(err);
                }
                if self.assembler.take_into(buf) {
                    return Ok(buf.len());
                }
                match self.blocks.recv_timeout(READ_STALL) {
                    Ok(block) => self.assembler.push(block),
                    Err(RecvTimeoutError::Timeout) => {
                        return Err(AudioError::StreamError("capture device stalled".into()))
                    }
                    Err(RecvTimeoutError::Disconnected) => return Err(AudioError::Closed),
                }
            }
        }

        fn close(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
                tracing::debug!(bytes = self.bytes_captured(), "Capture released");
            }
            self.assembler.clear();
        }
    }

    impl Drop for CpalCapture {
        fn drop(&mut self) {
            self.close();
        }
    }

    fn build<T>(
        device: &cpal::Device,
        config: &StreamConfig,
        channels: u16,
        on_block: impl Fn(Vec<u8>) + Send + 'static,
        err_fn: impl FnMut(cpal::StreamError) + Send + 'static,
    ) -> Result<cpal::Stream, AudioError>
    where
        T: ToPcm16 + cpal::SizedSample,
    {
        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    on_block(to_stereo_s16le(data, channels));
                },
                err_fn,
                None,
            )
            .map_err(|e| AudioError::StreamError(e.to_string()))
    }

    /// Pick a 44.1 kHz config, preferring stereo
    fn select_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat), AudioError> {
        let rate = cpal::SampleRate(SAMPLE_RATE);
        let configs: Vec<_> = device
            .supported_input_configs()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .filter(|c| c.min_sample_rate() <= rate && c.max_sample_rate() >= rate)
            .collect();

        let chosen = configs
            .iter()
            .find(|c| c.channels() == CHANNELS)
            .or_else(|| configs.iter().find(|c| c.channels() == 1))
            .or_else(|| configs.first())
            .ok_or_else(|| {
                AudioError::UnsupportedFormat(format!("device cannot capture at {} Hz", SAMPLE_RATE))
            })?;

        let format = chosen.sample_format();
        let config = StreamConfig {
            channels: chosen.channels(),
            sample_rate: rate,
            buffer_size: cpal::BufferSize::Default,
        };
        Ok((config, format))
    }
}
