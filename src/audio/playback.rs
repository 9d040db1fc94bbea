//! Audio playback (receiver side)
//!
//! Chunks arriving from the network are written straight to the device in
//! streaming mode. Volume is applied inside the sink from a `SharedVolume`,
//! so a control thread never touches the device while a write is running.

use crate::error::AudioError;

/// Consumer of wire-format PCM chunks
pub trait PlaybackSink: Send {
    /// Queue one chunk of interleaved stereo s16le for playback
    fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;

    /// Stop output and discard anything still queued
    fn flush(&mut self);
}

/// Scale one s16le sample by `gain`
pub fn apply_gain(sample: i16, gain: f32) -> i16 {
    if gain >= 1.0 {
        sample
    } else {
        (sample as f32 * gain) as i16
    }
}

#[cfg(feature = "audio")]
pub use host::CpalPlayback;

#[cfg(feature = "audio")]
mod host {
    use cpal::traits::{DeviceTrait, StreamTrait};
    use cpal::{SampleFormat, StreamConfig};
    use crossbeam_channel::{bounded, Receiver};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    use super::*;
    use crate::audio::buffer::{create_shared_ring, SharedSampleRing};
    use crate::audio::device::SharedVolume;
    use crate::constants::{CHANNELS, SAMPLE_RATE};

    /// Half a second of stereo samples
    const RING_CAPACITY: usize = SAMPLE_RATE as usize;

    /// How long a write may wait for ring space before dropping samples
    const WRITE_WAIT: Duration = Duration::from_millis(250);

    /// Playback through a cpal output device on a dedicated thread
    pub struct CpalPlayback {
        ring: SharedSampleRing,
        running: Arc<AtomicBool>,
        errors: Receiver<AudioError>,
        thread_handle: Option<JoinHandle<()>>,
    }

    impl CpalPlayback {
        pub fn open(device: cpal::Device, volume: SharedVolume) -> Result<Self, AudioError> {
            let name = device.name().unwrap_or_else(|_| "Unknown".to_string());
            let (config, format) = select_config(&device)?;
            tracing::info!(device = %name, ?format, "Playback config selected");

            let ring = create_shared_ring(RING_CAPACITY);
            let running = Arc::new(AtomicBool::new(true));
            let (error_tx, error_rx) = bounded::<AudioError>(16);
            let (ready_tx, ready_rx) = bounded::<Result<(), AudioError>>(1);

            let ring_for_cb = ring.clone();
            let running_for_loop = running.clone();

            let handle = thread::Builder::new()
                .name("playback".into())
                .spawn(move || {
                    let err_fn = move |err: cpal::StreamError| {
                        let _ = error_tx.try_send(AudioError::StreamError(err.to_string()));
                    };
                    let stream = match format {
                        SampleFormat::I16 => device.build_output_stream(
                            &config,
                            move |data: &mut [i16], _: &cpal::OutputCallbackInfo| {
                                let gain = volume.get();
                                for sample in data.iter_mut() {
                                    *sample = apply_gain(ring_for_cb.try_pop().unwrap_or(0), gain);
                                }
                            },
                            err_fn,
                            None,
                        ),
                        _ => device.build_output_stream(
                            &config,
                            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                                let gain = volume.get();
                                for sample in data.iter_mut() {
                                    let s = ring_for_cb.try_pop().unwrap_or(0);
                                    *sample = s as f32 / 32768.0 * gain;
                                }
                            },
                            err_fn,
                            None,
                        ),
                    };
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(e) => {
                            let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                            return;
                        }
                    };
                    if let Err(e) = stream.play() {
                        let _ = ready_tx.send(Err(AudioError::StreamError(e.to_string())));
                        return;
                    }
                    let _ = ready_tx.send(Ok(()));

                    while running_for_loop.load(Ordering::Relaxed) {
                        thread::sleep(Duration::from_millis(10));
                    }
                })
                .map_err(|e| AudioError::StreamError(e.to_string()))?;

            let ready = ready_rx
                .recv_timeout(Duration::from_secs(2))
                .unwrap_or_else(|_| Err(AudioError::StreamError("playback thread did not start".into())));
            if let Err(e) = ready {
                running.store(false, Ordering::SeqCst);
                let _ = handle.join();
                return Err(e);
            }

            Ok(Self {
                ring,
                running,
                errors: error_rx,
                thread_handle: Some(handle),
            })
        }

        fn stop(&mut self) {
            self.running.store(false, Ordering::SeqCst);
            if let Some(handle) = self.thread_handle.take() {
                let _ = handle.join();
            }
        }
    }

    impl PlaybackSink for CpalPlayback {
        fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
            if let Ok(err) = self.errors.try_recv() {
                return Err(err);
            }
            if !self.running.load(Ordering::Relaxed) {
                return Err(AudioError::Closed);
            }

            let deadline = Instant::now() + WRITE_WAIT;
            let mut samples = pcm
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .peekable();
            while samples.peek().is_some() {
                if self.ring.available() == 0 {
                    if Instant::now() >= deadline {
                        let dropped = samples.count();
                        tracing::warn!(dropped, "Playback ring full, dropping samples");
                        break;
                    }
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                while self.ring.available() > 0 {
                    match samples.next() {
                        Some(sample) => {
                            self.ring.push(sample);
                        }
                        None => break,
                    }
                }
            }
            Ok(())
        }

        fn flush(&mut self) {
            self.ring.clear();
        }
    }

    impl Drop for CpalPlayback {
        fn drop(&mut self) {
            self.ring.clear();
            self.stop();
            tracing::debug!(
                underruns = self.ring.underrun_count(),
                overflows = self.ring.overflow_count(),
                "Playback released"
            );
        }
    }

    fn select_config(device: &cpal::Device) -> Result<(StreamConfig, SampleFormat), AudioError> {
        let rate = cpal::SampleRate(SAMPLE_RATE);
        let configs: Vec<_> = device
            .supported_output_configs()
            .map_err(|e| AudioError::DeviceNotFound(e.to_string()))?
            .filter(|c| {
                c.channels() == CHANNELS && c.min_sample_rate() <= rate && c.max_sample_rate() >= rate
            })
            .collect();
        let chosen = configs
            .iter()
            .find(|c| c.sample_format() == SampleFormat::I16)
            .or_else(|| configs.iter().find(|c| c.sample_format() == SampleFormat::F32))
            .ok_or_else(|| {
                AudioError::UnsupportedFormat(format!(
                    "output cannot play {} Hz stereo i16/f32",
                    SAMPLE_RATE
                ))
            })?;
        Ok((
            StreamConfig {
                channels: CHANNELS,
                sample_rate: rate,
                buffer_size: cpal::BufferSize::Default,
            },
            chosen.sample_format(),
        ))
    }
}
