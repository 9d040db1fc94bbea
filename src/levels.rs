//! Level metering for visualization
//!
//! This is an energy-envelope meter, not a spectrum analyser: a chunk of
//! s16le samples is cut into `bands` equal consecutive sample ranges and each
//! band reports the mean absolute normalized amplitude of its range. It is
//! O(n) per chunk with no allocation beyond the output vector.

/// Compute `bands` amplitude values in `[0, 1]` from interleaved s16le PCM
///
/// The output length is always `bands`, whatever the chunk size. A band whose
/// range holds no samples (chunk shorter than `bands` samples) reports 0.
pub fn compute_levels(pcm: &[u8], bands: usize) -> Vec<f32> {
    let mut levels = vec![0.0f32; bands];
    let total = pcm.len() / 2;
    if bands == 0 || total == 0 {
        return levels;
    }

    for (band, level) in levels.iter_mut().enumerate() {
        let start = band * total / bands;
        let end = (band + 1) * total / bands;
        if end <= start {
            continue;
        }
        let sum: f32 = pcm[start * 2..end * 2]
            .chunks_exact(2)
            .map(|b| (i16::from_le_bytes([b[0], b[1]]) as f32 / 32768.0).abs())
            .sum();
        *level = (sum / (end - start) as f32).clamp(0.0, 1.0);
    }

    levels
}

/// Emits a level vector every `cadence` chunks
pub struct LevelMeter {
    bands: usize,
    cadence: u32,
    counter: u32,
}

impl LevelMeter {
    pub fn new(bands: usize, cadence: u32) -> Self {
        Self {
            bands,
            cadence: cadence.max(1),
            counter: 0,
        }
    }

    pub fn bands(&self) -> usize {
        self.bands
    }

    /// Count one chunk; on every `cadence`-th chunk return its levels
    pub fn tick(&mut self, pcm: &[u8]) -> Option<Vec<f32>> {
        self.counter = self.counter.wrapping_add(1);
        if self.counter % self.cadence == 0 {
            Some(compute_levels(pcm, self.bands))
        } else {
            None
        }
    }

    pub fn reset(&mut self) {
        self.counter = 0;
    }
}
