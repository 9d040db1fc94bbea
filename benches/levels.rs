//! Level meter throughput on one 4 KiB chunk
//!
//! Run with: cargo bench --bench levels

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use lan_audio_relay::constants::{CHUNK_SIZE, DEFAULT_LEVEL_BANDS};
use lan_audio_relay::levels::{compute_levels, LevelMeter};

fn tone_chunk() -> Vec<u8> {
    let mut pcm = Vec::with_capacity(CHUNK_SIZE);
    let mut phase = 0.0f32;
    while pcm.len() < CHUNK_SIZE {
        let sample = (phase.sin() * 12_000.0) as i16;
        phase += 440.0 * std::f32::consts::TAU / 44_100.0;
        pcm.extend_from_slice(&sample.to_le_bytes());
        pcm.extend_from_slice(&sample.to_le_bytes());
    }
    pcm
}

fn bench_compute_levels(c: &mut Criterion) {
    let chunk = tone_chunk();
    c.bench_function("compute_levels_24_bands", |b| {
        b.iter(|| compute_levels(black_box(&chunk), DEFAULT_LEVEL_BANDS))
    });
}

fn bench_meter_tick(c: &mut Criterion) {
    let chunk = tone_chunk();
    let mut meter = LevelMeter::new(DEFAULT_LEVEL_BANDS, 5);
    c.bench_function("level_meter_tick", |b| b.iter(|| meter.tick(black_box(&chunk))));
}

criterion_group!(benches, bench_compute_levels, bench_meter_tick);
criterion_main!(benches);
