//! Benchmarks for the analysis pipeline and the similarity kernels.

use attune_audio::{find_min, Jukebox, Track, TrackId};
use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::f32::consts::PI;

const SAMPLE_RATE: usize = 22050;

fn synthetic_pcm(seconds: usize, seed: u64) -> Vec<f32> {
    let mut rng = Pcg32::seed_from_u64(seed);
    let length = SAMPLE_RATE * seconds;
    let mut out = vec![0f32; length];
    for _ in 0..8 {
        let freq = 100. + 1000. * rng.gen::<f32>();
        let amp = 0.1 + 0.9 * rng.gen::<f32>();
        for (s, sample) in out.iter_mut().enumerate() {
            *sample += amp * (2. * PI * freq * s as f32 / SAMPLE_RATE as f32).sin();
        }
    }
    let peak = out.iter().fold(0f32, |acc, &x| acc.max(x.abs()));
    for sample in &mut out {
        *sample /= peak;
    }
    out
}

fn registered_jukebox(method: &str, count: usize) -> (Jukebox, Vec<Track>, Vec<TrackId>) {
    let mut jukebox = Jukebox::power_on(Some(method), None).unwrap();
    let tracks: Vec<Track> = (0..count)
        .map(|i| {
            let pcm = synthetic_pcm(10, 42 * i as u64 + 1);
            let mut track = jukebox.track_alloc();
            jukebox.analyze_pcm(&pcm, &mut track).unwrap();
            track
        })
        .collect();
    jukebox.set_music_style(&tracks).unwrap();
    let mut ids = vec![0; count];
    jukebox.add_tracks(&tracks, &mut ids, true).unwrap();
    (jukebox, tracks, ids)
}

fn bench_analyze_pcm(c: &mut Criterion) {
    let mut group = c.benchmark_group("analyze_pcm");
    let pcm = synthetic_pcm(30, 1);

    for method in ["timbre", "mandelellis"] {
        let jukebox = Jukebox::power_on(Some(method), None).unwrap();
        group.bench_function(method, |b| {
            let mut track = jukebox.track_alloc();
            b.iter(|| {
                jukebox.analyze_pcm(black_box(&pcm), &mut track).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_similarity(c: &mut Criterion) {
    let mut group = c.benchmark_group("similarity/100 candidates");

    for method in ["timbre", "mandelellis"] {
        let (jukebox, tracks, ids) = registered_jukebox(method, 100);
        group.bench_function(method, |b| {
            let mut out = vec![0f32; tracks.len()];
            b.iter(|| {
                jukebox
                    .similarity(
                        black_box(&tracks[0]),
                        ids[0],
                        black_box(&tracks),
                        &ids,
                        &mut out,
                    )
                    .unwrap();
            });
        });
    }
    group.finish();
}

fn bench_find_min(c: &mut Criterion) {
    let mut rng = Pcg32::seed_from_u64(7);
    let values: Vec<f32> = (0..10_000).map(|_| rng.gen()).collect();

    c.bench_function("find_min/10 of 10k", |b| {
        b.iter(|| find_min(black_box(&values), None, 10, true));
    });
}

criterion_group!(benches, bench_analyze_pcm, bench_similarity, bench_find_min);
criterion_main!(benches);
