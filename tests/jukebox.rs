//! End-to-end jukebox lifecycle tests, run against every shipped
//! similarity method: analysis of synthetic audio, id generation,
//! similarity determinism, removal/re-registration shuffles and
//! whole-state serialization.

use attune_audio::{Jukebox, Track, TrackId};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg32;
use std::f32::consts::PI;

const SAMPLE_RATE: usize = 22050;
const TRACK_SECONDS: usize = 10;

/// Synthesize a short piece of "music" as a sum of randomly placed
/// sine voices with a bit of tremolo, normalized to [-1, 1].
fn generate_music(length: usize, seed: u64) -> Vec<f32> {
    let mut rng = Pcg32::seed_from_u64(seed);
    let mut out = vec![0f32; length];

    let voices = 5 + rng.gen_range(0..20);
    for _ in 0..=voices {
        let len = length / 10 + (rng.gen::<f32>() * (length / 10) as f32) as usize;
        let start = (rng.gen::<f32>() * (length - len) as f32) as usize;
        let base_freq = 100. + 1000. * rng.gen::<f32>().powi(2);
        let base_amp = 0.1 + 0.9 * rng.gen::<f32>();
        let tremolo_size = (base_amp - 0.5).abs() * rng.gen::<f32>();
        let tremolo_speed = 5. * rng.gen::<f32>().powi(3);
        for s in start..(start + len).min(length) {
            let t = 2. * PI * s as f32 / SAMPLE_RATE as f32;
            let amp = base_amp + tremolo_size * (t * tremolo_speed).sin();
            out[s] += amp * (t * base_freq).sin();
        }
    }

    let peak = out.iter().fold(0f32, |acc, &x| acc.max(x.abs()));
    if peak > 0. {
        for sample in &mut out {
            *sample /= peak;
        }
    }
    out
}

/// Analyze 100 synthetic tracks with the given jukebox.
fn analyzed_tracks(jukebox: &Jukebox) -> Vec<Track> {
    (0..100)
        .map(|i| {
            let pcm = generate_music(SAMPLE_RATE * TRACK_SECONDS, 42 * i + 1);
            let mut track = jukebox.track_alloc();
            jukebox
                .analyze_pcm(&pcm, &mut track)
                .expect("analysis of synthetic audio");
            track
        })
        .collect()
}

fn similarity_vector(
    jukebox: &Jukebox,
    seed: usize,
    tracks: &[Track],
    ids: &[TrackId],
) -> Vec<f32> {
    let mut out = vec![0f32; ids.len()];
    jukebox
        .similarity(&tracks[seed], ids[seed], &tracks[..ids.len()], ids, &mut out)
        .expect("similarity");
    out
}

fn exercise_method(method: &str) {
    let mut jukebox = Jukebox::power_on(Some(method), None).unwrap();
    assert_eq!(jukebox.track_count(), 0);

    let tracks = analyzed_tracks(&jukebox);
    let mut ids: Vec<TrackId> = vec![0; 100];

    jukebox.set_music_style(&tracks[..25]).unwrap();

    // 50 tracks with generated ids
    jukebox
        .add_tracks(&tracks[..50], &mut ids[..50], true)
        .unwrap();
    assert_eq!(jukebox.track_count(), 50);
    assert_eq!(jukebox.max_track_id(), 49);
    for (i, &id) in ids[..50].iter().enumerate() {
        assert_eq!(id, i as TrackId);
    }

    // 40 more with caller-supplied ids
    for i in 50..90 {
        ids[i] = 50 + (i as TrackId * 27) % 367;
    }
    ids[60] = 1000;
    jukebox
        .add_tracks(&tracks[50..90], &mut ids[50..90], false)
        .unwrap();
    assert_eq!(jukebox.track_count(), 90);
    assert_eq!(jukebox.max_track_id(), 1000);

    // registered ids are reported back, whatever the order
    let mut registered = jukebox.track_ids();
    registered.sort();
    let mut expected = ids[..90].to_vec();
    expected.sort();
    assert_eq!(registered, expected);

    // similarity is deterministic on unchanged state
    let first = similarity_vector(&jukebox, 42, &tracks, &ids[..90]);
    let second = similarity_vector(&jukebox, 42, &tracks, &ids[..90]);
    assert_eq!(first, second);

    // a track compared to itself scores zero
    assert_eq!(first[42], 0.);

    // neither shipped method keeps a neighbor index
    assert!(jukebox.guess_neighbors(ids[30], 20).is_none());
    assert!(jukebox
        .guess_neighbors_filtered(ids[30], 20, &ids[..45])
        .is_none());

    // remove the first 30, add 10 fresh ones, remove them again and
    // re-add the first 30; the state reshuffles internally but must
    // answer queries exactly as before
    jukebox.remove_tracks(&ids[..30]).unwrap();
    assert_eq!(jukebox.track_count(), 60);
    assert_eq!(jukebox.max_track_id(), 1000);

    jukebox
        .add_tracks(&tracks[90..100], &mut ids[90..100], true)
        .unwrap();
    assert_eq!(jukebox.track_count(), 70);
    assert_eq!(jukebox.max_track_id(), 1010);
    for (i, &id) in ids[90..100].iter().enumerate() {
        assert_eq!(id, 1001 + i as TrackId);
    }

    jukebox.remove_tracks(&ids[90..100]).unwrap();
    assert_eq!(jukebox.track_count(), 60);

    jukebox
        .add_tracks(&tracks[..30], &mut ids[..30], true)
        .unwrap();
    assert_eq!(jukebox.track_count(), 90);
    assert_eq!(jukebox.max_track_id(), 1040);
    for (i, &id) in ids[..30].iter().enumerate() {
        assert_eq!(id, 1011 + i as TrackId);
    }

    let reshuffled = similarity_vector(&jukebox, 42, &tracks, &ids[..90]);
    assert_eq!(first, reshuffled);

    // serialize the whole state and restore it into a second jukebox
    let mut buffer = Vec::new();
    let written = jukebox.to_stream(&mut buffer).unwrap();
    assert_eq!(written, buffer.len());
    let mut restored = Jukebox::from_stream(&mut buffer.as_slice()).unwrap();

    assert_eq!(restored.method_name(), method);
    assert_eq!(restored.track_count(), 90);
    assert_eq!(restored.max_track_id(), 1040);
    let original_sims = similarity_vector(&jukebox, 42, &tracks, &ids[..90]);
    let restored_sims = similarity_vector(&restored, 42, &tracks, &ids[..90]);
    assert_eq!(original_sims, restored_sims);

    // both jukeboxes must keep agreeing when new tracks are added
    jukebox
        .add_tracks(&tracks[90..100], &mut ids[90..100], true)
        .unwrap();
    for (i, &id) in ids[90..100].iter().enumerate() {
        assert_eq!(id, 1041 + i as TrackId);
    }
    let mut restored_ids = ids[90..100].to_vec();
    restored
        .add_tracks(&tracks[90..100], &mut restored_ids, true)
        .unwrap();
    assert_eq!(restored_ids, &ids[90..100]);

    let original_sims = similarity_vector(&jukebox, 10, &tracks, &ids);
    let restored_sims = similarity_vector(&restored, 10, &tracks, &ids);
    assert_eq!(original_sims, restored_sims);
}

#[test]
fn test_timbre_lifecycle() {
    exercise_method("timbre");
}

#[test]
fn test_mandelellis_lifecycle() {
    exercise_method("mandelellis");
}

#[test]
fn test_file_round_trip() {
    let mut jukebox = Jukebox::power_on(Some("timbre"), None).unwrap();
    let tracks: Vec<Track> = (0..30)
        .map(|i| {
            let pcm = generate_music(SAMPLE_RATE * TRACK_SECONDS, 42 * i + 1);
            let mut track = jukebox.track_alloc();
            jukebox.analyze_pcm(&pcm, &mut track).unwrap();
            track
        })
        .collect();
    jukebox.set_music_style(&tracks).unwrap();
    let mut ids = vec![0; 30];
    jukebox.add_tracks(&tracks, &mut ids, true).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state.jbox");
    jukebox.to_file(&path).unwrap();
    let restored = Jukebox::from_file(&path).unwrap();

    assert_eq!(restored.track_count(), 30);
    let original = similarity_vector(&jukebox, 7, &tracks, &ids);
    let recovered = similarity_vector(&restored, 7, &tracks, &ids);
    assert_eq!(original, recovered);
}

#[test]
fn test_track_binary_round_trip_bit_for_bit() {
    let jukebox = Jukebox::power_on(Some("mandelellis"), None).unwrap();
    let pcm = generate_music(SAMPLE_RATE * TRACK_SECONDS, 4242);
    let mut track = jukebox.track_alloc();
    jukebox.analyze_pcm(&pcm, &mut track).unwrap();

    let mut buffer = vec![0u8; jukebox.track_binsize()];
    assert_eq!(
        jukebox.track_tobin(&track, &mut buffer).unwrap(),
        jukebox.track_binsize()
    );
    let mut restored = jukebox.track_alloc();
    jukebox.track_frombin(&buffer, &mut restored).unwrap();

    for (a, b) in track.as_slice().iter().zip(restored.as_slice()) {
        assert_eq!(a.to_bits(), b.to_bits());
    }
}

#[test]
fn test_mp_identity_on_clone() {
    // for the MP-normalized method, identity is decided by the id,
    // not by buffer identity: a cloned seed still scores zero
    let mut jukebox = Jukebox::power_on(Some("timbre"), None).unwrap();
    let tracks: Vec<Track> = (0..30)
        .map(|i| {
            let pcm = generate_music(SAMPLE_RATE * TRACK_SECONDS, 42 * i + 1);
            let mut track = jukebox.track_alloc();
            jukebox.analyze_pcm(&pcm, &mut track).unwrap();
            track
        })
        .collect();
    jukebox.set_music_style(&tracks).unwrap();
    let mut ids = vec![0; 30];
    jukebox.add_tracks(&tracks, &mut ids, true).unwrap();

    let seed = tracks[11].clone();
    let mut out = [0f32; 1];
    jukebox
        .similarity(&seed, ids[11], &tracks[11..12], &ids[11..12], &mut out)
        .unwrap();
    assert_eq!(out[0], 0.);

    // all other scores stay within the normalized range
    let sims = similarity_vector(&jukebox, 11, &tracks, &ids);
    for (i, &sim) in sims.iter().enumerate() {
        if i != 11 {
            assert!((0. ..=1.).contains(&sim), "similarity {i} out of range: {sim}");
        }
    }
}

#[test]
fn test_style_change_requires_reregistration() {
    let mut jukebox = Jukebox::power_on(Some("timbre"), None).unwrap();
    let tracks: Vec<Track> = (0..30)
        .map(|i| {
            let pcm = generate_music(SAMPLE_RATE * TRACK_SECONDS, 42 * i + 1);
            let mut track = jukebox.track_alloc();
            jukebox.analyze_pcm(&pcm, &mut track).unwrap();
            track
        })
        .collect();

    jukebox.set_music_style(&tracks[..10]).unwrap();
    let mut ids = vec![0; 30];
    jukebox.add_tracks(&tracks, &mut ids, true).unwrap();
    let before = similarity_vector(&jukebox, 3, &tracks, &ids);

    // changing the music style invalidates registered statistics;
    // a mixed population answers differently than a re-registered one
    jukebox.set_music_style(&tracks[10..25]).unwrap();
    let stale = similarity_vector(&jukebox, 3, &tracks, &ids);

    jukebox.remove_tracks(&ids).unwrap();
    let mut ids_again = ids.clone();
    jukebox.add_tracks(&tracks, &mut ids_again, false).unwrap();
    let fresh = similarity_vector(&jukebox, 3, &tracks, &ids_again);

    assert_ne!(before, fresh);
    assert_ne!(stale, fresh);
}

#[test]
fn test_add_before_style_fails() {
    let mut jukebox = Jukebox::power_on(Some("timbre"), None).unwrap();
    let track = jukebox.track_alloc();
    let mut ids = [0];
    assert!(jukebox
        .add_tracks(&[track], &mut ids, true)
        .is_err());
}
