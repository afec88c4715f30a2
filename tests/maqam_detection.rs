//! Integration tests for rukooz detection and maqam classification using
//! synthetic scale melodies.

use lazy_static::lazy_static;
use maqam_detector::{
    AudioChunk, ChunkError, Engine, InputError, MaqamModel, RukoozEstimate,
};
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use std::sync::Mutex;

const SAMPLE_RATE: u32 = 22_050;
/// D4, exactly 42 sixth-tone steps above the C3 tuning reference:
/// pitch class 6.
const TONIC_D4: f32 = 293.665;
/// The tracker's default challenger margin.
const RUKOOZ_MARGIN: f32 = 0.02;

lazy_static! {
    static ref ENGINE: Engine = Engine::builder()
        .sample_rate(SAMPLE_RATE as usize)
        .build(MaqamModel::theoretical())
        .expect("engine builds with defaults");
}

/// One harmonic-rich tone, loud enough to survive separation.
fn tone(freq: f32, secs: f32) -> Vec<f32> {
    let n = (secs * SAMPLE_RATE as f32) as usize;
    (0..n)
        .map(|i| {
            let t = i as f32 / SAMPLE_RATE as f32;
            let w = 2.0 * std::f32::consts::PI * freq * t;
            0.5 * w.sin() + 0.2 * (2.0 * w).sin() + 0.1 * (3.0 * w).sin()
        })
        .collect()
}

/// Frequency of a scale degree (sixth-tone bins above the tonic).
fn degree_freq(tonic: f32, degree: usize) -> f32 {
    tonic * 2f32.powf(degree as f32 / 36.0)
}

/// A deterministic performance of a scale: the tonic held, the scale
/// ascended through the octave, descended back, and the tonic held again.
fn scale_melody(tonic: f32, degrees: &[usize]) -> Vec<f32> {
    let mut path: Vec<usize> = vec![0];
    path.extend(degrees.iter().copied().filter(|&d| d != 0));
    path.push(36);
    path.extend(degrees.iter().rev().copied().filter(|&d| d != 0));
    path.push(0);

    let mut audio = Vec::new();
    for (i, &deg) in path.iter().enumerate() {
        let secs = if i == 0 || i == path.len() - 1 { 1.5 } else { 0.6 };
        audio.extend(tone(degree_freq(tonic, deg), secs));
    }
    audio
}

fn stream_in_chunks(audio: &[f32], chunk_len: usize) -> Vec<maqam_detector::PredictionResult> {
    let mut session = ENGINE.open_session();
    let mut results = Vec::new();
    for (i, chunk) in audio.chunks(chunk_len).enumerate() {
        let chunk = AudioChunk::mono(chunk.to_vec(), SAMPLE_RATE, i as u64);
        results.push(session.process_chunk(&chunk).unwrap());
    }
    results
}

#[test]
fn scenario_a_rast_scale_predicts_rast_with_its_tonic() {
    let rast = catalog_degrees("Rast");
    let audio = scale_melody(TONIC_D4, &rast);
    let result = ENGINE.analyze(&audio, SAMPLE_RATE).unwrap();

    assert_eq!(result.maqam, "Rast");
    assert_eq!(result.rukooz.bin, 6, "rukooz should sit on D");
    assert!(result.rukooz.confidence > 0.2);
}

#[test]
fn scenario_b_silence_yields_unknown_rukooz_and_flat_scores() {
    let mut session = ENGINE.open_session();
    let chunk = AudioChunk::mono(vec![0.0; 3 * 8192], SAMPLE_RATE, 0);
    let result = session.process_chunk(&chunk).unwrap();

    assert_eq!(result.rukooz, RukoozEstimate::unknown());
    let first = *result.scores.values().next().unwrap();
    assert!(
        result.scores.values().all(|&s| s == first),
        "silence must not differentiate maqamat: {:?}",
        result.scores
    );
}

#[test]
fn scenario_c_rejected_chunk_leaves_session_state_unchanged() {
    let audio = scale_melody(TONIC_D4, &catalog_degrees("Hijaz"));

    let mut control = ENGINE.open_session();
    let expected = control
        .process_chunk(&AudioChunk::mono(audio.clone(), SAMPLE_RATE, 0))
        .unwrap();

    let mut session = ENGINE.open_session();
    let mut bad = AudioChunk::mono(audio.clone(), SAMPLE_RATE, 0);
    bad.channels = 2;
    let err = session.process_chunk(&bad).unwrap_err();
    assert!(matches!(
        err,
        ChunkError::Input(InputError::ChannelCount { expected: 1, got: 2 })
    ));

    let actual = session
        .process_chunk(&AudioChunk::mono(audio, SAMPLE_RATE, 1))
        .unwrap();
    assert_eq!(actual, expected, "bad chunk must not mutate session state");
}

#[test]
fn batch_and_streamed_chunks_agree() {
    let audio = scale_melody(TONIC_D4, &catalog_degrees("Bayati"));
    let batch = ENGINE.analyze(&audio, SAMPLE_RATE).unwrap();

    // Chunk length deliberately unrelated to the window and hop sizes.
    let streamed = stream_in_chunks(&audio, 3001);
    let last = streamed.last().unwrap();

    assert_eq!(*last, batch);
}

#[test]
fn rukooz_does_not_flicker_across_chunks() {
    let audio = scale_melody(TONIC_D4, &catalog_degrees("Rast"));
    let results = stream_in_chunks(&audio, 5000);

    let mut prev = RukoozEstimate::unknown();
    for result in &results {
        let cur = result.rukooz;
        if prev.is_known() && cur.bin != prev.bin {
            assert!(
                cur.confidence > prev.confidence + RUKOOZ_MARGIN,
                "rukooz flickered {} -> {} without clearing the margin",
                prev.bin,
                cur.bin
            );
        }
        prev = cur;
    }
    assert_eq!(prev.bin, 6, "final rukooz should settle on the tonic");
}

#[test]
fn closed_session_rejects_chunks() {
    let mut session = ENGINE.open_session();
    session.close();
    let err = session
        .process_chunk(&AudioChunk::mono(vec![0.0; 512], SAMPLE_RATE, 0))
        .unwrap_err();
    assert!(matches!(err, ChunkError::State(_)));
}

#[test]
fn out_of_order_and_malformed_chunks_are_rejected() {
    let mut session = ENGINE.open_session();
    session
        .process_chunk(&AudioChunk::mono(vec![0.0; 512], SAMPLE_RATE, 5))
        .unwrap();

    let stale = AudioChunk::mono(vec![0.0; 512], SAMPLE_RATE, 5);
    assert!(matches!(
        session.process_chunk(&stale).unwrap_err(),
        ChunkError::Input(InputError::OutOfOrder { last: 5, got: 5 })
    ));

    let nan = AudioChunk::mono(vec![f32::NAN; 512], SAMPLE_RATE, 6);
    assert!(matches!(
        session.process_chunk(&nan).unwrap_err(),
        ChunkError::Input(InputError::Malformed(_))
    ));

    let wrong_rate = AudioChunk::mono(vec![0.0; 512], 48_000, 6);
    assert!(matches!(
        session.process_chunk(&wrong_rate).unwrap_err(),
        ChunkError::Input(InputError::SampleRate { .. })
    ));
}

/// Scale degrees of a catalog maqam.
fn catalog_degrees(name: &str) -> Vec<usize> {
    ENGINE
        .model()
        .profiles()
        .get(name)
        .unwrap_or_else(|| panic!("{name} missing from catalog"))
        .scale_degrees
        .clone()
}

#[test]
fn every_maqam_scale_is_self_consistent() {
    let names: Vec<String> = ENGINE
        .model()
        .profiles()
        .names()
        .iter()
        .map(|s| s.to_string())
        .collect();
    let failures: Mutex<Vec<String>> = Mutex::new(Vec::new());

    names.par_iter().for_each(|name| {
        let audio = scale_melody(TONIC_D4, &catalog_degrees(name));
        let result = ENGINE.analyze(&audio, SAMPLE_RATE).unwrap();

        let own = result.markov[name];
        let best_other = result
            .markov
            .iter()
            .filter(|(n, _)| *n != name)
            .map(|(_, &s)| s)
            .fold(f32::NEG_INFINITY, f32::max);

        if result.maqam != *name || own <= best_other {
            failures.lock().unwrap().push(format!(
                "{name}: predicted {}, own LL {own:.1}, best other {best_other:.1}",
                result.maqam
            ));
        }
    });

    let failures = failures.into_inner().unwrap();
    assert!(
        failures.is_empty(),
        "{} maqam scales misclassified:\n{}",
        failures.len(),
        failures.join("\n")
    );
}
