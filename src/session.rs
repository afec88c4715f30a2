//! Streaming Session State Machine
//!
//! One [`Session`] per connected stream. Each chunk runs the full pipeline
//! synchronously: harmonic separation and feature extraction over every
//! filled analysis window, then rukooz, seyir, and fusion recomputed over
//! the accumulated session history. The transport layer delivers chunks in
//! order and awaits each result, so there is no reentrancy and no hidden
//! mutation of session state.
//!
//! Sessions are independent: each owns its buffers and shares only the
//! read-only [`MaqamModel`] behind an `Arc`, so any number of sessions can
//! run concurrently without locking.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::Arc,
};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cqt::{CqtExtractor, CqtExtractorBuilder};
use crate::hpss::{HarmonicSeparator, HarmonicSeparatorBuilder};
use crate::mlp::{build_features, MlpFusion};
use crate::profile::{ModelError, ProfileSet};
use crate::rukooz::{RukoozEstimate, RukoozTracker};
use crate::seyir::{self, SequenceOptions};
use crate::BINS;

/// Errors for chunks the session rejects without mutating its state.
#[derive(Debug, Error)]
pub enum InputError {
    /// Chunk carried the wrong channel count; the core takes mono only.
    #[error("expected {expected} channel(s), got {got}")]
    ChannelCount {
        /// Channel count the session accepts.
        expected: u16,
        /// Channel count the chunk carried.
        got: u16,
    },

    /// Chunk sample rate does not match the session's configured rate.
    #[error("expected sample rate {expected}, got {got}")]
    SampleRate {
        /// Sample rate the session was opened with.
        expected: u32,
        /// Sample rate the chunk carried.
        got: u32,
    },

    /// Chunk sequence number did not advance.
    #[error("chunk sequence {got} not after {last}")]
    OutOfOrder {
        /// Highest sequence number accepted so far.
        last: u64,
        /// Sequence number the chunk carried.
        got: u64,
    },

    /// Chunk payload was undecodable.
    #[error("malformed chunk: {0}")]
    Malformed(String),
}

/// Errors for chunks delivered in the wrong session state.
#[derive(Debug, Error)]
pub enum StateError {
    /// The session was closed; its buffers are gone.
    #[error("session is closed and no longer accepts chunks")]
    Closed,
}

/// Any error a [`Session::process_chunk`] call can produce. A result and
/// an error are mutually exclusive; a silent chunk is not an error.
#[derive(Debug, Error)]
pub enum ChunkError {
    /// The chunk itself was unacceptable.
    #[error(transparent)]
    Input(#[from] InputError),
    /// The session cannot accept chunks anymore.
    #[error(transparent)]
    State(#[from] StateError),
}

/// Errors while building an [`Engine`].
#[derive(Debug, Error)]
pub enum EngineError {
    /// An error occurred during the configuration of the engine.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The model failed to load; the engine must not start.
    #[error(transparent)]
    Model(#[from] ModelError),
}

/// One chunk of mono PCM from the transport layer.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Mono PCM samples in `[-1, 1]`.
    pub samples: Vec<f32>,
    /// Sample rate the chunk was captured at.
    pub sample_rate: u32,
    /// Interleaved channel count; must be 1.
    pub channels: u16,
    /// Monotonically increasing sequence number.
    pub sequence: u64,
}

impl AudioChunk {
    /// Convenience constructor for a mono chunk.
    pub fn mono(samples: Vec<f32>, sample_rate: u32, sequence: u64) -> Self {
        AudioChunk { samples, sample_rate, channels: 1, sequence }
    }
}

/// Session lifecycle states.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Phase {
    /// Open, no audio received yet.
    Idle,
    /// Buffering samples toward the next analysis window.
    Accumulating,
    /// Running the per-chunk scoring pass.
    Emitting,
    /// Terminal; all session state has been discarded.
    Closed,
}

/// The result emitted for every accepted chunk.
///
/// Scores are unnormalized (fused scores, or raw log-likelihoods when no
/// fusion network is configured); they rank maqamat but are not
/// probabilities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionResult {
    /// Best-scoring maqam name.
    pub maqam: String,
    /// Current rukooz estimate, `bin == -1` while unknown.
    pub rukooz: RukoozEstimate,
    /// Fused score per maqam.
    pub scores: BTreeMap<String, f32>,
    /// Raw Markov log-likelihood per maqam.
    pub markov: BTreeMap<String, f32>,
    /// Mean chroma energy per bin over the session, for visualization.
    pub chroma: Vec<f32>,
}

/// The process-lifetime model: maqam profiles plus the optional fusion
/// network. Loaded once, injected read-only into every session.
#[derive(Debug)]
pub struct MaqamModel {
    profiles: ProfileSet,
    fusion: Option<MlpFusion>,
}

impl MaqamModel {
    /// Assemble a model, checking that the fusion network was trained on
    /// exactly this catalog.
    pub fn new(profiles: ProfileSet, fusion: Option<MlpFusion>) -> Result<Self, ModelError> {
        if let Some(fusion) = &fusion {
            let names = profiles.names();
            if fusion.classes().iter().map(String::as_str).ne(names.iter().copied()) {
                return Err(ModelError::malformed(
                    "mlp artifact",
                    "classifier classes do not match the profile catalog".to_string(),
                ));
            }
        }
        Ok(MaqamModel { profiles, fusion })
    }

    /// Load the model artifacts from disk. Any failure is fatal.
    pub fn load(
        profile_path: impl AsRef<Path>,
        mlp_path: Option<&Path>,
    ) -> Result<Self, ModelError> {
        let profiles = ProfileSet::from_path(profile_path)?;
        let fusion = match mlp_path {
            Some(path) => Some(MlpFusion::from_path(path)?),
            None => None,
        };
        Self::new(profiles, fusion)
    }

    /// The built-in theoretical catalog with no fusion network; fused
    /// scores fall back to the raw Markov scores.
    pub fn theoretical() -> Self {
        MaqamModel { profiles: ProfileSet::theoretical(), fusion: None }
    }

    /// The loaded profile catalog.
    pub fn profiles(&self) -> &ProfileSet {
        &self.profiles
    }
}

/// Builder for an [`Engine`].
pub struct EngineBuilder {
    sample_rate: usize,
    window_len: usize,
    hop_len: usize,
    min_freq: f32,
    num_octaves: usize,
    silence_floor: f32,
    min_run: usize,
    rukooz_margin: f32,
    rukooz_min_frames: usize,
}

impl EngineBuilder {
    /// Start with default parameters:
    /// sample_rate = 22_050, window_len = 8192, hop_len = 4096,
    /// min_freq = 130.81, num_octaves = 4, silence_floor = 1e-4,
    /// min_run = 2, rukooz_margin = 0.02, rukooz_min_frames = 1.
    pub fn new() -> Self {
        EngineBuilder {
            sample_rate: 22_050,
            window_len: 8192,
            hop_len: 4096,
            min_freq: 130.81,
            num_octaves: 4,
            silence_floor: 1e-4,
            min_run: 2,
            rukooz_margin: 0.02,
            rukooz_min_frames: 1,
        }
    }

    /// Set the sample rate all sessions will expect.
    pub fn sample_rate(mut self, rate: usize) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Set the analysis window length in samples.
    pub fn window_len(mut self, len: usize) -> Self {
        self.window_len = len;
        self
    }

    /// Set the hop between analysis windows in samples.
    pub fn hop_len(mut self, len: usize) -> Self {
        self.hop_len = len;
        self
    }

    /// Set the tuning reference frequency of pitch-class bin 0.
    pub fn min_freq(mut self, freq: f32) -> Self {
        self.min_freq = freq;
        self
    }

    /// Set the number of octaves the extractor analyzes.
    pub fn num_octaves(mut self, n: usize) -> Self {
        self.num_octaves = n;
        self
    }

    /// Set the total frame energy below which frames count as silent.
    pub fn silence_floor(mut self, floor: f32) -> Self {
        self.silence_floor = floor;
        self
    }

    /// Set the minimum dominant-bin run length kept in the pitch sequence.
    pub fn min_run(mut self, frames: usize) -> Self {
        self.min_run = frames;
        self
    }

    /// Set the confidence margin a challenger rukooz bin must clear.
    pub fn rukooz_margin(mut self, margin: f32) -> Self {
        self.rukooz_margin = margin;
        self
    }

    /// Set the active frames required before a rukooz is committed.
    pub fn rukooz_min_frames(mut self, frames: usize) -> Self {
        self.rukooz_min_frames = frames;
        self
    }

    /// Finalize and create the [`Engine`] around a loaded model.
    pub fn build(self, model: MaqamModel) -> Result<Engine, EngineError> {
        if self.hop_len == 0 || self.hop_len > self.window_len || self.window_len % self.hop_len != 0
        {
            return Err(EngineError::Configuration(
                "hop_len must divide window_len and not exceed it".into(),
            ));
        }
        let extractor = CqtExtractorBuilder::new()
            .sample_rate(self.sample_rate)
            .min_freq(self.min_freq)
            .num_octaves(self.num_octaves)
            .window_len(self.window_len)
            .build()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;
        let separator = HarmonicSeparatorBuilder::new()
            .build()
            .map_err(|e| EngineError::Configuration(e.to_string()))?;

        Ok(Engine {
            model: Arc::new(model),
            extractor: Arc::new(extractor),
            separator,
            sample_rate: self.sample_rate as u32,
            hop_len: self.hop_len,
            seq_opts: SequenceOptions {
                silence_floor: self.silence_floor,
                min_run: self.min_run,
            },
            rukooz_margin: self.rukooz_margin,
            rukooz_min_frames: self.rukooz_min_frames,
        })
    }
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Process-wide entry point: owns the read-only model and the shared
/// extractor kernels, and opens independent sessions.
pub struct Engine {
    model: Arc<MaqamModel>,
    extractor: Arc<CqtExtractor>,
    separator: HarmonicSeparator,
    sample_rate: u32,
    hop_len: usize,
    seq_opts: SequenceOptions,
    rukooz_margin: f32,
    rukooz_min_frames: usize,
}

impl Engine {
    /// Start customizing with a builder.
    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    /// Create an engine with default parameters around a loaded model.
    pub fn new(model: MaqamModel) -> Result<Self, EngineError> {
        EngineBuilder::new().build(model)
    }

    /// The loaded model this engine injects into its sessions.
    pub fn model(&self) -> &MaqamModel {
        &self.model
    }

    /// Open an independent streaming session.
    pub fn open_session(&self) -> Session {
        debug!("session opened");
        Session {
            phase: Phase::Idle,
            model: Arc::clone(&self.model),
            extractor: Arc::clone(&self.extractor),
            separator: self.separator.clone(),
            sample_rate: self.sample_rate,
            hop_len: self.hop_len,
            seq_opts: self.seq_opts,
            tracker: RukoozTracker::new()
                .with_margin(self.rukooz_margin)
                .with_min_frames(self.rukooz_min_frames)
                .with_silence_floor(self.seq_opts.silence_floor),
            pending: Vec::new(),
            chromagram: Vec::new(),
            last_sequence: None,
            last_result: None,
        }
    }

    /// Analyze a complete recording in one pass: equivalent to a streaming
    /// session fed a single chunk.
    pub fn analyze(&self, samples: &[f32], sample_rate: u32) -> Result<PredictionResult, ChunkError> {
        let mut session = self.open_session();
        session.process_chunk(&AudioChunk::mono(samples.to_vec(), sample_rate, 0))
    }
}

/// One streaming analysis session. Never shared between streams.
pub struct Session {
    phase: Phase,
    model: Arc<MaqamModel>,
    extractor: Arc<CqtExtractor>,
    separator: HarmonicSeparator,
    sample_rate: u32,
    hop_len: usize,
    seq_opts: SequenceOptions,
    tracker: RukoozTracker,
    pending: Vec<f32>,
    chromagram: Vec<[f32; BINS]>,
    last_sequence: Option<u64>,
    last_result: Option<PredictionResult>,
}

impl Session {
    /// Current lifecycle state.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// The result of the most recent accepted chunk, if any.
    pub fn last_result(&self) -> Option<&PredictionResult> {
        self.last_result.as_ref()
    }

    /// Run the full pipeline for one chunk and emit a prediction.
    ///
    /// Rejected chunks leave the session state untouched: a subsequent
    /// valid chunk behaves exactly as if the bad chunk never arrived.
    pub fn process_chunk(&mut self, chunk: &AudioChunk) -> Result<PredictionResult, ChunkError> {
        if self.phase == Phase::Closed {
            warn!(sequence = chunk.sequence, "chunk delivered to closed session");
            return Err(StateError::Closed.into());
        }
        self.validate(chunk).inspect_err(|e| {
            warn!(sequence = chunk.sequence, error = %e, "chunk rejected");
        })?;

        if self.phase == Phase::Idle {
            self.phase = Phase::Accumulating;
        }
        self.pending.extend_from_slice(&chunk.samples);

        // Feature pass: one chroma frame per filled window, strictly
        // incremental and append-only.
        let window_len = self.extractor.window_len();
        while self.pending.len() >= window_len {
            let harmonic = self.separator.separate(&self.pending[..window_len]);
            let frame = self
                .extractor
                .extract(&harmonic)
                .map_err(|e| InputError::Malformed(e.to_string()))?;
            self.chromagram.push(frame);
            self.pending.drain(..self.hop_len);
        }

        // Scoring pass over the full accumulated history.
        self.phase = Phase::Emitting;
        let result = self.score();
        self.phase = Phase::Accumulating;
        self.last_sequence = Some(chunk.sequence);
        self.last_result = Some(result.clone());
        Ok(result)
    }

    /// Close the session: stop accepting chunks and release its buffers.
    pub fn close(&mut self) {
        self.phase = Phase::Closed;
        self.pending = Vec::new();
        self.chromagram = Vec::new();
        self.last_result = None;
        debug!("session closed");
    }

    fn validate(&self, chunk: &AudioChunk) -> Result<(), InputError> {
        if chunk.channels != 1 {
            return Err(InputError::ChannelCount { expected: 1, got: chunk.channels });
        }
        if chunk.sample_rate != self.sample_rate {
            return Err(InputError::SampleRate {
                expected: self.sample_rate,
                got: chunk.sample_rate,
            });
        }
        if chunk.samples.is_empty() {
            return Err(InputError::Malformed("empty sample buffer".into()));
        }
        if chunk.samples.iter().any(|s| !s.is_finite()) {
            return Err(InputError::Malformed("non-finite samples".into()));
        }
        if let Some(last) = self.last_sequence {
            if chunk.sequence <= last {
                return Err(InputError::OutOfOrder { last, got: chunk.sequence });
            }
        }
        Ok(())
    }

    fn score(&mut self) -> PredictionResult {
        let rukooz = self.tracker.update(&self.chromagram);
        let sequence = seyir::derive_sequence(&self.chromagram, rukooz, &self.seq_opts);

        let mut markov = BTreeMap::new();
        let mut markov_vec = Vec::with_capacity(self.model.profiles.len());
        for profile in self.model.profiles.iter() {
            let ll = seyir::score(&sequence, profile);
            markov.insert(profile.name.clone(), ll);
            markov_vec.push(ll);
        }

        let mut mean_chroma = [0.0f32; BINS];
        if !self.chromagram.is_empty() {
            for frame in &self.chromagram {
                for (m, &e) in mean_chroma.iter_mut().zip(frame.iter()) {
                    *m += e;
                }
            }
            for m in &mut mean_chroma {
                *m /= self.chromagram.len() as f32;
            }
        }

        let scores = match &self.model.fusion {
            Some(fusion) => {
                let fused = fusion.predict(&build_features(&mean_chroma, &markov_vec));
                fusion
                    .classes()
                    .iter()
                    .cloned()
                    .zip(fused)
                    .collect::<BTreeMap<_, _>>()
            }
            None => markov.clone(),
        };

        // Argmax; ties break toward the higher raw Markov score, then the
        // lexicographically first name (maps iterate sorted).
        let mut best: Option<(&str, f32, f32)> = None;
        for (name, &fused) in &scores {
            let raw = markov[name];
            let better = match best {
                None => true,
                Some((_, bf, br)) => fused > bf || (fused == bf && raw > br),
            };
            if better {
                best = Some((name.as_str(), fused, raw));
            }
        }
        let maqam = best.map(|(name, _, _)| name.to_string()).unwrap_or_default();

        PredictionResult {
            maqam,
            rukooz,
            scores,
            markov,
            chroma: mean_chroma.to_vec(),
        }
    }
}
