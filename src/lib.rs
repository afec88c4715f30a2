//! # maqam_detector
//!
//! A unified crate for real‐time maqam analysis: compute 36‐bin microtonal
//! chromagrams from streamed mono audio and classify the melodic mode
//! (maqam) from pitch content and melodic progression.
//!
//! The pipeline per chunk: harmonic source separation → constant‐Q
//! feature extraction → rukooz (tonic) tracking → seyir Markov scoring →
//! MLP confidence fusion. Sessions are independent and share only the
//! read‐only model, so streams run concurrently without locks.
//!
//! ## Example
//! ```rust
//! use maqam_detector::{AudioChunk, Engine, MaqamModel};
//!
//! fn run() -> Result<(), Box<dyn std::error::Error>> {
//!     // 1) Load the model once at startup (here: the built-in catalog)
//!     let engine = Engine::builder()
//!         .sample_rate(22_050)
//!         .build(MaqamModel::theoretical())?;
//!
//!     // 2) One session per connected stream
//!     let mut session = engine.open_session();
//!
//!     // 3) In your transport loop:
//!     let chunk = AudioChunk::mono(vec![0.0; 8192], 22_050, 0);
//!     let result = session.process_chunk(&chunk)?;
//!     println!(
//!         "Predicted {} (rukooz bin {}, confidence {:.3})",
//!         result.maqam,
//!         result.rukooz.bin,
//!         result.rukooz.confidence
//!     );
//!
//!     session.close();
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//! - 36 bins per octave resolve the sixth-tone intervals maqam scales
//!   depend on
//! - Batch interface: [`Engine::analyze`] runs a whole recording as a
//!   one-chunk session

#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]
#![deny(rust_2018_idioms)]
#![deny(clippy::all)]

/// Pitch-class bins per octave: sixth-tone resolution.
pub const BINS: usize = 36;

/// High-level streaming engine and session API.
pub use session::{
    AudioChunk, ChunkError, Engine, EngineBuilder, EngineError, InputError, MaqamModel, Phase,
    PredictionResult, Session, StateError,
};

/// Rukooz estimation types.
pub use rukooz::{RukoozEstimate, RukoozTracker};

/// Model artifact types.
pub use profile::{MaqamProfile, ModelError, ProfileSet, PROFILE_ARTIFACT_VERSION};

/// Fusion classifier types.
pub use mlp::{MlpFusion, MlpLayer, MLP_ARTIFACT_VERSION};

/// Feature extraction types.
pub use cqt::{CqtExtractor, CqtExtractorBuilder, FeatureError};

/// Harmonic separation types.
pub use hpss::{HarmonicSeparator, HarmonicSeparatorBuilder, SeparatorError};

/// Constant-Q feature extraction module.
pub mod cqt;

/// Harmonic source separation module.
pub mod hpss;

/// MLP confidence fusion module.
pub mod mlp;

/// Maqam profile and model artifact module.
pub mod profile;

/// Rukooz (tonic) detection module.
pub mod rukooz;

/// Seyir Markov scoring module.
pub mod seyir;

/// Streaming session module.
pub mod session;
