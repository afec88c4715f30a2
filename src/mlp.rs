//! MLP Confidence Classifier
//!
//! A frozen feed-forward network fuses spectral evidence (mean chroma
//! energy per bin) with melodic evidence (per-maqam Markov log-likelihoods)
//! into one score per maqam. The network is trained offline; this crate
//! only loads the versioned weight artifact and runs the forward pass.
//!
//! The feature-vector layout is the whole contract between the two sides:
//! 36 max-normalized mean-chroma energies followed by one
//! min-max-normalized Markov score per maqam in sorted-name order. Any
//! change to that layout invalidates existing artifacts, which is why the
//! artifact carries a layout version.

use std::{
    fs::File,
    io::{BufReader, Read},
    path::Path,
};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::profile::ModelError;
use crate::BINS;

/// Version of the weight artifact format and feature layout this crate
/// computes.
pub const MLP_ARTIFACT_VERSION: u32 = 1;

/// One dense layer: row-major weights (`out x in`) and a bias per output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlpLayer {
    /// Weight matrix, one row per output unit.
    pub weights: Vec<Vec<f32>>,
    /// Bias vector, one entry per output unit.
    pub bias: Vec<f32>,
}

/// On-disk artifact: version tag, class list, layer stack.
#[derive(Serialize, Deserialize)]
struct MlpArtifact {
    version: u32,
    classes: Vec<String>,
    layers: Vec<MlpLayer>,
}

/// Frozen confidence-fusion network.
#[derive(Debug)]
pub struct MlpFusion {
    classes: Vec<String>,
    layers: Vec<MlpLayer>,
}

impl MlpFusion {
    /// Build a fusion network from an explicit layer stack, validating the
    /// dimension chain against the feature layout.
    pub fn from_layers(classes: Vec<String>, layers: Vec<MlpLayer>) -> Result<Self, ModelError> {
        if classes.is_empty() {
            return Err(ModelError::malformed("mlp artifact", "no classes".to_string()));
        }
        if !classes.windows(2).all(|w| w[0] < w[1]) {
            return Err(ModelError::malformed(
                "mlp artifact",
                "classes must be sorted and unique".to_string(),
            ));
        }
        if layers.is_empty() {
            return Err(ModelError::malformed("mlp artifact", "no layers".to_string()));
        }

        let mut expected_in = BINS + classes.len();
        for (i, layer) in layers.iter().enumerate() {
            let out = layer.weights.len();
            if out == 0 || layer.bias.len() != out {
                return Err(ModelError::malformed(
                    "mlp artifact",
                    format!("layer {i} bias length does not match its output size"),
                ));
            }
            for row in &layer.weights {
                if row.len() != expected_in {
                    return Err(ModelError::malformed(
                        "mlp artifact",
                        format!("layer {i} expects input {expected_in}, row has {}", row.len()),
                    ));
                }
                if row.iter().chain(layer.bias.iter()).any(|w| !w.is_finite()) {
                    return Err(ModelError::malformed(
                        "mlp artifact",
                        format!("layer {i} contains non-finite weights"),
                    ));
                }
            }
            expected_in = out;
        }
        if expected_in != classes.len() {
            return Err(ModelError::malformed(
                "mlp artifact",
                format!("final layer outputs {expected_in}, expected {}", classes.len()),
            ));
        }

        Ok(MlpFusion { classes, layers })
    }

    /// Load and validate a weight artifact from a reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ModelError> {
        let artifact: MlpArtifact = serde_json::from_reader(reader)?;
        if artifact.version != MLP_ARTIFACT_VERSION {
            return Err(ModelError::Version {
                expected: MLP_ARTIFACT_VERSION,
                got: artifact.version,
            });
        }
        let fusion = Self::from_layers(artifact.classes, artifact.layers)?;
        info!(
            classes = fusion.classes.len(),
            layers = fusion.layers.len(),
            "loaded fusion classifier"
        );
        Ok(fusion)
    }

    /// Load and validate a weight artifact from a file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ModelError::io(path, e))?;
        Self::from_reader(BufReader::new(file))
    }

    /// Class names, in the sorted order the feature layout assumes.
    pub fn classes(&self) -> &[String] {
        &self.classes
    }

    /// Length of the feature vector this network expects.
    pub fn feature_len(&self) -> usize {
        BINS + self.classes.len()
    }

    /// Forward pass: ReLU on hidden layers, linear output. One fused score
    /// per class, in class order.
    pub fn predict(&self, features: &[f32]) -> Vec<f32> {
        debug_assert_eq!(features.len(), self.feature_len());
        let mut activations = features.to_vec();
        let last = self.layers.len() - 1;
        for (i, layer) in self.layers.iter().enumerate() {
            let mut next = Vec::with_capacity(layer.weights.len());
            for (row, &b) in layer.weights.iter().zip(layer.bias.iter()) {
                let mut sum = b;
                for (&w, &a) in row.iter().zip(activations.iter()) {
                    sum += w * a;
                }
                next.push(if i < last { sum.max(0.0) } else { sum });
            }
            activations = next;
        }
        activations
    }
}

/// Assemble the fusion feature vector from session evidence.
///
/// Mean chroma is normalized by its peak so level does not leak into the
/// classifier; Markov scores are min-max normalized across maqamat, with a
/// degenerate (all-equal) score vector mapping to all zeros.
pub fn build_features(mean_chroma: &[f32; BINS], markov_scores: &[f32]) -> Vec<f32> {
    let mut features = Vec::with_capacity(BINS + markov_scores.len());

    let peak = mean_chroma.iter().fold(0.0f32, |a, &b| a.max(b));
    if peak > 0.0 {
        features.extend(mean_chroma.iter().map(|&e| e / peak));
    } else {
        features.extend(std::iter::repeat(0.0).take(BINS));
    }

    let min = markov_scores.iter().fold(f32::INFINITY, |a, &b| a.min(b));
    let max = markov_scores.iter().fold(f32::NEG_INFINITY, |a, &b| a.max(b));
    if max > min {
        features.extend(markov_scores.iter().map(|&s| (s - min) / (max - min)));
    } else {
        features.extend(std::iter::repeat(0.0).take(markov_scores.len()));
    }
    features
}
