//! Maqam Profiles
//!
//! Per-maqam reference records: a 36x36 row-stochastic transition matrix
//! describing the maqam's seyir plus its characteristic scale-degree bins.
//! Profiles load once at startup from a versioned JSON artifact produced by
//! the offline training collaborator and are immutable afterwards. A
//! built-in theoretical catalog derived from the classical jins tables is
//! available when no trained artifact exists.

use std::{
    collections::BTreeMap,
    fs::File,
    io::{BufReader, BufWriter, Read, Write},
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::BINS;

/// Version of the profile artifact format this crate reads.
pub const PROFILE_ARTIFACT_VERSION: u32 = 1;

/// Laplace smoothing applied before row normalization when building
/// theoretical matrices.
const SMOOTHING: f32 = 1e-6;

/// Errors raised while loading model artifacts. All of them are fatal:
/// the engine must not start with a missing or corrupt model.
#[derive(Debug, Error)]
pub enum ModelError {
    /// Failed to read an artifact file.
    #[error("failed to read artifact '{path}': {source}")]
    Io {
        /// Path of the artifact that could not be read.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The artifact was not valid JSON.
    #[error("failed to parse artifact: {0}")]
    Parse(#[from] serde_json::Error),

    /// The artifact was written for another format version.
    #[error("artifact version {got} unsupported, expected {expected}")]
    Version {
        /// Version this crate reads.
        expected: u32,
        /// Version found in the artifact.
        got: u32,
    },

    /// The artifact parsed but violated a structural invariant.
    #[error("malformed artifact '{what}': {reason}")]
    Malformed {
        /// Which artifact or entry is at fault.
        what: String,
        /// Description of the violated invariant.
        reason: String,
    },
}

impl ModelError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        ModelError::Io { path: path.into(), source }
    }

    pub(crate) fn malformed(what: impl Into<String>, reason: impl Into<String>) -> Self {
        ModelError::Malformed { what: what.into(), reason: reason.into() }
    }
}

/// One maqam's reference record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MaqamProfile {
    /// Maqam name, e.g. "Rast".
    pub name: String,
    /// Characteristic scale-degree bins relative to the rukooz, in `[0, 36)`.
    pub scale_degrees: Vec<usize>,
    /// Row-stochastic 36x36 transition matrix over rukooz-relative bins.
    pub transitions: Vec<Vec<f32>>,
}

impl MaqamProfile {
    /// Transition probability from bin `from` to bin `to`.
    pub fn transition(&self, from: usize, to: usize) -> f32 {
        self.transitions[from][to]
    }

    fn validate(&self) -> Result<(), ModelError> {
        let fail = |reason: String| Err(ModelError::malformed(self.name.as_str(), reason));
        if self.name.is_empty() {
            return Err(ModelError::malformed("profile", "empty maqam name".to_string()));
        }
        if self.scale_degrees.is_empty() {
            return fail("no scale degrees".to_string());
        }
        if let Some(&d) = self.scale_degrees.iter().find(|&&d| d >= BINS) {
            return fail(format!("scale degree {d} out of range"));
        }
        if self.transitions.len() != BINS {
            return fail(format!("{} transition rows, expected {BINS}", self.transitions.len()));
        }
        for (i, row) in self.transitions.iter().enumerate() {
            if row.len() != BINS {
                return fail(format!("row {i} has {} columns, expected {BINS}", row.len()));
            }
            if row.iter().any(|p| !p.is_finite() || *p < 0.0) {
                return fail(format!("row {i} contains negative or non-finite entries"));
            }
            let sum: f32 = row.iter().sum();
            if (sum - 1.0).abs() > 1e-3 {
                return fail(format!("row {i} sums to {sum}, expected 1"));
            }
        }
        Ok(())
    }
}

/// On-disk artifact: a version tag and the profile list.
#[derive(Serialize, Deserialize)]
struct ProfileArtifact {
    version: u32,
    profiles: Vec<MaqamProfile>,
}

/// The loaded, immutable maqam catalog, keyed by name.
///
/// Iteration order is the sorted name order; the MLP feature layout
/// depends on it, so it must never vary between runs.
#[derive(Debug, Clone)]
pub struct ProfileSet {
    profiles: BTreeMap<String, MaqamProfile>,
}

impl ProfileSet {
    /// Load and validate a profile artifact from a reader.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, ModelError> {
        let artifact: ProfileArtifact = serde_json::from_reader(reader)?;
        if artifact.version != PROFILE_ARTIFACT_VERSION {
            return Err(ModelError::Version {
                expected: PROFILE_ARTIFACT_VERSION,
                got: artifact.version,
            });
        }
        if artifact.profiles.is_empty() {
            return Err(ModelError::malformed("profile artifact", "no profiles".to_string()));
        }
        let mut profiles = BTreeMap::new();
        for profile in artifact.profiles {
            profile.validate()?;
            if profiles.insert(profile.name.clone(), profile).is_some() {
                return Err(ModelError::malformed(
                    "profile artifact",
                    "duplicate maqam name".to_string(),
                ));
            }
        }
        info!(count = profiles.len(), "loaded maqam profiles");
        Ok(ProfileSet { profiles })
    }

    /// Load and validate a profile artifact from a file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ModelError::io(path, e))?;
        Self::from_reader(BufReader::new(file))
    }

    /// Serialize the catalog as a versioned artifact.
    pub fn to_writer<W: Write>(&self, writer: W) -> Result<(), ModelError> {
        let artifact = ProfileArtifact {
            version: PROFILE_ARTIFACT_VERSION,
            profiles: self.profiles.values().cloned().collect(),
        };
        serde_json::to_writer(writer, &artifact)?;
        Ok(())
    }

    /// Serialize the catalog as a versioned artifact file.
    pub fn to_path(&self, path: impl AsRef<Path>) -> Result<(), ModelError> {
        let path = path.as_ref();
        let file = File::create(path).map_err(|e| ModelError::io(path, e))?;
        self.to_writer(BufWriter::new(file))
    }

    /// The built-in theoretical catalog: nine maqamat whose transition
    /// matrices are generated from the classical jins interval tables
    /// (stepwise motion weighted over leaps, with a resolving pull toward
    /// the rukooz).
    pub fn theoretical() -> Self {
        let mut profiles = BTreeMap::new();
        for &(name, jins1, jins2, jins2_root) in MAQAM_STRUCTURE {
            let mut degrees: Vec<usize> = jins_intervals(jins1).to_vec();
            degrees.extend(jins_intervals(jins2).iter().map(|d| (d + jins2_root) % BINS));
            degrees.sort_unstable();
            degrees.dedup();

            let profile = MaqamProfile {
                name: name.to_string(),
                transitions: theoretical_transitions(&degrees),
                scale_degrees: degrees,
            };
            debug_assert!(profile.validate().is_ok());
            profiles.insert(profile.name.clone(), profile);
        }
        ProfileSet { profiles }
    }

    /// Look up a profile by maqam name.
    pub fn get(&self, name: &str) -> Option<&MaqamProfile> {
        self.profiles.get(name)
    }

    /// Maqam names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.profiles.keys().map(String::as_str).collect()
    }

    /// Iterate profiles in sorted name order.
    pub fn iter(&self) -> impl Iterator<Item = &MaqamProfile> {
        self.profiles.values()
    }

    /// Number of maqamat in the catalog.
    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    /// Whether the catalog is empty.
    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

/// Jins interval tables: tetrachord/pentachord bin offsets from the jins
/// root at sixth-tone resolution (3 bins per semitone).
fn jins_intervals(jins: Jins) -> [usize; 4] {
    match jins {
        Jins::Ajam => [0, 6, 12, 15],
        Jins::Bayati => [0, 5, 9, 15],
        Jins::Hijaz => [0, 3, 12, 15],
        Jins::Kurd => [0, 3, 9, 15],
        Jins::Nahawand => [0, 6, 9, 15],
        Jins::Rast => [0, 6, 10, 15],
        Jins::Saba => [0, 5, 9, 12],
        Jins::Sikah => [0, 4, 10, 15],
    }
}

/// The ajnas used by the built-in catalog.
#[derive(Debug, Copy, Clone)]
enum Jins {
    Ajam,
    Bayati,
    Hijaz,
    Kurd,
    Nahawand,
    Rast,
    Saba,
    Sikah,
}

/// Maqam structures: lower jins on the rukooz plus an upper jins rooted a
/// fourth, fifth, or diminished fourth above.
const MAQAM_STRUCTURE: &[(&str, Jins, Jins, usize)] = &[
    ("Ajam", Jins::Ajam, Jins::Ajam, 21),
    ("Bayati", Jins::Bayati, Jins::Nahawand, 15),
    ("Hijaz", Jins::Hijaz, Jins::Rast, 15),
    ("Kurd", Jins::Kurd, Jins::Nahawand, 15),
    ("Nahawand", Jins::Nahawand, Jins::Hijaz, 21),
    ("Rast", Jins::Rast, Jins::Rast, 21),
    ("Saba", Jins::Saba, Jins::Hijaz, 12),
    ("Sikah", Jins::Sikah, Jins::Rast, 15),
    ("Suznak", Jins::Rast, Jins::Hijaz, 21),
];

/// Build a row-stochastic matrix from a scale-degree set. Adjacent degrees
/// (cyclically through the octave) carry the bulk of the mass, skips of one
/// degree less, and every degree keeps a resolving transition to the
/// rukooz.
fn theoretical_transitions(degrees: &[usize]) -> Vec<Vec<f32>> {
    let n = degrees.len();
    let mut counts = vec![vec![SMOOTHING; BINS]; BINS];

    for i in 0..n {
        let step = degrees[(i + 1) % n];
        counts[degrees[i]][step] += 3.0;
        counts[step][degrees[i]] += 3.0;

        let leap = degrees[(i + 2) % n];
        counts[degrees[i]][leap] += 1.0;
        counts[leap][degrees[i]] += 1.0;
    }
    for &d in degrees.iter().skip(1) {
        counts[d][degrees[0]] += 0.5;
    }

    for row in &mut counts {
        let sum: f32 = row.iter().sum();
        for p in row.iter_mut() {
            *p /= sum;
        }
    }
    counts
}
