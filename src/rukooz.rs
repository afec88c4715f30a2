//! Rukooz (Tonic) Detector
//!
//! Maqam performances pivot around a tonal centre that is sustained, not
//! merely loud: the rukooz. Each update rescores every pitch-class bin over
//! the whole accumulated chromagram by cumulative energy and by how many
//! frames the bin dominated, and a hysteresis margin keeps the reported bin
//! from flickering between near-equal candidates as chunks arrive.

use serde::Serialize;

use crate::BINS;

/// A rukooz estimate: pitch-class bin and detection confidence.
#[derive(Debug, Copy, Clone, PartialEq, Serialize)]
pub struct RukoozEstimate {
    /// Pitch-class bin in `[0, 36)`, or `-1` while unknown.
    pub bin: i32,
    /// Confidence in `[0, 1]`: the bin's share of combined energy and
    /// dominance over the session so far.
    pub confidence: f32,
}

impl RukoozEstimate {
    /// The estimate before enough audio has been observed.
    pub fn unknown() -> Self {
        RukoozEstimate { bin: -1, confidence: 0.0 }
    }

    /// Whether a rukooz has been committed yet.
    pub fn is_known(&self) -> bool {
        self.bin >= 0
    }
}

/// Incremental rukooz tracker for one session.
pub struct RukoozTracker {
    margin: f32,
    min_frames: usize,
    silence_floor: f32,
    current: RukoozEstimate,
}

impl RukoozTracker {
    /// Create a tracker with margin = 0.02, min_frames = 1,
    /// silence_floor = 1e-4.
    pub fn new() -> Self {
        RukoozTracker {
            margin: 0.02,
            min_frames: 1,
            silence_floor: 1e-4,
            current: RukoozEstimate::unknown(),
        }
    }

    /// Set the confidence margin a challenger bin must clear.
    pub fn with_margin(mut self, margin: f32) -> Self {
        self.margin = margin;
        self
    }

    /// Set the number of active frames required before committing.
    pub fn with_min_frames(mut self, frames: usize) -> Self {
        self.min_frames = frames;
        self
    }

    /// Set the total frame energy below which a frame counts as silent.
    pub fn with_silence_floor(mut self, floor: f32) -> Self {
        self.silence_floor = floor;
        self
    }

    /// The last committed estimate.
    pub fn estimate(&self) -> RukoozEstimate {
        self.current
    }

    /// Rescore the accumulated chromagram and return the (possibly updated)
    /// estimate.
    ///
    /// The incumbent bin is replaced only when the challenger's score on
    /// the same history exceeds the incumbent's by the margin.
    pub fn update(&mut self, chromagram: &[[f32; BINS]]) -> RukoozEstimate {
        let mut energy = [0.0f32; BINS];
        let mut dominant = [0usize; BINS];
        let mut first_dominant = [usize::MAX; BINS];
        let mut active = 0usize;

        for frame in chromagram {
            let total: f32 = frame.iter().sum();
            if total <= self.silence_floor {
                continue;
            }
            let peak = frame
                .iter()
                .enumerate()
                .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
                .map(|(i, _)| i)
                .unwrap();
            for (e, &f) in energy.iter_mut().zip(frame.iter()) {
                *e += f;
            }
            dominant[peak] += 1;
            if first_dominant[peak] == usize::MAX {
                first_dominant[peak] = active;
            }
            active += 1;
        }

        if active < self.min_frames {
            return self.current;
        }

        let total_energy: f32 = energy.iter().sum();
        if total_energy <= 0.0 {
            return self.current;
        }

        let score = |b: usize| -> f32 {
            0.5 * energy[b] / total_energy + 0.5 * dominant[b] as f32 / active as f32
        };

        // Best bin; ties go to the bin that dominated earliest.
        let mut best = 0usize;
        for b in 1..BINS {
            let (sb, sbest) = (score(b), score(best));
            if sb > sbest || (sb == sbest && first_dominant[b] < first_dominant[best]) {
                best = b;
            }
        }
        let challenger = RukoozEstimate { bin: best as i32, confidence: score(best) };

        if !self.current.is_known() {
            self.current = challenger;
        } else if challenger.bin == self.current.bin {
            self.current.confidence = challenger.confidence;
        } else {
            let incumbent = score(self.current.bin as usize);
            if challenger.confidence > incumbent + self.margin {
                self.current = challenger;
            } else {
                self.current.confidence = incumbent;
            }
        }
        self.current
    }
}

impl Default for RukoozTracker {
    fn default() -> Self {
        Self::new()
    }
}
