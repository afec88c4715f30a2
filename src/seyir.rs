//! Seyir Markov Engine
//!
//! Derives the melodic path from the accumulated chromagram and scores it
//! against each maqam's transition model. The path is the per-frame
//! dominant bin with single-frame outliers collapsed and, once the rukooz
//! is known, transposed so the rukooz sits on bin 0, which keeps the
//! transition models key-invariant.

use crate::profile::MaqamProfile;
use crate::rukooz::RukoozEstimate;
use crate::BINS;

/// Floor substituted for zero-probability transitions so log-likelihoods
/// stay finite.
pub const PROB_FLOOR: f32 = 1e-9;

/// Options controlling pitch-bin sequence derivation.
#[derive(Debug, Clone, Copy)]
pub struct SequenceOptions {
    /// Total frame energy below which a frame counts as silent.
    pub silence_floor: f32,
    /// Dominant-bin runs shorter than this many frames are dropped.
    pub min_run: usize,
}

impl Default for SequenceOptions {
    fn default() -> Self {
        SequenceOptions { silence_floor: 1e-4, min_run: 2 }
    }
}

/// Derive the pitch-bin sequence for Markov scoring.
///
/// Active frames contribute their dominant bin; runs shorter than
/// `min_run` frames are discarded as outliers; consecutive repeats merge,
/// so the sequence models note changes. With a known rukooz every bin is
/// rotated so the rukooz maps to 0.
pub fn derive_sequence(
    chromagram: &[[f32; BINS]],
    rukooz: RukoozEstimate,
    opts: &SequenceOptions,
) -> Vec<usize> {
    let mut dominant = Vec::with_capacity(chromagram.len());
    for frame in chromagram {
        let total: f32 = frame.iter().sum();
        if total <= opts.silence_floor {
            continue;
        }
        let peak = frame
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        dominant.push(peak);
    }

    // Run-length pass: drop short runs, merge adjacent repeats.
    let mut sequence: Vec<usize> = Vec::new();
    let mut i = 0;
    while i < dominant.len() {
        let bin = dominant[i];
        let mut j = i + 1;
        while j < dominant.len() && dominant[j] == bin {
            j += 1;
        }
        if j - i >= opts.min_run && sequence.last() != Some(&bin) {
            sequence.push(bin);
        }
        i = j;
    }

    if rukooz.is_known() {
        let r = rukooz.bin as usize;
        for bin in &mut sequence {
            *bin = (*bin + BINS - r) % BINS;
        }
    }
    sequence
}

/// Log-likelihood of a pitch-bin sequence under one maqam's transition
/// model: the sum of `ln P(next | current)` over consecutive pairs, with
/// [`PROB_FLOOR`] substituted for vanishing probabilities.
///
/// Sequences with fewer than two elements carry no transition evidence and
/// score 0 for every profile. Deterministic: identical inputs always
/// reproduce identical scores.
pub fn score(sequence: &[usize], profile: &MaqamProfile) -> f32 {
    sequence
        .windows(2)
        .map(|pair| profile.transition(pair[0], pair[1]).max(PROB_FLOOR).ln())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileSet;

    fn frame_with(bin: usize) -> [f32; BINS] {
        let mut f = [0.001f32; BINS];
        f[bin] = 1.0;
        f
    }

    fn known(bin: i32) -> RukoozEstimate {
        RukoozEstimate { bin, confidence: 1.0 }
    }

    #[test]
    fn single_frame_outliers_are_dropped() {
        let frames = vec![
            frame_with(0),
            frame_with(0),
            frame_with(33), // glitch
            frame_with(6),
            frame_with(6),
        ];
        let seq = derive_sequence(&frames, known(0), &SequenceOptions::default());
        assert_eq!(seq, vec![0, 6]);
    }

    #[test]
    fn repeats_merge_and_silence_is_skipped() {
        let frames = vec![
            frame_with(5),
            frame_with(5),
            [0.0; BINS],
            frame_with(5),
            frame_with(5),
            frame_with(9),
            frame_with(9),
        ];
        let seq = derive_sequence(&frames, known(0), &SequenceOptions::default());
        assert_eq!(seq, vec![5, 9]);
    }

    #[test]
    fn sequence_is_rukooz_relative() {
        let frames = vec![
            frame_with(6),
            frame_with(6),
            frame_with(12),
            frame_with(12),
        ];
        let seq = derive_sequence(&frames, known(6), &SequenceOptions::default());
        assert_eq!(seq, vec![0, 6]);

        // Unknown rukooz leaves bins untransposed.
        let raw = derive_sequence(&frames, RukoozEstimate::unknown(), &SequenceOptions::default());
        assert_eq!(raw, vec![6, 12]);
    }

    #[test]
    fn empty_sequence_scores_zero() {
        let profiles = ProfileSet::theoretical();
        let rast = profiles.get("Rast").unwrap();
        assert_eq!(score(&[], rast), 0.0);
        assert_eq!(score(&[0], rast), 0.0);
    }

    #[test]
    fn scoring_is_deterministic() {
        let profiles = ProfileSet::theoretical();
        let rast = profiles.get("Rast").unwrap();
        let seq = vec![0, 6, 10, 15, 21, 15, 10, 6, 0];
        assert_eq!(score(&seq, rast), score(&seq, rast));
        assert!(score(&seq, rast).is_finite());
    }
}
