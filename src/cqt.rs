//! CQT Feature Extractor
//!
//! Constant-Q analysis at 36 bins per octave, folded into a single-octave
//! pitch-class profile. Sixth-tone resolution is what separates the neutral
//! intervals of maqam scales from their tempered neighbours, which a
//! 12-bin chromagram cannot do.

use std::f32::consts::PI;
use rustfft::num_complex::Complex;
use thiserror::Error;

use crate::BINS;

/// Errors returned by the feature extractor.
#[derive(Debug, Error)]
pub enum FeatureError {
    /// Window received was not of the expected size.
    #[error("expected window of length {expected}, got {got}")]
    InvalidWindowLen {
        /// The expected analysis window length in samples.
        expected: usize,
        /// The actual length of the received window.
        got: usize,
    },

    /// An error occurred during the configuration of the extractor.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Builder for a [`CqtExtractor`].
pub struct CqtExtractorBuilder {
    sample_rate: usize,
    min_freq: f32,
    num_octaves: usize,
    window_len: usize,
}

impl CqtExtractorBuilder {
    /// Start with default parameters:
    /// sample_rate = 22_050, min_freq = 130.81 (C3),
    /// num_octaves = 4, window_len = 8192.
    pub fn new() -> Self {
        CqtExtractorBuilder {
            sample_rate: 22_050,
            min_freq: 130.81,
            num_octaves: 4,
            window_len: 8192,
        }
    }

    /// Set the sampling rate of the audio.
    pub fn sample_rate(mut self, rate: usize) -> Self {
        self.sample_rate = rate;
        self
    }

    /// Set the tuning reference: the frequency of pitch-class bin 0.
    pub fn min_freq(mut self, freq: f32) -> Self {
        self.min_freq = freq;
        self
    }

    /// Set the number of octaves analyzed above the tuning reference.
    pub fn num_octaves(mut self, n: usize) -> Self {
        self.num_octaves = n;
        self
    }

    /// Set the analysis window length in samples.
    pub fn window_len(mut self, len: usize) -> Self {
        self.window_len = len;
        self
    }

    /// Finalize and create the [`CqtExtractor`].
    pub fn build(self) -> Result<CqtExtractor, FeatureError> {
        if self.window_len == 0 {
            return Err(FeatureError::Configuration("window_len cannot be zero".into()));
        }
        if self.min_freq <= 0.0 {
            return Err(FeatureError::Configuration("min_freq must be positive".into()));
        }
        if self.num_octaves == 0 {
            return Err(FeatureError::Configuration("num_octaves cannot be zero".into()));
        }
        let max_freq = self.min_freq * 2f32.powi(self.num_octaves as i32);
        if max_freq >= self.sample_rate as f32 / 2.0 {
            return Err(FeatureError::Configuration(format!(
                "analysis range reaches {max_freq} Hz, beyond Nyquist for {} Hz",
                self.sample_rate
            )));
        }

        // One complex kernel per log-spaced bin. Kernel length follows the
        // constant Q factor, capped at the analysis window.
        let num_bins = BINS * self.num_octaves;
        let q = 1.0 / (2f32.powf(1.0 / BINS as f32) - 1.0);
        let kernels: Vec<CqKernel> = (0..num_bins)
            .map(|k| {
                let freq = self.min_freq * 2f32.powf(k as f32 / BINS as f32);
                let len = ((q * self.sample_rate as f32 / freq).ceil() as usize)
                    .clamp(1, self.window_len);
                let coefficients = (0..len)
                    .map(|n| {
                        let w = 0.5 * (1.0 - (2.0 * PI * n as f32 / len as f32).cos());
                        let phase = 2.0 * PI * freq * n as f32 / self.sample_rate as f32;
                        Complex {
                            re: w * phase.cos() / len as f32,
                            im: -w * phase.sin() / len as f32,
                        }
                    })
                    .collect();
                CqKernel { coefficients }
            })
            .collect();

        Ok(CqtExtractor {
            sample_rate: self.sample_rate,
            min_freq: self.min_freq,
            window_len: self.window_len,
            kernels,
        })
    }
}

impl Default for CqtExtractorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Windowed complex exponential for a single constant-Q bin.
struct CqKernel {
    coefficients: Vec<Complex<f32>>,
}

/// Constant-Q pitch-class extractor.
///
/// The bin-to-frequency mapping is fixed at build time, so every frame of
/// a session is computed against the same grid.
pub struct CqtExtractor {
    sample_rate: usize,
    min_freq: f32,
    window_len: usize,
    kernels: Vec<CqKernel>,
}

impl CqtExtractor {
    /// Start customizing with a builder.
    pub fn builder() -> CqtExtractorBuilder {
        CqtExtractorBuilder::new()
    }

    /// Analysis window length in samples.
    pub fn window_len(&self) -> usize {
        self.window_len
    }

    /// Sampling rate the extractor was built for.
    pub fn sample_rate(&self) -> usize {
        self.sample_rate
    }

    /// Pitch-class bin a frequency falls into on this extractor's grid.
    pub fn pitch_class_of(&self, freq: f32) -> usize {
        let bins = (BINS as f32 * (freq / self.min_freq).log2()).round() as i64;
        bins.rem_euclid(BINS as i64) as usize
    }

    /// Compute one 36-bin energy frame from an analysis window.
    ///
    /// Returns `Err(FeatureError::InvalidWindowLen)` if the window does not
    /// match the configured length. Pure function of its input.
    pub fn extract(&self, window: &[f32]) -> Result<[f32; BINS], FeatureError> {
        if window.len() != self.window_len {
            return Err(FeatureError::InvalidWindowLen {
                expected: self.window_len,
                got: window.len(),
            });
        }

        let mut chroma = [0.0f32; BINS];
        for (k, kernel) in self.kernels.iter().enumerate() {
            let mut sum = Complex { re: 0.0f32, im: 0.0f32 };
            for (n, &coeff) in kernel.coefficients.iter().enumerate() {
                sum += coeff * window[n];
            }
            // Fold octaves: accumulate energy per pitch class.
            chroma[k % BINS] += sum.norm_sqr();
        }
        for c in &mut chroma {
            *c = c.sqrt();
        }
        Ok(chroma)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(sample_rate: f32, freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    #[test]
    fn frame_has_36_non_negative_entries() {
        let cqt = CqtExtractor::builder().build().unwrap();
        let frame = cqt.extract(&sine(22_050.0, 440.0, 8192)).unwrap();
        assert_eq!(frame.len(), BINS);
        assert!(frame.iter().all(|&e| e >= 0.0));
    }

    #[test]
    fn pure_tone_lands_on_its_bin() {
        let cqt = CqtExtractor::builder().build().unwrap();
        // D4, exactly 42 sixth-tone steps above C3: pitch class 6.
        let freq = 130.81 * 2f32.powf(42.0 / 36.0);
        let frame = cqt.extract(&sine(22_050.0, freq, 8192)).unwrap();

        let peak = frame
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| a.partial_cmp(b).unwrap())
            .map(|(i, _)| i)
            .unwrap();
        assert_eq!(peak, 6);
        assert_eq!(cqt.pitch_class_of(freq), 6);
    }

    #[test]
    fn octave_folds_to_same_class() {
        let cqt = CqtExtractor::builder().build().unwrap();
        assert_eq!(cqt.pitch_class_of(261.63), cqt.pitch_class_of(523.25));
    }

    #[test]
    fn rejects_wrong_window_len() {
        let cqt = CqtExtractor::builder().build().unwrap();
        let err = cqt.extract(&[0.0; 100]).unwrap_err();
        assert!(matches!(
            err,
            FeatureError::InvalidWindowLen { expected: 8192, got: 100 }
        ));
    }

    #[test]
    fn rejects_range_beyond_nyquist() {
        let err = CqtExtractor::builder().num_octaves(8).build();
        assert!(err.is_err());
    }
}
