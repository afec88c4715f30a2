//! Harmonic Source Separator
//!
//! Median-mask harmonic/percussive separation over a short-time Fourier
//! transform. Sustained tonal partials form horizontal ridges in the
//! spectrogram and survive a median filter taken across time; percussive
//! bursts form vertical ridges and survive a median taken across frequency.
//! A soft mask built from the two medians keeps the harmonic part.

use std::{
    f32::consts::PI,
    sync::Arc,
};
use rustfft::{num_complex::Complex, Fft, FftPlanner};
use thiserror::Error;

/// Errors returned while configuring the separator.
#[derive(Debug, Error)]
pub enum SeparatorError {
    /// An error occurred during the configuration of the separator.
    #[error("configuration error: {0}")]
    Configuration(String),
}

/// Builder for a [`HarmonicSeparator`].
pub struct HarmonicSeparatorBuilder {
    fft_len: usize,
    hop_len: usize,
    median_time: usize,
    median_freq: usize,
}

impl HarmonicSeparatorBuilder {
    /// Start with default parameters:
    /// fft_len = 1024, hop_len = 256,
    /// median_time = 17, median_freq = 17.
    pub fn new() -> Self {
        HarmonicSeparatorBuilder {
            fft_len: 1024,
            hop_len: 256,
            median_time: 17,
            median_freq: 17,
        }
    }

    /// Set the STFT frame length.
    pub fn fft_len(mut self, len: usize) -> Self {
        self.fft_len = len;
        self
    }

    /// Set the STFT hop length.
    pub fn hop_len(mut self, len: usize) -> Self {
        self.hop_len = len;
        self
    }

    /// Set the median filter width across time frames (odd).
    pub fn median_time(mut self, width: usize) -> Self {
        self.median_time = width;
        self
    }

    /// Set the median filter width across frequency bins (odd).
    pub fn median_freq(mut self, width: usize) -> Self {
        self.median_freq = width;
        self
    }

    /// Finalize and create the [`HarmonicSeparator`].
    pub fn build(self) -> Result<HarmonicSeparator, SeparatorError> {
        if self.fft_len == 0 || !self.fft_len.is_power_of_two() {
            return Err(SeparatorError::Configuration(
                "fft_len must be a non-zero power of two".into(),
            ));
        }
        if self.hop_len == 0 || self.fft_len % self.hop_len != 0 || self.hop_len >= self.fft_len {
            return Err(SeparatorError::Configuration(
                "hop_len must divide fft_len and be smaller than it".into(),
            ));
        }
        if self.median_time % 2 == 0 || self.median_freq % 2 == 0 {
            return Err(SeparatorError::Configuration(
                "median widths must be odd".into(),
            ));
        }

        let mut planner = FftPlanner::<f32>::new();
        let fft = planner.plan_fft_forward(self.fft_len);
        let ifft = planner.plan_fft_inverse(self.fft_len);

        let window: Vec<f32> = (0..self.fft_len)
            .map(|n| 0.5 * (1.0 - (2.0 * PI * n as f32 / self.fft_len as f32).cos()))
            .collect();

        Ok(HarmonicSeparator {
            fft_len: self.fft_len,
            hop_len: self.hop_len,
            median_time: self.median_time,
            median_freq: self.median_freq,
            fft,
            ifft,
            window,
            scratch: Vec::new(),
        })
    }
}

impl Default for HarmonicSeparatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Median-mask harmonic enhancer for analysis windows.
#[derive(Clone)]
pub struct HarmonicSeparator {
    fft_len: usize,
    hop_len: usize,
    median_time: usize,
    median_freq: usize,
    fft: Arc<dyn Fft<f32>>,
    ifft: Arc<dyn Fft<f32>>,
    window: Vec<f32>,
    scratch: Vec<f32>,
}

impl HarmonicSeparator {
    /// Start customizing with a builder.
    pub fn builder() -> HarmonicSeparatorBuilder {
        HarmonicSeparatorBuilder::new()
    }

    /// Separate one analysis window, returning its harmonic-enhanced copy
    /// of the same length. Windows shorter than a single STFT frame pass
    /// through unchanged. Pure with respect to the input window; no state
    /// is carried between calls.
    pub fn separate(&mut self, input: &[f32]) -> Vec<f32> {
        if input.len() < self.fft_len {
            return input.to_vec();
        }

        let num_frames = (input.len() - self.fft_len) / self.hop_len + 1;
        let half = self.fft_len / 2 + 1;

        // Forward STFT, keeping full complex frames for resynthesis.
        let mut spectra: Vec<Vec<Complex<f32>>> = Vec::with_capacity(num_frames);
        let mut magnitudes: Vec<Vec<f32>> = Vec::with_capacity(num_frames);
        for t in 0..num_frames {
            let start = t * self.hop_len;
            let mut frame: Vec<Complex<f32>> = input[start..start + self.fft_len]
                .iter()
                .zip(self.window.iter())
                .map(|(&s, &w)| Complex { re: s * w, im: 0.0 })
                .collect();
            self.fft.process(&mut frame);
            magnitudes.push(frame[..half].iter().map(|c| c.norm()).collect());
            spectra.push(frame);
        }

        // Per-cell medians: across time (harmonic) and across frequency
        // (percussive), then a soft energy-ratio mask.
        let ht = self.median_time / 2;
        let hf = self.median_freq / 2;
        let mut output = vec![0.0f32; input.len()];
        let mut norm = vec![0.0f32; input.len()];

        for t in 0..num_frames {
            let mut masked = spectra[t].clone();
            for k in 0..half {
                let lo_t = t.saturating_sub(ht);
                let hi_t = (t + ht).min(num_frames - 1);
                self.scratch.clear();
                self.scratch
                    .extend((lo_t..=hi_t).map(|tt| magnitudes[tt][k]));
                let h = median(&mut self.scratch);

                let lo_f = k.saturating_sub(hf);
                let hi_f = (k + hf).min(half - 1);
                self.scratch.clear();
                self.scratch.extend_from_slice(&magnitudes[t][lo_f..=hi_f]);
                let p = median(&mut self.scratch);

                let h2 = h * h;
                let p2 = p * p;
                let mask = if h2 + p2 > 1e-12 { h2 / (h2 + p2) } else { 0.0 };

                masked[k] *= mask;
                // Mirror onto the negative-frequency bin.
                if k != 0 && k != self.fft_len / 2 {
                    masked[self.fft_len - k] *= mask;
                }
            }

            self.ifft.process(&mut masked);
            let start = t * self.hop_len;
            let scale = 1.0 / self.fft_len as f32;
            for (n, c) in masked.iter().enumerate() {
                let w = self.window[n];
                output[start + n] += c.re * scale * w;
                norm[start + n] += w * w;
            }
        }

        // Overlap-add normalization; samples no frame covered keep the
        // original signal.
        for ((out, &n), &orig) in output.iter_mut().zip(norm.iter()).zip(input.iter()) {
            if n > 1e-8 {
                *out /= n;
            } else {
                *out = orig;
            }
        }
        output
    }
}

/// Median of a scratch slice; sorts in place.
fn median(values: &mut [f32]) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    values.sort_unstable_by(|a, b| a.partial_cmp(b).unwrap());
    values[values.len() / 2]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(sample_rate: f32, freq: f32, len: usize) -> Vec<f32> {
        (0..len)
            .map(|i| (2.0 * PI * freq * i as f32 / sample_rate).sin())
            .collect()
    }

    fn rms(signal: &[f32]) -> f32 {
        (signal.iter().map(|x| x * x).sum::<f32>() / signal.len() as f32).sqrt()
    }

    #[test]
    fn sustained_tone_survives() {
        let mut sep = HarmonicSeparator::builder().build().unwrap();
        let input = sine(22_050.0, 440.0, 8192);
        let out = sep.separate(&input);

        assert_eq!(out.len(), input.len());
        // Steady-state region keeps most of the tone's energy.
        let kept = rms(&out[2048..6144]) / rms(&input[2048..6144]);
        assert!(kept > 0.7, "harmonic retention {kept} too low");
    }

    #[test]
    fn click_is_attenuated() {
        let mut sep = HarmonicSeparator::builder().build().unwrap();
        let mut input = vec![0.0f32; 8192];
        for s in input[4096..4160].iter_mut() {
            *s = 1.0;
        }
        let out = sep.separate(&input);

        let kept = rms(&out[4096..4160]) / rms(&input[4096..4160]);
        assert!(kept < 0.5, "percussive retention {kept} too high");
    }

    #[test]
    fn short_window_passes_through() {
        let mut sep = HarmonicSeparator::builder().build().unwrap();
        let input = sine(22_050.0, 440.0, 512);
        assert_eq!(sep.separate(&input), input);
    }

    #[test]
    fn rejects_even_median_width() {
        let err = HarmonicSeparator::builder().median_time(8).build();
        assert!(err.is_err());
    }
}
