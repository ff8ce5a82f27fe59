//! Triangular Mel filterbank.
//!
//! Maps power-spectrum bins onto a perceptual Mel-frequency scale with
//! area-normalized triangular filters. The filterbank is sparse; only
//! the non-zero span of each triangle is stored.

use log::trace;
use ndarray::{Array1, Array2};
use ndarray_stats::QuantileExt;

const MIN_FREQ: f32 = 20.;
const MEL_SCALE: f32 = 1127.01048;

fn hz_to_mel(hz: f32) -> f32 {
    (1. + hz / 700.).ln() * MEL_SCALE
}

/// One triangular filter: weights for a contiguous run of
/// power-spectrum bins starting at `first_bin`.
struct Triangle {
    first_bin: usize,
    weights: Vec<f32>,
}

pub(crate) struct MelFilterbank {
    mel_bins: usize,
    filters: Vec<Triangle>,
}

impl MelFilterbank {
    pub fn new(powerspectrum_bins: usize, mel_bins: usize, sample_rate: u32) -> Self {
        let nyquist = sample_rate as f32 / 2.;

        // frequency of each powerspectrum bin
        let ps_freq = Array1::linspace(0., nyquist, powerspectrum_bins);

        // per-Hz frequency grid and its Mel image
        let grid_points = (nyquist - MIN_FREQ) as usize;
        let freq = Array1::linspace(MIN_FREQ, nyquist, grid_points);
        let mel = freq.mapv(hz_to_mel);
        let mel_max = mel[mel.len() - 1];
        let mel_idx = Array1::linspace(1., mel_max, mel_bins + 2);

        // project equispaced mel anchors back to the Hz grid by
        // nearest mel value
        let nearest_hz = |target: f32| -> f32 {
            let i = (&mel - target).mapv(f32::abs).argmin().unwrap_or(0);
            freq[i]
        };

        let mut filters = Vec::with_capacity(mel_bins);
        for i in 0..mel_bins {
            let left = nearest_hz(mel_idx[i]);
            let center = nearest_hz(mel_idx[i + 1]);
            let right = nearest_hz(mel_idx[i + 2]);
            // area-normalized triangle
            let height = 2. / (right - left);

            let mut first_bin = 0;
            let mut weights = Vec::new();
            for (j, &f) in ps_freq.iter().enumerate() {
                let w = if f > left && f <= center {
                    height * ((f - left) / (center - left))
                } else if f > center && f < right {
                    height * ((right - f) / (right - center))
                } else {
                    continue;
                };
                if weights.is_empty() {
                    first_bin = j;
                }
                weights.push(w);
            }
            filters.push(Triangle { first_bin, weights });
        }

        trace!(
            "mel filterbank: {} filters over {} powerspectrum bins",
            mel_bins,
            powerspectrum_bins
        );
        MelFilterbank { mel_bins, filters }
    }

    /// Apply the filterbank to every column of a power spectrum.
    ///
    /// Filters with empty support yield zero rows; a downstream
    /// `log(1 + x)` keeps those finite.
    pub fn from_powerspectrum(&self, ps: &Array2<f32>) -> Array2<f32> {
        let mut mels = Array2::zeros((self.mel_bins, ps.ncols()));
        for (c, col) in ps.columns().into_iter().enumerate() {
            for (i, tri) in self.filters.iter().enumerate() {
                let mut acc = 0f32;
                for (k, &w) in tri.weights.iter().enumerate() {
                    acc += w * col[tri.first_bin + k];
                }
                mels[(i, c)] = acc;
            }
        }
        trace!("mel spectrum: size={}x{}", mels.nrows(), mels.ncols());
        mels
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_spans() {
        let mel = MelFilterbank::new(513, 36, 22050);
        assert_eq!(mel.filters.len(), 36);
        for tri in &mel.filters {
            assert!(tri.first_bin + tri.weights.len() <= 513);
            assert!(tri.weights.iter().all(|&w| w >= 0.));
        }
        // triangles move upward in frequency
        let starts: Vec<usize> = mel.filters.iter().map(|t| t.first_bin).collect();
        for w in starts.windows(2) {
            assert!(w[0] <= w[1]);
        }
    }

    #[test]
    fn test_non_negative_output() {
        let mel = MelFilterbank::new(513, 36, 22050);
        let ps = Array2::from_shape_fn((513, 4), |(i, j)| ((i * 31 + j * 7) % 17) as f32);
        let out = mel.from_powerspectrum(&ps);
        assert_eq!(out.shape(), &[36, 4]);
        assert!(out.iter().all(|&x| x >= 0.));
    }

    #[test]
    fn test_empty_input() {
        let mel = MelFilterbank::new(513, 36, 22050);
        let out = mel.from_powerspectrum(&Array2::zeros((0, 0)));
        assert_eq!(out.shape(), &[36, 0]);
    }

    #[test]
    fn test_tone_lights_up_few_bins() {
        let mel = MelFilterbank::new(513, 36, 22050);
        // energy in a single powerspectrum bin
        let mut ps = Array2::zeros((513, 1));
        ps[(100, 0)] = 1.;
        let out = mel.from_powerspectrum(&ps);
        let active = out.iter().filter(|&&x| x > 0.).count();
        assert!(active >= 1 && active <= 2);
    }
}
