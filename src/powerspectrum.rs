//! Windowed power-spectrum extraction.
//!
//! Slices mono PCM into half-overlapping Hann-windowed frames and
//! computes the squared FFT magnitude of each frame. This is the first
//! stage of the timbre analysis pipeline.

use log::trace;
use ndarray::{Array1, Array2};
use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};
use std::f32::consts::PI;
use std::sync::Arc;

/// Symmetric Hann window of the given length.
pub(crate) fn hann(window_size: usize) -> Array1<f32> {
    let n = (window_size - 1) as f32;
    Array1::from_shape_fn(window_size, |i| {
        0.5 * (1. - (2. * PI * i as f32 / n).cos())
    })
}

/// Short-time power spectrum of a PCM signal.
///
/// The FFT plan is created once and reused for every frame, so all
/// frames go through numerically identical transforms.
pub(crate) struct PowerSpectrum {
    window: Array1<f32>,
    win_size: usize,
    hop_size: usize,
    fft: Arc<dyn Fft<f32>>,
}

impl PowerSpectrum {
    pub fn new(window: Array1<f32>, hop: f32) -> Self {
        let win_size = window.len();
        let hop_size = (hop * win_size as f32).round() as usize;
        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(win_size);
        PowerSpectrum {
            window,
            win_size,
            hop_size,
            fft,
        }
    }

    /// Number of frequency bins per output column.
    pub fn bins(&self) -> usize {
        self.win_size / 2 + 1
    }

    /// Compute the `(N/2+1) x M` power spectrum of `pcm`.
    ///
    /// Returns an empty matrix if the input is shorter than one window.
    /// The signal is peak-normalized to ~96 dBFS once, over the whole
    /// input, before windowing.
    pub fn from_pcm(&self, pcm: &[f32]) -> Array2<f32> {
        trace!("power spectrum: input samples={}", pcm.len());
        if pcm.len() < self.win_size || self.hop_size > self.win_size {
            return Array2::zeros((0, 0));
        }
        let frames = (pcm.len() - (self.win_size - self.hop_size)) / self.hop_size;
        let freq_bins = self.bins();
        let mut ps = Array2::zeros((freq_bins, frames));

        let peak = pcm.iter().fold(0f32, |acc, &x| acc.max(x.abs()));
        let scale = 10f32.powf(96. / 20.) / peak;

        let mut buffer = vec![Complex::new(0f32, 0f32); self.win_size];
        for i in 0..frames {
            let offset = i * self.hop_size;
            for (j, slot) in buffer.iter_mut().enumerate() {
                *slot = Complex::new(pcm[offset + j] * scale * self.window[j], 0.);
            }
            self.fft.process(&mut buffer);
            for (j, out) in ps.column_mut(i).iter_mut().enumerate() {
                let c = buffer[j];
                *out = c.re * c.re + c.im * c.im;
            }
        }

        trace!("power spectrum: size={}x{}", ps.nrows(), ps.ncols());
        ps
    }
}
