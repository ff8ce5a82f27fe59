//! Mel-frequency cepstral coefficients.
//!
//! Log-compresses a Mel spectrum and decorrelates it with an
//! orthonormal DCT-II, yielding one cepstral column per input frame.

use log::trace;
use ndarray::Array2;
use std::f32::consts::PI;

pub(crate) struct Mfcc {
    dct: Array2<f32>,
}

impl Mfcc {
    pub fn new(mel_bins: usize, mfcc_bins: usize) -> Self {
        let n = mel_bins as f32;
        let mut dct = Array2::from_shape_fn((mfcc_bins, mel_bins), |(i, j)| {
            (2. / n).sqrt() * (PI * (2 * j + 1) as f32 * i as f32 / (2. * n)).cos()
        });
        // orthonormal DCT-II scaling of the first row
        let scale = 2f32.sqrt() / 2.;
        dct.row_mut(0).mapv_inplace(|x| x * scale);
        Mfcc { dct }
    }

    /// `C . log(1 + mel)`, column-wise.
    pub fn from_melspectrum(&self, mel: &Array2<f32>) -> Array2<f32> {
        trace!("mfcc: input size={}x{}", mel.nrows(), mel.ncols());
        self.dct.dot(&mel.mapv(|x| (1. + x).ln()))
    }
}
