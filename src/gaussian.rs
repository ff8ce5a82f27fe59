//! Single-Gaussian track models and the divergence kernels between
//! them.
//!
//! A track's Gaussian lives inside its flat float block as a mean
//! vector, a packed covariance (row-major upper triangle) and, per
//! method, either the packed inverse covariance or the covariance
//! log-determinant. The kernels below never mutate their inputs; they
//! write intermediates into a caller-provided scratch.

use log::trace;
use ndarray::{Array2, Axis};

/// Gaussian view for the Jensen-Shannon kernel: mean, packed
/// covariance, and the precomputed log-determinant.
pub(crate) struct JsGaussian<'a> {
    pub mu: &'a [f32],
    pub covar: &'a [f32],
    pub covar_logdet: f32,
}

/// Gaussian view for the symmetric Kullback-Leibler kernel: mean,
/// packed covariance and packed inverse covariance.
pub(crate) struct KlGaussian<'a> {
    pub mu: &'a [f32],
    pub covar: &'a [f32],
    pub covar_inverse: &'a [f32],
}

/// Mutable intermediates for one kernel evaluation. Sized once per
/// similarity batch and reused for every candidate.
pub(crate) struct GaussianScratch {
    mu: Vec<f32>,
    covar: Vec<f32>,
}

impl GaussianScratch {
    pub fn new(d: usize) -> Self {
        GaussianScratch {
            mu: vec![0.; d],
            covar: vec![0.; d * (d + 1) / 2],
        }
    }
}

/// A Gaussian estimated from a frame matrix, with the optional
/// derived quantities a method asked for.
pub(crate) struct GaussianEstimate {
    pub mu: Vec<f32>,
    pub covar: Vec<f32>,
    pub covar_inverse: Option<Vec<f32>>,
    pub covar_logdet: Option<f32>,
}

/// Estimator and kernels for Gaussians of a fixed dimension.
pub(crate) struct GaussianStatistics {
    d: usize,
    covar_elems: usize,
}

impl GaussianStatistics {
    pub fn new(gaussian_dim: usize) -> Self {
        GaussianStatistics {
            d: gaussian_dim,
            covar_elems: gaussian_dim * (gaussian_dim + 1) / 2,
        }
    }

    pub fn dim(&self) -> usize {
        self.d
    }

    pub fn covar_elems(&self) -> usize {
        self.covar_elems
    }

    /// Fit a Gaussian to a `D x T` matrix of cepstral frames.
    ///
    /// Returns `None` when there are too few frames (`T <= D`) or the
    /// row count does not match the estimator dimension. The
    /// covariance diagonal gets `1e-4` added so silent input cannot
    /// produce a singular model; this constant is part of the
    /// contract, all downstream distances depend on it.
    pub fn estimate_gaussian(
        &self,
        m: &Array2<f32>,
        want_inverse: bool,
        want_logdet: bool,
    ) -> Option<GaussianEstimate> {
        trace!("estimating gaussian from matrix: {}x{}", m.nrows(), m.ncols());

        if m.ncols() <= self.d {
            trace!("gaussian estimation failed: too few samples ({})", m.ncols());
            return None;
        }
        if m.nrows() != self.d {
            trace!(
                "gaussian estimation failed: dimension mismatch (d={} vs rows={})",
                self.d,
                m.nrows()
            );
            return None;
        }

        let mu = m.mean_axis(Axis(1))?;
        let centered = m - &mu.view().insert_axis(Axis(1));
        let mut covar = centered.dot(&centered.t()) / (m.ncols() as f32 - 1.);
        for i in 0..self.d {
            covar[(i, i)] += 1e-4;
        }

        let mut packed = Vec::with_capacity(self.covar_elems);
        for i in 0..self.d {
            for j in i..self.d {
                packed.push(covar[(i, j)]);
            }
        }

        let mut covar_inverse = None;
        let mut covar_logdet = None;
        if want_inverse || want_logdet {
            let qr = PivotedQr::decompose(&covar);
            if want_inverse {
                let inverse = qr.inverse();
                let mut packed_inv = Vec::with_capacity(self.covar_elems);
                for i in 0..self.d {
                    for j in i..self.d {
                        packed_inv.push(inverse[(i, j)] as f32);
                    }
                }
                covar_inverse = Some(packed_inv);
            }
            if want_logdet {
                covar_logdet = Some(qr.log_abs_determinant() as f32);
            }
        }

        Some(GaussianEstimate {
            mu: mu.to_vec(),
            covar: packed,
            covar_inverse,
            covar_logdet,
        })
    }

    /// Jensen-Shannon-like divergence between two Gaussians.
    ///
    /// Factorizes the merged Gaussian with an in-place Cholesky over
    /// the packed upper triangle. A non-positive pivot yields the `-1`
    /// sentinel the method layer tolerates; NaN or infinite
    /// accumulations clamp to `f32::MAX`.
    pub fn jensenshannon(
        &self,
        g0: &JsGaussian,
        g1: &JsGaussian,
        tmp: &mut GaussianScratch,
    ) -> f32 {
        // identical model buffers compare as distance zero
        if g0.covar.as_ptr() == g1.covar.as_ptr() && g0.mu.as_ptr() == g1.mu.as_ptr() {
            return 0.;
        }
        let d = self.d;
        let mut jsd = -0.25 * (g0.covar_logdet + g1.covar_logdet);

        // merge the means and covariances into the scratch Gaussian
        for i in 0..d {
            tmp.mu[i] = 0.5 * (g0.mu[i] - g1.mu[i]);
        }
        let mut idx_covar = 0;
        for i in 0..d {
            for j in i..d {
                tmp.covar[idx_covar] =
                    0.5 * (g0.covar[idx_covar] + g1.covar[idx_covar]) + tmp.mu[i] * tmp.mu[j];
                idx_covar += 1;
            }
        }

        // in-place Cholesky of the merged matrix, accumulating the
        // log-determinant from the factor diagonal
        let mut idx_ii = 0;
        for i in 0..d {
            let mut idx_k = i;
            for k in 0..i {
                tmp.covar[idx_ii] -= tmp.covar[idx_k] * tmp.covar[idx_k];
                idx_k += d - k - 1;
            }

            if tmp.covar[idx_ii] <= 0. {
                return -1.;
            }
            tmp.covar[idx_ii] = tmp.covar[idx_ii].sqrt();
            jsd += tmp.covar[idx_ii].ln();

            let mut idx_ij = idx_ii;
            for j in i + 1..d {
                idx_ij += 1;

                let mut idx_k = 0;
                for k in 0..i {
                    tmp.covar[idx_ij] -= tmp.covar[idx_k + i] * tmp.covar[idx_k + j];
                    idx_k += d - k - 1;
                }
                tmp.covar[idx_ij] /= tmp.covar[idx_ii];
            }

            idx_ii += d - i;
        }

        if jsd.is_nan() || jsd.is_infinite() {
            return f32::MAX;
        }

        jsd.max(0.).sqrt()
    }

    /// Symmetric Kullback-Leibler divergence between two Gaussians
    /// with precomputed inverse covariances.
    pub fn symmetric_kullbackleibler(
        &self,
        g0: &KlGaussian,
        g1: &KlGaussian,
        tmp: &mut GaussianScratch,
    ) -> f32 {
        if g0.covar.as_ptr() == g1.covar.as_ptr() && g0.mu.as_ptr() == g1.mu.as_ptr() {
            return 0.;
        }
        let d = self.d;
        let mut skld = 0f32;

        // sum of the two inverted covariances
        for i in 0..self.covar_elems {
            tmp.covar[i] = g0.covar_inverse[i] + g1.covar_inverse[i];
        }

        // trace terms; off-diagonal products count twice in the
        // packed representation
        for i in 0..d {
            let idx = i * d - (i * i + i) / 2;

            skld += g0.covar[idx + i] * g1.covar_inverse[idx + i]
                + g1.covar[idx + i] * g0.covar_inverse[idx + i];

            for k in i + 1..d {
                skld += 2. * g0.covar[idx + k] * g1.covar_inverse[idx + k]
                    + 2. * g1.covar[idx + k] * g0.covar_inverse[idx + k];
            }
        }

        // quadratic form of the mean difference against the summed
        // inverses
        for i in 0..d {
            tmp.mu[i] = g0.mu[i] - g1.mu[i];
        }
        for i in 0..d {
            let mut idx = i as isize - d as isize;
            let mut acc = 0f32;

            // column i of the packed triangle: (k, i) for k <= i
            for k in 0..=i {
                idx += (d - k) as isize;
                acc += tmp.covar[idx as usize] * tmp.mu[k];
            }
            // then row i: (i, k) for k > i
            for k in i + 1..d {
                idx += 1;
                acc += tmp.covar[idx as usize] * tmp.mu[k];
            }
            skld += acc * tmp.mu[i];
        }

        if skld.is_nan() || skld.is_infinite() {
            return f32::MAX;
        }

        (skld / 4. - d as f32 / 2.).max(0.)
    }
}

/// Column-pivoted Householder QR in f64, good enough to invert and
/// take log-determinants of diagonally loaded covariance matrices.
struct PivotedQr {
    qr: Array2<f64>,
    taus: Vec<f64>,
    perm: Vec<usize>,
    n: usize,
}

impl PivotedQr {
    fn decompose(a: &Array2<f32>) -> Self {
        let n = a.nrows();
        let mut qr = a.mapv(|x| x as f64);
        let mut taus = vec![0f64; n];
        let mut perm: Vec<usize> = (0..n).collect();

        for k in 0..n {
            // pivot on the column with the largest remaining norm
            let mut best = k;
            let mut best_norm = -1f64;
            for j in k..n {
                let norm: f64 = (k..n).map(|i| qr[(i, j)] * qr[(i, j)]).sum();
                if norm > best_norm {
                    best_norm = norm;
                    best = j;
                }
            }
            if best != k {
                for i in 0..n {
                    qr.swap((i, k), (i, best));
                }
                perm.swap(k, best);
            }

            let norm = best_norm.sqrt();
            if norm == 0. {
                taus[k] = 0.;
                continue;
            }
            let x0 = qr[(k, k)];
            let beta = if x0 > 0. { -norm } else { norm };
            let v0 = x0 - beta;
            for i in k + 1..n {
                qr[(i, k)] /= v0;
            }
            taus[k] = -v0 / beta;
            qr[(k, k)] = beta;

            // apply the reflector to the remaining columns
            for j in k + 1..n {
                let mut s = qr[(k, j)];
                for i in k + 1..n {
                    s += qr[(i, k)] * qr[(i, j)];
                }
                s *= taus[k];
                qr[(k, j)] -= s;
                for i in k + 1..n {
                    let update = s * qr[(i, k)];
                    qr[(i, j)] -= update;
                }
            }
        }

        PivotedQr { qr, taus, perm, n }
    }

    fn log_abs_determinant(&self) -> f64 {
        (0..self.n).map(|i| self.qr[(i, i)].abs().ln()).sum()
    }

    fn inverse(&self) -> Array2<f64> {
        let n = self.n;
        let mut inv = Array2::zeros((n, n));
        let mut y = vec![0f64; n];

        for m in 0..n {
            // y = Q^T e_m, applying the reflectors in factorization order
            for slot in y.iter_mut() {
                *slot = 0.;
            }
            y[m] = 1.;
            for k in 0..n {
                if self.taus[k] == 0. {
                    continue;
                }
                let mut s = y[k];
                for i in k + 1..n {
                    s += self.qr[(i, k)] * y[i];
                }
                s *= self.taus[k];
                y[k] -= s;
                for i in k + 1..n {
                    y[i] -= s * self.qr[(i, k)];
                }
            }

            // back-substitute R z = y
            for i in (0..n).rev() {
                let mut acc = y[i];
                for j in i + 1..n {
                    acc -= self.qr[(i, j)] * y[j];
                }
                y[i] = acc / self.qr[(i, i)];
            }

            // undo the column permutation
            for i in 0..n {
                inv[(self.perm[i], m)] = y[i];
            }
        }
        inv
    }
}
