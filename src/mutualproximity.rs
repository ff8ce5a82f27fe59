//! Mutual Proximity normalization.
//!
//! Rescales raw method distances into `[0, 1)` by modeling, for every
//! registered track, the distribution of its distances to a fixed set
//! of reference tracks. The normalized value is the complement of the
//! joint probability that seed and candidate are mutually among each
//! other's nearest neighbors, which counteracts hubness in the raw
//! distance space.

use crate::idpool::PoolObserver;
use crate::method::Track;
use log::trace;
use std::f64::consts::SQRT_2;

/// Per-track distance statistics against the reference set.
#[derive(Clone, Copy, Default)]
pub(crate) struct NormFact {
    pub mu: f32,
    pub std: f32,
}

/// Reference tracks plus the per-position `(mu, sigma)` array kept in
/// lockstep with an ordered id pool.
#[derive(Default)]
pub(crate) struct MutualProximity {
    norm_tracks: Vec<Track>,
    norm_facts: Vec<NormFact>,
}

impl MutualProximity {
    pub fn new() -> Self {
        MutualProximity::default()
    }

    /// Replace the reference tracks with copies of `tracks`.
    ///
    /// Already-computed per-track statistics are not touched; callers
    /// must re-register previously added tracks.
    pub fn set_normtracks(&mut self, tracks: &[Track]) {
        trace!("mutual proximity: caching {} reference tracks", tracks.len());
        self.norm_tracks = tracks.to_vec();
    }

    pub fn normtracks(&self) -> &[Track] {
        &self.norm_tracks
    }

    pub fn normfacts_len(&self) -> usize {
        self.norm_facts.len()
    }

    /// Grow the statistics array by `count` default entries.
    pub fn append_normfacts(&mut self, count: usize) {
        self.norm_facts
            .resize(self.norm_facts.len() + count, NormFact::default());
    }

    /// Compute and store the statistics of the raw distances `sims`
    /// at `position`.
    pub fn set_normfacts(&mut self, position: usize, sims: &[f32]) {
        let mu = sims.iter().map(|&x| x as f64).sum::<f64>() / sims.len() as f64;
        let var = sims
            .iter()
            .map(|&x| {
                let centered = x as f64 - mu;
                centered * centered
            })
            .sum::<f64>()
            / (sims.len() as f64 - 1.);
        self.set_normfacts_raw(position, mu as f32, var.sqrt() as f32);
    }

    /// Store precomputed statistics (used when deserializing).
    pub fn set_normfacts_raw(&mut self, position: usize, mu: f32, std: f32) {
        if position >= self.norm_facts.len() {
            self.norm_facts.resize(position + 1, NormFact::default());
        }
        self.norm_facts[position] = NormFact { mu, std };
    }

    pub fn normfacts(&self, position: usize) -> NormFact {
        self.norm_facts[position]
    }

    pub fn trim_normfacts(&mut self, count: usize) {
        let len = self.norm_facts.len() - count;
        self.norm_facts.truncate(len);
    }

    /// Normalize raw distances in place.
    ///
    /// `positions` are the ordered-pool positions of the candidates,
    /// aligned with `sims`; the seed position must be valid. A
    /// candidate equal to the seed gets distance `0`; NaN distances
    /// are left untouched.
    pub fn normalize(
        &self,
        seed_position: Option<usize>,
        positions: &[Option<usize>],
        sims: &mut [f32],
    ) -> Result<(), ()> {
        let seed = match seed_position {
            Some(p) if p < self.norm_facts.len() => p,
            _ => return Err(()),
        };
        let seed_facts = self.norm_facts[seed];
        for (pos, sim) in positions.iter().zip(sims.iter_mut()) {
            let pos = match pos {
                Some(p) if *p < self.norm_facts.len() => *p,
                _ => return Err(()),
            };
            if pos == seed {
                *sim = 0.;
                continue;
            }

            let d = *sim;
            if d.is_nan() {
                continue;
            }

            let facts = self.norm_facts[pos];
            let p1 = 1. - normcdf((d as f64 - seed_facts.mu as f64) / seed_facts.std as f64);
            let p2 = 1. - normcdf((d as f64 - facts.mu as f64) / facts.std as f64);
            *sim = (1. - p1 * p2) as f32;
        }
        Ok(())
    }
}

impl PoolObserver for MutualProximity {
    fn swapped_positions(&mut self, pos_a: usize, pos_b: usize) {
        self.norm_facts.swap(pos_a, pos_b);
    }
}

/// Standard normal CDF via the Abramowitz & Stegun 7.1.26 polynomial
/// approximation of the error function.
fn normcdf(x: f64) -> f64 {
    const A1: f64 = 0.254829592;
    const A2: f64 = -0.284496736;
    const A3: f64 = 1.421413741;
    const A4: f64 = -1.453152027;
    const A5: f64 = 1.061405429;
    const P: f64 = 0.3275911;

    let sign = if x < 0. { -1. } else { 1. };
    let x = x.abs() / SQRT_2;

    let t = 1. / (1. + P * x);
    let y = 1. - ((((A5 * t + A4) * t + A3) * t + A2) * t + A1) * t * (-x * x).exp();

    0.5 * (1. + sign * y)
}
