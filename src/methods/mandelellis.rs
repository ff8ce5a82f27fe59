//! The Mandel-Ellis similarity method.
//!
//! The most basic timbre measure: a single Gaussian over 20 MFCCs per
//! track, compared with the symmetrized Kullback-Leibler divergence.
//! No distance normalization and no neighbor index; track ids live in
//! an unordered pool.

use byteorder::{ByteOrder, NativeEndian};
use log::trace;
use crate::gaussian::{GaussianScratch, GaussianStatistics, KlGaussian};
use crate::idpool::UnorderedIdPool;
use crate::melspectrum::MelFilterbank;
use crate::method::{Track, TrackLayout};
use crate::mfcc::Mfcc;
use crate::powerspectrum::{hann, PowerSpectrum};
use crate::{Error, Result, TrackId, SAMPLE_RATE};

const WINDOW_SIZE: usize = 1024;
const HOP: f32 = 0.5;
const MEL_BINS: usize = 36;
const MFCC_BINS: usize = 20;
const MAX_PCM_LENGTH: usize = 60 * SAMPLE_RATE as usize;

pub(crate) struct MandelEllis {
    layout: TrackLayout,
    track_mu: usize,
    track_covar: usize,
    track_covar_inverse: usize,

    ps: PowerSpectrum,
    mel: MelFilterbank,
    mfccs: Mfcc,
    gs: GaussianStatistics,
    idpool: UnorderedIdPool,
}

impl MandelEllis {
    pub fn new() -> Self {
        let gs = GaussianStatistics::new(MFCC_BINS);
        let mut layout = TrackLayout::new();
        let track_mu = layout.add_field("gaussian.mu", gs.dim());
        let track_covar = layout.add_field("gaussian.covar", gs.covar_elems());
        let track_covar_inverse = layout.add_field("gaussian.covar_inverse", gs.covar_elems());

        MandelEllis {
            layout,
            track_mu,
            track_covar,
            track_covar_inverse,
            ps: PowerSpectrum::new(hann(WINDOW_SIZE), HOP),
            mel: MelFilterbank::new(WINDOW_SIZE / 2 + 1, MEL_BINS, SAMPLE_RATE),
            mfccs: Mfcc::new(MEL_BINS, MFCC_BINS),
            gs,
            idpool: UnorderedIdPool::new(),
        }
    }

    pub fn about(&self) -> &'static str {
        "The most basic timbre music similarity measure, after M. Mandel\n\
         and D. Ellis: Song-level features and support vector machines for\n\
         music classification (ISMIR 2005). A single Gaussian is fitted to\n\
         each song's MFCC frames; two tracks are compared with the\n\
         symmetrized Kullback-Leibler divergence between their Gaussians."
    }

    pub fn layout(&self) -> &TrackLayout {
        &self.layout
    }

    fn gaussian<'a>(&self, track: &'a Track) -> KlGaussian<'a> {
        KlGaussian {
            mu: &track.0[self.track_mu..self.track_mu + self.gs.dim()],
            covar: &track.0[self.track_covar..self.track_covar + self.gs.covar_elems()],
            covar_inverse: &track.0
                [self.track_covar_inverse..self.track_covar_inverse + self.gs.covar_elems()],
        }
    }

    pub fn analyze_track(&self, pcm: &[f32], track: &mut Track) -> Result<()> {
        trace!("mandelellis analysis started, samples={}", pcm.len());

        // central excerpt of at most 60 seconds
        let start = pcm.len().saturating_sub(MAX_PCM_LENGTH) / 2;
        let excerpt = &pcm[start..(start + MAX_PCM_LENGTH).min(pcm.len())];

        let power_spectrum = self.ps.from_pcm(excerpt);
        let mel_spectrum = self.mel.from_powerspectrum(&power_spectrum);
        let mfcc_representation = self.mfccs.from_melspectrum(&mel_spectrum);

        let estimate = self
            .gs
            .estimate_gaussian(&mfcc_representation, true, false)
            .ok_or_else(|| {
                Error::EstimationFailed("gaussian model estimation failed".into())
            })?;

        track.0[self.track_mu..self.track_mu + self.gs.dim()].copy_from_slice(&estimate.mu);
        track.0[self.track_covar..self.track_covar + self.gs.covar_elems()]
            .copy_from_slice(&estimate.covar);
        let inverse = estimate
            .covar_inverse
            .ok_or_else(|| Error::EstimationFailed("covariance inversion failed".into()))?;
        track.0[self.track_covar_inverse..self.track_covar_inverse + self.gs.covar_elems()]
            .copy_from_slice(&inverse);

        trace!("mandelellis analysis finished");
        Ok(())
    }

    pub fn similarity(
        &self,
        seed: &Track,
        _seed_id: TrackId,
        tracks: &[Track],
        _ids: &[TrackId],
        out: &mut [f32],
    ) -> Result<()> {
        if tracks.is_empty() {
            return Err(Error::InvalidArgument("empty similarity batch".into()));
        }
        let g0 = self.gaussian(seed);
        let mut tmp = GaussianScratch::new(self.gs.dim());
        for (track, slot) in tracks.iter().zip(out.iter_mut()) {
            let gi = self.gaussian(track);
            *slot = self.gs.symmetric_kullbackleibler(&g0, &gi, &mut tmp);
        }
        Ok(())
    }

    pub fn set_music_style(&mut self, _tracks: &[Track]) -> Result<()> {
        // no global normalization state for this method
        Ok(())
    }

    pub fn add_tracks(
        &mut self,
        _tracks: &[Track],
        ids: &mut [TrackId],
        generate_ids: bool,
    ) -> Result<()> {
        if generate_ids {
            self.idpool.generate_ids(ids);
        } else {
            self.idpool.add_ids(ids);
        }
        Ok(())
    }

    pub fn remove_tracks(&mut self, ids: &[TrackId]) {
        self.idpool.remove_ids(ids);
    }

    pub fn track_count(&self) -> usize {
        self.idpool.size()
    }

    pub fn max_track_id(&self) -> TrackId {
        self.idpool.max_seen()
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.idpool.ids().collect()
    }

    pub fn metadata_size(&self) -> usize {
        2 * std::mem::size_of::<i32>()
    }

    pub fn serialize_metadata(&self) -> Vec<u8> {
        let mut buffer = vec![0; self.metadata_size()];
        NativeEndian::write_i32(&mut buffer[0..4], self.idpool.size() as i32);
        NativeEndian::write_i32(&mut buffer[4..8], self.idpool.max_seen());
        buffer
    }

    pub fn deserialize_metadata(&mut self, buffer: &[u8]) -> Result<usize> {
        if buffer.len() < self.metadata_size() {
            return Err(Error::FormatMismatch("truncated metadata block".into()));
        }
        let expected_tracks = NativeEndian::read_i32(&buffer[0..4]);
        let max_seen = NativeEndian::read_i32(&buffer[4..8]);
        if expected_tracks < 0 {
            return Err(Error::FormatMismatch("negative track count".into()));
        }
        // an add/remove cycle registers max_seen without keeping the id
        self.idpool.add_ids(&[max_seen]);
        self.idpool.remove_ids(&[max_seen]);
        Ok(expected_tracks as usize)
    }

    pub fn trackdata_entry_size(&self) -> usize {
        std::mem::size_of::<TrackId>()
    }

    pub fn serialize_trackdata(&self, num_tracks: usize, skip_tracks: usize) -> Result<Vec<u8>> {
        if num_tracks + skip_tracks > self.idpool.size() {
            return Err(Error::InvalidArgument(
                "trackdata range exceeds registered tracks".into(),
            ));
        }
        let entry = self.trackdata_entry_size();
        let mut buffer = vec![0; num_tracks * entry];
        for (i, id) in self
            .idpool
            .ids()
            .skip(skip_tracks)
            .take(num_tracks)
            .enumerate()
        {
            NativeEndian::write_i32(&mut buffer[i * entry..(i + 1) * entry], id);
        }
        Ok(buffer)
    }

    pub fn deserialize_trackdata(&mut self, buffer: &[u8], num_tracks: usize) -> Result<usize> {
        let entry = self.trackdata_entry_size();
        if buffer.len() < num_tracks * entry {
            return Err(Error::FormatMismatch("truncated trackdata block".into()));
        }
        for i in 0..num_tracks {
            let id = NativeEndian::read_i32(&buffer[i * entry..(i + 1) * entry]);
            self.idpool.add_ids(&[id]);
        }
        Ok(num_tracks)
    }
}
