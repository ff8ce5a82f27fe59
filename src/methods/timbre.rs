//! The timbre similarity method.
//!
//! Improves on the basic Mandel-Ellis measure: a single Gaussian over
//! 25 MFCCs per track, compared with the Jensen-Shannon divergence,
//! and rescaled with Mutual Proximity against a memoized music-style
//! sample. Track ids live in an ordered pool whose position swaps keep
//! the MP statistics array aligned.

use byteorder::{ByteOrder, NativeEndian};
use log::trace;
use rand::SeedableRng;
use rand_pcg::Pcg64;
use crate::gaussian::{GaussianScratch, GaussianStatistics, JsGaussian};
use crate::idpool::OrderedIdPool;
use crate::melspectrum::MelFilterbank;
use crate::method::{Track, TrackLayout};
use crate::mfcc::Mfcc;
use crate::mutualproximity::MutualProximity;
use crate::powerspectrum::{hann, PowerSpectrum};
use crate::{Error, Result, TrackId, SAMPLE_RATE};

const WINDOW_SIZE: usize = 1024;
const HOP: f32 = 0.5;
const MEL_BINS: usize = 36;
const MFCC_BINS: usize = 25;
const MAX_PCM_LENGTH: usize = 60 * SAMPLE_RATE as usize;

/// At most this many tracks are memoized as MP references.
const MAX_STYLE_TRACKS: usize = 1000;
/// Fixed seed so style capture is reproducible across runs.
const STYLE_SAMPLE_SEED: u64 = 22050;

pub(crate) struct Timbre {
    layout: TrackLayout,
    track_mu: usize,
    track_covar: usize,
    track_logdet: usize,

    ps: PowerSpectrum,
    mel: MelFilterbank,
    mfccs: Mfcc,
    gs: GaussianStatistics,
    mp: MutualProximity,
    idpool: OrderedIdPool,
}

impl Timbre {
    pub fn new() -> Self {
        let gs = GaussianStatistics::new(MFCC_BINS);
        let mut layout = TrackLayout::new();
        let track_mu = layout.add_field("gaussian.mu", gs.dim());
        let track_covar = layout.add_field("gaussian.covar", gs.covar_elems());
        let track_logdet = layout.add_field("gaussian.covar_logdet", 1);

        Timbre {
            layout,
            track_mu,
            track_covar,
            track_logdet,
            ps: PowerSpectrum::new(hann(WINDOW_SIZE), HOP),
            mel: MelFilterbank::new(WINDOW_SIZE / 2 + 1, MEL_BINS, SAMPLE_RATE),
            mfccs: Mfcc::new(MEL_BINS, MFCC_BINS),
            gs,
            mp: MutualProximity::new(),
            idpool: OrderedIdPool::new(),
        }
    }

    pub fn about(&self) -> &'static str {
        "A timbre-only music similarity measure building on the basic\n\
         Mandel-Ellis approach: a single Gaussian is fitted to 25 MFCCs\n\
         per song and tracks are compared with the Jensen-Shannon\n\
         divergence. The raw divergences are rescaled with Mutual\n\
         Proximity (D. Schnitzer et al.: Using mutual proximity to\n\
         improve content-based audio similarity, ISMIR 2011), which\n\
         makes them comparable across seed tracks and counteracts\n\
         hubness."
    }

    pub fn layout(&self) -> &TrackLayout {
        &self.layout
    }

    fn gaussian<'a>(&self, track: &'a Track) -> JsGaussian<'a> {
        JsGaussian {
            mu: &track.0[self.track_mu..self.track_mu + self.gs.dim()],
            covar: &track.0[self.track_covar..self.track_covar + self.gs.covar_elems()],
            covar_logdet: track.0[self.track_logdet],
        }
    }

    pub fn analyze_track(&self, pcm: &[f32], track: &mut Track) -> Result<()> {
        trace!("timbre analysis started, samples={}", pcm.len());

        // central excerpt of at most 60 seconds
        let start = pcm.len().saturating_sub(MAX_PCM_LENGTH) / 2;
        let excerpt = &pcm[start..(start + MAX_PCM_LENGTH).min(pcm.len())];

        let power_spectrum = self.ps.from_pcm(excerpt);
        let mel_spectrum = self.mel.from_powerspectrum(&power_spectrum);
        let mfcc_representation = self.mfccs.from_melspectrum(&mel_spectrum);

        let estimate = self
            .gs
            .estimate_gaussian(&mfcc_representation, false, true)
            .ok_or_else(|| {
                Error::EstimationFailed("gaussian model estimation failed".into())
            })?;

        track.0[self.track_mu..self.track_mu + self.gs.dim()].copy_from_slice(&estimate.mu);
        track.0[self.track_covar..self.track_covar + self.gs.covar_elems()]
            .copy_from_slice(&estimate.covar);
        track.0[self.track_logdet] = estimate
            .covar_logdet
            .ok_or_else(|| Error::EstimationFailed("log-determinant unavailable".into()))?;

        trace!("timbre analysis finished");
        Ok(())
    }

    /// Jensen-Shannon divergences without MP normalization.
    fn similarity_raw(&self, seed: &Track, tracks: &[Track], out: &mut [f32]) {
        let g0 = self.gaussian(seed);
        let mut tmp = GaussianScratch::new(self.gs.dim());
        for (track, slot) in tracks.iter().zip(out.iter_mut()) {
            let gi = self.gaussian(track);
            *slot = self.gs.jensenshannon(&g0, &gi, &mut tmp);
        }
    }

    pub fn similarity(
        &self,
        seed: &Track,
        seed_id: TrackId,
        tracks: &[Track],
        ids: &[TrackId],
        out: &mut [f32],
    ) -> Result<()> {
        if tracks.is_empty() {
            return Err(Error::InvalidArgument("empty similarity batch".into()));
        }
        self.similarity_raw(seed, tracks, out);

        let seed_position = self.idpool.position_of(seed_id);
        let positions: Vec<Option<usize>> =
            ids.iter().map(|&id| self.idpool.position_of(id)).collect();
        self.mp
            .normalize(seed_position, &positions, out)
            .map_err(|_| Error::InvalidArgument("unregistered track id in query".into()))
    }

    pub fn set_music_style(&mut self, tracks: &[Track]) -> Result<()> {
        trace!("timbre: initializing mutual proximity");
        if tracks.len() > MAX_STYLE_TRACKS {
            let mut rng = Pcg64::seed_from_u64(STYLE_SAMPLE_SEED);
            let sample: Vec<Track> =
                rand::seq::index::sample(&mut rng, tracks.len(), MAX_STYLE_TRACKS)
                    .iter()
                    .map(|i| tracks[i].clone())
                    .collect();
            self.mp.set_normtracks(&sample);
        } else {
            self.mp.set_normtracks(tracks);
        }
        Ok(())
    }

    pub fn add_tracks(
        &mut self,
        tracks: &[Track],
        ids: &mut [TrackId],
        generate_ids: bool,
    ) -> Result<()> {
        if self.mp.normtracks().is_empty() {
            return Err(Error::NotInitialized(
                "set_music_style must be called before adding tracks".into(),
            ));
        }
        let num_new = if generate_ids {
            self.idpool.generate_ids(ids);
            ids.len()
        } else {
            self.idpool.add_ids(ids, &mut self.mp)
        };

        self.mp.append_normfacts(num_new);
        let position = self.idpool.size() - ids.len();
        let mut sims = vec![0f32; self.mp.normtracks().len()];
        for (i, track) in tracks.iter().enumerate() {
            self.similarity_raw(track, self.mp.normtracks(), &mut sims);
            self.mp.set_normfacts(position + i, &sims);
        }
        Ok(())
    }

    pub fn remove_tracks(&mut self, ids: &[TrackId]) {
        let known = self.idpool.move_to_end(ids, &mut self.mp);
        self.mp.trim_normfacts(known);
        self.idpool.remove_last(known);
    }

    pub fn track_count(&self) -> usize {
        self.idpool.size()
    }

    pub fn max_track_id(&self) -> TrackId {
        self.idpool.max_seen()
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.idpool.id_list().to_vec()
    }

    pub fn metadata_size(&self) -> usize {
        3 * std::mem::size_of::<i32>()
            + self.mp.normtracks().len() * self.layout.size() * std::mem::size_of::<f32>()
    }

    pub fn serialize_metadata(&self) -> Vec<u8> {
        let mut buffer = vec![0; self.metadata_size()];
        NativeEndian::write_i32(&mut buffer[0..4], self.idpool.size() as i32);
        NativeEndian::write_i32(&mut buffer[4..8], self.idpool.max_seen());
        NativeEndian::write_i32(&mut buffer[8..12], self.mp.normtracks().len() as i32);
        let mut offset = 12;
        for track in self.mp.normtracks() {
            for &value in &track.0 {
                NativeEndian::write_f32(&mut buffer[offset..offset + 4], value);
                offset += 4;
            }
        }
        buffer
    }

    pub fn deserialize_metadata(&mut self, buffer: &[u8]) -> Result<usize> {
        if buffer.len() < 12 {
            return Err(Error::FormatMismatch("truncated metadata block".into()));
        }
        let expected_tracks = NativeEndian::read_i32(&buffer[0..4]);
        let max_seen = NativeEndian::read_i32(&buffer[4..8]);
        let num_refs = NativeEndian::read_i32(&buffer[8..12]);
        if expected_tracks < 0 || num_refs < 0 {
            return Err(Error::FormatMismatch("negative counts in metadata".into()));
        }

        // an add/remove cycle registers max_seen without keeping the id
        self.idpool.add_ids(&[max_seen], &mut self.mp);
        self.idpool.remove_ids(&[max_seen], &mut self.mp);

        let track_size = self.layout.size();
        let refs_bytes = num_refs as usize * track_size * std::mem::size_of::<f32>();
        if buffer.len() < 12 + refs_bytes {
            return Err(Error::FormatMismatch("truncated reference tracks".into()));
        }
        let mut refs = Vec::with_capacity(num_refs as usize);
        let mut offset = 12;
        for _ in 0..num_refs {
            let mut track = self.layout.alloc();
            for value in track.0.iter_mut() {
                *value = NativeEndian::read_f32(&buffer[offset..offset + 4]);
                offset += 4;
            }
            refs.push(track);
        }
        self.mp.set_normtracks(&refs);

        // pre-grow the statistics array to the declared track count
        self.mp.append_normfacts(expected_tracks as usize);
        Ok(expected_tracks as usize)
    }

    pub fn trackdata_entry_size(&self) -> usize {
        std::mem::size_of::<TrackId>() + 2 * std::mem::size_of::<f32>()
    }

    pub fn serialize_trackdata(&self, num_tracks: usize, skip_tracks: usize) -> Result<Vec<u8>> {
        if num_tracks + skip_tracks > self.idpool.size() {
            return Err(Error::InvalidArgument(
                "trackdata range exceeds registered tracks".into(),
            ));
        }
        let entry = self.trackdata_entry_size();
        let mut buffer = vec![0; num_tracks * entry];
        for i in 0..num_tracks {
            let position = skip_tracks + i;
            let facts = self.mp.normfacts(position);
            let base = i * entry;
            NativeEndian::write_i32(&mut buffer[base..base + 4], self.idpool.id_at(position));
            NativeEndian::write_f32(&mut buffer[base + 4..base + 8], facts.mu);
            NativeEndian::write_f32(&mut buffer[base + 8..base + 12], facts.std);
        }
        Ok(buffer)
    }

    pub fn deserialize_trackdata(&mut self, buffer: &[u8], num_tracks: usize) -> Result<usize> {
        let entry = self.trackdata_entry_size();
        if buffer.len() < num_tracks * entry {
            return Err(Error::FormatMismatch("truncated trackdata block".into()));
        }
        let had_tracks = self.idpool.size();
        for i in 0..num_tracks {
            let base = i * entry;
            let id = NativeEndian::read_i32(&buffer[base..base + 4]);
            let mu = NativeEndian::read_f32(&buffer[base + 4..base + 8]);
            let std = NativeEndian::read_f32(&buffer[base + 8..base + 12]);
            self.idpool.add_ids(&[id], &mut self.mp);
            self.mp.set_normfacts_raw(had_tracks + i, mu, std);
        }
        Ok(num_tracks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_track_layout() {
        let method = Timbre::new();
        // mu (25) + covar (325) + logdet (1)
        assert_eq!(method.layout().size(), 351);
        let fields = method.layout().fields();
        assert_eq!(fields[0], ("gaussian.mu".to_string(), 25));
        assert_eq!(fields[1], ("gaussian.covar".to_string(), 325));
        assert_eq!(fields[2], ("gaussian.covar_logdet".to_string(), 1));
    }

    #[test]
    fn test_add_requires_music_style() {
        let mut method = Timbre::new();
        let mut ids = [0; 1];
        let tracks = vec![method.layout().alloc()];
        assert!(matches!(
            method.add_tracks(&tracks, &mut ids, true),
            Err(Error::NotInitialized(_))
        ));
    }

    #[test]
    fn test_style_subsample_caps_references() {
        let mut method = Timbre::new();
        let tracks = vec![method.layout().alloc(); MAX_STYLE_TRACKS + 200];
        method.set_music_style(&tracks).unwrap();
        assert_eq!(method.mp.normtracks().len(), MAX_STYLE_TRACKS);

        let small = vec![method.layout().alloc(); 10];
        method.set_music_style(&small).unwrap();
        assert_eq!(method.mp.normtracks().len(), 10);
    }
}
