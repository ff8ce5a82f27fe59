//! Audio decoding into the analysis input format.
//!
//! The [`Decoder`] trait is the seam between the similarity engine
//! and the audio world: implementations deliver mono f32 PCM at
//! exactly 22050 Hz, with amplitudes in `[-1, 1]`. The shipped
//! [`SymphoniaDecoder`] probes and decodes with `symphonia` and
//! resamples with `rubato`.

use log::{debug, trace, warn};
use rubato::{FftFixedIn, Resampler};
use symphonia::core::audio::{SampleBuffer, SignalSpec};
use symphonia::core::codecs::{DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::{MediaSourceStream, MediaSourceStreamOptions};
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;
use symphonia::core::units;
use crate::{Error, Result, SAMPLE_RATE};
use std::fs::File;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

/// Consecutive frame-decode failures tolerated before a file is
/// abandoned. A successfully decoded frame resets the count.
const MAX_SUBSEQUENT_ERRORS: usize = 20;

/// Input chunk size of the resampler.
const RESAMPLE_CHUNK_SIZE: usize = 1024;

/// Container probing and codec setup are not re-entrant across all
/// format backends; both run under this process-wide lock. The decode
/// loop itself runs unlocked.
static PROBE_LOCK: Mutex<()> = Mutex::new(());

/// Something that can decode an audio file excerpt to 22050 Hz mono
/// float PCM.
///
/// `excerpt_length` is in seconds, `0` (or negative) meaning the
/// whole file. A negative `excerpt_start` centers the excerpt in the
/// file but starts no later than `-excerpt_start` seconds in; a
/// positive one is an offset from the beginning, right-aligned when
/// the file is too short.
pub trait Decoder {
    fn decode(path: &Path, excerpt_length: f32, excerpt_start: f32) -> Result<Vec<f32>>;
}

/// Names of the available decoders, comma-separated.
pub fn list_decoders() -> String {
    "symphonia".to_string()
}

pub(crate) fn resolve_name(name: Option<&str>) -> Result<String> {
    match name {
        None | Some("") | Some("symphonia") => Ok("symphonia".to_string()),
        Some(other) => Err(Error::InvalidArgument(format!("unknown decoder: {other}"))),
    }
}

pub(crate) fn decode_by_name(
    name: &str,
    path: &Path,
    excerpt_length: f32,
    excerpt_start: f32,
) -> Result<Vec<f32>> {
    match name {
        "symphonia" => SymphoniaDecoder::decode(path, excerpt_length, excerpt_start),
        other => Err(Error::InvalidArgument(format!("unknown decoder: {other}"))),
    }
}

/// Pull-based sample source over a probed symphonia format reader.
struct SymphoniaSource {
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    format: Box<dyn FormatReader>,
    track_id: u32,
    buffer: SampleBuffer<f32>,
    buffer_offset: usize,
    spec: SignalSpec,
    total_duration: Option<Duration>,
    subsequent_errors: usize,
}

impl SymphoniaSource {
    fn new(mss: MediaSourceStream) -> Result<Self> {
        // probe and codec setup run serialized; see PROBE_LOCK
        let _guard = PROBE_LOCK.lock().map_err(|_| {
            Error::DecodeFailed("decoder probe lock poisoned".into())
        })?;

        let hint = Hint::new();
        let format_opts = FormatOptions {
            enable_gapless: true,
            ..Default::default()
        };
        let probed = symphonia::default::get_probe()
            .format(&hint, mss, &format_opts, &MetadataOptions::default())
            .map_err(|e| Error::DecodeFailed(format!("while probing format: {e}")))?;

        let track = probed
            .format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::DecodeFailed("no supported audio track".into()))?;
        let track_id = track.id;

        let total_duration = track
            .codec_params
            .time_base
            .zip(track.codec_params.n_frames)
            .map(|(base, frames)| base.calc_time(frames).into());

        let decoder = symphonia::default::get_codecs()
            .make(&track.codec_params, &DecoderOptions::default())
            .map_err(|e| Error::DecodeFailed(format!("while opening codec: {e}")))?;

        let spec = SignalSpec::new(
            track.codec_params.sample_rate.unwrap_or(SAMPLE_RATE),
            track
                .codec_params
                .channels
                .unwrap_or_else(|| symphonia::core::audio::Layout::Mono.into_channels()),
        );
        let buffer = SampleBuffer::new(0, spec);

        Ok(SymphoniaSource {
            decoder,
            format: probed.format,
            track_id,
            buffer,
            buffer_offset: 0,
            spec,
            total_duration,
            subsequent_errors: 0,
        })
    }

    /// Refill the interleaved sample buffer from the next audio
    /// packet. Returns `false` at end of stream, an error after too
    /// many consecutive decode failures.
    fn refill(&mut self) -> Result<bool> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                // end of stream or unreadable container tail
                Err(SymphoniaError::IoError(_)) => return Ok(false),
                Err(e) => {
                    debug!("stopping decode: {e}");
                    return Ok(false);
                }
            };
            if packet.track_id() != self.track_id {
                trace!("skipping packet of foreign track");
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) if decoded.frames() > 0 => {
                    self.subsequent_errors = 0;
                    let duration = units::Duration::from(decoded.capacity() as u64);
                    self.spec = decoded.spec().to_owned();
                    self.buffer = SampleBuffer::new(duration, self.spec);
                    self.buffer.copy_interleaved_ref(decoded);
                    self.buffer_offset = 0;
                    return Ok(true);
                }
                // metadata-only packet, keep going
                Ok(_) => continue,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("error decoding an audio frame: {e}");
                    self.subsequent_errors += 1;
                    if self.subsequent_errors >= MAX_SUBSEQUENT_ERRORS {
                        return Err(Error::DecodeFailed("too many decode errors".into()));
                    }
                }
                Err(e) => return Err(Error::DecodeFailed(e.to_string())),
            }
        }
    }
}

/// Sequential decoder based on symphonia, resampling with rubato.
pub struct SymphoniaDecoder;

impl SymphoniaDecoder {
    /// Decode up to `max_samples` mono samples (0 = no bound) at the
    /// source sample rate, downmixing by channel averaging.
    fn decode_mono(source: &mut SymphoniaSource, max_samples: usize) -> Result<Vec<f32>> {
        let mut pcm = Vec::new();
        loop {
            if max_samples > 0 && pcm.len() >= max_samples {
                break;
            }
            if source.buffer_offset >= source.buffer.len() && !source.refill()? {
                break;
            }
            let channels = source.spec.channels.count().max(1);
            let samples = &source.buffer.samples()[source.buffer_offset..];
            for frame in samples.chunks_exact(channels) {
                pcm.push(frame.iter().sum::<f32>() / channels as f32);
            }
            source.buffer_offset = source.buffer.len();
        }
        Ok(pcm)
    }

    /// Resample mono samples from `source_rate` to 22050 Hz.
    fn resample(samples: Vec<f32>, source_rate: u32) -> Result<Vec<f32>> {
        if source_rate == SAMPLE_RATE {
            return Ok(samples);
        }
        let resample_err = |e: String| Error::DecodeFailed(format!("while resampling: {e}"));

        let mut resampler = FftFixedIn::<f32>::new(
            source_rate as usize,
            SAMPLE_RATE as usize,
            RESAMPLE_CHUNK_SIZE,
            1,
            1,
        )
        .map_err(|e| resample_err(e.to_string()))?;

        let new_length = samples.len() * SAMPLE_RATE as usize / source_rate as usize;
        let delay = resampler.output_delay();
        let mut resampled = Vec::with_capacity(new_length + delay);
        let mut output = resampler.output_buffer_allocate(true);

        let chunks = samples.chunks_exact(RESAMPLE_CHUNK_SIZE);
        let remainder = chunks.remainder();
        for chunk in chunks {
            let (_, written) = resampler
                .process_into_buffer(&[chunk], &mut output, None)
                .map_err(|e| resample_err(e.to_string()))?;
            resampled.extend_from_slice(&output[0][..written]);
        }
        if !remainder.is_empty() {
            let (_, written) = resampler
                .process_partial_into_buffer(Some(&[remainder]), &mut output, None)
                .map_err(|e| resample_err(e.to_string()))?;
            resampled.extend_from_slice(&output[0][..written]);
        }
        while resampled.len() < new_length + delay {
            let (_, written) = resampler
                .process_partial_into_buffer(Option::<&[&[f32]]>::None, &mut output, None)
                .map_err(|e| resample_err(e.to_string()))?;
            if written == 0 {
                break;
            }
            resampled.extend_from_slice(&output[0][..written]);
        }

        let end = (new_length + delay).min(resampled.len());
        Ok(resampled[delay.min(end)..end].to_vec())
    }
}

impl Decoder for SymphoniaDecoder {
    fn decode(path: &Path, excerpt_length: f32, excerpt_start: f32) -> Result<Vec<f32>> {
        debug!(
            "decoding {} (length={excerpt_length}s, start={excerpt_start}s)",
            path.display()
        );
        let file = File::open(path).map_err(|e| Error::DecodeFailed(e.to_string()))?;
        let mss = MediaSourceStream::new(Box::new(file), MediaSourceStreamOptions::default());
        let mut source = SymphoniaSource::new(mss)?;

        let source_rate = source.spec.rate;
        let file_length = source.total_duration.map(|d| d.as_secs_f32());

        // work out which part of the file we need, in seconds
        let mut length = excerpt_length.max(0.);
        let mut start = excerpt_start;
        if let Some(file_length) = file_length {
            if length <= 0. || length >= file_length {
                length = 0.;
                start = 0.;
            } else if start < 0. {
                // center in the file, but start at -excerpt_start the latest
                start = (-start).min((file_length - length) / 2.);
            } else if start + length > file_length {
                // right-align the excerpt
                start = file_length - length;
            }
        }

        // decode no more source samples than the excerpt needs
        let decode_samples = if length <= 0. {
            0
        } else {
            ((start.abs() + length) * source_rate as f32) as usize
        };
        let mut pcm = Self::decode_mono(&mut source, decode_samples)?;

        // with an unknown file length the excerpt is centered within
        // whatever was decoded
        let mut missed = 0;
        if start < 0. {
            let decoded_length = pcm.len() as f32 / source_rate as f32;
            start = if decoded_length > length {
                (-start).min((decoded_length - length) / 2.)
            } else {
                0.
            };
        } else {
            // the file may have ended before the requested window;
            // right-align by skipping less
            missed = decode_samples.saturating_sub(pcm.len());
        }

        // cut out the excerpt at the source rate, then resample
        if length > 0. {
            let skip = ((start * source_rate as f32) as usize)
                .saturating_sub(missed)
                .min(pcm.len());
            let take = (length * source_rate as f32) as usize;
            pcm.drain(..skip);
            pcm.truncate(take);
        }
        let pcm = Self::resample(pcm, source_rate)?;

        if pcm.is_empty() {
            return Err(Error::DecodeFailed(format!(
                "no samples decoded from {}",
                path.display()
            )));
        }
        trace!("decoded {} samples at {} Hz", pcm.len(), SAMPLE_RATE);
        Ok(pcm)
    }
}
