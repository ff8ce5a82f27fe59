//! The jukebox: a powered-on similarity method plus its registered
//! track ids and auxiliary state, with binary persistence.
//!
//! Mutating operations take `&mut self`, read-only queries take
//! `&self`; the one-writer-xor-many-readers contract is enforced by
//! the borrow checker.

use byteorder::{BigEndian, ByteOrder, NativeEndian, ReadBytesExt, WriteBytesExt};
use log::{debug, error, info};
use crate::decoder;
use crate::method::Method;
use crate::{Error, Result, Track, TrackId};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// Byte-order probe written into every serialized jukebox; a reader
/// on a platform with a different byte order sees it permuted and
/// refuses the stream.
const BYTE_ORDER_PROBE: u32 = 0x0102_0304;

/// Serialized per-track entries are grouped into chunks of roughly
/// this many bytes; one chunk is the atomic unit of I/O progress.
const SERIALIZE_CHUNK_BYTES: usize = 64 << 10;

pub struct Jukebox {
    method: Method,
    method_name: String,
    decoder_name: String,
}

impl Jukebox {
    /// Power on a jukebox with the given method and decoder names.
    /// `None` (or an empty name) selects the defaults.
    pub fn power_on(method: Option<&str>, decoder: Option<&str>) -> Result<Jukebox> {
        let method_name = match method {
            None | Some("") => Method::DEFAULT_NAME,
            Some(name) => name,
        };
        let method = Method::by_name(method_name)
            .ok_or_else(|| Error::InvalidArgument(format!("unknown method: {method_name}")))?;
        let decoder_name = decoder::resolve_name(decoder)?;
        info!("powered on jukebox: method={method_name}, decoder={decoder_name}");
        Ok(Jukebox {
            method,
            method_name: method_name.to_string(),
            decoder_name,
        })
    }

    /// Explicitly shut the jukebox down, dropping all of its state.
    pub fn power_off(self) {}

    /// A short description of the similarity method in use.
    pub fn about_method(&self) -> &'static str {
        self.method.about()
    }

    pub fn method_name(&self) -> &str {
        &self.method_name
    }

    pub fn decoder_name(&self) -> &str {
        &self.decoder_name
    }

    // -- tracks ------------------------------------------------------

    /// Allocate a zeroed track block of this method's layout.
    pub fn track_alloc(&self) -> Track {
        self.method.layout().alloc()
    }

    /// Number of floats in a track block.
    pub fn track_size(&self) -> usize {
        self.method.layout().size()
    }

    /// Number of bytes of a serialized track block.
    pub fn track_binsize(&self) -> usize {
        self.track_size() * std::mem::size_of::<f32>()
    }

    /// The method's `(field name, field length)` track layout.
    pub fn track_fields(&self) -> &[(String, usize)] {
        self.method.layout().fields()
    }

    /// Debug-render a track block, one line per field.
    pub fn track_tostr(&self, track: &Track) -> String {
        self.method.layout().track_to_string(track)
    }

    fn check_track(&self, track: &Track) -> Result<()> {
        if track.len() != self.track_size() {
            return Err(Error::InvalidArgument(format!(
                "track block has {} floats, method {} expects {}",
                track.len(),
                self.method_name,
                self.track_size()
            )));
        }
        Ok(())
    }

    /// Serialize a track block into `buffer` as big-endian IEEE-754
    /// bit patterns; returns the number of bytes written.
    pub fn track_tobin(&self, track: &Track, buffer: &mut [u8]) -> Result<usize> {
        self.check_track(track)?;
        let size = self.track_binsize();
        if buffer.len() < size {
            return Err(Error::InvalidArgument(
                "serialization buffer too small".into(),
            ));
        }
        for (value, chunk) in track.as_slice().iter().zip(buffer.chunks_exact_mut(4)) {
            BigEndian::write_u32(chunk, value.to_bits());
        }
        Ok(size)
    }

    /// Inverse of [`track_tobin`](Jukebox::track_tobin); returns the
    /// number of bytes consumed.
    pub fn track_frombin(&self, buffer: &[u8], track: &mut Track) -> Result<usize> {
        self.check_track(track)?;
        let size = self.track_binsize();
        if buffer.len() < size {
            return Err(Error::InvalidArgument(
                "deserialization buffer too small".into(),
            ));
        }
        for (value, chunk) in track.0.iter_mut().zip(buffer.chunks_exact(4)) {
            *value = f32::from_bits(BigEndian::read_u32(chunk));
        }
        Ok(size)
    }

    // -- analysis ----------------------------------------------------

    /// Analyze a mono 22050 Hz PCM signal into `track`.
    ///
    /// At most the central 60 seconds of the signal are used.
    pub fn analyze_pcm(&self, pcm: &[f32], track: &mut Track) -> Result<()> {
        self.check_track(track)?;
        self.method.analyze_track(pcm, track)
    }

    /// Decode an excerpt of an audio file and analyze it into
    /// `track`.
    ///
    /// `excerpt_length` seconds are taken starting at
    /// `excerpt_start`; a zero length means the whole file, a
    /// negative start centers the excerpt (but starts no later than
    /// `-excerpt_start`).
    pub fn analyze_audiofile(
        &self,
        path: &Path,
        excerpt_length: f32,
        excerpt_start: f32,
        track: &mut Track,
    ) -> Result<()> {
        let pcm = decoder::decode_by_name(&self.decoder_name, path, excerpt_length, excerpt_start)?;
        if pcm.is_empty() {
            return Err(Error::DecodeFailed(format!(
                "decoder returned no samples for {}",
                path.display()
            )));
        }
        self.analyze_pcm(&pcm, track)
    }

    /// Analyze many audio files, fanned out over all CPU cores.
    ///
    /// Decoding and analysis are pure per-file operations; the only
    /// shared state is the decoder's probe stage, which serializes
    /// itself internally.
    pub fn analyze_audiofiles(
        &self,
        paths: &[PathBuf],
        excerpt_length: f32,
        excerpt_start: f32,
    ) -> Vec<(PathBuf, Result<Track>)> {
        let num_cpus = num_cpus::get();
        let mut chunk_length = paths.len() / num_cpus;
        if chunk_length == 0 {
            chunk_length = paths.len().max(1);
        }

        let mut results = Vec::with_capacity(paths.len());
        crossbeam::scope(|s| {
            let mut handles = Vec::new();
            for chunk in paths.chunks(chunk_length) {
                handles.push(s.spawn(move |_| {
                    let mut chunk_results = Vec::with_capacity(chunk.len());
                    for path in chunk {
                        debug!("analyzing file {}", path.display());
                        let mut track = self.track_alloc();
                        let result = self
                            .analyze_audiofile(path, excerpt_length, excerpt_start, &mut track)
                            .map(|()| track);
                        chunk_results.push((path.clone(), result));
                    }
                    chunk_results
                }));
            }
            for handle in handles {
                if let Ok(chunk_results) = handle.join() {
                    results.extend(chunk_results);
                }
            }
        })
        .unwrap_or_else(|_| error!("analysis worker panicked"));
        results
    }

    // -- registry ----------------------------------------------------

    /// Teach the method what the collection sounds like.
    ///
    /// Must be called before [`add_tracks`](Jukebox::add_tracks) for
    /// methods that normalize distances. Calling it again invalidates
    /// the auxiliary state of all already-registered tracks; callers
    /// must re-register them.
    pub fn set_music_style(&mut self, tracks: &[Track]) -> Result<()> {
        for track in tracks {
            self.check_track(track)?;
        }
        self.method.set_music_style(tracks)
    }

    /// Register a batch of analyzed tracks.
    ///
    /// With `generate_ids`, fresh contiguous ascending ids are written
    /// into `ids`; otherwise the caller-provided ids are used, and
    /// re-registering an existing id replaces that entry. The batch is
    /// all-or-nothing.
    pub fn add_tracks(
        &mut self,
        tracks: &[Track],
        ids: &mut [TrackId],
        generate_ids: bool,
    ) -> Result<()> {
        if tracks.len() != ids.len() {
            return Err(Error::InvalidArgument(
                "tracks and ids must have the same length".into(),
            ));
        }
        for track in tracks {
            self.check_track(track)?;
        }
        self.method.add_tracks(tracks, ids, generate_ids)
    }

    /// Deregister a batch of ids; unknown ids are silently skipped.
    pub fn remove_tracks(&mut self, ids: &[TrackId]) -> Result<()> {
        self.method.remove_tracks(ids);
        Ok(())
    }

    pub fn track_count(&self) -> usize {
        self.method.track_count()
    }

    /// Largest id ever registered, `-1` when none was.
    pub fn max_track_id(&self) -> TrackId {
        self.method.max_track_id()
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        self.method.track_ids()
    }

    // -- queries -----------------------------------------------------

    /// Compute the dissimilarity between a seed track and a batch of
    /// candidate tracks; `out[i]` corresponds to `tracks[i]`.
    pub fn similarity(
        &self,
        seed: &Track,
        seed_id: TrackId,
        tracks: &[Track],
        ids: &[TrackId],
        out: &mut [f32],
    ) -> Result<()> {
        self.check_track(seed)?;
        if tracks.len() != ids.len() || tracks.len() != out.len() {
            return Err(Error::InvalidArgument(
                "tracks, ids and output must have the same length".into(),
            ));
        }
        for track in tracks {
            self.check_track(track)?;
        }
        self.method.similarity(seed, seed_id, tracks, ids, out)
    }

    /// Propose up to `cap` likely neighbors of `seed` without touching
    /// per-track model data. `None` means the method keeps no index
    /// and all tracks should be considered.
    pub fn guess_neighbors(&self, seed: TrackId, cap: usize) -> Option<Vec<TrackId>> {
        self.method.guess_neighbors(seed, cap, None)
    }

    /// Like [`guess_neighbors`](Jukebox::guess_neighbors), but only
    /// ids in `filter` may be proposed.
    pub fn guess_neighbors_filtered(
        &self,
        seed: TrackId,
        cap: usize,
        filter: &[TrackId],
    ) -> Option<Vec<TrackId>> {
        self.method.guess_neighbors(seed, cap, Some(filter))
    }

    // -- whole-state serialization -----------------------------------

    /// Size in bytes of the serialized state: the metadata header if
    /// `header`, plus `num_tracks` per-track entries (all registered
    /// tracks when `None`).
    pub fn binsize(&self, header: bool, num_tracks: Option<usize>) -> usize {
        let mut size = 0;
        if header {
            size += self.method.metadata_size();
        }
        let count = num_tracks.unwrap_or_else(|| self.track_count());
        size + count * self.method.trackdata_entry_size()
    }

    /// Serialize the metadata header (if `header`) and `num_tracks`
    /// per-track entries starting at `skip_tracks`. `None` or an
    /// over-long count is clamped to the remaining tracks.
    pub fn tobin(
        &self,
        header: bool,
        num_tracks: Option<usize>,
        skip_tracks: usize,
    ) -> Result<Vec<u8>> {
        let count = self.track_count();
        if skip_tracks > count {
            return Err(Error::InvalidArgument(
                "skip_tracks exceeds registered tracks".into(),
            ));
        }
        let num = match num_tracks {
            Some(n) if n + skip_tracks <= count => n,
            _ => count - skip_tracks,
        };
        let mut buffer = Vec::with_capacity(self.binsize(header, Some(num)));
        if header {
            buffer.extend_from_slice(&self.method.serialize_metadata());
        }
        if num > 0 {
            buffer.extend_from_slice(&self.method.serialize_trackdata(num, skip_tracks)?);
        }
        Ok(buffer)
    }

    /// Restore state from a [`tobin`](Jukebox::tobin) buffer; returns
    /// the number of per-track entries read. With `header` and
    /// `num_tracks == Some(0)`, only the metadata is restored and the
    /// number of entries declared by it is returned.
    pub fn frombin(
        &mut self,
        buffer: &[u8],
        header: bool,
        num_tracks: Option<usize>,
    ) -> Result<usize> {
        let mut buffer = buffer;
        let mut num = num_tracks;
        if header {
            let expected = self.method.deserialize_metadata(buffer)?;
            match num {
                Some(0) => return Ok(expected),
                None => num = Some(expected),
                Some(_) => {}
            }
            buffer = &buffer[self.method.metadata_size()..];
        }
        let num = num.ok_or_else(|| {
            Error::InvalidArgument("track count required without a header".into())
        })?;
        self.method.deserialize_trackdata(buffer, num)
    }

    /// Write the whole jukebox state sequentially; returns the number
    /// of bytes written. Per-track entries go out in ~64 KiB chunks.
    pub fn to_stream(&self, stream: &mut dyn Write) -> Result<usize> {
        let io_err = |e: std::io::Error| Error::IoFailed(e.to_string());
        let mut written = 0;

        let version = crate::version();
        stream.write_all(version.as_bytes()).map_err(io_err)?;
        stream.write_all(&[0]).map_err(io_err)?;
        written += version.len() + 1;

        // platform information, refused on mismatch at read time
        stream
            .write_u8(std::mem::size_of::<i32>() as u8)
            .map_err(io_err)?;
        stream
            .write_all(&BYTE_ORDER_PROBE.to_ne_bytes())
            .map_err(io_err)?;
        written += 5;

        stream.write_all(self.method_name.as_bytes()).map_err(io_err)?;
        stream.write_all(&[0]).map_err(io_err)?;
        stream.write_all(self.decoder_name.as_bytes()).map_err(io_err)?;
        stream.write_all(&[0]).map_err(io_err)?;
        written += self.method_name.len() + self.decoder_name.len() + 2;

        let size_head = self.binsize(true, Some(0));
        stream
            .write_i32::<NativeEndian>(size_head as i32)
            .map_err(io_err)?;
        written += 4;

        let header = self.tobin(true, Some(0), 0)?;
        stream.write_all(&header).map_err(io_err)?;
        written += header.len();

        let num_tracks = self.track_count();
        let size_track = self.binsize(false, Some(1));
        let batch = (SERIALIZE_CHUNK_BYTES / size_track).clamp(1, num_tracks.max(1));
        let mut skip = 0;
        while skip < num_tracks {
            let chunk = self.tobin(false, Some(batch), skip)?;
            stream.write_all(&chunk).map_err(io_err)?;
            written += chunk.len();
            skip += batch;
        }

        Ok(written)
    }

    /// Read a jukebox state written by
    /// [`to_stream`](Jukebox::to_stream). Bytes after the state are
    /// left unread, so callers may append their own payloads.
    ///
    /// Streams written by a different crate version, integer width or
    /// byte order are refused.
    pub fn from_stream(stream: &mut dyn Read) -> Result<Jukebox> {
        let version = read_cstr(stream)?;
        if version != crate::version() {
            error!(
                "jukebox state written with version {version}, expected {}",
                crate::version()
            );
            return Err(Error::FormatMismatch(format!(
                "written with version {version}"
            )));
        }

        let int_size = stream
            .read_u8()
            .map_err(|e| Error::IoFailed(e.to_string()))?;
        if int_size as usize != std::mem::size_of::<i32>() {
            error!("jukebox state written with integer size {int_size}");
            return Err(Error::FormatMismatch(format!(
                "written with integer size {int_size}"
            )));
        }

        let mut probe = [0u8; 4];
        stream
            .read_exact(&mut probe)
            .map_err(|e| Error::IoFailed(e.to_string()))?;
        if u32::from_ne_bytes(probe) != BYTE_ORDER_PROBE {
            error!("jukebox state written with different byte order");
            return Err(Error::FormatMismatch(
                "written with different byte order".into(),
            ));
        }

        let method_name = read_cstr(stream)?;
        let decoder_name = read_cstr(stream)?;
        let mut jukebox = Jukebox::power_on(Some(&method_name), Some(&decoder_name))
            .map_err(|_| Error::FormatMismatch(format!("unknown method: {method_name}")))?;

        let size_head = stream
            .read_i32::<NativeEndian>()
            .map_err(|e| Error::IoFailed(e.to_string()))?;
        if size_head < 0 {
            return Err(Error::FormatMismatch("negative header size".into()));
        }
        let mut header = vec![0u8; size_head as usize];
        stream
            .read_exact(&mut header)
            .map_err(|e| Error::IoFailed(e.to_string()))?;
        let mut expected = jukebox.frombin(&header, true, Some(0))?;

        let size_track = jukebox.binsize(false, Some(1));
        let batch = (SERIALIZE_CHUNK_BYTES / size_track).clamp(1, expected.max(1));
        let mut chunk = vec![0u8; batch * size_track];
        while expected > 0 {
            let read = expected.min(batch);
            let bytes = read * size_track;
            stream
                .read_exact(&mut chunk[..bytes])
                .map_err(|e| Error::IoFailed(e.to_string()))?;
            jukebox.frombin(&chunk[..bytes], false, Some(read))?;
            expected -= read;
        }

        info!(
            "restored jukebox: method={}, {} tracks",
            jukebox.method_name,
            jukebox.track_count()
        );
        Ok(jukebox)
    }

    /// Serialize the whole state into a file.
    pub fn to_file(&self, path: &Path) -> Result<usize> {
        let file = std::fs::File::create(path).map_err(|e| Error::IoFailed(e.to_string()))?;
        let mut writer = std::io::BufWriter::new(file);
        self.to_stream(&mut writer)
    }

    /// Restore a jukebox from a file written by
    /// [`to_file`](Jukebox::to_file).
    pub fn from_file(path: &Path) -> Result<Jukebox> {
        let file = std::fs::File::open(path).map_err(|e| Error::IoFailed(e.to_string()))?;
        let mut reader = std::io::BufReader::new(file);
        Jukebox::from_stream(&mut reader)
    }
}

fn read_cstr(stream: &mut dyn Read) -> Result<String> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream
            .read_exact(&mut byte)
            .map_err(|e| Error::IoFailed(e.to_string()))?;
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    String::from_utf8(bytes).map_err(|_| Error::FormatMismatch("malformed string field".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_power_on_unknown_names() {
        assert!(matches!(
            Jukebox::power_on(Some("nonexistent"), None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            Jukebox::power_on(None, Some("nonexistent")),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_power_on_defaults() {
        let jukebox = Jukebox::power_on(None, None).unwrap();
        assert_eq!(jukebox.method_name(), "timbre");
        assert_eq!(jukebox.decoder_name(), "symphonia");
        assert_eq!(jukebox.track_count(), 0);
        assert_eq!(jukebox.max_track_id(), -1);
    }

    #[test]
    fn test_track_binary_round_trip() {
        let jukebox = Jukebox::power_on(Some("timbre"), None).unwrap();
        let mut track = jukebox.track_alloc();
        for (i, value) in track.0.iter_mut().enumerate() {
            *value = (i as f32).sin();
        }

        let mut buffer = vec![0u8; jukebox.track_binsize()];
        let written = jukebox.track_tobin(&track, &mut buffer).unwrap();
        assert_eq!(written, jukebox.track_binsize());

        let mut restored = jukebox.track_alloc();
        let read = jukebox.track_frombin(&buffer, &mut restored).unwrap();
        assert_eq!(read, written);
        assert_eq!(track, restored);
    }

    #[test]
    fn test_track_encoding_is_big_endian() {
        let jukebox = Jukebox::power_on(Some("timbre"), None).unwrap();
        let mut track = jukebox.track_alloc();
        track.0[0] = f32::from_bits(0x0102_0304);
        let mut buffer = vec![0u8; jukebox.track_binsize()];
        jukebox.track_tobin(&track, &mut buffer).unwrap();
        assert_eq!(&buffer[0..4], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_rejects_foreign_track_blocks() {
        let timbre = Jukebox::power_on(Some("timbre"), None).unwrap();
        let mandelellis = Jukebox::power_on(Some("mandelellis"), None).unwrap();
        let track = mandelellis.track_alloc();
        let mut buffer = vec![0u8; timbre.track_binsize()];
        assert!(matches!(
            timbre.track_tobin(&track, &mut buffer),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_from_stream_refuses_foreign_platforms() {
        let jukebox = Jukebox::power_on(Some("mandelellis"), None).unwrap();
        let mut buffer = Vec::new();
        jukebox.to_stream(&mut buffer).unwrap();

        // flip the integer-size octet
        let mut tampered = buffer.clone();
        let version_len = crate::version().len() + 1;
        tampered[version_len] = 8;
        assert!(matches!(
            Jukebox::from_stream(&mut tampered.as_slice()),
            Err(Error::FormatMismatch(_))
        ));

        // permute the byte-order probe
        let mut tampered = buffer.clone();
        tampered[version_len + 1..version_len + 5].reverse();
        assert!(matches!(
            Jukebox::from_stream(&mut tampered.as_slice()),
            Err(Error::FormatMismatch(_))
        ));

        // advertise a different version
        let mut tampered = buffer;
        tampered[0] = tampered[0].wrapping_add(1);
        assert!(matches!(
            Jukebox::from_stream(&mut tampered.as_slice()),
            Err(Error::FormatMismatch(_))
        ));
    }

    #[test]
    fn test_stream_ignores_trailing_bytes() {
        let jukebox = Jukebox::power_on(Some("mandelellis"), None).unwrap();
        let mut buffer = Vec::new();
        let written = jukebox.to_stream(&mut buffer).unwrap();
        assert_eq!(written, buffer.len());

        buffer.extend_from_slice(b"caller payload");
        let mut cursor = buffer.as_slice();
        let restored = Jukebox::from_stream(&mut cursor).unwrap();
        assert_eq!(restored.track_count(), 0);
        assert_eq!(cursor, b"caller payload");
    }
}
