//! Common plumbing for similarity methods: the track feature block,
//! its field layout, and the closed set of shipped methods.

use crate::methods::mandelellis::MandelEllis;
use crate::methods::timbre::Timbre;
use crate::{Result, TrackId};
use std::fmt::Write as _;

/// An opaque per-track feature block.
///
/// A flat vector of floats whose length and field layout are decided
/// by the method a jukebox was powered on with. Allocate one with
/// [`Jukebox::track_alloc`](crate::Jukebox::track_alloc), fill it with
/// [`Jukebox::analyze_pcm`](crate::Jukebox::analyze_pcm), and pass it
/// around by reference; the jukebox never stores it.
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize)
)]
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Track(pub(crate) Vec<f32>);

impl Track {
    /// The raw feature values.
    pub fn as_slice(&self) -> &[f32] {
        &self.0
    }

    /// Number of floats in the block.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether the block is empty (only true for method-less blocks).
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Named field layout of a method's track block.
///
/// Methods register their fields once at construction; the offsets
/// returned by [`add_field`](TrackLayout::add_field) are fixed for the
/// method's lifetime.
#[derive(Default)]
pub(crate) struct TrackLayout {
    fields: Vec<(String, usize)>,
    size: usize,
}

impl TrackLayout {
    pub fn new() -> Self {
        TrackLayout::default()
    }

    /// Reserve `num_floats` floats for a named field; returns the
    /// field's starting offset within the track block.
    pub fn add_field(&mut self, name: &str, num_floats: usize) -> usize {
        self.fields.push((name.to_string(), num_floats));
        let offset = self.size;
        self.size += num_floats;
        offset
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn fields(&self) -> &[(String, usize)] {
        &self.fields
    }

    pub fn alloc(&self) -> Track {
        Track(vec![0.; self.size])
    }

    /// Debug rendering of a track block, one `name: values` line per
    /// field.
    pub fn track_to_string(&self, track: &Track) -> String {
        let mut out = String::new();
        let mut offset = 0;
        for (name, len) in &self.fields {
            let _ = write!(out, "{name}:");
            for value in &track.0[offset..offset + len] {
                let _ = write!(out, " {value:.6}");
            }
            out.push('\n');
            offset += len;
        }
        out
    }
}

/// The closed set of shipped similarity methods.
///
/// Kept as a tagged enum rather than trait objects: the set is fixed
/// at build time and exhaustive matching keeps the serialization
/// switch honest.
pub(crate) enum Method {
    MandelEllis(MandelEllis),
    Timbre(Timbre),
}

/// Registry order: lowest-priority first, default method last.
const METHOD_NAMES: [&str; 2] = ["mandelellis", "timbre"];

impl Method {
    pub const DEFAULT_NAME: &'static str = "timbre";

    /// Comma-separated names of all available methods.
    pub fn list() -> String {
        METHOD_NAMES.join(",")
    }

    /// Instantiate a method by name; an empty name selects the
    /// default method.
    pub fn by_name(name: &str) -> Option<Method> {
        match name {
            "" => Method::by_name(Method::DEFAULT_NAME),
            "mandelellis" => Some(Method::MandelEllis(MandelEllis::new())),
            "timbre" => Some(Method::Timbre(Timbre::new())),
            _ => None,
        }
    }

    pub fn about(&self) -> &'static str {
        match self {
            Method::MandelEllis(m) => m.about(),
            Method::Timbre(m) => m.about(),
        }
    }

    pub fn layout(&self) -> &TrackLayout {
        match self {
            Method::MandelEllis(m) => m.layout(),
            Method::Timbre(m) => m.layout(),
        }
    }

    pub fn analyze_track(&self, pcm: &[f32], track: &mut Track) -> Result<()> {
        match self {
            Method::MandelEllis(m) => m.analyze_track(pcm, track),
            Method::Timbre(m) => m.analyze_track(pcm, track),
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
        match self {
            Method::MandelEllis(m) => m.similarity(seed, seed_id, tracks, ids, out),
            Method::Timbre(m) => m.similarity(seed, seed_id, tracks, ids, out),
        }
    }

    pub fn set_music_style(&mut self, tracks: &[Track]) -> Result<()> {
        match self {
            Method::MandelEllis(m) => m.set_music_style(tracks),
            Method::Timbre(m) => m.set_music_style(tracks),
        }
    }

    pub fn add_tracks(
        &mut self,
        tracks: &[Track],
        ids: &mut [TrackId],
        generate_ids: bool,
    ) -> Result<()> {
        match self {
            Method::MandelEllis(m) => m.add_tracks(tracks, ids, generate_ids),
            Method::Timbre(m) => m.add_tracks(tracks, ids, generate_ids),
        }
    }

    pub fn remove_tracks(&mut self, ids: &[TrackId]) {
        match self {
            Method::MandelEllis(m) => m.remove_tracks(ids),
            Method::Timbre(m) => m.remove_tracks(ids),
        }
    }

    pub fn track_count(&self) -> usize {
        match self {
            Method::MandelEllis(m) => m.track_count(),
            Method::Timbre(m) => m.track_count(),
        }
    }

    pub fn max_track_id(&self) -> TrackId {
        match self {
            Method::MandelEllis(m) => m.max_track_id(),
            Method::Timbre(m) => m.max_track_id(),
        }
    }

    pub fn track_ids(&self) -> Vec<TrackId> {
        match self {
            Method::MandelEllis(m) => m.track_ids(),
            Method::Timbre(m) => m.track_ids(),
        }
    }

    /// Neighbor-candidate shortlist for a seed. Neither shipped
    /// method maintains an index, so this is `None`: consider all
    /// tracks.
    pub fn guess_neighbors(
        &self,
        _seed: TrackId,
        _cap: usize,
        _filter: Option<&[TrackId]>,
    ) -> Option<Vec<TrackId>> {
        None
    }

    pub fn metadata_size(&self) -> usize {
        match self {
            Method::MandelEllis(m) => m.metadata_size(),
            Method::Timbre(m) => m.metadata_size(),
        }
    }

    pub fn serialize_metadata(&self) -> Vec<u8> {
        match self {
            Method::MandelEllis(m) => m.serialize_metadata(),
            Method::Timbre(m) => m.serialize_metadata(),
        }
    }

    /// Restore method state from a metadata block; returns the number
    /// of per-track entries that follow in the stream.
    pub fn deserialize_metadata(&mut self, buffer: &[u8]) -> Result<usize> {
        match self {
            Method::MandelEllis(m) => m.deserialize_metadata(buffer),
            Method::Timbre(m) => m.deserialize_metadata(buffer),
        }
    }

    pub fn trackdata_entry_size(&self) -> usize {
        match self {
            Method::MandelEllis(m) => m.trackdata_entry_size(),
            Method::Timbre(m) => m.trackdata_entry_size(),
        }
    }

    pub fn serialize_trackdata(&self, num_tracks: usize, skip_tracks: usize) -> Result<Vec<u8>> {
        match self {
            Method::MandelEllis(m) => m.serialize_trackdata(num_tracks, skip_tracks),
            Method::Timbre(m) => m.serialize_trackdata(num_tracks, skip_tracks),
        }
    }

    pub fn deserialize_trackdata(&mut self, buffer: &[u8], num_tracks: usize) -> Result<usize> {
        match self {
            Method::MandelEllis(m) => m.deserialize_trackdata(buffer, num_tracks),
            Method::Timbre(m) => m.deserialize_trackdata(buffer, num_tracks),
        }
    }
}
