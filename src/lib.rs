//! Content-based music similarity.
//!
//! `attune-audio` builds a compact statistical timbre model per track
//! (a single Gaussian over MFCC frames) and computes scalar
//! dissimilarities between tracks with closed-form Gaussian
//! divergences. A [`Jukebox`] holds the method's global state
//! (including the Mutual Proximity normalization layer) and a
//! registry of track ids; its whole state can be serialized and
//! restored across runs.
//!
//! Typical use:
//!
//! ```no_run
//! use attune_audio::{Jukebox, BoxResult};
//!
//! fn main() -> BoxResult<()> {
//!     let mut jukebox = Jukebox::power_on(None, None)?;
//!     let mut tracks = Vec::new();
//!     for path in ["a.flac", "b.flac", "c.flac"] {
//!         let mut track = jukebox.track_alloc();
//!         jukebox.analyze_audiofile(path.as_ref(), 30., -48., &mut track)?;
//!         tracks.push(track);
//!     }
//!     jukebox.set_music_style(&tracks)?;
//!     let mut ids = vec![0; tracks.len()];
//!     jukebox.add_tracks(&tracks, &mut ids, true)?;
//!
//!     let mut similarities = vec![0.; tracks.len()];
//!     jukebox.similarity(&tracks[0], ids[0], &tracks, &ids, &mut similarities)?;
//!     println!("{similarities:?}");
//!     Ok(())
//! }
//! ```

pub mod decoder;
mod gaussian;
mod idpool;
mod jukebox;
mod melspectrum;
mod method;
mod methods;
mod mfcc;
mod mutualproximity;
mod powerspectrum;
mod selection;

use thiserror::Error as ThisError;

pub use crate::jukebox::Jukebox;
pub use crate::method::Track;
pub use crate::selection::find_min;

/// Sample rate every analyzed PCM signal must have.
pub const SAMPLE_RATE: u32 = 22050;

/// Identifier a track gets when registered with a jukebox.
pub type TrackId = i32;

/// Crate version; also written into serialized jukebox state, which
/// is refused on mismatch.
pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Comma-separated names of the available similarity methods.
pub fn list_methods() -> String {
    crate::method::Method::list()
}

/// Comma-separated names of the available audio decoders.
pub fn list_decoders() -> String {
    crate::decoder::list_decoders()
}

#[derive(ThisError, Debug, PartialEq)]
pub enum Error {
    /// Mismatched buffer sizes, unknown method or decoder names,
    /// out-of-range counts, unregistered track ids.
    #[error("Invalid argument – {0}")]
    InvalidArgument(String),
    /// An operation that requires `set_music_style` ran before it.
    #[error("Jukebox not initialized – {0}")]
    NotInitialized(String),
    /// Gaussian estimation rejected the input.
    #[error("Error happened while analyzing audio – {0}")]
    EstimationFailed(String),
    /// A binary stream has the wrong version, integer size, byte
    /// order or method name.
    #[error("Incompatible serialized jukebox state – {0}")]
    FormatMismatch(String),
    /// The audio decoder produced no usable signal.
    #[error("Error happened while decoding file – {0}")]
    DecodeFailed(String),
    /// An underlying read or write failed.
    #[error("I/O error – {0}")]
    IoFailed(String),
}

/// Convenience alias used by all fallible functions of this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Boxed-error alias for application code mixing error sources.
pub type BoxResult<T> = std::result::Result<T, Box<dyn std::error::Error>>;
