//! The on-disk collection file: an append-only log of analyzed
//! tracks.
//!
//! Layout: a header `MUSLY-0-<method>\0`, then one record per track:
//! the null-terminated source path, a big-endian `u32` payload
//! length, and the payload (the portable big-endian track encoding).
//! Truncated trailing records are ignored, so an interrupted analysis
//! run loses at most the track it was writing.

use anyhow::{anyhow, bail, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};

const MAGIC: &str = "MUSLY";
const FORMAT_VERSION: &str = "0";

pub struct CollectionFile {
    path: PathBuf,
}

impl CollectionFile {
    pub fn new(path: &Path) -> Self {
        CollectionFile {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Create (or truncate) the collection with a header naming the
    /// similarity method.
    pub fn initialize(&self, method: &str) -> Result<()> {
        let file = File::create(&self.path)
            .with_context(|| format!("creating collection file {}", self.path.display()))?;
        let mut writer = BufWriter::new(file);
        write!(writer, "{MAGIC}-{FORMAT_VERSION}-{method}")?;
        writer.write_all(&[0])?;
        writer.flush()?;
        Ok(())
    }

    /// Open the collection for reading; validates the header and
    /// yields the method name alongside the record reader.
    pub fn open(&self) -> Result<CollectionReader> {
        let file = File::open(&self.path).with_context(|| {
            format!(
                "collection file {} not found, initialize with '-n'",
                self.path.display()
            )
        })?;
        let mut reader = BufReader::new(file);

        let header = read_cstr(&mut reader)?
            .ok_or_else(|| anyhow!("collection file {} is empty", self.path.display()))?;
        let mut parts = header.splitn(3, '-');
        let magic = parts.next().unwrap_or_default();
        let version = parts.next().unwrap_or_default();
        let method = parts.next().unwrap_or_default();
        if magic != MAGIC || version != FORMAT_VERSION || method.is_empty() {
            bail!(
                "collection file {} is invalid, reinitialize with '-n'",
                self.path.display()
            );
        }

        Ok(CollectionReader {
            reader,
            method: method.to_string(),
        })
    }

    /// Append one `(path, payload)` record.
    pub fn append_track(&self, track_path: &str, payload: &[u8]) -> Result<()> {
        let file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .with_context(|| format!("opening collection file {}", self.path.display()))?;
        let mut writer = BufWriter::new(file);
        writer.write_all(track_path.as_bytes())?;
        writer.write_all(&[0])?;
        writer.write_u32::<BigEndian>(payload.len() as u32)?;
        writer.write_all(payload)?;
        writer.flush()?;
        Ok(())
    }
}

pub struct CollectionReader {
    reader: BufReader<File>,
    method: String,
}

impl CollectionReader {
    pub fn method(&self) -> &str {
        &self.method
    }
}

impl Iterator for CollectionReader {
    type Item = (String, Vec<u8>);

    /// The next intact record; a truncated trailing record ends the
    /// iteration.
    fn next(&mut self) -> Option<(String, Vec<u8>)> {
        let path = read_cstr(&mut self.reader).ok()??;
        let size = self.reader.read_u32::<BigEndian>().ok()?;
        let mut payload = vec![0u8; size as usize];
        self.reader.read_exact(&mut payload).ok()?;
        Some((path, payload))
    }
}

/// Read a null-terminated string; `None` on immediate end of file.
fn read_cstr(reader: &mut impl Read) -> Result<Option<String>> {
    let mut bytes = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match reader.read_exact(&mut byte) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::UnexpectedEof && bytes.is_empty() => {
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }
        if byte[0] == 0 {
            return Ok(Some(String::from_utf8(bytes)?));
        }
        bytes.push(byte[0]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_and_truncation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.musly");
        let collection = CollectionFile::new(&path);

        collection.initialize("timbre").unwrap();
        collection.append_track("a.flac", &[1, 2, 3]).unwrap();
        collection.append_track("b.flac", &[4, 5]).unwrap();

        let mut reader = collection.open().unwrap();
        assert_eq!(reader.method(), "timbre");
        assert_eq!(reader.next(), Some(("a.flac".to_string(), vec![1, 2, 3])));
        assert_eq!(reader.next(), Some(("b.flac".to_string(), vec![4, 5])));
        assert_eq!(reader.next(), None);

        // a truncated trailing record is ignored
        let mut bytes = std::fs::read(&path).unwrap();
        bytes.extend_from_slice(b"c.flac\0");
        bytes.extend_from_slice(&[0, 0, 0, 9, 1]);
        std::fs::write(&path, bytes).unwrap();
        let reader = collection.open().unwrap();
        assert_eq!(reader.count(), 2);
    }

    #[test]
    fn test_rejects_foreign_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bogus.musly");
        std::fs::write(&path, b"BOGUS-9-timbre\0").unwrap();
        assert!(CollectionFile::new(&path).open().is_err());
    }
}
