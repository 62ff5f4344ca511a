//! Track byte sources
//!
//! The engine only knows locators. A [`TrackLoader`] turns one into bytes;
//! decoding happens afterwards on the blocking pool.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::audio::buffer::PcmBuffer;
use crate::codec::decode_track;
use crate::config::StreamConfig;
use crate::error::{CodecError, Error, Result};
use crate::protocol::Track;

/// Resolves a track locator to its encoded bytes. Called from a blocking
/// thread, so implementations may do synchronous IO.
pub trait TrackLoader: Send + Sync {
    fn fetch(&self, track: &Track) -> Result<Vec<u8>>;
}

/// Reads locators as file paths, relative ones under `root`
#[derive(Debug, Clone, Default)]
pub struct FileLoader {
    root: Option<PathBuf>,
}

impl FileLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
        }
    }

    fn resolve(&self, locator: &str) -> PathBuf {
        let path = Path::new(locator);
        match &self.root {
            Some(root) if path.is_relative() => root.join(path),
            _ => path.to_path_buf(),
        }
    }
}

impl TrackLoader for FileLoader {
    fn fetch(&self, track: &Track) -> Result<Vec<u8>> {
        let path = self.resolve(&track.locator);
        tracing::debug!("Reading {}", path.display());
        Ok(std::fs::read(path)?)
    }
}

/// In-memory sources keyed by locator
#[derive(Default)]
pub struct MemoryLoader {
    sources: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the bytes behind a locator
    pub fn insert(&self, locator: impl Into<String>, bytes: Vec<u8>) {
        self.sources.write().insert(locator.into(), bytes);
    }

    pub fn remove(&self, locator: &str) -> Option<Vec<u8>> {
        self.sources.write().remove(locator)
    }

    pub fn contains(&self, locator: &str) -> bool {
        self.sources.read().contains_key(locator)
    }
}

impl TrackLoader for MemoryLoader {
    fn fetch(&self, track: &Track) -> Result<Vec<u8>> {
        self.sources
            .read()
            .get(&track.locator)
            .cloned()
            .ok_or_else(|| {
                Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no source for {}", track.locator),
                ))
            })
    }
}

/// Fetch and decode a track into a playable buffer
pub fn load_track(
    loader: &dyn TrackLoader,
    track: &Track,
    stream: &StreamConfig,
) -> Result<PcmBuffer> {
    let bytes = loader.fetch(track)?;
    let buffer = decode_track(track, bytes, stream)?;
    if buffer.is_empty() {
        return Err(CodecError::DecodeFailed(format!("{} contains no audio", track.locator)).into());
    }
    tracing::debug!(
        "Loaded {} ({:.2}s, {} Hz, {} ch)",
        track.locator,
        buffer.duration(),
        buffer.sample_rate,
        buffer.channels
    );
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::decoder::tests::wav_bytes;

    #[test]
    fn test_memory_loader() {
        let loader = MemoryLoader::new();
        let track = Track::file("a.wav");
        assert!(matches!(loader.fetch(&track), Err(Error::Io(_))));

        loader.insert("a.wav", wav_bytes(&[0; 160], 16000, 1));
        let buffer = load_track(&loader, &track, &StreamConfig::default()).unwrap();
        assert!((buffer.duration() - 0.01).abs() < 1e-9);

        loader.insert("a.wav", b"garbage".to_vec());
        assert!(matches!(
            load_track(&loader, &track, &StreamConfig::default()),
            Err(Error::Codec(_))
        ));
    }

    #[test]
    fn test_file_loader_resolves_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.wav"), wav_bytes(&[0; 80], 8000, 1)).unwrap();

        let loader = FileLoader::with_root(dir.path());
        let buffer =
            load_track(&loader, &Track::file("clip.wav"), &StreamConfig::default()).unwrap();
        assert_eq!(buffer.frames(), 80);

        let absolute = dir.path().join("clip.wav");
        let track = Track::file(absolute.to_string_lossy());
        assert!(FileLoader::new().fetch(&track).is_ok());
        assert!(loader.fetch(&Track::file("missing.wav")).is_err());
    }
}
