use std::{
    fs,
    io,
    path::{Path, PathBuf},
    time::UNIX_EPOCH,
};
use tracing::debug;

use super::ChunkKey;
use crate::audio::TrackLookup;

const ARTIFACT_EXTENSION: &str = "f32";

/// Names and finds processed chunk artifacts on disk.
///
/// Keys embed a signature of the source file (length and mtime) so an edited
/// file never serves stale chunks.
#[derive(Debug, Clone)]
pub struct ChunkCacheKeys {
    cache_dir: PathBuf,
}

impl ChunkCacheKeys {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// Pure key derivation. Intensity is written in the same thousandths the
    /// in-memory key holds.
    pub fn key(chunk: &ChunkKey, signature: &str) -> String {
        format!(
            "{}_{}_{}_{:04}_{}",
            chunk.track_id, signature, chunk.preset, chunk.intensity_milli, chunk.chunk_idx
        )
    }

    /// Where the artifact for `chunk` of the file at `source` lives.
    pub fn artifact_path(&self, chunk: &ChunkKey, source: &Path) -> io::Result<PathBuf> {
        let signature = file_signature(source)?;
        Ok(self
            .cache_dir
            .join(format!("{}.{}", Self::key(chunk, &signature), ARTIFACT_EXTENSION)))
    }

    /// Existing artifact for `chunk`, if the track resolves and the file is
    /// already on disk.
    pub fn lookup(&self, tracks: &dyn TrackLookup, chunk: &ChunkKey) -> Option<PathBuf> {
        let source = tracks.filepath_for(chunk.track_id)?;
        let path = self.artifact_path(chunk, &source).ok()?;
        if path.is_file() {
            debug!("💾 Artefacto encontrado: {}", path.display());
            Some(path)
        } else {
            None
        }
    }
}

/// Short identity of a source file: byte length and modification time.
pub fn file_signature(path: &Path) -> io::Result<String> {
    let meta = fs::metadata(path)?;
    let mtime = meta
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or_default();
    Ok(format!("{:x}{:x}", meta.len(), mtime))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{MockTrackLookup, Preset};
    use mockall::predicate::eq;

    #[test]
    fn test_key_is_deterministic_and_distinguishes_fields() {
        let a = ChunkKey::new(3, Preset::Bright, 12, 0.75);
        assert_eq!(ChunkCacheKeys::key(&a, "abc"), "3_abc_bright_0750_12");
        assert_eq!(ChunkCacheKeys::key(&a, "abc"), ChunkCacheKeys::key(&a, "abc"));
        assert_ne!(
            ChunkCacheKeys::key(&a, "abc"),
            ChunkCacheKeys::key(&a.with_preset(Preset::Warm), "abc")
        );
        assert_ne!(ChunkCacheKeys::key(&a, "abc"), ChunkCacheKeys::key(&a, "abd"));
    }

    #[test]
    fn test_distinct_intensities_get_distinct_artifacts() {
        let a = ChunkKey::new(1, Preset::Warm, 0, 0.501);
        let b = ChunkKey::new(1, Preset::Warm, 0, 0.504);
        assert_ne!(a, b);
        assert_eq!(ChunkCacheKeys::key(&a, "s"), "1_s_warm_0501_0");
        assert_eq!(ChunkCacheKeys::key(&b, "s"), "1_s_warm_0504_0");
        assert_eq!(
            ChunkCacheKeys::key(&ChunkKey::new(1, Preset::Warm, 0, 1.0), "s"),
            "1_s_warm_1000_0"
        );
    }

    #[test]
    fn test_lookup_only_returns_existing_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("song.wav");
        fs::write(&source, b"not really audio").unwrap();

        let keys = ChunkCacheKeys::new(dir.path().join("chunks"));
        let chunk = ChunkKey::new(9, Preset::Gentle, 0, 1.0);

        let mut tracks = MockTrackLookup::new();
        let source_clone = source.clone();
        tracks
            .expect_filepath_for()
            .with(eq(9))
            .returning(move |_| Some(source_clone.clone()));
        tracks.expect_filepath_for().with(eq(10)).returning(|_| None);

        assert_eq!(keys.lookup(&tracks, &chunk), None);

        let path = keys.artifact_path(&chunk, &source).unwrap();
        fs::create_dir_all(keys.cache_dir()).unwrap();
        fs::write(&path, [0u8; 8]).unwrap();

        assert_eq!(keys.lookup(&tracks, &chunk), Some(path));
        assert_eq!(keys.lookup(&tracks, &ChunkKey::new(10, Preset::Gentle, 0, 1.0)), None);
    }
}
