use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
};
use tokio::fs;
use tracing::{info, warn};

use crate::audio::TrackLookup;

/// Pista registrada en la biblioteca
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub id: u64,
    /// Absolute, or relative to the library file's directory.
    pub path: PathBuf,
    #[serde(default)]
    pub title: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LibraryFile {
    tracks: Vec<TrackRecord>,
}

/// Biblioteca de pistas basada en un archivo JSON
pub struct JsonTrackLibrary {
    path: PathBuf,
    base_dir: PathBuf,
    tracks: RwLock<HashMap<u64, TrackRecord>>,
}

impl JsonTrackLibrary {
    /// Opens the library. A missing file yields an empty library that is
    /// created on the first insert.
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        let library = Self {
            path,
            base_dir,
            tracks: RwLock::new(HashMap::new()),
        };
        let count = library.reload().await?;
        info!(
            "📁 Biblioteca cargada desde {}: {} pistas",
            library.path.display(),
            count
        );
        Ok(library)
    }

    /// Re-reads the file, replacing the in-memory index.
    pub async fn reload(&self) -> Result<usize> {
        let file = match fs::read_to_string(&self.path).await {
            Ok(raw) => serde_json::from_str::<LibraryFile>(&raw)
                .with_context(|| format!("biblioteca inválida: {}", self.path.display()))?,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("⚠️ Biblioteca no encontrada en {}, iniciando vacía", self.path.display());
                LibraryFile::default()
            }
            Err(e) => {
                return Err(e).with_context(|| format!("no se pudo leer {}", self.path.display()))
            }
        };

        let tracks: HashMap<u64, TrackRecord> =
            file.tracks.into_iter().map(|t| (t.id, t)).collect();
        let count = tracks.len();
        *self.tracks.write() = tracks;
        Ok(count)
    }

    /// Adds or replaces a track and persists the library.
    pub async fn insert(&self, record: TrackRecord) -> Result<()> {
        let id = record.id;
        self.tracks.write().insert(id, record);
        self.save().await?;
        info!("💾 Pista {} guardada en la biblioteca", id);
        Ok(())
    }

    pub fn get(&self, track_id: u64) -> Option<TrackRecord> {
        self.tracks.read().get(&track_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.tracks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.read().is_empty()
    }

    async fn save(&self) -> Result<()> {
        let file = {
            let tracks = self.tracks.read();
            let mut list: Vec<TrackRecord> = tracks.values().cloned().collect();
            list.sort_by_key(|t| t.id);
            LibraryFile { tracks: list }
        };

        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(&file)?;
        fs::write(&self.path, json)
            .await
            .with_context(|| format!("no se pudo escribir {}", self.path.display()))?;
        Ok(())
    }
}

impl TrackLookup for JsonTrackLibrary {
    fn filepath_for(&self, track_id: u64) -> Option<PathBuf> {
        let tracks = self.tracks.read();
        let record = tracks.get(&track_id)?;
        if record.path.is_absolute() {
            Some(record.path.clone())
        } else {
            Some(self.base_dir.join(&record.path))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_missing_library_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let library = JsonTrackLibrary::load(dir.path().join("library.json"))
            .await
            .unwrap();
        assert!(library.is_empty());
        assert_eq!(library.filepath_for(1), None);
    }

    #[tokio::test]
    async fn test_relative_paths_resolve_against_the_library_dir() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");
        std::fs::write(
            &path,
            r#"{"tracks": [
                {"id": 1, "path": "music/a.flac", "title": "A"},
                {"id": 2, "path": "/srv/b.mp3"}
            ]}"#,
        )
        .unwrap();

        let library = JsonTrackLibrary::load(&path).await.unwrap();
        assert_eq!(library.len(), 2);
        assert_eq!(library.filepath_for(1), Some(dir.path().join("music/a.flac")));
        assert_eq!(library.filepath_for(2), Some(PathBuf::from("/srv/b.mp3")));
        assert_eq!(library.get(2).unwrap().title, None);
    }

    #[tokio::test]
    async fn test_insert_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data/library.json");
        let library = JsonTrackLibrary::load(&path).await.unwrap();

        let record = TrackRecord {
            id: 9,
            path: "nine.wav".into(),
            title: Some("Nine".into()),
        };
        library.insert(record.clone()).await.unwrap();

        let reopened = JsonTrackLibrary::load(&path).await.unwrap();
        assert_eq!(reopened.get(9), Some(record));
    }

    #[tokio::test]
    async fn test_corrupt_library_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("library.json");
        std::fs::write(&path, "[1, 2").unwrap();
        assert!(JsonTrackLibrary::load(&path).await.is_err());
    }
}
