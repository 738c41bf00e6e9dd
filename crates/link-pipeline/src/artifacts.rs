/// JSON artifacts shared between stages.
///
/// Writes go to a sibling `.tmp` file that is then renamed over the target, so an
/// interrupted stage never leaves a truncated artifact behind.
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::error::AppError;

pub const POSTS_INDEX: &str = "posts-index.json";
pub const EMBEDDINGS: &str = "embeddings.json";
pub const SIMILARITY_MATRIX: &str = "similarity-matrix.json";

/// Stage that produces an artifact, for error messages.
fn producer(name: &str) -> &'static str {
    match name {
        POSTS_INDEX => "build-index",
        EMBEDDINGS => "generate-embeddings",
        SIMILARITY_MATRIX => "compute-similarity",
        _ => "run",
    }
}

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    /// Read an artifact. `None` when it does not exist yet.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, AppError> {
        let path = self.path(name);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| AppError::Artifact {
                path,
                message: e.to_string(),
            })
    }

    /// Read an artifact that an earlier stage must have produced.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, AppError> {
        self.load(name)?.ok_or_else(|| AppError::MissingArtifact {
            path: self.path(name),
            stage: producer(name),
        })
    }

    pub fn save<T: Serialize>(&self, name: &str, value: &T) -> Result<(), AppError> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let json = serde_json::to_string_pretty(value).map_err(|e| AppError::Artifact {
            path: path.clone(),
            message: e.to_string(),
        })?;
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &path)?;
        debug!(path = %path.display(), "artifact written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EmbeddingEntry, EmbeddingsArtifact};

    #[test]
    fn saved_artifacts_load_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("nested"));

        let mut artifact = EmbeddingsArtifact::new("test-model", 2);
        artifact.embeddings.insert(
            "7".to_string(),
            EmbeddingEntry {
                slug: "swing".to_string(),
                vector: vec![0.5, -0.25],
                text_hash: "abc".to_string(),
            },
        );
        store.save(EMBEDDINGS, &artifact).unwrap();

        let loaded: EmbeddingsArtifact = store.require(EMBEDDINGS).unwrap();
        assert_eq!(loaded, artifact);
        assert!(!store.path("embeddings.json.tmp").exists());

        let raw = std::fs::read_to_string(store.path(EMBEDDINGS)).unwrap();
        assert!(raw.contains("\"textHash\""));
    }

    #[test]
    fn missing_and_corrupt_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        assert!(store.load::<EmbeddingsArtifact>(EMBEDDINGS).unwrap().is_none());
        let err = store.require::<EmbeddingsArtifact>(POSTS_INDEX).unwrap_err();
        assert!(matches!(err, AppError::MissingArtifact { stage: "build-index", .. }));

        std::fs::write(store.path(EMBEDDINGS), "{not json").unwrap();
        let err = store.load::<EmbeddingsArtifact>(EMBEDDINGS).unwrap_err();
        assert!(matches!(err, AppError::Artifact { .. }));
    }
}
