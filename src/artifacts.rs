//! Artifact storage for file-typed task outputs.
//!
//! Implementations store raw bytes under a relative key and hand back a
//! stable URL that goes into the task's output record.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use tokio::fs;

use crate::error::ArtifactError;

/// Write-side interface for task output files.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Store `bytes` under `key` and return the URL of the stored artifact.
    ///
    /// Keys are relative paths like `tasks/<id>/report.txt`. Re-putting an
    /// existing key overwrites it.
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ArtifactError>;
}

/// Artifact store backed by a local directory.
pub struct LocalArtifactStore {
    root: PathBuf,
}

impl LocalArtifactStore {
    /// Create a store rooted at `root`. The directory is created lazily on
    /// first `put`.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Resolve a key to a path under the root, rejecting keys that would
    /// escape it.
    fn resolve(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        let path = Path::new(key);
        let escapes = path.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if key.is_empty() || escapes {
            return Err(ArtifactError::InvalidKey {
                key: key.to_string(),
            });
        }
        Ok(self.root.join(path))
    }
}

#[async_trait]
impl ArtifactStore for LocalArtifactStore {
    async fn put(&self, key: &str, bytes: &[u8]) -> Result<String, ArtifactError> {
        let full_path = self.resolve(key)?;
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        fs::write(&full_path, bytes).await?;
        Ok(format!("file://{}", full_path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_store() -> (LocalArtifactStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = LocalArtifactStore::new(dir.path().to_path_buf());
        (store, dir)
    }

    #[tokio::test]
    async fn put_writes_bytes_and_returns_url() {
        let (store, dir) = test_store();
        let url = store.put("tasks/abc/report.txt", b"hello").await.unwrap();

        assert!(url.starts_with("file://"));
        let on_disk = std::fs::read(dir.path().join("tasks/abc/report.txt")).unwrap();
        assert_eq!(on_disk, b"hello");
    }

    #[tokio::test]
    async fn put_overwrites_existing_key() {
        let (store, dir) = test_store();
        store.put("out.txt", b"first").await.unwrap();
        store.put("out.txt", b"second").await.unwrap();

        let on_disk = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(on_disk, "second");
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let (store, _dir) = test_store();

        for key in ["../escape.txt", "/absolute.txt", "a/../../b.txt", ""] {
            let err = store.put(key, b"x").await.unwrap_err();
            assert!(matches!(err, ArtifactError::InvalidKey { .. }), "{key}");
        }
    }
}
