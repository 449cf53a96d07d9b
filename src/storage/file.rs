//! Filesystem store
//!
//! Maps image keys to files under a root directory and implements both
//! sides of the cache: `Loader` for reads and `Storage` for write-back.
//! Writes land in a temp file first and rename into place, so concurrent
//! readers never observe a partial derivative.

use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::debug;

use crate::blob::Blob;
use crate::context::Cx;
use crate::error::{Error, Result};
use crate::gateway::{Loader, Storage};

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map a key onto a path under the root. Keys that would escape the
    /// root (absolute, or containing `..`) yield `Pass` so the chain can
    /// move on.
    fn resolve(&self, key: &str) -> Result<PathBuf> {
        let key = key.trim_start_matches('/');
        if key.is_empty() {
            return Err(Error::Pass);
        }
        let relative = Path::new(key);
        let escapes = relative.components().any(|c| {
            !matches!(c, Component::Normal(_) | Component::CurDir)
        });
        if escapes {
            debug!(key, "key escapes storage root");
            return Err(Error::Pass);
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl Loader for FileStore {
    async fn load(&self, _cx: &Cx, key: &str) -> Result<Blob> {
        let path = self.resolve(key)?;
        let bytes = tokio::fs::read(&path).await?;
        Ok(Blob::new(bytes))
    }
}

#[async_trait]
impl Storage for FileStore {
    async fn save(&self, _cx: &Cx, key: &str, blob: Blob) -> Result<()> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension(format!(
            "tmp.{}.{}",
            std::process::id(),
            TMP_SEQ.fetch_add(1, Ordering::Relaxed)
        ));
        tokio::fs::write(&tmp, blob.bytes()).await?;
        match tokio::fs::rename(&tmp, &path).await {
            Ok(()) => Ok(()),
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp).await;
                Err(err.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!(
            "darkroom-filestore-{tag}-{}",
            std::process::id()
        ));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[tokio::test]
    async fn test_save_then_load_round_trip() {
        let dir = scratch("roundtrip");
        let store = FileStore::new(&dir);
        store
            .save(&Cx::root(), "a/b/c.jpg", Blob::new(&b"payload"[..]))
            .await
            .unwrap();
        let blob = store.load(&Cx::root(), "a/b/c.jpg").await.unwrap();
        assert_eq!(blob.bytes().as_ref(), b"payload");
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_missing_key_is_not_found() {
        let dir = scratch("missing");
        let store = FileStore::new(&dir);
        let err = store.load(&Cx::root(), "nope.png").await.unwrap_err();
        assert_eq!(err, Error::NotFound);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_traversal_keys_pass() {
        let dir = scratch("traversal");
        let store = FileStore::new(&dir);
        let err = store
            .load(&Cx::root(), "../outside/secret.png")
            .await
            .unwrap_err();
        assert_eq!(err, Error::Pass);
        let err = store
            .save(&Cx::root(), "a/../../x.png", Blob::new(&b"d"[..]))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Pass);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_leading_slash_is_stripped() {
        let dir = scratch("slash");
        let store = FileStore::new(&dir);
        store
            .save(&Cx::root(), "/k.bin", Blob::new(&b"x"[..]))
            .await
            .unwrap();
        assert!(dir.join("k.bin").exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_no_partial_files_left_behind() {
        let dir = scratch("tmpclean");
        let store = FileStore::new(&dir);
        store
            .save(&Cx::root(), "out.bin", Blob::new(vec![1u8; 512]))
            .await
            .unwrap();
        let leftovers: Vec<_> = std::fs::read_dir(&dir)
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp."))
            .collect();
        assert!(leftovers.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
