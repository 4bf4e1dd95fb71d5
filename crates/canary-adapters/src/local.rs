//! Placeholder storage on the local filesystem.

use async_trait::async_trait;
use canary_core::{
    CanaryError, ContentLocator, ProgressSink, StorageBackend, StorageProvider, StoredObject,
};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::debug;

const WRITE_CHUNK_BYTES: usize = 64 * 1024;

/// Last-resort backend writing into one directory. Objects survive restarts of
/// this host only, so commits through it are reported as degraded.
#[derive(Debug, Clone)]
pub struct LocalDirBackend {
    root: PathBuf,
}

impl LocalDirBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, content_id: &str) -> Result<PathBuf, CanaryError> {
        if content_id.is_empty() || !content_id.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(CanaryError::Invalid(format!(
                "'{}' is not a local content id",
                content_id
            )));
        }
        Ok(self.root.join(content_id))
    }
}

#[async_trait]
impl StorageBackend for LocalDirBackend {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Placeholder
    }

    async fn upload(
        &self,
        payload: &[u8],
        name: &str,
        progress: &dyn ProgressSink,
    ) -> Result<StoredObject, CanaryError> {
        tokio::fs::create_dir_all(&self.root)
            .await
            .map_err(|e| CanaryError::Transient(format!("create {}: {}", self.root.display(), e)))?;

        let cid = blake3::hash(payload).to_hex().to_string();
        let path = self.object_path(&cid)?;
        let tmp = path.with_extension("tmp");
        let write_err =
            |e: std::io::Error| CanaryError::Transient(format!("write {}: {}", tmp.display(), e));
        let total = payload.len() as u64;
        let mut file = tokio::fs::File::create(&tmp).await.map_err(write_err)?;
        let mut written = 0u64;
        for chunk in payload.chunks(WRITE_CHUNK_BYTES) {
            file.write_all(chunk).await.map_err(write_err)?;
            written += chunk.len() as u64;
            progress.report(written, total);
        }
        file.sync_all().await.map_err(write_err)?;
        drop(file);
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| CanaryError::Transient(format!("rename {}: {}", path.display(), e)))?;

        debug!(file = name, path = %path.display(), "stored locally");
        Ok(StoredObject {
            locator: ContentLocator::new(StorageProvider::Placeholder.scheme(), cid)?,
            size: total,
        })
    }

    async fn download(&self, locator: &ContentLocator) -> Result<Vec<u8>, CanaryError> {
        let path = self.object_path(locator.content_id())?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(CanaryError::NotFound(format!("{} not stored locally", locator)))
            }
            Err(e) => Err(CanaryError::Transient(format!("read {}: {}", path.display(), e))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canary_core::NoProgress;

    #[tokio::test]
    async fn objects_survive_a_new_backend_instance() {
        let dir = tempfile::tempdir().expect("tempdir");
        let stored = LocalDirBackend::new(dir.path())
            .upload(b"sealed bytes", "a.bin", &NoProgress)
            .await
            .expect("upload");
        assert_eq!(stored.locator.scheme(), "local");

        let reopened = LocalDirBackend::new(dir.path());
        assert!(!reopened.durable());
        assert_eq!(
            reopened.download(&stored.locator).await.expect("download"),
            b"sealed bytes".to_vec()
        );
    }

    #[tokio::test]
    async fn rejects_path_like_content_ids() {
        let dir = tempfile::tempdir().expect("tempdir");
        let backend = LocalDirBackend::new(dir.path());
        let sneaky = ContentLocator::new("local", "..").expect("locator");
        assert!(matches!(
            backend.download(&sneaky).await,
            Err(CanaryError::Invalid(_))
        ));
        let missing = ContentLocator::new("local", "abc123").expect("locator");
        assert!(matches!(
            backend.download(&missing).await,
            Err(CanaryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn large_writes_report_progress_as_they_go() {
        let dir = tempfile::tempdir().expect("tempdir");
        let payload = vec![3u8; WRITE_CHUNK_BYTES * 2 + 1];
        let seen = std::sync::Mutex::new(Vec::new());
        let sink = |loaded: u64, _total: u64| seen.lock().expect("lock").push(loaded);
        LocalDirBackend::new(dir.path())
            .upload(&payload, "big.bin", &sink)
            .await
            .expect("upload");
        let total = payload.len() as u64;
        assert_eq!(
            seen.into_inner().expect("lock"),
            vec![WRITE_CHUNK_BYTES as u64, 2 * WRITE_CHUNK_BYTES as u64, total]
        );
    }
}
