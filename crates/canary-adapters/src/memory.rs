//! In-process storage backend with scriptable faults.

use async_trait::async_trait;
use canary_core::{
    CanaryError, ContentLocator, ProgressSink, StorageBackend, StorageProvider, StoredObject,
};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

/// Content-addressed map posing as a storage network. Content ids are the
/// blake3 hash of the stored bytes.
#[derive(Debug)]
pub struct MemoryStorageBackend {
    provider: StorageProvider,
    objects: Mutex<HashMap<String, Vec<u8>>>,
    upload_failures: Mutex<VecDeque<CanaryError>>,
    always_fail: Option<String>,
    latency: Option<Duration>,
}

impl MemoryStorageBackend {
    pub fn new(provider: StorageProvider) -> Self {
        Self {
            provider,
            objects: Mutex::new(HashMap::new()),
            upload_failures: Mutex::new(VecDeque::new()),
            always_fail: None,
            latency: None,
        }
    }

    /// Backend whose every upload fails with `reason`.
    pub fn unavailable(provider: StorageProvider, reason: impl Into<String>) -> Self {
        Self {
            always_fail: Some(reason.into()),
            ..Self::new(provider)
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Fail the next `count` uploads with `err`.
    pub fn fail_next(&self, count: usize, err: CanaryError) {
        let mut queue = self.lock_failures();
        for _ in 0..count {
            queue.push_back(err.clone());
        }
    }

    pub fn object_count(&self) -> usize {
        self.lock_objects().len()
    }

    pub fn contains(&self, locator: &ContentLocator) -> bool {
        self.lock_objects().contains_key(locator.content_id())
    }

    /// Flip one byte of a stored object. Returns false when absent or empty.
    pub fn corrupt(&self, locator: &ContentLocator) -> bool {
        match self.lock_objects().get_mut(locator.content_id()) {
            Some(bytes) if !bytes.is_empty() => {
                let last = bytes.len() - 1;
                bytes[last] ^= 0x01;
                true
            }
            _ => false,
        }
    }

    fn lock_objects(&self) -> std::sync::MutexGuard<'_, HashMap<String, Vec<u8>>> {
        self.objects.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_failures(&self) -> std::sync::MutexGuard<'_, VecDeque<CanaryError>> {
        self.upload_failures
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl StorageBackend for MemoryStorageBackend {
    fn provider(&self) -> StorageProvider {
        self.provider
    }

    async fn upload(
        &self,
        payload: &[u8],
        _name: &str,
        progress: &dyn ProgressSink,
    ) -> Result<StoredObject, CanaryError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(reason) = &self.always_fail {
            return Err(CanaryError::Transient(reason.clone()));
        }
        if let Some(err) = self.lock_failures().pop_front() {
            return Err(err);
        }

        let total = payload.len() as u64;
        progress.report(total / 2, total);
        let cid = blake3::hash(payload).to_hex().to_string();
        self.lock_objects().insert(cid.clone(), payload.to_vec());
        Ok(StoredObject {
            locator: ContentLocator::new(self.provider.scheme(), cid)?,
            size: total,
        })
    }

    async fn download(&self, locator: &ContentLocator) -> Result<Vec<u8>, CanaryError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        self.lock_objects()
            .get(locator.content_id())
            .cloned()
            .ok_or_else(|| CanaryError::NotFound(format!("{} not stored", locator)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canary_core::NoProgress;

    #[tokio::test]
    async fn stores_by_content_hash() {
        let backend = MemoryStorageBackend::new(StorageProvider::Codex);
        let a = backend.upload(b"same", "a", &NoProgress).await.expect("a");
        let b = backend.upload(b"same", "b", &NoProgress).await.expect("b");

        assert_eq!(a.locator, b.locator);
        assert_eq!(a.locator.scheme(), "codex");
        assert_eq!(backend.object_count(), 1);
        assert_eq!(backend.download(&a.locator).await.expect("get"), b"same".to_vec());
    }

    #[tokio::test]
    async fn scripted_failures_run_out() {
        let backend = MemoryStorageBackend::new(StorageProvider::Ipfs);
        backend.fail_next(2, CanaryError::Transient("gateway 502".into()));

        assert!(backend.upload(b"x", "x", &NoProgress).await.is_err());
        assert!(backend.upload(b"x", "x", &NoProgress).await.is_err());
        assert!(backend.upload(b"x", "x", &NoProgress).await.is_ok());
    }

    #[tokio::test]
    async fn corruption_changes_served_bytes() {
        let backend = MemoryStorageBackend::new(StorageProvider::Codex);
        let stored = backend.upload(b"abc", "f", &NoProgress).await.expect("put");
        assert!(backend.corrupt(&stored.locator));
        assert_eq!(backend.download(&stored.locator).await.expect("get"), b"abb".to_vec());
    }
}
