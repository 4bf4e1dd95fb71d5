//! Ordered-fallback commit of encrypted payloads to content-addressed storage.

use crate::error::CanaryError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Storage networks and services, in default priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageProvider {
    Codex,
    Pinata,
    Ipfs,
    Placeholder,
}

impl StorageProvider {
    /// URI scheme of locators this provider hands out.
    pub fn scheme(self) -> &'static str {
        match self {
            StorageProvider::Codex => "codex",
            StorageProvider::Pinata | StorageProvider::Ipfs => "ipfs",
            StorageProvider::Placeholder => "local",
        }
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageProvider::Codex => write!(f, "codex"),
            StorageProvider::Pinata => write!(f, "pinata"),
            StorageProvider::Ipfs => write!(f, "ipfs"),
            StorageProvider::Placeholder => write!(f, "placeholder"),
        }
    }
}

/// `scheme://content-id` reference to a stored object.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContentLocator {
    scheme: String,
    content_id: String,
}

impl ContentLocator {
    pub fn new(
        scheme: impl Into<String>,
        content_id: impl Into<String>,
    ) -> Result<Self, CanaryError> {
        let scheme = scheme.into().to_ascii_lowercase();
        let content_id = content_id.into();
        if scheme.is_empty()
            || !scheme
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '-' || c == '.')
        {
            return Err(CanaryError::Invalid(format!("malformed locator scheme '{}'", scheme)));
        }
        if content_id.is_empty() || content_id.contains(char::is_whitespace) {
            return Err(CanaryError::Invalid(format!(
                "malformed content id '{}'",
                content_id
            )));
        }
        Ok(Self { scheme, content_id })
    }

    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    pub fn content_id(&self) -> &str {
        &self.content_id
    }

    /// HTTP gateway URL for IPFS locators.
    pub fn gateway_url(&self, gateway: &str) -> Option<String> {
        (self.scheme == "ipfs")
            .then(|| format!("{}/ipfs/{}", gateway.trim_end_matches('/'), self.content_id))
    }
}

impl fmt::Display for ContentLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme, self.content_id)
    }
}

impl FromStr for ContentLocator {
    type Err = CanaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (scheme, content_id) = s
            .split_once("://")
            .ok_or_else(|| CanaryError::Invalid(format!("locator '{}' lacks scheme://", s)))?;
        Self::new(scheme, content_id)
    }
}

impl TryFrom<String> for ContentLocator {
    type Error = CanaryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ContentLocator> for String {
    fn from(value: ContentLocator) -> Self {
        value.to_string()
    }
}

/// Incremental upload progress (`loaded` of `total` bytes).
pub trait ProgressSink: Send + Sync {
    fn report(&self, loaded: u64, total: u64);
}

impl<F> ProgressSink for F
where
    F: Fn(u64, u64) + Send + Sync,
{
    fn report(&self, loaded: u64, total: u64) {
        self(loaded, total)
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn report(&self, _loaded: u64, _total: u64) {}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredObject {
    pub locator: ContentLocator,
    pub size: u64,
}

/// One storage network or service.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    fn provider(&self) -> StorageProvider;

    /// Whether objects survive beyond this process and host.
    fn durable(&self) -> bool {
        self.provider() != StorageProvider::Placeholder
    }

    fn can_serve(&self, locator: &ContentLocator) -> bool {
        locator.scheme() == self.provider().scheme()
    }

    async fn upload(
        &self,
        payload: &[u8],
        name: &str,
        progress: &dyn ProgressSink,
    ) -> Result<StoredObject, CanaryError>;

    async fn download(&self, locator: &ContentLocator) -> Result<Vec<u8>, CanaryError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "result")]
pub enum AttemptOutcome {
    Success { locator: ContentLocator, size: u64 },
    Failure { reason: String },
}

/// Observability record for one provider try. Never persisted on the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageCommitAttempt {
    pub provider: StorageProvider,
    pub started_at: DateTime<Utc>,
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
}

impl StorageCommitAttempt {
    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, AttemptOutcome::Success { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    Durable,
    /// Only a non-durable placeholder accepted the payload.
    Degraded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitOutcome {
    pub locator: ContentLocator,
    pub provider: StorageProvider,
    pub size: u64,
    pub attempts: Vec<StorageCommitAttempt>,
    pub durability: Durability,
}

impl CommitOutcome {
    pub fn is_degraded(&self) -> bool {
        self.durability == Durability::Degraded
    }
}

/// Single pass over an ordered backend list. Durable backends always precede
/// non-durable ones regardless of registration order.
#[derive(Clone)]
pub struct StorageCommitPipeline {
    backends: Vec<Arc<dyn StorageBackend>>,
    attempt_timeout: Duration,
}

impl fmt::Debug for StorageCommitPipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StorageCommitPipeline")
            .field("providers", &self.providers())
            .field("attempt_timeout", &self.attempt_timeout)
            .finish()
    }
}

impl StorageCommitPipeline {
    pub fn new(backends: Vec<Arc<dyn StorageBackend>>, attempt_timeout: Duration) -> Self {
        let (mut ordered, placeholders): (Vec<_>, Vec<_>) =
            backends.into_iter().partition(|b| b.durable());
        ordered.extend(placeholders);
        Self {
            backends: ordered,
            attempt_timeout,
        }
    }

    pub fn providers(&self) -> Vec<StorageProvider> {
        self.backends.iter().map(|b| b.provider()).collect()
    }

    pub async fn commit(
        &self,
        payload: &[u8],
        filename: &str,
        progress: &dyn ProgressSink,
    ) -> Result<CommitOutcome, CanaryError> {
        if self.backends.is_empty() {
            return Err(CanaryError::Fatal(
                "no storage backends configured".to_string(),
            ));
        }

        let total = payload.len() as u64;
        let mut attempts = Vec::with_capacity(self.backends.len());

        for backend in &self.backends {
            let provider = backend.provider();
            let started_at = Utc::now();
            let clock = Instant::now();
            progress.report(0, total);

            let result = tokio::time::timeout(
                self.attempt_timeout,
                backend.upload(payload, filename, progress),
            )
            .await
            .unwrap_or_else(|_| {
                Err(CanaryError::Transient(format!(
                    "upload timed out after {}ms",
                    self.attempt_timeout.as_millis()
                )))
            });
            let duration_ms = clock.elapsed().as_millis() as u64;

            match result {
                Ok(stored) => {
                    progress.report(total, total);
                    attempts.push(StorageCommitAttempt {
                        provider,
                        started_at,
                        outcome: AttemptOutcome::Success {
                            locator: stored.locator.clone(),
                            size: stored.size,
                        },
                        duration_ms,
                    });

                    let durability = if backend.durable() {
                        Durability::Durable
                    } else {
                        warn!(
                            file = filename,
                            provider = %provider,
                            locator = %stored.locator,
                            "payload committed to non-durable placeholder storage only"
                        );
                        Durability::Degraded
                    };
                    info!(
                        file = filename,
                        provider = %provider,
                        attempts = attempts.len(),
                        "payload committed"
                    );
                    return Ok(CommitOutcome {
                        locator: stored.locator,
                        provider,
                        size: stored.size,
                        attempts,
                        durability,
                    });
                }
                Err(err) => {
                    warn!(
                        file = filename,
                        provider = %provider,
                        duration_ms,
                        error = %err,
                        "storage provider failed, trying next"
                    );
                    attempts.push(StorageCommitAttempt {
                        provider,
                        started_at,
                        outcome: AttemptOutcome::Failure {
                            reason: err.to_string(),
                        },
                        duration_ms,
                    });
                }
            }
        }

        let last_reason = attempts
            .last()
            .and_then(|a| match &a.outcome {
                AttemptOutcome::Failure { reason } => Some(reason.clone()),
                AttemptOutcome::Success { .. } => None,
            })
            .unwrap_or_default();
        Err(CanaryError::StorageExhausted {
            attempts: attempts.len(),
            last_reason,
        })
    }

    /// Download through the backend owning the locator's scheme, then any other
    /// backend able to serve it.
    pub async fn fetch(&self, locator: &ContentLocator) -> Result<Vec<u8>, CanaryError> {
        let mut candidates: Vec<&Arc<dyn StorageBackend>> = self
            .backends
            .iter()
            .filter(|b| b.provider().scheme() == locator.scheme())
            .collect();
        candidates.extend(
            self.backends
                .iter()
                .filter(|b| b.provider().scheme() != locator.scheme() && b.can_serve(locator)),
        );

        if candidates.is_empty() {
            return Err(CanaryError::NotFound(format!(
                "no storage backend serves '{}' locators",
                locator.scheme()
            )));
        }

        let mut last_error = None;
        for backend in candidates {
            match tokio::time::timeout(self.attempt_timeout, backend.download(locator)).await {
                Ok(Ok(bytes)) => {
                    debug!(locator = %locator, provider = %backend.provider(), "payload fetched");
                    return Ok(bytes);
                }
                Ok(Err(err)) => {
                    warn!(
                        locator = %locator,
                        provider = %backend.provider(),
                        error = %err,
                        "download failed"
                    );
                    last_error = Some(err);
                }
                Err(_) => {
                    warn!(locator = %locator, provider = %backend.provider(), "download timed out");
                    last_error = Some(CanaryError::Transient(format!(
                        "download of {} timed out",
                        locator
                    )));
                }
            }
        }
        Err(last_error.unwrap_or_else(|| CanaryError::NotFound(locator.to_string())))
    }
}
