//! Protocol limits, retry policy and collaborator timeouts.

use crate::error::CanaryError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error(transparent)]
    Invalid(#[from] CanaryError),
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CanaryConfig {
    /// Bounds enforced before any network call
    pub limits: ProtocolLimits,

    /// Backoff for ledger writes and storage commits
    pub retry: RetryPolicy,

    /// Per-call budgets for collaborators
    pub timeouts: TimeoutConfig,

    /// Storage commit behaviour
    pub storage: StorageConfig,

    /// Guardian confirmation policy
    pub guardians: GuardianPolicy,
}

impl CanaryConfig {
    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let config = if path.exists() {
            let bytes = fs::read(path)?;
            if bytes.is_empty() {
                Self::default()
            } else {
                serde_json::from_slice(&bytes)?
            }
        } else {
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CanaryError> {
        self.limits.validate()?;
        self.retry.validate()
    }
}

/// Protocol-wide bounds on dossier shape.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProtocolLimits {
    /// Shortest check-in interval (seconds)
    pub min_interval_secs: u64,

    /// Longest check-in interval (seconds)
    pub max_interval_secs: u64,

    pub max_recipients: usize,
    pub max_guardians: usize,

    /// Payload files per dossier, excluding the manifest
    pub max_files: usize,

    pub max_dossiers_per_owner: usize,
    pub max_name_len: usize,
}

impl Default for ProtocolLimits {
    fn default() -> Self {
        Self {
            min_interval_secs: 60,
            max_interval_secs: 31_536_000,
            max_recipients: 20,
            max_guardians: 20,
            max_files: 100,
            max_dossiers_per_owner: 50,
            max_name_len: 256,
        }
    }
}

impl ProtocolLimits {
    pub fn validate(&self) -> Result<(), CanaryError> {
        if self.min_interval_secs == 0 || self.max_interval_secs < self.min_interval_secs {
            return Err(CanaryError::Fatal(format!(
                "interval bounds inverted or empty: min {}s, max {}s",
                self.min_interval_secs, self.max_interval_secs
            )));
        }
        if self.max_recipients == 0 || self.max_files == 0 || self.max_dossiers_per_owner == 0 {
            return Err(CanaryError::Fatal(
                "recipient, file and dossier ceilings must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn check_interval(&self, secs: u64) -> Result<(), CanaryError> {
        if secs < self.min_interval_secs || secs > self.max_interval_secs {
            return Err(CanaryError::Invalid(format!(
                "check-in interval {}s outside [{}s, {}s]",
                secs, self.min_interval_secs, self.max_interval_secs
            )));
        }
        Ok(())
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first
    pub max_attempts: u32,

    /// Delay before the second attempt (milliseconds)
    pub initial_backoff_ms: u64,

    pub multiplier: f64,

    /// Ceiling for a single delay (milliseconds)
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 500,
            multiplier: 2.0,
            max_backoff_ms: 8_000,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), CanaryError> {
        if self.max_attempts == 0 {
            return Err(CanaryError::Fatal(
                "retry policy needs at least one attempt".to_string(),
            ));
        }
        if !(self.multiplier.is_finite() && self.multiplier >= 1.0) {
            return Err(CanaryError::Fatal(format!(
                "retry multiplier {} must be >= 1.0",
                self.multiplier
            )));
        }
        Ok(())
    }

    /// Delay to wait after the given (1-based) failed attempt.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = (self.initial_backoff_ms as f64) * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_backoff_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

/// Collaborator call budgets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    pub ledger_read_ms: u64,
    pub ledger_write_ms: u64,

    /// Budget for one storage provider attempt
    pub storage_upload_ms: u64,

    pub encryption_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            ledger_read_ms: 10_000,
            ledger_write_ms: 60_000,
            storage_upload_ms: 120_000,
            encryption_ms: 30_000,
        }
    }
}

impl TimeoutConfig {
    pub fn ledger_read(&self) -> Duration {
        Duration::from_millis(self.ledger_read_ms)
    }

    pub fn ledger_write(&self) -> Duration {
        Duration::from_millis(self.ledger_write_ms)
    }

    pub fn storage_upload(&self) -> Duration {
        Duration::from_millis(self.storage_upload_ms)
    }

    pub fn encryption(&self) -> Duration {
        Duration::from_millis(self.encryption_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Fail creation instead of accepting a placeholder-only commit
    pub reject_degraded: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardianPolicy {
    /// Record guardian confirmations cast before the countdown expires
    pub allow_pre_expiry_confirmation: bool,
}

impl Default for GuardianPolicy {
    fn default() -> Self {
        Self {
            allow_pre_expiry_confirmation: true,
        }
    }
}
