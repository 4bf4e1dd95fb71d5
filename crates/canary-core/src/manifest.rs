//! Manifest stored at `encrypted_file_hashes[0]`, describing every payload shard.

use crate::config::ProtocolLimits;
use crate::error::CanaryError;
use crate::model::{Address, DossierId, ReleaseMode};
use crate::storage::ContentLocator;
use serde::{Deserialize, Serialize};

pub const MANIFEST_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub mime_type: String,
    pub size: u64,
    /// Content id of the encrypted shard.
    pub encrypted_hash: String,
    pub storage_url: ContentLocator,
}

impl ManifestEntry {
    pub fn new(
        name: impl Into<String>,
        mime_type: impl Into<String>,
        size: u64,
        storage_url: ContentLocator,
    ) -> Self {
        Self {
            name: name.into(),
            mime_type: mime_type.into(),
            size,
            encrypted_hash: storage_url.content_id().to_string(),
            storage_url,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    pub dossier_id: DossierId,
    pub owner: Address,
    pub name: String,
    /// Unix seconds.
    pub created_at: i64,
    pub check_in_interval: u64,
    pub release_mode: ReleaseMode,
    pub recipients: Vec<Address>,
    pub files: Vec<ManifestEntry>,
}

impl Manifest {
    /// Every problem found, empty when valid.
    pub fn validation_errors(&self, limits: &ProtocolLimits) -> Vec<String> {
        let mut errors = Vec::new();

        if self.version != MANIFEST_VERSION {
            errors.push(format!("unsupported manifest version '{}'", self.version));
        }
        if self.name.trim().is_empty() {
            errors.push("name must be non-empty".to_string());
        }
        if self.created_at <= 0 {
            errors.push("created_at must be a positive timestamp".to_string());
        }
        if let Err(err) = limits.check_interval(self.check_in_interval) {
            errors.push(err.to_string());
        }
        if self.recipients.is_empty() {
            errors.push("at least one recipient is required".to_string());
        }
        if self.release_mode != ReleaseMode::for_recipient_count(self.recipients.len()) {
            errors.push(format!(
                "release mode {} does not match {} recipient(s)",
                self.release_mode,
                self.recipients.len()
            ));
        }
        if self.files.is_empty() {
            errors.push("files must be non-empty".to_string());
        } else if self.files.len() > limits.max_files {
            errors.push(format!("more than {} files", limits.max_files));
        }
        for (index, file) in self.files.iter().enumerate() {
            if file.name.trim().is_empty() {
                errors.push(format!("file {} has an empty name", index));
            }
            if file.mime_type.trim().is_empty() {
                errors.push(format!("file {} has no MIME type", index));
            }
            if file.encrypted_hash != file.storage_url.content_id() {
                errors.push(format!(
                    "file {} hash '{}' does not match its storage url",
                    index, file.encrypted_hash
                ));
            }
        }
        errors
    }

    pub fn validate(&self, limits: &ProtocolLimits) -> Result<(), CanaryError> {
        let errors = self.validation_errors(limits);
        if errors.is_empty() {
            Ok(())
        } else {
            Err(CanaryError::Invalid(format!(
                "invalid manifest: {}",
                errors.join(", ")
            )))
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CanaryError> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CanaryError> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn file_name(&self) -> String {
        format!("dossier_{}_manifest.json", self.dossier_id)
    }
}
