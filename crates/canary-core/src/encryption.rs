//! Encryption capability contract. The primitive itself is external.

use crate::error::CanaryError;
use crate::model::{Address, DossierRef, ReleaseMode};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

const ENVELOPE_MAGIC: &[u8; 5] = b"CNRY1";

/// What must hold before a ciphertext may be opened.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseCondition {
    pub dossier: DossierRef,
    pub mode: ReleaseMode,
    /// Only consulted for private releases.
    pub recipients: Vec<Address>,
}

impl ReleaseCondition {
    pub fn new(dossier: DossierRef, recipients: Vec<Address>) -> Self {
        Self {
            dossier,
            mode: ReleaseMode::for_recipient_count(recipients.len()),
            recipients,
        }
    }
}

/// Context a requester presents when asking to decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecryptionEvidence {
    pub requester: Address,
    pub requested_at: DateTime<Utc>,
}

/// Sealed payload plus the condition it was sealed under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ciphertext {
    pub condition: ReleaseCondition,
    pub sealed: Vec<u8>,
}

impl Ciphertext {
    /// Storage envelope: magic, big-endian condition length, condition JSON, sealed bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, CanaryError> {
        let condition = serde_json::to_vec(&self.condition)?;
        let len = u32::try_from(condition.len())
            .map_err(|_| CanaryError::Invalid("release condition too large".to_string()))?;
        let mut out =
            Vec::with_capacity(ENVELOPE_MAGIC.len() + 4 + condition.len() + self.sealed.len());
        out.extend_from_slice(ENVELOPE_MAGIC);
        out.extend_from_slice(&len.to_be_bytes());
        out.extend_from_slice(&condition);
        out.extend_from_slice(&self.sealed);
        Ok(out)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CanaryError> {
        let malformed = || CanaryError::Fatal("malformed ciphertext envelope".to_string());
        let rest = bytes.strip_prefix(ENVELOPE_MAGIC.as_slice()).ok_or_else(malformed)?;
        if rest.len() < 4 {
            return Err(malformed());
        }
        let (len_bytes, rest) = rest.split_at(4);
        let len =
            u32::from_be_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]]) as usize;
        if rest.len() < len {
            return Err(malformed());
        }
        let (condition, sealed) = rest.split_at(len);
        Ok(Self {
            condition: serde_json::from_slice(condition)?,
            sealed: sealed.to_vec(),
        })
    }
}

/// Condition-gated encryption.
///
/// `decrypt` fails with [`CanaryError::ConditionNotMet`] when the evidence does
/// not satisfy the condition, and must never return corrupted plaintext.
#[async_trait]
pub trait EncryptionCapability: Send + Sync {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        condition: &ReleaseCondition,
    ) -> Result<Ciphertext, CanaryError>;

    async fn decrypt(
        &self,
        ciphertext: &Ciphertext,
        evidence: &DecryptionEvidence,
    ) -> Result<Vec<u8>, CanaryError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::address;
    use crate::model::DossierId;

    #[test]
    fn envelope_rejects_truncation() {
        let ct = Ciphertext {
            condition: ReleaseCondition::new(
                DossierRef::new(address(0xaa), DossierId(1)),
                vec![address(0x01), address(0x02)],
            ),
            sealed: vec![1, 2, 3, 4],
        };
        assert_eq!(ct.condition.mode, ReleaseMode::Private);
        let bytes = ct.to_bytes().expect("encode");
        assert_eq!(Ciphertext::from_bytes(&bytes).expect("decode"), ct);

        assert!(Ciphertext::from_bytes(&bytes[..8]).is_err());
        assert!(Ciphertext::from_bytes(b"not an envelope").is_err());
    }
}
