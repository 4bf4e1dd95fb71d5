//! Symmetric cipher that only opens once the ledger says the dossier is releasable.

use async_trait::async_trait;
use canary_core::{
    load_dossier, CanaryError, Ciphertext, Clock, ConditionEvaluator, DecryptionEvidence,
    EncryptionCapability, Ledger, ReleaseCondition, ReleaseMode, TimeoutConfig,
};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use std::sync::Arc;
use tracing::{debug, warn};

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;
const KEY_CONTEXT: &str = "canary dossier payload 2024-01 xchacha20poly1305 key";

/// XChaCha20-Poly1305 with the serialized release condition as associated
/// data, so a payload cannot be moved to another dossier. Sealed layout:
/// nonce (24) | ciphertext and tag.
///
/// The release decision is taken from a fresh ledger read against this
/// cipher's own clock; the evidence only names the requester.
pub struct LedgerGatedCipher {
    aead: XChaCha20Poly1305,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    timeouts: TimeoutConfig,
}

impl LedgerGatedCipher {
    pub fn new(
        secret: &[u8],
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        timeouts: TimeoutConfig,
    ) -> Result<Self, CanaryError> {
        if secret.is_empty() {
            return Err(CanaryError::Fatal("cipher secret is empty".to_string()));
        }
        let key = blake3::derive_key(KEY_CONTEXT, secret);
        Ok(Self {
            aead: XChaCha20Poly1305::new(Key::from_slice(&key)),
            ledger,
            clock,
            timeouts,
        })
    }

    async fn check_release(
        &self,
        condition: &ReleaseCondition,
        evidence: &DecryptionEvidence,
    ) -> Result<(), CanaryError> {
        let dossier = load_dossier(self.ledger.as_ref(), &self.timeouts, &condition.dossier).await?;
        let now = self.clock.now();
        if ConditionEvaluator::should_stay_encrypted(&dossier, now) {
            return Err(CanaryError::ConditionNotMet(format!(
                "dossier {} is {:?}",
                condition.dossier,
                ConditionEvaluator::phase(&dossier, now)
            )));
        }
        if condition.mode == ReleaseMode::Private
            && evidence.requester != dossier.owner
            && !condition.recipients.contains(&evidence.requester)
        {
            return Err(CanaryError::ConditionNotMet(format!(
                "{} is not a recipient of {}",
                evidence.requester, condition.dossier
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl EncryptionCapability for LedgerGatedCipher {
    async fn encrypt(
        &self,
        plaintext: &[u8],
        condition: &ReleaseCondition,
    ) -> Result<Ciphertext, CanaryError> {
        let aad = serde_json::to_vec(condition)?;
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let body = self
            .aead
            .encrypt(&nonce, Payload { msg: plaintext, aad: &aad })
            .map_err(|_| CanaryError::Fatal("payload encryption failed".to_string()))?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + body.len());
        sealed.extend_from_slice(nonce.as_slice());
        sealed.extend_from_slice(&body);
        debug!(dossier = %condition.dossier, bytes = plaintext.len(), "payload sealed");
        Ok(Ciphertext {
            condition: condition.clone(),
            sealed,
        })
    }

    async fn decrypt(
        &self,
        ciphertext: &Ciphertext,
        evidence: &DecryptionEvidence,
    ) -> Result<Vec<u8>, CanaryError> {
        if ciphertext.sealed.len() < NONCE_LEN + TAG_LEN {
            return Err(CanaryError::Fatal("sealed payload is truncated".to_string()));
        }
        let (nonce, body) = ciphertext.sealed.split_at(NONCE_LEN);
        let aad = serde_json::to_vec(&ciphertext.condition)?;
        let plaintext = self
            .aead
            .decrypt(XNonce::from_slice(nonce), Payload { msg: body, aad: &aad })
            .map_err(|_| {
                warn!(dossier = %ciphertext.condition.dossier, "ciphertext failed authentication");
                CanaryError::Fatal("ciphertext failed authentication".to_string())
            })?;

        self.check_release(&ciphertext.condition, evidence).await?;
        Ok(plaintext)
    }
}
