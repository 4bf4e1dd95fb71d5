//! Guardian confirmations gating release after the countdown expires.

use crate::cancel::CancelSignal;
use crate::clock::Clock;
use crate::condition::ConditionEvaluator;
use crate::config::{GuardianPolicy, RetryPolicy, TimeoutConfig};
use crate::error::CanaryError;
use crate::ledger::{Ledger, Mutation};
use crate::model::{Address, Dossier, DossierRef};
use crate::retry::{retry_transient, with_deadline};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info};

/// Whether release waits on guardians at all.
pub fn is_gated(dossier: &Dossier) -> bool {
    !dossier.guardians.is_empty() && dossier.guardian_threshold > 0
}

pub fn threshold_met(dossier: &Dossier) -> bool {
    dossier.guardian_confirmation_count >= dossier.guardian_threshold
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConfirmOutcome {
    Recorded,
    /// This guardian had already confirmed; nothing was written.
    AlreadyConfirmed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianStatus {
    pub guardian: Address,
    pub confirmed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuorumProgress {
    pub confirmations: u32,
    pub threshold: u32,
    pub guardians: Vec<GuardianStatus>,
}

impl QuorumProgress {
    pub fn is_met(&self) -> bool {
        self.confirmations >= self.threshold
    }
}

/// Ledger-backed bookkeeping for guardian attestations. Every decision is
/// taken against a fresh read.
pub struct GuardianQuorum {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    policy: GuardianPolicy,
    retry: RetryPolicy,
    timeouts: TimeoutConfig,
}

impl GuardianQuorum {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        policy: GuardianPolicy,
        retry: RetryPolicy,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            ledger,
            clock,
            policy,
            retry,
            timeouts,
        }
    }

    pub(crate) async fn load(&self, dossier: &DossierRef) -> Result<Dossier, CanaryError> {
        load_dossier(self.ledger.as_ref(), &self.timeouts, dossier).await
    }

    /// Record `guardian`'s attestation. Re-confirming is a no-op.
    pub async fn confirm(
        &self,
        dossier: &DossierRef,
        guardian: &Address,
        cancel: &CancelSignal,
    ) -> Result<ConfirmOutcome, CanaryError> {
        let current = self.load(dossier).await?;
        if !current.is_guardian(guardian) {
            return Err(CanaryError::Unauthorized(format!(
                "{} is not a guardian of {}",
                guardian, dossier
            )));
        }
        if current.state.is_terminal() {
            return Err(CanaryError::StateInconsistency(format!(
                "dossier {} is {}; confirmations are closed",
                dossier, current.state
            )));
        }
        if self.has_confirmed(dossier, guardian).await? {
            debug!(dossier = %dossier, guardian = %guardian, "guardian already confirmed");
            return Ok(ConfirmOutcome::AlreadyConfirmed);
        }

        let now = self.clock.now();
        if !self.policy.allow_pre_expiry_confirmation
            && ConditionEvaluator::remaining(&current, now) > Duration::zero()
        {
            return Err(CanaryError::Invalid(format!(
                "dossier {} has not expired; confirmations open after the countdown",
                dossier
            )));
        }

        let ledger = self.ledger.clone();
        let write_budget = self.timeouts.ledger_write();
        retry_transient(&self.retry, cancel, "confirm_release", |attempt| {
            let ledger = ledger.clone();
            let dossier = dossier.clone();
            let guardian = guardian.clone();
            async move {
                // A retried write may already have landed.
                if attempt > 1 && ledger.confirmation(&dossier, &guardian).await?.is_some() {
                    return Ok(());
                }
                with_deadline(
                    write_budget,
                    "confirm_release",
                    ledger.write(&guardian, Mutation::ConfirmRelease { dossier: dossier.clone() }),
                )
                .await
                .map(|_| ())
            }
        })
        .await?;

        info!(dossier = %dossier, guardian = %guardian, "guardian confirmation recorded");
        Ok(ConfirmOutcome::Recorded)
    }

    pub async fn threshold_met(&self, dossier: &DossierRef) -> Result<bool, CanaryError> {
        Ok(threshold_met(&self.load(dossier).await?))
    }

    pub async fn has_confirmed(
        &self,
        dossier: &DossierRef,
        guardian: &Address,
    ) -> Result<bool, CanaryError> {
        let found = with_deadline(
            self.timeouts.ledger_read(),
            "confirmation lookup",
            self.ledger.confirmation(dossier, guardian),
        )
        .await?;
        Ok(found.is_some())
    }

    pub async fn progress(&self, dossier: &DossierRef) -> Result<QuorumProgress, CanaryError> {
        let current = self.load(dossier).await?;
        let mut guardians = Vec::with_capacity(current.guardians.len());
        for guardian in &current.guardians {
            let confirmed_at = with_deadline(
                self.timeouts.ledger_read(),
                "confirmation lookup",
                self.ledger.confirmation(dossier, guardian),
            )
            .await?
            .map(|c| c.confirmed_at);
            guardians.push(GuardianStatus {
                guardian: guardian.clone(),
                confirmed_at,
            });
        }
        Ok(QuorumProgress {
            confirmations: current.guardian_confirmation_count,
            threshold: current.guardian_threshold,
            guardians,
        })
    }
}

/// Fresh read of `key`, verified against the key it was stored under.
pub async fn load_dossier(
    ledger: &dyn Ledger,
    timeouts: &TimeoutConfig,
    key: &DossierRef,
) -> Result<Dossier, CanaryError> {
    let record = with_deadline(timeouts.ledger_read(), "ledger read", ledger.read(key))
        .await?
        .ok_or_else(|| CanaryError::NotFound(format!("dossier {}", key)))?;
    record.verify_key(key)?;
    Dossier::try_from(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ProtocolLimits;
    use crate::ledger::NewDossier;
    use crate::memory_ledger::InMemoryLedger;
    use crate::model::fixtures::address;
    use crate::model::DossierId;

    struct Fixture {
        clock: Arc<ManualClock>,
        ledger: Arc<InMemoryLedger>,
        dossier: DossierRef,
    }

    async fn fixture(guardians: Vec<Address>, threshold: u32) -> Fixture {
        let clock = Arc::new(ManualClock::at_unix(0));
        let ledger = Arc::new(InMemoryLedger::new(clock.clone(), ProtocolLimits::default()));
        let owner = address(0xaa);
        let id = ledger
            .write(&owner, Mutation::ReserveId)
            .await
            .expect("reserve")
            .assigned_id
            .expect("id");
        ledger
            .write(
                &owner,
                Mutation::CreateDossier(NewDossier {
                    id,
                    name: "g".into(),
                    description: String::new(),
                    check_in_interval: 60,
                    encrypted_file_hashes: vec!["codex://m".into(), "codex://f".into()],
                    recipients: vec![address(0x01)],
                    guardians,
                    guardian_threshold: threshold,
                }),
            )
            .await
            .expect("create");
        Fixture {
            clock,
            ledger,
            dossier: DossierRef::new(owner, DossierId(0)),
        }
    }

    fn quorum(f: &Fixture, policy: GuardianPolicy) -> GuardianQuorum {
        GuardianQuorum::new(
            f.ledger.clone(),
            f.clock.clone(),
            policy,
            RetryPolicy::default(),
            TimeoutConfig::default(),
        )
    }

    #[tokio::test]
    async fn double_confirm_counts_once() {
        let g1 = address(0x11);
        let f = fixture(vec![g1.clone(), address(0x12)], 2).await;
        let q = quorum(&f, GuardianPolicy::default());
        let never = CancelSignal::never();

        assert_eq!(
            q.confirm(&f.dossier, &g1, &never).await.expect("first"),
            ConfirmOutcome::Recorded
        );
        assert_eq!(
            q.confirm(&f.dossier, &g1, &never).await.expect("second"),
            ConfirmOutcome::AlreadyConfirmed
        );

        let progress = q.progress(&f.dossier).await.expect("progress");
        assert_eq!(progress.confirmations, 1);
        assert!(!progress.is_met());
        assert!(q.has_confirmed(&f.dossier, &g1).await.expect("lookup"));
        assert!(!q.has_confirmed(&f.dossier, &address(0x12)).await.expect("lookup"));
    }

    #[tokio::test]
    async fn outsiders_cannot_confirm() {
        let f = fixture(vec![address(0x11)], 1).await;
        let q = quorum(&f, GuardianPolicy::default());
        let err = q
            .confirm(&f.dossier, &address(0x77), &CancelSignal::never())
            .await
            .expect_err("outsider");
        assert!(matches!(err, CanaryError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn pre_expiry_confirmation_follows_policy() {
        let g1 = address(0x11);
        let f = fixture(vec![g1.clone()], 1).await;

        let strict = quorum(
            &f,
            GuardianPolicy {
                allow_pre_expiry_confirmation: false,
            },
        );
        let err = strict
            .confirm(&f.dossier, &g1, &CancelSignal::never())
            .await
            .expect_err("too early");
        assert!(matches!(err, CanaryError::Invalid(_)));

        f.clock.advance_secs(61);
        assert_eq!(
            strict
                .confirm(&f.dossier, &g1, &CancelSignal::never())
                .await
                .expect("after expiry"),
            ConfirmOutcome::Recorded
        );
        assert!(strict.threshold_met(&f.dossier).await.expect("met"));
    }

    #[tokio::test]
    async fn ungated_dossiers_are_detected() {
        let f = fixture(vec![address(0x11)], 0).await;
        let dossier = quorum(&f, GuardianPolicy::default())
            .load(&f.dossier)
            .await
            .expect("load");
        assert!(!is_gated(&dossier));
    }
}
