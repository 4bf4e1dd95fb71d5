//! Pure release-condition evaluation.

use crate::model::{Dossier, DossierState};
use crate::quorum;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Where a dossier sits in its lifecycle at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecyclePhase {
    /// Countdown running.
    Active,
    /// Countdown frozen by the owner.
    Paused,
    /// Countdown expired; guardian quorum still outstanding.
    AwaitingQuorum,
    /// Countdown expired and every gate is satisfied.
    Releasable,
    Released,
    Disabled,
}

impl LifecyclePhase {
    pub fn is_decryptable(self) -> bool {
        matches!(self, LifecyclePhase::Releasable | LifecyclePhase::Released)
    }
}

/// Stateless evaluator. Never touches the ledger.
pub struct ConditionEvaluator;

impl ConditionEvaluator {
    pub fn should_stay_encrypted(dossier: &Dossier, now: DateTime<Utc>) -> bool {
        !Self::phase(dossier, now).is_decryptable()
    }

    pub fn phase(dossier: &Dossier, now: DateTime<Utc>) -> LifecyclePhase {
        match dossier.state {
            DossierState::Released => LifecyclePhase::Released,
            DossierState::Disabled => LifecyclePhase::Disabled,
            DossierState::Paused { .. } => LifecyclePhase::Paused,
            DossierState::Active => {
                if Self::remaining(dossier, now) > Duration::zero() {
                    LifecyclePhase::Active
                } else if !quorum::is_gated(dossier) || quorum::threshold_met(dossier) {
                    LifecyclePhase::Releasable
                } else {
                    LifecyclePhase::AwaitingQuorum
                }
            }
        }
    }

    /// Time left on the countdown. Frozen at the pause instant while paused;
    /// negative once expired.
    pub fn remaining(dossier: &Dossier, now: DateTime<Utc>) -> Duration {
        let measured_at = match dossier.state {
            DossierState::Paused { since } => since,
            _ => now,
        };
        dossier.deadline() - measured_at
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::fixtures::{address, record};
    use crate::model::DossierRecord;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).single().expect("timestamp")
    }

    fn dossier(rec: DossierRecord) -> Dossier {
        Dossier::try_from(rec).expect("valid record")
    }

    #[test]
    fn time_only_dossier_releases_on_expiry() {
        let d = dossier(record(0, 0, 60));
        assert!(ConditionEvaluator::should_stay_encrypted(&d, at(0)));
        assert!(ConditionEvaluator::should_stay_encrypted(&d, at(59)));
        assert!(!ConditionEvaluator::should_stay_encrypted(&d, at(60)));
        assert!(!ConditionEvaluator::should_stay_encrypted(&d, at(61)));
    }

    #[test]
    fn guarded_dossier_needs_quorum_after_expiry() {
        let mut rec = record(0, 0, 60);
        rec.guardians = vec![address(0x11), address(0x12)];
        rec.guardian_threshold = 2;
        rec.guardian_confirmation_count = 2;
        let met = dossier(rec.clone());
        // Quorum alone never releases early.
        assert!(ConditionEvaluator::should_stay_encrypted(&met, at(30)));
        assert!(!ConditionEvaluator::should_stay_encrypted(&met, at(61)));

        rec.guardian_confirmation_count = 1;
        let short = dossier(rec);
        assert_eq!(
            ConditionEvaluator::phase(&short, at(61)),
            LifecyclePhase::AwaitingQuorum
        );
    }

    #[test]
    fn zero_threshold_is_ungated() {
        let mut rec = record(0, 0, 60);
        rec.guardians = vec![address(0x11)];
        rec.guardian_threshold = 0;
        assert!(!ConditionEvaluator::should_stay_encrypted(&dossier(rec), at(61)));
    }

    #[test]
    fn released_short_circuits_and_disabled_never_releases() {
        let mut rec = record(0, 0, 3_600);
        rec.is_released = true;
        rec.is_active = false;
        assert!(!ConditionEvaluator::should_stay_encrypted(&dossier(rec.clone()), at(1)));

        rec.is_released = false;
        rec.is_permanently_disabled = true;
        assert!(ConditionEvaluator::should_stay_encrypted(&dossier(rec), at(1_000_000)));
    }

    #[test]
    fn paused_dossier_freezes_remaining_time() {
        let mut rec = record(0, 0, 60);
        rec.is_active = false;
        rec.paused_at = Some(20);
        let d = dossier(rec);
        assert!(ConditionEvaluator::should_stay_encrypted(&d, at(10_000)));
        assert_eq!(ConditionEvaluator::remaining(&d, at(10_000)), Duration::seconds(40));
    }

    #[test]
    fn frozen_time_extends_deadline() {
        let mut rec = record(0, 0, 60);
        rec.frozen_secs = 30;
        let d = dossier(rec);
        assert!(ConditionEvaluator::should_stay_encrypted(&d, at(75)));
        assert!(!ConditionEvaluator::should_stay_encrypted(&d, at(90)));
    }

    #[test]
    fn overflowing_countdown_stays_sealed() {
        let mut d = dossier(record(0, 0, 60));
        d.check_in_interval = Duration::try_days(100_000_000).expect("fits a delta");
        assert!(ConditionEvaluator::should_stay_encrypted(&d, at(1_000_000_000)));
        assert_eq!(ConditionEvaluator::phase(&d, at(1_000_000_000)), LifecyclePhase::Active);
    }
}
