//! Reconciles "check in now" with ledger state: pre-flight diagnosis, bulk
//! submission, and per-dossier fallback.

use crate::cancel::CancelSignal;
use crate::clock::Clock;
use crate::config::{RetryPolicy, TimeoutConfig};
use crate::error::{CanaryError, ErrorClass};
use crate::ledger::{Ledger, Mutation, TxReceipt};
use crate::model::{Address, Dossier, DossierId, DossierRecord, DossierRef, DossierState};
use crate::quorum::load_dossier;
use crate::retry::{retry_transient, with_deadline};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckInMode {
    Bulk,
    Individual,
    /// Nothing needed a transaction.
    Idle,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum FindingKind {
    /// The record under this key reports a different id.
    IdMismatch { stored: DossierId },
    /// The record under this key belongs to someone else.
    OwnerMismatch { stored: Address },
    /// Listed in the index but nothing is stored.
    Missing,
    /// Listed more than once in the index.
    DuplicateIndexEntry { occurrences: usize },
    /// Not in a state that accepts check-ins.
    NotActive { state: String },
    /// Could not be read or decoded.
    Unreadable { reason: String },
}

impl FindingKind {
    /// Findings that point at index or storage corruption rather than user state.
    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            FindingKind::IdMismatch { .. }
                | FindingKind::OwnerMismatch { .. }
                | FindingKind::Missing
                | FindingKind::DuplicateIndexEntry { .. }
        )
    }

    /// Whether the dossier must be left out of submission.
    pub fn excludes(&self) -> bool {
        !matches!(self, FindingKind::DuplicateIndexEntry { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiagnosticFinding {
    pub id: DossierId,
    pub kind: FindingKind,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnosis {
    /// Active dossiers that still need a check-in, in index order.
    pub eligible: Vec<DossierId>,
    /// Active dossiers already checked in at or after the request.
    pub current: Vec<DossierId>,
    pub findings: Vec<DiagnosticFinding>,
}

impl Diagnosis {
    pub fn integrity_findings(&self) -> usize {
        self.findings.iter().filter(|f| f.kind.is_integrity()).count()
    }

    /// Corruption outweighs healthy entries; bulk submission is not trusted.
    pub fn is_systemic(&self) -> bool {
        let broken = self.integrity_findings();
        broken > 0 && broken >= self.eligible.len()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ItemOutcome {
    CheckedIn { at: DateTime<Utc> },
    /// Ledger already holds a check-in at or after the request.
    AlreadyCurrent,
    Skipped { reason: String },
    Failed { class: ErrorClass, reason: String },
    /// Processing stopped before this dossier was reached.
    NotAttempted,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckInReport {
    pub trace_id: String,
    pub requested_at: DateTime<Utc>,
    pub mode: CheckInMode,
    pub outcomes: BTreeMap<DossierId, ItemOutcome>,
    pub findings: Vec<DiagnosticFinding>,
    /// Why bulk submission was abandoned, when it was.
    pub bulk_failure: Option<String>,
    /// Error that stopped individual processing early.
    pub halted_by: Option<ErrorClass>,
}

impl CheckInReport {
    fn new(requested_at: DateTime<Utc>, diagnosis: &Diagnosis) -> Self {
        let mut outcomes = BTreeMap::new();
        for id in &diagnosis.current {
            outcomes.insert(*id, ItemOutcome::AlreadyCurrent);
        }
        for finding in diagnosis.findings.iter().filter(|f| f.kind.excludes()) {
            outcomes.insert(
                finding.id,
                ItemOutcome::Skipped {
                    reason: describe_finding(&finding.kind),
                },
            );
        }
        Self {
            trace_id: Uuid::new_v4().to_string(),
            requested_at,
            mode: CheckInMode::Idle,
            outcomes,
            findings: diagnosis.findings.clone(),
            bulk_failure: None,
            halted_by: None,
        }
    }

    fn ids_where(&self, pred: impl Fn(&ItemOutcome) -> bool) -> Vec<DossierId> {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| pred(outcome))
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn checked_in(&self) -> Vec<DossierId> {
        self.ids_where(|o| matches!(o, ItemOutcome::CheckedIn { .. }))
    }

    pub fn failed(&self) -> Vec<DossierId> {
        self.ids_where(|o| matches!(o, ItemOutcome::Failed { .. }))
    }

    pub fn skipped(&self) -> Vec<DossierId> {
        self.ids_where(|o| matches!(o, ItemOutcome::Skipped { .. }))
    }

    /// Every eligible dossier ended up checked in or already current.
    pub fn is_complete(&self) -> bool {
        self.halted_by.is_none()
            && self
                .outcomes
                .values()
                .all(|o| !matches!(o, ItemOutcome::Failed { .. } | ItemOutcome::NotAttempted))
    }
}

fn describe_finding(kind: &FindingKind) -> String {
    match kind {
        FindingKind::IdMismatch { stored } => format!("stored record reports id {}", stored),
        FindingKind::OwnerMismatch { stored } => format!("stored record is owned by {}", stored),
        FindingKind::Missing => "listed in index but not stored".to_string(),
        FindingKind::DuplicateIndexEntry { occurrences } => {
            format!("listed {} times in index", occurrences)
        }
        FindingKind::NotActive { state } => format!("dossier is {}", state),
        FindingKind::Unreadable { reason } => format!("unreadable: {}", reason),
    }
}

/// Errors that end a check-in run instead of degrading it.
fn halts(err: &CanaryError) -> bool {
    matches!(
        err.class(),
        ErrorClass::UserDeclined | ErrorClass::ResourceExhausted | ErrorClass::Cancelled
    )
}

fn is_current(dossier: &Dossier, requested_at: DateTime<Utc>) -> bool {
    dossier.last_check_in.timestamp() >= requested_at.timestamp()
}

pub struct CheckInCoordinator {
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    timeouts: TimeoutConfig,
}

impl CheckInCoordinator {
    pub fn new(
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
        timeouts: TimeoutConfig,
    ) -> Self {
        Self {
            ledger,
            clock,
            retry,
            timeouts,
        }
    }

    /// Read back every indexed dossier and sort it into eligible, current, or a finding.
    pub async fn diagnose(
        &self,
        owner: &Address,
        requested_at: DateTime<Utc>,
        cancel: &CancelSignal,
    ) -> Result<Diagnosis, CanaryError> {
        let ledger = self.ledger.clone();
        let read_budget = self.timeouts.ledger_read();
        let index = retry_transient(&self.retry, cancel, "list_ids", |_| {
            let ledger = ledger.clone();
            let owner = owner.clone();
            async move { with_deadline(read_budget, "list_ids", ledger.list_ids(&owner)).await }
        })
        .await?;

        let mut occurrences: HashMap<DossierId, usize> = HashMap::new();
        let mut ordered = Vec::with_capacity(index.len());
        for id in &index {
            let seen = occurrences.entry(*id).or_insert(0);
            if *seen == 0 {
                ordered.push(*id);
            }
            *seen += 1;
        }

        let mut diagnosis = Diagnosis::default();
        for id in ordered {
            if let Some(&count) = occurrences.get(&id).filter(|c| **c > 1) {
                diagnosis.findings.push(DiagnosticFinding {
                    id,
                    kind: FindingKind::DuplicateIndexEntry { occurrences: count },
                });
            }

            let key = DossierRef::new(owner.clone(), id);
            let read = retry_transient(&self.retry, cancel, "read", |_| {
                let ledger = ledger.clone();
                let key = key.clone();
                async move { with_deadline(read_budget, "ledger read", ledger.read(&key)).await }
            })
            .await;

            let record = match read {
                Ok(record) => record,
                Err(CanaryError::Cancelled) => return Err(CanaryError::Cancelled),
                Err(err) => {
                    diagnosis.findings.push(DiagnosticFinding {
                        id,
                        kind: FindingKind::Unreadable {
                            reason: err.to_string(),
                        },
                    });
                    continue;
                }
            };

            match classify_record(&key, record) {
                Ok(dossier) if dossier.state != DossierState::Active => {
                    diagnosis.findings.push(DiagnosticFinding {
                        id,
                        kind: FindingKind::NotActive {
                            state: dossier.state.to_string(),
                        },
                    });
                }
                Ok(dossier) if is_current(&dossier, requested_at) => diagnosis.current.push(id),
                Ok(_) => diagnosis.eligible.push(id),
                Err(kind) => diagnosis.findings.push(DiagnosticFinding { id, kind }),
            }
        }

        for finding in &diagnosis.findings {
            warn!(
                owner = %owner,
                dossier_id = %finding.id,
                finding = %describe_finding(&finding.kind),
                "check-in pre-flight finding"
            );
        }
        Ok(diagnosis)
    }

    /// Check in every active dossier `owner` holds: one bulk transaction when the
    /// index looks sound, otherwise (or once bulk retries are spent) one
    /// transaction per dossier.
    pub async fn check_in_all(
        &self,
        owner: &Address,
        cancel: &CancelSignal,
    ) -> Result<CheckInReport, CanaryError> {
        let requested_at = self.clock.now();
        let diagnosis = self.diagnose(owner, requested_at, cancel).await?;
        let mut report = CheckInReport::new(requested_at, &diagnosis);

        if diagnosis.eligible.is_empty() {
            info!(
                owner = %owner,
                trace_id = %report.trace_id,
                current = diagnosis.current.len(),
                "no dossier needs a check-in"
            );
            return Ok(report);
        }

        if diagnosis.is_systemic() {
            warn!(
                owner = %owner,
                trace_id = %report.trace_id,
                integrity_findings = diagnosis.integrity_findings(),
                "index inconsistency is systemic, skipping bulk check-in"
            );
            report.bulk_failure = Some("index inconsistency is systemic".to_string());
        } else {
            match self
                .submit(owner, Mutation::CheckInMany { ids: diagnosis.eligible.clone() }, cancel)
                .await
            {
                Ok(receipt) => {
                    for id in &diagnosis.eligible {
                        report.outcomes.insert(
                            *id,
                            ItemOutcome::CheckedIn {
                                at: receipt.confirmed_at,
                            },
                        );
                    }
                    report.mode = CheckInMode::Bulk;
                    info!(
                        owner = %owner,
                        trace_id = %report.trace_id,
                        checked_in = diagnosis.eligible.len(),
                        skipped = report.skipped().len(),
                        "bulk check-in confirmed"
                    );
                    return Ok(report);
                }
                Err(err) if halts(&err) => return Err(err),
                Err(err) => {
                    warn!(
                        owner = %owner,
                        trace_id = %report.trace_id,
                        error = %err,
                        "bulk check-in failed, falling back to individual check-ins"
                    );
                    report.bulk_failure = Some(err.to_string());
                }
            }
        }

        report.mode = CheckInMode::Individual;
        let mut last_error = None;
        for (position, id) in diagnosis.eligible.iter().enumerate() {
            match self.check_in_item(owner, *id, requested_at, cancel).await {
                Ok(outcome) => {
                    report.outcomes.insert(*id, outcome);
                }
                Err(err) if halts(&err) => {
                    if report.checked_in().is_empty() {
                        return Err(err);
                    }
                    info!(
                        owner = %owner,
                        trace_id = %report.trace_id,
                        class = ?err.class(),
                        "individual check-ins halted"
                    );
                    report.halted_by = Some(err.class());
                    for rest in &diagnosis.eligible[position..] {
                        report.outcomes.insert(*rest, ItemOutcome::NotAttempted);
                    }
                    break;
                }
                Err(err) => {
                    warn!(
                        owner = %owner,
                        dossier_id = %id,
                        error = %err,
                        "individual check-in failed"
                    );
                    report.outcomes.insert(
                        *id,
                        ItemOutcome::Failed {
                            class: err.class(),
                            reason: err.to_string(),
                        },
                    );
                    last_error = Some(err);
                }
            }
        }

        let failed = report.failed();
        if let Some(err) = last_error {
            if failed.len() == diagnosis.eligible.len() {
                warn!(
                    owner = %owner,
                    trace_id = %report.trace_id,
                    "bulk and individual check-ins both exhausted"
                );
                return Err(err);
            }
        }

        info!(
            owner = %owner,
            trace_id = %report.trace_id,
            checked_in = report.checked_in().len(),
            failed = failed.len(),
            skipped = report.skipped().len(),
            "individual check-ins finished"
        );
        Ok(report)
    }

    /// Check in a single dossier against a fresh read.
    pub async fn check_in_one(
        &self,
        owner: &Address,
        id: DossierId,
        cancel: &CancelSignal,
    ) -> Result<ItemOutcome, CanaryError> {
        let requested_at = self.clock.now();
        self.check_in_item(owner, id, requested_at, cancel).await
    }

    async fn check_in_item(
        &self,
        owner: &Address,
        id: DossierId,
        requested_at: DateTime<Utc>,
        cancel: &CancelSignal,
    ) -> Result<ItemOutcome, CanaryError> {
        let key = DossierRef::new(owner.clone(), id);
        let mut rederived = false;
        loop {
            let ledger = self.ledger.clone();
            let timeouts = self.timeouts.clone();
            let dossier = retry_transient(&self.retry, cancel, "read", |_| {
                let ledger = ledger.clone();
                let timeouts = timeouts.clone();
                let key = key.clone();
                async move { load_dossier(ledger.as_ref(), &timeouts, &key).await }
            })
            .await?;

            if dossier.state != DossierState::Active {
                return Ok(ItemOutcome::Skipped {
                    reason: format!("dossier is {}", dossier.state),
                });
            }
            if is_current(&dossier, requested_at) {
                debug!(dossier = %key, "already checked in past the request");
                return Ok(ItemOutcome::AlreadyCurrent);
            }

            match self.submit(owner, Mutation::CheckIn { id }, cancel).await {
                Ok(receipt) => {
                    return Ok(ItemOutcome::CheckedIn {
                        at: receipt.confirmed_at,
                    })
                }
                Err(err) if err.class() == ErrorClass::StateInconsistency && !rederived => {
                    debug!(dossier = %key, error = %err, "re-deriving check-in from a fresh read");
                    rederived = true;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn submit(
        &self,
        owner: &Address,
        mutation: Mutation,
        cancel: &CancelSignal,
    ) -> Result<TxReceipt, CanaryError> {
        let ledger = self.ledger.clone();
        let write_budget = self.timeouts.ledger_write();
        let label = mutation.label();
        retry_transient(&self.retry, cancel, label, |_| {
            let ledger = ledger.clone();
            let owner = owner.clone();
            let mutation = mutation.clone();
            async move { with_deadline(write_budget, label, ledger.write(&owner, mutation)).await }
        })
        .await
    }
}

fn classify_record(
    key: &DossierRef,
    record: Option<DossierRecord>,
) -> Result<Dossier, FindingKind> {
    let record = record.ok_or(FindingKind::Missing)?;
    if record.id != key.id {
        return Err(FindingKind::IdMismatch { stored: record.id });
    }
    if record.owner != key.owner {
        return Err(FindingKind::OwnerMismatch {
            stored: record.owner,
        });
    }
    Dossier::try_from(record).map_err(|e| FindingKind::Unreadable {
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::ProtocolLimits;
    use crate::ledger::NewDossier;
    use crate::memory_ledger::InMemoryLedger;
    use crate::model::fixtures::address;
    use crate::model::GuardianConfirmation;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Wraps the reference ledger with index corruption and scripted write failures.
    struct TamperedLedger {
        inner: InMemoryLedger,
        remapped: Mutex<HashMap<DossierId, DossierId>>,
        duplicated: Mutex<Vec<DossierId>>,
        bulk_failures: Mutex<Vec<CanaryError>>,
        single_failures: Mutex<Vec<CanaryError>>,
        bulk_calls: Mutex<u32>,
    }

    impl TamperedLedger {
        fn new(clock: Arc<ManualClock>) -> Self {
            Self {
                inner: InMemoryLedger::new(clock, ProtocolLimits::default()),
                remapped: Mutex::new(HashMap::new()),
                duplicated: Mutex::new(Vec::new()),
                bulk_failures: Mutex::new(Vec::new()),
                single_failures: Mutex::new(Vec::new()),
                bulk_calls: Mutex::new(0),
            }
        }

        /// Reads of `id` return the record stored under `stored`.
        fn remap(&self, id: DossierId, stored: DossierId) {
            self.remapped.lock().expect("lock").insert(id, stored);
        }
    }

    #[async_trait]
    impl Ledger for TamperedLedger {
        async fn read(&self, dossier: &DossierRef) -> Result<Option<DossierRecord>, CanaryError> {
            let target = self
                .remapped
                .lock()
                .expect("lock")
                .get(&dossier.id)
                .copied()
                .unwrap_or(dossier.id);
            self.inner
                .read(&DossierRef::new(dossier.owner.clone(), target))
                .await
        }

        async fn write(
            &self,
            caller: &Address,
            mutation: Mutation,
        ) -> Result<TxReceipt, CanaryError> {
            match &mutation {
                Mutation::CheckInMany { ids } => {
                    *self.bulk_calls.lock().expect("lock") += 1;
                    if let Some(err) = self.bulk_failures.lock().expect("lock").pop() {
                        return Err(err);
                    }
                    let remapped = self.remapped.lock().expect("lock").clone();
                    if ids.iter().any(|id| remapped.contains_key(id)) {
                        return Err(CanaryError::Reverted("index corrupted".into()));
                    }
                }
                Mutation::CheckIn { .. } => {
                    if let Some(err) = self.single_failures.lock().expect("lock").pop() {
                        return Err(err);
                    }
                }
                _ => {}
            }
            self.inner.write(caller, mutation).await
        }

        async fn list_ids(&self, owner: &Address) -> Result<Vec<DossierId>, CanaryError> {
            let mut ids = self.inner.list_ids(owner).await?;
            ids.extend(self.duplicated.lock().expect("lock").iter().copied());
            Ok(ids)
        }

        async fn confirmation(
            &self,
            dossier: &DossierRef,
            guardian: &Address,
        ) -> Result<Option<GuardianConfirmation>, CanaryError> {
            self.inner.confirmation(dossier, guardian).await
        }

        async fn guarded_by(&self, guardian: &Address) -> Result<Vec<DossierRef>, CanaryError> {
            self.inner.guarded_by(guardian).await
        }

        async fn owners(&self) -> Result<Vec<Address>, CanaryError> {
            self.inner.owners().await
        }
    }

    struct Harness {
        clock: Arc<ManualClock>,
        ledger: Arc<TamperedLedger>,
        coordinator: CheckInCoordinator,
        owner: Address,
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            multiplier: 2.0,
            max_backoff_ms: 100,
        }
    }

    async fn harness(count: usize) -> Harness {
        let clock = Arc::new(ManualClock::at_unix(10_000));
        let ledger = Arc::new(TamperedLedger::new(clock.clone()));
        let owner = address(0xaa);
        for _ in 0..count {
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
                        name: format!("d{}", id),
                        description: String::new(),
                        check_in_interval: 3_600,
                        encrypted_file_hashes: vec!["codex://m".into(), "codex://f".into()],
                        recipients: vec![address(0x01)],
                        guardians: vec![],
                        guardian_threshold: 0,
                    }),
                )
                .await
                .expect("create");
        }
        clock.advance_secs(600);
        let coordinator = CheckInCoordinator::new(
            ledger.clone(),
            clock.clone(),
            fast_retry(),
            TimeoutConfig::default(),
        );
        Harness {
            clock,
            ledger,
            coordinator,
            owner,
        }
    }

    async fn last_check_in(h: &Harness, id: u64) -> i64 {
        h.ledger
            .inner
            .read(&DossierRef::new(h.owner.clone(), DossierId(id)))
            .await
            .expect("read")
            .expect("exists")
            .last_check_in
    }

    #[tokio::test]
    async fn bulk_excludes_only_the_mismatched_dossier() {
        let h = harness(4).await;
        h.ledger.remap(DossierId(2), DossierId(1));

        let report = h
            .coordinator
            .check_in_all(&h.owner, &CancelSignal::never())
            .await
            .expect("check-in");

        assert_eq!(report.mode, CheckInMode::Bulk);
        assert_eq!(
            report.checked_in(),
            vec![DossierId(0), DossierId(1), DossierId(3)]
        );
        assert_eq!(report.skipped(), vec![DossierId(2)]);
        assert_eq!(
            report.findings,
            vec![DiagnosticFinding {
                id: DossierId(2),
                kind: FindingKind::IdMismatch {
                    stored: DossierId(1)
                }
            }]
        );
        for id in [0, 1, 3] {
            assert_eq!(last_check_in(&h, id).await, 10_600);
        }
        assert_eq!(last_check_in(&h, 2).await, 10_000);
    }

    #[tokio::test]
    async fn inactive_dossiers_are_reported_not_fatal() {
        let h = harness(2).await;
        h.ledger
            .write(&h.owner, Mutation::Pause { id: DossierId(0) })
            .await
            .expect("pause");

        let report = h
            .coordinator
            .check_in_all(&h.owner, &CancelSignal::never())
            .await
            .expect("check-in");
        assert_eq!(report.checked_in(), vec![DossierId(1)]);
        assert_eq!(
            report.outcomes.get(&DossierId(0)),
            Some(&ItemOutcome::Skipped {
                reason: "dossier is paused".to_string()
            })
        );
        assert!(report.is_complete());
    }

    #[tokio::test]
    async fn duplicate_index_entries_are_reported_and_checked_in_once() {
        let h = harness(2).await;
        h.ledger.duplicated.lock().expect("lock").push(DossierId(1));

        let diagnosis = h
            .coordinator
            .diagnose(&h.owner, h.clock.now(), &CancelSignal::never())
            .await
            .expect("diagnose");
        assert_eq!(diagnosis.eligible, vec![DossierId(0), DossierId(1)]);
        assert_eq!(
            diagnosis.findings[0].kind,
            FindingKind::DuplicateIndexEntry { occurrences: 2 }
        );
        assert!(!diagnosis.is_systemic());
    }

    #[tokio::test(start_paused = true)]
    async fn persistent_bulk_failure_falls_back_to_individual() {
        let h = harness(3).await;
        *h.ledger.bulk_failures.lock().expect("lock") =
            vec![CanaryError::Transient("rpc 503".into()); 3];

        let report = h
            .coordinator
            .check_in_all(&h.owner, &CancelSignal::never())
            .await
            .expect("fallback succeeds");

        assert_eq!(*h.ledger.bulk_calls.lock().expect("lock"), 3);
        assert_eq!(report.mode, CheckInMode::Individual);
        assert!(report.bulk_failure.is_some());
        assert_eq!(report.checked_in().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn individual_mode_aggregates_partial_failure() {
        let h = harness(3).await;
        *h.ledger.bulk_failures.lock().expect("lock") =
            vec![CanaryError::Reverted("batch too large".into())];
        // Popped from the back: the first dossier fails permanently, the rest succeed.
        *h.ledger.single_failures.lock().expect("lock") = vec![
            CanaryError::Reverted("dossier is not active".into()),
            CanaryError::Reverted("dossier is not active".into()),
        ];

        let report = h
            .coordinator
            .check_in_all(&h.owner, &CancelSignal::never())
            .await
            .expect("partial success is reported");
        assert_eq!(report.mode, CheckInMode::Individual);
        assert_eq!(report.failed(), vec![DossierId(0)]);
        assert_eq!(report.checked_in(), vec![DossierId(1), DossierId(2)]);
        assert!(!report.is_complete());
    }

    #[tokio::test]
    async fn declined_bulk_is_surfaced_without_fallback() {
        let h = harness(2).await;
        *h.ledger.bulk_failures.lock().expect("lock") =
            vec![CanaryError::UserDeclined("user rejected".into())];

        let err = h
            .coordinator
            .check_in_all(&h.owner, &CancelSignal::never())
            .await
            .expect_err("declined");
        assert_eq!(err.class(), ErrorClass::UserDeclined);
        assert_eq!(*h.ledger.bulk_calls.lock().expect("lock"), 1);
        assert_eq!(last_check_in(&h, 0).await, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn total_failure_only_after_both_strategies() {
        let h = harness(1).await;
        *h.ledger.bulk_failures.lock().expect("lock") =
            vec![CanaryError::Transient("down".into()); 3];
        *h.ledger.single_failures.lock().expect("lock") =
            vec![CanaryError::Transient("down".into()); 3];

        let err = h
            .coordinator
            .check_in_all(&h.owner, &CancelSignal::never())
            .await
            .expect_err("everything failed");
        assert_eq!(err.class(), ErrorClass::Transient);
    }

    #[tokio::test]
    async fn check_in_behind_ledger_is_a_no_op() {
        let h = harness(1).await;
        // Another device checks in later than this request will be stamped.
        h.clock.advance_secs(100);
        h.ledger
            .write(&h.owner, Mutation::CheckIn { id: DossierId(0) })
            .await
            .expect("other device");
        h.clock.advance_secs(-50);

        let outcome = h
            .coordinator
            .check_in_one(&h.owner, DossierId(0), &CancelSignal::never())
            .await
            .expect("no-op");
        assert_eq!(outcome, ItemOutcome::AlreadyCurrent);
        assert_eq!(last_check_in(&h, 0).await, 10_700);
    }

    #[tokio::test]
    async fn check_in_one_verifies_stored_id() {
        let h = harness(2).await;
        h.ledger.remap(DossierId(1), DossierId(0));
        let err = h
            .coordinator
            .check_in_one(&h.owner, DossierId(1), &CancelSignal::never())
            .await
            .expect_err("mismatch");
        assert_eq!(err.class(), ErrorClass::StateInconsistency);
    }
}
