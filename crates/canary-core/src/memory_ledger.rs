//! Reference ledger enforcing the dossier contract rules in memory.

use crate::clock::Clock;
use crate::config::ProtocolLimits;
use crate::error::CanaryError;
use crate::ledger::{Ledger, LedgerEvent, Mutation, NewDossier, TxReceipt};
use crate::model::{Address, DossierId, DossierRecord, DossierRef, GuardianConfirmation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

/// Hash-chained event log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEntry {
    pub index: u64,
    pub sequence: u64,
    pub recorded_at: DateTime<Utc>,
    pub event: LedgerEvent,
    pub previous_hash: Option<String>,
    pub entry_hash: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OwnerBook {
    pub next_id: u64,
    #[serde(default)]
    pub reserved: BTreeSet<u64>,
    pub index: Vec<DossierId>,
    pub dossiers: BTreeMap<u64, DossierRecord>,
}

/// Serializable image of the whole ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub sequence: u64,
    pub owners: BTreeMap<Address, OwnerBook>,
    pub confirmations: Vec<GuardianConfirmation>,
    pub events: Vec<EventEntry>,
}

impl LedgerSnapshot {
    pub fn verify_chain(&self) -> bool {
        let mut previous_hash: Option<String> = None;
        for (position, entry) in self.events.iter().enumerate() {
            if entry.index != position as u64 || entry.previous_hash != previous_hash {
                return false;
            }
            let expected = compute_event_hash(
                entry.index,
                entry.sequence,
                entry.recorded_at,
                &entry.event,
                previous_hash.as_deref(),
            );
            if entry.entry_hash != expected {
                return false;
            }
            previous_hash = Some(entry.entry_hash.clone());
        }
        true
    }

    fn append_event(&mut self, event: LedgerEvent, at: DateTime<Utc>) {
        let index = self.events.len() as u64;
        let previous_hash = self.events.last().map(|e| e.entry_hash.clone());
        let entry_hash =
            compute_event_hash(index, self.sequence, at, &event, previous_hash.as_deref());
        self.events.push(EventEntry {
            index,
            sequence: self.sequence,
            recorded_at: at,
            event,
            previous_hash,
            entry_hash,
        });
    }

    fn record_mut(
        &mut self,
        owner: &Address,
        id: DossierId,
    ) -> Result<&mut DossierRecord, CanaryError> {
        self.owners
            .get_mut(owner)
            .and_then(|book| book.dossiers.get_mut(&id.0))
            .ok_or_else(|| {
                CanaryError::Reverted(format!("dossier {}/{} does not exist", owner, id))
            })
    }

    fn apply(
        &mut self,
        caller: &Address,
        mutation: Mutation,
        now: DateTime<Utc>,
        limits: &ProtocolLimits,
    ) -> Result<(Option<DossierId>, Vec<LedgerEvent>), CanaryError> {
        let now_secs = now.timestamp();
        let key = |id: DossierId| DossierRef::new(caller.clone(), id);

        match mutation {
            Mutation::ReserveId => {
                let book = self.owners.entry(caller.clone()).or_default();
                if book.dossiers.len() >= limits.max_dossiers_per_owner {
                    return Err(CanaryError::Reverted(format!(
                        "owner already holds the maximum of {} dossiers",
                        limits.max_dossiers_per_owner
                    )));
                }
                let id = DossierId(book.next_id);
                book.next_id += 1;
                book.reserved.insert(id.0);
                Ok((Some(id), vec![LedgerEvent::IdReserved { dossier: key(id) }]))
            }
            Mutation::CreateDossier(new) => {
                validate_new_dossier(&new, limits)?;
                let book = self.owners.entry(caller.clone()).or_default();
                if book.dossiers.contains_key(&new.id.0) {
                    return Err(CanaryError::Reverted(format!(
                        "dossier id {} already occupied",
                        new.id
                    )));
                }
                if !book.reserved.contains(&new.id.0) {
                    return Err(CanaryError::Reverted(format!(
                        "dossier id {} was not reserved by caller",
                        new.id
                    )));
                }
                if book.dossiers.len() >= limits.max_dossiers_per_owner {
                    return Err(CanaryError::Reverted("dossier limit reached".to_string()));
                }

                let record = DossierRecord {
                    id: new.id,
                    owner: caller.clone(),
                    name: new.name.clone(),
                    description: new.description,
                    is_active: true,
                    is_permanently_disabled: false,
                    is_released: false,
                    check_in_interval: new.check_in_interval,
                    last_check_in: now_secs,
                    encrypted_file_hashes: new.encrypted_file_hashes,
                    recipients: new.recipients,
                    guardians: new.guardians,
                    guardian_threshold: new.guardian_threshold,
                    guardian_confirmation_count: 0,
                    paused_at: None,
                    frozen_secs: 0,
                };
                book.reserved.remove(&new.id.0);
                book.dossiers.insert(new.id.0, record);
                book.index.push(new.id);
                Ok((
                    None,
                    vec![LedgerEvent::DossierCreated {
                        dossier: key(new.id),
                        name: new.name,
                    }],
                ))
            }
            Mutation::CheckIn { id } => {
                let record = self.record_mut(caller, id)?;
                ensure_active(record)?;
                apply_check_in(record, now_secs);
                Ok((None, vec![LedgerEvent::CheckInPerformed { dossier: key(id), at: now }]))
            }
            Mutation::CheckInMany { ids } => {
                if ids.is_empty() {
                    return Err(CanaryError::Reverted("no dossiers to check in".to_string()));
                }
                let unique: BTreeSet<DossierId> = ids.iter().copied().collect();
                for id in &unique {
                    ensure_active(self.record_mut(caller, *id)?)?;
                }
                let mut events = Vec::with_capacity(unique.len());
                for id in unique {
                    apply_check_in(self.record_mut(caller, id)?, now_secs);
                    events.push(LedgerEvent::CheckInPerformed { dossier: key(id), at: now });
                }
                Ok((None, events))
            }
            Mutation::Pause { id } => {
                let record = self.record_mut(caller, id)?;
                ensure_active(record)?;
                record.is_active = false;
                record.paused_at = Some(now_secs);
                Ok((None, vec![LedgerEvent::DossierPaused { dossier: key(id) }]))
            }
            Mutation::Resume { id } => {
                let record = self.record_mut(caller, id)?;
                ensure_not_terminal(record)?;
                if record.is_active {
                    return Err(CanaryError::Reverted("dossier is not paused".to_string()));
                }
                let paused_at = record.paused_at.unwrap_or(now_secs);
                record.frozen_secs += (now_secs - paused_at).max(0) as u64;
                record.paused_at = None;
                record.is_active = true;
                Ok((None, vec![LedgerEvent::DossierResumed { dossier: key(id) }]))
            }
            Mutation::AddFiles { id, locators } => {
                if locators.is_empty() {
                    return Err(CanaryError::Reverted("no files to add".to_string()));
                }
                let record = self.record_mut(caller, id)?;
                ensure_active(record)?;
                let payload_count = record.encrypted_file_hashes.len().saturating_sub(1);
                if payload_count + locators.len() > limits.max_files {
                    return Err(CanaryError::Reverted(format!(
                        "dossier would exceed {} files",
                        limits.max_files
                    )));
                }
                let count = locators.len();
                record.encrypted_file_hashes.extend(locators);
                Ok((None, vec![LedgerEvent::FilesAdded { dossier: key(id), count }]))
            }
            Mutation::UpdateInterval {
                id,
                check_in_interval,
            } => {
                limits
                    .check_interval(check_in_interval)
                    .map_err(|e| CanaryError::Reverted(e.to_string()))?;
                let record = self.record_mut(caller, id)?;
                ensure_active(record)?;
                record.check_in_interval = check_in_interval;
                Ok((
                    None,
                    vec![LedgerEvent::IntervalUpdated {
                        dossier: key(id),
                        check_in_interval,
                    }],
                ))
            }
            Mutation::ReleaseNow { id } => {
                let record = self.record_mut(caller, id)?;
                ensure_not_terminal(record)?;
                record.is_released = true;
                record.is_active = false;
                record.paused_at = None;
                Ok((None, vec![LedgerEvent::DossierReleased { dossier: key(id) }]))
            }
            Mutation::PermanentlyDisable { id } => {
                let record = self.record_mut(caller, id)?;
                ensure_not_terminal(record)?;
                record.is_permanently_disabled = true;
                record.is_active = false;
                record.paused_at = None;
                Ok((None, vec![LedgerEvent::DossierDisabled { dossier: key(id) }]))
            }
            Mutation::ConfirmRelease { dossier } => {
                let already = self
                    .confirmations
                    .iter()
                    .any(|c| c.dossier == dossier && &c.guardian == caller);
                let record = self.record_mut(&dossier.owner, dossier.id)?;
                if !record.guardians.iter().any(|g| g == caller) {
                    return Err(CanaryError::Unauthorized(format!(
                        "{} is not a guardian of {}",
                        caller, dossier
                    )));
                }
                ensure_not_terminal(record)?;
                if already {
                    return Ok((None, Vec::new()));
                }
                record.guardian_confirmation_count += 1;
                let confirmations = record.guardian_confirmation_count;
                self.confirmations.push(GuardianConfirmation {
                    dossier: dossier.clone(),
                    guardian: caller.clone(),
                    confirmed_at: now,
                });
                Ok((
                    None,
                    vec![LedgerEvent::GuardianConfirmed {
                        dossier,
                        guardian: caller.clone(),
                        confirmations,
                    }],
                ))
            }
        }
    }
}

fn ensure_not_terminal(record: &DossierRecord) -> Result<(), CanaryError> {
    if record.is_released {
        return Err(CanaryError::Reverted("dossier already released".to_string()));
    }
    if record.is_permanently_disabled {
        return Err(CanaryError::Reverted(
            "dossier permanently disabled".to_string(),
        ));
    }
    Ok(())
}

fn ensure_active(record: &DossierRecord) -> Result<(), CanaryError> {
    ensure_not_terminal(record)?;
    if !record.is_active {
        return Err(CanaryError::Reverted("dossier is not active".to_string()));
    }
    Ok(())
}

fn apply_check_in(record: &mut DossierRecord, now_secs: i64) {
    if now_secs >= record.last_check_in {
        record.last_check_in = now_secs;
        record.frozen_secs = 0;
    }
}

fn validate_new_dossier(new: &NewDossier, limits: &ProtocolLimits) -> Result<(), CanaryError> {
    let revert = |msg: String| Err(CanaryError::Reverted(msg));
    if new.name.trim().is_empty() {
        return revert("dossier name is empty".to_string());
    }
    limits
        .check_interval(new.check_in_interval)
        .map_err(|e| CanaryError::Reverted(e.to_string()))?;
    if new.recipients.is_empty() || new.recipients.len() > limits.max_recipients {
        return revert(format!(
            "recipient count {} outside 1..={}",
            new.recipients.len(),
            limits.max_recipients
        ));
    }
    // Index 0 is the manifest.
    if new.encrypted_file_hashes.len() < 2
        || new.encrypted_file_hashes.len() > limits.max_files + 1
    {
        return revert(format!(
            "dossier needs a manifest and 1..={} files",
            limits.max_files
        ));
    }
    if new.guardians.len() > limits.max_guardians {
        return revert(format!("more than {} guardians", limits.max_guardians));
    }
    if new.guardian_threshold as usize > new.guardians.len() {
        return revert(format!(
            "guardian threshold {} exceeds {} guardians",
            new.guardian_threshold,
            new.guardians.len()
        ));
    }
    Ok(())
}

/// Bounds a stored record's countdown fields before they are trusted.
fn check_persisted_timing(
    record: &DossierRecord,
    now_secs: i64,
    limits: &ProtocolLimits,
) -> Result<(), CanaryError> {
    limits.check_interval(record.check_in_interval).map_err(|_| {
        CanaryError::Fatal(format!(
            "snapshot holds {} with interval {}s outside [{}, {}]",
            record.reference(),
            record.check_in_interval,
            limits.min_interval_secs,
            limits.max_interval_secs
        ))
    })?;

    // Frozen time accrues only between the last check-in and the pause (or now).
    let reference = record.paused_at.unwrap_or(now_secs).max(record.last_check_in);
    let elapsed = reference.saturating_sub(record.last_check_in);
    if i64::try_from(record.frozen_secs).map_or(true, |frozen| frozen > elapsed) {
        return Err(CanaryError::Fatal(format!(
            "snapshot holds {} with {}s frozen but only {}s since its last check-in",
            record.reference(),
            record.frozen_secs,
            elapsed
        )));
    }
    Ok(())
}

fn compute_event_hash(
    index: u64,
    sequence: u64,
    recorded_at: DateTime<Utc>,
    event: &LedgerEvent,
    previous_hash: Option<&str>,
) -> String {
    let material = serde_json::json!({
        "index": index,
        "sequence": sequence,
        "recorded_at": recorded_at,
        "event": event,
        "previous_hash": previous_hash,
    });

    let bytes = serde_json::to_vec(&material).unwrap_or_default();
    blake3::hash(&bytes).to_hex().to_string()
}

/// In-process ledger with the same rules a deployed contract enforces.
#[derive(Debug)]
pub struct InMemoryLedger {
    clock: Arc<dyn Clock>,
    limits: ProtocolLimits,
    state: RwLock<LedgerSnapshot>,
}

impl InMemoryLedger {
    pub fn new(clock: Arc<dyn Clock>, limits: ProtocolLimits) -> Self {
        Self {
            clock,
            limits,
            state: RwLock::new(LedgerSnapshot::default()),
        }
    }

    /// Rebuild from a persisted snapshot after verifying its event chain.
    pub fn from_snapshot(
        snapshot: LedgerSnapshot,
        clock: Arc<dyn Clock>,
        limits: ProtocolLimits,
    ) -> Result<Self, CanaryError> {
        if !snapshot.verify_chain() {
            return Err(CanaryError::Fatal(
                "ledger snapshot event chain verification failed".to_string(),
            ));
        }
        for (owner, book) in &snapshot.owners {
            for (id, record) in &book.dossiers {
                if record.id.0 != *id || &record.owner != owner {
                    return Err(CanaryError::Fatal(format!(
                        "snapshot stores {} under {}/{}",
                        record.reference(),
                        owner,
                        id
                    )));
                }
                check_persisted_timing(record, clock.now().timestamp(), &limits)?;
            }
        }
        Ok(Self {
            clock,
            limits,
            state: RwLock::new(snapshot),
        })
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        self.state.read().await.clone()
    }

    pub async fn events(&self) -> Vec<EventEntry> {
        self.state.read().await.events.clone()
    }

    pub async fn verify_chain(&self) -> bool {
        self.state.read().await.verify_chain()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn read(&self, dossier: &DossierRef) -> Result<Option<DossierRecord>, CanaryError> {
        let state = self.state.read().await;
        Ok(state
            .owners
            .get(&dossier.owner)
            .and_then(|book| book.dossiers.get(&dossier.id.0))
            .cloned())
    }

    async fn write(&self, caller: &Address, mutation: Mutation) -> Result<TxReceipt, CanaryError> {
        let now = self.clock.now();
        let label = mutation.label();
        let mut state = self.state.write().await;
        let (assigned_id, events) = state.apply(caller, mutation, now, &self.limits)?;

        state.sequence += 1;
        for event in &events {
            state.append_event(event.clone(), now);
        }
        debug!(
            caller = %caller,
            mutation = label,
            sequence = state.sequence,
            "ledger write confirmed"
        );

        Ok(TxReceipt {
            tx_id: Uuid::new_v4().to_string(),
            sequence: state.sequence,
            confirmed_at: now,
            assigned_id,
            events,
        })
    }

    async fn list_ids(&self, owner: &Address) -> Result<Vec<DossierId>, CanaryError> {
        let state = self.state.read().await;
        Ok(state
            .owners
            .get(owner)
            .map(|book| book.index.clone())
            .unwrap_or_default())
    }

    async fn confirmation(
        &self,
        dossier: &DossierRef,
        guardian: &Address,
    ) -> Result<Option<GuardianConfirmation>, CanaryError> {
        let state = self.state.read().await;
        Ok(state
            .confirmations
            .iter()
            .find(|c| &c.dossier == dossier && &c.guardian == guardian)
            .cloned())
    }

    async fn guarded_by(&self, guardian: &Address) -> Result<Vec<DossierRef>, CanaryError> {
        let state = self.state.read().await;
        Ok(state
            .owners
            .values()
            .flat_map(|book| book.dossiers.values())
            .filter(|record| record.guardians.iter().any(|g| g == guardian))
            .map(DossierRecord::reference)
            .collect())
    }

    async fn owners(&self) -> Result<Vec<Address>, CanaryError> {
        let state = self.state.read().await;
        Ok(state
            .owners
            .iter()
            .filter(|(_, book)| !book.dossiers.is_empty())
            .map(|(owner, _)| owner.clone())
            .collect())
    }
}
