//! Top-level dossier lifecycle orchestration.

use crate::cancel::CancelSignal;
use crate::checkin::{CheckInCoordinator, CheckInReport, ItemOutcome};
use crate::clock::Clock;
use crate::condition::{ConditionEvaluator, LifecyclePhase};
use crate::config::CanaryConfig;
use crate::encryption::{Ciphertext, DecryptionEvidence, EncryptionCapability, ReleaseCondition};
use crate::error::CanaryError;
use crate::identity::IdentityProvider;
use crate::ledger::{Ledger, Mutation, NewDossier};
use crate::manifest::{Manifest, ManifestEntry, MANIFEST_VERSION};
use crate::mime::{mime_type_for, DEFAULT_MIME_TYPE};
use crate::model::{Address, Dossier, DossierId, DossierRef, DossierState, ReleaseMode};
use crate::quorum::{load_dossier, ConfirmOutcome, GuardianQuorum, QuorumProgress};
use crate::retry::{retry_transient, with_deadline};
use crate::storage::{
    CommitOutcome, ContentLocator, ProgressSink, StorageBackend, StorageCommitPipeline,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Everything the service talks to.
pub struct Collaborators {
    pub ledger: Arc<dyn Ledger>,
    pub storage: Vec<Arc<dyn StorageBackend>>,
    pub cipher: Arc<dyn EncryptionCapability>,
    pub identity: Arc<dyn IdentityProvider>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayloadFile {
    pub name: String,
    pub bytes: Vec<u8>,
    /// Inferred from the file name when absent.
    pub mime_type: Option<String>,
}

impl PayloadFile {
    pub fn new(name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            name: name.into(),
            bytes: bytes.into(),
            mime_type: None,
        }
    }

    fn resolved_mime_type(&self) -> String {
        self.mime_type
            .clone()
            .unwrap_or_else(|| mime_type_for(&self.name).to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDossierRequest {
    pub name: String,
    pub description: String,
    pub check_in_interval: Duration,
    pub recipients: Vec<String>,
    pub guardians: Vec<String>,
    pub guardian_threshold: u32,
    pub files: Vec<PayloadFile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatedDossier {
    pub dossier: DossierRef,
    pub manifest: CommitOutcome,
    pub files: Vec<CommitOutcome>,
    /// Degraded-durability notices the caller should surface.
    pub warnings: Vec<String>,
}

impl CreatedDossier {
    pub fn is_degraded(&self) -> bool {
        self.manifest.is_degraded() || self.files.iter().any(CommitOutcome::is_degraded)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionOutcome {
    Applied,
    /// The dossier was already in the requested state; nothing was written.
    AlreadyInState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminalAction {
    ReleaseNow,
    PermanentlyDisable,
}

impl TerminalAction {
    /// Text to show before asking for acknowledgement.
    pub fn warning(self) -> &'static str {
        match self {
            TerminalAction::ReleaseNow => {
                "Releasing makes the dossier decryptable by its recipients immediately. \
                 This cannot be undone."
            }
            TerminalAction::PermanentlyDisable => {
                "Disabling permanently prevents the dossier from ever being released. \
                 This cannot be undone."
            }
        }
    }
}

/// Proof that the caller was shown [`TerminalAction::warning`] and accepted it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TerminalAck {
    action: TerminalAction,
}

impl TerminalAck {
    pub fn acknowledge(action: TerminalAction) -> Self {
        Self { action }
    }

    pub fn action(&self) -> TerminalAction {
        self.action
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DossierStatus {
    pub dossier: DossierRef,
    pub name: String,
    pub state: DossierState,
    pub phase: LifecyclePhase,
    pub last_check_in: DateTime<Utc>,
    pub deadline: DateTime<Utc>,
    pub remaining_secs: i64,
    pub release_mode: ReleaseMode,
    pub recipients: Vec<Address>,
    pub file_count: usize,
    pub quorum: Option<QuorumProgress>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianAssignment {
    pub dossier: DossierRef,
    pub name: String,
    pub phase: LifecyclePhase,
    pub has_confirmed: bool,
    pub confirmations: u32,
    pub threshold: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedFile {
    pub entry: ManifestEntry,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecryptedDossier {
    pub manifest: Manifest,
    pub files: Vec<DecryptedFile>,
}

struct ValidatedRequest {
    interval_secs: u64,
    recipients: Vec<Address>,
    guardians: Vec<Address>,
}

/// Façade over storage, ledger, quorum and check-in coordination.
pub struct DossierLifecycleService {
    ledger: Arc<dyn Ledger>,
    pipeline: StorageCommitPipeline,
    cipher: Arc<dyn EncryptionCapability>,
    identity: Arc<dyn IdentityProvider>,
    clock: Arc<dyn Clock>,
    coordinator: CheckInCoordinator,
    quorum: GuardianQuorum,
    config: CanaryConfig,
}

impl DossierLifecycleService {
    pub fn new(collaborators: Collaborators, config: CanaryConfig) -> Result<Self, CanaryError> {
        config.validate()?;
        let Collaborators {
            ledger,
            storage,
            cipher,
            identity,
            clock,
        } = collaborators;

        Ok(Self {
            pipeline: StorageCommitPipeline::new(storage, config.timeouts.storage_upload()),
            coordinator: CheckInCoordinator::new(
                ledger.clone(),
                clock.clone(),
                config.retry.clone(),
                config.timeouts.clone(),
            ),
            quorum: GuardianQuorum::new(
                ledger.clone(),
                clock.clone(),
                config.guardians.clone(),
                config.retry.clone(),
                config.timeouts.clone(),
            ),
            ledger,
            cipher,
            identity,
            clock,
            config,
        })
    }

    pub fn caller(&self) -> Address {
        self.identity.address()
    }

    pub fn config(&self) -> &CanaryConfig {
        &self.config
    }

    pub fn pipeline(&self) -> &StorageCommitPipeline {
        &self.pipeline
    }

    /// Evidence for the current caller at the current instant.
    pub fn evidence(&self) -> DecryptionEvidence {
        DecryptionEvidence {
            requester: self.identity.address(),
            requested_at: self.clock.now(),
        }
    }

    pub async fn create_dossier(
        &self,
        request: CreateDossierRequest,
        progress: &dyn ProgressSink,
        cancel: &CancelSignal,
    ) -> Result<CreatedDossier, CanaryError> {
        let owner = self.identity.address();
        let validated = self.validate_request(&request)?;
        let limits = &self.config.limits;

        let before = self.list_ids(&owner, cancel).await?;
        if before.len() >= limits.max_dossiers_per_owner {
            return Err(CanaryError::Invalid(format!(
                "owner already holds the maximum of {} dossiers",
                limits.max_dossiers_per_owner
            )));
        }

        self.identity.authorize("create dossier").await?;
        let reservation = self.write(&owner, Mutation::ReserveId, cancel).await?;
        let id = reservation
            .assigned_id
            .ok_or_else(|| CanaryError::Fatal("ledger did not assign a dossier id".to_string()))?;
        if before.contains(&id) {
            return Err(CanaryError::Fatal(format!(
                "ledger assigned id {} which is already in {}'s index",
                id, owner
            )));
        }
        let key = DossierRef::new(owner.clone(), id);
        let condition = ReleaseCondition::new(key.clone(), validated.recipients.clone());
        info!(
            dossier = %key,
            files = request.files.len(),
            mode = %condition.mode,
            "creating dossier"
        );

        let mut entries = Vec::with_capacity(request.files.len());
        let mut file_commits = Vec::with_capacity(request.files.len());
        for file in &request.files {
            let commit = self
                .seal_and_commit(&file.bytes, &file.name, &condition, progress, cancel)
                .await?;
            entries.push(ManifestEntry::new(
                file.name.clone(),
                file.resolved_mime_type(),
                file.bytes.len() as u64,
                commit.locator.clone(),
            ));
            file_commits.push(commit);
        }

        let manifest = Manifest {
            version: MANIFEST_VERSION.to_string(),
            dossier_id: id,
            owner: owner.clone(),
            name: request.name.clone(),
            created_at: self.clock.now().timestamp(),
            check_in_interval: validated.interval_secs,
            release_mode: condition.mode,
            recipients: validated.recipients.clone(),
            files: entries,
        };
        manifest.validate(limits)?;
        let manifest_commit = self
            .seal_and_commit(
                &manifest.to_bytes()?,
                &manifest.file_name(),
                &condition,
                progress,
                cancel,
            )
            .await?;

        let warnings: Vec<String> = std::iter::once(&manifest_commit)
            .chain(file_commits.iter())
            .filter(|c| c.is_degraded())
            .map(|c| {
                format!(
                    "{} is held only by {} storage and may be lost",
                    c.locator, c.provider
                )
            })
            .collect();
        if !warnings.is_empty() && self.config.storage.reject_degraded {
            return Err(CanaryError::StorageExhausted {
                attempts: manifest_commit.attempts.len(),
                last_reason: "only non-durable placeholder storage accepted the payload"
                    .to_string(),
            });
        }

        let locators = std::iter::once(&manifest_commit)
            .chain(file_commits.iter())
            .map(|c| c.locator.to_string())
            .collect();
        let mutation = Mutation::CreateDossier(NewDossier {
            id,
            name: request.name,
            description: request.description,
            check_in_interval: validated.interval_secs,
            encrypted_file_hashes: locators,
            recipients: validated.recipients,
            guardians: validated.guardians,
            guardian_threshold: request.guardian_threshold,
        });
        self.submit(&key, mutation, cancel, |_| true).await?;
        self.verify_created(&key, cancel).await?;

        for warning in &warnings {
            warn!(dossier = %key, "{}", warning);
        }
        info!(dossier = %key, degraded = !warnings.is_empty(), "dossier created");
        Ok(CreatedDossier {
            dossier: key,
            manifest: manifest_commit,
            files: file_commits,
            warnings,
        })
    }

    /// Check in every active dossier the caller owns.
    pub async fn check_in(&self, cancel: &CancelSignal) -> Result<CheckInReport, CanaryError> {
        let owner = self.identity.address();
        self.identity.authorize("check in all dossiers").await?;
        self.coordinator.check_in_all(&owner, cancel).await
    }

    pub async fn check_in_one(
        &self,
        id: DossierId,
        cancel: &CancelSignal,
    ) -> Result<ItemOutcome, CanaryError> {
        let owner = self.identity.address();
        self.identity.authorize("check in").await?;
        self.coordinator.check_in_one(&owner, id, cancel).await
    }

    /// Freeze the countdown.
    pub async fn pause(
        &self,
        id: DossierId,
        cancel: &CancelSignal,
    ) -> Result<TransitionOutcome, CanaryError> {
        let key = self.own(id);
        let current = self.load(&key).await?;
        match current.state {
            DossierState::Paused { .. } => Ok(TransitionOutcome::AlreadyInState),
            DossierState::Active => {
                self.identity.authorize("pause dossier").await?;
                self.submit(&key, Mutation::Pause { id }, cancel, |d| {
                    matches!(d.state, DossierState::Paused { .. })
                })
                .await?;
                info!(dossier = %key, "dossier paused");
                Ok(TransitionOutcome::Applied)
            }
            terminal => Err(terminal_error(&key, terminal)),
        }
    }

    /// Unfreeze the countdown with the remaining time it had when paused.
    pub async fn resume(
        &self,
        id: DossierId,
        cancel: &CancelSignal,
    ) -> Result<TransitionOutcome, CanaryError> {
        let key = self.own(id);
        let current = self.load(&key).await?;
        match current.state {
            DossierState::Active => Ok(TransitionOutcome::AlreadyInState),
            DossierState::Paused { .. } => {
                self.identity.authorize("resume dossier").await?;
                self.submit(&key, Mutation::Resume { id }, cancel, |d| {
                    d.state == DossierState::Active
                })
                .await?;
                info!(dossier = %key, "dossier resumed");
                Ok(TransitionOutcome::Applied)
            }
            terminal => Err(terminal_error(&key, terminal)),
        }
    }

    /// Encrypt, commit and append payload files. The manifest is not rewritten;
    /// appended shards are recovered from the record on decryption.
    pub async fn add_files(
        &self,
        id: DossierId,
        files: Vec<PayloadFile>,
        progress: &dyn ProgressSink,
        cancel: &CancelSignal,
    ) -> Result<Vec<CommitOutcome>, CanaryError> {
        let key = self.own(id);
        let current = self.require_active(&key).await?;
        if files.is_empty() {
            return Err(CanaryError::Invalid("no files to add".to_string()));
        }
        let max_files = self.config.limits.max_files;
        if current.payload_locators().len() + files.len() > max_files {
            return Err(CanaryError::Invalid(format!(
                "dossier would exceed {} files",
                max_files
            )));
        }
        validate_file_names(&files)?;

        self.identity.authorize("add files").await?;
        let condition = ReleaseCondition::new(key.clone(), current.recipients.clone());
        let mut commits = Vec::with_capacity(files.len());
        for file in &files {
            commits.push(
                self.seal_and_commit(&file.bytes, &file.name, &condition, progress, cancel)
                    .await?,
            );
        }

        let added: Vec<ContentLocator> = commits.iter().map(|c| c.locator.clone()).collect();
        let mutation = Mutation::AddFiles {
            id,
            locators: added.iter().map(ToString::to_string).collect(),
        };
        self.submit(&key, mutation, cancel, |d| {
            added.iter().all(|l| d.encrypted_file_hashes.contains(l))
        })
        .await?;
        info!(dossier = %key, added = commits.len(), "files added");
        Ok(commits)
    }

    pub async fn update_interval(
        &self,
        id: DossierId,
        interval: Duration,
        cancel: &CancelSignal,
    ) -> Result<TransitionOutcome, CanaryError> {
        let secs = interval.as_secs();
        self.config.limits.check_interval(secs)?;
        let key = self.own(id);
        let current = self.require_active(&key).await?;
        if current.check_in_interval.num_seconds() == secs as i64 {
            return Ok(TransitionOutcome::AlreadyInState);
        }

        self.identity.authorize("update check-in interval").await?;
        self.submit(
            &key,
            Mutation::UpdateInterval {
                id,
                check_in_interval: secs,
            },
            cancel,
            |d| d.check_in_interval.num_seconds() == secs as i64,
        )
        .await?;
        info!(dossier = %key, interval_secs = secs, "check-in interval updated");
        Ok(TransitionOutcome::Applied)
    }

    /// Irreversibly release the dossier to its recipients.
    pub async fn release_now(
        &self,
        id: DossierId,
        ack: TerminalAck,
        cancel: &CancelSignal,
    ) -> Result<TransitionOutcome, CanaryError> {
        self.terminal(id, ack, TerminalAction::ReleaseNow, cancel).await
    }

    /// Irreversibly prevent the dossier from ever releasing.
    pub async fn permanently_disable(
        &self,
        id: DossierId,
        ack: TerminalAck,
        cancel: &CancelSignal,
    ) -> Result<TransitionOutcome, CanaryError> {
        self.terminal(id, ack, TerminalAction::PermanentlyDisable, cancel).await
    }

    async fn terminal(
        &self,
        id: DossierId,
        ack: TerminalAck,
        action: TerminalAction,
        cancel: &CancelSignal,
    ) -> Result<TransitionOutcome, CanaryError> {
        if ack.action() != action {
            return Err(CanaryError::Invalid(format!(
                "acknowledgement covers {:?}, not {:?}",
                ack.action(),
                action
            )));
        }
        let key = self.own(id);
        let current = self.load(&key).await?;
        let (target, mutation) = match action {
            TerminalAction::ReleaseNow => (DossierState::Released, Mutation::ReleaseNow { id }),
            TerminalAction::PermanentlyDisable => {
                (DossierState::Disabled, Mutation::PermanentlyDisable { id })
            }
        };
        if current.state == target {
            return Ok(TransitionOutcome::AlreadyInState);
        }
        if current.state.is_terminal() {
            return Err(terminal_error(&key, current.state));
        }

        warn!(dossier = %key, action = ?action, "{}", action.warning());
        self.identity.authorize(mutation.label()).await?;
        self.submit(&key, mutation, cancel, |d| d.state == target).await?;
        warn!(dossier = %key, state = %target, "dossier reached terminal state");
        Ok(TransitionOutcome::Applied)
    }

    /// Record the caller's guardian attestation for someone else's dossier.
    pub async fn confirm_release(
        &self,
        dossier: &DossierRef,
        cancel: &CancelSignal,
    ) -> Result<ConfirmOutcome, CanaryError> {
        let guardian = self.identity.address();
        self.identity.authorize("confirm release").await?;
        self.quorum.confirm(dossier, &guardian, cancel).await
    }

    pub async fn has_confirmed(
        &self,
        dossier: &DossierRef,
        guardian: &Address,
    ) -> Result<bool, CanaryError> {
        self.quorum.has_confirmed(dossier, guardian).await
    }

    pub async fn threshold_met(&self, dossier: &DossierRef) -> Result<bool, CanaryError> {
        self.quorum.threshold_met(dossier).await
    }

    /// Fresh-read evaluation; never writes.
    pub async fn should_stay_encrypted(&self, dossier: &DossierRef) -> Result<bool, CanaryError> {
        let current = self.load(dossier).await?;
        Ok(ConditionEvaluator::should_stay_encrypted(&current, self.clock.now()))
    }

    pub async fn status(&self, dossier: &DossierRef) -> Result<DossierStatus, CanaryError> {
        let current = self.load(dossier).await?;
        self.describe(current).await
    }

    /// Statuses of every readable dossier in `owner`'s index.
    pub async fn list_dossiers(&self, owner: &Address) -> Result<Vec<DossierStatus>, CanaryError> {
        let ids = self.list_ids(owner, &CancelSignal::never()).await?;
        let mut seen = HashSet::new();
        let mut statuses = Vec::with_capacity(ids.len());
        for id in ids.into_iter().filter(|id| seen.insert(*id)) {
            let key = DossierRef::new(owner.clone(), id);
            match self.load(&key).await {
                Ok(current) => statuses.push(self.describe(current).await?),
                Err(err) => warn!(dossier = %key, error = %err, "skipping unreadable dossier"),
            }
        }
        Ok(statuses)
    }

    pub async fn dossiers_guarded_by(
        &self,
        guardian: &Address,
    ) -> Result<Vec<GuardianAssignment>, CanaryError> {
        let refs = with_deadline(
            self.config.timeouts.ledger_read(),
            "guarded_by",
            self.ledger.guarded_by(guardian),
        )
        .await?;
        let now = self.clock.now();
        let mut assignments = Vec::with_capacity(refs.len());
        for key in refs {
            let current = self.load(&key).await?;
            assignments.push(GuardianAssignment {
                phase: ConditionEvaluator::phase(&current, now),
                has_confirmed: self.quorum.has_confirmed(&key, guardian).await?,
                confirmations: current.guardian_confirmation_count,
                threshold: current.guardian_threshold,
                name: current.name,
                dossier: key,
            });
        }
        Ok(assignments)
    }

    /// Public-mode dossiers across all owners whose contents are open to anyone
    /// holding the locators: released, or expired with every gate satisfied.
    /// Unreadable entries are skipped.
    pub async fn released_public(&self) -> Result<Vec<DossierStatus>, CanaryError> {
        let owners =
            with_deadline(self.config.timeouts.ledger_read(), "owners", self.ledger.owners())
                .await?;
        let now = self.clock.now();
        let mut feed = Vec::new();
        for owner in owners {
            let ids = self.list_ids(&owner, &CancelSignal::never()).await?;
            let mut seen = HashSet::new();
            for id in ids.into_iter().filter(|id| seen.insert(*id)) {
                let key = DossierRef::new(owner.clone(), id);
                let current = match self.load(&key).await {
                    Ok(current) => current,
                    Err(err) => {
                        warn!(dossier = %key, error = %err, "skipping unreadable dossier in feed");
                        continue;
                    }
                };
                if current.release_mode() == ReleaseMode::Public
                    && ConditionEvaluator::phase(&current, now).is_decryptable()
                {
                    feed.push(self.describe(current).await?);
                }
            }
        }
        debug!(entries = feed.len(), "public release feed assembled");
        Ok(feed)
    }

    /// Decrypt every file of a releasable dossier. Refuses before touching the
    /// cipher when the release condition does not hold.
    pub async fn decrypt(
        &self,
        dossier: &DossierRef,
        evidence: &DecryptionEvidence,
    ) -> Result<DecryptedDossier, CanaryError> {
        let current = self.load(dossier).await?;
        let phase = ConditionEvaluator::phase(&current, self.clock.now());
        if !phase.is_decryptable() {
            return Err(CanaryError::ConditionNotMet(format!(
                "dossier {} is not releasable yet (phase {:?})",
                dossier, phase
            )));
        }

        let manifest_locator = current.manifest_locator().ok_or_else(|| {
            CanaryError::StateInconsistency(format!("dossier {} has no manifest", dossier))
        })?;
        let manifest_bytes = self.open(&current, manifest_locator, evidence).await?;
        let manifest = Manifest::from_bytes(&manifest_bytes)?;
        if manifest.dossier_id != current.id || manifest.owner != current.owner {
            return Err(CanaryError::Fatal(format!(
                "manifest at {} describes {}/{}",
                manifest_locator, manifest.owner, manifest.dossier_id
            )));
        }

        let mut files = Vec::with_capacity(current.payload_locators().len());
        for entry in &manifest.files {
            let bytes = self.open(&current, &entry.storage_url, evidence).await?;
            files.push(DecryptedFile {
                entry: entry.clone(),
                bytes,
            });
        }
        let listed: HashSet<&ContentLocator> =
            manifest.files.iter().map(|e| &e.storage_url).collect();
        for (index, locator) in current
            .payload_locators()
            .iter()
            .filter(|l| !listed.contains(l))
            .enumerate()
        {
            let bytes = self.open(&current, locator, evidence).await?;
            files.push(DecryptedFile {
                entry: ManifestEntry::new(
                    format!("appended-{}", index + 1),
                    DEFAULT_MIME_TYPE,
                    bytes.len() as u64,
                    locator.clone(),
                ),
                bytes,
            });
        }

        info!(
            dossier = %dossier,
            requester = %evidence.requester,
            files = files.len(),
            "dossier decrypted"
        );
        Ok(DecryptedDossier { manifest, files })
    }

    async fn open(
        &self,
        dossier: &Dossier,
        locator: &ContentLocator,
        evidence: &DecryptionEvidence,
    ) -> Result<Vec<u8>, CanaryError> {
        let envelope = self.pipeline.fetch(locator).await?;
        let ciphertext = Ciphertext::from_bytes(&envelope)?;
        if ciphertext.condition.dossier != dossier.reference() {
            return Err(CanaryError::Fatal(format!(
                "{} is sealed for {}, not {}",
                locator,
                ciphertext.condition.dossier,
                dossier.reference()
            )));
        }
        with_deadline(
            self.config.timeouts.encryption(),
            "decrypt",
            self.cipher.decrypt(&ciphertext, evidence),
        )
        .await
    }

    async fn seal_and_commit(
        &self,
        plaintext: &[u8],
        name: &str,
        condition: &ReleaseCondition,
        progress: &dyn ProgressSink,
        cancel: &CancelSignal,
    ) -> Result<CommitOutcome, CanaryError> {
        let ciphertext = cancel
            .guard(with_deadline(
                self.config.timeouts.encryption(),
                "encrypt",
                self.cipher.encrypt(plaintext, condition),
            ))
            .await?;
        let envelope = ciphertext.to_bytes()?;
        let pipeline = &self.pipeline;
        let envelope = &envelope;
        retry_transient(&self.config.retry, cancel, "storage_commit", move |_| {
            pipeline.commit(envelope, name, progress)
        })
        .await
    }

    async fn describe(&self, current: Dossier) -> Result<DossierStatus, CanaryError> {
        let now = self.clock.now();
        let key = current.reference();
        let quorum = if current.guardians.is_empty() {
            None
        } else {
            Some(self.quorum.progress(&key).await?)
        };
        Ok(DossierStatus {
            phase: ConditionEvaluator::phase(&current, now),
            remaining_secs: ConditionEvaluator::remaining(&current, now).num_seconds(),
            deadline: current.deadline(),
            release_mode: current.release_mode(),
            file_count: current.payload_locators().len(),
            last_check_in: current.last_check_in,
            state: current.state,
            name: current.name,
            recipients: current.recipients,
            dossier: key,
            quorum,
        })
    }

    async fn verify_created(
        &self,
        key: &DossierRef,
        cancel: &CancelSignal,
    ) -> Result<(), CanaryError> {
        let record = with_deadline(
            self.config.timeouts.ledger_read(),
            "ledger read",
            self.ledger.read(key),
        )
        .await?
            .ok_or_else(|| CanaryError::Fatal(format!("created dossier {} is not readable", key)))?;
        record
            .verify_key(key)
            .map_err(|e| {
                CanaryError::Fatal(format!("created dossier failed verification: {}", e))
            })?;

        let after = self.list_ids(&key.owner, cancel).await?;
        let occurrences = after.iter().filter(|id| **id == key.id).count();
        if occurrences != 1 {
            return Err(CanaryError::Fatal(format!(
                "dossier id {} appears {} times in {}'s index after creation",
                key.id, occurrences, key.owner
            )));
        }
        Ok(())
    }

    fn validate_request(
        &self,
        request: &CreateDossierRequest,
    ) -> Result<ValidatedRequest, CanaryError> {
        let limits = &self.config.limits;
        let name = request.name.trim();
        if name.is_empty() {
            return Err(CanaryError::Invalid("dossier name is empty".to_string()));
        }
        if name.chars().count() > limits.max_name_len {
            return Err(CanaryError::Invalid(format!(
                "dossier name longer than {} characters",
                limits.max_name_len
            )));
        }

        let interval_secs = request.check_in_interval.as_secs();
        limits.check_interval(interval_secs)?;

        let recipients = parse_addresses("recipient", &request.recipients)?;
        if recipients.is_empty() || recipients.len() > limits.max_recipients {
            return Err(CanaryError::Invalid(format!(
                "between 1 and {} recipients required, got {}",
                limits.max_recipients,
                recipients.len()
            )));
        }

        let guardians = parse_addresses("guardian", &request.guardians)?;
        if guardians.len() > limits.max_guardians {
            return Err(CanaryError::Invalid(format!(
                "at most {} guardians allowed",
                limits.max_guardians
            )));
        }
        if request.guardian_threshold as usize > guardians.len() {
            return Err(CanaryError::Invalid(format!(
                "guardian threshold {} exceeds {} guardians",
                request.guardian_threshold,
                guardians.len()
            )));
        }

        if request.files.is_empty() || request.files.len() > limits.max_files {
            return Err(CanaryError::Invalid(format!(
                "between 1 and {} files required, got {}",
                limits.max_files,
                request.files.len()
            )));
        }
        validate_file_names(&request.files)?;

        Ok(ValidatedRequest {
            interval_secs,
            recipients,
            guardians,
        })
    }

    fn own(&self, id: DossierId) -> DossierRef {
        DossierRef::new(self.identity.address(), id)
    }

    async fn load(&self, key: &DossierRef) -> Result<Dossier, CanaryError> {
        load_dossier(self.ledger.as_ref(), &self.config.timeouts, key).await
    }

    async fn require_active(&self, key: &DossierRef) -> Result<Dossier, CanaryError> {
        let current = self.load(key).await?;
        match current.state {
            DossierState::Active => Ok(current),
            other => Err(CanaryError::StateInconsistency(format!(
                "dossier {} is {}; the change requires an active dossier",
                key, other
            ))),
        }
    }

    async fn list_ids(
        &self,
        owner: &Address,
        cancel: &CancelSignal,
    ) -> Result<Vec<DossierId>, CanaryError> {
        let ledger = &self.ledger;
        let budget = self.config.timeouts.ledger_read();
        retry_transient(&self.config.retry, cancel, "list_ids", move |_| {
            with_deadline(budget, "list_ids", ledger.list_ids(owner))
        })
        .await
    }

    async fn write(
        &self,
        caller: &Address,
        mutation: Mutation,
        cancel: &CancelSignal,
    ) -> Result<crate::ledger::TxReceipt, CanaryError> {
        let ledger = &self.ledger;
        let budget = self.config.timeouts.ledger_write();
        let label = mutation.label();
        let mutation = &mutation;
        retry_transient(&self.config.retry, cancel, label, move |_| {
            with_deadline(budget, label, ledger.write(caller, mutation.clone()))
        })
        .await
    }

    /// Owner write with retry; a retried attempt first checks whether an earlier
    /// one already landed.
    async fn submit<L>(
        &self,
        key: &DossierRef,
        mutation: Mutation,
        cancel: &CancelSignal,
        landed: L,
    ) -> Result<(), CanaryError>
    where
        L: Fn(&Dossier) -> bool,
    {
        let this = self;
        let label = mutation.label();
        let mutation = &mutation;
        let landed = &landed;
        retry_transient(&self.config.retry, cancel, label, move |attempt| {
            let mutation = mutation.clone();
            async move {
                if attempt > 1 {
                    if let Ok(current) = this.load(key).await {
                        if landed(&current) {
                            return Ok(());
                        }
                    }
                }
                with_deadline(
                    this.config.timeouts.ledger_write(),
                    label,
                    this.ledger.write(&key.owner, mutation),
                )
                .await
                .map(|_| ())
            }
        })
        .await
    }
}

fn terminal_error(key: &DossierRef, state: DossierState) -> CanaryError {
    CanaryError::StateInconsistency(format!("dossier {} is {} and cannot change", key, state))
}

fn parse_addresses(role: &str, raw: &[String]) -> Result<Vec<Address>, CanaryError> {
    let mut seen = HashSet::new();
    let mut out = Vec::with_capacity(raw.len());
    for value in raw {
        let address = Address::parse(value)
            .map_err(|e| CanaryError::Invalid(format!("{} {}: {}", role, value, e)))?;
        if !seen.insert(address.clone()) {
            return Err(CanaryError::Invalid(format!("duplicate {} {}", role, address)));
        }
        out.push(address);
    }
    Ok(out)
}

/// Names must be non-empty and distinct once directories are stripped, since
/// recipients restore files by name.
fn validate_file_names(files: &[PayloadFile]) -> Result<(), CanaryError> {
    let mut seen = HashSet::new();
    for (index, file) in files.iter().enumerate() {
        let base = base_name(&file.name);
        if base.trim().is_empty() {
            return Err(CanaryError::Invalid(format!("file {} has no name", index)));
        }
        if !seen.insert(base) {
            return Err(CanaryError::Invalid(format!(
                "file name {} is used more than once",
                base
            )));
        }
    }
    Ok(())
}

fn base_name(name: &str) -> &str {
    name.rsplit(['/', '\\']).next().unwrap_or(name)
}
