//! Ledger collaborator contract.

use crate::error::CanaryError;
use crate::model::{Address, DossierId, DossierRecord, DossierRef, GuardianConfirmation};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Fields of a dossier to be created under a previously reserved id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewDossier {
    pub id: DossierId,
    pub name: String,
    pub description: String,
    pub check_in_interval: u64,
    pub encrypted_file_hashes: Vec<String>,
    pub recipients: Vec<Address>,
    pub guardians: Vec<Address>,
    pub guardian_threshold: u32,
}

/// State transitions, always applied on behalf of the signing caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "op")]
pub enum Mutation {
    /// Atomically claim the caller's next dossier id.
    ReserveId,
    CreateDossier(NewDossier),
    CheckIn { id: DossierId },
    /// Check in several dossiers in one all-or-nothing transaction.
    CheckInMany { ids: Vec<DossierId> },
    Pause { id: DossierId },
    Resume { id: DossierId },
    AddFiles { id: DossierId, locators: Vec<String> },
    UpdateInterval { id: DossierId, check_in_interval: u64 },
    ReleaseNow { id: DossierId },
    PermanentlyDisable { id: DossierId },
    /// Cast by a guardian against someone else's dossier.
    ConfirmRelease { dossier: DossierRef },
}

impl Mutation {
    pub fn label(&self) -> &'static str {
        match self {
            Mutation::ReserveId => "reserve_id",
            Mutation::CreateDossier(_) => "create_dossier",
            Mutation::CheckIn { .. } => "check_in",
            Mutation::CheckInMany { .. } => "check_in_many",
            Mutation::Pause { .. } => "pause",
            Mutation::Resume { .. } => "resume",
            Mutation::AddFiles { .. } => "add_files",
            Mutation::UpdateInterval { .. } => "update_interval",
            Mutation::ReleaseNow { .. } => "release_now",
            Mutation::PermanentlyDisable { .. } => "permanently_disable",
            Mutation::ConfirmRelease { .. } => "confirm_release",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "event")]
pub enum LedgerEvent {
    IdReserved { dossier: DossierRef },
    DossierCreated { dossier: DossierRef, name: String },
    CheckInPerformed { dossier: DossierRef, at: DateTime<Utc> },
    DossierPaused { dossier: DossierRef },
    DossierResumed { dossier: DossierRef },
    FilesAdded { dossier: DossierRef, count: usize },
    IntervalUpdated { dossier: DossierRef, check_in_interval: u64 },
    GuardianConfirmed { dossier: DossierRef, guardian: Address, confirmations: u32 },
    DossierReleased { dossier: DossierRef },
    DossierDisabled { dossier: DossierRef },
}

/// Confirmation of an applied mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    pub tx_id: String,
    pub sequence: u64,
    pub confirmed_at: DateTime<Utc>,
    /// Set by `ReserveId`.
    pub assigned_id: Option<DossierId>,
    pub events: Vec<LedgerEvent>,
}

/// Transactional key-value store holding dossier state.
///
/// `write` is all-or-nothing: it either confirms with a receipt or fails with
/// no state change. Contract-level rejections surface as
/// [`CanaryError::Reverted`] or [`CanaryError::Unauthorized`].
#[async_trait]
pub trait Ledger: Send + Sync {
    /// `Ok(None)` when nothing is stored under the key.
    async fn read(&self, dossier: &DossierRef) -> Result<Option<DossierRecord>, CanaryError>;

    async fn write(&self, caller: &Address, mutation: Mutation) -> Result<TxReceipt, CanaryError>;

    /// The owner's dossier index, in creation order.
    async fn list_ids(&self, owner: &Address) -> Result<Vec<DossierId>, CanaryError>;

    async fn confirmation(
        &self,
        dossier: &DossierRef,
        guardian: &Address,
    ) -> Result<Option<GuardianConfirmation>, CanaryError>;

    /// Dossiers naming `guardian` as a guardian.
    async fn guarded_by(&self, guardian: &Address) -> Result<Vec<DossierRef>, CanaryError>;

    /// Every address that has created at least one dossier.
    async fn owners(&self) -> Result<Vec<Address>, CanaryError>;
}
