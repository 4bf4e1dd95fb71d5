//! Canary core: a dead-man's switch for encrypted dossiers.
//!
//! Owners commit encrypted payloads to content-addressed storage and keep them
//! sealed by checking in on a ledger. When check-ins stop and any guardian
//! quorum is met, recipients can decrypt. Every decision is taken against a
//! fresh ledger read.

#![deny(unsafe_code)]

pub mod cancel;
pub mod checkin;
pub mod clock;
pub mod condition;
pub mod config;
pub mod encryption;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod manifest;
pub mod memory_ledger;
pub mod mime;
pub mod model;
pub mod quorum;
pub mod retry;
pub mod service;
pub mod storage;

pub use cancel::{CancelHandle, CancelSignal};
pub use checkin::{
    CheckInCoordinator, CheckInMode, CheckInReport, DiagnosticFinding, Diagnosis, FindingKind,
    ItemOutcome,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use condition::{ConditionEvaluator, LifecyclePhase};
pub use config::{
    CanaryConfig, ConfigError, GuardianPolicy, ProtocolLimits, RetryPolicy, StorageConfig,
    TimeoutConfig,
};
pub use encryption::{Ciphertext, DecryptionEvidence, EncryptionCapability, ReleaseCondition};
pub use error::{CanaryError, ErrorClass, Severity};
pub use identity::IdentityProvider;
pub use ledger::{Ledger, LedgerEvent, Mutation, NewDossier, TxReceipt};
pub use manifest::{Manifest, ManifestEntry, MANIFEST_VERSION};
pub use memory_ledger::{InMemoryLedger, LedgerSnapshot};
pub use model::{
    Address, Dossier, DossierId, DossierRecord, DossierRef, DossierState, GuardianConfirmation,
    ReleaseMode,
};
pub use quorum::{load_dossier, ConfirmOutcome, GuardianQuorum, GuardianStatus, QuorumProgress};
pub use retry::{retry_transient, retry_with_backoff, with_deadline};
pub use service::{
    Collaborators, CreateDossierRequest, CreatedDossier, DecryptedDossier, DecryptedFile,
    DossierLifecycleService, DossierStatus, GuardianAssignment, PayloadFile, TerminalAck,
    TerminalAction, TransitionOutcome,
};
pub use storage::{
    AttemptOutcome, CommitOutcome, ContentLocator, Durability, NoProgress, ProgressSink,
    StorageBackend, StorageCommitAttempt, StorageCommitPipeline, StorageProvider, StoredObject,
};
