//! End-to-end dossier scenarios over the in-memory ledger, memory storage and
//! the ledger-gated cipher.

use canary_adapters::{FlakyLedger, LedgerGatedCipher, MemoryStorageBackend, StaticIdentity};
use canary_core::{
    Address, CanaryConfig, CanaryError, CancelSignal, Collaborators, ConfirmOutcome,
    CreateDossierRequest, DecryptionEvidence, DossierLifecycleService, DossierState,
    InMemoryLedger, Ledger, LifecyclePhase, ManualClock, NoProgress, PayloadFile,
    ProtocolLimits, StorageBackend, StorageProvider, TerminalAck, TerminalAction,
};
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

const SECRET: &[u8] = b"integration secret";

fn address(byte: u8) -> Address {
    Address::parse(&format!("0x{}", format!("{:02x}", byte).repeat(20))).expect("address")
}

struct World {
    clock: Arc<ManualClock>,
    ledger: Arc<InMemoryLedger>,
    codex: Arc<MemoryStorageBackend>,
    pinata: Arc<MemoryStorageBackend>,
}

impl World {
    fn new() -> Self {
        let clock = Arc::new(ManualClock::at_unix(1_700_000_000));
        Self {
            ledger: Arc::new(InMemoryLedger::new(clock.clone(), ProtocolLimits::default())),
            clock,
            codex: Arc::new(MemoryStorageBackend::new(StorageProvider::Codex)),
            pinata: Arc::new(MemoryStorageBackend::new(StorageProvider::Pinata)),
        }
    }

    fn storage(&self) -> Vec<Arc<dyn StorageBackend>> {
        vec![self.codex.clone() as Arc<dyn StorageBackend>, self.pinata.clone()]
    }

    fn service_on(
        &self,
        who: &Arc<StaticIdentity>,
        ledger: Arc<dyn Ledger>,
    ) -> DossierLifecycleService {
        let config = CanaryConfig::default();
        let cipher = LedgerGatedCipher::new(
            SECRET,
            self.ledger.clone(),
            self.clock.clone(),
            config.timeouts.clone(),
        )
        .expect("cipher");
        DossierLifecycleService::new(
            Collaborators {
                ledger,
                storage: self.storage(),
                cipher: Arc::new(cipher),
                identity: who.clone(),
                clock: self.clock.clone(),
            },
            config,
        )
        .expect("service")
    }

    fn service(&self, who: &Arc<StaticIdentity>) -> DossierLifecycleService {
        self.service_on(who, self.ledger.clone())
    }
}

fn identity(byte: u8) -> Arc<StaticIdentity> {
    Arc::new(StaticIdentity::new(address(byte)))
}

fn request(
    interval_secs: u64,
    recipients: &[u8],
    guardians: &[u8],
    threshold: u32,
) -> CreateDossierRequest {
    CreateDossierRequest {
        name: "whistle".to_string(),
        description: "board minutes".to_string(),
        check_in_interval: Duration::from_secs(interval_secs),
        recipients: recipients.iter().map(|b| address(*b).to_string()).collect(),
        guardians: guardians.iter().map(|b| address(*b).to_string()).collect(),
        guardian_threshold: threshold,
        files: vec![
            PayloadFile::new("minutes.txt", b"the board knew".to_vec()),
            PayloadFile::new("photo.jpg", vec![0xff, 0xd8, 0xff, 0xe0]),
        ],
    }
}

#[tokio::test(start_paused = true)]
async fn ungated_dossier_opens_after_its_interval() {
    let world = World::new();
    let owner = identity(0xaa);
    let reader = identity(0x01);
    let never = CancelSignal::never();

    let created = world
        .service(&owner)
        .create_dossier(request(60, &[0x01], &[], 0), &NoProgress, &never)
        .await
        .expect("create");
    assert!(!created.is_degraded());
    assert_eq!(created.files.len(), 2);
    assert!(created.files.iter().all(|f| world.codex.contains(&f.locator)));

    let recipient = world.service(&reader);
    let err = recipient
        .decrypt(&created.dossier, &recipient.evidence())
        .await
        .expect_err("still sealed");
    assert!(matches!(err, CanaryError::ConditionNotMet(_)));

    world.clock.advance_secs(61);
    let opened = recipient
        .decrypt(&created.dossier, &recipient.evidence())
        .await
        .expect("decrypt");
    assert_eq!(opened.manifest.dossier_id, created.dossier.id);
    assert_eq!(opened.files[0].bytes, b"the board knew".to_vec());
    assert_eq!(opened.files[1].entry.mime_type, "image/jpeg");
}

#[tokio::test(start_paused = true)]
async fn guardian_quorum_gates_release() {
    let world = World::new();
    let owner = identity(0xaa);
    let (g1, g2) = (identity(0x11), identity(0x12));
    let reader = identity(0x01);
    let never = CancelSignal::never();

    let key = world
        .service(&owner)
        .create_dossier(request(60, &[0x01], &[0x11, 0x12], 2), &NoProgress, &never)
        .await
        .expect("create")
        .dossier;
    world.clock.advance_secs(120);

    let recipient = world.service(&reader);
    let status = recipient.status(&key).await.expect("status");
    assert_eq!(status.phase, LifecyclePhase::AwaitingQuorum);
    assert!(matches!(
        recipient.decrypt(&key, &recipient.evidence()).await,
        Err(CanaryError::ConditionNotMet(_))
    ));

    let first = world.service(&g1);
    assert_eq!(first.confirm_release(&key, &never).await, Ok(ConfirmOutcome::Recorded));
    assert_eq!(
        first.confirm_release(&key, &never).await,
        Ok(ConfirmOutcome::AlreadyConfirmed)
    );
    assert!(recipient.should_stay_encrypted(&key).await.expect("eval"));

    let guarded = world
        .service(&g2)
        .dossiers_guarded_by(&address(0x12))
        .await
        .expect("guarded");
    assert_eq!(guarded.len(), 1);
    assert_eq!(guarded[0].confirmations, 1);
    assert!(!guarded[0].has_confirmed);

    world
        .service(&g2)
        .confirm_release(&key, &never)
        .await
        .expect("second guardian");
    assert!(!recipient.should_stay_encrypted(&key).await.expect("eval"));
    assert!(recipient.decrypt(&key, &recipient.evidence()).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn codex_outage_falls_back_to_pinata() {
    let world = World::new();
    world
        .codex
        .fail_next(10, CanaryError::Transient("codex node unreachable".into()));
    let owner = identity(0xaa);

    let created = world
        .service(&owner)
        .create_dossier(request(60, &[0x01], &[], 0), &NoProgress, &CancelSignal::never())
        .await
        .expect("create");

    assert_eq!(created.manifest.provider, StorageProvider::Pinata);
    assert_eq!(created.manifest.attempts.len(), 2);
    assert!(!created.manifest.attempts[0].succeeded());
    assert_eq!(created.manifest.locator.scheme(), "ipfs");
    assert_eq!(world.codex.object_count(), 0);

    world.clock.advance_secs(61);
    let reader = world.service(&identity(0x01));
    let opened = reader
        .decrypt(&created.dossier, &reader.evidence())
        .await
        .expect("decrypt through pinata");
    assert_eq!(opened.files.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn pause_freezes_the_countdown() {
    let world = World::new();
    let owner = identity(0xaa);
    let service = world.service(&owner);
    let never = CancelSignal::never();

    let key = service
        .create_dossier(request(3_600, &[0x01], &[], 0), &NoProgress, &never)
        .await
        .expect("create")
        .dossier;
    world.clock.advance_secs(600);
    service.pause(key.id, &never).await.expect("pause");

    world.clock.advance_secs(86_400);
    let paused = service.status(&key).await.expect("status");
    assert!(matches!(paused.state, DossierState::Paused { .. }));
    assert_eq!(paused.remaining_secs, 3_000);
    assert!(service.should_stay_encrypted(&key).await.expect("eval"));

    service.resume(key.id, &never).await.expect("resume");
    let resumed = service.status(&key).await.expect("status");
    assert_eq!(resumed.state, DossierState::Active);
    assert_eq!(resumed.remaining_secs, 3_000);

    let report = service.check_in(&never).await.expect("check in");
    assert_eq!(report.checked_in(), vec![key.id]);
    assert_eq!(service.status(&key).await.expect("status").remaining_secs, 3_600);
}

#[tokio::test(start_paused = true)]
async fn private_release_rejects_strangers() {
    let world = World::new();
    let owner = identity(0xaa);
    let key = world
        .service(&owner)
        .create_dossier(request(60, &[0x01, 0x02], &[], 0), &NoProgress, &CancelSignal::never())
        .await
        .expect("create")
        .dossier;
    world
        .service(&owner)
        .release_now(
            key.id,
            TerminalAck::acknowledge(TerminalAction::ReleaseNow),
            &CancelSignal::never(),
        )
        .await
        .expect("release");

    let stranger = world.service(&identity(0x99));
    let err = stranger
        .decrypt(&key, &stranger.evidence())
        .await
        .expect_err("stranger");
    assert!(matches!(err, CanaryError::ConditionNotMet(_)));

    let second = world.service(&identity(0x02));
    let forged = DecryptionEvidence {
        requester: address(0x02),
        requested_at: Utc::now(),
    };
    assert!(second.decrypt(&key, &forged).await.is_ok());
}

#[tokio::test(start_paused = true)]
async fn lost_create_receipt_is_not_replayed() {
    let world = World::new();
    let flaky = Arc::new(FlakyLedger::new(world.ledger.clone()));
    flaky.lose_receipt("create_dossier");
    let owner = identity(0xaa);

    let created = world
        .service_on(&owner, flaky.clone())
        .create_dossier(request(60, &[0x01], &[], 0), &NoProgress, &CancelSignal::never())
        .await
        .expect("create despite lost receipt");

    assert_eq!(flaky.writes_applied(), 2);
    assert_eq!(
        world.ledger.list_ids(&address(0xaa)).await.expect("ids"),
        vec![created.dossier.id]
    );
}

#[tokio::test(start_paused = true)]
async fn declined_signature_stops_before_any_write() {
    let world = World::new();
    let owner = identity(0xaa);
    let service = world.service(&owner);
    let never = CancelSignal::never();
    let key = service
        .create_dossier(request(3_600, &[0x01], &[], 0), &NoProgress, &never)
        .await
        .expect("create")
        .dossier;
    let before = world.ledger.events().await.len();

    owner.set_declining(true);
    let err = service.check_in(&never).await.expect_err("declined");
    assert!(matches!(err, CanaryError::UserDeclined(_)));
    assert!(matches!(
        service.pause(key.id, &never).await,
        Err(CanaryError::UserDeclined(_))
    ));
    assert_eq!(world.ledger.events().await.len(), before);
    assert!(owner.approved().contains(&"create dossier".to_string()));
}

#[tokio::test(start_paused = true)]
async fn tampered_shard_is_fatal() {
    let world = World::new();
    let owner = identity(0xaa);
    let created = world
        .service(&owner)
        .create_dossier(request(60, &[0x01], &[], 0), &NoProgress, &CancelSignal::never())
        .await
        .expect("create");
    assert!(world.codex.corrupt(&created.files[0].locator));

    world.clock.advance_secs(61);
    let reader = world.service(&identity(0x01));
    let err = reader
        .decrypt(&created.dossier, &reader.evidence())
        .await
        .expect_err("tampered");
    assert!(matches!(err, CanaryError::Fatal(_)));
}

#[tokio::test(start_paused = true)]
async fn cancelled_create_reports_cancelled() {
    let world = World::new();
    let owner = identity(0xaa);
    let (handle, signal) = canary_core::CancelHandle::pair();
    handle.cancel();

    let err = world
        .service(&owner)
        .create_dossier(request(60, &[0x01], &[], 0), &NoProgress, &signal)
        .await
        .expect_err("cancelled");
    assert_eq!(err, CanaryError::Cancelled);
    assert_eq!(world.codex.object_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn unfunded_signer_gets_remediation_not_retries() {
    let world = World::new();
    let flaky = Arc::new(FlakyLedger::new(world.ledger.clone()));
    let owner = identity(0xaa);
    let service = world.service_on(&owner, flaky.clone());
    let never = CancelSignal::never();
    let key = service
        .create_dossier(request(3_600, &[0x01], &[], 0), &NoProgress, &never)
        .await
        .expect("create")
        .dossier;
    world.clock.advance_secs(60);
    let applied = flaky.writes_applied();

    flaky.reject_writes(2, "insufficient funds for gas * price + value");
    let err = service.check_in_one(key.id, &never).await.expect_err("unfunded");
    assert!(matches!(err, CanaryError::ResourceExhausted { .. }));
    assert_eq!(err.class().severity(), canary_core::Severity::Actionable);
    service.check_in_one(key.id, &never).await.expect_err("still unfunded");
    assert_eq!(flaky.writes_applied(), applied);

    assert!(matches!(
        service.check_in_one(key.id, &never).await,
        Ok(canary_core::ItemOutcome::CheckedIn { .. })
    ));
}
