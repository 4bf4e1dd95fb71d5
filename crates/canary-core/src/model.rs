use crate::error::CanaryError;
use crate::storage::ContentLocator;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Account address: `0x` followed by 40 hex characters, normalised to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl Address {
    pub fn parse(raw: &str) -> Result<Self, CanaryError> {
        let trimmed = raw.trim();
        let hex = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| CanaryError::Invalid(format!("address '{}' must start with 0x", raw)))?;
        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(CanaryError::Invalid(format!(
                "address '{}' must contain exactly 40 hex characters",
                raw
            )));
        }
        Ok(Self(format!("0x{}", hex.to_ascii_lowercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Address {
    type Err = CanaryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for Address {
    type Error = CanaryError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.0
    }
}

/// Per-owner dossier sequence number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DossierId(pub u64);

impl fmt::Display for DossierId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Natural key of a dossier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DossierRef {
    pub owner: Address,
    pub id: DossierId,
}

impl DossierRef {
    pub fn new(owner: Address, id: DossierId) -> Self {
        Self { owner, id }
    }
}

impl fmt::Display for DossierRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.id)
    }
}

/// One recipient releases publicly; several release privately to the named set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReleaseMode {
    Public,
    Private,
}

impl ReleaseMode {
    pub fn for_recipient_count(count: usize) -> Self {
        if count > 1 {
            ReleaseMode::Private
        } else {
            ReleaseMode::Public
        }
    }
}

impl fmt::Display for ReleaseMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReleaseMode::Public => write!(f, "public"),
            ReleaseMode::Private => write!(f, "private"),
        }
    }
}

/// Guardian attestation recorded by the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianConfirmation {
    pub dossier: DossierRef,
    pub guardian: Address,
    pub confirmed_at: DateTime<Utc>,
}

/// Dossier exactly as the ledger stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DossierRecord {
    pub id: DossierId,
    pub owner: Address,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub is_active: bool,
    pub is_permanently_disabled: bool,
    pub is_released: bool,
    /// Seconds.
    pub check_in_interval: u64,
    /// Unix seconds.
    pub last_check_in: i64,
    pub encrypted_file_hashes: Vec<String>,
    pub recipients: Vec<Address>,
    #[serde(default)]
    pub guardians: Vec<Address>,
    #[serde(default)]
    pub guardian_threshold: u32,
    #[serde(default)]
    pub guardian_confirmation_count: u32,
    /// Unix seconds at which the owner paused; present only while paused.
    #[serde(default)]
    pub paused_at: Option<i64>,
    /// Pause time accumulated since the last check-in.
    #[serde(default)]
    pub frozen_secs: u64,
}

impl DossierRecord {
    pub fn reference(&self) -> DossierRef {
        DossierRef::new(self.owner.clone(), self.id)
    }

    /// Reject records whose stored id disagrees with the key they were read under.
    pub fn verify_key(&self, key: &DossierRef) -> Result<(), CanaryError> {
        if self.id != key.id {
            return Err(CanaryError::id_mismatch(key.id.0, self.id.0));
        }
        if self.owner != key.owner {
            return Err(CanaryError::StateInconsistency(format!(
                "record {} is owned by {}",
                key, self.owner
            )));
        }
        Ok(())
    }
}

/// Lifecycle state, replacing the stored flag combination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state")]
pub enum DossierState {
    Active,
    Paused { since: DateTime<Utc> },
    Released,
    Disabled,
}

impl DossierState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DossierState::Released | DossierState::Disabled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DossierState::Active => "active",
            DossierState::Paused { .. } => "paused",
            DossierState::Released => "released",
            DossierState::Disabled => "disabled",
        }
    }
}

impl fmt::Display for DossierState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Validated in-memory view of a [`DossierRecord`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dossier {
    pub id: DossierId,
    pub owner: Address,
    pub name: String,
    pub description: String,
    pub state: DossierState,
    pub check_in_interval: Duration,
    pub last_check_in: DateTime<Utc>,
    pub frozen: Duration,
    pub encrypted_file_hashes: Vec<ContentLocator>,
    pub recipients: Vec<Address>,
    pub guardians: Vec<Address>,
    pub guardian_threshold: u32,
    pub guardian_confirmation_count: u32,
}

impl Dossier {
    pub fn reference(&self) -> DossierRef {
        DossierRef::new(self.owner.clone(), self.id)
    }

    pub fn release_mode(&self) -> ReleaseMode {
        ReleaseMode::for_recipient_count(self.recipients.len())
    }

    /// Moment the countdown runs out, counting frozen pause time.
    ///
    /// Saturates at the latest representable instant, which keeps the
    /// dossier sealed rather than opening it on an arithmetic overflow.
    pub fn deadline(&self) -> DateTime<Utc> {
        checked_deadline(self.last_check_in, self.check_in_interval, self.frozen)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn manifest_locator(&self) -> Option<&ContentLocator> {
        self.encrypted_file_hashes.first()
    }

    pub fn payload_locators(&self) -> &[ContentLocator] {
        self.encrypted_file_hashes.get(1..).unwrap_or(&[])
    }

    pub fn is_guardian(&self, address: &Address) -> bool {
        self.guardians.iter().any(|g| g == address)
    }

    pub fn is_recipient(&self, address: &Address) -> bool {
        self.recipients.iter().any(|r| r == address)
    }
}

pub(crate) fn from_unix(secs: i64) -> Result<DateTime<Utc>, CanaryError> {
    Utc.timestamp_opt(secs, 0)
        .single()
        .ok_or_else(|| CanaryError::StateInconsistency(format!("timestamp {} out of range", secs)))
}

fn checked_deadline(
    last_check_in: DateTime<Utc>,
    interval: Duration,
    frozen: Duration,
) -> Option<DateTime<Utc>> {
    last_check_in
        .checked_add_signed(interval)?
        .checked_add_signed(frozen)
}

fn interval_from_secs(secs: u64) -> Result<Duration, CanaryError> {
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| CanaryError::StateInconsistency(format!("interval {}s out of range", secs)))
}

impl TryFrom<DossierRecord> for Dossier {
    type Error = CanaryError;

    fn try_from(record: DossierRecord) -> Result<Self, Self::Error> {
        let last_check_in = from_unix(record.last_check_in)?;
        let state = match (
            record.is_released,
            record.is_permanently_disabled,
            record.is_active,
        ) {
            (true, true, _) => {
                return Err(CanaryError::StateInconsistency(format!(
                    "dossier {} is flagged both released and disabled",
                    record.reference()
                )))
            }
            (true, false, _) => DossierState::Released,
            (false, true, _) => DossierState::Disabled,
            (false, false, true) => DossierState::Active,
            (false, false, false) => DossierState::Paused {
                since: match record.paused_at {
                    Some(at) => from_unix(at)?,
                    None => last_check_in,
                },
            },
        };

        let encrypted_file_hashes = record
            .encrypted_file_hashes
            .iter()
            .map(|raw| {
                raw.parse::<ContentLocator>().map_err(|e| {
                    CanaryError::StateInconsistency(format!(
                        "dossier {} holds malformed locator: {}",
                        record.reference(),
                        e
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let check_in_interval = interval_from_secs(record.check_in_interval)?;
        let frozen = interval_from_secs(record.frozen_secs)?;
        if checked_deadline(last_check_in, check_in_interval, frozen).is_none() {
            return Err(CanaryError::StateInconsistency(format!(
                "dossier {} has no representable deadline (interval {}s, frozen {}s)",
                record.reference(),
                record.check_in_interval,
                record.frozen_secs
            )));
        }

        Ok(Self {
            id: record.id,
            owner: record.owner,
            name: record.name,
            description: record.description,
            state,
            check_in_interval,
            last_check_in,
            frozen,
            encrypted_file_hashes,
            recipients: record.recipients,
            guardians: record.guardians,
            guardian_threshold: record.guardian_threshold,
            guardian_confirmation_count: record.guardian_confirmation_count,
        })
    }
}

impl From<&Dossier> for DossierRecord {
    fn from(dossier: &Dossier) -> Self {
        let (is_active, is_permanently_disabled, is_released, paused_at) = match dossier.state {
            DossierState::Active => (true, false, false, None),
            DossierState::Paused { since } => (false, false, false, Some(since.timestamp())),
            DossierState::Released => (false, false, true, None),
            DossierState::Disabled => (false, true, false, None),
        };
        Self {
            id: dossier.id,
            owner: dossier.owner.clone(),
            name: dossier.name.clone(),
            description: dossier.description.clone(),
            is_active,
            is_permanently_disabled,
            is_released,
            check_in_interval: dossier.check_in_interval.num_seconds().max(0) as u64,
            last_check_in: dossier.last_check_in.timestamp(),
            encrypted_file_hashes: dossier
                .encrypted_file_hashes
                .iter()
                .map(ToString::to_string)
                .collect(),
            recipients: dossier.recipients.clone(),
            guardians: dossier.guardians.clone(),
            guardian_threshold: dossier.guardian_threshold,
            guardian_confirmation_count: dossier.guardian_confirmation_count,
            paused_at,
            frozen_secs: dossier.frozen.num_seconds().max(0) as u64,
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn address(byte: u8) -> Address {
        Address::parse(&format!("0x{}", format!("{:02x}", byte).repeat(20))).expect("valid address")
    }

    pub fn record(id: u64, last_check_in: i64, interval: u64) -> DossierRecord {
        DossierRecord {
            id: DossierId(id),
            owner: address(0xaa),
            name: format!("dossier-{}", id),
            description: String::new(),
            is_active: true,
            is_permanently_disabled: false,
            is_released: false,
            check_in_interval: interval,
            last_check_in,
            encrypted_file_hashes: vec!["codex://zManifest".into(), "codex://zShard".into()],
            recipients: vec![address(0x01)],
            guardians: Vec::new(),
            guardian_threshold: 0,
            guardian_confirmation_count: 0,
            paused_at: None,
            frozen_secs: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn parses_and_normalises_addresses() {
        let parsed = Address::parse("0xABCDEFabcdef0123456789012345678901234567").expect("valid");
        assert_eq!(parsed.as_str(), "0xabcdefabcdef0123456789012345678901234567");

        assert!(Address::parse("abcdefabcdef0123456789012345678901234567").is_err());
        assert!(Address::parse("0x1234").is_err());
        assert!(Address::parse("0xZZcdefabcdef0123456789012345678901234567").is_err());
    }

    #[test]
    fn release_mode_follows_recipient_count() {
        assert_eq!(ReleaseMode::for_recipient_count(1), ReleaseMode::Public);
        assert_eq!(ReleaseMode::for_recipient_count(3), ReleaseMode::Private);
    }

    #[test]
    fn flags_map_onto_closed_state() {
        let mut rec = record(0, 1_000, 60);
        assert_eq!(Dossier::try_from(rec.clone()).expect("active").state, DossierState::Active);

        rec.is_active = false;
        rec.paused_at = Some(1_030);
        let paused = Dossier::try_from(rec.clone()).expect("paused");
        assert_eq!(
            paused.state,
            DossierState::Paused {
                since: from_unix(1_030).expect("ts")
            }
        );

        rec.is_released = true;
        assert_eq!(Dossier::try_from(rec.clone()).expect("released").state, DossierState::Released);

        rec.is_permanently_disabled = true;
        let err = Dossier::try_from(rec).expect_err("released and disabled is invalid");
        assert!(matches!(err, CanaryError::StateInconsistency(_)));
    }

    #[test]
    fn record_round_trips_through_domain_view() {
        let mut rec = record(4, 1_000, 3_600);
        rec.is_active = false;
        rec.paused_at = Some(2_000);
        rec.frozen_secs = 15;
        let dossier = Dossier::try_from(rec.clone()).expect("valid");
        assert_eq!(DossierRecord::from(&dossier), rec);
        assert_eq!(
            dossier.manifest_locator().map(|l| l.to_string()),
            Some("codex://zManifest".into())
        );
        assert_eq!(dossier.payload_locators().len(), 1);
    }

    #[test]
    fn unrepresentable_deadline_is_rejected_not_panicked() {
        let rec = record(0, 1_000, 1_000_000_000_000_000);
        let err = Dossier::try_from(rec).expect_err("deadline past the calendar");
        assert!(matches!(err, CanaryError::StateInconsistency(_)));

        let mut rec = record(0, 1_000, 60);
        rec.frozen_secs = u64::MAX;
        assert!(Dossier::try_from(rec).is_err());
    }

    #[test]
    fn deadline_saturates_for_hand_built_views() {
        let mut dossier = Dossier::try_from(record(0, 1_000, 60)).expect("valid");
        dossier.check_in_interval = Duration::try_days(100_000_000).expect("fits a delta");
        assert_eq!(dossier.deadline(), DateTime::<Utc>::MAX_UTC);
    }

    #[test]
    fn verify_key_detects_misassigned_record() {
        let rec = record(3, 0, 60);
        let key = DossierRef::new(rec.owner.clone(), DossierId(2));
        assert!(matches!(
            rec.verify_key(&key),
            Err(CanaryError::StateInconsistency(_))
        ));
        assert!(rec.verify_key(&rec.reference()).is_ok());
    }
}
