use anyhow::Context;
use canary_core::{Clock, InMemoryLedger, LedgerSnapshot, ProtocolLimits};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

const LEDGER_FILE: &str = "ledger.json";
const OBJECTS_DIR: &str = "objects";

/// Local data directory: the persisted ledger plus placeholder object storage.
///
/// The ledger is written back after every command so state survives between
/// invocations.
#[derive(Debug)]
pub struct Workspace {
    root: PathBuf,
    ledger: Arc<InMemoryLedger>,
}

impl Workspace {
    pub fn open(
        root: impl Into<PathBuf>,
        clock: Arc<dyn Clock>,
        limits: ProtocolLimits,
    ) -> anyhow::Result<Self> {
        let root = root.into();
        let path = root.join(LEDGER_FILE);
        let ledger = if path.exists() {
            let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
            if bytes.is_empty() {
                InMemoryLedger::new(clock, limits)
            } else {
                let snapshot: LedgerSnapshot = serde_json::from_slice(&bytes)
                    .with_context(|| format!("parsing {}", path.display()))?;
                InMemoryLedger::from_snapshot(snapshot, clock, limits)?
            }
        } else {
            InMemoryLedger::new(clock, limits)
        };

        Ok(Self {
            root,
            ledger: Arc::new(ledger),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn objects_dir(&self) -> PathBuf {
        self.root.join(OBJECTS_DIR)
    }

    pub fn ledger(&self) -> Arc<InMemoryLedger> {
        self.ledger.clone()
    }

    pub async fn persist(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)?;
        let snapshot = self.ledger.snapshot().await;
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        let path = self.root.join(LEDGER_FILE);
        let tmp_path = path.with_extension("tmp");
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, &path)?;
        debug!(path = %path.display(), events = snapshot.events.len(), "ledger persisted");
        Ok(())
    }
}
