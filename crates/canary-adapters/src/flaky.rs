//! Fault-injecting ledger wrapper for chaos testing.

use async_trait::async_trait;
use canary_core::error::classify_rejection;
use canary_core::{
    Address, CanaryError, DossierId, DossierRecord, DossierRef, GuardianConfirmation, Ledger,
    Mutation, TxReceipt,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

/// Wraps a ledger and fails scripted calls deterministically.
pub struct FlakyLedger {
    inner: Arc<dyn Ledger>,
    write_failures: Mutex<VecDeque<CanaryError>>,
    read_failures: Mutex<VecDeque<CanaryError>>,
    lost_receipts: Mutex<Vec<&'static str>>,
    writes: AtomicUsize,
}

impl FlakyLedger {
    pub fn new(inner: Arc<dyn Ledger>) -> Self {
        Self {
            inner,
            write_failures: Mutex::new(VecDeque::new()),
            read_failures: Mutex::new(VecDeque::new()),
            lost_receipts: Mutex::new(Vec::new()),
            writes: AtomicUsize::new(0),
        }
    }

    /// Reject the next `count` writes with `err` before they reach the ledger.
    pub fn fail_writes(&self, count: usize, err: CanaryError) {
        push(&self.write_failures, count, err);
    }

    /// Reject the next `count` writes with a raw wallet or RPC message,
    /// classified the way a live signer's rejection would be.
    pub fn reject_writes(&self, count: usize, reason: &str) {
        self.fail_writes(count, classify_rejection(reason));
    }

    pub fn fail_reads(&self, count: usize, err: CanaryError) {
        push(&self.read_failures, count, err);
    }

    /// Let the next `op` write land but report a timeout to the caller.
    /// `op` is a [`Mutation::label`].
    pub fn lose_receipt(&self, op: &'static str) {
        self.lost_receipts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(op);
    }

    /// Writes that reached the wrapped ledger.
    pub fn writes_applied(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn next_read_failure(&self) -> Option<CanaryError> {
        pop(&self.read_failures)
    }

    fn take_lost_receipt(&self, op: &str) -> bool {
        let mut lost = self
            .lost_receipts
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match lost.iter().position(|l| *l == op) {
            Some(index) => {
                lost.remove(index);
                true
            }
            None => false,
        }
    }
}

fn push(queue: &Mutex<VecDeque<CanaryError>>, count: usize, err: CanaryError) {
    let mut queue = queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    queue.extend(std::iter::repeat(err).take(count));
}

fn pop(queue: &Mutex<VecDeque<CanaryError>>) -> Option<CanaryError> {
    queue
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .pop_front()
}

#[async_trait]
impl Ledger for FlakyLedger {
    async fn read(&self, dossier: &DossierRef) -> Result<Option<DossierRecord>, CanaryError> {
        if let Some(err) = self.next_read_failure() {
            return Err(err);
        }
        self.inner.read(dossier).await
    }

    async fn write(&self, caller: &Address, mutation: Mutation) -> Result<TxReceipt, CanaryError> {
        if let Some(err) = pop(&self.write_failures) {
            warn!(op = mutation.label(), error = %err, "injected write failure");
            return Err(err);
        }
        let label = mutation.label();
        let receipt = self.inner.write(caller, mutation).await?;
        self.writes.fetch_add(1, Ordering::SeqCst);

        if self.take_lost_receipt(label) {
            warn!(op = label, tx = %receipt.tx_id, "dropping receipt of applied write");
            return Err(CanaryError::Transient(format!("{} receipt timed out", label)));
        }
        Ok(receipt)
    }

    async fn list_ids(&self, owner: &Address) -> Result<Vec<DossierId>, CanaryError> {
        if let Some(err) = self.next_read_failure() {
            return Err(err);
        }
        self.inner.list_ids(owner).await
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
        if let Some(err) = self.next_read_failure() {
            return Err(err);
        }
        self.inner.owners().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use canary_core::{InMemoryLedger, ManualClock, ProtocolLimits};

    #[tokio::test]
    async fn lost_receipt_still_applies_the_write() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let inner = Arc::new(InMemoryLedger::new(clock, ProtocolLimits::default()));
        let flaky = FlakyLedger::new(inner.clone());
        let owner = Address::parse(&format!("0x{}", "ab".repeat(20))).expect("address");

        flaky.lose_receipt("reserve_id");
        let err = flaky.write(&owner, Mutation::ReserveId).await.expect_err("lost");
        assert!(err.is_retryable());
        assert_eq!(flaky.writes_applied(), 1);

        let receipt = flaky.write(&owner, Mutation::ReserveId).await.expect("second");
        assert_eq!(receipt.assigned_id, Some(DossierId(1)));
    }

    #[tokio::test]
    async fn scripted_write_failures_never_reach_the_ledger() {
        let clock = Arc::new(ManualClock::at_unix(1_000));
        let flaky =
            FlakyLedger::new(Arc::new(InMemoryLedger::new(clock, ProtocolLimits::default())));
        let owner = Address::parse(&format!("0x{}", "ab".repeat(20))).expect("address");

        flaky.reject_writes(1, "MetaMask Tx Signature: User rejected the request.");
        flaky.reject_writes(1, "insufficient funds for gas * price + value");
        assert!(matches!(
            flaky.write(&owner, Mutation::ReserveId).await,
            Err(CanaryError::UserDeclined(_))
        ));
        assert!(matches!(
            flaky.write(&owner, Mutation::ReserveId).await,
            Err(CanaryError::ResourceExhausted { .. })
        ));
        assert_eq!(flaky.writes_applied(), 0);
    }
}
