use async_trait::async_trait;
use canary_core::{Address, CanaryError, IdentityProvider};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::debug;

/// Fixed signer that approves every action unless told to decline.
#[derive(Debug)]
pub struct StaticIdentity {
    address: Address,
    declining: AtomicBool,
    approved: Mutex<Vec<String>>,
}

impl StaticIdentity {
    pub fn new(address: Address) -> Self {
        Self {
            address,
            declining: AtomicBool::new(false),
            approved: Mutex::new(Vec::new()),
        }
    }

    pub fn set_declining(&self, declining: bool) {
        self.declining.store(declining, Ordering::SeqCst);
    }

    /// Actions approved so far, oldest first.
    pub fn approved(&self) -> Vec<String> {
        self.approved
            .lock()
            .map(|a| a.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl IdentityProvider for StaticIdentity {
    fn address(&self) -> Address {
        self.address.clone()
    }

    async fn authorize(&self, action: &str) -> Result<(), CanaryError> {
        if self.declining.load(Ordering::SeqCst) {
            return Err(CanaryError::UserDeclined(format!("signer refused '{}'", action)));
        }
        debug!(signer = %self.address, action, "action approved");
        self.approved
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(action.to_string());
        Ok(())
    }
}
