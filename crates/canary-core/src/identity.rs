use crate::error::CanaryError;
use crate::model::Address;
use async_trait::async_trait;

/// The current caller: an address and a way to approve signing.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn address(&self) -> Address;

    /// Ask the signer to approve `action`. A refusal is [`CanaryError::UserDeclined`].
    async fn authorize(&self, action: &str) -> Result<(), CanaryError>;
}
