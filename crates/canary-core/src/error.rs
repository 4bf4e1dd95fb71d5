use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Dossier protocol errors.
///
/// Every variant maps onto one [`ErrorClass`], which drives retry decisions and
/// how loudly a failure is surfaced to the caller.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CanaryError {
    #[error("authorization declined: {0}")]
    UserDeclined(String),

    #[error("insufficient {resource}: {remediation}")]
    ResourceExhausted {
        resource: String,
        remediation: String,
    },

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("ledger reverted the transaction: {0}")]
    Reverted(String),

    #[error("state inconsistency: {0}")]
    StateInconsistency(String),

    #[error("protocol integrity violation: {0}")]
    Fatal(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("release condition not met: {0}")]
    ConditionNotMet(String),

    #[error("every storage provider failed ({attempts} attempts), last error: {last_reason}")]
    StorageExhausted { attempts: usize, last_reason: String },

    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Coarse classification of a [`CanaryError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    UserDeclined,
    ResourceExhausted,
    Transient,
    StateInconsistency,
    Fatal,
    Cancelled,
    Invalid,
    NotFound,
    Unauthorized,
    ConditionNotMet,
}

/// How a failure should be presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational; the caller chose this outcome.
    Quiet,
    /// The caller can fix it (fund the account, retry later, fix input).
    Actionable,
    /// Integrity problem; block further action on the dossier.
    Loud,
}

impl ErrorClass {
    /// Only transient failures are worth another attempt.
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorClass::Transient)
    }

    pub fn severity(self) -> Severity {
        match self {
            ErrorClass::Cancelled | ErrorClass::UserDeclined => Severity::Quiet,
            ErrorClass::ResourceExhausted
            | ErrorClass::Transient
            | ErrorClass::Invalid
            | ErrorClass::ConditionNotMet => Severity::Actionable,
            ErrorClass::StateInconsistency
            | ErrorClass::Fatal
            | ErrorClass::NotFound
            | ErrorClass::Unauthorized => Severity::Loud,
        }
    }
}

impl CanaryError {
    pub fn class(&self) -> ErrorClass {
        match self {
            CanaryError::UserDeclined(_) => ErrorClass::UserDeclined,
            CanaryError::ResourceExhausted { .. } => ErrorClass::ResourceExhausted,
            CanaryError::Transient(_) | CanaryError::StorageExhausted { .. } => {
                ErrorClass::Transient
            }
            CanaryError::Reverted(_) | CanaryError::StateInconsistency(_) => {
                ErrorClass::StateInconsistency
            }
            CanaryError::Fatal(_) | CanaryError::Serialization(_) => ErrorClass::Fatal,
            CanaryError::Cancelled => ErrorClass::Cancelled,
            CanaryError::Invalid(_) => ErrorClass::Invalid,
            CanaryError::NotFound(_) => ErrorClass::NotFound,
            CanaryError::Unauthorized(_) => ErrorClass::Unauthorized,
            CanaryError::ConditionNotMet(_) => ErrorClass::ConditionNotMet,
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, CanaryError::Cancelled)
    }

    pub fn insufficient_funds(detail: impl Into<String>) -> Self {
        let detail = detail.into();
        Self::ResourceExhausted {
            resource: "funds for transaction fees".to_string(),
            remediation: format!(
                "top up the signing account with native gas tokens and try again ({})",
                detail
            ),
        }
    }

    pub fn id_mismatch(expected: u64, stored: u64) -> Self {
        Self::StateInconsistency(format!(
            "record stored under id {} reports id {}",
            expected, stored
        ))
    }
}

impl From<serde_json::Error> for CanaryError {
    fn from(err: serde_json::Error) -> Self {
        CanaryError::Serialization(err.to_string())
    }
}

const DECLINE_MARKERS: &[&str] = &[
    "user rejected",
    "rejected by user",
    "user denied",
    "denied transaction",
    "user cancelled",
    "action_rejected",
];

const FUNDS_MARKERS: &[&str] = &[
    "insufficient funds",
    "insufficient balance",
    "gas required exceeds",
    "exceeds balance",
];

const TRANSIENT_MARKERS: &[&str] = &[
    "timeout",
    "timed out",
    "rate limit",
    "too many requests",
    "429",
    "502",
    "503",
    "504",
    "temporarily unavailable",
    "service unavailable",
    "nonce too low",
    "replacement transaction underpriced",
    "internal json-rpc error",
    "connection reset",
    "connection refused",
    "network error",
];

/// Classify a free-form rejection reported by a wallet, RPC node, or provider.
///
/// Unrecognised reasons are treated as a contract revert.
pub fn classify_rejection(reason: &str) -> CanaryError {
    let lowered = reason.to_ascii_lowercase();
    let contains_any = |markers: &[&str]| markers.iter().any(|m| lowered.contains(m));

    if contains_any(DECLINE_MARKERS) {
        CanaryError::UserDeclined(reason.to_string())
    } else if contains_any(FUNDS_MARKERS) {
        CanaryError::insufficient_funds(reason)
    } else if contains_any(TRANSIENT_MARKERS) {
        CanaryError::Transient(reason.to_string())
    } else {
        CanaryError::Reverted(reason.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_wallet_rejections() {
        assert_eq!(
            classify_rejection("MetaMask Tx Signature: User rejected the request.").class(),
            ErrorClass::UserDeclined
        );
        assert_eq!(
            classify_rejection("insufficient funds for gas * price + value").class(),
            ErrorClass::ResourceExhausted
        );
        assert_eq!(
            classify_rejection("Internal JSON-RPC error.").class(),
            ErrorClass::Transient
        );
        assert_eq!(
            classify_rejection("execution reverted: Dossier not active").class(),
            ErrorClass::StateInconsistency
        );
    }

    #[test]
    fn only_transient_failures_retry() {
        assert!(CanaryError::Transient("503".into()).is_retryable());
        assert!(CanaryError::StorageExhausted {
            attempts: 4,
            last_reason: "down".into()
        }
        .is_retryable());
        assert!(!CanaryError::UserDeclined("no".into()).is_retryable());
        assert!(!CanaryError::insufficient_funds("0 balance").is_retryable());
        assert!(!CanaryError::Fatal("id collision".into()).is_retryable());
        assert!(!CanaryError::Cancelled.is_retryable());
    }

    #[test]
    fn resource_errors_carry_remediation() {
        let err = CanaryError::insufficient_funds("balance 0");
        let rendered = err.to_string();
        assert!(rendered.contains("top up"));
        assert_eq!(err.class().severity(), Severity::Actionable);
    }

    #[test]
    fn declines_and_cancellations_are_quiet() {
        assert_eq!(ErrorClass::Cancelled.severity(), Severity::Quiet);
        assert_eq!(ErrorClass::UserDeclined.severity(), Severity::Quiet);
        assert_eq!(ErrorClass::Fatal.severity(), Severity::Loud);
    }
}
