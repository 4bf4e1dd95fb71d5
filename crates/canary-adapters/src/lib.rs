//! Collaborator adapters for canary.
//!
//! Storage backends for Codex, Pinata and a local IPFS node, a local-directory
//! placeholder, an in-memory backend for tests, a ledger-gated cipher, a static
//! signer identity and a fault-injecting ledger wrapper.

#![deny(unsafe_code)]

pub mod cipher;
pub mod flaky;
pub mod http;
pub mod identity;
pub mod local;
pub mod memory;

pub use cipher::LedgerGatedCipher;
pub use flaky::FlakyLedger;
pub use http::{CodexBackend, IpfsBackend, PinataBackend};
pub use identity::StaticIdentity;
pub use local::LocalDirBackend;
pub use memory::MemoryStorageBackend;
