//! Crate-wide error taxonomy.
//!
//! Each subsystem gets its own `thiserror` enum ([`crate::storage::StorageError`],
//! [`crate::chat::ChatError`]); [`CoreError`] is the type surfaced by the
//! pairing/messaging core and unions the five error classes from the design:
//! not-ready, transient, forbidden, decryption-mismatch and timeout.

use thiserror::Error;

use crate::chat::ChatError;
use crate::storage::StorageError;

/// The five error classes the pairing/messaging core can surface.
#[derive(Debug, Error)]
pub enum CoreError {
    /// An operation was invoked before `start()` completed.
    #[error("client is not ready — start() has not completed")]
    NotReady,

    /// A network or sync-loop failure that callers may retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// The chat substrate rejected a send or join.
    #[error("forbidden")]
    Forbidden,

    /// Ciphertext did not authenticate under the expected key. Expected for
    /// bus-broadcast traffic not addressed to us — callers installed through
    /// `listen_for_encrypted_message` never see this, since non-matching
    /// decrypts are dropped before the callback runs.
    #[error("decryption did not authenticate")]
    DecryptionMismatch,

    /// A bounded wait (room-member wait, join retry) ran out of attempts.
    #[error("timed out waiting for {0}")]
    Timeout(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Chat(#[from] ChatError),

    #[error("serialization error: {0}")]
    Serde(String),
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::Serde(e.to_string())
    }
}

impl From<crate::store::StoreError> for CoreError {
    fn from(e: crate::store::StoreError) -> Self {
        CoreError::Transient(e.to_string())
    }
}
