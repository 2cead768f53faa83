use crate::*;

use thiserror::Error;

/// Error types
///
/// Negative verification outcomes are deliberately not errors - see
/// [`Verification`] for the non-throwing result type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("pollsat: secure storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("pollsat: signature error: {0}")]
    SignatureError(#[from] ed25519_dalek::SignatureError),

    #[error("pollsat: no device keypair in secure storage")]
    NoKeyPair,

    #[error("pollsat: stored device keypair is corrupt")]
    KeyPairCorrupt,

    #[error("pollsat: JSON error: {0}")]
    JSONSerialization(#[from] serde_json::Error),

    #[error("pollsat: transient network error: {0}")]
    NetworkTransient(String),

    #[error("pollsat: ledger submission outcome unknown: {0}")]
    LedgerSubmissionUnknown(String),

    #[error("pollsat: not found: {0}")]
    NotFound(String),

    #[error("pollsat: double-batching detected for vote {0}")]
    DoubleBatchingDetected(uuid::Uuid),

    #[error("pollsat: invalid anchor status transition: {0} -> {1}")]
    InvalidStatusTransition(AnchorStatus, AnchorStatus),

    #[error("pollsat: cannot build a merkle tree from an empty batch")]
    EmptyBatch,
}
