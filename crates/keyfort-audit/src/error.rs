//! Error types for the audit log

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("audit chain tampered at seq {seq}: {reason}")]
    Tampered { seq: u64, reason: String },

    #[error("audit signer unavailable: {0}")]
    SignerUnavailable(String),

    #[error("malformed audit record at seq {seq}")]
    MalformedRecord { seq: u64 },

    #[error(transparent)]
    Store(#[from] keyfort_store::StoreError),

    #[error(transparent)]
    Crypto(#[from] keyfort_crypto::CryptoError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, AuditError>;
