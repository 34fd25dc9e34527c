//! Error types for the crypto primitives

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CryptoError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("cipher failure: {0}")]
    CipherFailure(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
