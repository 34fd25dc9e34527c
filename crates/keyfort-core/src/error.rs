//! Service error kinds
//!
//! One enum carries every transport-neutral failure the service can
//! surface. `code()` is the wire string the dispatcher puts into error
//! envelopes; the display text is the free-text message. Messages never
//! contain secret material.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum KmsError {
    #[error("invalid format: {0}")]
    InvalidFormat(String),

    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("unknown method: {0}")]
    MethodUnknown(String),

    #[error("no enrollment exists for this user")]
    NotSetup,

    #[error("already set up: {0}")]
    AlreadySetup(String),

    #[error("credential rejected")]
    IncorrectCredential,

    #[error("passphrase must be at least 8 characters")]
    PassphraseTooShort,

    #[error("the last enrollment cannot be removed")]
    CannotRemoveLast,

    #[error("authenticator unavailable: {0}")]
    AuthenticatorUnavailable(String),

    #[error("authenticator does not support secret derivation")]
    AuthenticatorPrfUnsupported,

    #[error("policy violation: {0}")]
    PolicyViolation(String),

    #[error("quota exceeded: {counter}")]
    QuotaExceeded { counter: &'static str },

    #[error("lease is bound to a different signing key")]
    WrongKey,

    #[error("lease has expired")]
    Expired,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("audit chain tampered at seq {seq}")]
    Tampered { seq: u64 },

    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("credential collection timed out")]
    PopupTimeout,

    #[error("subscription request timed out")]
    SubscriptionTimeout,

    #[error("test notification timed out")]
    NotificationTimeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl KmsError {
    /// Stable wire code for the error envelope.
    pub fn code(&self) -> &'static str {
        match self {
            KmsError::InvalidFormat(_) => "invalid-format",
            KmsError::InvalidParam(_) => "invalid-param",
            KmsError::MethodUnknown(_) => "method-unknown",
            KmsError::NotSetup => "not-setup",
            KmsError::AlreadySetup(_) => "already-setup",
            KmsError::IncorrectCredential => "incorrect-credential",
            KmsError::PassphraseTooShort => "passphrase-too-short",
            KmsError::CannotRemoveLast => "cannot-remove-last",
            KmsError::AuthenticatorUnavailable(_) => "authenticator-unavailable",
            KmsError::AuthenticatorPrfUnsupported => "authenticator-prf-unsupported",
            KmsError::PolicyViolation(_) => "policy-violation",
            KmsError::QuotaExceeded { .. } => "quota-exceeded",
            KmsError::WrongKey => "wrong-key",
            KmsError::Expired => "expired",
            KmsError::NotFound(_) => "not-found",
            KmsError::InvalidEndpoint(_) => "invalid-endpoint",
            KmsError::Tampered { .. } => "tampered",
            KmsError::StorageUnavailable(_) => "storage-unavailable",
            KmsError::PopupTimeout => "popup-timeout",
            KmsError::SubscriptionTimeout => "subscription-timeout",
            KmsError::NotificationTimeout => "notification-timeout",
            KmsError::Internal(_) => "internal",
        }
    }
}

impl From<keyfort_store::StoreError> for KmsError {
    fn from(e: keyfort_store::StoreError) -> Self {
        match e {
            keyfort_store::StoreError::Unavailable(msg) => KmsError::StorageUnavailable(msg),
            other => KmsError::Internal(other.to_string()),
        }
    }
}

impl From<keyfort_crypto::CryptoError> for KmsError {
    fn from(e: keyfort_crypto::CryptoError) -> Self {
        match e {
            keyfort_crypto::CryptoError::InvalidFormat(msg) => KmsError::InvalidFormat(msg),
            keyfort_crypto::CryptoError::CipherFailure(msg) => KmsError::Internal(msg),
        }
    }
}

impl From<keyfort_audit::AuditError> for KmsError {
    fn from(e: keyfort_audit::AuditError) -> Self {
        match e {
            keyfort_audit::AuditError::Tampered { seq, .. } => KmsError::Tampered { seq },
            keyfort_audit::AuditError::Store(inner) => inner.into(),
            other => KmsError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for KmsError {
    fn from(e: serde_json::Error) -> Self {
        KmsError::Internal(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, KmsError>;
