//! Stored records and credential types

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use keyfort_audit::LeaseDelegation;
use keyfort_crypto::b64::serde_b64;
use keyfort_crypto::WrappedBlob;

/// Authentication credentials, one variant per enrollment method. Every
/// variant names its user; validators enforce the method/field pairing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum AuthCredentials {
    #[serde(rename = "passphrase", rename_all = "camelCase")]
    Passphrase { user_id: String, passphrase: String },

    #[serde(rename = "authenticator-derived", rename_all = "camelCase")]
    AuthenticatorDerived {
        user_id: String,
        credential_id: String,
        /// base64url of the 32-byte authenticator secret.
        authenticator_output: String,
    },

    #[serde(rename = "authenticator-gate", rename_all = "camelCase")]
    AuthenticatorGate {
        user_id: String,
        credential_id: String,
    },
}

impl AuthCredentials {
    pub fn user_id(&self) -> &str {
        match self {
            AuthCredentials::Passphrase { user_id, .. }
            | AuthCredentials::AuthenticatorDerived { user_id, .. }
            | AuthCredentials::AuthenticatorGate { user_id, .. } => user_id,
        }
    }

    pub fn method(&self) -> EnrollmentMethod {
        match self {
            AuthCredentials::Passphrase { .. } => EnrollmentMethod::Passphrase,
            AuthCredentials::AuthenticatorDerived { .. } => EnrollmentMethod::AuthenticatorDerived,
            AuthCredentials::AuthenticatorGate { .. } => EnrollmentMethod::AuthenticatorGate,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnrollmentMethod {
    #[serde(rename = "passphrase")]
    Passphrase,
    #[serde(rename = "authenticator-derived")]
    AuthenticatorDerived,
    #[serde(rename = "authenticator-gate")]
    AuthenticatorGate,
}

impl EnrollmentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            EnrollmentMethod::Passphrase => "passphrase",
            EnrollmentMethod::AuthenticatorDerived => "authenticator-derived",
            EnrollmentMethod::AuthenticatorGate => "authenticator-gate",
        }
    }
}

/// Stored wrapping of the master secret under one enrollment method.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method")]
pub enum EnrollmentRecord {
    #[serde(rename = "passphrase", rename_all = "camelCase")]
    Passphrase {
        #[serde(with = "serde_b64")]
        salt: Vec<u8>,
        iterations: u32,
        /// SHA-256 over the full 64-byte PBKDF2 output.
        #[serde(with = "serde_b64")]
        verification_hash: Vec<u8>,
        wrapped_ms: WrappedBlob,
        created_at: i64,
    },

    #[serde(rename = "authenticator-derived", rename_all = "camelCase")]
    AuthenticatorDerived {
        credential_id: String,
        #[serde(with = "serde_b64")]
        app_salt: Vec<u8>,
        wrapped_ms: WrappedBlob,
        created_at: i64,
    },

    #[serde(rename = "authenticator-gate", rename_all = "camelCase")]
    AuthenticatorGate {
        credential_id: String,
        /// Deterministic: SHA-256 of the credential identifier.
        #[serde(with = "serde_b64")]
        app_salt: Vec<u8>,
        wrapped_ms: WrappedBlob,
        created_at: i64,
    },
}

impl EnrollmentRecord {
    pub fn method(&self) -> EnrollmentMethod {
        match self {
            EnrollmentRecord::Passphrase { .. } => EnrollmentMethod::Passphrase,
            EnrollmentRecord::AuthenticatorDerived { .. } => EnrollmentMethod::AuthenticatorDerived,
            EnrollmentRecord::AuthenticatorGate { .. } => EnrollmentMethod::AuthenticatorGate,
        }
    }

    pub fn wrapped_ms(&self) -> &WrappedBlob {
        match self {
            EnrollmentRecord::Passphrase { wrapped_ms, .. }
            | EnrollmentRecord::AuthenticatorDerived { wrapped_ms, .. }
            | EnrollmentRecord::AuthenticatorGate { wrapped_ms, .. } => wrapped_ms,
        }
    }

    pub fn created_at(&self) -> i64 {
        match self {
            EnrollmentRecord::Passphrase { created_at, .. }
            | EnrollmentRecord::AuthenticatorDerived { created_at, .. }
            | EnrollmentRecord::AuthenticatorGate { created_at, .. } => *created_at,
        }
    }
}

/// Push endpoint bound to a signing key record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EndpointBinding {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,
    /// Client ECDH public key, 65 bytes.
    #[serde(with = "serde_b64")]
    pub p256dh: Vec<u8>,
    /// Client auth secret, 16 bytes.
    #[serde(with = "serde_b64")]
    pub auth: Vec<u8>,
    pub endpoint_id: String,
    pub created_at: i64,
}

/// The persisted signing key: private half wrapped, public half raw.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningKeyRecord {
    /// JWK thumbprint of the public key.
    pub kid: String,
    pub user_id: String,
    pub wrapped_private: WrappedBlob,
    /// Salt the direct-use KEK is derived with.
    #[serde(with = "serde_b64")]
    pub kek_salt: Vec<u8>,
    /// Associated data the wrap is bound to (the kid).
    pub aad: String,
    /// Uncompressed SEC1 point, 65 bytes.
    #[serde(with = "serde_b64")]
    pub public_key: Vec<u8>,
    pub algorithm: String,
    pub purpose: String,
    pub created_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<EndpointBinding>,
}

/// Per-endpoint send counter, fixed one-minute window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointCounter {
    pub count: u32,
    pub reset_at: i64,
}

/// Quota counters for one lease. The burst bucket carries fractional
/// refill; the windowed counters reset at their recorded timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuotaState {
    pub tokens_this_hour: u32,
    pub hour_reset_at: i64,
    pub sends_this_minute: u32,
    pub minute_reset_at: i64,
    pub burst_remaining: f64,
    pub burst_refill_at: i64,
    #[serde(default)]
    pub per_endpoint: BTreeMap<String, EndpointCounter>,
}

impl QuotaState {
    pub fn new(now_ms: i64, burst_capacity: u32) -> Self {
        Self {
            tokens_this_hour: 0,
            hour_reset_at: now_ms + 3_600_000,
            sends_this_minute: 0,
            minute_reset_at: now_ms + 60_000,
            burst_remaining: burst_capacity as f64,
            burst_refill_at: now_ms,
            per_endpoint: BTreeMap::new(),
        }
    }
}

/// Persisted lease. The session KEK never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseRecord {
    pub lease_id: String,
    pub user_id: String,
    pub ttl_hours: u32,
    pub created_at: i64,
    pub expires_at: i64,
    /// Signing key material rewrapped under the session KEK.
    pub wrapped_signing_key: WrappedBlob,
    /// Salt the session KEK is derived with.
    #[serde(with = "serde_b64")]
    pub lease_salt: Vec<u8>,
    /// Signing key the lease is bound to.
    pub kid: String,
    pub delegation: LeaseDelegation,
    pub quota: QuotaState,
    pub auto_extend: bool,
}

/// Outcome of `verifyLease`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseVerification {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Per-lease outcome of `extendLeases`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtendOutcome {
    pub lease_id: String,
    pub status: ExtendStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtendStatus {
    Extended,
    Skipped,
    Failed,
}

/// Storage key for an enrollment. Only the per-user namespaced form exists;
/// anything else is rejected upstream.
pub fn enrollment_key(method: EnrollmentMethod, user_id: &str) -> String {
    format!("enrollment:{}:{}", method.as_str(), user_id)
}

/// Meta record naming the user's current signing key.
pub fn current_kid_record(user_id: &str) -> String {
    format!("signingKey.current.{user_id}")
}
