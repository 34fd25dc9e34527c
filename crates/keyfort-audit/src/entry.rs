//! Audit entry type and canonical encoding

use serde::{Deserialize, Serialize};
use serde_json::Value;

use keyfort_crypto::{b64u_encode, sha256};

use crate::error::{AuditError, Result};

/// Which tier signed an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignerRole {
    System,
    User,
    Lease,
}

/// One link of the chain.
///
/// `prevHash` of entry N equals `chainHash` of entry N-1; entry 1 carries
/// the empty string. `sig` is the Ed25519 signature over the 32 raw bytes
/// of `chainHash`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub seq: u64,
    pub op: String,
    pub role: SignerRole,
    /// Identifier of the signing audit key: base64url(SHA-256(public key)).
    pub signer_kid: String,
    pub prev_hash: String,
    pub chain_hash: String,
    pub sig: String,
    /// Unix milliseconds.
    pub ts: i64,
    pub request_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    pub details: Value,
}

impl AuditEntry {
    /// Canonical bytes: the entry serialized compactly with `sig` and
    /// `chainHash` removed. serde_json's default map keeps members in
    /// alphabetical order, which is the published encoding.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        let obj = value
            .as_object_mut()
            .ok_or(AuditError::MalformedRecord { seq: self.seq })?;
        obj.remove("sig");
        obj.remove("chainHash");
        Ok(serde_json::to_vec(&value)?)
    }

    /// SHA-256 over the canonical bytes.
    pub fn compute_chain_hash(&self) -> Result<[u8; 32]> {
        Ok(sha256(&self.canonical_bytes()?))
    }
}

/// Identifier of an Ed25519 audit public key.
pub fn ed25519_kid(public_key: &[u8; 32]) -> String {
    b64u_encode(sha256(public_key))
}
