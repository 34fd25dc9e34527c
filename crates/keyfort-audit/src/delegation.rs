//! Lease delegation certificates
//!
//! A lease audit key is trusted because the user audit key signed a
//! certificate binding it to one lease, one signing key identifier and a
//! validity window. The certificate travels inside the `issueLease` entry
//! so verifiers resolve it without back-pointers.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use keyfort_crypto::{b64u_decode, b64u_encode, verify_ed25519};

use crate::error::{AuditError, Result};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeaseDelegation {
    pub lease_id: String,
    /// Signing key identifier the lease is bound to.
    pub kid: String,
    /// Unix milliseconds.
    pub issued_at: i64,
    pub expires_at: i64,
    /// base64url of the 32-byte lease audit public key.
    pub lease_audit_public_key: String,
    /// User audit key signature over the canonical certificate bytes.
    pub sig: String,
}

impl LeaseDelegation {
    /// Canonical bytes: compact JSON with `sig` removed, members in
    /// alphabetical order (same convention as the entries themselves).
    pub fn canonical_bytes(&self) -> Result<Vec<u8>> {
        let mut value = serde_json::to_value(self)?;
        let obj = value
            .as_object_mut()
            .ok_or_else(|| AuditError::SignerUnavailable("malformed delegation".into()))?;
        obj.remove("sig");
        Ok(serde_json::to_vec(&value)?)
    }

    pub fn public_key_bytes(&self) -> Result<[u8; 32]> {
        let bytes = b64u_decode(&self.lease_audit_public_key)?;
        bytes.try_into().map_err(|_| {
            AuditError::SignerUnavailable("lease audit public key must be 32 bytes".into())
        })
    }

    /// Check the certificate against the delegating user audit key.
    pub fn verify(&self, user_audit_public: &[u8; 32]) -> Result<bool> {
        let canonical = self.canonical_bytes()?;
        let sig = b64u_decode(&self.sig)?;
        let sig: [u8; 64] = match sig.try_into() {
            Ok(sig) => sig,
            Err(_) => return Ok(false),
        };
        Ok(verify_ed25519(user_audit_public, &canonical, &sig))
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        Ok(serde_json::from_value(value.clone())?)
    }
}

/// Build and sign a certificate with the user audit key handle.
pub async fn issue_lease_delegation(
    provider: &dyn keyfort_crypto::KeyProvider,
    user_handle: &keyfort_crypto::KeyHandle,
    lease_id: &str,
    kid: &str,
    issued_at: i64,
    expires_at: i64,
    lease_audit_public: &[u8; 32],
) -> Result<LeaseDelegation> {
    let mut cert = LeaseDelegation {
        lease_id: lease_id.to_string(),
        kid: kid.to_string(),
        issued_at,
        expires_at,
        lease_audit_public_key: b64u_encode(lease_audit_public),
        sig: String::new(),
    };
    let canonical = cert.canonical_bytes()?;
    let sig = provider.sign_ed25519(user_handle, &canonical).await?;
    cert.sig = b64u_encode(sig);
    Ok(cert)
}
