//! Chain verification
//!
//! A verifier needs only the store contents: the system public key comes
//! from `meta`, user keys from their system-signed delegation entries and
//! lease keys from the certificates embedded in `issueLease` entries.
//! Verification walks the chain once, front to back, and stops reporting
//! at the earliest offending sequence number.

use std::collections::HashMap;

use serde_json::Value;

use keyfort_crypto::{b64u_decode, verify_ed25519};
use keyfort_store::{Store, StoreKind};

use crate::delegation::LeaseDelegation;
use crate::entry::{ed25519_kid, AuditEntry, SignerRole};
use crate::error::Result;
use crate::SYSTEM_PUBLIC_KEY_RECORD;

/// Outcome of a verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainVerification {
    pub valid: bool,
    pub entries: u64,
    pub first_failed: Option<u64>,
    pub reason: Option<String>,
}

impl ChainVerification {
    fn valid(entries: u64) -> Self {
        Self {
            valid: true,
            entries,
            first_failed: None,
            reason: None,
        }
    }

    fn tampered(entries: u64, seq: u64, reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            entries,
            first_failed: Some(seq),
            reason: Some(reason.into()),
        }
    }
}

/// Verify the whole chain. Store failures surface as errors; any chain
/// defect comes back as a `tampered` result, never an `Err`.
pub async fn verify_chain(store: &dyn Store) -> Result<ChainVerification> {
    let records = store.audit_range(1, None).await?;
    let total = records.len() as u64;
    if records.is_empty() {
        return Ok(ChainVerification::valid(0));
    }

    let system_public = load_system_public(store).await?;

    let mut user_keys: HashMap<String, ([u8; 32], String)> = HashMap::new();
    let mut lease_keys: HashMap<String, LeaseDelegation> = HashMap::new();
    let mut prev_seq = 0u64;
    let mut prev_hash = String::new();

    for (stored_seq, value) in records {
        let entry: AuditEntry = match serde_json::from_value(value) {
            Ok(entry) => entry,
            Err(_) => return Ok(ChainVerification::tampered(total, stored_seq, "malformed entry")),
        };
        let seq = stored_seq;
        if entry.seq != seq {
            return Ok(ChainVerification::tampered(
                total,
                seq,
                "sequence field does not match record key",
            ));
        }
        if seq != prev_seq + 1 {
            return Ok(ChainVerification::tampered(total, seq, "sequence gap"));
        }

        // Re-derive the hash before trusting anything else in the entry.
        let digest = match entry.compute_chain_hash() {
            Ok(digest) => digest,
            Err(_) => return Ok(ChainVerification::tampered(total, seq, "canonical encoding failed")),
        };
        match b64u_decode(&entry.chain_hash) {
            Ok(stored) if stored == digest => {}
            _ => return Ok(ChainVerification::tampered(total, seq, "chain hash mismatch")),
        }
        if entry.prev_hash != prev_hash {
            return Ok(ChainVerification::tampered(total, seq, "previous hash mismatch"));
        }

        let Some(sig) = decode_sig(&entry.sig) else {
            return Ok(ChainVerification::tampered(total, seq, "malformed signature"));
        };

        match entry.role {
            SignerRole::System => {
                let Some(public) = system_public else {
                    return Ok(ChainVerification::tampered(
                        total,
                        seq,
                        "system public key missing from meta",
                    ));
                };
                if entry.signer_kid != ed25519_kid(&public) {
                    return Ok(ChainVerification::tampered(total, seq, "unknown system signer"));
                }
                if !verify_ed25519(&public, &digest, &sig) {
                    return Ok(ChainVerification::tampered(total, seq, "bad system signature"));
                }
            }
            SignerRole::User => {
                let Some(user_id) = entry.user_id.as_deref() else {
                    return Ok(ChainVerification::tampered(total, seq, "user entry without userId"));
                };
                let Some((public, kid)) = user_keys.get(user_id) else {
                    return Ok(ChainVerification::tampered(
                        total,
                        seq,
                        "user audit key was never delegated",
                    ));
                };
                if &entry.signer_kid != kid {
                    return Ok(ChainVerification::tampered(total, seq, "unknown user signer"));
                }
                if !verify_ed25519(public, &digest, &sig) {
                    return Ok(ChainVerification::tampered(total, seq, "bad user signature"));
                }
            }
            SignerRole::Lease => {
                let Some(cert) = lease_keys.get(&entry.signer_kid) else {
                    return Ok(ChainVerification::tampered(
                        total,
                        seq,
                        "lease audit key was never delegated",
                    ));
                };
                // The delegation must cover the signing key the entry
                // claims to act for.
                if entry.kid.as_deref() != Some(cert.kid.as_str()) {
                    return Ok(ChainVerification::tampered(
                        total,
                        seq,
                        "lease delegation does not cover claimed kid",
                    ));
                }
                let Ok(public) = cert.public_key_bytes() else {
                    return Ok(ChainVerification::tampered(total, seq, "malformed lease key"));
                };
                if !verify_ed25519(&public, &digest, &sig) {
                    return Ok(ChainVerification::tampered(total, seq, "bad lease signature"));
                }
            }
        }

        // Collect delegations introduced by this (now verified) entry.
        if entry.op == "enroll-user-audit-key" {
            let (Some(user_id), Some(public)) = (
                entry.user_id.as_deref(),
                entry
                    .details
                    .get("userAuditPublicKey")
                    .and_then(Value::as_str)
                    .and_then(decode_public),
            ) else {
                return Ok(ChainVerification::tampered(total, seq, "malformed user delegation"));
            };
            user_keys.insert(user_id.to_string(), (public, ed25519_kid(&public)));
        }
        if matches!(entry.role, SignerRole::User) {
            if let Some(cert_value) = entry.details.get("delegation") {
                let Ok(cert) = LeaseDelegation::from_value(cert_value) else {
                    return Ok(ChainVerification::tampered(total, seq, "malformed lease delegation"));
                };
                let signer_public = entry
                    .user_id
                    .as_deref()
                    .and_then(|uid| user_keys.get(uid))
                    .map(|(public, _)| *public);
                let Some(signer_public) = signer_public else {
                    return Ok(ChainVerification::tampered(total, seq, "delegating user unknown"));
                };
                match cert.verify(&signer_public) {
                    Ok(true) => {
                        let Ok(lease_public) = cert.public_key_bytes() else {
                            return Ok(ChainVerification::tampered(total, seq, "malformed lease key"));
                        };
                        lease_keys.insert(ed25519_kid(&lease_public), cert);
                    }
                    _ => {
                        return Ok(ChainVerification::tampered(
                            total,
                            seq,
                            "invalid lease delegation signature",
                        ))
                    }
                }
            }
        }

        prev_seq = seq;
        prev_hash = entry.chain_hash;
    }

    Ok(ChainVerification::valid(total))
}

async fn load_system_public(store: &dyn Store) -> Result<Option<[u8; 32]>> {
    let Some(record) = store.get(StoreKind::Meta, SYSTEM_PUBLIC_KEY_RECORD).await? else {
        return Ok(None);
    };
    Ok(record
        .get("publicKey")
        .and_then(Value::as_str)
        .and_then(decode_public))
}

fn decode_public(text: &str) -> Option<[u8; 32]> {
    b64u_decode(text).ok()?.try_into().ok()
}

fn decode_sig(text: &str) -> Option<[u8; 64]> {
    b64u_decode(text).ok()?.try_into().ok()
}
