//! Keyfort audit log
//!
//! Append-only, hash-chained, signed. Every mutation of the service lands
//! here as exactly one entry before the mutation's response is emitted.
//!
//! Three signer tiers share the chain. The system key signs the first
//! entry of a fresh install and the delegation of each user audit key; the
//! user key signs user-authenticated operations and delegates one audit
//! key per lease; lease keys sign the offline operations their lease
//! performs. Verification re-derives every link and resolves each signer
//! through its delegation entry, so a verifier needs nothing beyond the
//! store contents and the system public key recorded in `meta`.
//!
//! The canonical byte encoding an entry is hashed over is the compact JSON
//! serialization of the entry with the `sig` and `chainHash` members
//! removed; members order alphabetically, byte fields are base64url
//! strings, numbers are decimal. External verifiers can reproduce
//! `chainHash` from that description alone.

pub mod delegation;
pub mod entry;
pub mod error;
pub mod log;
pub mod verify;

pub use delegation::LeaseDelegation;
pub use entry::{ed25519_kid, AuditEntry, SignerRole};
pub use error::{AuditError, Result};
pub use log::{AppendRequest, AuditLog, SignAs, SignerRef};
pub use verify::{verify_chain, ChainVerification};

/// Fixed meta-store record names.
pub const SYSTEM_PUBLIC_KEY_RECORD: &str = "audit.system.publicKey";

pub fn user_public_key_record(user_id: &str) -> String {
    format!("audit.user.{user_id}.publicKey")
}

/// Provider registration names for the audit signers.
pub fn system_signer_name() -> String {
    "audit.system".to_string()
}

pub fn user_signer_name(user_id: &str) -> String {
    format!("audit.user.{user_id}")
}

pub fn lease_signer_name(lease_id: &str) -> String {
    format!("audit.lease.{lease_id}")
}
