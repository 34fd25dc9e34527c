//! Key hierarchy
//!
//! Every wrapping key is derived from the master secret with HKDF over a
//! stored random salt: a direct-use KEK per signing key record and a
//! session KEK per lease. The signing private key exists as plaintext only
//! between generation and the immediate wrap, inside this module.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::info;
use zeroize::Zeroizing;

use keyfort_audit::{AppendRequest, AuditLog, SignAs};
use keyfort_config::Config;
use keyfort_crypto::{
    hkdf_sha256, random_bytes, thumbprint_of_raw_public, unwrap_key, wrap_key, KeyProvider,
};
use keyfort_store::{SideWrite, Store, StoreKind};

use crate::error::{KmsError, Result};
use crate::types::{current_kid_record, AuthCredentials, SigningKeyRecord};
use crate::unlock::{MasterSecret, UnlockManager};

const SIGNING_KEK_INFO: &[u8] = b"signing-kek/v1";
const LEASE_KEK_INFO: &[u8] = b"lease-kek/v1";

pub struct KeyHierarchy {
    store: Arc<dyn Store>,
    provider: Arc<dyn KeyProvider>,
    audit: Arc<AuditLog>,
    #[allow(dead_code)]
    config: Arc<Config>,
}

impl KeyHierarchy {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn KeyProvider>,
        audit: Arc<AuditLog>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            provider,
            audit,
            config,
        }
    }

    /// KEK for the at-rest signing key wrap.
    pub fn derive_direct_kek(ms: &MasterSecret, salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        derive_kek(ms, salt, SIGNING_KEK_INFO)
    }

    /// Per-lease session KEK.
    pub fn derive_session_kek(ms: &MasterSecret, lease_salt: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
        derive_kek(ms, lease_salt, LEASE_KEK_INFO)
    }

    /// Generate (or regenerate) the user's signing key under an unlock.
    ///
    /// The fresh private scalar is exported from its handle exactly once,
    /// wrapped under a new direct-use KEK and zeroized. Regeneration
    /// replaces the record and carries the endpoint binding over; existing
    /// leases keep their records but fail verification on the kid change.
    pub async fn generate_signing_key(
        &self,
        unlock: &UnlockManager,
        credentials: &AuthCredentials,
        regenerate: bool,
        request_id: &str,
    ) -> Result<SigningKeyRecord> {
        let user_id = credentials.user_id().to_string();
        let previous = self.current_record(&user_id).await?;
        if previous.is_some() && !regenerate {
            return Err(KmsError::AlreadySetup("signing-key".into()));
        }

        let ms = unlock.unlock(credentials).await?;

        let (handle, public_key) = self.provider.generate_p256().await?;
        let kid = thumbprint_of_raw_public(&public_key)?;
        let raw_private = self.provider.export_p256_once(&handle).await?;
        // The handle was only needed to mint the key; signing re-imports
        // from the wrapped blob.
        self.provider.drop_key(&handle).await;

        let kek_salt = random_bytes(32);
        let kek = derive_kek(&ms, &kek_salt, SIGNING_KEK_INFO)?;
        drop(ms);
        let wrapped_private = wrap_key(&kek, &raw_private, kid.as_bytes())?;
        drop(raw_private);

        let record = SigningKeyRecord {
            kid: kid.clone(),
            user_id: user_id.clone(),
            wrapped_private,
            kek_salt,
            aad: kid.clone(),
            public_key,
            algorithm: "ES256".to_string(),
            purpose: "token-signing".to_string(),
            created_at: Utc::now().timestamp_millis(),
            last_used_at: None,
            endpoint: previous.as_ref().and_then(|p| p.endpoint.clone()),
        };

        let op = if regenerate && previous.is_some() {
            "regenerateSigningKey"
        } else {
            "generateSigningKey"
        };
        let mut request = AppendRequest::new(op, SignAs::User(user_id.clone()), request_id)
            .user_id(&user_id)
            .kid(&kid)
            .details(json!({ "algorithm": "ES256" }))
            .write(SideWrite::Put {
                store: StoreKind::Keys,
                key: kid.clone(),
                value: serde_json::to_value(&record)?,
            })
            .write(SideWrite::Put {
                store: StoreKind::Meta,
                key: current_kid_record(&user_id),
                value: json!({ "kid": kid }),
            });
        if let Some(previous) = &previous {
            if previous.kid != kid {
                request = request.write(SideWrite::Delete {
                    store: StoreKind::Keys,
                    key: previous.kid.clone(),
                });
            }
        }
        self.audit.append(request).await?;

        info!(user = %user_id, kid = %kid, op, "signing key installed");
        Ok(record)
    }

    /// Unwrap the at-rest signing key with the master secret.
    pub fn unwrap_direct(
        ms: &MasterSecret,
        record: &SigningKeyRecord,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let kek = derive_kek(ms, &record.kek_salt, SIGNING_KEK_INFO)?;
        unwrap_key(&kek, &record.wrapped_private, record.aad.as_bytes())
            .map_err(|_| KmsError::Internal("signing key unwrap failed".into()))
    }

    /// The user's active signing key record.
    pub async fn current_record(&self, user_id: &str) -> Result<Option<SigningKeyRecord>> {
        let Some(pointer) = self
            .store
            .get(StoreKind::Meta, &current_kid_record(user_id))
            .await?
        else {
            return Ok(None);
        };
        let Some(kid) = pointer.get("kid").and_then(serde_json::Value::as_str) else {
            return Err(KmsError::Internal("corrupt current key pointer".into()));
        };
        self.record_by_kid(kid).await
    }

    pub async fn current_kid(&self, user_id: &str) -> Result<Option<String>> {
        Ok(self
            .current_record(user_id)
            .await?
            .map(|record| record.kid))
    }

    pub async fn record_by_kid(&self, kid: &str) -> Result<Option<SigningKeyRecord>> {
        let Some(value) = self.store.get(StoreKind::Keys, kid).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value).map_err(|e| {
            KmsError::Internal(format!("corrupt signing key record {kid}: {e}"))
        })?))
    }

    /// Every signing key record in the store.
    pub async fn all_records(&self) -> Result<Vec<SigningKeyRecord>> {
        let mut out = Vec::new();
        for (kid, value) in self.store.list(StoreKind::Keys).await? {
            out.push(serde_json::from_value(value).map_err(|e| {
                KmsError::Internal(format!("corrupt signing key record {kid}: {e}"))
            })?);
        }
        Ok(out)
    }
}

fn derive_kek(ms: &MasterSecret, salt: &[u8], info: &[u8]) -> Result<Zeroizing<[u8; 32]>> {
    let okm = hkdf_sha256(ms.bytes(), salt, info, 32)?;
    let mut kek = Zeroizing::new([0u8; 32]);
    kek.copy_from_slice(&okm);
    Ok(kek)
}
