//! Enrollment and unlock
//!
//! An enrollment is a wrapping of the master secret under a key derived
//! from one authentication method. The master secret itself exists in
//! memory only inside [`UnlockManager::with_unlock`] and is zeroized on
//! every exit path.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use keyfort_audit::{AppendRequest, AuditLog, SignAs};
use keyfort_config::Config;
use keyfort_crypto::{
    b64u_decode, hkdf_sha256, pbkdf2_sha256, random_array, sha256, unwrap_key, wrap_key,
};
use keyfort_store::{SideWrite, Store, StoreKind};

use crate::error::{KmsError, Result};
use crate::types::{enrollment_key, AuthCredentials, EnrollmentMethod, EnrollmentRecord};

/// Derivation label for enrollment wrapping keys.
const KEK_WRAP_INFO: &[u8] = b"KEK-wrap/v1";

const MIN_PASSPHRASE_LEN: usize = 8;

/// The 32-byte root of the wrapping hierarchy. Zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct MasterSecret([u8; 32]);

impl MasterSecret {
    pub fn generate() -> Self {
        Self(random_array())
    }

    pub(crate) fn from_slice(bytes: &[u8]) -> Result<Self> {
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| KmsError::Internal("master secret must be 32 bytes".into()))?;
        Ok(Self(array))
    }

    pub fn bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// Parameters for an additional enrollment on an already set up user.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "camelCase")]
pub enum NewEnrollment {
    #[serde(rename = "passphrase", rename_all = "camelCase")]
    Passphrase { passphrase: String },

    #[serde(rename = "authenticator-derived", rename_all = "camelCase")]
    AuthenticatorDerived {
        credential_id: String,
        authenticator_output: String,
        app_salt: String,
    },

    #[serde(rename = "authenticator-gate", rename_all = "camelCase")]
    AuthenticatorGate { credential_id: String },
}

/// Summary of one enrollment, safe to hand to the host.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrollmentInfo {
    pub enrollment_id: String,
    pub method: EnrollmentMethod,
    pub created_at: i64,
}

pub struct UnlockManager {
    store: Arc<dyn Store>,
    audit: Arc<AuditLog>,
    config: Arc<Config>,
}

impl UnlockManager {
    pub fn new(store: Arc<dyn Store>, audit: Arc<AuditLog>, config: Arc<Config>) -> Self {
        Self {
            store,
            audit,
            config,
        }
    }

    /// Run `f` with the unlocked master secret. The secret is recovered
    /// from the credential's enrollment and zeroized when the scope ends,
    /// success or failure. The closure derives what it needs while the
    /// secret is live; the returned future cannot keep the borrow.
    pub async fn with_unlock<T, F, Fut>(&self, credentials: &AuthCredentials, f: F) -> Result<T>
    where
        F: FnOnce(&MasterSecret) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let ms = self.unlock(credentials).await?;
        let fut = f(&ms);
        drop(ms);
        fut.await
    }

    /// Recover the master secret. Private to the crate; everything outside
    /// goes through [`UnlockManager::with_unlock`].
    pub(crate) async fn unlock(&self, credentials: &AuthCredentials) -> Result<MasterSecret> {
        let user_id = credentials.user_id();
        validate_user_id(user_id)?;
        let key = enrollment_key(credentials.method(), user_id);
        let record = self
            .load_enrollment(&key)
            .await?
            .ok_or(KmsError::NotSetup)?;

        let wrapping_key = match (credentials, &record) {
            (
                AuthCredentials::Passphrase { passphrase, .. },
                EnrollmentRecord::Passphrase {
                    salt,
                    iterations,
                    verification_hash,
                    ..
                },
            ) => {
                let derived = pbkdf2_sha256(passphrase.as_bytes(), salt, *iterations, 64);
                if sha256(&derived) != verification_hash.as_slice() {
                    return Err(KmsError::IncorrectCredential);
                }
                key_from_first_half(&derived)
            }
            (
                AuthCredentials::AuthenticatorDerived {
                    authenticator_output,
                    ..
                },
                EnrollmentRecord::AuthenticatorDerived { app_salt, .. },
            ) => {
                let output = decode_authenticator_output(authenticator_output)?;
                derive_hkdf_key(&output, app_salt)?
            }
            (
                AuthCredentials::AuthenticatorGate { credential_id, .. },
                EnrollmentRecord::AuthenticatorGate {
                    app_salt,
                    credential_id: enrolled,
                    ..
                },
            ) => {
                if credential_id != enrolled {
                    return Err(KmsError::IncorrectCredential);
                }
                let salt = sha256(credential_id.as_bytes());
                if salt != app_salt.as_slice() {
                    return Err(KmsError::IncorrectCredential);
                }
                derive_hkdf_key(&salt, app_salt)?
            }
            // Method tag and stored record diverge only if the store was
            // edited out-of-band.
            _ => return Err(KmsError::IncorrectCredential),
        };

        let plaintext = unwrap_key(&wrapping_key, record.wrapped_ms(), key.as_bytes())
            .map_err(|_| KmsError::IncorrectCredential)?;
        MasterSecret::from_slice(&plaintext)
    }

    /// First enrollment for a user: generates the master secret and wraps
    /// it under a passphrase-derived key.
    pub async fn setup_passphrase(
        &self,
        user_id: &str,
        passphrase: &str,
        request_id: &str,
    ) -> Result<()> {
        validate_user_id(user_id)?;
        if passphrase.len() < MIN_PASSPHRASE_LEN {
            return Err(KmsError::PassphraseTooShort);
        }
        self.reject_existing_setup(user_id).await?;

        let ms = MasterSecret::generate();
        let record = self.passphrase_record(user_id, passphrase, &ms)?;
        self.persist_setup(user_id, EnrollmentMethod::Passphrase, record, request_id)
            .await
    }

    /// First enrollment via an authenticator-derived secret.
    pub async fn setup_authenticator_derived(
        &self,
        user_id: &str,
        credential_id: &str,
        authenticator_output: &str,
        app_salt: &str,
        request_id: &str,
    ) -> Result<()> {
        validate_user_id(user_id)?;
        self.reject_existing_setup(user_id).await?;

        let ms = MasterSecret::generate();
        let record =
            self.derived_record(user_id, credential_id, authenticator_output, app_salt, &ms)?;
        self.persist_setup(
            user_id,
            EnrollmentMethod::AuthenticatorDerived,
            record,
            request_id,
        )
        .await
    }

    /// First enrollment gated by a platform authenticator. The wrapping key
    /// is deterministic; the gate itself is enforced by the collaborator
    /// that owns the ceremony.
    pub async fn setup_authenticator_gate(
        &self,
        user_id: &str,
        credential_id: &str,
        request_id: &str,
    ) -> Result<()> {
        validate_user_id(user_id)?;
        self.reject_existing_setup(user_id).await?;

        let ms = MasterSecret::generate();
        let record = self.gate_record(user_id, credential_id, &ms)?;
        self.persist_setup(
            user_id,
            EnrollmentMethod::AuthenticatorGate,
            record,
            request_id,
        )
        .await
    }

    /// Add another method to an existing user. The master secret is
    /// recovered through `credentials` and rewrapped, so every enrollment
    /// opens the same secret.
    pub async fn add_enrollment(
        &self,
        credentials: &AuthCredentials,
        new: &NewEnrollment,
        request_id: &str,
    ) -> Result<EnrollmentInfo> {
        let user_id = credentials.user_id().to_string();
        let ms = self.unlock(credentials).await?;

        let (method, record) = match new {
            NewEnrollment::Passphrase { passphrase } => {
                if passphrase.len() < MIN_PASSPHRASE_LEN {
                    return Err(KmsError::PassphraseTooShort);
                }
                (
                    EnrollmentMethod::Passphrase,
                    self.passphrase_record(&user_id, passphrase, &ms)?,
                )
            }
            NewEnrollment::AuthenticatorDerived {
                credential_id,
                authenticator_output,
                app_salt,
            } => (
                EnrollmentMethod::AuthenticatorDerived,
                self.derived_record(&user_id, credential_id, authenticator_output, app_salt, &ms)?,
            ),
            NewEnrollment::AuthenticatorGate { credential_id } => (
                EnrollmentMethod::AuthenticatorGate,
                self.gate_record(&user_id, credential_id, &ms)?,
            ),
        };
        drop(ms);

        let key = enrollment_key(method, &user_id);
        if self.load_enrollment(&key).await?.is_some() {
            return Err(KmsError::AlreadySetup(method.as_str().to_string()));
        }
        let created_at = record.created_at();

        self.audit
            .append(
                AppendRequest::new("addEnrollment", SignAs::User(user_id.clone()), request_id)
                    .user_id(&user_id)
                    .details(json!({ "enrollmentMethod": method.as_str() }))
                    .write(SideWrite::Put {
                        store: StoreKind::Meta,
                        key: key.clone(),
                        value: serde_json::to_value(&record)?,
                    }),
            )
            .await?;

        Ok(EnrollmentInfo {
            enrollment_id: key,
            method,
            created_at,
        })
    }

    /// Remove one enrollment. The last remaining enrollment for a user is
    /// never removed - losing it would orphan the master secret.
    pub async fn remove_enrollment(
        &self,
        enrollment_id: &str,
        credentials: &AuthCredentials,
        request_id: &str,
    ) -> Result<()> {
        let user_id = credentials.user_id().to_string();
        // Prove the caller can open this user's secret before mutating.
        drop(self.unlock(credentials).await?);

        if !enrollment_id
            .strip_prefix("enrollment:")
            .map(|rest| rest.ends_with(&format!(":{user_id}")))
            .unwrap_or(false)
        {
            return Err(KmsError::NotFound(format!(
                "enrollment {enrollment_id} for this user"
            )));
        }
        if self.load_enrollment(enrollment_id).await?.is_none() {
            return Err(KmsError::NotFound(format!("enrollment {enrollment_id}")));
        }
        if self.enrollments(&user_id).await?.len() <= 1 {
            return Err(KmsError::CannotRemoveLast);
        }

        self.audit
            .append(
                AppendRequest::new("removeEnrollment", SignAs::User(user_id.clone()), request_id)
                    .user_id(&user_id)
                    .details(json!({ "enrollmentId": enrollment_id }))
                    .write(SideWrite::Delete {
                        store: StoreKind::Meta,
                        key: enrollment_id.to_string(),
                    }),
            )
            .await?;
        Ok(())
    }

    pub async fn enrollments(&self, user_id: &str) -> Result<Vec<EnrollmentInfo>> {
        let suffix = format!(":{user_id}");
        let mut out = Vec::new();
        for (key, value) in self.store.list(StoreKind::Meta).await? {
            if !key.starts_with("enrollment:") || !key.ends_with(&suffix) {
                continue;
            }
            let record: EnrollmentRecord = serde_json::from_value(value)
                .map_err(|e| KmsError::Internal(format!("corrupt enrollment {key}: {e}")))?;
            out.push(EnrollmentInfo {
                enrollment_id: key,
                method: record.method(),
                created_at: record.created_at(),
            });
        }
        Ok(out)
    }

    pub async fn is_setup(&self, user_id: Option<&str>) -> Result<bool> {
        match user_id {
            Some(user_id) => Ok(!self.enrollments(user_id).await?.is_empty()),
            None => {
                let records = self.store.list(StoreKind::Meta).await?;
                Ok(records.iter().any(|(key, _)| key.starts_with("enrollment:")))
            }
        }
    }

    async fn reject_existing_setup(&self, user_id: &str) -> Result<()> {
        if let Some(existing) = self.enrollments(user_id).await?.first() {
            return Err(KmsError::AlreadySetup(existing.method.as_str().to_string()));
        }
        Ok(())
    }

    async fn persist_setup(
        &self,
        user_id: &str,
        method: EnrollmentMethod,
        record: EnrollmentRecord,
        request_id: &str,
    ) -> Result<()> {
        // Delegating the user audit key writes the init and delegation
        // entries on a fresh chain.
        self.audit.ensure_user_signer(user_id, request_id).await?;
        let key = enrollment_key(method, user_id);
        self.audit
            .append(
                AppendRequest::new("setup", SignAs::User(user_id.to_string()), request_id)
                    .user_id(user_id)
                    .details(json!({ "enrollmentMethod": method.as_str() }))
                    .write(SideWrite::Put {
                        store: StoreKind::Meta,
                        key,
                        value: serde_json::to_value(&record)?,
                    }),
            )
            .await?;
        info!(user = user_id, method = method.as_str(), "user enrolled");
        Ok(())
    }

    fn passphrase_record(
        &self,
        user_id: &str,
        passphrase: &str,
        ms: &MasterSecret,
    ) -> Result<EnrollmentRecord> {
        let salt = random_array::<16>();
        let iterations = self.config.pbkdf2_iterations;
        let derived = pbkdf2_sha256(passphrase.as_bytes(), &salt, iterations, 64);
        let verification_hash = sha256(&derived).to_vec();
        let wrapping_key = key_from_first_half(&derived);

        let key = enrollment_key(EnrollmentMethod::Passphrase, user_id);
        let wrapped_ms = wrap_key(&wrapping_key, ms.bytes(), key.as_bytes())?;
        Ok(EnrollmentRecord::Passphrase {
            salt: salt.to_vec(),
            iterations,
            verification_hash,
            wrapped_ms,
            created_at: Utc::now().timestamp_millis(),
        })
    }

    fn derived_record(
        &self,
        user_id: &str,
        credential_id: &str,
        authenticator_output: &str,
        app_salt: &str,
        ms: &MasterSecret,
    ) -> Result<EnrollmentRecord> {
        let output = decode_authenticator_output(authenticator_output)?;
        let app_salt = b64u_decode(app_salt)?;
        if app_salt.len() != 32 {
            return Err(KmsError::InvalidParam("appSalt must be 32 bytes".into()));
        }
        let wrapping_key = derive_hkdf_key(&output, &app_salt)?;

        let key = enrollment_key(EnrollmentMethod::AuthenticatorDerived, user_id);
        let wrapped_ms = wrap_key(&wrapping_key, ms.bytes(), key.as_bytes())?;
        Ok(EnrollmentRecord::AuthenticatorDerived {
            credential_id: credential_id.to_string(),
            app_salt,
            wrapped_ms,
            created_at: Utc::now().timestamp_millis(),
        })
    }

    fn gate_record(
        &self,
        user_id: &str,
        credential_id: &str,
        ms: &MasterSecret,
    ) -> Result<EnrollmentRecord> {
        let salt = sha256(credential_id.as_bytes());
        let wrapping_key = derive_hkdf_key(&salt, &salt)?;

        let key = enrollment_key(EnrollmentMethod::AuthenticatorGate, user_id);
        let wrapped_ms = wrap_key(&wrapping_key, ms.bytes(), key.as_bytes())?;
        Ok(EnrollmentRecord::AuthenticatorGate {
            credential_id: credential_id.to_string(),
            app_salt: salt.to_vec(),
            wrapped_ms,
            created_at: Utc::now().timestamp_millis(),
        })
    }

    async fn load_enrollment(&self, key: &str) -> Result<Option<EnrollmentRecord>> {
        let Some(value) = self.store.get(StoreKind::Meta, key).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value).map_err(|e| {
            KmsError::Internal(format!("corrupt enrollment {key}: {e}"))
        })?))
    }
}

fn validate_user_id(user_id: &str) -> Result<()> {
    if user_id.is_empty() {
        return Err(KmsError::InvalidParam("userId must not be empty".into()));
    }
    Ok(())
}

fn key_from_first_half(derived: &Zeroizing<Vec<u8>>) -> [u8; 32] {
    let mut key = [0u8; 32];
    key.copy_from_slice(&derived[..32]);
    key
}

fn derive_hkdf_key(ikm: &[u8], salt: &[u8]) -> Result<[u8; 32]> {
    let okm = hkdf_sha256(ikm, salt, KEK_WRAP_INFO, 32)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&okm);
    Ok(key)
}

fn decode_authenticator_output(encoded: &str) -> Result<[u8; 32]> {
    let bytes = b64u_decode(encoded)?;
    bytes
        .try_into()
        .map_err(|_| KmsError::InvalidParam("authenticatorOutput must be 32 bytes".into()))
}
