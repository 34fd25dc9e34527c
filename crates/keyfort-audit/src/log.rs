//! Appending to the chain

use std::sync::Arc;

use chrono::Utc;
use serde_json::{json, Value};
use tracing::{debug, info};

use keyfort_crypto::{b64u_encode, KeyHandle, KeyProvider};
use keyfort_store::{SideWrite, Store, StoreError, StoreKind};

use crate::entry::{ed25519_kid, AuditEntry, SignerRole};
use crate::error::{AuditError, Result};
use crate::{
    lease_signer_name, system_signer_name, user_public_key_record, user_signer_name,
    SYSTEM_PUBLIC_KEY_RECORD,
};

/// Ten years, the recorded validity window for delegated user audit keys.
const USER_DELEGATION_WINDOW_MS: i64 = 10 * 365 * 24 * 3_600 * 1_000;

/// How often an append is retried when the tail moved underneath it.
const APPEND_ATTEMPTS: usize = 3;

/// A resolved signer: provider handle, public key, key identifier.
#[derive(Debug, Clone)]
pub struct SignerRef {
    pub handle: KeyHandle,
    pub public: [u8; 32],
    pub kid: String,
}

impl SignerRef {
    fn new(handle: KeyHandle, public: [u8; 32]) -> Self {
        let kid = ed25519_kid(&public);
        Self {
            handle,
            public,
            kid,
        }
    }
}

/// Which tier signs the entry being appended.
#[derive(Debug, Clone)]
pub enum SignAs {
    System,
    User(String),
    Lease(SignerRef),
}

/// One append: operation, signer, correlation ids, payload and the record
/// writes that must land in the same transaction.
#[derive(Debug, Clone)]
pub struct AppendRequest {
    pub op: String,
    pub sign_as: SignAs,
    pub request_id: String,
    pub user_id: Option<String>,
    pub kid: Option<String>,
    pub details: Value,
    pub writes: Vec<SideWrite>,
}

impl AppendRequest {
    pub fn new(op: impl Into<String>, sign_as: SignAs, request_id: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            sign_as,
            request_id: request_id.into(),
            user_id: None,
            kid: None,
            details: json!({}),
            writes: Vec::new(),
        }
    }

    pub fn user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn kid(mut self, kid: impl Into<String>) -> Self {
        self.kid = Some(kid.into());
        self
    }

    pub fn details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    pub fn write(mut self, write: SideWrite) -> Self {
        self.writes.push(write);
        self
    }
}

pub struct AuditLog {
    store: Arc<dyn Store>,
    provider: Arc<dyn KeyProvider>,
}

impl AuditLog {
    pub fn new(store: Arc<dyn Store>, provider: Arc<dyn KeyProvider>) -> Self {
        Self { store, provider }
    }

    /// The system signer. On an empty chain this is a fresh install: a new
    /// key is generated and anchored as entry #1.
    pub async fn system_signer(&self) -> Result<SignerRef> {
        if let Some((handle, public)) = self
            .provider
            .ed25519_by_name(&system_signer_name())
            .await?
        {
            // A registered key with an empty chain is a leftover from a
            // destructive reset; discard and start over.
            if self.store.audit_tail().await?.is_some() {
                return Ok(SignerRef::new(handle, public));
            }
            self.provider.drop_key(&handle).await;
        }

        if self.store.audit_tail().await?.is_some() {
            return Err(AuditError::SignerUnavailable(
                "system audit key lost for existing chain".into(),
            ));
        }

        let (handle, public) = self.provider.generate_ed25519(&system_signer_name()).await?;
        let signer = SignerRef::new(handle, public);

        let meta = json!({
            "publicKey": b64u_encode(signer.public),
            "kid": signer.kid,
            "createdAt": Utc::now().timestamp_millis(),
        });
        self.append_with(
            AppendRequest::new("init", SignAs::System, "install")
                .details(json!({ "systemAuditPublicKey": b64u_encode(signer.public) }))
                .write(SideWrite::Put {
                    store: StoreKind::Meta,
                    key: SYSTEM_PUBLIC_KEY_RECORD.into(),
                    value: meta,
                }),
            &signer,
            SignerRole::System,
        )
        .await?;
        info!(kid = %signer.kid, "system audit key installed");
        Ok(signer)
    }

    /// The user signer for `user_id`, generating and delegating it on first
    /// use (the chain records a system-signed delegation entry).
    pub async fn ensure_user_signer(&self, user_id: &str, request_id: &str) -> Result<SignerRef> {
        let record = user_public_key_record(user_id);
        let name = user_signer_name(user_id);

        if let Some((handle, public)) = self.provider.ed25519_by_name(&name).await? {
            if self.store.get(StoreKind::Meta, &record).await?.is_some() {
                return Ok(SignerRef::new(handle, public));
            }
            self.provider.drop_key(&handle).await;
        }

        // Delegation requires the system key, which also bootstraps the
        // chain on first setup.
        let system = self.system_signer().await?;

        let (handle, public) = self.provider.generate_ed25519(&name).await?;
        let signer = SignerRef::new(handle, public);
        let now = Utc::now().timestamp_millis();

        let meta = json!({
            "publicKey": b64u_encode(signer.public),
            "kid": signer.kid,
            "createdAt": now,
        });
        self.append_with(
            AppendRequest::new("enroll-user-audit-key", SignAs::System, request_id)
                .user_id(user_id)
                .details(json!({
                    "userAuditPublicKey": b64u_encode(signer.public),
                    "notBefore": now,
                    "notAfter": now + USER_DELEGATION_WINDOW_MS,
                }))
                .write(SideWrite::Put {
                    store: StoreKind::Meta,
                    key: record,
                    value: meta,
                }),
            &system,
            SignerRole::System,
        )
        .await?;
        debug!(user = user_id, kid = %signer.kid, "user audit key delegated");
        Ok(signer)
    }

    /// The user signer, failing when the user was never set up.
    pub async fn user_signer(&self, user_id: &str) -> Result<SignerRef> {
        match self.provider.ed25519_by_name(&user_signer_name(user_id)).await? {
            Some((handle, public)) => Ok(SignerRef::new(handle, public)),
            None => Err(AuditError::SignerUnavailable(format!(
                "no user audit key for {user_id}"
            ))),
        }
    }

    /// Generate the per-lease audit key.
    pub async fn create_lease_signer(&self, lease_id: &str) -> Result<SignerRef> {
        let name = lease_signer_name(lease_id);
        if let Some((handle, _)) = self.provider.ed25519_by_name(&name).await? {
            self.provider.drop_key(&handle).await;
        }
        let (handle, public) = self.provider.generate_ed25519(&name).await?;
        Ok(SignerRef::new(handle, public))
    }

    pub async fn lease_signer(&self, lease_id: &str) -> Result<Option<SignerRef>> {
        Ok(self
            .provider
            .ed25519_by_name(&lease_signer_name(lease_id))
            .await?
            .map(|(handle, public)| SignerRef::new(handle, public)))
    }

    pub async fn drop_lease_signer(&self, lease_id: &str) -> Result<()> {
        if let Some((handle, _)) = self
            .provider
            .ed25519_by_name(&lease_signer_name(lease_id))
            .await?
        {
            self.provider.drop_key(&handle).await;
        }
        Ok(())
    }

    /// Append one entry. The signer is resolved from the request's
    /// `sign_as`; the chain is bootstrapped if still empty.
    pub async fn append(&self, request: AppendRequest) -> Result<AuditEntry> {
        let (signer, role) = match &request.sign_as {
            SignAs::System => (self.system_signer().await?, SignerRole::System),
            SignAs::User(user_id) => (self.user_signer(user_id).await?, SignerRole::User),
            SignAs::Lease(signer) => (signer.clone(), SignerRole::Lease),
        };
        // A non-system append on an empty chain still needs the anchor.
        if !matches!(role, SignerRole::System) && self.store.audit_tail().await?.is_none() {
            self.system_signer().await?;
        }
        self.append_with(request, &signer, role).await
    }

    async fn append_with(
        &self,
        request: AppendRequest,
        signer: &SignerRef,
        role: SignerRole,
    ) -> Result<AuditEntry> {
        let mut last_conflict = None;
        for _ in 0..APPEND_ATTEMPTS {
            let (prev_seq, prev_hash) = match self.store.audit_tail().await? {
                Some((seq, value)) => {
                    let tail: AuditEntry = serde_json::from_value(value)
                        .map_err(|_| AuditError::MalformedRecord { seq })?;
                    (seq, tail.chain_hash)
                }
                None => (0, String::new()),
            };

            let mut entry = AuditEntry {
                seq: prev_seq + 1,
                op: request.op.clone(),
                role,
                signer_kid: signer.kid.clone(),
                prev_hash,
                chain_hash: String::new(),
                sig: String::new(),
                ts: Utc::now().timestamp_millis(),
                request_id: request.request_id.clone(),
                user_id: request.user_id.clone(),
                kid: request.kid.clone(),
                details: request.details.clone(),
            };

            let digest = entry.compute_chain_hash()?;
            entry.chain_hash = b64u_encode(digest);
            let sig = self.provider.sign_ed25519(&signer.handle, &digest).await?;
            entry.sig = b64u_encode(sig);

            match self
                .store
                .append_audit(
                    entry.seq,
                    serde_json::to_value(&entry)?,
                    request.writes.clone(),
                )
                .await
            {
                Ok(()) => return Ok(entry),
                Err(StoreError::AppendConflict { expected, tail }) => {
                    last_conflict = Some(StoreError::AppendConflict { expected, tail });
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(last_conflict
            .map(AuditError::from)
            .unwrap_or_else(|| AuditError::SignerUnavailable("append retries exhausted".into())))
    }

    /// Entries in `[from, to]`, parsed.
    pub async fn entries(&self, from: u64, to: Option<u64>) -> Result<Vec<AuditEntry>> {
        let mut out = Vec::new();
        for (seq, value) in self.store.audit_range(from, to).await? {
            out.push(
                serde_json::from_value(value).map_err(|_| AuditError::MalformedRecord { seq })?,
            );
        }
        Ok(out)
    }

    pub async fn tail_seq(&self) -> Result<u64> {
        Ok(self.store.audit_tail().await?.map(|(seq, _)| seq).unwrap_or(0))
    }

    /// The anchored system public key, if the chain exists.
    pub async fn system_public_key(&self) -> Result<Option<(String, String)>> {
        let Some(record) = self.store.get(StoreKind::Meta, SYSTEM_PUBLIC_KEY_RECORD).await? else {
            return Ok(None);
        };
        let kid = record
            .get("kid")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let public = record
            .get("publicKey")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        Ok(Some((kid, public)))
    }
}
