//! Lease management
//!
//! A lease authorizes offline token issuance: the signing key is rewrapped
//! under a per-lease session KEK derived from the master secret, and a
//! per-lease audit key (delegated by the user audit key) signs the offline
//! entries. Session KEKs live only in process memory; a restart parts a
//! lease from its KEK until an authenticated extension re-derives it.

use std::sync::Arc;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;
use zeroize::Zeroizing;

use keyfort_audit::delegation::issue_lease_delegation;
use keyfort_audit::{AppendRequest, AuditLog, SignAs};
use keyfort_config::{Config, QuotaLimits};
use keyfort_crypto::{random_bytes, unwrap_key, wrap_key, KeyProvider};
use keyfort_store::{SideWrite, Store, StoreKind};

use crate::error::{KmsError, Result};
use crate::hierarchy::KeyHierarchy;
use crate::signing::{IssuedToken, SigningEngine};
use crate::types::{
    AuthCredentials, EndpointCounter, ExtendOutcome, ExtendStatus, LeaseRecord, LeaseVerification,
    QuotaState,
};
use crate::unlock::UnlockManager;

const MS_PER_MINUTE: i64 = 60_000;
const MS_PER_HOUR: i64 = 3_600_000;
const MS_PER_DAY: i64 = 86_400_000;

/// Public summary of a lease.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaseSummary {
    pub lease_id: String,
    pub user_id: String,
    pub kid: String,
    pub created_at: i64,
    pub expires_at: i64,
    pub auto_extend: bool,
}

pub struct LeaseManager {
    store: Arc<dyn Store>,
    provider: Arc<dyn KeyProvider>,
    audit: Arc<AuditLog>,
    config: Arc<Config>,
    hierarchy: Arc<KeyHierarchy>,
    engine: Arc<SigningEngine>,
    unlock: Arc<UnlockManager>,
    /// lease id -> session KEK. In-memory only, by design.
    session_keks: DashMap<String, Zeroizing<[u8; 32]>>,
    /// Per-lease issue lock so quota check-then-debit stays atomic.
    issue_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LeaseManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn KeyProvider>,
        audit: Arc<AuditLog>,
        config: Arc<Config>,
        hierarchy: Arc<KeyHierarchy>,
        engine: Arc<SigningEngine>,
        unlock: Arc<UnlockManager>,
    ) -> Self {
        Self {
            store,
            provider,
            audit,
            config,
            hierarchy,
            engine,
            unlock,
            session_keks: DashMap::new(),
            issue_locks: DashMap::new(),
        }
    }

    /// Issue a lease for the user's current signing key.
    pub async fn create_lease(
        &self,
        user_id: &str,
        ttl_hours: u32,
        auto_extend: bool,
        credentials: &AuthCredentials,
        request_id: &str,
    ) -> Result<LeaseSummary> {
        if ttl_hours == 0 || ttl_hours > self.config.max_lease_ttl_hours {
            return Err(KmsError::InvalidParam(format!(
                "ttlHours must be within 1..={}",
                self.config.max_lease_ttl_hours
            )));
        }
        if credentials.user_id() != user_id {
            return Err(KmsError::IncorrectCredential);
        }
        let record = self
            .hierarchy
            .current_record(user_id)
            .await?
            .ok_or_else(|| KmsError::NotFound("signing key for user".into()))?;

        let ms = self.unlock.unlock(credentials).await?;
        let lease_id = Uuid::new_v4().to_string();
        let lease_salt = random_bytes(32);
        let session_kek = KeyHierarchy::derive_session_kek(&ms, &lease_salt)?;

        // Rewrap the signing key for offline use, bound to the lease.
        let raw_private = KeyHierarchy::unwrap_direct(&ms, &record)?;
        drop(ms);
        let wrapped_signing_key = wrap_key(&session_kek, &raw_private, lease_id.as_bytes())?;
        drop(raw_private);

        let now = Utc::now().timestamp_millis();
        let expires_at = now + ttl_hours as i64 * MS_PER_HOUR;

        let lease_signer = self.audit.create_lease_signer(&lease_id).await?;
        let user_signer = self.audit.user_signer(user_id).await?;
        let delegation = issue_lease_delegation(
            self.provider.as_ref(),
            &user_signer.handle,
            &lease_id,
            &record.kid,
            now,
            expires_at,
            &lease_signer.public,
        )
        .await?;

        let lease = LeaseRecord {
            lease_id: lease_id.clone(),
            user_id: user_id.to_string(),
            ttl_hours,
            created_at: now,
            expires_at,
            wrapped_signing_key,
            lease_salt,
            kid: record.kid.clone(),
            delegation: delegation.clone(),
            quota: QuotaState::new(now, self.config.quota.burst_capacity),
            auto_extend,
        };

        self.audit
            .append(
                AppendRequest::new("issueLease", SignAs::User(user_id.to_string()), request_id)
                    .user_id(user_id)
                    .kid(&record.kid)
                    .details(json!({
                        "leaseId": lease_id,
                        "ttlHours": ttl_hours,
                        "autoExtend": auto_extend,
                        "delegation": delegation.to_value()?,
                    }))
                    .write(SideWrite::Put {
                        store: StoreKind::Leases,
                        key: lease_id.clone(),
                        value: serde_json::to_value(&lease)?,
                    }),
            )
            .await?;

        self.session_keks.insert(lease_id.clone(), session_kek);
        info!(lease = %lease_id, user = user_id, ttl_hours, "lease issued");
        Ok(summary(&lease))
    }

    /// Offline issuance: no credentials, the cached session KEK and the
    /// lease delegation do the work. `count` tokens are produced with a
    /// single atomic quota debit.
    pub async fn issue_tokens(
        &self,
        lease_id: &str,
        count: u32,
        kid: Option<&str>,
        request_id: &str,
    ) -> Result<Vec<IssuedToken>> {
        if count == 0 || count > self.config.max_batch_count {
            return Err(KmsError::InvalidParam(format!(
                "count must be within 1..={}",
                self.config.max_batch_count
            )));
        }

        let lock = self.issue_lock(lease_id);
        let _guard = lock.lock().await;

        let mut lease = self
            .load_lease(lease_id)
            .await?
            .ok_or_else(|| KmsError::NotFound(format!("lease {lease_id}")))?;
        let now_ms = Utc::now().timestamp_millis();
        if now_ms >= lease.expires_at {
            return Err(KmsError::Expired);
        }
        let current_kid = self.hierarchy.current_kid(&lease.user_id).await?;
        if current_kid.as_deref() != Some(lease.kid.as_str()) {
            return Err(KmsError::WrongKey);
        }
        if let Some(kid) = kid {
            if kid != lease.kid {
                return Err(KmsError::WrongKey);
            }
        }
        let mut record = self
            .hierarchy
            .record_by_kid(&lease.kid)
            .await?
            .ok_or(KmsError::WrongKey)?;

        let lease_signer = self
            .audit
            .lease_signer(lease_id)
            .await?
            .ok_or_else(|| KmsError::NotFound(format!("audit signer for lease {lease_id}")))?;

        let binding = match record.endpoint.as_ref() {
            Some(binding) => binding,
            None => {
                let violation = "no endpoint bound to the signing key";
                self.log_policy_violation(&lease, &lease_signer, violation, request_id)
                    .await?;
                return Err(KmsError::PolicyViolation(violation.into()));
            }
        };
        let aud = self.engine.audience_for_endpoint(&binding.endpoint)?;
        let sub = self.config.token_contact.clone();
        let endpoint_id = binding.endpoint_id.clone();

        let now_secs = now_ms / 1_000;
        let expirations = if count == 1 {
            vec![self.engine.single_expiration(now_secs)]
        } else {
            self.engine.staggered_expirations(now_secs, count)
        };
        for &exp in &expirations {
            if let Err(e) = self.engine.validate_policy(&aud, &sub, exp, now_secs) {
                self.log_policy_violation(&lease, &lease_signer, &e.to_string(), request_id)
                    .await?;
                return Err(e);
            }
        }

        debit_quota(
            &mut lease.quota,
            &self.config.quota,
            count,
            Some(&endpoint_id),
            now_ms,
        )?;

        let session_kek = self
            .session_keks
            .get(lease_id)
            .map(|kek| kek.value().clone())
            .ok_or_else(|| {
                KmsError::NotFound(format!(
                    "session key for lease {lease_id}; re-authentication required"
                ))
            })?;
        let raw_private = unwrap_key(&session_kek, &lease.wrapped_signing_key, lease_id.as_bytes())
            .map_err(|_| KmsError::Internal("lease signing key unwrap failed".into()))?;

        let tokens = self
            .engine
            .sign_tokens(&raw_private, &record, &aud, &sub, &expirations)
            .await?;
        drop(raw_private);

        record.last_used_at = Some(now_ms);
        let jtis: Vec<&str> = tokens.iter().map(|t| t.jti.as_str()).collect();
        self.audit
            .append(
                AppendRequest::new("sign", SignAs::Lease(lease_signer), request_id)
                    .user_id(&lease.user_id)
                    .kid(&lease.kid)
                    .details(json!({
                        "leaseId": lease_id,
                        "count": count,
                        "jtis": jtis,
                    }))
                    .write(SideWrite::Put {
                        store: StoreKind::Leases,
                        key: lease_id.to_string(),
                        value: serde_json::to_value(&lease)?,
                    })
                    .write(SideWrite::Put {
                        store: StoreKind::Keys,
                        key: record.kid.clone(),
                        value: serde_json::to_value(&record)?,
                    }),
            )
            .await?;
        Ok(tokens)
    }

    /// Check a lease without touching it.
    pub async fn verify_lease(
        &self,
        lease_id: &str,
        delete_if_invalid: bool,
        request_id: &str,
    ) -> Result<LeaseVerification> {
        let Some(lease) = self.load_lease(lease_id).await? else {
            return Ok(LeaseVerification {
                valid: false,
                reason: Some("not-found".into()),
            });
        };

        let now = Utc::now().timestamp_millis();
        let reason = if now >= lease.expires_at {
            Some("expired")
        } else {
            let current = self.hierarchy.current_kid(&lease.user_id).await?;
            if current.as_deref() != Some(lease.kid.as_str()) {
                Some("wrong-key")
            } else {
                None
            }
        };

        let Some(reason) = reason else {
            return Ok(LeaseVerification {
                valid: true,
                reason: None,
            });
        };

        if delete_if_invalid {
            self.delete_lease(&lease, reason, request_id).await?;
        }
        Ok(LeaseVerification {
            valid: false,
            reason: Some(reason.to_string()),
        })
    }

    /// Extend a batch of leases. Auto-extendable leases roll forward with
    /// no authentication; the rest need credentials, and are skipped
    /// (not failed) when `request_auth` is false.
    pub async fn extend_leases(
        &self,
        lease_ids: &[String],
        user_id: &str,
        request_auth: bool,
        credentials: Option<&AuthCredentials>,
        request_id: &str,
    ) -> Result<Vec<ExtendOutcome>> {
        let mut outcomes = Vec::with_capacity(lease_ids.len());
        for lease_id in lease_ids {
            let outcome = self
                .extend_one(lease_id, user_id, request_auth, credentials, request_id)
                .await;
            outcomes.push(match outcome {
                Ok(outcome) => outcome,
                Err(e) => ExtendOutcome {
                    lease_id: lease_id.clone(),
                    status: ExtendStatus::Failed,
                    expires_at: None,
                    error: Some(e.to_string()),
                },
            });
        }
        Ok(outcomes)
    }

    async fn extend_one(
        &self,
        lease_id: &str,
        user_id: &str,
        request_auth: bool,
        credentials: Option<&AuthCredentials>,
        request_id: &str,
    ) -> Result<ExtendOutcome> {
        let Some(mut lease) = self.load_lease(lease_id).await? else {
            return Ok(ExtendOutcome {
                lease_id: lease_id.to_string(),
                status: ExtendStatus::Failed,
                expires_at: None,
                error: Some("not found".into()),
            });
        };
        if lease.user_id != user_id {
            return Err(KmsError::NotFound(format!("lease {lease_id} for this user")));
        }

        let now = Utc::now().timestamp_millis();
        let new_expiry = now + self.config.lease_extension_days as i64 * MS_PER_DAY;

        if lease.auto_extend {
            lease.expires_at = new_expiry;
            // Offline extension is signed by the lease's own audit key;
            // the user key covers it if the lease signer was lost.
            let sign_as = match self.audit.lease_signer(lease_id).await? {
                Some(signer) => SignAs::Lease(signer),
                None => SignAs::User(user_id.to_string()),
            };
            self.audit
                .append(
                    AppendRequest::new("extendLease", sign_as, request_id)
                        .user_id(user_id)
                        .kid(&lease.kid)
                        .details(json!({ "leaseId": lease_id, "newExpiresAt": new_expiry }))
                        .write(SideWrite::Put {
                            store: StoreKind::Leases,
                            key: lease_id.to_string(),
                            value: serde_json::to_value(&lease)?,
                        }),
                )
                .await?;
            return Ok(ExtendOutcome {
                lease_id: lease_id.to_string(),
                status: ExtendStatus::Extended,
                expires_at: Some(new_expiry),
                error: None,
            });
        }

        // Non-extendable leases require a fresh unlock.
        if !request_auth {
            return Ok(ExtendOutcome {
                lease_id: lease_id.to_string(),
                status: ExtendStatus::Skipped,
                expires_at: None,
                error: None,
            });
        }
        let credentials = credentials.ok_or(KmsError::IncorrectCredential)?;
        if credentials.user_id() != user_id {
            return Err(KmsError::IncorrectCredential);
        }
        let ms = self.unlock.unlock(credentials).await?;
        // The authenticated touch also re-derives the session KEK, so a
        // lease survives a restart through its next extension.
        let session_kek = KeyHierarchy::derive_session_kek(&ms, &lease.lease_salt)?;
        drop(ms);
        self.session_keks
            .insert(lease_id.to_string(), session_kek);

        lease.expires_at = new_expiry;
        self.audit
            .append(
                AppendRequest::new("extendLease", SignAs::User(user_id.to_string()), request_id)
                    .user_id(user_id)
                    .kid(&lease.kid)
                    .details(json!({ "leaseId": lease_id, "newExpiresAt": new_expiry }))
                    .write(SideWrite::Put {
                        store: StoreKind::Leases,
                        key: lease_id.to_string(),
                        value: serde_json::to_value(&lease)?,
                    }),
            )
            .await?;
        Ok(ExtendOutcome {
            lease_id: lease_id.to_string(),
            status: ExtendStatus::Extended,
            expires_at: Some(new_expiry),
            error: None,
        })
    }

    /// Explicit revocation.
    pub async fn revoke_lease(&self, lease_id: &str, request_id: &str) -> Result<()> {
        let lease = self
            .load_lease(lease_id)
            .await?
            .ok_or_else(|| KmsError::NotFound(format!("lease {lease_id}")))?;
        self.delete_lease(&lease, "revoked", request_id).await
    }

    /// Bulk-remove leases whose kid no longer matches the current signing
    /// key. One audit entry lists everything removed.
    pub async fn clear_invalid(&self, user_id: &str, request_id: &str) -> Result<Vec<String>> {
        let current = self.hierarchy.current_kid(user_id).await?;
        let mut removed = Vec::new();
        let mut request = AppendRequest::new(
            "clearInvalidLeases",
            SignAs::User(user_id.to_string()),
            request_id,
        )
        .user_id(user_id);

        for lease in self.user_leases_records(user_id).await? {
            if current.as_deref() == Some(lease.kid.as_str()) {
                continue;
            }
            removed.push(lease.lease_id.clone());
            request = request.write(SideWrite::Delete {
                store: StoreKind::Leases,
                key: lease.lease_id.clone(),
            });
        }
        if removed.is_empty() {
            return Ok(removed);
        }

        request = request.details(json!({ "removed": removed }));
        self.audit.append(request).await?;

        for lease_id in &removed {
            self.forget_lease(lease_id).await?;
        }
        info!(user = user_id, count = removed.len(), "stale leases cleared");
        Ok(removed)
    }

    pub async fn get_user_leases(&self, user_id: &str) -> Result<Vec<LeaseSummary>> {
        Ok(self
            .user_leases_records(user_id)
            .await?
            .iter()
            .map(summary)
            .collect())
    }

    async fn user_leases_records(&self, user_id: &str) -> Result<Vec<LeaseRecord>> {
        let mut out = Vec::new();
        for (key, value) in self.store.list(StoreKind::Leases).await? {
            let lease: LeaseRecord = serde_json::from_value(value)
                .map_err(|e| KmsError::Internal(format!("corrupt lease {key}: {e}")))?;
            if lease.user_id == user_id {
                out.push(lease);
            }
        }
        Ok(out)
    }

    async fn delete_lease(&self, lease: &LeaseRecord, reason: &str, request_id: &str) -> Result<()> {
        self.audit
            .append(
                AppendRequest::new(
                    "revokeLease",
                    SignAs::User(lease.user_id.clone()),
                    request_id,
                )
                .user_id(&lease.user_id)
                .kid(&lease.kid)
                .details(json!({ "leaseId": lease.lease_id, "reason": reason }))
                .write(SideWrite::Delete {
                    store: StoreKind::Leases,
                    key: lease.lease_id.clone(),
                }),
            )
            .await?;
        self.forget_lease(&lease.lease_id).await?;
        info!(lease = %lease.lease_id, reason, "lease removed");
        Ok(())
    }

    async fn forget_lease(&self, lease_id: &str) -> Result<()> {
        self.session_keks.remove(lease_id);
        self.issue_locks.remove(lease_id);
        self.audit.drop_lease_signer(lease_id).await?;
        Ok(())
    }

    /// Forget every cached session KEK (process reset).
    pub fn evict_session_keks(&self) {
        self.session_keks.clear();
        self.issue_locks.clear();
    }

    async fn load_lease(&self, lease_id: &str) -> Result<Option<LeaseRecord>> {
        let Some(value) = self.store.get(StoreKind::Leases, lease_id).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_value(value).map_err(|e| {
            KmsError::Internal(format!("corrupt lease {lease_id}: {e}"))
        })?))
    }

    fn issue_lock(&self, lease_id: &str) -> Arc<Mutex<()>> {
        self.issue_locks
            .entry(lease_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn log_policy_violation(
        &self,
        lease: &LeaseRecord,
        signer: &keyfort_audit::SignerRef,
        violation: &str,
        request_id: &str,
    ) -> Result<()> {
        warn!(lease = %lease.lease_id, violation, "token policy violation");
        self.audit
            .append(
                AppendRequest::new("policy-violation", SignAs::Lease(signer.clone()), request_id)
                    .user_id(&lease.user_id)
                    .kid(&lease.kid)
                    .details(json!({ "leaseId": lease.lease_id, "violation": violation })),
            )
            .await?;
        Ok(())
    }
}

fn summary(lease: &LeaseRecord) -> LeaseSummary {
    LeaseSummary {
        lease_id: lease.lease_id.clone(),
        user_id: lease.user_id.clone(),
        kid: lease.kid.clone(),
        created_at: lease.created_at,
        expires_at: lease.expires_at,
        auto_extend: lease.auto_extend,
    }
}

/// Check-then-debit, atomically: every limit is evaluated against the
/// refreshed counters before any of them is charged. The token bucket
/// (burst capacity, sustained refill) governs issuance admission; the
/// windowed minute counter is tracked for reporting.
fn debit_quota(
    quota: &mut QuotaState,
    limits: &QuotaLimits,
    count: u32,
    endpoint_id: Option<&str>,
    now_ms: i64,
) -> Result<()> {
    // Refresh windows.
    if now_ms >= quota.hour_reset_at {
        quota.tokens_this_hour = 0;
        quota.hour_reset_at = now_ms + MS_PER_HOUR;
    }
    if now_ms >= quota.minute_reset_at {
        quota.sends_this_minute = 0;
        quota.minute_reset_at = now_ms + MS_PER_MINUTE;
    }
    // Refill the burst bucket at the sustained rate.
    let elapsed_min = (now_ms - quota.burst_refill_at).max(0) as f64 / MS_PER_MINUTE as f64;
    quota.burst_remaining = (quota.burst_remaining
        + elapsed_min * limits.sends_per_minute as f64)
        .min(limits.burst_capacity as f64);
    quota.burst_refill_at = now_ms;

    // Check everything first.
    if quota.tokens_this_hour + count > limits.tokens_per_hour {
        return Err(KmsError::QuotaExceeded {
            counter: "tokens-per-hour",
        });
    }
    if quota.burst_remaining < count as f64 {
        return Err(KmsError::QuotaExceeded {
            counter: "sends-per-minute",
        });
    }
    if let Some(endpoint_id) = endpoint_id {
        let counter = quota.per_endpoint.get(endpoint_id);
        let current = match counter {
            Some(counter) if now_ms < counter.reset_at => counter.count,
            _ => 0,
        };
        if current + count > limits.per_endpoint_per_minute {
            return Err(KmsError::QuotaExceeded {
                counter: "per-endpoint",
            });
        }
    }

    // Then apply.
    quota.tokens_this_hour += count;
    quota.sends_this_minute += count;
    quota.burst_remaining -= count as f64;
    if let Some(endpoint_id) = endpoint_id {
        let counter = quota
            .per_endpoint
            .entry(endpoint_id.to_string())
            .or_insert_with(EndpointCounter::default);
        if now_ms >= counter.reset_at {
            counter.count = 0;
            counter.reset_at = now_ms + MS_PER_MINUTE;
        }
        counter.count += count;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> QuotaLimits {
        QuotaLimits::default()
    }

    #[test]
    fn hourly_cap_is_enforced() {
        let mut quota = QuotaState::new(0, limits().burst_capacity);
        // Space debits out so the burst bucket never binds.
        let mut now = 0;
        let mut issued = 0;
        while issued < 100 {
            now += MS_PER_MINUTE;
            debit_quota(&mut quota, &limits(), 5, None, now).unwrap();
            issued += 5;
        }
        now += MS_PER_MINUTE;
        let err = debit_quota(&mut quota, &limits(), 1, None, now).unwrap_err();
        assert!(matches!(
            err,
            KmsError::QuotaExceeded {
                counter: "tokens-per-hour"
            }
        ));
    }

    #[test]
    fn burst_bucket_governs_admission() {
        let mut quota = QuotaState::new(0, limits().burst_capacity);
        // The full burst of 20 goes through at once...
        debit_quota(&mut quota, &limits(), 10, None, 1).unwrap();
        debit_quota(&mut quota, &limits(), 10, None, 2).unwrap();
        // ...but the bucket is then empty.
        let err = debit_quota(&mut quota, &limits(), 1, None, 3).unwrap_err();
        assert!(matches!(
            err,
            KmsError::QuotaExceeded {
                counter: "sends-per-minute"
            }
        ));
        // A minute later the sustained rate has refilled 10.
        debit_quota(&mut quota, &limits(), 10, None, 3 + MS_PER_MINUTE).unwrap();
    }

    #[test]
    fn per_endpoint_counter_is_isolated() {
        let mut quota = QuotaState::new(0, limits().burst_capacity);
        debit_quota(&mut quota, &limits(), 5, Some("e1"), 1).unwrap();
        let err = debit_quota(&mut quota, &limits(), 1, Some("e1"), 2).unwrap_err();
        assert!(matches!(
            err,
            KmsError::QuotaExceeded {
                counter: "per-endpoint"
            }
        ));
        // A different endpoint still has room.
        debit_quota(&mut quota, &limits(), 5, Some("e2"), 3).unwrap();
        // And e1 resets after its window.
        debit_quota(&mut quota, &limits(), 1, Some("e1"), 2 + MS_PER_MINUTE).unwrap();
    }

    #[test]
    fn over_limit_debit_charges_nothing() {
        let mut quota = QuotaState::new(0, limits().burst_capacity);
        debit_quota(&mut quota, &limits(), 4, Some("e1"), 1).unwrap();
        let before = quota.clone();
        // Fails on the per-endpoint counter; no debit may land (the burst
        // bucket still refills with elapsed time, it only ever grows).
        assert!(debit_quota(&mut quota, &limits(), 2, Some("e1"), 2).is_err());
        assert_eq!(quota.tokens_this_hour, before.tokens_this_hour);
        assert!(quota.burst_remaining >= before.burst_remaining);
        assert_eq!(quota.per_endpoint["e1"].count, before.per_endpoint["e1"].count);
    }
}
