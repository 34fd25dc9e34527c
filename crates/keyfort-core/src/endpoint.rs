//! Endpoint bindings
//!
//! A push endpoint is public data: binding it to the signing key record
//! needs no authentication, but the endpoint itself is validated hard -
//! https only, hostname inside the configured whitelist, client keys with
//! exact lengths.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::info;
use url::Url;

use keyfort_audit::{AppendRequest, AuditLog, SignAs};
use keyfort_config::Config;
use keyfort_crypto::b64u_decode;
use keyfort_store::{SideWrite, StoreKind};

use crate::error::{KmsError, Result};
use crate::hierarchy::KeyHierarchy;
use crate::types::{EndpointBinding, SigningKeyRecord};

/// Host-supplied subscription payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionParams {
    pub endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,
    /// base64url, must decode to 65 bytes.
    pub p256dh: String,
    /// base64url, must decode to 16 bytes.
    pub auth: String,
    pub endpoint_id: String,
}

pub struct EndpointManager {
    audit: Arc<AuditLog>,
    config: Arc<Config>,
    hierarchy: Arc<KeyHierarchy>,
}

impl EndpointManager {
    pub fn new(audit: Arc<AuditLog>, config: Arc<Config>, hierarchy: Arc<KeyHierarchy>) -> Self {
        Self {
            audit,
            config,
            hierarchy,
        }
    }

    /// Validate a subscription against the whitelist and key shapes.
    pub fn validate(&self, params: &SubscriptionParams) -> Result<EndpointBinding> {
        let url = Url::parse(&params.endpoint)
            .map_err(|e| KmsError::InvalidEndpoint(format!("unparseable URL: {e}")))?;
        if url.scheme() != "https" {
            return Err(KmsError::InvalidEndpoint("endpoint must be https".into()));
        }
        let host = url
            .host_str()
            .ok_or_else(|| KmsError::InvalidEndpoint("endpoint has no hostname".into()))?;
        let allowed = self.config.endpoint_whitelist.iter().any(|entry| {
            host == entry || host.ends_with(&format!(".{entry}"))
        });
        if !allowed {
            return Err(KmsError::InvalidEndpoint(format!(
                "hostname {host} is not a known push service"
            )));
        }

        let p256dh = b64u_decode(&params.p256dh)
            .map_err(|_| KmsError::InvalidEndpoint("p256dh is not base64url".into()))?;
        if p256dh.len() != 65 || p256dh[0] != 0x04 {
            return Err(KmsError::InvalidEndpoint(
                "p256dh must be a 65-byte uncompressed point".into(),
            ));
        }
        let auth = b64u_decode(&params.auth)
            .map_err(|_| KmsError::InvalidEndpoint("auth is not base64url".into()))?;
        if auth.len() != 16 {
            return Err(KmsError::InvalidEndpoint("auth must be 16 bytes".into()));
        }
        if params.endpoint_id.is_empty() {
            return Err(KmsError::InvalidEndpoint("endpointId must not be empty".into()));
        }

        Ok(EndpointBinding {
            endpoint: params.endpoint.clone(),
            expiration: params.expiration,
            p256dh,
            auth,
            endpoint_id: params.endpoint_id.clone(),
            created_at: Utc::now().timestamp_millis(),
        })
    }

    /// Attach a binding to the signing key record, replacing any previous
    /// one.
    pub async fn set_endpoint(
        &self,
        user_id: Option<&str>,
        params: &SubscriptionParams,
        request_id: &str,
    ) -> Result<EndpointBinding> {
        let binding = self.validate(params)?;
        let mut record = self.resolve_record(user_id).await?;
        record.endpoint = Some(binding.clone());

        self.audit
            .append(
                AppendRequest::new(
                    "setEndpoint",
                    SignAs::User(record.user_id.clone()),
                    request_id,
                )
                .user_id(&record.user_id)
                .kid(&record.kid)
                .details(json!({
                    "endpointId": binding.endpoint_id,
                    "endpoint": binding.endpoint,
                }))
                .write(SideWrite::Put {
                    store: StoreKind::Keys,
                    key: record.kid.clone(),
                    value: serde_json::to_value(&record)?,
                }),
            )
            .await?;
        info!(kid = %record.kid, endpoint_id = %binding.endpoint_id, "endpoint bound");
        Ok(binding)
    }

    pub async fn remove_endpoint(&self, user_id: Option<&str>, request_id: &str) -> Result<()> {
        let mut record = self.resolve_record(user_id).await?;
        let removed = record.endpoint.take();

        self.audit
            .append(
                AppendRequest::new(
                    "removeEndpoint",
                    SignAs::User(record.user_id.clone()),
                    request_id,
                )
                .user_id(&record.user_id)
                .kid(&record.kid)
                .details(json!({
                    "endpointId": removed.map(|b| b.endpoint_id),
                }))
                .write(SideWrite::Put {
                    store: StoreKind::Keys,
                    key: record.kid.clone(),
                    value: serde_json::to_value(&record)?,
                }),
            )
            .await?;
        Ok(())
    }

    pub async fn get_endpoint(&self, user_id: Option<&str>) -> Result<Option<EndpointBinding>> {
        Ok(self.resolve_record(user_id).await?.endpoint)
    }

    /// The record a binding call targets: the user's current key when a
    /// user is named, otherwise the sole record in the store.
    async fn resolve_record(&self, user_id: Option<&str>) -> Result<SigningKeyRecord> {
        match user_id {
            Some(user_id) => self
                .hierarchy
                .current_record(user_id)
                .await?
                .ok_or_else(|| KmsError::NotFound("signing key for user".into())),
            None => {
                let mut records = self.hierarchy.all_records().await?;
                match records.len() {
                    0 => Err(KmsError::NotFound("signing key".into())),
                    1 => Ok(records.remove(0)),
                    _ => Err(KmsError::InvalidParam(
                        "several signing keys exist; a userId is required".into(),
                    )),
                }
            }
        }
    }
}
