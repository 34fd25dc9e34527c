//! RPC dispatch
//!
//! Single entry point for the external surface. Each request is validated
//! into typed parameters, gated on its authentication requirements, and
//! routed to the owning component. Mutations are serialized FIFO behind
//! one lock, and because every component appends its audit entry in the
//! same transaction as its record writes, the entry is durable before the
//! response leaves this module.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use keyfort_core::{
    AuthCredentials, KmsContext, KmsError, Result, SigningKeyRecord, SubscriptionParams,
};

use crate::envelope::{RpcRequest, RpcResponse};
use crate::transport::HostTransport;
use crate::validate::{
    empty_params, optional_user, params, AddEnrollmentParams, CreateLeaseParams,
    CredentialsOnlyParams, ExtendLeasesParams, FullSetupParams, GetAuditLogParams,
    GetPublicKeyParams, IssueTokenParams, IssueTokensParams, RemoveEnrollmentParams,
    RevokeLeaseParams, SetEndpointParams, SetupAuthenticatorDerivedParams,
    SetupAuthenticatorGateParams, SetupPassphraseParams, SetupWithPopupParams, UserIdParams,
    VerifyLeaseParams,
};

pub struct Dispatcher {
    ctx: Arc<KmsContext>,
    transport: Arc<dyn HostTransport>,
    /// FIFO serialization of mutations.
    mutation: Mutex<()>,
}

impl Dispatcher {
    pub fn new(ctx: Arc<KmsContext>, transport: Arc<dyn HostTransport>) -> Self {
        Self {
            ctx,
            transport,
            mutation: Mutex::new(()),
        }
    }

    /// Drain a request channel in arrival order. Each request completes
    /// (including its storage writes) before the next is started.
    pub async fn serve(
        self: Arc<Self>,
        mut requests: mpsc::Receiver<RpcRequest>,
        responses: mpsc::Sender<RpcResponse>,
    ) {
        while let Some(request) = requests.recv().await {
            let response = self.handle(request).await;
            if responses.send(response).await.is_err() {
                break;
            }
        }
    }

    /// Handle one request and shape the response envelope.
    pub async fn handle(&self, request: RpcRequest) -> RpcResponse {
        debug!(id = %request.id, method = %request.method, "rpc request");
        match self.dispatch(&request).await {
            Ok(result) => RpcResponse::success(request.id, result),
            Err(error) => {
                warn!(
                    id = %request.id,
                    method = %request.method,
                    code = error.code(),
                    "rpc request failed: {error}"
                );
                RpcResponse::failure(request.id, &error)
            }
        }
    }

    async fn dispatch(&self, request: &RpcRequest) -> Result<Value> {
        if is_mutation(&request.method) {
            let _guard = self.mutation.lock().await;
            self.dispatch_mutation(request).await
        } else {
            self.dispatch_read(request).await
        }
    }

    async fn dispatch_mutation(&self, request: &RpcRequest) -> Result<Value> {
        let rid = request.id.as_str();
        match request.method.as_str() {
            "setupPassphrase" => {
                let p: SetupPassphraseParams = params(request)?;
                self.ctx
                    .unlock
                    .setup_passphrase(&p.user_id, &p.passphrase, rid)
                    .await?;
                Ok(json!({ "userId": p.user_id }))
            }
            "setupAuthenticatorDerived" => {
                let p: SetupAuthenticatorDerivedParams = params(request)?;
                self.ctx
                    .unlock
                    .setup_authenticator_derived(
                        &p.user_id,
                        &p.credential_id,
                        &p.authenticator_output,
                        &p.app_salt,
                        rid,
                    )
                    .await?;
                Ok(json!({ "userId": p.user_id }))
            }
            "setupAuthenticatorGate" => {
                let p: SetupAuthenticatorGateParams = params(request)?;
                self.ctx
                    .unlock
                    .setup_authenticator_gate(&p.user_id, &p.credential_id, rid)
                    .await?;
                Ok(json!({ "userId": p.user_id }))
            }
            "setupWithPopup" => {
                let p: SetupWithPopupParams = params(request)?;
                let mut credentials = self.collect_credentials(&p.user_id).await?;
                let outcome = self.setup_with(&p.user_id, &credentials, rid).await;
                scrub_credentials(&mut credentials);
                outcome?;
                Ok(json!({ "userId": p.user_id }))
            }
            "addEnrollment" => {
                let p: AddEnrollmentParams = params(request)?;
                if p.credentials.user_id() != p.user_id {
                    return Err(KmsError::IncorrectCredential);
                }
                let info = self
                    .ctx
                    .unlock
                    .add_enrollment(&p.credentials, &p.new_method, rid)
                    .await?;
                Ok(serde_json::to_value(info)?)
            }
            "removeEnrollment" => {
                let p: RemoveEnrollmentParams = params(request)?;
                self.ctx
                    .unlock
                    .remove_enrollment(&p.enrollment_id, &p.credentials, rid)
                    .await?;
                Ok(json!({ "removed": p.enrollment_id }))
            }
            "fullSetup" => {
                let p: FullSetupParams = params(request)?;
                self.full_setup(&p, rid).await
            }
            "generateSigningKey" => {
                let p: CredentialsOnlyParams = params(request)?;
                let record = self
                    .ctx
                    .hierarchy
                    .generate_signing_key(&self.ctx.unlock, &p.credentials, false, rid)
                    .await?;
                Ok(public_key_view(&record))
            }
            "regenerateSigningKey" => {
                let p: CredentialsOnlyParams = params(request)?;
                let record = self
                    .ctx
                    .hierarchy
                    .generate_signing_key(&self.ctx.unlock, &p.credentials, true, rid)
                    .await?;
                Ok(public_key_view(&record))
            }
            "createLease" => {
                let p: CreateLeaseParams = params(request)?;
                let lease = self
                    .ctx
                    .leases
                    .create_lease(
                        &p.user_id,
                        p.ttl_hours,
                        p.auto_extend.unwrap_or(false),
                        &p.credentials,
                        rid,
                    )
                    .await?;
                Ok(serde_json::to_value(lease)?)
            }
            "extendLeases" => {
                let p: ExtendLeasesParams = params(request)?;
                let outcomes = self
                    .ctx
                    .leases
                    .extend_leases(
                        &p.lease_ids,
                        &p.user_id,
                        p.request_auth.unwrap_or(false),
                        p.credentials.as_ref(),
                        rid,
                    )
                    .await?;
                Ok(json!({ "results": outcomes }))
            }
            "verifyLease" => {
                let p: VerifyLeaseParams = params(request)?;
                let outcome = self
                    .ctx
                    .leases
                    .verify_lease(&p.lease_id, p.delete_if_invalid.unwrap_or(false), rid)
                    .await?;
                Ok(serde_json::to_value(outcome)?)
            }
            "revokeLease" => {
                let p: RevokeLeaseParams = params(request)?;
                self.ctx.leases.revoke_lease(&p.lease_id, rid).await?;
                Ok(json!({ "revoked": p.lease_id }))
            }
            "clearInvalidLeases" => {
                let p: UserIdParams = params(request)?;
                let removed = self.ctx.leases.clear_invalid(&p.user_id, rid).await?;
                Ok(json!({ "removed": removed }))
            }
            "issueToken" => {
                let p: IssueTokenParams = params(request)?;
                let tokens = self
                    .ctx
                    .leases
                    .issue_tokens(&p.lease_id, 1, p.kid.as_deref(), rid)
                    .await?;
                let token = &tokens[0];
                Ok(json!({ "token": token.token, "jti": token.jti, "exp": token.exp }))
            }
            "issueTokens" => {
                let p: IssueTokensParams = params(request)?;
                let tokens = self
                    .ctx
                    .leases
                    .issue_tokens(&p.lease_id, p.count, p.kid.as_deref(), rid)
                    .await?;
                Ok(json!({
                    "tokens": tokens
                        .iter()
                        .map(|t| json!({ "token": t.token, "jti": t.jti, "exp": t.exp }))
                        .collect::<Vec<_>>(),
                }))
            }
            "setEndpoint" => {
                let p: SetEndpointParams = params(request)?;
                let binding = self
                    .ctx
                    .endpoints
                    .set_endpoint(p.user_id.as_deref(), &p.binding, rid)
                    .await?;
                Ok(serde_json::to_value(binding)?)
            }
            "removeEndpoint" => {
                let user_id = optional_user(request)?;
                self.ctx
                    .endpoints
                    .remove_endpoint(user_id.as_deref(), rid)
                    .await?;
                Ok(json!({}))
            }
            "resetAll" => {
                empty_params(request)?;
                self.ctx.reset_all().await?;
                info!("all stores reset");
                Ok(json!({}))
            }
            other => Err(KmsError::MethodUnknown(other.to_string())),
        }
    }

    async fn dispatch_read(&self, request: &RpcRequest) -> Result<Value> {
        match request.method.as_str() {
            "getPublicKey" => {
                let p: GetPublicKeyParams = params(request)?;
                let record = self
                    .ctx
                    .hierarchy
                    .record_by_kid(&p.kid)
                    .await?
                    .ok_or_else(|| KmsError::NotFound(format!("signing key {}", p.kid)))?;
                Ok(public_key_view(&record))
            }
            "getCurrentPublicKey" => {
                let p: UserIdParams = params(request)?;
                let record = self
                    .ctx
                    .hierarchy
                    .current_record(&p.user_id)
                    .await?
                    .ok_or_else(|| KmsError::NotFound("signing key for user".into()))?;
                Ok(public_key_view(&record))
            }
            "getUserLeases" => {
                let p: UserIdParams = params(request)?;
                let leases = self.ctx.leases.get_user_leases(&p.user_id).await?;
                Ok(json!({ "leases": leases }))
            }
            "getEndpoint" => {
                let user_id = optional_user(request)?;
                let binding = self.ctx.endpoints.get_endpoint(user_id.as_deref()).await?;
                Ok(match binding {
                    Some(binding) => serde_json::to_value(binding)?,
                    None => Value::Null,
                })
            }
            "isSetup" => {
                let user_id = optional_user(request)?;
                let setup = self.ctx.unlock.is_setup(user_id.as_deref()).await?;
                Ok(json!({ "setup": setup }))
            }
            "getEnrollments" => {
                let p: UserIdParams = params(request)?;
                let enrollments = self.ctx.unlock.enrollments(&p.user_id).await?;
                Ok(json!({ "enrollments": enrollments }))
            }
            "getAuditLog" => {
                let p: GetAuditLogParams = if request.params.is_null() {
                    GetAuditLogParams {
                        from: None,
                        to: None,
                    }
                } else {
                    params(request)?
                };
                let entries = self
                    .ctx
                    .audit
                    .entries(p.from.unwrap_or(1), p.to)
                    .await
                    .map_err(KmsError::from)?;
                Ok(json!({ "entries": entries }))
            }
            "getAuditPublicKey" => {
                empty_params(request)?;
                let key = self.ctx.audit.system_public_key().await.map_err(KmsError::from)?;
                Ok(match key {
                    Some((kid, public_key)) => json!({ "kid": kid, "publicKey": public_key }),
                    None => Value::Null,
                })
            }
            "verifyAuditChain" => {
                empty_params(request)?;
                let outcome = self.ctx.verify_audit_chain().await?;
                Ok(json!({
                    "valid": outcome.valid,
                    "entries": outcome.entries,
                    "firstFailed": outcome.first_failed,
                    "reason": outcome.reason,
                }))
            }
            other => Err(KmsError::MethodUnknown(other.to_string())),
        }
    }

    /// Composite onboarding: collect credentials once, then set up, bind
    /// an endpoint, lease, pre-issue tokens and fire a test notification.
    /// A setup failure aborts; later failures keep the earlier state and
    /// surface; a failed test notification only warns.
    async fn full_setup(&self, p: &FullSetupParams, rid: &str) -> Result<Value> {
        let mut credentials = self.collect_credentials(&p.user_id).await?;
        let outcome = self.full_setup_inner(p, &credentials, rid).await;
        scrub_credentials(&mut credentials);
        outcome
    }

    async fn full_setup_inner(
        &self,
        p: &FullSetupParams,
        credentials: &AuthCredentials,
        rid: &str,
    ) -> Result<Value> {
        self.setup_with(&p.user_id, credentials, rid).await?;

        let record = self
            .ctx
            .hierarchy
            .generate_signing_key(&self.ctx.unlock, credentials, false, rid)
            .await?;

        let subscription = self.request_subscription().await?;
        self.ctx
            .endpoints
            .set_endpoint(Some(&p.user_id), &subscription, rid)
            .await?;

        let lease = self
            .ctx
            .leases
            .create_lease(
                &p.user_id,
                p.ttl_hours.unwrap_or(self.ctx.config.full_setup_lease_hours),
                p.auto_extend.unwrap_or(true),
                credentials,
                rid,
            )
            .await?;

        let tokens = self
            .ctx
            .leases
            .issue_tokens(
                &lease.lease_id,
                self.ctx.config.full_setup_token_count,
                None,
                rid,
            )
            .await?;

        let notification_sent = match self.test_notification(&subscription.endpoint_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(code = e.code(), "test notification failed: {e}");
                false
            }
        };

        Ok(json!({
            "userId": p.user_id,
            "kid": record.kid,
            "leaseId": lease.lease_id,
            "tokens": tokens
                .iter()
                .map(|t| json!({ "token": t.token, "jti": t.jti, "exp": t.exp }))
                .collect::<Vec<_>>(),
            "notificationSent": notification_sent,
        }))
    }

    /// Route popup-collected credentials to the matching setup protocol.
    async fn setup_with(
        &self,
        user_id: &str,
        credentials: &AuthCredentials,
        rid: &str,
    ) -> Result<()> {
        if credentials.user_id() != user_id {
            return Err(KmsError::IncorrectCredential);
        }
        match credentials {
            AuthCredentials::Passphrase { passphrase, .. } => {
                self.ctx
                    .unlock
                    .setup_passphrase(user_id, passphrase, rid)
                    .await
            }
            AuthCredentials::AuthenticatorDerived {
                credential_id,
                authenticator_output,
                ..
            } => {
                let app_salt = keyfort_crypto::b64u_encode(keyfort_crypto::random_bytes(32));
                self.ctx
                    .unlock
                    .setup_authenticator_derived(
                        user_id,
                        credential_id,
                        authenticator_output,
                        &app_salt,
                        rid,
                    )
                    .await
            }
            AuthCredentials::AuthenticatorGate { credential_id, .. } => {
                self.ctx
                    .unlock
                    .setup_authenticator_gate(user_id, credential_id, rid)
                    .await
            }
        }
    }

    async fn collect_credentials(&self, user_id: &str) -> Result<AuthCredentials> {
        let timeout = Duration::from_secs(self.ctx.config.popup_timeout_secs);
        match tokio::time::timeout(timeout, self.transport.collect_credentials(user_id)).await {
            Ok(result) => result,
            Err(_) => Err(KmsError::PopupTimeout),
        }
    }

    async fn request_subscription(&self) -> Result<SubscriptionParams> {
        let timeout = Duration::from_secs(self.ctx.config.subscription_timeout_secs);
        match tokio::time::timeout(timeout, self.transport.request_subscription()).await {
            Ok(result) => result,
            Err(_) => Err(KmsError::SubscriptionTimeout),
        }
    }

    async fn test_notification(&self, endpoint_id: &str) -> Result<()> {
        let timeout = Duration::from_secs(self.ctx.config.notification_timeout_secs);
        match tokio::time::timeout(timeout, self.transport.send_test_notification(endpoint_id))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(KmsError::NotificationTimeout),
        }
    }
}

/// Mutations are serialized; reads are not.
fn is_mutation(method: &str) -> bool {
    matches!(
        method,
        "setupPassphrase"
            | "setupAuthenticatorDerived"
            | "setupAuthenticatorGate"
            | "setupWithPopup"
            | "addEnrollment"
            | "removeEnrollment"
            | "fullSetup"
            | "generateSigningKey"
            | "regenerateSigningKey"
            | "createLease"
            | "extendLeases"
            | "verifyLease"
            | "revokeLease"
            | "clearInvalidLeases"
            | "issueToken"
            | "issueTokens"
            | "setEndpoint"
            | "removeEndpoint"
            | "resetAll"
    )
}

fn public_key_view(record: &SigningKeyRecord) -> Value {
    json!({
        "kid": record.kid,
        "publicKey": keyfort_crypto::b64u_encode(&record.public_key),
        "algorithm": record.algorithm,
        "createdAt": record.created_at,
        "lastUsedAt": record.last_used_at,
    })
}

/// Credentials collected for a composite are overwritten once it ends.
fn scrub_credentials(credentials: &mut AuthCredentials) {
    match credentials {
        AuthCredentials::Passphrase { passphrase, .. } => passphrase.zeroize(),
        AuthCredentials::AuthenticatorDerived {
            authenticator_output,
            ..
        } => authenticator_output.zeroize(),
        AuthCredentials::AuthenticatorGate { .. } => {}
    }
}
