//! Per-method parameter validation
//!
//! Each recognized method deserializes its params into a dedicated struct
//! with unknown fields rejected, so shape errors fail fast at the
//! dispatcher boundary with `invalid-param`.

use serde::de::DeserializeOwned;
use serde::Deserialize;

use keyfort_core::{AuthCredentials, KmsError, NewEnrollment, Result, SubscriptionParams};

use crate::envelope::RpcRequest;

/// Deserialize `params` for one method.
pub fn params<T: DeserializeOwned>(request: &RpcRequest) -> Result<T> {
    serde_json::from_value(request.params.clone())
        .map_err(|e| KmsError::InvalidParam(format!("{}: {e}", request.method)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SetupPassphraseParams {
    pub user_id: String,
    pub passphrase: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SetupAuthenticatorDerivedParams {
    pub user_id: String,
    pub credential_id: String,
    pub authenticator_output: String,
    pub app_salt: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SetupAuthenticatorGateParams {
    pub user_id: String,
    pub credential_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SetupWithPopupParams {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AddEnrollmentParams {
    pub user_id: String,
    pub credentials: AuthCredentials,
    pub new_method: NewEnrollment,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RemoveEnrollmentParams {
    pub enrollment_id: String,
    pub credentials: AuthCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct FullSetupParams {
    pub user_id: String,
    pub auto_extend: Option<bool>,
    pub ttl_hours: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CredentialsOnlyParams {
    pub credentials: AuthCredentials,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GetPublicKeyParams {
    pub kid: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UserIdParams {
    pub user_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OptionalUserIdParams {
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateLeaseParams {
    pub user_id: String,
    pub ttl_hours: u32,
    pub credentials: AuthCredentials,
    #[serde(default)]
    pub auto_extend: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExtendLeasesParams {
    pub lease_ids: Vec<String>,
    pub user_id: String,
    #[serde(default)]
    pub request_auth: Option<bool>,
    #[serde(default)]
    pub credentials: Option<AuthCredentials>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct VerifyLeaseParams {
    pub lease_id: String,
    #[serde(default)]
    pub delete_if_invalid: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RevokeLeaseParams {
    pub lease_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IssueTokenParams {
    pub lease_id: String,
    #[serde(default)]
    pub kid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IssueTokensParams {
    pub lease_id: String,
    pub count: u32,
    #[serde(default)]
    pub kid: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SetEndpointParams {
    pub binding: SubscriptionParams,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GetAuditLogParams {
    #[serde(default)]
    pub from: Option<u64>,
    #[serde(default)]
    pub to: Option<u64>,
}

/// Methods with an empty params object (or none at all).
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EmptyParams {}

/// Accept `{}`, `null` or a missing params member for empty-param methods.
pub fn empty_params(request: &RpcRequest) -> Result<()> {
    if request.params.is_null() {
        return Ok(());
    }
    params::<EmptyParams>(request).map(|_| ())
}

/// Optional-user methods also accept `null`/missing params.
pub fn optional_user(request: &RpcRequest) -> Result<Option<String>> {
    if request.params.is_null() {
        return Ok(None);
    }
    params::<OptionalUserIdParams>(request).map(|p| p.user_id)
}
