//! Message envelopes
//!
//! External requests and responses, plus the internal envelopes exchanged
//! with the foreground context (credential popup, subscription request,
//! test notification). Internal requests correlate with their
//! `-result`/`-error` replies by request id.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use keyfort_core::KmsError;

/// External request: `{id, method, params}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RpcErrorBody {
    pub code: String,
    pub message: String,
}

/// External response: `{id, result}` or `{id, error}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum RpcResponse {
    Success { id: String, result: Value },
    Failure { id: String, error: RpcErrorBody },
}

impl RpcResponse {
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        RpcResponse::Success {
            id: id.into(),
            result,
        }
    }

    pub fn failure(id: impl Into<String>, error: &KmsError) -> Self {
        RpcResponse::Failure {
            id: id.into(),
            error: RpcErrorBody {
                code: error.code().to_string(),
                message: error.to_string(),
            },
        }
    }

    pub fn id(&self) -> &str {
        match self {
            RpcResponse::Success { id, .. } | RpcResponse::Failure { id, .. } => id,
        }
    }

    pub fn result(&self) -> Option<&Value> {
        match self {
            RpcResponse::Success { result, .. } => Some(result),
            RpcResponse::Failure { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&RpcErrorBody> {
        match self {
            RpcResponse::Success { .. } => None,
            RpcResponse::Failure { error, .. } => Some(error),
        }
    }
}

/// Internal background->foreground requests and their reply channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum InternalMessage {
    #[serde(rename = "request-credentials", rename_all = "camelCase")]
    RequestCredentials { request_id: String, user_id: String },

    #[serde(rename = "credentials-result", rename_all = "camelCase")]
    CredentialsResult {
        request_id: String,
        credentials: Value,
    },

    #[serde(rename = "credentials-error", rename_all = "camelCase")]
    CredentialsError { request_id: String, message: String },

    #[serde(rename = "request-subscription", rename_all = "camelCase")]
    RequestSubscription { request_id: String },

    #[serde(rename = "subscription-result", rename_all = "camelCase")]
    SubscriptionResult {
        request_id: String,
        subscription: Value,
    },

    #[serde(rename = "subscription-error", rename_all = "camelCase")]
    SubscriptionError { request_id: String, message: String },

    #[serde(rename = "request-test-notification", rename_all = "camelCase")]
    RequestTestNotification {
        request_id: String,
        endpoint_id: String,
    },

    #[serde(rename = "notification-result", rename_all = "camelCase")]
    NotificationResult { request_id: String },

    #[serde(rename = "notification-error", rename_all = "camelCase")]
    NotificationError { request_id: String, message: String },
}

impl InternalMessage {
    pub fn request_id(&self) -> &str {
        match self {
            InternalMessage::RequestCredentials { request_id, .. }
            | InternalMessage::CredentialsResult { request_id, .. }
            | InternalMessage::CredentialsError { request_id, .. }
            | InternalMessage::RequestSubscription { request_id }
            | InternalMessage::SubscriptionResult { request_id, .. }
            | InternalMessage::SubscriptionError { request_id, .. }
            | InternalMessage::RequestTestNotification { request_id, .. }
            | InternalMessage::NotificationResult { request_id }
            | InternalMessage::NotificationError { request_id, .. } => request_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn responses_take_the_two_wire_shapes() {
        let ok = RpcResponse::success("r1", json!({"setup": true}));
        let value = serde_json::to_value(&ok).unwrap();
        assert_eq!(value, json!({"id": "r1", "result": {"setup": true}}));

        let err = RpcResponse::failure("r2", &KmsError::NotSetup);
        let value = serde_json::to_value(&err).unwrap();
        assert_eq!(value["id"], "r2");
        assert_eq!(value["error"]["code"], "not-setup");
        assert!(value.get("result").is_none());
    }

    #[test]
    fn internal_messages_tag_by_type() {
        let msg = InternalMessage::RequestSubscription {
            request_id: "q1".into(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "request-subscription");
        assert_eq!(value["requestId"], "q1");

        let back: InternalMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn request_params_default_to_null() {
        let request: RpcRequest =
            serde_json::from_value(json!({"id": "r1", "method": "isSetup"})).unwrap();
        assert!(request.params.is_null());
    }
}
