//! Host transport
//!
//! The background context cannot render UI or talk to the push service; it
//! asks the foreground over a message channel and waits for the correlated
//! reply. [`HostTransport`] is the typed seam; [`MessageTransport`] is the
//! envelope-level implementation with a pending-request map. Timeouts are
//! applied by the dispatcher.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;
use uuid::Uuid;

use keyfort_core::{AuthCredentials, KmsError, Result, SubscriptionParams};

use crate::envelope::InternalMessage;

#[async_trait]
pub trait HostTransport: Send + Sync {
    /// Open the credential-collection window and wait for the user.
    async fn collect_credentials(&self, user_id: &str) -> Result<AuthCredentials>;

    /// Ask the host for its push subscription.
    async fn request_subscription(&self) -> Result<SubscriptionParams>;

    /// Ask the host to deliver a test notification.
    async fn send_test_notification(&self, endpoint_id: &str) -> Result<()>;
}

/// Envelope-level transport: requests go out on an mpsc channel, replies
/// come back through [`MessageTransport::deliver`] and are matched to
/// their waiter by request id.
pub struct MessageTransport {
    outgoing: mpsc::UnboundedSender<InternalMessage>,
    pending: DashMap<String, oneshot::Sender<InternalMessage>>,
}

impl MessageTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<InternalMessage>) {
        let (outgoing, rx) = mpsc::unbounded_channel();
        (
            Self {
                outgoing,
                pending: DashMap::new(),
            },
            rx,
        )
    }

    /// Feed a foreground reply back in. Unknown or expired request ids are
    /// dropped (the waiter already timed out).
    pub fn deliver(&self, message: InternalMessage) {
        let request_id = message.request_id().to_string();
        if let Some((_, waiter)) = self.pending.remove(&request_id) {
            let _ = waiter.send(message);
        } else {
            debug!(request_id, "reply for unknown internal request dropped");
        }
    }

    async fn round_trip(&self, message: InternalMessage) -> Result<InternalMessage> {
        let request_id = message.request_id().to_string();
        let (tx, rx) = oneshot::channel();
        self.pending.insert(request_id.clone(), tx);
        // The guard clears the pending entry on every exit, including the
        // caller's timeout cancelling this future mid-wait.
        let _guard = PendingGuard {
            pending: &self.pending,
            request_id: request_id.clone(),
        };

        if self.outgoing.send(message).is_err() {
            return Err(KmsError::Internal("host channel closed".into()));
        }
        rx.await
            .map_err(|_| KmsError::Internal("internal request abandoned".into()))
    }
}

struct PendingGuard<'a> {
    pending: &'a DashMap<String, oneshot::Sender<InternalMessage>>,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

#[async_trait]
impl HostTransport for MessageTransport {
    async fn collect_credentials(&self, user_id: &str) -> Result<AuthCredentials> {
        let request_id = Uuid::new_v4().to_string();
        let reply = self
            .round_trip(InternalMessage::RequestCredentials {
                request_id,
                user_id: user_id.to_string(),
            })
            .await?;
        match reply {
            InternalMessage::CredentialsResult { credentials, .. } => parse_credentials(credentials),
            InternalMessage::CredentialsError { message, .. } => {
                Err(KmsError::AuthenticatorUnavailable(message))
            }
            other => Err(KmsError::Internal(format!(
                "unexpected reply {:?} to credential request",
                other.request_id()
            ))),
        }
    }

    async fn request_subscription(&self) -> Result<SubscriptionParams> {
        let request_id = Uuid::new_v4().to_string();
        let reply = self
            .round_trip(InternalMessage::RequestSubscription { request_id })
            .await?;
        match reply {
            InternalMessage::SubscriptionResult { subscription, .. } => {
                serde_json::from_value(subscription)
                    .map_err(|e| KmsError::InvalidParam(format!("subscription payload: {e}")))
            }
            InternalMessage::SubscriptionError { message, .. } => {
                Err(KmsError::InvalidEndpoint(message))
            }
            other => Err(KmsError::Internal(format!(
                "unexpected reply {:?} to subscription request",
                other.request_id()
            ))),
        }
    }

    async fn send_test_notification(&self, endpoint_id: &str) -> Result<()> {
        let request_id = Uuid::new_v4().to_string();
        let reply = self
            .round_trip(InternalMessage::RequestTestNotification {
                request_id,
                endpoint_id: endpoint_id.to_string(),
            })
            .await?;
        match reply {
            InternalMessage::NotificationResult { .. } => Ok(()),
            InternalMessage::NotificationError { message, .. } => {
                Err(KmsError::Internal(message))
            }
            other => Err(KmsError::Internal(format!(
                "unexpected reply {:?} to notification request",
                other.request_id()
            ))),
        }
    }
}

fn parse_credentials(value: Value) -> Result<AuthCredentials> {
    serde_json::from_value(value)
        .map_err(|e| KmsError::InvalidParam(format!("credentials payload: {e}")))
}
