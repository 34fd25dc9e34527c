//! End-to-end scenarios through the dispatcher.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use keyfort_config::Config;
use keyfort_core::{AuthCredentials, KmsContext, Result as KmsResult, SubscriptionParams};
use keyfort_crypto::{b64u_decode, b64u_encode, SoftwareKeyProvider};
use keyfort_rpc::{Dispatcher, HostTransport, RpcRequest, RpcResponse};
use keyfort_store::{MemoryStore, Store};

/// Host stand-in that answers the internal protocol from canned data.
struct MockHost {
    credentials: AuthCredentials,
    subscription: SubscriptionParams,
    fail_notification: bool,
}

impl MockHost {
    fn for_user(user_id: &str, passphrase: &str) -> Self {
        Self {
            credentials: AuthCredentials::Passphrase {
                user_id: user_id.into(),
                passphrase: passphrase.into(),
            },
            subscription: subscription(),
            fail_notification: false,
        }
    }
}

#[async_trait]
impl HostTransport for MockHost {
    async fn collect_credentials(&self, _user_id: &str) -> KmsResult<AuthCredentials> {
        Ok(self.credentials.clone())
    }

    async fn request_subscription(&self) -> KmsResult<SubscriptionParams> {
        Ok(self.subscription.clone())
    }

    async fn send_test_notification(&self, _endpoint_id: &str) -> KmsResult<()> {
        if self.fail_notification {
            Err(keyfort_core::KmsError::Internal("push service down".into()))
        } else {
            Ok(())
        }
    }
}

struct Harness {
    dispatcher: Dispatcher,
    store: Arc<MemoryStore>,
    seq: std::sync::atomic::AtomicU64,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(Config::default())
    }

    fn with_config(config: Config) -> Self {
        Self::build(config, MockHost::for_user("u@x", "correcthorse"))
    }

    fn build(config: Config, host: MockHost) -> Self {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
        let store = Arc::new(MemoryStore::new());
        let ctx = Arc::new(KmsContext::new(
            store.clone(),
            Arc::new(SoftwareKeyProvider::new()),
            Arc::new(config),
        ));
        Self {
            dispatcher: Dispatcher::new(ctx, Arc::new(host)),
            store,
            seq: std::sync::atomic::AtomicU64::new(0),
        }
    }

    async fn call(&self, method: &str, params: Value) -> RpcResponse {
        let n = self
            .seq
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        self.dispatcher
            .handle(RpcRequest {
                id: format!("req-{n}"),
                method: method.into(),
                params,
            })
            .await
    }

    async fn expect_ok(&self, method: &str, params: Value) -> Value {
        match self.call(method, params).await {
            RpcResponse::Success { result, .. } => result,
            RpcResponse::Failure { error, .. } => {
                panic!("{method} failed: {} ({})", error.code, error.message)
            }
        }
    }

    async fn expect_err(&self, method: &str, params: Value) -> String {
        match self.call(method, params).await {
            RpcResponse::Success { result, .. } => {
                panic!("{method} unexpectedly succeeded: {result}")
            }
            RpcResponse::Failure { error, .. } => error.code,
        }
    }

    async fn audit_ops(&self) -> Vec<String> {
        let log = self.expect_ok("getAuditLog", json!(null)).await;
        log["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["op"].as_str().unwrap().to_string())
            .collect()
    }
}

fn creds(user_id: &str, passphrase: &str) -> Value {
    json!({
        "method": "passphrase",
        "userId": user_id,
        "passphrase": passphrase,
    })
}

fn subscription() -> SubscriptionParams {
    SubscriptionParams {
        endpoint: "https://fcm.googleapis.com/fcm/send/abc".into(),
        expiration: None,
        p256dh: b64u_encode({
            let mut point = vec![0x04];
            point.extend_from_slice(&[9u8; 64]);
            point
        }),
        auth: b64u_encode([4u8; 16]),
        endpoint_id: "e1".into(),
    }
}

fn subscription_value() -> Value {
    serde_json::to_value(subscription()).unwrap()
}

/// setupPassphrase → generateSigningKey → setEndpoint → createLease.
/// Returns the lease id.
async fn standard_setup(h: &Harness) -> String {
    h.expect_ok(
        "setupPassphrase",
        json!({"userId": "u@x", "passphrase": "correcthorse"}),
    )
    .await;
    h.expect_ok(
        "generateSigningKey",
        json!({"credentials": creds("u@x", "correcthorse")}),
    )
    .await;
    h.expect_ok("setEndpoint", json!({"binding": subscription_value()}))
        .await;
    let lease = h
        .expect_ok(
            "createLease",
            json!({
                "userId": "u@x",
                "ttlHours": 12,
                "autoExtend": true,
                "credentials": creds("u@x", "correcthorse"),
            }),
        )
        .await;
    lease["leaseId"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn scenario_setup_and_issue() {
    let h = Harness::new();
    let lease_id = standard_setup(&h).await;

    let issued = h
        .expect_ok("issueToken", json!({"leaseId": lease_id}))
        .await;
    let token = issued["token"].as_str().unwrap();
    let parts: Vec<&str> = token.split('.').collect();
    assert_eq!(parts.len(), 3);

    let payload: Value = serde_json::from_slice(&b64u_decode(parts[1]).unwrap()).unwrap();
    assert_eq!(payload["aud"], "https://fcm.googleapis.com");
    assert_eq!(payload["sub"], Config::default().token_contact);
    let now = chrono::Utc::now().timestamp();
    assert!((payload["exp"].as_i64().unwrap() - now - 900).abs() <= 2);

    assert_eq!(
        h.audit_ops().await,
        vec![
            "init",
            "enroll-user-audit-key",
            "setup",
            "generateSigningKey",
            "setEndpoint",
            "issueLease",
            "sign",
        ]
    );
    let verification = h.expect_ok("verifyAuditChain", json!(null)).await;
    assert_eq!(verification["valid"], true);
    assert_eq!(verification["entries"], 7);
}

#[tokio::test]
async fn scenario_policy_rejection_is_audited() {
    // An internal path that would put exp 48 hours out.
    let mut config = Config::default();
    config.token_ttl_secs = 48 * 3_600;
    let h = Harness::with_config(config);
    let lease_id = standard_setup(&h).await;

    let code = h
        .expect_err("issueToken", json!({"leaseId": lease_id}))
        .await;
    assert_eq!(code, "policy-violation");

    let ops = h.audit_ops().await;
    assert!(ops.iter().any(|op| op == "policy-violation"));
    assert!(!ops.iter().any(|op| op == "sign"));
}

#[tokio::test]
async fn scenario_offline_reissuance_staggers() {
    let h = Harness::new();
    let lease_id = standard_setup(&h).await;

    // No credentials supplied: the cached session KEK does the work.
    let batch = h
        .expect_ok("issueTokens", json!({"leaseId": lease_id, "count": 3}))
        .await;
    let tokens = batch["tokens"].as_array().unwrap();
    assert_eq!(tokens.len(), 3);

    let now = chrono::Utc::now().timestamp();
    let exps: Vec<i64> = tokens.iter().map(|t| t["exp"].as_i64().unwrap()).collect();
    assert!((exps[0] - now - 6_000).abs() <= 2);
    assert!((exps[1] - now - 9_600).abs() <= 2);
    assert!((exps[2] - now - 13_200).abs() <= 2);

    let log = h.expect_ok("getAuditLog", json!(null)).await;
    let sign_entry = log["entries"]
        .as_array()
        .unwrap()
        .iter()
        .find(|e| e["op"] == "sign")
        .unwrap();
    assert_eq!(sign_entry["role"], "lease");
}

#[tokio::test]
async fn scenario_regeneration_invalidates_leases() {
    let h = Harness::new();
    let lease_id = standard_setup(&h).await;

    h.expect_ok(
        "regenerateSigningKey",
        json!({"credentials": creds("u@x", "correcthorse")}),
    )
    .await;

    let verification = h
        .expect_ok("verifyLease", json!({"leaseId": lease_id}))
        .await;
    assert_eq!(verification["valid"], false);
    assert_eq!(verification["reason"], "wrong-key");

    let cleared = h
        .expect_ok("clearInvalidLeases", json!({"userId": "u@x"}))
        .await;
    assert_eq!(cleared["removed"], json!([lease_id]));
    assert!(h
        .audit_ops()
        .await
        .iter()
        .any(|op| op == "clearInvalidLeases"));

    let leases = h
        .expect_ok("getUserLeases", json!({"userId": "u@x"}))
        .await;
    assert_eq!(leases["leases"], json!([]));
}

#[tokio::test]
async fn scenario_tamper_detection_on_deleted_entry() {
    let h = Harness::new();
    standard_setup(&h).await;

    h.store.audit_delete(3).await.unwrap();

    let verification = h.expect_ok("verifyAuditChain", json!(null)).await;
    assert_eq!(verification["valid"], false);
    assert_eq!(verification["firstFailed"], 4);
}

#[tokio::test]
async fn scenario_multi_user_isolation() {
    let h = Harness::new();
    h.expect_ok(
        "setupPassphrase",
        json!({"userId": "a", "passphrase": "alice-1234"}),
    )
    .await;
    h.expect_ok(
        "setupPassphrase",
        json!({"userId": "b", "passphrase": "bob-12345"}),
    )
    .await;

    // Bob's credentials cannot authorize a lease for Alice.
    let code = h
        .expect_err(
            "createLease",
            json!({
                "userId": "a",
                "ttlHours": 12,
                "credentials": creds("b", "bob-12345"),
            }),
        )
        .await;
    assert_eq!(code, "incorrect-credential");

    for user in ["a", "b"] {
        let leases = h
            .expect_ok("getUserLeases", json!({"userId": user}))
            .await;
        assert_eq!(leases["leases"], json!([]), "user {user}");
    }
}

#[tokio::test]
async fn signature_segment_is_raw64() {
    let h = Harness::new();
    let lease_id = standard_setup(&h).await;
    let issued = h
        .expect_ok("issueToken", json!({"leaseId": lease_id}))
        .await;

    let token = issued["token"].as_str().unwrap();
    let sig_segment = token.split('.').nth(2).unwrap();
    assert_eq!(sig_segment.len(), 86);
    let sig = b64u_decode(sig_segment).unwrap();
    assert_eq!(sig.len(), 64);
    assert_ne!(sig[0], 0x30);
}

#[tokio::test]
async fn kid_is_thumbprint_of_returned_public_key() {
    let h = Harness::new();
    h.expect_ok(
        "setupPassphrase",
        json!({"userId": "u@x", "passphrase": "correcthorse"}),
    )
    .await;
    let key = h
        .expect_ok(
            "generateSigningKey",
            json!({"credentials": creds("u@x", "correcthorse")}),
        )
        .await;

    let public = b64u_decode(key["publicKey"].as_str().unwrap()).unwrap();
    assert_eq!(
        key["kid"].as_str().unwrap(),
        keyfort_crypto::thumbprint_of_raw_public(&public).unwrap()
    );

    let by_kid = h
        .expect_ok("getPublicKey", json!({"kid": key["kid"]}))
        .await;
    assert_eq!(by_kid["publicKey"], key["publicKey"]);
    let current = h
        .expect_ok("getCurrentPublicKey", json!({"userId": "u@x"}))
        .await;
    assert_eq!(current["kid"], key["kid"]);
}

#[tokio::test]
async fn unknown_method_and_bad_params() {
    let h = Harness::new();
    assert_eq!(
        h.expect_err("definitelyNotAMethod", json!({})).await,
        "method-unknown"
    );
    assert_eq!(
        h.expect_err("setupPassphrase", json!({"userId": "u@x"}))
            .await,
        "invalid-param"
    );
    assert_eq!(
        h.expect_err(
            "setupPassphrase",
            json!({"userId": "u@x", "passphrase": "correcthorse", "extra": true}),
        )
        .await,
        "invalid-param"
    );
    // Lease-auth methods demand a lease id.
    assert_eq!(
        h.expect_err("issueToken", json!({})).await,
        "invalid-param"
    );
}

#[tokio::test]
async fn full_setup_composite() {
    let h = Harness::new();
    let result = h.expect_ok("fullSetup", json!({"userId": "u@x"})).await;

    assert_eq!(result["userId"], "u@x");
    assert_eq!(result["notificationSent"], true);
    assert_eq!(result["tokens"].as_array().unwrap().len(), 5);

    // The pre-issued batch is staggered.
    let exps: Vec<i64> = result["tokens"]
        .as_array()
        .unwrap()
        .iter()
        .map(|t| t["exp"].as_i64().unwrap())
        .collect();
    for pair in exps.windows(2) {
        assert_eq!(pair[1] - pair[0], 3_600);
    }

    // Everything landed: enrollment, key, endpoint, lease.
    let setup = h.expect_ok("isSetup", json!({"userId": "u@x"})).await;
    assert_eq!(setup["setup"], true);
    let endpoint = h.expect_ok("getEndpoint", json!(null)).await;
    assert_eq!(endpoint["endpointId"], "e1");
    let leases = h
        .expect_ok("getUserLeases", json!({"userId": "u@x"}))
        .await;
    assert_eq!(leases["leases"].as_array().unwrap().len(), 1);
    assert_eq!(leases["leases"][0]["autoExtend"], true);

    let verification = h.expect_ok("verifyAuditChain", json!(null)).await;
    assert_eq!(verification["valid"], true);
}

#[tokio::test]
async fn full_setup_survives_notification_failure() {
    let mut host = MockHost::for_user("u@x", "correcthorse");
    host.fail_notification = true;
    let h = Harness::build(Config::default(), host);

    let result = h.expect_ok("fullSetup", json!({"userId": "u@x"})).await;
    assert_eq!(result["notificationSent"], false);
    assert_eq!(result["tokens"].as_array().unwrap().len(), 5);
}

#[tokio::test]
async fn setup_with_popup_routes_to_the_collected_method() {
    let h = Harness::new();
    h.expect_ok("setupWithPopup", json!({"userId": "u@x"}))
        .await;

    let setup = h.expect_ok("isSetup", json!({"userId": "u@x"})).await;
    assert_eq!(setup["setup"], true);
    let enrollments = h
        .expect_ok("getEnrollments", json!({"userId": "u@x"}))
        .await;
    assert_eq!(enrollments["enrollments"][0]["method"], "passphrase");
}

#[tokio::test]
async fn reset_restarts_chain_and_system_key() {
    let h = Harness::new();
    standard_setup(&h).await;
    let first = h.expect_ok("getAuditPublicKey", json!(null)).await;

    h.expect_ok("resetAll", json!(null)).await;
    let cleared = h.expect_ok("getAuditPublicKey", json!(null)).await;
    assert!(cleared.is_null());

    h.expect_ok(
        "setupPassphrase",
        json!({"userId": "u@x", "passphrase": "correcthorse"}),
    )
    .await;
    let second = h.expect_ok("getAuditPublicKey", json!(null)).await;
    assert_ne!(first["publicKey"], second["publicKey"]);

    let log = h.expect_ok("getAuditLog", json!(null)).await;
    assert_eq!(log["entries"][0]["seq"], 1);
    assert_eq!(log["entries"][0]["op"], "init");
    let verification = h.expect_ok("verifyAuditChain", json!(null)).await;
    assert_eq!(verification["valid"], true);
}

#[tokio::test]
async fn extend_batch_skips_non_extendable_without_auth() {
    let h = Harness::new();
    standard_setup(&h).await;
    let manual = h
        .expect_ok(
            "createLease",
            json!({
                "userId": "u@x",
                "ttlHours": 24,
                "autoExtend": false,
                "credentials": creds("u@x", "correcthorse"),
            }),
        )
        .await;
    let manual_id = manual["leaseId"].as_str().unwrap();

    let outcome = h
        .expect_ok(
            "extendLeases",
            json!({
                "leaseIds": [manual_id],
                "userId": "u@x",
                "requestAuth": false,
            }),
        )
        .await;
    assert_eq!(outcome["results"][0]["status"], "skipped");

    let outcome = h
        .expect_ok(
            "extendLeases",
            json!({
                "leaseIds": [manual_id],
                "userId": "u@x",
                "requestAuth": true,
                "credentials": creds("u@x", "correcthorse"),
            }),
        )
        .await;
    assert_eq!(outcome["results"][0]["status"], "extended");
}

#[tokio::test]
async fn tampering_with_any_entry_field_is_detected() {
    let h = Harness::new();
    standard_setup(&h).await;

    let mut entry = h.store.audit_get(4).await.unwrap().unwrap();
    entry["details"] = json!({"forged": true});
    h.store.audit_put(4, entry).await.unwrap();

    let verification = h.expect_ok("verifyAuditChain", json!(null)).await;
    assert_eq!(verification["valid"], false);
    assert_eq!(verification["firstFailed"], 4);
}
