//! End-to-end chain behavior: bootstrap, delegation, tamper detection.

use std::sync::Arc;

use serde_json::json;

use keyfort_audit::{
    delegation::issue_lease_delegation, verify_chain, AppendRequest, AuditLog, SignAs, SignerRole,
};
use keyfort_crypto::{KeyProvider, SoftwareKeyProvider};
use keyfort_store::{MemoryStore, Store};

fn fixture() -> (Arc<MemoryStore>, Arc<SoftwareKeyProvider>, AuditLog) {
    let store = Arc::new(MemoryStore::new());
    let provider = Arc::new(SoftwareKeyProvider::new());
    let log = AuditLog::new(store.clone(), provider.clone());
    (store, provider, log)
}

#[tokio::test]
async fn bootstrap_anchors_chain_at_seq_one() {
    let (store, _, log) = fixture();

    log.system_signer().await.unwrap();
    assert_eq!(log.tail_seq().await.unwrap(), 1);

    let entries = log.entries(1, None).await.unwrap();
    assert_eq!(entries[0].op, "init");
    assert_eq!(entries[0].role, SignerRole::System);
    assert_eq!(entries[0].prev_hash, "");

    // Idempotent: a second call reuses the installed key.
    log.system_signer().await.unwrap();
    assert_eq!(log.tail_seq().await.unwrap(), 1);

    let outcome = verify_chain(store.as_ref()).await.unwrap();
    assert!(outcome.valid);
    assert_eq!(outcome.entries, 1);
}

#[tokio::test]
async fn user_delegation_then_user_signed_entries() {
    let (store, _, log) = fixture();

    log.ensure_user_signer("u@x", "req-1").await.unwrap();
    // init + enroll-user-audit-key
    assert_eq!(log.tail_seq().await.unwrap(), 2);

    log.append(
        AppendRequest::new("setup", SignAs::User("u@x".into()), "req-2")
            .user_id("u@x")
            .details(json!({"method": "passphrase"})),
    )
    .await
    .unwrap();

    let outcome = verify_chain(store.as_ref()).await.unwrap();
    assert!(outcome.valid, "reason: {:?}", outcome.reason);
    assert_eq!(outcome.entries, 3);
}

#[tokio::test]
async fn lease_delegation_chain_verifies() {
    let (store, provider, log) = fixture();

    let user = log.ensure_user_signer("u@x", "req-1").await.unwrap();
    let lease = log.create_lease_signer("lease-1").await.unwrap();
    let cert = issue_lease_delegation(
        provider.as_ref(),
        &user.handle,
        "lease-1",
        "kid-abc",
        1_000,
        2_000,
        &lease.public,
    )
    .await
    .unwrap();

    log.append(
        AppendRequest::new("issueLease", SignAs::User("u@x".into()), "req-2")
            .user_id("u@x")
            .kid("kid-abc")
            .details(json!({ "leaseId": "lease-1", "delegation": cert.to_value().unwrap() })),
    )
    .await
    .unwrap();

    log.append(
        AppendRequest::new("sign", SignAs::Lease(lease.clone()), "req-3")
            .kid("kid-abc")
            .details(json!({ "leaseId": "lease-1", "count": 1 })),
    )
    .await
    .unwrap();

    let outcome = verify_chain(store.as_ref()).await.unwrap();
    assert!(outcome.valid, "reason: {:?}", outcome.reason);
    assert_eq!(outcome.entries, 4);
}

#[tokio::test]
async fn lease_entry_with_wrong_kid_is_rejected() {
    let (store, provider, log) = fixture();

    let user = log.ensure_user_signer("u@x", "req-1").await.unwrap();
    let lease = log.create_lease_signer("lease-1").await.unwrap();
    let cert = issue_lease_delegation(
        provider.as_ref(),
        &user.handle,
        "lease-1",
        "kid-abc",
        1_000,
        2_000,
        &lease.public,
    )
    .await
    .unwrap();

    log.append(
        AppendRequest::new("issueLease", SignAs::User("u@x".into()), "req-2")
            .user_id("u@x")
            .kid("kid-abc")
            .details(json!({ "leaseId": "lease-1", "delegation": cert.to_value().unwrap() })),
    )
    .await
    .unwrap();

    // The lease signs for a kid its delegation does not cover.
    let bad = log
        .append(
            AppendRequest::new("sign", SignAs::Lease(lease), "req-3")
                .kid("kid-other")
                .details(json!({ "leaseId": "lease-1" })),
        )
        .await
        .unwrap();

    let outcome = verify_chain(store.as_ref()).await.unwrap();
    assert!(!outcome.valid);
    assert_eq!(outcome.first_failed, Some(bad.seq));
}

#[tokio::test]
async fn mutating_any_stored_field_trips_verification() {
    let (store, _, log) = fixture();
    log.ensure_user_signer("u@x", "req-1").await.unwrap();
    log.append(
        AppendRequest::new("setup", SignAs::User("u@x".into()), "req-2")
            .user_id("u@x")
            .details(json!({"method": "passphrase"})),
    )
    .await
    .unwrap();

    // Mutate the op of entry 2.
    let mut tampered = store.audit_get(2).await.unwrap().unwrap();
    tampered["op"] = json!("somethingElse");
    store.audit_put(2, tampered).await.unwrap();

    let outcome = verify_chain(store.as_ref()).await.unwrap();
    assert!(!outcome.valid);
    assert_eq!(outcome.first_failed, Some(2));
}

#[tokio::test]
async fn deleting_an_entry_reports_the_successor() {
    let (store, _, log) = fixture();
    log.ensure_user_signer("u@x", "req-1").await.unwrap();
    for i in 0..3 {
        log.append(
            AppendRequest::new("setup", SignAs::User("u@x".into()), format!("req-{i}"))
                .user_id("u@x"),
        )
        .await
        .unwrap();
    }
    assert_eq!(log.tail_seq().await.unwrap(), 5);

    store.audit_delete(3).await.unwrap();

    let outcome = verify_chain(store.as_ref()).await.unwrap();
    assert!(!outcome.valid);
    assert_eq!(outcome.first_failed, Some(4));
}

#[tokio::test]
async fn reset_restarts_chain_with_fresh_system_key() {
    let (store, _, log) = fixture();
    let first = log.ensure_user_signer("u@x", "req-1").await.unwrap();
    let first_system = log.system_public_key().await.unwrap().unwrap();

    store.clear_all().await.unwrap();

    let second = log.ensure_user_signer("u@x", "req-2").await.unwrap();
    let second_system = log.system_public_key().await.unwrap().unwrap();

    assert_ne!(first.kid, second.kid);
    assert_ne!(first_system.1, second_system.1);
    assert_eq!(log.entries(1, None).await.unwrap()[0].seq, 1);

    let outcome = verify_chain(store.as_ref()).await.unwrap();
    assert!(outcome.valid);
    assert_eq!(outcome.entries, 2);
}
