//! In-memory store for tests and ephemeral contexts

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::store::{SideWrite, Store, StoreKind};

/// DashMap-backed store with the same transactional semantics as the
/// sqlite backend.
#[derive(Default)]
pub struct MemoryStore {
    meta: DashMap<String, Value>,
    keys: DashMap<String, Value>,
    leases: DashMap<String, Value>,
    audit: Mutex<BTreeMap<u64, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn map(&self, store: StoreKind) -> &DashMap<String, Value> {
        match store {
            StoreKind::Meta => &self.meta,
            StoreKind::Keys => &self.keys,
            StoreKind::Leases => &self.leases,
        }
    }

    fn audit(&self) -> std::sync::MutexGuard<'_, BTreeMap<u64, Value>> {
        // Mutex poisoning only happens after a panic mid-write; the maps
        // hold plain JSON so the data is still coherent.
        self.audit.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, store: StoreKind, key: &str) -> Result<Option<Value>> {
        Ok(self.map(store).get(key).map(|v| v.value().clone()))
    }

    async fn put(&self, store: StoreKind, key: &str, value: Value) -> Result<()> {
        self.map(store).insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, store: StoreKind, key: &str) -> Result<()> {
        self.map(store).remove(key);
        Ok(())
    }

    async fn list(&self, store: StoreKind) -> Result<Vec<(String, Value)>> {
        let mut records: Vec<(String, Value)> = self
            .map(store)
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        records.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(records)
    }

    async fn audit_tail(&self) -> Result<Option<(u64, Value)>> {
        Ok(self
            .audit()
            .iter()
            .next_back()
            .map(|(seq, v)| (*seq, v.clone())))
    }

    async fn audit_get(&self, seq: u64) -> Result<Option<Value>> {
        Ok(self.audit().get(&seq).cloned())
    }

    async fn audit_range(&self, from: u64, to: Option<u64>) -> Result<Vec<(u64, Value)>> {
        let audit = self.audit();
        let upper = to.unwrap_or(u64::MAX);
        Ok(audit
            .range(from..=upper)
            .map(|(seq, v)| (*seq, v.clone()))
            .collect())
    }

    async fn append_audit(
        &self,
        expected_seq: u64,
        entry: Value,
        writes: Vec<SideWrite>,
    ) -> Result<()> {
        let mut audit = self.audit();
        let tail = audit.keys().next_back().copied().unwrap_or(0);
        if expected_seq != tail + 1 {
            return Err(StoreError::AppendConflict {
                expected: expected_seq,
                tail,
            });
        }
        audit.insert(expected_seq, entry);
        drop(audit);

        for write in writes {
            match write {
                SideWrite::Put { store, key, value } => {
                    self.map(store).insert(key, value);
                }
                SideWrite::Delete { store, key } => {
                    self.map(store).remove(&key);
                }
            }
        }
        Ok(())
    }

    async fn audit_put(&self, seq: u64, entry: Value) -> Result<()> {
        self.audit().insert(seq, entry);
        Ok(())
    }

    async fn audit_delete(&self, seq: u64) -> Result<()> {
        self.audit().remove(&seq);
        Ok(())
    }

    async fn clear_all(&self) -> Result<()> {
        self.meta.clear();
        self.keys.clear();
        self.leases.clear();
        self.audit().clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_get_delete_list() {
        let store = MemoryStore::new();
        store
            .put(StoreKind::Meta, "b", json!({"v": 2}))
            .await
            .unwrap();
        store
            .put(StoreKind::Meta, "a", json!({"v": 1}))
            .await
            .unwrap();

        assert_eq!(
            store.get(StoreKind::Meta, "a").await.unwrap(),
            Some(json!({"v": 1}))
        );
        let listed = store.list(StoreKind::Meta).await.unwrap();
        assert_eq!(listed[0].0, "a");
        assert_eq!(listed[1].0, "b");

        store.delete(StoreKind::Meta, "a").await.unwrap();
        assert_eq!(store.get(StoreKind::Meta, "a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn audit_append_enforces_sequence() {
        let store = MemoryStore::new();
        store
            .append_audit(1, json!({"op": "init"}), vec![])
            .await
            .unwrap();
        store
            .append_audit(2, json!({"op": "next"}), vec![])
            .await
            .unwrap();

        let err = store
            .append_audit(2, json!({"op": "dup"}), vec![])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::AppendConflict {
                expected: 2,
                tail: 2
            }
        ));

        let err = store
            .append_audit(5, json!({"op": "gap"}), vec![])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::AppendConflict { .. }));
    }

    #[tokio::test]
    async fn append_carries_side_writes() {
        let store = MemoryStore::new();
        store
            .append_audit(
                1,
                json!({"op": "setup"}),
                vec![SideWrite::Put {
                    store: StoreKind::Keys,
                    key: "kid-1".into(),
                    value: json!({"alg": "ES256"}),
                }],
            )
            .await
            .unwrap();
        assert!(store.get(StoreKind::Keys, "kid-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn clear_all_resets_everything() {
        let store = MemoryStore::new();
        store.put(StoreKind::Leases, "l", json!(1)).await.unwrap();
        store.append_audit(1, json!({}), vec![]).await.unwrap();
        store.clear_all().await.unwrap();

        assert!(store.list(StoreKind::Leases).await.unwrap().is_empty());
        assert!(store.audit_tail().await.unwrap().is_none());
        // The chain restarts at 1 after a reset.
        store.append_audit(1, json!({}), vec![]).await.unwrap();
    }
}
