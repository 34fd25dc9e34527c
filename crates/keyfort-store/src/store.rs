use async_trait::async_trait;
use serde_json::Value;

use crate::error::Result;

/// The key-value stores. The audit store has its own sequence-keyed API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreKind {
    Meta,
    Keys,
    Leases,
}

impl StoreKind {
    pub fn table(&self) -> &'static str {
        match self {
            StoreKind::Meta => "meta",
            StoreKind::Keys => "keys",
            StoreKind::Leases => "leases",
        }
    }
}

/// A record mutation carried inside an audit append transaction.
#[derive(Debug, Clone)]
pub enum SideWrite {
    Put {
        store: StoreKind,
        key: String,
        value: Value,
    },
    Delete {
        store: StoreKind,
        key: String,
    },
}

/// Durable local store.
///
/// Every call may suspend; callers must tolerate `Unavailable` as fatal.
/// Transient backend conflicts are retried internally.
#[async_trait]
pub trait Store: Send + Sync {
    async fn get(&self, store: StoreKind, key: &str) -> Result<Option<Value>>;
    async fn put(&self, store: StoreKind, key: &str, value: Value) -> Result<()>;
    async fn delete(&self, store: StoreKind, key: &str) -> Result<()>;

    /// All records of a store, ordered by key.
    async fn list(&self, store: StoreKind) -> Result<Vec<(String, Value)>>;

    /// Highest-sequence audit entry, if the log is non-empty.
    async fn audit_tail(&self) -> Result<Option<(u64, Value)>>;

    async fn audit_get(&self, seq: u64) -> Result<Option<Value>>;

    /// Entries with `from <= seq <= to` (unbounded tail when `to` is None),
    /// in sequence order.
    async fn audit_range(&self, from: u64, to: Option<u64>) -> Result<Vec<(u64, Value)>>;

    /// Append `entry` at `expected_seq` together with the record writes that
    /// triggered it, in one transaction. Fails with `AppendConflict` if the
    /// tail has moved - the caller rebuilds the entry and retries.
    async fn append_audit(
        &self,
        expected_seq: u64,
        entry: Value,
        writes: Vec<SideWrite>,
    ) -> Result<()>;

    /// Overwrite a single audit record in place. Verification tooling and
    /// tamper tests only; the service itself never rewrites the chain.
    async fn audit_put(&self, seq: u64, entry: Value) -> Result<()>;

    /// Remove a single audit record. Same caveat as [`Store::audit_put`].
    async fn audit_delete(&self, seq: u64) -> Result<()>;

    /// Destructive reset: drop every store including the audit chain.
    async fn clear_all(&self) -> Result<()>;
}
