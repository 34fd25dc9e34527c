//! Keyfort durable local store
//!
//! Four logical stores back the service: `meta` (enrollments and audit
//! public keys), `keys` (signing key records), `audit` (the hash chain,
//! keyed by sequence number) and `leases`. Records are structured JSON
//! maps; nothing in here interprets them.
//!
//! The one non-trivial guarantee lives in [`Store::append_audit`]: the
//! audit entry and the record writes that triggered it land in a single
//! transaction, and the append is admitted only at the expected sequence
//! number, which keeps the chain gap-free.

pub mod error;
pub mod memory;
pub mod sqlite;
mod store;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{SideWrite, Store, StoreKind};
