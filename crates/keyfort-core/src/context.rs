//! Service context
//!
//! One context owns the store, the key provider, the audit log and every
//! manager. Handlers receive it as a parameter - there are no globals, so
//! tests inject a fresh context per scenario.

use std::sync::Arc;

use tracing::warn;

use keyfort_audit::{verify_chain, AuditEntry, AuditLog, ChainVerification};
use keyfort_config::Config;
use keyfort_crypto::KeyProvider;
use keyfort_store::Store;

use crate::endpoint::EndpointManager;
use crate::error::Result;
use crate::hierarchy::KeyHierarchy;
use crate::lease::LeaseManager;
use crate::signing::SigningEngine;
use crate::unlock::UnlockManager;

pub struct KmsContext {
    pub store: Arc<dyn Store>,
    pub provider: Arc<dyn KeyProvider>,
    pub config: Arc<Config>,
    pub audit: Arc<AuditLog>,
    pub unlock: Arc<UnlockManager>,
    pub hierarchy: Arc<KeyHierarchy>,
    pub engine: Arc<SigningEngine>,
    pub leases: Arc<LeaseManager>,
    pub endpoints: Arc<EndpointManager>,
}

impl KmsContext {
    pub fn new(
        store: Arc<dyn Store>,
        provider: Arc<dyn KeyProvider>,
        config: Arc<Config>,
    ) -> Self {
        let audit = Arc::new(AuditLog::new(store.clone(), provider.clone()));
        let unlock = Arc::new(UnlockManager::new(
            store.clone(),
            audit.clone(),
            config.clone(),
        ));
        let hierarchy = Arc::new(KeyHierarchy::new(
            store.clone(),
            provider.clone(),
            audit.clone(),
            config.clone(),
        ));
        let engine = Arc::new(SigningEngine::new(provider.clone(), config.clone()));
        let leases = Arc::new(LeaseManager::new(
            store.clone(),
            provider.clone(),
            audit.clone(),
            config.clone(),
            hierarchy.clone(),
            engine.clone(),
            unlock.clone(),
        ));
        let endpoints = Arc::new(EndpointManager::new(
            audit.clone(),
            config.clone(),
            hierarchy.clone(),
        ));

        Self {
            store,
            provider,
            config,
            audit,
            unlock,
            hierarchy,
            engine,
            leases,
            endpoints,
        }
    }

    /// Full audit chain, parsed.
    pub async fn audit_entries(&self) -> Result<Vec<AuditEntry>> {
        Ok(self.audit.entries(1, None).await?)
    }

    /// Verify the whole chain.
    pub async fn verify_audit_chain(&self) -> Result<ChainVerification> {
        Ok(verify_chain(self.store.as_ref()).await?)
    }

    /// Destructive reset: every store is dropped, session KEKs are
    /// evicted, and the next setup starts a fresh chain under a fresh
    /// system key.
    pub async fn reset_all(&self) -> Result<()> {
        warn!("destructive reset requested; all stores will be cleared");
        self.store.clear_all().await?;
        self.leases.evict_session_keks();
        Ok(())
    }
}
