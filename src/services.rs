//! Shared service bundle.
//!
//! Every process-wide piece of state — credential chain, rate tracker,
//! cost ledger, response cache, conversation store, agent registry — is
//! owned by one [`Services`] value constructed explicitly by the host
//! and passed around as a single handle. There is no hidden module
//! state; tests get a fresh world from [`Services::reset_for_tests`].
//!
//! Locking discipline: many readers, one writer, via `tokio::sync::RwLock`.
//! The cache's LRU bookkeeping mutates on reads too, so cache lookups take
//! the write lock; entry lookup and LRU promotion happen under one guard.

use crate::adapter::WorkerAdapter;
use crate::agent::AgentSupervisor;
use crate::auth::AuthChain;
use crate::cache::{CacheStats, ResponseCache};
use crate::config::RelayConfig;
use crate::conversation::ConversationStore;
use crate::limits::{CostLedger, LedgerStats, RateStats, RateTracker};
use crate::marketplace::MarketplaceClient;
use crate::router::Router;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Aggregate snapshot returned by [`Services::stats`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStats {
    pub cache: CacheStats,
    pub rate: RateStats,
    pub ledger: LedgerStats,
    pub active_conversations: usize,
    pub agent_sessions: usize,
}

/// Handle bundling all shared services.
pub struct Services {
    pub config: RelayConfig,
    pub router: Router,
    pub auth: RwLock<AuthChain>,
    pub rate: RwLock<RateTracker>,
    pub ledger: RwLock<CostLedger>,
    pub cache: RwLock<ResponseCache>,
    pub conversations: ConversationStore,
    pub agents: AgentSupervisor,
    pub adapter: Arc<dyn WorkerAdapter>,
    pub marketplace: MarketplaceClient,
    state_dir: PathBuf,
}

impl Services {
    /// Construct with the default state directory under the user's home.
    pub fn new(config: RelayConfig, adapter: Arc<dyn WorkerAdapter>) -> Result<Arc<Self>> {
        let state_dir = RelayConfig::state_dir()?;
        Self::with_state_dir(config, adapter, state_dir)
    }

    /// Construct with an explicit state directory. Tests point this at a
    /// temporary directory.
    pub fn with_state_dir(
        config: RelayConfig,
        adapter: Arc<dyn WorkerAdapter>,
        state_dir: PathBuf,
    ) -> Result<Arc<Self>> {
        let auth = AuthChain::from_config(&config);
        let agents = AgentSupervisor::new(
            config.clone(),
            Arc::clone(&adapter),
            state_dir.join("agent-sessions"),
        );
        Ok(Arc::new(Self {
            router: Router::default(),
            auth: RwLock::new(auth),
            rate: RwLock::new(RateTracker::default()),
            ledger: RwLock::new(CostLedger::new()),
            cache: RwLock::new(ResponseCache::default()),
            conversations: ConversationStore::new(),
            agents,
            adapter,
            marketplace: MarketplaceClient::new()?,
            state_dir,
            config,
        }))
    }

    /// Path of the persisted response-cache file.
    pub fn cache_path(&self) -> PathBuf {
        self.state_dir.join("response-cache.json")
    }

    /// Load the persisted cache, if any.
    pub async fn load_cache(&self) -> Result<usize> {
        let path = self.cache_path();
        self.cache.write().await.load(&path).await
    }

    /// Persist the cache to its configured file.
    pub async fn persist_cache(&self) -> Result<()> {
        let path = self.cache_path();
        let cache = self.cache.read().await;
        cache.persist(&path).await
    }

    /// One aggregate snapshot across every shared service, for host
    /// status reports.
    pub async fn stats(&self) -> ServiceStats {
        ServiceStats {
            cache: self.cache.read().await.stats(),
            rate: self.rate.read().await.stats(),
            ledger: self.ledger.read().await.stats(),
            active_conversations: self
                .conversations
                .list(Some(crate::conversation::ConversationState::Active))
                .await
                .len(),
            agent_sessions: self.agents.list(None).await.len(),
        }
    }

    /// Return every mutable service to its initial state.
    pub async fn reset_for_tests(&self) {
        *self.auth.write().await = AuthChain::from_config(&self.config);
        *self.rate.write().await = RateTracker::default();
        *self.ledger.write().await = CostLedger::new();
        self.cache.write().await.clear();
        self.conversations.reset().await;
        self.agents.reset().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::GeminiCli;
    use crate::types::TokenUsage;

    fn services() -> Arc<Services> {
        Services::with_state_dir(
            RelayConfig::default(),
            Arc::new(GeminiCli::default()),
            std::env::temp_dir().join("agent-relay-services-test"),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_reset_clears_every_service() {
        let services = services();
        services.cache.write().await.set("p", "m", "r", None);
        services
            .ledger
            .write()
            .await
            .record("gemini-2.5-pro", TokenUsage::new(10, 10), false);
        services.rate.write().await.record_failure("gemini-2.5-pro");

        services.reset_for_tests().await;

        assert!(services.cache.read().await.is_empty());
        assert_eq!(services.ledger.read().await.stats().totals.requests, 0);
        assert!(services.rate.write().await.stats().models.is_empty());
    }

    #[tokio::test]
    async fn test_stats_aggregates_all_services() {
        let services = services();
        services
            .cache
            .write()
            .await
            .set("p", "gemini-2.5-flash", "r", None);
        services
            .conversations
            .start("t", "gemini-2.5-flash", None, None)
            .await;

        let stats = services.stats().await;
        assert_eq!(stats.cache.entries, 1);
        assert_eq!(stats.active_conversations, 1);
        assert_eq!(stats.agent_sessions, 0);
    }

    #[tokio::test]
    async fn test_cache_path_under_state_dir() {
        let services = services();
        assert!(
            services
                .cache_path()
                .ends_with("agent-relay-services-test/response-cache.json")
        );
    }
}
