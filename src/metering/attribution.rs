//! Billing attribution for agent-mediated usage.
//!
//! When a tenant runs an agent owned by another tenant, the owner pays.
//! Lookups fail open: any doubt bills the acting tenant.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::MeteringResult;
use super::types::Metadata;
use crate::cache::{CacheKey, CacheManager, Ttl, TtlTier};

/// Source of truth for agent ownership.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Tenant owning `agent_id`, or `None` if the agent is unknown.
    async fn agent_owner(&self, agent_id: &str) -> MeteringResult<Option<String>>;
}

#[derive(Debug, Default, Clone)]
pub struct InMemoryAgentDirectory {
    owners: Arc<DashMap<String, String>>,
}

impl InMemoryAgentDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, agent_id: impl Into<String>, owner_tenant_id: impl Into<String>) {
        self.owners.insert(agent_id.into(), owner_tenant_id.into());
    }

    pub fn remove(&self, agent_id: &str) -> bool {
        self.owners.remove(agent_id).is_some()
    }
}

#[async_trait]
impl AgentDirectory for InMemoryAgentDirectory {
    async fn agent_owner(&self, agent_id: &str) -> MeteringResult<Option<String>> {
        Ok(self.owners.get(agent_id).map(|o| o.value().clone()))
    }
}

/// Recorded alongside usage that was billed to someone other than the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributionMetadata {
    pub requester_tenant_id: String,
    pub owner_tenant_id: String,
    pub agent_id: String,
}

impl AttributionMetadata {
    pub fn to_metadata(&self) -> Metadata {
        let mut map = Metadata::new();
        map.insert("requester_tenant_id".into(), self.requester_tenant_id.clone().into());
        map.insert("owner_tenant_id".into(), self.owner_tenant_id.clone().into());
        map.insert("agent_id".into(), self.agent_id.clone().into());
        map
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribution {
    pub billing_tenant_id: String,
    pub metadata: Option<AttributionMetadata>,
}

impl Attribution {
    fn acting(tenant_id: &str) -> Self {
        Self {
            billing_tenant_id: tenant_id.to_string(),
            metadata: None,
        }
    }

    pub fn is_cross_tenant(&self) -> bool {
        self.metadata.is_some()
    }
}

pub struct AttributionResolver {
    directory: Arc<dyn AgentDirectory>,
    cache: Option<Arc<CacheManager>>,
    owner_ttl: Ttl,
}

impl AttributionResolver {
    pub fn new(directory: Arc<dyn AgentDirectory>) -> Self {
        Self {
            directory,
            cache: None,
            owner_ttl: TtlTier::Standard.into(),
        }
    }

    /// Cache owner lookups under the system tenant.
    pub fn with_cache(mut self, cache: Arc<CacheManager>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn owner_ttl(mut self, ttl: impl Into<Ttl>) -> Self {
        self.owner_ttl = ttl.into();
        self
    }

    /// Resolve who pays for usage by `acting_tenant_id` through `agent_id`.
    pub async fn resolve_billing_tenant(
        &self,
        acting_tenant_id: &str,
        agent_id: Option<&str>,
    ) -> Attribution {
        let Some(agent_id) = agent_id.filter(|a| !a.is_empty()) else {
            return Attribution::acting(acting_tenant_id);
        };

        let owner = match self.lookup_owner(agent_id).await {
            Ok(Some(owner)) => owner,
            Ok(None) => {
                debug!(agent_id, tenant_id = acting_tenant_id, "Unknown agent, billing acting tenant");
                return Attribution::acting(acting_tenant_id);
            }
            Err(e) => {
                warn!(
                    agent_id,
                    tenant_id = acting_tenant_id,
                    error = %e,
                    "Agent owner lookup failed, billing acting tenant"
                );
                return Attribution::acting(acting_tenant_id);
            }
        };

        if owner == acting_tenant_id {
            return Attribution::acting(acting_tenant_id);
        }

        debug!(
            agent_id,
            requester_tenant_id = acting_tenant_id,
            owner_tenant_id = %owner,
            "Attributing usage to agent owner"
        );
        Attribution {
            billing_tenant_id: owner.clone(),
            metadata: Some(AttributionMetadata {
                requester_tenant_id: acting_tenant_id.to_string(),
                owner_tenant_id: owner,
                agent_id: agent_id.to_string(),
            }),
        }
    }

    async fn lookup_owner(&self, agent_id: &str) -> MeteringResult<Option<String>> {
        let cache_key = self.cache.as_ref().and_then(|_| owner_cache_key(agent_id));

        if let (Some(cache), Some(key)) = (&self.cache, &cache_key)
            && let Some(owner) = cache.get_json::<String>(key).await
        {
            return Ok(Some(owner));
        }

        let owner = self.directory.agent_owner(agent_id).await?;

        if let (Some(cache), Some(key), Some(owner)) = (&self.cache, &cache_key, &owner)
            && let Err(e) = cache.set_json(key, owner, Some(self.owner_ttl)).await
        {
            debug!(agent_id, error = %e, "Failed to cache agent owner");
        }

        Ok(owner)
    }
}

fn owner_cache_key(agent_id: &str) -> Option<CacheKey> {
    CacheKey::system(format!("agent-owner/{}", agent_id)).ok()
}
