//! Hierarchical, tenant-scoped cache keys.
//!
//! Keys render as
//! `{tenant_id}:{data_type}:[agent:{agent_id}:][conv:{conversation_id}:][coll:{collection_id}:]{resource_id}`.
//! The format is stable: other services build, parse and inspect it directly.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use super::ttl::TtlTier;
use super::{CacheError, CacheResult};

/// Tenant scope reserved for platform-wide entries.
pub const SYSTEM_TENANT: &str = "system";

const AGENT_MARKER: &str = "agent";
const CONVERSATION_MARKER: &str = "conv";
const COLLECTION_MARKER: &str = "coll";

/// Kind of cached resource. Determines the default expiration tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Document,
    Embedding,
    VectorStore,
    Collection,
    Conversation,
    Message,
    AgentConfig,
    QueryResult,
    LlmResponse,
    TenantConfig,
    /// Platform-wide data; the only type allowed under [`SYSTEM_TENANT`].
    System,
}

impl DataType {
    pub const ALL: [DataType; 11] = [
        Self::Document,
        Self::Embedding,
        Self::VectorStore,
        Self::Collection,
        Self::Conversation,
        Self::Message,
        Self::AgentConfig,
        Self::QueryResult,
        Self::LlmResponse,
        Self::TenantConfig,
        Self::System,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Embedding => "embedding",
            Self::VectorStore => "vector_store",
            Self::Collection => "collection",
            Self::Conversation => "conversation",
            Self::Message => "message",
            Self::AgentConfig => "agent_config",
            Self::QueryResult => "query_result",
            Self::LlmResponse => "llm_response",
            Self::TenantConfig => "tenant_config",
            Self::System => "system",
        }
    }

    pub fn default_tier(&self) -> TtlTier {
        match self {
            Self::Conversation | Self::Message | Self::QueryResult => TtlTier::Short,
            Self::Document
            | Self::Collection
            | Self::AgentConfig
            | Self::LlmResponse
            | Self::TenantConfig => TtlTier::Standard,
            Self::Embedding | Self::VectorStore => TtlTier::Extended,
            Self::System => TtlTier::Permanent,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DataType {
    type Err = CacheError;

    fn from_str(s: &str) -> CacheResult<Self> {
        Self::ALL
            .into_iter()
            .find(|dt| dt.as_str() == s)
            .ok_or_else(|| CacheError::invalid_key(format!("unknown data type '{}'", s)))
    }
}

/// Optional narrowing of a key below the tenant level.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheScope {
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
    pub collection_id: Option<String>,
}

impl CacheScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    pub fn conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn collection(mut self, collection_id: impl Into<String>) -> Self {
        self.collection_id = Some(collection_id.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.agent_id.is_none() && self.conversation_id.is_none() && self.collection_id.is_none()
    }

    /// This scope followed by progressively broader ones, ending at tenant level.
    ///
    /// The most specific component (rightmost in the rendered key) is dropped first.
    pub fn fallback_chain(&self) -> Vec<CacheScope> {
        let mut chain = vec![self.clone()];
        let mut current = self.clone();

        while !current.is_empty() {
            if current.collection_id.is_some() {
                current.collection_id = None;
            } else if current.conversation_id.is_some() {
                current.conversation_id = None;
            } else {
                current.agent_id = None;
            }
            chain.push(current.clone());
        }

        chain
    }

    fn validate(&self) -> CacheResult<()> {
        for (label, id) in [
            ("agent_id", &self.agent_id),
            ("conversation_id", &self.conversation_id),
            ("collection_id", &self.collection_id),
        ] {
            if let Some(id) = id {
                validate_segment(label, id)?;
            }
        }
        Ok(())
    }
}

/// Fully-qualified cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    tenant_id: String,
    data_type: DataType,
    scope: CacheScope,
    resource_id: String,
}

impl CacheKey {
    /// Build a tenant-level key.
    ///
    /// The tenant is mandatory; [`SYSTEM_TENANT`] is reserved for
    /// [`DataType::System`], which also accepts an empty tenant.
    pub fn new(
        data_type: DataType,
        resource_id: impl Into<String>,
        tenant_id: impl Into<String>,
    ) -> CacheResult<Self> {
        let resource_id = resource_id.into();
        let mut tenant_id = tenant_id.into();

        if data_type == DataType::System {
            if tenant_id.is_empty() {
                tenant_id = SYSTEM_TENANT.to_string();
            } else if tenant_id != SYSTEM_TENANT {
                return Err(CacheError::invalid_key(format!(
                    "system data must use the '{}' tenant scope, got '{}'",
                    SYSTEM_TENANT, tenant_id
                )));
            }
        } else if tenant_id == SYSTEM_TENANT {
            return Err(CacheError::invalid_key(format!(
                "tenant '{}' is reserved for system data, not {}",
                SYSTEM_TENANT, data_type
            )));
        }

        validate_segment("tenant_id", &tenant_id)?;
        if resource_id.trim().is_empty() {
            return Err(CacheError::invalid_key("resource_id must not be empty"));
        }
        // A leading `agent:x:` would be read back as scope by `parse`.
        if let Some(marker) = [AGENT_MARKER, CONVERSATION_MARKER, COLLECTION_MARKER]
            .into_iter()
            .find(|m| resource_id.strip_prefix(m).is_some_and(|r| r.starts_with(':')))
        {
            return Err(CacheError::invalid_key(format!(
                "resource_id must not start with the scope marker '{}:'",
                marker
            )));
        }

        Ok(Self {
            tenant_id,
            data_type,
            scope: CacheScope::default(),
            resource_id,
        })
    }

    /// Platform-wide key under the system tenant.
    pub fn system(resource_id: impl Into<String>) -> CacheResult<Self> {
        Self::new(DataType::System, resource_id, SYSTEM_TENANT)
    }

    pub fn with_scope(mut self, scope: CacheScope) -> CacheResult<Self> {
        scope.validate()?;
        self.scope = scope;
        Ok(self)
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn scope(&self) -> &CacheScope {
        &self.scope
    }

    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    /// Same resource under a different data type, keeping tenant and scope.
    pub fn sibling(&self, data_type: DataType, resource_id: impl Into<String>) -> CacheResult<Self> {
        Self::new(data_type, resource_id, self.tenant_id.clone())?.with_scope(self.scope.clone())
    }

    /// This key followed by less specific keys for the same resource.
    pub fn fallbacks(&self) -> Vec<CacheKey> {
        self.scope
            .fallback_chain()
            .into_iter()
            .map(|scope| CacheKey {
                tenant_id: self.tenant_id.clone(),
                data_type: self.data_type,
                scope,
                resource_id: self.resource_id.clone(),
            })
            .collect()
    }

    pub fn render(&self) -> String {
        let mut key = format!("{}:{}:", self.tenant_id, self.data_type);
        if let Some(ref agent) = self.scope.agent_id {
            key.push_str(&format!("{}:{}:", AGENT_MARKER, agent));
        }
        if let Some(ref conv) = self.scope.conversation_id {
            key.push_str(&format!("{}:{}:", CONVERSATION_MARKER, conv));
        }
        if let Some(ref coll) = self.scope.collection_id {
            key.push_str(&format!("{}:{}:", COLLECTION_MARKER, coll));
        }
        key.push_str(&self.resource_id);
        key
    }

    /// Parse a rendered key.
    ///
    /// Scope segments are consumed in order; everything after them is the
    /// resource id, which may itself contain `:`.
    pub fn parse(raw: &str) -> CacheResult<Self> {
        let mut parts = raw.splitn(3, ':');
        let (Some(tenant), Some(data_type), Some(mut rest)) = (parts.next(), parts.next(), parts.next())
        else {
            return Err(CacheError::invalid_key(format!("malformed key '{}'", raw)));
        };

        let mut scope = CacheScope::default();
        for (marker, slot) in [
            (AGENT_MARKER, &mut scope.agent_id),
            (CONVERSATION_MARKER, &mut scope.conversation_id),
            (COLLECTION_MARKER, &mut scope.collection_id),
        ] {
            if let Some(after) = rest.strip_prefix(marker).and_then(|r| r.strip_prefix(':'))
                && let Some((id, remainder)) = after.split_once(':')
            {
                *slot = Some(id.to_string());
                rest = remainder;
            }
        }

        Self::new(data_type.parse()?, rest, tenant)?.with_scope(scope)
    }

    /// Prefix matching every key of a tenant.
    pub fn tenant_prefix(tenant_id: &str) -> String {
        format!("{}:", tenant_id)
    }

    /// Prefix matching every key of one data type within a tenant.
    pub fn data_type_prefix(tenant_id: &str, data_type: DataType) -> String {
        format!("{}:{}:", tenant_id, data_type)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

/// Check a tenant id before it is used as a key prefix.
pub(crate) fn validate_tenant(tenant_id: &str) -> CacheResult<()> {
    validate_segment("tenant_id", tenant_id)
}

/// Check a store-level key prefix such as `prod:`.
pub(crate) fn validate_prefix(prefix: &str) -> CacheResult<()> {
    if prefix
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == ':')
    {
        Ok(())
    } else {
        Err(CacheError::invalid_key(format!(
            "Invalid key prefix '{}': only ASCII alphanumeric, '_', '-' and ':' allowed",
            prefix
        )))
    }
}

fn validate_segment(label: &str, value: &str) -> CacheResult<()> {
    if value.is_empty() {
        return Err(CacheError::invalid_key(format!("{} must not be empty", label)));
    }
    if value
        .chars()
        .any(|c| c == ':' || c.is_whitespace() || matches!(c, '*' | '?' | '[' | ']'))
    {
        return Err(CacheError::invalid_key(format!(
            "{} '{}' contains a reserved character",
            label, value
        )));
    }
    Ok(())
}
