//! Idempotency key construction.

use std::fmt;

use sha2::{Digest, Sha256};

use super::types::Operation;

const HASH_HEX_LEN: usize = 16;

/// Builds keys of the form `{tenant}:{model}:{scope}:{operation}:{content-hash}`.
///
/// The hash is the first 16 hex characters of the SHA-256 of the content, so
/// the same request content always maps to the same key.
///
/// ```
/// use cachemeter::metering::{IdempotencyKey, Operation};
///
/// let key = IdempotencyKey::new("t1", "text-embedding-3-small", "coll1", Operation::VectorSearch)
///     .content(b"what is our refund policy?");
/// assert!(key.to_string().starts_with("t1:text-embedding-3-small:coll1:vector_search:"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdempotencyKey {
    tenant_id: String,
    model: String,
    scope: String,
    operation: Operation,
    content_hash: Option<String>,
}

impl IdempotencyKey {
    pub fn new(
        tenant_id: impl Into<String>,
        model: impl Into<String>,
        scope: impl Into<String>,
        operation: Operation,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            model: model.into(),
            scope: scope.into(),
            operation,
            content_hash: None,
        }
    }

    pub fn content(mut self, content: &[u8]) -> Self {
        self.content_hash = Some(content_hash(content));
        self
    }

    pub fn render(&self) -> String {
        let mut key = format!(
            "{}:{}:{}:{}",
            self.tenant_id, self.model, self.scope, self.operation
        );
        if let Some(ref hash) = self.content_hash {
            key.push(':');
            key.push_str(hash);
        }
        key
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

impl From<IdempotencyKey> for String {
    fn from(key: IdempotencyKey) -> Self {
        key.render()
    }
}

fn content_hash(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    let mut encoded = hex::encode(hasher.finalize());
    encoded.truncate(HASH_HEX_LEN);
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_is_deterministic() {
        let a = IdempotencyKey::new("t1", "gpt-4o", "conv-9", Operation::Chat).content(b"hello");
        let b = IdempotencyKey::new("t1", "gpt-4o", "conv-9", Operation::Chat).content(b"hello");
        let c = IdempotencyKey::new("t1", "gpt-4o", "conv-9", Operation::Chat).content(b"hello!");

        assert_eq!(a.render(), b.render());
        assert_ne!(a.render(), c.render());
    }

    #[test]
    fn test_key_layout() {
        let key = IdempotencyKey::new("t1", "gpt-4o", "conv-9", Operation::Summarize).content(b"");
        // sha256("") = e3b0c442...
        assert_eq!(key.render(), "t1:gpt-4o:conv-9:summarize:e3b0c44298fc1c14");

        let bare = IdempotencyKey::new("t1", "gpt-4o", "conv-9", Operation::Query);
        assert_eq!(String::from(bare), "t1:gpt-4o:conv-9:query");
    }
}
