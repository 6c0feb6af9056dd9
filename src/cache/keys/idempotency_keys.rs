use std::fmt;

use axum::http::Method;
use sha2::{Digest, Sha256};

/// Idempotency cache key prefix
const IDEMPOTENCY_PREFIX: &str = "idempotency:";

/// Lock key prefix
const LOCK_PREFIX: &str = "lock:";

/// Identifies one logical operation: token, method, path and, when enabled,
/// a digest of the request body.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Key of the per-operation execution lock.
    pub fn lock_key(&self) -> String {
        format!("{}{}", LOCK_PREFIX, self.0)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone)]
pub struct CacheKeyBuilder {
    hash_body: bool,
    hash_body_methods: Vec<Method>,
}

impl Default for CacheKeyBuilder {
    fn default() -> Self {
        Self {
            hash_body: false,
            hash_body_methods: vec![Method::POST, Method::PUT, Method::PATCH],
        }
    }
}

impl CacheKeyBuilder {
    pub fn new(hash_body: bool, hash_body_methods: Vec<Method>) -> Self {
        Self {
            hash_body,
            hash_body_methods,
        }
    }

    /// Whether the body takes part in the key for this method.
    pub fn hashes_body(&self, method: &Method) -> bool {
        self.hash_body && self.hash_body_methods.contains(method)
    }

    pub fn build(&self, token: &str, method: &Method, path: &str, body: Option<&[u8]>) -> CacheKey {
        let mut hasher = Sha256::new();
        // length-prefixed so ("a", "b/c") and ("a/b", "c") cannot collide
        for part in [token.as_bytes(), method.as_str().as_bytes(), path.as_bytes()] {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part);
        }

        if self.hashes_body(method) {
            let digest = body_hash(body.unwrap_or_default());
            hasher.update(digest.as_bytes());
        }

        CacheKey(format!("{}{:x}", IDEMPOTENCY_PREFIX, hasher.finalize()))
    }
}

/// Hex SHA-256 of a request body.
pub fn body_hash(body: &[u8]) -> String {
    format!("{:x}", Sha256::digest(body))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_components_give_same_key() {
        let builder = CacheKeyBuilder::default();
        let a = builder.build("tok", &Method::POST, "/payments", None);
        let b = builder.build("tok", &Method::POST, "/payments", None);

        assert_eq!(a, b);
        assert!(a.as_str().starts_with("idempotency:"));
        assert_eq!(a.lock_key(), format!("lock:{}", a));
    }

    #[test]
    fn method_path_and_token_all_take_part() {
        let builder = CacheKeyBuilder::default();
        let base = builder.build("tok", &Method::POST, "/payments", None);

        assert_ne!(base, builder.build("tok2", &Method::POST, "/payments", None));
        assert_ne!(base, builder.build("tok", &Method::PUT, "/payments", None));
        assert_ne!(base, builder.build("tok", &Method::POST, "/refunds", None));
    }

    #[test]
    fn component_boundaries_are_unambiguous() {
        let builder = CacheKeyBuilder::default();
        assert_ne!(
            builder.build("a", &Method::POST, "b/c", None),
            builder.build("a/b", &Method::POST, "c", None)
        );
    }

    #[test]
    fn body_only_counts_when_enabled_for_the_method() {
        let off = CacheKeyBuilder::default();
        assert_eq!(
            off.build("tok", &Method::POST, "/p", Some(b"one")),
            off.build("tok", &Method::POST, "/p", Some(b"two"))
        );

        let on = CacheKeyBuilder::new(true, vec![Method::POST]);
        assert_ne!(
            on.build("tok", &Method::POST, "/p", Some(b"one")),
            on.build("tok", &Method::POST, "/p", Some(b"two"))
        );
        // GET is not a hashing method
        assert_eq!(
            on.build("tok", &Method::GET, "/p", Some(b"one")),
            on.build("tok", &Method::GET, "/p", Some(b"two"))
        );
    }

    #[test]
    fn body_hash_is_hex_sha256() {
        assert_eq!(
            body_hash(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
