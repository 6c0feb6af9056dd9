//! Optional caller identity used to scope rate limits per subject.
//!
//! Resolving an identity here never rejects a request: an absent or invalid
//! credential just means the caller is limited by network address.

use axum::http::{HeaderMap, header};
use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use serde::Deserialize;

pub trait IdentityResolver: Send + Sync {
    fn resolve(&self, headers: &HeaderMap) -> Option<String>;
}

/// Treats every caller as anonymous.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIdentity;

impl IdentityResolver for NoIdentity {
    fn resolve(&self, _headers: &HeaderMap) -> Option<String> {
        None
    }
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: String,
}

/// Reads the `sub` claim of an HS256 bearer token.
#[derive(Clone)]
pub struct JwtIdentityResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityResolver {
    pub fn new(secret: &str) -> Self {
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation: Validation::new(Algorithm::HS256),
        }
    }
}

impl IdentityResolver for JwtIdentityResolver {
    fn resolve(&self, headers: &HeaderMap) -> Option<String> {
        let token = headers
            .get(header::AUTHORIZATION)
            .and_then(|h| h.to_str().ok())
            .and_then(|h| h.strip_prefix("Bearer "))?;

        match decode::<Claims>(token.trim(), &self.key, &self.validation) {
            Ok(data) if !data.claims.sub.is_empty() => Some(data.claims.sub),
            Ok(_) => None,
            Err(e) => {
                tracing::debug!("ignoring unverifiable bearer token: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;
    use jsonwebtoken::{EncodingKey, Header, encode};
    use serde::Serialize;

    #[derive(Serialize)]
    struct TestClaims<'a> {
        sub: &'a str,
        exp: i64,
    }

    fn bearer(secret: &str, sub: &str) -> HeaderMap {
        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = encode(
            &Header::default(),
            &TestClaims { sub, exp },
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let mut headers = HeaderMap::new();
        headers.insert(
            header::AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token)).unwrap(),
        );
        headers
    }

    #[test]
    fn valid_token_yields_subject() {
        let resolver = JwtIdentityResolver::new("secret");
        assert_eq!(resolver.resolve(&bearer("secret", "user-7")).as_deref(), Some("user-7"));
    }

    #[test]
    fn wrong_secret_or_missing_header_is_anonymous() {
        let resolver = JwtIdentityResolver::new("secret");
        assert_eq!(resolver.resolve(&bearer("other", "user-7")), None);
        assert_eq!(resolver.resolve(&HeaderMap::new()), None);
        assert_eq!(NoIdentity.resolve(&bearer("secret", "user-7")), None);
    }
}
