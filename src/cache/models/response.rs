use axum::{
    body::{Body, Bytes},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::Response,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A captured response, replayed verbatim for repeated idempotency keys
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CachedResponse {
    pub status_code: u16,
    /// Header multimap in original order, duplicates kept
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl CachedResponse {
    pub fn capture(
        status: StatusCode,
        headers: &HeaderMap,
        body: &[u8],
        created_at: DateTime<Utc>,
        ttl: std::time::Duration,
    ) -> Self {
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        Self {
            status_code: status.as_u16(),
            headers: headers
                .iter()
                .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
                .collect(),
            body: body.to_vec(),
            created_at,
            expires_at: created_at.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    pub fn header_map(&self) -> HeaderMap {
        let mut map = HeaderMap::with_capacity(self.headers.len());
        for (name, value) in &self.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                (Ok(name), Ok(value)) => {
                    map.append(name, value);
                }
                _ => tracing::warn!("Dropping unparsable cached header: {}", name),
            }
        }
        map
    }

    /// Rebuilds an HTTP response with the captured status, headers and body.
    pub fn to_response(&self) -> Response {
        let mut response = Response::new(Body::from(Bytes::from(self.body.clone())));
        *response.status_mut() =
            StatusCode::from_u16(self.status_code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        *response.headers_mut() = self.header_map();
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use std::time::Duration;

    fn sample() -> CachedResponse {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/json"));
        headers.append("set-cookie", HeaderValue::from_static("a=1"));
        headers.append("set-cookie", HeaderValue::from_static("b=2"));

        CachedResponse::capture(
            StatusCode::CREATED,
            &headers,
            br#"{"id":"p-1"}"#,
            Utc::now(),
            Duration::from_secs(60),
        )
    }

    #[tokio::test]
    async fn rebuilt_response_matches_capture() {
        let cached = sample();
        let response = cached.to_response();

        assert_eq!(response.status(), StatusCode::CREATED);
        let cookies: Vec<_> = response.headers().get_all("set-cookie").iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(response.headers()["content-type"], "application/json");

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&body[..], br#"{"id":"p-1"}"#);
    }

    #[test]
    fn survives_json_storage() {
        let cached = sample();
        let json = serde_json::to_string(&cached).unwrap();
        let restored: CachedResponse = serde_json::from_str(&json).unwrap();

        assert_eq!(restored, cached);
        assert!(restored.is_success());
    }

    #[test]
    fn expiry_follows_ttl() {
        let cached = sample();
        assert!(!cached.is_expired(cached.created_at));
        assert!(cached.is_expired(cached.created_at + chrono::Duration::seconds(60)));
    }
}
