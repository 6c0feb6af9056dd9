/// Rate limit key prefix
const RATE_LIMIT_PREFIX: &str = "rate_limit:";

/// Namespace of the default limiter.
pub fn default_namespace() -> String {
    RATE_LIMIT_PREFIX.to_string()
}

/// Namespace of an endpoint-scoped limiter; never shares keys with the default one.
pub fn endpoint_namespace(endpoint: &str) -> String {
    format!("{}endpoint:{}:", RATE_LIMIT_PREFIX, endpoint)
}

/// Window key for a client network address.
pub fn address_key(namespace: &str, addr: &str) -> String {
    format!("{}ip:{}", namespace, addr)
}

/// Window key for an authenticated subject.
pub fn identity_key(namespace: &str, subject: &str) -> String {
    format!("{}user:{}", namespace, subject)
}
