use std::env;
use std::str::FromStr;
use std::time::Duration;

use axum::http::Method;

use crate::idempotency::IdempotencyConfig;
use crate::rate_limit::RateLimiterConfig;
use crate::store::FailurePolicy;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {name} is required")]
    Missing { name: &'static str },
    #[error("environment variable {name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Memory,
    Redis,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub store_backend: StoreBackend,
    pub redis_url: Option<String>,
    pub redis_key_prefix: String,
    pub server_host: String,
    pub server_port: u16,
    pub store_timeout_ms: u64,
    pub sweep_interval_secs: u64,
    pub rate_limit_requests: u64,
    pub rate_limit_window_secs: u64,
    pub rate_limit_per_identity: bool,
    pub rate_limit_identity_requests: Option<u64>,
    pub rate_limit_fail_closed: bool,
    pub idempotency_ttl_secs: u64,
    pub idempotency_lock_ttl_secs: u64,
    pub idempotency_wait_ms: u64,
    pub idempotency_hash_body: bool,
    /// `None` keeps the coordinator's default of POST, PUT and PATCH.
    pub idempotency_hash_body_methods: Option<Vec<Method>>,
    pub idempotency_methods: Option<Vec<Method>>,
    pub idempotency_fail_open: bool,
    pub jwt_secret: Option<String>,
    /// Enables the admin endpoints, which require it as a bearer token.
    pub admin_token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            redis_url: None,
            redis_key_prefix: "admission:".to_string(),
            server_host: "0.0.0.0".to_string(),
            server_port: 3000,
            store_timeout_ms: 500,
            sweep_interval_secs: 3600,
            rate_limit_requests: 100,
            rate_limit_window_secs: 60,
            rate_limit_per_identity: false,
            rate_limit_identity_requests: None,
            rate_limit_fail_closed: false,
            idempotency_ttl_secs: 24 * 3600,
            idempotency_lock_ttl_secs: 30,
            idempotency_wait_ms: 100,
            idempotency_hash_body: false,
            idempotency_hash_body_methods: None,
            idempotency_methods: None,
            idempotency_fail_open: false,
            jwt_secret: None,
            admin_token: None,
        }
    }
}

fn var(name: &'static str) -> Option<String> {
    env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn parse<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match var(name) {
        Some(value) => value
            .trim()
            .trim_end_matches('s')
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value }),
        None => Ok(default),
    }
}

fn parse_positive(name: &'static str, default: u64) -> Result<u64, ConfigError> {
    let value = parse(name, default)?;
    if value == 0 {
        return Err(ConfigError::Invalid {
            name,
            value: "0".to_string(),
        });
    }
    Ok(value)
}

fn parse_bool(name: &'static str, default: bool) -> Result<bool, ConfigError> {
    match var(name) {
        Some(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid { name, value }),
        },
        None => Ok(default),
    }
}

fn parse_methods(name: &'static str) -> Result<Option<Vec<Method>>, ConfigError> {
    let Some(value) = var(name) else {
        return Ok(None);
    };
    value
        .split(',')
        .map(str::trim)
        .filter(|m| !m.is_empty())
        .map(|m| {
            Method::from_bytes(m.to_ascii_uppercase().as_bytes()).map_err(|_| {
                ConfigError::Invalid {
                    name,
                    value: value.clone(),
                }
            })
        })
        .collect::<Result<Vec<_>, _>>()
        .map(Some)
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();
        let defaults = Config::default();

        let store_backend = match var("STORE_BACKEND").as_deref().map(str::trim) {
            None | Some("memory") => StoreBackend::Memory,
            Some("redis") => StoreBackend::Redis,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    name: "STORE_BACKEND",
                    value: other.to_string(),
                });
            }
        };
        let redis_url = var("REDIS_URL");
        if store_backend == StoreBackend::Redis && redis_url.is_none() {
            return Err(ConfigError::Missing { name: "REDIS_URL" });
        }

        let rate_limit_identity_requests = match var("RATE_LIMIT_IDENTITY_REQUESTS") {
            Some(value) => Some(value.trim().parse().map_err(|_| ConfigError::Invalid {
                name: "RATE_LIMIT_IDENTITY_REQUESTS",
                value,
            })?),
            None => None,
        };

        Ok(Config {
            store_backend,
            redis_url,
            redis_key_prefix: var("REDIS_KEY_PREFIX").unwrap_or(defaults.redis_key_prefix),
            server_host: var("SERVER_HOST").unwrap_or(defaults.server_host),
            server_port: parse("SERVER_PORT", defaults.server_port)?,
            store_timeout_ms: parse("STORE_TIMEOUT_MS", defaults.store_timeout_ms)?,
            sweep_interval_secs: parse_positive("SWEEP_INTERVAL", defaults.sweep_interval_secs)?,
            rate_limit_requests: parse("RATE_LIMIT_REQUESTS", defaults.rate_limit_requests)?,
            rate_limit_window_secs: parse("RATE_LIMIT_WINDOW", defaults.rate_limit_window_secs)?,
            rate_limit_per_identity: parse_bool(
                "RATE_LIMIT_PER_IDENTITY",
                defaults.rate_limit_per_identity,
            )?,
            rate_limit_identity_requests,
            rate_limit_fail_closed: parse_bool(
                "RATE_LIMIT_FAIL_CLOSED",
                defaults.rate_limit_fail_closed,
            )?,
            idempotency_ttl_secs: parse("IDEMPOTENCY_TTL", defaults.idempotency_ttl_secs)?,
            idempotency_lock_ttl_secs: parse(
                "IDEMPOTENCY_LOCK_TTL",
                defaults.idempotency_lock_ttl_secs,
            )?,
            idempotency_wait_ms: parse("IDEMPOTENCY_WAIT_MS", defaults.idempotency_wait_ms)?,
            idempotency_hash_body: parse_bool(
                "IDEMPOTENCY_HASH_BODY",
                defaults.idempotency_hash_body,
            )?,
            idempotency_hash_body_methods: parse_methods("IDEMPOTENCY_HASH_BODY_METHODS")?,
            idempotency_methods: parse_methods("IDEMPOTENCY_METHODS")?,
            idempotency_fail_open: parse_bool(
                "IDEMPOTENCY_FAIL_OPEN",
                defaults.idempotency_fail_open,
            )?,
            jwt_secret: var("JWT_SECRET"),
            admin_token: var("ADMIN_TOKEN"),
        })
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.rate_limit_window_secs)
    }

    pub fn rate_limiter_config(&self) -> RateLimiterConfig {
        RateLimiterConfig {
            limit: self.rate_limit_requests,
            window: self.rate_limit_window(),
            per_identity_override: self.rate_limit_identity_requests,
            store_timeout: self.store_timeout(),
            failure_policy: if self.rate_limit_fail_closed {
                FailurePolicy::Closed
            } else {
                FailurePolicy::Open
            },
            ..RateLimiterConfig::default()
        }
    }

    pub fn idempotency_config(&self) -> IdempotencyConfig {
        let defaults = IdempotencyConfig::default();
        IdempotencyConfig {
            cache_ttl: Duration::from_secs(self.idempotency_ttl_secs),
            lock_ttl: Duration::from_secs(self.idempotency_lock_ttl_secs),
            contention_wait: Duration::from_millis(self.idempotency_wait_ms),
            hash_body: self.idempotency_hash_body,
            hash_body_methods: self
                .idempotency_hash_body_methods
                .clone()
                .unwrap_or(defaults.hash_body_methods),
            methods: self.idempotency_methods.clone(),
            store_timeout: self.store_timeout(),
            failure_policy: if self.idempotency_fail_open {
                FailurePolicy::Open
            } else {
                FailurePolicy::Closed
            },
            max_body_bytes: defaults.max_body_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pick_safe_failure_policies() {
        let config = Config::default();

        assert_eq!(config.idempotency_config().failure_policy, FailurePolicy::Closed);
        assert_eq!(config.rate_limiter_config().failure_policy, FailurePolicy::Open);
        assert_eq!(config.rate_limiter_config().window, Duration::from_secs(60));
        assert_eq!(config.idempotency_config().cache_ttl, Duration::from_secs(86400));
    }

    #[test]
    fn identity_override_flows_into_limiter_config() {
        let config = Config {
            rate_limit_identity_requests: Some(7),
            ..Config::default()
        };
        assert_eq!(config.rate_limiter_config().per_identity_override, Some(7));
    }

    #[test]
    fn hashed_methods_default_and_override() {
        let config = Config::default();
        assert_eq!(
            config.idempotency_config().hash_body_methods,
            vec![Method::POST, Method::PUT, Method::PATCH]
        );

        let config = Config {
            idempotency_hash_body_methods: Some(vec![Method::POST]),
            ..Config::default()
        };
        assert_eq!(config.idempotency_config().hash_body_methods, vec![Method::POST]);
    }

    #[test]
    fn zero_interval_is_rejected() {
        // names unique to this test; nothing else reads them
        unsafe {
            std::env::set_var("ADMISSION_TEST_ZERO_INTERVAL", "0");
            std::env::set_var("ADMISSION_TEST_SOME_INTERVAL", "30s");
            std::env::set_var("ADMISSION_TEST_HASH_METHODS", "post, put");
        }

        assert!(matches!(
            parse_positive("ADMISSION_TEST_ZERO_INTERVAL", 3600),
            Err(ConfigError::Invalid { .. })
        ));
        assert_eq!(parse_positive("ADMISSION_TEST_SOME_INTERVAL", 3600).unwrap(), 30);
        assert_eq!(
            parse_methods("ADMISSION_TEST_HASH_METHODS").unwrap(),
            Some(vec![Method::POST, Method::PUT])
        );
    }
}
