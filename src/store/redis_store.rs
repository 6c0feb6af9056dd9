//! Redis-backed [`Store`] shared by every service instance.
//!
//! - values: `SET key value PX ttl`
//! - locks: `SET key token NX PX ttl` with a fresh token per acquisition,
//!   released by a script that deletes the key only while it holds that token
//! - rate windows: one sorted set per key, scored by nanosecond timestamp and
//!   mutated only through a Lua script so prune, count and insert run as one
//!   atomic unit on the server

use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisError, Script};
use uuid::Uuid;

use super::{Store, StoreError, StoreFuture, WindowOutcome, window_start};

const SLIDING_WINDOW_SCRIPT: &str = r#"
local key = KEYS[1]
local now = ARGV[1]
local window_start = ARGV[2]
local limit = tonumber(ARGV[3])
local ttl_ms = tonumber(ARGV[4])
local member = ARGV[5]

redis.call('ZREMRANGEBYSCORE', key, '-inf', '(' .. window_start)
local count = redis.call('ZCARD', key)
local admitted = 0
if count < limit then
  redis.call('ZADD', key, now, member)
  redis.call('PEXPIRE', key, ttl_ms)
  count = count + 1
  admitted = 1
end

local oldest = redis.call('ZRANGE', key, 0, 0, 'WITHSCORES')
return {admitted, count, oldest[2] or ''}
"#;

const RELEASE_LOCK_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
"#;

#[derive(Debug, Clone)]
pub struct RedisStoreConfig {
    /// Prepended to every key this store touches.
    pub key_prefix: String,
}

impl Default for RedisStoreConfig {
    fn default() -> Self {
        Self {
            key_prefix: "admission:".to_string(),
        }
    }
}

#[derive(Clone)]
pub struct RedisStore {
    connection: MultiplexedConnection,
    config: RedisStoreConfig,
    window_script: Script,
    release_script: Script,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    pub async fn connect(url: &str, config: RedisStoreConfig) -> Result<Self, RedisError> {
        let client = Client::open(url)?;
        Self::from_client(&client, config).await
    }

    pub async fn from_client(client: &Client, config: RedisStoreConfig) -> Result<Self, RedisError> {
        let connection = client.get_multiplexed_async_connection().await?;
        Ok(Self {
            connection,
            config,
            window_script: Script::new(SLIDING_WINDOW_SCRIPT),
            release_script: Script::new(RELEASE_LOCK_SCRIPT),
        })
    }

    fn key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }
}

fn millis(ttl: Duration) -> u64 {
    // redis rejects a zero expiry
    (ttl.as_millis() as u64).max(1)
}

fn parse_score(raw: &str) -> Option<i64> {
    if raw.is_empty() {
        return None;
    }
    raw.parse::<f64>().ok().map(|score| score as i64)
}

impl RedisStore {
    async fn get_now(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let value: Option<String> = conn.get(self.key(key)).await?;
        Ok(value)
    }

    async fn set_now(&self, key: &str, value: String, ttl: Duration) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn.pset_ex(self.key(key), value, millis(ttl)).await?;
        Ok(())
    }

    async fn del_now(&self, key: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: () = conn.del(self.key(key)).await?;
        Ok(())
    }

    async fn acquire_now(&self, key: &str, ttl: Duration) -> Result<Option<String>, StoreError> {
        let mut conn = self.connection.clone();
        let token = Uuid::new_v4().to_string();
        let reply: Option<String> = redis::cmd("SET")
            .arg(self.key(key))
            .arg(&token)
            .arg("NX")
            .arg("PX")
            .arg(millis(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(reply.map(|_| token))
    }

    async fn release_now(&self, key: &str, token: &str) -> Result<(), StoreError> {
        let mut conn = self.connection.clone();
        let _: i64 = self
            .release_script
            .key(self.key(key))
            .arg(token)
            .invoke_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn record_now(
        &self,
        key: &str,
        now_ns: i64,
        window: Duration,
        limit: u64,
        ttl: Duration,
    ) -> Result<WindowOutcome, StoreError> {
        let mut conn = self.connection.clone();
        let member = format!("{}:{}", now_ns, Uuid::new_v4());
        let (admitted, count, oldest): (i64, u64, String) = self
            .window_script
            .key(self.key(key))
            .arg(now_ns)
            .arg(window_start(now_ns, window))
            .arg(limit)
            .arg(millis(ttl))
            .arg(member)
            .invoke_async(&mut conn)
            .await?;

        Ok(WindowOutcome {
            admitted: admitted == 1,
            count,
            oldest_ns: parse_score(&oldest),
        })
    }

    async fn count_now(&self, key: &str, now_ns: i64, window: Duration) -> Result<u64, StoreError> {
        let mut conn = self.connection.clone();
        let count: u64 = conn
            .zcount(self.key(key), window_start(now_ns, window), "+inf")
            .await?;
        Ok(count)
    }
}

impl Store for RedisStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(self.get_now(key))
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(self.set_now(key, value, ttl))
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.del_now(key))
    }

    fn acquire_lock<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, Option<String>> {
        Box::pin(self.acquire_now(key, ttl))
    }

    fn release_lock<'a>(&'a self, key: &'a str, token: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(self.release_now(key, token))
    }

    fn record_in_window<'a>(
        &'a self,
        key: &'a str,
        now_ns: i64,
        window: Duration,
        limit: u64,
        ttl: Duration,
    ) -> StoreFuture<'a, WindowOutcome> {
        Box::pin(self.record_now(key, now_ns, window, limit, ttl))
    }

    fn count_in_window<'a>(
        &'a self,
        key: &'a str,
        now_ns: i64,
        window: Duration,
    ) -> StoreFuture<'a, u64> {
        Box::pin(self.count_now(key, now_ns, window))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scores_parse_from_redis_float_format() {
        assert_eq!(parse_score(""), None);
        assert_eq!(parse_score("1500"), Some(1500));
        assert_eq!(parse_score("1.5e+3"), Some(1500));
    }

    #[test]
    fn zero_ttl_is_clamped_to_one_millisecond() {
        assert_eq!(millis(Duration::ZERO), 1);
        assert_eq!(millis(Duration::from_secs(2)), 2000);
    }
}
