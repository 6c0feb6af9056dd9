//! In-process [`Store`] for single-instance deployments and tests.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry as LockEntry;
use parking_lot::RwLock;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::{Store, StoreFuture, WindowOutcome, window_start};

#[derive(Debug, Clone)]
struct ValueEntry {
    value: String,
    expires_at: Instant,
}

#[derive(Debug, Clone)]
struct HeldLock {
    token: String,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct RateWindow {
    stamps: BTreeSet<i64>,
    expires_at: Option<Instant>,
}

impl RateWindow {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn prune(&mut self, start: i64) {
        self.stamps = self.stamps.split_off(&start);
    }

    fn live_count(&self, start: i64) -> u64 {
        self.stamps.range(start..).count() as u64
    }
}

/// Values sit behind a read/write lock, held locks in a concurrent map whose
/// entry API is the insert-if-absent primitive, and each rate window behind
/// its own shard lock.
#[derive(Debug, Clone, Default)]
pub struct LocalStore {
    values: Arc<RwLock<HashMap<String, ValueEntry>>>,
    locks: Arc<DashMap<String, HeldLock>>,
    windows: Arc<DashMap<String, RateWindow>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drops every expired value, lock and idle rate window.
    /// Returns how many entries were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        {
            let mut values = self.values.write();
            let before = values.len();
            values.retain(|_, entry| entry.expires_at > now);
            removed += before - values.len();
        }

        let before = self.locks.len();
        self.locks.retain(|_, held| held.expires_at > now);
        removed += before - self.locks.len();

        let before = self.windows.len();
        self.windows.retain(|_, window| !window.is_expired(now));
        removed += before - self.windows.len();

        removed
    }

    /// Spawns the periodic cleanup task. Correctness never depends on it,
    /// reads already skip expired entries; it only bounds memory.
    pub fn start_sweeper(&self, every: Duration) -> SweeperHandle {
        let store = self.clone();
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            // the first tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = store.purge_expired();
                        if removed > 0 {
                            tracing::debug!(removed, "local store sweep");
                        }
                    }
                    _ = &mut shutdown_rx => break,
                }
            }
            tracing::debug!("local store sweeper stopped");
        });

        SweeperHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }

    fn get_now(&self, key: &str) -> Option<String> {
        let now = Instant::now();
        self.values
            .read()
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.value.clone())
    }

    fn acquire_now(&self, key: &str, ttl: Duration) -> Option<String> {
        let now = Instant::now();
        let fresh = HeldLock {
            token: Uuid::new_v4().to_string(),
            expires_at: now + ttl,
        };
        match self.locks.entry(key.to_string()) {
            LockEntry::Occupied(mut held) => {
                if held.get().expires_at <= now {
                    // previous holder never released; its ttl has run out
                    let token = fresh.token.clone();
                    held.insert(fresh);
                    Some(token)
                } else {
                    None
                }
            }
            LockEntry::Vacant(free) => {
                let token = fresh.token.clone();
                free.insert(fresh);
                Some(token)
            }
        }
    }

    fn record_now(
        &self,
        key: &str,
        now_ns: i64,
        window: Duration,
        limit: u64,
        ttl: Duration,
    ) -> WindowOutcome {
        let now = Instant::now();
        let start = window_start(now_ns, window);
        let mut entry = self.windows.entry(key.to_string()).or_default();

        if entry.is_expired(now) {
            entry.stamps.clear();
        }
        entry.prune(start);

        let count = entry.stamps.len() as u64;
        if count >= limit {
            return WindowOutcome {
                admitted: false,
                count,
                oldest_ns: entry.stamps.first().copied(),
            };
        }

        let mut stamp = now_ns;
        while !entry.stamps.insert(stamp) {
            stamp += 1;
        }
        entry.expires_at = Some(now + ttl);

        WindowOutcome {
            admitted: true,
            count: count + 1,
            oldest_ns: entry.stamps.first().copied(),
        }
    }

    fn count_now(&self, key: &str, now_ns: i64, window: Duration) -> u64 {
        let now = Instant::now();
        match self.windows.get(key) {
            Some(entry) if !entry.is_expired(now) => {
                entry.live_count(window_start(now_ns, window))
            }
            _ => 0,
        }
    }
}

impl Store for LocalStore {
    fn get<'a>(&'a self, key: &'a str) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.get_now(key)) })
    }

    fn set<'a>(&'a self, key: &'a str, value: String, ttl: Duration) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let entry = ValueEntry {
                value,
                expires_at: Instant::now() + ttl,
            };
            self.values.write().insert(key.to_string(), entry);
            Ok(())
        })
    }

    fn delete<'a>(&'a self, key: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.values.write().remove(key);
            self.windows.remove(key);
            Ok(())
        })
    }

    fn acquire_lock<'a>(&'a self, key: &'a str, ttl: Duration) -> StoreFuture<'a, Option<String>> {
        Box::pin(async move { Ok(self.acquire_now(key, ttl)) })
    }

    fn release_lock<'a>(&'a self, key: &'a str, token: &'a str) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.locks.remove_if(key, |_, held| held.token == token);
            Ok(())
        })
    }

    fn record_in_window<'a>(
        &'a self,
        key: &'a str,
        now_ns: i64,
        window: Duration,
        limit: u64,
        ttl: Duration,
    ) -> StoreFuture<'a, WindowOutcome> {
        Box::pin(async move { Ok(self.record_now(key, now_ns, window, limit, ttl)) })
    }

    fn count_in_window<'a>(
        &'a self,
        key: &'a str,
        now_ns: i64,
        window: Duration,
    ) -> StoreFuture<'a, u64> {
        Box::pin(async move { Ok(self.count_now(key, now_ns, window)) })
    }
}

/// Owns the sweeper task. Stopping or dropping it ends the task.
#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                tracing::warn!("local store sweeper ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: i64 = 1_000_000;

    #[tokio::test]
    async fn values_expire_lazily_on_read() {
        let store = LocalStore::new();
        store
            .set("k", "v".into(), Duration::from_millis(30))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn lock_is_exclusive_until_released() {
        let store = LocalStore::new();
        let ttl = Duration::from_secs(10);

        let a = store.acquire_lock("lock:a", ttl).await.unwrap().unwrap();
        assert!(store.acquire_lock("lock:a", ttl).await.unwrap().is_none());
        assert!(store.acquire_lock("lock:b", ttl).await.unwrap().is_some());

        store.release_lock("lock:a", &a).await.unwrap();
        assert!(store.acquire_lock("lock:a", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn stale_holder_cannot_release_the_next_holders_lock() {
        let store = LocalStore::new();

        let first = store
            .acquire_lock("lock:k", Duration::from_millis(30))
            .await
            .unwrap()
            .unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;

        let second = store
            .acquire_lock("lock:k", Duration::from_secs(30))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(first, second);

        // the first holder finishes late and releases with its own token
        store.release_lock("lock:k", &first).await.unwrap();
        assert!(
            store
                .acquire_lock("lock:k", Duration::from_secs(30))
                .await
                .unwrap()
                .is_none()
        );

        store.release_lock("lock:k", &second).await.unwrap();
        assert!(
            store
                .acquire_lock("lock:k", Duration::from_secs(30))
                .await
                .unwrap()
                .is_some()
        );
    }

    #[tokio::test]
    async fn abandoned_lock_is_reclaimed_after_ttl() {
        let store = LocalStore::new();
        let ttl = Duration::from_millis(40);

        assert!(store.acquire_lock("lock:crashed", ttl).await.unwrap().is_some());
        assert!(store.acquire_lock("lock:crashed", ttl).await.unwrap().is_none());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(store.acquire_lock("lock:crashed", ttl).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn concurrent_lock_attempts_have_one_winner() {
        let store = LocalStore::new();
        let mut tasks = Vec::new();
        for _ in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .acquire_lock("lock:race", Duration::from_secs(5))
                    .await
                    .unwrap()
                    .is_some()
            }));
        }

        let mut winners = 0;
        for task in tasks {
            if task.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn window_rejects_at_limit_without_recording() {
        let store = LocalStore::new();
        let window = Duration::from_millis(100);
        let ttl = Duration::from_secs(1);

        for i in 0..3 {
            let outcome = store
                .record_in_window("w", i * MS, window, 3, ttl)
                .await
                .unwrap();
            assert!(outcome.admitted);
            assert_eq!(outcome.count, i as u64 + 1);
        }

        let rejected = store
            .record_in_window("w", 3 * MS, window, 3, ttl)
            .await
            .unwrap();
        assert!(!rejected.admitted);
        assert_eq!(rejected.count, 3);
        assert_eq!(rejected.oldest_ns, Some(0));
        assert_eq!(store.count_in_window("w", 3 * MS, window).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn window_frees_capacity_one_entry_at_a_time() {
        let store = LocalStore::new();
        let window = Duration::from_millis(100);
        let ttl = Duration::from_secs(1);

        store.record_in_window("w", 0, window, 2, ttl).await.unwrap();
        store.record_in_window("w", 50 * MS, window, 2, ttl).await.unwrap();

        // the first entry has aged out, the second has not
        assert_eq!(store.count_in_window("w", 120 * MS, window).await.unwrap(), 1);
        let outcome = store
            .record_in_window("w", 120 * MS, window, 2, ttl)
            .await
            .unwrap();
        assert!(outcome.admitted);
        assert_eq!(outcome.oldest_ns, Some(50 * MS));
    }

    #[tokio::test]
    async fn identical_timestamps_are_kept_distinct() {
        let store = LocalStore::new();
        let window = Duration::from_secs(1);
        let ttl = Duration::from_secs(2);

        for _ in 0..5 {
            store.record_in_window("w", 1_000, window, 10, ttl).await.unwrap();
        }
        assert_eq!(store.count_in_window("w", 1_000, window).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn concurrent_window_updates_never_exceed_limit() {
        let store = LocalStore::new();
        let mut tasks = Vec::new();
        for i in 0..64 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store
                    .record_in_window("w", i, Duration::from_secs(60), 10, Duration::from_secs(61))
                    .await
                    .unwrap()
                    .admitted
            }));
        }

        let mut admitted = 0;
        for task in tasks {
            if task.await.unwrap() {
                admitted += 1;
            }
        }
        assert_eq!(admitted, 10);
    }

    #[tokio::test]
    async fn delete_clears_values_and_windows() {
        let store = LocalStore::new();
        store.set("k", "v".into(), Duration::from_secs(5)).await.unwrap();
        store
            .record_in_window("k", 0, Duration::from_secs(5), 5, Duration::from_secs(6))
            .await
            .unwrap();

        store.delete("k").await.unwrap();
        assert_eq!(store.get("k").await.unwrap(), None);
        assert_eq!(store.count_in_window("k", 0, Duration::from_secs(5)).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn sweeper_purges_expired_entries() {
        let store = LocalStore::new();
        store.set("short", "v".into(), Duration::from_millis(10)).await.unwrap();
        store.set("long", "v".into(), Duration::from_secs(60)).await.unwrap();
        store
            .acquire_lock("lock:short", Duration::from_millis(10))
            .await
            .unwrap();

        let sweeper = store.start_sweeper(Duration::from_millis(20));
        tokio::time::sleep(Duration::from_millis(70)).await;
        sweeper.stop().await;

        assert_eq!(store.values.read().len(), 1);
        assert!(store.locks.is_empty());
    }
}
