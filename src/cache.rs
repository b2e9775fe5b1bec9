//! TTL cache for aggregation snapshots.
//!
//! Two interchangeable backends: a shared redis instance (preferred,
//! behind the `redis-cache` feature) and an in-process map with a
//! periodic expiry sweep. Reachability of the external backend is checked
//! once at construction, never per request. Values are opaque serialized
//! blobs; callers own (de)serialization. Cache failures are logged and
//! degrade to misses, never surfaced to handlers.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{info, warn};

use crate::config::Config;

pub enum Cache {
    Memory(MemoryCache),
    #[cfg(feature = "redis-cache")]
    Redis(RedisCache),
}

impl Cache {
    /// Pick a backend: redis when configured and reachable, else memory.
    pub async fn connect(config: &Config) -> Cache {
        #[cfg(feature = "redis-cache")]
        if let Some(url) = &config.redis_url {
            match RedisCache::connect(url).await {
                Ok(cache) => {
                    info!(target: "cache", "using shared redis cache backend");
                    return Cache::Redis(cache);
                }
                Err(err) => {
                    warn!(
                        target: "cache",
                        error = %err,
                        "redis backend unreachable at startup; falling back to memory"
                    );
                }
            }
        }
        #[cfg(not(feature = "redis-cache"))]
        if config.redis_url.is_some() {
            warn!(
                target: "cache",
                "redis url configured but the redis-cache feature is disabled; using memory"
            );
        }
        let _ = config;
        Cache::Memory(MemoryCache::new())
    }

    pub async fn get(&self, key: &str) -> Option<Vec<u8>> {
        match self {
            Cache::Memory(memory) => memory.get(key),
            #[cfg(feature = "redis-cache")]
            Cache::Redis(redis) => redis.get(key).await,
        }
    }

    pub async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        match self {
            Cache::Memory(memory) => memory.set(key, value, ttl),
            #[cfg(feature = "redis-cache")]
            Cache::Redis(redis) => redis.set(key, value, ttl).await,
        }
    }

    pub async fn delete(&self, key: &str) {
        match self {
            Cache::Memory(memory) => memory.delete(key),
            #[cfg(feature = "redis-cache")]
            Cache::Redis(redis) => redis.delete(key).await,
        }
    }

    /// Drop every key under a namespace prefix.
    pub async fn invalidate(&self, prefix: &str) {
        match self {
            Cache::Memory(memory) => memory.invalidate(prefix),
            #[cfg(feature = "redis-cache")]
            Cache::Redis(redis) => redis.invalidate(prefix).await,
        }
    }

    /// Periodic expiry sweep; a no-op handle for backends that expire
    /// server-side.
    pub fn spawn_sweep(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> tokio::task::JoinHandle<()> {
        let cache = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Cache::Memory(memory) = cache.as_ref() {
                            memory.sweep();
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }
}

struct Entry {
    expires: Instant,
    value: Vec<u8>,
}

/// In-process fallback backend. Reads share the lock; writes and the
/// sweep take it exclusively.
pub struct MemoryCache {
    entries: RwLock<HashMap<String, Entry>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let map = self.entries.read().unwrap_or_else(|e| e.into_inner());
        map.get(key)
            .filter(|entry| entry.expires > Instant::now())
            .map(|entry| entry.value.clone())
    }

    pub fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        map.insert(
            key.to_string(),
            Entry {
                expires: Instant::now() + ttl,
                value,
            },
        );
    }

    pub fn delete(&self, key: &str) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        map.remove(key);
    }

    pub fn invalidate(&self, prefix: &str) {
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        map.retain(|key, _| !key.starts_with(prefix));
    }

    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut map = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = map.len();
        map.retain(|_, entry| entry.expires > now);
        before - map.len()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "redis-cache")]
pub struct RedisCache {
    conn: redis::aio::MultiplexedConnection,
}

#[cfg(feature = "redis-cache")]
impl RedisCache {
    async fn connect(url: &str) -> Result<Self, redis::RedisError> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(
            Duration::from_secs(3),
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| {
            redis::RedisError::from((redis::ErrorKind::IoError, "connect timed out"))
        })??;
        Ok(Self { conn })
    }

    async fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut conn = self.conn.clone();
        match redis::cmd("GET").arg(key).query_async(&mut conn).await {
            Ok(value) => value,
            Err(err) => {
                warn!(target: "cache", error = %err, "redis get failed");
                None
            }
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) {
        let mut conn = self.conn.clone();
        let result: Result<(), _> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async(&mut conn)
            .await;
        if let Err(err) = result {
            warn!(target: "cache", error = %err, "redis set failed");
        }
    }

    async fn delete(&self, key: &str) {
        let mut conn = self.conn.clone();
        let result: Result<(), _> = redis::cmd("DEL").arg(key).query_async(&mut conn).await;
        if let Err(err) = result {
            warn!(target: "cache", error = %err, "redis del failed");
        }
    }

    async fn invalidate(&self, prefix: &str) {
        let mut conn = self.conn.clone();
        let pattern = format!("{prefix}*");
        let mut cursor: u64 = 0;
        loop {
            let reply: Result<(u64, Vec<String>), _> = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(100)
                .query_async(&mut conn)
                .await;
            let (next, keys) = match reply {
                Ok(reply) => reply,
                Err(err) => {
                    warn!(target: "cache", error = %err, "redis scan failed");
                    return;
                }
            };
            if !keys.is_empty() {
                let result: Result<(), _> =
                    redis::cmd("DEL").arg(&keys).query_async(&mut conn).await;
                if let Err(err) = result {
                    warn!(target: "cache", error = %err, "redis del failed");
                }
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }
    }
}
