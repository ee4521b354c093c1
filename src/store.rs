//! External state the gateway depends on: the credential store and the
//! quota counter store. Both live in Redis in production.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, IntoConnectionInfo};
use tracing::info;

/// Credential records live at `user:<identity>`, field `pwd`
pub const USER_KEY_PREFIX: &str = "user:";
pub const PASSWORD_FIELD: &str = "pwd";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store did not answer within {0:?}")]
    Timeout(Duration),

    #[cfg(test)]
    #[error("store unavailable")]
    Unavailable,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Read-only view of identity → salted password hash
#[async_trait]
pub trait CredentialStore: Send + Sync {
    /// `Ok(None)` when the identity has no record
    async fn password_hash(&self, identity: &str) -> StoreResult<Option<String>>;
}

/// Shared byte ledger with atomic increment and expiry
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically add `n` and return the new total
    async fn incr_by(&self, key: &str, n: u64) -> StoreResult<u64>;

    /// Let `key` lapse after `ttl`
    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()>;
}

/// Redis-backed implementation of both stores
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisStore {
    /// Connect and verify the server answers `PING`
    pub async fn connect(
        addr: &str,
        password: Option<String>,
        db: i64,
        timeout: Duration,
    ) -> StoreResult<Self> {
        let mut info = format!("redis://{}/{}", addr, db).into_connection_info()?;
        info.redis.password = password;

        let client = redis::Client::open(info)?;
        let conn = with_timeout(timeout, client.get_connection_manager()).await?;
        let store = Self { conn, timeout };
        store.ping().await?;
        info!("Connected to redis at {} (db {})", addr, db);
        Ok(store)
    }

    pub async fn ping(&self) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let _: String =
            with_timeout(self.timeout, redis::cmd("PING").query_async(&mut conn)).await?;
        Ok(())
    }
}

async fn with_timeout<T, F>(timeout: Duration, fut: F) -> StoreResult<T>
where
    F: std::future::Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(res) => res.map_err(StoreError::from),
        Err(_) => Err(StoreError::Timeout(timeout)),
    }
}

#[async_trait]
impl CredentialStore for RedisStore {
    async fn password_hash(&self, identity: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let key = format!("{}{}", USER_KEY_PREFIX, identity);
        with_timeout(self.timeout, conn.hget(key, PASSWORD_FIELD)).await
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn incr_by(&self, key: &str, n: u64) -> StoreResult<u64> {
        let mut conn = self.conn.clone();
        with_timeout(self.timeout, conn.incr(key, n)).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let millis = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX).max(1);
        let _: bool = with_timeout(self.timeout, conn.pexpire(key, millis)).await?;
        Ok(())
    }
}

#[cfg(test)]
pub mod memory {
    //! In-process stand-in for Redis used by the tests.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    use async_trait::async_trait;

    use super::{CounterStore, CredentialStore, StoreError, StoreResult};

    /// Cheapest cost bcrypt accepts, to keep tests fast
    pub const TEST_BCRYPT_COST: u32 = 4;

    #[derive(Debug, Default)]
    struct Counter {
        value: u64,
        expires_at: Option<Instant>,
    }

    #[derive(Debug, Default)]
    pub struct MemoryStore {
        users: Mutex<HashMap<String, String>>,
        counters: Mutex<HashMap<String, Counter>>,
        unavailable: AtomicBool,
        incr_calls: AtomicUsize,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn insert_user(&self, identity: &str, password: &str) {
            let hash = bcrypt::hash(password, TEST_BCRYPT_COST).expect("bcrypt hash");
            self.insert_hash(identity, &hash);
        }

        pub fn insert_hash(&self, identity: &str, hash: &str) {
            self.users
                .lock()
                .unwrap()
                .insert(identity.to_string(), hash.to_string());
        }

        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// Current value, honoring expiry the way Redis does lazily
        pub fn counter(&self, key: &str) -> u64 {
            let mut counters = self.counters.lock().unwrap();
            Self::live(&mut counters, key).map(|c| c.value).unwrap_or(0)
        }

        pub fn ttl(&self, key: &str) -> Option<Duration> {
            let mut counters = self.counters.lock().unwrap();
            Self::live(&mut counters, key)
                .and_then(|c| c.expires_at)
                .map(|at| at.saturating_duration_since(Instant::now()))
        }

        pub fn incr_calls(&self) -> usize {
            self.incr_calls.load(Ordering::SeqCst)
        }

        fn live<'a>(
            counters: &'a mut HashMap<String, Counter>,
            key: &str,
        ) -> Option<&'a mut Counter> {
            let expired = counters
                .get(key)
                .and_then(|c| c.expires_at)
                .is_some_and(|at| Instant::now() >= at);
            if expired {
                counters.remove(key);
            }
            counters.get_mut(key)
        }

        fn check(&self) -> StoreResult<()> {
            if self.unavailable.load(Ordering::SeqCst) {
                Err(StoreError::Unavailable)
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl CredentialStore for MemoryStore {
        async fn password_hash(&self, identity: &str) -> StoreResult<Option<String>> {
            self.check()?;
            Ok(self.users.lock().unwrap().get(identity).cloned())
        }
    }

    #[async_trait]
    impl CounterStore for MemoryStore {
        async fn incr_by(&self, key: &str, n: u64) -> StoreResult<u64> {
            self.check()?;
            self.incr_calls.fetch_add(1, Ordering::SeqCst);
            let mut counters = self.counters.lock().unwrap();
            if Self::live(&mut counters, key).is_none() {
                counters.insert(key.to_string(), Counter::default());
            }
            let counter = counters.get_mut(key).expect("counter just inserted");
            counter.value += n;
            Ok(counter.value)
        }

        async fn expire(&self, key: &str, ttl: Duration) -> StoreResult<()> {
            self.check()?;
            let mut counters = self.counters.lock().unwrap();
            if let Some(counter) = Self::live(&mut counters, key) {
                counter.expires_at = Some(Instant::now() + ttl);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_memory_counter_expires() {
        let store = MemoryStore::new();
        assert_eq!(store.incr_by("bw:x", 5).await.unwrap(), 5);
        store.expire("bw:x", Duration::from_millis(20)).await.unwrap();
        assert!(store.ttl("bw:x").is_some());

        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.counter("bw:x"), 0);
        assert_eq!(store.incr_by("bw:x", 1).await.unwrap(), 1);
        assert!(store.ttl("bw:x").is_none());
    }
}
