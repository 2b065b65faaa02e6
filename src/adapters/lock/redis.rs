//! Redis implementation of the lock manager.
//!
//! Acquisition is `SET key token NX PX ttl` with a fresh UUID token per
//! attempt. Renewal and release run as Lua scripts so the token comparison
//! and the expiry/delete are atomic; a holder whose lease already lapsed
//! can neither extend nor delete a lock that has moved to another owner.

use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::Script;
use std::time::Duration;
use uuid::Uuid;

use crate::ports::{LockError, LockGuard, LockManager};

// Extends the lease only while the caller still owns the lock.
const RENEW_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("PEXPIRE", KEYS[1], ARGV[2])
    else
        return 0
    end
"#;

// Compare-and-delete: only the current owner's token releases the lock.
const RELEASE_SCRIPT: &str = r#"
    if redis.call("GET", KEYS[1]) == ARGV[1] then
        return redis.call("DEL", KEYS[1])
    else
        return 0
    end
"#;

/// Redis-backed distributed lock with lease auto-renewal.
#[derive(Clone)]
pub struct RedisLockManager {
    conn: MultiplexedConnection,
    key_prefix: String,
    acquire_retries: u32,
    retry_backoff: Duration,
}

impl RedisLockManager {
    /// Connects and namespaces all lock keys under `key_prefix`.
    pub async fn connect(client: redis::Client, key_prefix: &str) -> Result<Self, LockError> {
        let conn = client
            .get_multiplexed_tokio_connection()
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;
        Ok(Self {
            conn,
            key_prefix: key_prefix.to_string(),
            acquire_retries: 3,
            retry_backoff: Duration::from_millis(150),
        })
    }

    /// Additional acquisition attempts after the first before giving up.
    pub fn with_acquire_retries(mut self, retries: u32) -> Self {
        self.acquire_retries = retries;
        self
    }

    /// Fixed delay between acquisition attempts.
    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.key_prefix, key)
    }

    async fn try_acquire(&self, key: &str, token: &str, ttl: Duration) -> Result<bool, LockError> {
        let mut conn = self.conn.clone();

        // SET NX PX in one round trip; OK means we took the lock, nil means
        // another owner holds it.
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(token)
            .arg("NX")
            .arg("PX")
            .arg(ttl.as_millis() as u64)
            .query_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        Ok(reply.is_some())
    }

    fn spawn_renewal(&self, key: String, token: String, ttl: Duration) -> tokio::task::JoinHandle<()> {
        let conn = self.conn.clone();
        // Renewing at two-thirds of the TTL leaves one missed renewal of
        // headroom before the lease lapses.
        let interval = ttl * 2 / 3;

        tokio::spawn(async move {
            let script = Script::new(RENEW_SCRIPT);
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // first tick fires immediately

            loop {
                ticker.tick().await;

                let mut conn = conn.clone();
                let renewed: Result<i64, _> = script
                    .key(&key)
                    .arg(&token)
                    .arg(ttl.as_millis() as u64)
                    .invoke_async(&mut conn)
                    .await;

                match renewed {
                    Ok(1) => {}
                    Ok(_) => {
                        // Lease expired or was taken over; renewing further
                        // would extend someone else's lock.
                        tracing::warn!(key, "lock lease lost; stopping renewal");
                        return;
                    }
                    Err(e) => {
                        tracing::warn!(key, error = %e, "lock renewal attempt failed");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl LockManager for RedisLockManager {
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockGuard, LockError> {
        let namespaced = self.namespaced(key);
        let token = Uuid::new_v4().to_string();

        for attempt in 0..=self.acquire_retries {
            if self.try_acquire(&namespaced, &token, ttl).await? {
                let renewal = self.spawn_renewal(namespaced.clone(), token.clone(), ttl);
                return Ok(LockGuard::new(namespaced, token).with_renewal(renewal));
            }

            if attempt < self.acquire_retries {
                tokio::time::sleep(self.retry_backoff).await;
            }
        }

        Err(LockError::Held { key: namespaced })
    }

    async fn release(&self, mut guard: LockGuard) -> Result<(), LockError> {
        guard.stop_renewal();

        let mut conn = self.conn.clone();
        let deleted: i64 = Script::new(RELEASE_SCRIPT)
            .key(guard.key())
            .arg(guard.token())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LockError::Backend(e.to_string()))?;

        if deleted == 0 {
            return Err(LockError::NotHeld {
                key: guard.key().to_string(),
            });
        }
        Ok(())
    }
}

// Acquisition, renewal, and release semantics are covered by the in-memory
// lock manager's behavioral tests; exercising them against a live Redis
// requires REDIS_URL and is done separately from unit tests.
