//! Replay protection for webhook deliveries and dispatch requests.
//!
//! Entries live in Redis when `REDIS_URL` is configured and in process memory
//! otherwise. Redis failures fall back to the in-memory map for that call.
//!
//! A key is claimed with [`IdempotencyStore::reserve`] before any work starts,
//! then either completed with [`IdempotencyStore::put`] or given back with
//! [`IdempotencyStore::release`].

use redis::AsyncCommands;
use serde::{Serialize, de::DeserializeOwned};
use std::{
    collections::HashMap,
    env,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

/// Stored while the owner of a reservation is still working.
const PENDING: &str = "\"__pending__\"";

/// Upper bound on how long an unfinished reservation blocks its key.
const PENDING_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reservation<T> {
    /// The caller owns the key and must `put` or `release` it.
    Acquired,
    /// Another request holds the key and has not finished.
    InFlight,
    /// The key was already completed with this value.
    Completed(T),
}

#[derive(Clone)]
pub struct IdempotencyStore {
    redis: Option<redis::Client>,
    memory: Arc<Mutex<HashMap<String, (Instant, String)>>>,
    ttl: Duration,
}

impl IdempotencyStore {
    pub fn new(redis: Option<redis::Client>, ttl: Duration) -> Self {
        Self {
            redis,
            memory: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    pub fn from_env() -> Self {
        let redis = env::var("REDIS_URL")
            .ok()
            .filter(|url| !url.trim().is_empty())
            .and_then(|url| match redis::Client::open(url) {
                Ok(client) => Some(client),
                Err(err) => {
                    warn!(target = "oc.api", error = %err, "redis_client_invalid");
                    None
                }
            });
        let ttl = env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(86_400);
        Self::new(redis, Duration::from_secs(ttl))
    }

    fn pending_ttl(&self) -> Duration {
        self.ttl.min(PENDING_TTL)
    }

    /// Claim `key` atomically. Exactly one concurrent caller gets `Acquired`.
    pub async fn reserve<T: DeserializeOwned>(&self, key: &str) -> Reservation<T> {
        if let Some(client) = &self.redis
            && let Some(existing) = redis_reserve(client, key, self.pending_ttl()).await
        {
            return match existing {
                None => Reservation::Acquired,
                Some(raw) => classify(&raw),
            };
        }

        let mut guard = self.memory.lock().await;
        let now = Instant::now();
        if let Some((expires_at, raw)) = guard.get(key)
            && *expires_at > now
        {
            return classify(raw);
        }
        guard.insert(key.to_string(), (now + self.pending_ttl(), PENDING.to_string()));
        Reservation::Acquired
    }

    /// Store the final value for `key`, completing any reservation.
    pub async fn put<T: Serialize>(&self, key: &str, value: &T) {
        let Ok(raw) = serde_json::to_string(value) else {
            return;
        };
        if let Some(client) = &self.redis
            && redis_set(client, key, &raw, self.ttl).await
        {
            return;
        }
        self.memory
            .lock()
            .await
            .insert(key.to_string(), (Instant::now() + self.ttl, raw));
    }

    /// Give up a reservation so a later request can retry the work.
    pub async fn release(&self, key: &str) {
        if let Some(client) = &self.redis
            && let Ok(mut conn) = client.get_multiplexed_async_connection().await
        {
            let _: Result<(), _> = conn.del(key).await;
        }
        self.memory.lock().await.remove(key);
    }
}

fn classify<T: DeserializeOwned>(raw: &str) -> Reservation<T> {
    if raw == PENDING {
        return Reservation::InFlight;
    }
    match serde_json::from_str(raw) {
        Ok(value) => Reservation::Completed(value),
        Err(err) => {
            warn!(target = "oc.api", error = %err, "idempotency_entry_unreadable");
            Reservation::InFlight
        }
    }
}

/// `SET key PENDING NX EX ttl`. `Some(None)` when the key was claimed,
/// `Some(Some(existing))` when it was already set, `None` when Redis is
/// unreachable.
async fn redis_reserve(
    client: &redis::Client,
    key: &str,
    ttl: Duration,
) -> Option<Option<String>> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            warn!(target = "oc.api", error = %err, "redis_unavailable");
            return None;
        }
    };
    let claimed: Option<String> = redis::cmd("SET")
        .arg(key)
        .arg(PENDING)
        .arg("NX")
        .arg("EX")
        .arg(ttl.as_secs().max(1))
        .query_async(&mut conn)
        .await
        .ok()?;
    if claimed.is_some() {
        return Some(None);
    }
    let existing: Option<String> = conn.get(key).await.ok()?;
    // Expired between SET and GET; treat as in flight.
    Some(Some(existing.unwrap_or_else(|| PENDING.to_string())))
}

async fn redis_set(client: &redis::Client, key: &str, raw: &str, ttl: Duration) -> bool {
    let Ok(mut conn) = client.get_multiplexed_async_connection().await else {
        return false;
    };
    let result: Result<(), _> = conn.set_ex(key, raw, ttl.as_secs()).await;
    result.is_ok()
}
