use crate::models::EnhanceResponse;
use redis::AsyncCommands;
use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::Mutex;
use tracing::warn;

const PENDING: &str = "__pending__";

/// Replays the first response for a repeated `Idempotency-Key`, so a
/// double-submitted enhancement form does not start a second run. The key
/// is reserved before the workflow starts; a second submission while the
/// first is still running is told so instead of running again.
#[derive(Clone)]
pub enum IdempotencyStore {
    Redis {
        client: redis::Client,
        ttl_secs: u64,
    },
    Memory {
        entries: Arc<Mutex<HashMap<String, MemoryEntry>>>,
        ttl: Duration,
    },
}

#[derive(Clone)]
pub struct MemoryEntry {
    response: Option<EnhanceResponse>,
    expires_at: Instant,
}

/// Outcome of claiming a key. Backends settle it with `K = ()` and the
/// store wraps the claim in a [`PendingKey`].
pub enum Reservation<K = PendingKey> {
    Acquired(K),
    InFlight,
    Replay(EnhanceResponse),
}

impl IdempotencyStore {
    pub fn from_env() -> Self {
        let ttl_secs = std::env::var("IDEMPOTENCY_TTL_SECS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|v| *v > 0)
            .unwrap_or(3600);
        match std::env::var("REDIS_URL")
            .ok()
            .and_then(|url| redis::Client::open(url).ok())
        {
            Some(client) => Self::Redis { client, ttl_secs },
            None => Self::memory(Duration::from_secs(ttl_secs)),
        }
    }

    pub fn memory(ttl: Duration) -> Self {
        Self::Memory {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Claims `key` for this owner, or reports what already holds it.
    pub async fn reserve(&self, owner: &str, key: &str) -> Reservation {
        let scoped = scoped_key(owner, key);
        let claimed: Reservation<()> = match self {
            Self::Redis { client, ttl_secs } => {
                match redis_reserve(client, &scoped, *ttl_secs).await {
                    Ok(claimed) => claimed,
                    Err(err) => {
                        warn!(target = "artisan.api", error = %err, "idempotency_reserve_failed");
                        Reservation::Acquired(())
                    }
                }
            }
            Self::Memory { entries, ttl } => {
                let mut guard = entries.lock().await;
                let now = Instant::now();
                guard.retain(|_, entry| entry.expires_at > now);
                match guard.get(&scoped) {
                    Some(MemoryEntry {
                        response: Some(existing),
                        ..
                    }) => Reservation::Replay(existing.clone()),
                    Some(_) => Reservation::InFlight,
                    None => {
                        guard.insert(
                            scoped.clone(),
                            MemoryEntry {
                                response: None,
                                expires_at: now + *ttl,
                            },
                        );
                        Reservation::Acquired(())
                    }
                }
            }
        };
        match claimed {
            Reservation::Acquired(()) => Reservation::Acquired(PendingKey {
                store: self.clone(),
                scoped,
                armed: true,
            }),
            Reservation::InFlight => Reservation::InFlight,
            Reservation::Replay(existing) => Reservation::Replay(existing),
        }
    }

    async fn store(&self, scoped: &str, value: &EnhanceResponse) {
        match self {
            Self::Redis { client, ttl_secs } => {
                if let Ok(mut conn) = client.get_multiplexed_async_connection().await
                    && let Ok(json) = serde_json::to_string(value)
                {
                    let stored: Result<(), _> = conn.set_ex(scoped, json, *ttl_secs).await;
                    if let Err(err) = stored {
                        warn!(target = "artisan.api", error = %err, "idempotency_store_failed");
                    }
                }
            }
            Self::Memory { entries, ttl } => {
                entries.lock().await.insert(
                    scoped.to_string(),
                    MemoryEntry {
                        response: Some(value.clone()),
                        expires_at: Instant::now() + *ttl,
                    },
                );
            }
        }
    }

    async fn release(&self, scoped: &str) {
        match self {
            Self::Redis { client, .. } => {
                if let Ok(mut conn) = client.get_multiplexed_async_connection().await {
                    let _: Result<(), _> = conn.del(scoped).await;
                }
            }
            Self::Memory { entries, .. } => {
                let mut guard = entries.lock().await;
                if guard.get(scoped).is_some_and(|entry| entry.response.is_none()) {
                    guard.remove(scoped);
                }
            }
        }
    }
}

async fn redis_reserve(
    client: &redis::Client,
    scoped: &str,
    ttl_secs: u64,
) -> redis::RedisResult<Reservation<()>> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let set: Option<String> = redis::cmd("SET")
        .arg(scoped)
        .arg(PENDING)
        .arg("NX")
        .arg("EX")
        .arg(ttl_secs)
        .query_async(&mut conn)
        .await?;
    if set.is_some() {
        return Ok(Reservation::Acquired(()));
    }
    let raw: Option<String> = conn.get(scoped).await?;
    Ok(match raw.as_deref() {
        None => Reservation::Acquired(()),
        Some(PENDING) => Reservation::InFlight,
        Some(json) => serde_json::from_str(json)
            .map(Reservation::Replay)
            .unwrap_or(Reservation::InFlight),
    })
}

/// A claimed key. `complete` stores the response for replay; dropping it
/// without completing (failed run, panic) frees the key again.
pub struct PendingKey {
    store: IdempotencyStore,
    scoped: String,
    armed: bool,
}

impl PendingKey {
    pub async fn complete(mut self, value: &EnhanceResponse) {
        self.armed = false;
        self.store.store(&self.scoped, value).await;
    }
}

impl Drop for PendingKey {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let store = self.store.clone();
        let scoped = std::mem::take(&mut self.scoped);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move { store.release(&scoped).await });
        }
    }
}

fn scoped_key(owner: &str, key: &str) -> String {
    format!("artisan:idem:{owner}:{key}")
}
