//! Per-driver poll result cache.
//!
//! While a session is active the latest `PollStatus` is cached for a short
//! TTL so repeated client polls do not hit the telemetry provider. The trait
//! lets a multi-instance deployment back it with a shared store.

use std::time::Duration;

use async_trait::async_trait;
use cached::{Cached, TimedSizedCache};
use tokio::sync::Mutex;

use crate::PollStatus;

#[async_trait]
pub trait PollCache: Send + Sync {
    async fn get(&self, driver_id: &str) -> Option<PollStatus>;
    async fn set(&self, driver_id: &str, status: PollStatus);
    async fn expire(&self, driver_id: &str);
}

/// In-process cache bounded to `capacity` drivers, least recently used
/// evicted first.
///
/// The TTL has one-second resolution; a zero TTL disables caching.
pub struct MemoryPollCache {
    entries: Mutex<TimedSizedCache<String, PollStatus>>,
}

impl MemoryPollCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(TimedSizedCache::with_size_and_lifespan(
                capacity.max(1),
                ttl.as_secs(),
            )),
        }
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.cache_size()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[async_trait]
impl PollCache for MemoryPollCache {
    async fn get(&self, driver_id: &str) -> Option<PollStatus> {
        self.entries.lock().await.cache_get(driver_id).cloned()
    }

    async fn set(&self, driver_id: &str, status: PollStatus) {
        self.entries
            .lock()
            .await
            .cache_set(driver_id.to_string(), status);
    }

    async fn expire(&self, driver_id: &str) {
        self.entries.lock().await.cache_remove(driver_id);
    }
}
