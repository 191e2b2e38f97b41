//! Deduplication store for processed messages
//!
//! Records identifiers of messages that were successfully forwarded so that
//! redeliveries within the TTL window are suppressed. Entries expire
//! automatically; the store tolerates concurrent reads and writes.

use crate::config::{PROCESSED_CACHE_MAX_CAPACITY, PROCESSED_MESSAGE_TTL_SECS};
use async_trait::async_trait;
use moka::future::Cache;
use std::time::Duration;

/// Interface for the processed-message store
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DedupStore: Send + Sync {
    /// Whether the message identifier was already processed within the TTL
    async fn is_processed(&self, message_id: i64) -> bool;
    /// Record a message identifier as processed, starting its TTL
    async fn mark_processed(&self, message_id: i64);
}

/// In-process TTL cache of processed message identifiers.
///
/// The expiry window is fixed at construction; the 24-hour default comes from
/// [`PROCESSED_MESSAGE_TTL_SECS`].
#[derive(Clone)]
pub struct ProcessedCache {
    cache: Cache<i64, ()>,
}

impl ProcessedCache {
    /// Creates a cache with the given entry TTL and capacity bound
    #[must_use]
    pub fn new(ttl_secs: u64, max_capacity: u64) -> Self {
        let cache = Cache::builder()
            .max_capacity(max_capacity)
            .time_to_live(Duration::from_secs(ttl_secs))
            .build();

        Self { cache }
    }

    /// Returns the current number of tracked identifiers.
    ///
    /// Useful for monitoring and health checks.
    #[must_use]
    pub fn entry_count(&self) -> u64 {
        self.cache.entry_count()
    }
}

impl Default for ProcessedCache {
    fn default() -> Self {
        Self::new(PROCESSED_MESSAGE_TTL_SECS, PROCESSED_CACHE_MAX_CAPACITY)
    }
}

#[async_trait]
impl DedupStore for ProcessedCache {
    async fn is_processed(&self, message_id: i64) -> bool {
        self.cache.get(&message_id).await.is_some()
    }

    async fn mark_processed(&self, message_id: i64) {
        self.cache.insert(message_id, ()).await;
    }
}
