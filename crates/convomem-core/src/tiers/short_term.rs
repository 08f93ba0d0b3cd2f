//! T3 - bounded per-(user, conversation) recency window, using
//! fine-grained per-partition locks: a lock per conversation rather
//! than one lock for the whole tier.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{EngineError, Result};
use crate::model::Message;

use super::ShortTermTier;

struct Partition {
    messages: Vec<Message>,
    last_touched: DateTime<Utc>,
}

impl Partition {
    fn new() -> Self {
        Self {
            messages: Vec::new(),
            last_touched: Utc::now(),
        }
    }

    fn touch(&mut self) {
        self.last_touched = Utc::now();
    }
}

fn check_cancelled(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        Err(EngineError::Cancelled)
    } else {
        Ok(())
    }
}

/// In-memory T3 adapter. Capacity `n` and partition `ttl` are fixed at
/// construction, matching the tier contract's default-10/24h window.
pub struct InMemoryShortTermWindow {
    capacity: usize,
    ttl: chrono::Duration,
    partitions: StdMutex<HashMap<(String, String), Arc<Mutex<Partition>>>>,
}

impl InMemoryShortTermWindow {
    pub fn new(capacity: usize, ttl: chrono::Duration) -> Self {
        Self {
            capacity,
            ttl,
            partitions: StdMutex::new(HashMap::new()),
        }
    }

    fn partition_handle(&self, user: &str, conversation: &str) -> Arc<Mutex<Partition>> {
        let mut map = self.partitions.lock().expect("partition map lock poisoned");
        map.entry((user.to_string(), conversation.to_string()))
            .or_insert_with(|| Arc::new(Mutex::new(Partition::new())))
            .clone()
    }

    /// Whether a partition's TTL has elapsed since its last touch -
    /// surfaced for a background reclaimer to sweep on.
    pub fn is_stale(&self, user: &str, conversation: &str, now: DateTime<Utc>) -> bool {
        let map = self.partitions.lock().expect("partition map lock poisoned");
        match map.get(&(user.to_string(), conversation.to_string())) {
            Some(handle) => {
                let Ok(partition) = handle.try_lock() else {
                    return false;
                };
                now - partition.last_touched > self.ttl
            }
            None => false,
        }
    }

    /// Drop partitions whose TTL has elapsed without access. Intended for
    /// a periodic background sweep, not the foreground path.
    pub fn reclaim_stale(&self, now: DateTime<Utc>) -> usize {
        let keys_to_remove: Vec<(String, String)> = {
            let map = self.partitions.lock().expect("partition map lock poisoned");
            map.iter()
                .filter_map(|(key, handle)| {
                    let partition = handle.try_lock().ok()?;
                    if now - partition.last_touched > self.ttl {
                        Some(key.clone())
                    } else {
                        None
                    }
                })
                .collect()
        };
        let mut map = self.partitions.lock().expect("partition map lock poisoned");
        for key in &keys_to_remove {
            map.remove(key);
        }
        keys_to_remove.len()
    }
}

#[async_trait]
impl ShortTermTier for InMemoryShortTermWindow {
    async fn add(&self, user: &str, conversation: &str, message: Message, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let handle = self.partition_handle(user, conversation);
        let mut partition = handle.lock().await;
        partition.messages.push(message);
        if partition.messages.len() > self.capacity {
            let evict_idx = partition
                .messages
                .iter()
                .enumerate()
                .min_by(|(_, a), (_, b)| {
                    a.metadata
                        .importance
                        .total_cmp(&b.metadata.importance)
                        .then_with(|| a.timestamp.cmp(&b.timestamp))
                })
                .map(|(idx, _)| idx)
                .expect("non-empty after push");
            partition.messages.remove(evict_idx);
        }
        partition.touch();
        Ok(())
    }

    async fn get_recent(
        &self,
        user: &str,
        conversation: &str,
        count: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Message>> {
        check_cancelled(cancel)?;
        let handle = self.partition_handle(user, conversation);
        let mut partition = handle.lock().await;
        partition.touch();
        let mut sorted = partition.messages.clone();
        sorted.sort_by_key(|m| m.timestamp);
        let start = sorted.len().saturating_sub(count);
        Ok(sorted[start..].to_vec())
    }

    async fn clear(&self, user: &str, conversation: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let handle = self.partition_handle(user, conversation);
        let mut partition = handle.lock().await;
        partition.messages.clear();
        Ok(())
    }

    async fn remove(&self, user: &str, conversation: &str, message_id: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let handle = self.partition_handle(user, conversation);
        let mut partition = handle.lock().await;
        partition.messages.retain(|m| m.id != message_id);
        Ok(())
    }

    async fn erase_user(&self, user: &str, cancel: &CancellationToken) -> Result<()> {
        check_cancelled(cancel)?;
        let mut map = self.partitions.lock().expect("partition map lock poisoned");
        map.retain(|(u, _), _| u != user);
        Ok(())
    }

    async fn partition_len(&self, user: &str, conversation: &str) -> usize {
        let handle = self.partition_handle(user, conversation);
        let partition = handle.lock().await;
        partition.messages.len()
    }
}
