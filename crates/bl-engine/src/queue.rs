//! Per-campaign message queue
//!
//! A view over the store's message rows: hands out pending items in
//! ascending queue order (optionally shuffled), with the actual
//! pending→processing reservation done by the store's compare-and-set so an
//! item is never assigned twice concurrently.

use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::debug;

use bl_common::{BlastMessage, QueueStats};
use bl_store::CampaignStore;

use crate::Result;

/// How far ahead of `limit` the queue looks when shuffling, so the pick is
/// random over a real slice of the backlog rather than just the head.
const SHUFFLE_HORIZON: u32 = 64;

/// Requeued items land at a random position within this share of the
/// remaining queue, breaking perfect ordering.
const SKIP_WINDOW: (f64, f64) = (0.15, 0.20);

pub struct CampaignQueue {
    store: Arc<dyn CampaignStore>,
    campaign_id: String,
    shuffle: bool,
    rng: Mutex<StdRng>,
}

impl CampaignQueue {
    pub fn new(store: Arc<dyn CampaignStore>, campaign_id: impl Into<String>, shuffle: bool, seed: Option<u64>) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_os_rng(),
        };
        Self {
            store,
            campaign_id: campaign_id.into(),
            shuffle,
            rng: Mutex::new(rng),
        }
    }

    /// Reserve up to `limit` pending messages. Each returned message has
    /// been atomically moved to `processing`; an item lost to a concurrent
    /// reservation is simply skipped.
    pub async fn next_batch(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<BlastMessage>> {
        let horizon = if self.shuffle { limit.max(SHUFFLE_HORIZON) } else { limit };
        let mut candidates = self.store.list_pending(&self.campaign_id, now, horizon).await?;

        if self.shuffle {
            let mut rng = self.rng.lock();
            candidates.shuffle(&mut *rng);
        }

        let mut batch = Vec::with_capacity(limit as usize);
        for mut msg in candidates {
            if batch.len() == limit as usize {
                break;
            }
            if self.store.reserve(&self.campaign_id, msg.index).await? {
                msg.status = bl_common::MessageStatus::Processing;
                batch.push(msg);
            }
        }
        Ok(batch)
    }

    /// Move a processing message back to pending with a bumped attempt,
    /// reinserted at a random position inside the skip window and
    /// optionally held back until `now + backoff`.
    pub async fn requeue(
        &self,
        msg: &BlastMessage,
        now: DateTime<Utc>,
        backoff: Option<Duration>,
        reason: &str,
    ) -> Result<()> {
        let stats = self.store.message_stats(&self.campaign_id).await?;
        let new_sort_key = self.pick_reinsertion_key(msg, stats.pending).await?;
        let scheduled_at = backoff.and_then(|d| chrono::Duration::from_std(d).ok()).map(|d| now + d);

        debug!(
            campaign_id = %self.campaign_id,
            index = msg.index,
            sort_key = new_sort_key,
            reason = %reason,
            "Requeueing message"
        );

        self.store
            .requeue(&self.campaign_id, msg.index, new_sort_key, scheduled_at, Some(reason))
            .await?;
        Ok(())
    }

    async fn pick_reinsertion_key(&self, msg: &BlastMessage, pending: u64) -> Result<i64> {
        let skip = {
            let mut rng = self.rng.lock();
            let share = rng.random_range(SKIP_WINDOW.0..=SKIP_WINDOW.1);
            (pending as f64 * share) as u64
        };
        if skip == 0 {
            return Ok(msg.sort_key);
        }
        let anchor = self
            .store
            .nth_pending_sort_key(&self.campaign_id, skip - 1)
            .await?
            .unwrap_or(msg.sort_key);
        let jitter = {
            let mut rng = self.rng.lock();
            rng.random_range(1..BlastMessage::SORT_KEY_STRIDE)
        };
        Ok(anchor + jitter)
    }

    /// failed→pending for everything with attempts left.
    pub async fn reset_failed(&self) -> Result<u64> {
        Ok(self.store.reset_failed(&self.campaign_id).await?)
    }

    pub async fn stats(&self) -> Result<QueueStats> {
        Ok(self.store.message_stats(&self.campaign_id).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bl_common::{Campaign, CampaignConfig, Contact, MessageStatus};
    use bl_store::MemoryStore;

    async fn seed(total: u32) -> (Arc<MemoryStore>, Campaign) {
        let store = Arc::new(MemoryStore::new());
        let campaign = Campaign::new("u1", "s1", "q", "Hi", total, CampaignConfig::default());
        store.insert_campaign(&campaign).await.unwrap();
        let messages: Vec<BlastMessage> = (0..total)
            .map(|i| BlastMessage::new(&campaign.id, i, Contact::new(format!("62811{i}")), 3))
            .collect();
        store.insert_messages(&messages).await.unwrap();
        (store, campaign)
    }

    #[tokio::test]
    async fn unshuffled_batches_follow_index_order() {
        let (store, campaign) = seed(5).await;
        let queue = CampaignQueue::new(store.clone(), &campaign.id, false, Some(1));

        let mut order = Vec::new();
        loop {
            let batch = queue.next_batch(Utc::now(), 1).await.unwrap();
            match batch.into_iter().next() {
                Some(msg) => order.push(msg.index),
                None => break,
            }
        }
        assert_eq!(order, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn no_message_is_yielded_twice() {
        let (store, campaign) = seed(8).await;
        let queue = CampaignQueue::new(store.clone(), &campaign.id, true, Some(2));

        let mut seen = std::collections::HashSet::new();
        loop {
            let batch = queue.next_batch(Utc::now(), 3).await.unwrap();
            if batch.is_empty() {
                break;
            }
            for msg in batch {
                assert!(seen.insert(msg.index), "index {} yielded twice", msg.index);
            }
        }
        assert_eq!(seen.len(), 8);
    }

    #[tokio::test]
    async fn requeue_returns_message_to_pending_with_bumped_attempts() {
        let (store, campaign) = seed(10).await;
        let queue = CampaignQueue::new(store.clone(), &campaign.id, false, Some(3));

        let batch = queue.next_batch(Utc::now(), 1).await.unwrap();
        let msg = batch.into_iter().next().unwrap();
        assert_eq!(msg.index, 0);

        queue.requeue(&msg, Utc::now(), None, "timeout").await.unwrap();

        let stored = store.get_message(&campaign.id, 0).await.unwrap().unwrap();
        assert_eq!(stored.status, MessageStatus::Pending);
        assert_eq!(stored.attempts, 1);
        assert_eq!(stored.last_error.as_deref(), Some("timeout"));
        // Reinserted behind at least one other pending message.
        assert!(stored.sort_key > 0);
    }

    #[tokio::test]
    async fn requeue_backoff_holds_message_back() {
        let (store, campaign) = seed(1).await;
        let queue = CampaignQueue::new(store.clone(), &campaign.id, false, Some(4));

        let now = Utc::now();
        let msg = queue.next_batch(now, 1).await.unwrap().into_iter().next().unwrap();
        queue
            .requeue(&msg, now, Some(Duration::from_secs(60)), "rate limited")
            .await
            .unwrap();

        assert!(queue.next_batch(now, 1).await.unwrap().is_empty());
        let later = now + chrono::Duration::seconds(61);
        assert_eq!(queue.next_batch(later, 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stats_reflect_statuses() {
        let (store, campaign) = seed(3).await;
        let queue = CampaignQueue::new(store.clone(), &campaign.id, false, Some(5));

        let msg = queue.next_batch(Utc::now(), 1).await.unwrap().into_iter().next().unwrap();
        store.mark_sent(&campaign.id, msg.index, "wamid", "Hi").await.unwrap();

        let stats = queue.stats().await.unwrap();
        assert_eq!(stats.pending, 2);
        assert_eq!(stats.sent, 1);
        assert_eq!(stats.processing, 0);
    }
}
