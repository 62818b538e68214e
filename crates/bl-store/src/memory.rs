//! In-memory store for tests and the dev monolith

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use bl_common::{BlastMessage, Campaign, CampaignStatus, MessageStatus, QueueStats, RetryPolicy};

use crate::{CampaignStore, Result, StoreError};

/// Process-local store. All maps sit behind short-lived locks; no lock is
/// held across an await point.
#[derive(Default)]
pub struct MemoryStore {
    campaigns: RwLock<HashMap<String, Campaign>>,
    messages: RwLock<HashMap<String, BTreeMap<u32, BlastMessage>>>,
    policies: RwLock<HashMap<String, RetryPolicy>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_message<T>(
        &self,
        campaign_id: &str,
        index: u32,
        f: impl FnOnce(&mut BlastMessage) -> T,
    ) -> Result<T> {
        let mut messages = self.messages.write();
        let msg = messages
            .get_mut(campaign_id)
            .and_then(|m| m.get_mut(&index))
            .ok_or_else(|| StoreError::MessageNotFound {
                campaign_id: campaign_id.to_string(),
                index,
            })?;
        Ok(f(msg))
    }
}

#[async_trait]
impl CampaignStore for MemoryStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        self.campaigns
            .write()
            .insert(campaign.id.clone(), campaign.clone());
        Ok(())
    }

    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        Ok(self.campaigns.read().get(campaign_id).cloned())
    }

    async fn update_campaign_state(&self, campaign: &Campaign) -> Result<()> {
        let mut campaigns = self.campaigns.write();
        let row = campaigns
            .get_mut(&campaign.id)
            .ok_or_else(|| StoreError::CampaignNotFound(campaign.id.clone()))?;
        row.status = campaign.status;
        row.started_at = campaign.started_at;
        row.paused_at = campaign.paused_at;
        row.resumed_at = campaign.resumed_at;
        row.completed_at = campaign.completed_at;
        row.stopped_at = campaign.stopped_at;
        row.last_error = campaign.last_error.clone();
        Ok(())
    }

    async fn increment_counters(
        &self,
        campaign_id: &str,
        sent: u32,
        failed: u32,
        skipped: u32,
        current_index: u32,
    ) -> Result<()> {
        let mut campaigns = self.campaigns.write();
        let row = campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| StoreError::CampaignNotFound(campaign_id.to_string()))?;
        row.sent_count += sent;
        row.failed_count += failed;
        row.skipped_count += skipped;
        row.current_index = row.current_index.max(current_index);
        Ok(())
    }

    async fn recompute_counters(&self, campaign_id: &str) -> Result<()> {
        let stats = {
            let messages = self.messages.read();
            let rows = messages.get(campaign_id);
            let mut sent = 0u32;
            let mut failed = 0u32;
            let mut skipped = 0u32;
            if let Some(rows) = rows {
                for msg in rows.values() {
                    match msg.status {
                        MessageStatus::Sent => sent += 1,
                        MessageStatus::Failed if msg.attempts >= msg.max_attempts => failed += 1,
                        MessageStatus::Skipped => skipped += 1,
                        _ => {}
                    }
                }
            }
            (sent, failed, skipped)
        };

        let mut campaigns = self.campaigns.write();
        let row = campaigns
            .get_mut(campaign_id)
            .ok_or_else(|| StoreError::CampaignNotFound(campaign_id.to_string()))?;
        row.sent_count = stats.0;
        row.failed_count = stats.1;
        row.skipped_count = stats.2;
        Ok(())
    }

    async fn find_campaigns_by_status(&self, statuses: &[CampaignStatus]) -> Result<Vec<Campaign>> {
        Ok(self
            .campaigns
            .read()
            .values()
            .filter(|c| statuses.contains(&c.status))
            .cloned()
            .collect())
    }

    async fn find_campaigns_by_owner(&self, owner_id: &str) -> Result<Vec<Campaign>> {
        Ok(self
            .campaigns
            .read()
            .values()
            .filter(|c| c.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn find_campaigns_by_session(&self, session_id: &str) -> Result<Vec<Campaign>> {
        Ok(self
            .campaigns
            .read()
            .values()
            .filter(|c| c.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn delete_campaign(&self, campaign_id: &str) -> Result<()> {
        self.messages.write().remove(campaign_id);
        self.policies.write().remove(campaign_id);
        self.campaigns.write().remove(campaign_id);
        Ok(())
    }

    async fn insert_messages(&self, messages: &[BlastMessage]) -> Result<()> {
        let mut map = self.messages.write();
        for msg in messages {
            map.entry(msg.campaign_id.clone())
                .or_default()
                .insert(msg.index, msg.clone());
        }
        Ok(())
    }

    async fn get_message(&self, campaign_id: &str, index: u32) -> Result<Option<BlastMessage>> {
        Ok(self
            .messages
            .read()
            .get(campaign_id)
            .and_then(|m| m.get(&index))
            .cloned())
    }

    async fn list_messages(&self, campaign_id: &str) -> Result<Vec<BlastMessage>> {
        Ok(self
            .messages
            .read()
            .get(campaign_id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn list_pending(&self, campaign_id: &str, now: DateTime<Utc>, limit: u32) -> Result<Vec<BlastMessage>> {
        let messages = self.messages.read();
        let mut pending: Vec<BlastMessage> = messages
            .get(campaign_id)
            .map(|m| {
                m.values()
                    .filter(|msg| {
                        msg.status == MessageStatus::Pending
                            && msg.scheduled_at.map(|at| at <= now).unwrap_or(true)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        pending.sort_by_key(|m| m.sort_key);
        pending.truncate(limit as usize);
        Ok(pending)
    }

    async fn reserve(&self, campaign_id: &str, index: u32) -> Result<bool> {
        self.with_message(campaign_id, index, |msg| {
            if msg.status != MessageStatus::Pending {
                return false;
            }
            msg.status = MessageStatus::Processing;
            msg.processing_started_at = Some(Utc::now());
            true
        })
    }

    async fn release(&self, campaign_id: &str, index: u32) -> Result<()> {
        self.with_message(campaign_id, index, |msg| {
            if msg.status == MessageStatus::Processing {
                msg.status = MessageStatus::Pending;
                msg.processing_started_at = None;
            }
        })
    }

    async fn reserve_retry(&self, campaign_id: &str, index: u32) -> Result<bool> {
        self.with_message(campaign_id, index, |msg| {
            if !msg.is_retry_eligible() {
                return false;
            }
            msg.status = MessageStatus::Processing;
            msg.processing_started_at = Some(Utc::now());
            true
        })
    }

    async fn mark_sent(
        &self,
        campaign_id: &str,
        index: u32,
        messenger_message_id: &str,
        rendered_text: &str,
    ) -> Result<()> {
        self.with_message(campaign_id, index, |msg| {
            msg.status = MessageStatus::Sent;
            msg.attempts += 1;
            msg.messenger_message_id = Some(messenger_message_id.to_string());
            msg.rendered_text = Some(rendered_text.to_string());
            msg.sent_at = Some(Utc::now());
            msg.last_error = None;
        })
    }

    async fn mark_failed(&self, campaign_id: &str, index: u32, error: &str) -> Result<()> {
        self.with_message(campaign_id, index, |msg| {
            msg.status = MessageStatus::Failed;
            msg.attempts += 1;
            msg.last_error = Some(error.to_string());
            msg.failed_at = Some(Utc::now());
        })
    }

    async fn mark_failed_terminal(&self, campaign_id: &str, index: u32, error: &str) -> Result<()> {
        self.with_message(campaign_id, index, |msg| {
            msg.status = MessageStatus::Failed;
            msg.attempts = msg.attempts.max(msg.max_attempts);
            msg.last_error = Some(error.to_string());
            msg.failed_at = Some(Utc::now());
        })
    }

    async fn mark_skipped(&self, campaign_id: &str, index: u32, error: &str) -> Result<()> {
        self.with_message(campaign_id, index, |msg| {
            msg.status = MessageStatus::Skipped;
            msg.attempts += 1;
            msg.last_error = Some(error.to_string());
            msg.failed_at = Some(Utc::now());
        })
    }

    async fn requeue(
        &self,
        campaign_id: &str,
        index: u32,
        new_sort_key: i64,
        scheduled_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<()> {
        self.with_message(campaign_id, index, |msg| {
            msg.status = MessageStatus::Pending;
            msg.attempts += 1;
            msg.sort_key = new_sort_key;
            msg.scheduled_at = scheduled_at;
            msg.processing_started_at = None;
            if let Some(error) = error {
                msg.last_error = Some(error.to_string());
            }
        })
    }

    async fn reset_failed(&self, campaign_id: &str) -> Result<u64> {
        let mut messages = self.messages.write();
        let Some(rows) = messages.get_mut(campaign_id) else {
            return Ok(0);
        };
        let mut moved = 0u64;
        for msg in rows.values_mut() {
            if msg.status == MessageStatus::Failed && msg.attempts < msg.max_attempts {
                msg.status = MessageStatus::Pending;
                msg.scheduled_at = None;
                moved += 1;
            }
        }
        Ok(moved)
    }

    async fn message_stats(&self, campaign_id: &str) -> Result<QueueStats> {
        let messages = self.messages.read();
        let mut stats = QueueStats::default();
        if let Some(rows) = messages.get(campaign_id) {
            for msg in rows.values() {
                match msg.status {
                    MessageStatus::Pending => stats.pending += 1,
                    MessageStatus::Processing => stats.processing += 1,
                    MessageStatus::Sent => stats.sent += 1,
                    MessageStatus::Failed => stats.failed += 1,
                    MessageStatus::Skipped => stats.skipped += 1,
                }
            }
        }
        Ok(stats)
    }

    async fn count_retry_eligible(&self, campaign_id: &str) -> Result<u64> {
        let messages = self.messages.read();
        Ok(messages
            .get(campaign_id)
            .map(|rows| rows.values().filter(|m| m.is_retry_eligible()).count() as u64)
            .unwrap_or(0))
    }

    async fn nth_pending_sort_key(&self, campaign_id: &str, n: u64) -> Result<Option<i64>> {
        let messages = self.messages.read();
        let mut keys: Vec<i64> = messages
            .get(campaign_id)
            .map(|rows| {
                rows.values()
                    .filter(|m| m.status == MessageStatus::Pending)
                    .map(|m| m.sort_key)
                    .collect()
            })
            .unwrap_or_default();
        keys.sort_unstable();
        Ok(keys.get(n as usize).copied())
    }

    async fn find_retry_candidates(
        &self,
        campaign_id: &str,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<BlastMessage>> {
        let messages = self.messages.read();
        let mut candidates: Vec<BlastMessage> = messages
            .get(campaign_id)
            .map(|rows| {
                rows.values()
                    .filter(|m| {
                        m.is_retry_eligible()
                            && m.failed_at.map(|at| at < older_than).unwrap_or(true)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        candidates.sort_by_key(|m| m.failed_at);
        candidates.truncate(limit as usize);
        Ok(candidates)
    }

    async fn find_stale_processing(
        &self,
        campaign_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<BlastMessage>> {
        let messages = self.messages.read();
        Ok(messages
            .get(campaign_id)
            .map(|rows| {
                rows.values()
                    .filter(|m| {
                        m.status == MessageStatus::Processing
                            && m.processing_started_at.map(|at| at < older_than).unwrap_or(true)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert_retry_policy(&self, policy: &RetryPolicy) -> Result<()> {
        self.policies
            .write()
            .insert(policy.campaign_id.clone(), policy.clone());
        Ok(())
    }

    async fn get_retry_policy(&self, campaign_id: &str) -> Result<Option<RetryPolicy>> {
        Ok(self.policies.read().get(campaign_id).cloned())
    }

    async fn list_enabled_retry_policies(&self) -> Result<Vec<RetryPolicy>> {
        Ok(self
            .policies
            .read()
            .values()
            .filter(|p| p.enabled)
            .cloned()
            .collect())
    }

    async fn add_retry_totals(&self, campaign_id: &str, attempted: u64, succeeded: u64, failed: u64) -> Result<()> {
        let mut policies = self.policies.write();
        if let Some(policy) = policies.get_mut(campaign_id) {
            policy.attempted += attempted;
            policy.succeeded += succeeded;
            policy.failed += failed;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bl_common::{CampaignConfig, Contact};

    fn seed_campaign(total: u32) -> (Campaign, Vec<BlastMessage>) {
        let campaign = Campaign::new("u1", "s1", "test", "Hi {name}", total, CampaignConfig::default());
        let messages = (0..total)
            .map(|i| BlastMessage::new(&campaign.id, i, Contact::new(format!("62811{i}")), 3))
            .collect();
        (campaign, messages)
    }

    #[tokio::test]
    async fn reserve_is_exclusive() {
        let store = MemoryStore::new();
        let (campaign, messages) = seed_campaign(1);
        store.insert_campaign(&campaign).await.unwrap();
        store.insert_messages(&messages).await.unwrap();

        assert!(store.reserve(&campaign.id, 0).await.unwrap());
        assert!(!store.reserve(&campaign.id, 0).await.unwrap());

        store.release(&campaign.id, 0).await.unwrap();
        assert!(store.reserve(&campaign.id, 0).await.unwrap());
    }

    #[tokio::test]
    async fn outcome_transitions_bump_attempts() {
        let store = MemoryStore::new();
        let (campaign, messages) = seed_campaign(2);
        store.insert_campaign(&campaign).await.unwrap();
        store.insert_messages(&messages).await.unwrap();

        store.reserve(&campaign.id, 0).await.unwrap();
        store.mark_sent(&campaign.id, 0, "wamid-1", "Hi A").await.unwrap();
        let sent = store.get_message(&campaign.id, 0).await.unwrap().unwrap();
        assert_eq!(sent.status, MessageStatus::Sent);
        assert_eq!(sent.attempts, 1);
        assert_eq!(sent.messenger_message_id.as_deref(), Some("wamid-1"));

        store.reserve(&campaign.id, 1).await.unwrap();
        store.mark_failed(&campaign.id, 1, "timeout").await.unwrap();
        let failed = store.get_message(&campaign.id, 1).await.unwrap().unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.attempts, 1);
        assert!(failed.is_retry_eligible());
    }

    #[tokio::test]
    async fn scheduled_messages_are_held_back() {
        let store = MemoryStore::new();
        let (campaign, messages) = seed_campaign(1);
        store.insert_campaign(&campaign).await.unwrap();
        store.insert_messages(&messages).await.unwrap();

        let now = Utc::now();
        store.reserve(&campaign.id, 0).await.unwrap();
        store
            .requeue(&campaign.id, 0, 500, Some(now + chrono::Duration::seconds(60)), Some("rate limited"))
            .await
            .unwrap();

        assert!(store.list_pending(&campaign.id, now, 10).await.unwrap().is_empty());
        let later = now + chrono::Duration::seconds(120);
        assert_eq!(store.list_pending(&campaign.id, later, 10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reset_failed_respects_attempt_budget() {
        let store = MemoryStore::new();
        let (campaign, mut messages) = seed_campaign(2);
        messages[1].max_attempts = 1;
        store.insert_campaign(&campaign).await.unwrap();
        store.insert_messages(&messages).await.unwrap();

        for index in 0..2 {
            store.reserve(&campaign.id, index).await.unwrap();
            store.mark_failed(&campaign.id, index, "boom").await.unwrap();
        }

        // Message 1 exhausted its single attempt; only message 0 moves.
        let moved = store.reset_failed(&campaign.id).await.unwrap();
        assert_eq!(moved, 1);
        let stats = store.message_stats(&campaign.id).await.unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.failed, 1);
    }

    #[tokio::test]
    async fn recompute_counters_uses_terminal_statuses() {
        let store = MemoryStore::new();
        let (campaign, messages) = seed_campaign(3);
        store.insert_campaign(&campaign).await.unwrap();
        store.insert_messages(&messages).await.unwrap();

        store.reserve(&campaign.id, 0).await.unwrap();
        store.mark_sent(&campaign.id, 0, "wamid-1", "Hi").await.unwrap();
        store.reserve(&campaign.id, 1).await.unwrap();
        store.mark_failed(&campaign.id, 1, "boom").await.unwrap(); // eligible, not terminal
        store.reserve(&campaign.id, 2).await.unwrap();
        store.mark_skipped(&campaign.id, 2, "not on messenger").await.unwrap();

        store.recompute_counters(&campaign.id).await.unwrap();
        let campaign = store.get_campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(campaign.sent_count, 1);
        assert_eq!(campaign.failed_count, 0);
        assert_eq!(campaign.skipped_count, 1);
    }
}
