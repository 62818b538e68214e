//! Campaign repository capability
//!
//! Typed CRUD over campaigns, messages and retry policies. The engine only
//! sees this trait; no SQL leaks past it. Two implementations ship: an
//! in-memory store for tests and the dev monolith, and a SQLite store whose
//! pending→processing reservation is an atomic compare-and-set.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use bl_common::{BlastMessage, Campaign, CampaignStatus, QueueStats, RetryPolicy};

pub mod error;
pub mod memory;
pub mod sqlite;

pub use error::StoreError;
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

pub type Result<T> = std::result::Result<T, StoreError>;

#[async_trait]
pub trait CampaignStore: Send + Sync {
    // ------------------------------------------------------------------
    // Campaigns
    // ------------------------------------------------------------------

    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()>;

    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>>;

    /// Persist a lifecycle transition: status, timestamps and last error.
    /// Counters are deliberately not written here; they only move through
    /// `increment_counters` / `recompute_counters` so concurrent outcome
    /// recording cannot be clobbered by a state write.
    async fn update_campaign_state(&self, campaign: &Campaign) -> Result<()>;

    /// Atomically bump the outcome counters and advance `current_index`.
    async fn increment_counters(
        &self,
        campaign_id: &str,
        sent: u32,
        failed: u32,
        skipped: u32,
        current_index: u32,
    ) -> Result<()>;

    /// Rebuild the campaign counters from the message rows (single source
    /// formula: terminal statuses only). Used by recovery.
    async fn recompute_counters(&self, campaign_id: &str) -> Result<()>;

    async fn find_campaigns_by_status(&self, statuses: &[CampaignStatus]) -> Result<Vec<Campaign>>;

    async fn find_campaigns_by_owner(&self, owner_id: &str) -> Result<Vec<Campaign>>;

    async fn find_campaigns_by_session(&self, session_id: &str) -> Result<Vec<Campaign>>;

    /// Delete messages, retry policy, then the campaign row.
    async fn delete_campaign(&self, campaign_id: &str) -> Result<()>;

    // ------------------------------------------------------------------
    // Messages
    // ------------------------------------------------------------------

    async fn insert_messages(&self, messages: &[BlastMessage]) -> Result<()>;

    async fn get_message(&self, campaign_id: &str, index: u32) -> Result<Option<BlastMessage>>;

    /// All messages of a campaign, ascending index.
    async fn list_messages(&self, campaign_id: &str) -> Result<Vec<BlastMessage>>;

    /// Pending messages whose `scheduled_at` has passed, ascending
    /// `sort_key`, up to `limit`.
    async fn list_pending(&self, campaign_id: &str, now: DateTime<Utc>, limit: u32) -> Result<Vec<BlastMessage>>;

    /// Atomic pending→processing transition. Returns false when another
    /// worker already took the row, so no message is ever yielded twice.
    async fn reserve(&self, campaign_id: &str, index: u32) -> Result<bool>;

    /// processing→pending without burning an attempt (used when a send was
    /// cancelled before it was issued, and for zombie reconciliation).
    async fn release(&self, campaign_id: &str, index: u32) -> Result<()>;

    /// Atomic failed→processing transition for the retry path. Returns
    /// false when the row is no longer a retryable failure.
    async fn reserve_retry(&self, campaign_id: &str, index: u32) -> Result<bool>;

    async fn mark_sent(
        &self,
        campaign_id: &str,
        index: u32,
        messenger_message_id: &str,
        rendered_text: &str,
    ) -> Result<()>;

    /// Terminal or retry-eligible failure; bumps attempts.
    async fn mark_failed(&self, campaign_id: &str, index: u32, error: &str) -> Result<()>;

    /// Failure that exhausts the attempt budget immediately (e.g. a number
    /// that is not on the platform at validation time).
    async fn mark_failed_terminal(&self, campaign_id: &str, index: u32, error: &str) -> Result<()>;

    /// Permanent failure; never retried.
    async fn mark_skipped(&self, campaign_id: &str, index: u32, error: &str) -> Result<()>;

    /// processing→pending with a bumped attempt, moved to `new_sort_key`
    /// and optionally held back until `scheduled_at`.
    async fn requeue(
        &self,
        campaign_id: &str,
        index: u32,
        new_sort_key: i64,
        scheduled_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<()>;

    /// failed→pending for every message with attempts left. Returns the
    /// number of rows moved.
    async fn reset_failed(&self, campaign_id: &str) -> Result<u64>;

    async fn message_stats(&self, campaign_id: &str) -> Result<QueueStats>;

    /// Failed messages that still have attempts left.
    async fn count_retry_eligible(&self, campaign_id: &str) -> Result<u64>;

    /// `sort_key` of the n-th pending message (0-based), used for random
    /// reinsertion on requeue.
    async fn nth_pending_sort_key(&self, campaign_id: &str, n: u64) -> Result<Option<i64>>;

    /// Retry-eligible failures whose last failure predates `older_than`,
    /// oldest first.
    async fn find_retry_candidates(
        &self,
        campaign_id: &str,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<BlastMessage>>;

    /// Messages stuck in `processing` since before `older_than` (loop died
    /// without recording an outcome).
    async fn find_stale_processing(
        &self,
        campaign_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<BlastMessage>>;

    // ------------------------------------------------------------------
    // Retry policies
    // ------------------------------------------------------------------

    async fn upsert_retry_policy(&self, policy: &RetryPolicy) -> Result<()>;

    async fn get_retry_policy(&self, campaign_id: &str) -> Result<Option<RetryPolicy>>;

    async fn list_enabled_retry_policies(&self) -> Result<Vec<RetryPolicy>>;

    async fn add_retry_totals(&self, campaign_id: &str, attempted: u64, succeeded: u64, failed: u64) -> Result<()>;
}
