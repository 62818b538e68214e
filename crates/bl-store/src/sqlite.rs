//! SQLite-backed campaign store
//!
//! Durable implementation of the repository capability. The
//! pending→processing reservation is a single-row compare-and-set
//! (`UPDATE ... WHERE status = 'pending'` + `rows_affected`), which is what
//! guarantees at-most-once assignment per attempt.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info};

use bl_common::{
    BlastMessage, Campaign, CampaignConfig, CampaignStatus, MessageStatus, QueueStats, RetryPolicy,
};

use crate::{CampaignStore, Result, StoreError};

pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

fn to_ts(dt: Option<DateTime<Utc>>) -> Option<i64> {
    dt.map(|d| d.timestamp_millis())
}

fn from_ts(v: Option<i64>) -> Option<DateTime<Utc>> {
    v.and_then(DateTime::from_timestamp_millis)
}

fn parse_campaign_status(s: &str) -> Result<CampaignStatus> {
    CampaignStatus::from_str(s).ok_or_else(|| StoreError::Conflict(format!("unknown campaign status: {s}")))
}

fn parse_message_status(s: &str) -> Result<MessageStatus> {
    MessageStatus::from_str(s).ok_or_else(|| StoreError::Conflict(format!("unknown message status: {s}")))
}

impl SqliteStore {
    pub fn new(pool: Pool<Sqlite>) -> Self {
        Self { pool }
    }

    /// Create the schema. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS campaigns (
                id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                session_id TEXT NOT NULL,
                name TEXT NOT NULL,
                template TEXT NOT NULL,
                total_count INTEGER NOT NULL,
                sent_count INTEGER NOT NULL DEFAULT 0,
                failed_count INTEGER NOT NULL DEFAULT 0,
                skipped_count INTEGER NOT NULL DEFAULT 0,
                current_index INTEGER NOT NULL DEFAULT 0,
                status TEXT NOT NULL,
                config TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                started_at INTEGER,
                paused_at INTEGER,
                resumed_at INTEGER,
                completed_at INTEGER,
                stopped_at INTEGER,
                last_error TEXT
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS campaign_messages (
                campaign_id TEXT NOT NULL,
                idx INTEGER NOT NULL,
                phone TEXT NOT NULL,
                contact_name TEXT,
                variables TEXT NOT NULL,
                rendered_text TEXT,
                status TEXT NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL,
                sort_key INTEGER NOT NULL,
                messenger_message_id TEXT,
                last_error TEXT,
                processing_started_at INTEGER,
                sent_at INTEGER,
                failed_at INTEGER,
                scheduled_at INTEGER,
                PRIMARY KEY (campaign_id, idx)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_messages_queue
            ON campaign_messages (campaign_id, status, sort_key)
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS retry_policies (
                campaign_id TEXT PRIMARY KEY,
                enabled INTEGER NOT NULL,
                max_attempts INTEGER NOT NULL,
                base_delay_seconds INTEGER NOT NULL,
                batch_size INTEGER NOT NULL,
                hourly_cap INTEGER NOT NULL,
                windowed_only INTEGER NOT NULL,
                window_start_hour INTEGER NOT NULL,
                window_end_hour INTEGER NOT NULL,
                window_days TEXT NOT NULL,
                paused_until INTEGER,
                attempted INTEGER NOT NULL DEFAULT 0,
                succeeded INTEGER NOT NULL DEFAULT 0,
                failed INTEGER NOT NULL DEFAULT 0
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("SQLite campaign store schema initialized");
        Ok(())
    }

    fn row_to_campaign(row: &sqlx::sqlite::SqliteRow) -> Result<Campaign> {
        let status: String = row.get("status");
        let config: String = row.get("config");
        let config: CampaignConfig = serde_json::from_str(&config)?;

        Ok(Campaign {
            id: row.get("id"),
            owner_id: row.get("owner_id"),
            session_id: row.get("session_id"),
            name: row.get("name"),
            template: row.get("template"),
            total_count: row.get::<i64, _>("total_count") as u32,
            sent_count: row.get::<i64, _>("sent_count") as u32,
            failed_count: row.get::<i64, _>("failed_count") as u32,
            skipped_count: row.get::<i64, _>("skipped_count") as u32,
            current_index: row.get::<i64, _>("current_index") as u32,
            status: parse_campaign_status(&status)?,
            config,
            created_at: from_ts(Some(row.get("created_at"))).unwrap_or_else(Utc::now),
            started_at: from_ts(row.get("started_at")),
            paused_at: from_ts(row.get("paused_at")),
            resumed_at: from_ts(row.get("resumed_at")),
            completed_at: from_ts(row.get("completed_at")),
            stopped_at: from_ts(row.get("stopped_at")),
            last_error: row.get("last_error"),
        })
    }

    fn row_to_message(row: &sqlx::sqlite::SqliteRow) -> Result<BlastMessage> {
        let status: String = row.get("status");
        let variables: String = row.get("variables");

        Ok(BlastMessage {
            campaign_id: row.get("campaign_id"),
            index: row.get::<i64, _>("idx") as u32,
            phone: row.get("phone"),
            contact_name: row.get("contact_name"),
            variables: serde_json::from_str(&variables)?,
            rendered_text: row.get("rendered_text"),
            status: parse_message_status(&status)?,
            attempts: row.get::<i64, _>("attempts") as u32,
            max_attempts: row.get::<i64, _>("max_attempts") as u32,
            sort_key: row.get("sort_key"),
            messenger_message_id: row.get("messenger_message_id"),
            last_error: row.get("last_error"),
            processing_started_at: from_ts(row.get("processing_started_at")),
            sent_at: from_ts(row.get("sent_at")),
            failed_at: from_ts(row.get("failed_at")),
            scheduled_at: from_ts(row.get("scheduled_at")),
        })
    }

    fn row_to_policy(row: &sqlx::sqlite::SqliteRow) -> Result<RetryPolicy> {
        let window_days: String = row.get("window_days");
        Ok(RetryPolicy {
            campaign_id: row.get("campaign_id"),
            enabled: row.get::<i64, _>("enabled") != 0,
            max_attempts: row.get::<i64, _>("max_attempts") as u32,
            base_delay_seconds: row.get::<i64, _>("base_delay_seconds") as u64,
            batch_size: row.get::<i64, _>("batch_size") as u32,
            hourly_cap: row.get::<i64, _>("hourly_cap") as u32,
            windowed_only: row.get::<i64, _>("windowed_only") != 0,
            window_start_hour: row.get::<i64, _>("window_start_hour") as u8,
            window_end_hour: row.get::<i64, _>("window_end_hour") as u8,
            window_days: serde_json::from_str(&window_days)?,
            paused_until: from_ts(row.get("paused_until")),
            attempted: row.get::<i64, _>("attempted") as u64,
            succeeded: row.get::<i64, _>("succeeded") as u64,
            failed: row.get::<i64, _>("failed") as u64,
        })
    }
}

#[async_trait]
impl CampaignStore for SqliteStore {
    async fn insert_campaign(&self, campaign: &Campaign) -> Result<()> {
        let config = serde_json::to_string(&campaign.config)?;
        sqlx::query(
            r#"
            INSERT INTO campaigns (
                id, owner_id, session_id, name, template, total_count,
                sent_count, failed_count, skipped_count, current_index,
                status, config, created_at, started_at, paused_at,
                resumed_at, completed_at, stopped_at, last_error
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&campaign.id)
        .bind(&campaign.owner_id)
        .bind(&campaign.session_id)
        .bind(&campaign.name)
        .bind(&campaign.template)
        .bind(i64::from(campaign.total_count))
        .bind(i64::from(campaign.sent_count))
        .bind(i64::from(campaign.failed_count))
        .bind(i64::from(campaign.skipped_count))
        .bind(i64::from(campaign.current_index))
        .bind(campaign.status.as_str())
        .bind(config)
        .bind(campaign.created_at.timestamp_millis())
        .bind(to_ts(campaign.started_at))
        .bind(to_ts(campaign.paused_at))
        .bind(to_ts(campaign.resumed_at))
        .bind(to_ts(campaign.completed_at))
        .bind(to_ts(campaign.stopped_at))
        .bind(&campaign.last_error)
        .execute(&self.pool)
        .await?;

        debug!(campaign_id = %campaign.id, "Campaign inserted");
        Ok(())
    }

    async fn get_campaign(&self, campaign_id: &str) -> Result<Option<Campaign>> {
        let row = sqlx::query("SELECT * FROM campaigns WHERE id = ?")
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_campaign).transpose()
    }

    async fn update_campaign_state(&self, campaign: &Campaign) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET status = ?, started_at = ?, paused_at = ?, resumed_at = ?,
                completed_at = ?, stopped_at = ?, last_error = ?
            WHERE id = ?
            "#,
        )
        .bind(campaign.status.as_str())
        .bind(to_ts(campaign.started_at))
        .bind(to_ts(campaign.paused_at))
        .bind(to_ts(campaign.resumed_at))
        .bind(to_ts(campaign.completed_at))
        .bind(to_ts(campaign.stopped_at))
        .bind(&campaign.last_error)
        .bind(&campaign.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::CampaignNotFound(campaign.id.clone()));
        }
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
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET sent_count = sent_count + ?,
                failed_count = failed_count + ?,
                skipped_count = skipped_count + ?,
                current_index = MAX(current_index, ?)
            WHERE id = ?
            "#,
        )
        .bind(i64::from(sent))
        .bind(i64::from(failed))
        .bind(i64::from(skipped))
        .bind(i64::from(current_index))
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::CampaignNotFound(campaign_id.to_string()));
        }
        Ok(())
    }

    async fn recompute_counters(&self, campaign_id: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE campaigns
            SET sent_count = (
                    SELECT COUNT(*) FROM campaign_messages
                    WHERE campaign_id = ? AND status = 'sent'
                ),
                failed_count = (
                    SELECT COUNT(*) FROM campaign_messages
                    WHERE campaign_id = ? AND status = 'failed' AND attempts >= max_attempts
                ),
                skipped_count = (
                    SELECT COUNT(*) FROM campaign_messages
                    WHERE campaign_id = ? AND status = 'skipped'
                )
            WHERE id = ?
            "#,
        )
        .bind(campaign_id)
        .bind(campaign_id)
        .bind(campaign_id)
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::CampaignNotFound(campaign_id.to_string()));
        }
        Ok(())
    }

    async fn find_campaigns_by_status(&self, statuses: &[CampaignStatus]) -> Result<Vec<Campaign>> {
        if statuses.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = vec!["?"; statuses.len()].join(", ");
        let sql = format!("SELECT * FROM campaigns WHERE status IN ({placeholders}) ORDER BY created_at");
        let mut query = sqlx::query(&sql);
        for status in statuses {
            query = query.bind(status.as_str());
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(Self::row_to_campaign).collect()
    }

    async fn find_campaigns_by_owner(&self, owner_id: &str) -> Result<Vec<Campaign>> {
        let rows = sqlx::query("SELECT * FROM campaigns WHERE owner_id = ? ORDER BY created_at")
            .bind(owner_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_campaign).collect()
    }

    async fn find_campaigns_by_session(&self, session_id: &str) -> Result<Vec<Campaign>> {
        let rows = sqlx::query("SELECT * FROM campaigns WHERE session_id = ? ORDER BY created_at")
            .bind(session_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_campaign).collect()
    }

    async fn delete_campaign(&self, campaign_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM campaign_messages WHERE campaign_id = ?")
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM retry_policies WHERE campaign_id = ?")
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM campaigns WHERE id = ?")
            .bind(campaign_id)
            .execute(&self.pool)
            .await?;
        debug!(campaign_id = %campaign_id, "Campaign deleted");
        Ok(())
    }

    async fn insert_messages(&self, messages: &[BlastMessage]) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        for msg in messages {
            let variables = serde_json::to_string(&msg.variables)?;
            sqlx::query(
                r#"
                INSERT INTO campaign_messages (
                    campaign_id, idx, phone, contact_name, variables,
                    rendered_text, status, attempts, max_attempts, sort_key,
                    messenger_message_id, last_error, processing_started_at,
                    sent_at, failed_at, scheduled_at
                ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&msg.campaign_id)
            .bind(i64::from(msg.index))
            .bind(&msg.phone)
            .bind(&msg.contact_name)
            .bind(variables)
            .bind(&msg.rendered_text)
            .bind(msg.status.as_str())
            .bind(i64::from(msg.attempts))
            .bind(i64::from(msg.max_attempts))
            .bind(msg.sort_key)
            .bind(&msg.messenger_message_id)
            .bind(&msg.last_error)
            .bind(to_ts(msg.processing_started_at))
            .bind(to_ts(msg.sent_at))
            .bind(to_ts(msg.failed_at))
            .bind(to_ts(msg.scheduled_at))
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    async fn get_message(&self, campaign_id: &str, index: u32) -> Result<Option<BlastMessage>> {
        let row = sqlx::query("SELECT * FROM campaign_messages WHERE campaign_id = ? AND idx = ?")
            .bind(campaign_id)
            .bind(i64::from(index))
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_message).transpose()
    }

    async fn list_messages(&self, campaign_id: &str) -> Result<Vec<BlastMessage>> {
        let rows = sqlx::query("SELECT * FROM campaign_messages WHERE campaign_id = ? ORDER BY idx")
            .bind(campaign_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn list_pending(&self, campaign_id: &str, now: DateTime<Utc>, limit: u32) -> Result<Vec<BlastMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM campaign_messages
            WHERE campaign_id = ? AND status = 'pending'
              AND (scheduled_at IS NULL OR scheduled_at <= ?)
            ORDER BY sort_key
            LIMIT ?
            "#,
        )
        .bind(campaign_id)
        .bind(now.timestamp_millis())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn reserve(&self, campaign_id: &str, index: u32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'processing', processing_started_at = ?
            WHERE campaign_id = ? AND idx = ? AND status = 'pending'
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(campaign_id)
        .bind(i64::from(index))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release(&self, campaign_id: &str, index: u32) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'pending', processing_started_at = NULL
            WHERE campaign_id = ? AND idx = ? AND status = 'processing'
            "#,
        )
        .bind(campaign_id)
        .bind(i64::from(index))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reserve_retry(&self, campaign_id: &str, index: u32) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'processing', processing_started_at = ?
            WHERE campaign_id = ? AND idx = ? AND status = 'failed'
              AND attempts < max_attempts
            "#,
        )
        .bind(Utc::now().timestamp_millis())
        .bind(campaign_id)
        .bind(i64::from(index))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_sent(
        &self,
        campaign_id: &str,
        index: u32,
        messenger_message_id: &str,
        rendered_text: &str,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'sent', attempts = attempts + 1,
                messenger_message_id = ?, rendered_text = ?, sent_at = ?,
                last_error = NULL
            WHERE campaign_id = ? AND idx = ?
            "#,
        )
        .bind(messenger_message_id)
        .bind(rendered_text)
        .bind(Utc::now().timestamp_millis())
        .bind(campaign_id)
        .bind(i64::from(index))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound {
                campaign_id: campaign_id.to_string(),
                index,
            });
        }
        Ok(())
    }

    async fn mark_failed(&self, campaign_id: &str, index: u32, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'failed', attempts = attempts + 1,
                last_error = ?, failed_at = ?
            WHERE campaign_id = ? AND idx = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(campaign_id)
        .bind(i64::from(index))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound {
                campaign_id: campaign_id.to_string(),
                index,
            });
        }
        Ok(())
    }

    async fn mark_failed_terminal(&self, campaign_id: &str, index: u32, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'failed', attempts = MAX(attempts, max_attempts),
                last_error = ?, failed_at = ?
            WHERE campaign_id = ? AND idx = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(campaign_id)
        .bind(i64::from(index))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound {
                campaign_id: campaign_id.to_string(),
                index,
            });
        }
        Ok(())
    }

    async fn mark_skipped(&self, campaign_id: &str, index: u32, error: &str) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'skipped', attempts = attempts + 1,
                last_error = ?, failed_at = ?
            WHERE campaign_id = ? AND idx = ?
            "#,
        )
        .bind(error)
        .bind(Utc::now().timestamp_millis())
        .bind(campaign_id)
        .bind(i64::from(index))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound {
                campaign_id: campaign_id.to_string(),
                index,
            });
        }
        Ok(())
    }

    async fn requeue(
        &self,
        campaign_id: &str,
        index: u32,
        new_sort_key: i64,
        scheduled_at: Option<DateTime<Utc>>,
        error: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'pending', attempts = attempts + 1, sort_key = ?,
                scheduled_at = ?, processing_started_at = NULL,
                last_error = COALESCE(?, last_error)
            WHERE campaign_id = ? AND idx = ?
            "#,
        )
        .bind(new_sort_key)
        .bind(to_ts(scheduled_at))
        .bind(error)
        .bind(campaign_id)
        .bind(i64::from(index))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::MessageNotFound {
                campaign_id: campaign_id.to_string(),
                index,
            });
        }
        Ok(())
    }

    async fn reset_failed(&self, campaign_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE campaign_messages
            SET status = 'pending', scheduled_at = NULL
            WHERE campaign_id = ? AND status = 'failed' AND attempts < max_attempts
            "#,
        )
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn message_stats(&self, campaign_id: &str) -> Result<QueueStats> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) as count FROM campaign_messages WHERE campaign_id = ? GROUP BY status",
        )
        .bind(campaign_id)
        .fetch_all(&self.pool)
        .await?;

        let mut stats = QueueStats::default();
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            match parse_message_status(&status)? {
                MessageStatus::Pending => stats.pending = count as u64,
                MessageStatus::Processing => stats.processing = count as u64,
                MessageStatus::Sent => stats.sent = count as u64,
                MessageStatus::Failed => stats.failed = count as u64,
                MessageStatus::Skipped => stats.skipped = count as u64,
            }
        }
        Ok(stats)
    }

    async fn count_retry_eligible(&self, campaign_id: &str) -> Result<u64> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) as count FROM campaign_messages
            WHERE campaign_id = ? AND status = 'failed' AND attempts < max_attempts
            "#,
        )
        .bind(campaign_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.get::<i64, _>("count") as u64)
    }

    async fn nth_pending_sort_key(&self, campaign_id: &str, n: u64) -> Result<Option<i64>> {
        let row = sqlx::query(
            r#"
            SELECT sort_key FROM campaign_messages
            WHERE campaign_id = ? AND status = 'pending'
            ORDER BY sort_key
            LIMIT 1 OFFSET ?
            "#,
        )
        .bind(campaign_id)
        .bind(n as i64)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(|r| r.get("sort_key")))
    }

    async fn find_retry_candidates(
        &self,
        campaign_id: &str,
        older_than: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<BlastMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM campaign_messages
            WHERE campaign_id = ? AND status = 'failed' AND attempts < max_attempts
              AND (failed_at IS NULL OR failed_at < ?)
            ORDER BY failed_at
            LIMIT ?
            "#,
        )
        .bind(campaign_id)
        .bind(older_than.timestamp_millis())
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn find_stale_processing(
        &self,
        campaign_id: &str,
        older_than: DateTime<Utc>,
    ) -> Result<Vec<BlastMessage>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM campaign_messages
            WHERE campaign_id = ? AND status = 'processing'
              AND (processing_started_at IS NULL OR processing_started_at < ?)
            "#,
        )
        .bind(campaign_id)
        .bind(older_than.timestamp_millis())
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(Self::row_to_message).collect()
    }

    async fn upsert_retry_policy(&self, policy: &RetryPolicy) -> Result<()> {
        let window_days = serde_json::to_string(&policy.window_days)?;
        sqlx::query(
            r#"
            INSERT INTO retry_policies (
                campaign_id, enabled, max_attempts, base_delay_seconds,
                batch_size, hourly_cap, windowed_only, window_start_hour,
                window_end_hour, window_days, paused_until, attempted,
                succeeded, failed
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (campaign_id) DO UPDATE SET
                enabled = excluded.enabled,
                max_attempts = excluded.max_attempts,
                base_delay_seconds = excluded.base_delay_seconds,
                batch_size = excluded.batch_size,
                hourly_cap = excluded.hourly_cap,
                windowed_only = excluded.windowed_only,
                window_start_hour = excluded.window_start_hour,
                window_end_hour = excluded.window_end_hour,
                window_days = excluded.window_days,
                paused_until = excluded.paused_until
            "#,
        )
        .bind(&policy.campaign_id)
        .bind(i64::from(policy.enabled))
        .bind(i64::from(policy.max_attempts))
        .bind(policy.base_delay_seconds as i64)
        .bind(i64::from(policy.batch_size))
        .bind(i64::from(policy.hourly_cap))
        .bind(i64::from(policy.windowed_only))
        .bind(i64::from(policy.window_start_hour))
        .bind(i64::from(policy.window_end_hour))
        .bind(window_days)
        .bind(to_ts(policy.paused_until))
        .bind(policy.attempted as i64)
        .bind(policy.succeeded as i64)
        .bind(policy.failed as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_retry_policy(&self, campaign_id: &str) -> Result<Option<RetryPolicy>> {
        let row = sqlx::query("SELECT * FROM retry_policies WHERE campaign_id = ?")
            .bind(campaign_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(Self::row_to_policy).transpose()
    }

    async fn list_enabled_retry_policies(&self) -> Result<Vec<RetryPolicy>> {
        let rows = sqlx::query("SELECT * FROM retry_policies WHERE enabled = 1")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(Self::row_to_policy).collect()
    }

    async fn add_retry_totals(&self, campaign_id: &str, attempted: u64, succeeded: u64, failed: u64) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE retry_policies
            SET attempted = attempted + ?, succeeded = succeeded + ?, failed = failed + ?
            WHERE campaign_id = ?
            "#,
        )
        .bind(attempted as i64)
        .bind(succeeded as i64)
        .bind(failed as i64)
        .bind(campaign_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bl_common::{CampaignConfig, Contact, RetryPolicyConfig};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn create_test_store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        let store = SqliteStore::new(pool);
        store.init_schema().await.unwrap();
        store
    }

    async fn seed(store: &SqliteStore, total: u32) -> Campaign {
        let campaign = Campaign::new("u1", "s1", "test", "Hi {name}", total, CampaignConfig::default());
        store.insert_campaign(&campaign).await.unwrap();
        let messages: Vec<BlastMessage> = (0..total)
            .map(|i| BlastMessage::new(&campaign.id, i, Contact::named(format!("62811{i}"), format!("C{i}")), 3))
            .collect();
        store.insert_messages(&messages).await.unwrap();
        campaign
    }

    #[tokio::test]
    async fn campaign_round_trip() {
        let store = create_test_store().await;
        let campaign = seed(&store, 2).await;

        let loaded = store.get_campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(loaded.name, "test");
        assert_eq!(loaded.total_count, 2);
        assert_eq!(loaded.status, CampaignStatus::Idle);
        assert!(loaded.config.shuffle);
    }

    #[tokio::test]
    async fn reserve_is_a_compare_and_set() {
        let store = create_test_store().await;
        let campaign = seed(&store, 1).await;

        assert!(store.reserve(&campaign.id, 0).await.unwrap());
        assert!(!store.reserve(&campaign.id, 0).await.unwrap());

        let msg = store.get_message(&campaign.id, 0).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Processing);
        assert!(msg.processing_started_at.is_some());
    }

    #[tokio::test]
    async fn list_pending_orders_by_sort_key() {
        let store = create_test_store().await;
        let campaign = seed(&store, 3).await;

        // Move message 0 behind message 2.
        store.reserve(&campaign.id, 0).await.unwrap();
        store.requeue(&campaign.id, 0, 2_500, None, None).await.unwrap();

        let pending = store.list_pending(&campaign.id, Utc::now(), 10).await.unwrap();
        let order: Vec<u32> = pending.iter().map(|m| m.index).collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[tokio::test]
    async fn counters_and_recompute() {
        let store = create_test_store().await;
        let campaign = seed(&store, 3).await;

        store.reserve(&campaign.id, 0).await.unwrap();
        store.mark_sent(&campaign.id, 0, "wamid-0", "Hi C0").await.unwrap();
        store.increment_counters(&campaign.id, 1, 0, 0, 0).await.unwrap();

        store.reserve(&campaign.id, 1).await.unwrap();
        store.mark_skipped(&campaign.id, 1, "not on messenger").await.unwrap();
        store.increment_counters(&campaign.id, 0, 0, 1, 1).await.unwrap();

        let loaded = store.get_campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(loaded.sent_count, 1);
        assert_eq!(loaded.skipped_count, 1);
        assert_eq!(loaded.current_index, 1);

        // Recompute rebuilds the same picture from the message rows.
        store.recompute_counters(&campaign.id).await.unwrap();
        let loaded = store.get_campaign(&campaign.id).await.unwrap().unwrap();
        assert_eq!(loaded.sent_count, 1);
        assert_eq!(loaded.failed_count, 0);
        assert_eq!(loaded.skipped_count, 1);
    }

    #[tokio::test]
    async fn retry_candidates_oldest_first() {
        let store = create_test_store().await;
        let campaign = seed(&store, 2).await;

        for index in [1u32, 0] {
            store.reserve(&campaign.id, index).await.unwrap();
            store.mark_failed(&campaign.id, index, "timeout").await.unwrap();
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }

        let candidates = store
            .find_retry_candidates(&campaign.id, Utc::now() + chrono::Duration::seconds(1), 10)
            .await
            .unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].index, 1); // failed first
        assert_eq!(candidates[1].index, 0);
    }

    #[tokio::test]
    async fn retry_policy_round_trip_and_totals() {
        let store = create_test_store().await;
        let campaign = seed(&store, 1).await;

        let policy = RetryPolicyConfig::default().into_policy(&campaign.id);
        store.upsert_retry_policy(&policy).await.unwrap();
        store.add_retry_totals(&campaign.id, 3, 2, 1).await.unwrap();

        let loaded = store.get_retry_policy(&campaign.id).await.unwrap().unwrap();
        assert!(loaded.enabled);
        assert_eq!(loaded.attempted, 3);
        assert_eq!(loaded.succeeded, 2);
        assert_eq!(loaded.failed, 1);

        assert_eq!(store.list_enabled_retry_policies().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn delete_campaign_removes_children() {
        let store = create_test_store().await;
        let campaign = seed(&store, 2).await;
        let policy = RetryPolicyConfig::default().into_policy(&campaign.id);
        store.upsert_retry_policy(&policy).await.unwrap();

        store.delete_campaign(&campaign.id).await.unwrap();
        assert!(store.get_campaign(&campaign.id).await.unwrap().is_none());
        assert!(store.list_messages(&campaign.id).await.unwrap().is_empty());
        assert!(store.get_retry_policy(&campaign.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_processing_detection() {
        let store = create_test_store().await;
        let campaign = seed(&store, 1).await;

        store.reserve(&campaign.id, 0).await.unwrap();

        let stale = store
            .find_stale_processing(&campaign.id, Utc::now() - chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(stale.is_empty());

        let stale = store
            .find_stale_processing(&campaign.id, Utc::now() + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);
    }
}
