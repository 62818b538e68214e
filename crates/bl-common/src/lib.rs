use std::collections::HashMap;

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};

pub mod logging;

// ============================================================================
// Campaign Types
// ============================================================================

/// Lifecycle status of a blast campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CampaignStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Stopped,
    Error,
}

impl CampaignStatus {
    /// Terminal states permit cleanup and nothing else.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CampaignStatus::Completed | CampaignStatus::Stopped | CampaignStatus::Error
        )
    }

    /// States that survive a process restart and are picked up by recovery.
    pub fn is_live(&self) -> bool {
        matches!(self, CampaignStatus::Running | CampaignStatus::Paused)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CampaignStatus::Idle => "IDLE",
            CampaignStatus::Running => "RUNNING",
            CampaignStatus::Paused => "PAUSED",
            CampaignStatus::Completed => "COMPLETED",
            CampaignStatus::Stopped => "STOPPED",
            CampaignStatus::Error => "ERROR",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "IDLE" => Some(CampaignStatus::Idle),
            "RUNNING" => Some(CampaignStatus::Running),
            "PAUSED" => Some(CampaignStatus::Paused),
            "COMPLETED" => Some(CampaignStatus::Completed),
            "STOPPED" => Some(CampaignStatus::Stopped),
            "ERROR" => Some(CampaignStatus::Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One blast job: a template plus a recipient list, paced through a single
/// messenger session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Campaign {
    pub id: String,
    pub owner_id: String,
    /// The messenger session this campaign sends through. One campaign
    /// references exactly one session.
    pub session_id: String,
    pub name: String,
    pub template: String,
    pub total_count: u32,
    /// Messages delivered successfully.
    pub sent_count: u32,
    /// Messages that exhausted their attempts (terminal failures only).
    pub failed_count: u32,
    /// Messages skipped on a permanent send failure.
    pub skipped_count: u32,
    /// Index of the most recently resolved message.
    pub current_index: u32,
    pub status: CampaignStatus,
    pub config: CampaignConfig,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl Campaign {
    pub fn new(
        owner_id: impl Into<String>,
        session_id: impl Into<String>,
        name: impl Into<String>,
        template: impl Into<String>,
        total_count: u32,
        config: CampaignConfig,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.into(),
            session_id: session_id.into(),
            name: name.into(),
            template: template.into(),
            total_count,
            sent_count: 0,
            failed_count: 0,
            skipped_count: 0,
            current_index: 0,
            status: CampaignStatus::Idle,
            config,
            created_at: Utc::now(),
            started_at: None,
            paused_at: None,
            resumed_at: None,
            completed_at: None,
            stopped_at: None,
            last_error: None,
        }
    }

    /// Derived progress: resolved messages over total, as a percentage.
    pub fn progress_pct(&self) -> f64 {
        if self.total_count == 0 {
            return 0.0;
        }
        let resolved = self.sent_count + self.failed_count + self.skipped_count;
        f64::from(resolved) / f64::from(self.total_count) * 100.0
    }

    pub fn snapshot(&self) -> CampaignSnapshot {
        CampaignSnapshot {
            campaign_id: self.id.clone(),
            name: self.name.clone(),
            status: self.status,
            total_count: self.total_count,
            sent_count: self.sent_count,
            failed_count: self.failed_count,
            skipped_count: self.skipped_count,
            current_index: self.current_index,
            progress_pct: self.progress_pct(),
            created_at: self.created_at,
            started_at: self.started_at,
            paused_at: self.paused_at,
            resumed_at: self.resumed_at,
            completed_at: self.completed_at,
            stopped_at: self.stopped_at,
            last_error: self.last_error.clone(),
        }
    }
}

/// Point-in-time view of a campaign, returned by status queries and carried
/// on `campaign-progress` broadcasts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignSnapshot {
    pub campaign_id: String,
    pub name: String,
    pub status: CampaignStatus,
    pub total_count: u32,
    pub sent_count: u32,
    pub failed_count: u32,
    pub skipped_count: u32,
    pub current_index: u32,
    pub progress_pct: f64,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub paused_at: Option<DateTime<Utc>>,
    pub resumed_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

// ============================================================================
// Message Types
// ============================================================================

/// Per-recipient delivery status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Sent,
    Failed,
    Skipped,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageStatus::Pending => "pending",
            MessageStatus::Processing => "processing",
            MessageStatus::Sent => "sent",
            MessageStatus::Failed => "failed",
            MessageStatus::Skipped => "skipped",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(MessageStatus::Pending),
            "processing" => Some(MessageStatus::Processing),
            "sent" => Some(MessageStatus::Sent),
            "failed" => Some(MessageStatus::Failed),
            "skipped" => Some(MessageStatus::Skipped),
            _ => None,
        }
    }
}

/// One recipient row within a campaign.
///
/// `index` is the immutable identity within the campaign; `sort_key` is the
/// queue position and is the only ordering field a requeue may move.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlastMessage {
    pub campaign_id: String,
    pub index: u32,
    /// Digits only; validated at campaign creation.
    pub phone: String,
    pub contact_name: Option<String>,
    pub variables: HashMap<String, String>,
    /// Populated at send time with the rendered template.
    pub rendered_text: Option<String>,
    pub status: MessageStatus,
    pub attempts: u32,
    pub max_attempts: u32,
    /// Queue ordering position. Initialized to `index * 1000` so a requeue
    /// can land between two neighbours without renumbering.
    pub sort_key: i64,
    pub messenger_message_id: Option<String>,
    pub last_error: Option<String>,
    pub processing_started_at: Option<DateTime<Utc>>,
    pub sent_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub scheduled_at: Option<DateTime<Utc>>,
}

impl BlastMessage {
    pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
    pub const SORT_KEY_STRIDE: i64 = 1000;

    pub fn new(campaign_id: impl Into<String>, index: u32, contact: Contact, max_attempts: u32) -> Self {
        let mut variables = contact.variables;
        if let Some(ref name) = contact.name {
            variables.entry("name".to_string()).or_insert_with(|| name.clone());
        }
        Self {
            campaign_id: campaign_id.into(),
            index,
            phone: contact.phone,
            contact_name: contact.name,
            variables,
            rendered_text: None,
            status: MessageStatus::Pending,
            attempts: 0,
            max_attempts,
            sort_key: i64::from(index) * Self::SORT_KEY_STRIDE,
            messenger_message_id: None,
            last_error: None,
            processing_started_at: None,
            sent_at: None,
            failed_at: None,
            scheduled_at: None,
        }
    }

    /// A failed message that has attempts left may be retried.
    pub fn is_retry_eligible(&self) -> bool {
        self.status == MessageStatus::Failed && self.attempts < self.max_attempts
    }
}

/// One uploaded contact, input to campaign creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub phone: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub variables: HashMap<String, String>,
}

impl Contact {
    pub fn new(phone: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            name: None,
            variables: HashMap::new(),
        }
    }

    pub fn named(phone: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            phone: phone.into(),
            name: Some(name.into()),
            variables: HashMap::new(),
        }
    }
}

/// Returns true when the string is non-empty and contains only ASCII digits.
pub fn is_digits_only(phone: &str) -> bool {
    !phone.is_empty() && phone.bytes().all(|b| b.is_ascii_digit())
}

/// Per-campaign message counts, keyed by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub sent: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl QueueStats {
    /// No work left to schedule or wait on.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.processing == 0
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// Account age bucket driving the pacing defaults. Younger accounts are
/// throttled harder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccountAgeTier {
    New,
    Warming,
    Established,
}

impl AccountAgeTier {
    pub fn from_age_days(days: u32) -> Self {
        match days {
            0..=7 => AccountAgeTier::New,
            8..=30 => AccountAgeTier::Warming,
            _ => AccountAgeTier::Established,
        }
    }
}

impl Default for AccountAgeTier {
    fn default() -> Self {
        AccountAgeTier::New
    }
}

/// Typed campaign configuration. Unknown fields are rejected at the edge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct CampaignConfig {
    pub shuffle: bool,
    pub account_age: AccountAgeTier,
    pub respect_business_hours: bool,
    pub business_hours: Option<BusinessHoursConfig>,
    pub pacing: Option<PacingOverrides>,
    pub chaos: Option<ChaosOverrides>,
    pub skip_phone_validation: bool,
    /// Resume automatically when the messenger session reconnects after a
    /// disconnect-triggered pause.
    pub auto_resume: bool,
    pub retry_policy: Option<RetryPolicyConfig>,
    pub health_thresholds: Option<HealthThresholds>,
}

impl Default for CampaignConfig {
    fn default() -> Self {
        Self {
            shuffle: true,
            account_age: AccountAgeTier::New,
            respect_business_hours: true,
            business_hours: None,
            pacing: None,
            chaos: None,
            skip_phone_validation: false,
            auto_resume: false,
            retry_policy: None,
            health_thresholds: None,
        }
    }
}

/// Business window overrides. Hours are local wall-clock, 0-23; the window
/// is `[start_hour, end_hour)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct BusinessHoursConfig {
    pub start_hour: u8,
    pub end_hour: u8,
    pub lunch_start: Option<u8>,
    pub lunch_end: Option<u8>,
    pub exclude_weekends: bool,
}

impl Default for BusinessHoursConfig {
    fn default() -> Self {
        Self {
            start_hour: 9,
            end_hour: 17,
            lunch_start: Some(12),
            lunch_end: Some(13),
            exclude_weekends: true,
        }
    }
}

/// Per-campaign overrides for the tier-derived pacing parameters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct PacingOverrides {
    pub delay_min_secs: Option<u64>,
    pub delay_max_secs: Option<u64>,
    pub rest_threshold: Option<u32>,
    pub rest_min_mins: Option<u64>,
    pub rest_max_mins: Option<u64>,
    pub daily_cap_min: Option<u32>,
    pub daily_cap_max: Option<u32>,
}

/// Overrides for the human-simulation dice rolls. Probabilities are 0.0-1.0.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct ChaosOverrides {
    pub distraction_prob: Option<f64>,
    pub app_switch_prob: Option<f64>,
    pub long_break_prob: Option<f64>,
    pub typo_prob: Option<f64>,
    pub hesitation_min_ms: Option<u64>,
    pub hesitation_max_ms: Option<u64>,
    /// Scales the typing delay; 0.0 disables it.
    pub typing_factor: Option<f64>,
}

impl ChaosOverrides {
    /// Everything zeroed: no chaos pauses, no typing simulation.
    pub fn disabled() -> Self {
        Self {
            distraction_prob: Some(0.0),
            app_switch_prob: Some(0.0),
            long_break_prob: Some(0.0),
            typo_prob: Some(0.0),
            hesitation_min_ms: Some(0),
            hesitation_max_ms: Some(0),
            typing_factor: Some(0.0),
        }
    }
}

/// Health-monitor trip points.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct HealthThresholds {
    /// Ban rate that raises a warning alert (with at least `min_sample`
    /// outcomes observed).
    pub warn_ban_rate: f64,
    /// Ban rate that requests an auto-pause.
    pub pause_ban_rate: f64,
    pub warn_consec_fail: u32,
    pub pause_consec_fail: u32,
    pub min_sample: u32,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            warn_ban_rate: 0.03,
            pause_ban_rate: 0.05,
            warn_consec_fail: 10,
            pause_consec_fail: 15,
            min_sample: 20,
        }
    }
}

// ============================================================================
// Retry Policy Types
// ============================================================================

/// Persisted retry rules, at most one per campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub campaign_id: String,
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
    pub batch_size: u32,
    pub hourly_cap: u32,
    pub windowed_only: bool,
    pub window_start_hour: u8,
    pub window_end_hour: u8,
    pub window_days: Vec<Weekday>,
    pub paused_until: Option<DateTime<Utc>>,
    pub attempted: u64,
    pub succeeded: u64,
    pub failed: u64,
}

impl RetryPolicy {
    /// Retry may fire only while not explicitly paused.
    pub fn is_paused(&self, now: DateTime<Utc>) -> bool {
        self.paused_until.map(|until| until > now).unwrap_or(false)
    }
}

/// Input record for the retry policy, with defaults for every field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RetryPolicyConfig {
    pub enabled: bool,
    pub max_attempts: u32,
    pub base_delay_seconds: u64,
    pub batch_size: u32,
    pub hourly_cap: u32,
    pub windowed_only: bool,
    pub window_start_hour: u8,
    pub window_end_hour: u8,
    pub window_days: Vec<Weekday>,
    pub paused_until: Option<DateTime<Utc>>,
}

impl Default for RetryPolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_attempts: BlastMessage::DEFAULT_MAX_ATTEMPTS,
            base_delay_seconds: 300,
            batch_size: 10,
            hourly_cap: 30,
            windowed_only: false,
            window_start_hour: 9,
            window_end_hour: 17,
            window_days: vec![
                Weekday::Mon,
                Weekday::Tue,
                Weekday::Wed,
                Weekday::Thu,
                Weekday::Fri,
            ],
            paused_until: None,
        }
    }
}

impl RetryPolicyConfig {
    pub fn into_policy(self, campaign_id: impl Into<String>) -> RetryPolicy {
        RetryPolicy {
            campaign_id: campaign_id.into(),
            enabled: self.enabled,
            max_attempts: self.max_attempts,
            base_delay_seconds: self.base_delay_seconds,
            batch_size: self.batch_size,
            hourly_cap: self.hourly_cap,
            windowed_only: self.windowed_only,
            window_start_hour: self.window_start_hour,
            window_end_hour: self.window_end_hour,
            window_days: self.window_days,
            paused_until: self.paused_until,
            attempted: 0,
            succeeded: 0,
            failed: 0,
        }
    }
}

// ============================================================================
// Send Outcome Types
// ============================================================================

/// Classification of a single messenger send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SendResult {
    /// Delivered; a messenger message id was assigned.
    Sent,
    /// Timeout, disconnect or other recoverable failure; retry-eligible.
    Transient,
    /// Number not on the platform, blocked, forbidden; never retried.
    Permanent,
    /// Throttled by the messenger; requeued without burning the attempt
    /// budget into a terminal failure.
    RateLimited,
}

/// Outcome of one messenger send attempt.
#[derive(Debug, Clone)]
pub struct SendOutcome {
    pub result: SendResult,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

impl SendOutcome {
    pub fn sent(message_id: impl Into<String>) -> Self {
        Self {
            result: SendResult::Sent,
            message_id: Some(message_id.into()),
            error: None,
        }
    }

    pub fn transient(error: impl Into<String>) -> Self {
        Self {
            result: SendResult::Transient,
            message_id: None,
            error: Some(error.into()),
        }
    }

    pub fn permanent(error: impl Into<String>) -> Self {
        Self {
            result: SendResult::Permanent,
            message_id: None,
            error: Some(error.into()),
        }
    }

    pub fn rate_limited(error: impl Into<String>) -> Self {
        Self {
            result: SendResult::RateLimited,
            message_id: None,
            error: Some(error.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result == SendResult::Sent
    }
}

/// Connection events published by a messenger session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Disconnected,
}

// ============================================================================
// Alert & Broadcast Types
// ============================================================================

/// Broadcast event names, one room per user.
pub const EVENT_SESSIONS_UPDATE: &str = "sessions-update";
pub const EVENT_CAMPAIGN_PROGRESS: &str = "campaign-progress";
pub const EVENT_CAMPAIGN_ALERT: &str = "campaign-alert";
pub const EVENT_NOTIFICATION: &str = "notification";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlertSeverity {
    Info,
    Warn,
    Critical,
}

/// An operational alert tied to one campaign (health trips, auto-pause,
/// session loss).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CampaignAlert {
    pub id: String,
    pub campaign_id: String,
    pub severity: AlertSeverity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl CampaignAlert {
    pub fn new(campaign_id: impl Into<String>, severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            campaign_id: campaign_id.into(),
            severity,
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

// ============================================================================
// Validation Report Types
// ============================================================================

/// Per-number result of a validation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationDetail {
    pub index: u32,
    pub phone: String,
    pub exists: bool,
    pub error: Option<String>,
}

/// Aggregate result of validating a campaign's pending numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub total: u32,
    pub valid: u32,
    pub invalid: u32,
    pub details: Vec<ValidationDetail>,
    pub recommendation: String,
}

impl ValidationReport {
    pub fn empty() -> Self {
        Self {
            total: 0,
            valid: 0,
            invalid: 0,
            details: Vec::new(),
            recommendation: "skipped".to_string(),
        }
    }

    pub fn valid_rate(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        f64::from(self.valid) / f64::from(self.total)
    }

    pub fn recommendation_for(valid_rate: f64) -> &'static str {
        if valid_rate < 0.5 {
            "warning: less than half of the list is reachable, review the source"
        } else if valid_rate < 0.8 {
            "caution: a noticeable share of the list is unreachable"
        } else {
            "good"
        }
    }
}
