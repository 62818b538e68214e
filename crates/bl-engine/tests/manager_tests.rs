//! Campaign manager integration tests
//!
//! Drives the whole engine against an in-memory store and a scripted
//! messenger: lifecycle transitions, the execution loop end to end,
//! health auto-pause, business-hours gating, session loss and recovery.
//! Paused tokio time makes every pacing sleep virtual.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, NaiveDateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::broadcast;

use bl_common::{
    AccountAgeTier, AlertSeverity, BlastMessage, Campaign, CampaignConfig, CampaignSnapshot,
    CampaignStatus, ChaosOverrides, Contact, HealthThresholds, MessageStatus, PacingOverrides,
    RetryPolicyConfig, SendOutcome, SessionEvent,
};
use bl_engine::{
    CampaignManager, EngineError, ManualClock, Messenger, NoopBroadcaster, SESSION_LOST_REASON,
};
use bl_store::{CampaignStore, MemoryStore};

/// Scriptable messenger: per-phone outcome queues, falling back to success.
struct MockMessenger {
    scripted: Mutex<HashMap<String, VecDeque<SendOutcome>>>,
    sends: Mutex<Vec<(String, String)>>,
    lookups: Mutex<Vec<String>>,
    invalid: Mutex<HashSet<String>>,
    events: broadcast::Sender<SessionEvent>,
    counter: AtomicU64,
}

impl MockMessenger {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            scripted: Mutex::new(HashMap::new()),
            sends: Mutex::new(Vec::new()),
            lookups: Mutex::new(Vec::new()),
            invalid: Mutex::new(HashSet::new()),
            events,
            counter: AtomicU64::new(0),
        })
    }

    fn script(&self, phone: &str, outcomes: Vec<SendOutcome>) {
        self.scripted
            .lock()
            .insert(phone.to_string(), outcomes.into());
    }

    fn sends(&self) -> Vec<(String, String)> {
        self.sends.lock().clone()
    }

    fn send_count(&self) -> usize {
        self.sends.lock().len()
    }

    fn lookups(&self) -> Vec<String> {
        self.lookups.lock().clone()
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send(&self, _session_id: &str, phone: &str, text: &str) -> SendOutcome {
        self.sends.lock().push((phone.to_string(), text.to_string()));
        if let Some(queue) = self.scripted.lock().get_mut(phone) {
            if let Some(outcome) = queue.pop_front() {
                return outcome;
            }
        }
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        SendOutcome::sent(format!("wamid-{n}"))
    }

    async fn lookup(&self, _session_id: &str, phone: &str) -> bl_engine::Result<bool> {
        self.lookups.lock().push(phone.to_string());
        Ok(!self.invalid.lock().contains(phone))
    }

    fn subscribe(&self, _session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

/// Config with every delay zeroed so a campaign runs as fast as the store.
fn fast_config() -> CampaignConfig {
    CampaignConfig {
        shuffle: false,
        account_age: AccountAgeTier::Established,
        respect_business_hours: false,
        pacing: Some(PacingOverrides {
            delay_min_secs: Some(0),
            delay_max_secs: Some(0),
            rest_threshold: Some(10_000),
            daily_cap_min: Some(100_000),
            daily_cap_max: Some(100_000),
            ..PacingOverrides::default()
        }),
        chaos: Some(ChaosOverrides::disabled()),
        skip_phone_validation: true,
        ..CampaignConfig::default()
    }
}

fn engine() -> (Arc<MemoryStore>, Arc<MockMessenger>, CampaignManager) {
    let store = Arc::new(MemoryStore::new());
    let messenger = MockMessenger::new();
    let manager = CampaignManager::new(store.clone(), messenger.clone(), Arc::new(NoopBroadcaster))
        .with_rng_seed(7)
        .with_shutdown_grace(Duration::from_secs(5));
    (store, messenger, manager)
}

async fn wait_for_status(
    manager: &CampaignManager,
    campaign_id: &str,
    status: CampaignStatus,
) -> CampaignSnapshot {
    for _ in 0..10_000 {
        let snapshot = manager.status(campaign_id).await.unwrap();
        if snapshot.status == status {
            return snapshot;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("campaign never reached {status:?}");
}

fn monday(hour: u32, minute: u32) -> NaiveDateTime {
    // 2026-03-02 is a Monday.
    NaiveDate::from_ymd_opt(2026, 3, 2)
        .unwrap()
        .and_hms_opt(hour, minute, 0)
        .unwrap()
}

// ---------------------------------------------------------------------------
// Creation and transition rules
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_rejects_empty_contact_list() {
    let (_store, _messenger, manager) = engine();
    let err = manager
        .create("u1", "s1", "empty", "Hi", vec![], fast_config())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn create_rejects_non_digit_phone() {
    let (_store, _messenger, manager) = engine();
    let err = manager
        .create(
            "u1",
            "s1",
            "bad",
            "Hi",
            vec![Contact::new("+628111")],
            fast_config(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test(start_paused = true)]
async fn illegal_transitions_fail_with_typed_errors() {
    let (_store, _messenger, manager) = engine();
    let id = manager
        .create("u1", "s1", "t", "Hi", vec![Contact::new("628111")], fast_config())
        .await
        .unwrap();

    // Pause and resume require a live loop.
    assert!(matches!(
        manager.pause(&id).await.unwrap_err(),
        EngineError::InvalidTransition { from: CampaignStatus::Idle, .. }
    ));
    assert!(matches!(
        manager.resume(&id).await.unwrap_err(),
        EngineError::InvalidTransition { from: CampaignStatus::Idle, .. }
    ));
    // Cleanup is terminal-only.
    assert!(matches!(
        manager.cleanup(&id).await.unwrap_err(),
        EngineError::NotTerminal(CampaignStatus::Idle)
    ));

    manager.start(&id).await.unwrap();
    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Completed).await;
    assert_eq!(snapshot.progress_pct, 100.0);

    // A finished campaign cannot start, pause or stop.
    assert!(matches!(
        manager.start(&id).await.unwrap_err(),
        EngineError::InvalidTransition { from: CampaignStatus::Completed, .. }
    ));
    assert!(matches!(
        manager.stop(&id).await.unwrap_err(),
        EngineError::InvalidTransition { from: CampaignStatus::Completed, .. }
    ));

    // Cleanup now works, and the campaign is gone.
    manager.cleanup(&id).await.unwrap();
    assert!(matches!(
        manager.status(&id).await.unwrap_err(),
        EngineError::CampaignNotFound(_)
    ));
}

#[tokio::test(start_paused = true)]
async fn unknown_campaign_is_a_typed_error() {
    let (_store, _messenger, manager) = engine();
    assert!(matches!(
        manager.start("nope").await.unwrap_err(),
        EngineError::CampaignNotFound(_)
    ));
}

// ---------------------------------------------------------------------------
// End-to-end scenarios
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn happy_path_two_contacts_in_order() {
    let (_store, messenger, manager) = engine();

    let mut config = fast_config();
    config.skip_phone_validation = false; // validation on, all numbers valid

    let id = manager
        .create(
            "u1",
            "s1",
            "happy",
            "Hi {name}",
            vec![Contact::named("628111", "A"), Contact::named("628222", "B")],
            config,
        )
        .await
        .unwrap();
    manager.start(&id).await.unwrap();

    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Completed).await;
    assert_eq!(snapshot.sent_count, 2);
    assert_eq!(snapshot.failed_count, 0);
    assert_eq!(snapshot.skipped_count, 0);
    assert_eq!(snapshot.progress_pct, 100.0);

    assert_eq!(
        messenger.sends(),
        vec![
            ("628111".to_string(), "Hi A".to_string()),
            ("628222".to_string(), "Hi B".to_string()),
        ]
    );
    // One validation pass, sequential, before any send.
    assert_eq!(messenger.lookups(), vec!["628111".to_string(), "628222".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn permanent_failure_skips_the_message() {
    let (store, messenger, manager) = engine();
    messenger.script("628111", vec![SendOutcome::permanent("blocked")]);

    let id = manager
        .create("u1", "s1", "perm", "Hi", vec![Contact::new("628111")], fast_config())
        .await
        .unwrap();
    manager.start(&id).await.unwrap();

    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Completed).await;
    assert_eq!(snapshot.sent_count, 0);
    assert_eq!(snapshot.failed_count, 0);
    assert_eq!(snapshot.skipped_count, 1);

    let msg = store.get_message(&id, 0).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Skipped);
    // Exactly one attempt: permanent failures are never retried.
    assert_eq!(messenger.send_count(), 1);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_recover_within_attempt_budget() {
    let (store, messenger, manager) = engine();
    messenger.script(
        "628111",
        vec![
            SendOutcome::transient("timeout"),
            SendOutcome::transient("timeout"),
        ],
    );

    let mut config = fast_config();
    config.retry_policy = Some(RetryPolicyConfig {
        enabled: false, // in-loop requeue path
        max_attempts: 3,
        ..RetryPolicyConfig::default()
    });

    let id = manager
        .create("u1", "s1", "transient", "Hi", vec![Contact::new("628111")], config)
        .await
        .unwrap();
    manager.start(&id).await.unwrap();

    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Completed).await;
    assert_eq!(snapshot.sent_count, 1);
    assert_eq!(snapshot.failed_count, 0);

    let msg = store.get_message(&id, 0).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Sent);
    assert_eq!(msg.attempts, 3);
    assert_eq!(messenger.send_count(), 3);
}

#[tokio::test(start_paused = true)]
async fn max_attempts_zero_makes_transient_failures_terminal() {
    let (store, messenger, manager) = engine();
    messenger.script("628111", vec![SendOutcome::transient("timeout")]);

    let mut config = fast_config();
    config.retry_policy = Some(RetryPolicyConfig {
        enabled: false,
        max_attempts: 0,
        ..RetryPolicyConfig::default()
    });

    let id = manager
        .create("u1", "s1", "zero", "Hi", vec![Contact::new("628111")], config)
        .await
        .unwrap();
    manager.start(&id).await.unwrap();

    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Completed).await;
    assert_eq!(snapshot.failed_count, 1);
    assert_eq!(messenger.send_count(), 1);

    let msg = store.get_message(&id, 0).await.unwrap().unwrap();
    assert_eq!(msg.status, MessageStatus::Failed);
    assert!(!msg.is_retry_eligible());
}

#[tokio::test(start_paused = true)]
async fn ban_rate_requests_auto_pause() {
    let (_store, messenger, manager) = engine();
    // Every send fails transiently.
    for i in 0..50 {
        messenger.script(
            &format!("62811{i:02}"),
            vec![SendOutcome::transient("timeout"); 5],
        );
    }

    let mut config = fast_config();
    config.health_thresholds = Some(HealthThresholds {
        pause_ban_rate: 0.05,
        min_sample: 5,
        pause_consec_fail: 1_000,
        warn_consec_fail: 999,
        ..HealthThresholds::default()
    });

    let contacts: Vec<Contact> = (0..50).map(|i| Contact::new(format!("62811{i:02}"))).collect();
    let id = manager
        .create("u1", "s1", "banned", "Hi", contacts, config)
        .await
        .unwrap();
    manager.start(&id).await.unwrap();

    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Paused).await;
    assert!(snapshot.last_error.as_deref().unwrap_or_default().contains("health"));

    // The pause is observed at the supervision point right after the
    // fifth outcome; nothing further is dequeued.
    let frozen = messenger.send_count();
    assert_eq!(frozen, 5);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(messenger.send_count(), frozen);

    // The auto-pause landed in the campaign's alert ring.
    let alerts = manager.alerts(&id);
    assert!(alerts
        .iter()
        .any(|a| a.severity == AlertSeverity::Critical && a.message.contains("health")));
}

#[tokio::test(start_paused = true)]
async fn business_hours_gate_sleeps_until_open() {
    let store = Arc::new(MemoryStore::new());
    let messenger = MockMessenger::new();
    let clock = Arc::new(ManualClock::new(monday(2, 0)));
    let manager = CampaignManager::new(store.clone(), messenger.clone(), Arc::new(NoopBroadcaster))
        .with_clock(clock.clone())
        .with_rng_seed(7)
        .with_shutdown_grace(Duration::from_secs(5));

    let mut config = fast_config();
    config.respect_business_hours = true;

    let id = manager
        .create(
            "u1",
            "s1",
            "gated",
            "Hi {name}",
            vec![Contact::named("628111", "A"), Contact::named("628222", "B")],
            config,
        )
        .await
        .unwrap();
    manager.start(&id).await.unwrap();

    // 02:00 local: the loop must sleep, not send and not transition.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(messenger.send_count(), 0);
    assert_eq!(
        manager.status(&id).await.unwrap().status,
        CampaignStatus::Running
    );

    // The window opens; the pending sleep runs out and sends resume.
    clock.set(monday(9, 5));
    tokio::time::advance(Duration::from_secs(8 * 3600)).await;

    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Completed).await;
    assert_eq!(snapshot.sent_count, 2);
    assert_eq!(messenger.send_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn force_start_bypasses_window_and_validation() {
    let store = Arc::new(MemoryStore::new());
    let messenger = MockMessenger::new();
    let clock = Arc::new(ManualClock::new(monday(2, 0)));
    let manager = CampaignManager::new(store.clone(), messenger.clone(), Arc::new(NoopBroadcaster))
        .with_clock(clock.clone())
        .with_rng_seed(7)
        .with_shutdown_grace(Duration::from_secs(5));

    let mut config = fast_config();
    config.respect_business_hours = true;
    config.skip_phone_validation = false;

    let id = manager
        .create(
            "u1",
            "s1",
            "forced",
            "Hi {name}",
            vec![Contact::named("628111", "A")],
            config,
        )
        .await
        .unwrap();
    manager.force_start(&id).await.unwrap();

    // Sends happen at 02:00 and the validation pass was skipped entirely.
    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Completed).await;
    assert_eq!(snapshot.sent_count, 1);
    assert!(messenger.lookups().is_empty());
}

// ---------------------------------------------------------------------------
// Pause / resume / stop
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn pause_preserves_queue_and_resume_finishes() {
    let (store, messenger, manager) = engine();

    let mut config = fast_config();
    config.pacing = Some(PacingOverrides {
        delay_min_secs: Some(1),
        delay_max_secs: Some(1),
        rest_threshold: Some(10_000),
        ..PacingOverrides::default()
    });

    let contacts: Vec<Contact> = (0..5)
        .map(|i| Contact::named(format!("62811{i}"), format!("C{i}")))
        .collect();
    let id = manager
        .create("u1", "s1", "pausable", "Hi {name}", contacts, config)
        .await
        .unwrap();
    manager.start(&id).await.unwrap();

    // Let a couple of sends land, then pause.
    tokio::time::sleep(Duration::from_millis(1_500)).await;
    manager.pause(&id).await.unwrap();

    let paused = manager.status(&id).await.unwrap();
    assert_eq!(paused.status, CampaignStatus::Paused);
    let at_pause = messenger.send_count();
    assert!(at_pause >= 1 && at_pause < 5);

    // No message is left reserved and nothing new goes out while paused.
    let stats = store.message_stats(&id).await.unwrap();
    assert_eq!(stats.processing, 0);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(messenger.send_count(), at_pause);

    manager.resume(&id).await.unwrap();
    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Completed).await;

    // Interrupted runs converge to the same final counters.
    assert_eq!(snapshot.sent_count, 5);
    assert_eq!(snapshot.failed_count, 0);
    assert_eq!(snapshot.skipped_count, 0);
    assert_eq!(snapshot.progress_pct, 100.0);
}

#[tokio::test(start_paused = true)]
async fn stop_halts_and_allows_restart() {
    let (_store, messenger, manager) = engine();

    let mut config = fast_config();
    config.pacing = Some(PacingOverrides {
        delay_min_secs: Some(1),
        delay_max_secs: Some(1),
        rest_threshold: Some(10_000),
        ..PacingOverrides::default()
    });

    let contacts: Vec<Contact> = (0..4).map(|i| Contact::new(format!("62811{i}"))).collect();
    let id = manager
        .create("u1", "s1", "stoppable", "Hi", contacts, config)
        .await
        .unwrap();
    manager.start(&id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(1_200)).await;
    manager.stop(&id).await.unwrap();
    assert_eq!(
        manager.status(&id).await.unwrap().status,
        CampaignStatus::Stopped
    );

    // STOPPED → RUNNING is legal; the queue was preserved, so the rest of
    // the contacts still go out exactly once each.
    manager.start(&id).await.unwrap();
    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Completed).await;
    assert_eq!(snapshot.sent_count, 4);
    assert_eq!(messenger.send_count(), 4);
}

// ---------------------------------------------------------------------------
// Session events
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn session_disconnect_pauses_bound_campaigns() {
    let (_store, messenger, manager) = engine();

    let mut config = fast_config();
    config.pacing = Some(PacingOverrides {
        delay_min_secs: Some(5),
        delay_max_secs: Some(5),
        rest_threshold: Some(10_000),
        ..PacingOverrides::default()
    });

    let contacts: Vec<Contact> = (0..10).map(|i| Contact::new(format!("62811{i}"))).collect();
    let id = manager
        .create("u1", "s1", "bound", "Hi", contacts, config)
        .await
        .unwrap();
    manager.start(&id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    messenger.emit(SessionEvent::Disconnected);

    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Paused).await;
    assert_eq!(snapshot.last_error.as_deref(), Some(SESSION_LOST_REASON));

    // Reconnect without autoResume: stays paused until explicit resume.
    messenger.emit(SessionEvent::Connected);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(
        manager.status(&id).await.unwrap().status,
        CampaignStatus::Paused
    );

    manager.resume(&id).await.unwrap();
    wait_for_status(&manager, &id, CampaignStatus::Completed).await;
}

#[tokio::test(start_paused = true)]
async fn session_reconnect_auto_resumes_opted_in_campaigns() {
    let (_store, messenger, manager) = engine();

    let mut config = fast_config();
    config.auto_resume = true;
    config.pacing = Some(PacingOverrides {
        delay_min_secs: Some(5),
        delay_max_secs: Some(5),
        rest_threshold: Some(10_000),
        ..PacingOverrides::default()
    });

    let contacts: Vec<Contact> = (0..6).map(|i| Contact::new(format!("62811{i}"))).collect();
    let id = manager
        .create("u1", "s1", "auto", "Hi", contacts, config)
        .await
        .unwrap();
    manager.start(&id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    messenger.emit(SessionEvent::Disconnected);
    wait_for_status(&manager, &id, CampaignStatus::Paused).await;

    messenger.emit(SessionEvent::Connected);
    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Completed).await;
    assert_eq!(snapshot.sent_count, 6);
}

// ---------------------------------------------------------------------------
// Recovery
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn recover_respawns_running_campaigns_and_reconciles_zombies() {
    let (store, _messenger, manager) = engine();

    // A campaign left RUNNING by a dead process.
    let mut campaign = Campaign::new("u1", "s1", "orphan", "Hi {name}", 3, fast_config());
    campaign.status = CampaignStatus::Running;
    campaign.started_at = Some(Utc::now());
    store.insert_campaign(&campaign).await.unwrap();

    let mut messages: Vec<BlastMessage> = (0..3)
        .map(|i| BlastMessage::new(&campaign.id, i, Contact::named(format!("62811{i}"), format!("C{i}")), 3))
        .collect();
    // Zombie: reserved five minutes ago, no outcome recorded.
    messages[0].status = MessageStatus::Processing;
    messages[0].processing_started_at = Some(Utc::now() - chrono::Duration::seconds(300));
    // Partially persisted success: the messenger id survived the crash.
    messages[1].status = MessageStatus::Processing;
    messages[1].processing_started_at = Some(Utc::now() - chrono::Duration::seconds(300));
    messages[1].messenger_message_id = Some("wamid-lost".to_string());
    messages[1].rendered_text = Some("Hi C1".to_string());
    store.insert_messages(&messages).await.unwrap();

    let report = manager.recover(None).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.respawned, 1);
    assert_eq!(report.reconciled_messages, 2);

    // A second pass is a no-op: the loop is already registered.
    let second = manager.recover(None).await.unwrap();
    assert_eq!(second.respawned, 0);
    assert_eq!(second.reconciled_messages, 0);

    let snapshot = wait_for_status(&manager, &campaign.id, CampaignStatus::Completed).await;
    assert_eq!(snapshot.sent_count, 3);
    assert_eq!(snapshot.progress_pct, 100.0);

    // The deduped message kept its original messenger id.
    let deduped = store.get_message(&campaign.id, 1).await.unwrap().unwrap();
    assert_eq!(deduped.messenger_message_id.as_deref(), Some("wamid-lost"));
}

#[tokio::test(start_paused = true)]
async fn recover_scopes_to_owner_when_given() {
    let (store, _messenger, manager) = engine();

    for owner in ["alice", "bob"] {
        let mut campaign = Campaign::new(owner, "s1", "mine", "Hi", 1, fast_config());
        campaign.status = CampaignStatus::Running;
        store.insert_campaign(&campaign).await.unwrap();
        store
            .insert_messages(&[BlastMessage::new(&campaign.id, 0, Contact::new("628111"), 3)])
            .await
            .unwrap();
    }

    let report = manager.recover(Some("alice")).await.unwrap();
    assert_eq!(report.scanned, 1);
    assert_eq!(report.respawned, 1);
    assert_eq!(manager.active_loop_count(), 1);
}

// ---------------------------------------------------------------------------
// Validation effects
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn invalid_numbers_fail_at_validation_and_are_never_sent() {
    let (store, messenger, manager) = engine();
    messenger.invalid.lock().insert("628999".to_string());

    let mut config = fast_config();
    config.skip_phone_validation = false;

    let id = manager
        .create(
            "u1",
            "s1",
            "mixed",
            "Hi {name}",
            vec![
                Contact::named("628111", "A"),
                Contact::named("628999", "X"),
                Contact::named("628222", "B"),
            ],
            config,
        )
        .await
        .unwrap();
    manager.start(&id).await.unwrap();

    let snapshot = wait_for_status(&manager, &id, CampaignStatus::Completed).await;
    assert_eq!(snapshot.sent_count, 2);
    assert_eq!(snapshot.failed_count, 1);

    let failed = store.get_message(&id, 1).await.unwrap().unwrap();
    assert_eq!(failed.status, MessageStatus::Failed);
    assert_eq!(failed.last_error.as_deref(), Some("not on messenger"));
    assert!(!failed.is_retry_eligible());

    // The invalid number never saw a send.
    assert!(messenger.sends().iter().all(|(phone, _)| phone != "628999"));
}
