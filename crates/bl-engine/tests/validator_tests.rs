//! Phone validator tests
//!
//! The sequential spacing is the core property here: between any two
//! lookups on the same campaign at least three seconds must pass. Paused
//! tokio time makes the gaps observable without waiting them out.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;

use bl_common::{
    BlastMessage, Campaign, CampaignConfig, Contact, MessageStatus, SendOutcome, SessionEvent,
};
use bl_engine::{LoopControl, Messenger, PhoneValidator};
use bl_store::{CampaignStore, MemoryStore};

struct MockMessenger {
    lookup_times: Mutex<Vec<(String, Instant)>>,
    invalid: Mutex<HashSet<String>>,
    events: broadcast::Sender<SessionEvent>,
}

impl MockMessenger {
    fn new() -> Arc<Self> {
        let (events, _) = broadcast::channel(16);
        Arc::new(Self {
            lookup_times: Mutex::new(Vec::new()),
            invalid: Mutex::new(HashSet::new()),
            events,
        })
    }

    fn mark_invalid(&self, phone: &str) {
        self.invalid.lock().insert(phone.to_string());
    }

    fn lookup_times(&self) -> Vec<(String, Instant)> {
        self.lookup_times.lock().clone()
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send(&self, _session_id: &str, _phone: &str, _text: &str) -> SendOutcome {
        SendOutcome::sent("wamid-unused")
    }

    async fn lookup(&self, _session_id: &str, phone: &str) -> bl_engine::Result<bool> {
        self.lookup_times.lock().push((phone.to_string(), Instant::now()));
        Ok(!self.invalid.lock().contains(phone))
    }

    fn subscribe(&self, _session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

async fn seed_campaign(store: &MemoryStore, total: u32) -> Campaign {
    let campaign = Campaign::new("u1", "s1", "validate", "Hi", total, CampaignConfig::default());
    store.insert_campaign(&campaign).await.unwrap();
    let messages: Vec<BlastMessage> = (0..total)
        .map(|i| BlastMessage::new(&campaign.id, i, Contact::new(format!("62811{i:02}")), 3))
        .collect();
    store.insert_messages(&messages).await.unwrap();
    campaign
}

#[tokio::test(start_paused = true)]
async fn lookups_are_sequential_with_minimum_spacing() {
    let store = Arc::new(MemoryStore::new());
    let messenger = MockMessenger::new();
    let campaign = seed_campaign(&store, 5).await;

    let validator = PhoneValidator::with_seed(store.clone(), messenger.clone(), 3);
    let (_tx, rx) = watch::channel(LoopControl::Run);
    let report = validator.validate(&campaign, false, rx).await.unwrap();

    assert_eq!(report.total, 5);
    assert_eq!(report.valid, 5);

    let times = messenger.lookup_times();
    assert_eq!(times.len(), 5);
    // Strict ordering and at least 3 seconds between consecutive lookups.
    for pair in times.windows(2) {
        let gap = pair[1].1 - pair[0].1;
        assert!(gap >= Duration::from_secs(3), "gap was {gap:?}");
        assert!(gap <= Duration::from_secs(6), "gap was {gap:?}");
    }
}

#[tokio::test(start_paused = true)]
async fn invalid_numbers_are_persisted_as_terminal_failures() {
    let store = Arc::new(MemoryStore::new());
    let messenger = MockMessenger::new();
    let campaign = seed_campaign(&store, 4).await;
    messenger.mark_invalid("6281101");
    messenger.mark_invalid("6281103");

    let validator = PhoneValidator::with_seed(store.clone(), messenger.clone(), 3);
    let (_tx, rx) = watch::channel(LoopControl::Run);
    let report = validator.validate(&campaign, false, rx).await.unwrap();

    assert_eq!(report.total, 4);
    assert_eq!(report.valid, 2);
    assert_eq!(report.invalid, 2);
    // 50% valid is below the caution threshold but at the warning edge.
    assert!(report.recommendation.starts_with("caution"));

    for index in [1u32, 3] {
        let msg = store.get_message(&campaign.id, index).await.unwrap().unwrap();
        assert_eq!(msg.status, MessageStatus::Failed);
        assert_eq!(msg.last_error.as_deref(), Some("not on messenger"));
        assert!(!msg.is_retry_eligible());
    }

    let loaded = store.get_campaign(&campaign.id).await.unwrap().unwrap();
    assert_eq!(loaded.failed_count, 2);
}

#[tokio::test(start_paused = true)]
async fn low_valid_rate_recommends_warning() {
    let store = Arc::new(MemoryStore::new());
    let messenger = MockMessenger::new();
    let campaign = seed_campaign(&store, 10).await;
    for i in 0..6 {
        messenger.mark_invalid(&format!("62811{i:02}"));
    }

    let validator = PhoneValidator::with_seed(store.clone(), messenger.clone(), 3);
    let (_tx, rx) = watch::channel(LoopControl::Run);
    let report = validator.validate(&campaign, false, rx).await.unwrap();

    assert_eq!(report.invalid, 6);
    assert!(report.recommendation.starts_with("warning"));
}

#[tokio::test(start_paused = true)]
async fn skip_returns_an_empty_report() {
    let store = Arc::new(MemoryStore::new());
    let messenger = MockMessenger::new();
    let campaign = seed_campaign(&store, 3).await;

    let validator = PhoneValidator::with_seed(store.clone(), messenger.clone(), 3);
    let (_tx, rx) = watch::channel(LoopControl::Run);
    let report = validator.validate(&campaign, true, rx).await.unwrap();

    assert_eq!(report.total, 0);
    assert!(messenger.lookup_times().is_empty());
}

#[tokio::test(start_paused = true)]
async fn control_signal_ends_the_pass_early() {
    let store = Arc::new(MemoryStore::new());
    let messenger = MockMessenger::new();
    let campaign = seed_campaign(&store, 5).await;

    let validator = PhoneValidator::with_seed(store.clone(), messenger.clone(), 3);
    let (tx, rx) = watch::channel(LoopControl::Run);
    // The signal is already pending when the first inter-lookup gap starts.
    tx.send(LoopControl::Pause).unwrap();

    let report = validator.validate(&campaign, false, rx).await.unwrap();
    // The first lookup runs before any gap; the interrupted gap ends the pass.
    assert_eq!(report.total, 1);
    assert_eq!(messenger.lookup_times().len(), 1);
}
