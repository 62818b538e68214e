//! Blastline development monolith
//!
//! Runs the full engine against a simulated messenger: creates a demo
//! campaign, starts it, and streams progress to the log until it finishes
//! or Ctrl-C arrives. The store backend (memory or SQLite) comes from the
//! process configuration.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use clap::Parser;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::signal;
use tokio::sync::broadcast;
use tracing::{info, warn};

use bl_common::{
    AccountAgeTier, CampaignConfig, ChaosOverrides, Contact, PacingOverrides, SendOutcome,
    SessionEvent,
};
use bl_config::ConfigLoader;
use bl_engine::{CampaignManager, LogBroadcaster, Messenger, RetryGovernor, RetryGovernorConfig};
use bl_store::{CampaignStore, MemoryStore, SqliteStore};
use sqlx::sqlite::SqlitePoolOptions;

/// Blastline development server
#[derive(Parser, Debug)]
#[command(name = "bl-dev")]
#[command(about = "Blastline development monolith - run a demo blast end to end")]
struct Args {
    /// Number of demo contacts
    #[arg(long, env = "BL_CONTACTS", default_value = "10")]
    contacts: u32,

    /// Fraction of sends that fail transiently (0.0 - 1.0)
    #[arg(long, env = "BL_FAILURE_RATE", default_value = "0.1")]
    failure_rate: f64,

    /// Account age tier: NEW, WARMING or ESTABLISHED
    #[arg(long, env = "BL_ACCOUNT_AGE", default_value = "ESTABLISHED")]
    account_age: String,

    /// Optional config file path
    #[arg(long, env = "BLASTLINE_CONFIG")]
    config: Option<String>,
}

/// In-process messenger with a configurable transient failure rate.
struct SimMessenger {
    failure_rate: f64,
    rng: Mutex<StdRng>,
    events: broadcast::Sender<SessionEvent>,
}

impl SimMessenger {
    fn new(failure_rate: f64) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            failure_rate: failure_rate.clamp(0.0, 1.0),
            rng: Mutex::new(StdRng::from_os_rng()),
            events,
        }
    }
}

#[async_trait]
impl Messenger for SimMessenger {
    async fn send(&self, _session_id: &str, phone: &str, _text: &str) -> SendOutcome {
        tokio::time::sleep(Duration::from_millis(50)).await;
        let fail = {
            let mut rng = self.rng.lock();
            self.failure_rate > 0.0 && rng.random_bool(self.failure_rate)
        };
        if fail {
            SendOutcome::transient(format!("simulated timeout for {phone}"))
        } else {
            SendOutcome::sent(format!("sim-{}", uuid::Uuid::new_v4()))
        }
    }

    async fn lookup(&self, _session_id: &str, _phone: &str) -> bl_engine::Result<bool> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        Ok(true)
    }

    fn subscribe(&self, _session_id: &str) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    bl_common::logging::init_logging("bl-dev");

    let args = Args::parse();
    let loader = match &args.config {
        Some(path) => ConfigLoader::with_path(path),
        None => ConfigLoader::new(),
    };
    let config = loader.load()?;

    info!(
        backend = %config.store.backend,
        contacts = args.contacts,
        failure_rate = args.failure_rate,
        "Starting Blastline dev monolith"
    );

    let store: Arc<dyn CampaignStore> = match config.store.backend.as_str() {
        "sqlite" => {
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect(&config.store.sqlite_url)
                .await?;
            let store = SqliteStore::new(pool);
            store.init_schema().await?;
            Arc::new(store)
        }
        _ => Arc::new(MemoryStore::new()),
    };

    let messenger = Arc::new(SimMessenger::new(args.failure_rate));
    let broadcaster = Arc::new(LogBroadcaster);

    let manager = CampaignManager::new(store.clone(), messenger.clone(), broadcaster.clone())
        .with_shutdown_grace(Duration::from_secs(config.engine.shutdown_grace_secs));

    let governor = Arc::new(RetryGovernor::new(
        store.clone(),
        messenger.clone(),
        broadcaster.clone(),
        manager.session_gate(),
        Arc::new(bl_engine::SystemClock),
        RetryGovernorConfig {
            tick_interval: Duration::from_secs(config.engine.retry_tick_secs),
            ..RetryGovernorConfig::default()
        },
    ));
    governor.clone().start().await;

    // Pick up anything a previous run left behind.
    manager.recover(None).await?;

    let account_age = match args.account_age.to_uppercase().as_str() {
        "NEW" => AccountAgeTier::New,
        "WARMING" => AccountAgeTier::Warming,
        _ => AccountAgeTier::Established,
    };

    let contacts: Vec<Contact> = (0..args.contacts)
        .map(|i| {
            let mut contact = Contact::named(format!("62812{:07}", i), format!("Contact {i}"));
            contact.variables.insert("city".to_string(), "Jakarta".to_string());
            contact
        })
        .collect();

    let campaign_config = CampaignConfig {
        account_age,
        respect_business_hours: false,
        skip_phone_validation: true,
        pacing: Some(PacingOverrides {
            delay_min_secs: Some(1),
            delay_max_secs: Some(3),
            rest_threshold: Some(1_000),
            ..PacingOverrides::default()
        }),
        chaos: Some(ChaosOverrides {
            hesitation_min_ms: Some(50),
            hesitation_max_ms: Some(200),
            typing_factor: Some(0.05),
            ..ChaosOverrides::default()
        }),
        ..CampaignConfig::default()
    };

    let campaign_id = manager
        .create(
            "dev-user",
            "dev-session",
            "demo blast",
            "{Hi|Hello|Hey} {name}, greetings from {city}!",
            contacts,
            campaign_config,
        )
        .await?;
    manager.start(&campaign_id).await?;

    info!(campaign_id = %campaign_id, "Demo campaign started");

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                warn!("Ctrl-C received, shutting down");
                let _ = manager.stop(&campaign_id).await;
                break;
            }
            _ = tokio::time::sleep(Duration::from_secs(2)) => {
                let snapshot = manager.status(&campaign_id).await?;
                info!(
                    status = %snapshot.status,
                    sent = snapshot.sent_count,
                    failed = snapshot.failed_count,
                    skipped = snapshot.skipped_count,
                    progress_pct = format!("{:.1}", snapshot.progress_pct),
                    "Campaign progress"
                );
                if snapshot.status.is_terminal() {
                    break;
                }
            }
        }
    }

    governor.stop().await;
    manager.shutdown().await;
    info!("Dev monolith exiting");
    Ok(())
}
