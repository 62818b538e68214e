//! Blastline campaign engine
//!
//! The per-campaign execution state machine plus its supporting pieces:
//! message queue, pacing-aware execution loop, phone validator, retry
//! governor, health monitor and the campaign manager façade. The WhatsApp
//! transport, the repository and the realtime push channel are consumed
//! capabilities (`Messenger`, `CampaignStore`, `Broadcaster`); everything
//! else lives here.

pub mod alerts;
pub mod broadcast;
pub mod error;
pub mod health;
pub mod manager;
pub mod messenger;
pub mod queue;
pub mod retry;
pub mod runner;
pub mod validator;

pub use alerts::{AlertService, AlertServiceConfig};
pub use bl_pacing::{Clock, ManualClock, SystemClock};
pub use broadcast::{Broadcaster, LogBroadcaster, NoopBroadcaster};
pub use error::EngineError;
pub use health::{HealthMonitor, HealthSignal};
pub use manager::{CampaignManager, RecoveryReport, SESSION_LOST_REASON};
pub use messenger::{Messenger, SessionGate, MESSENGER_DEADLINE};
pub use queue::CampaignQueue;
pub use retry::{RetryGovernor, RetryGovernorConfig, RetryRunStats};
pub use runner::LoopControl;
pub use validator::PhoneValidator;

pub type Result<T> = std::result::Result<T, EngineError>;
