use bl_common::CampaignStatus;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Invalid transition: {from} -> {to}")]
    InvalidTransition {
        from: CampaignStatus,
        to: CampaignStatus,
    },

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Campaign not in a terminal state: {0}")]
    NotTerminal(CampaignStatus),

    #[error("Transient send failure: {0}")]
    Transient(String),

    #[error("Permanent send failure: {0}")]
    Permanent(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Messenger session lost: {0}")]
    SessionLost(String),

    #[error("Repository error: {0}")]
    Repository(#[from] bl_store::StoreError),
}
