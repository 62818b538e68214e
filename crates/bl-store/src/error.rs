use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Message not found: {campaign_id}#{index}")]
    MessageNotFound { campaign_id: String, index: u32 },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
