//! Alert service - in-memory alert storage per campaign
//!
//! Keeps a bounded ring of operational alerts (health trips, auto-pause,
//! session loss) per campaign for status queries, and pushes each one to
//! the owner's room as a `campaign-alert` event.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use bl_common::{AlertSeverity, CampaignAlert, EVENT_CAMPAIGN_ALERT};

use crate::broadcast::Broadcaster;

#[derive(Debug, Clone)]
pub struct AlertServiceConfig {
    /// Oldest alerts are dropped past this count, per campaign.
    pub max_alerts_per_campaign: usize,
}

impl Default for AlertServiceConfig {
    fn default() -> Self {
        Self {
            max_alerts_per_campaign: 100,
        }
    }
}

pub struct AlertService {
    alerts: RwLock<HashMap<String, VecDeque<CampaignAlert>>>,
    config: AlertServiceConfig,
    broadcaster: Arc<dyn Broadcaster>,
}

impl AlertService {
    pub fn new(broadcaster: Arc<dyn Broadcaster>) -> Self {
        Self::with_config(broadcaster, AlertServiceConfig::default())
    }

    pub fn with_config(broadcaster: Arc<dyn Broadcaster>, config: AlertServiceConfig) -> Self {
        Self {
            alerts: RwLock::new(HashMap::new()),
            config,
            broadcaster,
        }
    }

    /// Record an alert and push it to the owner's room.
    pub fn raise(
        &self,
        owner_room: &str,
        campaign_id: &str,
        severity: AlertSeverity,
        message: impl Into<String>,
    ) -> CampaignAlert {
        let alert = CampaignAlert::new(campaign_id, severity, message.into());

        {
            let mut alerts = self.alerts.write();
            let ring = alerts.entry(campaign_id.to_string()).or_default();
            if ring.len() == self.config.max_alerts_per_campaign {
                ring.pop_front();
            }
            ring.push_back(alert.clone());
        }

        debug!(
            campaign_id = %campaign_id,
            severity = ?severity,
            message = %alert.message,
            "Alert raised"
        );

        self.broadcaster.emit(
            owner_room,
            EVENT_CAMPAIGN_ALERT,
            serde_json::to_value(&alert).unwrap_or_default(),
        );
        alert
    }

    /// Alerts for one campaign, oldest first.
    pub fn recent(&self, campaign_id: &str) -> Vec<CampaignAlert> {
        self.alerts
            .read()
            .get(campaign_id)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Drop everything recorded for a campaign (cleanup).
    pub fn clear(&self, campaign_id: &str) {
        self.alerts.write().remove(campaign_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcast::NoopBroadcaster;

    #[test]
    fn ring_is_bounded_per_campaign() {
        let service = AlertService::with_config(
            Arc::new(NoopBroadcaster),
            AlertServiceConfig {
                max_alerts_per_campaign: 3,
            },
        );

        for i in 0..5 {
            service.raise("u1", "c1", AlertSeverity::Warn, format!("warning {i}"));
        }

        let recent = service.recent("c1");
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].message, "warning 2");
        assert_eq!(recent[2].message, "warning 4");
    }

    #[test]
    fn campaigns_are_isolated() {
        let service = AlertService::new(Arc::new(NoopBroadcaster));
        service.raise("u1", "c1", AlertSeverity::Critical, "paused");

        assert_eq!(service.recent("c1").len(), 1);
        assert!(service.recent("c2").is_empty());

        service.clear("c1");
        assert!(service.recent("c1").is_empty());
    }
}
