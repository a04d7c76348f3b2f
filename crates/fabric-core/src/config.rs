// ── Runtime configuration for the discovery controller ──
//
// Built by the daemon (or a test harness) and handed in; the core never
// reads flags or files itself.

use std::time::Duration;

use fabric_api::{aspect, Filters};

use crate::error::CoreError;

/// Label/value pair selecting the device entities a controller instance
/// owns. Multiple instances cooperate by owning disjoint realms.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RealmSelector {
    pub label: String,
    pub value: String,
}

impl RealmSelector {
    pub fn new(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self { label: label.into(), value: value.into() }
    }

    /// Filter matching realm devices that carry at least one agent aspect.
    pub fn device_filters(&self) -> Filters {
        Filters::new()
            .with_label(self.label.clone(), self.value.clone())
            .with_aspects([aspect::STRATUM_AGENTS, aspect::LOCAL_AGENTS])
    }
}

/// Configuration for one discovery controller instance.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// `host:port` of the catalog service.
    pub catalog_address: String,
    /// Devices this controller discovers.
    pub realm: RealmSelector,
    /// Devices in neighboring realms that are only registered for agent-id
    /// resolution. `None` disables neighbor monitoring.
    pub neighbor_realm: Option<RealmSelector>,
    /// Depth of the dispatch queue; a full queue blocks producers.
    pub queue_depth: usize,
    /// Size of the reconciliation worker pool.
    pub worker_count: usize,
    /// Period of the full discovery sweep while monitoring.
    pub sweep_interval: Duration,
    /// Pause between catalog connection attempts.
    pub retry_pause: Duration,
    /// Deadline applied to every catalog and telemetry operation.
    pub op_timeout: Duration,
    /// TLS mode for the catalog connection.
    pub catalog_tls: fabric_api::ClientTls,
    /// TLS mode for device agent connections.
    pub agent_tls: fabric_api::ClientTls,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            catalog_address: "fabric-catalog:5150".to_owned(),
            realm: RealmSelector::new("pod", "all"),
            neighbor_realm: None,
            queue_depth: 128,
            worker_count: 16,
            sweep_interval: Duration::from_secs(30),
            retry_pause: Duration::from_secs(5),
            op_timeout: Duration::from_secs(30),
            catalog_tls: fabric_api::ClientTls::Plaintext,
            agent_tls: fabric_api::ClientTls::Plaintext,
        }
    }
}

impl DiscoveryConfig {
    /// Reject configurations the controller cannot run with.
    ///
    /// A neighbor selector identical to the realm selector would race full
    /// discovery against agent-only registration for every device.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.catalog_address.is_empty() {
            return Err(CoreError::Config("catalog address must not be empty".into()));
        }
        if self.queue_depth == 0 {
            return Err(CoreError::Config("queue depth must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(CoreError::Config("worker count must be at least 1".into()));
        }
        if self.realm.label.is_empty() {
            return Err(CoreError::Config("realm label must not be empty".into()));
        }
        if let Some(neighbor) = &self.neighbor_realm {
            if *neighbor == self.realm {
                return Err(CoreError::Config(format!(
                    "neighbor realm selector {}={} overlaps the realm selector",
                    neighbor.label, neighbor.value
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        DiscoveryConfig::default().validate().unwrap();
    }

    #[test]
    fn overlapping_neighbor_realm_is_rejected() {
        let config = DiscoveryConfig {
            neighbor_realm: Some(RealmSelector::new("pod", "all")),
            ..DiscoveryConfig::default()
        };
        assert!(matches!(config.validate(), Err(CoreError::Config(_))));
    }

    #[test]
    fn distinct_neighbor_realm_is_accepted() {
        let config = DiscoveryConfig {
            neighbor_realm: Some(RealmSelector::new("pod", "edge")),
            ..DiscoveryConfig::default()
        };
        config.validate().unwrap();
    }

    #[test]
    fn device_filters_select_agent_carriers() {
        use fabric_api::{kind, Object, StratumAgents};

        let filters = RealmSelector::new("pod", "all").device_filters();
        let device = Object::entity("spine1", kind::SWITCH)
            .with_label("pod", "all")
            .with_aspect(&StratumAgents::default())
            .unwrap();
        assert!(filters.matches(&device));

        let bare = Object::entity("rack-01-1", kind::RACK).with_label("pod", "all");
        assert!(!filters.matches(&bare));
    }
}
