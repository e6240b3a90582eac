//! Agent configuration.
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{
    messages::MessageType,
    protocols::{exchange::AutoAcceptPolicy, routing::MediatorPickupStrategy},
    Error, Result,
};

/// Configuration of one agent, threaded through its [`crate::agent::AgentContext`].
///
/// Every field has a default, so a JSON document only needs the values that
/// differ. Durations are given in milliseconds.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct AgentConfig {
    /// Human readable name sent in invitations and requests.
    pub label: String,
    /// Endpoints this agent receives messages on. Without any the agent is
    /// reachable only through a mediator or over return routes.
    pub endpoints: Vec<String>,
    pub auto_accept_connections: bool,
    pub auto_accept_credentials: AutoAcceptPolicy,
    pub auto_accept_proofs: AutoAcceptPolicy,
    /// Mediator role: grant every mediation request.
    pub auto_accept_mediation_requests: bool,
    pub mediator_pickup_strategy: MediatorPickupStrategy,
    #[serde(with = "crate::messages::serialization::duration_millis")]
    pub mediator_polling_interval: Duration,
    pub mediator_batch_size: usize,
    #[serde(with = "crate::messages::serialization::duration_millis")]
    pub mediator_reconnect_base_interval: Duration,
    #[serde(with = "crate::messages::serialization::duration_millis")]
    pub mediator_reconnect_max_interval: Duration,
    pub send_problem_report_on_unknown_message: bool,
    /// Protocol families (e.g. `https://didcomm.org/connections/1.0`) that
    /// must have a registered handler for the agent to start.
    pub required_protocols: Vec<String>,
    pub event_channel_capacity: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            label: "didcomm-agent".into(),
            endpoints: vec![],
            auto_accept_connections: false,
            auto_accept_credentials: AutoAcceptPolicy::Never,
            auto_accept_proofs: AutoAcceptPolicy::Never,
            auto_accept_mediation_requests: false,
            mediator_pickup_strategy: MediatorPickupStrategy::Explicit,
            mediator_polling_interval: Duration::from_millis(5000),
            mediator_batch_size: 10,
            mediator_reconnect_base_interval: Duration::from_millis(500),
            mediator_reconnect_max_interval: Duration::from_secs(60),
            send_problem_report_on_unknown_message: false,
            required_protocols: vec![],
            event_channel_capacity: 256,
        }
    }
}

impl AgentConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: AgentConfig =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects inconsistent values. Called when the agent is built.
    pub fn validate(&self) -> Result<()> {
        if self.mediator_polling_interval.is_zero() {
            return Err(Error::Config("mediator_polling_interval must be positive".into()));
        }
        if self.mediator_batch_size == 0 {
            return Err(Error::Config("mediator_batch_size must be positive".into()));
        }
        if self.mediator_reconnect_base_interval.is_zero() {
            return Err(Error::Config(
                "mediator_reconnect_base_interval must be positive".into(),
            ));
        }
        if self.mediator_reconnect_base_interval > self.mediator_reconnect_max_interval {
            return Err(Error::Config(format!(
                "reconnect base interval {:?} exceeds max interval {:?}",
                self.mediator_reconnect_base_interval, self.mediator_reconnect_max_interval
            )));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::Config("event_channel_capacity must be positive".into()));
        }
        if let Some(endpoint) = self.endpoints.iter().find(|e| !e.contains(':')) {
            return Err(Error::Config(format!("endpoint '{}' is not a URI", endpoint)));
        }
        for family in &self.required_protocols {
            // A protocol URI plus a message name must form a message type.
            MessageType::parse(&format!("{}/probe", family.trim_end_matches('/')))
                .map_err(|_| Error::Config(format!("required protocol '{}' is not a protocol URI", family)))?;
        }
        Ok(())
    }
}

/// Initializes `env_logger` once; later calls are no-ops.
pub fn init_logger() {
    let _ = env_logger::builder().is_test(cfg!(test)).try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_keeps_defaults() -> Result<()> {
        // Arrange
        let json = r#"{
            "label": "faber",
            "auto_accept_credentials": "contentApproved",
            "mediator_polling_interval": 250
        }"#;
        // Act
        let config = AgentConfig::from_json(json)?;
        // Assert
        assert_eq!(config.label, "faber");
        assert_eq!(config.auto_accept_credentials, AutoAcceptPolicy::ContentApproved);
        assert_eq!(config.mediator_polling_interval, Duration::from_millis(250));
        assert_eq!(config.mediator_batch_size, 10);
        assert_eq!(config.mediator_pickup_strategy, MediatorPickupStrategy::Explicit);
        Ok(())
    }

    #[test]
    fn inverted_backoff_bounds_are_rejected() {
        let config = AgentConfig {
            mediator_reconnect_base_interval: Duration::from_secs(10),
            mediator_reconnect_max_interval: Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn malformed_required_protocol_is_rejected() {
        let config = AgentConfig {
            required_protocols: vec!["connections".into()],
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        let config = AgentConfig {
            required_protocols: vec!["https://didcomm.org/connections/1.0".into()],
            ..Default::default()
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn unknown_json_is_a_config_error() {
        assert!(matches!(
            AgentConfig::from_json("{\"mediator_batch_size\": \"ten\"}"),
            Err(Error::Config(_))
        ));
    }
}
