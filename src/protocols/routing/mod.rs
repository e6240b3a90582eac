//! Mediation: coordinate-mediation 1.0 for both roles, forward routing,
//! message pickup 1.0 and the recipient's pickup coordinator.
mod mediator;
mod messages;
mod pickup;
mod queue;
mod recipient;

pub use mediator::{ForwardHandler, MediatorHandler, MediatorService};
pub use messages::{
    Batch, BatchMessage, BatchPickup, Forward, KeylistUpdate, KeylistUpdateAction,
    KeylistUpdateMessage, KeylistUpdateResponse, KeylistUpdateResult, KeylistUpdated,
    MediationDeny, MediationGrant, MediationRequest,
};
pub use pickup::{Backoff, PickupCoordinator, PickupStatus};
pub use queue::MessageQueue;
pub use recipient::{MediationRecipientService, RecipientHandler};

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::exchange::{ExchangeRecord, MessageRef, ProtocolState, Transition};
use crate::{
    agent::AgentEvent,
    messages::ServiceDecorator,
    storage::Record,
    wallet::Key,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MediationState {
    Requested,
    Granted,
    Denied,
}

impl fmt::Display for MediationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MediationState::Requested => "requested",
            MediationState::Granted => "granted",
            MediationState::Denied => "denied",
        };
        f.write_str(s)
    }
}

impl ProtocolState for MediationState {
    const ABANDONED: Self = MediationState::Denied;

    fn is_initial(&self) -> bool {
        *self == MediationState::Requested
    }

    fn is_terminal(&self) -> bool {
        *self != MediationState::Requested
    }

    fn allows(&self, next: Self) -> bool {
        *self == MediationState::Requested && next == MediationState::Granted
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MediationRole {
    Mediator,
    Recipient,
}

impl fmt::Display for MediationRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediationRole::Mediator => f.write_str("mediator"),
            MediationRole::Recipient => f.write_str("recipient"),
        }
    }
}

/// How a recipient retrieves messages queued at its mediator.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum MediatorPickupStrategy {
    /// Poll with `batch-pickup` at a fixed interval.
    Explicit,
    /// Hold a long lived session the mediator pushes messages over.
    Implicit,
    Combined,
    None,
}

impl Default for MediatorPickupStrategy {
    fn default() -> Self {
        MediatorPickupStrategy::Explicit
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MediationRecord {
    pub id: String,
    state: MediationState,
    pub role: MediationRole,
    pub connection_id: String,
    pub thread_id: String,
    /// Mediator endpoint, known once granted.
    pub endpoint: Option<String>,
    pub routing_keys: Vec<String>,
    /// Keys the mediator forwards messages for.
    pub recipient_keys: Vec<String>,
    pub mediator_did: Option<String>,
    pub recipient_did: Option<String>,
    pub pickup_strategy: Option<MediatorPickupStrategy>,
    pub is_default: bool,
    pub error_message: Option<String>,
    pub messages: Vec<MessageRef>,
    pub created_at: DateTime<Utc>,
    version: u64,
}

impl MediationRecord {
    pub(crate) fn new(role: MediationRole, connection_id: &str, thread_id: &str) -> Self {
        MediationRecord {
            id: uuid::Uuid::new_v4().to_string(),
            state: MediationState::Requested,
            role,
            connection_id: connection_id.to_string(),
            thread_id: thread_id.to_string(),
            endpoint: None,
            routing_keys: vec![],
            recipient_keys: vec![],
            mediator_did: None,
            recipient_did: None,
            pickup_strategy: None,
            is_default: false,
            error_message: None,
            messages: vec![],
            created_at: Utc::now(),
            version: 0,
        }
    }

    pub fn state(&self) -> MediationState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == MediationState::Granted
    }
}

pub(crate) fn recipient_key_tag(fingerprint: &str) -> String {
    format!("recipient_key:{}", fingerprint)
}

impl Record for MediationRecord {
    const TYPE: &'static str = "Mediation";

    fn id(&self) -> &str {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn thread_id(&self) -> Option<&str> {
        Some(&self.thread_id)
    }

    fn connection_id(&self) -> Option<&str> {
        Some(&self.connection_id)
    }

    fn tags(&self) -> HashMap<String, String> {
        let mut tags = HashMap::new();
        tags.insert("role".to_string(), self.role.to_string());
        tags.insert("state".to_string(), self.state.to_string());
        tags.insert("default".to_string(), self.is_default.to_string());
        for key in &self.recipient_keys {
            tags.insert(recipient_key_tag(key), "true".to_string());
        }
        tags
    }
}

impl ExchangeRecord for MediationRecord {
    type State = MediationState;

    fn state(&self) -> MediationState {
        self.state
    }

    fn apply_state(&mut self, state: MediationState, _: Transition) {
        self.state = state;
    }

    fn error_message(&self) -> Option<&str> {
        self.error_message.as_deref()
    }

    fn set_error_message(&mut self, message: String) {
        self.error_message = Some(message);
    }

    fn messages_mut(&mut self) -> &mut Vec<MessageRef> {
        &mut self.messages
    }

    fn state_changed_event(&self, previous_state: Option<MediationState>) -> AgentEvent {
        AgentEvent::MediationStateChanged {
            record: self.clone(),
            previous_state,
        }
    }
}

/// Where peers send messages for one of our keys.
#[derive(Debug, Clone, PartialEq)]
pub struct Routing {
    pub endpoint: String,
    pub routing_keys: Vec<String>,
    pub recipient_key: Key,
    pub mediator_id: Option<String>,
}

impl Routing {
    pub fn service(&self) -> ServiceDecorator {
        ServiceDecorator {
            recipient_keys: vec![self.recipient_key.fingerprint()],
            routing_keys: self.routing_keys.clone(),
            service_endpoint: self.endpoint.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mediation_is_granted_or_denied_once() {
        use MediationState::*;
        assert!(Requested.can_transition_to(Granted));
        assert!(Requested.can_transition_to(Denied));
        assert!(!Granted.can_transition_to(Denied));
        assert!(!Denied.can_transition_to(Granted));
        assert!(!Granted.can_transition_to(Requested));
    }

    #[test]
    fn pickup_strategy_is_camel_case() -> Result<(), serde_json::Error> {
        assert_eq!(
            serde_json::to_value(MediatorPickupStrategy::Combined)?,
            "combined"
        );
        let none: MediatorPickupStrategy = serde_json::from_str("\"none\"")?;
        assert_eq!(none, MediatorPickupStrategy::None);
        Ok(())
    }

    #[test]
    fn recipient_keys_are_searchable() {
        let mut record = MediationRecord::new(MediationRole::Mediator, "c", "t");
        record.recipient_keys.push("abc".into());
        assert_eq!(
            record.tags().get(&recipient_key_tag("abc")).map(String::as_str),
            Some("true")
        );
        assert_eq!(record.connection_id(), Some("c"));
    }
}
