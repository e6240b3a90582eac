//! Connection protocol 1.0 (Aries RFC 0160).
mod handler;
mod messages;
mod service;

pub use handler::ConnectionHandler;
pub use messages::{
    Connection, ConnectionRequest, ConnectionResponse, DidDoc, DidDocKey, DidDocService, Invitation,
};
pub use service::ConnectionService;

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::exchange::{ExchangeRecord, MessageRef, ProtocolState, Transition};
use crate::{
    agent::AgentEvent,
    messages::ServiceDecorator,
    storage::Record,
    wallet::Key,
    Error, Result,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Invited,
    Requested,
    Responded,
    Complete,
    Abandoned,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Invited => "invited",
            ConnectionState::Requested => "requested",
            ConnectionState::Responded => "responded",
            ConnectionState::Complete => "complete",
            ConnectionState::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

impl ProtocolState for ConnectionState {
    const ABANDONED: Self = ConnectionState::Abandoned;

    fn is_initial(&self) -> bool {
        *self == ConnectionState::Invited
    }

    fn is_terminal(&self) -> bool {
        matches!(self, ConnectionState::Complete | ConnectionState::Abandoned)
    }

    fn allows(&self, next: Self) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Invited, Requested) | (Requested, Responded) | (Responded, Complete)
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionRole {
    Inviter,
    Invitee,
}

impl fmt::Display for ConnectionRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionRole::Inviter => f.write_str("inviter"),
            ConnectionRole::Invitee => f.write_str("invitee"),
        }
    }
}

/// Pairwise relationship with one peer.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionRecord {
    pub id: String,
    state: ConnectionState,
    pub role: ConnectionRole,
    /// Id of the connection request, shared by request and response.
    pub thread_id: Option<String>,
    pub invitation_id: String,
    pub invitation: Option<Invitation>,
    pub my_did: String,
    pub my_key: Key,
    /// Endpoint and routing keys this agent announced to the peer.
    pub my_service: ServiceDecorator,
    pub their_did: Option<String>,
    pub their_key: Option<Key>,
    pub their_label: Option<String>,
    pub their_service: Option<ServiceDecorator>,
    /// Overrides `auto_accept_connections` of the configuration.
    pub auto_accept: Option<bool>,
    pub mediator_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub messages: Vec<MessageRef>,
    pub metadata: HashMap<String, Value>,
    version: u64,
}

impl ConnectionRecord {
    pub(crate) fn new(
        role: ConnectionRole,
        invitation_id: String,
        my_key: Key,
        my_service: ServiceDecorator,
    ) -> Self {
        ConnectionRecord {
            id: uuid::Uuid::new_v4().to_string(),
            state: ConnectionState::Invited,
            role,
            thread_id: None,
            invitation_id,
            invitation: None,
            my_did: my_key.did(),
            my_key,
            my_service,
            their_did: None,
            their_key: None,
            their_label: None,
            their_service: None,
            auto_accept: None,
            mediator_id: None,
            created_at: Utc::now(),
            error_message: None,
            messages: vec![],
            metadata: HashMap::new(),
            version: 0,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Messages may be exchanged once the inviter responded.
    pub fn is_ready(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Responded | ConnectionState::Complete
        )
    }

    pub fn assert_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(Error::ConnectionNotReady(format!(
                "connection {} is {}",
                self.id, self.state
            )))
        }
    }
}

impl Record for ConnectionRecord {
    const TYPE: &'static str = "Connection";

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
        self.thread_id.as_deref()
    }

    fn tags(&self) -> HashMap<String, String> {
        let mut tags = HashMap::new();
        tags.insert("my_key".to_string(), self.my_key.fingerprint());
        if let Some(their_key) = &self.their_key {
            tags.insert("their_key".to_string(), their_key.fingerprint());
        }
        tags.insert("invitation_id".to_string(), self.invitation_id.clone());
        tags.insert("role".to_string(), self.role.to_string());
        tags
    }
}

impl ExchangeRecord for ConnectionRecord {
    type State = ConnectionState;

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn apply_state(&mut self, state: ConnectionState, _: Transition) {
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

    fn state_changed_event(&self, previous_state: Option<ConnectionState>) -> AgentEvent {
        AgentEvent::ConnectionStateChanged {
            record: self.clone(),
            previous_state,
        }
    }
}
