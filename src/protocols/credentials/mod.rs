//! Issue credential 1.0 (Aries RFC 0036) for issuer and holder.
mod handler;
mod messages;
mod service;

pub use handler::CredentialHandler;
pub(crate) use handler::with_session;
pub use messages::{
    CredentialAttribute, CredentialPreview, IssueCredential, OfferCredential, ProposeCredential,
    RequestCredential, CREDENTIAL_ACK, CREDENTIAL_PROBLEM_REPORT,
};
pub use service::CredentialService;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::exchange::{AutoAcceptPolicy, ExchangeRecord, MessageRef, ProtocolState, Transition};
use crate::{agent::AgentEvent, messages::Attachment, storage::Record};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum CredentialState {
    ProposalSent,
    ProposalReceived,
    OfferSent,
    OfferReceived,
    RequestSent,
    RequestReceived,
    CredentialIssued,
    CredentialReceived,
    Done,
    Abandoned,
}

impl fmt::Display for CredentialState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CredentialState::ProposalSent => "proposal-sent",
            CredentialState::ProposalReceived => "proposal-received",
            CredentialState::OfferSent => "offer-sent",
            CredentialState::OfferReceived => "offer-received",
            CredentialState::RequestSent => "request-sent",
            CredentialState::RequestReceived => "request-received",
            CredentialState::CredentialIssued => "credential-issued",
            CredentialState::CredentialReceived => "credential-received",
            CredentialState::Done => "done",
            CredentialState::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

impl ProtocolState for CredentialState {
    const ABANDONED: Self = CredentialState::Abandoned;

    fn is_initial(&self) -> bool {
        use CredentialState::*;
        matches!(self, ProposalSent | ProposalReceived | OfferSent | OfferReceived)
    }

    fn is_terminal(&self) -> bool {
        matches!(self, CredentialState::Done | CredentialState::Abandoned)
    }

    fn allows(&self, next: Self) -> bool {
        use CredentialState::*;
        matches!(
            (self, next),
            (ProposalSent, OfferReceived)
                | (ProposalReceived, OfferSent)
                | (OfferSent, ProposalReceived)
                | (OfferSent, RequestReceived)
                | (OfferReceived, ProposalSent)
                | (OfferReceived, RequestSent)
                | (RequestSent, CredentialReceived)
                | (RequestReceived, CredentialIssued)
                | (CredentialIssued, Done)
                | (CredentialReceived, Done)
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CredentialRole {
    Issuer,
    Holder,
}

impl fmt::Display for CredentialRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialRole::Issuer => f.write_str("issuer"),
            CredentialRole::Holder => f.write_str("holder"),
        }
    }
}

/// One credential issuance, seen from one side.
///
/// Keeps the latest format attachment of every step; auto acceptance
/// compares the received one against what this side sent last.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialExchangeRecord {
    pub id: String,
    state: CredentialState,
    pub role: CredentialRole,
    pub connection_id: String,
    pub thread_id: String,
    pub proposal: Option<Attachment>,
    pub offer: Option<Attachment>,
    pub request: Option<Attachment>,
    pub credential: Option<Attachment>,
    /// Id of the credential in the holder's store.
    pub credential_id: Option<String>,
    pub credential_attributes: Option<BTreeMap<String, String>>,
    /// Overrides `auto_accept_credentials` of the configuration.
    pub auto_accept: Option<AutoAcceptPolicy>,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub messages: Vec<MessageRef>,
    version: u64,
}

impl CredentialExchangeRecord {
    pub(crate) fn new(
        role: CredentialRole,
        state: CredentialState,
        connection_id: &str,
        thread_id: &str,
    ) -> Self {
        CredentialExchangeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            state,
            role,
            connection_id: connection_id.to_string(),
            thread_id: thread_id.to_string(),
            proposal: None,
            offer: None,
            request: None,
            credential: None,
            credential_id: None,
            credential_attributes: None,
            auto_accept: None,
            created_at: Utc::now(),
            error_message: None,
            messages: vec![],
            version: 0,
        }
    }

    pub fn state(&self) -> CredentialState {
        self.state
    }
}

impl Record for CredentialExchangeRecord {
    const TYPE: &'static str = "CredentialExchange";

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
        tags
    }
}

impl ExchangeRecord for CredentialExchangeRecord {
    type State = CredentialState;

    fn state(&self) -> CredentialState {
        self.state
    }

    fn apply_state(&mut self, state: CredentialState, _: Transition) {
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

    fn state_changed_event(&self, previous_state: Option<CredentialState>) -> AgentEvent {
        AgentEvent::CredentialStateChanged {
            record: self.clone(),
            previous_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use CredentialState::*;

    const ALL: [CredentialState; 10] = [
        ProposalSent,
        ProposalReceived,
        OfferSent,
        OfferReceived,
        RequestSent,
        RequestReceived,
        CredentialIssued,
        CredentialReceived,
        Done,
        Abandoned,
    ];

    #[test]
    fn terminal_states_have_no_edges() {
        for to in ALL.iter() {
            assert!(!Done.can_transition_to(*to));
            assert!(!Abandoned.can_transition_to(*to));
        }
    }

    #[test]
    fn every_open_state_can_be_abandoned() {
        for from in ALL.iter().filter(|s| !s.is_terminal()) {
            assert!(from.can_transition_to(Abandoned), "{}", from);
        }
    }

    #[test]
    fn negotiation_cycles_before_request() {
        assert!(OfferSent.can_transition_to(ProposalReceived));
        assert!(ProposalReceived.can_transition_to(OfferSent));
        assert!(OfferReceived.can_transition_to(ProposalSent));
        assert!(ProposalSent.can_transition_to(OfferReceived));
        assert!(!RequestSent.can_transition_to(ProposalSent));
        assert!(!RequestReceived.can_transition_to(OfferSent));
    }

    #[test]
    fn state_serializes_like_display() -> Result<(), serde_json::Error> {
        for state in ALL.iter() {
            assert_eq!(serde_json::to_value(state)?, state.to_string());
        }
        Ok(())
    }
}
