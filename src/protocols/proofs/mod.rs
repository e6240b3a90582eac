//! Present proof 1.0 (Aries RFC 0037) for verifier and prover.
mod handler;
mod messages;
mod service;

pub use handler::ProofHandler;
pub use messages::{
    Presentation, PresentationAttribute, PresentationPreview, ProposePresentation,
    RequestPresentation, PRESENTATION_ACK, PRESENTATION_PROBLEM_REPORT,
};
pub use service::ProofService;

use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    exchange::{AutoAcceptPolicy, ExchangeRecord, MessageRef, ProtocolState, Transition},
    oob::ConnectionlessRoute,
};
use crate::{agent::AgentEvent, messages::Attachment, storage::Record};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum ProofState {
    ProposalSent,
    ProposalReceived,
    RequestSent,
    RequestReceived,
    PresentationSent,
    PresentationReceived,
    Done,
    Abandoned,
}

impl fmt::Display for ProofState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ProofState::ProposalSent => "proposal-sent",
            ProofState::ProposalReceived => "proposal-received",
            ProofState::RequestSent => "request-sent",
            ProofState::RequestReceived => "request-received",
            ProofState::PresentationSent => "presentation-sent",
            ProofState::PresentationReceived => "presentation-received",
            ProofState::Done => "done",
            ProofState::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

impl ProtocolState for ProofState {
    const ABANDONED: Self = ProofState::Abandoned;

    fn is_initial(&self) -> bool {
        use ProofState::*;
        matches!(self, ProposalSent | ProposalReceived | RequestSent | RequestReceived)
    }

    fn is_terminal(&self) -> bool {
        matches!(self, ProofState::Done | ProofState::Abandoned)
    }

    fn allows(&self, next: Self) -> bool {
        use ProofState::*;
        matches!(
            (self, next),
            (ProposalSent, RequestReceived)
                | (ProposalReceived, RequestSent)
                | (RequestSent, ProposalReceived)
                | (RequestSent, PresentationReceived)
                | (RequestReceived, ProposalSent)
                | (RequestReceived, PresentationSent)
                | (PresentationSent, Done)
                | (PresentationReceived, Done)
        )
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ProofRole {
    Verifier,
    Prover,
}

impl fmt::Display for ProofRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProofRole::Verifier => f.write_str("verifier"),
            ProofRole::Prover => f.write_str("prover"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProofExchangeRecord {
    pub id: String,
    state: ProofState,
    pub role: ProofRole,
    /// `None` for an exchange started out of band.
    pub connection_id: Option<String>,
    pub connectionless: Option<ConnectionlessRoute>,
    pub thread_id: String,
    pub proposal: Option<Attachment>,
    pub request: Option<Attachment>,
    pub presentation: Option<Attachment>,
    /// Set by the verifier once the presentation was checked.
    pub is_verified: Option<bool>,
    pub revealed_attributes: Option<BTreeMap<String, String>>,
    /// Overrides `auto_accept_proofs` of the configuration.
    pub auto_accept: Option<AutoAcceptPolicy>,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub messages: Vec<MessageRef>,
    version: u64,
}

impl ProofExchangeRecord {
    pub(crate) fn new(
        role: ProofRole,
        state: ProofState,
        connection_id: Option<&str>,
        thread_id: &str,
    ) -> Self {
        ProofExchangeRecord {
            id: uuid::Uuid::new_v4().to_string(),
            state,
            role,
            connection_id: connection_id.map(str::to_string),
            connectionless: None,
            thread_id: thread_id.to_string(),
            proposal: None,
            request: None,
            presentation: None,
            is_verified: None,
            revealed_attributes: None,
            auto_accept: None,
            created_at: Utc::now(),
            error_message: None,
            messages: vec![],
            version: 0,
        }
    }

    pub fn state(&self) -> ProofState {
        self.state
    }
}

impl Record for ProofExchangeRecord {
    const TYPE: &'static str = "ProofExchange";

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
        self.connection_id.as_deref()
    }

    fn tags(&self) -> HashMap<String, String> {
        let mut tags = HashMap::new();
        tags.insert("role".to_string(), self.role.to_string());
        tags.insert("state".to_string(), self.state.to_string());
        tags
    }
}

impl ExchangeRecord for ProofExchangeRecord {
    type State = ProofState;

    fn state(&self) -> ProofState {
        self.state
    }

    fn apply_state(&mut self, state: ProofState, _: Transition) {
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

    fn state_changed_event(&self, previous_state: Option<ProofState>) -> AgentEvent {
        AgentEvent::ProofStateChanged {
            record: self.clone(),
            previous_state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ProofState::*;

    #[test]
    fn presentation_needs_a_request_first() {
        assert!(!ProposalSent.can_transition_to(PresentationSent));
        assert!(RequestReceived.can_transition_to(PresentationSent));
        assert!(RequestSent.can_transition_to(PresentationReceived));
        assert!(!PresentationReceived.can_transition_to(RequestSent));
    }

    #[test]
    fn abandoned_only_from_open_states() {
        assert!(PresentationSent.can_transition_to(Abandoned));
        assert!(!Done.can_transition_to(Abandoned));
        assert!(!Abandoned.can_transition_to(Abandoned));
    }
}
