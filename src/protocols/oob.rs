//! Out-of-band exchanges: a message handed to a peer outside any connection,
//! e.g. as a QR code, and answered through the `~service` it carries.
use std::{collections::HashMap, fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::exchange::{ExchangeEngine, ExchangeRecord, MessageRef, ProtocolState, Transition};
use crate::{
    agent::{AgentEvent, EventBus, OutboundMessageContext},
    messages::{PlaintextMessage, ServiceDecorator},
    storage::{Record, Repository},
    wallet::Key,
    Error, Result,
};

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
pub enum OutOfBandState {
    /// Sender handed the message out and waits for the answer.
    AwaitResponse,
    /// Receiver is processing the message.
    PrepareResponse,
    Done,
    Abandoned,
}

impl fmt::Display for OutOfBandState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OutOfBandState::AwaitResponse => "await-response",
            OutOfBandState::PrepareResponse => "prepare-response",
            OutOfBandState::Done => "done",
            OutOfBandState::Abandoned => "abandoned",
        };
        f.write_str(s)
    }
}

impl ProtocolState for OutOfBandState {
    const ABANDONED: Self = OutOfBandState::Abandoned;

    fn is_initial(&self) -> bool {
        matches!(self, OutOfBandState::AwaitResponse | OutOfBandState::PrepareResponse)
    }

    fn is_terminal(&self) -> bool {
        matches!(self, OutOfBandState::Done | OutOfBandState::Abandoned)
    }

    fn allows(&self, next: Self) -> bool {
        use OutOfBandState::*;
        matches!((self, next), (AwaitResponse, Done) | (PrepareResponse, Done))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OutOfBandRole {
    Sender,
    Receiver,
}

impl fmt::Display for OutOfBandRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutOfBandRole::Sender => f.write_str("sender"),
            OutOfBandRole::Receiver => f.write_str("receiver"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OutOfBandRecord {
    pub id: String,
    state: OutOfBandState,
    pub role: OutOfBandRole,
    /// The message as handed over, `~service` included.
    pub message: PlaintextMessage,
    pub thread_id: String,
    /// Record of the exchange the message starts, on the sender side.
    pub exchange_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub error_message: Option<String>,
    pub messages: Vec<MessageRef>,
    version: u64,
}

impl OutOfBandRecord {
    fn new(role: OutOfBandRole, state: OutOfBandState, message: &PlaintextMessage) -> Self {
        OutOfBandRecord {
            id: uuid::Uuid::new_v4().to_string(),
            state,
            role,
            thread_id: message.thread_id().to_string(),
            message: message.clone(),
            exchange_id: None,
            created_at: Utc::now(),
            error_message: None,
            messages: vec![],
            version: 0,
        }
    }

    pub fn state(&self) -> OutOfBandState {
        self.state
    }

    /// `domain?m=<base64url message>`, the legacy connectionless URL form.
    pub fn to_url(&self, domain: &str) -> Result<String> {
        Ok(format!(
            "{}?m={}",
            domain,
            base64_url::encode(&self.message.to_bytes()?)
        ))
    }
}

/// Message carried in the `m` parameter of a connectionless URL.
pub fn message_from_url(url: &str) -> Result<PlaintextMessage> {
    let encoded = url
        .split_once('?')
        .map(|(_, query)| query)
        .into_iter()
        .flat_map(|query| query.split('&'))
        .filter_map(|pair| pair.split_once('='))
        .find(|(name, _)| *name == "m")
        .map(|(_, value)| value)
        .ok_or_else(|| Error::InvalidMessage(format!("no message in url {}", url)))?;
    PlaintextMessage::from_bytes(&base64_url::decode(encoded)?)
}

impl Record for OutOfBandRecord {
    const TYPE: &'static str = "OutOfBand";

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

    fn tags(&self) -> HashMap<String, String> {
        let mut tags = HashMap::new();
        tags.insert("role".to_string(), self.role.to_string());
        tags.insert("state".to_string(), self.state.to_string());
        tags
    }
}

impl ExchangeRecord for OutOfBandRecord {
    type State = OutOfBandState;

    fn state(&self) -> OutOfBandState {
        self.state
    }

    fn apply_state(&mut self, state: OutOfBandState, _: Transition) {
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

    fn state_changed_event(&self, previous_state: Option<OutOfBandState>) -> AgentEvent {
        AgentEvent::OutOfBandStateChanged {
            record: self.clone(),
            previous_state,
        }
    }
}

/// Both ends of an exchange running without a connection. Each side keeps
/// its own key and `~service` and learns the peer's from the messages.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionlessRoute {
    pub my_key: Key,
    pub my_service: ServiceDecorator,
    pub their_service: Option<ServiceDecorator>,
}

impl ConnectionlessRoute {
    /// `message` with this side's `~service`, packed for the peer's service.
    pub fn outbound(&self, message: PlaintextMessage) -> Result<OutboundMessageContext> {
        let their_service = self.their_service.clone().ok_or_else(|| {
            Error::InvalidMessage(format!(
                "peer of connectionless thread {} announced no service",
                message.thread_id()
            ))
        })?;
        Ok(OutboundMessageContext::connectionless(
            message.set_service(self.my_service.clone()),
            their_service,
            Some(self.my_key.clone()),
        ))
    }

    /// Remembers the peer's `~service` the first time it shows up.
    pub fn learn(&mut self, service: Option<&ServiceDecorator>) {
        if self.their_service.is_none() {
            self.their_service = service.cloned();
        }
    }

    /// Once the peer's service is known, only its keys may continue the thread.
    pub fn assert_peer(&self, sender_key: Option<&Key>) -> Result<()> {
        let (their_service, sender_key) = match (&self.their_service, sender_key) {
            (Some(service), Some(key)) => (service, key),
            _ => return Ok(()),
        };
        if their_service.recipient_keys.contains(&sender_key.fingerprint()) {
            Ok(())
        } else {
            Err(Error::InvalidMessage(format!(
                "{} is not a key of the connectionless peer",
                sender_key.fingerprint()
            )))
        }
    }
}

/// Out-of-band records of both roles.
#[derive(Clone)]
pub struct OutOfBandService {
    engine: ExchangeEngine<OutOfBandRecord>,
}

impl OutOfBandService {
    pub fn new(repository: Arc<dyn Repository<OutOfBandRecord>>, events: EventBus) -> Self {
        OutOfBandService {
            engine: ExchangeEngine::new(repository, events),
        }
    }

    /// Sender: records `message` as handed out. It must carry a `~service`,
    /// the only way back to this agent.
    pub async fn create_connectionless(
        &self,
        message: &PlaintextMessage,
        exchange_id: Option<&str>,
    ) -> Result<OutOfBandRecord> {
        if message.service.is_none() {
            return Err(Error::InvalidMessage(format!(
                "out-of-band message {} has no ~service",
                message.id
            )));
        }
        let mut record =
            OutOfBandRecord::new(OutOfBandRole::Sender, OutOfBandState::AwaitResponse, message);
        record.exchange_id = exchange_id.map(str::to_string);
        self.engine.create_record(&record).await?;
        Ok(record)
    }

    /// Receiver: records `message` before it is processed.
    pub async fn receive_connectionless(&self, message: &PlaintextMessage) -> Result<OutOfBandRecord> {
        if message.service.is_none() {
            return Err(Error::InvalidMessage(format!(
                "out-of-band message {} has no ~service",
                message.id
            )));
        }
        if let Some(existing) = self.engine.find_by_thread(message.thread_id(), None).await? {
            return Err(Error::RecordExists {
                record_type: OutOfBandRecord::TYPE,
                id: existing.id,
            });
        }
        let record =
            OutOfBandRecord::new(OutOfBandRole::Receiver, OutOfBandState::PrepareResponse, message);
        self.engine.create_record(&record).await?;
        Ok(record)
    }

    /// Finishes the out-of-band record of `thread_id`, if there is one. The
    /// sender finishes on the first answer, the receiver once it answered.
    pub async fn complete(&self, thread_id: &str) -> Result<Option<OutOfBandRecord>> {
        let mut record = match self.engine.find_by_thread(thread_id, None).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        if !record.state().is_terminal() {
            self.engine
                .update_state(&mut record, OutOfBandState::Done)
                .await?;
        }
        Ok(Some(record))
    }

    pub async fn get_by_id(&self, record_id: &str) -> Result<OutOfBandRecord> {
        self.engine.get_by_id(record_id).await
    }

    pub async fn get_all(&self) -> Result<Vec<OutOfBandRecord>> {
        self.engine.repository().get_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        protocols::trust_ping::Ping,
        storage::InMemoryRepository,
        wallet::KeyType,
    };

    fn service(key: &Key) -> ServiceDecorator {
        ServiceDecorator {
            recipient_keys: vec![key.fingerprint()],
            routing_keys: vec![],
            service_endpoint: "loop://verifier".into(),
        }
    }

    fn message_with_service(key: &Key) -> Result<PlaintextMessage> {
        Ok(PlaintextMessage::new(&Ping {
            response_requested: true,
            comment: None,
        })?
        .set_service(service(key)))
    }

    fn oob() -> OutOfBandService {
        OutOfBandService::new(Arc::new(InMemoryRepository::new()), EventBus::new(8))
    }

    #[test]
    fn only_open_records_finish() {
        use OutOfBandState::*;
        assert!(AwaitResponse.can_transition_to(Done));
        assert!(PrepareResponse.can_transition_to(Done));
        assert!(!Done.can_transition_to(AwaitResponse));
        assert!(!Abandoned.can_transition_to(Done));
    }

    #[tokio::test]
    async fn sender_waits_until_the_thread_is_answered() -> Result<()> {
        // Arrange
        let service = oob();
        let message = message_with_service(&Key::new(KeyType::X25519, [7u8; 32]))?;
        let created = service.create_connectionless(&message, Some("exchange")).await?;

        // Act
        let completed = service.complete(message.thread_id()).await?;
        let again = service.complete(message.thread_id()).await?;

        // Assert
        assert_eq!(created.state(), OutOfBandState::AwaitResponse);
        assert_eq!(created.exchange_id.as_deref(), Some("exchange"));
        assert_eq!(completed.map(|r| r.state()), Some(OutOfBandState::Done));
        assert_eq!(again.map(|r| r.state()), Some(OutOfBandState::Done));
        assert!(service.complete("unknown thread").await?.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn message_without_service_is_refused() -> Result<()> {
        let message = PlaintextMessage::new(&Ping {
            response_requested: true,
            comment: None,
        })?;
        let service = oob();
        assert!(service.create_connectionless(&message, None).await.is_err());
        assert!(service.receive_connectionless(&message).await.is_err());
        assert!(service.get_all().await?.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn same_message_is_received_once() -> Result<()> {
        let service = oob();
        let message = message_with_service(&Key::new(KeyType::X25519, [9u8; 32]))?;
        service.receive_connectionless(&message).await?;
        let second = service.receive_connectionless(&message).await;
        assert!(matches!(second, Err(Error::RecordExists { .. })));
        Ok(())
    }

    #[test]
    fn url_carries_the_message() -> Result<()> {
        let message = message_with_service(&Key::new(KeyType::X25519, [3u8; 32]))?;
        let record = OutOfBandRecord::new(OutOfBandRole::Sender, OutOfBandState::AwaitResponse, &message);
        let url = record.to_url("https://verifier.example/proof")?;
        assert!(url.starts_with("https://verifier.example/proof?m="));
        assert_eq!(message_from_url(&url)?, message);
        assert!(message_from_url("https://verifier.example/proof").is_err());
        Ok(())
    }

    #[test]
    fn only_the_known_peer_continues_the_thread() {
        let peer = Key::new(KeyType::X25519, [1u8; 32]);
        let stranger = Key::new(KeyType::X25519, [2u8; 32]);
        let mut route = ConnectionlessRoute {
            my_key: Key::new(KeyType::X25519, [5u8; 32]),
            my_service: service(&Key::new(KeyType::X25519, [5u8; 32])),
            their_service: None,
        };
        assert!(route.assert_peer(Some(&stranger)).is_ok());

        route.learn(Some(&service(&peer)));
        route.learn(Some(&service(&stranger)));

        assert!(route.assert_peer(Some(&peer)).is_ok());
        assert!(route.assert_peer(Some(&stranger)).is_err());
    }
}
