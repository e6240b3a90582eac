use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{events::EventBus, transport::TransportService};
use crate::{
    config::AgentConfig,
    envelope::EnvelopeService,
    messages::{PlaintextMessage, ServiceDecorator},
    protocols::{connections::ConnectionRecord, routing::MessageQueue},
    wallet::{Key, Wallet},
    Error, Result,
};

/// Packed message waiting to be dispatched, e.g. a message returned on an
/// outbound channel or taken from a pickup batch.
#[derive(Debug, Clone)]
pub struct InboundDelivery {
    pub payload: Vec<u8>,
}

/// Collaborators and configuration of one agent. Several contexts may live in
/// one process; nothing here is global.
pub struct AgentContext {
    pub config: AgentConfig,
    pub wallet: Arc<dyn Wallet>,
    pub envelope: EnvelopeService,
    pub events: EventBus,
    pub transport_service: TransportService,
    pub queue: MessageQueue,
    pub shutdown: CancellationToken,
    pub(crate) inbound: mpsc::UnboundedSender<InboundDelivery>,
}

impl AgentContext {
    pub fn new(
        config: AgentConfig,
        wallet: Arc<dyn Wallet>,
        inbound: mpsc::UnboundedSender<InboundDelivery>,
    ) -> Self {
        let events = EventBus::new(config.event_channel_capacity);
        AgentContext {
            envelope: EnvelopeService::new(wallet.clone()),
            events,
            transport_service: TransportService::default(),
            queue: MessageQueue::default(),
            shutdown: CancellationToken::new(),
            config,
            wallet,
            inbound,
        }
    }

    /// Hands a packed message to the inbound dispatcher.
    pub fn deliver_inbound(&self, payload: Vec<u8>) -> Result<()> {
        self.inbound
            .send(InboundDelivery { payload })
            .map_err(|_| Error::Shutdown)
    }
}

/// Keys and connection resolved for one inbound message.
#[derive(Debug, Clone, Default)]
pub struct ConnectionContext {
    pub sender_key: Option<Key>,
    pub recipient_key: Option<Key>,
    pub connection: Option<ConnectionRecord>,
}

/// Everything a handler gets to see of one inbound message.
#[derive(Debug, Clone)]
pub struct InboundMessageContext {
    pub message: PlaintextMessage,
    pub connection_context: ConnectionContext,
    /// Inbound transport session kept open for return routing.
    pub session_id: Option<String>,
}

impl InboundMessageContext {
    pub fn new(message: PlaintextMessage, connection_context: ConnectionContext) -> Self {
        InboundMessageContext {
            message,
            connection_context,
            session_id: None,
        }
    }

    pub fn connection(&self) -> Option<&ConnectionRecord> {
        self.connection_context.connection.as_ref()
    }

    pub fn connection_id(&self) -> Option<&str> {
        self.connection().map(|c| c.id.as_str())
    }

    pub fn sender_key(&self) -> Option<&Key> {
        self.connection_context.sender_key.as_ref()
    }

    pub fn recipient_key(&self) -> Option<&Key> {
        self.connection_context.recipient_key.as_ref()
    }

    /// Connection of the message, failing unless it is ready for use.
    pub fn assert_ready_connection(&self) -> Result<&ConnectionRecord> {
        let connection = self.connection().ok_or(Error::MissingConnection)?;
        connection.assert_ready()?;
        Ok(connection)
    }

    /// Ready connection of the message, or `None` for a connectionless
    /// message answering through its own `~service`.
    pub fn connection_or_service(&self) -> Result<Option<&ConnectionRecord>> {
        match self.connection() {
            Some(connection) => {
                connection.assert_ready()?;
                Ok(Some(connection))
            }
            None if self.message.service.is_some() => Ok(None),
            None => Err(Error::MissingConnection),
        }
    }
}

/// Where a connectionless message goes and which key it is packed with.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundService {
    pub service: ServiceDecorator,
    pub sender_key: Option<Key>,
}

/// A message to send with its destination.
#[derive(Debug, Clone)]
pub struct OutboundMessageContext {
    pub message: PlaintextMessage,
    pub connection: Option<ConnectionRecord>,
    pub service: Option<OutboundService>,
    /// Session the triggering message came in on.
    pub inbound_session_id: Option<String>,
}

impl OutboundMessageContext {
    pub fn for_connection(message: PlaintextMessage, connection: ConnectionRecord) -> Self {
        OutboundMessageContext {
            message,
            connection: Some(connection),
            service: None,
            inbound_session_id: None,
        }
    }

    pub fn connectionless(
        message: PlaintextMessage,
        service: ServiceDecorator,
        sender_key: Option<Key>,
    ) -> Self {
        OutboundMessageContext {
            message,
            connection: None,
            service: Some(OutboundService {
                service,
                sender_key,
            }),
            inbound_session_id: None,
        }
    }

    /// Reply to `inbound`: same connection (or the inline `~service` of a
    /// connectionless message) and same inbound session.
    pub fn reply(inbound: &InboundMessageContext, message: PlaintextMessage) -> Result<Self> {
        let mut outbound = match (inbound.connection(), &inbound.message.service) {
            (Some(connection), _) => Self::for_connection(message, connection.clone()),
            (None, Some(service)) => Self::connectionless(
                message,
                service.clone(),
                inbound.recipient_key().cloned(),
            ),
            (None, None) => return Err(Error::MissingConnection),
        };
        outbound.inbound_session_id = inbound.session_id.clone();
        Ok(outbound)
    }
}
