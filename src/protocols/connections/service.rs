use std::sync::Arc;

use super::{
    ConnectionRecord, ConnectionRequest, ConnectionResponse, ConnectionRole, ConnectionState,
    Connection, DidDoc, Invitation,
};
use crate::{
    agent::{AgentContext, InboundMessageContext, OutboundMessageContext, DID_COMM_TRANSPORT_QUEUE},
    messages::{PlaintextMessage, ReturnRoute},
    protocols::{
        exchange::{assert_state, Direction, ExchangeEngine, ExchangeRecord},
        routing::Routing,
        trust_ping::Ping,
    },
    storage::{Query, Repository},
    wallet::{Key, KeyType},
    Error, Result,
};

/// Connection protocol state machine. Never sends anything itself; outbound
/// messages are returned to the caller.
#[derive(Clone)]
pub struct ConnectionService {
    engine: ExchangeEngine<ConnectionRecord>,
    context: Arc<AgentContext>,
}

impl ConnectionService {
    pub fn new(context: Arc<AgentContext>, repository: Arc<dyn Repository<ConnectionRecord>>) -> Self {
        ConnectionService {
            engine: ExchangeEngine::new(repository, context.events.clone()),
            context,
        }
    }

    /// Creates an invitation for `routing` and the inviter's record. The
    /// invitation key stays the inviter's key of the connection.
    pub async fn create_invitation(
        &self,
        routing: Routing,
        auto_accept: Option<bool>,
    ) -> Result<(ConnectionRecord, PlaintextMessage)> {
        let service = routing.service();
        let invitation = Invitation {
            label: self.context.config.label.clone(),
            recipient_keys: service.recipient_keys.clone(),
            service_endpoint: service.service_endpoint.clone(),
            routing_keys: service.routing_keys.clone(),
        };
        let message = PlaintextMessage::new(&invitation)?;
        let mut record = ConnectionRecord::new(
            ConnectionRole::Inviter,
            message.id.clone(),
            routing.recipient_key,
            service,
        );
        record.invitation = Some(invitation);
        record.auto_accept = auto_accept;
        record.mediator_id = routing.mediator_id;
        record.add_message(&message, Direction::Outbound);
        self.engine.create_record(&record).await?;
        Ok((record, message))
    }

    /// Stores a received invitation as invitee record in state `invited`.
    pub async fn process_invitation(
        &self,
        message: &PlaintextMessage,
        routing: Routing,
        auto_accept: Option<bool>,
    ) -> Result<ConnectionRecord> {
        let invitation: Invitation = message.decode()?;
        let their_key = Key::from_fingerprint(KeyType::X25519, &invitation.recipient_keys[0])?;
        let mut record = ConnectionRecord::new(
            ConnectionRole::Invitee,
            message.id.clone(),
            routing.recipient_key.clone(),
            routing.service(),
        );
        record.their_key = Some(their_key);
        record.their_label = Some(invitation.label.clone());
        record.their_service = Some(invitation.service());
        record.invitation = Some(invitation);
        record.auto_accept = auto_accept;
        record.mediator_id = routing.mediator_id;
        record.add_message(message, Direction::Inbound);
        self.engine.create_record(&record).await?;
        Ok(record)
    }

    pub async fn create_request(
        &self,
        connection_id: &str,
    ) -> Result<(ConnectionRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(connection_id).await?;
        assert_role(&record, ConnectionRole::Invitee)?;
        assert_state(&record, &[ConnectionState::Invited], ConnectionState::Requested)?;

        let request = ConnectionRequest {
            label: self.context.config.label.clone(),
            connection: Connection {
                did: record.my_did.clone(),
                did_doc: DidDoc::new(&record.my_key, &record.my_service),
            },
        };
        let mut message =
            PlaintextMessage::new(&request)?.set_parent_thread_id(&record.invitation_id);
        // Without an endpoint the response can only come back on the same channel.
        if record.my_service.service_endpoint == DID_COMM_TRANSPORT_QUEUE {
            message = message.set_return_route(ReturnRoute::All);
        }
        record.thread_id = Some(message.thread_id().to_string());
        record.add_message(&message, Direction::Outbound);
        self.engine
            .update_state(&mut record, ConnectionState::Requested)
            .await?;
        let outbound = OutboundMessageContext::for_connection(message, record.clone());
        Ok((record, outbound))
    }

    /// Matches a request to the inviter's record through the invitation key
    /// it was encrypted for.
    pub async fn process_request(&self, ctx: &InboundMessageContext) -> Result<ConnectionRecord> {
        let request: ConnectionRequest = ctx.message.decode()?;
        let recipient_key = ctx.recipient_key().ok_or_else(|| {
            Error::InvalidMessage("connection request must be encrypted to the invitation key".into())
        })?;
        let mut record = self
            .engine
            .repository()
            .get_single_by_query(
                &Query::tag("my_key", &recipient_key.fingerprint()).with_tag("role", "inviter"),
            )
            .await?;
        assert_state(&record, &[ConnectionState::Invited], ConnectionState::Requested)?;

        let service = request.connection.did_doc.agent_service()?.clone();
        let their_key = Key::from_fingerprint(KeyType::X25519, &service.recipient_keys[0])?;
        if let Some(sender_key) = ctx.sender_key() {
            if *sender_key != their_key {
                return Err(Error::InvalidMessage(format!(
                    "request sent with key {} but announces {}",
                    sender_key.fingerprint(),
                    their_key.fingerprint()
                )));
            }
        }
        record.their_did = Some(request.connection.did.clone());
        record.their_key = Some(their_key);
        record.their_label = Some(request.label);
        record.their_service = Some(service);
        record.thread_id = Some(ctx.message.thread_id().to_string());
        record.add_message(&ctx.message, Direction::Inbound);
        self.engine
            .update_state(&mut record, ConnectionState::Requested)
            .await?;
        Ok(record)
    }

    pub async fn create_response(
        &self,
        connection_id: &str,
    ) -> Result<(ConnectionRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(connection_id).await?;
        assert_role(&record, ConnectionRole::Inviter)?;
        assert_state(&record, &[ConnectionState::Requested], ConnectionState::Responded)?;
        let thread_id = record
            .thread_id
            .clone()
            .ok_or_else(|| Error::Generic(format!("connection {} has no thread", record.id)))?;

        let response = ConnectionResponse {
            connection: Connection {
                did: record.my_did.clone(),
                did_doc: DidDoc::new(&record.my_key, &record.my_service),
            },
        };
        let message = PlaintextMessage::new(&response)?.set_thread_id(&thread_id);
        record.add_message(&message, Direction::Outbound);
        self.engine
            .update_state(&mut record, ConnectionState::Responded)
            .await?;
        let outbound = OutboundMessageContext::for_connection(message, record.clone());
        Ok((record, outbound))
    }

    pub async fn process_response(&self, ctx: &InboundMessageContext) -> Result<ConnectionRecord> {
        let response: ConnectionResponse = ctx.message.decode()?;
        let mut record = self
            .engine
            .get_by_thread(ctx.message.thread_id(), None)
            .await?;
        assert_role(&record, ConnectionRole::Invitee)?;
        assert_state(&record, &[ConnectionState::Requested], ConnectionState::Responded)?;

        let service = response.connection.did_doc.agent_service()?.clone();
        let their_key = Key::from_fingerprint(KeyType::X25519, &service.recipient_keys[0])?;
        if record.their_key.as_ref() != Some(&their_key) {
            return Err(Error::InvalidMessage(format!(
                "response announces key {} not used in the invitation",
                their_key.fingerprint()
            )));
        }
        record.their_did = Some(response.connection.did.clone());
        record.their_service = Some(service);
        record.add_message(&ctx.message, Direction::Inbound);
        self.engine
            .update_state(&mut record, ConnectionState::Responded)
            .await?;
        Ok(record)
    }

    /// Trust ping over `connection_id`, completing a responded connection.
    pub async fn create_trust_ping(
        &self,
        connection_id: &str,
        response_requested: bool,
    ) -> Result<(ConnectionRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(connection_id).await?;
        record.assert_ready()?;
        let message = PlaintextMessage::new(&Ping {
            response_requested,
            comment: None,
        })?;
        if record.state() == ConnectionState::Responded {
            record.add_message(&message, Direction::Outbound);
            self.engine
                .update_state(&mut record, ConnectionState::Complete)
                .await?;
        }
        let outbound = OutboundMessageContext::for_connection(message, record.clone());
        Ok((record, outbound))
    }

    /// First message over a responded connection acknowledges it.
    pub async fn complete(&self, connection_id: &str) -> Result<ConnectionRecord> {
        let mut record = self.engine.get_by_id(connection_id).await?;
        if record.state() == ConnectionState::Responded {
            self.engine
                .update_state(&mut record, ConnectionState::Complete)
                .await?;
        }
        Ok(record)
    }

    pub async fn process_problem_report(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<ConnectionRecord> {
        let record = self
            .engine
            .process_problem_report(&ctx.message, None)
            .await?;
        warn!(
            "connection {} abandoned: {}",
            record.id,
            record.error_message.as_deref().unwrap_or_default()
        );
        Ok(record)
    }

    /// Connection over which `sender` talks to our `recipient` key.
    pub async fn find_by_keys(&self, sender: &Key, recipient: &Key) -> Result<Option<ConnectionRecord>> {
        self.engine
            .repository()
            .find_single_by_query(
                &Query::tag("their_key", &sender.fingerprint())
                    .with_tag("my_key", &recipient.fingerprint()),
            )
            .await
    }

    pub async fn find_by_invitation_id(&self, invitation_id: &str) -> Result<Option<ConnectionRecord>> {
        self.engine
            .repository()
            .find_single_by_query(&Query::tag("invitation_id", invitation_id))
            .await
    }

    pub async fn get_by_id(&self, connection_id: &str) -> Result<ConnectionRecord> {
        self.engine.get_by_id(connection_id).await
    }

    pub async fn get_all(&self) -> Result<Vec<ConnectionRecord>> {
        self.engine.repository().get_all().await
    }

    pub fn should_auto_accept(&self, record: &ConnectionRecord) -> bool {
        record
            .auto_accept
            .unwrap_or(self.context.config.auto_accept_connections)
    }
}

fn assert_role(record: &ConnectionRecord, role: ConnectionRole) -> Result<()> {
    if record.role == role {
        Ok(())
    } else {
        Err(Error::InvalidMessage(format!(
            "connection {} has role {}, expected {}",
            record.id, record.role, role
        )))
    }
}

