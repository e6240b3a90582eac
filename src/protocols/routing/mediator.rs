use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use super::{
    recipient_key_tag, Batch, BatchMessage, BatchPickup, Forward, KeylistUpdateAction,
    KeylistUpdateMessage, KeylistUpdateResponse, KeylistUpdateResult, KeylistUpdated,
    MediationDeny, MediationGrant, MediationRecord, MediationRole, MediationState,
};
use crate::{
    agent::{
        message_types, AgentContext, Handler, InboundMessageContext, MessageSender,
        OutboundMessageContext,
    },
    messages::{MessageType, PlaintextMessage, Shape},
    protocols::{
        connections::ConnectionService,
        exchange::{assert_state, Direction, ExchangeEngine, ExchangeRecord},
    },
    storage::{Query, Repository},
    wallet::{Key, KeyType},
    Error, Result,
};

/// Mediator side of coordinate-mediation, forwarding and pickup.
#[derive(Clone)]
pub struct MediatorService {
    engine: ExchangeEngine<MediationRecord>,
    context: Arc<AgentContext>,
    connections: Arc<ConnectionService>,
    sender: MessageSender,
    routing_key: Arc<OnceCell<Key>>,
}

impl MediatorService {
    pub fn new(
        context: Arc<AgentContext>,
        repository: Arc<dyn Repository<MediationRecord>>,
        connections: Arc<ConnectionService>,
        sender: MessageSender,
    ) -> Self {
        MediatorService {
            engine: ExchangeEngine::new(repository, context.events.clone()),
            context,
            connections,
            sender,
            routing_key: Arc::new(OnceCell::new()),
        }
    }

    /// Key every granted recipient routes through, created on first use.
    pub async fn routing_key(&self) -> Result<Key> {
        let key = self
            .routing_key
            .get_or_try_init(|| async { self.context.wallet.create_key(KeyType::X25519, None).await })
            .await?;
        Ok(key.clone())
    }

    pub async fn process_mediation_request(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<MediationRecord> {
        let connection = ctx.assert_ready_connection()?;
        let mut record = MediationRecord::new(
            MediationRole::Mediator,
            &connection.id,
            ctx.message.thread_id(),
        );
        record.mediator_did = Some(connection.my_did.clone());
        record.recipient_did = connection.their_did.clone();
        record.add_message(&ctx.message, Direction::Inbound);
        self.engine.create_record(&record).await?;
        info!(
            "mediation {} requested over connection {}",
            record.id, connection.id
        );
        Ok(record)
    }

    pub async fn create_grant(
        &self,
        mediation_id: &str,
    ) -> Result<(MediationRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(mediation_id).await?;
        assert_state(&record, &[MediationState::Requested], MediationState::Granted)?;
        let endpoint = self
            .context
            .config
            .endpoints
            .first()
            .cloned()
            .ok_or_else(|| Error::Config("a mediator needs an endpoint".into()))?;
        let grant = MediationGrant {
            endpoint: endpoint.clone(),
            routing_keys: vec![self.routing_key().await?.fingerprint()],
        };
        let message = PlaintextMessage::new(&grant)?.set_thread_id(&record.thread_id);
        record.endpoint = Some(endpoint);
        record.routing_keys = grant.routing_keys;
        record.add_message(&message, Direction::Outbound);
        self.engine
            .update_state(&mut record, MediationState::Granted)
            .await?;
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    pub async fn create_deny(
        &self,
        mediation_id: &str,
    ) -> Result<(MediationRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(mediation_id).await?;
        assert_state(&record, &[MediationState::Requested], MediationState::Denied)?;
        let message = PlaintextMessage::new(&MediationDeny::default())?.set_thread_id(&record.thread_id);
        record.add_message(&message, Direction::Outbound);
        self.engine
            .update_state(&mut record, MediationState::Denied)
            .await?;
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    async fn outbound(
        &self,
        record: &MediationRecord,
        message: PlaintextMessage,
    ) -> Result<OutboundMessageContext> {
        let connection = self.connections.get_by_id(&record.connection_id).await?;
        Ok(OutboundMessageContext::for_connection(message, connection))
    }

    async fn granted_record(&self, connection_id: &str) -> Result<MediationRecord> {
        let record = self
            .engine
            .repository()
            .get_single_by_query(
                &Query::tag("role", "mediator").with_connection(Some(connection_id)),
            )
            .await?;
        assert_state(&record, &[MediationState::Granted], MediationState::Granted)?;
        Ok(record)
    }

    /// Applies the recipient's key additions and removals.
    pub async fn process_keylist_update(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<(MediationRecord, KeylistUpdateResponse)> {
        let update: KeylistUpdateMessage = ctx.message.decode()?;
        let connection = ctx.assert_ready_connection()?;
        let mut record = self.granted_record(&connection.id).await?;
        let mut updated = vec![];
        for entry in update.updates {
            let known = record.recipient_keys.contains(&entry.recipient_key);
            let result = match entry.action {
                KeylistUpdateAction::Add if Key::from_fingerprint(KeyType::X25519, &entry.recipient_key).is_err() => {
                    KeylistUpdateResult::ClientError
                }
                KeylistUpdateAction::Add if !known => {
                    record.recipient_keys.push(entry.recipient_key.clone());
                    KeylistUpdateResult::Success
                }
                KeylistUpdateAction::Remove if known => {
                    record.recipient_keys.retain(|k| *k != entry.recipient_key);
                    KeylistUpdateResult::Success
                }
                _ => KeylistUpdateResult::NoChange,
            };
            debug!(
                "keylist {:?} {} for mediation {}: {:?}",
                entry.action, entry.recipient_key, record.id, result
            );
            updated.push(KeylistUpdated {
                recipient_key: entry.recipient_key,
                action: entry.action,
                result,
            });
        }
        record.add_message(&ctx.message, Direction::Inbound);
        self.engine.update(&mut record).await?;
        Ok((record, KeylistUpdateResponse { updated }))
    }

    /// Delivers the forwarded message to the recipient owning `forward.to`:
    /// over an open session, to its endpoint or into its pickup queue.
    pub async fn process_forward(&self, ctx: &InboundMessageContext) -> Result<()> {
        let forward: Forward = ctx.message.decode()?;
        let record = self
            .engine
            .repository()
            .get_single_by_query(
                &Query::tag("role", "mediator").with_tag(&recipient_key_tag(&forward.to), "true"),
            )
            .await?;
        let connection = self.connections.get_by_id(&record.connection_id).await?;
        trace!(
            "forwarding {} to {} over connection {}",
            ctx.message.id,
            forward.to,
            connection.id
        );
        self.sender.send_package(&connection, forward.msg).await
    }

    /// Batch of queued messages for the requesting connection.
    pub async fn process_batch_pickup(&self, ctx: &InboundMessageContext) -> Result<PlaintextMessage> {
        let pickup: BatchPickup = ctx.message.decode()?;
        let connection = ctx.assert_ready_connection()?;
        let messages = self
            .context
            .queue
            .take(&connection.id, pickup.batch_size)
            .await
            .into_iter()
            .map(|message| BatchMessage {
                id: uuid::Uuid::new_v4().to_string(),
                message,
            })
            .collect::<Vec<_>>();
        debug!(
            "picked up {} messages for connection {}",
            messages.len(),
            connection.id
        );
        Ok(PlaintextMessage::new(&Batch { messages })?.reply_to(&ctx.message))
    }

    pub async fn get_all(&self) -> Result<Vec<MediationRecord>> {
        self.engine.repository().get_all().await
    }
}

/// Mediation requests, keylist updates and batch pickups of recipients.
pub struct MediatorHandler {
    mediator: Arc<MediatorService>,
}

impl MediatorHandler {
    pub fn new(mediator: Arc<MediatorService>) -> Self {
        MediatorHandler { mediator }
    }
}

#[async_trait]
impl Handler for MediatorHandler {
    fn supported_message_types(&self) -> Vec<MessageType> {
        message_types(&[
            super::MediationRequest::TYPE,
            KeylistUpdateMessage::TYPE,
            BatchPickup::TYPE,
        ])
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>> {
        let reply = match ctx.message.message_type.name() {
            "mediate-request" => {
                let record = self.mediator.process_mediation_request(ctx).await?;
                if !self.mediator.context.config.auto_accept_mediation_requests {
                    return Ok(None);
                }
                self.mediator.create_grant(&record.id).await?.1.message
            }
            "keylist-update" => {
                let (_, response) = self.mediator.process_keylist_update(ctx).await?;
                PlaintextMessage::new(&response)?.reply_to(&ctx.message)
            }
            "batch-pickup" => self.mediator.process_batch_pickup(ctx).await?,
            _ => return Err(Error::NoHandler(ctx.message.message_type.uri())),
        };
        OutboundMessageContext::reply(ctx, reply).map(Some)
    }
}

/// Forward messages arrive anoncrypted to the routing key, so they never
/// carry a connection.
pub struct ForwardHandler {
    mediator: Arc<MediatorService>,
}

impl ForwardHandler {
    pub fn new(mediator: Arc<MediatorService>) -> Self {
        ForwardHandler { mediator }
    }
}

#[async_trait]
impl Handler for ForwardHandler {
    fn supported_message_types(&self) -> Vec<MessageType> {
        message_types(&[Forward::TYPE])
    }

    fn requires_connection(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>> {
        self.mediator.process_forward(ctx).await?;
        Ok(None)
    }
}
