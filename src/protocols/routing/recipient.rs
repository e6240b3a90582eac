use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use super::{
    Batch, KeylistUpdate, KeylistUpdateAction, KeylistUpdateMessage, KeylistUpdateResponse,
    KeylistUpdateResult, KeylistUpdated, MediationDeny, MediationGrant, MediationRecord,
    MediationRequest, MediationRole, MediationState, Routing,
};
use crate::{
    agent::{
        message_types, AgentContext, AgentEvent, EventBus, Handler, InboundMessageContext,
        MessageSender, OutboundMessageContext, DID_COMM_TRANSPORT_QUEUE,
    },
    messages::{MessageType, PlaintextMessage, ReturnRoute, Shape},
    protocols::{
        connections::ConnectionService,
        exchange::{assert_state, Direction, ExchangeEngine, ExchangeRecord},
    },
    storage::{Query, Repository},
    wallet::KeyType,
    Error, Result,
};

const KEYLIST_UPDATE_TIMEOUT: Duration = Duration::from_secs(15);

/// Recipient side of coordinate-mediation.
#[derive(Clone)]
pub struct MediationRecipientService {
    engine: ExchangeEngine<MediationRecord>,
    context: Arc<AgentContext>,
    connections: Arc<ConnectionService>,
    sender: MessageSender,
}

impl MediationRecipientService {
    pub fn new(
        context: Arc<AgentContext>,
        repository: Arc<dyn Repository<MediationRecord>>,
        connections: Arc<ConnectionService>,
        sender: MessageSender,
    ) -> Self {
        MediationRecipientService {
            engine: ExchangeEngine::new(repository, context.events.clone()),
            context,
            connections,
            sender,
        }
    }

    pub async fn create_request(
        &self,
        connection_id: &str,
    ) -> Result<(MediationRecord, OutboundMessageContext)> {
        let connection = self.connections.get_by_id(connection_id).await?;
        connection.assert_ready()?;
        // Replies come back on the same channel, the recipient may have no endpoint.
        let message = PlaintextMessage::new(&MediationRequest::default())?
            .set_return_route(ReturnRoute::All);
        let mut record =
            MediationRecord::new(MediationRole::Recipient, &connection.id, message.thread_id());
        record.mediator_did = connection.their_did.clone();
        record.recipient_did = Some(connection.my_did.clone());
        record.pickup_strategy = Some(self.context.config.mediator_pickup_strategy);
        record.add_message(&message, Direction::Outbound);
        self.engine.create_record(&record).await?;
        Ok((
            record,
            OutboundMessageContext::for_connection(message, connection),
        ))
    }

    /// Sends a mediation request and waits until the mediator granted or
    /// denied it.
    pub async fn request_and_await_grant(
        &self,
        connection_id: &str,
        timeout: Duration,
    ) -> Result<MediationRecord> {
        let receiver = self.context.events.subscribe();
        let (record, outbound) = self.create_request(connection_id).await?;
        self.sender.send(outbound).await?;
        let record_id = record.id.clone();
        let record = EventBus::wait_for(receiver, timeout, "mediation grant", |event| match event {
            AgentEvent::MediationStateChanged { record, .. }
                if record.id == record_id && record.state() != MediationState::Requested =>
            {
                Some(record.clone())
            }
            _ => None,
        })
        .await?;
        if record.state() == MediationState::Denied {
            return Err(Error::ProblemReported {
                code: "mediate-deny".into(),
                comment: format!("mediation {} denied", record.id),
            });
        }
        Ok(record)
    }

    pub async fn process_grant(&self, ctx: &InboundMessageContext) -> Result<MediationRecord> {
        let grant: MediationGrant = ctx.message.decode()?;
        let mut record = self
            .engine
            .get_by_thread(ctx.message.thread_id(), ctx.connection_id())
            .await?;
        assert_state(&record, &[MediationState::Requested], MediationState::Granted)?;
        record.endpoint = Some(grant.endpoint);
        record.routing_keys = grant.routing_keys;
        record.is_default = self.find_default().await?.is_none();
        record.add_message(&ctx.message, Direction::Inbound);
        self.engine
            .update_state(&mut record, MediationState::Granted)
            .await?;
        info!("mediation {} granted", record.id);
        Ok(record)
    }

    pub async fn process_deny(&self, ctx: &InboundMessageContext) -> Result<MediationRecord> {
        ctx.message.decode::<MediationDeny>()?;
        let mut record = self
            .engine
            .get_by_thread(ctx.message.thread_id(), ctx.connection_id())
            .await?;
        assert_state(&record, &[MediationState::Requested], MediationState::Denied)?;
        record.add_message(&ctx.message, Direction::Inbound);
        self.engine
            .abandon(&mut record, "mediation denied".into())
            .await?;
        warn!("mediation {} denied", record.id);
        Ok(record)
    }

    pub async fn create_keylist_update(
        &self,
        mediation_id: &str,
        recipient_key: &str,
        action: KeylistUpdateAction,
    ) -> Result<(MediationRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(mediation_id).await?;
        assert_state(&record, &[MediationState::Granted], MediationState::Granted)?;
        let message = PlaintextMessage::new(&KeylistUpdateMessage {
            updates: vec![KeylistUpdate {
                recipient_key: recipient_key.to_string(),
                action,
            }],
        })?
        .set_return_route(ReturnRoute::All);
        record.add_message(&message, Direction::Outbound);
        self.engine.update(&mut record).await?;
        let connection = self.connections.get_by_id(&record.connection_id).await?;
        Ok((
            record,
            OutboundMessageContext::for_connection(message, connection),
        ))
    }

    /// Records the keys the mediator accepted and tells waiting callers.
    pub async fn process_keylist_update_response(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<MediationRecord> {
        let response: KeylistUpdateResponse = ctx.message.decode()?;
        let connection = ctx.assert_ready_connection()?;
        let mut record = self
            .engine
            .repository()
            .get_single_by_query(
                &Query::tag("role", "recipient")
                    .with_tag("state", "granted")
                    .with_connection(Some(&connection.id)),
            )
            .await?;
        for updated in &response.updated {
            match (updated.action, updated.result) {
                (KeylistUpdateAction::Add, KeylistUpdateResult::Success)
                | (KeylistUpdateAction::Add, KeylistUpdateResult::NoChange) => {
                    if !record.recipient_keys.contains(&updated.recipient_key) {
                        record.recipient_keys.push(updated.recipient_key.clone());
                    }
                }
                (KeylistUpdateAction::Remove, KeylistUpdateResult::Success)
                | (KeylistUpdateAction::Remove, KeylistUpdateResult::NoChange) => {
                    record.recipient_keys.retain(|k| *k != updated.recipient_key);
                }
                (action, result) => warn!(
                    "mediator refused {:?} of {}: {:?}",
                    action, updated.recipient_key, result
                ),
            }
        }
        record.add_message(&ctx.message, Direction::Inbound);
        self.engine.update(&mut record).await?;
        self.context.events.emit(AgentEvent::KeylistUpdateCompleted {
            mediation_id: record.id.clone(),
            thread_id: ctx.message.thread_id().to_string(),
            updated: response.updated,
        });
        Ok(record)
    }

    /// Sends the keylist update and waits for the mediator's answer.
    pub async fn keylist_update_and_await(
        &self,
        mediation_id: &str,
        recipient_key: &str,
        action: KeylistUpdateAction,
    ) -> Result<Vec<KeylistUpdated>> {
        let receiver = self.context.events.subscribe();
        let (_, outbound) = self
            .create_keylist_update(mediation_id, recipient_key, action)
            .await?;
        let thread_id = outbound.message.thread_id().to_string();
        self.sender.send(outbound).await?;
        EventBus::wait_for(
            receiver,
            KEYLIST_UPDATE_TIMEOUT,
            "keylist update response",
            |event| match event {
                AgentEvent::KeylistUpdateCompleted {
                    thread_id: answered,
                    updated,
                    ..
                } if *answered == thread_id => Some(updated.clone()),
                _ => None,
            },
        )
        .await
    }

    /// Fresh key and the routing peers must use to reach it. With a default
    /// mediator the key is registered there first.
    pub async fn get_routing(&self, use_default_mediator: bool) -> Result<Routing> {
        let recipient_key = self
            .context
            .wallet
            .create_key(KeyType::X25519, None)
            .await?;
        let mediator = if use_default_mediator {
            self.find_default().await?
        } else {
            None
        };
        match mediator {
            Some(mediation) => {
                let fingerprint = recipient_key.fingerprint();
                let updated = self
                    .keylist_update_and_await(&mediation.id, &fingerprint, KeylistUpdateAction::Add)
                    .await?;
                if !updated.iter().any(|u| {
                    u.recipient_key == fingerprint
                        && matches!(
                            u.result,
                            KeylistUpdateResult::Success | KeylistUpdateResult::NoChange
                        )
                }) {
                    return Err(Error::Transport(format!(
                        "mediator {} did not accept key {}",
                        mediation.id, fingerprint
                    )));
                }
                Ok(Routing {
                    endpoint: mediation
                        .endpoint
                        .clone()
                        .unwrap_or_else(|| DID_COMM_TRANSPORT_QUEUE.to_string()),
                    routing_keys: mediation.routing_keys.clone(),
                    recipient_key,
                    mediator_id: Some(mediation.id),
                })
            }
            None => Ok(Routing {
                endpoint: self
                    .context
                    .config
                    .endpoints
                    .first()
                    .cloned()
                    .unwrap_or_else(|| DID_COMM_TRANSPORT_QUEUE.to_string()),
                routing_keys: vec![],
                recipient_key,
                mediator_id: None,
            }),
        }
    }

    pub async fn find_default(&self) -> Result<Option<MediationRecord>> {
        let granted = self
            .engine
            .repository()
            .find_by_query(
                &Query::tag("role", "recipient")
                    .with_tag("state", "granted")
                    .with_tag("default", "true"),
            )
            .await?;
        Ok(granted.into_iter().next())
    }

    pub async fn get_by_id(&self, mediation_id: &str) -> Result<MediationRecord> {
        self.engine.get_by_id(mediation_id).await
    }

    pub async fn get_all(&self) -> Result<Vec<MediationRecord>> {
        self.engine.repository().get_all().await
    }
}

/// Answers of the mediator: grants, denials, keylist responses and batches.
pub struct RecipientHandler {
    recipient: Arc<MediationRecipientService>,
}

impl RecipientHandler {
    pub fn new(recipient: Arc<MediationRecipientService>) -> Self {
        RecipientHandler { recipient }
    }
}

#[async_trait]
impl Handler for RecipientHandler {
    fn supported_message_types(&self) -> Vec<MessageType> {
        message_types(&[
            MediationGrant::TYPE,
            MediationDeny::TYPE,
            KeylistUpdateResponse::TYPE,
            Batch::TYPE,
        ])
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>> {
        match ctx.message.message_type.name() {
            "mediate-grant" => {
                self.recipient.process_grant(ctx).await?;
            }
            "mediate-deny" => {
                self.recipient.process_deny(ctx).await?;
            }
            "keylist-update-response" => {
                self.recipient.process_keylist_update_response(ctx).await?;
            }
            "batch" => {
                let batch: Batch = ctx.message.decode()?;
                debug!("received batch of {} messages", batch.messages.len());
                for entry in batch.messages {
                    self.recipient
                        .context
                        .deliver_inbound(serde_json::to_vec(&entry.message)?)?;
                }
            }
            _ => return Err(Error::NoHandler(ctx.message.message_type.uri())),
        }
        Ok(None)
    }
}
