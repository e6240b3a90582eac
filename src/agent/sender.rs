use std::sync::Arc;

use serde_json::Value;

use super::{
    context::{AgentContext, OutboundMessageContext},
    transport::{endpoint_scheme, DuplexSession, OutboundTransport, SessionEntry, DID_COMM_TRANSPORT_QUEUE},
};
use crate::{
    envelope::EnvelopeKeys,
    messages::PlaintextMessage,
    protocols::connections::ConnectionRecord,
    wallet::{Key, KeyType},
    Error, Result,
};

/// Resolved destination of one outbound message.
struct Target {
    keys: EnvelopeKeys,
    endpoint: Option<String>,
    connection_id: Option<String>,
    their_key: Option<Key>,
}

/// Packs outbound messages and delivers them over the first transport
/// candidate that works:
///
/// 1. a return routed inbound session of the peer,
/// 2. the peer's endpoint, directly or through its mediator's forward,
/// 3. the pickup queue when the peer has no endpoint of its own.
///
/// Each candidate is tried at most once per call.
#[derive(Clone)]
pub struct MessageSender {
    context: Arc<AgentContext>,
    transports: Arc<Vec<Arc<dyn OutboundTransport>>>,
}

impl MessageSender {
    pub fn new(context: Arc<AgentContext>, transports: Vec<Arc<dyn OutboundTransport>>) -> Self {
        MessageSender {
            context,
            transports: Arc::new(transports),
        }
    }

    fn transport_for(&self, endpoint: &str) -> Option<Arc<dyn OutboundTransport>> {
        let scheme = endpoint_scheme(endpoint)?;
        self.transports
            .iter()
            .find(|t| t.supported_schemes().iter().any(|s| s == scheme))
            .cloned()
    }

    fn target(&self, outbound: &OutboundMessageContext) -> Result<Target> {
        if let Some(connection) = &outbound.connection {
            let their_key = connection
                .their_key
                .clone()
                .ok_or_else(|| Error::ConnectionNotReady(connection.id.clone()))?;
            let (routing_keys, endpoint) = match &connection.their_service {
                Some(service) => (
                    parse_keys(&service.routing_keys)?,
                    Some(service.service_endpoint.clone()),
                ),
                None => (vec![], None),
            };
            return Ok(Target {
                keys: EnvelopeKeys {
                    recipient_keys: vec![their_key.clone()],
                    routing_keys,
                    sender_key: Some(connection.my_key.clone()),
                },
                endpoint,
                connection_id: Some(connection.id.clone()),
                their_key: Some(their_key),
            });
        }
        if let Some(outbound_service) = &outbound.service {
            let recipient_keys = parse_keys(&outbound_service.service.recipient_keys)?;
            return Ok(Target {
                their_key: recipient_keys.first().cloned(),
                keys: EnvelopeKeys {
                    recipient_keys,
                    routing_keys: parse_keys(&outbound_service.service.routing_keys)?,
                    sender_key: outbound_service.sender_key.clone(),
                },
                endpoint: Some(outbound_service.service.service_endpoint.clone()),
                connection_id: None,
            });
        }
        Err(Error::MissingConnection)
    }

    /// Sends `outbound`, failing with `UndeliverableMessage` once every
    /// candidate failed.
    pub async fn send(&self, outbound: OutboundMessageContext) -> Result<()> {
        let target = self.target(&outbound)?;
        let message = &outbound.message;
        debug!(
            "sending {} ({}) to connection {:?}",
            message.id, message.message_type, target.connection_id
        );

        // Failed sessions are removed, so stale ones give way to live ones.
        while let Some(entry) = self
            .context
            .transport_service
            .find_session(
                outbound.inbound_session_id.as_deref(),
                target.connection_id.as_deref(),
                target.their_key.as_ref(),
                message.thread_id(),
            )
            .await
        {
            // The peer is at the other end of the session, no forwarding.
            let keys = EnvelopeKeys {
                routing_keys: vec![],
                ..target.keys.clone()
            };
            match self.send_over_session(&entry, message, &keys).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("return route session {} failed: {}", entry.session.id(), e);
                    self.context
                        .transport_service
                        .remove_session(entry.session.id())
                        .await;
                }
            }
        }

        match target.endpoint.as_deref() {
            Some(DID_COMM_TRANSPORT_QUEUE) => {
                if let Some(connection_id) = &target.connection_id {
                    let envelope = self.context.envelope.pack(message, &target.keys).await?;
                    self.context
                        .queue
                        .push(connection_id, serde_json::to_value(&envelope)?)
                        .await;
                    debug!("queued {} for connection {}", message.id, connection_id);
                    return Ok(());
                }
            }
            Some(endpoint) => match self.transport_for(endpoint) {
                Some(transport) => {
                    let via = if target.keys.routing_keys.is_empty() {
                        "directly"
                    } else {
                        "through mediator"
                    };
                    match self
                        .send_to_endpoint(transport.as_ref(), endpoint, message, &target.keys)
                        .await
                    {
                        Ok(()) => return Ok(()),
                        Err(e) => warn!("sending {} {} to {} failed: {}", message.id, via, endpoint, e),
                    }
                }
                None => warn!("no outbound transport for endpoint {}", endpoint),
            },
            None => {}
        }

        Err(Error::UndeliverableMessage(message.id.clone()))
    }

    async fn send_over_session(
        &self,
        entry: &SessionEntry,
        message: &PlaintextMessage,
        keys: &EnvelopeKeys,
    ) -> Result<()> {
        let envelope = self.context.envelope.pack(message, keys).await?;
        entry.session.send(&envelope.to_bytes()?).await?;
        trace!("sent {} over session {}", message.id, entry.session.id());
        Ok(())
    }

    async fn send_to_endpoint(
        &self,
        transport: &dyn OutboundTransport,
        endpoint: &str,
        message: &PlaintextMessage,
        keys: &EnvelopeKeys,
    ) -> Result<()> {
        let envelope = self.context.envelope.pack(message, keys).await?;
        let response = transport.send(endpoint, &envelope.to_bytes()?).await?;
        self.deliver_response(response)
    }

    fn deliver_response(&self, response: Option<Vec<u8>>) -> Result<()> {
        match response {
            Some(payload) if !payload.is_empty() => {
                trace!("return routed message received on outbound channel");
                self.context.deliver_inbound(payload)
            }
            _ => Ok(()),
        }
    }

    /// Delivers an already packed message to `connection`: over its open
    /// session, to its endpoint, or into its pickup queue.
    pub async fn send_package(&self, connection: &ConnectionRecord, payload: Value) -> Result<()> {
        let bytes = serde_json::to_vec(&payload)?;
        while let Some(entry) = self
            .context
            .transport_service
            .find_session_by_connection_id(&connection.id)
            .await
        {
            match entry.session.send(&bytes).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    warn!("session {} failed: {}", entry.session.id(), e);
                    self.context
                        .transport_service
                        .remove_session(entry.session.id())
                        .await;
                }
            }
        }
        if let Some(service) = &connection.their_service {
            let endpoint = service.service_endpoint.as_str();
            if endpoint != DID_COMM_TRANSPORT_QUEUE {
                if let Some(transport) = self.transport_for(endpoint) {
                    match transport.send(endpoint, &bytes).await {
                        Ok(response) => return self.deliver_response(response),
                        Err(e) => warn!("delivering package to {} failed: {}", endpoint, e),
                    }
                }
            }
        }
        self.context.queue.push(&connection.id, payload).await;
        debug!("queued package for connection {}", connection.id);
        Ok(())
    }

    /// Packs `outbound` for its peer without forward wrapping.
    pub async fn pack_direct(&self, outbound: &OutboundMessageContext) -> Result<Vec<u8>> {
        let mut target = self.target(outbound)?;
        target.keys.routing_keys.clear();
        self.context
            .envelope
            .pack(&outbound.message, &target.keys)
            .await?
            .to_bytes()
    }

    pub async fn open_session(&self, endpoint: &str) -> Result<Box<dyn DuplexSession>> {
        let transport = self
            .transport_for(endpoint)
            .ok_or_else(|| Error::Transport(format!("no transport for {}", endpoint)))?;
        transport.open_session(endpoint).await
    }
}

fn parse_keys(fingerprints: &[String]) -> Result<Vec<Key>> {
    fingerprints
        .iter()
        .map(|f| Key::from_fingerprint(KeyType::X25519, f))
        .collect()
}
