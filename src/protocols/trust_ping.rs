//! Trust ping 1.0 (Aries RFC 0048).
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::connections::ConnectionService;
use crate::{
    agent::{message_types, Handler, InboundMessageContext, OutboundMessageContext},
    messages::{MessageType, PlaintextMessage, Shape},
    Error, Result,
};

fn default_response_requested() -> bool {
    true
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Ping {
    #[serde(default = "default_response_requested")]
    pub response_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Shape for Ping {
    const TYPE: &'static str = "https://didcomm.org/trust_ping/1.0/ping";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct PingResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Shape for PingResponse {
    const TYPE: &'static str = "https://didcomm.org/trust_ping/1.0/ping_response";
}

/// Answers pings. A ping over a responded connection completes it.
pub struct TrustPingHandler {
    connections: Arc<ConnectionService>,
}

impl TrustPingHandler {
    pub fn new(connections: Arc<ConnectionService>) -> Self {
        TrustPingHandler { connections }
    }
}

#[async_trait]
impl Handler for TrustPingHandler {
    fn supported_message_types(&self) -> Vec<MessageType> {
        message_types(&[Ping::TYPE, PingResponse::TYPE])
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>> {
        match ctx.message.message_type.name() {
            "ping" => {
                let ping: Ping = ctx.message.decode()?;
                let connection = ctx.assert_ready_connection()?;
                let connection = self.connections.complete(&connection.id).await?;
                if !ping.response_requested {
                    return Ok(None);
                }
                let response = PlaintextMessage::new(&PingResponse::default())?.reply_to(&ctx.message);
                let mut outbound = OutboundMessageContext::for_connection(response, connection);
                outbound.inbound_session_id = ctx.session_id.clone();
                Ok(Some(outbound))
            }
            "ping_response" => {
                debug!(
                    "ping {} answered on connection {:?}",
                    ctx.message.thread_id(),
                    ctx.connection_id()
                );
                Ok(None)
            }
            _ => Err(Error::NoHandler(ctx.message.message_type.uri())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_is_requested_unless_declined() -> Result<()> {
        let message = PlaintextMessage::from_value(serde_json::json!({
            "@id": "1",
            "@type": Ping::TYPE,
        }))?;
        assert!(message.decode::<Ping>()?.response_requested);
        let message = PlaintextMessage::new(&Ping {
            response_requested: false,
            comment: None,
        })?;
        assert!(!message.decode::<Ping>()?.response_requested);
        Ok(())
    }
}
