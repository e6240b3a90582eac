use std::sync::Arc;

use async_trait::async_trait;

use super::ConnectionService;
use crate::{
    agent::{message_types, Handler, InboundMessageContext, OutboundMessageContext},
    messages::MessageType,
    Error, Result,
};

/// Handles requests, responses and problem reports of the connection
/// protocol. Requests arrive before the inviter knows the peer, so no
/// connection is required.
pub struct ConnectionHandler {
    connections: Arc<ConnectionService>,
}

impl ConnectionHandler {
    pub fn new(connections: Arc<ConnectionService>) -> Self {
        ConnectionHandler { connections }
    }
}

#[async_trait]
impl Handler for ConnectionHandler {
    fn supported_message_types(&self) -> Vec<MessageType> {
        message_types(&[
            "https://didcomm.org/connections/1.0/request",
            "https://didcomm.org/connections/1.0/response",
            "https://didcomm.org/connections/1.0/problem_report",
        ])
    }

    fn requires_connection(&self) -> bool {
        false
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>> {
        match ctx.message.message_type.name() {
            "request" => {
                let record = self.connections.process_request(ctx).await?;
                if !self.connections.should_auto_accept(&record) {
                    return Ok(None);
                }
                let (_, mut outbound) = self.connections.create_response(&record.id).await?;
                outbound.inbound_session_id = ctx.session_id.clone();
                Ok(Some(outbound))
            }
            "response" => {
                let record = self.connections.process_response(ctx).await?;
                if !self.connections.should_auto_accept(&record) {
                    return Ok(None);
                }
                // The ping acknowledges the response to the inviter.
                let (_, mut outbound) = self.connections.create_trust_ping(&record.id, false).await?;
                outbound.inbound_session_id = ctx.session_id.clone();
                Ok(Some(outbound))
            }
            "problem_report" => {
                self.connections.process_problem_report(ctx).await?;
                Ok(None)
            }
            _ => Err(Error::NoHandler(ctx.message.message_type.uri())),
        }
    }
}
