use async_trait::async_trait;

use super::context::{InboundMessageContext, OutboundMessageContext};
use crate::{messages::MessageType, Result};

/// Processes inbound messages of the types it declares.
#[async_trait]
pub trait Handler: Send + Sync {
    /// Message types registered for this handler, in registration order.
    fn supported_message_types(&self) -> Vec<MessageType>;

    /// `false` lets messages without a connection and without an inline
    /// `~service` through, e.g. connection requests and forwards.
    fn requires_connection(&self) -> bool {
        true
    }

    /// Processes one message. A returned context is sent by the dispatcher
    /// after this call returned, so state is always recorded first.
    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>>;
}

/// Parses static message type URIs of a handler.
pub fn message_types(uris: &[&str]) -> Vec<MessageType> {
    uris.iter()
        .filter_map(|uri| match MessageType::parse(uri) {
            Ok(t) => Some(t),
            Err(e) => {
                error!("ignoring handler message type: {}", e);
                None
            }
        })
        .collect()
}
