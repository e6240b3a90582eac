//! Discover features 1.0 (Aries RFC 0031).
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    agent::{
        filter_protocols_by_family, message_types, AgentEvent, EventBus, Handler,
        InboundMessageContext, OutboundMessageContext,
    },
    messages::{MessageType, PlaintextMessage, Protocol, Shape},
    Error, Result,
};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FeatureQuery {
    /// Protocol URI prefix, `*` matches anything after it.
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl Shape for FeatureQuery {
    const TYPE: &'static str = "https://didcomm.org/discover-features/1.0/query";

    fn validate(&self) -> Result<()> {
        if self.query.is_empty() {
            return Err(Error::InvalidMessage("empty feature query".into()));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProtocolDescriptor {
    pub pid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub roles: Vec<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Disclose {
    pub protocols: Vec<ProtocolDescriptor>,
}

impl Shape for Disclose {
    const TYPE: &'static str = "https://didcomm.org/discover-features/1.0/disclose";
}

/// Query for protocols starting with `query`.
pub fn create_query(query: &str) -> Result<PlaintextMessage> {
    PlaintextMessage::new(&FeatureQuery {
        query: query.to_string(),
        comment: None,
    })
}

/// Answers queries from the protocols registered when the agent was built
/// and publishes what peers disclose.
pub struct DiscoveryHandler {
    protocols: Vec<Protocol>,
    events: EventBus,
}

impl DiscoveryHandler {
    /// `protocols` in registration order; discover-features itself is added.
    pub fn new(mut protocols: Vec<Protocol>, events: EventBus) -> Self {
        for message_type in message_types(&[FeatureQuery::TYPE]) {
            let own = message_type.protocol();
            if !protocols.contains(&own) {
                protocols.push(own);
            }
        }
        DiscoveryHandler { protocols, events }
    }

    pub fn disclose(&self, query: &str) -> Disclose {
        let protocols = filter_protocols_by_family(&self.protocols, &[query.to_string()])
            .iter()
            .map(|protocol| ProtocolDescriptor {
                pid: protocol.uri(),
                roles: vec![],
            })
            .collect();
        Disclose { protocols }
    }
}

#[async_trait]
impl Handler for DiscoveryHandler {
    fn supported_message_types(&self) -> Vec<MessageType> {
        message_types(&[FeatureQuery::TYPE, Disclose::TYPE])
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>> {
        match ctx.message.message_type.name() {
            "query" => {
                let query: FeatureQuery = ctx.message.decode()?;
                let disclose = self.disclose(&query.query);
                debug!(
                    "disclosing {} protocols for query '{}'",
                    disclose.protocols.len(),
                    query.query
                );
                let reply = PlaintextMessage::new(&disclose)?.reply_to(&ctx.message);
                OutboundMessageContext::reply(ctx, reply).map(Some)
            }
            "disclose" => {
                let disclose: Disclose = ctx.message.decode()?;
                let connection = ctx.assert_ready_connection()?;
                self.events.emit(AgentEvent::FeaturesDisclosed {
                    connection_id: connection.id.clone(),
                    thread_id: ctx.message.thread_id().to_string(),
                    protocols: disclose.protocols.into_iter().map(|p| p.pid).collect(),
                });
                Ok(None)
            }
            _ => Err(Error::NoHandler(ctx.message.message_type.uri())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn protocols(uris: &[&str]) -> Result<Vec<Protocol>> {
        uris.iter()
            .map(|uri| Ok(MessageType::parse(uri)?.protocol()))
            .collect()
    }

    #[test]
    fn disclose_keeps_registration_order() -> Result<()> {
        // Arrange
        let handler = DiscoveryHandler::new(
            protocols(&[
                "https://didcomm.org/trust_ping/1.0/ping",
                "https://didcomm.org/issue-credential/1.0/offer-credential",
                "https://didcomm.org/connections/1.0/request",
            ])?,
            EventBus::new(4),
        );
        // Act
        let all = handler.disclose("https://didcomm.org/*");
        let credentials = handler.disclose("https://didcomm.org/issue-credential/");
        // Assert
        let pids: Vec<&str> = all.protocols.iter().map(|p| p.pid.as_str()).collect();
        assert_eq!(
            pids,
            vec![
                "https://didcomm.org/trust_ping/1.0",
                "https://didcomm.org/issue-credential/1.0",
                "https://didcomm.org/connections/1.0",
                "https://didcomm.org/discover-features/1.0",
            ]
        );
        assert_eq!(credentials.protocols.len(), 1);
        Ok(())
    }

    #[test]
    fn empty_query_is_invalid() -> Result<()> {
        let message = create_query("")?;
        assert!(message.decode::<FeatureQuery>().is_err());
        Ok(())
    }
}
