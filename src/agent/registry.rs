use std::sync::Arc;

use super::handler::Handler;
use crate::{
    messages::{MessageType, Protocol, DIDCOMM_ORG, LEGACY_DID_SOV_PREFIX},
    Error, Result,
};

/// Message type to handler table.
///
/// Filled while the agent is built and read only afterwards, so lookups need
/// no locking.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    entries: Vec<(MessageType, Arc<dyn Handler>)>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for every type it supports.
    pub fn register_handler(&mut self, handler: Arc<dyn Handler>) {
        for message_type in handler.supported_message_types() {
            self.register(message_type, handler.clone());
        }
    }

    pub fn register(&mut self, message_type: MessageType, handler: Arc<dyn Handler>) {
        trace!("registering handler for {}", message_type);
        self.entries.push((message_type, handler));
    }

    /// Handler for `message_type`.
    ///
    /// Only entries of the same protocol family, major version and message
    /// name qualify. Among those the highest minor not above the requested
    /// one wins, else the lowest minor above it.
    pub fn resolve(&self, message_type: &MessageType) -> Result<Arc<dyn Handler>> {
        self.resolve_type(message_type)
            .map(|(_, handler)| handler.clone())
            .ok_or_else(|| Error::NoHandler(message_type.uri()))
    }

    pub fn resolve_uri(&self, uri: &str) -> Result<Arc<dyn Handler>> {
        self.resolve(&MessageType::parse(uri)?)
    }

    /// Registered type `message_type` resolves to.
    pub fn resolve_type(
        &self,
        message_type: &MessageType,
    ) -> Option<&(MessageType, Arc<dyn Handler>)> {
        let candidates = self.entries.iter().filter(|(registered, _)| {
            registered.is_protocol_compatible(message_type)
                && registered.name() == message_type.name()
        });
        let requested = message_type.minor();
        let mut best_below: Option<&(MessageType, Arc<dyn Handler>)> = None;
        let mut best_above: Option<&(MessageType, Arc<dyn Handler>)> = None;
        for entry in candidates {
            let minor = entry.0.minor();
            if minor <= requested {
                if best_below.map_or(true, |(b, _)| minor > b.minor()) {
                    best_below = Some(entry);
                }
            } else if best_above.map_or(true, |(b, _)| minor < b.minor()) {
                best_above = Some(entry);
            }
        }
        best_below.or(best_above)
    }

    pub fn supported_message_types(&self) -> Vec<MessageType> {
        self.entries.iter().map(|(t, _)| t.clone()).collect()
    }

    /// Distinct protocols in registration order.
    pub fn supported_protocols(&self) -> Vec<Protocol> {
        let mut protocols: Vec<Protocol> = vec![];
        for (message_type, _) in &self.entries {
            let protocol = message_type.protocol();
            if !protocols.contains(&protocol) {
                protocols.push(protocol);
            }
        }
        protocols
    }

    /// Registered protocols whose URI starts with one of `families`.
    pub fn filter_supported_protocols_by_family(&self, families: &[String]) -> Vec<Protocol> {
        filter_protocols_by_family(&self.supported_protocols(), families)
    }
}

/// Keeps `protocols` whose URI starts with one of `families`, preserving
/// order. A trailing `*` is a wildcard and legacy prefixes are normalized.
pub fn filter_protocols_by_family(protocols: &[Protocol], families: &[String]) -> Vec<Protocol> {
    let prefixes: Vec<String> = families
        .iter()
        .map(|family| {
            let family = family.trim_end_matches('*');
            match family.strip_prefix(LEGACY_DID_SOV_PREFIX) {
                Some(rest) => format!("{}{}", DIDCOMM_ORG, rest),
                None => family.to_string(),
            }
        })
        .collect();
    protocols
        .iter()
        .filter(|protocol| {
            let uri = protocol.uri();
            prefixes.iter().any(|prefix| uri.starts_with(prefix.as_str()))
        })
        .cloned()
        .collect()
}
