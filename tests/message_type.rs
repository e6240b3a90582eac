mod common;

use std::sync::Arc;

use async_trait::async_trait;
use common::*;
use didcomm_agent::{
    agent::{Handler, HandlerRegistry, InboundMessageContext, OutboundMessageContext},
    messages::{MessageType, PlaintextMessage},
};
use quickcheck::TestResult;
use quickcheck_macros::quickcheck;

struct Versions(Vec<MessageType>);

#[async_trait]
impl Handler for Versions {
    fn supported_message_types(&self) -> Vec<MessageType> {
        self.0.clone()
    }

    async fn handle(&self, _: &InboundMessageContext) -> Result<Option<OutboundMessageContext>> {
        Ok(None)
    }
}

fn versioned(major: u32, minor: u32) -> Result<MessageType> {
    MessageType::parse(&format!(
        "https://didcomm.org/versioned/{}.{}/message",
        major, minor
    ))
}

fn registry_of(minors: &[u8]) -> Result<HandlerRegistry> {
    let mut types = vec![];
    for minor in minors {
        types.push(versioned(1, *minor as u32)?);
        types.push(versioned(2, *minor as u32)?);
    }
    let mut registry = HandlerRegistry::new();
    registry.register_handler(Arc::new(Versions(types)));
    Ok(registry)
}

#[quickcheck]
fn resolves_nearest_minor_within_major(registered: Vec<u8>, requested: u8) -> TestResult {
    let registered: Vec<u8> = registered.into_iter().map(|m| m % 10).collect();
    let requested = (requested % 12) as u32;
    let (registry, wanted) = match (registry_of(&registered), versioned(1, requested)) {
        (Ok(registry), Ok(wanted)) => (registry, wanted),
        _ => return TestResult::error("fixture types must parse"),
    };
    let resolved = registry.resolve_type(&wanted).map(|(t, _)| (t.major(), t.minor()));

    let below = registered
        .iter()
        .map(|m| *m as u32)
        .filter(|m| *m <= requested)
        .max();
    let above = registered
        .iter()
        .map(|m| *m as u32)
        .filter(|m| *m > requested)
        .min();
    let expected = below.or(above).map(|minor| (1, minor));
    TestResult::from_bool(resolved == expected)
}

#[test]
fn legacy_prefix_resolves_like_didcomm_org() -> Result<()> {
    // Arrange
    let legacy = MessageType::parse("did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/versioned/1.3/message")?;
    let registry = registry_of(&[0, 2])?;
    // Act
    let resolved = registry.resolve_type(&legacy).map(|(t, _)| t.uri());
    // Assert
    assert_eq!(legacy.uri(), "https://didcomm.org/versioned/1.3/message");
    assert_eq!(
        resolved.as_deref(),
        Some("https://didcomm.org/versioned/1.2/message")
    );
    Ok(())
}

#[test]
fn unknown_message_type_has_no_handler() -> Result<()> {
    let registry = registry_of(&[0])?;
    assert!(matches!(
        registry.resolve_uri("https://didcomm.org/versioned/3.0/message"),
        Err(Error::NoHandler(_))
    ));
    assert!(matches!(
        registry.resolve_uri("https://didcomm.org/versioned/1.0/other"),
        Err(Error::NoHandler(_))
    ));
    Ok(())
}

#[tokio::test]
async fn agent_registers_every_protocol_family() -> Result<()> {
    // Arrange
    let network = Network::new();
    let agent = network.spawn(config("alice"))?;
    // Act
    let protocols: Vec<String> = agent
        .supported_protocols()
        .iter()
        .map(|p| p.uri())
        .collect();
    // Assert
    for family in [
        "https://didcomm.org/connections/1.0",
        "https://didcomm.org/trust_ping/1.0",
        "https://didcomm.org/issue-credential/1.0",
        "https://didcomm.org/present-proof/1.0",
        "https://didcomm.org/coordinate-mediation/1.0",
        "https://didcomm.org/routing/1.0",
        "https://didcomm.org/messagepickup/1.0",
        "https://didcomm.org/discover-features/1.0",
    ] {
        assert!(protocols.iter().any(|p| p == family), "{} missing", family);
    }
    assert_eq!(
        protocols.last().map(String::as_str),
        Some("https://didcomm.org/discover-features/1.0")
    );
    Ok(())
}

#[tokio::test]
async fn plaintext_without_connection_is_rejected() -> Result<()> {
    // Arrange
    let network = Network::new();
    let agent = network.spawn(config("alice"))?;
    let message = PlaintextMessage::from_value(serde_json::json!({
        "@id": "ping-1",
        "@type": "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/trust_ping/1.0/ping",
    }))?;
    // Act
    let result = agent.receive_message(&message.to_bytes()?, None).await;
    // Assert
    assert!(matches!(result, Err(Error::MissingConnection)));
    Ok(())
}
