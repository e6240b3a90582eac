use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{messages::Shape, Error, Result};

/// Envelope for a recipient behind a mediator (Aries RFC 0094).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Forward {
    /// Key of the next hop, base58.
    pub to: String,
    /// Packed message for `to`.
    pub msg: Value,
}

impl Shape for Forward {
    const TYPE: &'static str = "https://didcomm.org/routing/1.0/forward";

    fn validate(&self) -> Result<()> {
        if self.to.is_empty() || !self.msg.is_object() {
            return Err(Error::InvalidMessage(
                "forward needs a recipient and a packed message".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct MediationRequest {}

impl Shape for MediationRequest {
    const TYPE: &'static str = "https://didcomm.org/coordinate-mediation/1.0/mediate-request";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MediationGrant {
    pub endpoint: String,
    pub routing_keys: Vec<String>,
}

impl Shape for MediationGrant {
    const TYPE: &'static str = "https://didcomm.org/coordinate-mediation/1.0/mediate-grant";

    fn validate(&self) -> Result<()> {
        if self.routing_keys.is_empty() {
            return Err(Error::InvalidMessage("mediation grant without routing keys".into()));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Default)]
pub struct MediationDeny {}

impl Shape for MediationDeny {
    const TYPE: &'static str = "https://didcomm.org/coordinate-mediation/1.0/mediate-deny";
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum KeylistUpdateAction {
    Add,
    Remove,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum KeylistUpdateResult {
    ClientError,
    ServerError,
    NoChange,
    Success,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeylistUpdate {
    pub recipient_key: String,
    pub action: KeylistUpdateAction,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeylistUpdateMessage {
    pub updates: Vec<KeylistUpdate>,
}

impl Shape for KeylistUpdateMessage {
    const TYPE: &'static str = "https://didcomm.org/coordinate-mediation/1.0/keylist-update";
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeylistUpdated {
    pub recipient_key: String,
    pub action: KeylistUpdateAction,
    pub result: KeylistUpdateResult,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct KeylistUpdateResponse {
    pub updated: Vec<KeylistUpdated>,
}

impl Shape for KeylistUpdateResponse {
    const TYPE: &'static str =
        "https://didcomm.org/coordinate-mediation/1.0/keylist-update-response";
}

/// Message pickup 1.0 (Aries RFC 0212).
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchPickup {
    pub batch_size: usize,
}

impl Shape for BatchPickup {
    const TYPE: &'static str = "https://didcomm.org/messagepickup/1.0/batch-pickup";

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidMessage("batch_size must be positive".into()));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct BatchMessage {
    #[serde(rename = "@id")]
    pub id: String,
    pub message: Value,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Batch {
    #[serde(rename = "messages~attach")]
    pub messages: Vec<BatchMessage>,
}

impl Shape for Batch {
    const TYPE: &'static str = "https://didcomm.org/messagepickup/1.0/batch";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PlaintextMessage;
    use serde_json::json;

    #[test]
    fn batch_uses_attach_decorator() -> Result<()> {
        // Arrange
        let batch = Batch {
            messages: vec![BatchMessage {
                id: "1".into(),
                message: json!({"protected": "x"}),
            }],
        };
        // Act
        let message = PlaintextMessage::new(&batch)?;
        let wire: Value = serde_json::from_slice(&message.to_bytes()?)?;
        // Assert
        assert_eq!(wire["messages~attach"][0]["@id"], "1");
        assert_eq!(message.decode::<Batch>()?, batch);
        Ok(())
    }

    #[test]
    fn keylist_results_are_snake_case() -> Result<()> {
        let updated = KeylistUpdated {
            recipient_key: "key".into(),
            action: KeylistUpdateAction::Add,
            result: KeylistUpdateResult::NoChange,
        };
        let wire = serde_json::to_value(&updated)?;
        assert_eq!(wire["action"], "add");
        assert_eq!(wire["result"], "no_change");
        Ok(())
    }

    #[test]
    fn forward_without_message_is_invalid() -> Result<()> {
        let message = PlaintextMessage::new(&Forward {
            to: "key".into(),
            msg: Value::Null,
        })?;
        assert!(matches!(
            message.decode::<Forward>(),
            Err(Error::InvalidMessage(_))
        ));
        Ok(())
    }
}
