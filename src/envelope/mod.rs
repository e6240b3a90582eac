//! Envelope Service: authenticated pack/unpack of plaintext messages.
//!
//! Primitive crypto is delegated to the [`Wallet`]; this layer only decides
//! which keys are used and adds forward wrapping for mediated recipients.
mod jwe;

pub use jwe::{EnvelopeType, Jwe, Jwk, ProtectedHeader, Recipient, RecipientHeader};

use std::sync::Arc;

use serde_json::Value;

use crate::{
    messages::PlaintextMessage,
    protocols::routing::Forward,
    wallet::{Key, Wallet},
    Error, Result,
};

/// Keys used to pack one outbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct EnvelopeKeys {
    pub recipient_keys: Vec<Key>,
    /// Mediator keys, ordered from the mediator closest to the recipient
    /// outward. Each one adds a forward layer.
    pub routing_keys: Vec<Key>,
    /// `None` packs anonymously.
    pub sender_key: Option<Key>,
}

/// Result of unpacking one inbound message.
#[derive(Debug, Clone, PartialEq)]
pub struct DecryptedMessageContext {
    pub message: PlaintextMessage,
    /// Authenticated sender, `None` for anoncrypt and plaintext input.
    pub sender_key: Option<Key>,
    /// Local key the envelope was opened with, `None` for plaintext input.
    pub recipient_key: Option<Key>,
}

#[derive(Clone)]
pub struct EnvelopeService {
    wallet: Arc<dyn Wallet>,
}

impl EnvelopeService {
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        EnvelopeService { wallet }
    }

    /// Encrypts `message` for its recipients and wraps the result in one
    /// `forward` per routing key.
    pub async fn pack(&self, message: &PlaintextMessage, keys: &EnvelopeKeys) -> Result<Jwe> {
        let mut envelope = self
            .wallet
            .pack_message(
                &message.to_bytes()?,
                &keys.recipient_keys,
                keys.sender_key.as_ref(),
            )
            .await?;

        let mut to = keys
            .recipient_keys
            .first()
            .ok_or_else(|| Error::Encryption("no recipient keys".into()))?
            .fingerprint();
        for routing_key in &keys.routing_keys {
            trace!("wrapping {} in forward to {}", message.id, routing_key.fingerprint());
            let forward = PlaintextMessage::new(&Forward {
                to: to.clone(),
                msg: serde_json::to_value(&envelope)?,
            })?;
            envelope = self
                .wallet
                .pack_message(&forward.to_bytes()?, std::slice::from_ref(routing_key), None)
                .await?;
            to = routing_key.fingerprint();
        }
        Ok(envelope)
    }

    /// Opens inbound bytes. Encrypted envelopes fail closed with
    /// [`Error::Decryption`]; plaintext JSON messages are accepted as is.
    pub async fn unpack(&self, bytes: &[u8]) -> Result<DecryptedMessageContext> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::InvalidMessage(format!("inbound message is not JSON: {}", e)))?;
        if !Jwe::is_envelope(&value) {
            debug!("accepting plaintext inbound message");
            return Ok(DecryptedMessageContext {
                message: PlaintextMessage::from_value(value)?,
                sender_key: None,
                recipient_key: None,
            });
        }
        let jwe: Jwe = serde_json::from_value(value)
            .map_err(|e| Error::Decryption(format!("malformed envelope: {}", e)))?;
        let unpacked = self.wallet.unpack_message(&jwe).await?;
        let message = PlaintextMessage::from_bytes(&unpacked.plaintext)?;
        Ok(DecryptedMessageContext {
            message,
            sender_key: unpacked.sender_key,
            recipient_key: Some(unpacked.recipient_key),
        })
    }

    /// Unpacks a JSON value, as found in `forward.msg` and pickup batches.
    pub async fn unpack_value(&self, value: &Value) -> Result<DecryptedMessageContext> {
        self.unpack(&serde_json::to_vec(value)?).await
    }
}
