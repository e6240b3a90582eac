use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{MessageType, ReturnRoute, ServiceDecorator, Thread, TransportDecorator};
use crate::Error;

/// Typed body of one message type.
///
/// `shape` is the single validation point of inbound content: it decodes the
/// message fields and runs [`Shape::validate`] before the body reaches any
/// protocol code.
pub trait Shape: Serialize + DeserializeOwned {
    /// Default `@type` used when this body is sent.
    const TYPE: &'static str;

    fn message_type() -> Result<MessageType, Error> {
        MessageType::parse(Self::TYPE)
    }

    /// Checks invariants serde can not express.
    fn validate(&self) -> Result<(), Error> {
        Ok(())
    }

    fn shape(m: &PlaintextMessage) -> Result<Self, Error> {
        let body: Self = serde_json::from_value(Value::Object(m.content.clone()))
            .map_err(|e| Error::InvalidMessage(format!("{}: {}", m.message_type, e)))?;
        body.validate()?;
        Ok(body)
    }
}

/// Decrypted DIDComm v1 message.
///
/// Envelope level fields are typed, message specific fields are kept in
/// `content` until a handler shapes them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PlaintextMessage {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "@type")]
    pub message_type: MessageType,
    #[serde(rename = "~thread", skip_serializing_if = "Option::is_none")]
    pub thread: Option<Thread>,
    #[serde(rename = "~transport", skip_serializing_if = "Option::is_none")]
    pub transport: Option<TransportDecorator>,
    #[serde(rename = "~service", skip_serializing_if = "Option::is_none")]
    pub service: Option<ServiceDecorator>,
    #[serde(flatten)]
    pub content: Map<String, Value>,
}

impl PlaintextMessage {
    /// Builds message of `T::TYPE` with a fresh id.
    pub fn new<T: Shape>(body: &T) -> Result<Self, Error> {
        Self::with_type(T::message_type()?, body)
    }

    /// Builds message of explicit type, for bodies shared by several protocols
    /// (acks, problem reports).
    pub fn with_type(message_type: MessageType, body: &impl Serialize) -> Result<Self, Error> {
        let content = match serde_json::to_value(body)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(Error::InvalidMessage(format!(
                    "message body must be an object, got {}",
                    other
                )))
            }
        };
        Ok(PlaintextMessage {
            id: uuid::Uuid::new_v4().to_string(),
            message_type,
            thread: None,
            transport: None,
            service: None,
            content,
        })
    }

    /// Id shared by all messages of the exchange: `~thread.thid`, or the
    /// message's own id when it starts the thread.
    pub fn thread_id(&self) -> &str {
        match &self.thread {
            Some(thread) if !thread.thid.is_empty() => &thread.thid,
            _ => &self.id,
        }
    }

    pub fn parent_thread_id(&self) -> Option<&str> {
        match &self.thread {
            Some(thread) if !thread.pthid.is_empty() => Some(&thread.pthid),
            _ => None,
        }
    }

    pub fn set_thread_id(mut self, thid: &str) -> Self {
        let mut thread = self.thread.take().unwrap_or_default();
        thread.thid = thid.to_string();
        self.thread = Some(thread);
        self
    }

    pub fn set_parent_thread_id(mut self, pthid: &str) -> Self {
        let mut thread = self.thread.take().unwrap_or_default();
        thread.pthid = pthid.to_string();
        self.thread = Some(thread);
        self
    }

    /// Threads this message as a reply to `parent`.
    pub fn reply_to(self, parent: &PlaintextMessage) -> Self {
        let thid = parent.thread_id().to_string();
        self.set_thread_id(&thid)
    }

    pub fn set_return_route(mut self, return_route: ReturnRoute) -> Self {
        self.transport = Some(TransportDecorator {
            return_route,
            return_route_thread: None,
        });
        self
    }

    pub fn set_service(mut self, service: ServiceDecorator) -> Self {
        self.service = Some(service);
        self
    }

    pub fn return_route(&self) -> ReturnRoute {
        self.transport
            .as_ref()
            .map(|t| t.return_route)
            .unwrap_or_default()
    }

    pub fn decode<T: Shape>(&self) -> Result<T, Error> {
        T::shape(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        let value: Value = serde_json::from_slice(bytes)
            .map_err(|e| Error::InvalidMessage(format!("not JSON: {}", e)))?;
        Self::from_value(value)
    }

    /// Parses `@type` first so malformed types surface as
    /// [`Error::MessageTypeParse`] rather than generic decoding errors.
    pub fn from_value(value: Value) -> Result<Self, Error> {
        let type_uri = value
            .get("@type")
            .and_then(Value::as_str)
            .ok_or_else(|| Error::InvalidMessage("missing @type".into()))?;
        MessageType::parse(type_uri)?;
        if value.get("@id").and_then(Value::as_str).is_none() {
            return Err(Error::InvalidMessage("missing @id".into()));
        }
        serde_json::from_value(value).map_err(|e| Error::InvalidMessage(e.to_string()))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }
}
