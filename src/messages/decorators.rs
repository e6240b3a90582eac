//! Decorator Types.
//!
//! Decorators represent additional metadata that adds semantic
//! content relevant to messaging in general but not tied to a specific domain.
//! For more details, see Aries RFC 0011.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A `~thread` message decorator that provides request/reply
/// and threading semantics according to Aries RFC 0008.
#[derive(Default, Deserialize, Serialize, PartialEq, Debug, Clone)]
#[serde(default)]
pub struct Thread {
    /// The ID of the message that serves as the thread start.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub thid: String,

    /// An optional parent `thid`.
    ///
    /// It's used when branching or nesting a new interaction off an
    /// existing one, e.g. a connection request answering an invitation.
    #[serde(skip_serializing_if = "String::is_empty")]
    pub pthid: String,

    /// The index of the message in the sequence of all the messages
    /// the current *sender* has contributed to in the thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sender_order: Option<usize>,

    /// A dictionary of sender_order/highest messages received on the thread.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received_orders: Option<HashMap<String, usize>>,
}

impl Thread {
    /// Creates implicit thread.
    ///
    /// # Example
    ///
    /// ```
    /// use didcomm_agent::messages::Thread;
    /// let message_id = "new-message";
    /// let thread = Thread::implicit(&message_id);
    /// assert_eq!(thread.thid, message_id.to_string())
    /// ```
    pub fn implicit(message_id: &str) -> Self {
        Self {
            thid: message_id.into(),
            sender_order: Some(0),
            ..Default::default()
        }
    }

    /// Create implicit message reply thread.
    ///
    /// # Example
    ///
    /// ```
    /// use didcomm_agent::messages::Thread;
    /// let thid = "current-thread";
    /// let thread = Thread::implicit_reply(&thid);
    /// assert_eq!(thread.thid, thid);
    /// ```
    pub fn implicit_reply(thid: &str) -> Self {
        Self {
            thid: thid.into(),
            ..Default::default()
        }
    }

    /// Thread that nests a new interaction under the parent thread `pthid`.
    pub fn child_of(pthid: &str) -> Self {
        Self {
            pthid: pthid.into(),
            ..Default::default()
        }
    }

    /// Returns `true` if the thread is for an implicit reply message.
    pub fn is_implicit_reply(&self, message_id: &str) -> bool {
        if self.thid != message_id {
            match self.received_orders {
                Some(ref recv_orders) => recv_orders.values().all(|&x| x == 0),
                None => true,
            }
        } else {
            false
        }
    }
}

/// Value of `~transport.return_route`.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum ReturnRoute {
    None,
    All,
    Thread,
}

impl Default for ReturnRoute {
    fn default() -> Self {
        ReturnRoute::None
    }
}

/// `~transport` decorator (Aries RFC 0092).
#[derive(Default, Deserialize, Serialize, PartialEq, Debug, Clone)]
pub struct TransportDecorator {
    #[serde(default)]
    pub return_route: ReturnRoute,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_route_thread: Option<String>,
}

/// Inline routing information, used as `~service` decorator of connectionless
/// messages and as the service block of invitations and DID documents.
#[derive(Deserialize, Serialize, PartialEq, Eq, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDecorator {
    pub recipient_keys: Vec<String>,
    #[serde(default)]
    pub routing_keys: Vec<String>,
    pub service_endpoint: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use fake::faker::internet::en;
    use fake::uuid::UUIDv4;
    use fake::Fake;
    use quickcheck::{Arbitrary, Gen};
    use uuid::Uuid;

    #[test]
    fn default_thread_can_be_created() {
        let thr = Thread::default();
        assert_eq!(thr.thid, thr.pthid);
        assert!(thr.sender_order.is_none());
        assert!(thr.received_orders.is_none());
    }

    #[test]
    fn return_route_uses_lowercase_names() -> Result<(), serde_json::Error> {
        let decorator: TransportDecorator =
            serde_json::from_str(r#"{"return_route":"all"}"#)?;
        assert_eq!(decorator.return_route, ReturnRoute::All);
        assert_eq!(TransportDecorator::default().return_route, ReturnRoute::None);
        Ok(())
    }

    #[test]
    fn service_uses_camel_case() -> Result<(), serde_json::Error> {
        let service = ServiceDecorator {
            recipient_keys: vec!["key".into()],
            routing_keys: vec![],
            service_endpoint: "http://localhost:3000".into(),
        };
        let value = serde_json::to_value(&service)?;
        assert_eq!(value["recipientKeys"][0], "key");
        assert_eq!(value["serviceEndpoint"], "http://localhost:3000");
        Ok(())
    }

    #[derive(Clone, Debug)]
    struct Id(String);

    #[derive(Clone, Debug)]
    struct Header {
        id: String,
        sender: String,
    }

    impl Arbitrary for Id {
        fn arbitrary(_: &mut Gen) -> Self {
            let s: Uuid = UUIDv4.fake();
            Self(s.to_string())
        }
    }

    impl Arbitrary for Header {
        fn arbitrary(_: &mut Gen) -> Self {
            let s: Uuid = UUIDv4.fake();
            Self {
                id: s.to_string(),
                sender: en::Username().fake(),
            }
        }
    }

    #[quickcheck_macros::quickcheck]
    fn create_implicit_thread(id: Id) -> bool {
        let thread = Thread::implicit(&id.0);
        thread.thid == id.0
    }

    #[quickcheck_macros::quickcheck]
    fn child_thread_keeps_parent(id: Id) -> bool {
        let thread = Thread::child_of(&id.0);
        thread.pthid == id.0 && thread.thid.is_empty()
    }

    #[quickcheck_macros::quickcheck]
    fn implicit_thread_without_received_order_successfully_detected(id: Id) -> bool {
        let thr = Thread::implicit_reply(&id.0);
        !thr.is_implicit_reply(&id.0)
    }

    #[quickcheck_macros::quickcheck]
    fn reply_from_other_sender_is_implicit(header: Header) -> bool {
        let mut thr = Thread::implicit_reply(&header.id);
        thr.received_orders = Some(HashMap::from([(header.sender, 0)]));
        thr.is_implicit_reply("some-other-message")
    }
}
