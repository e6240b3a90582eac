//! Transport seams: outbound transports (HTTP, WebSocket, ...) implemented
//! outside of the crate, and the table of inbound sessions kept open for
//! return routing.
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::{messages::ReturnRoute, wallet::Key, Result};

/// Endpoint of agents that can not be reached directly: messages for them are
/// queued until they pick them up.
pub const DID_COMM_TRANSPORT_QUEUE: &str = "didcomm:transport/queue";

#[async_trait]
pub trait OutboundTransport: Send + Sync {
    /// URI schemes this transport serves, e.g. `http`, `ws`.
    fn supported_schemes(&self) -> Vec<String>;

    /// Delivers one packed message. A returned payload is a message the
    /// receiver sent back on the same channel.
    async fn send(&self, endpoint: &str, payload: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Opens a long lived bidirectional session, used by implicit pickup.
    async fn open_session(&self, endpoint: &str) -> Result<Box<dyn DuplexSession>>;
}

/// Client side of a long lived session.
#[async_trait]
pub trait DuplexSession: Send {
    async fn send(&mut self, payload: &[u8]) -> Result<()>;

    /// Next message from the peer, `None` once the session was closed.
    async fn recv(&mut self) -> Result<Option<Vec<u8>>>;
}

/// Server side of an inbound channel that can carry messages back.
#[async_trait]
pub trait TransportSession: Send + Sync {
    fn id(&self) -> &str;

    async fn send(&self, payload: &[u8]) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Scheme of an endpoint URI, `didcomm` for the queue endpoint.
pub fn endpoint_scheme(endpoint: &str) -> Option<&str> {
    endpoint.split_once(':').map(|(scheme, _)| scheme)
}

#[derive(Clone)]
pub struct SessionEntry {
    pub session: Arc<dyn TransportSession>,
    pub connection_id: Option<String>,
    pub their_key: Option<Key>,
    pub return_route: ReturnRoute,
    pub thread_id: Option<String>,
}

impl SessionEntry {
    /// Whether a message of `thread_id` may go back over this session.
    fn carries(&self, thread_id: &str) -> bool {
        match self.return_route {
            ReturnRoute::All => true,
            ReturnRoute::Thread => self.thread_id.as_deref() == Some(thread_id),
            ReturnRoute::None => false,
        }
    }
}

/// Inbound sessions the peer asked to keep open (`~transport.return_route`).
#[derive(Default, Clone)]
pub struct TransportService {
    sessions: Arc<RwLock<HashMap<String, SessionEntry>>>,
}

impl TransportService {
    pub async fn save_session(&self, entry: SessionEntry) {
        let id = entry.session.id().to_string();
        debug!(
            "keeping session {} open for connection {:?}",
            id, entry.connection_id
        );
        self.sessions.write().await.insert(id, entry);
    }

    pub async fn remove_session(&self, id: &str) -> Option<SessionEntry> {
        self.sessions.write().await.remove(id)
    }

    pub async fn has_session(&self, id: &str) -> bool {
        self.sessions.read().await.contains_key(id)
    }

    /// Session that may carry a message of `thread_id` to the peer. The session
    /// the triggering message came in on is preferred.
    pub async fn find_session(
        &self,
        preferred_id: Option<&str>,
        connection_id: Option<&str>,
        their_key: Option<&Key>,
        thread_id: &str,
    ) -> Option<SessionEntry> {
        let sessions = self.sessions.read().await;
        if let Some(entry) = preferred_id.and_then(|id| sessions.get(id)) {
            if entry.carries(thread_id) {
                return Some(entry.clone());
            }
        }
        sessions
            .values()
            .find(|entry| {
                let same_peer = match (connection_id, their_key) {
                    (Some(connection_id), _) => {
                        entry.connection_id.as_deref() == Some(connection_id)
                    }
                    (None, Some(key)) => entry.their_key.as_ref() == Some(key),
                    (None, None) => false,
                };
                same_peer && entry.carries(thread_id)
            })
            .cloned()
    }

    /// Session registered for a connection, whatever its return route.
    pub async fn find_session_by_connection_id(&self, connection_id: &str) -> Option<SessionEntry> {
        self.sessions
            .read()
            .await
            .values()
            .find(|entry| entry.connection_id.as_deref() == Some(connection_id))
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSession(String);

    #[async_trait]
    impl TransportSession for NullSession {
        fn id(&self) -> &str {
            &self.0
        }
        async fn send(&self, _: &[u8]) -> Result<()> {
            Ok(())
        }
        async fn close(&self) -> Result<()> {
            Ok(())
        }
    }

    fn entry(id: &str, connection: &str, return_route: ReturnRoute) -> SessionEntry {
        SessionEntry {
            session: Arc::new(NullSession(id.into())),
            connection_id: Some(connection.into()),
            their_key: None,
            return_route,
            thread_id: Some("thread".into()),
        }
    }

    #[tokio::test]
    async fn thread_route_only_carries_its_thread() {
        let service = TransportService::default();
        service
            .save_session(entry("s", "c", ReturnRoute::Thread))
            .await;
        assert!(service
            .find_session(None, Some("c"), None, "thread")
            .await
            .is_some());
        assert!(service
            .find_session(None, Some("c"), None, "other")
            .await
            .is_none());
    }

    #[tokio::test]
    async fn removed_session_is_not_found() {
        let service = TransportService::default();
        service.save_session(entry("s", "c", ReturnRoute::All)).await;
        assert!(service.remove_session("s").await.is_some());
        assert!(service.find_session(Some("s"), Some("c"), None, "t").await.is_none());
    }

    #[test]
    fn scheme_of_endpoints() {
        assert_eq!(endpoint_scheme("https://example.org"), Some("https"));
        assert_eq!(endpoint_scheme(DID_COMM_TRANSPORT_QUEUE), Some("didcomm"));
        assert_eq!(endpoint_scheme("nowhere"), None);
    }
}
