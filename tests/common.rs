//! In-process network of agents for the integration tests.
//!
//! Endpoints look like `loop://alice`. Sending to an endpoint runs the
//! receiving agent's inbound pipeline to completion and hands back the first
//! message it returned on the same channel, like an HTTP response body would.
#![allow(dead_code)]

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    sync::{broadcast, mpsc},
    time::Instant,
};

pub use didcomm_agent::{
    agent::{AgentEvent, DuplexSession, EventBus, OutboundTransport, TransportSession},
    protocols::connections::{ConnectionRecord, ConnectionState},
    Agent, AgentConfig, Error, Result,
};

pub const TIMEOUT: Duration = Duration::from_secs(5);

static SESSION_IDS: AtomicUsize = AtomicUsize::new(0);

fn next_session_id(kind: &str) -> String {
    format!("{}-{}", kind, SESSION_IDS.fetch_add(1, Ordering::SeqCst))
}

/// Agents by endpoint plus knobs to break long lived sessions.
#[derive(Default)]
pub struct Network {
    agents: Mutex<HashMap<String, Arc<Agent>>>,
    sessions: Mutex<Vec<(Arc<Agent>, Arc<PushSession>)>>,
    request_sessions: Mutex<Vec<String>>,
    failing_opens: AtomicUsize,
    open_attempts: Mutex<Vec<Instant>>,
}

impl Network {
    pub fn new() -> Arc<Self> {
        Arc::new(Network::default())
    }

    fn agent(&self, endpoint: &str) -> Result<Arc<Agent>> {
        self.agents
            .lock()
            .map_err(|_| Error::Generic("network poisoned".into()))?
            .get(endpoint)
            .cloned()
            .ok_or_else(|| Error::Transport(format!("nobody listens on {}", endpoint)))
    }

    /// Builds an agent speaking over this network and registers it under
    /// its endpoints.
    pub fn spawn(self: &Arc<Self>, config: AgentConfig) -> Result<Arc<Agent>> {
        let endpoints = config.endpoints.clone();
        let agent = Arc::new(
            Agent::builder(config)
                .transport(Arc::new(LoopbackTransport {
                    network: self.clone(),
                }))
                .build()?,
        );
        if let Ok(mut agents) = self.agents.lock() {
            for endpoint in endpoints {
                agents.insert(endpoint, agent.clone());
            }
        }
        Ok(agent)
    }

    /// Makes the next `count` session opens fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.failing_opens.store(count, Ordering::SeqCst);
    }

    /// Closes every long lived session from the server side.
    pub async fn close_sessions(&self) {
        let sessions = self
            .sessions
            .lock()
            .map(|mut sessions| std::mem::take(&mut *sessions))
            .unwrap_or_default();
        for (agent, session) in sessions {
            session.disconnect();
            agent.session_closed(&session.id).await;
        }
    }

    /// Ids of every finished request/response session.
    pub fn request_sessions(&self) -> Vec<String> {
        self.request_sessions
            .lock()
            .map(|ids| ids.clone())
            .unwrap_or_default()
    }

    /// Instants of every session open attempt, failed ones included.
    pub fn open_attempts(&self) -> Vec<Instant> {
        self.open_attempts
            .lock()
            .map(|attempts| attempts.clone())
            .unwrap_or_default()
    }
}

pub struct LoopbackTransport {
    network: Arc<Network>,
}

#[async_trait]
impl OutboundTransport for LoopbackTransport {
    fn supported_schemes(&self) -> Vec<String> {
        vec!["loop".into()]
    }

    async fn send(&self, endpoint: &str, payload: &[u8]) -> Result<Option<Vec<u8>>> {
        let agent = self.network.agent(endpoint)?;
        let session = Arc::new(CollectingSession::new());
        // Processing failures stay with the receiver, like a 202 would.
        let _ = agent
            .receive_message(payload, Some(session.clone() as Arc<dyn TransportSession>))
            .await;
        let response = session.finish();
        agent.session_closed(&session.id).await;
        if let Ok(mut ids) = self.network.request_sessions.lock() {
            ids.push(session.id.clone());
        }
        Ok(response)
    }

    async fn open_session(&self, endpoint: &str) -> Result<Box<dyn DuplexSession>> {
        if let Ok(mut attempts) = self.network.open_attempts.lock() {
            attempts.push(Instant::now());
        }
        let failing = self.network.failing_opens.load(Ordering::SeqCst);
        if failing > 0 {
            self.network.failing_opens.store(failing - 1, Ordering::SeqCst);
            return Err(Error::Transport(format!("{} refused the session", endpoint)));
        }
        let agent = self.network.agent(endpoint)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let server = Arc::new(PushSession {
            id: next_session_id("push"),
            tx: Mutex::new(Some(tx)),
        });
        if let Ok(mut sessions) = self.network.sessions.lock() {
            sessions.push((agent.clone(), server.clone()));
        }
        Ok(Box::new(LoopbackDuplex { agent, server, rx }))
    }
}

/// Server side of a request/response exchange. Only usable while the
/// request is being processed.
struct CollectingSession {
    id: String,
    open: AtomicBool,
    sent: Mutex<Vec<Vec<u8>>>,
}

impl CollectingSession {
    fn new() -> Self {
        CollectingSession {
            id: next_session_id("collect"),
            open: AtomicBool::new(true),
            sent: Mutex::new(vec![]),
        }
    }

    fn finish(&self) -> Option<Vec<u8>> {
        self.open.store(false, Ordering::SeqCst);
        self.sent
            .lock()
            .ok()
            .and_then(|mut sent| (!sent.is_empty()).then(|| sent.remove(0)))
    }
}

#[async_trait]
impl TransportSession for CollectingSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(Error::Transport(format!("session {} is closed", self.id)));
        }
        self.sent
            .lock()
            .map_err(|_| Error::Generic("session poisoned".into()))?
            .push(payload.to_vec());
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Server side of a long lived session, pushing to the client's channel.
pub struct PushSession {
    id: String,
    tx: Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>,
}

impl PushSession {
    fn disconnect(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}

#[async_trait]
impl TransportSession for PushSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        let tx = self
            .tx
            .lock()
            .map_err(|_| Error::Generic("session poisoned".into()))?;
        match tx.as_ref() {
            Some(tx) => tx
                .send(payload.to_vec())
                .map_err(|_| Error::Transport(format!("session {} is closed", self.id))),
            None => Err(Error::Transport(format!("session {} is closed", self.id))),
        }
    }

    async fn close(&self) -> Result<()> {
        self.disconnect();
        Ok(())
    }
}

struct LoopbackDuplex {
    agent: Arc<Agent>,
    server: Arc<PushSession>,
    rx: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl DuplexSession for LoopbackDuplex {
    async fn send(&mut self, payload: &[u8]) -> Result<()> {
        let _ = self
            .agent
            .receive_message(payload, Some(self.server.clone() as Arc<dyn TransportSession>))
            .await;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.rx.recv().await)
    }
}

pub fn config(label: &str) -> AgentConfig {
    AgentConfig {
        label: label.into(),
        endpoints: vec![format!("loop://{}", label)],
        auto_accept_connections: true,
        ..Default::default()
    }
}

/// Waits for the first event `predicate` maps to `Some`.
pub async fn wait_for<T, F>(events: broadcast::Receiver<AgentEvent>, what: &str, predicate: F) -> Result<T>
where
    F: FnMut(&AgentEvent) -> Option<T>,
{
    EventBus::wait_for(events, TIMEOUT, what, predicate).await
}

pub async fn wait_for_connection(
    events: broadcast::Receiver<AgentEvent>,
    invitation_id: &str,
    state: ConnectionState,
) -> Result<ConnectionRecord> {
    wait_for(events, "connection state", |event| match event {
        AgentEvent::ConnectionStateChanged { record, .. }
            if record.invitation_id == invitation_id && record.state() == state =>
        {
            Some(record.clone())
        }
        _ => None,
    })
    .await
}

/// Connects `invitee` to `inviter`, returning both completed records.
pub async fn connect(inviter: &Agent, invitee: &Agent) -> Result<(ConnectionRecord, ConnectionRecord)> {
    let (record, invitation) = inviter.create_invitation(Some(true)).await?;
    let inviter_events = inviter.subscribe();
    let invitee_events = invitee.subscribe();
    invitee.receive_invitation(&invitation, Some(true)).await?;
    let inviter_record =
        wait_for_connection(inviter_events, &record.invitation_id, ConnectionState::Complete).await?;
    let invitee_record =
        wait_for_connection(invitee_events, &record.invitation_id, ConnectionState::Complete).await?;
    Ok((inviter_record, invitee_record))
}
