use std::{
    collections::HashSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use tokio::time::MissedTickBehavior;

use super::{BatchPickup, MediationRecord, MediatorPickupStrategy};
use crate::{
    agent::{AgentContext, DuplexSession, MessageSender, OutboundMessageContext},
    messages::{PlaintextMessage, ReturnRoute},
    protocols::{
        connections::{ConnectionRecord, ConnectionService},
        trust_ping::Ping,
    },
    Error, Result,
};

/// Exponential reconnect delay: `base * 2^attempt`, capped at `max`.
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Backoff {
            base,
            max,
            attempt: 0,
        }
    }

    /// Delay before the next attempt, doubling with each call.
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PickupStatus {
    Started,
    /// A loop for this mediator and strategy is already running.
    AlreadyRunning,
    /// The initial session could not be opened; the agent runs without
    /// implicit pickup.
    Degraded(String),
    Disabled,
}

/// Retrieves messages queued at a mediator.
///
/// Every loop runs until the agent's shutdown token is cancelled. At most one
/// loop per mediation record and strategy exists at any time.
#[derive(Clone)]
pub struct PickupCoordinator {
    context: Arc<AgentContext>,
    sender: MessageSender,
    connections: Arc<ConnectionService>,
    active: Arc<Mutex<HashSet<String>>>,
}

/// Removes the loop from the active set when the loop ends.
struct ActiveLoop {
    active: Arc<Mutex<HashSet<String>>>,
    key: String,
}

impl Drop for ActiveLoop {
    fn drop(&mut self) {
        if let Ok(mut active) = self.active.lock() {
            active.remove(&self.key);
        }
    }
}

impl PickupCoordinator {
    pub fn new(
        context: Arc<AgentContext>,
        sender: MessageSender,
        connections: Arc<ConnectionService>,
    ) -> Self {
        PickupCoordinator {
            context,
            sender,
            connections,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn claim(&self, mediation: &MediationRecord, kind: &str) -> Option<ActiveLoop> {
        let key = format!("{}:{}", mediation.id, kind);
        let mut active = self.active.lock().ok()?;
        if !active.insert(key.clone()) {
            return None;
        }
        Some(ActiveLoop {
            active: self.active.clone(),
            key,
        })
    }

    pub fn is_running(&self, mediation_id: &str) -> bool {
        self.active
            .lock()
            .map(|active| active.iter().any(|k| k.starts_with(&format!("{}:", mediation_id))))
            .unwrap_or(false)
    }

    /// Starts retrieving messages from the mediator of `mediation`.
    ///
    /// For `Combined` the status of the implicit part is returned, polling
    /// starts regardless.
    pub async fn initiate(
        &self,
        mediation: &MediationRecord,
        strategy: MediatorPickupStrategy,
    ) -> Result<PickupStatus> {
        if !mediation.is_ready() {
            return Err(Error::InvalidStateTransition {
                record_type: "Mediation",
                id: mediation.id.clone(),
                from: mediation.state().to_string(),
                to: "pickup".into(),
            });
        }
        match strategy {
            MediatorPickupStrategy::Explicit => {
                info!("starting explicit pickup from mediation {}", mediation.id);
                Ok(self.start_polling(mediation))
            }
            MediatorPickupStrategy::Implicit => {
                info!("starting implicit pickup from mediation {}", mediation.id);
                self.start_implicit(mediation).await
            }
            MediatorPickupStrategy::Combined => {
                info!("starting combined pickup from mediation {}", mediation.id);
                self.start_polling(mediation);
                self.start_implicit(mediation).await
            }
            MediatorPickupStrategy::None => {
                info!("pickup from mediation {} disabled", mediation.id);
                Ok(PickupStatus::Disabled)
            }
        }
    }

    /// Requests one batch of queued messages. The batch comes back on the
    /// same channel and goes through the normal inbound path.
    pub async fn pickup_messages(&self, mediation: &MediationRecord) -> Result<()> {
        let connection = self.connections.get_by_id(&mediation.connection_id).await?;
        let message = PlaintextMessage::new(&BatchPickup {
            batch_size: self.context.config.mediator_batch_size,
        })?
        .set_return_route(ReturnRoute::All);
        self.sender
            .send(OutboundMessageContext::for_connection(message, connection))
            .await
    }

    fn start_polling(&self, mediation: &MediationRecord) -> PickupStatus {
        let guard = match self.claim(mediation, "explicit") {
            Some(guard) => guard,
            None => return PickupStatus::AlreadyRunning,
        };
        let coordinator = self.clone();
        let mediation = mediation.clone();
        let shutdown = self.context.shutdown.clone();
        let mut ticker = tokio::time::interval(self.context.config.mediator_polling_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        tokio::spawn(async move {
            let _guard = guard;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = coordinator.pickup_messages(&mediation).await {
                            warn!("pickup from mediation {} failed: {}", mediation.id, e);
                        }
                    }
                }
            }
            debug!("explicit pickup from mediation {} stopped", mediation.id);
        });
        PickupStatus::Started
    }

    /// Opens a session to the mediator and asks it, with a return routed
    /// trust ping, to push messages over it.
    async fn open_session(&self, connection: &ConnectionRecord) -> Result<Box<dyn DuplexSession>> {
        let endpoint = connection
            .their_service
            .as_ref()
            .map(|s| s.service_endpoint.clone())
            .ok_or_else(|| Error::ConnectionNotReady(connection.id.clone()))?;
        let mut session = self.sender.open_session(&endpoint).await?;
        let ping = PlaintextMessage::new(&Ping {
            response_requested: false,
            comment: None,
        })?
        .set_return_route(ReturnRoute::All);
        let payload = self
            .sender
            .pack_direct(&OutboundMessageContext::for_connection(ping, connection.clone()))
            .await?;
        session.send(&payload).await?;
        Ok(session)
    }

    async fn start_implicit(&self, mediation: &MediationRecord) -> Result<PickupStatus> {
        let guard = match self.claim(mediation, "implicit") {
            Some(guard) => guard,
            None => return Ok(PickupStatus::AlreadyRunning),
        };
        let connection = self.connections.get_by_id(&mediation.connection_id).await?;
        let session = match self.open_session(&connection).await {
            Ok(session) => session,
            Err(e) => {
                warn!(
                    "could not open session to mediator of {}, continuing without it: {}",
                    mediation.id, e
                );
                return Ok(PickupStatus::Degraded(e.to_string()));
            }
        };
        let coordinator = self.clone();
        let mediation_id = mediation.id.clone();
        tokio::spawn(async move {
            let _guard = guard;
            coordinator
                .hold_session(&mediation_id, &connection, session)
                .await;
            debug!("implicit pickup from mediation {} stopped", mediation_id);
        });
        Ok(PickupStatus::Started)
    }

    /// Reads from the session until shutdown, reopening it with backoff
    /// whenever it closes.
    async fn hold_session(
        &self,
        mediation_id: &str,
        connection: &ConnectionRecord,
        mut session: Box<dyn DuplexSession>,
    ) {
        let shutdown = self.context.shutdown.clone();
        let mut backoff = Backoff::new(
            self.context.config.mediator_reconnect_base_interval,
            self.context.config.mediator_reconnect_max_interval,
        );
        loop {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    received = session.recv() => match received {
                        Ok(Some(payload)) => {
                            if self.context.deliver_inbound(payload).is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            debug!("session to mediator of {} failed: {}", mediation_id, e);
                            break;
                        }
                    }
                }
            }
            session = loop {
                let delay = backoff.next_delay();
                warn!(
                    "session to mediator of {} closed, reconnecting in {:?}",
                    mediation_id, delay
                );
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.open_session(connection).await {
                    Ok(session) => {
                        info!("reconnected to mediator of {}", mediation_id);
                        backoff.reset();
                        break session;
                    }
                    Err(e) => warn!("reconnecting to mediator of {} failed: {}", mediation_id, e),
                }
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_up_to_max() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(3));
        let delays: Vec<u128> = (0..5).map(|_| backoff.next_delay().as_millis()).collect();
        assert_eq!(delays, vec![500, 1000, 2000, 3000, 3000]);
        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn backoff_never_overflows() {
        let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(60));
        for _ in 0..100 {
            assert!(backoff.next_delay() <= Duration::from_secs(60));
        }
    }
}
