use std::time::Duration;

use tokio::sync::broadcast;

use crate::{
    messages::MessageType,
    protocols::{
        connections::{ConnectionRecord, ConnectionState},
        credentials::{CredentialExchangeRecord, CredentialState},
        oob::{OutOfBandRecord, OutOfBandState},
        proofs::{ProofExchangeRecord, ProofState},
        routing::{KeylistUpdated, MediationRecord, MediationState},
    },
    Error, Result,
};

/// Notifications published by the agent. State changes are published only
/// after the new state was persisted.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    ConnectionStateChanged {
        record: ConnectionRecord,
        previous_state: Option<ConnectionState>,
    },
    CredentialStateChanged {
        record: CredentialExchangeRecord,
        previous_state: Option<CredentialState>,
    },
    ProofStateChanged {
        record: ProofExchangeRecord,
        previous_state: Option<ProofState>,
    },
    OutOfBandStateChanged {
        record: OutOfBandRecord,
        previous_state: Option<OutOfBandState>,
    },
    MediationStateChanged {
        record: MediationRecord,
        previous_state: Option<MediationState>,
    },
    /// Mediator answered a keylist update of the recipient.
    KeylistUpdateCompleted {
        mediation_id: String,
        thread_id: String,
        updated: Vec<KeylistUpdated>,
    },
    FeaturesDisclosed {
        connection_id: String,
        thread_id: String,
        protocols: Vec<String>,
    },
    MessageProcessed {
        message_id: String,
        message_type: MessageType,
        connection_id: Option<String>,
    },
}

/// Multi consumer channel of [`AgentEvent`]s.
///
/// Subscribers that fall behind lose the oldest events; there is no ordering
/// guarantee between events of different threads.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventBus { sender }
    }

    pub fn emit(&self, event: AgentEvent) {
        // No subscribers is not an error.
        if self.sender.send(event).is_err() {
            trace!("event dropped, nobody listens");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.sender.subscribe()
    }

    /// Waits until `predicate` maps an event to `Some`.
    ///
    /// Takes a receiver obtained *before* the triggering action, so the
    /// awaited event can not be missed.
    ///
    /// # Parameters
    ///
    /// * `receiver` - subscription created with [`EventBus::subscribe`]
    ///
    /// * `timeout` - how long to wait in total
    ///
    /// * `what` - description used in the `Timeout` error
    pub async fn wait_for<T, F>(
        mut receiver: broadcast::Receiver<AgentEvent>,
        timeout: Duration,
        what: &str,
        mut predicate: F,
    ) -> Result<T>
    where
        F: FnMut(&AgentEvent) -> Option<T>,
    {
        let waiting = async {
            loop {
                match receiver.recv().await {
                    Ok(event) => {
                        if let Some(found) = predicate(&event) {
                            return Ok(found);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("event subscriber lagged, {} events skipped", skipped);
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(Error::Shutdown),
                }
            }
        };
        tokio::time::timeout(timeout, waiting)
            .await
            .map_err(|_| Error::Timeout(what.to_string()))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processed(id: &str) -> Result<AgentEvent> {
        Ok(AgentEvent::MessageProcessed {
            message_id: id.into(),
            message_type: MessageType::parse("https://didcomm.org/trust_ping/1.0/ping")?,
            connection_id: None,
        })
    }

    #[tokio::test]
    async fn wait_for_returns_first_match() -> Result<()> {
        // Arrange
        let bus = EventBus::new(16);
        let receiver = bus.subscribe();
        // Act
        bus.emit(processed("1")?);
        bus.emit(processed("2")?);
        let found = EventBus::wait_for(receiver, Duration::from_secs(1), "message 2", |e| {
            match e {
                AgentEvent::MessageProcessed { message_id, .. } if message_id == "2" => {
                    Some(message_id.clone())
                }
                _ => None,
            }
        })
        .await?;
        // Assert
        assert_eq!(found, "2");
        Ok(())
    }

    #[tokio::test(start_paused = true)]
    async fn wait_for_times_out() {
        let bus = EventBus::new(4);
        let result: Result<()> =
            EventBus::wait_for(bus.subscribe(), Duration::from_millis(10), "nothing", |_| None)
                .await;
        assert!(matches!(result, Err(Error::Timeout(_))));
    }
}
