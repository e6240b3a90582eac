//! State machine discipline shared by every exchange protocol.
//!
//! Each protocol supplies a closed state enumeration ([`ProtocolState`]) with
//! its transition table and a record type ([`ExchangeRecord`]).
//! [`ExchangeEngine::update_state`] is the one place where a record's state
//! changes: it checks the table, persists through the repository's optimistic
//! version check and only then publishes the state change.
use std::{fmt, sync::Arc};

use serde::{Deserialize, Serialize};

use crate::{
    agent::{AgentEvent, EventBus},
    messages::{PlaintextMessage, ProblemReport},
    storage::{Query, Record, Repository},
    Error, Result,
};

/// Closed set of states of one protocol.
pub trait ProtocolState:
    Copy + Eq + fmt::Debug + fmt::Display + Send + Sync + 'static
{
    /// Terminal failure state, reached through problem reports and declines.
    const ABANDONED: Self;

    /// States a new record may be created in.
    fn is_initial(&self) -> bool;

    fn is_terminal(&self) -> bool;

    /// Edges of the transition table, excluding abandonment.
    fn allows(&self, next: Self) -> bool;

    /// Abandonment is allowed from every non-terminal state.
    fn can_transition_to(&self, next: Self) -> bool {
        if next == Self::ABANDONED {
            return !self.is_terminal();
        }
        self.allows(next)
    }
}

/// Proof of going through [`ExchangeEngine::update_state`]. Only the engine
/// can create one, so only the engine can call [`ExchangeRecord::apply_state`].
pub struct Transition(());

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

/// Reference to a message that drove a transition of a record.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct MessageRef {
    pub id: String,
    pub message_type: String,
    pub direction: Direction,
}

impl MessageRef {
    pub fn new(message: &PlaintextMessage, direction: Direction) -> Self {
        MessageRef {
            id: message.id.clone(),
            message_type: message.message_type.uri(),
            direction,
        }
    }
}

pub trait ExchangeRecord: Record + fmt::Debug {
    type State: ProtocolState;

    fn state(&self) -> Self::State;

    fn apply_state(&mut self, state: Self::State, token: Transition);

    fn error_message(&self) -> Option<&str>;

    fn set_error_message(&mut self, message: String);

    fn messages_mut(&mut self) -> &mut Vec<MessageRef>;

    fn state_changed_event(&self, previous_state: Option<Self::State>) -> AgentEvent;

    fn add_message(&mut self, message: &PlaintextMessage, direction: Direction) {
        self.messages_mut().push(MessageRef::new(message, direction));
    }
}

/// Policy deciding whether a received proposal, offer, request or credential
/// is answered without an explicit API call.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AutoAcceptPolicy {
    /// Always proceed with the next step.
    Always,
    /// Proceed only when the received content equals what this party sent last.
    ContentApproved,
    /// Wait for the user.
    #[serde(alias = "manual")]
    Never,
}

impl Default for AutoAcceptPolicy {
    fn default() -> Self {
        AutoAcceptPolicy::Never
    }
}

impl AutoAcceptPolicy {
    /// Record level setting wins over the agent configuration.
    pub fn compose(record: Option<AutoAcceptPolicy>, config: AutoAcceptPolicy) -> Self {
        record.unwrap_or(config)
    }

    /// # Parameters
    ///
    /// * `previously_sent` - negotiable content this party sent last, if any
    ///
    /// * `received` - negotiable content of the message just received
    pub fn should_accept<C: PartialEq>(&self, previously_sent: Option<&C>, received: &C) -> bool {
        match self {
            AutoAcceptPolicy::Always => true,
            AutoAcceptPolicy::ContentApproved => previously_sent == Some(received),
            AutoAcceptPolicy::Never => false,
        }
    }
}

/// One instantiation of the discipline for record type `R`.
pub struct ExchangeEngine<R: ExchangeRecord> {
    repository: Arc<dyn Repository<R>>,
    events: EventBus,
}

impl<R: ExchangeRecord> Clone for ExchangeEngine<R> {
    fn clone(&self) -> Self {
        ExchangeEngine {
            repository: self.repository.clone(),
            events: self.events.clone(),
        }
    }
}

impl<R: ExchangeRecord> ExchangeEngine<R> {
    pub fn new(repository: Arc<dyn Repository<R>>, events: EventBus) -> Self {
        ExchangeEngine { repository, events }
    }

    pub fn repository(&self) -> &Arc<dyn Repository<R>> {
        &self.repository
    }

    /// Persists a new record and announces it with no previous state.
    pub async fn create_record(&self, record: &R) -> Result<()> {
        if !record.state().is_initial() {
            return Err(Error::InvalidStateTransition {
                record_type: R::TYPE,
                id: record.id().to_string(),
                from: "none".into(),
                to: record.state().to_string(),
            });
        }
        self.repository.save(record).await?;
        debug!("{} {} created in state {}", R::TYPE, record.id(), record.state());
        self.events.emit(record.state_changed_event(None));
        Ok(())
    }

    /// Moves `record` to `new_state` and persists it with every other change
    /// made to it. On any error neither the stored record nor `record` change.
    pub async fn update_state(&self, record: &mut R, new_state: R::State) -> Result<()> {
        let previous_state = record.state();
        if !previous_state.can_transition_to(new_state) {
            return Err(Error::InvalidStateTransition {
                record_type: R::TYPE,
                id: record.id().to_string(),
                from: previous_state.to_string(),
                to: new_state.to_string(),
            });
        }
        let mut updated = record.clone();
        updated.apply_state(new_state, Transition(()));
        self.repository.update(&mut updated).await?;
        debug!(
            "{} {} moved from {} to {}",
            R::TYPE,
            record.id(),
            previous_state,
            new_state
        );
        *record = updated;
        self.events
            .emit(record.state_changed_event(Some(previous_state)));
        Ok(())
    }

    /// Persists changes that do not touch the state.
    pub async fn update(&self, record: &mut R) -> Result<()> {
        self.repository.update(record).await
    }

    pub async fn get_by_id(&self, id: &str) -> Result<R> {
        self.repository.get_by_id(id).await
    }

    /// Record of the thread. Missing or ambiguous correlation is an error.
    pub async fn get_by_thread(&self, thread_id: &str, connection_id: Option<&str>) -> Result<R> {
        self.repository
            .get_single_by_query(&Query::thread(thread_id).with_connection(connection_id))
            .await
    }

    pub async fn find_by_thread(
        &self,
        thread_id: &str,
        connection_id: Option<&str>,
    ) -> Result<Option<R>> {
        self.repository
            .find_single_by_query(&Query::thread(thread_id).with_connection(connection_id))
            .await
    }

    /// Abandons the record of the reported thread, keeping the peer's
    /// description as error message. A record already abandoned is
    /// returned unchanged.
    pub async fn process_problem_report(
        &self,
        message: &PlaintextMessage,
        connection_id: Option<&str>,
    ) -> Result<R> {
        let report: ProblemReport = message.decode()?;
        let mut record = self
            .get_by_thread(message.thread_id(), connection_id)
            .await?;
        if record.state() == R::State::ABANDONED {
            debug!(
                "{} {} already abandoned, ignoring problem report {}",
                R::TYPE,
                record.id(),
                message.id
            );
            return Ok(record);
        }
        info!(
            "{} {} abandoned by peer: {}",
            R::TYPE,
            record.id(),
            report.error_message()
        );
        record.set_error_message(report.error_message());
        record.add_message(message, Direction::Inbound);
        self.update_state(&mut record, R::State::ABANDONED).await?;
        Ok(record)
    }

    /// Moves the record of the acknowledged thread to `done`.
    pub async fn process_ack(
        &self,
        message: &PlaintextMessage,
        connection_id: Option<&str>,
        done: R::State,
    ) -> Result<R> {
        let mut record = self
            .get_by_thread(message.thread_id(), connection_id)
            .await?;
        record.add_message(message, Direction::Inbound);
        self.update_state(&mut record, done).await?;
        Ok(record)
    }

    /// Abandons the record locally, e.g. before sending a problem report.
    pub async fn abandon(&self, record: &mut R, reason: String) -> Result<()> {
        record.set_error_message(reason);
        self.update_state(record, R::State::ABANDONED).await
    }
}

/// Fails with `InvalidStateTransition` unless `record` is in `expected`.
pub fn assert_state<R: ExchangeRecord>(record: &R, expected: &[R::State], to: R::State) -> Result<()> {
    if expected.contains(&record.state()) {
        Ok(())
    } else {
        Err(Error::InvalidStateTransition {
            record_type: R::TYPE,
            id: record.id().to_string(),
            from: record.state().to_string(),
            to: to.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        messages::{problem_report::codes, MessageType},
        storage::InMemoryRepository,
    };

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum DoorState {
        Closed,
        Open,
        Broken,
        Gone,
    }

    impl fmt::Display for DoorState {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl ProtocolState for DoorState {
        const ABANDONED: Self = DoorState::Broken;
        fn is_initial(&self) -> bool {
            *self == DoorState::Closed
        }
        fn is_terminal(&self) -> bool {
            matches!(self, DoorState::Broken | DoorState::Gone)
        }
        fn allows(&self, next: Self) -> bool {
            matches!(
                (self, next),
                (DoorState::Closed, DoorState::Open)
                    | (DoorState::Open, DoorState::Closed)
                    | (DoorState::Open, DoorState::Gone)
            )
        }
    }

    #[derive(Debug, Clone)]
    struct Door {
        id: String,
        thread: String,
        state: DoorState,
        error: Option<String>,
        messages: Vec<MessageRef>,
        version: u64,
    }

    impl Record for Door {
        const TYPE: &'static str = "Door";
        fn id(&self) -> &str {
            &self.id
        }
        fn version(&self) -> u64 {
            self.version
        }
        fn set_version(&mut self, version: u64) {
            self.version = version
        }
        fn thread_id(&self) -> Option<&str> {
            Some(&self.thread)
        }
    }

    impl ExchangeRecord for Door {
        type State = DoorState;
        fn state(&self) -> DoorState {
            self.state
        }
        fn apply_state(&mut self, state: DoorState, _: Transition) {
            self.state = state
        }
        fn error_message(&self) -> Option<&str> {
            self.error.as_deref()
        }
        fn set_error_message(&mut self, message: String) {
            self.error = Some(message)
        }
        fn messages_mut(&mut self) -> &mut Vec<MessageRef> {
            &mut self.messages
        }
        fn state_changed_event(&self, _: Option<DoorState>) -> AgentEvent {
            AgentEvent::MessageProcessed {
                message_id: self.id.clone(),
                message_type: MessageType::parse("https://example.org/door/1.0/moved")
                    .unwrap_or_else(|_| unreachable!()),
                connection_id: None,
            }
        }
    }

    async fn engine_with_door() -> Result<(ExchangeEngine<Door>, Door)> {
        let engine = ExchangeEngine::new(
            Arc::new(InMemoryRepository::<Door>::new()),
            EventBus::new(8),
        );
        let door = Door {
            id: "door".into(),
            thread: "thread".into(),
            state: DoorState::Closed,
            error: None,
            messages: vec![],
            version: 0,
        };
        engine.create_record(&door).await?;
        Ok((engine, door))
    }

    fn problem_report() -> Result<PlaintextMessage> {
        Ok(PlaintextMessage::new(&ProblemReport::new(codes::ABANDONED, "gave up")?)?
            .set_thread_id("thread"))
    }

    #[tokio::test]
    async fn transition_outside_table_leaves_record_unchanged() -> Result<()> {
        // Arrange
        let (engine, mut door) = engine_with_door().await?;
        // Act
        let result = engine.update_state(&mut door, DoorState::Gone).await;
        // Assert
        assert!(matches!(result, Err(Error::InvalidStateTransition { .. })));
        assert_eq!(door.state, DoorState::Closed);
        assert_eq!(engine.get_by_id("door").await?.state, DoorState::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn problem_report_abandons_once() -> Result<()> {
        let (engine, mut door) = engine_with_door().await?;
        engine.update_state(&mut door, DoorState::Open).await?;
        let report = problem_report()?;

        let first = engine.process_problem_report(&report, None).await?;
        let second = engine.process_problem_report(&report, None).await?;

        assert_eq!(first.state, DoorState::Broken);
        assert_eq!(first.error.as_deref(), Some("e.p.req.abandoned: gave up"));
        assert_eq!(second.version, first.version);
        assert_eq!(second.messages.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn problem_report_on_terminal_record_fails() -> Result<()> {
        let (engine, mut door) = engine_with_door().await?;
        engine.update_state(&mut door, DoorState::Open).await?;
        engine.update_state(&mut door, DoorState::Gone).await?;
        let result = engine.process_problem_report(&problem_report()?, None).await;
        assert!(matches!(result, Err(Error::InvalidStateTransition { .. })));
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_writer_is_detected() -> Result<()> {
        let (engine, _) = engine_with_door().await?;
        let mut first = engine.get_by_id("door").await?;
        let mut second = engine.get_by_id("door").await?;
        engine.update_state(&mut first, DoorState::Open).await?;
        let result = engine.update_state(&mut second, DoorState::Open).await;
        assert!(matches!(result, Err(Error::StaleRecord { .. })));
        assert_eq!(second.state, DoorState::Closed);
        Ok(())
    }

    #[tokio::test]
    async fn unknown_thread_is_not_found() -> Result<()> {
        let (engine, _) = engine_with_door().await?;
        let report = PlaintextMessage::new(&ProblemReport::new(codes::ABANDONED, "x")?)?
            .set_thread_id("other");
        assert!(matches!(
            engine.process_problem_report(&report, None).await,
            Err(Error::RecordNotFound { .. })
        ));
        Ok(())
    }

    #[test]
    fn content_approved_needs_equal_content() {
        let policy = AutoAcceptPolicy::ContentApproved;
        assert!(policy.should_accept(Some(&1), &1));
        assert!(!policy.should_accept(Some(&1), &2));
        assert!(!policy.should_accept(None, &2));
        assert!(AutoAcceptPolicy::Always.should_accept(None, &2));
        assert!(!AutoAcceptPolicy::Never.should_accept(Some(&2), &2));
    }

    #[test]
    fn manual_is_an_alias_of_never() -> std::result::Result<(), serde_json::Error> {
        let policy: AutoAcceptPolicy = serde_json::from_str("\"manual\"")?;
        assert_eq!(policy, AutoAcceptPolicy::Never);
        assert_eq!(
            AutoAcceptPolicy::compose(None, AutoAcceptPolicy::Always),
            AutoAcceptPolicy::Always
        );
        assert_eq!(
            AutoAcceptPolicy::compose(Some(AutoAcceptPolicy::Never), AutoAcceptPolicy::Always),
            AutoAcceptPolicy::Never
        );
        Ok(())
    }
}
