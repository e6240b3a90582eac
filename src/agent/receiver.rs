use std::sync::Arc;

use super::{
    context::{AgentContext, ConnectionContext, InboundMessageContext, OutboundMessageContext},
    events::AgentEvent,
    registry::HandlerRegistry,
    sender::MessageSender,
    transport::{SessionEntry, TransportSession},
};
use crate::{
    messages::{problem_report::codes, PlaintextMessage, ProblemReport, ReturnRoute},
    protocols::connections::ConnectionService,
    Error, Result,
};

/// Inbound pipeline: unpack, resolve connection context, resolve handler,
/// run it and send what it returns.
///
/// This is the one place deciding what happens with per message errors; none
/// of them escape to the transport or stop the agent.
#[derive(Clone)]
pub struct MessageReceiver {
    context: Arc<AgentContext>,
    registry: Arc<HandlerRegistry>,
    sender: MessageSender,
    connections: Arc<ConnectionService>,
}

impl MessageReceiver {
    pub fn new(
        context: Arc<AgentContext>,
        registry: Arc<HandlerRegistry>,
        sender: MessageSender,
        connections: Arc<ConnectionService>,
    ) -> Self {
        MessageReceiver {
            context,
            registry,
            sender,
            connections,
        }
    }

    /// Fire and forget variant of [`MessageReceiver::receive_message`].
    pub fn receive(&self, payload: Vec<u8>, session: Option<Arc<dyn TransportSession>>) {
        let receiver = self.clone();
        tokio::spawn(async move {
            // Errors are logged inside.
            let _ = receiver.receive_message(&payload, session).await;
        });
    }

    /// Processes one inbound message to completion.
    ///
    /// # Parameters
    ///
    /// * `payload` - packed envelope or plaintext JSON message
    ///
    /// * `session` - inbound channel the message arrived on, kept open when
    /// the message asks for return routing and closed afterwards otherwise
    pub async fn receive_message(
        &self,
        payload: &[u8],
        session: Option<Arc<dyn TransportSession>>,
    ) -> Result<()> {
        let result = self.process(payload, session.clone()).await;
        if let Some(session) = session {
            if !self.context.transport_service.has_session(session.id()).await {
                if let Err(e) = session.close().await {
                    debug!("closing session {} failed: {}", session.id(), e);
                }
            }
        }
        result
    }

    async fn process(
        &self,
        payload: &[u8],
        session: Option<Arc<dyn TransportSession>>,
    ) -> Result<()> {
        let decrypted = match self.context.envelope.unpack(payload).await {
            Ok(decrypted) => decrypted,
            Err(e) => {
                // The sender is unknown, nobody to report to.
                error!("dropping inbound message that could not be unpacked: {}", e);
                return Err(e);
            }
        };
        let message = decrypted.message;
        debug!(
            "received {} ({}) from {:?}",
            message.id,
            message.message_type,
            decrypted.sender_key.as_ref().map(|k| k.fingerprint())
        );

        let connection = match (&decrypted.sender_key, &decrypted.recipient_key) {
            (Some(sender), Some(recipient)) => {
                match self.connections.find_by_keys(sender, recipient).await {
                    Ok(connection) => connection,
                    Err(e) => {
                        error!(
                            "dropping {} ({}): connection lookup failed: {}",
                            message.id, message.message_type, e
                        );
                        return Err(e);
                    }
                }
            }
            _ => None,
        };
        let connection_context = ConnectionContext {
            sender_key: decrypted.sender_key,
            recipient_key: decrypted.recipient_key,
            connection,
        };

        let mut ctx = InboundMessageContext::new(message, connection_context);
        if let Some(session) = session {
            if ctx.message.return_route() != ReturnRoute::None {
                self.context
                    .transport_service
                    .save_session(SessionEntry {
                        session: session.clone(),
                        connection_id: ctx.connection_id().map(str::to_string),
                        their_key: ctx.sender_key().cloned(),
                        return_route: ctx.message.return_route(),
                        thread_id: Some(ctx.message.thread_id().to_string()),
                    })
                    .await;
                ctx.session_id = Some(session.id().to_string());
            }
        }

        let outcome = self.dispatch(&ctx).await;
        match outcome {
            Ok(Some(outbound)) => {
                if let Err(e) = self.sender.send(outbound).await {
                    error!("reply to {} could not be sent: {}", ctx.message.id, e);
                    return Err(e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                self.on_error(&ctx, &e).await;
                return Err(e);
            }
        }
        self.context.events.emit(AgentEvent::MessageProcessed {
            message_id: ctx.message.id.clone(),
            message_type: ctx.message.message_type.clone(),
            connection_id: ctx.connection_id().map(str::to_string),
        });
        Ok(())
    }

    async fn dispatch(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>> {
        let handler = self.registry.resolve(&ctx.message.message_type)?;
        if handler.requires_connection() && ctx.connection().is_none() && ctx.message.service.is_none()
        {
            return Err(Error::MissingConnection);
        }
        handler.handle(ctx).await
    }

    async fn on_error(&self, ctx: &InboundMessageContext, error: &Error) {
        let message = &ctx.message;
        error!(
            "processing {} ({}) failed: {}",
            message.id, message.message_type, error
        );
        if is_problem_report(message) || !error.is_per_message() {
            return;
        }
        if matches!(error, Error::NoHandler(_))
            && !self.context.config.send_problem_report_on_unknown_message
        {
            return;
        }
        // Only peers we can reach get a report.
        if ctx.connection().is_none() && message.service.is_none() {
            return;
        }
        let report = match problem_report_for(message, error) {
            Ok(report) => report,
            Err(e) => {
                warn!("could not build problem report: {}", e);
                return;
            }
        };
        let outbound = match OutboundMessageContext::reply(ctx, report) {
            Ok(outbound) => outbound,
            Err(e) => {
                debug!("no route for problem report: {}", e);
                return;
            }
        };
        if let Err(e) = self.sender.send(outbound).await {
            warn!("problem report for {} not sent: {}", message.id, e);
        }
    }
}

fn is_problem_report(message: &PlaintextMessage) -> bool {
    matches!(message.message_type.name(), "problem-report" | "problem_report")
}

/// Problem report answering `message`, in the same protocol.
fn problem_report_for(message: &PlaintextMessage, error: &Error) -> Result<PlaintextMessage> {
    let name = if message.message_type.family() == "connections" {
        "problem_report"
    } else {
        "problem-report"
    };
    let code = match error {
        Error::NoHandler(_) => codes::UNSUPPORTED_MESSAGE,
        other => other.problem_code(),
    };
    let report = ProblemReport::new(code, error.to_string())?;
    Ok(
        PlaintextMessage::with_type(message.message_type.with_name(name), &report)?
            .reply_to(message),
    )
}
