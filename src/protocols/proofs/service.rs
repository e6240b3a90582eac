use std::{collections::BTreeSet, sync::Arc};

use super::{
    Presentation, PresentationPreview, ProofExchangeRecord, ProofRole, ProofState,
    ProposePresentation, RequestPresentation, PRESENTATION_ACK, PRESENTATION_PROBLEM_REPORT,
};
use crate::{
    agent::{AgentContext, InboundMessageContext, OutboundMessageContext},
    formats::{ProofContent, ProofFormat},
    messages::{Ack, Attachment, MessageType, PlaintextMessage, ProblemReport, ServiceDecorator},
    protocols::{
        connections::{ConnectionRecord, ConnectionService},
        exchange::{assert_state, AutoAcceptPolicy, Direction, ExchangeEngine, ExchangeRecord},
        oob::{ConnectionlessRoute, OutOfBandService},
        routing::MediationRecipientService,
    },
    storage::Repository,
    Error, Result,
};

/// Verifier and prover side of proof presentation.
#[derive(Clone)]
pub struct ProofService {
    engine: ExchangeEngine<ProofExchangeRecord>,
    context: Arc<AgentContext>,
    connections: Arc<ConnectionService>,
    recipient: Arc<MediationRecipientService>,
    out_of_band: Arc<OutOfBandService>,
    format: Arc<dyn ProofFormat>,
}

/// Fails unless `ctx` arrived over the channel of `record`: its connection,
/// or for a connectionless exchange a key of the peer's `~service`.
fn assert_channel(record: &ProofExchangeRecord, ctx: &InboundMessageContext) -> Result<()> {
    match (record.connection_id.as_deref(), ctx.connection_id()) {
        (Some(expected), Some(actual)) if expected == actual => Ok(()),
        (None, None) => match &record.connectionless {
            Some(route) => route.assert_peer(ctx.sender_key()),
            None => Ok(()),
        },
        _ => Err(Error::InvalidMessage(format!(
            "message {} is not on the channel of proof exchange {}",
            ctx.message.id, record.id
        ))),
    }
}

impl ProofService {
    pub fn new(
        context: Arc<AgentContext>,
        repository: Arc<dyn Repository<ProofExchangeRecord>>,
        connections: Arc<ConnectionService>,
        recipient: Arc<MediationRecipientService>,
        out_of_band: Arc<OutOfBandService>,
        format: Arc<dyn ProofFormat>,
    ) -> Self {
        ProofService {
            engine: ExchangeEngine::new(repository, context.events.clone()),
            context,
            connections,
            recipient,
            out_of_band,
            format,
        }
    }

    async fn ready_connection(&self, connection_id: &str) -> Result<ConnectionRecord> {
        let connection = self.connections.get_by_id(connection_id).await?;
        connection.assert_ready()?;
        Ok(connection)
    }

    async fn outbound(
        &self,
        record: &ProofExchangeRecord,
        message: PlaintextMessage,
    ) -> Result<OutboundMessageContext> {
        match (&record.connection_id, &record.connectionless) {
            (Some(connection_id), _) => {
                let connection = self.ready_connection(connection_id).await?;
                Ok(OutboundMessageContext::for_connection(message, connection))
            }
            (None, Some(route)) => {
                let outbound = route.outbound(message)?;
                // The receiver of an out-of-band request is done once it answered.
                self.out_of_band.complete(&record.thread_id).await?;
                Ok(outbound)
            }
            (None, None) => Err(Error::MissingConnection),
        }
    }

    /// Fresh key and `~service` for one connectionless exchange, routed
    /// through the default mediator when there is one.
    async fn connectionless_route(
        &self,
        their_service: Option<ServiceDecorator>,
    ) -> Result<ConnectionlessRoute> {
        let routing = self.recipient.get_routing(true).await?;
        Ok(ConnectionlessRoute {
            my_service: routing.service(),
            my_key: routing.recipient_key,
            their_service,
        })
    }

    async fn proposal_message(&self, attributes: &BTreeSet<String>) -> Result<(Attachment, PlaintextMessage)> {
        let proposal = self.format.create_proposal(attributes).await?;
        let message = PlaintextMessage::new(&ProposePresentation {
            comment: None,
            presentation_proposal: PresentationPreview::new(attributes),
            proposals: vec![proposal.clone()],
        })?;
        Ok((proposal, message))
    }

    async fn request_message(&self, attributes: &BTreeSet<String>) -> Result<(Attachment, PlaintextMessage)> {
        let request = self.format.create_request(attributes).await?;
        let message = PlaintextMessage::new(&RequestPresentation {
            comment: None,
            request_presentations: vec![request.clone()],
        })?;
        Ok((request, message))
    }

    /// Prover offers to present `attributes`.
    pub async fn create_proposal(
        &self,
        connection_id: &str,
        attributes: &BTreeSet<String>,
        auto_accept: Option<AutoAcceptPolicy>,
    ) -> Result<(ProofExchangeRecord, OutboundMessageContext)> {
        let connection = self.ready_connection(connection_id).await?;
        let (proposal, message) = self.proposal_message(attributes).await?;
        let mut record = ProofExchangeRecord::new(
            ProofRole::Prover,
            ProofState::ProposalSent,
            Some(&connection.id),
            message.thread_id(),
        );
        record.proposal = Some(proposal);
        record.auto_accept = auto_accept;
        record.add_message(&message, Direction::Outbound);
        self.engine.create_record(&record).await?;
        Ok((record, OutboundMessageContext::for_connection(message, connection)))
    }

    pub async fn process_proposal(&self, ctx: &InboundMessageContext) -> Result<ProofExchangeRecord> {
        let proposal: ProposePresentation = ctx.message.decode()?;
        let connection = ctx.assert_ready_connection()?;
        let attachment = proposal.proposals[0].clone();
        self.format.content(&attachment)?;
        match self
            .engine
            .find_by_thread(ctx.message.thread_id(), Some(&connection.id))
            .await?
        {
            Some(mut record) => {
                assert_state(&record, &[ProofState::RequestSent], ProofState::ProposalReceived)?;
                record.proposal = Some(attachment);
                record.add_message(&ctx.message, Direction::Inbound);
                self.engine
                    .update_state(&mut record, ProofState::ProposalReceived)
                    .await?;
                Ok(record)
            }
            None => {
                let mut record = ProofExchangeRecord::new(
                    ProofRole::Verifier,
                    ProofState::ProposalReceived,
                    Some(&connection.id),
                    ctx.message.thread_id(),
                );
                record.proposal = Some(attachment);
                record.add_message(&ctx.message, Direction::Inbound);
                self.engine.create_record(&record).await?;
                Ok(record)
            }
        }
    }

    /// Requests exactly the proposed attributes.
    pub async fn accept_proposal(
        &self,
        record_id: &str,
    ) -> Result<(ProofExchangeRecord, OutboundMessageContext)> {
        let record = self.engine.get_by_id(record_id).await?;
        let proposal = record
            .proposal
            .as_ref()
            .ok_or_else(|| Error::InvalidMessage(format!("proof exchange {} has no proposal", record.id)))?;
        let attributes = self.format.content(proposal)?.attributes;
        self.request_in_thread(record, &attributes).await
    }

    /// Answers a proposal with a request for other attributes.
    pub async fn negotiate_proposal(
        &self,
        record_id: &str,
        attributes: &BTreeSet<String>,
    ) -> Result<(ProofExchangeRecord, OutboundMessageContext)> {
        let record = self.engine.get_by_id(record_id).await?;
        self.request_in_thread(record, attributes).await
    }

    async fn request_in_thread(
        &self,
        mut record: ProofExchangeRecord,
        attributes: &BTreeSet<String>,
    ) -> Result<(ProofExchangeRecord, OutboundMessageContext)> {
        assert_state(&record, &[ProofState::ProposalReceived], ProofState::RequestSent)?;
        let (request, message) = self.request_message(attributes).await?;
        let message = message.set_thread_id(&record.thread_id);
        record.request = Some(request);
        record.add_message(&message, Direction::Outbound);
        self.engine
            .update_state(&mut record, ProofState::RequestSent)
            .await?;
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    /// Verifier starts the exchange with a request.
    pub async fn create_request(
        &self,
        connection_id: &str,
        attributes: &BTreeSet<String>,
        auto_accept: Option<AutoAcceptPolicy>,
    ) -> Result<(ProofExchangeRecord, OutboundMessageContext)> {
        let connection = self.ready_connection(connection_id).await?;
        let (request, message) = self.request_message(attributes).await?;
        let mut record = ProofExchangeRecord::new(
            ProofRole::Verifier,
            ProofState::RequestSent,
            Some(&connection.id),
            message.thread_id(),
        );
        record.request = Some(request);
        record.auto_accept = auto_accept;
        record.add_message(&message, Direction::Outbound);
        self.engine.create_record(&record).await?;
        Ok((record, OutboundMessageContext::for_connection(message, connection)))
    }

    /// Verifier request for a prover without a connection. The returned
    /// message carries this agent's `~service` and is handed over out of band.
    pub async fn create_connectionless_request(
        &self,
        attributes: &BTreeSet<String>,
        auto_accept: Option<AutoAcceptPolicy>,
    ) -> Result<(ProofExchangeRecord, PlaintextMessage)> {
        let (request, message) = self.request_message(attributes).await?;
        let route = self.connectionless_route(None).await?;
        let message = message.set_service(route.my_service.clone());
        let mut record = ProofExchangeRecord::new(
            ProofRole::Verifier,
            ProofState::RequestSent,
            None,
            message.thread_id(),
        );
        record.request = Some(request);
        record.auto_accept = auto_accept;
        record.connectionless = Some(route);
        record.add_message(&message, Direction::Outbound);
        self.engine.create_record(&record).await?;
        Ok((record, message))
    }

    pub async fn process_request(&self, ctx: &InboundMessageContext) -> Result<ProofExchangeRecord> {
        let request: RequestPresentation = ctx.message.decode()?;
        let connection_id = ctx.connection_or_service()?.map(|c| c.id.as_str());
        let attachment = request.request_presentations[0].clone();
        self.format.content(&attachment)?;
        match self
            .engine
            .find_by_thread(ctx.message.thread_id(), connection_id)
            .await?
        {
            Some(mut record) => {
                assert_channel(&record, ctx)?;
                assert_state(&record, &[ProofState::ProposalSent], ProofState::RequestReceived)?;
                record.request = Some(attachment);
                record.add_message(&ctx.message, Direction::Inbound);
                self.engine
                    .update_state(&mut record, ProofState::RequestReceived)
                    .await?;
                Ok(record)
            }
            None => {
                let mut record = ProofExchangeRecord::new(
                    ProofRole::Prover,
                    ProofState::RequestReceived,
                    connection_id,
                    ctx.message.thread_id(),
                );
                if connection_id.is_none() {
                    let route = self.connectionless_route(ctx.message.service.clone()).await?;
                    record.connectionless = Some(route);
                }
                record.request = Some(attachment);
                record.add_message(&ctx.message, Direction::Inbound);
                self.engine.create_record(&record).await?;
                Ok(record)
            }
        }
    }

    /// Presents stored credentials answering the request. Fails with
    /// `NoMatchingCredential`, leaving the record as it was, when none does.
    pub async fn accept_request(
        &self,
        record_id: &str,
    ) -> Result<(ProofExchangeRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(record_id).await?;
        assert_state(&record, &[ProofState::RequestReceived], ProofState::PresentationSent)?;
        let request = record
            .request
            .as_ref()
            .ok_or_else(|| Error::InvalidMessage(format!("proof exchange {} has no request", record.id)))?;
        let presentation = self.format.create_presentation(request).await?;
        let message = PlaintextMessage::new(&Presentation {
            comment: None,
            presentations: vec![presentation.clone()],
        })?
        .set_thread_id(&record.thread_id);
        record.presentation = Some(presentation);
        record.add_message(&message, Direction::Outbound);
        self.engine
            .update_state(&mut record, ProofState::PresentationSent)
            .await?;
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    /// Answers a request with a counter proposal.
    pub async fn negotiate_request(
        &self,
        record_id: &str,
        attributes: &BTreeSet<String>,
    ) -> Result<(ProofExchangeRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(record_id).await?;
        assert_state(&record, &[ProofState::RequestReceived], ProofState::ProposalSent)?;
        let (proposal, message) = self.proposal_message(attributes).await?;
        let message = message.set_thread_id(&record.thread_id);
        record.proposal = Some(proposal);
        record.add_message(&message, Direction::Outbound);
        self.engine
            .update_state(&mut record, ProofState::ProposalSent)
            .await?;
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    /// Abandons the exchange and reports `code` to the peer.
    pub async fn decline_request(
        &self,
        record_id: &str,
        code: &str,
        reason: &str,
    ) -> Result<(ProofExchangeRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(record_id).await?;
        let report = ProblemReport::new(code, reason)?;
        let message =
            PlaintextMessage::with_type(MessageType::parse(PRESENTATION_PROBLEM_REPORT)?, &report)?
                .set_thread_id(&record.thread_id);
        record.add_message(&message, Direction::Outbound);
        self.engine.abandon(&mut record, report.error_message()).await?;
        info!("proof exchange {} declined: {}", record.id, report.error_message());
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    /// Verifies the presentation against the request sent.
    pub async fn process_presentation(&self, ctx: &InboundMessageContext) -> Result<ProofExchangeRecord> {
        let presentation: Presentation = ctx.message.decode()?;
        let connection_id = ctx.connection_or_service()?.map(|c| c.id.as_str());
        let mut record = self
            .engine
            .get_by_thread(ctx.message.thread_id(), connection_id)
            .await?;
        assert_channel(&record, ctx)?;
        assert_state(&record, &[ProofState::RequestSent], ProofState::PresentationReceived)?;
        let attachment = presentation.presentations[0].clone();
        let request = record
            .request
            .as_ref()
            .ok_or_else(|| Error::InvalidMessage(format!("proof exchange {} has no request", record.id)))?;
        let revealed = self.format.verify_presentation(request, &attachment).await?;
        record.is_verified = Some(revealed.is_some());
        record.revealed_attributes = revealed;
        record.presentation = Some(attachment);
        if let Some(route) = record.connectionless.as_mut() {
            route.learn(ctx.message.service.as_ref());
        }
        record.add_message(&ctx.message, Direction::Inbound);
        self.engine
            .update_state(&mut record, ProofState::PresentationReceived)
            .await?;
        if record.connection_id.is_none() {
            self.out_of_band.complete(&record.thread_id).await?;
        }
        Ok(record)
    }

    /// Acknowledges a verified presentation.
    pub async fn accept_presentation(
        &self,
        record_id: &str,
    ) -> Result<(ProofExchangeRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(record_id).await?;
        assert_state(&record, &[ProofState::PresentationReceived], ProofState::Done)?;
        if record.is_verified != Some(true) {
            return Err(Error::InvalidMessage(format!(
                "presentation of proof exchange {} did not verify",
                record.id
            )));
        }
        let message = PlaintextMessage::with_type(MessageType::parse(PRESENTATION_ACK)?, &Ack::ok())?
            .set_thread_id(&record.thread_id);
        record.add_message(&message, Direction::Outbound);
        self.engine.update_state(&mut record, ProofState::Done).await?;
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    pub async fn process_ack(&self, ctx: &InboundMessageContext) -> Result<ProofExchangeRecord> {
        ctx.message.decode::<Ack>()?;
        let connection_id = ctx.connection_or_service()?.map(|c| c.id.as_str());
        let record = self
            .engine
            .get_by_thread(ctx.message.thread_id(), connection_id)
            .await?;
        assert_channel(&record, ctx)?;
        assert_state(&record, &[ProofState::PresentationSent], ProofState::Done)?;
        self.engine
            .process_ack(&ctx.message, connection_id, ProofState::Done)
            .await
    }

    pub async fn process_problem_report(&self, ctx: &InboundMessageContext) -> Result<ProofExchangeRecord> {
        let record = self
            .engine
            .process_problem_report(&ctx.message, ctx.connection_id())
            .await?;
        warn!(
            "proof exchange {} abandoned: {}",
            record.id,
            record.error_message.as_deref().unwrap_or_default()
        );
        Ok(record)
    }

    fn policy(&self, record: &ProofExchangeRecord) -> AutoAcceptPolicy {
        AutoAcceptPolicy::compose(record.auto_accept, self.context.config.auto_accept_proofs)
    }

    fn content(&self, attachment: Option<&Attachment>) -> Result<Option<ProofContent>> {
        attachment.map(|a| self.format.content(a)).transpose()
    }

    fn should_accept(
        &self,
        record: &ProofExchangeRecord,
        sent: Option<&Attachment>,
        received: Option<&Attachment>,
    ) -> Result<bool> {
        let received = match self.content(received)? {
            Some(received) => received,
            None => return Ok(false),
        };
        let sent = self.content(sent)?;
        Ok(self.policy(record).should_accept(sent.as_ref(), &received))
    }

    /// Verifier: the proposal asks for the attributes it requested before.
    pub fn should_auto_respond_to_proposal(&self, record: &ProofExchangeRecord) -> Result<bool> {
        self.should_accept(record, record.request.as_ref(), record.proposal.as_ref())
    }

    /// Prover: the request asks for the attributes it proposed.
    pub fn should_auto_respond_to_request(&self, record: &ProofExchangeRecord) -> Result<bool> {
        self.should_accept(record, record.proposal.as_ref(), record.request.as_ref())
    }

    /// Verifier: a verified presentation answers its own request, so only
    /// `Never` holds it back.
    pub fn should_auto_respond_to_presentation(&self, record: &ProofExchangeRecord) -> bool {
        record.is_verified == Some(true) && self.policy(record) != AutoAcceptPolicy::Never
    }

    pub async fn get_by_id(&self, record_id: &str) -> Result<ProofExchangeRecord> {
        self.engine.get_by_id(record_id).await
    }

    pub async fn get_all(&self) -> Result<Vec<ProofExchangeRecord>> {
        self.engine.repository().get_all().await
    }
}
