use std::{collections::BTreeMap, sync::Arc};

use super::{
    CredentialExchangeRecord, CredentialPreview, CredentialRole, CredentialState, IssueCredential,
    OfferCredential, ProposeCredential, RequestCredential, CREDENTIAL_ACK, CREDENTIAL_PROBLEM_REPORT,
};
use crate::{
    agent::{AgentContext, InboundMessageContext, OutboundMessageContext},
    formats::{CredentialContent, CredentialFormat},
    messages::{problem_report::codes, Ack, Attachment, MessageType, PlaintextMessage, ProblemReport},
    protocols::{
        connections::{ConnectionRecord, ConnectionService},
        exchange::{assert_state, AutoAcceptPolicy, Direction, ExchangeEngine, ExchangeRecord},
    },
    storage::Repository,
    Error, Result,
};

/// Issuer and holder side of credential issuance. Never sends anything
/// itself; outbound messages are returned to the caller.
#[derive(Clone)]
pub struct CredentialService {
    engine: ExchangeEngine<CredentialExchangeRecord>,
    context: Arc<AgentContext>,
    connections: Arc<ConnectionService>,
    format: Arc<dyn CredentialFormat>,
}

impl CredentialService {
    pub fn new(
        context: Arc<AgentContext>,
        repository: Arc<dyn Repository<CredentialExchangeRecord>>,
        connections: Arc<ConnectionService>,
        format: Arc<dyn CredentialFormat>,
    ) -> Self {
        CredentialService {
            engine: ExchangeEngine::new(repository, context.events.clone()),
            context,
            connections,
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
        record: &CredentialExchangeRecord,
        message: PlaintextMessage,
    ) -> Result<OutboundMessageContext> {
        let connection = self.ready_connection(&record.connection_id).await?;
        Ok(OutboundMessageContext::for_connection(message, connection))
    }

    fn proposal_message(&self, attributes: &BTreeMap<String, String>, proposal: Attachment) -> Result<PlaintextMessage> {
        PlaintextMessage::new(&ProposeCredential {
            comment: None,
            credential_proposal: Some(CredentialPreview::new(attributes)),
            proposals: vec![proposal],
        })
    }

    fn offer_message(&self, attributes: &BTreeMap<String, String>, offer: Attachment) -> Result<PlaintextMessage> {
        PlaintextMessage::new(&OfferCredential {
            comment: None,
            credential_preview: CredentialPreview::new(attributes),
            offers: vec![offer],
        })
    }

    /// Holder starts the exchange with a proposal.
    pub async fn create_proposal(
        &self,
        connection_id: &str,
        attributes: &BTreeMap<String, String>,
        auto_accept: Option<AutoAcceptPolicy>,
    ) -> Result<(CredentialExchangeRecord, OutboundMessageContext)> {
        let connection = self.ready_connection(connection_id).await?;
        let proposal = self.format.create_proposal(attributes).await?;
        let message = self.proposal_message(attributes, proposal.clone())?;
        let mut record = CredentialExchangeRecord::new(
            CredentialRole::Holder,
            CredentialState::ProposalSent,
            &connection.id,
            message.thread_id(),
        );
        record.proposal = Some(proposal);
        record.auto_accept = auto_accept;
        record.add_message(&message, Direction::Outbound);
        self.engine.create_record(&record).await?;
        Ok((record, OutboundMessageContext::for_connection(message, connection)))
    }

    /// Issuer receives a proposal, either starting an exchange or answering
    /// an offer it sent.
    pub async fn process_proposal(&self, ctx: &InboundMessageContext) -> Result<CredentialExchangeRecord> {
        let proposal: ProposeCredential = ctx.message.decode()?;
        let connection = ctx.assert_ready_connection()?;
        let attachment = proposal.proposals[0].clone();
        self.format.content(&attachment)?;
        match self
            .engine
            .find_by_thread(ctx.message.thread_id(), Some(&connection.id))
            .await?
        {
            Some(mut record) => {
                assert_state(&record, &[CredentialState::OfferSent], CredentialState::ProposalReceived)?;
                record.proposal = Some(attachment);
                record.add_message(&ctx.message, Direction::Inbound);
                self.engine
                    .update_state(&mut record, CredentialState::ProposalReceived)
                    .await?;
                Ok(record)
            }
            None => {
                let mut record = CredentialExchangeRecord::new(
                    CredentialRole::Issuer,
                    CredentialState::ProposalReceived,
                    &connection.id,
                    ctx.message.thread_id(),
                );
                record.proposal = Some(attachment);
                record.add_message(&ctx.message, Direction::Inbound);
                self.engine.create_record(&record).await?;
                Ok(record)
            }
        }
    }

    /// Offers exactly the proposed attributes.
    pub async fn accept_proposal(
        &self,
        record_id: &str,
    ) -> Result<(CredentialExchangeRecord, OutboundMessageContext)> {
        let record = self.engine.get_by_id(record_id).await?;
        let proposal = record
            .proposal
            .as_ref()
            .ok_or_else(|| Error::InvalidMessage(format!("credential exchange {} has no proposal", record.id)))?;
        let attributes = self.format.content(proposal)?.attributes;
        self.offer_in_thread(record, &attributes).await
    }

    /// Answers a proposal with an offer of different attributes.
    pub async fn negotiate_proposal(
        &self,
        record_id: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(CredentialExchangeRecord, OutboundMessageContext)> {
        let record = self.engine.get_by_id(record_id).await?;
        self.offer_in_thread(record, attributes).await
    }

    async fn offer_in_thread(
        &self,
        mut record: CredentialExchangeRecord,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(CredentialExchangeRecord, OutboundMessageContext)> {
        assert_state(&record, &[CredentialState::ProposalReceived], CredentialState::OfferSent)?;
        let offer = self.format.create_offer(attributes).await?;
        let message = self
            .offer_message(attributes, offer.clone())?
            .set_thread_id(&record.thread_id);
        record.offer = Some(offer);
        record.add_message(&message, Direction::Outbound);
        self.engine
            .update_state(&mut record, CredentialState::OfferSent)
            .await?;
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    /// Issuer starts the exchange with an offer.
    pub async fn create_offer(
        &self,
        connection_id: &str,
        attributes: &BTreeMap<String, String>,
        auto_accept: Option<AutoAcceptPolicy>,
    ) -> Result<(CredentialExchangeRecord, OutboundMessageContext)> {
        let connection = self.ready_connection(connection_id).await?;
        let offer = self.format.create_offer(attributes).await?;
        let message = self.offer_message(attributes, offer.clone())?;
        let mut record = CredentialExchangeRecord::new(
            CredentialRole::Issuer,
            CredentialState::OfferSent,
            &connection.id,
            message.thread_id(),
        );
        record.offer = Some(offer);
        record.auto_accept = auto_accept;
        record.add_message(&message, Direction::Outbound);
        self.engine.create_record(&record).await?;
        Ok((record, OutboundMessageContext::for_connection(message, connection)))
    }

    /// Holder receives an offer, either starting an exchange or answering
    /// a proposal it sent.
    pub async fn process_offer(&self, ctx: &InboundMessageContext) -> Result<CredentialExchangeRecord> {
        let offer: OfferCredential = ctx.message.decode()?;
        let connection = ctx.assert_ready_connection()?;
        let attachment = offer.offers[0].clone();
        self.format.content(&attachment)?;
        match self
            .engine
            .find_by_thread(ctx.message.thread_id(), Some(&connection.id))
            .await?
        {
            Some(mut record) => {
                assert_state(&record, &[CredentialState::ProposalSent], CredentialState::OfferReceived)?;
                record.offer = Some(attachment);
                record.add_message(&ctx.message, Direction::Inbound);
                self.engine
                    .update_state(&mut record, CredentialState::OfferReceived)
                    .await?;
                Ok(record)
            }
            None => {
                let mut record = CredentialExchangeRecord::new(
                    CredentialRole::Holder,
                    CredentialState::OfferReceived,
                    &connection.id,
                    ctx.message.thread_id(),
                );
                record.offer = Some(attachment);
                record.add_message(&ctx.message, Direction::Inbound);
                self.engine.create_record(&record).await?;
                Ok(record)
            }
        }
    }

    /// Requests the offered credential.
    pub async fn accept_offer(
        &self,
        record_id: &str,
    ) -> Result<(CredentialExchangeRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(record_id).await?;
        assert_state(&record, &[CredentialState::OfferReceived], CredentialState::RequestSent)?;
        let connection = self.ready_connection(&record.connection_id).await?;
        let offer = record
            .offer
            .as_ref()
            .ok_or_else(|| Error::InvalidMessage(format!("credential exchange {} has no offer", record.id)))?;
        let request = self.format.create_request(offer, &connection.my_did).await?;
        let message = PlaintextMessage::new(&RequestCredential {
            comment: None,
            requests: vec![request.clone()],
        })?
        .set_thread_id(&record.thread_id);
        record.request = Some(request);
        record.add_message(&message, Direction::Outbound);
        self.engine
            .update_state(&mut record, CredentialState::RequestSent)
            .await?;
        Ok((record, OutboundMessageContext::for_connection(message, connection)))
    }

    /// Answers an offer with a counter proposal.
    pub async fn negotiate_offer(
        &self,
        record_id: &str,
        attributes: &BTreeMap<String, String>,
    ) -> Result<(CredentialExchangeRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(record_id).await?;
        assert_state(&record, &[CredentialState::OfferReceived], CredentialState::ProposalSent)?;
        let proposal = self.format.create_proposal(attributes).await?;
        let message = self
            .proposal_message(attributes, proposal.clone())?
            .set_thread_id(&record.thread_id);
        record.proposal = Some(proposal);
        record.add_message(&message, Direction::Outbound);
        self.engine
            .update_state(&mut record, CredentialState::ProposalSent)
            .await?;
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    pub async fn process_request(&self, ctx: &InboundMessageContext) -> Result<CredentialExchangeRecord> {
        let request: RequestCredential = ctx.message.decode()?;
        let connection = ctx.assert_ready_connection()?;
        let mut record = self
            .engine
            .get_by_thread(ctx.message.thread_id(), Some(&connection.id))
            .await?;
        assert_state(&record, &[CredentialState::OfferSent], CredentialState::RequestReceived)?;
        record.request = Some(request.requests[0].clone());
        record.add_message(&ctx.message, Direction::Inbound);
        self.engine
            .update_state(&mut record, CredentialState::RequestReceived)
            .await?;
        Ok(record)
    }

    /// Issues the requested credential.
    pub async fn accept_request(
        &self,
        record_id: &str,
    ) -> Result<(CredentialExchangeRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(record_id).await?;
        assert_state(&record, &[CredentialState::RequestReceived], CredentialState::CredentialIssued)?;
        let (offer, request) = match (&record.offer, &record.request) {
            (Some(offer), Some(request)) => (offer, request),
            _ => {
                return Err(Error::InvalidMessage(format!(
                    "credential exchange {} lacks offer or request",
                    record.id
                )))
            }
        };
        let credential = self.format.create_credential(offer, request).await?;
        let message = PlaintextMessage::new(&IssueCredential {
            comment: None,
            credentials: vec![credential.clone()],
        })?
        .set_thread_id(&record.thread_id);
        record.credential_attributes = Some(self.format.content(&credential)?.attributes);
        record.credential = Some(credential);
        record.add_message(&message, Direction::Outbound);
        self.engine
            .update_state(&mut record, CredentialState::CredentialIssued)
            .await?;
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    /// Verifies and stores the issued credential.
    pub async fn process_credential(&self, ctx: &InboundMessageContext) -> Result<CredentialExchangeRecord> {
        let issued: IssueCredential = ctx.message.decode()?;
        let connection = ctx.assert_ready_connection()?;
        let mut record = self
            .engine
            .get_by_thread(ctx.message.thread_id(), Some(&connection.id))
            .await?;
        assert_state(&record, &[CredentialState::RequestSent], CredentialState::CredentialReceived)?;
        let attachment = issued.credentials[0].clone();
        let stored = self.format.store_credential(&attachment).await?;
        info!("credential exchange {} stored credential {}", record.id, stored.id);
        record.credential_id = Some(stored.id);
        record.credential_attributes = Some(stored.attributes);
        record.credential = Some(attachment);
        record.add_message(&ctx.message, Direction::Inbound);
        self.engine
            .update_state(&mut record, CredentialState::CredentialReceived)
            .await?;
        Ok(record)
    }

    /// Acknowledges the received credential, finishing the exchange.
    pub async fn accept_credential(
        &self,
        record_id: &str,
    ) -> Result<(CredentialExchangeRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(record_id).await?;
        assert_state(&record, &[CredentialState::CredentialReceived], CredentialState::Done)?;
        let message = PlaintextMessage::with_type(MessageType::parse(CREDENTIAL_ACK)?, &Ack::ok())?
            .set_thread_id(&record.thread_id);
        record.add_message(&message, Direction::Outbound);
        self.engine.update_state(&mut record, CredentialState::Done).await?;
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    pub async fn process_ack(&self, ctx: &InboundMessageContext) -> Result<CredentialExchangeRecord> {
        ctx.message.decode::<Ack>()?;
        let connection = ctx.assert_ready_connection()?;
        let record = self
            .engine
            .get_by_thread(ctx.message.thread_id(), Some(&connection.id))
            .await?;
        assert_state(&record, &[CredentialState::CredentialIssued], CredentialState::Done)?;
        self.engine
            .process_ack(&ctx.message, Some(&connection.id), CredentialState::Done)
            .await
    }

    pub async fn process_problem_report(
        &self,
        ctx: &InboundMessageContext,
    ) -> Result<CredentialExchangeRecord> {
        let record = self
            .engine
            .process_problem_report(&ctx.message, ctx.connection_id())
            .await?;
        warn!(
            "credential exchange {} abandoned: {}",
            record.id,
            record.error_message.as_deref().unwrap_or_default()
        );
        Ok(record)
    }

    /// Abandons the exchange and tells the peer with a problem report.
    pub async fn decline(
        &self,
        record_id: &str,
        reason: &str,
    ) -> Result<(CredentialExchangeRecord, OutboundMessageContext)> {
        let mut record = self.engine.get_by_id(record_id).await?;
        let report = ProblemReport::new(codes::ABANDONED, reason)?;
        let message = PlaintextMessage::with_type(MessageType::parse(CREDENTIAL_PROBLEM_REPORT)?, &report)?
            .set_thread_id(&record.thread_id);
        record.add_message(&message, Direction::Outbound);
        self.engine.abandon(&mut record, report.error_message()).await?;
        let outbound = self.outbound(&record, message).await?;
        Ok((record, outbound))
    }

    fn policy(&self, record: &CredentialExchangeRecord) -> AutoAcceptPolicy {
        AutoAcceptPolicy::compose(record.auto_accept, self.context.config.auto_accept_credentials)
    }

    fn content(&self, attachment: Option<&Attachment>) -> Result<Option<CredentialContent>> {
        attachment.map(|a| self.format.content(a)).transpose()
    }

    fn should_accept(
        &self,
        record: &CredentialExchangeRecord,
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

    /// Issuer: the proposal equals the offer it sent before.
    pub fn should_auto_respond_to_proposal(&self, record: &CredentialExchangeRecord) -> Result<bool> {
        self.should_accept(record, record.offer.as_ref(), record.proposal.as_ref())
    }

    /// Holder: the offer equals its proposal.
    pub fn should_auto_respond_to_offer(&self, record: &CredentialExchangeRecord) -> Result<bool> {
        self.should_accept(record, record.proposal.as_ref(), record.offer.as_ref())
    }

    /// Issuer: the request asks for the offered attributes.
    pub fn should_auto_respond_to_request(&self, record: &CredentialExchangeRecord) -> Result<bool> {
        self.should_accept(record, record.offer.as_ref(), record.request.as_ref())
    }

    /// Holder: the credential carries the requested attributes.
    pub fn should_auto_respond_to_credential(&self, record: &CredentialExchangeRecord) -> Result<bool> {
        self.should_accept(record, record.request.as_ref(), record.credential.as_ref())
    }

    pub async fn get_by_id(&self, record_id: &str) -> Result<CredentialExchangeRecord> {
        self.engine.get_by_id(record_id).await
    }

    pub async fn find_by_thread(
        &self,
        thread_id: &str,
        connection_id: Option<&str>,
    ) -> Result<Option<CredentialExchangeRecord>> {
        self.engine.find_by_thread(thread_id, connection_id).await
    }

    pub async fn get_all(&self) -> Result<Vec<CredentialExchangeRecord>> {
        self.engine.repository().get_all().await
    }
}
