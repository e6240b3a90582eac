//! Agent runtime: context, dispatcher, sender and the composition root that
//! wires every protocol into one [`Agent`].
mod context;
mod events;
mod handler;
mod receiver;
mod registry;
mod sender;
mod transport;

pub use context::{
    AgentContext, ConnectionContext, InboundDelivery, InboundMessageContext,
    OutboundMessageContext, OutboundService,
};
pub use events::{AgentEvent, EventBus};
pub use handler::{message_types, Handler};
pub use receiver::MessageReceiver;
pub use registry::{filter_protocols_by_family, HandlerRegistry};
pub use sender::MessageSender;
pub use transport::{
    endpoint_scheme, DuplexSession, OutboundTransport, SessionEntry, TransportService,
    TransportSession, DID_COMM_TRANSPORT_QUEUE,
};

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    time::Duration,
};

use tokio::sync::{broadcast, mpsc};

use crate::{
    config::AgentConfig,
    formats::{CredentialFormat, JsonAttributesFormat, ProofFormat},
    messages::{PlaintextMessage, Protocol},
    protocols::{
        connections::{ConnectionHandler, ConnectionRecord, ConnectionService, Invitation},
        credentials::{CredentialExchangeRecord, CredentialHandler, CredentialService},
        discovery::{create_query, DiscoveryHandler},
        exchange::AutoAcceptPolicy,
        oob::{message_from_url, OutOfBandRecord, OutOfBandService},
        proofs::{ProofExchangeRecord, ProofHandler, ProofService},
        routing::{
            ForwardHandler, MediationRecipientService, MediationRecord, MediatorHandler,
            MediatorPickupStrategy, MediatorService, PickupCoordinator, PickupStatus,
            RecipientHandler,
        },
        trust_ping::TrustPingHandler,
    },
    storage::InMemoryRepository,
    wallet::{InMemoryWallet, Wallet},
    Error, Result,
};

/// Collects the collaborators of an [`Agent`].
pub struct AgentBuilder {
    config: AgentConfig,
    wallet: Option<Arc<dyn Wallet>>,
    transports: Vec<Arc<dyn OutboundTransport>>,
    credential_format: Option<Arc<dyn CredentialFormat>>,
    proof_format: Option<Arc<dyn ProofFormat>>,
}

impl AgentBuilder {
    pub fn new(config: AgentConfig) -> Self {
        AgentBuilder {
            config,
            wallet: None,
            transports: vec![],
            credential_format: None,
            proof_format: None,
        }
    }

    pub fn wallet(mut self, wallet: Arc<dyn Wallet>) -> Self {
        self.wallet = Some(wallet);
        self
    }

    pub fn transport(mut self, transport: Arc<dyn OutboundTransport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn credential_format(mut self, format: Arc<dyn CredentialFormat>) -> Self {
        self.credential_format = Some(format);
        self
    }

    pub fn proof_format(mut self, format: Arc<dyn ProofFormat>) -> Self {
        self.proof_format = Some(format);
        self
    }

    /// Builds the agent and starts its inbound dispatcher. Must be called
    /// within a Tokio runtime.
    ///
    /// Fails with [`Error::Config`] for an invalid configuration or when a
    /// required protocol has no handler.
    pub fn build(self) -> Result<Agent> {
        self.config.validate()?;
        let wallet = self
            .wallet
            .unwrap_or_else(|| Arc::new(InMemoryWallet::default()));
        // Credentials stored by the holder are presented from the same store.
        let json_format = Arc::new(JsonAttributesFormat::new(wallet.clone()));
        let credential_format = self
            .credential_format
            .unwrap_or_else(|| json_format.clone());
        let proof_format = self.proof_format.unwrap_or(json_format);

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let context = Arc::new(AgentContext::new(self.config, wallet, inbound_tx));
        let sender = MessageSender::new(context.clone(), self.transports);

        let connections = Arc::new(ConnectionService::new(
            context.clone(),
            Arc::new(InMemoryRepository::new()),
        ));
        let credentials = Arc::new(CredentialService::new(
            context.clone(),
            Arc::new(InMemoryRepository::new()),
            connections.clone(),
            credential_format,
        ));
        let mediation_repository = Arc::new(InMemoryRepository::<MediationRecord>::new());
        let mediator = Arc::new(MediatorService::new(
            context.clone(),
            mediation_repository.clone(),
            connections.clone(),
            sender.clone(),
        ));
        let recipient = Arc::new(MediationRecipientService::new(
            context.clone(),
            mediation_repository,
            connections.clone(),
            sender.clone(),
        ));
        let out_of_band = Arc::new(OutOfBandService::new(
            Arc::new(InMemoryRepository::new()),
            context.events.clone(),
        ));
        let proofs = Arc::new(ProofService::new(
            context.clone(),
            Arc::new(InMemoryRepository::new()),
            connections.clone(),
            recipient.clone(),
            out_of_band.clone(),
            proof_format,
        ));
        let pickup = PickupCoordinator::new(context.clone(), sender.clone(), connections.clone());

        let mut registry = HandlerRegistry::new();
        registry.register_handler(Arc::new(ConnectionHandler::new(connections.clone())));
        registry.register_handler(Arc::new(TrustPingHandler::new(connections.clone())));
        registry.register_handler(Arc::new(CredentialHandler::new(credentials.clone())));
        registry.register_handler(Arc::new(ProofHandler::new(proofs.clone())));
        registry.register_handler(Arc::new(MediatorHandler::new(mediator.clone())));
        registry.register_handler(Arc::new(ForwardHandler::new(mediator.clone())));
        registry.register_handler(Arc::new(RecipientHandler::new(recipient.clone())));
        let discovery = DiscoveryHandler::new(registry.supported_protocols(), context.events.clone());
        registry.register_handler(Arc::new(discovery));

        for family in &context.config.required_protocols {
            if registry
                .filter_supported_protocols_by_family(&[family.clone()])
                .is_empty()
            {
                return Err(Error::Config(format!(
                    "no handler registered for required protocol {}",
                    family
                )));
            }
        }
        let registry = Arc::new(registry);
        let receiver = MessageReceiver::new(
            context.clone(),
            registry.clone(),
            sender.clone(),
            connections.clone(),
        );
        spawn_inbound_dispatcher(context.clone(), receiver.clone(), inbound_rx);
        info!(
            "agent '{}' started with {} protocols",
            context.config.label,
            registry.supported_protocols().len()
        );

        Ok(Agent {
            context,
            registry,
            receiver,
            sender,
            connections,
            credentials,
            proofs,
            out_of_band,
            mediator,
            recipient,
            pickup,
        })
    }
}

/// Feeds messages handed to [`AgentContext::deliver_inbound`] into the
/// receiver until shutdown.
fn spawn_inbound_dispatcher(
    context: Arc<AgentContext>,
    receiver: MessageReceiver,
    mut inbound: mpsc::UnboundedReceiver<InboundDelivery>,
) {
    let shutdown = context.shutdown.clone();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                delivery = inbound.recv() => match delivery {
                    Some(delivery) => receiver.receive(delivery.payload, None),
                    None => break,
                },
            }
        }
        debug!("inbound dispatcher of '{}' stopped", context.config.label);
    });
}

/// One agent: its services, its dispatcher and the API driving them.
///
/// Every `create_*`/`accept_*` operation of the services returns the message
/// to send; the methods here send it as well.
pub struct Agent {
    context: Arc<AgentContext>,
    registry: Arc<HandlerRegistry>,
    receiver: MessageReceiver,
    sender: MessageSender,
    connections: Arc<ConnectionService>,
    credentials: Arc<CredentialService>,
    proofs: Arc<ProofService>,
    out_of_band: Arc<OutOfBandService>,
    mediator: Arc<MediatorService>,
    recipient: Arc<MediationRecipientService>,
    pickup: PickupCoordinator,
}

impl Agent {
    pub fn builder(config: AgentConfig) -> AgentBuilder {
        AgentBuilder::new(config)
    }

    pub fn context(&self) -> &Arc<AgentContext> {
        &self.context
    }

    pub fn config(&self) -> &AgentConfig {
        &self.context.config
    }

    pub fn connections(&self) -> &ConnectionService {
        &self.connections
    }

    pub fn credentials(&self) -> &CredentialService {
        &self.credentials
    }

    pub fn proofs(&self) -> &ProofService {
        &self.proofs
    }

    pub fn out_of_band(&self) -> &OutOfBandService {
        &self.out_of_band
    }

    pub fn mediator(&self) -> &MediatorService {
        &self.mediator
    }

    pub fn mediation_recipient(&self) -> &MediationRecipientService {
        &self.recipient
    }

    pub fn pickup(&self) -> &PickupCoordinator {
        &self.pickup
    }

    pub fn supported_protocols(&self) -> Vec<Protocol> {
        self.registry.supported_protocols()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.context.events.subscribe()
    }

    /// Hands an inbound message to the dispatcher and returns at once.
    pub fn receive(&self, payload: Vec<u8>, session: Option<Arc<dyn TransportSession>>) {
        self.receiver.receive(payload, session)
    }

    /// Processes an inbound message to completion.
    pub async fn receive_message(
        &self,
        payload: &[u8],
        session: Option<Arc<dyn TransportSession>>,
    ) -> Result<()> {
        self.receiver.receive_message(payload, session).await
    }

    /// Forgets an inbound session once its transport has closed it. Request
    /// and response transports call this as soon as the response is written.
    pub async fn session_closed(&self, session_id: &str) {
        if self
            .context
            .transport_service
            .remove_session(session_id)
            .await
            .is_some()
        {
            debug!("session {} closed by its transport", session_id);
        }
    }

    pub async fn send_message(&self, outbound: OutboundMessageContext) -> Result<()> {
        self.sender.send(outbound).await
    }

    /// Sends the message of a service operation and returns its record.
    pub async fn send<R>(&self, (record, outbound): (R, OutboundMessageContext)) -> Result<R> {
        self.sender.send(outbound).await?;
        Ok(record)
    }

    /// Invitation reachable through the default mediator, if there is one.
    pub async fn create_invitation(
        &self,
        auto_accept: Option<bool>,
    ) -> Result<(ConnectionRecord, PlaintextMessage)> {
        let routing = self.recipient.get_routing(true).await?;
        self.connections.create_invitation(routing, auto_accept).await
    }

    /// Stores the invitation and, when auto accepting, answers it with a
    /// connection request.
    pub async fn receive_invitation(
        &self,
        invitation: &PlaintextMessage,
        auto_accept: Option<bool>,
    ) -> Result<ConnectionRecord> {
        let routing = self.recipient.get_routing(true).await?;
        let record = self
            .connections
            .process_invitation(invitation, routing, auto_accept)
            .await?;
        if !self.connections.should_auto_accept(&record) {
            return Ok(record);
        }
        self.accept_invitation(&record.id).await
    }

    pub async fn receive_invitation_url(
        &self,
        url: &str,
        auto_accept: Option<bool>,
    ) -> Result<ConnectionRecord> {
        self.receive_invitation(&Invitation::from_url(url)?, auto_accept)
            .await
    }

    pub async fn accept_invitation(&self, connection_id: &str) -> Result<ConnectionRecord> {
        self.send(self.connections.create_request(connection_id).await?)
            .await
    }

    pub async fn accept_request(&self, connection_id: &str) -> Result<ConnectionRecord> {
        self.send(self.connections.create_response(connection_id).await?)
            .await
    }

    /// Trust ping, completing a responded connection.
    pub async fn send_ping(&self, connection_id: &str, response_requested: bool) -> Result<ConnectionRecord> {
        self.send(
            self.connections
                .create_trust_ping(connection_id, response_requested)
                .await?,
        )
        .await
    }

    pub async fn offer_credential(
        &self,
        connection_id: &str,
        attributes: &BTreeMap<String, String>,
        auto_accept: Option<AutoAcceptPolicy>,
    ) -> Result<CredentialExchangeRecord> {
        self.send(
            self.credentials
                .create_offer(connection_id, attributes, auto_accept)
                .await?,
        )
        .await
    }

    pub async fn propose_credential(
        &self,
        connection_id: &str,
        attributes: &BTreeMap<String, String>,
        auto_accept: Option<AutoAcceptPolicy>,
    ) -> Result<CredentialExchangeRecord> {
        self.send(
            self.credentials
                .create_proposal(connection_id, attributes, auto_accept)
                .await?,
        )
        .await
    }

    pub async fn request_proof(
        &self,
        connection_id: &str,
        attributes: &BTreeSet<String>,
        auto_accept: Option<AutoAcceptPolicy>,
    ) -> Result<ProofExchangeRecord> {
        self.send(
            self.proofs
                .create_request(connection_id, attributes, auto_accept)
                .await?,
        )
        .await
    }

    /// Creates a proof request for a prover without a connection. Hand
    /// `message` of the returned out-of-band record to the prover, e.g. with
    /// [`OutOfBandRecord::to_url`].
    pub async fn create_connectionless_proof_request(
        &self,
        attributes: &BTreeSet<String>,
        auto_accept: Option<AutoAcceptPolicy>,
    ) -> Result<(ProofExchangeRecord, OutOfBandRecord)> {
        let (record, message) = self
            .proofs
            .create_connectionless_request(attributes, auto_accept)
            .await?;
        let out_of_band = self
            .out_of_band
            .create_connectionless(&message, Some(&record.id))
            .await?;
        Ok((record, out_of_band))
    }

    /// Processes a message handed over out of band. The returned record is
    /// `done` when the message was already answered.
    pub async fn receive_out_of_band_message(&self, message: &PlaintextMessage) -> Result<OutOfBandRecord> {
        let record = self.out_of_band.receive_connectionless(message).await?;
        self.receiver
            .receive_message(&message.to_bytes()?, None)
            .await?;
        self.out_of_band.get_by_id(&record.id).await
    }

    pub async fn receive_out_of_band_url(&self, url: &str) -> Result<OutOfBandRecord> {
        self.receive_out_of_band_message(&message_from_url(url)?)
            .await
    }

    pub async fn propose_proof(
        &self,
        connection_id: &str,
        attributes: &BTreeSet<String>,
        auto_accept: Option<AutoAcceptPolicy>,
    ) -> Result<ProofExchangeRecord> {
        self.send(
            self.proofs
                .create_proposal(connection_id, attributes, auto_accept)
                .await?,
        )
        .await
    }

    /// Requests mediation over `connection_id` and waits for the answer.
    pub async fn request_mediation(
        &self,
        connection_id: &str,
        timeout: Duration,
    ) -> Result<MediationRecord> {
        self.recipient
            .request_and_await_grant(connection_id, timeout)
            .await
    }

    /// Starts picking up messages from the mediator of `mediation_id`, with
    /// the strategy of the record unless `strategy` is given.
    pub async fn initiate_pickup(
        &self,
        mediation_id: &str,
        strategy: Option<MediatorPickupStrategy>,
    ) -> Result<PickupStatus> {
        let mediation = self.recipient.get_by_id(mediation_id).await?;
        let strategy = strategy
            .or(mediation.pickup_strategy)
            .unwrap_or(self.context.config.mediator_pickup_strategy);
        self.pickup.initiate(&mediation, strategy).await
    }

    /// Asks the peer of `connection_id` which protocols matching `query`
    /// it supports.
    pub async fn query_features(
        &self,
        connection_id: &str,
        query: &str,
        timeout: Duration,
    ) -> Result<Vec<String>> {
        let connection = self.connections.get_by_id(connection_id).await?;
        connection.assert_ready()?;
        let receiver = self.subscribe();
        let message = create_query(query)?;
        let thread_id = message.thread_id().to_string();
        self.sender
            .send(OutboundMessageContext::for_connection(message, connection))
            .await?;
        EventBus::wait_for(receiver, timeout, "feature disclosure", |event| match event {
            AgentEvent::FeaturesDisclosed {
                thread_id: answered,
                protocols,
                ..
            } if *answered == thread_id => Some(protocols.clone()),
            _ => None,
        })
        .await
    }

    /// Stops background loops. Dispatches in flight run to completion.
    pub fn shutdown(&self) {
        info!("agent '{}' shutting down", self.context.config.label);
        self.context.shutdown.cancel();
    }
}
