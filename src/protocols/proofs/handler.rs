use std::sync::Arc;

use async_trait::async_trait;

use super::{
    Presentation, ProofService, ProposePresentation, RequestPresentation, PRESENTATION_ACK,
    PRESENTATION_PROBLEM_REPORT,
};
use crate::{
    agent::{message_types, Handler, InboundMessageContext, OutboundMessageContext},
    messages::{problem_report::codes, MessageType, Shape},
    protocols::credentials::with_session,
    Error, Result,
};

/// Drives proof exchanges from inbound messages. A prover without a
/// matching credential abandons the exchange and reports `no-match`.
pub struct ProofHandler {
    proofs: Arc<ProofService>,
}

impl ProofHandler {
    pub fn new(proofs: Arc<ProofService>) -> Self {
        ProofHandler { proofs }
    }
}

#[async_trait]
impl Handler for ProofHandler {
    fn supported_message_types(&self) -> Vec<MessageType> {
        message_types(&[
            ProposePresentation::TYPE,
            RequestPresentation::TYPE,
            Presentation::TYPE,
            PRESENTATION_ACK,
            PRESENTATION_PROBLEM_REPORT,
        ])
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>> {
        let proofs = &self.proofs;
        match ctx.message.message_type.name() {
            "propose-presentation" => {
                let record = proofs.process_proposal(ctx).await?;
                if !proofs.should_auto_respond_to_proposal(&record)? {
                    return Ok(None);
                }
                Ok(with_session(ctx, proofs.accept_proposal(&record.id).await?))
            }
            "request-presentation" => {
                let record = proofs.process_request(ctx).await?;
                if !proofs.should_auto_respond_to_request(&record)? {
                    return Ok(None);
                }
                match proofs.accept_request(&record.id).await {
                    Ok(accepted) => Ok(with_session(ctx, accepted)),
                    Err(Error::NoMatchingCredential(requested)) => {
                        let reason = format!("no credential with attributes {}", requested);
                        let declined = proofs
                            .decline_request(&record.id, codes::NO_MATCH, &reason)
                            .await?;
                        Ok(with_session(ctx, declined))
                    }
                    Err(e) => Err(e),
                }
            }
            "presentation" => {
                let record = proofs.process_presentation(ctx).await?;
                if !proofs.should_auto_respond_to_presentation(&record) {
                    return Ok(None);
                }
                Ok(with_session(ctx, proofs.accept_presentation(&record.id).await?))
            }
            "ack" => {
                proofs.process_ack(ctx).await?;
                Ok(None)
            }
            "problem-report" => {
                proofs.process_problem_report(ctx).await?;
                Ok(None)
            }
            _ => Err(Error::NoHandler(ctx.message.message_type.uri())),
        }
    }
}
