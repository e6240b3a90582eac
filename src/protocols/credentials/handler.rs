use std::sync::Arc;

use async_trait::async_trait;

use super::{
    CredentialService, IssueCredential, OfferCredential, ProposeCredential, RequestCredential,
    CREDENTIAL_ACK, CREDENTIAL_PROBLEM_REPORT,
};
use crate::{
    agent::{message_types, Handler, InboundMessageContext, OutboundMessageContext},
    messages::{MessageType, Shape},
    Error, Result,
};

/// Drives credential exchanges from inbound messages and answers them when
/// the auto accept policy allows.
pub struct CredentialHandler {
    credentials: Arc<CredentialService>,
}

impl CredentialHandler {
    pub fn new(credentials: Arc<CredentialService>) -> Self {
        CredentialHandler { credentials }
    }
}

/// Answers on the session the triggering message came in on.
pub(crate) fn with_session<R>(
    ctx: &InboundMessageContext,
    (_, mut outbound): (R, OutboundMessageContext),
) -> Option<OutboundMessageContext> {
    outbound.inbound_session_id = ctx.session_id.clone();
    Some(outbound)
}

#[async_trait]
impl Handler for CredentialHandler {
    fn supported_message_types(&self) -> Vec<MessageType> {
        message_types(&[
            ProposeCredential::TYPE,
            OfferCredential::TYPE,
            RequestCredential::TYPE,
            IssueCredential::TYPE,
            CREDENTIAL_ACK,
            CREDENTIAL_PROBLEM_REPORT,
        ])
    }

    async fn handle(&self, ctx: &InboundMessageContext) -> Result<Option<OutboundMessageContext>> {
        let credentials = &self.credentials;
        match ctx.message.message_type.name() {
            "propose-credential" => {
                let record = credentials.process_proposal(ctx).await?;
                if !credentials.should_auto_respond_to_proposal(&record)? {
                    return Ok(None);
                }
                Ok(with_session(ctx, credentials.accept_proposal(&record.id).await?))
            }
            "offer-credential" => {
                let record = credentials.process_offer(ctx).await?;
                if !credentials.should_auto_respond_to_offer(&record)? {
                    return Ok(None);
                }
                Ok(with_session(ctx, credentials.accept_offer(&record.id).await?))
            }
            "request-credential" => {
                let record = credentials.process_request(ctx).await?;
                if !credentials.should_auto_respond_to_request(&record)? {
                    return Ok(None);
                }
                Ok(with_session(ctx, credentials.accept_request(&record.id).await?))
            }
            "issue-credential" => {
                let record = credentials.process_credential(ctx).await?;
                if !credentials.should_auto_respond_to_credential(&record)? {
                    return Ok(None);
                }
                Ok(with_session(ctx, credentials.accept_credential(&record.id).await?))
            }
            "ack" => {
                credentials.process_ack(ctx).await?;
                Ok(None)
            }
            "problem-report" => {
                credentials.process_problem_report(ctx).await?;
                Ok(None)
            }
            _ => Err(Error::NoHandler(ctx.message.message_type.uri())),
        }
    }
}
