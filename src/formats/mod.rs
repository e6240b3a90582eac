//! Format plugins: produce format specific attachments for the credential
//! and proof protocols, and read them back into comparable content.
mod json_attributes;

pub use json_attributes::JsonAttributesFormat;

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{messages::Attachment, Result};

/// Negotiable fields of a credential proposal, offer, request or credential.
/// Two contents are equal when format and every attribute name and value are.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct CredentialContent {
    pub format: String,
    pub attributes: BTreeMap<String, String>,
}

/// Negotiable fields of a proof proposal or request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ProofContent {
    pub format: String,
    pub attributes: BTreeSet<String>,
}

/// Credential kept by a holder.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StoredCredential {
    pub id: String,
    pub format: String,
    pub attributes: BTreeMap<String, String>,
    pub issuer_key: String,
    pub holder_did: String,
    /// Base64url issuer signature.
    pub signature: String,
}

#[async_trait]
pub trait CredentialFormat: Send + Sync {
    /// Identifier compared as part of the negotiable content.
    fn format(&self) -> &'static str;

    async fn create_proposal(&self, attributes: &BTreeMap<String, String>) -> Result<Attachment>;

    async fn create_offer(&self, attributes: &BTreeMap<String, String>) -> Result<Attachment>;

    async fn create_request(&self, offer: &Attachment, holder_did: &str) -> Result<Attachment>;

    async fn create_credential(&self, offer: &Attachment, request: &Attachment) -> Result<Attachment>;

    /// Verifies an issued credential and keeps it for later presentations.
    async fn store_credential(&self, credential: &Attachment) -> Result<StoredCredential>;

    fn content(&self, attachment: &Attachment) -> Result<CredentialContent>;
}

#[async_trait]
pub trait ProofFormat: Send + Sync {
    fn format(&self) -> &'static str;

    async fn create_proposal(&self, attributes: &BTreeSet<String>) -> Result<Attachment>;

    async fn create_request(&self, attributes: &BTreeSet<String>) -> Result<Attachment>;

    /// Presentation answering `request` from stored credentials. Fails with
    /// [`crate::Error::NoMatchingCredential`] when no credential satisfies it.
    async fn create_presentation(&self, request: &Attachment) -> Result<Attachment>;

    /// Checks `presentation` against `request` and returns the revealed
    /// attributes. An invalid presentation yields `Ok(None)`.
    async fn verify_presentation(
        &self,
        request: &Attachment,
        presentation: &Attachment,
    ) -> Result<Option<BTreeMap<String, String>>>;

    fn content(&self, attachment: &Attachment) -> Result<ProofContent>;
}
