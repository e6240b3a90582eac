use std::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{OnceCell, RwLock};

use super::{CredentialContent, CredentialFormat, ProofContent, ProofFormat, StoredCredential};
use crate::{
    messages::Attachment,
    wallet::{Key, KeyType, Wallet},
    Error, Result,
};

const FORMAT: &str = "json-attributes/1.0";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct AttributesPayload {
    format: String,
    attributes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct RequestPayload {
    format: String,
    attributes: BTreeMap<String, String>,
    holder_did: String,
    nonce: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct CredentialPayload {
    format: String,
    attributes: BTreeMap<String, String>,
    holder_did: String,
    issuer_key: String,
    signature: String,
}

/// Fields covered by the issuer signature, in signing order.
#[derive(Serialize)]
struct SignedFields<'a> {
    attributes: &'a BTreeMap<String, String>,
    holder_did: &'a str,
    issuer_key: &'a str,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct ProofRequestPayload {
    format: String,
    requested_attributes: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    nonce: Option<String>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
struct PresentationPayload {
    format: String,
    nonce: Option<String>,
    revealed: BTreeMap<String, String>,
    credential: CredentialPayload,
}

/// Plain attribute credentials signed with an Ed25519 issuer key.
///
/// The same instance serves as issuer, holder and verifier: issued
/// credentials received by a holder are kept in its credential store and
/// presentations are built from there.
pub struct JsonAttributesFormat {
    wallet: Arc<dyn Wallet>,
    issuer_key: OnceCell<Key>,
    credentials: RwLock<Vec<StoredCredential>>,
}

impl JsonAttributesFormat {
    pub fn new(wallet: Arc<dyn Wallet>) -> Self {
        JsonAttributesFormat {
            wallet,
            issuer_key: OnceCell::new(),
            credentials: RwLock::new(vec![]),
        }
    }

    pub async fn issuer_key(&self) -> Result<Key> {
        let key = self
            .issuer_key
            .get_or_try_init(|| async { self.wallet.create_key(KeyType::Ed25519, None).await })
            .await?;
        Ok(key.clone())
    }

    pub async fn credentials(&self) -> Vec<StoredCredential> {
        self.credentials.read().await.clone()
    }

    pub async fn get_credential(&self, id: &str) -> Result<StoredCredential> {
        self.credentials
            .read()
            .await
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::not_found("Credential", format!("id={}", id)))
    }

    async fn verify_credential(&self, credential: &CredentialPayload) -> Result<bool> {
        let issuer_key = Key::from_fingerprint(KeyType::Ed25519, &credential.issuer_key)?;
        let signed = serde_json::to_vec(&SignedFields {
            attributes: &credential.attributes,
            holder_did: &credential.holder_did,
            issuer_key: &credential.issuer_key,
        })?;
        let signature = base64_url::decode(&credential.signature)?;
        self.wallet.verify(&issuer_key, &signed, &signature).await
    }
}

fn attachment(kind: &str, payload: &impl Serialize) -> Result<Attachment> {
    Attachment::from_json(&format!("json-attributes-{}-0", kind), &serde_json::to_value(payload)?)
}

fn parse<T: DeserializeOwned>(attachment: &Attachment) -> Result<T> {
    let value: Value = attachment.json_content()?;
    let format = value.get("format").and_then(Value::as_str).unwrap_or_default();
    if format != FORMAT {
        return Err(Error::InvalidMessage(format!(
            "attachment '{}' has format '{}', expected '{}'",
            attachment.id, format, FORMAT
        )));
    }
    serde_json::from_value(value)
        .map_err(|e| Error::InvalidMessage(format!("attachment '{}': {}", attachment.id, e)))
}

fn nonce() -> String {
    uuid::Uuid::new_v4().to_string()
}

#[async_trait]
impl CredentialFormat for JsonAttributesFormat {
    fn format(&self) -> &'static str {
        FORMAT
    }

    async fn create_proposal(&self, attributes: &BTreeMap<String, String>) -> Result<Attachment> {
        attachment(
            "proposal",
            &AttributesPayload {
                format: FORMAT.into(),
                attributes: attributes.clone(),
                nonce: None,
            },
        )
    }

    async fn create_offer(&self, attributes: &BTreeMap<String, String>) -> Result<Attachment> {
        attachment(
            "offer",
            &AttributesPayload {
                format: FORMAT.into(),
                attributes: attributes.clone(),
                nonce: Some(nonce()),
            },
        )
    }

    async fn create_request(&self, offer: &Attachment, holder_did: &str) -> Result<Attachment> {
        let offer: AttributesPayload = parse(offer)?;
        let nonce = offer
            .nonce
            .ok_or_else(|| Error::InvalidMessage("offer without nonce".into()))?;
        attachment(
            "request",
            &RequestPayload {
                format: FORMAT.into(),
                attributes: offer.attributes,
                holder_did: holder_did.to_string(),
                nonce,
            },
        )
    }

    async fn create_credential(&self, offer: &Attachment, request: &Attachment) -> Result<Attachment> {
        let offer: AttributesPayload = parse(offer)?;
        let request: RequestPayload = parse(request)?;
        if offer.nonce.as_deref() != Some(request.nonce.as_str()) {
            return Err(Error::InvalidMessage("request does not answer the offer".into()));
        }
        let issuer_key = self.issuer_key().await?.fingerprint();
        let signed = serde_json::to_vec(&SignedFields {
            attributes: &offer.attributes,
            holder_did: &request.holder_did,
            issuer_key: &issuer_key,
        })?;
        let signature = self.wallet.sign(&self.issuer_key().await?, &signed).await?;
        attachment(
            "credential",
            &CredentialPayload {
                format: FORMAT.into(),
                attributes: offer.attributes,
                holder_did: request.holder_did,
                issuer_key,
                signature: base64_url::encode(&signature),
            },
        )
    }

    async fn store_credential(&self, credential: &Attachment) -> Result<StoredCredential> {
        let payload: CredentialPayload = parse(credential)?;
        if !self.verify_credential(&payload).await? {
            return Err(Error::InvalidMessage(format!(
                "credential signature of issuer {} does not verify",
                payload.issuer_key
            )));
        }
        let stored = StoredCredential {
            id: uuid::Uuid::new_v4().to_string(),
            format: payload.format,
            attributes: payload.attributes,
            issuer_key: payload.issuer_key,
            holder_did: payload.holder_did,
            signature: payload.signature,
        };
        self.credentials.write().await.push(stored.clone());
        debug!("stored credential {} from issuer {}", stored.id, stored.issuer_key);
        Ok(stored)
    }

    fn content(&self, attachment: &Attachment) -> Result<CredentialContent> {
        #[derive(Deserialize)]
        struct View {
            format: String,
            attributes: BTreeMap<String, String>,
        }
        let view: View = parse(attachment)?;
        Ok(CredentialContent {
            format: view.format,
            attributes: view.attributes,
        })
    }
}

#[async_trait]
impl ProofFormat for JsonAttributesFormat {
    fn format(&self) -> &'static str {
        FORMAT
    }

    async fn create_proposal(&self, attributes: &BTreeSet<String>) -> Result<Attachment> {
        attachment(
            "proof-proposal",
            &ProofRequestPayload {
                format: FORMAT.into(),
                requested_attributes: attributes.clone(),
                nonce: None,
            },
        )
    }

    async fn create_request(&self, attributes: &BTreeSet<String>) -> Result<Attachment> {
        attachment(
            "proof-request",
            &ProofRequestPayload {
                format: FORMAT.into(),
                requested_attributes: attributes.clone(),
                nonce: Some(nonce()),
            },
        )
    }

    async fn create_presentation(&self, request: &Attachment) -> Result<Attachment> {
        let request: ProofRequestPayload = parse(request)?;
        let credentials = self.credentials.read().await;
        let credential = credentials
            .iter()
            .find(|c| {
                request
                    .requested_attributes
                    .iter()
                    .all(|name| c.attributes.contains_key(name))
            })
            .ok_or_else(|| {
                Error::NoMatchingCredential(
                    request
                        .requested_attributes
                        .iter()
                        .cloned()
                        .collect::<Vec<_>>()
                        .join(", "),
                )
            })?;
        let revealed = credential
            .attributes
            .iter()
            .filter(|(name, _)| request.requested_attributes.contains(*name))
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect();
        attachment(
            "presentation",
            &PresentationPayload {
                format: FORMAT.into(),
                nonce: request.nonce,
                revealed,
                credential: CredentialPayload {
                    format: credential.format.clone(),
                    attributes: credential.attributes.clone(),
                    holder_did: credential.holder_did.clone(),
                    issuer_key: credential.issuer_key.clone(),
                    signature: credential.signature.clone(),
                },
            },
        )
    }

    async fn verify_presentation(
        &self,
        request: &Attachment,
        presentation: &Attachment,
    ) -> Result<Option<BTreeMap<String, String>>> {
        let request: ProofRequestPayload = parse(request)?;
        let presentation: PresentationPayload = parse(presentation)?;
        if presentation.nonce != request.nonce {
            warn!("presentation answers another request");
            return Ok(None);
        }
        let complete = request.requested_attributes.iter().all(|name| {
            let revealed = presentation.revealed.get(name);
            revealed.is_some() && revealed == presentation.credential.attributes.get(name)
        });
        if !complete || presentation.revealed.len() != request.requested_attributes.len() {
            warn!("presentation does not reveal the requested attributes");
            return Ok(None);
        }
        if !self.verify_credential(&presentation.credential).await? {
            warn!(
                "credential of issuer {} in presentation does not verify",
                presentation.credential.issuer_key
            );
            return Ok(None);
        }
        Ok(Some(presentation.revealed))
    }

    fn content(&self, attachment: &Attachment) -> Result<ProofContent> {
        let payload: ProofRequestPayload = parse(attachment)?;
        Ok(ProofContent {
            format: payload.format,
            attributes: payload.requested_attributes,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wallet::InMemoryWallet;

    fn attributes() -> BTreeMap<String, String> {
        let mut attributes = BTreeMap::new();
        attributes.insert("name".to_string(), "Alice".to_string());
        attributes.insert("age".to_string(), "30".to_string());
        attributes
    }

    fn names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|n| n.to_string()).collect()
    }

    #[tokio::test]
    async fn issued_credential_is_stored_and_presented() -> Result<()> {
        // Arrange
        let issuer = JsonAttributesFormat::new(Arc::new(InMemoryWallet::default()));
        let holder = JsonAttributesFormat::new(Arc::new(InMemoryWallet::default()));
        let verifier = JsonAttributesFormat::new(Arc::new(InMemoryWallet::default()));
        let offer = issuer.create_offer(&attributes()).await?;
        let request = CredentialFormat::create_request(&holder, &offer, "did:peer:holder").await?;
        let credential = issuer.create_credential(&offer, &request).await?;
        // Act
        let stored = holder.store_credential(&credential).await?;
        let proof_request = ProofFormat::create_request(&verifier, &names(&["name"])).await?;
        let presentation = holder.create_presentation(&proof_request).await?;
        let revealed = verifier
            .verify_presentation(&proof_request, &presentation)
            .await?;
        // Assert
        assert_eq!(stored.attributes, attributes());
        assert_eq!(holder.credentials().await.len(), 1);
        let revealed = revealed.ok_or_else(|| Error::Generic("not verified".into()))?;
        assert_eq!(revealed.get("name").map(String::as_str), Some("Alice"));
        assert_eq!(revealed.len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn missing_attribute_is_no_match() -> Result<()> {
        let holder = JsonAttributesFormat::new(Arc::new(InMemoryWallet::default()));
        let request = ProofFormat::create_request(&holder, &names(&["degree"])).await?;
        assert!(matches!(
            holder.create_presentation(&request).await,
            Err(Error::NoMatchingCredential(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn tampered_credential_is_rejected() -> Result<()> {
        let issuer = JsonAttributesFormat::new(Arc::new(InMemoryWallet::default()));
        let holder = JsonAttributesFormat::new(Arc::new(InMemoryWallet::default()));
        let offer = issuer.create_offer(&attributes()).await?;
        let request = CredentialFormat::create_request(&holder, &offer, "did:peer:holder").await?;
        let credential = issuer.create_credential(&offer, &request).await?;

        let mut payload: CredentialPayload = parse(&credential)?;
        payload.attributes.insert("age".into(), "21".into());
        let forged = attachment("credential", &payload)?;

        assert!(matches!(
            holder.store_credential(&forged).await,
            Err(Error::InvalidMessage(_))
        ));
        assert!(holder.credentials().await.is_empty());
        Ok(())
    }

    #[test]
    fn content_compares_format_and_attributes() -> Result<()> {
        let format = JsonAttributesFormat::new(Arc::new(InMemoryWallet::default()));
        let proposal = attachment(
            "proposal",
            &AttributesPayload {
                format: FORMAT.into(),
                attributes: attributes(),
                nonce: None,
            },
        )?;
        let offer = attachment(
            "offer",
            &AttributesPayload {
                format: FORMAT.into(),
                attributes: attributes(),
                nonce: Some(nonce()),
            },
        )?;
        assert_eq!(
            CredentialFormat::content(&format, &proposal)?,
            CredentialFormat::content(&format, &offer)?
        );
        Ok(())
    }
}
