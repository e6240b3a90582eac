use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    messages::{Attachment, Shape},
    Error, Result,
};

pub const CREDENTIAL_ACK: &str = "https://didcomm.org/issue-credential/1.0/ack";
pub const CREDENTIAL_PROBLEM_REPORT: &str = "https://didcomm.org/issue-credential/1.0/problem-report";

const PREVIEW_TYPE: &str = "https://didcomm.org/issue-credential/1.0/credential-preview";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialAttribute {
    pub name: String,
    pub value: String,
    #[serde(rename = "mime-type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

/// Human readable attributes of the credential being negotiated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct CredentialPreview {
    #[serde(rename = "@type")]
    pub preview_type: String,
    pub attributes: Vec<CredentialAttribute>,
}

impl CredentialPreview {
    pub fn new(attributes: &BTreeMap<String, String>) -> Self {
        CredentialPreview {
            preview_type: PREVIEW_TYPE.into(),
            attributes: attributes
                .iter()
                .map(|(name, value)| CredentialAttribute {
                    name: name.clone(),
                    value: value.clone(),
                    mime_type: None,
                })
                .collect(),
        }
    }

    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.attributes
            .iter()
            .map(|a| (a.name.clone(), a.value.clone()))
            .collect()
    }
}

fn require_attachments(attachments: &[Attachment], what: &str) -> Result<()> {
    if attachments.is_empty() {
        return Err(Error::InvalidMessage(format!("{} without attachment", what)));
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProposeCredential {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential_proposal: Option<CredentialPreview>,
    #[serde(rename = "proposals~attach")]
    pub proposals: Vec<Attachment>,
}

impl Shape for ProposeCredential {
    const TYPE: &'static str = "https://didcomm.org/issue-credential/1.0/propose-credential";

    fn validate(&self) -> Result<()> {
        require_attachments(&self.proposals, "credential proposal")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct OfferCredential {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub credential_preview: CredentialPreview,
    #[serde(rename = "offers~attach")]
    pub offers: Vec<Attachment>,
}

impl Shape for OfferCredential {
    const TYPE: &'static str = "https://didcomm.org/issue-credential/1.0/offer-credential";

    fn validate(&self) -> Result<()> {
        require_attachments(&self.offers, "credential offer")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestCredential {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(rename = "requests~attach")]
    pub requests: Vec<Attachment>,
}

impl Shape for RequestCredential {
    const TYPE: &'static str = "https://didcomm.org/issue-credential/1.0/request-credential";

    fn validate(&self) -> Result<()> {
        require_attachments(&self.requests, "credential request")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct IssueCredential {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(rename = "credentials~attach")]
    pub credentials: Vec<Attachment>,
}

impl Shape for IssueCredential {
    const TYPE: &'static str = "https://didcomm.org/issue-credential/1.0/issue-credential";

    fn validate(&self) -> Result<()> {
        require_attachments(&self.credentials, "issued credential")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::PlaintextMessage;

    #[test]
    fn offer_wire_names() -> Result<()> {
        // Arrange
        let mut attributes = BTreeMap::new();
        attributes.insert("name".to_string(), "Alice".to_string());
        let offer = OfferCredential {
            comment: None,
            credential_preview: CredentialPreview::new(&attributes),
            offers: vec![Attachment::from_json("offer-0", &serde_json::json!({}))?],
        };
        // Act
        let message = PlaintextMessage::new(&offer)?;
        let value = serde_json::to_value(&message)?;
        // Assert
        assert!(value["offers~attach"].is_array());
        assert_eq!(value["credential_preview"]["attributes"][0]["name"], "Alice");
        assert_eq!(message.decode::<OfferCredential>()?.credential_preview.to_map(), attributes);
        Ok(())
    }

    #[test]
    fn request_needs_attachment() -> Result<()> {
        let message = PlaintextMessage::new(&RequestCredential {
            comment: None,
            requests: vec![],
        })?;
        assert!(matches!(
            message.decode::<RequestCredential>(),
            Err(Error::InvalidMessage(_))
        ));
        Ok(())
    }
}
