use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::{
    messages::{Attachment, Shape},
    Error, Result,
};

pub const PRESENTATION_ACK: &str = "https://didcomm.org/present-proof/1.0/ack";
pub const PRESENTATION_PROBLEM_REPORT: &str = "https://didcomm.org/present-proof/1.0/problem-report";

const PREVIEW_TYPE: &str = "https://didcomm.org/present-proof/1.0/presentation-preview";

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PresentationAttribute {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct PresentationPreview {
    #[serde(rename = "@type")]
    pub preview_type: String,
    pub attributes: Vec<PresentationAttribute>,
}

impl PresentationPreview {
    pub fn new(attributes: &BTreeSet<String>) -> Self {
        PresentationPreview {
            preview_type: PREVIEW_TYPE.into(),
            attributes: attributes
                .iter()
                .map(|name| PresentationAttribute { name: name.clone() })
                .collect(),
        }
    }
}

fn require_attachments(attachments: &[Attachment], what: &str) -> Result<()> {
    if attachments.is_empty() {
        return Err(Error::InvalidMessage(format!("{} without attachment", what)));
    }
    Ok(())
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProposePresentation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    pub presentation_proposal: PresentationPreview,
    #[serde(rename = "proposals~attach")]
    pub proposals: Vec<Attachment>,
}

impl Shape for ProposePresentation {
    const TYPE: &'static str = "https://didcomm.org/present-proof/1.0/propose-presentation";

    fn validate(&self) -> Result<()> {
        require_attachments(&self.proposals, "presentation proposal")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestPresentation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(rename = "request_presentations~attach")]
    pub request_presentations: Vec<Attachment>,
}

impl Shape for RequestPresentation {
    const TYPE: &'static str = "https://didcomm.org/present-proof/1.0/request-presentation";

    fn validate(&self) -> Result<()> {
        require_attachments(&self.request_presentations, "presentation request")
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Presentation {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(rename = "presentations~attach")]
    pub presentations: Vec<Attachment>,
}

impl Shape for Presentation {
    const TYPE: &'static str = "https://didcomm.org/present-proof/1.0/presentation";

    fn validate(&self) -> Result<()> {
        require_attachments(&self.presentations, "presentation")
    }
}
