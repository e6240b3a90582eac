use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::Error;

/// Aries attachment (RFC 0017), used by format plugins to carry
/// format specific payloads.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Attachment {
    #[serde(rename = "@id")]
    pub id: String,
    #[serde(rename = "mime-type", skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lastmod_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub byte_count: Option<usize>,
    pub data: AttachmentData,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct AttachmentData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jws: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub links: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base64: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub json: Option<Value>,
}

impl Attachment {
    /// Base64 encoded JSON attachment.
    pub fn from_json(id: &str, value: &Value) -> Result<Self, Error> {
        let bytes = serde_json::to_vec(value)?;
        Ok(Attachment {
            id: id.to_string(),
            mime_type: Some("application/json".into()),
            description: None,
            filename: None,
            lastmod_time: None,
            byte_count: Some(bytes.len()),
            data: AttachmentData {
                base64: Some(base64_url::encode(&bytes)),
                ..Default::default()
            },
        })
    }

    /// Decodes the attachment content as JSON, whether inline or base64 encoded.
    pub fn json_content(&self) -> Result<Value, Error> {
        if let Some(json) = &self.data.json {
            return Ok(json.clone());
        }
        match &self.data.base64 {
            Some(encoded) => Ok(serde_json::from_slice(&base64_url::decode(encoded)?)?),
            None => Err(Error::InvalidMessage(format!(
                "attachment '{}' carries no inline data",
                self.id
            ))),
        }
    }
}
