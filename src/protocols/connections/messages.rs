use serde::{Deserialize, Serialize};

use crate::{
    messages::{PlaintextMessage, ServiceDecorator, Shape},
    wallet::Key,
    Error, Result,
};

/// Out of band invitation to connect.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Invitation {
    pub label: String,
    pub recipient_keys: Vec<String>,
    pub service_endpoint: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routing_keys: Vec<String>,
}

impl Shape for Invitation {
    const TYPE: &'static str = "https://didcomm.org/connections/1.0/invitation";

    fn validate(&self) -> Result<()> {
        if self.recipient_keys.is_empty() {
            return Err(Error::InvalidMessage("invitation without recipient keys".into()));
        }
        if self.service_endpoint.is_empty() {
            return Err(Error::InvalidMessage("invitation without service endpoint".into()));
        }
        Ok(())
    }
}

impl Invitation {
    pub fn service(&self) -> ServiceDecorator {
        ServiceDecorator {
            recipient_keys: self.recipient_keys.clone(),
            routing_keys: self.routing_keys.clone(),
            service_endpoint: self.service_endpoint.clone(),
        }
    }

    /// Invitation URL with the message in the `c_i` query parameter.
    pub fn to_url(message: &PlaintextMessage, domain: &str) -> Result<String> {
        Ok(format!(
            "{}?c_i={}",
            domain,
            base64_url::encode(&message.to_bytes()?)
        ))
    }

    /// Invitation message carried in the `c_i` (or `oob`) parameter of `url`.
    pub fn from_url(url: &str) -> Result<PlaintextMessage> {
        let query = url
            .split_once('?')
            .map(|(_, query)| query)
            .ok_or_else(|| Error::InvalidMessage(format!("no query in invitation url {}", url)))?;
        let encoded = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(name, _)| *name == "c_i" || *name == "oob")
            .map(|(_, value)| value)
            .ok_or_else(|| Error::InvalidMessage(format!("no invitation in url {}", url)))?;
        let message = PlaintextMessage::from_bytes(&base64_url::decode(encoded)?)?;
        message.decode::<Invitation>()?;
        Ok(message)
    }
}

/// Verification key entry of a [`DidDoc`].
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DidDocKey {
    pub id: String,
    #[serde(rename = "type")]
    pub key_type: String,
    pub controller: String,
    pub public_key_base58: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DidDocService {
    pub id: String,
    #[serde(rename = "type")]
    pub service_type: String,
    #[serde(default)]
    pub priority: u32,
    #[serde(flatten)]
    pub service: ServiceDecorator,
}

/// DID document exchanged in connection requests and responses.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DidDoc {
    #[serde(rename = "@context")]
    pub context: String,
    pub id: String,
    #[serde(rename = "publicKey", default)]
    pub public_key: Vec<DidDocKey>,
    #[serde(default)]
    pub service: Vec<DidDocService>,
}

impl DidDoc {
    pub fn new(key: &Key, service: &ServiceDecorator) -> Self {
        let did = key.did();
        DidDoc {
            context: "https://w3id.org/did/v1".into(),
            public_key: vec![DidDocKey {
                id: format!("{}#1", did),
                key_type: "X25519KeyAgreementKey2019".into(),
                controller: did.clone(),
                public_key_base58: key.fingerprint(),
            }],
            service: vec![DidDocService {
                id: format!("{};indy", did),
                service_type: "IndyAgent".into(),
                priority: 0,
                service: service.clone(),
            }],
            id: did,
        }
    }

    /// Service with the lowest priority value.
    pub fn agent_service(&self) -> Result<&ServiceDecorator> {
        self.service
            .iter()
            .min_by_key(|s| s.priority)
            .map(|s| &s.service)
            .ok_or_else(|| Error::InvalidMessage(format!("DID document {} has no service", self.id)))
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Connection {
    #[serde(rename = "DID")]
    pub did: String,
    #[serde(rename = "DIDDoc")]
    pub did_doc: DidDoc,
}

impl Connection {
    fn validate(&self) -> Result<()> {
        let service = self.did_doc.agent_service()?;
        if service.recipient_keys.is_empty() {
            return Err(Error::InvalidMessage(format!(
                "service of {} has no recipient keys",
                self.did
            )));
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionRequest {
    pub label: String,
    pub connection: Connection,
}

impl Shape for ConnectionRequest {
    const TYPE: &'static str = "https://didcomm.org/connections/1.0/request";

    fn validate(&self) -> Result<()> {
        self.connection.validate()
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ConnectionResponse {
    pub connection: Connection,
}

impl Shape for ConnectionResponse {
    const TYPE: &'static str = "https://didcomm.org/connections/1.0/response";

    fn validate(&self) -> Result<()> {
        self.connection.validate()
    }
}
