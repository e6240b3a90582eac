use serde::{Deserialize, Serialize};

use crate::Error;

/// Media type of the envelope, carried as `typ` in the protected header.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum EnvelopeType {
    #[serde(rename = "application/didcomm-encrypted+json")]
    DidCommJwe,
    #[serde(rename = "application/didcomm-plain+json")]
    DidCommRaw,
}

/// Protected (authenticated, base64url encoded) header of the envelope.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ProtectedHeader {
    pub typ: EnvelopeType,
    pub enc: String,
    pub alg: String,
    /// Sender key id, present only for authcrypt envelopes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skid: Option<String>,
}

/// Ephemeral public key of a recipient entry.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Jwk {
    pub kty: String,
    pub crv: String,
    pub x: String,
}

impl Jwk {
    /// OKP/X25519 key from raw public bytes.
    pub fn x25519(public: &[u8]) -> Self {
        Jwk {
            kty: "OKP".to_string(),
            crv: "X25519".to_string(),
            x: base64_url::encode(public),
        }
    }

    pub fn public_bytes(&self) -> Result<Vec<u8>, Error> {
        if self.kty != "OKP" || self.crv != "X25519" {
            return Err(Error::Decryption(format!(
                "unsupported ephemeral key {}/{}",
                self.kty, self.crv
            )));
        }
        Ok(base64_url::decode(&self.x)?)
    }
}

/// Per-recipient header: which key the content key was wrapped for and how.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RecipientHeader {
    pub kid: String,
    pub epk: Jwk,
    pub iv: String,
    pub tag: String,
}

/// Per-recipient encrypted content encryption key.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Recipient {
    pub encrypted_key: String,
    pub header: RecipientHeader,
}

/// JWE JSON serialization of an encrypted DIDComm message.
/// Field names are the wire format and must not change.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Jwe {
    pub protected: String,
    pub recipients: Vec<Recipient>,
    pub iv: String,
    pub ciphertext: String,
    pub tag: String,
}

impl Jwe {
    /// Constructor, which should be used after message is encrypted.
    pub fn new(
        protected: &ProtectedHeader,
        recipients: Vec<Recipient>,
        iv: impl AsRef<[u8]>,
        ciphertext: impl AsRef<[u8]>,
        tag: impl AsRef<[u8]>,
    ) -> Result<Self, Error> {
        Ok(Jwe {
            protected: base64_url::encode(&serde_json::to_vec(protected)?),
            recipients,
            iv: base64_url::encode(iv.as_ref()),
            ciphertext: base64_url::encode(ciphertext.as_ref()),
            tag: base64_url::encode(tag.as_ref()),
        })
    }

    /// Decodes the protected header.
    pub fn protected_header(&self) -> Result<ProtectedHeader, Error> {
        let decoded = base64_url::decode(&self.protected)?;
        Ok(serde_json::from_slice(&decoded)?)
    }

    /// Getter for ciphered payload of JWE.
    pub fn payload(&self) -> Result<Vec<u8>, Error> {
        Ok(base64_url::decode(&self.ciphertext)?)
    }

    /// `iv` getter
    pub fn get_iv(&self) -> Result<Vec<u8>, Error> {
        Ok(base64_url::decode(&self.iv)?)
    }

    /// `tag` getter
    pub fn get_tag(&self) -> Result<Vec<u8>, Error> {
        Ok(base64_url::decode(&self.tag)?)
    }

    /// Key ids this envelope was encrypted for.
    pub fn recipient_kids(&self) -> Vec<&str> {
        self.recipients.iter().map(|r| r.header.kid.as_str()).collect()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, Error> {
        Ok(serde_json::from_slice(bytes)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Cheap check whether a JSON value looks like an encrypted envelope.
    pub fn is_envelope(value: &serde_json::Value) -> bool {
        value.get("protected").is_some()
            && value.get("ciphertext").is_some()
            && value.get("recipients").is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protected_header_round_trips_through_base64() -> Result<(), Error> {
        // Arrange
        let header = ProtectedHeader {
            typ: EnvelopeType::DidCommJwe,
            enc: "XC20P".into(),
            alg: "ECDH-ES+XC20PKW".into(),
            skid: None,
        };
        // Act
        let jwe = Jwe::new(&header, vec![], [1; 24], b"cipher", [2; 16])?;
        let raw = serde_json::to_value(&jwe)?;
        // Assert
        assert_eq!(jwe.protected_header()?, header);
        assert!(Jwe::is_envelope(&raw));
        assert!(raw["protected"].is_string());
        assert!(raw.get("skid").is_none());
        Ok(())
    }

    #[test]
    fn typ_uses_didcomm_media_type() -> Result<(), Error> {
        let value = serde_json::to_value(EnvelopeType::DidCommJwe)?;
        assert_eq!(value, "application/didcomm-encrypted+json");
        Ok(())
    }
}
