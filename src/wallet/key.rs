use base58::{FromBase58, ToBase58};
use serde::{Deserialize, Serialize};

use crate::Error;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyType {
    /// Key agreement key, used for envelopes.
    X25519,
    /// Signing key.
    Ed25519,
}

/// Public half of a key held by a wallet. The secret never leaves the wallet.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct Key {
    pub key_type: KeyType,
    #[serde(with = "crate::messages::serialization::base58_buffer")]
    public_key: Vec<u8>,
}

impl Key {
    pub fn new(key_type: KeyType, public_key: impl Into<Vec<u8>>) -> Self {
        Key {
            key_type,
            public_key: public_key.into(),
        }
    }

    /// Parses a base58 key reference, as found in `kid`/`skid` headers and
    /// `recipientKeys` lists.
    pub fn from_fingerprint(key_type: KeyType, fingerprint: &str) -> Result<Self, Error> {
        let public_key = fingerprint
            .from_base58()
            .map_err(|e| Error::InvalidMessage(format!("bad key '{}': {:?}", fingerprint, e)))?;
        if public_key.len() != 32 {
            return Err(Error::InvalidMessage(format!(
                "key '{}' is {} bytes long, expected 32",
                fingerprint,
                public_key.len()
            )));
        }
        Ok(Key::new(key_type, public_key))
    }

    pub fn public_key(&self) -> &[u8] {
        &self.public_key
    }

    /// Base58 encoding of the public key.
    pub fn fingerprint(&self) -> String {
        self.public_key.to_base58()
    }

    /// `did:key`-like identifier used for peer DIDs of this agent.
    pub fn did(&self) -> String {
        format!("did:peer:{}", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_round_trips() -> Result<(), Error> {
        let key = Key::new(KeyType::X25519, vec![3u8; 32]);
        let parsed = Key::from_fingerprint(KeyType::X25519, &key.fingerprint())?;
        assert_eq!(key, parsed);
        Ok(())
    }

    #[test]
    fn short_fingerprint_is_rejected() {
        let short = vec![1u8; 8].to_base58();
        assert!(Key::from_fingerprint(KeyType::X25519, &short).is_err());
    }

    #[test]
    fn serializes_public_key_as_base58() -> Result<(), Error> {
        let key = Key::new(KeyType::Ed25519, vec![5u8; 32]);
        let json = serde_json::to_value(&key)?;
        assert_eq!(json["public_key"], key.fingerprint());
        assert_eq!(json["key_type"], "Ed25519");
        Ok(())
    }
}
