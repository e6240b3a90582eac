use std::{collections::HashMap, convert::TryFrom, sync::RwLock};

use async_trait::async_trait;
use rand::RngCore;
use sha2::{Digest, Sha256};

use super::{Key, KeyType, UnpackedMessage, Wallet};
use crate::{
    crypto::{
        encryptor::TAG_LEN,
        kdf::{diffie_hellman, generate_kek},
        CryptoAlgorithm, Cypher, SignatureAlgorithm, Signer,
    },
    envelope::{EnvelopeType, Jwe, Jwk, ProtectedHeader, Recipient, RecipientHeader},
    Error, Result,
};

/// Wallet keeping secrets in process memory.
///
/// Secrets are indexed by the fingerprint of their public key.
pub struct InMemoryWallet {
    secrets: RwLock<HashMap<String, (KeyType, [u8; 32])>>,
    content_encryption: CryptoAlgorithm,
}

impl Default for InMemoryWallet {
    fn default() -> Self {
        InMemoryWallet::new(CryptoAlgorithm::XC20P)
    }
}

impl InMemoryWallet {
    /// # Parameters
    ///
    /// * `content_encryption` - AEAD used for payloads and for key wrapping of
    /// envelopes produced by this wallet. Incoming envelopes may use either.
    pub fn new(content_encryption: CryptoAlgorithm) -> Self {
        InMemoryWallet {
            secrets: RwLock::new(HashMap::new()),
            content_encryption,
        }
    }

    pub fn has_key(&self, key: &Key) -> bool {
        self.secret_for(key).is_ok()
    }

    fn secret_for(&self, key: &Key) -> Result<[u8; 32]> {
        let secrets = self
            .secrets
            .read()
            .map_err(|e| Error::Generic(e.to_string()))?;
        match secrets.get(&key.fingerprint()) {
            Some((key_type, secret)) if *key_type == key.key_type => Ok(*secret),
            _ => Err(Error::KeyNotFound(key.fingerprint())),
        }
    }

    fn open(&self, envelope: &Jwe) -> Result<UnpackedMessage> {
        let header = envelope.protected_header()?;
        if header.typ != EnvelopeType::DidCommJwe {
            return Err(Error::Decryption("not an encrypted envelope".into()));
        }
        let alg = CryptoAlgorithm::try_from(header.enc.as_str())?;
        let authenticated = header.skid.is_some();
        if header.alg != alg.key_wrap_alg(authenticated) {
            return Err(Error::Decryption(format!(
                "key wrapping '{}' does not match enc '{}'",
                header.alg, header.enc
            )));
        }

        let (recipient, recipient_key, recipient_secret) = envelope
            .recipients
            .iter()
            .find_map(|r| {
                let key = Key::from_fingerprint(KeyType::X25519, &r.header.kid).ok()?;
                let secret = self.secret_for(&key).ok()?;
                Some((r, key, secret))
            })
            .ok_or_else(|| {
                Error::Decryption("envelope is not addressed to any key of this wallet".into())
            })?;
        let sender_key = match &header.skid {
            Some(skid) => Some(Key::from_fingerprint(KeyType::X25519, skid)?),
            None => None,
        };
        trace!(
            "unpacking envelope for {} from {:?}",
            recipient.header.kid,
            header.skid
        );

        let ze = diffie_hellman(&recipient_secret, &recipient.header.epk.public_bytes()?)?;
        let zs = match &sender_key {
            Some(sender) => Some(diffie_hellman(&recipient_secret, sender.public_key())?),
            None => None,
        };
        let kek = generate_kek(
            &ze,
            zs.as_ref().map(|z| &z[..]),
            &header.alg,
            header.skid.as_deref(),
            &recipient.header.kid,
        )?;

        let mut wrapped = base64_url::decode(&recipient.encrypted_key)?;
        wrapped.extend(base64_url::decode(&recipient.header.tag)?);
        let cek = alg.decryptor()(&base64_url::decode(&recipient.header.iv)?, &kek, &wrapped, &[])?;

        let mut sealed = envelope.payload()?;
        sealed.extend(envelope.get_tag()?);
        let plaintext = alg.decryptor()(
            &envelope.get_iv()?,
            &cek,
            &sealed,
            envelope.protected.as_bytes(),
        )?;

        Ok(UnpackedMessage {
            plaintext,
            sender_key,
            recipient_key,
        })
    }
}

#[async_trait]
impl Wallet for InMemoryWallet {
    async fn create_key(&self, key_type: KeyType, seed: Option<&[u8]>) -> Result<Key> {
        let secret = secret_from_seed(seed);
        let public = match key_type {
            KeyType::X25519 => {
                let secret = x25519_dalek::StaticSecret::from(secret);
                x25519_dalek::PublicKey::from(&secret).as_bytes().to_vec()
            }
            KeyType::Ed25519 => {
                let secret = ed25519_dalek::SecretKey::from_bytes(&secret)?;
                ed25519_dalek::PublicKey::from(&secret).as_bytes().to_vec()
            }
        };
        let key = Key::new(key_type, public);
        debug!("created {:?} key {}", key_type, key.fingerprint());
        self.secrets
            .write()
            .map_err(|e| Error::Generic(e.to_string()))?
            .insert(key.fingerprint(), (key_type, secret));
        Ok(key)
    }

    async fn sign(&self, key: &Key, data: &[u8]) -> Result<Vec<u8>> {
        if key.key_type != KeyType::Ed25519 {
            return Err(Error::Generic(format!(
                "key {} can not sign",
                key.fingerprint()
            )));
        }
        let secret = self.secret_for(key)?;
        SignatureAlgorithm::EdDsa.signer()(&secret, data)
    }

    async fn verify(&self, key: &Key, data: &[u8], signature: &[u8]) -> Result<bool> {
        if key.key_type != KeyType::Ed25519 {
            return Ok(false);
        }
        SignatureAlgorithm::EdDsa.validator()(key.public_key(), data, signature)
    }

    async fn pack_message(
        &self,
        payload: &[u8],
        recipient_keys: &[Key],
        sender_key: Option<&Key>,
    ) -> Result<Jwe> {
        if recipient_keys.is_empty() {
            return Err(Error::Encryption("no recipient keys".into()));
        }
        let alg = self.content_encryption;
        let sender_secret = match sender_key {
            Some(sender) => Some(self.secret_for(sender)?),
            None => None,
        };
        let header = ProtectedHeader {
            typ: EnvelopeType::DidCommJwe,
            enc: alg.enc().to_string(),
            alg: alg.key_wrap_alg(sender_key.is_some()).to_string(),
            skid: sender_key.map(|k| k.fingerprint()),
        };
        let protected = base64_url::encode(&serde_json::to_vec(&header)?);

        let mut cek = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut cek);
        let iv = alg.generate_nonce();
        let mut ciphertext = alg.encryptor()(&iv, &cek, payload, protected.as_bytes())?;
        let tag = split_tag(&mut ciphertext)?;

        let mut recipients = Vec::with_capacity(recipient_keys.len());
        for recipient_key in recipient_keys {
            if recipient_key.key_type != KeyType::X25519 {
                return Err(Error::Encryption(format!(
                    "recipient key {} is not a key agreement key",
                    recipient_key.fingerprint()
                )));
            }
            let kid = recipient_key.fingerprint();
            let ephemeral = x25519_dalek::StaticSecret::new(rand_core::OsRng);
            let epk = x25519_dalek::PublicKey::from(&ephemeral);
            let ze = diffie_hellman(&ephemeral.to_bytes(), recipient_key.public_key())?;
            let zs = match &sender_secret {
                Some(secret) => Some(diffie_hellman(secret, recipient_key.public_key())?),
                None => None,
            };
            let kek = generate_kek(
                &ze,
                zs.as_ref().map(|z| &z[..]),
                &header.alg,
                header.skid.as_deref(),
                &kid,
            )?;
            let wrap_iv = alg.generate_nonce();
            let mut encrypted_key = alg.encryptor()(&wrap_iv, &kek, &cek, &[])?;
            let wrap_tag = split_tag(&mut encrypted_key)?;
            recipients.push(Recipient {
                encrypted_key: base64_url::encode(&encrypted_key),
                header: RecipientHeader {
                    kid,
                    epk: Jwk::x25519(epk.as_bytes()),
                    iv: base64_url::encode(&wrap_iv),
                    tag: base64_url::encode(&wrap_tag),
                },
            });
        }

        Ok(Jwe {
            protected,
            recipients,
            iv: base64_url::encode(&iv),
            ciphertext: base64_url::encode(&ciphertext),
            tag: base64_url::encode(&tag),
        })
    }

    async fn unpack_message(&self, envelope: &Jwe) -> Result<UnpackedMessage> {
        self.open(envelope).map_err(|e| match e {
            Error::Decryption(_) => e,
            other => Error::Decryption(other.to_string()),
        })
    }
}

// 32 byte seeds are used as is, anything else is hashed down to 32 bytes.
fn secret_from_seed(seed: Option<&[u8]>) -> [u8; 32] {
    let mut secret = [0u8; 32];
    match seed {
        Some(seed) if seed.len() == 32 => secret.copy_from_slice(seed),
        Some(seed) => secret.copy_from_slice(Sha256::digest(seed).as_slice()),
        None => rand::thread_rng().fill_bytes(&mut secret),
    }
    secret
}

// AEAD output is `ciphertext || tag`; detaches the tag.
fn split_tag(sealed: &mut Vec<u8>) -> Result<Vec<u8>> {
    if sealed.len() < TAG_LEN {
        return Err(Error::Encryption("sealed output shorter than tag".into()));
    }
    Ok(sealed.split_off(sealed.len() - TAG_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn authcrypt_identifies_sender() -> Result<()> {
        // Arrange
        let alice = InMemoryWallet::default();
        let bob = InMemoryWallet::default();
        let alice_key = alice.create_key(KeyType::X25519, None).await?;
        let bob_key = bob.create_key(KeyType::X25519, None).await?;
        // Act
        let jwe = alice
            .pack_message(b"hello bob", &[bob_key.clone()], Some(&alice_key))
            .await?;
        let unpacked = bob.unpack_message(&jwe).await?;
        // Assert
        assert_eq!(unpacked.plaintext, b"hello bob");
        assert_eq!(unpacked.sender_key, Some(alice_key));
        assert_eq!(unpacked.recipient_key, bob_key);
        Ok(())
    }

    #[tokio::test]
    async fn anoncrypt_has_no_sender() -> Result<()> {
        let alice = InMemoryWallet::new(CryptoAlgorithm::A256GCM);
        let bob = InMemoryWallet::default();
        let bob_key = bob.create_key(KeyType::X25519, None).await?;
        let jwe = alice.pack_message(b"hi", &[bob_key], None).await?;
        assert_eq!(jwe.protected_header()?.alg, "ECDH-ES+A256KW");
        let unpacked = bob.unpack_message(&jwe).await?;
        assert_eq!(unpacked.sender_key, None);
        assert_eq!(unpacked.plaintext, b"hi");
        Ok(())
    }

    #[tokio::test]
    async fn every_recipient_can_open() -> Result<()> {
        let sender = InMemoryWallet::default();
        let first = InMemoryWallet::default();
        let second = InMemoryWallet::default();
        let keys = vec![
            first.create_key(KeyType::X25519, None).await?,
            second.create_key(KeyType::X25519, None).await?,
        ];
        let jwe = sender.pack_message(b"both", &keys, None).await?;
        assert_eq!(first.unpack_message(&jwe).await?.plaintext, b"both");
        assert_eq!(second.unpack_message(&jwe).await?.plaintext, b"both");
        Ok(())
    }

    #[tokio::test]
    async fn stranger_gets_decryption_error() -> Result<()> {
        let alice = InMemoryWallet::default();
        let bob = InMemoryWallet::default();
        let eve = InMemoryWallet::default();
        let bob_key = bob.create_key(KeyType::X25519, None).await?;
        eve.create_key(KeyType::X25519, None).await?;
        let jwe = alice.pack_message(b"secret", &[bob_key], None).await?;
        assert!(matches!(
            eve.unpack_message(&jwe).await,
            Err(Error::Decryption(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn same_seed_same_key() -> Result<()> {
        let wallet = InMemoryWallet::default();
        let a = wallet.create_key(KeyType::Ed25519, Some(b"seed")).await?;
        let b = wallet.create_key(KeyType::Ed25519, Some(b"seed")).await?;
        assert_eq!(a, b);
        Ok(())
    }

    #[tokio::test]
    async fn signs_and_verifies() -> Result<()> {
        let wallet = InMemoryWallet::default();
        let key = wallet.create_key(KeyType::Ed25519, None).await?;
        let signature = wallet.sign(&key, b"data").await?;
        assert!(wallet.verify(&key, b"data", &signature).await?);
        assert!(!wallet.verify(&key, b"other", &signature).await?);
        Ok(())
    }
}
