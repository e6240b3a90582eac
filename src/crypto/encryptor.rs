use super::*;
use std::convert::TryFrom;

/// Tag length shared by both AEAD constructions.
pub const TAG_LEN: usize = 16;

/// Plugable closure generator enum, which creates instance of crypto function
///     based on selected algorythm types.
/// # Attention:
/// Immutable by design and should be instance per invocation to make sure no
///     sensitive data is been stored in memory longer than necessary.
/// Underlying algorithms are implemented by Rust-crypto crate family.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum CryptoAlgorithm {
    XC20P,
    A256GCM,
}

impl CryptoAlgorithm {
    /// Length of the nonce (`iv`) the algorithm expects.
    pub fn nonce_len(&self) -> usize {
        match self {
            CryptoAlgorithm::XC20P => 24,
            CryptoAlgorithm::A256GCM => 12,
        }
    }

    /// `enc` value of the protected header.
    pub fn enc(&self) -> &'static str {
        match self {
            CryptoAlgorithm::XC20P => "XC20P",
            CryptoAlgorithm::A256GCM => "A256GCM",
        }
    }

    /// `alg` value of the protected header for the key wrapping that goes with
    /// this content encryption.
    ///
    /// # Parameters
    ///
    /// * `authenticated` - `true` for sender authenticated (ECDH-1PU) envelopes
    pub fn key_wrap_alg(&self, authenticated: bool) -> &'static str {
        match (self, authenticated) {
            (CryptoAlgorithm::XC20P, true) => "ECDH-1PU+XC20PKW",
            (CryptoAlgorithm::XC20P, false) => "ECDH-ES+XC20PKW",
            (CryptoAlgorithm::A256GCM, true) => "ECDH-1PU+A256KW",
            (CryptoAlgorithm::A256GCM, false) => "ECDH-ES+A256KW",
        }
    }

    /// Random nonce of the right size.
    pub fn generate_nonce(&self) -> Vec<u8> {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        (0..self.nonce_len()).map(|_| rng.gen::<u8>()).collect()
    }
}

impl Cypher for CryptoAlgorithm {
    /// Generates + invokes crypto of `SymmetricCypherMethod` which perfoms encryption.
    /// Algorithm selected is based on struct's `CryptoAlgorithm` property.
    fn encryptor(&self) -> SymmetricCypherMethod {
        match self {
            CryptoAlgorithm::XC20P => Box::new(
                |nonce: &[u8], key: &[u8], message: &[u8], aad: &[u8]| -> Result<Vec<u8>, Error> {
                    check_sizes(nonce, 24, key)?;
                    use chacha20poly1305::{
                        aead::{Aead, NewAead, Payload},
                        Key,
                        XChaCha20Poly1305,
                        XNonce,
                    };
                    let nonce = XNonce::from_slice(nonce);
                    let aead = XChaCha20Poly1305::new(Key::from_slice(key));
                    aead.encrypt(nonce, Payload { msg: message, aad })
                        .map_err(|e| Error::Encryption(e.to_string()))
                },
            ),
            CryptoAlgorithm::A256GCM => Box::new(
                |nonce: &[u8], key: &[u8], message: &[u8], aad: &[u8]| -> Result<Vec<u8>, Error> {
                    check_sizes(nonce, 12, key)?;
                    use aes_gcm::{
                        aead::{generic_array::GenericArray, Aead, NewAead, Payload},
                        Aes256Gcm,
                    };
                    let nonce = GenericArray::from_slice(nonce);
                    let aead = Aes256Gcm::new(GenericArray::from_slice(key));
                    aead.encrypt(nonce, Payload { msg: message, aad })
                        .map_err(|e| Error::Encryption(e.to_string()))
                },
            ),
        }
    }

    /// Generates + invokes crypto of `SymmetricCypherMethod` which perfoms decryption.
    /// Algorithm selected is based on struct's `CryptoAlgorithm` property.
    fn decryptor(&self) -> SymmetricCypherMethod {
        match self {
            CryptoAlgorithm::XC20P => Box::new(
                |nonce: &[u8], key: &[u8], message: &[u8], aad: &[u8]| -> Result<Vec<u8>, Error> {
                    check_sizes(nonce, 24, key)?;
                    use chacha20poly1305::{
                        aead::{Aead, NewAead, Payload},
                        Key,
                        XChaCha20Poly1305,
                        XNonce,
                    };
                    let aead = XChaCha20Poly1305::new(Key::from_slice(key));
                    let nonce = XNonce::from_slice(nonce);
                    aead.decrypt(nonce, Payload { msg: message, aad })
                        .map_err(|e| Error::Decryption(e.to_string()))
                },
            ),
            CryptoAlgorithm::A256GCM => Box::new(
                |nonce: &[u8], key: &[u8], message: &[u8], aad: &[u8]| -> Result<Vec<u8>, Error> {
                    check_sizes(nonce, 12, key)?;
                    use aes_gcm::{
                        aead::{generic_array::GenericArray, Aead, NewAead, Payload},
                        Aes256Gcm,
                    };
                    let nonce = GenericArray::from_slice(nonce);
                    let aead = Aes256Gcm::new(GenericArray::from_slice(key));
                    aead.decrypt(nonce, Payload { msg: message, aad })
                        .map_err(|e| Error::Decryption(e.to_string()))
                },
            ),
        }
    }
}

impl TryFrom<&str> for CryptoAlgorithm {
    type Error = Error;
    fn try_from(enc: &str) -> Result<Self, Error> {
        match enc {
            "XC20P" => Ok(Self::XC20P),
            "A256GCM" => Ok(Self::A256GCM),
            other => Err(Error::Decryption(format!(
                "unsupported content encryption '{}'",
                other
            ))),
        }
    }
}

// inner helper function
fn check_sizes(nonce: &[u8], expected_nonce_len: usize, key: &[u8]) -> Result<(), Error> {
    if nonce.len() != expected_nonce_len || key.len() != 32 {
        return Err(Error::Generic(format!(
            "bad key material: nonce {} bytes (expected {}), key {} bytes",
            nonce.len(),
            expected_nonce_len,
            key.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod batteries_tests {
    use super::*;

    fn round_trip(alg: CryptoAlgorithm) -> Result<(), Error> {
        // Arrange
        let payload = br#"{"test":"message's body - can be anything..."}"#;
        let key = b"super duper key 32 bytes long!!!";
        let nonce = alg.generate_nonce();
        // Act
        let sealed = alg.encryptor()(&nonce, key, payload, b"aad")?;
        let opened = alg.decryptor()(&nonce, key, &sealed, b"aad")?;
        // Assert
        assert_eq!(sealed.len(), payload.len() + TAG_LEN);
        assert_eq!(&opened[..], &payload[..]);
        Ok(())
    }

    #[test]
    fn xc20p_test() -> Result<(), Error> {
        round_trip(CryptoAlgorithm::XC20P)
    }

    #[test]
    fn a256gcm_test() -> Result<(), Error> {
        round_trip(CryptoAlgorithm::A256GCM)
    }

    #[test]
    fn wrong_aad_fails_closed() {
        let alg = CryptoAlgorithm::XC20P;
        let key = b"super duper key 32 bytes long!!!";
        let nonce = alg.generate_nonce();
        let sealed = alg.encryptor()(&nonce, key, b"payload", b"aad").unwrap();
        let opened = alg.decryptor()(&nonce, key, &sealed, b"other aad");
        assert!(matches!(opened, Err(Error::Decryption(_))));
    }

    #[test]
    fn short_nonce_is_rejected() {
        let key = b"super duper key 32 bytes long!!!";
        let result = CryptoAlgorithm::A256GCM.encryptor()(&[0; 4], key, b"payload", b"");
        assert!(result.is_err());
    }
}
