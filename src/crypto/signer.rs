use ed25519_dalek::{Keypair, PublicKey, SecretKey, Signature, Signer as _, Verifier as _};

use crate::crypto::{SigningMethod, ValidationMethod};
use crate::Error;

use core::convert::TryFrom;

/// Signature related batteries for DIDComm.
///
/// Only `EdDSA` over Ed25519 is needed by the agent: it signs credentials
/// issued by the built-in attribute format and connection keys.
#[derive(Copy, Clone, Debug)]
pub enum SignatureAlgorithm {
    EdDsa,
}

impl super::Signer for SignatureAlgorithm {
    /// Builds signer closure, which performs signing.
    /// Key is the 32 byte Ed25519 secret.
    ///
    /// # Examples
    /// ```
    /// # fn main() {
    /// use didcomm_agent::crypto::{SignatureAlgorithm, Signer};
    /// let signer = SignatureAlgorithm::EdDsa.signer();
    /// # }
    ///```
    ///
    fn signer(&self) -> SigningMethod {
        match self {
            SignatureAlgorithm::EdDsa => {
                Box::new(|key: &[u8], message: &[u8]| -> Result<Vec<u8>, Error> {
                    let secret = SecretKey::from_bytes(key)?;
                    let public = PublicKey::from(&secret);
                    let keypair = Keypair { secret, public };
                    let signature: Signature = keypair.sign(message);
                    Ok(signature.to_bytes().to_vec())
                })
            }
        }
    }

    /// Builds validator closure, which performs signature validation.
    ///
    /// # Examples
    /// ```
    /// # fn main() {
    /// use didcomm_agent::crypto::{SignatureAlgorithm, Signer};
    /// let validator = SignatureAlgorithm::EdDsa.validator();
    /// # }
    /// ```
    ///
    fn validator(&self) -> ValidationMethod {
        match self {
            SignatureAlgorithm::EdDsa => Box::new(
                |key: &[u8], message: &[u8], signature: &[u8]| -> Result<bool, Error> {
                    let public = PublicKey::from_bytes(key)?;
                    let signature = Signature::try_from(signature)?;
                    Ok(public.verify(message, &signature).is_ok())
                },
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::Signer;

    #[test]
    fn eddsa_test() {
        // Arrange
        let keypair = Keypair::generate(&mut rand_core::OsRng);
        let m = b"this is the message we're signing in this test...";
        // Act
        let signer = SignatureAlgorithm::EdDsa.signer();
        let validator = SignatureAlgorithm::EdDsa.validator();
        let signature = signer(keypair.secret.as_bytes(), m);
        let validation = validator(keypair.public.as_bytes(), m, &signature.unwrap());
        // Assert
        assert!(&validation.is_ok());
        assert!(validation.unwrap());
    }

    #[test]
    fn eddsa_rejects_other_message() {
        let keypair = Keypair::generate(&mut rand_core::OsRng);
        let signature = SignatureAlgorithm::EdDsa.signer()(keypair.secret.as_bytes(), b"one").unwrap();
        let valid = SignatureAlgorithm::EdDsa.validator()(keypair.public.as_bytes(), b"two", &signature);
        assert!(!valid.unwrap());
    }
}
