//! Collection of utilities for cryptography related components.
pub mod encryptor;
pub mod kdf;
pub mod signer;

pub use encryptor::CryptoAlgorithm;
pub use signer::SignatureAlgorithm;

pub use crate::Error;

/// Return `Fn` signature definition for symmetric cryptography method.
/// Arguments sequence: Nonce, Key, Message, Additional authenticated data.
pub type SymmetricCypherMethod =
    Box<dyn Fn(&[u8], &[u8], &[u8], &[u8]) -> Result<Vec<u8>, Error> + Send + Sync>;

/// Return `Fn` signature definition for signature signing method.
/// .0 == `key: &[u8]`; .1 == `message`;
pub type SigningMethod = Box<dyn Fn(&[u8], &[u8]) -> Result<Vec<u8>, Error> + Send + Sync>;

/// Return `Fn` signature definition for signature validating method.
/// .0 == `key: &[u8]`; .1 == `message`; .2 == `signature`;
pub type ValidationMethod =
    Box<dyn Fn(&[u8], &[u8], &[u8]) -> Result<bool, Error> + Send + Sync>;

/// Trait must be implemented for pluggable cryptography.
/// Implemented by `CryptoAlgorithm`.
pub trait Cypher {
    fn encryptor(&self) -> SymmetricCypherMethod;
    fn decryptor(&self) -> SymmetricCypherMethod;
}

/// Trait must be implemented for pluggable signatures.
/// Implemented by `SignatureAlgorithm`.
pub trait Signer {
    fn signer(&self) -> SigningMethod;
    fn validator(&self) -> ValidationMethod;
}
