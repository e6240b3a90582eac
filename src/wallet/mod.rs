//! Wallet capability.
//!
//! The agent core never touches secret key material: key creation, signatures
//! and the envelope primitives are delegated to a [`Wallet`]. [`InMemoryWallet`]
//! is the implementation shipped with the crate.
mod in_memory;
mod key;

pub use in_memory::InMemoryWallet;
pub use key::{Key, KeyType};

use async_trait::async_trait;

use crate::{envelope::Jwe, Result};

/// Output of [`Wallet::unpack_message`].
#[derive(Debug, Clone, PartialEq)]
pub struct UnpackedMessage {
    pub plaintext: Vec<u8>,
    /// `None` for anoncrypt envelopes.
    pub sender_key: Option<Key>,
    pub recipient_key: Key,
}

#[async_trait]
pub trait Wallet: Send + Sync {
    /// Creates a key and stores its secret. Same seed yields the same key.
    async fn create_key(&self, key_type: KeyType, seed: Option<&[u8]>) -> Result<Key>;

    async fn sign(&self, key: &Key, data: &[u8]) -> Result<Vec<u8>>;

    async fn verify(&self, key: &Key, data: &[u8], signature: &[u8]) -> Result<bool>;

    /// Encrypts `payload` for every key in `recipient_keys`. Supplying `sender_key`
    /// makes the envelope sender authenticated (authcrypt), anonymous otherwise.
    async fn pack_message(
        &self,
        payload: &[u8],
        recipient_keys: &[Key],
        sender_key: Option<&Key>,
    ) -> Result<Jwe>;

    /// Decrypts an envelope addressed to one of this wallet's keys. Fails with
    /// [`crate::Error::Decryption`] on any integrity or key failure.
    async fn unpack_message(&self, envelope: &Jwe) -> Result<UnpackedMessage>;
}
