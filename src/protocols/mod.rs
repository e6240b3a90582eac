//! DIDComm protocols. Each exchange protocol instantiates the
//! [`exchange`] discipline with its own states and record type.
pub mod connections;
pub mod credentials;
pub mod discovery;
pub mod exchange;
pub mod oob;
pub mod proofs;
pub mod routing;
pub mod trust_ping;
