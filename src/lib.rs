//! DIDComm v1 agent runtime: encrypted envelopes, pairwise connections,
//! credential issuance, proof presentation, mediation and feature discovery.
//!
//! An [`agent::Agent`] is assembled with [`agent::AgentBuilder`] from an
//! [`config::AgentConfig`], a [`wallet::Wallet`] and any number of
//! [`agent::OutboundTransport`]s. Several agents may share a process.
#[macro_use]
extern crate log;
#[macro_use]
extern crate serde;

pub mod agent;
pub mod config;
pub mod crypto;
pub mod envelope;
mod error;
pub mod formats;
pub mod messages;
pub mod protocols;
mod result;
pub mod storage;
pub mod wallet;

pub use agent::{Agent, AgentBuilder, AgentEvent};
pub use config::AgentConfig;
pub use error::*;
pub use result::Result;
