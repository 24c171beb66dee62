//! Off-chain update protocols for two-party multisig channels.
//!
//! A [CfClient] runs the named protocols (setup, propose, install, update,
//! takeAction, uninstall) against a counterparty. Each run is a
//! [protocol::ProtocolFlow] state machine driven by the
//! [interpreter::ProtocolRunner], which carries out the flow's requests
//! against the injected store, message bus, validator, signer and chain
//! provider.

pub mod apps;
pub mod channel;
mod client;
pub mod commitment;
pub mod config;
pub mod error;
pub mod interpreter;
pub mod lock;
pub mod protocol;
pub mod sig;
pub mod store;
pub mod types;
pub mod validation;
pub mod wire;

pub use client::CfClient;
pub use error::ProtocolError;
pub use types::{Address, Hash, Signature, U256};
