//! Error taxonomy of a protocol run.
//!
//! Every failure aborts the run it happens in. The module level errors
//! (channel model, commitments, store, wire, apps) convert into
//! [ProtocolError] so flows and the interpreter can use `?` throughout.

use crate::types::Address;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// Rejected before any state change.
    #[error("validation failed: {0}")]
    Validation(String),
    /// The app's transition function rejected the action.
    #[error("transition rejected: {0}")]
    Transition(String),
    #[error("signature recovers to {recovered}, expected {expected}")]
    Authentication { expected: Address, recovered: Address },
    /// Round-trip timeout or transport error.
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("lock failure: {0}")]
    Lock(String),
    /// A durable write failed. If this happens after signatures were
    /// exchanged, the counterparty may already consider the update final.
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("malformed: {0}")]
    Malformed(String),
}

impl From<crate::sig::Error> for ProtocolError {
    fn from(e: crate::sig::Error) -> Self {
        match e {
            // A signature we cannot even parse is as bad as one from the
            // wrong signer, but there is no address to report.
            crate::sig::Error::Ecdsa(_) | crate::sig::Error::InvalidRecoveryId(_) => {
                Self::Malformed(e.to_string())
            }
            crate::sig::Error::Key(_) => Self::Signing(e.to_string()),
        }
    }
}

impl From<crate::sig::KeyError> for ProtocolError {
    fn from(e: crate::sig::KeyError) -> Self {
        Self::Signing(e.to_string())
    }
}

impl From<serde_json::Error> for ProtocolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Malformed(e.to_string())
    }
}
