//! Value model of a multisig channel and the apps running in it.

mod app_instance;
mod free_balance;
mod state_channel;

pub use app_instance::*;
pub use free_balance::*;
pub use state_channel::*;

use crate::{
    error::ProtocolError,
    sig::KeyError,
    types::{Address, Hash, U256},
};

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("app {0} is not installed")]
    AppNotFound(Hash),
    #[error("no proposal for app {0}")]
    ProposalNotFound(Hash),
    #[error("app {0} was already proposed")]
    ProposalExists(Hash),
    #[error("app {0} already holds funds")]
    AppAlreadyActive(Hash),
    #[error("{0} is not a participant of this channel")]
    NotParticipant(String),
    #[error("{party} has insufficient balance of {token}")]
    InsufficientBalance { party: Address, token: Address },
    #[error("outcome pays {total}, limit is {limit}")]
    OutcomeExceedsLimit { limit: U256, total: U256 },
    #[error("outcome pays {0} which is not a free balance address")]
    UnknownRecipient(Address),
    #[error("the free balance cannot be uninstalled")]
    FreeBalanceNotRemovable,
    #[error("amount overflow")]
    Overflow,
    #[error("free balance state: {0}")]
    FreeBalanceState(#[from] serde_json::Error),
    #[error(transparent)]
    Key(#[from] KeyError),
}

impl From<ChannelError> for ProtocolError {
    fn from(e: ChannelError) -> Self {
        match e {
            ChannelError::AppNotFound(_) | ChannelError::ProposalNotFound(_) => {
                Self::NotFound(e.to_string())
            }
            ChannelError::FreeBalanceState(_) => Self::Malformed(e.to_string()),
            ChannelError::Key(_) => Self::Signing(e.to_string()),
            _ => Self::Validation(e.to_string()),
        }
    }
}
