//! Application definitions: the deterministic transition and outcome
//! functions that give meaning to an app's opaque state.

mod hashlock;
mod signed_transfer;

pub use hashlock::*;
pub use signed_transfer::*;

use std::{collections::HashMap, fmt::Debug, sync::Arc};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    channel::{AppAction, AppState, CoinTransfer},
    error::ProtocolError,
    types::Address,
};

#[derive(Debug, thiserror::Error)]
pub enum TransitionError {
    #[error("no app definition registered at {0}")]
    UnknownApp(Address),
    #[error("undecodable state: {0}")]
    InvalidState(serde_json::Error),
    #[error("undecodable action: {0}")]
    InvalidAction(serde_json::Error),
    #[error("{0}")]
    Rejected(String),
}

impl From<TransitionError> for ProtocolError {
    fn from(e: TransitionError) -> Self {
        match e {
            TransitionError::UnknownApp(_) => Self::Validation(e.to_string()),
            _ => Self::Transition(e.to_string()),
        }
    }
}

/// Chain data an action may depend on. Fetched once per run so that both
/// parties can recompute a transition from the same inputs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChainContext {
    pub block_number: u64,
}

#[async_trait]
pub trait ChainProvider: Send + Sync + Debug {
    async fn chain_context(&self) -> Result<ChainContext, ProtocolError>;
}

/// [ChainProvider] that always reports the same block, for tests and hosts
/// without a chain connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FixedChain(pub ChainContext);

#[async_trait]
impl ChainProvider for FixedChain {
    async fn chain_context(&self) -> Result<ChainContext, ProtocolError> {
        Ok(self.0)
    }
}

/// The contract every application fulfills. Both functions must be pure.
pub trait AppDefinition: Send + Sync + Debug {
    fn apply_action(
        &self,
        state: &AppState,
        action: &AppAction,
        chain: &ChainContext,
    ) -> Result<AppState, TransitionError>;

    /// How the funds locked in the app are paid out given its state.
    fn compute_outcome(&self, state: &AppState) -> Result<Vec<CoinTransfer>, TransitionError>;
}

/// App definitions by their on-chain address.
#[derive(Debug, Clone, Default)]
pub struct AppRegistry {
    apps: HashMap<Address, Arc<dyn AppDefinition>>,
}

impl AppRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, address: Address, app: Arc<dyn AppDefinition>) -> &mut Self {
        self.apps.insert(address, app);
        self
    }

    pub fn get(&self, address: Address) -> Result<&dyn AppDefinition, TransitionError> {
        self.apps
            .get(&address)
            .map(|a| a.as_ref())
            .ok_or(TransitionError::UnknownApp(address))
    }
}

fn decode_state<T: serde::de::DeserializeOwned>(state: &AppState) -> Result<T, TransitionError> {
    serde_json::from_value(state.0.clone()).map_err(TransitionError::InvalidState)
}

fn decode_action<T: serde::de::DeserializeOwned>(
    action: &AppAction,
) -> Result<T, TransitionError> {
    serde_json::from_value(action.0.clone()).map_err(TransitionError::InvalidAction)
}

fn encode_state<T: Serialize>(state: &T) -> AppState {
    AppState(serde_json::to_value(state).expect("app states serialize to json"))
}
