use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha3::{Digest, Keccak256};

use super::ChannelError;
use crate::{
    sig::Identifier,
    types::{Address, Hash, U256},
};

/// Opaque application state. Only the app definition knows its shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppState(pub Value);

impl AppState {
    /// keccak256 over the canonical JSON encoding.
    ///
    /// `serde_json::Value` keeps object keys sorted, so both parties arrive at
    /// the same bytes for the same logical state regardless of how they built
    /// it.
    pub fn hash(&self) -> Hash {
        let bytes = serde_json::to_vec(&self.0)
            .expect("a serde_json::Value always has string keys and serializes");
        Hash::keccak(&bytes)
    }
}

/// Opaque application action, interpreted by the app definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AppAction(pub Value);

/// How the outcome of an app is applied to the free balance: at most `limit`
/// of `token_address` can be paid out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeInterpreterParams {
    pub limit: U256,
    pub token_address: Address,
}

/// Everything the proposer of an app decides, i.e. the contents of a
/// proposal apart from the channel it lives in.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppTerms {
    pub app_definition: Address,
    pub initial_state: AppState,
    pub initiator_deposit: U256,
    pub responder_deposit: U256,
    pub default_timeout: U256,
    pub state_timeout: U256,
    pub outcome_interpreter: OutcomeInterpreterParams,
}

/// One two-party application running in a channel.
///
/// Fields are private: `identity_hash`, `app_seq_no` and the participants
/// never change after creation, and the version only moves through
/// [AppInstance::with_state].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppInstance {
    identity_hash: Hash,
    multisig_address: Address,
    initiator_identifier: Identifier,
    responder_identifier: Identifier,
    /// Ephemeral addresses at `app_seq_no`, initiator first.
    participants: [Address; 2],
    app_seq_no: u32,
    version: u64,
    latest_state: AppState,
    app_definition: Address,
    default_timeout: U256,
    state_timeout: U256,
    initiator_deposit: U256,
    responder_deposit: U256,
    outcome_interpreter: OutcomeInterpreterParams,
}

impl AppInstance {
    pub fn new(
        multisig_address: Address,
        initiator_identifier: Identifier,
        responder_identifier: Identifier,
        app_seq_no: u32,
        terms: AppTerms,
    ) -> Result<Self, ChannelError> {
        let participants = [
            initiator_identifier.derive_address(app_seq_no)?,
            responder_identifier.derive_address(app_seq_no)?,
        ];
        let identity_hash = identity_hash(
            multisig_address,
            terms.app_definition,
            participants,
            terms.default_timeout,
            app_seq_no,
        );

        Ok(Self {
            identity_hash,
            multisig_address,
            initiator_identifier,
            responder_identifier,
            participants,
            app_seq_no,
            version: 0,
            latest_state: terms.initial_state,
            app_definition: terms.app_definition,
            default_timeout: terms.default_timeout,
            state_timeout: terms.state_timeout,
            initiator_deposit: terms.initiator_deposit,
            responder_deposit: terms.responder_deposit,
            outcome_interpreter: terms.outcome_interpreter,
        })
    }

    /// A copy of this app carrying `state` at the next version.
    pub fn with_state(&self, state: AppState) -> Self {
        Self {
            latest_state: state,
            version: self.version + 1,
            ..self.clone()
        }
    }

    pub fn identity_hash(&self) -> Hash {
        self.identity_hash
    }

    pub fn multisig_address(&self) -> Address {
        self.multisig_address
    }

    pub fn initiator_identifier(&self) -> &Identifier {
        &self.initiator_identifier
    }

    pub fn responder_identifier(&self) -> &Identifier {
        &self.responder_identifier
    }

    pub fn participants(&self) -> [Address; 2] {
        self.participants
    }

    pub fn app_seq_no(&self) -> u32 {
        self.app_seq_no
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn state(&self) -> &AppState {
        &self.latest_state
    }

    pub fn app_definition(&self) -> Address {
        self.app_definition
    }

    pub fn default_timeout(&self) -> U256 {
        self.default_timeout
    }

    pub fn state_timeout(&self) -> U256 {
        self.state_timeout
    }

    pub fn initiator_deposit(&self) -> U256 {
        self.initiator_deposit
    }

    pub fn responder_deposit(&self) -> U256 {
        self.responder_deposit
    }

    pub fn outcome_interpreter(&self) -> &OutcomeInterpreterParams {
        &self.outcome_interpreter
    }

    /// The terms this app was proposed with, at its current state.
    pub fn terms(&self) -> AppTerms {
        AppTerms {
            app_definition: self.app_definition,
            initial_state: self.latest_state.clone(),
            initiator_deposit: self.initiator_deposit,
            responder_deposit: self.responder_deposit,
            default_timeout: self.default_timeout,
            state_timeout: self.state_timeout,
            outcome_interpreter: self.outcome_interpreter,
        }
    }
}

/// Content address of an app: packed encoding of everything fixed at proposal
/// time.
fn identity_hash(
    multisig_address: Address,
    app_definition: Address,
    participants: [Address; 2],
    default_timeout: U256,
    app_seq_no: u32,
) -> Hash {
    // Packed encoding => We can't use a serializer
    let mut hasher = Keccak256::new();
    hasher.update(multisig_address.0);
    hasher.update(app_definition.0);
    for p in participants {
        hasher.update(p.0);
    }
    hasher.update(default_timeout.to_be_bytes());
    hasher.update(U256::from(app_seq_no).to_be_bytes());
    Hash(hasher.finalize().into())
}
