use serde::{Deserialize, Serialize};

use super::Protocol;
use crate::{
    channel::{AppAction, AppState, AppTerms},
    sig::Identifier,
    types::{Address, Hash, U256},
};

/// The channel a run operates on and the two roles in it.
///
/// `initiator_identifier` is the party starting the run, which is not
/// necessarily the party that set up the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Parties {
    pub multisig_address: Address,
    pub initiator_identifier: Identifier,
    pub responder_identifier: Identifier,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupParams {
    pub parties: Parties,
    pub free_balance_timeout: U256,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeParams {
    pub parties: Parties,
    pub terms: AppTerms,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstallParams {
    pub parties: Parties,
    pub app_identity_hash: Hash,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateParams {
    pub parties: Parties,
    pub app_identity_hash: Hash,
    pub new_state: AppState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TakeActionParams {
    pub parties: Parties,
    pub app_identity_hash: Hash,
    pub action: AppAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UninstallParams {
    pub parties: Parties,
    pub app_identity_hash: Hash,
    /// Final action applied before the outcome is computed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<AppAction>,
}

/// Parameters of a run, one variant per protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProtocolParams {
    Setup(SetupParams),
    Propose(ProposeParams),
    Install(InstallParams),
    Update(UpdateParams),
    TakeAction(TakeActionParams),
    Uninstall(UninstallParams),
}

impl ProtocolParams {
    pub fn protocol(&self) -> Protocol {
        match self {
            Self::Setup(_) => Protocol::Setup,
            Self::Propose(_) => Protocol::Propose,
            Self::Install(_) => Protocol::Install,
            Self::Update(_) => Protocol::Update,
            Self::TakeAction(_) => Protocol::TakeAction,
            Self::Uninstall(_) => Protocol::Uninstall,
        }
    }

    pub fn parties(&self) -> &Parties {
        match self {
            Self::Setup(p) => &p.parties,
            Self::Propose(p) => &p.parties,
            Self::Install(p) => &p.parties,
            Self::Update(p) => &p.parties,
            Self::TakeAction(p) => &p.parties,
            Self::Uninstall(p) => &p.parties,
        }
    }

    pub fn multisig_address(&self) -> Address {
        self.parties().multisig_address
    }

    /// The app the run targets, if it targets an existing one.
    pub fn app_identity_hash(&self) -> Option<Hash> {
        match self {
            Self::Setup(_) | Self::Propose(_) => None,
            Self::Install(p) => Some(p.app_identity_hash),
            Self::Update(p) => Some(p.app_identity_hash),
            Self::TakeAction(p) => Some(p.app_identity_hash),
            Self::Uninstall(p) => Some(p.app_identity_hash),
        }
    }
}
