use std::sync::Arc;

use super::{
    machine::{channel_of, Exchange, Persist, Transition},
    AppChange, InstallParams, Parties, Protocol, ProtocolParams,
};
use crate::{
    apps::{AppRegistry, ChainContext},
    channel::{AppInstance, StateChannel},
    commitment::CommitmentKind,
    error::ProtocolError,
};

/// Installs a proposed app. The deposits move out of the free balance, so the
/// signed state is the free balance at its next version.
#[derive(Debug)]
pub(super) struct Install(pub InstallParams);

impl Exchange for Install {
    const PROTOCOL: Protocol = Protocol::Install;

    fn parties(&self) -> &Parties {
        &self.0.parties
    }

    fn params(&self) -> ProtocolParams {
        ProtocolParams::Install(self.0.clone())
    }

    fn target_app(&self, pre: &StateChannel) -> Result<Option<Arc<AppInstance>>, ProtocolError> {
        Ok(Some(pre.lookup_proposal(self.0.app_identity_hash)?.clone()))
    }

    fn compute(
        &self,
        pre: Option<&StateChannel>,
        _chain: Option<&ChainContext>,
        _apps: &AppRegistry,
    ) -> Result<Transition, ProtocolError> {
        let hash = self.0.app_identity_hash;
        let channel = channel_of(pre)?.install_app(hash)?;
        let app = channel.lookup_app(hash)?.clone();

        Ok(Transition {
            signed_app: channel.free_balance().clone(),
            channel,
            commitment_kind: CommitmentKind::SetState,
            persist: Persist::App(AppChange::CreateInstance, app),
        })
    }
}
