use std::sync::Arc;

use super::{
    machine::{channel_of, Exchange, Persist, Transition},
    AppChange, Parties, Protocol, ProtocolParams, UpdateParams,
};
use crate::{
    apps::{AppRegistry, ChainContext},
    channel::{AppInstance, StateChannel},
    commitment::CommitmentKind,
    error::ProtocolError,
};

/// Replaces an app's state with a value agreed out of band. No app level
/// transition is involved.
#[derive(Debug)]
pub(super) struct Update(pub UpdateParams);

impl Exchange for Update {
    const PROTOCOL: Protocol = Protocol::Update;

    fn parties(&self) -> &Parties {
        &self.0.parties
    }

    fn params(&self) -> ProtocolParams {
        ProtocolParams::Update(self.0.clone())
    }

    fn target_app(&self, pre: &StateChannel) -> Result<Option<Arc<AppInstance>>, ProtocolError> {
        Ok(Some(pre.lookup_app(self.0.app_identity_hash)?.clone()))
    }

    fn compute(
        &self,
        pre: Option<&StateChannel>,
        _chain: Option<&ChainContext>,
        _apps: &AppRegistry,
    ) -> Result<Transition, ProtocolError> {
        let hash = self.0.app_identity_hash;
        let channel = channel_of(pre)?.replace_app_state(hash, self.0.new_state.clone())?;
        let app = channel.lookup_app(hash)?.clone();

        Ok(Transition {
            channel,
            signed_app: app.clone(),
            commitment_kind: CommitmentKind::SetState,
            persist: Persist::App(AppChange::UpdateInstance, app),
        })
    }
}
