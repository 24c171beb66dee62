use std::sync::Arc;

use super::{
    machine::{chain_of, channel_of, Exchange, Persist, Transition},
    AppChange, Parties, Protocol, ProtocolParams, TakeActionParams,
};
use crate::{
    apps::{AppRegistry, ChainContext},
    channel::{AppInstance, StateChannel},
    commitment::CommitmentKind,
    error::ProtocolError,
};

/// Advances an app by applying an action through its definition.
///
/// Both roles run the transition themselves. The message only carries the
/// action, never a resulting state.
#[derive(Debug)]
pub(super) struct TakeAction(pub TakeActionParams);

impl Exchange for TakeAction {
    const PROTOCOL: Protocol = Protocol::TakeAction;

    fn parties(&self) -> &Parties {
        &self.0.parties
    }

    fn params(&self) -> ProtocolParams {
        ProtocolParams::TakeAction(self.0.clone())
    }

    fn needs_chain(&self) -> bool {
        true
    }

    fn target_app(&self, pre: &StateChannel) -> Result<Option<Arc<AppInstance>>, ProtocolError> {
        Ok(Some(pre.lookup_app(self.0.app_identity_hash)?.clone()))
    }

    fn compute(
        &self,
        pre: Option<&StateChannel>,
        chain: Option<&ChainContext>,
        apps: &AppRegistry,
    ) -> Result<Transition, ProtocolError> {
        let pre = channel_of(pre)?;
        let hash = self.0.app_identity_hash;
        let app = pre.lookup_app(hash)?;

        let definition = apps.get(app.app_definition())?;
        let state = definition.apply_action(app.state(), &self.0.action, chain_of(chain)?)?;

        let channel = pre.replace_app_state(hash, state)?;
        let app = channel.lookup_app(hash)?.clone();

        Ok(Transition {
            channel,
            signed_app: app.clone(),
            commitment_kind: CommitmentKind::SetState,
            persist: Persist::App(AppChange::UpdateInstance, app),
        })
    }
}
