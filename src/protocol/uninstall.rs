use std::sync::Arc;

use super::{
    machine::{chain_of, channel_of, Exchange, Persist, Transition},
    AppChange, Parties, Protocol, ProtocolParams, UninstallParams,
};
use crate::{
    apps::{AppRegistry, ChainContext},
    channel::{AppInstance, StateChannel},
    commitment::CommitmentKind,
    error::ProtocolError,
};

/// Removes an installed app and pays its outcome into the free balance,
/// optionally applying a final action first.
#[derive(Debug)]
pub(super) struct Uninstall(pub UninstallParams);

impl Exchange for Uninstall {
    const PROTOCOL: Protocol = Protocol::Uninstall;

    fn parties(&self) -> &Parties {
        &self.0.parties
    }

    fn params(&self) -> ProtocolParams {
        ProtocolParams::Uninstall(self.0.clone())
    }

    fn needs_chain(&self) -> bool {
        self.0.action.is_some()
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

        let app = match &self.0.action {
            Some(action) => {
                let state = definition.apply_action(app.state(), action, chain_of(chain)?)?;
                Arc::new(app.with_state(state))
            }
            None => app.clone(),
        };
        let outcome = definition.compute_outcome(app.state())?;
        let channel = pre.uninstall_app(hash, &outcome)?;

        Ok(Transition {
            signed_app: channel.free_balance().clone(),
            channel,
            commitment_kind: CommitmentKind::SetState,
            persist: Persist::App(AppChange::RemoveInstance, app),
        })
    }
}
