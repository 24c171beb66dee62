use std::sync::Arc;

use super::{
    machine::{channel_of, Exchange, Persist, Transition},
    AppChange, Parties, ProposeParams, Protocol, ProtocolParams,
};
use crate::{
    apps::{AppRegistry, ChainContext},
    channel::{AppInstance, StateChannel},
    commitment::CommitmentKind,
    error::ProtocolError,
};

/// Proposes a new app at the channel's next sequence number. The proposer
/// becomes the app's initiator. Both parties sign the app's initial state.
#[derive(Debug)]
pub(super) struct Propose(pub ProposeParams);

impl Exchange for Propose {
    const PROTOCOL: Protocol = Protocol::Propose;

    fn parties(&self) -> &Parties {
        &self.0.parties
    }

    fn params(&self) -> ProtocolParams {
        ProtocolParams::Propose(self.0.clone())
    }

    fn target_app(&self, _pre: &StateChannel) -> Result<Option<Arc<AppInstance>>, ProtocolError> {
        Ok(None)
    }

    fn compute(
        &self,
        pre: Option<&StateChannel>,
        _chain: Option<&ChainContext>,
        _apps: &AppRegistry,
    ) -> Result<Transition, ProtocolError> {
        let (channel, app) =
            channel_of(pre)?.add_proposal(self.0.parties.initiator_identifier, self.0.terms.clone())?;

        Ok(Transition {
            channel,
            signed_app: app.clone(),
            commitment_kind: CommitmentKind::Proposal,
            persist: Persist::App(AppChange::CreateProposal, app),
        })
    }
}
