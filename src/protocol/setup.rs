use std::sync::Arc;

use super::{
    machine::{Exchange, Persist, Transition},
    Parties, Protocol, ProtocolParams, SetupParams,
};
use crate::{
    apps::{AppRegistry, ChainContext},
    channel::{AppInstance, StateChannel},
    commitment::CommitmentKind,
    error::ProtocolError,
};

/// Creates the channel. Both parties sign version 0 of the free balance.
#[derive(Debug)]
pub(super) struct Setup(pub SetupParams);

impl Exchange for Setup {
    const PROTOCOL: Protocol = Protocol::Setup;

    fn parties(&self) -> &Parties {
        &self.0.parties
    }

    fn params(&self) -> ProtocolParams {
        ProtocolParams::Setup(self.0.clone())
    }

    fn expects_channel(&self) -> bool {
        false
    }

    fn target_app(&self, _pre: &StateChannel) -> Result<Option<Arc<AppInstance>>, ProtocolError> {
        Ok(None)
    }

    fn compute(
        &self,
        _pre: Option<&StateChannel>,
        _chain: Option<&ChainContext>,
        _apps: &AppRegistry,
    ) -> Result<Transition, ProtocolError> {
        let parties = &self.0.parties;
        let channel = StateChannel::setup(
            parties.multisig_address,
            parties.initiator_identifier,
            parties.responder_identifier,
            self.0.free_balance_timeout,
        )?;

        Ok(Transition {
            signed_app: channel.free_balance().clone(),
            channel,
            commitment_kind: CommitmentKind::SetState,
            persist: Persist::Channel,
        })
    }
}
