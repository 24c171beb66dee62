use std::{sync::Arc, time::Duration};

use tracing::debug;

use crate::{
    apps::AppRegistry,
    error::ProtocolError,
    interpreter::{Context, ProtocolRunner},
    lock::LockService,
    protocol::{self, Parties, ProtocolMessage, ProtocolParams, RunOutput},
    sig::Identifier,
    types::Address,
};

/// The main object used to run protocols on behalf of one participant.
///
/// It owns the interpreter with its capabilities, the app definitions both
/// roles need to recompute transitions, and the lock service that keeps runs
/// on the same channel apart. Usually you only need one CfClient.
#[derive(Debug, Clone)]
pub struct CfClient {
    runner: ProtocolRunner,
    apps: Arc<AppRegistry>,
    locks: LockService,
    identifier: Identifier,
}

impl CfClient {
    pub fn new(ctx: Context, apps: AppRegistry, locks: LockService) -> Self {
        let identifier = ctx.signer.public_identifier();
        CfClient {
            runner: ProtocolRunner::new(ctx),
            apps: Arc::new(apps),
            locks,
            identifier,
        }
    }

    pub fn identifier(&self) -> &Identifier {
        &self.identifier
    }

    pub fn runner(&self) -> &ProtocolRunner {
        &self.runner
    }

    /// Roles for a run we start on `multisig_address` with `counterparty`.
    pub fn parties(&self, multisig_address: Address, counterparty: Identifier) -> Parties {
        Parties {
            multisig_address,
            initiator_identifier: self.identifier,
            responder_identifier: counterparty,
        }
    }

    /// How long a run may keep the channel locked: it can wait for the
    /// counterparty for the whole reply budget, plus the regular lease for
    /// everything else.
    fn lease(&self) -> Duration {
        let config = &self.runner.context().config;
        config.send_and_wait_timeout() + config.lock.ttl()
    }

    /// Start a protocol run as initiator.
    pub async fn initiate(&self, params: ProtocolParams) -> Result<RunOutput, ProtocolError> {
        if params.parties().initiator_identifier != self.identifier {
            return Err(ProtocolError::Validation(
                "we must be the initiator of runs we start".into(),
            ));
        }

        let key = lock_key(params.multisig_address());
        let flow = protocol::initiate(params, self.apps.clone());
        debug!(protocol = %flow.protocol(), process_id = %flow.process_id(), "initiating");
        self.locks
            .with_lock_timeout(&key, self.lease(), || self.runner.run(flow))
            .await
    }

    /// Take part in the run started by `msg`.
    pub async fn respond(&self, msg: ProtocolMessage) -> Result<RunOutput, ProtocolError> {
        if msg.to_identifier != self.identifier
            || msg.params.parties().responder_identifier != self.identifier
        {
            return Err(ProtocolError::Validation(format!(
                "{} message for {} is not addressed to us",
                msg.protocol, msg.to_identifier
            )));
        }

        let key = lock_key(msg.params.multisig_address());
        let flow = protocol::respond(msg, self.apps.clone())?;
        self.locks
            .with_lock_timeout(&key, self.lease(), || self.runner.run(flow))
            .await
    }
}

fn lock_key(multisig_address: Address) -> String {
    format!("channel:{multisig_address}")
}
