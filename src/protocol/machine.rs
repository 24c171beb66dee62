//! The per-role state machine shared by every protocol.
//!
//! ```text
//! Start → Validated → StateComputed → Signed → {AwaitingCounterparty} → Verified → Committed → Done
//! ```
//!
//! Only the initiator passes through `AwaitingCounterparty`. The responder
//! checks the initiator's signature before producing its own, so it is
//! `Verified` right after signing. Persistence requests are always issued
//! last, which is why an aborted run never leaves a partial write behind.

use core::mem;
use std::sync::Arc;

use super::{
    AppChange, CustomData, Parties, ProcessId, Protocol, ProtocolFlow, ProtocolMessage,
    ProtocolParams, Request, Response, Role, RunOutput, Seq, Step, ValidationContext,
};
use crate::{
    apps::{AppRegistry, ChainContext},
    channel::{AppInstance, StateChannel},
    commitment::{CommitmentKind, SetStateCommitment},
    error::ProtocolError,
    sig::Identifier,
    types::{Address, Signature},
};

/// Externally visible progress of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    Start,
    Validated,
    StateComputed,
    Signed,
    AwaitingCounterparty,
    Verified,
    Committed,
    Done,
    Aborted,
}

/// The durable write concluding a run.
#[derive(Debug, Clone)]
pub(super) enum Persist {
    Channel,
    App(AppChange, Arc<AppInstance>),
}

/// Outcome of the pure part of a run: the post-protocol channel and what has
/// to be signed and persisted.
#[derive(Debug, Clone)]
pub(super) struct Transition {
    pub channel: StateChannel,
    /// The app whose new state both parties sign.
    pub signed_app: Arc<AppInstance>,
    pub commitment_kind: CommitmentKind,
    pub persist: Persist,
}

/// What distinguishes one protocol from another.
pub(super) trait Exchange: Send + core::fmt::Debug {
    const PROTOCOL: Protocol;

    fn parties(&self) -> &Parties;

    fn params(&self) -> ProtocolParams;

    /// Setup is the only protocol that runs without a channel.
    fn expects_channel(&self) -> bool {
        true
    }

    fn needs_chain(&self) -> bool {
        false
    }

    /// Look up the app this run targets. Fails if it is gone from the
    /// snapshot, before anything is signed.
    fn target_app(&self, pre: &StateChannel) -> Result<Option<Arc<AppInstance>>, ProtocolError>;

    fn compute(
        &self,
        pre: Option<&StateChannel>,
        chain: Option<&ChainContext>,
        apps: &AppRegistry,
    ) -> Result<Transition, ProtocolError>;
}

pub(super) fn channel_of(pre: Option<&StateChannel>) -> Result<&StateChannel, ProtocolError> {
    pre.ok_or_else(|| ProtocolError::NotFound("channel".into()))
}

pub(super) fn chain_of(chain: Option<&ChainContext>) -> Result<&ChainContext, ProtocolError> {
    chain.ok_or_else(|| ProtocolError::Malformed("chain context was not fetched".into()))
}

#[derive(Debug)]
enum Stage {
    Start,
    Loading,
    Validating {
        pre: Option<StateChannel>,
    },
    FetchingChain {
        pre: Option<StateChannel>,
    },
    Signing {
        transition: Transition,
        commitment: SetStateCommitment,
    },
    AwaitingCounterparty {
        transition: Transition,
        commitment: SetStateCommitment,
    },
    PersistingCommitment {
        transition: Transition,
        commitment: SetStateCommitment,
    },
    PersistingApp {
        transition: Transition,
        commitment: SetStateCommitment,
    },
    Replying {
        output: RunOutput,
    },
    Done,
    Aborted,
}

#[derive(Debug)]
pub(super) struct RoleMachine<E: Exchange> {
    exchange: E,
    role: Role,
    process_id: ProcessId,
    /// The message that started the run (responder only).
    inbound: Option<ProtocolMessage>,
    apps: Arc<AppRegistry>,
    stage: Stage,
    phase: Phase,
}

impl<E: Exchange> RoleMachine<E> {
    pub fn initiator(exchange: E, process_id: ProcessId, apps: Arc<AppRegistry>) -> Self {
        Self {
            exchange,
            role: Role::Initiator,
            process_id,
            inbound: None,
            apps,
            stage: Stage::Start,
            phase: Phase::Start,
        }
    }

    pub fn responder(exchange: E, inbound: ProtocolMessage, apps: Arc<AppRegistry>) -> Self {
        Self {
            exchange,
            role: Role::Responder,
            process_id: inbound.process_id,
            inbound: Some(inbound),
            apps,
            stage: Stage::Start,
            phase: Phase::Start,
        }
    }

    fn counterparty(&self) -> &Identifier {
        let parties = self.exchange.parties();
        match self.role {
            Role::Initiator => &parties.responder_identifier,
            Role::Responder => &parties.initiator_identifier,
        }
    }

    fn message(&self, seq: Seq, signature: Signature) -> ProtocolMessage {
        ProtocolMessage {
            protocol: E::PROTOCOL,
            process_id: self.process_id,
            seq,
            to_identifier: *self.counterparty(),
            params: self.exchange.params(),
            custom_data: CustomData {
                signature: Some(signature),
            },
        }
    }

    /// Where the counterparty's signature for `app` must recover to.
    fn expected_signer(&self, app: &AppInstance) -> Result<Address, ProtocolError> {
        Ok(self.counterparty().derive_address(app.app_seq_no())?)
    }

    fn counterparty_signature(
        &self,
        msg: &ProtocolMessage,
        commitment: &mut SetStateCommitment,
        app: &AppInstance,
    ) -> Result<(), ProtocolError> {
        let sig = msg.custom_data.signature.ok_or_else(|| {
            ProtocolError::Malformed(format!("{} message without signature", msg.protocol))
        })?;
        commitment.verify(sig, self.expected_signer(app)?)?;
        commitment.add_signatures([sig])?;
        Ok(())
    }

    fn compute(
        &mut self,
        pre: Option<StateChannel>,
        chain: Option<ChainContext>,
    ) -> Result<(Stage, Request), ProtocolError> {
        let transition = self
            .exchange
            .compute(pre.as_ref(), chain.as_ref(), &self.apps)?;
        let mut commitment = SetStateCommitment::new(&transition.signed_app);
        self.phase = Phase::StateComputed;

        // Never countersign before the initiator's signature checked out
        // against our own recomputation.
        if let Some(inbound) = &self.inbound {
            self.counterparty_signature(inbound, &mut commitment, &transition.signed_app)?;
        }

        let request = Request::Sign {
            digest: commitment.digest(),
            app_seq_no: transition.signed_app.app_seq_no(),
        };
        Ok((
            Stage::Signing {
                transition,
                commitment,
            },
            request,
        ))
    }

    fn persist_commitment(transition: &Transition, commitment: &SetStateCommitment) -> Request {
        Request::PersistCommitment {
            kind: transition.commitment_kind,
            commitment: commitment.clone(),
            app_identity_hash: transition.signed_app.identity_hash(),
        }
    }

    fn persist_app(transition: &Transition) -> Request {
        match &transition.persist {
            Persist::Channel => Request::PersistStateChannel(transition.channel.clone()),
            Persist::App(change, app) => Request::PersistAppInstance {
                change: *change,
                channel: transition.channel.clone(),
                app: app.clone(),
            },
        }
    }

    fn output(&self, transition: Transition, commitment: SetStateCommitment) -> RunOutput {
        RunOutput {
            protocol: E::PROTOCOL,
            process_id: self.process_id,
            channel: transition.channel,
            commitment,
            app: match transition.persist {
                Persist::Channel => None,
                Persist::App(_, app) => Some(app),
            },
        }
    }

    fn advance(
        &mut self,
        stage: Stage,
        input: Option<Response>,
    ) -> Result<(Stage, Step), ProtocolError> {
        let (stage, request) = match (stage, input) {
            (Stage::Start, None) => (
                Stage::Loading,
                Request::LoadChannel {
                    multisig_address: self.exchange.parties().multisig_address,
                },
            ),

            (Stage::Loading, Some(Response::Channel(pre))) => {
                let app = match (&pre, self.exchange.expects_channel()) {
                    (Some(pre), true) => self.exchange.target_app(pre)?,
                    (None, true) => {
                        return Err(ProtocolError::NotFound(format!(
                            "channel {}",
                            self.exchange.parties().multisig_address
                        )))
                    }
                    (Some(_), false) => {
                        return Err(ProtocolError::Validation(format!(
                            "channel {} already exists",
                            self.exchange.parties().multisig_address
                        )))
                    }
                    (None, false) => None,
                };

                let ctx = ValidationContext {
                    protocol: E::PROTOCOL,
                    role: self.role,
                    params: self.exchange.params(),
                    channel: pre.clone(),
                    app,
                };
                (Stage::Validating { pre }, Request::Validate(Box::new(ctx)))
            }

            (Stage::Validating { pre }, Some(Response::Ack)) => {
                self.phase = Phase::Validated;
                if self.exchange.needs_chain() {
                    (Stage::FetchingChain { pre }, Request::FetchChainContext)
                } else {
                    self.compute(pre, None)?
                }
            }

            (Stage::FetchingChain { pre }, Some(Response::Chain(chain))) => {
                self.compute(pre, Some(chain))?
            }

            (
                Stage::Signing {
                    transition,
                    mut commitment,
                },
                Some(Response::Signature(sig)),
            ) => {
                commitment.add_signatures([sig])?;
                self.phase = Phase::Signed;
                match self.role {
                    Role::Initiator => {
                        let msg = self.message(Seq::Step(1), sig);
                        self.phase = Phase::AwaitingCounterparty;
                        (
                            Stage::AwaitingCounterparty {
                                transition,
                                commitment,
                            },
                            Request::SendAndWait(msg),
                        )
                    }
                    Role::Responder => {
                        self.phase = Phase::Verified;
                        let request = Self::persist_commitment(&transition, &commitment);
                        (
                            Stage::PersistingCommitment {
                                transition,
                                commitment,
                            },
                            request,
                        )
                    }
                }
            }

            (
                Stage::AwaitingCounterparty {
                    transition,
                    mut commitment,
                },
                Some(Response::Reply(reply)),
            ) => {
                if reply.process_id != self.process_id || reply.protocol != E::PROTOCOL {
                    return Err(ProtocolError::Malformed(format!(
                        "reply for {} {} in run {} {}",
                        reply.protocol, reply.process_id, E::PROTOCOL, self.process_id
                    )));
                }
                if !reply.seq.is_reply() {
                    return Err(ProtocolError::Malformed(format!(
                        "reply in run {} at {:?}",
                        self.process_id, reply.seq
                    )));
                }
                self.counterparty_signature(&reply, &mut commitment, &transition.signed_app)?;
                self.phase = Phase::Verified;
                let request = Self::persist_commitment(&transition, &commitment);
                (
                    Stage::PersistingCommitment {
                        transition,
                        commitment,
                    },
                    request,
                )
            }

            (
                Stage::PersistingCommitment {
                    transition,
                    commitment,
                },
                Some(Response::Ack),
            ) => {
                self.phase = Phase::Committed;
                let request = Self::persist_app(&transition);
                (
                    Stage::PersistingApp {
                        transition,
                        commitment,
                    },
                    request,
                )
            }

            (
                Stage::PersistingApp {
                    transition,
                    commitment,
                },
                Some(Response::Ack),
            ) => match self.role {
                Role::Initiator => {
                    self.phase = Phase::Done;
                    return Ok((Stage::Done, Step::Done(self.output(transition, commitment))));
                }
                Role::Responder => {
                    let [initiator_sig, responder_sig] = commitment.signatures()?;
                    // Our own slot depends on who initiated the app, not the run.
                    let own = if transition.signed_app.initiator_identifier() == self.counterparty()
                    {
                        responder_sig
                    } else {
                        initiator_sig
                    };
                    let reply = self.message(Seq::Terminal, own);
                    (
                        Stage::Replying {
                            output: self.output(transition, commitment),
                        },
                        Request::Send(reply),
                    )
                }
            },

            (Stage::Replying { output }, Some(Response::Ack)) => {
                self.phase = Phase::Done;
                return Ok((Stage::Done, Step::Done(output)));
            }

            (stage, input) => {
                return Err(ProtocolError::Malformed(format!(
                    "{} {:?} cannot handle {:?} in stage {:?}",
                    E::PROTOCOL,
                    self.role,
                    input.as_ref().map(response_name),
                    stage_name(&stage),
                )))
            }
        };

        Ok((stage, Step::Request(request)))
    }
}

fn response_name(r: &Response) -> &'static str {
    match r {
        Response::Ack => "Ack",
        Response::Channel(_) => "Channel",
        Response::Chain(_) => "Chain",
        Response::Signature(_) => "Signature",
        Response::Reply(_) => "Reply",
    }
}

fn stage_name(s: &Stage) -> &'static str {
    match s {
        Stage::Start => "Start",
        Stage::Loading => "Loading",
        Stage::Validating { .. } => "Validating",
        Stage::FetchingChain { .. } => "FetchingChain",
        Stage::Signing { .. } => "Signing",
        Stage::AwaitingCounterparty { .. } => "AwaitingCounterparty",
        Stage::PersistingCommitment { .. } => "PersistingCommitment",
        Stage::PersistingApp { .. } => "PersistingApp",
        Stage::Replying { .. } => "Replying",
        Stage::Done => "Done",
        Stage::Aborted => "Aborted",
    }
}

impl<E: Exchange> ProtocolFlow for RoleMachine<E> {
    fn protocol(&self) -> Protocol {
        E::PROTOCOL
    }

    fn role(&self) -> Role {
        self.role
    }

    fn process_id(&self) -> ProcessId {
        self.process_id
    }

    fn phase(&self) -> Phase {
        self.phase
    }

    fn step(&mut self, input: Option<Response>) -> Result<Step, ProtocolError> {
        // Any error leaves the machine aborted.
        let stage = mem::replace(&mut self.stage, Stage::Aborted);
        match self.advance(stage, input) {
            Ok((stage, step)) => {
                self.stage = stage;
                Ok(step)
            }
            Err(e) => {
                self.phase = Phase::Aborted;
                Err(e)
            }
        }
    }
}
