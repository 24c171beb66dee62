//! The protocol flow library.
//!
//! Each protocol is a pair of role functions expressed as an explicit state
//! machine ([ProtocolFlow]). A flow never performs I/O itself: every call to
//! [ProtocolFlow::step] returns either the next [Request] for the interpreter
//! to carry out, or the final [RunOutput]. The interpreter feeds the result of
//! the request back in as a [Response].

mod install;
mod machine;
mod params;
mod propose;
mod setup;
mod take_action;
mod uninstall;
mod update;

use core::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use machine::Phase;
pub use params::*;

use crate::{
    apps::{AppRegistry, ChainContext},
    channel::{AppInstance, StateChannel},
    commitment::{CommitmentKind, SetStateCommitment},
    error::ProtocolError,
    sig::Identifier,
    types::{Address, Hash, Signature},
};
use machine::RoleMachine;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Protocol {
    Setup,
    Propose,
    Install,
    Update,
    TakeAction,
    Uninstall,
}

impl Protocol {
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Setup => "setup",
            Protocol::Propose => "propose",
            Protocol::Install => "install",
            Protocol::Update => "update",
            Protocol::TakeAction => "takeAction",
            Protocol::Uninstall => "uninstall",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        [
            Protocol::Setup,
            Protocol::Propose,
            Protocol::Install,
            Protocol::Update,
            Protocol::TakeAction,
            Protocol::Uninstall,
        ]
        .into_iter()
        .find(|p| p.name() == name)
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Role {
    Initiator,
    Responder,
}

/// Correlates all messages of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProcessId(pub Uuid);

impl ProcessId {
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Position of a message in its run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Seq {
    Step(u32),
    /// One-way send, nobody waits for a reply to it.
    Terminal,
}

impl Seq {
    /// Wire representation of [Seq::Terminal].
    pub const TERMINAL: i64 = -1;

    pub fn to_wire(self) -> i64 {
        match self {
            Seq::Step(n) => n.into(),
            Seq::Terminal => Self::TERMINAL,
        }
    }

    /// Whether a message at this position answers a run's first message.
    pub fn is_reply(self) -> bool {
        matches!(self, Seq::Step(2) | Seq::Terminal)
    }

    pub fn from_wire(v: i64) -> Option<Self> {
        match v {
            Self::TERMINAL => Some(Seq::Terminal),
            v => u32::try_from(v).ok().map(Seq::Step),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CustomData {
    pub signature: Option<Signature>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolMessage {
    pub protocol: Protocol,
    pub process_id: ProcessId,
    pub seq: Seq,
    pub to_identifier: Identifier,
    pub params: ProtocolParams,
    pub custom_data: CustomData,
}

/// Kind of durable change to an app instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AppChange {
    CreateProposal,
    CreateInstance,
    UpdateInstance,
    RemoveInstance,
}

/// Everything a validator gets to look at.
#[derive(Debug, Clone)]
pub struct ValidationContext {
    pub protocol: Protocol,
    pub role: Role,
    pub params: ProtocolParams,
    /// Pre-protocol snapshot (absent for setup).
    pub channel: Option<StateChannel>,
    /// Current value of the targeted app, if the run targets one.
    pub app: Option<Arc<AppInstance>>,
}

/// A unit of work a flow delegates to the interpreter.
#[derive(Debug, Clone)]
pub enum Request {
    LoadChannel {
        multisig_address: Address,
    },
    Validate(Box<ValidationContext>),
    FetchChainContext,
    Sign {
        digest: Hash,
        app_seq_no: u32,
    },
    Send(ProtocolMessage),
    SendAndWait(ProtocolMessage),
    PersistStateChannel(StateChannel),
    PersistAppInstance {
        change: AppChange,
        channel: StateChannel,
        app: Arc<AppInstance>,
    },
    PersistCommitment {
        kind: CommitmentKind,
        commitment: SetStateCommitment,
        app_identity_hash: Hash,
    },
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::LoadChannel { .. } => "LoadChannel",
            Request::Validate(_) => "Validate",
            Request::FetchChainContext => "FetchChainContext",
            Request::Sign { .. } => "Sign",
            Request::Send(_) => "Send",
            Request::SendAndWait(_) => "SendAndWait",
            Request::PersistStateChannel(_) => "PersistStateChannel",
            Request::PersistAppInstance { .. } => "PersistAppInstance",
            Request::PersistCommitment { .. } => "PersistCommitment",
        }
    }
}

/// Result of carrying out a [Request].
#[derive(Debug, Clone)]
pub enum Response {
    /// The request had no result besides succeeding.
    Ack,
    Channel(Option<StateChannel>),
    Chain(ChainContext),
    Signature(Signature),
    Reply(ProtocolMessage),
}

#[derive(Debug, Clone)]
pub struct RunOutput {
    pub protocol: Protocol,
    pub process_id: ProcessId,
    /// Post-protocol channel value.
    pub channel: StateChannel,
    /// The fully signed commitment of this run.
    pub commitment: SetStateCommitment,
    /// The app written by this run, if any.
    pub app: Option<Arc<AppInstance>>,
}

#[derive(Debug)]
pub enum Step {
    Request(Request),
    Done(RunOutput),
}

/// One role of one protocol run.
pub trait ProtocolFlow: Send + fmt::Debug {
    fn protocol(&self) -> Protocol;

    fn role(&self) -> Role;

    fn process_id(&self) -> ProcessId;

    fn phase(&self) -> Phase;

    /// Advance the flow. The first call takes `None`, every following call
    /// the response to the previously returned request. Once an error was
    /// returned the flow is aborted and keeps failing.
    fn step(&mut self, input: Option<Response>) -> Result<Step, ProtocolError>;
}

/// Start a new run as initiator.
pub fn initiate(params: ProtocolParams, apps: Arc<AppRegistry>) -> Box<dyn ProtocolFlow> {
    let process_id = ProcessId::random();
    match params {
        ProtocolParams::Setup(p) => Box::new(RoleMachine::initiator(
            setup::Setup(p),
            process_id,
            apps,
        )),
        ProtocolParams::Propose(p) => Box::new(RoleMachine::initiator(
            propose::Propose(p),
            process_id,
            apps,
        )),
        ProtocolParams::Install(p) => Box::new(RoleMachine::initiator(
            install::Install(p),
            process_id,
            apps,
        )),
        ProtocolParams::Update(p) => Box::new(RoleMachine::initiator(
            update::Update(p),
            process_id,
            apps,
        )),
        ProtocolParams::TakeAction(p) => Box::new(RoleMachine::initiator(
            take_action::TakeAction(p),
            process_id,
            apps,
        )),
        ProtocolParams::Uninstall(p) => Box::new(RoleMachine::initiator(
            uninstall::Uninstall(p),
            process_id,
            apps,
        )),
    }
}

/// Join the run started by `msg` as responder.
pub fn respond(
    msg: ProtocolMessage,
    apps: Arc<AppRegistry>,
) -> Result<Box<dyn ProtocolFlow>, ProtocolError> {
    if msg.seq != Seq::Step(1) {
        return Err(ProtocolError::Malformed(format!(
            "run {} does not start at step 1 ({:?})",
            msg.process_id, msg.seq
        )));
    }
    if msg.params.protocol() != msg.protocol {
        return Err(ProtocolError::Malformed(format!(
            "{} message carries {} params",
            msg.protocol,
            msg.params.protocol()
        )));
    }

    let params = msg.params.clone();
    Ok(match params {
        ProtocolParams::Setup(p) => Box::new(RoleMachine::responder(setup::Setup(p), msg, apps)),
        ProtocolParams::Propose(p) => {
            Box::new(RoleMachine::responder(propose::Propose(p), msg, apps))
        }
        ProtocolParams::Install(p) => {
            Box::new(RoleMachine::responder(install::Install(p), msg, apps))
        }
        ProtocolParams::Update(p) => Box::new(RoleMachine::responder(update::Update(p), msg, apps)),
        ProtocolParams::TakeAction(p) => Box::new(RoleMachine::responder(
            take_action::TakeAction(p),
            msg,
            apps,
        )),
        ProtocolParams::Uninstall(p) => {
            Box::new(RoleMachine::responder(uninstall::Uninstall(p), msg, apps))
        }
    })
}

#[cfg(test)]
mod tests;
