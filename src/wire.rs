mod encoding;
mod memory;

use core::fmt::Debug;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use tokio::sync::oneshot;

pub use encoding::{ProtoBufEncodingLayer, WireProtocolMessage};
pub use memory::{MemoryBus, MemoryNetwork};

use crate::{
    error::ProtocolError,
    protocol::{ProcessId, ProtocolMessage},
    sig::Identifier,
};

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("no route to {0}")]
    Unreachable(String),
    #[error("connection closed while waiting for process {0}")]
    Closed(ProcessId),
    #[error("transport: {0}")]
    Transport(String),
    #[error("encoded message has {0} bytes, at most 65535 fit the length prefix")]
    TooLarge(usize),
    #[error("encode: {0}")]
    Encode(#[from] prost::EncodeError),
    #[error("decode: {0}")]
    Decode(String),
    #[error("params: {0}")]
    Params(#[from] serde_json::Error),
}

impl From<WireError> for ProtocolError {
    fn from(e: WireError) -> Self {
        match e {
            WireError::Unreachable(_) | WireError::Closed(_) | WireError::Transport(_) => {
                Self::Delivery(e.to_string())
            }
            WireError::TooLarge(_)
            | WireError::Encode(_)
            | WireError::Decode(_)
            | WireError::Params(_) => {
                Self::Malformed(e.to_string())
            }
        }
    }
}

/// Low-Level abstraction over the network: opaque bytes to a participant.
#[async_trait]
pub trait BytesBus: Send + Sync + Debug {
    async fn send_to(&self, recipient: &Identifier, msg: &[u8]) -> Result<(), WireError>;
}

/// Messaging gateway used by the interpreter.
#[async_trait]
pub trait MessageBus: Send + Sync + Debug {
    async fn send(&self, msg: ProtocolMessage) -> Result<(), WireError>;

    /// Send `msg` and wait for the reply of the same run. Waits forever, the
    /// caller bounds it with a timeout.
    async fn send_and_wait(&self, msg: ProtocolMessage) -> Result<ProtocolMessage, WireError>;
}

/// Runs waiting for a reply, by process id.
#[derive(Debug, Default, Clone)]
pub struct Correlator {
    pending: Arc<Mutex<HashMap<ProcessId, oneshot::Sender<ProtocolMessage>>>>,
}

/// Removes its entry when the waiting side goes away (e.g. timed out).
#[derive(Debug)]
pub struct PendingReply {
    correlator: Correlator,
    process_id: ProcessId,
    rx: Option<oneshot::Receiver<ProtocolMessage>>,
}

impl PendingReply {
    pub async fn recv(mut self) -> Result<ProtocolMessage, WireError> {
        let rx = self.rx.take().ok_or(WireError::Closed(self.process_id))?;
        rx.await.map_err(|_| WireError::Closed(self.process_id))
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.correlator.lock().remove(&self.process_id);
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ProcessId, oneshot::Sender<ProtocolMessage>>> {
        // The map stays consistent even if a holder panicked.
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register interest in the reply to `process_id`. Must happen before the
    /// request goes out, the reply may arrive before `send` returns.
    pub fn expect(&self, process_id: ProcessId) -> PendingReply {
        let (tx, rx) = oneshot::channel();
        self.lock().insert(process_id, tx);
        PendingReply {
            correlator: self.clone(),
            process_id,
            rx: Some(rx),
        }
    }

    /// Hand `msg` to the run waiting for it. Gives the message back if no run
    /// is waiting or `msg` is not at a reply position; the waiter is kept.
    pub fn resolve(&self, msg: ProtocolMessage) -> Option<ProtocolMessage> {
        if !msg.seq.is_reply() {
            return Some(msg);
        }
        let tx = self.lock().remove(&msg.process_id);
        match tx {
            Some(tx) => tx.send(msg).err(),
            None => Some(msg),
        }
    }

    pub fn is_waiting(&self, process_id: &ProcessId) -> bool {
        self.lock().contains_key(process_id)
    }
}
