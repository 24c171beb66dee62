use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{BytesBus, WireError};
use crate::sig::Identifier;

type Inboxes = HashMap<Identifier, mpsc::UnboundedSender<Vec<u8>>>;

/// In-process byte transport between participants, one inbox each.
#[derive(Debug, Default, Clone)]
pub struct MemoryNetwork {
    inboxes: Arc<Mutex<Inboxes>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `id` to the network. Bytes sent to `id` arrive on the returned
    /// receiver.
    pub fn join(&self, id: Identifier) -> (MemoryBus, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, tx);
        (
            MemoryBus {
                network: self.clone(),
            },
            rx,
        )
    }

    /// Detach `id`, messages to it fail from now on.
    pub fn leave(&self, id: &Identifier) {
        self.inboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
    }
}

#[derive(Debug, Clone)]
pub struct MemoryBus {
    network: MemoryNetwork,
}

#[async_trait]
impl BytesBus for MemoryBus {
    async fn send_to(&self, recipient: &Identifier, msg: &[u8]) -> Result<(), WireError> {
        let inbox = self
            .network
            .inboxes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(recipient)
            .cloned()
            .ok_or_else(|| WireError::Unreachable(recipient.to_string()))?;
        inbox
            .send(msg.to_vec())
            .map_err(|_| WireError::Transport(format!("inbox of {recipient:?} is closed")))
    }
}
