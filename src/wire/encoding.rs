use async_trait::async_trait;
use prost::{bytes::BufMut, Message};
use tracing::{debug, warn};
use uuid::Uuid;

use super::{BytesBus, Correlator, MessageBus, WireError};
use crate::{
    protocol::{CustomData, ProcessId, Protocol, ProtocolMessage, ProtocolParams, Seq},
    sig::Identifier,
    types::Signature,
};

/// Protobuf form of a [ProtocolMessage]. Params travel as JSON bytes.
#[derive(Clone, PartialEq, Message)]
pub struct WireProtocolMessage {
    #[prost(string, tag = "1")]
    pub protocol: String,
    #[prost(bytes = "vec", tag = "2")]
    pub process_id: Vec<u8>,
    /// `-1` marks a terminal one-way message.
    #[prost(int64, tag = "3")]
    pub seq: i64,
    #[prost(bytes = "vec", tag = "4")]
    pub to_identifier: Vec<u8>,
    #[prost(bytes = "vec", tag = "5")]
    pub params: Vec<u8>,
    /// Empty if the message carries no signature.
    #[prost(bytes = "vec", tag = "6")]
    pub signature: Vec<u8>,
}

impl TryFrom<&ProtocolMessage> for WireProtocolMessage {
    type Error = WireError;

    fn try_from(msg: &ProtocolMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            protocol: msg.protocol.name().to_string(),
            process_id: msg.process_id.0.as_bytes().to_vec(),
            seq: msg.seq.to_wire(),
            to_identifier: msg.to_identifier.as_bytes().to_vec(),
            params: serde_json::to_vec(&msg.params)?,
            signature: msg
                .custom_data
                .signature
                .map(|s| s.0.to_vec())
                .unwrap_or_default(),
        })
    }
}

impl TryFrom<WireProtocolMessage> for ProtocolMessage {
    type Error = WireError;

    fn try_from(value: WireProtocolMessage) -> Result<Self, Self::Error> {
        let protocol = Protocol::from_name(&value.protocol)
            .ok_or_else(|| WireError::Decode(format!("unknown protocol {:?}", value.protocol)))?;
        let process_id = Uuid::from_slice(&value.process_id)
            .map_err(|e| WireError::Decode(format!("process id: {e}")))?;
        let seq = Seq::from_wire(value.seq)
            .ok_or_else(|| WireError::Decode(format!("sequence number {}", value.seq)))?;
        let to_identifier = value
            .to_identifier
            .as_slice()
            .try_into()
            .map_err(|_| WireError::Decode("identifier length".into()))
            .and_then(|b| {
                Identifier::from_bytes(b).map_err(|e| WireError::Decode(e.to_string()))
            })?;
        let params: ProtocolParams = serde_json::from_slice(&value.params)?;
        let signature = match value.signature.len() {
            0 => None,
            _ => Some(
                Signature::from_slice(&value.signature)
                    .map_err(|e| WireError::Decode(format!("signature: {e}")))?,
            ),
        };

        Ok(Self {
            protocol,
            process_id: ProcessId(process_id),
            seq,
            to_identifier,
            params,
            custom_data: CustomData { signature },
        })
    }
}

/// [MessageBus] on top of a [BytesBus]: encodes protocol messages as
/// length-prefixed protobuf and matches replies to waiting runs.
///
/// Inbound bytes have to be fed to [ProtoBufEncodingLayer::receive].
#[derive(Debug)]
pub struct ProtoBufEncodingLayer<B: BytesBus> {
    pub bus: B,
    pending: Correlator,
}

impl<B: BytesBus> ProtoBufEncodingLayer<B> {
    pub fn new(bus: B) -> Self {
        Self {
            bus,
            pending: Correlator::new(),
        }
    }

    pub fn encode(msg: &ProtocolMessage) -> Result<Vec<u8>, WireError> {
        let msg = WireProtocolMessage::try_from(msg)?;
        // The prefix is a fixed big-endian u16, `encode_length_delimited`
        // would write a LEB128 varint instead.
        let len = msg.encoded_len();
        let prefix = u16::try_from(len).map_err(|_| WireError::TooLarge(len))?;

        let mut buf = Vec::with_capacity(2 + len);
        buf.put_slice(&prefix.to_be_bytes());
        msg.encode(&mut buf)?;
        Ok(buf)
    }

    pub fn decode(bytes: &[u8]) -> Result<ProtocolMessage, WireError> {
        if bytes.len() < 2 {
            return Err(WireError::Decode("missing length prefix".into()));
        }
        let (prefix, body) = bytes.split_at(2);
        let len = u16::from_be_bytes([prefix[0], prefix[1]]) as usize;
        if body.len() != len {
            return Err(WireError::Decode(format!(
                "length prefix says {len} bytes, got {}",
                body.len()
            )));
        }
        let msg = WireProtocolMessage::decode(body).map_err(|e| WireError::Decode(e.to_string()))?;
        msg.try_into()
    }

    /// Handle inbound bytes.
    ///
    /// Replies are routed to the run waiting for them and `None` is returned.
    /// A message starting a new run is returned to the caller, who decides
    /// whether to respond to it.
    pub fn receive(&self, bytes: &[u8]) -> Result<Option<ProtocolMessage>, WireError> {
        let msg = Self::decode(bytes)?;
        let starts_run = msg.seq == Seq::Step(1) && !self.pending.is_waiting(&msg.process_id);
        if starts_run {
            debug!(protocol = %msg.protocol, process_id = %msg.process_id, "inbound run");
            return Ok(Some(msg));
        }

        if let Some(orphan) = self.pending.resolve(msg) {
            warn!(
                protocol = %orphan.protocol,
                process_id = %orphan.process_id,
                "dropping reply nobody waits for"
            );
        }
        Ok(None)
    }
}

#[async_trait]
impl<B: BytesBus> MessageBus for ProtoBufEncodingLayer<B> {
    async fn send(&self, msg: ProtocolMessage) -> Result<(), WireError> {
        let buf = Self::encode(&msg)?;
        self.bus.send_to(&msg.to_identifier, &buf).await
    }

    async fn send_and_wait(&self, msg: ProtocolMessage) -> Result<ProtocolMessage, WireError> {
        let buf = Self::encode(&msg)?;
        let reply = self.pending.expect(msg.process_id);
        self.bus.send_to(&msg.to_identifier, &buf).await?;
        reply.recv().await
    }
}
