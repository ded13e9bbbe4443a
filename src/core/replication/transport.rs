// src/core/replication/transport.rs

//! The replication transport: a typed binary frame protocol distinct from
//! the client command channel. Each frame is a one-byte message tag
//! followed by a four-byte big-endian payload length and the payload
//! itself; this framing is implementation-defined (the spec fixes the
//! tags and payload meanings, not the on-wire length prefix).

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::errors::CoreError;

pub const TAG_INITIATE_SYNC: u8 = 100;
pub const TAG_FULLRESYNC: u8 = 101;
pub const TAG_SNAPSHOT: u8 = 104;
pub const TAG_COMMAND: u8 = 105;
pub const TAG_ACK: u8 = 106;
pub const TAG_HEARTBEAT: u8 = 107;
pub const TAG_GET_MASTER_INFO: u8 = 108;
pub const TAG_MASTER_CHANGED: u8 = 109;

/// The on-wire unit of the replication write stream: logical database,
/// absolute offset, serialized command bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplCommand {
    pub db_index: u32,
    pub offset: i64,
    pub command: Bytes,
}

impl ReplCommand {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(12 + self.command.len());
        buf.put_u32(self.db_index);
        buf.put_i64(self.offset);
        buf.put_slice(&self.command);
        buf.freeze()
    }

    pub fn decode(mut data: &[u8]) -> Result<Self, CoreError> {
        if data.len() < 12 {
            return Err(CoreError::Protocol("truncated replicated envelope".into()));
        }
        let db_index = data.get_u32();
        let offset = data.get_i64();
        Ok(ReplCommand {
            db_index,
            offset,
            command: Bytes::copy_from_slice(data),
        })
    }

    /// Total length of this envelope once encoded; offsets advance by
    /// this amount, not by `command.len()` alone.
    pub fn encoded_len(&self) -> i64 {
        12 + self.command.len() as i64
    }
}

/// One message of the replication transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplMessage {
    /// Replica -> Primary: `"<host>:<port>"`, requests a full sync.
    InitiateSync(String),
    /// Primary -> Replica: `"FULLRESYNC <repl_id> <offset>"`.
    FullResync { repl_id: String, offset: i64 },
    /// Primary -> Replica: opaque snapshot bytes (§ snapshot format).
    Snapshot(Bytes),
    /// Primary -> Replica: one replicated write.
    Command(ReplCommand),
    /// Either direction: ASCII decimal offset acknowledgement.
    Ack(i64),
    Heartbeat,
    /// Client -> Node: request the current primary's address.
    GetMasterInfo,
    /// Node -> Subscriber: `"<host>:<port>"` of the new primary.
    MasterChanged(String),
}

impl ReplMessage {
    fn tag(&self) -> u8 {
        match self {
            ReplMessage::InitiateSync(_) => TAG_INITIATE_SYNC,
            ReplMessage::FullResync { .. } => TAG_FULLRESYNC,
            ReplMessage::Snapshot(_) => TAG_SNAPSHOT,
            ReplMessage::Command(_) => TAG_COMMAND,
            ReplMessage::Ack(_) => TAG_ACK,
            ReplMessage::Heartbeat => TAG_HEARTBEAT,
            ReplMessage::GetMasterInfo => TAG_GET_MASTER_INFO,
            ReplMessage::MasterChanged(_) => TAG_MASTER_CHANGED,
        }
    }

    fn payload(&self) -> Bytes {
        match self {
            ReplMessage::InitiateSync(addr) => Bytes::from(addr.clone().into_bytes()),
            ReplMessage::FullResync { repl_id, offset } => {
                Bytes::from(format!("FULLRESYNC {repl_id} {offset}").into_bytes())
            }
            ReplMessage::Snapshot(bytes) => bytes.clone(),
            ReplMessage::Command(cmd) => cmd.encode(),
            ReplMessage::Ack(offset) => Bytes::from(offset.to_string().into_bytes()),
            ReplMessage::Heartbeat => Bytes::new(),
            ReplMessage::GetMasterInfo => Bytes::new(),
            ReplMessage::MasterChanged(addr) => Bytes::from(addr.clone().into_bytes()),
        }
    }

    fn from_tag_payload(tag: u8, payload: Bytes) -> Result<Self, CoreError> {
        match tag {
            TAG_INITIATE_SYNC => Ok(ReplMessage::InitiateSync(String::from_utf8(
                payload.to_vec(),
            )?)),
            TAG_FULLRESYNC => {
                let text = String::from_utf8(payload.to_vec())?;
                let mut parts = text.split_ascii_whitespace();
                let keyword = parts.next();
                let repl_id = parts.next();
                let offset = parts.next();
                match (keyword, repl_id, offset) {
                    (Some("FULLRESYNC"), Some(repl_id), Some(offset)) => Ok(ReplMessage::FullResync {
                        repl_id: repl_id.to_string(),
                        offset: offset
                            .parse()
                            .map_err(|_| CoreError::Protocol("bad FULLRESYNC offset".into()))?,
                    }),
                    _ => Err(CoreError::Protocol("malformed FULLRESYNC".into())),
                }
            }
            TAG_SNAPSHOT => Ok(ReplMessage::Snapshot(payload)),
            TAG_COMMAND => Ok(ReplMessage::Command(ReplCommand::decode(&payload)?)),
            TAG_ACK => {
                let text = std::str::from_utf8(&payload)
                    .map_err(|_| CoreError::Protocol("bad ack payload".into()))?;
                let offset = text
                    .parse()
                    .map_err(|_| CoreError::Protocol("bad ack offset".into()))?;
                Ok(ReplMessage::Ack(offset))
            }
            TAG_HEARTBEAT => Ok(ReplMessage::Heartbeat),
            TAG_GET_MASTER_INFO => Ok(ReplMessage::GetMasterInfo),
            TAG_MASTER_CHANGED => Ok(ReplMessage::MasterChanged(String::from_utf8(
                payload.to_vec(),
            )?)),
            other => Err(CoreError::Protocol(format!("unknown replication tag {other}"))),
        }
    }
}

#[derive(Debug, Default)]
pub struct ReplTransportCodec;

impl Decoder for ReplTransportCodec {
    type Item = ReplMessage;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 5 {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[1], src[2], src[3], src[4]]) as usize;
        if src.len() < 5 + len {
            return Ok(None);
        }
        let tag = src[0];
        let payload = Bytes::copy_from_slice(&src[5..5 + len]);
        src.advance(5 + len);
        Ok(Some(ReplMessage::from_tag_payload(tag, payload)?))
    }
}

impl Encoder<ReplMessage> for ReplTransportCodec {
    type Error = CoreError;

    fn encode(&mut self, item: ReplMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let tag = item.tag();
        let payload = item.payload();
        dst.reserve(5 + payload.len());
        dst.put_u8(tag);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: ReplMessage) {
        let mut codec = ReplTransportCodec;
        let mut buf = BytesMut::new();
        codec.encode(msg.clone(), &mut buf).unwrap();
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, msg);
        assert!(buf.is_empty());
    }

    #[test]
    fn every_message_kind_round_trips() {
        roundtrip(ReplMessage::InitiateSync("10.0.0.1:6380".into()));
        roundtrip(ReplMessage::FullResync {
            repl_id: "a".repeat(40),
            offset: 42,
        });
        roundtrip(ReplMessage::Snapshot(Bytes::from_static(b"REDIS001EOF")));
        roundtrip(ReplMessage::Command(ReplCommand {
            db_index: 3,
            offset: 100,
            command: Bytes::from_static(b"*1\r\n$4\r\nPING\r\n"),
        }));
        roundtrip(ReplMessage::Ack(12345));
        roundtrip(ReplMessage::Heartbeat);
        roundtrip(ReplMessage::GetMasterInfo);
        roundtrip(ReplMessage::MasterChanged("10.0.0.2:6379".into()));
    }

    #[test]
    fn decoder_waits_for_full_payload() {
        let mut codec = ReplTransportCodec;
        let mut buf = BytesMut::new();
        codec.encode(ReplMessage::Ack(7), &mut buf).unwrap();
        let mut partial = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
