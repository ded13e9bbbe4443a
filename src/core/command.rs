// src/core/command.rs

//! The command value (C2) and its classification rules (part of C1/C8).

use crate::core::errors::CoreError;
use crate::core::protocol::frame::RespFrame;
use bytes::Bytes;
use tokio::sync::oneshot;

/// Commands that mutate the dataset. `SELECT` is deliberately absent: the
/// logical database travels inside each replication envelope instead of
/// being replicated as a command of its own.
pub const WRITE_COMMANDS: &[&str] = &[
    "SET", "SETNX", "SETEX", "PSETEX", "APPEND", "DEL", "UNLINK", "INCR", "DECR", "INCRBY",
    "DECRBY", "INCRBYFLOAT", "GETSET", "GETDEL", "SETRANGE", "HSET", "HSETNX", "HDEL",
    "HINCRBY", "HINCRBYFLOAT", "SADD", "SREM", "SPOP", "SMOVE", "ZADD", "ZREM", "ZINCRBY",
    "LPUSH", "RPUSH", "LPOP", "RPOP", "LSET", "LREM", "LTRIM", "LINSERT", "EXPIRE", "PEXPIRE",
    "EXPIREAT", "PEXPIREAT", "PERSIST", "RENAME", "RENAMENX", "MOVE", "COPY", "RESTORE",
    "FLUSHDB", "FLUSHALL", "MSET", "MSETNX",
];

/// Replication-control commands: always intercepted, never dispatched to
/// the engine.
pub const REPLICATION_CONTROL_COMMANDS: &[&str] = &["REPLCONF", "SYNC", "PSYNC"];

/// Returns whether `name` (already uppercase) is a write command.
pub fn is_write(name: &str) -> bool {
    WRITE_COMMANDS.contains(&name)
}

pub fn is_replication_control(name: &str) -> bool {
    REPLICATION_CONTROL_COMMANDS.contains(&name)
}

/// An immutable inbound command. Created by the codec on each request
/// frame; `db_index` is stamped in from the session before dispatch.
/// `reply_tx` is a one-shot delivery slot, not a queue: it is consumed
/// exactly once by whichever component produces the final reply.
pub struct Command {
    pub name: String,
    pub args: Vec<Bytes>,
    pub client_id: u64,
    pub db_index: usize,
    pub reply_tx: Option<oneshot::Sender<crate::core::protocol::frame::Reply>>,
}

impl Command {
    /// Builds a `Command` from a parsed request frame. `frame` MUST be an
    /// `Array` of `Bulk` elements (the decoder folds the inline fallback
    /// into this same shape).
    pub fn from_frame(frame: RespFrame, client_id: u64) -> Result<Self, CoreError> {
        let elems = match frame {
            RespFrame::Array(Some(elems)) => elems,
            RespFrame::Array(None) | RespFrame::Bulk(None) => {
                return Err(CoreError::Protocol("empty command".into()));
            }
            _ => return Err(CoreError::Protocol("expected a command array".into())),
        };
        if elems.is_empty() {
            return Err(CoreError::Protocol("empty command".into()));
        }
        let mut args = Vec::with_capacity(elems.len());
        for elem in elems {
            match elem {
                RespFrame::Bulk(Some(b)) => args.push(b),
                RespFrame::Bulk(None) => args.push(Bytes::new()),
                _ => return Err(CoreError::Protocol("command elements must be bulk strings".into())),
            }
        }
        let name_bytes = args.remove(0);
        let name = String::from_utf8(name_bytes.to_vec())?.to_ascii_uppercase();
        Ok(Command {
            name,
            args,
            client_id,
            db_index: 0,
            reply_tx: None,
        })
    }

    pub fn is_write(&self) -> bool {
        is_write(&self.name)
    }

    pub fn wire_bytes(&self) -> Bytes {
        crate::core::protocol::frame::encode_command_wire(&self.name, &self.args)
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("client_id", &self.client_id)
            .field("db_index", &self.db_index)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_commands_classify_true() {
        for name in WRITE_COMMANDS {
            assert!(is_write(name), "{name} should classify as a write");
        }
    }

    #[test]
    fn read_commands_classify_false() {
        for name in [
            "GET", "HGET", "SMEMBERS", "ZRANGE", "TTL", "TYPE", "KEYS", "EXISTS", "INFO", "ROLE",
            "SELECT", "PING", "AUTH",
        ] {
            assert!(!is_write(name), "{name} should not classify as a write");
        }
    }

    #[test]
    fn select_is_never_replicated() {
        assert!(!is_write("SELECT"));
    }

    #[test]
    fn parses_array_of_bulk_strings() {
        let frame = RespFrame::Array(Some(vec![
            RespFrame::Bulk(Some(Bytes::from_static(b"set"))),
            RespFrame::Bulk(Some(Bytes::from_static(b"k"))),
            RespFrame::Bulk(Some(Bytes::from_static(b"v"))),
        ]));
        let cmd = Command::from_frame(frame, 1).unwrap();
        assert_eq!(cmd.name, "SET");
        assert_eq!(cmd.args, vec![Bytes::from_static(b"k"), Bytes::from_static(b"v")]);
    }
}
