// src/core/errors.rs

//! The error taxonomy shared by the protocol codec, session table, role
//! manager, replication manager and dispatcher.

use std::sync::Arc;
use thiserror::Error;

/// A single error type spanning every component of the core. Mirrors the
/// wire-visible text mandated in the spec's error handling design 1:1 so
/// `Reply::Error(err.to_string())` is correct without further mapping.
#[derive(Debug, Error, Clone)]
pub enum CoreError {
    #[error("ERR Protocol error: {0}")]
    Protocol(String),

    /// Internal signal meaning "the decoder needs more bytes"; never
    /// surfaced to a client as a reply.
    #[error("incomplete frame")]
    IncompleteFrame,

    #[error("ERR unknown command '{0}'")]
    UnknownCommand(String),

    #[error("ERR wrong number of arguments for '{0}' command")]
    WrongArgumentCount(String),

    #[error("NOAUTH Authentication required.")]
    AuthRequired,

    #[error("ERR Client sent AUTH, but no password is set.")]
    NoPasswordSet,

    #[error("ERR invalid password")]
    InvalidPassword,

    #[error("ERR can't write against a read only slave")]
    ReadOnlyReplica,

    #[error("ERR {0}")]
    Replication(String),

    #[error("ERR {0}")]
    Engine(String),

    #[error("ERR {0}")]
    Io(#[from] Arc<std::io::Error>),

    #[error("ERR internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for CoreError {
    fn from(e: std::io::Error) -> Self {
        CoreError::Io(Arc::new(e))
    }
}

impl From<std::string::FromUtf8Error> for CoreError {
    fn from(e: std::string::FromUtf8Error) -> Self {
        CoreError::Protocol(format!("invalid utf-8: {e}"))
    }
}
