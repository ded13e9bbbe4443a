// src/core/protocol/mod.rs

//! The wire codec (C1): frame types, the `Reply` type clients receive, and
//! the `tokio_util::codec` `Encoder`/`Decoder` pair that frames a byte
//! stream into `RespFrame`s.

pub mod frame;

pub use frame::{Reply, RespFrame, WireCodec};
