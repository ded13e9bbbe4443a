// src/core/protocol/frame.rs

//! A type-prefixed, CRLF-terminated text wire protocol: the request/reply
//! framing described by the command protocol. Implements the `Encoder`/
//! `Decoder` pair tokio_util's `Framed` wraps around a connection's byte
//! stream.

use crate::core::errors::CoreError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// A parsed request frame. Requests from a well-behaved client are always
/// `Array(Some(_))` of `Bulk` elements; the inline fallback is folded into
/// the same shape by the decoder so everything downstream only has to
/// handle one case.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespFrame {
    SimpleString(String),
    Error(String),
    Integer(i64),
    /// `None` is the null bulk string (`$-1\r\n`).
    Bulk(Option<Bytes>),
    /// `None` is the null array (`*-1\r\n`).
    Array(Option<Vec<RespFrame>>),
}

/// A reply value produced by the dispatcher or engine. Immutable once
/// constructed; serializes to the same five wire shapes as `RespFrame`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Status(String),
    Error(String),
    Integer(i64),
    Bulk(Option<Bytes>),
    Array(Vec<Reply>),
}

impl Reply {
    pub fn ok() -> Self {
        Reply::Status("OK".into())
    }

    pub fn from_bytes(b: impl Into<Bytes>) -> Self {
        Reply::Bulk(Some(b.into()))
    }

    pub fn nil() -> Self {
        Reply::Bulk(None)
    }
}

impl From<CoreError> for Reply {
    fn from(e: CoreError) -> Self {
        Reply::Error(e.to_string())
    }
}

/// Finds the index just past the next `\r\n` in `buf`, starting at `from`.
fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|p| from + p)
}

/// Parses one line (without its terminator) starting at `pos`, returning
/// `(line, bytes_consumed_including_terminator)`.
fn parse_line(buf: &[u8], pos: usize) -> Option<(&[u8], usize)> {
    let end = find_crlf(buf, pos)?;
    Some((&buf[pos..end], end + 2 - pos))
}

/// Parses a single frame from `buf` starting at byte 0. Returns
/// `Ok(Some((frame, consumed)))` on success, `Ok(None)` if `buf` does not
/// yet contain a complete frame, `Err` on a malformed frame.
fn parse_frame(buf: &[u8]) -> Result<Option<(RespFrame, usize)>, CoreError> {
    if buf.is_empty() {
        return Ok(None);
    }

    match buf[0] {
        b'+' | b'-' | b':' => {
            let Some((line, consumed)) = parse_line(buf, 1) else {
                return Ok(None);
            };
            let text = String::from_utf8(line.to_vec())
                .map_err(|e| CoreError::Protocol(format!("invalid utf-8: {e}")))?;
            let frame = match buf[0] {
                b'+' => RespFrame::SimpleString(text),
                b'-' => RespFrame::Error(text),
                b':' => RespFrame::Integer(
                    text.parse()
                        .map_err(|_| CoreError::Protocol("invalid integer".into()))?,
                ),
                _ => unreachable!(),
            };
            Ok(Some((frame, 1 + consumed)))
        }
        b'$' => {
            let Some((line, header_len)) = parse_line(buf, 1) else {
                return Ok(None);
            };
            let len: i64 = std::str::from_utf8(line)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| CoreError::Protocol("invalid bulk length".into()))?;
            if len < 0 {
                return Ok(Some((RespFrame::Bulk(None), 1 + header_len)));
            }
            let len = len as usize;
            let data_start = 1 + header_len;
            let needed = data_start + len + 2;
            if buf.len() < needed {
                return Ok(None);
            }
            if &buf[data_start + len..needed] != b"\r\n" {
                return Err(CoreError::Protocol("invalid bulk terminator".into()));
            }
            let data = Bytes::copy_from_slice(&buf[data_start..data_start + len]);
            Ok(Some((RespFrame::Bulk(Some(data)), needed)))
        }
        b'*' => {
            let Some((line, header_len)) = parse_line(buf, 1) else {
                return Ok(None);
            };
            let count: i64 = std::str::from_utf8(line)
                .ok()
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| CoreError::Protocol("invalid array length".into()))?;
            if count < 0 {
                return Ok(Some((RespFrame::Array(None), 1 + header_len)));
            }
            let mut pos = 1 + header_len;
            let mut elems = Vec::with_capacity(count as usize);
            for _ in 0..count {
                match parse_frame(&buf[pos..])? {
                    Some((elem, used)) => {
                        pos += used;
                        elems.push(elem);
                    }
                    None => return Ok(None),
                }
            }
            Ok(Some((RespFrame::Array(Some(elems)), pos)))
        }
        _ => parse_inline(buf),
    }
}

/// Inline command fallback: a line of ASCII-whitespace-separated tokens,
/// accepted when the first byte is not a type marker.
fn parse_inline(buf: &[u8]) -> Result<Option<(RespFrame, usize)>, CoreError> {
    let Some((line, consumed)) = parse_line(buf, 0) else {
        return Ok(None);
    };
    let tokens: Vec<RespFrame> = line
        .split(|b: &u8| b.is_ascii_whitespace())
        .filter(|t| !t.is_empty())
        .map(|t| RespFrame::Bulk(Some(Bytes::copy_from_slice(t))))
        .collect();
    Ok(Some((RespFrame::Array(Some(tokens)), consumed)))
}

/// A `tokio_util::codec::Decoder`/`Encoder` pair framing a connection's
/// byte stream into `RespFrame` requests and serializing `Reply` values
/// back out.
#[derive(Debug, Default)]
pub struct WireCodec;

impl Decoder for WireCodec {
    type Item = RespFrame;
    type Error = CoreError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match parse_frame(src)? {
            Some((frame, consumed)) => {
                src.advance(consumed);
                Ok(Some(frame))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Reply> for WireCodec {
    type Error = CoreError;

    fn encode(&mut self, item: Reply, dst: &mut BytesMut) -> Result<(), Self::Error> {
        encode_reply(&item, dst);
        Ok(())
    }
}

fn encode_reply(reply: &Reply, dst: &mut BytesMut) {
    match reply {
        Reply::Status(s) => {
            dst.reserve(s.len() + 3);
            dst.put_u8(b'+');
            dst.put_slice(s.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Reply::Error(s) => {
            dst.reserve(s.len() + 3);
            dst.put_u8(b'-');
            dst.put_slice(s.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Reply::Integer(i) => {
            let s = i.to_string();
            dst.reserve(s.len() + 3);
            dst.put_u8(b':');
            dst.put_slice(s.as_bytes());
            dst.put_slice(b"\r\n");
        }
        Reply::Bulk(None) => dst.put_slice(b"$-1\r\n"),
        Reply::Bulk(Some(b)) => {
            dst.reserve(b.len() + 16);
            dst.put_u8(b'$');
            dst.put_slice(b.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            dst.put_slice(b);
            dst.put_slice(b"\r\n");
        }
        Reply::Array(items) => {
            dst.put_u8(b'*');
            dst.put_slice(items.len().to_string().as_bytes());
            dst.put_slice(b"\r\n");
            for item in items {
                encode_reply(item, dst);
            }
        }
    }
}

/// Serializes a command's wire form for replication propagation: an array
/// of bulk strings, `name` followed by `args`.
pub fn encode_command_wire(name: &str, args: &[Bytes]) -> Bytes {
    let mut buf = BytesMut::new();
    buf.put_u8(b'*');
    buf.put_slice((args.len() + 1).to_string().as_bytes());
    buf.put_slice(b"\r\n");
    encode_bulk(&mut buf, name.as_bytes());
    for a in args {
        encode_bulk(&mut buf, a);
    }
    buf.freeze()
}

fn encode_bulk(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u8(b'$');
    buf.put_slice(data.len().to_string().as_bytes());
    buf.put_slice(b"\r\n");
    buf.put_slice(data);
    buf.put_slice(b"\r\n");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(reply: Reply) {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(reply.clone(), &mut buf).unwrap();
        let (frame, consumed) = parse_frame(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(reply_to_frame(reply), frame);
    }

    /// Converts a `Reply` into the `RespFrame` an equivalent wire read
    /// would produce, so encode/decode can be compared directly.
    fn reply_to_frame(reply: Reply) -> RespFrame {
        match reply {
            Reply::Status(s) => RespFrame::SimpleString(s),
            Reply::Error(s) => RespFrame::Error(s),
            Reply::Integer(i) => RespFrame::Integer(i),
            Reply::Bulk(b) => RespFrame::Bulk(b),
            Reply::Array(items) => {
                RespFrame::Array(Some(items.into_iter().map(reply_to_frame).collect()))
            }
        }
    }

    #[test]
    fn round_trips_every_shape() {
        roundtrip(Reply::Status("OK".into()));
        roundtrip(Reply::Error("ERR boom".into()));
        roundtrip(Reply::Integer(-42));
        roundtrip(Reply::Bulk(Some(Bytes::from_static(b"hello"))));
        roundtrip(Reply::Bulk(None));
        roundtrip(Reply::Array(vec![
            Reply::Integer(1),
            Reply::Array(vec![Reply::Status("nested".into())]),
        ]));
    }

    #[test]
    fn empty_array_serializes_to_star_zero() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::new();
        codec.encode(Reply::Array(vec![]), &mut buf).unwrap();
        assert_eq!(&buf[..], b"*0\r\n");
        let (frame, _) = parse_frame(&buf).unwrap().unwrap();
        assert_eq!(frame, RespFrame::Array(Some(vec![])));
    }

    #[test]
    fn decoder_waits_for_full_frame() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::from(&b"*1\r\n$3\r\nfo"[..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"o\r\n");
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            RespFrame::Array(Some(vec![RespFrame::Bulk(Some(Bytes::from_static(
                b"foo"
            )))]))
        );
    }

    #[test]
    fn inline_command_splits_on_whitespace() {
        let mut codec = WireCodec;
        let mut buf = BytesMut::from(&b"PING  hello\r\n"[..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(
            frame,
            RespFrame::Array(Some(vec![
                RespFrame::Bulk(Some(Bytes::from_static(b"PING"))),
                RespFrame::Bulk(Some(Bytes::from_static(b"hello"))),
            ]))
        );
    }
}
