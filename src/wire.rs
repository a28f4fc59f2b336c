//! Wire-protocol framing.
//!
//! Every message starts with a 16-byte little-endian header: total length,
//! request id, the id of the request being answered, and an opcode. Bodies
//! are opaque here.

use std::sync::atomic::{AtomicI32, Ordering};
use thiserror::Error;

pub const HEADER_LEN: usize = 16;

/// Largest message a server will send unless it says otherwise.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 48_000_000;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    #[error("message of {0} bytes is shorter than a header")]
    Truncated(usize),

    #[error("header length {declared} does not match message length {actual}")]
    LengthMismatch { declared: usize, actual: usize },

    #[error("unknown opcode {0}")]
    UnknownOpCode(i32),

    #[error("unknown compressor {0:?}")]
    UnknownCompressor(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum OpCode {
    Reply = 1,
    Update = 2001,
    Insert = 2002,
    Query = 2004,
    GetMore = 2005,
    Delete = 2006,
    KillCursors = 2007,
    Compressed = 2012,
    Msg = 2013,
}

impl TryFrom<i32> for OpCode {
    type Error = Error;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => OpCode::Reply,
            2001 => OpCode::Update,
            2002 => OpCode::Insert,
            2004 => OpCode::Query,
            2005 => OpCode::GetMore,
            2006 => OpCode::Delete,
            2007 => OpCode::KillCursors,
            2012 => OpCode::Compressed,
            2013 => OpCode::Msg,
            other => return Err(Error::UnknownOpCode(other)),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MessageHeader {
    pub length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: OpCode,
}

impl MessageHeader {
    /// Reads the header at the front of a complete message.
    pub fn parse(message: &[u8]) -> Result<Self, Error> {
        if message.len() < HEADER_LEN {
            return Err(Error::Truncated(message.len()));
        }
        let word = |i: usize| {
            let mut b = [0u8; 4];
            b.copy_from_slice(&message[i * 4..i * 4 + 4]);
            i32::from_le_bytes(b)
        };
        let header = Self {
            length: word(0),
            request_id: word(1),
            response_to: word(2),
            op_code: OpCode::try_from(word(3))?,
        };
        if header.length as usize != message.len() {
            return Err(Error::LengthMismatch {
                declared: header.length as usize,
                actual: message.len(),
            });
        }
        Ok(header)
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.length.to_le_bytes());
        out.extend_from_slice(&self.request_id.to_le_bytes());
        out.extend_from_slice(&self.response_to.to_le_bytes());
        out.extend_from_slice(&(self.op_code as i32).to_le_bytes());
    }
}

/// Prepends a header to `body`, producing a complete message.
pub fn frame(request_id: i32, response_to: i32, op_code: OpCode, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    MessageHeader {
        length: (HEADER_LEN + body.len()) as i32,
        request_id,
        response_to,
        op_code,
    }
    .encode(&mut out);
    out.extend_from_slice(body);
    out
}

/// Allocates request ids. Each pool owns one.
#[derive(Debug, Default)]
pub struct RequestIds(AtomicI32);

impl RequestIds {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&self) -> i32 {
        self.0.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// A compression algorithm which may be negotiated with a server.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Compressor {
    Snappy,
    Zlib { level: Option<i32> },
    Zstd { level: Option<i32> },
}

impl Compressor {
    pub fn name(&self) -> &'static str {
        match self {
            Compressor::Snappy => "snappy",
            Compressor::Zlib { .. } => "zlib",
            Compressor::Zstd { .. } => "zstd",
        }
    }

    fn same_algorithm(&self, other: &Compressor) -> bool {
        self.name() == other.name()
    }
}

impl std::fmt::Display for Compressor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for Compressor {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "snappy" => Ok(Compressor::Snappy),
            "zlib" => Ok(Compressor::Zlib { level: None }),
            "zstd" => Ok(Compressor::Zstd { level: None }),
            _ => Err(Error::UnknownCompressor(s.to_string())),
        }
    }
}

/// Picks the first of the client's compressors that the server also offers.
///
/// The client's entry is returned, so any configured level is kept.
pub fn negotiate(client: &[Compressor], server: &[Compressor]) -> Option<Compressor> {
    client
        .iter()
        .find(|c| server.iter().any(|s| s.same_algorithm(c)))
        .copied()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn header_round_trip() {
        let msg = frame(7, 3, OpCode::Msg, b"hello");
        assert_eq!(msg.len(), HEADER_LEN + 5);
        let header = MessageHeader::parse(&msg).unwrap();
        assert_eq!(header.length, 21);
        assert_eq!(header.request_id, 7);
        assert_eq!(header.response_to, 3);
        assert_eq!(header.op_code, OpCode::Msg);
    }

    #[test]
    fn malformed_headers() {
        assert_eq!(MessageHeader::parse(&[0; 4]), Err(Error::Truncated(4)));

        let mut msg = frame(1, 0, OpCode::Msg, b"abc");
        msg.push(0);
        assert!(matches!(
            MessageHeader::parse(&msg),
            Err(Error::LengthMismatch { declared: 19, actual: 20 })
        ));

        let mut msg = frame(1, 0, OpCode::Msg, b"");
        msg[12..16].copy_from_slice(&99i32.to_le_bytes());
        assert_eq!(MessageHeader::parse(&msg), Err(Error::UnknownOpCode(99)));
    }

    #[test]
    fn request_ids_increase() {
        let ids = RequestIds::new();
        assert_eq!(ids.next(), 1);
        assert_eq!(ids.next(), 2);
    }

    #[test]
    fn negotiation_follows_client_preference() {
        let client = [
            Compressor::Zstd { level: Some(3) },
            Compressor::Zlib { level: Some(6) },
            Compressor::Snappy,
        ];
        let server = [Compressor::Snappy, Compressor::Zlib { level: None }];
        assert_eq!(
            negotiate(&client, &server),
            Some(Compressor::Zlib { level: Some(6) })
        );
        assert_eq!(negotiate(&client, &[]), None);
        assert_eq!(negotiate(&[], &server), None);
    }

    #[test]
    fn compressor_names() {
        assert_eq!("ZLIB".parse::<Compressor>(), Ok(Compressor::Zlib { level: None }));
        assert!("lz4".parse::<Compressor>().is_err());
        assert_eq!(Compressor::Snappy.to_string(), "snappy");
    }
}
