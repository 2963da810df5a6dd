//! RESP (REdis Serialization Protocol) client codec
//!
//! Encodes commands as RESP2 arrays of bulk strings and reads server
//! replies from any async byte stream.

mod encoder;
mod reader;

pub use encoder::{encode, encode_to_vec, write_value};
pub use reader::{ReplyReader, DEFAULT_MAX_REPLY_SIZE};

use bytes::Bytes;
use std::io;

/// RESP data type
#[derive(Debug, Clone, PartialEq)]
pub enum RespValue {
    /// Simple string: +OK\r\n
    SimpleString(Bytes),
    /// Error: -ERR message\r\n
    Error(Bytes),
    /// Integer: :123\r\n
    Integer(i64),
    /// Bulk string: $5\r\nhello\r\n
    BulkString(Option<Bytes>),
    /// Array: *2\r\n$3\r\nGET\r\n$3\r\nkey\r\n
    Array(Vec<RespValue>),
    /// Null: $-1\r\n or *-1\r\n
    Null,
}

impl RespValue {
    /// Build a command frame (array of bulk strings)
    pub fn command<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: AsRef<[u8]>,
    {
        RespValue::Array(
            args.into_iter()
                .map(|arg| RespValue::BulkString(Some(Bytes::copy_from_slice(arg.as_ref()))))
                .collect(),
        )
    }

    /// Text payload of a simple or bulk string (lossy UTF-8)
    pub fn as_text(&self) -> Option<String> {
        match self {
            RespValue::SimpleString(s) | RespValue::BulkString(Some(s)) => {
                Some(String::from_utf8_lossy(s).into_owned())
            }
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            RespValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn into_array(self) -> Option<Vec<RespValue>> {
        match self {
            RespValue::Array(items) => Some(items),
            _ => None,
        }
    }

    /// Turn a server error reply into `RespError::Server`
    pub fn into_result(self) -> Result<RespValue, RespError> {
        match self {
            RespValue::Error(msg) => Err(RespError::Server(
                String::from_utf8_lossy(&msg).into_owned(),
            )),
            other => Ok(other),
        }
    }
}

/// RESP codec error
#[derive(Debug, thiserror::Error)]
pub enum RespError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid RESP format: {0}")]
    InvalidFormat(String),
    #[error("Unexpected end of input")]
    UnexpectedEof,
    #[error("Reply too large: {0} bytes (max: {1} bytes)")]
    ReplyTooLarge(usize, usize),
    #[error("Invalid RESP type: {0}")]
    InvalidType(u8),
    #[error("Server error: {0}")]
    Server(String),
}
