//! Reply Types
//!
//! This module defines the replies the server writes back to clients. The
//! wire format is the Redis reply encoding: each reply starts with a type
//! prefix byte and ends with CRLF.
//!
//! ## Reply Format
//!
//! - `+` Status: `+OK\r\n`
//! - `-` Error: `-ERR unknown command 'foo'\r\n`
//! - `:` Integer: `:1000\r\n`
//! - `$` Bulk: `$5\r\nhello\r\n`
//! - Null bulk: `$-1\r\n`
//!
//! A bulk reply holds a [`Value`] handle rather than a copy of the bytes, so
//! a `GET` reply shares the object stored in the key space until it has been
//! written out.

use crate::storage::Value;
use std::fmt;

/// The CRLF terminator
pub const CRLF: &[u8] = b"\r\n";

/// Type prefixes shared by requests and replies
pub mod prefix {
    pub const STATUS: u8 = b'+';
    pub const ERROR: u8 = b'-';
    pub const INTEGER: u8 = b':';
    pub const BULK: u8 = b'$';
    pub const MULTIBULK: u8 = b'*';
}

/// A reply queued for a client.
#[derive(Debug, Clone)]
pub enum Reply {
    /// Single-line status. Cannot contain CRLF.
    /// Format: `+<status>\r\n`
    Status(&'static str),

    /// Error message.
    /// Format: `-<message>\r\n`
    Error(String),

    /// 64-bit signed integer.
    /// Format: `:<integer>\r\n`
    Integer(i64),

    /// Binary-safe string backed by a shared value.
    /// Format: `$<length>\r\n<data>\r\n`
    Bulk(Value),

    /// Null bulk string.
    /// Format: `$-1\r\n`
    Null,
}

impl Reply {
    /// Common response for successful operations
    pub fn ok() -> Self {
        Reply::Status("OK")
    }

    /// Common response for PING
    pub fn pong() -> Self {
        Reply::Status("PONG")
    }

    /// Creates a new error response.
    ///
    /// # Example
    /// ```
    /// use emberkv::protocol::Reply;
    /// let err = Reply::error("ERR unknown command 'foo'");
    /// assert_eq!(err.serialize(), b"-ERR unknown command 'foo'\r\n");
    /// ```
    pub fn error(s: impl Into<String>) -> Self {
        Reply::Error(s.into())
    }

    pub fn integer(n: i64) -> Self {
        Reply::Integer(n)
    }

    /// Creates a bulk reply sharing `value`.
    pub fn bulk(value: Value) -> Self {
        Reply::Bulk(value)
    }

    pub fn null() -> Self {
        Reply::Null
    }

    /// Serializes the reply to bytes for sending over the wire.
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        self.serialize_into(&mut buf);
        buf
    }

    /// Serializes the reply into an existing buffer.
    pub fn serialize_into(&self, buf: &mut Vec<u8>) {
        match self {
            Reply::Status(s) => {
                buf.push(prefix::STATUS);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Error(s) => {
                buf.push(prefix::ERROR);
                buf.extend_from_slice(s.as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Integer(n) => {
                buf.push(prefix::INTEGER);
                buf.extend_from_slice(n.to_string().as_bytes());
                buf.extend_from_slice(CRLF);
            }
            Reply::Bulk(value) => match value.string_bytes() {
                Some(data) => {
                    buf.push(prefix::BULK);
                    buf.extend_from_slice(data.len().to_string().as_bytes());
                    buf.extend_from_slice(CRLF);
                    buf.extend_from_slice(&data);
                    buf.extend_from_slice(CRLF);
                }
                // Only string values are ever put in a bulk reply.
                None => Reply::Null.serialize_into(buf),
            },
            Reply::Null => {
                buf.push(prefix::BULK);
                buf.extend_from_slice(b"-1");
                buf.extend_from_slice(CRLF);
            }
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Reply::Null)
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Reply::Error(_))
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Reply::Status(s) => write!(f, "{}", s),
            Reply::Error(s) => write!(f, "(error) {}", s),
            Reply::Integer(n) => write!(f, "(integer) {}", n),
            Reply::Bulk(value) => match value.string_bytes() {
                Some(data) => match std::str::from_utf8(&data) {
                    Ok(s) => write!(f, "\"{}\"", s),
                    Err(_) => write!(f, "(binary data, {} bytes)", data.len()),
                },
                None => write!(f, "(nil)"),
            },
            Reply::Null => write!(f, "(nil)"),
        }
    }
}
