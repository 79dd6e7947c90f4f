//! Streaming Request Decoder
//!
//! Clients send commands in one of two framings:
//!
//! - **Inline**: a single line of space-separated words, `SET key value\r\n`
//! - **Multibulk**: `*<N>\r\n` followed by N bulk strings,
//!   `*3\r\n$3\r\nSET\r\n$3\r\nkey\r\n$5\r\nvalue\r\n`
//!
//! The first byte of a fresh request picks the framing: `*` means multibulk,
//! anything else is inline.
//!
//! ## Streaming
//!
//! Network reads deliver arbitrary fragments. The decoder keeps its progress
//! (framing, expected argument count, pending bulk length and the arguments
//! decoded so far) between calls, and consumes bytes from the query buffer
//! as soon as a header or argument is complete. A request split across any
//! number of reads decodes exactly like one delivered whole.
//!
//! Arguments are copied out of the query buffer. A value stored in the key
//! space must not keep the connection's read buffer alive.

use crate::protocol::types::{prefix, CRLF};
use crate::storage::Value;
use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

/// Longest inline request (or header line) accepted without a CRLF.
pub const MAX_INLINE_SIZE: usize = 4096;

/// Largest single bulk argument.
pub const MAX_BULK_SIZE: usize = 4096;

/// Largest multibulk argument count.
pub const MAX_MULTIBULK_LEN: i64 = 1024 * 1024;

/// Errors that can occur while decoding requests. All of them are fatal for
/// the connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// No CRLF within the inline size limit
    #[error("too big inline request: {len} bytes without CRLF (max: {max})")]
    InlineTooLong { len: usize, max: usize },

    /// The multibulk count is not a number
    #[error("invalid multibulk length: {0:?}")]
    InvalidMultibulkLength(String),

    /// The multibulk count exceeds the limit
    #[error("too many multibulk arguments: {0}")]
    MultibulkTooLong(i64),

    /// A bulk header did not start with `$`
    #[error("expected '$', got {0:#04x}")]
    ExpectedBulk(u8),

    /// Negative, non-numeric or oversized bulk length
    #[error("invalid bulk length: {0:?}")]
    InvalidBulkLength(String),

    /// A bulk payload was not followed by CRLF
    #[error("expected CRLF after bulk payload")]
    MissingCrlf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RequestKind {
    Inline,
    Multibulk,
}

/// Incremental decoder for one connection.
#[derive(Debug, Default)]
pub struct Decoder {
    kind: Option<RequestKind>,
    /// Declared argument count, once the multibulk header is read.
    multibulk_len: Option<usize>,
    /// Length of the bulk currently being read, once its header is read.
    bulk_len: Option<usize>,
    args: Vec<Value>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arguments decoded for the request in progress.
    pub fn pending_args(&self) -> usize {
        self.args.len()
    }

    /// True when no request is partially decoded.
    pub fn is_idle(&self) -> bool {
        self.kind.is_none()
    }

    /// Drops any partial request.
    pub fn reset(&mut self) {
        self.kind = None;
        self.multibulk_len = None;
        self.bulk_len = None;
        self.args.clear();
    }

    /// Attempts to decode one request from the front of `buf`.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(args))` - A complete request; `args` is empty for an empty
    ///   request, which the caller ignores
    /// - `Ok(None)` - Need more data; progress so far is kept
    /// - `Err(e)` - Protocol violation
    pub fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Value>>, ProtocolError> {
        let kind = match self.kind {
            Some(kind) => kind,
            None => {
                let Some(&first) = buf.first() else {
                    return Ok(None);
                };
                let kind = if first == prefix::MULTIBULK {
                    RequestKind::Multibulk
                } else {
                    RequestKind::Inline
                };
                self.kind = Some(kind);
                kind
            }
        };

        let result = match kind {
            RequestKind::Inline => self.decode_inline(buf),
            RequestKind::Multibulk => self.decode_multibulk(buf),
        };
        match result {
            Ok(None) => Ok(None),
            Ok(Some(args)) => {
                self.reset();
                Ok(Some(args))
            }
            Err(e) => {
                self.reset();
                Err(e)
            }
        }
    }

    fn decode_inline(&mut self, buf: &mut BytesMut) -> Result<Option<Vec<Value>>, ProtocolError> {
        let Some(line) = take_line(buf)? else {
            return Ok(None);
        };
        let args = line
            .split(|&b| b == b' ')
            .filter(|token| !token.is_empty())
            .map(|token| Value::string(Bytes::copy_from_slice(token)))
            .collect();
        Ok(Some(args))
    }

    fn decode_multibulk(
        &mut self,
        buf: &mut BytesMut,
    ) -> Result<Option<Vec<Value>>, ProtocolError> {
        let count = match self.multibulk_len {
            Some(count) => count,
            None => {
                let Some(line) = take_line(buf)? else {
                    return Ok(None);
                };
                let n = parse_number(&line[1..])
                    .ok_or_else(|| ProtocolError::InvalidMultibulkLength(lossy(&line[1..])))?;
                if n <= 0 {
                    return Ok(Some(Vec::new()));
                }
                if n > MAX_MULTIBULK_LEN {
                    return Err(ProtocolError::MultibulkTooLong(n));
                }
                let count = n as usize;
                self.multibulk_len = Some(count);
                self.args.reserve(count.min(1024));
                count
            }
        };

        while self.args.len() < count {
            let len = match self.bulk_len {
                Some(len) => len,
                None => {
                    let Some(line) = take_line(buf)? else {
                        return Ok(None);
                    };
                    match line.first() {
                        Some(&prefix::BULK) => {}
                        Some(&other) => return Err(ProtocolError::ExpectedBulk(other)),
                        None => return Err(ProtocolError::InvalidBulkLength(String::new())),
                    }
                    let len = parse_number(&line[1..])
                        .filter(|n| (0..=MAX_BULK_SIZE as i64).contains(n))
                        .ok_or_else(|| ProtocolError::InvalidBulkLength(lossy(&line[1..])))?;
                    let len = len as usize;
                    self.bulk_len = Some(len);
                    len
                }
            };

            if buf.len() < len + CRLF.len() {
                return Ok(None);
            }
            if &buf[len..len + CRLF.len()] != CRLF {
                return Err(ProtocolError::MissingCrlf);
            }
            let payload = Bytes::copy_from_slice(&buf[..len]);
            buf.advance(len + CRLF.len());
            self.args.push(Value::string(payload));
            self.bulk_len = None;
        }

        Ok(Some(std::mem::take(&mut self.args)))
    }
}

/// Copies one CRLF-terminated line off the front of `buf`, without the CRLF.
fn take_line(buf: &mut BytesMut) -> Result<Option<Vec<u8>>, ProtocolError> {
    match buf.windows(CRLF.len()).position(|w| w == CRLF) {
        Some(pos) => {
            let line = buf[..pos].to_vec();
            buf.advance(pos + CRLF.len());
            Ok(Some(line))
        }
        None if buf.len() > MAX_INLINE_SIZE => Err(ProtocolError::InlineTooLong {
            len: buf.len(),
            max: MAX_INLINE_SIZE,
        }),
        None => Ok(None),
    }
}

fn parse_number(digits: &[u8]) -> Option<i64> {
    std::str::from_utf8(digits).ok()?.parse().ok()
}

fn lossy(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}
