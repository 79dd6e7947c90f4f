//! Connection Handler Module
//!
//! This module holds the per-client state the server keeps between
//! readiness events.
//!
//! ## Connection Lifecycle
//!
//! ```text
//! 1. Client accepted, registered for readability
//!        │
//!        ▼
//! 2. ┌──────────────────────────────────┐
//!    │  Readable                        │
//!    │    read chunk into query buffer  │
//!    │    decode + execute commands     │
//!    │    queue replies                 │
//!    │    (repeat until WouldBlock)     │
//!    └───────────────┬──────────────────┘
//!                    │ replies queued
//!                    ▼
//! 3. ┌──────────────────────────────────┐
//!    │  Writable                        │
//!    │    flush reply queue             │
//!    │    drained -> drop writability   │
//!    └──────────────────────────────────┘
//!        │
//!        ▼
//! 4. EOF / I/O error / protocol error / QUIT
//!        │
//!        ▼
//! 5. Unregistered and dropped
//! ```
//!
//! ## Buffer Management
//!
//! Before every read the query buffer is grown by one bulk's worth of
//! headroom and the socket reads into the tail. Decoded arguments are copied
//! out and consumed bytes are advanced past, so the allocation is reused by
//! the next read.

use crate::commands::{self, Outcome};
use crate::connection::reply::{ReplyQueue, WriteProgress};
use crate::protocol::{Decoder, ProtocolError, MAX_BULK_SIZE};
use crate::storage::Db;
use bytes::BytesMut;
use mio::net::TcpStream;
use mio::Token;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::trace;

/// Statistics for connection handling
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ClientStats {
    /// Total number of connections accepted
    pub connections_accepted: u64,
    /// Currently active connections
    pub active_connections: u64,
    /// Total commands processed
    pub commands_processed: u64,
    /// Total bytes read
    pub bytes_read: u64,
    /// Total bytes written
    pub bytes_written: u64,
}

impl ClientStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_opened(&mut self) {
        self.connections_accepted += 1;
        self.active_connections += 1;
    }

    pub fn connection_closed(&mut self) {
        self.active_connections = self.active_connections.saturating_sub(1);
    }

    pub fn command_processed(&mut self) {
        self.commands_processed += 1;
    }

    pub fn bytes_read(&mut self, count: usize) {
        self.bytes_read += count as u64;
    }

    pub fn bytes_written(&mut self, count: usize) {
        self.bytes_written += count as u64;
    }
}

/// Errors that end a connection.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// I/O error (network issue)
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed request
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Client closed its end
    #[error("Client disconnected")]
    Closed,
}

/// Result of a single read attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadEvent {
    /// This many bytes were appended to the query buffer.
    Data(usize),
    /// Nothing more to read until the next readiness event.
    WouldBlock,
    /// The peer closed its end.
    Eof,
}

/// Whether the connection stays open after processing input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// A connected client.
#[derive(Debug)]
pub struct Client<S = TcpStream> {
    token: Token,
    stream: S,
    addr: SocketAddr,
    query_buf: BytesMut,
    decoder: Decoder,
    replies: ReplyQueue,
}

impl<S: Read + Write> Client<S> {
    pub fn new(token: Token, stream: S, addr: SocketAddr) -> Self {
        Self {
            token,
            stream,
            addr,
            query_buf: BytesMut::new(),
            decoder: Decoder::new(),
            replies: ReplyQueue::new(),
        }
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn has_pending_replies(&self) -> bool {
        !self.replies.is_empty()
    }

    pub fn pending_replies(&self) -> usize {
        self.replies.len()
    }

    /// Arguments of a partially received command.
    pub fn pending_args(&self) -> usize {
        self.decoder.pending_args()
    }

    /// Reads one chunk from the socket into the query buffer.
    pub fn read_once(&mut self) -> io::Result<ReadEvent> {
        let len = self.query_buf.len();
        self.query_buf.resize(len + MAX_BULK_SIZE, 0);

        loop {
            match self.stream.read(&mut self.query_buf[len..]) {
                Ok(0) => {
                    self.query_buf.truncate(len);
                    return Ok(ReadEvent::Eof);
                }
                Ok(n) => {
                    self.query_buf.truncate(len + n);
                    trace!(client = %self.addr, bytes = n, "Read data");
                    return Ok(ReadEvent::Data(n));
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.query_buf.truncate(len);
                    if e.kind() == io::ErrorKind::WouldBlock {
                        return Ok(ReadEvent::WouldBlock);
                    }
                    return Err(e);
                }
            }
        }
    }

    /// Decodes and executes every complete command in the query buffer,
    /// queueing the replies.
    pub fn process_query_buffer(
        &mut self,
        db: &mut Db,
        now_ms: i64,
        stats: &mut ClientStats,
    ) -> Result<Flow, ProtocolError> {
        while let Some(args) = self.decoder.decode(&mut self.query_buf)? {
            if args.is_empty() {
                continue;
            }
            stats.command_processed();
            match commands::execute(db, args, now_ms) {
                Outcome::Reply(reply) => self.replies.push(reply),
                Outcome::Quit => {
                    trace!(client = %self.addr, "Client sent QUIT");
                    return Ok(Flow::Close);
                }
            }
        }
        trace!(
            client = %self.addr,
            buffered = self.query_buf.len(),
            replies = self.replies.len(),
            "Query buffer processed"
        );
        Ok(Flow::Continue)
    }

    /// Flushes queued replies until the socket blocks or the queue drains.
    pub fn write_replies(&mut self) -> io::Result<WriteProgress> {
        let progress = self.replies.write_to(&mut self.stream)?;
        trace!(
            client = %self.addr,
            bytes = progress.written,
            drained = progress.drained,
            "Sent replies"
        );
        Ok(progress)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::value::instrument;
    use crate::storage::{Payload, Value};
    use std::collections::VecDeque;

    const NOW: i64 = 1_700_000_000_000;

    /// In-memory socket: reads pop scripted chunks, writes append to `out`.
    #[derive(Default)]
    struct MockStream {
        input: VecDeque<Vec<u8>>,
        eof: bool,
        out: Vec<u8>,
    }

    impl Read for MockStream {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.input.pop_front() {
                Some(mut chunk) => {
                    let n = chunk.len().min(buf.len());
                    buf[..n].copy_from_slice(&chunk[..n]);
                    if n < chunk.len() {
                        self.input.push_front(chunk.split_off(n));
                    }
                    Ok(n)
                }
                None if self.eof => Ok(0),
                None => Err(io::ErrorKind::WouldBlock.into()),
            }
        }
    }

    impl Write for MockStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.out.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn client(chunks: &[&[u8]]) -> Client<MockStream> {
        let stream = MockStream {
            input: chunks.iter().map(|c| c.to_vec()).collect(),
            ..Default::default()
        };
        Client::new(Token(1), stream, "127.0.0.1:5000".parse().unwrap())
    }

    /// Reads until WouldBlock/EOF, processing after every chunk.
    fn pump(client: &mut Client<MockStream>, db: &mut Db) -> Result<Flow, ProtocolError> {
        let mut stats = ClientStats::new();
        loop {
            match client.read_once().unwrap() {
                ReadEvent::Data(_) => {
                    if client.process_query_buffer(db, NOW, &mut stats)? == Flow::Close {
                        return Ok(Flow::Close);
                    }
                }
                ReadEvent::WouldBlock | ReadEvent::Eof => return Ok(Flow::Continue),
            }
        }
    }

    #[test]
    fn test_read_once_events() {
        let mut c = client(&[b"PING\r\n"]);
        assert_eq!(c.read_once().unwrap(), ReadEvent::Data(6));
        assert_eq!(c.read_once().unwrap(), ReadEvent::WouldBlock);
        c.stream_mut().eof = true;
        assert_eq!(c.read_once().unwrap(), ReadEvent::Eof);
    }

    #[test]
    fn test_pipelined_commands_reply_in_order() {
        let mut db = Db::new();
        let mut c = client(&[b"SET a 1\r\n*2\r\n$3\r\nGET\r\n$1\r\na\r\nPING\r\n"]);

        assert_eq!(pump(&mut c, &mut db).unwrap(), Flow::Continue);
        assert_eq!(c.pending_replies(), 3);

        let progress = c.write_replies().unwrap();
        assert!(progress.drained);
        assert_eq!(c.stream_mut().out, b"+OK\r\n$1\r\n1\r\n+PONG\r\n");
    }

    #[test]
    fn test_command_split_across_reads() {
        let mut db = Db::new();
        let mut c = client(&[b"*3\r\n$3\r\nSE", b"T\r\n$1\r\nk\r\n$", b"1\r\nv\r\n"]);

        pump(&mut c, &mut db).unwrap();
        assert_eq!(c.pending_replies(), 1);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_large_bulk_spans_many_reads() {
        let mut db = Db::new();
        let payload = vec![b'x'; MAX_BULK_SIZE];
        let mut request =
            format!("*3\r\n$3\r\nSET\r\n$3\r\nbig\r\n${}\r\n", payload.len()).into_bytes();
        request.extend_from_slice(&payload);
        request.extend_from_slice(b"\r\n");
        let chunks: Vec<&[u8]> = request.chunks(1000).collect();

        let mut c = client(&chunks);
        pump(&mut c, &mut db).unwrap();
        let stored = db.lookup_read(&Value::from("big"), NOW).unwrap();
        assert_eq!(stored.string_bytes().unwrap().len(), MAX_BULK_SIZE);
    }

    #[test]
    fn test_stored_keys_do_not_pin_read_buffer() {
        let mut db = Db::new();
        let requests: Vec<Vec<u8>> = (0..1000)
            .map(|i| format!("SET k{:05} v\r\n", i).into_bytes())
            .collect();
        let chunks: Vec<&[u8]> = requests.iter().map(|r| r.as_slice()).collect();

        let mut c = client(&chunks);
        pump(&mut c, &mut db).unwrap();
        assert_eq!(db.len(), 1000);

        // One read buffer serves every request instead of one per stored key.
        assert!(c.query_buf.capacity() <= 2 * MAX_BULK_SIZE);

        // Each stored payload owns its allocation outright.
        for key in ["k00000", "k00500", "k00999"] {
            let val = db.lookup_read(&Value::from(key), NOW).unwrap();
            match val.payload() {
                Payload::Raw(bytes) => assert!(bytes.is_unique()),
                other => panic!("unexpected payload {other:?}"),
            }
        }
    }

    #[test]
    fn test_empty_commands_are_ignored() {
        let mut db = Db::new();
        let mut c = client(&[b"\r\n*0\r\nPING\r\n"]);
        pump(&mut c, &mut db).unwrap();
        assert_eq!(c.pending_replies(), 1);
    }

    #[test]
    fn test_quit_stops_processing() {
        let mut db = Db::new();
        let mut c = client(&[b"SET a 1\r\nQUIT\r\nSET b 2\r\n"]);

        assert_eq!(pump(&mut c, &mut db).unwrap(), Flow::Close);
        assert_eq!(db.len(), 1);
    }

    #[test]
    fn test_command_errors_keep_connection_open() {
        let mut db = Db::new();
        let mut c = client(&[b"NOPE\r\nGET\r\nPING\r\n"]);

        assert_eq!(pump(&mut c, &mut db).unwrap(), Flow::Continue);
        c.write_replies().unwrap();
        assert_eq!(
            c.stream_mut().out,
            [
                &b"-ERR unknown command 'NOPE'\r\n"[..],
                b"-ERR wrong number of arguments for 'GET' command\r\n",
                b"+PONG\r\n",
            ]
            .concat()
        );
    }

    #[test]
    fn test_protocol_error() {
        let mut db = Db::new();
        let mut c = client(&[b"*1\r\n#3\r\nfoo\r\n"]);
        assert_eq!(
            pump(&mut c, &mut db),
            Err(ProtocolError::ExpectedBulk(b'#'))
        );
    }

    #[test]
    fn test_stats_counted() {
        let mut db = Db::new();
        let mut stats = ClientStats::new();
        stats.connection_opened();

        let mut c = client(&[b"PING\r\nPING\r\n"]);
        if let ReadEvent::Data(n) = c.read_once().unwrap() {
            stats.bytes_read(n);
        }
        c.process_query_buffer(&mut db, NOW, &mut stats).unwrap();
        stats.bytes_written(c.write_replies().unwrap().written);
        stats.connection_closed();

        assert_eq!(
            stats,
            ClientStats {
                connections_accepted: 1,
                active_connections: 0,
                commands_processed: 2,
                bytes_read: 12,
                bytes_written: 14,
            }
        );
    }

    #[test]
    fn test_drop_releases_replies_and_pending_args() {
        let before = instrument::snapshot();
        {
            let mut db = Db::new();
            let mut c = client(&[b"SET k v\r\nGET k\r\n*3\r\n$3\r\nSET\r\n$1\r\nx\r\n"]);
            pump(&mut c, &mut db).unwrap();
            assert_eq!(c.pending_replies(), 2);
            assert_eq!(c.pending_args(), 2);
            drop(c);
            // Only the stored key and value remain.
            assert_eq!(instrument::live_since(before), 2);
        }
        assert_eq!(instrument::live_since(before), 0);
    }
}
