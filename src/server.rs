//! Server Context
//!
//! Owns everything the event loop callbacks touch: the listening socket,
//! the client table and the key space. The reactor hands `&mut Server` to
//! every callback, so there is no global state and no locking.
//!
//! ```text
//!   listener (Token 0) ── readable ──> on_accept ──> Client (Token n)
//!                                                       │
//!   Client ── readable ──> on_readable ── replies queued ┤
//!                                                       ▼
//!   Client ── writable ──> on_writable ── drained ──> drop writability
//!
//!   cron timer (100ms) ──> on_cron ──> active expiry + rehash steps
//! ```

use crate::config::Config;
use crate::connection::{Client, ClientStats, ConnectionError, Flow, ReadEvent};
use crate::reactor::{Direction, EventLoop, ReactorError, TimerId, TimerKind};
use crate::storage::{expiry, unix_time_ms, Db, ExpiryConfig};
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Token of the listening socket. Clients are numbered from 1.
pub const LISTENER_TOKEN: Token = Token(0);

/// Pending connection queue length of the listening socket.
pub const BACKLOG: i32 = 64;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("reactor error: {0}")]
    Reactor(#[from] ReactorError),
}

/// Why a client was torn down.
#[derive(Debug)]
enum CloseReason {
    Quit,
    Error(ConnectionError),
}

#[derive(Debug)]
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    clients: HashMap<Token, Client>,
    db: Db,
    stats: ClientStats,
    next_token: usize,
    expiry: ExpiryConfig,
}

impl Server {
    /// Binds the listening socket. Nothing is registered until
    /// [`install`](Self::install).
    pub fn bind(addr: SocketAddr) -> Result<Self, ServerError> {
        let listener = listen(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        Ok(Self {
            listener,
            local_addr,
            clients: HashMap::new(),
            db: Db::new(),
            stats: ClientStats::new(),
            next_token: LISTENER_TOKEN.0 + 1,
            expiry: ExpiryConfig::default(),
        })
    }

    pub fn with_expiry_config(mut self, expiry: ExpiryConfig) -> Self {
        self.expiry = expiry;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn stats(&self) -> &ClientStats {
        &self.stats
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Registers the listener and the cron timer with `el`.
    pub fn install(&mut self, el: &mut EventLoop<Server>) -> Result<(), ReactorError> {
        el.register(
            &mut self.listener,
            LISTENER_TOKEN,
            Direction::Readable,
            on_accept,
        )?;
        el.add_timer(TimerKind::Repeating, self.expiry.interval, on_cron);
        Ok(())
    }

    fn accept_client(&mut self, el: &mut EventLoop<Server>, stream: TcpStream, addr: SocketAddr) {
        if let Err(e) = stream.set_nodelay(true) {
            warn!(client = %addr, error = %e, "Failed to set TCP_NODELAY");
        }

        let token = Token(self.next_token);
        self.next_token += 1;

        let mut client = Client::new(token, stream, addr);
        if let Err(e) = el.register(client.stream_mut(), token, Direction::Readable, on_readable) {
            warn!(client = %addr, error = %e, "Failed to register client");
            return;
        }

        self.clients.insert(token, client);
        self.stats.connection_opened();
        debug!(
            client = %addr,
            token = token.0,
            active = self.stats.active_connections,
            "Client connected"
        );
    }

    /// Reads and processes until the socket would block.
    fn service_readable(&mut self, token: Token) -> Result<Flow, ConnectionError> {
        let Some(client) = self.clients.get_mut(&token) else {
            return Ok(Flow::Continue);
        };

        loop {
            match client.read_once()? {
                ReadEvent::Data(n) => {
                    self.stats.bytes_read(n);
                    let flow =
                        client.process_query_buffer(&mut self.db, unix_time_ms(), &mut self.stats)?;
                    if flow == Flow::Close {
                        return Ok(Flow::Close);
                    }
                }
                ReadEvent::WouldBlock => return Ok(Flow::Continue),
                ReadEvent::Eof => return Err(ConnectionError::Closed),
            }
        }
    }

    /// Flushes replies. Returns true once the queue is empty.
    fn service_writable(&mut self, token: Token) -> Result<bool, ConnectionError> {
        let Some(client) = self.clients.get_mut(&token) else {
            return Ok(true);
        };
        let progress = client.write_replies()?;
        self.stats.bytes_written(progress.written);
        Ok(progress.drained)
    }

    fn want_writable(&mut self, el: &mut EventLoop<Server>, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        if !client.has_pending_replies() {
            return;
        }
        if let Err(e) = el.register(client.stream_mut(), token, Direction::Writable, on_writable) {
            self.free_client(el, token, CloseReason::Error(reactor_io(e)));
        }
    }

    fn drop_writable(&mut self, el: &mut EventLoop<Server>, token: Token) {
        let Some(client) = self.clients.get_mut(&token) else {
            return;
        };
        if let Err(e) = el.unregister(client.stream_mut(), token, Direction::Writable) {
            self.free_client(el, token, CloseReason::Error(reactor_io(e)));
        }
    }

    fn free_client(&mut self, el: &mut EventLoop<Server>, token: Token, reason: CloseReason) {
        let Some(mut client) = self.clients.remove(&token) else {
            return;
        };
        for direction in [Direction::Readable, Direction::Writable] {
            if let Err(e) = el.unregister(client.stream_mut(), token, direction) {
                warn!(client = %client.addr(), error = %e, "Failed to unregister client");
            }
        }
        self.stats.connection_closed();

        match reason {
            CloseReason::Quit => {
                debug!(client = %client.addr(), "Client quit");
            }
            CloseReason::Error(ConnectionError::Closed) => {
                debug!(client = %client.addr(), "Client disconnected");
            }
            CloseReason::Error(ConnectionError::Protocol(e)) => {
                debug!(client = %client.addr(), error = %e, "Closing client on protocol error");
            }
            CloseReason::Error(ConnectionError::Io(e)) => {
                warn!(client = %client.addr(), error = %e, "Closing client on I/O error");
            }
        }
    }

    fn cron(&mut self) {
        let report = expiry::run_cycle(&mut self.db, &self.expiry, unix_time_ms());
        trace!(
            expired = report.expired,
            keys = report.keys_remaining,
            clients = self.clients.len(),
            "Cron"
        );
    }
}

/// Opens a non-blocking listener on `addr` with a [`BACKLOG`]-deep queue.
fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

fn reactor_io(e: ReactorError) -> ConnectionError {
    match e {
        ReactorError::Io { source, .. } => ConnectionError::Io(source),
    }
}

fn on_accept(el: &mut EventLoop<Server>, server: &mut Server, _token: Token) {
    loop {
        match server.listener.accept() {
            Ok((stream, addr)) => server.accept_client(el, stream, addr),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!(error = %e, "Accept failed");
                break;
            }
        }
    }
}

fn on_readable(el: &mut EventLoop<Server>, server: &mut Server, token: Token) {
    match server.service_readable(token) {
        Ok(Flow::Continue) => server.want_writable(el, token),
        Ok(Flow::Close) => server.free_client(el, token, CloseReason::Quit),
        Err(e) => server.free_client(el, token, CloseReason::Error(e)),
    }
}

fn on_writable(el: &mut EventLoop<Server>, server: &mut Server, token: Token) {
    match server.service_writable(token) {
        Ok(true) => server.drop_writable(el, token),
        Ok(false) => {}
        Err(e) => server.free_client(el, token, CloseReason::Error(e)),
    }
}

fn on_cron(_el: &mut EventLoop<Server>, server: &mut Server, _id: TimerId) {
    server.cron();
}

/// Binds `0.0.0.0:<port>` and runs the event loop until the process is killed.
pub fn serve(config: &Config) -> Result<(), ServerError> {
    let mut server = Server::bind(config.bind_address())?;
    let mut el = EventLoop::new()?;
    server.install(&mut el)?;

    info!(addr = %server.local_addr(), "Listening");
    el.run(&mut server)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    /// Runs a server on a background thread and returns its address.
    fn start_server(expiry: ExpiryConfig) -> SocketAddr {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let mut server = Server::bind("127.0.0.1:0".parse().unwrap())
                .unwrap()
                .with_expiry_config(expiry);
            let mut el = EventLoop::new().unwrap();
            server.install(&mut el).unwrap();
            tx.send(server.local_addr()).unwrap();
            el.run(&mut server).unwrap();
        });
        rx.recv().unwrap()
    }

    fn connect(addr: SocketAddr) -> std::net::TcpStream {
        let stream = std::net::TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    fn expect(stream: &mut std::net::TcpStream, expected: &[u8]) {
        let mut buf = vec![0u8; expected.len()];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(
            String::from_utf8_lossy(&buf),
            String::from_utf8_lossy(expected)
        );
    }

    fn expect_eof(stream: &mut std::net::TcpStream) {
        let mut buf = [0u8; 64];
        loop {
            match stream.read(&mut buf) {
                Ok(0) => return,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => return,
                Err(e) => panic!("expected EOF, got {e}"),
            }
        }
    }

    #[test]
    fn test_set_then_get() {
        let addr = start_server(ExpiryConfig::default());
        let mut c = connect(addr);

        c.write_all(b"*3\r\n$3\r\nSET\r\n$3\r\nfoo\r\n$3\r\nbar\r\n")
            .unwrap();
        expect(&mut c, b"+OK\r\n");

        c.write_all(b"GET foo\r\n").unwrap();
        expect(&mut c, b"$3\r\nbar\r\n");

        c.write_all(b"GET missing\r\n").unwrap();
        expect(&mut c, b"$-1\r\n");
    }

    #[test]
    fn test_pipelined_replies_in_order() {
        let addr = start_server(ExpiryConfig::default());
        let mut c = connect(addr);

        c.write_all(b"SET a 1\r\nSET b 2\r\nGET b\r\nGET a\r\nPING\r\nDBSIZE\r\n")
            .unwrap();
        expect(&mut c, b"+OK\r\n+OK\r\n$1\r\n2\r\n$1\r\n1\r\n+PONG\r\n:2\r\n");
    }

    #[test]
    fn test_request_split_across_writes() {
        let addr = start_server(ExpiryConfig::default());
        let mut c = connect(addr);

        c.write_all(b"*2\r\n$4\r\nEC").unwrap();
        thread::sleep(Duration::from_millis(20));
        c.write_all(b"HO\r\n$5\r\nhel").unwrap();
        thread::sleep(Duration::from_millis(20));
        c.write_all(b"lo\r\n").unwrap();
        expect(&mut c, b"$5\r\nhello\r\n");
    }

    #[test]
    fn test_quit_closes_connection() {
        let addr = start_server(ExpiryConfig::default());
        let mut c = connect(addr);

        c.write_all(b"QUIT\r\n").unwrap();
        expect_eof(&mut c);
    }

    #[test]
    fn test_protocol_error_closes_connection() {
        let addr = start_server(ExpiryConfig::default());
        let mut c = connect(addr);

        c.write_all(b"*1\r\n#3\r\nfoo\r\n").unwrap();
        expect_eof(&mut c);

        // The server keeps serving other clients.
        let mut other = connect(addr);
        other.write_all(b"PING\r\n").unwrap();
        expect(&mut other, b"+PONG\r\n");
    }

    #[test]
    fn test_command_error_keeps_connection_open() {
        let addr = start_server(ExpiryConfig::default());
        let mut c = connect(addr);

        c.write_all(b"FLY\r\nPING\r\n").unwrap();
        expect(&mut c, b"-ERR unknown command 'FLY'\r\n+PONG\r\n");
    }

    #[test]
    fn test_large_pipelined_replies() {
        let addr = start_server(ExpiryConfig::default());
        let mut c = connect(addr);

        let value = "v".repeat(4000);
        c.write_all(format!("SET big {value}\r\n").as_bytes())
            .unwrap();
        expect(&mut c, b"+OK\r\n");

        // Far more reply bytes than a socket buffer holds, sent before
        // reading anything back, so the server must resume partial writes.
        let count = 500;
        let request = "GET big\r\n".repeat(count);
        let writer = {
            let mut w = c.try_clone().unwrap();
            thread::spawn(move || w.write_all(request.as_bytes()).unwrap())
        };

        let reply = format!("$4000\r\n{value}\r\n");
        let mut buf = vec![0u8; reply.len() * count];
        c.read_exact(&mut buf).unwrap();
        writer.join().unwrap();
        for chunk in buf.chunks(reply.len()) {
            assert_eq!(chunk, reply.as_bytes());
        }
    }

    #[test]
    fn test_expire_zero_then_get_is_missing() {
        let addr = start_server(ExpiryConfig::default());
        let mut c = connect(addr);

        c.write_all(b"SET k v\r\nEXPIRE k 0\r\nGET k\r\n").unwrap();
        expect(&mut c, b"+OK\r\n+OK\r\n$-1\r\n");
    }

    #[test]
    fn test_expire_in_future_keeps_value() {
        let addr = start_server(ExpiryConfig::default());
        let mut c = connect(addr);

        c.write_all(b"SET k v\r\nEXPIRE k 100\r\nGET k\r\nTTL k\r\n")
            .unwrap();
        expect(&mut c, b"+OK\r\n+OK\r\n$1\r\nv\r\n:100\r\n");
    }

    #[test]
    fn test_sweeper_removes_expired_keys() {
        let addr = start_server(ExpiryConfig {
            interval: Duration::from_millis(10),
            ..ExpiryConfig::default()
        });
        let mut c = connect(addr);

        c.write_all(b"SET a 1\r\nSET b 2\r\nEXPIRE a 0\r\nEXPIRE b 0\r\nSET c 3\r\n")
            .unwrap();
        expect(&mut c, b"+OK\r\n+OK\r\n+OK\r\n+OK\r\n+OK\r\n");

        // DBSIZE does not touch individual keys, so only the cron can
        // bring the count down.
        let mut size = Vec::new();
        for _ in 0..100 {
            thread::sleep(Duration::from_millis(20));
            c.write_all(b"DBSIZE\r\n").unwrap();
            let mut buf = [0u8; 4];
            c.read_exact(&mut buf).unwrap();
            size = buf.to_vec();
            if size == b":1\r\n" {
                break;
            }
        }
        assert_eq!(size, b":1\r\n");
    }

    #[test]
    fn test_clients_share_key_space() {
        let addr = start_server(ExpiryConfig::default());
        let mut a = connect(addr);
        let mut b = connect(addr);

        a.write_all(b"SET shared yes\r\n").unwrap();
        expect(&mut a, b"+OK\r\n");

        b.write_all(b"GET shared\r\n").unwrap();
        expect(&mut b, b"$3\r\nyes\r\n");

        drop(a);
        b.write_all(b"EXISTS shared\r\n").unwrap();
        expect(&mut b, b":1\r\n");
    }

    #[test]
    fn test_listen_is_non_blocking_and_accepts() {
        let mut listener = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = listener.local_addr().unwrap();
        assert!(matches!(
            listener.accept(),
            Err(e) if e.kind() == io::ErrorKind::WouldBlock
        ));

        // A full backlog of clients can connect before anything is accepted.
        let peers: Vec<_> = (0..BACKLOG).map(|_| connect(addr)).collect();
        let mut accepted = 0;
        for _ in 0..200 {
            match listener.accept() {
                Ok(_) => accepted += 1,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    if accepted == peers.len() {
                        break;
                    }
                    thread::sleep(Duration::from_millis(5));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        }
        assert_eq!(accepted, peers.len());
    }

    #[test]
    fn test_bind_error_names_address() {
        let first = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let taken = first.local_addr();
        let err = Server::bind(taken).unwrap_err();
        assert!(matches!(err, ServerError::Bind { addr, .. } if addr == taken));
    }

    #[test]
    fn test_accept_and_teardown_bookkeeping() {
        let mut server = Server::bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let mut el = EventLoop::new().unwrap();
        server.install(&mut el).unwrap();
        assert_eq!(el.registration_count(), 1);
        assert_eq!(el.timer_count(), 1);

        let mut peer = connect(server.local_addr());
        for _ in 0..100 {
            el.run_once(&mut server).unwrap();
            if server.client_count() == 1 {
                break;
            }
        }
        assert_eq!(server.client_count(), 1);
        assert_eq!(server.stats().connections_accepted, 1);
        assert!(el.is_registered(Token(1), Direction::Readable));

        peer.write_all(b"SET k v\r\nQUIT\r\n").unwrap();
        for _ in 0..100 {
            el.run_once(&mut server).unwrap();
            if server.client_count() == 0 {
                break;
            }
        }
        assert_eq!(server.client_count(), 0);
        assert_eq!(server.stats().active_connections, 0);
        assert_eq!(server.db().len(), 1);
        // Only the listener is left.
        assert_eq!(el.registration_count(), 1);
        assert!(!el.is_registered(Token(1), Direction::Readable));
        assert!(!el.is_registered(Token(1), Direction::Writable));
    }
}
