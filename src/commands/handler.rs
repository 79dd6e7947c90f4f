//! Command Handler Module
//!
//! Resolves a decoded argument vector to a command, enforces its arity and
//! runs it against the key space.
//!
//! ## Supported Commands
//!
//! ### String Commands
//! - `GET key` - Get a key's value
//! - `SET key value` - Set a key, clearing any expiry
//!
//! ### Key Commands
//! - `EXPIRE key seconds` - Set expiry
//! - `TTL key` - Get remaining TTL in seconds
//! - `PERSIST key` - Remove expiry
//! - `DEL key` - Delete a key
//! - `EXISTS key` - Check if a key exists
//!
//! ### Server Commands
//! - `PING` - Test connection
//! - `ECHO message` - Echo message
//! - `DBSIZE` - Number of keys
//! - `QUIT` - Close the connection (handled before table lookup)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        execute()                            │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ quit check  │───>│  lookup()   │───>│ arity check │──┐   │
//! │  └─────────────┘    └─────────────┘    └─────────────┘  │   │
//! │                                                         ▼   │
//! │                                              handler(db, args)
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Arity counts the command name itself, and must match exactly.

use crate::protocol::Reply;
use crate::storage::{Db, Ttl, Value};
use tracing::trace;

const WRONG_TYPE: &str = "ERR Operation against a key holding the wrong kind of value";
const NOT_AN_INTEGER: &str = "ERR value is not an integer or out of range";

/// A command implementation. Receives the full argument vector, name
/// included, and the current time in milliseconds since the UNIX epoch.
pub type CommandFn = fn(&mut Db, &[Value], i64) -> Reply;

/// An entry of the command table.
#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub handler: CommandFn,
    pub arity: usize,
}

/// What the connection should do after a command.
#[derive(Debug)]
pub enum Outcome {
    /// Queue this reply and keep going.
    Reply(Reply),
    /// Close the connection without replying.
    Quit,
}

/// Every command the server understands.
#[rustfmt::skip]
pub static COMMAND_TABLE: &[Command] = &[
    Command { name: "get", handler: get_command, arity: 2 },
    Command { name: "set", handler: set_command, arity: 3 },
    Command { name: "expire", handler: expire_command, arity: 3 },
    Command { name: "ttl", handler: ttl_command, arity: 2 },
    Command { name: "persist", handler: persist_command, arity: 2 },
    Command { name: "del", handler: del_command, arity: 2 },
    Command { name: "exists", handler: exists_command, arity: 2 },
    Command { name: "ping", handler: ping_command, arity: 1 },
    Command { name: "echo", handler: echo_command, arity: 2 },
    Command { name: "dbsize", handler: dbsize_command, arity: 1 },
];

/// Case-insensitive exact-name lookup.
pub fn lookup(name: &[u8]) -> Option<&'static Command> {
    COMMAND_TABLE
        .iter()
        .find(|cmd| cmd.name.as_bytes().eq_ignore_ascii_case(name))
}

/// Executes one request. The argument values are released when `args` drops
/// at the end of the call.
pub fn execute(db: &mut Db, args: Vec<Value>, now_ms: i64) -> Outcome {
    let Some(name) = args.first().and_then(|a| a.string_bytes()) else {
        return Outcome::Reply(Reply::error("ERR empty command"));
    };

    if name.eq_ignore_ascii_case(b"quit") {
        return Outcome::Quit;
    }

    let Some(cmd) = lookup(&name) else {
        return Outcome::Reply(Reply::error(format!(
            "ERR unknown command '{}'",
            String::from_utf8_lossy(&name)
        )));
    };

    if args.len() != cmd.arity {
        return Outcome::Reply(Reply::error(format!(
            "ERR wrong number of arguments for '{}' command",
            String::from_utf8_lossy(&name)
        )));
    }

    trace!(command = cmd.name, args = args.len(), "Executing command");
    Outcome::Reply((cmd.handler)(db, &args, now_ms))
}

// ========================================================================
// String Commands
// ========================================================================

/// GET key
fn get_command(db: &mut Db, args: &[Value], now_ms: i64) -> Reply {
    match db.lookup_read(&args[1], now_ms) {
        None => Reply::null(),
        Some(val) if !val.is_string() => Reply::error(WRONG_TYPE),
        Some(val) => Reply::bulk(val),
    }
}

/// SET key value
fn set_command(db: &mut Db, args: &[Value], _now_ms: i64) -> Reply {
    if !args[2].is_string() {
        return Reply::error(WRONG_TYPE);
    }
    db.set(args[1].clone(), args[2].clone());
    Reply::ok()
}

// ========================================================================
// Key Commands
// ========================================================================

/// EXPIRE key seconds
fn expire_command(db: &mut Db, args: &[Value], now_ms: i64) -> Reply {
    let Some(seconds) = args[2].as_int() else {
        return Reply::error(NOT_AN_INTEGER);
    };
    let when = now_ms.saturating_add(seconds.saturating_mul(1000));
    db.set_expire(args[1].clone(), when);
    Reply::ok()
}

/// TTL key
fn ttl_command(db: &mut Db, args: &[Value], now_ms: i64) -> Reply {
    match db.ttl(&args[1], now_ms) {
        Ttl::Missing => Reply::integer(-2),
        Ttl::Persistent => Reply::integer(-1),
        Ttl::Remaining(ms) => Reply::integer((ms + 500) / 1000),
    }
}

/// PERSIST key
fn persist_command(db: &mut Db, args: &[Value], now_ms: i64) -> Reply {
    Reply::integer(i64::from(db.persist(&args[1], now_ms)))
}

/// DEL key
fn del_command(db: &mut Db, args: &[Value], _now_ms: i64) -> Reply {
    Reply::integer(i64::from(db.delete(&args[1])))
}

/// EXISTS key
fn exists_command(db: &mut Db, args: &[Value], now_ms: i64) -> Reply {
    Reply::integer(i64::from(db.exists(&args[1], now_ms)))
}

// ========================================================================
// Server Commands
// ========================================================================

fn ping_command(_db: &mut Db, _args: &[Value], _now_ms: i64) -> Reply {
    Reply::pong()
}

fn echo_command(_db: &mut Db, args: &[Value], _now_ms: i64) -> Reply {
    Reply::bulk(args[1].clone())
}

fn dbsize_command(db: &mut Db, _args: &[Value], _now_ms: i64) -> Reply {
    Reply::integer(db.len() as i64)
}
