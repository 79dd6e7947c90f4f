//! Command Handler Module
//!
//! This module implements the command processing layer. It receives decoded
//! argument vectors, executes them against the key space, and returns the
//! reply to queue.
//!
//! ## Architecture
//!
//! ```text
//! Client Request
//!       │
//!       ▼
//! ┌─────────────────┐
//! │    Decoder      │  (protocol module)
//! └────────┬────────┘
//!          │ Vec<Value>
//!          ▼
//! ┌─────────────────┐
//! │   execute()     │  (this module)
//! │                 │
//! │  - Lookup       │
//! │  - Arity check  │
//! │  - Run handler  │
//! └────────┬────────┘
//!          │
//!          ▼
//! ┌─────────────────┐
//! │       Db        │  (storage module)
//! └─────────────────┘
//! ```
//!
//! ## Supported Commands
//!
//! - String: `GET`, `SET`
//! - Keys: `EXPIRE`, `TTL`, `PERSIST`, `DEL`, `EXISTS`
//! - Server: `PING`, `ECHO`, `DBSIZE`, `QUIT`

pub mod handler;

pub use handler::{execute, lookup, Command, CommandFn, Outcome, COMMAND_TABLE};
