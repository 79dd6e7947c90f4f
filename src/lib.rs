//! # EmberKV - A Single-Threaded In-Memory Key-Value Server
//!
//! EmberKV speaks the Redis text protocol (inline and multibulk requests)
//! and serves every client from one thread. A readiness reactor multiplexes
//! the listening socket, all client sockets and a periodic cron timer.
//!
//! ## Features
//!
//! - **Reactor**: `mio`-based event loop with file events and timers
//! - **Incremental Rehashing**: the key space grows one bucket per step, so
//!   no single request pays for a full table resize
//! - **Pipelining**: any number of requests per read, replies in order
//! - **TTL Support**: lazy expiry on access plus a sampling sweeper
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                              EmberKV                                    │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐    │
//! │  │                     EventLoop<Server>                           │    │
//! │  │   listener readable ─ client readable ─ client writable ─ cron  │    │
//! │  └────────┬──────────────────┬──────────────────┬──────────┬───────┘    │
//! │           ▼                  ▼                  ▼          │            │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐     │            │
//! │  │   accept    │    │  Decoder    │    │ ReplyQueue  │     │            │
//! │  │             │    │  + execute  │    │  (partial   │     │            │
//! │  │             │    │             │    │   writes)   │     │            │
//! │  └─────────────┘    └──────┬──────┘    └─────────────┘     │            │
//! │                            ▼                               ▼            │
//! │                     ┌──────────────────────────────────────────────┐    │
//! │                     │  Db: data Dict + expires Dict                │    │
//! │                     │  (chained, incrementally rehashed)           │    │
//! │                     └──────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use emberkv::config::Config;
//!
//! let config = Config::load(None).unwrap();
//! emberkv::server::serve(&config).unwrap();
//! ```
//!
//! ## Supported Commands
//!
//! - `GET key`, `SET key value`
//! - `EXPIRE key seconds`, `TTL key`, `PERSIST key`
//! - `DEL key`, `EXISTS key`
//! - `PING`, `ECHO message`, `DBSIZE`, `QUIT`
//!
//! ## Module Overview
//!
//! - [`reactor`]: the event loop
//! - [`protocol`]: request decoder and reply encoding
//! - [`storage`]: values, dictionary, key space and expiry
//! - [`commands`]: command table and dispatch
//! - [`connection`]: per-client buffers and reply queue
//! - [`server`]: the server context and event handlers
//! - [`config`]: port resolution

pub mod commands;
pub mod config;
pub mod connection;
pub mod protocol;
pub mod reactor;
pub mod server;
pub mod storage;

// Re-export commonly used types for convenience
pub use config::{Config, ConfigError, DEFAULT_PORT};
pub use server::{serve, Server, ServerError};

/// Version of EmberKV
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
