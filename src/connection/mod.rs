//! Connection Handler Module
//!
//! This module manages individual client connections. There is no task per
//! client: every connection is a [`Client`] owned by the server and driven
//! by readiness callbacks on the single event loop thread.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 EventLoop (reactor)                         │
//! └──────────────┬───────────────────────────────┬──────────────┘
//!                │ readable                      │ writable
//!                ▼                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Client                                │
//! │                                                             │
//! │  ┌─────────────┐    ┌─────────────┐    ┌─────────────┐      │
//! │  │ query_buf   │───>│  Decoder    │───>│ execute cmd │      │
//! │  └─────────────┘    └─────────────┘    └──────┬──────┘      │
//! │                                               ▼             │
//! │                                      ┌─────────────────┐    │
//! │                                      │   ReplyQueue    │    │
//! │                                      └─────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Features
//!
//! - **Non-blocking I/O**: edge-triggered reads and writes until `WouldBlock`
//! - **Pipelining**: any number of commands per read
//! - **Partial writes**: the reply queue resumes mid-reply
//! - **Statistics**: connection and command counters

pub mod handler;
pub mod reply;

// Re-export commonly used types
pub use handler::{Client, ClientStats, ConnectionError, Flow, ReadEvent};
pub use reply::{ReplyQueue, WriteProgress};
