//! Reactor Module
//!
//! A single-threaded event loop built on `mio`. It multiplexes readiness of
//! registered sockets with a list of timers, and hands every callback the
//! loop itself plus a caller-supplied state value.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                   EventLoop<S>                      │
//! │                                                     │
//! │  registrations: Token -> { readable?, writable? }   │
//! │  timers:        [newest, ..., oldest]               │
//! │                                                     │
//! │  run(&mut S) ──> run_once ──> poll ──> callbacks    │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! Readiness is edge-triggered: a read or write callback must drain its
//! socket until `WouldBlock` or it will not be woken again for the same data.

pub mod event_loop;

pub use event_loop::{
    Direction, EventLoop, FileProc, ReactorError, TimeProc, TimerId, TimerKind, MAX_WAIT, MIN_WAIT,
};
