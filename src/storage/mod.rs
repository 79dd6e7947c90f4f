//! Storage Module
//!
//! The data side of the server: shared values, the incrementally rehashed
//! dictionary, the key space built from two dictionaries, and the active
//! expiry cycle.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │                     Db                      │
//! │  ┌───────────────────┐ ┌─────────────────┐  │
//! │  │ data: Dict        │ │ expires: Dict   │  │
//! │  │ key -> Value      │ │ key -> deadline │  │
//! │  └───────────────────┘ └─────────────────┘  │
//! └─────────────────────────────────────────────┘
//!                       ▲
//!                       │ every 100ms
//!            ┌──────────┴──────────┐
//!            │  expiry::run_cycle  │
//!            │  (reactor timer)    │
//!            └─────────────────────┘
//! ```
//!
//! Everything here is single-threaded: values are `Rc`-backed and the whole
//! key space is owned by the event loop.
//!
//! ## Example
//!
//! ```
//! use emberkv::storage::{Db, Value};
//!
//! let mut db = Db::new();
//! db.set(Value::from("city"), Value::from("Oslo"));
//!
//! let now = emberkv::storage::unix_time_ms();
//! let value = db.lookup_read(&Value::from("city"), now).unwrap();
//! assert_eq!(value.string_bytes().unwrap().as_ref(), b"Oslo");
//! ```

pub mod db;
pub mod dict;
pub mod expiry;
pub mod value;

// Re-export commonly used types
pub use db::{unix_time_ms, Db, Ttl};
pub use dict::{Dict, DictError, DictStats, DictType, Entry, TableStats};
pub use expiry::{run_cycle, CycleReport, ExpiryConfig};
pub use value::{Payload, Value, ValueType};
