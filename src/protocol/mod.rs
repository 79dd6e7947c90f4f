//! Wire Protocol
//!
//! Request decoding and reply encoding for the Redis-compatible text
//! protocol.
//!
//! ## Modules
//!
//! - `decoder`: Streaming inline/multibulk request decoder
//! - `types`: The `Reply` enum and its serialization
//!
//! ## Example
//!
//! ```
//! use emberkv::protocol::{Decoder, Reply};
//! use emberkv::storage::Value;
//! use bytes::BytesMut;
//!
//! let mut decoder = Decoder::new();
//! let mut buf = BytesMut::from(&b"*2\r\n$3\r\nGET\r\n$4\r\nname\r\n"[..]);
//! let args = decoder.decode(&mut buf).unwrap().unwrap();
//! assert_eq!(args.len(), 2);
//!
//! let reply = Reply::bulk(Value::from("Oslo"));
//! assert_eq!(reply.serialize(), b"$4\r\nOslo\r\n");
//! ```

pub mod decoder;
pub mod types;

// Re-export commonly used types for convenience
pub use decoder::{Decoder, ProtocolError, MAX_BULK_SIZE, MAX_INLINE_SIZE, MAX_MULTIBULK_LEN};
pub use types::Reply;
