//! Reference-Counted Values
//!
//! Every piece of data the server touches (keys, stored values, parsed
//! command arguments, queued replies) is a [`Value`]. A `Value` is a cheap
//! handle to a shared object: cloning it takes one more reference, dropping
//! it gives one back, and the payload is released exactly once when the last
//! holder goes away.
//!
//! ## Ownership
//!
//! ```text
//!   decoder ──parse──> args: Vec<Value> ──SET──> Dict entry (key, val)
//!                                                    │
//!                                         GET clone  ▼
//!                                          Reply::Bulk(Value) ──> reply queue
//! ```
//!
//! The same object can sit in the key space and in several reply queues at
//! once. Nothing ever copies the payload to share it.
//!
//! `Value` is built on `Rc`, so it is `!Send`: the whole engine runs on the
//! event loop thread and the type system keeps it there.

use bytes::Bytes;
use std::borrow::Cow;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// The logical type tag of a value.
///
/// Only `String` is produced by the command dispatcher today. The remaining
/// tags are reserved for container types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    String,
    List,
    Set,
    SortedSet,
    Hash,
}

/// The data a value carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Payload {
    /// Raw, binary-safe string bytes.
    Raw(Bytes),
    /// A string that holds a decimal integer, stored unboxed.
    Int(i64),
    /// A list of strings.
    List(VecDeque<Bytes>),
}

#[derive(Debug)]
struct Object {
    payload: Payload,
}

impl Object {
    fn new(payload: Payload) -> Self {
        #[cfg(test)]
        instrument::record_create();
        Self { payload }
    }
}

#[cfg(test)]
impl Drop for Object {
    fn drop(&mut self) {
        instrument::record_release();
    }
}

/// A shared, reference-counted unit of data.
#[derive(Clone)]
pub struct Value(Rc<Object>);

impl Value {
    fn from_payload(payload: Payload) -> Self {
        Value(Rc::new(Object::new(payload)))
    }

    /// Creates a string value.
    pub fn string(data: impl Into<Bytes>) -> Self {
        Self::from_payload(Payload::Raw(data.into()))
    }

    /// Creates a string value holding an integer.
    pub fn from_int(n: i64) -> Self {
        Self::from_payload(Payload::Int(n))
    }

    /// Creates a list value.
    pub fn list(items: impl IntoIterator<Item = Bytes>) -> Self {
        Self::from_payload(Payload::List(items.into_iter().collect()))
    }

    /// Returns the logical type of this value.
    pub fn value_type(&self) -> ValueType {
        match self.0.payload {
            Payload::Raw(_) | Payload::Int(_) => ValueType::String,
            Payload::List(_) => ValueType::List,
        }
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        self.value_type() == ValueType::String
    }

    pub fn payload(&self) -> &Payload {
        &self.0.payload
    }

    /// Returns the string representation, or `None` for non-string types.
    ///
    /// Raw strings are borrowed; integer-encoded strings are formatted.
    pub fn string_bytes(&self) -> Option<Cow<'_, [u8]>> {
        match &self.0.payload {
            Payload::Raw(b) => Some(Cow::Borrowed(b.as_ref())),
            Payload::Int(n) => Some(Cow::Owned(n.to_string().into_bytes())),
            Payload::List(_) => None,
        }
    }

    /// Interprets a string value as a decimal integer.
    pub fn as_int(&self) -> Option<i64> {
        match &self.0.payload {
            Payload::Int(n) => Some(*n),
            Payload::Raw(b) => std::str::from_utf8(b).ok()?.parse().ok(),
            Payload::List(_) => None,
        }
    }

    /// Number of live handles to this value's object.
    pub fn refcount(&self) -> usize {
        Rc::strong_count(&self.0)
    }

    /// Returns true if both handles point at the same object.
    pub fn ptr_eq(a: &Value, b: &Value) -> bool {
        Rc::ptr_eq(&a.0, &b.0)
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0.payload {
            Payload::Raw(b) => match std::str::from_utf8(b) {
                Ok(s) => write!(f, "{:?}", s),
                Err(_) => write!(f, "<{} bytes>", b.len()),
            },
            Payload::Int(n) => write!(f, "{}", n),
            Payload::List(items) => write!(f, "<list of {}>", items.len()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::string(Bytes::copy_from_slice(s.as_bytes()))
    }
}
