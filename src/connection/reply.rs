//! Per-connection reply queue.
//!
//! Replies are written in the order they were queued. A socket may accept
//! only part of a reply; the queue remembers how far into the head reply it
//! got and resumes from there on the next writability event.
//!
//! ```text
//!   items:  [ head ][ r2 ][ r3 ] ...
//!   frame:  "$5\r\nhello\r\n"      (encoding of head, built once)
//!                  ^
//!                  sent
//! ```

use crate::protocol::Reply;
use std::collections::VecDeque;
use std::io::{self, Write};

/// Result of a flush attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteProgress {
    /// Bytes accepted by the writer during this attempt.
    pub written: usize,
    /// True if every queued reply went out.
    pub drained: bool,
}

#[derive(Debug, Default)]
pub struct ReplyQueue {
    items: VecDeque<Reply>,
    /// Bytes of the head's frame already written.
    sent: usize,
    /// Encoding of the head reply, valid while `framed` is set.
    frame: Vec<u8>,
    framed: bool,
}

impl ReplyQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reply: Reply) {
        self.items.push_back(reply);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Bytes of the head reply already written.
    pub fn sent(&self) -> usize {
        self.sent
    }

    /// Writes as much as `writer` accepts. Stops at `WouldBlock`.
    ///
    /// A fully written reply is popped, which releases the values it held.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<WriteProgress> {
        let mut written = 0;

        while let Some(head) = self.items.front() {
            if !self.framed {
                self.frame.clear();
                head.serialize_into(&mut self.frame);
                self.framed = true;
            }

            while self.sent < self.frame.len() {
                match writer.write(&self.frame[self.sent..]) {
                    Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                    Ok(n) => {
                        self.sent += n;
                        written += n;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        return Ok(WriteProgress {
                            written,
                            drained: false,
                        });
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Err(e),
                }
            }

            self.items.pop_front();
            self.sent = 0;
            self.framed = false;
        }

        Ok(WriteProgress {
            written,
            drained: true,
        })
    }
}
