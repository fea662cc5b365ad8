//! Bounded output ring kept for every session
//!
//! The ring is the only durability mechanism for terminal output: inactive
//! sessions are never queued on the wire, so activating a session replays
//! whatever the ring still holds.

use std::collections::VecDeque;
use std::fmt;

/// Identity of a buffer's contents
///
/// Changes exactly when the buffer mutates. The nonce keeps tokens from two
/// different sessions (or a recreated session with the same id) apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ScreenId {
    nonce: u64,
    revision: u64,
}

impl ScreenId {
    /// Revision counter this token was taken at
    pub fn revision(&self) -> u64 {
        self.revision
    }
}

impl fmt::Display for ScreenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}-{}", self.nonce, self.revision)
    }
}

/// Byte ring holding the most recent output of a session
#[derive(Debug)]
pub struct OutputBuffer {
    data: VecDeque<u8>,
    capacity: usize,
    revision: u64,
    nonce: u64,
}

impl OutputBuffer {
    /// Create an empty buffer holding at most `capacity` bytes
    pub fn new(capacity: usize) -> Self {
        Self {
            data: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity: capacity.max(1),
            revision: 0,
            nonce: rand::random(),
        }
    }

    /// Append output, dropping the oldest bytes past capacity.
    ///
    /// Returns the new revision.
    pub fn append(&mut self, bytes: &[u8]) -> u64 {
        if bytes.is_empty() {
            return self.revision;
        }

        let incoming = if bytes.len() > self.capacity {
            &bytes[bytes.len() - self.capacity..]
        } else {
            bytes
        };

        let overflow = (self.data.len() + incoming.len()).saturating_sub(self.capacity);
        self.data.drain(..overflow);
        self.data.extend(incoming);

        self.revision += 1;
        self.revision
    }

    /// Current revision (number of appends so far)
    pub fn revision(&self) -> u64 {
        self.revision
    }

    /// Token identifying the current contents
    pub fn screen_id(&self) -> ScreenId {
        ScreenId {
            nonce: self.nonce,
            revision: self.revision,
        }
    }

    /// Buffered bytes as text.
    ///
    /// A multi-byte character cut in half by eviction is skipped rather than
    /// rendered as a replacement character.
    pub fn contents(&self) -> String {
        let (front, back) = self.data.as_slices();
        let mut bytes = Vec::with_capacity(self.data.len());
        bytes.extend_from_slice(front);
        bytes.extend_from_slice(back);

        let start = bytes
            .iter()
            .take(3)
            .take_while(|b| (**b & 0xC0) == 0x80)
            .count();
        String::from_utf8_lossy(&bytes[start..]).into_owned()
    }

    /// Number of buffered bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether nothing has been buffered yet (or everything was evicted)
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Maximum number of bytes kept
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
