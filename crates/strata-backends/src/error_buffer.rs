//! Fixed-size, first-writer-wins error message buffer shared by kernel invocations.
//!
//! One buffer is handed to every invocation of a scheduled kernel. An
//! invocation that detects a problem calls [`ErrorMessageBuffer::raise`]; the
//! first call claims the buffer and copies its message in, later calls are
//! ignored. After all invocations have joined, the scheduler reads the message
//! back and turns it into [`DeviceError::Execution`](crate::DeviceError::Execution).
//!
//! ```text
//!   invocation 17 ──raise("bad id")──► claimed = true, bytes = "bad id", ready = true
//!   invocation 42 ──raise("other")───► claim fails, message dropped
//!   scheduler (after join) ──────────► Err(Execution("bad id"))
//! ```

use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::error::{DeviceError, Result};

/// Capacity of the message buffer in bytes
pub const ERROR_BUFFER_CAPACITY: usize = 1024;

pub struct ErrorMessageBuffer {
    claimed: AtomicBool,
    ready: AtomicBool,
    len: AtomicUsize,
    bytes: UnsafeCell<[u8; ERROR_BUFFER_CAPACITY]>,
}

// Only the invocation that wins the `claimed` exchange writes `bytes`, and
// readers wait for `ready` (release/acquire) before touching them.
unsafe impl Sync for ErrorMessageBuffer {}

impl ErrorMessageBuffer {
    pub fn new() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            ready: AtomicBool::new(false),
            len: AtomicUsize::new(0),
            bytes: UnsafeCell::new([0; ERROR_BUFFER_CAPACITY]),
        }
    }

    /// Record `message` if no other message has been recorded yet.
    ///
    /// Returns `true` when this call won. Messages longer than
    /// [`ERROR_BUFFER_CAPACITY`] are truncated on a character boundary.
    pub fn raise(&self, message: impl AsRef<str>) -> bool {
        if self
            .claimed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let message = message.as_ref();
        let mut end = message.len().min(ERROR_BUFFER_CAPACITY);
        while !message.is_char_boundary(end) {
            end -= 1;
        }

        // SAFETY: winning the claim makes this the only writer, and no reader
        // looks at the bytes until `ready` is published below.
        unsafe {
            let bytes = &mut *self.bytes.get();
            bytes[..end].copy_from_slice(&message.as_bytes()[..end]);
        }
        self.len.store(end, Ordering::Relaxed);
        self.ready.store(true, Ordering::Release);
        true
    }

    /// Whether some invocation has claimed the buffer.
    pub fn is_raised(&self) -> bool {
        self.claimed.load(Ordering::Acquire)
    }

    /// The recorded message, once the winning writer has finished copying it.
    pub fn message(&self) -> Option<String> {
        if !self.ready.load(Ordering::Acquire) {
            return None;
        }
        let len = self.len.load(Ordering::Relaxed);
        // SAFETY: `ready` is only set after the single write completed.
        let bytes = unsafe { &(&(*self.bytes.get()))[..len] };
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Turn a raised message into [`DeviceError::Execution`].
    ///
    /// Only meaningful after every invocation has joined.
    pub fn check(&self) -> Result<()> {
        match self.message() {
            Some(message) => Err(DeviceError::Execution(message)),
            None if self.is_raised() => Err(DeviceError::execution("kernel raised an error")),
            None => Ok(()),
        }
    }

    /// Reset for the next schedule call.
    pub fn clear(&mut self) {
        *self.claimed.get_mut() = false;
        *self.ready.get_mut() = false;
        *self.len.get_mut() = 0;
    }

    pub const fn capacity(&self) -> usize {
        ERROR_BUFFER_CAPACITY
    }
}

impl Default for ErrorMessageBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ErrorMessageBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErrorMessageBuffer")
            .field("raised", &self.is_raised())
            .field("message", &self.message())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rayon::prelude::*;

    #[test]
    fn empty_buffer_reports_nothing() {
        let buffer = ErrorMessageBuffer::new();
        assert!(!buffer.is_raised());
        assert_eq!(buffer.message(), None);
        assert_eq!(buffer.capacity(), 1024);
    }

    #[test]
    fn first_writer_wins() {
        let buffer = ErrorMessageBuffer::new();
        assert!(buffer.raise("first"));
        assert!(!buffer.raise("second"));
        assert_eq!(buffer.message().as_deref(), Some("first"));
    }

    #[test]
    fn concurrent_raises_keep_exactly_one_message() {
        let buffer = ErrorMessageBuffer::new();
        let winners: usize = (0..10_000)
            .into_par_iter()
            .map(|i| buffer.raise(format!("invocation {i} failed")) as usize)
            .sum();
        assert_eq!(winners, 1);
        let message = buffer.message().unwrap();
        assert!(message.starts_with("invocation ") && message.ends_with(" failed"));
    }

    #[test]
    fn long_messages_truncate_on_char_boundary() {
        let buffer = ErrorMessageBuffer::new();
        // 3-byte characters never line up with 1024
        let long = "€".repeat(400);
        buffer.raise(&long);
        let message = buffer.message().unwrap();
        assert_eq!(message.len(), 1023);
        assert!(message.chars().all(|c| c == '€'));
    }

    #[test]
    fn check_converts_message_to_execution_error() {
        let buffer = ErrorMessageBuffer::new();
        assert!(buffer.check().is_ok());
        buffer.raise("point id out of range");
        assert_eq!(
            buffer.check(),
            Err(DeviceError::Execution("point id out of range".into()))
        );
    }

    #[test]
    fn clear_allows_reuse() {
        let mut buffer = ErrorMessageBuffer::new();
        buffer.raise("stale");
        buffer.clear();
        assert!(!buffer.is_raised());
        assert!(buffer.raise("fresh"));
        assert_eq!(buffer.message().as_deref(), Some("fresh"));
    }
}
