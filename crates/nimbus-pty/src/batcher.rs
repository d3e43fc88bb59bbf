//! Batching of pty output into id-prefixed frames.
//!
//! Output from a shell often arrives in many small chunks. Delivering each
//! chunk to the host separately is expensive, so chunks are collected into a
//! frame that is emitted either when it grows past a size limit or when a
//! short delay has elapsed since the first unflushed write.
//!
//! Every frame starts with the session id so a transport carrying frames for
//! many sessions can route them without extra metadata.

use std::time::Duration;

use tokio::time::Instant;

/// Max time output may sit in a batch before it is flushed.
pub const BATCH_DURATION: Duration = Duration::from_millis(16);

/// Max size of a batch in bytes. A frame can exceed this by at most one
/// chunk (pty reads are a few KiB at most).
pub const BATCH_MAX_SIZE: usize = 200 * 1024;

/// Size and time bounds for an [`OutputBatcher`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchLimits {
    pub max_size: usize,
    pub delay: Duration,
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            max_size: BATCH_MAX_SIZE,
            delay: BATCH_DURATION,
        }
    }
}

/// Collects output for one spawn of a session.
///
/// The batcher does not own a timer. It records the instant at which the
/// pending batch is due ([`deadline`](Self::deadline)) and the session's
/// event loop sleeps until then and calls [`flush`](Self::flush).
#[derive(Debug)]
pub struct OutputBatcher {
    prefix: String,
    buffer: String,
    decoder: Utf8Decoder,
    limits: BatchLimits,
    pending_flush: Option<Instant>,
}

impl OutputBatcher {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self::with_limits(prefix, BatchLimits::default())
    }

    pub fn with_limits(prefix: impl Into<String>, limits: BatchLimits) -> Self {
        let prefix = prefix.into();
        Self {
            buffer: prefix.clone(),
            prefix,
            decoder: Utf8Decoder::default(),
            limits,
            pending_flush: None,
        }
    }

    /// Append raw pty bytes.
    ///
    /// Multi-byte UTF-8 sequences split across chunks are carried over to the
    /// next call. Returns a frame if the batch had to be flushed to make room.
    pub fn write(&mut self, chunk: &[u8]) -> Option<String> {
        let frame = self.flush_if_full(chunk.len());
        self.decoder.decode_into(chunk, &mut self.buffer);
        self.schedule();
        frame
    }

    /// Append text that is already decoded, such as a diagnostic message.
    pub fn write_str(&mut self, text: &str) -> Option<String> {
        let frame = self.flush_if_full(text.len());
        self.buffer.push_str(text);
        self.schedule();
        frame
    }

    /// Take the current batch, leaving the batcher reset to just the prefix
    /// with no flush scheduled.
    ///
    /// The reset happens before the caller sees the data, so anything written
    /// while the frame is being delivered lands in the next batch.
    pub fn flush(&mut self) -> String {
        self.pending_flush = None;
        std::mem::replace(&mut self.buffer, self.prefix.clone())
    }

    /// When the pending batch is due, if one is scheduled.
    pub fn deadline(&self) -> Option<Instant> {
        self.pending_flush
    }

    /// Buffered output in bytes, not counting the prefix.
    pub fn len(&self) -> usize {
        self.buffer.len() - self.prefix.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn flush_if_full(&mut self, incoming: usize) -> Option<String> {
        if self.buffer.len() + incoming >= self.limits.max_size {
            Some(self.flush())
        } else {
            None
        }
    }

    fn schedule(&mut self) {
        if self.pending_flush.is_none() {
            self.pending_flush = Some(Instant::now() + self.limits.delay);
        }
    }
}

/// Streaming UTF-8 decoder that holds back an incomplete trailing sequence.
#[derive(Debug, Default)]
struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    fn decode_into(&mut self, chunk: &[u8], out: &mut String) {
        let joined;
        let mut input: &[u8] = if self.pending.is_empty() {
            chunk
        } else {
            self.pending.extend_from_slice(chunk);
            joined = std::mem::take(&mut self.pending);
            &joined
        };

        loop {
            match std::str::from_utf8(input) {
                Ok(text) => {
                    out.push_str(text);
                    return;
                }
                Err(err) => {
                    let (valid, rest) = input.split_at(err.valid_up_to());
                    out.push_str(&String::from_utf8_lossy(valid));
                    match err.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &rest[bad..];
                        }
                        None => {
                            // Truncated sequence at the end, wait for more bytes.
                            self.pending = rest.to_vec();
                            return;
                        }
                    }
                }
            }
        }
    }
}
