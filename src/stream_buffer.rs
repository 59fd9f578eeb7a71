//! Per-(host, direction) byte accumulator feeding the shared console queue.
//!
//! Ported from RadSSH's `streambuffer.py`: bytes are pushed in, complete
//! lines are flushed onto a bounded, non-blocking output queue (dropping
//! under back-pressure rather than stalling the pushing worker), and an
//! independent `pull`/`rewind` interface exposes the lossless raw byte log
//! for callers that need it verbatim (e.g. binary transfers).

use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc::Sender;

/// Tag attached to every line this buffer emits: `(label, is_stderr)`.
pub type Tag = (String, bool);

/// One line (or, in combined mode, one block of lines) delivered to the console queue.
pub type QueueItem = (Tag, String);

/// Default byte count before a partially-filled buffer is flushed even
/// without a delimiter boundary, matching the "flush-on-blocksize-exceeded" rule.
pub const DEFAULT_BLOCK_SIZE: usize = 4096;

/// Per-(host, direction) line accumulator.
pub struct StreamBuffer {
    tag: Tag,
    delimiter: u8,
    block_size: usize,
    pre_split: bool,
    output: Sender<QueueItem>,
    /// Unflushed tail bytes, used to detect line boundaries.
    tail: Vec<u8>,
    /// Append-only record of every byte ever pushed, for `pull`/`rewind`.
    log: Vec<u8>,
    /// Read cursor used by `pull`/`rewind`.
    cursor: usize,
    /// Complete lines (pre-split mode) or flush blocks (combined mode) dropped
    /// because the output queue was full.
    discards: AtomicU64,
    /// Complete lines (or blocks) successfully enqueued.
    emitted: AtomicU64,
    closed: bool,
}

/// Error returned when pushing to a buffer that has already been closed.
#[derive(Debug, thiserror::Error)]
#[error("stream buffer for {0:?} is closed")]
pub struct StreamClosed(pub Tag);

impl StreamBuffer {
    /// Build a buffer tagged `(label, is_stderr)`, flushing onto `output`.
    pub fn new(
        label: impl Into<String>,
        is_stderr: bool,
        output: Sender<QueueItem>,
        pre_split: bool,
    ) -> Self {
        StreamBuffer {
            tag: (label.into(), is_stderr),
            delimiter: b'\n',
            block_size: DEFAULT_BLOCK_SIZE,
            pre_split,
            output,
            tail: Vec::new(),
            log: Vec::new(),
            cursor: 0,
            discards: AtomicU64::new(0),
            emitted: AtomicU64::new(0),
            closed: false,
        }
    }

    /// Override the default flush block size.
    pub fn with_block_size(mut self, block_size: usize) -> Self {
        self.block_size = block_size;
        self
    }

    /// Tag this buffer emits under.
    pub fn tag(&self) -> &Tag {
        &self.tag
    }

    /// Total complete lines/blocks dropped due to queue back-pressure.
    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    /// Total complete lines/blocks successfully enqueued.
    pub fn emitted(&self) -> u64 {
        self.emitted.load(Ordering::Relaxed)
    }

    /// Append bytes and flush any complete lines. An empty push forces a
    /// flush of whatever complete lines are currently buffered, leaving a
    /// partial trailing line untouched.
    pub fn push(&mut self, bytes: &[u8]) -> Result<(), StreamClosed> {
        if self.closed {
            return Err(StreamClosed(self.tag.clone()));
        }
        self.log.extend_from_slice(bytes);
        self.tail.extend_from_slice(bytes);
        if bytes.is_empty() || self.tail.len() > self.block_size {
            self.flush();
        }
        Ok(())
    }

    /// Flush complete lines (through the last delimiter) to the output
    /// queue; the trailing partial line, if any, remains buffered.
    fn flush(&mut self) {
        let Some(last_delim) = self.tail.iter().rposition(|&b| b == self.delimiter) else {
            return;
        };
        let complete: Vec<u8> = self.tail.drain(..=last_delim).collect();
        self.emit_complete(&complete);
    }

    fn emit_complete(&mut self, complete: &[u8]) {
        if complete.is_empty() {
            return;
        }
        if self.pre_split {
            let delimiter = self.delimiter;
            let lines: Vec<String> = complete
                .split(|&b| b == delimiter)
                .filter(|line| !line.is_empty())
                .map(|line| String::from_utf8_lossy(line).into_owned())
                .collect();
            for line in lines {
                self.try_send(line);
            }
        } else {
            // Combined mode: one record for the whole flushed block, minus
            // the single trailing delimiter, to preserve intra-host grouping.
            let mut body = complete;
            if body.last() == Some(&self.delimiter) {
                body = &body[..body.len() - 1];
            }
            if !body.is_empty() {
                self.try_send(String::from_utf8_lossy(body).into_owned());
            }
        }
    }

    fn try_send(&mut self, line: String) {
        match self.output.try_send((self.tag.clone(), line)) {
            Ok(()) => {
                self.emitted.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                self.discards.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Strip one trailing delimiter, force-flush, emit any remainder as a
    /// final record, then mark the buffer inactive. Subsequent `push` calls fail.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        if self.tail.last() == Some(&self.delimiter) {
            self.tail.pop();
        }
        if !self.tail.is_empty() {
            self.tail.push(self.delimiter);
            self.flush();
        }
        let remainder: Vec<u8> = self.tail.drain(..).collect();
        if !remainder.is_empty() {
            if self.pre_split {
                self.try_send(String::from_utf8_lossy(&remainder).into_owned());
            } else {
                self.try_send(String::from_utf8_lossy(&remainder).into_owned());
            }
        }
        self.closed = true;
    }

    /// Read `n` bytes starting at the current cursor from the lossless log
    /// (`n == 0` reads to the end), advancing the cursor.
    pub fn pull(&mut self, n: usize) -> &[u8] {
        let start = self.cursor;
        let end = if n == 0 {
            self.log.len()
        } else {
            (start + n).min(self.log.len())
        };
        self.cursor = end;
        &self.log[start..end]
    }

    /// Reposition the `pull` cursor to absolute offset `p`.
    pub fn rewind(&mut self, p: usize) {
        self.cursor = p.min(self.log.len());
    }

    /// The full, lossless byte log pushed so far, regardless of queue discards.
    pub fn log(&self) -> &[u8] {
        &self.log
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(capacity: usize) -> (Sender<QueueItem>, tokio::sync::mpsc::Receiver<QueueItem>) {
        tokio::sync::mpsc::channel(capacity)
    }

    #[tokio::test]
    async fn line_integrity_pull_equals_pushed_bytes_modulo_trailing_delimiter() {
        let (tx, _rx) = channel(100);
        let mut buf = StreamBuffer::new("h1", false, tx, true);
        buf.push(b"hello\nworld\n").unwrap();
        buf.push(b"partial").unwrap();
        buf.close();
        let mut reader = buf;
        reader.rewind(0);
        let all = reader.pull(0).to_vec();
        assert_eq!(all, b"hello\nworld\npartial");
    }

    #[tokio::test]
    async fn pre_split_mode_emits_one_line_per_delimiter() {
        let (tx, mut rx) = channel(100);
        let mut buf = StreamBuffer::new("h1", false, tx, true);
        buf.push(b"a\nb\nc").unwrap();
        buf.push(b"").unwrap();
        drop(buf);
        let mut got = Vec::new();
        while let Ok(item) = rx.try_recv() {
            got.push(item.1);
        }
        assert_eq!(got, vec!["a".to_string(), "b".to_string()]);
    }

    #[tokio::test]
    async fn back_pressure_counts_discards_without_blocking() {
        let (tx, rx) = channel(1);
        // Fill the one queue slot so the next try_send is guaranteed to fail.
        tx.try_send((("h1".to_string(), false), "filler".to_string()))
            .unwrap();
        let mut buf = StreamBuffer::new("h1", false, tx, true);
        buf.push(b"x\ny\n").unwrap();
        assert_eq!(buf.discards(), 2);
        assert_eq!(buf.emitted(), 0);
        drop(rx);
    }

    #[tokio::test]
    async fn close_strips_one_trailing_delimiter_then_emits_remainder() {
        let (tx, mut rx) = channel(100);
        let mut buf = StreamBuffer::new("h1", false, tx, true);
        buf.push(b"line\n").unwrap();
        buf.close();
        let mut got = Vec::new();
        while let Ok(item) = rx.try_recv() {
            got.push(item.1);
        }
        assert_eq!(got, vec!["line".to_string()]);
    }

    #[tokio::test]
    async fn push_after_close_is_rejected() {
        let (tx, _rx) = channel(100);
        let mut buf = StreamBuffer::new("h1", false, tx, true);
        buf.close();
        assert!(buf.push(b"more").is_err());
    }
}
