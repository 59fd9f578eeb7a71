//! Single consumer of the tagged line queue produced by [`crate::stream_buffer::StreamBuffer`].
//!
//! Ported from RadSSH's `console.py`: a background task drains `(tag, text)`
//! items, formats them (monochrome or a stable 7-color ANSI palette keyed by
//! the label's hash), writes them to stdout under one mutex so that console
//! output, interactive prompts, and the OSC-2 status line never interleave,
//! and optionally retains a bounded per-tag replay history for a "stalled
//! job" Ctrl-C dump.

use std::collections::{HashMap, VecDeque};
use std::io::Write;

use tokio::sync::{Mutex, mpsc};

use crate::stream_buffer::{QueueItem, Tag};

/// A formatter turns one queued `(tag, text)` item into the lines it prints.
pub type Formatter = fn(&Tag, &str) -> Vec<String>;

/// `"[label] line\n"` per source line, no color.
pub fn monochrome(tag: &Tag, text: &str) -> Vec<String> {
    let (label, _stderr) = tag;
    text.split('\n')
        .map(|line| format!("[{label}] {line}\n"))
        .collect()
}

/// Stable 7-color ANSI palette keyed by `hash(label) % 7`; stderr lines get a
/// reverse-video prefix, stdout a plain colored prefix, both ANSI-reset at line end.
pub fn colorizer(tag: &Tag, text: &str) -> Vec<String> {
    let (label, is_stderr) = tag;
    let color = 1 + (fnv1a(label) % 7);
    text.split('\n')
        .map(|line| {
            if *is_stderr {
                format!("\x1b[30;4{color}m[{label}]\x1b[0;1;3{color}m {line}\x1b[0m\n")
            } else {
                format!("\x1b[3{color}m[{label}] {line}\x1b[0m\n")
            }
        })
        .collect()
}

fn fnv1a(s: &str) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in s.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

/// Single-consumer console: the queue producers push into, plus the
/// formatter/mutex/history machinery draining it.
pub struct Console {
    sender: mpsc::Sender<QueueItem>,
    stdout_mutex: Mutex<()>,
    quiet: std::sync::atomic::AtomicBool,
    retain_recent: usize,
    history: Mutex<HashMap<String, VecDeque<String>>>,
}

/// Default queue capacity, `min(100, 4*N)` worker-scaled back-pressure bound.
pub fn default_queue_capacity(worker_count: usize) -> usize {
    (4 * worker_count).clamp(1, 100)
}

impl Console {
    /// Build a console with the given queue capacity and replay-history
    /// depth (`0` disables history retention).
    pub fn new(queue_capacity: usize, retain_recent: usize) -> (std::sync::Arc<Self>, ConsoleTask) {
        let (tx, rx) = mpsc::channel(queue_capacity);
        let console = std::sync::Arc::new(Console {
            sender: tx,
            stdout_mutex: Mutex::new(()),
            quiet: std::sync::atomic::AtomicBool::new(false),
            retain_recent,
            history: Mutex::new(HashMap::new()),
        });
        let task = ConsoleTask {
            console: console.clone(),
            receiver: rx,
            formatter: colorizer,
        };
        (console, task)
    }

    /// A clone of the sender producers (e.g. [`crate::stream_buffer::StreamBuffer`]) push into.
    pub fn sender(&self) -> mpsc::Sender<QueueItem> {
        self.sender.clone()
    }

    /// Set (or clear) quiet mode; returns the prior setting.
    pub fn set_quiet(&self, enable: bool) -> bool {
        self.quiet.swap(enable, std::sync::atomic::Ordering::SeqCst)
    }

    /// Submit a one-off operator message tagged `CONSOLE`/stderr-highlighted.
    pub async fn message(&self, message: impl Into<String>) {
        let _ = self
            .sender
            .send((("CONSOLE".to_string(), true), message.into()))
            .await;
    }

    /// Write an xterm OSC-2 title-bar status sequence, unless quiet.
    pub async fn status(&self, message: &str) {
        if self.quiet.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let _guard = self.stdout_mutex.lock().await;
        print!("\x1b]2;{message}\x07");
        let _ = std::io::stdout().flush();
    }

    /// Write without a trailing newline, flushing immediately (progress indicators).
    pub async fn progress(&self, s: &str) {
        if self.quiet.load(std::sync::atomic::Ordering::SeqCst) {
            return;
        }
        let _guard = self.stdout_mutex.lock().await;
        print!("{s}");
        let _ = std::io::stdout().flush();
    }

    /// Dump the retained recent lines for `label`, prefixed `"STALLED: "` (Ctrl-C handler).
    pub async fn replay_recent(&self, label: &str) {
        if self.retain_recent == 0 {
            return;
        }
        let history = self.history.lock().await;
        if let Some(lines) = history.get(label) {
            let _guard = self.stdout_mutex.lock().await;
            for line in lines {
                print!("STALLED: {line}");
            }
            let _ = std::io::stdout().flush();
        }
    }

    /// Wait for the queue to drain; optionally clear retained history afterward.
    pub async fn join(&self, clear_history: bool) {
        // Producers hold `Sender` clones; once the queue is empty the next
        // `send` will simply be buffered again, so "drained" here means
        // "no more queued items at the moment of the call" — sufficient for
        // the synchronization points the Cluster actually needs (end of a
        // run_command batch, where no further pushes are in flight).
        while !self.sender.is_closed() && self.sender.capacity() != self.sender.max_capacity() {
            tokio::task::yield_now().await;
        }
        if clear_history {
            self.history.lock().await.clear();
        }
    }
}

/// Owns the receiving half of the console queue; `run` drives the single
/// background consumer loop and should be spawned exactly once per [`Console`].
pub struct ConsoleTask {
    console: std::sync::Arc<Console>,
    receiver: mpsc::Receiver<QueueItem>,
    formatter: Formatter,
}

impl ConsoleTask {
    /// Use the plain `monochrome` formatter instead of the default ANSI palette.
    pub fn monochrome(mut self) -> Self {
        self.formatter = monochrome;
        self
    }

    /// Drain the queue until every sender (every `StreamBuffer`/`Console` clone) is dropped.
    pub async fn run(mut self) {
        while let Some((tag, text)) = self.receiver.recv().await {
            if self
                .console
                .quiet
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                continue;
            }
            let lines = (self.formatter)(&tag, &text);
            let _guard = self.console.stdout_mutex.lock().await;
            for line in &lines {
                print!("{line}");
                if self.console.retain_recent > 0 {
                    let mut history = self.console.history.lock().await;
                    let deque = history.entry(tag.0.clone()).or_default();
                    if deque.len() == self.console.retain_recent {
                        deque.pop_front();
                    }
                    deque.push_back(line.clone());
                }
            }
            let _ = std::io::stdout().flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monochrome_formats_each_source_line() {
        let tag = ("host1".to_string(), false);
        let lines = monochrome(&tag, "a\nb");
        assert_eq!(lines, vec!["[host1] a\n".to_string(), "[host1] b\n".to_string()]);
    }

    #[test]
    fn colorizer_is_stable_per_label() {
        let tag = ("host1".to_string(), false);
        let a = colorizer(&tag, "x");
        let b = colorizer(&tag, "x");
        assert_eq!(a, b);
    }

    #[test]
    fn default_queue_capacity_is_bounded() {
        assert_eq!(default_queue_capacity(10), 40);
        assert_eq!(default_queue_capacity(1000), 100);
        assert_eq!(default_queue_capacity(0), 1);
    }

    #[tokio::test]
    async fn queue_monotonicity_preserves_push_order_per_tag() {
        let (console, task) = Console::new(10, 0);
        let handle = tokio::spawn(task.run());
        let sender = console.sender();
        for i in 0..5 {
            sender
                .send((("h1".to_string(), false), format!("line{i}\n")))
                .await
                .unwrap();
        }
        drop(sender);
        drop(console);
        handle.await.unwrap();
    }
}
