//! # Bounded Log Relay
//!
//! Forwards recent log lines to a remote sink without ever blocking the wake
//! cycle. Lines are captured by [`RelayLayer`], a `tracing` layer, into a
//! fixed-capacity [`LogQueue`] that drops its oldest entry when full.
//! [`LogRelay::flush`] drains the queue into a [`PublishSink`] while the sink
//! is connected, and [`LogRelay::wait_for_drain`] gives it one last bounded
//! chance before the device sleeps.
//!
//! Anything logged from inside a publish call is not captured again, so a
//! sink that logs its own failures cannot feed the queue it is draining.

use chrono::{Local, NaiveDateTime};
use std::cell::Cell;
use std::collections::VecDeque;
use std::fmt::Write as _;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

pub const DEFAULT_CAPACITY: usize = 15;
pub const DEFAULT_TOPIC: &str = "inky-renderer";
const DRAIN_POLL: Duration = Duration::from_millis(5);

/// Fixed-capacity FIFO of formatted log lines.
#[derive(Debug)]
pub struct LogQueue {
    entries: VecDeque<String>,
    capacity: usize,
    dropped: u64,
}

impl LogQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append a line, evicting the oldest one when full.
    pub fn push(&mut self, line: String) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
            self.dropped += 1;
        }
        self.entries.push_back(line);
    }

    pub fn pop(&mut self) -> Option<String> {
        self.entries.pop_front()
    }

    /// Put a line back at the head after a failed publish. If newer lines
    /// filled the queue meanwhile, the line is dropped and counted.
    fn requeue(&mut self, line: String) {
        if self.entries.len() >= self.capacity {
            self.dropped += 1;
            return;
        }
        self.entries.push_front(line);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lines evicted since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(String::as_str)
    }
}

pub type SharedQueue = Arc<Mutex<LogQueue>>;

fn lock(queue: &SharedQueue) -> MutexGuard<'_, LogQueue> {
    queue.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Error, Debug)]
pub enum PublishError {
    #[error("sink is not connected")]
    Disconnected,

    #[error("sink write failed: {0}")]
    Io(#[from] io::Error),
}

/// Destination for relayed log lines.
pub trait PublishSink {
    fn is_connected(&self) -> bool;

    fn publish(&mut self, line: &str) -> Result<(), PublishError>;

    /// Service the connection (keepalives, reconnects). Called while waiting
    /// for the queue to drain.
    fn poll(&mut self) {}
}

thread_local! {
    static PUBLISHING: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as publishing until dropped.
struct PublishGuard;

impl PublishGuard {
    fn enter() -> Self {
        PUBLISHING.with(|p| p.set(true));
        PublishGuard
    }
}

impl Drop for PublishGuard {
    fn drop(&mut self) {
        PUBLISHING.with(|p| p.set(false));
    }
}

fn is_publishing() -> bool {
    PUBLISHING.with(Cell::get)
}

/// Owns the publish sink and drains the shared queue into it.
pub struct LogRelay<S> {
    queue: SharedQueue,
    sink: S,
    topic: String,
}

impl<S: PublishSink> LogRelay<S> {
    pub fn new(capacity: usize, sink: S) -> Self {
        Self {
            queue: Arc::new(Mutex::new(LogQueue::new(capacity))),
            sink,
            topic: DEFAULT_TOPIC.to_string(),
        }
    }

    pub fn with_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = topic.into();
        self
    }

    /// A `tracing` layer feeding this relay's queue.
    pub fn layer(&self) -> RelayLayer {
        RelayLayer {
            queue: Arc::clone(&self.queue),
        }
    }

    pub fn queue(&self) -> SharedQueue {
        Arc::clone(&self.queue)
    }

    pub fn pending(&self) -> usize {
        lock(&self.queue).len()
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    pub fn sink_mut(&mut self) -> &mut S {
        &mut self.sink
    }

    /// Publish queued lines while the sink stays connected.
    ///
    /// Returns the number of lines published. A failed publish leaves its
    /// line at the head of the queue and stops the flush.
    pub fn flush(&mut self) -> usize {
        if is_publishing() {
            return 0;
        }
        let _guard = PublishGuard::enter();

        let mut sent = 0;
        while self.sink.is_connected() {
            // lock only around the pop so a concurrent logger never waits on the sink
            let Some(line) = lock(&self.queue).pop() else {
                break;
            };
            match self.sink.publish(&line) {
                Ok(()) => sent += 1,
                Err(e) => {
                    tracing::warn!(topic = %self.topic, error = %e, "log publish failed, will retry");
                    lock(&self.queue).requeue(line);
                    break;
                }
            }
        }
        sent
    }

    /// Keep polling the sink and flushing until the queue is empty or
    /// `timeout` elapses. Returns whether the queue drained.
    pub fn wait_for_drain(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            self.sink.poll();
            self.flush();
            if lock(&self.queue).is_empty() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(DRAIN_POLL);
        }
    }
}

/// `tracing` layer that formats events into a [`LogQueue`].
#[derive(Clone)]
pub struct RelayLayer {
    queue: SharedQueue,
}

impl<S: Subscriber> Layer<S> for RelayLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        if is_publishing() {
            return;
        }
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        let line = format_entry(
            event.metadata().level(),
            &Local::now().naive_local(),
            &visitor.finish(),
        );
        lock(&self.queue).push(line);
    }
}

/// `[LEVEL   ] (2024-03-09 07:05:00 AM): message`
pub fn format_entry(level: &Level, at: &NaiveDateTime, message: &str) -> String {
    format!(
        "[{:<8}] ({}): {}",
        level_name(level),
        at.format("%Y-%m-%d %I:%M:%S %p"),
        message
    )
}

fn level_name(level: &Level) -> &'static str {
    match *level {
        Level::ERROR => "ERROR",
        Level::WARN => "WARNING",
        Level::INFO => "INFO",
        Level::DEBUG => "DEBUG",
        _ => "TRACE",
    }
}

/// Collects the `message` field followed by `key=value` pairs.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            self.message + &self.fields
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{value:?}");
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// Appends relayed lines to a local file, one per line.
pub struct FileSink {
    file: Option<File>,
}

impl FileSink {
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self { file: Some(file) })
    }

    /// A sink that never connects; lines stay queued.
    pub fn disconnected() -> Self {
        Self { file: None }
    }
}

impl PublishSink for FileSink {
    fn is_connected(&self) -> bool {
        self.file.is_some()
    }

    fn publish(&mut self, line: &str) -> Result<(), PublishError> {
        let file = self.file.as_mut().ok_or(PublishError::Disconnected)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    fn poll(&mut self) {
        if let Some(file) = self.file.as_mut() {
            let _ = file.flush();
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemorySink;
    use super::*;
    use chrono::NaiveDate;
    use tracing_subscriber::layer::SubscriberExt;

    fn fill<S: PublishSink>(relay: &LogRelay<S>, lines: impl IntoIterator<Item = &'static str>) {
        let queue = relay.queue();
        let mut queue = lock(&queue);
        for line in lines {
            queue.push(line.to_string());
        }
    }

    #[test]
    fn queue_drops_oldest_when_full() {
        let mut queue = LogQueue::new(3);
        for i in 0..5 {
            queue.push(format!("line {i}"));
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dropped(), 2);
        assert_eq!(queue.iter().collect::<Vec<_>>(), ["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn requeue_into_full_queue_drops_that_line() {
        let mut queue = LogQueue::new(2);
        queue.push("a".into());
        let popped = queue.pop().unwrap();
        queue.push("b".into());
        queue.push("c".into());

        queue.requeue(popped);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.iter().collect::<Vec<_>>(), ["b", "c"]);

        let head = queue.pop().unwrap();
        queue.requeue(head);
        assert_eq!(queue.dropped(), 1);
        assert_eq!(queue.iter().collect::<Vec<_>>(), ["b", "c"]);
    }

    #[test]
    fn zero_capacity_still_holds_one_line() {
        let mut queue = LogQueue::new(0);
        queue.push("a".into());
        queue.push("b".into());
        assert_eq!(queue.capacity(), 1);
        assert_eq!(queue.pop().as_deref(), Some("b"));
    }

    #[test]
    fn flush_only_while_connected() {
        let mut relay = LogRelay::new(15, MemorySink::default());
        fill(&relay, ["a", "b"]);
        assert_eq!(relay.flush(), 0);
        assert_eq!(relay.pending(), 2);

        relay.sink_mut().connected = true;
        assert_eq!(relay.flush(), 2);
        assert_eq!(relay.sink().published, ["a", "b"]);
        assert_eq!(relay.pending(), 0);
    }

    #[test]
    fn failed_publish_keeps_line_queued() {
        let mut relay = LogRelay::new(15, MemorySink {
            fail_next: 1,
            ..MemorySink::online()
        });
        fill(&relay, ["a", "b"]);

        assert_eq!(relay.flush(), 0);
        assert_eq!(relay.pending(), 2);
        assert_eq!(relay.flush(), 2);
        assert_eq!(relay.sink().published, ["a", "b"]);
    }

    #[test]
    fn wait_for_drain_polls_until_connected() {
        let mut relay = LogRelay::new(15, MemorySink {
            connect_after_polls: Some(3),
            ..MemorySink::default()
        });
        fill(&relay, ["a"]);
        assert!(relay.wait_for_drain(Duration::from_secs(1)));
        assert_eq!(relay.sink().polls, 3);
        assert_eq!(relay.sink().published, ["a"]);
    }

    #[test]
    fn wait_for_drain_gives_up_at_deadline() {
        let mut relay = LogRelay::new(15, MemorySink::default());
        fill(&relay, ["a"]);
        let started = Instant::now();
        assert!(!relay.wait_for_drain(Duration::from_millis(30)));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(relay.pending(), 1);
    }

    #[test]
    fn layer_captures_events_with_fields() {
        let relay = LogRelay::new(15, MemorySink::online());
        let subscriber = tracing_subscriber::registry().with(relay.layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(attempt = 2, "fetch attempt failed");
            tracing::info!(source = "unsplash", "image source");
        });

        let queue = relay.queue();
        let lines: Vec<String> = lock(&queue).iter().map(str::to_string).collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].starts_with("[WARNING ] ("));
        assert!(lines[0].ends_with("): fetch attempt failed attempt=2"));
        assert!(lines[1].ends_with("): image source source=unsplash"));
    }

    #[test]
    fn logging_during_flush_is_not_requeued() {
        let mut relay = LogRelay::new(15, MemorySink {
            chatty: true,
            ..MemorySink::online()
        });
        let subscriber = tracing_subscriber::registry().with(relay.layer());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!("one");
            tracing::info!("two");
            assert_eq!(relay.flush(), 2);
        });
        assert_eq!(relay.pending(), 0);
        assert_eq!(relay.sink().published.len(), 2);
    }

    #[test]
    fn formats_entries_with_twelve_hour_clock() {
        let at = NaiveDate::from_ymd_opt(2024, 3, 9)
            .unwrap()
            .and_hms_opt(19, 5, 0)
            .unwrap();
        assert_eq!(
            format_entry(&Level::INFO, &at, "woke up"),
            "[INFO    ] (2024-03-09 07:05:00 PM): woke up"
        );
        assert_eq!(
            format_entry(&Level::ERROR, &at, "x"),
            "[ERROR   ] (2024-03-09 07:05:00 PM): x"
        );
    }

    #[test]
    fn file_sink_appends_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("relay.log");
        let mut relay = LogRelay::new(15, FileSink::open(&path).unwrap());
        fill(&relay, ["first", "second"]);
        assert!(relay.wait_for_drain(Duration::from_millis(100)));
        drop(relay);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents, "first\nsecond\n");
        assert!(!FileSink::disconnected().is_connected());
    }
}
