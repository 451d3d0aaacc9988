//! Task log sink.
//!
//! Collects the task's user output (script and child process stdout/stderr),
//! keeps a bounded history so late listeners still get recent events, and
//! mirrors every event into `TaskLogs-<jobid>-<taskid>.log` in scratch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::debug;

use crate::config::DEFAULT_LOG_BUFFER;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEvent {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
}

#[derive(Debug, Error)]
pub enum LogForwardingError {
    #[error("Cannot create log appender: {0}")]
    Appender(String),

    #[error("Log forwarding failed: {0}")]
    Forwarding(String),
}

/// Anything that accepts lines of task output.
pub trait LineSink: Send + Sync {
    fn push(&self, stream: LogStream, line: &str);
}

/// Destination of forwarded log events.
pub trait LogAppender: Send {
    fn append(&mut self, event: &LogEvent) -> Result<(), LogForwardingError>;

    fn close(&mut self) {}
}

/// Log forwarding service: hands out appenders for a task's log stream.
pub trait AppenderProvider: Send + Sync {
    fn appender(&self, stream_name: &str) -> Result<Box<dyn LogAppender>, LogForwardingError>;
}

struct LogsInner {
    history: VecDeque<LogEvent>,
    capacity: usize,
    live: Vec<Box<dyn LogAppender>>,
    file: Option<BufWriter<File>>,
    closed: bool,
}

pub struct TaskLogs {
    stream_name: String,
    inner: Mutex<LogsInner>,
    file_path: Option<PathBuf>,
    broadcast_tx: broadcast::Sender<LogEvent>,
}

impl TaskLogs {
    /// In-memory sink keeping the last `capacity` events.
    pub fn new(stream_name: impl Into<String>, capacity: usize) -> Self {
        let (broadcast_tx, _) = broadcast::channel(256);
        let capacity = if capacity == 0 { DEFAULT_LOG_BUFFER } else { capacity };
        Self {
            stream_name: stream_name.into(),
            inner: Mutex::new(LogsInner {
                history: VecDeque::with_capacity(capacity.min(DEFAULT_LOG_BUFFER)),
                capacity,
                live: Vec::new(),
                file: None,
                closed: false,
            }),
            file_path: None,
            broadcast_tx,
        }
    }

    /// Also write every event to `path`, truncating it.
    pub fn with_log_file(mut self, path: &Path) -> std::io::Result<Self> {
        let file = File::create(path)?;
        self.lock().file = Some(BufWriter::new(file));
        self.file_path = Some(path.to_path_buf());
        Ok(self)
    }

    fn lock(&self) -> MutexGuard<'_, LogsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn stream_name(&self) -> &str {
        &self.stream_name
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    /// Subscribe to live events (no history).
    pub fn subscribe(&self) -> broadcast::Receiver<LogEvent> {
        self.broadcast_tx.subscribe()
    }

    /// Push the buffered history to a new appender, then keep it attached for
    /// live events until `close`.
    pub fn activate_logs(&self, provider: &dyn AppenderProvider) -> Result<(), LogForwardingError> {
        let mut appender = provider.appender(&self.stream_name)?;
        let mut inner = self.lock();
        for event in &inner.history {
            appender.append(event)?;
        }
        if inner.closed {
            appender.close();
        } else {
            inner.live.push(appender);
        }
        Ok(())
    }

    /// Push only the buffered history to a new appender and close it.
    pub fn stored_logs(&self, provider: &dyn AppenderProvider) -> Result<(), LogForwardingError> {
        let mut appender = provider.appender(&self.stream_name)?;
        let history = self.snapshot();
        for event in &history {
            appender.append(event)?;
        }
        appender.close();
        Ok(())
    }

    /// Buffered events, oldest first.
    pub fn snapshot(&self) -> Vec<LogEvent> {
        self.lock().history.iter().cloned().collect()
    }

    /// Buffered output as text, one line per event.
    pub fn output(&self) -> String {
        let inner = self.lock();
        let mut text = String::new();
        for event in &inner.history {
            text.push_str(&event.line);
            text.push('\n');
        }
        text
    }

    /// Flush the log file and detach every live appender. Idempotent.
    pub fn close(&self) {
        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        if let Some(mut file) = inner.file.take() {
            let _ = file.flush();
        }
        for mut appender in inner.live.drain(..) {
            appender.close();
        }
        debug!(stream = %self.stream_name, "Task logs closed");
    }

    pub fn flush(&self) {
        if let Some(file) = self.lock().file.as_mut() {
            let _ = file.flush();
        }
    }
}

impl LineSink for TaskLogs {
    fn push(&self, stream: LogStream, line: &str) {
        let event = LogEvent {
            timestamp: Utc::now(),
            stream,
            line: line.to_string(),
        };

        let mut inner = self.lock();
        if inner.closed {
            return;
        }
        if let Some(file) = inner.file.as_mut() {
            let _ = writeln!(
                file,
                "[{}] {}",
                event.timestamp.format("%Y-%m-%d %H:%M:%S%.3f"),
                event.line
            );
        }
        // A failing appender is dropped; the others keep receiving events.
        inner.live.retain_mut(|appender| appender.append(&event).is_ok());
        if inner.history.len() == inner.capacity {
            inner.history.pop_front();
        }
        inner.history.push_back(event.clone());
        drop(inner);

        let _ = self.broadcast_tx.send(event);
    }
}

/// Sink writing lines straight to this process's stdout/stderr.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdioSink;

impl LineSink for StdioSink {
    fn push(&self, stream: LogStream, line: &str) {
        match stream {
            LogStream::Stdout => {
                let mut out = std::io::stdout().lock();
                let _ = writeln!(out, "{}", line);
                let _ = out.flush();
            }
            LogStream::Stderr => {
                let mut err = std::io::stderr().lock();
                let _ = writeln!(err, "{}", line);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Collected(Arc<Mutex<Vec<String>>>);

    struct CollectingAppender(Arc<Mutex<Vec<String>>>);

    impl LogAppender for CollectingAppender {
        fn append(&mut self, event: &LogEvent) -> Result<(), LogForwardingError> {
            self.0.lock().unwrap().push(event.line.clone());
            Ok(())
        }
    }

    impl AppenderProvider for Collected {
        fn appender(&self, _: &str) -> Result<Box<dyn LogAppender>, LogForwardingError> {
            Ok(Box::new(CollectingAppender(self.0.clone())))
        }
    }

    #[test]
    fn ring_buffer_keeps_latest_events() {
        let logs = TaskLogs::new("t", 3);
        for i in 0..5 {
            logs.push(LogStream::Stdout, &format!("line {}", i));
        }
        let lines: Vec<String> = logs.snapshot().into_iter().map(|e| e.line).collect();
        assert_eq!(lines, vec!["line 2", "line 3", "line 4"]);
        assert_eq!(logs.output(), "line 2\nline 3\nline 4\n");
    }

    #[test]
    fn late_listener_gets_history_then_live_events() {
        let logs = TaskLogs::new("t", 10);
        logs.push(LogStream::Stdout, "before");
        let provider = Collected::default();
        logs.activate_logs(&provider).unwrap();
        logs.push(LogStream::Stderr, "after");
        logs.close();
        logs.push(LogStream::Stdout, "ignored");
        assert_eq!(*provider.0.lock().unwrap(), vec!["before", "after"]);
    }

    #[test]
    fn stored_logs_sends_only_history() {
        let logs = TaskLogs::new("t", 10);
        logs.push(LogStream::Stdout, "one");
        let provider = Collected::default();
        logs.stored_logs(&provider).unwrap();
        logs.push(LogStream::Stdout, "two");
        assert_eq!(*provider.0.lock().unwrap(), vec!["one"]);
    }

    #[test]
    fn events_are_mirrored_to_log_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("TaskLogs-1-1t0.log");
        let logs = TaskLogs::new("t", 10).with_log_file(&path).unwrap();
        logs.push(LogStream::Stdout, "hello");
        logs.close();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.trim_end().ends_with("hello"));
        assert_eq!(logs.log_file(), Some(path.as_path()));
    }

    #[tokio::test]
    async fn subscribers_receive_live_events() {
        let logs = TaskLogs::new("t", 10);
        let mut rx = logs.subscribe();
        logs.push(LogStream::Stdout, "live");
        assert_eq!(rx.recv().await.unwrap().line, "live");
    }
}
