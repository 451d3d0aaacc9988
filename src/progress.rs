//! Progress reported by a running task through a file.
//!
//! The task writes an integer percentage into the file named by
//! `PA_TASK_PROGRESS_FILE`. The reader polls it and keeps the last valid
//! value; anything that is not a number in 0..=100 is ignored.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Default poll interval of the progress file.
pub const PROGRESS_POLL_INTERVAL: Duration = Duration::from_millis(500);

type Listener = Box<dyn Fn(i32) + Send + Sync>;

/// Parse a progress value. Decimals are truncated.
pub fn parse_progress(content: &str) -> Option<i32> {
    let trimmed = content.trim();
    if trimmed.is_empty() {
        return None;
    }
    let value = match trimmed.parse::<i64>() {
        Ok(v) => v,
        Err(_) => {
            let float = trimmed.parse::<f64>().ok()?;
            if !float.is_finite() {
                return None;
            }
            float.trunc() as i64
        }
    };
    (0..=100).contains(&value).then_some(value as i32)
}

pub struct ProgressFileReader {
    path: PathBuf,
    last: Arc<AtomicI32>,
    listeners: Arc<Mutex<Vec<Listener>>>,
    stop: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl ProgressFileReader {
    /// Create an empty progress file at `path` and start polling it.
    pub async fn start(path: PathBuf, interval: Duration) -> std::io::Result<Self> {
        tokio::fs::write(&path, b"").await?;

        let last = Arc::new(AtomicI32::new(0));
        let listeners: Arc<Mutex<Vec<Listener>>> = Arc::new(Mutex::new(Vec::new()));
        let stop = CancellationToken::new();

        let handle = {
            let path = path.clone();
            let last = Arc::clone(&last);
            let listeners = Arc::clone(&listeners);
            let stop = stop.clone();
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                let mut previous: Option<String> = None;
                loop {
                    tokio::select! {
                        _ = stop.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    let Ok(content) = tokio::fs::read_to_string(&path).await else {
                        continue;
                    };
                    if previous.as_deref() == Some(content.as_str()) {
                        continue;
                    }
                    previous = Some(content.clone());
                    match parse_progress(&content) {
                        Some(value) => {
                            last.store(value, Ordering::SeqCst);
                            for listener in listeners.lock().unwrap_or_else(|e| e.into_inner()).iter() {
                                listener(value);
                            }
                        }
                        None => debug!(content = %content.trim(), "Ignoring invalid progress value"),
                    }
                }
            })
        };

        Ok(Self {
            path,
            last,
            listeners,
            stop,
            handle: Some(handle),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Last valid progress value, 0 if none was written yet.
    pub fn progress(&self) -> i32 {
        self.last.load(Ordering::SeqCst)
    }

    /// Called with every new valid value.
    pub fn add_listener<F>(&self, listener: F)
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.listeners
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Box::new(listener));
    }

    pub fn stop(&mut self) {
        self.stop.cancel();
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for ProgressFileReader {
    fn drop(&mut self) {
        self.stop();
    }
}
