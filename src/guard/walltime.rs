//! Walltime enforcement: fire a kill callback once after a deadline.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Default)]
struct TimerState {
    started: bool,
    stopped: bool,
    expired: bool,
    handle: Option<JoinHandle<()>>,
}

/// One-shot walltime timer.
///
/// The timer task and `stop` share one mutex, so exactly one of
/// {expire, stop} takes effect.
#[derive(Default)]
pub struct WallTimer {
    state: Arc<Mutex<TimerState>>,
}

impl WallTimer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `on_expire` after `duration`. A zero duration means unbounded
    /// and does nothing; so does a second `start`.
    pub fn start<F>(&self, duration: Duration, on_expire: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if duration.is_zero() {
            debug!("No walltime set, task is unbounded");
            return;
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.started || state.stopped {
            return;
        }
        state.started = true;

        let shared = Arc::clone(&self.state);
        state.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let mut state = shared.lock().unwrap_or_else(|e| e.into_inner());
            if state.stopped || state.expired {
                return;
            }
            state.expired = true;
            info!(walltime_ms = duration.as_millis() as u64, "Walltime reached");
            on_expire();
        }));
    }

    /// Cancel the timer. Idempotent; has no effect once the timer fired.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.stopped {
            return;
        }
        state.stopped = true;
        if let Some(handle) = state.handle.take() {
            handle.abort();
        }
    }

    pub fn has_expired(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).expired
    }
}

impl Drop for WallTimer {
    fn drop(&mut self) {
        if let Ok(mut state) = self.state.lock() {
            if let Some(handle) = state.handle.take() {
                handle.abort();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn fires_once_after_duration() {
        let timer = WallTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timer.start(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(!timer.has_expired());
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(timer.has_expired());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        timer.stop();
        assert!(timer.has_expired());
    }

    #[tokio::test]
    async fn zero_duration_never_fires() {
        let timer = WallTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timer.start(Duration::ZERO, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!timer.has_expired());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn stop_before_expiry_prevents_callback() {
        let timer = WallTimer::new();
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        timer.start(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        timer.stop();
        timer.stop();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!timer.has_expired());
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }
}
