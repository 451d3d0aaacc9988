//! Cancellable proxy around a long-running, non-reentrant resource.
//!
//! A `Guard` owns one target and a single dedicated worker task. Every
//! operation on the target goes through `submit`, which runs it on that worker
//! with a cancellation token, so at most one operation touches the target at a
//! time while `kill` may be called from any other task.
//!
//! # Invariants
//! - State only moves forward: `NotInitialized -> TargetInitialized -> Killed -> Cleaned`
//!   (`Killed` may be skipped, `TargetInitialized` may be skipped by an early kill)
//! - The target is only handed to operations in `TargetInitialized`
//! - The target's `clean` hook runs at most once

pub mod walltime;

pub use walltime::WallTimer;

use async_trait::async_trait;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardState {
    NotInitialized,
    TargetInitialized,
    Killed,
    Cleaned,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardError {
    #[error("Illegal state for {operation} on {guard} guard: {state:?}")]
    IllegalState {
        guard: &'static str,
        operation: &'static str,
        state: GuardState,
    },

    #[error("Operation on {0} guard was killed")]
    Killed(&'static str),

    #[error("Worker of {0} guard is no longer running")]
    WorkerStopped(&'static str),
}

/// A resource protected by a `Guard`.
#[async_trait]
pub trait GuardTarget: Send + Sync + 'static {
    /// Synchronous interrupt hook called by `Guard::kill`. Best effort.
    fn interrupt(&self) {}

    /// Current progress in percent. Values outside 0..=100 are clamped.
    fn progress(&self) -> i32 {
        0
    }

    /// Release the resources held by the target.
    async fn clean(&self) -> anyhow::Result<()> {
        Ok(())
    }
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

struct GuardInner<T: ?Sized> {
    state: GuardState,
    target: Option<Arc<T>>,
    killed: bool,
    walltimed: bool,
    last_progress: i32,
}

pub struct Guard<T: ?Sized + GuardTarget> {
    name: &'static str,
    inner: Mutex<GuardInner<T>>,
    /// Serializes `submit` so only one operation is in flight.
    slot: tokio::sync::Mutex<()>,
    jobs: Mutex<Option<mpsc::UnboundedSender<Job>>>,
    cancel: CancellationToken,
}

impl<T: ?Sized + GuardTarget> Guard<T> {
    /// Create a guard and start its worker. Must be called within a tokio runtime.
    pub fn new(name: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                job.await;
            }
            debug!(guard = name, "Guard worker stopped");
        });

        Self {
            name,
            inner: Mutex::new(GuardInner {
                state: GuardState::NotInitialized,
                target: None,
                killed: false,
                walltimed: false,
                last_progress: 0,
            }),
            slot: tokio::sync::Mutex::new(()),
            jobs: Mutex::new(Some(tx)),
            cancel: CancellationToken::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, GuardInner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn state(&self) -> GuardState {
        self.lock().state
    }

    pub fn was_killed(&self) -> bool {
        self.lock().killed
    }

    pub fn was_walltimed(&self) -> bool {
        self.lock().walltimed
    }

    /// Install the target.
    ///
    /// # Errors
    ///
    /// `GuardError::IllegalState` unless the guard is still `NotInitialized`.
    pub fn initialize(&self, target: Arc<T>) -> Result<(), GuardError> {
        let mut inner = self.lock();
        if inner.state != GuardState::NotInitialized {
            return Err(GuardError::IllegalState {
                guard: self.name,
                operation: "initialize",
                state: inner.state,
            });
        }
        inner.target = Some(target);
        inner.state = GuardState::TargetInitialized;
        Ok(())
    }

    /// Run `op` on the dedicated worker and wait for it.
    ///
    /// A concurrent `submit` waits until this one completes. If the guard is
    /// killed while `op` is in flight, the op future is dropped and this
    /// returns `GuardError::Killed`.
    pub async fn submit<R, F, Fut>(&self, op: F) -> Result<R, GuardError>
    where
        F: FnOnce(Arc<T>, CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: Send + 'static,
    {
        let _slot = self.slot.lock().await;

        let target = {
            let inner = self.lock();
            match (inner.state, inner.target.clone()) {
                (GuardState::TargetInitialized, Some(target)) => target,
                (GuardState::Killed, _) => return Err(GuardError::Killed(self.name)),
                (state, _) => {
                    return Err(GuardError::IllegalState {
                        guard: self.name,
                        operation: "submit",
                        state,
                    })
                }
            }
        };

        let token = self.cancel.child_token();
        let op_token = token.clone();
        let name = self.name;
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let outcome = tokio::select! {
                biased;
                _ = token.cancelled() => Err(GuardError::Killed(name)),
                value = op(target, op_token) => Ok(value),
            };
            let _ = tx.send(outcome);
        });

        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or(GuardError::WorkerStopped(self.name))?;
        sender
            .send(job)
            .map_err(|_| GuardError::WorkerStopped(self.name))?;

        match rx.await {
            Ok(outcome) => outcome,
            Err(_) => Err(GuardError::Killed(self.name)),
        }
    }

    /// Kill the guard: cancel the in-flight operation and interrupt the target.
    ///
    /// Idempotent. A kill before `initialize` is remembered and makes every
    /// later `initialize`/`submit` fail.
    pub fn kill(&self, walltime: bool) {
        let target = {
            let mut inner = self.lock();
            if matches!(inner.state, GuardState::Killed | GuardState::Cleaned) {
                return;
            }
            inner.state = GuardState::Killed;
            inner.killed = true;
            inner.walltimed = walltime;
            inner.target.clone()
        };

        debug!(guard = self.name, walltime, "Killing guard");
        self.cancel.cancel();
        if let Some(target) = target {
            target.interrupt();
        }
    }

    /// Progress of the target: 0 before initialization, the clamped live value
    /// while running, and the last observed value once killed or cleaned.
    pub fn progress(&self) -> i32 {
        let mut inner = self.lock();
        match inner.state {
            GuardState::NotInitialized => 0,
            GuardState::TargetInitialized => {
                if let Some(target) = inner.target.clone() {
                    inner.last_progress = target.progress().clamp(0, 100);
                }
                inner.last_progress
            }
            GuardState::Killed | GuardState::Cleaned => inner.last_progress,
        }
    }

    /// Run the target's cleanup on the worker, bounded by `timeout`.
    ///
    /// Idempotent. The state becomes `Cleaned` even when the cleanup fails or
    /// times out; failures are logged, never returned.
    pub async fn clean(&self, timeout: Duration) {
        let target = {
            let mut inner = self.lock();
            if inner.state == GuardState::Cleaned {
                return;
            }
            inner.state = GuardState::Cleaned;
            inner.target.take()
        };

        let sender = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        let (Some(target), Some(sender)) = (target, sender) else {
            return;
        };

        let (tx, rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = tx.send(target.clean().await);
        });
        if sender.send(job).is_err() {
            warn!(guard = self.name, "Guard worker gone before cleanup");
            return;
        }
        drop(sender);

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(()))) => debug!(guard = self.name, "Guard cleaned"),
            Ok(Ok(Err(e))) => warn!(guard = self.name, "Cleanup failed: {:#}", e),
            Ok(Err(_)) => warn!(guard = self.name, "Cleanup was dropped by the worker"),
            Err(_) => warn!(
                guard = self.name,
                "Cleanup did not finish within {}ms, abandoning it",
                timeout.as_millis()
            ),
        }
    }
}
