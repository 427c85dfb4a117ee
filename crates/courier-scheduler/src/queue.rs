//! Dispatch job queue — delayed jobs that invoke the engine for one message.
//!
//! `TimerQueue` runs inside the daemon: every job waits on its own tokio
//! timer and is handed to the worker pool when due. `DeferredQueue` only
//! mints handles; short-lived CLI processes persist the handle and the
//! daemon adopts the job on its next sweep.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::AbortHandle;

/// Opaque job identifier, stored on the message as `job_id`.
pub type JobHandle = String;

/// A job whose delay has elapsed.
#[derive(Debug, Clone, PartialEq)]
pub struct DueJob {
    pub handle: JobHandle,
    pub message_id: i64,
}

/// Scheduling seam between the dispatch engine and whatever runs jobs.
pub trait JobQueue: Send + Sync {
    /// Queue a job for `message_id` to fire after `delay`.
    fn enqueue(&self, message_id: i64, delay: Duration) -> JobHandle;

    /// Take over a job created elsewhere under an existing handle.
    /// Returns false if the handle is already tracked or cannot be run here.
    fn adopt(&self, handle: &str, message_id: i64, delay: Duration) -> bool;

    /// Cancel a job that has not fired yet.
    fn cancel(&self, handle: &str) -> bool;

    /// Forget a job after it has been handled.
    fn finish(&self, handle: &str);
}

fn new_handle() -> JobHandle {
    uuid::Uuid::new_v4().to_string()
}

/// In-process queue backed by tokio timers. Must be used inside a runtime.
pub struct TimerQueue {
    timers: Mutex<HashMap<JobHandle, AbortHandle>>,
    due_tx: mpsc::UnboundedSender<DueJob>,
}

impl TimerQueue {
    /// Create the queue and the receiver the worker pool drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DueJob>) {
        let (due_tx, due_rx) = mpsc::unbounded_channel();
        let queue = Self {
            timers: Mutex::new(HashMap::new()),
            due_tx,
        };
        (queue, due_rx)
    }

    fn schedule(&self, handle: JobHandle, message_id: i64, delay: Duration) {
        let tx = self.due_tx.clone();
        let job = DueJob {
            handle: handle.clone(),
            message_id,
        };
        // Registered under the lock so a zero-delay job cannot finish first.
        let mut timers = self.timers.lock().unwrap_or_else(|e| e.into_inner());
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx.send(job).is_err() {
                tracing::debug!("Job for message {message_id} fired after shutdown");
            }
        });
        timers.insert(handle, task.abort_handle());
    }

    /// Jobs scheduled and not yet finished or cancelled.
    pub fn pending(&self) -> usize {
        self.timers.lock().map(|t| t.len()).unwrap_or(0)
    }

    pub fn contains(&self, handle: &str) -> bool {
        self.timers
            .lock()
            .map(|t| t.contains_key(handle))
            .unwrap_or(false)
    }
}

impl JobQueue for TimerQueue {
    fn enqueue(&self, message_id: i64, delay: Duration) -> JobHandle {
        let handle = new_handle();
        self.schedule(handle.clone(), message_id, delay);
        tracing::debug!("⏱️ Job {handle} queued for message {message_id} in {delay:?}");
        handle
    }

    fn adopt(&self, handle: &str, message_id: i64, delay: Duration) -> bool {
        if self.contains(handle) {
            return false;
        }
        self.schedule(handle.to_string(), message_id, delay);
        tracing::debug!("⏱️ Job {handle} adopted for message {message_id} in {delay:?}");
        true
    }

    fn cancel(&self, handle: &str) -> bool {
        let removed = self
            .timers
            .lock()
            .ok()
            .and_then(|mut t| t.remove(handle));
        match removed {
            Some(timer) => {
                timer.abort();
                true
            }
            None => false,
        }
    }

    fn finish(&self, handle: &str) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.remove(handle);
        }
    }
}

/// Handle-only queue for processes that do not run jobs themselves.
#[derive(Debug, Default)]
pub struct DeferredQueue;

impl JobQueue for DeferredQueue {
    fn enqueue(&self, message_id: i64, delay: Duration) -> JobHandle {
        let handle = new_handle();
        tracing::debug!("Job {handle} for message {message_id} deferred to daemon ({delay:?})");
        handle
    }

    fn adopt(&self, _handle: &str, _message_id: i64, _delay: Duration) -> bool {
        false
    }

    // The daemon's timer, if any, finds the handle cleared on the message
    // and drops the job.
    fn cancel(&self, _handle: &str) -> bool {
        false
    }

    fn finish(&self, _handle: &str) {}
}
