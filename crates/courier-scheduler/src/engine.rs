//! Dispatch engine — the state machine around scheduled messages.
//!
//! ```text
//! PENDING ──trigger/force──▶ SCHEDULED ──job fires──▶ PARTIAL ──▶ SENT
//!    │                          │                      │  ▲
//!    └──cancel──▶ CANCELLED ◀───┘          rate limit ─┘  │
//!                                                         │
//!                               FAILED ──retry job fires──┘
//!                                  └──force──▶ SCHEDULED
//! ```
//!
//! Jobs carry a handle that must match the message's stored `job_id`;
//! anything else is stale and ignored. At most one send loop runs per message.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use courier_core::error::{CourierError, DispatchFailure, Result};
use courier_core::traits::{Account, ChannelFactory};
use tokio::sync::{Semaphore, mpsc};

use crate::ledger::Ledger;
use crate::message::{LedgerEntry, MessageStatus, Recipient, ScheduledMessage};
use crate::notify::LogSink;
use crate::persistence::DispatchDb;
use crate::queue::{DueJob, JobQueue};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::send_loop::{LoopReport, run_send_loop};

const SOURCE: &str = "engine";

/// Delay before a follow-up pass for recipients attached mid-loop. Long
/// enough for the running loop to release the message.
const REQUEUE_DELAY: Duration = Duration::from_secs(1);

/// Why a fired job did nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum SkipReason {
    /// The message no longer carries this job's handle.
    Stale,
    /// A send loop for the message is already running.
    AlreadyRunning,
    /// The message is in a state no job should run from.
    Inactive(MessageStatus),
}

/// Result of handling one fired job.
#[derive(Debug, Clone, PartialEq)]
pub enum FireOutcome {
    Sent(LoopReport),
    RateLimited { delay: Duration },
    RetryScheduled { attempt: u32, delay: Duration },
    /// Recipients were attached while the loop ran; another pass is queued.
    Requeued { outstanding: usize },
    Failed(String),
    Skipped(SkipReason),
}

/// The dispatch engine.
pub struct DispatchEngine {
    db: Arc<DispatchDb>,
    ledger: Ledger,
    factory: Arc<dyn ChannelFactory>,
    queue: Arc<dyn JobQueue>,
    policy: RetryPolicy,
    log: LogSink,
    in_flight: Mutex<HashSet<i64>>,
}

/// Marks a message as having a running loop until dropped.
struct InFlight<'a> {
    set: &'a Mutex<HashSet<i64>>,
    message_id: i64,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Ok(mut set) = self.set.lock() {
            set.remove(&self.message_id);
        }
    }
}

impl DispatchEngine {
    pub fn new(
        db: Arc<DispatchDb>,
        factory: Arc<dyn ChannelFactory>,
        queue: Arc<dyn JobQueue>,
        policy: RetryPolicy,
        log: LogSink,
    ) -> Self {
        Self {
            ledger: Ledger::new(db.clone()),
            db,
            factory,
            queue,
            policy,
            log,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn db(&self) -> &Arc<DispatchDb> {
        &self.db
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn log(&self) -> &LogSink {
        &self.log
    }

    // ─── Authoring ────────────────────────────────────────────

    /// Create a PENDING message for `account_id`.
    pub fn create_message(
        &self,
        account_id: i64,
        text: &str,
        attachment: Option<&str>,
        scheduled_at: DateTime<Utc>,
    ) -> Result<ScheduledMessage> {
        self.db.get_account(account_id)?;
        let message = self.db.create_message(account_id, text, attachment, scheduled_at)?;
        self.log.info(
            SOURCE,
            format!("Message {} created for {}", message.id, scheduled_at.to_rfc3339()),
        );
        Ok(message)
    }

    /// Attach recipients, then evaluate the trigger. This is the only path
    /// that schedules a message automatically.
    pub fn attach_recipients(
        &self,
        message_id: i64,
        recipient_ids: &[i64],
    ) -> Result<ScheduledMessage> {
        let message = self.db.get_message(message_id)?;
        if message.status.is_terminal() {
            return Err(CourierError::InvalidTransition {
                id: message_id,
                from: message.status.to_string(),
                to: "recipients changed".into(),
            });
        }
        let added = self.db.attach_recipients(message_id, recipient_ids)?;
        if added > 0 {
            tracing::debug!("Message {message_id}: {added} recipient(s) attached");
        }
        self.evaluate_trigger(message_id)?;
        self.db.get_message(message_id)
    }

    /// Schedule a PENDING message that has recipients and a future time.
    /// Returns whether a job was created.
    pub fn evaluate_trigger(&self, message_id: i64) -> Result<bool> {
        let mut message = self.db.get_message(message_id)?;
        if message.status != MessageStatus::Pending {
            return Ok(false);
        }
        if self.db.message_recipients(message_id)?.is_empty() {
            return Ok(false);
        }
        let now = Utc::now();
        if message.scheduled_at <= now {
            self.log.warning(
                SOURCE,
                format!(
                    "Message {message_id} not scheduled: {} is in the past",
                    message.scheduled_at.to_rfc3339()
                ),
            );
            return Ok(false);
        }

        let delay = until(message.scheduled_at, now);
        let handle = self.queue.enqueue(message_id, delay);
        message.status = MessageStatus::Scheduled;
        message.job_id = Some(handle);
        message.next_run_at = Some(message.scheduled_at);
        message.retry_count = 0;
        message.last_error = None;
        self.db.save_dispatch_state(&message)?;

        self.log.info(
            SOURCE,
            format!(
                "📅 Message {message_id} scheduled for {}",
                message.scheduled_at.to_rfc3339()
            ),
        );
        Ok(true)
    }

    /// Send now, replacing any queued job. A FAILED message starts over
    /// with a fresh retry budget.
    pub fn force_dispatch(&self, message_id: i64) -> Result<ScheduledMessage> {
        let mut message = self.db.get_message(message_id)?;
        if !message.status.can_transition_to(MessageStatus::Scheduled) {
            return Err(invalid(&message, MessageStatus::Scheduled));
        }
        if self.db.message_recipients(message_id)?.is_empty() {
            return Err(CourierError::NoRecipients(message_id));
        }

        let (from, old) = (message.status, message.job_id.take());
        let handle = self.queue.enqueue(message_id, Duration::ZERO);
        message.status = MessageStatus::Scheduled;
        message.job_id = Some(handle.clone());
        message.next_run_at = Some(Utc::now());
        message.retry_count = 0;
        message.last_error = None;
        if !self.db.compare_and_save(&message, from, old.as_deref())? {
            self.queue.cancel(&handle);
            return Err(invalid(&self.db.get_message(message_id)?, MessageStatus::Scheduled));
        }
        if let Some(old) = old {
            self.queue.cancel(&old);
        }

        self.log.info(SOURCE, format!("Message {message_id} forced for immediate dispatch"));
        Ok(message)
    }

    /// Cancel a message whose send loop has not started.
    pub fn cancel(&self, message_id: i64) -> Result<ScheduledMessage> {
        let mut message = self.db.get_message(message_id)?;
        if !message.status.can_transition_to(MessageStatus::Cancelled) {
            return Err(invalid(&message, MessageStatus::Cancelled));
        }
        let (from, job) = (message.status, message.job_id.take());
        message.status = MessageStatus::Cancelled;
        message.next_run_at = None;
        // A job that started in the meantime wins.
        if !self.db.compare_and_save(&message, from, job.as_deref())? {
            return Err(invalid(&self.db.get_message(message_id)?, MessageStatus::Cancelled));
        }
        if let Some(handle) = job {
            self.queue.cancel(&handle);
        }

        self.log.info(SOURCE, format!("Message {message_id} cancelled"));
        Ok(message)
    }

    // ─── Execution ────────────────────────────────────────────

    /// Handle a fired job.
    pub async fn fire(&self, message_id: i64, handle: &str) -> Result<FireOutcome> {
        let Some(_guard) = self.try_begin(message_id) else {
            tracing::debug!("Message {message_id} already running, job {handle} dropped");
            return Ok(FireOutcome::Skipped(SkipReason::AlreadyRunning));
        };

        let mut message = self.db.get_message(message_id)?;
        if message.job_id.as_deref() != Some(handle) {
            tracing::debug!("Stale job {handle} for message {message_id} ignored");
            return Ok(FireOutcome::Skipped(SkipReason::Stale));
        }
        if !message.status.can_transition_to(MessageStatus::Partial) {
            return Ok(FireOutcome::Skipped(SkipReason::Inactive(message.status)));
        }

        // Job handle stays until the outcome is known so a crash mid-loop
        // leaves a PARTIAL message that recovery resumes.
        let from = message.status;
        message.status = MessageStatus::Partial;
        if !self.db.compare_and_save(&message, from, Some(handle))? {
            tracing::debug!("Message {message_id} changed before job {handle} could claim it");
            return Ok(FireOutcome::Skipped(SkipReason::Stale));
        }
        tracing::info!("🔔 Dispatching message {message_id} (job {handle})");

        let (account, result) = self.execute(&message).await;
        self.complete(message, account.as_ref(), result)
    }

    async fn execute(
        &self,
        message: &ScheduledMessage,
    ) -> (Option<Account>, std::result::Result<LoopReport, DispatchFailure>) {
        let account = match self.db.get_account(message.account_id) {
            Ok(account) => account,
            Err(e) => return (None, Err(e.into())),
        };
        let recipients = match self.db.message_recipients(message.id) {
            Ok(recipients) => recipients,
            Err(e) => return (Some(account), Err(e.into())),
        };
        let result = run_send_loop(
            self.factory.as_ref(),
            &self.ledger,
            &account,
            message,
            &recipients,
        )
        .await;
        (Some(account), result)
    }

    fn complete(
        &self,
        mut message: ScheduledMessage,
        account: Option<&Account>,
        result: std::result::Result<LoopReport, DispatchFailure>,
    ) -> Result<FireOutcome> {
        let failure = match result {
            Ok(report) if report.is_clean() => {
                let outstanding = self.ledger.outstanding(message.id)?;
                if !outstanding.is_empty() {
                    return self.requeue(message, outstanding.len());
                }
                message.status = MessageStatus::Sent;
                message.job_id = None;
                message.next_run_at = None;
                message.last_error = None;
                self.db.save_dispatch_state(&message)?;
                self.log.info(
                    SOURCE,
                    format!(
                        "✅ Message {} sent ({} new, {} already delivered)",
                        message.id,
                        report.sent.len(),
                        report.skipped.len()
                    ),
                );
                return Ok(FireOutcome::Sent(report));
            }
            Ok(report) => DispatchFailure::LoopFailed(report.failure_summary()),
            Err(failure) => failure,
        };
        self.handle_failure(message, account, failure)
    }

    /// Keep the message PARTIAL and queue another pass for recipients the
    /// finished loop never saw. Does not touch the retry budget.
    fn requeue(&self, mut message: ScheduledMessage, outstanding: usize) -> Result<FireOutcome> {
        let id = message.id;
        message.job_id = Some(self.queue.enqueue(id, REQUEUE_DELAY));
        message.next_run_at = Some(Utc::now() + to_chrono(REQUEUE_DELAY));
        self.db.save_dispatch_state(&message)?;
        self.log.info(
            SOURCE,
            format!("Message {id}: {outstanding} recipient(s) attached during send, queued another pass"),
        );
        Ok(FireOutcome::Requeued { outstanding })
    }

    fn handle_failure(
        &self,
        mut message: ScheduledMessage,
        account: Option<&Account>,
        failure: DispatchFailure,
    ) -> Result<FireOutcome> {
        let id = message.id;
        let now = Utc::now();

        let outcome = match self.policy.decide(&failure, message.retry_count) {
            RetryDecision::Wait(delay) => {
                message.status = MessageStatus::Partial;
                message.job_id = Some(self.queue.enqueue(id, delay));
                message.next_run_at = Some(now + to_chrono(delay));
                message.last_error = Some(format!("rate_limited: {failure}"));
                self.db.save_dispatch_state(&message)?;
                self.log.warning(
                    SOURCE,
                    format!("Message {id} rate limited, resuming in {}s", delay.as_secs()),
                );
                FireOutcome::RateLimited { delay }
            }
            RetryDecision::Retry { attempt, delay } => {
                message.status = MessageStatus::Failed;
                message.retry_count = attempt + 1;
                message.job_id = Some(self.queue.enqueue(id, delay));
                message.next_run_at = Some(now + to_chrono(delay));
                message.last_error = Some(format!("failed: {failure}"));
                self.db.save_dispatch_state(&message)?;
                self.log.warning(
                    SOURCE,
                    format!(
                        "Message {id} failed ({failure}), retry {}/{} in {}s",
                        attempt + 1,
                        self.policy.max_retries,
                        delay.as_secs()
                    ),
                );
                FireOutcome::RetryScheduled { attempt, delay }
            }
            RetryDecision::Exhausted => {
                let reason = format!("failed: {failure} (retries exhausted)");
                self.fail_terminally(&mut message, reason.clone())?;
                self.log.error(SOURCE, format!("❌ Message {id} {reason}"));
                FireOutcome::Failed(reason)
            }
            RetryDecision::Terminal => {
                if let Some(account) = account {
                    self.factory.invalidate(account);
                }
                let reason = format!("authorization: {failure}");
                self.fail_terminally(&mut message, reason.clone())?;
                self.log.error(
                    SOURCE,
                    format!(
                        "🔐 Message {id} stopped, account {} needs re-authorization: {failure}",
                        account.map(|a| a.name.as_str()).unwrap_or("unknown")
                    ),
                );
                FireOutcome::Failed(reason)
            }
        };
        Ok(outcome)
    }

    fn fail_terminally(&self, message: &mut ScheduledMessage, reason: String) -> Result<()> {
        message.status = MessageStatus::Failed;
        message.job_id = None;
        message.next_run_at = None;
        message.last_error = Some(reason);
        self.db.save_dispatch_state(message)
    }

    fn try_begin(&self, message_id: i64) -> Option<InFlight<'_>> {
        let mut set = self.in_flight.lock().ok()?;
        if !set.insert(message_id) {
            return None;
        }
        Some(InFlight {
            set: &self.in_flight,
            message_id,
        })
    }

    // ─── Daemon ───────────────────────────────────────────────

    /// Adopt persisted jobs that the live queue does not track yet (after a
    /// restart, or created by another process). Returns how many were adopted.
    pub fn recover(&self) -> Result<usize> {
        let now = Utc::now();
        let mut adopted = 0;
        for message in self.db.messages_with_jobs()? {
            let (Some(handle), Some(due)) = (message.job_id.as_deref(), message.next_run_at)
            else {
                continue;
            };
            if !message.has_pending_job() {
                continue;
            }
            if self.queue.adopt(handle, message.id, until(due, now)) {
                adopted += 1;
                tracing::debug!(
                    "Adopted job {handle} for message {} ({})",
                    message.id,
                    message.status
                );
            }
        }
        if adopted > 0 {
            self.log.info(SOURCE, format!("♻️ Adopted {adopted} pending dispatch job(s)"));
        }
        Ok(adopted)
    }

    /// Drain due jobs with at most `workers` send loops running at once.
    pub async fn run_workers(self: Arc<Self>, mut due: mpsc::UnboundedReceiver<DueJob>, workers: usize) {
        let permits = Arc::new(Semaphore::new(workers.max(1)));
        while let Some(job) = due.recv().await {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };
            let engine = self.clone();
            tokio::spawn(async move {
                match engine.fire(job.message_id, &job.handle).await {
                    Ok(outcome) => {
                        tracing::debug!("Job {} finished: {outcome:?}", job.handle);
                    }
                    Err(e) => {
                        engine.log.error(
                            SOURCE,
                            format!("Job {} for message {} errored: {e}", job.handle, job.message_id),
                        );
                    }
                }
                engine.queue.finish(&job.handle);
                drop(permit);
            });
        }
        tracing::info!("Dispatch worker pool stopped");
    }

    // ─── Read access ──────────────────────────────────────────

    pub fn message(&self, message_id: i64) -> Result<ScheduledMessage> {
        self.db.get_message(message_id)
    }

    pub fn recipients(&self, message_id: i64) -> Result<Vec<Recipient>> {
        self.db.message_recipients(message_id)
    }

    pub fn ledger_entries(&self, message_id: i64) -> Result<Vec<LedgerEntry>> {
        self.ledger.entries(message_id)
    }
}

fn invalid(message: &ScheduledMessage, to: MessageStatus) -> CourierError {
    CourierError::InvalidTransition {
        id: message.id,
        from: message.status.to_string(),
        to: to.to_string(),
    }
}

fn until(at: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (at - now).to_std().unwrap_or(Duration::ZERO)
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::DeliveryStatus;
    use crate::testing::{RecordingQueue, ScriptedFactory};
    use courier_core::error::SendError;

    struct Harness {
        engine: Arc<DispatchEngine>,
        db: Arc<DispatchDb>,
        queue: Arc<RecordingQueue>,
        factory: Arc<ScriptedFactory>,
        account: Account,
    }

    impl Harness {
        fn new() -> Self {
            let db = Arc::new(DispatchDb::open_in_memory().unwrap());
            let queue = Arc::new(RecordingQueue::default());
            let factory = Arc::new(ScriptedFactory::new());
            let account = db.create_account("main", "+1 555 0100", None).unwrap();
            let engine = Arc::new(DispatchEngine::new(
                db.clone(),
                factory.clone(),
                queue.clone(),
                RetryPolicy::default(),
                LogSink::new(db.clone()),
            ));
            Self { engine, db, queue, factory, account }
        }

        fn message_in(&self, offset: chrono::Duration) -> ScheduledMessage {
            self.engine
                .create_message(self.account.id, "hello", None, Utc::now() + offset)
                .unwrap()
        }

        fn recipient(&self, handle: &str) -> Recipient {
            self.db.create_recipient(handle, handle).unwrap()
        }

        /// Fire the job currently stored on the message.
        async fn fire_current(&self, message_id: i64) -> FireOutcome {
            let handle = self.engine.message(message_id).unwrap().job_id.unwrap();
            self.engine.fire(message_id, &handle).await.unwrap()
        }
    }

    #[test]
    fn test_first_attachment_schedules_once() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        let b = h.recipient("@b");

        let scheduled = h.engine.attach_recipients(message.id, &[a.id]).unwrap();
        assert_eq!(scheduled.status, MessageStatus::Scheduled);
        assert!(scheduled.job_id.is_some());
        let delay = h.queue.enqueued()[0].1;
        assert!(delay > Duration::from_secs(3500) && delay <= Duration::from_secs(3600));

        let again = h.engine.attach_recipients(message.id, &[b.id]).unwrap();
        assert_eq!(again.status, MessageStatus::Scheduled);
        assert_eq!(again.job_id, scheduled.job_id);
        assert_eq!(h.queue.enqueued().len(), 1);
        assert_eq!(h.engine.recipients(message.id).unwrap().len(), 2);
    }

    #[test]
    fn test_no_recipients_stays_pending() {
        let h = Harness::new();
        for offset in [chrono::Duration::hours(1), chrono::Duration::hours(-1)] {
            let message = h.message_in(offset);
            assert!(!h.engine.evaluate_trigger(message.id).unwrap());
            let after = h.engine.attach_recipients(message.id, &[]).unwrap();
            assert_eq!(after.status, MessageStatus::Pending);
            assert!(matches!(
                h.engine.force_dispatch(message.id),
                Err(CourierError::NoRecipients(_))
            ));
            assert_eq!(h.engine.message(message.id).unwrap().status, MessageStatus::Pending);
        }
        assert!(h.queue.enqueued().is_empty());
    }

    #[test]
    fn test_past_schedule_stays_pending() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::minutes(-5));
        let a = h.recipient("@a");
        let after = h.engine.attach_recipients(message.id, &[a.id]).unwrap();
        assert_eq!(after.status, MessageStatus::Pending);
        assert!(h.queue.enqueued().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_before_fire_never_sends() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        let scheduled = h.engine.attach_recipients(message.id, &[a.id]).unwrap();
        let handle = scheduled.job_id.unwrap();

        let cancelled = h.engine.cancel(message.id).unwrap();
        assert_eq!(cancelled.status, MessageStatus::Cancelled);
        assert!(cancelled.job_id.is_none());
        assert_eq!(h.queue.cancelled(), vec![handle.clone()]);

        // Even if the job fires anyway, the loop does not run.
        let outcome = h.engine.fire(message.id, &handle).await.unwrap();
        assert_eq!(outcome, FireOutcome::Skipped(SkipReason::Stale));
        assert!(h.factory.attempted().is_empty());
        assert_eq!(h.engine.message(message.id).unwrap().status, MessageStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_fire_sends_and_completes() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        let b = h.recipient("@b");
        h.engine.attach_recipients(message.id, &[a.id, b.id]).unwrap();

        let outcome = h.fire_current(message.id).await;
        assert!(matches!(outcome, FireOutcome::Sent(ref r) if r.sent.len() == 2));

        let done = h.engine.message(message.id).unwrap();
        assert_eq!(done.status, MessageStatus::Sent);
        assert!(done.job_id.is_none());
        assert_eq!(h.factory.sent_to(), vec!["@a", "@b"]);
    }

    #[tokio::test]
    async fn test_rate_limit_reschedules_with_wait_and_margin() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let ids: Vec<i64> = ["@a", "@b", "@c"].iter().map(|r| h.recipient(r).id).collect();
        h.engine.attach_recipients(message.id, &ids).unwrap();
        h.factory.script("@b", vec![Err(SendError::FloodWait { seconds: 30 })]);

        let outcome = h.fire_current(message.id).await;
        assert_eq!(outcome, FireOutcome::RateLimited { delay: Duration::from_secs(35) });
        assert_eq!(h.factory.attempted(), vec!["@a", "@b"]);

        let limited = h.engine.message(message.id).unwrap();
        assert_eq!(limited.status, MessageStatus::Partial);
        assert_eq!(limited.retry_count, 0);
        let (_, delay, handle) = h.queue.enqueued().last().cloned().unwrap();
        assert!(delay >= Duration::from_secs(30));
        assert_eq!(limited.job_id, Some(handle));

        // Resumes with the remaining recipients only.
        let outcome = h.fire_current(message.id).await;
        assert!(matches!(outcome, FireOutcome::Sent(_)));
        assert_eq!(h.factory.sent_to(), vec!["@a", "@b", "@c"]);
    }

    #[tokio::test]
    async fn test_generic_failures_back_off_then_stop() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        h.engine.attach_recipients(message.id, &[a.id]).unwrap();
        h.factory.fail_connect(SendError::Disconnected("network down".into()));

        let mut delays = Vec::new();
        for attempt in 0..5 {
            match h.fire_current(message.id).await {
                FireOutcome::RetryScheduled { attempt: a, delay } => {
                    assert_eq!(a, attempt);
                    delays.push(delay);
                }
                other => panic!("expected retry, got {other:?}"),
            }
            let m = h.engine.message(message.id).unwrap();
            assert_eq!(m.status, MessageStatus::Failed);
            assert_eq!(m.retry_count, attempt + 1);
        }
        assert!(delays.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(delays[0], Duration::from_secs(60));

        let last_handle = h.engine.message(message.id).unwrap().job_id.unwrap();
        let outcome = h.engine.fire(message.id, &last_handle).await.unwrap();
        assert!(matches!(outcome, FireOutcome::Failed(_)));

        let failed = h.engine.message(message.id).unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert!(failed.job_id.is_none());
        assert!(failed.last_error.unwrap().contains("retries exhausted"));
        // 1 initial schedule + 5 retries; no sixth retry job.
        assert_eq!(h.queue.enqueued().len(), 6);

        let stale = h.engine.fire(message.id, &last_handle).await.unwrap();
        assert_eq!(stale, FireOutcome::Skipped(SkipReason::Stale));
    }

    #[tokio::test]
    async fn test_flaky_recipient_ends_with_single_sent_entries() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        let b = h.recipient("@b");
        h.engine.attach_recipients(message.id, &[a.id, b.id]).unwrap();
        h.factory.script(
            "@b",
            vec![
                Err(SendError::Rejected("timeout".into())),
                Err(SendError::Rejected("timeout".into())),
            ],
        );

        assert!(matches!(h.fire_current(message.id).await, FireOutcome::RetryScheduled { .. }));
        assert!(matches!(h.fire_current(message.id).await, FireOutcome::RetryScheduled { .. }));
        assert!(matches!(h.fire_current(message.id).await, FireOutcome::Sent(_)));

        let entries = h.engine.ledger_entries(message.id).unwrap();
        let for_a: Vec<DeliveryStatus> = entries
            .iter()
            .filter(|e| e.recipient_id == a.id)
            .map(|e| e.status)
            .collect();
        let for_b: Vec<DeliveryStatus> = entries
            .iter()
            .filter(|e| e.recipient_id == b.id)
            .map(|e| e.status)
            .collect();
        assert_eq!(for_a, vec![DeliveryStatus::Sent]);
        assert_eq!(
            for_b,
            vec![DeliveryStatus::Failed, DeliveryStatus::Failed, DeliveryStatus::Sent]
        );
        assert_eq!(h.factory.sent_to(), vec!["@a", "@b"]);
        assert_eq!(h.engine.message(message.id).unwrap().status, MessageStatus::Sent);
    }

    #[tokio::test]
    async fn test_authorization_failure_is_terminal() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        h.engine.attach_recipients(message.id, &[a.id]).unwrap();
        h.factory.fail_connect(SendError::Unauthorized("session revoked".into()));
        let mut events = h.engine.log().subscribe();

        let outcome = h.fire_current(message.id).await;
        assert!(matches!(outcome, FireOutcome::Failed(ref r) if r.starts_with("authorization:")));

        let failed = h.engine.message(message.id).unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert!(failed.job_id.is_none());
        assert_eq!(h.factory.invalidations(), 1);
        // Only the initial schedule; no retry.
        assert_eq!(h.queue.enqueued().len(), 1);

        let mut saw_error = false;
        while let Ok(event) = events.try_recv() {
            saw_error |= event.level == crate::message::LogLevel::Error;
        }
        assert!(saw_error);
    }

    #[tokio::test]
    async fn test_force_replaces_job_and_resets_retries() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(2));
        let a = h.recipient("@a");
        let scheduled = h.engine.attach_recipients(message.id, &[a.id]).unwrap();
        let old = scheduled.job_id.unwrap();

        let forced = h.engine.force_dispatch(message.id).unwrap();
        assert_eq!(forced.status, MessageStatus::Scheduled);
        assert_ne!(forced.job_id.as_deref(), Some(old.as_str()));
        assert_eq!(h.queue.cancelled(), vec![old.clone()]);
        assert_eq!(h.queue.enqueued().last().unwrap().1, Duration::ZERO);

        assert_eq!(
            h.engine.fire(message.id, &old).await.unwrap(),
            FireOutcome::Skipped(SkipReason::Stale)
        );
        assert!(matches!(h.fire_current(message.id).await, FireOutcome::Sent(_)));
    }

    #[tokio::test]
    async fn test_force_restarts_failed_message_with_fresh_budget() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        h.engine.attach_recipients(message.id, &[a.id]).unwrap();
        h.factory.script(
            "@a",
            vec![
                Err(SendError::Disconnected("connection reset".into())),
                Err(SendError::Disconnected("connection reset".into())),
            ],
        );
        h.fire_current(message.id).await;
        h.fire_current(message.id).await;

        let failed = h.engine.message(message.id).unwrap();
        assert_eq!(failed.status, MessageStatus::Failed);
        assert_eq!(failed.retry_count, 2);
        let retry = failed.job_id.unwrap();
        assert!(h.engine.cancel(message.id).is_err());

        let forced = h.engine.force_dispatch(message.id).unwrap();
        assert_eq!(forced.status, MessageStatus::Scheduled);
        assert_eq!(forced.retry_count, 0);
        assert!(forced.last_error.is_none());
        assert_eq!(h.queue.cancelled(), vec![retry.clone()]);
        assert_eq!(h.queue.enqueued().last().unwrap().1, Duration::ZERO);

        assert_eq!(
            h.engine.fire(message.id, &retry).await.unwrap(),
            FireOutcome::Skipped(SkipReason::Stale)
        );
        assert!(matches!(h.fire_current(message.id).await, FireOutcome::Sent(_)));
        assert_eq!(h.factory.sent_to(), vec!["@a"]);
    }

    #[tokio::test]
    async fn test_rate_limit_during_retry_wait_keeps_budget() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        h.engine.attach_recipients(message.id, &[a.id]).unwrap();
        h.factory.script(
            "@a",
            vec![
                Err(SendError::Disconnected("connection reset".into())),
                Err(SendError::FloodWait { seconds: 20 }),
            ],
        );

        assert!(matches!(
            h.fire_current(message.id).await,
            FireOutcome::RetryScheduled { attempt: 0, .. }
        ));
        let waiting = h.engine.message(message.id).unwrap();
        assert_eq!(waiting.status, MessageStatus::Failed);
        assert_eq!(waiting.retry_count, 1);

        let outcome = h.fire_current(message.id).await;
        assert_eq!(outcome, FireOutcome::RateLimited { delay: Duration::from_secs(25) });
        let limited = h.engine.message(message.id).unwrap();
        assert_eq!(limited.status, MessageStatus::Partial);
        assert_eq!(limited.retry_count, 1);
        assert!(limited.last_error.unwrap().starts_with("rate_limited:"));

        assert!(matches!(h.fire_current(message.id).await, FireOutcome::Sent(_)));
        assert_eq!(h.engine.message(message.id).unwrap().retry_count, 1);
    }

    #[tokio::test]
    async fn test_recipient_attached_during_send_gets_another_pass() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        h.engine.attach_recipients(message.id, &[a.id]).unwrap();
        h.factory.set_send_delay(Duration::from_millis(200));

        let handle = h.engine.message(message.id).unwrap().job_id.unwrap();
        let (engine, id) = (h.engine.clone(), message.id);
        let running = tokio::spawn(async move { engine.fire(id, &handle).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        let b = h.recipient("@b");
        let during = h.engine.attach_recipients(message.id, &[b.id]).unwrap();
        assert_eq!(during.status, MessageStatus::Partial);

        let outcome = running.await.unwrap().unwrap();
        assert_eq!(outcome, FireOutcome::Requeued { outstanding: 1 });
        let requeued = h.engine.message(message.id).unwrap();
        assert_eq!(requeued.status, MessageStatus::Partial);
        assert_eq!(requeued.retry_count, 0);
        assert!(requeued.job_id.is_some());
        assert_eq!(h.queue.enqueued().last().unwrap().1, REQUEUE_DELAY);

        h.factory.set_send_delay(Duration::ZERO);
        match h.fire_current(message.id).await {
            FireOutcome::Sent(report) => {
                assert_eq!(report.sent, vec![b.id]);
                assert_eq!(report.skipped, vec![a.id]);
            }
            other => panic!("expected sent, got {other:?}"),
        }
        assert_eq!(h.factory.sent_to(), vec!["@a", "@b"]);
        assert_eq!(h.engine.message(message.id).unwrap().status, MessageStatus::Sent);
        assert!(h.engine.ledger().outstanding(message.id).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_and_sent_cannot_be_cancelled_or_forced() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        let b = h.recipient("@b");
        h.engine.attach_recipients(message.id, &[a.id, b.id]).unwrap();
        h.factory.script("@b", vec![Err(SendError::FloodWait { seconds: 10 })]);
        h.fire_current(message.id).await;
        assert_eq!(h.engine.message(message.id).unwrap().status, MessageStatus::Partial);

        assert!(matches!(
            h.engine.cancel(message.id),
            Err(CourierError::InvalidTransition { .. })
        ));
        assert!(matches!(
            h.engine.force_dispatch(message.id),
            Err(CourierError::InvalidTransition { .. })
        ));

        h.fire_current(message.id).await;
        assert_eq!(h.engine.message(message.id).unwrap().status, MessageStatus::Sent);
        assert!(h.engine.cancel(message.id).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_fire_runs_one_loop() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        h.engine.attach_recipients(message.id, &[a.id]).unwrap();
        h.factory.set_send_delay(Duration::from_millis(100));
        let handle = h.engine.message(message.id).unwrap().job_id.unwrap();

        let (first, second) = tokio::join!(
            h.engine.fire(message.id, &handle),
            h.engine.fire(message.id, &handle)
        );
        let outcomes = [first.unwrap(), second.unwrap()];
        assert_eq!(
            outcomes
                .iter()
                .filter(|o| **o == FireOutcome::Skipped(SkipReason::AlreadyRunning))
                .count(),
            1
        );
        assert_eq!(h.factory.attempted(), vec!["@a"]);
    }

    #[tokio::test]
    async fn test_recover_adopts_persisted_jobs() {
        let h = Harness::new();
        let message = h.message_in(chrono::Duration::hours(1));
        let a = h.recipient("@a");
        h.engine.attach_recipients(message.id, &[a.id]).unwrap();

        // A crash mid-loop leaves the message PARTIAL with its job handle.
        let mut crashed = h.engine.message(message.id).unwrap();
        crashed.status = MessageStatus::Partial;
        crashed.next_run_at = Some(Utc::now() - chrono::Duration::minutes(1));
        h.db.save_dispatch_state(&crashed).unwrap();

        let pending = h.message_in(chrono::Duration::hours(1));
        assert_eq!(pending.status, MessageStatus::Pending);

        // A restarted daemon starts with an empty queue.
        let fresh = Arc::new(RecordingQueue::default());
        let restarted = DispatchEngine::new(
            h.db.clone(),
            h.factory.clone(),
            fresh.clone(),
            RetryPolicy::default(),
            LogSink::new(h.db.clone()),
        );
        assert_eq!(restarted.recover().unwrap(), 1);
        let (adopted_id, delay) = fresh.adopted()[0];
        assert_eq!(adopted_id, message.id);
        assert_eq!(delay, Duration::ZERO);
        assert_eq!(restarted.recover().unwrap(), 0);

        let handle = crashed.job_id.unwrap();
        let outcome = restarted.fire(message.id, &handle).await.unwrap();
        assert!(matches!(outcome, FireOutcome::Sent(_)));
        assert_eq!(h.factory.sent_to(), vec!["@a"]);
    }

    #[tokio::test]
    async fn test_worker_pool_drives_timer_queue() {
        use crate::queue::TimerQueue;

        let db = Arc::new(DispatchDb::open_in_memory().unwrap());
        let (queue, due) = TimerQueue::new();
        let queue = Arc::new(queue);
        let factory = Arc::new(ScriptedFactory::new());
        let engine = Arc::new(DispatchEngine::new(
            db.clone(),
            factory.clone(),
            queue.clone(),
            RetryPolicy::default(),
            LogSink::new(db.clone()),
        ));
        tokio::spawn(engine.clone().run_workers(due, 2));

        let account = db.create_account("main", "+1 555 0100", None).unwrap();
        let message = engine
            .create_message(account.id, "hi", None, Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        let a = db.create_recipient("A", "@a").unwrap();
        engine.attach_recipients(message.id, &[a.id]).unwrap();
        engine.force_dispatch(message.id).unwrap();

        let mut status = MessageStatus::Scheduled;
        for _ in 0..200 {
            status = engine.message(message.id).unwrap().status;
            if status == MessageStatus::Sent && queue.pending() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(status, MessageStatus::Sent);
        assert_eq!(factory.sent_to(), vec!["@a"]);
        assert_eq!(queue.pending(), 0);
    }
}
