//! Test doubles: a scripted channel factory and a recording job queue.

use async_trait::async_trait;
use chrono::Utc;
use courier_core::error::SendError;
use courier_core::traits::{Account, ChannelFactory, SendChannel};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::ledger::Ledger;
use crate::message::{Recipient, ScheduledMessage};
use crate::persistence::DispatchDb;
use crate::queue::{JobHandle, JobQueue};

#[derive(Default)]
struct Script {
    responses: HashMap<String, VecDeque<Result<(), SendError>>>,
    connect_error: Option<SendError>,
    send_delay: Duration,
    attempted: Vec<String>,
    sent: Vec<String>,
    disconnects: usize,
    invalidations: usize,
}

/// Channel factory whose channels follow a per-handle script.
/// Unscripted sends succeed.
#[derive(Clone, Default)]
pub struct ScriptedFactory {
    state: Arc<Mutex<Script>>,
}

impl ScriptedFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue responses for `handle`, consumed one per attempt.
    pub fn script(&self, handle: &str, responses: Vec<Result<(), SendError>>) {
        self.state
            .lock()
            .unwrap()
            .responses
            .entry(handle.to_string())
            .or_default()
            .extend(responses);
    }

    /// Every connect fails with `err` from now on.
    pub fn fail_connect(&self, err: SendError) {
        self.state.lock().unwrap().connect_error = Some(err);
    }

    pub fn set_send_delay(&self, delay: Duration) {
        self.state.lock().unwrap().send_delay = delay;
    }

    pub fn attempted(&self) -> Vec<String> {
        self.state.lock().unwrap().attempted.clone()
    }

    pub fn sent_to(&self) -> Vec<String> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn disconnects(&self) -> usize {
        self.state.lock().unwrap().disconnects
    }

    pub fn invalidations(&self) -> usize {
        self.state.lock().unwrap().invalidations
    }
}

impl ChannelFactory for ScriptedFactory {
    fn open(&self, _account: &Account) -> Result<Box<dyn SendChannel>, SendError> {
        Ok(Box::new(ScriptedChannel {
            state: self.state.clone(),
        }))
    }

    fn invalidate(&self, _account: &Account) {
        self.state.lock().unwrap().invalidations += 1;
    }
}

struct ScriptedChannel {
    state: Arc<Mutex<Script>>,
}

#[async_trait]
impl SendChannel for ScriptedChannel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn connect(&mut self) -> Result<(), SendError> {
        match self.state.lock().unwrap().connect_error.clone() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn send_message(
        &self,
        target: &str,
        _text: &str,
        _attachment: Option<&Path>,
    ) -> Result<(), SendError> {
        let delay = {
            let mut state = self.state.lock().unwrap();
            state.attempted.push(target.to_string());
            state.send_delay
        };
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.state.lock().unwrap();
        let result = state
            .responses
            .get_mut(target)
            .and_then(|queue| queue.pop_front())
            .unwrap_or(Ok(()));
        if result.is_ok() {
            state.sent.push(target.to_string());
        }
        result
    }

    async fn disconnect(&mut self) -> Result<(), SendError> {
        self.state.lock().unwrap().disconnects += 1;
        Ok(())
    }
}

#[derive(Default)]
struct Recorded {
    next: u64,
    enqueued: Vec<(i64, Duration, JobHandle)>,
    adopted: Vec<(i64, Duration)>,
    cancelled: Vec<JobHandle>,
    live: HashSet<JobHandle>,
}

/// Job queue that records calls and never fires on its own.
#[derive(Default)]
pub struct RecordingQueue {
    inner: Mutex<Recorded>,
}

impl RecordingQueue {
    pub fn enqueued(&self) -> Vec<(i64, Duration, JobHandle)> {
        self.inner.lock().unwrap().enqueued.clone()
    }

    pub fn adopted(&self) -> Vec<(i64, Duration)> {
        self.inner.lock().unwrap().adopted.clone()
    }

    pub fn cancelled(&self) -> Vec<JobHandle> {
        self.inner.lock().unwrap().cancelled.clone()
    }
}

impl JobQueue for RecordingQueue {
    fn enqueue(&self, message_id: i64, delay: Duration) -> JobHandle {
        let mut inner = self.inner.lock().unwrap();
        inner.next += 1;
        let handle = format!("job-{}", inner.next);
        inner.enqueued.push((message_id, delay, handle.clone()));
        inner.live.insert(handle.clone());
        handle
    }

    fn adopt(&self, handle: &str, message_id: i64, delay: Duration) -> bool {
        let mut inner = self.inner.lock().unwrap();
        if !inner.live.insert(handle.to_string()) {
            return false;
        }
        inner.adopted.push((message_id, delay));
        true
    }

    fn cancel(&self, handle: &str) -> bool {
        let mut inner = self.inner.lock().unwrap();
        inner.cancelled.push(handle.to_string());
        inner.live.remove(handle)
    }

    fn finish(&self, handle: &str) {
        self.inner.lock().unwrap().live.remove(handle);
    }
}

/// A message scheduled an hour out with one recipient per handle.
pub struct Fixture {
    pub db: Arc<DispatchDb>,
    pub ledger: Ledger,
    pub account: Account,
    pub message: ScheduledMessage,
    pub recipients: Vec<Recipient>,
}

impl Fixture {
    pub fn new(handles: &[&str]) -> Self {
        let db = Arc::new(DispatchDb::open_in_memory().unwrap());
        let account = db.create_account("main", "+1 555 0100", None).unwrap();
        let message = db
            .create_message(account.id, "hello", None, Utc::now() + chrono::Duration::hours(1))
            .unwrap();
        let recipients: Vec<Recipient> = handles
            .iter()
            .map(|h| db.create_recipient(h, h).unwrap())
            .collect();
        let ids: Vec<i64> = recipients.iter().map(|r| r.id).collect();
        db.attach_recipients(message.id, &ids).unwrap();
        Self {
            ledger: Ledger::new(db.clone()),
            db,
            account,
            message,
            recipients,
        }
    }
}
