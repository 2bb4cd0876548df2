//! Deduplicating, rate-limited work queue
//!
//! Keys, not events, are queued: any number of watch notifications for the
//! same Database collapse into one pending item. The queue also owns per-key
//! serialization. A key handed out by [`WorkQueue::dequeue`] is "in flight"
//! until the worker settles it with [`WorkQueue::done`],
//! [`WorkQueue::failed`] or [`WorkQueue::forget`]. Notifications that arrive
//! meanwhile mark the key dirty so it runs once more afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

use crate::store::ObjectKey;

/// How a failed attempt is retried
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryKind {
    /// Retry right away, e.g. after a stale status write
    Immediate,
    /// Exponential backoff with the normal policy
    Normal,
    /// Exponential backoff with the slow policy, used for authorization failures
    Slow,
}

/// Exponential backoff: `base * 2^n`, capped at `max`, plus random jitter
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    /// Upper bound of the added jitter as a fraction of the delay
    pub jitter: f64,
}

impl BackoffPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: 0.1,
        }
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.max(0.0);
        self
    }

    /// Delay before retry number `failures + 1`, without jitter
    pub fn base_delay(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let delay = self.base_delay(failures);
        if self.jitter == 0.0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=self.jitter);
        delay + delay.mul_f64(extra)
    }
}

/// A key handed to a worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkItem {
    pub key: ObjectKey,
    /// Consecutive failed attempts before this one
    pub attempt: u32,
}

#[derive(Clone, Copy, Debug)]
struct Entry {
    ready_at: Instant,
    /// Waiting out a failure; new notifications do not pull it forward
    backoff: bool,
}

#[derive(Default)]
struct QueueState {
    queued: HashMap<ObjectKey, Entry>,
    retries: HashMap<ObjectKey, u32>,
    in_flight: HashSet<ObjectKey>,
    dirty: HashSet<ObjectKey>,
    shutdown: bool,
}

impl QueueState {
    fn schedule(&mut self, key: ObjectKey, ready_at: Instant, backoff: bool) {
        self.queued.insert(key, Entry { ready_at, backoff });
    }

    fn next(&self) -> Option<(&ObjectKey, Instant)> {
        self.queued
            .iter()
            .min_by(|a, b| a.1.ready_at.cmp(&b.1.ready_at).then_with(|| a.0.cmp(b.0)))
            .map(|(key, entry)| (key, entry.ready_at))
    }
}

pub struct WorkQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    normal: BackoffPolicy,
    slow: BackoffPolicy,
}

impl WorkQueue {
    pub fn new(normal: BackoffPolicy, slow: BackoffPolicy) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
            normal,
            slow,
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a key for processing
    pub fn enqueue(&self, key: ObjectKey) {
        let mut state = self.lock();
        if state.shutdown {
            return;
        }
        if state.in_flight.contains(&key) {
            trace!(key = %key, "in flight, marking dirty");
            state.dirty.insert(key);
            return;
        }
        let now = Instant::now();
        match state.queued.get_mut(&key) {
            Some(entry) if !entry.backoff => entry.ready_at = entry.ready_at.min(now),
            Some(_) => trace!(key = %key, "waiting out backoff"),
            None => state.schedule(key, now, false),
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Wait for the next eligible key; `None` once the queue is shut down
    pub async fn dequeue(&self) -> Option<WorkItem> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_at = {
                let mut state = self.lock();
                if state.shutdown {
                    return None;
                }
                match state.next().map(|(key, ready_at)| (key.clone(), ready_at)) {
                    Some((key, ready_at)) if ready_at <= Instant::now() => {
                        state.queued.remove(&key);
                        state.in_flight.insert(key.clone());
                        let attempt = state.retries.get(&key).copied().unwrap_or(0);
                        return Some(WorkItem { key, attempt });
                    }
                    Some((_, ready_at)) => Some(ready_at),
                    None => None,
                }
            };

            match wake_at {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Settle a successful attempt, optionally scheduling a resync
    pub fn done(&self, key: &ObjectKey, resync: Option<Duration>) {
        let mut state = self.lock();
        state.in_flight.remove(key);
        state.retries.remove(key);
        let now = Instant::now();
        if state.dirty.remove(key) {
            state.schedule(key.clone(), now, false);
        } else if let Some(after) = resync {
            state.schedule(key.clone(), now + after, false);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Settle a failed attempt and schedule the retry; returns the delay
    pub fn failed(&self, key: &ObjectKey, kind: RetryKind) -> Duration {
        let mut state = self.lock();
        state.in_flight.remove(key);
        // The retry reads the latest state anyway.
        state.dirty.remove(key);
        let delay = match kind {
            RetryKind::Immediate => Duration::ZERO,
            RetryKind::Normal | RetryKind::Slow => {
                let failures = state.retries.entry(key.clone()).or_insert(0);
                let previous = *failures;
                *failures += 1;
                let policy = if kind == RetryKind::Slow {
                    &self.slow
                } else {
                    &self.normal
                };
                policy.delay(previous)
            }
        };
        if !state.shutdown {
            state.schedule(key.clone(), Instant::now() + delay, kind != RetryKind::Immediate);
        }
        drop(state);
        self.notify.notify_waiters();
        delay
    }

    /// Stop retrying a key until a new notification arrives
    pub fn forget(&self, key: &ObjectKey) {
        let mut state = self.lock();
        state.retries.remove(key);
        if state.in_flight.remove(key) {
            if state.dirty.remove(key) {
                state.schedule(key.clone(), Instant::now(), false);
            }
        } else {
            state.queued.remove(key);
        }
        drop(state);
        self.notify.notify_waiters();
    }

    /// Stop handing out work; pending `dequeue` calls return `None`
    pub fn shutdown(&self) {
        self.lock().shutdown = true;
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().shutdown
    }

    /// Number of queued keys, including those waiting out a delay
    pub fn len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys currently being processed
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn is_in_flight(&self, key: &ObjectKey) -> bool {
        self.lock().in_flight.contains(key)
    }

    /// Consecutive failures recorded for a key
    pub fn retries(&self, key: &ObjectKey) -> u32 {
        self.lock().retries.get(key).copied().unwrap_or(0)
    }
}
