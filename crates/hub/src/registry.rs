//! Job registry and scheduler runtime.
//!
//! One background task owns a min-heap of due times; registered jobs are kept
//! in an entity-id -> entry map guarded by a single mutex together with the
//! heap, so lookup-and-mutate sequences (check-then-add, cancel-then-add) are
//! atomic.  Cancellation is generation-based: cancelling bumps the live
//! generation out from under any heap entry already queued, so a stale entry
//! is skipped when it surfaces instead of firing with old parameters.
//!
//! Firing semantics: a recurring job is rescheduled *before* its callback is
//! spawned, so a slow or failing callback neither delays nor duplicates the
//! next fire.  Callbacks run on their own tasks and never under the registry
//! lock.  A job fires at or after its computed time; sub-second precision is
//! not guaranteed.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use time::{Duration as TimeDuration, OffsetDateTime};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::schedule::{next_interval_time, LightSchedule};

pub type JobFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Invoked with the time the job was due (not the time it actually ran).
pub type JobFn = Arc<dyn Fn(OffsetDateTime) -> JobFuture + Send + Sync>;

// ---------------------------------------------------------------------------
// Keys & errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Water,
    Light,
    AdhocLight,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Water => f.write_str("water"),
            JobKind::Light => f.write_str("light"),
            JobKind::AdhocLight => f.write_str("adhoc_light"),
        }
    }
}

/// Identifies the single live job an entity may hold per kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobKey {
    pub id: String,
    pub kind: JobKind,
}

impl JobKey {
    pub fn water(id: impl Into<String>) -> Self {
        Self { id: id.into(), kind: JobKind::Water }
    }

    pub fn light(id: impl Into<String>) -> Self {
        Self { id: id.into(), kind: JobKind::Light }
    }

    pub fn adhoc_light(id: impl Into<String>) -> Self {
        Self { id: id.into(), kind: JobKind::AdhocLight }
    }
}

impl fmt::Display for JobKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// An active job already exists for this key; callers edit via `reset`.
    #[error("a job is already scheduled for {0}")]
    AlreadyScheduled(JobKey),
    /// The recurrence yields no future occurrence (e.g. non-positive interval).
    #[error("{0} has no future occurrence")]
    NoOccurrence(JobKey),
}

// ---------------------------------------------------------------------------
// Recurrence
// ---------------------------------------------------------------------------

/// How a job computes its next due time.  Kept as data (not a closure) so the
/// registry's rescheduling decisions stay auditable and testable.
#[derive(Debug, Clone)]
pub enum Recurrence {
    /// Fixed period from an absolute anchor (watering).
    Interval {
        anchor: OffsetDateTime,
        every: TimeDuration,
    },
    /// Daily on/off transitions of a light schedule snapshot.  Edits and
    /// adhoc overrides re-register the job with a fresh snapshot.
    LightCycle(LightSchedule),
    /// Fires once, then the job is removed from the registry.
    OneShot { at: OffsetDateTime },
}

impl Recurrence {
    fn first_fire(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            Recurrence::OneShot { at } => Some(*at),
            _ => self.next_after(now),
        }
    }

    fn next_after(&self, now: OffsetDateTime) -> Option<OffsetDateTime> {
        match self {
            Recurrence::Interval { anchor, every } => next_interval_time(*anchor, *every, now),
            Recurrence::LightCycle(ls) => Some(ls.next_light_transition(now).0),
            Recurrence::OneShot { .. } => None,
        }
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

struct Entry {
    generation: u64,
    recurrence: Recurrence,
    run: JobFn,
    next_at: OffsetDateTime,
}

struct DueEntry {
    at: OffsetDateTime,
    /// Tie-breaker so the heap has a total order for equal due times.
    seq: u64,
    key: JobKey,
    generation: u64,
}

impl PartialEq for DueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl Eq for DueEntry {}

impl PartialOrd for DueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for DueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.at.cmp(&other.at).then(self.seq.cmp(&other.seq))
    }
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobKey, Entry>,
    heap: BinaryHeap<Reverse<DueEntry>>,
    next_generation: u64,
    next_seq: u64,
    shutdown: bool,
}

pub struct Scheduler {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl Scheduler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(Inner::default()),
            notify: Notify::new(),
        })
    }

    /// Spawn the timer loop.  Jobs added before or after starting are both
    /// honored; the loop is woken whenever the head of the heap may change.
    pub fn start(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move { scheduler.run().await })
    }

    /// Stop the timer loop.  In-flight callbacks complete; nothing fires
    /// afterwards.
    pub fn stop(&self) {
        self.lock().shutdown = true;
        self.notify.notify_one();
    }

    /// Register a job.  Fails if an active job already exists for `key`.
    /// Returns the first fire time.
    pub fn add(
        &self,
        key: JobKey,
        recurrence: Recurrence,
        run: JobFn,
    ) -> Result<OffsetDateTime, SchedulerError> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.lock();
        if inner.jobs.contains_key(&key) {
            return Err(SchedulerError::AlreadyScheduled(key));
        }
        let first = Self::insert(&mut inner, key, recurrence, run, now)?;
        drop(inner);
        self.notify.notify_one();
        Ok(first)
    }

    /// Cancel the job for `key`, if any.  Idempotent; returns whether a job
    /// existed.  A callback already executing completes but the job never
    /// fires again.
    pub fn cancel(&self, key: &JobKey) -> bool {
        let existed = self.lock().jobs.remove(key).is_some();
        if existed {
            debug!(job = %key, "job canceled");
            self.notify.notify_one();
        }
        existed
    }

    /// Atomically cancel any existing job for `key` and register a new one.
    /// Both happen under one lock acquisition, so there is no window in which
    /// the old and new job could both fire.
    pub fn reset(
        &self,
        key: JobKey,
        recurrence: Recurrence,
        run: JobFn,
    ) -> Result<OffsetDateTime, SchedulerError> {
        let now = OffsetDateTime::now_utc();
        let mut inner = self.lock();
        inner.jobs.remove(&key);
        let first = Self::insert(&mut inner, key, recurrence, run, now)?;
        drop(inner);
        self.notify.notify_one();
        Ok(first)
    }

    pub fn is_scheduled(&self, key: &JobKey) -> bool {
        self.lock().jobs.contains_key(key)
    }

    /// Next fire time of the job for `key`, if one is registered.
    pub fn next_fire(&self, key: &JobKey) -> Option<OffsetDateTime> {
        self.lock().jobs.get(key).map(|e| e.next_at)
    }

    pub fn job_count(&self) -> usize {
        self.lock().jobs.len()
    }

    fn insert(
        inner: &mut Inner,
        key: JobKey,
        recurrence: Recurrence,
        run: JobFn,
        now: OffsetDateTime,
    ) -> Result<OffsetDateTime, SchedulerError> {
        let first = recurrence
            .first_fire(now)
            .ok_or_else(|| SchedulerError::NoOccurrence(key.clone()))?;
        let generation = inner.next_generation;
        inner.next_generation += 1;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.jobs.insert(
            key.clone(),
            Entry { generation, recurrence, run, next_at: first },
        );
        inner.heap.push(Reverse(DueEntry { at: first, seq, key: key.clone(), generation }));
        debug!(job = %key, fire_at = %first, "job scheduled");
        Ok(first)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("registry lock poisoned")
    }

    async fn run(&self) {
        info!("scheduler runtime started");
        loop {
            let mut due: Vec<(JobFn, OffsetDateTime, JobKey)> = Vec::new();
            let wait = {
                let mut inner = self.lock();
                if inner.shutdown {
                    break;
                }
                let now = OffsetDateTime::now_utc();
                loop {
                    match inner.heap.peek() {
                        Some(Reverse(top)) if top.at <= now => {}
                        _ => break,
                    }
                    let Some(Reverse(top)) = inner.heap.pop() else {
                        break;
                    };
                    // Skip entries whose job was canceled or superseded after
                    // this heap entry was queued.
                    let (run, next) = match inner.jobs.get(&top.key) {
                        Some(entry) if entry.generation == top.generation => {
                            (entry.run.clone(), entry.recurrence.next_after(now))
                        }
                        _ => continue,
                    };
                    // Reschedule before the callback is spawned.
                    match next {
                        Some(next_at) => {
                            let seq = inner.next_seq;
                            inner.next_seq += 1;
                            if let Some(entry) = inner.jobs.get_mut(&top.key) {
                                entry.next_at = next_at;
                            }
                            inner.heap.push(Reverse(DueEntry {
                                at: next_at,
                                seq,
                                key: top.key.clone(),
                                generation: top.generation,
                            }));
                        }
                        None => {
                            inner.jobs.remove(&top.key);
                        }
                    }
                    due.push((run, top.at, top.key));
                }
                inner
                    .heap
                    .peek()
                    .map(|Reverse(e)| (e.at - now).unsigned_abs())
            };

            for (run, at, key) in due {
                debug!(job = %key, due = %at, "firing job");
                tokio::spawn(run(at));
            }

            match wait {
                Some(d) => {
                    tokio::select! {
                        _ = tokio::time::sleep(d) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
        let pending = self.lock().jobs.len();
        if pending > 0 {
            warn!(jobs = pending, "scheduler runtime stopped with jobs still registered");
        } else {
            info!("scheduler runtime stopped");
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
