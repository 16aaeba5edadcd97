//! Bounded-concurrency executor for polling work.
//!
//! Submitted tasks go through a single scheduling loop that owns the ready
//! queue and the delayed queue. A task only starts once it holds one of the
//! semaphore's permits, so at most `limit` tasks execute at any instant no
//! matter how much work is queued. Delayed tasks sit in a min-heap keyed by
//! their due time and hold no permit until they become ready.

use crate::error::{AccrualError, Result};
use futures::FutureExt;
use futures::future::BoxFuture;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

/// Smallest accepted concurrency limit: one slot for current work, one for retries.
pub const MIN_CONCURRENCY: usize = 2;

type Task = BoxFuture<'static, ()>;

struct Job {
    not_before: Option<Instant>,
    task: Task,
}

struct Delayed {
    due: Instant,
    seq: u64,
    task: Task,
}

// Reversed so that `BinaryHeap` pops the earliest due time first.
impl Ord for Delayed {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .due
            .cmp(&self.due)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for Delayed {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for Delayed {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Delayed {}

/// Work that never got to run because the dispatcher shut down first.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Abandoned {
    pub queued: usize,
    pub delayed: usize,
}

pub struct TaskDispatcher {
    limit: usize,
    jobs: mpsc::UnboundedSender<Job>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
    closed: AtomicBool,
    scheduler: Mutex<Option<JoinHandle<Abandoned>>>,
}

impl TaskDispatcher {
    /// Starts the scheduling loop. Must be called from within a tokio runtime.
    pub fn new(limit: usize) -> Result<Self> {
        if limit < MIN_CONCURRENCY {
            return Err(AccrualError::InvalidConcurrencyLimit(limit));
        }

        let (jobs, rx) = mpsc::unbounded_channel();
        let permits = Arc::new(Semaphore::new(limit));
        let tracker = TaskTracker::new();
        let cancel = CancellationToken::new();

        let span = tracing::info_span!("dispatcher", limit);
        let scheduler = tokio::spawn(
            schedule(rx, permits.clone(), tracker.clone(), cancel.clone()).instrument(span),
        );

        Ok(Self {
            limit,
            jobs,
            permits,
            tracker,
            cancel,
            closed: AtomicBool::new(false),
            scheduler: Mutex::new(Some(scheduler)),
        })
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of tasks executing right now, including any that outlived a shutdown.
    pub fn active(&self) -> usize {
        self.limit - self.permits.available_permits()
    }

    /// Queues `task` for execution as soon as a slot is free. Never blocks.
    pub fn submit<F>(&self, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(None, task.boxed())
    }

    /// Queues `task` to become eligible once `delay` has elapsed.
    pub fn submit_after<F>(&self, delay: Duration, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.submit_at(Instant::now() + delay, task)
    }

    /// Queues `task` to become eligible at `not_before`.
    pub fn submit_at<F>(&self, not_before: Instant, task: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.enqueue(Some(not_before), task.boxed())
    }

    fn enqueue(&self, not_before: Option<Instant>, task: Task) -> Result<()> {
        if self.closed.load(AtomicOrdering::Acquire) {
            tracing::debug!("rejecting task, dispatcher is shut down");
            return Err(AccrualError::DispatcherClosed);
        }
        self.jobs
            .send(Job { not_before, task })
            .map_err(|_| AccrualError::DispatcherClosed)
    }

    /// Stops accepting work and waits up to `timeout` for running tasks.
    ///
    /// Tasks still running when the timeout elapses are left running; queued
    /// and delayed tasks are dropped and reported in the returned counts.
    pub async fn shutdown(&self, timeout: Duration) -> Abandoned {
        self.closed.store(true, AtomicOrdering::Release);
        self.cancel.cancel();

        let scheduler = self.scheduler.lock().await.take();
        let abandoned = match scheduler {
            Some(handle) => handle.await.unwrap_or_else(|e| {
                tracing::error!(error = %e, "dispatcher scheduling loop failed");
                Abandoned::default()
            }),
            None => Abandoned::default(),
        };
        if abandoned != Abandoned::default() {
            tracing::info!(
                queued = abandoned.queued,
                delayed = abandoned.delayed,
                "dropped pending tasks at shutdown"
            );
        }

        self.tracker.close();
        if tokio::time::timeout(timeout, self.tracker.wait()).await.is_err() {
            tracing::warn!(
                running = self.tracker.len(),
                timeout_ms = timeout.as_millis() as u64,
                "graceful shutdown timeout exceeded, leaving tasks running"
            );
        } else {
            tracing::info!("dispatcher drained");
        }
        abandoned
    }
}

async fn schedule(
    mut jobs: mpsc::UnboundedReceiver<Job>,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    cancel: CancellationToken,
) -> Abandoned {
    let mut ready: VecDeque<Task> = VecDeque::new();
    let mut delayed: BinaryHeap<Delayed> = BinaryHeap::new();
    let mut seq: u64 = 0;

    loop {
        let next_due = delayed.peek().map(|entry| entry.due);

        tokio::select! {
            biased;

            _ = cancel.cancelled() => break,

            permit = permits.clone().acquire_owned(), if !ready.is_empty() => {
                let Ok(permit) = permit else { break };
                if let Some(task) = ready.pop_front() {
                    tracker.spawn(async move {
                        task.await;
                        drop(permit);
                    });
                }
            }

            _ = sleep_until(next_due.unwrap_or_else(Instant::now)), if next_due.is_some() => {
                let now = Instant::now();
                while delayed.peek().is_some_and(|entry| entry.due <= now) {
                    if let Some(entry) = delayed.pop() {
                        ready.push_back(entry.task);
                    }
                }
            }

            job = jobs.recv() => match job {
                Some(Job { not_before: Some(due), task }) if due > Instant::now() => {
                    seq += 1;
                    delayed.push(Delayed { due, seq, task });
                }
                Some(Job { task, .. }) => ready.push_back(task),
                None => break,
            },
        }
    }

    jobs.close();
    let mut abandoned = Abandoned {
        queued: ready.len(),
        delayed: delayed.len(),
    };
    while let Ok(job) = jobs.try_recv() {
        match job.not_before {
            Some(_) => abandoned.delayed += 1,
            None => abandoned.queued += 1,
        }
    }
    abandoned
}
