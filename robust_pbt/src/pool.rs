//! Bounded worker pool for training and attack jobs.
//!
//! `submit` returns a [`JobHandle`] immediately. A dispatcher task admits
//! queued jobs in FIFO order whenever one of `capacity` slots frees up. Each
//! job runs in its own task, so a panic is caught at the task boundary and
//! becomes a `Failed(Panicked)` report for that job alone.
//!
//! Cancellation: once the run-wide token fires, queued jobs fail with
//! `Cancelled` right away and running jobs get `grace_period` to finish
//! before they are aborted.

use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot, Notify, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::cancel::{CancelHandle, CancelToken};
use crate::error::{JobError, PoolError};
use crate::job::{Job, JobReport};
use crate::runner::JobRunner;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub name: String,
    /// Maximum concurrently running jobs.
    pub capacity: usize,
    /// Maximum jobs waiting for a slot; unbounded when `None`.
    pub queue_limit: Option<usize>,
    /// Time running jobs get after cancellation before they are aborted.
    pub grace_period: Duration,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub running: usize,
    pub waiting: usize,
    pub submitted: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub peak_running: usize,
}

/// Awaitable completion of one submitted job.
pub struct JobHandle {
    job: Job,
    rx: oneshot::Receiver<JobReport>,
}

impl JobHandle {
    pub fn job_id(&self) -> Uuid {
        self.job.id
    }

    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Wait for the terminal report. A job dropped by the pool without a
    /// report is reported as cancelled.
    pub async fn outcome(self) -> JobReport {
        match self.rx.await {
            Ok(report) => report,
            Err(_) => JobReport::failed(self.job, JobError::Cancelled, 0),
        }
    }
}

struct Queued {
    job: Job,
    tx: oneshot::Sender<JobReport>,
    submitted_at: Instant,
}

struct PoolInner {
    config: PoolConfig,
    runner: Arc<JobRunner>,
    slots: Arc<Semaphore>,
    queue: Mutex<Option<mpsc::UnboundedSender<Queued>>>,
    accepting: AtomicBool,
    /// Submitted jobs without a terminal report yet.
    outstanding: AtomicUsize,
    waiting: AtomicUsize,
    running: AtomicUsize,
    peak_running: AtomicUsize,
    submitted: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
    idle: Notify,
    progress: Notify,
    cancel: CancelToken,
    abort: CancelHandle,
}

pub struct WorkerPool {
    inner: Arc<PoolInner>,
}

impl WorkerPool {
    /// Create the pool and start its dispatcher. Must be called inside a
    /// tokio runtime.
    pub fn new(config: PoolConfig, runner: Arc<JobRunner>, cancel: CancelToken) -> Self {
        let capacity = config.capacity.max(1);
        let (tx, rx) = mpsc::unbounded_channel();

        let inner = Arc::new(PoolInner {
            slots: Arc::new(Semaphore::new(capacity)),
            config: PoolConfig { capacity, ..config },
            runner,
            queue: Mutex::new(Some(tx)),
            accepting: AtomicBool::new(true),
            outstanding: AtomicUsize::new(0),
            waiting: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            peak_running: AtomicUsize::new(0),
            submitted: AtomicU64::new(0),
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            idle: Notify::new(),
            progress: Notify::new(),
            cancel,
            abort: CancelHandle::new(),
        });

        tokio::spawn(dispatch(inner.clone(), rx));
        info!(
            pool = %inner.config.name,
            capacity = inner.config.capacity,
            queue_limit = ?inner.config.queue_limit,
            "Worker pool started"
        );

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.config.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.config.capacity
    }

    /// Queue a job. Fails with `Overloaded` when `queue_limit` jobs are
    /// already waiting, and with `ShutDown` once the pool stopped accepting.
    pub fn submit(&self, job: Job) -> Result<JobHandle, PoolError> {
        let inner = &self.inner;
        if !inner.accepting.load(Ordering::SeqCst) || inner.cancel.is_cancelled() {
            return Err(PoolError::ShutDown(inner.config.name.clone()));
        }

        let admit_limit = inner
            .config
            .queue_limit
            .map(|limit| inner.config.capacity.saturating_add(limit))
            .unwrap_or(usize::MAX);
        inner
            .outstanding
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                (current < admit_limit).then_some(current + 1)
            })
            .map_err(|current| PoolError::Overloaded {
                pool: inner.config.name.clone(),
                waiting: current.saturating_sub(inner.config.capacity),
                queue_limit: inner.config.queue_limit.unwrap_or(usize::MAX),
            })?;

        let (tx, rx) = oneshot::channel();
        let queued = Queued {
            job: job.clone(),
            tx,
            submitted_at: Instant::now(),
        };

        inner.waiting.fetch_add(1, Ordering::SeqCst);
        let sent = match inner.queue.lock().as_ref() {
            Some(queue) => queue.send(queued).is_ok(),
            None => false,
        };
        if !sent {
            inner.waiting.fetch_sub(1, Ordering::SeqCst);
            inner.release();
            return Err(PoolError::ShutDown(inner.config.name.clone()));
        }

        inner.submitted.fetch_add(1, Ordering::SeqCst);
        debug!(pool = %inner.config.name, job_id = %job.id, kind = %job.kind(), seed = job.seed_id(), "Job queued");

        Ok(JobHandle { job, rx })
    }

    /// Submit every job and collect every terminal report.
    ///
    /// `Overloaded` is absorbed by waiting for an in-flight job before
    /// resubmitting. If the pool shuts down because the run was cancelled,
    /// unsubmitted jobs are reported as cancelled; any other shutdown is a
    /// pool-wide fault.
    pub async fn run_all<F>(&self, jobs: Vec<Job>, mut on_report: F) -> Result<Vec<JobReport>, PoolError>
    where
        F: FnMut(&JobReport),
    {
        let mut reports = Vec::with_capacity(jobs.len());
        let mut in_flight = FuturesUnordered::new();
        let mut pending = jobs.into_iter();
        let mut next = pending.next();

        while let Some(job) = next.take() {
            match self.submit(job.clone()) {
                Ok(handle) => {
                    in_flight.push(handle.outcome());
                    next = pending.next();
                }
                Err(PoolError::Overloaded { .. }) => {
                    next = Some(job);
                    match in_flight.next().await {
                        Some(report) => {
                            on_report(&report);
                            reports.push(report);
                        }
                        None => self.wait_for_progress().await,
                    }
                }
                Err(PoolError::ShutDown(_)) if self.inner.cancel.is_cancelled() => {
                    for job in std::iter::once(job).chain(pending.by_ref()) {
                        let report = JobReport::failed(job, JobError::Cancelled, 0);
                        on_report(&report);
                        reports.push(report);
                    }
                }
                Err(err) => {
                    error!(pool = %self.name(), "Job submission failed: {}", err);
                    return Err(err);
                }
            }
        }

        while let Some(report) = in_flight.next().await {
            on_report(&report);
            reports.push(report);
        }
        Ok(reports)
    }

    async fn wait_for_progress(&self) {
        let progressed = self.inner.progress.notified();
        // Bounded so a completion racing this call cannot stall the batch.
        let _ = tokio::time::timeout(Duration::from_millis(50), progressed).await;
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        PoolStats {
            running: inner.running.load(Ordering::SeqCst),
            waiting: inner.waiting.load(Ordering::SeqCst),
            submitted: inner.submitted.load(Ordering::SeqCst),
            succeeded: inner.succeeded.load(Ordering::SeqCst),
            failed: inner.failed.load(Ordering::SeqCst),
            peak_running: inner.peak_running.load(Ordering::SeqCst),
        }
    }

    /// Stop accepting jobs and let queued and running ones drain for up to
    /// the grace period; whatever is left is then cancelled.
    #[instrument(skip(self), fields(pool = %self.inner.config.name))]
    pub async fn shutdown(&self) -> PoolStats {
        let inner = &self.inner;
        inner.accepting.store(false, Ordering::SeqCst);
        inner.queue.lock().take();

        if tokio::time::timeout(inner.config.grace_period, inner.wait_idle()).await.is_err() {
            warn!(
                outstanding = inner.outstanding.load(Ordering::SeqCst),
                "Grace period elapsed, cancelling remaining jobs"
            );
            inner.abort.cancel();
            inner.wait_idle().await;
        }

        let stats = self.stats();
        info!(
            submitted = stats.submitted,
            succeeded = stats.succeeded,
            failed = stats.failed,
            peak_running = stats.peak_running,
            "Worker pool shut down"
        );
        stats
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        // Lets the dispatcher exit once the queue is drained.
        self.inner.queue.lock().take();
    }
}

impl PoolInner {
    fn release(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
        self.progress.notify_waiters();
    }

    async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.outstanding.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Resolves when running jobs must stop: immediately on abort, or one
    /// grace period after run-wide cancellation.
    async fn stop_deadline(&self) {
        let abort = self.abort.token();
        tokio::select! {
            _ = abort.cancelled() => {}
            _ = async {
                self.cancel.cancelled().await;
                tokio::time::sleep(self.config.grace_period).await;
            } => {}
        }
    }

    /// Resolves as soon as queued jobs must not start any more.
    async fn stop_admission(&self) {
        let abort = self.abort.token();
        tokio::select! {
            _ = abort.cancelled() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    fn finish(&self, queued_tx: oneshot::Sender<JobReport>, report: JobReport) {
        if report.outcome.is_success() {
            self.succeeded.fetch_add(1, Ordering::SeqCst);
        } else {
            self.failed.fetch_add(1, Ordering::SeqCst);
        }
        let _ = queued_tx.send(report);
        self.release();
    }
}

async fn dispatch(inner: Arc<PoolInner>, mut queue: mpsc::UnboundedReceiver<Queued>) {
    while let Some(queued) = queue.recv().await {
        let permit = tokio::select! {
            biased;
            _ = inner.stop_admission() => None,
            permit = inner.slots.clone().acquire_owned() => permit.ok(),
        };
        inner.waiting.fetch_sub(1, Ordering::SeqCst);

        match permit {
            Some(permit) => {
                tokio::spawn(execute(inner.clone(), queued, permit));
            }
            None => {
                debug!(pool = %inner.config.name, job_id = %queued.job.id, "Queued job cancelled before start");
                let report = JobReport::failed(queued.job, JobError::Cancelled, 0);
                inner.finish(queued.tx, report);
            }
        }
    }
    debug!(pool = %inner.config.name, "Dispatcher stopped");
}

async fn execute(inner: Arc<PoolInner>, queued: Queued, _permit: OwnedSemaphorePermit) {
    let Queued { job, tx, submitted_at } = queued;

    let running = inner.running.fetch_add(1, Ordering::SeqCst) + 1;
    inner.peak_running.fetch_max(running, Ordering::SeqCst);
    debug!(
        pool = %inner.config.name,
        job_id = %job.id,
        queued_ms = submitted_at.elapsed().as_millis() as u64,
        running,
        "Job started"
    );

    let started = Instant::now();
    let runner = inner.runner.clone();
    let fallback = job.clone();
    let mut work = tokio::spawn(async move { runner.run(job).await });

    let report = tokio::select! {
        joined = &mut work => match joined {
            Ok(report) => report,
            Err(err) if err.is_panic() => {
                let message = panic_message(err.into_panic());
                error!(pool = %inner.config.name, job_id = %fallback.id, "Job panicked: {}", message);
                JobReport::failed(fallback, JobError::Panicked(message), started.elapsed().as_millis() as u64)
            }
            Err(_) => JobReport::failed(fallback, JobError::Cancelled, started.elapsed().as_millis() as u64),
        },
        _ = inner.stop_deadline() => {
            work.abort();
            warn!(pool = %inner.config.name, job_id = %fallback.id, "Job cancelled after grace period");
            JobReport::failed(fallback, JobError::Cancelled, started.elapsed().as_millis() as u64)
        }
    };

    inner.running.fetch_sub(1, Ordering::SeqCst);
    inner.finish(tx, report);
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
