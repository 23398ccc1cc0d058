//! Priority scheduling of recurring sources.
//!
//! [`SmartScheduler`] keeps one job per registered source in exactly one of
//! three places: the pending queue, the running set or the failure queue.
//! Each tick reclaims old completions, dispatches due jobs up to the
//! concurrency cap and drains a batch of failures back into the pending queue
//! with exponential backoff. Source cadence adapts to observed outcomes.

mod job;
mod queue;

pub use job::{JobReport, JobSnapshot, JobStatus, Priority, ScrapingJob, SourceRegistration};

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use queue::JobQueue;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("source {source_id}: min frequency {min:?} exceeds max frequency {max:?}")]
    InvalidFrequencyBounds {
        source_id: String,
        min: Duration,
        max: Duration,
    },
    #[error("unknown priority `{0}`")]
    UnknownPriority(String),
    #[error("source id must not be empty")]
    EmptySourceId,
}

/// Backoff applied to jobs leaving the failure queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(30),
            max_delay: Duration::from_secs(300),
            max_attempts: 3,
        }
    }
}

impl RetryPolicy {
    /// `min(max_delay, base_delay * 2^failures)`.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub max_concurrent: usize,
    pub tick_interval: Duration,
    pub completed_retention: Duration,
    pub failure_batch: usize,
    /// Successful runs faster than this relax the source cadence.
    pub fast_run_threshold: Duration,
    pub retry: RetryPolicy,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            tick_interval: Duration::from_secs(30),
            completed_retention: Duration::from_secs(300),
            failure_batch: 5,
            fast_run_threshold: Duration::from_secs(10),
            retry: RetryPolicy::default(),
        }
    }
}

/// Runs one job on behalf of the scheduler.
#[async_trait]
pub trait JobExecutor: Send + Sync + 'static {
    async fn execute(&self, job: ScrapingJob, source: SourceRegistration) -> JobReport;
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SchedulerStats {
    pub total_jobs: u64,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    pub abandoned_jobs: u64,
    pub pending_jobs: usize,
    pub running_jobs: usize,
    pub failure_queue: usize,
    pub registered_sources: usize,
    pub recently_completed: usize,
}

/// What a single [`SmartScheduler::tick`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub reclaimed: usize,
    pub dispatched: usize,
    pub rescheduled: usize,
    pub abandoned: usize,
}

#[derive(Debug)]
struct RunningJob {
    run_id: u64,
    job: ScrapingJob,
    abort: AbortHandle,
}

#[derive(Debug, Default)]
struct Counters {
    total: u64,
    completed: u64,
    failed: u64,
    abandoned: u64,
}

#[derive(Debug, Default)]
struct SchedulerState {
    sources: HashMap<String, SourceRegistration>,
    pending: JobQueue,
    running: HashMap<String, RunningJob>,
    failed: VecDeque<ScrapingJob>,
    completed: VecDeque<(Instant, JobSnapshot)>,
    counters: Counters,
    next_run_id: u64,
}

impl SchedulerState {
    fn has_job(&self, source_id: &str) -> bool {
        self.running.contains_key(source_id)
            || self.pending.contains_source(source_id)
            || self.failed.iter().any(|job| job.source_id == source_id)
    }
}

#[derive(Debug, Default)]
struct Lifecycle {
    token: Option<CancellationToken>,
    handle: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Inner {
    config: SchedulerConfig,
    state: Mutex<SchedulerState>,
    lifecycle: Mutex<Lifecycle>,
}

/// Cloneable handle to a shared scheduler.
#[derive(Debug, Clone)]
pub struct SmartScheduler {
    inner: Arc<Inner>,
}

impl SmartScheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: Mutex::new(SchedulerState::default()),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SchedulerState> {
        self.inner.state.lock().expect("scheduler state poisoned")
    }

    /// Registers or updates a source and queues it for immediate execution.
    ///
    /// Returns the registration as stored, with its base frequency clamped
    /// into bounds. A source never has more than one job.
    pub fn add_source(
        &self,
        registration: SourceRegistration,
    ) -> Result<SourceRegistration, SchedulerError> {
        if registration.source_id.trim().is_empty() {
            return Err(SchedulerError::EmptySourceId);
        }
        let registration = registration.normalized()?;
        let source_id = registration.source_id.clone();
        let now = Instant::now();

        let mut state = self.state();
        state.sources.insert(source_id.clone(), registration.clone());

        if !registration.enabled {
            if state.pending.take_source(&source_id).is_some() {
                log::info!("source {} disabled, pending job dropped", source_id);
            }
            return Ok(registration);
        }

        if let Some(mut job) = state.pending.take_source(&source_id) {
            job.priority = registration.priority;
            job.url = registration.url.clone();
            job.scheduled_at = now;
            state.pending.push(job);
        } else if !state.has_job(&source_id) {
            state
                .pending
                .push(ScrapingJob::for_source(&registration, now));
            state.counters.total += 1;
        }

        log::info!(
            "source added: {} (priority {}, every {}s)",
            source_id,
            registration.priority,
            registration.base_frequency.as_secs()
        );
        Ok(registration)
    }

    /// Deregisters a source and purges its job wherever it sits.
    pub fn remove_source(&self, source_id: &str) -> bool {
        let mut state = self.state();
        let known = state.sources.remove(source_id).is_some();
        state.pending.take_source(source_id);
        state.failed.retain(|job| job.source_id != source_id);
        if let Some(running) = state.running.remove(source_id) {
            running.abort.abort();
        }
        if known {
            log::info!("source removed: {}", source_id);
        }
        known
    }

    pub fn source(&self, source_id: &str) -> Option<SourceRegistration> {
        self.state().sources.get(source_id).cloned()
    }

    /// Adapts a source's cadence to one run and returns the new base frequency.
    ///
    /// Fast successes relax the cadence by 20% up to the max; failures tighten
    /// it by 30% down to the min.
    pub fn update_frequency(
        &self,
        source_id: &str,
        success: bool,
        duration: Duration,
    ) -> Option<Duration> {
        let threshold = self.inner.config.fast_run_threshold;
        let mut state = self.state();
        let source = state.sources.get_mut(source_id)?;
        Some(adapt_frequency(source, success, duration, threshold))
    }

    /// One pass of the scheduling loop.
    pub fn tick(&self, executor: &Arc<dyn JobExecutor>) -> TickSummary {
        let config = &self.inner.config;
        let now = Instant::now();
        let mut summary = TickSummary::default();
        let mut state = self.state();

        let before = state.completed.len();
        state
            .completed
            .retain(|(at, _)| now.saturating_duration_since(*at) < config.completed_retention);
        summary.reclaimed = before - state.completed.len();

        let free = config.max_concurrent.saturating_sub(state.running.len());
        for mut job in state.pending.pop_due(now, free) {
            let Some(source) = state.sources.get(&job.source_id).cloned() else {
                continue;
            };
            if state.running.contains_key(&job.source_id) {
                log::warn!("source {} already running, job {} deferred", job.source_id, job.id);
                state.pending.push(job);
                continue;
            }

            job.status = JobStatus::Running;
            job.last_run = Some(chrono::Utc::now());
            let run_id = state.next_run_id;
            state.next_run_id += 1;

            log::info!("dispatching {} ({})", job.id, job.source_type);
            let handle = tokio::spawn(run_job(
                self.clone(),
                executor.clone(),
                run_id,
                job.clone(),
                source,
            ));
            state.running.insert(
                job.source_id.clone(),
                RunningJob {
                    run_id,
                    job,
                    abort: handle.abort_handle(),
                },
            );
            summary.dispatched += 1;
        }

        let policy = config.retry;
        for _ in 0..config.failure_batch {
            let Some(mut job) = state.failed.pop_front() else {
                break;
            };
            if job.consecutive_failures >= policy.max_attempts {
                log::warn!(
                    "job {} abandoned after {} consecutive failures: {}",
                    job.id,
                    job.consecutive_failures,
                    job.last_error.as_deref().unwrap_or("unknown error")
                );
                state.counters.abandoned += 1;
                summary.abandoned += 1;
                continue;
            }
            let delay = policy.delay_for(job.consecutive_failures);
            job.scheduled_at = now + delay;
            job.status = JobStatus::Pending;
            log::info!("retry for {} in {}s", job.id, delay.as_secs());
            state.pending.push(job);
            summary.rescheduled += 1;
        }

        summary
    }

    fn complete(&self, source_id: &str, run_id: u64, report: JobReport, duration: Duration) {
        let threshold = self.inner.config.fast_run_threshold;
        let now = Instant::now();
        let mut state = self.state();

        match state.running.get(source_id) {
            Some(running) if running.run_id == run_id => {}
            _ => return,
        }
        let Some(RunningJob { mut job, .. }) = state.running.remove(source_id) else {
            return;
        };

        job.record_run(&report, duration);
        if report.success {
            state.counters.completed += 1;
        } else {
            state.counters.failed += 1;
            log::warn!(
                "job {} failed: {}",
                job.id,
                job.last_error.as_deref().unwrap_or("unknown error")
            );
        }
        state.completed.push_back((now, job.snapshot(now)));

        let Some(source) = state.sources.get_mut(source_id) else {
            return;
        };
        let next = adapt_frequency(source, report.success, duration, threshold);
        let enabled = source.enabled;
        job.priority = source.priority;
        job.scheduled_at = now + next;

        if !enabled {
            return;
        }
        if report.success {
            job.status = JobStatus::Pending;
            state.pending.push(job);
        } else {
            state.failed.push_back(job);
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        let state = self.state();
        SchedulerStats {
            total_jobs: state.counters.total,
            completed_jobs: state.counters.completed,
            failed_jobs: state.counters.failed,
            abandoned_jobs: state.counters.abandoned,
            pending_jobs: state.pending.len(),
            running_jobs: state.running.len(),
            failure_queue: state.failed.len(),
            registered_sources: state.sources.len(),
            recently_completed: state.completed.len(),
        }
    }

    /// Up to `count` due jobs in dispatch order.
    pub fn next_jobs(&self, count: usize) -> Vec<JobSnapshot> {
        let now = Instant::now();
        let state = self.state();
        state
            .pending
            .peek_due(now, count)
            .into_iter()
            .map(|job| job.snapshot(now))
            .collect()
    }

    pub fn is_running(&self) -> bool {
        self.inner
            .lifecycle
            .lock()
            .expect("scheduler lifecycle poisoned")
            .token
            .is_some()
    }

    /// Spawns the tick loop. Returns `false` when it is already running.
    pub fn start(&self, executor: Arc<dyn JobExecutor>) -> bool {
        let mut lifecycle = self
            .inner
            .lifecycle
            .lock()
            .expect("scheduler lifecycle poisoned");
        if lifecycle.token.is_some() {
            return false;
        }

        let token = CancellationToken::new();
        let scheduler = self.clone();
        let cancel = token.clone();
        let period = self.inner.config.tick_interval;
        lifecycle.handle = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let summary = scheduler.tick(&executor);
                        if summary != TickSummary::default() {
                            log::debug!("scheduler tick: {:?}", summary);
                        }
                    }
                }
            }
        }));
        lifecycle.token = Some(token);
        log::info!("scheduler started (tick every {}s)", period.as_secs());
        true
    }

    /// Stops the loop and returns in-flight jobs to the pending queue.
    /// Returns `false` when it was not running.
    pub async fn stop(&self) -> bool {
        let (token, handle) = {
            let mut lifecycle = self
                .inner
                .lifecycle
                .lock()
                .expect("scheduler lifecycle poisoned");
            (lifecycle.token.take(), lifecycle.handle.take())
        };
        let Some(token) = token else {
            return false;
        };

        token.cancel();
        if let Some(handle) = handle
            && let Err(err) = handle.await
            && err.is_panic()
        {
            log::error!("scheduler loop panicked: {}", err);
        }

        let mut state = self.state();
        let running: Vec<_> = state.running.drain().map(|(_, running)| running).collect();
        for RunningJob { mut job, abort, .. } in running {
            abort.abort();
            job.status = JobStatus::Pending;
            state.pending.push(job);
        }
        log::info!("scheduler stopped");
        true
    }
}

impl Default for SmartScheduler {
    fn default() -> Self {
        Self::new(SchedulerConfig::default())
    }
}

fn adapt_frequency(
    source: &mut SourceRegistration,
    success: bool,
    duration: Duration,
    fast_threshold: Duration,
) -> Duration {
    if success {
        if duration < fast_threshold && source.base_frequency < source.max_frequency {
            source.base_frequency = (source.base_frequency * 6 / 5).min(source.max_frequency);
        }
    } else if source.base_frequency > source.min_frequency {
        source.base_frequency = (source.base_frequency * 7 / 10).max(source.min_frequency);
    }
    source.base_frequency
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

async fn run_job(
    scheduler: SmartScheduler,
    executor: Arc<dyn JobExecutor>,
    run_id: u64,
    job: ScrapingJob,
    source: SourceRegistration,
) {
    let started = Instant::now();
    let source_id = job.source_id.clone();
    let mut execution = AbortOnDrop(tokio::spawn(async move {
        executor.execute(job, source).await
    }));

    let report = match (&mut execution.0).await {
        Ok(report) => report,
        Err(err) if err.is_panic() => JobReport::failure("executor panicked"),
        Err(_) => JobReport::failure("execution cancelled"),
    };
    scheduler.complete(&source_id, run_id, report, started.elapsed());
}
