//! Job scheduler
//!
//! The scheduler owns the table of recurring jobs. A background loop ticks on
//! a fixed cadence, picks the jobs that are due and dispatches each one under
//! a bounded worker budget. A due job that finds no free slot is skipped for
//! that tick and picked up again on a later one; nothing is queued.

use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::job::{job_id, ScheduledJob, SchedulerConfig, SchedulerInfo, SchedulerStatus};
use super::processor::{JobProcessor, LoggingJobProcessor};
use crate::collectors::{Collector, CollectorRegistry};
use crate::error::ClassifiedError;
use crate::events::{CollectionResult, Timestamp};

/// Delay before a freshly scheduled job first becomes due
const INITIAL_DELAY: Duration = Duration::from_millis(100);

struct ActiveJob {
    run_id: u64,
    token: CancellationToken,
}

struct SchedulerState {
    status: SchedulerStatus,
    start_time: Option<Timestamp>,
    last_tick: Option<Timestamp>,
    jobs: HashMap<String, ScheduledJob>,
    active: HashMap<String, ActiveJob>,
    completed_jobs: u64,
    failed_jobs: u64,
    next_run_id: u64,
    root: Option<CancellationToken>,
    loop_handle: Option<JoinHandle<()>>,
}

struct Inner {
    config: SchedulerConfig,
    registry: Arc<CollectorRegistry>,
    processor: Arc<dyn JobProcessor>,
    semaphore: Arc<Semaphore>,
    tracker: TaskTracker,
    state: Mutex<SchedulerState>,
}

/// Recurring job scheduler
///
/// Cheap to clone; all clones share the same job table.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

/// Removes a job from the active set when its execution ends, however it ends
struct ActiveGuard {
    inner: Arc<Inner>,
    job_id: String,
    run_id: u64,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        if let Ok(mut state) = self.inner.state.lock() {
            if state.active.get(&self.job_id).map(|a| a.run_id) == Some(self.run_id) {
                state.active.remove(&self.job_id);
            }
        }
    }
}

impl Scheduler {
    /// Create a scheduler that logs job outcomes
    pub fn new(config: SchedulerConfig, registry: Arc<CollectorRegistry>) -> Self {
        Self::with_processor(config, registry, Arc::new(LoggingJobProcessor))
    }

    pub fn with_processor(
        config: SchedulerConfig,
        registry: Arc<CollectorRegistry>,
        processor: Arc<dyn JobProcessor>,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent_jobs));
        Self {
            inner: Arc::new(Inner {
                config,
                registry,
                processor,
                semaphore,
                tracker: TaskTracker::new(),
                state: Mutex::new(SchedulerState {
                    status: SchedulerStatus::Stopped,
                    start_time: None,
                    last_tick: None,
                    jobs: HashMap::new(),
                    active: HashMap::new(),
                    completed_jobs: 0,
                    failed_jobs: 0,
                    next_run_id: 0,
                    root: None,
                    loop_handle: None,
                }),
            }),
        }
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.inner.config
    }

    /// Start the tick loop
    ///
    /// Must be called from within a Tokio runtime. Calling it while running
    /// is a no-op.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the tick interval, worker budget or
    /// job timeout is zero; the scheduler is then left in the `Error` state.
    pub fn start(&self) -> Result<(), ClassifiedError> {
        let mut state = self.inner.state.lock().unwrap();
        match state.status {
            SchedulerStatus::Running => return Ok(()),
            SchedulerStatus::Stopping => {
                return Err(ClassifiedError::validation(
                    "SCHEDULER_STOPPING",
                    "scheduler is still stopping",
                ))
            }
            _ => {}
        }

        let config = &self.inner.config;
        info!(
            "Starting scheduler with tick interval {:?}, max concurrent jobs {}, job timeout {:?}",
            config.tick_interval, config.max_concurrent_jobs, config.job_timeout
        );
        state.status = SchedulerStatus::Starting;
        state.start_time = Some(Utc::now());
        state.last_tick = None;

        if let Err(e) = config.validate() {
            error!("Scheduler configuration rejected: {}", e);
            state.status = SchedulerStatus::Error;
            return Err(e);
        }

        let root = CancellationToken::new();
        self.inner.tracker.reopen();
        state.root = Some(root.clone());
        state.loop_handle = Some(tokio::spawn(run_loop(
            Arc::downgrade(&self.inner),
            root,
            config.tick_interval,
        )));
        state.status = SchedulerStatus::Running;

        info!("Scheduler started");
        Ok(())
    }

    /// Stop the loop and cancel every running job
    ///
    /// Waits up to `deadline` for the loop and the in-flight jobs to finish.
    /// The scheduler always ends up `Stopped`; jobs still unwinding after the
    /// deadline keep their cancelled tokens and clean up on their own.
    ///
    /// # Errors
    ///
    /// Returns a timeout error if the deadline elapsed first.
    pub async fn stop(&self, deadline: Duration) -> Result<(), ClassifiedError> {
        let (root, loop_handle) = {
            let mut state = self.inner.state.lock().unwrap();
            if state.status != SchedulerStatus::Running {
                return Ok(());
            }
            state.status = SchedulerStatus::Stopping;
            (state.root.take(), state.loop_handle.take())
        };

        info!("Stopping scheduler");
        if let Some(root) = &root {
            root.cancel();
        }

        self.inner.tracker.close();
        let tracker = self.inner.tracker.clone();
        let drained = tokio::time::timeout(deadline, async move {
            if let Some(handle) = loop_handle {
                let _ = handle.await;
            }
            tracker.wait().await;
        })
        .await;

        let mut state = self.inner.state.lock().unwrap();
        for (id, active) in &state.active {
            debug!("Cancelling active job {}", id);
            active.token.cancel();
        }
        state.status = SchedulerStatus::Stopped;

        match drained {
            Ok(()) => {
                info!("Scheduler stopped");
                Ok(())
            }
            Err(_) => {
                warn!(
                    "Scheduler stop timed out after {:?} with {} jobs still active",
                    deadline,
                    state.active.len()
                );
                Err(ClassifiedError::timeout("scheduler_stop", deadline))
            }
        }
    }

    /// Schedule `collector_name` for every target
    ///
    /// Existing jobs with the same id are replaced (and cancelled if running).
    /// Targets outside the configured allow-list are dropped silently.
    /// Returns the ids of the scheduled jobs.
    ///
    /// # Errors
    ///
    /// Fails with `COLLECTOR_NOT_FOUND` if the collector is not registered and
    /// with a configuration error if `interval` is zero.
    pub fn schedule<I, S>(&self, collector_name: &str, targets: I, interval: Duration) -> Result<Vec<String>, ClassifiedError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if interval.is_zero() {
            return Err(ClassifiedError::configuration(
                "INVALID_INTERVAL",
                format!("interval for collector {} must be positive", collector_name),
            ));
        }
        if !self.inner.registry.contains(collector_name) {
            return Err(ClassifiedError::validation(
                "COLLECTOR_NOT_FOUND",
                format!("collector {} not found in registry", collector_name),
            )
            .with_metadata("collector", collector_name));
        }

        let next_run = advance(Utc::now(), INITIAL_DELAY);
        let mut state = self.inner.state.lock().unwrap();
        let mut ids = Vec::new();

        for target in targets {
            let target = target.as_ref();
            if !self.inner.config.allows_target(target) {
                debug!("Skipping target {} for {}: not in enabled targets", target, collector_name);
                continue;
            }

            let job = ScheduledJob::new(collector_name, target, interval, next_run);
            if let Some(active) = state.active.remove(&job.id) {
                active.token.cancel();
            }
            info!(
                "Scheduled job {} ({} on {}) every {:?}",
                job.id, collector_name, target, interval
            );
            ids.push(job.id.clone());
            state.jobs.insert(job.id.clone(), job);
        }

        Ok(ids)
    }

    /// Remove a job, cancelling it if it is currently running
    ///
    /// # Errors
    ///
    /// Fails with `JOB_NOT_FOUND` if no such job exists.
    pub fn unschedule(&self, collector_name: &str, target: &str) -> Result<(), ClassifiedError> {
        let id = job_id(collector_name, target);
        let mut state = self.inner.state.lock().unwrap();

        if state.jobs.remove(&id).is_none() {
            return Err(not_found(&id));
        }
        if let Some(active) = state.active.remove(&id) {
            debug!("Cancelling running job {}", id);
            active.token.cancel();
        }

        info!("Unscheduled job {}", id);
        Ok(())
    }

    /// Pause or resume a job without removing it
    pub fn set_job_enabled(&self, collector_name: &str, target: &str, enabled: bool) -> Result<(), ClassifiedError> {
        let id = job_id(collector_name, target);
        let mut state = self.inner.state.lock().unwrap();
        let job = state.jobs.get_mut(&id).ok_or_else(|| not_found(&id))?;

        job.enabled = enabled;
        info!("Job {} {}", id, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    /// Snapshot of all jobs, ordered by id
    pub fn list_jobs(&self) -> Vec<ScheduledJob> {
        let state = self.inner.state.lock().unwrap();
        let mut jobs: Vec<ScheduledJob> = state.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.id.cmp(&b.id));
        jobs
    }

    pub fn status(&self) -> SchedulerInfo {
        let state = self.inner.state.lock().unwrap();
        SchedulerInfo {
            status: state.status,
            start_time: state.start_time,
            job_count: state.jobs.len(),
            active_jobs: state.active.len(),
            completed_jobs: state.completed_jobs,
            failed_jobs: state.failed_jobs,
            last_tick: state.last_tick,
        }
    }

    /// `Ok(())` while running and ticking on schedule
    pub fn health(&self) -> Result<(), ClassifiedError> {
        let state = self.inner.state.lock().unwrap();
        match state.status {
            SchedulerStatus::Running => {
                let stuck_after = self.inner.config.tick_interval * 2;
                let reference = state.last_tick.or(state.start_time);
                let silent_for = reference
                    .and_then(|at| (Utc::now() - at).to_std().ok())
                    .unwrap_or_default();
                if silent_for > stuck_after {
                    return Err(ClassifiedError::validation(
                        "SCHEDULER_NOT_TICKING",
                        format!("scheduler has not ticked for {:?}", silent_for),
                    ));
                }
                Ok(())
            }
            SchedulerStatus::Error => Err(ClassifiedError::validation(
                "SCHEDULER_ERROR",
                "scheduler is in error state",
            )),
            SchedulerStatus::Stopped => Err(ClassifiedError::validation(
                "SCHEDULER_STOPPED",
                "scheduler is stopped",
            )),
            SchedulerStatus::Starting | SchedulerStatus::Stopping => Err(ClassifiedError::validation(
                "SCHEDULER_NOT_READY",
                "scheduler is not ready",
            )),
        }
    }

    fn tick(&self, root: &CancellationToken) {
        let now = Utc::now();
        let due: Vec<ScheduledJob> = {
            let mut state = self.inner.state.lock().unwrap();
            state.last_tick = Some(now);
            state
                .jobs
                .values()
                .filter(|job| job.enabled && now > job.next_run && !state.active.contains_key(&job.id))
                .cloned()
                .collect()
        };

        for job in due {
            match Arc::clone(&self.inner.semaphore).try_acquire_owned() {
                Ok(permit) => self.dispatch(job, permit, root),
                Err(_) => warn!(
                    "Skipping job {}: {} concurrent jobs already running",
                    job.id, self.inner.config.max_concurrent_jobs
                ),
            }
        }
    }

    fn dispatch(&self, job: ScheduledJob, permit: OwnedSemaphorePermit, root: &CancellationToken) {
        let token = root.child_token();
        let run_id = {
            let mut state = self.inner.state.lock().unwrap();
            // Unscheduled or replaced between the snapshot and now
            if !state.jobs.contains_key(&job.id) || state.active.contains_key(&job.id) {
                return;
            }
            state.next_run_id += 1;
            let run_id = state.next_run_id;
            state.active.insert(
                job.id.clone(),
                ActiveJob {
                    run_id,
                    token: token.clone(),
                },
            );
            run_id
        };

        let scheduler = self.clone();
        self.inner.tracker.spawn(async move {
            let _permit = permit;
            scheduler.execute_job(job, run_id, token).await;
        });
    }

    async fn execute_job(&self, job: ScheduledJob, run_id: u64, token: CancellationToken) {
        let _guard = ActiveGuard {
            inner: Arc::clone(&self.inner),
            job_id: job.id.clone(),
            run_id,
        };
        debug!("Executing job {} ({} on {})", job.id, job.collector_name, job.target);

        let result = match self.inner.registry.get(&job.collector_name) {
            Some(collector) => self.run_collector(collector, &job, &token).await,
            None => CollectionResult::failed(
                job.collector_name.as_str(),
                job.target.as_str(),
                Utc::now(),
                Duration::ZERO,
                ClassifiedError::validation(
                    "COLLECTOR_NOT_FOUND",
                    format!("collector {} not found in registry", job.collector_name),
                ),
            ),
        };
        token.cancel();

        self.complete(job, run_id, result);
    }

    /// Run one collection in its own task, bounded by the job timeout
    async fn run_collector(
        &self,
        collector: Arc<dyn Collector>,
        job: &ScheduledJob,
        token: &CancellationToken,
    ) -> CollectionResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let timeout = self.inner.config.job_timeout;

        let target = job.target.clone();
        let collect_token = token.clone();
        let mut handle = self
            .inner
            .tracker
            .spawn(async move { collector.collect(collect_token, &target).await });

        let err = tokio::select! {
            biased;
            joined = &mut handle => match joined {
                Ok(result) => return result,
                Err(e) => join_error(&job.collector_name, e),
            },
            _ = token.cancelled() => {
                handle.abort();
                ClassifiedError::cancelled(format!("job {} cancelled", job.id))
            }
            _ = tokio::time::sleep(timeout) => {
                token.cancel();
                handle.abort();
                ClassifiedError::timeout("collect", timeout)
            }
        };

        let err = err.with_target(job.target.as_str());
        CollectionResult::failed(
            job.collector_name.as_str(),
            job.target.as_str(),
            started_at,
            clock.elapsed(),
            err,
        )
    }

    /// Attach the result to its job and hand it to the processor
    fn complete(&self, job: ScheduledJob, run_id: u64, result: CollectionResult) {
        let now = Utc::now();
        let updated = {
            let mut state = self.inner.state.lock().unwrap();
            if state.active.get(&job.id).map(|a| a.run_id) != Some(run_id) {
                debug!("Discarding result of job {}: unscheduled while running", job.id);
                return;
            }

            let failed = result.error.is_some();
            let Some(entry) = state.jobs.get_mut(&job.id) else {
                return;
            };
            entry.last_run = Some(now);
            entry.next_run = advance(now, entry.interval);
            entry.last_result = Some(result);
            let updated = entry.clone();

            if failed {
                state.failed_jobs += 1;
            } else {
                state.completed_jobs += 1;
            }
            updated
        };

        let processor = &self.inner.processor;
        match updated.last_result.as_ref().and_then(|r| r.error.as_ref()) {
            Some(err) => {
                warn!("Job {} failed: {}", updated.id, err);
                if let Err(e) = processor.process_error(&updated, err) {
                    error!("Failed to process error of job {}: {}", updated.id, e);
                }
            }
            None => {
                debug!("Job {} completed", updated.id);
                if let Some(result) = &updated.last_result {
                    if let Err(e) = processor.process_result(&updated, result) {
                        error!("Failed to process result of job {}: {}", updated.id, e);
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

async fn run_loop(inner: Weak<Inner>, token: CancellationToken, tick_interval: Duration) {
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + tick_interval, tick_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    debug!("Scheduler loop started");

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    break;
                };
                Scheduler { inner }.tick(&token);
            }
        }
    }

    debug!("Scheduler loop exited");
}

fn advance(from: Timestamp, by: Duration) -> Timestamp {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|delta| from.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn not_found(id: &str) -> ClassifiedError {
    ClassifiedError::validation("JOB_NOT_FOUND", format!("job {} not found", id))
}

fn join_error(collector_name: &str, err: JoinError) -> ClassifiedError {
    if !err.is_panic() {
        return ClassifiedError::cancelled(format!("collector {} task was cancelled", collector_name));
    }

    let payload = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());

    error!("Collector {} panicked: {}", collector_name, detail);
    ClassifiedError::internal(
        "COLLECTOR_PANIC",
        format!("collector {} panicked: {}", collector_name, detail),
    )
    .with_severity(crate::error::Severity::Critical)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::{CollectRequest, CollectorConfig, FnCollector};
    use crate::error::{ErrorCategory, ProcessorError};
    use crate::events::{Labels, MetricObservation};
    use crate::resilience::{BoxError, RetryConfig};
    use crate::scheduler::MockJobProcessor;
    use std::future::Future;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Processor remembering every outcome it was handed
    #[derive(Default)]
    struct RecordingProcessor {
        results: Mutex<Vec<(ScheduledJob, CollectionResult)>>,
        errors: Mutex<Vec<(ScheduledJob, ClassifiedError)>>,
    }

    impl JobProcessor for RecordingProcessor {
        fn process_result(&self, job: &ScheduledJob, result: &CollectionResult) -> Result<(), ProcessorError> {
            self.results.lock().unwrap().push((job.clone(), result.clone()));
            Ok(())
        }

        fn process_error(&self, job: &ScheduledJob, err: &ClassifiedError) -> Result<(), ProcessorError> {
            self.errors.lock().unwrap().push((job.clone(), err.clone()));
            Ok(())
        }
    }

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(20),
            max_concurrent_jobs: 4,
            job_timeout: Duration::from_secs(5),
            enabled_targets: Vec::new(),
        }
    }

    fn collector_config(retries: u32) -> CollectorConfig {
        CollectorConfig {
            interval: Duration::from_secs(60),
            targets: vec!["us-east-1".to_string()],
            retry: RetryConfig {
                retries,
                base_delay: Duration::from_millis(5),
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(20),
                attempt_timeout: Duration::from_secs(2),
            },
            ..CollectorConfig::default()
        }
    }

    fn registry_with<F, Fut>(name: &str, retries: u32, collect_fn: F) -> Arc<CollectorRegistry>
    where
        F: Fn(CollectRequest) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<MetricObservation>, BoxError>> + Send + 'static,
    {
        let registry = Arc::new(CollectorRegistry::new());
        registry
            .register(Arc::new(FnCollector::new(name, "test collector", collector_config(retries), collect_fn)))
            .unwrap();
        registry
    }

    fn ok_registry(name: &str) -> Arc<CollectorRegistry> {
        registry_with(name, 0, |req| async move {
            Ok(vec![req.metrics.metric("up", 1.0, "bool", Labels::new())])
        })
    }

    async fn wait_for(mut condition: impl FnMut() -> bool, limit: Duration) -> bool {
        let started = Instant::now();
        while started.elapsed() < limit {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_start_stop_transitions() {
        let scheduler = Scheduler::new(fast_config(), ok_registry("ec2"));
        assert_eq!(scheduler.status().status, SchedulerStatus::Stopped);

        scheduler.start().unwrap();
        scheduler.start().unwrap();
        assert_eq!(scheduler.status().status, SchedulerStatus::Running);
        assert!(scheduler.status().start_time.is_some());

        scheduler.stop(Duration::from_secs(2)).await.unwrap();
        scheduler.stop(Duration::from_secs(2)).await.unwrap();
        let info = scheduler.status();
        assert_eq!(info.status, SchedulerStatus::Stopped);
        assert_eq!(info.active_jobs, 0);
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let scheduler = Scheduler::new(fast_config(), ok_registry("ec2"));
        scheduler.start().unwrap();
        scheduler.stop(Duration::from_secs(2)).await.unwrap();

        scheduler.start().unwrap();
        scheduler.schedule("ec2", ["us-east-1"], Duration::from_secs(60)).unwrap();
        assert!(wait_for(|| scheduler.status().completed_jobs >= 1, Duration::from_secs(2)).await);
        scheduler.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let config = SchedulerConfig {
            max_concurrent_jobs: 0,
            ..fast_config()
        };
        let scheduler = Scheduler::new(config, ok_registry("ec2"));

        let err = scheduler.start().unwrap_err();
        assert!(err.is(ErrorCategory::Configuration, "INVALID_MAX_CONCURRENT_JOBS"));
        assert_eq!(scheduler.status().status, SchedulerStatus::Error);
        assert_eq!(scheduler.health().unwrap_err().code, "SCHEDULER_ERROR");
    }

    #[test]
    fn test_schedule_validates_collector_and_interval() {
        let scheduler = Scheduler::new(fast_config(), ok_registry("ec2"));

        let err = scheduler
            .schedule("missing", ["us-east-1"], Duration::from_secs(1))
            .unwrap_err();
        assert!(err.is(ErrorCategory::Validation, "COLLECTOR_NOT_FOUND"));

        let err = scheduler.schedule("ec2", ["us-east-1"], Duration::ZERO).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Configuration);
        assert!(scheduler.list_jobs().is_empty());
    }

    #[test]
    fn test_schedule_applies_allow_list() {
        let config = SchedulerConfig {
            enabled_targets: vec!["us-east-1".to_string(), "eu-west-1".to_string()],
            ..fast_config()
        };
        let scheduler = Scheduler::new(config, ok_registry("ec2"));

        let ids = scheduler
            .schedule("ec2", ["us-east-1", "ap-south-1", "eu-west-1"], Duration::from_secs(60))
            .unwrap();

        assert_eq!(ids, vec!["ec2-us-east-1".to_string(), "ec2-eu-west-1".to_string()]);
        let jobs = scheduler.list_jobs();
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().all(|job| job.enabled && job.last_run.is_none()));
        assert!(jobs.iter().all(|job| job.next_run > Utc::now() - chrono::Duration::seconds(1)));
    }

    #[test]
    fn test_unschedule_unknown_job() {
        let scheduler = Scheduler::new(fast_config(), ok_registry("ec2"));
        let err = scheduler.unschedule("ec2", "us-east-1").unwrap_err();
        assert!(err.is(ErrorCategory::Validation, "JOB_NOT_FOUND"));
        assert!(scheduler.set_job_enabled("ec2", "us-east-1", false).is_err());
    }

    #[tokio::test]
    async fn test_recurring_job_produces_results() {
        let processor = Arc::new(RecordingProcessor::default());
        let scheduler = Scheduler::with_processor(fast_config(), ok_registry("ec2"), processor.clone());
        scheduler.start().unwrap();
        scheduler.schedule("ec2", ["us-east-1"], Duration::from_millis(200)).unwrap();

        tokio::time::sleep(Duration::from_millis(900)).await;
        scheduler.stop(Duration::from_secs(2)).await.unwrap();

        let results = processor.results.lock().unwrap();
        assert!(results.len() >= 3, "only {} results", results.len());
        for (job, result) in results.iter() {
            assert_eq!(job.collector_name, "ec2");
            assert_eq!(job.target, "us-east-1");
            assert_eq!(result.collector_name, "ec2");
            assert_eq!(result.target, "us-east-1");
        }
        for pair in results.windows(2) {
            assert!(pair[1].0.next_run > pair[0].0.next_run);
        }
        assert_eq!(scheduler.status().failed_jobs, 0);
        assert!(scheduler.status().completed_jobs >= 3);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried_within_a_job() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let registry = registry_with("flaky", 2, move |req| {
            let call = counter.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if call < 3 {
                    return Err(ClassifiedError::connectivity("DIAL", "connection refused").into());
                }
                Ok(vec![req.metrics.metric("up", 1.0, "bool", Labels::new())])
            }
        });
        let processor = Arc::new(RecordingProcessor::default());
        let scheduler = Scheduler::with_processor(fast_config(), registry, processor.clone());
        scheduler.start().unwrap();
        scheduler.schedule("flaky", ["us-east-1"], Duration::from_secs(60)).unwrap();

        assert!(wait_for(|| scheduler.status().completed_jobs == 1, Duration::from_secs(3)).await);
        scheduler.stop(Duration::from_secs(2)).await.unwrap();

        let info = scheduler.status();
        assert_eq!(info.failed_jobs, 0);
        let results = processor.results.lock().unwrap();
        assert_eq!(results.len(), 1);
        assert!(results[0].1.error.is_none());
        assert_eq!(results[0].1.metrics.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_permission_failure_goes_to_error_processor() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let registry = registry_with("denied", 3, move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(ClassifiedError::permission("describe", "instances").into()) }
        });

        let mut processor = MockJobProcessor::new();
        processor
            .expect_process_error()
            .withf(|job, err| job.id == "denied-us-east-1" && err.category == ErrorCategory::Permission)
            .times(1)
            .returning(|_, _| Ok(()));
        processor.expect_process_result().never();

        let scheduler = Scheduler::with_processor(fast_config(), registry, Arc::new(processor));
        scheduler.start().unwrap();
        scheduler.schedule("denied", ["us-east-1"], Duration::from_secs(60)).unwrap();

        assert!(wait_for(|| scheduler.status().failed_jobs == 1, Duration::from_secs(3)).await);
        scheduler.stop(Duration::from_secs(2)).await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let job = &scheduler.list_jobs()[0];
        let result = job.last_result.as_ref().unwrap();
        assert!(result.metrics.is_empty());
        assert_eq!(result.error.as_ref().unwrap().category, ErrorCategory::Permission);
    }

    #[tokio::test]
    async fn test_processor_failure_is_not_fatal() {
        let mut processor = MockJobProcessor::new();
        processor
            .expect_process_result()
            .returning(|_, _| Err(ProcessorError::Failed("exporter down".to_string())));
        processor.expect_process_error().returning(|_, _| Ok(()));

        let scheduler = Scheduler::with_processor(fast_config(), ok_registry("ec2"), Arc::new(processor));
        scheduler.start().unwrap();
        scheduler.schedule("ec2", ["us-east-1"], Duration::from_millis(100)).unwrap();

        assert!(wait_for(|| scheduler.status().completed_jobs >= 2, Duration::from_secs(3)).await);
        assert!(scheduler.health().is_ok());
        scheduler.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unschedule_cancels_running_job() {
        let seen: Arc<Mutex<Option<CancellationToken>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        let registry = registry_with("slow", 0, move |req| {
            *slot.lock().unwrap() = Some(req.token.clone());
            async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(Vec::new())
            }
        });
        let processor = Arc::new(RecordingProcessor::default());
        let scheduler = Scheduler::with_processor(fast_config(), registry, processor.clone());
        scheduler.start().unwrap();
        scheduler.schedule("slow", ["us-east-1"], Duration::from_secs(60)).unwrap();

        assert!(wait_for(|| scheduler.status().active_jobs == 1, Duration::from_secs(2)).await);
        scheduler.unschedule("slow", "us-east-1").unwrap();

        assert!(scheduler.list_jobs().is_empty());
        let token = seen.lock().unwrap().clone().unwrap();
        assert!(wait_for(|| token.is_cancelled(), Duration::from_secs(1)).await);

        tokio::time::sleep(Duration::from_millis(100)).await;
        let info = scheduler.status();
        assert_eq!(info.active_jobs, 0);
        assert_eq!(info.completed_jobs + info.failed_jobs, 0);
        assert!(processor.results.lock().unwrap().is_empty());
        assert!(processor.errors.lock().unwrap().is_empty());

        scheduler.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_disabled_job_is_never_dispatched() {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let registry = registry_with("ec2", 0, move |_req| {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Ok(Vec::new()) }
        });
        let scheduler = Scheduler::new(fast_config(), registry);
        scheduler.schedule("ec2", ["us-east-1"], Duration::from_millis(50)).unwrap();
        scheduler.set_job_enabled("ec2", "us-east-1", false).unwrap();
        scheduler.start().unwrap();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        scheduler.set_job_enabled("ec2", "us-east-1", true).unwrap();
        assert!(wait_for(|| calls.load(Ordering::SeqCst) >= 1, Duration::from_secs(2)).await);
        scheduler.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_budget_skips_instead_of_queueing() {
        let running = Arc::new(AtomicU32::new(0));
        let peak = Arc::new(AtomicU32::new(0));
        let (now_running, max_seen) = (Arc::clone(&running), Arc::clone(&peak));
        let registry = registry_with("busy", 0, move |_req| {
            let current = now_running.fetch_add(1, Ordering::SeqCst) + 1;
            max_seen.fetch_max(current, Ordering::SeqCst);
            let done = Arc::clone(&now_running);
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                done.fetch_sub(1, Ordering::SeqCst);
                Ok(Vec::new())
            }
        });
        let config = SchedulerConfig {
            max_concurrent_jobs: 1,
            ..fast_config()
        };
        let scheduler = Scheduler::new(config, registry);
        scheduler.start().unwrap();
        scheduler
            .schedule("busy", ["a", "b", "c"], Duration::from_millis(50))
            .unwrap();

        tokio::time::sleep(Duration::from_millis(700)).await;
        let info = scheduler.status();
        scheduler.stop(Duration::from_secs(2)).await.unwrap();

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(info.active_jobs <= 1);
        assert!(info.completed_jobs >= 2);
    }

    #[tokio::test]
    async fn test_job_timeout_produces_timeout_error() {
        let registry = registry_with("hang", 0, |_req| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(Vec::new())
        });
        let config = SchedulerConfig {
            job_timeout: Duration::from_millis(150),
            ..fast_config()
        };
        let scheduler = Scheduler::new(config, registry);
        scheduler.start().unwrap();
        scheduler.schedule("hang", ["us-east-1"], Duration::from_secs(60)).unwrap();

        assert!(wait_for(|| scheduler.status().failed_jobs == 1, Duration::from_secs(3)).await);
        scheduler.stop(Duration::from_secs(2)).await.unwrap();

        let job = &scheduler.list_jobs()[0];
        let err = job.last_result.as_ref().unwrap().error.as_ref().unwrap();
        assert_eq!(err.category, ErrorCategory::Timeout);
    }

    #[tokio::test]
    async fn test_panicking_collector_does_not_kill_scheduler() {
        let registry = registry_with("boom", 0, |req: CollectRequest| async move {
            if req.target == "us-east-1" {
                panic!("collector exploded");
            }
            Ok(Vec::new())
        });
        let scheduler = Scheduler::new(fast_config(), registry);
        scheduler.start().unwrap();
        scheduler.schedule("boom", ["us-east-1"], Duration::from_secs(60)).unwrap();

        assert!(wait_for(|| scheduler.status().failed_jobs == 1, Duration::from_secs(3)).await);

        let job = &scheduler.list_jobs()[0];
        let err = job.last_result.as_ref().unwrap().error.as_ref().unwrap();
        assert!(err.is(ErrorCategory::Internal, "COLLECTOR_PANIC"));
        assert!(err.message.contains("collector exploded"));
        assert_eq!(scheduler.status().active_jobs, 0);
        assert!(scheduler.health().is_ok());

        scheduler.stop(Duration::from_secs(2)).await.unwrap();
    }

    #[tokio::test]
    async fn test_collector_removed_from_registry_fails_job() {
        let registry = ok_registry("ec2");
        let scheduler = Scheduler::new(fast_config(), Arc::clone(&registry));
        scheduler.schedule("ec2", ["us-east-1"], Duration::from_secs(60)).unwrap();
        registry.unregister("ec2").await.unwrap();
        scheduler.start().unwrap();

        assert!(wait_for(|| scheduler.status().failed_jobs == 1, Duration::from_secs(3)).await);
        scheduler.stop(Duration::from_secs(2)).await.unwrap();

        let job = &scheduler.list_jobs()[0];
        let err = job.last_result.as_ref().unwrap().error.as_ref().unwrap();
        assert_eq!(err.code, "COLLECTOR_NOT_FOUND");
    }

    #[tokio::test]
    async fn test_stop_cancels_in_flight_jobs() {
        let registry = registry_with("slow", 0, |req: CollectRequest| async move {
            req.token.cancelled().await;
            Ok(Vec::new())
        });
        let scheduler = Scheduler::new(fast_config(), registry);
        scheduler.start().unwrap();
        scheduler.schedule("slow", ["us-east-1"], Duration::from_secs(60)).unwrap();
        assert!(wait_for(|| scheduler.status().active_jobs == 1, Duration::from_secs(2)).await);

        let started = Instant::now();
        scheduler.stop(Duration::from_secs(2)).await.unwrap();

        assert!(started.elapsed() < Duration::from_secs(1));
        let info = scheduler.status();
        assert_eq!(info.status, SchedulerStatus::Stopped);
        assert_eq!(info.active_jobs, 0);
        assert_eq!(info.failed_jobs, 1);
        assert_eq!(scheduler.health().unwrap_err().code, "SCHEDULER_STOPPED");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_stop_reports_timeout_for_stuck_collector() {
        let registry = registry_with("stuck", 0, |_req| async {
            // Blocks the worker thread and ignores cancellation
            std::thread::sleep(Duration::from_millis(600));
            Ok(Vec::new())
        });
        let scheduler = Scheduler::new(fast_config(), registry);
        scheduler.start().unwrap();
        scheduler.schedule("stuck", ["us-east-1"], Duration::from_secs(60)).unwrap();
        assert!(wait_for(|| scheduler.status().active_jobs == 1, Duration::from_secs(2)).await);

        let err = scheduler.stop(Duration::from_millis(50)).await.unwrap_err();

        assert_eq!(err.category, ErrorCategory::Timeout);
        assert_eq!(scheduler.status().status, SchedulerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_job_snapshots_are_never_torn() {
        let scheduler = Scheduler::new(fast_config(), ok_registry("ec2"));
        scheduler.start().unwrap();
        scheduler
            .schedule("ec2", ["a", "b", "c", "d"], Duration::from_millis(30))
            .unwrap();

        let reader = scheduler.clone();
        let checker = tokio::spawn(async move {
            let started = Instant::now();
            let mut observed = 0;
            while started.elapsed() < Duration::from_millis(600) {
                for job in reader.list_jobs() {
                    assert_eq!(job.last_run.is_some(), job.last_result.is_some());
                    observed += 1;
                }
                tokio::task::yield_now().await;
            }
            observed
        });

        let observed = checker.await.unwrap();
        scheduler.stop(Duration::from_secs(2)).await.unwrap();

        assert!(observed > 0);
        assert!(scheduler.status().completed_jobs >= 4);
    }

    #[tokio::test]
    async fn test_health_detects_stuck_loop() {
        let config = SchedulerConfig {
            tick_interval: Duration::from_secs(1),
            ..fast_config()
        };
        let scheduler = Scheduler::new(config, ok_registry("ec2"));
        scheduler.start().unwrap();
        assert!(scheduler.health().is_ok());

        // No tick yet, and the start is far enough in the past to count as stuck
        scheduler.inner.state.lock().unwrap().start_time = Some(Utc::now() - chrono::Duration::seconds(5));
        let err = scheduler.health().unwrap_err();
        assert_eq!(err.code, "SCHEDULER_NOT_TICKING");

        scheduler.stop(Duration::from_secs(2)).await.unwrap();
    }
}
