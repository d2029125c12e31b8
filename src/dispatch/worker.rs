//! Queue consumer
//!
//! Turns queued tasks into coordinator and executor calls. Each task key is
//! processed by at most one worker at a time and acknowledged only after
//! processing finished.

use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::planner::{plan, resolve_shard_count};
use super::queue::{JobQueue, QueueError, QueueTask};
use super::retry::RetryPolicy;
use crate::http::{ClientError, Coordinator, ExecutorAnswer, ExecutorEndpoint};
use crate::models::{ExecuteRequest, ResultsReport, ShardJob, ShardStatus};

#[derive(Error, Debug)]
pub enum DispatchError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error("Coordinator call failed: {0}")]
    Coordinator(#[from] ClientError),
}

/// What processing a task amounted to
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TaskOutcome {
    /// Run marked dispatched and split into this many shard tasks
    Planned { shards: u32 },
    /// Run already terminal when planning; nothing dispatched
    RunClosed,
    /// No executor configured
    Skipped,
    /// The executor ran the shard and reported itself
    Executed(Option<ShardStatus>),
    /// The shard is already running on the executor
    AlreadyRunning,
    /// The dispatcher reported this outcome on the executor's behalf
    Reported(ShardStatus),
    /// Processing failed; the task was dropped
    Dropped,
}

#[derive(Clone)]
pub struct Dispatcher {
    queue: Arc<JobQueue>,
    coordinator: Arc<dyn Coordinator>,
    executor: Option<Arc<dyn ExecutorEndpoint>>,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    in_flight: Arc<Mutex<HashSet<String>>>,
    poll_interval: Duration,
}

impl Dispatcher {
    pub fn new(
        queue: Arc<JobQueue>,
        coordinator: Arc<dyn Coordinator>,
        executor: Option<Arc<dyn ExecutorEndpoint>>,
        max_concurrent: usize,
    ) -> Self {
        Self {
            queue,
            coordinator,
            executor,
            retry: RetryPolicy::default(),
            semaphore: Arc::new(Semaphore::new(max_concurrent.max(1))),
            in_flight: Arc::new(Mutex::new(HashSet::new())),
            poll_interval: Duration::from_secs(5),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Process one task without acknowledging it
    pub async fn process(&self, task: &QueueTask) -> Result<TaskOutcome, DispatchError> {
        match task {
            QueueTask::PlanRun { run_id } => self.plan_run(*run_id).await,
            QueueTask::ExecuteShard { job } => Ok(self.execute_shard(job).await),
        }
    }

    async fn plan_run(&self, run_id: u64) -> Result<TaskOutcome, DispatchError> {
        match self.try_plan_run(run_id).await {
            Err(DispatchError::Coordinator(e)) if !e.is_transient() => {
                // coordinator reachable: close the run rather than leave it queued
                error!("Planning run {} failed: {}", run_id, e);
                let job = ShardJob {
                    run_id,
                    shard_index: 0,
                    shard_total: 1,
                };
                Ok(self
                    .report(&job, ShardStatus::InfraFailed, format!("dispatch planning failed: {e}"))
                    .await)
            }
            other => other,
        }
    }

    async fn try_plan_run(&self, run_id: u64) -> Result<TaskOutcome, DispatchError> {
        let coordinator = &self.coordinator;
        let context = self
            .retry
            .retry("job context fetch", || coordinator.job_context(run_id))
            .await?;

        let shard_total = resolve_shard_count(context.shard_count);
        let run = self
            .retry
            .retry("dispatch acknowledgement", || {
                coordinator.mark_dispatched(run_id, shard_total)
            })
            .await?;

        if run.status.is_terminal() {
            info!("Run {} is already {}, not dispatching", run_id, run.status);
            return Ok(TaskOutcome::RunClosed);
        }

        let shards = run.run_metadata.shard_total.unwrap_or(shard_total);
        for job in plan(run_id, shards) {
            self.queue.enqueue(QueueTask::ExecuteShard { job })?;
        }

        info!("Run {} dispatched as {} shard(s)", run_id, shards);
        Ok(TaskOutcome::Planned { shards })
    }

    async fn execute_shard(&self, job: &ShardJob) -> TaskOutcome {
        let Some(executor) = &self.executor else {
            info!("No executor endpoint configured, skipping {}", job);
            return TaskOutcome::Skipped;
        };

        let coordinator = &self.coordinator;
        let context = match self
            .retry
            .retry("job context fetch", || coordinator.job_context(job.run_id))
            .await
        {
            Ok(context) => context,
            Err(e) => {
                return self
                    .report(job, ShardStatus::InfraFailed, format!("job context unavailable: {e}"))
                    .await;
            }
        };

        let request = ExecuteRequest { job: *job, context };
        let answer = self
            .retry
            .retry("executor call", || executor.execute(&request))
            .await;

        match answer {
            Ok(ExecutorAnswer::Done(response)) => {
                debug!("Executor finished {} with {:?}", job, response.outcome);
                TaskOutcome::Executed(response.outcome)
            }
            Ok(ExecutorAnswer::AlreadyRunning) => {
                info!("{} is already running on the executor", job);
                TaskOutcome::AlreadyRunning
            }
            Ok(ExecutorAnswer::Rejected(detail)) => {
                self.report(job, ShardStatus::InfraFailed, format!("executor rejected job: {detail}"))
                    .await
            }
            Ok(ExecutorAnswer::InfraFailed(detail)) => {
                self.report(job, ShardStatus::InfraFailed, format!("executor infra failure: {detail}"))
                    .await
            }
            Ok(ExecutorAnswer::TimedOut) => {
                self.report(job, ShardStatus::TimedOut, "executor timed out".to_string())
                    .await
            }
            Err(e) => {
                error!("Dispatch of {} failed: {}", job, e);
                self.report(
                    job,
                    ShardStatus::InfraFailed,
                    format!("dispatch failed after {} attempts: {e}", self.retry.max_attempts),
                )
                .await
            }
        }
    }

    /// Report an outcome on the executor's behalf; failures are logged
    async fn report(&self, job: &ShardJob, status: ShardStatus, detail: String) -> TaskOutcome {
        let report = ResultsReport::status(job, status).with_detail(detail);
        let coordinator = &self.coordinator;
        if let Err(e) = self
            .retry
            .retry("result report", || coordinator.report(job.run_id, &report))
            .await
        {
            warn!("Could not report {} for {}: {}", status, job, e);
        }
        TaskOutcome::Reported(status)
    }

    /// Start every pending task that is not already being processed
    pub async fn spawn_pending(&self) -> Result<Vec<JoinHandle<TaskOutcome>>, DispatchError> {
        let tasks = self.queue.pending()?;
        Ok(self.spawn_tasks(tasks).await)
    }

    /// Claim a task key; fails when it is in flight or was acknowledged
    /// since the queue was listed
    async fn claim(&self, key: &str) -> bool {
        let mut in_flight = self.in_flight.lock().await;
        if !in_flight.insert(key.to_string()) {
            return false;
        }
        if !self.queue.contains(key) {
            in_flight.remove(key);
            debug!("Task {} was acknowledged meanwhile", key);
            return false;
        }
        true
    }

    async fn spawn_tasks(&self, tasks: Vec<QueueTask>) -> Vec<JoinHandle<TaskOutcome>> {
        let mut handles = Vec::new();
        for task in tasks {
            let key = task.key();
            if !self.claim(&key).await {
                continue;
            }

            let this = self.clone();
            handles.push(tokio::spawn(async move {
                let outcome = match this.semaphore.clone().acquire_owned().await {
                    Ok(_permit) => this.process(&task).await,
                    Err(_) => Ok(TaskOutcome::Dropped),
                };

                let outcome = match outcome {
                    Ok(outcome) => outcome,
                    Err(e) => {
                        error!("Task {} failed and is dropped: {}", key, e);
                        TaskOutcome::Dropped
                    }
                };
                if let Err(e) = this.queue.ack(&key) {
                    warn!("Failed to acknowledge task {}: {}", key, e);
                }
                this.in_flight.lock().await.remove(&key);
                outcome
            }));
        }
        handles
    }

    /// Process everything currently queued and wait for it
    pub async fn drain_once(&self) -> Result<Vec<TaskOutcome>, DispatchError> {
        let handles = self.spawn_pending().await?;
        Ok(join_all(handles)
            .await
            .into_iter()
            .filter_map(|r| r.ok())
            .collect())
    }

    /// Consume the queue until shutdown is signalled
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("Dispatcher worker started");
        loop {
            if let Err(e) = self.spawn_pending().await {
                error!("Failed to read queue: {}", e);
            }
            tokio::select! {
                _ = self.queue.wait(self.poll_interval) => {}
                _ = shutdown.changed() => break,
            }
        }
        info!("Dispatcher worker stopped");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::models::{ExecuteResponse, JobContext, Layer, RepoAuthMethod, Run, RunId, NewRun};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex as StdMutex;
    use tempfile::TempDir;

    pub(crate) fn context(run_id: RunId, shard_count: Option<u32>) -> JobContext {
        JobContext {
            run_id,
            project_id: 1,
            repo_url: "https://git.example.com/shop.git".to_string(),
            repo_auth_method: RepoAuthMethod::Token,
            branch: "main".to_string(),
            commit: "HEAD".to_string(),
            suite_id: 1,
            suite_name: "smoke".to_string(),
            layer: Layer::E2e,
            tags: vec![],
            retries: 0,
            shard_count,
            timeout_secs: None,
            environment_id: 1,
            environment_name: "staging".to_string(),
        }
    }

    #[derive(Default)]
    struct FakeCoordinator {
        shard_count: Option<u32>,
        context_status: Option<u16>,
        reports: StdMutex<Vec<ResultsReport>>,
        dispatched: StdMutex<Vec<u32>>,
    }

    #[async_trait]
    impl Coordinator for FakeCoordinator {
        async fn job_context(&self, run_id: RunId) -> Result<JobContext, ClientError> {
            match self.context_status {
                Some(status) => Err(ClientError::Status {
                    status,
                    url: format!("http://coordinator/internal/runs/{run_id}/job-context"),
                    body: "no repository configured".to_string(),
                }),
                None => Ok(context(run_id, self.shard_count)),
            }
        }

        async fn mark_dispatched(&self, run_id: RunId, shard_total: u32) -> Result<Run, ClientError> {
            self.dispatched.lock().unwrap().push(shard_total);
            let mut run = Run::queued(run_id, NewRun::default(), None);
            crate::lifecycle::apply(
                &mut run,
                crate::lifecycle::RunUpdate::Dispatched { shard_total },
                chrono::Utc::now(),
            )
            .unwrap();
            Ok(run)
        }

        async fn report(&self, _run_id: RunId, report: &ResultsReport) -> Result<(), ClientError> {
            self.reports.lock().unwrap().push(report.clone());
            Ok(())
        }
    }

    struct FakeExecutor {
        calls: AtomicU32,
        answer: fn() -> Result<ExecutorAnswer, ClientError>,
    }

    #[async_trait]
    impl ExecutorEndpoint for FakeExecutor {
        async fn execute(&self, _request: &ExecuteRequest) -> Result<ExecutorAnswer, ClientError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            (self.answer)()
        }
    }

    fn dispatcher(
        dir: &TempDir,
        coordinator: Arc<FakeCoordinator>,
        executor: Option<Arc<FakeExecutor>>,
    ) -> Dispatcher {
        let queue = Arc::new(JobQueue::open(dir.path()).unwrap());
        Dispatcher::new(
            queue,
            coordinator,
            executor.map(|e| e as Arc<dyn ExecutorEndpoint>),
            4,
        )
        .with_retry(RetryPolicy::new(3, Duration::from_millis(1)))
    }

    fn job() -> ShardJob {
        ShardJob {
            run_id: 9,
            shard_index: 0,
            shard_total: 1,
        }
    }

    #[tokio::test]
    async fn test_plan_run_fans_out_shards() {
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(FakeCoordinator {
            shard_count: Some(3),
            ..Default::default()
        });
        let dispatcher = dispatcher(&dir, coordinator.clone(), None);
        dispatcher
            .queue()
            .enqueue(QueueTask::PlanRun { run_id: 9 })
            .unwrap();

        let outcomes = dispatcher.drain_once().await.unwrap();
        assert_eq!(outcomes, vec![TaskOutcome::Planned { shards: 3 }]);
        assert_eq!(*coordinator.dispatched.lock().unwrap(), vec![3]);

        let keys: Vec<String> = dispatcher
            .queue()
            .pending()
            .unwrap()
            .iter()
            .map(|t| t.key())
            .collect();
        assert_eq!(keys.len(), 3);
        assert!(keys.contains(&"run-9-shard-2".to_string()));
    }

    #[tokio::test]
    async fn test_no_executor_skips_without_report() {
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(FakeCoordinator::default());
        let dispatcher = dispatcher(&dir, coordinator.clone(), None);
        dispatcher
            .queue()
            .enqueue(QueueTask::ExecuteShard { job: job() })
            .unwrap();

        let outcomes = dispatcher.drain_once().await.unwrap();
        assert_eq!(outcomes, vec![TaskOutcome::Skipped]);
        assert!(coordinator.reports.lock().unwrap().is_empty());
        assert_eq!(dispatcher.queue().len().unwrap(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_exhaust_then_report_infra() {
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(FakeCoordinator::default());
        let executor = Arc::new(FakeExecutor {
            calls: AtomicU32::new(0),
            answer: || Err(ClientError::ConnectionRefused("executor".to_string())),
        });
        let dispatcher = dispatcher(&dir, coordinator.clone(), Some(executor.clone()));

        let outcome = dispatcher
            .process(&QueueTask::ExecuteShard { job: job() })
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Reported(ShardStatus::InfraFailed));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 3);

        let reports = coordinator.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].status, ShardStatus::InfraFailed);
        assert_eq!(reports[0].shard_index, Some(0));
    }

    #[tokio::test]
    async fn test_executor_timeout_reports_timed_out_once() {
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(FakeCoordinator::default());
        let executor = Arc::new(FakeExecutor {
            calls: AtomicU32::new(0),
            answer: || Ok(ExecutorAnswer::TimedOut),
        });
        let dispatcher = dispatcher(&dir, coordinator.clone(), Some(executor.clone()));

        let outcome = dispatcher
            .process(&QueueTask::ExecuteShard { job: job() })
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Reported(ShardStatus::TimedOut));
        assert_eq!(executor.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_conflict_counts_as_accepted() {
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(FakeCoordinator::default());
        let executor = Arc::new(FakeExecutor {
            calls: AtomicU32::new(0),
            answer: || Ok(ExecutorAnswer::AlreadyRunning),
        });
        let dispatcher = dispatcher(&dir, coordinator.clone(), Some(executor));

        let outcome = dispatcher
            .process(&QueueTask::ExecuteShard { job: job() })
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::AlreadyRunning);
        assert!(coordinator.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_success_leaves_reporting_to_executor() {
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(FakeCoordinator::default());
        let executor = Arc::new(FakeExecutor {
            calls: AtomicU32::new(0),
            answer: || {
                Ok(ExecutorAnswer::Done(ExecuteResponse {
                    status: "completed".to_string(),
                    run_id: 9,
                    shard_index: 0,
                    outcome: Some(ShardStatus::Failed),
                }))
            },
        });
        let dispatcher = dispatcher(&dir, coordinator.clone(), Some(executor));

        let outcome = dispatcher
            .process(&QueueTask::ExecuteShard { job: job() })
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Executed(Some(ShardStatus::Failed)));
        assert!(coordinator.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejected_planning_closes_run_as_infra_failed() {
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(FakeCoordinator {
            context_status: Some(422),
            ..Default::default()
        });
        let dispatcher = dispatcher(&dir, coordinator.clone(), None);

        let outcome = dispatcher
            .process(&QueueTask::PlanRun { run_id: 9 })
            .await
            .unwrap();
        assert_eq!(outcome, TaskOutcome::Reported(ShardStatus::InfraFailed));
        assert!(coordinator.dispatched.lock().unwrap().is_empty());

        let reports = coordinator.reports.lock().unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].shard_index, Some(0));
        assert_eq!(reports[0].shard_total, Some(1));
        assert!(reports[0]
            .detail
            .as_deref()
            .unwrap()
            .contains("no repository configured"));
    }

    #[tokio::test]
    async fn test_unavailable_coordinator_leaves_run_queued() {
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(FakeCoordinator {
            context_status: Some(503),
            ..Default::default()
        });
        let dispatcher = dispatcher(&dir, coordinator.clone(), None);

        let result = dispatcher.process(&QueueTask::PlanRun { run_id: 9 }).await;
        assert!(matches!(result, Err(DispatchError::Coordinator(_))));
        assert!(coordinator.reports.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_acknowledged_task_is_not_respawned() {
        let dir = TempDir::new().unwrap();
        let coordinator = Arc::new(FakeCoordinator::default());
        let executor = Arc::new(FakeExecutor {
            calls: AtomicU32::new(0),
            answer: || Ok(ExecutorAnswer::AlreadyRunning),
        });
        let dispatcher = dispatcher(&dir, coordinator, Some(executor.clone()));
        dispatcher
            .queue()
            .enqueue(QueueTask::ExecuteShard { job: job() })
            .unwrap();

        // listing raced with a worker that finished and acknowledged the task
        let listed = dispatcher.queue().pending().unwrap();
        dispatcher.queue().ack(&job().key()).unwrap();

        let handles = dispatcher.spawn_tasks(listed).await;
        assert!(handles.is_empty());
        assert_eq!(executor.calls.load(Ordering::SeqCst), 0);
        assert!(dispatcher.in_flight.lock().await.is_empty());
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let dispatcher = dispatcher(&dir, Arc::new(FakeCoordinator::default()), None);
        dispatcher
            .queue()
            .enqueue(QueueTask::ExecuteShard { job: job() })
            .unwrap();

        let key = job().key();
        assert!(dispatcher.claim(&key).await);
        assert!(!dispatcher.claim(&key).await);
    }
}
