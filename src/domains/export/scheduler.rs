use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use tokio::sync::{watch, Mutex, OwnedMutexGuard, Semaphore};
use tokio::task::JoinSet;

use crate::errors::{DomainError, DomainResult};

/// Retry and observability metadata for one task.
#[derive(Debug, Clone)]
pub struct TaskSpec {
    pub label: String,
    pub tags: Vec<String>,
    /// Delay before each retry; its length bounds the retry count.
    pub backoff: Vec<Duration>,
    /// Absolute deadline after which the task is no longer retried.
    pub retry_deadline: DateTime<Utc>,
    /// Tasks sharing a lock key never run concurrently.
    pub lock_key: Option<String>,
}

/// One unit of work in an execution plan.
#[async_trait]
pub trait ExportTask: Send + Sync {
    fn spec(&self) -> TaskSpec;
    async fn run(&self) -> DomainResult<()>;
}

pub type FailureHook = Arc<dyn Fn(DomainError) -> BoxFuture<'static, ()> + Send + Sync>;

/// An unordered parallel batch followed by an ordered chain of steps.
///
/// The batch fully drains before the chain starts. The first failure —
/// after the failing task's own retries are exhausted — runs `on_failure`
/// and stops the remaining chain steps.
pub struct ExecutionPlan {
    pub batch: Vec<Arc<dyn ExportTask>>,
    pub chain: Vec<Arc<dyn ExportTask>>,
    pub on_failure: Option<FailureHook>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed(String),
}

/// Handle for observing a dispatched plan.
pub struct ScheduleHandle {
    receiver: watch::Receiver<ExecutionStatus>,
}

impl ScheduleHandle {
    pub fn status(&self) -> ExecutionStatus {
        self.receiver.borrow().clone()
    }

    pub async fn wait_for_completion(&mut self) -> DomainResult<()> {
        loop {
            match self.receiver.borrow().clone() {
                ExecutionStatus::Completed => return Ok(()),
                ExecutionStatus::Failed(message) => return Err(DomainError::Internal(message)),
                ExecutionStatus::Running => {}
            }
            self.receiver
                .changed()
                .await
                .map_err(|_| DomainError::Internal("scheduler dropped".to_string()))?;
        }
    }
}

/// The scheduling substrate seam. `dispatch` returns immediately; the plan
/// executes asynchronously.
pub trait JobScheduler: Send + Sync {
    fn dispatch(&self, plan: ExecutionPlan) -> ScheduleHandle;
}

/// Per-key async locks backing the mutual-exclusion guard.
#[derive(Default)]
pub struct LockRegistry {
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LockRegistry {
    pub async fn acquire(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// In-process scheduler built on the tokio runtime: a semaphore bounds the
/// parallel batch, the chain runs strictly in order afterwards.
pub struct TokioScheduler {
    max_concurrent: usize,
    locks: Arc<LockRegistry>,
}

impl TokioScheduler {
    pub fn new(max_concurrent: usize) -> Self {
        Self {
            max_concurrent: max_concurrent.max(1),
            locks: Arc::new(LockRegistry::default()),
        }
    }
}

impl JobScheduler for TokioScheduler {
    fn dispatch(&self, plan: ExecutionPlan) -> ScheduleHandle {
        let (tx, rx) = watch::channel(ExecutionStatus::Running);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let locks = self.locks.clone();

        tokio::spawn(async move {
            let ExecutionPlan {
                batch,
                chain,
                on_failure,
            } = plan;

            let fail = |error: DomainError| {
                let on_failure = on_failure.clone();
                let tx = tx.clone();
                async move {
                    if let Some(hook) = on_failure {
                        hook(error.clone()).await;
                    }
                    let _ = tx.send(ExecutionStatus::Failed(error.to_string()));
                }
            };

            // Drain the whole batch before acting on a failure; unaffected
            // tasks own disjoint shards and may still complete.
            let mut join_set = JoinSet::new();
            for task in batch {
                let semaphore = semaphore.clone();
                let locks = locks.clone();
                join_set.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .map_err(|_| DomainError::Internal("scheduler shut down".to_string()))?;
                    run_with_policy(task.as_ref(), &locks).await
                });
            }

            let mut batch_error: Option<DomainError> = None;
            while let Some(joined) = join_set.join_next().await {
                let result = joined
                    .unwrap_or_else(|e| Err(DomainError::Internal(format!("task panicked: {}", e))));
                if let Err(error) = result {
                    batch_error.get_or_insert(error);
                }
            }
            if let Some(error) = batch_error {
                fail(error).await;
                return;
            }

            for task in chain {
                if let Err(error) = run_with_policy(task.as_ref(), &locks).await {
                    fail(error).await;
                    return;
                }
            }

            let _ = tx.send(ExecutionStatus::Completed);
        });

        ScheduleHandle { receiver: rx }
    }
}

/// Run a task under its retry policy: bounded attempts with increasing
/// backoff, an absolute deadline, and the task's mutual-exclusion lock held
/// for the duration of each attempt.
async fn run_with_policy(task: &dyn ExportTask, locks: &LockRegistry) -> DomainResult<()> {
    let spec = task.spec();
    let mut attempt = 0usize;

    loop {
        let result = {
            let _guard = match &spec.lock_key {
                Some(key) => Some(locks.acquire(key).await),
                None => None,
            };
            task.run().await
        };

        let error = match result {
            Ok(()) => return Ok(()),
            Err(error) => error,
        };

        if attempt >= spec.backoff.len() || Utc::now() >= spec.retry_deadline {
            log::error!(
                "task {} failed permanently after {} attempt(s) [{}]: {}",
                spec.label,
                attempt + 1,
                spec.tags.join(","),
                error
            );
            return Err(error);
        }

        let delay = spec.backoff[attempt];
        attempt += 1;
        log::warn!(
            "task {} attempt {} failed, retrying in {:?} [{}]: {}",
            spec.label,
            attempt,
            delay,
            spec.tags.join(","),
            error
        );
        tokio::time::sleep(delay).await;
    }
}
