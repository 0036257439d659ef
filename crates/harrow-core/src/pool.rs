//! Bounded-concurrency task executor.
//!
//! Two termination policies:
//!
//! - [`Pool::run_all`] runs every task and reports each outcome. A task
//!   returning [`AppError::PoolStopped`] is recorded and no further tasks are
//!   started.
//! - [`Pool::run_until_success`] returns the first task that succeeds and
//!   abandons the rest; if all of them fail, the last error is returned.
//!
//! With one effective worker the tasks run in a plain loop on the caller's
//! task, in submission order. Otherwise they run on a [`JoinSet`] and results
//! arrive in completion order. Either way, nothing submitted to the pool is
//! still running once a run method returns.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;

/// Configuration for pool execution.
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of tasks in flight. 1 means sequential execution.
    pub num_workers: usize,

    /// Log a progress line every `log_step` completions. 0 disables it.
    pub log_step: usize,

    /// Treat every task error as fatal for the whole run.
    pub raise_on_error: bool,

    /// Force sequential execution regardless of `num_workers`.
    pub debug: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            num_workers: 3,
            log_step: 10,
            raise_on_error: false,
            debug: false,
        }
    }
}

impl PoolConfig {
    /// One worker, no progress logging.
    pub fn sequential() -> Self {
        Self {
            num_workers: 1,
            log_step: 0,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, num_workers: usize) -> Self {
        self.num_workers = num_workers;
        self
    }

    pub fn effective_workers(&self) -> usize {
        if self.debug { 1 } else { self.num_workers.max(1) }
    }

    /// Whether `err` aborts the run instead of being recorded.
    fn is_stopping(&self, err: &AppError) -> bool {
        err.is_stopping() || (self.raise_on_error && !err.is_pool_stopper())
    }
}

/// Outcome of one task in a run-all execution.
#[derive(Debug)]
pub struct TaskOutput<T> {
    /// Position of the task in submission order.
    pub index: usize,
    pub result: Result<T, AppError>,
}

impl<T> TaskOutput<T> {
    pub fn value(&self) -> Option<&T> {
        self.result.as_ref().ok()
    }

    pub fn into_value(self) -> Option<T> {
        self.result.ok()
    }
}

type Task<T> = Box<dyn FnOnce() -> BoxFuture<'static, Result<T, AppError>> + Send>;

/// Shared completion counter.
struct Progress {
    completed: Mutex<usize>,
    total: usize,
    log_step: usize,
}

impl Progress {
    fn new(total: usize, log_step: usize) -> Self {
        Self {
            completed: Mutex::new(0),
            total,
            log_step,
        }
    }

    fn tick(&self) {
        let completed = {
            let mut completed = self
                .completed
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            *completed += 1;
            *completed
        };
        if self.log_step != 0 && completed % self.log_step == 0 {
            tracing::info!("Processing #{}/{}", completed, self.total);
        }
    }
}

/// Collects tasks, then executes them under a [`PoolConfig`].
pub struct Pool<T> {
    config: PoolConfig,
    tasks: Vec<Task<T>>,
    cancel: CancellationToken,
}

impl<T: Send + 'static> Pool<T> {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            config,
            tasks: Vec::new(),
            cancel: CancellationToken::new(),
        }
    }

    /// Cancelling `token` aborts a running execution with [`AppError::Interrupted`].
    pub fn with_cancel_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Queues a task. Tasks may run more than once across retries of the
    /// caller, so they should be idempotent; the pool itself never dedupes.
    pub fn submit<F, Fut>(&mut self, task: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T, AppError>> + Send + 'static,
    {
        self.tasks.push(Box::new(move || task().boxed()));
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Runs every task and returns one [`TaskOutput`] per task that ran.
    ///
    /// Non-stopping errors are logged and recorded; a stopping error aborts
    /// the run and is returned.
    pub async fn run_all(self) -> Result<Vec<TaskOutput<T>>, AppError> {
        let progress = Arc::new(Progress::new(self.tasks.len(), self.config.log_step));
        if self.config.effective_workers() == 1 {
            self.run_all_sequential(progress).await
        } else {
            self.run_all_parallel(progress).await
        }
    }

    /// Runs tasks until the first success and returns its value.
    pub async fn run_until_success(self) -> Result<T, AppError> {
        let progress = Arc::new(Progress::new(self.tasks.len(), self.config.log_step));
        if self.config.effective_workers() == 1 {
            self.first_success_sequential(progress).await
        } else {
            self.first_success_parallel(progress).await
        }
    }

    async fn run_all_sequential(
        self,
        progress: Arc<Progress>,
    ) -> Result<Vec<TaskOutput<T>>, AppError> {
        let Pool {
            config,
            tasks,
            cancel,
        } = self;
        let mut out = Vec::with_capacity(tasks.len());

        for (index, task) in tasks.into_iter().enumerate() {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(AppError::Interrupted),
                result = guarded(index, task) => result,
            };
            progress.tick();

            match result {
                Ok(value) => out.push(TaskOutput {
                    index,
                    result: Ok(value),
                }),
                Err(err) if config.is_stopping(&err) => return Err(err),
                Err(err) => {
                    let stop = err.is_pool_stopper();
                    log_task_error(index, &err);
                    out.push(TaskOutput {
                        index,
                        result: Err(err),
                    });
                    if stop {
                        tracing::info!("Pool stopper received, skipping remaining tasks");
                        break;
                    }
                }
            }
        }

        Ok(out)
    }

    async fn run_all_parallel(
        self,
        progress: Arc<Progress>,
    ) -> Result<Vec<TaskOutput<T>>, AppError> {
        let Pool {
            config,
            tasks,
            cancel,
        } = self;
        let mut pending = tasks.into_iter().enumerate();
        let mut running = JoinSet::new();

        let outcome: Result<Vec<TaskOutput<T>>, AppError> = async {
            for _ in 0..config.effective_workers() {
                refill(&mut running, &mut pending, &progress);
            }

            let mut out = Vec::new();
            loop {
                let joined = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(AppError::Interrupted),
                    joined = running.join_next() => joined,
                };
                let Some(joined) = joined else { break };
                let Ok((index, result)) = joined else {
                    refill(&mut running, &mut pending, &progress);
                    continue;
                };

                match result {
                    Ok(value) => out.push(TaskOutput {
                        index,
                        result: Ok(value),
                    }),
                    Err(err) if config.is_stopping(&err) => return Err(err),
                    Err(err) => {
                        let stop = err.is_pool_stopper();
                        log_task_error(index, &err);
                        out.push(TaskOutput {
                            index,
                            result: Err(err),
                        });
                        if stop {
                            tracing::info!("Pool stopper received, cancelling remaining tasks");
                            break;
                        }
                    }
                }
                refill(&mut running, &mut pending, &progress);
            }
            Ok(out)
        }
        .await;

        shutdown(&mut running).await;
        outcome
    }

    async fn first_success_sequential(self, progress: Arc<Progress>) -> Result<T, AppError> {
        let Pool {
            config,
            tasks,
            cancel,
        } = self;
        let mut last_err = None;

        for (index, task) in tasks.into_iter().enumerate() {
            let result = tokio::select! {
                biased;
                () = cancel.cancelled() => Err(AppError::Interrupted),
                result = guarded(index, task) => result,
            };
            progress.tick();

            match result {
                Ok(value) => return Ok(value),
                Err(err) if config.is_stopping(&err) || err.is_pool_stopper() => return Err(err),
                Err(err) => {
                    tracing::debug!(index, error = %err, "Task failed, trying next");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(no_tasks))
    }

    async fn first_success_parallel(self, progress: Arc<Progress>) -> Result<T, AppError> {
        let Pool {
            config,
            tasks,
            cancel,
        } = self;
        let mut pending = tasks.into_iter().enumerate();
        let mut running = JoinSet::new();

        let outcome: Result<T, AppError> = async {
            for _ in 0..config.effective_workers() {
                refill(&mut running, &mut pending, &progress);
            }

            let mut last_err = None;
            loop {
                let joined = tokio::select! {
                    biased;
                    () = cancel.cancelled() => return Err(AppError::Interrupted),
                    joined = running.join_next() => joined,
                };
                let Some(joined) = joined else { break };
                if let Ok((index, result)) = joined {
                    match result {
                        Ok(value) => return Ok(value),
                        Err(err) if config.is_stopping(&err) || err.is_pool_stopper() => {
                            return Err(err);
                        }
                        Err(err) => {
                            tracing::debug!(index, error = %err, "Task failed, trying next");
                            last_err = Some(err);
                        }
                    }
                }
                refill(&mut running, &mut pending, &progress);
            }
            Err(last_err.unwrap_or_else(no_tasks))
        }
        .await;

        shutdown(&mut running).await;
        outcome
    }
}

/// Starts the next pending task, if any.
fn refill<T, I>(
    running: &mut JoinSet<(usize, Result<T, AppError>)>,
    pending: &mut I,
    progress: &Arc<Progress>,
) where
    T: Send + 'static,
    I: Iterator<Item = (usize, Task<T>)>,
{
    let Some((index, task)) = pending.next() else {
        return;
    };
    let progress = Arc::clone(progress);
    running.spawn(async move {
        let result = guarded(index, task).await;
        progress.tick();
        (index, result)
    });
}

/// Runs `task`, turning a panic into an error for that task alone.
async fn guarded<T: 'static>(index: usize, task: Task<T>) -> Result<T, AppError> {
    AssertUnwindSafe(task())
        .catch_unwind()
        .await
        .unwrap_or_else(|_| Err(AppError::Generic(format!("Task #{index} panicked"))))
}

/// Aborts whatever is still in flight and waits for it to wind down.
async fn shutdown<T: 'static>(running: &mut JoinSet<T>) {
    running.abort_all();
    while running.join_next().await.is_some() {}
}

fn log_task_error(index: usize, err: &AppError) {
    tracing::info!(index, "{} raised while processing item", err);
    tracing::debug!(index, error = ?err, "Task error detail");
}

fn no_tasks() -> AppError {
    AppError::Generic("No tasks were submitted to the pool".into())
}
