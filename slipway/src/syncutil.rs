//! Concurrency helpers that coordinate one frontier of work.
//!
//! [`StepWaitGroup`] runs its functions in parallel and joins them with
//! first-error semantics and a wall-clock timeout: the earliest failure wins,
//! siblings are cancelled through a child token, and their late errors are
//! dropped with a log line. [`PipelineWaitGroup`] applies the same contract
//! to whole pipeline walks. A group is consumed by `wait`; build a fresh one
//! per frontier.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::errors::ExecutionError;
use crate::pipeline::{Pipeline, StepVisitor, Walker};

/// Default wall-clock budget for one frontier of steps.
pub const DEFAULT_STEP_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Default wall-clock budget for a frontier of whole pipelines.
pub const DEFAULT_PIPELINE_TIMEOUT: Duration = Duration::from_secs(2 * 60 * 60);

/// How long cancelled tasks get to finish their cleanup before we stop
/// waiting for them.
const REAP_GRACE: Duration = Duration::from_secs(10);

type TaskFn = Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), ExecutionError>> + Send>;

/// Runs added functions in parallel; the first error cancels the rest.
pub struct StepWaitGroup {
    funcs: Vec<TaskFn>,
    timeout: Duration,
}

impl Default for StepWaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl StepWaitGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_STEP_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            funcs: Vec::new(),
            timeout,
        }
    }

    /// Queue a function. It starts running when `wait` is called.
    pub fn add<F>(&mut self, f: F)
    where
        F: FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), ExecutionError>>
            + Send
            + 'static,
    {
        self.funcs.push(Box::new(f));
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.funcs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.funcs.is_empty()
    }

    /// Start every queued function and wait until they all return, the first
    /// error arrives, the timeout elapses, or `ctx` is cancelled.
    pub async fn wait(self, ctx: CancellationToken) -> Result<(), ExecutionError> {
        if self.funcs.is_empty() {
            return Ok(());
        }

        let child = ctx.child_token();
        let (err_tx, err_rx) = flume::bounded::<ExecutionError>(self.funcs.len());
        let mut tasks = JoinSet::new();
        for f in self.funcs {
            let token = child.clone();
            let tx = err_tx.clone();
            tasks.spawn(async move {
                if let Err(err) = f(token).await {
                    let _ = tx.send_async(err).await;
                }
            });
        }
        // Once every task has finished, all senders are gone and the error
        // channel disconnects; that is the all-done signal.
        drop(err_tx);

        let outcome = tokio::select! {
            received = err_rx.recv_async() => match received {
                Ok(first) => {
                    child.cancel();
                    Err(ExecutionError::FirstError {
                        source: Box::new(first),
                    })
                }
                Err(_) => Ok(()),
            },
            () = tokio::time::sleep(self.timeout) => {
                child.cancel();
                Err(ExecutionError::Timeout)
            }
            () = ctx.cancelled() => {
                child.cancel();
                Err(ExecutionError::Cancelled)
            }
        };

        // Give cancelled tasks a moment to run their cleanup, then stop
        // waiting. Whatever they report now has already lost the race.
        let _ = tokio::time::timeout(REAP_GRACE, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;
        while let Ok(late) = err_rx.try_recv() {
            warn!(error = %late, "dropping error from cancelled sibling task");
        }

        outcome
    }
}

/// One pipeline queued for parallel execution.
struct PipelineEntry {
    pipeline: Pipeline,
    walker: Arc<dyn Walker>,
    visit: StepVisitor,
}

/// Runs pipeline walkers in parallel and joins them, with the same
/// first-error and timeout contract as [`StepWaitGroup`].
pub struct PipelineWaitGroup {
    entries: Vec<PipelineEntry>,
    timeout: Duration,
}

impl Default for PipelineWaitGroup {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineWaitGroup {
    #[must_use]
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_PIPELINE_TIMEOUT)
    }

    #[must_use]
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            entries: Vec::new(),
            timeout,
        }
    }

    pub fn add(&mut self, pipeline: Pipeline, walker: Arc<dyn Walker>, visit: StepVisitor) {
        self.entries.push(PipelineEntry {
            pipeline,
            walker,
            visit,
        });
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub async fn wait(self, ctx: CancellationToken) -> Result<(), ExecutionError> {
        let mut group = StepWaitGroup::with_timeout(self.timeout);
        for entry in self.entries {
            group.add(move |token| {
                Box::pin(async move {
                    entry
                        .walker
                        .walk_steps(token, entry.pipeline.serial, entry.visit)
                        .await
                })
            });
        }
        group.wait(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn wait_on_empty_group_is_ok() {
        let group = StepWaitGroup::new();
        assert!(group.wait(CancellationToken::new()).await.is_ok());
    }

    #[tokio::test]
    async fn all_functions_run_to_completion() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut group = StepWaitGroup::new();
        for _ in 0..4 {
            let counter = counter.clone();
            group.add(move |_token| {
                Box::pin(async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
            });
        }
        group.wait(CancellationToken::new()).await.unwrap();
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn first_error_wins_and_cancels_siblings() {
        let cancelled = Arc::new(AtomicUsize::new(0));
        let mut group = StepWaitGroup::new();
        group.add(|_token| {
            Box::pin(async {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Err(ExecutionError::Step {
                    name: "boom".to_string(),
                    serial: 1,
                    source: crate::pipeline::ActionError::Failed("boom".to_string()),
                })
            })
        });
        for _ in 0..2 {
            let cancelled = cancelled.clone();
            group.add(move |token| {
                Box::pin(async move {
                    tokio::select! {
                        () = tokio::time::sleep(Duration::from_secs(5)) => Ok(()),
                        () = token.cancelled() => {
                            cancelled.fetch_add(1, Ordering::SeqCst);
                            Err(ExecutionError::Cancelled)
                        }
                    }
                })
            });
        }

        let err = group.wait(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::FirstError { .. }));
        assert!(matches!(err.root(), ExecutionError::Step { serial: 1, .. }));
        assert_eq!(cancelled.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn zero_timeout_times_out_immediately() {
        let mut group = StepWaitGroup::with_timeout(Duration::ZERO);
        group.add(|token| {
            Box::pin(async move {
                token.cancelled().await;
                Ok(())
            })
        });
        let err = group.wait(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, ExecutionError::Timeout));
    }

    #[tokio::test]
    async fn cancelled_context_aborts_the_wait() {
        let ctx = CancellationToken::new();
        let mut group = StepWaitGroup::new();
        group.add(|token| {
            Box::pin(async move {
                token.cancelled().await;
                Ok(())
            })
        });
        let waiter = tokio::spawn(group.wait(ctx.clone()));
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, ExecutionError::Cancelled));
    }
}
