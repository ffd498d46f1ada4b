//! Shared helpers: a frontier-recording backend and canned actions.
#![allow(dead_code)] // each test binary uses a different slice of this module

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use slipway::args::PipelineArgs;
use slipway::backend::{Backend, CommonOpts, ValidationError};
use slipway::errors::ExecutionError;
use slipway::pipeline::{
    action_fn, Action, ActionError, ActionOpts, Event, PipelineVisitor, Step, StepType,
    StepVisitor, Walker,
};
use slipway::state::State;
use slipway::syncutil::StepWaitGroup;
use slipway::Slipway;

/// A backend that records every frontier it is handed and optionally runs
/// the step actions in-process. Assertions happen in the test body after
/// `execute` returns, never inside spawned tasks.
pub struct Ensurer {
    pub seen: Arc<Mutex<Vec<Vec<String>>>>,
    run_actions: bool,
}

impl Ensurer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            run_actions: true,
        })
    }

    pub fn recording_only() -> Arc<Self> {
        Arc::new(Self {
            seen: Arc::new(Mutex::new(Vec::new())),
            run_actions: false,
        })
    }

    pub fn frontiers(&self) -> Vec<Vec<String>> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Backend for Ensurer {
    fn validate(&self, step: &Step) -> Result<(), ValidationError> {
        if step.image.is_empty() {
            return Err(ValidationError::NoImage);
        }
        Ok(())
    }

    async fn done(
        &self,
        ctx: CancellationToken,
        walker: Arc<dyn Walker>,
        _events: &[Event],
    ) -> Result<(), ExecutionError> {
        let seen = self.seen.clone();
        let run_actions = self.run_actions;
        let steps_walker = walker.clone();
        let visit: PipelineVisitor = Arc::new(move |ctx, pipelines| {
            let seen = seen.clone();
            let walker = steps_walker.clone();
            Box::pin(async move {
                for pipeline in pipelines {
                    let seen = seen.clone();
                    let step_visit: StepVisitor = Arc::new(move |ctx, steps| {
                        let seen = seen.clone();
                        Box::pin(async move {
                            seen.lock()
                                .unwrap()
                                .push(steps.iter().map(Step::display_name).collect());
                            if !run_actions {
                                return Ok(());
                            }
                            let mut group = StepWaitGroup::new();
                            for step in steps {
                                let Some(action) = step.action.clone() else {
                                    continue;
                                };
                                // Background steps run alongside the frontier
                                // but are never joined by it, matching the
                                // contract every step visitor implements.
                                if step.step_type == StepType::Background {
                                    let token = ctx.child_token();
                                    tokio::spawn(async move {
                                        let _ = action(token, ActionOpts::discard()).await;
                                    });
                                    continue;
                                }
                                let name = step.display_name();
                                let serial = step.serial;
                                group.add(move |token| {
                                    Box::pin(async move {
                                        action(token, ActionOpts::discard()).await.map_err(
                                            |source| ExecutionError::Step {
                                                name,
                                                serial,
                                                source,
                                            },
                                        )
                                    })
                                });
                            }
                            group.wait(ctx).await
                        })
                    });
                    walker
                        .walk_steps(ctx.clone(), pipeline.serial, step_visit)
                        .await?;
                }
                Ok(())
            })
        });
        walker.walk_pipelines(ctx, visit).await
    }
}

pub fn test_opts() -> CommonOpts {
    let args = PipelineArgs::try_parse_args(["pipeline"]).unwrap();
    CommonOpts {
        name: "test pipeline".to_string(),
        version: "0.0.0-test".to_string(),
        build_id: "abcd1234".to_string(),
        args,
        state: Arc::new(State::new([])),
    }
}

pub fn test_opts_with_step(step: i64) -> CommonOpts {
    let mut opts = test_opts();
    let step = step.to_string();
    opts.args = PipelineArgs::try_parse_args(["pipeline", "--step", step.as_str()]).unwrap();
    opts
}

pub fn test_client(opts: CommonOpts, backend: Arc<dyn Backend>) -> Slipway {
    Slipway::new_with_backend(opts, backend)
}

/// Assert the step-graph edges of one pipeline, independent of map order.
pub fn ensure_graph_edges(client: &Slipway, pipeline: i64, expected: &[(i64, &[i64])]) {
    let pipeline = client.collection.pipeline(pipeline).unwrap();
    let mut actual: Vec<(i64, Vec<i64>)> = pipeline
        .graph
        .edges()
        .iter()
        .map(|(from, to)| (*from, to.clone()))
        .collect();
    actual.sort_by_key(|(from, _)| *from);
    let expected: Vec<(i64, Vec<i64>)> = expected
        .iter()
        .map(|(from, to)| (*from, to.to_vec()))
        .collect();
    assert_eq!(actual, expected, "unexpected step-graph edges");
}

/// An action that records "start:<name>" and "end:<name>" around a short
/// sleep, so tests can observe overlap within a frontier.
pub fn observed_action(log: Arc<Mutex<Vec<String>>>, name: &str, sleep: Duration) -> Action {
    let name = name.to_string();
    action_fn(move |_ctx, _opts| {
        let log = log.clone();
        let name = name.clone();
        async move {
            log.lock().unwrap().push(format!("start:{name}"));
            tokio::time::sleep(sleep).await;
            log.lock().unwrap().push(format!("end:{name}"));
            Ok(())
        }
    })
}

/// An action that fails after the given delay.
pub fn failing_action(delay: Duration, message: &str) -> Action {
    let message = message.to_string();
    action_fn(move |_ctx, _opts| {
        let message = message.clone();
        async move {
            tokio::time::sleep(delay).await;
            Err(ActionError::Failed(message))
        }
    })
}

/// An action that sleeps unless cancelled first, recording which way it went.
pub fn cancellable_action(
    log: Arc<Mutex<Vec<String>>>,
    name: &str,
    sleep: Duration,
) -> Action {
    let name = name.to_string();
    action_fn(move |ctx: CancellationToken, _opts| {
        let log = log.clone();
        let name = name.clone();
        async move {
            tokio::select! {
                () = tokio::time::sleep(sleep) => {
                    log.lock().unwrap().push(format!("finished:{name}"));
                    Ok(())
                }
                () = ctx.cancelled() => {
                    log.lock().unwrap().push(format!("cancelled:{name}"));
                    Err(ActionError::Cancelled)
                }
            }
        }
    })
}
