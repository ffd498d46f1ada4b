//! The cli backend: executes a collection locally, one container per step.
//!
//! A run owns an isolated network and a named volume. The pipeline program is
//! compiled into the volume once, then every frontier launches one container
//! per step attached to both; each container re-invokes the compiled binary
//! with `--step=<serial>`, which lands in [`CliBackend::done`]'s in-process
//! path and executes just that step's action. Sub-pipelines are dispatched
//! fire-and-forget; background steps are started but never joined by the
//! frontier barrier. Teardown of the network and volume happens on every
//! exit path and its failures never mask the primary error.

pub mod docker;

pub(crate) mod compile;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use self::compile::compile_pipeline;
use self::docker::{
    CreateContainerOpts, DockerClient, Mount, Network, RunContainerOpts, Volume,
};
use crate::backend::{Backend, CommonOpts, ValidationError};
use crate::errors::ExecutionError;
use crate::pipeline::{
    ActionError, ActionOpts, Event, Pipeline, PipelineVisitor, Step, StepType, StepVisitor, Walker,
};
use crate::state::{Argument, ArgumentType};
use crate::stringutil;
use crate::syncutil::{PipelineWaitGroup, StepWaitGroup};
use crate::wrappers::{self, log_line_writer};

/// Where the run's named volume is mounted in every container.
pub const VOLUME_PATH: &str = "/opt/slipway";
/// Where the author's source tree is mounted.
pub const SOURCE_PATH: &str = "/var/slipway";
/// The compiled pipeline binary inside the volume.
pub const PIPELINE_BINARY: &str = "/opt/slipway/pipeline";

/// How long background services get to stop once the spine has finished.
const BACKGROUND_STOP_GRACE: Duration = Duration::from_secs(10);

pub struct CliBackend {
    opts: CommonOpts,
    docker: DockerClient,
}

impl CliBackend {
    #[must_use]
    pub fn new(opts: CommonOpts) -> Self {
        Self {
            opts,
            docker: DockerClient::new(),
        }
    }

    fn network_name(&self) -> String {
        format!(
            "slipway-{}-{}",
            stringutil::slugify(&self.opts.name),
            stringutil::random(8)
        )
    }

    /// The `--step` re-invocation path: the walker was trimmed to a single
    /// step, whose action runs in this process. This is what executes inside
    /// each per-step container.
    async fn run_in_process(
        &self,
        ctx: CancellationToken,
        walker: Arc<dyn Walker>,
    ) -> Result<(), ExecutionError> {
        let visit = pipelines_visitor(walker.clone(), local_step_visitor);
        walker.walk_pipelines(ctx, visit).await
    }

    async fn run_containers(
        &self,
        ctx: CancellationToken,
        walker: Arc<dyn Walker>,
    ) -> Result<(), ExecutionError> {
        let network = self.docker.create_network(&self.network_name()).await?;

        info!(network = %network.name, "compiling pipeline in docker volume...");
        let volume = match compile_pipeline(&self.docker, &ctx, &self.opts).await {
            Ok(volume) => volume,
            Err(err) => {
                self.teardown(Some(&network), None).await;
                return Err(err);
            }
        };
        info!(volume = %volume.name, "successfully compiled pipeline");

        let walk = WalkOpts {
            opts: self.opts.clone(),
            docker: self.docker.clone(),
            network: network.clone(),
            volume: volume.clone(),
            background: BackgroundTasks {
                token: ctx.child_token(),
                handles: Arc::new(Mutex::new(Vec::new())),
            },
        };

        info!("running steps in docker");
        let make_visitor = {
            let walk = walk.clone();
            move |pipeline: &Pipeline| container_step_visitor(&walk, pipeline)
        };
        let result = walker
            .walk_pipelines(ctx.clone(), pipelines_visitor(walker.clone(), make_visitor))
            .await;

        // Background services keep running until the spine is done; stop
        // them before the network goes away.
        walk.background.token.cancel();
        let handles: Vec<JoinHandle<()>> = std::mem::take(
            &mut *walk
                .background
                .handles
                .lock()
                .expect("background task list poisoned"),
        );
        for handle in handles {
            let _ = tokio::time::timeout(BACKGROUND_STOP_GRACE, handle).await;
        }

        self.teardown(Some(&network), Some(&volume)).await;
        result
    }

    async fn teardown(&self, network: Option<&Network>, volume: Option<&Volume>) {
        if let Some(network) = network {
            if let Err(err) = self.docker.remove_network(network).await {
                warn!(network = %network.name, error = %err, "failed to remove network");
            }
        }
        if let Some(volume) = volume {
            if let Err(err) = self.docker.remove_volume(volume).await {
                warn!(volume = %volume.name, error = %err, "failed to remove pipeline volume");
            }
        }
    }
}

#[async_trait]
impl Backend for CliBackend {
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
        if self.opts.args.step.is_some() {
            return self.run_in_process(ctx, walker).await;
        }
        self.run_containers(ctx, walker).await
    }
}

/// Everything a container step visitor needs, cheap to clone into tasks.
#[derive(Clone)]
struct WalkOpts {
    opts: CommonOpts,
    docker: DockerClient,
    network: Network,
    volume: Volume,
    background: BackgroundTasks,
}

/// Detached background containers for one run: cancelled and reaped after
/// the spine finishes.
#[derive(Clone)]
struct BackgroundTasks {
    token: CancellationToken,
    handles: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

/// Pipeline-frontier dispatch shared by the container and in-process paths:
/// sub-pipelines go fire-and-forget, everything else joins a
/// [`PipelineWaitGroup`].
fn pipelines_visitor<F>(walker: Arc<dyn Walker>, make_step_visitor: F) -> PipelineVisitor
where
    F: Fn(&Pipeline) -> StepVisitor + Send + Sync + 'static,
{
    let make = Arc::new(make_step_visitor);
    Arc::new(move |ctx, pipelines| {
        let walker = walker.clone();
        let make = make.clone();
        Box::pin(async move {
            let mut group = PipelineWaitGroup::new();
            for pipeline in pipelines {
                let visit = make(&pipeline);
                if pipeline.pipeline_type == StepType::SubPipeline {
                    debug!(pipeline = %pipeline.name, "found sub-pipeline, dispatching detached");
                    let walker = walker.clone();
                    let token = ctx.clone();
                    let name = pipeline.name.clone();
                    let serial = pipeline.serial;
                    tokio::spawn(async move {
                        match walker.walk_steps(token, serial, visit).await {
                            Ok(()) => {
                                debug!(pipeline = %name, "sub-pipeline completed without error");
                            }
                            Err(err) => {
                                error!(pipeline = %name, error = %err, "sub-pipeline failed");
                            }
                        }
                    });
                    continue;
                }
                group.add(pipeline, walker.clone(), visit);
            }
            group.wait(ctx).await
        })
    })
}

/// Step visitor for the in-process path: runs actions directly, through the
/// standard logging and tracing middleware.
fn local_step_visitor(pipeline: &Pipeline) -> StepVisitor {
    let base: StepVisitor = Arc::new(move |ctx, steps| {
        Box::pin(async move {
            let mut group = StepWaitGroup::new();
            for step in steps {
                let Some(action) = step.action.clone() else {
                    debug!(step = %step.display_name(), "step has no action; nothing to run in-process");
                    continue;
                };
                let name = step.display_name();
                let serial = step.serial;
                let background = step.step_type == StepType::Background;
                let task = move |token: CancellationToken| -> BoxFuture<'static, Result<(), ExecutionError>> {
                    Box::pin(async move {
                        action(token, ActionOpts::stdio())
                            .await
                            .map_err(|source| ExecutionError::Step { name, serial, source })
                    })
                };
                if background {
                    let token = ctx.child_token();
                    tokio::spawn(async move {
                        if let Err(err) = task(token).await {
                            error!(error = %err, "background step failed");
                        }
                    });
                } else {
                    group.add(task);
                }
            }
            group.wait(ctx).await
        })
    });
    wrappers::standard(&pipeline.name, base)
}

/// Step visitor for the container path: one container per step in the
/// frontier, joined by a [`StepWaitGroup`]; background steps are started and
/// tracked but never joined here.
fn container_step_visitor(walk: &WalkOpts, pipeline: &Pipeline) -> StepVisitor {
    let walk = walk.clone();
    let pipeline_name = pipeline.name.clone();
    Arc::new(move |ctx, steps| {
        let walk = walk.clone();
        let pipeline_name = pipeline_name.clone();
        Box::pin(async move {
            let mut group = StepWaitGroup::new();
            for step in steps {
                let create = step_container_opts(&walk, &step)?;
                info!(
                    step = %step.display_name(),
                    image = %step.image,
                    "creating container for step"
                );
                let docker = walk.docker.clone();
                let pipeline = pipeline_name.clone();
                let name = step.display_name();
                let serial = step.serial;
                let background = step.step_type == StepType::Background;
                let task = move |token: CancellationToken| -> BoxFuture<'static, Result<(), ExecutionError>> {
                    Box::pin(async move {
                        let mut container = docker.create_container(create).await?;
                        debug!(container = %container.opts.name, "running container...");
                        let sinks = RunContainerOpts {
                            stdout: log_line_writer(&pipeline, &name, serial, "stdout"),
                            stderr: log_line_writer(&pipeline, &name, serial, "stderr"),
                        };
                        let code = docker.run_container(&token, &mut container, sinks).await?;
                        if code != 0 {
                            return Err(ExecutionError::Step {
                                name,
                                serial,
                                source: ActionError::ExitCode { code },
                            });
                        }
                        Ok(())
                    })
                };
                if background {
                    let token = walk.background.token.clone();
                    let handle = tokio::spawn(async move {
                        if let Err(err) = task(token).await {
                            error!(error = %err, "background step failed");
                        }
                    });
                    walk.background
                        .handles
                        .lock()
                        .expect("background task list poisoned")
                        .push(handle);
                } else {
                    group.add(task);
                }
            }
            group.wait(ctx).await
        })
    })
}

/// Container options for one step: volume, network, resolved file-system
/// mounts, and the re-invocation command.
fn step_container_opts(walk: &WalkOpts, step: &Step) -> Result<CreateContainerOpts, ExecutionError> {
    let opts = &walk.opts;
    let mut mounts = vec![Mount {
        source: walk.volume.name.clone(),
        target: VOLUME_PATH.to_string(),
        readonly: true,
    }];
    let mut forwarded = Vec::new();
    for arg in &step.arguments {
        match arg.arg_type() {
            ArgumentType::Directory | ArgumentType::File => {
                let host = opts.state.get(*arg)?;
                mounts.push(Mount {
                    source: host,
                    target: mount_target(*arg),
                    readonly: false,
                });
            }
            _ => forwarded.push((arg.key(), opts.state.get(*arg)?)),
        }
    }

    // A step without an action runs its image's default entrypoint.
    let command = if step.action.is_some() {
        let mut command = vec![
            PIPELINE_BINARY.to_string(),
            format!("--step={}", step.serial),
            format!("--build-id={}", opts.build_id),
            format!("--log-level={}", opts.args.log_level),
        ];
        for (key, value) in forwarded {
            command.push("--arg".to_string());
            command.push(format!("{key}={value}"));
        }
        command.push(opts.args.path.clone());
        command
    } else {
        Vec::new()
    };

    Ok(CreateContainerOpts {
        name: format!("slipway-{}-{}", opts.build_id, step.serial),
        image: step.image.clone(),
        command,
        env: vec![
            ("SLIPWAY_BUILD_ID".to_string(), opts.build_id.clone()),
            ("SLIPWAY_PIPELINE".to_string(), opts.args.path.clone()),
        ],
        mounts,
        workdir: Some(SOURCE_PATH.to_string()),
        network: Some(walk.network.name.clone()),
        labels: vec![("slipway.build-id".to_string(), opts.build_id.clone())],
    })
}

fn mount_target(arg: Argument) -> String {
    match arg {
        Argument::SourceFs => SOURCE_PATH.to_string(),
        Argument::DockerSocketFs => "/var/run/docker.sock".to_string(),
        other => format!("/var/slipway-args/{}", other.key()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args::PipelineArgs;
    use crate::state::State;

    fn walk_opts(overrides: Vec<(String, String)>) -> WalkOpts {
        let args = PipelineArgs::try_parse_args(["pipeline", "ci"]).unwrap();
        WalkOpts {
            opts: CommonOpts {
                name: "test pipeline".to_string(),
                version: "0.0.0-test".to_string(),
                build_id: "abcd1234".to_string(),
                args,
                state: Arc::new(State::new(overrides)),
            },
            docker: DockerClient::new(),
            network: Network {
                name: "slipway-test-net".to_string(),
            },
            volume: Volume {
                name: "slipway-abcd1234".to_string(),
            },
            background: BackgroundTasks {
                token: CancellationToken::new(),
                handles: Arc::new(Mutex::new(Vec::new())),
            },
        }
    }

    fn step(serial: i64) -> Step {
        let mut step = Step::no_op("build").with_image("rust:1.79");
        step.serial = serial;
        step
    }

    #[test]
    fn step_container_reinvokes_the_pipeline_binary() {
        let walk = walk_opts(vec![]);
        let create = step_container_opts(&walk, &step(4)).unwrap();
        assert_eq!(create.image, "rust:1.79");
        assert_eq!(create.network.as_deref(), Some("slipway-test-net"));
        assert_eq!(create.workdir.as_deref(), Some(SOURCE_PATH));
        assert_eq!(
            create.command,
            vec![
                "/opt/slipway/pipeline",
                "--step=4",
                "--build-id=abcd1234",
                "--log-level=info",
                "ci",
            ]
        );
        assert_eq!(create.mounts[0].source, "slipway-abcd1234");
        assert_eq!(create.mounts[0].target, VOLUME_PATH);
        assert!(create.mounts[0].readonly);
    }

    #[test]
    fn actionless_step_keeps_the_default_entrypoint() {
        let walk = walk_opts(vec![]);
        let mut svc = Step::named("db").with_image("postgres:16");
        svc.serial = 7;
        let create = step_container_opts(&walk, &svc).unwrap();
        assert!(create.command.is_empty());
    }

    #[test]
    fn filesystem_arguments_become_mounts() {
        let walk = walk_opts(vec![("source".to_string(), "/home/me/project".to_string())]);
        let step = step(2).with_arguments([Argument::SourceFs, Argument::DockerSocketFs]);
        let create = step_container_opts(&walk, &step).unwrap();
        let targets: Vec<&str> = create.mounts.iter().map(|m| m.target.as_str()).collect();
        assert_eq!(
            targets,
            vec![VOLUME_PATH, SOURCE_PATH, "/var/run/docker.sock"]
        );
        assert_eq!(create.mounts[1].source, "/home/me/project");
    }

    #[test]
    fn string_arguments_are_forwarded_on_the_command_line() {
        let walk = walk_opts(vec![("branch".to_string(), "main".to_string())]);
        let step = step(3).with_arguments([Argument::Branch]);
        let create = step_container_opts(&walk, &step).unwrap();
        let joined = create.command.join(" ");
        assert!(joined.contains("--arg branch=main"));
    }

    #[test]
    fn network_names_carry_the_slug_and_a_token() {
        let walk = walk_opts(vec![]);
        let backend = CliBackend::new(walk.opts);
        let name = backend.network_name();
        assert!(name.starts_with("slipway-test-pipeline-"));
        assert_eq!(name.len(), "slipway-test-pipeline-".len() + 8);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn background_steps_never_join_the_frontier_barrier() {
        use crate::pipeline::{action_fn, Collection, CollectionWalker, Pipeline};

        let log = Arc::new(Mutex::new(Vec::new()));
        let record = |name: &'static str, sleep: Duration| {
            let log = log.clone();
            action_fn(move |_token, _opts| {
                let log = log.clone();
                async move {
                    log.lock().unwrap().push(format!("start:{name}"));
                    tokio::time::sleep(sleep).await;
                    log.lock().unwrap().push(format!("end:{name}"));
                    Ok(())
                }
            })
        };

        let mut collection =
            Collection::with_default_pipeline(Pipeline::new(1, "local")).unwrap();
        let mut service = Step::named("service")
            .with_image("busybox")
            .with_action(record("service", Duration::from_millis(400)));
        service.serial = 2;
        service.step_type = StepType::Background;
        collection.append(1, vec![service]).unwrap();
        let mut check = Step::named("check")
            .with_image("busybox")
            .with_action(record("check", Duration::from_millis(10)));
        check.serial = 3;
        collection.append(1, vec![check]).unwrap();

        // The service and the check land in the same frontier; the walk must
        // come back once the check is done, while the service still sleeps.
        let walker: Arc<dyn Walker> = Arc::new(CollectionWalker::new(collection));
        let visit = pipelines_visitor(walker.clone(), local_step_visitor);
        walker
            .walk_pipelines(CancellationToken::new(), visit)
            .await
            .unwrap();

        let seen = log.lock().unwrap().clone();
        assert!(seen.contains(&"end:check".to_string()), "log: {seen:?}");
        assert!(
            !seen.contains(&"end:service".to_string()),
            "a background step blocked the frontier barrier: {seen:?}"
        );

        // Left to itself, the service still runs to completion.
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(log.lock().unwrap().contains(&"end:service".to_string()));
    }

    #[test]
    fn validate_rejects_missing_images() {
        let walk = walk_opts(vec![]);
        let backend = CliBackend::new(walk.opts);
        assert!(matches!(
            backend.validate(&Step::named("x")),
            Err(ValidationError::NoImage)
        ));
        assert!(backend.validate(&Step::named("x").with_image("busybox")).is_ok());
    }
}
