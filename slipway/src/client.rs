//! The authoring façade: the client every pipeline program drives.
//!
//! Authoring operations are synchronous and mutate the collection only; no
//! I/O happens until [`Slipway::done`]. Steps receive their serial and
//! default image here, hard validation failures are staged and short-circuit
//! the run before any resource is created, and warn-only failures are logged
//! and accepted.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::args::PipelineArgs;
use crate::backend::{self, Backend, CommonOpts, ValidationError};
use crate::errors::ExecutionError;
use crate::pipeline::{
    Collection, CollectionWalker, Event, Pipeline, Step, StepType, Walker,
};
use crate::state::{Argument, State};
use crate::stringutil;

/// Create a client from the process arguments. This is the entrypoint of a
/// pipeline program, so parsing errors exit the process (code 2) and logging
/// is initialised as a side effect.
pub fn new(name: &str) -> Slipway {
    let args = PipelineArgs::parse_args();
    init_tracing(&args.log_level);

    let build_id = args
        .build_id
        .clone()
        .unwrap_or_else(|| stringutil::random(8));
    let mut overrides = args.args.clone();
    if !overrides.iter().any(|(key, _)| key == Argument::BuildId.key()) {
        overrides.push((Argument::BuildId.key().to_string(), build_id.clone()));
    }

    let opts = CommonOpts {
        name: name.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        build_id,
        args,
        state: Arc::new(State::new(overrides)),
    };
    Slipway::new_from_opts(opts)
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

/// The client used in every pipeline program to declare the steps that make
/// up a pipeline.
pub struct Slipway {
    pub backend: Arc<dyn Backend>,
    pub collection: Collection,
    pub events: Vec<Event>,
    pub opts: CommonOpts,
    /// Serial counter. Keeps `--step=<n>` meaning the same step no matter
    /// which backend generated the document that mentions it.
    n: i64,
    staged_errors: Vec<ExecutionError>,
}

impl Slipway {
    /// Create a client with the backend selected by the parsed mode.
    pub fn new_from_opts(opts: CommonOpts) -> Self {
        let backend = backend::new_backend(opts.clone());
        Self::new_with_backend(opts, backend)
    }

    /// Create a client around a specific backend. Tests use this to observe
    /// traversal without a container runtime.
    pub fn new_with_backend(opts: CommonOpts, backend: Arc<dyn Backend>) -> Self {
        let mut n = 1;
        let serial = n;
        n += 1;
        let collection = Collection::with_default_pipeline(Pipeline::new(serial, &opts.name))
            .expect("fresh collection cannot reject its default pipeline");
        Self {
            backend,
            collection,
            events: Vec::new(),
            opts,
            n,
            staged_errors: Vec::new(),
        }
    }

    /// Declare steps that run sequentially: the second step does not start
    /// until the first has completed, even within a single call.
    pub fn run(&mut self, steps: impl IntoIterator<Item = Step>) {
        let steps = self.setup(steps.into_iter().collect());
        if !self.validate_steps(&steps) {
            return;
        }
        for step in steps {
            let pipeline = self.collection.default_pipeline();
            if let Err(err) = self.collection.append(pipeline, vec![step]) {
                self.stage(err.into());
                return;
            }
        }
    }

    /// Declare steps that run at the same time; the pipeline does not
    /// proceed until all of them have completed.
    pub fn parallel(&mut self, steps: impl IntoIterator<Item = Step>) {
        let steps = self.setup(steps.into_iter().collect());
        if !self.validate_steps(&steps) {
            return;
        }
        let pipeline = self.collection.default_pipeline();
        if let Err(err) = self.collection.append(pipeline, steps) {
            self.stage(err.into());
        }
    }

    /// Declare steps that run in the background: they start with the next
    /// frontier and never block successors. A step without an action runs
    /// its image with the default command, which is the usual way to start a
    /// service.
    pub fn background(&mut self, steps: impl IntoIterator<Item = Step>) {
        let mut steps = self.setup(steps.into_iter().collect());
        if !self.validate_steps(&steps) {
            return;
        }
        for step in &mut steps {
            step.step_type = StepType::Background;
        }
        let pipeline = self.collection.default_pipeline();
        if let Err(err) = self.collection.append(pipeline, steps) {
            self.stage(err.into());
        }
    }

    /// Declare a nested pipeline. It is dispatched fire-and-forget: failures
    /// are logged but do not fail the parent run.
    pub fn sub_pipeline(&mut self, name: &str, build: impl FnOnce(&mut SubPipelineScope)) {
        let serial = self.next_serial();
        let mut pipeline = Pipeline::new(serial, name);
        pipeline.pipeline_type = StepType::SubPipeline;

        let mut scope = SubPipelineScope {
            client: self,
            pipeline,
        };
        build(&mut scope);
        let pipeline = scope.pipeline;

        if let Err(err) = self.collection.append_pipeline(pipeline) {
            self.stage(err.into());
        }
    }

    /// Define when this pipeline is executed in a remote environment.
    pub fn when(&mut self, events: impl IntoIterator<Item = Event>) {
        let events: Vec<Event> = events.into_iter().collect();
        self.events = events.clone();
        let pipeline = self.collection.default_pipeline();
        if let Err(err) = self.collection.add_events(pipeline, events) {
            self.stage(err.into());
        }
    }

    /// Hand the frozen collection to the backend and report the outcome.
    /// Blocks until the run is finished; exits non-zero on failure.
    pub fn done(mut self) {
        let runtime = match tokio::runtime::Runtime::new() {
            Ok(runtime) => runtime,
            Err(err) => {
                error!(error = %err, "failed to start the async runtime");
                std::process::exit(1);
            }
        };

        let ctx = CancellationToken::new();
        info!(mode = ?self.opts.args.mode, "execution started");
        let result = runtime.block_on(async {
            let watch = ctx.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("received interrupt signal");
                    watch.cancel();
                }
            });
            self.execute(ctx).await
        });

        let completed_at = chrono::Utc::now().timestamp();
        match result {
            Ok(()) => {
                info!(status = "success", completed_at, "execution completed");
            }
            Err(err) if err.is_cancelled() => {
                error!(status = "cancelled", completed_at, error = %err, "execution completed");
                drop(runtime);
                std::process::exit(1);
            }
            Err(err) => {
                error!(status = "error", completed_at, error = %err, "execution completed");
                drop(runtime);
                std::process::exit(1);
            }
        }
    }

    /// Run the collection against the backend. [`Slipway::done`] wraps this;
    /// tests call it directly.
    pub async fn execute(&mut self, ctx: CancellationToken) -> Result<(), ExecutionError> {
        if !self.staged_errors.is_empty() {
            return Err(self.staged_errors.remove(0));
        }
        // Steps can reach the collection without going through the authoring
        // operations; sweep everything once more before any resource exists.
        for step in self.collection.steps() {
            match self.backend.validate(step) {
                Ok(()) => {}
                Err(err) if err.is_skip() => warn!("{}", format_error(step, &err)),
                Err(source) => {
                    return Err(ExecutionError::Validation {
                        name: step.display_name(),
                        serial: step.serial,
                        source,
                    });
                }
            }
        }

        let mut collection = self.collection.clone();
        if let Some(serial) = self.opts.args.step {
            let step = collection.by_serial(serial)?;
            info!(serial, step = %step.display_name(), "restricting execution to a single step");
            collection = collection.sub(&step)?;
        }

        let walker: Arc<dyn Walker> = Arc::new(CollectionWalker::new(collection));
        self.backend.done(ctx, walker, &self.events).await
    }

    fn next_serial(&mut self) -> i64 {
        let serial = self.n;
        self.n += 1;
        serial
    }

    /// Apply defaults and assign serials.
    fn setup(&mut self, mut steps: Vec<Step>) -> Vec<Step> {
        for step in &mut steps {
            if step.image.is_empty() {
                step.image = crate::default_image(&self.opts.version);
            }
            step.serial = self.next_serial();
        }
        steps
    }

    /// Validate a batch; hard failures are staged and fail `execute` before
    /// the run starts, warn-only failures are logged and accepted.
    fn validate_steps(&mut self, steps: &[Step]) -> bool {
        for step in steps {
            match self.backend.validate(step) {
                Ok(()) => {}
                Err(err) if err.is_skip() => warn!("{}", format_error(step, &err)),
                Err(source) => {
                    self.stage(ExecutionError::Validation {
                        name: step.display_name(),
                        serial: step.serial,
                        source,
                    });
                    return false;
                }
            }
        }
        true
    }

    fn stage(&mut self, err: ExecutionError) {
        error!(error = %err, "pipeline declaration failed");
        self.staged_errors.push(err);
    }
}

/// Authoring scope for a sub-pipeline, sharing the client's serial counter
/// so `--step` serials stay unique across the whole collection.
pub struct SubPipelineScope<'a> {
    client: &'a mut Slipway,
    pipeline: Pipeline,
}

impl SubPipelineScope<'_> {
    pub fn run(&mut self, steps: impl IntoIterator<Item = Step>) {
        let steps = self.client.setup(steps.into_iter().collect());
        if !self.client.validate_steps(&steps) {
            return;
        }
        for step in steps {
            if let Err(err) = self.pipeline.append(vec![step]) {
                self.client.stage(err.into());
                return;
            }
        }
    }

    pub fn parallel(&mut self, steps: impl IntoIterator<Item = Step>) {
        let steps = self.client.setup(steps.into_iter().collect());
        if !self.client.validate_steps(&steps) {
            return;
        }
        if let Err(err) = self.pipeline.append(steps) {
            self.client.stage(err.into());
        }
    }

    pub fn background(&mut self, steps: impl IntoIterator<Item = Step>) {
        let mut steps = self.client.setup(steps.into_iter().collect());
        if !self.client.validate_steps(&steps) {
            return;
        }
        for step in &mut steps {
            step.step_type = StepType::Background;
        }
        if let Err(err) = self.pipeline.append(steps) {
            self.client.stage(err.into());
        }
    }
}

fn format_error(step: &Step, err: &ValidationError) -> String {
    format!("[name: {}, id: {}] {err}", step.display_name(), step.serial)
}
