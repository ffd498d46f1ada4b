//! The pipeline data model: steps, pipelines, actions, and trigger events.
//!
//! A [`Step`] is the atomic unit of work. It always names a container image
//! and may carry an [`Action`], a callable that does the step's work when the
//! pipeline binary is re-invoked inside that image. A [`Pipeline`] is a named
//! scope owning a step-graph; the [`Collection`](collection::Collection)
//! holds the graph of pipelines for one run.
//!
//! Everything here lives for a single run: steps and pipelines are created
//! during authoring, frozen at `done`, executed once, and discarded.

pub mod collection;
pub mod walker;

pub use collection::{Collection, CollectionError};
pub use walker::{CollectionWalker, PipelineVisitor, StepVisitor, Walker};

use std::fmt;
use std::io::{self, Write};
use std::sync::Arc;

use futures::future::BoxFuture;
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::dag::Graph;
use crate::state::Argument;

/// Serial reserved for the synthetic root node of every graph.
pub const ROOT_SERIAL: i64 = 0;

/// How a step (or pipeline) participates in graph construction and
/// scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepType {
    /// Joined by the frontier barrier like any other step.
    Default,
    /// Detached branch: runs concurrently with the main spine and never
    /// blocks successors.
    Background,
    /// A nested pipeline dispatched fire-and-forget.
    SubPipeline,
}

/// A condition under which a pipeline is executed in a remote environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub branch: Option<String>,
}

impl Event {
    pub fn git_commit() -> Self {
        Self {
            name: "git-commit".to_string(),
            branch: None,
        }
    }

    pub fn git_tag() -> Self {
        Self {
            name: "git-tag".to_string(),
            branch: None,
        }
    }

    pub fn pull_request() -> Self {
        Self {
            name: "pull-request".to_string(),
            branch: None,
        }
    }

    #[must_use]
    pub fn with_branch(mut self, branch: impl Into<String>) -> Self {
        self.branch = Some(branch.into());
        self
    }
}

/// Failure of a step action.
#[derive(Debug, Error, Diagnostic)]
pub enum ActionError {
    #[error("{0}")]
    #[diagnostic(code(slipway::action::failed))]
    Failed(String),

    #[error(transparent)]
    #[diagnostic(code(slipway::action::io))]
    Io(#[from] io::Error),

    #[error("exited with code {code}")]
    #[diagnostic(code(slipway::action::exit_code))]
    ExitCode { code: i32 },

    #[error("action cancelled")]
    #[diagnostic(code(slipway::action::cancelled))]
    Cancelled,
}

/// Output sinks handed to an action. The log wrapper replaces these with
/// writers that tag every line with the step's identity and stream name.
pub struct ActionOpts {
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

impl ActionOpts {
    /// Sinks wired to the process's own stdout and stderr.
    #[must_use]
    pub fn stdio() -> Self {
        Self {
            stdout: Box::new(io::stdout()),
            stderr: Box::new(io::stderr()),
        }
    }

    /// Sinks that drop everything. Useful in tests.
    #[must_use]
    pub fn discard() -> Self {
        Self {
            stdout: Box::new(io::sink()),
            stderr: Box::new(io::sink()),
        }
    }
}

impl fmt::Debug for ActionOpts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ActionOpts")
    }
}

/// The callable unit of a step: given a cancellation token and output sinks,
/// perform the step's work. A step without an action means "run the image
/// with its default entrypoint".
pub type Action = Arc<
    dyn Fn(CancellationToken, ActionOpts) -> BoxFuture<'static, Result<(), ActionError>>
        + Send
        + Sync,
>;

/// Build an [`Action`] from an async closure.
pub fn action_fn<F, Fut>(f: F) -> Action
where
    F: Fn(CancellationToken, ActionOpts) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<(), ActionError>> + Send + 'static,
{
    Arc::new(move |ctx, opts| Box::pin(f(ctx, opts)))
}

/// An action that succeeds without doing anything.
pub fn no_op_action() -> Action {
    action_fn(|_ctx, _opts| async { Ok(()) })
}

/// An atomic unit of pipeline work.
#[derive(Clone)]
pub struct Step {
    /// Unique within a collection; assigned at append time.
    pub serial: i64,
    pub name: String,
    pub image: String,
    pub step_type: StepType,
    /// Declared inputs, resolved through the state store before execution.
    pub arguments: Vec<Argument>,
    pub action: Option<Action>,
}

impl Step {
    #[must_use]
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            serial: 0,
            name: name.into(),
            image: String::new(),
            step_type: StepType::Default,
            arguments: Vec::new(),
            action: None,
        }
    }

    /// A named step whose action succeeds immediately.
    #[must_use]
    pub fn no_op(name: impl Into<String>) -> Self {
        Self::named(name).with_action(no_op_action())
    }

    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    #[must_use]
    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    #[must_use]
    pub fn with_action(mut self, action: Action) -> Self {
        self.action = Some(action);
        self
    }

    #[must_use]
    pub fn with_arguments(mut self, arguments: impl IntoIterator<Item = Argument>) -> Self {
        self.arguments.extend(arguments);
        self
    }

    /// Human-readable identity, stable even for unnamed steps.
    #[must_use]
    pub fn display_name(&self) -> String {
        if self.name.is_empty() {
            format!("unnamed-step-{}", self.serial)
        } else {
            self.name.clone()
        }
    }

    pub(crate) fn root() -> Self {
        Self::named("root")
    }
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Step")
            .field("serial", &self.serial)
            .field("name", &self.name)
            .field("image", &self.image)
            .field("step_type", &self.step_type)
            .field("arguments", &self.arguments)
            .field("action", &self.action.as_ref().map(|_| "<action>"))
            .finish()
    }
}

/// A named scope containing a step-graph.
#[derive(Debug, Clone)]
pub struct Pipeline {
    pub serial: i64,
    pub name: String,
    pub pipeline_type: StepType,
    pub events: Vec<Event>,
    pub graph: Graph<Step>,
    /// The edge attachment set: serials the next sequential or parallel
    /// append hangs its edges from. Distinct from the graph's topological
    /// leaves, which background steps join but this set never does.
    pub(crate) attach: Vec<i64>,
}

impl Pipeline {
    #[must_use]
    pub fn new(serial: i64, name: impl Into<String>) -> Self {
        let mut graph = Graph::new();
        graph
            .add_node(ROOT_SERIAL, Step::root())
            .expect("fresh step-graph cannot already hold the root");
        Self {
            serial,
            name: name.into(),
            pipeline_type: StepType::Default,
            events: Vec::new(),
            graph,
            attach: vec![ROOT_SERIAL],
        }
    }

    pub(crate) fn root() -> Self {
        Self::new(ROOT_SERIAL, "root")
    }

    /// Steps in insertion order, excluding the synthetic root.
    pub fn steps(&self) -> impl Iterator<Item = &Step> {
        self.graph
            .nodes()
            .iter()
            .filter(|n| n.id != ROOT_SERIAL)
            .map(|n| &n.value)
    }

    /// Append a batch of steps following the collection rules: a batch of
    /// more than one step fans out in parallel from the attachment set, a
    /// single step chains sequentially, and background steps hang directly
    /// off the root without entering the attachment set.
    pub(crate) fn append(&mut self, steps: Vec<Step>) -> Result<(), CollectionError> {
        if steps.is_empty() {
            return Ok(());
        }
        let parallel = steps.len() > 1;
        let mut next_attach = Vec::new();
        for step in steps {
            let serial = step.serial;
            let background = step.step_type == StepType::Background;
            self.graph.add_node(serial, step)?;
            if background {
                self.graph.add_edge(ROOT_SERIAL, serial)?;
                continue;
            }
            for from in &self.attach {
                self.graph.add_edge(*from, serial)?;
            }
            if parallel {
                next_attach.push(serial);
            } else {
                next_attach = vec![serial];
            }
        }
        if !next_attach.is_empty() {
            self.attach = next_attach;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_name_falls_back_to_serial() {
        let mut step = Step::named("");
        step.serial = 7;
        assert_eq!(step.display_name(), "unnamed-step-7");
        assert_eq!(Step::named("lint").display_name(), "lint");
    }

    #[test]
    fn step_builder_accumulates() {
        let step = Step::named("build")
            .with_image("rust:1.79")
            .with_arguments([Argument::SourceFs])
            .with_action(no_op_action());
        assert_eq!(step.image, "rust:1.79");
        assert_eq!(step.arguments, vec![Argument::SourceFs]);
        assert!(step.action.is_some());
    }

    #[test]
    fn pipeline_starts_with_only_the_root() {
        let pipeline = Pipeline::new(1, "default");
        assert_eq!(pipeline.steps().count(), 0);
        assert_eq!(pipeline.attach, vec![ROOT_SERIAL]);
    }

    #[test]
    fn event_builder_sets_branch() {
        let event = Event::git_commit().with_branch("main");
        assert_eq!(event.branch.as_deref(), Some("main"));
    }

    #[tokio::test]
    async fn no_op_action_succeeds() {
        let action = no_op_action();
        let result = action(CancellationToken::new(), ActionOpts::discard()).await;
        assert!(result.is_ok());
    }
}
