//! The run-time error taxonomy.
//!
//! Every failure on the execution path funnels into [`ExecutionError`]:
//! validation short-circuits before any resource exists, the wait groups wrap
//! the first step failure of a frontier, and graph or collection errors
//! surfacing here indicate a bug in the append layer rather than a pipeline
//! mistake.

use miette::Diagnostic;
use thiserror::Error;

use crate::backend::cli::docker::RuntimeError;
use crate::backend::ValidationError;
use crate::dag::GraphError;
use crate::pipeline::{ActionError, CollectionError};
use crate::state::StateError;

#[derive(Debug, Error, Diagnostic)]
pub enum ExecutionError {
    /// A step was rejected before the run started.
    #[error("[name: {name}, id: {serial}] {source}")]
    #[diagnostic(code(slipway::exec::validation))]
    Validation {
        name: String,
        serial: i64,
        #[source]
        source: ValidationError,
    },

    /// The pipeline binary could not be built into the shared volume.
    #[error("failed to compile the pipeline: {message}")]
    #[diagnostic(code(slipway::exec::compile))]
    Compile { message: String },

    /// The container runtime refused a network, volume, or container
    /// operation.
    #[error(transparent)]
    #[diagnostic(code(slipway::exec::runtime))]
    Runtime(#[from] RuntimeError),

    /// A step ran and failed.
    #[error("step '{name}' (serial {serial}) failed: {source}")]
    #[diagnostic(code(slipway::exec::step))]
    Step {
        name: String,
        serial: i64,
        #[source]
        source: ActionError,
    },

    /// First failure observed in a frontier; siblings were cancelled.
    #[error("error encountered in execution: {source}")]
    #[diagnostic(code(slipway::exec::first_error))]
    FirstError {
        #[source]
        source: Box<ExecutionError>,
    },

    #[error("time out")]
    #[diagnostic(code(slipway::exec::timeout))]
    Timeout,

    #[error("execution cancelled")]
    #[diagnostic(code(slipway::exec::cancelled))]
    Cancelled,

    #[error(transparent)]
    #[diagnostic(code(slipway::exec::graph))]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(code(slipway::exec::collection))]
    Collection(#[from] CollectionError),

    #[error(transparent)]
    #[diagnostic(code(slipway::exec::state))]
    State(#[from] StateError),
}

impl ExecutionError {
    /// The innermost error of a wait-group wrap, for callers that want the
    /// step failure rather than the envelope.
    #[must_use]
    pub fn root(&self) -> &ExecutionError {
        match self {
            ExecutionError::FirstError { source } => source.root(),
            other => other,
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), ExecutionError::Cancelled)
    }
}
