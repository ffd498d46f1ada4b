//! Backends consume a frozen collection: the cli backend executes it, the
//! drone backend serialises it.

pub mod cli;
pub mod drone;

use std::sync::Arc;

use async_trait::async_trait;
use miette::Diagnostic;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::args::{Mode, PipelineArgs};
use crate::errors::ExecutionError;
use crate::pipeline::{Event, Step, Walker};
use crate::state::State;

/// Why a step was rejected (or merely frowned at) before the run.
#[derive(Debug, Clone, Error, Diagnostic)]
pub enum ValidationError {
    #[error("no image provided")]
    #[diagnostic(code(slipway::validate::no_image))]
    NoImage,

    #[error("{0}")]
    #[diagnostic(code(slipway::validate::invalid))]
    Invalid(String),

    /// Warn-only: the backend accepts the step but wants the author told.
    #[error("validation skipped: {0}")]
    #[diagnostic(code(slipway::validate::skip))]
    Skip(String),
}

impl ValidationError {
    #[must_use]
    pub fn is_skip(&self) -> bool {
        matches!(self, ValidationError::Skip(_))
    }
}

/// Options common to every backend.
#[derive(Debug, Clone)]
pub struct CommonOpts {
    /// Name of the pipeline program.
    pub name: String,
    /// Library version; keys the default step image.
    pub version: String,
    /// Identifier of this run.
    pub build_id: String,
    pub args: PipelineArgs,
    pub state: Arc<State>,
}

/// A consumer of the frozen collection.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Reject or warn about a step before anything runs.
    fn validate(&self, step: &Step) -> Result<(), ValidationError>;

    /// Consume the collection through the walker: execute it, or emit a
    /// document describing it.
    async fn done(
        &self,
        ctx: CancellationToken,
        walker: Arc<dyn Walker>,
        events: &[Event],
    ) -> Result<(), ExecutionError>;
}

/// Select the backend for the parsed mode.
pub fn new_backend(opts: CommonOpts) -> Arc<dyn Backend> {
    match opts.args.mode {
        Mode::Cli => Arc::new(cli::CliBackend::new(opts)),
        Mode::Drone => Arc::new(drone::DroneBackend::new(opts)),
    }
}
