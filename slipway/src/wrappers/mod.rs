//! Composable middleware around a step visitor.
//!
//! A [`Wrapper`] takes a visitor and returns a visitor; wrappers compose by
//! left-to-right application. Order only affects observability, never
//! correctness.

mod log;
mod trace;

pub use log::LogWrapper;
pub use trace::TraceWrapper;

use crate::pipeline::StepVisitor;

/// A sink that turns each written line into a structured log event with
/// `{pipeline, step, serial, stream}` fields. This is the same writer the
/// log wrapper installs around actions; the runner reuses it for container
/// output.
pub(crate) fn log_line_writer(
    pipeline: &str,
    step: &str,
    serial: i64,
    stream: &'static str,
) -> Box<dyn std::io::Write + Send> {
    Box::new(log::LineWriter::new(pipeline, step, serial, stream))
}

/// Middleware over a step visitor.
pub trait Wrapper {
    fn wrap(&self, next: StepVisitor) -> StepVisitor;
}

/// The standard middleware stack for in-process step execution: tracing
/// spans around each frontier, step lifecycle logging around each action.
pub fn standard(pipeline: impl Into<String>, visit: StepVisitor) -> StepVisitor {
    TraceWrapper.wrap(LogWrapper::new(pipeline).wrap(visit))
}
