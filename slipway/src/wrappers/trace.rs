//! Tracing spans around frontier execution.

use std::sync::Arc;

use tracing::{info_span, Instrument};

use super::Wrapper;
use crate::pipeline::{Step, StepVisitor};

/// Runs each frontier inside a span carrying the step names, so container
/// and action logs nest under the batch that produced them.
#[derive(Debug, Clone, Copy, Default)]
pub struct TraceWrapper;

impl Wrapper for TraceWrapper {
    fn wrap(&self, next: StepVisitor) -> StepVisitor {
        Arc::new(move |ctx, steps| {
            let names: Vec<String> = steps.iter().map(Step::display_name).collect();
            let span = info_span!("frontier", steps = ?names);
            Box::pin(next(ctx, steps).instrument(span))
        })
    }
}
