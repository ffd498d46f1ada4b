//! Step lifecycle logging.
//!
//! Wraps every non-nil action so that it emits a "starting step" event before
//! running, replaces the action's stdout/stderr sinks with writers that tag
//! each line with `{pipeline, step, serial, stream}`, and reports "done" or
//! "encountered error" after. Steps without an action pass through untouched:
//! there is nothing to observe in-process, though they still appear in the
//! frontier because they run their image's default entrypoint elsewhere.

use std::io::{self, Write};
use std::sync::Arc;

use tracing::{error, info};

use super::Wrapper;
use crate::pipeline::{ActionOpts, Step, StepVisitor};

#[derive(Debug, Clone)]
pub struct LogWrapper {
    pipeline: String,
}

impl LogWrapper {
    #[must_use]
    pub fn new(pipeline: impl Into<String>) -> Self {
        Self {
            pipeline: pipeline.into(),
        }
    }

    fn wrap_step(&self, step: Step) -> Step {
        let Some(inner) = step.action.clone() else {
            return step;
        };
        let pipeline = self.pipeline.clone();
        let name = step.display_name();
        let serial = step.serial;

        let mut step = step;
        step.action = Some(Arc::new(move |ctx, mut opts: ActionOpts| {
            let inner = inner.clone();
            let pipeline = pipeline.clone();
            let name = name.clone();
            Box::pin(async move {
                info!(pipeline = %pipeline, step = %name, serial, "starting step");
                opts.stdout = Box::new(LineWriter::new(
                    pipeline.clone(),
                    name.clone(),
                    serial,
                    "stdout",
                ));
                opts.stderr = Box::new(LineWriter::new(
                    pipeline.clone(),
                    name.clone(),
                    serial,
                    "stderr",
                ));
                match inner(ctx, opts).await {
                    Ok(()) => {
                        info!(pipeline = %pipeline, step = %name, serial, "done running step without error");
                        Ok(())
                    }
                    Err(err) => {
                        error!(pipeline = %pipeline, step = %name, serial, error = %err, "encountered error");
                        Err(err)
                    }
                }
            })
        }));
        step
    }
}

impl Wrapper for LogWrapper {
    fn wrap(&self, next: StepVisitor) -> StepVisitor {
        let wrapper = self.clone();
        Arc::new(move |ctx, steps| {
            let steps = steps
                .into_iter()
                .map(|step| wrapper.wrap_step(step))
                .collect();
            next(ctx, steps)
        })
    }
}

/// A sink that emits one structured log event per line.
///
/// Partial lines are buffered until a newline arrives; whatever remains is
/// flushed when the writer is dropped, so a step's last unterminated output
/// still shows up.
pub(crate) struct LineWriter {
    pipeline: String,
    step: String,
    serial: i64,
    stream: &'static str,
    buf: Vec<u8>,
}

impl LineWriter {
    pub(crate) fn new(
        pipeline: impl Into<String>,
        step: impl Into<String>,
        serial: i64,
        stream: &'static str,
    ) -> Self {
        Self {
            pipeline: pipeline.into(),
            step: step.into(),
            serial,
            stream,
            buf: Vec::new(),
        }
    }

    fn emit(&self, line: &[u8]) {
        let line = String::from_utf8_lossy(line);
        let line = line.trim_end_matches('\r');
        info!(
            pipeline = %self.pipeline,
            step = %self.step,
            serial = self.serial,
            stream = self.stream,
            "{line}"
        );
    }
}

impl Write for LineWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.emit(&line[..line.len() - 1]);
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.emit(&rest);
        }
        Ok(())
    }
}

impl Drop for LineWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}
