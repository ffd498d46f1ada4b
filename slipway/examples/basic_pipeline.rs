//! A small pipeline: lint, then test and docs in parallel, then package.
//!
//! Run locally (requires docker):
//! ```sh
//! cargo run --example basic_pipeline
//! ```
//! Render the drone document instead:
//! ```sh
//! cargo run --example basic_pipeline -- --mode drone
//! ```

use std::io::Write;

use slipway::pipeline::{action_fn, Step};
use slipway::state::Argument;

fn main() {
    let mut sw = slipway::new("basic pipeline");

    sw.run([Step::named("lint")
        .with_image("rust:1.79")
        .with_arguments([Argument::SourceFs])
        .with_action(action_fn(|_ctx, mut opts| async move {
            writeln!(opts.stdout, "running clippy")?;
            Ok(())
        }))]);

    sw.parallel([
        Step::named("test")
            .with_image("rust:1.79")
            .with_arguments([Argument::SourceFs])
            .with_action(action_fn(|_ctx, mut opts| async move {
                writeln!(opts.stdout, "running the test suite")?;
                Ok(())
            })),
        Step::named("docs")
            .with_image("rust:1.79")
            .with_arguments([Argument::SourceFs])
            .with_action(action_fn(|_ctx, mut opts| async move {
                writeln!(opts.stdout, "building docs")?;
                Ok(())
            })),
    ]);

    sw.run([Step::named("package")
        .with_image("rust:1.79")
        .with_arguments([Argument::SourceFs, Argument::BuildId])
        .with_action(action_fn(|_ctx, mut opts| async move {
            writeln!(opts.stdout, "packaging artifacts")?;
            Ok(())
        }))]);

    sw.done();
}
