//! Background services and a fire-and-forget sub-pipeline.
//!
//! The postgres step has no action, so its image runs with the default
//! entrypoint; steps on the same run network reach it by container name.

use std::io::Write;

use slipway::pipeline::{action_fn, Event, Step};

fn main() {
    let mut sw = slipway::new("integration suite");
    sw.when([Event::git_commit().with_branch("main")]);

    sw.background([Step::named("postgres").with_image("postgres:16")]);

    sw.run([Step::named("migrate")
        .with_image("rust:1.79")
        .with_action(action_fn(|_ctx, mut opts| async move {
            writeln!(opts.stdout, "applying migrations")?;
            Ok(())
        }))]);

    sw.parallel([
        Step::named("integration-a")
            .with_image("rust:1.79")
            .with_action(action_fn(|_ctx, mut opts| async move {
                writeln!(opts.stdout, "integration suite a")?;
                Ok(())
            })),
        Step::named("integration-b")
            .with_image("rust:1.79")
            .with_action(action_fn(|_ctx, mut opts| async move {
                writeln!(opts.stdout, "integration suite b")?;
                Ok(())
            })),
    ]);

    sw.sub_pipeline("nightly-report", |nightly| {
        nightly.run([Step::named("report")
            .with_image("rust:1.79")
            .with_action(action_fn(|_ctx, mut opts| async move {
                writeln!(opts.stdout, "uploading the nightly report")?;
                Ok(())
            }))]);
    });

    sw.done();
}
