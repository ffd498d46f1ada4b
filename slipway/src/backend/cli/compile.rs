//! Pipeline compilation into the shared volume.
//!
//! Every step container needs the compiled pipeline binary without requiring
//! that every image carries a Rust toolchain. A short-lived build container
//! bind-mounts the author's source at `/var/slipway`, mounts the run's named
//! volume at `/opt/slipway`, and produces a static linux/amd64 binary at
//! `/opt/slipway/pipeline`. The pipeline crate's bin target must be named
//! `pipeline`.

use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::docker::{Container, CreateContainerOpts, DockerClient, Mount, RunContainerOpts, Volume};
use super::{PIPELINE_BINARY, SOURCE_PATH, VOLUME_PATH};
use crate::backend::CommonOpts;
use crate::errors::ExecutionError;
use crate::wrappers::log_line_writer;

pub(crate) const BUILD_IMAGE: &str = "rust:1.79";
pub(crate) const BUILD_TARGET: &str = "x86_64-unknown-linux-musl";

/// The shell command the build container runs. Static CRT and a pinned
/// target keep the binary runnable in any linux/amd64 step image.
pub(crate) fn cargo_build_command(path: &str) -> Vec<String> {
    let manifest = format!("{}/Cargo.toml", path.trim_end_matches('/'));
    let script = format!(
        "rustup target add {BUILD_TARGET} && \
         cargo build --release --locked --bin pipeline \
         --target {BUILD_TARGET} --target-dir {VOLUME_PATH}/build \
         --manifest-path {manifest} && \
         install -m 0755 {VOLUME_PATH}/build/{BUILD_TARGET}/release/pipeline {PIPELINE_BINARY}"
    );
    vec!["/bin/sh".to_string(), "-c".to_string(), script]
}

/// Create the run's volume and compile the pipeline into it.
pub(crate) async fn compile_pipeline(
    docker: &DockerClient,
    ctx: &CancellationToken,
    opts: &CommonOpts,
) -> Result<Volume, ExecutionError> {
    let volume = docker
        .create_volume(&format!("slipway-{}", opts.build_id))
        .await?;

    let source = std::env::current_dir()
        .map_err(|err| ExecutionError::Compile {
            message: format!("cannot determine the module root: {err}"),
        })?
        .to_string_lossy()
        .into_owned();

    let create = CreateContainerOpts {
        name: format!("compile-{}", volume.name),
        image: BUILD_IMAGE.to_string(),
        command: cargo_build_command(&opts.args.path),
        env: vec![
            ("CARGO_BUILD_TARGET".to_string(), BUILD_TARGET.to_string()),
            (
                "RUSTFLAGS".to_string(),
                "-C target-feature=+crt-static".to_string(),
            ),
        ],
        mounts: vec![
            Mount {
                source,
                target: SOURCE_PATH.to_string(),
                readonly: false,
            },
            Mount {
                source: volume.name.clone(),
                target: VOLUME_PATH.to_string(),
                readonly: false,
            },
        ],
        workdir: Some(SOURCE_PATH.to_string()),
        network: None,
        labels: vec![("slipway.build-id".to_string(), opts.build_id.clone())],
    };

    let mut container: Container = match docker.create_container(create).await {
        Ok(container) => container,
        Err(err) => {
            remove_volume_logged(docker, &volume).await;
            return Err(err.into());
        }
    };

    let sinks = RunContainerOpts {
        stdout: log_line_writer(&opts.name, "compile-pipeline", 0, "stdout"),
        stderr: log_line_writer(&opts.name, "compile-pipeline", 0, "stderr"),
    };
    match docker.run_container(ctx, &mut container, sinks).await {
        Ok(0) => Ok(volume),
        Ok(code) => {
            remove_volume_logged(docker, &volume).await;
            Err(ExecutionError::Compile {
                message: format!("build container exited with code {code}"),
            })
        }
        Err(err) => {
            remove_volume_logged(docker, &volume).await;
            Err(ExecutionError::Compile {
                message: err.to_string(),
            })
        }
    }
}

async fn remove_volume_logged(docker: &DockerClient, volume: &Volume) {
    if let Err(err) = docker.remove_volume(volume).await {
        warn!(volume = %volume.name, error = %err, "failed to remove pipeline volume");
    }
}
