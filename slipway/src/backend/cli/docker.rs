//! Container-runtime plumbing over the docker CLI.
//!
//! Networks, volumes, and containers are driven through `docker`
//! subcommands via [`tokio::process::Command`]. Container stdout/stderr are
//! piped line-by-line into the caller's sinks. The per-container state
//! machine is Created → Running → Exited(code); on cancellation the runner
//! attempts a stop, and removal is attempted on every terminal state.

use std::io::Write;
use std::process::Stdio;

use miette::Diagnostic;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Error, Diagnostic)]
pub enum RuntimeError {
    #[error("failed to spawn '{command}': {source}")]
    #[diagnostic(
        code(slipway::docker::spawn),
        help("is the docker CLI installed and on PATH?")
    )]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{command}' exited with {code}: {stderr}")]
    #[diagnostic(code(slipway::docker::command))]
    Command {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error(transparent)]
    #[diagnostic(code(slipway::docker::io))]
    Io(#[from] std::io::Error),
}

/// An isolated network created for one run.
#[derive(Debug, Clone)]
pub struct Network {
    pub name: String,
}

/// A named volume created for one run.
#[derive(Debug, Clone)]
pub struct Volume {
    pub name: String,
}

/// A bind or volume mount into a container.
#[derive(Debug, Clone)]
pub struct Mount {
    pub source: String,
    pub target: String,
    pub readonly: bool,
}

impl Mount {
    fn render(&self) -> String {
        if self.readonly {
            format!("{}:{}:ro", self.source, self.target)
        } else {
            format!("{}:{}", self.source, self.target)
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct CreateContainerOpts {
    pub name: String,
    pub image: String,
    /// Empty means the image's default entrypoint.
    pub command: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub workdir: Option<String>,
    pub network: Option<String>,
    pub labels: Vec<(String, String)>,
}

/// Argument vector for `docker create`, kept pure so it can be tested
/// without a runtime.
pub fn create_args(opts: &CreateContainerOpts) -> Vec<String> {
    let mut args = vec!["create".to_string(), "--name".to_string(), opts.name.clone()];
    if let Some(network) = &opts.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    if let Some(workdir) = &opts.workdir {
        args.push("--workdir".to_string());
        args.push(workdir.clone());
    }
    for (key, value) in &opts.env {
        args.push("--env".to_string());
        args.push(format!("{key}={value}"));
    }
    for (key, value) in &opts.labels {
        args.push("--label".to_string());
        args.push(format!("{key}={value}"));
    }
    for mount in &opts.mounts {
        args.push("--volume".to_string());
        args.push(mount.render());
    }
    args.push(opts.image.clone());
    args.extend(opts.command.iter().cloned());
    args
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Exited(i32),
}

#[derive(Debug)]
pub struct Container {
    pub id: String,
    pub opts: CreateContainerOpts,
    pub state: ContainerState,
}

/// Output sinks for one container run.
pub struct RunContainerOpts {
    pub stdout: Box<dyn Write + Send>,
    pub stderr: Box<dyn Write + Send>,
}

/// Thin client over the docker CLI.
#[derive(Debug, Clone)]
pub struct DockerClient {
    binary: String,
}

impl Default for DockerClient {
    fn default() -> Self {
        Self::new()
    }
}

impl DockerClient {
    #[must_use]
    pub fn new() -> Self {
        Self {
            binary: "docker".to_string(),
        }
    }

    async fn output(&self, args: &[String]) -> Result<String, RuntimeError> {
        let rendered = format!("{} {}", self.binary, args.join(" "));
        debug!(command = %rendered, "running docker command");
        let output = Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                command: rendered.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(RuntimeError::Command {
                command: rendered,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
    }

    pub async fn create_network(&self, name: &str) -> Result<Network, RuntimeError> {
        self.output(&["network".to_string(), "create".to_string(), name.to_string()])
            .await?;
        Ok(Network {
            name: name.to_string(),
        })
    }

    pub async fn remove_network(&self, network: &Network) -> Result<(), RuntimeError> {
        self.output(&[
            "network".to_string(),
            "rm".to_string(),
            network.name.clone(),
        ])
        .await?;
        Ok(())
    }

    pub async fn create_volume(&self, name: &str) -> Result<Volume, RuntimeError> {
        self.output(&["volume".to_string(), "create".to_string(), name.to_string()])
            .await?;
        Ok(Volume {
            name: name.to_string(),
        })
    }

    pub async fn remove_volume(&self, volume: &Volume) -> Result<(), RuntimeError> {
        self.output(&["volume".to_string(), "rm".to_string(), volume.name.clone()])
            .await?;
        Ok(())
    }

    pub async fn create_container(
        &self,
        opts: CreateContainerOpts,
    ) -> Result<Container, RuntimeError> {
        let id = self.output(&create_args(&opts)).await?;
        Ok(Container {
            id,
            opts,
            state: ContainerState::Created,
        })
    }

    /// Start the container, stream its output into the sinks, and wait for
    /// it to exit. Returns the exit code. The container is removed before
    /// returning, whatever the outcome.
    pub async fn run_container(
        &self,
        ctx: &CancellationToken,
        container: &mut Container,
        opts: RunContainerOpts,
    ) -> Result<i32, RuntimeError> {
        let command = format!("{} start --attach {}", self.binary, container.id);
        let mut child = Command::new(&self.binary)
            .args(["start", "--attach", container.id.as_str()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RuntimeError::Spawn { command, source })?;
        container.state = ContainerState::Running;

        let stdout_pump = child.stdout.take().map(|pipe| tokio::spawn(pump(pipe, opts.stdout)));
        let stderr_pump = child.stderr.take().map(|pipe| tokio::spawn(pump(pipe, opts.stderr)));

        let status = tokio::select! {
            status = child.wait() => status?,
            () = ctx.cancelled() => {
                debug!(container = %container.id, "cancellation requested, stopping container");
                if let Err(err) = self.stop_container(&container.id).await {
                    warn!(container = %container.id, error = %err, "failed to stop container");
                }
                child.wait().await?
            }
        };
        if let Some(pump) = stdout_pump {
            let _ = pump.await;
        }
        if let Some(pump) = stderr_pump {
            let _ = pump.await;
        }

        let code = status.code().unwrap_or(-1);
        container.state = ContainerState::Exited(code);
        if let Err(err) = self.remove_container(&container.id).await {
            warn!(container = %container.id, error = %err, "failed to remove container");
        }
        Ok(code)
    }

    pub async fn stop_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.output(&["stop".to_string(), id.to_string()]).await?;
        Ok(())
    }

    pub async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.output(&["rm".to_string(), "--force".to_string(), id.to_string()])
            .await?;
        Ok(())
    }
}

async fn pump(reader: impl AsyncRead + Unpin, mut sink: Box<dyn Write + Send>) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if writeln!(sink, "{line}").is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(err) => {
                warn!(error = %err, "failed to read container output");
                break;
            }
        }
    }
    let _ = sink.flush();
}
