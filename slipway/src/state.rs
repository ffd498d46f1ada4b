//! Pipeline arguments and the state store that resolves them.
//!
//! Steps declare the [`Argument`]s they need; at execution time the store
//! resolves each one from, in order: a user-supplied `--arg key=value`
//! override, the per-run cache, or a known-value provider (current directory,
//! random build token, git metadata, the host's container-runtime socket).

use std::io;
use std::process::Command;
use std::sync::Mutex;

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use thiserror::Error;

use crate::stringutil;

/// An enumerated argument key a step can declare as input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Argument {
    /// The author's source tree. Defaults to the current directory.
    SourceFs,
    /// The host's container-runtime socket.
    DockerSocketFs,
    /// URL of the default git remote.
    RemoteUrl,
    /// The commit being built.
    CommitRef,
    /// The branch being built.
    Branch,
    /// The working directory of the run.
    WorkingDir,
    /// Identifier of this run; random when not supplied.
    BuildId,
}

/// The value class of an argument, which decides how the runner materialises
/// it: file-system arguments become container mounts, string arguments are
/// forwarded on the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgumentType {
    String,
    SecretString,
    Directory,
    File,
    Unknown,
}

impl Argument {
    /// The key used with `--arg key=value`.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Argument::SourceFs => "source",
            Argument::DockerSocketFs => "docker-socket",
            Argument::RemoteUrl => "remote-url",
            Argument::CommitRef => "commit-ref",
            Argument::Branch => "branch",
            Argument::WorkingDir => "workdir",
            Argument::BuildId => "build-id",
        }
    }

    #[must_use]
    pub fn arg_type(&self) -> ArgumentType {
        match self {
            Argument::SourceFs => ArgumentType::Directory,
            Argument::DockerSocketFs => ArgumentType::File,
            Argument::RemoteUrl
            | Argument::CommitRef
            | Argument::Branch
            | Argument::WorkingDir
            | Argument::BuildId => ArgumentType::String,
        }
    }

    #[must_use]
    pub fn from_key(key: &str) -> Option<Self> {
        [
            Argument::SourceFs,
            Argument::DockerSocketFs,
            Argument::RemoteUrl,
            Argument::CommitRef,
            Argument::Branch,
            Argument::WorkingDir,
            Argument::BuildId,
        ]
        .into_iter()
        .find(|arg| arg.key() == key)
    }
}

impl std::fmt::Display for Argument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Error, Diagnostic)]
pub enum StateError {
    #[error("no value available for argument '{0}'")]
    #[diagnostic(
        code(slipway::state::unresolved),
        help("supply it with --arg key=value")
    )]
    Unresolved(Argument),

    #[error("command '{command}' failed: {output}")]
    #[diagnostic(code(slipway::state::command))]
    Command { command: String, output: String },

    #[error(transparent)]
    #[diagnostic(code(slipway::state::io))]
    Io(#[from] io::Error),
}

/// Per-run argument store. Overrides always win over known-value providers;
/// provider results are cached so a value is discovered at most once.
#[derive(Debug)]
pub struct State {
    overrides: FxHashMap<String, String>,
    cache: Mutex<FxHashMap<Argument, String>>,
}

impl State {
    pub fn new(overrides: impl IntoIterator<Item = (String, String)>) -> Self {
        Self {
            overrides: overrides.into_iter().collect(),
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn get(&self, arg: Argument) -> Result<String, StateError> {
        if let Some(value) = self.overrides.get(arg.key()) {
            return Ok(value.clone());
        }
        let mut cache = self.cache.lock().expect("state cache poisoned");
        if let Some(value) = cache.get(&arg) {
            return Ok(value.clone());
        }
        let value = known_value(arg)?;
        cache.insert(arg, value.clone());
        Ok(value)
    }
}

fn known_value(arg: Argument) -> Result<String, StateError> {
    match arg {
        Argument::SourceFs | Argument::WorkingDir => {
            Ok(std::env::current_dir()?.to_string_lossy().into_owned())
        }
        Argument::DockerSocketFs => Ok("/var/run/docker.sock".to_string()),
        Argument::BuildId => Ok(stringutil::random(8)),
        Argument::RemoteUrl => {
            let remotes = git(&["remote"])?;
            let remote = first_remote(&remotes)?;
            git(&["remote", "get-url", remote])
        }
        Argument::CommitRef => git(&["rev-parse", "HEAD"]),
        Argument::Branch => git(&["rev-parse", "--abbrev-ref", "HEAD"]),
    }
}

/// The remote the URL probe asks about: the first one configured. A
/// repository with no remotes cannot resolve [`Argument::RemoteUrl`] at all.
fn first_remote(output: &str) -> Result<&str, StateError> {
    let remote = output.lines().next().unwrap_or("").trim();
    if remote.is_empty() {
        return Err(StateError::Unresolved(Argument::RemoteUrl));
    }
    Ok(remote)
}

fn git(args: &[&str]) -> Result<String, StateError> {
    let output = Command::new("git").args(args).output()?;
    if !output.status.success() {
        return Err(StateError::Command {
            command: format!("git {}", args.join(" ")),
            output: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim_end().to_string())
}
