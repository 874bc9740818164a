//! Agent-CLI process spawning: PTY-backed when possible, plain pipes otherwise.
//!
//! Some agent CLIs detect whether they are attached to a terminal and
//! refuse to answer interactive prompts (host-key confirmation, trust
//! dialogs) without one, so a pseudo-terminal is the preferred spawn path.
//! PTY allocation can fail (exhausted ptmx, locked-down containers); that
//! failure falls back to pipes and must never take the server down.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use serde::Serialize;
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tracing::{debug, warn};

/// How the child ended up being spawned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SpawnMode {
    /// Attached to a pseudo-terminal; stdout and stderr arrive merged.
    Pty,
    /// Plain piped stdio.
    Pipe,
}

/// One agent-CLI invocation: program, arguments, environment overrides and
/// working directory. The parent environment is inherited; `env` entries
/// are applied on top.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub working_dir: Option<PathBuf>,
}

impl CommandSpec {
    pub fn new<P, I, A>(program: P, args: I) -> Self
    where
        P: Into<String>,
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            env: Vec::new(),
            working_dir: None,
        }
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// The full command line, for result reporting.
    pub fn command_line(&self) -> Vec<String> {
        let mut line = Vec::with_capacity(self.args.len() + 1);
        line.push(self.program.clone());
        line.extend(self.args.iter().cloned());
        line
    }
}

/// A spawned child plus the streams to drain.
pub(crate) enum SpawnedChild {
    Pty {
        child: Child,
        reader: pty_process::OwnedReadPty,
        // Held so the PTY master stays open for the child's lifetime.
        writer: pty_process::OwnedWritePty,
    },
    Pipe {
        child: Child,
        stdout: ChildStdout,
        stderr: ChildStderr,
    },
}

/// Spawn the agent CLI, preferring a PTY when asked for one.
pub(crate) fn spawn(
    spec: &CommandSpec,
    prefer_pty: bool,
) -> std::io::Result<(SpawnedChild, SpawnMode)> {
    if prefer_pty {
        match spawn_pty(spec) {
            Ok(child) => {
                debug!(program = %spec.program, "spawned agent CLI on a pty");
                return Ok((child, SpawnMode::Pty));
            },
            Err(error) => {
                warn!(%error, "pty spawn failed, falling back to piped stdio");
            },
        }
    }
    let child = spawn_pipe(spec)?;
    debug!(program = %spec.program, "spawned agent CLI with piped stdio");
    Ok((child, SpawnMode::Pipe))
}

fn spawn_pty(spec: &CommandSpec) -> Result<SpawnedChild, pty_process::Error> {
    let (pty, pts) = pty_process::open()?;
    // Wide terminal so the CLI doesn't hard-wrap its output.
    pty.resize(pty_process::Size::new(24, 250))?;

    let mut cmd = pty_process::Command::new(&spec.program);
    for arg in &spec.args {
        cmd = cmd.arg(arg);
    }
    for (key, value) in &spec.env {
        cmd = cmd.env(key, value);
    }
    if let Some(dir) = &spec.working_dir {
        cmd = cmd.current_dir(dir);
    }

    let child = cmd.spawn(pts)?;
    let (reader, writer) = pty.into_split();
    Ok(SpawnedChild::Pty {
        child,
        reader,
        writer,
    })
}

fn spawn_pipe(spec: &CommandSpec) -> std::io::Result<SpawnedChild> {
    let mut cmd = Command::new(&spec.program);
    cmd.args(&spec.args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for (key, value) in &spec.env {
        cmd.env(key, value);
    }
    if let Some(dir) = &spec.working_dir {
        cmd.current_dir(dir);
    }

    // New process group so a kill reaches the whole tree, matching the
    // session the PTY path gets for free.
    // SAFETY: pre_exec runs between fork and exec in the child.
    unsafe {
        cmd.pre_exec(|| {
            nix::unistd::setsid().map_err(std::io::Error::other)?;
            Ok(())
        });
    }

    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| std::io::Error::other("child stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| std::io::Error::other("child stderr was not piped"))?;
    Ok(SpawnedChild::Pipe {
        child,
        stdout,
        stderr,
    })
}

/// Terminate a child: SIGTERM to its process group, a bounded grace wait,
/// then SIGKILL for anything still alive.
pub(crate) async fn terminate(child: &mut Child, pid: Option<i32>, grace: Duration) {
    if let Some(pid) = pid {
        let _ = signal::kill(Pid::from_raw(-pid), Signal::SIGTERM);
    }

    if tokio::time::timeout(grace, child.wait()).await.is_err() {
        if let Some(pid) = pid {
            let _ = signal::kill(Pid::from_raw(-pid), Signal::SIGKILL);
        }
        let _ = child.kill().await;
        let _ = child.wait().await;
    }
}
