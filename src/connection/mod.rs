//! Uniform command / file-sync interface over a transport.
//!
//! A [`Connection`] runs commands "on" a target (the local host, a running
//! container, an SSH destination) and synchronizes files with it via
//! `rsync`. Callers never encode transport details: each variant contributes
//! the argv prefix for command execution and the `-e` remote-shell option
//! for rsync, so `conn.rsync(["-r", "tree/", "remote:/dest"])` works the
//! same over every transport (the host name before the colon is ignored;
//! the remote-shell option carries all connection details).
//!
//! Variants:
//!
//! | Type | Target |
//! |------|--------|
//! | [`LocalConnection`] | current host |
//! | [`PodmanConnection`] | a pre-existing container, via `podman exec` |
//! | [`ManagedSSHConnection`] | SSH with one persistent multiplexed master |
//! | [`StatelessSSHConnection`] | SSH, one session per command |

pub mod local;
pub mod podman;
pub mod ssh;

use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

pub use local::LocalConnection;
pub use podman::PodmanConnection;
pub use ssh::{ManagedSSHConnection, StatelessSSHConnection};

pub type ConnResult<T> = Result<T, ConnectionError>;

/// Errors from connection operations.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    /// Non-blocking `connect` found the transport not yet established.
    /// Never surfaced to users; callers retry.
    #[error("connection not yet established")]
    WouldBlock,

    /// Establishing the transport failed; the connection is left
    /// disconnected and may be retried.
    #[error("failed to connect: {0}")]
    ConnectFailed(String),

    /// The handle was released; only the released flag may be queried.
    #[error("remote released, cannot operate on it")]
    Released,

    /// A command could not be spawned or awaited.
    #[error("failed to execute command: {0}")]
    Exec(String),

    /// An rsync transfer failed.
    #[error("rsync failed: {0}")]
    Rsync(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Captured outcome of a completed command.
#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    fn from_output(output: std::process::Output) -> Self {
        Self {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }
    }
}

/// A transport commands can be executed over.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Establishes the persistent transport, if the variant has one.
    ///
    /// With `block == false`, returns [`ConnectionError::WouldBlock`] while
    /// establishment is still in flight. Idempotent after success; a failed
    /// attempt leaves the connection disconnected.
    async fn connect(&self, block: bool) -> ConnResult<()>;

    /// Tears the persistent transport down. Idempotent.
    async fn disconnect(&self);

    /// Builds the full local command that executes `argv` on the target.
    fn command(&self, argv: &[&str]) -> ConnResult<Command>;

    /// The rsync `-e` remote-shell option for this transport, or `None`
    /// when rsync operates on local paths only.
    fn rsync_rsh(&self) -> ConnResult<Option<String>>;

    /// Runs `argv` on the target to completion, capturing output.
    async fn cmd(&self, argv: &[&str]) -> ConnResult<ExecResult> {
        debug!(?argv, "running command");
        let mut command = self.command(argv)?;
        let output = command
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ConnectionError::Exec(e.to_string()))?;
        Ok(ExecResult::from_output(output))
    }

    /// Spawns `argv` on the target with explicit stdio, Popen-style, for
    /// callers that drive the child's pipes themselves.
    fn spawn(&self, argv: &[&str], stdin: Stdio, stdout: Stdio, stderr: Stdio) -> ConnResult<Child> {
        debug!(?argv, "spawning command");
        let mut command = self.command(argv)?;
        command
            .stdin(stdin)
            .stdout(stdout)
            .stderr(stderr)
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ConnectionError::Exec(e.to_string()))
    }

    /// Runs `rsync` with the given CLI arguments. Remote paths use any
    /// `name:` prefix; the internally-supplied remote-shell option dictates
    /// the actual connection.
    async fn rsync(&self, args: &[&str]) -> ConnResult<ExecResult> {
        let mut command = Command::new("rsync");
        if let Some(rsh) = self.rsync_rsh()? {
            command.arg("-e").arg(rsh);
        }
        command.args(args);
        debug!(?args, "running rsync");
        let output = command
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ConnectionError::Rsync(e.to_string()))?;
        let result = ExecResult::from_output(output);
        if !result.success() {
            return Err(ConnectionError::Rsync(format!(
                "exit code {}: {}",
                result.exit_code,
                result.stderr.trim()
            )));
        }
        Ok(result)
    }
}
