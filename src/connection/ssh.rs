//! SSH-backed connections.
//!
//! Both variants drive the system `ssh` client and are configured through
//! an option map passed as `-o Key=Value` pairs (`Hostname`, `User`,
//! `Port`, `IdentityFile`, …). The positional destination is a fixed label;
//! `Hostname` in the options dictates where the client actually connects,
//! which also makes the `remote:` prefix in rsync paths a don't-care.
//!
//! [`ManagedSSHConnection`] keeps one multiplexed control master alive
//! (`ssh -M -N -S <socket>`) and opens every command as a cheap multiplexed
//! session over its socket. [`StatelessSSHConnection`] opens a full session
//! per command.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::debug;

use super::{ConnResult, Connection, ConnectionError};

/// Fixed positional ssh destination; the `Hostname` option wins over it.
const DESTINATION: &str = "atex";

/// Health-poll interval while waiting for the control master.
const CONNECT_POLL: Duration = Duration::from_millis(100);

/// SSH option map, ordered for stable argv (and stable logs).
pub type SshOptions = BTreeMap<String, String>;

fn option_args(options: &SshOptions) -> Vec<String> {
    let mut args = Vec::with_capacity(options.len() * 2 + 2);
    for (key, value) in options {
        let value = if key == "IdentityFile" {
            shellexpand::tilde(value).into_owned()
        } else {
            value.clone()
        };
        args.push("-o".into());
        args.push(format!("{key}={value}"));
    }
    args.push("-o".into());
    args.push("BatchMode=yes".into());
    args
}

/// Joins argv into the single remote command string ssh expects, quoting
/// each argument for the remote shell.
fn remote_command(argv: &[&str]) -> String {
    shell_words::join(argv)
}

/// SSH connection multiplexed over a persistent control master.
pub struct ManagedSSHConnection {
    options: SshOptions,
    /// Holds the control socket; removed with the connection.
    control_dir: tempfile::TempDir,
    control_path: PathBuf,
    state: tokio::sync::Mutex<MasterState>,
}

#[derive(Default)]
struct MasterState {
    master: Option<Child>,
    connected: bool,
}

impl ManagedSSHConnection {
    pub fn new(options: SshOptions) -> ConnResult<Self> {
        let control_dir = tempfile::Builder::new()
            .prefix("atex-ssh-")
            .tempdir()
            .map_err(ConnectionError::Io)?;
        let control_path = control_dir.path().join("control");
        Ok(Self {
            options,
            control_dir,
            control_path,
            state: tokio::sync::Mutex::new(MasterState::default()),
        })
    }

    pub fn options(&self) -> &SshOptions {
        &self.options
    }

    fn control_args(&self) -> [String; 2] {
        ["-S".into(), self.control_path.display().to_string()]
    }

    async fn check_master(&self) -> bool {
        let mut command = Command::new("ssh");
        command.args(self.control_args());
        command.args(["-O", "check", DESTINATION]);
        command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
        matches!(command.status().await, Ok(status) if status.success())
    }

    fn spawn_master(&self) -> ConnResult<Child> {
        let mut command = Command::new("ssh");
        command.args(option_args(&self.options));
        command.args(self.control_args());
        command.args(["-M", "-N", DESTINATION]);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        debug!(control = %self.control_path.display(), "spawning ssh control master");
        command
            .spawn()
            .map_err(|e| ConnectionError::ConnectFailed(e.to_string()))
    }
}

#[async_trait]
impl Connection for ManagedSSHConnection {
    async fn connect(&self, block: bool) -> ConnResult<()> {
        let mut state = self.state.lock().await;

        loop {
            if state.master.is_none() {
                state.connected = false;
                state.master = Some(self.spawn_master()?);
            }

            // a dead master means the attempt failed (refused, kex error,
            // auth); reap it so the next call starts fresh
            let master = state.master.as_mut().unwrap();
            if let Some(status) = master.try_wait().map_err(ConnectionError::Io)? {
                state.master = None;
                state.connected = false;
                return Err(ConnectionError::ConnectFailed(format!(
                    "ssh control master exited with {status}"
                )));
            }

            if self.check_master().await {
                state.connected = true;
                return Ok(());
            }

            if !block {
                return Err(ConnectionError::WouldBlock);
            }
            tokio::time::sleep(CONNECT_POLL).await;
        }
    }

    async fn disconnect(&self) {
        let mut state = self.state.lock().await;
        state.connected = false;
        if let Some(mut master) = state.master.take() {
            let mut command = Command::new("ssh");
            command.args(self.control_args());
            command.args(["-O", "exit", DESTINATION]);
            command.stdin(Stdio::null()).stdout(Stdio::null()).stderr(Stdio::null());
            let _ = command.status().await;
            let _ = master.kill().await;
        }
        let _ = std::fs::remove_file(&self.control_path);
    }

    fn command(&self, argv: &[&str]) -> ConnResult<Command> {
        if argv.is_empty() {
            return Err(ConnectionError::Exec("empty argv".into()));
        }
        let mut command = Command::new("ssh");
        command.args(self.control_args());
        command.args(["-o", "BatchMode=yes", DESTINATION, "--"]);
        command.arg(remote_command(argv));
        Ok(command)
    }

    fn rsync_rsh(&self) -> ConnResult<Option<String>> {
        Ok(Some(format!(
            "ssh -S {} -o BatchMode=yes",
            shell_words::quote(&self.control_path.display().to_string())
        )))
    }
}

impl std::fmt::Debug for ManagedSSHConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedSSHConnection")
            .field("options", &self.options)
            .field("control", &self.control_dir.path())
            .finish()
    }
}

/// SSH connection opening one full session per command.
#[derive(Debug)]
pub struct StatelessSSHConnection {
    options: SshOptions,
}

impl StatelessSSHConnection {
    pub fn new(options: SshOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &SshOptions {
        &self.options
    }
}

#[async_trait]
impl Connection for StatelessSSHConnection {
    /// There is no persistent channel; sessions are established per
    /// command, so this only exists to satisfy the interface.
    async fn connect(&self, _block: bool) -> ConnResult<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    fn command(&self, argv: &[&str]) -> ConnResult<Command> {
        if argv.is_empty() {
            return Err(ConnectionError::Exec("empty argv".into()));
        }
        let mut command = Command::new("ssh");
        command.args(option_args(&self.options));
        command.args([DESTINATION, "--"]);
        command.arg(remote_command(argv));
        Ok(command)
    }

    fn rsync_rsh(&self) -> ConnResult<Option<String>> {
        let args = option_args(&self.options)
            .into_iter()
            .map(|a| shell_words::quote(&a).into_owned())
            .collect::<Vec<_>>()
            .join(" ");
        Ok(Some(format!("ssh {args}")))
    }
}
