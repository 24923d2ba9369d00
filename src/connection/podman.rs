//! Connection into an already-running podman container.

use async_trait::async_trait;
use tokio::process::Command;

use super::{ConnResult, Connection, ConnectionError};

/// Runs commands via `podman container exec` on an existing container.
///
/// Image pulling and container lifecycle are the caller's business; this
/// type only executes inside a container that is already up.
#[derive(Debug)]
pub struct PodmanConnection {
    container: String,
}

impl PodmanConnection {
    pub fn new(container: impl Into<String>) -> Self {
        Self {
            container: container.into(),
        }
    }
}

#[async_trait]
impl Connection for PodmanConnection {
    async fn connect(&self, _block: bool) -> ConnResult<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    fn command(&self, argv: &[&str]) -> ConnResult<Command> {
        if argv.is_empty() {
            return Err(ConnectionError::Exec("empty argv".into()));
        }
        let mut command = Command::new("podman");
        command.args(["container", "exec", "-i", &self.container]);
        command.args(argv);
        Ok(command)
    }

    fn rsync_rsh(&self) -> ConnResult<Option<String>> {
        // shell wrapper strips the destination argument rsync inserts:
        //   cmd[0]=/bin/bash cmd[1]=-c cmd[2]=exec podman ... cmd[3]=destination
        Ok(Some(format!(
            "/bin/bash -c 'exec podman container exec -i {} \"$@\"'",
            self.container
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argv_is_prefixed_with_container_exec() {
        let conn = PodmanConnection::new("box");
        let command = conn.command(&["cat", "/etc/os-release"]).unwrap();
        let std = command.as_std();
        assert_eq!(std.get_program(), "podman");
        let args: Vec<_> = std.get_args().map(|a| a.to_str().unwrap()).collect();
        assert_eq!(
            args,
            vec!["container", "exec", "-i", "box", "cat", "/etc/os-release"]
        );
    }

    #[test]
    fn rsync_rsh_execs_into_the_container() {
        let conn = PodmanConnection::new("box");
        let rsh = conn.rsync_rsh().unwrap().unwrap();
        assert!(rsh.contains("podman container exec -i box"));
    }
}
