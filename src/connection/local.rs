//! Connection running commands on the current host.

use async_trait::async_trait;
use tokio::process::Command;

use super::{ConnResult, Connection, ConnectionError};

/// Runs commands as plain child processes of the current host.
///
/// Useful for hypervisor hosts reachable without a transport, and as the
/// substrate for tests that script a fake peer with `sh`.
#[derive(Debug, Default)]
pub struct LocalConnection;

impl LocalConnection {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Connection for LocalConnection {
    async fn connect(&self, _block: bool) -> ConnResult<()> {
        Ok(())
    }

    async fn disconnect(&self) {}

    fn command(&self, argv: &[&str]) -> ConnResult<Command> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ConnectionError::Exec("empty argv".into()))?;
        let mut command = Command::new(program);
        command.args(args);
        Ok(command)
    }

    fn rsync_rsh(&self) -> ConnResult<Option<String>> {
        Ok(None)
    }
}
