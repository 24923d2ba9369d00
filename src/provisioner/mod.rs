//! Remote-machine provisioning.
//!
//! A [`Provisioner`] maintains a pool of reserved, connected [`Remote`]
//! systems sized by `provision()` requests and hands them out through
//! `get_remote()`. The one concrete implementation,
//! [`shvirt::SharedVirtProvisioner`], reserves libvirt domains on a shared
//! hypervisor host through the `atex-virt-helper` line-JSON protocol.

pub mod helper;
pub mod shvirt;

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::future::BoxFuture;
use tracing::debug;

use crate::connection::{ConnResult, Connection, ConnectionError, ManagedSSHConnection};

pub use helper::{HelperChannel, HelperError, HelperReply, HelperRequest};
pub use shvirt::{SharedVirtConfig, SharedVirtProvisioner};

/// Errors surfaced by provisioning. Cloneable so a stored reserving-task
/// failure can be re-raised to every waiting `get_remote()` call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProvisionError {
    #[error("the provisioner is stopped")]
    Stopped,

    #[error("helper already launched")]
    AlreadyStarted,

    #[error("reserve name {0:?} is longer than 15 characters")]
    BadReserveName(String),

    #[error("bad pong from remote helper (wrong version?): {0}")]
    BadPong(String),

    #[error("failed to spawn helper: {0}")]
    Spawn(String),

    /// The helper process is gone; all its reservations are released.
    #[error("helper not running, exited with {0}")]
    HelperExited(String),

    /// The helper stdio channel returned an empty line.
    #[error("empty response from helper")]
    ChannelClosed,

    #[error("bad reply from helper: {0}")]
    BadHelperReply(String),

    /// The helper answered, but with `success == false`.
    #[error("failed {op}: {reply}")]
    HelperCommand { op: String, reply: String },

    #[error("failed to connect to {domain}: {reason}")]
    ConnectFailed { domain: String, reason: String },
}

impl From<HelperError> for ProvisionError {
    fn from(err: HelperError) -> Self {
        match err {
            HelperError::Exited(status) => Self::HelperExited(status),
            HelperError::ChannelClosed => Self::ChannelClosed,
            HelperError::BadReply(msg) => Self::BadHelperReply(msg),
            HelperError::Io(e) => Self::BadHelperReply(e.to_string()),
        }
    }
}

/// Reserves remote systems and hands them out once connected.
#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Starts provisioning-related processes (e.g. the helper channel).
    async fn start(&self) -> Result<(), ProvisionError>;

    /// Frees all reserved resources and releases every Remote. Idempotent.
    async fn stop(&self);

    /// Requests that `count` more machines be reserved for later pickup.
    fn provision(&self, count: u32) -> Result<(), ProvisionError>;

    /// Returns a connected Remote reserved earlier.
    ///
    /// Blocking mode waits for one (or for the reserving task's stored
    /// failure, which is then re-raised). Non-blocking mode returns
    /// `Ok(None)` when nothing is ready.
    async fn get_remote(&self, block: bool) -> Result<Option<Remote>, ProvisionError>;
}

/// Callback a Remote runs on release, in addition to disconnecting.
/// A capability back into the owning provisioner, not ownership of it.
pub type ReleaseHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct RemoteShared {
    conn: ManagedSSHConnection,
    host: String,
    domain: String,
    source_image: String,
    released: Mutex<bool>,
    release_hook: Mutex<Option<ReleaseHook>>,
}

/// A reserved remote system: an SSH connection plus release bookkeeping.
///
/// Created by a provisioner's reserving task, connected exactly once,
/// released exactly once. After release every operation except
/// [`released`](Remote::released) fails with [`ConnectionError::Released`].
#[derive(Clone)]
pub struct Remote {
    shared: std::sync::Arc<RemoteShared>,
}

impl Remote {
    pub fn new(
        ssh_options: BTreeMap<String, String>,
        host: impl Into<String>,
        domain: impl Into<String>,
        source_image: impl Into<String>,
        release_hook: ReleaseHook,
    ) -> ConnResult<Self> {
        Ok(Self {
            shared: std::sync::Arc::new(RemoteShared {
                conn: ManagedSSHConnection::new(ssh_options)?,
                host: host.into(),
                domain: domain.into(),
                source_image: source_image.into(),
                released: Mutex::new(false),
                release_hook: Mutex::new(Some(release_hook)),
            }),
        })
    }

    pub fn domain(&self) -> &str {
        &self.shared.domain
    }

    pub fn released(&self) -> bool {
        *self.shared.released.lock().unwrap()
    }

    /// Releases the reservation: disconnects and runs the release hook.
    /// Only the first call does anything.
    pub async fn release(&self) {
        if !self.latch_released() {
            return;
        }
        self.shared.conn.disconnect().await;
        let hook = self.shared.release_hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook().await;
        }
    }

    /// Marks the Remote released and disconnects, without running the hook.
    /// Used by provisioner shutdown, where terminating the helper releases
    /// every reservation globally.
    pub(crate) async fn invalidate(&self) {
        self.latch_released();
        self.shared.release_hook.lock().unwrap().take();
        self.shared.conn.disconnect().await;
    }

    /// Flips the released latch; true if this call flipped it.
    fn latch_released(&self) -> bool {
        let mut released = self.shared.released.lock().unwrap();
        !std::mem::replace(&mut *released, true)
    }

    fn check_alive(&self) -> ConnResult<()> {
        if self.released() {
            Err(ConnectionError::Released)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Connection for Remote {
    async fn connect(&self, block: bool) -> ConnResult<()> {
        self.check_alive()?;
        self.shared.conn.connect(block).await
    }

    async fn disconnect(&self) {
        debug!(remote = %self, "disconnecting");
        self.shared.conn.disconnect().await;
    }

    fn command(&self, argv: &[&str]) -> ConnResult<tokio::process::Command> {
        self.check_alive()?;
        self.shared.conn.command(argv)
    }

    fn rsync_rsh(&self) -> ConnResult<Option<String>> {
        self.check_alive()?;
        self.shared.conn.rsync_rsh()
    }
}

impl std::fmt::Display for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let port = self
            .shared
            .conn
            .options()
            .get("Port")
            .map(String::as_str)
            .unwrap_or("?");
        write!(
            f,
            "{}, {} ({}), {}",
            self.shared.host, self.shared.domain, port, self.shared.source_image
        )
    }
}

impl std::fmt::Debug for Remote {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Remote")
            .field("host", &self.shared.host)
            .field("domain", &self.shared.domain)
            .field("source_image", &self.shared.source_image)
            .field("released", &self.released())
            .finish()
    }
}
