//! Domain reservation on a shared libvirt host.
//!
//! [`SharedVirtProvisioner`] talks to `atex-virt-helper` on the hypervisor
//! host (spawned over any [`Connection`]) and maintains a pool of cloned,
//! booted, SSH-connected guests.
//!
//! One background reserving task owns all pool side-effects: it reserves a
//! domain, clones the source image onto its disk, starts the guest, waits
//! for sshd to answer with the `SSH-` signature, connects a [`Remote`] and
//! publishes it. Each published Remote releases one permit on a wake
//! semaphore, which is the only signalling path to `get_remote()`. If the
//! task fails, the failure is stored, the pool is torn down, and the
//! semaphore is raised to its maximum so every waiter wakes and re-reads
//! the stored failure, before consuming any previously published Remote
//! would succeed.

use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use quick_xml::events::Event;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{
    HelperChannel, HelperRequest, Provisioner, ProvisionError, ReleaseHook, Remote,
};
use crate::connection::{Connection, ConnectionError};

/// Poll interval for all cancellable waits in the reserving task.
const POLL: Duration = Duration::from_millis(100);

/// Budget for a connected peer to present the `SSH-` signature.
const SSHD_REPLY_BUDGET: Duration = Duration::from_secs(5);

/// Transport-level connect retries before giving up on a guest
/// (with the 100 ms pacing, roughly five minutes).
const CONNECT_RETRIES: u32 = 3000;

/// PR_SET_NAME limit the helper enforces on reservation names.
const RESERVE_NAME_MAX: usize = 15;

const XPATH_PORT_FORWARD: &str =
    "//devices/interface[backend/@type='passt']/portForward/range";

/// Configuration of a [`SharedVirtProvisioner`].
#[derive(Debug, Clone)]
pub struct SharedVirtConfig {
    /// Source volume name inside `pool`, cloned onto each reserved domain.
    pub image: String,
    /// Storage pool holding both the domains' disks and the source image.
    pub pool: String,
    /// Regex of domain names eligible for reservation, e.g. `auto-.*`.
    pub domain_filter: Option<String>,
    /// Credentials baked into the pre-installed image.
    pub domain_user: String,
    /// Private key path for `domain_user`.
    pub domain_sshkey: std::path::PathBuf,
    /// Host or address the domains' forwarded SSH ports are reachable on
    /// (for an SSH-connected hypervisor, its hostname; locally, 127.0.0.1).
    pub domain_host: String,
    /// Pause between reservations, reducing reservation bursts.
    pub reserve_delay: Duration,
    /// User-visible label for this client's reservations (≤ 15 chars).
    pub reserve_name: Option<String>,
    /// Helper executable (argv) on the hypervisor host.
    pub helper_command: Vec<String>,
}

impl SharedVirtConfig {
    pub fn new(
        image: impl Into<String>,
        domain_sshkey: impl Into<std::path::PathBuf>,
        domain_host: impl Into<String>,
    ) -> Self {
        Self {
            image: image.into(),
            pool: "default".into(),
            domain_filter: None,
            domain_user: "root".into(),
            domain_sshkey: domain_sshkey.into(),
            domain_host: domain_host.into(),
            reserve_delay: Duration::from_secs(3),
            reserve_name: None,
            helper_command: vec!["atex-virt-helper".into()],
        }
    }
}

struct Pool {
    started: bool,
    to_reserve: i64,
    /// Every Remote this provisioner currently holds.
    remotes: Vec<Remote>,
    /// Remotes reserved but not yet handed out; always a subset of
    /// `remotes`, popped in reservation-completion order.
    reserving_remotes: VecDeque<Remote>,
    reserving_task: Option<JoinHandle<()>>,
    cancel: CancellationToken,
}

struct Inner {
    config: SharedVirtConfig,
    host: Arc<dyn Connection>,
    helper: tokio::sync::Mutex<Option<HelperChannel>>,
    pool: Mutex<Pool>,
    /// Replaced on every `start()` so a restart begins with zero permits.
    wake: Mutex<Arc<Semaphore>>,
    failure: Mutex<Option<ProvisionError>>,
}

/// Provisioner reserving domains on a shared libvirt host.
pub struct SharedVirtProvisioner {
    inner: Arc<Inner>,
}

impl SharedVirtProvisioner {
    pub fn new(host: Arc<dyn Connection>, config: SharedVirtConfig) -> Result<Self, ProvisionError> {
        if let Some(name) = &config.reserve_name
            && name.len() > RESERVE_NAME_MAX
        {
            return Err(ProvisionError::BadReserveName(name.clone()));
        }
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                host,
                helper: tokio::sync::Mutex::new(None),
                pool: Mutex::new(Pool {
                    started: false,
                    to_reserve: 0,
                    remotes: Vec::new(),
                    reserving_remotes: VecDeque::new(),
                    reserving_task: None,
                    cancel: CancellationToken::new(),
                }),
                wake: Mutex::new(Arc::new(Semaphore::new(0))),
                failure: Mutex::new(None),
            }),
        })
    }

    fn sanity_check(&self) -> Result<(), ProvisionError> {
        if let Some(failure) = self.inner.failure.lock().unwrap().clone() {
            return Err(failure);
        }
        if !self.inner.pool.lock().unwrap().started {
            return Err(ProvisionError::Stopped);
        }
        Ok(())
    }
}

#[async_trait]
impl Provisioner for SharedVirtProvisioner {
    async fn start(&self) -> Result<(), ProvisionError> {
        let inner = &self.inner;
        let mut helper_guard = inner.helper.lock().await;
        if helper_guard.is_some() {
            return Err(ProvisionError::AlreadyStarted);
        }

        let argv: Vec<&str> = inner.config.helper_command.iter().map(String::as_str).collect();
        let mut helper = HelperChannel::spawn(&*inner.host, &argv)
            .map_err(|e| ProvisionError::Spawn(e.to_string()))?;

        // make sure we are talking to a compatible helper
        let pong = helper.request(&HelperRequest::Ping).await?;
        if pong.cmd.as_deref() != Some("ping") || pong.reply_str() != "atex-virt-helper v1 pong" {
            helper.terminate().await;
            return Err(ProvisionError::BadPong(format!("{pong:?}")));
        }

        if let Some(name) = &inner.config.reserve_name {
            let reply = helper
                .request(&HelperRequest::Setname { name: name.clone() })
                .await?;
            if !reply.success {
                helper.terminate().await;
                return Err(ProvisionError::HelperCommand {
                    op: "setname".into(),
                    reply: reply.reply_str().into(),
                });
            }
        }

        *helper_guard = Some(helper);

        // fresh session: zero the wake counter (it may have been raised to
        // the maximum by a previous failure) and clear the stored failure
        *inner.wake.lock().unwrap() = Arc::new(Semaphore::new(0));
        *inner.failure.lock().unwrap() = None;
        let mut pool = inner.pool.lock().unwrap();
        pool.started = true;
        pool.to_reserve = 0;
        pool.cancel = CancellationToken::new();
        Ok(())
    }

    async fn stop(&self) {
        let inner = &self.inner;

        let (task, cancel) = {
            let mut pool = inner.pool.lock().unwrap();
            pool.started = false;
            pool.to_reserve = 0;
            (pool.reserving_task.take(), pool.cancel.clone())
        };
        cancel.cancel();
        if let Some(task) = task {
            let _ = task.await;
        }

        // disconnect all Remotes so nobody keeps using port-forwarded
        // connections after the helper termination below releases them all
        let remotes = {
            let mut pool = inner.pool.lock().unwrap();
            pool.reserving_remotes.clear();
            std::mem::take(&mut pool.remotes)
        };
        for remote in remotes {
            remote.invalidate().await;
        }

        if let Some(mut helper) = inner.helper.lock().await.take() {
            helper.terminate().await;
        }
    }

    fn provision(&self, count: u32) -> Result<(), ProvisionError> {
        self.sanity_check()?;

        let mut pool = self.inner.pool.lock().unwrap();
        pool.to_reserve += i64::from(count);
        if pool.to_reserve <= 0 {
            return Ok(());
        }
        let running = pool
            .reserving_task
            .as_ref()
            .is_some_and(|task| !task.is_finished());
        if !running {
            let inner = Arc::clone(&self.inner);
            let cancel = pool.cancel.clone();
            let wake = self.inner.wake.lock().unwrap().clone();
            pool.reserving_task = Some(tokio::spawn(reserve_wrapper(inner, cancel, wake)));
        }
        Ok(())
    }

    async fn get_remote(&self, block: bool) -> Result<Option<Remote>, ProvisionError> {
        self.sanity_check()?;

        let wake = self.inner.wake.lock().unwrap().clone();
        if block {
            match wake.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(self.stored_failure()),
            }
        } else {
            match wake.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(_) => return Ok(None),
            }
        }

        let popped = self.inner.pool.lock().unwrap().reserving_remotes.pop_front();
        match popped {
            Some(remote) => Ok(Some(remote)),
            // the permit was a failure wake; re-raise what the reserving
            // task stored
            None => Err(self.stored_failure()),
        }
    }
}

impl SharedVirtProvisioner {
    fn stored_failure(&self) -> ProvisionError {
        self.inner
            .failure
            .lock()
            .unwrap()
            .clone()
            .unwrap_or(ProvisionError::Stopped)
    }
}

impl std::fmt::Debug for SharedVirtProvisioner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let pool = self.inner.pool.lock().unwrap();
        f.debug_struct("SharedVirtProvisioner")
            .field("domain_host", &self.inner.config.domain_host)
            .field("domain_filter", &self.inner.config.domain_filter)
            .field("remotes", &pool.remotes.len())
            .field("to_reserve", &pool.to_reserve)
            .finish()
    }
}

/// Runs the reserving loop; on failure records it and tears the pool down.
/// Failure recording is deliberately decoupled from `stop()`; this task
/// never re-enters the public shutdown path.
async fn reserve_wrapper(inner: Arc<Inner>, cancel: CancellationToken, wake: Arc<Semaphore>) {
    match reserve_loop(&inner, &cancel, &wake).await {
        Ok(()) => debug!("reserve task exited cleanly"),
        Err(err) => {
            debug!("reserve task got {err}");
            fail(&inner, err, &wake).await;
        }
    }
}

async fn fail(inner: &Arc<Inner>, err: ProvisionError, wake: &Semaphore) {
    inner.failure.lock().unwrap().get_or_insert(err);

    let remotes = {
        let mut pool = inner.pool.lock().unwrap();
        pool.started = false;
        pool.to_reserve = 0;
        pool.reserving_task = None;
        pool.reserving_remotes.clear();
        std::mem::take(&mut pool.remotes)
    };
    for remote in remotes {
        remote.invalidate().await;
    }
    if let Some(mut helper) = inner.helper.lock().await.take() {
        helper.terminate().await;
    }

    // wake every pending get_remote() so it re-reads the stored failure
    let available = wake.available_permits();
    wake.add_permits(Semaphore::MAX_PERMITS - available);
}

async fn reserve_loop(
    inner: &Arc<Inner>,
    cancel: &CancellationToken,
    wake: &Semaphore,
) -> Result<(), ProvisionError> {
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        // `stop()` may floor the counter from outside; re-read every turn
        if inner.pool.lock().unwrap().to_reserve <= 0 {
            return Ok(());
        }

        let reserved = {
            let helper_section = async {
                let mut guard = inner.helper.lock().await;
                let helper = guard.as_mut().ok_or(ProvisionError::Stopped)?;
                if let Some(status) = helper.poll_exit() {
                    return Err(ProvisionError::HelperExited(status));
                }
                reserve_domain(helper, &inner.config).await
            };
            match until_cancelled(cancel, helper_section).await {
                Some(result) => result?,
                None => return Ok(()),
            }
        };

        let Some((domain, port)) = reserved else {
            // nothing reservable right now, back off
            if wait_or_cancelled(cancel, inner.config.reserve_delay).await {
                return Ok(());
            }
            continue;
        };

        debug!("waiting for sshd on {domain} at {}:{port}", inner.config.domain_host);
        if !wait_for_sshd(&inner.config.domain_host, port, cancel).await {
            return Ok(());
        }

        let remote = new_remote(inner, &domain, port)?;
        debug!(remote = %remote, "connecting");
        match connect_with_retries(&remote, cancel).await {
            Ok(true) => {}
            Ok(false) => {
                remote.disconnect().await;
                return Ok(());
            }
            Err(err) => {
                remote.disconnect().await;
                return Err(err);
            }
        }

        debug!(remote = %remote, "appending");
        {
            let mut pool = inner.pool.lock().unwrap();
            pool.remotes.push(remote.clone());
            pool.reserving_remotes.push_back(remote);
            pool.to_reserve -= 1;
        }
        wake.add_permits(1);

        if wait_or_cancelled(cancel, inner.config.reserve_delay).await {
            return Ok(());
        }
    }
}

/// One domain reservation round-trip: reserve, destroy, clone the image,
/// find the forwarded port, start the guest. `Ok(None)` means nothing was
/// reservable and the caller should back off.
///
/// Failures after a successful `reserve` deliberately skip `release`: the
/// stdio channel may be the thing that is broken, and terminating the
/// helper releases everything anyway.
async fn reserve_domain(
    helper: &mut HelperChannel,
    config: &SharedVirtConfig,
) -> Result<Option<(String, u16)>, ProvisionError> {
    let reply = helper
        .request(&HelperRequest::Reserve {
            filter: config.domain_filter.clone(),
        })
        .await?;
    if !reply.success {
        if reply.reply_str() == "no domain could be reserved" {
            return Ok(None);
        }
        return Err(ProvisionError::HelperCommand {
            op: "reserve".into(),
            reply: reply.reply_str().into(),
        });
    }
    let domain = reply.domain.clone().ok_or_else(|| {
        ProvisionError::BadHelperReply("reserve reply carries no domain".into())
    })?;
    debug!("reserved domain {domain}");

    // may already be shut off
    let reply = helper
        .request(&HelperRequest::Virsh {
            args: vec!["destroy".into(), domain.clone()],
        })
        .await?;
    if reply.success {
        debug!("destroyed domain {domain}");
    }

    let reply = helper
        .request(&HelperRequest::VolCopy {
            pool: config.pool.clone(),
            from: config.image.clone(),
            to_domain: domain.clone(),
        })
        .await?;
    if !reply.success {
        return Err(ProvisionError::HelperCommand {
            op: "vol-copy".into(),
            reply: reply.reply_str().into(),
        });
    }
    debug!("vol-copied {} to {domain}", config.image);

    let reply = helper
        .request(&HelperRequest::Virsh {
            args: vec![
                "dumpxml".into(),
                domain.clone(),
                "--xpath".into(),
                XPATH_PORT_FORWARD.into(),
            ],
        })
        .await?;
    if !reply.success {
        return Err(ProvisionError::HelperCommand {
            op: format!("virsh dumpxml {domain}"),
            reply: reply.reply_str().into(),
        });
    }
    // first <range> element only
    let first_range = reply.reply_str().lines().next().unwrap_or("");
    debug!("found portForward range {first_range}");
    let port = parse_port_forward_range(first_range).ok_or_else(|| {
        ProvisionError::BadHelperReply(format!("unparsable portForward range: {first_range:?}"))
    })?;

    let reply = helper
        .request(&HelperRequest::Virsh {
            args: vec!["start".into(), domain.clone()],
        })
        .await?;
    if !reply.success {
        return Err(ProvisionError::HelperCommand {
            op: format!("virsh start {domain}"),
            reply: reply.reply_str().into(),
        });
    }
    debug!("started up {domain}");

    Ok(Some((domain, port)))
}

fn new_remote(inner: &Arc<Inner>, domain: &str, port: u16) -> Result<Remote, ProvisionError> {
    let config = &inner.config;
    let sshkey = std::path::absolute(&config.domain_sshkey)
        .unwrap_or_else(|_| config.domain_sshkey.clone());
    let ssh_options = BTreeMap::from([
        ("Hostname".to_owned(), config.domain_host.clone()),
        ("User".to_owned(), config.domain_user.clone()),
        ("Port".to_owned(), port.to_string()),
        ("IdentityFile".to_owned(), sshkey.display().to_string()),
        ("ConnectionAttempts".to_owned(), "1000".to_owned()),
        ("Compression".to_owned(), "yes".to_owned()),
    ]);

    let weak = Arc::downgrade(inner);
    let hook_domain = domain.to_owned();
    let hook: ReleaseHook = Box::new(move || Box::pin(release_domain(weak, hook_domain)));

    Remote::new(ssh_options, &config.domain_host, domain, &config.image, hook)
        .map_err(|e| ProvisionError::ConnectFailed {
            domain: domain.to_owned(),
            reason: e.to_string(),
        })
}

/// Release hook body: forget the Remote pool-side and tell the helper.
async fn release_domain(inner: Weak<Inner>, domain: String) {
    let Some(inner) = inner.upgrade() else {
        return;
    };
    {
        let mut pool = inner.pool.lock().unwrap();
        pool.remotes.retain(|r| r.domain() != domain);
        pool.reserving_remotes.retain(|r| r.domain() != domain);
    }
    let mut guard = inner.helper.lock().await;
    let Some(helper) = guard.as_mut() else {
        return;
    };
    match helper
        .request(&HelperRequest::Release {
            domain: domain.clone(),
        })
        .await
    {
        Ok(reply) if reply.success => debug!("released domain {domain}"),
        Ok(reply) => warn!("failed to release {domain}: {}", reply.reply_str()),
        Err(err) => warn!("failed to release {domain}: {err}"),
    }
}

async fn connect_with_retries(
    remote: &Remote,
    cancel: &CancellationToken,
) -> Result<bool, ProvisionError> {
    let mut retries = 0u32;
    loop {
        if wait_or_cancelled(cancel, POLL).await {
            return Ok(false);
        }
        match remote.connect(false).await {
            Ok(()) => return Ok(true),
            Err(ConnectionError::WouldBlock) => {}
            Err(ConnectionError::ConnectFailed(reason)) => {
                // with passt or SLIRP, the user networking binary accepts
                // the TCP connection before the guest sshd listens, which
                // ends in a kex disconnect; retry while the guest boots
                retries += 1;
                if retries > CONNECT_RETRIES {
                    return Err(ProvisionError::ConnectFailed {
                        domain: remote.domain().to_owned(),
                        reason,
                    });
                }
            }
            Err(other) => {
                return Err(ProvisionError::ConnectFailed {
                    domain: remote.domain().to_owned(),
                    reason: other.to_string(),
                });
            }
        }
    }
}

/// Waits for a real OpenSSH server to answer on `host:port`.
///
/// Retries failed connects on a fresh socket; a peer that accepts but does
/// not present the `SSH-` signature within 5 seconds is also retried.
/// Returns false when cancelled.
pub(crate) async fn wait_for_sshd(host: &str, port: u16, cancel: &CancellationToken) -> bool {
    let addr = format!("{host}:{port}");
    loop {
        let connected = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            result = TcpStream::connect(&addr) => result,
        };
        let mut stream = match connected {
            Ok(stream) => stream,
            Err(_) => {
                debug!("connection attempt to sshd failed, re-trying");
                if wait_or_cancelled(cancel, POLL).await {
                    return false;
                }
                continue;
            }
        };

        let mut signature = [0u8; 4];
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return false,
            result = tokio::time::timeout(
                SSHD_REPLY_BUDGET,
                stream.read_exact(&mut signature),
            ) => result,
        };
        match read {
            Ok(Ok(_)) if &signature == b"SSH-" => return true,
            _ => {
                debug!("connected to sshd, but no signature, re-trying");
                if wait_or_cancelled(cancel, POLL).await {
                    return false;
                }
            }
        }
    }
}

/// Extracts the `start` port from the first `<range start=… end=…/>`
/// element of a `virsh dumpxml --xpath` fragment.
fn parse_port_forward_range(xml: &str) -> Option<u16> {
    let mut reader = quick_xml::Reader::from_str(xml);
    loop {
        match reader.read_event().ok()? {
            Event::Start(element) | Event::Empty(element)
                if element.name().as_ref() == b"range" =>
            {
                let attr = element
                    .attributes()
                    .flatten()
                    .find(|a| a.key.as_ref() == b"start")?;
                return std::str::from_utf8(&attr.value).ok()?.trim().parse().ok();
            }
            Event::Eof => return None,
            _ => {}
        }
    }
}

/// True if `cancel` fired within `duration`.
async fn wait_or_cancelled(cancel: &CancellationToken, duration: Duration) -> bool {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

async fn until_cancelled<T>(
    cancel: &CancellationToken,
    future: impl std::future::Future<Output = T>,
) -> Option<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        value = future => Some(value),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::LocalConnection;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn port_forward_range_parsing() {
        assert_eq!(
            parse_port_forward_range(r#"<range start='10022' to='22'/>"#),
            Some(10022)
        );
        assert_eq!(
            parse_port_forward_range(r#"<range start="10023" to="22"></range>"#),
            Some(10023)
        );
        assert_eq!(parse_port_forward_range("<range to='22'/>"), None);
        assert_eq!(parse_port_forward_range("no xml here"), None);
        assert_eq!(parse_port_forward_range(""), None);
    }

    #[test]
    fn reserve_name_length_is_validated() {
        let mut config = SharedVirtConfig::new("img", "/dev/null", "127.0.0.1");
        config.reserve_name = Some("exactly-15-char".into());
        assert!(SharedVirtProvisioner::new(Arc::new(LocalConnection), config.clone()).is_ok());

        config.reserve_name = Some("sixteen-chars-xx".into());
        assert!(matches!(
            SharedVirtProvisioner::new(Arc::new(LocalConnection), config),
            Err(ProvisionError::BadReserveName(_))
        ));
    }

    // ----- sshd signature wait -------------------------------------------

    #[tokio::test]
    async fn sshd_wait_accepts_the_signature() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
        });

        let cancel = CancellationToken::new();
        assert!(wait_for_sshd("127.0.0.1", port, &cancel).await);
    }

    #[tokio::test]
    async fn sshd_wait_rejects_wrong_signature_then_retries() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            // first peer: wrong protocol, closed right away
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"HTTP/1.1 400\r\n").await.unwrap();
            drop(sock);
            // second peer: the real thing
            let (mut sock, _) = listener.accept().await.unwrap();
            sock.write_all(b"SSH-2.0-OpenSSH_9.6\r\n").await.unwrap();
        });

        let cancel = CancellationToken::new();
        assert!(wait_for_sshd("127.0.0.1", port, &cancel).await);
    }

    #[tokio::test]
    async fn sshd_wait_is_cancellable() {
        // nothing listens on this port of TEST-NET; connect hangs or fails
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(!wait_for_sshd("127.0.0.1", 1, &cancel).await);
    }

    // ----- reservation round-trip over a scripted helper ------------------

    fn scripted_helper(replies: Vec<&'static str>) -> (HelperChannel, tokio::task::JoinHandle<Vec<String>>) {
        let (client_w, helper_r) = tokio::io::duplex(65536);
        let (helper_w, client_r) = tokio::io::duplex(65536);
        let peer = tokio::spawn(async move {
            let mut received = Vec::new();
            let mut lines = BufReader::new(helper_r).lines();
            let mut helper_w = helper_w;
            for reply in replies {
                match lines.next_line().await.unwrap() {
                    Some(line) => received.push(line),
                    None => break,
                }
                helper_w.write_all(format!("{reply}\n").as_bytes()).await.unwrap();
            }
            received
        });
        (HelperChannel::from_streams(client_w, client_r), peer)
    }

    #[tokio::test]
    async fn reserve_domain_full_transcript() {
        let (mut helper, peer) = scripted_helper(vec![
            r#"{"success": false, "reply": "no domain could be reserved"}"#,
            r#"{"success": true, "domain": "auto-01"}"#,
            r#"{"success": false, "reply": "domain is not running"}"#,
            r#"{"success": true, "reply": "copied"}"#,
            r#"{"success": true, "reply": "<range start='10022' to='22'/>\n<range start='10122' to='9090'/>"}"#,
            r#"{"success": true, "reply": "Domain 'auto-01' started"}"#,
        ]);
        let mut config = SharedVirtConfig::new("base.qcow2", "/dev/null", "127.0.0.1");
        config.domain_filter = Some("auto-.*".into());

        // first round: nothing reservable
        assert!(reserve_domain(&mut helper, &config).await.unwrap().is_none());
        // second round: the whole clone-and-boot flow
        let (domain, port) = reserve_domain(&mut helper, &config).await.unwrap().unwrap();
        assert_eq!(domain, "auto-01");
        assert_eq!(port, 10022);

        drop(helper);
        let transcript = peer.await.unwrap();
        assert_eq!(transcript.len(), 6);
        assert!(transcript[0].contains(r#""cmd":"reserve""#));
        assert!(transcript[0].contains("auto-.*"));
        assert!(transcript[1].contains(r#""cmd":"reserve""#));
        assert!(transcript[2].contains(r#""args":["destroy","auto-01"]"#));
        assert!(transcript[3].contains(r#""cmd":"vol-copy""#));
        assert!(transcript[4].contains("dumpxml"));
        assert!(transcript[5].contains(r#""args":["start","auto-01"]"#));
    }

    #[tokio::test]
    async fn reserve_domain_surfaces_vol_copy_failure() {
        let (mut helper, _peer) = scripted_helper(vec![
            r#"{"success": true, "domain": "auto-01"}"#,
            r#"{"success": true, "reply": ""}"#,
            r#"{"success": false, "reply": "no space left"}"#,
        ]);
        let config = SharedVirtConfig::new("base.qcow2", "/dev/null", "127.0.0.1");
        match reserve_domain(&mut helper, &config).await {
            Err(ProvisionError::HelperCommand { op, reply }) => {
                assert_eq!(op, "vol-copy");
                assert_eq!(reply, "no space left");
            }
            other => panic!("expected vol-copy failure, got {other:?}"),
        }
    }

    // ----- provisioner lifecycle over sh-scripted helpers ------------------

    fn sh_provisioner(script: &str) -> SharedVirtProvisioner {
        let mut config = SharedVirtConfig::new("base.qcow2", "/dev/null", "127.0.0.1");
        config.reserve_delay = Duration::from_millis(10);
        config.helper_command = vec!["sh".into(), "-c".into(), script.into()];
        SharedVirtProvisioner::new(Arc::new(LocalConnection), config).unwrap()
    }

    const PONG: &str =
        r#"{"cmd": "ping", "reply": "atex-virt-helper v1 pong", "success": true}"#;

    #[tokio::test]
    async fn helper_death_wakes_waiters_with_the_stored_failure() {
        let prov = sh_provisioner(&format!(
            "read line; echo '{PONG}'\n\
             read line; echo '{{\"success\": true, \"domain\": \"auto-01\"}}'\n\
             exit 7"
        ));
        prov.start().await.unwrap();
        prov.provision(1).unwrap();

        // the reserve succeeds, then the very next helper round-trip hits
        // the dead process; the stored failure must reach a blocked waiter
        let err = prov.get_remote(true).await.unwrap_err();
        assert!(
            matches!(
                err,
                ProvisionError::HelperExited(_) | ProvisionError::ChannelClosed
            ),
            "unexpected failure kind: {err}"
        );

        // every later call re-raises instead of handing out Remotes
        let err = prov.get_remote(true).await.unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::HelperExited(_) | ProvisionError::ChannelClosed
        ));

        prov.stop().await;
        prov.stop().await; // idempotent
    }

    #[tokio::test]
    async fn bad_pong_fails_start() {
        let prov = sh_provisioner(
            r#"read line; echo '{"cmd": "ping", "reply": "something else", "success": true}'"#,
        );
        assert!(matches!(
            prov.start().await,
            Err(ProvisionError::BadPong(_))
        ));
    }

    #[tokio::test]
    async fn non_blocking_get_remote_returns_none_without_permits() {
        // helper that answers the ping and then parks on the next read
        let prov = sh_provisioner(&format!("read line; echo '{PONG}'; read parked"));
        prov.start().await.unwrap();

        assert!(prov.get_remote(false).await.unwrap().is_none());
        assert!(prov.get_remote(false).await.unwrap().is_none());

        prov.stop().await;
        // stopped provisioner refuses further calls
        assert!(matches!(
            prov.get_remote(false).await,
            Err(ProvisionError::Stopped)
        ));
    }

    #[tokio::test]
    async fn second_start_requires_a_stop() {
        let prov = sh_provisioner(&format!("read line; echo '{PONG}'; read parked"));
        prov.start().await.unwrap();
        assert!(matches!(
            prov.start().await,
            Err(ProvisionError::AlreadyStarted)
        ));
        prov.stop().await;
        // a fresh session is allowed again
        prov.start().await.unwrap();
        prov.stop().await;
    }

    #[tokio::test]
    async fn setname_is_sent_when_configured() {
        let script = format!(
            "read line; echo '{PONG}'\n\
             read line; echo \"$line\" > \"$OUT\"; echo '{{\"success\": true}}'\n\
             read parked"
        );
        let out = tempfile::NamedTempFile::new().unwrap();
        let mut config = SharedVirtConfig::new("base.qcow2", "/dev/null", "127.0.0.1");
        config.reserve_name = Some("contest-run".into());
        config.helper_command = vec![
            "env".into(),
            format!("OUT={}", out.path().display()),
            "sh".into(),
            "-c".into(),
            script,
        ];
        let prov =
            SharedVirtProvisioner::new(Arc::new(LocalConnection), config).unwrap();
        prov.start().await.unwrap();
        prov.stop().await;

        let recorded = std::fs::read_to_string(out.path()).unwrap();
        assert!(recorded.contains(r#""cmd":"setname""#));
        assert!(recorded.contains("contest-run"));
    }
}
