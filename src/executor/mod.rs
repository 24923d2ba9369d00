//! Driving one test on one remote system.
//!
//! An [`Executor`] owns the remote side of a test run: it uploads the test
//! tree and the runner script, applies the plan's prepare steps, and runs
//! individual tests under the test-control protocol ([`testcontrol`]),
//! collecting their records and files through a [`Reporter`].
//!
//! One transport session is spawned per test: its stdout carries control
//! frames and declared file payloads, its stderr streams the test's own
//! output into the live capture. The runner script propagates the test's
//! exit code as the session exit code; 255 is the transport's own failure
//! code and marks a disconnect, which is fatal unless the test announced a
//! reboot first.

pub mod duration;
pub mod reporter;
pub mod testcontrol;

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::connection::{Connection, ConnectionError};
use crate::fmf::{FmfError, FmfTest, FmfTests};

pub use duration::Deadline;
pub use reporter::{Reporter, ReporterError};
pub use testcontrol::{ControlState, StreamEnd};

/// The runner script uploaded next to the test tree.
pub const RUNNER_SCRIPT: &str = include_str!("../../scripts/runner.sh");

/// Results file name inside a per-test output directory.
pub const RESULTS_FILE: &str = "results";

/// Uploaded-files directory name inside a per-test output directory.
pub const FILES_DIR: &str = "files";

/// Deadline for tests that do not declare a `duration`.
const DEFAULT_DURATION: &str = "5m";

/// Where test trees and the runner live on the remote.
const DEFAULT_REMOTE_BASE: &str = "/var/tmp/atex";

/// ssh reserves this exit code for transport-level failure.
const TRANSPORT_EXIT: i32 = 255;

const RECONNECT_POLL: StdDuration = StdDuration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Preparation (package install, prepare script) failed; the test gets
    /// a synthesised `infra` result.
    #[error("test setup failed: {0}")]
    TestSetup(String),

    /// Infrastructure violated the test's invariants (unexpected
    /// disconnect, deadline exceeded).
    #[error("test aborted: {0}")]
    TestAborted(String),

    /// The test violated the control protocol.
    #[error("bad control frame: {0}")]
    BadControl(String),

    /// The test reported unparsable or malformed result JSON.
    #[error("bad report JSON: {0}")]
    BadReportJson(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Reporter(#[from] ReporterError),

    #[error(transparent)]
    Fmf(#[from] FmfError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What one finished test execution looked like, protocol-wise.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub exit_code: i32,
}

/// Runs tests from one [`FmfTests`] selection on one remote.
pub struct Executor<C: Connection> {
    tests: Arc<FmfTests>,
    remote: C,
    remote_base: PathBuf,
    pkg_install: Vec<String>,
}

impl<C: Connection> Executor<C> {
    pub fn new(tests: Arc<FmfTests>, remote: C) -> Self {
        Self {
            tests,
            remote,
            remote_base: PathBuf::from(DEFAULT_REMOTE_BASE),
            pkg_install: ["dnf", "-y", "--setopt=install_weak_deps=False", "install"]
                .map(String::from)
                .to_vec(),
        }
    }

    /// Overrides the remote-side base directory.
    pub fn with_remote_base(mut self, base: impl Into<PathBuf>) -> Self {
        self.remote_base = base.into();
        self
    }

    /// Overrides the package-install command prefix.
    pub fn with_pkg_install(mut self, argv: Vec<String>) -> Self {
        self.pkg_install = argv;
        self
    }

    pub fn remote(&self) -> &C {
        &self.remote
    }

    /// Consumes the executor, handing the remote back.
    pub fn into_remote(self) -> C {
        self.remote
    }

    fn tests_dir(&self) -> PathBuf {
        self.remote_base.join("tests")
    }

    fn runner_path(&self) -> PathBuf {
        self.remote_base.join("runner.sh")
    }

    /// Uploads the FMF tree and the runner script to the remote.
    pub async fn upload_tests(&self) -> Result<(), ExecutorError> {
        let base = self.remote_base.display().to_string();
        let mkdir = self.remote.cmd(&["mkdir", "-p", &base]).await?;
        if !mkdir.success() {
            return Err(ExecutorError::TestSetup(format!(
                "mkdir -p {base} failed: {}",
                mkdir.stderr.trim()
            )));
        }

        let src = format!("{}/", self.tests.root.display());
        let dest = format!("remote:{}", self.tests_dir().display());
        self.remote
            .rsync(&["-r", "--delete", "--exclude=.git/", &src, &dest])
            .await?;

        let mut staged = tempfile::NamedTempFile::new()?;
        std::io::Write::write_all(&mut staged, RUNNER_SCRIPT.as_bytes())?;
        let src = staged.path().display().to_string();
        let dest = format!("remote:{}", self.runner_path().display());
        self.remote.rsync(&[&src, &dest]).await?;
        Ok(())
    }

    /// Applies the plan's prepare steps: package installation first, then
    /// prepare scripts, in plan order.
    pub async fn run_setup(&self) -> Result<(), ExecutorError> {
        if !self.tests.prepare_pkgs.is_empty() {
            let mut argv: Vec<&str> = self.pkg_install.iter().map(String::as_str).collect();
            argv.extend(self.tests.prepare_pkgs.iter().map(String::as_str));
            let result = self.remote.cmd(&argv).await?;
            if !result.success() {
                let output = format!("{}\n{}", result.stdout, result.stderr);
                let msg = if output.contains("No match") {
                    format!("missing packages: {}", result.stderr.trim())
                } else {
                    format!("package install failed: {}", result.stderr.trim())
                };
                return Err(ExecutorError::TestSetup(msg));
            }
        }

        for script in &self.tests.prepare_scripts {
            let result = self.remote.cmd(&["sh", "-c", script]).await?;
            if !result.success() {
                return Err(ExecutorError::TestSetup(format!(
                    "prepare script failed with {}: {script}",
                    result.exit_code
                )));
            }
        }
        Ok(())
    }

    /// Runs one test to completion, reporting into `output_dir`.
    pub async fn run_test(
        &self,
        test_name: &str,
        output_dir: &Path,
    ) -> Result<TestOutcome, ExecutorError> {
        let test = self.tests.get(test_name)?;
        let reporter = Reporter::new(output_dir, RESULTS_FILE, FILES_DIR);
        reporter.start()?;
        let result = self.drive(test, &reporter).await;
        reporter.stop();
        result
    }

    async fn drive(&self, test: &FmfTest, reporter: &Reporter) -> Result<TestOutcome, ExecutorError> {
        let command = test
            .metadata
            .extra
            .get("test")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                ExecutorError::TestSetup(format!("{} has no 'test' command", test.name))
            })?;
        let workdir = self.tests_dir().join(&test.dir);

        let duration = test.metadata.duration.as_deref().unwrap_or(DEFAULT_DURATION);
        let mut deadline =
            Deadline::new(duration).map_err(|e| ExecutorError::TestSetup(e.to_string()))?;

        // testing hook: let the protocol end without a synthesised result
        let suppress_fallback = std::env::var_os("ATEX_DEBUG_NO_EXITCODE").is_some();

        let mut state = ControlState::new();
        let mut boot_count: u32 = 0;

        loop {
            let argv_owned = self.runner_argv(test, command, &workdir, boot_count);
            let argv: Vec<&str> = argv_owned.iter().map(String::as_str).collect();
            let mut child =
                self.remote
                    .spawn(&argv, Stdio::null(), Stdio::piped(), Stdio::piped())?;
            let control = child
                .stdout
                .take()
                .ok_or_else(|| ExecutorError::BadControl("runner stdout not captured".into()))?;
            let output = child
                .stderr
                .take()
                .ok_or_else(|| ExecutorError::BadControl("runner stderr not captured".into()))?;

            // live capture of the test's own output
            let mut testout = tokio::fs::File::from_std(reporter.open_testout()?);
            let capture = tokio::spawn(async move {
                let mut output = output;
                let _ = tokio::io::copy(&mut output, &mut testout).await;
            });

            match testcontrol::process_stream(control, &mut state, reporter, &mut deadline).await {
                Err(err) => {
                    let _ = child.kill().await;
                    capture.abort();
                    return Err(err);
                }
                Ok(StreamEnd::Reboot) => {
                    // the guest goes down with the session; reattach after
                    let _ = child.kill().await;
                    let _ = capture.await;
                    self.remote.disconnect().await;
                    self.reconnect(&deadline).await?;
                    state.expect_reboot = false;
                    boot_count += 1;
                    debug!("reattaching to {} (boot {boot_count})", test.name);
                }
                Ok(StreamEnd::Eof) => {
                    let _ = capture.await;
                    let status = tokio::select! {
                        biased;
                        _ = tokio::time::sleep_until(deadline.end().into()) => {
                            let _ = child.kill().await;
                            return Err(ExecutorError::TestAborted("duration exceeded".into()));
                        }
                        status = child.wait() => status?,
                    };
                    let exit_code = status.code().unwrap_or(TRANSPORT_EXIT);

                    if exit_code == TRANSPORT_EXIT {
                        if !state.expect_reboot {
                            return Err(ExecutorError::TestAborted(
                                "disconnect was not sent via test control".into(),
                            ));
                        }
                        self.remote.disconnect().await;
                        self.reconnect(&deadline).await?;
                        state.expect_reboot = false;
                        boot_count += 1;
                        debug!("reattaching to {} (boot {boot_count})", test.name);
                        continue;
                    }

                    testcontrol::finish(&mut state, exit_code, reporter, suppress_fallback)?;
                    return Ok(TestOutcome { exit_code });
                }
            }
        }
    }

    fn runner_argv(
        &self,
        test: &FmfTest,
        command: &str,
        workdir: &Path,
        boot_count: u32,
    ) -> Vec<String> {
        let mut argv = vec!["env".to_owned()];
        for (key, value) in &self.tests.env {
            argv.push(format!("{key}={value}"));
        }
        for (key, value) in &test.metadata.environment {
            argv.push(format!("{key}={value}"));
        }
        argv.push(format!("ATEX_TEST_NAME={}", test.name));
        argv.push("sh".to_owned());
        argv.push(self.runner_path().display().to_string());
        argv.push(workdir.display().to_string());
        argv.push(command.to_owned());
        argv.push(boot_count.to_string());
        argv
    }

    /// Re-establishes the transport after an announced reboot, pacing
    /// attempts while the guest comes back, bounded by the test deadline.
    async fn reconnect(&self, deadline: &Deadline) -> Result<(), ExecutorError> {
        debug!("reconnecting after reboot");
        loop {
            if deadline.out_of_time() {
                return Err(ExecutorError::TestAborted("duration exceeded".into()));
            }
            match self.remote.connect(false).await {
                Ok(()) => return Ok(()),
                Err(ConnectionError::WouldBlock | ConnectionError::ConnectFailed(_)) => {
                    tokio::time::sleep(RECONNECT_POLL).await;
                }
                Err(other) => return Err(other.into()),
            }
        }
    }
}

/// Writes a framework-signalled `infra` result for a test whose setup
/// failed before it could run.
pub fn report_infra(output_dir: &Path, note: &str) -> Result<(), ExecutorError> {
    let reporter = Reporter::new(output_dir, RESULTS_FILE, FILES_DIR);
    reporter.start()?;
    let mut record = Map::new();
    record.insert("status".into(), Value::String("infra".into()));
    record.insert("note".into(), Value::String(note.into()));
    let result = reporter.report(&record);
    reporter.stop();
    if let Err(err) = result {
        warn!("failed to report infra result: {err}");
        return Err(err.into());
    }
    Ok(())
}
