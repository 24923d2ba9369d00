//! The outer scheduling loop.
//!
//! An [`Orchestrator`] owns one or more provisioner-backed pools (one per
//! [`Platform`]), a queue of tests per pool, and the run-global
//! [`JsonAggregator`]. [`serve_once`](Orchestrator::serve_once) performs
//! one unit of work: it drains freshly reserved Remotes from every
//! provisioner, picks the next test for each via the
//! [`SchedulingPolicy`], spawns executor tasks, and collects at most one
//! finished execution, aggregating its results and deciding whether the
//! test reruns and whether the Remote can be trusted for another test or
//! must be replaced.
//!
//! # Placement and rerun policy
//!
//! The bundled [`ContestPolicy`] burns `destructive`-tagged tests on
//! pristine machines first, groups snapshottable tests by their derived
//! guest tag after a clean finish, and otherwise prefers high
//! `extra-priority` / long-running tests. A test is *destructive* when its
//! executor failed, its exit code is neither 0 nor 2, or it carries the
//! `destructive` tag; in all three cases the Remote's OS state is not
//! trustable and the Remote is released and replaced. Failed tests are
//! re-queued while their rerun budget (seeded from `max_reruns`) lasts.

pub mod aggregator;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use tracing::{debug, info, warn};

use crate::executor::{self, Executor, FILES_DIR, RESULTS_FILE};
use crate::fmf::{FmfTests, Platform, TestMetadata};
use crate::provisioner::{Provisioner, ProvisionError, Remote};
use crate::util::{Finished, TaskQueue};

pub use aggregator::{AggregatorError, JsonAggregator};

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error(transparent)]
    Provision(#[from] ProvisionError),

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}

/// What preceded a Remote becoming available for the next test.
#[derive(Debug, Clone, Copy)]
pub enum Previous<'a> {
    /// Fresh setup, no test has run on this Remote yet.
    FreshSetup,
    /// A test finished on it and left it trustable.
    Finished { test_name: &'a str },
}

/// Outcome of one executor task, as seen by scheduling.
#[derive(Debug)]
pub struct ExecReport {
    /// Exit code of the test, when execution got that far.
    pub exit_code: Option<i32>,
    /// The executor failure, if any.
    pub error: Option<String>,
}

/// Test-selection and destructiveness policy, overridable per test suite.
pub trait SchedulingPolicy: Send + Sync {
    /// Picks the next test to run from `to_run` for a Remote whose history
    /// is `previous`. `None` leaves the Remote unused (to be released).
    fn next_test(
        &self,
        to_run: &[String],
        tests: &FmfTests,
        previous: Previous<'_>,
    ) -> Option<String>;

    /// Whether the finished execution leaves the Remote's OS untrustable.
    fn destructive(&self, report: &ExecReport, metadata: &TestMetadata) -> bool;
}

/// Derives the guest tag grouping tests that can share a VM snapshot,
/// e.g. `default_uefi_fips`. Tests without `snapshottable` have none.
pub fn calculate_guest_tag(metadata: &TestMetadata) -> Option<String> {
    if !metadata.has_tag("snapshottable") {
        return None;
    }
    let mut name = String::from("default");
    if metadata.has_tag("with-gui") {
        name.push_str("_gui");
    }
    if metadata.has_tag("uefi") {
        name.push_str("_uefi");
    }
    if metadata.has_tag("fips") {
        name.push_str("_fips");
    }
    Some(name)
}

/// Scheduling policy tuned for the Contest test suite.
#[derive(Debug, Default)]
pub struct ContestPolicy;

impl SchedulingPolicy for ContestPolicy {
    fn next_test(
        &self,
        to_run: &[String],
        tests: &FmfTests,
        previous: Previous<'_>,
    ) -> Option<String> {
        let metadata = |name: &str| tests.get(name).ok().map(|t| &t.metadata);

        match previous {
            // fresh remote: prefer destructive tests (which likely need a
            // clean OS) to get them out of the way early
            Previous::FreshSetup => {
                for name in to_run {
                    if metadata(name).is_some_and(|m| m.has_tag("destructive")) {
                        debug!("chosen next test (destructive-first): {name}");
                        return Some(name.clone());
                    }
                }
            }
            // previous test finished non-destructively: prefer a test with
            // the same guest tag, enabling snapshot reuse downstream
            Previous::Finished { test_name } => {
                if let Some(finished_tag) = metadata(test_name).and_then(calculate_guest_tag) {
                    for name in to_run {
                        let next_tag = metadata(name).and_then(calculate_guest_tag);
                        if next_tag.as_deref() == Some(finished_tag.as_str()) {
                            debug!("chosen next test (guest tag {finished_tag}): {name}");
                            return Some(name.clone());
                        }
                    }
                }
            }
        }

        // otherwise prioritize important / long-running tests
        to_run
            .iter()
            .max_by_key(|name| {
                metadata(name)
                    .map(|m| (m.extra_priority, m.duration_seconds().unwrap_or(0)))
                    .unwrap_or((i64::MIN, 0))
            })
            .cloned()
    }

    fn destructive(&self, report: &ExecReport, metadata: &TestMetadata) -> bool {
        // an executor failure (e.g. duration exceeded) taints the remote
        if report.error.is_some() {
            return true;
        }
        // non-{0,2} exit: the test may have aborted abruptly mid-change
        // (0 = pass, 2 = fail, anything else = bad)
        if !matches!(report.exit_code, Some(0 | 2)) {
            return true;
        }
        metadata.has_tag("destructive")
    }
}

/// Runs one test on one Remote and reports how it went. The default runs
/// a real [`Executor`]; tests substitute canned behaviour.
pub type RunnerFn = Arc<
    dyn Fn(Remote, Arc<FmfTests>, String, PathBuf, bool) -> BoxFuture<'static, ExecReport>
        + Send
        + Sync,
>;

fn executor_runner() -> RunnerFn {
    Arc::new(|remote, tests, test_name, out_dir, fresh_setup| {
        Box::pin(async move {
            let executor = Executor::new(tests, remote);
            if fresh_setup {
                let prepared = async {
                    executor.upload_tests().await?;
                    executor.run_setup().await
                }
                .await;
                if let Err(err) = prepared {
                    // end the test immediately with a framework result
                    let _ = executor::report_infra(&out_dir, &err.to_string());
                    return ExecReport {
                        exit_code: None,
                        error: Some(err.to_string()),
                    };
                }
            }
            match executor.run_test(&test_name, &out_dir).await {
                Ok(outcome) => ExecReport {
                    exit_code: Some(outcome.exit_code),
                    error: None,
                },
                Err(err) => ExecReport {
                    exit_code: None,
                    error: Some(err.to_string()),
                },
            }
        })
    })
}

struct ExecTag {
    slot: usize,
    test_name: String,
    remote: Remote,
    out_dir: PathBuf,
}

struct Slot<P> {
    provisioner: P,
    platform: Platform,
    tests: Arc<FmfTests>,
    to_run: Vec<String>,
    machines: u32,
}

/// Scheduler for parallel test execution on multiple remote systems.
pub struct Orchestrator<P: Provisioner> {
    aggregator: JsonAggregator,
    policy: Box<dyn SchedulingPolicy>,
    runner: RunnerFn,
    slots: Vec<Slot<P>>,
    executors: TaskQueue<ExecTag, ExecReport>,
    reruns: HashMap<String, u32>,
    max_reruns: u32,
    work_dir: PathBuf,
}

impl<P: Provisioner> Orchestrator<P> {
    /// `work_dir` hosts the transient per-test Reporter outputs until they
    /// are ingested into `aggregator`.
    pub fn new(
        aggregator: JsonAggregator,
        policy: Box<dyn SchedulingPolicy>,
        max_reruns: u32,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            aggregator,
            policy,
            runner: executor_runner(),
            slots: Vec::new(),
            executors: TaskQueue::new(),
            reruns: HashMap::new(),
            max_reruns,
            work_dir: work_dir.into(),
        }
    }

    /// Substitutes the test-execution function; a seam for the test suite.
    pub fn with_runner(mut self, runner: RunnerFn) -> Self {
        self.runner = runner;
        self
    }

    /// Adds a pool: a provisioner bound to one platform and the tests
    /// selected for it, sized to `machines` concurrent remotes.
    pub fn add_pool(&mut self, provisioner: P, platform: Platform, tests: Arc<FmfTests>, machines: u32) {
        let to_run = tests.names().map(str::to_owned).collect();
        self.slots.push(Slot {
            provisioner,
            platform,
            tests,
            to_run,
            machines,
        });
    }

    /// Opens the aggregator and starts every provisioner, requesting as
    /// many machines as each pool can use.
    pub async fn start(&mut self) -> Result<(), OrchestratorError> {
        std::fs::create_dir_all(&self.work_dir).map_err(AggregatorError::Io)?;
        self.aggregator.start()?;
        for slot in &self.slots {
            slot.provisioner.start().await?;
            let wanted = slot.machines.min(slot.to_run.len() as u32);
            if wanted > 0 {
                slot.provisioner.provision(wanted)?;
            }
        }
        Ok(())
    }

    /// Stops provisioners and closes the aggregator; in-flight executor
    /// tasks are awaited first so their remotes release cleanly.
    pub async fn stop(&mut self) {
        self.executors.join().await;
        for slot in &self.slots {
            slot.provisioner.stop().await;
        }
        self.aggregator.stop();
    }

    /// Performs one unit of orchestration work.
    ///
    /// Returns true while there is (or will be) more work to do; call
    /// again until it returns false.
    pub async fn serve_once(&mut self) -> Result<bool, OrchestratorError> {
        // hand fresh remotes their first test
        for idx in 0..self.slots.len() {
            loop {
                match self.slots[idx].provisioner.get_remote(false).await? {
                    Some(remote) => self.dispatch(idx, remote, Previous::FreshSetup).await,
                    None => break,
                }
            }
        }

        // collect one finished execution, if any
        if let Some(finished) = self.executors.try_next() {
            self.collect(finished).await?;
        }

        Ok(!self.executors.is_empty() || self.slots.iter().any(|s| !s.to_run.is_empty()))
    }

    /// Runs the orchestration logic until all testing is concluded.
    pub async fn serve_forever(&mut self) -> Result<(), OrchestratorError> {
        while self.serve_once().await? {
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Ok(())
    }

    async fn dispatch(&mut self, idx: usize, remote: Remote, previous: Previous<'_>) {
        let slot = &self.slots[idx];
        let Some(test_name) = self.policy.next_test(&slot.to_run, &slot.tests, previous) else {
            debug!(remote = %remote, "no test for remote, releasing");
            remote.release().await;
            return;
        };

        let slot = &mut self.slots[idx];
        slot.to_run.retain(|name| *name != test_name);

        let out_dir = self
            .work_dir
            .join(slot.platform.to_string())
            .join(uuid::Uuid::new_v4().to_string());
        info!(remote = %remote, "running '{test_name}'");

        let tag = ExecTag {
            slot: idx,
            test_name: test_name.clone(),
            remote: remote.clone(),
            out_dir: out_dir.clone(),
        };
        let runner = Arc::clone(&self.runner);
        let tests = Arc::clone(&slot.tests);
        let fresh_setup = matches!(previous, Previous::FreshSetup);
        self.executors.spawn(
            tag,
            async move { runner(remote, tests, test_name, out_dir, fresh_setup).await },
        );
    }

    async fn collect(
        &mut self,
        finished: Finished<ExecTag, ExecReport>,
    ) -> Result<(), OrchestratorError> {
        let ExecTag {
            slot: idx,
            test_name,
            remote,
            out_dir,
        } = finished.tag;
        let report = match finished.result {
            Ok(report) => report,
            Err(panic) => ExecReport {
                exit_code: None,
                error: Some(panic.to_string()),
            },
        };
        let remote_with_test = format!("{remote}: '{test_name}'");
        match &report.error {
            Some(error) => warn!("{remote_with_test}: failed: {error}"),
            None => debug!("{remote_with_test}: exited with {:?}", report.exit_code),
        }

        // whatever the test reported so far is still worth aggregating;
        // a conflict aborts just this ingestion, with no partial state
        let results_file = out_dir.join(RESULTS_FILE);
        if results_file.exists() {
            let platform = self.slots[idx].platform.to_string();
            if let Err(err) = self.aggregator.ingest(
                &platform,
                &test_name,
                &results_file,
                &out_dir.join(FILES_DIR),
            ) {
                warn!("{remote_with_test}: ingestion failed: {err}");
            }
        }

        let failed = report.error.is_some() || report.exit_code != Some(0);
        if failed && rerun_and_decrement(&mut self.reruns, self.max_reruns, &test_name) {
            info!("{remote_with_test}: re-queued for another run");
            self.slots[idx].to_run.push(test_name.clone());
        }

        let fallback_metadata = TestMetadata::default();
        let metadata = self.slots[idx]
            .tests
            .get(&test_name)
            .map(|test| &test.metadata)
            .unwrap_or(&fallback_metadata);
        if self.policy.destructive(&report, metadata) {
            debug!("{remote_with_test}: destructive, replacing the remote");
            remote.release().await;
            if !self.slots[idx].to_run.is_empty() {
                self.slots[idx].provisioner.provision(1)?;
            }
        } else {
            self.dispatch(idx, remote, Previous::Finished { test_name: &test_name })
                .await;
        }
        Ok(())
    }
}

/// Decrements the per-test rerun budget; true iff it was still positive.
fn rerun_and_decrement(reruns: &mut HashMap<String, u32>, max_reruns: u32, name: &str) -> bool {
    let left = reruns.entry(name.to_owned()).or_insert(max_reruns);
    debug!("'{name}': {left} reruns left");
    if *left > 0 {
        *left -= 1;
        true
    } else {
        false
    }
}
