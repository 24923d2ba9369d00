//! # atex
//!
//! A distributed test-execution system: it reserves virtual-machine
//! domains from a pool on a remote hypervisor host, uploads test code,
//! runs tests on those machines under a shared execution protocol,
//! collects structured results and log files, and aggregates everything
//! into a single run output. It targets FMF/TMT-style test corpora.
//!
//! ## Architecture
//!
//! The crate is organized around four subsystems:
//!
//! ### Provisioning ([`provisioner`])
//!
//! [`SharedVirtProvisioner`] talks line-JSON to `atex-virt-helper` on a
//! libvirt host: it reserves domains, clones disk images, boots guests,
//! waits for sshd, and hands back connected [`Remote`] handles.
//!
//! ### Connections ([`connection`])
//!
//! A uniform command / rsync interface over a transport, with local,
//! `podman exec`, multiplexed-SSH and stateless-SSH variants.
//!
//! ### Execution ([`executor`])
//!
//! An [`Executor`] drives one test on one Remote under the test-control
//! protocol: line-JSON result records, exact-count file payloads, deadline
//! adjustment, and announced reboots, all collected per test by a
//! [`Reporter`].
//!
//! ### Orchestration ([`orchestrator`])
//!
//! The [`Orchestrator`] schedules tests onto freshly-freed Remotes with
//! destructive-test-aware placement and a rerun budget, and merges every
//! test's output into the run-global [`JsonAggregator`].
//!
//! ```text
//!  Orchestrator ──get_remote()──► Provisioner ──reserve/clone/boot──► VM
//!       │                                                             │
//!       ├──(test, Remote)──► Executor ──ssh session (control+data)────┘
//!       │                       │
//!       │                    Reporter (results + files per test)
//!       │                       │
//!       └──────ingest()──► JsonAggregator (run-global output)
//! ```
//!
//! [`SharedVirtProvisioner`]: provisioner::SharedVirtProvisioner
//! [`Remote`]: provisioner::Remote
//! [`Executor`]: executor::Executor
//! [`Reporter`]: executor::Reporter
//! [`Orchestrator`]: orchestrator::Orchestrator
//! [`JsonAggregator`]: orchestrator::JsonAggregator

pub mod connection;
pub mod executor;
pub mod fmf;
pub mod orchestrator;
pub mod provisioner;
pub mod util;

// Re-export the types most users wire together.

pub use connection::{Connection, ConnectionError};
pub use executor::{Executor, ExecutorError, Reporter};
pub use fmf::{FmfTest, FmfTests, Platform, TestMetadata};
pub use orchestrator::{ContestPolicy, JsonAggregator, Orchestrator, SchedulingPolicy};
pub use provisioner::{Provisioner, Remote, SharedVirtConfig, SharedVirtProvisioner};
