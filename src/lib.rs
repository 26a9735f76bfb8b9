//! # scatter
//!
//! A distributed test scheduler for container clusters: it takes a
//! declarative job description, enumerates the test suite, shards it across
//! pods, attributes streamed container logs back to individual tests, and
//! reruns the union of failures as a final reconciliation pass.
//!
//! ## Overview
//!
//! A run is driven by a [`JobConfig`]: repository coordinates, a container
//! image, the command under test, and optional distribution settings. The
//! scheduler produces a structured [`TestResultLog`], one JSON line on the
//! diagnostic stream, with a per-test pass/fail record derived from
//! container exit status.
//!
//! ## Architecture
//!
//! The crate is organized into four main subsystems:
//!
//! ### Cluster ([`cluster`])
//!
//! The executor seam. The scheduler core builds [`cluster::PodSpec`]s and
//! submits them through the [`ClusterExecutor`] trait, which owns pod
//! lifecycle and log streaming. [`cluster::process::ProcessExecutor`] runs
//! pods as local processes for development and tests; production deployments
//! implement the trait against their cluster client.
//!
//! ### Scheduler ([`scheduler`])
//!
//! The core: the prepare stage, the test lister, the sharding plan
//! ([`scheduler::plan`]), pod spec construction ([`scheduler::spec`]), the
//! shared log multiplexer ([`scheduler::LogMultiplexer`]), and the
//! orchestration root [`TestScheduler`].
//!
//! ### Reporting ([`report`])
//!
//! The result records: [`TestLog`] per test, [`TestResultLog`] per job,
//! merged with the descriptor's free-form log fields before serialization.
//!
//! ### Resources ([`resource`])
//!
//! Process-local materialization: repository clones, token files, and
//! artifact export, behind a setup-once latch.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use scatter::cluster::process::ProcessExecutor;
//! use scatter::config::load_job;
//! use scatter::scheduler::TestScheduler;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let job = load_job(std::path::Path::new("scatter.toml"))?;
//!
//!     let executor = Arc::new(ProcessExecutor::new());
//!     let scheduler = TestScheduler::new(executor);
//!
//!     let report = scheduler.run(&job, &CancellationToken::new()).await?;
//!     println!("{} tests passed", report.details.tests.len());
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration
//!
//! Jobs are described in TOML. See [`config`] for the schema.
//!
//! ```toml
//! name = "unit"
//! image = "golang:1.22"
//! repo = "github.com/example/service"
//! branch = "main"
//! command = "go test $TEST"
//!
//! [distributed]
//! list_command = "go list ./..."
//! max_containers_per_pod = 8
//! retest = true
//! ```

pub mod cluster;
pub mod config;
pub mod report;
pub mod resource;
pub mod scheduler;

// Re-export the types most users need to drive a run.

pub use cluster::{ClusterError, ClusterExecutor, LogEvent, LogSink};
pub use config::{load_job, JobConfig};
pub use report::{TestLog, TestResult, TestResultLog};
pub use resource::ResourceManager;
pub use scheduler::{RunError, TestScheduler};
