//! Distributed test scheduling.
//!
//! The [`TestScheduler`] is the orchestration root: it resolves the git
//! token, runs the prepare stage, enumerates tests with the list command,
//! shards them into pod-groups, submits all groups concurrently through one
//! shared [`LogMultiplexer`], and finally reruns the union of failed tests
//! as a single reconciliation batch when retest is enabled.
//!
//! # Architecture
//!
//! ```text
//!   JobConfig                TestScheduler                ClusterExecutor
//!       │                         │                              │
//!       │ run()                   │                              │
//!       ▼                         │                              │
//!   resolve token ───────────────►│ secret()                     │
//!                                 │ prepare pod ────────────────►│
//!                                 │ list pod ───────────────────►│
//!                                 ▼                              │
//!                          plan(tests, M)                        │
//!                                 │                              │
//!                                 │ group pods (concurrent) ────►│
//!                                 │      ▲                       │
//!                                 │      └── LogMultiplexer ◄────┤ log events
//!                                 ▼                              │
//!                          retest pod (optional) ───────────────►│
//!                                 │
//!                                 ▼
//!                           TestResultLog
//! ```

pub mod lister;
pub mod mux;
pub mod plan;
pub mod spec;

use std::collections::HashMap;
use std::io::Write;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cluster::{ClusterError, ClusterExecutor, LogEvent, LogSink};
use crate::config::{ConfigError, DistributedConfig, JobConfig};
use crate::report::{TestLog, TestResult, TestResultLog, TestResultLogDetail};

pub use mux::LogMultiplexer;
pub use spec::TestCommand;

/// Pre-opened sink for program output: the `[POD n]` stream and the result
/// record. Distinct from `tracing` diagnostics.
pub type DiagnosticSink = Arc<Mutex<Box<dyn Write + Send>>>;

/// Diagnostic sink writing to the process stderr.
pub fn stderr_sink() -> DiagnosticSink {
    Arc::new(Mutex::new(Box::new(std::io::stderr())))
}

/// Phase of the run an infrastructure error originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    List,
    Prepare,
    Test,
    Retest,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Phase::List => "list",
            Phase::Prepare => "prepare",
            Phase::Test => "test",
            Phase::Retest => "retest",
        };
        f.write_str(name)
    }
}

/// Errors a scheduler run can end with.
///
/// [`RunError::FailedTests`] is the sentinel for containers that ran and
/// exited non-zero; it carries the assembled result record. Everything else
/// is configuration or infrastructure and bypasses retest.
#[derive(Debug, thiserror::Error)]
pub enum RunError {
    #[error("invalid job: {0}")]
    Config(#[from] ConfigError),

    #[error("secret {name} has no key {key}")]
    SecretKeyNotFound { name: String, key: String },

    #[error("{phase} phase failed: {source}")]
    Cluster {
        phase: Phase,
        #[source]
        source: ClusterError,
    },

    #[error("prepare step failed")]
    PrepareFailed,

    /// At least one test container exited non-zero after all retries.
    #[error("failed test job")]
    FailedTests(Box<TestResultLog>),

    /// The run was cancelled; the record holds whatever finished in time.
    #[error("run cancelled")]
    Cancelled(Box<TestResultLog>),
}

/// Internal failure classification carried alongside partial test logs.
enum RunFailure {
    Tests,
    Prepare,
    Cancelled,
    Infra { phase: Phase, source: ClusterError },
    Config(ConfigError),
    SecretKey { name: String, key: String },
}

/// The orchestration root. Construct with [`TestScheduler::new`], tune the
/// log toggles, then [`run`](TestScheduler::run) a job.
pub struct TestScheduler<C> {
    executor: Arc<C>,
    sink: DiagnosticSink,
    prepare_log: bool,
    command_log: bool,
    result_log: bool,
}

impl<C> TestScheduler<C>
where
    C: ClusterExecutor + 'static,
{
    pub fn new(executor: Arc<C>) -> Self {
        Self {
            executor,
            sink: stderr_sink(),
            prepare_log: true,
            command_log: true,
            result_log: true,
        }
    }

    /// Redirect the diagnostic stream (pod logs and the result record).
    pub fn with_diagnostic_sink(mut self, sink: Box<dyn Write + Send>) -> Self {
        self.sink = Arc::new(Mutex::new(sink));
        self
    }

    /// Suppress prepare-stage container logs.
    pub fn without_prepare_log(mut self) -> Self {
        self.prepare_log = false;
        self
    }

    /// Suppress the per-container command echo line.
    pub fn without_command_log(mut self) -> Self {
        self.command_log = false;
        self
    }

    /// Suppress the result-record JSON line.
    pub fn without_result_log(mut self) -> Self {
        self.result_log = false;
        self
    }

    /// Run the job to completion and emit the result record.
    ///
    /// Returns the record on success. On failure the record is still
    /// emitted to the diagnostic stream, and the [`RunError::FailedTests`] /
    /// [`RunError::Cancelled`] variants carry it back to the caller.
    pub async fn run(
        &self,
        job: &JobConfig,
        cancel: &CancellationToken,
    ) -> Result<TestResultLog, RunError> {
        job.validate()?;

        let started_at = Utc::now();
        let (tests, failure) = self.run_inner(job, cancel).await;

        let result = if failure.is_none() {
            TestResult::Success
        } else {
            TestResult::Failure
        };
        let report = TestResultLog {
            result,
            job: job.name.clone(),
            elapsed_sec: (Utc::now() - started_at).num_seconds().max(0),
            started_at,
            details: TestResultLogDetail { tests },
        };

        if self.result_log {
            if let Ok(line) = report.render(&job.log_fields) {
                let _ = writeln!(self.sink.lock().unwrap(), "{}", line);
            }
        }

        match failure {
            None => Ok(report),
            Some(RunFailure::Tests) => Err(RunError::FailedTests(Box::new(report))),
            Some(RunFailure::Prepare) => Err(RunError::PrepareFailed),
            Some(RunFailure::Cancelled) => Err(RunError::Cancelled(Box::new(report))),
            Some(RunFailure::Infra { phase, source }) => {
                Err(RunError::Cluster { phase, source })
            }
            Some(RunFailure::Config(err)) => Err(RunError::Config(err)),
            Some(RunFailure::SecretKey { name, key }) => {
                Err(RunError::SecretKeyNotFound { name, key })
            }
        }
    }

    async fn run_inner(
        &self,
        job: &JobConfig,
        cancel: &CancellationToken,
    ) -> (Vec<TestLog>, Option<RunFailure>) {
        let token = match self.resolve_token(job).await {
            Ok(token) => token,
            Err(failure) => return (Vec::new(), Some(failure)),
        };

        let job = normalize(job);

        if let Err(failure) = self.run_prepare(&job, token.as_deref(), cancel).await {
            return (Vec::new(), Some(failure));
        }

        let Some(distributed) = job.distributed.clone() else {
            let outcome = self
                .submit_single(&job, &job.command, token.as_deref(), self.forward_sink(), cancel)
                .await;
            return match outcome {
                Ok(()) => (Vec::new(), None),
                Err(ClusterError::FailedJob(_)) => (Vec::new(), Some(RunFailure::Tests)),
                Err(ClusterError::Cancelled) => (Vec::new(), Some(RunFailure::Cancelled)),
                Err(source) => (
                    Vec::new(),
                    Some(RunFailure::Infra {
                        phase: Phase::Test,
                        source,
                    }),
                ),
            };
        };

        info!("listing tests");
        let tests = match lister::list_tests(
            self.executor.as_ref(),
            &job,
            &distributed,
            token.as_deref(),
            &self.sink,
            cancel,
        )
        .await
        {
            Ok(tests) => tests,
            Err(failure) => return (Vec::new(), Some(failure)),
        };
        if tests.is_empty() {
            warn!("test list is empty, nothing to run");
            return (Vec::new(), None);
        }
        info!("listed {} tests", tests.len());

        let start = Instant::now();
        let outcome = self
            .run_distributed(&job, &distributed, &tests, token, cancel)
            .await;
        let _ = writeln!(
            self.sink.lock().unwrap(),
            "test: elapsed time {:.2} sec",
            start.elapsed().as_secs_f64()
        );
        outcome
    }

    /// Resolve the git token, fetching it from a cluster secret if the job
    /// references one.
    async fn resolve_token(&self, job: &JobConfig) -> Result<Option<String>, RunFailure> {
        let Some(token) = &job.token else {
            return Ok(None);
        };
        if let Some(value) = &token.value {
            return Ok(Some(value.trim().to_string()));
        }
        let Some(secret_ref) = &token.secret_ref else {
            return Ok(None);
        };

        let data = self
            .executor
            .secret(&job.namespace, &secret_ref.name)
            .await
            .map_err(|source| RunFailure::Infra {
                phase: Phase::Prepare,
                source,
            })?;
        let Some(bytes) = data.get(&secret_ref.key) else {
            return Err(RunFailure::SecretKey {
                name: secret_ref.name.clone(),
                key: secret_ref.key.clone(),
            });
        };
        Ok(Some(String::from_utf8_lossy(bytes).trim().to_string()))
    }

    async fn run_prepare(
        &self,
        job: &JobConfig,
        token: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<(), RunFailure> {
        let Some(pod) = spec::prepare_pod(job, token) else {
            return Ok(());
        };

        info!("running {} prepare step(s)", job.prepare.steps.len());
        let sink = if self.prepare_log {
            self.forward_sink()
        } else {
            crate::cluster::null_sink()
        };

        let start = Instant::now();
        let outcome = self.executor.submit(&pod, sink, cancel).await;
        let _ = writeln!(
            self.sink.lock().unwrap(),
            "prepare: elapsed time {:.2} sec",
            start.elapsed().as_secs_f64()
        );

        match outcome {
            Ok(()) => Ok(()),
            Err(ClusterError::FailedJob(_)) => Err(RunFailure::Prepare),
            Err(ClusterError::Cancelled) => Err(RunFailure::Cancelled),
            Err(source) => Err(RunFailure::Infra {
                phase: Phase::Prepare,
                source,
            }),
        }
    }

    /// Submit a pod whose single container runs `command`.
    pub(crate) async fn submit_single(
        &self,
        job: &JobConfig,
        command: &str,
        token: Option<&str>,
        sink: LogSink,
        cancel: &CancellationToken,
    ) -> Result<(), ClusterError> {
        let pod = spec::single_pod(job, command, token);
        self.executor.submit(&pod, sink, cancel).await
    }

    async fn run_distributed(
        &self,
        job: &JobConfig,
        distributed: &DistributedConfig,
        tests: &[String],
        token: Option<String>,
        cancel: &CancellationToken,
    ) -> (Vec<TestLog>, Option<RunFailure>) {
        let mux = LogMultiplexer::new(Arc::clone(&self.sink), self.command_log);
        let groups = plan::plan(tests, distributed.max_containers_per_pod);
        debug!(
            "planned {} tests into {} pod group(s)",
            tests.len(),
            groups.len()
        );

        // Aggregated under its own lock, disjoint from the multiplexer's.
        let failed_commands: Arc<Mutex<Vec<TestCommand>>> = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for group in &groups {
            let (pod, commands) = spec::group_pod(job, group, token.as_deref());
            for command in &commands {
                mux.register(&command.container, &command.test, &job.command);
            }

            let executor = Arc::clone(&self.executor);
            let sink = mux.log_sink();
            let cancel = cancel.clone();
            let failed_commands = Arc::clone(&failed_commands);
            handles.push(tokio::spawn(async move {
                match executor.submit(&pod, sink, &cancel).await {
                    Ok(()) => Ok(()),
                    Err(ClusterError::FailedJob(failed)) => {
                        let failed = commands_for_failed_containers(&commands, &failed);
                        failed_commands.lock().unwrap().extend(failed);
                        Ok(())
                    }
                    Err(err) => Err(err),
                }
            }));
        }

        let mut cancelled = false;
        let mut infra: Option<ClusterError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(ClusterError::Cancelled)) => cancelled = true,
                Ok(Err(err)) => {
                    if infra.is_none() {
                        infra = Some(err);
                    }
                }
                Err(err) => {
                    if infra.is_none() {
                        infra = Some(ClusterError::Transport(err.to_string()));
                    }
                }
            }
        }

        // Group completion order is nondeterministic; report and retest the
        // failures in list order.
        let mut failed = failed_commands.lock().unwrap().clone();
        let order: HashMap<&str, usize> = tests
            .iter()
            .enumerate()
            .map(|(idx, test)| (test.as_str(), idx))
            .collect();
        failed.sort_by_key(|c| order.get(c.test.as_str()).copied().unwrap_or(usize::MAX));
        for command in &failed {
            mux.mark_failed(&command.test);
        }

        if cancelled {
            return (mux.test_logs(), Some(RunFailure::Cancelled));
        }
        if let Some(source) = infra {
            return (
                mux.test_logs(),
                Some(RunFailure::Infra {
                    phase: Phase::Test,
                    source,
                }),
            );
        }
        if failed.is_empty() {
            return (mux.test_logs(), None);
        }
        if !distributed.retest {
            return (mux.test_logs(), Some(RunFailure::Tests));
        }

        self.run_retest(job, distributed, &failed, token.as_deref(), &mux, cancel)
            .await
    }

    /// Rerun the union of failed tests as a single batched command in one
    /// container.
    async fn run_retest(
        &self,
        job: &JobConfig,
        distributed: &DistributedConfig,
        failed: &[TestCommand],
        token: Option<&str>,
        mux: &Arc<LogMultiplexer>,
        cancel: &CancellationToken,
    ) -> (Vec<TestLog>, Option<RunFailure>) {
        let failed_names: Vec<String> = failed.iter().map(|c| c.test.clone()).collect();
        info!("retesting {} failed test(s)", failed_names.len());
        let _ = writeln!(self.sink.lock().unwrap(), "start retest....");

        // A failed or aborted retest reports the first-pass state.
        let snapshot = mux.test_logs();

        let batch = failed_names.join(distributed.retest_delimiter());
        let (pod, commands) = spec::group_pod(job, std::slice::from_ref(&batch), token);
        for command in &commands {
            mux.register(&command.container, &command.test, &job.command);
        }

        match self.executor.submit(&pod, mux.log_sink(), cancel).await {
            Ok(()) => {
                if distributed.retest_marks_passed {
                    mux.mark_succeeded(&failed_names);
                    (mux.test_logs(), None)
                } else {
                    // First-pass outcomes stand even though the batch
                    // passed; re-mark them in case the batch entry landed on
                    // a failed test's name.
                    for name in &failed_names {
                        mux.mark_failed(name);
                    }
                    (mux.test_logs(), Some(RunFailure::Tests))
                }
            }
            Err(ClusterError::FailedJob(_)) => (snapshot, Some(RunFailure::Tests)),
            Err(ClusterError::Cancelled) => (snapshot, Some(RunFailure::Cancelled)),
            Err(source) => (
                snapshot,
                Some(RunFailure::Infra {
                    phase: Phase::Retest,
                    source,
                }),
            ),
        }
    }

    /// Sink forwarding container output straight to the diagnostic stream.
    fn forward_sink(&self) -> LogSink {
        let sink = Arc::clone(&self.sink);
        Arc::new(move |event: &LogEvent| {
            if !event.finished {
                let _ = writeln!(sink.lock().unwrap(), "{}", event.chunk);
            }
        })
    }
}

/// Map a pod's failed containers back to the commands they were running via
/// their `TEST` env var.
fn commands_for_failed_containers(
    commands: &[TestCommand],
    failed: &crate::cluster::FailedJob,
) -> Vec<TestCommand> {
    let by_test: HashMap<&str, &TestCommand> =
        commands.iter().map(|c| (c.test.as_str(), c)).collect();

    let mut out = Vec::new();
    for container in &failed.failed_containers {
        let Some(test) = container.env_value(spec::TEST_ENV) else {
            continue;
        };
        if let Some(command) = by_test.get(test) {
            out.push((*command).clone());
        }
    }
    out
}

/// Apply descriptor defaults: branch falls back to `master` when neither
/// branch nor revision is set.
fn normalize(job: &JobConfig) -> JobConfig {
    let mut job = job.clone();
    if job.branch.is_none() && job.rev.is_none() {
        job.branch = Some("master".to_string());
    }
    job
}
