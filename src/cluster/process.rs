//! Local process executor.
//!
//! Runs pod specs as child processes on the local machine: init containers
//! sequentially, then all primary containers concurrently. Every container
//! of a pod shares one scratch directory standing in for the pod
//! filesystem; absolute container paths (the workspace mount, cache paths)
//! are re-rooted under it, so the shared-volume semantics hold.
//!
//! Images are advisory and not pulled; commands run on the host shell.
//! This is the development and test executor, not a container scheduler.
//!
//! # Example
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
//!     let executor = Arc::new(ProcessExecutor::new());
//!     let scheduler = TestScheduler::new(executor);
//!     let report = scheduler.run(&job, &CancellationToken::new()).await?;
//!     println!("{} tests ran", report.details.tests.len());
//!     Ok(())
//! }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{
    ClusterError, ClusterExecutor, ClusterResult, ContainerSpec, EnvVar, FailedJob, LogEvent,
    LogSink, PodSpec, PodStatusSnapshot,
};

/// Executor running pods as local child processes.
///
/// Secrets are held in memory and installed with
/// [`with_secret`](ProcessExecutor::with_secret).
#[derive(Default)]
pub struct ProcessExecutor {
    secrets: Mutex<HashMap<(String, String), HashMap<String, Vec<u8>>>>,
}

impl ProcessExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install one key of a named secret.
    pub fn with_secret(
        self,
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<Vec<u8>>,
    ) -> Self {
        self.secrets
            .lock()
            .unwrap()
            .entry((namespace.into(), name.into()))
            .or_default()
            .insert(key.into(), value.into());
        self
    }
}

#[async_trait]
impl ClusterExecutor for ProcessExecutor {
    async fn submit(
        &self,
        pod: &PodSpec,
        sink: LogSink,
        cancel: &CancellationToken,
    ) -> ClusterResult<()> {
        debug!(pod = %pod.name, "running pod as local processes");
        let scratch = tempfile::tempdir()?;
        let status = Arc::new(Mutex::new(PodStatusSnapshot::new()));

        for container in &pod.init_containers {
            let ok = run_container(
                &pod.name,
                container,
                scratch.path(),
                &sink,
                &status,
                cancel,
            )
            .await?;
            if !ok {
                return Err(ClusterError::FailedJob(FailedJob {
                    pod: pod.name.clone(),
                    failed_containers: vec![container.clone()],
                }));
            }
        }

        let mut handles = Vec::new();
        for container in pod.containers.clone() {
            let pod_name = pod.name.clone();
            let scratch_dir = scratch.path().to_path_buf();
            let sink = Arc::clone(&sink);
            let status = Arc::clone(&status);
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let ok = run_container(
                    &pod_name,
                    &container,
                    &scratch_dir,
                    &sink,
                    &status,
                    &cancel,
                )
                .await?;
                Ok::<_, ClusterError>((container, ok))
            }));
        }

        let mut failed_containers = Vec::new();
        let mut cancelled = false;
        let mut first_error: Option<ClusterError> = None;
        for handle in handles {
            match handle.await {
                Ok(Ok((_, true))) => {}
                Ok(Ok((container, false))) => failed_containers.push(container),
                Ok(Err(ClusterError::Cancelled)) => cancelled = true,
                Ok(Err(err)) => {
                    if first_error.is_none() {
                        first_error = Some(err);
                    }
                }
                Err(err) => {
                    if first_error.is_none() {
                        first_error = Some(ClusterError::Transport(err.to_string()));
                    }
                }
            }
        }

        if cancelled {
            return Err(ClusterError::Cancelled);
        }
        if let Some(err) = first_error {
            return Err(err);
        }
        if !failed_containers.is_empty() {
            return Err(ClusterError::FailedJob(FailedJob {
                pod: pod.name.clone(),
                failed_containers,
            }));
        }
        Ok(())
    }

    async fn secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<HashMap<String, Vec<u8>>> {
        self.secrets
            .lock()
            .unwrap()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| ClusterError::SecretNotFound {
                namespace: namespace.to_string(),
                name: name.to_string(),
            })
    }
}

/// Run one container to completion, streaming its output. Returns whether
/// it exited zero.
async fn run_container(
    pod_name: &str,
    container: &ContainerSpec,
    scratch: &Path,
    sink: &LogSink,
    status: &Arc<Mutex<PodStatusSnapshot>>,
    cancel: &CancellationToken,
) -> ClusterResult<bool> {
    let argv: Vec<String> = container
        .command
        .iter()
        .chain(container.args.iter())
        .map(|part| {
            remap_mount_paths(
                &expand_env_refs(part, &container.env),
                container,
                scratch,
            )
        })
        .collect();
    if argv.is_empty() {
        return Err(ClusterError::SubmitFailed(format!(
            "container {} has no command",
            container.name
        )));
    }

    let cwd = resolve_dir(scratch, container.working_dir.as_deref())?;

    let mut command = Command::new(&argv[0]);
    command
        .args(&argv[1..])
        .current_dir(&cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    for var in &container.env {
        command.env(&var.name, expand_env_refs(&var.value, &container.env));
    }

    let mut child = command.spawn().map_err(|err| {
        ClusterError::SubmitFailed(format!(
            "failed to start container {}: {}",
            container.name, err
        ))
    })?;
    status
        .lock()
        .unwrap()
        .record_running(&container.name, Utc::now());

    let emit = |chunk: String, finished: bool| {
        sink(&LogEvent {
            pod: pod_name.to_string(),
            container: container.name.clone(),
            chunk,
            finished,
            status: status.lock().unwrap().clone(),
        });
    };

    let mut stdout = BufReader::new(child.stdout.take().expect("piped stdout")).lines();
    let mut stderr = BufReader::new(child.stderr.take().expect("piped stderr")).lines();
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !(stdout_done && stderr_done) {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                return Err(ClusterError::Cancelled);
            }
            line = stdout.next_line(), if !stdout_done => match line {
                Ok(Some(line)) => emit(line, false),
                _ => stdout_done = true,
            },
            line = stderr.next_line(), if !stderr_done => match line {
                Ok(Some(line)) => emit(line, false),
                _ => stderr_done = true,
            },
        }
    }

    let exit = tokio::select! {
        _ = cancel.cancelled() => {
            let _ = child.kill().await;
            return Err(ClusterError::Cancelled);
        }
        exit = child.wait() => exit?,
    };

    emit(String::new(), true);
    Ok(exit.success())
}

/// Re-root an absolute container path under the pod scratch directory.
fn resolve_dir(scratch: &Path, working_dir: Option<&str>) -> std::io::Result<PathBuf> {
    let dir = match working_dir {
        Some(dir) => scratch.join(dir.trim_start_matches('/')),
        None => scratch.to_path_buf(),
    };
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Expand Kubernetes-style `$(NAME)` references against the container env.
fn expand_env_refs(value: &str, env: &[EnvVar]) -> String {
    let mut out = value.to_string();
    for var in env {
        out = out.replace(&format!("$({})", var.name), &var.value);
    }
    out
}

/// Re-root an argument that names a volume mount path (e.g. the clone
/// destination) under the pod scratch directory. Paths buried inside shell
/// scripts are not rewritten; scripts should stay relative to the working
/// directory.
fn remap_mount_paths(arg: &str, container: &ContainerSpec, scratch: &Path) -> String {
    for mount in &container.volume_mounts {
        if arg == mount.mount_path || arg.starts_with(&format!("{}/", mount.mount_path)) {
            return scratch
                .join(arg.trim_start_matches('/'))
                .to_string_lossy()
                .into_owned();
        }
    }
    arg.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shell_container(name: &str, script: &str) -> ContainerSpec {
        ContainerSpec {
            name: name.into(),
            image: "ignored".into(),
            command: vec!["sh".into()],
            args: vec!["-c".into(), script.into()],
            working_dir: Some("/workspace".into()),
            env: Vec::new(),
            volume_mounts: Vec::new(),
        }
    }

    fn pod(containers: Vec<ContainerSpec>, init: Vec<ContainerSpec>) -> PodSpec {
        PodSpec {
            name: "pod-test".into(),
            namespace: "default".into(),
            volumes: Vec::new(),
            init_containers: init,
            containers,
            image_pull_secrets: Vec::new(),
        }
    }

    fn recording_sink() -> (LogSink, Arc<Mutex<Vec<LogEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink: LogSink = {
            let events = Arc::clone(&events);
            Arc::new(move |event| events.lock().unwrap().push(event.clone()))
        };
        (sink, events)
    }

    #[tokio::test]
    async fn streams_lines_then_terminal_event() {
        let executor = ProcessExecutor::new();
        let (sink, events) = recording_sink();

        executor
            .submit(
                &pod(vec![shell_container("c0", "echo one; echo two")], vec![]),
                sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = events.lock().unwrap();
        let chunks: Vec<&str> = events
            .iter()
            .filter(|e| !e.finished)
            .map(|e| e.chunk.as_str())
            .collect();
        assert_eq!(chunks, vec!["one", "two"]);
        assert!(events.last().unwrap().finished);
        assert!(events
            .last()
            .unwrap()
            .status
            .running_started_at("c0")
            .is_some());
    }

    #[tokio::test]
    async fn nonzero_exit_reports_failed_containers() {
        let executor = ProcessExecutor::new();
        let (sink, _) = recording_sink();

        let err = executor
            .submit(
                &pod(
                    vec![
                        shell_container("ok", "true"),
                        shell_container("bad", "exit 3"),
                    ],
                    vec![],
                ),
                sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        match err {
            ClusterError::FailedJob(failed) => {
                assert_eq!(failed.pod, "pod-test");
                assert_eq!(failed.failed_containers.len(), 1);
                assert_eq!(failed.failed_containers[0].name, "bad");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn failing_init_container_short_circuits() {
        let executor = ProcessExecutor::new();
        let (sink, events) = recording_sink();

        let err = executor
            .submit(
                &pod(
                    vec![shell_container("never", "echo never")],
                    vec![shell_container("init", "exit 1")],
                ),
                sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::FailedJob(_)));
        assert!(events
            .lock()
            .unwrap()
            .iter()
            .all(|e| e.container != "never"));
    }

    #[tokio::test]
    async fn mount_path_args_are_rerooted() {
        use crate::cluster::VolumeMount;

        let executor = ProcessExecutor::new();
        let (sink, events) = recording_sink();

        let init = ContainerSpec {
            name: "init".into(),
            image: "ignored".into(),
            command: vec!["touch".into()],
            args: vec!["/workspace/made".into()],
            working_dir: Some("/workspace".into()),
            env: Vec::new(),
            volume_mounts: vec![VolumeMount::new("workspace", "/workspace")],
        };
        let reader = shell_container("reader", "ls made");

        executor
            .submit(
                &pod(vec![reader], vec![init]),
                sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.container == "reader" && e.chunk == "made"));
    }

    #[tokio::test]
    async fn containers_share_the_pod_scratch_dir() {
        let executor = ProcessExecutor::new();
        let (sink, events) = recording_sink();

        executor
            .submit(
                &pod(
                    vec![shell_container("read", "cat marker")],
                    vec![shell_container("write", "echo shared > marker")],
                ),
                sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let events = events.lock().unwrap();
        assert!(events
            .iter()
            .any(|e| e.container == "read" && e.chunk == "shared"));
    }

    #[tokio::test]
    async fn expands_env_references() {
        let executor = ProcessExecutor::new();
        let (sink, events) = recording_sink();

        let mut container = shell_container("c0", "echo url=$(TOKEN)@host");
        container.env.push(EnvVar::new("TOKEN", "s3cret"));

        executor
            .submit(&pod(vec![container], vec![]), sink, &CancellationToken::new())
            .await
            .unwrap();

        assert!(events
            .lock()
            .unwrap()
            .iter()
            .any(|e| e.chunk == "url=s3cret@host"));
    }

    #[tokio::test]
    async fn cancellation_kills_running_containers() {
        let executor = ProcessExecutor::new();
        let (sink, _) = recording_sink();
        let cancel = CancellationToken::new();

        let cancel_soon = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            cancel_soon.cancel();
        });

        let started = std::time::Instant::now();
        let err = executor
            .submit(
                &pod(vec![shell_container("sleepy", "sleep 30")], vec![]),
                sink,
                &cancel,
            )
            .await
            .unwrap_err();

        assert!(matches!(err, ClusterError::Cancelled));
        assert!(started.elapsed() < std::time::Duration::from_secs(10));
    }

    #[tokio::test]
    async fn secret_lookup() {
        let executor =
            ProcessExecutor::new().with_secret("ci", "git-token", "token", "abc123");

        let data = executor.secret("ci", "git-token").await.unwrap();
        assert_eq!(data.get("token").unwrap(), b"abc123");

        let err = executor.secret("ci", "missing").await.unwrap_err();
        assert!(matches!(err, ClusterError::SecretNotFound { .. }));
    }
}
