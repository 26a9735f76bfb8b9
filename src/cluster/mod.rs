//! Cluster executor seam: the pod model, log events, and the trait the
//! scheduler submits work through.
//!
//! The scheduler core never talks to a concrete cluster API. It builds
//! [`PodSpec`]s and hands them to a [`ClusterExecutor`], which owns pod
//! lifecycle, log streaming, and the distinction between transport failures
//! and containers that ran but exited non-zero. The in-tree
//! [`process::ProcessExecutor`] runs pods as local processes; production
//! deployments implement the trait against their cluster client.

pub mod process;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

/// Result type for cluster operations.
pub type ClusterResult<T> = Result<T, ClusterError>;

/// Errors that can occur while talking to the cluster.
///
/// [`ClusterError::FailedJob`] is the only variant that means the pod ran:
/// the infrastructure did its job and one or more containers exited non-zero.
/// Every other variant is an infrastructure failure.
#[derive(Debug, thiserror::Error)]
pub enum ClusterError {
    /// The pod ran to completion but at least one container failed.
    #[error("pod {} finished with {} failed container(s)", .0.pod, .0.failed_containers.len())]
    FailedJob(FailedJob),

    #[error("secret {namespace}/{name} not found")]
    SecretNotFound { namespace: String, name: String },

    #[error("failed to submit pod: {0}")]
    SubmitFailed(String),

    #[error("cluster transport error: {0}")]
    Transport(String),

    #[error("submission cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Containers of a completed pod that exited non-zero.
///
/// The specs carry their env so callers can map a failed container back to
/// the test it was running.
#[derive(Debug, Clone)]
pub struct FailedJob {
    /// Name of the pod the containers belonged to.
    pub pod: String,
    /// Specs of the containers that exited non-zero.
    pub failed_containers: Vec<ContainerSpec>,
}

/// An environment variable on a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

/// A pod-scoped volume.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(default)]
    pub source: VolumeSource,
}

impl Volume {
    /// An ephemeral volume that lives and dies with the pod.
    pub fn ephemeral(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            source: VolumeSource::EmptyDir,
        }
    }
}

/// Backing source of a [`Volume`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSource {
    /// Ephemeral scratch space, destroyed with the pod.
    #[default]
    EmptyDir,
    /// A path on the node running the pod.
    HostPath { path: String },
}

/// A volume mounted into a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

impl VolumeMount {
    pub fn new(name: impl Into<String>, mount_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mount_path: mount_path.into(),
        }
    }
}

/// Specification of a single container in a pod.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Container name, unique within the pod.
    pub name: String,
    /// Image to run.
    pub image: String,
    /// Entrypoint argv.
    pub command: Vec<String>,
    /// Arguments appended to the entrypoint.
    pub args: Vec<String>,
    /// Working directory, if set.
    pub working_dir: Option<String>,
    /// Environment. Values may reference other variables as `$(NAME)`.
    pub env: Vec<EnvVar>,
    /// Volumes mounted into this container.
    pub volume_mounts: Vec<VolumeMount>,
}

impl ContainerSpec {
    /// Look up an environment variable by name.
    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

/// Specification of a pod: init containers run sequentially to completion,
/// then all primary containers run concurrently.
#[derive(Debug, Clone)]
pub struct PodSpec {
    /// Pod name, unique for the scheduler run.
    pub name: String,
    /// Namespace to submit into.
    pub namespace: String,
    /// Volumes shared by the pod's containers.
    pub volumes: Vec<Volume>,
    /// Containers run one after another before the primaries start.
    pub init_containers: Vec<ContainerSpec>,
    /// Containers run concurrently; the pod finishes when all have exited.
    pub containers: Vec<ContainerSpec>,
    /// Names of image pull secrets, passed through to the cluster.
    pub image_pull_secrets: Vec<String>,
}

/// Point-in-time view of per-container state, attached to every log event.
#[derive(Debug, Clone, Default)]
pub struct PodStatusSnapshot {
    running: HashMap<String, DateTime<Utc>>,
}

impl PodStatusSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that a container entered the running state at `at`.
    pub fn record_running(&mut self, container: impl Into<String>, at: DateTime<Utc>) {
        self.running.insert(container.into(), at);
    }

    /// When the named container entered the running state, if observed.
    pub fn running_started_at(&self, container: &str) -> Option<DateTime<Utc>> {
        self.running.get(container).copied()
    }
}

/// A streamed log event.
///
/// Executors must deliver all non-terminal events for a container before its
/// terminal event, and exactly one terminal event per container.
#[derive(Debug, Clone)]
pub struct LogEvent {
    /// Pod the event came from.
    pub pod: String,
    /// Container the event came from.
    pub container: String,
    /// One line of output, without its trailing newline. Empty on the
    /// terminal event.
    pub chunk: String,
    /// True once the container has terminated; no further events follow for
    /// this container.
    pub finished: bool,
    /// Pod status at the time of the event.
    pub status: PodStatusSnapshot,
}

/// Shared callback invoked for every log event of a submission.
///
/// Invocations may come from multiple pods concurrently; implementations must
/// be internally synchronized and must not block on cluster IO.
pub type LogSink = Arc<dyn Fn(&LogEvent) + Send + Sync>;

/// A log sink that drops every event.
pub fn null_sink() -> LogSink {
    Arc::new(|_: &LogEvent| {})
}

/// Submits pods and streams their logs.
#[async_trait]
pub trait ClusterExecutor: Send + Sync {
    /// Submit a pod and wait for it to finish, delivering log events to
    /// `sink` as they arrive.
    ///
    /// Returns `Ok(())` when every container exited zero,
    /// [`ClusterError::FailedJob`] when the pod ran but containers failed,
    /// [`ClusterError::Cancelled`] when `cancel` fired mid-flight, and any
    /// other variant for infrastructure failures.
    async fn submit(
        &self,
        pod: &PodSpec,
        sink: LogSink,
        cancel: &CancellationToken,
    ) -> ClusterResult<()>;

    /// Fetch a named secret's key/value data.
    async fn secret(
        &self,
        namespace: &str,
        name: &str,
    ) -> ClusterResult<HashMap<String, Vec<u8>>>;
}
