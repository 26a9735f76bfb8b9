//! Job description schema.
//!
//! A [`JobConfig`] is the immutable input to a scheduler run: where the code
//! lives, what image to run it in, the command under test, and (optionally)
//! how to shard the suite across pods.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cluster::{EnvVar, Volume, VolumeMount};

/// A single test job description.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobConfig {
    /// Job name; also the `job` field of the result record.
    pub name: String,

    /// Cluster namespace pods are submitted into.
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Image the test command runs in.
    pub image: String,

    /// Image for the clone/checkout init containers.
    #[serde(default)]
    pub git_image: Option<String>,

    /// Repository handle without scheme or `.git` suffix,
    /// e.g. `github.com/org/repo`.
    pub repo: String,

    /// Branch to clone. When neither `branch` nor `rev` is set, the branch
    /// defaults to `master`.
    #[serde(default)]
    pub branch: Option<String>,

    /// Revision to check out after cloning.
    #[serde(default)]
    pub rev: Option<String>,

    /// Git token, literal or fetched from a cluster secret.
    #[serde(default)]
    pub token: Option<TokenConfig>,

    /// Shell command under test. May contain arbitrary shell content; it is
    /// base64-encoded before it reaches the container.
    pub command: String,

    /// Working directory for the test command. Defaults to the shared
    /// workspace mount.
    #[serde(default)]
    pub workdir: Option<String>,

    /// Extra environment for test containers.
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Extra pod volumes.
    #[serde(default)]
    pub volumes: Vec<Volume>,

    /// Extra mounts for test containers.
    #[serde(default)]
    pub volume_mounts: Vec<VolumeMount>,

    /// Image pull secret names, passed through to the cluster.
    #[serde(default)]
    pub image_pull_secrets: Vec<String>,

    /// Whether test pods clone the repository. Defaults to true.
    #[serde(default)]
    pub checkout: Option<bool>,

    /// Prepare stage run before any test pod.
    #[serde(default)]
    pub prepare: PrepareConfig,

    /// Distributed execution settings. Absent means the job command runs
    /// once in a single container.
    #[serde(default)]
    pub distributed: Option<DistributedConfig>,

    /// Free-form fields merged into the result record, overriding the
    /// standard fields on conflict.
    #[serde(default)]
    pub log_fields: HashMap<String, serde_json::Value>,

    /// Artifacts exported by the resource manager after the run.
    #[serde(default)]
    pub export_artifacts: Vec<ArtifactConfig>,
}

fn default_namespace() -> String {
    "default".to_string()
}

impl JobConfig {
    /// Whether test pods get the clone/checkout init containers.
    pub fn checkout_enabled(&self) -> bool {
        self.checkout.unwrap_or(true)
    }

    /// Check the job for problems a parse cannot catch.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::MissingField("name"));
        }
        if self.image.is_empty() {
            return Err(ConfigError::MissingField("image"));
        }
        if self.command.is_empty() {
            return Err(ConfigError::MissingField("command"));
        }
        if let Some(token) = &self.token {
            token.validate()?;
        }
        if let Some(distributed) = &self.distributed {
            distributed.validate()?;
        }
        Ok(())
    }
}

/// Problems with a job description.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),

    #[error("token must set exactly one of `value` and `secret_ref`")]
    AmbiguousToken,

    #[error("distributed.max_containers_per_pod must be at least 1")]
    InvalidMaxContainers,

    #[error("invalid distributed.pattern: {0}")]
    InvalidPattern(#[from] regex::Error),
}

/// Git token source: a literal value or a reference to a cluster secret.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct TokenConfig {
    /// Literal token value.
    #[serde(default)]
    pub value: Option<String>,

    /// Cluster secret holding the token.
    #[serde(default)]
    pub secret_ref: Option<SecretKeyRef>,
}

impl TokenConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        match (&self.value, &self.secret_ref) {
            (Some(_), None) | (None, Some(_)) => Ok(()),
            _ => Err(ConfigError::AmbiguousToken),
        }
    }
}

/// Reference to one key of a cluster secret.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecretKeyRef {
    pub name: String,
    pub key: String,
}

/// Prepare stage: ordered steps sharing the workspace volume, run to
/// completion before any test pod starts.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PrepareConfig {
    /// Default image for steps that do not set their own.
    #[serde(default)]
    pub image: Option<String>,

    /// Whether the prepare pod clones the repository first. Defaults to true.
    #[serde(default)]
    pub checkout: Option<bool>,

    /// Steps, run in order.
    #[serde(default)]
    pub steps: Vec<PrepareStep>,
}

impl PrepareConfig {
    pub fn checkout_enabled(&self) -> bool {
        self.checkout.unwrap_or(true)
    }
}

/// One prepare step.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PrepareStep {
    /// Container name of the step.
    pub name: String,

    /// Image override. Falls back to `prepare.image`, then the job image.
    #[serde(default)]
    pub image: Option<String>,

    /// Working directory override. Falls back to the workspace mount.
    #[serde(default)]
    pub workdir: Option<String>,

    /// Step environment, prepended to the job environment.
    #[serde(default)]
    pub env: Vec<EnvVar>,

    /// Shell command the step runs.
    pub command: String,
}

/// Settings for sharding a suite across pods.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DistributedConfig {
    /// Shell command that prints the test list.
    pub list_command: String,

    /// Delimiter splitting the list output. Defaults to newline.
    #[serde(default)]
    pub list_delimiter: Option<String>,

    /// Regular expression; only matching list entries survive.
    #[serde(default)]
    pub pattern: Option<String>,

    /// Upper bound on test containers per pod.
    #[serde(default = "default_max_containers_per_pod")]
    pub max_containers_per_pod: usize,

    /// Cache init containers: each primes `path` on its own ephemeral
    /// volume before the test containers start.
    #[serde(default)]
    pub cache: Vec<CacheConfig>,

    /// Rerun the union of failed tests as one batch after the first pass.
    #[serde(default)]
    pub retest: bool,

    /// Delimiter joining failed test names into the retest command's `TEST`
    /// value. Defaults to a single space.
    #[serde(default)]
    pub retest_delimiter: Option<String>,

    /// Whether a passing retest flips the first-pass failures to `success`
    /// in the result record. When false (the default) the first-pass outcome
    /// stands and the run still reports failure.
    #[serde(default)]
    pub retest_marks_passed: bool,
}

fn default_max_containers_per_pod() -> usize {
    4
}

impl DistributedConfig {
    /// Delimiter for splitting the list output.
    pub fn list_delimiter(&self) -> &str {
        self.list_delimiter.as_deref().unwrap_or("\n")
    }

    /// Delimiter for joining failed test names in the retest pass.
    pub fn retest_delimiter(&self) -> &str {
        self.retest_delimiter.as_deref().unwrap_or(" ")
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_containers_per_pod < 1 {
            return Err(ConfigError::InvalidMaxContainers);
        }
        if self.list_command.is_empty() {
            return Err(ConfigError::MissingField("distributed.list_command"));
        }
        if let Some(pattern) = &self.pattern {
            regex::Regex::new(pattern)?;
        }
        Ok(())
    }
}

/// One cache volume warmed by an init container.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheConfig {
    /// Volume and container name.
    pub name: String,

    /// Mount path of the cache volume.
    pub path: String,

    /// Shell command that primes the cache.
    pub command: String,
}

/// One artifact exported after the run.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ArtifactConfig {
    /// Artifact name, used for path lookups.
    pub name: String,

    /// Local path the artifact is produced at.
    pub path: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::load_job_str;

    const FULL_JOB: &str = r#"
name = "unit"
namespace = "ci"
image = "golang:1.22"
repo = "github.com/example/service"
branch = "main"
command = "go test $TEST"

[[env]]
name = "GOFLAGS"
value = "-count=1"

[token.secret_ref]
name = "git-token"
key = "token"

[[prepare.steps]]
name = "deps"
command = "go mod download"

[distributed]
list_command = "go list ./..."
pattern = "^github.com/example"
max_containers_per_pod = 8
retest = true
retest_delimiter = " "

[[distributed.cache]]
name = "gomod"
path = "/go/pkg/mod"
command = "go mod download"

[log_fields]
team = "platform"
"#;

    #[test]
    fn parse_full_job() {
        let job = load_job_str(FULL_JOB).unwrap();
        assert_eq!(job.name, "unit");
        assert_eq!(job.namespace, "ci");
        assert_eq!(job.env.len(), 1);
        assert!(job.checkout_enabled());
        assert!(job.prepare.checkout_enabled());

        let distributed = job.distributed.as_ref().unwrap();
        assert_eq!(distributed.max_containers_per_pod, 8);
        assert_eq!(distributed.list_delimiter(), "\n");
        assert_eq!(distributed.retest_delimiter(), " ");
        assert!(!distributed.retest_marks_passed);
        assert_eq!(distributed.cache.len(), 1);

        job.validate().unwrap();
    }

    #[test]
    fn minimal_job_defaults() {
        let job = load_job_str(
            r#"
name = "smoke"
image = "alpine"
repo = "github.com/example/service"
command = "echo hi"
"#,
        )
        .unwrap();
        assert_eq!(job.namespace, "default");
        assert!(job.distributed.is_none());
        assert!(job.branch.is_none());
        job.validate().unwrap();
    }

    #[test]
    fn rejects_ambiguous_token() {
        let mut job = load_job_str(FULL_JOB).unwrap();
        job.token = Some(TokenConfig {
            value: Some("x".into()),
            secret_ref: Some(SecretKeyRef {
                name: "git-token".into(),
                key: "token".into(),
            }),
        });
        assert!(matches!(
            job.validate(),
            Err(ConfigError::AmbiguousToken)
        ));
    }

    #[test]
    fn rejects_zero_containers_per_pod() {
        let mut job = load_job_str(FULL_JOB).unwrap();
        job.distributed.as_mut().unwrap().max_containers_per_pod = 0;
        assert!(matches!(
            job.validate(),
            Err(ConfigError::InvalidMaxContainers)
        ));
    }

    #[test]
    fn rejects_bad_pattern() {
        let mut job = load_job_str(FULL_JOB).unwrap();
        job.distributed.as_mut().unwrap().pattern = Some("(".into());
        assert!(matches!(job.validate(), Err(ConfigError::InvalidPattern(_))));
    }
}
