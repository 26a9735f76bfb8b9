//! Process-local resources: repository clones, token files, and exported
//! artifacts.
//!
//! The [`ResourceManager`] is the sole owner of everything the run
//! materializes on the local filesystem. [`setup`](ResourceManager::setup)
//! clones the configured repositories exactly once, even under concurrent
//! callers; every path accessor fails with [`ResourceError::NotSetup`]
//! until it has completed. [`cleanup`](ResourceManager::cleanup) must run
//! unconditionally after the scheduler returns.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::{ArtifactConfig, JobConfig};

/// Result type for resource operations.
pub type ResourceResult<T> = Result<T, ResourceError>;

/// Errors from resource materialization and lookup.
#[derive(Debug, thiserror::Error)]
pub enum ResourceError {
    #[error("resource manager is not set up")]
    NotSetup,

    #[error("unknown repository {0}")]
    UnknownRepository(String),

    #[error("unknown token {0}")]
    UnknownToken(String),

    #[error("unknown artifact {0}")]
    UnknownArtifact(String),

    #[error("failed to clone {repo}: {detail}")]
    CloneFailed { repo: String, detail: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A repository to clone during setup.
#[derive(Debug, Clone)]
pub struct RepoSpec {
    /// Lookup name, usually the repository handle.
    pub name: String,
    /// Clone URL, without credentials.
    pub url: String,
    /// Branch to clone, when pinned.
    pub branch: Option<String>,
    /// Name of the token authenticating the clone, if any.
    pub token: Option<String>,
}

/// A token to materialize as a file.
#[derive(Debug, Clone)]
pub struct TokenSpec {
    pub name: String,
    pub value: String,
}

/// Owner of process-local clones, token files, and artifact exports.
pub struct ResourceManager {
    base: PathBuf,
    repos: Vec<RepoSpec>,
    tokens: Vec<TokenSpec>,
    artifacts: Vec<ArtifactConfig>,
    setup_guard: Mutex<()>,
    done: AtomicBool,
}

impl ResourceManager {
    pub fn new(repos: Vec<RepoSpec>, tokens: Vec<TokenSpec>, artifacts: Vec<ArtifactConfig>) -> Self {
        let base = std::env::temp_dir().join(format!("scatter-{}", Uuid::new_v4().simple()));
        Self {
            base,
            repos,
            tokens,
            artifacts,
            setup_guard: Mutex::new(()),
            done: AtomicBool::new(false),
        }
    }

    /// Build a manager for the job's repository, literal token, and
    /// exported artifacts.
    pub fn for_job(job: &JobConfig) -> Self {
        let token = job.token.as_ref().and_then(|t| t.value.clone());
        let repos = vec![RepoSpec {
            name: job.repo.clone(),
            url: format!("https://{}.git", job.repo),
            branch: job.branch.clone(),
            token: token.as_ref().map(|_| "default".to_string()),
        }];
        let tokens = token
            .map(|value| {
                vec![TokenSpec {
                    name: "default".to_string(),
                    value,
                }]
            })
            .unwrap_or_default();
        Self::new(repos, tokens, job.export_artifacts.clone())
    }

    /// Materialize all resources. Safe to call repeatedly and concurrently;
    /// the clone work runs at most once.
    pub async fn setup(&self) -> ResourceResult<()> {
        let _guard = self.setup_guard.lock().await;
        if self.done.load(Ordering::Acquire) {
            return Ok(());
        }

        tokio::fs::create_dir_all(self.base.join("tokens")).await?;
        tokio::fs::create_dir_all(self.base.join("artifacts")).await?;

        // Token files first; clones authenticate through them.
        for token in &self.tokens {
            tokio::fs::write(self.token_file(&token.name), &token.value).await?;
        }
        for repo in &self.repos {
            self.clone_repo(repo).await?;
        }

        self.done.store(true, Ordering::Release);
        Ok(())
    }

    /// Remove everything the manager materialized.
    pub fn cleanup(&self) -> ResourceResult<()> {
        if self.base.exists() {
            std::fs::remove_dir_all(&self.base)?;
        }
        Ok(())
    }

    /// Local path of a cloned repository.
    pub fn repository_path_by_name(&self, name: &str) -> ResourceResult<PathBuf> {
        self.ensure_setup()?;
        let repo = self
            .repos
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| ResourceError::UnknownRepository(name.to_string()))?;
        Ok(self.repo_dir(repo))
    }

    /// Local path of a materialized token file.
    pub async fn token_path_by_name(&self, name: &str) -> ResourceResult<PathBuf> {
        self.ensure_setup()?;
        if !self.tokens.iter().any(|t| t.name == name) {
            return Err(ResourceError::UnknownToken(name.to_string()));
        }
        Ok(self.token_file(name))
    }

    /// Local path an artifact is exported to.
    pub fn artifact_path_by_name(&self, name: &str) -> ResourceResult<PathBuf> {
        self.ensure_setup()?;
        if !self.artifacts.iter().any(|a| a.name == name) {
            return Err(ResourceError::UnknownArtifact(name.to_string()));
        }
        Ok(self.base.join("artifacts").join(name))
    }

    /// Copy declared artifacts into the export directory. Artifacts whose
    /// source path does not exist are skipped with a warning.
    pub fn export_artifacts(&self) -> ResourceResult<Vec<PathBuf>> {
        self.ensure_setup()?;
        let mut exported = Vec::new();
        for artifact in &self.artifacts {
            let source = Path::new(&artifact.path);
            if !source.exists() {
                warn!(artifact = %artifact.name, path = %artifact.path, "artifact missing, skipping export");
                continue;
            }
            let dest = self.base.join("artifacts").join(&artifact.name);
            std::fs::copy(source, &dest)?;
            debug!(artifact = %artifact.name, dest = %dest.display(), "exported artifact");
            exported.push(dest);
        }
        Ok(exported)
    }

    fn ensure_setup(&self) -> ResourceResult<()> {
        if self.done.load(Ordering::Acquire) {
            Ok(())
        } else {
            Err(ResourceError::NotSetup)
        }
    }

    fn repo_dir(&self, repo: &RepoSpec) -> PathBuf {
        let leaf = repo.name.rsplit('/').next().unwrap_or(&repo.name);
        self.base.join("repos").join(leaf)
    }

    fn token_file(&self, name: &str) -> PathBuf {
        self.base.join("tokens").join(name)
    }

    /// The clone command. The token never appears in the argv; the
    /// credential helper reads it from the materialized token file when git
    /// asks, so nothing secret is visible in the process table.
    fn clone_command(&self, repo: &RepoSpec) -> Command {
        const CREDENTIAL_HELPER: &str =
            r#"!f() { echo "username=$(cat "${SCATTER_TOKEN_FILE}")"; echo "password="; }; f"#;

        let mut command = Command::new("git");
        if let Some(token) = &repo.token {
            command.arg("-c").arg("credential.helper=");
            command
                .arg("-c")
                .arg(format!("credential.helper={}", CREDENTIAL_HELPER));
            command.env("SCATTER_TOKEN_FILE", self.token_file(token));
        }
        command.arg("clone");
        if let Some(branch) = &repo.branch {
            command.arg("-b").arg(branch);
        }
        command.arg(&repo.url).arg(self.repo_dir(repo));
        command
    }

    async fn clone_repo(&self, repo: &RepoSpec) -> ResourceResult<()> {
        let dest = self.repo_dir(repo);
        tokio::fs::create_dir_all(dest.parent().expect("repo dir has parent")).await?;

        debug!(repo = %repo.name, "cloning repository");
        let output = self.clone_command(repo).output().await?;
        if !output.status.success() {
            return Err(ResourceError::CloneFailed {
                repo: repo.name.clone(),
                detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn manager_without_repos() -> ResourceManager {
        ResourceManager::new(
            Vec::new(),
            vec![TokenSpec {
                name: "default".into(),
                value: "s3cret".into(),
            }],
            vec![ArtifactConfig {
                name: "report".into(),
                path: "does-not-exist".into(),
            }],
        )
    }

    #[tokio::test]
    async fn accessors_fail_before_setup() {
        let manager = manager_without_repos();
        assert!(matches!(
            manager.repository_path_by_name("any"),
            Err(ResourceError::NotSetup)
        ));
        assert!(matches!(
            manager.token_path_by_name("default").await,
            Err(ResourceError::NotSetup)
        ));
        assert!(matches!(
            manager.artifact_path_by_name("report"),
            Err(ResourceError::NotSetup)
        ));
        manager.cleanup().unwrap();
    }

    #[tokio::test]
    async fn setup_materializes_tokens() {
        let manager = manager_without_repos();
        manager.setup().await.unwrap();

        let path = manager.token_path_by_name("default").await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "s3cret");

        assert!(matches!(
            manager.token_path_by_name("other").await,
            Err(ResourceError::UnknownToken(_))
        ));
        manager.cleanup().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn setup_is_idempotent_under_concurrency() {
        let manager = Arc::new(manager_without_repos());

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            handles.push(tokio::spawn(async move { manager.setup().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        manager.setup().await.unwrap();
        manager.cleanup().unwrap();
    }

    #[test]
    fn for_job_keeps_token_out_of_clone_url() {
        let job = crate::config::load_job_str(
            r#"
name = "unit"
image = "img"
repo = "github.com/example/app"
command = "true"

[token]
value = "s3cret"
"#,
        )
        .unwrap();

        let manager = ResourceManager::for_job(&job);
        assert_eq!(manager.repos[0].url, "https://github.com/example/app.git");
        assert_eq!(manager.repos[0].token.as_deref(), Some("default"));
        assert_eq!(manager.tokens[0].value, "s3cret");
    }

    #[test]
    fn clone_command_keeps_token_out_of_argv() {
        let manager = ResourceManager::new(
            vec![RepoSpec {
                name: "github.com/example/app".into(),
                url: "https://github.com/example/app.git".into(),
                branch: Some("main".into()),
                token: Some("default".into()),
            }],
            vec![TokenSpec {
                name: "default".into(),
                value: "s3cret".into(),
            }],
            Vec::new(),
        );

        let command = manager.clone_command(&manager.repos[0]);
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        // The literal token travels only through the token file.
        assert!(args.iter().all(|a| !a.contains("s3cret")));
        assert!(args.contains(&"https://github.com/example/app.git".to_string()));
        assert!(command
            .as_std()
            .get_envs()
            .any(|(k, _)| k == std::ffi::OsStr::new("SCATTER_TOKEN_FILE")));
    }

    #[tokio::test]
    async fn export_copies_existing_artifacts_and_skips_missing() {
        let scratch = tempfile::tempdir().unwrap();
        let produced = scratch.path().join("junit.xml");
        std::fs::write(&produced, "<testsuite/>").unwrap();

        let manager = ResourceManager::new(
            Vec::new(),
            Vec::new(),
            vec![
                ArtifactConfig {
                    name: "junit".into(),
                    path: produced.to_string_lossy().into_owned(),
                },
                ArtifactConfig {
                    name: "missing".into(),
                    path: scratch.path().join("absent").to_string_lossy().into_owned(),
                },
            ],
        );
        manager.setup().await.unwrap();

        let exported = manager.export_artifacts().unwrap();
        assert_eq!(exported.len(), 1);
        assert_eq!(
            exported[0],
            manager.artifact_path_by_name("junit").unwrap()
        );
        assert_eq!(
            std::fs::read_to_string(&exported[0]).unwrap(),
            "<testsuite/>"
        );
        manager.cleanup().unwrap();
    }
}
