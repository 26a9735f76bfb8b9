//! Pod and container spec construction.
//!
//! Turns a [`JobConfig`] plus a command into the [`PodSpec`]s the cluster
//! executor runs: the clone/checkout init containers, the shared workspace
//! volume, cache-warming init containers, and the base64 wrapping that lets
//! descriptor commands contain arbitrary shell content.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use uuid::Uuid;

use crate::cluster::{ContainerSpec, EnvVar, PodSpec, Volume, VolumeMount};
use crate::config::{JobConfig, PrepareStep};

/// Name of the per-pod workspace volume.
pub const WORKSPACE_VOLUME: &str = "workspace";

/// Canonical mount path of the workspace volume.
pub const WORKSPACE_PATH: &str = "/workspace";

/// Env var carrying the git token into the clone container.
pub const OAUTH_TOKEN_ENV: &str = "OAUTH_TOKEN";

/// Env var carrying the test name into each distributed test container.
pub const TEST_ENV: &str = "TEST";

const DEFAULT_GIT_IMAGE: &str = "alpine/git";

/// One shell invocation bound to the test it represents.
///
/// All commands of a pod-group share argv and shell args; they differ only
/// in `test`, which reaches the container as the `TEST` env var. `container`
/// is the pod-container name the command was assigned to, unique for the
/// whole scheduler run.
#[derive(Debug, Clone)]
pub struct TestCommand {
    pub argv: Vec<String>,
    pub shell_args: Vec<String>,
    pub test: String,
    pub container: String,
}

/// Wrap a shell command so it survives the trip through the container argv.
///
/// The command string is base64-encoded and decoded back inside the
/// container (`sh -c "echo <b64> | base64 -d | sh"`), so quoting and shell
/// metacharacters in the descriptor command never meet the outer shell.
pub fn encode_command(command: &str) -> (Vec<String>, Vec<String>) {
    let encoded = BASE64_STANDARD.encode(command.as_bytes());
    (
        vec!["sh".to_string()],
        vec![
            "-c".to_string(),
            format!("echo {} | base64 -d | sh", encoded),
        ],
    )
}

fn generate_name(base: &str) -> String {
    format!("{}-{}", base, Uuid::new_v4().simple())
}

fn shared_volume() -> Volume {
    Volume::ephemeral(WORKSPACE_VOLUME)
}

fn shared_volume_mount() -> VolumeMount {
    VolumeMount::new(WORKSPACE_VOLUME, WORKSPACE_PATH)
}

fn git_image(job: &JobConfig) -> String {
    job.git_image
        .clone()
        .unwrap_or_else(|| DEFAULT_GIT_IMAGE.to_string())
}

fn clone_url(job: &JobConfig, has_token: bool) -> String {
    if has_token {
        format!("https://$({})@{}.git", OAUTH_TOKEN_ENV, job.repo)
    } else {
        format!("https://{}.git", job.repo)
    }
}

fn clone_container(job: &JobConfig, pod_name: &str, token: Option<&str>) -> ContainerSpec {
    let mount = shared_volume_mount();
    let mut args = vec!["clone".to_string()];
    if let Some(branch) = &job.branch {
        args.push("-b".to_string());
        args.push(branch.clone());
    }
    args.push(clone_url(job, token.is_some()));
    args.push(mount.mount_path.clone());

    let env = match token {
        Some(token) => vec![EnvVar::new(OAUTH_TOKEN_ENV, token)],
        None => Vec::new(),
    };

    ContainerSpec {
        name: format!("{}-init-clone", pod_name),
        image: git_image(job),
        command: vec!["git".to_string()],
        args,
        working_dir: None,
        env,
        volume_mounts: vec![mount],
    }
}

fn checkout_container(job: &JobConfig, pod_name: &str, rev: &str) -> ContainerSpec {
    let mount = shared_volume_mount();
    ContainerSpec {
        name: format!("{}-init-checkout", pod_name),
        image: git_image(job),
        command: vec!["git".to_string()],
        args: vec!["checkout".to_string(), "--detach".to_string(), rev.to_string()],
        working_dir: Some(mount.mount_path.clone()),
        env: Vec::new(),
        volume_mounts: vec![mount],
    }
}

/// The clone and (when a revision is pinned) checkout init containers.
pub fn init_containers(job: &JobConfig, pod_name: &str, token: Option<&str>) -> Vec<ContainerSpec> {
    let mut containers = vec![clone_container(job, pod_name, token)];
    if let Some(rev) = &job.rev {
        containers.push(checkout_container(job, pod_name, rev));
    }
    containers
}

fn working_dir(job: &JobConfig) -> String {
    job.workdir
        .clone()
        .unwrap_or_else(|| WORKSPACE_PATH.to_string())
}

fn test_volume_mounts(job: &JobConfig) -> Vec<VolumeMount> {
    let mut mounts = job.volume_mounts.clone();
    mounts.push(shared_volume_mount());
    mounts
}

/// A primary container running `command` with the job environment.
fn command_container(job: &JobConfig, name: String, command: &str, test: Option<&str>) -> ContainerSpec {
    let (argv, args) = encode_command(command);
    let mut env = job.env.clone();
    if let Some(test) = test {
        env.push(EnvVar::new(TEST_ENV, test));
    }
    ContainerSpec {
        name,
        image: job.image.clone(),
        command: argv,
        args,
        working_dir: Some(working_dir(job)),
        env,
        volume_mounts: test_volume_mounts(job),
    }
}

/// Cache-warming init containers and their ephemeral volumes.
fn cache_containers(job: &JobConfig, pod_name: &str) -> (Vec<Volume>, Vec<ContainerSpec>) {
    let Some(distributed) = &job.distributed else {
        return (Vec::new(), Vec::new());
    };

    let mut volumes = Vec::new();
    let mut containers = Vec::new();
    for cache in &distributed.cache {
        let (argv, args) = encode_command(&cache.command);
        let mut mounts = test_volume_mounts(job);
        mounts.push(VolumeMount::new(&cache.name, &cache.path));

        volumes.push(Volume::ephemeral(&cache.name));
        containers.push(ContainerSpec {
            name: format!("{}-cache-{}", pod_name, cache.name),
            image: job.image.clone(),
            command: argv,
            args,
            working_dir: Some(working_dir(job)),
            env: job.env.clone(),
            volume_mounts: mounts,
        });
    }
    (volumes, containers)
}

fn base_pod(job: &JobConfig, pod_name: String, token: Option<&str>) -> PodSpec {
    let mut volumes = job.volumes.clone();
    volumes.push(shared_volume());

    let init_containers = if job.checkout_enabled() {
        init_containers(job, &pod_name, token)
    } else {
        Vec::new()
    };

    PodSpec {
        name: pod_name,
        namespace: job.namespace.clone(),
        volumes,
        init_containers,
        containers: Vec::new(),
        image_pull_secrets: job.image_pull_secrets.clone(),
    }
}

/// Pod running `command` once in a single container. Used for the
/// non-distributed path and for the list command.
pub fn single_pod(job: &JobConfig, command: &str, token: Option<&str>) -> PodSpec {
    let pod_name = generate_name(&job.name);
    let container = command_container(job, format!("{}-0", pod_name), command, None);
    let mut pod = base_pod(job, pod_name, token);
    pod.containers.push(container);
    pod
}

/// Pod running one test container per entry of `tests`, plus cache init
/// containers. Returns the pod together with the commands it will run; each
/// command carries its assigned container name.
pub fn group_pod(
    job: &JobConfig,
    tests: &[String],
    token: Option<&str>,
) -> (PodSpec, Vec<TestCommand>) {
    let pod_name = generate_name(&job.name);
    let mut pod = base_pod(job, pod_name.clone(), token);

    let (cache_volumes, cache_inits) = cache_containers(job, &pod_name);
    pod.volumes.extend(cache_volumes);
    pod.init_containers.extend(cache_inits);

    let (argv, shell_args) = encode_command(&job.command);
    let mut commands = Vec::with_capacity(tests.len());
    for (i, test) in tests.iter().enumerate() {
        let container_name = format!("{}-{}", pod_name, i);
        pod.containers.push(command_container(
            job,
            container_name.clone(),
            &job.command,
            Some(test),
        ));
        commands.push(TestCommand {
            argv: argv.clone(),
            shell_args: shell_args.clone(),
            test: test.clone(),
            container: container_name,
        });
    }

    (pod, commands)
}

/// Prepare pod: clone/checkout init containers, then one container per
/// step. All but the last step run as init containers; the last is the
/// pod's primary container. Returns `None` when there are no steps.
pub fn prepare_pod(job: &JobConfig, token: Option<&str>) -> Option<PodSpec> {
    if job.prepare.steps.is_empty() {
        return None;
    }

    let pod_name = generate_name(&job.name);

    let mut containers = Vec::new();
    if job.prepare.checkout_enabled() {
        containers.extend(init_containers(job, &pod_name, token));
    }
    for step in &job.prepare.steps {
        containers.push(prepare_step_container(job, step));
    }

    // The last container is the pod's primary; everything before it runs as
    // an init container.
    let primary = containers.pop().expect("at least one prepare step");

    let mut volumes = job.volumes.clone();
    volumes.push(shared_volume());

    Some(PodSpec {
        name: pod_name,
        namespace: job.namespace.clone(),
        volumes,
        init_containers: containers,
        containers: vec![primary],
        image_pull_secrets: job.image_pull_secrets.clone(),
    })
}

fn prepare_step_container(job: &JobConfig, step: &PrepareStep) -> ContainerSpec {
    let image = step
        .image
        .clone()
        .or_else(|| job.prepare.image.clone())
        .unwrap_or_else(|| job.image.clone());

    let workdir = step
        .workdir
        .clone()
        .unwrap_or_else(|| WORKSPACE_PATH.to_string());

    // Step env first; job env fills in names the step did not set.
    let mut env = step.env.clone();
    for var in &job.env {
        if !env.iter().any(|e| e.name == var.name) {
            env.push(var.clone());
        }
    }

    let (argv, args) = encode_command(&step.command);
    ContainerSpec {
        name: step.name.clone(),
        image,
        command: argv,
        args,
        working_dir: Some(workdir),
        env,
        volume_mounts: vec![shared_volume_mount()],
    }
}
