//! Container engine access
//!
//! [`ContainerEngine`] is the seam the orchestrator drives; [`DockerEngine`]
//! implements it with the docker CLI for compose and inspection, and the
//! engine API for pulls, whose JSON stream carries byte-level progress.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use bollard::models::CreateImageInfo;
use bollard::query_parameters::CreateImageOptionsBuilder;
use bollard::Docker;
use futures::StreamExt;
use serde_json::Value;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use crate::errors::StoreError;
use crate::models::operation::ProgressDetail;

/// One streamed image pull event
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PullEvent {
    /// Layer id, if the event is about a layer
    pub id: Option<String>,

    /// Engine status text, e.g. "Downloading" or "Download complete"
    pub status: String,

    pub progress_detail: Option<ProgressDetail>,
}

impl PullEvent {
    /// Numeric percent carried by the event, if any
    pub fn percent(&self) -> Option<f64> {
        self.progress_detail.as_ref().and_then(|d| d.percent)
    }
}

/// Container engine operations used by store workflows
#[async_trait]
pub trait ContainerEngine: Send + Sync {
    /// Images referenced by a compose document, in declared order
    async fn resolve_images(&self, compose_path: &Path) -> Result<Vec<String>, StoreError>;

    /// Pull one image, reporting every streamed event
    async fn pull_image(
        &self,
        image: &str,
        on_event: &mut (dyn FnMut(PullEvent) + Send),
    ) -> Result<(), StoreError>;

    /// `compose up` for a stack
    async fn compose_up(
        &self,
        compose_path: &Path,
        env_path: &Path,
        stack_name: &str,
    ) -> Result<(), StoreError>;

    /// `compose down` for a stack
    async fn compose_down(
        &self,
        compose_path: &Path,
        env_path: Option<&Path>,
        stack_name: &str,
        remove_volumes: bool,
    ) -> Result<(), StoreError>;

    /// Repo digest references of a locally cached image (`name@sha256:...`)
    async fn inspect_local_digests(&self, image: &str) -> Result<Vec<String>, StoreError>;

    /// Registry manifest of an image
    async fn inspect_remote_manifest(&self, image: &str, verbose: bool)
        -> Result<Value, StoreError>;
}

/// How compose is invoked on this host
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ComposeFlavor {
    /// `docker compose` plugin
    Plugin,

    /// Standalone `docker-compose`
    Standalone,
}

/// Docker engine
pub struct DockerEngine {
    docker_bin: PathBuf,
    compose_flavor: OnceCell<ComposeFlavor>,
    api: OnceCell<Docker>,
}

impl DockerEngine {
    /// Create an engine using the given docker binary.
    ///
    /// The API client connects lazily, honouring `DOCKER_HOST`.
    pub fn new(docker_bin: impl Into<PathBuf>) -> Self {
        Self {
            docker_bin: docker_bin.into(),
            compose_flavor: OnceCell::new(),
            api: OnceCell::new(),
        }
    }

    async fn api(&self) -> Result<&Docker, StoreError> {
        self.api
            .get_or_try_init(|| async {
                Docker::connect_with_local_defaults().map_err(|e| {
                    StoreError::EngineError(format!("Failed to connect to docker: {}", e))
                })
            })
            .await
    }

    async fn compose_flavor(&self) -> ComposeFlavor {
        *self
            .compose_flavor
            .get_or_init(|| async {
                let plugin = Command::new(&self.docker_bin)
                    .args(["compose", "version"])
                    .kill_on_drop(true)
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .status()
                    .await;

                match plugin {
                    Ok(status) if status.success() => ComposeFlavor::Plugin,
                    _ => {
                        debug!("'docker compose' unavailable, falling back to docker-compose");
                        ComposeFlavor::Standalone
                    }
                }
            })
            .await
    }

    async fn compose_command(&self, compose_path: &Path, stack_name: Option<&str>) -> Command {
        let mut cmd = match self.compose_flavor().await {
            ComposeFlavor::Plugin => {
                let mut cmd = Command::new(&self.docker_bin);
                cmd.arg("compose");
                cmd
            }
            ComposeFlavor::Standalone => Command::new("docker-compose"),
        };
        cmd.kill_on_drop(true);

        if let Some(dir) = compose_path.parent() {
            cmd.current_dir(dir);
        }
        if let Some(stack_name) = stack_name {
            cmd.arg("-p").arg(stack_name);
        }
        cmd.arg("-f").arg(compose_path);
        cmd
    }

    async fn docker(&self, args: &[&str]) -> Result<String, StoreError> {
        let output = Command::new(&self.docker_bin)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| StoreError::EngineError(format!("Failed to run docker: {}", e)))?;

        if !output.status.success() {
            return Err(StoreError::EngineError(format!(
                "docker {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

async fn run_checked(mut cmd: Command, what: &str) -> Result<String, StoreError> {
    let output = cmd
        .output()
        .await
        .map_err(|e| StoreError::EngineError(format!("Failed to run {}: {}", what, e)))?;

    if !output.status.success() {
        return Err(StoreError::EngineError(format!(
            "{} failed: {}",
            what,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[async_trait]
impl ContainerEngine for DockerEngine {
    async fn resolve_images(&self, compose_path: &Path) -> Result<Vec<String>, StoreError> {
        let mut cmd = self.compose_command(compose_path, None).await;
        cmd.args(["config", "--images"]);
        let stdout = run_checked(cmd, "compose config").await?;

        let mut images: Vec<String> = Vec::new();
        for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
            if !images.iter().any(|i| i == line) {
                images.push(line.to_string());
            }
        }
        Ok(images)
    }

    async fn pull_image(
        &self,
        image: &str,
        on_event: &mut (dyn FnMut(PullEvent) + Send),
    ) -> Result<(), StoreError> {
        debug!("Pulling image: {}", image);

        let (from_image, tag) = split_image_reference(image);
        let options = CreateImageOptionsBuilder::default()
            .from_image(&from_image)
            .tag(&tag)
            .build();

        let docker = self.api().await?;
        let mut stream = Box::pin(docker.create_image(Some(options), None, None));
        while let Some(message) = stream.next().await {
            let info = message.map_err(|e| {
                StoreError::EngineError(format!("Docker pull failed for {}: {}", image, e))
            })?;
            if let Some(message) = info.error_detail.as_ref().and_then(|d| d.message.clone()) {
                return Err(StoreError::EngineError(format!(
                    "Docker pull failed for {}: {}",
                    image, message
                )));
            }
            if let Some(event) = pull_event(info) {
                on_event(event);
            }
        }

        info!("Pulled image: {}", image);
        Ok(())
    }

    async fn compose_up(
        &self,
        compose_path: &Path,
        env_path: &Path,
        stack_name: &str,
    ) -> Result<(), StoreError> {
        info!("Running compose up for stack: {}", stack_name);

        let mut cmd = self.compose_command(compose_path, Some(stack_name)).await;
        cmd.arg("--env-file")
            .arg(env_path)
            .args(["up", "-d", "--remove-orphans"]);
        run_checked(cmd, "compose up").await?;
        Ok(())
    }

    async fn compose_down(
        &self,
        compose_path: &Path,
        env_path: Option<&Path>,
        stack_name: &str,
        remove_volumes: bool,
    ) -> Result<(), StoreError> {
        info!("Running compose down for stack: {}", stack_name);

        let mut cmd = self.compose_command(compose_path, Some(stack_name)).await;
        if let Some(env_path) = env_path {
            cmd.arg("--env-file").arg(env_path);
        }
        cmd.args(["down", "--remove-orphans"]);
        if remove_volumes {
            cmd.arg("--volumes");
        }
        run_checked(cmd, "compose down").await?;
        Ok(())
    }

    async fn inspect_local_digests(&self, image: &str) -> Result<Vec<String>, StoreError> {
        let stdout = self
            .docker(&["image", "inspect", "--format", "{{json .RepoDigests}}", image])
            .await?;
        let digests: Option<Vec<String>> = serde_json::from_str(stdout.trim())?;
        Ok(digests.unwrap_or_default())
    }

    async fn inspect_remote_manifest(
        &self,
        image: &str,
        verbose: bool,
    ) -> Result<Value, StoreError> {
        let mut args = vec!["manifest", "inspect"];
        if verbose {
            args.push("-v");
        }
        args.push(image);

        let stdout = self.docker(&args).await?;
        if stdout.trim().is_empty() {
            warn!("Empty manifest for image: {}", image);
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(stdout.trim())?)
    }
}

/// Split an image reference into the `fromImage` and `tag` pull parameters.
///
/// A digest is passed as the tag. A missing tag means `latest`, since an empty
/// tag asks the engine for every tag of the repository.
pub fn split_image_reference(image: &str) -> (String, String) {
    if let Some((name, digest)) = image.split_once('@') {
        return (name.to_string(), digest.to_string());
    }

    // A colon before the last slash belongs to a registry port
    let name_start = image.rfind('/').map_or(0, |i| i + 1);
    match image[name_start..].rfind(':') {
        Some(i) => {
            let split = name_start + i;
            (image[..split].to_string(), image[split + 1..].to_string())
        }
        None => (image.to_string(), "latest".to_string()),
    }
}

/// Convert one message of the engine's pull stream
pub fn pull_event(info: CreateImageInfo) -> Option<PullEvent> {
    let status = info.status.filter(|s| !s.is_empty())?;

    let progress_detail = info.progress_detail.and_then(|detail| {
        let current = detail.current.and_then(|c| u64::try_from(c).ok());
        let total = detail.total.and_then(|t| u64::try_from(t).ok());
        match (current, total) {
            (Some(current), Some(total)) if total > 0 => {
                Some(ProgressDetail::from_bytes(current, total))
            }
            (None, None) => None,
            (current, total) => Some(ProgressDetail {
                current,
                total,
                percent: None,
            }),
        }
    });

    Some(PullEvent {
        id: info.id.filter(|id| !id.is_empty()),
        status,
        progress_detail,
    })
}
