/// Docker and Docker Compose integration
///
/// Stops, starts and inspects the services of a compose project, runs commands
/// inside its containers and builds its images.

use async_trait::async_trait;
use bollard::container::ListContainersOptions;
use bollard::models::ContainerSummary;
use bollard::Docker;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::error::{OpsError, Result};
use crate::utils::ContainerState;

/// Running/health state of one compose service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceStatus {
    pub running: bool,
    /// Docker healthcheck result; `None` when the container defines no healthcheck
    pub health: Option<String>,
    pub healthy: bool,
}

/// Starts and stops the services that depend on the data being backed up
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ServiceSupervisor: Send + Sync {
    async fn stop(&self, services: &[String]) -> Result<()>;

    async fn start(&self, services: &[String]) -> Result<()>;

    async fn status(&self, service: &str) -> Result<ServiceStatus>;

    /// Recent log output of a service
    async fn logs(&self, service: &str, tail: usize) -> Result<String>;
}

/// Produces the deployable artifacts (images) for an environment
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ArtifactBuilder: Send + Sync {
    async fn build(&self, environment: &str, services: &[String]) -> Result<()>;
}

#[derive(Clone)]
pub struct DockerManager {
    docker: Docker,
    project_root: PathBuf,
    compose_file: PathBuf,
    project_name: String,
}

impl DockerManager {
    pub fn new(project_root: &Path, compose_file: &Path, project_name: Option<&str>) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()?;

        let compose_file = if compose_file.is_absolute() {
            compose_file.to_path_buf()
        } else {
            project_root.join(compose_file)
        };
        if !compose_file.exists() {
            return Err(OpsError::PreconditionFailed(format!(
                "compose file not found at {}",
                compose_file.display()
            )));
        }

        // Compose defaults the project name to the directory name
        let project_name = project_name
            .map(str::to_string)
            .or_else(|| {
                project_root
                    .file_name()
                    .map(|n| n.to_string_lossy().to_lowercase())
            })
            .unwrap_or_else(|| "default".to_string());

        Ok(Self {
            docker,
            project_root: project_root.to_path_buf(),
            compose_file,
            project_name,
        })
    }

    /// Same project, different compose file (per-environment overrides)
    pub fn with_compose_file(&self, compose_file: &Path) -> Result<Self> {
        Self::new(&self.project_root, compose_file, Some(&self.project_name))
    }

    pub fn compose_file(&self) -> &Path {
        &self.compose_file
    }

    /// Check if Docker daemon is accessible
    pub async fn check_docker(&self) -> Result<bool> {
        match self.docker.ping().await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Service names declared in the compose file
    pub fn compose_services(&self) -> Result<BTreeSet<String>> {
        let content = std::fs::read_to_string(&self.compose_file)?;
        parse_compose_services(&content)
    }

    /// Status of every container in the project, keyed by compose service
    pub async fn list_services(&self) -> Result<BTreeMap<String, ServiceStatus>> {
        let containers = self.list_containers(None).await?;
        let mut services = BTreeMap::new();
        for summary in containers {
            let service = summary
                .labels
                .as_ref()
                .and_then(|labels| labels.get("com.docker.compose.service"))
                .cloned()
                .unwrap_or_else(|| "unknown".to_string());
            services.insert(service, summary_to_status(&summary));
        }
        Ok(services)
    }

    async fn list_containers(&self, service: Option<&str>) -> Result<Vec<ContainerSummary>> {
        let mut labels = vec![format!("com.docker.compose.project={}", self.project_name)];
        if let Some(service) = service {
            labels.push(format!("com.docker.compose.service={}", service));
        }
        let mut filters = HashMap::new();
        filters.insert("label".to_string(), labels);

        let options = Some(ListContainersOptions {
            all: true,
            filters,
            ..Default::default()
        });
        Ok(self.docker.list_containers(options).await?)
    }

    /// Execute docker compose command
    pub async fn compose_command(&self, args: &[&str]) -> Result<String> {
        let stdout = self.compose_output(args, None).await?;
        Ok(String::from_utf8_lossy(&stdout).to_string())
    }

    /// Run `docker compose <args>`, optionally feeding `stdin`, and return raw stdout
    pub async fn compose_output(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Vec<u8>> {
        let output = self.compose_raw(args, stdin).await?;
        checked_stdout(args, output)
    }

    /// Like `compose_output` but leaves the exit status to the caller
    pub async fn compose_raw(&self, args: &[&str], stdin: Option<&[u8]>) -> Result<Output> {
        self.run_compose(args, &[], stdin).await
    }

    /// `env` is set on the compose client process only, never on its argv
    async fn run_compose(
        &self,
        args: &[&str],
        env: &[(&str, &str)],
        stdin: Option<&[u8]>,
    ) -> Result<Output> {
        let compose_file = self.compose_file.to_string_lossy().to_string();
        let full_args = compose_args(&compose_file, &self.project_name, args);

        let mut cmd = Command::new("docker");
        cmd.args(&full_args)
            .current_dir(&self.project_root)
            .envs(env.iter().copied())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let command_line = format!("docker compose {}", args.join(" "));
        tracing::debug!(command = %command_line, "running compose command");

        let mut child = cmd.spawn().map_err(|e| OpsError::Command {
            command: command_line,
            stderr: e.to_string(),
        })?;

        // Feed stdin while collecting output, large dumps would otherwise deadlock on the pipe
        let pipe = child.stdin.take();
        let writer = async move {
            if let (Some(mut pipe), Some(data)) = (pipe, stdin) {
                pipe.write_all(data).await?;
                pipe.shutdown().await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (written, output) = tokio::join!(writer, child.wait_with_output());
        let output = output?;

        // A failed command usually explains a broken stdin pipe better than the pipe error
        if output.status.success() {
            written?;
        }
        Ok(output)
    }

    /// Run a command inside a service container (`docker compose exec -T`)
    pub async fn exec(
        &self,
        service: &str,
        command: &[&str],
        env: &[(&str, &str)],
        stdin: Option<&[u8]>,
    ) -> Result<Vec<u8>> {
        let args = exec_args(service, command, env);
        let output = self.run_compose(&args, env, stdin).await?;
        checked_stdout(&args, output)
    }

    /// `exec` without failing on a non-zero exit status
    pub async fn exec_raw(
        &self,
        service: &str,
        command: &[&str],
        env: &[(&str, &str)],
    ) -> Result<Output> {
        let args = exec_args(service, command, env);
        self.run_compose(&args, env, None).await
    }
}

fn checked_stdout(args: &[&str], output: Output) -> Result<Vec<u8>> {
    if !output.status.success() {
        return Err(OpsError::Command {
            command: format!("docker compose {}", args.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

/// `-e NAME` without a value makes compose forward the variable from its own environment
fn exec_args<'a>(service: &'a str, command: &[&'a str], env: &[(&'a str, &str)]) -> Vec<&'a str> {
    let mut args = vec!["exec", "-T"];
    for &(name, _) in env {
        args.push("-e");
        args.push(name);
    }
    args.push(service);
    args.extend_from_slice(command);
    args
}

#[async_trait]
impl ServiceSupervisor for DockerManager {
    async fn stop(&self, services: &[String]) -> Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        let mut args = vec!["stop"];
        args.extend(services.iter().map(String::as_str));
        self.compose_command(&args).await?;
        tracing::info!(services = ?services, "stopped services");
        Ok(())
    }

    async fn start(&self, services: &[String]) -> Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        let mut args = vec!["up", "-d"];
        args.extend(services.iter().map(String::as_str));
        self.compose_command(&args).await?;
        tracing::info!(services = ?services, "started services");
        Ok(())
    }

    async fn status(&self, service: &str) -> Result<ServiceStatus> {
        let containers = self.list_containers(Some(service)).await?;
        if containers.is_empty() {
            return Ok(ServiceStatus::default());
        }

        // Scaled services: report running only if every replica runs
        let statuses: Vec<ServiceStatus> = containers.iter().map(summary_to_status).collect();
        Ok(ServiceStatus {
            running: statuses.iter().all(|s| s.running),
            health: statuses.iter().find_map(|s| s.health.clone()),
            healthy: statuses.iter().all(|s| s.healthy),
        })
    }

    async fn logs(&self, service: &str, tail: usize) -> Result<String> {
        let tail = tail.to_string();
        self.compose_command(&["logs", "--no-color", "--tail", &tail, service])
            .await
    }
}

#[async_trait]
impl ArtifactBuilder for DockerManager {
    async fn build(&self, environment: &str, services: &[String]) -> Result<()> {
        let service_args = services.iter().map(String::as_str);

        let mut build = vec!["build"];
        build.extend(service_args.clone());
        self.compose_command(&build).await?;

        let mut pull = vec!["pull", "--ignore-buildable"];
        pull.extend(service_args);
        self.compose_command(&pull).await?;

        tracing::info!(environment, services = ?services, "built and pulled images");
        Ok(())
    }
}

fn compose_args<'a>(compose_file: &'a str, project_name: &'a str, args: &[&'a str]) -> Vec<&'a str> {
    let mut full = vec!["compose", "-f", compose_file, "-p", project_name];
    full.extend_from_slice(args);
    full
}

/// Health from the container status line, e.g. "Up 5 minutes (healthy)"
fn parse_health(status: &str) -> Option<String> {
    // Check unhealthy BEFORE healthy (unhealthy contains "healthy" as substring)
    if status.contains("unhealthy") {
        Some("unhealthy".to_string())
    } else if status.contains("health: starting") || status.contains("(starting)") {
        Some("starting".to_string())
    } else if status.contains("healthy") {
        Some("healthy".to_string())
    } else {
        None
    }
}

fn summary_to_status(summary: &ContainerSummary) -> ServiceStatus {
    let state: ContainerState = summary.state.as_deref().unwrap_or("unknown").into();
    let health = summary.status.as_deref().and_then(parse_health);
    let running = state.is_running();
    let healthy = running
        && match health.as_deref() {
            Some(h) => h == "healthy",
            None => state == ContainerState::Running,
        };

    ServiceStatus {
        running,
        health,
        healthy,
    }
}

/// Service names from the `services:` mapping of a compose document
pub fn parse_compose_services(content: &str) -> Result<BTreeSet<String>> {
    use serde_yaml::Value;

    let yaml: Value = serde_yaml::from_str(content)
        .map_err(|e| OpsError::PreconditionFailed(format!("failed to parse compose file: {}", e)))?;

    let services = yaml
        .get("services")
        .and_then(|s| s.as_mapping())
        .map(|map| {
            map.keys()
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();
    Ok(services)
}
