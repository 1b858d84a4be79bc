/// Configuration loading and validation for stackguard.toml
///
/// Everything operational (service names, storage endpoints, retention window,
/// timeouts) comes from one TOML document. Secrets never live in it: the file
/// names environment variables, which are read after the optional .env file is
/// loaded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use super::bundle::ComponentKind;
use super::error::{OpsError, Result};
use super::storage::S3Settings;
use crate::utils::{
    mask_sensitive, CONFIG_ENV_VAR, CONFIG_FILE_NAME, DEFAULT_ACCESS_KEY_ENV, DEFAULT_LOG_TAIL,
    DEFAULT_REMOTE_REGION, DEFAULT_RETENTION_DAYS, DEFAULT_SECRET_KEY_ENV,
};

/// Durations written as `"30s"`, `"5m"`, `"1h 30m"`
mod duration_str {
    use serde::{de, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(|e| de::Error::custom(format!("'{}': {}", raw, e)))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectConfig {
    /// Directory docker compose runs in; relative to the config file
    pub root: PathBuf,
    pub compose_file: PathBuf,
    pub name: Option<String>,
}

impl Default for ProjectConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            compose_file: PathBuf::from("docker-compose.yml"),
            name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub service: String,
    pub name: String,
    pub user: String,
    /// Variable holding the database password
    pub password_env: Option<String>,
    /// Container alembic runs in
    pub migration_service: String,
    pub alembic_config: Option<String>,
    #[serde(with = "duration_str")]
    pub restore_timeout: Duration,
    #[serde(with = "duration_str")]
    pub migration_timeout: Duration,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            service: "postgres".to_string(),
            name: "app".to_string(),
            user: "postgres".to_string(),
            password_env: None,
            migration_service: "app".to_string(),
            alembic_config: None,
            restore_timeout: Duration::from_secs(30 * 60),
            migration_timeout: Duration::from_secs(15 * 60),
        }
    }
}

/// Relative paths archived together under one base directory
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    pub base: PathBuf,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogsConfig {
    pub services: Vec<String>,
    pub tail: usize,
}

impl Default for LogsConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            tail: DEFAULT_LOG_TAIL,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub local_dir: PathBuf,
    pub remote: Option<RemoteConfig>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            local_dir: PathBuf::from("backups"),
            remote: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    pub access_key_env: String,
    pub secret_key_env: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            bucket: String::new(),
            region: DEFAULT_REMOTE_REGION.to_string(),
            endpoint: None,
            prefix: None,
            access_key_env: DEFAULT_ACCESS_KEY_ENV.to_string(),
            secret_key_env: DEFAULT_SECRET_KEY_ENV.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    pub window_days: u32,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            window_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    pub domains: Vec<ComponentKind>,
    #[serde(with = "duration_str")]
    pub capture_timeout: Duration,
    pub concurrent: bool,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            domains: vec![ComponentKind::Database],
            capture_timeout: Duration::from_secs(10 * 60),
            concurrent: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RestoreConfig {
    pub services: Vec<String>,
    /// Defaults to `services` when empty
    pub verify_services: Vec<String>,
    #[serde(with = "duration_str")]
    pub stop_timeout: Duration,
    #[serde(with = "duration_str")]
    pub start_timeout: Duration,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            services: Vec::new(),
            verify_services: Vec::new(),
            stop_timeout: Duration::from_secs(120),
            start_timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub attempts: u32,
    #[serde(with = "duration_str")]
    pub backoff_min: Duration,
    #[serde(with = "duration_str")]
    pub backoff_max: Duration,
    /// Budget for one service to become healthy
    #[serde(with = "duration_str")]
    pub timeout: Duration,
    #[serde(with = "duration_str")]
    pub request_timeout: Duration,
    /// HTTP endpoint per service; others are judged by container state
    pub endpoints: BTreeMap<String, String>,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            timeout: Duration::from_secs(120),
            request_timeout: Duration::from_secs(5),
            endpoints: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub attempts: u32,
    #[serde(with = "duration_str")]
    pub backoff_min: Duration,
    #[serde(with = "duration_str")]
    pub backoff_max: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 4,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentConfig {
    /// Overrides `project.compose_file`
    pub compose_file: Option<PathBuf>,
    pub services: Vec<String>,
    pub health_services: Vec<String>,
    pub require_confirmation: bool,
    #[serde(with = "duration_str")]
    pub build_timeout: Duration,
}

impl Default for EnvironmentConfig {
    fn default() -> Self {
        Self {
            compose_file: None,
            services: Vec::new(),
            health_services: Vec::new(),
            require_confirmation: false,
            build_timeout: Duration::from_secs(30 * 60),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OpsConfig {
    pub project: ProjectConfig,
    pub database: DatabaseConfig,
    pub files: Option<TreeConfig>,
    pub config_files: Option<TreeConfig>,
    pub logs: LogsConfig,
    pub storage: StorageConfig,
    pub retention: RetentionConfig,
    pub backup: BackupConfig,
    pub restore: RestoreConfig,
    pub health: HealthConfig,
    pub retry: RetryConfig,
    pub environments: BTreeMap<String, EnvironmentConfig>,
    #[serde(skip)]
    source: Option<PathBuf>,
}

impl OpsConfig {
    /// `--config`, then `$STACKGUARD_CONFIG`, then the working directory, then the
    /// user config directory
    pub fn locate(explicit: Option<&Path>) -> Result<PathBuf> {
        if let Some(path) = explicit {
            if path.is_file() {
                return Ok(path.to_path_buf());
            }
            return Err(OpsError::PreconditionFailed(format!(
                "config file not found at {}",
                path.display()
            )));
        }

        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let path = PathBuf::from(path);
            if path.is_file() {
                return Ok(path);
            }
            return Err(OpsError::PreconditionFailed(format!(
                "{} points at {}, which does not exist",
                CONFIG_ENV_VAR,
                path.display()
            )));
        }

        let mut candidates = vec![PathBuf::from(CONFIG_FILE_NAME)];
        if let Some(dir) = dirs::config_dir() {
            candidates.push(dir.join("stackguard").join(CONFIG_FILE_NAME));
        }
        candidates
            .iter()
            .find(|p| p.is_file())
            .cloned()
            .ok_or_else(|| {
                OpsError::PreconditionFailed(format!(
                    "no {} found (looked in: {})",
                    CONFIG_FILE_NAME,
                    candidates
                        .iter()
                        .map(|p| p.display().to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }

    /// Locate and parse the config, loading the .env file next to it first.
    /// Relative paths in the file are resolved against its directory.
    pub fn load(explicit: Option<&Path>, env_file: Option<&Path>) -> Result<Self> {
        let path = Self::locate(explicit)?;
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        match env_file {
            Some(env_file) => {
                dotenv::from_path(env_file).map_err(|e| {
                    OpsError::PreconditionFailed(format!(
                        "failed to load {}: {}",
                        env_file.display(),
                        e
                    ))
                })?;
            }
            None => {
                let candidate = dir.join(".env");
                if candidate.is_file() {
                    if let Err(e) = dotenv::from_path(&candidate) {
                        tracing::warn!(path = %candidate.display(), error = %e, "ignoring unreadable .env");
                    }
                }
            }
        }

        let content = fs::read_to_string(&path).map_err(|e| {
            OpsError::PreconditionFailed(format!("failed to read {}: {}", path.display(), e))
        })?;
        let mut config = Self::from_toml_str(&content).map_err(|e| match e {
            OpsError::PreconditionFailed(msg) => {
                OpsError::PreconditionFailed(format!("{}: {}", path.display(), msg))
            }
            other => other,
        })?;
        config.resolve_paths(&dir);
        config.source = Some(path);
        tracing::debug!(source = ?config.source, "configuration loaded");
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| OpsError::PreconditionFailed(format!("invalid config: {}", e)))
    }

    pub fn source(&self) -> Option<&Path> {
        self.source.as_deref()
    }

    fn resolve_paths(&mut self, dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = dir.join(&*p);
            }
        };
        resolve(&mut self.project.root);
        resolve(&mut self.storage.local_dir);
        if let Some(tree) = self.files.as_mut() {
            resolve(&mut tree.base);
        }
        if let Some(tree) = self.config_files.as_mut() {
            resolve(&mut tree.base);
        }
    }

    /// Compose file for an environment, falling back to the project's
    pub fn compose_file_for(&self, environment: Option<&str>) -> PathBuf {
        let file = environment
            .and_then(|name| self.environments.get(name))
            .and_then(|env| env.compose_file.clone())
            .unwrap_or_else(|| self.project.compose_file.clone());
        if file.is_relative() {
            self.project.root.join(file)
        } else {
            file
        }
    }

    pub fn backup_domains(&self) -> BTreeSet<ComponentKind> {
        self.backup.domains.iter().copied().collect()
    }

    pub fn tree(&self, kind: ComponentKind) -> Option<&TreeConfig> {
        match kind {
            ComponentKind::Files => self.files.as_ref(),
            ComponentKind::Config => self.config_files.as_ref(),
            _ => None,
        }
    }

    pub fn verify_services(&self) -> Vec<String> {
        if self.restore.verify_services.is_empty() {
            self.restore.services.clone()
        } else {
            self.restore.verify_services.clone()
        }
    }

    pub fn database_password(&self) -> Option<String> {
        self.database
            .password_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
    }

    /// Remote sink settings with credentials read from the environment
    pub fn remote_settings(&self) -> Result<Option<S3Settings>> {
        let Some(remote) = &self.storage.remote else {
            return Ok(None);
        };
        let read = |name: &str| {
            std::env::var(name).map_err(|_| {
                OpsError::PreconditionFailed(format!(
                    "remote storage credential variable {} is not set",
                    name
                ))
            })
        };
        Ok(Some(S3Settings {
            bucket: remote.bucket.clone(),
            region: remote.region.clone(),
            endpoint: remote.endpoint.clone(),
            prefix: remote.prefix.clone(),
            access_key: Some(read(&remote.access_key_env)?),
            secret_key: Some(read(&remote.secret_key_env)?),
        }))
    }

    /// Every problem found, empty when the configuration is usable
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.retention.window_days == 0 {
            errors.push("retention.window_days must be at least 1".to_string());
        }
        if self.database.service.trim().is_empty() {
            errors.push("database.service is not set".to_string());
        }
        if self.database.name.trim().is_empty() {
            errors.push("database.name is not set".to_string());
        }
        if self.database.user.trim().is_empty() {
            errors.push("database.user is not set".to_string());
        }
        if let Some(name) = &self.database.password_env {
            if std::env::var(name).is_err() {
                errors.push(format!("database password variable {} is not set", name));
            }
        }
        if self.storage.local_dir.as_os_str().is_empty() {
            errors.push("storage.local_dir is not set".to_string());
        }
        if self.restore.services.is_empty() {
            errors.push("restore.services lists no services".to_string());
        }

        let domains = self.backup_domains();
        if !domains.contains(&ComponentKind::Database) {
            errors.push("backup.domains must include database".to_string());
        }
        if domains.len() != self.backup.domains.len() {
            errors.push("backup.domains lists a domain twice".to_string());
        }
        for (kind, section) in [(ComponentKind::Files, "files"), (ComponentKind::Config, "config_files")] {
            match self.tree(kind) {
                Some(tree) => validate_tree(section, tree, &mut errors),
                None if domains.contains(&kind) => {
                    errors.push(format!("backup.domains includes {} but [{}] is missing", kind, section));
                }
                None => {}
            }
        }
        if domains.contains(&ComponentKind::Logs) && self.logs.services.is_empty() {
            errors.push("backup.domains includes logs but logs.services is empty".to_string());
        }

        if let Some(remote) = &self.storage.remote {
            if remote.bucket.trim().is_empty() {
                errors.push("storage.remote.bucket is not set".to_string());
            }
            for name in [&remote.access_key_env, &remote.secret_key_env] {
                if std::env::var(name).is_err() {
                    errors.push(format!("remote storage credential variable {} is not set", name));
                }
            }
        }

        if self.health.attempts == 0 {
            errors.push("health.attempts must be at least 1".to_string());
        }
        if self.health.backoff_min > self.health.backoff_max {
            errors.push("health.backoff_min exceeds health.backoff_max".to_string());
        }
        for (service, url) in &self.health.endpoints {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                errors.push(format!("health endpoint for {} is not an http(s) URL: {}", service, url));
            }
        }
        if self.retry.attempts == 0 {
            errors.push("retry.attempts must be at least 1".to_string());
        }

        for (name, env) in &self.environments {
            if env.services.is_empty() {
                errors.push(format!("environments.{}.services lists no services", name));
            }
        }

        errors
    }

    /// Effective configuration as TOML, followed by the referenced secrets masked
    pub fn masked_view(&self) -> Result<String> {
        let mut out = toml::to_string_pretty(self)
            .map_err(|e| OpsError::PreconditionFailed(format!("cannot render config: {}", e)))?;

        let mut secrets: Vec<&str> = Vec::new();
        if let Some(name) = &self.database.password_env {
            secrets.push(name);
        }
        if let Some(remote) = &self.storage.remote {
            secrets.push(&remote.access_key_env);
            secrets.push(&remote.secret_key_env);
        }
        if !secrets.is_empty() {
            out.push_str("\n# Resolved secrets\n");
            for name in secrets {
                let shown = match std::env::var(name) {
                    Ok(value) => mask_sensitive(&value, 4),
                    Err(_) => "(unset)".to_string(),
                };
                out.push_str(&format!("# {} = {}\n", name, shown));
            }
        }
        Ok(out)
    }
}

fn validate_tree(section: &str, tree: &TreeConfig, errors: &mut Vec<String>) {
    if tree.paths.is_empty() {
        errors.push(format!("[{}] lists no paths", section));
    }
    let mut names = HashSet::new();
    for path in &tree.paths {
        let escapes = path.is_absolute()
            || path
                .components()
                .any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_)));
        if escapes {
            errors.push(format!(
                "[{}] path {} must be relative to the base without '..'",
                section,
                path.display()
            ));
        }
        match path.file_name() {
            Some(name) if names.insert(name.to_os_string()) => {}
            Some(name) => errors.push(format!(
                "[{}] has two paths named {}",
                section,
                name.to_string_lossy()
            )),
            None => errors.push(format!("[{}] path {} has no name", section, path.display())),
        }
    }
}
