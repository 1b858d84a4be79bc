/// Wiring of the orchestrators from an [`OpsConfig`]
///
/// Every collaborator gets its settings from the config object here; nothing
/// below this module reads the environment for operational values.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::archive::{FileTreeAdapter, TarArchiver};
use super::backup::{BackupOrchestrator, BackupSettings, DatabaseCapture, LogCapture, TreeCapture};
use super::bundle::ComponentKind;
use super::config::OpsConfig;
use super::database::{DatabaseAdapter, PostgresAdapter, PostgresSettings};
use super::deploy::{DeploySettings, DeploymentCoordinator, EnvironmentPlan};
use super::docker::{DockerManager, ServiceSupervisor};
use super::error::{OpsError, Result};
use super::health::{ConfiguredProbe, HealthPolicy, HealthVerifier, HttpProbe, SupervisorProbe};
use super::migration::{AlembicTool, MigrationJournal, MigrationRunner};
use super::restore::{RestoreOrchestrator, RestoreSettings, TreeTarget};
use super::retention::{RetentionPolicy, RetentionRule};
use super::storage::{LocalSink, ReplicatedSink, RetryPolicy, RetryingSink, S3Sink, StorageSink};
use crate::utils::{MIGRATION_JOURNAL_FILE, REQUIRED_CONSECUTIVE_PROBES};

pub struct Stack {
    config: OpsConfig,
    docker: Arc<DockerManager>,
    archiver: Arc<dyn FileTreeAdapter>,
    sink: Arc<dyn StorageSink>,
}

impl Stack {
    pub fn from_config(config: OpsConfig) -> Result<Self> {
        let docker = Arc::new(DockerManager::new(
            &config.project.root,
            &config.project.compose_file,
            config.project.name.as_deref(),
        )?);
        let sink = build_sink(&config)?;

        Ok(Self {
            config,
            docker,
            archiver: Arc::new(TarArchiver::new()),
            sink,
        })
    }

    pub fn config(&self) -> &OpsConfig {
        &self.config
    }

    pub fn docker(&self) -> &Arc<DockerManager> {
        &self.docker
    }

    pub fn sink(&self) -> &Arc<dyn StorageSink> {
        &self.sink
    }

    /// The database as reached through `docker`'s compose file
    fn database(&self, docker: &Arc<DockerManager>) -> Arc<dyn DatabaseAdapter> {
        Arc::new(PostgresAdapter::new(
            docker.clone(),
            PostgresSettings {
                service: self.config.database.service.clone(),
                database: self.config.database.name.clone(),
                user: self.config.database.user.clone(),
                password: self.config.database_password(),
            },
        ))
    }

    fn retention(&self) -> Result<RetentionPolicy> {
        Ok(RetentionPolicy::new(RetentionRule::new(
            self.config.retention.window_days,
        )?))
    }

    pub fn backup(&self) -> Result<BackupOrchestrator> {
        self.backup_with(self.docker.clone())
    }

    fn backup_with(&self, docker: Arc<DockerManager>) -> Result<BackupOrchestrator> {
        let mut orchestrator = BackupOrchestrator::new(
            self.sink.clone(),
            self.retention()?,
            BackupSettings {
                capture_timeout: self.config.backup.capture_timeout,
                concurrent: self.config.backup.concurrent,
            },
        )
        .with_capture(ComponentKind::Database, Arc::new(DatabaseCapture::new(self.database(&docker))));

        for kind in [ComponentKind::Files, ComponentKind::Config] {
            if let Some(tree) = self.config.tree(kind) {
                orchestrator = orchestrator.with_capture(
                    kind,
                    Arc::new(TreeCapture::new(
                        self.archiver.clone(),
                        tree.base.clone(),
                        tree.paths.clone(),
                    )),
                );
            }
        }
        if !self.config.logs.services.is_empty() {
            orchestrator = orchestrator.with_capture(
                ComponentKind::Logs,
                Arc::new(LogCapture::new(
                    docker,
                    self.config.logs.services.clone(),
                    self.config.logs.tail,
                )),
            );
        }
        Ok(orchestrator)
    }

    pub fn health_verifier(&self) -> Result<HealthVerifier> {
        self.verifier_with(self.docker.clone())
    }

    fn verifier_with(&self, supervisor: Arc<dyn ServiceSupervisor>) -> Result<HealthVerifier> {
        let health = &self.config.health;
        let probe = ConfiguredProbe::new(
            HttpProbe::new(health.endpoints.clone(), health.request_timeout)?,
            SupervisorProbe::new(supervisor),
        );
        Ok(HealthVerifier::new(
            Arc::new(probe),
            HealthPolicy {
                max_attempts: health.attempts,
                backoff_min: health.backoff_min,
                backoff_max: health.backoff_max,
                required_consecutive: REQUIRED_CONSECUTIVE_PROBES,
                ..HealthPolicy::default()
            },
        ))
    }

    pub fn restore(&self) -> Result<RestoreOrchestrator> {
        self.restore_with(self.docker.clone(), Arc::new(self.health_verifier()?))
    }

    fn restore_with(
        &self,
        docker: Arc<DockerManager>,
        verifier: Arc<HealthVerifier>,
    ) -> Result<RestoreOrchestrator> {
        Ok(RestoreOrchestrator::new(
            self.sink.clone(),
            self.database(&docker),
            self.archiver.clone(),
            docker,
            verifier,
            restore_settings(&self.config),
        ))
    }

    pub fn migrations(&self) -> Result<MigrationRunner> {
        self.migrations_with(self.docker.clone())
    }

    fn migrations_with(&self, docker: Arc<DockerManager>) -> Result<MigrationRunner> {
        let journal = MigrationJournal::open(&self.config.storage.local_dir.join(MIGRATION_JOURNAL_FILE))?;
        let db = self.database(&docker);
        let tool = AlembicTool::new(
            docker,
            self.config.database.migration_service.clone(),
            self.config.database.alembic_config.clone(),
        );
        Ok(MigrationRunner::new(
            db,
            Arc::new(tool),
            journal,
            self.config.database.migration_timeout,
        ))
    }

    /// Coordinator for one environment, driving that environment's compose file
    pub fn deployment(&self, environment: &str) -> Result<DeploymentCoordinator> {
        let env = self.config.environments.get(environment).ok_or_else(|| {
            OpsError::PreconditionFailed(format!(
                "unknown environment '{}' (configured: {})",
                environment,
                self.config
                    .environments
                    .keys()
                    .cloned()
                    .collect::<Vec<_>>()
                    .join(", ")
            ))
        })?;

        let docker = self.environment_docker(environment)?;
        tracing::debug!(environment, compose_file = %docker.compose_file().display(), "deployment wiring");
        let known_services = docker.compose_services()?;
        let verifier = Arc::new(self.verifier_with(docker.clone())?);

        Ok(DeploymentCoordinator::new(
            environment_plans(&self.config),
            known_services,
            Arc::new(self.backup_with(docker.clone())?),
            docker.clone(),
            docker.clone(),
            Arc::new(self.migrations_with(docker.clone())?),
            verifier.clone(),
            Arc::new(self.restore_with(docker, verifier)?),
            DeploySettings {
                build_timeout: env.build_timeout,
                stop_timeout: self.config.restore.stop_timeout,
                start_timeout: self.config.restore.start_timeout,
                health_timeout: self.config.health.timeout,
            },
        ))
    }

    /// Same compose project, driven through the environment's compose file
    fn environment_docker(&self, environment: &str) -> Result<Arc<DockerManager>> {
        Ok(Arc::new(
            self.docker
                .with_compose_file(&self.config.compose_file_for(Some(environment)))?,
        ))
    }
}

/// Local directory, mirrored to remote object storage when configured
fn build_sink(config: &OpsConfig) -> Result<Arc<dyn StorageSink>> {
    let local: Arc<dyn StorageSink> = Arc::new(LocalSink::new(config.storage.local_dir.clone()));
    let Some(remote) = config.remote_settings()? else {
        return Ok(local);
    };

    let policy = RetryPolicy {
        attempts: config.retry.attempts,
        backoff_min: config.retry.backoff_min,
        backoff_max: config.retry.backoff_max,
        ..RetryPolicy::default()
    };
    let remote: Arc<dyn StorageSink> = Arc::new(RetryingSink::new(Arc::new(S3Sink::new(&remote)?), policy));
    tracing::debug!(local = %local.describe(), remote = %remote.describe(), "replicating bundles");
    Ok(Arc::new(ReplicatedSink::new(local, vec![remote])))
}

fn restore_settings(config: &OpsConfig) -> RestoreSettings {
    let mut trees = BTreeMap::new();
    for kind in [ComponentKind::Files, ComponentKind::Config] {
        if let Some(tree) = config.tree(kind) {
            trees.insert(
                kind,
                TreeTarget {
                    base: tree.base.clone(),
                    paths: tree.paths.clone(),
                },
            );
        }
    }
    RestoreSettings {
        services: config.restore.services.clone(),
        verify_services: config.verify_services(),
        stop_timeout: config.restore.stop_timeout,
        start_timeout: config.restore.start_timeout,
        database_timeout: config.database.restore_timeout,
        health_timeout: config.health.timeout,
        trees,
    }
}

fn environment_plans(config: &OpsConfig) -> BTreeMap<String, EnvironmentPlan> {
    config
        .environments
        .iter()
        .map(|(name, env)| {
            let health_services = if env.health_services.is_empty() {
                env.services.clone()
            } else {
                env.health_services.clone()
            };
            (
                name.clone(),
                EnvironmentPlan {
                    name: name.clone(),
                    services: env.services.clone(),
                    health_services,
                    require_confirmation: env.require_confirmation,
                    backup_domains: config.backup_domains(),
                },
            )
        })
        .collect()
}
