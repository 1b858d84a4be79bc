/// Deployment coordination
///
/// `Preparing → BackingUp → Building → Stopping → Starting → Migrating →
/// Verifying → Done`. Precondition problems are returned as errors before
/// anything changes. Once the run has started, a failure produces a report naming
/// the failed step and the last good bundle; restoring that bundle is a separate,
/// operator-invoked [`DeploymentCoordinator::rollback`].

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use super::backup::BackupOrchestrator;
use super::bundle::{BundleId, BundleStatus, ComponentKind};
use super::deadline::Deadline;
use super::docker::{ArtifactBuilder, ServiceSupervisor};
use super::error::{OpsError, Result};
use super::health::{HealthReport, HealthVerifier};
use super::migration::{MigrationRunner, MigrationState};
use super::restore::{ConfirmationToken, RestoreOrchestrator, RestoreReport};
use crate::utils::HEAD_REVISION;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployStep {
    Preparing,
    BackingUp,
    Building,
    Stopping,
    Starting,
    Migrating,
    Verifying,
    Done,
    RollingBack,
    RolledBack,
}

impl fmt::Display for DeployStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeployStep::Preparing => "Preparing",
            DeployStep::BackingUp => "BackingUp",
            DeployStep::Building => "Building",
            DeployStep::Stopping => "Stopping",
            DeployStep::Starting => "Starting",
            DeployStep::Migrating => "Migrating",
            DeployStep::Verifying => "Verifying",
            DeployStep::Done => "Done",
            DeployStep::RollingBack => "RollingBack",
            DeployStep::RolledBack => "RolledBack",
        };
        f.write_str(name)
    }
}

/// What a named environment deploys
#[derive(Debug, Clone)]
pub struct EnvironmentPlan {
    pub name: String,
    pub services: Vec<String>,
    pub health_services: Vec<String>,
    pub require_confirmation: bool,
    pub backup_domains: BTreeSet<ComponentKind>,
}

#[derive(Debug, Clone)]
pub struct DeploySettings {
    pub build_timeout: Duration,
    pub stop_timeout: Duration,
    pub start_timeout: Duration,
    pub health_timeout: Duration,
}

impl Default for DeploySettings {
    fn default() -> Self {
        Self {
            build_timeout: Duration::from_secs(1800),
            stop_timeout: Duration::from_secs(120),
            start_timeout: Duration::from_secs(300),
            health_timeout: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeploymentReport {
    pub environment: String,
    pub started_at: DateTime<Utc>,
    /// Steps completed, in order
    pub steps: Vec<DeployStep>,
    pub failed_step: Option<DeployStep>,
    pub error: Option<String>,
    pub last_good_bundle: Option<BundleId>,
    pub manual_recovery: bool,
    pub migration: Option<MigrationState>,
    pub health: BTreeMap<String, HealthReport>,
    pub restore: Option<RestoreReport>,
}

impl DeploymentReport {
    fn new(environment: &str) -> Self {
        Self {
            environment: environment.to_string(),
            started_at: Utc::now(),
            steps: Vec::new(),
            failed_step: None,
            error: None,
            last_good_bundle: None,
            manual_recovery: false,
            migration: None,
            health: BTreeMap::new(),
            restore: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failed_step.is_none()
    }

    fn fail(mut self, step: DeployStep, error: impl fmt::Display, manual_recovery: bool) -> Self {
        tracing::error!(
            environment = %self.environment,
            step = %step,
            last_good_bundle = ?self.last_good_bundle.as_ref().map(|b| b.to_string()),
            manual_recovery,
            error = %error,
            "deployment failed"
        );
        self.failed_step = Some(step);
        self.error = Some(error.to_string());
        self.manual_recovery = manual_recovery;
        self
    }
}

pub struct DeploymentCoordinator {
    environments: BTreeMap<String, EnvironmentPlan>,
    known_services: BTreeSet<String>,
    backup: Arc<BackupOrchestrator>,
    builder: Arc<dyn ArtifactBuilder>,
    supervisor: Arc<dyn ServiceSupervisor>,
    migrations: Arc<MigrationRunner>,
    verifier: Arc<HealthVerifier>,
    restore: Arc<RestoreOrchestrator>,
    settings: DeploySettings,
}

impl DeploymentCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        environments: BTreeMap<String, EnvironmentPlan>,
        known_services: BTreeSet<String>,
        backup: Arc<BackupOrchestrator>,
        builder: Arc<dyn ArtifactBuilder>,
        supervisor: Arc<dyn ServiceSupervisor>,
        migrations: Arc<MigrationRunner>,
        verifier: Arc<HealthVerifier>,
        restore: Arc<RestoreOrchestrator>,
        settings: DeploySettings,
    ) -> Self {
        Self {
            environments,
            known_services,
            backup,
            builder,
            supervisor,
            migrations,
            verifier,
            restore,
            settings,
        }
    }

    fn prepare(&self, environment: &str, confirm: bool) -> Result<&EnvironmentPlan> {
        let plan = self.environments.get(environment).ok_or_else(|| {
            OpsError::PreconditionFailed(format!(
                "unknown environment '{}' (known: {})",
                environment,
                self.environments.keys().cloned().collect::<Vec<_>>().join(", ")
            ))
        })?;

        if plan.require_confirmation && !confirm {
            return Err(OpsError::ConfirmationRequired(format!(
                "deploying to {} requires --confirm",
                environment
            )));
        }
        if plan.services.is_empty() {
            return Err(OpsError::PreconditionFailed(format!(
                "environment '{}' lists no services",
                environment
            )));
        }
        let unknown: Vec<&str> = plan
            .services
            .iter()
            .chain(plan.health_services.iter())
            .filter(|s| !self.known_services.contains(*s))
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            return Err(OpsError::PreconditionFailed(format!(
                "services not defined in the compose file: {}",
                unknown.join(", ")
            )));
        }
        Ok(plan)
    }

    pub async fn deploy(&self, environment: &str, confirm: bool, deadline: &Deadline) -> Result<DeploymentReport> {
        let plan = self.prepare(environment, confirm)?;
        let mut report = DeploymentReport::new(environment);
        report.steps.push(DeployStep::Preparing);
        tracing::info!(environment, services = ?plan.services, "deployment started");

        // BackingUp
        match self.backup.create_backup(&plan.backup_domains, deadline).await {
            Ok(outcome) => {
                if outcome.bundle.status() == BundleStatus::Partial {
                    tracing::warn!(bundle = %outcome.bundle.id(), "pre-deploy backup is partial");
                }
                report.last_good_bundle = Some(outcome.bundle.id().clone());
            }
            Err(e) => {
                report.last_good_bundle = self.latest_complete_bundle().await;
                return Ok(report.fail(DeployStep::BackingUp, e, false));
            }
        }
        report.steps.push(DeployStep::BackingUp);

        // Building
        let built = deadline
            .run(
                "build",
                self.settings.build_timeout,
                self.builder.build(environment, &plan.services),
            )
            .await;
        if let Err(e) = built {
            return Ok(report.fail(DeployStep::Building, e, false));
        }
        report.steps.push(DeployStep::Building);

        // From here on the running stack changes
        let stopped = deadline
            .run("stop services", self.settings.stop_timeout, self.supervisor.stop(&plan.services))
            .await;
        if let Err(e) = stopped {
            return Ok(report.fail(DeployStep::Stopping, e, true));
        }
        report.steps.push(DeployStep::Stopping);

        let started = deadline
            .run("start services", self.settings.start_timeout, self.supervisor.start(&plan.services))
            .await;
        if let Err(e) = started {
            return Ok(report.fail(DeployStep::Starting, e, true));
        }
        report.steps.push(DeployStep::Starting);

        match self.migrations.upgrade(HEAD_REVISION, deadline).await {
            Ok(state) => report.migration = Some(state),
            Err(e) => return Ok(report.fail(DeployStep::Migrating, e, true)),
        }
        report.steps.push(DeployStep::Migrating);

        report.health = self
            .verifier
            .verify(&plan.health_services, deadline.budget(self.settings.health_timeout))
            .await;
        let unhealthy: Vec<String> = report
            .health
            .values()
            .filter(|r| !r.healthy)
            .map(|r| format!("{}: {}", r.service_name, r.detail))
            .collect();
        if !unhealthy.is_empty() {
            let reason = format!("unhealthy after deploy: {}", unhealthy.join("; "));
            return Ok(report.fail(DeployStep::Verifying, reason, true));
        }
        report.steps.push(DeployStep::Verifying);
        report.steps.push(DeployStep::Done);

        tracing::info!(
            environment,
            revision = ?report.migration.as_ref().map(|m| m.current_revision.clone()),
            "deployment finished"
        );
        Ok(report)
    }

    /// Restore `bundle_id` after a failed deployment. Always explicit: the token
    /// must confirm the bundle.
    pub async fn rollback(
        &self,
        environment: &str,
        bundle_id: &BundleId,
        confirmation: &ConfirmationToken,
        deadline: &Deadline,
    ) -> Result<DeploymentReport> {
        if !self.environments.contains_key(environment) {
            return Err(OpsError::PreconditionFailed(format!(
                "unknown environment '{}'",
                environment
            )));
        }

        let mut report = DeploymentReport::new(environment);
        report.last_good_bundle = Some(bundle_id.clone());
        tracing::warn!(environment, bundle = %bundle_id, "rolling back deployment");

        let restored = self
            .restore
            .restore(bundle_id, Some(confirmation), deadline)
            .await
            .map_err(|e| e.at_step(DeployStep::RollingBack.to_string(), bundle_id.to_string(), true))?;
        report.steps.push(DeployStep::RollingBack);
        report.health = restored.health.clone();
        report.restore = Some(restored);
        report.steps.push(DeployStep::RolledBack);

        tracing::info!(environment, bundle = %bundle_id, "rolled back");
        Ok(report)
    }

    async fn latest_complete_bundle(&self) -> Option<BundleId> {
        match self.backup.list().await {
            Ok(bundles) => bundles
                .into_iter()
                .filter(|b| b.status == BundleStatus::Complete)
                .max_by(|a, b| a.created_at.cmp(&b.created_at))
                .map(|b| b.id),
            Err(e) => {
                tracing::warn!(error = %e, "could not list bundles");
                None
            }
        }
    }
}
