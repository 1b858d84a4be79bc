/// Restore orchestration
///
/// `Validating → ServicesStopped → DatabaseRestoring → FilesRestoring →
/// ConfigRestoring → ServicesStarting → Verified`, strictly in that order. Any
/// failing step ends the run; the error names the step and the bundle.
///
/// The database step is destructive and needs a confirmation token equal to the
/// bundle id. Restored trees replace the live ones, which are moved aside as
/// `<name>.pre-restore-<bundle-id>` and never deleted; [`RestoreOrchestrator::revert`]
/// moves them back. Nothing is reverted automatically.

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;

use super::archive::{gunzip, FileTreeAdapter};
use super::backup::read_components;
use super::bundle::{BundleId, ComponentKind};
use super::database::DatabaseAdapter;
use super::deadline::Deadline;
use super::docker::ServiceSupervisor;
use super::error::{OpsError, Result};
use super::health::{HealthReport, HealthVerifier};
use super::storage::{load_manifest, StorageSink};
use crate::utils::STOP_POLL_INTERVAL;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStep {
    Validating,
    ServicesStopped,
    DatabaseRestoring,
    FilesRestoring,
    ConfigRestoring,
    ServicesStarting,
    Verified,
    Failed,
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreStep::Validating => "Validating",
            RestoreStep::ServicesStopped => "ServicesStopped",
            RestoreStep::DatabaseRestoring => "DatabaseRestoring",
            RestoreStep::FilesRestoring => "FilesRestoring",
            RestoreStep::ConfigRestoring => "ConfigRestoring",
            RestoreStep::ServicesStarting => "ServicesStarting",
            RestoreStep::Verified => "Verified",
            RestoreStep::Failed => "Failed",
        };
        f.write_str(name)
    }
}

/// Explicit operator consent for the destructive database step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfirmationToken(String);

impl ConfirmationToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn confirms(&self, bundle_id: &BundleId) -> bool {
        self.0 == bundle_id.as_str()
    }
}

/// Live location of a restorable tree
#[derive(Debug, Clone)]
pub struct TreeTarget {
    pub base: PathBuf,
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct RestoreSettings {
    /// Services stopped before and started after the restore
    pub services: Vec<String>,
    /// Services that must report healthy for the restore to count as verified
    pub verify_services: Vec<String>,
    pub stop_timeout: Duration,
    pub start_timeout: Duration,
    pub database_timeout: Duration,
    pub health_timeout: Duration,
    pub trees: BTreeMap<ComponentKind, TreeTarget>,
}

#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub bundle_id: BundleId,
    /// Steps completed, in order
    pub steps: Vec<RestoreStep>,
    /// Prior live contents kept next to their restored replacements
    pub moved_aside: Vec<PathBuf>,
    /// Tree domains not restored (failed in the bundle or not configured)
    pub skipped: Vec<ComponentKind>,
    pub health: BTreeMap<String, HealthReport>,
}

#[derive(Debug, Clone, Default)]
pub struct RevertReport {
    pub restored: Vec<PathBuf>,
    pub set_aside: Vec<PathBuf>,
}

pub struct RestoreOrchestrator {
    sink: Arc<dyn StorageSink>,
    db: Arc<dyn DatabaseAdapter>,
    archiver: Arc<dyn FileTreeAdapter>,
    supervisor: Arc<dyn ServiceSupervisor>,
    verifier: Arc<HealthVerifier>,
    settings: RestoreSettings,
}

impl RestoreOrchestrator {
    pub fn new(
        sink: Arc<dyn StorageSink>,
        db: Arc<dyn DatabaseAdapter>,
        archiver: Arc<dyn FileTreeAdapter>,
        supervisor: Arc<dyn ServiceSupervisor>,
        verifier: Arc<HealthVerifier>,
        settings: RestoreSettings,
    ) -> Self {
        Self {
            sink,
            db,
            archiver,
            supervisor,
            verifier,
            settings,
        }
    }

    pub async fn restore(
        &self,
        bundle_id: &BundleId,
        confirmation: Option<&ConfirmationToken>,
        deadline: &Deadline,
    ) -> Result<RestoreReport> {
        let entity = bundle_id.to_string();
        let mut report = RestoreReport {
            bundle_id: bundle_id.clone(),
            steps: Vec::new(),
            moved_aside: Vec::new(),
            skipped: Vec::new(),
            health: BTreeMap::new(),
        };

        // Validating
        tracing::info!(bundle = %bundle_id, "validating bundle");
        let mut payloads = self
            .validate(bundle_id)
            .await
            .map_err(|e| e.at_step(RestoreStep::Validating.to_string(), &entity, false))?;
        self.check_aside_slots(bundle_id, &payloads)
            .await
            .map_err(|e| e.at_step(RestoreStep::Validating.to_string(), &entity, false))?;
        report.steps.push(RestoreStep::Validating);

        // ServicesStopped
        tracing::info!(bundle = %bundle_id, services = ?self.settings.services, "stopping services");
        deadline
            .run("stop services", self.settings.stop_timeout, self.stop_and_wait())
            .await
            .map_err(|e| e.at_step(RestoreStep::ServicesStopped.to_string(), &entity, true))?;
        report.steps.push(RestoreStep::ServicesStopped);

        // DatabaseRestoring
        if !confirmation.map(|t| t.confirms(bundle_id)).unwrap_or(false) {
            tracing::warn!(bundle = %bundle_id, "database restore not confirmed, restarting services");
            let restarted = self.supervisor.start(&self.settings.services).await;
            if let Err(e) = &restarted {
                tracing::error!(error = %e, "failed to restart services after refused restore");
            }
            let refused = OpsError::ConfirmationRequired(format!(
                "restoring {} drops and recreates the database; pass --confirm {} to proceed",
                bundle_id, bundle_id
            ));
            return Err(refused.at_step(
                RestoreStep::DatabaseRestoring.to_string(),
                &entity,
                restarted.is_err(),
            ));
        }

        let dump = payloads
            .remove(&ComponentKind::Database)
            .ok_or_else(|| OpsError::BundleCorrupt {
                bundle_id: entity.clone(),
                reason: "bundle has no database component".to_string(),
            })
            .and_then(|data| gunzip(&data))
            .map_err(|e| e.at_step(RestoreStep::DatabaseRestoring.to_string(), &entity, true))?;
        tracing::info!(bundle = %bundle_id, bytes = dump.len(), "restoring database");
        deadline
            .run("restore database", self.settings.database_timeout, self.db.restore(&dump))
            .await
            .map_err(|e| e.at_step(RestoreStep::DatabaseRestoring.to_string(), &entity, true))?;
        report.steps.push(RestoreStep::DatabaseRestoring);

        // FilesRestoring, ConfigRestoring
        for (kind, step) in [
            (ComponentKind::Files, RestoreStep::FilesRestoring),
            (ComponentKind::Config, RestoreStep::ConfigRestoring),
        ] {
            match (payloads.remove(&kind), self.settings.trees.get(&kind)) {
                (Some(data), Some(target)) => {
                    tracing::info!(bundle = %bundle_id, domain = %kind, base = %target.base.display(), "restoring tree");
                    let moved = self
                        .restore_tree(bundle_id, &data, target)
                        .await
                        .map_err(|e| e.at_step(step.to_string(), &entity, true))?;
                    report.moved_aside.extend(moved);
                }
                (data, _) => {
                    tracing::warn!(
                        bundle = %bundle_id,
                        domain = %kind,
                        in_bundle = data.is_some(),
                        "tree not restored"
                    );
                    report.skipped.push(kind);
                }
            }
            report.steps.push(step);
        }

        // ServicesStarting
        tracing::info!(bundle = %bundle_id, "starting services");
        deadline
            .run(
                "start services",
                self.settings.start_timeout,
                self.supervisor.start(&self.settings.services),
            )
            .await
            .map_err(|e| e.at_step(RestoreStep::ServicesStarting.to_string(), &entity, true))?;

        report.health = self
            .verifier
            .verify(&self.settings.verify_services, deadline.budget(self.settings.health_timeout))
            .await;
        let unhealthy: Vec<&str> = report
            .health
            .values()
            .filter(|r| !r.healthy)
            .map(|r| r.service_name.as_str())
            .collect();
        if !unhealthy.is_empty() {
            for path in &report.moved_aside {
                tracing::warn!(path = %path.display(), "prior contents left in place for manual recovery");
            }
            return Err(OpsError::PartialFailure(format!(
                "services not healthy after restore: {}",
                unhealthy.join(", ")
            ))
            .at_step(RestoreStep::ServicesStarting.to_string(), &entity, true));
        }
        report.steps.push(RestoreStep::ServicesStarting);
        report.steps.push(RestoreStep::Verified);

        tracing::info!(bundle = %bundle_id, moved_aside = report.moved_aside.len(), "restore verified");
        Ok(report)
    }

    /// Manifest present and every complete component matching its checksum
    async fn validate(&self, bundle_id: &BundleId) -> Result<BTreeMap<ComponentKind, Vec<u8>>> {
        let bundle = load_manifest(self.sink.as_ref(), bundle_id).await?;
        let mut payloads = BTreeMap::new();
        let mut problems = Vec::new();
        for (kind, result) in read_components(self.sink.as_ref(), &bundle).await {
            match result {
                Ok(data) => {
                    payloads.insert(kind, data);
                }
                Err(reason) => problems.push(reason),
            }
        }

        if !problems.is_empty() {
            return Err(OpsError::BundleCorrupt {
                bundle_id: bundle_id.to_string(),
                reason: problems.join("; "),
            });
        }
        if !payloads.contains_key(&ComponentKind::Database) {
            return Err(OpsError::BundleCorrupt {
                bundle_id: bundle_id.to_string(),
                reason: "bundle has no complete database component".to_string(),
            });
        }
        Ok(payloads)
    }

    /// Every tree that will be restored needs a free `pre-restore` slot per path
    async fn check_aside_slots(
        &self,
        bundle_id: &BundleId,
        payloads: &BTreeMap<ComponentKind, Vec<u8>>,
    ) -> Result<()> {
        let suffix = format!("pre-restore-{}", bundle_id);
        for (kind, target) in &self.settings.trees {
            if !payloads.contains_key(kind) {
                continue;
            }
            for rel in &target.paths {
                let aside = sibling(&target.base.join(rel), &suffix);
                if exists(&aside).await {
                    return Err(OpsError::PreconditionFailed(format!(
                        "{} already exists from an earlier restore of this bundle; move it away first",
                        aside.display()
                    )));
                }
            }
        }
        Ok(())
    }

    async fn stop_and_wait(&self) -> Result<()> {
        self.supervisor.stop(&self.settings.services).await?;
        loop {
            let mut still_running = Vec::new();
            for service in &self.settings.services {
                if self.supervisor.status(service).await?.running {
                    still_running.push(service.as_str());
                }
            }
            if still_running.is_empty() {
                return Ok(());
            }
            tracing::debug!(services = ?still_running, "waiting for services to stop");
            tokio::time::sleep(STOP_POLL_INTERVAL).await;
        }
    }

    /// Extract into a staging directory, move live paths aside, move staged copies in
    async fn restore_tree(&self, bundle_id: &BundleId, data: &[u8], target: &TreeTarget) -> Result<Vec<PathBuf>> {
        let staging = target
            .base
            .join(format!(".stackguard-staging-{}", bundle_id));
        if exists(&staging).await {
            fs::remove_dir_all(&staging).await?;
        }
        self.archiver.extract(data, &staging).await?;

        let suffix = format!("pre-restore-{}", bundle_id);
        let mut moved = Vec::new();
        for rel in &target.paths {
            let staged = staging.join(rel);
            let live = target.base.join(rel);
            if !exists(&staged).await {
                tracing::warn!(path = %rel.display(), "path not present in bundle, left untouched");
                continue;
            }

            if exists(&live).await {
                let aside = sibling(&live, &suffix);
                fs::rename(&live, &aside).await?;
                tracing::info!(from = %live.display(), to = %aside.display(), "moved live contents aside");
                moved.push(aside);
            } else if let Some(parent) = live.parent() {
                fs::create_dir_all(parent).await?;
            }
            fs::rename(&staged, &live).await?;
        }

        fs::remove_dir_all(&staging).await?;
        Ok(moved)
    }

    /// Put the contents moved aside by a restore of `bundle_id` back in place. The
    /// restored contents are kept as `<name>.restored-<bundle-id>`. The database
    /// is not touched; restore an earlier bundle for that.
    pub async fn revert(&self, bundle_id: &BundleId, deadline: &Deadline) -> Result<RevertReport> {
        let entity = bundle_id.to_string();
        let aside_suffix = format!("pre-restore-{}", bundle_id);
        let restored_suffix = format!("restored-{}", bundle_id);

        let mut pending = Vec::new();
        for target in self.settings.trees.values() {
            for rel in &target.paths {
                let live = target.base.join(rel);
                let aside = sibling(&live, &aside_suffix);
                if exists(&aside).await {
                    let set_aside = sibling(&live, &restored_suffix);
                    if exists(&set_aside).await {
                        return Err(OpsError::PreconditionFailed(format!(
                            "{} already exists; move it away first",
                            set_aside.display()
                        )));
                    }
                    pending.push((live, aside, set_aside));
                }
            }
        }
        if pending.is_empty() {
            return Err(OpsError::PreconditionFailed(format!(
                "nothing was moved aside by a restore of {}",
                bundle_id
            )));
        }

        deadline
            .run("stop services", self.settings.stop_timeout, self.stop_and_wait())
            .await
            .map_err(|e| e.at_step("RevertStopping", &entity, true))?;

        let mut report = RevertReport::default();
        for (live, aside, set_aside) in pending {
            let swapped = async {
                if exists(&live).await {
                    fs::rename(&live, &set_aside).await?;
                    report.set_aside.push(set_aside.clone());
                }
                fs::rename(&aside, &live).await?;
                Ok::<(), OpsError>(())
            }
            .await;
            swapped.map_err(|e| e.at_step("Reverting", &entity, true))?;
            tracing::info!(path = %live.display(), "reverted to pre-restore contents");
            report.restored.push(live);
        }

        deadline
            .run(
                "start services",
                self.settings.start_timeout,
                self.supervisor.start(&self.settings.services),
            )
            .await
            .map_err(|e| e.at_step("RevertStarting", &entity, true))?;
        Ok(report)
    }
}

async fn exists(path: &Path) -> bool {
    fs::symlink_metadata(path).await.is_ok()
}

/// `<dir>/<name>.<suffix>` next to `path`
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    path.with_file_name(format!("{}.{}", name, suffix))
}
