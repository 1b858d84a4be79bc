/// Backup orchestration
///
/// Captures each requested data domain into an [`ArtifactBundle`], stores the
/// component artifacts, writes the manifest last and then applies retention.
///
/// A failing domain never aborts its siblings: it is recorded as a failed
/// component and the bundle ends up `partial`. Only a missing database makes
/// the whole bundle `failed`, in which case nothing is kept.

use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::archive::{gzip, FileTreeAdapter};
use super::bundle::{ArtifactBundle, BundleId, BundleStatus, BundleSummary, ComponentKind, ComponentRecord};
use super::database::DatabaseAdapter;
use super::deadline::Deadline;
use super::docker::ServiceSupervisor;
use super::error::{OpsError, Result};
use super::retention::{PrunePlan, PruneReport, RetentionPolicy};
use super::storage::{load_manifest, StorageSink};
use crate::utils::MANIFEST_NAME;

/// Produces the artifact bytes for one data domain
#[async_trait]
pub trait DomainCapture: Send + Sync {
    async fn capture(&self) -> Result<Vec<u8>>;
}

/// Gzip-compressed database dump
pub struct DatabaseCapture {
    db: Arc<dyn DatabaseAdapter>,
}

impl DatabaseCapture {
    pub fn new(db: Arc<dyn DatabaseAdapter>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DomainCapture for DatabaseCapture {
    async fn capture(&self) -> Result<Vec<u8>> {
        let dump = self.db.dump().await?;
        gzip(&dump)
    }
}

/// Archive of a set of paths below a base directory
pub struct TreeCapture {
    archiver: Arc<dyn FileTreeAdapter>,
    base: PathBuf,
    paths: Vec<PathBuf>,
}

impl TreeCapture {
    pub fn new(archiver: Arc<dyn FileTreeAdapter>, base: PathBuf, paths: Vec<PathBuf>) -> Self {
        Self {
            archiver,
            base,
            paths,
        }
    }
}

#[async_trait]
impl DomainCapture for TreeCapture {
    async fn capture(&self) -> Result<Vec<u8>> {
        self.archiver.archive(&self.base, &self.paths).await
    }
}

/// Recent logs of the configured services, one section per service
pub struct LogCapture {
    supervisor: Arc<dyn ServiceSupervisor>,
    services: Vec<String>,
    tail: usize,
}

impl LogCapture {
    pub fn new(supervisor: Arc<dyn ServiceSupervisor>, services: Vec<String>, tail: usize) -> Self {
        Self {
            supervisor,
            services,
            tail,
        }
    }
}

#[async_trait]
impl DomainCapture for LogCapture {
    async fn capture(&self) -> Result<Vec<u8>> {
        let mut combined = String::new();
        for service in &self.services {
            let logs = self.supervisor.logs(service, self.tail).await?;
            combined.push_str(&format!("===== {} =====\n", service));
            combined.push_str(&logs);
            if !logs.ends_with('\n') {
                combined.push('\n');
            }
        }
        gzip(combined.as_bytes())
    }
}

#[derive(Debug, Clone)]
pub struct BackupSettings {
    /// Budget for capturing and storing a single domain
    pub capture_timeout: Duration,
    /// Capture domains concurrently instead of one after another
    pub concurrent: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            capture_timeout: Duration::from_secs(600),
            concurrent: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BackupOutcome {
    pub bundle: ArtifactBundle,
    /// `None` when the bundle list could not be read for pruning
    pub pruned: Option<PruneReport>,
}

/// Per-component result of re-reading a stored bundle
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub bundle: ArtifactBundle,
    pub components: Vec<(ComponentKind, std::result::Result<(), String>)>,
}

impl VerifyReport {
    pub fn is_intact(&self) -> bool {
        self.components.iter().all(|(_, r)| r.is_ok())
    }
}

pub struct BackupOrchestrator {
    captures: BTreeMap<ComponentKind, Arc<dyn DomainCapture>>,
    sink: Arc<dyn StorageSink>,
    retention: RetentionPolicy,
    settings: BackupSettings,
}

impl BackupOrchestrator {
    pub fn new(sink: Arc<dyn StorageSink>, retention: RetentionPolicy, settings: BackupSettings) -> Self {
        Self {
            captures: BTreeMap::new(),
            sink,
            retention,
            settings,
        }
    }

    pub fn with_capture(mut self, kind: ComponentKind, capture: Arc<dyn DomainCapture>) -> Self {
        self.captures.insert(kind, capture);
        self
    }

    pub fn sink(&self) -> &Arc<dyn StorageSink> {
        &self.sink
    }

    pub async fn create_backup(
        &self,
        domains: &BTreeSet<ComponentKind>,
        deadline: &Deadline,
    ) -> Result<BackupOutcome> {
        if domains.is_empty() {
            return Err(OpsError::PreconditionFailed("no backup domains selected".to_string()));
        }
        if !domains.contains(&ComponentKind::Database) {
            return Err(OpsError::PreconditionFailed(
                "a backup must include the database domain".to_string(),
            ));
        }
        if let Some(missing) = domains.iter().find(|k| !self.captures.contains_key(k)) {
            return Err(OpsError::PreconditionFailed(format!(
                "no capture configured for the {} domain",
                missing
            )));
        }

        let now = Utc::now();
        let id = BundleId::from_timestamp(now);
        match self.sink.get(&id, MANIFEST_NAME).await {
            Ok(_) => {
                return Err(OpsError::PreconditionFailed(format!(
                    "bundle {} already exists",
                    id
                )))
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        tracing::info!(bundle = %id, domains = ?domains, sink = %self.sink.describe(), "starting backup");
        let mut bundle = ArtifactBundle::new(id.clone(), now);

        // BTreeSet order is the capture order, also when captures run concurrently
        let records: Vec<ComponentRecord> = if self.settings.concurrent {
            join_all(domains.iter().map(|kind| self.capture_one(*kind, &id, deadline))).await
        } else {
            let mut records = Vec::with_capacity(domains.len());
            for kind in domains {
                records.push(self.capture_one(*kind, &id, deadline).await);
            }
            records
        };
        for record in records {
            bundle.record(record);
        }

        if bundle.finalize() == BundleStatus::Failed {
            let reason = bundle.warnings().join("; ");
            self.discard(&id).await;
            tracing::error!(bundle = %id, reason = %reason, "backup failed");
            return Err(OpsError::BackupFailed {
                bundle_id: id.to_string(),
                reason,
            });
        }

        // Manifest last: its presence implies every referenced component is stored
        let stored = match bundle.to_manifest() {
            Ok(manifest) => self.sink.put(&id, MANIFEST_NAME, &manifest).await,
            Err(e) => Err(e),
        };
        if let Err(e) = stored {
            bundle.mark_failed(format!("manifest could not be stored: {}", e));
            self.discard(&id).await;
            tracing::error!(bundle = %id, error = %e, "backup failed writing manifest");
            return Err(OpsError::BackupFailed {
                bundle_id: id.to_string(),
                reason: e.to_string(),
            });
        }

        for warning in bundle.warnings() {
            tracing::warn!(bundle = %id, "{}", warning);
        }
        tracing::info!(
            bundle = %id,
            status = %bundle.status(),
            bytes = bundle.total_bytes(),
            "backup finished"
        );

        let pruned = match self.sink.list().await {
            Ok(bundles) => Some(self.retention.prune(&bundles, self.sink.as_ref(), Utc::now()).await),
            Err(e) => {
                tracing::warn!(error = %e, "could not list bundles, skipping retention");
                None
            }
        };

        Ok(BackupOutcome { bundle, pruned })
    }

    async fn capture_one(&self, kind: ComponentKind, id: &BundleId, deadline: &Deadline) -> ComponentRecord {
        let Some(capture) = self.captures.get(&kind) else {
            return ComponentRecord::failed(kind, id, "no capture configured");
        };
        let timeout = self.settings.capture_timeout;

        let data = match deadline
            .run(&format!("capture {}", kind), timeout, capture.capture())
            .await
        {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(bundle = %id, domain = %kind, error = %e, "capture failed");
                return ComponentRecord::failed(kind, id, e.to_string());
            }
        };

        let stored = deadline
            .run(
                &format!("store {}", kind),
                timeout,
                self.sink.put(id, kind.artifact_name(), &data),
            )
            .await;
        match stored {
            Ok(()) => {
                tracing::info!(bundle = %id, domain = %kind, bytes = data.len(), "captured");
                ComponentRecord::captured(kind, id, &data)
            }
            Err(e) => {
                tracing::warn!(bundle = %id, domain = %kind, error = %e, "storing component failed");
                ComponentRecord::failed(kind, id, format!("store failed: {}", e))
            }
        }
    }

    /// Best-effort removal of the artifacts of a bundle that will not be kept
    async fn discard(&self, id: &BundleId) {
        match self.sink.delete(id).await {
            Ok(()) => tracing::info!(bundle = %id, "discarded stored components of failed bundle"),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(bundle = %id, error = %e, "failed to discard components"),
        }
    }

    pub async fn list(&self) -> Result<Vec<BundleSummary>> {
        self.sink.list().await
    }

    pub async fn show(&self, id: &BundleId) -> Result<ArtifactBundle> {
        load_manifest(self.sink.as_ref(), id).await
    }

    /// Re-read every complete component and compare it with the manifest
    pub async fn verify(&self, id: &BundleId) -> Result<VerifyReport> {
        let bundle = load_manifest(self.sink.as_ref(), id).await?;
        let components = read_components(self.sink.as_ref(), &bundle)
            .await
            .into_iter()
            .map(|(kind, result)| (kind, result.map(|_| ())))
            .collect();
        Ok(VerifyReport { bundle, components })
    }

    /// Retention on demand; with `dry_run` only the plan is computed
    pub async fn prune(&self, dry_run: bool) -> Result<(PrunePlan, Option<PruneReport>)> {
        let bundles = self.sink.list().await?;
        let now = Utc::now();
        let plan = self.retention.plan(&bundles, now);
        if dry_run {
            return Ok((plan, None));
        }
        let report = self.retention.prune(&bundles, self.sink.as_ref(), now).await;
        Ok((plan, Some(report)))
    }
}

/// Fetch and checksum-verify every complete component of `bundle`
pub(crate) async fn read_components(
    sink: &dyn StorageSink,
    bundle: &ArtifactBundle,
) -> Vec<(ComponentKind, std::result::Result<Vec<u8>, String>)> {
    let mut results = Vec::new();
    for record in bundle.components().iter().filter(|c| c.is_complete()) {
        let result = match sink.get(bundle.id(), record.kind.artifact_name()).await {
            Ok(data) => record.verify(&data).map(|_| data),
            Err(e) => Err(format!("{}: {}", record.name, e)),
        };
        results.push((record.kind, result));
    }
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retention::RetentionRule;
    use crate::core::testing::{MemorySink, StaticCapture};
    use chrono::Duration as ChronoDuration;

    fn orchestrator(sink: Arc<MemorySink>, concurrent: bool) -> BackupOrchestrator {
        BackupOrchestrator::new(
            sink,
            RetentionPolicy::new(RetentionRule::new(30).unwrap()),
            BackupSettings {
                capture_timeout: Duration::from_secs(5),
                concurrent,
            },
        )
    }

    fn domains(kinds: &[ComponentKind]) -> BTreeSet<ComponentKind> {
        kinds.iter().copied().collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_complete_bundle_has_checksummed_stored_components() {
        let sink = Arc::new(MemorySink::new());
        let backup = orchestrator(sink.clone(), false)
            .with_capture(ComponentKind::Database, Arc::new(StaticCapture::data(b"dump")))
            .with_capture(ComponentKind::Files, Arc::new(StaticCapture::data(b"tar")))
            .with_capture(ComponentKind::Config, Arc::new(StaticCapture::data(b"env")));

        let outcome = backup
            .create_backup(
                &domains(&[ComponentKind::Config, ComponentKind::Database, ComponentKind::Files]),
                &Deadline::none(),
            )
            .await
            .unwrap();

        let bundle = outcome.bundle;
        assert_eq!(bundle.status(), BundleStatus::Complete);
        for component in bundle.components() {
            assert!(!component.checksum.is_empty());
            assert!(sink.contains(bundle.id(), component.kind.artifact_name()));
        }
        let kinds: Vec<_> = bundle.components().iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![ComponentKind::Database, ComponentKind::Files, ComponentKind::Config]
        );

        // Manifest is the last object written for the bundle
        let writes = sink.put_log();
        assert_eq!(writes.last().map(|(_, c)| c.as_str()), Some(MANIFEST_NAME));
        assert!(backup.verify(bundle.id()).await.unwrap().is_intact());
    }

    #[tokio::test(start_paused = true)]
    async fn test_files_timeout_gives_partial_bundle() {
        let sink = Arc::new(MemorySink::new());
        let backup = orchestrator(sink.clone(), false)
            .with_capture(ComponentKind::Database, Arc::new(StaticCapture::data(b"dump")))
            .with_capture(ComponentKind::Files, Arc::new(StaticCapture::hang()));

        let outcome = backup
            .create_backup(&domains(&[ComponentKind::Database, ComponentKind::Files]), &Deadline::none())
            .await
            .unwrap();

        let bundle = &outcome.bundle;
        assert_eq!(bundle.status(), BundleStatus::Partial);
        assert!(bundle.component(ComponentKind::Database).unwrap().is_complete());
        let files = bundle.component(ComponentKind::Files).unwrap();
        assert!(!files.is_complete());
        assert!(files.error.as_deref().unwrap().contains("timed out"));

        // Retention keeps it as the floor even once it is old
        let listed = sink.list().await.unwrap();
        let plan = RetentionPolicy::new(RetentionRule::new(1).unwrap())
            .plan(&listed, Utc::now() + ChronoDuration::days(10));
        assert_eq!(plan.floor.as_ref(), Some(bundle.id()));
        assert!(plan.delete.is_empty());
    }

    #[tokio::test]
    async fn test_database_failure_discards_bundle() {
        let sink = Arc::new(MemorySink::new());
        let backup = orchestrator(sink.clone(), false)
            .with_capture(ComponentKind::Database, Arc::new(StaticCapture::error("pg_dump: connection refused")))
            .with_capture(ComponentKind::Files, Arc::new(StaticCapture::data(b"tar")));

        let err = backup
            .create_backup(&domains(&[ComponentKind::Database, ComponentKind::Files]), &Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::BackupFailed { .. }));
        assert!(sink.list().await.unwrap().is_empty());
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_store_failure_downgrades_component_only() {
        let sink = Arc::new(MemorySink::new());
        sink.fail_puts_for(ComponentKind::Config.artifact_name());
        let backup = orchestrator(sink.clone(), false)
            .with_capture(ComponentKind::Database, Arc::new(StaticCapture::data(b"dump")))
            .with_capture(ComponentKind::Config, Arc::new(StaticCapture::data(b"env")));

        let outcome = backup
            .create_backup(&domains(&[ComponentKind::Database, ComponentKind::Config]), &Deadline::none())
            .await
            .unwrap();
        assert_eq!(outcome.bundle.status(), BundleStatus::Partial);
        assert!(sink.contains(outcome.bundle.id(), ComponentKind::Database.artifact_name()));
        assert_eq!(outcome.bundle.warnings().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_capture_keeps_domain_order() {
        let sink = Arc::new(MemorySink::new());
        let backup = orchestrator(sink.clone(), true)
            .with_capture(
                ComponentKind::Database,
                Arc::new(StaticCapture::delayed(b"dump", Duration::from_secs(2))),
            )
            .with_capture(ComponentKind::Logs, Arc::new(StaticCapture::data(b"logs")));

        let outcome = backup
            .create_backup(&domains(&[ComponentKind::Logs, ComponentKind::Database]), &Deadline::none())
            .await
            .unwrap();
        let kinds: Vec<_> = outcome.bundle.components().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ComponentKind::Database, ComponentKind::Logs]);
    }

    #[tokio::test]
    async fn test_backup_prunes_expired_bundles() {
        let sink = Arc::new(MemorySink::new());
        let expired = BundleId::from_timestamp(Utc::now() - ChronoDuration::days(45));
        sink.insert_bundle(expired.clone(), Utc::now() - ChronoDuration::days(45), BundleStatus::Complete);

        let backup = orchestrator(sink.clone(), false)
            .with_capture(ComponentKind::Database, Arc::new(StaticCapture::data(b"dump")));
        let outcome = backup
            .create_backup(&domains(&[ComponentKind::Database]), &Deadline::none())
            .await
            .unwrap();

        let pruned = outcome.pruned.unwrap();
        assert_eq!(pruned.deleted, vec![expired]);
        assert_eq!(pruned.floor.as_ref(), Some(outcome.bundle.id()));
    }

    #[tokio::test]
    async fn test_backup_requires_database_domain() {
        let sink = Arc::new(MemorySink::new());
        let backup = orchestrator(sink, false)
            .with_capture(ComponentKind::Files, Arc::new(StaticCapture::data(b"tar")));
        let err = backup
            .create_backup(&domains(&[ComponentKind::Files]), &Deadline::none())
            .await
            .unwrap_err();
        assert!(matches!(err, OpsError::PreconditionFailed(_)));
        assert!(backup
            .create_backup(&BTreeSet::new(), &Deadline::none())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_verify_detects_corrupted_component() {
        let sink = Arc::new(MemorySink::new());
        let backup = orchestrator(sink.clone(), false)
            .with_capture(ComponentKind::Database, Arc::new(StaticCapture::data(b"dump")));
        let outcome = backup
            .create_backup(&domains(&[ComponentKind::Database]), &Deadline::none())
            .await
            .unwrap();

        sink.overwrite(outcome.bundle.id(), ComponentKind::Database.artifact_name(), b"tampered");
        let report = backup.verify(outcome.bundle.id()).await.unwrap();
        assert!(!report.is_intact());
    }

    #[tokio::test]
    async fn test_log_capture_fails_when_any_service_fails() {
        use crate::core::docker::MockServiceSupervisor;

        let mut supervisor = MockServiceSupervisor::new();
        supervisor.expect_logs().returning(|service, _| match service {
            "api" => Ok("GET /health 200\n".to_string()),
            _ => Err(OpsError::Command {
                command: "docker compose logs".to_string(),
                stderr: "no such service".to_string(),
            }),
        });
        let supervisor = Arc::new(supervisor);

        let ok = LogCapture::new(supervisor.clone(), vec!["api".to_string()], 100);
        let text = crate::core::archive::gunzip(&ok.capture().await.unwrap()).unwrap();
        assert!(String::from_utf8(text).unwrap().starts_with("===== api ====="));

        let failing = LogCapture::new(supervisor, vec!["api".to_string(), "worker".to_string()], 100);
        assert!(failing.capture().await.is_err());
    }
}
