/// In-memory doubles shared by the unit tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::archive::gzip;
use super::backup::DomainCapture;
use super::bundle::{ArtifactBundle, BundleId, BundleStatus, BundleSummary, ComponentKind, ComponentRecord};
use super::database::DatabaseAdapter;
use super::docker::{ServiceStatus, ServiceSupervisor};
use super::error::{OpsError, Result};
use super::health::{HealthProbe, ProbeResult};
use super::migration::{AppliedStep, Direction, MigrationTool, ToolRun};
use super::storage::StorageSink;
use crate::utils::{BASE_REVISION, HEAD_REVISION, MANIFEST_NAME};

#[derive(Default)]
pub struct MemorySink {
    objects: Mutex<BTreeMap<(BundleId, String), Vec<u8>>>,
    puts: Mutex<Vec<(BundleId, String)>>,
    failing_puts: Mutex<BTreeSet<String>>,
    failing_deletes: Mutex<BTreeSet<BundleId>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, bundle_id: &BundleId, component: &str) -> bool {
        self.objects
            .lock()
            .unwrap()
            .contains_key(&(bundle_id.clone(), component.to_string()))
    }

    pub fn put_log(&self) -> Vec<(BundleId, String)> {
        self.puts.lock().unwrap().clone()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().unwrap().is_empty()
    }

    pub fn fail_puts_for(&self, component: &str) {
        self.failing_puts.lock().unwrap().insert(component.to_string());
    }

    pub fn fail_deletes_for(&self, bundle_id: BundleId) {
        self.failing_deletes.lock().unwrap().insert(bundle_id);
    }

    pub fn overwrite(&self, bundle_id: &BundleId, component: &str, data: &[u8]) {
        self.objects
            .lock()
            .unwrap()
            .insert((bundle_id.clone(), component.to_string()), data.to_vec());
    }

    /// Store a bundle with the given status directly, bypassing the orchestrator
    pub fn insert_bundle(&self, bundle_id: BundleId, created_at: DateTime<Utc>, status: BundleStatus) {
        let data = b"-- dump".to_vec();
        let mut bundle = ArtifactBundle::new(bundle_id.clone(), created_at);
        match status {
            BundleStatus::Failed => {
                bundle.record(ComponentRecord::failed(ComponentKind::Database, &bundle_id, "pg_dump failed"));
            }
            _ => {
                bundle.record(ComponentRecord::captured(ComponentKind::Database, &bundle_id, &data));
                self.overwrite(&bundle_id, ComponentKind::Database.artifact_name(), &data);
            }
        }
        if status == BundleStatus::Partial {
            bundle.record(ComponentRecord::failed(ComponentKind::Files, &bundle_id, "timed out"));
        }
        if status != BundleStatus::InProgress {
            bundle.finalize();
        }
        self.overwrite(&bundle_id, MANIFEST_NAME, &bundle.to_manifest().unwrap());
    }
}

#[async_trait]
impl StorageSink for MemorySink {
    fn describe(&self) -> String {
        "memory".to_string()
    }

    async fn put(&self, bundle_id: &BundleId, component: &str, data: &[u8]) -> Result<()> {
        if self.failing_puts.lock().unwrap().contains(component) {
            return Err(OpsError::storage(format!("write of {} refused", component)));
        }
        self.puts
            .lock()
            .unwrap()
            .push((bundle_id.clone(), component.to_string()));
        self.overwrite(bundle_id, component, data);
        Ok(())
    }

    async fn get(&self, bundle_id: &BundleId, component: &str) -> Result<Vec<u8>> {
        self.objects
            .lock()
            .unwrap()
            .get(&(bundle_id.clone(), component.to_string()))
            .cloned()
            .ok_or_else(|| OpsError::NotFound(format!("{}/{}", bundle_id, component)))
    }

    async fn list(&self) -> Result<Vec<BundleSummary>> {
        let objects = self.objects.lock().unwrap();
        let mut summaries = Vec::new();
        for ((id, component), data) in objects.iter() {
            if component == MANIFEST_NAME {
                summaries.push(ArtifactBundle::from_manifest(id, data)?.summary());
            }
        }
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(summaries)
    }

    async fn delete(&self, bundle_id: &BundleId) -> Result<()> {
        if self.failing_deletes.lock().unwrap().contains(bundle_id) {
            return Err(OpsError::storage(format!("delete of {} refused", bundle_id)));
        }
        let mut objects = self.objects.lock().unwrap();
        let before = objects.len();
        objects.retain(|(id, _), _| id != bundle_id);
        if objects.len() == before {
            return Err(OpsError::BundleNotFound(bundle_id.to_string()));
        }
        Ok(())
    }
}

/// Sink whose calls fail a scripted number of times
pub struct FlakySink {
    remaining_failures: AtomicUsize,
    auth: bool,
    calls: AtomicUsize,
    inner: MemorySink,
}

impl FlakySink {
    pub fn transient_failures(failures: usize) -> Self {
        Self {
            remaining_failures: AtomicUsize::new(failures),
            auth: false,
            calls: AtomicUsize::new(0),
            inner: MemorySink::new(),
        }
    }

    pub fn auth_failure() -> Self {
        Self {
            remaining_failures: AtomicUsize::new(usize::MAX),
            auth: true,
            calls: AtomicUsize::new(0),
            inner: MemorySink::new(),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn attempt(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.auth {
            return Err(OpsError::StorageAuth("access denied".to_string()));
        }
        let left = self.remaining_failures.load(Ordering::SeqCst);
        if left > 0 {
            self.remaining_failures.store(left - 1, Ordering::SeqCst);
            return Err(OpsError::transient_storage("connection reset"));
        }
        Ok(())
    }
}

#[async_trait]
impl StorageSink for FlakySink {
    fn describe(&self) -> String {
        "flaky".to_string()
    }

    async fn put(&self, bundle_id: &BundleId, component: &str, data: &[u8]) -> Result<()> {
        self.attempt()?;
        self.inner.put(bundle_id, component, data).await
    }

    async fn get(&self, bundle_id: &BundleId, component: &str) -> Result<Vec<u8>> {
        self.attempt()?;
        self.inner.get(bundle_id, component).await
    }

    async fn list(&self) -> Result<Vec<BundleSummary>> {
        self.attempt()?;
        self.inner.list().await
    }

    async fn delete(&self, bundle_id: &BundleId) -> Result<()> {
        self.attempt()?;
        self.inner.delete(bundle_id).await
    }
}

enum CaptureBehavior {
    Data(Vec<u8>),
    Hang,
    Error(String),
    Delayed(Vec<u8>, Duration),
}

pub struct StaticCapture(CaptureBehavior);

impl StaticCapture {
    pub fn data(data: &[u8]) -> Self {
        Self(CaptureBehavior::Data(data.to_vec()))
    }

    /// Capture producing a gzipped payload, as the database capture does
    pub fn gzipped(data: &[u8]) -> Self {
        Self(CaptureBehavior::Data(gzip(data).unwrap()))
    }

    pub fn hang() -> Self {
        Self(CaptureBehavior::Hang)
    }

    pub fn error(message: &str) -> Self {
        Self(CaptureBehavior::Error(message.to_string()))
    }

    pub fn delayed(data: &[u8], delay: Duration) -> Self {
        Self(CaptureBehavior::Delayed(data.to_vec(), delay))
    }
}

#[async_trait]
impl DomainCapture for StaticCapture {
    async fn capture(&self) -> Result<Vec<u8>> {
        match &self.0 {
            CaptureBehavior::Data(data) => Ok(data.clone()),
            CaptureBehavior::Hang => std::future::pending().await,
            CaptureBehavior::Error(message) => Err(OpsError::Command {
                command: "capture".to_string(),
                stderr: message.clone(),
            }),
            CaptureBehavior::Delayed(data, delay) => {
                tokio::time::sleep(*delay).await;
                Ok(data.clone())
            }
        }
    }
}

pub struct FakeDatabase {
    reachable: AtomicBool,
    lock: Mutex<Option<String>>,
    restored: Mutex<Vec<Vec<u8>>>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            lock: Mutex::new(None),
            restored: Mutex::new(Vec::new()),
        }
    }

    pub fn restored(&self) -> Vec<Vec<u8>> {
        self.restored.lock().unwrap().clone()
    }

    pub fn lock_held(&self) -> bool {
        self.lock.lock().unwrap().is_some()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl DatabaseAdapter for FakeDatabase {
    async fn dump(&self) -> Result<Vec<u8>> {
        Ok(b"-- dump".to_vec())
    }

    async fn restore(&self, dump: &[u8]) -> Result<()> {
        self.restored.lock().unwrap().push(dump.to_vec());
        Ok(())
    }

    async fn acquire_lock(&self, owner: &str) -> Result<()> {
        let mut lock = self.lock.lock().unwrap();
        match lock.as_ref() {
            Some(holder) => Err(OpsError::MigrationInFlight {
                holder: holder.clone(),
            }),
            None => {
                *lock = Some(owner.to_string());
                Ok(())
            }
        }
    }

    async fn release_lock(&self, owner: &str) -> Result<()> {
        let mut lock = self.lock.lock().unwrap();
        if lock.as_deref() == Some(owner) {
            *lock = None;
        }
        Ok(())
    }

    async fn reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}

/// Linear revision chain; `current` is an index into it, `None` meaning base
pub struct FakeMigrationTool {
    revisions: Vec<String>,
    current: Mutex<Option<usize>>,
    fail_at: Mutex<Option<String>>,
    hang: AtomicBool,
}

impl FakeMigrationTool {
    pub fn new(revisions: &[&str]) -> Self {
        Self {
            revisions: revisions.iter().map(|r| r.to_string()).collect(),
            current: Mutex::new(None),
            fail_at: Mutex::new(None),
            hang: AtomicBool::new(false),
        }
    }

    pub fn set_current(&self, revision: &str) {
        *self.current.lock().unwrap() = self.revisions.iter().position(|r| r == revision);
    }

    /// The step to `revision` is reported, then fails without landing
    pub fn fail_at(&self, revision: &str) {
        *self.fail_at.lock().unwrap() = Some(revision.to_string());
    }

    /// Upgrades never return, like a tool stuck inside the container
    pub fn hang(&self) {
        self.hang.store(true, Ordering::SeqCst);
    }

    pub fn current_revision(&self) -> String {
        self.name(*self.current.lock().unwrap())
    }

    fn name(&self, index: Option<usize>) -> String {
        index
            .map(|i| self.revisions[i].clone())
            .unwrap_or_else(|| BASE_REVISION.to_string())
    }
}

#[async_trait]
impl MigrationTool for FakeMigrationTool {
    async fn current(&self) -> Result<String> {
        Ok(self.current_revision())
    }

    async fn upgrade(&self, target: &str) -> Result<ToolRun> {
        if self.hang.load(Ordering::SeqCst) {
            std::future::pending::<()>().await;
        }
        let target_index = if target == HEAD_REVISION {
            self.revisions.len().checked_sub(1)
        } else {
            self.revisions.iter().position(|r| r == target)
        };
        let fail_at = self.fail_at.lock().unwrap().clone();
        let mut current = self.current.lock().unwrap();
        let mut run = ToolRun::default();

        let start = current.map(|i| i + 1).unwrap_or(0);
        let end = match target_index {
            Some(end) => end,
            None => return Ok(run),
        };
        for index in start..=end {
            let to = self.revisions[index].clone();
            run.applied.push(AppliedStep {
                from: self.name(*current),
                to: to.clone(),
                direction: Direction::Upgrade,
            });
            if fail_at.as_deref() == Some(to.as_str()) {
                run.failure = Some(format!("error applying {}", to));
                return Ok(run);
            }
            *current = Some(index);
        }
        Ok(run)
    }

    async fn downgrade(&self, steps: u32) -> Result<ToolRun> {
        let mut current = self.current.lock().unwrap();
        let mut run = ToolRun::default();
        for _ in 0..steps {
            let Some(index) = *current else { break };
            let previous = index.checked_sub(1);
            run.applied.push(AppliedStep {
                from: self.revisions[index].clone(),
                to: self.name(previous),
                direction: Direction::Downgrade,
            });
            *current = previous;
        }
        Ok(run)
    }
}

pub struct FakeSupervisor {
    running: Mutex<BTreeSet<String>>,
    stop_calls: AtomicUsize,
}

impl FakeSupervisor {
    pub fn running(services: &[&str]) -> Self {
        Self {
            running: Mutex::new(services.iter().map(|s| s.to_string()).collect()),
            stop_calls: AtomicUsize::new(0),
        }
    }

    pub fn is_running(&self, service: &str) -> bool {
        self.running.lock().unwrap().contains(service)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ServiceSupervisor for FakeSupervisor {
    async fn stop(&self, services: &[String]) -> Result<()> {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        let mut running = self.running.lock().unwrap();
        for service in services {
            running.remove(service);
        }
        Ok(())
    }

    async fn start(&self, services: &[String]) -> Result<()> {
        let mut running = self.running.lock().unwrap();
        running.extend(services.iter().cloned());
        Ok(())
    }

    async fn status(&self, service: &str) -> Result<ServiceStatus> {
        let running = self.is_running(service);
        Ok(ServiceStatus {
            running,
            health: None,
            healthy: running,
        })
    }

    async fn logs(&self, service: &str, _tail: usize) -> Result<String> {
        Ok(format!("{} started\n", service))
    }
}

enum ProbeScript {
    Sequence(Vec<bool>, usize),
    Hang,
}

/// Probe answering from per-service scripts; the last scripted answer repeats
#[derive(Default)]
pub struct ScriptedProbe {
    scripts: Mutex<HashMap<String, ProbeScript>>,
}

impl ScriptedProbe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, service: &str, answers: &[bool]) {
        self.scripts
            .lock()
            .unwrap()
            .insert(service.to_string(), ProbeScript::Sequence(answers.to_vec(), 0));
    }

    pub fn always(&self, service: &str, healthy: bool) {
        self.script(service, &[healthy]);
    }

    pub fn hang(&self, service: &str) {
        self.scripts
            .lock()
            .unwrap()
            .insert(service.to_string(), ProbeScript::Hang);
    }

    fn next(&self, service: &str) -> Option<bool> {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(service) {
            Some(ProbeScript::Sequence(answers, position)) => {
                let answer = answers
                    .get(*position)
                    .or_else(|| answers.last())
                    .copied()
                    .unwrap_or(false);
                *position += 1;
                Some(answer)
            }
            Some(ProbeScript::Hang) => None,
            None => Some(false),
        }
    }
}

#[async_trait]
impl HealthProbe for ScriptedProbe {
    async fn probe(&self, service: &str) -> ProbeResult {
        match self.next(service) {
            Some(true) => ProbeResult::ok("ok"),
            Some(false) => ProbeResult::failed("failed"),
            None => std::future::pending().await,
        }
    }
}

/// Store a complete bundle holding `components` verbatim
pub async fn store_bundle(sink: &MemorySink, components: &[(ComponentKind, Vec<u8>)]) -> BundleId {
    let id = BundleId::from_timestamp(Utc::now());
    let mut bundle = ArtifactBundle::new(id.clone(), Utc::now());
    for (kind, data) in components {
        sink.put(&id, kind.artifact_name(), data).await.unwrap();
        bundle.record(ComponentRecord::captured(*kind, &id, data));
    }
    bundle.finalize();
    sink.put(&id, MANIFEST_NAME, &bundle.to_manifest().unwrap())
        .await
        .unwrap();
    id
}
