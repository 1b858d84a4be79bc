/// Schema migrations
///
/// [`MigrationRunner`] puts guard rails around a delegate [`MigrationTool`]: the
/// database must be reachable, only one runner may migrate at a time (the lock is
/// released on every exit path), and the journal records exactly the steps the
/// tool actually applied.
///
/// The journal's last entry always names the current revision. When the schema was
/// moved outside this runner, a `baseline` entry records the observed revision
/// before anything else is appended.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::database::DatabaseAdapter;
use super::deadline::Deadline;
use super::docker::DockerManager;
use super::error::{OpsError, Result};
use crate::utils::{generate_hex_string, BASE_REVISION, MIGRATION_LOCK_TABLE};

/// Step name carried by errors raised while the migration tool runs
const MIGRATING_STEP: &str = "Migrating";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Upgrade,
    Downgrade,
    /// Revision observed rather than applied by this runner
    Baseline,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Upgrade => write!(f, "upgrade"),
            Direction::Downgrade => write!(f, "downgrade"),
            Direction::Baseline => write!(f, "baseline"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Revision the schema is at after this entry
    pub revision: String,
    pub applied_at: DateTime<Utc>,
    pub direction: Direction,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationState {
    pub current_revision: String,
    pub history: Vec<HistoryEntry>,
}

/// One revision step reported by the migration tool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedStep {
    pub from: String,
    pub to: String,
    pub direction: Direction,
}

/// What the migration tool did in one invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolRun {
    /// Steps the tool reported starting, in order
    pub applied: Vec<AppliedStep>,
    /// Set when the tool exited unsuccessfully
    pub failure: Option<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MigrationTool: Send + Sync {
    /// Current revision, `base` when nothing is applied
    async fn current(&self) -> Result<String>;

    async fn upgrade(&self, target: &str) -> Result<ToolRun>;

    async fn downgrade(&self, steps: u32) -> Result<ToolRun>;
}

/// Alembic run inside the application container
pub struct AlembicTool {
    docker: Arc<DockerManager>,
    service: String,
    config: Option<String>,
}

impl AlembicTool {
    pub fn new(docker: Arc<DockerManager>, service: impl Into<String>, config: Option<String>) -> Self {
        Self {
            docker,
            service: service.into(),
            config,
        }
    }

    async fn alembic(&self, args: &[&str]) -> Result<(bool, String)> {
        let mut command = vec!["alembic"];
        if let Some(config) = &self.config {
            command.push("-c");
            command.push(config);
        }
        command.extend_from_slice(args);

        let output = self.docker.exec_raw(&self.service, &command, &[]).await?;
        // Alembic logs progress on stderr
        let mut text = String::from_utf8_lossy(&output.stdout).to_string();
        text.push_str(&String::from_utf8_lossy(&output.stderr));
        Ok((output.status.success(), text))
    }

    async fn run(&self, args: &[&str]) -> Result<ToolRun> {
        let (success, output) = self.alembic(args).await?;
        let applied = parse_alembic_steps(&output)?;
        let failure = if success {
            None
        } else {
            Some(last_error_line(&output))
        };
        Ok(ToolRun { applied, failure })
    }
}

#[async_trait]
impl MigrationTool for AlembicTool {
    async fn current(&self) -> Result<String> {
        let (success, output) = self.alembic(&["current"]).await?;
        if !success {
            return Err(OpsError::Command {
                command: "alembic current".to_string(),
                stderr: last_error_line(&output),
            });
        }
        Ok(parse_alembic_current(&output))
    }

    async fn upgrade(&self, target: &str) -> Result<ToolRun> {
        self.run(&["upgrade", target]).await
    }

    async fn downgrade(&self, steps: u32) -> Result<ToolRun> {
        let relative = format!("-{}", steps);
        self.run(&["downgrade", &relative]).await
    }
}

/// "Running upgrade a1 -> b2, add users" lines; an empty side means `base`
fn parse_alembic_steps(output: &str) -> Result<Vec<AppliedStep>> {
    let re = Regex::new(r"Running (upgrade|downgrade) ([^\s,]*)\s*->\s*([^\s,]*)")
        .map_err(|e| OpsError::PreconditionFailed(e.to_string()))?;

    let revision = |s: &str| {
        if s.is_empty() {
            BASE_REVISION.to_string()
        } else {
            s.to_string()
        }
    };

    Ok(re
        .captures_iter(output)
        .map(|caps| AppliedStep {
            from: revision(&caps[2]),
            to: revision(&caps[3]),
            direction: if &caps[1] == "upgrade" {
                Direction::Upgrade
            } else {
                Direction::Downgrade
            },
        })
        .collect())
}

/// `alembic current` prints "<rev> (head)" or nothing at base
fn parse_alembic_current(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with("INFO"))
        .filter_map(|line| line.split_whitespace().next())
        .last()
        .map(str::to_string)
        .unwrap_or_else(|| BASE_REVISION.to_string())
}

fn last_error_line(output: &str) -> String {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .last()
        .unwrap_or("migration tool failed")
        .to_string()
}

/// Append-only record of revisions applied through this runner
pub struct MigrationJournal {
    path: Option<PathBuf>,
    entries: Mutex<Vec<HistoryEntry>>,
}

impl MigrationJournal {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Journal persisted as JSON at `path`; a missing file is an empty journal
    pub fn open(path: &Path) -> Result<Self> {
        let entries = match std::fs::read(path) {
            Ok(data) => serde_json::from_slice(&data)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self {
            path: Some(path.to_path_buf()),
            entries: Mutex::new(entries),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<HistoryEntry>> {
        // A poisoned journal still holds valid entries
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn entries(&self) -> Vec<HistoryEntry> {
        self.lock().clone()
    }

    pub fn last_revision(&self) -> Option<String> {
        self.lock().last().map(|e| e.revision.clone())
    }

    pub fn append(&self, new_entries: Vec<HistoryEntry>) -> Result<()> {
        if new_entries.is_empty() {
            return Ok(());
        }
        let mut entries = self.lock();
        let mut updated = entries.clone();
        updated.extend(new_entries);

        if let Some(path) = &self.path {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let tmp = path.with_extension("json.partial");
            std::fs::write(&tmp, serde_json::to_vec_pretty(&updated)?)?;
            std::fs::rename(&tmp, path)?;
        }
        *entries = updated;
        Ok(())
    }
}

pub struct MigrationRunner {
    db: Arc<dyn DatabaseAdapter>,
    tool: Arc<dyn MigrationTool>,
    journal: MigrationJournal,
    timeout: Duration,
}

impl MigrationRunner {
    pub fn new(
        db: Arc<dyn DatabaseAdapter>,
        tool: Arc<dyn MigrationTool>,
        journal: MigrationJournal,
        timeout: Duration,
    ) -> Self {
        Self {
            db,
            tool,
            journal,
            timeout,
        }
    }

    /// Current revision and the recorded history. Read-only: a revision changed
    /// outside the runner shows up as an unpersisted baseline entry.
    pub async fn current(&self) -> Result<MigrationState> {
        let current = self.tool.current().await?;
        let mut history = self.journal.entries();
        let last = history.last().map(|e| e.revision.as_str()).unwrap_or(BASE_REVISION);
        if last != current {
            history.push(HistoryEntry {
                revision: current.clone(),
                applied_at: Utc::now(),
                direction: Direction::Baseline,
            });
        }
        Ok(MigrationState {
            current_revision: current,
            history,
        })
    }

    pub fn history(&self) -> Vec<HistoryEntry> {
        self.journal.entries()
    }

    pub async fn upgrade(&self, target: &str, deadline: &Deadline) -> Result<MigrationState> {
        let owned = target.to_string();
        self.guarded(target, deadline, |tool| async move { tool.upgrade(&owned).await })
            .await
    }

    pub async fn downgrade(&self, steps: u32, deadline: &Deadline) -> Result<MigrationState> {
        if steps == 0 {
            return Err(OpsError::PreconditionFailed(
                "downgrade needs at least one step".to_string(),
            ));
        }
        self.guarded(&format!("-{}", steps), deadline, |tool| async move {
            tool.downgrade(steps).await
        })
        .await
    }

    /// Pre-flight, lock, run, release
    async fn guarded<F, Fut>(&self, target: &str, deadline: &Deadline, op: F) -> Result<MigrationState>
    where
        F: FnOnce(Arc<dyn MigrationTool>) -> Fut,
        Fut: std::future::Future<Output = Result<ToolRun>>,
    {
        if !self.db.reachable().await {
            return Err(OpsError::ServiceUnavailable(
                "database is not reachable, refusing to migrate".to_string(),
            ));
        }

        let owner = lock_owner();
        self.db.acquire_lock(&owner).await?;
        tracing::info!(owner = %owner, requested = target, "migration lock acquired");

        let result = self.migrate_locked(target, deadline, op).await;

        // The tool may still be running inside the container after a timeout
        if let Err(e) = &result {
            if e.step() == Some(MIGRATING_STEP) && matches!(e.root(), OpsError::Timeout { .. }) {
                tracing::error!(
                    owner = %owner,
                    table = MIGRATION_LOCK_TABLE,
                    "migration timed out, lock left held; delete the lock row once the tool has exited"
                );
                return result;
            }
        }

        match (result, self.db.release_lock(&owner).await) {
            (Ok(state), Ok(())) => Ok(state),
            (Ok(_), Err(e)) => {
                tracing::error!(owner = %owner, error = %e, "migration applied but lock release failed");
                Err(e)
            }
            (Err(e), release) => {
                if let Err(release_err) = release {
                    tracing::error!(owner = %owner, error = %release_err, "failed to release migration lock");
                }
                Err(e)
            }
        }
    }

    async fn migrate_locked<F, Fut>(&self, target: &str, deadline: &Deadline, op: F) -> Result<MigrationState>
    where
        F: FnOnce(Arc<dyn MigrationTool>) -> Fut,
        Fut: std::future::Future<Output = Result<ToolRun>>,
    {
        let before = self.tool.current().await?;
        self.reconcile(&before)?;

        // Expired before the tool started: nothing is running, the lock can go
        if deadline.is_expired() {
            return Err(OpsError::Timeout {
                step: "migrate".to_string(),
                after: Duration::ZERO,
            });
        }

        let run = match deadline.run("migrate", self.timeout, op(self.tool.clone())).await {
            Ok(run) => run,
            Err(e) => {
                // Tool outcome unknown: record whatever revision the schema is at now
                if let Ok(observed) = self.tool.current().await {
                    self.reconcile(&observed)?;
                }
                let manual = matches!(e, OpsError::Timeout { .. });
                return Err(e.at_step(MIGRATING_STEP, target, manual));
            }
        };

        match run.failure {
            None => {
                self.record(&run.applied)?;
                let state = self.current().await?;
                tracing::info!(
                    from = %before,
                    to = %state.current_revision,
                    steps = run.applied.len(),
                    requested = target,
                    "migration finished"
                );
                Ok(state)
            }
            Some(reason) => {
                let after = self.tool.current().await.ok();
                let applied = confirmed_steps(&run.applied, &before, after.as_deref());
                self.record(&applied)?;
                if let Some(observed) = &after {
                    self.reconcile(observed)?;
                }

                let revision = after
                    .or_else(|| applied.last().map(|s| s.to.clone()))
                    .unwrap_or(before);
                tracing::error!(revision = %revision, applied = applied.len(), reason = %reason, "migration failed");
                Err(OpsError::MigrationFailed {
                    revision,
                    applied: applied.len(),
                    reason,
                })
            }
        }
    }

    fn reconcile(&self, observed: &str) -> Result<()> {
        let last = self
            .journal
            .last_revision()
            .unwrap_or_else(|| BASE_REVISION.to_string());
        if last != observed {
            tracing::warn!(journal = %last, observed, "schema moved outside the runner, recording baseline");
            self.journal.append(vec![HistoryEntry {
                revision: observed.to_string(),
                applied_at: Utc::now(),
                direction: Direction::Baseline,
            }])?;
        }
        Ok(())
    }

    fn record(&self, steps: &[AppliedStep]) -> Result<()> {
        let now = Utc::now();
        self.journal.append(
            steps
                .iter()
                .map(|step| HistoryEntry {
                    revision: step.to.clone(),
                    applied_at: now,
                    direction: step.direction,
                })
                .collect(),
        )
    }
}

/// Steps that really landed after a failed run. The tool reports a step before
/// running it, so the last reported step is the one that failed unless the
/// observed revision says otherwise.
fn confirmed_steps(reported: &[AppliedStep], before: &str, after: Option<&str>) -> Vec<AppliedStep> {
    match after {
        Some(after) if after == before => Vec::new(),
        Some(after) => match reported.iter().position(|s| s.to == after) {
            Some(idx) => reported[..=idx].to_vec(),
            None => reported[..reported.len().saturating_sub(1)].to_vec(),
        },
        None => reported[..reported.len().saturating_sub(1)].to_vec(),
    }
}

fn lock_owner() -> String {
    let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "stackguard".to_string());
    format!("{}:{}:{}", host, std::process::id(), generate_hex_string(8))
}
