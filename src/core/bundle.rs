/// Backup bundles: the manifest model and its component records.
///
/// A bundle is created `InProgress` by the backup orchestrator, filled with one
/// record per captured domain in capture order, and finalized exactly once. The
/// serialized bundle is the manifest stored next to the component artifacts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;

use super::error::{OpsError, Result};
use crate::utils::{MANIFEST_NAME, MANIFEST_VERSION};

/// Timestamp-derived bundle identifier; lexicographic order is creation order
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BundleId(String);

impl BundleId {
    pub fn from_timestamp(ts: DateTime<Utc>) -> Self {
        Self(ts.format("%Y%m%dT%H%M%S%3fZ").to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BundleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for BundleId {
    type Err = OpsError;

    /// IDs double as directory names and object-key segments, so only a safe
    /// character set is accepted
    fn from_str(s: &str) -> Result<Self> {
        let valid = !s.is_empty()
            && !s.starts_with('.')
            && s
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if valid {
            Ok(Self(s.to_string()))
        } else {
            Err(OpsError::PreconditionFailed(format!(
                "invalid bundle id '{}'",
                s
            )))
        }
    }
}

/// Data domain captured into a bundle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    Database,
    Files,
    Config,
    Logs,
}

impl ComponentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Database => "database",
            ComponentKind::Files => "files",
            ComponentKind::Config => "config",
            ComponentKind::Logs => "logs",
        }
    }

    /// Object name of the component artifact inside its bundle
    pub fn artifact_name(&self) -> &'static str {
        match self {
            ComponentKind::Database => "database.sql.gz",
            ComponentKind::Files => "files.tar.gz",
            ComponentKind::Config => "config.tar.gz",
            ComponentKind::Logs => "logs.txt.gz",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ComponentKind {
    type Err = OpsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "database" | "db" => Ok(ComponentKind::Database),
            "files" => Ok(ComponentKind::Files),
            "config" => Ok(ComponentKind::Config),
            "logs" => Ok(ComponentKind::Logs),
            other => Err(OpsError::PreconditionFailed(format!(
                "unknown backup domain '{}' (expected database, files, config or logs)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStatus {
    Complete,
    Failed,
}

/// One captured (or failed) domain of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub name: String,
    pub kind: ComponentKind,
    pub size_bytes: u64,
    pub checksum: String,
    pub path: String,
    pub status: ComponentStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ComponentRecord {
    pub fn captured(kind: ComponentKind, bundle_id: &BundleId, data: &[u8]) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind,
            size_bytes: data.len() as u64,
            checksum: checksum(data),
            path: format!("{}/{}", bundle_id, kind.artifact_name()),
            status: ComponentStatus::Complete,
            error: None,
        }
    }

    pub fn failed(kind: ComponentKind, bundle_id: &BundleId, reason: impl Into<String>) -> Self {
        Self {
            name: kind.as_str().to_string(),
            kind,
            size_bytes: 0,
            checksum: String::new(),
            path: format!("{}/{}", bundle_id, kind.artifact_name()),
            status: ComponentStatus::Failed,
            error: Some(reason.into()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.status == ComponentStatus::Complete && !self.checksum.is_empty()
    }

    /// Compare stored bytes against the recorded size and checksum
    pub fn verify(&self, data: &[u8]) -> std::result::Result<(), String> {
        if data.len() as u64 != self.size_bytes {
            return Err(format!(
                "{}: size {} does not match manifest size {}",
                self.name,
                data.len(),
                self.size_bytes
            ));
        }
        let actual = checksum(data);
        if actual != self.checksum {
            return Err(format!(
                "{}: checksum {} does not match manifest checksum {}",
                self.name, actual, self.checksum
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BundleStatus {
    InProgress,
    Complete,
    Failed,
    Partial,
}

impl fmt::Display for BundleStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BundleStatus::InProgress => write!(f, "in_progress"),
            BundleStatus::Complete => write!(f, "complete"),
            BundleStatus::Failed => write!(f, "failed"),
            BundleStatus::Partial => write!(f, "partial"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactBundle {
    version: u32,
    id: BundleId,
    created_at: DateTime<Utc>,
    status: BundleStatus,
    components: Vec<ComponentRecord>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    warnings: Vec<String>,
}

impl ArtifactBundle {
    pub fn new(id: BundleId, created_at: DateTime<Utc>) -> Self {
        Self {
            version: MANIFEST_VERSION,
            id,
            created_at,
            status: BundleStatus::InProgress,
            components: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn id(&self) -> &BundleId {
        &self.id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn status(&self) -> BundleStatus {
        self.status
    }

    pub fn components(&self) -> &[ComponentRecord] {
        &self.components
    }

    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    pub fn component(&self, kind: ComponentKind) -> Option<&ComponentRecord> {
        self.components.iter().find(|c| c.kind == kind)
    }

    pub fn total_bytes(&self) -> u64 {
        self.components.iter().map(|c| c.size_bytes).sum()
    }

    pub(crate) fn record(&mut self, component: ComponentRecord) {
        debug_assert_eq!(self.status, BundleStatus::InProgress);
        if let Some(error) = &component.error {
            self.warnings
                .push(format!("{} component failed: {}", component.name, error));
        }
        self.components.push(component);
    }

    /// Decide the terminal status. The database is the non-negotiable component:
    /// without it the bundle is `Failed`; otherwise any failed sibling makes it
    /// `Partial`.
    pub(crate) fn finalize(&mut self) -> BundleStatus {
        let database_ok = self
            .component(ComponentKind::Database)
            .map(|c| c.is_complete())
            .unwrap_or(false);

        self.status = if self.components.is_empty() || !database_ok {
            BundleStatus::Failed
        } else if self.components.iter().all(|c| c.is_complete()) {
            BundleStatus::Complete
        } else {
            BundleStatus::Partial
        };
        self.status
    }

    /// Downgrade after finalization, used when the manifest itself cannot be stored
    pub(crate) fn mark_failed(&mut self, reason: impl Into<String>) {
        self.warnings.push(reason.into());
        self.status = BundleStatus::Failed;
    }

    pub fn to_manifest(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_manifest(bundle_id: &BundleId, data: &[u8]) -> Result<Self> {
        let bundle: ArtifactBundle =
            serde_json::from_slice(data).map_err(|e| OpsError::BundleCorrupt {
                bundle_id: bundle_id.to_string(),
                reason: format!("unreadable {}: {}", MANIFEST_NAME, e),
            })?;

        if &bundle.id != bundle_id {
            return Err(OpsError::BundleCorrupt {
                bundle_id: bundle_id.to_string(),
                reason: format!("manifest belongs to bundle {}", bundle.id),
            });
        }
        Ok(bundle)
    }

    pub fn summary(&self) -> BundleSummary {
        BundleSummary {
            id: self.id.clone(),
            created_at: self.created_at,
            status: self.status,
            total_bytes: self.total_bytes(),
            component_count: self.components.len(),
        }
    }
}

/// Listing entry for a persisted bundle
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleSummary {
    pub id: BundleId,
    pub created_at: DateTime<Utc>,
    pub status: BundleStatus,
    pub total_bytes: u64,
    pub component_count: usize,
}

/// Hex-encoded SHA-256 of `data`
pub fn checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bundle_id() -> BundleId {
        BundleId::from_timestamp(Utc.with_ymd_and_hms(2026, 3, 1, 2, 30, 0).unwrap())
    }

    #[test]
    fn test_bundle_ids_sort_by_creation_time() {
        let earlier = BundleId::from_timestamp(Utc.with_ymd_and_hms(2026, 1, 9, 23, 0, 0).unwrap());
        let later = BundleId::from_timestamp(Utc.with_ymd_and_hms(2026, 1, 10, 1, 0, 0).unwrap());
        assert_eq!(earlier.as_str(), "20260109T230000000Z");
        assert!(earlier < later);
    }

    #[test]
    fn test_bundle_id_rejects_path_segments() {
        assert!("20260101T000000000Z".parse::<BundleId>().is_ok());
        assert!("../etc".parse::<BundleId>().is_err());
        assert!("a/b".parse::<BundleId>().is_err());
        assert!("".parse::<BundleId>().is_err());
    }

    #[test]
    fn test_all_components_captured_is_complete() {
        let id = bundle_id();
        let mut bundle = ArtifactBundle::new(id.clone(), Utc::now());
        bundle.record(ComponentRecord::captured(ComponentKind::Database, &id, b"dump"));
        bundle.record(ComponentRecord::captured(ComponentKind::Files, &id, b"tar"));

        assert_eq!(bundle.finalize(), BundleStatus::Complete);
        assert!(bundle.components().iter().all(|c| !c.checksum.is_empty()));
        assert_eq!(bundle.total_bytes(), 7);
    }

    #[test]
    fn test_failed_sibling_makes_bundle_partial() {
        let id = bundle_id();
        let mut bundle = ArtifactBundle::new(id.clone(), Utc::now());
        bundle.record(ComponentRecord::captured(ComponentKind::Database, &id, b"dump"));
        bundle.record(ComponentRecord::failed(ComponentKind::Logs, &id, "docker unavailable"));

        assert_eq!(bundle.finalize(), BundleStatus::Partial);
        assert_eq!(bundle.warnings().len(), 1);
    }

    #[test]
    fn test_missing_database_fails_bundle() {
        let id = bundle_id();
        let mut bundle = ArtifactBundle::new(id.clone(), Utc::now());
        bundle.record(ComponentRecord::failed(ComponentKind::Database, &id, "pg_dump exited 1"));
        bundle.record(ComponentRecord::captured(ComponentKind::Files, &id, b"tar"));
        assert_eq!(bundle.finalize(), BundleStatus::Failed);

        let mut empty = ArtifactBundle::new(id, Utc::now());
        assert_eq!(empty.finalize(), BundleStatus::Failed);
    }

    #[test]
    fn test_manifest_preserves_capture_order() {
        let id = bundle_id();
        let mut bundle = ArtifactBundle::new(id.clone(), Utc::now());
        bundle.record(ComponentRecord::captured(ComponentKind::Database, &id, b"dump"));
        bundle.record(ComponentRecord::captured(ComponentKind::Config, &id, b"env"));
        bundle.finalize();

        let parsed = ArtifactBundle::from_manifest(&id, &bundle.to_manifest().unwrap()).unwrap();
        let kinds: Vec<_> = parsed.components().iter().map(|c| c.kind).collect();
        assert_eq!(kinds, vec![ComponentKind::Database, ComponentKind::Config]);
        assert_eq!(parsed.status(), BundleStatus::Complete);
    }

    #[test]
    fn test_manifest_for_other_bundle_is_corrupt() {
        let id = bundle_id();
        let mut bundle = ArtifactBundle::new(id, Utc::now());
        bundle.finalize();
        let manifest = bundle.to_manifest().unwrap();

        let other: BundleId = "20990101T000000000Z".parse().unwrap();
        let err = ArtifactBundle::from_manifest(&other, &manifest).unwrap_err();
        assert!(matches!(err, OpsError::BundleCorrupt { .. }));
        assert!(matches!(
            ArtifactBundle::from_manifest(&other, b"{not json"),
            Err(OpsError::BundleCorrupt { .. })
        ));
    }

    #[test]
    fn test_verify_detects_tampering() {
        let id = bundle_id();
        let record = ComponentRecord::captured(ComponentKind::Database, &id, b"select 1;");
        assert!(record.verify(b"select 1;").is_ok());
        assert!(record.verify(b"select 2;").is_err());
        assert!(record.verify(b"select").is_err());
    }

    #[test]
    fn test_domain_parsing() {
        assert_eq!("db".parse::<ComponentKind>().unwrap(), ComponentKind::Database);
        assert_eq!("Logs".parse::<ComponentKind>().unwrap(), ComponentKind::Logs);
        assert!("volumes".parse::<ComponentKind>().is_err());
    }
}
