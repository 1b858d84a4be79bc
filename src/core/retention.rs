/// Retention: which bundles may be deleted.
///
/// Planning is a pure function of the bundle list, the window and `now`; pruning
/// applies a plan against a sink one bundle at a time.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use super::bundle::{BundleId, BundleStatus, BundleSummary};
use super::error::{OpsError, Result};
use super::storage::StorageSink;

/// Bundles older than `now - window_days` become eligible for deletion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionRule {
    window_days: u32,
}

impl RetentionRule {
    pub fn new(window_days: u32) -> Result<Self> {
        if window_days == 0 {
            return Err(OpsError::PreconditionFailed(
                "retention window must be at least one day".to_string(),
            ));
        }
        Ok(Self { window_days })
    }

    pub fn cutoff(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now - ChronoDuration::days(i64::from(self.window_days))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrunePlan {
    /// Eligible bundles, sorted by id
    pub delete: Vec<BundleId>,
    /// The bundle kept regardless of age
    pub floor: Option<BundleId>,
    pub retained: Vec<BundleId>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PruneReport {
    pub deleted: Vec<BundleId>,
    pub failed: Vec<(BundleId, String)>,
    pub floor: Option<BundleId>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetentionPolicy {
    rule: RetentionRule,
}

impl RetentionPolicy {
    pub fn new(rule: RetentionRule) -> Self {
        Self { rule }
    }

    /// The newest complete bundle; when there is none, the newest partial one
    /// (partial bundles always hold a good database dump).
    fn floor(bundles: &[BundleSummary]) -> Option<&BundleSummary> {
        let newest = |status: BundleStatus| {
            bundles
                .iter()
                .filter(|b| b.status == status)
                .max_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)))
        };
        newest(BundleStatus::Complete).or_else(|| newest(BundleStatus::Partial))
    }

    /// Input order does not matter; the same bundles and `now` give the same plan
    pub fn plan(&self, bundles: &[BundleSummary], now: DateTime<Utc>) -> PrunePlan {
        let cutoff = self.rule.cutoff(now);
        let floor = Self::floor(bundles).map(|b| b.id.clone());

        let (mut delete, mut retained): (Vec<BundleId>, Vec<BundleId>) = (Vec::new(), Vec::new());
        for bundle in bundles {
            if bundle.created_at < cutoff && floor.as_ref() != Some(&bundle.id) {
                delete.push(bundle.id.clone());
            } else {
                retained.push(bundle.id.clone());
            }
        }
        delete.sort();
        delete.dedup();
        retained.sort();
        retained.dedup();

        PrunePlan {
            delete,
            floor,
            retained,
        }
    }

    /// Delete every eligible bundle. A failed delete is logged and recorded, and
    /// pruning continues with the next bundle.
    pub async fn prune(
        &self,
        bundles: &[BundleSummary],
        sink: &dyn StorageSink,
        now: DateTime<Utc>,
    ) -> PruneReport {
        let plan = self.plan(bundles, now);
        let mut report = PruneReport {
            floor: plan.floor.clone(),
            ..Default::default()
        };

        for id in plan.delete {
            match sink.delete(&id).await {
                Ok(()) => {
                    tracing::info!(bundle = %id, "pruned expired bundle");
                    report.deleted.push(id);
                }
                Err(e) => {
                    tracing::warn!(bundle = %id, error = %e, "failed to prune bundle");
                    report.failed.push((id, e.to_string()));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::testing::MemorySink;
    use chrono::TimeZone;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap()
    }

    fn summary(days_old: i64, status: BundleStatus) -> BundleSummary {
        let created_at = now() - ChronoDuration::days(days_old);
        BundleSummary {
            id: BundleId::from_timestamp(created_at),
            created_at,
            status,
            total_bytes: 10,
            component_count: 1,
        }
    }

    fn policy(days: u32) -> RetentionPolicy {
        RetentionPolicy::new(RetentionRule::new(days).unwrap())
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(RetentionRule::new(0).is_err());
    }

    #[test]
    fn test_expired_bundles_are_deleted() {
        let bundles = vec![
            summary(40, BundleStatus::Complete),
            summary(35, BundleStatus::Partial),
            summary(3, BundleStatus::Complete),
        ];
        let plan = policy(30).plan(&bundles, now());
        assert_eq!(plan.delete, vec![bundles[0].id.clone(), bundles[1].id.clone()]);
        assert_eq!(plan.floor, Some(bundles[2].id.clone()));
    }

    #[test]
    fn test_most_recent_complete_bundle_survives_any_age() {
        let mut bundles = vec![
            summary(90, BundleStatus::Complete),
            summary(60, BundleStatus::Complete),
            summary(45, BundleStatus::Failed),
            summary(31, BundleStatus::Partial),
        ];
        let keep = bundles[1].id.clone();

        for _ in 0..bundles.len() {
            bundles.rotate_left(1);
            let plan = policy(30).plan(&bundles, now());
            assert!(!plan.delete.contains(&keep));
            assert_eq!(plan.floor.as_ref(), Some(&keep));
            assert_eq!(plan.delete.len(), 3);
        }
    }

    #[test]
    fn test_partial_bundle_is_floor_without_complete_ones() {
        let bundles = vec![
            summary(50, BundleStatus::Partial),
            summary(40, BundleStatus::Partial),
        ];
        let plan = policy(7).plan(&bundles, now());
        assert_eq!(plan.floor, Some(bundles[1].id.clone()));
        assert_eq!(plan.delete, vec![bundles[0].id.clone()]);
    }

    #[test]
    fn test_plan_is_deterministic() {
        let bundles = vec![
            summary(10, BundleStatus::Complete),
            summary(20, BundleStatus::Complete),
            summary(30, BundleStatus::Partial),
        ];
        let mut reversed = bundles.clone();
        reversed.reverse();
        assert_eq!(policy(5).plan(&bundles, now()), policy(5).plan(&reversed, now()));
    }

    #[tokio::test]
    async fn test_prune_continues_past_failed_deletes() {
        let sink = MemorySink::new();
        let old_a = summary(40, BundleStatus::Complete);
        let old_b = summary(39, BundleStatus::Complete);
        let fresh = summary(1, BundleStatus::Complete);
        for s in [&old_a, &old_b, &fresh] {
            sink.insert_bundle(s.id.clone(), s.created_at, s.status);
        }
        sink.fail_deletes_for(old_a.id.clone());

        let report = policy(30)
            .prune(&[old_a.clone(), old_b.clone(), fresh.clone()], &sink, now())
            .await;
        assert_eq!(report.deleted, vec![old_b.id.clone()]);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].0, old_a.id);
        assert_eq!(report.floor, Some(fresh.id));
    }
}
