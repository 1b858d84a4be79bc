/// Health verification for the services of the stack
///
/// Every service is polled independently and concurrently. A service is healthy
/// only after its probe succeeds twice in a row, which filters out probes that
/// flap while a container is still starting.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use super::docker::ServiceSupervisor;
use super::error::{OpsError, Result};
use crate::utils::{Backoff, REQUIRED_CONSECUTIVE_PROBES};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub ok: bool,
    pub detail: String,
}

impl ProbeResult {
    pub fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            detail: detail.into(),
        }
    }

    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            detail: detail.into(),
        }
    }
}

/// A single liveness check against one service
#[async_trait]
pub trait HealthProbe: Send + Sync {
    async fn probe(&self, service: &str) -> ProbeResult;
}

/// GET against a configured endpoint, any 2xx is a success
pub struct HttpProbe {
    client: reqwest::Client,
    endpoints: BTreeMap<String, String>,
}

impl HttpProbe {
    pub fn new(endpoints: BTreeMap<String, String>, request_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| OpsError::PreconditionFailed(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self { client, endpoints })
    }

    pub fn has_endpoint(&self, service: &str) -> bool {
        self.endpoints.contains_key(service)
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    async fn probe(&self, service: &str) -> ProbeResult {
        let Some(url) = self.endpoints.get(service) else {
            return ProbeResult::failed("no health endpoint configured");
        };
        match self.client.get(url).send().await {
            Ok(resp) if resp.status().is_success() => {
                ProbeResult::ok(format!("HTTP {}", resp.status().as_u16()))
            }
            Ok(resp) => ProbeResult::failed(format!("HTTP {}", resp.status().as_u16())),
            Err(e) if e.is_timeout() => ProbeResult::failed("request timed out"),
            Err(e) if e.is_connect() => ProbeResult::failed("connection refused"),
            Err(e) => ProbeResult::failed(e.to_string()),
        }
    }
}

/// Container running and, when it defines a healthcheck, reported healthy
pub struct SupervisorProbe {
    supervisor: Arc<dyn ServiceSupervisor>,
}

impl SupervisorProbe {
    pub fn new(supervisor: Arc<dyn ServiceSupervisor>) -> Self {
        Self { supervisor }
    }
}

#[async_trait]
impl HealthProbe for SupervisorProbe {
    async fn probe(&self, service: &str) -> ProbeResult {
        match self.supervisor.status(service).await {
            Ok(status) if status.healthy => match status.health {
                Some(health) => ProbeResult::ok(format!("running ({})", health)),
                None => ProbeResult::ok("running"),
            },
            Ok(status) if status.running => ProbeResult::failed(format!(
                "running ({})",
                status.health.as_deref().unwrap_or("not ready")
            )),
            Ok(_) => ProbeResult::failed("not running"),
            Err(e) => ProbeResult::failed(format!("status unavailable: {}", e)),
        }
    }
}

/// HTTP probe for services with an endpoint, supervisor probe for the rest
pub struct ConfiguredProbe {
    http: HttpProbe,
    supervisor: SupervisorProbe,
}

impl ConfiguredProbe {
    pub fn new(http: HttpProbe, supervisor: SupervisorProbe) -> Self {
        Self { http, supervisor }
    }
}

#[async_trait]
impl HealthProbe for ConfiguredProbe {
    async fn probe(&self, service: &str) -> ProbeResult {
        if self.http.has_endpoint(service) {
            self.http.probe(service).await
        } else {
            self.supervisor.probe(service).await
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthReport {
    pub service_name: String,
    pub checked_at: DateTime<Utc>,
    pub healthy: bool,
    pub detail: String,
    pub attempts: u32,
}

impl HealthReport {
    /// Compare everything except the timestamp
    pub fn same_outcome(&self, other: &HealthReport) -> bool {
        self.service_name == other.service_name
            && self.healthy == other.healthy
            && self.detail == other.detail
            && self.attempts == other.attempts
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Unhealthy,
}

impl OverallHealth {
    /// No failures is healthy, one is degraded, two or more is unhealthy
    pub fn from_reports(reports: &BTreeMap<String, HealthReport>) -> Self {
        match reports.values().filter(|r| !r.healthy).count() {
            0 => OverallHealth::Healthy,
            1 => OverallHealth::Degraded,
            _ => OverallHealth::Unhealthy,
        }
    }
}

impl fmt::Display for OverallHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OverallHealth::Healthy => write!(f, "healthy"),
            OverallHealth::Degraded => write!(f, "degraded"),
            OverallHealth::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HealthPolicy {
    pub max_attempts: u32,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    pub jitter: Duration,
    pub required_consecutive: u32,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
            required_consecutive: REQUIRED_CONSECUTIVE_PROBES,
        }
    }
}

pub struct HealthVerifier {
    probe: Arc<dyn HealthProbe>,
    policy: HealthPolicy,
}

impl HealthVerifier {
    pub fn new(probe: Arc<dyn HealthProbe>, policy: HealthPolicy) -> Self {
        Self { probe, policy }
    }

    pub async fn verify(
        &self,
        services: &[String],
        per_service_timeout: Duration,
    ) -> BTreeMap<String, HealthReport> {
        let checks = services
            .iter()
            .map(|service| self.check(service, per_service_timeout));
        join_all(checks)
            .await
            .into_iter()
            .map(|report| (report.service_name.clone(), report))
            .collect()
    }

    async fn check(&self, service: &str, timeout: Duration) -> HealthReport {
        let deadline = Instant::now() + timeout;
        let required = self.policy.required_consecutive.max(1);
        let mut backoff =
            Backoff::new(self.policy.backoff_min, self.policy.backoff_max).with_jitter(self.policy.jitter);

        let mut attempts = 0;
        let mut consecutive = 0;
        let mut last_detail = "not probed".to_string();

        while attempts < self.policy.max_attempts {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            attempts += 1;
            let result = match tokio::time::timeout(remaining, self.probe.probe(service)).await {
                Ok(result) => result,
                Err(_) => {
                    last_detail = "probe timed out".to_string();
                    break;
                }
            };

            let delay = if result.ok {
                consecutive += 1;
                if consecutive >= required {
                    tracing::debug!(service, attempts, "service healthy");
                    return HealthReport {
                        service_name: service.to_string(),
                        checked_at: Utc::now(),
                        healthy: true,
                        detail: result.detail,
                        attempts,
                    };
                }
                backoff.reset();
                self.policy.backoff_min
            } else {
                consecutive = 0;
                backoff.next_delay()
            };
            last_detail = result.detail;

            if attempts < self.policy.max_attempts {
                let remaining = deadline.saturating_duration_since(Instant::now());
                tokio::time::sleep(delay.min(remaining)).await;
            }
        }

        tracing::warn!(service, attempts, detail = %last_detail, "service not healthy");
        HealthReport {
            service_name: service.to_string(),
            checked_at: Utc::now(),
            healthy: false,
            detail: format!(
                "{} (no {} consecutive healthy probes after {} attempt(s))",
                last_detail, required, attempts
            ),
            attempts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::docker::{MockServiceSupervisor, ServiceStatus};
    use crate::core::testing::ScriptedProbe;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            max_attempts: 6,
            backoff_min: Duration::from_millis(100),
            backoff_max: Duration::from_secs(1),
            jitter: Duration::ZERO,
            required_consecutive: 2,
        }
    }

    fn services(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_flapping_probe_needs_two_in_a_row() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script("api", &[true, false, true, true]);

        let verifier = HealthVerifier::new(probe, policy());
        let reports = verifier.verify(&services(&["api"]), Duration::from_secs(30)).await;
        let report = &reports["api"];
        assert!(report.healthy);
        assert_eq!(report.attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_consecutive_is_unhealthy() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script("postgres", &[true, false, true, false, true, false]);

        let verifier = HealthVerifier::new(probe, policy());
        let reports = verifier
            .verify(&services(&["postgres"]), Duration::from_secs(30))
            .await;
        assert!(!reports["postgres"].healthy);
        assert_eq!(reports["postgres"].attempts, 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_service_does_not_block_others() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.script("api", &[true, true]);
        probe.hang("worker");

        let verifier = HealthVerifier::new(probe, policy());
        let reports = verifier
            .verify(&services(&["api", "worker"]), Duration::from_secs(5))
            .await;
        assert!(reports["api"].healthy);
        assert!(!reports["worker"].healthy);
        assert!(reports["worker"].detail.starts_with("probe timed out"));
        assert_eq!(
            OverallHealth::from_reports(&reports),
            OverallHealth::Degraded
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_verify_is_idempotent_for_healthy_services() {
        let probe = Arc::new(ScriptedProbe::new());
        probe.always("api", true);
        probe.always("postgres", true);

        let verifier = HealthVerifier::new(probe, policy());
        let names = services(&["api", "postgres"]);
        let first = verifier.verify(&names, Duration::from_secs(10)).await;
        let second = verifier.verify(&names, Duration::from_secs(10)).await;

        assert_eq!(first.len(), second.len());
        for (name, report) in &first {
            assert!(report.same_outcome(&second[name]));
        }
    }

    #[tokio::test]
    async fn test_supervisor_probe_reads_container_health() {
        let mut supervisor = MockServiceSupervisor::new();
        supervisor.expect_status().returning(|service| {
            Ok(match service {
                "api" => ServiceStatus {
                    running: true,
                    health: Some("healthy".to_string()),
                    healthy: true,
                },
                "worker" => ServiceStatus {
                    running: true,
                    health: Some("starting".to_string()),
                    healthy: false,
                },
                _ => ServiceStatus::default(),
            })
        });

        let probe = SupervisorProbe::new(Arc::new(supervisor));
        assert_eq!(probe.probe("api").await, ProbeResult::ok("running (healthy)"));
        assert_eq!(probe.probe("worker").await, ProbeResult::failed("running (starting)"));
        assert_eq!(probe.probe("cache").await, ProbeResult::failed("not running"));
    }

    #[test]
    fn test_overall_health() {
        let report = |name: &str, healthy| HealthReport {
            service_name: name.to_string(),
            checked_at: Utc::now(),
            healthy,
            detail: String::new(),
            attempts: 1,
        };
        let mut reports = BTreeMap::new();
        reports.insert("a".to_string(), report("a", true));
        assert_eq!(OverallHealth::from_reports(&reports), OverallHealth::Healthy);
        reports.insert("b".to_string(), report("b", false));
        reports.insert("c".to_string(), report("c", false));
        assert_eq!(OverallHealth::from_reports(&reports), OverallHealth::Unhealthy);
    }
}
