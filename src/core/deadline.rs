/// Caller-supplied deadlines and per-step timeouts.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

use super::error::{OpsError, Result};

/// Absolute deadline for a whole operation. `Deadline::none()` means only the
/// per-step timeouts apply.
#[derive(Debug, Clone, Copy, Default)]
pub struct Deadline {
    at: Option<Instant>,
}

impl Deadline {
    pub fn none() -> Self {
        Self { at: None }
    }

    pub fn after(duration: Duration) -> Self {
        Self {
            at: Some(Instant::now() + duration),
        }
    }

    pub fn remaining(&self) -> Option<Duration> {
        self.at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.remaining(), Some(d) if d.is_zero())
    }

    /// Time a step may take: its own timeout, capped by what is left overall
    pub fn budget(&self, step_timeout: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => remaining.min(step_timeout),
            None => step_timeout,
        }
    }

    /// Run `fut` bounded by the step budget; expiry becomes [`OpsError::Timeout`]
    pub async fn run<T, F>(&self, step: &str, step_timeout: Duration, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        if self.is_expired() {
            return Err(OpsError::Timeout {
                step: step.to_string(),
                after: Duration::ZERO,
            });
        }

        let budget = self.budget(step_timeout);
        match tokio::time::timeout(budget, fut).await {
            Ok(result) => result,
            Err(_) => Err(OpsError::Timeout {
                step: step.to_string(),
                after: budget,
            }),
        }
    }
}
