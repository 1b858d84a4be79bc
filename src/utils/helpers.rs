/// Helper utilities for the stackguard CLI

use chrono::{DateTime, Utc};
use rand::Rng;
use std::time::Duration;

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format duration to human-readable string
pub fn format_duration(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;
    let secs = seconds % 60;

    if days > 0 {
        format!("{}d {}h", days, hours)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

/// Age of a timestamp relative to `now`, e.g. "3d 4h"
pub fn format_age(timestamp: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let seconds = (now - timestamp).num_seconds().max(0) as u64;
    format_duration(seconds)
}

/// Mask sensitive data (show only first and last N characters)
pub fn mask_sensitive(value: &str, visible_chars: usize) -> String {
    let chars: Vec<char> = value.chars().collect();
    if chars.len() <= visible_chars * 2 {
        "*".repeat(chars.len())
    } else {
        let start: String = chars[..visible_chars].iter().collect();
        let end: String = chars[chars.len() - visible_chars..].iter().collect();
        format!("{}...{}", start, end)
    }
}

/// Generate a random hex string of specified length
pub fn generate_hex_string(length: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| format!("{:x}", rng.gen::<u8>() % 16))
        .collect()
}

/// Quote a value as a SQL string literal
pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

/// Quote a value as a SQL identifier
pub fn quote_ident(value: &str) -> String {
    format!("\"{}\"", value.replace('"', "\"\""))
}

/// Exponential back-off with optional random jitter.
///
/// Delays double from `min` up to `max`; each step adds up to `jitter` of random
/// offset. A zero jitter gives a deterministic sequence.
#[derive(Debug, Clone)]
pub struct Backoff {
    min: Duration,
    max: Duration,
    jitter: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(min: Duration, max: Duration) -> Self {
        Self {
            min,
            max: max.max(min),
            jitter: Duration::ZERO,
            attempt: 0,
        }
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    /// Returns the next delay and advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt);
        let mut delay = self.min.saturating_mul(factor);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms > 0 {
            let offset = rand::thread_rng().gen_range(0..=jitter_ms);
            delay = delay.saturating_add(Duration::from_millis(offset));
        }

        self.attempt = self.attempt.saturating_add(1);
        delay.min(self.max)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Parse Docker container status to simplified state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Stopped,
    Paused,
    Restarting,
    Dead,
    Unknown,
}

impl From<&str> for ContainerState {
    fn from(status: &str) -> Self {
        let status_lower = status.to_lowercase();
        if status_lower.contains("up") || status_lower.contains("running") {
            ContainerState::Running
        } else if status_lower.contains("paused") {
            ContainerState::Paused
        } else if status_lower.contains("restarting") {
            ContainerState::Restarting
        } else if status_lower.contains("dead") || status_lower.contains("removing") {
            ContainerState::Dead
        } else if status_lower.contains("exited") || status_lower.contains("stopped") {
            ContainerState::Stopped
        } else {
            ContainerState::Unknown
        }
    }
}

impl ContainerState {
    /// Restarting containers still hold their volumes, so they count as running
    /// when waiting for a shutdown.
    pub fn is_running(&self) -> bool {
        matches!(self, ContainerState::Running | ContainerState::Restarting)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1073741824), "1.00 GB");
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(30), "30s");
        assert_eq!(format_duration(90), "1m 30s");
        assert_eq!(format_duration(3661), "1h 1m");
        assert_eq!(format_duration(86400), "1d 0h");
    }

    #[test]
    fn test_mask_sensitive() {
        let token = "5e7f294e4c92a9aa661fae8d347d832d";
        assert_eq!(mask_sensitive(token, 4), "5e7f...832d");
        assert_eq!(mask_sensitive("abc", 4), "***");
    }

    #[test]
    fn test_mask_sensitive_counts_chars_not_bytes() {
        assert_eq!(mask_sensitive("aäääääääää", 4), "aäää...ääää");
        assert_eq!(mask_sensitive("пароль", 4), "******");
    }

    #[test]
    fn test_sql_quoting() {
        assert_eq!(quote_literal("it's"), "'it''s'");
        assert_eq!(quote_ident("my\"db"), "\"my\"\"db\"");
    }

    #[test]
    fn test_backoff_doubles_until_max() {
        let mut backoff = Backoff::new(Duration::from_secs(1), Duration::from_secs(5));
        let delays: Vec<u64> = (0..5).map(|_| backoff.next_delay().as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_jitter_stays_bounded() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_secs(1))
            .with_jitter(Duration::from_millis(50));
        let first = backoff.next_delay();
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
    }

    #[test]
    fn test_container_state() {
        assert_eq!(ContainerState::from("Up 2 hours"), ContainerState::Running);
        assert_eq!(ContainerState::from("exited"), ContainerState::Stopped);
        assert!(ContainerState::Restarting.is_running());
        assert!(!ContainerState::Stopped.is_running());
    }
}
