/// Defaults and fixed names shared across stackguard
///
/// Values here are fallbacks; everything operational can be overridden in
/// stackguard.toml.

use std::time::Duration;

/// Config file name looked up in the working directory and the user config dir
pub const CONFIG_FILE_NAME: &str = "stackguard.toml";

/// Environment variable naming an explicit config file
pub const CONFIG_ENV_VAR: &str = "STACKGUARD_CONFIG";

/// Name of the manifest object stored alongside the components of a bundle
pub const MANIFEST_NAME: &str = "manifest.json";

/// Manifest format version written into every bundle
pub const MANIFEST_VERSION: u32 = 1;

/// Default retention window in days
pub const DEFAULT_RETENTION_DAYS: u32 = 30;

/// Default region for the remote object store
pub const DEFAULT_REMOTE_REGION: &str = "us-west-2";

/// Default credential variables for the remote object store
pub const DEFAULT_ACCESS_KEY_ENV: &str = "AWS_ACCESS_KEY_ID";
pub const DEFAULT_SECRET_KEY_ENV: &str = "AWS_SECRET_ACCESS_KEY";

/// Revision name reported when no migration has been applied
pub const BASE_REVISION: &str = "base";

/// Migration target meaning "latest known revision"
pub const HEAD_REVISION: &str = "head";

/// Consecutive successful probes required before a service counts as healthy
pub const REQUIRED_CONSECUTIVE_PROBES: u32 = 2;

/// Interval between status polls while waiting for services to stop
pub const STOP_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Lines of container log captured per service when not configured
pub const DEFAULT_LOG_TAIL: usize = 1000;

/// Table holding the cooperative migration lock row
pub const MIGRATION_LOCK_TABLE: &str = "stackguard_migration_lock";

/// File (under the local storage dir) journaling applied migration steps
pub const MIGRATION_JOURNAL_FILE: &str = "migration_history.json";
