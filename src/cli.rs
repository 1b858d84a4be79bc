/// CLI argument parsing

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

// Build timestamp injected at compile time
pub const VERSION_WITH_BUILD: &str = concat!(env!("CARGO_PKG_VERSION"), " (built: ", env!("BUILD_TIMESTAMP"), ")");

#[derive(Parser)]
#[command(name = "stackguard")]
#[command(author, version = VERSION_WITH_BUILD, about, long_about = None)]
pub struct Cli {
    /// Path to stackguard.toml
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// .env file holding credentials (default: next to the config)
    #[arg(long, global = true)]
    pub env_file: Option<PathBuf>,

    /// Debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Overall time budget for the command, e.g. "30m"
    #[arg(long, global = true, value_parser = parse_duration)]
    pub deadline: Option<Duration>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Backup operations
    Backup {
        #[command(subcommand)]
        command: BackupCommands,
    },

    /// Restore a backup bundle
    Restore {
        /// Bundle to restore
        bundle_id: String,

        /// Bundle id again, confirming the destructive database step
        #[arg(long, value_name = "BUNDLE_ID")]
        confirm: Option<String>,

        /// Move the contents set aside by a restore of this bundle back into place
        #[arg(long, conflicts_with = "confirm")]
        revert: bool,
    },

    /// Schema migrations
    Migrate {
        #[command(subcommand)]
        command: MigrateCommands,
    },

    /// Deploy an environment
    Deploy {
        /// Environment name from the config
        environment: String,

        /// Confirm deploying to a protected environment
        #[arg(long)]
        confirm: bool,
    },

    /// Restore the last good bundle after a failed deployment
    Rollback {
        environment: String,

        bundle_id: String,

        /// Bundle id again, confirming the destructive database step
        #[arg(long, value_name = "BUNDLE_ID", required = true)]
        confirm: String,
    },

    /// Health check report
    Health {
        /// Services to check (default: the restore verification set)
        services: Vec<String>,
    },

    /// Show service status
    Status,

    /// Configuration management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum BackupCommands {
    /// Create a backup bundle
    Create {
        /// Domains to capture (default: backup.domains from the config)
        #[arg(short, long, value_delimiter = ',')]
        domains: Vec<String>,
    },

    /// List bundles
    List,

    /// Print a bundle manifest
    Show { bundle_id: String },

    /// Re-check every component checksum of a bundle
    Verify { bundle_id: String },

    /// Apply the retention policy
    Prune {
        /// Print the plan without deleting
        #[arg(long)]
        dry_run: bool,
    },
}

#[derive(Subcommand)]
pub enum MigrateCommands {
    /// Upgrade to a revision
    Upgrade {
        #[arg(default_value = "head")]
        target: String,
    },

    /// Downgrade by a number of steps
    Downgrade {
        #[arg(default_value_t = 1)]
        steps: u32,
    },

    /// Show the current revision
    Current,

    /// Show the recorded migration history
    History,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// View the effective configuration
    View,

    /// Validate configuration
    Validate,
}

fn parse_duration(value: &str) -> Result<Duration, String> {
    humantime::parse_duration(value).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_restore_with_confirmation() {
        let cli = Cli::parse_from([
            "stackguard",
            "--deadline",
            "30m",
            "restore",
            "20260101T000000000Z",
            "--confirm",
            "20260101T000000000Z",
        ]);
        assert_eq!(cli.deadline, Some(Duration::from_secs(1800)));
        match cli.command {
            Commands::Restore { bundle_id, confirm, revert } => {
                assert_eq!(confirm.as_deref(), Some(bundle_id.as_str()));
                assert!(!revert);
            }
            _ => panic!("expected restore"),
        }
    }

    #[test]
    fn test_rollback_requires_confirm() {
        assert!(Cli::try_parse_from(["stackguard", "rollback", "production", "20260101T000000000Z"]).is_err());
    }

    #[test]
    fn test_backup_domains_list() {
        let cli = Cli::parse_from(["stackguard", "backup", "create", "--domains", "db,files"]);
        match cli.command {
            Commands::Backup {
                command: BackupCommands::Create { domains },
            } => assert_eq!(domains, vec!["db".to_string(), "files".to_string()]),
            _ => panic!("expected backup create"),
        }
    }
}
