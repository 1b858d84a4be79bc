pub mod archive;
pub mod backup;
pub mod bundle;
pub mod config;
pub mod database;
pub mod deadline;
pub mod deploy;
pub mod docker;
pub mod error;
pub mod health;
pub mod migration;
pub mod restore;
pub mod retention;
pub mod stack;
pub mod storage;

#[cfg(test)]
pub mod testing;

pub use backup::BackupOrchestrator;
pub use bundle::{ArtifactBundle, BundleId, BundleStatus, ComponentKind};
pub use config::OpsConfig;
pub use deadline::Deadline;
pub use deploy::DeploymentCoordinator;
pub use docker::DockerManager;
pub use error::{OpsError, Result};
pub use health::{HealthVerifier, OverallHealth};
pub use migration::MigrationRunner;
pub use restore::{ConfirmationToken, RestoreOrchestrator};
pub use stack::Stack;
