//! stackguard: backup, restore, schema migration and deployment for
//! docker-compose stacks.

pub mod cli;
pub mod core;
pub mod telemetry;
pub mod utils;
