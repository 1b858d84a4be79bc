use anyhow::{Context, Result};
use chrono::Utc;
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeSet;
use std::process::ExitCode;
use std::time::Duration;

use stackguard::cli::{BackupCommands, Cli, Commands, ConfigCommands, MigrateCommands};
use stackguard::core::bundle::BundleStatus;
use stackguard::core::deploy::DeploymentReport;
use stackguard::core::error::{EXIT_OPERATION, EXIT_PRECONDITION};
use stackguard::core::{
    BundleId, ComponentKind, ConfirmationToken, Deadline, OpsConfig, OpsError, OverallHealth, Stack,
};
use stackguard::telemetry::init_tracing;
use stackguard::utils::{format_age, format_bytes};

const EXIT_OK: u8 = 0;

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("{} {:#}", "✗".red(), e);
            match e.downcast_ref::<OpsError>() {
                Some(ops) => {
                    if ops.requires_manual_recovery() {
                        eprintln!("  {}", "Manual recovery required".yellow().bold());
                    }
                    ExitCode::from(ops.exit_code())
                }
                None => ExitCode::from(EXIT_OPERATION),
            }
        }
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = OpsConfig::load(cli.config.as_deref(), cli.env_file.as_deref())?;
    let deadline = cli.deadline.map(Deadline::after).unwrap_or_else(Deadline::none);

    if let Commands::Config { command } = &cli.command {
        return handle_config(command, &config);
    }

    let problems = config.validate();
    if !problems.is_empty() {
        return Err(OpsError::PreconditionFailed(format!(
            "invalid configuration:\n  - {}",
            problems.join("\n  - ")
        ))
        .into());
    }
    let stack = Stack::from_config(config)?;

    match cli.command {
        Commands::Backup { command } => handle_backup(command, &stack, &deadline).await,
        Commands::Restore {
            bundle_id,
            confirm,
            revert,
        } => handle_restore(&bundle_id, confirm, revert, &stack, &deadline).await,
        Commands::Migrate { command } => handle_migrate(command, &stack, &deadline).await,
        Commands::Deploy { environment, confirm } => {
            handle_deploy(&environment, confirm, &stack, &deadline).await
        }
        Commands::Rollback {
            environment,
            bundle_id,
            confirm,
        } => handle_rollback(&environment, &bundle_id, &confirm, &stack, &deadline).await,
        Commands::Health { services } => handle_health(services, &stack).await,
        Commands::Status => handle_status(&stack).await,
        Commands::Config { .. } => Ok(EXIT_OK),
    }
}

fn spinner(message: impl Into<String>) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner:.cyan} {msg} [{elapsed}]")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.into());
    pb.enable_steady_tick(Duration::from_millis(120));
    pb
}

fn ok(message: impl std::fmt::Display) {
    println!("{} {}", "✓".green(), message);
}

fn fail(message: impl std::fmt::Display) {
    println!("{} {}", "✗".red(), message);
}

fn handle_config(command: &ConfigCommands, config: &OpsConfig) -> Result<u8> {
    match command {
        ConfigCommands::View => {
            if let Some(source) = config.source() {
                println!("# {}", source.display());
            }
            print!("{}", config.masked_view()?);
            Ok(EXIT_OK)
        }
        ConfigCommands::Validate => {
            let errors = config.validate();
            if errors.is_empty() {
                ok("Configuration is valid");
                Ok(EXIT_OK)
            } else {
                println!("Configuration errors:\n");
                for error in &errors {
                    fail(error);
                }
                Ok(EXIT_PRECONDITION)
            }
        }
    }
}

async fn handle_backup(command: BackupCommands, stack: &Stack, deadline: &Deadline) -> Result<u8> {
    let backup = stack.backup()?;

    match command {
        BackupCommands::Create { domains } => {
            let domains: BTreeSet<ComponentKind> = if domains.is_empty() {
                stack.config().backup_domains()
            } else {
                domains
                    .iter()
                    .map(|d| d.parse::<ComponentKind>())
                    .collect::<std::result::Result<_, _>>()?
            };

            let pb = spinner(format!(
                "Backing up {}",
                domains.iter().map(|d| d.as_str()).collect::<Vec<_>>().join(", ")
            ));
            let result = backup.create_backup(&domains, deadline).await;
            pb.finish_and_clear();
            let outcome = result?;

            let bundle = &outcome.bundle;
            println!("Bundle {} ({})\n", bundle.id().to_string().bold(), bundle.status());
            for component in bundle.components() {
                if component.is_complete() {
                    ok(format!("{:<10} {:>12}", component.name, format_bytes(component.size_bytes)));
                } else {
                    fail(format!(
                        "{:<10} {}",
                        component.name,
                        component.error.as_deref().unwrap_or("failed")
                    ));
                }
            }
            if let Some(pruned) = &outcome.pruned {
                if !pruned.deleted.is_empty() {
                    println!("\nPruned {} expired bundle(s)", pruned.deleted.len());
                }
                for (id, reason) in &pruned.failed {
                    fail(format!("could not prune {}: {}", id, reason));
                }
            }

            if bundle.status() == BundleStatus::Partial {
                println!("\n{}", "Backup is partial; the database dump is usable".yellow());
                return Ok(EXIT_OPERATION);
            }
            Ok(EXIT_OK)
        }
        BackupCommands::List => {
            let bundles = backup.list().await?;
            if bundles.is_empty() {
                println!("No backups in {}", backup.sink().describe());
                return Ok(EXIT_OK);
            }
            let now = Utc::now();
            println!(
                "{:<22} {:<10} {:<12} {:>12} {:>6}",
                "Bundle", "Age", "Status", "Size", "Parts"
            );
            println!("{}", "-".repeat(66));
            for b in bundles.iter().rev() {
                let status = match b.status {
                    BundleStatus::Complete => b.status.to_string().green(),
                    BundleStatus::Partial => b.status.to_string().yellow(),
                    _ => b.status.to_string().red(),
                };
                println!(
                    "{:<22} {:<10} {:<12} {:>12} {:>6}",
                    b.id.to_string(),
                    format_age(b.created_at, now),
                    status,
                    format_bytes(b.total_bytes),
                    b.component_count
                );
            }
            Ok(EXIT_OK)
        }
        BackupCommands::Show { bundle_id } => {
            let id: BundleId = bundle_id.parse()?;
            let bundle = backup.show(&id).await?;
            println!("{}", String::from_utf8_lossy(&bundle.to_manifest()?));
            Ok(EXIT_OK)
        }
        BackupCommands::Verify { bundle_id } => {
            let id: BundleId = bundle_id.parse()?;
            let pb = spinner(format!("Verifying {}", id));
            let result = backup.verify(&id).await;
            pb.finish_and_clear();
            let report = result?;

            for (kind, result) in &report.components {
                match result {
                    Ok(()) => ok(kind),
                    Err(reason) => fail(reason),
                }
            }
            if report.is_intact() {
                ok(format!("Bundle {} is intact", id));
                Ok(EXIT_OK)
            } else {
                fail(format!("Bundle {} failed verification", id));
                Ok(EXIT_PRECONDITION)
            }
        }
        BackupCommands::Prune { dry_run } => {
            let (plan, report) = backup.prune(dry_run).await?;
            if let Some(floor) = &plan.floor {
                println!("Keeping {} as the most recent good bundle", floor);
            }
            if plan.delete.is_empty() {
                ok("Nothing to prune");
                return Ok(EXIT_OK);
            }
            match report {
                None => {
                    println!("Would delete:");
                    for id in &plan.delete {
                        println!("  {}", id);
                    }
                    Ok(EXIT_OK)
                }
                Some(report) => {
                    for id in &report.deleted {
                        ok(format!("deleted {}", id));
                    }
                    for (id, reason) in &report.failed {
                        fail(format!("{}: {}", id, reason));
                    }
                    Ok(if report.failed.is_empty() { EXIT_OK } else { EXIT_OPERATION })
                }
            }
        }
    }
}

async fn handle_restore(
    bundle_id: &str,
    confirm: Option<String>,
    revert: bool,
    stack: &Stack,
    deadline: &Deadline,
) -> Result<u8> {
    let id: BundleId = bundle_id.parse()?;
    let restore = stack.restore()?;

    if revert {
        let pb = spinner(format!("Reverting restore of {}", id));
        let result = restore.revert(&id, deadline).await;
        pb.finish_and_clear();
        let report = result?;
        for path in &report.restored {
            ok(format!("{} restored to its pre-restore contents", path.display()));
        }
        for path in &report.set_aside {
            println!("  restored copy kept at {}", path.display());
        }
        return Ok(EXIT_OK);
    }

    let token = confirm.map(ConfirmationToken::new);
    let pb = spinner(format!("Restoring {}", id));
    let result = restore.restore(&id, token.as_ref(), deadline).await;
    pb.finish_and_clear();
    let report = result.with_context(|| format!("restore of {} did not complete", id))?;

    for step in &report.steps {
        ok(step);
    }
    for kind in &report.skipped {
        println!("  {} not restored", kind);
    }
    for path in &report.moved_aside {
        println!("  prior contents kept at {}", path.display());
    }
    Ok(EXIT_OK)
}

async fn handle_migrate(command: MigrateCommands, stack: &Stack, deadline: &Deadline) -> Result<u8> {
    let runner = stack.migrations()?;

    let state = match command {
        MigrateCommands::Current => runner.current().await?,
        MigrateCommands::History => {
            let history = runner.history();
            if history.is_empty() {
                println!("No migrations recorded");
            }
            for entry in history {
                println!(
                    "{}  {:<10} {}",
                    entry.applied_at.format("%Y-%m-%d %H:%M:%S"),
                    entry.direction,
                    entry.revision
                );
            }
            return Ok(EXIT_OK);
        }
        MigrateCommands::Upgrade { target } => {
            let pb = spinner(format!("Upgrading to {}", target));
            let result = runner.upgrade(&target, deadline).await;
            pb.finish_and_clear();
            result?
        }
        MigrateCommands::Downgrade { steps } => {
            let pb = spinner(format!("Downgrading {} step(s)", steps));
            let result = runner.downgrade(steps, deadline).await;
            pb.finish_and_clear();
            result?
        }
    };

    ok(format!("Current revision: {}", state.current_revision.bold()));
    Ok(EXIT_OK)
}

fn print_deployment(report: &DeploymentReport) {
    for step in &report.steps {
        ok(step);
    }
    for health in report.health.values() {
        let line = format!("{:<20} {}", health.service_name, health.detail);
        if health.healthy {
            ok(line);
        } else {
            fail(line);
        }
    }
}

async fn handle_deploy(environment: &str, confirm: bool, stack: &Stack, deadline: &Deadline) -> Result<u8> {
    let coordinator = stack.deployment(environment)?;
    let pb = spinner(format!("Deploying {}", environment));
    let result = coordinator.deploy(environment, confirm, deadline).await;
    pb.finish_and_clear();
    let report = result?;

    print_deployment(&report);
    if report.succeeded() {
        ok(format!("Deployed {}", environment));
        return Ok(EXIT_OK);
    }

    if let Some(step) = report.failed_step {
        fail(format!(
            "Deployment failed at {}: {}",
            step,
            report.error.as_deref().unwrap_or("unknown error")
        ));
    }
    if report.manual_recovery {
        println!("  {}", "Manual recovery required".yellow().bold());
    }
    if let Some(bundle) = &report.last_good_bundle {
        println!("  Last good bundle: {}", bundle);
        println!(
            "  To roll back: stackguard rollback {} {} --confirm {}",
            environment, bundle, bundle
        );
    }
    Ok(EXIT_OPERATION)
}

async fn handle_rollback(
    environment: &str,
    bundle_id: &str,
    confirm: &str,
    stack: &Stack,
    deadline: &Deadline,
) -> Result<u8> {
    let id: BundleId = bundle_id.parse()?;
    let coordinator = stack.deployment(environment)?;
    let pb = spinner(format!("Rolling back {} to {}", environment, id));
    let result = coordinator
        .rollback(environment, &id, &ConfirmationToken::new(confirm), deadline)
        .await;
    pb.finish_and_clear();
    let report = result?;

    print_deployment(&report);
    ok(format!("Rolled back {} to {}", environment, id));
    Ok(EXIT_OK)
}

async fn handle_health(services: Vec<String>, stack: &Stack) -> Result<u8> {
    let services = if services.is_empty() {
        stack.config().verify_services()
    } else {
        services
    };
    let verifier = stack.health_verifier()?;

    let pb = spinner("Checking service health");
    let reports = verifier.verify(&services, stack.config().health.timeout).await;
    pb.finish_and_clear();

    for report in reports.values() {
        let line = format!(
            "{:<20} {} ({} probe(s))",
            report.service_name, report.detail, report.attempts
        );
        if report.healthy {
            ok(line);
        } else {
            fail(line);
        }
    }

    let overall = OverallHealth::from_reports(&reports);
    let label = match overall {
        OverallHealth::Healthy => overall.to_string().green(),
        OverallHealth::Degraded => overall.to_string().yellow(),
        OverallHealth::Unhealthy => overall.to_string().red(),
    };
    println!("\nOverall: {}", label.bold());
    Ok(if overall == OverallHealth::Healthy { EXIT_OK } else { EXIT_OPERATION })
}

async fn handle_status(stack: &Stack) -> Result<u8> {
    let docker = stack.docker();
    if !docker.check_docker().await? {
        return Err(OpsError::ServiceUnavailable("Docker daemon is not reachable".to_string()).into());
    }

    let services = docker.list_services().await?;
    println!("{:<25} {:<15} {:<15}", "Service", "Status", "Health");
    println!("{}", "-".repeat(55));
    for (name, status) in &services {
        let running = if status.running { "running".green() } else { "stopped".red() };
        println!(
            "{:<25} {:<15} {:<15}",
            name,
            running,
            status.health.as_deref().unwrap_or("-")
        );
    }
    Ok(EXIT_OK)
}
