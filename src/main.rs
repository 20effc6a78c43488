//! vpsctl - Deploy and manage per-user container instances
//!
//! Operator front end over the lifecycle orchestrator. Every subcommand maps
//! to one lifecycle request and prints its outcome, as text or JSON.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use vpsctl::cli::{Args, ConfigAction, SubCommand};
use vpsctl::core::{
    CredentialRefresh, DockerCli, InstanceSummary, LifecycleOrchestrator, QuotaEnforcer,
    Settings, MAX_CAPTURE_TIMEOUT_SECS, MIN_CAPTURE_TIMEOUT_SECS,
};
use vpsctl::persistence::{flatfile, InstanceRegistry};
use vpsctl::{LifecycleError, APP_NAME, APP_VERSION};

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut bootstrap = Settings::default();
    bootstrap.data_directory = args.data_dir.clone();
    let db_path = bootstrap.get_database_path();

    let registry = InstanceRegistry::open(&db_path)
        .with_context(|| format!("Failed to open registry at {:?}", db_path))?;
    let mut settings = registry.load_settings()?.unwrap_or_default();
    settings.data_directory = args.data_dir.clone();

    init_logging(args.debug || settings.debug_logging);
    debug!("{} v{} using {:?}", APP_NAME, APP_VERSION, db_path);

    match registry.prune_history(settings.history_retention_days) {
        Ok(0) => {}
        Ok(pruned) => debug!("Pruned {} old history entries", pruned),
        Err(e) => warn!("Failed to prune history: {}", e),
    }

    let registry = Arc::new(registry);
    let runtime = Arc::new(DockerCli::from_settings(&settings));
    let orchestrator = Arc::new(LifecycleOrchestrator::new(
        runtime,
        Arc::clone(&registry),
        &settings,
    ));

    // Ctrl-C aborts pending credential captures so deploys roll back cleanly
    {
        let orchestrator = Arc::clone(&orchestrator);
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                orchestrator.shutdown();
            }
        });
    }

    let owner = if args.command.needs_owner() {
        args.owner
            .clone()
            .context("No owner given; pass --owner or set VPSCTL_OWNER")?
    } else {
        String::new()
    };

    if let Err(e) = run(&args, &owner, &orchestrator, &registry, settings).await {
        if let Some(lifecycle) = e.downcast_ref::<LifecycleError>() {
            if lifecycle.is_invariant_violation() {
                error!("Registry invariant violated: {}", lifecycle);
            }
        }
        return Err(e);
    }
    Ok(())
}

async fn run(
    args: &Args,
    owner: &str,
    orchestrator: &LifecycleOrchestrator,
    registry: &InstanceRegistry,
    mut settings: Settings,
) -> Result<()> {
    let json = args.json;

    match &args.command {
        SubCommand::Deploy { image } => {
            let outcome = orchestrator.deploy(owner, image).await?;
            if json {
                print_json(&outcome)?;
            } else {
                println!("Deployed {} ({})", short(&outcome.instance_id), outcome.image);
                println!("Credential: {}", outcome.credential);
            }
        }
        SubCommand::Start { id } => {
            let refresh = orchestrator.start(owner, id).await?;
            report_refresh("Started", id, &refresh, json)?;
        }
        SubCommand::Restart { id } => {
            let refresh = orchestrator.restart(owner, id).await?;
            report_refresh("Restarted", id, &refresh, json)?;
        }
        SubCommand::Stop { id } => {
            orchestrator.stop(owner, id).await?;
            if json {
                print_json(&json!({ "stopped": id }))?;
            } else {
                println!("Stopped {}", id);
            }
        }
        SubCommand::Regen { id } => {
            let credential = orchestrator.regenerate_credential(owner, id).await?;
            if json {
                print_json(&json!({ "credential": credential }))?;
            } else {
                println!("New credential: {}", credential);
            }
        }
        SubCommand::Remove { id } => {
            let record = orchestrator.remove(owner, id).await?;
            if json {
                print_json(&record)?;
            } else {
                println!("Removed {}", record.short_id());
            }
        }
        SubCommand::Delete { id } => {
            let record = orchestrator.force_remove(id).await?;
            if json {
                print_json(&record)?;
            } else {
                println!("Removed {} (owned by {})", record.short_id(), record.owner);
            }
        }
        SubCommand::List => {
            let summaries = orchestrator.list(owner).await?;
            print_summaries(&summaries, false, json)?;
        }
        SubCommand::ListAll => {
            let summaries = orchestrator.list_all().await?;
            print_summaries(&summaries, true, json)?;
        }
        SubCommand::History { id } => {
            let history = orchestrator.history(id)?;
            if json {
                print_json(&history)?;
            } else if history.is_empty() {
                println!("No history for {}", id);
            } else {
                for entry in history {
                    println!(
                        "{}  {:<18} {}",
                        entry.time.format("%Y-%m-%d %H:%M:%S"),
                        entry.event,
                        entry.details.unwrap_or_default()
                    );
                }
            }
        }
        SubCommand::Import { file } => {
            let quota = QuotaEnforcer::new(settings.server_limit);
            let report = flatfile::import(file, registry, &quota)?;
            if json {
                print_json(&json!({
                    "imported": report.imported,
                    "malformed_lines": report.malformed,
                    "duplicates": report.duplicates,
                    "over_quota_lines": report.over_quota,
                }))?;
            } else {
                println!(
                    "Imported {} records ({} malformed lines, {} duplicates, {} over quota)",
                    report.imported,
                    report.malformed.len(),
                    report.duplicates.len(),
                    report.over_quota.len()
                );
            }
        }
        SubCommand::Export { file } => {
            let count = flatfile::export(registry, file)?;
            info!("Exported registry to {:?}", file);
            if json {
                print_json(&json!({ "exported": count }))?;
            } else {
                println!("Exported {} records to {}", count, file.display());
            }
        }
        SubCommand::Config { action } => match action {
            ConfigAction::Show => print_json(&settings)?,
            ConfigAction::SetLimit { limit } => {
                settings.server_limit = *limit;
                registry.save_settings(&settings)?;
                println!("Instance limit set to {}", limit);
            }
            ConfigAction::SetTimeout { seconds } => {
                settings.capture_timeout_secs = *seconds;
                settings.validate();
                registry.save_settings(&settings)?;
                if settings.capture_timeout_secs != *seconds {
                    warn!(
                        "Timeout clamped to {}..={} seconds",
                        MIN_CAPTURE_TIMEOUT_SECS, MAX_CAPTURE_TIMEOUT_SECS
                    );
                }
                println!(
                    "Capture timeout set to {} seconds",
                    settings.capture_timeout_secs
                );
            }
        },
    }

    Ok(())
}

fn report_refresh(verb: &str, id: &str, refresh: &CredentialRefresh, json: bool) -> Result<()> {
    if json {
        let value = match refresh {
            CredentialRefresh::Rotated(credential) => json!({ "credential": credential }),
            CredentialRefresh::Failed(e) => json!({
                "credential": null,
                "refresh_error": e.to_string(),
            }),
        };
        return print_json(&value);
    }

    println!("{} {}", verb, id);
    match refresh {
        CredentialRefresh::Rotated(credential) => println!("New credential: {}", credential),
        CredentialRefresh::Failed(e) => {
            println!("Credential refresh failed ({}); the previous credential is kept", e)
        }
    }
    Ok(())
}

fn print_summaries(summaries: &[InstanceSummary], with_owner: bool, json: bool) -> Result<()> {
    if json {
        return print_json(&summaries);
    }
    if summaries.is_empty() {
        println!("No instances");
        return Ok(());
    }
    for summary in summaries {
        let record = &summary.record;
        let image = record.image.as_deref().unwrap_or("-");
        if with_owner {
            println!(
                "{:<12}  {:<16} {:<8} {:<8} {}",
                record.short_id(),
                record.owner,
                image,
                summary.status_label(),
                record.credential
            );
        } else {
            println!(
                "{:<12}  {:<8} {:<8} {}",
                record.short_id(),
                image,
                summary.status_label(),
                record.credential
            );
        }
    }
    Ok(())
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn short(instance_id: &str) -> &str {
    vpsctl::core::short_id(instance_id)
}

/// Initialize the logging system
fn init_logging(debug: bool) {
    let default = if debug { "vpsctl=debug" } else { "vpsctl=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
