mod telemetry;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use lpsync_core::SyncRun;
use lpsync_storage::{run_migrations, BackupManager, PgStore, RetentionPolicy};
use lpsync_sync::{
    orchestrator_from_config, render_table, write_run_report, RestoreTarget, SyncConfig,
    DEFAULT_CONFIG_FILE,
};
use tracing::{info, Level};

#[derive(Debug, Parser)]
#[command(name = "lpsync")]
#[command(about = "Sync legacy program dates into the program table")]
struct Cli {
    /// YAML config; `lpsync.yaml` in the working directory is read when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(short, long, global = true)]
    verbose: bool,
    #[arg(long, global = true)]
    json_logs: bool,
    /// Print the run report as JSON instead of a table.
    #[arg(long, global = true)]
    json: bool,
    /// Minimum similarity to accept a match.
    #[arg(long, global = true)]
    accept: Option<f64>,
    /// Minimum lead of the best candidate over the runner-up.
    #[arg(long, global = true)]
    margin: Option<f64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Match and report without writing anything.
    DryRun,
    /// Back up the program table, then write matched dates.
    Apply,
    /// Replace the program table with a backup.
    Restore(RestoreArgs),
    #[command(subcommand)]
    Backups(BackupCommands),
    /// Create the program table in a development database.
    Migrate,
}

#[derive(Debug, Args)]
struct RestoreArgs {
    #[arg(long, conflicts_with = "latest", required_unless_present = "latest")]
    backup: Option<String>,
    #[arg(long)]
    latest: bool,
}

#[derive(Debug, Subcommand)]
enum BackupCommands {
    List,
    /// Drop all but the newest `--keep` backups (defaults to the configured retention).
    Prune {
        #[arg(long, value_parser = clap::value_parser!(u64).range(1..))]
        keep: Option<u64>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    telemetry::init_tracing(cli.json_logs, level);

    let config = load_config(&cli)?;

    match &cli.command {
        Commands::DryRun => {
            let run = orchestrator_from_config(&config).await?.dry_run().await?;
            finish_run(&cli, &config, run).await
        }
        Commands::Apply => {
            let run = orchestrator_from_config(&config).await?.apply().await?;
            finish_run(&cli, &config, run).await
        }
        Commands::Restore(args) => {
            let target = match &args.backup {
                Some(name) => RestoreTarget::Named(name.clone()),
                None => RestoreTarget::Latest,
            };
            let run = orchestrator_from_config(&config).await?.restore(target).await?;
            finish_run(&cli, &config, run).await
        }
        Commands::Backups(command) => backups(&cli, &config, command).await,
        Commands::Migrate => {
            let store = connect(&config).await?;
            run_migrations(store.pool())
                .await
                .context("running migrations")?;
            println!("migrations applied");
            Ok(())
        }
    }
}

fn load_config(cli: &Cli) -> Result<SyncConfig> {
    let env = SyncConfig::from_env();
    let config = match &cli.config {
        Some(path) => env.with_file(path)?,
        None => env.with_optional_file(&PathBuf::from(DEFAULT_CONFIG_FILE))?,
    }
    .with_threshold_overrides(cli.accept, cli.margin);
    config.validate()?;
    Ok(config)
}

async fn connect(config: &SyncConfig) -> Result<PgStore> {
    PgStore::connect(&config.database_url, config.program_table.clone())
        .await
        .with_context(|| format!("connecting to {}", config.program_table))
}

async fn finish_run(cli: &Cli, config: &SyncConfig, run: SyncRun) -> Result<()> {
    let report_dir = write_run_report(&config.reports_dir, &run).await?;
    info!(run_id = %run.run_id, report = %report_dir.display(), "report written");

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&run).context("serializing run")?);
    } else {
        print!("{}", render_table(&run));
    }
    if !run.is_ok() {
        bail!(
            "{} run {} failed with {} error(s); see {}",
            run.mode,
            run.run_id,
            run.error_count,
            report_dir.display()
        );
    }
    Ok(())
}

async fn backups(cli: &Cli, config: &SyncConfig, command: &BackupCommands) -> Result<()> {
    let manager = BackupManager::new(Arc::new(connect(config).await?));
    let table = config.program_table.as_str();
    match command {
        BackupCommands::List => {
            let snapshots = manager.list_backups(table).await?;
            if cli.json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&snapshots).context("serializing backups")?
                );
            } else if snapshots.is_empty() {
                println!("no backups of {table}");
            } else {
                for snapshot in snapshots {
                    println!("{}  {:>6} rows  {}", snapshot.name, snapshot.row_count, snapshot.created_at);
                }
            }
        }
        BackupCommands::Prune { keep } => {
            let policy = match keep {
                Some(keep) => RetentionPolicy {
                    keep_latest: Some(usize::try_from(*keep).unwrap_or(usize::MAX)),
                },
                None if config.retention.keep_latest.is_some() => config.retention,
                None => bail!("no retention configured; pass --keep"),
            };
            let dropped = manager.prune(table, policy).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&dropped).context("serializing pruned")?);
            } else {
                println!("pruned {} backup(s) of {table}", dropped.len());
                for name in dropped {
                    println!("  {name}");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn command_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn restore_needs_exactly_one_selector() {
        assert!(Cli::try_parse_from(["lpsync", "restore"]).is_err());
        assert!(Cli::try_parse_from(["lpsync", "restore", "--latest", "--backup", "x"]).is_err());

        let cli = Cli::try_parse_from(["lpsync", "--accept", "0.9", "restore", "--latest"]).unwrap();
        assert_eq!(cli.accept, Some(0.9));
        assert!(matches!(cli.command, Commands::Restore(RestoreArgs { latest: true, .. })));
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let cli = Cli::try_parse_from(["lpsync", "backups", "prune", "--keep", "3", "--json"]).unwrap();
        assert!(cli.json);
        assert!(matches!(
            cli.command,
            Commands::Backups(BackupCommands::Prune { keep: Some(3) })
        ));
    }

    #[test]
    fn prune_keeps_at_least_one_backup() {
        assert!(Cli::try_parse_from(["lpsync", "backups", "prune", "--keep", "0"]).is_err());
        let cli = Cli::try_parse_from(["lpsync", "backups", "prune"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Backups(BackupCommands::Prune { keep: None })
        ));
    }
}
