mod config;
mod logging;

use anyhow::{Context, Result};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use config::{MigratorConfig, DEFAULT_CONFIG_FILE};
use rmig_core::MigratorMode;
use rmig_interceptors::InterceptorRegistry;
use rmig_runtime::{MigrationReport, RuntimeMigrator};
use rmig_snapshot_adapter::{JournalTarget, SnapshotSource};
use rmig_storage::MappingStore;
use std::ffi::OsString;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info, warn};

const MAX_ARGUMENTS: usize = 5;

#[derive(Parser, Debug)]
#[command(name = "runtime-migrator")]
#[command(about = "Moves running process instances from the source engine to the target engine")]
struct Cli {
    /// Migrate active process instances (default mode)
    #[arg(long)]
    runtime: bool,
    /// Retry process instances skipped by earlier runs
    #[arg(long, conflicts_with = "list_skipped")]
    retry_skipped: bool,
    /// Print skipped process instances with their reasons
    #[arg(long)]
    list_skipped: bool,
    /// Drop the mapping table after a successful run
    #[arg(long)]
    drop_schema: bool,
    /// With --drop-schema, drop the mapping table even after a failed run
    #[arg(long, requires = "drop_schema")]
    force: bool,
    /// Configuration file
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

impl Cli {
    fn mode(&self) -> MigratorMode {
        if self.retry_skipped {
            MigratorMode::RetrySkipped
        } else if self.list_skipped {
            MigratorMode::ListSkipped
        } else {
            MigratorMode::Migrate
        }
    }
}

fn parse_args<I, T>(args: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let args: Vec<OsString> = args.into_iter().map(Into::into).collect();
    if args.len().saturating_sub(1) > MAX_ARGUMENTS {
        return Err(Cli::command().error(
            ErrorKind::TooManyValues,
            format!("at most {MAX_ARGUMENTS} arguments are accepted"),
        ));
    }
    Cli::try_parse_from(args)
}

fn main() -> ExitCode {
    let cli = match parse_args(std::env::args_os()) {
        Ok(cli) => cli,
        Err(err) => {
            // help and usage errors both end the process with status 1
            let _ = err.print();
            return ExitCode::from(1);
        }
    };

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));
    let config = match MigratorConfig::load(&config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("runtime-migrator: {err:#}");
            return ExitCode::from(1);
        }
    };
    let _log_guard = logging::init_logging(&config.logging);

    match run(&cli, &config) {
        Ok(report) => {
            info!(?report, "runtime migrator finished");
            ExitCode::SUCCESS
        }
        Err(err) => {
            error!("runtime migrator failed: {err:#}");
            eprintln!("runtime-migrator: {err:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: &Cli, config: &MigratorConfig) -> Result<MigrationReport> {
    let store = MappingStore::open_with_prefix(&config.mapping.database, &config.mapping.table_prefix)
        .with_context(|| {
            format!(
                "failed to open mapping store {}",
                config.mapping.database.display()
            )
        })?;
    let pipeline = InterceptorRegistry::with_builtins()
        .build(&config.interceptors)
        .context("failed to build variable interceptors")?;
    let source = SnapshotSource::load(&config.source.snapshot).context("failed to load source")?;
    let target = JournalTarget::open(&config.target.definitions, &config.target.journal)
        .context("failed to open target")?;

    let mut migrator = RuntimeMigrator::new(config.runtime(), source, target, store, pipeline);
    let outcome = migrator.run(cli.mode());

    if cli.drop_schema {
        let (_, _, store) = migrator.into_parts();
        if outcome.is_ok() || cli.force {
            store
                .drop_schema()
                .context("failed to drop the mapping schema")?;
        } else {
            warn!("migration failed, keeping the mapping table; pass --force to drop it anyway");
        }
    }

    Ok(outcome?)
}
