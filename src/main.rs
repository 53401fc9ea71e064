//! Main binary entry point for postgres-tablesync.

use anyhow::Result;
use postgres_tablesync::args::{Command, ConnectionArgs, get_args};
use postgres_tablesync::{Config, ReplicationOrchestrator};
use std::path::Path;
use std::process::ExitCode;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use tracing::{error, info};

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = match get_args() {
        Ok(args) => args,
        Err(e) => e.exit(),
    };
    match run(args.command) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(fatal = true, error = %format!("{e:#}"), "tablesync failed");
            ExitCode::from(2)
        }
    }
}

fn load_config(path: &Path, connection: ConnectionArgs) -> Result<Config> {
    let mut config = Config::load(path)?;
    config.apply_overrides(connection.source_uri, connection.destination_uri, None);
    Ok(config)
}

fn run(command: Command) -> Result<u8> {
    match command {
        Command::Replicate {
            config,
            execute,
            strategy,
            table,
            connection,
        } => {
            let mut config = load_config(&config, connection)?;
            config.apply_overrides(None, None, strategy);
            let orchestrator = ReplicationOrchestrator::connect(config)?;
            let stop = Arc::new(AtomicBool::new(false));
            let stop_clone = stop.clone();
            ctrlc::set_handler(move || {
                stop_clone.store(true, Ordering::Relaxed);
            })?;
            let batch = orchestrator.run(execute, &table, &stop)?;
            Ok(batch.exit_code())
        }
        Command::Plan {
            config,
            table,
            connection,
        } => {
            let config = load_config(&config, connection)?;
            let orchestrator = ReplicationOrchestrator::connect(config)?;
            for table_config in orchestrator.config.select_tables(&table)? {
                let plan = orchestrator.plan_table(table_config)?;
                info!(
                    source = %table_config.source_table(),
                    destination = %table_config.destination_table(),
                    columns = plan.columns.len(),
                    parameters = plan.parameter_count(),
                    "resolved plan"
                );
                println!("{}", plan.statement());
            }
            Ok(0)
        }
    }
}
