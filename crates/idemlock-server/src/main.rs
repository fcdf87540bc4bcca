//! Entry point for the idemlock scenario runner.
//!
//! Connects to the configured database, optionally creates the managed tables,
//! runs one scenario in the chosen mode and reports the side effects per key.

use clap::Parser;
use idemlock_server::{
    logging,
    scenarios::ScenarioRunner,
    settings::{Cli, Configuration},
};
use tracing::{error, info};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!("{:#}", err);
        eprintln!("idemlock: {:#}", err);
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let configuration = Configuration::from_cli(&cli)?;

    let _logging_guard = logging::init_logging(&configuration.logging_config())?;
    info!(scenario = ?cli.scenario, mode = ?cli.mode, "Starting idemlock runner");

    let db = configuration.database_connection().await?;
    let runner = ScenarioRunner::new(db.clone(), &configuration)?;

    if cli.create_schema {
        runner.create_schema().await?;
        info!("Schema created");
    }
    runner.reset().await?;

    let report = runner.run(cli.scenario, cli.mode).await?;
    print!("{}", report);

    db.close().await?;

    if !report.is_consistent() {
        anyhow::bail!(
            "side effects {:?} differ from expected {:?}",
            report.side_effects,
            report.expected
        );
    }
    Ok(())
}
