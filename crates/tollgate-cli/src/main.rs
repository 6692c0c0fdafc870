//! Tollgate CLI entrypoint.

use clap::Parser;

mod commands;
mod config;
mod handlers;
mod logging;

use commands::{Commands, ConfigCommands};
use config::CliConfig;

#[derive(Parser)]
#[command(name = "tollgate")]
#[command(author, version, about = "Gated multi-job pipeline runner", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = CliConfig::load().unwrap_or_default();
    logging::init(config.log_format);

    match cli.command {
        Commands::Init { path, force } => handlers::init(&path, force)?,
        Commands::Validate { path } => handlers::validate(&path)?,
        Commands::Plan { path, trigger } => handlers::plan(&path, &trigger)?,
        Commands::Run { path, trigger } => handlers::run(&config, &path, &trigger).await?,
        Commands::Status { run_id, limit } => {
            handlers::status(&config, run_id.as_deref(), limit).await?
        }
        Commands::Resume { run_id } => handlers::resume(&config, &run_id).await?,
        Commands::Schema => handlers::schema()?,
        Commands::Config { command } => match command {
            ConfigCommands::Show => handlers::show_config(&config)?,
            ConfigCommands::Set { key, value } => handlers::set_config(&key, &value)?,
        },
    }

    Ok(())
}
