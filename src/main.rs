mod broker;
mod cli;
mod config;
mod db;
mod error;
mod executor;
mod notify;
mod scheduler;
mod services;
#[cfg(test)]
mod test_support;

use std::sync::Arc;

use clap::Parser;
use cli::{BrokerCommand, Cli, Command, ProfileCommand};

use crate::broker::ProfileQuery;
use crate::config::AgentConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Set up tracing
    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    let config_path = match cli.config {
        Some(path) => path,
        None => config::config_path()?,
    };
    let mut config = AgentConfig::load(&config_path)?;

    // Open database
    let db_path = config::db_path()?;
    let db = Arc::new(db::Database::open(&db_path)?);

    match cli.command {
        Command::Profile { command } => match command {
            ProfileCommand::Set {
                first_name,
                last_name,
                middle_name,
                city,
                state,
                birth_year,
            } => {
                let query = ProfileQuery {
                    id: None,
                    first_name,
                    last_name,
                    middle_name,
                    city,
                    state: state.to_uppercase(),
                    birth_year,
                    deprecated: false,
                };
                cli::profile::set_profile(&db, query)?
            }
            ProfileCommand::Show => cli::profile::show_profile(&db)?,
        },
        Command::Broker { command } => match command {
            BrokerCommand::Import { path, remote } => {
                cli::broker::import_brokers(&db, path.as_deref(), remote, &config.registry_url)
                    .await?
            }
            BrokerCommand::List => cli::broker::list_brokers(&db)?,
        },
        Command::Run {
            operation_type,
            force,
            show_ui,
            max_concurrency,
        } => {
            if let Some(max) = max_concurrency {
                config.max_concurrency = max;
            }
            cli::run::run_once(db, &config, operation_type, force, show_ui).await?;
        }
        Command::Agent { every, show_ui } => {
            if let Some(hours) = every {
                config.run_frequency_hours = hours;
            }
            cli::run::run_agent(db, &config, show_ui).await?;
        }
        Command::Status { json } => cli::status::status(&db, json)?,
        Command::History { broker } => cli::status::history(&db, &broker)?,
    }

    Ok(())
}
