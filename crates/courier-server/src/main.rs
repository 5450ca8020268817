//! Courier host binary.
//!
//! Wires the bus to a Valkey/Redis broker, registers the demonstration
//! handlers and consumes until interrupted. Database migrations run through
//! the same binary.

mod config;
mod db;
mod handlers;
mod migrate;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use courier_core::{Bus, HandlerFactory, StreamBroker, ValkeyBroker};

use crate::config::Config;

#[derive(Parser)]
#[command(name = "courier-server")]
#[command(about = "Run the Courier message bus host")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Consume registered streams until interrupted
    Run,
    /// Apply pending database migrations and exit
    Migrate,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("courier_core=info".parse()?)
                .add_directive("courier_server=info".parse()?),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(config).await,
        Commands::Migrate => run_migrations(config).await,
    }
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    info!(url = %config.broker.url, "connecting to broker");
    let broker = ValkeyBroker::connect(&config.broker.url, config.broker.pool_size).await?;

    let pool = db::connect(&config.postgres).await?;
    info!(dbname = %config.postgres.dbname, "database pool ready");

    if config.migration.dir.exists() {
        migrate::run(&pool, &config.migration.dir).await?;
    } else {
        warn!(dir = %config.migration.dir.display(), "migration directory missing, skipping");
    }

    let bus = Arc::new(Bus::new(Arc::new(broker) as Arc<dyn StreamBroker>));
    let factory = Arc::new(HandlerFactory::new());
    handlers::register(&bus, &factory);

    let repository = Arc::new(db::PgRepository::new(pool.clone()));
    factory.register_repository(handlers::ECHO_STREAM, repository);

    bus.set_factory(factory);
    bus.run();

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    bus.stop().await;
    pool.close().await;
    Ok(())
}

async fn run_migrations(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let pool = db::connect(&config.postgres).await?;
    migrate::run(&pool, &config.migration.dir).await?;
    pool.close().await;
    Ok(())
}
