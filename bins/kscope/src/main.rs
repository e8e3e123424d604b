mod config;
mod error;

use std::sync::Arc;

use clap::Parser;
use broker_memory::MemoryBrokerFactory;
use config::{Cli, Commands, KscopeConfig};
use error::CliError;
use kscope_engine::Session;

mod cmd;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{}", e.report());
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), CliError> {
    let config = KscopeConfig::load(cli.config.as_deref())?;
    let factory = MemoryBrokerFactory::from_config(&config.broker())?;
    tracing::info!(config = ?cli.config, topics = config.topics.len(), "kscope starting");
    let session = Session::new(Arc::new(factory), config.session());

    let result = match &cli.command {
        Commands::Shell => cmd::shell::run(&session, config.history_path()).await,
        Commands::Exec(args) => cmd::shell::exec(&session, &args.command).await,
    };
    // close the connection on every exit path
    let closed = session.shutdown().await.map_err(CliError::from);
    result.and(closed)
}
