use anyhow::Result;
use clap::Parser;
use spresso_cli::cli::Cli;
use spresso_cli::config::{Config, Settings};
use spresso_cli::server::{self, AppState};
use spresso_cli::{logging, orchestrator};
use tracing::error;

#[tokio::main]
async fn main() {
	let cli = Cli::parse();
	logging::init_logging(cli.verbose);

	if let Err(err) = run(cli).await {
		error!(target = "spresso", error = ?err, "fatal");
		eprintln!("Error: {err:#}");
		std::process::exit(1);
	}
}

async fn run(cli: Cli) -> Result<()> {
	let config = Config::load(cli.config.as_deref())?;
	let settings = Settings::resolve(&cli, config)?;

	let state = AppState::new(orchestrator(&settings), settings.default_capabilities.clone());
	server::serve(&settings.host, settings.port, state).await
}
