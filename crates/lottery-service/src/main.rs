//! Main entry point for the lottery orchestrator.
//!
//! Loads the configuration, builds the engine with the configured storage,
//! key store and chain implementations, then runs until interrupted.

use clap::Parser;
use lottery_config::Config;
use lottery_service::build_orchestrator_from_config;
use std::path::PathBuf;

/// Command-line arguments for the orchestrator.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
	/// Path to configuration file
	#[arg(short, long, env = "LOTTERY_CONFIG", default_value = "config/lottery.toml")]
	config: PathBuf,

	/// Log level (trace, debug, info, warn, error)
	#[arg(short, long, default_value = "info")]
	log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
	let args = Args::parse();

	use tracing_subscriber::{fmt, EnvFilter};

	let env_filter =
		EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));
	fmt()
		.with_env_filter(env_filter)
		.with_thread_ids(true)
		.with_target(true)
		.init();

	tracing::info!("Started lottery orchestrator");

	let config_path = args.config.to_string_lossy();
	let config = Config::from_file(&config_path).await?;
	tracing::info!("Loaded configuration [{}]", config.orchestrator.id);

	let engine = build_orchestrator_from_config(config)?;
	engine.run().await?;

	tracing::info!("Stopped lottery orchestrator");
	Ok(())
}
