// Entry point of the lxdrunner binary.
// Parses the command line, sets up logging, loads the configuration and
// hands over to the RunManager.

use clap::Parser;
use lxdrunner_common::constants::return_code;
use lxdrunner_common::{AppConfig, HostContext};
use lxdrunner_engine::command_settings::{CommandSettings, LogLevel};
use lxdrunner_engine::runner::RunManager;
use lxdrunner_sdk::{BuildInfo, Source};
use tracing_subscriber::EnvFilter;

fn init_tracing(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.as_directive()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true)
        .init();
}

fn main() {
    let settings = CommandSettings::parse();
    init_tracing(settings.log_level);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("Failed to build Tokio runtime");

    let exit_code = runtime.block_on(run(settings));
    std::process::exit(exit_code);
}

async fn run(settings: CommandSettings) -> i32 {
    tracing::info!("{} starting", BuildInfo::PRODUCT_NAME);
    tracing::info!("  Version = {}", BuildInfo::VERSION);
    tracing::info!("  Commit  = {}", Source::COMMIT_HASH);

    let config = match AppConfig::locate(settings.config.as_deref())
        .and_then(|path| AppConfig::load(&path))
    {
        Ok(config) => config,
        Err(e) => {
            eprintln!("lxdrunner: {}", e);
            return return_code::CONFIG_ERROR;
        }
    };

    let context = HostContext::new(config);
    match RunManager::new(context).run().await {
        Ok(code) => {
            tracing::info!("Exiting with code {}", code);
            code
        }
        Err(e) => {
            tracing::error!("LXDRunner failed: {:#}", e);
            return_code::TERMINATED_ERROR
        }
    }
}
