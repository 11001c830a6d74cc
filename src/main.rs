//! Foreman CLI entry point.

use clap::Parser;

use foreman::cli::{handle_error, Cli, Commands};
use foreman::infrastructure::config::ConfigLoader;
use foreman::infrastructure::logging::{LogConfig, LoggerImpl};

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // `init` writes the configuration, so it starts from the defaults.
    let config = match &cli.command {
        Commands::Init(_) => Ok(foreman::Config::default()),
        _ => ConfigLoader::load(),
    };
    let config = match config {
        Ok(config) => config,
        Err(err) => handle_error(err, cli.json),
    };

    let verbose = cli.verbose || cli.command.is_long_running();
    let logger = match LoggerImpl::init(&LogConfig::for_command(&config.logging, verbose)) {
        Ok(logger) => logger,
        Err(err) => handle_error(err, cli.json),
    };

    let result = match cli.command {
        Commands::Init(args) => foreman::cli::commands::init::execute(args, cli.json).await,
        Commands::Tenant(args) => foreman::cli::commands::tenant::execute(args, config, cli.json).await,
        Commands::Task(args) => foreman::cli::commands::task::execute(args, config, cli.json).await,
        Commands::Action(args) => foreman::cli::commands::action::execute(args, config, cli.json).await,
        Commands::Sweep(args) => foreman::cli::commands::sweep::execute(args, config, cli.json).await,
        Commands::Serve(args) => foreman::cli::commands::serve::execute(args, config, cli.json).await,
    };

    // Flush buffered file logs; `handle_error` exits without running destructors.
    drop(logger);
    if let Err(err) = result {
        handle_error(err, cli.json);
    }
}
