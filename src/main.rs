use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use sandboxer::config::CONFIG_FILE;
use sandboxer::{Config, SandboxManager};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod commands;

#[derive(Parser)]
#[command(name = "sandboxer")]
#[command(
    author,
    version,
    about = "Isolated, resource-accounted execution environments"
)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Configuration file
    #[arg(long, global = true, env = "SANDBOXER_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Directory sandboxes are created under (overrides the config file)
    #[arg(long, global = true, env = "SANDBOXER_BASE_DIR")]
    base_dir: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a persistent sandbox
    Create(commands::create::CreateArgs),

    /// Run a command in an existing sandbox
    Exec(commands::exec::ExecArgs),

    /// Run a command in a throwaway sandbox
    Run(commands::run::RunArgs),

    /// List sandboxes
    List(commands::list::ListArgs),

    /// Destroy a sandbox
    Cleanup(commands::cleanup::CleanupArgs),
}

fn init_logging(verbose: bool, format: LogFormat) {
    let filter = if verbose {
        EnvFilter::new("sandboxer=debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sandboxer=info"))
    };

    // stdout belongs to command output
    match format {
        LogFormat::Text => tracing_subscriber::registry()
            .with(fmt::layer().with_writer(std::io::stderr))
            .with(filter)
            .init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .with(filter)
            .init(),
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.log_format);

    let mut config = Config::load(&cli.config)?;
    if let Some(base_dir) = cli.base_dir {
        config = config.with_base_dir(base_dir);
    }

    let manager = SandboxManager::new(config)
        .await
        .context("Failed to start sandbox manager")?;

    let outcome = match cli.command {
        Commands::Create(args) => commands::create::run(&manager, args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Exec(args) => commands::exec::run(&manager, args).await,
        Commands::Run(args) => commands::run::run(&manager, args).await,
        Commands::List(args) => commands::list::run(&manager, args)
            .await
            .map(|()| ExitCode::SUCCESS),
        Commands::Cleanup(args) => commands::cleanup::run(&manager, args)
            .await
            .map(|()| ExitCode::SUCCESS),
    };

    manager.shutdown().await;
    outcome
}
