use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod commands;

use commands::{CheckConfigArgs, ExportArgs, ReportArgs, RunArgs, TriggerArgs};

#[derive(Parser, Debug)]
#[command(name = "forecast-verify")]
#[command(about = "Weather forecast verification: collect, match, score", long_about = None)]
struct Cli {
    /// Directory holding Config.toml and profile overrides
    #[arg(long, global = true, default_value = "config", env = "FCV_CONFIG_DIR")]
    config: PathBuf,

    /// Profile layered over the base file (Config.<profile>.toml)
    #[arg(long, global = true, env = "FCV_PROFILE")]
    profile: Option<String>,

    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the scheduler until interrupted
    Run(RunArgs),
    /// Run one job immediately
    Trigger(TriggerArgs),
    /// Print accuracy metrics
    Report(ReportArgs),
    /// Export deviations or metrics to CSV
    Export(ExportArgs),
    /// Load configuration and register every collector
    CheckConfig(CheckConfigArgs),
}

fn init_logging(log_file: Option<&PathBuf>) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));

    match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(std::sync::Mutex::new(file))
                .init();
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_file.as_ref())?;

    let config = commands::load_config(&cli.config, cli.profile.as_deref())?;

    match cli.command {
        Commands::Run(args) => commands::run_scheduler(config, args).await?,
        Commands::Trigger(args) => commands::run_trigger(config, args).await?,
        Commands::Report(args) => commands::run_report(config, args).await?,
        Commands::Export(args) => commands::run_export(config, args).await?,
        Commands::CheckConfig(args) => commands::run_check_config(&config, &args)?,
    }

    Ok(())
}
