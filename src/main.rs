use clap::Parser;
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "fluxback")]
#[command(about = "Per-field incremental backup for InfluxDB 1.x", long_about = None)]
struct Cli {
    /// Configuration directory or a single configuration file.
    #[arg(long, short, default_value = "/config")]
    config: PathBuf,

    /// Validate configurations and check connectivity, then exit.
    #[arg(long)]
    validate_only: bool,

    /// Enable debug logging.
    #[arg(long, short)]
    verbose: bool,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "fluxback=debug"
    } else {
        "fluxback=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let code = fluxback::orchestrator::runner::run(&cli.config, cli.validate_only).await;
    std::process::exit(code);
}
