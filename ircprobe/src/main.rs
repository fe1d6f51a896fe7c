use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::info;

mod app;

#[derive(Parser, Debug)]
#[command(author, version, about = "ircprobe - end-to-end IRC client harness", long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<String>,

    /// Host port to publish the server on (0 picks a free one)
    #[arg(short, long)]
    port: Option<u16>,

    /// Server image to run
    #[arg(short, long)]
    image: Option<String>,

    /// Leave the server running after the run
    #[arg(long)]
    keep_server: bool,

    /// Keep the artifact directory after the run
    #[arg(long)]
    keep_artifacts: bool,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    info!("Starting ircprobe v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let loaded = match &args.config {
        Some(config_path) => ircprobe_core::Config::load_from_path(config_path),
        None => Ok(ircprobe_core::Config::load_or_default()),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ircprobe: {e}");
            return Ok(ExitCode::from(e.exit_code()));
        }
    };

    // Override with CLI arguments
    if let Some(port) = args.port {
        config.server.port = port;
    }
    if let Some(image) = args.image {
        config.server.image = image;
    }
    config.server.keep |= args.keep_server;
    config.artifacts.keep |= args.keep_artifacts;

    if args.print_config {
        print!("{}", toml::to_string_pretty(&config)?);
        return Ok(ExitCode::SUCCESS);
    }

    app::run(config).await
}
