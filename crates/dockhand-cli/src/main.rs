//! Dockhand CLI tool.

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "dockhand")]
#[command(about = "Build and publish container images from git repositories", long_about = None)]
struct Cli {
    /// Path to the service configuration
    #[arg(long, global = true, env = "DOCKHAND_CONFIG")]
    config: Option<PathBuf>,

    /// Log output format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Clone, build and publish one image
    Build(commands::build::BuildArgs),
    /// Validate a service configuration file
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "dockhand.kdl")]
        path: PathBuf,
    },
    /// Print the build file for a local checkout
    Render(commands::render::RenderArgs),
}

fn init_tracing(format: LogFormat) {
    // Job logs are printed by the build command; keep only their warnings here.
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,dockhand_scheduler::logs=warn"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Commands::Build(args) => {
            let config = commands::load_config(cli.config.as_deref(), &args.overrides)?;
            if !commands::build::run(config, args).await? {
                std::process::exit(1);
            }
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Render(args) => {
            let config = commands::load_config(cli.config.as_deref(), &Default::default())?;
            commands::render::run(&config, args).await?;
        }
    }

    Ok(())
}
