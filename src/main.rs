//! runejail - run a command inside a freshly pulled container image
//!
//! This is the main CLI entry point for runejail.

use anyhow::Context;
use clap::{Parser, Subcommand};
use runejail::config::Config;
use runejail::image::{pull_image, ImageReference, Registry};
use runejail::runtime::{IsolatedLauncher, JailRoot};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

/// runejail - minimal container launcher
#[derive(Parser)]
#[command(name = "runejail")]
#[command(author = "Evoker Industries")]
#[command(version)]
#[command(about = "Pull an image and run a command inside it", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a command inside an image
    Run {
        /// Image to run, as name[:tag]
        image: String,
        /// Command to execute inside the image
        command: String,
        /// Arguments passed to the command
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("runejail: {:#}", e);
            1
        }
    };

    // Everything owning resources has been dropped by now.
    std::process::exit(code);
}

fn init_logging(level: LevelFilter) {
    let filter = EnvFilter::default().add_directive(level.into());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn execute(cli: Cli) -> anyhow::Result<i32> {
    let config = Config::from_env().context("failed to load configuration")?;
    init_logging(config.log_level);

    match cli.command {
        Commands::Run {
            image,
            command,
            args,
        } => run(&config, &image, &command, &args).await,
    }
}

async fn run(config: &Config, image: &str, command: &str, args: &[String]) -> anyhow::Result<i32> {
    let reference = ImageReference::parse(image)?;
    let registry = Registry::new(config.registry.clone())?;
    let jail = JailRoot::create().context("failed to create jail root")?;

    pull_image(&registry, &reference, jail.path())
        .await
        .with_context(|| format!("failed to pull {}", reference))?;

    let mut launcher = IsolatedLauncher::new(jail.path(), config.launch.clone());
    let code = launcher
        .run(command, args)
        .await
        .with_context(|| format!("failed to run '{}' in {}", command, reference))?;

    if let Err(e) = jail.close() {
        tracing::warn!("Failed to remove jail root: {}", e);
    }

    Ok(code)
}
