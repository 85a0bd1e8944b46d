mod cat_cmd;
mod config_cmd;
mod publish;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use councilstore_backends::available_backends;
use councilstore_runtime_config::{CONFIG_FILE_NAME, StorageConfig};

#[derive(Parser)]
#[command(
    name = "councilstore",
    about = "Publish scraped council data through a storage backend"
)]
struct Cli {
    /// Path to the storage configuration file.
    #[arg(long, global = true, default_value = CONFIG_FILE_NAME)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stage every file under a directory and finalize one run
    Publish(publish::PublishArgs),

    /// Print a file as the backend currently stores it
    Cat(cat_cmd::CatArgs),

    /// List recognized backend kinds
    Backends,

    /// Show or initialize the configuration file
    Config(config_cmd::ConfigArgs),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Publish(args) => publish::run(&cli.config, args).await,
        Commands::Cat(args) => cat_cmd::run(&cli.config, args).await,
        Commands::Backends => {
            for name in available_backends() {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Config(args) => config_cmd::run(&cli.config, args),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// File values first, then environment overrides.
fn load_config(path: &Path) -> Result<StorageConfig> {
    let mut config = StorageConfig::load(path)
        .with_context(|| format!("load config {}", path.display()))?;
    config.apply_process_env();
    Ok(config)
}
