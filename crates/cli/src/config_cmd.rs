use std::path::Path;

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use councilstore_backends::BackendKind;
use councilstore_runtime_config::StorageConfig;

#[derive(Debug, Clone, Args)]
pub struct ConfigArgs {
    #[command(subcommand)]
    pub action: ConfigAction,
}

#[derive(Debug, Clone, Subcommand)]
pub enum ConfigAction {
    /// Write a configuration file with defaults.
    Init {
        /// Backend kind to record in `[storage] backend`.
        #[arg(long)]
        backend: Option<String>,

        /// Replace an existing file.
        #[arg(long)]
        force: bool,
    },
    /// Show the effective configuration, environment overrides included.
    Show,
}

pub fn run(path: &Path, args: ConfigArgs) -> Result<()> {
    match args.action {
        ConfigAction::Init { backend, force } => run_init(path, backend, force),
        ConfigAction::Show => run_show(path),
    }
}

fn run_init(path: &Path, backend: Option<String>, force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("{} already exists (pass --force to replace it)", path.display());
    }

    let mut config = StorageConfig::default();
    if let Some(backend) = backend {
        let kind: BackendKind = backend.parse()?;
        config.storage.backend = kind.as_str().to_string();
    }
    config
        .save(path)
        .with_context(|| format!("write {}", path.display()))?;

    println!("config: {}", path.display());
    println!("backend: {}", config.storage.backend);
    Ok(())
}

fn run_show(path: &Path) -> Result<()> {
    let mut config = crate::load_config(path)?;
    if !config.github.token.is_empty() {
        config.github.token = "<redacted>".to_string();
    }
    let body = toml::to_string_pretty(&config).context("serialize config")?;
    println!("# {}", path.display());
    print!("{body}");
    Ok(())
}
