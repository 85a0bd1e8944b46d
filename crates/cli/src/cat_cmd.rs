use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use clap::Args;
use councilstore_backends::get_storage_backend;
use councilstore_core::{SessionOptions, StorageBackend};

#[derive(Debug, Clone, Args)]
pub struct CatArgs {
    /// Council code whose storage is read.
    pub council: String,

    /// Relative path of the file.
    pub path: String,

    /// Backend kind, overriding the configuration.
    #[arg(long)]
    pub backend: Option<String>,

    /// Namespace folder the session would replace.
    #[arg(long)]
    pub object_type: Option<String>,
}

/// Opens a session, reads through it and drops it without committing.
///
/// Session preparation still runs, so on the daily-branch backend files in
/// the namespace folder read as cleared.
pub async fn run(config_path: &Path, args: CatArgs) -> Result<()> {
    let config = crate::load_config(config_path)?;
    let mut backend = get_storage_backend(&args.council, args.backend.as_deref(), &config)?;

    let options = SessionOptions {
        scraper_object_type: args.object_type,
        run_id: None,
    };
    let mut session = backend.start_session(options).await?;
    let read = session.read_bytes(&args.path).await;
    backend.reset_session_state(&mut session);

    let bytes = read.with_context(|| format!("read {}", args.path))?;
    let mut stdout = std::io::stdout().lock();
    stdout.write_all(&bytes).context("write stdout")?;
    stdout.flush().context("flush stdout")?;
    Ok(())
}
