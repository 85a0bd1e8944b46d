use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::Args;
use councilstore_backends::get_storage_backend;
use councilstore_core::{FinalizeOptions, RunLog, Session, SessionOptions, with_session};
use tracing::info;

#[derive(Debug, Clone, Args)]
pub struct PublishArgs {
    /// Council code the run belongs to.
    pub council: String,

    /// Directory whose files are staged, keyed by their path relative to it.
    pub dir: PathBuf,

    /// Backend kind, overriding the configuration.
    #[arg(long)]
    pub backend: Option<String>,

    /// Commit message for the run.
    #[arg(long, short = 'm', default_value = "Update scraped data")]
    pub message: String,

    /// Namespace folder this run replaces.
    #[arg(long)]
    pub object_type: Option<String>,

    /// Explicit run identifier (per-run-branch backend).
    #[arg(long)]
    pub run_id: Option<String>,

    /// Commit to the working branch without opening a pull request.
    #[arg(long)]
    pub skip_merge: bool,

    /// Record a run log alongside the data.
    #[arg(long)]
    pub run_log: bool,
}

pub async fn run(config_path: &Path, args: PublishArgs) -> Result<()> {
    let config = crate::load_config(config_path)?;
    let files = collect_files(&args.dir)?;
    if files.is_empty() {
        bail!("no files under {}", args.dir.display());
    }

    let mut backend = get_storage_backend(&args.council, args.backend.as_deref(), &config)?;
    let session_options = SessionOptions {
        scraper_object_type: args.object_type,
        run_id: args.run_id,
    };
    let finalize_options = FinalizeOptions {
        run_log: args.run_log.then(RunLog::start_now),
        skip_merge: args.skip_merge,
        max_merge_retries: None,
    };

    let (staged, result) = with_session(
        &mut backend,
        &args.message,
        session_options,
        finalize_options,
        async |session: &mut Session| -> Result<usize> {
            for (relative, absolute) in &files {
                let bytes = std::fs::read(absolute)
                    .with_context(|| format!("read {}", absolute.display()))?;
                session.write_bytes(relative, bytes)?;
            }
            Ok(files.len())
        },
    )
    .await?;

    info!(council = %args.council, staged, "run finalized");
    println!("{}", serde_json::to_string_pretty(&result.to_json())?);
    Ok(())
}

/// Every regular file under `root`, sorted, as `(relative, absolute)` pairs
/// with `/`-separated relative paths.
fn collect_files(root: &Path) -> Result<Vec<(String, PathBuf)>> {
    let mut out = Vec::new();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries =
            std::fs::read_dir(&dir).with_context(|| format!("read directory {}", dir.display()))?;
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
                continue;
            }
            let relative = path
                .strip_prefix(root)
                .with_context(|| format!("{} is outside {}", path.display(), root.display()))?
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            out.push((relative, path));
        }
    }
    out.sort();
    Ok(out)
}
