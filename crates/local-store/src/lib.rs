//! Filesystem storage backend.
//!
//! Layout: `<data_dir>/<sanitized council code>/<relative path>`. Each
//! staged file is written to a uniquely named sibling temp file and renamed
//! over its target, so a target path never shows a truncated file. Atomicity
//! is per file only; a crash mid-finalize can leave a subset of the batch
//! applied.

use std::io::Write;
use std::path::{Path, PathBuf};

use councilstore_core::{
    ActiveSession, BoxFuture, DurableSource, FilesystemRun, FinalizeOptions, RelativePath, Result,
    RunLog, RunResult, Session, SessionOptions, StagedFiles, StorageBackend, StorageError,
    sanitize_council_code, validate_commit_message, validate_council_code,
};
use tracing::{debug, info, warn};

/// Written to the council root when finalize receives a run log.
pub const SUMMARY_FILE_NAME: &str = "scrape_summary.json";

const TEMP_PREFIX: &str = ".tmp-";

#[derive(Debug)]
pub struct LocalFilesystemStorage {
    council_code: String,
    council_root: PathBuf,
    active: ActiveSession,
}

impl LocalFilesystemStorage {
    /// Fails with `InvalidArgument` when the council code has no safe characters.
    pub fn new(council_code: &str, data_dir: impl Into<PathBuf>) -> Result<Self> {
        let council_code = validate_council_code(council_code)?;
        let safe = sanitize_council_code(&council_code)?;
        Ok(Self {
            council_root: data_dir.into().join(safe),
            council_code,
            active: ActiveSession::default(),
        })
    }

    pub fn council_root(&self) -> &Path {
        &self.council_root
    }

    async fn finalize(
        &mut self,
        session: &mut Session,
        commit_message: String,
        options: FinalizeOptions,
    ) -> Result<RunResult> {
        let staged = session.take_staged()?;
        if staged.is_empty() {
            debug!(council = %self.council_code, "nothing staged");
            return Ok(RunResult::skipped("no changes"));
        }

        let root = resolve_root(&self.council_root).await?;
        let applied = staged.len();
        let mut files = {
            let root = root.clone();
            tokio::task::spawn_blocking(move || apply_staged(&root, &staged))
                .await
                .map_err(|e| StorageError::io(&self.council_root, std::io::Error::other(e)))??
        };

        info!(council = %self.council_code, files = applied, "filesystem session committed");

        let mut summary_file = None;
        let mut summary_error = None;
        if let Some(mut run_log) = options.run_log {
            if !run_log.is_finished() {
                run_log.finish();
            }
            let summary = summary_json(&self.council_code, &commit_message, applied, &run_log);
            let root = root.clone();
            let outcome = tokio::task::spawn_blocking(move || write_summary(&root, &summary)).await;
            match outcome {
                Ok(Ok(path)) => {
                    let path = path.display().to_string();
                    files.push(path.clone());
                    summary_file = Some(path);
                }
                Ok(Err(e)) => {
                    warn!(council = %self.council_code, error = %e, "failed to write scrape summary");
                    summary_error = Some(e.to_string());
                }
                Err(e) => summary_error = Some(e.to_string()),
            }
        }

        Ok(RunResult::Filesystem(FilesystemRun {
            applied,
            root: root.display().to_string(),
            files,
            commit_message,
            summary_file,
            summary_error,
        }))
    }
}

impl StorageBackend for LocalFilesystemStorage {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn council_code(&self) -> &str {
        &self.council_code
    }

    fn has_active_session(&self) -> bool {
        self.active.is_active()
    }

    async fn start_session(&mut self, _options: SessionOptions) -> Result<Session> {
        self.active.ensure_available()?;

        tokio::fs::create_dir_all(&self.council_root)
            .await
            .map_err(|e| StorageError::io(&self.council_root, e))?;
        let root = resolve_root(&self.council_root).await?;

        let session = Session::new(
            self.council_code.clone(),
            root.display().to_string(),
            FilesystemSource { root },
        );
        self.active.claim(&session);
        debug!(council = %self.council_code, session = %session.id(), "filesystem session started");
        Ok(session)
    }

    async fn end_session(
        &mut self,
        session: &mut Session,
        commit_message: &str,
        options: FinalizeOptions,
    ) -> Result<RunResult> {
        self.active.check(session)?;
        let commit_message = validate_commit_message(commit_message)?.to_string();

        let result = self.finalize(session, commit_message, options).await;
        self.reset_session_state(session);
        result
    }

    fn reset_session_state(&mut self, session: &mut Session) {
        session.close();
        self.active.release();
    }
}

/// Reads durable files from the council root, refusing anything a symlink
/// points outside of it.
struct FilesystemSource {
    root: PathBuf,
}

impl DurableSource for FilesystemSource {
    fn fetch<'a>(&'a self, path: &'a RelativePath) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let candidate = path.to_path_under(&self.root);
            let resolved = match tokio::fs::canonicalize(&candidate).await {
                Ok(resolved) => resolved,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(StorageError::io(&candidate, e)),
            };
            if !resolved.starts_with(&self.root) {
                return Err(escapes_root(path.as_str()));
            }

            let metadata = tokio::fs::metadata(&resolved)
                .await
                .map_err(|e| StorageError::io(&resolved, e))?;
            if !metadata.is_file() {
                return Ok(None);
            }
            tokio::fs::read(&resolved)
                .await
                .map(Some)
                .map_err(|e| StorageError::io(&resolved, e))
        })
    }
}

async fn resolve_root(root: &Path) -> Result<PathBuf> {
    tokio::fs::canonicalize(root)
        .await
        .map_err(|e| StorageError::io(root, e))
}

fn escapes_root(path: &str) -> StorageError {
    StorageError::InvalidPath {
        path: path.to_string(),
        reason: "path resolves outside the storage root",
    }
}

/// Write every staged file, removing this batch's earlier writes if one fails.
fn apply_staged(root: &Path, staged: &StagedFiles) -> Result<Vec<String>> {
    let mut written: Vec<PathBuf> = Vec::with_capacity(staged.len());
    for (key, data) in staged {
        let target = key.to_path_under(root);
        if let Err(e) = write_atomic(root, key.as_str(), &target, data) {
            for path in &written {
                if let Err(cleanup) = std::fs::remove_file(path) {
                    debug!(path = %path.display(), error = %cleanup, "rollback skipped file");
                }
            }
            return Err(e);
        }
        written.push(target);
    }
    Ok(written.iter().map(|p| p.display().to_string()).collect())
}

fn write_atomic(root: &Path, key: &str, target: &Path, data: &[u8]) -> Result<()> {
    let parent = target.parent().unwrap_or(root);
    ensure_within(root, key, parent)?;
    std::fs::create_dir_all(parent).map_err(|e| StorageError::io(parent, e))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)
        .map_err(|e| StorageError::io(parent, e))?;
    tmp.write_all(data)
        .and_then(|()| tmp.as_file().sync_all())
        .map_err(|e| StorageError::io(tmp.path(), e))?;
    tmp.persist(target)
        .map_err(|e| StorageError::io(target, e.error))?;
    Ok(())
}

/// Check the deepest existing ancestor of `dir` resolves inside `root`.
fn ensure_within(root: &Path, key: &str, dir: &Path) -> Result<()> {
    let mut existing = dir;
    while !existing.exists() {
        match existing.parent() {
            Some(parent) => existing = parent,
            None => return Err(escapes_root(key)),
        }
    }
    let resolved = existing
        .canonicalize()
        .map_err(|e| StorageError::io(existing, e))?;
    if resolved.starts_with(root) {
        Ok(())
    } else {
        Err(escapes_root(key))
    }
}

fn summary_json(
    council_code: &str,
    commit_message: &str,
    files_written: usize,
    run_log: &RunLog,
) -> serde_json::Value {
    let mut summary = serde_json::json!({
        "council": council_code,
        "commit_message": commit_message,
        "files_written": files_written,
        "summary": "Local filesystem scrape completed",
    });
    if let (Some(obj), Ok(serde_json::Value::Object(fields))) =
        (summary.as_object_mut(), serde_json::to_value(run_log))
    {
        obj.extend(fields);
    }
    summary
}

fn write_summary(root: &Path, summary: &serde_json::Value) -> Result<PathBuf> {
    let bytes = serde_json::to_vec_pretty(summary)?;
    let target = root.join(SUMMARY_FILE_NAME);
    write_atomic(root, SUMMARY_FILE_NAME, &target, &bytes)?;
    Ok(target)
}

#[cfg(test)]
mod tests {
    use super::*;
    use councilstore_core::testing::stage_records;
    use councilstore_core::{OpenMode, with_session};

    fn storage(dir: &tempfile::TempDir, council: &str) -> LocalFilesystemStorage {
        LocalFilesystemStorage::new(council, dir.path()).unwrap()
    }

    #[test]
    fn council_code_is_sanitized() {
        let dir = tempfile::tempdir().unwrap();
        let store = storage(&dir, "a.b/c");
        assert_eq!(store.council_root(), dir.path().join("abc"));
        assert!(matches!(
            LocalFilesystemStorage::new("../", dir.path()),
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(LocalFilesystemStorage::new("  ", dir.path()).is_err());
    }

    #[tokio::test]
    async fn commit_then_reopen_reads_durable_state() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = storage(&dir, "ABC");

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("Councillors/json/x.json", "{\"a\":1}").unwrap();
        let result = store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap();
        assert_eq!(result.applied(), 1);
        assert!(!store.has_active_session());

        let on_disk = std::fs::read_to_string(
            dir.path().join("ABC").join("Councillors").join("json").join("x.json"),
        )
        .unwrap();
        assert_eq!(on_disk, "{\"a\":1}");

        let session = store.start_session(SessionOptions::default()).await.unwrap();
        assert_eq!(
            session.read_text("Councillors/json/x.json").await.unwrap(),
            "{\"a\":1}"
        );
    }

    #[tokio::test]
    async fn empty_stage_is_skipped_without_writes() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = storage(&dir, "ABC");
        let mut session = store.start_session(SessionOptions::default()).await.unwrap();

        let result = store
            .end_session(&mut session, "nothing", FinalizeOptions::with_run_log(RunLog::start_now()))
            .await
            .unwrap();
        assert!(result.is_skipped());
        assert_eq!(std::fs::read_dir(dir.path().join("ABC")).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_write_rolls_back_batch_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = storage(&dir, "ABC");
        std::fs::create_dir_all(dir.path().join("ABC")).unwrap();
        std::fs::write(dir.path().join("ABC").join("blocker"), "file, not dir").unwrap();

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.txt", "new").unwrap();
        session.write("blocker/x.txt", "cannot land").unwrap();

        let err = store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Io { .. }));
        assert!(!dir.path().join("ABC").join("a.txt").exists());
        assert!(!store.has_active_session());
        assert!(!session.is_open());

        assert!(store.start_session(SessionOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn no_temp_files_left_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = storage(&dir, "ABC");
        let (paths, _) = with_session(
            &mut store,
            "scrape run",
            SessionOptions::default(),
            FinalizeOptions::default(),
            async |session: &mut Session| stage_records(session, "json", 5),
        )
        .await
        .unwrap();
        assert_eq!(paths.len(), 5);

        let leftovers: Vec<_> = std::fs::read_dir(dir.path().join("ABC").join("json"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[tokio::test]
    async fn run_log_produces_summary_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = storage(&dir, "ABC");
        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.txt", "a").unwrap();

        let result = store
            .end_session(
                &mut session,
                "  scrape run  ",
                FinalizeOptions::with_run_log(RunLog::start_now()),
            )
            .await
            .unwrap();

        let RunResult::Filesystem(run) = result else {
            panic!("expected filesystem result");
        };
        assert_eq!(run.commit_message, "scrape run");
        assert_eq!(run.files.len(), 2);
        assert!(run.summary_error.is_none());

        let summary: serde_json::Value = serde_json::from_slice(
            &std::fs::read(run.summary_file.unwrap()).unwrap(),
        )
        .unwrap();
        assert_eq!(summary["council"], "ABC");
        assert_eq!(summary["files_written"], 1);
        assert_eq!(summary["status_code"], 0);
        assert!(summary["end"].is_string());
    }

    #[tokio::test]
    async fn directories_are_not_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = storage(&dir, "ABC");
        std::fs::create_dir_all(dir.path().join("ABC").join("sub")).unwrap();
        let session = store.start_session(SessionOptions::default()).await.unwrap();
        assert!(matches!(
            session.open("sub", OpenMode::Binary).await,
            Err(StorageError::FileNotFound(_))
        ));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn symlinks_cannot_escape_the_root() {
        let dir = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret.txt"), "secret").unwrap();
        std::fs::create_dir_all(dir.path().join("ABC")).unwrap();
        std::os::unix::fs::symlink(outside.path(), dir.path().join("ABC").join("link")).unwrap();

        let mut store = storage(&dir, "ABC");
        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        assert!(matches!(
            session.read_text("link/secret.txt").await,
            Err(StorageError::InvalidPath { .. })
        ));

        session.write("link/planted.txt", "x").unwrap();
        let err = store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::InvalidPath { .. }));
        assert!(!outside.path().join("planted.txt").exists());
    }

    #[tokio::test]
    async fn second_session_rejected_until_finalized() {
        let dir = tempfile::tempdir().unwrap();
        let mut store = storage(&dir, "ABC");
        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        assert!(matches!(
            store.start_session(SessionOptions::default()).await,
            Err(StorageError::SessionAlreadyActive)
        ));
        store
            .end_session(&mut session, "done", FinalizeOptions::default())
            .await
            .unwrap();
        assert!(store.start_session(SessionOptions::default()).await.is_ok());
    }
}
