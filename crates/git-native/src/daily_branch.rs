//! Daily-branch repository backend.
//!
//! One repository per council, one working branch per council per day
//! (`{council}-{YYYY-MM-DD}`). A session replaces everything under its
//! namespace folder: preparation deletes the folder's files on the day
//! branch, finalize commits the staged files in parent-chained batches, then
//! squash-merges the day branch into main and deletes it. A run that
//! commits nothing puts the day branch back the way the session found it.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use councilstore_core::{
    ActiveSession, BatchCommit, BoxFuture, BranchDeletion, DailyBranchRun, DurableSource,
    Finalization, FinalizeOptions, Logbook, LogbookUpdate, MergeReport, Preparation,
    RelativePath, Result, RetryPolicy, RunLog, RunResult, Session, SessionOptions,
    StorageBackend, StorageError, DEFAULT_SCRAPER_OBJECT_TYPE, sanitize_council_code,
    validate_commit_message, validate_council_code,
};
use tracing::{debug, info, warn};

use crate::error::RepositoryError;
use crate::repository::{CommitRequest, PutFile, RepositoryService, list_files_recursive};
use crate::service::GitRepositoryService;

pub const LOGBOOK_FILE_NAME: &str = "logbook.json";

/// File operations per commit accepted by the repository service.
pub const MAX_FILES_PER_COMMIT: usize = 100;

#[derive(Debug, Clone)]
pub struct DailyBranchSettings {
    pub main_branch: String,
    pub batch_size: usize,
    pub scraper_object_type: String,
    /// Attempts per commit when the branch head moved underneath us.
    pub conflict_retry: RetryPolicy,
}

impl Default for DailyBranchSettings {
    fn default() -> Self {
        Self {
            main_branch: "main".to_string(),
            batch_size: MAX_FILES_PER_COMMIT,
            scraper_object_type: DEFAULT_SCRAPER_OBJECT_TYPE.to_string(),
            conflict_retry: RetryPolicy::new(3, Duration::from_millis(500)),
        }
    }
}

/// Per-session addressing: the day branch and its cached head.
#[derive(Debug)]
struct BranchState {
    branch: String,
    namespace: String,
    date: String,
    head: Option<String>,
    /// Head before preparation touched the branch.
    origin: Option<String>,
    /// The branch was created by this session.
    created: bool,
}

/// Day branch head as resolved at session start.
struct DayHead {
    id: Option<String>,
    created: bool,
}

type Repo<T> = std::result::Result<T, RepositoryError>;

pub struct DailyBranchStorage<S: RepositoryService = GitRepositoryService> {
    council_code: String,
    repository: String,
    service: Arc<S>,
    settings: DailyBranchSettings,
    date: Option<NaiveDate>,
    active: ActiveSession,
    state: Option<BranchState>,
}

impl DailyBranchStorage<GitRepositoryService> {
    /// Backend over bare repositories under `root`.
    pub fn open(council_code: &str, root: impl Into<PathBuf>) -> Result<Self> {
        Self::new(council_code, GitRepositoryService::new(root))
    }
}

impl<S: RepositoryService> DailyBranchStorage<S> {
    pub fn new(council_code: &str, service: S) -> Result<Self> {
        Self::with_shared_service(council_code, Arc::new(service))
    }

    pub fn with_shared_service(council_code: &str, service: Arc<S>) -> Result<Self> {
        let council_code = validate_council_code(council_code)?;
        let repository = sanitize_council_code(&council_code)?;
        Ok(Self {
            council_code,
            repository,
            service,
            settings: DailyBranchSettings::default(),
            date: None,
            active: ActiveSession::default(),
            state: None,
        })
    }

    pub fn with_settings(mut self, mut settings: DailyBranchSettings) -> Self {
        settings.batch_size = settings.batch_size.clamp(1, MAX_FILES_PER_COMMIT);
        self.settings = settings;
        self
    }

    /// Pin the calendar date used for branch names.
    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn repository(&self) -> &str {
        &self.repository
    }

    pub fn branch_name_for(&self, date: &str) -> String {
        format!("{}-{date}", self.repository)
    }

    fn today(&self) -> String {
        self.date
            .unwrap_or_else(|| Local::now().date_naive())
            .format("%Y-%m-%d")
            .to_string()
    }

    /// Run a blocking service call off the async runtime.
    async fn call<T, F>(&self, f: F) -> Repo<T>
    where
        T: Send + 'static,
        F: FnOnce(&S, &str) -> Repo<T> + Send + 'static,
    {
        let service = Arc::clone(&self.service);
        let repository = self.repository.clone();
        tokio::task::spawn_blocking(move || f(&service, &repository))
            .await
            .map_err(|e| RepositoryError::Unavailable(e.to_string()))?
    }

    async fn ensure_repository(&self) -> Repo<()> {
        if self.call(|s, r| s.repository_exists(r)).await? {
            return Ok(());
        }
        match self.call(|s, r| s.create_repository(r)).await {
            Ok(()) => {
                info!(repository = %self.repository, "created repository");
                Ok(())
            }
            Err(RepositoryError::RepositoryExists(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Current head of `branch`, creating it from main when missing.
    /// `None` when main does not exist yet; the first commit creates the branch.
    async fn resolve_head(&self, branch: &str) -> Repo<DayHead> {
        let name = branch.to_string();
        match self.call(move |s, r| s.get_branch(r, &name)).await {
            Ok(id) => {
                return Ok(DayHead {
                    id: Some(id),
                    created: false,
                });
            }
            Err(RepositoryError::BranchNotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let main = self.settings.main_branch.clone();
        let main_tip = match self.call(move |s, r| s.get_branch(r, &main)).await {
            Ok(id) => id,
            Err(RepositoryError::BranchNotFound(_)) => {
                debug!(branch, "main branch missing, deferring branch creation");
                return Ok(DayHead {
                    id: None,
                    created: false,
                });
            }
            Err(e) => return Err(e),
        };

        let (name, tip) = (branch.to_string(), main_tip.clone());
        match self.call(move |s, r| s.create_branch(r, &name, &tip)).await {
            Ok(()) => {
                info!(branch, from = %self.settings.main_branch, "created daily branch");
                Ok(DayHead {
                    id: Some(main_tip),
                    created: true,
                })
            }
            Err(RepositoryError::BranchExists(_)) => {
                let name = branch.to_string();
                let id = self.call(move |s, r| s.get_branch(r, &name)).await?;
                Ok(DayHead {
                    id: Some(id),
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Commit one batch on the day branch, refreshing the cached head and
    /// retrying when the parent is stale. `None` means the batch changed nothing.
    async fn commit_with_retry(
        &self,
        branch: &str,
        head: &mut Option<String>,
        put_files: Arc<[PutFile]>,
        delete_files: Arc<[String]>,
        message: &str,
    ) -> Repo<Option<String>> {
        let policy = self.settings.conflict_retry;
        let mut attempt = 0;
        loop {
            let name = branch.to_string();
            let parent = head.clone();
            let msg = message.to_string();
            let put = Arc::clone(&put_files);
            let delete = Arc::clone(&delete_files);
            let outcome = self
                .call(move |s, r| {
                    s.create_commit(
                        r,
                        &CommitRequest {
                            branch: &name,
                            parent: parent.as_deref(),
                            message: &msg,
                            put_files: &put[..],
                            delete_files: &delete[..],
                        },
                    )
                })
                .await;

            match outcome {
                Ok(commit_id) => {
                    *head = Some(commit_id.clone());
                    return Ok(Some(commit_id));
                }
                Err(RepositoryError::NoChange) => return Ok(None),
                Err(e @ RepositoryError::ParentCommitOutdated { .. })
                    if policy.allows_retry(attempt) =>
                {
                    warn!(
                        branch,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "branch head moved, refreshing and retrying"
                    );
                    policy.pause(attempt).await;
                    *head = self.resolve_head(branch).await?.id;
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Remove every file under the namespace on the day branch.
    async fn delete_existing(&self, state: &mut BranchState) -> Repo<Preparation> {
        if state.head.is_none() {
            return Ok(Preparation::default());
        }
        let (name, folder) = (state.branch.clone(), state.namespace.clone());
        let files = self
            .call(move |s, r| list_files_recursive(s, r, &name, &folder))
            .await?;
        if files.is_empty() {
            return Ok(Preparation::default());
        }

        let no_puts: Arc<[PutFile]> = Arc::from(Vec::new());
        let mut deleted = 0;
        for batch in files.chunks(self.settings.batch_size) {
            let message = format!(
                "Deleting batch of {} files from {}",
                batch.len(),
                state.namespace
            );
            let delete: Arc<[String]> = Arc::from(batch.to_vec());
            self.commit_with_retry(
                &state.branch,
                &mut state.head,
                Arc::clone(&no_puts),
                delete,
                &message,
            )
            .await?;
            deleted += batch.len();
        }

        info!(
            council = %self.council_code,
            branch = %state.branch,
            deleted,
            "removed previous namespace contents"
        );
        Ok(Preparation {
            deleted: Some(deleted),
            commit_id: state.head.clone(),
            existing_files: Vec::new(),
        })
    }

    async fn finalize(
        &mut self,
        session: &mut Session,
        commit_message: String,
        options: FinalizeOptions,
    ) -> Result<RunResult> {
        let mut state = self.state.take().ok_or(StorageError::UnknownSession)?;
        let staged = session.take_staged()?;
        if staged.is_empty() {
            self.restore_branch(&state).await;
            return Ok(RunResult::skipped("no changes"));
        }

        let files: Vec<PutFile> = staged
            .into_iter()
            .map(|(key, content)| PutFile::new(key.under(&state.namespace), content))
            .collect();
        let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
        let total = files.len();
        let batch_size = self.settings.batch_size;
        let planned = total.div_ceil(batch_size);
        let no_deletes: Arc<[String]> = Arc::from(Vec::new());

        let mut batches = Vec::new();
        for (index, chunk) in files.chunks(batch_size).enumerate() {
            let batch = index + 1;
            let message = if planned > 1 {
                format!("{commit_message} (batch {batch}/{planned})")
            } else {
                commit_message.clone()
            };
            let put: Arc<[PutFile]> = Arc::from(chunk.to_vec());
            let committed = self
                .commit_with_retry(
                    &state.branch,
                    &mut state.head,
                    put,
                    Arc::clone(&no_deletes),
                    &message,
                )
                .await?;
            match committed {
                Some(commit_id) => {
                    info!(
                        branch = %state.branch,
                        batch,
                        planned,
                        files = chunk.len(),
                        commit = %commit_id,
                        "committed batch"
                    );
                    batches.push(BatchCommit {
                        commit_id,
                        files_count: chunk.len(),
                        batch,
                    });
                }
                None => debug!(branch = %state.branch, batch, "batch had no changes"),
            }
        }

        let Some(commit_id) = batches.last().map(|b| b.commit_id.clone()) else {
            info!(council = %self.council_code, "no batch changed the branch");
            self.restore_branch(&state).await;
            return Ok(RunResult::skipped("no changes detected"));
        };

        let finalization = self.post_commit(&mut state, options.run_log).await;

        Ok(RunResult::DailyBranch(DailyBranchRun {
            applied: total,
            commit_id,
            repository: self.repository.clone(),
            branch: state.branch,
            files: paths,
            total_batches: batches.len(),
            batches,
            finalization,
        }))
    }

    /// Undo preparation for a run that commits nothing: a branch this session
    /// created is deleted, a pre-existing one is pointed back at its origin.
    /// Failures are logged only.
    async fn restore_branch(&self, state: &BranchState) {
        if !state.created && state.head == state.origin {
            return;
        }
        let name = state.branch.clone();
        if let Err(e) = self.call(move |s, r| s.delete_branch(r, &name)).await {
            if !e.is_not_found() {
                warn!(branch = %state.branch, error = %e, "failed to drop unused day branch");
                return;
            }
        }
        if !state.created {
            if let Some(origin) = state.origin.clone() {
                let name = state.branch.clone();
                if let Err(e) = self.call(move |s, r| s.create_branch(r, &name, &origin)).await {
                    warn!(branch = %state.branch, error = %e, "failed to restore day branch");
                    return;
                }
            }
        }
        info!(branch = %state.branch, created = state.created, "restored day branch after empty run");
    }

    /// Logbook, merge and branch cleanup. Failures are recorded, never raised.
    async fn post_commit(&self, state: &mut BranchState, run_log: Option<RunLog>) -> Finalization {
        let mut finalization = Finalization::default();

        if let Some(mut run_log) = run_log {
            if !run_log.is_finished() {
                run_log.finish();
            }
            match self.update_logbook(state, &run_log).await {
                Ok(update) => finalization.logbook = Some(update),
                Err(e) => {
                    warn!(council = %self.council_code, error = %e, "logbook update failed");
                    finalization.logbook_error = Some(e.to_string());
                }
            }
        }

        let merge = match self.merge_to_main(state).await {
            Ok(merge) => merge,
            Err(e) => {
                warn!(branch = %state.branch, error = %e, "merge into main failed");
                finalization.finalization_error = Some(e.to_string());
                return finalization;
            }
        };
        finalization.merge = Some(merge);

        let name = state.branch.clone();
        match self.call(move |s, r| s.delete_branch(r, &name)).await {
            Ok(_) => {
                finalization.branch_cleanup = Some(BranchDeletion {
                    deleted: true,
                    branch_name: state.branch.clone(),
                    reason: None,
                });
            }
            Err(RepositoryError::BranchNotFound(_)) => {
                finalization.branch_cleanup = Some(BranchDeletion {
                    deleted: false,
                    branch_name: state.branch.clone(),
                    reason: Some("branch does not exist".to_string()),
                });
            }
            Err(e) => {
                warn!(branch = %state.branch, error = %e, "failed to delete daily branch");
                finalization.finalization_error = Some(e.to_string());
            }
        }
        finalization
    }

    /// Append the run to `{namespace}/logbook.json` as read from main and
    /// commit it to the day branch.
    async fn update_logbook(
        &self,
        state: &mut BranchState,
        run_log: &RunLog,
    ) -> Result<LogbookUpdate> {
        let logbook_path = format!("{}/{LOGBOOK_FILE_NAME}", state.namespace);
        let (main, path) = (self.settings.main_branch.clone(), logbook_path.clone());
        let mut logbook = match self.call(move |s, r| s.get_file(r, &main, &path)).await {
            Ok(bytes) => Logbook::from_slice(&bytes)?,
            Err(e) if e.is_not_found() => Logbook::new(self.council_code.clone()),
            Err(e) => return Err(e.into()),
        };
        logbook.push_run(serde_json::to_value(run_log)?);

        let put: Arc<[PutFile]> =
            Arc::from(vec![PutFile::new(logbook_path.clone(), logbook.to_pretty_json()?)]);
        let message = format!("Update logbook for {}", self.council_code);
        let committed = self
            .commit_with_retry(
                &state.branch,
                &mut state.head,
                put,
                Arc::from(Vec::new()),
                &message,
            )
            .await?;

        Ok(LogbookUpdate {
            updated: committed.is_some(),
            commit_id: committed.or_else(|| state.head.clone()).unwrap_or_default(),
            logbook_path,
            runs_count: logbook.runs.len(),
        })
    }

    async fn merge_to_main(&self, state: &BranchState) -> Repo<MergeReport> {
        let commit_message = format!("{} - scraped on {}", state.namespace, state.date);
        let (source, destination, message) = (
            state.branch.clone(),
            self.settings.main_branch.clone(),
            commit_message.clone(),
        );
        let commit_id = self
            .call(move |s, r| s.merge_branches_by_squash(r, &source, &destination, &message))
            .await?;
        info!(
            branch = %state.branch,
            target = %self.settings.main_branch,
            commit = %commit_id,
            "squash-merged daily branch"
        );
        Ok(MergeReport {
            commit_id,
            source_branch: state.branch.clone(),
            target_branch: self.settings.main_branch.clone(),
            commit_message,
            repository: self.repository.clone(),
        })
    }
}

impl<S: RepositoryService> StorageBackend for DailyBranchStorage<S> {
    fn kind(&self) -> &'static str {
        "repository"
    }

    fn council_code(&self) -> &str {
        &self.council_code
    }

    fn has_active_session(&self) -> bool {
        self.active.is_active()
    }

    async fn start_session(&mut self, options: SessionOptions) -> Result<Session> {
        self.active.ensure_available()?;

        let namespace =
            RelativePath::parse(options.object_type_or(&self.settings.scraper_object_type))?
                .to_string();
        let date = self.today();
        let branch = self.branch_name_for(&date);

        self.ensure_repository().await?;
        let head = self.resolve_head(&branch).await?;
        let mut state = BranchState {
            branch,
            namespace,
            date,
            origin: head.id.clone(),
            head: head.id,
            created: head.created,
        };
        let preparation = self.delete_existing(&mut state).await?;

        let source = RepositorySource {
            service: Arc::clone(&self.service),
            repository: self.repository.clone(),
            branch: state.branch.clone(),
            namespace: state.namespace.clone(),
        };
        let session = Session::new(self.council_code.clone(), state.branch.clone(), source)
            .with_preparation(preparation);
        self.active.claim(&session);
        info!(
            council = %self.council_code,
            branch = %state.branch,
            namespace = %state.namespace,
            "daily-branch session started"
        );
        self.state = Some(state);
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
        self.state = None;
    }
}

/// Reads unstaged paths from the day branch.
struct RepositorySource<S> {
    service: Arc<S>,
    repository: String,
    branch: String,
    namespace: String,
}

impl<S: RepositoryService> DurableSource for RepositorySource<S> {
    fn fetch<'a>(&'a self, path: &'a RelativePath) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let service = Arc::clone(&self.service);
            let repository = self.repository.clone();
            let branch = self.branch.clone();
            let key = path.under(&self.namespace);
            let outcome =
                tokio::task::spawn_blocking(move || service.get_file(&repository, &branch, &key))
                    .await
                    .map_err(|e| StorageError::from(RepositoryError::Unavailable(e.to_string())))?;
            match outcome {
                Ok(bytes) => Ok(Some(bytes)),
                Err(e) if e.is_not_found() => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryRepositoryService;
    use councilstore_core::testing::stage_records;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    fn settings() -> DailyBranchSettings {
        DailyBranchSettings {
            conflict_retry: RetryPolicy::immediate(3),
            ..DailyBranchSettings::default()
        }
    }

    fn backend(
        council: &str,
        service: &Arc<MemoryRepositoryService>,
    ) -> DailyBranchStorage<MemoryRepositoryService> {
        DailyBranchStorage::with_shared_service(council, Arc::clone(service))
            .unwrap()
            .with_settings(settings())
            .with_date(date())
    }

    fn daily(result: RunResult) -> DailyBranchRun {
        match result {
            RunResult::DailyBranch(run) => run,
            other => panic!("expected daily-branch result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn creates_day_branch_and_commits_in_batches() {
        let service = Arc::new(MemoryRepositoryService::new());
        service.seed("XYZ", "main", &[("README.md", "hello")]);
        let mut store = backend("XYZ", &service);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        assert_eq!(session.location(), "XYZ-2025-03-01");
        assert!(service.branches("XYZ").contains(&"XYZ-2025-03-01".to_string()));

        stage_records(&mut session, "json", 150).unwrap();
        let run = daily(
            store
                .end_session(&mut session, "scrape run", FinalizeOptions::default())
                .await
                .unwrap(),
        );

        assert_eq!(run.applied, 150);
        assert_eq!(run.total_batches, 2);
        assert_eq!(run.batches[0].files_count, 100);
        assert_eq!(run.batches[1].files_count, 50);
        assert_eq!(run.branch, "XYZ-2025-03-01");
        assert!(run.files.iter().all(|f| f.starts_with("Data/json/")));

        let merge = run.finalization.merge.expect("merged");
        assert_eq!(merge.target_branch, "main");
        assert_eq!(merge.commit_message, "Data - scraped on 2025-03-01");
        assert!(run.finalization.branch_cleanup.unwrap().deleted);
        assert!(run.finalization.finalization_error.is_none());

        assert_eq!(service.files("XYZ", "main").len(), 151);
        assert_eq!(service.branches("XYZ"), vec!["main"]);
        assert!(!store.has_active_session());
    }

    #[tokio::test]
    async fn batch_messages_are_numbered() {
        let service = Arc::new(MemoryRepositoryService::new());
        service.seed("XYZ", "main", &[("README.md", "hello")]);
        let mut store = backend("XYZ", &service);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        stage_records(&mut session, "json", 101).unwrap();
        store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap();

        // The day branch is gone; its commits remain reachable only through
        // the merge, so inspect the call log instead.
        assert_eq!(service.count_calls("create_commit"), 2);
        assert_eq!(service.history("XYZ", "main")[0], "Data - scraped on 2025-03-01");
    }

    #[tokio::test]
    async fn namespace_is_replaced_not_merged() {
        let service = Arc::new(MemoryRepositoryService::new());
        service.seed(
            "ABC",
            "main",
            &[
                ("Councillors/A.json", "old"),
                ("Councillors/C.json", "gone"),
                ("Polling/P.json", "other namespace"),
            ],
        );
        let mut store = backend("ABC", &service);

        let mut session = store
            .start_session(SessionOptions::for_object_type("Councillors"))
            .await
            .unwrap();
        assert_eq!(session.preparation().deleted, Some(2));
        assert!(matches!(
            session.read_text("C.json").await,
            Err(StorageError::FileNotFound(_))
        ));

        session.write("A.json", "new").unwrap();
        session.write("B.json", "added").unwrap();
        store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap();

        let main = service.files("ABC", "main");
        let paths: Vec<&str> = main.keys().map(String::as_str).collect();
        assert_eq!(
            paths,
            vec!["Councillors/A.json", "Councillors/B.json", "Polling/P.json"]
        );
        assert_eq!(main["Councillors/A.json"], b"new");
    }

    #[tokio::test]
    async fn empty_repository_defers_branch_until_first_commit() {
        let service = Arc::new(MemoryRepositoryService::new());
        let mut store = backend("NEW", &service);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        assert!(service.branches("NEW").is_empty());
        assert_eq!(session.preparation(), &Preparation::default());

        session.write("a.json", "{}").unwrap();
        let run = daily(
            store
                .end_session(&mut session, "first scrape", FinalizeOptions::default())
                .await
                .unwrap(),
        );
        assert_eq!(run.total_batches, 1);
        assert!(run.finalization.merge.is_some());
        assert_eq!(service.files("NEW", "main")["Data/a.json"], b"{}");
    }

    #[tokio::test]
    async fn stale_parent_is_retried_with_fresh_head() {
        let service = Arc::new(MemoryRepositoryService::new());
        service.seed("ABC", "main", &[("README.md", "r")]);
        let mut store = backend("ABC", &service);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.json", "1").unwrap();
        service.fail_next_commits_with_outdated_parent(2);

        let run = daily(
            store
                .end_session(&mut session, "scrape run", FinalizeOptions::default())
                .await
                .unwrap(),
        );
        assert_eq!(run.total_batches, 1);
        assert_eq!(service.count_calls("create_commit"), 3);
    }

    #[tokio::test]
    async fn persistent_conflict_raises_and_resets() {
        let service = Arc::new(MemoryRepositoryService::new());
        service.seed("ABC", "main", &[("README.md", "r")]);
        let mut store = backend("ABC", &service);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.json", "1").unwrap();
        service.fail_next_commits_with_outdated_parent(3);

        let err = store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!store.has_active_session());
        assert!(store.start_session(SessionOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn all_batches_without_changes_skip_post_steps() {
        let service = Arc::new(MemoryRepositoryService::new());
        service.seed("ABC", "main", &[("README.md", "r")]);
        let mut store = backend("ABC", &service);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        stage_records(&mut session, "json", 120).unwrap();
        service.report_no_change_for_next_commits(2);

        let result = store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap();
        assert_eq!(result, RunResult::skipped("no changes detected"));
        assert_eq!(service.count_calls("merge_branches_by_squash"), 0);
        assert_eq!(service.branches("ABC"), vec!["main"]);
    }

    #[tokio::test]
    async fn empty_run_drops_the_day_branch_it_created() {
        let service = Arc::new(MemoryRepositoryService::new());
        service.seed("ABC", "main", &[("Data/json/x.json", "{}")]);
        let mut store = backend("ABC", &service);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        assert_eq!(session.preparation().deleted, Some(1));
        assert!(service.branches("ABC").contains(&"ABC-2025-03-01".to_string()));

        let result = store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap();
        assert_eq!(result, RunResult::skipped("no changes"));
        assert_eq!(service.branches("ABC"), vec!["main"]);
        assert_eq!(service.files("ABC", "main")["Data/json/x.json"], b"{}");
        assert!(store.start_session(SessionOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn empty_run_restores_an_existing_day_branch() {
        let service = Arc::new(MemoryRepositoryService::new());
        service.seed("ABC", "main", &[("README.md", "r")]);
        service.seed("ABC", "ABC-2025-03-01", &[("Data/a.json", "kept")]);
        let mut store = backend("ABC", &service);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        assert_eq!(session.preparation().deleted, Some(1));
        store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap();

        assert_eq!(service.files("ABC", "ABC-2025-03-01")["Data/a.json"], b"kept");
        assert_eq!(service.history("ABC", "ABC-2025-03-01").len(), 1);
        assert_eq!(service.count_calls("create_branch"), 1);
    }

    #[tokio::test]
    async fn merge_failure_is_reported_not_raised() {
        let service = Arc::new(MemoryRepositoryService::new());
        service.seed("ABC", "main", &[("README.md", "r")]);
        let mut store = backend("ABC", &service);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.json", "1").unwrap();
        service.fail_next_merges(1);

        let run = daily(
            store
                .end_session(&mut session, "scrape run", FinalizeOptions::default())
                .await
                .unwrap(),
        );
        assert!(run.finalization.merge.is_none());
        assert!(run.finalization.branch_cleanup.is_none());
        assert!(run.finalization.finalization_error.unwrap().contains("diverged"));
        assert!(service.branches("ABC").contains(&"ABC-2025-03-01".to_string()));
        assert!(!store.has_active_session());
    }

    #[tokio::test]
    async fn logbook_appends_run_and_is_merged() {
        let service = Arc::new(MemoryRepositoryService::new());
        service.seed("ABC", "main", &[("README.md", "r")]);
        let mut store = backend("ABC", &service);

        for round in 1..=2 {
            let mut session = store.start_session(SessionOptions::default()).await.unwrap();
            session.write("a.json", &round.to_string()).unwrap();
            let run = daily(
                store
                    .end_session(
                        &mut session,
                        "scrape run",
                        FinalizeOptions::with_run_log(RunLog::start_now()),
                    )
                    .await
                    .unwrap(),
            );
            let logbook = run.finalization.logbook.expect("logbook updated");
            assert!(logbook.updated);
            assert_eq!(logbook.logbook_path, "Data/logbook.json");
            assert_eq!(logbook.runs_count, round);
        }

        let book =
            Logbook::from_slice(&service.files("ABC", "main")["Data/logbook.json"]).unwrap();
        assert_eq!(book.name, "ABC");
        assert_eq!(book.runs.len(), 2);
        assert!(book.runs[0]["end"].is_string());
    }

    #[tokio::test]
    async fn failed_preparation_leaves_no_session() {
        let service = Arc::new(MemoryRepositoryService::new());
        service.seed("ABC", "main", &[("README.md", "r")]);
        let mut store = backend("ABC", &service);

        service.fail_next_calls(1);
        assert!(store.start_session(SessionOptions::default()).await.is_err());
        assert!(!store.has_active_session());

        let _session = store.start_session(SessionOptions::default()).await.unwrap();
        assert!(matches!(
            store.start_session(SessionOptions::default()).await,
            Err(StorageError::SessionAlreadyActive)
        ));
    }

    #[tokio::test]
    async fn works_against_bare_git_repositories() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = DailyBranchStorage::open("ABC", tmp.path())
            .unwrap()
            .with_settings(settings())
            .with_date(date());

        for content in ["first", "second"] {
            let mut session = store.start_session(SessionOptions::default()).await.unwrap();
            session.write("json/x.json", content).unwrap();
            assert_eq!(session.read_text("json/x.json").await.unwrap(), content);
            let run = daily(
                store
                    .end_session(&mut session, "scrape run", FinalizeOptions::default())
                    .await
                    .unwrap(),
            );
            assert!(run.finalization.finalization_error.is_none(), "{run:?}");
        }

        let service = GitRepositoryService::new(tmp.path());
        assert_eq!(
            service.get_file("ABC", "main", "Data/json/x.json").unwrap(),
            b"second"
        );
        assert!(service.get_branch("ABC", "ABC-2025-03-01").is_err());
    }
}
