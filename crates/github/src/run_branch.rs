//! Per-run-branch backend over a hosted git forge.
//!
//! All councils share one repository and are isolated by folder
//! (`{council}/{scraper_object_type}/...`). Each run commits a single tree to
//! its own branch `{council}-{YYYY-MM-DD}-{suffix}`, opens a pull request
//! against the default branch and, with auto-merge on, squash-merges it and
//! cleans up branches.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Local, NaiveDate};
use councilstore_core::{
    ActiveSession, BoxFuture, Cleanup, DEFAULT_SCRAPER_OBJECT_TYPE, DurableSource,
    FinalizeOptions, Preparation, PullRequestOutcome, RelativePath, Result, RetryPolicy,
    RunBranchRun, RunResult, Session, SessionOptions, StagedFiles, StorageBackend, StorageError,
    sanitize_council_code, validate_commit_message, validate_council_code,
};
use tracing::{debug, info, warn};

use crate::client::{DEFAULT_TIMEOUT, GitHubClient};
use crate::error::ForgeError;
use crate::forge::{ContentKind, Contents, ForgeApi, TreeEntry};

type Forge<T> = std::result::Result<T, ForgeError>;

pub const README_PATH: &str = "README.md";

const README_CONTENT: &str = "# Council scraper data\n\n\
This repository holds scraped council data, one folder per council.\n";

#[derive(Debug, Clone)]
pub struct RunBranchSettings {
    pub scraper_object_type: String,
    /// Squash-merge the pull request right after opening it.
    pub auto_merge: bool,
    pub max_merge_retries: u32,
    pub disable_change_detection: bool,
    /// Retry budget for git-object writes on connection errors.
    pub network_retry: RetryPolicy,
    /// Backoff base between merge attempts that hit a conflict.
    pub merge_backoff: Duration,
}

impl Default for RunBranchSettings {
    fn default() -> Self {
        Self {
            scraper_object_type: DEFAULT_SCRAPER_OBJECT_TYPE.to_string(),
            auto_merge: true,
            max_merge_retries: 3,
            disable_change_detection: false,
            network_retry: RetryPolicy::new(3, Duration::from_secs(1)),
            merge_backoff: Duration::from_secs(1),
        }
    }
}

#[derive(Debug)]
struct RunState {
    branch: String,
    run_id_explicit: bool,
    date: String,
    folder: String,
    default_branch: String,
    existing_files: Vec<String>,
}

/// A run that reached the forge: commit on the run branch.
struct Committed {
    files_committed: usize,
    files_deleted: usize,
    commit_sha: String,
}

pub struct RunBranchStorage<F: ForgeApi = GitHubClient> {
    council_code: String,
    prefix: String,
    forge: Arc<F>,
    settings: RunBranchSettings,
    date: Option<NaiveDate>,
    active: ActiveSession,
    state: Option<RunState>,
}

impl RunBranchStorage<GitHubClient> {
    /// Backend over the GitHub REST API at `api_url`.
    pub fn connect(
        council_code: &str,
        api_url: &str,
        repository: &str,
        token: &str,
    ) -> Result<Self> {
        let client = GitHubClient::new(api_url, repository, token, DEFAULT_TIMEOUT)
            .map_err(|e| StorageError::InvalidArgument(e.to_string()))?;
        Self::new(council_code, client)
    }
}

impl<F: ForgeApi> RunBranchStorage<F> {
    pub fn new(council_code: &str, forge: F) -> Result<Self> {
        Self::with_shared_forge(council_code, Arc::new(forge))
    }

    pub fn with_shared_forge(council_code: &str, forge: Arc<F>) -> Result<Self> {
        let council_code = validate_council_code(council_code)?;
        let prefix = sanitize_council_code(&council_code)?;
        Ok(Self {
            council_code,
            prefix,
            forge,
            settings: RunBranchSettings::default(),
            date: None,
            active: ActiveSession::default(),
            state: None,
        })
    }

    pub fn with_settings(mut self, settings: RunBranchSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_date(mut self, date: NaiveDate) -> Self {
        self.date = Some(date);
        self
    }

    pub fn settings(&self) -> &RunBranchSettings {
        &self.settings
    }

    fn today(&self) -> String {
        self.date
            .unwrap_or_else(|| Local::now().date_naive())
            .format("%Y-%m-%d")
            .to_string()
    }

    fn branch_name(&self, date: &str, run_id: &str) -> String {
        format!("{}-{date}-{run_id}", self.prefix)
    }

    /// Matches `{prefix}-{YYYY-MM-DD}-{run id}` only, so councils whose code
    /// extends this one's are left alone.
    fn is_own_run_branch(&self, branch: &str) -> bool {
        let Some(rest) = branch
            .strip_prefix(self.prefix.as_str())
            .and_then(|r| r.strip_prefix('-'))
        else {
            return false;
        };
        let (Some(date), Some(run_id)) = (rest.get(..10), rest.get(10..)) else {
            return false;
        };
        NaiveDate::parse_from_str(date, "%Y-%m-%d").is_ok()
            && run_id.strip_prefix('-').is_some_and(|id| !id.is_empty())
    }

    /// Retry a git-object write on connection errors only.
    async fn with_network_retry<T, Fut>(
        &self,
        operation: &str,
        mut op: impl FnMut() -> Fut,
    ) -> Forge<T>
    where
        Fut: Future<Output = Forge<T>>,
    {
        self.settings
            .network_retry
            .run(operation, ForgeError::is_network, |_| op())
            .await
    }

    /// Every file below `folder` on `reference`. A missing folder, or an
    /// empty repository, lists as nothing.
    async fn list_existing(&self, folder: &str, reference: &str) -> Forge<Vec<String>> {
        let mut files = Vec::new();
        let mut pending = vec![folder.to_string()];
        while let Some(current) = pending.pop() {
            match self.forge.get_contents(&current, reference).await {
                Ok(Contents::Dir(entries)) => {
                    for entry in entries {
                        match entry.kind {
                            ContentKind::File => files.push(entry.path),
                            ContentKind::Dir => pending.push(entry.path),
                        }
                    }
                }
                Ok(Contents::File(_)) => files.push(current),
                Err(e) if e.is_not_found() || e.is_conflict() => {}
                Err(e) => return Err(e),
            }
        }
        files.sort();
        Ok(files)
    }

    /// Default-branch tip, bootstrapping an empty repository with a README.
    async fn default_branch_tip(&self, default_branch: &str) -> Forge<String> {
        match self.forge.get_branch_sha(default_branch).await {
            Err(e) if e.is_conflict() => {
                let info = self.forge.get_repository().await?;
                if info.size != 0 {
                    return Err(e);
                }
                info!(
                    repository = self.forge.repository(),
                    "repository is empty, creating initial commit"
                );
                self.forge
                    .put_contents(README_PATH, README_CONTENT.as_bytes(), "Initial commit")
                    .await?;
                self.forge.get_branch_sha(default_branch).await
            }
            other => other,
        }
    }

    /// Create the run branch at the default-branch tip and return its base sha.
    /// A name collision (422) picks a fresh suffix once.
    async fn create_run_branch(&self, state: &mut RunState) -> Forge<String> {
        let base = self.default_branch_tip(&state.default_branch).await?;
        match self.forge.create_ref(&state.branch, &base).await {
            Ok(()) => {}
            Err(e) if e.is_unprocessable() && !state.run_id_explicit => {
                let renamed = self.branch_name(&state.date, &generate_run_id());
                warn!(
                    branch = %state.branch,
                    renamed = %renamed,
                    error = %e,
                    "run branch collided, renaming"
                );
                state.branch = renamed;
                self.forge.create_ref(&state.branch, &base).await?;
            }
            Err(e) => return Err(e),
        }
        info!(branch = %state.branch, base = %base, "created run branch");
        Ok(base)
    }

    /// Whether committing `staged` would change the default branch. Errors
    /// count as changes.
    async fn has_changes(
        &self,
        state: &RunState,
        staged: &[(String, Vec<u8>)],
        deletions: usize,
    ) -> bool {
        if deletions > 0 {
            debug!(deletions, "changes detected: files to delete");
            return true;
        }
        for (path, content) in staged {
            match self.forge.get_contents(path, &state.default_branch).await {
                Ok(Contents::File(existing)) if existing == *content => {}
                Ok(_) => {
                    debug!(path, "changes detected: new or modified file");
                    return true;
                }
                Err(e) if e.is_not_found() || e.is_conflict() => {
                    debug!(path, "changes detected: new file");
                    return true;
                }
                Err(e) => {
                    warn!(path, error = %e, "change detection failed, assuming changes exist");
                    return true;
                }
            }
        }
        false
    }

    async fn commit_run(
        &self,
        state: &mut RunState,
        staged: &[(String, Vec<u8>)],
        deletions: &[String],
        message: &str,
    ) -> Forge<Committed> {
        let base = self.create_run_branch(state).await?;
        let base_tree = self.forge.get_commit_tree(&base).await?;

        let mut entries = Vec::with_capacity(staged.len() + deletions.len());
        for (path, content) in staged {
            let sha = self
                .with_network_retry("create blob", || self.forge.create_blob(content))
                .await?;
            entries.push(TreeEntry::blob(path.clone(), sha));
        }
        entries.extend(deletions.iter().map(TreeEntry::deletion));

        let tree = self
            .with_network_retry("create tree", || self.forge.create_tree(&base_tree, &entries))
            .await?;
        let parents = [base];
        let commit_sha = self
            .with_network_retry("create commit", || {
                self.forge.create_commit(message, &tree, &parents)
            })
            .await?;
        self.with_network_retry("update ref", || {
            self.forge.update_ref(&state.branch, &commit_sha)
        })
        .await?;

        info!(
            branch = %state.branch,
            commit = %commit_sha,
            files = staged.len(),
            deleted = deletions.len(),
            "committed run"
        );
        Ok(Committed {
            files_committed: staged.len(),
            files_deleted: deletions.len(),
            commit_sha,
        })
    }

    /// Open the pull request and, with auto-merge on, squash-merge it,
    /// retrying 409 conflicts with backoff.
    async fn open_pull_request(&self, state: &RunState, max_retries: u32) -> PullRequestOutcome {
        let title = format!("Merge {} data ({})", self.council_code, state.date);
        let body = format!(
            "Automated merge of {} scraper data for {}",
            self.council_code, state.date
        );
        let pr = match self
            .forge
            .create_pull_request(&title, &state.branch, &state.default_branch, &body)
            .await
        {
            Ok(pr) => pr,
            Err(e) => {
                warn!(branch = %state.branch, error = %e, "pull request creation failed");
                return PullRequestOutcome {
                    success: false,
                    pr_number: None,
                    pr_url: None,
                    merged: false,
                    attempts: 1,
                    error: Some(e.to_string()),
                };
            }
        };
        info!(branch = %state.branch, pr = pr.number, url = %pr.html_url, "opened pull request");

        let mut outcome = PullRequestOutcome {
            success: true,
            pr_number: Some(pr.number),
            pr_url: Some(pr.html_url),
            merged: false,
            attempts: 1,
            error: None,
        };
        if !self.settings.auto_merge {
            return outcome;
        }

        let policy = RetryPolicy::new(max_retries + 1, self.settings.merge_backoff);
        let mut attempt = 0;
        loop {
            outcome.attempts = attempt + 1;
            match self.forge.merge_pull_request(pr.number, &title).await {
                Ok(sha) => {
                    info!(pr = pr.number, commit = %sha, "squash-merged pull request");
                    outcome.merged = true;
                    return outcome;
                }
                Err(e) if e.is_conflict() && policy.allows_retry(attempt) => {
                    warn!(
                        pr = pr.number,
                        attempt = attempt + 1,
                        max_attempts = policy.max_attempts,
                        error = %e,
                        "merge conflicted, retrying"
                    );
                    policy.pause(attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(pr = pr.number, error = %e, "merge failed");
                    outcome.success = false;
                    outcome.error = Some(e.to_string());
                    return outcome;
                }
            }
        }
    }

    async fn delete_run_branch(&self, branch: &str) -> Cleanup {
        match self.forge.delete_ref(branch).await {
            Ok(()) => Cleanup::Branch {
                success: true,
                branch: branch.to_string(),
                error: None,
            },
            Err(e) => {
                warn!(branch, error = %e, "failed to delete run branch");
                Cleanup::Branch {
                    success: false,
                    branch: branch.to_string(),
                    error: Some(e.to_string()),
                }
            }
        }
    }

    /// Delete other branches carrying this council's prefix. Best effort: a
    /// concurrent run's branch can be swept too.
    async fn sweep_stale_branches(&self, current: &str) -> Cleanup {
        let prefix = format!("{}-", self.prefix);
        let branches = match self.forge.list_branches(&prefix).await {
            Ok(branches) => branches,
            Err(e) => {
                return Cleanup::Sweep {
                    cleaned_up: 0,
                    error: Some(e.to_string()),
                };
            }
        };
        let mut cleaned_up = 0;
        let stale = branches
            .iter()
            .filter(|b| b.as_str() != current && self.is_own_run_branch(b));
        for branch in stale {
            match self.forge.delete_ref(branch).await {
                Ok(()) => cleaned_up += 1,
                Err(e) => debug!(branch, error = %e, "could not delete stale branch"),
            }
        }
        if cleaned_up > 0 {
            info!(council = %self.council_code, cleaned_up, "swept stale run branches");
        }
        Cleanup::Sweep {
            cleaned_up,
            error: None,
        }
    }

    async fn finalize(
        &mut self,
        staged: StagedFiles,
        commit_message: &str,
        options: FinalizeOptions,
    ) -> Result<RunResult> {
        let mut state = self.state.take().ok_or(StorageError::UnknownSession)?;
        if staged.is_empty() {
            return Ok(RunResult::skipped("no changes"));
        }

        let staged: Vec<(String, Vec<u8>)> = staged
            .into_iter()
            .map(|(key, content)| (key.under(&state.folder), content))
            .collect();
        let keep: BTreeSet<&str> = staged.iter().map(|(p, _)| p.as_str()).collect();
        let deletions: Vec<String> = state
            .existing_files
            .iter()
            .filter(|p| !keep.contains(p.as_str()))
            .cloned()
            .collect();

        if self.settings.disable_change_detection {
            info!(council = %self.council_code, "change detection disabled, committing");
        } else if !self.has_changes(&state, &staged, deletions.len()).await {
            info!(council = %self.council_code, folder = %state.folder, "no changes detected");
            return Ok(RunResult::skipped("no changes detected"));
        }

        let committed = self
            .commit_run(&mut state, &staged, &deletions, commit_message)
            .await?;

        let mut run = RunBranchRun {
            applied: committed.files_committed,
            files_committed: committed.files_committed,
            files_deleted: committed.files_deleted,
            commit_sha: committed.commit_sha,
            branch: state.branch.clone(),
            pull_request: None,
            branch_cleanup: None,
            old_branches_cleanup: None,
        };
        if options.skip_merge {
            return Ok(RunResult::RunBranch(run));
        }

        let max_retries = options
            .max_merge_retries
            .unwrap_or(self.settings.max_merge_retries);
        let pull_request = self.open_pull_request(&state, max_retries).await;

        let (branch_cleanup, old_branches_cleanup) = if pull_request.merged {
            (
                self.delete_run_branch(&state.branch).await,
                self.sweep_stale_branches(&state.branch).await,
            )
        } else {
            let reason = if pull_request.success {
                "pr_not_merged"
            } else if pull_request.pr_number.is_some() {
                "merge_failed"
            } else {
                "pr_creation_failed"
            };
            (Cleanup::skipped(reason), Cleanup::skipped(reason))
        };
        run.pull_request = Some(pull_request);
        run.branch_cleanup = Some(branch_cleanup);
        run.old_branches_cleanup = Some(old_branches_cleanup);
        Ok(RunResult::RunBranch(run))
    }
}

impl<F: ForgeApi> StorageBackend for RunBranchStorage<F> {
    fn kind(&self) -> &'static str {
        "github"
    }

    fn council_code(&self) -> &str {
        &self.council_code
    }

    fn has_active_session(&self) -> bool {
        self.active.is_active()
    }

    async fn start_session(&mut self, options: SessionOptions) -> Result<Session> {
        self.active.ensure_available()?;

        let object_type =
            RelativePath::parse(options.object_type_or(&self.settings.scraper_object_type))?;
        let folder = object_type.under(&self.prefix);
        let (run_id, run_id_explicit) = match options.run_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => {
                let run_id = sanitize_council_code(id)
                    .map_err(|_| StorageError::InvalidArgument(format!("invalid run_id: {id:?}")))?;
                (run_id, true)
            }
            _ => (generate_run_id(), false),
        };
        let date = self.today();
        let branch = self.branch_name(&date, &run_id);

        let default_branch = self.forge.get_repository().await?.default_branch;
        let existing_files = self.list_existing(&folder, &default_branch).await?;
        debug!(folder = %folder, existing = existing_files.len(), "found files to replace");

        let source = ForgeSource {
            forge: Arc::clone(&self.forge),
            folder: folder.clone(),
            reference: default_branch.clone(),
        };
        let session = Session::new(self.council_code.clone(), branch.clone(), source)
            .with_preparation(Preparation {
                existing_files: existing_files.clone(),
                ..Preparation::default()
            });
        self.active.claim(&session);
        info!(
            council = %self.council_code,
            branch = %branch,
            folder = %folder,
            "run-branch session started"
        );
        self.state = Some(RunState {
            branch,
            run_id_explicit,
            date,
            folder,
            default_branch,
            existing_files,
        });
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

        let result = match session.take_staged() {
            Ok(staged) => self.finalize(staged, &commit_message, options).await,
            Err(e) => Err(e),
        };
        self.reset_session_state(session);
        result
    }

    fn reset_session_state(&mut self, session: &mut Session) {
        session.close();
        self.active.release();
        self.state = None;
    }
}

/// Eight hex characters of a fresh v4 uuid.
fn generate_run_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}

/// Reads unstaged paths from the default branch.
struct ForgeSource<F> {
    forge: Arc<F>,
    folder: String,
    reference: String,
}

impl<F: ForgeApi> DurableSource for ForgeSource<F> {
    fn fetch<'a>(&'a self, path: &'a RelativePath) -> BoxFuture<'a, Result<Option<Vec<u8>>>> {
        Box::pin(async move {
            let key = path.under(&self.folder);
            match self.forge.get_contents(&key, &self.reference).await {
                Ok(Contents::File(bytes)) => Ok(Some(bytes)),
                Ok(Contents::Dir(_)) => Ok(None),
                Err(e) if e.is_not_found() || e.is_conflict() => Ok(None),
                Err(e) => Err(e.into()),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryForge;
    use councilstore_core::testing::stage_records;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 3, 1).unwrap()
    }

    fn settings(auto_merge: bool) -> RunBranchSettings {
        RunBranchSettings {
            auto_merge,
            network_retry: RetryPolicy::immediate(3),
            merge_backoff: Duration::ZERO,
            ..RunBranchSettings::default()
        }
    }

    fn backend(forge: &Arc<MemoryForge>, auto_merge: bool) -> RunBranchStorage<MemoryForge> {
        RunBranchStorage::with_shared_forge("ABC", Arc::clone(forge))
            .unwrap()
            .with_settings(settings(auto_merge))
            .with_date(date())
    }

    fn run(result: RunResult) -> RunBranchRun {
        match result {
            RunResult::RunBranch(run) => run,
            other => panic!("expected run-branch result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn branch_name_has_council_date_and_suffix() {
        let forge = Arc::new(MemoryForge::new());
        let mut store = backend(&forge, true);
        let session = store.start_session(SessionOptions::default()).await.unwrap();

        let name = session.location();
        let suffix = name.strip_prefix("ABC-2025-03-01-").unwrap();
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[tokio::test]
    async fn empty_repository_is_bootstrapped_and_pr_left_open() {
        let forge = Arc::new(MemoryForge::new());
        let mut store = backend(&forge, false);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("json/x.json", "{\"a\":1}").unwrap();
        let result = store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap();

        let json = result.to_json();
        assert_eq!(json["branch_cleanup"], serde_json::json!({ "skipped": "pr_not_merged" }));
        let run = run(result);
        let pr = run.pull_request.unwrap();
        assert!(pr.success);
        assert!(!pr.merged);
        assert_eq!(pr.pr_url.as_deref(), Some("https://github.test/civic/council-data/pull/1"));

        assert_eq!(forge.count_calls("put_contents"), 1);
        assert!(forge.files("main").contains_key(README_PATH));
        assert_eq!(forge.files(&run.branch)["ABC/Data/json/x.json"], b"{\"a\":1}");
        assert!(forge.branches().contains(&run.branch));
    }

    #[tokio::test]
    async fn auto_merge_replaces_namespace_and_cleans_up() {
        let forge = Arc::new(MemoryForge::new());
        forge.seed(
            "main",
            &[
                ("README.md", "r"),
                ("ABC/Councillors/A.json", "old"),
                ("ABC/Councillors/C.json", "gone"),
                ("XYZ/Councillors/A.json", "other council"),
            ],
        );
        forge.seed_branch("ABC-2025-02-01-00000000");
        forge.seed_branch("XYZ-2025-02-01-00000000");
        let mut store = backend(&forge, true);

        let mut session = store
            .start_session(SessionOptions::for_object_type("Councillors"))
            .await
            .unwrap();
        assert_eq!(
            session.preparation().existing_files,
            vec!["ABC/Councillors/A.json", "ABC/Councillors/C.json"]
        );
        assert_eq!(session.read_text("C.json").await.unwrap(), "gone");

        session.write("A.json", "new").unwrap();
        session.write("B.json", "added").unwrap();
        let run = run(store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap());

        assert_eq!(run.files_committed, 2);
        assert_eq!(run.files_deleted, 1);
        assert!(run.pull_request.unwrap().merged);
        assert!(matches!(run.branch_cleanup, Some(Cleanup::Branch { success: true, .. })));
        assert_eq!(
            run.old_branches_cleanup,
            Some(Cleanup::Sweep { cleaned_up: 1, error: None })
        );

        let main = forge.files("main");
        assert_eq!(main["ABC/Councillors/A.json"], b"new");
        assert_eq!(main["ABC/Councillors/B.json"], b"added");
        assert!(!main.contains_key("ABC/Councillors/C.json"));
        assert_eq!(main["XYZ/Councillors/A.json"], b"other council");
        assert_eq!(forge.branches(), vec!["XYZ-2025-02-01-00000000", "main"]);
    }

    #[tokio::test]
    async fn sweep_skips_councils_whose_code_extends_this_one() {
        let forge = Arc::new(MemoryForge::new());
        forge.seed("main", &[("README.md", "r")]);
        forge.seed_branch("ABC-2025-02-01-00000000");
        forge.seed_branch("ABC-X-2025-03-01-1a2b3c4d");
        forge.seed_branch("ABC-notes");
        let mut store = backend(&forge, true);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.json", "1").unwrap();
        let run = run(store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap());

        assert_eq!(
            run.old_branches_cleanup,
            Some(Cleanup::Sweep { cleaned_up: 1, error: None })
        );
        assert_eq!(
            forge.branches(),
            vec!["ABC-X-2025-03-01-1a2b3c4d", "ABC-notes", "main"]
        );
    }

    #[test]
    fn own_run_branches_need_a_date_and_run_id() {
        let forge = Arc::new(MemoryForge::new());
        let store = backend(&forge, true);
        assert!(store.is_own_run_branch("ABC-2025-03-01-1a2b3c4d"));
        assert!(store.is_own_run_branch("ABC-2025-03-01-nightly-run"));
        assert!(!store.is_own_run_branch("ABC-X-2025-03-01-1a2b3c4d"));
        assert!(!store.is_own_run_branch("ABC-2025-03-01"));
        assert!(!store.is_own_run_branch("ABC-2025-13-01-1a2b3c4d"));
        assert!(!store.is_own_run_branch("ABCD-2025-03-01-1a2b3c4d"));
    }

    #[tokio::test]
    async fn identical_content_is_skipped() {
        let forge = Arc::new(MemoryForge::new());
        forge.seed("main", &[("ABC/Data/a.json", "1")]);
        let mut store = backend(&forge, true);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.json", "1").unwrap();
        let result = store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap();
        assert_eq!(result, RunResult::skipped("no changes detected"));
        assert_eq!(forge.count_calls("create_ref"), 0);
        assert!(!store.has_active_session());
    }

    #[tokio::test]
    async fn change_detection_can_be_disabled() {
        let forge = Arc::new(MemoryForge::new());
        forge.seed("main", &[("ABC/Data/a.json", "1")]);
        let mut store = backend(&forge, true).with_settings(RunBranchSettings {
            disable_change_detection: true,
            ..settings(true)
        });

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.json", "1").unwrap();
        let result = store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap();
        assert_eq!(result.applied(), 1);
    }

    #[tokio::test]
    async fn connection_errors_on_writes_are_retried() {
        let forge = Arc::new(MemoryForge::new());
        forge.seed("main", &[("README.md", "r")]);
        let mut store = backend(&forge, true);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        stage_records(&mut session, "json", 2).unwrap();
        forge.fail_next_writes(2);
        let run = run(store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap());
        assert_eq!(run.files_committed, 2);
        assert_eq!(forge.count_calls("create_blob"), 4);
    }

    #[tokio::test]
    async fn exhausted_network_retries_raise_and_reset() {
        let forge = Arc::new(MemoryForge::new());
        forge.seed("main", &[("README.md", "r")]);
        let mut store = backend(&forge, true);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.json", "1").unwrap();
        forge.fail_next_writes(3);
        let err = store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!store.has_active_session());
        assert!(!session.is_open());
    }

    #[tokio::test]
    async fn merge_conflicts_retry_then_report_failure() {
        let forge = Arc::new(MemoryForge::new());
        forge.seed("main", &[("README.md", "r")]);
        let mut store = backend(&forge, true);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.json", "1").unwrap();
        forge.conflict_next_merges(2);
        let merged = run(store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap());
        let pr = merged.pull_request.unwrap();
        assert!(pr.merged);
        assert_eq!(pr.attempts, 3);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.json", "2").unwrap();
        forge.conflict_next_merges(10);
        let failed = run(store
            .end_session(
                &mut session,
                "scrape run",
                FinalizeOptions {
                    max_merge_retries: Some(1),
                    ..FinalizeOptions::default()
                },
            )
            .await
            .unwrap());
        let pr = failed.pull_request.unwrap();
        assert!(!pr.success);
        assert_eq!(pr.attempts, 2);
        assert!(pr.error.unwrap().contains("409"));
        assert_eq!(failed.branch_cleanup, Some(Cleanup::skipped("merge_failed")));
    }

    #[tokio::test]
    async fn rejected_pull_request_skips_cleanup() {
        let forge = Arc::new(MemoryForge::new());
        forge.seed("main", &[("README.md", "r")]);
        forge.reject_pull_requests();
        let mut store = backend(&forge, true);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.json", "1").unwrap();
        let run = run(store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap());
        assert!(!run.pull_request.unwrap().success);
        assert_eq!(
            run.old_branches_cleanup,
            Some(Cleanup::skipped("pr_creation_failed"))
        );
    }

    #[tokio::test]
    async fn skip_merge_commits_without_pull_request() {
        let forge = Arc::new(MemoryForge::new());
        forge.seed("main", &[("README.md", "r")]);
        let mut store = backend(&forge, true);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        session.write("a.json", "1").unwrap();
        let run = run(store
            .end_session(
                &mut session,
                "scrape run",
                FinalizeOptions {
                    skip_merge: true,
                    ..FinalizeOptions::default()
                },
            )
            .await
            .unwrap());
        assert!(run.pull_request.is_none());
        assert!(forge.pulls().is_empty());
        assert!(forge.branches().contains(&run.branch));
    }

    #[tokio::test]
    async fn colliding_branch_name_is_regenerated_once() {
        let forge = Arc::new(MemoryForge::new());
        forge.seed("main", &[("README.md", "r")]);
        let mut store = backend(&forge, false);

        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        let original = session.location().to_string();
        session.write("a.json", "1").unwrap();
        forge.reject_next_ref_creations(1);
        let run = run(store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap());
        assert_ne!(run.branch, original);
        assert!(run.branch.starts_with("ABC-2025-03-01-"));
        assert_eq!(forge.count_calls("create_ref"), 2);
    }

    #[tokio::test]
    async fn explicit_run_id_names_the_branch() {
        let forge = Arc::new(MemoryForge::new());
        let mut store = backend(&forge, false);
        let session = store
            .start_session(SessionOptions {
                run_id: Some("nightly-7".into()),
                ..SessionOptions::default()
            })
            .await
            .unwrap();
        assert_eq!(session.location(), "ABC-2025-03-01-nightly-7");
    }

    #[tokio::test]
    async fn malformed_run_id_is_named_in_the_error() {
        let forge = Arc::new(MemoryForge::new());
        let mut store = backend(&forge, false);
        let outcome = store
            .start_session(SessionOptions {
                run_id: Some("-x".into()),
                ..SessionOptions::default()
            })
            .await;
        assert!(matches!(outcome, Err(StorageError::InvalidArgument(ref m)) if m.contains("run_id")));
        assert!(!store.has_active_session());
    }

    #[tokio::test]
    async fn one_session_at_a_time() {
        let forge = Arc::new(MemoryForge::new());
        let mut store = backend(&forge, true);
        let mut session = store.start_session(SessionOptions::default()).await.unwrap();
        assert!(matches!(
            store.start_session(SessionOptions::default()).await,
            Err(StorageError::SessionAlreadyActive)
        ));

        let result = store
            .end_session(&mut session, "scrape run", FinalizeOptions::default())
            .await
            .unwrap();
        assert_eq!(result, RunResult::skipped("no changes"));
        assert!(store.start_session(SessionOptions::default()).await.is_ok());
    }
}
