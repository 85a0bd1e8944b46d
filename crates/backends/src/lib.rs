//! Pick a storage backend for a council from configuration.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use councilstore_core::{
    FinalizeOptions, Result, RetryPolicy, RunResult, Session, SessionOptions, StorageBackend,
    StorageError,
};
use councilstore_git_native::{
    DailyBranchSettings, DailyBranchStorage, GitRepositoryService, RepositoryService,
};
use councilstore_github::{ForgeApi, GitHubClient, RunBranchSettings, RunBranchStorage};
use councilstore_local_store::LocalFilesystemStorage;
use councilstore_runtime_config::{ENV_GITHUB_REPOSITORY, ENV_GITHUB_TOKEN, StorageConfig};
use tracing::debug;

/// Backoff base between daily-branch commit attempts after a stale parent.
const CONFLICT_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendKind {
    Local,
    Repository,
    GitHub,
}

impl BackendKind {
    pub const ALL: [BackendKind; 3] = [Self::Local, Self::Repository, Self::GitHub];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Repository => "repository",
            Self::GitHub => "github",
        }
    }

    pub fn aliases(self) -> &'static [&'static str] {
        match self {
            Self::Local => &["local", "filesystem"],
            Self::Repository => &["repository", "git", "codecommit"],
            Self::GitHub => &["github", "hosted"],
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.aliases().contains(&wanted.as_str()))
            .ok_or_else(|| StorageError::UnsupportedBackend(s.trim().to_string()))
    }
}

/// Canonical names of every recognized backend kind.
pub fn available_backends() -> Vec<&'static str> {
    BackendKind::ALL.iter().map(|k| k.as_str()).collect()
}

/// A backend of any kind behind one concrete type.
///
/// The remote collaborators default to the production ones; tests swap in
/// the in-memory services.
pub enum AnyBackend<S: RepositoryService = GitRepositoryService, F: ForgeApi = GitHubClient> {
    Local(LocalFilesystemStorage),
    Repository(DailyBranchStorage<S>),
    GitHub(RunBranchStorage<F>),
}

impl<S: RepositoryService, F: ForgeApi> AnyBackend<S, F> {
    pub fn backend_kind(&self) -> BackendKind {
        match self {
            Self::Local(_) => BackendKind::Local,
            Self::Repository(_) => BackendKind::Repository,
            Self::GitHub(_) => BackendKind::GitHub,
        }
    }
}

impl<S: RepositoryService, F: ForgeApi> StorageBackend for AnyBackend<S, F> {
    fn kind(&self) -> &'static str {
        match self {
            Self::Local(b) => b.kind(),
            Self::Repository(b) => b.kind(),
            Self::GitHub(b) => b.kind(),
        }
    }

    fn council_code(&self) -> &str {
        match self {
            Self::Local(b) => b.council_code(),
            Self::Repository(b) => b.council_code(),
            Self::GitHub(b) => b.council_code(),
        }
    }

    fn has_active_session(&self) -> bool {
        match self {
            Self::Local(b) => b.has_active_session(),
            Self::Repository(b) => b.has_active_session(),
            Self::GitHub(b) => b.has_active_session(),
        }
    }

    async fn start_session(&mut self, options: SessionOptions) -> Result<Session> {
        match self {
            Self::Local(b) => b.start_session(options).await,
            Self::Repository(b) => b.start_session(options).await,
            Self::GitHub(b) => b.start_session(options).await,
        }
    }

    async fn end_session(
        &mut self,
        session: &mut Session,
        commit_message: &str,
        options: FinalizeOptions,
    ) -> Result<RunResult> {
        match self {
            Self::Local(b) => b.end_session(session, commit_message, options).await,
            Self::Repository(b) => b.end_session(session, commit_message, options).await,
            Self::GitHub(b) => b.end_session(session, commit_message, options).await,
        }
    }

    fn reset_session_state(&mut self, session: &mut Session) {
        match self {
            Self::Local(b) => b.reset_session_state(session),
            Self::Repository(b) => b.reset_session_state(session),
            Self::GitHub(b) => b.reset_session_state(session),
        }
    }
}

/// Build the backend for `council_code`.
///
/// `kind` overrides `[storage] backend`. Fails with
/// [`StorageError::UnsupportedBackend`] for an unknown kind and with
/// [`StorageError::InvalidArgument`] when a kind's required settings are missing.
pub fn get_storage_backend(
    council_code: &str,
    kind: Option<&str>,
    config: &StorageConfig,
) -> Result<AnyBackend> {
    let kind: BackendKind = kind.unwrap_or(config.storage.backend.as_str()).parse()?;
    debug!(council = council_code, %kind, "selecting storage backend");

    match kind {
        BackendKind::Local => Ok(AnyBackend::Local(LocalFilesystemStorage::new(
            council_code,
            config.storage.data_dir.clone(),
        )?)),
        BackendKind::Repository => {
            let settings = DailyBranchSettings {
                main_branch: config.repository.main_branch.clone(),
                batch_size: config.repository.batch_size,
                scraper_object_type: config.storage.scraper_object_type.clone(),
                conflict_retry: RetryPolicy::new(
                    config.repository.conflict_retries,
                    CONFLICT_BACKOFF,
                ),
            };
            let backend = DailyBranchStorage::open(council_code, &config.repository.root)?
                .with_settings(settings);
            Ok(AnyBackend::Repository(backend))
        }
        BackendKind::GitHub => {
            let github = &config.github;
            if github.repository.trim().is_empty() {
                return Err(StorageError::InvalidArgument(format!(
                    "github repository not provided; set [github] repository or {ENV_GITHUB_REPOSITORY}"
                )));
            }
            if github.token.trim().is_empty() {
                return Err(StorageError::InvalidArgument(format!(
                    "github token not provided; set [github] token or {ENV_GITHUB_TOKEN}"
                )));
            }
            let settings = RunBranchSettings {
                scraper_object_type: config.storage.scraper_object_type.clone(),
                auto_merge: github.auto_merge,
                max_merge_retries: github.max_merge_retries,
                disable_change_detection: github.disable_change_detection,
                ..RunBranchSettings::default()
            };
            let backend = RunBranchStorage::connect(
                council_code,
                &github.api_url,
                &github.repository,
                &github.token,
            )?
            .with_settings(settings);
            Ok(AnyBackend::GitHub(backend))
        }
    }
}
