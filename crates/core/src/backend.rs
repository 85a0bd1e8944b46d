//! The contract every storage backend implements, plus the scoped
//! `with_session` helper built on top of it.

use std::future::Future;

use tracing::{debug, warn};

use crate::error::{Result, StorageError};
use crate::report::RunResult;
use crate::run_log::RunLog;
use crate::session::{Session, SessionId};

/// Namespace folder used when neither the session nor the config names one.
pub const DEFAULT_SCRAPER_OBJECT_TYPE: &str = "Data";

/// Per-session knobs passed to [`StorageBackend::start_session`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionOptions {
    /// Folder this run fully replaces (e.g. `Councillors`).
    pub scraper_object_type: Option<String>,
    /// Explicit run identifier, used as the run-branch suffix where relevant.
    pub run_id: Option<String>,
}

impl SessionOptions {
    pub fn for_object_type(scraper_object_type: impl Into<String>) -> Self {
        Self {
            scraper_object_type: Some(scraper_object_type.into()),
            ..Self::default()
        }
    }

    pub fn object_type_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        self.scraper_object_type
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(fallback)
    }
}

/// Per-finalize knobs passed to [`StorageBackend::end_session`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FinalizeOptions {
    pub run_log: Option<RunLog>,
    /// Commit to the working branch but do not open or merge a pull request.
    pub skip_merge: bool,
    pub max_merge_retries: Option<u32>,
}

impl FinalizeOptions {
    pub fn with_run_log(run_log: RunLog) -> Self {
        Self {
            run_log: Some(run_log),
            ..Self::default()
        }
    }
}

/// A council-scoped handle on durable storage that hands out one session at
/// a time.
///
/// `end_session` must reset the backend's session tracking on every exit
/// path once the session has been accepted, so the instance can start a
/// fresh session after any failure.
pub trait StorageBackend: Send {
    /// Stable name of the backend kind (`local`, `repository`, `github`).
    fn kind(&self) -> &'static str;

    fn council_code(&self) -> &str;

    fn has_active_session(&self) -> bool;

    /// Prepare durable state and open a session.
    ///
    /// Fails with [`StorageError::SessionAlreadyActive`] while another
    /// session is open. A failed preparation leaves no session active.
    fn start_session(
        &mut self,
        options: SessionOptions,
    ) -> impl Future<Output = Result<Session>> + Send;

    /// Durably apply everything staged in `session` and close it.
    fn end_session(
        &mut self,
        session: &mut Session,
        commit_message: &str,
        options: FinalizeOptions,
    ) -> impl Future<Output = Result<RunResult>> + Send;

    /// Drop the session without committing and forget it.
    fn reset_session_state(&mut self, session: &mut Session);
}

/// Tracks the single session a backend instance may have open.
#[derive(Debug, Default)]
pub struct ActiveSession(Option<SessionId>);

impl ActiveSession {
    pub fn is_active(&self) -> bool {
        self.0.is_some()
    }

    pub fn ensure_available(&self) -> Result<()> {
        match self.0 {
            Some(_) => Err(StorageError::SessionAlreadyActive),
            None => Ok(()),
        }
    }

    pub fn claim(&mut self, session: &Session) {
        self.0 = Some(session.id());
    }

    /// Verify `session` is the open session this backend handed out.
    pub fn check(&self, session: &Session) -> Result<()> {
        if self.0 == Some(session.id()) && session.is_open() {
            Ok(())
        } else {
            Err(StorageError::UnknownSession)
        }
    }

    pub fn release(&mut self) {
        self.0 = None;
    }
}

pub fn validate_commit_message(commit_message: &str) -> Result<&str> {
    let trimmed = commit_message.trim();
    if trimmed.is_empty() {
        return Err(StorageError::InvalidArgument(
            "commit_message cannot be empty".to_string(),
        ));
    }
    Ok(trimmed)
}

/// Run `body` inside a session and finalize it on success.
///
/// When `body` fails the session is reset and the error returned without
/// finalizing. A failed finalize resets the backend as well.
pub async fn with_session<B, T, E, F>(
    backend: &mut B,
    commit_message: &str,
    session_options: SessionOptions,
    finalize_options: FinalizeOptions,
    body: F,
) -> std::result::Result<(T, RunResult), E>
where
    B: StorageBackend,
    E: From<StorageError>,
    F: AsyncFnOnce(&mut Session) -> std::result::Result<T, E>,
{
    let mut session = backend.start_session(session_options).await?;

    let value = match body(&mut session).await {
        Ok(value) => value,
        Err(e) => {
            debug!(council = backend.council_code(), "session body failed, resetting");
            backend.reset_session_state(&mut session);
            return Err(e);
        }
    };

    match backend
        .end_session(&mut session, commit_message, finalize_options)
        .await
    {
        Ok(result) => Ok((value, result)),
        Err(e) => {
            if backend.has_active_session() {
                warn!(council = backend.council_code(), error = %e, "finalize failed, resetting session");
                backend.reset_session_state(&mut session);
            }
            Err(e.into())
        }
    }
}
