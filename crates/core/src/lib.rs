//! Session-scoped storage for council scraper output.
//!
//! A scraper opens a [`Session`] on a [`StorageBackend`], stages files into
//! it, and asks the backend to finalize. Backends live in their own crates;
//! this crate holds the contract they share.

pub mod backend;
pub mod error;
pub mod path;
pub mod report;
pub mod retry;
pub mod run_log;
pub mod session;

pub use backend::{
    ActiveSession, DEFAULT_SCRAPER_OBJECT_TYPE, FinalizeOptions, SessionOptions, StorageBackend,
    validate_commit_message, with_session,
};
pub use error::{RemoteKind, Result, StorageError};
pub use path::{RelativePath, sanitize_council_code, validate_council_code};
pub use report::*;
pub use retry::RetryPolicy;
pub use run_log::{Logbook, MAX_LOGBOOK_RUNS, RunLog, RunStatus};
pub use session::{
    BoxFuture, DurableSource, FileContent, OpenMode, Preparation, Session, SessionId, StagedFiles,
};

#[cfg(any(test, feature = "testing"))]
pub mod testing;
