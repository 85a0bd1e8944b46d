use std::fmt;
use std::path::PathBuf;

/// Broad classification of a failure reported by a remote collaborator
/// (repository service, git forge).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteKind {
    /// The addressed repository, branch or file does not exist.
    NotFound,
    /// Optimistic-concurrency conflict (stale parent, merge conflict, HTTP 409).
    Conflict,
    /// Connection failure or timeout.
    Transient,
    /// Authorization failure or any other permanent rejection.
    Permanent,
}

impl fmt::Display for RemoteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::NotFound => "not found",
            Self::Conflict => "conflict",
            Self::Transient => "transient",
            Self::Permanent => "permanent",
        };
        f.write_str(label)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("a session is already active on this storage backend")]
    SessionAlreadyActive,

    #[error("unknown or inactive session for this storage backend")]
    UnknownSession,

    #[error("storage session is closed")]
    SessionClosed,

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("unsupported storage backend: {0}")]
    UnsupportedBackend(String),

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("file is not valid utf-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{kind} remote error: {source}")]
    Remote {
        kind: RemoteKind,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

pub type Result<T> = std::result::Result<T, StorageError>;

impl StorageError {
    /// Create an IO error with the given path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Wrap an error raised by a remote collaborator.
    pub fn remote(
        kind: RemoteKind,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Remote {
            kind,
            source: Box::new(source),
        }
    }

    /// Remote classification, `None` for local failures.
    pub fn remote_kind(&self) -> Option<RemoteKind> {
        match self {
            Self::Remote { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether retrying the same operation later could succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self.remote_kind(),
            Some(RemoteKind::Transient | RemoteKind::Conflict)
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::FileNotFound(_))
            || self.remote_kind() == Some(RemoteKind::NotFound)
    }
}
