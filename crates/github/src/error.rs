use councilstore_core::{RemoteKind, StorageError};

pub type Result<T> = std::result::Result<T, ForgeError>;

/// Failures talking to the git forge.
#[derive(Debug, thiserror::Error)]
pub enum ForgeError {
    /// Could not reach the API at all.
    #[error("connection failed: {0}")]
    Connection(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    /// The API answered with a non-success status.
    #[error("api error ({status}): {message}")]
    Status { status: u16, message: String },

    #[error("unexpected response body: {0}")]
    Decode(String),

    #[error("forge misconfigured: {0}")]
    Config(String),
}

impl ForgeError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Connection failures and timeouts: the only errors git-object writes retry on.
    pub fn is_network(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// HTTP 409: merge conflicts, and every git-data call on an empty repository.
    pub fn is_conflict(&self) -> bool {
        self.status() == Some(409)
    }

    /// HTTP 422: the request was understood but rejected, e.g. a ref that already exists.
    pub fn is_unprocessable(&self) -> bool {
        self.status() == Some(422)
    }

    pub fn remote_kind(&self) -> RemoteKind {
        match self {
            Self::Connection(_) | Self::Timeout(_) => RemoteKind::Transient,
            Self::Status { status: 404, .. } => RemoteKind::NotFound,
            Self::Status { status: 409, .. } => RemoteKind::Conflict,
            Self::Status { status, .. } if *status >= 500 => RemoteKind::Transient,
            _ => RemoteKind::Permanent,
        }
    }
}

impl From<reqwest::Error> for ForgeError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else if e.is_decode() {
            Self::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            Self::Status {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            Self::Connection(e.to_string())
        }
    }
}

impl From<ForgeError> for StorageError {
    fn from(e: ForgeError) -> Self {
        StorageError::remote(e.remote_kind(), e)
    }
}
