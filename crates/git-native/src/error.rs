use councilstore_core::{RemoteKind, StorageError};

/// Failures reported by a [`crate::RepositoryService`].
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    #[error("repository does not exist: {0}")]
    RepositoryNotFound(String),

    #[error("repository already exists: {0}")]
    RepositoryExists(String),

    #[error("invalid repository or branch name: {0}")]
    InvalidName(String),

    #[error("branch does not exist: {0}")]
    BranchNotFound(String),

    #[error("branch already exists: {0}")]
    BranchExists(String),

    #[error("folder does not exist: {0}")]
    FolderNotFound(String),

    #[error("file does not exist: {0}")]
    FileNotFound(String),

    #[error("parent commit is not the tip of {branch}")]
    ParentCommitOutdated { branch: String },

    #[error("commit would not change the tree")]
    NoChange,

    #[error("cannot squash {source_branch} into {destination}: histories diverged")]
    MergeConflict {
        source_branch: String,
        destination: String,
    },

    #[error("repository service unavailable: {0}")]
    Unavailable(String),

    #[error("git error: {0}")]
    Git(Box<dyn std::error::Error + Send + Sync>),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

impl RepositoryError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::RepositoryNotFound(_)
                | Self::BranchNotFound(_)
                | Self::FolderNotFound(_)
                | Self::FileNotFound(_)
        )
    }

    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::ParentCommitOutdated { .. }
                | Self::MergeConflict { .. }
                | Self::RepositoryExists(_)
                | Self::BranchExists(_)
        )
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_)) || self.is_conflict()
    }

    pub fn remote_kind(&self) -> RemoteKind {
        if self.is_not_found() {
            RemoteKind::NotFound
        } else if self.is_conflict() {
            RemoteKind::Conflict
        } else if matches!(self, Self::Unavailable(_)) {
            RemoteKind::Transient
        } else {
            RemoteKind::Permanent
        }
    }
}

impl From<RepositoryError> for StorageError {
    fn from(e: RepositoryError) -> Self {
        StorageError::remote(e.remote_kind(), e)
    }
}
