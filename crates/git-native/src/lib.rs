pub mod daily_branch;
pub mod error;
pub mod ops;
pub mod repository;
pub mod service;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

#[cfg(test)]
pub(crate) mod test_utils;

pub use daily_branch::{
    DailyBranchSettings, DailyBranchStorage, LOGBOOK_FILE_NAME, MAX_FILES_PER_COMMIT,
};
pub use error::{RepositoryError, Result};
pub use repository::{
    CommitRequest, FolderListing, PutFile, RepositoryService, list_files_recursive,
};
pub use service::GitRepositoryService;
