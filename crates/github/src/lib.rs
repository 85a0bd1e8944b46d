//! GitHub storage for council scraper output: one shared repository, one
//! branch and pull request per run.

pub mod client;
pub mod error;
pub mod forge;
pub mod run_branch;

#[cfg(any(test, feature = "testing"))]
pub mod memory;

pub use client::{DEFAULT_API_URL, DEFAULT_TIMEOUT, GitHubClient};
pub use error::{ForgeError, Result};
pub use forge::{
    ContentEntry, ContentKind, Contents, ForgeApi, PullRequest, RepositoryInfo, TreeEntry,
};
pub use run_branch::{README_PATH, RunBranchSettings, RunBranchStorage};
