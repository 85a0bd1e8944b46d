//! The slice of a hosted git forge's REST API the run-branch backend needs.

use std::future::Future;

use crate::error::Result;

/// Repository metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepositoryInfo {
    pub default_branch: String,
    /// Reported size; zero for a repository without commits.
    pub size: u64,
}

/// One entry of a tree built on top of a base tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub path: String,
    /// Blob to place at `path`; `None` removes the path.
    pub sha: Option<String>,
}

impl TreeEntry {
    pub fn blob(path: impl Into<String>, sha: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sha: Some(sha.into()),
        }
    }

    pub fn deletion(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            sha: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    File,
    Dir,
}

/// An entry of a directory listing from the contents API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentEntry {
    pub path: String,
    pub kind: ContentKind,
}

/// What lives at a path on a given ref.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Contents {
    File(Vec<u8>),
    Dir(Vec<ContentEntry>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PullRequest {
    pub number: u64,
    pub html_url: String,
}

/// Forge operations scoped to one repository.
///
/// Errors carry the HTTP status so callers can tell a missing ref (404) from
/// an empty repository (409) or a rejected write (422).
pub trait ForgeApi: Send + Sync + 'static {
    /// `owner/repo` this client addresses.
    fn repository(&self) -> &str;

    fn get_repository(&self) -> impl Future<Output = Result<RepositoryInfo>> + Send;

    /// Commit sha a branch points at.
    fn get_branch_sha(&self, branch: &str) -> impl Future<Output = Result<String>> + Send;

    fn create_ref(&self, branch: &str, sha: &str) -> impl Future<Output = Result<()>> + Send;

    /// Fast-forward `branch` to `sha`.
    fn update_ref(&self, branch: &str, sha: &str) -> impl Future<Output = Result<()>> + Send;

    fn delete_ref(&self, branch: &str) -> impl Future<Output = Result<()>> + Send;

    /// Branch names starting with `prefix`.
    fn list_branches(&self, prefix: &str) -> impl Future<Output = Result<Vec<String>>> + Send;

    /// Tree sha of a commit.
    fn get_commit_tree(&self, sha: &str) -> impl Future<Output = Result<String>> + Send;

    fn create_blob(&self, content: &[u8]) -> impl Future<Output = Result<String>> + Send;

    fn create_tree(
        &self,
        base_tree: &str,
        entries: &[TreeEntry],
    ) -> impl Future<Output = Result<String>> + Send;

    fn create_commit(
        &self,
        message: &str,
        tree: &str,
        parents: &[String],
    ) -> impl Future<Output = Result<String>> + Send;

    fn get_contents(
        &self,
        path: &str,
        reference: &str,
    ) -> impl Future<Output = Result<Contents>> + Send;

    /// Create or replace one file through the contents API. Unlike the git
    /// data endpoints this works on a repository without commits.
    fn put_contents(
        &self,
        path: &str,
        content: &[u8],
        message: &str,
    ) -> impl Future<Output = Result<String>> + Send;

    fn create_pull_request(
        &self,
        title: &str,
        head: &str,
        base: &str,
        body: &str,
    ) -> impl Future<Output = Result<PullRequest>> + Send;

    /// Squash-merge a pull request, returning the merge commit sha.
    fn merge_pull_request(
        &self,
        number: u64,
        commit_title: &str,
    ) -> impl Future<Output = Result<String>> + Send;
}
