//! The repository-service contract the daily-branch backend is written
//! against: repositories, branches, folder listings and batch commits with
//! an expected parent.

use crate::error::Result;

/// Immediate children of a folder. Paths are absolute within the repository.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FolderListing {
    pub sub_folders: Vec<String>,
    pub files: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutFile {
    pub path: String,
    pub content: Vec<u8>,
}

impl PutFile {
    pub fn new(path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        Self {
            path: path.into(),
            content: content.into(),
        }
    }
}

/// One commit of file additions and deletions on a branch.
#[derive(Debug, Clone, Copy)]
pub struct CommitRequest<'a> {
    pub branch: &'a str,
    /// Tip the caller believes the branch has. `None` creates the branch,
    /// which must not exist yet.
    pub parent: Option<&'a str>,
    pub message: &'a str,
    pub put_files: &'a [PutFile],
    pub delete_files: &'a [String],
}

/// Blocking client for a hosted or local repository service.
///
/// Commit specifiers name a branch or a full commit id.
pub trait RepositoryService: Send + Sync + 'static {
    fn repository_exists(&self, repository: &str) -> Result<bool>;

    /// Fails with `RepositoryExists` when the name is taken.
    fn create_repository(&self, repository: &str) -> Result<()>;

    /// Tip commit id of `branch`.
    fn get_branch(&self, repository: &str, branch: &str) -> Result<String>;

    fn create_branch(&self, repository: &str, branch: &str, commit_id: &str) -> Result<()>;

    /// Delete `branch`, returning the commit it pointed at.
    fn delete_branch(&self, repository: &str, branch: &str) -> Result<String>;

    fn get_folder(&self, repository: &str, specifier: &str, folder: &str)
    -> Result<FolderListing>;

    fn get_file(&self, repository: &str, specifier: &str, path: &str) -> Result<Vec<u8>>;

    /// Commit on `request.branch` and return the new commit id.
    ///
    /// Fails with `ParentCommitOutdated` when `request.parent` is not the
    /// branch tip and with `NoChange` when the resulting tree equals the
    /// parent's.
    fn create_commit(&self, repository: &str, request: &CommitRequest<'_>) -> Result<String>;

    /// Squash `source` onto `destination` as one commit and return its id.
    fn merge_branches_by_squash(
        &self,
        repository: &str,
        source: &str,
        destination: &str,
        message: &str,
    ) -> Result<String>;
}

/// Every file below `folder` on `specifier`, depth first.
///
/// A missing folder or branch yields an empty list.
pub fn list_files_recursive<S: RepositoryService + ?Sized>(
    service: &S,
    repository: &str,
    specifier: &str,
    folder: &str,
) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut pending = vec![folder.trim_matches('/').to_string()];
    while let Some(current) = pending.pop() {
        match service.get_folder(repository, specifier, &current) {
            Ok(listing) => {
                files.extend(listing.files);
                pending.extend(listing.sub_folders.into_iter().rev());
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }
    }
    Ok(files)
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.is_empty()
        && !segment.starts_with('.')
        && !segment.starts_with('-')
        && !segment.contains("..")
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Repository names are a single path segment.
pub(crate) fn validate_name(name: &str) -> Result<()> {
    if is_valid_segment(name) {
        Ok(())
    } else {
        Err(crate::error::RepositoryError::InvalidName(name.to_string()))
    }
}

/// Branch names may nest with `/` (`release/main`); each part follows the
/// segment rules.
pub(crate) fn validate_branch_name(name: &str) -> Result<()> {
    if name.split('/').all(is_valid_segment) {
        Ok(())
    } else {
        Err(crate::error::RepositoryError::InvalidName(name.to_string()))
    }
}
