//! In-memory [`RepositoryService`] for tests, with fault injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::{RepositoryError, Result};
use crate::repository::{
    CommitRequest, FolderListing, RepositoryService, validate_branch_name, validate_name,
};

type Tree = BTreeMap<String, Vec<u8>>;

#[derive(Debug, Clone)]
struct MemoryCommit {
    tree: Tree,
    parent: Option<String>,
    message: String,
}

#[derive(Debug, Default)]
struct MemoryRepo {
    branches: BTreeMap<String, String>,
    commits: HashMap<String, MemoryCommit>,
}

impl MemoryRepo {
    fn resolve(&self, specifier: &str) -> Result<&MemoryCommit> {
        let id = self
            .branches
            .get(specifier)
            .map(String::as_str)
            .unwrap_or(specifier);
        self.commits
            .get(id)
            .ok_or_else(|| RepositoryError::BranchNotFound(specifier.to_string()))
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        let mut current = Some(descendant.to_string());
        while let Some(id) = current {
            if id == ancestor {
                return true;
            }
            current = self.commits.get(&id).and_then(|c| c.parent.clone());
        }
        false
    }
}

#[derive(Debug, Default)]
struct Inner {
    repos: BTreeMap<String, MemoryRepo>,
    next_commit: u64,
    outdated_parent_failures: usize,
    no_change_commits: usize,
    merge_failures: usize,
    unavailable_failures: usize,
    calls: Vec<String>,
}

impl Inner {
    fn repo(&self, name: &str) -> Result<&MemoryRepo> {
        self.repos
            .get(name)
            .ok_or_else(|| RepositoryError::RepositoryNotFound(name.to_string()))
    }

    fn repo_mut(&mut self, name: &str) -> Result<&mut MemoryRepo> {
        self.repos
            .get_mut(name)
            .ok_or_else(|| RepositoryError::RepositoryNotFound(name.to_string()))
    }

    fn next_id(&mut self) -> String {
        self.next_commit += 1;
        format!("{:040x}", self.next_commit)
    }

    fn write_commit(
        &mut self,
        repository: &str,
        branch: &str,
        tree: Tree,
        parent: Option<String>,
        message: &str,
    ) -> Result<String> {
        let id = self.next_id();
        let repo = self.repo_mut(repository)?;
        repo.commits.insert(
            id.clone(),
            MemoryCommit {
                tree,
                parent,
                message: message.to_string(),
            },
        );
        repo.branches.insert(branch.to_string(), id.clone());
        Ok(id)
    }
}

/// Repository service held entirely in memory.
///
/// Records every call as `"<operation> <repository> <argument>"` so tests can
/// assert on the sequence of remote operations.
#[derive(Debug, Default)]
pub struct MemoryRepositoryService {
    inner: Mutex<Inner>,
}

impl MemoryRepositoryService {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Commit `files` on top of `branch`, creating repository and branch as needed.
    pub fn seed(&self, repository: &str, branch: &str, files: &[(&str, &str)]) -> String {
        let mut inner = self.lock();
        inner.repos.entry(repository.to_string()).or_default();
        let (mut tree, parent) = match inner
            .repos
            .get(repository)
            .and_then(|r| r.branches.get(branch).cloned())
        {
            Some(tip) => (
                inner.repos[repository].commits[&tip].tree.clone(),
                Some(tip),
            ),
            None => (Tree::new(), None),
        };
        for (path, content) in files {
            tree.insert(path.to_string(), content.as_bytes().to_vec());
        }
        inner
            .write_commit(repository, branch, tree, parent, "seed")
            .unwrap_or_default()
    }

    /// The next `count` commits fail as if another writer moved the branch.
    pub fn fail_next_commits_with_outdated_parent(&self, count: usize) {
        self.lock().outdated_parent_failures = count;
    }

    /// The next `count` commits report `NoChange` without writing anything.
    pub fn report_no_change_for_next_commits(&self, count: usize) {
        self.lock().no_change_commits = count;
    }

    pub fn fail_next_merges(&self, count: usize) {
        self.lock().merge_failures = count;
    }

    /// The next `count` calls of any kind fail with `Unavailable`.
    pub fn fail_next_calls(&self, count: usize) {
        self.lock().unavailable_failures = count;
    }

    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    pub fn count_calls(&self, operation: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.split(' ').next() == Some(operation))
            .count()
    }

    pub fn branches(&self, repository: &str) -> Vec<String> {
        self.lock()
            .repos
            .get(repository)
            .map(|r| r.branches.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every file on `specifier`; empty when it does not exist.
    pub fn files(&self, repository: &str, specifier: &str) -> BTreeMap<String, Vec<u8>> {
        let inner = self.lock();
        inner
            .repos
            .get(repository)
            .and_then(|r| r.resolve(specifier).ok())
            .map(|c| c.tree.clone())
            .unwrap_or_default()
    }

    /// Commit messages reachable from `specifier`, newest first.
    pub fn history(&self, repository: &str, specifier: &str) -> Vec<String> {
        let inner = self.lock();
        let Some(repo) = inner.repos.get(repository) else {
            return Vec::new();
        };
        let mut messages = Vec::new();
        let mut current = repo
            .branches
            .get(specifier)
            .cloned()
            .or_else(|| Some(specifier.to_string()));
        while let Some(commit) = current.and_then(|id| repo.commits.get(&id)) {
            messages.push(commit.message.clone());
            current = commit.parent.clone();
        }
        messages
    }

    fn enter(&self, call: String) -> Result<MutexGuard<'_, Inner>> {
        let mut inner = self.lock();
        inner.calls.push(call);
        if inner.unavailable_failures > 0 {
            inner.unavailable_failures -= 1;
            return Err(RepositoryError::Unavailable("injected failure".into()));
        }
        Ok(inner)
    }
}

impl RepositoryService for MemoryRepositoryService {
    fn repository_exists(&self, repository: &str) -> Result<bool> {
        let inner = self.enter(format!("repository_exists {repository}"))?;
        Ok(inner.repos.contains_key(repository))
    }

    fn create_repository(&self, repository: &str) -> Result<()> {
        validate_name(repository)?;
        let mut inner = self.enter(format!("create_repository {repository}"))?;
        if inner.repos.contains_key(repository) {
            return Err(RepositoryError::RepositoryExists(repository.to_string()));
        }
        inner.repos.insert(repository.to_string(), MemoryRepo::default());
        Ok(())
    }

    fn get_branch(&self, repository: &str, branch: &str) -> Result<String> {
        let inner = self.enter(format!("get_branch {repository} {branch}"))?;
        inner
            .repo(repository)?
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| RepositoryError::BranchNotFound(branch.to_string()))
    }

    fn create_branch(&self, repository: &str, branch: &str, commit_id: &str) -> Result<()> {
        validate_branch_name(branch)?;
        let mut inner = self.enter(format!("create_branch {repository} {branch}"))?;
        let repo = inner.repo_mut(repository)?;
        if repo.branches.contains_key(branch) {
            return Err(RepositoryError::BranchExists(branch.to_string()));
        }
        if !repo.commits.contains_key(commit_id) {
            return Err(RepositoryError::BranchNotFound(commit_id.to_string()));
        }
        repo.branches.insert(branch.to_string(), commit_id.to_string());
        Ok(())
    }

    fn delete_branch(&self, repository: &str, branch: &str) -> Result<String> {
        let mut inner = self.enter(format!("delete_branch {repository} {branch}"))?;
        inner
            .repo_mut(repository)?
            .branches
            .remove(branch)
            .ok_or_else(|| RepositoryError::BranchNotFound(branch.to_string()))
    }

    fn get_folder(
        &self,
        repository: &str,
        specifier: &str,
        folder: &str,
    ) -> Result<FolderListing> {
        let inner = self.enter(format!("get_folder {repository} {folder}"))?;
        let commit = inner.repo(repository)?.resolve(specifier)?;
        let folder = folder.trim_matches('/');
        let prefix = if folder.is_empty() {
            String::new()
        } else {
            format!("{folder}/")
        };

        let mut listing = FolderListing::default();
        for path in commit.tree.keys() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    let sub = format!("{prefix}{dir}");
                    if !listing.sub_folders.contains(&sub) {
                        listing.sub_folders.push(sub);
                    }
                }
                None => listing.files.push(path.clone()),
            }
        }
        if listing.files.is_empty() && listing.sub_folders.is_empty() && !folder.is_empty() {
            return Err(RepositoryError::FolderNotFound(folder.to_string()));
        }
        Ok(listing)
    }

    fn get_file(&self, repository: &str, specifier: &str, path: &str) -> Result<Vec<u8>> {
        let inner = self.enter(format!("get_file {repository} {path}"))?;
        inner
            .repo(repository)?
            .resolve(specifier)?
            .tree
            .get(path.trim_matches('/'))
            .cloned()
            .ok_or_else(|| RepositoryError::FileNotFound(path.to_string()))
    }

    fn create_commit(&self, repository: &str, request: &CommitRequest<'_>) -> Result<String> {
        validate_branch_name(request.branch)?;
        let mut inner = self.enter(format!("create_commit {repository} {}", request.branch))?;
        if inner.outdated_parent_failures > 0 {
            inner.outdated_parent_failures -= 1;
            return Err(RepositoryError::ParentCommitOutdated {
                branch: request.branch.to_string(),
            });
        }
        if inner.no_change_commits > 0 {
            inner.no_change_commits -= 1;
            return Err(RepositoryError::NoChange);
        }

        let repo = inner.repo(repository)?;
        let tip = repo.branches.get(request.branch).cloned();
        match (tip.as_deref(), request.parent) {
            (Some(tip), Some(parent)) if tip == parent => {}
            (None, None) => {}
            (None, Some(_)) => {
                return Err(RepositoryError::BranchNotFound(request.branch.to_string()));
            }
            _ => {
                return Err(RepositoryError::ParentCommitOutdated {
                    branch: request.branch.to_string(),
                });
            }
        }

        let base = match &tip {
            Some(tip) => repo.resolve(tip)?.tree.clone(),
            None => Tree::new(),
        };
        let mut tree = base.clone();
        for path in request.delete_files {
            if tree.remove(path).is_none() {
                return Err(RepositoryError::FileNotFound(path.clone()));
            }
        }
        for file in request.put_files {
            tree.insert(file.path.clone(), file.content.clone());
        }
        if tree == base {
            return Err(RepositoryError::NoChange);
        }

        inner.write_commit(repository, request.branch, tree, tip, request.message)
    }

    fn merge_branches_by_squash(
        &self,
        repository: &str,
        source: &str,
        destination: &str,
        message: &str,
    ) -> Result<String> {
        let mut inner = self.enter(format!("merge_branches_by_squash {repository} {source}"))?;
        if inner.merge_failures > 0 {
            inner.merge_failures -= 1;
            return Err(RepositoryError::MergeConflict {
                source_branch: source.to_string(),
                destination: destination.to_string(),
            });
        }

        let repo = inner.repo(repository)?;
        let source_tip = repo
            .branches
            .get(source)
            .cloned()
            .ok_or_else(|| RepositoryError::BranchNotFound(source.to_string()))?;
        let source_tree = repo.resolve(&source_tip)?.tree.clone();
        let destination_tip = repo.branches.get(destination).cloned();

        if let Some(tip) = &destination_tip {
            if repo.resolve(tip)?.tree == source_tree {
                return Ok(tip.clone());
            }
            if !repo.is_ancestor(tip, &source_tip) {
                return Err(RepositoryError::MergeConflict {
                    source_branch: source.to_string(),
                    destination: destination.to_string(),
                });
            }
        }
        inner.write_commit(repository, destination, source_tree, destination_tip, message)
    }
}
