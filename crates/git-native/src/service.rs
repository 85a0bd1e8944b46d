use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use gix::ObjectId;
use gix::object::tree::EntryKind;
use tracing::{debug, info};

use crate::error::{RepositoryError, Result};
use crate::ops::{self, gix_err};
use crate::repository::{
    CommitRequest, FolderListing, RepositoryService, validate_branch_name, validate_name,
};

/// [`RepositoryService`] over bare git repositories on local disk, one
/// `<root>/<name>.git` per repository. Nothing ever touches a work tree.
#[derive(Debug, Clone)]
pub struct GitRepositoryService {
    root: PathBuf,
}

impl GitRepositoryService {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn repository_path(&self, repository: &str) -> Result<PathBuf> {
        validate_name(repository)?;
        Ok(self.root.join(format!("{repository}.git")))
    }

    fn open(&self, repository: &str) -> Result<gix::Repository> {
        ops::open_repo(&self.repository_path(repository)?, repository)
    }

    fn files_at(
        &self,
        repo: &gix::Repository,
        specifier: &str,
    ) -> Result<std::collections::BTreeMap<String, ObjectId>> {
        let commit = ops::resolve_specifier(repo, specifier)?;
        ops::tree_files(repo, ops::commit_tree_id(repo, commit)?)
    }
}

impl RepositoryService for GitRepositoryService {
    fn repository_exists(&self, repository: &str) -> Result<bool> {
        Ok(self.repository_path(repository)?.exists())
    }

    fn create_repository(&self, repository: &str) -> Result<()> {
        let path = self.repository_path(repository)?;
        if path.exists() {
            return Err(RepositoryError::RepositoryExists(repository.to_string()));
        }
        std::fs::create_dir_all(&self.root)?;
        gix::init_bare(&path).map_err(gix_err)?;
        info!(repository, path = %path.display(), "Created bare repository");
        Ok(())
    }

    fn get_branch(&self, repository: &str, branch: &str) -> Result<String> {
        validate_branch_name(branch)?;
        let repo = self.open(repository)?;
        ops::find_ref_tip(&repo, &ops::branch_ref(branch))?
            .map(|id| id.to_string())
            .ok_or_else(|| RepositoryError::BranchNotFound(branch.to_string()))
    }

    fn create_branch(&self, repository: &str, branch: &str, commit_id: &str) -> Result<()> {
        validate_branch_name(branch)?;
        let repo = self.open(repository)?;
        let ref_name = ops::branch_ref(branch);
        if ops::find_ref_tip(&repo, &ref_name)?.is_some() {
            return Err(RepositoryError::BranchExists(branch.to_string()));
        }
        let target = ops::resolve_specifier(&repo, commit_id)?;
        ops::create_ref(&repo, &ref_name, target, &format!("branch: created from {commit_id}"))?;
        debug!(repository, branch, commit = %target, "Created branch");
        Ok(())
    }

    fn delete_branch(&self, repository: &str, branch: &str) -> Result<String> {
        validate_branch_name(branch)?;
        let repo = self.open(repository)?;
        let ref_name = ops::branch_ref(branch);
        let tip = ops::find_ref_tip(&repo, &ref_name)?
            .map(|id| id.detach())
            .ok_or_else(|| RepositoryError::BranchNotFound(branch.to_string()))?;
        ops::delete_ref(&repo, &ref_name, tip)?;
        debug!(repository, branch, "Deleted branch");
        Ok(tip.to_string())
    }

    fn get_folder(
        &self,
        repository: &str,
        specifier: &str,
        folder: &str,
    ) -> Result<FolderListing> {
        let repo = self.open(repository)?;
        let files = self.files_at(&repo, specifier)?;
        let folder = folder.trim_matches('/');
        let prefix = if folder.is_empty() {
            String::new()
        } else {
            format!("{folder}/")
        };

        let mut listing = FolderListing::default();
        let mut sub_folders = BTreeSet::new();
        for path in files.keys() {
            let Some(rest) = path.strip_prefix(&prefix) else {
                continue;
            };
            match rest.split_once('/') {
                Some((dir, _)) => {
                    sub_folders.insert(format!("{prefix}{dir}"));
                }
                None => listing.files.push(path.clone()),
            }
        }
        if listing.files.is_empty() && sub_folders.is_empty() && !folder.is_empty() {
            return Err(RepositoryError::FolderNotFound(folder.to_string()));
        }
        listing.sub_folders = sub_folders.into_iter().collect();
        Ok(listing)
    }

    fn get_file(&self, repository: &str, specifier: &str, path: &str) -> Result<Vec<u8>> {
        let repo = self.open(repository)?;
        let files = self.files_at(&repo, specifier)?;
        let id = files
            .get(path.trim_matches('/'))
            .copied()
            .ok_or_else(|| RepositoryError::FileNotFound(path.to_string()))?;
        ops::read_blob(&repo, id)
    }

    fn create_commit(&self, repository: &str, request: &CommitRequest<'_>) -> Result<String> {
        validate_branch_name(request.branch)?;
        let repo = self.open(repository)?;
        let ref_name = ops::branch_ref(request.branch);
        let tip = ops::find_ref_tip(&repo, &ref_name)?.map(|id| id.detach());

        match (tip, request.parent) {
            (Some(tip), Some(parent)) if tip.to_string() == parent => {}
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

        let base_tree = match tip {
            Some(tip) => ops::commit_tree_id(&repo, tip)?,
            None => ObjectId::empty_tree(repo.object_hash()),
        };
        let existing = ops::tree_files(&repo, base_tree)?;

        let mut editor = repo.edit_tree(base_tree).map_err(gix_err)?;
        for path in request.delete_files {
            if !existing.contains_key(path.as_str()) {
                return Err(RepositoryError::FileNotFound(path.clone()));
            }
            editor.remove(path.as_str()).map_err(gix_err)?;
        }
        for file in request.put_files {
            let blob = repo.write_blob(&file.content).map_err(gix_err)?.detach();
            editor
                .upsert(file.path.as_str(), EntryKind::Blob, blob)
                .map_err(gix_err)?;
        }
        let new_tree = editor.write().map_err(gix_err)?.detach();
        if new_tree == base_tree {
            return Err(RepositoryError::NoChange);
        }

        let commit_id = ops::create_commit(&repo, &ref_name, new_tree, tip, request.message)?;
        debug!(
            repository,
            branch = request.branch,
            commit = %commit_id,
            put = request.put_files.len(),
            deleted = request.delete_files.len(),
            "Committed batch"
        );
        Ok(commit_id.to_string())
    }

    fn merge_branches_by_squash(
        &self,
        repository: &str,
        source: &str,
        destination: &str,
        message: &str,
    ) -> Result<String> {
        validate_branch_name(source)?;
        validate_branch_name(destination)?;
        let repo = self.open(repository)?;

        let source_tip = ops::find_ref_tip(&repo, &ops::branch_ref(source))?
            .map(|id| id.detach())
            .ok_or_else(|| RepositoryError::BranchNotFound(source.to_string()))?;
        let source_tree = ops::commit_tree_id(&repo, source_tip)?;

        let destination_ref = ops::branch_ref(destination);
        let destination_tip = ops::find_ref_tip(&repo, &destination_ref)?.map(|id| id.detach());

        let commit_id = match destination_tip {
            None => ops::create_commit(&repo, &destination_ref, source_tree, None, message)?,
            Some(tip) => {
                if ops::commit_tree_id(&repo, tip)? == source_tree {
                    return Ok(tip.to_string());
                }
                if !ops::is_ancestor(&repo, tip, source_tip)? {
                    return Err(RepositoryError::MergeConflict {
                        source_branch: source.to_string(),
                        destination: destination.to_string(),
                    });
                }
                ops::create_commit(&repo, &destination_ref, source_tree, Some(tip), message)?
            }
        };

        info!(repository, source, destination, commit = %commit_id, "Squash-merged branch");
        Ok(commit_id.to_string())
    }
}
