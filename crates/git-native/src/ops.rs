use std::collections::{BTreeMap, HashSet, VecDeque};
use std::path::Path;

use gix::refs::transaction::{Change, LogChange, PreviousValue, RefEdit, RefLog};
use gix::{ObjectId, Repository};

use crate::error::{RepositoryError, Result};

/// Wrap any gix-compatible error into [`RepositoryError::Git`].
pub fn gix_err(e: impl std::error::Error + Send + Sync + 'static) -> RepositoryError {
    RepositoryError::Git(Box::new(e))
}

/// Fully qualified ref for a branch name.
pub fn branch_ref(branch: &str) -> String {
    format!("refs/heads/{branch}")
}

/// Open the bare repository at `path`.
///
/// Returns [`RepositoryError::RepositoryNotFound`] when nothing is there.
pub fn open_repo(path: &Path, name: &str) -> Result<Repository> {
    if !path.exists() {
        return Err(RepositoryError::RepositoryNotFound(name.to_string()));
    }
    gix::open(path).map_err(gix_err)
}

/// Find the tip commit of a ref, returning `None` if the ref doesn't exist.
pub fn find_ref_tip<'r>(repo: &'r Repository, ref_name: &str) -> Result<Option<gix::Id<'r>>> {
    match repo.try_find_reference(ref_name).map_err(gix_err)? {
        Some(reference) => {
            let id = reference.into_fully_peeled_id().map_err(gix_err)?;
            Ok(Some(id))
        }
        None => Ok(None),
    }
}

/// Resolve a branch name or full commit id to a commit.
pub fn resolve_specifier(repo: &Repository, specifier: &str) -> Result<ObjectId> {
    if let Some(tip) = find_ref_tip(repo, &branch_ref(specifier))? {
        return Ok(tip.detach());
    }
    ObjectId::from_hex(specifier.as_bytes())
        .ok()
        .filter(|id| repo.find_commit(*id).is_ok())
        .ok_or_else(|| RepositoryError::BranchNotFound(specifier.to_string()))
}

/// Get the tree [`ObjectId`] from a commit.
pub fn commit_tree_id(repo: &Repository, commit_id: ObjectId) -> Result<ObjectId> {
    let commit = repo
        .find_object(commit_id)
        .map_err(gix_err)?
        .try_into_commit()
        .map_err(gix_err)?;
    let tree_id = commit.tree_id().map_err(gix_err)?;
    Ok(tree_id.detach())
}

/// Every blob reachable from `tree_id`, keyed by `/`-separated path.
pub fn tree_files(repo: &Repository, tree_id: ObjectId) -> Result<BTreeMap<String, ObjectId>> {
    let mut files = BTreeMap::new();
    let mut pending = vec![(String::new(), tree_id)];
    while let Some((prefix, id)) = pending.pop() {
        let tree = repo.find_tree(id).map_err(gix_err)?;
        let decoded = tree.decode().map_err(gix_err)?;
        for entry in &decoded.entries {
            let name = entry.filename.to_string();
            let path = if prefix.is_empty() {
                name
            } else {
                format!("{prefix}/{name}")
            };
            if entry.mode.is_tree() {
                pending.push((path, entry.oid.to_owned()));
            } else if !entry.mode.is_commit() {
                files.insert(path, entry.oid.to_owned());
            }
        }
    }
    Ok(files)
}

pub fn read_blob(repo: &Repository, id: ObjectId) -> Result<Vec<u8>> {
    Ok(repo.find_object(id).map_err(gix_err)?.detach().data)
}

/// Whether `ancestor` is reachable from `descendant` (or equal to it).
pub fn is_ancestor(repo: &Repository, ancestor: ObjectId, descendant: ObjectId) -> Result<bool> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([descendant]);
    while let Some(id) = queue.pop_front() {
        if id == ancestor {
            return Ok(true);
        }
        if !seen.insert(id) {
            continue;
        }
        let commit = repo.find_commit(id).map_err(gix_err)?;
        queue.extend(commit.parent_ids().map(|p| p.detach()));
    }
    Ok(false)
}

/// Build the committer/author signature for storage commits.
pub fn make_signature() -> gix::actor::Signature {
    gix::actor::Signature {
        name: "councilstore".into(),
        email: "councilstore@localhost".into(),
        time: gix::date::Time::now_local_or_utc(),
    }
}

/// Create a commit on `ref_name`, optionally with a parent.
///
/// The ref is updated atomically: it must either not exist (when `parent` is
/// `None`) or point to `parent` (when `Some`).
pub fn create_commit(
    repo: &Repository,
    ref_name: &str,
    tree_id: ObjectId,
    parent: Option<ObjectId>,
    message: &str,
) -> Result<ObjectId> {
    let sig = make_signature();
    let parents: Vec<ObjectId> = parent.into_iter().collect();

    let commit = gix::objs::Commit {
        message: message.into(),
        tree: tree_id,
        author: sig.clone(),
        committer: sig,
        encoding: None,
        parents: parents.clone().into(),
        extra_headers: Default::default(),
    };

    let commit_id = repo.write_object(&commit).map_err(gix_err)?.detach();

    let expected = match parents.first() {
        Some(p) => PreviousValue::ExistingMustMatch(gix::refs::Target::Object(*p)),
        None => PreviousValue::MustNotExist,
    };
    edit_ref(repo, ref_name, expected, commit_id, message)?;

    Ok(commit_id)
}

/// Point a new ref at `target`; the ref must not exist yet.
pub fn create_ref(repo: &Repository, ref_name: &str, target: ObjectId, message: &str) -> Result<()> {
    edit_ref(repo, ref_name, PreviousValue::MustNotExist, target, message)
}

fn edit_ref(
    repo: &Repository,
    ref_name: &str,
    expected: PreviousValue,
    new_tip: ObjectId,
    message: &str,
) -> Result<()> {
    repo.edit_references([RefEdit {
        change: Change::Update {
            log: LogChange {
                mode: RefLog::AndReference,
                force_create_reflog: false,
                message: message.into(),
            },
            expected,
            new: gix::refs::Target::Object(new_tip),
        },
        name: ref_name
            .try_into()
            .map_err(|e: gix::validate::reference::name::Error| gix_err(e))?,
        deref: false,
    }])
    .map_err(gix_err)?;
    Ok(())
}

/// Delete a ref, requiring it currently points to `expected_tip`.
pub fn delete_ref(repo: &Repository, ref_name: &str, expected_tip: ObjectId) -> Result<()> {
    repo.edit_references([RefEdit {
        change: Change::Delete {
            expected: PreviousValue::ExistingMustMatch(gix::refs::Target::Object(expected_tip)),
            log: RefLog::AndReference,
        },
        name: ref_name
            .try_into()
            .map_err(|e: gix::validate::reference::name::Error| gix_err(e))?,
        deref: false,
    }])
    .map_err(gix_err)?;
    Ok(())
}
