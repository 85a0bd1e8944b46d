use gix::ObjectId;
use gix::object::tree::EntryKind;

use crate::ops;

/// Initialize an empty bare repository in `dir`.
pub fn init_bare_repo(dir: &std::path::Path) -> gix::Repository {
    gix::init_bare(dir).expect("gix init_bare failed")
}

/// Commit `files` on top of `branch` (creating it when missing) and return the commit.
pub fn commit_files(repo: &gix::Repository, branch: &str, files: &[(&str, &str)]) -> ObjectId {
    let ref_name = ops::branch_ref(branch);
    let tip = ops::find_ref_tip(repo, &ref_name).unwrap().map(|id| id.detach());
    let base = match tip {
        Some(id) => ops::commit_tree_id(repo, id).unwrap(),
        None => ObjectId::empty_tree(repo.object_hash()),
    };

    let mut editor = repo.edit_tree(base).unwrap();
    for (path, content) in files {
        let blob = repo.write_blob(content.as_bytes()).unwrap().detach();
        editor.upsert(*path, EntryKind::Blob, blob).unwrap();
    }
    let tree = editor.write().unwrap().detach();
    ops::create_commit(repo, &ref_name, tree, tip, "test commit").unwrap()
}
