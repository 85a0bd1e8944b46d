//! In-memory [`ForgeApi`] for tests: a single repository with git-data
//! semantics, pull requests and fault injection.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use crate::error::{ForgeError, Result};
use crate::forge::{
    ContentEntry, ContentKind, Contents, ForgeApi, PullRequest, RepositoryInfo, TreeEntry,
};

type Tree = BTreeMap<String, String>;

#[derive(Debug, Clone)]
struct Commit {
    tree: String,
    parents: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct MemoryPull {
    pub number: u64,
    pub title: String,
    pub head: String,
    pub base: String,
    pub merged: bool,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    blobs: HashMap<String, Vec<u8>>,
    trees: HashMap<String, Tree>,
    commits: HashMap<String, Commit>,
    refs: BTreeMap<String, String>,
    pulls: Vec<MemoryPull>,
    network_failures: usize,
    ref_conflicts: usize,
    merge_conflicts: usize,
    reject_pulls: bool,
    calls: Vec<String>,
}

fn status(status: u16, message: &str) -> ForgeError {
    ForgeError::Status {
        status,
        message: message.to_string(),
    }
}

impl State {
    fn id(&mut self) -> String {
        self.next_id += 1;
        format!("{:040x}", self.next_id)
    }

    fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    fn write_tree(&mut self, tree: Tree) -> String {
        let id = self.id();
        self.trees.insert(id.clone(), tree);
        id
    }

    fn write_commit(&mut self, tree: String, parents: Vec<String>) -> String {
        let id = self.id();
        self.commits.insert(id.clone(), Commit { tree, parents });
        id
    }

    fn tree_of(&self, reference: &str) -> Option<&Tree> {
        let sha = self.refs.get(reference).map(String::as_str).unwrap_or(reference);
        self.commits
            .get(sha)
            .and_then(|c| self.trees.get(&c.tree))
    }

    fn is_ancestor(&self, ancestor: &str, descendant: &str) -> bool {
        let mut pending = vec![descendant.to_string()];
        while let Some(id) = pending.pop() {
            if id == ancestor {
                return true;
            }
            if let Some(commit) = self.commits.get(&id) {
                pending.extend(commit.parents.iter().cloned());
            }
        }
        false
    }

    /// Commit `files` on top of `branch`, as a contents-API write would.
    fn commit_files(&mut self, branch: &str, files: &[(&str, &[u8])]) -> String {
        let parent = self.refs.get(branch).cloned();
        let mut tree = parent
            .as_deref()
            .and_then(|p| self.tree_of(p))
            .cloned()
            .unwrap_or_default();
        for (path, content) in files {
            let blob = self.id();
            self.blobs.insert(blob.clone(), content.to_vec());
            tree.insert(path.to_string(), blob);
        }
        let tree = self.write_tree(tree);
        let commit = self.write_commit(tree, parent.into_iter().collect());
        self.refs.insert(branch.to_string(), commit.clone());
        commit
    }

    fn network_fault(&mut self) -> Result<()> {
        if self.network_failures > 0 {
            self.network_failures -= 1;
            return Err(ForgeError::Connection("injected connection reset".into()));
        }
        Ok(())
    }
}

/// Forge held entirely in memory. Starts as an empty repository whose
/// default branch is `main`.
#[derive(Debug)]
pub struct MemoryForge {
    repository: String,
    default_branch: String,
    state: Mutex<State>,
}

impl Default for MemoryForge {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryForge {
    pub fn new() -> Self {
        Self {
            repository: "civic/council-data".to_string(),
            default_branch: "main".to_string(),
            state: Mutex::new(State::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, call: String) -> MutexGuard<'_, State> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }

    /// Commit files onto `branch`, creating it (and the repository history) as needed.
    pub fn seed(&self, branch: &str, files: &[(&str, &str)]) -> String {
        let files: Vec<(&str, &[u8])> = files.iter().map(|(p, c)| (*p, c.as_bytes())).collect();
        self.lock().commit_files(branch, &files)
    }

    /// Create `branch` at the default branch tip.
    pub fn seed_branch(&self, branch: &str) {
        let mut state = self.lock();
        if let Some(tip) = state.refs.get(&self.default_branch).cloned() {
            state.refs.insert(branch.to_string(), tip);
        }
    }

    /// The next `count` git-object writes fail with a connection error.
    pub fn fail_next_writes(&self, count: usize) {
        self.lock().network_failures = count;
    }

    /// The next `count` ref creations answer 422 as if the ref existed.
    pub fn reject_next_ref_creations(&self, count: usize) {
        self.lock().ref_conflicts = count;
    }

    /// The next `count` merges answer 409.
    pub fn conflict_next_merges(&self, count: usize) {
        self.lock().merge_conflicts = count;
    }

    pub fn reject_pull_requests(&self) {
        self.lock().reject_pulls = true;
    }

    pub fn branches(&self) -> Vec<String> {
        self.lock().refs.keys().cloned().collect()
    }

    pub fn pulls(&self) -> Vec<MemoryPull> {
        self.lock().pulls.clone()
    }

    /// Every file on `reference`; empty when it does not exist.
    pub fn files(&self, reference: &str) -> BTreeMap<String, Vec<u8>> {
        let state = self.lock();
        state
            .tree_of(reference)
            .map(|tree| {
                tree.iter()
                    .map(|(path, blob)| {
                        (path.clone(), state.blobs.get(blob).cloned().unwrap_or_default())
                    })
                    .collect()
            })
            .unwrap_or_default()
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
}

impl ForgeApi for MemoryForge {
    fn repository(&self) -> &str {
        &self.repository
    }

    async fn get_repository(&self) -> Result<RepositoryInfo> {
        let state = self.enter("get_repository".to_string());
        Ok(RepositoryInfo {
            default_branch: self.default_branch.clone(),
            size: if state.is_empty() { 0 } else { 1 },
        })
    }

    async fn get_branch_sha(&self, branch: &str) -> Result<String> {
        let state = self.enter(format!("get_branch_sha {branch}"));
        if state.is_empty() {
            return Err(status(409, "Git Repository is empty."));
        }
        state
            .refs
            .get(branch)
            .cloned()
            .ok_or_else(|| status(404, "Not Found"))
    }

    async fn create_ref(&self, branch: &str, sha: &str) -> Result<()> {
        let mut state = self.enter(format!("create_ref {branch}"));
        if state.ref_conflicts > 0 {
            state.ref_conflicts -= 1;
            return Err(status(422, "Reference already exists"));
        }
        if state.refs.contains_key(branch) {
            return Err(status(422, "Reference already exists"));
        }
        if !state.commits.contains_key(sha) {
            return Err(status(422, "Object does not exist"));
        }
        state.refs.insert(branch.to_string(), sha.to_string());
        Ok(())
    }

    async fn update_ref(&self, branch: &str, sha: &str) -> Result<()> {
        let mut state = self.enter(format!("update_ref {branch}"));
        state.network_fault()?;
        let Some(current) = state.refs.get(branch).cloned() else {
            return Err(status(422, "Reference does not exist"));
        };
        if !state.is_ancestor(&current, sha) {
            return Err(status(422, "Update is not a fast forward"));
        }
        state.refs.insert(branch.to_string(), sha.to_string());
        Ok(())
    }

    async fn delete_ref(&self, branch: &str) -> Result<()> {
        let mut state = self.enter(format!("delete_ref {branch}"));
        state
            .refs
            .remove(branch)
            .map(|_| ())
            .ok_or_else(|| status(422, "Reference does not exist"))
    }

    async fn list_branches(&self, prefix: &str) -> Result<Vec<String>> {
        let state = self.enter(format!("list_branches {prefix}"));
        Ok(state
            .refs
            .keys()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn get_commit_tree(&self, sha: &str) -> Result<String> {
        let state = self.enter(format!("get_commit_tree {sha}"));
        state
            .commits
            .get(sha)
            .map(|c| c.tree.clone())
            .ok_or_else(|| status(404, "Not Found"))
    }

    async fn create_blob(&self, content: &[u8]) -> Result<String> {
        let mut state = self.enter("create_blob".to_string());
        if state.is_empty() {
            return Err(status(409, "Git Repository is empty."));
        }
        state.network_fault()?;
        let id = state.id();
        state.blobs.insert(id.clone(), content.to_vec());
        Ok(id)
    }

    async fn create_tree(&self, base_tree: &str, entries: &[TreeEntry]) -> Result<String> {
        let mut state = self.enter("create_tree".to_string());
        state.network_fault()?;
        let mut tree = state
            .trees
            .get(base_tree)
            .cloned()
            .ok_or_else(|| status(422, "base_tree is not a tree"))?;
        for entry in entries {
            match &entry.sha {
                Some(sha) => {
                    if !state.blobs.contains_key(sha) {
                        return Err(status(422, "tree.sha is not a blob"));
                    }
                    tree.insert(entry.path.clone(), sha.clone());
                }
                None => {
                    tree.remove(&entry.path);
                }
            }
        }
        Ok(state.write_tree(tree))
    }

    async fn create_commit(&self, message: &str, tree: &str, parents: &[String]) -> Result<String> {
        let mut state = self.enter(format!("create_commit {message}"));
        state.network_fault()?;
        if !state.trees.contains_key(tree) {
            return Err(status(422, "tree is not a tree"));
        }
        Ok(state.write_commit(tree.to_string(), parents.to_vec()))
    }

    async fn get_contents(&self, path: &str, reference: &str) -> Result<Contents> {
        let state = self.enter(format!("get_contents {path}"));
        let path = path.trim_matches('/');
        let tree = state
            .tree_of(reference)
            .ok_or_else(|| status(404, "Not Found"))?;

        if let Some(blob) = tree.get(path) {
            return Ok(Contents::File(
                state.blobs.get(blob).cloned().unwrap_or_default(),
            ));
        }

        let prefix = format!("{path}/");
        let mut entries: Vec<ContentEntry> = Vec::new();
        for file in tree.keys() {
            let Some(rest) = file.strip_prefix(&prefix) else {
                continue;
            };
            let entry = match rest.split_once('/') {
                Some((dir, _)) => ContentEntry {
                    path: format!("{prefix}{dir}"),
                    kind: ContentKind::Dir,
                },
                None => ContentEntry {
                    path: file.clone(),
                    kind: ContentKind::File,
                },
            };
            if !entries.contains(&entry) {
                entries.push(entry);
            }
        }
        if entries.is_empty() {
            return Err(status(404, "Not Found"));
        }
        Ok(Contents::Dir(entries))
    }

    async fn put_contents(&self, path: &str, content: &[u8], _message: &str) -> Result<String> {
        let mut state = self.enter(format!("put_contents {path}"));
        Ok(state.commit_files(&self.default_branch, &[(path, content)]))
    }

    async fn create_pull_request(
        &self,
        title: &str,
        head: &str,
        base: &str,
        _body: &str,
    ) -> Result<PullRequest> {
        let mut state = self.enter(format!("create_pull_request {head}"));
        if state.reject_pulls {
            return Err(status(422, "Validation Failed"));
        }
        if !state.refs.contains_key(head) || !state.refs.contains_key(base) {
            return Err(status(422, "Validation Failed"));
        }
        let number = state.pulls.len() as u64 + 1;
        state.pulls.push(MemoryPull {
            number,
            title: title.to_string(),
            head: head.to_string(),
            base: base.to_string(),
            merged: false,
        });
        Ok(PullRequest {
            number,
            html_url: format!("https://github.test/{}/pull/{number}", self.repository),
        })
    }

    async fn merge_pull_request(&self, number: u64, _commit_title: &str) -> Result<String> {
        let mut state = self.enter(format!("merge_pull_request {number}"));
        if state.merge_conflicts > 0 {
            state.merge_conflicts -= 1;
            return Err(status(409, "Head branch was modified"));
        }
        let index = state
            .pulls
            .iter()
            .position(|p| p.number == number)
            .ok_or_else(|| status(404, "Not Found"))?;
        let pull = state.pulls[index].clone();
        if pull.merged {
            return Err(status(405, "Pull Request is not mergeable"));
        }
        let head_tip = state
            .refs
            .get(&pull.head)
            .cloned()
            .ok_or_else(|| status(422, "head branch is gone"))?;
        let base_tip = state.refs.get(&pull.base).cloned();
        let tree = state
            .commits
            .get(&head_tip)
            .map(|c| c.tree.clone())
            .ok_or_else(|| status(404, "Not Found"))?;

        let commit = state.write_commit(tree, base_tip.into_iter().collect());
        state.refs.insert(pull.base.clone(), commit.clone());
        state.pulls[index].merged = true;
        Ok(commit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_repository_answers_conflict_until_seeded() {
        let forge = MemoryForge::new();
        assert!(forge.get_branch_sha("main").await.unwrap_err().is_conflict());

        forge.put_contents("README.md", b"hi", "init").await.unwrap();
        let tip = forge.get_branch_sha("main").await.unwrap();
        assert_eq!(forge.files(&tip)["README.md"], b"hi");
        assert!(forge.get_branch_sha("other").await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn tree_edits_apply_on_top_of_base() {
        let forge = MemoryForge::new();
        let tip = forge.seed("main", &[("a", "1"), ("b", "2")]);
        let base = forge.get_commit_tree(&tip).await.unwrap();
        let blob = forge.create_blob(b"3").await.unwrap();
        let tree = forge
            .create_tree(&base, &[TreeEntry::blob("c", blob), TreeEntry::deletion("a")])
            .await
            .unwrap();
        let commit = forge.create_commit("edit", &tree, &[tip]).await.unwrap();
        forge.update_ref("main", &commit).await.unwrap();

        let files = forge.files("main");
        assert_eq!(files.keys().collect::<Vec<_>>(), vec!["b", "c"]);
    }
}
