//! Structured outcomes returned by `end_session`.
//!
//! The orchestration layer reads these (usually as JSON) to decide whether a
//! run succeeded. Best-effort post-commit steps (merge, branch cleanup,
//! logbook) report their failures here instead of raising, because by the
//! time they run the scraped data is already durable.

use serde::Serialize;

/// Outcome of finalizing one session.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RunResult {
    Skipped(Skipped),
    Filesystem(FilesystemRun),
    DailyBranch(DailyBranchRun),
    RunBranch(RunBranchRun),
}

impl RunResult {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped(Skipped {
            skipped: true,
            reason: reason.into(),
        })
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Self::Skipped(_))
    }

    /// Number of staged files durably applied.
    pub fn applied(&self) -> usize {
        match self {
            Self::Skipped(_) => 0,
            Self::Filesystem(run) => run.applied,
            Self::DailyBranch(run) => run.applied,
            Self::RunBranch(run) => run.applied,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Nothing was committed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Skipped {
    pub skipped: bool,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FilesystemRun {
    pub applied: usize,
    pub root: String,
    pub files: Vec<String>,
    pub commit_message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_file: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BatchCommit {
    pub commit_id: String,
    pub files_count: usize,
    pub batch: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DailyBranchRun {
    pub applied: usize,
    pub commit_id: String,
    pub repository: String,
    pub branch: String,
    pub files: Vec<String>,
    pub batches: Vec<BatchCommit>,
    pub total_batches: usize,
    pub finalization: Finalization,
}

/// Post-commit steps of the daily-branch backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Finalization {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logbook: Option<LogbookUpdate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logbook_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_cleanup: Option<BranchDeletion>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finalization_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LogbookUpdate {
    pub updated: bool,
    pub commit_id: String,
    pub logbook_path: String,
    pub runs_count: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    pub commit_id: String,
    pub source_branch: String,
    pub target_branch: String,
    pub commit_message: String,
    pub repository: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BranchDeletion {
    pub deleted: bool,
    pub branch_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunBranchRun {
    pub applied: usize,
    pub files_committed: usize,
    pub files_deleted: usize,
    pub commit_sha: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequestOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub branch_cleanup: Option<Cleanup>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub old_branches_cleanup: Option<Cleanup>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PullRequestOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    pub merged: bool,
    pub attempts: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Result of a best-effort branch cleanup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Cleanup {
    Skipped {
        skipped: String,
    },
    Branch {
        success: bool,
        branch: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Sweep {
        cleaned_up: usize,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
}

impl Cleanup {
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self::Skipped {
            skipped: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn skipped_serializes_flat() {
        let result = RunResult::skipped("no changes");
        assert!(result.is_skipped());
        assert_eq!(result.applied(), 0);
        assert_eq!(result.to_json(), json!({ "skipped": true, "reason": "no changes" }));
    }

    #[test]
    fn run_branch_result_shape() {
        let result = RunResult::RunBranch(RunBranchRun {
            applied: 2,
            files_committed: 2,
            files_deleted: 1,
            commit_sha: "abc".into(),
            branch: "ABC-2025-01-01-deadbeef".into(),
            pull_request: Some(PullRequestOutcome {
                success: true,
                pr_number: Some(7),
                pr_url: Some("https://example.test/pull/7".into()),
                merged: false,
                attempts: 1,
                error: None,
            }),
            branch_cleanup: Some(Cleanup::skipped("pr_not_merged")),
            old_branches_cleanup: Some(Cleanup::skipped("pr_not_merged")),
        });

        let value = result.to_json();
        assert_eq!(value["applied"], 2);
        assert_eq!(value["pull_request"]["pr_url"], "https://example.test/pull/7");
        assert_eq!(value["branch_cleanup"], json!({ "skipped": "pr_not_merged" }));
        assert!(value["pull_request"].get("error").is_none());
    }

    #[test]
    fn finalization_omits_absent_steps() {
        let fin = Finalization {
            finalization_error: Some("merge conflict".into()),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&fin).unwrap(),
            json!({ "finalization_error": "merge conflict" })
        );
    }
}
