use super::Error;
use crate::github::{GithubClient, IssueRequestBody};
use crate::state::PrState;
use log::info;
use std::fmt;
use std::sync::Arc;

const MAX_LOG_CHARS: usize = 2000;
const SHORT_SHA_LEN: usize = 7;

/// How a pull request terminally failed. The value is embedded verbatim in
/// the fix issue so downstream processors can route on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    CiPreMerge,
    CiPostMerge,
    MergeConflict,
    Deployment,
}

impl FailureType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CiPreMerge => "ci_pre_merge",
            Self::CiPostMerge => "ci_post_merge",
            Self::MergeConflict => "merge_conflict",
            Self::Deployment => "deployment",
        }
    }
}

impl fmt::Display for FailureType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Turns a terminal PR failure into a new tracker issue, closing the
/// autonomous loop: failed work becomes queued work.
pub struct FeedbackLoop<G> {
    github: Arc<G>,
    owner: String,
    repo: String,
    labels: Vec<String>,
}

impl<G> FeedbackLoop<G>
where
    G: GithubClient + Send + Sync,
{
    pub fn new<O, R>(github: Arc<G>, owner: O, repo: R, labels: Vec<String>) -> Self
    where
        O: Into<String>,
        R: Into<String>,
    {
        Self {
            github,
            owner: owner.into(),
            repo: repo.into(),
            labels,
        }
    }

    /// Files a fix issue for a failed PR and returns the new issue number.
    /// `iteration` is the cascade depth: 0 for the original PR, 1 for the
    /// first auto-generated fix, and so on.
    pub async fn create_failure_issue(
        &self,
        pr: &PrState,
        failure_type: FailureType,
        failed_checks: &[String],
        logs: &str,
        iteration: u32,
    ) -> Result<u64, Error> {
        let request = IssueRequestBody {
            title: Self::build_title(failure_type, pr.pr_number),
            body: Self::build_body(pr, failure_type, failed_checks, logs, iteration),
            labels: self.labels.clone(),
        };
        let issue = self.github.create_issue(&self.owner, &self.repo, &request).await?;
        info!(
            "Filed fix issue #{} for failed PR #{} ({})",
            issue.number, pr.pr_number, failure_type
        );
        Ok(issue.number)
    }

    fn build_title(failure_type: FailureType, pr_number: u64) -> String {
        match failure_type {
            FailureType::CiPreMerge => format!("Fix CI failure from PR #{}", pr_number),
            FailureType::CiPostMerge => format!("Fix post-merge CI failure (PR #{})", pr_number),
            FailureType::MergeConflict => format!("Resolve merge conflict for PR #{}", pr_number),
            FailureType::Deployment => format!("Fix deployment failure (PR #{})", pr_number),
        }
    }

    fn build_body(
        pr: &PrState,
        failure_type: FailureType,
        failed_checks: &[String],
        logs: &str,
        iteration: u32,
    ) -> String {
        let mut body = String::new();
        body.push_str("# Autopilot: Auto-Generated Fix Request\n\n");

        body.push_str("## Context\n\n");
        body.push_str(&format!("- **Original PR**: #{}\n", pr.pr_number));
        if pr.issue_number > 0 {
            body.push_str(&format!("- **Original Issue**: #{}\n", pr.issue_number));
        }
        body.push_str(&format!("- **Failure Type**: {}\n", failure_type));
        if pr.head_sha.len() >= SHORT_SHA_LEN {
            body.push_str(&format!("- **Commit**: {}\n", &pr.head_sha[..SHORT_SHA_LEN]));
        }
        if !pr.branch_name.is_empty() {
            body.push_str(&format!("- **Branch**: {}\n", pr.branch_name));
        }

        if !failed_checks.is_empty() {
            body.push_str("\n## Failed Checks\n\n");
            for check in failed_checks {
                body.push_str(&format!("- [ ] {}\n", check));
            }
        }

        if !logs.is_empty() {
            body.push_str("\n## CI Error Logs\n\n");
            body.push_str("<details>\n<summary>Click to expand</summary>\n\n```\n");
            body.push_str(&Self::truncate_logs(logs));
            body.push_str("\n```\n\n</details>\n");
        }

        body.push_str("\n## Task\n\n");
        body.push_str(Self::task_sentence(failure_type));
        body.push('\n');

        if pr.issue_number > 0 {
            body.push_str(&format!("\nDepends on: #{}\n", pr.issue_number));
        }

        body.push_str("\n---\nThis issue was auto-generated by Pilot autopilot.\n");

        if !pr.branch_name.is_empty() {
            body.push_str(&format!(
                "\n<!-- autopilot-meta branch:{} pr:{} iteration:{} -->\n",
                pr.branch_name, pr.pr_number, iteration
            ));
        }
        body
    }

    fn task_sentence(failure_type: FailureType) -> &'static str {
        match failure_type {
            FailureType::CiPreMerge => {
                "Fix the failing CI checks so the pull request can be merged."
            }
            FailureType::CiPostMerge => {
                "Fix the CI regression the merge introduced on the target branch."
            }
            FailureType::MergeConflict => {
                "Resolve the merge conflict so the change can land."
            }
            FailureType::Deployment => {
                "Fix the deployment failure and restore a deployable state."
            }
        }
    }

    fn truncate_logs(logs: &str) -> String {
        if logs.chars().count() <= MAX_LOG_CHARS {
            return logs.into();
        }
        let truncated: String = logs.chars().take(MAX_LOG_CHARS).collect();
        format!("{}... (truncated)", truncated)
    }
}
