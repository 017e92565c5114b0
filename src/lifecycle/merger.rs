use super::monitor::CiMonitor;
use super::Error;
use crate::approval::{ApprovalConfig, ApprovalManager};
use crate::environment::ResolvedEnvironment;
use crate::github::{
    GithubClient, MergeMethod, MergeRequestBody, MergeResponse, PullRequestIdentifier,
    PullRequestState, ReviewEvent, ReviewRequestBody,
};
use crate::state::{CiStatus, PrState};
use log::{debug, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const AUTO_REVIEW_BODY: &str = "Auto-approved by Pilot autopilot";

/// Policy knobs for a single merge attempt.
#[derive(Debug, Clone)]
pub struct MergePolicy {
    pub environment: ResolvedEnvironment,
    pub merge_method: MergeMethod,
    pub auto_review: bool,
    pub approval_timeout: Duration,
    pub approval: ApprovalConfig,
}

/// Owns the decision procedure for merging one pull request: approval gate,
/// CI verification, optional self-review, then the merge call itself.
pub struct AutoMerger<G> {
    github: Arc<G>,
    ci: Option<Arc<dyn CiMonitor>>,
    approvals: Option<Arc<dyn ApprovalManager>>,
    policy: MergePolicy,
}

impl<G> AutoMerger<G>
where
    G: GithubClient + Send + Sync,
{
    pub fn new(
        github: Arc<G>,
        ci: Option<Arc<dyn CiMonitor>>,
        approvals: Option<Arc<dyn ApprovalManager>>,
        policy: MergePolicy,
    ) -> Self {
        Self {
            github,
            ci,
            approvals,
            policy,
        }
    }

    /// Checks whether the host would accept a merge right now. The boolean
    /// is accompanied by a human-readable reason when it is `false`.
    ///
    /// Unknown mergeability counts as mergeable: the host computes it
    /// lazily and the merge endpoint is the final arbiter.
    pub async fn can_merge(&self, id: &PullRequestIdentifier) -> Result<(bool, String), Error> {
        let pull_request = self.github.pull_request_info(id).await?;
        if pull_request.merged {
            return Ok((false, "already merged".into()));
        }
        if pull_request.state != PullRequestState::Open {
            return Ok((false, "PR is closed".into()));
        }
        if pull_request.mergeable == Some(false) {
            return Ok((false, "merge conflicts".into()));
        }
        Ok((true, String::new()))
    }

    pub fn requires_approval(&self) -> bool {
        self.policy.environment.require_approval
    }

    /// CI gating is never bypassed, whatever the environment.
    pub fn should_wait_for_ci(&self) -> bool {
        true
    }

    /// Runs the full merge pipeline: approval when the environment demands
    /// it, CI verification, optional auto-review, then the merge itself.
    /// The host's response carries the merge-commit SHA, which the caller
    /// needs for any post-merge CI watch.
    pub async fn merge_pr(
        &self,
        pr: &PrState,
        id: &PullRequestIdentifier,
    ) -> Result<MergeResponse, Error> {
        if self.requires_approval() {
            self.await_approval(pr).await?;
        }
        self.verify_ci(id, &pr.head_sha).await?;

        if self.policy.auto_review {
            let review = ReviewRequestBody {
                event: ReviewEvent::Approve,
                body: AUTO_REVIEW_BODY.into(),
            };
            // A failed self-review must not block the merge.
            if let Err(e) = self.github.create_review(id, &review).await {
                warn!("Failed to post auto-review on {}: {}", id, e);
            }
        }

        let request = MergeRequestBody {
            sha: pr.head_sha.clone(),
            commit_title: None,
            commit_message: None,
            merge_method: self.policy.merge_method.clone(),
        };
        info!(
            "Merging {} with '{:?}' merge method",
            id, self.policy.merge_method
        );
        let response = self.github.merge_pull_request(id, &request).await?;
        Ok(response)
    }

    async fn await_approval(&self, pr: &PrState) -> Result<(), Error> {
        let manager = self.approvals.as_ref().ok_or(Error::ApprovalNotConfigured)?;
        if !self.policy.approval.stage_enabled() {
            if self.policy.environment.is_prod() {
                return Err(Error::ApprovalDisabled(
                    self.policy.environment.name.clone(),
                ));
            }
            info!(
                "Pre-merge approval disabled for '{}', continuing without it",
                self.policy.environment.name
            );
            return Ok(());
        }
        info!("Requesting merge approval for PR #{}", pr.pr_number);
        match timeout(self.policy.approval_timeout, manager.request_approval(pr)).await {
            Err(_) => Err(Error::ApprovalTimeout),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(false)) => Err(Error::ApprovalRejected),
            Ok(Ok(true)) => Ok(()),
        }
    }

    async fn verify_ci(&self, id: &PullRequestIdentifier, sha: &str) -> Result<(), Error> {
        let monitor = match &self.ci {
            Some(monitor) => monitor,
            None => {
                debug!("No CI monitor configured, skipping verification");
                return Ok(());
            }
        };
        match monitor.aggregate_status(id, sha).await? {
            CiStatus::Success => Ok(()),
            CiStatus::Failure => Err(Error::CiFailing),
            CiStatus::Pending | CiStatus::Running => Err(Error::CiPending),
        }
    }
}
