use super::models::{
    CheckRunList, Issue, IssueRequestBody, MergeRequestBody, MergeResponse, PullRequest,
    PullRequestIdentifier, Review, ReviewRequestBody,
};
use crate::client::{ApiClient, Result};
use async_trait::async_trait;

/// The narrow code-host surface the autopilot consumes.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GithubClient {
    async fn pull_request_info(&self, id: &PullRequestIdentifier) -> Result<PullRequest>;
    async fn merge_pull_request(
        &self,
        id: &PullRequestIdentifier,
        body: &MergeRequestBody,
    ) -> Result<MergeResponse>;
    async fn create_review(
        &self,
        id: &PullRequestIdentifier,
        body: &ReviewRequestBody,
    ) -> Result<Review>;
    async fn list_check_runs(&self, id: &PullRequestIdentifier, sha: &str) -> Result<CheckRunList>;
    async fn create_issue(&self, owner: &str, repo: &str, body: &IssueRequestBody) -> Result<Issue>;
}

#[derive(Clone)]
pub struct DefaultGithubClient {
    client: ApiClient,
}

impl DefaultGithubClient {
    pub fn new<U: Into<String>, P: Into<String>>(username: U, token: P) -> Self {
        Self {
            client: ApiClient::new(username, token),
        }
    }

    fn make_pull_request_url(id: &PullRequestIdentifier) -> String {
        format!(
            "https://api.github.com/repos/{}/{}/pulls/{}",
            id.owner, id.repo, id.pull_number
        )
    }
}

#[async_trait]
impl GithubClient for DefaultGithubClient {
    async fn pull_request_info(&self, id: &PullRequestIdentifier) -> Result<PullRequest> {
        let url = Self::make_pull_request_url(id);
        self.client.get(&url).await
    }

    async fn merge_pull_request(
        &self,
        id: &PullRequestIdentifier,
        body: &MergeRequestBody,
    ) -> Result<MergeResponse> {
        let url = format!("{}/merge", Self::make_pull_request_url(id));
        self.client.put(&url, body).await
    }

    async fn create_review(
        &self,
        id: &PullRequestIdentifier,
        body: &ReviewRequestBody,
    ) -> Result<Review> {
        let url = format!("{}/reviews", Self::make_pull_request_url(id));
        self.client.post(&url, body).await
    }

    async fn list_check_runs(&self, id: &PullRequestIdentifier, sha: &str) -> Result<CheckRunList> {
        let url = format!(
            "https://api.github.com/repos/{}/{}/commits/{}/check-runs",
            id.owner, id.repo, sha,
        );
        self.client.get(&url).await
    }

    async fn create_issue(&self, owner: &str, repo: &str, body: &IssueRequestBody) -> Result<Issue> {
        let url = format!("https://api.github.com/repos/{}/{}/issues", owner, repo);
        self.client.post(&url, body).await
    }
}
