pub mod client;
pub mod models;

pub use client::{DefaultGithubClient, GithubClient};
pub use models::{
    Branch, CheckRun, CheckRunConclusion, CheckRunList, CheckRunStatus, Issue, IssueRequestBody,
    MergeMethod, MergeRequestBody, MergeResponse, PullRequest, PullRequestIdentifier,
    PullRequestState, Review, ReviewEvent, ReviewRequestBody,
};
