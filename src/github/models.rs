use regex::Regex;
use serde_derive::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub enum PullRequestState {
    #[serde(rename = "open")]
    Open,

    #[serde(rename = "closed")]
    Closed,

    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Branch {
    pub sha: String,

    #[serde(rename = "ref")]
    pub name: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PullRequest {
    pub number: u64,
    pub state: PullRequestState,
    pub title: String,
    pub body: Option<String>,
    pub merged: bool,

    /// Computed lazily by the host; `None` means "not known yet".
    pub mergeable: Option<bool>,

    pub html_url: String,
    pub head: Branch,
    pub base: Branch,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum MergeMethod {
    #[serde(rename = "merge")]
    Merge,

    #[serde(rename = "squash")]
    Squash,

    #[serde(rename = "rebase")]
    Rebase,
}

impl MergeMethod {
    /// Parses a configured method name. The empty string falls back to
    /// squash.
    pub fn parse(value: &str) -> Result<Self, UnknownMergeMethodError> {
        match value {
            "" | "squash" => Ok(Self::Squash),
            "merge" => Ok(Self::Merge),
            "rebase" => Ok(Self::Rebase),
            other => Err(UnknownMergeMethodError(other.into())),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
#[error("unknown merge method: {0}")]
pub struct UnknownMergeMethodError(String);

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct MergeRequestBody {
    pub sha: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_title: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit_message: Option<String>,

    pub merge_method: MergeMethod,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct MergeResponse {
    pub merged: bool,
    pub message: Option<String>,
    pub sha: Option<String>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub enum ReviewEvent {
    #[serde(rename = "APPROVE")]
    Approve,

    #[serde(rename = "REQUEST_CHANGES")]
    RequestChanges,

    #[serde(rename = "COMMENT")]
    Comment,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct ReviewRequestBody {
    pub event: ReviewEvent,
    pub body: String,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Review {
    pub id: u64,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub enum CheckRunStatus {
    #[serde(rename = "queued")]
    Queued,

    #[serde(rename = "in_progress")]
    InProgress,

    #[serde(rename = "completed")]
    Completed,

    #[serde(other)]
    Unknown,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub enum CheckRunConclusion {
    #[serde(rename = "success")]
    Success,

    #[serde(rename = "failure")]
    Failure,

    #[serde(rename = "neutral")]
    Neutral,

    #[serde(rename = "cancelled")]
    Cancelled,

    #[serde(rename = "timed_out")]
    TimedOut,

    #[serde(rename = "action_required")]
    ActionRequired,

    #[serde(rename = "skipped")]
    Skipped,

    #[serde(other)]
    Unknown,
}

impl CheckRunConclusion {
    pub fn is_failing(&self) -> bool {
        matches!(self, Self::Failure | Self::TimedOut | Self::Cancelled)
    }
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CheckRun {
    pub name: String,
    pub status: CheckRunStatus,
    pub conclusion: Option<CheckRunConclusion>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct CheckRunList {
    pub total_count: u64,
    pub check_runs: Vec<CheckRun>,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct IssueRequestBody {
    pub title: String,
    pub body: String,
    pub labels: Vec<String>,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct Issue {
    pub number: u64,
}

#[derive(Debug, PartialEq, Clone)]
pub struct PullRequestIdentifier {
    pub owner: String,
    pub repo: String,
    pub pull_number: u64,
}

impl PullRequestIdentifier {
    pub fn new<O, R>(owner: O, repo: R, pull_number: u64) -> Self
    where
        O: Into<String>,
        R: Into<String>,
    {
        Self {
            owner: owner.into(),
            repo: repo.into(),
            pull_number,
        }
    }

    pub fn from_app_url(url: &str) -> Result<Self, UrlParseError> {
        lazy_static! {
            static ref RE: Regex =
                Regex::new(r"^https://github.com/([\w_-]+)/([\w_-]+)/pull/([\d]+)$").unwrap();
        }
        if let Some(capture) = RE.captures_iter(url).next() {
            let identifier = Self {
                owner: capture[1].into(),
                repo: capture[2].into(),
                pull_number: capture[3].parse().unwrap(),
            };
            Ok(identifier)
        } else {
            Err(UrlParseError::MalformedUrl)
        }
    }
}

impl fmt::Display for PullRequestIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}#{}", self.owner, self.repo, self.pull_number)
    }
}

#[derive(Error, Debug, PartialEq, Clone)]
pub enum UrlParseError {
    #[error("malformed URL")]
    MalformedUrl,
}
