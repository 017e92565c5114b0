use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Lifecycle stage of a pull request under autopilot control.
///
/// Stages only ever move forward, except for the explicit reset to
/// [`PrStage::Failed`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrStage {
    Created,
    WaitingCi,
    CiVerified,
    AwaitingApproval,
    Merging,
    Merged,
    PostMergeWatch,
    Done,
    Failed,
}

impl PrStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::WaitingCi => "waiting_ci",
            Self::CiVerified => "ci_verified",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Merging => "merging",
            Self::Merged => "merged",
            Self::PostMergeWatch => "post_merge_watch",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Position in the forward ordering. `Failed` sorts last since any stage
    /// may reset into it.
    pub fn ordinal(&self) -> u8 {
        match self {
            Self::Created => 0,
            Self::WaitingCi => 1,
            Self::CiVerified => 2,
            Self::AwaitingApproval => 3,
            Self::Merging => 4,
            Self::Merged => 5,
            Self::PostMergeWatch => 6,
            Self::Done => 7,
            Self::Failed => 8,
        }
    }
}

impl fmt::Display for PrStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for PrStage {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, ParseStateError> {
        match s {
            "created" => Ok(Self::Created),
            "waiting_ci" => Ok(Self::WaitingCi),
            "ci_verified" => Ok(Self::CiVerified),
            "awaiting_approval" => Ok(Self::AwaitingApproval),
            "merging" => Ok(Self::Merging),
            "merged" => Ok(Self::Merged),
            "post_merge_watch" => Ok(Self::PostMergeWatch),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(ParseStateError::UnknownStage(other.into())),
        }
    }
}

/// Aggregate CI state for a commit. Pending and running are equivalent for
/// merge gating; only `Success` permits a merge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CiStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl CiStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }

    pub fn permits_merge(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for CiStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for CiStatus {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, ParseStateError> {
        match s {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            other => Err(ParseStateError::UnknownCiStatus(other.into())),
        }
    }
}

#[derive(Error, Debug, PartialEq)]
pub enum ParseStateError {
    #[error("unknown PR stage: {0}")]
    UnknownStage(String),

    #[error("unknown CI status: {0}")]
    UnknownCiStatus(String),
}

/// One pull request's lifecycle row, as held in the live map and persisted
/// in the state store. `pr_number` is the unique key; `head_sha` never
/// changes once set (a new push replaces the PR rather than mutating it).
#[derive(Debug, Clone, PartialEq)]
pub struct PrState {
    pub pr_number: u64,
    pub pr_url: String,
    /// Tracker issue the PR originated from; 0 when there is none.
    pub issue_number: u64,
    pub branch_name: String,
    pub head_sha: String,
    /// Commit created by the merge, reported by the host; post-merge CI is
    /// watched on this SHA, not on the pre-merge head.
    pub merge_sha: Option<String>,
    pub stage: PrStage,
    pub ci_status: CiStatus,
    pub last_checked: Option<DateTime<Utc>>,
    pub ci_wait_started_at: Option<DateTime<Utc>>,
    pub merge_attempts: u32,
    /// Last human-readable failure message, empty when healthy.
    pub error: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub release_version: String,
    pub release_bump_type: String,
}

impl PrState {
    pub fn new<U, B, S>(pr_number: u64, pr_url: U, issue_number: u64, branch_name: B, head_sha: S) -> Self
    where
        U: Into<String>,
        B: Into<String>,
        S: Into<String>,
    {
        let now = Utc::now();
        Self {
            pr_number,
            pr_url: pr_url.into(),
            issue_number,
            branch_name: branch_name.into(),
            head_sha: head_sha.into(),
            merge_sha: None,
            stage: PrStage::Created,
            ci_status: CiStatus::Pending,
            last_checked: None,
            ci_wait_started_at: None,
            merge_attempts: 0,
            error: String::new(),
            created_at: now,
            updated_at: now,
            release_version: String::new(),
            release_bump_type: String::new(),
        }
    }
}

/// Per-PR failure counter bounding how often a flaky PR is reverified
/// before the controller gives up.
#[derive(Debug, Clone, PartialEq)]
pub struct PrFailureRecord {
    pub pr_number: u64,
    pub failure_count: u32,
    pub last_failure_time: DateTime<Utc>,
}
