use super::Error;
use crate::github::{CheckRun, CheckRunStatus, GithubClient, PullRequestIdentifier};
use crate::state::CiStatus;
use async_trait::async_trait;
use std::sync::Arc;

/// Reports one aggregate CI state for a commit.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CiMonitor: Send + Sync {
    async fn aggregate_status(
        &self,
        id: &PullRequestIdentifier,
        sha: &str,
    ) -> Result<CiStatus, Error>;

    /// Names of the checks that finished with a failing conclusion, for
    /// reporting purposes.
    async fn failing_checks(
        &self,
        id: &PullRequestIdentifier,
        sha: &str,
    ) -> Result<Vec<String>, Error>;
}

/// Aggregates the host's check runs for a commit. With a non-empty required
/// list only those checks count, and a required check that has not been
/// reported yet keeps the result at pending; with an empty list every
/// returned check counts.
pub struct ChecksCiMonitor<G> {
    github: Arc<G>,
    required_checks: Vec<String>,
}

impl<G: GithubClient> ChecksCiMonitor<G> {
    pub fn new(github: Arc<G>, required_checks: Vec<String>) -> Self {
        Self {
            github,
            required_checks,
        }
    }

    fn observed<'a>(&self, runs: &'a [CheckRun]) -> Vec<&'a CheckRun> {
        if self.required_checks.is_empty() {
            runs.iter().collect()
        } else {
            runs.iter()
                .filter(|run| self.required_checks.iter().any(|name| name == &run.name))
                .collect()
        }
    }

    fn aggregate(&self, runs: &[CheckRun]) -> CiStatus {
        let observed = self.observed(runs);

        if observed.iter().any(|run| {
            run.status == CheckRunStatus::Completed
                && run.conclusion.as_ref().is_some_and(|c| c.is_failing())
        }) {
            return CiStatus::Failure;
        }

        let unfinished: Vec<_> = observed
            .iter()
            .filter(|run| run.status != CheckRunStatus::Completed)
            .collect();
        if !unfinished.is_empty() {
            if unfinished
                .iter()
                .any(|run| run.status == CheckRunStatus::Queued)
            {
                return CiStatus::Pending;
            }
            return CiStatus::Running;
        }

        if !self.required_checks.is_empty() {
            let all_present = self
                .required_checks
                .iter()
                .all(|name| runs.iter().any(|run| &run.name == name));
            if !all_present {
                return CiStatus::Pending;
            }
        }

        let all_succeeded = observed.iter().all(|run| {
            matches!(
                run.conclusion,
                Some(crate::github::CheckRunConclusion::Success)
            )
        });
        if all_succeeded {
            CiStatus::Success
        } else {
            CiStatus::Pending
        }
    }
}

#[async_trait]
impl<G: GithubClient + Send + Sync> CiMonitor for ChecksCiMonitor<G> {
    async fn aggregate_status(
        &self,
        id: &PullRequestIdentifier,
        sha: &str,
    ) -> Result<CiStatus, Error> {
        let list = self.github.list_check_runs(id, sha).await?;
        Ok(self.aggregate(&list.check_runs))
    }

    async fn failing_checks(
        &self,
        id: &PullRequestIdentifier,
        sha: &str,
    ) -> Result<Vec<String>, Error> {
        let list = self.github.list_check_runs(id, sha).await?;
        let failing = self
            .observed(&list.check_runs)
            .into_iter()
            .filter(|run| {
                run.status == CheckRunStatus::Completed
                    && run.conclusion.as_ref().is_some_and(|c| c.is_failing())
            })
            .map(|run| run.name.clone())
            .collect();
        Ok(failing)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::client::MockGithubClient;
    use crate::github::{CheckRunConclusion, CheckRunList};
    use rstest::rstest;

    fn run(name: &str, status: CheckRunStatus, conclusion: Option<CheckRunConclusion>) -> CheckRun {
        CheckRun {
            name: name.into(),
            status,
            conclusion,
        }
    }

    fn monitor_with_runs(
        required: Vec<String>,
        runs: Vec<CheckRun>,
    ) -> ChecksCiMonitor<MockGithubClient> {
        let mut github = MockGithubClient::new();
        let total_count = runs.len() as u64;
        github.expect_list_check_runs().returning(move |_, _| {
            Ok(CheckRunList {
                total_count,
                check_runs: runs.clone(),
            })
        });
        ChecksCiMonitor::new(Arc::new(github), required)
    }

    fn identifier() -> PullRequestIdentifier {
        PullRequestIdentifier::new("acme", "widgets", 42)
    }

    #[tokio::test]
    async fn all_success_is_success() {
        let monitor = monitor_with_runs(
            vec![],
            vec![
                run("build", CheckRunStatus::Completed, Some(CheckRunConclusion::Success)),
                run("test", CheckRunStatus::Completed, Some(CheckRunConclusion::Success)),
            ],
        );
        let status = monitor.aggregate_status(&identifier(), "abc").await.unwrap();
        assert_eq!(status, CiStatus::Success);
    }

    #[rstest]
    #[case(CheckRunConclusion::Failure)]
    #[case(CheckRunConclusion::TimedOut)]
    #[case(CheckRunConclusion::Cancelled)]
    #[tokio::test]
    async fn any_failing_conclusion_wins(#[case] conclusion: CheckRunConclusion) {
        let monitor = monitor_with_runs(
            vec![],
            vec![
                run("build", CheckRunStatus::Completed, Some(CheckRunConclusion::Success)),
                run("test", CheckRunStatus::Completed, Some(conclusion)),
                run("lint", CheckRunStatus::InProgress, None),
            ],
        );
        let status = monitor.aggregate_status(&identifier(), "abc").await.unwrap();
        assert_eq!(status, CiStatus::Failure);
    }

    #[tokio::test]
    async fn queued_checks_report_pending() {
        let monitor = monitor_with_runs(
            vec![],
            vec![
                run("build", CheckRunStatus::Queued, None),
                run("test", CheckRunStatus::InProgress, None),
            ],
        );
        let status = monitor.aggregate_status(&identifier(), "abc").await.unwrap();
        assert_eq!(status, CiStatus::Pending);
    }

    #[tokio::test]
    async fn in_progress_checks_report_running() {
        let monitor = monitor_with_runs(vec![], vec![run("test", CheckRunStatus::InProgress, None)]);
        let status = monitor.aggregate_status(&identifier(), "abc").await.unwrap();
        assert_eq!(status, CiStatus::Running);
    }

    #[tokio::test]
    async fn missing_required_check_is_never_success() {
        let monitor = monitor_with_runs(
            vec!["build".into(), "test".into()],
            vec![run("build", CheckRunStatus::Completed, Some(CheckRunConclusion::Success))],
        );
        let status = monitor.aggregate_status(&identifier(), "abc").await.unwrap();
        assert_eq!(status, CiStatus::Pending);
    }

    #[tokio::test]
    async fn required_filter_ignores_unrelated_failures() {
        let monitor = monitor_with_runs(
            vec!["build".into()],
            vec![
                run("build", CheckRunStatus::Completed, Some(CheckRunConclusion::Success)),
                run("nightly", CheckRunStatus::Completed, Some(CheckRunConclusion::Failure)),
            ],
        );
        let status = monitor.aggregate_status(&identifier(), "abc").await.unwrap();
        assert_eq!(status, CiStatus::Success);
    }

    #[tokio::test]
    async fn neutral_conclusions_do_not_count_as_success() {
        let monitor = monitor_with_runs(
            vec![],
            vec![run("build", CheckRunStatus::Completed, Some(CheckRunConclusion::Neutral))],
        );
        let status = monitor.aggregate_status(&identifier(), "abc").await.unwrap();
        assert_eq!(status, CiStatus::Pending);
    }

    #[tokio::test]
    async fn no_checks_at_all_passes() {
        let monitor = monitor_with_runs(vec![], vec![]);
        let status = monitor.aggregate_status(&identifier(), "abc").await.unwrap();
        assert_eq!(status, CiStatus::Success);
    }

    #[tokio::test]
    async fn failing_checks_reports_names() {
        let monitor = monitor_with_runs(
            vec![],
            vec![
                run("build", CheckRunStatus::Completed, Some(CheckRunConclusion::Failure)),
                run("test", CheckRunStatus::Completed, Some(CheckRunConclusion::TimedOut)),
                run("lint", CheckRunStatus::Completed, Some(CheckRunConclusion::Success)),
            ],
        );
        let failing = monitor.failing_checks(&identifier(), "abc").await.unwrap();
        assert_eq!(failing, vec!["build".to_string(), "test".to_string()]);
    }
}
