use super::feedback::{FailureType, FeedbackLoop};
use super::merger::AutoMerger;
use super::monitor::CiMonitor;
use super::Error;
use crate::environment::ResolvedEnvironment;
use crate::github::{GithubClient, PullRequestIdentifier};
use crate::metrics::Metrics;
use crate::state::{CiStatus, PrFailureRecord, PrStage, PrState};
use crate::store::StateStore;
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Controller tuning. The poll interval is expected to be rate-limit
/// friendly; configuration loading clamps it from below.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub owner: String,
    pub repo: String,
    pub poll_interval: Duration,
    pub max_merge_attempts: u32,
    /// API errors per minute above which workers pause.
    pub circuit_breaker_threshold: f64,
    pub circuit_breaker_pause: Duration,
}

enum StepOutcome {
    /// The stage changed; process the next one immediately.
    Progressed,
    /// Nothing to do until the next poll tick.
    Waiting,
}

/// The lifecycle engine. Owns the authoritative in-memory PR table and
/// drives every active PR through its stages on a dedicated worker task;
/// each PR has exactly one writer. Every transition is persisted through
/// the store before the live table or any gauge reflects it, so a crash at
/// any point recovers to a well-defined stage.
pub struct Controller<G> {
    store: Arc<StateStore>,
    metrics: Arc<Metrics>,
    merger: AutoMerger<G>,
    ci: Arc<dyn CiMonitor>,
    feedback: FeedbackLoop<G>,
    environment: ResolvedEnvironment,
    config: ControllerConfig,
    prs: Mutex<HashMap<u64, PrState>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    breaker_tripped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl<G> Controller<G>
where
    G: GithubClient + Send + Sync + 'static,
{
    pub fn new(
        store: Arc<StateStore>,
        metrics: Arc<Metrics>,
        merger: AutoMerger<G>,
        ci: Arc<dyn CiMonitor>,
        feedback: FeedbackLoop<G>,
        environment: ResolvedEnvironment,
        config: ControllerConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            store,
            metrics,
            merger,
            ci,
            feedback,
            environment,
            config,
            prs: Mutex::new(HashMap::new()),
            workers: Mutex::new(Vec::new()),
            breaker_tripped: AtomicBool::new(false),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Takes ownership of a freshly created PR. The row is persisted before
    /// the live table sees it; `iteration` is this PR's cascade depth (0
    /// for work that did not come from a previous autopilot fix issue).
    pub fn register_pr(self: &Arc<Self>, pr: PrState, iteration: u32) -> Result<(), Error> {
        if self.prs.lock().unwrap().contains_key(&pr.pr_number) {
            warn!("PR #{} is already registered, ignoring duplicate", pr.pr_number);
            return Ok(());
        }
        self.store.save_pr_state(&pr)?;
        self.store
            .set_metadata(&iteration_key(pr.pr_number), &iteration.to_string())?;
        info!("Registered PR #{} ({})", pr.pr_number, pr.pr_url);
        self.insert_and_spawn(pr);
        Ok(())
    }

    /// Rehydrates from the store after a restart and resumes every
    /// non-terminal PR from its persisted stage.
    pub fn recover(self: &Arc<Self>) -> Result<usize, Error> {
        let mut resumed = 0;
        for pr in self.store.load_all_pr_states()? {
            if pr.stage.is_terminal() {
                continue;
            }
            info!("Resuming PR #{} at stage '{}'", pr.pr_number, pr.stage);
            self.insert_and_spawn(pr);
            resumed += 1;
        }
        Ok(resumed)
    }

    /// A receiver companions (like the metrics persister) can select on.
    pub fn subscribe_shutdown(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    pub fn active_prs(&self) -> Vec<PrState> {
        self.prs.lock().unwrap().values().cloned().collect()
    }

    /// Signals every worker and waits for each to park at a persisted
    /// stage.
    pub async fn shutdown(&self) {
        info!("Shutting down lifecycle controller");
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = std::mem::take(&mut *self.workers.lock().unwrap());
        for handle in handles {
            if let Err(e) = handle.await {
                warn!("Worker task ended abnormally: {}", e);
            }
        }
    }

    fn insert_and_spawn(self: &Arc<Self>, pr: PrState) {
        let pr_number = pr.pr_number;
        {
            let mut prs = self.prs.lock().unwrap();
            prs.insert(pr_number, pr);
            let all: Vec<PrState> = prs.values().cloned().collect();
            drop(prs);
            self.refresh_gauges(&all);
        }
        let controller = Arc::clone(self);
        let handle = tokio::spawn(controller.drive_pr(pr_number));
        self.workers.lock().unwrap().push(handle);
    }

    async fn drive_pr(self: Arc<Self>, pr_number: u64) {
        let mut shutdown = self.shutdown_rx.clone();
        loop {
            if *shutdown.borrow() {
                return;
            }
            let pr = match self.prs.lock().unwrap().get(&pr_number) {
                Some(pr) => pr.clone(),
                None => return,
            };
            if pr.stage.is_terminal() {
                return;
            }
            self.pause_if_tripped(&mut shutdown).await;

            let outcome = tokio::select! {
                outcome = self.advance(pr) => outcome,
                _ = shutdown.changed() => return,
            };
            match outcome {
                Ok(StepOutcome::Progressed) => continue,
                Ok(StepOutcome::Waiting) => {
                    if !self.wait_for_tick(&mut shutdown).await {
                        return;
                    }
                }
                Err(e) => {
                    if e.is_rate_limited() {
                        self.metrics.record_issue_processed("rate_limited");
                    }
                    if e.is_transient_transport() {
                        debug!("Transient failure for PR #{}, will retry: {}", pr_number, e);
                    } else {
                        warn!("Step for PR #{} failed, will retry: {}", pr_number, e);
                    }
                    if !self.wait_for_tick(&mut shutdown).await {
                        return;
                    }
                }
            }
        }
    }

    async fn advance(&self, mut pr: PrState) -> Result<StepOutcome, Error> {
        match pr.stage {
            PrStage::Created => {
                pr.stage = PrStage::WaitingCi;
                pr.ci_wait_started_at = Some(Utc::now());
                self.persist(pr)?;
                Ok(StepOutcome::Progressed)
            }
            PrStage::WaitingCi => self.step_waiting_ci(pr).await,
            PrStage::CiVerified => {
                pr.stage = if self.merger.requires_approval() {
                    PrStage::AwaitingApproval
                } else {
                    PrStage::Merging
                };
                if pr.ci_wait_started_at.is_none() {
                    pr.ci_wait_started_at = Some(Utc::now());
                }
                self.persist(pr)?;
                Ok(StepOutcome::Progressed)
            }
            PrStage::AwaitingApproval | PrStage::Merging => self.step_merge(pr).await,
            PrStage::Merged => {
                if self.environment.skip_post_merge_ci {
                    pr.stage = PrStage::Done;
                    self.persist(pr)?;
                } else {
                    pr.stage = PrStage::PostMergeWatch;
                    pr.ci_wait_started_at = Some(Utc::now());
                    self.persist(pr)?;
                }
                Ok(StepOutcome::Progressed)
            }
            PrStage::PostMergeWatch => self.step_post_merge(pr).await,
            PrStage::Done | PrStage::Failed => Ok(StepOutcome::Waiting),
        }
    }

    async fn step_waiting_ci(&self, mut pr: PrState) -> Result<StepOutcome, Error> {
        let id = self.identifier(pr.pr_number);
        let status = self
            .ci
            .aggregate_status(&id, &pr.head_sha)
            .await
            .map_err(|e| self.note_api_error(e, "checks"))?;
        pr.last_checked = Some(Utc::now());
        pr.ci_status = status;
        match status {
            CiStatus::Success => {
                if let Some(started) = pr.ci_wait_started_at {
                    if let Ok(waited) = (Utc::now() - started).to_std() {
                        self.metrics.record_ci_wait(waited);
                    }
                }
                pr.stage = PrStage::CiVerified;
                self.persist(pr)?;
                Ok(StepOutcome::Progressed)
            }
            CiStatus::Failure => {
                let failing = self
                    .ci
                    .failing_checks(&id, &pr.head_sha)
                    .await
                    .unwrap_or_default();
                self.fail_pr(
                    pr,
                    "CI checks failed before merge",
                    Some((FailureType::CiPreMerge, failing)),
                )
                .await?;
                Ok(StepOutcome::Progressed)
            }
            CiStatus::Pending | CiStatus::Running => {
                if self.ci_wait_expired(&pr) {
                    let reason = format!(
                        "timed out waiting for CI after {}s",
                        self.environment.ci_timeout.as_secs()
                    );
                    self.fail_pr(pr, &reason, None).await?;
                    Ok(StepOutcome::Progressed)
                } else {
                    self.persist(pr)?;
                    Ok(StepOutcome::Waiting)
                }
            }
        }
    }

    async fn step_merge(&self, mut pr: PrState) -> Result<StepOutcome, Error> {
        let id = self.identifier(pr.pr_number);
        let readiness = self
            .merger
            .can_merge(&id)
            .await
            .map_err(|e| self.note_api_error(e, "pulls"))?;
        let outcome = match readiness {
            (false, reason) => Err(Error::NotMergeable(reason)),
            (true, _) => self.merger.merge_pr(&pr, &id).await,
        };
        match outcome {
            Ok(response) => {
                pr.stage = PrStage::Merged;
                pr.error.clear();
                pr.merge_sha = response.sha;
                self.persist(pr.clone())?;
                self.metrics.record_pr_merged();
                if let Ok(elapsed) = (Utc::now() - pr.created_at).to_std() {
                    self.metrics.record_time_to_merge(elapsed);
                }
                if let Err(e) = self.store.remove_pr_failures(pr.pr_number) {
                    warn!("Failed to clear failure counter for PR #{}: {}", pr.pr_number, e);
                }
                info!("PR #{} merged", pr.pr_number);
                Ok(StepOutcome::Progressed)
            }
            Err(e) if e.is_approval_final() => {
                // A human (or the lack of one) said no; that decision is
                // final and files no follow-up work.
                let reason = e.to_string();
                self.fail_pr(pr, &reason, None).await?;
                Ok(StepOutcome::Progressed)
            }
            Err(e) => {
                if matches!(e, Error::Client(_)) {
                    self.metrics.record_api_error("merge");
                }
                pr.merge_attempts += 1;
                pr.error = e.to_string();
                self.bump_failure_counter(pr.pr_number);
                if pr.merge_attempts < self.config.max_merge_attempts {
                    debug!(
                        "Merge attempt {}/{} for PR #{} failed: {}",
                        pr.merge_attempts, self.config.max_merge_attempts, pr.pr_number, e
                    );
                    self.persist(pr)?;
                    return Ok(StepOutcome::Waiting);
                }
                let feedback = if e.is_merge_conflict() {
                    self.metrics.record_pr_conflicting();
                    Some((FailureType::MergeConflict, Vec::new()))
                } else if e.is_ci_failure() {
                    let failing = self
                        .ci
                        .failing_checks(&id, &pr.head_sha)
                        .await
                        .unwrap_or_default();
                    Some((FailureType::CiPreMerge, failing))
                } else {
                    Some((FailureType::CiPreMerge, Vec::new()))
                };
                let reason = e.to_string();
                self.fail_pr(pr, &reason, feedback).await?;
                Ok(StepOutcome::Progressed)
            }
        }
    }

    async fn step_post_merge(&self, mut pr: PrState) -> Result<StepOutcome, Error> {
        let id = self.identifier(pr.pr_number);
        // The watch follows the commit the merge created; the pre-merge
        // head already passed CI and proves nothing about the branch.
        let watch_sha = pr.merge_sha.clone().unwrap_or_else(|| pr.head_sha.clone());
        let status = self
            .ci
            .aggregate_status(&id, &watch_sha)
            .await
            .map_err(|e| self.note_api_error(e, "checks"))?;
        pr.last_checked = Some(Utc::now());
        pr.ci_status = status;
        match status {
            CiStatus::Failure => {
                let failing = self
                    .ci
                    .failing_checks(&id, &watch_sha)
                    .await
                    .unwrap_or_default();
                self.fail_pr(
                    pr,
                    "CI regressed after merge",
                    Some((FailureType::CiPostMerge, failing)),
                )
                .await?;
                Ok(StepOutcome::Progressed)
            }
            CiStatus::Success => {
                pr.stage = PrStage::Done;
                self.persist(pr)?;
                Ok(StepOutcome::Progressed)
            }
            CiStatus::Pending | CiStatus::Running => {
                if self.ci_wait_expired(&pr) {
                    // The merge already landed; an unresolved watch window
                    // only warrants a warning, not a fix issue.
                    warn!(
                        "Post-merge watch for PR #{} expired without a CI verdict",
                        pr.pr_number
                    );
                    pr.stage = PrStage::Done;
                    self.persist(pr)?;
                    Ok(StepOutcome::Progressed)
                } else {
                    self.persist(pr)?;
                    Ok(StepOutcome::Waiting)
                }
            }
        }
    }

    async fn fail_pr(
        &self,
        mut pr: PrState,
        reason: &str,
        feedback: Option<(FailureType, Vec<String>)>,
    ) -> Result<(), Error> {
        pr.stage = PrStage::Failed;
        pr.error = reason.into();
        self.persist(pr.clone())?;
        self.metrics.record_pr_failed();
        warn!("PR #{} failed: {}", pr.pr_number, reason);

        if let Some((failure_type, failed_checks)) = feedback {
            let iteration = self.next_iteration(pr.pr_number);
            match self
                .feedback
                .create_failure_issue(&pr, failure_type, &failed_checks, "", iteration)
                .await
            {
                Ok(issue) => {
                    info!("Queued follow-up issue #{} for PR #{}", issue, pr.pr_number)
                }
                Err(e) => {
                    if matches!(e, Error::Client(_)) {
                        self.metrics.record_api_error("issues");
                    }
                    warn!("Failed to file fix issue for PR #{}: {}", pr.pr_number, e);
                }
            }
        }
        Ok(())
    }

    /// Writes the row through the store, then updates the live table and
    /// gauges. A store failure leaves both untouched so the step retries.
    fn persist(&self, pr: PrState) -> Result<(), Error> {
        self.store.save_pr_state(&pr)?;
        let mut prs = self.prs.lock().unwrap();
        if let Some(previous) = prs.get(&pr.pr_number) {
            debug_assert!(
                pr.stage == PrStage::Failed || pr.stage.ordinal() >= previous.stage.ordinal(),
                "stage must not move backwards"
            );
        }
        prs.insert(pr.pr_number, pr);
        let all: Vec<PrState> = prs.values().cloned().collect();
        drop(prs);
        self.refresh_gauges(&all);
        Ok(())
    }

    fn refresh_gauges(&self, prs: &[PrState]) {
        self.metrics.update_active_prs(prs);
        let pending = prs.iter().filter(|pr| !pr.stage.is_terminal()).count();
        let failed = prs.iter().filter(|pr| pr.stage == PrStage::Failed).count();
        self.metrics.set_queue_depth(pending as u64);
        self.metrics.set_failed_queue_depth(failed as u64);
    }

    fn bump_failure_counter(&self, pr_number: u64) {
        let count = self
            .store
            .load_all_pr_failures()
            .ok()
            .and_then(|records| {
                records
                    .into_iter()
                    .find(|record| record.pr_number == pr_number)
            })
            .map(|record| record.failure_count)
            .unwrap_or(0);
        let record = PrFailureRecord {
            pr_number,
            failure_count: count + 1,
            last_failure_time: Utc::now(),
        };
        if let Err(e) = self.store.save_pr_failures(&record) {
            warn!("Failed to record failure for PR #{}: {}", pr_number, e);
        }
    }

    fn next_iteration(&self, pr_number: u64) -> u32 {
        let current = self
            .store
            .get_metadata(&iteration_key(pr_number))
            .ok()
            .flatten()
            .and_then(|value| value.parse::<u32>().ok())
            .unwrap_or(0);
        current + 1
    }

    fn ci_wait_expired(&self, pr: &PrState) -> bool {
        let started = pr.ci_wait_started_at.unwrap_or(pr.created_at);
        match (Utc::now() - started).to_std() {
            Ok(elapsed) => elapsed >= self.environment.ci_timeout,
            Err(_) => false,
        }
    }

    async fn pause_if_tripped(&self, shutdown: &mut watch::Receiver<bool>) {
        let rate = self.metrics.snapshot().api_error_rate;
        if rate <= self.config.circuit_breaker_threshold {
            self.breaker_tripped.store(false, Ordering::SeqCst);
            return;
        }
        if !self.breaker_tripped.swap(true, Ordering::SeqCst) {
            self.metrics.record_circuit_breaker_trip();
            warn!(
                "API error rate {:.1}/min exceeded {:.1}/min, pausing for {:?}",
                rate, self.config.circuit_breaker_threshold, self.config.circuit_breaker_pause
            );
        }
        tokio::select! {
            _ = sleep(self.config.circuit_breaker_pause) => {}
            _ = shutdown.changed() => {}
        }
    }

    /// Returns `false` when shutdown was signalled during the wait.
    async fn wait_for_tick(&self, shutdown: &mut watch::Receiver<bool>) -> bool {
        tokio::select! {
            _ = sleep(self.config.poll_interval) => true,
            _ = shutdown.changed() => false,
        }
    }

    fn note_api_error(&self, e: Error, endpoint: &str) -> Error {
        if matches!(e, Error::Client(_)) {
            self.metrics.record_api_error(endpoint);
        }
        e
    }

    fn identifier(&self, pr_number: u64) -> PullRequestIdentifier {
        PullRequestIdentifier::new(
            self.config.owner.as_str(),
            self.config.repo.as_str(),
            pr_number,
        )
    }
}

fn iteration_key(pr_number: u64) -> String {
    format!("pr_iteration:{}", pr_number)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::approval::ApprovalConfig;
    use crate::github::client::MockGithubClient;
    use crate::github::{Branch, Issue, MergeMethod, MergeResponse, PullRequest, PullRequestState, Review};
    use crate::lifecycle::merger::MergePolicy;
    use crate::lifecycle::monitor::MockCiMonitor;

    fn open_pr(mergeable: Option<bool>) -> PullRequest {
        PullRequest {
            number: 42,
            state: PullRequestState::Open,
            title: "Add widget".into(),
            body: None,
            merged: false,
            mergeable,
            html_url: "https://github.com/acme/widgets/pull/42".into(),
            head: Branch {
                sha: "abc1234567890".into(),
                name: "pilot/GH-10".into(),
            },
            base: Branch {
                sha: "def".into(),
                name: "main".into(),
            },
        }
    }

    fn new_pr() -> PrState {
        PrState::new(
            42,
            "https://github.com/acme/widgets/pull/42",
            10,
            "pilot/GH-10",
            "abc1234567890",
        )
    }

    fn controller_config(max_merge_attempts: u32) -> ControllerConfig {
        ControllerConfig {
            owner: "acme".into(),
            repo: "widgets".into(),
            poll_interval: Duration::from_millis(10),
            max_merge_attempts,
            circuit_breaker_threshold: 1000.0,
            circuit_breaker_pause: Duration::from_millis(10),
        }
    }

    fn build_controller(
        github: MockGithubClient,
        ci: MockCiMonitor,
        environment: ResolvedEnvironment,
        auto_review: bool,
        max_merge_attempts: u32,
    ) -> (Arc<Controller<MockGithubClient>>, Arc<StateStore>, Arc<Metrics>) {
        let github = Arc::new(github);
        let ci: Arc<dyn CiMonitor> = Arc::new(ci);
        let store = Arc::new(StateStore::open_in_memory().unwrap());
        let metrics = Arc::new(Metrics::new());
        let policy = MergePolicy {
            environment: environment.clone(),
            merge_method: MergeMethod::Squash,
            auto_review,
            approval_timeout: Duration::from_millis(100),
            approval: ApprovalConfig::default(),
        };
        let merger = AutoMerger::new(github.clone(), Some(ci.clone()), None, policy);
        let feedback = FeedbackLoop::new(github.clone(), "acme", "widgets", vec![]);
        let controller = Arc::new(Controller::new(
            store.clone(),
            metrics.clone(),
            merger,
            ci,
            feedback,
            environment,
            controller_config(max_merge_attempts),
        ));
        (controller, store, metrics)
    }

    async fn wait_for_stage(store: &StateStore, pr_number: u64, stage: PrStage) -> PrState {
        for _ in 0..300 {
            if let Some(pr) = store.get_pr_state(pr_number).unwrap() {
                if pr.stage == stage {
                    return pr;
                }
            }
            sleep(Duration::from_millis(10)).await;
        }
        panic!("PR #{} never reached stage '{}'", pr_number, stage);
    }

    #[tokio::test]
    async fn dev_happy_path_runs_to_done() {
        let mut github = MockGithubClient::new();
        github
            .expect_pull_request_info()
            .returning(|_| Ok(open_pr(Some(true))));
        github
            .expect_create_review()
            .times(1)
            .returning(|_, _| Ok(Review { id: 1 }));
        github
            .expect_merge_pull_request()
            .withf(|_, body| body.merge_method == MergeMethod::Squash)
            .times(1)
            .returning(|_, _| {
                Ok(MergeResponse {
                    merged: true,
                    message: None,
                    sha: None,
                })
            });
        let mut ci = MockCiMonitor::new();
        ci.expect_aggregate_status()
            .returning(|_, _| Ok(CiStatus::Success));

        let (controller, store, metrics) =
            build_controller(github, ci, ResolvedEnvironment::dev(), true, 3);
        controller.register_pr(new_pr(), 0).unwrap();

        let done = wait_for_stage(&store, 42, PrStage::Done).await;
        assert!(done.error.is_empty());
        controller.shutdown().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.prs_merged, 1);
        assert_eq!(snapshot.prs_failed, 0);
        assert_eq!(snapshot.pr_time_to_merge.len(), 1);
        assert_eq!(snapshot.ci_wait_durations.len(), 1);
    }

    #[tokio::test]
    async fn ci_failure_files_a_fix_issue() {
        let mut github = MockGithubClient::new();
        github
            .expect_create_issue()
            .withf(|owner, repo, request| {
                owner == "acme"
                    && repo == "widgets"
                    && request.title == "Fix CI failure from PR #42"
                    && request.body.contains("iteration:1")
            })
            .times(1)
            .returning(|_, _, _| Ok(Issue { number: 101 }));
        let mut ci = MockCiMonitor::new();
        ci.expect_aggregate_status()
            .returning(|_, _| Ok(CiStatus::Failure));
        ci.expect_failing_checks()
            .returning(|_, _| Ok(vec!["build".to_string()]));

        let (controller, store, metrics) =
            build_controller(github, ci, ResolvedEnvironment::dev(), false, 3);
        controller.register_pr(new_pr(), 0).unwrap();

        let failed = wait_for_stage(&store, 42, PrStage::Failed).await;
        assert!(failed.error.contains("CI checks failed"));
        controller.shutdown().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.prs_failed, 1);
        assert_eq!(snapshot.prs_merged, 0);
    }

    #[tokio::test]
    async fn merge_conflicts_exhaust_the_retry_budget() {
        let mut github = MockGithubClient::new();
        github
            .expect_pull_request_info()
            .returning(|_| Ok(open_pr(Some(false))));
        github
            .expect_create_issue()
            .withf(|_, _, request| request.title == "Resolve merge conflict for PR #42")
            .times(1)
            .returning(|_, _, _| Ok(Issue { number: 102 }));
        let mut ci = MockCiMonitor::new();
        ci.expect_aggregate_status()
            .returning(|_, _| Ok(CiStatus::Success));

        let (controller, store, metrics) =
            build_controller(github, ci, ResolvedEnvironment::dev(), false, 2);
        controller.register_pr(new_pr(), 0).unwrap();

        let failed = wait_for_stage(&store, 42, PrStage::Failed).await;
        assert_eq!(failed.merge_attempts, 2);
        assert!(failed.error.contains("merge conflicts"));
        controller.shutdown().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.prs_conflicting, 1);
        assert_eq!(snapshot.prs_failed, 1);
        let failures = store.load_all_pr_failures().unwrap();
        assert_eq!(failures[0].failure_count, 2);
    }

    #[tokio::test]
    async fn prod_without_manager_fails_without_feedback() {
        let mut github = MockGithubClient::new();
        github
            .expect_pull_request_info()
            .returning(|_| Ok(open_pr(Some(true))));
        github.expect_create_issue().times(0);
        let mut ci = MockCiMonitor::new();
        ci.expect_aggregate_status()
            .returning(|_, _| Ok(CiStatus::Success));

        let (controller, store, metrics) =
            build_controller(github, ci, ResolvedEnvironment::prod(), false, 3);
        controller.register_pr(new_pr(), 0).unwrap();

        let failed = wait_for_stage(&store, 42, PrStage::Failed).await;
        assert!(failed.error.contains("approval required"));
        controller.shutdown().await;
        assert_eq!(metrics.snapshot().prs_failed, 1);
    }

    #[tokio::test]
    async fn ci_timeout_fails_without_feedback() {
        let mut github = MockGithubClient::new();
        github.expect_create_issue().times(0);
        let mut ci = MockCiMonitor::new();
        ci.expect_aggregate_status()
            .returning(|_, _| Ok(CiStatus::Pending));

        let mut environment = ResolvedEnvironment::dev();
        environment.ci_timeout = Duration::ZERO;
        let (controller, store, _metrics) =
            build_controller(github, ci, environment, false, 3);
        controller.register_pr(new_pr(), 0).unwrap();

        let failed = wait_for_stage(&store, 42, PrStage::Failed).await;
        assert!(failed.error.contains("timed out waiting for CI"));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn stage_environment_watches_the_merge_commit() {
        let mut github = MockGithubClient::new();
        github
            .expect_pull_request_info()
            .returning(|_| Ok(open_pr(Some(true))));
        github
            .expect_merge_pull_request()
            .times(1)
            .returning(|_, _| {
                Ok(MergeResponse {
                    merged: true,
                    message: None,
                    sha: Some("99feedbeef0".into()),
                })
            });
        let mut ci = MockCiMonitor::new();
        ci.expect_aggregate_status()
            .withf(|_, sha| sha == "abc1234567890" || sha == "99feedbeef0")
            .returning(|_, _| Ok(CiStatus::Success));

        let (controller, store, _metrics) =
            build_controller(github, ci, ResolvedEnvironment::stage(), false, 3);
        controller.register_pr(new_pr(), 0).unwrap();

        let done = wait_for_stage(&store, 42, PrStage::Done).await;
        assert_eq!(done.ci_status, CiStatus::Success);
        assert_eq!(done.merge_sha.as_deref(), Some("99feedbeef0"));
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn post_merge_regression_files_a_fix_issue() {
        let mut github = MockGithubClient::new();
        github
            .expect_pull_request_info()
            .returning(|_| Ok(open_pr(Some(true))));
        github
            .expect_merge_pull_request()
            .times(1)
            .returning(|_, _| {
                Ok(MergeResponse {
                    merged: true,
                    message: None,
                    sha: Some("99feedbeef0".into()),
                })
            });
        github
            .expect_create_issue()
            .withf(|_, _, request| request.title == "Fix post-merge CI failure (PR #42)")
            .times(1)
            .returning(|_, _, _| Ok(Issue { number: 103 }));
        // The pre-merge head is green; the commit the merge created is not.
        let mut ci = MockCiMonitor::new();
        ci.expect_aggregate_status()
            .withf(|_, sha| sha == "abc1234567890")
            .returning(|_, _| Ok(CiStatus::Success));
        ci.expect_aggregate_status()
            .withf(|_, sha| sha == "99feedbeef0")
            .returning(|_, _| Ok(CiStatus::Failure));
        ci.expect_failing_checks()
            .withf(|_, sha| sha == "99feedbeef0")
            .returning(|_, _| Ok(vec!["deploy-check".to_string()]));

        let (controller, store, metrics) =
            build_controller(github, ci, ResolvedEnvironment::stage(), false, 3);
        controller.register_pr(new_pr(), 0).unwrap();

        let failed = wait_for_stage(&store, 42, PrStage::Failed).await;
        assert!(failed.error.contains("CI regressed after merge"));
        assert_eq!(failed.merge_sha.as_deref(), Some("99feedbeef0"));
        controller.shutdown().await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.prs_merged, 1);
        assert_eq!(snapshot.prs_failed, 1);
    }

    #[tokio::test]
    async fn recovery_resumes_in_flight_prs() {
        let mut github = MockGithubClient::new();
        github
            .expect_pull_request_info()
            .returning(|_| Ok(open_pr(Some(true))));
        github
            .expect_merge_pull_request()
            .times(1)
            .returning(|_, _| {
                Ok(MergeResponse {
                    merged: true,
                    message: None,
                    sha: None,
                })
            });
        let mut ci = MockCiMonitor::new();
        ci.expect_aggregate_status()
            .returning(|_, _| Ok(CiStatus::Success));

        let (controller, store, _metrics) =
            build_controller(github, ci, ResolvedEnvironment::dev(), false, 3);

        // A previous run parked this PR mid-wait; a terminal one stays put.
        let mut waiting = new_pr();
        waiting.stage = PrStage::WaitingCi;
        waiting.ci_wait_started_at = Some(Utc::now());
        store.save_pr_state(&waiting).unwrap();

        let mut finished = PrState::new(7, "https://github.com/acme/widgets/pull/7", 0, "b", "sha7");
        finished.stage = PrStage::Done;
        store.save_pr_state(&finished).unwrap();

        let resumed = controller.recover().unwrap();
        assert_eq!(resumed, 1);

        wait_for_stage(&store, 42, PrStage::Done).await;
        controller.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_registration_is_ignored() {
        let github = MockGithubClient::new();
        let mut ci = MockCiMonitor::new();
        ci.expect_aggregate_status()
            .returning(|_, _| Ok(CiStatus::Pending));

        let (controller, _store, _metrics) =
            build_controller(github, ci, ResolvedEnvironment::dev(), false, 3);
        controller.register_pr(new_pr(), 0).unwrap();
        controller.register_pr(new_pr(), 0).unwrap();
        assert_eq!(controller.active_prs().len(), 1);
        controller.shutdown().await;
    }
}
