use chrono::Duration as ChronoDuration;
use env_logger::Env;
use log::{error, info, warn};
use pilot_autopilot::{
    approval::ApprovalManager,
    config::PilotConfig,
    github::{DefaultGithubClient, PullRequestIdentifier},
    lifecycle::{
        AutoMerger, ChecksCiMonitor, CiMonitor, Controller, ControllerConfig, FeedbackLoop,
        MergePolicy, MetricsPersister,
    },
    metrics::Metrics,
    state::PrState,
    store::StateStore,
};
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use structopt::StructOpt;

#[derive(StructOpt, Debug)]
#[structopt(name = "pilot-autopilot", about = "Drives pull requests through CI, approval, and merge")]
struct Options {
    /// Path to the configuration file
    #[structopt(short = "c", long = "config", default_value = "~/.pilot/autopilot.yaml")]
    config_file: String,

    /// Pull request URLs to register on startup
    urls: Vec<String>,
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let options = Options::from_args();

    let config = match PilotConfig::new(&options.config_file) {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            exit(1);
        }
    };
    let environment = match config.resolved_environment() {
        Ok(environment) => environment,
        Err(e) => {
            error!("Invalid environment configuration: {}", e);
            exit(1);
        }
    };
    let merge_method = match config.merge_method() {
        Ok(method) => method,
        Err(e) => {
            error!("Invalid merge configuration: {}", e);
            exit(1);
        }
    };

    let store_path = PathBuf::from(shellexpand::tilde(&config.store.path).as_ref());
    let store = match StateStore::open(&store_path) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            error!("Failed to open state store at {:?}: {}", store_path, e);
            exit(1);
        }
    };
    run_maintenance(&store, &config);

    let metrics = Arc::new(Metrics::new());
    let github = Arc::new(DefaultGithubClient::new(
        config.github.username.clone(),
        config.github.token.clone(),
    ));
    let ci: Arc<dyn CiMonitor> = Arc::new(ChecksCiMonitor::new(
        github.clone(),
        config.ci.required_checks.clone(),
    ));

    // Chat transports plug in from the outside; without one, environments
    // that require approval will refuse to merge.
    let approvals: Option<Arc<dyn ApprovalManager>> = None;
    if environment.require_approval && approvals.is_none() {
        warn!(
            "Environment '{}' requires approval but no approval manager is wired; \
             merges there will fail",
            environment.name
        );
    }

    let policy = MergePolicy {
        environment: environment.clone(),
        merge_method,
        auto_review: config.merge.auto_review,
        approval_timeout: config.approval_timeout(),
        approval: config.approval.clone(),
    };
    let merger = AutoMerger::new(github.clone(), Some(ci.clone()), approvals, policy);
    let feedback = FeedbackLoop::new(
        github.clone(),
        config.github.owner.clone(),
        config.github.repo.clone(),
        config.issues.labels.clone(),
    );
    let controller = Arc::new(Controller::new(
        store.clone(),
        metrics.clone(),
        merger,
        ci,
        feedback,
        environment.clone(),
        ControllerConfig {
            owner: config.github.owner.clone(),
            repo: config.github.repo.clone(),
            poll_interval: config.poll_interval(),
            max_merge_attempts: config.merge.max_attempts,
            circuit_breaker_threshold: config.circuit_breaker.errors_per_minute,
            circuit_breaker_pause: config.circuit_breaker_pause(),
        },
    ));

    match controller.recover() {
        Ok(resumed) => info!(
            "Recovered {} in-flight PR(s), targeting environment '{}'",
            resumed, environment.name
        ),
        Err(e) => {
            error!("Failed to recover persisted PR state: {}", e);
            exit(1);
        }
    }

    for url in &options.urls {
        if let Err(e) = register_url(&controller, github.as_ref(), url).await {
            error!("Failed to register {}: {}", url, e);
        }
    }

    let persister = MetricsPersister::new(store.clone(), metrics.clone());
    let persister_handle = tokio::spawn(persister.run(controller.subscribe_shutdown()));

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to wait for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
    controller.shutdown().await;
    if let Err(e) = persister_handle.await {
        warn!("Metrics persister ended abnormally: {}", e);
    }
}

async fn register_url(
    controller: &Arc<Controller<DefaultGithubClient>>,
    github: &DefaultGithubClient,
    url: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    use pilot_autopilot::github::GithubClient;

    let identifier = PullRequestIdentifier::from_app_url(url)?;
    let info = github.pull_request_info(&identifier).await?;
    let pr = PrState::new(
        info.number,
        info.html_url.clone(),
        0,
        info.head.name.clone(),
        info.head.sha.clone(),
    );
    controller.register_pr(pr, 0)?;
    Ok(())
}

fn run_maintenance(store: &StateStore, config: &PilotConfig) {
    if let Err(e) = store.purge_terminal_pr_states(ChronoDuration::days(config.retention.terminal_pr_days)) {
        warn!("Failed to purge terminal PR rows: {}", e);
    }
    match store.load_all_pr_failures() {
        Ok(records) => {
            let cutoff = chrono::Utc::now() - ChronoDuration::days(config.retention.failures_days);
            for record in records {
                if record.last_failure_time < cutoff {
                    if let Err(e) = store.remove_pr_failures(record.pr_number) {
                        warn!("Failed to drop stale failure counter for PR #{}: {}", record.pr_number, e);
                    }
                }
            }
        }
        Err(e) => warn!("Failed to load failure counters: {}", e),
    }
    if let Err(e) = store.purge_old_processed_issues(ChronoDuration::days(config.retention.processed_days)) {
        warn!("Failed to purge processed-issue ledgers: {}", e);
    }
    if let Err(e) = store.purge_old_metrics(ChronoDuration::days(config.retention.metrics_days)) {
        warn!("Failed to prune metrics history: {}", e);
    }
}
