use serde_derive::Deserialize;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

const DEV_CI_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const DEFAULT_CI_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// What happens on the target branch after a merge lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PostMergeAction {
    #[default]
    None,
    Tag,
    Deploy,
}

impl PostMergeAction {
    pub fn parse(value: &str) -> Result<Self, EnvironmentError> {
        match value {
            "" | "none" => Ok(Self::None),
            "tag" => Ok(Self::Tag),
            "deploy" => Ok(Self::Deploy),
            other => Err(EnvironmentError::UnknownPostMergeAction(other.into())),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Tag => "tag",
            Self::Deploy => "deploy",
        }
    }
}

impl fmt::Display for PostMergeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Per-environment overrides as they appear in configuration. Unset fields
/// fall back to the defaults of the environment's base profile.
#[derive(Deserialize, Debug, Clone, Default, PartialEq)]
pub struct EnvironmentConfig {
    pub branch: Option<String>,
    pub require_approval: Option<bool>,
    pub ci_timeout_secs: Option<u64>,
    pub skip_post_merge_ci: Option<bool>,
    pub post_merge: Option<String>,
}

/// Fully resolved deployment-target policy driving a PR's lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedEnvironment {
    pub name: String,
    pub branch: String,
    pub require_approval: bool,
    pub ci_timeout: Duration,
    pub skip_post_merge_ci: bool,
    pub post_merge_action: PostMergeAction,
}

impl ResolvedEnvironment {
    pub fn dev() -> Self {
        Self {
            name: "dev".into(),
            branch: "develop".into(),
            require_approval: false,
            ci_timeout: DEV_CI_TIMEOUT,
            skip_post_merge_ci: true,
            post_merge_action: PostMergeAction::None,
        }
    }

    pub fn stage() -> Self {
        Self {
            name: "stage".into(),
            branch: "staging".into(),
            require_approval: false,
            ci_timeout: DEFAULT_CI_TIMEOUT,
            skip_post_merge_ci: false,
            post_merge_action: PostMergeAction::None,
        }
    }

    pub fn prod() -> Self {
        Self {
            name: "prod".into(),
            branch: "main".into(),
            require_approval: true,
            ci_timeout: DEFAULT_CI_TIMEOUT,
            skip_post_merge_ci: false,
            post_merge_action: PostMergeAction::None,
        }
    }

    pub fn is_prod(&self) -> bool {
        self.name == "prod"
    }

    fn base_profile(name: &str) -> Self {
        match name {
            "dev" | "development" => Self::dev(),
            "stage" | "staging" => Self::stage(),
            "prod" | "production" => Self::prod(),
            custom => Self {
                name: custom.into(),
                ..Self::stage()
            },
        }
    }

    fn apply(mut self, name: &str, config: &EnvironmentConfig) -> Result<Self, EnvironmentError> {
        self.name = name.into();
        if let Some(branch) = &config.branch {
            self.branch = branch.clone();
        }
        if let Some(require_approval) = config.require_approval {
            self.require_approval = require_approval;
        }
        if let Some(secs) = config.ci_timeout_secs {
            self.ci_timeout = Duration::from_secs(secs);
        }
        if let Some(skip) = config.skip_post_merge_ci {
            self.skip_post_merge_ci = skip;
        }
        if let Some(action) = &config.post_merge {
            self.post_merge_action = PostMergeAction::parse(action)?;
        }
        Ok(self)
    }
}

/// Picks the effective environment. A named environment (selected via
/// `active`) always wins over the legacy single value; either may refer to
/// a built-in profile or to an entry in the `environments` table. Custom
/// names must have a table entry.
pub fn resolve(
    legacy: Option<&str>,
    active: Option<&str>,
    environments: &HashMap<String, EnvironmentConfig>,
) -> Result<ResolvedEnvironment, EnvironmentError> {
    let name = active.or(legacy).unwrap_or("dev");
    let base = ResolvedEnvironment::base_profile(name);
    match environments.get(name) {
        Some(config) => base.apply(name, config),
        None if is_builtin(name) => Ok(base),
        None => Err(EnvironmentError::UnknownEnvironment(name.into())),
    }
}

fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        "dev" | "development" | "stage" | "staging" | "prod" | "production"
    )
}

#[derive(Error, Debug, PartialEq)]
pub enum EnvironmentError {
    #[error("unknown environment: {0}")]
    UnknownEnvironment(String),

    #[error("unknown post-merge action: {0}")]
    UnknownPostMergeAction(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn builtin_profiles() {
        let dev = resolve(Some("dev"), None, &HashMap::new()).unwrap();
        assert!(!dev.require_approval);
        assert_eq!(dev.ci_timeout, Duration::from_secs(300));
        assert!(dev.skip_post_merge_ci);

        let stage = resolve(Some("stage"), None, &HashMap::new()).unwrap();
        assert!(!stage.require_approval);
        assert_eq!(stage.ci_timeout, Duration::from_secs(1800));
        assert!(!stage.skip_post_merge_ci);

        let prod = resolve(Some("prod"), None, &HashMap::new()).unwrap();
        assert!(prod.require_approval);
        assert_eq!(prod.ci_timeout, Duration::from_secs(1800));
        assert!(prod.is_prod());
    }

    #[rstest]
    #[case("dev", false)]
    #[case("stage", false)]
    #[case("prod", true)]
    fn legacy_approval_mapping(#[case] name: &str, #[case] expected: bool) {
        let resolved = resolve(Some(name), None, &HashMap::new()).unwrap();
        assert_eq!(resolved.require_approval, expected);
    }

    #[test]
    fn named_environment_wins_over_legacy() {
        let mut environments = HashMap::new();
        environments.insert(
            "canary".to_string(),
            EnvironmentConfig {
                branch: Some("canary".into()),
                require_approval: Some(true),
                ci_timeout_secs: Some(600),
                skip_post_merge_ci: None,
                post_merge: Some("tag".into()),
            },
        );
        let resolved = resolve(Some("dev"), Some("canary"), &environments).unwrap();
        assert_eq!(resolved.name, "canary");
        assert_eq!(resolved.branch, "canary");
        assert!(resolved.require_approval);
        assert_eq!(resolved.ci_timeout, Duration::from_secs(600));
        assert_eq!(resolved.post_merge_action, PostMergeAction::Tag);
        // Custom profiles inherit stage-like defaults for unset fields.
        assert!(!resolved.skip_post_merge_ci);
        assert!(!resolved.is_prod());
    }

    #[test]
    fn overrides_apply_to_builtin_profiles() {
        let mut environments = HashMap::new();
        environments.insert(
            "prod".to_string(),
            EnvironmentConfig {
                branch: Some("release".into()),
                ..EnvironmentConfig::default()
            },
        );
        let resolved = resolve(None, Some("prod"), &environments).unwrap();
        assert_eq!(resolved.branch, "release");
        assert!(resolved.require_approval);
    }

    #[test]
    fn unknown_custom_environment_is_rejected() {
        let err = resolve(None, Some("qa"), &HashMap::new()).unwrap_err();
        assert_eq!(err, EnvironmentError::UnknownEnvironment("qa".into()));
    }

    #[test]
    fn defaults_to_dev_when_nothing_is_configured() {
        let resolved = resolve(None, None, &HashMap::new()).unwrap();
        assert_eq!(resolved.name, "dev");
    }

    #[test]
    fn post_merge_action_parsing() {
        assert_eq!(PostMergeAction::parse("").unwrap(), PostMergeAction::None);
        assert_eq!(PostMergeAction::parse("tag").unwrap(), PostMergeAction::Tag);
        assert_eq!(PostMergeAction::parse("deploy").unwrap(), PostMergeAction::Deploy);
        assert!(PostMergeAction::parse("rollback").is_err());
    }
}
