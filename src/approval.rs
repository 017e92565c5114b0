use crate::state::PrState;
use async_trait::async_trait;
use serde_derive::Deserialize;
use thiserror::Error;

/// Human-in-the-loop gate consulted before production merges. Implementors
/// bridge to a chat transport; the core only needs the blocking request.
///
/// `request_approval` must be cancel-safe: dropping the future (on
/// shutdown) abandons the request without side effects. The caller applies
/// the configured approval timeout around the call.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ApprovalManager: Send + Sync {
    /// Resolves to `true` on approval and `false` on rejection.
    async fn request_approval(&self, pr: &PrState) -> Result<bool, ApprovalError>;
}

#[derive(Error, Debug)]
pub enum ApprovalError {
    #[error("approval channel closed")]
    ChannelClosed,

    #[error("approval transport failed: {0}")]
    Transport(String),
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct ApprovalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub pre_merge: PreMergeApprovalConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq)]
pub struct PreMergeApprovalConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl ApprovalConfig {
    /// Whether the pre-merge approval stage may run at all.
    pub fn stage_enabled(&self) -> bool {
        self.enabled && self.pre_merge.enabled
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            pre_merge: PreMergeApprovalConfig::default(),
        }
    }
}

impl Default for PreMergeApprovalConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

fn default_true() -> bool {
    true
}
