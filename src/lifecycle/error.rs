use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Client(#[from] crate::client::Error),

    #[error(transparent)]
    Store(#[from] crate::store::StoreError),

    #[error(transparent)]
    Approval(#[from] crate::approval::ApprovalError),

    #[error("approval required but no approval manager is configured")]
    ApprovalNotConfigured,

    #[error("pre-merge approval is disabled for environment '{0}'")]
    ApprovalDisabled(String),

    #[error("merge approval was rejected")]
    ApprovalRejected,

    #[error("timed out waiting for merge approval")]
    ApprovalTimeout,

    #[error("cannot merge: {0}")]
    NotMergeable(String),

    #[error("CI checks failing")]
    CiFailing,

    #[error("CI checks still pending")]
    CiPending,
}

impl Error {
    /// Approval outcomes are final: a human said no, nobody answered in
    /// time, or the deployment is misconfigured. Retrying cannot help.
    pub fn is_approval_final(&self) -> bool {
        matches!(
            self,
            Self::ApprovalNotConfigured
                | Self::ApprovalDisabled(_)
                | Self::ApprovalRejected
                | Self::ApprovalTimeout
                | Self::Approval(_)
        )
    }

    pub fn is_merge_conflict(&self) -> bool {
        match self {
            Self::NotMergeable(reason) => reason.contains("conflict"),
            Self::Client(e) => e.conflict(),
            _ => false,
        }
    }

    pub fn is_ci_failure(&self) -> bool {
        matches!(self, Self::CiFailing)
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, Self::Client(e) if e.rate_limited())
    }

    pub fn is_transient_transport(&self) -> bool {
        matches!(self, Self::Client(e) if e.transient())
    }
}
