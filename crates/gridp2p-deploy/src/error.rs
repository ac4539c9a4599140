//! Deployment error types.

use std::fmt;

use thiserror::Error;

use gridp2p_core::ClassResolutionError;

/// Errors raised by the loading-unit cache and execution binding.
#[derive(Debug, Error)]
pub enum DeployError {
    #[error(transparent)]
    Resolution(#[from] ClassResolutionError),

    /// A programming error: a reference count would go negative, or a job
    /// is bound to a unit other than its task's.
    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

pub type DeployResult<T> = Result<T, DeployError>;

/// Which lifecycle callback a resource error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Deploy,
    Undeploy,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecyclePhase::Deploy => f.write_str("deploy"),
            LifecyclePhase::Undeploy => f.write_str("undeploy"),
        }
    }
}

/// Errors from resource lifecycle transitions. Isolated per instance.
#[derive(Debug, Error)]
pub enum ResourceError {
    #[error("resource `{resource}` {phase} callback failed: {source}")]
    Callback {
        resource: String,
        phase: LifecyclePhase,
        #[source]
        source: anyhow::Error,
    },

    #[error("resource `{0}` was never deployed")]
    NotDeployed(String),

    #[error("resource `{0}` is already deployed")]
    AlreadyDeployed(String),

    #[error("resource `{0}` is already undeployed")]
    AlreadyUndeployed(String),
}

impl ResourceError {
    pub fn resource(&self) -> &str {
        match self {
            ResourceError::Callback { resource, .. } => resource,
            ResourceError::NotDeployed(r)
            | ResourceError::AlreadyDeployed(r)
            | ResourceError::AlreadyUndeployed(r) => r,
        }
    }
}
