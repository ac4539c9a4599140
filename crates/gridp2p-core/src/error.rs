//! Error types surfaced by the deployment core.

use std::fmt;

use thiserror::Error;

use crate::types::OriginIdentity;

/// Why a class or resource could not be supplied by its origin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionFailure {
    /// The origin node does not have the resource.
    NotFound,
    /// The origin node could not be reached.
    Unreachable,
    /// The caller's time bound expired before the fetch completed.
    Timeout,
}

impl fmt::Display for ResolutionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResolutionFailure::NotFound => "not found",
            ResolutionFailure::Unreachable => "origin unreachable",
            ResolutionFailure::Timeout => "timed out",
        };
        f.write_str(s)
    }
}

/// A required class or resource could not be resolved for a deployment.
///
/// Reported to the task submitter; the core never retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("cannot resolve `{resource}` for {origin}: {reason}")]
pub struct ClassResolutionError {
    pub resource: String,
    pub origin: OriginIdentity,
    pub reason: ResolutionFailure,
}

impl ClassResolutionError {
    pub fn new(resource: impl Into<String>, origin: OriginIdentity, reason: ResolutionFailure) -> Self {
        Self {
            resource: resource.into(),
            origin,
            reason,
        }
    }

    /// Resolution of the task class itself timed out on the caller's side.
    pub fn timeout(origin: OriginIdentity) -> Self {
        let resource = origin.class_id().to_string();
        Self::new(resource, origin, ResolutionFailure::Timeout)
    }
}

/// A deployment mode string did not name a known mode.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown deployment mode `{0}` (expected private, isolated, shared or continuous)")]
pub struct UnknownMode(pub String);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn message_names_resource_and_reason() {
        let origin = OriginIdentity::new("node-1", "Task", "v1");
        let err = ClassResolutionError::new("Task$Job", origin, ResolutionFailure::Unreachable);
        assert_eq!(
            err.to_string(),
            "cannot resolve `Task$Job` for Task@node-1#v1: origin unreachable"
        );
    }

    #[test]
    fn timeout_targets_task_class() {
        let err = ClassResolutionError::timeout(OriginIdentity::new("n", "Task", "v1"));
        assert_eq!(err.resource, "Task");
        assert_eq!(err.reason, ResolutionFailure::Timeout);
    }
}
