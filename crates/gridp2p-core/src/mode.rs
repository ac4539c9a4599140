//! Deployment modes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::UnknownMode;

/// Controls how loading units are shared between deployments on a node.
///
/// Fixed for the lifetime of a node's configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentMode {
    /// Every deployment request gets its own unit.
    Private,
    /// Units are shared by deployments from the same origin node.
    Isolated,
    /// Units are shared by class id + user version across all origin nodes.
    #[default]
    Shared,
    /// Like `Shared`, but units outlive transient participant departures.
    Continuous,
}

impl DeploymentMode {
    pub const ALL: [DeploymentMode; 4] = [
        DeploymentMode::Private,
        DeploymentMode::Isolated,
        DeploymentMode::Shared,
        DeploymentMode::Continuous,
    ];

    /// Whether deployments from different origin nodes can land in one unit.
    pub fn shares_across_nodes(&self) -> bool {
        matches!(self, DeploymentMode::Shared | DeploymentMode::Continuous)
    }

    /// Whether a new user version for a class supersedes the cached unit.
    pub fn redeploys_on_version_change(&self) -> bool {
        self.shares_across_nodes()
    }

    /// Whether units may be kept when their last participant leaves.
    pub fn survives_transient_leave(&self) -> bool {
        matches!(self, DeploymentMode::Continuous)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentMode::Private => "private",
            DeploymentMode::Isolated => "isolated",
            DeploymentMode::Shared => "shared",
            DeploymentMode::Continuous => "continuous",
        }
    }
}

impl fmt::Display for DeploymentMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentMode {
    type Err = UnknownMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "private" => Ok(DeploymentMode::Private),
            "isolated" => Ok(DeploymentMode::Isolated),
            "shared" => Ok(DeploymentMode::Shared),
            "continuous" => Ok(DeploymentMode::Continuous),
            _ => Err(UnknownMode(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        assert_eq!("SHARED".parse::<DeploymentMode>().unwrap(), DeploymentMode::Shared);
        assert_eq!(" private ".parse::<DeploymentMode>().unwrap(), DeploymentMode::Private);
    }

    #[test]
    fn parse_rejects_unknown() {
        let err = "global".parse::<DeploymentMode>().unwrap_err();
        assert!(err.to_string().contains("global"));
    }

    #[test]
    fn display_round_trips_every_mode() {
        for mode in DeploymentMode::ALL {
            assert_eq!(mode.to_string().parse::<DeploymentMode>().unwrap(), mode);
        }
    }

    #[test]
    fn only_continuous_survives_transient_leave() {
        assert!(DeploymentMode::Continuous.survives_transient_leave());
        assert!(!DeploymentMode::Shared.survives_transient_leave());
        assert!(!DeploymentMode::Isolated.survives_transient_leave());
        assert!(!DeploymentMode::Private.survives_transient_leave());
    }
}
