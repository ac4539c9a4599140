//! Node configuration parser (`gridp2p.toml`).

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::mode::DeploymentMode;
use crate::types::NodeId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSection,
    #[serde(default)]
    pub deployment: DeploymentConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSection {
    pub id: NodeId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    #[serde(default)]
    pub mode: DeploymentMode,
    /// Upper bound callers place on a single resolution.
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default)]
    pub continuous: ContinuousConfig,
}

impl Default for DeploymentConfig {
    fn default() -> Self {
        Self {
            mode: DeploymentMode::default(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            continuous: ContinuousConfig::default(),
        }
    }
}

impl DeploymentConfig {
    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContinuousConfig {
    /// How a participant leaving the grid is treated in continuous mode.
    #[serde(default)]
    pub leave: LeaveKind,
}

/// Classification of a participant leaving the grid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaveKind {
    /// The node is expected back; continuous units are kept.
    #[default]
    Transient,
    /// The node is gone for good; its units are undeployed.
    Permanent,
}

fn default_fetch_timeout_ms() -> u64 {
    5_000
}

impl NodeConfig {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        let config: NodeConfig = toml::from_str(content)?;
        Ok(config)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Scaffold a minimal config for a node.
    pub fn scaffold(node_id: &str, mode: DeploymentMode) -> Self {
        NodeConfig {
            node: NodeSection {
                id: NodeId::new(node_id),
            },
            deployment: DeploymentConfig {
                mode,
                ..DeploymentConfig::default()
            },
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node.id
    }

    pub fn mode(&self) -> DeploymentMode {
        self.deployment.mode
    }
}
