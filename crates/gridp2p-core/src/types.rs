//! Identity types shared across gridp2p crates.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a grid node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Where a deployable unit of code came from.
///
/// The user version changes whenever the user redeploys new code under
/// the same class identifier. Fields are private so an identity cannot be
/// altered once built.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OriginIdentity {
    node: NodeId,
    class_id: String,
    user_version: String,
}

impl OriginIdentity {
    pub fn new(
        node: impl Into<NodeId>,
        class_id: impl Into<String>,
        user_version: impl Into<String>,
    ) -> Self {
        Self {
            node: node.into(),
            class_id: class_id.into(),
            user_version: user_version.into(),
        }
    }

    /// Node the deployment originated from.
    pub fn node(&self) -> &NodeId {
        &self.node
    }

    /// Identifier of the task class being deployed.
    pub fn class_id(&self) -> &str {
        &self.class_id
    }

    pub fn user_version(&self) -> &str {
        &self.user_version
    }

    /// Same class and version, submitted from another node.
    pub fn from_node(&self, node: impl Into<NodeId>) -> Self {
        Self {
            node: node.into(),
            class_id: self.class_id.clone(),
            user_version: self.user_version.clone(),
        }
    }
}

impl fmt::Display for OriginIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}#{}", self.class_id, self.node, self.user_version)
    }
}
