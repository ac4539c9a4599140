//! Deployment mode policy — maps a deployment to the cache key it shares.
//!
//! Two deployments land in the same loading unit exactly when they map to
//! equal keys. The key variant carries the sharing scope:
//!
//! | mode                    | key                          |
//! |-------------------------|------------------------------|
//! | `Private`               | fresh UUID per call          |
//! | `Isolated`              | origin node                  |
//! | `Shared` / `Continuous` | class id + user version      |

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::mode::DeploymentMode;
use crate::types::{NodeId, OriginIdentity};

/// Identity under which a loading unit is cached on a node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CacheKey {
    /// Never equal to any other key produced by the policy.
    Private(Uuid),
    /// Everything deployed from one origin node.
    Isolated(NodeId),
    /// One class at one user version, from any node.
    Shared { class_id: String, user_version: String },
}

impl CacheKey {
    /// Class this key is pinned to, if the key scope is a single class.
    pub fn class_id(&self) -> Option<&str> {
        match self {
            CacheKey::Shared { class_id, .. } => Some(class_id),
            _ => None,
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheKey::Private(id) => write!(f, "private:{id}"),
            CacheKey::Isolated(node) => write!(f, "isolated:{node}"),
            CacheKey::Shared {
                class_id,
                user_version,
            } => write!(f, "shared:{class_id}#{user_version}"),
        }
    }
}

/// Compute the cache key for a deployment. No side effects beyond drawing
/// a random UUID for `Private`.
pub fn cache_key_for(mode: DeploymentMode, origin: &OriginIdentity) -> CacheKey {
    match mode {
        DeploymentMode::Private => CacheKey::Private(Uuid::new_v4()),
        DeploymentMode::Isolated => CacheKey::Isolated(origin.node().clone()),
        DeploymentMode::Shared | DeploymentMode::Continuous => CacheKey::Shared {
            class_id: origin.class_id().to_string(),
            user_version: origin.user_version().to_string(),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin(node: &str, class: &str, version: &str) -> OriginIdentity {
        OriginIdentity::new(node, class, version)
    }

    #[test]
    fn private_keys_never_repeat() {
        let o = origin("node-1", "Task", "v1");
        let a = cache_key_for(DeploymentMode::Private, &o);
        let b = cache_key_for(DeploymentMode::Private, &o);
        assert_ne!(a, b);
    }

    #[test]
    fn isolated_keys_on_origin_node_only() {
        let a = cache_key_for(DeploymentMode::Isolated, &origin("node-1", "Task", "v1"));
        let b = cache_key_for(DeploymentMode::Isolated, &origin("node-1", "Other", "v9"));
        let c = cache_key_for(DeploymentMode::Isolated, &origin("node-2", "Task", "v1"));

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string(), "isolated:node-1");
    }

    #[test]
    fn shared_ignores_origin_node() {
        for mode in [DeploymentMode::Shared, DeploymentMode::Continuous] {
            let a = cache_key_for(mode, &origin("node-1", "Task", "v1"));
            let b = cache_key_for(mode, &origin("node-2", "Task", "v1"));
            assert_eq!(a, b);
            assert_eq!(a.class_id(), Some("Task"));
        }
    }

    #[test]
    fn version_change_is_a_new_shared_key() {
        let v1 = cache_key_for(DeploymentMode::Shared, &origin("node-1", "Task", "v1"));
        let v2 = cache_key_for(DeploymentMode::Shared, &origin("node-1", "Task", "v2"));
        assert_ne!(v1, v2);
        assert_eq!(v2.to_string(), "shared:Task#v2");
    }

    #[test]
    fn shared_and_continuous_keys_coincide() {
        let o = origin("node-1", "Task", "v1");
        assert_eq!(
            cache_key_for(DeploymentMode::Shared, &o),
            cache_key_for(DeploymentMode::Continuous, &o)
        );
    }
}
