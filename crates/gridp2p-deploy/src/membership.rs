//! Membership handling — reacts to nodes leaving and undeploy requests.
//!
//! Every loading unit tracks the origin nodes that resolved into it. When a
//! node leaves, it is dropped from each unit's participant set; a unit with
//! no participants left is undeployed. Continuous units survive a leave
//! that the [`LeaveClassifier`] judges transient.

use std::sync::Arc;

use tracing::{debug, info, warn};

use gridp2p_core::{LeaveKind, NodeId};

use crate::cache::{LoadingUnitCache, UndeployOutcome};

/// Events delivered by the cluster membership layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipEvent {
    NodeLeft { node: NodeId },
    UndeployRequested { class_id: String },
}

/// Decides whether a departed node is expected back.
pub trait LeaveClassifier: Send + Sync {
    fn classify(&self, node: &NodeId) -> LeaveKind;
}

/// A fixed classification for every node, as configured.
impl LeaveClassifier for LeaveKind {
    fn classify(&self, _node: &NodeId) -> LeaveKind {
        *self
    }
}

pub struct MembershipHandler {
    cache: Arc<LoadingUnitCache>,
    classifier: Arc<dyn LeaveClassifier>,
}

impl MembershipHandler {
    pub fn new(cache: Arc<LoadingUnitCache>, classifier: Arc<dyn LeaveClassifier>) -> Self {
        Self { cache, classifier }
    }

    pub fn handle(&self, event: &MembershipEvent) -> UndeployOutcome {
        match event {
            MembershipEvent::NodeLeft { node } => self.node_left(node),
            MembershipEvent::UndeployRequested { class_id } => {
                info!(%class_id, "undeploy requested");
                self.cache.undeploy_class(class_id)
            }
        }
    }

    fn node_left(&self, node: &NodeId) -> UndeployOutcome {
        let mut outcome = UndeployOutcome::default();
        let mut touched = 0usize;

        for unit in self.cache.units() {
            let Some(remaining) = unit.remove_participant(node) else {
                continue;
            };
            touched += 1;
            if remaining > 0 {
                debug!(key = %unit.key(), %node, remaining, "participant left");
                continue;
            }

            if unit.mode().survives_transient_leave() {
                let kind = self.classifier.classify(node);
                if kind == LeaveKind::Transient {
                    info!(key = %unit.key(), %node, "last participant left transiently, unit kept");
                    continue;
                }
            }
            outcome.merge(self.cache.evict_unit(&unit, "last participant left"));
        }

        if touched == 0 {
            warn!(%node, "leave event for node with no deployments");
        } else {
            info!(%node, units = touched, undeployed = outcome.units, "node left");
        }
        outcome
    }
}
