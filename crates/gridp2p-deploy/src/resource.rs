//! Resource lifecycle — deploy/undeploy callbacks for injected resources.
//!
//! User resources are constructed by the caller and handed over as
//! [`ResourceInstance`]s together with explicit handles to the node they
//! run on. The [`ResourceLifecycleManager`] drives each instance through
//! `Created → Deployed → Undeployed`, invoking each callback exactly once,
//! and counts the transitions per class in the node-local store under
//! `"<class id>:deployCnt"` and `"<class id>:undeployCnt"`.
//!
//! # Concurrency
//!
//! An instance's callbacks are serialized by a per-instance lock. Different
//! instances sharing a class run their callbacks concurrently; their
//! counters are updated with the store's lock-free increment.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info_span, warn};
use uuid::Uuid;

use gridp2p_core::{NodeId, OriginIdentity};
use gridp2p_nodelocal::NodeLocalStore;

use crate::error::{LifecyclePhase, ResourceError};

pub const DEPLOY_COUNTER: &str = "deployCnt";
pub const UNDEPLOY_COUNTER: &str = "undeployCnt";

/// Node-local key of the deploy counter for a class.
pub fn deploy_counter_key(class_id: &str) -> String {
    format!("{class_id}:{DEPLOY_COUNTER}")
}

/// Node-local key of the undeploy counter for a class.
pub fn undeploy_counter_key(class_id: &str) -> String {
    format!("{class_id}:{UNDEPLOY_COUNTER}")
}

/// The execution context resources see: which node they run on and the
/// node-local store.
#[derive(Debug)]
pub struct NodeContext {
    node_id: NodeId,
    local: NodeLocalStore<String, u64>,
}

impl NodeContext {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            local: NodeLocalStore::new(),
        }
    }

    pub fn node_id(&self) -> &NodeId {
        &self.node_id
    }

    pub fn local(&self) -> &NodeLocalStore<String, u64> {
        &self.local
    }
}

/// Handles passed to resource callbacks.
///
/// The node handle is weak: a resource can look the node up while it is
/// alive but never keeps it alive.
#[derive(Debug, Clone)]
pub struct ResourceContext {
    node: Weak<NodeContext>,
    span: tracing::Span,
}

impl ResourceContext {
    pub fn node(&self) -> Option<Arc<NodeContext>> {
        self.node.upgrade()
    }

    /// Logging handle scoped to the resource instance.
    pub fn span(&self) -> &tracing::Span {
        &self.span
    }
}

/// A user-defined resource with deploy/undeploy hooks.
pub trait UserResource: Send + Sync {
    fn on_deploy(&self, _ctx: &ResourceContext) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_undeploy(&self, _ctx: &ResourceContext) -> anyhow::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Deployed,
    Undeployed,
}

struct InstanceState {
    state: LifecycleState,
    /// Identity the instance was deployed under; keys its counters.
    origin: Option<OriginIdentity>,
}

/// One injected instance of a user resource.
pub struct ResourceInstance {
    id: Uuid,
    name: String,
    resource: Box<dyn UserResource>,
    inner: Mutex<InstanceState>,
}

impl ResourceInstance {
    pub fn new(name: impl Into<String>, resource: impl UserResource + 'static) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            resource: Box::new(resource),
            inner: Mutex::new(InstanceState {
                state: LifecycleState::Created,
                origin: None,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        self.inner.lock().state
    }
}

impl fmt::Debug for ResourceInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Drives resource instances through their lifecycle on one node.
pub struct ResourceLifecycleManager {
    node: Arc<NodeContext>,
}

impl ResourceLifecycleManager {
    pub fn new(node: Arc<NodeContext>) -> Self {
        Self { node }
    }

    pub fn node(&self) -> &Arc<NodeContext> {
        &self.node
    }

    /// Run the deploy callback once and count the transition.
    ///
    /// The counter is incremented even when the callback fails; it tracks
    /// attempted transitions. A failed instance still counts as deployed so
    /// its undeploy callback runs later.
    pub fn on_deploy(
        &self,
        instance: &ResourceInstance,
        origin: &OriginIdentity,
    ) -> Result<(), ResourceError> {
        let mut inner = instance.inner.lock();
        match inner.state {
            LifecycleState::Created => {}
            LifecycleState::Deployed => {
                return Err(ResourceError::AlreadyDeployed(instance.name.clone()));
            }
            LifecycleState::Undeployed => {
                return Err(ResourceError::AlreadyUndeployed(instance.name.clone()));
            }
        }

        let ctx = self.context_for(instance, origin.class_id());
        let outcome = ctx.span.in_scope(|| instance.resource.on_deploy(&ctx));

        inner.state = LifecycleState::Deployed;
        inner.origin = Some(origin.clone());
        let count = self
            .node
            .local()
            .increment(deploy_counter_key(origin.class_id()));

        debug!(
            resource = %instance.name,
            class_id = %origin.class_id(),
            deploy_count = count,
            "resource deployed"
        );

        outcome.map_err(|source| {
            warn!(resource = %instance.name, error = %source, "resource deploy callback failed");
            ResourceError::Callback {
                resource: instance.name.clone(),
                phase: LifecyclePhase::Deploy,
                source,
            }
        })
    }

    /// Run the undeploy callback once and count the transition.
    ///
    /// Requires a prior deploy. The counter is incremented even when the
    /// callback fails.
    pub fn on_undeploy(&self, instance: &ResourceInstance) -> Result<(), ResourceError> {
        let mut inner = instance.inner.lock();
        let origin = match (inner.state, inner.origin.clone()) {
            (LifecycleState::Deployed, Some(origin)) => origin,
            (LifecycleState::Undeployed, _) => {
                return Err(ResourceError::AlreadyUndeployed(instance.name.clone()));
            }
            _ => return Err(ResourceError::NotDeployed(instance.name.clone())),
        };

        let ctx = self.context_for(instance, origin.class_id());
        let outcome = ctx.span.in_scope(|| instance.resource.on_undeploy(&ctx));

        inner.state = LifecycleState::Undeployed;
        let count = self
            .node
            .local()
            .increment(undeploy_counter_key(origin.class_id()));

        debug!(
            resource = %instance.name,
            class_id = %origin.class_id(),
            undeploy_count = count,
            "resource undeployed"
        );

        outcome.map_err(|source| {
            warn!(resource = %instance.name, error = %source, "resource undeploy callback failed");
            ResourceError::Callback {
                resource: instance.name.clone(),
                phase: LifecyclePhase::Undeploy,
                source,
            }
        })
    }

    pub fn deploy_count(&self, class_id: &str) -> u64 {
        self.node.local().counter(deploy_counter_key(class_id).as_str())
    }

    pub fn undeploy_count(&self, class_id: &str) -> u64 {
        self.node.local().counter(undeploy_counter_key(class_id).as_str())
    }

    fn context_for(&self, instance: &ResourceInstance, class_id: &str) -> ResourceContext {
        ResourceContext {
            node: Arc::downgrade(&self.node),
            span: info_span!(
                "resource",
                node = %self.node.node_id(),
                resource = %instance.name,
                instance = %instance.id,
                %class_id
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        deploys: Arc<AtomicUsize>,
        undeploys: Arc<AtomicUsize>,
    }

    impl UserResource for Counting {
        fn on_deploy(&self, ctx: &ResourceContext) -> anyhow::Result<()> {
            assert!(ctx.node().is_some());
            self.deploys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn on_undeploy(&self, _ctx: &ResourceContext) -> anyhow::Result<()> {
            self.undeploys.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct Failing;

    impl UserResource for Failing {
        fn on_deploy(&self, _ctx: &ResourceContext) -> anyhow::Result<()> {
            anyhow::bail!("deploy exploded")
        }

        fn on_undeploy(&self, _ctx: &ResourceContext) -> anyhow::Result<()> {
            anyhow::bail!("undeploy exploded")
        }
    }

    struct Noop;
    impl UserResource for Noop {}

    fn manager() -> ResourceLifecycleManager {
        ResourceLifecycleManager::new(Arc::new(NodeContext::new(NodeId::new("node-1"))))
    }

    fn origin() -> OriginIdentity {
        OriginIdentity::new("node-1", "Task", "v1")
    }

    #[test]
    fn callbacks_run_once_each() {
        let manager = manager();
        let deploys = Arc::new(AtomicUsize::new(0));
        let undeploys = Arc::new(AtomicUsize::new(0));
        let instance = ResourceInstance::new(
            "res",
            Counting {
                deploys: deploys.clone(),
                undeploys: undeploys.clone(),
            },
        );

        manager.on_deploy(&instance, &origin()).unwrap();
        assert!(matches!(
            manager.on_deploy(&instance, &origin()),
            Err(ResourceError::AlreadyDeployed(_))
        ));
        manager.on_undeploy(&instance).unwrap();
        assert!(matches!(
            manager.on_undeploy(&instance),
            Err(ResourceError::AlreadyUndeployed(_))
        ));

        assert_eq!(deploys.load(Ordering::SeqCst), 1);
        assert_eq!(undeploys.load(Ordering::SeqCst), 1);
        assert_eq!(manager.deploy_count("Task"), 1);
        assert_eq!(manager.undeploy_count("Task"), 1);
        assert_eq!(instance.state(), LifecycleState::Undeployed);
    }

    #[test]
    fn undeploy_before_deploy_is_rejected() {
        let manager = manager();
        let instance = ResourceInstance::new("res", Noop);

        assert!(matches!(
            manager.on_undeploy(&instance),
            Err(ResourceError::NotDeployed(_))
        ));
        assert_eq!(manager.undeploy_count("Task"), 0);
        assert_eq!(instance.state(), LifecycleState::Created);
    }

    #[test]
    fn failing_callbacks_still_count() {
        let manager = manager();
        let instance = ResourceInstance::new("bad", Failing);

        let err = manager.on_deploy(&instance, &origin()).unwrap_err();
        assert!(err.to_string().contains("deploy exploded"));
        assert_eq!(err.resource(), "bad");
        assert_eq!(manager.deploy_count("Task"), 1);

        let err = manager.on_undeploy(&instance).unwrap_err();
        assert!(matches!(
            err,
            ResourceError::Callback {
                phase: LifecyclePhase::Undeploy,
                ..
            }
        ));
        assert_eq!(manager.undeploy_count("Task"), 1);
    }

    #[test]
    fn counters_keyed_by_class() {
        let manager = manager();
        let a = ResourceInstance::new("a", Noop);
        let b = ResourceInstance::new("b", Noop);

        manager
            .on_deploy(&a, &OriginIdentity::new("node-1", "TaskA", "v1"))
            .unwrap();
        manager
            .on_deploy(&b, &OriginIdentity::new("node-2", "TaskB", "v1"))
            .unwrap();

        assert_eq!(manager.deploy_count("TaskA"), 1);
        assert_eq!(manager.deploy_count("TaskB"), 1);
        assert_eq!(
            manager.node().local().get("TaskA:deployCnt"),
            Some(1)
        );
    }

    #[test]
    fn context_node_handle_is_weak() {
        type Slot = Arc<Mutex<Option<ResourceContext>>>;
        struct Capture(Slot);
        impl UserResource for Capture {
            fn on_deploy(&self, ctx: &ResourceContext) -> anyhow::Result<()> {
                *self.0.lock() = Some(ctx.clone());
                Ok(())
            }
        }

        let slot: Slot = Arc::new(Mutex::new(None));
        let instance = ResourceInstance::new("cap", Capture(slot.clone()));
        let manager = manager();
        manager.on_deploy(&instance, &origin()).unwrap();

        let ctx = slot.lock().clone().unwrap();
        assert_eq!(ctx.node().unwrap().node_id().as_str(), "node-1");

        // The manager owned the only strong reference to the node.
        drop(manager);
        assert!(ctx.node().is_none());
    }
}
