//! gridp2p-deploy — per-node deployment core.
//!
//! Decides, for every task submitted on a node, which loading unit its code
//! runs in, fetches code and resources from the originating node on demand,
//! and drives deploy/undeploy callbacks of injected resources. The node:
//!
//! - **Resolves deployments**: maps an origin identity to a cached
//!   [`LoadingUnit`] according to the [`DeploymentMode`]
//! - **Binds executions**: a task and every job split from it share one unit
//! - **Runs resource lifecycles**: callbacks exactly once per instance,
//!   counted per class in the node-local store
//! - **Reacts to membership**: node leave and undeploy requests evict units
//!
//! # Architecture
//!
//! ```text
//! GridNode
//!   ├── NodeContext (node id + NodeLocalStore)
//!   ├── ResourceLifecycleManager
//!   ├── LoadingUnitCache
//!   │     ├── live:    CacheKey → LoadingUnit
//!   │     └── retired: unit id  → LoadingUnit (superseded by redeploy)
//!   ├── ExecutionBinder
//!   └── MembershipHandler (LeaveClassifier)
//! ```

pub mod binding;
pub mod cache;
pub mod error;
pub mod fetch;
pub mod membership;
pub mod resource;
pub mod unit;

use std::sync::Arc;

use tracing::info;

use gridp2p_core::{ClassResolutionError, DeploymentMode, NodeConfig, NodeId, OriginIdentity};

pub use binding::{ExecutionBinder, JobExecution, TaskExecution};
pub use cache::{CacheStats, LoadingUnitCache, UndeployOutcome};
pub use error::{DeployError, DeployResult, LifecyclePhase, ResourceError};
pub use fetch::{DirectoryFetcher, InMemoryFetcher, ResourceFetcher};
pub use membership::{LeaveClassifier, MembershipEvent, MembershipHandler};
pub use resource::{
    LifecycleState, NodeContext, ResourceContext, ResourceInstance, ResourceLifecycleManager,
    UserResource,
};
pub use unit::{LoadedResource, LoadingUnit};

/// One node's deployment stack, wired from configuration.
pub struct GridNode {
    context: Arc<NodeContext>,
    lifecycle: Arc<ResourceLifecycleManager>,
    cache: Arc<LoadingUnitCache>,
    binder: ExecutionBinder,
    membership: MembershipHandler,
}

impl GridNode {
    /// Build a node whose continuous-mode leave policy comes from config.
    pub fn new(config: &NodeConfig, fetcher: Arc<dyn ResourceFetcher>) -> Self {
        let classifier = Arc::new(config.deployment.continuous.leave);
        Self::with_classifier(config.node_id().clone(), config.mode(), fetcher, classifier)
    }

    pub fn with_classifier(
        node_id: NodeId,
        mode: DeploymentMode,
        fetcher: Arc<dyn ResourceFetcher>,
        classifier: Arc<dyn LeaveClassifier>,
    ) -> Self {
        let context = Arc::new(NodeContext::new(node_id));
        let lifecycle = Arc::new(ResourceLifecycleManager::new(Arc::clone(&context)));
        let cache = Arc::new(LoadingUnitCache::new(mode, fetcher, Arc::clone(&lifecycle)));
        let binder = ExecutionBinder::new(Arc::clone(&cache));
        let membership = MembershipHandler::new(Arc::clone(&cache), classifier);

        info!(node = %context.node_id(), %mode, "grid node initialized");
        Self {
            context,
            lifecycle,
            cache,
            binder,
            membership,
        }
    }

    pub fn node_id(&self) -> &NodeId {
        self.context.node_id()
    }

    pub fn context(&self) -> &Arc<NodeContext> {
        &self.context
    }

    pub fn lifecycle(&self) -> &Arc<ResourceLifecycleManager> {
        &self.lifecycle
    }

    pub fn cache(&self) -> &Arc<LoadingUnitCache> {
        &self.cache
    }

    pub fn binder(&self) -> &ExecutionBinder {
        &self.binder
    }

    /// Submit a task for execution on this node.
    pub fn submit(&self, origin: OriginIdentity) -> Result<TaskExecution, ClassResolutionError> {
        self.binder.submit(origin)
    }

    pub fn handle_membership(&self, event: &MembershipEvent) -> UndeployOutcome {
        self.membership.handle(event)
    }
}
