//! Execution binding — ties tasks and their jobs to one loading unit.
//!
//! A task resolves once. Every job split from it receives the task's
//! `Arc<LoadingUnit>` directly and the cache retains the unit once per job,
//! so task and jobs always observe the same loaded code. A job that arrives
//! from another node has no task handle here and resolves locally.
//!
//! Both handles release their reference on [`finish`](TaskExecution::finish)
//! or, failing that, on drop.

use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use gridp2p_core::{ClassResolutionError, OriginIdentity};

use crate::cache::LoadingUnitCache;
use crate::error::{DeployError, DeployResult};
use crate::resource::{ResourceInstance, ResourceLifecycleManager};
use crate::unit::LoadingUnit;

/// Entry point for the execution engine.
pub struct ExecutionBinder {
    cache: Arc<LoadingUnitCache>,
}

impl ExecutionBinder {
    pub fn new(cache: Arc<LoadingUnitCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &Arc<LoadingUnitCache> {
        &self.cache
    }

    /// Resolve a task submission to its loading unit.
    pub fn submit(&self, origin: OriginIdentity) -> Result<TaskExecution, ClassResolutionError> {
        let unit = self.cache.resolve(&origin)?;
        let task = TaskExecution {
            id: Uuid::new_v4(),
            binding: Binding::new(origin, unit, Arc::clone(&self.cache)),
        };
        debug!(task = %task.id, key = %task.unit().key(), "task bound");
        Ok(task)
    }

    /// Bind a job sent by another node. It resolves through the local cache
    /// like a task would.
    pub fn accept_remote_job(
        &self,
        origin: OriginIdentity,
    ) -> Result<JobExecution, ClassResolutionError> {
        let unit = self.cache.resolve(&origin)?;
        let job = JobExecution {
            id: Uuid::new_v4(),
            task_id: None,
            binding: Binding::new(origin, unit, Arc::clone(&self.cache)),
        };
        debug!(job = %job.id, key = %job.unit().key(), "remote job bound");
        Ok(job)
    }
}

/// One counted reference to a unit, released exactly once.
struct Binding {
    origin: OriginIdentity,
    unit: Arc<LoadingUnit>,
    cache: Arc<LoadingUnitCache>,
    released: bool,
}

impl Binding {
    fn new(origin: OriginIdentity, unit: Arc<LoadingUnit>, cache: Arc<LoadingUnitCache>) -> Self {
        Self {
            origin,
            unit,
            cache,
            released: false,
        }
    }

    fn lifecycle(&self) -> &ResourceLifecycleManager {
        self.cache.lifecycle()
    }

    fn inject(&self, instance: Arc<ResourceInstance>) -> DeployResult<()> {
        let deployed = self.lifecycle().on_deploy(&instance, &self.origin);
        // Failed callbacks still leave the instance deployed; attach it so
        // undeploy reaches it.
        if let Err(orphan) = self.unit.attach(instance) {
            warn!(
                unit = %self.unit.id(),
                resource = %orphan.name(),
                "unit already undeployed, undeploying injected resource"
            );
            let undeployed = self.lifecycle().on_undeploy(&orphan);
            deployed?;
            return undeployed.map_err(DeployError::from);
        }
        deployed.map_err(DeployError::from)
    }

    fn release(&mut self) -> DeployResult<usize> {
        if self.released {
            return Err(DeployError::InvariantViolation(format!(
                "execution on unit {} finished twice",
                self.unit.id()
            )));
        }
        self.released = true;
        self.cache.release(&self.unit)
    }
}

impl Drop for Binding {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.release() {
                error!(unit = %self.unit.id(), error = %e, "release on drop failed");
            }
        }
    }
}

/// A submitted task holding one reference to its unit.
pub struct TaskExecution {
    id: Uuid,
    binding: Binding,
}

impl TaskExecution {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn origin(&self) -> &OriginIdentity {
        &self.binding.origin
    }

    pub fn unit(&self) -> &Arc<LoadingUnit> {
        &self.binding.unit
    }

    /// Split into `n` jobs sharing this task's unit.
    pub fn split(&self, n: usize) -> DeployResult<Vec<JobExecution>> {
        let mut jobs = Vec::with_capacity(n);
        for _ in 0..n {
            self.binding.cache.retain(&self.binding.unit)?;
            jobs.push(JobExecution {
                id: Uuid::new_v4(),
                task_id: Some(self.id),
                binding: Binding::new(
                    self.binding.origin.clone(),
                    Arc::clone(&self.binding.unit),
                    Arc::clone(&self.binding.cache),
                ),
            });
        }
        debug!(
            task = %self.id,
            jobs = n,
            ref_count = self.binding.unit.ref_count(),
            "task split"
        );
        Ok(jobs)
    }

    /// Deploy a resource instance and attach it to the task's unit.
    pub fn inject(&self, instance: Arc<ResourceInstance>) -> DeployResult<()> {
        self.binding.inject(instance)
    }

    /// Release the task's reference. Returns the unit's remaining count.
    pub fn finish(mut self) -> DeployResult<usize> {
        self.binding.release()
    }
}

/// A job holding one reference to its unit.
pub struct JobExecution {
    id: Uuid,
    task_id: Option<Uuid>,
    binding: Binding,
}

impl JobExecution {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The task this job was split from; `None` for remote jobs.
    pub fn task_id(&self) -> Option<Uuid> {
        self.task_id
    }

    pub fn origin(&self) -> &OriginIdentity {
        &self.binding.origin
    }

    pub fn unit(&self) -> &Arc<LoadingUnit> {
        &self.binding.unit
    }

    pub fn load_resource(&self, name: &str) -> Result<Arc<[u8]>, ClassResolutionError> {
        self.binding.unit.load_resource(name)
    }

    pub fn inject(&self, instance: Arc<ResourceInstance>) -> DeployResult<()> {
        self.binding.inject(instance)
    }

    /// Check that this job runs on the same unit as `task`.
    pub fn verify_against(&self, task: &TaskExecution) -> DeployResult<()> {
        if Arc::ptr_eq(self.unit(), task.unit()) {
            return Ok(());
        }
        error!(
            job = %self.id,
            task = %task.id,
            job_unit = %self.unit().id(),
            task_unit = %task.unit().id(),
            "job bound to a different loading unit than its task"
        );
        Err(DeployError::InvariantViolation(format!(
            "job {} runs on unit {} but task {} runs on unit {}",
            self.id,
            self.unit().id(),
            task.id,
            task.unit().id()
        )))
    }

    pub fn finish(mut self) -> DeployResult<usize> {
        self.binding.release()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::InMemoryFetcher;
    use crate::resource::{LifecycleState, NodeContext, ResourceContext, UserResource};
    use gridp2p_core::{DeploymentMode, NodeId};

    fn binder(mode: DeploymentMode) -> ExecutionBinder {
        let fetcher = Arc::new(InMemoryFetcher::new());
        fetcher.insert("node-1", "Task", b"task".to_vec());
        fetcher.insert("node-1", "data.bin", b"payload".to_vec());
        let lifecycle = Arc::new(ResourceLifecycleManager::new(Arc::new(NodeContext::new(
            NodeId::new("local"),
        ))));
        ExecutionBinder::new(Arc::new(LoadingUnitCache::new(mode, fetcher, lifecycle)))
    }

    fn origin() -> OriginIdentity {
        OriginIdentity::new("node-1", "Task", "v1")
    }

    struct Noop;
    impl UserResource for Noop {}

    #[test]
    fn split_jobs_share_task_unit() {
        let binder = binder(DeploymentMode::Private);
        let task = binder.submit(origin()).unwrap();
        let jobs = task.split(3).unwrap();

        assert_eq!(task.unit().ref_count(), 4);
        for job in &jobs {
            assert!(Arc::ptr_eq(job.unit(), task.unit()));
            assert_eq!(job.task_id(), Some(task.id()));
            job.verify_against(&task).unwrap();
        }
        assert_eq!(binder.cache().len(), 1);
    }

    #[test]
    fn finishing_everything_releases_private_unit() {
        let binder = binder(DeploymentMode::Private);
        let task = binder.submit(origin()).unwrap();
        let unit = Arc::clone(task.unit());
        let jobs = task.split(2).unwrap();

        for job in jobs {
            job.finish().unwrap();
        }
        assert_eq!(task.finish().unwrap(), 0);
        assert!(unit.is_undeployed());
        assert!(binder.cache().is_empty());
    }

    #[test]
    fn dropped_job_releases_reference() {
        let binder = binder(DeploymentMode::Shared);
        let task = binder.submit(origin()).unwrap();
        {
            let _jobs = task.split(2).unwrap();
            assert_eq!(task.unit().ref_count(), 3);
        }
        assert_eq!(task.unit().ref_count(), 1);
    }

    #[test]
    fn private_remote_job_gets_its_own_unit() {
        let binder = binder(DeploymentMode::Private);
        let task = binder.submit(origin()).unwrap();
        let remote = binder.accept_remote_job(origin()).unwrap();

        assert_eq!(remote.task_id(), None);
        assert!(!Arc::ptr_eq(remote.unit(), task.unit()));
        assert!(matches!(
            remote.verify_against(&task),
            Err(DeployError::InvariantViolation(_))
        ));
    }

    #[test]
    fn shared_remote_job_joins_task_unit() {
        let binder = binder(DeploymentMode::Shared);
        let task = binder.submit(origin()).unwrap();
        let remote = binder.accept_remote_job(origin()).unwrap();

        remote.verify_against(&task).unwrap();
        assert_eq!(task.unit().ref_count(), 2);
    }

    #[test]
    fn job_loads_through_shared_unit() {
        let binder = binder(DeploymentMode::Shared);
        let task = binder.submit(origin()).unwrap();
        let jobs = task.split(2).unwrap();

        let a = jobs[0].load_resource("data.bin").unwrap();
        let b = jobs[1].load_resource("data.bin").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(task.unit().is_loaded("data.bin"));
    }

    #[test]
    fn inject_into_evicted_unit_undeploys_immediately() {
        let binder = binder(DeploymentMode::Shared);
        let task = binder.submit(origin()).unwrap();
        let key = task.unit().key().clone();
        binder.cache().undeploy(&key);
        assert!(task.unit().is_undeployed());

        let instance = Arc::new(ResourceInstance::new("late", Noop));
        task.inject(Arc::clone(&instance)).unwrap();

        assert_eq!(instance.state(), LifecycleState::Undeployed);
        assert_eq!(task.unit().attached_count(), 0);
        task.finish().unwrap();

        binder.cache().undeploy(&key);
        binder.cache().undeploy_class("Task");
        let lifecycle = binder.cache().lifecycle();
        assert_eq!(lifecycle.deploy_count("Task"), 1);
        assert_eq!(lifecycle.undeploy_count("Task"), 1);
    }

    #[test]
    fn concurrent_inject_and_undeploy_lose_no_resource() {
        let binder = binder(DeploymentMode::Shared);
        let task = Arc::new(binder.submit(origin()).unwrap());
        let key = task.unit().key().clone();
        let barrier = Arc::new(std::sync::Barrier::new(5));

        let injectors: Vec<_> = (0..4)
            .map(|t| {
                let task = Arc::clone(&task);
                let barrier = Arc::clone(&barrier);
                std::thread::spawn(move || {
                    barrier.wait();
                    (0..25)
                        .map(|i| {
                            let instance =
                                Arc::new(ResourceInstance::new(format!("res-{t}-{i}"), Noop));
                            task.inject(Arc::clone(&instance)).unwrap();
                            instance
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        barrier.wait();
        binder.cache().undeploy(&key);

        let instances: Vec<_> = injectors
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        for instance in &instances {
            assert_eq!(instance.state(), LifecycleState::Undeployed, "{}", instance.name());
        }
        let lifecycle = binder.cache().lifecycle();
        assert_eq!(lifecycle.deploy_count("Task"), 100);
        assert_eq!(lifecycle.undeploy_count("Task"), 100);
    }

    #[test]
    fn injected_resource_undeployed_with_unit() {
        struct NeedsNode;
        impl UserResource for NeedsNode {
            fn on_deploy(&self, ctx: &ResourceContext) -> anyhow::Result<()> {
                assert!(ctx.node().is_some());
                Ok(())
            }
        }

        let binder = binder(DeploymentMode::Shared);
        let task = binder.submit(origin()).unwrap();
        let instance = Arc::new(ResourceInstance::new("needs-node", NeedsNode));
        task.inject(Arc::clone(&instance)).unwrap();

        assert_eq!(instance.state(), LifecycleState::Deployed);
        assert_eq!(task.unit().attached_count(), 1);

        let key = task.unit().key().clone();
        binder.cache().undeploy(&key);
        assert_eq!(instance.state(), LifecycleState::Undeployed);

        let lifecycle = binder.cache().lifecycle();
        assert_eq!(lifecycle.deploy_count("Task"), 1);
        assert_eq!(lifecycle.undeploy_count("Task"), 1);
    }
}
