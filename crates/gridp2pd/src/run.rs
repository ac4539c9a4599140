//! `gridp2pd run` — submit a task against a directory of peer resources.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use gridp2p_core::{ClassResolutionError, NodeConfig, OriginIdentity};
use gridp2p_deploy::{CacheStats, DirectoryFetcher, GridNode, JobExecution, TaskExecution};

pub struct RunRequest {
    pub config: NodeConfig,
    pub resources: PathBuf,
    pub origin: String,
    pub class: String,
    pub version: String,
    pub jobs: usize,
    pub repeat: usize,
}

#[derive(Debug, Serialize)]
pub struct RunReport {
    pub node: String,
    pub mode: String,
    pub origin: String,
    pub tasks: Vec<TaskReport>,
    /// Units as seen while every task and job was still running.
    pub units: Vec<UnitReport>,
    pub cache: CacheStats,
    /// Units still cached after all executions finished.
    pub cached_after_finish: usize,
}

#[derive(Debug, Serialize)]
pub struct TaskReport {
    pub task: String,
    pub unit: String,
    pub jobs: usize,
    pub jobs_share_unit: bool,
}

#[derive(Debug, Serialize)]
pub struct UnitReport {
    pub id: String,
    pub key: String,
    pub ref_count: usize,
    pub retired: bool,
    pub classes: Vec<String>,
    pub participants: Vec<String>,
    pub resources: Vec<ResourceDigest>,
}

#[derive(Debug, Serialize)]
pub struct ResourceDigest {
    pub name: String,
    pub sha256: String,
}

pub async fn execute(request: RunRequest) -> anyhow::Result<RunReport> {
    let fetcher = Arc::new(DirectoryFetcher::new(&request.resources));
    let node = Arc::new(GridNode::new(&request.config, fetcher));
    execute_on(node, &request).await
}

/// Drive the submissions of `request` against an already assembled node.
async fn execute_on(node: Arc<GridNode>, request: &RunRequest) -> anyhow::Result<RunReport> {
    let origin = OriginIdentity::new(
        request.origin.as_str(),
        request.class.as_str(),
        request.version.as_str(),
    );
    let timeout = request.config.deployment.fetch_timeout();

    info!(
        node = %node.node_id(),
        mode = %node.cache().mode(),
        %origin,
        repeat = request.repeat,
        jobs = request.jobs,
        "running task submissions"
    );

    let mut running: Vec<(TaskExecution, Vec<JobExecution>)> = Vec::with_capacity(request.repeat);
    let mut tasks = Vec::with_capacity(request.repeat);
    for _ in 0..request.repeat {
        let task = submit_bounded(Arc::clone(&node), origin.clone(), timeout).await?;
        let jobs = task.split(request.jobs)?;
        let jobs_share_unit = verify_jobs(&task, &jobs);
        tasks.push(TaskReport {
            task: task.id().to_string(),
            unit: task.unit().id().to_string(),
            jobs: jobs.len(),
            jobs_share_unit,
        });
        running.push((task, jobs));
    }

    let units = unit_reports(&node);

    for (task, jobs) in running {
        for job in jobs {
            job.finish()?;
        }
        let remaining = task.finish()?;
        debug!(remaining, "task finished");
    }

    Ok(RunReport {
        node: node.node_id().to_string(),
        mode: node.cache().mode().to_string(),
        origin: origin.to_string(),
        tasks,
        units,
        cache: node.cache().stats(),
        cached_after_finish: node.cache().len(),
    })
}

fn verify_jobs(task: &TaskExecution, jobs: &[JobExecution]) -> bool {
    let mut shared = true;
    for job in jobs {
        if let Err(e) = job.verify_against(task) {
            warn!(task = %task.id(), job = %job.id(), error = %e, "job resolved a different unit");
            shared = false;
        }
    }
    shared
}

/// Resolve on the blocking pool, bounded by the configured fetch timeout.
async fn submit_bounded(
    node: Arc<GridNode>,
    origin: OriginIdentity,
    limit: Duration,
) -> anyhow::Result<TaskExecution> {
    let submitted = origin.clone();
    let handle = tokio::task::spawn_blocking(move || node.submit(submitted));
    match tokio::time::timeout(limit, handle).await {
        Ok(joined) => Ok(joined??),
        Err(_) => Err(ClassResolutionError::timeout(origin).into()),
    }
}

fn unit_reports(node: &GridNode) -> Vec<UnitReport> {
    node.cache()
        .units()
        .into_iter()
        .map(|unit| UnitReport {
            id: unit.id().to_string(),
            key: unit.key().to_string(),
            ref_count: unit.ref_count(),
            retired: unit.is_retired(),
            classes: unit.classes(),
            participants: unit.participants().iter().map(|n| n.to_string()).collect(),
            resources: unit
                .loaded_resources()
                .into_iter()
                .filter_map(|name| {
                    let sha256 = unit.digest(&name)?;
                    Some(ResourceDigest { name, sha256 })
                })
                .collect(),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridp2p_core::{DeploymentMode, ResolutionFailure};
    use gridp2p_deploy::InMemoryFetcher;

    fn peers() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("node-2")).unwrap();
        std::fs::write(dir.path().join("node-2/Task"), b"abc").unwrap();
        dir
    }

    fn request(dir: &tempfile::TempDir, mode: DeploymentMode, repeat: usize) -> RunRequest {
        RunRequest {
            config: NodeConfig::scaffold("node-1", mode),
            resources: dir.path().to_path_buf(),
            origin: "node-2".into(),
            class: "Task".into(),
            version: "v1".into(),
            jobs: 3,
            repeat,
        }
    }

    #[tokio::test]
    async fn shared_run_reuses_one_unit() {
        let dir = peers();
        let report = execute(request(&dir, DeploymentMode::Shared, 2)).await.unwrap();

        assert_eq!(report.tasks.len(), 2);
        assert_eq!(report.tasks[0].unit, report.tasks[1].unit);
        assert_eq!(report.units.len(), 1);
        assert_eq!(report.units[0].ref_count, 8);
        assert_eq!(
            report.units[0].resources[0].sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(report.cache.hits, 1);
        assert_eq!(report.cached_after_finish, 1);
    }

    #[tokio::test]
    async fn private_run_evicts_after_finish() {
        let dir = peers();
        let report = execute(request(&dir, DeploymentMode::Private, 2)).await.unwrap();

        assert_ne!(report.tasks[0].unit, report.tasks[1].unit);
        assert_eq!(report.units.len(), 2);
        assert!(report.units.iter().all(|u| u.ref_count == 4));
        assert_eq!(report.cached_after_finish, 0);
        assert_eq!(report.cache.evictions, 2);
    }

    #[tokio::test]
    async fn unknown_origin_fails_resolution() {
        let dir = peers();
        let mut req = request(&dir, DeploymentMode::Shared, 1);
        req.origin = "node-9".into();

        let err = execute(req).await.unwrap_err();
        let resolution = err.downcast_ref::<ClassResolutionError>().unwrap();
        assert_eq!(resolution.reason, ResolutionFailure::Unreachable);
    }

    #[tokio::test]
    async fn slow_origin_times_out_resolution() {
        let fetcher = InMemoryFetcher::new().with_latency(Duration::from_millis(200));
        fetcher.insert("node-2", "Task", b"abc".to_vec());
        let mut config = NodeConfig::scaffold("node-1", DeploymentMode::Shared);
        config.deployment.fetch_timeout_ms = 20;
        let node = Arc::new(GridNode::new(&config, Arc::new(fetcher)));

        let dir = peers();
        let mut req = request(&dir, DeploymentMode::Shared, 1);
        req.config = config;

        let err = execute_on(node, &req).await.unwrap_err();
        let resolution = err.downcast_ref::<ClassResolutionError>().unwrap();
        assert_eq!(resolution.reason, ResolutionFailure::Timeout);
        assert_eq!(resolution.origin.node().as_str(), "node-2");
    }

    #[tokio::test]
    async fn run_reports_jobs_sharing_the_task_unit() {
        let dir = peers();
        let report = execute(request(&dir, DeploymentMode::Isolated, 2)).await.unwrap();
        assert!(report.tasks.iter().all(|t| t.jobs_share_unit && t.jobs == 3));
    }

    #[test]
    fn report_serializes_to_json() {
        let report = RunReport {
            node: "node-1".into(),
            mode: "shared".into(),
            origin: "Task@node-2#v1".into(),
            tasks: Vec::new(),
            units: Vec::new(),
            cache: CacheStats::default(),
            cached_after_finish: 0,
        };
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["mode"], "shared");
        assert_eq!(json["cache"]["hits"], 0);
    }
}
