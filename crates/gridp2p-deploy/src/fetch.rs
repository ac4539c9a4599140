//! Class/resource fetch — the transport seam to origin nodes.
//!
//! The core never talks to the network itself. A [`ResourceFetcher`] is
//! injected into the cache and asked for raw bytes by origin identity and
//! resource name. Retry policy, if any, belongs to the fetcher.
//!
//! Two implementations ship with the crate:
//! - [`InMemoryFetcher`] — per-node resource maps, used by tests and embedders
//! - [`DirectoryFetcher`] — reads `<root>/<node id>/<resource name>`

use std::collections::HashMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use tracing::{debug, warn};

use gridp2p_core::{NodeId, OriginIdentity, ResolutionFailure};

/// Supplies class/resource bytes from the node a deployment originated on.
///
/// Implementations may block. Failures map onto [`ResolutionFailure`]:
/// `NotFound` when the origin lacks the resource, `Unreachable` when the
/// origin cannot be contacted.
pub trait ResourceFetcher: Send + Sync {
    fn fetch(&self, origin: &OriginIdentity, name: &str) -> Result<Vec<u8>, ResolutionFailure>;
}

/// Fetcher over in-process resource maps, one per origin node.
///
/// Nodes that were never registered (or were disconnected) are reported
/// as unreachable. Every call is counted so callers can assert how often
/// the transport was hit.
#[derive(Debug, Default)]
pub struct InMemoryFetcher {
    nodes: DashMap<NodeId, HashMap<String, Vec<u8>>>,
    fetches: DashMap<String, u64>,
    total: AtomicU64,
    latency: Option<Duration>,
}

impl InMemoryFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate transport latency on every fetch.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Publish a resource on a node, registering the node if needed.
    pub fn insert(&self, node: impl Into<NodeId>, name: impl Into<String>, bytes: impl Into<Vec<u8>>) {
        self.nodes
            .entry(node.into())
            .or_default()
            .insert(name.into(), bytes.into());
    }

    /// Make a node unreachable. Returns whether it was registered.
    pub fn disconnect(&self, node: &NodeId) -> bool {
        self.nodes.remove(node).is_some()
    }

    /// Number of fetches issued for a resource name, across all nodes.
    pub fn fetch_count(&self, name: &str) -> u64 {
        self.fetches.get(name).map(|c| *c).unwrap_or(0)
    }

    pub fn total_fetches(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl ResourceFetcher for InMemoryFetcher {
    fn fetch(&self, origin: &OriginIdentity, name: &str) -> Result<Vec<u8>, ResolutionFailure> {
        *self.fetches.entry(name.to_string()).or_insert(0) += 1;
        self.total.fetch_add(1, Ordering::Relaxed);

        if let Some(latency) = self.latency {
            std::thread::sleep(latency);
        }

        let node = self
            .nodes
            .get(origin.node())
            .ok_or(ResolutionFailure::Unreachable)?;
        node.get(name).cloned().ok_or(ResolutionFailure::NotFound)
    }
}

/// Fetcher that serves resources from a directory tree laid out as
/// `<root>/<origin node id>/<resource name>`.
///
/// A missing node directory means the origin is unreachable; a missing
/// file means the resource is not found. Names that would escape the node
/// directory are treated as not found, node ids that would escape the root
/// as unreachable.
#[derive(Debug, Clone)]
pub struct DirectoryFetcher {
    root: PathBuf,
}

impl DirectoryFetcher {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory for an origin node. The node id must be a single plain
    /// path component.
    fn node_dir(&self, node: &NodeId) -> Option<PathBuf> {
        let mut components = Path::new(node.as_str()).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) => Some(self.root.join(node.as_str())),
            _ => None,
        }
    }

    fn resource_path(node_dir: &Path, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        let confined = relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
        if !confined || name.is_empty() {
            return None;
        }
        Some(node_dir.join(relative))
    }
}

impl ResourceFetcher for DirectoryFetcher {
    fn fetch(&self, origin: &OriginIdentity, name: &str) -> Result<Vec<u8>, ResolutionFailure> {
        let Some(node_dir) = self.node_dir(origin.node()) else {
            warn!(node = %origin.node(), "origin node id is not a plain directory name");
            return Err(ResolutionFailure::Unreachable);
        };
        if !node_dir.is_dir() {
            debug!(node = %origin.node(), dir = ?node_dir, "origin directory missing");
            return Err(ResolutionFailure::Unreachable);
        }

        let path = Self::resource_path(&node_dir, name).ok_or(ResolutionFailure::NotFound)?;

        match std::fs::read(&path) {
            Ok(bytes) => {
                debug!(%name, node = %origin.node(), size = bytes.len(), "resource read from disk");
                Ok(bytes)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(ResolutionFailure::NotFound),
            Err(e) => {
                warn!(%name, path = ?path, error = %e, "resource read failed");
                Err(ResolutionFailure::Unreachable)
            }
        }
    }
}
