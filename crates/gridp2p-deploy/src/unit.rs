//! LoadingUnit — one resolved, cached code context on a node.
//!
//! A unit is the analog of a class loader: it remembers which resources
//! have been pulled into it, from where, and which task classes it hosts.
//! Resources are fetched lazily, exactly once per name; concurrent loads
//! of the same name wait on the in-flight fetch.
//!
//! Units are created, reference-counted and evicted only by the
//! [`LoadingUnitCache`](crate::cache::LoadingUnitCache). Everyone else
//! holds a plain `Arc<LoadingUnit>`.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use dashmap::DashMap;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use gridp2p_core::{
    CacheKey, ClassResolutionError, DeploymentMode, NodeId, OriginIdentity, ResolutionFailure,
};

use crate::fetch::ResourceFetcher;
use crate::resource::ResourceInstance;

/// Bytes of one resource resolved into a unit.
#[derive(Debug, Clone)]
pub struct LoadedResource {
    bytes: Arc<[u8]>,
    digest: String,
    source: NodeId,
}

impl LoadedResource {
    pub fn bytes(&self) -> &Arc<[u8]> {
        &self.bytes
    }

    /// Hex-encoded SHA-256 of the bytes.
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// Node the bytes were fetched from.
    pub fn source(&self) -> &NodeId {
        &self.source
    }
}

/// Per-name slot. The mutex is held across the fetch so a second loader
/// of the same name waits instead of fetching again.
#[derive(Default)]
struct ResourceSlot {
    loaded: Mutex<Option<LoadedResource>>,
}

pub struct LoadingUnit {
    id: Uuid,
    key: CacheKey,
    mode: DeploymentMode,
    /// Deployment that caused the unit to be created.
    origin: OriginIdentity,
    fetcher: Arc<dyn ResourceFetcher>,
    ref_count: AtomicUsize,
    retired: AtomicBool,
    undeployed: AtomicBool,
    resources: DashMap<String, Arc<ResourceSlot>>,
    /// Task classes hosted: class id → user version.
    classes: DashMap<String, String>,
    /// Origin nodes that resolved into this unit, with their latest identity.
    participants: DashMap<NodeId, OriginIdentity>,
    attached: Mutex<Vec<Arc<ResourceInstance>>>,
}

impl LoadingUnit {
    pub(crate) fn new(
        key: CacheKey,
        mode: DeploymentMode,
        origin: OriginIdentity,
        fetcher: Arc<dyn ResourceFetcher>,
    ) -> Self {
        let participants = DashMap::new();
        participants.insert(origin.node().clone(), origin.clone());
        Self {
            id: Uuid::new_v4(),
            key,
            mode,
            origin,
            fetcher,
            ref_count: AtomicUsize::new(0),
            retired: AtomicBool::new(false),
            undeployed: AtomicBool::new(false),
            resources: DashMap::new(),
            classes: DashMap::new(),
            participants,
            attached: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn key(&self) -> &CacheKey {
        &self.key
    }

    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn origin(&self) -> &OriginIdentity {
        &self.origin
    }

    /// Live tasks and jobs currently bound to this unit.
    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::SeqCst)
    }

    /// Superseded by a newer user version; no longer returned by resolve.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Evicted from the cache. Existing holders may keep using it.
    pub fn is_undeployed(&self) -> bool {
        self.undeployed.load(Ordering::SeqCst)
    }

    pub fn hosts_class(&self, class_id: &str) -> bool {
        self.classes.contains_key(class_id)
    }

    /// Task classes hosted by this unit.
    pub fn classes(&self) -> Vec<String> {
        self.classes.iter().map(|e| e.key().clone()).collect()
    }

    pub fn participants(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.participants.iter().map(|e| e.key().clone()).collect();
        nodes.sort();
        nodes
    }

    /// Load a resource by name, fetching it from the unit's participants on
    /// first reference. Later calls are served from the unit.
    pub fn load_resource(&self, name: &str) -> Result<Arc<[u8]>, ClassResolutionError> {
        self.load(name).map(|r| r.bytes)
    }

    /// Like [`load_resource`](Self::load_resource) but returns the digest and
    /// source node alongside the bytes.
    pub fn load(&self, name: &str) -> Result<LoadedResource, ClassResolutionError> {
        let slot = Arc::clone(self.resources.entry(name.to_string()).or_default().value());
        let mut loaded = slot.loaded.lock();
        if let Some(resource) = loaded.as_ref() {
            return Ok(resource.clone());
        }

        let (bytes, source) = self.fetch_from_participants(name)?;
        let digest = hex::encode(Sha256::digest(&bytes));
        debug!(
            unit = %self.id,
            key = %self.key,
            %name,
            %source,
            size = bytes.len(),
            %digest,
            "resource loaded into unit"
        );
        let resource = LoadedResource {
            bytes: Arc::from(bytes),
            digest,
            source,
        };
        *loaded = Some(resource.clone());
        Ok(resource)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        let Some(slot) = self.resources.get(name).map(|s| Arc::clone(s.value())) else {
            return false;
        };
        slot.loaded.lock().is_some()
    }

    /// Names of resources already resolved into the unit.
    pub fn loaded_resources(&self) -> Vec<String> {
        let slots: Vec<(String, Arc<ResourceSlot>)> = self
            .resources
            .iter()
            .map(|e| (e.key().clone(), Arc::clone(e.value())))
            .collect();
        let mut names: Vec<String> = slots
            .into_iter()
            .filter(|(_, slot)| slot.loaded.lock().is_some())
            .map(|(name, _)| name)
            .collect();
        names.sort();
        names
    }

    /// SHA-256 digest of a loaded resource.
    pub fn digest(&self, name: &str) -> Option<String> {
        let slot = self.resources.get(name).map(|s| Arc::clone(s.value()))?;
        let loaded = slot.loaded.lock();
        loaded.as_ref().map(|r| r.digest.clone())
    }

    /// Tries the creating origin first, then other participants while the
    /// failure is `Unreachable`.
    fn fetch_from_participants(
        &self,
        name: &str,
    ) -> Result<(Vec<u8>, NodeId), ClassResolutionError> {
        let mut candidates = vec![self.origin.clone()];
        candidates.extend(
            self.participants
                .iter()
                .filter(|e| e.key() != self.origin.node())
                .map(|e| e.value().clone()),
        );

        let mut reason = ResolutionFailure::Unreachable;
        for candidate in &candidates {
            match self.fetcher.fetch(candidate, name) {
                Ok(bytes) => return Ok((bytes, candidate.node().clone())),
                Err(ResolutionFailure::Unreachable) => {
                    debug!(%name, node = %candidate.node(), "participant unreachable, trying next");
                }
                Err(other) => {
                    reason = other;
                    break;
                }
            }
        }
        Err(ClassResolutionError::new(name, self.origin.clone(), reason))
    }

    // ── Cache-owned state ──────────────────────────────────────────

    /// Load the deployment's task class and record the unit as hosting it.
    pub(crate) fn load_class(&self, origin: &OriginIdentity) -> Result<(), ClassResolutionError> {
        self.load(origin.class_id()).map_err(|e| ClassResolutionError {
            origin: origin.clone(),
            ..e
        })?;
        self.classes
            .insert(origin.class_id().to_string(), origin.user_version().to_string());
        Ok(())
    }

    pub(crate) fn add_participant(&self, origin: &OriginIdentity) {
        self.participants.insert(origin.node().clone(), origin.clone());
    }

    /// Remove a participant, returning how many remain.
    pub(crate) fn remove_participant(&self, node: &NodeId) -> Option<usize> {
        self.participants
            .remove(node)
            .map(|_| self.participants.len())
    }

    pub(crate) fn acquire(&self) -> usize {
        self.ref_count.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Increment only while someone already holds the unit.
    pub(crate) fn acquire_held(&self) -> Option<usize> {
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| {
                (c > 0).then_some(c + 1)
            })
            .ok()
            .map(|prev| prev + 1)
    }

    /// Decrement, refusing to go below zero.
    pub(crate) fn release(&self) -> Option<usize> {
        self.ref_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| c.checked_sub(1))
            .ok()
            .map(|prev| prev - 1)
    }

    pub(crate) fn mark_retired(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Attach a deployed instance so eviction undeploys it. Once the unit
    /// is undeployed the instance is handed back instead.
    pub(crate) fn attach(
        &self,
        instance: Arc<ResourceInstance>,
    ) -> Result<(), Arc<ResourceInstance>> {
        let mut attached = self.attached.lock();
        if self.undeployed.load(Ordering::SeqCst) {
            return Err(instance);
        }
        attached.push(instance);
        Ok(())
    }

    /// Flag the unit as undeployed and drain its attached instances.
    /// Returns `None` if it was already undeployed.
    ///
    /// Runs under the same lock as `attach`, so no instance can attach
    /// after the drain.
    pub(crate) fn begin_undeploy(&self) -> Option<Vec<Arc<ResourceInstance>>> {
        let mut attached = self.attached.lock();
        if self.undeployed.swap(true, Ordering::SeqCst) {
            return None;
        }
        Some(std::mem::take(&mut *attached))
    }

    /// Resource instances attached to this unit.
    pub fn attached_count(&self) -> usize {
        self.attached.lock().len()
    }
}

impl fmt::Debug for LoadingUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadingUnit")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("mode", &self.mode)
            .field("ref_count", &self.ref_count())
            .field("retired", &self.is_retired())
            .field("undeployed", &self.is_undeployed())
            .finish()
    }
}
