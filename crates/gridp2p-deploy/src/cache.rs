//! Loading-unit cache — per-node map from cache key to loaded code.
//!
//! The cache is the only owner of [`LoadingUnit`] lifecycle:
//! - `resolve` returns the cached unit for a deployment's key (hit) or
//!   creates one, loading the task class through the fetcher (miss)
//! - `retain`/`release` move the unit's reference count
//! - `undeploy` and redeploys evict units and undeploy their resources
//!
//! # Concurrency model
//!
//! Live units sit in a `DashMap` keyed by [`CacheKey`]; a hit increments
//! the reference count while holding the key's shard lock, so it is
//! linearized against `undeploy` removing the same key. Fetching on a miss
//! happens outside any lock. Two concurrent misses for one key may both
//! fetch; the first insert wins and the other adopts the winner's unit.
//!
//! Units superseded by a newer user version move to a `retired` map keyed
//! by unit id. Resolve never sees them; they are evicted when their last
//! holder releases or when their key is undeployed.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use gridp2p_core::{CacheKey, ClassResolutionError, DeploymentMode, OriginIdentity, cache_key_for};

use crate::error::{DeployError, DeployResult, ResourceError};
use crate::fetch::ResourceFetcher;
use crate::resource::ResourceLifecycleManager;
use crate::unit::LoadingUnit;

/// Snapshot of cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub redeploys: u64,
    pub live: usize,
    pub retired: usize,
}

#[derive(Default)]
struct Counters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    redeploys: AtomicU64,
}

/// What an eviction did.
#[derive(Debug, Default)]
pub struct UndeployOutcome {
    /// Units evicted.
    pub units: usize,
    /// Resource instances whose undeploy path ran.
    pub resources: usize,
    /// Undeploy callbacks that failed. Their counters were still bumped.
    pub failures: Vec<ResourceError>,
}

impl UndeployOutcome {
    pub fn merge(&mut self, other: UndeployOutcome) {
        self.units += other.units;
        self.resources += other.resources;
        self.failures.extend(other.failures);
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Per-node cache of loading units.
pub struct LoadingUnitCache {
    mode: DeploymentMode,
    fetcher: Arc<dyn ResourceFetcher>,
    lifecycle: Arc<ResourceLifecycleManager>,
    live: DashMap<CacheKey, Arc<LoadingUnit>>,
    retired: DashMap<Uuid, Arc<LoadingUnit>>,
    stats: Counters,
}

impl LoadingUnitCache {
    pub fn new(
        mode: DeploymentMode,
        fetcher: Arc<dyn ResourceFetcher>,
        lifecycle: Arc<ResourceLifecycleManager>,
    ) -> Self {
        Self {
            mode,
            fetcher,
            lifecycle,
            live: DashMap::new(),
            retired: DashMap::new(),
            stats: Counters::default(),
        }
    }

    /// The node's configured deployment mode.
    pub fn mode(&self) -> DeploymentMode {
        self.mode
    }

    pub fn lifecycle(&self) -> &Arc<ResourceLifecycleManager> {
        &self.lifecycle
    }

    /// Resolve a deployment under the node's configured mode.
    pub fn resolve(&self, origin: &OriginIdentity) -> Result<Arc<LoadingUnit>, ClassResolutionError> {
        self.resolve_with(self.mode, origin)
    }

    /// Resolve a deployment to a loading unit, creating it on a miss.
    ///
    /// The returned unit has been retained once on behalf of the caller,
    /// who must hand it back through [`release`](Self::release).
    pub fn resolve_with(
        &self,
        mode: DeploymentMode,
        origin: &OriginIdentity,
    ) -> Result<Arc<LoadingUnit>, ClassResolutionError> {
        let key = cache_key_for(mode, origin);

        if let Some(unit) = self.acquire_live(&key) {
            self.stats.hits.fetch_add(1, Ordering::Relaxed);
            debug!(%key, %origin, ref_count = unit.ref_count(), "loading unit cache hit");
            return self.finish_resolve(unit, origin, false);
        }

        self.stats.misses.fetch_add(1, Ordering::Relaxed);
        let created = Arc::new(LoadingUnit::new(
            key.clone(),
            mode,
            origin.clone(),
            Arc::clone(&self.fetcher),
        ));
        // Nothing is inserted when the task class cannot be fetched.
        created.load_class(origin)?;

        let (unit, inserted) = match self.live.entry(key) {
            Entry::Occupied(existing) => {
                let unit = Arc::clone(existing.get());
                unit.acquire();
                (unit, false)
            }
            Entry::Vacant(slot) => {
                created.acquire();
                slot.insert(Arc::clone(&created));
                (created, true)
            }
        };

        if inserted {
            info!(
                key = %unit.key(),
                unit = %unit.id(),
                %mode,
                %origin,
                "loading unit created"
            );
            if mode.redeploys_on_version_change() {
                self.retire_superseded(&unit);
            }
        } else {
            debug!(key = %unit.key(), "concurrent resolve created the unit first, adopting it");
        }

        self.finish_resolve(unit, origin, inserted)
    }

    fn finish_resolve(
        &self,
        unit: Arc<LoadingUnit>,
        origin: &OriginIdentity,
        created: bool,
    ) -> Result<Arc<LoadingUnit>, ClassResolutionError> {
        unit.add_participant(origin);
        if !created && !unit.hosts_class(origin.class_id()) {
            // Isolated units host every class their origin node deploys.
            if let Err(e) = unit.load_class(origin) {
                if let Err(release_err) = self.release(&unit) {
                    error!(error = %release_err, "release after failed class load");
                }
                return Err(e);
            }
        }
        Ok(unit)
    }

    fn acquire_live(&self, key: &CacheKey) -> Option<Arc<LoadingUnit>> {
        self.live.get(key).map(|unit| {
            unit.acquire();
            Arc::clone(unit.value())
        })
    }

    /// Add a reference to a unit the caller already holds, without a cache
    /// lookup.
    pub fn retain(&self, unit: &Arc<LoadingUnit>) -> DeployResult<usize> {
        unit.acquire_held().ok_or_else(|| {
            error!(key = %unit.key(), unit = %unit.id(), "retain of unit with no holders");
            DeployError::InvariantViolation(format!(
                "retain of unit {} ({}) with no live references",
                unit.id(),
                unit.key()
            ))
        })
    }

    /// Drop one reference. Returns the remaining count.
    ///
    /// At zero, private units and units superseded by a redeploy are
    /// evicted; other units stay cached until undeployed.
    pub fn release(&self, unit: &Arc<LoadingUnit>) -> DeployResult<usize> {
        let remaining = unit.release().ok_or_else(|| {
            error!(key = %unit.key(), unit = %unit.id(), "reference count would go negative");
            DeployError::InvariantViolation(format!(
                "release of unit {} ({}) with zero references",
                unit.id(),
                unit.key()
            ))
        })?;
        debug!(key = %unit.key(), ref_count = remaining, "loading unit released");

        if remaining == 0 {
            let outcome = if unit.mode() == DeploymentMode::Private {
                self.evict_live(unit, "private unit released")
            } else if unit.is_retired() {
                self.evict_retired(unit, "superseded unit released")
            } else {
                UndeployOutcome::default()
            };
            for failure in &outcome.failures {
                warn!(key = %unit.key(), error = %failure, "resource undeploy failed during eviction");
            }
        }
        Ok(remaining)
    }

    /// Remove every unit cached under `key`, live or retired, regardless of
    /// reference counts. Holders keep their `Arc`; resolve will not return
    /// the units again. Attached resources are undeployed.
    pub fn undeploy(&self, key: &CacheKey) -> UndeployOutcome {
        let mut victims = Vec::new();
        if let Some((_, unit)) = self.live.remove(key) {
            victims.push(unit);
        }
        self.retired.retain(|_, unit| {
            if unit.key() == key {
                victims.push(Arc::clone(unit));
                false
            } else {
                true
            }
        });

        let mut outcome = UndeployOutcome::default();
        for unit in &victims {
            outcome.merge(self.evict(unit, "undeployed"));
        }
        if victims.is_empty() {
            debug!(%key, "undeploy found no cached unit");
        } else {
            info!(%key, units = outcome.units, resources = outcome.resources, "cache key undeployed");
        }
        outcome
    }

    /// Undeploy every unit hosting `class_id`.
    pub fn undeploy_class(&self, class_id: &str) -> UndeployOutcome {
        let mut keys: HashSet<CacheKey> = self
            .live
            .iter()
            .filter(|e| e.value().hosts_class(class_id))
            .map(|e| e.key().clone())
            .collect();
        keys.extend(
            self.retired
                .iter()
                .filter(|e| e.value().hosts_class(class_id))
                .map(|e| e.value().key().clone()),
        );

        let mut outcome = UndeployOutcome::default();
        for key in &keys {
            outcome.merge(self.undeploy(key));
        }
        info!(%class_id, units = outcome.units, "class undeployed");
        outcome
    }

    /// Move live units of the same class but another user version out of
    /// the resolve path.
    fn retire_superseded(&self, current: &Arc<LoadingUnit>) {
        let Some(class_id) = current.key().class_id() else {
            return;
        };
        let stale: Vec<CacheKey> = self
            .live
            .iter()
            .filter(|e| e.key().class_id() == Some(class_id) && e.key() != current.key())
            .map(|e| e.key().clone())
            .collect();

        for key in stale {
            let Some((_, old)) = self.live.remove_if(&key, |_, u| !Arc::ptr_eq(u, current)) else {
                continue;
            };
            old.mark_retired();
            self.retired.insert(old.id(), Arc::clone(&old));
            self.stats.redeploys.fetch_add(1, Ordering::Relaxed);
            info!(
                old_key = %key,
                new_key = %current.key(),
                ref_count = old.ref_count(),
                "loading unit superseded by redeploy"
            );
            // Holders that released before the retired flag was set did not
            // evict; catch that here.
            if old.ref_count() == 0 {
                self.evict_retired(&old, "superseded unit unreferenced");
            }
        }
    }

    /// Evict this exact unit, live or retired. Other units cached under the
    /// same key are left alone.
    pub fn evict_unit(&self, unit: &Arc<LoadingUnit>, reason: &str) -> UndeployOutcome {
        let outcome = self.evict_live(unit, reason);
        if outcome.units > 0 {
            return outcome;
        }
        self.evict_retired(unit, reason)
    }

    fn evict_live(&self, unit: &Arc<LoadingUnit>, reason: &str) -> UndeployOutcome {
        match self.live.remove_if(unit.key(), |_, u| Arc::ptr_eq(u, unit)) {
            Some(_) => self.evict(unit, reason),
            None => UndeployOutcome::default(),
        }
    }

    fn evict_retired(&self, unit: &Arc<LoadingUnit>, reason: &str) -> UndeployOutcome {
        match self.retired.remove(&unit.id()) {
            Some(_) => self.evict(unit, reason),
            None => UndeployOutcome::default(),
        }
    }

    fn evict(&self, unit: &Arc<LoadingUnit>, reason: &str) -> UndeployOutcome {
        let mut outcome = UndeployOutcome::default();
        let Some(attached) = unit.begin_undeploy() else {
            return outcome;
        };
        self.stats.evictions.fetch_add(1, Ordering::Relaxed);
        outcome.units = 1;

        for instance in attached {
            outcome.resources += 1;
            match self.lifecycle.on_undeploy(&instance) {
                Ok(()) | Err(ResourceError::AlreadyUndeployed(_)) => {}
                Err(e) => outcome.failures.push(e),
            }
        }

        info!(
            key = %unit.key(),
            unit = %unit.id(),
            reason,
            resources = outcome.resources,
            ref_count = unit.ref_count(),
            "loading unit evicted"
        );
        outcome
    }

    // ── Introspection ──────────────────────────────────────────────

    /// The live unit for a key, without touching its reference count.
    pub fn get(&self, key: &CacheKey) -> Option<Arc<LoadingUnit>> {
        self.live.get(key).map(|u| Arc::clone(u.value()))
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.live.contains_key(key) || self.retired.iter().any(|e| e.value().key() == key)
    }

    /// Cached units, live and retired.
    pub fn len(&self) -> usize {
        self.live.len() + self.retired.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys resolvable right now.
    pub fn keys(&self) -> Vec<CacheKey> {
        self.live.iter().map(|e| e.key().clone()).collect()
    }

    /// Snapshot of every cached unit, live first.
    pub fn units(&self) -> Vec<Arc<LoadingUnit>> {
        let mut units: Vec<Arc<LoadingUnit>> =
            self.live.iter().map(|e| Arc::clone(e.value())).collect();
        units.extend(self.retired.iter().map(|e| Arc::clone(e.value())));
        units
    }

    pub fn stats(&self) -> CacheStats {
        let stats = CacheStats {
            hits: self.stats.hits.load(Ordering::Relaxed),
            misses: self.stats.misses.load(Ordering::Relaxed),
            evictions: self.stats.evictions.load(Ordering::Relaxed),
            redeploys: self.stats.redeploys.load(Ordering::Relaxed),
            live: self.live.len(),
            retired: self.retired.len(),
        };
        info!(
            cache_hits = stats.hits,
            cache_misses = stats.misses,
            cache_evictions = stats.evictions,
            cache_redeploys = stats.redeploys,
            "loading unit cache stats"
        );
        stats
    }
}
