//! Entity Repository
//!
//! The create-or-load-or-cache factory for every entity kind. One
//! [`Repository`] value is built at startup and shared by reference; it owns
//! one [`EntityCache`] per kind, the persistence drivers and the minor
//! number pool.
//!
//! ```text
//!   get_x(key, args, create, fail)
//!            │
//!            ▼
//!   ┌──────────────────┐  miss   ┌────────────────────┐
//!   │ EntityCache<X>   │───────► │ PersistenceDriver  │  load / exists
//!   │ (DashMap, slot   │         └────────────────────┘
//!   │  lock per key)   │  create ┌────────────────────┐
//!   │                  │───────► │ TransactionContext │  attach + flush
//!   └──────────────────┘         └────────────────────┘
//! ```
//!
//! The per-kind operations (`get_node`, `delete_volume`, ...) live next to
//! their entity in [`crate::objects`].

mod cache;

#[cfg(test)]
mod tests;

pub use cache::EntityCache;

use crate::config::{CoreConfig, Mode};
use crate::error::{Error, Result};
use crate::numberpool::{BitmapPool, NumberPool};
use crate::objects::{
    Entity, MinorNumber, NetInterface, Node, NodeConnection, Resource, ResourceConnection,
    ResourceDefinition, StorPool, StorPoolDefinition, Volume, VolumeConnection, VolumeDefinition,
};
use crate::persistence::{ControllerDatabase, Drivers, PersistenceDriver, Record};
use crate::transaction::TransactionContext;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Statistics
// =============================================================================

/// Repository counters
#[derive(Debug, Default)]
pub struct RepositoryStats {
    pub creates: AtomicU64,
    pub loads: AtomicU64,
    pub cache_hits: AtomicU64,
    pub deletes: AtomicU64,
    pub commits: AtomicU64,
    pub rollbacks: AtomicU64,
}

impl RepositoryStats {
    pub fn snapshot(&self) -> RepositoryStatsSnapshot {
        RepositoryStatsSnapshot {
            creates: self.creates.load(Ordering::Relaxed),
            loads: self.loads.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            deletes: self.deletes.load(Ordering::Relaxed),
            commits: self.commits.load(Ordering::Relaxed),
            rollbacks: self.rollbacks.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`RepositoryStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RepositoryStatsSnapshot {
    pub creates: u64,
    pub loads: u64,
    pub cache_hits: u64,
    pub deletes: u64,
    pub commits: u64,
    pub rollbacks: u64,
}

// =============================================================================
// Repository
// =============================================================================

/// Shared entity caches, drivers and allocators
pub struct Repository {
    pub(crate) drivers: Drivers,
    pub(crate) minor_pool: Arc<dyn NumberPool>,
    pub(crate) stats: Arc<RepositoryStats>,
    mode: Mode,

    pub(crate) nodes: EntityCache<Node>,
    pub(crate) net_ifaces: EntityCache<NetInterface>,
    pub(crate) rsc_dfns: EntityCache<ResourceDefinition>,
    pub(crate) resources: EntityCache<Resource>,
    pub(crate) vlm_dfns: EntityCache<VolumeDefinition>,
    pub(crate) volumes: EntityCache<Volume>,
    pub(crate) stor_pool_dfns: EntityCache<StorPoolDefinition>,
    pub(crate) stor_pools: EntityCache<StorPool>,
    pub(crate) node_conns: EntityCache<NodeConnection>,
    pub(crate) rsc_conns: EntityCache<ResourceConnection>,
    pub(crate) vlm_conns: EntityCache<VolumeConnection>,
}

impl Repository {
    /// Empty repository over `drivers`
    pub fn new(drivers: Drivers, mode: Mode, minor_pool: Arc<dyn NumberPool>) -> Arc<Self> {
        Arc::new(Self {
            drivers,
            minor_pool,
            stats: Arc::new(RepositoryStats::default()),
            mode,
            nodes: EntityCache::new(),
            net_ifaces: EntityCache::new(),
            rsc_dfns: EntityCache::new(),
            resources: EntityCache::new(),
            vlm_dfns: EntityCache::new(),
            volumes: EntityCache::new(),
            stor_pool_dfns: EntityCache::new(),
            stor_pools: EntityCache::new(),
            node_conns: EntityCache::new(),
            rsc_conns: EntityCache::new(),
            vlm_conns: EntityCache::new(),
        })
    }

    /// Controller repository over `db`, with the stored object graph loaded
    pub fn controller(db: Arc<ControllerDatabase>, config: &CoreConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let repo = Self::new(Drivers::controller(db), Mode::Controller, minor_pool(config)?);
        let loaded = repo.load_all()?;
        info!(loaded, "Controller repository initialized");
        Ok(repo)
    }

    /// Satellite repository, memory only.
    ///
    /// Minor numbers are assigned by the controller, so the satellite pool
    /// spans every valid minor rather than the auto-allocation range.
    pub fn satellite(config: &CoreConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let pool = BitmapPool::new(0..=MinorNumber::MAX as u32)?;
        let repo = Self::new(Drivers::satellite(), Mode::Satellite, Arc::new(pool));
        info!("Satellite repository initialized");
        Ok(repo)
    }

    pub fn from_config(config: &CoreConfig) -> Result<Arc<Self>> {
        match config.mode {
            Mode::Controller => {
                let db = match &config.database_path {
                    Some(path) => ControllerDatabase::open(path)?,
                    None => ControllerDatabase::in_memory(),
                };
                Self::controller(db, config)
            }
            Mode::Satellite => Self::satellite(config),
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Fresh request-scoped unit of work over this repository's store
    pub fn new_context(&self) -> TransactionContext {
        TransactionContext::with_stats(self.drivers.store.clone(), self.stats.clone())
    }

    pub fn stats(&self) -> RepositoryStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn minor_pool(&self) -> &dyn NumberPool {
        self.minor_pool.as_ref()
    }

    /// Rebuild the object graph from the store. Returns the number of
    /// entities restored.
    ///
    /// Parents are restored before children so links can be established
    /// without dirtying anything.
    pub fn load_all(&self) -> Result<usize> {
        let d = &self.drivers;
        let loaded = [
            self.restore_table(&self.stor_pool_dfns, d.stor_pool_definitions.as_ref(), |r| {
                self.restore_stor_pool_definition(r)
            })?,
            self.restore_table(&self.nodes, d.nodes.as_ref(), |r| self.restore_node(r))?,
            self.restore_table(&self.net_ifaces, d.net_interfaces.as_ref(), |r| {
                self.restore_net_interface(r)
            })?,
            self.restore_table(&self.rsc_dfns, d.resource_definitions.as_ref(), |r| {
                self.restore_resource_definition(r)
            })?,
            self.restore_table(&self.vlm_dfns, d.volume_definitions.as_ref(), |r| {
                self.restore_volume_definition(r)
            })?,
            self.restore_table(&self.stor_pools, d.stor_pools.as_ref(), |r| self.restore_stor_pool(r))?,
            self.restore_table(&self.resources, d.resources.as_ref(), |r| self.restore_resource(r))?,
            self.restore_table(&self.volumes, d.volumes.as_ref(), |r| self.restore_volume(r))?,
            self.restore_table(&self.node_conns, d.node_connections.as_ref(), |r| {
                self.restore_node_connection(r)
            })?,
            self.restore_table(&self.rsc_conns, d.resource_connections.as_ref(), |r| {
                self.restore_resource_connection(r)
            })?,
            self.restore_table(&self.vlm_conns, d.volume_connections.as_ref(), |r| {
                self.restore_volume_connection(r)
            })?,
        ]
        .iter()
        .sum();

        info!(loaded, "Object graph loaded from store");
        Ok(loaded)
    }

    /// Restore every stored row of one kind that is not cached yet
    fn restore_table<E: Entity>(
        &self,
        cache: &EntityCache<E>,
        driver: &dyn PersistenceDriver<E::Record>,
        restore: impl Fn(E::Record) -> Result<Arc<E>>,
    ) -> Result<usize> {
        let mut restored = 0;
        for record in driver.load_all()? {
            if cache.contains(&record.key()) {
                continue;
            }
            cache.insert_loaded(&self.stats, restore(record)?)?;
            restored += 1;
        }
        debug!(kind = E::KIND, restored, "Restored table");
        Ok(restored)
    }
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("mode", &self.mode)
            .field("nodes", &self.nodes.len())
            .field("net_interfaces", &self.net_ifaces.len())
            .field("resource_definitions", &self.rsc_dfns.len())
            .field("resources", &self.resources.len())
            .field("volume_definitions", &self.vlm_dfns.len())
            .field("volumes", &self.volumes.len())
            .field("stor_pools", &self.stor_pools.len())
            .finish_non_exhaustive()
    }
}

fn minor_pool(config: &CoreConfig) -> Result<Arc<dyn NumberPool>> {
    let range = config.minor_range.start..=config.minor_range.end;
    Ok(Arc::new(BitmapPool::new(range)?))
}

/// Error for a stored row whose parent cannot be found
pub(crate) fn dangling(
    kind: &'static str,
    key: impl std::fmt::Display,
    parent: &'static str,
    parent_key: impl std::fmt::Display,
) -> Error {
    Error::Persistence(format!(
        "stored {} {} references missing {} {}",
        kind, key, parent, parent_key
    ))
}
