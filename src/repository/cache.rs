//! Per-kind entity cache and the create-or-load decision table

use super::RepositoryStats;
use crate::error::{Error, Result};
use crate::objects::Entity;
use crate::persistence::PersistenceDriver;
use crate::transaction::{TransactionContext, TransactionObject, TxAnchor};
use dashmap::DashMap;
use parking_lot::{ArcMutexGuard, Mutex, RawMutex};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, info};

// =============================================================================
// Slots
// =============================================================================

/// State behind the per-key lock
struct SlotState<E> {
    entity: Option<Arc<E>>,
    /// Set when an empty slot is dropped from the map; holders must retry
    retired: bool,
}

type Slot<E> = Arc<Mutex<SlotState<E>>>;
type SlotGuard<E> = ArcMutexGuard<RawMutex, SlotState<E>>;

fn live<E: Entity>(entity: &Arc<E>) -> bool {
    entity.anchor().is_live()
}

// =============================================================================
// Entity Cache
// =============================================================================

/// Cache of one entity kind, keyed by natural key.
///
/// Every key owns a slot with its own lock. The map shard is locked only to
/// find or insert the slot; loading or creating a key holds the slot lock
/// alone, so racing lookups of one key observe a single instance while
/// other keys proceed.
///
/// A deleted entity keeps its slot until the deleting context commits.
/// Until then lookups report it as absent and never reload the stored row.
pub struct EntityCache<E: Entity> {
    map: Arc<DashMap<E::Key, Slot<E>>>,
}

impl<E: Entity> Clone for EntityCache<E> {
    fn clone(&self) -> Self {
        Self { map: self.map.clone() }
    }
}

impl<E: Entity> Default for EntityCache<E> {
    fn default() -> Self {
        Self {
            map: Arc::new(DashMap::new()),
        }
    }
}

impl<E: Entity> EntityCache<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached live instance of `key`, without touching the store
    pub fn get(&self, key: &E::Key) -> Option<Arc<E>> {
        let slot = self.map.get(key).map(|slot| slot.value().clone())?;
        let state = slot.lock();
        state.entity.clone().filter(live)
    }

    /// True if `key` has a slot holding an instance, live or pending delete
    pub fn contains(&self, key: &E::Key) -> bool {
        let slot = match self.map.get(key) {
            Some(slot) => slot.value().clone(),
            None => return false,
        };
        let present = slot.lock().entity.is_some();
        present
    }

    pub fn len(&self) -> usize {
        self.values().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All cached live instances ordered by natural key
    pub fn values(&self) -> Vec<Arc<E>> {
        let slots: Vec<Slot<E>> = self.map.iter().map(|entry| entry.value().clone()).collect();
        let mut values: Vec<Arc<E>> = slots
            .iter()
            .filter_map(|slot| slot.lock().entity.clone())
            .filter(live)
            .collect();
        values.sort_by_key(|entity| entity.key());
        values
    }

    /// Lock the slot of `key`, creating it if needed
    fn lock_slot(&self, key: &E::Key) -> SlotGuard<E> {
        loop {
            let slot = self
                .map
                .entry(key.clone())
                .or_insert_with(|| {
                    Arc::new(Mutex::new(SlotState {
                        entity: None,
                        retired: false,
                    }))
                })
                .value()
                .clone();
            let guard = slot.lock_arc();
            if !guard.retired {
                return guard;
            }
        }
    }

    /// Drop the slot of `key` if it is empty and nobody holds it
    fn discard_if_empty(&self, key: &E::Key) {
        self.map.remove_if(key, |_, slot| match slot.try_lock() {
            Some(mut state) if state.entity.is_none() => {
                state.retired = true;
                true
            }
            _ => false,
        });
    }

    /// Evaluate the repository decision table for `key`.
    ///
    /// | cached  | stored | create | fail  | result            |
    /// |---------|--------|--------|-------|-------------------|
    /// | live    |        |        | true  | `AlreadyExists`   |
    /// | live    |        |        | false | cached instance   |
    /// | deleted |        | true   |       | `AccessToDeleted` |
    /// | deleted |        | false  |       | `None`            |
    /// | no      | yes    | false  | false | load and cache    |
    /// | no      | yes    | true   |       | `AlreadyExists`   |
    /// | no      | no     | false  |       | `None`            |
    /// | no      | no     | true   | false | construct + cache |
    ///
    /// "deleted" is an instance whose delete is not committed yet.
    /// `fail_if_existing` without `create_if_missing` is a contract violation.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn get_instance<L, C>(
        &self,
        stats: &RepositoryStats,
        ctx: &TransactionContext,
        driver: &dyn PersistenceDriver<E::Record>,
        key: &E::Key,
        create_if_missing: bool,
        fail_if_existing: bool,
        load: L,
        construct: C,
    ) -> Result<Option<Arc<E>>>
    where
        L: FnOnce(E::Record) -> Result<Arc<E>>,
        C: FnOnce() -> Result<Arc<E>>,
    {
        if fail_if_existing && !create_if_missing {
            return Err(Error::implementation(format!(
                "{} {}: fail_if_existing requires create_if_missing",
                E::KIND,
                key
            )));
        }

        let mut slot = self.lock_slot(key);
        let result = match slot.entity.clone() {
            Some(cached) if !live(&cached) => {
                if create_if_missing {
                    Err(Error::AccessToDeleted {
                        kind: E::KIND,
                        key: key.to_string(),
                    })
                } else {
                    Ok(None)
                }
            }
            Some(cached) => {
                if fail_if_existing {
                    Err(already_exists::<E>(key))
                } else {
                    stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                    Ok(Some(cached))
                }
            }
            None if create_if_missing => {
                self.create_into(&mut slot, stats, ctx, driver, key, construct)
            }
            None => Self::load_into(&mut slot, stats, driver, key, load),
        };
        drop(slot);
        self.discard_if_empty(key);
        result
    }

    /// Cached instance of `key`, loading it from the store if needed
    pub(crate) fn lookup<L>(
        &self,
        stats: &RepositoryStats,
        driver: &dyn PersistenceDriver<E::Record>,
        key: &E::Key,
        load: L,
    ) -> Result<Option<Arc<E>>>
    where
        L: FnOnce(E::Record) -> Result<Arc<E>>,
    {
        let mut slot = self.lock_slot(key);
        let result = match slot.entity.clone() {
            Some(cached) if !live(&cached) => Ok(None),
            Some(cached) => {
                stats.cache_hits.fetch_add(1, Ordering::Relaxed);
                Ok(Some(cached))
            }
            None => Self::load_into(&mut slot, stats, driver, key, load),
        };
        drop(slot);
        self.discard_if_empty(key);
        result
    }

    fn create_into<C>(
        &self,
        slot: &mut SlotGuard<E>,
        stats: &RepositoryStats,
        ctx: &TransactionContext,
        driver: &dyn PersistenceDriver<E::Record>,
        key: &E::Key,
        construct: C,
    ) -> Result<Option<Arc<E>>>
    where
        C: FnOnce() -> Result<Arc<E>>,
    {
        if driver.exists(key)? {
            return Err(already_exists::<E>(key));
        }
        let entity = construct()?;
        let registered = entity.link_parents().and_then(|()| {
            ctx.attach(&entity)?;
            ctx.attach(&Arc::new(CacheRegistration::inserted(self.clone(), entity.clone())))
        });
        if let Err(e) = registered {
            entity.unlink_parents();
            // Releases what the new instance reserved, such as a minor number
            entity.rollback_pending();
            return Err(e);
        }
        slot.entity = Some(entity.clone());
        stats.creates.fetch_add(1, Ordering::Relaxed);
        info!(kind = E::KIND, key = %key, uuid = %entity.uuid(), ctx = ctx.id(), "Created entity");
        Ok(Some(entity))
    }

    fn load_into<L>(
        slot: &mut SlotGuard<E>,
        stats: &RepositoryStats,
        driver: &dyn PersistenceDriver<E::Record>,
        key: &E::Key,
        load: L,
    ) -> Result<Option<Arc<E>>>
    where
        L: FnOnce(E::Record) -> Result<Arc<E>>,
    {
        match driver.load(key)? {
            Some(record) => {
                let entity = load(record)?;
                if let Err(e) = entity.link_parents() {
                    entity.unlink_parents();
                    return Err(e);
                }
                slot.entity = Some(entity.clone());
                stats.loads.fetch_add(1, Ordering::Relaxed);
                debug!(kind = E::KIND, key = %key, "Loaded entity");
                Ok(Some(entity))
            }
            None => Ok(None),
        }
    }

    /// Cache an entity restored during startup, keeping an existing instance
    pub(crate) fn insert_loaded(&self, stats: &RepositoryStats, entity: Arc<E>) -> Result<Arc<E>> {
        let mut slot = self.lock_slot(&entity.key());
        match &slot.entity {
            Some(cached) => Ok(cached.clone()),
            None => {
                if let Err(e) = entity.link_parents() {
                    entity.unlink_parents();
                    return Err(e);
                }
                slot.entity = Some(entity.clone());
                stats.loads.fetch_add(1, Ordering::Relaxed);
                Ok(entity)
            }
        }
    }

    /// Unlink a deleted entity from its parents and schedule its eviction.
    ///
    /// The instance stays cached, reported as absent, until the context
    /// commits. Rollback links it back in.
    pub(crate) fn remove(&self, stats: &RepositoryStats, ctx: &TransactionContext, entity: &Arc<E>) -> Result<()> {
        ctx.attach(&Arc::new(CacheRegistration::removed(self.clone(), entity.clone())))?;
        entity.unlink_parents();
        stats.deletes.fetch_add(1, Ordering::Relaxed);
        info!(kind = E::KIND, key = %entity.key(), ctx = ctx.id(), "Deleted entity");
        Ok(())
    }

    /// Empty the slot of `entity` if it still holds that instance
    fn evict(&self, entity: &Arc<E>) {
        let key = entity.key();
        {
            let mut slot = self.lock_slot(&key);
            if slot
                .entity
                .as_ref()
                .map_or(false, |cached| Arc::ptr_eq(cached, entity))
            {
                slot.entity = None;
            }
        }
        self.discard_if_empty(&key);
    }
}

fn already_exists<E: Entity>(key: &E::Key) -> Error {
    Error::AlreadyExists {
        kind: E::KIND,
        key: key.to_string(),
    }
}

// =============================================================================
// Cache Registration
// =============================================================================

enum CacheChange<E> {
    Inserted(Arc<E>),
    Removed(Arc<E>),
}

/// Cache and link change of one entity, settled by the context that made it.
///
/// Parents' relationship maps are not transactional; this record undoes the
/// entity's own links on rollback so that parents stay clean.
struct CacheRegistration<E: Entity> {
    anchor: Arc<TxAnchor>,
    cache: EntityCache<E>,
    change: CacheChange<E>,
}

impl<E: Entity> CacheRegistration<E> {
    fn inserted(cache: EntityCache<E>, entity: Arc<E>) -> Self {
        Self {
            anchor: TxAnchor::loaded(),
            cache,
            change: CacheChange::Inserted(entity),
        }
    }

    fn removed(cache: EntityCache<E>, entity: Arc<E>) -> Self {
        Self {
            anchor: TxAnchor::loaded(),
            cache,
            change: CacheChange::Removed(entity),
        }
    }
}

impl<E: Entity> TransactionObject for CacheRegistration<E> {
    fn anchor(&self) -> &TxAnchor {
        &self.anchor
    }

    fn describe(&self) -> String {
        match &self.change {
            CacheChange::Inserted(entity) => format!("cache insert of {} {}", E::KIND, entity.key()),
            CacheChange::Removed(entity) => format!("cache removal of {} {}", E::KIND, entity.key()),
        }
    }

    fn commit_pending(&self) {
        if let CacheChange::Removed(entity) = &self.change {
            self.cache.evict(entity);
            debug!(kind = E::KIND, key = %entity.key(), "Evicted deleted entity");
        }
    }

    fn rollback_pending(&self) {
        match &self.change {
            CacheChange::Inserted(entity) => {
                entity.unlink_parents();
                self.cache.evict(entity);
                debug!(kind = E::KIND, key = %entity.key(), "Rolled back cache insert");
            }
            CacheChange::Removed(entity) => {
                // A parent deleted by the same context is still sealed here;
                // the link is made anyway and its own rollback reopens it.
                let _ = entity.link_parents();
                debug!(kind = E::KIND, key = %entity.key(), "Rolled back cache removal");
            }
        }
    }
}
