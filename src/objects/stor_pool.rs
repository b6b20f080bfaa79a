//! Storage pools, one per node and storage pool definition

use super::{
    entity_accessors, entity_debug, visible, Entity, EntityCore, FieldUpdates, LinkMap, Node,
    NodeName, ResourceName, StorPoolDefinition, StorPoolName, Volume, VolumeNumber,
};
use crate::error::{Error, Result};
use crate::persistence::{PersistenceDriver, Record};
use crate::propscon::paths;
use crate::repository::{dangling, Repository};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::define_flags;
use crate::transaction::{TransactionContext, TransactionObject, Transition, TxAnchor};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

define_flags! {
    /// Storage pool flags
    StorPoolFlag {
        Delete = 1 << 0 => "DELETE",
    }
}

/// Storage backend behind a pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProviderKind {
    #[default]
    Diskless,
    Lvm,
    LvmThin,
    Zfs,
    ZfsThin,
    File,
    FileThin,
}

impl ProviderKind {
    pub fn has_disk(self) -> bool {
        self != ProviderKind::Diskless
    }

    pub fn is_thin(self) -> bool {
        matches!(
            self,
            ProviderKind::LvmThin | ProviderKind::ZfsThin | ProviderKind::FileThin
        )
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProviderKind::Diskless => "DISKLESS",
            ProviderKind::Lvm => "LVM",
            ProviderKind::LvmThin => "LVM_THIN",
            ProviderKind::Zfs => "ZFS",
            ProviderKind::ZfsThin => "ZFS_THIN",
            ProviderKind::File => "FILE",
            ProviderKind::FileThin => "FILE_THIN",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ProviderKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "DISKLESS" => Ok(ProviderKind::Diskless),
            "LVM" => Ok(ProviderKind::Lvm),
            "LVM_THIN" => Ok(ProviderKind::LvmThin),
            "ZFS" => Ok(ProviderKind::Zfs),
            "ZFS_THIN" => Ok(ProviderKind::ZfsThin),
            "FILE" => Ok(ProviderKind::File),
            "FILE_THIN" => Ok(ProviderKind::FileThin),
            _ => Err(Error::InvalidValue(format!("unknown provider kind '{}'", s))),
        }
    }
}

/// Natural key of a storage pool
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorPoolKey {
    pub node: NodeName,
    pub pool: StorPoolName,
}

impl StorPoolKey {
    pub fn new(node: NodeName, pool: StorPoolName) -> Self {
        Self { node, pool }
    }
}

impl fmt::Display for StorPoolKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.pool)
    }
}

/// Stored row of a storage pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorPoolRecord {
    pub uuid: Uuid,
    pub node_name: NodeName,
    pub pool_name: StorPoolName,
    pub provider: ProviderKind,
    pub flags: u64,
}

impl Record for StorPoolRecord {
    type Key = StorPoolKey;
    const TABLE: &'static str = "NODE_STOR_POOL";

    fn key(&self) -> StorPoolKey {
        StorPoolKey::new(self.node_name.clone(), self.pool_name.clone())
    }

    fn row_key(key: &StorPoolKey) -> String {
        format!("{}/{}", key.node.value(), key.pool.value())
    }
}

#[derive(Debug, Clone, Default)]
pub struct StorPoolArgs {
    pub uuid: Option<Uuid>,
    pub provider: ProviderKind,
    pub flags: Vec<StorPoolFlag>,
}

/// A storage pool definition instantiated on one node
pub struct StorPool {
    core: EntityCore<StorPoolFlag>,
    key: StorPoolKey,
    provider: ProviderKind,
    node: Arc<Node>,
    definition: Arc<StorPoolDefinition>,
    volumes: LinkMap<(ResourceName, VolumeNumber), Arc<Volume>>,
    driver: Arc<dyn PersistenceDriver<StorPoolRecord>>,
}

impl StorPool {
    entity_accessors!(StorPoolFlag);

    fn assemble(
        core: EntityCore<StorPoolFlag>,
        provider: ProviderKind,
        node: Arc<Node>,
        definition: Arc<StorPoolDefinition>,
        driver: Arc<dyn PersistenceDriver<StorPoolRecord>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: StorPoolKey::new(node.name().clone(), definition.name().clone()),
            volumes: LinkMap::new(),
            core,
            provider,
            node,
            definition,
            driver,
        })
    }

    pub fn key(&self) -> &StorPoolKey {
        &self.key
    }

    pub fn name(&self) -> &StorPoolName {
        &self.key.pool
    }

    pub fn provider(&self) -> ProviderKind {
        self.provider
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn definition(&self) -> &Arc<StorPoolDefinition> {
        &self.definition
    }

    /// Volumes placed on this pool, ordered by resource and volume number
    pub fn volumes(&self, acc: &AccessContext) -> Result<Vec<Arc<Volume>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.volumes.values())
    }

    pub fn volume_count(&self) -> usize {
        self.volumes.len()
    }

    pub(crate) fn require(&self, acc: &AccessContext, access: AccessType) -> Result<()> {
        self.core.require(acc, access)
    }

    pub(crate) fn link_volume(&self, key: (ResourceName, VolumeNumber), vlm: Arc<Volume>) -> Result<()> {
        self.core.link(&self.volumes, key, vlm)
    }

    pub(crate) fn unlink_volume(&self, key: &(ResourceName, VolumeNumber)) {
        self.volumes.unlink(key);
    }

    fn reopen_links(&self) {
        self.volumes.unseal();
    }

    fn props_instance(key: &StorPoolKey) -> String {
        paths::instance(paths::STOR_POOLS, [key.node.value(), key.pool.value()])
    }

    fn to_record(&self) -> StorPoolRecord {
        StorPoolRecord {
            uuid: self.core.uuid(),
            node_name: self.key.node.clone(),
            pool_name: self.key.pool.clone(),
            provider: self.provider,
            flags: self.core.flag_bits(),
        }
    }
}

entity_debug!(StorPool);

impl TransactionObject for StorPool {
    fn anchor(&self) -> &TxAnchor {
        self.core.anchor()
    }

    fn describe(&self) -> String {
        self.core.describe()
    }

    fn flush(&self) -> Result<()> {
        self.core
            .flush_row(self.driver.as_ref(), &self.key, || self.to_record(), FieldUpdates::new())
    }

    fn commit_pending(&self) {
        if self.anchor().transition() != Transition::Delete {
            self.reopen_links();
        }
        self.core.commit_components();
    }

    fn rollback_pending(&self) {
        self.reopen_links();
        self.core.rollback_components();
    }
}

impl Entity for StorPool {
    type Key = StorPoolKey;
    type Record = StorPoolRecord;
    const KIND: &'static str = "StorPool";

    fn key(&self) -> StorPoolKey {
        self.key.clone()
    }

    fn uuid(&self) -> Uuid {
        self.core.uuid()
    }

    fn protection(&self) -> &ObjectProtection {
        self.core.protection()
    }

    fn link_parents(self: &Arc<Self>) -> Result<()> {
        let on_node = self.node.link_stor_pool(self.key.pool.clone(), self.clone());
        let on_definition = self.definition.link_stor_pool(self.key.node.clone(), self.clone());
        on_node.and(on_definition)
    }

    fn unlink_parents(&self) {
        self.node.unlink_stor_pool(&self.key.pool);
        self.definition.unlink_stor_pool(&self.key.node);
    }
}

// =============================================================================
// Repository Operations
// =============================================================================

impl Repository {
    /// Create-or-load-or-cache the pool of `definition` on `node`
    pub fn get_stor_pool(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        node: &Arc<Node>,
        definition: &Arc<StorPoolDefinition>,
        args: StorPoolArgs,
        create_if_missing: bool,
        fail_if_existing: bool,
    ) -> Result<Option<Arc<StorPool>>> {
        let key = StorPoolKey::new(node.name().clone(), definition.name().clone());
        let found = self.stor_pools.get_instance(
            &self.stats,
            ctx,
            self.drivers.stor_pools.as_ref(),
            &key,
            create_if_missing,
            fail_if_existing,
            |record| self.restore_stor_pool(record),
            || {
                node.require(acc, AccessType::Use)?;
                definition.require(acc, AccessType::Use)?;

                let core = EntityCore::create(
                    StorPool::KIND,
                    key.to_string(),
                    args.uuid,
                    acc,
                    &args.flags,
                    StorPool::props_instance(&key),
                    self.drivers.props.clone(),
                );
                Ok(StorPool::assemble(
                    core,
                    args.provider,
                    node.clone(),
                    definition.clone(),
                    self.drivers.stor_pools.clone(),
                ))
            },
        )?;
        visible(acc, found)
    }

    /// Cached or stored storage pool
    pub fn stor_pool(&self, key: &StorPoolKey) -> Result<Option<Arc<StorPool>>> {
        self.stor_pools
            .lookup(&self.stats, self.drivers.stor_pools.as_ref(), key, |record| {
                self.restore_stor_pool(record)
            })
    }

    pub fn stor_pools(&self) -> Vec<Arc<StorPool>> {
        self.stor_pools.values()
    }

    /// Delete a storage pool that holds no volumes
    pub fn delete_stor_pool(&self, acc: &AccessContext, ctx: &TransactionContext, pool: &Arc<StorPool>) -> Result<()> {
        pool.core.require(acc, AccessType::Control)?;
        ctx.attach(pool)?;
        pool.core
            .seal(&pool.volumes, |n| format!("{} volumes are placed on it", n))?;

        pool.core.mark_deleted(acc)?;
        self.stor_pools.remove(&self.stats, ctx, pool)
    }

    pub(crate) fn restore_stor_pool(&self, record: StorPoolRecord) -> Result<Arc<StorPool>> {
        let key = record.key();
        let node = self
            .node(&record.node_name)?
            .ok_or_else(|| dangling(StorPool::KIND, &key, Node::KIND, &record.node_name))?;
        let definition = self
            .stor_pool_definition(&record.pool_name)?
            .ok_or_else(|| {
                dangling(StorPool::KIND, &key, StorPoolDefinition::KIND, &record.pool_name)
            })?;

        let core = EntityCore::restore(
            StorPool::KIND,
            key.to_string(),
            record.uuid,
            record.flags,
            StorPool::props_instance(&key),
            self.drivers.props.clone(),
        )?;
        Ok(StorPool::assemble(
            core,
            record.provider,
            node,
            definition,
            self.drivers.stor_pools.clone(),
        ))
    }
}
