//! Volumes, the deployment of a volume definition on one node

use super::{
    entity_accessors, entity_debug, visible, Entity, EntityCore, FieldUpdates, LinkMap, NodeName,
    Resource, ResourceKey, ResourceName, StorPool, StorPoolKey, StorPoolName, VolumeConnection,
    VolumeDefinition, VolumeDefinitionKey, VolumeNumber,
};
use crate::error::{Error, Result};
use crate::persistence::{PersistenceDriver, Record};
use crate::propscon::paths;
use crate::repository::{dangling, Repository};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::define_flags;
use crate::transaction::{TransactionContext, TransactionObject, Transition, TxAnchor, TxCell};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

define_flags! {
    /// Volume flags
    VolumeFlag {
        Clean = 1 << 0 => "CLEAN",
        Delete = 1 << 1 => "DELETE",
        Resize = 1 << 2 => "RESIZE",
        DrbdResize = 1 << 3 => "DRBD_RESIZE",
    }
}

/// Natural key of a volume
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeKey {
    pub node: NodeName,
    pub rsc: ResourceName,
    pub vlm_nr: VolumeNumber,
}

impl VolumeKey {
    pub fn new(node: NodeName, rsc: ResourceName, vlm_nr: VolumeNumber) -> Self {
        Self { node, rsc, vlm_nr }
    }

    pub fn resource_key(&self) -> ResourceKey {
        ResourceKey::new(self.node.clone(), self.rsc.clone())
    }

    pub fn volume_definition_key(&self) -> VolumeDefinitionKey {
        VolumeDefinitionKey::new(self.rsc.clone(), self.vlm_nr)
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.node, self.rsc, self.vlm_nr)
    }
}

/// Stored row of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeRecord {
    pub uuid: Uuid,
    pub node_name: NodeName,
    pub resource_name: ResourceName,
    pub vlm_nr: VolumeNumber,
    pub stor_pool_name: StorPoolName,
    pub block_device_path: Option<String>,
    pub meta_disk_path: Option<String>,
    pub flags: u64,
}

impl Record for VolumeRecord {
    type Key = VolumeKey;
    const TABLE: &'static str = "VOLUMES";

    fn key(&self) -> VolumeKey {
        VolumeKey::new(self.node_name.clone(), self.resource_name.clone(), self.vlm_nr)
    }

    fn row_key(key: &VolumeKey) -> String {
        format!("{}/{}/{}", key.node.value(), key.rsc.value(), key.vlm_nr)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VolumeArgs {
    pub uuid: Option<Uuid>,
    pub block_device_path: Option<String>,
    pub meta_disk_path: Option<String>,
    pub flags: Vec<VolumeFlag>,
}

/// A volume definition deployed on a node, backed by one storage pool
pub struct Volume {
    core: EntityCore<VolumeFlag>,
    key: VolumeKey,
    resource: Arc<Resource>,
    definition: Arc<VolumeDefinition>,
    stor_pool: Arc<StorPool>,
    block_device_path: TxCell<Option<String>>,
    meta_disk_path: TxCell<Option<String>>,
    connections: LinkMap<NodeName, Arc<VolumeConnection>>,
    driver: Arc<dyn PersistenceDriver<VolumeRecord>>,
}

impl Volume {
    entity_accessors!(VolumeFlag);

    fn assemble(
        core: EntityCore<VolumeFlag>,
        resource: Arc<Resource>,
        definition: Arc<VolumeDefinition>,
        stor_pool: Arc<StorPool>,
        block_device_path: Option<String>,
        meta_disk_path: Option<String>,
        driver: Arc<dyn PersistenceDriver<VolumeRecord>>,
    ) -> Arc<Self> {
        let anchor = core.shared_anchor();
        let rsc_key = resource.key().clone();
        Arc::new(Self {
            key: VolumeKey::new(rsc_key.node, rsc_key.rsc, definition.volume_number()),
            block_device_path: TxCell::new(anchor.clone(), block_device_path),
            meta_disk_path: TxCell::new(anchor.clone(), meta_disk_path),
            connections: LinkMap::new(),
            core,
            resource,
            definition,
            stor_pool,
            driver,
        })
    }

    pub fn key(&self) -> &VolumeKey {
        &self.key
    }

    pub fn volume_number(&self) -> VolumeNumber {
        self.key.vlm_nr
    }

    pub fn resource(&self) -> &Arc<Resource> {
        &self.resource
    }

    pub fn volume_definition(&self) -> &Arc<VolumeDefinition> {
        &self.definition
    }

    pub fn stor_pool(&self) -> &Arc<StorPool> {
        &self.stor_pool
    }

    pub fn block_device_path(&self, acc: &AccessContext) -> Result<Option<String>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.block_device_path.get())
    }

    pub fn set_block_device_path(&self, acc: &AccessContext, path: Option<String>) -> Result<Option<String>> {
        self.core.require(acc, AccessType::Change)?;
        Ok(self.block_device_path.set(path))
    }

    pub fn meta_disk_path(&self, acc: &AccessContext) -> Result<Option<String>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.meta_disk_path.get())
    }

    pub fn set_meta_disk_path(&self, acc: &AccessContext, path: Option<String>) -> Result<Option<String>> {
        self.core.require(acc, AccessType::Change)?;
        Ok(self.meta_disk_path.set(path))
    }

    /// Connection to the same volume on `peer`
    pub fn volume_connection(&self, acc: &AccessContext, peer: &NodeName) -> Result<Option<Arc<VolumeConnection>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.connections.get(peer))
    }

    pub fn volume_connections(&self, acc: &AccessContext) -> Result<Vec<Arc<VolumeConnection>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.connections.values())
    }

    pub(crate) fn require(&self, acc: &AccessContext, access: AccessType) -> Result<()> {
        self.core.require(acc, access)
    }

    pub(crate) fn link_connection(&self, peer: NodeName, conn: Arc<VolumeConnection>) -> Result<()> {
        self.core.link(&self.connections, peer, conn)
    }

    pub(crate) fn unlink_connection(&self, peer: &NodeName) {
        self.connections.unlink(peer);
    }

    fn reopen_links(&self) {
        self.connections.unseal();
    }

    fn props_instance(key: &VolumeKey) -> String {
        paths::instance(
            paths::VOLUMES,
            [
                key.node.value().to_string(),
                key.rsc.value().to_string(),
                key.vlm_nr.to_string(),
            ],
        )
    }

    fn to_record(&self) -> VolumeRecord {
        VolumeRecord {
            uuid: self.core.uuid(),
            node_name: self.key.node.clone(),
            resource_name: self.key.rsc.clone(),
            vlm_nr: self.key.vlm_nr,
            stor_pool_name: self.stor_pool.name().clone(),
            block_device_path: self.block_device_path.get(),
            meta_disk_path: self.meta_disk_path.get(),
            flags: self.core.flag_bits(),
        }
    }
}

entity_debug!(Volume);

impl TransactionObject for Volume {
    fn anchor(&self) -> &TxAnchor {
        self.core.anchor()
    }

    fn describe(&self) -> String {
        self.core.describe()
    }

    fn flush(&self) -> Result<()> {
        let fields = FieldUpdates::new()
            .track("block_device_path", &self.block_device_path)?
            .track("meta_disk_path", &self.meta_disk_path)?;
        self.core
            .flush_row(self.driver.as_ref(), &self.key, || self.to_record(), fields)
    }

    fn commit_pending(&self) {
        if self.anchor().transition() != Transition::Delete {
            self.reopen_links();
        }
        self.core.commit_components();
        self.block_device_path.commit();
        self.meta_disk_path.commit();
    }

    fn rollback_pending(&self) {
        self.reopen_links();
        self.core.rollback_components();
        self.block_device_path.rollback();
        self.meta_disk_path.rollback();
    }
}

impl Entity for Volume {
    type Key = VolumeKey;
    type Record = VolumeRecord;
    const KIND: &'static str = "Volume";

    fn key(&self) -> VolumeKey {
        self.key.clone()
    }

    fn uuid(&self) -> Uuid {
        self.core.uuid()
    }

    fn protection(&self) -> &ObjectProtection {
        self.core.protection()
    }

    fn link_parents(self: &Arc<Self>) -> Result<()> {
        let on_resource = self.resource.link_volume(self.key.vlm_nr, self.clone());
        let on_definition = self.definition.link_volume(self.key.node.clone(), self.clone());
        let on_pool = self
            .stor_pool
            .link_volume((self.key.rsc.clone(), self.key.vlm_nr), self.clone());
        on_resource.and(on_definition).and(on_pool)
    }

    fn unlink_parents(&self) {
        self.resource.unlink_volume(self.key.vlm_nr);
        self.definition.unlink_volume(&self.key.node);
        self.stor_pool.unlink_volume(&(self.key.rsc.clone(), self.key.vlm_nr));
    }
}

/// Reject parent combinations that do not describe one volume
fn check_parents(resource: &Resource, definition: &VolumeDefinition, stor_pool: &StorPool) -> Result<()> {
    if resource.definition().name() != &definition.key().rsc {
        return Err(Error::InvalidValue(format!(
            "volume definition {} does not belong to resource {}",
            definition.key(),
            resource.key()
        )));
    }
    if stor_pool.node().name() != &resource.key().node {
        return Err(Error::InvalidValue(format!(
            "storage pool {} is not on the node of resource {}",
            stor_pool.key(),
            resource.key()
        )));
    }
    Ok(())
}

// =============================================================================
// Repository Operations
// =============================================================================

impl Repository {
    /// Create-or-load-or-cache the volume of `definition` within `resource`,
    /// placed on `stor_pool`
    #[allow(clippy::too_many_arguments)]
    pub fn get_volume(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        resource: &Arc<Resource>,
        definition: &Arc<VolumeDefinition>,
        stor_pool: &Arc<StorPool>,
        args: VolumeArgs,
        create_if_missing: bool,
        fail_if_existing: bool,
    ) -> Result<Option<Arc<Volume>>> {
        check_parents(resource, definition, stor_pool)?;
        let key = VolumeKey::new(
            resource.key().node.clone(),
            resource.key().rsc.clone(),
            definition.volume_number(),
        );
        let found = self.volumes.get_instance(
            &self.stats,
            ctx,
            self.drivers.volumes.as_ref(),
            &key,
            create_if_missing,
            fail_if_existing,
            |record| self.restore_volume(record),
            || {
                resource.require(acc, AccessType::Use)?;
                definition.require(acc, AccessType::Use)?;
                stor_pool.require(acc, AccessType::Use)?;

                let core = EntityCore::create(
                    Volume::KIND,
                    key.to_string(),
                    args.uuid,
                    acc,
                    &args.flags,
                    Volume::props_instance(&key),
                    self.drivers.props.clone(),
                );
                Ok(Volume::assemble(
                    core,
                    resource.clone(),
                    definition.clone(),
                    stor_pool.clone(),
                    args.block_device_path,
                    args.meta_disk_path,
                    self.drivers.volumes.clone(),
                ))
            },
        )?;
        visible(acc, found)
    }

    /// Cached or stored volume
    pub fn volume(&self, key: &VolumeKey) -> Result<Option<Arc<Volume>>> {
        self.volumes
            .lookup(&self.stats, self.drivers.volumes.as_ref(), key, |record| {
                self.restore_volume(record)
            })
    }

    pub fn volumes(&self) -> Vec<Arc<Volume>> {
        self.volumes.values()
    }

    /// Delete a volume and its volume connections
    pub fn delete_volume(&self, acc: &AccessContext, ctx: &TransactionContext, vlm: &Arc<Volume>) -> Result<()> {
        vlm.core.require(acc, AccessType::Control)?;
        ctx.attach(vlm)?;

        for conn in vlm.connections.values() {
            self.delete_volume_connection(acc, ctx, &conn)?;
        }
        vlm.core
            .seal(&vlm.connections, |n| format!("{} volume connections were added", n))?;

        vlm.core.mark_deleted(acc)?;
        self.volumes.remove(&self.stats, ctx, vlm)
    }

    pub(crate) fn restore_volume(&self, record: VolumeRecord) -> Result<Arc<Volume>> {
        let key = record.key();
        let rsc_key = key.resource_key();
        let resource = self
            .resource(&rsc_key)?
            .ok_or_else(|| dangling(Volume::KIND, &key, Resource::KIND, &rsc_key))?;
        let vlm_dfn_key = key.volume_definition_key();
        let definition = self
            .volume_definition(&vlm_dfn_key)?
            .ok_or_else(|| dangling(Volume::KIND, &key, VolumeDefinition::KIND, &vlm_dfn_key))?;
        let pool_key = StorPoolKey::new(record.node_name.clone(), record.stor_pool_name.clone());
        let stor_pool = self
            .stor_pool(&pool_key)?
            .ok_or_else(|| dangling(Volume::KIND, &key, StorPool::KIND, &pool_key))?;

        let core = EntityCore::restore(
            Volume::KIND,
            key.to_string(),
            record.uuid,
            record.flags,
            Volume::props_instance(&key),
            self.drivers.props.clone(),
        )?;
        Ok(Volume::assemble(
            core,
            resource,
            definition,
            stor_pool,
            record.block_device_path,
            record.meta_disk_path,
            self.drivers.volumes.clone(),
        ))
    }
}
