//! Resources, the deployment of a resource definition on one node

use super::{
    entity_accessors, entity_debug, visible, Entity, EntityCore, FieldUpdates, LinkMap, Node,
    NodeName, ResourceConnection, ResourceDefinition, ResourceName, Volume, VolumeNumber,
};
use crate::error::Result;
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
    /// Resource flags
    ResourceFlag {
        Clean = 1 << 0 => "CLEAN",
        Delete = 1 << 1 => "DELETE",
        Diskless = 1 << 2 => "DISKLESS",
        DiskAddRequested = 1 << 3 => "DISK_ADD_REQUESTED",
        DiskAdding = 1 << 4 => "DISK_ADDING",
        DiskRemoveRequested = 1 << 5 => "DISK_REMOVE_REQUESTED",
        DiskRemoving = 1 << 6 => "DISK_REMOVING",
        TieBreaker = 1 << 7 => "TIE_BREAKER",
    }
}

/// Natural key of a resource
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceKey {
    pub node: NodeName,
    pub rsc: ResourceName,
}

impl ResourceKey {
    pub fn new(node: NodeName, rsc: ResourceName) -> Self {
        Self { node, rsc }
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.rsc)
    }
}

/// Stored row of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub uuid: Uuid,
    pub node_name: NodeName,
    pub resource_name: ResourceName,
    pub flags: u64,
}

impl Record for ResourceRecord {
    type Key = ResourceKey;
    const TABLE: &'static str = "RESOURCES";

    fn key(&self) -> ResourceKey {
        ResourceKey::new(self.node_name.clone(), self.resource_name.clone())
    }

    fn row_key(key: &ResourceKey) -> String {
        format!("{}/{}", key.node.value(), key.rsc.value())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceArgs {
    pub uuid: Option<Uuid>,
    pub flags: Vec<ResourceFlag>,
}

/// A resource definition deployed on a node
pub struct Resource {
    core: EntityCore<ResourceFlag>,
    key: ResourceKey,
    node: Arc<Node>,
    definition: Arc<ResourceDefinition>,
    volumes: LinkMap<VolumeNumber, Arc<Volume>>,
    connections: LinkMap<NodeName, Arc<ResourceConnection>>,
    driver: Arc<dyn PersistenceDriver<ResourceRecord>>,
}

impl Resource {
    entity_accessors!(ResourceFlag);

    fn assemble(
        core: EntityCore<ResourceFlag>,
        node: Arc<Node>,
        definition: Arc<ResourceDefinition>,
        driver: Arc<dyn PersistenceDriver<ResourceRecord>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: ResourceKey::new(node.name().clone(), definition.name().clone()),
            volumes: LinkMap::new(),
            connections: LinkMap::new(),
            core,
            node,
            definition,
            driver,
        })
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn definition(&self) -> &Arc<ResourceDefinition> {
        &self.definition
    }

    pub fn volume(&self, acc: &AccessContext, vlm_nr: VolumeNumber) -> Result<Option<Arc<Volume>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.volumes.get(&vlm_nr))
    }

    pub fn volumes(&self, acc: &AccessContext) -> Result<Vec<Arc<Volume>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.volumes.values())
    }

    /// Connection to the same resource on `peer`
    pub fn resource_connection(
        &self,
        acc: &AccessContext,
        peer: &NodeName,
    ) -> Result<Option<Arc<ResourceConnection>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.connections.get(peer))
    }

    pub fn resource_connections(&self, acc: &AccessContext) -> Result<Vec<Arc<ResourceConnection>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.connections.values())
    }

    pub(crate) fn require(&self, acc: &AccessContext, access: AccessType) -> Result<()> {
        self.core.require(acc, access)
    }

    pub(crate) fn link_volume(&self, vlm_nr: VolumeNumber, vlm: Arc<Volume>) -> Result<()> {
        self.core.link(&self.volumes, vlm_nr, vlm)
    }

    pub(crate) fn unlink_volume(&self, vlm_nr: VolumeNumber) {
        self.volumes.unlink(&vlm_nr);
    }

    pub(crate) fn link_connection(&self, peer: NodeName, conn: Arc<ResourceConnection>) -> Result<()> {
        self.core.link(&self.connections, peer, conn)
    }

    pub(crate) fn unlink_connection(&self, peer: &NodeName) {
        self.connections.unlink(peer);
    }

    fn reopen_links(&self) {
        self.volumes.unseal();
        self.connections.unseal();
    }

    fn props_instance(key: &ResourceKey) -> String {
        paths::instance(paths::RESOURCES, [key.node.value(), key.rsc.value()])
    }

    fn to_record(&self) -> ResourceRecord {
        ResourceRecord {
            uuid: self.core.uuid(),
            node_name: self.key.node.clone(),
            resource_name: self.key.rsc.clone(),
            flags: self.core.flag_bits(),
        }
    }
}

entity_debug!(Resource);

impl TransactionObject for Resource {
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

impl Entity for Resource {
    type Key = ResourceKey;
    type Record = ResourceRecord;
    const KIND: &'static str = "Resource";

    fn key(&self) -> ResourceKey {
        self.key.clone()
    }

    fn uuid(&self) -> Uuid {
        self.core.uuid()
    }

    fn protection(&self) -> &ObjectProtection {
        self.core.protection()
    }

    fn link_parents(self: &Arc<Self>) -> Result<()> {
        let on_node = self.node.link_resource(self.key.rsc.clone(), self.clone());
        let on_definition = self.definition.link_resource(self.key.node.clone(), self.clone());
        on_node.and(on_definition)
    }

    fn unlink_parents(&self) {
        self.node.unlink_resource(&self.key.rsc);
        self.definition.unlink_resource(&self.key.node);
    }
}

// =============================================================================
// Repository Operations
// =============================================================================

impl Repository {
    /// Create-or-load-or-cache the deployment of `definition` on `node`
    pub fn get_resource(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        node: &Arc<Node>,
        definition: &Arc<ResourceDefinition>,
        args: ResourceArgs,
        create_if_missing: bool,
        fail_if_existing: bool,
    ) -> Result<Option<Arc<Resource>>> {
        let key = ResourceKey::new(node.name().clone(), definition.name().clone());
        let found = self.resources.get_instance(
            &self.stats,
            ctx,
            self.drivers.resources.as_ref(),
            &key,
            create_if_missing,
            fail_if_existing,
            |record| self.restore_resource(record),
            || {
                node.require(acc, AccessType::Use)?;
                definition.require(acc, AccessType::Use)?;

                let core = EntityCore::create(
                    Resource::KIND,
                    key.to_string(),
                    args.uuid,
                    acc,
                    &args.flags,
                    Resource::props_instance(&key),
                    self.drivers.props.clone(),
                );
                Ok(Resource::assemble(
                    core,
                    node.clone(),
                    definition.clone(),
                    self.drivers.resources.clone(),
                ))
            },
        )?;
        visible(acc, found)
    }

    /// Cached or stored resource
    pub fn resource(&self, key: &ResourceKey) -> Result<Option<Arc<Resource>>> {
        self.resources
            .lookup(&self.stats, self.drivers.resources.as_ref(), key, |record| {
                self.restore_resource(record)
            })
    }

    pub fn resources(&self) -> Vec<Arc<Resource>> {
        self.resources.values()
    }

    /// Delete a resource together with its volumes and resource connections
    pub fn delete_resource(&self, acc: &AccessContext, ctx: &TransactionContext, rsc: &Arc<Resource>) -> Result<()> {
        rsc.core.require(acc, AccessType::Control)?;
        ctx.attach(rsc)?;

        for conn in rsc.connections.values() {
            self.delete_resource_connection(acc, ctx, &conn)?;
        }
        for vlm in rsc.volumes.values() {
            self.delete_volume(acc, ctx, &vlm)?;
        }
        rsc.core
            .seal(&rsc.connections, |n| format!("{} resource connections were added", n))?;
        rsc.core
            .seal(&rsc.volumes, |n| format!("{} volumes were added", n))?;

        rsc.core.mark_deleted(acc)?;
        self.resources.remove(&self.stats, ctx, rsc)
    }

    pub(crate) fn restore_resource(&self, record: ResourceRecord) -> Result<Arc<Resource>> {
        let key = record.key();
        let node = self
            .node(&record.node_name)?
            .ok_or_else(|| dangling(Resource::KIND, &key, Node::KIND, &record.node_name))?;
        let definition = self
            .resource_definition(&record.resource_name)?
            .ok_or_else(|| {
                dangling(Resource::KIND, &key, ResourceDefinition::KIND, &record.resource_name)
            })?;

        let core = EntityCore::restore(
            Resource::KIND,
            key.to_string(),
            record.uuid,
            record.flags,
            Resource::props_instance(&key),
            self.drivers.props.clone(),
        )?;
        Ok(Resource::assemble(core, node, definition, self.drivers.resources.clone()))
    }
}
