//! Resource definitions

use super::{
    entity_accessors, entity_debug, visible, Entity, EntityCore, FieldUpdates, LinkMap, NodeName,
    Resource, ResourceName, VolumeDefinition, VolumeNumber,
};
use crate::error::Result;
use crate::persistence::{PersistenceDriver, Record};
use crate::propscon::paths;
use crate::repository::Repository;
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::define_flags;
use crate::transaction::{TransactionContext, TransactionObject, Transition, TxAnchor};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

define_flags! {
    /// Resource definition flags
    ResourceDefinitionFlag {
        Delete = 1 << 0 => "DELETE",
        RestoreTarget = 1 << 1 => "RESTORE_TARGET",
        Cloning = 1 << 2 => "CLONING",
        Failed = 1 << 3 => "FAILED",
    }
}

/// Stored row of a resource definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinitionRecord {
    pub uuid: Uuid,
    pub name: ResourceName,
    pub flags: u64,
}

impl Record for ResourceDefinitionRecord {
    type Key = ResourceName;
    const TABLE: &'static str = "RESOURCE_DEFINITIONS";

    fn key(&self) -> ResourceName {
        self.name.clone()
    }

    fn row_key(key: &ResourceName) -> String {
        key.value().to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResourceDefinitionArgs {
    pub uuid: Option<Uuid>,
    pub flags: Vec<ResourceDefinitionFlag>,
}

/// Cluster-wide definition of a replicated resource
pub struct ResourceDefinition {
    core: EntityCore<ResourceDefinitionFlag>,
    name: ResourceName,
    resources: LinkMap<NodeName, Arc<Resource>>,
    volume_definitions: LinkMap<VolumeNumber, Arc<VolumeDefinition>>,
    driver: Arc<dyn PersistenceDriver<ResourceDefinitionRecord>>,
}

impl ResourceDefinition {
    entity_accessors!(ResourceDefinitionFlag);

    fn assemble(
        core: EntityCore<ResourceDefinitionFlag>,
        name: ResourceName,
        driver: Arc<dyn PersistenceDriver<ResourceDefinitionRecord>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            resources: LinkMap::new(),
            volume_definitions: LinkMap::new(),
            core,
            name,
            driver,
        })
    }

    pub fn name(&self) -> &ResourceName {
        &self.name
    }

    pub fn resource(&self, acc: &AccessContext, node: &NodeName) -> Result<Option<Arc<Resource>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.resources.get(node))
    }

    /// Deployed resources ordered by node name
    pub fn resources(&self, acc: &AccessContext) -> Result<Vec<Arc<Resource>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.resources.values())
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn volume_definition(
        &self,
        acc: &AccessContext,
        vlm_nr: VolumeNumber,
    ) -> Result<Option<Arc<VolumeDefinition>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.volume_definitions.get(&vlm_nr))
    }

    /// Volume definitions ordered by volume number
    pub fn volume_definitions(&self, acc: &AccessContext) -> Result<Vec<Arc<VolumeDefinition>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.volume_definitions.values())
    }

    pub(crate) fn require(&self, acc: &AccessContext, access: AccessType) -> Result<()> {
        self.core.require(acc, access)
    }

    pub(crate) fn link_resource(&self, node: NodeName, rsc: Arc<Resource>) -> Result<()> {
        self.core.link(&self.resources, node, rsc)
    }

    pub(crate) fn unlink_resource(&self, node: &NodeName) {
        self.resources.unlink(node);
    }

    pub(crate) fn link_volume_definition(
        &self,
        vlm_nr: VolumeNumber,
        vlm_dfn: Arc<VolumeDefinition>,
    ) -> Result<()> {
        self.core.link(&self.volume_definitions, vlm_nr, vlm_dfn)
    }

    pub(crate) fn unlink_volume_definition(&self, vlm_nr: VolumeNumber) {
        self.volume_definitions.unlink(&vlm_nr);
    }

    fn reopen_links(&self) {
        self.resources.unseal();
        self.volume_definitions.unseal();
    }

    fn props_instance(name: &ResourceName) -> String {
        paths::instance(paths::RESOURCE_DEFINITIONS, [name.value()])
    }

    fn to_record(&self) -> ResourceDefinitionRecord {
        ResourceDefinitionRecord {
            uuid: self.core.uuid(),
            name: self.name.clone(),
            flags: self.core.flag_bits(),
        }
    }
}

entity_debug!(ResourceDefinition);

impl TransactionObject for ResourceDefinition {
    fn anchor(&self) -> &TxAnchor {
        self.core.anchor()
    }

    fn describe(&self) -> String {
        self.core.describe()
    }

    fn flush(&self) -> Result<()> {
        self.core
            .flush_row(self.driver.as_ref(), &self.name, || self.to_record(), FieldUpdates::new())
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

impl Entity for ResourceDefinition {
    type Key = ResourceName;
    type Record = ResourceDefinitionRecord;
    const KIND: &'static str = "ResourceDefinition";

    fn key(&self) -> ResourceName {
        self.name.clone()
    }

    fn uuid(&self) -> Uuid {
        self.core.uuid()
    }

    fn protection(&self) -> &ObjectProtection {
        self.core.protection()
    }
}

// =============================================================================
// Repository Operations
// =============================================================================

impl Repository {
    /// Create-or-load-or-cache a resource definition
    pub fn get_resource_definition(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        name: &ResourceName,
        args: ResourceDefinitionArgs,
        create_if_missing: bool,
        fail_if_existing: bool,
    ) -> Result<Option<Arc<ResourceDefinition>>> {
        let found = self.rsc_dfns.get_instance(
            &self.stats,
            ctx,
            self.drivers.resource_definitions.as_ref(),
            name,
            create_if_missing,
            fail_if_existing,
            |record| self.restore_resource_definition(record),
            || {
                let core = EntityCore::create(
                    ResourceDefinition::KIND,
                    name.to_string(),
                    args.uuid,
                    acc,
                    &args.flags,
                    ResourceDefinition::props_instance(name),
                    self.drivers.props.clone(),
                );
                Ok(ResourceDefinition::assemble(
                    core,
                    name.clone(),
                    self.drivers.resource_definitions.clone(),
                ))
            },
        )?;
        visible(acc, found)
    }

    /// Cached or stored resource definition
    pub fn resource_definition(&self, name: &ResourceName) -> Result<Option<Arc<ResourceDefinition>>> {
        self.rsc_dfns.lookup(
            &self.stats,
            self.drivers.resource_definitions.as_ref(),
            name,
            |record| self.restore_resource_definition(record),
        )
    }

    pub fn resource_definitions(&self) -> Vec<Arc<ResourceDefinition>> {
        self.rsc_dfns.values()
    }

    /// Delete a resource definition and its volume definitions.
    ///
    /// Fails with [`crate::Error::InUse`] while the resource is deployed anywhere.
    pub fn delete_resource_definition(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        rsc_dfn: &Arc<ResourceDefinition>,
    ) -> Result<()> {
        rsc_dfn.core.require(acc, AccessType::Control)?;
        ctx.attach(rsc_dfn)?;
        rsc_dfn
            .core
            .seal(&rsc_dfn.resources, |n| format!("deployed on {} nodes", n))?;

        for vlm_dfn in rsc_dfn.volume_definitions.values() {
            self.delete_volume_definition(acc, ctx, &vlm_dfn)?;
        }
        rsc_dfn.core.seal(&rsc_dfn.volume_definitions, |n| {
            format!("{} volume definitions were added", n)
        })?;

        rsc_dfn.core.mark_deleted(acc)?;
        self.rsc_dfns.remove(&self.stats, ctx, rsc_dfn)
    }

    pub(crate) fn restore_resource_definition(
        &self,
        record: ResourceDefinitionRecord,
    ) -> Result<Arc<ResourceDefinition>> {
        let core = EntityCore::restore(
            ResourceDefinition::KIND,
            record.name.to_string(),
            record.uuid,
            record.flags,
            ResourceDefinition::props_instance(&record.name),
            self.drivers.props.clone(),
        )?;
        Ok(ResourceDefinition::assemble(
            core,
            record.name,
            self.drivers.resource_definitions.clone(),
        ))
    }
}
