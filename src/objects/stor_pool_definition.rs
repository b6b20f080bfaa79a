//! Storage pool definitions

use super::{
    entity_accessors, entity_debug, visible, Entity, EntityCore, FieldUpdates, LinkMap, NodeName,
    StorPool, StorPoolName,
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
    /// Storage pool definition flags
    StorPoolDefinitionFlag {
        Delete = 1 << 0 => "DELETE",
    }
}

/// Stored row of a storage pool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorPoolDefinitionRecord {
    pub uuid: Uuid,
    pub name: StorPoolName,
    pub flags: u64,
}

impl Record for StorPoolDefinitionRecord {
    type Key = StorPoolName;
    const TABLE: &'static str = "STOR_POOL_DEFINITIONS";

    fn key(&self) -> StorPoolName {
        self.name.clone()
    }

    fn row_key(key: &StorPoolName) -> String {
        key.value().to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct StorPoolDefinitionArgs {
    pub uuid: Option<Uuid>,
    pub flags: Vec<StorPoolDefinitionFlag>,
}

/// Cluster-wide name of a storage pool, instantiated per node as [`StorPool`]
pub struct StorPoolDefinition {
    core: EntityCore<StorPoolDefinitionFlag>,
    name: StorPoolName,
    stor_pools: LinkMap<NodeName, Arc<StorPool>>,
    driver: Arc<dyn PersistenceDriver<StorPoolDefinitionRecord>>,
}

impl StorPoolDefinition {
    entity_accessors!(StorPoolDefinitionFlag);

    fn assemble(
        core: EntityCore<StorPoolDefinitionFlag>,
        name: StorPoolName,
        driver: Arc<dyn PersistenceDriver<StorPoolDefinitionRecord>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            stor_pools: LinkMap::new(),
            core,
            name,
            driver,
        })
    }

    pub fn name(&self) -> &StorPoolName {
        &self.name
    }

    pub fn stor_pool(&self, acc: &AccessContext, node: &NodeName) -> Result<Option<Arc<StorPool>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.stor_pools.get(node))
    }

    /// Pools of this definition, ordered by node name
    pub fn stor_pools(&self, acc: &AccessContext) -> Result<Vec<Arc<StorPool>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.stor_pools.values())
    }

    pub(crate) fn require(&self, acc: &AccessContext, access: AccessType) -> Result<()> {
        self.core.require(acc, access)
    }

    pub(crate) fn link_stor_pool(&self, node: NodeName, pool: Arc<StorPool>) -> Result<()> {
        self.core.link(&self.stor_pools, node, pool)
    }

    pub(crate) fn unlink_stor_pool(&self, node: &NodeName) {
        self.stor_pools.unlink(node);
    }

    fn reopen_links(&self) {
        self.stor_pools.unseal();
    }

    fn props_instance(name: &StorPoolName) -> String {
        paths::instance(paths::STOR_POOL_DEFINITIONS, [name.value()])
    }

    fn to_record(&self) -> StorPoolDefinitionRecord {
        StorPoolDefinitionRecord {
            uuid: self.core.uuid(),
            name: self.name.clone(),
            flags: self.core.flag_bits(),
        }
    }
}

entity_debug!(StorPoolDefinition);

impl TransactionObject for StorPoolDefinition {
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

impl Entity for StorPoolDefinition {
    type Key = StorPoolName;
    type Record = StorPoolDefinitionRecord;
    const KIND: &'static str = "StorPoolDefinition";

    fn key(&self) -> StorPoolName {
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
    /// Create-or-load-or-cache a storage pool definition
    pub fn get_stor_pool_definition(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        name: &StorPoolName,
        args: StorPoolDefinitionArgs,
        create_if_missing: bool,
        fail_if_existing: bool,
    ) -> Result<Option<Arc<StorPoolDefinition>>> {
        let found = self.stor_pool_dfns.get_instance(
            &self.stats,
            ctx,
            self.drivers.stor_pool_definitions.as_ref(),
            name,
            create_if_missing,
            fail_if_existing,
            |record| self.restore_stor_pool_definition(record),
            || {
                let core = EntityCore::create(
                    StorPoolDefinition::KIND,
                    name.to_string(),
                    args.uuid,
                    acc,
                    &args.flags,
                    StorPoolDefinition::props_instance(name),
                    self.drivers.props.clone(),
                );
                Ok(StorPoolDefinition::assemble(
                    core,
                    name.clone(),
                    self.drivers.stor_pool_definitions.clone(),
                ))
            },
        )?;
        visible(acc, found)
    }

    /// Cached or stored storage pool definition
    pub fn stor_pool_definition(&self, name: &StorPoolName) -> Result<Option<Arc<StorPoolDefinition>>> {
        self.stor_pool_dfns.lookup(
            &self.stats,
            self.drivers.stor_pool_definitions.as_ref(),
            name,
            |record| self.restore_stor_pool_definition(record),
        )
    }

    pub fn stor_pool_definitions(&self) -> Vec<Arc<StorPoolDefinition>> {
        self.stor_pool_dfns.values()
    }

    /// Delete a storage pool definition that no node uses anymore
    pub fn delete_stor_pool_definition(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        spd: &Arc<StorPoolDefinition>,
    ) -> Result<()> {
        spd.core.require(acc, AccessType::Control)?;
        ctx.attach(spd)?;
        spd.core
            .seal(&spd.stor_pools, |n| format!("{} storage pools reference it", n))?;
        spd.core.mark_deleted(acc)?;
        self.stor_pool_dfns.remove(&self.stats, ctx, spd)
    }

    pub(crate) fn restore_stor_pool_definition(
        &self,
        record: StorPoolDefinitionRecord,
    ) -> Result<Arc<StorPoolDefinition>> {
        let core = EntityCore::restore(
            StorPoolDefinition::KIND,
            record.name.to_string(),
            record.uuid,
            record.flags,
            StorPoolDefinition::props_instance(&record.name),
            self.drivers.props.clone(),
        )?;
        Ok(StorPoolDefinition::assemble(
            core,
            record.name,
            self.drivers.stor_pool_definitions.clone(),
        ))
    }
}
