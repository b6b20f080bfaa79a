//! Volume definitions
//!
//! A volume definition owns one minor number from the repository's pool for
//! as long as it exists. The pool always reflects the committed minor plus
//! any pending replacement:
//!
//! - a pending change reserves the new number immediately and releases the
//!   old one when the change commits;
//! - a rollback releases whatever was reserved for the pending change;
//! - deletion releases both numbers at once, a rolled back deletion takes
//!   the committed number back.

use super::{
    entity_accessors, entity_debug, visible, Entity, EntityCore, FieldUpdates, LinkMap, MinorNumber,
    NodeName, ResourceDefinition, ResourceName, Volume, VolumeNumber,
};
use crate::error::Result;
use crate::numberpool::NumberPool;
use crate::persistence::{PersistenceDriver, Record};
use crate::propscon::paths;
use crate::repository::{dangling, Repository};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::define_flags;
use crate::transaction::{TransactionContext, TransactionObject, Transition, TxAnchor, TxCell};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};
use uuid::Uuid;

define_flags! {
    /// Volume definition flags
    VolumeDefinitionFlag {
        Delete = 1 << 0 => "DELETE",
        Encrypted = 1 << 1 => "ENCRYPTED",
        Resize = 1 << 2 => "RESIZE",
    }
}

/// Natural key of a volume definition
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeDefinitionKey {
    pub rsc: ResourceName,
    pub vlm_nr: VolumeNumber,
}

impl VolumeDefinitionKey {
    pub fn new(rsc: ResourceName, vlm_nr: VolumeNumber) -> Self {
        Self { rsc, vlm_nr }
    }
}

impl fmt::Display for VolumeDefinitionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.rsc, self.vlm_nr)
    }
}

/// Stored row of a volume definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDefinitionRecord {
    pub uuid: Uuid,
    pub resource_name: ResourceName,
    pub vlm_nr: VolumeNumber,
    pub size_kib: u64,
    pub minor_number: MinorNumber,
    pub flags: u64,
}

impl Record for VolumeDefinitionRecord {
    type Key = VolumeDefinitionKey;
    const TABLE: &'static str = "VOLUME_DEFINITIONS";

    fn key(&self) -> VolumeDefinitionKey {
        VolumeDefinitionKey::new(self.resource_name.clone(), self.vlm_nr)
    }

    fn row_key(key: &VolumeDefinitionKey) -> String {
        format!("{}/{}", key.rsc.value(), key.vlm_nr)
    }
}

#[derive(Debug, Clone, Default)]
pub struct VolumeDefinitionArgs {
    pub uuid: Option<Uuid>,
    pub size_kib: u64,
    /// Explicit minor number, allocated from the pool when `None`
    pub minor_number: Option<MinorNumber>,
    pub flags: Vec<VolumeDefinitionFlag>,
}

/// One volume of a resource definition
pub struct VolumeDefinition {
    core: EntityCore<VolumeDefinitionFlag>,
    key: VolumeDefinitionKey,
    definition: Arc<ResourceDefinition>,
    size_kib: TxCell<u64>,
    minor: TxCell<MinorNumber>,
    volumes: LinkMap<NodeName, Arc<Volume>>,
    pool: Arc<dyn NumberPool>,
    driver: Arc<dyn PersistenceDriver<VolumeDefinitionRecord>>,
}

impl VolumeDefinition {
    entity_accessors!(VolumeDefinitionFlag);

    fn assemble(
        core: EntityCore<VolumeDefinitionFlag>,
        definition: Arc<ResourceDefinition>,
        vlm_nr: VolumeNumber,
        size_kib: u64,
        minor: MinorNumber,
        pool: Arc<dyn NumberPool>,
        driver: Arc<dyn PersistenceDriver<VolumeDefinitionRecord>>,
    ) -> Arc<Self> {
        let anchor = core.shared_anchor();
        Arc::new(Self {
            key: VolumeDefinitionKey::new(definition.name().clone(), vlm_nr),
            size_kib: TxCell::new(anchor.clone(), size_kib),
            minor: TxCell::new(anchor.clone(), minor),
            volumes: LinkMap::new(),
            core,
            definition,
            pool,
            driver,
        })
    }

    pub fn key(&self) -> &VolumeDefinitionKey {
        &self.key
    }

    pub fn volume_number(&self) -> VolumeNumber {
        self.key.vlm_nr
    }

    pub fn resource_definition(&self) -> &Arc<ResourceDefinition> {
        &self.definition
    }

    pub fn volume_size(&self, acc: &AccessContext) -> Result<u64> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.size_kib.get())
    }

    /// Set the gross size in KiB. Returns the previous size.
    pub fn set_volume_size(&self, acc: &AccessContext, size_kib: u64) -> Result<u64> {
        self.core.require(acc, AccessType::Change)?;
        Ok(self.size_kib.set(size_kib))
    }

    pub fn minor_number(&self, acc: &AccessContext) -> Result<MinorNumber> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.minor.get())
    }

    /// Move to another minor number. Returns the previous one.
    ///
    /// Fails with [`crate::Error::NumberInUse`] if `minor` belongs to
    /// another volume definition.
    pub fn set_minor_number(&self, acc: &AccessContext, minor: MinorNumber) -> Result<MinorNumber> {
        self.core.require(acc, AccessType::Change)?;
        let current = self.minor.get();
        if minor == current {
            return Ok(current);
        }
        let committed = self.minor.committed();
        if minor != committed {
            self.pool.allocate(minor.value())?;
        }
        let previous = self.minor.set(minor);
        if previous != committed {
            self.pool.deallocate(previous.value());
        }
        debug!(vlm_dfn = %self.key, from = %previous, to = %minor, "Minor number changed");
        Ok(previous)
    }

    pub fn volume(&self, acc: &AccessContext, node: &NodeName) -> Result<Option<Arc<Volume>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.volumes.get(node))
    }

    /// Volumes of this definition ordered by node name
    pub fn volumes(&self, acc: &AccessContext) -> Result<Vec<Arc<Volume>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.volumes.values())
    }

    pub(crate) fn require(&self, acc: &AccessContext, access: AccessType) -> Result<()> {
        self.core.require(acc, access)
    }

    pub(crate) fn link_volume(&self, node: NodeName, vlm: Arc<Volume>) -> Result<()> {
        self.core.link(&self.volumes, node, vlm)
    }

    pub(crate) fn unlink_volume(&self, node: &NodeName) {
        self.volumes.unlink(node);
    }

    /// Return every number this definition holds to the pool
    fn release_minors(&self) {
        let current = self.minor.get();
        let committed = self.minor.committed();
        self.pool.deallocate(current.value());
        if committed != current {
            self.pool.deallocate(committed.value());
        }
    }

    fn reopen_links(&self) {
        self.volumes.unseal();
    }

    fn props_instance(key: &VolumeDefinitionKey) -> String {
        paths::instance(
            paths::VOLUME_DEFINITIONS,
            [key.rsc.value().to_string(), key.vlm_nr.to_string()],
        )
    }

    fn to_record(&self) -> VolumeDefinitionRecord {
        VolumeDefinitionRecord {
            uuid: self.core.uuid(),
            resource_name: self.key.rsc.clone(),
            vlm_nr: self.key.vlm_nr,
            size_kib: self.size_kib.get(),
            minor_number: self.minor.get(),
            flags: self.core.flag_bits(),
        }
    }
}

entity_debug!(VolumeDefinition);

impl TransactionObject for VolumeDefinition {
    fn anchor(&self) -> &TxAnchor {
        self.core.anchor()
    }

    fn describe(&self) -> String {
        self.core.describe()
    }

    fn flush(&self) -> Result<()> {
        let fields = FieldUpdates::new()
            .track("size_kib", &self.size_kib)?
            .track("minor_number", &self.minor)?;
        self.core
            .flush_row(self.driver.as_ref(), &self.key, || self.to_record(), fields)
    }

    fn commit_pending(&self) {
        if self.anchor().transition() != Transition::Delete {
            self.reopen_links();
        }
        if matches!(self.anchor().transition(), Transition::Create | Transition::Update) {
            let committed = self.minor.committed();
            if committed != self.minor.get() {
                self.pool.deallocate(committed.value());
            }
        }
        self.core.commit_components();
        self.size_kib.commit();
        self.minor.commit();
    }

    fn rollback_pending(&self) {
        self.reopen_links();
        match self.anchor().transition() {
            Transition::Create => self.release_minors(),
            Transition::Update => {
                if self.minor.is_dirty() {
                    self.pool.deallocate(self.minor.get().value());
                }
            }
            Transition::Delete => {
                let committed = self.minor.committed();
                if let Err(e) = self.pool.allocate(committed.value()) {
                    error!(
                        vlm_dfn = %self.key,
                        minor = %committed,
                        error = %e,
                        "Cannot reclaim minor number of restored volume definition"
                    );
                }
            }
            Transition::Nothing => {}
        }
        self.core.rollback_components();
        self.size_kib.rollback();
        self.minor.rollback();
    }
}

impl Entity for VolumeDefinition {
    type Key = VolumeDefinitionKey;
    type Record = VolumeDefinitionRecord;
    const KIND: &'static str = "VolumeDefinition";

    fn key(&self) -> VolumeDefinitionKey {
        self.key.clone()
    }

    fn uuid(&self) -> Uuid {
        self.core.uuid()
    }

    fn protection(&self) -> &ObjectProtection {
        self.core.protection()
    }

    fn link_parents(self: &Arc<Self>) -> Result<()> {
        self.definition.link_volume_definition(self.key.vlm_nr, self.clone())
    }

    fn unlink_parents(&self) {
        self.definition.unlink_volume_definition(self.key.vlm_nr);
    }
}

// =============================================================================
// Repository Operations
// =============================================================================

impl Repository {
    /// Create-or-load-or-cache volume `vlm_nr` of `definition`.
    ///
    /// Creation reserves the requested minor number, or the lowest free one.
    pub fn get_volume_definition(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        definition: &Arc<ResourceDefinition>,
        vlm_nr: VolumeNumber,
        args: VolumeDefinitionArgs,
        create_if_missing: bool,
        fail_if_existing: bool,
    ) -> Result<Option<Arc<VolumeDefinition>>> {
        let key = VolumeDefinitionKey::new(definition.name().clone(), vlm_nr);
        let found = self.vlm_dfns.get_instance(
            &self.stats,
            ctx,
            self.drivers.volume_definitions.as_ref(),
            &key,
            create_if_missing,
            fail_if_existing,
            |record| self.restore_volume_definition(record),
            || {
                definition.require(acc, AccessType::Use)?;

                let minor = match args.minor_number {
                    Some(minor) => {
                        self.minor_pool.allocate(minor.value())?;
                        minor
                    }
                    None => {
                        let number = self.minor_pool.auto_allocate()?;
                        MinorNumber::new(i64::from(number)).map_err(|e| {
                            self.minor_pool.deallocate(number);
                            e
                        })?
                    }
                };
                let core = EntityCore::create(
                    VolumeDefinition::KIND,
                    key.to_string(),
                    args.uuid,
                    acc,
                    &args.flags,
                    VolumeDefinition::props_instance(&key),
                    self.drivers.props.clone(),
                );
                Ok(VolumeDefinition::assemble(
                    core,
                    definition.clone(),
                    vlm_nr,
                    args.size_kib,
                    minor,
                    self.minor_pool.clone(),
                    self.drivers.volume_definitions.clone(),
                ))
            },
        )?;
        visible(acc, found)
    }

    /// Cached or stored volume definition
    pub fn volume_definition(&self, key: &VolumeDefinitionKey) -> Result<Option<Arc<VolumeDefinition>>> {
        self.vlm_dfns.lookup(
            &self.stats,
            self.drivers.volume_definitions.as_ref(),
            key,
            |record| self.restore_volume_definition(record),
        )
    }

    pub fn volume_definitions(&self) -> Vec<Arc<VolumeDefinition>> {
        self.vlm_dfns.values()
    }

    /// Delete a volume definition and its volumes, releasing its minor number
    pub fn delete_volume_definition(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        vlm_dfn: &Arc<VolumeDefinition>,
    ) -> Result<()> {
        vlm_dfn.core.require(acc, AccessType::Control)?;
        ctx.attach(vlm_dfn)?;

        for vlm in vlm_dfn.volumes.values() {
            self.delete_volume(acc, ctx, &vlm)?;
        }
        vlm_dfn
            .core
            .seal(&vlm_dfn.volumes, |n| format!("{} volumes were added", n))?;

        vlm_dfn.core.mark_deleted(acc)?;
        vlm_dfn.release_minors();
        self.vlm_dfns.remove(&self.stats, ctx, vlm_dfn)
    }

    pub(crate) fn restore_volume_definition(
        &self,
        record: VolumeDefinitionRecord,
    ) -> Result<Arc<VolumeDefinition>> {
        let key = record.key();
        let definition = self
            .resource_definition(&record.resource_name)?
            .ok_or_else(|| {
                dangling(VolumeDefinition::KIND, &key, ResourceDefinition::KIND, &record.resource_name)
            })?;

        let core = EntityCore::restore(
            VolumeDefinition::KIND,
            key.to_string(),
            record.uuid,
            record.flags,
            VolumeDefinition::props_instance(&key),
            self.drivers.props.clone(),
        )?;
        self.minor_pool.allocate(record.minor_number.value())?;
        Ok(VolumeDefinition::assemble(
            core,
            definition,
            record.vlm_nr,
            record.size_kib,
            record.minor_number,
            self.minor_pool.clone(),
            self.drivers.volume_definitions.clone(),
        ))
    }
}
