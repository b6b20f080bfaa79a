//! Volume connections between two deployments of the same volume

use super::{
    canonical_pair, entity_accessors, entity_debug, visible, ConnectionArgs, Entity, EntityCore,
    FieldUpdates, NodeName, ResourceName, Volume, VolumeKey, VolumeNumber,
};
use crate::error::{Error, Result};
use crate::persistence::{PersistenceDriver, Record};
use crate::propscon::paths;
use crate::repository::{dangling, Repository};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::define_flags;
use crate::transaction::{TransactionContext, TransactionObject, TxAnchor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use uuid::Uuid;

define_flags! {
    /// Volume connection flags
    VolumeConnectionFlag {
        Delete = 1 << 0 => "DELETE",
        Local = 1 << 1 => "LOCAL",
    }
}

/// Volume identity plus canonically ordered node pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VolumeConnectionKey {
    rsc: ResourceName,
    vlm_nr: VolumeNumber,
    source: NodeName,
    target: NodeName,
}

impl VolumeConnectionKey {
    /// Key of the connection between `a` and `b`, in either order
    pub fn new(a: &VolumeKey, b: &VolumeKey) -> Result<Self> {
        if a.rsc != b.rsc || a.vlm_nr != b.vlm_nr {
            return Err(Error::InvalidConnection(format!(
                "volumes {} and {} belong to different volume definitions",
                a, b
            )));
        }
        let (source, target) = canonical_pair(&a.node, &b.node)?;
        Ok(Self {
            rsc: a.rsc.clone(),
            vlm_nr: a.vlm_nr,
            source,
            target,
        })
    }

    pub fn source(&self) -> VolumeKey {
        VolumeKey::new(self.source.clone(), self.rsc.clone(), self.vlm_nr)
    }

    pub fn target(&self) -> VolumeKey {
        VolumeKey::new(self.target.clone(), self.rsc.clone(), self.vlm_nr)
    }

    pub fn involves(&self, vlm: &VolumeKey) -> bool {
        self.rsc == vlm.rsc
            && self.vlm_nr == vlm.vlm_nr
            && (self.source == vlm.node || self.target == vlm.node)
    }
}

impl fmt::Display for VolumeConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}/{}", self.source, self.target, self.rsc, self.vlm_nr)
    }
}

/// Stored row of a volume connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConnectionRecord {
    pub uuid: Uuid,
    pub node_src: NodeName,
    pub node_dst: NodeName,
    pub resource_name: ResourceName,
    pub vlm_nr: VolumeNumber,
    pub flags: u64,
}

impl Record for VolumeConnectionRecord {
    type Key = VolumeConnectionKey;
    const TABLE: &'static str = "VOLUME_CONNECTIONS";

    fn key(&self) -> VolumeConnectionKey {
        VolumeConnectionKey {
            rsc: self.resource_name.clone(),
            vlm_nr: self.vlm_nr,
            source: self.node_src.clone(),
            target: self.node_dst.clone(),
        }
    }

    fn row_key(key: &VolumeConnectionKey) -> String {
        format!(
            "{}/{}/{}/{}",
            key.source.value(),
            key.target.value(),
            key.rsc.value(),
            key.vlm_nr
        )
    }
}

/// Connection between two deployments of one volume
pub struct VolumeConnection {
    core: EntityCore<VolumeConnectionFlag>,
    key: VolumeConnectionKey,
    source: Arc<Volume>,
    target: Arc<Volume>,
    driver: Arc<dyn PersistenceDriver<VolumeConnectionRecord>>,
}

impl VolumeConnection {
    entity_accessors!(VolumeConnectionFlag);

    pub fn key(&self) -> &VolumeConnectionKey {
        &self.key
    }

    pub fn source_volume(&self) -> &Arc<Volume> {
        &self.source
    }

    pub fn target_volume(&self) -> &Arc<Volume> {
        &self.target
    }

    fn props_instance(key: &VolumeConnectionKey) -> String {
        paths::instance(
            paths::VOLUME_CONNECTIONS,
            [
                key.source.value().to_string(),
                key.target.value().to_string(),
                key.rsc.value().to_string(),
                key.vlm_nr.to_string(),
            ],
        )
    }

    fn to_record(&self) -> VolumeConnectionRecord {
        VolumeConnectionRecord {
            uuid: self.core.uuid(),
            node_src: self.key.source.clone(),
            node_dst: self.key.target.clone(),
            resource_name: self.key.rsc.clone(),
            vlm_nr: self.key.vlm_nr,
            flags: self.core.flag_bits(),
        }
    }
}

entity_debug!(VolumeConnection);

impl TransactionObject for VolumeConnection {
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
        self.core.commit_components();
    }

    fn rollback_pending(&self) {
        self.core.rollback_components();
    }
}

impl Entity for VolumeConnection {
    type Key = VolumeConnectionKey;
    type Record = VolumeConnectionRecord;
    const KIND: &'static str = "VolumeConnection";

    fn key(&self) -> VolumeConnectionKey {
        self.key.clone()
    }

    fn uuid(&self) -> Uuid {
        self.core.uuid()
    }

    fn protection(&self) -> &ObjectProtection {
        self.core.protection()
    }

    fn link_parents(self: &Arc<Self>) -> Result<()> {
        let on_source = self.source.link_connection(self.key.target.clone(), self.clone());
        let on_target = self.target.link_connection(self.key.source.clone(), self.clone());
        on_source.and(on_target)
    }

    fn unlink_parents(&self) {
        self.source.unlink_connection(&self.key.target);
        self.target.unlink_connection(&self.key.source);
    }
}

// =============================================================================
// Repository Operations
// =============================================================================

impl Repository {
    /// Create-or-load-or-cache the connection between two deployments of
    /// one volume, in either order
    pub fn get_volume_connection(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        a: &Arc<Volume>,
        b: &Arc<Volume>,
        args: ConnectionArgs<VolumeConnectionFlag>,
        create_if_missing: bool,
        fail_if_existing: bool,
    ) -> Result<Option<Arc<VolumeConnection>>> {
        let key = VolumeConnectionKey::new(a.key(), b.key())?;
        let (source, target) = if a.key().node == key.source { (a, b) } else { (b, a) };

        let found = self.vlm_conns.get_instance(
            &self.stats,
            ctx,
            self.drivers.volume_connections.as_ref(),
            &key,
            create_if_missing,
            fail_if_existing,
            |record| self.restore_volume_connection(record),
            || {
                source.require(acc, AccessType::Change)?;
                target.require(acc, AccessType::Change)?;

                let core = EntityCore::create(
                    VolumeConnection::KIND,
                    key.to_string(),
                    args.uuid,
                    acc,
                    &args.flags,
                    VolumeConnection::props_instance(&key),
                    self.drivers.props.clone(),
                );
                Ok(Arc::new(VolumeConnection {
                    core,
                    key: key.clone(),
                    source: source.clone(),
                    target: target.clone(),
                    driver: self.drivers.volume_connections.clone(),
                }))
            },
        )?;
        visible(acc, found)
    }

    /// Cached or stored volume connection
    pub fn volume_connection(&self, key: &VolumeConnectionKey) -> Result<Option<Arc<VolumeConnection>>> {
        self.vlm_conns.lookup(
            &self.stats,
            self.drivers.volume_connections.as_ref(),
            key,
            |record| self.restore_volume_connection(record),
        )
    }

    pub fn volume_connections(&self) -> Vec<Arc<VolumeConnection>> {
        self.vlm_conns.values()
    }

    /// Every connection with `vlm` as either endpoint, stored or cached
    pub fn volume_connections_by_endpoint(&self, vlm: &VolumeKey) -> Result<Vec<Arc<VolumeConnection>>> {
        let mut found = BTreeMap::new();
        for record in self.drivers.volume_connections.load_all()? {
            let key = record.key();
            if key.involves(vlm) {
                if let Some(conn) = self.volume_connection(&key)? {
                    found.insert(key, conn);
                }
            }
        }
        for conn in self.vlm_conns.values() {
            if conn.key.involves(vlm) {
                found.entry(conn.key.clone()).or_insert(conn);
            }
        }
        Ok(found.into_values().collect())
    }

    pub fn delete_volume_connection(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        conn: &Arc<VolumeConnection>,
    ) -> Result<()> {
        conn.core.require(acc, AccessType::Control)?;
        ctx.attach(conn)?;
        conn.core.mark_deleted(acc)?;
        self.vlm_conns.remove(&self.stats, ctx, conn)
    }

    pub(crate) fn restore_volume_connection(
        &self,
        record: VolumeConnectionRecord,
    ) -> Result<Arc<VolumeConnection>> {
        let key = record.key();
        let source_key = key.source();
        let target_key = key.target();
        let source = self
            .volume(&source_key)?
            .ok_or_else(|| dangling(VolumeConnection::KIND, &key, Volume::KIND, &source_key))?;
        let target = self
            .volume(&target_key)?
            .ok_or_else(|| dangling(VolumeConnection::KIND, &key, Volume::KIND, &target_key))?;

        let core = EntityCore::restore(
            VolumeConnection::KIND,
            key.to_string(),
            record.uuid,
            record.flags,
            VolumeConnection::props_instance(&key),
            self.drivers.props.clone(),
        )?;
        Ok(Arc::new(VolumeConnection {
            core,
            key,
            source,
            target,
            driver: self.drivers.volume_connections.clone(),
        }))
    }
}
