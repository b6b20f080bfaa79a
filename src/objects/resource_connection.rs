//! Resource connections between two deployments of the same resource

use super::{
    canonical_pair, entity_accessors, entity_debug, visible, ConnectionArgs, Entity, EntityCore,
    FieldUpdates, NodeName, Resource, ResourceKey, ResourceName,
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
    /// Resource connection flags
    ResourceConnectionFlag {
        Delete = 1 << 0 => "DELETE",
        Local = 1 << 1 => "LOCAL",
    }
}

/// Resource name plus canonically ordered node pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceConnectionKey {
    rsc: ResourceName,
    source: NodeName,
    target: NodeName,
}

impl ResourceConnectionKey {
    /// Key of the connection between `a` and `b`, in either order
    pub fn new(a: &ResourceKey, b: &ResourceKey) -> Result<Self> {
        if a.rsc != b.rsc {
            return Err(Error::InvalidConnection(format!(
                "resources {} and {} belong to different definitions",
                a, b
            )));
        }
        let (source, target) = canonical_pair(&a.node, &b.node)?;
        Ok(Self {
            rsc: a.rsc.clone(),
            source,
            target,
        })
    }

    pub fn resource_name(&self) -> &ResourceName {
        &self.rsc
    }

    pub fn source(&self) -> ResourceKey {
        ResourceKey::new(self.source.clone(), self.rsc.clone())
    }

    pub fn target(&self) -> ResourceKey {
        ResourceKey::new(self.target.clone(), self.rsc.clone())
    }

    pub fn involves(&self, rsc: &ResourceKey) -> bool {
        self.rsc == rsc.rsc && (self.source == rsc.node || self.target == rsc.node)
    }
}

impl fmt::Display for ResourceConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.source, self.target, self.rsc)
    }
}

/// Stored row of a resource connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConnectionRecord {
    pub uuid: Uuid,
    pub node_src: NodeName,
    pub node_dst: NodeName,
    pub resource_name: ResourceName,
    pub flags: u64,
}

impl Record for ResourceConnectionRecord {
    type Key = ResourceConnectionKey;
    const TABLE: &'static str = "RESOURCE_CONNECTIONS";

    fn key(&self) -> ResourceConnectionKey {
        ResourceConnectionKey {
            rsc: self.resource_name.clone(),
            source: self.node_src.clone(),
            target: self.node_dst.clone(),
        }
    }

    fn row_key(key: &ResourceConnectionKey) -> String {
        format!(
            "{}/{}/{}",
            key.source.value(),
            key.target.value(),
            key.rsc.value()
        )
    }
}

/// Connection between two deployments of one resource
pub struct ResourceConnection {
    core: EntityCore<ResourceConnectionFlag>,
    key: ResourceConnectionKey,
    source: Arc<Resource>,
    target: Arc<Resource>,
    driver: Arc<dyn PersistenceDriver<ResourceConnectionRecord>>,
}

impl ResourceConnection {
    entity_accessors!(ResourceConnectionFlag);

    pub fn key(&self) -> &ResourceConnectionKey {
        &self.key
    }

    pub fn source_resource(&self) -> &Arc<Resource> {
        &self.source
    }

    pub fn target_resource(&self) -> &Arc<Resource> {
        &self.target
    }

    fn props_instance(key: &ResourceConnectionKey) -> String {
        paths::instance(
            paths::RESOURCE_CONNECTIONS,
            [key.source.value(), key.target.value(), key.rsc.value()],
        )
    }

    fn to_record(&self) -> ResourceConnectionRecord {
        ResourceConnectionRecord {
            uuid: self.core.uuid(),
            node_src: self.key.source.clone(),
            node_dst: self.key.target.clone(),
            resource_name: self.key.rsc.clone(),
            flags: self.core.flag_bits(),
        }
    }
}

entity_debug!(ResourceConnection);

impl TransactionObject for ResourceConnection {
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

impl Entity for ResourceConnection {
    type Key = ResourceConnectionKey;
    type Record = ResourceConnectionRecord;
    const KIND: &'static str = "ResourceConnection";

    fn key(&self) -> ResourceConnectionKey {
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
    /// one resource, in either order
    pub fn get_resource_connection(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        a: &Arc<Resource>,
        b: &Arc<Resource>,
        args: ConnectionArgs<ResourceConnectionFlag>,
        create_if_missing: bool,
        fail_if_existing: bool,
    ) -> Result<Option<Arc<ResourceConnection>>> {
        let key = ResourceConnectionKey::new(a.key(), b.key())?;
        let (source, target) = if a.key().node == key.source { (a, b) } else { (b, a) };

        let found = self.rsc_conns.get_instance(
            &self.stats,
            ctx,
            self.drivers.resource_connections.as_ref(),
            &key,
            create_if_missing,
            fail_if_existing,
            |record| self.restore_resource_connection(record),
            || {
                source.require(acc, AccessType::Change)?;
                target.require(acc, AccessType::Change)?;

                let core = EntityCore::create(
                    ResourceConnection::KIND,
                    key.to_string(),
                    args.uuid,
                    acc,
                    &args.flags,
                    ResourceConnection::props_instance(&key),
                    self.drivers.props.clone(),
                );
                Ok(Arc::new(ResourceConnection {
                    core,
                    key: key.clone(),
                    source: source.clone(),
                    target: target.clone(),
                    driver: self.drivers.resource_connections.clone(),
                }))
            },
        )?;
        visible(acc, found)
    }

    /// Cached or stored resource connection
    pub fn resource_connection(&self, key: &ResourceConnectionKey) -> Result<Option<Arc<ResourceConnection>>> {
        self.rsc_conns.lookup(
            &self.stats,
            self.drivers.resource_connections.as_ref(),
            key,
            |record| self.restore_resource_connection(record),
        )
    }

    pub fn resource_connections(&self) -> Vec<Arc<ResourceConnection>> {
        self.rsc_conns.values()
    }

    /// Every connection with `rsc` as either endpoint, stored or cached
    pub fn resource_connections_by_endpoint(&self, rsc: &ResourceKey) -> Result<Vec<Arc<ResourceConnection>>> {
        let mut found = BTreeMap::new();
        for record in self.drivers.resource_connections.load_all()? {
            let key = record.key();
            if key.involves(rsc) {
                if let Some(conn) = self.resource_connection(&key)? {
                    found.insert(key, conn);
                }
            }
        }
        for conn in self.rsc_conns.values() {
            if conn.key.involves(rsc) {
                found.entry(conn.key.clone()).or_insert(conn);
            }
        }
        Ok(found.into_values().collect())
    }

    pub fn delete_resource_connection(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        conn: &Arc<ResourceConnection>,
    ) -> Result<()> {
        conn.core.require(acc, AccessType::Control)?;
        ctx.attach(conn)?;
        conn.core.mark_deleted(acc)?;
        self.rsc_conns.remove(&self.stats, ctx, conn)
    }

    pub(crate) fn restore_resource_connection(
        &self,
        record: ResourceConnectionRecord,
    ) -> Result<Arc<ResourceConnection>> {
        let key = record.key();
        let source_key = key.source();
        let target_key = key.target();
        let source = self
            .resource(&source_key)?
            .ok_or_else(|| dangling(ResourceConnection::KIND, &key, Resource::KIND, &source_key))?;
        let target = self
            .resource(&target_key)?
            .ok_or_else(|| dangling(ResourceConnection::KIND, &key, Resource::KIND, &target_key))?;

        let core = EntityCore::restore(
            ResourceConnection::KIND,
            key.to_string(),
            record.uuid,
            record.flags,
            ResourceConnection::props_instance(&key),
            self.drivers.props.clone(),
        )?;
        Ok(Arc::new(ResourceConnection {
            core,
            key,
            source,
            target,
            driver: self.drivers.resource_connections.clone(),
        }))
    }
}
