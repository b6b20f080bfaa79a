//! Node connections
//!
//! A symmetric relation between two nodes. The endpoint pair is stored in
//! canonical order, so looking a connection up from either side yields the
//! same instance.

use super::{
    canonical_pair, entity_accessors, entity_debug, visible, ConnectionArgs, Entity, EntityCore,
    FieldUpdates, Node, NodeName,
};
use crate::error::Result;
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
    /// Node connection flags
    NodeConnectionFlag {
        Delete = 1 << 0 => "DELETE",
        Local = 1 << 1 => "LOCAL",
    }
}

/// Canonically ordered endpoint pair
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeConnectionKey {
    source: NodeName,
    target: NodeName,
}

impl NodeConnectionKey {
    /// Key of the connection between `a` and `b`, in either order
    pub fn new(a: &NodeName, b: &NodeName) -> Result<Self> {
        let (source, target) = canonical_pair(a, b)?;
        Ok(Self { source, target })
    }

    pub fn source(&self) -> &NodeName {
        &self.source
    }

    pub fn target(&self) -> &NodeName {
        &self.target
    }

    pub fn involves(&self, node: &NodeName) -> bool {
        &self.source == node || &self.target == node
    }
}

impl fmt::Display for NodeConnectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.source, self.target)
    }
}

/// Stored row of a node connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConnectionRecord {
    pub uuid: Uuid,
    pub node_src: NodeName,
    pub node_dst: NodeName,
    pub flags: u64,
}

impl Record for NodeConnectionRecord {
    type Key = NodeConnectionKey;
    const TABLE: &'static str = "NODE_CONNECTIONS";

    fn key(&self) -> NodeConnectionKey {
        NodeConnectionKey {
            source: self.node_src.clone(),
            target: self.node_dst.clone(),
        }
    }

    fn row_key(key: &NodeConnectionKey) -> String {
        format!("{}/{}", key.source.value(), key.target.value())
    }
}

/// Connection between two nodes
pub struct NodeConnection {
    core: EntityCore<NodeConnectionFlag>,
    key: NodeConnectionKey,
    source: Arc<Node>,
    target: Arc<Node>,
    driver: Arc<dyn PersistenceDriver<NodeConnectionRecord>>,
}

impl NodeConnection {
    entity_accessors!(NodeConnectionFlag);

    pub fn key(&self) -> &NodeConnectionKey {
        &self.key
    }

    pub fn source_node(&self) -> &Arc<Node> {
        &self.source
    }

    pub fn target_node(&self) -> &Arc<Node> {
        &self.target
    }

    /// The endpoint opposite to `node`
    pub fn other(&self, node: &NodeName) -> &Arc<Node> {
        if self.source.name() == node {
            &self.target
        } else {
            &self.source
        }
    }

    fn props_instance(key: &NodeConnectionKey) -> String {
        paths::instance(
            paths::NODE_CONNECTIONS,
            [key.source.value(), key.target.value()],
        )
    }

    fn to_record(&self) -> NodeConnectionRecord {
        NodeConnectionRecord {
            uuid: self.core.uuid(),
            node_src: self.key.source.clone(),
            node_dst: self.key.target.clone(),
            flags: self.core.flag_bits(),
        }
    }
}

entity_debug!(NodeConnection);

impl TransactionObject for NodeConnection {
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

impl Entity for NodeConnection {
    type Key = NodeConnectionKey;
    type Record = NodeConnectionRecord;
    const KIND: &'static str = "NodeConnection";

    fn key(&self) -> NodeConnectionKey {
        self.key.clone()
    }

    fn uuid(&self) -> Uuid {
        self.core.uuid()
    }

    fn protection(&self) -> &ObjectProtection {
        self.core.protection()
    }

    fn link_parents(self: &Arc<Self>) -> Result<()> {
        let on_source = self.source.link_node_connection(self.key.target.clone(), self.clone());
        let on_target = self.target.link_node_connection(self.key.source.clone(), self.clone());
        on_source.and(on_target)
    }

    fn unlink_parents(&self) {
        self.source.unlink_node_connection(&self.key.target);
        self.target.unlink_node_connection(&self.key.source);
    }
}

// =============================================================================
// Repository Operations
// =============================================================================

impl Repository {
    /// Create-or-load-or-cache the connection between `a` and `b`.
    ///
    /// The endpoint order does not matter; connecting a node to itself fails
    /// with [`crate::Error::InvalidConnection`].
    pub fn get_node_connection(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        a: &Arc<Node>,
        b: &Arc<Node>,
        args: ConnectionArgs<NodeConnectionFlag>,
        create_if_missing: bool,
        fail_if_existing: bool,
    ) -> Result<Option<Arc<NodeConnection>>> {
        let key = NodeConnectionKey::new(a.name(), b.name())?;
        let (source, target) = if a.name() == &key.source { (a, b) } else { (b, a) };

        let found = self.node_conns.get_instance(
            &self.stats,
            ctx,
            self.drivers.node_connections.as_ref(),
            &key,
            create_if_missing,
            fail_if_existing,
            |record| self.restore_node_connection(record),
            || {
                source.require(acc, AccessType::Change)?;
                target.require(acc, AccessType::Change)?;

                let core = EntityCore::create(
                    NodeConnection::KIND,
                    key.to_string(),
                    args.uuid,
                    acc,
                    &args.flags,
                    NodeConnection::props_instance(&key),
                    self.drivers.props.clone(),
                );
                Ok(Arc::new(NodeConnection {
                    core,
                    key: key.clone(),
                    source: source.clone(),
                    target: target.clone(),
                    driver: self.drivers.node_connections.clone(),
                }))
            },
        )?;
        visible(acc, found)
    }

    /// Cached or stored node connection
    pub fn node_connection(&self, key: &NodeConnectionKey) -> Result<Option<Arc<NodeConnection>>> {
        self.node_conns.lookup(
            &self.stats,
            self.drivers.node_connections.as_ref(),
            key,
            |record| self.restore_node_connection(record),
        )
    }

    pub fn node_connections(&self) -> Vec<Arc<NodeConnection>> {
        self.node_conns.values()
    }

    /// Every connection with `node` as either endpoint, stored or cached
    pub fn node_connections_by_endpoint(&self, node: &NodeName) -> Result<Vec<Arc<NodeConnection>>> {
        let mut found = BTreeMap::new();
        for record in self.drivers.node_connections.load_all()? {
            let key = record.key();
            if key.involves(node) {
                if let Some(conn) = self.node_connection(&key)? {
                    found.insert(key, conn);
                }
            }
        }
        for conn in self.node_conns.values() {
            if conn.key.involves(node) {
                found.entry(conn.key.clone()).or_insert(conn);
            }
        }
        Ok(found.into_values().collect())
    }

    pub fn delete_node_connection(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        conn: &Arc<NodeConnection>,
    ) -> Result<()> {
        conn.core.require(acc, AccessType::Control)?;
        ctx.attach(conn)?;
        conn.core.mark_deleted(acc)?;
        self.node_conns.remove(&self.stats, ctx, conn)
    }

    pub(crate) fn restore_node_connection(&self, record: NodeConnectionRecord) -> Result<Arc<NodeConnection>> {
        let key = record.key();
        let source = self
            .node(&key.source)?
            .ok_or_else(|| dangling(NodeConnection::KIND, &key, Node::KIND, &key.source))?;
        let target = self
            .node(&key.target)?
            .ok_or_else(|| dangling(NodeConnection::KIND, &key, Node::KIND, &key.target))?;

        let core = EntityCore::restore(
            NodeConnection::KIND,
            key.to_string(),
            record.uuid,
            record.flags,
            NodeConnection::props_instance(&key),
            self.drivers.props.clone(),
        )?;
        Ok(Arc::new(NodeConnection {
            core,
            key,
            source,
            target,
            driver: self.drivers.node_connections.clone(),
        }))
    }
}
