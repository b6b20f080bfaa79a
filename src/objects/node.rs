//! Cluster nodes

use super::{
    entity_accessors, entity_debug, visible, Entity, EntityCore, FieldUpdates, LinkMap,
    NetInterface, NetInterfaceName, NodeConnection, NodeName, Resource, ResourceName, StorPool,
    StorPoolName,
};
use crate::error::{Error, Result};
use crate::persistence::{PersistenceDriver, Record};
use crate::propscon::paths;
use crate::repository::Repository;
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::define_flags;
use crate::transaction::{TransactionContext, TransactionObject, Transition, TxAnchor, TxCell};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

define_flags! {
    /// Node flags
    NodeFlag {
        Delete = 1 << 0 => "DELETE",
        Evicted = 1 << 1 => "EVICTED",
        Evacuate = 1 << 2 => "EVACUATE",
        /// Excluded from quorum calculations
        QIgnore = 1 << 16 => "QIGNORE",
    }
}

/// Role of a node in the cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodeType {
    Controller,
    Satellite,
    Combined,
    #[default]
    Auxiliary,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeType::Controller => "CONTROLLER",
            NodeType::Satellite => "SATELLITE",
            NodeType::Combined => "COMBINED",
            NodeType::Auxiliary => "AUXILIARY",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for NodeType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "CONTROLLER" => Ok(NodeType::Controller),
            "SATELLITE" => Ok(NodeType::Satellite),
            "COMBINED" => Ok(NodeType::Combined),
            "AUXILIARY" => Ok(NodeType::Auxiliary),
            _ => Err(Error::InvalidValue(format!("unknown node type '{}'", s))),
        }
    }
}

/// Stored row of a node
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRecord {
    pub uuid: Uuid,
    pub name: NodeName,
    pub node_type: NodeType,
    pub flags: u64,
}

impl Record for NodeRecord {
    type Key = NodeName;
    const TABLE: &'static str = "NODES";

    fn key(&self) -> NodeName {
        self.name.clone()
    }

    fn row_key(key: &NodeName) -> String {
        key.value().to_string()
    }
}

#[derive(Debug, Clone, Default)]
pub struct NodeArgs {
    pub uuid: Option<Uuid>,
    pub node_type: NodeType,
    pub flags: Vec<NodeFlag>,
}

/// A cluster node with its resources, storage pools and connections
pub struct Node {
    core: EntityCore<NodeFlag>,
    name: NodeName,
    node_type: TxCell<NodeType>,
    resources: LinkMap<ResourceName, Arc<Resource>>,
    stor_pools: LinkMap<StorPoolName, Arc<StorPool>>,
    node_connections: LinkMap<NodeName, Arc<NodeConnection>>,
    net_interfaces: LinkMap<NetInterfaceName, Arc<NetInterface>>,
    driver: Arc<dyn PersistenceDriver<NodeRecord>>,
}

impl Node {
    entity_accessors!(NodeFlag);

    fn assemble(
        core: EntityCore<NodeFlag>,
        name: NodeName,
        node_type: NodeType,
        driver: Arc<dyn PersistenceDriver<NodeRecord>>,
    ) -> Arc<Self> {
        let anchor = core.shared_anchor();
        Arc::new(Self {
            node_type: TxCell::new(anchor.clone(), node_type),
            resources: LinkMap::new(),
            stor_pools: LinkMap::new(),
            node_connections: LinkMap::new(),
            net_interfaces: LinkMap::new(),
            core,
            name,
            driver,
        })
    }

    pub fn name(&self) -> &NodeName {
        &self.name
    }

    pub fn node_type(&self, acc: &AccessContext) -> Result<NodeType> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.node_type.get())
    }

    /// Change the node type. Returns the previous type.
    pub fn set_node_type(&self, acc: &AccessContext, node_type: NodeType) -> Result<NodeType> {
        self.core.require(acc, AccessType::Change)?;
        Ok(self.node_type.set(node_type))
    }

    pub fn resource(&self, acc: &AccessContext, rsc: &ResourceName) -> Result<Option<Arc<Resource>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.resources.get(rsc))
    }

    /// Resources deployed on this node, ordered by resource name
    pub fn resources(&self, acc: &AccessContext) -> Result<Vec<Arc<Resource>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.resources.values())
    }

    pub fn resource_count(&self) -> usize {
        self.resources.len()
    }

    pub fn stor_pool(&self, acc: &AccessContext, pool: &StorPoolName) -> Result<Option<Arc<StorPool>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.stor_pools.get(pool))
    }

    pub fn stor_pools(&self, acc: &AccessContext) -> Result<Vec<Arc<StorPool>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.stor_pools.values())
    }

    /// Connection to `other`, if one exists
    pub fn node_connection(&self, acc: &AccessContext, other: &NodeName) -> Result<Option<Arc<NodeConnection>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.node_connections.get(other))
    }

    pub fn node_connections(&self, acc: &AccessContext) -> Result<Vec<Arc<NodeConnection>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.node_connections.values())
    }

    pub fn net_interface(
        &self,
        acc: &AccessContext,
        name: &NetInterfaceName,
    ) -> Result<Option<Arc<NetInterface>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.net_interfaces.get(name))
    }

    /// Network interfaces ordered by name
    pub fn net_interfaces(&self, acc: &AccessContext) -> Result<Vec<Arc<NetInterface>>> {
        self.core.require(acc, AccessType::View)?;
        Ok(self.net_interfaces.values())
    }

    pub(crate) fn require(&self, acc: &AccessContext, access: AccessType) -> Result<()> {
        self.core.require(acc, access)
    }

    pub(crate) fn link_resource(&self, rsc: ResourceName, resource: Arc<Resource>) -> Result<()> {
        self.core.link(&self.resources, rsc, resource)
    }

    pub(crate) fn unlink_resource(&self, rsc: &ResourceName) {
        self.resources.unlink(rsc);
    }

    pub(crate) fn link_stor_pool(&self, pool: StorPoolName, stor_pool: Arc<StorPool>) -> Result<()> {
        self.core.link(&self.stor_pools, pool, stor_pool)
    }

    pub(crate) fn unlink_stor_pool(&self, pool: &StorPoolName) {
        self.stor_pools.unlink(pool);
    }

    pub(crate) fn link_node_connection(&self, other: NodeName, conn: Arc<NodeConnection>) -> Result<()> {
        self.core.link(&self.node_connections, other, conn)
    }

    pub(crate) fn unlink_node_connection(&self, other: &NodeName) {
        self.node_connections.unlink(other);
    }

    pub(crate) fn link_net_interface(&self, name: NetInterfaceName, net_if: Arc<NetInterface>) -> Result<()> {
        self.core.link(&self.net_interfaces, name, net_if)
    }

    pub(crate) fn unlink_net_interface(&self, name: &NetInterfaceName) {
        self.net_interfaces.unlink(name);
    }

    fn reopen_links(&self) {
        self.resources.unseal();
        self.stor_pools.unseal();
        self.node_connections.unseal();
        self.net_interfaces.unseal();
    }

    fn props_instance(name: &NodeName) -> String {
        paths::instance(paths::NODES, [name.value()])
    }

    fn to_record(&self) -> NodeRecord {
        NodeRecord {
            uuid: self.core.uuid(),
            name: self.name.clone(),
            node_type: self.node_type.get(),
            flags: self.core.flag_bits(),
        }
    }
}

entity_debug!(Node);

impl TransactionObject for Node {
    fn anchor(&self) -> &TxAnchor {
        self.core.anchor()
    }

    fn describe(&self) -> String {
        self.core.describe()
    }

    fn flush(&self) -> Result<()> {
        let fields = FieldUpdates::new().track("node_type", &self.node_type)?;
        self.core
            .flush_row(self.driver.as_ref(), &self.name, || self.to_record(), fields)
    }

    fn commit_pending(&self) {
        if self.anchor().transition() != Transition::Delete {
            self.reopen_links();
        }
        self.core.commit_components();
        self.node_type.commit();
    }

    fn rollback_pending(&self) {
        self.reopen_links();
        self.core.rollback_components();
        self.node_type.rollback();
    }
}

impl Entity for Node {
    type Key = NodeName;
    type Record = NodeRecord;
    const KIND: &'static str = "Node";

    fn key(&self) -> NodeName {
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
    /// Create-or-load-or-cache a node
    pub fn get_node(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        name: &NodeName,
        args: NodeArgs,
        create_if_missing: bool,
        fail_if_existing: bool,
    ) -> Result<Option<Arc<Node>>> {
        let found = self.nodes.get_instance(
            &self.stats,
            ctx,
            self.drivers.nodes.as_ref(),
            name,
            create_if_missing,
            fail_if_existing,
            |record| self.restore_node(record),
            || {
                let core = EntityCore::create(
                    Node::KIND,
                    name.to_string(),
                    args.uuid,
                    acc,
                    &args.flags,
                    Node::props_instance(name),
                    self.drivers.props.clone(),
                );
                Ok(Node::assemble(core, name.clone(), args.node_type, self.drivers.nodes.clone()))
            },
        )?;
        visible(acc, found)
    }

    /// Cached or stored node
    pub fn node(&self, name: &NodeName) -> Result<Option<Arc<Node>>> {
        self.nodes
            .lookup(&self.stats, self.drivers.nodes.as_ref(), name, |record| {
                self.restore_node(record)
            })
    }

    /// All cached nodes ordered by name
    pub fn nodes(&self) -> Vec<Arc<Node>> {
        self.nodes.values()
    }

    /// Delete a node together with its storage pools, network interfaces
    /// and node connections.
    ///
    /// Fails with [`Error::InUse`] while resources are still deployed on it.
    pub fn delete_node(&self, acc: &AccessContext, ctx: &TransactionContext, node: &Arc<Node>) -> Result<()> {
        node.core.require(acc, AccessType::Control)?;
        ctx.attach(node)?;
        node.core
            .seal(&node.resources, |n| format!("{} resources are deployed on it", n))?;

        for conn in node.node_connections.values() {
            self.delete_node_connection(acc, ctx, &conn)?;
        }
        for pool in node.stor_pools.values() {
            self.delete_stor_pool(acc, ctx, &pool)?;
        }
        for net_if in node.net_interfaces.values() {
            self.delete_net_interface(acc, ctx, &net_if)?;
        }
        node.core
            .seal(&node.node_connections, |n| format!("{} node connections were added", n))?;
        node.core
            .seal(&node.stor_pools, |n| format!("{} storage pools were added", n))?;
        node.core
            .seal(&node.net_interfaces, |n| format!("{} network interfaces were added", n))?;
        debug!(node = %node.name, "Node children removed");

        node.core.mark_deleted(acc)?;
        self.nodes.remove(&self.stats, ctx, node)
    }

    pub(crate) fn restore_node(&self, record: NodeRecord) -> Result<Arc<Node>> {
        let core = EntityCore::restore(
            Node::KIND,
            record.name.to_string(),
            record.uuid,
            record.flags,
            Node::props_instance(&record.name),
            self.drivers.props.clone(),
        )?;
        Ok(Node::assemble(
            core,
            record.name,
            record.node_type,
            self.drivers.nodes.clone(),
        ))
    }
}
