//! Network interfaces of a node
//!
//! An interface carries the address a node is reachable on. One interface
//! per node may additionally describe how the controller connects to the
//! satellite running there.

use super::{
    entity_accessors, entity_debug, visible, Entity, EntityCore, FieldUpdates, NetInterfaceName,
    Node, NodeName,
};
use crate::error::{Error, Result};
use crate::persistence::{PersistenceDriver, Record};
use crate::propscon::paths;
use crate::repository::{dangling, Repository};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::define_flags;
use crate::transaction::{TransactionContext, TransactionObject, TxAnchor, TxCell};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use uuid::Uuid;

define_flags! {
    /// Network interface flags
    NetInterfaceFlag {
        Delete = 1 << 0 => "DELETE",
    }
}

/// Transport of the controller to satellite connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EncryptionType {
    Plain,
    Ssl,
}

impl fmt::Display for EncryptionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EncryptionType::Plain => f.write_str("PLAIN"),
            EncryptionType::Ssl => f.write_str("SSL"),
        }
    }
}

impl std::str::FromStr for EncryptionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_uppercase().as_str() {
            "PLAIN" => Ok(EncryptionType::Plain),
            "SSL" => Ok(EncryptionType::Ssl),
            _ => Err(Error::InvalidValue(format!("unknown encryption type '{}'", s))),
        }
    }
}

/// Where and how the controller reaches the satellite behind an interface
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SatelliteConnection {
    pub port: u16,
    pub encryption: EncryptionType,
}

impl SatelliteConnection {
    pub fn new(port: u16, encryption: EncryptionType) -> Result<Self> {
        if port == 0 {
            return Err(Error::ValueOutOfRange {
                what: "satellite connection port",
                value: 0,
                min: 1,
                max: i64::from(u16::MAX),
            });
        }
        Ok(Self { port, encryption })
    }
}

/// Natural key of a network interface
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetInterfaceKey {
    pub node: NodeName,
    pub name: NetInterfaceName,
}

impl NetInterfaceKey {
    pub fn new(node: NodeName, name: NetInterfaceName) -> Self {
        Self { node, name }
    }
}

impl fmt::Display for NetInterfaceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.name)
    }
}

/// Stored row of a network interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetInterfaceRecord {
    pub uuid: Uuid,
    pub node_name: NodeName,
    pub name: NetInterfaceName,
    pub address: IpAddr,
    #[serde(default)]
    pub stlt_conn_port: Option<u16>,
    #[serde(default)]
    pub stlt_conn_encr_type: Option<EncryptionType>,
    pub flags: u64,
}

impl NetInterfaceRecord {
    /// Satellite connection columns, which are set or cleared together
    fn satellite_connection(&self) -> Result<Option<SatelliteConnection>> {
        match (self.stlt_conn_port, self.stlt_conn_encr_type) {
            (Some(port), Some(encryption)) => SatelliteConnection::new(port, encryption).map(Some),
            (None, None) => Ok(None),
            _ => Err(Error::Persistence(format!(
                "network interface {}/{} has an incomplete satellite connection",
                self.node_name, self.name
            ))),
        }
    }
}

impl Record for NetInterfaceRecord {
    type Key = NetInterfaceKey;
    const TABLE: &'static str = "NODE_NET_INTERFACES";

    fn key(&self) -> NetInterfaceKey {
        NetInterfaceKey::new(self.node_name.clone(), self.name.clone())
    }

    fn row_key(key: &NetInterfaceKey) -> String {
        format!("{}/{}", key.node.value(), key.name.value())
    }
}

#[derive(Debug, Clone)]
pub struct NetInterfaceArgs {
    pub uuid: Option<Uuid>,
    pub address: IpAddr,
    pub satellite_connection: Option<SatelliteConnection>,
    pub flags: Vec<NetInterfaceFlag>,
}

impl NetInterfaceArgs {
    pub fn new(address: IpAddr) -> Self {
        Self {
            uuid: None,
            address,
            satellite_connection: None,
            flags: Vec::new(),
        }
    }
}

/// A named address of a node
pub struct NetInterface {
    core: EntityCore<NetInterfaceFlag>,
    key: NetInterfaceKey,
    node: Arc<Node>,
    address: TxCell<IpAddr>,
    stlt_conn_port: TxCell<Option<u16>>,
    stlt_conn_encr_type: TxCell<Option<EncryptionType>>,
    driver: Arc<dyn PersistenceDriver<NetInterfaceRecord>>,
}

impl NetInterface {
    entity_accessors!(NetInterfaceFlag);

    fn assemble(
        core: EntityCore<NetInterfaceFlag>,
        node: Arc<Node>,
        name: NetInterfaceName,
        address: IpAddr,
        satellite_connection: Option<SatelliteConnection>,
        driver: Arc<dyn PersistenceDriver<NetInterfaceRecord>>,
    ) -> Arc<Self> {
        let anchor = core.shared_anchor();
        Arc::new(Self {
            key: NetInterfaceKey::new(node.name().clone(), name),
            address: TxCell::new(anchor.clone(), address),
            stlt_conn_port: TxCell::new(anchor.clone(), satellite_connection.map(|conn| conn.port)),
            stlt_conn_encr_type: TxCell::new(anchor, satellite_connection.map(|conn| conn.encryption)),
            core,
            node,
            driver,
        })
    }

    pub fn key(&self) -> &NetInterfaceKey {
        &self.key
    }

    pub fn name(&self) -> &NetInterfaceName {
        &self.key.name
    }

    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn address(&self, acc: &AccessContext) -> Result<IpAddr> {
        self.node.require(acc, AccessType::View)?;
        self.core.require(acc, AccessType::View)?;
        Ok(self.address.get())
    }

    /// Change the address. Returns the previous one.
    pub fn set_address(&self, acc: &AccessContext, address: IpAddr) -> Result<IpAddr> {
        self.node.require(acc, AccessType::Change)?;
        self.core.require(acc, AccessType::Change)?;
        Ok(self.address.set(address))
    }

    pub fn satellite_connection(&self, acc: &AccessContext) -> Result<Option<SatelliteConnection>> {
        self.node.require(acc, AccessType::View)?;
        self.core.require(acc, AccessType::View)?;
        Ok(self.current_satellite_connection())
    }

    /// Set or clear the satellite connection. Returns the previous one.
    pub fn set_satellite_connection(
        &self,
        acc: &AccessContext,
        conn: Option<SatelliteConnection>,
    ) -> Result<Option<SatelliteConnection>> {
        self.node.require(acc, AccessType::Change)?;
        self.core.require(acc, AccessType::Change)?;
        let previous = self.current_satellite_connection();
        self.stlt_conn_port.set(conn.map(|conn| conn.port));
        self.stlt_conn_encr_type.set(conn.map(|conn| conn.encryption));
        Ok(previous)
    }

    fn current_satellite_connection(&self) -> Option<SatelliteConnection> {
        match (self.stlt_conn_port.get(), self.stlt_conn_encr_type.get()) {
            (Some(port), Some(encryption)) => Some(SatelliteConnection { port, encryption }),
            _ => None,
        }
    }

    fn props_instance(key: &NetInterfaceKey) -> String {
        paths::instance(paths::NET_INTERFACES, [key.node.value(), key.name.value()])
    }

    fn to_record(&self) -> NetInterfaceRecord {
        NetInterfaceRecord {
            uuid: self.core.uuid(),
            node_name: self.key.node.clone(),
            name: self.key.name.clone(),
            address: self.address.get(),
            stlt_conn_port: self.stlt_conn_port.get(),
            stlt_conn_encr_type: self.stlt_conn_encr_type.get(),
            flags: self.core.flag_bits(),
        }
    }
}

entity_debug!(NetInterface);

impl TransactionObject for NetInterface {
    fn anchor(&self) -> &TxAnchor {
        self.core.anchor()
    }

    fn describe(&self) -> String {
        self.core.describe()
    }

    fn flush(&self) -> Result<()> {
        let fields = FieldUpdates::new()
            .track("address", &self.address)?
            .track("stlt_conn_port", &self.stlt_conn_port)?
            .track("stlt_conn_encr_type", &self.stlt_conn_encr_type)?;
        self.core
            .flush_row(self.driver.as_ref(), &self.key, || self.to_record(), fields)
    }

    fn commit_pending(&self) {
        self.core.commit_components();
        self.address.commit();
        self.stlt_conn_port.commit();
        self.stlt_conn_encr_type.commit();
    }

    fn rollback_pending(&self) {
        self.core.rollback_components();
        self.address.rollback();
        self.stlt_conn_port.rollback();
        self.stlt_conn_encr_type.rollback();
    }
}

impl Entity for NetInterface {
    type Key = NetInterfaceKey;
    type Record = NetInterfaceRecord;
    const KIND: &'static str = "NetInterface";

    fn key(&self) -> NetInterfaceKey {
        self.key.clone()
    }

    fn uuid(&self) -> Uuid {
        self.core.uuid()
    }

    fn protection(&self) -> &ObjectProtection {
        self.core.protection()
    }

    fn link_parents(self: &Arc<Self>) -> Result<()> {
        self.node.link_net_interface(self.key.name.clone(), self.clone())
    }

    fn unlink_parents(&self) {
        self.node.unlink_net_interface(&self.key.name);
    }
}

// =============================================================================
// Repository Operations
// =============================================================================

impl Repository {
    /// Create-or-load-or-cache interface `name` of `node`
    pub fn get_net_interface(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        node: &Arc<Node>,
        name: &NetInterfaceName,
        args: NetInterfaceArgs,
        create_if_missing: bool,
        fail_if_existing: bool,
    ) -> Result<Option<Arc<NetInterface>>> {
        let key = NetInterfaceKey::new(node.name().clone(), name.clone());
        let found = self.net_ifaces.get_instance(
            &self.stats,
            ctx,
            self.drivers.net_interfaces.as_ref(),
            &key,
            create_if_missing,
            fail_if_existing,
            |record| self.restore_net_interface(record),
            || {
                node.require(acc, AccessType::Change)?;

                let core = EntityCore::create(
                    NetInterface::KIND,
                    key.to_string(),
                    args.uuid,
                    acc,
                    &args.flags,
                    NetInterface::props_instance(&key),
                    self.drivers.props.clone(),
                );
                Ok(NetInterface::assemble(
                    core,
                    node.clone(),
                    name.clone(),
                    args.address,
                    args.satellite_connection,
                    self.drivers.net_interfaces.clone(),
                ))
            },
        )?;
        visible(acc, found)
    }

    /// Cached or stored network interface
    pub fn net_interface(&self, key: &NetInterfaceKey) -> Result<Option<Arc<NetInterface>>> {
        self.net_ifaces.lookup(
            &self.stats,
            self.drivers.net_interfaces.as_ref(),
            key,
            |record| self.restore_net_interface(record),
        )
    }

    pub fn net_interfaces(&self) -> Vec<Arc<NetInterface>> {
        self.net_ifaces.values()
    }

    pub fn delete_net_interface(
        &self,
        acc: &AccessContext,
        ctx: &TransactionContext,
        net_if: &Arc<NetInterface>,
    ) -> Result<()> {
        net_if.node.require(acc, AccessType::Change)?;
        net_if.core.require(acc, AccessType::Control)?;
        ctx.attach(net_if)?;
        net_if.core.mark_deleted(acc)?;
        self.net_ifaces.remove(&self.stats, ctx, net_if)
    }

    pub(crate) fn restore_net_interface(&self, record: NetInterfaceRecord) -> Result<Arc<NetInterface>> {
        let key = record.key();
        let node = self
            .node(&record.node_name)?
            .ok_or_else(|| dangling(NetInterface::KIND, &key, Node::KIND, &record.node_name))?;
        let satellite_connection = record.satellite_connection()?;

        let core = EntityCore::restore(
            NetInterface::KIND,
            key.to_string(),
            record.uuid,
            record.flags,
            NetInterface::props_instance(&key),
            self.drivers.props.clone(),
        )?;
        Ok(NetInterface::assemble(
            core,
            node,
            record.name,
            record.address,
            satellite_connection,
            self.drivers.net_interfaces.clone(),
        ))
    }
}
