//! Satellite Apply
//!
//! A satellite mirrors state pushed by the controller. Each snapshot is
//! applied through the same repository operations the controller uses:
//! a cached instance is updated in place, a missing one is constructed with
//! the controller's UUID. A cached instance carrying a different UUID means
//! the two sides disagree about identity and fails with
//! [`Error::UuidMismatch`].

use crate::error::{Error, Result};
use crate::objects::{
    ConnectionArgs, EncryptionType, Entity, MinorNumber, NetInterface, NetInterfaceArgs,
    NetInterfaceName, Node, NodeArgs, NodeConnection, NodeConnectionFlag, NodeFlag, NodeName,
    NodeType, ProviderKind, Resource, ResourceArgs, ResourceConnection, ResourceConnectionFlag,
    ResourceDefinition, ResourceDefinitionArgs, ResourceDefinitionFlag, ResourceFlag, ResourceKey,
    ResourceName, SatelliteConnection, StorPool, StorPoolArgs, StorPoolDefinition,
    StorPoolDefinitionArgs, StorPoolDefinitionFlag, StorPoolFlag, StorPoolKey, StorPoolName, Volume,
    VolumeArgs, VolumeConnection, VolumeConnectionFlag, VolumeDefinitionArgs, VolumeDefinitionFlag,
    VolumeFlag, VolumeKey, VolumeNumber,
};
use crate::propscon::PropsContainer;
use crate::repository::Repository;
use crate::security::AccessContext;
use crate::stateflags::Flag;
use crate::transaction::TransactionContext;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

// =============================================================================
// Snapshots
// =============================================================================

/// Controller view of a network interface
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetInterfaceSnapshot {
    pub uuid: Uuid,
    pub name: NetInterfaceName,
    pub address: IpAddr,
    #[serde(default)]
    pub stlt_conn_port: Option<u16>,
    #[serde(default)]
    pub stlt_conn_encr_type: Option<EncryptionType>,
}

impl NetInterfaceSnapshot {
    fn satellite_connection(&self) -> Result<Option<SatelliteConnection>> {
        match (self.stlt_conn_port, self.stlt_conn_encr_type) {
            (Some(port), Some(encryption)) => SatelliteConnection::new(port, encryption).map(Some),
            (None, None) => Ok(None),
            _ => Err(Error::InvalidValue(format!(
                "network interface {} needs both a port and an encryption type",
                self.name
            ))),
        }
    }
}

/// Controller view of a node and its network interfaces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeSnapshot {
    pub uuid: Uuid,
    pub name: NodeName,
    #[serde(default)]
    pub node_type: NodeType,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
    #[serde(default)]
    pub net_interfaces: Vec<NetInterfaceSnapshot>,
}

/// Controller view of a storage pool definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorPoolDefinitionSnapshot {
    pub uuid: Uuid,
    pub name: StorPoolName,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// Controller view of a storage pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorPoolSnapshot {
    pub uuid: Uuid,
    pub node_name: NodeName,
    pub pool_name: StorPoolName,
    #[serde(default)]
    pub provider: ProviderKind,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// Controller view of a volume definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeDefinitionSnapshot {
    pub uuid: Uuid,
    pub vlm_nr: VolumeNumber,
    pub size_kib: u64,
    pub minor_number: MinorNumber,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// Controller view of a resource definition and its volume definitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDefinitionSnapshot {
    pub uuid: Uuid,
    pub name: ResourceName,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
    #[serde(default)]
    pub volume_definitions: Vec<VolumeDefinitionSnapshot>,
}

/// Controller view of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeSnapshot {
    pub uuid: Uuid,
    pub vlm_nr: VolumeNumber,
    pub stor_pool_name: StorPoolName,
    #[serde(default)]
    pub block_device_path: Option<String>,
    #[serde(default)]
    pub meta_disk_path: Option<String>,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// Controller view of a resource and its volumes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceSnapshot {
    pub uuid: Uuid,
    pub node_name: NodeName,
    pub resource_name: ResourceName,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
    #[serde(default)]
    pub volumes: Vec<VolumeSnapshot>,
}

/// Controller view of a node connection. Endpoint order is irrelevant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConnectionSnapshot {
    pub uuid: Uuid,
    pub node_a: NodeName,
    pub node_b: NodeName,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// Controller view of a connection between two deployments of a resource
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConnectionSnapshot {
    pub uuid: Uuid,
    pub resource_name: ResourceName,
    pub node_a: NodeName,
    pub node_b: NodeName,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// Controller view of a connection between two deployments of a volume
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConnectionSnapshot {
    pub uuid: Uuid,
    pub resource_name: ResourceName,
    pub vlm_nr: VolumeNumber,
    pub node_a: NodeName,
    pub node_b: NodeName,
    #[serde(default)]
    pub flags: Vec<String>,
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

// =============================================================================
// Satellite Sync
// =============================================================================

/// Applies controller snapshots to a satellite repository
pub struct SatelliteSync {
    repo: Arc<Repository>,
    acc: AccessContext,
}

impl SatelliteSync {
    pub fn new(repo: Arc<Repository>) -> Self {
        Self {
            repo,
            acc: AccessContext::system(),
        }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    pub fn apply_node(&self, ctx: &TransactionContext, snap: &NodeSnapshot) -> Result<Arc<Node>> {
        let flags = flags_of::<NodeFlag>(&snap.flags)?;
        let args = NodeArgs {
            uuid: Some(snap.uuid),
            node_type: snap.node_type,
            flags: flags.clone(),
        };
        let node = self
            .repo
            .get_node(&self.acc, ctx, &snap.name, args, true, false)?
            .ok_or_else(|| not_found(Node::KIND, &snap.name))?;
        check_uuid(node.as_ref(), snap.uuid)?;

        ctx.attach(&node)?;
        node.set_node_type(&self.acc, snap.node_type)?;
        node.flags()?.reset_flags_to(&self.acc, &flags)?;
        apply_props(node.props_mut(&self.acc)?, &snap.props)?;

        let pushed: BTreeSet<&NetInterfaceName> =
            snap.net_interfaces.iter().map(|ni| &ni.name).collect();
        for stale in node.net_interfaces(&self.acc)? {
            if !pushed.contains(stale.name()) {
                self.repo.delete_net_interface(&self.acc, ctx, &stale)?;
            }
        }
        for ni in &snap.net_interfaces {
            self.apply_net_interface(ctx, &node, ni)?;
        }
        debug!(node = %snap.name, net_interfaces = snap.net_interfaces.len(), "Applied node");
        Ok(node)
    }

    fn apply_net_interface(
        &self,
        ctx: &TransactionContext,
        node: &Arc<Node>,
        snap: &NetInterfaceSnapshot,
    ) -> Result<Arc<NetInterface>> {
        let satellite_connection = snap.satellite_connection()?;
        let args = NetInterfaceArgs {
            uuid: Some(snap.uuid),
            satellite_connection,
            ..NetInterfaceArgs::new(snap.address)
        };
        let net_if = self
            .repo
            .get_net_interface(&self.acc, ctx, node, &snap.name, args, true, false)?
            .ok_or_else(|| not_found(NetInterface::KIND, &snap.name))?;
        check_uuid(net_if.as_ref(), snap.uuid)?;

        ctx.attach(&net_if)?;
        net_if.set_address(&self.acc, snap.address)?;
        net_if.set_satellite_connection(&self.acc, satellite_connection)?;
        Ok(net_if)
    }

    pub fn apply_stor_pool_definition(
        &self,
        ctx: &TransactionContext,
        snap: &StorPoolDefinitionSnapshot,
    ) -> Result<Arc<StorPoolDefinition>> {
        let flags = flags_of::<StorPoolDefinitionFlag>(&snap.flags)?;
        let args = StorPoolDefinitionArgs {
            uuid: Some(snap.uuid),
            flags: flags.clone(),
        };
        let spd = self
            .repo
            .get_stor_pool_definition(&self.acc, ctx, &snap.name, args, true, false)?
            .ok_or_else(|| not_found(StorPoolDefinition::KIND, &snap.name))?;
        check_uuid(spd.as_ref(), snap.uuid)?;

        ctx.attach(&spd)?;
        spd.flags()?.reset_flags_to(&self.acc, &flags)?;
        apply_props(spd.props_mut(&self.acc)?, &snap.props)?;
        debug!(stor_pool_definition = %snap.name, "Applied storage pool definition");
        Ok(spd)
    }

    /// Apply a storage pool. Its node and definition must have been applied.
    pub fn apply_stor_pool(&self, ctx: &TransactionContext, snap: &StorPoolSnapshot) -> Result<Arc<StorPool>> {
        let node = self
            .repo
            .node(&snap.node_name)?
            .ok_or_else(|| not_found(Node::KIND, &snap.node_name))?;
        let spd = self
            .repo
            .stor_pool_definition(&snap.pool_name)?
            .ok_or_else(|| not_found(StorPoolDefinition::KIND, &snap.pool_name))?;

        let flags = flags_of::<StorPoolFlag>(&snap.flags)?;
        let args = StorPoolArgs {
            uuid: Some(snap.uuid),
            provider: snap.provider,
            flags: flags.clone(),
        };
        let pool = self
            .repo
            .get_stor_pool(&self.acc, ctx, &node, &spd, args, true, false)?
            .ok_or_else(|| {
                not_found(
                    StorPool::KIND,
                    StorPoolKey::new(snap.node_name.clone(), snap.pool_name.clone()),
                )
            })?;
        check_uuid(pool.as_ref(), snap.uuid)?;

        ctx.attach(&pool)?;
        pool.flags()?.reset_flags_to(&self.acc, &flags)?;
        apply_props(pool.props_mut(&self.acc)?, &snap.props)?;
        Ok(pool)
    }

    /// Apply a resource definition. Volume definitions missing from the
    /// snapshot are deleted.
    pub fn apply_resource_definition(
        &self,
        ctx: &TransactionContext,
        snap: &ResourceDefinitionSnapshot,
    ) -> Result<Arc<ResourceDefinition>> {
        let acc = &self.acc;
        let flags = flags_of::<ResourceDefinitionFlag>(&snap.flags)?;
        let args = ResourceDefinitionArgs {
            uuid: Some(snap.uuid),
            flags: flags.clone(),
        };
        let rsc_dfn = self
            .repo
            .get_resource_definition(acc, ctx, &snap.name, args, true, false)?
            .ok_or_else(|| not_found(ResourceDefinition::KIND, &snap.name))?;
        check_uuid(rsc_dfn.as_ref(), snap.uuid)?;

        ctx.attach(&rsc_dfn)?;
        rsc_dfn.flags()?.reset_flags_to(acc, &flags)?;
        apply_props(rsc_dfn.props_mut(acc)?, &snap.props)?;

        let pushed: BTreeSet<VolumeNumber> =
            snap.volume_definitions.iter().map(|vd| vd.vlm_nr).collect();
        for stale in rsc_dfn.volume_definitions(acc)? {
            if !pushed.contains(&stale.volume_number()) {
                self.repo.delete_volume_definition(acc, ctx, &stale)?;
            }
        }

        for vd in &snap.volume_definitions {
            let flags = flags_of::<VolumeDefinitionFlag>(&vd.flags)?;
            let args = VolumeDefinitionArgs {
                uuid: Some(vd.uuid),
                size_kib: vd.size_kib,
                minor_number: Some(vd.minor_number),
                flags: flags.clone(),
            };
            let vlm_dfn = self
                .repo
                .get_volume_definition(acc, ctx, &rsc_dfn, vd.vlm_nr, args, true, false)?
                .ok_or_else(|| not_found("VolumeDefinition", vd.vlm_nr))?;
            check_uuid(vlm_dfn.as_ref(), vd.uuid)?;

            ctx.attach(&vlm_dfn)?;
            vlm_dfn.set_volume_size(acc, vd.size_kib)?;
            vlm_dfn.set_minor_number(acc, vd.minor_number)?;
            vlm_dfn.flags()?.reset_flags_to(acc, &flags)?;
            apply_props(vlm_dfn.props_mut(acc)?, &vd.props)?;
        }

        info!(
            rsc_dfn = %snap.name,
            volume_definitions = snap.volume_definitions.len(),
            "Applied resource definition"
        );
        Ok(rsc_dfn)
    }

    /// Apply a resource and its volumes. The node, the resource definition
    /// and every referenced storage pool must have been applied. Volumes
    /// missing from the snapshot are deleted.
    pub fn apply_resource(&self, ctx: &TransactionContext, snap: &ResourceSnapshot) -> Result<Arc<Resource>> {
        let acc = &self.acc;
        let node = self
            .repo
            .node(&snap.node_name)?
            .ok_or_else(|| not_found(Node::KIND, &snap.node_name))?;
        let rsc_dfn = self
            .repo
            .resource_definition(&snap.resource_name)?
            .ok_or_else(|| not_found(ResourceDefinition::KIND, &snap.resource_name))?;

        let flags = flags_of::<ResourceFlag>(&snap.flags)?;
        let args = ResourceArgs {
            uuid: Some(snap.uuid),
            flags: flags.clone(),
        };
        let rsc = self
            .repo
            .get_resource(acc, ctx, &node, &rsc_dfn, args, true, false)?
            .ok_or_else(|| not_found(Resource::KIND, &snap.resource_name))?;
        check_uuid(rsc.as_ref(), snap.uuid)?;

        ctx.attach(&rsc)?;
        rsc.flags()?.reset_flags_to(acc, &flags)?;
        apply_props(rsc.props_mut(acc)?, &snap.props)?;

        let pushed: BTreeSet<VolumeNumber> = snap.volumes.iter().map(|v| v.vlm_nr).collect();
        for stale in rsc.volumes(acc)? {
            if !pushed.contains(&stale.volume_number()) {
                self.repo.delete_volume(acc, ctx, &stale)?;
            }
        }

        for vs in &snap.volumes {
            let vlm_dfn = rsc_dfn
                .volume_definition(acc, vs.vlm_nr)?
                .ok_or_else(|| not_found("VolumeDefinition", format!("{}/{}", snap.resource_name, vs.vlm_nr)))?;
            let pool_key = StorPoolKey::new(snap.node_name.clone(), vs.stor_pool_name.clone());
            let pool = self
                .repo
                .stor_pool(&pool_key)?
                .ok_or_else(|| not_found(StorPool::KIND, &pool_key))?;

            let flags = flags_of::<VolumeFlag>(&vs.flags)?;
            let args = VolumeArgs {
                uuid: Some(vs.uuid),
                block_device_path: vs.block_device_path.clone(),
                meta_disk_path: vs.meta_disk_path.clone(),
                flags: flags.clone(),
            };
            let vlm = self
                .repo
                .get_volume(acc, ctx, &rsc, &vlm_dfn, &pool, args, true, false)?
                .ok_or_else(|| not_found("Volume", vs.vlm_nr))?;
            check_uuid(vlm.as_ref(), vs.uuid)?;

            ctx.attach(&vlm)?;
            vlm.set_block_device_path(acc, vs.block_device_path.clone())?;
            vlm.set_meta_disk_path(acc, vs.meta_disk_path.clone())?;
            vlm.flags()?.reset_flags_to(acc, &flags)?;
            apply_props(vlm.props_mut(acc)?, &vs.props)?;
        }

        info!(
            node = %snap.node_name,
            rsc = %snap.resource_name,
            volumes = snap.volumes.len(),
            "Applied resource"
        );
        Ok(rsc)
    }

    /// Apply a node connection. Both nodes must have been applied.
    pub fn apply_node_connection(
        &self,
        ctx: &TransactionContext,
        snap: &NodeConnectionSnapshot,
    ) -> Result<Arc<NodeConnection>> {
        let node_a = self
            .repo
            .node(&snap.node_a)?
            .ok_or_else(|| not_found(Node::KIND, &snap.node_a))?;
        let node_b = self
            .repo
            .node(&snap.node_b)?
            .ok_or_else(|| not_found(Node::KIND, &snap.node_b))?;

        let flags = flags_of::<NodeConnectionFlag>(&snap.flags)?;
        let args = ConnectionArgs {
            uuid: Some(snap.uuid),
            flags: flags.clone(),
        };
        let conn = self
            .repo
            .get_node_connection(&self.acc, ctx, &node_a, &node_b, args, true, false)?
            .ok_or_else(|| {
                not_found(NodeConnection::KIND, format!("{}/{}", snap.node_a, snap.node_b))
            })?;
        check_uuid(conn.as_ref(), snap.uuid)?;

        ctx.attach(&conn)?;
        conn.flags()?.reset_flags_to(&self.acc, &flags)?;
        apply_props(conn.props_mut(&self.acc)?, &snap.props)?;
        debug!(conn = %conn.key(), "Applied node connection");
        Ok(conn)
    }

    /// Apply a resource connection. Both resources must have been applied.
    pub fn apply_resource_connection(
        &self,
        ctx: &TransactionContext,
        snap: &ResourceConnectionSnapshot,
    ) -> Result<Arc<ResourceConnection>> {
        let key_a = ResourceKey::new(snap.node_a.clone(), snap.resource_name.clone());
        let rsc_a = self
            .repo
            .resource(&key_a)?
            .ok_or_else(|| not_found(Resource::KIND, &key_a))?;
        let key_b = ResourceKey::new(snap.node_b.clone(), snap.resource_name.clone());
        let rsc_b = self
            .repo
            .resource(&key_b)?
            .ok_or_else(|| not_found(Resource::KIND, &key_b))?;

        let flags = flags_of::<ResourceConnectionFlag>(&snap.flags)?;
        let args = ConnectionArgs {
            uuid: Some(snap.uuid),
            flags: flags.clone(),
        };
        let conn = self
            .repo
            .get_resource_connection(&self.acc, ctx, &rsc_a, &rsc_b, args, true, false)?
            .ok_or_else(|| {
                not_found(ResourceConnection::KIND, format!("{}/{}", key_a, snap.node_b))
            })?;
        check_uuid(conn.as_ref(), snap.uuid)?;

        ctx.attach(&conn)?;
        conn.flags()?.reset_flags_to(&self.acc, &flags)?;
        apply_props(conn.props_mut(&self.acc)?, &snap.props)?;
        debug!(conn = %conn.key(), "Applied resource connection");
        Ok(conn)
    }

    /// Apply a volume connection. Both volumes must have been applied.
    pub fn apply_volume_connection(
        &self,
        ctx: &TransactionContext,
        snap: &VolumeConnectionSnapshot,
    ) -> Result<Arc<VolumeConnection>> {
        let key_a = VolumeKey::new(snap.node_a.clone(), snap.resource_name.clone(), snap.vlm_nr);
        let vlm_a = self
            .repo
            .volume(&key_a)?
            .ok_or_else(|| not_found(Volume::KIND, &key_a))?;
        let key_b = VolumeKey::new(snap.node_b.clone(), snap.resource_name.clone(), snap.vlm_nr);
        let vlm_b = self
            .repo
            .volume(&key_b)?
            .ok_or_else(|| not_found(Volume::KIND, &key_b))?;

        let flags = flags_of::<VolumeConnectionFlag>(&snap.flags)?;
        let args = ConnectionArgs {
            uuid: Some(snap.uuid),
            flags: flags.clone(),
        };
        let conn = self
            .repo
            .get_volume_connection(&self.acc, ctx, &vlm_a, &vlm_b, args, true, false)?
            .ok_or_else(|| {
                not_found(VolumeConnection::KIND, format!("{}/{}", key_a, snap.node_b))
            })?;
        check_uuid(conn.as_ref(), snap.uuid)?;

        ctx.attach(&conn)?;
        conn.flags()?.reset_flags_to(&self.acc, &flags)?;
        apply_props(conn.props_mut(&self.acc)?, &snap.props)?;
        debug!(conn = %conn.key(), "Applied volume connection");
        Ok(conn)
    }
}

impl std::fmt::Debug for SatelliteSync {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SatelliteSync").field("repo", &self.repo).finish()
    }
}

fn flags_of<F: Flag>(names: &[String]) -> Result<Vec<F>> {
    F::restore_flags(F::from_name_list(names)?)
}

fn check_uuid<E: Entity>(entity: &E, remote: Uuid) -> Result<()> {
    let local = entity.uuid();
    if local != remote {
        return Err(Error::UuidMismatch {
            kind: E::KIND,
            key: entity.key().to_string(),
            local,
            remote,
        });
    }
    Ok(())
}

fn not_found(kind: &'static str, key: impl std::fmt::Display) -> Error {
    Error::NotFound {
        kind,
        key: key.to_string(),
    }
}

/// Make `props` hold exactly `entries`
fn apply_props(props: &PropsContainer, entries: &BTreeMap<String, String>) -> Result<()> {
    props.set_all_props(entries, None)?;
    let keys: Vec<&String> = entries.keys().collect();
    props.retain_all_props(&keys, None)?;
    Ok(())
}
