//! Persistence Drivers
//!
//! Entities translate themselves to plain [`Record`]s; a
//! [`PersistenceDriver`] stores records of one kind. The controller binds
//! every kind to a [`ControllerDatabase`], a satellite to the no-op
//! [`SatelliteDatabase`]. Entity code never branches on which one it has.

mod controller;
mod satellite;

pub use controller::ControllerDatabase;
pub use satellite::SatelliteDatabase;

use crate::error::Result;
use crate::objects::{
    NetInterfaceRecord, NodeConnectionRecord, NodeRecord, ResourceConnectionRecord, ResourceDefinitionRecord,
    ResourceRecord, StorPoolDefinitionRecord, StorPoolRecord, VolumeConnectionRecord,
    VolumeDefinitionRecord, VolumeRecord,
};
use crate::transaction::TransactionalStore;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Name of the column every record stores its flag mask in
pub const FLAGS_FIELD: &str = "flags";

// =============================================================================
// Record
// =============================================================================

/// Persisted row of one entity kind
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Natural key
    type Key: Clone + fmt::Display + Send + Sync;

    /// Table name
    const TABLE: &'static str;

    fn key(&self) -> Self::Key;

    /// Normalized primary key string
    fn row_key(key: &Self::Key) -> String;
}

// =============================================================================
// Driver Traits
// =============================================================================

/// Store access for one entity kind
pub trait PersistenceDriver<R: Record>: Send + Sync {
    /// Insert a new row. Fails if the key is taken.
    fn create(&self, record: &R) -> Result<()>;

    /// Load one row by natural key
    fn load(&self, key: &R::Key) -> Result<Option<R>>;

    /// Load every row of the table
    fn load_all(&self) -> Result<Vec<R>>;

    /// Remove a row
    fn delete(&self, key: &R::Key) -> Result<()>;

    /// Check for a row without loading it
    fn exists(&self, key: &R::Key) -> Result<bool>;

    /// Update a single column of an existing row
    fn update_field(&self, key: &R::Key, field: &'static str, value: serde_json::Value) -> Result<()>;

    /// Update the flag mask column of an existing row
    fn update_flags(&self, key: &R::Key, flags: u64) -> Result<()> {
        self.update_field(key, FLAGS_FIELD, serde_json::Value::from(flags))
    }
}

/// Store access for property containers, addressed by instance path
pub trait PropsDriver: Send + Sync {
    fn persist(&self, instance: &str, key: &str, value: &str) -> Result<()>;

    fn remove(&self, instance: &str, key: &str) -> Result<()>;

    /// Remove every row of an instance
    fn remove_all(&self, instance: &str) -> Result<()>;

    fn load_all(&self, instance: &str) -> Result<BTreeMap<String, String>>;
}

// =============================================================================
// Driver Bundle
// =============================================================================

/// One driver per entity kind plus the props driver and the batch scope
#[derive(Clone)]
pub struct Drivers {
    pub nodes: Arc<dyn PersistenceDriver<NodeRecord>>,
    pub net_interfaces: Arc<dyn PersistenceDriver<NetInterfaceRecord>>,
    pub resource_definitions: Arc<dyn PersistenceDriver<ResourceDefinitionRecord>>,
    pub resources: Arc<dyn PersistenceDriver<ResourceRecord>>,
    pub volume_definitions: Arc<dyn PersistenceDriver<VolumeDefinitionRecord>>,
    pub volumes: Arc<dyn PersistenceDriver<VolumeRecord>>,
    pub stor_pool_definitions: Arc<dyn PersistenceDriver<StorPoolDefinitionRecord>>,
    pub stor_pools: Arc<dyn PersistenceDriver<StorPoolRecord>>,
    pub node_connections: Arc<dyn PersistenceDriver<NodeConnectionRecord>>,
    pub resource_connections: Arc<dyn PersistenceDriver<ResourceConnectionRecord>>,
    pub volume_connections: Arc<dyn PersistenceDriver<VolumeConnectionRecord>>,
    pub props: Arc<dyn PropsDriver>,
    pub store: Arc<dyn TransactionalStore>,
}

impl Drivers {
    /// Every kind backed by the controller database
    pub fn controller(db: Arc<ControllerDatabase>) -> Self {
        Self {
            nodes: db.clone(),
            net_interfaces: db.clone(),
            resource_definitions: db.clone(),
            resources: db.clone(),
            volume_definitions: db.clone(),
            volumes: db.clone(),
            stor_pool_definitions: db.clone(),
            stor_pools: db.clone(),
            node_connections: db.clone(),
            resource_connections: db.clone(),
            volume_connections: db.clone(),
            props: db.clone(),
            store: db,
        }
    }

    /// Every kind backed by the no-op satellite store
    pub fn satellite() -> Self {
        let db = SatelliteDatabase::new();
        Self {
            nodes: db.clone(),
            net_interfaces: db.clone(),
            resource_definitions: db.clone(),
            resources: db.clone(),
            volume_definitions: db.clone(),
            volumes: db.clone(),
            stor_pool_definitions: db.clone(),
            stor_pools: db.clone(),
            node_connections: db.clone(),
            resource_connections: db.clone(),
            volume_connections: db.clone(),
            props: db.clone(),
            store: db,
        }
    }
}

impl fmt::Debug for Drivers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Drivers").finish_non_exhaustive()
    }
}
