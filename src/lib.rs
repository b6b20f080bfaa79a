//! Storage Controller Core
//!
//! The entity repository and transactional consistency core of a cluster
//! storage controller: nodes and their network interfaces, resource and
//! volume definitions, their per-node deployments, storage pools and the
//! connections between them, cached as single shared instances and mutated
//! only inside transaction contexts.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                  RequestExecutor  /  SatelliteSync                          │
//! │            (one TransactionContext per request or snapshot)                 │
//! ├─────────────────────────────────────────────────────────────────────────────┤
//! │                              Repository                                     │
//! │  ┌──────────────┐ ┌──────────────┐ ┌──────────────┐ ┌────────────────────┐  │
//! │  │ EntityCache  │ │ EntityCache  │ │     ...      │ │  NumberPool        │  │
//! │  │   <Node>     │ │ <Resource>   │ │  (11 kinds)  │ │  (minor numbers)   │  │
//! │  └──────┬───────┘ └──────┬───────┘ └──────┬───────┘ └────────────────────┘  │
//! │         └────────────────┼────────────────┘                                 │
//! ├──────────────────────────┼──────────────────────────────────────────────────┤
//! │                   Entity = EntityCore                                       │
//! │     ObjectProtection · StateFlags · PropsContainer · TxCell · LinkMap       │
//! ├──────────────────────────┼──────────────────────────────────────────────────┤
//! │                   PersistenceDriver / PropsDriver                           │
//! │  ┌─────────────────────────────┐  ┌─────────────────────────────────────┐   │
//! │  │  ControllerDatabase         │  │  SatelliteDatabase                  │   │
//! │  │  (tables, JSON file)        │  │  (no-op)                            │   │
//! │  └─────────────────────────────┘  └─────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`repository`]: create-or-load-or-cache factory and entity caches
//! - [`objects`]: the entity kinds and their repository operations
//! - [`transaction`]: transaction contexts and transactional cells
//! - [`stateflags`]: transactional flag sets
//! - [`propscon`]: hierarchical property containers and priority lookup
//! - [`persistence`]: drivers and the controller/satellite stores
//! - [`numberpool`]: minor number allocation
//! - [`security`]: access contexts and object protection
//! - [`executor`]: request-scoped units of work
//! - [`satellite`]: applying controller snapshots on a satellite
//! - [`config`]: core configuration
//! - [`error`]: error types and handling

pub mod config;
pub mod error;
pub mod executor;
pub mod numberpool;
pub mod objects;
pub mod persistence;
pub mod propscon;
pub mod repository;
pub mod satellite;
pub mod security;
pub mod stateflags;
pub mod transaction;

// Re-export commonly used types
pub use config::{CoreConfig, MinorRange, Mode};

pub use error::{Error, ErrorClass, Result};

pub use executor::RequestExecutor;

pub use numberpool::{BitmapPool, NumberPool, DEFAULT_MINOR_RANGE};

pub use objects::{
    ConnectionArgs, EncryptionType, Entity, MinorNumber, NetInterface, NetInterfaceArgs, NetInterfaceKey,
    NetInterfaceName, Node, NodeArgs, NodeConnection, NodeFlag, NodeName,
    NodeType, ProviderKind, Resource, ResourceArgs, ResourceConnection, ResourceDefinition,
    ResourceDefinitionArgs, ResourceKey, ResourceName, StorPool, StorPoolArgs, StorPoolDefinition,
    StorPoolDefinitionArgs, StorPoolKey, StorPoolName, Volume, VolumeArgs, VolumeConnection,
    VolumeDefinition, VolumeDefinitionArgs, VolumeDefinitionKey, VolumeKey, VolumeNumber,
};

pub use persistence::{ControllerDatabase, SatelliteDatabase};

pub use propscon::{PriorityProps, PropsContainer, ReadOnlyProps};

pub use repository::{Repository, RepositoryStatsSnapshot};

pub use satellite::SatelliteSync;

pub use security::{AccessContext, AccessType, ObjectProtection};

pub use stateflags::{Flag, StateFlags};

pub use transaction::TransactionContext;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
