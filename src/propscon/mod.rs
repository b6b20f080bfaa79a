//! Property Containers
//!
//! Hierarchical, namespaced key/value stores scoped to one entity instance,
//! plus read-only views and priority chains over them.

mod container;
mod priority;

pub use container::{PropsContainer, PATH_MAX_LENGTH, PATH_SEPARATOR};
pub use priority::{PriorityProps, ReadOnlyProps};

/// Top-level instance path prefixes, one per entity kind
pub mod paths {
    pub const NODES: &str = "NODES";
    pub const RESOURCE_DEFINITIONS: &str = "RESOURCE_DEFINITIONS";
    pub const RESOURCES: &str = "RESOURCES";
    pub const VOLUME_DEFINITIONS: &str = "VOLUME_DEFINITIONS";
    pub const VOLUMES: &str = "VOLUMES";
    pub const STOR_POOL_DEFINITIONS: &str = "STOR_POOL_DEFINITIONS";
    pub const STOR_POOLS: &str = "STOR_POOLS";
    pub const NET_INTERFACES: &str = "NET_INTERFACES";
    pub const NODE_CONNECTIONS: &str = "CONDFN/NODES";
    pub const RESOURCE_CONNECTIONS: &str = "CONDFN/RESOURCES";
    pub const VOLUME_CONNECTIONS: &str = "CONDFN/VOLUMES";

    /// Join path segments below a prefix
    pub fn instance<I, S>(prefix: &str, parts: I) -> String
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        parts.into_iter().fold(prefix.to_string(), |mut path, part| {
            path.push('/');
            path.push_str(part.as_ref());
            path
        })
    }
}
