//! Domain Entities
//!
//! Nodes, definitions, their per-node instances and the pairwise connection
//! entities. Every entity shares the same skeleton, an [`EntityCore`]:
//!
//! ```text
//! ┌──────────────────────── EntityCore ────────────────────────┐
//! │  uuid (immutable)      natural key (in the entity)         │
//! │  ObjectProtection ──► consulted on every read / write      │
//! │  StateFlags<F> ─┐                                          │
//! │  PropsContainer ├──► TxAnchor (dirty, context, presence)   │
//! │  TxCell ────────┘                                          │
//! └────────────────────────────────────────────────────────────┘
//!
//! Parents reach their children through `LinkMap`s that the children
//! maintain; linking a child does not change the parent's state.
//! ```
//!
//! Entities are only constructed through the [`Repository`](crate::repository::Repository).

pub mod names;
pub mod net_interface;
pub mod node;
pub mod node_connection;
pub mod resource;
pub mod resource_connection;
pub mod resource_definition;
pub mod stor_pool;
pub mod stor_pool_definition;
pub mod volume;
pub mod volume_connection;
pub mod volume_definition;

pub use names::{MinorNumber, NetInterfaceName, NodeName, ResourceName, StorPoolName, VolumeNumber};
pub use net_interface::{
    EncryptionType, NetInterface, NetInterfaceArgs, NetInterfaceFlag, NetInterfaceKey, NetInterfaceRecord,
    SatelliteConnection,
};
pub use node::{Node, NodeArgs, NodeFlag, NodeRecord, NodeType};
pub use node_connection::{NodeConnection, NodeConnectionFlag, NodeConnectionKey, NodeConnectionRecord};
pub use resource::{Resource, ResourceArgs, ResourceFlag, ResourceKey, ResourceRecord};
pub use resource_connection::{
    ResourceConnection, ResourceConnectionFlag, ResourceConnectionKey, ResourceConnectionRecord,
};
pub use resource_definition::{
    ResourceDefinition, ResourceDefinitionArgs, ResourceDefinitionFlag, ResourceDefinitionRecord,
};
pub use stor_pool::{ProviderKind, StorPool, StorPoolArgs, StorPoolFlag, StorPoolKey, StorPoolRecord};
pub use stor_pool_definition::{
    StorPoolDefinition, StorPoolDefinitionArgs, StorPoolDefinitionFlag, StorPoolDefinitionRecord,
};
pub use volume::{Volume, VolumeArgs, VolumeFlag, VolumeKey, VolumeRecord};
pub use volume_connection::{
    VolumeConnection, VolumeConnectionFlag, VolumeConnectionKey, VolumeConnectionRecord,
};
pub use volume_definition::{
    VolumeDefinition, VolumeDefinitionArgs, VolumeDefinitionFlag, VolumeDefinitionKey,
    VolumeDefinitionRecord,
};

use crate::error::{Error, Result};
use crate::persistence::{PersistenceDriver, PropsDriver, Record};
use crate::propscon::{PropsContainer, ReadOnlyProps};
use crate::security::{AccessContext, AccessType, ObjectProtection};
use crate::stateflags::{Flag, StateFlags};
use crate::transaction::{TransactionObject, Transition, TxAnchor, TxCell};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use uuid::Uuid;

// =============================================================================
// Entity Trait
// =============================================================================

/// A cached, persisted domain object
pub trait Entity: TransactionObject + Sized + 'static {
    /// Natural key
    type Key: Clone + Eq + Hash + Ord + fmt::Display + Send + Sync + 'static;

    /// Persisted row
    type Record: Record<Key = Self::Key>;

    /// Kind name for logs and errors
    const KIND: &'static str;

    fn key(&self) -> Self::Key;

    fn uuid(&self) -> Uuid;

    fn protection(&self) -> &ObjectProtection;

    /// Enter this entity into its parents' relationship maps.
    ///
    /// The links are made even if it fails; the error names a parent whose
    /// deletion is pending.
    fn link_parents(self: &Arc<Self>) -> Result<()> {
        Ok(())
    }

    /// Take this entity out of its parents' relationship maps
    fn unlink_parents(&self) {}
}

/// Pass `found` through if `acc` may view it
pub(crate) fn visible<E: Entity>(acc: &AccessContext, found: Option<Arc<E>>) -> Result<Option<Arc<E>>> {
    if let Some(entity) = &found {
        entity.protection().require_access(acc, AccessType::View)?;
    }
    Ok(found)
}

/// Construction arguments shared by the connection kinds
#[derive(Debug, Clone)]
pub struct ConnectionArgs<F> {
    /// Identifier to use instead of a fresh one (satellite apply)
    pub uuid: Option<Uuid>,
    pub flags: Vec<F>,
}

impl<F> Default for ConnectionArgs<F> {
    fn default() -> Self {
        Self {
            uuid: None,
            flags: Vec::new(),
        }
    }
}

// =============================================================================
// Relationship Maps
// =============================================================================

/// Children of one parent, keyed by the part of their key the parent lacks.
///
/// Links are maintained by the children: an entity enters its parents' maps
/// when it is cached and leaves them when it is deleted, and its cache
/// registration reverses that on rollback. Linking never dirties the parent,
/// so requests creating different children of one parent do not contend for
/// the parent's transaction context.
///
/// A parent being deleted seals its maps while they are empty. A child that
/// links into a sealed map learns so from [`LinkMap::link`] and backs out.
pub(crate) struct LinkMap<K, V> {
    inner: Mutex<Links<K, V>>,
}

struct Links<K, V> {
    entries: BTreeMap<K, V>,
    sealed: bool,
}

impl<K: Ord + Clone, V: Clone> LinkMap<K, V> {
    pub(crate) fn new() -> Self {
        Self {
            inner: Mutex::new(Links {
                entries: BTreeMap::new(),
                sealed: false,
            }),
        }
    }

    pub(crate) fn get(&self, key: &K) -> Option<V> {
        self.inner.lock().entries.get(key).cloned()
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub(crate) fn values(&self) -> Vec<V> {
        self.inner.lock().entries.values().cloned().collect()
    }

    /// Insert the link. Returns false if the map is sealed.
    pub(crate) fn link(&self, key: K, value: V) -> bool {
        let mut inner = self.inner.lock();
        inner.entries.insert(key, value);
        !inner.sealed
    }

    pub(crate) fn unlink(&self, key: &K) {
        self.inner.lock().entries.remove(key);
    }

    /// Seal the map if it is empty, otherwise report how many links remain
    pub(crate) fn seal_if_empty(&self) -> std::result::Result<(), usize> {
        let mut inner = self.inner.lock();
        if inner.entries.is_empty() {
            inner.sealed = true;
            Ok(())
        } else {
            Err(inner.entries.len())
        }
    }

    pub(crate) fn unseal(&self) {
        self.inner.lock().sealed = false;
    }
}

// =============================================================================
// Entity Core
// =============================================================================

/// Identity, access guard, flags and properties of one entity
pub struct EntityCore<F: Flag> {
    kind: &'static str,
    key: String,
    uuid: Uuid,
    anchor: Arc<TxAnchor>,
    protection: Arc<ObjectProtection>,
    flags: StateFlags<F>,
    props: PropsContainer,
}

impl<F: Flag> EntityCore<F> {
    /// Core of an entity that is new to the store
    pub(crate) fn create(
        kind: &'static str,
        key: String,
        uuid: Option<Uuid>,
        acc: &AccessContext,
        flags: &[F],
        props_instance: String,
        props_driver: Arc<dyn PropsDriver>,
    ) -> Self {
        let anchor = TxAnchor::created();
        let protection = Arc::new(ObjectProtection::new(acc, format!("{} {}", kind, key)));
        Self {
            kind,
            uuid: uuid.unwrap_or_else(Uuid::new_v4),
            flags: StateFlags::new(anchor.clone(), protection.clone(), F::mask_of(flags)),
            props: PropsContainer::new(props_instance, anchor.clone(), props_driver),
            key,
            anchor,
            protection,
        }
    }

    /// Core of an entity restored from the store
    pub(crate) fn restore(
        kind: &'static str,
        key: String,
        uuid: Uuid,
        flag_bits: u64,
        props_instance: String,
        props_driver: Arc<dyn PropsDriver>,
    ) -> Result<Self> {
        let bits = F::validate_mask(flag_bits)?;
        let anchor = TxAnchor::loaded();
        let protection = Arc::new(ObjectProtection::new(
            &AccessContext::system(),
            format!("{} {}", kind, key),
        ));
        Ok(Self {
            kind,
            uuid,
            flags: StateFlags::new(anchor.clone(), protection.clone(), bits),
            props: PropsContainer::load(props_instance, anchor.clone(), props_driver)?,
            key,
            anchor,
            protection,
        })
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn anchor(&self) -> &TxAnchor {
        &self.anchor
    }

    pub(crate) fn shared_anchor(&self) -> Arc<TxAnchor> {
        self.anchor.clone()
    }

    pub fn protection(&self) -> &ObjectProtection {
        &self.protection
    }

    pub fn is_deleted(&self) -> bool {
        !self.anchor.is_live()
    }

    pub(crate) fn describe(&self) -> String {
        format!("{} {}", self.kind, self.key)
    }

    pub(crate) fn check_live(&self) -> Result<()> {
        if self.anchor.is_live() {
            Ok(())
        } else {
            Err(Error::AccessToDeleted {
                kind: self.kind,
                key: self.key.clone(),
            })
        }
    }

    /// Fail unless the entity is live and `acc` holds `access`
    pub(crate) fn require(&self, acc: &AccessContext, access: AccessType) -> Result<()> {
        self.check_live()?;
        self.protection.require_access(acc, access)
    }

    pub fn flags(&self) -> Result<&StateFlags<F>> {
        self.check_live()?;
        Ok(&self.flags)
    }

    pub fn props(&self, acc: &AccessContext) -> Result<ReadOnlyProps<'_>> {
        self.require(acc, AccessType::View)?;
        Ok(ReadOnlyProps::new(&self.props))
    }

    pub fn props_mut(&self, acc: &AccessContext) -> Result<&PropsContainer> {
        self.require(acc, AccessType::Change)?;
        Ok(&self.props)
    }

    /// Raw flag mask for records, no access check
    pub(crate) fn flag_bits(&self) -> u64 {
        self.flags.raw_bits()
    }

    /// Link `value` into one of this entity's relationship maps
    pub(crate) fn link<K, V>(&self, map: &LinkMap<K, V>, key: K, value: V) -> Result<()>
    where
        K: Ord + Clone,
        V: Clone,
    {
        if map.link(key, value) {
            Ok(())
        } else {
            Err(Error::AccessToDeleted {
                kind: self.kind,
                key: self.key.clone(),
            })
        }
    }

    /// Close `map` to new children ahead of deleting this entity.
    ///
    /// Fails with [`Error::InUse`] while children are linked; `reason`
    /// describes the remaining count.
    pub(crate) fn seal<K, V>(&self, map: &LinkMap<K, V>, reason: impl FnOnce(usize) -> String) -> Result<()>
    where
        K: Ord + Clone,
        V: Clone,
    {
        map.seal_if_empty().map_err(|count| Error::InUse {
            kind: self.kind,
            key: self.key.clone(),
            reason: reason(count),
        })
    }

    /// Mark deleted and drop all properties. Requires CONTROL.
    pub(crate) fn mark_deleted(&self, acc: &AccessContext) -> Result<()> {
        self.require(acc, AccessType::Control)?;
        self.props.delete();
        self.anchor.mark_deleted();
        Ok(())
    }

    /// Write this entity's pending state through `driver`
    pub(crate) fn flush_row<R: Record>(
        &self,
        driver: &dyn PersistenceDriver<R>,
        key: &R::Key,
        record: impl FnOnce() -> R,
        fields: FieldUpdates,
    ) -> Result<()> {
        match self.anchor.transition() {
            Transition::Create => {
                driver.create(&record())?;
                self.props.flush_all()?;
            }
            Transition::Update => {
                if self.flags.is_dirty() {
                    driver.update_flags(key, self.flags.raw_bits())?;
                }
                for (field, value) in fields.0 {
                    driver.update_field(key, field, value)?;
                }
                self.props.flush()?;
            }
            Transition::Delete => {
                self.props.delete_persisted()?;
                driver.delete(key)?;
            }
            Transition::Nothing => {}
        }
        Ok(())
    }

    pub(crate) fn commit_components(&self) {
        self.flags.commit();
        self.props.commit();
    }

    pub(crate) fn rollback_components(&self) {
        self.flags.rollback();
        self.props.rollback();
    }
}

/// Changed columns collected for an update flush
#[derive(Debug, Default)]
pub(crate) struct FieldUpdates(Vec<(&'static str, serde_json::Value)>);

impl FieldUpdates {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Include `cell` if it has uncommitted changes
    pub(crate) fn track<T>(mut self, field: &'static str, cell: &TxCell<T>) -> Result<Self>
    where
        T: Serialize + Clone + PartialEq,
    {
        if cell.is_dirty() {
            self.0.push((field, serde_json::to_value(cell.get())?));
        }
        Ok(self)
    }
}

/// Order two endpoint keys, rejecting a self-connection
pub(crate) fn canonical_pair<T: Ord + Clone + fmt::Display>(a: &T, b: &T) -> Result<(T, T)> {
    match a.cmp(b) {
        std::cmp::Ordering::Less => Ok((a.clone(), b.clone())),
        std::cmp::Ordering::Greater => Ok((b.clone(), a.clone())),
        std::cmp::Ordering::Equal => Err(Error::InvalidConnection(format!(
            "cannot connect {} to itself",
            a
        ))),
    }
}

/// Accessors every entity exposes through its core
macro_rules! entity_accessors {
    ($flag:ty) => {
        /// Immutable identifier
        pub fn uuid(&self) -> ::uuid::Uuid {
            self.core.uuid()
        }

        pub fn flags(&self) -> $crate::error::Result<&$crate::stateflags::StateFlags<$flag>> {
            self.core.flags()
        }

        /// Property reader, requires VIEW
        pub fn props(
            &self,
            acc: &$crate::security::AccessContext,
        ) -> $crate::error::Result<$crate::propscon::ReadOnlyProps<'_>> {
            self.core.props(acc)
        }

        /// Property writer, requires CHANGE
        pub fn props_mut(
            &self,
            acc: &$crate::security::AccessContext,
        ) -> $crate::error::Result<&$crate::propscon::PropsContainer> {
            self.core.props_mut(acc)
        }

        pub fn protection(&self) -> &$crate::security::ObjectProtection {
            self.core.protection()
        }

        pub fn is_deleted(&self) -> bool {
            self.core.is_deleted()
        }
    };
}

pub(crate) use entity_accessors;

/// `Debug` for an entity: kind, natural key, identifier and liveness
macro_rules! entity_debug {
    ($ty:ty) => {
        impl ::std::fmt::Debug for $ty {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_struct(<$ty as $crate::objects::Entity>::KIND)
                    .field("key", &<$ty as $crate::objects::Entity>::key(self).to_string())
                    .field("uuid", &self.core.uuid())
                    .field("deleted", &self.core.is_deleted())
                    .finish_non_exhaustive()
            }
        }
    };
}

pub(crate) use entity_debug;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_map_seals_only_when_empty() {
        let map: LinkMap<&str, u32> = LinkMap::new();
        assert!(map.link("a", 1));
        assert_eq!(map.seal_if_empty(), Err(1));

        map.unlink(&"a");
        assert_eq!(map.seal_if_empty(), Ok(()));

        // Links into a sealed map are kept but reported
        assert!(!map.link("b", 2));
        assert_eq!(map.get(&"b"), Some(2));

        map.unseal();
        assert!(map.link("c", 3));
        assert_eq!(map.values(), vec![2, 3]);
    }
}
