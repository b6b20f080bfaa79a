//! Transactional property container
//!
//! Keys are stored relative to the container's instance path. A namespace is
//! simply a key prefix; `Aux/site` lives in namespace `Aux`.

use crate::error::{Error, Result};
use crate::persistence::PropsDriver;
use crate::transaction::TxAnchor;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::trace;

/// Separator between namespace segments
pub const PATH_SEPARATOR: char = '/';

/// Longest accepted key, namespace included
pub const PATH_MAX_LENGTH: usize = 256;

fn segments(path: &str) -> impl Iterator<Item = &str> {
    path.split(PATH_SEPARATOR).filter(|seg| !seg.is_empty())
}

/// Collapse repeated separators and strip leading/trailing ones
fn sanitize(path: &str) -> String {
    segments(path).collect::<Vec<_>>().join("/")
}

/// Container-relative key for `key` in `namespace`
pub(crate) fn full_key(key: &str, namespace: Option<&str>) -> Result<String> {
    let invalid = |reason: &str| Error::InvalidKey {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.is_empty() || key.ends_with(PATH_SEPARATOR) {
        return Err(invalid("key must not be empty"));
    }
    let joined = match namespace {
        Some(ns) => format!("{}/{}", ns, key),
        None => key.to_string(),
    };
    let path = sanitize(&joined);
    if path.is_empty() {
        return Err(invalid("key must not be empty"));
    }
    if path.len() > PATH_MAX_LENGTH {
        return Err(invalid("key exceeds maximum path length"));
    }
    Ok(path)
}

/// Prefix (with trailing separator) selecting everything in `namespace`
pub(crate) fn namespace_prefix(namespace: Option<&str>) -> String {
    match namespace.map(sanitize) {
        Some(ns) if !ns.is_empty() => format!("{}/", ns),
        _ => String::new(),
    }
}

// =============================================================================
// Props Container
// =============================================================================

#[derive(Debug, Default)]
struct PropsState {
    map: BTreeMap<String, String>,
    /// Value at last commit for every key touched since
    originals: BTreeMap<String, Option<String>>,
}

impl PropsState {
    fn record(&mut self, key: &str) {
        if !self.originals.contains_key(key) {
            let original = self.map.get(key).cloned();
            self.originals.insert(key.to_string(), original);
        }
    }

    fn put(&mut self, key: String, value: String) -> (Option<String>, bool) {
        if self.map.get(&key) == Some(&value) {
            return (Some(value), false);
        }
        self.record(&key);
        (self.map.insert(key, value), true)
    }

    fn take(&mut self, key: &str) -> Option<String> {
        if !self.map.contains_key(key) {
            return None;
        }
        self.record(key);
        self.map.remove(key)
    }

    fn keys_in(&self, prefix: &str) -> Vec<String> {
        self.map
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect()
    }
}

/// Property container of one entity
pub struct PropsContainer {
    instance: String,
    anchor: Arc<TxAnchor>,
    driver: Arc<dyn PropsDriver>,
    state: Mutex<PropsState>,
}

impl PropsContainer {
    /// Empty container for a new entity
    pub fn new(instance: impl Into<String>, anchor: Arc<TxAnchor>, driver: Arc<dyn PropsDriver>) -> Self {
        Self {
            instance: instance.into(),
            anchor,
            driver,
            state: Mutex::new(PropsState::default()),
        }
    }

    /// Container populated from the persisted rows of `instance`
    pub fn load(instance: impl Into<String>, anchor: Arc<TxAnchor>, driver: Arc<dyn PropsDriver>) -> Result<Self> {
        let instance = instance.into();
        let map = driver.load_all(&instance)?;
        trace!(instance = %instance, count = map.len(), "Loaded properties");
        Ok(Self {
            instance,
            anchor,
            driver,
            state: Mutex::new(PropsState {
                map,
                originals: BTreeMap::new(),
            }),
        })
    }

    /// Instance path this container is scoped to, e.g. `NODES/ALPHA`
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn get_prop(&self, key: &str, namespace: Option<&str>) -> Result<Option<String>> {
        let key = full_key(key, namespace)?;
        Ok(self.state.lock().map.get(&key).cloned())
    }

    /// Set a property, returning the previous value
    pub fn set_prop(&self, key: &str, value: &str, namespace: Option<&str>) -> Result<Option<String>> {
        let key = full_key(key, namespace)?;
        let (old, changed) = self.state.lock().put(key, value.to_string());
        if changed {
            self.anchor.touch();
        }
        Ok(old)
    }

    /// Remove a property, returning the removed value
    pub fn remove_prop(&self, key: &str, namespace: Option<&str>) -> Result<Option<String>> {
        let key = full_key(key, namespace)?;
        let old = self.state.lock().take(&key);
        if old.is_some() {
            self.anchor.touch();
        }
        Ok(old)
    }

    /// Set every entry of `entries` in `namespace`. Either all keys are valid
    /// and applied, or nothing changes. Returns whether anything changed.
    pub fn set_all_props(&self, entries: &BTreeMap<String, String>, namespace: Option<&str>) -> Result<bool> {
        let resolved = entries
            .iter()
            .map(|(key, value)| Ok((full_key(key, namespace)?, value.clone())))
            .collect::<Result<Vec<_>>>()?;

        let changed = {
            let mut st = self.state.lock();
            resolved
                .into_iter()
                .fold(false, |changed, (key, value)| st.put(key, value).1 || changed)
        };
        if changed {
            self.anchor.touch();
        }
        Ok(changed)
    }

    /// Remove every listed key in `namespace`. Returns whether anything changed.
    pub fn remove_all_props<S: AsRef<str>>(&self, keys: &[S], namespace: Option<&str>) -> Result<bool> {
        let resolved = keys
            .iter()
            .map(|key| full_key(key.as_ref(), namespace))
            .collect::<Result<Vec<_>>>()?;

        let changed = {
            let mut st = self.state.lock();
            resolved
                .iter()
                .fold(false, |changed, key| st.take(key).is_some() || changed)
        };
        if changed {
            self.anchor.touch();
        }
        Ok(changed)
    }

    /// Keep only the listed keys within `namespace`, removing every other key
    /// below it. Returns whether anything changed.
    pub fn retain_all_props<S: AsRef<str>>(&self, keys: &[S], namespace: Option<&str>) -> Result<bool> {
        let keep = keys
            .iter()
            .map(|key| full_key(key.as_ref(), namespace))
            .collect::<Result<BTreeSet<_>>>()?;
        let prefix = namespace_prefix(namespace);

        let changed = {
            let mut st = self.state.lock();
            let doomed: Vec<String> = st
                .keys_in(&prefix)
                .into_iter()
                .filter(|key| !keep.contains(key))
                .collect();
            doomed
                .iter()
                .fold(false, |changed, key| st.take(key).is_some() || changed)
        };
        if changed {
            self.anchor.touch();
        }
        Ok(changed)
    }

    /// Remove every key below `namespace`. Returns whether anything changed.
    pub fn remove_namespace(&self, namespace: &str) -> Result<bool> {
        let prefix = namespace_prefix(Some(namespace));
        if prefix.is_empty() {
            return Err(Error::InvalidKey {
                key: namespace.to_string(),
                reason: "namespace must not be empty".to_string(),
            });
        }
        let changed = {
            let mut st = self.state.lock();
            let doomed = st.keys_in(&prefix);
            doomed
                .iter()
                .fold(false, |changed, key| st.take(key).is_some() || changed)
        };
        if changed {
            self.anchor.touch();
        }
        Ok(changed)
    }

    /// Immediate child namespaces of `namespace` (the root for `None`)
    pub fn iterate_namespaces(&self, namespace: Option<&str>) -> Vec<String> {
        let prefix = namespace_prefix(namespace);
        let st = self.state.lock();
        st.map
            .keys()
            .filter_map(|key| key.strip_prefix(prefix.as_str()))
            .filter_map(|rest| rest.split_once(PATH_SEPARATOR).map(|(ns, _)| ns.to_string()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Entries below `namespace` with keys relative to it
    pub fn namespace_map(&self, namespace: Option<&str>) -> BTreeMap<String, String> {
        let prefix = namespace_prefix(namespace);
        let st = self.state.lock();
        st.map
            .iter()
            .filter_map(|(key, value)| {
                key.strip_prefix(prefix.as_str())
                    .map(|rel| (rel.to_string(), value.clone()))
            })
            .collect()
    }

    pub fn keys(&self) -> Vec<String> {
        self.state.lock().map.keys().cloned().collect()
    }

    pub fn map(&self) -> BTreeMap<String, String> {
        self.state.lock().map.clone()
    }

    pub fn size(&self) -> usize {
        self.state.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().map.is_empty()
    }

    /// Remove every property
    pub fn clear(&self) {
        let changed = {
            let mut st = self.state.lock();
            let doomed = st.keys_in("");
            doomed
                .iter()
                .fold(false, |changed, key| st.take(key).is_some() || changed)
        };
        if changed {
            self.anchor.touch();
        }
    }

    /// Drop the whole container when its owner is deleted. The persisted
    /// rows of the instance go away on the next flush of the owner.
    pub fn delete(&self) {
        self.clear();
        trace!(instance = %self.instance, "Deleted property container");
    }

    // =========================================================================
    // Transaction support
    // =========================================================================

    pub fn is_dirty(&self) -> bool {
        !self.state.lock().originals.is_empty()
    }

    /// Persist every key whose value differs from its committed value
    pub(crate) fn flush(&self) -> Result<()> {
        let changes: Vec<(String, Option<String>)> = {
            let st = self.state.lock();
            st.originals
                .iter()
                .filter_map(|(key, original)| {
                    let current = st.map.get(key);
                    (current != original.as_ref()).then(|| (key.clone(), current.cloned()))
                })
                .collect()
        };
        for (key, value) in changes {
            match value {
                Some(value) => self.driver.persist(&self.instance, &key, &value)?,
                None => self.driver.remove(&self.instance, &key)?,
            }
        }
        Ok(())
    }

    /// Persist every current property, used when the owner is created
    pub(crate) fn flush_all(&self) -> Result<()> {
        for (key, value) in self.map() {
            self.driver.persist(&self.instance, &key, &value)?;
        }
        Ok(())
    }

    /// Drop all persisted rows of this instance, used when the owner is deleted
    pub(crate) fn delete_persisted(&self) -> Result<()> {
        self.driver.remove_all(&self.instance)
    }

    pub fn commit(&self) {
        self.state.lock().originals.clear();
    }

    pub fn rollback(&self) {
        let mut st = self.state.lock();
        let originals = std::mem::take(&mut st.originals);
        for (key, original) in originals {
            match original {
                Some(value) => st.map.insert(key, value),
                None => st.map.remove(&key),
            };
        }
    }
}

impl std::fmt::Debug for PropsContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PropsContainer")
            .field("instance", &self.instance)
            .field("size", &self.size())
            .finish()
    }
}
