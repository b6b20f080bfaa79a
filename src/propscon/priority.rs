//! Read-only views and priority resolution across containers

use super::container::PropsContainer;
use crate::error::Result;
use std::collections::BTreeMap;

// =============================================================================
// Read-only view
// =============================================================================

/// Reader access to a [`PropsContainer`], handed out for VIEW access
#[derive(Debug, Clone, Copy)]
pub struct ReadOnlyProps<'a> {
    inner: &'a PropsContainer,
}

impl<'a> ReadOnlyProps<'a> {
    pub fn new(inner: &'a PropsContainer) -> Self {
        Self { inner }
    }

    pub fn instance(&self) -> &'a str {
        self.inner.instance()
    }

    pub fn get_prop(&self, key: &str, namespace: Option<&str>) -> Result<Option<String>> {
        self.inner.get_prop(key, namespace)
    }

    pub fn iterate_namespaces(&self, namespace: Option<&str>) -> Vec<String> {
        self.inner.iterate_namespaces(namespace)
    }

    pub fn namespace_map(&self, namespace: Option<&str>) -> BTreeMap<String, String> {
        self.inner.namespace_map(namespace)
    }

    pub fn keys(&self) -> Vec<String> {
        self.inner.keys()
    }

    pub fn map(&self) -> BTreeMap<String, String> {
        self.inner.map()
    }

    pub fn size(&self) -> usize {
        self.inner.size()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

// =============================================================================
// Priority Props
// =============================================================================

/// Ordered chain of containers, most specific first.
///
/// Lookups return the first container's value that is present; the
/// containers themselves are never modified.
#[derive(Debug, Clone, Default)]
pub struct PriorityProps<'a> {
    chain: Vec<ReadOnlyProps<'a>>,
}

impl<'a> PriorityProps<'a> {
    pub fn new(chain: impl IntoIterator<Item = ReadOnlyProps<'a>>) -> Self {
        Self {
            chain: chain.into_iter().collect(),
        }
    }

    /// Append a container less specific than all present ones
    pub fn add_props(&mut self, props: ReadOnlyProps<'a>) {
        self.chain.push(props);
    }

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }

    pub fn get_prop(&self, key: &str, namespace: Option<&str>) -> Result<Option<String>> {
        Ok(self.get_prop_with_origin(key, namespace)?.map(|(value, _)| value))
    }

    /// Resolved value together with the instance path that supplied it
    pub fn get_prop_with_origin(&self, key: &str, namespace: Option<&str>) -> Result<Option<(String, &'a str)>> {
        for props in &self.chain {
            if let Some(value) = props.get_prop(key, namespace)? {
                return Ok(Some((value, props.instance())));
            }
        }
        Ok(None)
    }

    /// Effective entries below `namespace`, relative keys
    pub fn render(&self, namespace: Option<&str>) -> BTreeMap<String, String> {
        let mut rendered = BTreeMap::new();
        for props in self.chain.iter().rev() {
            rendered.extend(props.namespace_map(namespace));
        }
        rendered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SatelliteDatabase;
    use crate::transaction::TxAnchor;

    fn container(instance: &str) -> PropsContainer {
        PropsContainer::new(instance, TxAnchor::loaded(), SatelliteDatabase::new())
    }

    #[test]
    fn test_most_specific_container_wins() {
        let node_conn = container("CONDFN/NODES/A/B");
        let rsc_conn = container("CONDFN/RESOURCES/A/B/R");
        let vlm_conn = container("CONDFN/VOLUMES/A/B/R/0");
        let prio = PriorityProps::new([
            ReadOnlyProps::new(&vlm_conn),
            ReadOnlyProps::new(&rsc_conn),
            ReadOnlyProps::new(&node_conn),
        ]);
        let key = "test";

        assert_eq!(prio.get_prop(key, None).unwrap(), None);

        vlm_conn.set_prop(key, "v1", None).unwrap();
        assert_eq!(prio.get_prop(key, None).unwrap().as_deref(), Some("v1"));

        rsc_conn.set_prop(key, "v2", None).unwrap();
        assert_eq!(prio.get_prop(key, None).unwrap().as_deref(), Some("v1"));

        node_conn.set_prop(key, "v3", None).unwrap();
        assert_eq!(prio.get_prop(key, None).unwrap().as_deref(), Some("v1"));

        vlm_conn.remove_prop(key, None).unwrap();
        assert_eq!(prio.get_prop(key, None).unwrap().as_deref(), Some("v2"));

        rsc_conn.remove_prop(key, None).unwrap();
        assert_eq!(prio.get_prop(key, None).unwrap().as_deref(), Some("v3"));

        vlm_conn.set_prop(key, "v4", None).unwrap();
        assert_eq!(prio.get_prop(key, None).unwrap().as_deref(), Some("v4"));

        assert_eq!(
            prio.get_prop_with_origin(key, None).unwrap(),
            Some(("v4".to_string(), "CONDFN/VOLUMES/A/B/R/0"))
        );
    }

    #[test]
    fn test_resolution_does_not_mutate() {
        let specific = container("S");
        let general = container("G");
        general.set_prop("k", "g", Some("Aux")).unwrap();
        general.commit();

        let mut prio = PriorityProps::default();
        prio.add_props(ReadOnlyProps::new(&specific));
        prio.add_props(ReadOnlyProps::new(&general));

        assert_eq!(prio.get_prop("k", Some("Aux")).unwrap().as_deref(), Some("g"));
        assert!(specific.is_empty());
        assert!(!general.is_dirty());
    }

    #[test]
    fn test_render_merges_by_priority() {
        let specific = container("S");
        let general = container("G");
        general.set_prop("a", "general", Some("Aux")).unwrap();
        general.set_prop("b", "general", Some("Aux")).unwrap();
        specific.set_prop("a", "specific", Some("Aux")).unwrap();

        let prio = PriorityProps::new([ReadOnlyProps::new(&specific), ReadOnlyProps::new(&general)]);
        let rendered = prio.render(Some("Aux"));

        assert_eq!(rendered.get("a").map(String::as_str), Some("specific"));
        assert_eq!(rendered.get("b").map(String::as_str), Some("general"));
        assert_eq!(prio.len(), 2);
    }
}
