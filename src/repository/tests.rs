use super::*;
use crate::objects::{
    ConnectionArgs, EncryptionType, NetInterfaceArgs, NetInterfaceKey, NetInterfaceName, NodeArgs,
    NodeConnectionKey, NodeFlag, NodeName, NodeType, ProviderKind, ResourceArgs,
    ResourceDefinitionArgs, ResourceKey, ResourceName, SatelliteConnection, StorPoolArgs,
    StorPoolDefinitionArgs, StorPoolName, VolumeArgs, VolumeDefinitionArgs, VolumeNumber,
};
use crate::propscon::PriorityProps;
use crate::security::{AccessContext, AccessType};
use crate::transaction::TransactionObject;
use assert_matches::assert_matches;
use std::thread;

struct Fixture {
    db: Arc<ControllerDatabase>,
    repo: Arc<Repository>,
    acc: AccessContext,
}

impl Fixture {
    fn new() -> Self {
        let db = ControllerDatabase::in_memory();
        let repo = Repository::controller(db.clone(), &CoreConfig::default()).unwrap();
        Self {
            db,
            repo,
            acc: AccessContext::system(),
        }
    }

    /// Run `f` in a fresh context and commit
    fn commit<T>(&self, f: impl FnOnce(&TransactionContext) -> T) -> T {
        let ctx = self.repo.new_context();
        let value = f(&ctx);
        ctx.commit().unwrap();
        value
    }

    fn node(&self, ctx: &TransactionContext, name: &str) -> Arc<Node> {
        self.repo
            .get_node(&self.acc, ctx, &node_name(name), NodeArgs::default(), true, true)
            .unwrap()
            .unwrap()
    }

    fn rsc_dfn(&self, ctx: &TransactionContext, name: &str) -> Arc<ResourceDefinition> {
        self.repo
            .get_resource_definition(
                &self.acc,
                ctx,
                &ResourceName::new(name).unwrap(),
                ResourceDefinitionArgs::default(),
                true,
                true,
            )
            .unwrap()
            .unwrap()
    }

    fn vlm_dfn(&self, ctx: &TransactionContext, rsc_dfn: &Arc<ResourceDefinition>, nr: i64) -> Arc<VolumeDefinition> {
        let args = VolumeDefinitionArgs {
            size_kib: 1 << 20,
            ..Default::default()
        };
        self.repo
            .get_volume_definition(&self.acc, ctx, rsc_dfn, vlm_nr(nr), args, true, true)
            .unwrap()
            .unwrap()
    }

    fn resource(&self, ctx: &TransactionContext, node: &Arc<Node>, rsc_dfn: &Arc<ResourceDefinition>) -> Arc<Resource> {
        self.repo
            .get_resource(&self.acc, ctx, node, rsc_dfn, ResourceArgs::default(), true, true)
            .unwrap()
            .unwrap()
    }

    fn stor_pool(&self, ctx: &TransactionContext, node: &Arc<Node>, name: &str) -> Arc<StorPool> {
        let spd = self
            .repo
            .get_stor_pool_definition(
                &self.acc,
                ctx,
                &StorPoolName::new(name).unwrap(),
                StorPoolDefinitionArgs::default(),
                true,
                false,
            )
            .unwrap()
            .unwrap();
        let args = StorPoolArgs {
            provider: ProviderKind::LvmThin,
            ..Default::default()
        };
        self.repo
            .get_stor_pool(&self.acc, ctx, node, &spd, args, true, true)
            .unwrap()
            .unwrap()
    }

    fn volume(
        &self,
        ctx: &TransactionContext,
        rsc: &Arc<Resource>,
        vlm_dfn: &Arc<VolumeDefinition>,
        pool: &Arc<StorPool>,
    ) -> Arc<Volume> {
        self.repo
            .get_volume(&self.acc, ctx, rsc, vlm_dfn, pool, VolumeArgs::default(), true, true)
            .unwrap()
            .unwrap()
    }
}

fn node_name(name: &str) -> NodeName {
    NodeName::new(name).unwrap()
}

fn vlm_nr(nr: i64) -> VolumeNumber {
    VolumeNumber::new(nr).unwrap()
}

// =============================================================================
// Decision Table
// =============================================================================

#[test]
fn test_decision_table_for_nodes() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let name = node_name("alpha");

    // absent, no create
    let ctx = fx.repo.new_context();
    assert!(fx
        .repo
        .get_node(acc, &ctx, &name, NodeArgs::default(), false, false)
        .unwrap()
        .is_none());

    // contract violation
    assert_matches!(
        fx.repo.get_node(acc, &ctx, &name, NodeArgs::default(), false, true),
        Err(Error::Implementation(_))
    );

    // absent, create
    let created = fx
        .repo
        .get_node(acc, &ctx, &name, NodeArgs::default(), true, true)
        .unwrap()
        .unwrap();
    ctx.commit().unwrap();

    let ctx = fx.repo.new_context();
    // cached, fail
    assert_matches!(
        fx.repo.get_node(acc, &ctx, &name, NodeArgs::default(), true, true),
        Err(Error::AlreadyExists { kind: "Node", .. })
    );
    // cached, no fail
    let cached = fx
        .repo
        .get_node(acc, &ctx, &name, NodeArgs::default(), true, false)
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&created, &cached));
    let looked_up = fx
        .repo
        .get_node(acc, &ctx, &name, NodeArgs::default(), false, false)
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&created, &looked_up));
    assert_eq!(fx.repo.stats().creates, 1);
}

#[test]
fn test_stored_but_uncached_is_loaded_not_recreated() {
    let db = ControllerDatabase::in_memory();
    let config = CoreConfig::default();
    let acc = AccessContext::system();
    let name = node_name("alpha");

    let first = Repository::controller(db.clone(), &config).unwrap();
    let ctx = first.new_context();
    let uuid = first
        .get_node(&acc, &ctx, &name, NodeArgs::default(), true, true)
        .unwrap()
        .unwrap()
        .uuid();
    ctx.commit().unwrap();

    // Fresh repository over the same store, without the startup load
    let second = Repository::new(Drivers::controller(db), Mode::Controller, minor_pool(&config).unwrap());
    let ctx = second.new_context();
    assert_matches!(
        second.get_node(&acc, &ctx, &name, NodeArgs::default(), true, false),
        Err(Error::AlreadyExists { .. })
    );
    let loaded = second
        .get_node(&acc, &ctx, &name, NodeArgs::default(), false, false)
        .unwrap()
        .unwrap();
    assert_eq!(loaded.uuid(), uuid);
    assert_eq!(second.stats().loads, 1);
    assert_eq!(second.stats().creates, 0);
    assert!(!ctx.is_dirty());
}

#[test]
fn test_concurrent_lookups_share_one_instance() {
    let fx = Fixture::new();
    let name = node_name("racer");

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let repo = fx.repo.clone();
            let name = name.clone();
            thread::spawn(move || {
                let acc = AccessContext::system();
                let ctx = repo.new_context();
                let node = repo
                    .get_node(&acc, &ctx, &name, NodeArgs::default(), true, false)
                    .unwrap()
                    .unwrap();
                // only the creating thread has anything to flush
                ctx.commit().unwrap();
                node
            })
        })
        .collect();

    let nodes: Vec<Arc<Node>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
    assert!(nodes.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(fx.repo.stats().creates, 1);
}

#[test]
fn test_entity_debug_names_kind_and_key() {
    let fx = Fixture::new();
    let node = fx.commit(|ctx| fx.node(ctx, "alpha"));

    let text = format!("{:?}", node);
    assert!(text.starts_with("Node {"));
    assert!(text.contains("key: \"alpha\""));
    assert!(text.contains("deleted: false"));

    let ctx = fx.repo.new_context();
    assert_matches!(
        fx.repo.get_node(&fx.acc, &ctx, &node_name("alpha"), NodeArgs::default(), true, false),
        Ok(Some(cached)) if Arc::ptr_eq(&cached, &node)
    );
}

#[test]
fn test_load_closure_may_consult_the_same_cache() {
    let fx = Fixture::new();
    let names: Vec<NodeName> = (0..16).map(|i| node_name(&format!("n{}", i))).collect();
    fx.commit(|ctx| {
        for name in &names {
            fx.node(ctx, name.value());
        }
    });

    // Some of the other keys share a map shard with the first one
    let fresh = Repository::new(
        Drivers::controller(fx.db.clone()),
        Mode::Controller,
        minor_pool(&CoreConfig::default()).unwrap(),
    );
    let first = fresh
        .nodes
        .lookup(&fresh.stats, fresh.drivers.nodes.as_ref(), &names[0], |record| {
            for other in &names[1..] {
                assert!(fresh.node(other)?.is_some());
            }
            fresh.restore_node(record)
        })
        .unwrap()
        .unwrap();

    assert_eq!(first.name(), &names[0]);
    assert_eq!(fresh.nodes().len(), names.len());
    assert_eq!(fresh.stats().loads, names.len() as u64);
}

// =============================================================================
// Commit and Rollback
// =============================================================================

#[test]
fn test_commit_clears_dirty_state() {
    let fx = Fixture::new();
    let ctx = fx.repo.new_context();
    let node = fx.node(&ctx, "alpha");
    node.props_mut(&fx.acc)
        .unwrap()
        .set_prop("Aux/site", "east", None)
        .unwrap();
    assert!(ctx.is_dirty());
    assert!(ctx.size_of_tracked_objects() > 0);

    ctx.commit().unwrap();
    assert_eq!(ctx.size_of_tracked_objects(), 0);
    assert!(!node.anchor().is_dirty());
    assert_eq!(fx.db.row_count("NODES"), 1);
    assert_eq!(fx.repo.stats().commits, 1);
}

#[test]
fn test_rollback_restores_committed_values() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let node = fx.commit(|ctx| {
        let node = fx.node(ctx, "alpha");
        node.props_mut(acc).unwrap().set_prop("key", "V1", None).unwrap();
        node
    });

    let ctx = fx.repo.new_context();
    ctx.attach(&node).unwrap();
    node.props_mut(acc).unwrap().set_prop("key", "V2", None).unwrap();
    node.set_node_type(acc, NodeType::Combined).unwrap();
    node.flags().unwrap().enable_flags(acc, &[NodeFlag::Evicted]).unwrap();
    ctx.rollback();

    let props = node.props(acc).unwrap();
    assert_eq!(props.get_prop("key", None).unwrap().as_deref(), Some("V1"));
    assert_eq!(node.node_type(acc).unwrap(), NodeType::Auxiliary);
    assert!(node.flags().unwrap().is_unset(acc, &[NodeFlag::Evicted]).unwrap());
    assert!(!node.anchor().is_dirty());
}

#[test]
fn test_rollback_of_create_removes_cache_entry() {
    let fx = Fixture::new();
    let name = node_name("ghost");

    let ctx = fx.repo.new_context();
    let node = fx.node(&ctx, "ghost");
    assert!(fx.repo.nodes.contains(&name));
    ctx.rollback();

    assert!(!fx.repo.nodes.contains(&name));
    assert!(node.is_deleted());
    assert_eq!(fx.db.row_count("NODES"), 0);

    // The key is free again
    let ctx = fx.repo.new_context();
    assert!(fx
        .repo
        .get_node(&fx.acc, &ctx, &name, NodeArgs::default(), true, true)
        .unwrap()
        .is_some());
}

#[test]
fn test_commit_failure_leaves_objects_dirty() {
    let fx = Fixture::new();
    let ctx = fx.repo.new_context();
    let node = fx.node(&ctx, "alpha");

    fx.db.set_available(false);
    assert_matches!(ctx.commit(), Err(Error::BackendUnavailable { .. }));
    assert!(node.anchor().is_dirty());
    assert!(ctx.size_of_tracked_objects() > 0);

    ctx.rollback();
    fx.db.set_available(true);
    assert!(!fx.repo.nodes.contains(&node_name("alpha")));
    assert_eq!(fx.db.row_count("NODES"), 0);
}

#[test]
fn test_detached_mutation_fails_at_commit() {
    let fx = Fixture::new();
    let node = fx.commit(|ctx| fx.node(ctx, "alpha"));

    // Mutated without any context attached
    node.props_mut(&fx.acc)
        .unwrap()
        .set_prop("Aux/late", "yes", None)
        .unwrap();

    let ctx = fx.repo.new_context();
    ctx.attach(&node).unwrap();
    assert_matches!(ctx.commit(), Err(Error::Implementation(_)));
    ctx.rollback();
    assert_eq!(node.props(&fx.acc).unwrap().get_prop("Aux/late", None).unwrap(), None);
}

#[test]
fn test_dirty_object_cannot_change_context() {
    let fx = Fixture::new();
    let first = fx.repo.new_context();
    let node = fx.node(&first, "alpha");

    let second = fx.repo.new_context();
    assert_matches!(second.attach(&node), Err(Error::Implementation(_)));
    first.commit().unwrap();

    // Clean objects move freely
    second.attach(&node).unwrap();
    assert_eq!(second.size_of_tracked_objects(), 1);
}

// =============================================================================
// Deletion
// =============================================================================

#[test]
fn test_access_after_delete_fails() {
    let fx = Fixture::new();
    let node = fx.commit(|ctx| fx.node(ctx, "alpha"));

    fx.commit(|ctx| fx.repo.delete_node(&fx.acc, ctx, &node).unwrap());
    assert_matches!(node.props(&fx.acc), Err(Error::AccessToDeleted { .. }));
    assert_matches!(node.flags(), Err(Error::AccessToDeleted { .. }));
    assert_eq!(fx.db.row_count("NODES"), 0);
    assert!(fx.repo.node(&node_name("alpha")).unwrap().is_none());
}

#[test]
fn test_delete_rollback_restores_entity() {
    let fx = Fixture::new();
    let node = fx.commit(|ctx| {
        let node = fx.node(ctx, "alpha");
        node.props_mut(&fx.acc).unwrap().set_prop("a", "1", None).unwrap();
        node
    });

    let ctx = fx.repo.new_context();
    fx.repo.delete_node(&fx.acc, &ctx, &node).unwrap();
    assert!(fx.repo.nodes().is_empty());
    ctx.rollback();

    let cached = fx.repo.node(&node_name("alpha")).unwrap().unwrap();
    assert!(Arc::ptr_eq(&cached, &node));
    assert!(!node.is_deleted());
    assert_eq!(node.props(&fx.acc).unwrap().get_prop("a", None).unwrap().as_deref(), Some("1"));
}

#[test]
fn test_delete_node_in_use() {
    let fx = Fixture::new();
    let node = fx.commit(|ctx| {
        let node = fx.node(ctx, "alpha");
        let rsc_dfn = fx.rsc_dfn(ctx, "web");
        fx.resource(ctx, &node, &rsc_dfn);
        node
    });

    let ctx = fx.repo.new_context();
    assert_matches!(
        fx.repo.delete_node(&fx.acc, &ctx, &node),
        Err(Error::InUse { kind: "Node", .. })
    );
    assert!(!node.is_deleted());
}

#[test]
fn test_delete_cascades_to_children() {
    let fx = Fixture::new();
    let (rsc_dfn, vlm_dfn, rsc, vlm) = fx.commit(|ctx| {
        let node = fx.node(ctx, "alpha");
        let pool = fx.stor_pool(ctx, &node, "thin1");
        let rsc_dfn = fx.rsc_dfn(ctx, "web");
        let vlm_dfn = fx.vlm_dfn(ctx, &rsc_dfn, 0);
        let rsc = fx.resource(ctx, &node, &rsc_dfn);
        let vlm = fx.volume(ctx, &rsc, &vlm_dfn, &pool);
        (rsc_dfn, vlm_dfn, rsc, vlm)
    });
    assert_eq!(fx.db.row_count("VOLUMES"), 1);

    fx.commit(|ctx| fx.repo.delete_resource(&fx.acc, ctx, &rsc).unwrap());
    assert!(vlm.is_deleted());
    assert_eq!(fx.db.row_count("RESOURCES"), 0);
    assert_eq!(fx.db.row_count("VOLUMES"), 0);
    assert!(vlm_dfn.volumes(&fx.acc).unwrap().is_empty());
    assert_eq!(rsc_dfn.resource_count(), 0);

    fx.commit(|ctx| fx.repo.delete_resource_definition(&fx.acc, ctx, &rsc_dfn).unwrap());
    assert!(vlm_dfn.is_deleted());
    assert_eq!(fx.db.row_count("VOLUME_DEFINITIONS"), 0);
}

#[test]
fn test_lookup_during_pending_delete_finds_nothing() {
    let fx = Fixture::new();
    let alpha = node_name("alpha");
    let node = fx.commit(|ctx| fx.node(ctx, "alpha"));

    let deleting = fx.repo.new_context();
    fx.repo.delete_node(&fx.acc, &deleting, &node).unwrap();
    let loads = fx.repo.stats().loads;

    // The row is still stored, but the cached instance shadows it
    assert_eq!(fx.db.row_count("NODES"), 1);
    assert!(fx.repo.node(&alpha).unwrap().is_none());
    let other = fx.repo.new_context();
    assert!(fx
        .repo
        .get_node(&fx.acc, &other, &alpha, NodeArgs::default(), false, false)
        .unwrap()
        .is_none());
    assert_matches!(
        fx.repo.get_node(&fx.acc, &other, &alpha, NodeArgs::default(), true, false),
        Err(Error::AccessToDeleted { kind: "Node", .. })
    );
    assert_eq!(fx.repo.stats().loads, loads);

    deleting.commit().unwrap();
    assert_eq!(fx.db.row_count("NODES"), 0);
    assert!(!fx.repo.nodes.contains(&alpha));
    assert!(fx.repo.node(&alpha).unwrap().is_none());
    assert_eq!(fx.repo.stats().loads, loads);
}

#[test]
fn test_children_of_one_parent_in_parallel_contexts() {
    let fx = Fixture::new();
    let (node, web, db) = fx.commit(|ctx| {
        (fx.node(ctx, "alpha"), fx.rsc_dfn(ctx, "web"), fx.rsc_dfn(ctx, "db"))
    });

    let first = fx.repo.new_context();
    let second = fx.repo.new_context();
    fx.resource(&first, &node, &web);
    fx.resource(&second, &node, &db);
    assert!(!node.anchor().is_dirty());
    assert_eq!(node.resource_count(), 2);

    first.commit().unwrap();
    second.commit().unwrap();
    assert_eq!(fx.db.row_count("RESOURCES"), 2);
    assert_eq!(node.resource_count(), 2);

    let third = fx.repo.new_context();
    let rsc = fx
        .repo
        .resource(&ResourceKey::new(node_name("alpha"), ResourceName::new("db").unwrap()))
        .unwrap()
        .unwrap();
    fx.repo.delete_resource(&fx.acc, &third, &rsc).unwrap();
    third.rollback();
    assert_eq!(node.resource_count(), 2);
}

#[test]
fn test_threads_creating_children_of_one_parent() {
    let fx = Fixture::new();
    let node = fx.commit(|ctx| fx.node(ctx, "alpha"));

    let handles: Vec<_> = (0..4)
        .map(|i| {
            let repo = fx.repo.clone();
            let node = node.clone();
            thread::spawn(move || {
                let acc = AccessContext::system();
                let ctx = repo.new_context();
                let rsc_dfn = repo
                    .get_resource_definition(
                        &acc,
                        &ctx,
                        &ResourceName::new(format!("rsc{}", i)).unwrap(),
                        ResourceDefinitionArgs::default(),
                        true,
                        true,
                    )
                    .unwrap()
                    .unwrap();
                repo.get_resource(&acc, &ctx, &node, &rsc_dfn, ResourceArgs::default(), true, true)
                    .unwrap();
                ctx.commit().unwrap();
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(node.resource_count(), 4);
    assert_eq!(fx.db.row_count("RESOURCES"), 4);
}

#[test]
fn test_create_under_parent_pending_delete() {
    let fx = Fixture::new();
    let (node, web) = fx.commit(|ctx| (fx.node(ctx, "alpha"), fx.rsc_dfn(ctx, "web")));

    let deleting = fx.repo.new_context();
    fx.repo.delete_node(&fx.acc, &deleting, &node).unwrap();

    let other = fx.repo.new_context();
    assert_matches!(
        fx.repo
            .get_resource(&fx.acc, &other, &node, &web, ResourceArgs::default(), true, false),
        Err(Error::AccessToDeleted { kind: "Node", .. })
    );
    assert_eq!(web.resource_count(), 0);

    deleting.rollback();
    fx.resource(&other, &node, &web);
    other.commit().unwrap();
    assert_eq!(node.resource_count(), 1);
}

#[test]
fn test_delete_parent_with_pending_child_in_other_context() {
    let fx = Fixture::new();
    let (node, web) = fx.commit(|ctx| (fx.node(ctx, "alpha"), fx.rsc_dfn(ctx, "web")));

    let creating = fx.repo.new_context();
    fx.resource(&creating, &node, &web);

    let deleting = fx.repo.new_context();
    assert_matches!(
        fx.repo.delete_node(&fx.acc, &deleting, &node),
        Err(Error::InUse { kind: "Node", .. })
    );

    creating.rollback();
    fx.repo.delete_node(&fx.acc, &deleting, &node).unwrap();
    deleting.commit().unwrap();
    assert_eq!(fx.db.row_count("NODES"), 0);
}

#[test]
fn test_delete_rollback_relinks_children() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let (rsc, vlm_dfn_1, pool) = fx.commit(|ctx| {
        let node = fx.node(ctx, "alpha");
        let pool = fx.stor_pool(ctx, &node, "thin1");
        let rsc_dfn = fx.rsc_dfn(ctx, "web");
        let vlm_dfn = fx.vlm_dfn(ctx, &rsc_dfn, 0);
        let rsc = fx.resource(ctx, &node, &rsc_dfn);
        fx.volume(ctx, &rsc, &vlm_dfn, &pool);
        (rsc, fx.vlm_dfn(ctx, &rsc_dfn, 1), pool)
    });

    let ctx = fx.repo.new_context();
    fx.repo.delete_resource(acc, &ctx, &rsc).unwrap();
    assert!(rsc.volumes(acc).unwrap().is_empty());
    assert!(pool.volumes(acc).unwrap().is_empty());
    ctx.rollback();

    assert_eq!(rsc.volumes(acc).unwrap().len(), 1);
    assert_eq!(pool.volumes(acc).unwrap().len(), 1);

    // The volume map is open again
    fx.commit(|ctx| fx.volume(ctx, &rsc, &vlm_dfn_1, &pool));
    assert_eq!(rsc.volumes(acc).unwrap().len(), 2);
    assert_eq!(fx.db.row_count("VOLUMES"), 2);
}

#[test]
fn test_access_denied_for_unprivileged_identity() {
    let fx = Fixture::new();
    let node = fx.commit(|ctx| fx.node(ctx, "alpha"));
    let guest = AccessContext::new("mallory", "guest");

    let ctx = fx.repo.new_context();
    assert_matches!(
        fx.repo.get_node(&guest, &ctx, &node_name("alpha"), NodeArgs::default(), false, false),
        Err(Error::AccessDenied { .. })
    );
    assert_matches!(fx.repo.delete_node(&guest, &ctx, &node), Err(Error::AccessDenied { .. }));

    node.protection().grant(&fx.acc, "guest", AccessType::View).unwrap();
    assert!(fx
        .repo
        .get_node(&guest, &ctx, &node_name("alpha"), NodeArgs::default(), false, false)
        .unwrap()
        .is_some());
    assert_matches!(node.props_mut(&guest), Err(Error::AccessDenied { .. }));
}

// =============================================================================
// Minor Numbers
// =============================================================================

#[test]
fn test_minor_released_on_delete() {
    let fx = Fixture::new();
    let pool = fx.repo.minor_pool();
    let vlm_dfn = fx.commit(|ctx| {
        let rsc_dfn = fx.rsc_dfn(ctx, "web");
        fx.vlm_dfn(ctx, &rsc_dfn, 0)
    });
    let minor = vlm_dfn.minor_number(&fx.acc).unwrap().value();
    assert!(pool.is_allocated(minor));

    let ctx = fx.repo.new_context();
    fx.repo.delete_volume_definition(&fx.acc, &ctx, &vlm_dfn).unwrap();
    assert!(!pool.is_allocated(minor));
    ctx.rollback();
    assert!(pool.is_allocated(minor));

    fx.commit(|ctx| fx.repo.delete_volume_definition(&fx.acc, ctx, &vlm_dfn).unwrap());
    assert!(!pool.is_allocated(minor));
    assert_eq!(pool.allocated_count(), 0);
}

#[test]
fn test_minor_released_on_create_rollback() {
    let fx = Fixture::new();
    let ctx = fx.repo.new_context();
    let rsc_dfn = fx.rsc_dfn(&ctx, "web");
    let vlm_dfn = fx.vlm_dfn(&ctx, &rsc_dfn, 0);
    let minor = vlm_dfn.minor_number(&fx.acc).unwrap().value();
    assert!(fx.repo.minor_pool().is_allocated(minor));

    ctx.rollback();
    assert!(!fx.repo.minor_pool().is_allocated(minor));
}

#[test]
fn test_set_minor_number_moves_reservation() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let pool = fx.repo.minor_pool();
    let vlm_dfn = fx.commit(|ctx| {
        let rsc_dfn = fx.rsc_dfn(ctx, "web");
        fx.vlm_dfn(ctx, &rsc_dfn, 0)
    });
    let original = vlm_dfn.minor_number(acc).unwrap();
    let first = MinorNumber::new(2000).unwrap();
    let second = MinorNumber::new(2001).unwrap();

    // Pending changes hold both the committed and the new number
    let ctx = fx.repo.new_context();
    ctx.attach(&vlm_dfn).unwrap();
    vlm_dfn.set_minor_number(acc, first).unwrap();
    vlm_dfn.set_minor_number(acc, second).unwrap();
    assert!(pool.is_allocated(original.value()));
    assert!(!pool.is_allocated(first.value()));
    assert!(pool.is_allocated(second.value()));

    ctx.rollback();
    assert!(pool.is_allocated(original.value()));
    assert!(!pool.is_allocated(second.value()));
    assert_eq!(vlm_dfn.minor_number(acc).unwrap(), original);

    fx.commit(|ctx| {
        ctx.attach(&vlm_dfn).unwrap();
        vlm_dfn.set_minor_number(acc, first).unwrap();
    });
    assert!(!pool.is_allocated(original.value()));
    assert!(pool.is_allocated(first.value()));
}

#[test]
fn test_minor_conflict() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let (a, b) = fx.commit(|ctx| {
        let rsc_dfn = fx.rsc_dfn(ctx, "web");
        (fx.vlm_dfn(ctx, &rsc_dfn, 0), fx.vlm_dfn(ctx, &rsc_dfn, 1))
    });
    assert_ne!(a.minor_number(acc).unwrap(), b.minor_number(acc).unwrap());

    let ctx = fx.repo.new_context();
    ctx.attach(&b).unwrap();
    assert_matches!(
        b.set_minor_number(acc, a.minor_number(acc).unwrap()),
        Err(Error::NumberInUse { .. })
    );
}

// =============================================================================
// Connections
// =============================================================================

#[test]
fn test_node_connection_is_symmetric() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let ctx = fx.repo.new_context();
    let a = fx.node(&ctx, "alpha");
    let b = fx.node(&ctx, "bravo");

    let ab = fx
        .repo
        .get_node_connection(acc, &ctx, &a, &b, ConnectionArgs::default(), true, true)
        .unwrap()
        .unwrap();
    let ba = fx
        .repo
        .get_node_connection(acc, &ctx, &b, &a, ConnectionArgs::default(), false, false)
        .unwrap()
        .unwrap();
    assert!(Arc::ptr_eq(&ab, &ba));
    assert_eq!(ab.key().source(), &node_name("alpha"));
    assert!(Arc::ptr_eq(ab.other(b.name()), &a));
    assert!(Arc::ptr_eq(&a.node_connection(acc, b.name()).unwrap().unwrap(), &ab));
    assert!(Arc::ptr_eq(&b.node_connection(acc, a.name()).unwrap().unwrap(), &ab));

    assert_matches!(
        fx.repo
            .get_node_connection(acc, &ctx, &a, &a, ConnectionArgs::default(), true, false),
        Err(Error::InvalidConnection(_))
    );
    ctx.commit().unwrap();

    let key = NodeConnectionKey::new(&node_name("bravo"), &node_name("alpha")).unwrap();
    assert!(fx.repo.node_connection(&key).unwrap().is_some());
    assert_eq!(fx.repo.node_connections_by_endpoint(&node_name("bravo")).unwrap().len(), 1);
    assert_eq!(fx.db.row_count("NODE_CONNECTIONS"), 1);
}

#[test]
fn test_resource_connection_requires_same_definition() {
    let fx = Fixture::new();
    let ctx = fx.repo.new_context();
    let a = fx.node(&ctx, "alpha");
    let b = fx.node(&ctx, "bravo");
    let web = fx.rsc_dfn(&ctx, "web");
    let db = fx.rsc_dfn(&ctx, "db");
    let web_a = fx.resource(&ctx, &a, &web);
    let db_b = fx.resource(&ctx, &b, &db);

    assert_matches!(
        fx.repo
            .get_resource_connection(&fx.acc, &ctx, &web_a, &db_b, ConnectionArgs::default(), true, false),
        Err(Error::InvalidConnection(_))
    );
}

#[test]
fn test_priority_props_across_connection_levels() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let ctx = fx.repo.new_context();

    let a = fx.node(&ctx, "alpha");
    let b = fx.node(&ctx, "bravo");
    let pool_a = fx.stor_pool(&ctx, &a, "thin1");
    let pool_b = fx.stor_pool(&ctx, &b, "thin1");
    let rsc_dfn = fx.rsc_dfn(&ctx, "web");
    let vlm_dfn = fx.vlm_dfn(&ctx, &rsc_dfn, 0);
    let rsc_a = fx.resource(&ctx, &a, &rsc_dfn);
    let rsc_b = fx.resource(&ctx, &b, &rsc_dfn);
    let vlm_a = fx.volume(&ctx, &rsc_a, &vlm_dfn, &pool_a);
    let vlm_b = fx.volume(&ctx, &rsc_b, &vlm_dfn, &pool_b);

    let node_conn = fx
        .repo
        .get_node_connection(acc, &ctx, &a, &b, ConnectionArgs::default(), true, true)
        .unwrap()
        .unwrap();
    let rsc_conn = fx
        .repo
        .get_resource_connection(acc, &ctx, &rsc_b, &rsc_a, ConnectionArgs::default(), true, true)
        .unwrap()
        .unwrap();
    let vlm_conn = fx
        .repo
        .get_volume_connection(acc, &ctx, &vlm_a, &vlm_b, ConnectionArgs::default(), true, true)
        .unwrap()
        .unwrap();

    node_conn.props_mut(acc).unwrap().set_prop("k1", "v1", None).unwrap();
    node_conn.props_mut(acc).unwrap().set_prop("k2", "v1", None).unwrap();
    node_conn.props_mut(acc).unwrap().set_prop("k3", "v1", None).unwrap();
    rsc_conn.props_mut(acc).unwrap().set_prop("k2", "v2", None).unwrap();
    rsc_conn.props_mut(acc).unwrap().set_prop("k3", "v2", None).unwrap();
    vlm_conn.props_mut(acc).unwrap().set_prop("k3", "v3", None).unwrap();
    vlm_conn.props_mut(acc).unwrap().set_prop("k4", "v4", None).unwrap();
    ctx.commit().unwrap();

    let vlm_props = vlm_conn.props(acc).unwrap();
    let rsc_props = rsc_conn.props(acc).unwrap();
    let node_props = node_conn.props(acc).unwrap();
    let prio = PriorityProps::new([vlm_props, rsc_props, node_props]);

    assert_eq!(prio.get_prop("k1", None).unwrap().as_deref(), Some("v1"));
    assert_eq!(prio.get_prop("k2", None).unwrap().as_deref(), Some("v2"));
    assert_eq!(prio.get_prop("k3", None).unwrap().as_deref(), Some("v3"));
    assert_eq!(prio.get_prop("k4", None).unwrap().as_deref(), Some("v4"));
    assert_eq!(prio.get_prop("k5", None).unwrap(), None);

    let (_, origin) = prio.get_prop_with_origin("k2", None).unwrap().unwrap();
    assert_eq!(origin, "CONDFN/RESOURCES/ALPHA/BRAVO/WEB");
    assert_eq!(node_props.instance(), "CONDFN/NODES/ALPHA/BRAVO");
    assert_eq!(vlm_props.instance(), "CONDFN/VOLUMES/ALPHA/BRAVO/WEB/0");
}

#[test]
fn test_deleting_volume_removes_its_connections() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let (vlm_a, vlm_conn, rsc_b) = fx.commit(|ctx| {
        let a = fx.node(ctx, "alpha");
        let b = fx.node(ctx, "bravo");
        let pool_a = fx.stor_pool(ctx, &a, "thin1");
        let pool_b = fx.stor_pool(ctx, &b, "thin1");
        let rsc_dfn = fx.rsc_dfn(ctx, "web");
        let vlm_dfn = fx.vlm_dfn(ctx, &rsc_dfn, 0);
        let rsc_a = fx.resource(ctx, &a, &rsc_dfn);
        let rsc_b = fx.resource(ctx, &b, &rsc_dfn);
        let vlm_a = fx.volume(ctx, &rsc_a, &vlm_dfn, &pool_a);
        let vlm_b = fx.volume(ctx, &rsc_b, &vlm_dfn, &pool_b);
        let conn = fx
            .repo
            .get_volume_connection(acc, ctx, &vlm_a, &vlm_b, ConnectionArgs::default(), true, true)
            .unwrap()
            .unwrap();
        (vlm_a, conn, rsc_b)
    });
    assert_eq!(fx.db.row_count("VOLUME_CONNECTIONS"), 1);

    fx.commit(|ctx| fx.repo.delete_volume(acc, ctx, &vlm_a).unwrap());
    assert!(vlm_conn.is_deleted());
    assert_eq!(fx.db.row_count("VOLUME_CONNECTIONS"), 0);
    let vlm_b = rsc_b.volume(acc, vlm_nr(0)).unwrap().unwrap();
    assert!(vlm_b.volume_connections(acc).unwrap().is_empty());
}

#[test]
fn test_resource_connections_by_endpoint() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let (alpha, bravo, charlie) = fx.commit(|ctx| {
        let rsc_dfn = fx.rsc_dfn(ctx, "web");
        let rscs: Vec<Arc<Resource>> = ["alpha", "bravo", "charlie"]
            .iter()
            .map(|name| {
                let node = fx.node(ctx, name);
                fx.resource(ctx, &node, &rsc_dfn)
            })
            .collect();
        fx.repo
            .get_resource_connection(acc, ctx, &rscs[0], &rscs[1], ConnectionArgs::default(), true, true)
            .unwrap();
        (rscs[0].clone(), rscs[1].clone(), rscs[2].clone())
    });

    // Pending connections count as soon as they are created
    let ctx = fx.repo.new_context();
    let pending = fx
        .repo
        .get_resource_connection(acc, &ctx, &charlie, &alpha, ConnectionArgs::default(), true, true)
        .unwrap()
        .unwrap();
    assert_eq!(fx.repo.resource_connections_by_endpoint(alpha.key()).unwrap().len(), 2);
    assert_eq!(fx.repo.resource_connections_by_endpoint(bravo.key()).unwrap().len(), 1);
    let on_charlie = fx.repo.resource_connections_by_endpoint(charlie.key()).unwrap();
    assert_eq!(on_charlie.len(), 1);
    assert!(Arc::ptr_eq(&on_charlie[0], &pending));
    ctx.commit().unwrap();

    // A stored connection shows up in a repository that never cached it
    let fresh = Repository::new(
        Drivers::controller(fx.db.clone()),
        Mode::Controller,
        minor_pool(&CoreConfig::default()).unwrap(),
    );
    let found = fresh.resource_connections_by_endpoint(bravo.key()).unwrap();
    assert_eq!(found.len(), 1);
    let conn = fx.repo.resource_connections_by_endpoint(bravo.key()).unwrap().remove(0);
    assert_eq!(found[0].uuid(), conn.uuid());
    assert_eq!(found[0].key().source(), *alpha.key());

    let ctx = fx.repo.new_context();
    fx.repo.delete_resource_connection(acc, &ctx, &conn).unwrap();
    assert!(fx.repo.resource_connections_by_endpoint(bravo.key()).unwrap().is_empty());
    assert_eq!(fx.repo.resource_connections_by_endpoint(alpha.key()).unwrap().len(), 1);
}

#[test]
fn test_volume_connections_by_endpoint() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let (vlm_a, vlm_b, vlm_c) = fx.commit(|ctx| {
        let rsc_dfn = fx.rsc_dfn(ctx, "web");
        let vlm_dfn = fx.vlm_dfn(ctx, &rsc_dfn, 0);
        let vlms: Vec<Arc<Volume>> = ["alpha", "bravo", "charlie"]
            .iter()
            .map(|name| {
                let node = fx.node(ctx, name);
                let pool = fx.stor_pool(ctx, &node, "thin1");
                let rsc = fx.resource(ctx, &node, &rsc_dfn);
                fx.volume(ctx, &rsc, &vlm_dfn, &pool)
            })
            .collect();
        fx.repo
            .get_volume_connection(acc, ctx, &vlms[1], &vlms[0], ConnectionArgs::default(), true, true)
            .unwrap();
        (vlms[0].clone(), vlms[1].clone(), vlms[2].clone())
    });

    let on_a = fx.repo.volume_connections_by_endpoint(vlm_a.key()).unwrap();
    let on_b = fx.repo.volume_connections_by_endpoint(vlm_b.key()).unwrap();
    assert_eq!(on_a.len(), 1);
    assert!(Arc::ptr_eq(&on_a[0], &on_b[0]));
    assert!(fx.repo.volume_connections_by_endpoint(vlm_c.key()).unwrap().is_empty());

    let fresh = Repository::new(
        Drivers::controller(fx.db.clone()),
        Mode::Controller,
        minor_pool(&CoreConfig::default()).unwrap(),
    );
    let found = fresh.volume_connections_by_endpoint(vlm_a.key()).unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].uuid(), on_a[0].uuid());

    // Deleting the volume takes the connection with it
    fx.commit(|ctx| fx.repo.delete_volume(acc, ctx, &vlm_a).unwrap());
    assert!(fx.repo.volume_connections_by_endpoint(vlm_b.key()).unwrap().is_empty());
    assert_eq!(fx.db.row_count("VOLUME_CONNECTIONS"), 0);
}

// =============================================================================
// Network Interfaces
// =============================================================================

#[test]
fn test_net_interface_lifecycle() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let name = NetInterfaceName::new("mgmt").unwrap();
    let key = NetInterfaceKey::new(node_name("alpha"), name.clone());
    let stlt = SatelliteConnection::new(3366, EncryptionType::Ssl).unwrap();

    let (node, net_if) = fx.commit(|ctx| {
        let node = fx.node(ctx, "alpha");
        let args = NetInterfaceArgs {
            satellite_connection: Some(stlt),
            ..NetInterfaceArgs::new("10.0.0.1".parse().unwrap())
        };
        let net_if = fx
            .repo
            .get_net_interface(acc, ctx, &node, &name, args, true, true)
            .unwrap()
            .unwrap();
        (node, net_if)
    });
    assert_eq!(fx.db.row_count("NODE_NET_INTERFACES"), 1);
    assert!(Arc::ptr_eq(&node.net_interface(acc, &name).unwrap().unwrap(), &net_if));

    fx.commit(|ctx| {
        ctx.attach(&net_if).unwrap();
        net_if.set_address(acc, "10.0.0.2".parse().unwrap()).unwrap();
        assert_eq!(net_if.set_satellite_connection(acc, None).unwrap(), Some(stlt));
    });

    let fresh = Repository::new(
        Drivers::controller(fx.db.clone()),
        Mode::Controller,
        minor_pool(&CoreConfig::default()).unwrap(),
    );
    let reloaded = fresh.net_interface(&key).unwrap().unwrap();
    assert_eq!(reloaded.uuid(), net_if.uuid());
    assert_eq!(reloaded.address(acc).unwrap().to_string(), "10.0.0.2");
    assert_eq!(reloaded.satellite_connection(acc).unwrap(), None);
    assert_eq!(reloaded.node().net_interfaces(acc).unwrap().len(), 1);

    fx.commit(|ctx| fx.repo.delete_node(acc, ctx, &node).unwrap());
    assert!(net_if.is_deleted());
    assert_eq!(fx.db.row_count("NODE_NET_INTERFACES"), 0);
    assert!(fx.repo.net_interfaces().is_empty());
}

#[test]
fn test_net_interface_rollback_restores_address() {
    let fx = Fixture::new();
    let acc = &fx.acc;
    let net_if = fx.commit(|ctx| {
        let node = fx.node(ctx, "alpha");
        fx.repo
            .get_net_interface(
                acc,
                ctx,
                &node,
                &NetInterfaceName::new("data").unwrap(),
                NetInterfaceArgs::new("192.168.1.10".parse().unwrap()),
                true,
                true,
            )
            .unwrap()
            .unwrap()
    });

    let ctx = fx.repo.new_context();
    ctx.attach(&net_if).unwrap();
    net_if.set_address(acc, "192.168.1.11".parse().unwrap()).unwrap();
    ctx.rollback();
    assert_eq!(net_if.address(acc).unwrap().to_string(), "192.168.1.10");
    assert!(!net_if.anchor().is_dirty());
}

#[test]
fn test_satellite_connection_needs_a_port() {
    assert_matches!(
        SatelliteConnection::new(0, EncryptionType::Plain),
        Err(Error::ValueOutOfRange { .. })
    );
}

// =============================================================================
// Startup Load
// =============================================================================

#[test]
fn test_reopen_restores_object_graph() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("controller.json");
    let config = CoreConfig::default();
    let acc = AccessContext::system();

    let minor = {
        let db = ControllerDatabase::open(&path).unwrap();
        let fx = Fixture {
            repo: Repository::controller(db.clone(), &config).unwrap(),
            db: db.clone(),
            acc: acc.clone(),
        };
        let minor = fx.commit(|ctx| {
            let a = fx.node(ctx, "alpha");
            let b = fx.node(ctx, "bravo");
            let pool = fx.stor_pool(ctx, &a, "thin1");
            let rsc_dfn = fx.rsc_dfn(ctx, "web");
            let vlm_dfn = fx.vlm_dfn(ctx, &rsc_dfn, 0);
            let rsc = fx.resource(ctx, &a, &rsc_dfn);
            fx.volume(ctx, &rsc, &vlm_dfn, &pool);
            fx.repo
                .get_node_connection(&acc, ctx, &a, &b, ConnectionArgs::default(), true, true)
                .unwrap();
            a.props_mut(&acc).unwrap().set_prop("Aux/site", "east", None).unwrap();
            vlm_dfn.minor_number(&acc).unwrap()
        });
        db.save().unwrap();
        minor
    };

    let db = ControllerDatabase::open(&path).unwrap();
    let repo = Repository::controller(db, &config).unwrap();
    assert_eq!(repo.nodes().len(), 2);
    assert!(repo.minor_pool().is_allocated(minor.value()));

    let alpha = repo.node(&node_name("alpha")).unwrap().unwrap();
    assert_eq!(alpha.resource_count(), 1);
    assert_eq!(alpha.stor_pools(&acc).unwrap().len(), 1);
    assert_eq!(alpha.node_connections(&acc).unwrap().len(), 1);
    assert_eq!(
        alpha.props(&acc).unwrap().get_prop("Aux/site", None).unwrap().as_deref(),
        Some("east")
    );

    let rsc = repo
        .resource(&ResourceKey::new(node_name("alpha"), ResourceName::new("web").unwrap()))
        .unwrap()
        .unwrap();
    assert_eq!(rsc.volumes(&acc).unwrap().len(), 1);
    assert!(!alpha.anchor().is_dirty());
}

#[test]
fn test_satellite_never_loads() {
    let config = CoreConfig {
        mode: Mode::Satellite,
        ..CoreConfig::default()
    };
    let repo = Repository::satellite(&config).unwrap();
    let acc = AccessContext::system();
    let ctx = repo.new_context();

    assert!(repo
        .get_node(&acc, &ctx, &node_name("alpha"), NodeArgs::default(), false, false)
        .unwrap()
        .is_none());

    repo.get_node(&acc, &ctx, &node_name("alpha"), NodeArgs::default(), true, true)
        .unwrap();
    ctx.commit().unwrap();
    assert_eq!(repo.nodes().len(), 1);
    assert_eq!(repo.load_all().unwrap(), 0);
}
